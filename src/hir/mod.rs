// This module defines the high-level intermediate representation: an SSA
// control-flow graph of basic blocks produced from the AST by the front end.
// Blocks, instructions and values live in index-addressed tables on HirGraph;
// cross references (definition sites, use lists, predecessor/successor edges,
// phi inputs) are stored as ids rather than pointers, so the whole graph can
// be dropped collectively with the compilation zone. The instruction set is a
// closed enum; lowering matches on it exhaustively. Linearisation assigns
// monotonically increasing ids in reverse post order, stepped so that every
// instruction owns the two half-step gap slots next to it.

//! HIR: SSA control-flow graph.

use smallvec::SmallVec;
use std::fmt;

use crate::error::{CompileError, CompileResult};

/// Index of a basic block in [`HirGraph::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// Index of an SSA value in [`HirGraph::values`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

/// Index of an instruction in [`HirGraph::instrs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl InstrId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Slot a value is bound to in the script's scope chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeSlot {
    /// Slot in the current activation.
    Local { index: u16 },
    /// Slot captured from an enclosing context.
    Context { depth: u16, index: u16 },
}

/// Binary operations the language supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// The closed HIR instruction set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HirOp {
    /// Function prologue marker; first instruction of the entry block.
    Entry,
    /// Return the single operand to the caller.
    Return,
    /// Unconditional jump.
    Goto { target: BlockId },
    /// Two-way branch on a boolean operand.
    BranchBool {
        on_true: BlockId,
        on_false: BlockId,
    },
    /// Load a root-table constant (nil, true, literals).
    LoadRoot { index: u16 },
    /// Load an incoming call argument.
    LoadArg { index: u16 },
    /// Load a local slot.
    LoadLocal { slot: u16 },
    /// Store the operand into a local slot.
    StoreLocal { slot: u16 },
    /// Load a captured context slot.
    LoadContext { depth: u16, slot: u16 },
    /// Store the operand into a captured context slot.
    StoreContext { depth: u16, slot: u16 },
    /// Load `object[key]`; operands: object, key.
    LoadProperty,
    /// Store `object[key] = value`; operands: object, key, value.
    StoreProperty,
    /// Allocate an object with a size hint.
    AllocateObject { size: u16 },
    /// Allocate a function closure over the current context.
    AllocateFunction { body: u32 },
    /// Allocate a new scope context with the given slot count.
    AllocateContext { slots: u16 },
    /// Binary operation through the runtime stub; operands: lhs, rhs.
    BinOp(BinOpKind),
    /// Call a function value; operands: callee, argument pack.
    Call { argc: u16 },
    /// Join-point value selection; one input per predecessor.
    Phi,
    /// No operation.
    Nop,
}

impl HirOp {
    /// True for instructions that end a block.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            HirOp::Return | HirOp::Goto { .. } | HirOp::BranchBool { .. }
        )
    }

    /// True for instructions that produce an SSA value.
    pub fn has_result(&self) -> bool {
        matches!(
            self,
            HirOp::LoadRoot { .. }
                | HirOp::LoadArg { .. }
                | HirOp::LoadLocal { .. }
                | HirOp::LoadContext { .. }
                | HirOp::LoadProperty
                | HirOp::AllocateObject { .. }
                | HirOp::AllocateFunction { .. }
                | HirOp::AllocateContext { .. }
                | HirOp::BinOp(_)
                | HirOp::Call { .. }
                | HirOp::Phi
        )
    }

    /// Successor blocks named by a terminator.
    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        match self {
            HirOp::Goto { target } => SmallVec::from_slice(&[*target]),
            HirOp::BranchBool { on_true, on_false } => SmallVec::from_slice(&[*on_true, *on_false]),
            _ => SmallVec::new(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            HirOp::Entry => "entry",
            HirOp::Return => "return",
            HirOp::Goto { .. } => "goto",
            HirOp::BranchBool { .. } => "branch_bool",
            HirOp::LoadRoot { .. } => "load_root",
            HirOp::LoadArg { .. } => "load_arg",
            HirOp::LoadLocal { .. } => "load_local",
            HirOp::StoreLocal { .. } => "store_local",
            HirOp::LoadContext { .. } => "load_context",
            HirOp::StoreContext { .. } => "store_context",
            HirOp::LoadProperty => "load_property",
            HirOp::StoreProperty => "store_property",
            HirOp::AllocateObject { .. } => "allocate_object",
            HirOp::AllocateFunction { .. } => "allocate_function",
            HirOp::AllocateContext { .. } => "allocate_context",
            HirOp::BinOp(_) => "bin_op",
            HirOp::Call { .. } => "call",
            HirOp::Phi => "phi",
            HirOp::Nop => "nop",
        }
    }
}

/// One HIR instruction.
#[derive(Debug, Clone)]
pub struct HirInstruction {
    pub op: HirOp,
    /// Values this instruction reads. Phi inputs are kept in predecessor
    /// order.
    pub operands: SmallVec<[ValueId; 2]>,
    /// The SSA value this instruction defines, if any.
    pub result: Option<ValueId>,
    /// Owning block.
    pub block: BlockId,
    /// Linear position; -1 before linearisation, even afterwards.
    pub pos: i32,
}

/// One SSA value.
#[derive(Debug, Clone)]
pub struct HirValue {
    /// Defining instruction; exactly one per value.
    pub def: Option<InstrId>,
    /// Instructions that read this value.
    pub uses: Vec<InstrId>,
    /// Scope slot this value is bound to, if any.
    pub slot: Option<ScopeSlot>,
}

/// One basic block.
#[derive(Debug, Clone)]
pub struct HirBlock {
    /// Phi instructions at the block head, in creation order.
    pub phis: Vec<InstrId>,
    /// Ordinary instructions; the last one is the terminator.
    pub instrs: Vec<InstrId>,
    pub preds: SmallVec<[BlockId; 2]>,
    pub succs: SmallVec<[BlockId; 2]>,
    /// First linear position of the block (phis share it with the first
    /// instruction's predecessors-side gap); set by linearisation.
    pub start: i32,
    /// One past the terminator's position.
    pub end: i32,
}

impl HirBlock {
    fn new() -> Self {
        Self {
            phis: Vec::new(),
            instrs: Vec::new(),
            preds: SmallVec::new(),
            succs: SmallVec::new(),
            start: -1,
            end: -1,
        }
    }

    /// The block's terminator, if it has one yet.
    pub fn terminator(&self) -> Option<InstrId> {
        self.instrs.last().copied()
    }
}

/// The SSA control-flow graph of one function.
pub struct HirGraph {
    blocks: Vec<HirBlock>,
    instrs: Vec<HirInstruction>,
    values: Vec<HirValue>,
    entry: BlockId,
    /// Reverse post order; filled by `linearise`.
    linear_order: Vec<BlockId>,
}

impl HirGraph {
    /// Create a graph with an empty entry block.
    pub fn new() -> Self {
        let mut graph = Self {
            blocks: Vec::new(),
            instrs: Vec::new(),
            values: Vec::new(),
            entry: BlockId(0),
            linear_order: Vec::new(),
        };
        let entry = graph.add_block();
        graph.entry = entry;
        graph
    }

    pub fn entry(&self) -> BlockId {
        self.entry
    }

    pub fn block(&self, id: BlockId) -> &HirBlock {
        &self.blocks[id.index()]
    }

    pub fn instr(&self, id: InstrId) -> &HirInstruction {
        &self.instrs[id.index()]
    }

    pub fn value(&self, id: ValueId) -> &HirValue {
        &self.values[id.index()]
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    /// Blocks in reverse post order; empty before linearisation.
    pub fn linear_order(&self) -> &[BlockId] {
        &self.linear_order
    }

    /// Append a fresh, empty block.
    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(HirBlock::new());
        id
    }

    fn add_value(&mut self) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(HirValue {
            def: None,
            uses: Vec::new(),
            slot: None,
        });
        id
    }

    /// Bind a value to a scope slot.
    pub fn bind_slot(&mut self, value: ValueId, slot: ScopeSlot) {
        self.values[value.index()].slot = Some(slot);
    }

    /// Append an instruction to `block`. Returns the instruction id and its
    /// result value when the opcode defines one.
    ///
    /// Terminators update successor and predecessor lists; appending past a
    /// terminator is a caller bug and panics.
    pub fn append(
        &mut self,
        block: BlockId,
        op: HirOp,
        operands: &[ValueId],
    ) -> (InstrId, Option<ValueId>) {
        assert!(
            self.block(block)
                .terminator()
                .map_or(true, |t| !self.instr(t).op.is_terminator()),
            "appending to a terminated block"
        );
        assert!(!matches!(op, HirOp::Phi), "phis go through add_phi");

        let id = InstrId(self.instrs.len() as u32);
        let result = if op.has_result() {
            let v = self.add_value();
            self.values[v.index()].def = Some(id);
            Some(v)
        } else {
            None
        };

        for &operand in operands {
            self.values[operand.index()].uses.push(id);
        }

        self.instrs.push(HirInstruction {
            op,
            operands: SmallVec::from_slice(operands),
            result,
            block,
            pos: -1,
        });
        self.blocks[block.index()].instrs.push(id);

        if op.is_terminator() {
            for succ in op.successors() {
                self.blocks[block.index()].succs.push(succ);
                self.blocks[succ.index()].preds.push(block);
            }
        }

        (id, result)
    }

    /// Add a phi to the head of `block`. Inputs are attached afterwards with
    /// [`HirGraph::phi_add_input`], one per predecessor in predecessor order.
    pub fn add_phi(&mut self, block: BlockId) -> (InstrId, ValueId) {
        let id = InstrId(self.instrs.len() as u32);
        let v = self.add_value();
        self.values[v.index()].def = Some(id);
        self.instrs.push(HirInstruction {
            op: HirOp::Phi,
            operands: SmallVec::new(),
            result: Some(v),
            block,
            pos: -1,
        });
        self.blocks[block.index()].phis.push(id);
        (id, v)
    }

    /// Append the next phi input; the input's position in the list must match
    /// the corresponding predecessor's position.
    pub fn phi_add_input(&mut self, phi: InstrId, input: ValueId) {
        debug_assert!(matches!(self.instrs[phi.index()].op, HirOp::Phi));
        self.values[input.index()].uses.push(phi);
        self.instrs[phi.index()].operands.push(input);
    }

    /// Split every critical edge by interposing an empty forwarding block.
    ///
    /// Phi input order is preserved: the forwarding block replaces the
    /// original predecessor in place.
    pub fn split_critical_edges(&mut self) {
        let block_count = self.blocks.len();
        for pred in 0..block_count {
            let pred_id = BlockId(pred as u32);
            if self.blocks[pred].succs.len() < 2 {
                continue;
            }
            for slot in 0..self.blocks[pred].succs.len() {
                let succ_id = self.blocks[pred].succs[slot];
                if self.blocks[succ_id.index()].preds.len() < 2 {
                    continue;
                }

                let mid = self.add_block();
                self.blocks[mid.index()].preds.push(pred_id);
                self.blocks[mid.index()].succs.push(succ_id);

                // A nop keeps the forwarding block's entry gap and trailing
                // gap at distinct positions: moves arriving over the split
                // edge and moves leaving towards the join stay in separate
                // parallel sets.
                for op in [HirOp::Nop, HirOp::Goto { target: succ_id }] {
                    let instr = InstrId(self.instrs.len() as u32);
                    self.instrs.push(HirInstruction {
                        op,
                        operands: SmallVec::new(),
                        result: None,
                        block: mid,
                        pos: -1,
                    });
                    self.blocks[mid.index()].instrs.push(instr);
                }

                self.blocks[pred].succs[slot] = mid;
                let term = self.blocks[pred].instrs.last().copied().expect("terminator");
                self.retarget(term, succ_id, mid);

                let pred_slot = self.blocks[succ_id.index()]
                    .preds
                    .iter()
                    .position(|&p| p == pred_id)
                    .expect("mutual edge");
                self.blocks[succ_id.index()].preds[pred_slot] = mid;
            }
        }
    }

    fn retarget(&mut self, term: InstrId, from: BlockId, to: BlockId) {
        match &mut self.instrs[term.index()].op {
            HirOp::Goto { target } => {
                if *target == from {
                    *target = to;
                }
            }
            HirOp::BranchBool { on_true, on_false } => {
                if *on_true == from {
                    *on_true = to;
                }
                if *on_false == from {
                    *on_false = to;
                }
            }
            _ => unreachable!("retarget on non-terminator"),
        }
    }

    /// Compute reverse post order and assign linear positions: instruction
    /// ids in steps of four, phis first in each block. The id±1 slots hold
    /// each instruction's before and after gaps.
    pub fn linearise(&mut self) {
        self.linear_order = self.reverse_post_order();

        let mut pos = 0i32;
        for &block_id in &self.linear_order.clone() {
            let block_start = pos;
            let phis = self.blocks[block_id.index()].phis.clone();
            for phi in phis {
                self.instrs[phi.index()].pos = pos;
                pos += 4;
            }
            let instrs = self.blocks[block_id.index()].instrs.clone();
            for instr in instrs {
                self.instrs[instr.index()].pos = pos;
                pos += 4;
            }
            let block = &mut self.blocks[block_id.index()];
            block.start = block_start;
            block.end = pos;
        }
    }

    fn reverse_post_order(&self) -> Vec<BlockId> {
        let mut visited = vec![false; self.blocks.len()];
        let mut postorder = Vec::with_capacity(self.blocks.len());
        // Iterative DFS; the second stack entry tracks the next successor to
        // visit.
        let mut stack: Vec<(BlockId, usize)> = vec![(self.entry, 0)];
        visited[self.entry.index()] = true;
        while let Some(top) = stack.len().checked_sub(1) {
            let (block, next) = stack[top];
            let succs = &self.blocks[block.index()].succs;
            if next < succs.len() {
                let succ = succs[next];
                stack[top].1 += 1;
                if !visited[succ.index()] {
                    visited[succ.index()] = true;
                    stack.push((succ, 0));
                }
            } else {
                postorder.push(block);
                stack.pop();
            }
        }
        postorder.reverse();
        postorder
    }

    /// Check the structural invariants lowering relies on.
    pub fn verify(&self) -> CompileResult<()> {
        for (idx, block) in self.blocks.iter().enumerate() {
            let id = BlockId(idx as u32);
            let term = block.terminator().ok_or_else(|| CompileError::MalformedGraph {
                reason: format!("block b{} has no terminator", idx),
            })?;
            if !self.instr(term).op.is_terminator() {
                return Err(CompileError::MalformedGraph {
                    reason: format!("block b{} does not end in a terminator", idx),
                });
            }
            for &i in block.instrs.iter().take(block.instrs.len() - 1) {
                if self.instr(i).op.is_terminator() {
                    return Err(CompileError::MalformedGraph {
                        reason: format!("block b{} has a terminator mid-block", idx),
                    });
                }
            }
            for &succ in &block.succs {
                if !self.blocks[succ.index()].preds.contains(&id) {
                    return Err(CompileError::MalformedGraph {
                        reason: format!("edge b{} -> b{} is not mutual", idx, succ.0),
                    });
                }
            }
            for &pred in &block.preds {
                if !self.blocks[pred.index()].succs.contains(&id) {
                    return Err(CompileError::MalformedGraph {
                        reason: format!("edge b{} <- b{} is not mutual", idx, pred.0),
                    });
                }
            }
            if !block.phis.is_empty() && block.preds.len() < 2 {
                return Err(CompileError::MalformedGraph {
                    reason: format!("phi outside a join point in b{}", idx),
                });
            }
            for &phi in &block.phis {
                if self.instr(phi).operands.len() != block.preds.len() {
                    return Err(CompileError::MalformedGraph {
                        reason: format!(
                            "phi in b{} has {} inputs for {} predecessors",
                            idx,
                            self.instr(phi).operands.len(),
                            block.preds.len()
                        ),
                    });
                }
            }
        }
        for (idx, value) in self.values.iter().enumerate() {
            if value.def.is_none() {
                return Err(CompileError::MalformedGraph {
                    reason: format!("value v{} has no definition", idx),
                });
            }
        }
        Ok(())
    }
}

impl Default for HirGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HirGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, block) in self.blocks.iter().enumerate() {
            writeln!(f, "b{}:", idx)?;
            for &instr in block.phis.iter().chain(block.instrs.iter()) {
                let i = self.instr(instr);
                write!(f, "  ")?;
                if let Some(result) = i.result {
                    write!(f, "v{} = ", result.0)?;
                }
                write!(f, "{}", i.op.name())?;
                for operand in &i.operands {
                    write!(f, " v{}", operand.0)?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
