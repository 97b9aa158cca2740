// This module defines the low-level intermediate representation the register
// allocator works on. LIR instructions share the HIR id space: real
// instructions sit at even positions and the odd half-steps between them hold
// gaps, sentinel slots that collect the (source, destination) operand pairs
// queued by lowering and by the allocator. An instruction has at most two
// inputs, two scratches and one result, each carrying a use-kind constraint
// the allocator must honour. Operands are a tagged variant; two operands name
// the same location when tag and payload match and neither is an immediate.

//! LIR: instructions, operands and gaps.

pub mod lowering;

use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::fmt;

use crate::hir::{BinOpKind, BlockId};
use crate::target::Reg;

/// Index of a virtual register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualId(pub u32);

impl VirtualId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a stack spill slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpillSlot(pub u32);

/// Opaque reference to a runtime stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StubRef(pub u16);

/// Well-known stubs the lowering hands to the assembler.
pub mod stubs {
    use super::StubRef;

    pub const BINOP: StubRef = StubRef(0);
    pub const CALL: StubRef = StubRef(1);
    pub const ALLOCATE_OBJECT: StubRef = StubRef(2);
    pub const ALLOCATE_FUNCTION: StubRef = StubRef(3);
    pub const ALLOCATE_CONTEXT: StubRef = StubRef(4);
    pub const LOAD_PROPERTY: StubRef = StubRef(5);
    pub const STORE_PROPERTY: StubRef = StubRef(6);
}

/// A concrete or not-yet-concrete operand location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    /// Virtual register; replaced by allocation.
    Virtual(VirtualId),
    /// Physical register.
    Register(Reg),
    /// Stack spill slot.
    Spill(SpillSlot),
    /// Immediate payload; never a move destination.
    Immediate(i64),
}

impl Operand {
    pub fn is_virtual(&self) -> bool {
        matches!(self, Operand::Virtual(_))
    }

    pub fn is_register(&self) -> bool {
        matches!(self, Operand::Register(_))
    }

    pub fn is_spill(&self) -> bool {
        matches!(self, Operand::Spill(_))
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self, Operand::Immediate(_))
    }

    /// Two operands are the same location when tag and payload match and
    /// neither is an immediate.
    pub fn is_same_location(&self, other: &Operand) -> bool {
        !self.is_immediate() && !other.is_immediate() && self == other
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Virtual(v) => write!(f, "v{}", v.0),
            Operand::Register(r) => write!(f, "r{}", r.0),
            Operand::Spill(s) => write!(f, "[{}]", s.0),
            Operand::Immediate(imm) => write!(f, "#{}", imm),
        }
    }
}

/// Constraint a use places on its operand's location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UseKind {
    /// Register, spill or immediate all acceptable.
    Any,
    /// Must be in some register at the use position.
    Register,
    /// Must be in this exact register at the use position.
    Fixed(Reg),
}

/// An annotated operand reference on an instruction.
#[derive(Debug, Clone, Copy)]
pub struct LirUse {
    pub operand: Operand,
    pub kind: UseKind,
}

impl LirUse {
    pub fn new(operand: Operand, kind: UseKind) -> Self {
        Self { operand, kind }
    }
}

/// The closed LIR opcode catalog.
///
/// Phis do not survive lowering; their semantics live entirely in gap moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LirOp {
    Nop,
    /// Register-allocator-inserted copy.
    Move,
    Entry,
    Return,
    LoadArg { index: u16 },
    LoadRoot { index: u16 },
    LoadLocal { slot: u16 },
    StoreLocal { slot: u16 },
    LoadContext { depth: u16, slot: u16 },
    StoreContext { depth: u16, slot: u16 },
    LoadProperty,
    StoreProperty,
    Goto { target: BlockId },
    Branch { on_true: BlockId, on_false: BlockId },
    BinOp(BinOpKind),
    Call { argc: u16 },
    AllocateObject { size: u16 },
    AllocateFunction { body: u32 },
    AllocateContext { slots: u16 },
}

impl LirOp {
    /// The runtime stub this instruction calls through, if any.
    pub fn stub(&self) -> Option<StubRef> {
        match self {
            LirOp::BinOp(_) => Some(stubs::BINOP),
            LirOp::Call { .. } => Some(stubs::CALL),
            LirOp::AllocateObject { .. } => Some(stubs::ALLOCATE_OBJECT),
            LirOp::AllocateFunction { .. } => Some(stubs::ALLOCATE_FUNCTION),
            LirOp::AllocateContext { .. } => Some(stubs::ALLOCATE_CONTEXT),
            LirOp::LoadProperty => Some(stubs::LOAD_PROPERTY),
            LirOp::StoreProperty => Some(stubs::STORE_PROPERTY),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            LirOp::Nop => "nop",
            LirOp::Move => "move",
            LirOp::Entry => "entry",
            LirOp::Return => "return",
            LirOp::LoadArg { .. } => "load_arg",
            LirOp::LoadRoot { .. } => "load_root",
            LirOp::LoadLocal { .. } => "load_local",
            LirOp::StoreLocal { .. } => "store_local",
            LirOp::LoadContext { .. } => "load_context",
            LirOp::StoreContext { .. } => "store_context",
            LirOp::LoadProperty => "load_property",
            LirOp::StoreProperty => "store_property",
            LirOp::Goto { .. } => "goto",
            LirOp::Branch { .. } => "branch",
            LirOp::BinOp(_) => "bin_op",
            LirOp::Call { .. } => "call",
            LirOp::AllocateObject { .. } => "allocate_object",
            LirOp::AllocateFunction { .. } => "allocate_function",
            LirOp::AllocateContext { .. } => "allocate_context",
        }
    }
}

/// One LIR instruction.
#[derive(Debug, Clone)]
pub struct LirInstruction {
    /// Linear position; even.
    pub id: i32,
    pub op: LirOp,
    pub inputs: SmallVec<[LirUse; 2]>,
    pub scratches: SmallVec<[LirUse; 2]>,
    pub result: Option<LirUse>,
    /// Calls clobber every caller-saved register at this position.
    pub has_call: bool,
    pub block: BlockId,
}

impl LirInstruction {
    pub fn new(id: i32, op: LirOp, block: BlockId) -> Self {
        debug_assert!(id % 4 == 0, "real instructions sit at whole positions");
        Self {
            id,
            op,
            inputs: SmallVec::new(),
            scratches: SmallVec::new(),
            result: None,
            has_call: false,
            block,
        }
    }

    pub fn add_arg(&mut self, operand: Operand, kind: UseKind) -> &mut Self {
        assert!(self.inputs.len() < 2, "at most two inputs");
        self.inputs.push(LirUse::new(operand, kind));
        self
    }

    pub fn add_scratch(&mut self, operand: Operand) -> &mut Self {
        assert!(self.scratches.len() < 2, "at most two scratches");
        self.scratches.push(LirUse::new(operand, UseKind::Register));
        self
    }

    pub fn set_result(&mut self, operand: Operand, kind: UseKind) -> &mut Self {
        assert!(self.result.is_none(), "result already set");
        self.result = Some(LirUse::new(operand, kind));
        self
    }

    pub fn mark_has_call(&mut self) -> &mut Self {
        self.has_call = true;
        self
    }

    /// Gap position immediately before this instruction.
    pub fn gap_before(&self) -> i32 {
        self.id - 1
    }

    /// Gap position immediately after this instruction.
    pub fn gap_after(&self) -> i32 {
        self.id + 1
    }
}

/// A single resolved move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveOp {
    pub src: Operand,
    pub dst: Operand,
}

impl fmt::Display for MoveOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- {}", self.dst, self.src)
    }
}

/// Sentinel between instructions holding pending and resolved moves.
#[derive(Debug, Clone, Default)]
pub struct Gap {
    /// Unordered (source, destination) pairs queued by lowering and by edge
    /// resolution.
    pub pending: Vec<(Operand, Operand)>,
    /// The serialised move sequence; filled by the parallel-move resolver.
    pub moves: Vec<MoveOp>,
}

/// A basic block of the LIR stream.
#[derive(Debug, Clone)]
pub struct LirBlock {
    pub id: BlockId,
    /// Indices into [`LirFunction::instrs`].
    pub instrs: Vec<usize>,
    pub preds: SmallVec<[BlockId; 2]>,
    pub succs: SmallVec<[BlockId; 2]>,
    pub start: i32,
    pub end: i32,
}

impl LirBlock {
    /// Position of the trailing gap, right before the terminator.
    pub fn last_gap_pos(&self) -> i32 {
        self.end - 5
    }

    /// Position of the entry gap, right before the first instruction.
    pub fn entry_gap_pos(&self) -> i32 {
        self.start - 1
    }
}

/// The LIR stream of one function, blocks in linear order.
#[derive(Debug)]
pub struct LirFunction {
    pub instrs: Vec<LirInstruction>,
    pub blocks: Vec<LirBlock>,
    /// Gaps keyed by their odd position. Only positions something was queued
    /// at are materialised.
    pub gaps: BTreeMap<i32, Gap>,
    pub virtual_count: u32,
    /// Spill slots the frame needs; filled by allocation.
    pub frame_slots: u32,
    /// Calling-convention register reservations `(reg, start, end)` recorded
    /// by lowering; turned into fixed intervals before the walk.
    pub fixed_reservations: Vec<(Reg, i32, i32)>,
    /// Map from block id to index in `blocks`.
    block_index: Vec<usize>,
}

impl LirFunction {
    pub fn new(block_count: usize) -> Self {
        Self {
            instrs: Vec::new(),
            blocks: Vec::new(),
            gaps: BTreeMap::new(),
            virtual_count: 0,
            frame_slots: 0,
            fixed_reservations: Vec::new(),
            block_index: vec![usize::MAX; block_count],
        }
    }

    pub fn block(&self, id: BlockId) -> &LirBlock {
        &self.blocks[self.block_index[id.index()]]
    }

    /// Index of `id` in the linear `blocks` order.
    pub fn block_linear_index(&self, id: BlockId) -> usize {
        self.block_index[id.index()]
    }

    pub fn push_block(&mut self, block: LirBlock) {
        self.block_index[block.id.index()] = self.blocks.len();
        self.blocks.push(block);
    }

    /// The gap at `pos`, created on first touch.
    pub fn gap_mut(&mut self, pos: i32) -> &mut Gap {
        debug_assert!(pos % 2 != 0, "gaps sit at odd positions");
        self.gaps.entry(pos).or_default()
    }

    pub fn gap(&self, pos: i32) -> Option<&Gap> {
        self.gaps.get(&pos)
    }

    /// Queue a pending move on the gap at `pos`.
    pub fn queue_move(&mut self, pos: i32, src: Operand, dst: Operand) {
        debug_assert!(!dst.is_immediate(), "immediates cannot be destinations");
        self.gap_mut(pos).pending.push((src, dst));
    }
}

impl fmt::Display for LirFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in &self.blocks {
            writeln!(f, "b{}:", block.id.0)?;
            for &idx in &block.instrs {
                let instr = &self.instrs[idx];
                if let Some(gap) = self.gaps.get(&instr.gap_before()) {
                    for mv in &gap.moves {
                        writeln!(f, "  {:>4}: gap {}", instr.gap_before(), mv)?;
                    }
                }
                write!(f, "  {:>4}: ", instr.id)?;
                if let Some(result) = &instr.result {
                    write!(f, "{} = ", result.operand)?;
                }
                write!(f, "{}", instr.op.name())?;
                for input in &instr.inputs {
                    write!(f, " {}", input.operand)?;
                }
                writeln!(f)?;
                if let Some(gap) = self.gaps.get(&instr.gap_after()) {
                    for mv in &gap.moves {
                        writeln!(f, "  {:>4}: gap {}", instr.gap_after(), mv)?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operand_location_equality() {
        let a = Operand::Register(Reg(1));
        let b = Operand::Register(Reg(1));
        let c = Operand::Register(Reg(2));
        assert!(a.is_same_location(&b));
        assert!(!a.is_same_location(&c));

        let s = Operand::Spill(SpillSlot(0));
        assert!(!a.is_same_location(&s));

        // Immediates never alias, not even themselves.
        let imm = Operand::Immediate(7);
        assert!(!imm.is_same_location(&imm));
    }

    #[test]
    fn instruction_operand_limits() {
        let mut instr = LirInstruction::new(4, LirOp::BinOp(BinOpKind::Add), BlockId(0));
        instr
            .add_arg(Operand::Virtual(VirtualId(0)), UseKind::Register)
            .add_arg(Operand::Virtual(VirtualId(1)), UseKind::Any);
        assert_eq!(instr.inputs.len(), 2);
        assert_eq!(instr.gap_before(), 3);
        assert_eq!(instr.gap_after(), 5);
    }

    #[test]
    fn gap_creation_on_demand() {
        let mut f = LirFunction::new(1);
        assert!(f.gap(3).is_none());
        f.queue_move(
            3,
            Operand::Virtual(VirtualId(0)),
            Operand::Virtual(VirtualId(1)),
        );
        assert_eq!(f.gap(3).unwrap().pending.len(), 1);
    }
}
