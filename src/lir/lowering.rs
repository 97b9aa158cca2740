// This module turns linearised HIR into LIR. Each HIR instruction lowers to
// one LIR instruction sharing its id; the operand-binding primitives mirror
// what the runtime's stub conventions demand. to_fixed queues a move into the
// gap before the instruction and reserves the register across it;
// result_from_fixed reserves the result register over the instruction and
// moves the value into a fresh virtual in the gap after it. Instructions
// tagged as calling reserve every caller-saved register over the call
// position, minus the ones the instruction itself already pinned. Phi inputs
// are realised as moves in the predecessor's trailing gap; the predecessor is
// always a single-successor block because critical edges were split before
// linearisation.

//! HIR to LIR lowering.

use log::trace;

use crate::error::{CompileError, CompileResult};
use crate::hir::{BlockId, HirGraph, HirInstruction, HirOp, InstrId, ValueId};
use crate::lir::{
    LirBlock, LirFunction, LirInstruction, LirOp, LirUse, Operand, UseKind, VirtualId,
};
use crate::target::{Reg, Target};

pub struct LirBuilder<'a> {
    target: &'a Target,
    hir: &'a HirGraph,
    lir: LirFunction,
    /// Virtual register backing each HIR value.
    value_map: Vec<Option<VirtualId>>,
    /// Registers pinned by the instruction currently being lowered.
    current_fixed: Vec<Reg>,
    current_id: i32,
}

/// Lower a linearised, verified HIR graph.
pub fn lower(target: &Target, hir: &HirGraph) -> CompileResult<LirFunction> {
    let mut builder = LirBuilder {
        target,
        hir,
        lir: LirFunction::new(hir.block_count()),
        value_map: vec![None; hir.value_count()],
        current_fixed: Vec::new(),
        current_id: 0,
    };
    builder.run()?;
    Ok(builder.lir)
}

impl<'a> LirBuilder<'a> {
    fn run(&mut self) -> CompileResult<()> {
        let hir = self.hir;
        for &block_id in hir.linear_order() {
            let hb = hir.block(block_id);
            self.lir.push_block(LirBlock {
                id: block_id,
                instrs: Vec::new(),
                preds: hb.preds.clone(),
                succs: hb.succs.clone(),
                start: hb.start,
                end: hb.end,
            });
            for &instr in &hb.instrs {
                self.lower_instr(block_id, instr)?;
            }
        }
        trace!(
            "lowered {} blocks into {} instructions, {} virtuals",
            self.lir.blocks.len(),
            self.lir.instrs.len(),
            self.lir.virtual_count
        );
        Ok(())
    }

    /// Fresh virtual register.
    fn create_virtual(&mut self) -> VirtualId {
        let v = VirtualId(self.lir.virtual_count);
        self.lir.virtual_count += 1;
        v
    }

    /// The virtual backing an HIR value, created on first touch.
    fn virt(&mut self, value: ValueId) -> VirtualId {
        if let Some(v) = self.value_map[value.index()] {
            return v;
        }
        let v = self.create_virtual();
        self.value_map[value.index()] = Some(v);
        v
    }

    /// Materialise `value` in `reg` before the current instruction and
    /// reserve the register across it.
    fn to_fixed(&mut self, value: ValueId, reg: Reg) -> CompileResult<LirUse> {
        if self.current_fixed.contains(&reg) {
            return Err(CompileError::FixedConflict {
                reg,
                pos: self.current_id,
            });
        }
        self.current_fixed.push(reg);
        let v = self.virt(value);
        self.lir.queue_move(
            self.current_id - 1,
            Operand::Virtual(v),
            Operand::Register(reg),
        );
        self.lir
            .fixed_reservations
            .push((reg, self.current_id - 1, self.current_id + 1));
        Ok(LirUse::new(Operand::Register(reg), UseKind::Fixed(reg)))
    }

    /// The instruction produces its result in `reg`; copy it into a fresh
    /// virtual right after. Reusing an argument register is fine, the
    /// reservation is already in place then.
    fn result_from_fixed(&mut self, instr: &mut LirInstruction, reg: Reg) -> VirtualId {
        if !self.current_fixed.contains(&reg) {
            self.current_fixed.push(reg);
            self.lir
                .fixed_reservations
                .push((reg, self.current_id, self.current_id + 1));
        }
        let v = self.create_virtual();
        self.lir.queue_move(
            self.current_id + 1,
            Operand::Register(reg),
            Operand::Virtual(v),
        );
        instr.set_result(Operand::Register(reg), UseKind::Fixed(reg));
        v
    }

    /// Reserve every caller-saved register over the call position, except
    /// those the instruction pinned itself.
    fn mark_has_call(&mut self, instr: &mut LirInstruction) {
        instr.mark_has_call();
        for reg in self.target.caller_saved.iter() {
            if !self.current_fixed.contains(&reg) {
                self.lir
                    .fixed_reservations
                    .push((reg, self.current_id, self.current_id + 1));
            }
        }
    }

    fn bind_result(&mut self, hir_instr: InstrId, v: VirtualId) {
        let result = self
            .hir
            .instr(hir_instr)
            .result
            .expect("result binding on resultless instruction");
        self.value_map[result.index()] = Some(v);
    }

    fn lower_instr(&mut self, block: BlockId, id: InstrId) -> CompileResult<()> {
        let hi: &HirInstruction = self.hir.instr(id);
        self.current_id = hi.pos;
        self.current_fixed.clear();
        let pins = self.target.pinned;

        let li = match hi.op {
            HirOp::Entry => LirInstruction::new(hi.pos, LirOp::Entry, block),
            HirOp::Nop => LirInstruction::new(hi.pos, LirOp::Nop, block),

            HirOp::Return => {
                let mut li = LirInstruction::new(hi.pos, LirOp::Return, block);
                let arg = self.to_fixed(hi.operands[0], pins.ret0)?;
                li.add_arg(arg.operand, arg.kind);
                li
            }

            HirOp::Goto { target } => {
                self.queue_phi_moves(block, target)?;
                LirInstruction::new(hi.pos, LirOp::Goto { target }, block)
            }

            HirOp::BranchBool { on_true, on_false } => {
                // The condition is tested directly; no truthiness stub, so
                // nothing is clobbered at the branch.
                let mut li =
                    LirInstruction::new(hi.pos, LirOp::Branch { on_true, on_false }, block);
                let cond = self.virt(hi.operands[0]);
                li.add_arg(Operand::Virtual(cond), UseKind::Register);
                li
            }

            HirOp::LoadRoot { index } => {
                let mut li = LirInstruction::new(hi.pos, LirOp::LoadRoot { index }, block);
                let v = self.create_virtual();
                li.set_result(Operand::Virtual(v), UseKind::Register);
                self.bind_result(id, v);
                li
            }

            HirOp::LoadArg { index } => {
                let mut li = LirInstruction::new(hi.pos, LirOp::LoadArg { index }, block);
                let v = self.create_virtual();
                li.set_result(Operand::Virtual(v), UseKind::Any);
                self.bind_result(id, v);
                li
            }

            HirOp::LoadLocal { slot } => {
                let mut li = LirInstruction::new(hi.pos, LirOp::LoadLocal { slot }, block);
                let v = self.create_virtual();
                li.set_result(Operand::Virtual(v), UseKind::Any);
                self.bind_result(id, v);
                li
            }

            HirOp::StoreLocal { slot } => {
                let mut li = LirInstruction::new(hi.pos, LirOp::StoreLocal { slot }, block);
                let v = self.virt(hi.operands[0]);
                li.add_arg(Operand::Virtual(v), UseKind::Any);
                li
            }

            HirOp::LoadContext { depth, slot } => {
                let mut li = LirInstruction::new(hi.pos, LirOp::LoadContext { depth, slot }, block);
                let v = self.create_virtual();
                li.set_result(Operand::Virtual(v), UseKind::Register);
                self.bind_result(id, v);
                li
            }

            HirOp::StoreContext { depth, slot } => {
                let mut li =
                    LirInstruction::new(hi.pos, LirOp::StoreContext { depth, slot }, block);
                let v = self.virt(hi.operands[0]);
                li.add_arg(Operand::Virtual(v), UseKind::Register);
                // Walking the context chain needs a register to hold the
                // current scope object.
                let scratch = self.create_virtual();
                li.add_scratch(Operand::Virtual(scratch));
                li
            }

            HirOp::LoadProperty => {
                let mut li = LirInstruction::new(hi.pos, LirOp::LoadProperty, block);
                let obj = self.to_fixed(hi.operands[0], pins.arg0)?;
                let key = self.to_fixed(hi.operands[1], pins.arg1)?;
                li.add_arg(obj.operand, obj.kind);
                li.add_arg(key.operand, key.kind);
                let v = self.result_from_fixed(&mut li, pins.ret0);
                self.mark_has_call(&mut li);
                self.bind_result(id, v);
                li
            }

            HirOp::StoreProperty => {
                let mut li = LirInstruction::new(hi.pos, LirOp::StoreProperty, block);
                let obj = self.to_fixed(hi.operands[0], pins.arg0)?;
                let key = self.to_fixed(hi.operands[1], pins.arg1)?;
                li.add_arg(obj.operand, obj.kind);
                li.add_arg(key.operand, key.kind);
                // The stored value rides the result slot, pinned like a
                // third argument.
                let value = self.to_fixed(hi.operands[2], pins.arg2)?;
                li.set_result(value.operand, value.kind);
                self.mark_has_call(&mut li);
                li
            }

            HirOp::AllocateObject { size } => {
                let mut li = LirInstruction::new(hi.pos, LirOp::AllocateObject { size }, block);
                let v = self.result_from_fixed(&mut li, pins.ret0);
                self.mark_has_call(&mut li);
                self.bind_result(id, v);
                li
            }

            HirOp::AllocateFunction { body } => {
                let mut li = LirInstruction::new(hi.pos, LirOp::AllocateFunction { body }, block);
                let v = self.result_from_fixed(&mut li, pins.ret0);
                self.mark_has_call(&mut li);
                self.bind_result(id, v);
                li
            }

            HirOp::AllocateContext { slots } => {
                let mut li = LirInstruction::new(hi.pos, LirOp::AllocateContext { slots }, block);
                let v = self.result_from_fixed(&mut li, pins.ret0);
                self.mark_has_call(&mut li);
                self.bind_result(id, v);
                li
            }

            HirOp::BinOp(kind) => {
                let mut li = LirInstruction::new(hi.pos, LirOp::BinOp(kind), block);
                let lhs = self.to_fixed(hi.operands[0], pins.arg0)?;
                let rhs = self.to_fixed(hi.operands[1], pins.arg1)?;
                li.add_arg(lhs.operand, lhs.kind);
                li.add_arg(rhs.operand, rhs.kind);
                let v = self.result_from_fixed(&mut li, pins.ret0);
                self.mark_has_call(&mut li);
                self.bind_result(id, v);
                li
            }

            HirOp::Call { argc } => {
                let mut li = LirInstruction::new(hi.pos, LirOp::Call { argc }, block);
                let callee = self.to_fixed(hi.operands[0], pins.arg0)?;
                li.add_arg(callee.operand, callee.kind);
                if hi.operands.len() > 1 {
                    let args = self.to_fixed(hi.operands[1], pins.arg1)?;
                    li.add_arg(args.operand, args.kind);
                }
                let v = self.result_from_fixed(&mut li, pins.ret0);
                self.mark_has_call(&mut li);
                self.bind_result(id, v);
                li
            }

            HirOp::Phi => unreachable!("phi nodes are realised as gap moves"),
        };

        let idx = self.lir.instrs.len();
        self.lir.instrs.push(li);
        self.lir
            .blocks
            .last_mut()
            .expect("block pushed before instructions")
            .instrs
            .push(idx);
        Ok(())
    }

    /// Queue one move per phi of `succ` into the current block's trailing
    /// gap (the gap before the goto being lowered).
    fn queue_phi_moves(&mut self, block: BlockId, succ: BlockId) -> CompileResult<()> {
        let hir = self.hir;
        let phis = &hir.block(succ).phis;
        if phis.is_empty() {
            return Ok(());
        }
        let pred_index = hir
            .block(succ)
            .preds
            .iter()
            .position(|&p| p == block)
            .ok_or_else(|| {
                CompileError::internal(format!(
                    "goto target b{} does not list b{} as predecessor",
                    succ.0, block.0
                ))
            })?;

        let gap_pos = self.current_id - 1;
        for &phi in phis {
            let input = hir.instr(phi).operands[pred_index];
            let result = hir
                .instr(phi)
                .result
                .ok_or_else(|| CompileError::internal("phi without result value"))?;
            let src = self.virt(input);
            let dst = self.virt(result);
            self.lir
                .queue_move(gap_pos, Operand::Virtual(src), Operand::Virtual(dst));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lowered(hir: &mut HirGraph, target: &Target) -> LirFunction {
        hir.split_critical_edges();
        hir.linearise();
        hir.verify().unwrap();
        lower(target, hir).unwrap()
    }

    #[test]
    fn return_pins_the_result_register() {
        let mut g = HirGraph::new();
        let entry = g.entry();
        g.append(entry, HirOp::Entry, &[]);
        let (_, v) = g.append(entry, HirOp::LoadRoot { index: 0 }, &[]);
        g.append(entry, HirOp::Return, &[v.unwrap()]);

        let target = Target::synthetic(2);
        let lir = lowered(&mut g, &target);

        let ret = lir
            .instrs
            .iter()
            .find(|i| matches!(i.op, LirOp::Return))
            .unwrap();
        assert_eq!(ret.inputs[0].kind, UseKind::Fixed(target.pinned.ret0));
        // The materialising move sits in the gap before the return.
        let gap = lir.gap(ret.gap_before()).unwrap();
        assert_eq!(gap.pending.len(), 1);
        assert_eq!(gap.pending[0].1, Operand::Register(target.pinned.ret0));
    }

    #[test]
    fn binop_reserves_argument_registers_and_call_clobbers() {
        let mut g = HirGraph::new();
        let entry = g.entry();
        g.append(entry, HirOp::Entry, &[]);
        let (_, a) = g.append(entry, HirOp::LoadRoot { index: 0 }, &[]);
        let (_, b) = g.append(entry, HirOp::LoadRoot { index: 1 }, &[]);
        let (_, c) = g.append(
            entry,
            HirOp::BinOp(crate::hir::BinOpKind::Add),
            &[a.unwrap(), b.unwrap()],
        );
        g.append(entry, HirOp::Return, &[c.unwrap()]);

        let target = Target::synthetic(3);
        let lir = lowered(&mut g, &target);

        let binop = lir
            .instrs
            .iter()
            .find(|i| matches!(i.op, LirOp::BinOp(_)))
            .unwrap();
        assert!(binop.has_call);
        // Two argument moves before, one result move after.
        assert_eq!(lir.gap(binop.gap_before()).unwrap().pending.len(), 2);
        assert_eq!(lir.gap(binop.gap_after()).unwrap().pending.len(), 1);
        // Every caller-saved register is reserved over the call.
        for reg in target.caller_saved.iter() {
            assert!(
                lir.fixed_reservations
                    .iter()
                    .any(|&(r, s, e)| r == reg && s <= binop.id && binop.id < e),
                "r{} not reserved over the call",
                reg.0
            );
        }
    }

    #[test]
    fn double_pinning_is_a_conflict() {
        let target = Target::synthetic(1); // arg0 and arg1 collapse to r0
        let mut g = HirGraph::new();
        let entry = g.entry();
        g.append(entry, HirOp::Entry, &[]);
        let (_, a) = g.append(entry, HirOp::LoadRoot { index: 0 }, &[]);
        let (_, b) = g.append(entry, HirOp::LoadRoot { index: 1 }, &[]);
        let (_, c) = g.append(
            entry,
            HirOp::BinOp(crate::hir::BinOpKind::Add),
            &[a.unwrap(), b.unwrap()],
        );
        g.append(entry, HirOp::Return, &[c.unwrap()]);
        g.linearise();
        g.verify().unwrap();

        let err = lower(&target, &g).unwrap_err();
        assert!(matches!(err, CompileError::FixedConflict { .. }));
    }

    #[test]
    fn phi_moves_land_in_predecessor_trailing_gaps() {
        let mut g = HirGraph::new();
        let entry = g.entry();
        let left = g.add_block();
        let right = g.add_block();
        let join = g.add_block();

        g.append(entry, HirOp::Entry, &[]);
        let (_, cond) = g.append(entry, HirOp::LoadRoot { index: 0 }, &[]);
        g.append(
            entry,
            HirOp::BranchBool {
                on_true: left,
                on_false: right,
            },
            &[cond.unwrap()],
        );

        let (_, x) = g.append(left, HirOp::LoadRoot { index: 1 }, &[]);
        g.append(left, HirOp::Goto { target: join }, &[]);
        let (_, y) = g.append(right, HirOp::LoadRoot { index: 2 }, &[]);
        g.append(right, HirOp::Goto { target: join }, &[]);

        let (phi, phi_v) = g.add_phi(join);
        g.phi_add_input(phi, x.unwrap());
        g.phi_add_input(phi, y.unwrap());
        g.append(join, HirOp::Return, &[phi_v]);

        let target = Target::synthetic(2);
        let lir = lowered(&mut g, &target);

        // Each goto-block feeding the join carries exactly one phi move in
        // its trailing gap.
        let mut phi_moves = 0;
        for block in &lir.blocks {
            if block.succs.len() == 1 && block.succs[0] == join {
                let gap = lir.gap(block.last_gap_pos()).expect("phi move queued");
                phi_moves += gap
                    .pending
                    .iter()
                    .filter(|(src, dst)| src.is_virtual() && dst.is_virtual())
                    .count();
            }
        }
        assert_eq!(phi_moves, 2);
    }
}
