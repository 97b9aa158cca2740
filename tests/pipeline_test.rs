//! Whole-pipeline tests through `compile_function` and the assembler seam.

use bumpalo::Bump;
use cinder::{
    compile_function, Assembler, BinOpKind, BlockId, CompilationSession, CompileError, HirGraph,
    HirOp, Operand, ScopeSlot, StubRef, Target,
};

#[derive(Default)]
struct RecordingAssembler {
    labels: Vec<BlockId>,
    moves: Vec<(Operand, Operand)>,
    calls: Vec<StubRef>,
}

impl Assembler for RecordingAssembler {
    fn bind_label(&mut self, block: BlockId) {
        self.labels.push(block);
    }

    fn move_op(&mut self, dst: Operand, src: Operand) {
        self.moves.push((dst, src));
    }

    fn call(&mut self, stub: StubRef) {
        self.calls.push(stub);
    }
}

fn sum_function() -> HirGraph {
    let mut g = HirGraph::new();
    let entry = g.entry();
    g.append(entry, HirOp::Entry, &[]);
    let (_, a) = g.append(entry, HirOp::LoadArg { index: 0 }, &[]);
    let (_, b) = g.append(entry, HirOp::LoadRoot { index: 1 }, &[]);
    let (_, c) = g.append(entry, HirOp::BinOp(BinOpKind::Add), &[a.unwrap(), b.unwrap()]);
    g.append(entry, HirOp::Return, &[c.unwrap()]);
    g
}

#[test]
fn compile_straight_line_function() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut hir = sum_function();

    let lir = compile_function(&session, &mut hir, &Target::x64()).unwrap();
    assert_eq!(lir.frame_slots, 0);

    // Everything concrete: no virtual operand survives allocation.
    for instr in &lir.instrs {
        for use_ in instr
            .inputs
            .iter()
            .chain(instr.scratches.iter())
            .chain(instr.result.iter())
        {
            assert!(!use_.operand.is_virtual(), "virtual left at {}", instr.id);
        }
    }
    for gap in lir.gaps.values() {
        assert!(gap.pending.is_empty(), "unresolved gap pairs");
        for mv in &gap.moves {
            assert!(!mv.src.is_virtual() && !mv.dst.is_virtual());
        }
    }

    let stats = session.stats();
    assert!(stats.intervals_built > 0);
    assert!(stats.registers_assigned > 0);
    assert_eq!(stats.spills_assigned, 0);
}

#[test]
fn emit_walks_labels_moves_and_stubs() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut hir = sum_function();
    let lir = compile_function(&session, &mut hir, &Target::x64()).unwrap();

    let mut asm = RecordingAssembler::default();
    lir.emit(&mut asm);

    assert_eq!(asm.labels, vec![BlockId(0)]);
    // One stub call for the binop.
    assert_eq!(asm.calls.len(), 1);
    let total_moves: usize = lir.gaps.values().map(|g| g.moves.len()).sum();
    assert_eq!(asm.moves.len(), total_moves);
}

#[test]
fn frame_budget_overflow_is_fatal() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut target = Target::synthetic(2);
    target.spill_budget = 0;

    // Enough values across a call to force at least one slot.
    let mut g = HirGraph::new();
    let entry = g.entry();
    g.append(entry, HirOp::Entry, &[]);
    let (_, v1) = g.append(entry, HirOp::LoadRoot { index: 0 }, &[]);
    let (_, v2) = g.append(entry, HirOp::LoadRoot { index: 1 }, &[]);
    let (_, o) = g.append(entry, HirOp::AllocateObject { size: 2 }, &[]);
    g.append(entry, HirOp::StoreLocal { slot: 0 }, &[v1.unwrap()]);
    g.append(entry, HirOp::StoreLocal { slot: 1 }, &[v2.unwrap()]);
    g.append(entry, HirOp::Return, &[o.unwrap()]);

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let err = compile_function(&session, &mut g, &target).unwrap_err();
    assert!(matches!(err, CompileError::FrameBudget { .. }));
}

#[test]
fn malformed_graph_is_rejected() {
    let mut g = HirGraph::new();
    let entry = g.entry();
    g.append(entry, HirOp::Entry, &[]); // no terminator

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let err = compile_function(&session, &mut g, &Target::x64()).unwrap_err();
    assert!(matches!(err, CompileError::MalformedGraph { .. }));
}

#[test]
fn branchy_function_compiles_clean() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut g = HirGraph::new();
    let entry = g.entry();
    let then_b = g.add_block();
    let else_b = g.add_block();
    let join = g.add_block();

    g.append(entry, HirOp::Entry, &[]);
    let (_, cond) = g.append(entry, HirOp::LoadLocal { slot: 0 }, &[]);
    g.append(
        entry,
        HirOp::BranchBool {
            on_true: then_b,
            on_false: else_b,
        },
        &[cond.unwrap()],
    );

    let (_, x) = g.append(then_b, HirOp::AllocateObject { size: 2 }, &[]);
    g.append(then_b, HirOp::Goto { target: join }, &[]);
    let (_, y) = g.append(else_b, HirOp::LoadRoot { index: 0 }, &[]);
    g.append(else_b, HirOp::Goto { target: join }, &[]);

    let (phi, merged) = g.add_phi(join);
    g.phi_add_input(phi, x.unwrap());
    g.phi_add_input(phi, y.unwrap());
    g.bind_slot(merged, ScopeSlot::Context { depth: 0, index: 3 });
    g.append(join, HirOp::StoreContext { depth: 0, slot: 3 }, &[merged]);
    g.append(join, HirOp::Return, &[merged]);

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let lir = compile_function(&session, &mut g, &Target::x64()).unwrap();

    for gap in lir.gaps.values() {
        assert!(gap.pending.is_empty());
    }
    // Both arms bound a label, and the join is reachable.
    let mut asm = RecordingAssembler::default();
    lir.emit(&mut asm);
    assert_eq!(asm.labels.len(), lir.blocks.len());
}
