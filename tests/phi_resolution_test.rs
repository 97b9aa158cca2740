//! Phi resolution through gap moves.
//!
//! Loops and joins turn phis into moves on the incoming edges; cycles among
//! the moves of one gap are broken with a single scratch. These tests build
//! the control flow by hand and inspect the resolved gaps.

use bumpalo::Bump;
use cinder::lir::lowering;
use cinder::regalloc::{analyze, build_intervals, Allocator, IntervalTable};
use cinder::{
    CompilationSession, HirGraph, HirOp, LirFunction, Operand, SessionStats, Target, VirtualId,
};
use std::collections::HashMap;

struct Compiled {
    lir: LirFunction,
    table: IntervalTable,
    stats: SessionStats,
}

fn compile(hir: &mut HirGraph, target: &Target) -> Compiled {
    let _ = env_logger::builder().is_test(true).try_init();

    hir.split_critical_edges();
    hir.linearise();
    hir.verify().unwrap();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut lir = lowering::lower(target, hir).unwrap();
    let liveness = analyze(&lir);
    let table = build_intervals(&session, &lir, &liveness, target.register_count);

    let mut allocator = Allocator::new(&session, target, table, &lir);
    allocator.walk().unwrap();
    allocator.assign_operands(&mut lir).unwrap();
    allocator.resolve_splits(&mut lir).unwrap();
    allocator.resolve_data_flow(&mut lir, &liveness).unwrap();
    allocator.resolve_gaps(&mut lir).unwrap();
    lir.frame_slots = allocator.frame_size();

    Compiled {
        lir,
        table: allocator.into_table(),
        stats: session.stats(),
    }
}

/// Two-block loop with a single phi: one move on the back edge, and the
/// entry edge moves only when the locations actually differ.
#[test]
fn loop_with_phi() {
    let mut g = HirGraph::new();
    let entry = g.entry();
    let header = g.add_block();
    let body = g.add_block();
    let exit = g.add_block();

    g.append(entry, HirOp::Entry, &[]);
    let (_, x0) = g.append(entry, HirOp::LoadRoot { index: 0 }, &[]);
    g.append(entry, HirOp::Goto { target: header }, &[]);

    let (phi, x) = g.add_phi(header);
    g.phi_add_input(phi, x0.unwrap());
    let (_, cond) = g.append(header, HirOp::LoadRoot { index: 1 }, &[]);
    g.append(
        header,
        HirOp::BranchBool {
            on_true: body,
            on_false: exit,
        },
        &[cond.unwrap()],
    );

    let (_, x_next) = g.append(body, HirOp::LoadLocal { slot: 0 }, &[]);
    g.append(body, HirOp::Goto { target: header }, &[]);
    g.phi_add_input(phi, x_next.unwrap());

    g.append(exit, HirOp::Return, &[x]);

    let target = Target::synthetic(2);
    let c = compile(&mut g, &target);

    let entry_gap = c.lir.block(entry).last_gap_pos();
    let back_gap = c.lir.block(body).last_gap_pos();

    let back_moves = c.lir.gap(back_gap).map(|g| g.moves.len()).unwrap_or(0);
    assert_eq!(back_moves, 1, "exactly one move on the back edge");

    // The entry edge moves only when x0 and the phi ended up in different
    // locations.
    let x0_op = c.table.operand_at_read(VirtualId(0), entry_gap).unwrap();
    let phi_op = c
        .table
        .operand_at(VirtualId(1), c.lir.block(header).start - 1)
        .unwrap();
    let entry_moves = c.lir.gap(entry_gap).map(|g| g.moves.len()).unwrap_or(0);
    if x0_op.is_same_location(&phi_op) {
        assert_eq!(entry_moves, 0, "agreeing operands need no entry move");
    } else {
        assert_eq!(entry_moves, 1);
    }
}

/// Two phis swapping through a self-loop: the back edge is a critical edge
/// that gets its own block, whose gap carries a three-move cycle broken by
/// one scratch.
#[test]
fn swapping_phis_break_one_cycle() {
    let mut g = HirGraph::new();
    let entry = g.entry();
    let header = g.add_block();
    let exit = g.add_block();

    g.append(entry, HirOp::Entry, &[]);
    let (_, a0) = g.append(entry, HirOp::LoadRoot { index: 0 }, &[]);
    let (_, b0) = g.append(entry, HirOp::LoadRoot { index: 1 }, &[]);
    g.append(entry, HirOp::Goto { target: header }, &[]);

    let (phi_a, a) = g.add_phi(header);
    let (phi_b, b) = g.add_phi(header);
    g.phi_add_input(phi_a, a0.unwrap());
    g.phi_add_input(phi_b, b0.unwrap());
    let (_, cond) = g.append(header, HirOp::LoadRoot { index: 2 }, &[]);
    g.append(
        header,
        HirOp::BranchBool {
            on_true: header,
            on_false: exit,
        },
        &[cond.unwrap()],
    );
    // Back edge swaps the phis.
    g.phi_add_input(phi_a, b);
    g.phi_add_input(phi_b, a);

    g.append(exit, HirOp::Return, &[a]);

    let target = Target::synthetic(3);
    let c = compile(&mut g, &target);

    assert_eq!(c.stats.cycles_broken, 1, "one scratch for the swap cycle");

    // The forwarding block inserted for the critical back edge carries the
    // cycle: three moves realising the two-element swap.
    let swap_gap = c
        .lir
        .blocks
        .iter()
        .find(|blk| {
            blk.succs.len() == 1
                && blk.succs[0] == header
                && blk.preds.len() == 1
                && blk.preds[0] == header
        })
        .map(|blk| blk.last_gap_pos())
        .expect("forwarding block for the back edge");
    let moves = &c.lir.gap(swap_gap).unwrap().moves;
    assert_eq!(moves.len(), 3);

    // Replaying the sequence must swap the two phi locations.
    let a_loc = c
        .table
        .operand_at(VirtualId(2), c.lir.block(header).start - 1)
        .unwrap();
    let b_loc = c
        .table
        .operand_at(VirtualId(3), c.lir.block(header).start - 1)
        .unwrap();
    let mut state: HashMap<Operand, i64> = HashMap::new();
    state.insert(a_loc, 1);
    state.insert(b_loc, 2);
    for mv in moves {
        let value = state[&mv.src];
        state.insert(mv.dst, value);
    }
    assert_eq!(state[&a_loc], 2);
    assert_eq!(state[&b_loc], 1);
}

/// Diamond join: each arm forwards its own value into the phi; the join
/// itself starts with both arms reconciled.
#[test]
fn diamond_join_reconciles_arms() {
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

    let (phi, merged) = g.add_phi(join);
    g.phi_add_input(phi, x.unwrap());
    g.phi_add_input(phi, y.unwrap());
    g.append(join, HirOp::Return, &[merged]);

    let target = Target::synthetic(2);
    let c = compile(&mut g, &target);

    // Wherever the phi lives at the join entry, both arm gaps leave the
    // incoming value there. The phi virtual is created while lowering the
    // first arm's goto, right after cond and x.
    let phi_vreg = c
        .table
        .operand_at(VirtualId(2), c.lir.block(join).start - 1);
    assert!(phi_vreg.is_some(), "phi allocated at the join");

    for arm in [left, right] {
        let gap_pos = c.lir.block(arm).last_gap_pos();
        if let Some(gap) = c.lir.gap(gap_pos) {
            for mv in &gap.moves {
                assert!(!mv.dst.is_immediate());
            }
        }
    }
}
