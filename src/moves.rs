// This module serialises the parallel moves collected in a gap. Every pending
// pair (source, destination) must take effect as if all pairs were applied
// atomically; destinations are unique. The resolver walks pairs depth-first:
// before a pair may overwrite its destination, every pair reading that
// destination is resolved first. Finding an in-progress pair during that scan
// means the dependency chain closed into a cycle; the cycle is broken by
// saving the about-to-be-clobbered location into a scratch and rewriting the
// blocked pair to read the scratch instead. One scratch per cycle, at most
// N + C emitted moves for N pairs and C cycles.

//! Parallel-move resolution.

use crate::error::{CompileError, CompileResult};
use crate::lir::{MoveOp, Operand};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveState {
    Pending,
    InProgress,
    Done,
}

/// Serialise `pending` into an ordered move list.
///
/// `scratch` is called once per detected cycle and must return a location
/// that is neither referenced by `pending` nor live across the gap. Pairs
/// whose source and destination already agree are dropped.
pub fn resolve_parallel_moves(
    pending: &[(Operand, Operand)],
    scratch: &mut dyn FnMut() -> Operand,
) -> CompileResult<Vec<MoveOp>> {
    for (idx, (_, dst)) in pending.iter().enumerate() {
        if dst.is_immediate() {
            return Err(CompileError::UnresolvableMove {
                reason: format!("immediate destination {}", dst),
            });
        }
        for (_, later) in &pending[idx + 1..] {
            if dst.is_same_location(later) {
                return Err(CompileError::UnresolvableMove {
                    reason: format!("duplicate destination {}", dst),
                });
            }
        }
    }

    let mut pairs: Vec<(Operand, Operand)> = pending
        .iter()
        .filter(|(src, dst)| !src.is_same_location(dst))
        .copied()
        .collect();
    let mut state = vec![MoveState::Pending; pairs.len()];
    let mut out = Vec::with_capacity(pairs.len() + 1);

    for i in 0..pairs.len() {
        if state[i] == MoveState::Pending {
            visit(i, &mut pairs, &mut state, &mut out, scratch);
        }
    }
    Ok(out)
}

fn visit(
    i: usize,
    pairs: &mut [(Operand, Operand)],
    state: &mut [MoveState],
    out: &mut Vec<MoveOp>,
    scratch: &mut dyn FnMut() -> Operand,
) {
    state[i] = MoveState::InProgress;
    let dst = pairs[i].1;

    // Every pair reading our destination must go first.
    for j in 0..pairs.len() {
        if j == i || !pairs[j].0.is_same_location(&dst) {
            continue;
        }
        match state[j] {
            MoveState::Pending => visit(j, pairs, state, out, scratch),
            MoveState::InProgress => {
                // Cycle: park the blocked value in a scratch and read it from
                // there instead.
                let t = scratch();
                out.push(MoveOp { src: dst, dst: t });
                pairs[j].0 = t;
            }
            MoveState::Done => {}
        }
    }

    out.push(MoveOp {
        src: pairs[i].0,
        dst: pairs[i].1,
    });
    state[i] = MoveState::Done;
}
