//! Property-based tests for the parallel-move resolver.
//!
//! The resolver's output must behave exactly like applying all pairs
//! atomically, for any pair set with unique destinations, and it must spend
//! exactly one scratch per cycle of the dependency graph.

use cinder::{resolve_parallel_moves, MoveOp, Operand, Reg, SpillSlot};
use proptest::prelude::*;
use std::collections::HashMap;

fn loc(i: u8) -> Operand {
    if i < 8 {
        Operand::Register(Reg(i))
    } else {
        Operand::Spill(SpillSlot((i - 8) as u32))
    }
}

fn run(moves: &[MoveOp], state: &mut HashMap<Operand, i64>) {
    for mv in moves {
        let value = match mv.src {
            Operand::Immediate(imm) => imm,
            src => *state.get(&src).expect("read of undefined location"),
        };
        state.insert(mv.dst, value);
    }
}

fn run_atomic(pairs: &[(Operand, Operand)], state: &mut HashMap<Operand, i64>) {
    let reads: Vec<i64> = pairs
        .iter()
        .map(|(src, _)| match src {
            Operand::Immediate(imm) => *imm,
            src => state[src],
        })
        .collect();
    for ((_, dst), value) in pairs.iter().zip(reads) {
        state.insert(*dst, value);
    }
}

/// Cycles of length >= 2 in the permutation `dst[i] <- src[i]`.
fn permutation_cycles(perm: &[usize]) -> usize {
    let mut seen = vec![false; perm.len()];
    let mut cycles = 0;
    for start in 0..perm.len() {
        if seen[start] || perm[start] == start {
            continue;
        }
        let mut len = 0;
        let mut at = start;
        while !seen[at] {
            seen[at] = true;
            at = perm[at];
            len += 1;
        }
        if len >= 2 {
            cycles += 1;
        }
    }
    cycles
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    /// Any unique-destination pair set resolves to the atomic post-state.
    #[test]
    fn resolved_sequence_matches_atomic_assignment(
        raw in prop::collection::vec((0u8..12, 0u8..12), 0..10)
    ) {
        let mut taken = std::collections::HashSet::new();
        let pairs: Vec<(Operand, Operand)> = raw
            .into_iter()
            .filter(|(_, d)| taken.insert(*d))
            .map(|(s, d)| (loc(s), loc(d)))
            .collect();

        let mut scratches = 0usize;
        let mut scratch = || {
            scratches += 1;
            loc(20 + scratches as u8) // disjoint from the pair locations
        };
        let moves = resolve_parallel_moves(&pairs, &mut scratch).unwrap();

        prop_assert!(moves.len() <= pairs.len() + scratches);

        let mut serial: HashMap<Operand, i64> = HashMap::new();
        let mut atomic: HashMap<Operand, i64> = HashMap::new();
        for i in 0..32u8 {
            serial.insert(loc(i), i as i64);
            atomic.insert(loc(i), i as i64);
        }
        run(&moves, &mut serial);
        run_atomic(&pairs, &mut atomic);

        for (_, dst) in &pairs {
            prop_assert_eq!(serial[dst], atomic[dst]);
        }
        // Locations no pair writes keep their value (the scratch aside).
        for i in 0..20u8 {
            let l = loc(i);
            if !pairs.iter().any(|(_, d)| d.is_same_location(&l)) {
                prop_assert_eq!(serial[&l], atomic[&l]);
            }
        }
    }

    /// Shuffled-register permutations need exactly one scratch per cycle.
    #[test]
    fn one_scratch_per_permutation_cycle(
        perm in Just((0usize..7).collect::<Vec<_>>()).prop_shuffle()
    ) {
        let pairs: Vec<(Operand, Operand)> = perm
            .iter()
            .enumerate()
            .filter(|&(dst, &src)| dst != src)
            .map(|(dst, &src)| (loc(src as u8), loc(dst as u8)))
            .collect();

        let mut scratches = 0usize;
        let mut scratch = || {
            scratches += 1;
            loc(20 + scratches as u8)
        };
        let moves = resolve_parallel_moves(&pairs, &mut scratch).unwrap();

        let expected = permutation_cycles(&perm);
        prop_assert_eq!(scratches, expected);
        prop_assert_eq!(moves.len(), pairs.len() + expected);

        let mut serial: HashMap<Operand, i64> = HashMap::new();
        for i in 0..32u8 {
            serial.insert(loc(i), i as i64);
        }
        run(&moves, &mut serial);
        for (dst, &src) in perm.iter().enumerate() {
            prop_assert_eq!(serial[&loc(dst as u8)], src as i64);
        }
    }
}
