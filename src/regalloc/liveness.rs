// This module computes per-block live sets and builds the live intervals the
// walk consumes. Liveness is the usual backward fixed point over the linear
// block order: live_in = use ∪ (live_out \ def), live_out = union of
// successor live_ins, iterated until nothing changes. Interval construction
// then visits blocks bottom-up: every value live out of a block opens a range
// spanning it, definitions shorten the open range to their position, reads
// open ranges ending at the reading position, and gap moves participate like
// instructions with their sources read before their destinations are written.

//! Liveness analysis and interval construction.

use log::debug;

use crate::lir::{LirFunction, Operand, UseKind, VirtualId};
use crate::regalloc::interval::IntervalTable;
use crate::session::CompilationSession;

/// Dense bit set over virtual register indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    pub fn new(capacity: u32) -> Self {
        Self {
            words: vec![0; (capacity as usize + 63) / 64],
        }
    }

    pub fn contains(&self, v: VirtualId) -> bool {
        let idx = v.index();
        (self.words[idx / 64] & (1u64 << (idx % 64))) != 0
    }

    pub fn insert(&mut self, v: VirtualId) {
        let idx = v.index();
        self.words[idx / 64] |= 1u64 << (idx % 64);
    }

    /// `self |= other`; reports whether anything changed.
    pub fn union_with(&mut self, other: &BitSet) -> bool {
        let mut changed = false;
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            let merged = *w | o;
            changed |= merged != *w;
            *w = merged;
        }
        changed
    }

    pub fn iter(&self) -> impl Iterator<Item = VirtualId> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &word)| {
            (0..64u32)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| VirtualId(wi as u32 * 64 + bit))
        })
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }
}

/// Per-block live sets, indexed by linear block position.
pub struct Liveness {
    pub live_in: Vec<BitSet>,
    pub live_out: Vec<BitSet>,
    pub uses: Vec<BitSet>,
    pub defs: Vec<BitSet>,
}

/// One step of a block's event walk: a real instruction or a gap's pending
/// pairs.
enum Event {
    Instr(usize),
    Gap(i32),
}

/// The block's instructions and touched gaps in ascending position order.
fn block_events(lir: &LirFunction, linear_idx: usize) -> Vec<Event> {
    let block = &lir.blocks[linear_idx];
    let mut events = Vec::with_capacity(block.instrs.len() * 2);
    for &idx in &block.instrs {
        let instr = &lir.instrs[idx];
        if lir.gap(instr.gap_before()).is_some() {
            events.push(Event::Gap(instr.gap_before()));
        }
        events.push(Event::Instr(idx));
        if lir.gap(instr.gap_after()).is_some() {
            events.push(Event::Gap(instr.gap_after()));
        }
    }
    events
}

fn as_virtual(operand: &Operand) -> Option<VirtualId> {
    match operand {
        Operand::Virtual(v) => Some(*v),
        _ => None,
    }
}

/// Compute local use/def sets and run the global fixed point.
pub fn analyze(lir: &LirFunction) -> Liveness {
    let n = lir.blocks.len();
    let cap = lir.virtual_count;

    let mut uses = Vec::with_capacity(n);
    let mut defs = Vec::with_capacity(n);
    for linear_idx in 0..n {
        let mut use_set = BitSet::new(cap);
        let mut def_set = BitSet::new(cap);
        let mut read = |v: VirtualId, use_set: &mut BitSet, def_set: &BitSet| {
            if !def_set.contains(v) {
                use_set.insert(v);
            }
        };
        for event in block_events(lir, linear_idx) {
            match event {
                Event::Gap(pos) => {
                    let gap = lir.gap(pos).expect("gap event");
                    for (src, _) in &gap.pending {
                        if let Some(v) = as_virtual(src) {
                            read(v, &mut use_set, &def_set);
                        }
                    }
                    for (_, dst) in &gap.pending {
                        if let Some(v) = as_virtual(dst) {
                            def_set.insert(v);
                        }
                    }
                }
                Event::Instr(idx) => {
                    let instr = &lir.instrs[idx];
                    for input in &instr.inputs {
                        if let Some(v) = as_virtual(&input.operand) {
                            read(v, &mut use_set, &def_set);
                        }
                    }
                    for scratch in &instr.scratches {
                        if let Some(v) = as_virtual(&scratch.operand) {
                            def_set.insert(v);
                        }
                    }
                    if let Some(result) = &instr.result {
                        if let Some(v) = as_virtual(&result.operand) {
                            def_set.insert(v);
                        }
                    }
                }
            }
        }
        uses.push(use_set);
        defs.push(def_set);
    }

    let mut live_in: Vec<BitSet> = (0..n).map(|_| BitSet::new(cap)).collect();
    let mut live_out: Vec<BitSet> = (0..n).map(|_| BitSet::new(cap)).collect();

    let mut changed = true;
    while changed {
        changed = false;
        for bi in (0..n).rev() {
            let succ_idx: Vec<usize> = lir.blocks[bi]
                .succs
                .iter()
                .map(|&s| lir.block_linear_index(s))
                .collect();
            for si in succ_idx {
                let succ_in = live_in[si].clone();
                changed |= live_out[bi].union_with(&succ_in);
            }
            // live_in = use ∪ (live_out \ def)
            let mut new_in = uses[bi].clone();
            for (w, (o, d)) in new_in
                .words
                .iter_mut()
                .zip(live_out[bi].words.iter().zip(&defs[bi].words))
            {
                *w |= o & !d;
            }
            changed |= live_in[bi].union_with(&new_in);
        }
    }

    debug!(
        "liveness converged over {} blocks, {} virtuals",
        n, lir.virtual_count
    );

    Liveness {
        live_in,
        live_out,
        uses,
        defs,
    }
}

/// Build live intervals bottom-up and apply the lowering's fixed-register
/// reservations.
pub fn build_intervals(
    session: &CompilationSession<'_>,
    lir: &LirFunction,
    liveness: &Liveness,
    register_count: u8,
) -> IntervalTable {
    let mut table = IntervalTable::new(lir.virtual_count, register_count);

    for &(reg, start, end) in &lir.fixed_reservations {
        table.reserve_fixed(reg, start, end);
    }

    for linear_idx in (0..lir.blocks.len()).rev() {
        let block = &lir.blocks[linear_idx];
        let block_open_start = block.start - 1;

        // Values live out stay allocated across the whole block; the range is
        // trimmed when the walk below meets their definition.
        for v in liveness.live_out[linear_idx].iter() {
            let root = table.vreg_root(v);
            table.get_mut(root).add_live_range(block_open_start, block.end - 2);
        }

        // True while the interval's earliest range reaches back to or before
        // `pos`; such a range was opened by a later use in this block or by
        // the live-out pass.
        let is_open = |table: &IntervalTable, v: VirtualId, pos: i32| -> bool {
            let interval = table.get(table.vreg_root(v));
            interval.ranges.first().map_or(false, |r| r.start <= pos)
        };

        let events = block_events(lir, linear_idx);
        for event in events.iter().rev() {
            match event {
                Event::Gap(pos) => {
                    let pos = *pos;
                    let gap = lir.gap(pos).expect("gap event");
                    // Walking backward: destinations are written after
                    // sources are read, so they are processed first.
                    for (_, dst) in &gap.pending {
                        if let Some(v) = as_virtual(dst) {
                            let root = table.vreg_root(v);
                            if is_open(&table, v, pos) {
                                table.get_mut(root).shorten_first_range(pos);
                            } else {
                                table.get_mut(root).add_live_range(pos, pos + 1);
                            }
                            table.get_mut(root).add_use(pos, UseKind::Any);
                        }
                    }
                    for (src, _) in &gap.pending {
                        if let Some(v) = as_virtual(src) {
                            let root = table.vreg_root(v);
                            let first_start =
                                table.get(root).ranges.first().map(|r| r.start);
                            // Reads end at the gap itself; gap writes of the
                            // same position are ordered after all reads. A
                            // first range starting exactly here was opened by
                            // this gap's write side and does not cover the
                            // read.
                            if first_start.map_or(true, |s| s >= pos) {
                                let end = pos.max(block_open_start + 1);
                                table.get_mut(root).add_live_range(block_open_start, end);
                            }
                            table.get_mut(root).add_use(pos, UseKind::Any);
                        }
                    }
                }
                Event::Instr(idx) => {
                    let instr = &lir.instrs[*idx];
                    let pos = instr.id;
                    if let Some(result) = &instr.result {
                        if let Some(v) = as_virtual(&result.operand) {
                            let root = table.vreg_root(v);
                            if is_open(&table, v, pos) {
                                table.get_mut(root).shorten_first_range(pos);
                            } else {
                                table.get_mut(root).add_live_range(pos, pos + 1);
                            }
                            table.get_mut(root).add_use(pos, result.kind);
                        }
                    }
                    for scratch in &instr.scratches {
                        if let Some(v) = as_virtual(&scratch.operand) {
                            let root = table.vreg_root(v);
                            table.get_mut(root).add_live_range(pos, pos + 1);
                            table.get_mut(root).add_use(pos, UseKind::Register);
                        }
                    }
                    for input in &instr.inputs {
                        if let Some(v) = as_virtual(&input.operand) {
                            let root = table.vreg_root(v);
                            if !is_open(&table, v, pos) {
                                // Instruction reads hold their operand
                                // through the instruction itself.
                                table.get_mut(root).add_live_range(block_open_start, pos + 1);
                            }
                            table.get_mut(root).add_use(pos, input.kind);
                        }
                    }
                }
            }
        }
    }

    for id in table.ids() {
        if !table.get(id).ranges.is_empty() {
            session.record_interval_built();
        }
    }

    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::BlockId;
    use crate::lir::{LirBlock, LirInstruction, LirOp};
    use bumpalo::Bump;
    use smallvec::SmallVec;

    fn v(i: u32) -> VirtualId {
        VirtualId(i)
    }

    /// One block: v0 defined at 4, read at 8; v1 defined at 8.
    fn straight_line() -> LirFunction {
        let mut f = LirFunction::new(1);
        f.virtual_count = 2;
        let b = BlockId(0);

        let entry = LirInstruction::new(0, LirOp::Entry, b);
        let mut def = LirInstruction::new(4, LirOp::LoadRoot { index: 0 }, b);
        def.set_result(Operand::Virtual(v(0)), UseKind::Register);
        let mut use_i = LirInstruction::new(8, LirOp::StoreLocal { slot: 0 }, b);
        use_i.add_arg(Operand::Virtual(v(0)), UseKind::Register);
        use_i.set_result(Operand::Virtual(v(1)), UseKind::Any);
        let mut ret = LirInstruction::new(12, LirOp::Return, b);
        ret.add_arg(Operand::Virtual(v(1)), UseKind::Any);

        f.instrs = vec![entry, def, use_i, ret];
        f.push_block(LirBlock {
            id: b,
            instrs: vec![0, 1, 2, 3],
            preds: SmallVec::new(),
            succs: SmallVec::new(),
            start: 0,
            end: 16,
        });
        f
    }

    #[test]
    fn straight_line_has_no_live_in() {
        let f = straight_line();
        let live = analyze(&f);
        assert!(live.live_in[0].is_empty());
        assert!(live.live_out[0].is_empty());
        assert!(live.uses[0].is_empty());
        assert!(live.defs[0].contains(v(0)));
        assert!(live.defs[0].contains(v(1)));
    }

    #[test]
    fn fixed_point_invariant_holds() {
        let f = straight_line();
        let live = analyze(&f);
        for bi in 0..f.blocks.len() {
            // live_in = use ∪ (live_out \ def)
            let mut expect = live.uses[bi].clone();
            for (w, (o, d)) in expect
                .words
                .iter_mut()
                .zip(live.live_out[bi].words.iter().zip(&live.defs[bi].words))
            {
                *w |= o & !d;
            }
            assert_eq!(expect, live.live_in[bi]);
        }
    }

    #[test]
    fn intervals_cover_uses() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let f = straight_line();
        let live = analyze(&f);
        let table = build_intervals(&session, &f, &live, 2);

        let i0 = table.get(table.vreg_root(v(0)));
        assert_eq!(i0.start(), 4);
        // Read at 8 holds the value through the reading instruction.
        assert_eq!(i0.end(), 9);
        for u in &i0.uses {
            assert!(i0.covers_read(u.pos), "use at {} not covered", u.pos);
        }

        let i1 = table.get(table.vreg_root(v(1)));
        assert_eq!(i1.start(), 8);
        assert_eq!(i1.end(), 13);
    }

    #[test]
    fn gap_moves_define_and_read() {
        let mut f = straight_line();
        // Queue a phi-style move in the gap before the return: v1 -> v0.
        f.queue_move(11, Operand::Virtual(v(1)), Operand::Virtual(v(0)));
        let live = analyze(&f);
        assert!(live.defs[0].contains(v(0)));

        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let table = build_intervals(&session, &f, &live, 2);
        let i0 = table.get(table.vreg_root(v(0)));
        // Second range opened by the gap definition at 11.
        assert!(i0.covers(11));
    }
}
