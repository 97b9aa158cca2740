// This module runs the linear-scan walk over the live intervals and turns
// every virtual operand into a physical register or spill slot. Intervals
// move through unhandled -> active -> (inactive <-> active)* -> retired;
// spilled intervals sit in active_spills until their slot can return to the
// free list. Register selection follows the free/blocked split: a free
// register is taken for as long as it stays free (splitting the interval at
// the first collision), a blocked register is stolen from the interval whose
// next register-requiring use is farthest away, spilling the loser's tail.
// Split positions snap to a block boundary when one is in reach, otherwise to
// the nearest gap that is not interior to a fixed reservation. After the
// walk, operands are rewritten through the split trees, split halves are
// reconnected with gap moves, control-flow edges are reconciled, and every
// gap's pending pairs are serialised by the parallel-move resolver.

//! Linear-scan register allocation.

use log::{debug, trace};
use std::collections::HashSet;

use crate::error::{CompileError, CompileResult};
use crate::lir::{LirFunction, Operand, SpillSlot, VirtualId};
use crate::moves::resolve_parallel_moves;
use crate::regalloc::interval::{IntervalId, IntervalTable};
use crate::regalloc::liveness::Liveness;
use crate::session::CompilationSession;
use crate::target::{Reg, Target};

pub struct Allocator<'a, 'zone> {
    session: &'a CompilationSession<'zone>,
    target: &'a Target,
    table: IntervalTable,

    /// Sorted descending by (start, fixed-first); pop() yields the next
    /// interval to process.
    unhandled: Vec<IntervalId>,
    active: Vec<IntervalId>,
    inactive: Vec<IntervalId>,
    active_spills: Vec<IntervalId>,
    available_spills: Vec<SpillSlot>,
    /// Reverse map register -> currently active interval.
    registers: Vec<Option<IntervalId>>,

    next_spill: u32,
    /// Last register each virtual held, for the coalescing tie-break.
    last_reg: Vec<Option<Reg>>,
    /// Entry-gap position of every block, ascending.
    block_entries: Vec<i32>,
    /// Gap slots adjacent to a real instruction; the only places a split
    /// seam's connection move can be emitted.
    gap_positions: HashSet<i32>,
    /// Scratch slot shared by move cycles that cannot get a register.
    scratch_slot: Option<SpillSlot>,
}

impl<'a, 'zone> Allocator<'a, 'zone> {
    pub fn new(
        session: &'a CompilationSession<'zone>,
        target: &'a Target,
        table: IntervalTable,
        lir: &LirFunction,
    ) -> Self {
        let virtual_count = lir.virtual_count as usize;
        let block_entries = lir.blocks.iter().map(|b| b.entry_gap_pos()).collect();
        let gap_positions = lir
            .instrs
            .iter()
            .flat_map(|i| [i.gap_before(), i.gap_after()])
            .collect();
        Self {
            session,
            target,
            table,
            unhandled: Vec::new(),
            active: Vec::new(),
            inactive: Vec::new(),
            active_spills: Vec::new(),
            available_spills: Vec::new(),
            registers: vec![None; target.register_count as usize],
            next_spill: 0,
            last_reg: vec![None; virtual_count],
            block_entries,
            gap_positions,
            scratch_slot: None,
        }
    }

    pub fn table(&self) -> &IntervalTable {
        &self.table
    }

    /// Hand the interval table back once allocation is done.
    pub fn into_table(self) -> IntervalTable {
        self.table
    }

    /// Spill slots the final frame needs.
    pub fn frame_size(&self) -> u32 {
        self.next_spill
    }

    fn sort_key(&self, id: IntervalId) -> (i32, u8) {
        let interval = self.table.get(id);
        (interval.start(), if interval.is_fixed() { 0 } else { 1 })
    }

    fn insert_unhandled(&mut self, id: IntervalId) {
        let key = self.sort_key(id);
        // Descending keys so pop() removes the minimum.
        let at = self
            .unhandled
            .partition_point(|&other| self.sort_key(other) > key);
        self.unhandled.insert(at, id);
    }

    /// Walk all intervals and assign an operand to each of them.
    pub fn walk(&mut self) -> CompileResult<()> {
        let ids: Vec<IntervalId> = self
            .table
            .ids()
            .filter(|&id| !self.table.get(id).ranges.is_empty())
            .collect();
        for id in ids {
            self.insert_unhandled(id);
        }

        while let Some(cur) = self.unhandled.pop() {
            let position = self.table.get(cur).start();
            trace!(
                "walk at {}: interval {:?} ({:?})",
                position,
                cur,
                self.table.get(cur).vreg
            );
            self.advance_to(position);

            if self.table.get(cur).is_fixed() {
                self.take_fixed(cur, position)?;
            } else if !self.allocate_free_reg(cur, position)? {
                self.allocate_blocked_reg(cur, position)?;
            }
        }
        debug!(
            "walk finished: {} spill slots, {} free at exit",
            self.next_spill,
            self.available_spills.len()
        );
        Ok(())
    }

    /// Retire and shuffle interval sets up to `position`.
    fn advance_to(&mut self, position: i32) {
        let mut idx = 0;
        while idx < self.active.len() {
            let id = self.active[idx];
            let interval = self.table.get(id);
            if interval.end() <= position {
                self.release_register(id);
                self.active.swap_remove(idx);
            } else if !interval.covers(position) {
                self.release_register(id);
                self.inactive.push(id);
                self.active.swap_remove(idx);
            } else {
                idx += 1;
            }
        }

        idx = 0;
        while idx < self.inactive.len() {
            let id = self.inactive[idx];
            let interval = self.table.get(id);
            if interval.end() <= position {
                self.inactive.swap_remove(idx);
            } else if interval.covers(position) {
                let reg = self.assigned_reg(id).expect("inactive without register");
                debug_assert!(
                    self.registers[reg.index()].is_none(),
                    "register conflict while reactivating"
                );
                self.registers[reg.index()] = Some(id);
                self.active.push(id);
                self.inactive.swap_remove(idx);
            } else {
                idx += 1;
            }
        }

        idx = 0;
        while idx < self.active_spills.len() {
            let id = self.active_spills[idx];
            if self.table.get(id).end() <= position {
                if let Some(Operand::Spill(slot)) = self.table.get(id).operand {
                    self.available_spills.push(slot);
                }
                self.active_spills.swap_remove(idx);
            } else {
                idx += 1;
            }
        }
    }

    fn assigned_reg(&self, id: IntervalId) -> Option<Reg> {
        match self.table.get(id).operand {
            Some(Operand::Register(r)) => Some(r),
            _ => None,
        }
    }

    fn release_register(&mut self, id: IntervalId) {
        if let Some(reg) = self.assigned_reg(id) {
            if self.registers[reg.index()] == Some(id) {
                self.registers[reg.index()] = None;
            }
        }
    }

    /// A fixed reservation claims its pre-declared register; any normal
    /// interval holding it is split away at the current position.
    fn take_fixed(&mut self, cur: IntervalId, position: i32) -> CompileResult<()> {
        let reg = match self.table.get(cur).operand {
            Some(Operand::Register(r)) => r,
            _ => {
                return Err(CompileError::internal(
                    "fixed interval without a register operand",
                ))
            }
        };

        if let Some(holder) = self.registers[reg.index()] {
            if holder != cur {
                trace!("fixed {:?} displaces holder of r{}", cur, reg.0);
                match self.split_before(holder, position) {
                    Some(tail) => self.insert_unhandled(tail),
                    None if self.table.get(holder).end() > position => {
                        return Err(CompileError::FixedConflict { reg, pos: position });
                    }
                    None => {}
                }
                // The holder's remaining part ends at or before `position`.
                self.release_register(holder);
                self.active.retain(|&id| id != holder);
            }
        }

        self.registers[reg.index()] = Some(cur);
        self.active.push(cur);
        Ok(())
    }

    /// Try to place `cur` in a register that is free for (a prefix of) its
    /// lifetime.
    fn allocate_free_reg(&mut self, cur: IntervalId, position: i32) -> CompileResult<bool> {
        let count = self.target.register_count as usize;
        let mut free_until = vec![i32::MAX; count];

        for &id in &self.active {
            if let Some(reg) = self.assigned_reg(id) {
                free_until[reg.index()] = 0;
            }
        }
        for &id in &self.inactive {
            if self.table.get(id).is_fixed() {
                continue; // handled by the reservation table below
            }
            if let Some(reg) = self.assigned_reg(id) {
                if let Some(x) =
                    self.table
                        .get(id)
                        .next_intersection(self.table.get(cur), position)
                {
                    free_until[reg.index()] = free_until[reg.index()].min(x);
                }
            }
        }
        for r in 0..count {
            let fixed = self.table.get(self.table.fixed_for_reg(Reg(r as u8)));
            if let Some(x) = fixed.next_intersection(self.table.get(cur), position) {
                free_until[r] = free_until[r].min(x);
            }
        }

        // Pick the register free the longest; prefer the one this value held
        // before, then the lowest index.
        let mut best = 0;
        for r in 1..count {
            if free_until[r] > free_until[best] {
                best = r;
            }
        }
        let mut reg = Reg(best as u8);
        if let Some(vreg) = self.table.get(cur).vreg {
            if let Some(prev) = self.last_reg[vreg.index()] {
                if free_until[prev.index()] == free_until[best] {
                    reg = prev;
                }
            }
        }

        let free = free_until[reg.index()];
        if free <= position {
            return Ok(false);
        }

        if free < self.table.get(cur).end() {
            // Partially free: keep the head here, requeue the tail. When no
            // gap fits before the collision the blocked path decides instead.
            let Some(tail) = self.split_before(cur, free) else {
                return Ok(false);
            };
            self.insert_unhandled(tail);
        }
        self.assign_register(cur, reg);
        Ok(true)
    }

    /// All registers are occupied at `position`: either spill `cur` or steal
    /// the register whose holder can wait the longest.
    fn allocate_blocked_reg(&mut self, cur: IntervalId, position: i32) -> CompileResult<()> {
        let count = self.target.register_count as usize;
        let mut next_use = vec![i32::MAX; count];
        // Hard walls from calling-convention reservations.
        let mut wall = vec![i32::MAX; count];

        for r in 0..count {
            let fixed = self.table.get(self.table.fixed_for_reg(Reg(r as u8)));
            if let Some(x) = fixed.next_intersection(self.table.get(cur), position) {
                wall[r] = x;
            }
            if wall[r] <= position {
                next_use[r] = i32::MIN; // reserved right now, never stealable
            }
        }
        for &id in &self.active {
            if self.table.get(id).is_fixed() {
                continue;
            }
            if let Some(reg) = self.assigned_reg(id) {
                let use_pos = self
                    .table
                    .get(id)
                    .next_register_use_after(position)
                    .map_or(i32::MAX, |u| u.pos);
                next_use[reg.index()] = next_use[reg.index()].min(use_pos);
            }
        }
        for &id in &self.inactive {
            if self.table.get(id).is_fixed() {
                continue;
            }
            if let Some(reg) = self.assigned_reg(id) {
                if self
                    .table
                    .get(id)
                    .next_intersection(self.table.get(cur), position)
                    .is_some()
                {
                    let use_pos = self
                        .table
                        .get(id)
                        .next_register_use_after(position)
                        .map_or(i32::MAX, |u| u.pos);
                    next_use[reg.index()] = next_use[reg.index()].min(use_pos);
                }
            }
        }

        if count == 0 {
            return Err(CompileError::internal("target with no registers"));
        }
        let mut best = 0;
        for r in 1..count {
            if next_use[r] > next_use[best] {
                best = r;
            }
        }
        let reg = Reg(best as u8);
        let best_use = next_use[best];

        let first_use_pos = self
            .table
            .get(cur)
            .next_register_use_after(position)
            .map_or(i32::MAX, |u| u.pos);

        if first_use_pos >= best_use || wall[best] <= first_use_pos {
            // Spilling `cur` is at least as cheap as displacing anyone, or
            // the best register hits a reservation before `cur` could even
            // use it.
            self.assign_spill_slot(cur)?;
            if first_use_pos != i32::MAX {
                // It still needs a register eventually; requeue from just
                // before that use.
                if let Some(tail) = self.split_before(cur, first_use_pos) {
                    self.insert_unhandled(tail);
                }
            }
            return Ok(());
        }

        if best_use <= position {
            return Err(CompileError::internal(format!(
                "no allocatable register and no spill candidate at position {}",
                position
            )));
        }

        // Steal `reg`: the current holder's tail is spilled.
        if let Some(holder) = self.registers[reg.index()] {
            let tail = self.split_before(holder, position);
            self.release_register(holder);
            self.active.retain(|&id| id != holder);
            match tail {
                Some(tail) => self.spill_split_tail(tail)?,
                None if self.table.get(holder).end() > position => {
                    return Err(CompileError::internal(format!(
                        "cannot evict register holder at position {}",
                        position
                    )));
                }
                None => {}
            }
        }
        // Inactive intervals on the same register that would collide later
        // are requeued from the collision point.
        let colliding: Vec<(IntervalId, i32)> = self
            .inactive
            .iter()
            .filter(|&&id| !self.table.get(id).is_fixed())
            .filter(|&&id| self.assigned_reg(id) == Some(reg))
            .filter_map(|&id| {
                self.table
                    .get(id)
                    .next_intersection(self.table.get(cur), position)
                    .map(|x| (id, x))
            })
            .collect();
        for (id, x) in colliding {
            // The head keeps its register through the hole; only the
            // colliding tail is requeued.
            if let Some(tail) = self.split_before(id, x) {
                self.insert_unhandled(tail);
            }
        }

        // A fixed reservation further down the register forces `cur` to give
        // it back in time.
        if wall[best] < self.table.get(cur).end() {
            let tail = self.split_before(cur, wall[best]).ok_or_else(|| {
                CompileError::internal(format!(
                    "cannot split before fixed reservation at {}",
                    wall[best]
                ))
            })?;
            self.insert_unhandled(tail);
        }

        self.assign_register(cur, reg);
        Ok(())
    }

    fn assign_register(&mut self, id: IntervalId, reg: Reg) {
        self.table.get_mut(id).operand = Some(Operand::Register(reg));
        if let Some(holder) = self.registers[reg.index()] {
            debug_assert!(holder == id, "register already held");
        }
        self.registers[reg.index()] = Some(id);
        if let Some(vreg) = self.table.get(id).vreg {
            self.last_reg[vreg.index()] = Some(reg);
        }
        self.active.push(id);
        self.session.record_register_assigned();
        trace!("assigned r{} to {:?}", reg.0, id);
    }

    /// Gets a slot from the free list or creates a new one, and parks the
    /// interval on it.
    fn assign_spill_slot(&mut self, id: IntervalId) -> CompileResult<()> {
        let slot = match self.available_spills.pop() {
            Some(slot) => slot,
            None => {
                let slot = SpillSlot(self.next_spill);
                self.next_spill += 1;
                if self.next_spill > self.target.spill_budget {
                    return Err(CompileError::FrameBudget {
                        slots: self.next_spill,
                        budget: self.target.spill_budget,
                    });
                }
                slot
            }
        };
        self.table.get_mut(id).operand = Some(Operand::Spill(slot));
        self.active_spills.push(id);
        self.session.record_spill_assigned();
        trace!("spilled {:?} to slot {}", id, slot.0);
        Ok(())
    }

    /// Spill a freshly split tail, requeueing the part from its next
    /// register-requiring use onward.
    fn spill_split_tail(&mut self, tail: IntervalId) -> CompileResult<()> {
        let reg_use = self
            .table
            .get(tail)
            .next_register_use_after(self.table.get(tail).start());
        self.assign_spill_slot(tail)?;
        if let Some(u) = reg_use {
            if let Some(rest) = self.split_before(tail, u.pos) {
                self.insert_unhandled(rest);
            }
        }
        Ok(())
    }

    /// Split `id` at the best gap at or before `pos` (strictly inside the
    /// interval). Returns `None` when no legal split position exists.
    fn split_before(&mut self, id: IntervalId, pos: i32) -> Option<IntervalId> {
        let start = self.table.get(id).start();
        let end = self.table.get(id).end();
        let limit = pos.min(end - 1);
        if limit <= start {
            return None;
        }
        let split_pos = self.optimal_split_pos(start, limit)?;
        let child = self.table.split_at(id, split_pos);
        self.session.record_split();
        trace!("split {:?} at {} -> {:?}", id, split_pos, child);
        Some(child)
    }

    /// Best split position in `(start, limit]`: the latest block boundary if
    /// one is inside, otherwise the latest gap that is not interior to a
    /// fixed reservation.
    fn optimal_split_pos(&self, start: i32, limit: i32) -> Option<i32> {
        let boundary = self
            .block_entries
            .iter()
            .copied()
            .filter(|&b| b > start && b <= limit)
            .max();
        if let Some(b) = boundary {
            return Some(b);
        }

        // Gaps sit at odd positions; only slots adjacent to an instruction
        // can carry the seam's connection move.
        let mut candidate = if limit % 2 != 0 { limit } else { limit - 1 };
        while candidate > start {
            if self.gap_positions.contains(&candidate) && !self.inside_fixed_region(candidate) {
                return Some(candidate);
            }
            candidate -= 2;
        }
        None
    }

    fn inside_fixed_region(&self, pos: i32) -> bool {
        (0..self.target.register_count).any(|r| {
            self.table
                .get(self.table.fixed_for_reg(Reg(r)))
                .ranges
                .iter()
                .any(|range| range.start < pos && pos < range.end)
        })
    }

    /// Rewrite every virtual operand in the instruction stream to the
    /// location its covering interval received.
    pub fn assign_operands(&self, lir: &mut LirFunction) -> CompileResult<()> {
        for instr in &mut lir.instrs {
            let pos = instr.id;
            for input in &mut instr.inputs {
                if let Operand::Virtual(v) = input.operand {
                    input.operand = self.table.operand_at_read(v, pos).ok_or_else(|| {
                        CompileError::internal(format!("no operand for v{} at {}", v.0, pos))
                    })?;
                }
            }
            for scratch in &mut instr.scratches {
                if let Operand::Virtual(v) = scratch.operand {
                    scratch.operand = self.table.operand_at(v, pos).ok_or_else(|| {
                        CompileError::internal(format!("no scratch operand for v{} at {}", v.0, pos))
                    })?;
                }
            }
            if let Some(result) = &mut instr.result {
                if let Operand::Virtual(v) = result.operand {
                    result.operand = self.table.operand_at(v, pos).ok_or_else(|| {
                        CompileError::internal(format!("no result operand for v{} at {}", v.0, pos))
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Queue the moves that reconnect the halves of split intervals inside
    /// blocks. Block-boundary reconnection belongs to edge resolution.
    pub fn resolve_splits(&self, lir: &mut LirFunction) -> CompileResult<()> {
        let entry_positions: HashSet<i32> = self.block_entries.iter().copied().collect();
        for v in 0..lir.virtual_count {
            let vreg = VirtualId(v);
            let root = self.table.vreg_root(vreg);
            if self.table.get(root).children.is_empty() {
                continue;
            }
            let mut family = vec![root];
            family.extend(self.table.get(root).children.iter().copied());
            family.sort_by_key(|&id| self.table.get(id).start());

            for pair in family.windows(2) {
                let (a, b) = (self.table.get(pair[0]), self.table.get(pair[1]));
                if a.ranges.is_empty() || b.ranges.is_empty() {
                    continue;
                }
                let seam = b.start();
                if a.end() != seam || entry_positions.contains(&seam) {
                    continue;
                }
                let (from, to) = match (a.operand, b.operand) {
                    (Some(from), Some(to)) => (from, to),
                    _ => {
                        return Err(CompileError::internal(format!(
                            "unassigned split half of v{}",
                            v
                        )))
                    }
                };
                if !from.is_same_location(&to) {
                    debug_assert!(seam % 2 != 0, "split seam off a gap");
                    lir.queue_move(seam, from, to);
                }
            }
        }
        Ok(())
    }

    /// Insert movements on block edges: wherever a value changed location
    /// across a control-flow edge, a gap move reconciles the two sides.
    pub fn resolve_data_flow(
        &self,
        lir: &mut LirFunction,
        liveness: &Liveness,
    ) -> CompileResult<()> {
        let block_count = lir.blocks.len();
        for pi in 0..block_count {
            let pred = &lir.blocks[pi];
            let pred_id = pred.id;
            let pred_end = pred.end;
            let single_succ = pred.succs.len() == 1;
            let trailing_gap = pred.last_gap_pos();
            let succs: Vec<_> = pred.succs.iter().copied().collect();

            // Phi destinations written in this block's trailing gap must not
            // be re-resolved; the phi move itself writes the successor-side
            // location.
            let phi_dsts: HashSet<VirtualId> = if single_succ {
                lir.gap(trailing_gap)
                    .map(|gap| {
                        gap.pending
                            .iter()
                            .filter_map(|(_, dst)| match dst {
                                Operand::Virtual(v) => Some(*v),
                                _ => None,
                            })
                            .collect()
                    })
                    .unwrap_or_default()
            } else {
                HashSet::new()
            };

            for succ_id in succs {
                let succ = lir.block(succ_id);
                let succ_start = succ.start;
                let si = lir.block_linear_index(succ_id);
                let gap_pos = if single_succ {
                    trailing_gap
                } else if succ.preds.len() == 1 {
                    succ.entry_gap_pos()
                } else {
                    return Err(CompileError::internal(format!(
                        "critical edge b{} -> b{} survived splitting",
                        pred_id.0, succ_id.0
                    )));
                };

                let mut moves: Vec<(Operand, Operand)> = Vec::new();
                for v in liveness.live_in[si].iter() {
                    if phi_dsts.contains(&v) {
                        continue;
                    }
                    let from = self
                        .table
                        .operand_at_read(v, pred_end - 2)
                        .ok_or_else(|| {
                            CompileError::internal(format!(
                                "v{} live into b{} but unallocated at end of b{}",
                                v.0, succ_id.0, pred_id.0
                            ))
                        })?;
                    let to = self.table.operand_at(v, succ_start - 1).ok_or_else(|| {
                        CompileError::internal(format!(
                            "v{} live into b{} but unallocated at its start",
                            v.0, succ_id.0
                        ))
                    })?;
                    if !from.is_same_location(&to) {
                        moves.push((from, to));
                    }
                }
                for (from, to) in moves {
                    lir.queue_move(gap_pos, from, to);
                }
            }
        }
        Ok(())
    }

    /// Concretise pending gap pairs and serialise each gap with the
    /// parallel-move resolver.
    pub fn resolve_gaps(&mut self, lir: &mut LirFunction) -> CompileResult<()> {
        // Trailing gaps of single-successor blocks carry phi moves whose
        // destinations live on the successor side.
        let mut succ_side: Vec<(i32, i32)> = Vec::new(); // (gap pos, succ entry pos)
        for block in &lir.blocks {
            if block.succs.len() == 1 {
                let succ_start = lir.block(block.succs[0]).start;
                succ_side.push((block.last_gap_pos(), succ_start - 1));
            }
        }

        let positions: Vec<i32> = lir.gaps.keys().copied().collect();
        for pos in positions {
            let dst_pos = succ_side
                .iter()
                .find(|&&(gap, _)| gap == pos)
                .map(|&(_, succ)| succ)
                .unwrap_or(pos);

            let pending = lir.gaps.get(&pos).map(|g| g.pending.clone()).unwrap_or_default();
            let mut concrete = Vec::with_capacity(pending.len());
            for (src, dst) in pending {
                let src = match src {
                    Operand::Virtual(v) => {
                        self.table.operand_at_read(v, pos).ok_or_else(|| {
                            CompileError::internal(format!(
                                "move source v{} unallocated at {}",
                                v.0, pos
                            ))
                        })?
                    }
                    other => other,
                };
                let dst = match dst {
                    Operand::Virtual(v) => {
                        // Dead phis have no successor-side interval; their
                        // destination is the location at the gap itself.
                        self.table
                            .operand_at(v, dst_pos)
                            .or_else(|| self.table.operand_at(v, pos))
                            .ok_or_else(|| {
                                CompileError::internal(format!(
                                    "move destination v{} unallocated at {}",
                                    v.0, dst_pos
                                ))
                            })?
                    }
                    other => other,
                };
                concrete.push((src, dst));
            }

            let mut cycles = 0usize;
            let resolved = {
                let mut scratch_err = None;
                let moves = {
                    let mut provider = || {
                        cycles += 1;
                        match self.free_scratch_at(pos, &concrete) {
                            Ok(op) => op,
                            Err(e) => {
                                scratch_err = Some(e);
                                // The resolver still needs an operand; the
                                // error is surfaced right after.
                                Operand::Spill(SpillSlot(u32::MAX))
                            }
                        }
                    };
                    resolve_parallel_moves(&concrete, &mut provider)?
                };
                if let Some(e) = scratch_err {
                    return Err(e);
                }
                moves
            };

            for _ in 0..cycles {
                self.session.record_cycle_broken();
            }
            self.session.record_moves_resolved(resolved.len());
            let gap = lir.gap_mut(pos);
            gap.pending.clear();
            gap.moves = resolved;
        }
        Ok(())
    }

    /// Cheapest scratch compatible with a cycle at `pos`: an unused register
    /// when one exists, a (shared) spill slot otherwise.
    fn free_scratch_at(&mut self, pos: i32, pairs: &[(Operand, Operand)]) -> CompileResult<Operand> {
        'regs: for r in 0..self.target.register_count {
            let reg = Reg(r);
            let candidate = Operand::Register(reg);
            for (src, dst) in pairs {
                if candidate.is_same_location(src) || candidate.is_same_location(dst) {
                    continue 'regs;
                }
            }
            if self
                .table
                .get(self.table.fixed_for_reg(reg))
                .covers_read(pos)
            {
                continue;
            }
            let busy = self.table.ids().any(|id| {
                let interval = self.table.get(id);
                !interval.is_fixed()
                    && interval.operand == Some(candidate)
                    && interval.covers_read(pos)
            });
            if !busy {
                return Ok(candidate);
            }
        }

        let slot = match self.scratch_slot {
            Some(slot) => slot,
            None => {
                let slot = SpillSlot(self.next_spill);
                self.next_spill += 1;
                if self.next_spill > self.target.spill_budget {
                    return Err(CompileError::FrameBudget {
                        slots: self.next_spill,
                        budget: self.target.spill_budget,
                    });
                }
                self.scratch_slot = Some(slot);
                slot
            }
        };
        Ok(Operand::Spill(slot))
    }
}
