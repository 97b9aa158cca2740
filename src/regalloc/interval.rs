// This module holds the live-interval data model the linear-scan walk works
// on. An interval owns a sorted list of disjoint half-open [start, end)
// ranges over linear positions and a chronologically ordered list of use
// positions, each tagged with the location kind the use demands. Splitting
// hands every range and use at or after the split position to a child
// interval; children hang off the original and are consulted by position
// when operands are concretised. Read positions are allowed to sit exactly
// on a range end: a gap move reads its sources before any move of the same
// gap writes, so a value whose range ends at a gap is still readable there.

//! Live ranges, uses and intervals.

use crate::lir::{Operand, UseKind, VirtualId};
use crate::target::Reg;

/// Index of an interval in the [`IntervalTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntervalId(pub u32);

impl IntervalId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A half-open `[start, end)` span of linear positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
    pub start: i32,
    pub end: i32,
}

impl LiveRange {
    pub fn new(start: i32, end: i32) -> Self {
        debug_assert!(start < end, "empty live range");
        Self { start, end }
    }

    pub fn covers(&self, pos: i32) -> bool {
        self.start <= pos && pos < self.end
    }

    pub fn intersects(&self, other: &LiveRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// One use of an interval, pinned to a linear position.
#[derive(Debug, Clone, Copy)]
pub struct UsePos {
    pub pos: i32,
    pub kind: UseKind,
}

impl UsePos {
    /// True when this use insists on some register.
    pub fn requires_register(&self) -> bool {
        matches!(self.kind, UseKind::Register | UseKind::Fixed(_))
    }
}

/// Normal intervals belong to virtual registers; fixed intervals reserve a
/// physical register over calling-convention-imposed ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalKind {
    Normal,
    Fixed,
}

/// The lifetime of one virtual register (or one physical reservation) as a
/// union of live ranges.
#[derive(Debug, Clone)]
pub struct Interval {
    /// Owning virtual register; `None` for fixed reservations.
    pub vreg: Option<VirtualId>,
    pub kind: IntervalKind,
    /// Disjoint, sorted ascending.
    pub ranges: Vec<LiveRange>,
    /// Sorted ascending by position.
    pub uses: Vec<UsePos>,
    /// Location chosen by the walk.
    pub operand: Option<Operand>,
    /// Set for split children.
    pub parent: Option<IntervalId>,
    /// Children of the original, sorted by start; empty on children.
    pub children: Vec<IntervalId>,
}

impl Interval {
    fn new(vreg: Option<VirtualId>, kind: IntervalKind) -> Self {
        Self {
            vreg,
            kind,
            ranges: Vec::new(),
            uses: Vec::new(),
            operand: None,
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.kind == IntervalKind::Fixed
    }

    pub fn start(&self) -> i32 {
        self.ranges.first().map_or(0, |r| r.start)
    }

    pub fn end(&self) -> i32 {
        self.ranges.last().map_or(0, |r| r.end)
    }

    /// True if some range strictly covers `pos`.
    pub fn covers(&self, pos: i32) -> bool {
        self.ranges
            .binary_search_by(|r| {
                if r.covers(pos) {
                    std::cmp::Ordering::Equal
                } else if r.end <= pos {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Greater
                }
            })
            .is_ok()
    }

    /// True if `pos` is readable from this interval: covered, or sitting
    /// exactly on a range end (gap reads precede gap writes).
    pub fn covers_read(&self, pos: i32) -> bool {
        self.covers(pos) || self.ranges.iter().any(|r| r.end == pos)
    }

    /// Add a range during bottom-up construction; merges with overlapping or
    /// adjacent neighbours.
    pub fn add_live_range(&mut self, start: i32, end: i32) {
        debug_assert!(start < end);
        // Construction walks blocks bottom-up, so the common case prepends.
        let at = self
            .ranges
            .partition_point(|r| r.end < start);
        // Everything from `at` with start <= end merges into one range.
        let mut merged = LiveRange::new(start, end);
        let mut remove_until = at;
        while remove_until < self.ranges.len() && self.ranges[remove_until].start <= end {
            merged.start = merged.start.min(self.ranges[remove_until].start);
            merged.end = merged.end.max(self.ranges[remove_until].end);
            remove_until += 1;
        }
        self.ranges.splice(at..remove_until, [merged]);
    }

    /// Shorten the earliest range's start to `pos` (a definition found while
    /// walking backward).
    pub fn shorten_first_range(&mut self, pos: i32) {
        if let Some(first) = self.ranges.first_mut() {
            debug_assert!(pos <= first.end);
            first.start = pos;
        }
    }

    /// Record a use; keeps the list sorted.
    pub fn add_use(&mut self, pos: i32, kind: UseKind) {
        let at = self.uses.partition_point(|u| u.pos < pos);
        self.uses.insert(at, UsePos { pos, kind });
    }

    /// The earliest position at or after `from` where both intervals are
    /// live, if any.
    pub fn next_intersection(&self, other: &Interval, from: i32) -> Option<i32> {
        let mut best: Option<i32> = None;
        let mut i = 0;
        let mut j = 0;
        while i < self.ranges.len() && j < other.ranges.len() {
            let a = self.ranges[i];
            let b = other.ranges[j];
            if a.intersects(&b) {
                let at = a.start.max(b.start).max(from);
                if at < a.end.min(b.end) {
                    best = Some(at);
                    break;
                }
            }
            if a.end <= b.end {
                i += 1;
            } else {
                j += 1;
            }
        }
        best
    }

    /// Closest use at or after `pos`.
    pub fn next_use_after(&self, pos: i32) -> Option<UsePos> {
        let at = self.uses.partition_point(|u| u.pos < pos);
        self.uses.get(at).copied()
    }

    /// Closest register-requiring use at or after `pos`.
    pub fn next_register_use_after(&self, pos: i32) -> Option<UsePos> {
        let at = self.uses.partition_point(|u| u.pos < pos);
        self.uses[at..].iter().find(|u| u.requires_register()).copied()
    }
}

/// Arena-indexed interval storage plus the virtual-register and fixed-register
/// root maps.
pub struct IntervalTable {
    intervals: Vec<Interval>,
    /// Root interval per virtual register.
    by_vreg: Vec<IntervalId>,
    /// One fixed reservation interval per physical register.
    by_reg: Vec<IntervalId>,
}

impl IntervalTable {
    /// Create the table with one empty root per virtual register and one
    /// fixed reservation per physical register.
    pub fn new(virtual_count: u32, register_count: u8) -> Self {
        let mut intervals = Vec::with_capacity(virtual_count as usize + register_count as usize);
        let mut by_vreg = Vec::with_capacity(virtual_count as usize);
        for v in 0..virtual_count {
            by_vreg.push(IntervalId(intervals.len() as u32));
            intervals.push(Interval::new(Some(VirtualId(v)), IntervalKind::Normal));
        }
        let mut by_reg = Vec::with_capacity(register_count as usize);
        for r in 0..register_count {
            by_reg.push(IntervalId(intervals.len() as u32));
            let mut fixed = Interval::new(None, IntervalKind::Fixed);
            fixed.operand = Some(Operand::Register(Reg(r)));
            intervals.push(fixed);
        }
        Self {
            intervals,
            by_vreg,
            by_reg,
        }
    }

    pub fn get(&self, id: IntervalId) -> &Interval {
        &self.intervals[id.index()]
    }

    pub fn get_mut(&mut self, id: IntervalId) -> &mut Interval {
        &mut self.intervals[id.index()]
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = IntervalId> {
        (0..self.intervals.len() as u32).map(IntervalId)
    }

    pub fn vreg_root(&self, vreg: VirtualId) -> IntervalId {
        self.by_vreg[vreg.index()]
    }

    pub fn fixed_for_reg(&self, reg: Reg) -> IntervalId {
        self.by_reg[reg.index()]
    }

    /// Union a calling-convention reservation into `reg`'s fixed interval.
    /// Overlapping reservations merge; genuine double-pinning conflicts are
    /// detected by the lowering before they reach this point.
    pub fn reserve_fixed(&mut self, reg: Reg, start: i32, end: i32) {
        let id = self.by_reg[reg.index()];
        self.intervals[id.index()].add_live_range(start, end);
    }

    /// True when `reg` is already reserved over every position of
    /// `[start, end)`.
    pub fn fixed_covers(&self, reg: Reg, start: i32, end: i32) -> bool {
        let fixed = self.get(self.by_reg[reg.index()]);
        (start..end).all(|pos| fixed.covers(pos))
    }

    /// Split `id` at `pos`, handing every range and use at or after `pos` to
    /// a new child of the original. Returns the child id.
    pub fn split_at(&mut self, id: IntervalId, pos: i32) -> IntervalId {
        let root = self.root_of(id);
        let child_id = IntervalId(self.intervals.len() as u32);

        let source = &mut self.intervals[id.index()];
        debug_assert!(
            source.start() < pos && pos < source.end(),
            "split position {} outside interval [{}, {})",
            pos,
            source.start(),
            source.end()
        );

        let mut child_ranges = Vec::new();
        let mut keep_ranges = Vec::new();
        for range in source.ranges.drain(..) {
            if range.end <= pos {
                keep_ranges.push(range);
            } else if range.start >= pos {
                child_ranges.push(range);
            } else {
                keep_ranges.push(LiveRange::new(range.start, pos));
                child_ranges.push(LiveRange::new(pos, range.end));
            }
        }
        source.ranges = keep_ranges;

        let split_uses = source.uses.partition_point(|u| u.pos < pos);
        let child_uses = source.uses.split_off(split_uses);

        let vreg = source.vreg;
        let kind = source.kind;

        let mut child = Interval::new(vreg, kind);
        child.ranges = child_ranges;
        child.uses = child_uses;
        child.parent = Some(root);
        self.intervals.push(child);

        // Splits of children can land out of order; keep the list sorted by
        // start.
        self.intervals[root.index()].children.push(child_id);
        let mut children = std::mem::take(&mut self.intervals[root.index()].children);
        children.sort_by_key(|&c| self.intervals[c.index()].start());
        self.intervals[root.index()].children = children;

        child_id
    }

    fn root_of(&self, id: IntervalId) -> IntervalId {
        match self.intervals[id.index()].parent {
            Some(parent) => parent,
            None => id,
        }
    }

    /// The interval of `vreg`'s family that strictly covers `pos`.
    pub fn child_covering(&self, vreg: VirtualId, pos: i32) -> Option<IntervalId> {
        let root = self.by_vreg[vreg.index()];
        if self.get(root).covers(pos) {
            return Some(root);
        }
        self.get(root)
            .children
            .iter()
            .copied()
            .find(|&c| self.get(c).covers(pos))
    }

    /// The interval of `vreg`'s family readable at `pos`: prefers the child
    /// whose range ends exactly at `pos` (the pre-gap location), falling back
    /// to strict coverage.
    pub fn child_covering_read(&self, vreg: VirtualId, pos: i32) -> Option<IntervalId> {
        let root = self.by_vreg[vreg.index()];
        let family = std::iter::once(root).chain(self.get(root).children.iter().copied());
        let mut covering = None;
        for id in family {
            let interval = self.get(id);
            if interval.ranges.iter().any(|r| r.end == pos) {
                return Some(id);
            }
            if interval.covers(pos) {
                covering = Some(id);
            }
        }
        covering
    }

    /// The concrete operand of `vreg` at a write position.
    pub fn operand_at(&self, vreg: VirtualId, pos: i32) -> Option<Operand> {
        self.child_covering(vreg, pos)
            .and_then(|id| self.get(id).operand)
    }

    /// The concrete operand of `vreg` at a read position.
    pub fn operand_at_read(&self, vreg: VirtualId, pos: i32) -> Option<Operand> {
        self.child_covering_read(vreg, pos)
            .and_then(|id| self.get(id).operand)
    }
}
