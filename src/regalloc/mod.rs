//! Register allocation: liveness, live intervals and the linear-scan walk.

pub mod allocator;
pub mod interval;
pub mod liveness;

pub use allocator::Allocator;
pub use interval::{Interval, IntervalId, IntervalKind, IntervalTable, LiveRange, UsePos};
pub use liveness::{analyze, build_intervals, BitSet, Liveness};
