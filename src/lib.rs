//! Cinder - JIT back-end for a small dynamic scripting language.
//!
//! The crate takes an SSA control-flow graph (HIR), lowers it to a low-level
//! stream with explicit operand constraints (LIR), allocates registers with a
//! linear-scan walk over live intervals, and resolves every block edge and
//! phi join into an ordered sequence of moves an assembler can emit directly.
//!
//! # Primary Usage
//!
//! ```
//! use bumpalo::Bump;
//! use cinder::{compile_function, CompilationSession, HirGraph, HirOp, Target};
//!
//! let mut hir = HirGraph::new();
//! let entry = hir.entry();
//! hir.append(entry, HirOp::Entry, &[]);
//! let (_, v) = hir.append(entry, HirOp::LoadRoot { index: 0 }, &[]);
//! hir.append(entry, HirOp::Return, &[v.unwrap()]);
//!
//! // Every compilation lives in its own zone; dropping the arena discards
//! // all of it.
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let lir = compile_function(&session, &mut hir, &Target::x64()).unwrap();
//! assert_eq!(lir.frame_slots, 0);
//! ```
//!
//! # Architecture
//!
//! - [`hir`] - SSA control-flow graph and builder
//! - [`lir`] - low-level stream, operands, gaps and lowering
//! - [`regalloc`] - liveness, live intervals and the linear-scan walk
//! - [`moves`] - parallel-move resolution for gaps and edges
//! - [`target`] - register bank, caller-saved set and pinnings
//! - [`session`] - zone arena and compilation statistics
//! - [`assembler`] - contract towards the machine-code emitter

pub mod assembler;
pub mod driver;
pub mod error;
pub mod hir;
pub mod lir;
pub mod moves;
pub mod regalloc;
pub mod session;
pub mod target;

pub use assembler::Assembler;
pub use driver::compile_function;
pub use error::{CompileError, CompileResult};
pub use hir::{BinOpKind, BlockId, HirGraph, HirOp, InstrId, ScopeSlot, ValueId};
pub use lir::{
    Gap, LirFunction, LirInstruction, LirOp, MoveOp, Operand, SpillSlot, StubRef, UseKind,
    VirtualId,
};
pub use moves::resolve_parallel_moves;
pub use regalloc::{Allocator, IntervalTable, Liveness};
pub use session::{CompilationSession, SessionStats};
pub use target::{Pinning, Reg, RegSet, Target};
