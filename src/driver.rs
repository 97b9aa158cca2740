// This module strings the pipeline phases together for one function: split
// critical edges, linearise and verify the HIR, lower it to LIR, run
// liveness and interval construction, walk the intervals, then rewrite
// operands and resolve every gap and edge into ordered moves. Each phase
// owns the IR while it runs; the session only collects statistics. Any error
// aborts the compilation and the caller drops the zone.

//! Pipeline driver.

use log::debug;

use crate::error::CompileResult;
use crate::hir::HirGraph;
use crate::lir::{lowering, LirFunction};
use crate::regalloc::{analyze, build_intervals, Allocator};
use crate::session::CompilationSession;
use crate::target::Target;

/// Compile one function's HIR down to an allocated LIR stream.
pub fn compile_function(
    session: &CompilationSession<'_>,
    hir: &mut HirGraph,
    target: &Target,
) -> CompileResult<LirFunction> {
    hir.split_critical_edges();
    hir.linearise();
    hir.verify()?;

    let mut lir = lowering::lower(target, hir)?;
    let liveness = analyze(&lir);
    let table = build_intervals(session, &lir, &liveness, target.register_count);

    let mut allocator = Allocator::new(session, target, table, &lir);
    allocator.walk()?;
    allocator.assign_operands(&mut lir)?;
    allocator.resolve_splits(&mut lir)?;
    allocator.resolve_data_flow(&mut lir, &liveness)?;
    allocator.resolve_gaps(&mut lir)?;
    lir.frame_slots = allocator.frame_size();

    debug!(
        "compiled {} blocks, {} instructions, frame of {} slots",
        lir.blocks.len(),
        lir.instrs.len(),
        lir.frame_slots
    );
    Ok(lir)
}
