use std::sync::Arc;

use crate::batch::{run_traced, TraceOptions};
use crate::run_error::RunError;
use crate::runner::ProcessRunner;
use crate::scheduler::{order_by_cost, run_slots};
use crate::trace::TraceSource;
use crate::types::{CompletionRecord, RunSummary, WorkItem};
use crate::{log_debug, log_info};

/// Upper bound on the requested degree of parallelism.
pub const MAX_DEGREE_OF_PARALLELISM: usize = 1024;

/// Options for [`run_parallel`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOptions {
    /// Maximum concurrent builds; 0 = logical processor count.
    pub degree_of_parallelism: usize,
    pub trace: TraceOptions,
}

/// Host logical processor count, at least 1.
pub fn logical_processor_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Effective parallelism for `item_count` builds.
///
/// 0 resolves to the logical processor count; the result never exceeds the
/// number of builds.
pub fn resolve_parallelism(requested: usize, item_count: usize) -> Result<usize, RunError> {
    if requested > MAX_DEGREE_OF_PARALLELISM {
        return Err(RunError::InvalidParallelism(format!(
            "{} exceeds the maximum of {}",
            requested, MAX_DEGREE_OF_PARALLELISM
        )));
    }
    let resolved = if requested == 0 {
        logical_processor_count()
    } else {
        requested
    };
    Ok(resolved.min(item_count))
}

/// Whether any build asked for trace collection.
pub fn needs_trace(items: &[WorkItem]) -> bool {
    items.iter().any(|i| i.collect_trace())
}

/// Run every build to completion.
///
/// Builds are ordered by descending cost once. When at least one build asks
/// for tracing the run goes through [`run_traced`]; otherwise the scheduler
/// runs once over the whole sequence and `trace_source` is never touched.
///
/// Returns one record per build, in the caller's item order. Failed builds
/// are records, not errors; only setup and trace-session failures are `Err`.
pub async fn run_parallel<R, S>(
    mut items: Vec<WorkItem>,
    runner: Arc<R>,
    trace_source: &S,
    options: &RunOptions,
) -> Result<RunSummary, RunError>
where
    R: ProcessRunner,
    S: TraceSource,
{
    let total = items.len();
    let degree_of_parallelism = resolve_parallelism(options.degree_of_parallelism, total)?;
    if total == 0 {
        log_info!("Nothing to build.");
        return Ok(RunSummary::default());
    }

    order_by_cost(&mut items);
    log_debug!(
        "Launch order (by cost): {:?}",
        items.iter().map(|i| i.id()).collect::<Vec<_>>()
    );

    let (completed, batches, trace_sessions) = if needs_trace(&items) {
        log_info!(
            "Running {} builds, parallelism {}, collecting traces",
            total,
            degree_of_parallelism
        );
        let traced = run_traced(
            items,
            runner,
            trace_source,
            degree_of_parallelism,
            &options.trace,
        )
        .await?;
        (traced.items, traced.batches, traced.sessions)
    } else {
        log_info!(
            "Running {} builds, parallelism {}",
            total,
            degree_of_parallelism
        );
        let done = run_slots(items, 0, total, degree_of_parallelism, runner.as_ref()).await;
        (done, 1, 0)
    };

    let mut records: Vec<CompletionRecord> = completed
        .into_iter()
        .filter_map(WorkItem::into_record)
        .collect();
    records.sort_by_key(|r| r.id);
    debug_assert_eq!(records.len(), total, "every build yields one record");

    Ok(RunSummary {
        degree_of_parallelism,
        batches,
        trace_sessions,
        records,
    })
}
