use std::ops::Range;
use std::sync::Arc;

use crate::run_error::RunError;
use crate::runner::ProcessRunner;
use crate::scheduler::run_slots;
use crate::trace::{TraceCategory, TraceCollector, TraceSession, TraceSource};
use crate::trace_log;
use crate::types::{TraceFacts, WorkItem};
use crate::{log_debug, log_info, log_warn};

/// Builds per trace session when running in parallel.
pub const DEFAULT_TRACE_BATCH_SIZE: usize = 10;

pub const DEFAULT_SESSION_NAME: &str = "BuildGolemSession";

/// Settings for trace-collection mode.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceOptions {
    pub session_name: String,
    pub categories: Vec<TraceCategory>,
    /// Batch size used when more than one build runs at a time.
    pub batch_size: usize,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            session_name: DEFAULT_SESSION_NAME.to_string(),
            categories: vec![TraceCategory::Jit, TraceCategory::Loader],
            batch_size: DEFAULT_TRACE_BATCH_SIZE,
        }
    }
}

/// Batch size for a run at the given parallelism.
///
/// Sequential runs trace one build per session.
pub fn batch_size_for(degree_of_parallelism: usize, configured: usize) -> usize {
    if degree_of_parallelism <= 1 {
        1
    } else {
        configured.max(1)
    }
}

/// Split `0..total` into consecutive ranges of at most `batch_size`.
pub fn plan_batches(total: usize, batch_size: usize) -> Vec<Range<usize>> {
    let batch_size = batch_size.max(1);
    (0..total)
        .step_by(batch_size)
        .map(|start| start..(start + batch_size).min(total))
        .collect()
}

/// Result of a traced run.
#[derive(Debug)]
pub struct TracedRun {
    /// Completed items, batch by batch.
    pub items: Vec<WorkItem>,
    pub batches: usize,
    /// Sessions actually opened; less than `batches` when a later open failed.
    pub sessions: usize,
}

/// Run ordered `items` in batches, one trace session per batch.
///
/// Process ids get recycled by the OS, so a session only stays open for one
/// batch: that keeps the window in which a pid could be reused short. For
/// each batch the scheduler runs on a background task while this task pumps
/// the trace stream; the session is stopped once the scheduler reports the
/// batch done, then events are attributed to the builds by pid.
///
/// If the first session cannot be opened the run is aborted before anything
/// launches. A later batch whose session fails to open still runs, and its
/// traced builds get `TraceFacts::NotAvailable`.
pub async fn run_traced<R, S>(
    items: Vec<WorkItem>,
    runner: Arc<R>,
    source: &S,
    degree_of_parallelism: usize,
    options: &TraceOptions,
) -> Result<TracedRun, RunError>
where
    R: ProcessRunner,
    S: TraceSource,
{
    let total = items.len();
    let batch_size = batch_size_for(degree_of_parallelism, options.batch_size);
    let plan = plan_batches(total, batch_size);
    let batch_count = plan.len();
    log_info!(
        "[trace] {} builds in {} batch(es) of up to {}",
        total,
        batch_count,
        batch_size
    );

    let mut pending = items.into_iter();
    let mut completed = Vec::with_capacity(total);
    let mut sessions = 0;

    for (number, range) in plan.into_iter().enumerate() {
        let batch: Vec<WorkItem> = pending.by_ref().take(range.len()).collect();
        let label = format!("[batch {}/{}]", number + 1, batch_count);

        let session = match source.open(&options.session_name, &options.categories) {
            Ok(session) => Some(session),
            Err(e) if number == 0 => return Err(e.into()),
            Err(e) => {
                log_warn!("{} {}; running this batch without tracing", label, e);
                None
            }
        };

        let (mut done, mut collector) = match session {
            Some(session) => {
                sessions += 1;
                log_debug!("{} session '{}' open", label, options.session_name);
                run_in_session(
                    session,
                    batch,
                    Arc::clone(&runner),
                    range.start,
                    total,
                    degree_of_parallelism,
                    &label,
                )
                .await?
            }
            None => {
                let done = run_slots(
                    batch,
                    range.start,
                    total,
                    degree_of_parallelism,
                    runner.as_ref(),
                )
                .await;
                (done, TraceCollector::new())
            }
        };

        attach_facts(&mut done, &mut collector);
        done.sort_by_key(|item| item.record().map(|r| r.ordinal));
        completed.extend(done);
    }

    Ok(TracedRun {
        items: completed,
        batches: batch_count,
        sessions,
    })
}

/// Run one batch on a background task while `session` streams events.
///
/// The session is stopped when the scheduler task ends, whether it returns
/// or panics, and is dropped before this returns.
async fn run_in_session<R, T>(
    mut session: T,
    batch: Vec<WorkItem>,
    runner: Arc<R>,
    first_ordinal: usize,
    total: usize,
    degree_of_parallelism: usize,
    label: &str,
) -> Result<(Vec<WorkItem>, TraceCollector), RunError>
where
    R: ProcessRunner,
    T: TraceSession,
{
    let stop = session.stop_token();
    let scheduler = tokio::spawn(async move {
        let _stop = stop.drop_guard();
        run_slots(
            batch,
            first_ordinal,
            total,
            degree_of_parallelism,
            runner.as_ref(),
        )
        .await
    });

    let mut collector = TraceCollector::new();
    let streamed = session.process_stream(&mut collector).await;
    if streamed.is_err() {
        // The stream died early; the batch still has to finish before the
        // session can go away.
        session.stop();
    }
    let joined = scheduler.await;
    drop(session);
    log_debug!("{} session closed", label);

    let done = joined.map_err(|e| RunError::SchedulerPanicked(e.to_string()))?;
    if let Err(e) = streamed {
        log_warn!("{} {}; trace facts for this batch are unavailable", label, e);
        collector = TraceCollector::new();
    }
    Ok((done, collector))
}

/// Give every traced item the facts of the pid it ran as, and append them to
/// its log when it has one.
fn attach_facts(items: &mut [WorkItem], collector: &mut TraceCollector) {
    for item in items.iter_mut().filter(|i| i.collect_trace()) {
        let facts = collector.take_facts(item.pid());
        if facts == TraceFacts::NotAvailable {
            log_debug!("[trace] no jitted methods for item {}", item.id());
        }
        if let Some(log_path) = &item.command().log_path {
            if let Err(e) = trace_log::append_trace_facts(log_path, &facts) {
                log_warn!("Warning: {}", e);
            }
        }
        item.attach_trace(facts);
    }
}
