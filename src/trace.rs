//! Trace sessions and attribution of trace events to builds.
//!
//! A [`TraceSource`] opens sessions; a [`TraceSession`] pumps events into a
//! [`TraceCollector`] until its stop token is cancelled from another task.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::runner::{Timeline, TimelineEvent};
use crate::types::{JittedMethods, TraceFacts};

// --- Events ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TraceCategory {
    Jit,
    Loader,
}

impl std::fmt::Display for TraceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceCategory::Jit => write!(f, "jit"),
            TraceCategory::Loader => write!(f, "loader"),
        }
    }
}

pub fn parse_trace_category(s: &str) -> Result<TraceCategory, String> {
    match s.to_lowercase().as_str() {
        "jit" => Ok(TraceCategory::Jit),
        "loader" => Ok(TraceCategory::Loader),
        _ => Err(format!(
            "Invalid trace category '{}': expected jit or loader",
            s
        )),
    }
}

/// One event from the trace stream, keyed by the pid that emitted it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceEvent {
    pub pid: u32,
    pub category: TraceCategory,
    pub module: String,
    /// Empty for loader events.
    pub method: String,
}

impl TraceEvent {
    pub fn jit(pid: u32, module: &str, method: &str) -> Self {
        Self {
            pid,
            category: TraceCategory::Jit,
            module: module.to_string(),
            method: method.to_string(),
        }
    }

    pub fn loader(pid: u32, module: &str) -> Self {
        Self {
            pid,
            category: TraceCategory::Loader,
            module: module.to_string(),
            method: String::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("cannot open trace session '{session}': {reason}")]
    Open { session: String, reason: String },

    #[error("trace stream failed: {0}")]
    Stream(String),
}

// --- Source / session traits ---

pub trait TraceSource: Send + Sync + 'static {
    type Session: TraceSession;

    fn open(
        &self,
        session_name: &str,
        categories: &[TraceCategory],
    ) -> Result<Self::Session, TraceError>;
}

pub trait TraceSession: Send + 'static {
    /// Cancelling this token makes `process_stream` return.
    fn stop_token(&self) -> CancellationToken;

    /// Pump events into `collector` until stopped.
    fn process_stream(
        &mut self,
        collector: &mut TraceCollector,
    ) -> impl Future<Output = Result<(), TraceError>> + Send;

    fn stop(&self) {
        self.stop_token().cancel();
    }
}

// --- Collector ---

/// Accumulates distinct jitted methods per pid for one session.
#[derive(Debug, Default)]
pub struct TraceCollector {
    by_pid: HashMap<u32, JittedMethods>,
    jit_events: usize,
    loader_events: usize,
}

impl TraceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: TraceEvent) {
        match event.category {
            TraceCategory::Jit => {
                self.jit_events += 1;
                self.by_pid
                    .entry(event.pid)
                    .or_default()
                    .entry(event.module)
                    .or_default()
                    .insert(event.method);
            }
            TraceCategory::Loader => self.loader_events += 1,
        }
    }

    pub fn jit_event_count(&self) -> usize {
        self.jit_events
    }

    pub fn loader_event_count(&self) -> usize {
        self.loader_events
    }

    /// Take the facts gathered for `pid`. A pid is handed out once.
    pub fn take_facts(&mut self, pid: Option<u32>) -> TraceFacts {
        match pid.and_then(|pid| self.by_pid.remove(&pid)) {
            Some(methods) if !methods.is_empty() => TraceFacts::Collected(methods),
            _ => TraceFacts::NotAvailable,
        }
    }
}

// --- Mock source ---

#[derive(Default)]
struct MockTraceState {
    live: Option<mpsc::UnboundedSender<TraceEvent>>,
    opened: usize,
}

/// In-process trace source for tests.
///
/// Events reach the currently open session through a [`TraceEmitter`]. Opening
/// a session while another is still live fails, so overlapping sessions show
/// up as a run error.
#[derive(Clone, Default)]
pub struct MockTraceSource {
    state: Arc<Mutex<MockTraceState>>,
    timeline: Timeline,
    /// Opens beyond this many fail.
    open_limit: Option<usize>,
}

impl MockTraceSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source whose `open` always fails.
    pub fn failing() -> Self {
        Self::failing_after(0)
    }

    /// A source that opens `successful` sessions, then fails every `open`.
    pub fn failing_after(successful: usize) -> Self {
        Self {
            open_limit: Some(successful),
            ..Self::default()
        }
    }

    pub fn with_timeline(mut self, timeline: Timeline) -> Self {
        self.timeline = timeline;
        self
    }

    pub fn emitter(&self) -> TraceEmitter {
        TraceEmitter {
            state: Arc::clone(&self.state),
        }
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.lock().map(|s| s.opened).unwrap_or(0)
    }
}

impl TraceSource for MockTraceSource {
    type Session = MockTraceSession;

    fn open(
        &self,
        session_name: &str,
        _categories: &[TraceCategory],
    ) -> Result<MockTraceSession, TraceError> {
        let open_error = |reason: &str| TraceError::Open {
            session: session_name.to_string(),
            reason: reason.to_string(),
        };
        let mut state = self
            .state
            .lock()
            .map_err(|_| open_error("mock state poisoned"))?;
        if self.open_limit.is_some_and(|limit| state.opened >= limit) {
            return Err(open_error("mock source configured to fail"));
        }
        if state.live.is_some() {
            return Err(open_error("another session is still open"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.live = Some(tx);
        state.opened += 1;
        let number = state.opened;
        self.timeline
            .push(TimelineEvent::SessionOpened { session: number });

        Ok(MockTraceSession {
            number,
            rx,
            token: CancellationToken::new(),
            state: Arc::clone(&self.state),
            timeline: self.timeline.clone(),
        })
    }
}

/// Sends events into whichever mock session is currently open.
#[derive(Clone)]
pub struct TraceEmitter {
    state: Arc<Mutex<MockTraceState>>,
}

impl TraceEmitter {
    /// Returns false when no session is open (the event is lost).
    pub fn emit(&self, event: TraceEvent) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        match &state.live {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

pub struct MockTraceSession {
    number: usize,
    rx: mpsc::UnboundedReceiver<TraceEvent>,
    token: CancellationToken,
    state: Arc<Mutex<MockTraceState>>,
    timeline: Timeline,
}

impl MockTraceSession {
    fn close(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if state.live.take().is_some() {
                self.timeline.push(TimelineEvent::SessionStopped {
                    session: self.number,
                });
            }
        }
    }
}

impl TraceSession for MockTraceSession {
    fn stop_token(&self) -> CancellationToken {
        self.token.clone()
    }

    async fn process_stream(&mut self, collector: &mut TraceCollector) -> Result<(), TraceError> {
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                Some(event) = self.rx.recv() => collector.record(event),
            }
        }
        self.close();
        while let Ok(event) = self.rx.try_recv() {
            collector.record(event);
        }
        Ok(())
    }
}

impl Drop for MockTraceSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_dedups_methods_per_module() {
        let mut collector = TraceCollector::new();
        collector.record(TraceEvent::jit(10, "System.Linq", "Enumerable.Where"));
        collector.record(TraceEvent::jit(10, "System.Linq", "Enumerable.Where"));
        collector.record(TraceEvent::jit(10, "System.Linq", "Enumerable.Select"));
        collector.record(TraceEvent::jit(11, "App", "Program.Main"));
        collector.record(TraceEvent::loader(10, "System.Linq"));

        assert_eq!(collector.jit_event_count(), 4);
        assert_eq!(collector.loader_event_count(), 1);

        let facts = collector.take_facts(Some(10));
        assert_eq!(facts.method_count(), 2);
        // Handed out once
        assert_eq!(collector.take_facts(Some(10)), TraceFacts::NotAvailable);
        assert_eq!(collector.take_facts(Some(11)).method_count(), 1);
    }

    #[test]
    fn collector_without_pid_is_not_available() {
        let mut collector = TraceCollector::new();
        collector.record(TraceEvent::jit(10, "A", "B"));
        assert_eq!(collector.take_facts(None), TraceFacts::NotAvailable);
        assert_eq!(collector.take_facts(Some(99)), TraceFacts::NotAvailable);
    }

    #[test]
    fn parse_category() {
        assert_eq!(parse_trace_category("JIT").unwrap(), TraceCategory::Jit);
        assert_eq!(parse_trace_category("loader").unwrap(), TraceCategory::Loader);
        assert!(parse_trace_category("gc").is_err());
    }

    #[tokio::test]
    async fn mock_session_stops_and_drains() {
        let source = MockTraceSource::new();
        let emitter = source.emitter();
        let mut session = source.open("test", &[TraceCategory::Jit]).unwrap();
        assert!(emitter.emit(TraceEvent::jit(1, "M", "a")));

        let token = session.stop_token();
        token.cancel();
        let mut collector = TraceCollector::new();
        session.process_stream(&mut collector).await.unwrap();

        assert_eq!(collector.jit_event_count(), 1);
        assert!(!emitter.emit(TraceEvent::jit(1, "M", "b")));
    }

    #[tokio::test]
    async fn mock_source_rejects_overlapping_sessions() {
        let source = MockTraceSource::new();
        let _first = source.open("one", &[]).unwrap();
        assert!(matches!(
            source.open("two", &[]),
            Err(TraceError::Open { .. })
        ));
    }
}
