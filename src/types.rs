use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// --- Commands ---

/// One subprocess invocation. The core never interprets it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct BuildCommand {
    pub name: String,
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Standard output and error are redirected here when set.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl BuildCommand {
    pub fn new(name: &str, program: impl Into<PathBuf>, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    /// `<program> <args>` as shown in progress lines.
    pub fn display_line(&self) -> String {
        let mut line = self.program.display().to_string();
        if !self.args.is_empty() {
            line.push(' ');
            line.push_str(&self.args.join(" "));
        }
        line
    }
}

// --- Outcomes ---

/// How a process ended, as reported by the process runner.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitState {
    Exited { code: i32 },
    /// Terminated by a signal (no exit code).
    Signaled,
    TimedOut { after_secs: u64 },
    LaunchFailed { reason: String },
    /// The runner lost track of the process (waiter task died).
    Lost { reason: String },
}

impl ExitState {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitState::Exited { code: 0 })
    }
}

impl std::fmt::Display for ExitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitState::Exited { code } => write!(f, "exit code {}", code),
            ExitState::Signaled => write!(f, "terminated by signal"),
            ExitState::TimedOut { after_secs } => write!(f, "timed out after {}s", after_secs),
            ExitState::LaunchFailed { reason } => write!(f, "launch failed: {}", reason),
            ExitState::Lost { reason } => write!(f, "lost: {}", reason),
        }
    }
}

/// What a finished process handle reports back to its slot.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessOutcome {
    pub pid: Option<u32>,
    pub exit: ExitState,
    pub duration: Duration,
}

impl ProcessOutcome {
    pub fn launch_failed(reason: impl Into<String>) -> Self {
        Self {
            pid: None,
            exit: ExitState::LaunchFailed {
                reason: reason.into(),
            },
            duration: Duration::ZERO,
        }
    }
}

// --- Trace facts ---

/// Distinct compiled method names, grouped by module.
pub type JittedMethods = BTreeMap<String, BTreeSet<String>>;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", content = "methods", rename_all = "snake_case")]
pub enum TraceFacts {
    Collected(JittedMethods),
    /// Tracing was requested but nothing could be attributed to the process.
    NotAvailable,
}

impl TraceFacts {
    pub fn method_count(&self) -> usize {
        match self {
            TraceFacts::Collected(methods) => methods.values().map(|m| m.len()).sum(),
            TraceFacts::NotAvailable => 0,
        }
    }
}

// --- Completion record ---

/// Final result of one work item, handed to the caller after the run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CompletionRecord {
    pub id: usize,
    pub name: String,
    /// Position in the cost-ordered launch sequence.
    pub ordinal: usize,
    pub pid: Option<u32>,
    pub exit: ExitState,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceFacts>,
}

impl CompletionRecord {
    pub fn is_success(&self) -> bool {
        self.exit.is_success()
    }
}

// --- Work items ---

#[derive(Clone, Debug, PartialEq)]
pub enum ItemState {
    NotStarted,
    Running { ordinal: usize, pid: Option<u32> },
    Completed(CompletionRecord),
}

/// One schedulable subprocess.
///
/// `id`, `command`, `cost` and `collect_trace` are fixed at construction;
/// only the state moves, and only forward.
#[derive(Clone, Debug)]
pub struct WorkItem {
    id: usize,
    command: BuildCommand,
    cost: u64,
    collect_trace: bool,
    state: ItemState,
}

impl WorkItem {
    pub fn new(id: usize, command: BuildCommand, cost: u64, collect_trace: bool) -> Self {
        Self {
            id,
            command,
            cost,
            collect_trace,
            state: ItemState::NotStarted,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn command(&self) -> &BuildCommand {
        &self.command
    }

    pub fn cost(&self) -> u64 {
        self.cost
    }

    pub fn collect_trace(&self) -> bool {
        self.collect_trace
    }

    pub fn state(&self) -> &ItemState {
        &self.state
    }

    /// Pid the item ran (or is running) as, if the launch got that far.
    pub fn pid(&self) -> Option<u32> {
        match &self.state {
            ItemState::NotStarted => None,
            ItemState::Running { pid, .. } => *pid,
            ItemState::Completed(record) => record.pid,
        }
    }

    pub fn record(&self) -> Option<&CompletionRecord> {
        match &self.state {
            ItemState::Completed(record) => Some(record),
            _ => None,
        }
    }

    pub fn into_record(self) -> Option<CompletionRecord> {
        match self.state {
            ItemState::Completed(record) => Some(record),
            _ => None,
        }
    }

    pub(crate) fn mark_running(&mut self, ordinal: usize, pid: Option<u32>) {
        assert!(
            self.state == ItemState::NotStarted,
            "work item {} launched twice (state: {:?})",
            self.id,
            self.state
        );
        self.state = ItemState::Running { ordinal, pid };
    }

    pub(crate) fn complete(&mut self, outcome: ProcessOutcome) {
        let ordinal = match self.state {
            ItemState::Running { ordinal, .. } => ordinal,
            ref other => panic!(
                "work item {} completed while not running (state: {:?})",
                self.id, other
            ),
        };
        self.state = ItemState::Completed(CompletionRecord {
            id: self.id,
            name: self.command.name.clone(),
            ordinal,
            pid: outcome.pid,
            exit: outcome.exit,
            duration_ms: u64::try_from(outcome.duration.as_millis()).unwrap_or(u64::MAX),
            trace: None,
        });
    }

    /// Attach trace facts to a completed item. Ignored for items that did
    /// not ask for tracing.
    pub(crate) fn attach_trace(&mut self, facts: TraceFacts) {
        if !self.collect_trace {
            return;
        }
        match &mut self.state {
            ItemState::Completed(record) => record.trace = Some(facts),
            other => panic!(
                "trace facts attached to unfinished work item {} (state: {:?})",
                self.id, other
            ),
        }
    }
}

// --- Run summary ---

/// Result of a full run, returned to the caller for display.
#[derive(Serialize, Debug, Default)]
pub struct RunSummary {
    pub degree_of_parallelism: usize,
    pub batches: usize,
    pub trace_sessions: usize,
    pub records: Vec<CompletionRecord>,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.records.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.records.len() - self.succeeded()
    }

    pub fn timed_out(&self) -> usize {
        self.count_exit(|e| matches!(e, ExitState::TimedOut { .. }))
    }

    pub fn launch_failed(&self) -> usize {
        self.count_exit(|e| matches!(e, ExitState::LaunchFailed { .. }))
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed() == 0
    }

    fn count_exit(&self, pred: impl Fn(&ExitState) -> bool) -> usize {
        self.records.iter().filter(|r| pred(&r.exit)).count()
    }
}
