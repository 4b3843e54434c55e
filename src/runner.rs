use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use nix::unistd::Pid;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::slot::CompletionNotifier;
use crate::types::{ExitState, ProcessOutcome, WorkItem};
use crate::{log_debug, log_warn};

/// Maximum time to wait for graceful shutdown after SIGTERM before sending SIGKILL.
const SIGTERM_GRACE_PERIOD_SECONDS: u64 = 5;

/// Polling interval when waiting for a process group to exit after SIGTERM.
const KILL_POLL_INTERVAL_MS: u64 = 100;

/// Environment variable telling a traced build where to send its trace events.
pub const TRACE_SOCKET_ENV: &str = "BUILD_GOLEM_TRACE_SOCKET";

/// Global shutdown flag shared with signal handlers.
fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// Check if a shutdown has been requested via signal.
pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

/// Install signal handlers for SIGTERM and SIGINT that set the shutdown flag.
pub fn install_signal_handlers() -> Result<(), String> {
    let flag = Arc::clone(shutdown_flag());
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| format!("Failed to register SIGTERM handler: {}", e))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map_err(|e| format!("Failed to register SIGINT handler: {}", e))?;
    Ok(())
}

// --- Process Registry ---

/// Process groups of every build currently running.
///
/// `std::sync::Mutex` because nothing under the lock awaits or does I/O.
fn process_registry() -> &'static Mutex<HashSet<Pid>> {
    static REGISTRY: OnceLock<Mutex<HashSet<Pid>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

fn register_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.insert(pgid);
    }
}

fn unregister_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.remove(&pgid);
    }
}

/// Registry entry for one running build, removed when dropped.
///
/// Owned by the waiter task, so the entry goes away exactly once: when the
/// build exits or when the waiter is aborted.
struct RegisteredGroup(Pid);

impl RegisteredGroup {
    fn register(pid: u32) -> Self {
        let pgid = Pid::from_raw(pid as i32);
        register_child(pgid);
        Self(pgid)
    }
}

impl Drop for RegisteredGroup {
    fn drop(&mut self) {
        unregister_child(self.0);
    }
}

/// Number of builds currently registered as running.
pub fn running_child_count() -> usize {
    process_registry().lock().map(|r| r.len()).unwrap_or(0)
}

/// Kill all registered build process groups.
///
/// Sends SIGTERM to every group, waits for the grace period, then SIGKILLs
/// survivors. The waiters of the killed builds report them as signaled, so
/// the run still finishes with a record per item.
pub fn kill_all_children() {
    use nix::sys::signal::{killpg, Signal};

    let pgids: Vec<Pid> = {
        let Ok(registry) = process_registry().lock() else {
            return;
        };
        registry.iter().copied().collect()
    };

    if pgids.is_empty() {
        return;
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGTERM);
    }

    let deadline = Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
    let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

    while Instant::now() < deadline {
        let all_gone = pgids
            .iter()
            .all(|&pgid| matches!(killpg(pgid, None), Err(nix::errno::Errno::ESRCH)));
        if all_gone {
            break;
        }
        std::thread::sleep(poll_interval);
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGKILL);
    }
}

// --- Runner traits ---

/// Starts one external process per work item.
///
/// `start` never fails: a process that cannot be spawned yields a handle that
/// is already finished with `ExitState::LaunchFailed`. The runner must drop
/// or fire `notifier` once the process has exited and `poll` would return
/// `Some`.
pub trait ProcessRunner: Send + Sync + 'static {
    type Handle: ProcessHandle;

    fn start(&self, item: &WorkItem, notifier: CompletionNotifier) -> Self::Handle;
}

/// Owned handle to one running process. Dropping it releases the process.
pub trait ProcessHandle: Send + 'static {
    fn pid(&self) -> Option<u32>;

    /// `None` while the process runs, its outcome once it has exited.
    fn poll(&mut self) -> Option<ProcessOutcome>;
}

/// Outcome slot shared by the real and mock handles.
enum Pending {
    Ready(ProcessOutcome),
    Waiting(oneshot::Receiver<ProcessOutcome>),
    Taken,
}

impl Pending {
    fn poll(&mut self) -> Option<ProcessOutcome> {
        match std::mem::replace(self, Pending::Taken) {
            Pending::Ready(outcome) => Some(outcome),
            Pending::Waiting(mut rx) => match rx.try_recv() {
                Ok(outcome) => Some(outcome),
                Err(oneshot::error::TryRecvError::Empty) => {
                    *self = Pending::Waiting(rx);
                    None
                }
                Err(oneshot::error::TryRecvError::Closed) => Some(ProcessOutcome {
                    pid: None,
                    exit: ExitState::Lost {
                        reason: "process waiter exited without reporting".to_string(),
                    },
                    duration: Duration::ZERO,
                }),
            },
            Pending::Taken => None,
        }
    }
}

// --- Command runner ---

/// Real runner: spawns each build as its own process group via `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    /// Kill builds that run longer than this.
    pub timeout: Option<Duration>,
    /// Exported to traced builds as `BUILD_GOLEM_TRACE_SOCKET`.
    pub trace_socket: Option<PathBuf>,
}

impl CommandRunner {
    pub fn new(timeout: Option<Duration>, trace_socket: Option<PathBuf>) -> Self {
        Self {
            timeout,
            trace_socket,
        }
    }

    fn build_command(&self, item: &WorkItem) -> Result<tokio::process::Command, String> {
        let build = item.command();
        let mut cmd = tokio::process::Command::new(&build.program);
        cmd.args(&build.args);
        cmd.envs(&build.env);
        if let Some(dir) = &build.working_dir {
            cmd.current_dir(dir);
        }
        if item.collect_trace() {
            if let Some(socket) = &self.trace_socket {
                cmd.env(TRACE_SOCKET_ENV, socket);
            }
        }

        // stdin MUST be null: the child runs in a background process group and
        // reading the terminal would stop it with SIGTTIN.
        cmd.stdin(Stdio::null());
        match &build.log_path {
            Some(path) => {
                let log = open_log(path, &build.display_line())?;
                let stderr = log
                    .try_clone()
                    .map_err(|e| format!("Failed to clone log handle {}: {}", path.display(), e))?;
                cmd.stdout(Stdio::from(log));
                cmd.stderr(Stdio::from(stderr));
            }
            None => {
                cmd.stdout(Stdio::inherit());
                cmd.stderr(Stdio::inherit());
            }
        }
        cmd.kill_on_drop(true);

        // SAFETY: pre_exec runs between fork() and exec() where only async-signal-safe
        // functions are permitted. setpgid is async-signal-safe per POSIX.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;
                Ok(())
            });
        }

        Ok(cmd)
    }
}

/// Create (truncate) the build log and write its header line.
fn open_log(path: &std::path::Path, command_line: &str) -> Result<File, String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create log directory {}: {}", parent.display(), e))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|e| format!("Failed to open log {}: {}", path.display(), e))?;
    writeln!(
        file,
        "# {} {}",
        chrono::Utc::now().to_rfc3339(),
        command_line
    )
    .map_err(|e| format!("Failed to write log {}: {}", path.display(), e))?;
    Ok(file)
}

impl ProcessRunner for CommandRunner {
    type Handle = CommandHandle;

    fn start(&self, item: &WorkItem, notifier: CompletionNotifier) -> CommandHandle {
        let started = Instant::now();

        let spawned = self.build_command(item).and_then(|mut cmd| {
            cmd.spawn().map_err(|e| {
                format!(
                    "Failed to spawn {}: {}",
                    item.command().program.display(),
                    e
                )
            })
        });
        let mut child = match spawned {
            Ok(child) => child,
            Err(reason) => {
                log_warn!("[runner] item {}: {}", item.id(), reason);
                notifier.notify();
                return CommandHandle {
                    pid: None,
                    pending: Pending::Ready(ProcessOutcome::launch_failed(reason)),
                    waiter: None,
                };
            }
        };

        let pid = child.id();
        let registered = pid.map(RegisteredGroup::register);
        log_debug!("[runner] item {} spawned (pid={:?})", item.id(), pid);

        let timeout = self.timeout;
        let (tx, rx) = oneshot::channel();
        let waiter = tokio::spawn(async move {
            let exit = wait_for_exit(&mut child, pid, timeout).await;
            drop(registered);
            let _ = tx.send(ProcessOutcome {
                pid,
                exit,
                duration: started.elapsed(),
            });
            notifier.notify();
        });

        CommandHandle {
            pid,
            pending: Pending::Waiting(rx),
            waiter: Some(waiter),
        }
    }
}

async fn wait_for_exit(
    child: &mut tokio::process::Child,
    pid: Option<u32>,
    timeout: Option<Duration>,
) -> ExitState {
    let waited = match timeout {
        None => child.wait().await,
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(waited) => waited,
            Err(_) => {
                log_debug!(
                    "[runner] pid {:?} TIMEOUT after {}s, killing process group",
                    pid,
                    limit.as_secs()
                );
                match pid {
                    Some(pid) => kill_process_group(pid as i32).await,
                    None => {
                        let _ = child.kill().await;
                    }
                }
                let _ = child.wait().await;
                return ExitState::TimedOut {
                    after_secs: limit.as_secs(),
                };
            }
        },
    };

    match waited {
        Ok(status) => match status.code() {
            Some(code) => ExitState::Exited { code },
            None => ExitState::Signaled,
        },
        Err(e) => ExitState::Lost {
            reason: format!("Error waiting for subprocess: {}", e),
        },
    }
}

/// Kill a process group by PID. Sends SIGTERM, polls for exit, then SIGKILL if needed.
///
/// The blocking poll-and-sleep loop runs on the tokio blocking thread pool
/// via `spawn_blocking` to avoid stalling async worker threads.
async fn kill_process_group(pgid: i32) {
    tokio::task::spawn_blocking(move || {
        use nix::sys::signal::{killpg, Signal};

        let pgid = Pid::from_raw(pgid);

        if let Err(nix::errno::Errno::ESRCH) = killpg(pgid, Signal::SIGTERM) {
            return;
        }

        let deadline = Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
        let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

        while Instant::now() < deadline {
            // Signal 0 checks if the process group exists without sending a signal
            match killpg(pgid, None) {
                Err(nix::errno::Errno::ESRCH) => return,
                _ => std::thread::sleep(poll_interval),
            }
        }

        let _ = killpg(pgid, Signal::SIGKILL);
    })
    .await
    .unwrap_or_else(|e| log_warn!("kill_process_group task panicked: {}", e));
}

/// Handle to a build spawned by `CommandRunner`.
///
/// Dropping it aborts the waiter task, which kills the child and removes
/// its registry entry if the build was still running.
pub struct CommandHandle {
    pid: Option<u32>,
    pending: Pending,
    waiter: Option<JoinHandle<()>>,
}

impl ProcessHandle for CommandHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn poll(&mut self) -> Option<ProcessOutcome> {
        self.pending.poll()
    }
}

impl Drop for CommandHandle {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            waiter.abort();
        }
    }
}

// --- Test doubles ---

/// Shared, ordered log of what happened during a run. Used by the mocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineEvent {
    Launched { id: usize },
    Exited { id: usize },
    SessionOpened { session: usize },
    SessionStopped { session: usize },
}

#[derive(Debug, Clone, Default)]
pub struct Timeline {
    events: Arc<Mutex<Vec<TimelineEvent>>>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: TimelineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    pub fn events(&self) -> Vec<TimelineEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Ids in launch order.
    pub fn launch_order(&self) -> Vec<usize> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                TimelineEvent::Launched { id } => Some(id),
                _ => None,
            })
            .collect()
    }
}

/// Scripted behaviour of one mock build.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub delay: Duration,
    pub exit: ExitState,
    /// `(module, method)` pairs emitted as trace events while the build runs.
    pub jitted: Vec<(String, String)>,
}

impl MockBehavior {
    pub fn exit(code: i32) -> Self {
        Self {
            delay: Duration::from_millis(5),
            exit: ExitState::Exited { code },
            jitted: Vec::new(),
        }
    }

    pub fn launch_failure(reason: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            exit: ExitState::LaunchFailed {
                reason: reason.to_string(),
            },
            jitted: Vec::new(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_jitted(mut self, module: &str, method: &str) -> Self {
        self.jitted.push((module.to_string(), method.to_string()));
        self
    }
}

/// Mock runner for scheduler tests.
///
/// Behaviour is looked up by build name, falling back to a default. Tracks
/// launch order and the peak number of simultaneously live processes.
pub struct MockProcessRunner {
    behaviors: HashMap<String, MockBehavior>,
    default: MockBehavior,
    timeline: Timeline,
    trace: Option<crate::trace::TraceEmitter>,
    next_pid: AtomicU32,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl MockProcessRunner {
    pub fn new() -> Self {
        Self {
            behaviors: HashMap::new(),
            default: MockBehavior::exit(0),
            timeline: Timeline::new(),
            trace: None,
            next_pid: AtomicU32::new(1000),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_behavior(mut self, name: &str, behavior: MockBehavior) -> Self {
        self.behaviors.insert(name.to_string(), behavior);
        self
    }

    pub fn with_default(mut self, behavior: MockBehavior) -> Self {
        self.default = behavior;
        self
    }

    pub fn with_timeline(mut self, timeline: Timeline) -> Self {
        self.timeline = timeline;
        self
    }

    /// Emit each traced build's `jitted` pairs into the live trace session.
    pub fn with_trace_emitter(mut self, emitter: crate::trace::TraceEmitter) -> Self {
        self.trace = Some(emitter);
        self
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn launch_count(&self) -> usize {
        self.timeline.launch_order().len()
    }
}

impl Default for MockProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner for MockProcessRunner {
    type Handle = MockHandle;

    fn start(&self, item: &WorkItem, notifier: CompletionNotifier) -> MockHandle {
        let behavior = self
            .behaviors
            .get(&item.command().name)
            .unwrap_or(&self.default)
            .clone();
        let id = item.id();
        self.timeline.push(TimelineEvent::Launched { id });

        if let ExitState::LaunchFailed { reason } = &behavior.exit {
            self.timeline.push(TimelineEvent::Exited { id });
            notifier.notify();
            return MockHandle {
                pid: None,
                pending: Pending::Ready(ProcessOutcome::launch_failed(reason.clone())),
                waiter: None,
            };
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);

        if item.collect_trace() {
            if let Some(emitter) = &self.trace {
                for (module, method) in &behavior.jitted {
                    emitter.emit(crate::trace::TraceEvent::jit(pid, module, method));
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        let active = Arc::clone(&self.active);
        let timeline = self.timeline.clone();
        let waiter = tokio::spawn(async move {
            tokio::time::sleep(behavior.delay).await;
            active.fetch_sub(1, Ordering::SeqCst);
            timeline.push(TimelineEvent::Exited { id });
            let _ = tx.send(ProcessOutcome {
                pid: Some(pid),
                exit: behavior.exit,
                duration: behavior.delay,
            });
            notifier.notify();
        });

        MockHandle {
            pid: Some(pid),
            pending: Pending::Waiting(rx),
            waiter: Some(waiter),
        }
    }
}

pub struct MockHandle {
    pid: Option<u32>,
    pending: Pending,
    waiter: Option<JoinHandle<()>>,
}

impl ProcessHandle for MockHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn poll(&mut self) -> Option<ProcessOutcome> {
        self.pending.poll()
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            waiter.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::CompletionSignal;
    use crate::types::BuildCommand;

    fn sh_item(script: &str) -> WorkItem {
        WorkItem::new(0, BuildCommand::new("sh", "sh", &["-c", script]), 0, false)
    }

    async fn run_to_exit(runner: &CommandRunner, item: &WorkItem) -> ProcessOutcome {
        let mut signal = CompletionSignal::new();
        let mut handle = runner.start(item, signal.notifier(0));
        signal.wait().await;
        handle.poll().expect("outcome available after notification")
    }

    #[tokio::test]
    async fn command_runner_reports_exit_code() {
        let outcome = run_to_exit(&CommandRunner::default(), &sh_item("exit 3")).await;
        assert_eq!(outcome.exit, ExitState::Exited { code: 3 });
        assert!(outcome.pid.is_some());
    }

    #[tokio::test]
    async fn command_runner_launch_failure_is_an_outcome() {
        let item = WorkItem::new(
            0,
            BuildCommand::new("missing", "/nonexistent/build-golem-tool", &[]),
            0,
            false,
        );
        let outcome = run_to_exit(&CommandRunner::default(), &item).await;
        assert!(
            matches!(outcome.exit, ExitState::LaunchFailed { .. }),
            "got {:?}",
            outcome.exit
        );
        assert_eq!(outcome.pid, None);
    }

    #[tokio::test]
    async fn command_runner_times_out_and_kills_group() {
        let runner = CommandRunner::new(Some(Duration::from_millis(200)), None);
        let outcome = run_to_exit(&runner, &sh_item("sleep 30")).await;
        assert_eq!(outcome.exit, ExitState::TimedOut { after_secs: 0 });
        assert!(outcome.duration < Duration::from_secs(20));
    }

    fn is_registered(pid: u32) -> bool {
        process_registry()
            .lock()
            .map(|r| r.contains(&Pid::from_raw(pid as i32)))
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn dropping_finished_handle_keeps_reused_pid_registered() {
        let runner = CommandRunner::default();
        let mut signal = CompletionSignal::new();
        let mut handle = runner.start(&sh_item("exit 0"), signal.notifier(0));
        let pid = handle.pid().unwrap();
        signal.wait().await;
        handle.poll().unwrap();
        assert!(!is_registered(pid));

        // Another build now owns a group with the same id
        register_child(Pid::from_raw(pid as i32));
        drop(handle);
        assert!(is_registered(pid));
        unregister_child(Pid::from_raw(pid as i32));
    }

    #[tokio::test]
    async fn dropping_running_handle_unregisters_it() {
        let runner = CommandRunner::default();
        let signal = CompletionSignal::new();
        let handle = runner.start(&sh_item("sleep 30"), signal.notifier(0));
        let pid = handle.pid().unwrap();
        assert!(is_registered(pid));

        drop(handle);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!is_registered(pid));
    }

    #[tokio::test]
    async fn pending_reports_lost_when_sender_dropped() {
        let (tx, rx) = oneshot::channel::<ProcessOutcome>();
        let mut pending = Pending::Waiting(rx);
        assert!(pending.poll().is_none());
        drop(tx);
        let outcome = pending.poll().unwrap();
        assert!(matches!(outcome.exit, ExitState::Lost { .. }));
    }
}
