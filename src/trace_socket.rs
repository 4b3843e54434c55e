use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::trace::{
    parse_trace_category, TraceCategory, TraceCollector, TraceError, TraceEvent, TraceSession,
    TraceSource,
};
use crate::{log_debug, log_warn};

/// How long connected writers get to flush after the session is stopped.
const DRAIN_GRACE_MS: u64 = 500;

/// Trace source fed over a Unix socket.
///
/// Traced builds find the socket through `BUILD_GOLEM_TRACE_SOCKET` and write
/// one event per line: `<pid> <category> <module> [<method>]`.
#[derive(Debug, Clone)]
pub struct SocketTraceSource {
    socket_path: PathBuf,
}

impl SocketTraceSource {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl TraceSource for SocketTraceSource {
    type Session = SocketTraceSession;

    fn open(
        &self,
        session_name: &str,
        categories: &[TraceCategory],
    ) -> Result<SocketTraceSession, TraceError> {
        let open_error = |reason: String| TraceError::Open {
            session: session_name.to_string(),
            reason,
        };

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                open_error(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        // Unconditional remove of a stale socket from an earlier run
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => log_debug!(
                "[trace] Removed stale socket {}",
                self.socket_path.display()
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(open_error(format!(
                    "Failed to remove stale socket {}: {}",
                    self.socket_path.display(),
                    e
                )))
            }
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            open_error(format!(
                "Failed to bind {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;
        log_debug!(
            "[trace] Session '{}' listening on {}",
            session_name,
            self.socket_path.display()
        );

        Ok(SocketTraceSession {
            name: session_name.to_string(),
            socket_path: self.socket_path.clone(),
            listener,
            categories: categories.iter().copied().collect(),
            token: CancellationToken::new(),
        })
    }
}

pub struct SocketTraceSession {
    name: String,
    socket_path: PathBuf,
    listener: UnixListener,
    categories: HashSet<TraceCategory>,
    token: CancellationToken,
}

impl TraceSession for SocketTraceSession {
    fn stop_token(&self) -> CancellationToken {
        self.token.clone()
    }

    async fn process_stream(&mut self, collector: &mut TraceCollector) -> Result<(), TraceError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<TraceEvent>();
        let mut readers = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        readers.spawn(read_events(stream, self.categories.clone(), tx.clone()));
                    }
                    Err(e) => {
                        readers.abort_all();
                        return Err(TraceError::Stream(format!(
                            "accept on {} failed: {}",
                            self.socket_path.display(),
                            e
                        )));
                    }
                },
                Some(event) = rx.recv() => collector.record(event),
            }
        }

        // Builds of this session have exited; give their connections a moment
        // to reach EOF before cutting them off.
        drop(tx);
        let drained = tokio::time::timeout(Duration::from_millis(DRAIN_GRACE_MS), async {
            while let Some(event) = rx.recv().await {
                collector.record(event);
            }
        })
        .await;
        if drained.is_err() {
            log_warn!(
                "[trace] Session '{}': {} connection(s) still open after stop, dropping them",
                self.name,
                readers.len()
            );
        }
        readers.abort_all();
        while let Ok(event) = rx.try_recv() {
            collector.record(event);
        }

        log_debug!(
            "[trace] Session '{}' stopped ({} jit, {} loader events)",
            self.name,
            collector.jit_event_count(),
            collector.loader_event_count()
        );
        Ok(())
    }
}

impl Drop for SocketTraceSession {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log_warn!(
                    "Warning: Failed to remove trace socket {}: {}",
                    self.socket_path.display(),
                    e
                );
            }
        }
    }
}

async fn read_events(
    stream: UnixStream,
    categories: HashSet<TraceCategory>,
    tx: mpsc::UnboundedSender<TraceEvent>,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_event_line(&line) {
                Ok(Some(event)) if categories.contains(&event.category) => {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => log_debug!("[trace] Skipping malformed line '{}': {}", line, e),
            },
            Ok(None) => return,
            Err(e) => {
                log_debug!("[trace] Connection read failed: {}", e);
                return;
            }
        }
    }
}

/// Parse `<pid> <category> <module> [<method>]`. Blank lines yield `None`.
pub fn parse_event_line(line: &str) -> Result<Option<TraceEvent>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let mut fields = line.splitn(4, char::is_whitespace);
    let pid = fields
        .next()
        .ok_or("missing pid")?
        .parse::<u32>()
        .map_err(|e| format!("invalid pid: {}", e))?;
    let category = parse_trace_category(fields.next().ok_or("missing category")?)?;
    let module = fields.next().ok_or("missing module")?;
    let method = fields.next().map(str::trim).unwrap_or("");

    match category {
        TraceCategory::Jit if method.is_empty() => Err("jit event without method".to_string()),
        TraceCategory::Jit => Ok(Some(TraceEvent::jit(pid, module, method))),
        TraceCategory::Loader => Ok(Some(TraceEvent::loader(pid, module))),
    }
}
