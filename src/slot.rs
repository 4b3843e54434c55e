use tokio::sync::mpsc;

use crate::log::percent;
use crate::runner::{ProcessHandle, ProcessRunner};
use crate::types::WorkItem;
use crate::{log_debug, log_progress};

// --- Completion signal ---

/// Wakes the scheduler loop when any slot's process exits.
///
/// Many writers (one notifier per launched process), one waiter. Every exit
/// leaves a token in the channel, so a wake-up can't be lost between a
/// rescan and the next wait.
pub struct CompletionSignal {
    tx: mpsc::UnboundedSender<usize>,
    rx: mpsc::UnboundedReceiver<usize>,
}

impl CompletionSignal {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Notifier handed to the runner for a process launched in `slot`.
    pub fn notifier(&self, slot: usize) -> CompletionNotifier {
        CompletionNotifier {
            slot,
            tx: self.tx.clone(),
        }
    }

    /// Block until some process exits. Returns the slot index it ran in.
    pub async fn wait(&mut self) -> usize {
        // The signal holds its own sender, so the channel never closes.
        self.rx.recv().await.unwrap_or(usize::MAX)
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Raised exactly once: explicitly via `notify`, or when dropped.
///
/// Runners move this into whatever waits on the process, so even a waiter
/// that panics wakes the scheduler.
pub struct CompletionNotifier {
    slot: usize,
    tx: mpsc::UnboundedSender<usize>,
}

impl CompletionNotifier {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn notify(self) {
        drop(self);
    }
}

impl Drop for CompletionNotifier {
    fn drop(&mut self) {
        // Receiver gone means the scheduler loop already returned.
        let _ = self.tx.send(self.slot);
    }
}

// --- Process slot ---

struct Occupant<H> {
    handle: H,
    item: WorkItem,
}

/// A reusable concurrency unit holding at most one running process.
pub struct ProcessSlot<H> {
    index: usize,
    occupant: Option<Occupant<H>>,
}

impl<H: ProcessHandle> ProcessSlot<H> {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            occupant: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_occupied(&self) -> bool {
        self.occupant.is_some()
    }

    /// Non-blocking availability check.
    ///
    /// Empty slot: `true`. Finished occupant: the handle is dropped, the item
    /// is completed and pushed to `finished`, `progress` advances, `true`.
    /// Running occupant: `false`, nothing changes.
    pub fn claim_or_check(&mut self, progress: &mut usize, finished: &mut Vec<WorkItem>) -> bool {
        let Some(occupant) = self.occupant.as_mut() else {
            return true;
        };
        let Some(outcome) = occupant.handle.poll() else {
            return false;
        };

        let Some(Occupant { handle, mut item }) = self.occupant.take() else {
            return true;
        };
        drop(handle);

        log_debug!(
            "[slot {}] item {} ({}) finished: {}",
            self.index,
            item.id(),
            item.command().name,
            outcome.exit
        );
        item.complete(outcome);
        *progress += 1;
        finished.push(item);
        true
    }

    /// Start `item` in this slot.
    ///
    /// Panics if the slot is occupied.
    pub fn launch<R>(
        &mut self,
        runner: &R,
        mut item: WorkItem,
        ordinal: usize,
        total: usize,
        progress: usize,
        signal: &CompletionSignal,
    ) where
        R: ProcessRunner<Handle = H>,
    {
        assert!(
            self.occupant.is_none(),
            "slot {} launched while still occupied",
            self.index
        );

        log_progress!(
            "{} / {} ({}%): launching: {}",
            ordinal,
            total,
            percent(progress, total),
            item.command().display_line()
        );

        let handle = runner.start(&item, signal.notifier(self.index));
        item.mark_running(ordinal, handle.pid());
        log_debug!(
            "[slot {}] item {} started (pid={:?})",
            self.index,
            item.id(),
            handle.pid()
        );
        self.occupant = Some(Occupant { handle, item });
    }
}
