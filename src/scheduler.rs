use crate::log_debug;
use crate::runner::ProcessRunner;
use crate::slot::{CompletionSignal, ProcessSlot};
use crate::types::WorkItem;

// --- Ordering ---

/// Sort by descending cost so the longest builds start first.
///
/// Stable: equal costs keep their input order.
pub fn order_by_cost(items: &mut [WorkItem]) {
    items.sort_by(|a, b| b.cost().cmp(&a.cost()));
}

// --- Slot pool ---

/// Fixed set of slots sharing one completion signal.
///
/// Owns every item from launch until its slot reclaims it; reclaimed items
/// collect in `finished`.
pub struct SlotPool<R: ProcessRunner> {
    slots: Vec<ProcessSlot<R::Handle>>,
    signal: CompletionSignal,
    progress: usize,
    finished: Vec<WorkItem>,
}

impl<R: ProcessRunner> SlotPool<R> {
    /// `progress` is the number of items of the whole run already finished.
    pub fn new(size: usize, progress: usize) -> Self {
        Self {
            slots: (0..size).map(ProcessSlot::new).collect(),
            signal: CompletionSignal::new(),
            progress,
            finished: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_occupied()).count()
    }

    /// First available slot, reclaiming finished ones along the way.
    fn scan(&mut self) -> Option<usize> {
        for slot in self.slots.iter_mut() {
            if slot.claim_or_check(&mut self.progress, &mut self.finished) {
                return Some(slot.index());
            }
        }
        None
    }

    /// Wait until a slot is free and return its index.
    pub async fn acquire(&mut self) -> usize {
        loop {
            if let Some(index) = self.scan() {
                return index;
            }
            // All slots busy - wait for a process to finish
            let woken_by = self.signal.wait().await;
            log_debug!("[pool] woken by slot {}", woken_by);
        }
    }

    pub fn launch(
        &mut self,
        index: usize,
        runner: &R,
        item: WorkItem,
        ordinal: usize,
        total: usize,
    ) {
        self.slots[index].launch(runner, item, ordinal, total, self.progress, &self.signal);
    }

    /// Wait for every slot to become available and hand back the finished items.
    pub async fn drain(mut self) -> Vec<WorkItem> {
        loop {
            let mut active = false;
            for slot in self.slots.iter_mut() {
                if !slot.claim_or_check(&mut self.progress, &mut self.finished) {
                    active = true;
                }
            }
            if !active {
                return self.finished;
            }
            self.signal.wait().await;
        }
    }
}

// --- Scheduler loop ---

/// Run `items` to completion with at most `degree_of_parallelism` live processes.
///
/// `items` must already be in launch order. `first_ordinal` is the position of
/// `items[0]` in the whole run and `total` the size of the whole run; both only
/// feed progress output. Returns the items in completion order, every one of
/// them completed.
pub async fn run_slots<R: ProcessRunner>(
    items: Vec<WorkItem>,
    first_ordinal: usize,
    total: usize,
    degree_of_parallelism: usize,
    runner: &R,
) -> Vec<WorkItem> {
    if items.is_empty() {
        return Vec::new();
    }
    let slots = degree_of_parallelism.clamp(1, items.len());
    let mut pool = SlotPool::<R>::new(slots, first_ordinal);

    for (offset, item) in items.into_iter().enumerate() {
        let index = pool.acquire().await;
        pool.launch(index, runner, item, first_ordinal + offset, total);
    }

    // Everything launched; wait for the stragglers
    pool.drain().await
}
