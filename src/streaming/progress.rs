use std::sync::Arc;

use parking_lot::Mutex;

use crate::graph::Signal;

/// Percentage-complete notifications of a long-running operation.
pub type ProgressSignal = Signal<u8>;

struct Counter {
    done: usize,
    last: Option<u8>,
}

/// Turns block completions into percentage notifications.
///
/// Emits `round(100 * done / total)` only when the percentage changes, so a
/// subscriber sees a strictly increasing sequence ending at 100.
pub struct ProgressTracker {
    total: usize,
    counter: Mutex<Counter>,
    signal: Arc<ProgressSignal>,
}

impl ProgressTracker {
    pub fn new(total: usize, signal: Arc<ProgressSignal>) -> Self {
        Self {
            total,
            counter: Mutex::new(Counter { done: 0, last: None }),
            signal,
        }
    }

    /// Report 0%, or 100% right away when there is nothing to do.
    pub fn start(&self) {
        let percent = if self.total == 0 { 100 } else { 0 };
        let mut counter = self.counter.lock();
        if counter.last != Some(percent) {
            counter.last = Some(percent);
            self.signal.emit(&percent);
        }
    }

    /// Count one finished block.
    pub fn block_done(&self) {
        let total = self.total.max(1);
        let mut counter = self.counter.lock();
        counter.done = (counter.done + 1).min(total);
        let percent = ((100 * counter.done) as f64 / total as f64).round() as u8;
        if counter.last.map_or(true, |last| percent > last) {
            counter.last = Some(percent);
            // Emitting under the lock keeps concurrent completions ordered
            self.signal.emit(&percent);
        }
    }

    pub fn completed(&self) -> usize {
        self.counter.lock().done
    }

    pub fn total(&self) -> usize {
        self.total
    }
}
