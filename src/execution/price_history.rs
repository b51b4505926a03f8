use crate::models::PriceBar;
use std::collections::VecDeque;

pub const DEFAULT_HISTORY_CAPACITY: usize = 500;

/// What [`PriceHistory::push`] did with a bar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// New newest bar
    Appended,
    /// Same open time as the newest bar, which was already final; cache refreshed
    Replaced,
    /// Older than the newest bar; ignored
    Stale,
}

/// Rolling window of finalized bars for one symbol, oldest first
///
/// Owned by the orchestrator; not shared between tasks.
#[derive(Debug, Clone)]
pub struct PriceHistory {
    bars: VecDeque<PriceBar>,
    capacity: usize,
}

impl Default for PriceHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl PriceHistory {
    /// # Arguments
    /// * `capacity` - Maximum number of bars kept (at least 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            bars: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a finalized bar, dropping the oldest if full.
    ///
    /// A bar with the same open time as the newest cached bar replaces it
    /// (the stream replays the last bar after a reconnect). Bars older than
    /// the newest cached bar are ignored.
    pub fn push(&mut self, bar: PriceBar) -> PushOutcome {
        if let Some(last) = self.bars.back_mut() {
            if bar.open_time == last.open_time {
                *last = bar;
                return PushOutcome::Replaced;
            }
            if bar.open_time < last.open_time {
                return PushOutcome::Stale;
            }
        }

        self.bars.push_back(bar);
        while self.bars.len() > self.capacity {
            self.bars.pop_front();
        }
        PushOutcome::Appended
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&PriceBar> {
        self.bars.back()
    }

    /// Contiguous view of all cached bars, oldest first
    pub fn as_slice(&mut self) -> &[PriceBar] {
        self.bars.make_contiguous()
    }
}
