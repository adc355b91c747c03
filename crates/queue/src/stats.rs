//! Aggregate counters for a queue, rebuilt from scratch on every change.

use serde::Serialize;
use tokio::time::Instant;

use crate::item::{ItemState, WorkItem, percent_of};

/// Snapshot of a queue's byte and item counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub processed: u64,
    pub total: u64,
    pub failed_bytes: u64,
    pub done: usize,
    pub failed: usize,
    pub processing: usize,
    /// Items in any other state (idle, paused, resumed).
    pub queued: usize,
    pub percent: u8,
    pub processed_per_sec: u64,
}

impl Stats {
    /// Recomputes the snapshot from the given items.
    ///
    /// `started_at` is when the owning queue last started; without it the
    /// throughput stays at zero.
    pub fn collect<'a, I>(items: I, started_at: Option<Instant>) -> Self
    where
        I: IntoIterator<Item = &'a WorkItem>,
    {
        let mut stats = Stats::default();

        for item in items {
            stats.processed += item.processed();
            stats.total += item.total();
            stats.failed_bytes += item.failed_bytes();

            match item.state() {
                ItemState::Done => stats.done += 1,
                ItemState::Failed => stats.failed += 1,
                ItemState::Processing => stats.processing += 1,
                _ => stats.queued += 1,
            }
        }

        stats.percent = percent_of(stats.processed, stats.total);
        if let Some(started) = started_at {
            let elapsed_ms = started.elapsed().as_millis().max(1);
            let per_sec = (u128::from(stats.processed) * 1000).div_ceil(elapsed_ms);
            stats.processed_per_sec = u64::try_from(per_sec).unwrap_or(u64::MAX);
        }

        stats
    }
}
