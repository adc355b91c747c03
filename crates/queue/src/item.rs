//! Work item lifecycle shared by everything that can sit in a [`Queue`].
//!
//! [`WorkItem`] holds the state, progress counters and retry bookkeeping of
//! one queued entity and publishes [`ItemEvent`]s. Concrete items (chunks,
//! files) embed one and expose it through the [`Queueable`] trait.
//!
//! [`Queue`]: crate::Queue

use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::event::EventBus;

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Idle,
    Processing,
    Paused,
    Resumed,
    Done,
    Failed,
    Destroyed,
}

impl ItemState {
    /// `true` while the item occupies or is about to reclaim a slot.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Processing | Self::Paused | Self::Resumed)
    }
}

/// Result attached to terminal item events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Outcome {
    /// HTTP-like status code.
    pub status: u16,
    /// Response body or diagnostic text.
    pub body: String,
    /// Response headers, keys lowercased.
    pub headers: BTreeMap<String, String>,
}

impl Outcome {
    /// Outcome with only a status code.
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }
}

/// Progress snapshot carried by [`ItemEvent::Progress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    /// Bytes gained since the previous report.
    pub delta: u64,
    pub processed: u64,
    pub total: u64,
    pub percent: u8,
    pub failed_bytes: u64,
}

/// Events published by a [`WorkItem`].
#[derive(Debug, Clone, PartialEq)]
pub enum ItemEvent {
    Queued,
    Started,
    Paused,
    Resumed,
    Stopped,
    Progress(ProgressUpdate),
    /// One attempt failed; a container may still retry.
    Failed(Outcome),
    /// Hard failure, no further retries.
    Aborted(Outcome),
    Done(Outcome),
    /// Emitted after every `Done` or `Failed`.
    Processed,
    /// The item is finished for good and may be cleaned up.
    Completed,
    /// The item believes the server is unreachable.
    ServerDisconnected,
    Destroyed,
}

/// Percentage of `processed` over `total`, rounded up; 0 when `total` is 0.
pub fn percent_of(processed: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (u128::from(processed) * 100).div_ceil(u128::from(total));
    pct.min(100) as u8
}

/// State machine and progress accounting for one queued entity.
pub struct WorkItem {
    uid: Uuid,
    state: ItemState,
    processed: u64,
    total: u64,
    percent: u8,
    failed_bytes: u64,
    retries: u32,
    can_retry: bool,
    progress_at: Option<Instant>,
    events: EventBus<ItemEvent>,
}

impl WorkItem {
    /// Creates an idle item expecting `total` bytes of work.
    pub fn new(uid: Uuid, total: u64) -> Self {
        Self {
            uid,
            state: ItemState::Idle,
            processed: 0,
            total,
            percent: 0,
            failed_bytes: 0,
            retries: 0,
            can_retry: false,
            progress_at: None,
            events: EventBus::new(),
        }
    }

    pub fn uid(&self) -> Uuid {
        self.uid
    }

    pub fn state(&self) -> ItemState {
        self.state
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn failed_bytes(&self) -> u64 {
        self.failed_bytes
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn can_retry(&self) -> bool {
        self.can_retry
    }

    /// When progress was last observed, if the item is running.
    pub fn progress_at(&self) -> Option<Instant> {
        self.progress_at
    }

    pub fn is_destroyed(&self) -> bool {
        self.state == ItemState::Destroyed
    }

    /// Subscribes to this item's events.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ItemEvent> {
        self.events.subscribe()
    }

    fn emit(&mut self, event: ItemEvent) {
        if !self.is_destroyed() {
            self.events.emit(event);
        }
    }

    fn reset_progress(&mut self) {
        self.processed = 0;
        self.percent = 0;
    }

    /// Announces admission into a container.
    pub fn queued(&mut self) {
        self.emit(ItemEvent::Queued);
    }

    pub fn start(&mut self) {
        if self.is_destroyed() {
            return;
        }
        self.state = ItemState::Processing;
        self.progress_at = Some(Instant::now());
        self.emit(ItemEvent::Started);
    }

    /// Pauses the item. Progress is not preserved across a pause.
    pub fn pause(&mut self) {
        if self.is_destroyed() {
            return;
        }
        self.progress_at = None;
        self.reset_progress();
        self.state = ItemState::Paused;
        self.emit(ItemEvent::Paused);
    }

    pub fn resume(&mut self) {
        if self.is_destroyed() {
            return;
        }
        self.state = ItemState::Processing;
        self.progress_at = Some(Instant::now());
        self.emit(ItemEvent::Resumed);
    }

    /// Marks a paused item eligible for dispatch without running it.
    pub fn mark_resumed(&mut self) {
        if self.state == ItemState::Paused {
            self.state = ItemState::Resumed;
        }
    }

    /// Returns the item to `Idle` so a container can dispatch it again.
    pub fn stop(&mut self) {
        if self.is_destroyed() {
            return;
        }
        self.progress_at = None;
        self.reset_progress();
        self.state = ItemState::Idle;
        self.emit(ItemEvent::Stopped);
    }

    /// Records progress. `processed` never decreases and never exceeds the
    /// total; `total` replaces the current total when non-zero.
    pub fn progress(&mut self, processed: u64, total: Option<u64>) {
        if self.is_destroyed() {
            return;
        }
        if let Some(total) = total.filter(|t| *t > 0) {
            self.total = total;
        }

        let previous = self.processed;
        self.progress_at = Some(Instant::now());
        self.processed = processed.max(previous).min(self.total);
        self.percent = percent_of(self.processed, self.total);

        let update = ProgressUpdate {
            delta: self.processed.saturating_sub(previous),
            processed: self.processed,
            total: self.total,
            percent: self.percent,
            failed_bytes: self.failed_bytes,
        };
        self.emit(ItemEvent::Progress(update));
    }

    /// Completes the item. Emits `Done`, `Processed`, `Completed` in order.
    pub fn done(&mut self, outcome: Outcome) {
        if self.is_destroyed() {
            return;
        }
        self.processed = self.total;
        self.percent = 100;
        self.failed_bytes = 0;
        self.state = ItemState::Done;
        self.emit(ItemEvent::Done(outcome));
        self.emit(ItemEvent::Processed);
        self.emit(ItemEvent::Completed);
    }

    /// Fails one attempt. `Completed` is withheld while a retry is possible.
    pub fn failed(&mut self, outcome: Outcome) {
        if self.is_destroyed() {
            return;
        }
        self.progress_at = None;
        self.reset_progress();
        self.failed_bytes = self.total;
        self.state = ItemState::Failed;
        self.emit(ItemEvent::Failed(outcome));
        self.emit(ItemEvent::Processed);
        if !self.can_retry {
            self.emit(ItemEvent::Completed);
        }
    }

    /// Fails the item for good. Only `Aborted` is emitted.
    pub fn abort(&mut self, outcome: Outcome) {
        if self.is_destroyed() {
            return;
        }
        self.progress_at = None;
        self.reset_progress();
        self.failed_bytes = self.total;
        self.can_retry = false;
        self.state = ItemState::Failed;
        self.emit(ItemEvent::Aborted(outcome));
    }

    /// Signals that the server looks unreachable from this item.
    pub fn server_disconnected(&mut self) {
        self.emit(ItemEvent::ServerDisconnected);
    }

    /// Counts one more retry. The caller must `stop()` to re-queue.
    pub fn retry(&mut self) {
        if !self.is_destroyed() {
            self.retries += 1;
        }
    }

    pub fn retry_reset(&mut self) {
        if !self.is_destroyed() {
            self.retries = 0;
            self.can_retry = true;
        }
    }

    /// Terminal. Emits `Destroyed` once and detaches all subscribers.
    pub fn destroy(&mut self) {
        if self.is_destroyed() {
            return;
        }
        self.progress_at = None;
        self.events.emit(ItemEvent::Destroyed);
        self.state = ItemState::Destroyed;
        self.events.close();
    }
}

/// Anything that can be scheduled by a [`Queue`](crate::Queue).
///
/// Implementors embed a [`WorkItem`] and override the lifecycle hooks they
/// need. `Context` is whatever the item must touch outside itself while
/// changing state; the queue hands it through untouched.
pub trait Queueable {
    type Context;

    fn work(&self) -> &WorkItem;

    fn work_mut(&mut self) -> &mut WorkItem;

    fn uid(&self) -> Uuid {
        self.work().uid()
    }

    fn state(&self) -> ItemState {
        self.work().state()
    }

    fn start(&mut self, _ctx: &mut Self::Context) {
        self.work_mut().start();
    }

    fn pause(&mut self, _ctx: &mut Self::Context) {
        self.work_mut().pause();
    }

    fn resume(&mut self, _ctx: &mut Self::Context) {
        self.work_mut().resume();
    }

    fn stop(&mut self, _ctx: &mut Self::Context) {
        self.work_mut().stop();
    }

    fn abort(&mut self, outcome: Outcome, _ctx: &mut Self::Context) {
        self.work_mut().abort(outcome);
    }

    fn retry(&mut self) {
        self.work_mut().retry();
    }

    fn retry_reset(&mut self) {
        self.work_mut().retry_reset();
    }

    fn destroy(&mut self, _ctx: &mut Self::Context) {
        self.work_mut().destroy();
    }

    /// Processes internal events. Returns `true` if anything was handled.
    fn pump(&mut self, _ctx: &mut Self::Context) -> bool {
        false
    }
}
