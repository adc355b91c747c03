//! Slot-limited scheduler over [`Queueable`] items.
//!
//! The queue owns its items and reacts to their events when [`Queue::pump`]
//! is called. Deferred work (the next dispatch iteration, the resume after a
//! server disconnect) arrives as a [`Wakeup`] the owner awaits with
//! [`Queue::next_wakeup`] and feeds back through [`Queue::on_wakeup`]. All
//! mutation happens on the owner's task.

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::{Backoff, BackoffConfig};
use crate::event::EventBus;
use crate::item::{ItemEvent, ItemState, Outcome, Queueable};
use crate::stats::Stats;

/// Queue-level state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Idle,
    Stopped,
    Started,
    Paused,
    Destroyed,
}

/// Scheduling policy.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Items allowed in `Processing` at once.
    pub max_slots: usize,
    /// Retries per item before it is aborted; 0 disables retrying.
    pub max_retries: u32,
    /// Start the queue as soon as an item is added.
    pub auto_start: bool,
    /// Let processing items finish when stopping.
    pub finish_active: bool,
    /// Resume paused items when a paused queue is started again.
    pub pause_before_start: bool,
    pub backoff: BackoffConfig,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_slots: 1,
            max_retries: 0,
            auto_start: false,
            finish_active: false,
            pause_before_start: true,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Notifications published by a [`Queue`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Started,
    StateChanged {
        state: QueueState,
        previous: QueueState,
    },
    Progress(Stats),
    Paused,
    Stopped,
    /// Every item reached a terminal state.
    Done,
    ServerDisconnected,
    ServerReconnected,
    /// The reconnect budget is spent; the queue stays paused.
    TooManyReconnects,
    Destroyed,
}

/// Deferred work for the queue, produced by [`Queue::next_wakeup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wakeup(Wake);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    ProcessNext,
    Resume(u64),
}

/// Teardown waiting for a deferred stop to complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Clear,
    Destroy,
}

struct Entry<T> {
    item: T,
    events: mpsc::UnboundedReceiver<ItemEvent>,
}

struct PendingResume {
    generation: u64,
    cancel: CancellationToken,
}

pub struct Queue<T: Queueable> {
    entries: Vec<Entry<T>>,
    state: QueueState,
    stats: Stats,
    options: QueueOptions,
    connected: bool,
    backoff: Backoff,
    reconnect: Option<PendingResume>,
    resume_generation: u64,
    started_at: Option<Instant>,
    stop_requested: bool,
    teardown: Option<Teardown>,
    process_scheduled: bool,
    wake_tx: mpsc::UnboundedSender<Wakeup>,
    wake_rx: mpsc::UnboundedReceiver<Wakeup>,
    events: EventBus<QueueEvent>,
}

impl<T: Queueable> Queue<T> {
    pub fn new(mut options: QueueOptions) -> Self {
        options.max_slots = options.max_slots.max(1);
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        Self {
            entries: Vec::new(),
            state: QueueState::Idle,
            stats: Stats::default(),
            backoff: Backoff::new(options.backoff.clone()),
            options,
            connected: true,
            reconnect: None,
            resume_generation: 0,
            started_at: None,
            stop_requested: false,
            teardown: None,
            process_scheduled: false,
            wake_tx,
            wake_rx,
            events: EventBus::new(),
        }
    }

    /// Subscribes to queue notifications.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether a resume after a disconnect is scheduled.
    pub fn reconnect_pending(&self) -> bool {
        self.reconnect.is_some()
    }

    pub fn get(&self, uid: Uuid) -> Option<&T> {
        self.entries
            .iter()
            .find(|e| e.item.uid() == uid)
            .map(|e| &e.item)
    }

    pub fn get_mut(&mut self, uid: Uuid) -> Option<&mut T> {
        self.entries
            .iter_mut()
            .find(|e| e.item.uid() == uid)
            .map(|e| &mut e.item)
    }

    /// Items in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|e| &e.item)
    }

    fn processing(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.item.state() == ItemState::Processing)
            .count()
    }

    /// Free slots, counted from the live item states.
    pub fn spare_slots(&self) -> usize {
        self.options.max_slots.saturating_sub(self.processing())
    }

    // ------------------------------------------------------------------
    // Items
    // ------------------------------------------------------------------

    /// Adds an item and, with `auto_start`, gets it going.
    pub fn add_item(&mut self, mut item: T, ctx: &mut T::Context) -> Uuid {
        let uid = item.uid();
        if self.state == QueueState::Destroyed {
            warn!(%uid, "item added to a destroyed queue, discarding");
            item.destroy(ctx);
            return uid;
        }

        if self.options.max_retries > 0 {
            item.retry_reset();
        }
        let events = item.work_mut().subscribe();
        self.entries.push(Entry { item, events });
        self.recalc();
        if let Some(entry) = self.entries.last_mut() {
            entry.item.work_mut().queued();
        }
        debug!(%uid, count = self.entries.len(), "item queued");

        if self.options.auto_start && self.state != QueueState::Paused && !self.start(ctx) {
            self.process_next(ctx);
        }
        uid
    }

    /// Stops an item and takes it out of the queue.
    pub fn extract_item(&mut self, uid: Uuid, ctx: &mut T::Context) -> Option<T> {
        let idx = self.entries.iter().position(|e| e.item.uid() == uid)?;
        self.stop_item(idx, ctx);
        let entry = self.entries.remove(idx);
        self.recalc();

        if self.state == QueueState::Started {
            self.schedule_process_next();
        }
        Some(entry.item)
    }

    /// Extracts and destroys an item.
    pub fn remove_item(&mut self, uid: Uuid, ctx: &mut T::Context) -> bool {
        match self.extract_item(uid, ctx) {
            Some(mut item) => {
                item.destroy(ctx);
                true
            }
            None => false,
        }
    }

    fn stop_item(&mut self, idx: usize, ctx: &mut T::Context) {
        let item = &mut self.entries[idx].item;
        if item.state().is_active() {
            item.stop(ctx);
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn set_state(&mut self, state: QueueState) {
        let previous = self.state;
        self.state = state;
        self.events.emit(QueueEvent::StateChanged { state, previous });
    }

    /// Starts dispatching. Returns `false` if the queue was already started.
    pub fn start(&mut self, ctx: &mut T::Context) -> bool {
        if matches!(self.state, QueueState::Started | QueueState::Destroyed) {
            return false;
        }

        if self.state == QueueState::Paused && self.options.pause_before_start {
            for entry in &mut self.entries {
                entry.item.work_mut().mark_resumed();
            }
        }

        self.set_state(QueueState::Started);
        self.events.emit(QueueEvent::Started);
        self.stop_requested = false;
        self.backoff.reset();
        self.started_at = Some(Instant::now());
        info!(items = self.entries.len(), "queue started");

        self.process_next(ctx);
        true
    }

    /// Pauses every running item. Returns `false` if already paused.
    pub fn pause(&mut self, ctx: &mut T::Context) -> bool {
        if matches!(self.state, QueueState::Paused | QueueState::Destroyed) {
            return false;
        }

        for entry in &mut self.entries {
            if matches!(
                entry.item.state(),
                ItemState::Processing | ItemState::Resumed
            ) {
                entry.item.pause(ctx);
            }
        }

        self.set_state(QueueState::Paused);
        self.events.emit(QueueEvent::Paused);
        self.recalc();
        debug!("queue paused");
        true
    }

    /// Makes paused items eligible again and restarts dispatch.
    pub fn resume(&mut self, ctx: &mut T::Context) -> bool {
        if matches!(self.state, QueueState::Started | QueueState::Destroyed) {
            return false;
        }

        for entry in &mut self.entries {
            entry.item.work_mut().mark_resumed();
        }

        self.started_at.get_or_insert_with(Instant::now);
        self.set_state(QueueState::Started);
        debug!("queue resumed");

        self.process_next(ctx);
        true
    }

    /// Stops the queue. With `finish_active` the stop completes only once
    /// no item is processing.
    pub fn stop(&mut self, ctx: &mut T::Context) {
        if matches!(self.state, QueueState::Stopped | QueueState::Destroyed) {
            return;
        }

        if self.options.finish_active && self.state == QueueState::Started && self.processing() > 0
        {
            debug!(processing = self.processing(), "stop deferred until active items finish");
            self.stop_requested = true;
            return;
        }

        for idx in 0..self.entries.len() {
            self.stop_item(idx, ctx);
        }
        self.stopped(ctx);
    }

    fn stopped(&mut self, ctx: &mut T::Context) {
        self.stop_requested = false;
        self.cancel_reconnect();
        self.recalc();
        self.set_state(QueueState::Stopped);
        self.events.emit(QueueEvent::Stopped);
        info!(
            done = self.stats.done,
            failed = self.stats.failed,
            "queue stopped"
        );

        match self.teardown.take() {
            Some(Teardown::Clear) => self.clear_items(ctx),
            Some(Teardown::Destroy) => self.finish_destroy(ctx),
            None => {}
        }
    }

    /// Stops the queue and destroys every item.
    pub fn clear(&mut self, ctx: &mut T::Context) {
        match self.state {
            QueueState::Destroyed => {}
            QueueState::Stopped => self.clear_items(ctx),
            _ => {
                self.teardown.get_or_insert(Teardown::Clear);
                self.stop(ctx);
            }
        }
    }

    fn clear_items(&mut self, ctx: &mut T::Context) {
        for mut entry in self.entries.drain(..) {
            entry.item.destroy(ctx);
        }
        self.stats = Stats::default();
    }

    /// Stops, clears and detaches the queue. Terminal.
    pub fn destroy(&mut self, ctx: &mut T::Context) {
        if self.state == QueueState::Destroyed {
            return;
        }
        if self.state == QueueState::Stopped {
            self.teardown = None;
            self.finish_destroy(ctx);
        } else {
            self.teardown = Some(Teardown::Destroy);
            self.stop(ctx);
        }
    }

    fn finish_destroy(&mut self, ctx: &mut T::Context) {
        self.events.emit(QueueEvent::Destroyed);
        self.clear_items(ctx);
        self.cancel_reconnect();
        self.started_at = None;
        self.set_state(QueueState::Destroyed);
        self.events.close();
        debug!("queue destroyed");
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn candidate(&self) -> Option<usize> {
        self.entries.iter().position(|e| {
            matches!(e.item.state(), ItemState::Idle | ItemState::Resumed)
        })
    }

    /// One dispatch iteration. Reschedules itself after admitting an item.
    fn process_next(&mut self, ctx: &mut T::Context) {
        if self.state != QueueState::Started {
            return;
        }

        let processing = self.processing();
        if self.stop_requested {
            if processing == 0 {
                self.stopped(ctx);
            }
            return;
        }
        if processing >= self.options.max_slots {
            return;
        }

        match self.candidate() {
            Some(idx) => {
                let item = &mut self.entries[idx].item;
                let uid = item.uid();
                if item.state() == ItemState::Idle {
                    debug!(%uid, "starting item");
                    item.start(ctx);
                } else {
                    debug!(%uid, "resuming item");
                    item.resume(ctx);
                }
                self.recalc();
                self.schedule_process_next();
            }
            None => {
                self.recalc();
                if !self.entries.iter().any(|e| e.item.state().is_active()) {
                    self.stop(ctx);
                    self.events.emit(QueueEvent::Done);
                    info!(total = self.stats.total, "queue done");
                }
            }
        }
    }

    fn schedule_process_next(&mut self) {
        if !self.process_scheduled {
            self.process_scheduled = true;
            let _ = self.wake_tx.send(Wakeup(Wake::ProcessNext));
        }
    }

    /// Waits for the next piece of deferred work. Cancel-safe.
    pub async fn next_wakeup(&mut self) -> Wakeup {
        match self.wake_rx.recv().await {
            Some(wakeup) => wakeup,
            None => std::future::pending().await,
        }
    }

    /// Returns deferred work that is already due, if any.
    pub fn try_wakeup(&mut self) -> Option<Wakeup> {
        self.wake_rx.try_recv().ok()
    }

    /// Runs deferred work obtained from [`next_wakeup`](Self::next_wakeup).
    pub fn on_wakeup(&mut self, wakeup: Wakeup, ctx: &mut T::Context) {
        match wakeup.0 {
            Wake::ProcessNext => {
                self.process_scheduled = false;
                self.process_next(ctx);
            }
            Wake::Resume(generation) => {
                let current = self
                    .reconnect
                    .as_ref()
                    .is_some_and(|p| p.generation == generation);
                if current {
                    self.reconnect = None;
                    info!(attempt = self.backoff.attempts(), "resuming after disconnect");
                    self.resume(ctx);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Item events
    // ------------------------------------------------------------------

    /// Processes pending item events until the queue is quiet.
    /// Returns `true` if anything was handled.
    pub fn pump(&mut self, ctx: &mut T::Context) -> bool {
        let mut handled = false;
        loop {
            let mut busy = false;
            for entry in &mut self.entries {
                busy |= entry.item.pump(ctx);
            }
            while let Some((uid, event)) = self.next_item_event() {
                self.on_item_event(uid, event, ctx);
                busy = true;
            }
            if !busy {
                return handled;
            }
            handled = true;
        }
    }

    fn next_item_event(&mut self) -> Option<(Uuid, ItemEvent)> {
        self.entries
            .iter_mut()
            .find_map(|e| e.events.try_recv().ok().map(|ev| (e.item.uid(), ev)))
    }

    fn on_item_event(&mut self, uid: Uuid, event: ItemEvent, ctx: &mut T::Context) {
        match event {
            ItemEvent::Progress(update) => {
                self.recalc();
                self.events.emit(QueueEvent::Progress(self.stats));
                if !self.connected && update.delta > 0 {
                    self.reconnect();
                }
            }
            ItemEvent::Failed(outcome) => self.retry_or_abort(uid, outcome, ctx),
            ItemEvent::ServerDisconnected => self.disconnect(ctx),
            ItemEvent::Processed => {
                self.recalc();
                self.process_next(ctx);
            }
            ItemEvent::Destroyed => {
                self.entries.retain(|e| e.item.uid() != uid);
                self.recalc();
            }
            _ => self.recalc(),
        }
    }

    fn retry_or_abort(&mut self, uid: Uuid, outcome: Outcome, ctx: &mut T::Context) {
        let max_retries = self.options.max_retries;
        let Some(item) = self.get_mut(uid) else {
            return;
        };
        if item.state() != ItemState::Failed {
            return;
        }

        let retries = item.work().retries();
        if max_retries > 0 && retries < max_retries {
            debug!(%uid, attempt = retries + 1, status = outcome.status, "retrying item");
            item.stop(ctx);
            item.retry();
        } else {
            warn!(%uid, status = outcome.status, retries, "item failed, no retries left");
            item.abort(outcome, ctx);
        }
    }

    fn recalc(&mut self) {
        self.stats = Stats::collect(self.entries.iter().map(|e| e.item.work()), self.started_at);
    }

    // ------------------------------------------------------------------
    // Connectivity
    // ------------------------------------------------------------------

    fn disconnect(&mut self, ctx: &mut T::Context) {
        self.connected = false;
        if self.reconnect.is_some() {
            return;
        }

        warn!(wait_secs = self.backoff.current_wait().as_secs(), "server disconnected");
        self.events.emit(QueueEvent::ServerDisconnected);
        self.pause(ctx);
        self.schedule_resume();
    }

    fn schedule_resume(&mut self) {
        let Some(delay) = self.backoff.next_delay() else {
            warn!(attempts = self.backoff.attempts(), "too many reconnect attempts, giving up");
            self.events.emit(QueueEvent::TooManyReconnects);
            return;
        };

        self.resume_generation += 1;
        let generation = self.resume_generation;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let tx = self.wake_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Wakeup(Wake::Resume(generation)));
                }
            }
        });
        debug!(attempt = self.backoff.attempts(), delay_secs = delay.as_secs(), "resume scheduled");
        self.reconnect = Some(PendingResume { generation, cancel });
    }

    fn reconnect(&mut self) {
        self.connected = true;
        self.backoff.reset();
        self.cancel_reconnect();
        info!("server reconnected");
        self.events.emit(QueueEvent::ServerReconnected);
    }

    /// Drops a pending automatic resume, if any.
    pub fn cancel_reconnect(&mut self) {
        if let Some(pending) = self.reconnect.take() {
            pending.cancel.cancel();
        }
    }
}

impl<T: Queueable> Drop for Queue<T> {
    fn drop(&mut self) {
        self.cancel_reconnect();
    }
}
