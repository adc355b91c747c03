//! The [`Uploader`] handle and the task that drives both queues.
//!
//! Files and chunks live in two [`Queue`]s owned by one spawned task. The
//! handle talks to it over a command channel; exchanges, preprocessing and
//! deferred dispatch report back through the inbox. Everything that mutates
//! queue state runs on that task.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};
use uuid::Uuid;

use chunkload_queue::{ItemEvent, Queue, QueueEvent, QueueOptions, QueueState, Queueable, Stats};

use crate::dispatch::{Dispatcher, EngineMsg};
use crate::error::UploadError;
use crate::file::{File, Preprocess};
use crate::options::UploadOptions;
use crate::source::ByteSource;
use crate::transport::Transport;
use crate::types::FileSnapshot;
use crate::uploader::ChunkQueue;

/// Events published by an [`Uploader`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UploadEvent {
    Started,
    StateChanged {
        state: QueueState,
        previous: QueueState,
    },
    Progress(Stats),
    Paused,
    Stopped,
    /// Every file reached a terminal state.
    Done,
    ServerDisconnected,
    ServerReconnected,
    TooManyReconnects,
    Destroyed,
    FileQueued {
        file: Uuid,
    },
    FileStarted {
        file: Uuid,
    },
    FileProgress {
        file: Uuid,
        processed: u64,
        total: u64,
        percent: u8,
    },
    FileUploaded {
        file: Uuid,
        status: u16,
        response: String,
    },
    /// The file failed for good; no retries are left.
    FileFailed {
        file: Uuid,
        status: u16,
        response: String,
    },
}

enum Command {
    AddFile {
        source: Arc<dyn ByteSource>,
        reply: oneshot::Sender<Uuid>,
    },
    RemoveFile {
        file: Uuid,
        reply: oneshot::Sender<bool>,
    },
    RenameFile {
        file: Uuid,
        name: String,
        reply: oneshot::Sender<Result<(), UploadError>>,
    },
    Start {
        reply: oneshot::Sender<()>,
    },
    Pause {
        reply: oneshot::Sender<()>,
    },
    Resume {
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Destroy {
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<Stats>,
    },
    Files {
        reply: oneshot::Sender<Vec<FileSnapshot>>,
    },
}

/// Chunked file uploader.
///
/// Must be created inside a tokio runtime. Dropping every handle shuts the
/// engine down and cancels in-flight exchanges.
pub struct Uploader {
    commands: mpsc::UnboundedSender<Command>,
    events: Option<mpsc::UnboundedReceiver<UploadEvent>>,
}

impl Uploader {
    pub fn new(options: UploadOptions, transport: Arc<dyn Transport>) -> Result<Self, UploadError> {
        Self::build(options, transport, None)
    }

    /// Like [`new`](Self::new), running `preprocessor` on files it applies
    /// to before they are uploaded.
    pub fn with_preprocessor(
        options: UploadOptions,
        transport: Arc<dyn Transport>,
        preprocessor: Arc<dyn Preprocess>,
    ) -> Result<Self, UploadError> {
        Self::build(options, transport, Some(preprocessor))
    }

    fn build(
        options: UploadOptions,
        transport: Arc<dyn Transport>,
        preprocessor: Option<Arc<dyn Preprocess>>,
    ) -> Result<Self, UploadError> {
        options.validate()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let engine = Engine::new(
            Arc::new(options),
            Dispatcher::new(transport, inbox_tx),
            preprocessor,
            events_tx,
        );
        tokio::spawn(engine.run(commands_rx, inbox_rx));

        Ok(Self {
            commands: commands_tx,
            events: Some(events_rx),
        })
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<UploadEvent>> {
        self.events.take()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, UploadError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| UploadError::Closed)?;
        rx.await.map_err(|_| UploadError::Closed)
    }

    /// Queues a file. Returns its uid.
    pub async fn add_file(&self, source: Arc<dyn ByteSource>) -> Result<Uuid, UploadError> {
        self.request(|reply| Command::AddFile { source, reply }).await
    }

    /// Stops and discards a file.
    pub async fn remove_file(&self, file: Uuid) -> Result<(), UploadError> {
        match self.request(|reply| Command::RemoveFile { file, reply }).await? {
            true => Ok(()),
            false => Err(UploadError::UnknownFile(file)),
        }
    }

    pub async fn rename_file(&self, file: Uuid, name: &str) -> Result<(), UploadError> {
        let name = name.to_string();
        self.request(|reply| Command::RenameFile { file, name, reply })
            .await?
    }

    pub async fn start(&self) -> Result<(), UploadError> {
        self.request(|reply| Command::Start { reply }).await
    }

    pub async fn pause(&self) -> Result<(), UploadError> {
        self.request(|reply| Command::Pause { reply }).await
    }

    pub async fn resume(&self) -> Result<(), UploadError> {
        self.request(|reply| Command::Resume { reply }).await
    }

    pub async fn stop(&self) -> Result<(), UploadError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Tears everything down. The handle is unusable afterwards.
    pub async fn destroy(&self) -> Result<(), UploadError> {
        self.request(|reply| Command::Destroy { reply }).await
    }

    pub async fn stats(&self) -> Result<Stats, UploadError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Snapshots of every queued file, in queue order.
    pub async fn files(&self) -> Result<Vec<FileSnapshot>, UploadError> {
        self.request(|reply| Command::Files { reply }).await
    }
}

// ---------------------------------------------------------------------------
// Engine task
// ---------------------------------------------------------------------------

struct Engine {
    files: Queue<File>,
    uploads: ChunkQueue,
    options: Arc<UploadOptions>,
    dispatcher: Dispatcher,
    preprocessor: Option<Arc<dyn Preprocess>>,
    file_queue_events: mpsc::UnboundedReceiver<QueueEvent>,
    upload_queue_events: mpsc::UnboundedReceiver<QueueEvent>,
    watchers: Vec<(Uuid, mpsc::UnboundedReceiver<ItemEvent>)>,
    events: mpsc::UnboundedSender<UploadEvent>,
    /// A deferred file-queue stop is in progress; chunks keep flowing
    /// until it completes.
    stopping: bool,
}

impl Engine {
    fn new(
        options: Arc<UploadOptions>,
        dispatcher: Dispatcher,
        preprocessor: Option<Arc<dyn Preprocess>>,
        events: mpsc::UnboundedSender<UploadEvent>,
    ) -> Self {
        let mut files = Queue::new(QueueOptions {
            max_slots: options.max_slots,
            max_retries: options.max_file_retries,
            auto_start: options.auto_start,
            finish_active: options.finish_active,
            pause_before_start: options.pause_before_start,
            ..Default::default()
        });
        let mut uploads = ChunkQueue::new(QueueOptions {
            max_slots: options.max_slots,
            max_retries: options.max_retries,
            auto_start: true,
            ..Default::default()
        });
        let file_queue_events = files.subscribe();
        let upload_queue_events = uploads.subscribe();

        Self {
            files,
            uploads,
            options,
            dispatcher,
            preprocessor,
            file_queue_events,
            upload_queue_events,
            watchers: Vec::new(),
            events,
            stopping: false,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbox: mpsc::UnboundedReceiver<EngineMsg>,
    ) {
        debug!(
            max_slots = self.options.max_slots,
            chunk_size = self.options.chunk_size,
            "upload engine started"
        );
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.on_command(command) {
                            break;
                        }
                    }
                    None => {
                        debug!("all uploader handles dropped");
                        self.teardown();
                        break;
                    }
                },
                Some(msg) = inbox.recv() => self.on_message(msg),
                wakeup = self.files.next_wakeup() => {
                    self.files.on_wakeup(wakeup, &mut self.uploads);
                }
                wakeup = self.uploads.next_wakeup() => {
                    self.uploads.on_wakeup(wakeup, &mut ());
                }
            }
            self.settle();
        }
        self.settle();
        debug!("upload engine stopped");
    }

    /// Returns `false` once the engine should exit.
    fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::AddFile { source, reply } => {
                let mut file = File::new(
                    source,
                    Arc::clone(&self.options),
                    self.dispatcher.clone(),
                    self.preprocessor.clone(),
                );
                let uid = file.uid();
                self.watchers.push((uid, file.work_mut().subscribe()));
                info!(%uid, name = %file.name(), size = file.size(), "file added");
                self.files.add_item(file, &mut self.uploads);
                let _ = reply.send(uid);
            }
            Command::RemoveFile { file, reply } => {
                let removed = self.files.remove_item(file, &mut self.uploads);
                let _ = reply.send(removed);
            }
            Command::RenameFile { file, name, reply } => {
                let result = match self.files.get_mut(file) {
                    Some(f) => f.rename(&name),
                    None => Err(UploadError::UnknownFile(file)),
                };
                let _ = reply.send(result);
            }
            Command::Start { reply } => {
                self.stopping = false;
                self.files.start(&mut self.uploads);
                if self.uploads.state() == QueueState::Paused && !self.uploads.reconnect_pending() {
                    self.uploads.resume(&mut ());
                }
                let _ = reply.send(());
            }
            Command::Pause { reply } => {
                self.uploads.cancel_reconnect();
                self.files.pause(&mut self.uploads);
                self.uploads.pause(&mut ());
                let _ = reply.send(());
            }
            Command::Resume { reply } => {
                self.uploads.resume(&mut ());
                self.files.resume(&mut self.uploads);
                let _ = reply.send(());
            }
            Command::Stop { reply } => {
                self.files.stop(&mut self.uploads);
                if self.files.state() == QueueState::Stopped {
                    self.uploads.stop(&mut ());
                } else {
                    debug!("waiting for active files before stopping chunks");
                    self.stopping = true;
                }
                let _ = reply.send(());
            }
            Command::Destroy { reply } => {
                self.teardown();
                let _ = reply.send(());
                return false;
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.files.stats());
            }
            Command::Files { reply } => {
                let _ = reply.send(self.files.iter().map(File::snapshot).collect());
            }
        }
        true
    }

    fn on_message(&mut self, msg: EngineMsg) {
        match msg {
            EngineMsg::Exchange {
                chunk,
                exchange,
                event,
            } => match self.uploads.get_mut(chunk) {
                Some(unit) => unit.on_exchange(exchange, event),
                None => trace!(%chunk, "report for a chunk no longer queued"),
            },
            EngineMsg::NextChunk { file, uploader } => {
                if let Some(f) = self.files.get_mut(file) {
                    f.continue_upload(uploader, &mut self.uploads);
                }
            }
            EngineMsg::Preprocessed { file, job, result } => {
                if let Some(f) = self.files.get_mut(file) {
                    f.on_preprocessed(job, result, &mut self.uploads);
                }
            }
        }
    }

    fn teardown(&mut self) {
        self.files.destroy(&mut self.uploads);
        self.uploads.destroy(&mut ());
    }

    /// Lets both queues react to pending item events, then publishes.
    fn settle(&mut self) {
        loop {
            let chunks = self.uploads.pump(&mut ());
            let files = self.files.pump(&mut self.uploads);
            if !chunks && !files {
                break;
            }
        }
        if self.stopping && self.files.state() == QueueState::Stopped {
            self.stopping = false;
            self.uploads.stop(&mut ());
        }
        self.forward();
    }

    fn publish(&self, event: UploadEvent) {
        let _ = self.events.send(event);
    }

    fn forward(&mut self) {
        let mut file_events = Vec::new();
        self.watchers.retain_mut(|(uid, rx)| loop {
            match rx.try_recv() {
                Ok(event) => file_events.push((*uid, event)),
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            }
        });
        for (file, event) in file_events {
            if let Some(event) = file_event(file, event) {
                self.publish(event);
            }
        }

        while let Ok(event) = self.file_queue_events.try_recv() {
            self.publish(queue_event(event));
        }
        // The chunk queue only contributes connectivity.
        while let Ok(event) = self.upload_queue_events.try_recv() {
            if matches!(
                event,
                QueueEvent::ServerDisconnected
                    | QueueEvent::ServerReconnected
                    | QueueEvent::TooManyReconnects
            ) {
                self.publish(queue_event(event));
            }
        }
    }
}

fn queue_event(event: QueueEvent) -> UploadEvent {
    match event {
        QueueEvent::Started => UploadEvent::Started,
        QueueEvent::StateChanged { state, previous } => UploadEvent::StateChanged { state, previous },
        QueueEvent::Progress(stats) => UploadEvent::Progress(stats),
        QueueEvent::Paused => UploadEvent::Paused,
        QueueEvent::Stopped => UploadEvent::Stopped,
        QueueEvent::Done => UploadEvent::Done,
        QueueEvent::ServerDisconnected => UploadEvent::ServerDisconnected,
        QueueEvent::ServerReconnected => UploadEvent::ServerReconnected,
        QueueEvent::TooManyReconnects => UploadEvent::TooManyReconnects,
        QueueEvent::Destroyed => UploadEvent::Destroyed,
    }
}

fn file_event(file: Uuid, event: ItemEvent) -> Option<UploadEvent> {
    let event = match event {
        ItemEvent::Queued => UploadEvent::FileQueued { file },
        ItemEvent::Started => UploadEvent::FileStarted { file },
        ItemEvent::Progress(update) => UploadEvent::FileProgress {
            file,
            processed: update.processed,
            total: update.total,
            percent: update.percent,
        },
        ItemEvent::Done(outcome) => UploadEvent::FileUploaded {
            file,
            status: outcome.status,
            response: outcome.body,
        },
        ItemEvent::Aborted(outcome) => UploadEvent::FileFailed {
            file,
            status: outcome.status,
            response: outcome.body,
        },
        _ => return None,
    };
    Some(event)
}
