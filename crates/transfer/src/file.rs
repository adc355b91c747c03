//! The File entity: what the file queue schedules.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chunkload_queue::{ItemEvent, ItemState, Outcome, Queueable, WorkItem};

use crate::dispatch::Dispatcher;
use crate::error::UploadError;
use crate::options::UploadOptions;
use crate::source::ByteSource;
use crate::types::FileSnapshot;
use crate::uploader::{ChunkQueue, FileUploader};
use crate::validation::validate_file_name;

/// Boxed future returned by [`Preprocess::process`].
pub type PreprocessFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Arc<dyn ByteSource>, UploadError>> + Send + 'a>>;

/// Transforms a file before upload (resizing, re-encoding, ...).
///
/// Runs off the engine task. When it fails the original content is uploaded.
pub trait Preprocess: Send + Sync {
    fn applies_to(&self, source: &dyn ByteSource) -> bool;

    fn process(&self, source: Arc<dyn ByteSource>) -> PreprocessFuture<'_>;
}

struct ActiveUpload {
    uploader: FileUploader,
    events: mpsc::UnboundedReceiver<ItemEvent>,
}

/// A file waiting for, or going through, upload.
pub struct File {
    work: WorkItem,
    name: String,
    relative_path: Option<String>,
    source: Arc<dyn ByteSource>,
    options: Arc<UploadOptions>,
    dispatcher: Dispatcher,
    preprocessor: Option<Arc<dyn Preprocess>>,
    preprocess_job: Option<(u64, CancellationToken)>,
    preprocess_runs: u64,
    upload: Option<ActiveUpload>,
}

impl File {
    pub(crate) fn new(
        source: Arc<dyn ByteSource>,
        options: Arc<UploadOptions>,
        dispatcher: Dispatcher,
        preprocessor: Option<Arc<dyn Preprocess>>,
    ) -> Self {
        let name = source.name().to_string();
        let relative_path = source.relative_path().map(str::to_string);
        Self {
            work: WorkItem::new(Uuid::new_v4(), source.size()),
            name,
            relative_path,
            source,
            options,
            dispatcher,
            preprocessor,
            preprocess_job: None,
            preprocess_runs: 0,
            upload: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn relative_path(&self) -> Option<&str> {
        self.relative_path.as_deref()
    }

    /// Current size; preprocessing may change it.
    pub fn size(&self) -> u64 {
        self.source.size()
    }

    pub fn source(&self) -> &Arc<dyn ByteSource> {
        &self.source
    }

    /// Renames the file. The last component of the relative path follows.
    pub fn rename(&mut self, new_name: &str) -> Result<(), UploadError> {
        validate_file_name(new_name)?;
        if let Some(path) = &self.relative_path {
            if let Some(dir) = path.strip_suffix(self.name.as_str()) {
                self.relative_path = Some(format!("{dir}{new_name}"));
            }
        }
        debug!(uid = %self.uid(), from = %self.name, to = %new_name, "file renamed");
        self.name = new_name.to_string();
        Ok(())
    }

    pub fn snapshot(&self) -> FileSnapshot {
        FileSnapshot {
            uid: self.uid(),
            name: self.name.clone(),
            relative_path: self.relative_path.clone(),
            size: self.size(),
            state: self.state(),
            processed: self.work.processed(),
            percent: self.work.percent(),
            retries: self.work.retries(),
        }
    }

    /// Hands the file to a fresh coordinator.
    fn upload(&mut self, uploads: &mut ChunkQueue) {
        let mut uploader = FileUploader::new(
            self.uid(),
            Arc::clone(&self.source),
            self.name.clone(),
            self.relative_path.clone(),
            Arc::clone(&self.options),
            self.dispatcher.clone(),
        );
        let events = uploader.work_mut().subscribe();
        uploader.start(uploads);
        self.upload = Some(ActiveUpload { uploader, events });
    }

    /// Resumes chunk dispatch for the coordinator `uploader`, if it is
    /// still the current one.
    pub(crate) fn continue_upload(&mut self, uploader: Uuid, uploads: &mut ChunkQueue) {
        if let Some(active) = &mut self.upload {
            if active.uploader.uid() == uploader {
                active.uploader.continue_upload(uploads);
            }
        }
    }

    /// Takes the result of preprocessing job `job` and starts the upload.
    pub(crate) fn on_preprocessed(
        &mut self,
        job: u64,
        result: Result<Arc<dyn ByteSource>, UploadError>,
        uploads: &mut ChunkQueue,
    ) {
        if self.preprocess_job.as_ref().map(|(id, _)| *id) != Some(job) {
            return;
        }
        self.preprocess_job = None;
        if self.state() != ItemState::Processing {
            return;
        }

        match result {
            Ok(source) => {
                debug!(uid = %self.uid(), before = self.size(), after = source.size(), "file preprocessed");
                self.source = source;
            }
            Err(e) => {
                warn!(uid = %self.uid(), error = %e, "preprocessing failed, uploading original");
            }
        }
        self.upload(uploads);
    }

    fn release(&mut self, uploads: &mut ChunkQueue) {
        if let Some((_, cancel)) = self.preprocess_job.take() {
            cancel.cancel();
        }
        if let Some(mut active) = self.upload.take() {
            active.uploader.destroy(uploads);
        }
    }

    fn on_upload_event(&mut self, event: ItemEvent, uploads: &mut ChunkQueue) {
        match event {
            ItemEvent::Progress(update) => self.work.progress(update.processed, Some(update.total)),
            ItemEvent::Done(outcome) => {
                self.release(uploads);
                info!(uid = %self.uid(), name = %self.name, "file done");
                self.work.done(outcome);
            }
            ItemEvent::Failed(outcome) => {
                self.release(uploads);
                warn!(uid = %self.uid(), name = %self.name, status = outcome.status, "file failed");
                self.work.failed(outcome);
            }
            _ => {}
        }
    }
}

impl Queueable for File {
    type Context = ChunkQueue;

    fn work(&self) -> &WorkItem {
        &self.work
    }

    fn work_mut(&mut self) -> &mut WorkItem {
        &mut self.work
    }

    fn start(&mut self, uploads: &mut ChunkQueue) {
        self.work.start();

        let preprocessor = self
            .preprocessor
            .as_ref()
            .filter(|p| p.applies_to(self.source.as_ref()))
            .cloned();
        match preprocessor {
            Some(preprocessor) => {
                self.preprocess_runs += 1;
                let job = self.preprocess_runs;
                let cancel = self.dispatcher.spawn_preprocess(
                    self.uid(),
                    job,
                    preprocessor,
                    Arc::clone(&self.source),
                );
                debug!(uid = %self.uid(), job, "preprocessing file");
                self.preprocess_job = Some((job, cancel));
            }
            None => self.upload(uploads),
        }
    }

    fn stop(&mut self, uploads: &mut ChunkQueue) {
        self.release(uploads);
        self.work.stop();
    }

    fn abort(&mut self, outcome: Outcome, uploads: &mut ChunkQueue) {
        self.release(uploads);
        self.work.abort(outcome);
    }

    fn destroy(&mut self, uploads: &mut ChunkQueue) {
        self.release(uploads);
        self.work.destroy();
    }

    fn pump(&mut self, uploads: &mut ChunkQueue) -> bool {
        let Some(active) = &mut self.upload else {
            return false;
        };
        let mut handled = active.uploader.pump(uploads);

        let mut pending = Vec::new();
        while let Ok(event) = active.events.try_recv() {
            pending.push(event);
        }
        for event in pending {
            handled = true;
            self.on_upload_event(event, uploads);
        }
        handled
    }
}
