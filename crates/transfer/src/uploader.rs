//! File transfer coordinator.
//!
//! Splits one file into chunks and feeds them to the shared chunk queue.
//! Parallelism comes from the queue's slot budget: after each dispatch the
//! coordinator keeps adding chunks while the queue reports spare slots.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use chunkload_queue::{ItemEvent, ItemState, Outcome, Queue, QueueState, Queueable, WorkItem};

use crate::chunk::ChunkUploader;
use crate::dispatch::Dispatcher;
use crate::exchange::is_server_unavailable;
use crate::options::UploadOptions;
use crate::source::ByteSource;
use crate::types::{ChunkDescriptor, ChunkRecord, chunk_count};

/// The chunk queue every coordinator submits to.
pub type ChunkQueue = Queue<ChunkUploader>;

struct Watcher {
    seq: u32,
    uid: Uuid,
    events: mpsc::UnboundedReceiver<ItemEvent>,
}

pub struct FileUploader {
    work: WorkItem,
    file: Uuid,
    source: Arc<dyn ByteSource>,
    name: String,
    relative_path: Option<String>,
    options: Arc<UploadOptions>,
    params: BTreeMap<String, String>,
    chunk_size: u64,
    total_chunks: u32,
    records: BTreeMap<u32, ChunkRecord>,
    watchers: Vec<Watcher>,
    dispatcher: Dispatcher,
}

impl FileUploader {
    pub(crate) fn new(
        file: Uuid,
        source: Arc<dyn ByteSource>,
        name: String,
        relative_path: Option<String>,
        options: Arc<UploadOptions>,
        dispatcher: Dispatcher,
    ) -> Self {
        let size = source.size();
        Self {
            work: WorkItem::new(Uuid::new_v4(), size),
            file,
            source,
            name,
            relative_path,
            options,
            params: BTreeMap::new(),
            chunk_size: 0,
            total_chunks: 1,
            records: BTreeMap::new(),
            watchers: Vec::new(),
            dispatcher,
        }
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Latest known record per chunk sequence.
    pub fn records(&self) -> &BTreeMap<u32, ChunkRecord> {
        &self.records
    }

    fn size(&self) -> u64 {
        self.source.size()
    }

    /// Name sent with each chunk: relative path when there is one.
    fn descriptor_name(&self) -> String {
        self.relative_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(&self.name)
            .to_string()
    }

    /// Lowest sequence with no record yet; `total_chunks` when all are known.
    pub fn next_chunk(&self) -> u32 {
        (0..self.total_chunks)
            .find(|seq| !self.records.contains_key(seq))
            .unwrap_or(self.total_chunks)
    }

    /// Dispatches `seq`, then keeps dispatching while the queue has room.
    pub fn upload_chunk(&mut self, seq: u32, uploads: &mut ChunkQueue) -> bool {
        if !self.dispatch(seq, uploads) {
            return false;
        }
        while uploads.state() == QueueState::Started && uploads.spare_slots() > 0 {
            let next = self.next_chunk();
            if !self.dispatch(next, uploads) {
                break;
            }
        }
        true
    }

    /// Continues with the lowest missing sequence.
    pub(crate) fn continue_upload(&mut self, uploads: &mut ChunkQueue) {
        if self.work.state() != ItemState::Processing {
            return;
        }
        let seq = self.next_chunk();
        self.upload_chunk(seq, uploads);
    }

    fn dispatch(&mut self, seq: u32, uploads: &mut ChunkQueue) -> bool {
        let size = self.size();
        if seq >= self.total_chunks {
            return false;
        }
        let descriptor = ChunkDescriptor::new(
            seq,
            self.chunk_size,
            self.total_chunks,
            size,
            self.descriptor_name(),
        );
        // A zero-byte file still goes out as one empty chunk.
        if descriptor.start >= size && !(size == 0 && seq == 0) {
            debug!(seq, start = descriptor.start, size, "chunk outside the file, skipping");
            return false;
        }
        if let Some(record) = self.records.get(&seq) {
            if matches!(record.state, ItemState::Processing | ItemState::Done) {
                trace!(seq, state = ?record.state, "chunk already dispatched");
                return false;
            }
        }

        let mut params = self.params.clone();
        params.insert("chunk".into(), seq.to_string());
        params.insert("chunks".into(), self.total_chunks.to_string());

        let mut chunk = ChunkUploader::new(
            Arc::clone(&self.source),
            Arc::clone(&self.options),
            params,
            self.name.clone(),
            descriptor,
            self.dispatcher.clone(),
        );
        let uid = chunk.uid();
        let events = chunk.work_mut().subscribe();
        self.watchers.push(Watcher { seq, uid, events });
        self.records.insert(
            seq,
            ChunkRecord {
                state: ItemState::Processing,
                descriptor: chunk.descriptor().clone(),
            },
        );
        debug!(file = %self.file, seq, chunk = %uid, "chunk dispatched");
        uploads.add_item(chunk, &mut ());
        true
    }

    /// Bytes credited so far: full size for finished chunks, live progress
    /// for the rest.
    fn calc_processed(&self, uploads: &ChunkQueue) -> u64 {
        self.records
            .values()
            .map(|record| match record.state {
                ItemState::Done => record.descriptor.size,
                _ => record
                    .descriptor
                    .uid
                    .and_then(|uid| uploads.get(uid))
                    .map_or(0, |chunk| chunk.work().processed()),
            })
            .sum()
    }

    fn all_done(&self) -> bool {
        (0..self.total_chunks).all(|seq| {
            self.records
                .get(&seq)
                .is_some_and(|r| r.state == ItemState::Done)
        })
    }

    fn set_record_state(&mut self, seq: u32, state: ItemState) {
        if let Some(record) = self.records.get_mut(&seq) {
            record.state = state;
        }
    }

    fn on_chunk_event(&mut self, seq: u32, uid: Uuid, event: ItemEvent, uploads: &mut ChunkQueue) {
        if self.work.state() != ItemState::Processing {
            return;
        }

        match event {
            ItemEvent::Started | ItemEvent::Resumed => {
                self.set_record_state(seq, ItemState::Processing);
            }
            ItemEvent::Paused => self.set_record_state(seq, ItemState::Paused),
            ItemEvent::Stopped => self.set_record_state(seq, ItemState::Idle),
            ItemEvent::Progress(_) => {
                let processed = self.calc_processed(uploads);
                self.work.progress(processed, Some(self.size()));
            }
            ItemEvent::Failed(outcome) => {
                self.set_record_state(seq, ItemState::Failed);
                if self.options.stop_file_on_chunk_fail && !is_server_unavailable(outcome.status) {
                    warn!(file = %self.file, seq, status = outcome.status, "chunk failed, failing file");
                    self.work.failed(outcome);
                }
            }
            ItemEvent::Aborted(outcome) => {
                self.set_record_state(seq, ItemState::Failed);
                if is_server_unavailable(outcome.status) {
                    if let Some(chunk) = uploads.get_mut(uid) {
                        chunk.server_disconnected();
                    }
                } else {
                    warn!(file = %self.file, seq, status = outcome.status, "chunk aborted, failing file");
                    self.work.failed(outcome);
                }
            }
            ItemEvent::Done(outcome) => {
                self.set_record_state(seq, ItemState::Done);
                if let Some(record) = self.records.get_mut(&seq) {
                    record.descriptor.request_sent = true;
                    record.descriptor.response_received = true;
                }
                if self.all_done() {
                    let size = self.size();
                    info!(file = %self.file, chunks = self.total_chunks, size, "file uploaded");
                    self.work.progress(size, Some(size));
                    self.work.done(outcome);
                } else if self.chunk_size > 0 {
                    self.dispatcher.defer_next_chunk(self.file, self.work.uid());
                }
            }
            ItemEvent::Completed => {
                let done = self
                    .records
                    .get(&seq)
                    .is_some_and(|r| r.state == ItemState::Done);
                if done {
                    trace!(seq, chunk = %uid, "evicting finished chunk");
                    uploads.remove_item(uid, &mut ());
                }
            }
            _ => {}
        }
    }
}

impl Queueable for FileUploader {
    type Context = ChunkQueue;

    fn work(&self) -> &WorkItem {
        &self.work
    }

    fn work_mut(&mut self) -> &mut WorkItem {
        &mut self.work
    }

    fn start(&mut self, uploads: &mut ChunkQueue) {
        if self.work.is_destroyed() {
            return;
        }
        // Chunk size is fixed for the file from here on.
        self.chunk_size = self.options.chunk_size;
        self.total_chunks = chunk_count(self.size(), self.chunk_size);
        self.params = self.options.params.clone();
        if self.options.send_file_name {
            self.params.insert("name".into(), self.name.clone());
        }

        self.work.start();
        info!(
            file = %self.file,
            name = %self.name,
            size = self.size(),
            chunks = self.total_chunks,
            "file upload started"
        );
        self.upload_chunk(0, uploads);
    }

    fn stop(&mut self, uploads: &mut ChunkQueue) {
        self.release_chunks(uploads);
        self.work.stop();
    }

    fn abort(&mut self, outcome: Outcome, uploads: &mut ChunkQueue) {
        self.release_chunks(uploads);
        self.work.abort(outcome);
    }

    fn destroy(&mut self, uploads: &mut ChunkQueue) {
        if self.work.is_destroyed() {
            return;
        }
        self.release_chunks(uploads);
        self.work.destroy();
    }

    /// Drains chunk events. Returns `true` if any were handled.
    fn pump(&mut self, uploads: &mut ChunkQueue) -> bool {
        let mut handled = false;
        let mut idx = 0;
        while idx < self.watchers.len() {
            let watcher = &mut self.watchers[idx];
            match watcher.events.try_recv() {
                Ok(event) => {
                    let (seq, uid) = (watcher.seq, watcher.uid);
                    self.on_chunk_event(seq, uid, event, uploads);
                    handled = true;
                }
                Err(mpsc::error::TryRecvError::Empty) => idx += 1,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.watchers.remove(idx);
                }
            }
        }
        handled
    }
}

impl FileUploader {
    /// Removes every tracked chunk from the queue and forgets them.
    fn release_chunks(&mut self, uploads: &mut ChunkQueue) {
        for record in self.records.values() {
            if let Some(uid) = record.descriptor.uid {
                uploads.remove_item(uid, &mut ());
            }
        }
        self.records.clear();
        self.watchers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::EngineMsg;
    use crate::testing::{MockTransport, Reply};
    use crate::source::MemorySource;
    use chunkload_queue::QueueOptions;

    struct Harness {
        transport: Arc<MockTransport>,
        inbox: mpsc::UnboundedReceiver<EngineMsg>,
        uploads: ChunkQueue,
        uploader: FileUploader,
        source: Arc<MemorySource>,
        events: mpsc::UnboundedReceiver<ItemEvent>,
    }

    fn harness(size: usize, options: UploadOptions, transport: MockTransport) -> Harness {
        let transport = Arc::new(transport);
        let (tx, inbox) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(transport.clone(), tx);
        let uploads = ChunkQueue::new(QueueOptions {
            max_slots: options.max_slots,
            max_retries: options.max_retries,
            auto_start: true,
            ..Default::default()
        });
        let source = Arc::new(MemorySource::new("a.bin", vec![1; size]));
        let mut uploader = FileUploader::new(
            Uuid::new_v4(),
            source.clone(),
            "a.bin".into(),
            None,
            Arc::new(options),
            dispatcher,
        );
        let events = uploader.work_mut().subscribe();
        Harness {
            transport,
            inbox,
            uploads,
            uploader,
            source,
            events,
        }
    }

    impl Harness {
        fn settle(&mut self) {
            loop {
                let a = self.uploads.pump(&mut ());
                let b = self.uploader.pump(&mut self.uploads);
                if !a && !b {
                    break;
                }
            }
        }

        /// Drives the coordinator until it reaches a terminal state.
        async fn run(&mut self) {
            self.settle();
            while !matches!(self.uploader.state(), ItemState::Done | ItemState::Failed) {
                tokio::select! {
                    msg = self.inbox.recv() => match msg {
                        Some(EngineMsg::Exchange { chunk, exchange, event }) => {
                            if let Some(unit) = self.uploads.get_mut(chunk) {
                                unit.on_exchange(exchange, event);
                            }
                        }
                        Some(EngineMsg::NextChunk { .. }) => {
                            self.uploader.continue_upload(&mut self.uploads);
                        }
                        Some(EngineMsg::Preprocessed { .. }) => {}
                        None => break,
                    },
                    wakeup = self.uploads.next_wakeup() => {
                        self.uploads.on_wakeup(wakeup, &mut ());
                    }
                }
                self.settle();
            }
        }

        fn events(&mut self) -> Vec<ItemEvent> {
            let mut out = Vec::new();
            while let Ok(ev) = self.events.try_recv() {
                out.push(ev);
            }
            out
        }
    }

    fn opts(chunk_size: u64, max_slots: usize) -> UploadOptions {
        UploadOptions {
            url: "http://x/up".into(),
            chunk_size,
            max_slots,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn three_chunks_two_slots() {
        let mut h = harness(3_000, opts(1_000, 2), MockTransport::new());
        h.uploader.start(&mut h.uploads);
        assert_eq!(h.uploader.total_chunks(), 3);
        // Two slots fill at once.
        assert_eq!(h.uploader.records().len(), 2);
        h.run().await;

        assert_eq!(h.uploader.state(), ItemState::Done);
        assert_eq!(h.uploader.work().processed(), 3_000);
        assert_eq!(h.transport.peak(), 2);

        let mut seqs: Vec<u32> = h.transport.requests().iter().map(|r| r.chunk.seq).collect();
        seqs.sort_unstable();
        assert_eq!(seqs, vec![0, 1, 2]);

        let done = h.events().iter().filter(|e| matches!(e, ItemEvent::Done(_))).count();
        assert_eq!(done, 1);
        // Finished chunks are evicted from the queue.
        assert_eq!(h.uploads.count(), 0);
    }

    #[tokio::test]
    async fn single_slot_goes_in_order() {
        let mut h = harness(2_500, opts(1_000, 1), MockTransport::new());
        h.uploader.start(&mut h.uploads);
        h.run().await;

        let seqs: Vec<u32> = h.transport.requests().iter().map(|r| r.chunk.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(h.transport.peak(), 1);
        let last = &h.transport.requests()[2];
        assert_eq!(last.body.data().len(), 500);
    }

    #[tokio::test]
    async fn zero_chunk_size_sends_the_whole_file() {
        let mut h = harness(4_321, opts(0, 3), MockTransport::new());
        h.uploader.start(&mut h.uploads);
        h.run().await;

        assert_eq!(h.uploader.state(), ItemState::Done);
        let requests = h.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].body.data().len(), 4_321);
    }

    #[tokio::test]
    async fn empty_file_is_one_empty_chunk() {
        let mut h = harness(0, opts(1_000, 1), MockTransport::new());
        h.uploader.start(&mut h.uploads);
        h.run().await;

        assert_eq!(h.uploader.state(), ItemState::Done);
        assert_eq!(h.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn params_carry_sequence_and_name() {
        let mut options = opts(1_000, 1);
        options.params.insert("token".into(), "t".into());
        let mut h = harness(1_500, options, MockTransport::new());
        h.uploader.start(&mut h.uploads);
        h.run().await;

        let req = &h.transport.requests()[1];
        match &req.body {
            crate::transport::RequestBody::Multipart { fields, .. } => {
                assert_eq!(fields.get("chunk").map(String::as_str), Some("1"));
                assert_eq!(fields.get("chunks").map(String::as_str), Some("2"));
                assert_eq!(fields.get("name").map(String::as_str), Some("a.bin"));
                assert_eq!(fields.get("token").map(String::as_str), Some("t"));
            }
            other => panic!("expected multipart, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn chunk_failure_fails_the_file() {
        let transport = MockTransport::new().script(1, [Reply::Status(500)]);
        let mut h = harness(3_000, opts(1_000, 1), transport);
        h.uploader.start(&mut h.uploads);
        h.run().await;

        assert_eq!(h.uploader.state(), ItemState::Failed);
        assert!(h.events().iter().any(|e| matches!(e, ItemEvent::Failed(o) if o.status == 500)));
    }

    #[tokio::test]
    async fn chunk_retries_when_file_tolerates_failures() {
        let mut options = opts(1_000, 1);
        options.stop_file_on_chunk_fail = false;
        options.max_retries = 2;
        let transport = MockTransport::new().script(1, [Reply::Status(500), Reply::Status(502)]);
        let mut h = harness(3_000, options, transport);
        h.uploader.start(&mut h.uploads);
        h.run().await;

        assert_eq!(h.uploader.state(), ItemState::Done);
        let seqs: Vec<u32> = h.transport.requests().iter().map(|r| r.chunk.seq).collect();
        assert_eq!(seqs, vec![0, 1, 1, 1, 2]);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_file() {
        let mut options = opts(1_000, 1);
        options.stop_file_on_chunk_fail = false;
        options.max_retries = 1;
        let transport = MockTransport::new().script(0, [Reply::Status(500), Reply::Status(500)]);
        let mut h = harness(2_000, options, transport);
        h.uploader.start(&mut h.uploads);
        h.run().await;

        assert_eq!(h.uploader.state(), ItemState::Failed);
        assert_eq!(h.transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn gone_source_fails_without_request() {
        let transport = MockTransport::new();
        let mut h = harness(2_000, opts(1_000, 1), transport);
        h.source.clear();
        h.uploader.start(&mut h.uploads);
        h.run().await;

        assert_eq!(h.uploader.state(), ItemState::Failed);
        assert!(h.events().iter().any(|e| matches!(e, ItemEvent::Failed(o) if o.status == 410)));
    }

    #[tokio::test]
    async fn next_chunk_skips_known_sequences() {
        let mut h = harness(3_000, opts(1_000, 1), MockTransport::new().script(0, [Reply::Hang]));
        h.uploader.start(&mut h.uploads);
        assert_eq!(h.uploader.next_chunk(), 1);
        // Sequence 0 is in flight and never dispatched twice.
        assert!(!h.uploader.dispatch(0, &mut h.uploads));
        assert!(!h.uploader.dispatch(7, &mut h.uploads));
    }

    #[tokio::test]
    async fn destroy_removes_chunks() {
        let mut h = harness(3_000, opts(1_000, 2), MockTransport::new().script(0, [Reply::Hang]));
        h.uploader.start(&mut h.uploads);
        assert_eq!(h.uploads.count(), 2);

        h.uploader.destroy(&mut h.uploads);
        h.settle();
        assert_eq!(h.uploads.count(), 0);
        assert!(h.uploader.records().is_empty());
        assert_eq!(h.uploader.state(), ItemState::Destroyed);
    }
}
