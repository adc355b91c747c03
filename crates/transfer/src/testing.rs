//! Scripted in-memory transport for tests.
//!
//! Enabled for this crate's own tests and, through the `test-util`
//! feature, for integration tests and downstream crates.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::TransportError;
use crate::transport::{ChunkRequest, ProgressSink, SendFuture, Transport, TransportResponse};
use crate::types::ChunkDescriptor;

/// Scripted answer to one request.
#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16),
    /// Status plus one response header.
    Header(u16, &'static str, &'static str),
    NetworkError,
    /// Never answers and never reports progress.
    Hang,
}

/// Answers 200 unless a reply was scripted for the chunk. Every request is
/// recorded, as is the most exchanges seen in flight at once.
pub struct MockTransport {
    scripts: Mutex<HashMap<(Option<String>, u32), VecDeque<Reply>>>,
    requests: Mutex<Vec<ChunkRequest>>,
    latency: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            latency: Duration::from_millis(10),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Queues replies for chunk `seq` of any file.
    pub fn script(self, seq: u32, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.push(None, seq, replies);
        self
    }

    /// Queues replies for chunk `seq` of the file named `file`. These win
    /// over replies scripted with [`script`](Self::script).
    pub fn script_file(self, file: &str, seq: u32, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.push(Some(file.to_string()), seq, replies);
        self
    }

    fn push(&self, file: Option<String>, seq: u32, replies: impl IntoIterator<Item = Reply>) {
        self.scripts
            .lock()
            .unwrap()
            .entry((file, seq))
            .or_default()
            .extend(replies);
    }

    fn next_reply(&self, chunk: &ChunkDescriptor) -> Reply {
        let mut scripts = self.scripts.lock().unwrap();
        [Some(chunk.file_name.clone()), None]
            .into_iter()
            .find_map(|file| scripts.get_mut(&(file, chunk.seq)).and_then(VecDeque::pop_front))
            .unwrap_or(Reply::Status(200))
    }

    pub fn requests(&self) -> Vec<ChunkRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Sequences requested for `file`, in request order.
    pub fn sequences(&self, file: &str) -> Vec<u32> {
        self.requests()
            .iter()
            .filter(|r| r.chunk.file_name == file)
            .map(|r| r.chunk.seq)
            .collect()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Transport for MockTransport {
    fn send(&self, request: ChunkRequest, progress: ProgressSink) -> SendFuture<'_> {
        let reply = self.next_reply(&request.chunk);
        let len = request.body.data().len() as u64;
        self.requests.lock().unwrap().push(request);

        Box::pin(async move {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlight(&self.active);

            if let Reply::Hang = reply {
                return std::future::pending().await;
            }
            tokio::time::sleep(self.latency / 2).await;
            let _ = progress.send(len / 2);
            tokio::time::sleep(self.latency / 2).await;
            let _ = progress.send(len);

            match reply {
                Reply::Status(status) => Ok(TransportResponse {
                    status,
                    headers: BTreeMap::new(),
                    body: format!("status {status}"),
                }),
                Reply::Header(status, name, value) => Ok(TransportResponse {
                    status,
                    headers: BTreeMap::from([(name.to_string(), value.to_string())]),
                    body: String::new(),
                }),
                Reply::NetworkError => Err(TransportError::Network("connection reset".into())),
                Reply::Hang => unreachable!(),
            }
        })
    }
}
