//! One chunk exchange, run as its own task.
//!
//! The task resolves the URL, reads the slice, sends it through the
//! [`Transport`] and reports back to the engine. It owns the inactivity
//! watchdog and the optional absolute deadline; both die with the task.
//! Cancelling the token stops it without a report.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::options::UrlResolver;
use crate::source::ByteSource;
use crate::transport::{ChunkRequest, RequestBody, Transport, TransportResponse};
use crate::types::ChunkDescriptor;

/// Time without progress after which an exchange counts as stalled.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(20);

/// Why a chunk exchange did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkFailure {
    #[error("server responded with status {0}")]
    Http(u16),

    #[error("response does not match the chunk sent")]
    InvalidChunk,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("chunk source is gone")]
    Gone,

    #[error("no progress for {}s", INACTIVITY_TIMEOUT.as_secs())]
    Stalled,

    #[error("network error: {0}")]
    Network(String),

    #[error("exchange timed out")]
    TimedOut,
}

impl ChunkFailure {
    /// HTTP-like status reported for this failure.
    pub fn status(&self) -> u16 {
        match self {
            Self::Http(status) => *status,
            Self::InvalidChunk | Self::InvalidRequest(_) => 400,
            Self::Gone => 410,
            Self::Stalled => 503,
            Self::Network(_) => 520,
            Self::TimedOut => 599,
        }
    }

    /// Failures that say nothing about the chunk itself, only about the
    /// path to the server.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Stalled | Self::Network(_) | Self::TimedOut)
    }
}

impl From<TransportError> for ChunkFailure {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => Self::TimedOut,
            TransportError::Network(msg) => Self::Network(msg),
            TransportError::InvalidRequest(msg) => Self::InvalidRequest(msg),
        }
    }
}

/// Statuses that signal the server is unreachable rather than unhappy.
pub fn is_server_unavailable(status: u16) -> bool {
    matches!(status, 503 | 520 | 599)
}

/// Where the chunk goes.
#[derive(Debug, Clone)]
pub(crate) enum Target {
    Fixed(String),
    Resolve(UrlResolver),
}

/// Body layout of the request.
#[derive(Debug, Clone)]
pub(crate) enum Encoding {
    Binary,
    Multipart {
        fields: BTreeMap<String, String>,
        file_field: String,
        file_name: String,
        mime_type: String,
    },
}

/// Everything the exchange task needs, detached from the engine.
pub(crate) struct ExchangeJob {
    pub source: Arc<dyn ByteSource>,
    pub chunk: ChunkDescriptor,
    pub target: Target,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub encoding: Encoding,
    pub timeout: Option<Duration>,
}

/// Reports from a running exchange.
#[derive(Debug)]
pub(crate) enum ExchangeEvent {
    /// The request went out.
    Sent,
    /// Cumulative bytes sent.
    Progress(u64),
    Finished(Result<TransportResponse, ChunkFailure>),
}

/// Runs one exchange to completion or cancellation.
pub(crate) async fn run<F>(
    job: ExchangeJob,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    report: F,
) where
    F: Fn(ExchangeEvent),
{
    let seq = job.chunk.seq;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(seq, "exchange cancelled");
        }
        outcome = exchange(job, transport.as_ref(), &report) => {
            report(ExchangeEvent::Finished(outcome));
        }
    }
}

async fn exchange<F>(
    job: ExchangeJob,
    transport: &dyn Transport,
    report: &F,
) -> Result<TransportResponse, ChunkFailure>
where
    F: Fn(ExchangeEvent),
{
    let ExchangeJob {
        source,
        chunk,
        target,
        method,
        headers,
        encoding,
        timeout,
    } = job;

    let url = match target {
        Target::Fixed(url) => url,
        Target::Resolve(resolver) => resolver.resolve(chunk.clone()).await,
    };

    let data = match source.slice(chunk.start, chunk.end).await {
        Ok(data) => data,
        Err(e) => {
            warn!(seq = chunk.seq, error = %e, "chunk source unreadable");
            return Err(ChunkFailure::Gone);
        }
    };
    if data.is_empty() && chunk.size > 0 {
        warn!(seq = chunk.seq, size = chunk.size, "chunk source is empty");
        return Err(ChunkFailure::Gone);
    }

    let body = match encoding {
        Encoding::Binary => RequestBody::Binary(data),
        Encoding::Multipart {
            fields,
            file_field,
            file_name,
            mime_type,
        } => RequestBody::Multipart {
            fields,
            file_field,
            file_name,
            mime_type,
            data,
        },
    };
    let request = ChunkRequest {
        method,
        url,
        headers,
        body,
        chunk,
    };

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    report(ExchangeEvent::Sent);
    let send = transport.send(request, progress_tx);
    tokio::pin!(send);

    let stall = sleep(INACTIVITY_TIMEOUT);
    tokio::pin!(stall);
    let deadline = sleep_until(
        timeout
            .map(|t| Instant::now() + t)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400 * 365)),
    );
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            result = &mut send => {
                return result.map_err(ChunkFailure::from);
            }
            Some(sent) = progress_rx.recv() => {
                stall.as_mut().reset(Instant::now() + INACTIVITY_TIMEOUT);
                report(ExchangeEvent::Progress(sent));
            }
            _ = &mut deadline, if timeout.is_some() => {
                return Err(ChunkFailure::TimedOut);
            }
            _ = &mut stall => {
                return Err(ChunkFailure::Stalled);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use crate::transport::{ProgressSink, SendFuture};
    use std::sync::Mutex;

    /// Sends progress reports then hangs or answers.
    struct Scripted {
        progress: Vec<u64>,
        gap: Duration,
        answer: Option<Result<u16, &'static str>>,
        requests: Mutex<Vec<ChunkRequest>>,
    }

    impl Scripted {
        fn new(answer: Option<Result<u16, &'static str>>) -> Self {
            Self {
                progress: Vec::new(),
                gap: Duration::ZERO,
                answer,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    impl Transport for Scripted {
        fn send(&self, request: ChunkRequest, progress: ProgressSink) -> SendFuture<'_> {
            self.requests.lock().unwrap().push(request);
            Box::pin(async move {
                for sent in &self.progress {
                    tokio::time::sleep(self.gap).await;
                    let _ = progress.send(*sent);
                }
                match self.answer {
                    Some(Ok(status)) => Ok(TransportResponse {
                        status,
                        ..Default::default()
                    }),
                    Some(Err(msg)) => Err(TransportError::Network(msg.into())),
                    None => std::future::pending().await,
                }
            })
        }
    }

    fn job(source: Arc<dyn ByteSource>, timeout: Option<Duration>) -> ExchangeJob {
        let size = source.size();
        ExchangeJob {
            source,
            chunk: ChunkDescriptor::new(0, 0, 1, size, "a.bin".into()),
            target: Target::Fixed("http://x/up".into()),
            method: "POST".into(),
            headers: BTreeMap::new(),
            encoding: Encoding::Binary,
            timeout,
        }
    }

    async fn run_collect(job: ExchangeJob, transport: Arc<Scripted>) -> Vec<ExchangeEvent> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        run(job, transport, CancellationToken::new(), move |e| {
            sink.lock().unwrap().push(e)
        })
        .await;
        Arc::try_unwrap(events).unwrap().into_inner().unwrap()
    }

    fn finished(events: &[ExchangeEvent]) -> &Result<TransportResponse, ChunkFailure> {
        match events.last() {
            Some(ExchangeEvent::Finished(result)) => result,
            other => panic!("expected Finished, got {other:?}"),
        }
    }

    #[test]
    fn failure_statuses() {
        assert_eq!(ChunkFailure::InvalidChunk.status(), 400);
        assert_eq!(ChunkFailure::Gone.status(), 410);
        assert_eq!(ChunkFailure::Stalled.status(), 503);
        assert_eq!(ChunkFailure::Network("x".into()).status(), 520);
        assert_eq!(ChunkFailure::TimedOut.status(), 599);
        assert!(is_server_unavailable(503));
        assert!(is_server_unavailable(599));
        assert!(!is_server_unavailable(500));
        assert!(!ChunkFailure::Gone.is_connectivity());
    }

    #[test]
    fn malformed_request_is_not_a_connectivity_failure() {
        let failure = ChunkFailure::from(TransportError::InvalidRequest("bad url".into()));
        assert_eq!(failure, ChunkFailure::InvalidRequest("bad url".into()));
        assert_eq!(failure.status(), 400);
        assert!(!failure.is_connectivity());
        assert!(!is_server_unavailable(failure.status()));

        let failure = ChunkFailure::from(TransportError::Network("reset".into()));
        assert!(failure.is_connectivity());
    }

    #[tokio::test]
    async fn sends_slice_and_reports_response() {
        let transport = Arc::new(Scripted {
            progress: vec![2, 4],
            ..Scripted::new(Some(Ok(200)))
        });
        let source = Arc::new(MemorySource::new("a.bin", vec![7; 4]));
        let events = run_collect(job(source, None), Arc::clone(&transport)).await;

        assert!(matches!(events[0], ExchangeEvent::Sent));
        assert!(matches!(events[1], ExchangeEvent::Progress(2)));
        assert!(matches!(events[2], ExchangeEvent::Progress(4)));
        assert_eq!(finished(&events).as_ref().unwrap().status, 200);

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].body.data(), &[7, 7, 7, 7]);
        assert_eq!(requests[0].url, "http://x/up");
    }

    #[tokio::test]
    async fn empty_source_is_gone_without_sending() {
        let transport = Arc::new(Scripted::new(Some(Ok(200))));
        let source = MemorySource::new("a.bin", vec![1; 10]);
        source.clear();
        let events = run_collect(job(Arc::new(source), None), Arc::clone(&transport)).await;

        assert_eq!(finished(&events), &Err(ChunkFailure::Gone));
        assert!(transport.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_file_is_sent() {
        let transport = Arc::new(Scripted::new(Some(Ok(200))));
        let source = Arc::new(MemorySource::new("empty", Vec::new()));
        let events = run_collect(job(source, None), Arc::clone(&transport)).await;
        assert!(finished(&events).is_ok());
    }

    #[tokio::test]
    async fn resolver_picks_the_url() {
        let transport = Arc::new(Scripted::new(Some(Ok(200))));
        let source = Arc::new(MemorySource::new("a.bin", vec![1; 3]));
        let mut job = job(source, None);
        job.target = Target::Resolve(UrlResolver::sync(|c| format!("http://r/{}", c.seq)));
        run_collect(job, Arc::clone(&transport)).await;
        assert_eq!(transport.requests.lock().unwrap()[0].url, "http://r/0");
    }

    #[tokio::test]
    async fn network_error_is_classified() {
        let transport = Arc::new(Scripted::new(Some(Err("reset"))));
        let source = Arc::new(MemorySource::new("a.bin", vec![1; 3]));
        let events = run_collect(job(source, None), transport).await;
        let failure = finished(&events).as_ref().unwrap_err();
        assert_eq!(failure.status(), 520);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_exchange_trips_the_watchdog() {
        let transport = Arc::new(Scripted::new(None));
        let source = Arc::new(MemorySource::new("a.bin", vec![1; 3]));
        let started = Instant::now();
        let events = run_collect(job(source, None), transport).await;

        assert_eq!(finished(&events), &Err(ChunkFailure::Stalled));
        let waited = started.elapsed();
        assert!(waited >= INACTIVITY_TIMEOUT && waited < INACTIVITY_TIMEOUT + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_keeps_the_watchdog_away() {
        let transport = Arc::new(Scripted {
            progress: vec![1, 2, 3],
            gap: Duration::from_secs(15),
            ..Scripted::new(Some(Ok(200)))
        });
        let source = Arc::new(MemorySource::new("a.bin", vec![1; 3]));
        let events = run_collect(job(source, None), transport).await;
        assert!(finished(&events).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_times_out() {
        let transport = Arc::new(Scripted::new(None));
        let source = Arc::new(MemorySource::new("a.bin", vec![1; 3]));
        let events = run_collect(job(source, Some(Duration::from_secs(5))), transport).await;
        assert_eq!(finished(&events), &Err(ChunkFailure::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_exchange_reports_nothing() {
        let transport = Arc::new(Scripted::new(None));
        let source = Arc::new(MemorySource::new("a.bin", vec![1; 3]));
        let cancel = CancellationToken::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);

        let task = tokio::spawn(run(job(source, None), transport, cancel.clone(), move |e| {
            sink.lock().unwrap().push(e)
        }));
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        task.await.unwrap();

        let events = events.lock().unwrap();
        assert!(events.iter().all(|e| !matches!(e, ExchangeEvent::Finished(_))));
    }
}
