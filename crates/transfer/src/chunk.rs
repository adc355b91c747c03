//! Chunk transfer unit: one queued item per chunk exchange.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use chunkload_queue::{Outcome, Queueable, WorkItem};

use crate::dispatch::Dispatcher;
use crate::exchange::{ChunkFailure, Encoding, ExchangeEvent, ExchangeJob, Target};
use crate::options::UploadOptions;
use crate::source::ByteSource;
use crate::transport::TransportResponse;
use crate::types::ChunkDescriptor;
use crate::url::build_url;

/// Uploads one chunk of a file.
///
/// Every start or resume launches a fresh exchange; pausing, stopping,
/// aborting and destroying cancel it. Reports from an exchange that is no
/// longer current are dropped.
pub struct ChunkUploader {
    work: WorkItem,
    descriptor: ChunkDescriptor,
    source: Arc<dyn ByteSource>,
    options: Arc<UploadOptions>,
    params: BTreeMap<String, String>,
    file_name: String,
    dispatcher: Dispatcher,
    exchange: Option<(u64, CancellationToken)>,
    launched: u64,
}

impl ChunkUploader {
    pub(crate) fn new(
        source: Arc<dyn ByteSource>,
        options: Arc<UploadOptions>,
        params: BTreeMap<String, String>,
        file_name: String,
        mut descriptor: ChunkDescriptor,
        dispatcher: Dispatcher,
    ) -> Self {
        let uid = Uuid::new_v4();
        descriptor.uid = Some(uid);
        descriptor.retries = 0;
        Self {
            work: WorkItem::new(uid, descriptor.size),
            descriptor,
            source,
            options,
            params,
            file_name,
            dispatcher,
            exchange: None,
            launched: 0,
        }
    }

    pub fn descriptor(&self) -> &ChunkDescriptor {
        &self.descriptor
    }

    /// Whether an exchange is in flight.
    pub fn in_flight(&self) -> bool {
        self.exchange.is_some()
    }

    /// Reports an unreachable server, then returns to `Idle` with a fresh
    /// retry budget.
    pub fn server_disconnected(&mut self) {
        debug!(seq = self.descriptor.seq, "chunk reports server disconnected");
        self.work.server_disconnected();
        self.retry_reset();
        Queueable::stop(self, &mut ());
    }

    fn launch(&mut self) {
        self.cancel_exchange();
        self.launched += 1;
        self.descriptor.request_sent = false;
        self.descriptor.response_received = false;

        let id = self.launched;
        let job = self.job();
        let cancel = self.dispatcher.spawn_exchange(self.work.uid(), id, job);
        self.exchange = Some((id, cancel));
        debug!(
            seq = self.descriptor.seq,
            exchange = id,
            size = self.descriptor.size,
            "chunk exchange launched"
        );
    }

    fn cancel_exchange(&mut self) {
        if let Some((id, cancel)) = self.exchange.take() {
            trace!(seq = self.descriptor.seq, exchange = id, "cancelling chunk exchange");
            cancel.cancel();
        }
    }

    fn job(&self) -> ExchangeJob {
        let opts = &self.options;

        let target = match &opts.url_resolver {
            Some(resolver) => Target::Resolve(resolver.clone()),
            None => {
                let base = opts.chunk_upload_url.as_deref().unwrap_or(&opts.url);
                if opts.multipart {
                    Target::Fixed(base.to_string())
                } else {
                    Target::Fixed(build_url(base, &self.params))
                }
            }
        };

        let mut headers = opts.headers.clone();
        let encoding = if opts.multipart {
            let fields = if opts.multipart_append_params {
                self.params.clone()
            } else {
                BTreeMap::new()
            };
            Encoding::Multipart {
                fields,
                file_field: opts.file_data_name.clone(),
                file_name: self.file_name.clone(),
                mime_type: self.source.mime_type().to_string(),
            }
        } else {
            if !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
                headers.insert("content-type".into(), "application/octet-stream".into());
            }
            Encoding::Binary
        };

        ExchangeJob {
            source: Arc::clone(&self.source),
            chunk: self.descriptor.clone(),
            target,
            method: opts.http_method.clone(),
            headers,
            encoding,
            timeout: opts.chunk_timeout_ms().map(Duration::from_millis),
        }
    }

    /// Applies a report from exchange `id`.
    pub(crate) fn on_exchange(&mut self, id: u64, event: ExchangeEvent) {
        if self.exchange.as_ref().map(|(current, _)| *current) != Some(id) {
            trace!(seq = self.descriptor.seq, exchange = id, "dropping late exchange report");
            return;
        }

        match event {
            ExchangeEvent::Sent => self.descriptor.request_sent = true,
            ExchangeEvent::Progress(sent) => self.work.progress(sent, None),
            ExchangeEvent::Finished(result) => {
                self.exchange = None;
                self.descriptor.response_received = result.is_ok();
                match result {
                    Ok(resp) => self.on_response(resp),
                    Err(failure) => self.on_failure(failure),
                }
            }
        }
    }

    fn on_response(&mut self, resp: TransportResponse) {
        let seq = self.descriptor.seq;
        let status = resp.status;
        let outcome = Outcome {
            status,
            body: resp.body,
            headers: resp.headers,
        };

        if status != 200 {
            warn!(seq, status, "chunk rejected by server");
            self.work.failed(outcome);
            return;
        }

        if let Some(header) = &self.options.chunk_header_validate {
            let echoed = outcome
                .headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(header))
                .and_then(|(_, value)| value.trim().parse::<u32>().ok());
            if echoed != Some(seq) {
                warn!(seq, ?echoed, header = %header, "chunk response does not match");
                self.work.failed(Outcome {
                    status: ChunkFailure::InvalidChunk.status(),
                    body: ChunkFailure::InvalidChunk.to_string(),
                    headers: outcome.headers,
                });
                return;
            }
        }

        debug!(seq, "chunk uploaded");
        self.work.done(outcome);
    }

    fn on_failure(&mut self, failure: ChunkFailure) {
        warn!(seq = self.descriptor.seq, status = failure.status(), error = %failure, "chunk exchange failed");
        let outcome = Outcome {
            status: failure.status(),
            body: failure.to_string(),
            ..Outcome::default()
        };
        self.work.abort(outcome);
    }
}

impl Queueable for ChunkUploader {
    type Context = ();

    fn work(&self) -> &WorkItem {
        &self.work
    }

    fn work_mut(&mut self) -> &mut WorkItem {
        &mut self.work
    }

    fn start(&mut self, _ctx: &mut ()) {
        self.work.start();
        self.launch();
    }

    fn pause(&mut self, _ctx: &mut ()) {
        self.cancel_exchange();
        self.work.pause();
    }

    fn resume(&mut self, _ctx: &mut ()) {
        self.work.resume();
        self.launch();
    }

    fn stop(&mut self, _ctx: &mut ()) {
        self.cancel_exchange();
        self.work.stop();
    }

    fn abort(&mut self, outcome: Outcome, _ctx: &mut ()) {
        self.cancel_exchange();
        self.work.abort(outcome);
    }

    fn retry(&mut self) {
        self.work.retry();
        self.descriptor.retries = self.work.retries();
    }

    fn retry_reset(&mut self) {
        self.work.retry_reset();
        self.descriptor.retries = 0;
    }

    fn destroy(&mut self, _ctx: &mut ()) {
        self.cancel_exchange();
        self.work.destroy();
    }
}

impl Drop for ChunkUploader {
    fn drop(&mut self) {
        self.cancel_exchange();
    }
}
