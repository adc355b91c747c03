//! Spawns background work and routes its results back to the engine task.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::UploadError;
use crate::exchange::{self, ExchangeEvent, ExchangeJob};
use crate::file::Preprocess;
use crate::source::ByteSource;
use crate::transport::Transport;

/// Messages delivered to the engine's inbox.
pub(crate) enum EngineMsg {
    Exchange {
        chunk: Uuid,
        exchange: u64,
        event: ExchangeEvent,
    },
    /// Deferred dispatch of a file's next chunk.
    NextChunk { file: Uuid, uploader: Uuid },
    Preprocessed {
        file: Uuid,
        job: u64,
        result: Result<Arc<dyn ByteSource>, UploadError>,
    },
}

/// Handle for starting background work on behalf of queued items.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    transport: Arc<dyn Transport>,
    tx: mpsc::UnboundedSender<EngineMsg>,
}

impl Dispatcher {
    pub(crate) fn new(transport: Arc<dyn Transport>, tx: mpsc::UnboundedSender<EngineMsg>) -> Self {
        Self { transport, tx }
    }

    /// Starts a chunk exchange. Cancel the returned token to abort it.
    pub(crate) fn spawn_exchange(
        &self,
        chunk: Uuid,
        exchange: u64,
        job: ExchangeJob,
    ) -> CancellationToken {
        let cancel = CancellationToken::new();
        let tx = self.tx.clone();
        tokio::spawn(exchange::run(
            job,
            Arc::clone(&self.transport),
            cancel.clone(),
            move |event| {
                let _ = tx.send(EngineMsg::Exchange {
                    chunk,
                    exchange,
                    event,
                });
            },
        ));
        cancel
    }

    /// Asks the engine to continue `file` on its next turn.
    pub(crate) fn defer_next_chunk(&self, file: Uuid, uploader: Uuid) {
        let _ = self.tx.send(EngineMsg::NextChunk { file, uploader });
    }

    /// Runs a preprocessor off the engine task.
    pub(crate) fn spawn_preprocess(
        &self,
        file: Uuid,
        job: u64,
        preprocessor: Arc<dyn Preprocess>,
        source: Arc<dyn ByteSource>,
    ) -> CancellationToken {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                result = preprocessor.process(source) => {
                    let _ = tx.send(EngineMsg::Preprocessed { file, job, result });
                }
            }
        });
        cancel
    }
}
