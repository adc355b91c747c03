//! The network side of one chunk exchange.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::types::ChunkDescriptor;

/// Receives the cumulative number of body bytes sent.
pub type ProgressSink = mpsc::UnboundedSender<u64>;

/// Boxed future returned by [`Transport::send`].
pub type SendFuture<'a> =
    Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send + 'a>>;

/// Performs one request/response exchange per chunk.
///
/// Implementations resolve with the response, whatever its status; errors
/// are reserved for exchanges that never produced one. Dropping the future
/// aborts the exchange.
pub trait Transport: Send + Sync {
    fn send(&self, request: ChunkRequest, progress: ProgressSink) -> SendFuture<'_>;
}

/// Everything needed to send one chunk.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: RequestBody,
    pub chunk: ChunkDescriptor,
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    /// Raw bytes as the request body.
    Binary(Vec<u8>),
    /// `multipart/form-data` with text fields and one file field.
    Multipart {
        fields: BTreeMap<String, String>,
        file_field: String,
        file_name: String,
        mime_type: String,
        data: Vec<u8>,
    },
}

impl RequestBody {
    /// The chunk bytes carried by this body.
    pub fn data(&self) -> &[u8] {
        match self {
            Self::Binary(data) => data,
            Self::Multipart { data, .. } => data,
        }
    }
}

/// What the server answered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    /// Header names are lowercase.
    pub headers: BTreeMap<String, String>,
    pub body: String,
}
