//! Chunked file uploads over a pluggable transport.
//!
//! Files are split into chunks and scheduled on two queues: one for files,
//! one for the chunks of every file in flight. Connectivity failures pause
//! the chunk queue and resume it with exponential backoff.

mod chunk;
mod dispatch;
mod engine;
mod error;
mod exchange;
mod file;
mod http;
mod options;
mod source;
mod transport;
mod types;
mod uploader;
mod url;
mod validation;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use chunk::ChunkUploader;
pub use engine::{UploadEvent, Uploader};
pub use error::{TransportError, UploadError};
pub use exchange::{ChunkFailure, INACTIVITY_TIMEOUT, is_server_unavailable};
pub use file::{File, Preprocess, PreprocessFuture};
pub use http::HttpTransport;
pub use options::{ResolveFuture, UploadOptions, UrlResolver};
pub use source::{ByteSource, FileSource, MemorySource, SliceFuture};
pub use transport::{
    ChunkRequest, ProgressSink, RequestBody, SendFuture, Transport, TransportResponse,
};
pub use types::{ChunkDescriptor, ChunkRecord, FileSnapshot, UploadStats, chunk_count};
pub use uploader::{ChunkQueue, FileUploader};
pub use url::build_url;
pub use validation::validate_file_name;

pub use chunkload_queue::{ItemState, QueueState, Stats};
