//! Upload configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::UploadError;
use crate::types::ChunkDescriptor;

/// Boxed future produced by a [`UrlResolver`].
pub type ResolveFuture = Pin<Box<dyn Future<Output = String> + Send>>;

/// Computes the upload URL of each chunk.
#[derive(Clone)]
pub struct UrlResolver(Arc<dyn Fn(ChunkDescriptor) -> ResolveFuture + Send + Sync>);

impl UrlResolver {
    /// Wraps an asynchronous resolver.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(ChunkDescriptor) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = String> + Send + 'static,
    {
        Self(Arc::new(move |chunk| Box::pin(f(chunk))))
    }

    /// Wraps a synchronous resolver.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&ChunkDescriptor) -> String + Send + Sync + 'static,
    {
        Self::new(move |chunk| std::future::ready(f(&chunk)))
    }

    pub(crate) fn resolve(&self, chunk: ChunkDescriptor) -> ResolveFuture {
        (self.0)(chunk)
    }
}

impl fmt::Debug for UrlResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UrlResolver(..)")
    }
}

/// Every recognized upload option.
///
/// Unknown keys are ignored when deserializing; missing keys take the
/// defaults listed on [`Default`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadOptions {
    /// Base upload URL.
    pub url: String,
    /// Chunk size in bytes; 0 uploads every file as a single chunk.
    pub chunk_size: u64,
    pub multipart: bool,
    /// Send `params` as multipart fields (otherwise they are dropped).
    pub multipart_append_params: bool,
    pub http_method: String,
    pub params: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    /// Multipart field carrying the file bytes.
    pub file_data_name: String,
    /// Send the file name as the `name` parameter.
    pub send_file_name: bool,
    /// Fail the whole file as soon as one chunk fails.
    pub stop_file_on_chunk_fail: bool,
    /// Concurrent chunk exchanges (and concurrent files).
    #[serde(alias = "max_upload_slots")]
    pub max_slots: usize,
    /// Retries per chunk.
    #[serde(alias = "max_chunk_retries")]
    pub max_retries: u32,
    /// Retries per file.
    pub max_file_retries: u32,
    pub auto_start: bool,
    pub finish_active: bool,
    pub pause_before_start: bool,
    /// Static per-chunk URL, used instead of `url` + params.
    pub chunk_upload_url: Option<String>,
    /// Per-chunk URL callback; takes priority over everything else.
    #[serde(skip)]
    pub url_resolver: Option<UrlResolver>,
    /// Expected upload speed in bytes per second, used to derive a
    /// per-chunk timeout.
    pub assumed_upload_speed: Option<u64>,
    /// Response header that must echo the chunk sequence number.
    pub chunk_header_validate: Option<String>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            url: String::new(),
            chunk_size: 0,
            multipart: true,
            multipart_append_params: true,
            http_method: "POST".into(),
            params: BTreeMap::new(),
            headers: BTreeMap::new(),
            file_data_name: "file".into(),
            send_file_name: true,
            stop_file_on_chunk_fail: true,
            max_slots: 1,
            max_retries: 0,
            max_file_retries: 0,
            auto_start: false,
            finish_active: false,
            pause_before_start: true,
            chunk_upload_url: None,
            url_resolver: None,
            assumed_upload_speed: None,
            chunk_header_validate: None,
        }
    }
}

impl UploadOptions {
    pub fn with_url_resolver(mut self, resolver: UrlResolver) -> Self {
        self.url_resolver = Some(resolver);
        self
    }

    /// Checks that the options can drive an upload.
    pub fn validate(&self) -> Result<(), UploadError> {
        let has_target = !self.url.is_empty()
            || self.chunk_upload_url.is_some()
            || self.url_resolver.is_some();
        if !has_target {
            return Err(UploadError::Config("no upload url configured".into()));
        }

        let method_ok = !self.http_method.is_empty()
            && self
                .http_method
                .bytes()
                .all(|b| b.is_ascii_alphabetic());
        if !method_ok {
            return Err(UploadError::Config(format!(
                "invalid http method: {:?}",
                self.http_method
            )));
        }

        if self.multipart && self.file_data_name.is_empty() {
            return Err(UploadError::Config(
                "file_data_name must not be empty in multipart mode".into(),
            ));
        }

        if self.assumed_upload_speed == Some(0) {
            return Err(UploadError::Config(
                "assumed_upload_speed must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Per-chunk timeout derived from `assumed_upload_speed`, in ms.
    pub fn chunk_timeout_ms(&self) -> Option<u64> {
        match self.assumed_upload_speed {
            Some(speed) if speed > 0 && self.chunk_size > 0 => {
                Some(self.chunk_size.saturating_mul(1000).div_ceil(speed))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = UploadOptions::default();
        assert!(opts.multipart);
        assert!(opts.multipart_append_params);
        assert_eq!(opts.http_method, "POST");
        assert_eq!(opts.file_data_name, "file");
        assert!(opts.send_file_name);
        assert!(opts.stop_file_on_chunk_fail);
        assert_eq!(opts.max_slots, 1);
        assert_eq!(opts.max_retries, 0);
        assert!(!opts.auto_start);
        assert!(opts.pause_before_start);
    }

    #[test]
    fn deserializes_aliases_and_fills_defaults() {
        let opts: UploadOptions = serde_json::from_str(
            r#"{"url": "http://x/upload", "max_upload_slots": 3, "max_chunk_retries": 2}"#,
        )
        .unwrap();
        assert_eq!(opts.url, "http://x/upload");
        assert_eq!(opts.max_slots, 3);
        assert_eq!(opts.max_retries, 2);
        assert_eq!(opts.chunk_size, 0);
        assert_eq!(opts.file_data_name, "file");
    }

    #[test]
    fn validate_requires_a_target() {
        assert!(UploadOptions::default().validate().is_err());

        let opts = UploadOptions {
            url: "http://x".into(),
            ..Default::default()
        };
        assert!(opts.validate().is_ok());

        let resolved = UploadOptions::default()
            .with_url_resolver(UrlResolver::sync(|c| format!("http://x/{}", c.seq)));
        assert!(resolved.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_method() {
        let opts = UploadOptions {
            url: "http://x".into(),
            http_method: "PO ST".into(),
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn timeout_from_assumed_speed() {
        let opts = UploadOptions {
            chunk_size: 1_000_000,
            assumed_upload_speed: Some(300_000),
            ..Default::default()
        };
        assert_eq!(opts.chunk_timeout_ms(), Some(3334));

        let whole_file = UploadOptions {
            assumed_upload_speed: Some(300_000),
            ..Default::default()
        };
        assert_eq!(whole_file.chunk_timeout_ms(), None);
    }

    #[tokio::test]
    async fn resolver_sees_the_chunk() {
        let resolver = UrlResolver::new(|chunk: ChunkDescriptor| async move {
            format!("http://x/{}/{}", chunk.file_name, chunk.seq)
        });
        let chunk = ChunkDescriptor::new(1, 10, 2, 20, "a.bin".into());
        assert_eq!(resolver.resolve(chunk).await, "http://x/a.bin/1");
    }
}
