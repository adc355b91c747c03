//! Byte-bearing content that can be uploaded in slices.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Boxed future returned by [`ByteSource::slice`].
pub type SliceFuture<'a> = Pin<Box<dyn Future<Output = io::Result<Vec<u8>>> + Send + 'a>>;

/// Content of one file to upload.
///
/// An empty slice for a non-empty range means the content disappeared.
pub trait ByteSource: Send + Sync {
    fn name(&self) -> &str;

    /// Path relative to whatever the user selected, if known.
    fn relative_path(&self) -> Option<&str> {
        None
    }

    fn mime_type(&self) -> &str {
        "application/octet-stream"
    }

    /// Size in bytes.
    fn size(&self) -> u64;

    /// Reads bytes `start..end`.
    fn slice(&self, start: u64, end: u64) -> SliceFuture<'_>;
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

/// In-memory content.
pub struct MemorySource {
    name: String,
    relative_path: Option<String>,
    mime_type: String,
    size: u64,
    data: RwLock<Arc<Vec<u8>>>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            relative_path: None,
            mime_type: "application/octet-stream".into(),
            size: data.len() as u64,
            data: RwLock::new(Arc::new(data)),
        }
    }

    pub fn with_relative_path(mut self, path: impl Into<String>) -> Self {
        self.relative_path = Some(path.into());
        self
    }

    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = mime.into();
        self
    }

    /// Drops the content while keeping the advertised size, so later
    /// slices come back empty.
    pub fn clear(&self) {
        if let Ok(mut data) = self.data.write() {
            *data = Arc::new(Vec::new());
        }
    }
}

impl ByteSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn relative_path(&self) -> Option<&str> {
        self.relative_path.as_deref()
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn slice(&self, start: u64, end: u64) -> SliceFuture<'_> {
        let data = self
            .data
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|_| io::Error::other("memory source lock poisoned"));
        Box::pin(async move {
            let data = data?;
            let len = data.len();
            let start = usize::try_from(start).unwrap_or(usize::MAX).min(len);
            let end = usize::try_from(end).unwrap_or(usize::MAX).min(len);
            Ok(data.get(start..end).map(<[u8]>::to_vec).unwrap_or_default())
        })
    }
}

// ---------------------------------------------------------------------------
// FileSource
// ---------------------------------------------------------------------------

/// A file on disk, read slice by slice with seek + read.
pub struct FileSource {
    path: PathBuf,
    name: String,
    relative_path: Option<String>,
    mime_type: String,
    size: u64,
}

impl FileSource {
    /// Opens `path`, recording its current size.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let meta = tokio::fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a regular file: {}", path.display()),
            ));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            mime_type: guess_mime(&path).to_string(),
            name,
            relative_path: None,
            size: meta.len(),
            path,
        })
    }

    pub fn with_relative_path(mut self, path: impl Into<String>) -> Self {
        self.relative_path = Some(path.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn relative_path(&self) -> Option<&str> {
        self.relative_path.as_deref()
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn slice(&self, start: u64, end: u64) -> SliceFuture<'_> {
        Box::pin(async move {
            let mut file = tokio::fs::File::open(&self.path).await?;
            file.seek(io::SeekFrom::Start(start)).await?;

            let len = end.saturating_sub(start);
            let mut buf = Vec::with_capacity(usize::try_from(len).unwrap_or(0));
            file.take(len).read_to_end(&mut buf).await?;
            Ok(buf)
        })
    }
}

fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "txt" => "text/plain",
        "json" => "application/json",
        "zip" => "application/zip",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_slices_and_clears() {
        let src = MemorySource::new("a.bin", (0u8..10).collect());
        assert_eq!(src.size(), 10);
        assert_eq!(src.slice(2, 5).await.unwrap(), vec![2, 3, 4]);
        assert_eq!(src.slice(8, 50).await.unwrap(), vec![8, 9]);

        src.clear();
        assert_eq!(src.size(), 10);
        assert!(src.slice(0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_slices_by_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.JPG");
        std::fs::write(&path, b"hello chunked world").unwrap();

        let src = FileSource::open(&path).await.unwrap();
        assert_eq!(src.name(), "photo.JPG");
        assert_eq!(src.mime_type(), "image/jpeg");
        assert_eq!(src.size(), 19);
        assert_eq!(src.slice(6, 13).await.unwrap(), b"chunked");
        assert_eq!(src.slice(14, 100).await.unwrap(), b"world");
    }

    #[tokio::test]
    async fn truncated_file_yields_empty_slice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, vec![1u8; 100]).unwrap();
        let src = FileSource::open(&path).await.unwrap();

        std::fs::write(&path, b"").unwrap();
        assert!(src.slice(50, 100).await.unwrap().is_empty());

        std::fs::remove_file(&path).unwrap();
        assert!(src.slice(0, 10).await.is_err());
    }

    #[tokio::test]
    async fn directories_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileSource::open(dir.path()).await.is_err());
    }
}
