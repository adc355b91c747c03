use serde::Serialize;
use uuid::Uuid;

use chunkload_queue::{ItemState, Stats};

/// One slice of a file, as dispatched to a chunk uploader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkDescriptor {
    /// Sequence number, starting at 0.
    pub seq: u32,
    /// First byte of the slice.
    pub start: u64,
    /// One past the last byte of the slice.
    pub end: u64,
    /// `end - start`.
    pub size: u64,
    /// Total number of chunks in the file.
    pub chunks: u32,
    pub file_size: u64,
    /// Relative path of the file, or its name when it has none.
    pub file_name: String,
    /// Retries used by the uploader handling this chunk.
    pub retries: u32,
    /// Uploader handling this chunk, once dispatched.
    pub uid: Option<Uuid>,
    pub request_sent: bool,
    pub response_received: bool,
}

impl ChunkDescriptor {
    /// Describes chunk `seq` of a file of `file_size` bytes.
    ///
    /// A `chunk_size` of 0 means the whole file is one chunk.
    pub fn new(seq: u32, chunk_size: u64, chunks: u32, file_size: u64, file_name: String) -> Self {
        let (start, end) = if chunk_size == 0 {
            (0, file_size)
        } else {
            let start = u64::from(seq).saturating_mul(chunk_size);
            (start, start.saturating_add(chunk_size).min(file_size))
        };
        Self {
            seq,
            start,
            end,
            size: end.saturating_sub(start),
            chunks,
            file_size,
            file_name,
            retries: 0,
            uid: None,
            request_sent: false,
            response_received: false,
        }
    }
}

/// Latest known state of one chunk sequence inside a file upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub state: ItemState,
    pub descriptor: ChunkDescriptor,
}

/// Point-in-time view of a queued file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSnapshot {
    pub uid: Uuid,
    pub name: String,
    pub relative_path: Option<String>,
    pub size: u64,
    pub state: ItemState,
    pub processed: u64,
    pub percent: u8,
    pub retries: u32,
}

/// Aggregated progress of an [`Uploader`](crate::Uploader).
pub type UploadStats = Stats;

/// Number of chunks a file of `file_size` bytes is split into.
pub fn chunk_count(file_size: u64, chunk_size: u64) -> u32 {
    if chunk_size == 0 {
        return 1;
    }
    let count = file_size.div_ceil(chunk_size).max(1);
    u32::try_from(count).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_evenly() {
        assert_eq!(chunk_count(3_000_000, 1_000_000), 3);
        let last = ChunkDescriptor::new(2, 1_000_000, 3, 3_000_000, "a.bin".into());
        assert_eq!((last.start, last.end, last.size), (2_000_000, 3_000_000, 1_000_000));
    }

    #[test]
    fn last_chunk_is_short() {
        assert_eq!(chunk_count(2_500, 1_000), 3);
        let last = ChunkDescriptor::new(2, 1_000, 3, 2_500, "a.bin".into());
        assert_eq!(last.size, 500);
    }

    #[test]
    fn zero_chunk_size_is_whole_file() {
        assert_eq!(chunk_count(12_345, 0), 1);
        let only = ChunkDescriptor::new(0, 0, 1, 12_345, "a.bin".into());
        assert_eq!((only.start, only.end), (0, 12_345));
    }

    #[test]
    fn empty_file_is_one_empty_chunk() {
        assert_eq!(chunk_count(0, 1_000), 1);
        let only = ChunkDescriptor::new(0, 1_000, 1, 0, "a.bin".into());
        assert_eq!(only.size, 0);
    }

    #[test]
    fn out_of_range_sequence_is_empty() {
        let past = ChunkDescriptor::new(5, 1_000, 3, 2_500, "a.bin".into());
        assert_eq!(past.size, 0);
        assert!(past.start >= past.file_size);
    }
}
