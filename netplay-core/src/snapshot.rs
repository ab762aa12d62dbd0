//! Compressed storage for a room's shared simulation snapshot.
//!
//! Snapshots are full emulator states published after every resync. They
//! are large and highly repetitive, so the room keeps them LZ4-compressed
//! and decompresses only when a late joiner needs them.

use thiserror::Error;

/// A stored shared-state snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedSnapshot {
    /// State version this snapshot was stored under
    pub version: u64,
    /// Original uncompressed size in bytes
    pub original_size: usize,
    /// LZ4-compressed payload (size-prepended block)
    pub compressed: Vec<u8>,
}

impl CompressedSnapshot {
    /// Compress `data`, refusing anything above `max_bytes`.
    pub fn compress(version: u64, data: &[u8], max_bytes: usize) -> Result<Self, SnapshotError> {
        if data.len() > max_bytes {
            return Err(SnapshotError::TooLarge {
                size: data.len(),
                limit: max_bytes,
            });
        }
        Ok(Self {
            version,
            original_size: data.len(),
            compressed: lz4_flex::compress_prepend_size(data),
        })
    }

    pub fn decompress(&self) -> Result<Vec<u8>, SnapshotError> {
        lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| SnapshotError::DecompressionFailed(e.to_string()))
    }

    /// Compression ratio (original / compressed).
    pub fn compression_ratio(&self) -> f64 {
        if self.compressed.is_empty() {
            return 0.0;
        }
        self.original_size as f64 / self.compressed.len() as f64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("snapshot of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),
}
