//! Exploit payload supply and image chunking.
//!
//! The boot-ROM exploit bytes are opaque to this crate; they come from an
//! [`ExploitPayloadProvider`] keyed by model identifier.

use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("No exploit payload for model {0}")]
    Missing(String),

    #[error("Exploit payload for model {0} is empty")]
    Empty(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of the opaque exploit payload for a model.
pub trait ExploitPayloadProvider: Send + Sync {
    fn payload_for(&self, model: &str) -> Result<Vec<u8>, PayloadError>;
}

/// Reads `<dir>/<model>.bin`.
#[derive(Debug, Clone)]
pub struct DirectoryPayloadProvider {
    dir: PathBuf,
}

impl DirectoryPayloadProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ExploitPayloadProvider for DirectoryPayloadProvider {
    fn payload_for(&self, model: &str) -> Result<Vec<u8>, PayloadError> {
        // Model ids come from the device; keep them from escaping the directory.
        if model.is_empty() || !model.chars().all(|c| c.is_ascii_alphanumeric() || c == ',') {
            return Err(PayloadError::Missing(model.to_string()));
        }
        let path = self.dir.join(format!("{}.bin", model));
        debug!(path = %path.display(), "Loading exploit payload");
        let data = match std::fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PayloadError::Missing(model.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if data.is_empty() {
            return Err(PayloadError::Empty(model.to_string()));
        }
        Ok(data)
    }
}

/// In-memory payloads.
#[derive(Debug, Clone, Default)]
pub struct StaticPayloadProvider {
    payloads: HashMap<String, Vec<u8>>,
}

impl StaticPayloadProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, model: &str, payload: Vec<u8>) -> Self {
        self.payloads.insert(model.to_string(), payload);
        self
    }
}

impl ExploitPayloadProvider for StaticPayloadProvider {
    fn payload_for(&self, model: &str) -> Result<Vec<u8>, PayloadError> {
        match self.payloads.get(model) {
            Some(p) if p.is_empty() => Err(PayloadError::Empty(model.to_string())),
            Some(p) => Ok(p.clone()),
            None => Err(PayloadError::Missing(model.to_string())),
        }
    }
}

/// Chunk bookkeeping for one image transfer.
#[derive(Debug, Clone, Default)]
pub struct ChunkState {
    /// Index of the next chunk to send.
    pub current: usize,
    /// Total number of chunks.
    pub total: usize,
    /// Current byte offset.
    pub offset: usize,
    /// Size of each chunk.
    pub chunk_size: usize,
    /// Total data size.
    pub data_size: usize,
}

impl ChunkState {
    pub fn new(data_size: usize, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            current: 0,
            total: data_size.div_ceil(chunk_size),
            offset: 0,
            chunk_size,
            data_size,
        }
    }

    /// Next chunk of `data`, advancing the state.
    pub fn next_chunk<'a>(&mut self, data: &'a [u8]) -> Option<(usize, &'a [u8])> {
        let end_of_data = self.data_size.min(data.len());
        if self.offset >= end_of_data {
            return None;
        }
        let len = (end_of_data - self.offset).min(self.chunk_size);
        let index = self.current;
        let chunk = &data[self.offset..self.offset + len];
        self.offset += len;
        self.current += 1;
        Some((index, chunk))
    }

    pub fn is_done(&self) -> bool {
        self.current >= self.total
    }

    pub fn progress_pct(&self) -> u8 {
        if self.total == 0 {
            100
        } else {
            ((self.current * 100) / self.total) as u8
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_chunking() {
        let data: Vec<u8> = (0..10).collect();
        let mut state = ChunkState::new(data.len(), 4);
        assert_eq!(state.total, 3);
        assert_eq!(state.next_chunk(&data), Some((0, &data[0..4])));
        assert_eq!(state.next_chunk(&data), Some((1, &data[4..8])));
        assert_eq!(state.progress_pct(), 66);
        assert_eq!(state.next_chunk(&data), Some((2, &data[8..10])));
        assert!(state.is_done());
        assert_eq!(state.next_chunk(&data), None);
    }

    #[test]
    fn test_empty_data() {
        let mut state = ChunkState::new(0, 4);
        assert_eq!(state.total, 0);
        assert!(state.is_done());
        assert_eq!(state.progress_pct(), 100);
        assert_eq!(state.next_chunk(&[]), None);
    }

    #[test]
    fn test_directory_provider() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("J680AP.bin"), [0xDE, 0xAD]).unwrap();
        std::fs::write(dir.path().join("EMPTY.bin"), b"").unwrap();
        let provider = DirectoryPayloadProvider::new(dir.path());

        assert_eq!(provider.payload_for("J680AP").unwrap(), vec![0xDE, 0xAD]);
        assert!(matches!(
            provider.payload_for("J999AP"),
            Err(PayloadError::Missing(_))
        ));
        assert!(matches!(
            provider.payload_for("EMPTY"),
            Err(PayloadError::Empty(_))
        ));
        assert!(matches!(
            provider.payload_for("../etc"),
            Err(PayloadError::Missing(_))
        ));
    }

    #[test]
    fn test_static_provider() {
        let provider = StaticPayloadProvider::new().with("J680AP", vec![1, 2, 3]);
        assert_eq!(provider.payload_for("J680AP").unwrap(), vec![1, 2, 3]);
        assert!(provider.payload_for("J132AP").is_err());
    }
}
