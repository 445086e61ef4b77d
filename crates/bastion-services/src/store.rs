//! On-disk file store.
//!
//! Uploaded files live flat under one root as `<owner>_<seq>.dat`. Sequence
//! numbers are monotonic per owner for the lifetime of the store: a startup
//! scan seeds each owner's counter from the highest sequence already on
//! disk, so numbers survive restarts without a separate metadata file. An
//! aborted upload may leave a partial file behind; allocation skips over
//! any sequence that already has a file, so partials are never appended to
//! by a later upload.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use bastion_core::ProtocolError;

const FILE_EXT: &str = "dat";

/// A stored file's identity: owner plus per-owner sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileId {
    pub owner: String,
    pub seq: u64,
}

impl FileId {
    /// Parse the `<owner>_<seq>` form used on the wire. Owners may contain
    /// underscores; the sequence is everything after the last one.
    pub fn parse(name: &str) -> Option<Self> {
        let (owner, seq) = name.rsplit_once('_')?;
        if owner.is_empty() {
            return None;
        }
        let seq = seq.parse().ok()?;
        Some(Self {
            owner: owner.to_string(),
            seq,
        })
    }

    /// The `<owner>_<seq>` wire name.
    pub fn name(&self) -> String {
        format!("{}_{}", self.owner, self.seq)
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.owner, self.seq)
    }
}

/// The store: one root directory plus per-owner sequence counters.
pub struct FileStore {
    root: PathBuf,
    /// Next sequence to hand out, per owner. Guarded by a plain mutex;
    /// allocation is rare and never held across await points.
    next_seq: Mutex<HashMap<String, u64>>,
}

impl FileStore {
    /// Open the store, creating the root if needed, and seed the sequence
    /// counters from the files already on disk.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ProtocolError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| ProtocolError::Storage {
            path: root.clone(),
            source,
        })?;

        let mut next_seq: HashMap<String, u64> = HashMap::new();
        let entries = std::fs::read_dir(&root).map_err(|source| ProtocolError::Storage {
            path: root.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| ProtocolError::Storage {
                path: root.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(id) = FileId::parse(stem) {
                let slot = next_seq.entry(id.owner).or_insert(0);
                *slot = (*slot).max(id.seq + 1);
            }
        }

        Ok(Self {
            root,
            next_seq: Mutex::new(next_seq),
        })
    }

    fn path_for(&self, id: &FileId) -> PathBuf {
        self.root.join(format!("{}.{FILE_EXT}", id.name()))
    }

    /// Number of sequences handed out so far for `owner`. Doubles as the
    /// exclusive upper bound on valid sequence numbers.
    pub fn count_for(&self, owner: &str) -> u64 {
        self.next_seq
            .lock()
            .map(|m| m.get(owner).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Reserve the next sequence for an upload by `owner`. Skips over any
    /// sequence that already has a file on disk (a partial from an aborted
    /// upload). The counter is not advanced until [`commit`](Self::commit).
    pub fn allocate(&self, owner: &str) -> FileId {
        let base = self.count_for(owner);
        let mut seq = base;
        loop {
            let candidate = FileId {
                owner: owner.to_string(),
                seq,
            };
            if !self.path_for(&candidate).exists() {
                return candidate;
            }
            seq += 1;
        }
    }

    /// Mark an upload as complete: the owner's counter moves past `id` so
    /// the sequence is never reused.
    pub fn commit(&self, id: &FileId) {
        if let Ok(mut map) = self.next_seq.lock() {
            let slot = map.entry(id.owner.clone()).or_insert(0);
            *slot = (*slot).max(id.seq + 1);
        }
    }

    pub fn exists(&self, id: &FileId) -> bool {
        self.path_for(id).exists()
    }

    /// Append a chunk to the file, creating it on the first chunk.
    pub async fn append(&self, id: &FileId, bytes: &[u8]) -> Result<(), ProtocolError> {
        let path = self.path_for(id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| ProtocolError::Storage {
                path: path.clone(),
                source,
            })?;
        file.write_all(bytes)
            .await
            .map_err(|source| ProtocolError::Storage { path, source })?;
        Ok(())
    }

    /// Open a stored file for chunked reading.
    pub async fn open_file(&self, id: &FileId) -> Result<File, ProtocolError> {
        let path = self.path_for(id);
        File::open(&path)
            .await
            .map_err(|source| Self::read_error(id, path, source))
    }

    /// Size in bytes of a stored file.
    pub async fn size(&self, id: &FileId) -> Result<u64, ProtocolError> {
        let path = self.path_for(id);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|source| Self::read_error(id, path, source))?;
        Ok(meta.len())
    }

    fn read_error(id: &FileId, path: PathBuf, source: std::io::Error) -> ProtocolError {
        if source.kind() == std::io::ErrorKind::NotFound {
            ProtocolError::NotFound(id.name())
        } else {
            ProtocolError::Storage { path, source }
        }
    }

    /// Remove a partial file left by an aborted upload. Best-effort.
    pub async fn discard(&self, id: &FileId) {
        let _ = tokio::fs::remove_file(self.path_for(id)).await;
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
