//! Offset checkpoint store.
//!
//! Maps `(topic, partition)` to the next offset to read (last processed + 1). Entries
//! are created on the first checkpoint for a partition, overwritten on later ones and
//! never deleted, so a partition that moves away and comes back can still resume.
//!
//! The store is read by the rebalance listener on assignment and written by the poll
//! loop after commits and on exit. Both run on the poll task today, but the store is
//! shared behind an `Arc` and serializes reads against in-flight writes itself.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::types::{Partition, PartitionOffset};

/// Where a partition goes when a restored snapshot has no position for it.
pub const LOG_START_OFFSET: i64 = 0;

#[derive(Error, Debug)]
pub enum OffsetStoreError {
    #[error("offset store io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("offset store file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode offsets: {0}")]
    Encode(#[from] serde_json::Error),
}

pub trait OffsetStore: Send + Sync {
    fn put(&self, partition: &Partition, offset: i64) -> Result<(), OffsetStoreError>;

    fn get(&self, partition: &Partition) -> Result<Option<i64>, OffsetStoreError>;

    /// Every stored position.
    fn entries(&self) -> Result<Vec<PartitionOffset>, OffsetStoreError>;

    /// Persist several offsets at once. Implementations backed by slow media
    /// should override this to write once.
    fn put_all(&self, offsets: &HashMap<Partition, i64>) -> Result<(), OffsetStoreError> {
        for (partition, offset) in offsets {
            self.put(partition, *offset)?;
        }
        Ok(())
    }

    /// Move stored positions back to what a restored snapshot covers. Partitions
    /// the snapshot has no position for are replayed from the start of the log.
    fn rewind_to(&self, covered: &[PartitionOffset]) -> Result<(), OffsetStoreError> {
        let mut offsets: HashMap<Partition, i64> = self
            .entries()?
            .into_iter()
            .map(|entry| (entry.partition().clone(), LOG_START_OFFSET))
            .collect();
        for entry in covered {
            offsets.insert(entry.partition().clone(), entry.offset());
        }
        self.put_all(&offsets)
    }
}

/// Process-local store. Each key is locked independently.
#[derive(Debug, Default)]
pub struct InMemoryOffsetStore {
    offsets: DashMap<Partition, i64>,
}

impl InMemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

impl OffsetStore for InMemoryOffsetStore {
    fn put(&self, partition: &Partition, offset: i64) -> Result<(), OffsetStoreError> {
        self.offsets.insert(partition.clone(), offset);
        Ok(())
    }

    fn get(&self, partition: &Partition) -> Result<Option<i64>, OffsetStoreError> {
        Ok(self.offsets.get(partition).map(|entry| *entry.value()))
    }

    fn entries(&self) -> Result<Vec<PartitionOffset>, OffsetStoreError> {
        Ok(self
            .offsets
            .iter()
            .map(|entry| PartitionOffset::new(entry.key().clone(), *entry.value()))
            .collect())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredOffset {
    topic: String,
    partition: i32,
    offset: i64,
}

/// JSON file backed store.
///
/// The whole mapping is rewritten on every write through a temp file and rename, so
/// a crash mid-write leaves the previous checkpoint intact. A single lock covers
/// the in-memory copy and the file.
#[derive(Debug)]
pub struct FileOffsetStore {
    path: PathBuf,
    offsets: Mutex<BTreeMap<Partition, i64>>,
}

impl FileOffsetStore {
    /// Open the store at `path`, loading existing checkpoints if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, OffsetStoreError> {
        let path = path.into();
        let offsets = Self::load(&path)?;

        info!(
            path = %path.display(),
            partitions = offsets.len(),
            "Opened file offset store"
        );

        Ok(Self {
            path,
            offsets: Mutex::new(offsets),
        })
    }

    fn load(path: &Path) -> Result<BTreeMap<Partition, i64>, OffsetStoreError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => {
                return Err(OffsetStoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let stored: Vec<StoredOffset> =
            serde_json::from_slice(&bytes).map_err(|source| OffsetStoreError::Corrupt {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(stored
            .into_iter()
            .map(|s| (Partition::new(s.topic, s.partition), s.offset))
            .collect())
    }

    fn flush(&self, offsets: &BTreeMap<Partition, i64>) -> Result<(), OffsetStoreError> {
        let stored: Vec<StoredOffset> = offsets
            .iter()
            .map(|(p, offset)| StoredOffset {
                topic: p.topic().to_string(),
                partition: p.partition_number(),
                offset: *offset,
            })
            .collect();
        let bytes = serde_json::to_vec_pretty(&stored)?;

        let io_err = |source: io::Error| OffsetStoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;

        debug!(
            path = %self.path.display(),
            partitions = offsets.len(),
            "Flushed offset store"
        );
        Ok(())
    }
}

impl OffsetStore for FileOffsetStore {
    fn put(&self, partition: &Partition, offset: i64) -> Result<(), OffsetStoreError> {
        let mut offsets = self.offsets.lock();
        offsets.insert(partition.clone(), offset);
        self.flush(&offsets)
    }

    fn get(&self, partition: &Partition) -> Result<Option<i64>, OffsetStoreError> {
        Ok(self.offsets.lock().get(partition).copied())
    }

    fn entries(&self) -> Result<Vec<PartitionOffset>, OffsetStoreError> {
        Ok(self
            .offsets
            .lock()
            .iter()
            .map(|(partition, offset)| PartitionOffset::new(partition.clone(), *offset))
            .collect())
    }

    fn put_all(&self, offsets: &HashMap<Partition, i64>) -> Result<(), OffsetStoreError> {
        if offsets.is_empty() {
            return Ok(());
        }
        let mut current = self.offsets.lock();
        for (partition, offset) in offsets {
            current.insert(partition.clone(), *offset);
        }
        self.flush(&current)
    }
}
