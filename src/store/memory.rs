use super::wal::Wal;
use super::{Batch, Mutation, Store};
use crate::error::Result;

use crossbeam_skiplist::{map::Entry, SkipMap};
use std::{
    ops::{Bound, RangeBounds},
    path::PathBuf,
    sync::Mutex,
};

const WAL_FILE: &str = "store.wal";

/// An ordered key-value store backed by a lock-free skip list, with a
/// write-ahead log for durability. The full data set lives in memory;
/// opening a directory replays the log to rebuild it.
#[derive(Debug)]
pub struct Memory {
    data: SkipMap<Vec<u8>, Vec<u8>>,
    wal: Wal,
    // Serializes batch commits so mutations from different writers
    // never interleave in the log or the map.
    commit: Mutex<()>,
}

impl Memory {
    /// Opens the store in the given directory, replaying any existing
    /// write-ahead log.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let wal = Wal::new(dir.join(WAL_FILE))?;
        let data = SkipMap::new();

        let mut entries = 0u64;
        for entry in wal.replay()? {
            let (key, value) = entry?;
            match value {
                Some(value) => {
                    data.insert(key, value);
                }
                None => {
                    data.remove(&key);
                }
            }
            entries += 1;
        }

        if entries > 0 {
            tracing::info!(entries, dir = %dir.display(), "Recovered store from write-ahead log");
        }

        Ok(Self {
            data,
            wal,
            commit: Mutex::new(()),
        })
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Store for Memory {
    type ScanIterator<'a> = ScanIter<'a>;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).map(|entry| entry.value().clone()))
    }

    fn scan<'a>(
        &'a self,
        range: impl RangeBounds<Vec<u8>> + Clone + Send + Sync + 'a,
    ) -> Self::ScanIterator<'a> {
        let start = match range.start_bound() {
            Bound::Included(key) => Bound::Included(key.clone()),
            Bound::Excluded(key) => Bound::Excluded(key.clone()),
            Bound::Unbounded => Bound::Unbounded,
        };

        let end = match range.end_bound() {
            Bound::Included(key) => Bound::Included(key.clone()),
            Bound::Excluded(key) => Bound::Excluded(key.clone()),
            Bound::Unbounded => Bound::Unbounded,
        };

        ScanIter {
            inner: self.data.range((start, end)),
        }
    }

    fn write(&self, batch: Batch) -> Result<()> {
        let _commit = self.commit.lock()?;

        let ops = batch.into_ops();
        for op in &ops {
            match op {
                Mutation::Put(key, value) => self.wal.append(key, Some(value))?,
                Mutation::Delete(key) => self.wal.append(key, None)?,
            }
        }
        self.wal.flush()?;

        for op in ops {
            match op {
                Mutation::Put(key, value) => {
                    self.data.insert(key, value);
                }
                Mutation::Delete(key) => {
                    self.data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.wal.sync()
    }
}

type SkipMapRange<'a> = crossbeam_skiplist::map::Range<
    'a,
    Vec<u8>,
    (Bound<Vec<u8>>, Bound<Vec<u8>>),
    Vec<u8>,
    Vec<u8>,
>;

pub struct ScanIter<'a> {
    inner: SkipMapRange<'a>,
}

impl<'a> ScanIter<'a> {
    /// Maps a SkipMap Entry to the expected output format.
    fn map(entry: Entry<'_, Vec<u8>, Vec<u8>>) -> <Self as Iterator>::Item {
        Ok((entry.key().clone(), entry.value().clone()))
    }
}

impl<'a> Iterator for ScanIter<'a> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(Self::map)
    }
}
