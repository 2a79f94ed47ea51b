pub mod memory;
pub mod wal;

pub use memory::Memory;

use crate::error::Result;
use std::ops::RangeBounds;

/// An ordered key-value store. The typed layers above only rely on this
/// contract: point reads, ordered range scans, and atomic batch commits.
pub trait Store: Send + Sync {
    /// The iterator returned by scan().
    type ScanIterator<'a>: ScanIterator + 'a
    where
        Self: Sized + 'a; // omit in trait objects, for dyn compatibility

    /// Retrieves the value for a given key.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Iterates over an ordered range of key-value pairs.
    fn scan<'a>(
        &'a self,
        range: impl RangeBounds<Vec<u8>> + Clone + Send + Sync + 'a,
    ) -> Self::ScanIterator<'a>
    where
        Self: Sized; // omit in trait objects, for dyn compatibility

    /// Iterates over all key-value pairs starting with the given prefix.
    fn scan_prefix<'a>(&'a self, prefix: &'a [u8]) -> Self::ScanIterator<'a>
    where
        Self: Sized, // omit in trait objects, for dyn compatibility
    {
        let start = std::ops::Bound::Included(prefix.to_vec());
        let end = match prefix.iter().rposition(|b| *b != 0xff) {
            Some(i) => std::ops::Bound::Excluded(
                prefix[..i]
                    .iter()
                    .chain(std::iter::once(&(prefix[i] + 1)))
                    .copied()
                    .collect::<Vec<u8>>(),
            ),
            None => std::ops::Bound::Unbounded,
        };
        self.scan((start, end))
    }

    /// Applies a batch of mutations atomically, in order.
    fn write(&self, batch: Batch) -> Result<()>;

    /// Inserts or updates a key-value pair.
    fn set(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let mut batch = Batch::new();
        batch.put(key.to_vec(), value);
        self.write(batch)
    }

    /// Removes a key-value pair. Deleting a missing key is a no-op.
    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut batch = Batch::new();
        batch.delete(key.to_vec());
        self.write(batch)
    }

    /// Synchronizes buffered writes to disk. Writes are not guaranteed
    /// to be durable until this is called.
    fn sync(&self) -> Result<()>;
}

pub trait ScanIterator: Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> {}

impl<I> ScanIterator for I where I: Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> {}

/// A single staged mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// An ordered set of mutations staged by a writer and committed in one
/// `Store::write` call. Later mutations win over earlier ones for the
/// same key.
#[derive(Debug, Default)]
pub struct Batch {
    ops: Vec<Mutation>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages an insert or update.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(Mutation::Put(key, value));
    }

    /// Stages a deletion.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(Mutation::Delete(key));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consumes the batch, yielding mutations in staging order.
    pub fn into_ops(self) -> Vec<Mutation> {
        self.ops
    }
}
