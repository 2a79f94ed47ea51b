//! Typed key spaces layered on the ordered store.
//!
//! Every record a database writes is prefixed with the database index
//! and a type tag, so multiple databases and value types share one
//! store without colliding:
//!
//! ```text
//! [ index:1 | type tag:1 | type-specific key material... ]
//! ```
//!
//! Tags are registered here. Bitmap segments and bitmap watermarks use
//! adjacent tags so a single range delete covers a database's entire
//! bitmap key space.

pub mod bitmap;
pub mod ttl;

pub use bitmap::BitOp;

use crate::config::Config;
use crate::errinput;
use crate::error::{Error, Result};
use crate::store::{Memory, Store};

use std::sync::{Arc, Mutex};

/// Maximum number of databases sharing one store.
pub const MAX_DB_COUNT: u8 = 16;

/// Bitmap segment records.
pub(crate) const BIT_TYPE: u8 = 0x01;
/// Bitmap tail watermark records. Must stay the tag right after
/// BIT_TYPE, flush range-deletes `[BIT_TYPE ..= BIT_META_TYPE]`.
pub(crate) const BIT_META_TYPE: u8 = 0x02;
/// Expiry records ordered by deadline.
pub(crate) const EXP_TIME_TYPE: u8 = 0x65;
/// Expiry deadline lookup per key.
pub(crate) const EXP_META_TYPE: u8 = 0x66;

/// A single logical database: a slice of the shared store's key space
/// identified by the index byte.
///
/// Readers go straight to the store. All mutating bitmap operations
/// serialize on `bit_tx` for their whole read-modify-write-commit span,
/// so per-key updates are atomic and the watermark only moves forward.
pub struct Db<S: Store = Memory> {
    store: Arc<S>,
    index: u8,
    max_key_size: usize,
    bit_tx: Mutex<()>,
}

impl Db<Memory> {
    /// Opens a database with its own `Memory` store in `config.dir`.
    pub fn open(config: Config) -> Result<Self> {
        if config.index >= MAX_DB_COUNT {
            return errinput!("database index {} out of range", config.index);
        }
        let store = Arc::new(Memory::open(&config.dir)?);
        Ok(Self {
            store,
            index: config.index,
            max_key_size: config.max_key_size,
            bit_tx: Mutex::new(()),
        })
    }
}

impl<S: Store> Db<S> {
    /// Attaches a database to a shared store. Each index must have at
    /// most one handle, the write lock is per handle.
    pub fn with_store(store: Arc<S>, index: u8) -> Result<Self> {
        if index >= MAX_DB_COUNT {
            return errinput!("database index {index} out of range");
        }
        Ok(Self {
            store,
            index,
            max_key_size: crate::config::DEFAULT_MAX_KEY_SIZE,
            bit_tx: Mutex::new(()),
        })
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    /// Rejects empty and oversized user keys before any store access.
    pub(crate) fn check_key_size(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() || key.len() > self.max_key_size {
            return Err(Error::KeySize);
        }
        Ok(())
    }

    /// Flushes buffered store writes to disk.
    pub fn sync(&self) -> Result<()> {
        self.store.sync()
    }
}
