//! Shared expiry engine.
//!
//! Deadlines are kept as two records per key so both lookups are cheap:
//!
//! ```text
//! time key [ index:1 | EXP_TIME_TYPE:1 | when:8 BE | data type:1 | key ]
//! meta key [ index:1 | EXP_META_TYPE:1 | data type:1 | key ]
//! ```
//!
//! The time key orders records by deadline, so the purge sweep is one
//! range scan up to "now". The meta key maps a live key to its deadline
//! (8 bytes little-endian) for `ttl` and for locating the time record
//! on removal. The data type tag scopes everything per value type.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::{Db, BIT_TYPE, EXP_META_TYPE, EXP_TIME_TYPE};
use crate::errdata;
use crate::error::Result;
use crate::store::{Batch, Store};

use std::ops::Bound;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in seconds.
pub(super) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

impl<S: Store> Db<S> {
    fn encode_exp_time_key(&self, data_type: u8, key: &[u8], when: i64) -> Vec<u8> {
        let mut tk = vec![0u8; 10];
        tk[0] = self.index;
        tk[1] = EXP_TIME_TYPE;
        BigEndian::write_u64(&mut tk[2..10], when as u64);
        tk.push(data_type);
        tk.extend_from_slice(key);
        tk
    }

    fn encode_exp_meta_key(&self, data_type: u8, key: &[u8]) -> Vec<u8> {
        let mut mk = Vec::with_capacity(key.len() + 3);
        mk.push(self.index);
        mk.push(EXP_META_TYPE);
        mk.push(data_type);
        mk.extend_from_slice(key);
        mk
    }

    fn decode_exp_time_key<'a>(&self, tk: &'a [u8]) -> Result<(u8, &'a [u8], i64)> {
        if tk.len() < 11 || tk[0] != self.index || tk[1] != EXP_TIME_TYPE {
            return errdata!("malformed expiry time key of {} bytes", tk.len());
        }

        let when = BigEndian::read_u64(&tk[2..10]) as i64;
        let data_type = tk[10];
        Ok((data_type, &tk[11..], when))
    }

    /// Stages an expiry deadline for the key, replacing any existing
    /// one.
    pub(super) fn expire_at_into(
        &self,
        batch: &mut Batch,
        data_type: u8,
        key: &[u8],
        when: i64,
    ) -> Result<()> {
        self.rm_expire_into(batch, data_type, key)?;

        batch.put(self.encode_exp_time_key(data_type, key, when), Vec::new());

        let mut buf = vec![0u8; 8];
        LittleEndian::write_u64(&mut buf, when as u64);
        batch.put(self.encode_exp_meta_key(data_type, key), buf);
        Ok(())
    }

    /// Remaining seconds before the key expires, -1 when it has no
    /// deadline or the deadline is already due.
    pub(super) fn ttl_of(&self, data_type: u8, key: &[u8]) -> Result<i64> {
        let mk = self.encode_exp_meta_key(data_type, key);
        let when = match self.store.get(&mk)? {
            Some(v) => {
                if v.len() < 8 {
                    return errdata!("expiry value too short: {} bytes", v.len());
                }
                LittleEndian::read_u64(&v[0..8]) as i64
            }
            None => return Ok(-1),
        };

        let remaining = when - unix_now();
        if remaining <= 0 {
            return Ok(-1);
        }
        Ok(remaining)
    }

    /// Stages removal of the key's expiry pair, returning the number
    /// removed (0 or 1).
    pub(super) fn rm_expire_into(
        &self,
        batch: &mut Batch,
        data_type: u8,
        key: &[u8],
    ) -> Result<u64> {
        let mk = self.encode_exp_meta_key(data_type, key);
        let when = match self.store.get(&mk)? {
            Some(v) => {
                if v.len() < 8 {
                    return errdata!("expiry value too short: {} bytes", v.len());
                }
                LittleEndian::read_u64(&v[0..8]) as i64
            }
            None => return Ok(0),
        };

        batch.delete(self.encode_exp_time_key(data_type, key, when));
        batch.delete(mk);
        Ok(1)
    }

    /// Stages removal of every expiry record of the given data type,
    /// returning the number of keys affected.
    pub(super) fn exp_flush_into(&self, batch: &mut Batch, data_type: u8) -> Result<u64> {
        let start = vec![self.index, EXP_TIME_TYPE];
        let end = vec![self.index, EXP_TIME_TYPE + 1];
        for entry in self.store.scan((Bound::Included(start), Bound::Excluded(end))) {
            let (tk, _) = entry?;
            let (dt, _, _) = self.decode_exp_time_key(&tk)?;
            if dt == data_type {
                batch.delete(tk);
            }
        }

        let mut flushed = 0u64;
        let start = vec![self.index, EXP_META_TYPE, data_type];
        let end = vec![self.index, EXP_META_TYPE, data_type + 1];
        for entry in self.store.scan((Bound::Included(start), Bound::Excluded(end))) {
            let (mk, _) = entry?;
            batch.delete(mk);
            flushed += 1;
        }
        Ok(flushed)
    }

    /// Deletes every key whose deadline is at or before `now`, in one
    /// commit. Returns the number of keys purged.
    pub fn purge_expired(&self, now: i64) -> Result<u64> {
        let _guard = self.bit_tx.lock()?;

        let start = vec![self.index, EXP_TIME_TYPE];
        let mut end = vec![0u8; 10];
        end[0] = self.index;
        end[1] = EXP_TIME_TYPE;
        BigEndian::write_u64(&mut end[2..10], (now + 1) as u64);

        let mut batch = Batch::new();
        let mut purged = 0u64;
        for entry in self.store.scan((Bound::Included(start), Bound::Excluded(end))) {
            let (tk, _) = entry?;
            let (data_type, key, _) = self.decode_exp_time_key(&tk)?;

            if data_type == BIT_TYPE {
                self.delete_bitmap(&mut batch, key)?;
            }
            batch.delete(self.encode_exp_meta_key(data_type, key));
            batch.delete(tk.clone());
            purged += 1;
        }

        if purged == 0 {
            return Ok(0);
        }
        self.store.write(batch)?;

        tracing::debug!(purged, index = self.index, "Purged expired keys");
        Ok(purged)
    }
}
