//! Segmented bitmap values.
//!
//! A bitmap is a logically unbounded bit array per user key, physically
//! materialized only where bits have been touched. The value is sharded
//! into fixed 512-byte segments stored as individual records, plus one
//! meta record carrying the tail watermark, the highest bit position
//! any write ever touched:
//!
//! ```text
//! meta key    [ index:1 | BIT_META_TYPE:1 | key ]
//! meta value  [ tail_seq:4 LE | tail_off:4 LE ]
//! segment key [ index:1 | BIT_TYPE:1 | klen:2 BE | key | seq:4 BE ]
//! segment     [ 512 raw bytes, bit 0 of each byte is the LSB ]
//! ```
//!
//! A missing segment reads as all zeroes. A missing meta record means
//! the bitmap does not exist, readers see the `(-1, -1)` sentinel. Bit
//! position `b` lives in segment `b >> 12` at in-segment offset
//! `b & 4095`.
//!
//! Mutations stage a batch and commit it while holding the database
//! write lock; readers scan the store directly and may observe either
//! side of a concurrent commit, never a torn segment.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::{Db, BIT_META_TYPE, BIT_TYPE};
use crate::errdata;
use crate::error::{Error, Result};
use crate::store::{Batch, Store};

use std::borrow::Cow;
use std::ops::Bound;

pub(crate) const SEG_BYTE_WIDTH: u32 = 9;
pub(crate) const SEG_BYTE_SIZE: usize = 1 << SEG_BYTE_WIDTH; // 512

pub(crate) const SEG_BIT_WIDTH: u32 = SEG_BYTE_WIDTH + 3;
pub(crate) const SEG_BIT_SIZE: u32 = (SEG_BYTE_SIZE as u32) << 3; // 4096

/// Maximum logical byte length of one bitmap value (8 MiB).
pub(crate) const MAX_BYTE_SIZE: u32 = 8 << 20;
pub(crate) const MAX_SEG_COUNT: u32 = MAX_BYTE_SIZE / SEG_BYTE_SIZE as u32;

// Sequence sentinels bounding full-key segment scans.
const MIN_SEQ: u32 = 0;
const MAX_SEQ: u32 = (MAX_BYTE_SIZE << 3) - 1;

/// Per-byte population counts.
const BITS_IN_BYTE: [u8; 256] = bits_in_byte_table();

const fn bits_in_byte_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = (i as u8).count_ones() as u8;
        i += 1;
    }
    table
}

/// Value of a byte whose low `i + 1` bits are set.
const FILL_BITS: [u8; 8] = [1, 3, 7, 15, 31, 63, 127, 255];

// Shared read-only segments. Operators never mutate these, a result
// that differs from its operands is always a fresh allocation.
static EMPTY_SEGMENT: [u8; SEG_BYTE_SIZE] = [0x00; SEG_BYTE_SIZE];
static FILL_SEGMENT: [u8; SEG_BYTE_SIZE] = [0xff; SEG_BYTE_SIZE];

/// Bitwise operator applied segment-wise across source bitmaps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitOp {
    And,
    Or,
    Xor,
    Not,
}

/// An operand or result segment in the operator's working map. Missing
/// entries stand for all-zero segments; borrowed entries alias the
/// shared singletons.
type Segment = Cow<'static, [u8]>;

type SegOp = fn(Option<Segment>, Option<Segment>) -> Option<Segment>;

/// Returns the bit at `offset`, 0 when out of range.
fn get_bit(buf: &[u8], offset: u32) -> u8 {
    let index = (offset >> 3) as usize;
    if index >= buf.len() {
        return 0;
    }
    (buf[index] >> (offset & 7)) & 1
}

/// Sets the bit at `offset` to `val`. Returns false without mutating
/// when `val` is not a bit or `offset` is out of range.
fn set_bit(buf: &mut [u8], offset: u32, val: u8) -> bool {
    if val != 0 && val != 1 {
        return false;
    }
    let index = (offset >> 3) as usize;
    if index >= buf.len() {
        return false;
    }

    let bit = offset & 7;
    if (buf[index] >> bit) & 1 != val {
        buf[index] ^= 1 << bit;
    }
    true
}

/// Byte length of the dense value bounded by a tail at `(seq, off)`.
fn cap_byte_size(seq: u32, off: u32) -> u32 {
    let off_byte_size = ((off >> 3) + 1).min(SEG_BYTE_SIZE as u32);
    (seq << SEG_BYTE_WIDTH) + off_byte_size
}

fn seg_and(a: Option<Segment>, b: Option<Segment>) -> Option<Segment> {
    // A missing operand zeroes the whole result segment, so AND keeps
    // the destination sparse.
    match (a, b) {
        (Some(a), Some(b)) => {
            let mut out = vec![0u8; SEG_BYTE_SIZE];
            for (i, byte) in out.iter_mut().enumerate() {
                *byte = a[i] & b[i];
            }
            Some(Cow::Owned(out))
        }
        _ => None,
    }
}

fn seg_or(a: Option<Segment>, b: Option<Segment>) -> Option<Segment> {
    match (a, b) {
        (Some(a), Some(b)) => {
            let mut out = vec![0u8; SEG_BYTE_SIZE];
            for (i, byte) in out.iter_mut().enumerate() {
                *byte = a[i] | b[i];
            }
            Some(Cow::Owned(out))
        }
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

fn seg_xor(a: Option<Segment>, b: Option<Segment>) -> Option<Segment> {
    match (a, b) {
        // Both missing flips to all ones. The NOT seed relies on this
        // to flip every bit below the tail.
        (None, None) => Some(Cow::Borrowed(&FILL_SEGMENT[..])),
        (a, b) => {
            let a = a.unwrap_or(Cow::Borrowed(&EMPTY_SEGMENT[..]));
            let b = b.unwrap_or(Cow::Borrowed(&EMPTY_SEGMENT[..]));
            let mut out = vec![0u8; SEG_BYTE_SIZE];
            for (i, byte) in out.iter_mut().enumerate() {
                *byte = a[i] ^ b[i];
            }
            Some(Cow::Owned(out))
        }
    }
}

impl<S: Store> Db<S> {
    fn encode_bit_meta_key(&self, key: &[u8]) -> Vec<u8> {
        let mut mk = Vec::with_capacity(key.len() + 2);
        mk.push(self.index);
        mk.push(BIT_META_TYPE);
        mk.extend_from_slice(key);
        mk
    }

    fn encode_bit_seg_key(&self, key: &[u8], seq: u32) -> Vec<u8> {
        let mut bk = vec![0u8; key.len() + 8];
        bk[0] = self.index;
        bk[1] = BIT_TYPE;
        BigEndian::write_u16(&mut bk[2..4], key.len() as u16);
        bk[4..4 + key.len()].copy_from_slice(key);
        BigEndian::write_u32(&mut bk[4 + key.len()..], seq);
        bk
    }

    /// Splits a segment key into the user key and sequence number. The
    /// key slice borrows from `bkey`, copy it to retain it past the
    /// iterator's next step.
    fn decode_bit_seg_key<'a>(&self, bkey: &'a [u8]) -> Result<(&'a [u8], u32)> {
        if bkey.len() < 8 || bkey[0] != self.index {
            return Err(Error::BitKey);
        }

        let key_len = BigEndian::read_u16(&bkey[2..4]) as usize;
        if key_len + 8 != bkey.len() {
            return Err(Error::BitKey);
        }

        let key = &bkey[4..4 + key_len];
        let seq = BigEndian::read_u32(&bkey[4 + key_len..]);
        Ok((key, seq))
    }

    /// Reads the tail watermark, `(-1, -1)` when the bitmap does not
    /// exist.
    fn bit_meta(&self, key: &[u8]) -> Result<(i32, i32)> {
        let mk = self.encode_bit_meta_key(key);
        match self.store.get(&mk)? {
            Some(v) => {
                if v.len() < 8 {
                    return errdata!("bitmap meta value too short: {} bytes", v.len());
                }
                Ok((
                    LittleEndian::read_u32(&v[0..4]) as i32,
                    LittleEndian::read_u32(&v[4..8]) as i32,
                ))
            }
            None => Ok((-1, -1)),
        }
    }

    fn put_bit_meta(&self, batch: &mut Batch, key: &[u8], tail_seq: u32, tail_off: u32) {
        let mut buf = vec![0u8; 8];
        LittleEndian::write_u32(&mut buf[0..4], tail_seq);
        LittleEndian::write_u32(&mut buf[4..8], tail_off);
        batch.put(self.encode_bit_meta_key(key), buf);
    }

    /// Advances the watermark to `(seq, off)` if it exceeds the current
    /// tail. The tail never moves backwards.
    fn update_bit_meta(
        &self,
        batch: &mut Batch,
        key: &[u8],
        seq: u32,
        off: u32,
    ) -> Result<(u32, u32)> {
        let (ts, to) = self.bit_meta(key)?;
        let (mut tail_seq, mut tail_off) = (ts.max(0) as u32, to.max(0) as u32);

        if seq > tail_seq || (seq == tail_seq && off > tail_off) {
            self.put_bit_meta(batch, key, seq, off);
            tail_seq = seq;
            tail_off = off;
        }
        Ok((tail_seq, tail_off))
    }

    /// Resolves a signed bit offset to `(seq, off)`. Negative offsets
    /// are measured back from the tail; one that lands before bit 0
    /// fails.
    fn parse_offset(&self, key: &[u8], offset: i32) -> Result<(u32, u32)> {
        let mut offset = offset;
        if offset < 0 {
            let (tail_seq, tail_off) = self.bit_meta(key)?;
            if tail_seq >= 0 {
                offset += (((tail_seq as u32) << SEG_BIT_WIDTH) | tail_off as u32) as i32;
            }
            if offset < 0 {
                return Err(Error::Offset);
            }
        }

        let off = offset as u32;
        Ok((off >> SEG_BIT_WIDTH, off & (SEG_BIT_SIZE - 1)))
    }

    /// Fetches a segment; `None` means not stored (all zeroes).
    fn segment(&self, key: &[u8], seq: u32) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        let bk = self.encode_bit_seg_key(key, seq);
        let segment = self.store.get(&bk)?;
        Ok((bk, segment))
    }

    /// Like `segment`, but hands out a fresh zeroed buffer when absent.
    /// The allocation only becomes persistent on commit.
    fn allocate_segment(&self, key: &[u8], seq: u32) -> Result<(Vec<u8>, Vec<u8>)> {
        let (bk, segment) = self.segment(key, seq)?;
        Ok((bk, segment.unwrap_or_else(|| vec![0u8; SEG_BYTE_SIZE])))
    }

    /// Key range covering every segment of `key`, inclusive both ends.
    fn seg_range(&self, key: &[u8]) -> std::ops::RangeInclusive<Vec<u8>> {
        self.encode_bit_seg_key(key, MIN_SEQ)..=self.encode_bit_seg_key(key, MAX_SEQ)
    }

    /// Stages deletion of the meta record and every segment of `key`,
    /// returning the number of segments dropped.
    pub(super) fn delete_bitmap(&self, batch: &mut Batch, key: &[u8]) -> Result<u64> {
        batch.delete(self.encode_bit_meta_key(key));

        let mut dropped = 0;
        for entry in self.store.scan(self.seg_range(key)) {
            let (k, _) = entry?;
            batch.delete(k);
            dropped += 1;
        }
        Ok(dropped)
    }

    /// Sets the bit at `offset` to `val`, returning the previous bit.
    /// The write advances the tail watermark even when it stores a zero
    /// or leaves the bit unchanged.
    pub fn set_bit(&self, key: &[u8], offset: i32, val: u8) -> Result<u8> {
        self.check_key_size(key)?;

        let (seq, off) = self.parse_offset(key, offset)?;
        let (bk, mut segment) = self.allocate_segment(key, seq)?;

        let original = get_bit(&segment, off);
        set_bit(&mut segment, off, val);

        let _guard = self.bit_tx.lock()?;
        let mut batch = Batch::new();
        batch.put(bk, segment);
        self.update_bit_meta(&mut batch, key, seq, off)?;
        self.store.write(batch)?;

        Ok(original)
    }

    /// Returns the bit at `offset`, 0 when the bitmap or segment is
    /// absent.
    pub fn get_bit(&self, key: &[u8], offset: i32) -> Result<u8> {
        let (seq, off) = self.parse_offset(key, offset)?;
        let (_, segment) = self.segment(key, seq)?;

        match segment {
            Some(segment) => Ok(get_bit(&segment, off)),
            None => Ok(0),
        }
    }

    /// Returns the dense byte array of the bitmap up to its tail, empty
    /// when the bitmap does not exist.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.check_key_size(key)?;

        let (tail_seq, tail_off) = self.bit_meta(key)?;
        if tail_seq < 0 {
            return Ok(Vec::new());
        }
        let (tail_seq, tail_off) = (tail_seq as u32, tail_off as u32);

        let cap = cap_byte_size(tail_seq, tail_off) as usize;
        let mut data = vec![0u8; cap];

        let min_key = self.encode_bit_seg_key(key, MIN_SEQ);
        let max_key = self.encode_bit_seg_key(key, tail_seq);
        for entry in self.store.scan(min_key..=max_key) {
            let (k, v) = entry?;
            let (_, seq) = self.decode_bit_seg_key(&k)?;

            let s = (seq << SEG_BYTE_WIDTH) as usize;
            let e = (s + SEG_BYTE_SIZE).min(cap);
            let n = e - s;
            if v.len() < n {
                return errdata!("bitmap segment too short: {} bytes", v.len());
            }
            data[s..e].copy_from_slice(&v[..n]);
        }

        Ok(data)
    }

    /// Deletes the bitmap and its expiry records, returning the number
    /// of segments dropped.
    pub fn delete(&self, key: &[u8]) -> Result<u64> {
        self.check_key_size(key)?;

        let _guard = self.bit_tx.lock()?;
        let mut batch = Batch::new();
        let dropped = self.delete_bitmap(&mut batch, key)?;
        self.rm_expire_into(&mut batch, BIT_TYPE, key)?;
        self.store.write(batch)?;

        Ok(dropped)
    }

    /// Population count over the segments spanned by `[start, end]`.
    /// Counting is whole-segment granular: every byte of every segment
    /// overlapping the resolved endpoints contributes.
    pub fn count(&self, key: &[u8], start: i32, end: i32) -> Result<i32> {
        let (sseq, _) = self.parse_offset(key, start)?;
        let (eseq, _) = self.parse_offset(key, end)?;
        if sseq > eseq {
            return Ok(0);
        }

        let skey = self.encode_bit_seg_key(key, sseq);
        let ekey = self.encode_bit_seg_key(key, eseq);

        let mut cnt: i32 = 0;
        for entry in self.store.scan(skey..=ekey) {
            let (_, segment) = entry?;
            for byte in segment {
                cnt += BITS_IN_BYTE[byte as usize] as i32;
            }
        }
        Ok(cnt)
    }

    /// Highest bit position any write ever touched, -1 when the bitmap
    /// does not exist. Writes of zero count, so this is an effective
    /// length, not the highest set bit.
    pub fn tail(&self, key: &[u8]) -> Result<i32> {
        let (tail_seq, tail_off) = self.bit_meta(key)?;
        if tail_seq < 0 {
            return Ok(-1);
        }
        Ok((((tail_seq as u32) << SEG_BIT_WIDTH) | tail_off as u32) as i32)
    }

    /// Applies `op` across the source bitmaps into `dst_key`, replacing
    /// any previous destination value and expiry.
    ///
    /// Returns the destination's resolved bit length on success, and -1
    /// without touching the store when the arity is wrong (NOT takes
    /// exactly one source, the rest at least two), a key argument is
    /// empty, or no source has any data.
    pub fn operation(&self, op: BitOp, dst_key: &[u8], src_keys: &[&[u8]]) -> Result<i32> {
        let exe: SegOp = match op {
            BitOp::And => seg_and,
            BitOp::Or => seg_or,
            BitOp::Xor | BitOp::Not => seg_xor,
        };

        if dst_key.is_empty() || src_keys.is_empty() {
            return Ok(-1);
        }
        if (op == BitOp::Not && src_keys.len() != 1) || (op != BitOp::Not && src_keys.len() < 2) {
            return Ok(-1);
        }

        let _guard = self.bit_tx.lock()?;

        // Seed the destination tail from the first source that exists.
        let key_num = src_keys.len();
        let mut src_idx = key_num;
        let (mut max_dst_seq, mut max_dst_off) = (0u32, 0u32);
        for (i, src) in src_keys.iter().enumerate() {
            let (now_seq, now_off) = self.bit_meta(src)?;
            if now_seq >= 0 {
                max_dst_seq = now_seq as u32;
                max_dst_off = now_off as u32;
                src_idx = i;
                break;
            }
        }
        if src_idx == key_num {
            // No source has any data
            return Ok(-1);
        }

        let mut segments: Vec<Option<Segment>> = vec![None; MAX_SEG_COUNT as usize];

        if op == BitOp::Not {
            // Seed with all ones bounded by the source's tail; the XOR
            // fold below then flips the source's bits out of it.
            for seg in segments.iter_mut().take(max_dst_seq as usize) {
                *seg = Some(Cow::Borrowed(&FILL_SEGMENT[..]));
            }

            let mut tail_seg = vec![0u8; SEG_BYTE_SIZE];
            let cnt = cap_byte_size(0, max_dst_off) as usize;
            for byte in tail_seg.iter_mut().take(cnt - 1) {
                *byte = 0xff;
            }
            tail_seg[cnt - 1] = FILL_BITS[(max_dst_off as usize) - ((cnt - 1) << 3)];
            segments[max_dst_seq as usize] = Some(Cow::Owned(tail_seg));
        } else {
            for entry in self.store.scan(self.seg_range(src_keys[src_idx])) {
                let (k, v) = entry?;
                let (_, seq) = self.decode_bit_seg_key(&k)?;
                if seq >= MAX_SEG_COUNT {
                    return errdata!("bitmap segment sequence {seq} out of range");
                }
                segments[seq as usize] = Some(Cow::Owned(v));
            }
            src_idx += 1;
        }

        // Fold the remaining sources in. Walking each source's segments
        // in key order while sweeping `idx` lets the operator see every
        // destination entry the source lacks (the trailing sweep to
        // MAX_SEG_COUNT is what zeroes an AND destination's tail).
        for src in &src_keys[src_idx..] {
            let (now_seq, now_off) = self.bit_meta(src)?;
            if now_seq < 0 {
                continue;
            }
            let (seq, off) = (now_seq as u32, now_off as u32);
            if seq > max_dst_seq || (seq == max_dst_seq && off > max_dst_off) {
                max_dst_seq = seq;
                max_dst_off = off;
            }

            let mut idx: u32 = 0;
            for entry in self.store.scan(self.seg_range(src)) {
                let (k, v) = entry?;
                let (_, seq) = self.decode_bit_seg_key(&k)?;
                if seq >= MAX_SEG_COUNT {
                    return errdata!("bitmap segment sequence {seq} out of range");
                }

                while idx < seq {
                    segments[idx as usize] = exe(segments[idx as usize].take(), None);
                    idx += 1;
                }
                segments[seq as usize] =
                    exe(segments[seq as usize].take(), Some(Cow::Owned(v)));
                idx = seq + 1;
            }
            while idx < MAX_SEG_COUNT {
                segments[idx as usize] = exe(segments[idx as usize].take(), None);
                idx += 1;
            }
        }

        // Replace the destination wholesale: old value, expiry, then
        // the new watermark and every materialized segment.
        let mut batch = Batch::new();
        self.delete_bitmap(&mut batch, dst_key)?;
        self.rm_expire_into(&mut batch, BIT_TYPE, dst_key)?;
        self.put_bit_meta(&mut batch, dst_key, max_dst_seq, max_dst_off);
        for (seq, seg) in segments.iter().enumerate() {
            if let Some(seg) = seg {
                batch.put(self.encode_bit_seg_key(dst_key, seq as u32), seg.to_vec());
            }
        }
        self.store.write(batch)?;

        Ok(((max_dst_seq << SEG_BIT_WIDTH) | max_dst_off) as i32)
    }

    /// Expires the bitmap `duration` seconds from now. Returns 1, or 0
    /// when the bitmap does not exist.
    pub fn expire(&self, key: &[u8], duration: i64) -> Result<i64> {
        if duration <= 0 {
            return Err(Error::ExpireValue);
        }
        self.check_key_size(key)?;

        self.bit_expire_at(key, super::ttl::unix_now() + duration)
    }

    /// Expires the bitmap at unix time `when`, which must be in the
    /// future. Returns 1, or 0 when the bitmap does not exist.
    pub fn expire_at(&self, key: &[u8], when: i64) -> Result<i64> {
        if when <= super::ttl::unix_now() {
            return Err(Error::ExpireValue);
        }
        self.check_key_size(key)?;

        self.bit_expire_at(key, when)
    }

    fn bit_expire_at(&self, key: &[u8], when: i64) -> Result<i64> {
        let _guard = self.bit_tx.lock()?;

        let (tail_seq, _) = self.bit_meta(key)?;
        if tail_seq < 0 {
            return Ok(0);
        }

        let mut batch = Batch::new();
        self.expire_at_into(&mut batch, BIT_TYPE, key, when)?;
        self.store.write(batch)?;
        Ok(1)
    }

    /// Remaining seconds before the bitmap expires, -1 when it has no
    /// deadline.
    pub fn ttl(&self, key: &[u8]) -> Result<i64> {
        self.check_key_size(key)?;
        self.ttl_of(BIT_TYPE, key)
    }

    /// Removes any expiry deadline, returning the number removed (0 or
    /// 1).
    pub fn persist(&self, key: &[u8]) -> Result<u64> {
        self.check_key_size(key)?;

        let _guard = self.bit_tx.lock()?;
        let mut batch = Batch::new();
        let removed = self.rm_expire_into(&mut batch, BIT_TYPE, key)?;
        self.store.write(batch)?;
        Ok(removed)
    }

    /// Drops every bitmap record of this database, segments, watermarks
    /// and expiries, returning the number of records dropped from the
    /// bitmap region.
    pub fn flush(&self) -> Result<u64> {
        let _guard = self.bit_tx.lock()?;

        let mut batch = Batch::new();
        let start = vec![self.index, BIT_TYPE];
        let end = vec![self.index, BIT_META_TYPE + 1];

        let mut dropped = 0u64;
        for entry in self.store.scan((Bound::Included(start), Bound::Excluded(end))) {
            let (k, _) = entry?;
            batch.delete(k);
            dropped += 1;
        }
        self.exp_flush_into(&mut batch, BIT_TYPE)?;
        self.store.write(batch)?;

        tracing::debug!(dropped, index = self.index, "Flushed bitmap key space");
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::ttl::unix_now;
    use crate::store::Memory;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open_db(dir: &TempDir) -> Db {
        Db::open(Config::new(dir.path())).expect("Failed to open database")
    }

    /// Number of segment + watermark records in the database's bitmap
    /// key range.
    fn bit_region_count(db: &Db) -> usize {
        db.store
            .scan((
                Bound::Included(vec![db.index, BIT_TYPE]),
                Bound::Excluded(vec![db.index, BIT_META_TYPE + 1]),
            ))
            .count()
    }

    #[test]
    fn test_bits_in_byte_table() {
        assert_eq!(BITS_IN_BYTE[0], 0);
        assert_eq!(BITS_IN_BYTE[1], 1);
        assert_eq!(BITS_IN_BYTE[0x80], 1);
        assert_eq!(BITS_IN_BYTE[0xaa], 4);
        assert_eq!(BITS_IN_BYTE[0xff], 8);
    }

    #[test]
    fn test_bit_primitives() {
        let mut buf = vec![0u8; 2];
        assert!(set_bit(&mut buf, 7, 1));
        assert_eq!(buf[0], 0x80);
        assert_eq!(get_bit(&buf, 7), 1);
        assert_eq!(get_bit(&buf, 6), 0);

        // Out of range reads are zero, writes are rejected
        assert_eq!(get_bit(&buf, 16), 0);
        assert!(!set_bit(&mut buf, 16, 1));
        assert!(!set_bit(&mut buf, 0, 2));
        assert_eq!(buf, vec![0x80, 0x00]);
    }

    #[test]
    fn test_seg_key_roundtrip() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        let bk = db.encode_bit_seg_key(b"foo", 42);
        assert_eq!(bk.len(), 3 + 8);
        let (key, seq) = db.decode_bit_seg_key(&bk).expect("Decode failed");
        assert_eq!(key, b"foo");
        assert_eq!(seq, 42);

        // Segment keys of one user key sort by sequence number
        let earlier = db.encode_bit_seg_key(b"foo", 41);
        assert!(earlier < bk);
    }

    #[test]
    fn test_seg_key_decode_rejects_malformed() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        assert_eq!(db.decode_bit_seg_key(b"short"), Err(Error::BitKey));

        let mut bk = db.encode_bit_seg_key(b"foo", 42);
        bk[0] ^= 0xff; // wrong database index
        assert_eq!(db.decode_bit_seg_key(&bk), Err(Error::BitKey));

        let mut bk = db.encode_bit_seg_key(b"foo", 42);
        BigEndian::write_u16(&mut bk[2..4], 2); // inconsistent key length
        assert_eq!(db.decode_bit_seg_key(&bk), Err(Error::BitKey));
    }

    #[test]
    fn test_set_get_single_bit() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        assert_eq!(db.set_bit(b"foo", 7, 1).expect("Set failed"), 0);
        assert_eq!(db.get_bit(b"foo", 7).expect("Get failed"), 1);
        assert_eq!(db.get_bit(b"foo", 6).expect("Get failed"), 0);
        assert_eq!(db.tail(b"foo").expect("Tail failed"), 7);
        assert_eq!(db.get(b"foo").expect("Get failed"), vec![0x80]);
    }

    #[test]
    fn test_set_bit_returns_original() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        assert_eq!(db.set_bit(b"foo", 7, 1).expect("Set failed"), 0);
        assert_eq!(db.set_bit(b"foo", 7, 1).expect("Set failed"), 1);
        assert_eq!(db.set_bit(b"foo", 7, 0).expect("Set failed"), 1);
        assert_eq!(db.set_bit(b"foo", 7, 0).expect("Set failed"), 0);
    }

    #[test]
    fn test_set_bit_across_segments() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        db.set_bit(b"foo", 0, 1).expect("Set failed");
        db.set_bit(b"foo", 4100, 1).expect("Set failed");

        assert_eq!(db.tail(b"foo").expect("Tail failed"), 4100);

        let data = db.get(b"foo").expect("Get failed");
        assert_eq!(data.len(), 513);
        assert_eq!(data[0], 0x01);
        assert_eq!(data[512], 0x10);
        assert!(data[1..512].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_missing_key_reads() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        assert_eq!(db.get_bit(b"foo", 0).expect("Get failed"), 0);
        assert_eq!(db.get_bit(b"foo", 100_000).expect("Get failed"), 0);
        assert_eq!(db.tail(b"foo").expect("Tail failed"), -1);
        assert!(db.get(b"foo").expect("Get failed").is_empty());
    }

    #[test]
    fn test_tail_advances_on_any_write() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        db.set_bit(b"foo", 100, 1).expect("Set failed");
        assert_eq!(db.tail(b"foo").expect("Tail failed"), 100);

        // Writes below the tail do not move it
        db.set_bit(b"foo", 5, 1).expect("Set failed");
        assert_eq!(db.tail(b"foo").expect("Tail failed"), 100);

        // Writing a zero past the tail does move it
        db.set_bit(b"foo", 200, 0).expect("Set failed");
        assert_eq!(db.tail(b"foo").expect("Tail failed"), 200);
    }

    #[test]
    fn test_set_bit_idempotent() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        db.set_bit(b"foo", 77, 1).expect("Set failed");
        let data = db.get(b"foo").expect("Get failed");
        let tail = db.tail(b"foo").expect("Tail failed");

        db.set_bit(b"foo", 77, 1).expect("Set failed");
        assert_eq!(db.get(b"foo").expect("Get failed"), data);
        assert_eq!(db.tail(b"foo").expect("Tail failed"), tail);
    }

    #[test]
    fn test_first_write_at_bit_zero_keeps_empty_tail() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        // The watermark update starts from the (0, 0) floor, so a write
        // touching only bit 0 never records a watermark: the value
        // reads back bit-wise but has no effective length.
        db.set_bit(b"foo", 0, 1).expect("Set failed");
        assert_eq!(db.get_bit(b"foo", 0).expect("Get failed"), 1);
        assert_eq!(db.tail(b"foo").expect("Tail failed"), -1);
        assert!(db.get(b"foo").expect("Get failed").is_empty());
    }

    #[test]
    fn test_invalid_bit_value_still_touches_tail() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        assert_eq!(db.set_bit(b"foo", 3, 2).expect("Set failed"), 0);
        assert_eq!(db.get_bit(b"foo", 3).expect("Get failed"), 0);
        assert_eq!(db.tail(b"foo").expect("Tail failed"), 3);
    }

    #[test]
    fn test_negative_offsets_resolve_from_tail() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        db.set_bit(b"foo", 6, 1).expect("Set failed");
        db.set_bit(b"foo", 7, 1).expect("Set failed");

        // Tail is 7, so -1 addresses bit 6
        assert_eq!(db.get_bit(b"foo", -1).expect("Get failed"), 1);
        assert_eq!(db.get_bit(b"foo", -7).expect("Get failed"), 0);
        assert_eq!(db.get_bit(b"foo", -100), Err(Error::Offset));
    }

    #[test]
    fn test_negative_offset_on_missing_key() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        assert_eq!(db.get_bit(b"foo", -1), Err(Error::Offset));
    }

    #[test]
    fn test_key_size_validation() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        assert_eq!(db.set_bit(b"", 0, 1), Err(Error::KeySize));
        assert_eq!(db.get(b""), Err(Error::KeySize));
        assert_eq!(db.delete(b""), Err(Error::KeySize));

        let long = vec![b'k'; 1025];
        assert_eq!(db.set_bit(&long, 0, 1), Err(Error::KeySize));
    }

    #[test]
    fn test_get_dense_layout() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        db.set_bit(b"foo", 0, 1).expect("Set failed");
        db.set_bit(b"foo", 13, 1).expect("Set failed");
        db.set_bit(b"foo", 4100, 1).expect("Set failed");

        let data = db.get(b"foo").expect("Get failed");
        assert_eq!(data.len(), 513);
        assert_eq!(data[0], 0x01);
        assert_eq!(data[1], 0x20);
        assert_eq!(data[512], 0x10);

        let popcount: i32 = data.iter().map(|b| BITS_IN_BYTE[*b as usize] as i32).sum();
        assert_eq!(popcount, 3);
    }

    #[test]
    fn test_count_is_segment_granular() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        db.set_bit(b"foo", 0, 1).expect("Set failed");
        db.set_bit(b"foo", 13, 1).expect("Set failed");
        db.set_bit(b"foo", 4100, 1).expect("Set failed");

        // Both segments covered
        assert_eq!(db.count(b"foo", 0, 4100).expect("Count failed"), 3);
        // A range within segment 0 still counts the whole segment
        assert_eq!(db.count(b"foo", 0, 0).expect("Count failed"), 2);
        // Second segment only
        assert_eq!(db.count(b"foo", 4096, 4100).expect("Count failed"), 1);
    }

    #[test]
    fn test_count_negative_end_resolves_against_tail() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        db.set_bit(b"foo", 0, 1).expect("Set failed");
        db.set_bit(b"foo", 13, 1).expect("Set failed");
        db.set_bit(b"foo", 4100, 1).expect("Set failed");

        // Tail is 4100, so -1 resolves to bit 4099 in segment 0
        assert_eq!(db.count(b"foo", 0, -1).expect("Count failed"), 2);
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        db.set_bit(b"foo", 7, 1).expect("Set failed");
        db.set_bit(b"foo", 4100, 1).expect("Set failed");
        assert_eq!(bit_region_count(&db), 3); // two segments + watermark

        assert_eq!(db.delete(b"foo").expect("Delete failed"), 2);
        assert_eq!(db.tail(b"foo").expect("Tail failed"), -1);
        assert!(db.get(b"foo").expect("Get failed").is_empty());
        assert_eq!(db.get_bit(b"foo", 7).expect("Get failed"), 0);
        assert_eq!(bit_region_count(&db), 0);

        // Deleting again drops nothing
        assert_eq!(db.delete(b"foo").expect("Delete failed"), 0);
    }

    #[test]
    fn test_or_operation() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        db.set_bit(b"a", 3, 1).expect("Set failed");
        db.set_bit(b"b", 5, 1).expect("Set failed");

        let len = db
            .operation(BitOp::Or, b"c", &[b"a".as_slice(), b"b".as_slice()])
            .expect("Operation failed");
        assert_eq!(len, 5);

        assert_eq!(db.get_bit(b"c", 3).expect("Get failed"), 1);
        assert_eq!(db.get_bit(b"c", 5).expect("Get failed"), 1);
        assert_eq!(db.get_bit(b"c", 4).expect("Get failed"), 0);
        assert_eq!(db.tail(b"c").expect("Tail failed"), 5);
        assert_eq!(db.get(b"c").expect("Get failed"), vec![0x28]);
    }

    #[test]
    fn test_and_operation() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        db.set_bit(b"a", 3, 1).expect("Set failed");
        db.set_bit(b"b", 5, 1).expect("Set failed");

        let len = db
            .operation(BitOp::And, b"c", &[b"a".as_slice(), b"b".as_slice()])
            .expect("Operation failed");
        assert_eq!(len, 5);

        assert_eq!(db.tail(b"c").expect("Tail failed"), 5);
        assert_eq!(db.get(b"c").expect("Get failed"), vec![0x00]);
    }

    #[test]
    fn test_and_with_disjoint_segments_zeroes_them() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        // a only touches segment 1, b only segment 0
        db.set_bit(b"a", 4100, 1).expect("Set failed");
        db.set_bit(b"b", 5, 1).expect("Set failed");

        db.operation(BitOp::And, b"c", &[b"a".as_slice(), b"b".as_slice()])
            .expect("Operation failed");

        assert_eq!(db.tail(b"c").expect("Tail failed"), 4100);
        assert!(db.get(b"c").expect("Get failed").iter().all(|b| *b == 0));
        assert_eq!(db.get_bit(b"c", 4100).expect("Get failed"), 0);
        assert_eq!(db.get_bit(b"c", 5).expect("Get failed"), 0);
    }

    #[test]
    fn test_not_operation() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        db.set_bit(b"a", 7, 1).expect("Set failed");

        let len = db
            .operation(BitOp::Not, b"c", &[b"a".as_slice()])
            .expect("Operation failed");
        assert_eq!(len, 7);

        assert_eq!(db.get(b"c").expect("Get failed"), vec![0x7f]);
        assert_eq!(db.get_bit(b"c", 7).expect("Get failed"), 0);
        for offset in 0..7 {
            assert_eq!(db.get_bit(b"c", offset).expect("Get failed"), 1);
        }
    }

    #[test]
    fn test_not_materializes_fill_past_tail() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        db.set_bit(b"a", 7, 1).expect("Set failed");
        db.operation(BitOp::Not, b"c", &[b"a".as_slice()])
            .expect("Operation failed");

        // Indexes where both operands were absent flip to all ones, so
        // segments past the tail exist and read as set. The dense value
        // stays bounded by the tail.
        assert_eq!(db.tail(b"c").expect("Tail failed"), 7);
        assert_eq!(db.get(b"c").expect("Get failed").len(), 1);
        assert_eq!(db.get_bit(b"c", SEG_BIT_SIZE as i32).expect("Get failed"), 1);
    }

    #[test]
    fn test_xor_with_self_cancels() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        db.set_bit(b"a", 3, 1).expect("Set failed");
        db.set_bit(b"a", 4100, 1).expect("Set failed");

        let len = db
            .operation(BitOp::Xor, b"d", &[b"a".as_slice(), b"a".as_slice()])
            .expect("Operation failed");
        assert_eq!(len, 4100);

        assert!(db.get(b"d").expect("Get failed").iter().all(|b| *b == 0));
        assert_eq!(db.get_bit(b"d", 3).expect("Get failed"), 0);
        assert_eq!(db.get_bit(b"d", 4100).expect("Get failed"), 0);
    }

    #[test]
    fn test_or_is_commutative() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        db.set_bit(b"a", 3, 1).expect("Set failed");
        db.set_bit(b"a", 4200, 1).expect("Set failed");
        db.set_bit(b"b", 5, 1).expect("Set failed");
        db.set_bit(b"b", 900, 1).expect("Set failed");

        db.operation(BitOp::Or, b"c", &[b"a".as_slice(), b"b".as_slice()])
            .expect("Operation failed");
        db.operation(BitOp::Or, b"d", &[b"b".as_slice(), b"a".as_slice()])
            .expect("Operation failed");

        assert_eq!(
            db.get(b"c").expect("Get failed"),
            db.get(b"d").expect("Get failed")
        );
        assert_eq!(
            db.tail(b"c").expect("Tail failed"),
            db.tail(b"d").expect("Tail failed")
        );
    }

    #[test]
    fn test_operation_with_self_is_identity() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        db.set_bit(b"k", 9, 1).expect("Set failed");
        db.set_bit(b"k", 4100, 1).expect("Set failed");
        let original = db.get(b"k").expect("Get failed");

        db.operation(BitOp::And, b"d", &[b"k".as_slice(), b"k".as_slice()])
            .expect("Operation failed");
        assert_eq!(db.get(b"d").expect("Get failed"), original);

        db.operation(BitOp::Or, b"e", &[b"k".as_slice(), b"k".as_slice()])
            .expect("Operation failed");
        assert_eq!(db.get(b"e").expect("Get failed"), original);
    }

    #[test]
    fn test_operation_rejects_bad_arity() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        db.set_bit(b"a", 3, 1).expect("Set failed");
        db.set_bit(b"b", 5, 1).expect("Set failed");

        // NOT takes exactly one source, the rest at least two
        assert_eq!(
            db.operation(BitOp::Not, b"c", &[b"a".as_slice(), b"b".as_slice()])
                .expect("Operation failed"),
            -1
        );
        assert_eq!(
            db.operation(BitOp::And, b"c", &[b"a".as_slice()])
                .expect("Operation failed"),
            -1
        );
        assert_eq!(
            db.operation(BitOp::Or, b"c", &[]).expect("Operation failed"),
            -1
        );
        assert_eq!(
            db.operation(BitOp::Or, b"", &[b"a".as_slice(), b"b".as_slice()])
                .expect("Operation failed"),
            -1
        );

        // The destination was never touched
        assert_eq!(db.tail(b"c").expect("Tail failed"), -1);
    }

    #[test]
    fn test_operation_without_source_data() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        assert_eq!(
            db.operation(BitOp::Or, b"c", &[b"nope".as_slice(), b"nada".as_slice()])
                .expect("Operation failed"),
            -1
        );
        assert_eq!(db.tail(b"c").expect("Tail failed"), -1);
    }

    #[test]
    fn test_operation_replaces_destination() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        db.set_bit(b"c", 9, 1).expect("Set failed");
        db.expire(b"c", 100).expect("Expire failed");
        db.set_bit(b"a", 3, 1).expect("Set failed");
        db.set_bit(b"b", 5, 1).expect("Set failed");

        db.operation(BitOp::Or, b"c", &[b"a".as_slice(), b"b".as_slice()])
            .expect("Operation failed");

        // Old bits, watermark and expiry are gone
        assert_eq!(db.get_bit(b"c", 9).expect("Get failed"), 0);
        assert_eq!(db.tail(b"c").expect("Tail failed"), 5);
        assert_eq!(db.ttl(b"c").expect("Ttl failed"), -1);
    }

    #[test]
    fn test_expire_and_purge() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        db.set_bit(b"foo", 100, 1).expect("Set failed");
        assert_eq!(db.expire(b"foo", 100).expect("Expire failed"), 1);

        let ttl = db.ttl(b"foo").expect("Ttl failed");
        assert!(ttl > 0 && ttl <= 100, "unexpected ttl {ttl}");

        // Nothing is due yet
        assert_eq!(db.purge_expired(unix_now()).expect("Purge failed"), 0);
        assert_eq!(db.get_bit(b"foo", 100).expect("Get failed"), 1);

        // Past the deadline the sweep deletes the bitmap
        assert_eq!(db.purge_expired(unix_now() + 101).expect("Purge failed"), 1);
        assert_eq!(db.tail(b"foo").expect("Tail failed"), -1);
        assert_eq!(db.get_bit(b"foo", 100).expect("Get failed"), 0);
        assert_eq!(db.ttl(b"foo").expect("Ttl failed"), -1);
        assert_eq!(bit_region_count(&db), 0);
    }

    #[test]
    fn test_expire_missing_key() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        assert_eq!(db.expire(b"foo", 100).expect("Expire failed"), 0);
        assert_eq!(db.ttl(b"foo").expect("Ttl failed"), -1);
    }

    #[test]
    fn test_expire_rejects_bad_deadlines() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        db.set_bit(b"foo", 1, 1).expect("Set failed");
        assert_eq!(db.expire(b"foo", 0), Err(Error::ExpireValue));
        assert_eq!(db.expire(b"foo", -5), Err(Error::ExpireValue));
        assert_eq!(db.expire_at(b"foo", unix_now() - 1), Err(Error::ExpireValue));
    }

    #[test]
    fn test_persist() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = open_db(&dir);

        db.set_bit(b"foo", 1, 1).expect("Set failed");
        db.expire(b"foo", 100).expect("Expire failed");

        assert_eq!(db.persist(b"foo").expect("Persist failed"), 1);
        assert_eq!(db.ttl(b"foo").expect("Ttl failed"), -1);
        assert_eq!(db.persist(b"foo").expect("Persist failed"), 0);

        // The value itself survives
        assert_eq!(db.get_bit(b"foo", 1).expect("Get failed"), 1);
    }

    #[test]
    fn test_flush_is_scoped_to_database() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let store = Arc::new(Memory::open(dir.path()).expect("Failed to open store"));
        let db0 = Db::with_store(store.clone(), 0).expect("Failed to open db 0");
        let db1 = Db::with_store(store, 1).expect("Failed to open db 1");

        db0.set_bit(b"k1", 3, 1).expect("Set failed");
        db0.set_bit(b"k2", 5, 1).expect("Set failed");
        db0.expire(b"k1", 100).expect("Expire failed");
        db1.set_bit(b"k3", 1, 1).expect("Set failed");

        // Two segments and two watermarks
        assert_eq!(db0.flush().expect("Flush failed"), 4);

        assert_eq!(db0.tail(b"k1").expect("Tail failed"), -1);
        assert_eq!(db0.tail(b"k2").expect("Tail failed"), -1);
        assert_eq!(db0.ttl(b"k1").expect("Ttl failed"), -1);
        assert_eq!(bit_region_count(&db0), 0);

        // The other database is untouched
        assert_eq!(db1.tail(b"k3").expect("Tail failed"), 1);
        assert_eq!(db1.get_bit(b"k3", 1).expect("Get failed"), 1);
    }

    #[test]
    fn test_databases_are_isolated() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let store = Arc::new(Memory::open(dir.path()).expect("Failed to open store"));
        let db0 = Db::with_store(store.clone(), 0).expect("Failed to open db 0");
        let db1 = Db::with_store(store, 1).expect("Failed to open db 1");

        db0.set_bit(b"foo", 7, 1).expect("Set failed");

        assert_eq!(db1.get_bit(b"foo", 7).expect("Get failed"), 0);
        assert_eq!(db1.tail(b"foo").expect("Tail failed"), -1);
        assert!(db1.get(b"foo").expect("Get failed").is_empty());
    }

    #[test]
    fn test_bitmaps_survive_reopen() {
        let dir = TempDir::new().expect("Failed to create temporary directory");

        {
            let db = open_db(&dir);
            db.set_bit(b"foo", 7, 1).expect("Set failed");
            db.set_bit(b"foo", 4100, 1).expect("Set failed");
            db.sync().expect("Sync failed");
        }

        let db = open_db(&dir);
        assert_eq!(db.get_bit(b"foo", 7).expect("Get failed"), 1);
        assert_eq!(db.get_bit(b"foo", 4100).expect("Get failed"), 1);
        assert_eq!(db.tail(b"foo").expect("Tail failed"), 4100);
    }
}
