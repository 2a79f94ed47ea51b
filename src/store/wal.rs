use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::errdata;
use crate::error::{Error, Result};
use crate::hasher::Hasher;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

pub const HEADER_SIZE: usize = 22;

const MAGIC_NUMBER: u32 = 0x45_4D_42; // ASCII "EMB"

const OP_PUT: u8 = 0;
const OP_DELETE: u8 = 1;

/// Fixed-size log header kept at the start of the file. The entry count
/// and rolling checksum are only persisted on `sync`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
    pub magic_number: u32,
    pub version: u16,
    pub entry_count: u64,
    pub checksum: u64,
}

impl Header {
    pub fn new(version: u16) -> Self {
        Header {
            magic_number: MAGIC_NUMBER,
            version,
            entry_count: 0,
            checksum: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        // Writing into a Vec cannot fail.
        buf.write_u32::<BigEndian>(self.magic_number).unwrap();
        buf.write_u16::<BigEndian>(self.version).unwrap();
        buf.write_u64::<BigEndian>(self.entry_count).unwrap();
        buf.write_u64::<BigEndian>(self.checksum).unwrap();
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return errdata!("wal header truncated: {} bytes", bytes.len());
        }

        let mut reader = bytes;
        let magic_number = reader.read_u32::<BigEndian>()?;
        let version = reader.read_u16::<BigEndian>()?;
        let entry_count = reader.read_u64::<BigEndian>()?;
        let checksum = reader.read_u64::<BigEndian>()?;

        if magic_number != MAGIC_NUMBER {
            return errdata!("wal header magic mismatch: {magic_number:#x}");
        }

        Ok(Header {
            magic_number,
            version,
            entry_count,
            checksum,
        })
    }
}

/// Write-ahead log for the in-memory store. Each entry is either an
/// insert or a tombstone, framed with length prefixes and a crc64
/// trailer so a torn tail is detected on replay.
#[derive(Debug)]
pub struct Wal {
    writer: Mutex<BufWriter<File>>,
    header: RwLock<Header>,
    log_hash: Mutex<Hasher>,
    file: File,
    path: PathBuf,
}

impl Wal {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let mut writer = BufWriter::new(file.try_clone()?);

        // Use a local BufReader to read the header
        let mut reader = BufReader::new(file.try_clone()?);
        let mut buf = vec![0u8; HEADER_SIZE];
        let header = match reader.read_exact(&mut buf) {
            Ok(_) => Header::decode(&buf)?,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Empty or incomplete file, start from a fresh header
                let header = Header::new(1);
                writer.get_mut().seek(SeekFrom::Start(0))?;
                writer.write_all(&header.encode())?;
                writer.flush()?;
                header
            }
            Err(e) => return Err(e.into()),
        };

        writer.get_mut().seek(SeekFrom::End(0))?;

        // Rebuild the rolling checksum so appends continue where the
        // previous process stopped.
        let mut log_hash = Hasher::new();
        let replay = ReplayIterator::new(BufReader::new(file.try_clone()?))?;
        for entry in replay {
            let (key, value) = entry?;
            log_hash.write(&key);
            if let Some(value) = &value {
                log_hash.write(value);
            }
        }

        Ok(Self {
            writer: Mutex::new(writer),
            header: RwLock::new(header),
            log_hash: Mutex::new(log_hash),
            file,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current size of the log file.
    pub fn size(&self) -> u64 {
        self.file.metadata().map_or(0, |meta| meta.len())
    }

    pub fn entry_count(&self) -> u64 {
        self.header.read().map(|h| h.entry_count).unwrap_or(0)
    }

    /// Appends an insert (`Some`) or a tombstone (`None`) for the key.
    pub fn append(&self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let mut writer = self.writer.lock()?;

        let mut hasher = Hasher::new();
        match value {
            Some(value) => {
                writer.write_u8(OP_PUT)?;
                writer.write_u32::<BigEndian>(key.len() as u32)?;
                writer.write_all(key)?;
                writer.write_u32::<BigEndian>(value.len() as u32)?;
                writer.write_all(value)?;
                hasher.write(key);
                hasher.write(value);
            }
            None => {
                writer.write_u8(OP_DELETE)?;
                writer.write_u32::<BigEndian>(key.len() as u32)?;
                writer.write_all(key)?;
                hasher.write(key);
            }
        }
        writer.write_u64::<BigEndian>(hasher.checksum())?;

        self.header.write()?.entry_count += 1;
        let mut log_hash = self.log_hash.lock()?;
        log_hash.write(key);
        if let Some(value) = value {
            log_hash.write(value);
        }

        Ok(())
    }

    /// Flushes buffered entries to the file without rewriting the header.
    pub fn flush(&self) -> Result<()> {
        self.writer.lock()?.flush()?;
        Ok(())
    }

    /// Replays the log, yielding entries in append order.
    pub fn replay(&self) -> Result<ReplayIterator> {
        let reader = BufReader::new(self.file.try_clone()?);
        ReplayIterator::new(reader)
    }

    /// Flushes entries and persists the header (entry count + rolling
    /// checksum) to disk.
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock()?;
        writer.flush()?;

        let mut header = *self.header.read()?;
        header.checksum = self.log_hash.lock()?.checksum();
        self.header.write()?.checksum = header.checksum;

        writer.get_mut().seek(SeekFrom::Start(0))?;
        writer.write_all(&header.encode())?;
        writer.flush()?;
        writer.get_mut().seek(SeekFrom::End(0))?;
        Ok(())
    }

    /// Replays every entry and compares the accumulated checksum with
    /// the header. Detects corruption that per-entry trailers miss,
    /// e.g. a truncated file rewritten with stale entries.
    pub fn validate_checksum(&self) -> Result<()> {
        let mut hasher = Hasher::new();
        for entry in self.replay()? {
            let (key, value) = entry?;
            hasher.write(&key);
            if let Some(value) = &value {
                hasher.write(value);
            }
        }

        let expected = self.header.read()?.checksum;
        if hasher.checksum() != expected {
            return errdata!(
                "wal checksum mismatch: stored={}, computed={}",
                expected,
                hasher.checksum()
            );
        }
        Ok(())
    }
}

pub struct ReplayIterator {
    reader: BufReader<File>,
}

impl ReplayIterator {
    pub fn new(mut reader: BufReader<File>) -> Result<Self> {
        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        Ok(ReplayIterator { reader })
    }

    fn read<R: Read>(reader: &mut R) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>> {
        let op = match reader.read_u8() {
            Ok(op) => op,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(None); // Clean EOF
            }
            Err(e) => return Err(e.into()),
        };

        if op != OP_PUT && op != OP_DELETE {
            return errdata!("wal entry has unknown op {op}");
        }

        let key_length = Self::read_mid(reader.read_u32::<BigEndian>(), "key length")? as usize;

        let mut key = vec![0u8; key_length];
        Self::read_mid(reader.read_exact(&mut key), "key")?;

        let value = if op == OP_PUT {
            let value_length =
                Self::read_mid(reader.read_u32::<BigEndian>(), "value length")? as usize;
            let mut value = vec![0u8; value_length];
            Self::read_mid(reader.read_exact(&mut value), "value")?;
            Some(value)
        } else {
            None
        };

        let stored_checksum = Self::read_mid(reader.read_u64::<BigEndian>(), "checksum")?;

        let mut hasher = Hasher::new();
        hasher.write(&key);
        if let Some(value) = &value {
            hasher.write(value);
        }

        if hasher.checksum() != stored_checksum {
            return errdata!(
                "wal entry checksum mismatch: stored={}, computed={}",
                stored_checksum,
                hasher.checksum()
            );
        }
        Ok(Some((key, value)))
    }

    /// Mid-entry reads must not hit EOF; a short read here means the
    /// tail of the log was torn.
    fn read_mid<T>(result: std::io::Result<T>, field: &str) -> Result<T> {
        result.map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                Error::InvalidData(format!("unexpected eof while reading wal entry {field}"))
            }
            _ => e.into(),
        })
    }
}

impl Iterator for ReplayIterator {
    type Item = Result<(Vec<u8>, Option<Vec<u8>>)>;

    fn next(&mut self) -> Option<Self::Item> {
        match ReplayIterator::read(&mut self.reader) {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
