//! Append-only record store over a single file.

use crate::error::{Result, SaveError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes at the start of every record.
const RECORD_MAGIC: &[u8; 2] = b"NR";

/// Record prefix size: magic + kind + flags + capacity + len + checksum.
pub const RECORD_HEADER_SIZE: u64 = 2 + 1 + 1 + 4 + 4 + 4;

/// What a record holds. Stored in the prefix so the log can be walked and
/// filtered without decoding bodies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    Header = 1,
    Node = 2,
    CheckpointIndex = 3,
    CheckpointPayload = 4,
    ReachedDialogue = 5,
    ReachedEnd = 6,
}

impl RecordKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(RecordKind::Header),
            2 => Some(RecordKind::Node),
            3 => Some(RecordKind::CheckpointIndex),
            4 => Some(RecordKind::CheckpointPayload),
            5 => Some(RecordKind::ReachedDialogue),
            6 => Some(RecordKind::ReachedEnd),
            _ => None,
        }
    }

    /// Kinds living in the checkpoint region.
    pub fn is_checkpoint_region(self) -> bool {
        matches!(
            self,
            RecordKind::Node | RecordKind::CheckpointIndex | RecordKind::CheckpointPayload
        )
    }

    /// Kinds living in the reached region.
    pub fn is_reached_region(self) -> bool {
        matches!(self, RecordKind::ReachedDialogue | RecordKind::ReachedEnd)
    }
}

/// A value that can be stored as a log record.
pub trait LogRecord: Serialize + DeserializeOwned {
    const KIND: RecordKind;

    /// Spare bytes reserved after the body so in-place rewrites can grow.
    const RESERVE: u32 = 0;
}

/// Decoded record prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordPrefix {
    pub kind: RecordKind,
    pub capacity: u32,
    pub len: u32,
    pub checksum: u32,
}

impl RecordPrefix {
    fn encode(&self) -> [u8; RECORD_HEADER_SIZE as usize] {
        let mut buf = [0u8; RECORD_HEADER_SIZE as usize];
        buf[0..2].copy_from_slice(RECORD_MAGIC);
        buf[2] = self.kind as u8;
        // buf[3]: flags, reserved
        buf[4..8].copy_from_slice(&self.capacity.to_le_bytes());
        buf[8..12].copy_from_slice(&self.len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }
}

/// Append-only record store.
///
/// Every record is self-describing: its prefix carries the reserved capacity,
/// so the offset of the next record is always `offset + RECORD_HEADER_SIZE +
/// capacity`. Nothing past [`RecordStore::end`] is considered written.
pub struct RecordStore {
    /// Path to the log file.
    path: PathBuf,

    /// Log file handle.
    file: File,

    /// Logical end of the log; the append cursor.
    end: u64,

    /// Number of appends since last sync.
    writes_since_sync: u64,

    /// Sync every N appends.
    sync_interval: u64,
}

impl RecordStore {
    /// Default sync interval.
    const DEFAULT_SYNC_INTERVAL: u64 = 100;

    /// Open or create a record store with the default sync interval.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(path, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create a record store, syncing every `sync_interval` appends.
    ///
    /// The logical end starts at the file length; callers that know where the
    /// committed data stops should narrow it with [`RecordStore::set_end`].
    pub fn open_with_sync_interval(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let end = file.metadata()?.len();

        Ok(Self {
            path,
            file,
            end,
            writes_since_sync: 0,
            sync_interval: sync_interval.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical end of the log.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Physical size of the file, which may include uncommitted bytes.
    pub fn file_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Move the logical end. Bytes past it are treated as never written.
    pub fn set_end(&mut self, end: u64) -> Result<()> {
        let file_len = self.file_len()?;
        if end > file_len {
            return Err(SaveError::Corruption(format!(
                "Log end {} lies beyond the file length {}",
                end, file_len
            )));
        }
        self.end = end;
        Ok(())
    }

    /// Read and validate the prefix of the record at `offset`.
    pub fn prefix_at(&mut self, offset: u64) -> Result<RecordPrefix> {
        if offset.saturating_add(RECORD_HEADER_SIZE) > self.end {
            return Err(SaveError::Corruption(format!(
                "Read at offset {} past log end {}",
                offset, self.end
            )));
        }

        let mut buf = [0u8; RECORD_HEADER_SIZE as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;

        if &buf[0..2] != RECORD_MAGIC {
            return Err(SaveError::Corruption(format!(
                "Invalid record magic at offset {}",
                offset
            )));
        }

        let kind = RecordKind::from_byte(buf[2]).ok_or_else(|| {
            SaveError::Corruption(format!("Unknown record kind {} at offset {}", buf[2], offset))
        })?;
        let capacity = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let len = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let checksum = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);

        if len > capacity || offset + RECORD_HEADER_SIZE + capacity as u64 > self.end {
            return Err(SaveError::Corruption(format!(
                "Record at offset {} overruns its slot or the log end",
                offset
            )));
        }

        Ok(RecordPrefix {
            kind,
            capacity,
            len,
            checksum,
        })
    }

    /// Offset of the record following the one at `offset`.
    pub fn next_record_offset(&mut self, offset: u64) -> Result<u64> {
        let prefix = self.prefix_at(offset)?;
        Ok(offset + RECORD_HEADER_SIZE + prefix.capacity as u64)
    }

    /// Read the checksummed body of the record at `offset`.
    pub fn read_raw(&mut self, offset: u64) -> Result<(RecordKind, Vec<u8>)> {
        let prefix = self.prefix_at(offset)?;

        let mut body = vec![0u8; prefix.len as usize];
        self.file.read_exact(&mut body)?;

        let computed = crc32fast::hash(&body);
        if computed != prefix.checksum {
            return Err(SaveError::ChecksumMismatch {
                expected: prefix.checksum,
                got: computed,
            });
        }

        Ok((prefix.kind, body))
    }

    /// Read and decode the record at `offset` as `T`.
    pub fn read<T: LogRecord>(&mut self, offset: u64) -> Result<T> {
        let (kind, body) = self.read_raw(offset)?;
        if kind != T::KIND {
            return Err(SaveError::Corruption(format!(
                "Expected {:?} record at offset {}, found {:?}",
                T::KIND,
                offset,
                kind
            )));
        }
        Ok(rmp_serde::from_slice(&body)?)
    }

    /// Overwrite the record at `offset` in place.
    ///
    /// The record must already exist with the same kind, and the new body must
    /// fit in its reserved capacity.
    pub fn write_record<T: LogRecord>(&mut self, offset: u64, value: &T) -> Result<()> {
        let prefix = self.prefix_at(offset)?;
        if prefix.kind != T::KIND {
            return Err(SaveError::Corruption(format!(
                "Cannot overwrite {:?} record at offset {} with {:?}",
                prefix.kind,
                offset,
                T::KIND
            )));
        }

        let body = rmp_serde::to_vec(value)?;
        if body.len() > prefix.capacity as usize {
            return Err(SaveError::RecordOverflow {
                offset,
                needed: body.len(),
                capacity: prefix.capacity as usize,
            });
        }

        let prefix = RecordPrefix {
            kind: T::KIND,
            capacity: prefix.capacity,
            len: body.len() as u32,
            checksum: crc32fast::hash(&body),
        };

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&prefix.encode())?;
        self.file.write_all(&body)?;
        Ok(())
    }

    /// Append a record at the logical end. Returns its offset.
    pub fn append_record<T: LogRecord>(&mut self, value: &T) -> Result<u64> {
        let body = rmp_serde::to_vec(value)?;
        let capacity = body.len() + T::RESERVE as usize;
        self.append_body(T::KIND, &body, capacity)
    }

    /// Append a record with an explicit slot size. Used for the header, whose
    /// slot has to absorb all of its future growth.
    pub fn append_with_capacity<T: LogRecord>(&mut self, value: &T, capacity: u32) -> Result<u64> {
        let body = rmp_serde::to_vec(value)?;
        if body.len() > capacity as usize {
            return Err(SaveError::RecordOverflow {
                offset: self.end,
                needed: body.len(),
                capacity: capacity as usize,
            });
        }
        self.append_body(T::KIND, &body, capacity as usize)
    }

    fn append_body(&mut self, kind: RecordKind, body: &[u8], capacity: usize) -> Result<u64> {
        let capacity = u32::try_from(capacity).map_err(|_| {
            SaveError::InvalidOperation(format!("Record of {} bytes is too large", capacity))
        })?;

        let prefix = RecordPrefix {
            kind,
            capacity,
            len: body.len() as u32,
            checksum: crc32fast::hash(body),
        };

        let offset = self.end;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&prefix.encode())?;
        self.file.write_all(body)?;

        // Pad the slot so the file always covers the logical end.
        let padding = capacity as usize - body.len();
        if padding > 0 {
            self.file.write_all(&vec![0u8; padding])?;
        }

        self.end = offset + RECORD_HEADER_SIZE + capacity as u64;

        self.writes_since_sync += 1;
        if self.writes_since_sync >= self.sync_interval {
            self.file.sync_data()?;
            self.writes_since_sync = 0;
        }

        Ok(offset)
    }

    /// Force all pending writes to durable storage.
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        self.writes_since_sync = 0;
        Ok(())
    }

    /// Drop every record and shrink the file to zero bytes.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.end = 0;
        self.flush()
    }

    /// Flush and release the file handle.
    pub fn dispose(mut self) -> Result<()> {
        self.flush()
    }

    /// Walk the records in `[begin, end)`.
    pub fn iter_range(&mut self, begin: u64, end: u64) -> RecordIterator<'_> {
        RecordIterator {
            store: self,
            offset: begin,
            end,
        }
    }
}

/// Iterator over record offsets and kinds in a range of the log.
pub struct RecordIterator<'a> {
    store: &'a mut RecordStore,
    offset: u64,
    end: u64,
}

impl<'a> Iterator for RecordIterator<'a> {
    type Item = Result<(u64, RecordKind)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.end {
            return None;
        }

        let current = self.offset;
        match self.store.prefix_at(current) {
            Ok(prefix) => {
                self.offset = current + RECORD_HEADER_SIZE + prefix.capacity as u64;
                if self.offset > self.end {
                    self.offset = self.end;
                    return Some(Err(SaveError::Corruption(format!(
                        "Record at offset {} straddles the region end",
                        current
                    ))));
                }
                Some(Ok((current, prefix.kind)))
            }
            Err(e) => {
                self.offset = self.end; // Stop iteration on error
                Some(Err(e))
            }
        }
    }
}
