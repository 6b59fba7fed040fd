//! Global save header.
//!
//! The header is the record at offset 0 of the log. It names the save family,
//! delimits the checkpoint and reached regions, and carries the node-hash and
//! user-data maps. Mutations only set a dirty flag; the record is rewritten in
//! place by [`SaveHeader::flush_if_dirty`].

use crate::error::{Result, SaveError};
use crate::records::{LogRecord, RecordKind, RecordStore};
use crate::types::{ContentHash, FromSaveValue, Offset, SaveId, SaveValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Current header format version.
const HEADER_VERSION: u8 = 1;

/// Start and end of a log region. An empty region has `begin == end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub begin: Offset,
    pub end: Offset,
}

impl Region {
    fn empty_at(offset: u64) -> Self {
        Region {
            begin: Offset(offset),
            end: Offset(offset),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn len(&self) -> u64 {
        self.end.0 - self.begin.0
    }

    /// Whether `offset` may address a committed record of this region.
    pub fn contains(&self, offset: Offset) -> bool {
        offset.is_some() && offset >= self.begin && offset < self.end
    }

    fn note_append(&mut self, offset: u64, new_end: u64) {
        if self.is_empty() {
            self.begin = Offset(offset);
        }
        self.end = Offset(new_end);
    }
}

/// Serialized form of the header.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct HeaderData {
    version: u8,
    save_id: SaveId,
    reached: Region,
    checkpoint: Region,
    node_hashes: BTreeMap<String, ContentHash>,
    user_data: BTreeMap<String, SaveValue>,
}

impl LogRecord for HeaderData {
    const KIND: RecordKind = RecordKind::Header;
}

/// In-memory header with dirty tracking.
#[derive(Debug)]
pub struct SaveHeader {
    data: HeaderData,
    dirty: bool,
}

impl SaveHeader {
    /// Write a fresh header into an empty log.
    ///
    /// `capacity` bytes are reserved for the header so it can be rewritten in
    /// place as its maps grow.
    pub fn create(log: &mut RecordStore, capacity: u32) -> Result<Self> {
        if log.end() != 0 {
            return Err(SaveError::InvalidOperation(
                "Header can only be created in an empty log".into(),
            ));
        }

        let mut data = HeaderData {
            version: HEADER_VERSION,
            save_id: SaveId::generate(),
            reached: Region::empty_at(0),
            checkpoint: Region::empty_at(0),
            node_hashes: BTreeMap::new(),
            user_data: BTreeMap::new(),
        };

        log.append_with_capacity(&data, capacity)?;
        let regions_start = log.end();
        data.reached = Region::empty_at(regions_start);
        data.checkpoint = Region::empty_at(regions_start);
        log.write_record(0, &data)?;
        log.flush()?;

        debug!(save_id = %data.save_id, "Created save header");

        Ok(Self { data, dirty: false })
    }

    /// Load the header from offset 0 and check its region pointers.
    pub fn load(log: &mut RecordStore) -> Result<Self> {
        let data: HeaderData = log.read(0)?;
        if data.version != HEADER_VERSION {
            return Err(SaveError::InvalidFormat(format!(
                "Unsupported header version: {}",
                data.version
            )));
        }

        let regions_start = log.next_record_offset(0)?;
        for (name, region) in [("reached", data.reached), ("checkpoint", data.checkpoint)] {
            if region.begin.0 < regions_start || region.begin > region.end {
                return Err(SaveError::Corruption(format!(
                    "Invalid {} region {:?}",
                    name, region
                )));
            }
        }

        Ok(Self { data, dirty: false })
    }

    pub fn save_id(&self) -> SaveId {
        self.data.save_id
    }

    pub fn reached_region(&self) -> Region {
        self.data.reached
    }

    pub fn checkpoint_region(&self) -> Region {
        self.data.checkpoint
    }

    /// Where committed data stops: the end of whichever region reaches further.
    pub fn log_end(&self) -> u64 {
        self.data.reached.end.0.max(self.data.checkpoint.end.0)
    }

    /// Account for a record appended to the checkpoint region.
    pub fn note_checkpoint_append(&mut self, offset: u64, new_end: u64) {
        self.data.checkpoint.note_append(offset, new_end);
        self.dirty = true;
    }

    /// Account for a record appended to the reached region.
    pub fn note_reached_append(&mut self, offset: u64, new_end: u64) {
        self.data.reached.note_append(offset, new_end);
        self.dirty = true;
    }

    // --- Node hashes ---

    pub fn node_hash(&self, name: &str) -> Option<ContentHash> {
        self.data.node_hashes.get(name).copied()
    }

    pub fn node_hashes(&self) -> &BTreeMap<String, ContentHash> {
        &self.data.node_hashes
    }

    pub fn set_node_hash(&mut self, name: impl Into<String>, hash: ContentHash) {
        let name = name.into();
        if self.data.node_hashes.get(&name) != Some(&hash) {
            self.data.node_hashes.insert(name, hash);
            self.dirty = true;
        }
    }

    // --- User data ---

    pub fn user_value(&self, key: &str) -> Option<&SaveValue> {
        self.data.user_data.get(key)
    }

    /// Typed lookup. A value of another kind is an error, never coerced.
    pub fn get_user<T: FromSaveValue>(&self, key: &str) -> Result<Option<T>> {
        match self.data.user_data.get(key) {
            None => Ok(None),
            Some(value) => T::from_save_value(value)
                .map(Some)
                .ok_or_else(|| SaveError::TypeMismatch {
                    key: key.to_string(),
                    expected: T::KIND,
                    found: value.kind(),
                }),
        }
    }

    pub fn set_user(&mut self, key: impl Into<String>, value: impl Into<SaveValue>) {
        self.data.user_data.insert(key.into(), value.into());
        self.dirty = true;
    }

    pub fn remove_user(&mut self, key: &str) -> Option<SaveValue> {
        let removed = self.data.user_data.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn user_keys(&self) -> impl Iterator<Item = &str> {
        self.data.user_data.keys().map(String::as_str)
    }

    // --- Persistence ---

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Rewrite the header at offset 0 if anything changed, then flush the log.
    ///
    /// Returns whether a write happened. The rewrite is not atomic; a torn
    /// header is recovered by a full reset.
    pub fn flush_if_dirty(&mut self, log: &mut RecordStore) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        log.write_record(0, &self.data)?;
        log.flush()?;
        self.dirty = false;

        debug!(
            checkpoint_end = self.data.checkpoint.end.0,
            reached_end = self.data.reached.end.0,
            "Flushed save header"
        );
        Ok(true)
    }
}
