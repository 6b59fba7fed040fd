//! Bookmark slot storage.

use crate::error::{Result, SaveError};
use crate::types::{Bookmark, SaveId, SlotId, Timestamp};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Magic bytes for slot files.
const BOOKMARK_MAGIC: &[u8; 4] = b"BMK\0";

/// Current slot file format version.
const BOOKMARK_VERSION: u8 = 1;

/// Slot file name prefix.
const SLOT_PREFIX: &str = "sav";

/// Which end of the timestamp range a query wants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotOrder {
    Earliest,
    Latest,
}

/// One file per slot, plus two caches: slot metadata from the directory
/// listing, and decoded bookmarks filled on demand.
pub struct BookmarkStore {
    /// Save root holding the slot files.
    dir: PathBuf,

    /// Slot file extension.
    extension: String,

    /// Slot id -> last modified time.
    metadata: RwLock<BTreeMap<SlotId, Timestamp>>,

    /// Decoded bookmarks. Evicting an entry releases its screenshot.
    cache: Mutex<LruCache<SlotId, Arc<Bookmark>>>,
}

impl BookmarkStore {
    /// Open the slots under `dir`, reading metadata from the directory only.
    pub fn new(dir: impl AsRef<Path>, extension: &str, cache_size: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let cache_size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);

        let store = Self {
            dir,
            extension: extension.to_string(),
            metadata: RwLock::new(BTreeMap::new()),
            cache: Mutex::new(LruCache::new(cache_size)),
        };
        store.rescan()?;
        Ok(store)
    }

    /// Rebuild slot metadata from the directory listing.
    pub fn rescan(&self) -> Result<usize> {
        let mut found = BTreeMap::new();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            if let Some(id) = self.parse_slot_name(&file_name.to_string_lossy()) {
                let modified = entry.metadata()?.modified()?;
                found.insert(id, Timestamp::from_system_time(modified));
            }
        }

        let count = found.len();
        *self.metadata.write() = found;
        debug!(slots = count, "Scanned bookmark slots");
        Ok(count)
    }

    /// Write `bookmark` to slot `id`, stamped with `save_id`.
    ///
    /// The screenshot is copied into an owned, normalized buffer; the caller's
    /// bookmark is left untouched. Returns the cached copy.
    pub fn save(&self, id: SlotId, bookmark: &Bookmark, save_id: SaveId) -> Result<Arc<Bookmark>> {
        let mut stored = bookmark.clone();
        stored.save_id = Some(save_id);
        stored.screenshot = match &bookmark.screenshot {
            Some(shot) => Some(shot.normalized()?),
            None => None,
        };

        let body = rmp_serde::to_vec(&stored)?;

        let path = self.slot_path(id);
        let mut file = File::create(&path)?;

        file.write_all(BOOKMARK_MAGIC)?;
        file.write_all(&[BOOKMARK_VERSION])?;
        file.write_all(&(body.len() as u64).to_le_bytes())?;
        file.write_all(&body)?;
        file.write_all(&crc32fast::hash(&body).to_le_bytes())?;
        file.sync_all()?;

        let stored = Arc::new(stored);
        {
            let mut cache = self.cache.lock();
            // Drop the previous entry before caching its replacement.
            cache.pop(&id);
            cache.put(id, Arc::clone(&stored));
        }
        self.metadata.write().insert(id, Timestamp::now());

        info!(slot = id, "Saved bookmark");
        Ok(stored)
    }

    /// Read slot `id` from disk, bypassing the cache, and cache the result.
    ///
    /// Returns `None` if the slot does not exist or was written for another
    /// save family; the file is left on disk either way.
    pub fn load(&self, id: SlotId, save_id: SaveId) -> Result<Option<Arc<Bookmark>>> {
        let bookmark = match self.read_slot(id)? {
            Some(bookmark) => bookmark,
            None => {
                self.metadata.write().remove(&id);
                self.cache.lock().pop(&id);
                return Ok(None);
            }
        };

        if bookmark.save_id != Some(save_id) {
            debug!(slot = id, "Bookmark belongs to another save family");
            self.cache.lock().pop(&id);
            return Ok(None);
        }

        let bookmark = Arc::new(bookmark);
        self.cache.lock().put(id, Arc::clone(&bookmark));
        Ok(Some(bookmark))
    }

    /// Cached bookmark for slot `id`, loading it if needed. `None` if no slot
    /// metadata exists for `id`.
    pub fn get(&self, id: SlotId, save_id: SaveId) -> Result<Option<Arc<Bookmark>>> {
        if let Some(cached) = self.cache.lock().get(&id) {
            if cached.save_id == Some(save_id) {
                return Ok(Some(Arc::clone(cached)));
            }
        }
        if !self.contains(id) {
            return Ok(None);
        }
        self.load(id, save_id)
    }

    /// Remove slot `id` from disk and both caches.
    pub fn delete(&self, id: SlotId) -> Result<bool> {
        self.cache.lock().pop(&id);
        self.metadata.write().remove(&id);

        match fs::remove_file(self.slot_path(id)) {
            Ok(()) => {
                info!(slot = id, "Deleted bookmark");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Load every existing slot in `[begin, end)` into the cache.
    pub fn eager_load_range(&self, begin: SlotId, end: SlotId, save_id: SaveId) -> Result<usize> {
        let ids: Vec<SlotId> = self
            .metadata
            .read()
            .range(begin..end.max(begin))
            .map(|(id, _)| *id)
            .collect();

        let mut loaded = 0;
        for id in ids {
            if self.load(id, save_id)?.is_some() {
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Drop every cached bookmark; metadata stays.
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    // --- Metadata queries ---

    pub fn contains(&self, id: SlotId) -> bool {
        self.metadata.read().contains_key(&id)
    }

    pub fn modified(&self, id: SlotId) -> Option<Timestamp> {
        self.metadata.read().get(&id).copied()
    }

    pub fn ids(&self) -> Vec<SlotId> {
        self.metadata.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.metadata.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.read().is_empty()
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Slot in `[begin, end)` with the earliest or latest modification time,
    /// or `begin` if the range has no slots.
    pub fn query_by_modified_time(&self, begin: SlotId, end: SlotId, order: SlotOrder) -> SlotId {
        if end <= begin {
            return begin;
        }
        let metadata = self.metadata.read();
        let slots = metadata.range(begin..end);
        let found = match order {
            SlotOrder::Earliest => slots.min_by_key(|(id, time)| (**time, **id)),
            SlotOrder::Latest => slots.max_by_key(|(id, time)| (**time, std::cmp::Reverse(**id))),
        };
        found.map_or(begin, |(id, _)| *id)
    }

    /// Greatest used slot at or above `begin`, or `begin` if there is none.
    pub fn query_max_used_id(&self, begin: SlotId) -> SlotId {
        self.metadata
            .read()
            .range(begin..)
            .next_back()
            .map_or(begin, |(id, _)| *id)
    }

    /// First slot in `begin..=end` with no metadata, or `None` when every
    /// id up to and including `end` is taken.
    pub fn query_min_unused_id(&self, begin: SlotId, end: SlotId) -> Option<SlotId> {
        let metadata = self.metadata.read();
        (begin..=end).find(|id| !metadata.contains_key(id))
    }

    // --- Files ---

    pub fn slot_path(&self, id: SlotId) -> PathBuf {
        self.dir.join(format!("{}{:03}.{}", SLOT_PREFIX, id, self.extension))
    }

    fn parse_slot_name(&self, file_name: &str) -> Option<SlotId> {
        let digits = file_name
            .strip_prefix(SLOT_PREFIX)?
            .strip_suffix(self.extension.as_str())?
            .strip_suffix('.')?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    fn read_slot(&self, id: SlotId) -> Result<Option<Bookmark>> {
        let mut file = match File::open(self.slot_path(id)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // Read and verify magic
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != BOOKMARK_MAGIC {
            return Err(SaveError::InvalidFormat(format!(
                "Invalid bookmark magic in slot {}",
                id
            )));
        }

        // Read version
        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != BOOKMARK_VERSION {
            return Err(SaveError::InvalidFormat(format!(
                "Unsupported bookmark version: {}",
                version[0]
            )));
        }

        // Read body
        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes);
        let file_len = file.metadata()?.len();
        if len > file_len {
            return Err(SaveError::Corruption(format!(
                "Bookmark slot {} claims {} bytes but the file has {}",
                id, len, file_len
            )));
        }

        let mut body = vec![0u8; len as usize];
        file.read_exact(&mut body)?;

        // Read and verify checksum
        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&body);
        if stored_checksum != computed_checksum {
            return Err(SaveError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        Ok(Some(rmp_serde::from_slice(&body)?))
    }
}
