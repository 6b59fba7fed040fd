//! Checkpoint manager tying the log, header, tree, reached index and
//! bookmark slots together.

use crate::bookmarks::BookmarkStore;
use crate::differ::{self, NodeChange, ScriptNode};
use crate::error::{Result, SaveError};
use crate::header::SaveHeader;
use crate::reached::ReachedIndex;
use crate::records::RecordStore;
use crate::tree::NodeTree;
use crate::types::{
    Bookmark, FromSaveValue, GameStateCheckpoint, NodeRecord, Offset, ReachedDialogueData,
    SaveId, SaveStats, SaveValue, SlotId,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Save root configuration.
#[derive(Clone, Debug)]
pub struct SaveConfig {
    /// Per-profile save root holding the log and the slot files.
    pub root: PathBuf,

    /// Extension of `global.<ext>` and `sav###.<ext>`.
    pub extension: String,

    /// Bytes reserved for the header record.
    pub header_capacity: u32,

    /// Bookmark content cache size (number of bookmarks).
    pub bookmark_cache_size: usize,

    /// Sync the log every N appends.
    pub sync_interval: u64,

    /// Whether to create the save root if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./saves"),
            extension: "dat".to_string(),
            header_capacity: 64 * 1024,
            bookmark_cache_size: 64,
            sync_interval: 100,
            create_if_missing: true,
        }
    }
}

impl SaveConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Path of the global log.
    pub fn log_path(&self) -> PathBuf {
        self.root.join(format!("global.{}", self.extension))
    }
}

/// One save family: the global log plus the bookmark slots beside it.
///
/// Owns the log file handle. Call [`SaveStore::close`] to flush and release
/// it; dropping the store flushes on a best-effort basis.
pub struct SaveStore {
    config: SaveConfig,

    log: RecordStore,

    header: SaveHeader,

    /// Projection of the reached region, rebuilt on open.
    reached: ReachedIndex,

    bookmarks: BookmarkStore,

    /// Set when opening found a corrupted log and started over.
    progress_was_reset: bool,

    closed: bool,
}

impl SaveStore {
    /// Open an existing save root or create a new one.
    pub fn open_or_create(config: SaveConfig) -> Result<Self> {
        if config.log_path().exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(SaveError::NotInitialized)
        }
    }

    /// Start a new save family. Fails if the log already holds data.
    pub fn create(config: SaveConfig) -> Result<Self> {
        fs::create_dir_all(&config.root)?;

        let mut log = Self::open_log(&config)?;
        let header = SaveHeader::create(&mut log, config.header_capacity)?;

        info!(root = %config.root.display(), save_id = %header.save_id(), "Created save log");
        Self::assemble(config, log, header, ReachedIndex::new())
    }

    /// Open an existing save family.
    ///
    /// Any structural problem in the log surfaces as an error for which
    /// [`SaveError::is_corruption`] holds.
    pub fn open(config: SaveConfig) -> Result<Self> {
        if !config.log_path().exists() {
            return Err(SaveError::NotInitialized);
        }

        let mut log = Self::open_log(&config)?;
        let mut header = SaveHeader::load(&mut log)?;

        // Anything past the committed regions is a write that never made it
        // into the header.
        let file_len = log.file_len()?;
        log.set_end(header.log_end())?;
        if file_len > log.end() {
            debug!(
                committed = log.end(),
                file_len, "Ignoring uncommitted bytes at the log tail"
            );
        }

        let checkpoints = header.checkpoint_region();
        if !checkpoints.is_empty() {
            NodeTree::new(&mut log, &mut header).node(checkpoints.begin)?;
        }
        let reached = ReachedIndex::rebuild(&mut log, &header)?;

        info!(
            root = %config.root.display(),
            save_id = %header.save_id(),
            reached_nodes = reached.node_count(),
            "Opened save log"
        );
        Self::assemble(config, log, header, reached)
    }

    /// Open the save root, starting a fresh family if the log is corrupted.
    ///
    /// Bookmark files are kept; they no longer match the new family and load
    /// as absent.
    pub fn open_or_reset(config: SaveConfig) -> Result<Self> {
        match Self::open_or_create(config.clone()) {
            Err(e) if e.is_corruption() => {
                warn!(error = %e, root = %config.root.display(), "Save log corrupted, resetting progress");

                let mut log = Self::open_log(&config)?;
                log.truncate()?;
                let header = SaveHeader::create(&mut log, config.header_capacity)?;

                let mut store = Self::assemble(config, log, header, ReachedIndex::new())?;
                store.progress_was_reset = true;
                Ok(store)
            }
            other => other,
        }
    }

    fn open_log(config: &SaveConfig) -> Result<RecordStore> {
        RecordStore::open_with_sync_interval(config.log_path(), config.sync_interval)
    }

    fn assemble(
        config: SaveConfig,
        log: RecordStore,
        header: SaveHeader,
        reached: ReachedIndex,
    ) -> Result<Self> {
        let bookmarks = BookmarkStore::new(
            &config.root,
            &config.extension,
            config.bookmark_cache_size,
        )?;

        Ok(Self {
            config,
            log,
            header,
            reached,
            bookmarks,
            progress_was_reset: false,
            closed: false,
        })
    }

    /// Whether opening discarded a corrupted log.
    pub fn progress_was_reset(&self) -> bool {
        self.progress_was_reset
    }

    /// Throw away all progress and start a new save family.
    ///
    /// Slot files stay on disk; the content cache is emptied since every
    /// cached bookmark belongs to the old family.
    pub fn reset(&mut self) -> Result<()> {
        let previous = self.header.save_id();

        self.log.truncate()?;
        self.header = SaveHeader::create(&mut self.log, self.config.header_capacity)?;
        self.reached.clear();
        self.bookmarks.clear_cache();

        info!(%previous, save_id = %self.header.save_id(), "Reset save log");
        Ok(())
    }

    // --- Header ---

    pub fn save_id(&self) -> SaveId {
        self.header.save_id()
    }

    pub fn header(&self) -> &SaveHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut SaveHeader {
        &mut self.header
    }

    pub fn get_user<T: FromSaveValue>(&self, key: &str) -> Result<Option<T>> {
        self.header.get_user(key)
    }

    pub fn set_user(&mut self, key: impl Into<String>, value: impl Into<SaveValue>) {
        self.header.set_user(key, value);
    }

    // --- Node tree ---

    /// View over the history tree for navigation and checkpoints.
    pub fn tree(&mut self) -> NodeTree<'_> {
        NodeTree::new(&mut self.log, &mut self.header)
    }

    pub fn get_or_create_child(
        &mut self,
        parent: Option<Offset>,
        name: &str,
        variables_hash: u64,
        dialogue_start: u32,
    ) -> Result<NodeRecord> {
        self.tree()
            .get_or_create_child(parent, name, variables_hash, dialogue_start)
    }

    pub fn append_checkpoint(&mut self, payload: &GameStateCheckpoint) -> Result<Offset> {
        self.tree().append_checkpoint(payload)
    }

    pub fn get_checkpoint(&mut self, reference: Offset) -> Result<GameStateCheckpoint> {
        self.tree().get_checkpoint(reference)
    }

    pub fn save_checkpoint(
        &mut self,
        node: Offset,
        payload: &GameStateCheckpoint,
    ) -> Result<Offset> {
        self.tree().save_checkpoint(node, payload)
    }

    /// Node reached through a named branch.
    pub fn find_node_by_branch(&mut self, _branch: &str) -> Result<Offset> {
        Err(SaveError::Unsupported("lookup of nodes by branch name"))
    }

    /// Whether a named branch was taken in any earlier session.
    pub fn is_branch_reached_any_history(&self, _branch: &str) -> Result<bool> {
        Err(SaveError::Unsupported("cross-session branch history"))
    }

    // --- Reached index ---

    pub fn reached(&self) -> &ReachedIndex {
        &self.reached
    }

    /// Mark a dialogue line as shown. Returns `false` if it already was.
    pub fn set_reached(&mut self, data: ReachedDialogueData) -> Result<bool> {
        self.reached.set_reached(&mut self.log, &mut self.header, data)
    }

    /// Mark an ending as reached. Returns `false` if it already was.
    pub fn set_end_reached(&mut self, name: &str) -> Result<bool> {
        self.reached
            .set_end_reached(&mut self.log, &mut self.header, name)
    }

    pub fn is_reached_any_history(&self, node_name: &str, dialogue_index: u32) -> bool {
        self.reached.is_reached_any_history(node_name, dialogue_index)
    }

    pub fn is_end_reached(&self, name: &str) -> bool {
        self.reached.is_end_reached(name)
    }

    // --- Script changes ---

    /// Report nodes whose content changed since the last run, then record
    /// the current hashes in the header.
    ///
    /// The reached index is left as it is.
    pub fn diff_script(&mut self, nodes: &[ScriptNode]) -> Vec<NodeChange> {
        let changes = differ::detect_changes(self.header.node_hashes(), &self.reached, nodes);

        for change in &changes {
            if change.history_intact() {
                debug!(node = %change.name, "Script node changed");
            } else {
                warn!(
                    node = %change.name,
                    valid = change.valid_prefix,
                    reached = change.reached,
                    "Script node changed under reached dialogue"
                );
            }
        }

        for node in nodes {
            self.header.set_node_hash(node.name.as_str(), node.content_hash);
        }
        changes
    }

    // --- Bookmarks ---

    pub fn bookmarks(&self) -> &BookmarkStore {
        &self.bookmarks
    }

    /// Write a bookmark to slot `id`.
    ///
    /// The header and log are made durable first so the slot never refers
    /// to log data that a crash could take back.
    pub fn save_bookmark(&mut self, id: SlotId, bookmark: &Bookmark) -> Result<Arc<Bookmark>> {
        let region = self.header.checkpoint_region();
        for (what, offset) in [("node", bookmark.node), ("checkpoint", bookmark.checkpoint_ref)] {
            if offset.is_some() && !region.contains(offset) {
                return Err(SaveError::InvalidOperation(format!(
                    "Bookmark {} reference {} is outside the checkpoint region",
                    what, offset
                )));
            }
        }

        self.header.mark_dirty();
        self.header.flush_if_dirty(&mut self.log)?;
        self.bookmarks.save(id, bookmark, self.header.save_id())
    }

    /// Read slot `id` from disk. `None` if missing or from another family.
    pub fn load_bookmark(&self, id: SlotId) -> Result<Option<Arc<Bookmark>>> {
        let loaded = self.bookmarks.load(id, self.header.save_id())?;
        if loaded.is_none() && self.bookmarks.contains(id) {
            info!(slot = id, "Bookmark belongs to a previous save family");
        }
        Ok(loaded)
    }

    /// Cached bookmark for slot `id`, loading it on first access.
    pub fn bookmark(&self, id: SlotId) -> Result<Option<Arc<Bookmark>>> {
        self.bookmarks.get(id, self.header.save_id())
    }

    pub fn delete_bookmark(&self, id: SlotId) -> Result<bool> {
        self.bookmarks.delete(id)
    }

    /// Warm the content cache for every slot in `[begin, end)`.
    pub fn eager_load_bookmarks(&self, begin: SlotId, end: SlotId) -> Result<usize> {
        self.bookmarks
            .eager_load_range(begin, end, self.header.save_id())
    }

    /// Checkpoint a bookmark points at, read back from the log.
    pub fn bookmark_checkpoint(&mut self, bookmark: &Bookmark) -> Result<GameStateCheckpoint> {
        if bookmark.save_id != Some(self.header.save_id()) {
            return Err(SaveError::InvalidOperation(
                "Bookmark belongs to another save family".into(),
            ));
        }
        self.get_checkpoint(bookmark.checkpoint_ref)
    }

    // --- Store Operations ---

    /// Write the header if it changed. Returns whether a write happened.
    pub fn flush_if_dirty(&mut self) -> Result<bool> {
        self.header.flush_if_dirty(&mut self.log)
    }

    /// Flush the header and force the log to durable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.header.flush_if_dirty(&mut self.log)?;
        self.log.flush()
    }

    /// Flush everything and release the log file.
    pub fn close(mut self) -> Result<()> {
        self.sync()?;
        self.closed = true;
        debug!(root = %self.config.root.display(), "Closed save log");
        Ok(())
    }

    pub fn stats(&self) -> SaveStats {
        SaveStats {
            log_size_bytes: self.log.end(),
            checkpoint_region_bytes: self.header.checkpoint_region().len(),
            reached_region_bytes: self.header.reached_region().len(),
            reached_node_count: self.reached.node_count() as u64,
            reached_dialogue_count: self.reached.dialogue_count() as u64,
            ending_count: self.reached.ending_count() as u64,
            bookmark_count: self.bookmarks.len() as u64,
            cached_bookmark_count: self.bookmarks.cached_len() as u64,
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.root
    }

    pub fn config(&self) -> &SaveConfig {
        &self.config
    }
}

impl Drop for SaveStore {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Best-effort flush on drop
        if let Err(e) = self.sync() {
            warn!(error = %e, "Failed to flush save log on drop");
        }
    }
}
