//! Core types for the save log.

use crate::error::{Result, SaveError};
use crate::records::{LogRecord, RecordKind};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Byte offset of a record in the log.
///
/// Offset 0 always holds the header, so `Offset::NONE` doubles as "no record"
/// in every pointer field.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Offset(pub u64);

impl Offset {
    pub const NONE: Offset = Offset(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn is_some(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Offset({})", self.0)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric id of a bookmark slot (`sav###.<ext>`).
pub type SlotId = u32;

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// Convert a filesystem time. Times before the epoch clamp to zero.
    pub fn from_system_time(time: SystemTime) -> Self {
        let duration = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Content hash of a narrative node (SHA-256).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Compute hash from bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentHash(hasher.finalize().into())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> std::result::Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(ContentHash(arr))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Identifier of a save family. A fresh one is minted every time the log is
/// (re)initialized, which is what invalidates bookmarks written before a reset.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SaveId(pub [u8; 16]);

static SAVE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

impl SaveId {
    /// Mint a new identifier from the clock, the process id and a counter.
    pub fn generate() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let count = SAVE_ID_COUNTER.fetch_add(1, Ordering::Relaxed);

        let mut hasher = Sha256::new();
        hasher.update(nanos.to_le_bytes());
        hasher.update(std::process::id().to_le_bytes());
        hasher.update(count.to_le_bytes());
        let digest: [u8; 32] = hasher.finalize().into();

        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        SaveId(id)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for SaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SaveId({})", self.to_hex())
    }
}

impl fmt::Display for SaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A user-data value stored in the header.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SaveValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl SaveValue {
    /// Name of the variant, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            SaveValue::Bool(_) => "bool",
            SaveValue::Int(_) => "int",
            SaveValue::Float(_) => "float",
            SaveValue::Str(_) => "string",
        }
    }
}

impl From<bool> for SaveValue {
    fn from(v: bool) -> Self {
        SaveValue::Bool(v)
    }
}

impl From<i64> for SaveValue {
    fn from(v: i64) -> Self {
        SaveValue::Int(v)
    }
}

impl From<i32> for SaveValue {
    fn from(v: i32) -> Self {
        SaveValue::Int(v as i64)
    }
}

impl From<f64> for SaveValue {
    fn from(v: f64) -> Self {
        SaveValue::Float(v)
    }
}

impl From<&str> for SaveValue {
    fn from(v: &str) -> Self {
        SaveValue::Str(v.to_string())
    }
}

impl From<String> for SaveValue {
    fn from(v: String) -> Self {
        SaveValue::Str(v)
    }
}

/// Strict conversion out of a [`SaveValue`]. No cross-kind coercion: an
/// `Int` is never read back as a `Float` or a `Str`.
pub trait FromSaveValue: Sized {
    const KIND: &'static str;

    fn from_save_value(value: &SaveValue) -> Option<Self>;
}

impl FromSaveValue for bool {
    const KIND: &'static str = "bool";

    fn from_save_value(value: &SaveValue) -> Option<Self> {
        match value {
            SaveValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromSaveValue for i64 {
    const KIND: &'static str = "int";

    fn from_save_value(value: &SaveValue) -> Option<Self> {
        match value {
            SaveValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromSaveValue for f64 {
    const KIND: &'static str = "float";

    fn from_save_value(value: &SaveValue) -> Option<Self> {
        match value {
            SaveValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromSaveValue for String {
    const KIND: &'static str = "string";

    fn from_save_value(value: &SaveValue) -> Option<Self> {
        match value {
            SaveValue::Str(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// One (narrative node, entry variable state) pair in the history tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Where this record lives in the log.
    pub offset: Offset,

    /// Narrative node name.
    pub name: String,

    /// Hash of the variable bindings on entry.
    pub variables_hash: u64,

    /// Non-owning back-reference; `NONE` at root level.
    pub parent: Offset,

    /// First child, head of the children's sibling list.
    pub child: Offset,

    /// Next sibling under the same parent.
    pub sibling: Offset,

    /// First dialogue index covered by this visit.
    pub begin_dialogue: u32,

    /// One past the last dialogue index covered so far.
    pub end_dialogue: u32,

    /// Offset of the last checkpoint saved within this node.
    pub last_checkpoint: Offset,
}

impl LogRecord for NodeRecord {
    const KIND: RecordKind = RecordKind::Node;

    // child, sibling, last_checkpoint and end_dialogue can each grow from
    // their one-byte MessagePack zero encoding.
    const RESERVE: u32 = 32;
}

/// Fixed-size marker written immediately before a checkpoint payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointIndex {
    pub dialogue_index: u32,
}

impl LogRecord for CheckpointIndex {
    const KIND: RecordKind = RecordKind::CheckpointIndex;
}

/// Fact: dialogue `dialogue_index` of node `node_name` was shown.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReachedDialogueData {
    pub node_name: String,
    pub dialogue_index: u32,

    /// Hash of the text that was shown, compared by the script differ.
    pub text_hash: u64,
}

impl ReachedDialogueData {
    pub fn new(node_name: impl Into<String>, dialogue_index: u32, text_hash: u64) -> Self {
        Self {
            node_name: node_name.into(),
            dialogue_index,
            text_hash,
        }
    }
}

impl LogRecord for ReachedDialogueData {
    const KIND: RecordKind = RecordKind::ReachedDialogue;
}

/// Fact: an ending was reached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReachedEndData {
    pub name: String,
}

impl LogRecord for ReachedEndData {
    const KIND: RecordKind = RecordKind::ReachedEnd;
}

/// Contract for UI/scene objects that survive a save: each hands the
/// checkpoint an opaque blob and gets the same blob back on restore.
pub trait Restorable {
    /// Unique key of this object within a checkpoint.
    fn restore_key(&self) -> &str;

    fn capture(&self) -> serde_json::Value;

    fn restore(&mut self, blob: &serde_json::Value) -> Result<()>;
}

/// Full snapshot of mutable game state at a dialogue point.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GameStateCheckpoint {
    pub node_name: String,
    pub dialogue_index: u32,
    pub variables: BTreeMap<String, SaveValue>,

    /// Restore blobs keyed by [`Restorable::restore_key`].
    pub restore_data: BTreeMap<String, serde_json::Value>,
}

impl GameStateCheckpoint {
    pub fn new(node_name: impl Into<String>, dialogue_index: u32) -> Self {
        Self {
            node_name: node_name.into(),
            dialogue_index,
            ..Default::default()
        }
    }

    /// Record the blobs of every given object.
    pub fn capture_from<'a>(&mut self, objects: impl IntoIterator<Item = &'a dyn Restorable>) {
        for object in objects {
            self.restore_data
                .insert(object.restore_key().to_string(), object.capture());
        }
    }

    /// Hand an object its blob back. Returns `false` if this checkpoint holds
    /// nothing for it.
    pub fn restore_into(&self, object: &mut dyn Restorable) -> Result<bool> {
        match self.restore_data.get(object.restore_key()) {
            Some(blob) => {
                object.restore(blob)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl LogRecord for GameStateCheckpoint {
    const KIND: RecordKind = RecordKind::CheckpointPayload;
}

/// RGBA8 screenshot embedded in a bookmark.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screenshot {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl Screenshot {
    /// Owned copy holding exactly `width * height` pixels.
    pub fn normalized(&self) -> Result<Screenshot> {
        let expected = self.width as usize * self.height as usize * 4;
        if self.rgba.len() < expected {
            return Err(SaveError::InvalidOperation(format!(
                "Screenshot {}x{} needs {} bytes, got {}",
                self.width,
                self.height,
                expected,
                self.rgba.len()
            )));
        }
        Ok(Screenshot {
            width: self.width,
            height: self.height,
            rgba: self.rgba[..expected].to_vec(),
        })
    }
}

/// Content of a bookmark slot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bookmark {
    /// Save family this bookmark belongs to; stamped on save.
    pub save_id: Option<SaveId>,

    /// Node the player was in.
    pub node: Offset,

    /// Checkpoint reference into the log.
    pub checkpoint_ref: Offset,

    /// Copy of the checkpoint payload.
    pub checkpoint: GameStateCheckpoint,

    pub screenshot: Option<Screenshot>,

    pub description: String,

    pub created: Timestamp,
}

impl Bookmark {
    pub fn new(node: Offset, checkpoint_ref: Offset, checkpoint: GameStateCheckpoint) -> Self {
        Self {
            save_id: None,
            node,
            checkpoint_ref,
            checkpoint,
            screenshot: None,
            description: String::new(),
            created: Timestamp::now(),
        }
    }

    pub fn with_screenshot(mut self, screenshot: Screenshot) -> Self {
        self.screenshot = Some(screenshot);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Save log statistics.
#[derive(Clone, Debug, Default)]
pub struct SaveStats {
    pub log_size_bytes: u64,
    pub checkpoint_region_bytes: u64,
    pub reached_region_bytes: u64,
    pub reached_node_count: u64,
    pub reached_dialogue_count: u64,
    pub ending_count: u64,
    pub bookmark_count: u64,
    pub cached_bookmark_count: u64,
}
