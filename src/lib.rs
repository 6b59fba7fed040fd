//! # Storyline
//!
//! Save persistence for a branching narrative runtime: one append-only log
//! per save family, plus one file per bookmark slot.
//!
//! ## Core Concepts
//!
//! - **Records**: Self-describing log entries addressed by byte offset
//! - **Header**: Save family id, region pointers, node hashes and user data
//! - **Node tree**: Deduplicated history of visited nodes with checkpoints
//! - **Reached index**: Every dialogue line and ending ever shown
//! - **Bookmarks**: Slot files tied to the save family that wrote them
//!
//! ## Example
//!
//! ```ignore
//! use storyline::{Bookmark, GameStateCheckpoint, ReachedDialogueData, SaveConfig, SaveStore};
//!
//! let mut store = SaveStore::open_or_reset(SaveConfig::new("./saves"))?;
//!
//! // Enter a node and checkpoint it
//! let start = store.get_or_create_child(None, "start", vars_hash, 0)?;
//! let checkpoint = GameStateCheckpoint::new("start", 0);
//! let reference = store.save_checkpoint(start.offset, &checkpoint)?;
//!
//! // Remember what the player has read
//! store.set_reached(ReachedDialogueData::new("start", 0, text_hash))?;
//!
//! // Save to slot 1
//! store.save_bookmark(1, &Bookmark::new(start.offset, reference, checkpoint))?;
//!
//! store.close()?;
//! ```

pub mod bookmarks;
pub mod differ;
pub mod error;
pub mod header;
pub mod reached;
pub mod records;
pub mod store;
pub mod tree;
pub mod types;

// Re-exports
pub use bookmarks::{BookmarkStore, SlotOrder};
pub use differ::{DialogueEdit, NodeChange, ScriptNode};
pub use error::{Result, SaveError};
pub use header::{Region, SaveHeader};
pub use reached::ReachedIndex;
pub use records::{LogRecord, RecordKind, RecordStore};
pub use store::{SaveConfig, SaveStore};
pub use tree::NodeTree;
pub use types::{
    Bookmark, CheckpointIndex, ContentHash, FromSaveValue, GameStateCheckpoint, NodeRecord,
    Offset, ReachedDialogueData, ReachedEndData, Restorable, SaveId, SaveStats, SaveValue,
    Screenshot, SlotId, Timestamp,
};
