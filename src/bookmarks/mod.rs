//! Bookmark slots.
//!
//! Each slot is an independent `sav###.<ext>` file next to the log. Slot ids
//! are discovered from file names alone.

mod storage;

pub use storage::{BookmarkStore, SlotOrder};
