//! Reached dialogue and ending facts.
//!
//! Facts are appended to the reached region once and replayed into memory
//! when the save family is opened.

mod index;

pub use index::ReachedIndex;
