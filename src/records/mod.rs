//! Record store implementation.
//!
//! Records are stored in a single append-only file. Each record carries a
//! prefix describing its own size, so the log is walked without an index.

mod log;

pub use log::{LogRecord, RecordIterator, RecordKind, RecordPrefix, RecordStore, RECORD_HEADER_SIZE};
