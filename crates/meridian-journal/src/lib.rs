//! Write-ahead journal recovery for Meridian.
//!
//! Reconstructs the on-disk state of memory-mapped data files by
//! replaying journal sections in order, verifying each section's
//! digest along the way. Only recovery lives here; journal production
//! is the write path's concern.

pub mod buf;
pub mod dir;
pub mod format;
pub mod ops;
pub mod reader;
pub mod replay;

pub use dir::JournalDir;
pub use ops::DurOp;
pub use reader::{EntryKind, JournalIterator, ParsedEntry};
pub use replay::{recover, RecoveryJob, RecoveryReport};
