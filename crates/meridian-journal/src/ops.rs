//! Non-write journal operations.
//!
//! Basic writes and object appends patch mapped bytes; these
//! operations act on the file set itself and replay through their own
//! logic. The set is closed: an opcode outside it is corruption.

use std::path::Path;

use tracing::info;

use meridian_common::Result;

use crate::format::data_file_name;

/// A durable file-level operation recovered from the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurOp {
    /// A data file came into existence with the given length.
    FileCreated { db: String, file_no: i32, len: u64 },
    /// A whole database was dropped.
    DropDb { db: String },
}

impl DurOp {
    /// Whether the replay engine must flush and close its mappings
    /// before this operation runs.
    pub fn needs_files_closed(&self) -> bool {
        matches!(self, DurOp::DropDb { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            DurOp::FileCreated { db, file_no, len } => {
                format!("FileCreated {} len:{}", data_file_name(db, *file_no), len)
            }
            DurOp::DropDb { db } => format!("DropDb {}", db),
        }
    }

    /// Applies the operation to the data directory.
    pub fn replay(&self, dbpath: &Path) -> Result<()> {
        match self {
            DurOp::FileCreated { db, file_no, len } => {
                let path = dbpath.join(data_file_name(db, *file_no));
                info!(path = %path.display(), len, "recover create file");
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .read(true)
                    .write(true)
                    .truncate(false)
                    .open(&path)?;
                if file.metadata()?.len() < *len {
                    file.set_len(*len)?;
                }
                Ok(())
            }
            DurOp::DropDb { db } => {
                info!(db = %db, "recover drop db");
                for entry in std::fs::read_dir(dbpath)? {
                    let entry = entry?;
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if belongs_to_db(&name, db) {
                        std::fs::remove_file(entry.path())?;
                    }
                }
                Ok(())
            }
        }
    }
}

/// Whether a data-directory filename belongs to the database: its
/// `.ns` file or a numbered extent file.
fn belongs_to_db(file_name: &str, db: &str) -> bool {
    let Some(suffix) = file_name.strip_prefix(db) else {
        return false;
    };
    let Some(ext) = suffix.strip_prefix('.') else {
        return false;
    };
    ext == "ns" || (!ext.is_empty() && ext.bytes().all(|b| b.is_ascii_digit()))
}
