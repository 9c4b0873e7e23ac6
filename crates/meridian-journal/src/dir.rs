//! Journal directory discovery.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use meridian_common::{MeridianError, Result};

/// The ordered set of journal files in a directory.
///
/// Files are named `j._<seq>` and must form a contiguous run; a gap
/// means a file went missing and replay would corrupt the data files.
#[derive(Debug)]
pub struct JournalDir {
    files: Vec<(u32, PathBuf)>,
}

impl JournalDir {
    /// Scans a directory, keeping only journal files, ordered by
    /// sequence number.
    pub fn scan(dir: &Path) -> Result<Self> {
        let mut by_seq: BTreeMap<u32, PathBuf> = BTreeMap::new();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(suffix) = name.strip_prefix("j._") else {
                continue;
            };
            let seq: u32 = suffix.parse().map_err(|_| {
                MeridianError::JournalDirectory(format!(
                    "unexpected file in journal directory {} : {}",
                    dir.display(),
                    name
                ))
            })?;
            if by_seq.insert(seq, entry.path()).is_some() {
                return Err(MeridianError::JournalDirectory(format!(
                    "unexpected files in journal directory {} : {}",
                    dir.display(),
                    name
                )));
            }
        }

        if let Some((&first, _)) = by_seq.iter().next() {
            for (i, (&seq, path)) in by_seq.iter().enumerate() {
                if seq != first + i as u32 {
                    return Err(MeridianError::JournalDirectory(format!(
                        "unexpected file in journal directory {} : {} : can't find its preceding file",
                        dir.display(),
                        path.display()
                    )));
                }
            }
        }

        Ok(JournalDir {
            files: by_seq.into_iter().collect(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// (sequence, path) pairs in replay order.
    pub fn files(&self) -> &[(u32, PathBuf)] {
        &self.files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"x").unwrap();
    }

    #[test]
    fn test_scan_empty_dir() {
        let dir = tempdir().unwrap();
        let journal = JournalDir::scan(dir.path()).unwrap();
        assert!(journal.is_empty());
    }

    #[test]
    fn test_scan_orders_by_sequence() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "j._2");
        touch(dir.path(), "j._0");
        touch(dir.path(), "j._1");
        touch(dir.path(), "unrelated.txt");

        let journal = JournalDir::scan(dir.path()).unwrap();
        assert_eq!(journal.len(), 3);
        let seqs: Vec<u32> = journal.files().iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_scan_accepts_nonzero_base() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "j._5");
        touch(dir.path(), "j._6");
        let journal = JournalDir::scan(dir.path()).unwrap();
        assert_eq!(journal.len(), 2);
    }

    #[test]
    fn test_scan_rejects_gaps() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "j._0");
        touch(dir.path(), "j._2");

        let err = JournalDir::scan(dir.path()).unwrap_err();
        assert!(err.to_string().contains("can't find its preceding file"));
    }

    #[test]
    fn test_scan_rejects_garbage_suffix() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "j._zero");
        let err = JournalDir::scan(dir.path()).unwrap_err();
        assert!(err.to_string().contains("unexpected file"));
    }
}
