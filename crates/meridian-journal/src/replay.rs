//! Crash recovery by journal replay.
//!
//! Runs synchronously at startup with exclusive ownership of the data
//! directory: each journal file is mapped read-only, its sections are
//! parsed and verified, and the entries of each section are applied to
//! the memory-mapped data files in order. An abrupt end (a section torn
//! by the crash itself) is legitimate only in the last journal file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};
use tracing::{info, warn};

use meridian_common::{MeridianError, RecoveryOptions, Result};

use crate::dir::JournalDir;
use crate::format::{data_file_name, DOC_TERMINATOR, ELEMENT_NAME, ELEMENT_OBJECT};
use crate::reader::{EntryKind, IterError, JournalIterator, ParsedEntry};

/// Outcome of a recovery run.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub journal_files: usize,
    pub sections: u64,
    pub entries_applied: u64,
    /// The last file ended mid-section (torn by the crash).
    pub abrupt_end: bool,
    /// Journal files were replayed, flushed, and removed; the
    /// durability subsystem may reuse the directory.
    pub clean: bool,
}

/// Recovers the data files under `dbpath` from the journal files in
/// `journal_dir`.
///
/// With `scan_only` set, the journal is parsed and verified but no
/// data file is touched and no journal file is removed; the report
/// then comes back with `clean` unset.
pub fn recover(dbpath: &Path, journal_dir: &Path, options: RecoveryOptions) -> Result<RecoveryReport> {
    if !journal_dir.exists() {
        info!(dir = %journal_dir.display(), "journal directory does not exist, no recovery needed");
        return Ok(RecoveryReport {
            clean: true,
            ..RecoveryReport::default()
        });
    }

    let dir = JournalDir::scan(journal_dir)?;
    if dir.is_empty() {
        info!("recover : no journal files present, no recovery needed");
        return Ok(RecoveryReport {
            clean: true,
            ..RecoveryReport::default()
        });
    }

    let mut job = RecoveryJob::new(dbpath.to_path_buf(), options);
    job.go(&dir)
}

/// The open-file table and application logic for one recovery run.
pub struct RecoveryJob {
    dbpath: PathBuf,
    options: RecoveryOptions,
    files: HashMap<(i32, String), MmapMut>,
    sections: u64,
    entries_applied: u64,
}

impl RecoveryJob {
    pub fn new(dbpath: PathBuf, options: RecoveryOptions) -> Self {
        RecoveryJob {
            dbpath,
            options,
            files: HashMap::new(),
            sections: 0,
            entries_applied: 0,
        }
    }

    /// Replays every journal file in order, then flushes, cleans up,
    /// and reports.
    pub fn go(&mut self, dir: &JournalDir) -> Result<RecoveryReport> {
        info!("recover begin");

        let files = dir.files();
        let mut abrupt_end = false;
        for (i, (_, path)) in files.iter().enumerate() {
            let is_last = i + 1 == files.len();
            abrupt_end |= self.process_file(path, is_last)?;
        }

        self.flush_all_and_close()?;

        if self.options.scan_only {
            info!("recover : scan only, journal files left in place");
            return Ok(self.report(files.len(), abrupt_end, false));
        }

        info!("recover cleaning up");
        for (_, path) in files {
            std::fs::remove_file(path)?;
        }
        info!("recover done");

        Ok(self.report(files.len(), abrupt_end, true))
    }

    fn report(&self, journal_files: usize, abrupt_end: bool, clean: bool) -> RecoveryReport {
        RecoveryReport {
            journal_files,
            sections: self.sections,
            entries_applied: self.entries_applied,
            abrupt_end,
            clean,
        }
    }

    /// Maps and replays one journal file. Returns true when the file
    /// ended abruptly (only tolerated on the last file).
    fn process_file(&mut self, path: &Path, is_last: bool) -> Result<bool> {
        info!(file = %path.display(), "recover");

        let file = std::fs::File::open(path).map_err(|e| {
            MeridianError::RecoveryFailed(format!(
                "recover error couldn't open {}: {}",
                path.display(),
                e
            ))
        })?;
        // Safety: recovery owns the directory exclusively; nothing
        // else mutates the journal file while it is mapped.
        let mapping = unsafe { Mmap::map(&file)? };

        let label = path.display().to_string();
        self.process_buffer(&mapping, &label, is_last)
    }

    /// Parses and applies one mapped journal file, one section at a
    /// time. Entries of a torn final section are discarded, never
    /// partially applied.
    fn process_buffer(&mut self, data: &[u8], file_label: &str, is_last: bool) -> Result<bool> {
        let mut iter = match JournalIterator::new(data) {
            Ok(iter) => iter,
            Err(err) => return self.tolerate(err, file_label, is_last),
        };

        loop {
            let mut entries: Vec<ParsedEntry> = Vec::new();
            loop {
                match iter.next() {
                    Ok(Some(entry)) => entries.push(entry),
                    Ok(None) => break,
                    Err(err) => return self.tolerate(err, file_label, is_last),
                }
            }

            // One full group-commit section is in hand; apply it.
            self.apply_entries(iter.section_seq(), &entries)?;
            self.sections += 1;

            if iter.at_eof() {
                break;
            }
        }

        Ok(false)
    }

    /// Maps a parse failure to the recovery policy: a torn structure
    /// or bad section digest in the last file is the crash's own
    /// half-written tail; anywhere else it is fatal.
    fn tolerate(&self, err: IterError, file_label: &str, is_last: bool) -> Result<bool> {
        match err {
            IterError::Eof => {
                if is_last {
                    if self.options.dump_journal {
                        info!("ABRUPT END");
                    }
                    Ok(true)
                } else {
                    Err(MeridianError::AbruptEnd {
                        file: file_label.to_string(),
                    })
                }
            }
            IterError::BadChecksum { recorded, actual } => {
                if is_last {
                    warn!(file = file_label, "section checksum mismatch at journal end");
                    Ok(true)
                } else {
                    Err(MeridianError::ChecksumMismatch { recorded, actual })
                }
            }
            IterError::Corrupt(reason) => Err(MeridianError::JournalCorrupted {
                file: file_label.to_string(),
                reason,
            }),
        }
    }

    fn apply_entries(&mut self, seq: u64, entries: &[ParsedEntry]) -> Result<()> {
        let dump = self.options.dump_journal;
        if dump {
            info!(seq, "BEGIN section");
        }
        for entry in entries {
            self.apply_entry(entry)?;
        }
        if dump {
            info!(seq, "END section");
        }
        Ok(())
    }

    fn apply_entry(&mut self, entry: &ParsedEntry) -> Result<()> {
        let apply = !self.options.scan_only;
        let dump = self.options.dump_journal;

        match &entry.kind {
            EntryKind::Basic { entry: e, data } => {
                let db = entry.db_name.unwrap_or_default();
                if dump {
                    info!(
                        file = %data_file_name(db, e.file_no()),
                        ofs = e.ofs,
                        len = e.len,
                        "BASICWRITE"
                    );
                }
                if apply {
                    let ofs = e.ofs as usize;
                    let map = self.mapped(db, e.file_no())?;
                    if ofs + data.len() > map.len() {
                        return Err(MeridianError::RecoveryFailed(format!(
                            "write past end of {} (ofs {} len {})",
                            data_file_name(db, e.file_no()),
                            ofs,
                            data.len()
                        )));
                    }
                    map[ofs..ofs + data.len()].copy_from_slice(data);
                    self.entries_applied += 1;
                }
            }

            EntryKind::ObjAppend(a) => {
                let db = entry.db_name.unwrap_or_default();
                if dump {
                    info!(
                        dst = %data_file_name("local", a.dst_file_no),
                        dst_ofs = a.dst_ofs,
                        src = %data_file_name(db, a.src_file_no),
                        src_ofs = a.src_ofs,
                        len = a.len,
                        "OBJAPPEND"
                    );
                }
                if apply {
                    let len = a.len as usize;
                    let src_ofs = a.src_ofs as usize;
                    let src = self.mapped(db, a.src_file_no)?;
                    if src_ofs + len > src.len() {
                        return Err(MeridianError::RecoveryFailed(format!(
                            "object append reads past end of {}",
                            data_file_name(db, a.src_file_no)
                        )));
                    }
                    let bytes = src[src_ofs..src_ofs + len].to_vec();

                    let dst_ofs = a.dst_ofs as usize;
                    let dst = self.mapped("local", a.dst_file_no)?;
                    if dst_ofs < 3 || dst_ofs + len + 1 > dst.len() {
                        return Err(MeridianError::RecoveryFailed(format!(
                            "object append writes past end of {}",
                            data_file_name("local", a.dst_file_no)
                        )));
                    }

                    dst[dst_ofs..dst_ofs + len].copy_from_slice(&bytes);
                    // Frame the copied object as an embedded element:
                    // { ..., o: <copied obj>, ..., <end> }
                    dst[dst_ofs - 3] = ELEMENT_OBJECT;
                    dst[dst_ofs - 2] = ELEMENT_NAME;
                    dst[dst_ofs - 1] = 0;
                    dst[dst_ofs + len] = DOC_TERMINATOR;
                    self.entries_applied += 1;
                }
            }

            EntryKind::Op(op) => {
                if dump {
                    info!(op = %op.describe(), "OP");
                }
                if apply {
                    if op.needs_files_closed() {
                        self.flush_all_and_close()?;
                    }
                    op.replay(&self.dbpath)?;
                    self.entries_applied += 1;
                }
            }
        }

        Ok(())
    }

    /// The mapping for a database file, opening it on first touch.
    fn mapped(&mut self, db: &str, file_no: i32) -> Result<&mut MmapMut> {
        use std::collections::hash_map::Entry;

        match self.files.entry((file_no, db.to_string())) {
            Entry::Occupied(slot) => Ok(slot.into_mut()),
            Entry::Vacant(slot) => {
                let name = data_file_name(db, file_no);
                let path = self.dbpath.join(&name);
                let file = std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .map_err(|e| {
                        MeridianError::RecoveryFailed(format!(
                            "recovery error couldn't open {}: {}",
                            name, e
                        ))
                    })?;
                let len = file.metadata()?.len();
                if len == 0 {
                    return Err(MeridianError::RecoveryFailed(format!(
                        "recovery error file has length zero {}",
                        name
                    )));
                }
                if self.options.dump_journal {
                    info!(file = %name, mb = len as f64 / 1024.0 / 1024.0, "opened");
                }
                // Safety: exclusive ownership of the data directory
                // for the duration of recovery.
                let map = unsafe { MmapMut::map_mut(&file)? };
                Ok(slot.insert(map))
            }
        }
    }

    /// Flushes every mapping and drops the open-file table.
    pub fn flush_all_and_close(&mut self) -> Result<()> {
        info!("recover flush");
        for map in self.files.values() {
            map.flush()?;
        }
        info!("recover close");
        self.files.clear();
        Ok(())
    }
}
