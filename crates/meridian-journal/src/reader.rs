//! Section and entry parsing over a mapped journal file.
//!
//! The iterator yields one resolved entry at a time and returns
//! end-of-section after verifying the footer digest. The only state it
//! carries between entries is the current database context, which
//! resets at section boundaries.

use crate::buf::{BufReader, Eof};
use crate::format::{
    FileHeader, JEntry, JObjAppend, SectionFooter, SectionHeader, ALIGNMENT, FILE_HEADER_SIZE,
    MAGIC, MAX_NS_LEN, OPCODE_DB_CONTEXT, OPCODE_DROP_DB, OPCODE_FILE_CREATED, OPCODE_FOOTER,
    OPCODE_MIN, OPCODE_OBJ_APPEND, VERSION,
};
use crate::ops::DurOp;

/// Parse failure inside a journal file.
#[derive(Debug)]
pub enum IterError {
    /// The mapping ended mid-structure (a torn final write, or a
    /// damaged earlier file).
    Eof,
    /// Structural corruption; never tolerable.
    Corrupt(String),
    /// The footer digest did not cover the section bytes.
    BadChecksum { recorded: String, actual: String },
}

impl From<Eof> for IterError {
    fn from(_: Eof) -> Self {
        IterError::Eof
    }
}

type IterResult<T> = std::result::Result<T, IterError>;

/// One fully resolved journal entry.
///
/// Slices borrow from the journal mapping; the entry must be applied
/// before the mapping is released.
#[derive(Debug)]
pub struct ParsedEntry<'a> {
    /// Database the entry touches. Always present for data-touching
    /// entries; file-level operations carry their own name.
    pub db_name: Option<&'a str>,
    pub kind: EntryKind<'a>,
}

#[derive(Debug)]
pub enum EntryKind<'a> {
    Basic { entry: JEntry, data: &'a [u8] },
    ObjAppend(JObjAppend),
    Op(DurOp),
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Reads through the memory-mapped contents of one journal file.
pub struct JournalIterator<'a> {
    br: BufReader<'a>,
    section_start: Option<usize>,
    section_seq: u64,
    last_db_name: Option<&'a str>,
}

impl<'a> JournalIterator<'a> {
    /// Validates the file header and positions at the first section.
    pub fn new(data: &'a [u8]) -> IterResult<Self> {
        let mut br = BufReader::new(data);

        let raw = br.read_bytes(FileHeader::FIXED_SIZE)?;
        let header = FileHeader::from_bytes(raw)
            .ok_or_else(|| IterError::Corrupt("journal header invalid".to_string()))?;

        if header.magic != MAGIC {
            return Err(IterError::Corrupt("journal header invalid".to_string()));
        }
        if header.version != VERSION {
            return Err(IterError::Corrupt(format!(
                "journal version number mismatch {}",
                header.version
            )));
        }
        if !header.checksum_ok() {
            return Err(IterError::Corrupt(
                "journal header checksum mismatch".to_string(),
            ));
        }

        br.rewind(FileHeader::FIXED_SIZE);
        br.skip(FILE_HEADER_SIZE)?;

        Ok(JournalIterator {
            br,
            section_start: None,
            section_seq: 0,
            last_db_name: None,
        })
    }

    pub fn at_eof(&self) -> bool {
        self.br.at_eof()
    }

    /// Sequence number of the section currently being read.
    pub fn section_seq(&self) -> u64 {
        self.section_seq
    }

    /// Next entry of the current section, or `Ok(None)` at a verified
    /// section end.
    pub fn next(&mut self) -> IterResult<Option<ParsedEntry<'a>>> {
        if self.section_start.is_none() {
            let start = self.br.offset();
            let raw = self.br.read_bytes(SectionHeader::SIZE)?;
            if let Some(header) = SectionHeader::from_bytes(raw) {
                self.section_seq = header.seq;
            }
            self.section_start = Some(start);
            self.last_db_name = None;
        }

        let mut len_or_opcode = self.br.read_u32()?;

        match len_or_opcode {
            OPCODE_FOOTER => {
                let hash_at = self.br.offset();
                let recorded = self.br.read_bytes(16)?;

                let start = self.section_start.take().unwrap_or(0);
                let actual = SectionFooter::digest(&self.br.bytes()[start..hash_at]);
                if recorded != actual {
                    return Err(IterError::BadChecksum {
                        recorded: hex(recorded),
                        actual: hex(&actual),
                    });
                }

                self.br.align(ALIGNMENT)?;
                return Ok(None);
            }

            OPCODE_FILE_CREATED | OPCODE_DROP_DB => {
                let op = self.read_op(len_or_opcode)?;
                return Ok(Some(ParsedEntry {
                    db_name: None,
                    kind: EntryKind::Op(op),
                }));
            }

            OPCODE_DB_CONTEXT => {
                self.last_db_name = Some(self.read_cstr()?);
                // A data entry always follows a context change; there
                // is nothing to hand back yet.
                len_or_opcode = self.br.read_u32()?;
            }

            _ => {}
        }

        if len_or_opcode == OPCODE_OBJ_APPEND {
            let raw = self.br.read_bytes(JObjAppend::SIZE)?;
            let append = JObjAppend::from_bytes(raw)
                .ok_or_else(|| IterError::Corrupt("short object append entry".to_string()))?;
            let db_name = self.require_db_context()?;
            return Ok(Some(ParsedEntry {
                db_name: Some(db_name),
                kind: EntryKind::ObjAppend(append),
            }));
        }

        if len_or_opcode == 0 {
            return Err(IterError::Corrupt("zero-length journal entry".to_string()));
        }
        if len_or_opcode >= OPCODE_MIN {
            return Err(IterError::Corrupt(format!(
                "unknown journal opcode {:#010x}",
                len_or_opcode
            )));
        }

        // A basic write: the length word read above is the leading
        // field of the entry struct itself.
        let ofs = self.br.read_u32()?;
        let file_no_raw = self.br.read_u32()?;
        let entry = JEntry::from_fields(len_or_opcode, ofs, file_no_raw);
        let data = self.br.read_bytes(entry.len as usize)?;

        let db_name = if entry.is_local_db_context() {
            "local"
        } else {
            self.require_db_context()?
        };

        Ok(Some(ParsedEntry {
            db_name: Some(db_name),
            kind: EntryKind::Basic { entry, data },
        }))
    }

    fn require_db_context(&self) -> IterResult<&'a str> {
        self.last_db_name
            .ok_or_else(|| IterError::Corrupt("journal entry has no database context".to_string()))
    }

    /// NUL-terminated name, bounded by the namespace length limit.
    fn read_cstr(&mut self) -> IterResult<&'a str> {
        let limit = MAX_NS_LEN.min(self.br.remaining());
        let window = self.br.read_bytes(limit)?;
        self.br.rewind(limit);

        let len = window
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| {
                IterError::Corrupt("problem processing journal file during recovery".to_string())
            })?;

        let name = std::str::from_utf8(&window[..len])
            .map_err(|_| IterError::Corrupt("database name is not valid UTF-8".to_string()))?;
        self.br.skip(len + 1)?;
        Ok(name)
    }

    fn read_op(&mut self, opcode: u32) -> IterResult<DurOp> {
        match opcode {
            OPCODE_FILE_CREATED => {
                let file_no = self.br.read_u32()? as i32;
                let len = self.br.read_u64()?;
                let db = self.read_cstr()?.to_string();
                Ok(DurOp::FileCreated { db, file_no, len })
            }
            OPCODE_DROP_DB => {
                let db = self.read_cstr()?.to_string();
                Ok(DurOp::DropDb { db })
            }
            _ => Err(IterError::Corrupt(format!(
                "unknown journal opcode {:#010x}",
                opcode
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FileHeader;

    /// Assembles a minimal journal image: header block plus sections.
    fn journal(sections: &[Vec<u8>]) -> Vec<u8> {
        let mut out = FileHeader::new().to_block();
        for body in sections {
            let start = out.len();
            assert_eq!(start % ALIGNMENT, 0);

            let header = SectionHeader {
                seq: 1,
                len: 0,
                reserved: 0,
            };
            out.extend_from_slice(&header.to_bytes());
            out.extend_from_slice(body);
            out.extend_from_slice(&OPCODE_FOOTER.to_le_bytes());

            let hash = SectionFooter::digest(&out[start..]);
            out.extend_from_slice(&hash);

            let padded = out.len().div_ceil(ALIGNMENT) * ALIGNMENT;
            out.resize(padded, 0);
        }
        out
    }

    fn db_context(name: &str) -> Vec<u8> {
        let mut out = OPCODE_DB_CONTEXT.to_le_bytes().to_vec();
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out
    }

    fn basic(ofs: u32, file_no: i32, local: bool, data: &[u8]) -> Vec<u8> {
        let entry = JEntry::new(data.len() as u32, ofs, file_no, local);
        let mut out = entry.to_bytes().to_vec();
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn test_empty_section() {
        let image = journal(&[vec![]]);
        let mut it = JournalIterator::new(&image).unwrap();
        assert!(it.next().unwrap().is_none());
        assert!(it.at_eof());
    }

    #[test]
    fn test_basic_entry_with_context() {
        let mut body = db_context("test");
        body.extend(basic(64, 0, false, b"hello"));

        let image = journal(&[body]);
        let mut it = JournalIterator::new(&image).unwrap();

        let entry = it.next().unwrap().unwrap();
        assert_eq!(entry.db_name, Some("test"));
        match entry.kind {
            EntryKind::Basic { entry, data } => {
                assert_eq!(entry.ofs, 64);
                assert_eq!(entry.file_no(), 0);
                assert_eq!(data, b"hello");
            }
            other => panic!("unexpected entry: {:?}", other),
        }

        assert!(it.next().unwrap().is_none());
        assert!(it.at_eof());
    }

    #[test]
    fn test_local_flag_overrides_context() {
        let mut body = db_context("test");
        body.extend(basic(0, 1, true, b"x"));

        let image = journal(&[body]);
        let mut it = JournalIterator::new(&image).unwrap();
        let entry = it.next().unwrap().unwrap();
        assert_eq!(entry.db_name, Some("local"));
    }

    #[test]
    fn test_context_resets_between_sections() {
        let mut first = db_context("test");
        first.extend(basic(0, 0, false, b"x"));
        let second = basic(8, 0, false, b"y");

        let image = journal(&[first, second]);
        let mut it = JournalIterator::new(&image).unwrap();

        assert!(it.next().unwrap().is_some());
        assert!(it.next().unwrap().is_none());

        // The second section's entry has no inherited context.
        match it.next() {
            Err(IterError::Corrupt(reason)) => assert!(reason.contains("database context")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let mut body = db_context("test");
        body.extend(basic(0, 0, false, b"x"));
        let mut image = journal(&[body]);

        // Flip one payload byte after the digest was taken.
        let byte = FILE_HEADER_SIZE + SectionHeader::SIZE + 10;
        image[byte] ^= 0xff;

        let mut it = JournalIterator::new(&image).unwrap();
        loop {
            match it.next() {
                Ok(Some(_)) => continue,
                Err(IterError::BadChecksum { recorded, actual }) => {
                    assert_ne!(recorded, actual);
                    break;
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn test_truncated_entry_is_eof() {
        let context = db_context("test");
        let mut body = context.clone();
        body.extend(basic(0, 0, false, b"hello world"));
        let image = journal(&[body]);

        // Cut mid-payload of the basic write.
        let cut = FILE_HEADER_SIZE + SectionHeader::SIZE + context.len() + JEntry::SIZE + 5;
        let mut it = JournalIterator::new(&image[..cut]).unwrap();
        match it.next() {
            Err(IterError::Eof) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unterminated_db_context_is_corrupt() {
        let mut body = OPCODE_DB_CONTEXT.to_le_bytes().to_vec();
        body.extend_from_slice(&[b'a'; MAX_NS_LEN]);
        // No terminator within the limit, and plenty of bytes after.
        body.extend_from_slice(&[b'a'; 64]);
        let image = journal(&[body]);

        let mut it = JournalIterator::new(&image).unwrap();
        match it.next() {
            Err(IterError::Corrupt(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_opcode_is_corrupt() {
        let body = (OPCODE_MIN + 1).to_le_bytes().to_vec();
        let image = journal(&[body]);

        let mut it = JournalIterator::new(&image).unwrap();
        match it.next() {
            Err(IterError::Corrupt(reason)) => assert!(reason.contains("opcode")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut image = journal(&[vec![]]);
        image[0] = b'X';
        match JournalIterator::new(&image) {
            Err(IterError::Corrupt(reason)) => assert!(reason.contains("header invalid")),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut image = journal(&[vec![]]);
        image[4..8].copy_from_slice(&(VERSION + 1).to_le_bytes());

        match JournalIterator::new(&image) {
            Err(IterError::Corrupt(reason)) => assert!(reason.contains("version")),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_file_created_op_roundtrip() {
        let mut body = OPCODE_FILE_CREATED.to_le_bytes().to_vec();
        body.extend_from_slice(&2u32.to_le_bytes());
        body.extend_from_slice(&16384u64.to_le_bytes());
        body.extend_from_slice(b"mydb\0");

        let image = journal(&[body]);
        let mut it = JournalIterator::new(&image).unwrap();
        let entry = it.next().unwrap().unwrap();
        assert!(entry.db_name.is_none());
        match entry.kind {
            EntryKind::Op(DurOp::FileCreated { db, file_no, len }) => {
                assert_eq!(db, "mydb");
                assert_eq!(file_no, 2);
                assert_eq!(len, 16384);
            }
            other => panic!("unexpected entry: {:?}", other),
        }
    }

    #[test]
    fn test_obj_append_requires_context() {
        let append = JObjAppend {
            dst_file_no: 1,
            dst_ofs: 100,
            src_file_no: 0,
            src_ofs: 50,
            len: 10,
        };
        let mut body = OPCODE_OBJ_APPEND.to_le_bytes().to_vec();
        body.extend_from_slice(&append.to_bytes());
        let image = journal(&[body]);

        let mut it = JournalIterator::new(&image).unwrap();
        assert!(matches!(it.next(), Err(IterError::Corrupt(_))));

        let mut body = db_context("src");
        body.extend(OPCODE_OBJ_APPEND.to_le_bytes());
        body.extend(append.to_bytes());
        let image = journal(&[body]);

        let mut it = JournalIterator::new(&image).unwrap();
        let entry = it.next().unwrap().unwrap();
        assert_eq!(entry.db_name, Some("src"));
        assert!(matches!(entry.kind, EntryKind::ObjAppend(a) if a.len == 10));
    }
}
