//! Test-side journal image builder.
//!
//! Recovery is the only production surface; tests assemble the byte
//! images they feed it here.

use std::path::Path;

use meridian_journal::format::{
    FileHeader, JEntry, JObjAppend, SectionFooter, SectionHeader, ALIGNMENT, OPCODE_DB_CONTEXT,
    OPCODE_DROP_DB, OPCODE_FILE_CREATED, OPCODE_FOOTER, OPCODE_OBJ_APPEND,
};

pub struct JournalBuilder {
    bytes: Vec<u8>,
    section_start: Option<usize>,
}

impl JournalBuilder {
    pub fn new() -> Self {
        JournalBuilder {
            bytes: FileHeader::new().to_block(),
            section_start: None,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn begin_section(&mut self, seq: u64) -> &mut Self {
        assert!(self.section_start.is_none(), "section already open");
        assert_eq!(self.bytes.len() % ALIGNMENT, 0);
        self.section_start = Some(self.bytes.len());
        let header = SectionHeader {
            seq,
            len: 0,
            reserved: 0,
        };
        self.bytes.extend_from_slice(&header.to_bytes());
        self
    }

    pub fn db_context(&mut self, name: &str) -> &mut Self {
        self.bytes.extend_from_slice(&OPCODE_DB_CONTEXT.to_le_bytes());
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        self
    }

    pub fn basic(&mut self, file_no: i32, ofs: u32, data: &[u8]) -> &mut Self {
        self.push_basic(file_no, ofs, data, false)
    }

    pub fn basic_local(&mut self, file_no: i32, ofs: u32, data: &[u8]) -> &mut Self {
        self.push_basic(file_no, ofs, data, true)
    }

    fn push_basic(&mut self, file_no: i32, ofs: u32, data: &[u8], local: bool) -> &mut Self {
        let entry = JEntry::new(data.len() as u32, ofs, file_no, local);
        self.bytes.extend_from_slice(&entry.to_bytes());
        self.bytes.extend_from_slice(data);
        self
    }

    pub fn obj_append(
        &mut self,
        dst_file_no: i32,
        dst_ofs: u32,
        src_file_no: i32,
        src_ofs: u32,
        len: u32,
    ) -> &mut Self {
        self.bytes.extend_from_slice(&OPCODE_OBJ_APPEND.to_le_bytes());
        let append = JObjAppend {
            dst_file_no,
            dst_ofs,
            src_file_no,
            src_ofs,
            len,
        };
        self.bytes.extend_from_slice(&append.to_bytes());
        self
    }

    pub fn file_created(&mut self, db: &str, file_no: i32, len: u64) -> &mut Self {
        self.bytes.extend_from_slice(&OPCODE_FILE_CREATED.to_le_bytes());
        self.bytes.extend_from_slice(&(file_no as u32).to_le_bytes());
        self.bytes.extend_from_slice(&len.to_le_bytes());
        self.bytes.extend_from_slice(db.as_bytes());
        self.bytes.push(0);
        self
    }

    pub fn drop_db(&mut self, db: &str) -> &mut Self {
        self.bytes.extend_from_slice(&OPCODE_DROP_DB.to_le_bytes());
        self.bytes.extend_from_slice(db.as_bytes());
        self.bytes.push(0);
        self
    }

    pub fn end_section(&mut self) -> &mut Self {
        let start = self.section_start.take().expect("no open section");
        self.bytes.extend_from_slice(&OPCODE_FOOTER.to_le_bytes());

        let hash = SectionFooter::digest(&self.bytes[start..]);
        self.bytes.extend_from_slice(&hash);

        let padded = (self.bytes.len() + ALIGNMENT - 1) / ALIGNMENT * ALIGNMENT;
        self.bytes.resize(padded, 0);
        self
    }

    pub fn bytes(&self) -> &[u8] {
        assert!(self.section_start.is_none(), "section left open");
        &self.bytes
    }

    pub fn write(&self, path: &Path) {
        std::fs::write(path, self.bytes()).unwrap();
    }
}

/// Creates a zero-filled data file.
pub fn make_data_file(dir: &Path, name: &str, len: usize) {
    std::fs::write(dir.join(name), vec![0u8; len]).unwrap();
}
