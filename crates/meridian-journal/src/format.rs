//! Journal on-disk format.
//!
//! A journal file is `j._<seq>`: one header block, then a run of
//! sections, each aligned to [`ALIGNMENT`] at both ends. A section is a
//! fixed header, a stream of entries, and a footer carrying an md5
//! digest over everything from the section start up to (but not
//! including) the digest bytes themselves.
//!
//! Entries begin with a `u32` that is either an opcode from the top of
//! the value space or, for any smaller value, the length of a basic
//! write whose struct starts at that same word.

use bytes::Buf;
use meridian_common::{MeridianError, Result};

/// Section and file-header alignment, a page multiple.
pub const ALIGNMENT: usize = 8192;

/// The file header occupies one full alignment block so the first
/// section starts aligned.
pub const FILE_HEADER_SIZE: usize = ALIGNMENT;

pub const MAGIC: [u8; 4] = *b"MJNL";
pub const VERSION: u32 = 1;

/// Longest database name an entry may carry, terminator included.
pub const MAX_NS_LEN: usize = 128;

// Opcodes live at the top of the u32 space; anything below OPCODE_MIN
// is a basic-write length.
pub const OPCODE_FOOTER: u32 = 0xffff_ffff;
pub const OPCODE_DB_CONTEXT: u32 = 0xffff_fffe;
pub const OPCODE_FILE_CREATED: u32 = 0xffff_fffd;
pub const OPCODE_DROP_DB: u32 = 0xffff_fffc;
pub const OPCODE_OBJ_APPEND: u32 = 0xffff_fffb;
pub const OPCODE_MIN: u32 = 0xffff_f000;

/// `file_no` flag: the entry targets the `local` database regardless
/// of the surrounding context.
pub const LOCAL_DB_BIT: u32 = 0x8000_0000;
/// `file_no` sentinel for the `.ns` namespace file.
pub const DOT_NS_FILE_NO: i32 = 0x7fff_ffff;

// Record framing stamped around an appended object.
pub const ELEMENT_OBJECT: u8 = 0x03;
pub const ELEMENT_NAME: u8 = b'o';
pub const DOC_TERMINATOR: u8 = 0x00;

/// Journal file header (fixed fields; the rest of the block is zero).
///
/// Layout:
/// - magic: 4 bytes
/// - version: 4 bytes
/// - checksum: 4 bytes (CRC32 of magic + version)
#[derive(Debug, Clone, Copy)]
pub struct FileHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub checksum: u32,
}

impl FileHeader {
    /// Size of the fixed fields at the front of the header block.
    pub const FIXED_SIZE: usize = 12;

    pub fn new() -> Self {
        let mut header = FileHeader {
            magic: MAGIC,
            version: VERSION,
            checksum: 0,
        };
        header.checksum = header.compute_checksum();
        header
    }

    fn compute_checksum(&self) -> u32 {
        let mut data = [0u8; 8];
        data[0..4].copy_from_slice(&self.magic);
        data[4..8].copy_from_slice(&self.version.to_le_bytes());
        crc32fast::hash(&data)
    }

    /// Whether the stored checksum covers the fixed fields.
    pub fn checksum_ok(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(MeridianError::RecoveryFailed(
                "journal header invalid".to_string(),
            ));
        }
        if self.version != VERSION {
            return Err(MeridianError::RecoveryFailed(format!(
                "journal version number mismatch {}",
                self.version
            )));
        }
        if self.checksum != self.compute_checksum() {
            return Err(MeridianError::RecoveryFailed(
                "journal header checksum mismatch".to_string(),
            ));
        }
        Ok(())
    }

    /// Serializes the full header block (fixed fields + zero padding).
    pub fn to_block(&self) -> Vec<u8> {
        let mut block = vec![0u8; FILE_HEADER_SIZE];
        block[0..4].copy_from_slice(&self.magic);
        block[4..8].copy_from_slice(&self.version.to_le_bytes());
        block[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        block
    }

    pub fn from_bytes(mut data: &[u8]) -> Option<Self> {
        if data.len() < Self::FIXED_SIZE {
            return None;
        }
        let mut magic = [0u8; 4];
        data.copy_to_slice(&mut magic);
        Some(FileHeader {
            magic,
            version: data.get_u32_le(),
            checksum: data.get_u32_le(),
        })
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Section header at each aligned section start.
///
/// Layout (16 bytes): seq u64, len u32, reserved u32. `len` records
/// the unpadded section length; recovery trusts the footer, not `len`.
#[derive(Debug, Clone, Copy)]
pub struct SectionHeader {
    pub seq: u64,
    pub len: u32,
    pub reserved: u32,
}

impl SectionHeader {
    pub const SIZE: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.seq.to_le_bytes());
        out[8..12].copy_from_slice(&self.len.to_le_bytes());
        out[12..16].copy_from_slice(&self.reserved.to_le_bytes());
        out
    }

    pub fn from_bytes(mut data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(SectionHeader {
            seq: data.get_u64_le(),
            len: data.get_u32_le(),
            reserved: data.get_u32_le(),
        })
    }
}

/// A basic-write entry header. The payload bytes follow it.
///
/// Layout (12 bytes): len u32, ofs u32, file_no u32 (flag bits above).
#[derive(Debug, Clone, Copy)]
pub struct JEntry {
    pub len: u32,
    pub ofs: u32,
    file_no_raw: u32,
}

impl JEntry {
    pub const SIZE: usize = 12;

    pub fn new(len: u32, ofs: u32, file_no: i32, local_db: bool) -> Self {
        let mut raw = (file_no as u32) & !LOCAL_DB_BIT;
        if local_db {
            raw |= LOCAL_DB_BIT;
        }
        JEntry {
            len,
            ofs,
            file_no_raw: raw,
        }
    }

    pub fn from_fields(len: u32, ofs: u32, file_no_raw: u32) -> Self {
        JEntry {
            len,
            ofs,
            file_no_raw,
        }
    }

    pub fn file_no(&self) -> i32 {
        (self.file_no_raw & !LOCAL_DB_BIT) as i32
    }

    pub fn is_local_db_context(&self) -> bool {
        self.file_no_raw & LOCAL_DB_BIT != 0
    }

    pub fn is_ns_file(&self) -> bool {
        self.file_no() == DOT_NS_FILE_NO
    }

    /// Header bytes only; the caller appends the payload.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.len.to_le_bytes());
        out[4..8].copy_from_slice(&self.ofs.to_le_bytes());
        out[8..12].copy_from_slice(&self.file_no_raw.to_le_bytes());
        out
    }
}

/// Cross-file object append.
///
/// Layout after the opcode word (20 bytes): dst_file_no i32, dst_ofs
/// u32, src_file_no i32, src_ofs u32, len u32.
#[derive(Debug, Clone, Copy)]
pub struct JObjAppend {
    pub dst_file_no: i32,
    pub dst_ofs: u32,
    pub src_file_no: i32,
    pub src_ofs: u32,
    pub len: u32,
}

impl JObjAppend {
    pub const SIZE: usize = 20;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.dst_file_no.to_le_bytes());
        out[4..8].copy_from_slice(&self.dst_ofs.to_le_bytes());
        out[8..12].copy_from_slice(&self.src_file_no.to_le_bytes());
        out[12..16].copy_from_slice(&self.src_ofs.to_le_bytes());
        out[16..20].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn from_bytes(mut data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(JObjAppend {
            dst_file_no: data.get_i32_le(),
            dst_ofs: data.get_u32_le(),
            src_file_no: data.get_i32_le(),
            src_ofs: data.get_u32_le(),
            len: data.get_u32_le(),
        })
    }
}

/// Section footer: the opcode sentinel plus a 128-bit digest over
/// `[section start, digest)` — header, entries, and the sentinel word.
#[derive(Debug, Clone, Copy)]
pub struct SectionFooter {
    pub hash: [u8; 16],
}

impl SectionFooter {
    /// Sentinel word plus digest.
    pub const SIZE: usize = 4 + 16;

    /// Digest over a section's bytes up to the hash field.
    pub fn digest(covered: &[u8]) -> [u8; 16] {
        use md5::{Digest, Md5};
        let mut hasher = Md5::new();
        hasher.update(covered);
        hasher.finalize().into()
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&OPCODE_FOOTER.to_le_bytes());
        out[4..20].copy_from_slice(&self.hash);
        out
    }
}

/// Builds the journal filename for a sequence number.
pub fn journal_file_name(seq: u32) -> String {
    format!("j._{}", seq)
}

/// Builds the data filename an entry's file number refers to.
pub fn data_file_name(db: &str, file_no: i32) -> String {
    if file_no == DOT_NS_FILE_NO {
        format!("{}.ns", db)
    } else {
        format!("{}.{}", db, file_no)
    }
}
