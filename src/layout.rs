//! Header and footer — the format anchors at both ends of a reftable.
//!
//! # On-disk layout (all fixed-width fields big-endian)
//!
//! ```text
//! Header (24 bytes, shared with the first block's extent):
//! Offset  Size  Field
//!    0      4   magic             = "REFT" (4 ASCII bytes)
//!    4      1   version           1 = 20-byte ids, 2 = 32-byte ids
//!    5      3   block_size        (u24)
//!    8      8   min_update_index  (u64)
//!   16      8   max_update_index  (u64)
//!
//! Footer (76 bytes, at the very end of the file):
//! Offset  Size  Field
//!    0     24   header copy (must match the header at offset 0)
//!   24      8   ref_start         HEADER_SIZE, or 0 = no ref section
//!   32      8   ref_index_root    0 = no ref index
//!   40      8   obj_start         0 = no obj section
//!   48      8   obj_index_root    0 = no obj index
//!   56      8   log_start         0 = no log section
//!   64      8   log_index_root    0 = no log index
//!   72      4   crc32 of bytes 0..72
//! ```
//!
//! The version byte doubles as the identifier-size hint, keeping the
//! header at 24 bytes.  A zero offset always means "absent".

use crc32fast::Hasher;

use crate::coding::{get_u24, get_u32, get_u64, put_u24, put_u32, put_u64};
use crate::error::{Error, Result};

pub const MAGIC: &[u8; 4] = b"REFT";
pub const HEADER_SIZE: usize = 24;
pub const FOOTER_SIZE: usize = 76;

/// Version byte for files with 20-byte object ids.
pub const VERSION_ID20: u8 = 1;
/// Version byte for files with 32-byte object ids.
pub const VERSION_ID32: u8 = 2;

/// Block sizes are stored as a u24.
pub const MAX_BLOCK_SIZE: u32 = 0xff_ffff;

// ── Header ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub block_size: u32,
    pub min_update_index: u64,
    pub max_update_index: u64,
}

impl Header {
    pub fn new(hash_size: usize, block_size: u32, min: u64, max: u64) -> Result<Self> {
        let version = match hash_size {
            20 => VERSION_ID20,
            32 => VERSION_ID32,
            n => return Err(Error::Api(format!("unsupported object id width {n}"))),
        };
        Ok(Header {
            version,
            block_size,
            min_update_index: min,
            max_update_index: max,
        })
    }

    /// Object id width implied by the version byte.
    pub fn hash_size(&self) -> usize {
        if self.version == VERSION_ID32 {
            32
        } else {
            20
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4] = self.version;
        put_u24(&mut buf[5..8], self.block_size);
        put_u64(&mut buf[8..16], self.min_update_index);
        put_u64(&mut buf[16..24], self.max_update_index);
        buf
    }

    /// Validate magic and version, then extract the fields.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::format("truncated header"));
        }
        if &buf[0..4] != MAGIC {
            return Err(Error::format("bad magic, not a reftable"));
        }
        let version = buf[4];
        if version != VERSION_ID20 && version != VERSION_ID32 {
            return Err(Error::Format(format!("unsupported version {version}")));
        }
        Ok(Header {
            version,
            block_size: get_u24(&buf[5..8]),
            min_update_index: get_u64(&buf[8..16]),
            max_update_index: get_u64(&buf[16..24]),
        })
    }
}

// ── Footer ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    pub header: Header,
    pub ref_start: u64,
    pub ref_index_root: u64,
    pub obj_start: u64,
    pub obj_index_root: u64,
    pub log_start: u64,
    pub log_index_root: u64,
}

impl Footer {
    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..HEADER_SIZE].copy_from_slice(&self.header.encode());
        let offsets = [
            self.ref_start,
            self.ref_index_root,
            self.obj_start,
            self.obj_index_root,
            self.log_start,
            self.log_index_root,
        ];
        for (i, off) in offsets.iter().enumerate() {
            put_u64(&mut buf[HEADER_SIZE + 8 * i..], *off);
        }
        let mut h = Hasher::new();
        h.update(&buf[..FOOTER_SIZE - 4]);
        put_u32(&mut buf[FOOTER_SIZE - 4..], h.finalize());
        buf
    }

    /// Verify the CRC32 first, then the embedded header copy.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FOOTER_SIZE {
            return Err(Error::format("truncated footer"));
        }
        let mut h = Hasher::new();
        h.update(&buf[..FOOTER_SIZE - 4]);
        let expect = h.finalize();
        let stored = get_u32(&buf[FOOTER_SIZE - 4..]);
        if stored != expect {
            return Err(Error::Format(format!(
                "footer CRC32 mismatch: expected {expect:#010x}, got {stored:#010x}"
            )));
        }
        let header = Header::decode(&buf[..HEADER_SIZE])?;
        let off = |i: usize| get_u64(&buf[HEADER_SIZE + 8 * i..]);
        Ok(Footer {
            header,
            ref_start: off(0),
            ref_index_root: off(1),
            obj_start: off(2),
            obj_index_root: off(3),
            log_start: off(4),
            log_index_root: off(5),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Footer {
        Footer {
            header: Header::new(20, 4096, 5, 9).unwrap(),
            ref_start: HEADER_SIZE as u64,
            ref_index_root: 0,
            obj_start: 8192,
            obj_index_root: 0,
            log_start: 12288,
            log_index_root: 16384,
        }
    }

    #[test]
    fn header_round_trip() {
        let h = Header::new(32, 256, 1, 7).unwrap();
        assert_eq!(Header::decode(&h.encode()).unwrap(), h);
        assert_eq!(h.hash_size(), 32);
    }

    #[test]
    fn footer_round_trip() {
        let f = sample();
        assert_eq!(Footer::decode(&f.encode()).unwrap(), f);
    }

    #[test]
    fn footer_corruption_detected() {
        let f = sample();
        let mut buf = f.encode();
        buf[30] ^= 0x01;
        match Footer::decode(&buf) {
            Err(Error::Format(msg)) => assert!(msg.contains("CRC32")),
            other => panic!("expected CRC mismatch, got {other:?}"),
        }
    }

    #[test]
    fn bad_magic_rejected() {
        let mut buf = sample().header.encode();
        buf[0] = b'X';
        assert!(Header::decode(&buf).is_err());
    }
}
