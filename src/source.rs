//! Byte sources — the random-access providers a [`crate::Reader`] mounts.
//!
//! Offsets may be unaligned (header and footer scanning); a read may
//! return fewer bytes than requested only at end-of-file.  Sources never
//! observe writes: reftables are immutable once closed.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

use crate::error::Result;

/// Random-access byte provider backing a reader.
pub trait BlockSource {
    /// Read up to `len` bytes starting at `off`.  Short reads happen only
    /// at end-of-file.
    fn read_block(&self, off: u64, len: usize) -> Result<Vec<u8>>;

    /// Total size in bytes.
    fn size(&self) -> u64;
}

// ── In-memory source ─────────────────────────────────────────────────────────

/// A source over an in-memory byte buffer, typically a just-written table.
#[derive(Debug, Clone)]
pub struct BufSource {
    buf: Vec<u8>,
}

impl BufSource {
    pub fn new(buf: Vec<u8>) -> Self {
        BufSource { buf }
    }
}

impl BlockSource for BufSource {
    fn read_block(&self, off: u64, len: usize) -> Result<Vec<u8>> {
        let off = off.min(self.buf.len() as u64) as usize;
        let end = (off + len).min(self.buf.len());
        Ok(self.buf[off..end].to_vec())
    }

    fn size(&self) -> u64 {
        self.buf.len() as u64
    }
}

// ── File source ──────────────────────────────────────────────────────────────

/// A source over a file on disk.  Positional reads are serialized through
/// a mutex, so one source may back iterators on multiple threads.
#[derive(Debug)]
pub struct FileSource {
    file: Mutex<File>,
    size: u64,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(FileSource {
            file: Mutex::new(file),
            size,
        })
    }
}

impl BlockSource for FileSource {
    fn read_block(&self, off: u64, len: usize) -> Result<Vec<u8>> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.seek(SeekFrom::Start(off))?;
        let mut buf = vec![0u8; len];
        let mut read = 0usize;
        while read < len {
            let n = file.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf.truncate(read);
        Ok(buf)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buf_source_reads_and_clamps() {
        let src = BufSource::new(b"hello\0".to_vec());
        assert_eq!(src.size(), 6);
        assert_eq!(src.read_block(0, 6).unwrap(), b"hello\0");
        assert_eq!(src.read_block(1, 2).unwrap(), b"el");
        // Short read at end-of-file.
        assert_eq!(src.read_block(4, 10).unwrap(), b"o\0");
        assert!(src.read_block(99, 4).unwrap().is_empty());
    }
}
