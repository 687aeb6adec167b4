//! Block codec — typed, self-describing units of prefix-compressed records.
//!
//! # On-disk layout
//!
//! ```text
//! Offset          Size  Field
//!    0       header_off  reserved (file header; non-zero for the first
//!                        block only, which shares the opening bytes)
//! +0              1      block type: 'r' 'l' 'o' 'i'
//! +1              3      block length (u24, measured from the type byte;
//!                        for log blocks this is the *uncompressed* length)
//! +4              ...    prefix-compressed records
//! ...             3×n    restart offsets (u24 each, relative to the type
//!                        byte; every restart record stores its full key)
//! ...             2      restart count (u16)
//! ...             ...    zero padding to block_size (ref/obj/index blocks
//!                        that are not the last of their section)
//! ```
//!
//! Log blocks deflate everything after the 4-byte prefix as one zlib
//! stream; their on-disk extent is `4 + deflate_len` and they are never
//! padded.  The stream is self-terminating, so the reader recovers the
//! extent from the number of compressed bytes consumed.

use std::io::{Read, Write};

use flate2::bufread::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::coding::{binsearch, get_u16, get_u24, get_varint, put_u16, put_u24};
use crate::error::{Error, Result};
use crate::record::{BlockKind, Record, RecordCtx};

/// Type byte plus u24 length.
pub const BLOCK_PREFIX: usize = 4;

// ── Writer ───────────────────────────────────────────────────────────────────

/// Accumulates records of one kind into a single block buffer.
pub struct BlockWriter {
    kind: BlockKind,
    buf: Vec<u8>,
    header_off: usize,
    next: usize,
    /// Restart positions, relative to the type byte.
    restarts: Vec<u32>,
    restart_interval: usize,
    entries: usize,
    last_key: Vec<u8>,
    ctx: RecordCtx,
    scratch: Vec<u8>,
}

impl BlockWriter {
    /// `block_size` is the buffer ceiling, header_off included.
    pub fn new(
        kind: BlockKind,
        block_size: usize,
        header_off: usize,
        restart_interval: usize,
        ctx: RecordCtx,
    ) -> Self {
        Self::with_buf(Vec::new(), kind, block_size, header_off, restart_interval, ctx)
    }

    /// Like [`BlockWriter::new`], but recycling a buffer from a previously
    /// finished block.
    pub fn with_buf(
        mut buf: Vec<u8>,
        kind: BlockKind,
        block_size: usize,
        header_off: usize,
        restart_interval: usize,
        ctx: RecordCtx,
    ) -> Self {
        buf.clear();
        buf.resize(block_size, 0);
        buf[header_off] = kind as u8;
        BlockWriter {
            kind,
            buf,
            header_off,
            next: header_off + BLOCK_PREFIX,
            restarts: Vec::new(),
            restart_interval: restart_interval.max(1),
            entries: 0,
            last_key: Vec::new(),
            ctx,
            scratch: Vec::new(),
        }
    }

    /// Reclaim the internal buffer for reuse by the next block.
    pub fn into_buf(self) -> Vec<u8> {
        self.buf
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn restart_count(&self) -> usize {
        self.restarts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Bytes the header-sharing prefix occupies.
    pub fn header_off(&self) -> usize {
        self.header_off
    }

    /// Key of the most recently added record.
    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    /// Copy the file header into the reserved prefix of the first block.
    pub fn fill_header(&mut self, header: &[u8]) {
        self.buf[..self.header_off].copy_from_slice(header);
    }

    /// Buffer ceiling needed to hold `rec` alone in a block.
    pub fn size_for_single(rec: &Record, header_off: usize, ctx: RecordCtx) -> usize {
        let mut scratch = Vec::new();
        rec.encode(&mut scratch, b"", ctx);
        header_off + BLOCK_PREFIX + scratch.len() + 3 + 2
    }

    /// Try to append `rec`.  Returns false when the encoded record (plus
    /// its restart-table share) does not fit; the caller flushes and
    /// retries in a fresh block.
    pub fn add(&mut self, rec: &Record) -> bool {
        let restart = self.entries % self.restart_interval == 0;
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        {
            let prev: &[u8] = if restart { b"" } else { &self.last_key };
            rec.encode(&mut scratch, prev, self.ctx);
        }
        let restart_len = self.restarts.len() + usize::from(restart);
        let needed = self.next + scratch.len() + 3 * restart_len + 2;
        if needed > self.buf.len() {
            self.scratch = scratch;
            return false;
        }
        if restart {
            self.restarts.push((self.next - self.header_off) as u32);
        }
        self.buf[self.next..self.next + scratch.len()].copy_from_slice(&scratch);
        self.next += scratch.len();
        self.entries += 1;
        self.last_key = rec.key();
        self.scratch = scratch;
        true
    }

    /// Write the restart table and length field, compress log blocks, and
    /// return the number of meaningful bytes in the buffer (header_off
    /// included).
    pub fn finish(&mut self) -> Result<usize> {
        for i in 0..self.restarts.len() {
            if self.next + 3 > self.buf.len() {
                self.buf.resize(self.next + 3, 0);
            }
            put_u24(&mut self.buf[self.next..], self.restarts[i]);
            self.next += 3;
        }
        if self.next + 2 > self.buf.len() {
            self.buf.resize(self.next + 2, 0);
        }
        put_u16(&mut self.buf[self.next..], self.restarts.len() as u16);
        self.next += 2;

        // The length field always records the uncompressed extent.
        let sz = (self.next - self.header_off) as u32;
        put_u24(&mut self.buf[self.header_off + 1..], sz);

        if self.kind == BlockKind::Log {
            let start = self.header_off + BLOCK_PREFIX;
            let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
            enc.write_all(&self.buf[start..self.next])
                .map_err(|e| Error::Zlib(e.to_string()))?;
            let compressed = enc.finish().map_err(|e| Error::Zlib(e.to_string()))?;
            // Random payloads can expand; grow the buffer rather than fail.
            if start + compressed.len() > self.buf.len() {
                self.buf.resize(start + compressed.len(), 0);
            }
            self.buf[start..start + compressed.len()].copy_from_slice(&compressed);
            self.next = start + compressed.len();
        }
        Ok(self.next)
    }

    /// The finished block bytes, valid after `finish`.
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.next]
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Cursor into a [`BlockReader`].  Holds no borrow; pass it back to the
/// owning reader to advance.
#[derive(Debug, Clone)]
pub struct BlockIter {
    pos: usize,
    last_key: Vec<u8>,
}

impl BlockIter {
    /// Key of the most recently decoded record.
    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }
}

/// Decoded view of one block; serves iteration and restart-table seeks.
#[derive(Debug)]
pub struct BlockReader {
    kind: BlockKind,
    /// Uncompressed block bytes, starting at the type byte.
    block: Vec<u8>,
    restart_count: usize,
    restart_off: usize,
    /// On-disk extent from the block's file offset, header_off included.
    /// Advancing by this lands on the next block.
    full_block_size: usize,
    ctx: RecordCtx,
}

impl BlockReader {
    /// `data` starts at the block's file offset and must cover the block's
    /// on-disk extent.  `block_size` is the writer-declared ceiling used to
    /// size padded blocks.
    pub fn new(data: &[u8], header_off: usize, block_size: usize, ctx: RecordCtx) -> Result<Self> {
        if data.len() < header_off + BLOCK_PREFIX {
            return Err(Error::format("truncated block header"));
        }
        let kind = BlockKind::from_u8(data[header_off])
            .ok_or_else(|| Error::Format(format!("unknown block type {:#x}", data[header_off])))?;
        let sz = get_u24(&data[header_off + 1..]) as usize;
        if sz < BLOCK_PREFIX {
            return Err(Error::format("block length smaller than its prefix"));
        }

        let (block, full_block_size) = if kind == BlockKind::Log {
            let mut dec = ZlibDecoder::new(&data[header_off + BLOCK_PREFIX..]);
            let mut inflated = Vec::with_capacity(sz);
            inflated.extend_from_slice(&data[header_off..header_off + BLOCK_PREFIX]);
            dec.read_to_end(&mut inflated)
                .map_err(|e| Error::Zlib(e.to_string()))?;
            if inflated.len() != sz {
                return Err(Error::format("log block inflates to the wrong length"));
            }
            let consumed = dec.total_in() as usize;
            (inflated, header_off + BLOCK_PREFIX + consumed)
        } else {
            if header_off + sz > data.len() {
                return Err(Error::format("truncated block"));
            }
            let block = data[header_off..header_off + sz].to_vec();
            // A zero byte after the declared length is padding; a type byte
            // there means the next block follows unpadded.
            let padded = header_off + sz < block_size
                && data.len() > header_off + sz
                && data[header_off + sz] == 0;
            let full = if padded { block_size } else { header_off + sz };
            (block, full)
        };

        let restart_count = get_u16(&block[sz - 2..]) as usize;
        let table = 3 * restart_count + 2;
        if sz < BLOCK_PREFIX + table {
            return Err(Error::format("restart table overruns block"));
        }
        let restart_off = sz - table;

        Ok(BlockReader {
            kind,
            block,
            restart_count,
            restart_off,
            full_block_size,
            ctx,
        })
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn full_block_size(&self) -> usize {
        self.full_block_size
    }

    fn restart_offset(&self, i: usize) -> usize {
        get_u24(&self.block[self.restart_off + 3 * i..]) as usize
    }

    fn restart_key(&self, i: usize) -> Result<&[u8]> {
        let mut pos = self.restart_offset(i);
        let (_shared, n) = get_varint(&self.block[pos..self.restart_off])?;
        pos += n;
        let (len, n) = get_varint(&self.block[pos..self.restart_off])?;
        pos += n;
        let len = len as usize;
        if pos + len > self.restart_off {
            return Err(Error::format("restart key overruns record area"));
        }
        Ok(&self.block[pos..pos + len])
    }

    /// Key of the first record (always a full, uncompressed key).
    pub fn first_key(&self) -> Result<Vec<u8>> {
        if self.restart_count == 0 {
            return Err(Error::format("block has no restart points"));
        }
        Ok(self.restart_key(0)?.to_vec())
    }

    /// Iterator positioned before the first record.
    pub fn start(&self) -> BlockIter {
        BlockIter {
            pos: BLOCK_PREFIX,
            last_key: Vec::new(),
        }
    }

    /// Decode the record under the cursor and advance.  `Ok(None)` at the
    /// end of the block.
    pub fn next_record(&self, it: &mut BlockIter) -> Result<Option<Record>> {
        if it.pos >= self.restart_off {
            return Ok(None);
        }
        let (rec, key, n) = Record::decode(
            self.kind,
            &self.block[it.pos..self.restart_off],
            &it.last_key,
            self.ctx,
        )?;
        it.pos += n;
        it.last_key = key;
        Ok(Some(rec))
    }

    /// Position an iterator so that the next record is the first one whose
    /// key is `>= target`.  Ties go to the first matching record.
    pub fn seek(&self, target: &[u8]) -> Result<BlockIter> {
        let mut seek_err = None;
        let i = binsearch(self.restart_count, |i| match self.restart_key(i) {
            Ok(k) => k > target,
            Err(e) => {
                seek_err = Some(e);
                true
            }
        });
        if let Some(e) = seek_err {
            return Err(e);
        }

        let start = if i > 0 { i - 1 } else { 0 };
        let mut it = BlockIter {
            pos: self.restart_offset(start),
            last_key: Vec::new(),
        };
        loop {
            let before = it.clone();
            match self.next_record(&mut it)? {
                None => return Ok(it),
                Some(_) => {
                    if it.last_key.as_slice() >= target {
                        return Ok(before);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{LogRecord, RefRecord};

    const CTX: RecordCtx = RecordCtx {
        hash_size: 20,
        min_update_index: 0,
    };

    fn ref_rec(name: &str, fill: u8) -> Record {
        Record::Ref(RefRecord {
            ref_name: name.into(),
            update_index: 0,
            value: Some(vec![fill; 20]),
            ..Default::default()
        })
    }

    #[test]
    fn block_read_write() {
        let header_off = 21;
        let n = 30;
        let block_size = 1024;
        let names: Vec<String> = (0..n).map(|i| format!("branch{i:02}")).collect();

        let mut bw = BlockWriter::new(BlockKind::Ref, block_size, header_off, 16, CTX);
        for (i, name) in names.iter().enumerate() {
            assert!(bw.add(&ref_rec(name, i as u8)));
        }
        let raw = bw.finish().unwrap();
        assert!(raw > 0);

        let br = BlockReader::new(bw.data(), header_off, block_size, CTX).unwrap();
        let mut it = br.start();
        let mut j = 0;
        while let Some(rec) = br.next_record(&mut it).unwrap() {
            match rec {
                Record::Ref(r) => assert_eq!(r.ref_name, names[j]),
                _ => unreachable!(),
            }
            j += 1;
        }
        assert_eq!(j, n);

        for (i, name) in names.iter().enumerate() {
            let mut it = br.seek(name.as_bytes()).unwrap();
            match br.next_record(&mut it).unwrap().unwrap() {
                Record::Ref(r) => assert_eq!(&r.ref_name, name),
                _ => unreachable!(),
            }

            // A truncated key lands on the first name sharing the prefix.
            let short = &name.as_bytes()[..name.len() - 1];
            let mut it = br.seek(short).unwrap();
            match br.next_record(&mut it).unwrap().unwrap() {
                Record::Ref(r) => assert_eq!(r.ref_name, names[10 * (i / 10)]),
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn seek_past_last_key_is_exhausted() {
        let mut bw = BlockWriter::new(BlockKind::Ref, 512, 0, 16, CTX);
        assert!(bw.add(&ref_rec("refs/heads/a", 1)));
        bw.finish().unwrap();
        let br = BlockReader::new(bw.data(), 0, 512, CTX).unwrap();
        let mut it = br.seek(b"refs/heads/z").unwrap();
        assert!(br.next_record(&mut it).unwrap().is_none());
    }

    #[test]
    fn log_block_compresses_and_round_trips() {
        let mut bw = BlockWriter::new(BlockKind::Log, 4096, 0, 16, CTX);
        let mut want = Vec::new();
        for i in 0..4u64 {
            let rec = Record::Log(LogRecord {
                ref_name: "refs/heads/main".into(),
                update_index: 10 - i,
                old_hash: Some(vec![i as u8; 20]),
                new_hash: Some(vec![i as u8 + 1; 20]),
                name: "A U Thor".into(),
                email: "author@example.com".into(),
                time: 1_000_000 + i,
                tz_offset: 60,
                message: format!("commit {i}\n"),
            });
            assert!(bw.add(&rec));
            want.push(rec);
        }
        let raw = bw.finish().unwrap();

        let br = BlockReader::new(&bw.data()[..raw], 0, 4096, CTX).unwrap();
        assert_eq!(br.full_block_size(), raw);
        let mut it = br.start();
        let mut got = Vec::new();
        while let Some(rec) = br.next_record(&mut it).unwrap() {
            got.push(rec);
        }
        assert_eq!(got, want);
    }

    #[test]
    fn restart_interval_one_still_round_trips() {
        for interval in [1usize, 2, 3, 16, 64] {
            let mut bw = BlockWriter::new(BlockKind::Ref, 4096, 0, interval, CTX);
            let names: Vec<String> = (0..40).map(|i| format!("refs/tags/v{i:03}")).collect();
            for name in &names {
                assert!(bw.add(&ref_rec(name, 9)));
            }
            bw.finish().unwrap();
            let br = BlockReader::new(bw.data(), 0, 4096, CTX).unwrap();
            let mut it = br.start();
            let mut j = 0;
            while let Some(Record::Ref(r)) = br.next_record(&mut it).unwrap() {
                assert_eq!(r.ref_name, names[j]);
                j += 1;
            }
            assert_eq!(j, names.len(), "interval={interval}");
        }
    }
}
