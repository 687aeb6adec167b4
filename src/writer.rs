//! Streaming table writer.
//!
//! [`Writer`] accepts refs and then logs, packages them into blocks,
//! flushes blocks to the sink as they fill, and on close emits section
//! indices, the object index, and the footer.  Sections are written in
//! fixed order: header, refs (+index), objs (+index), logs (+index),
//! footer.
//!
//! # Padding
//!
//! Ref, obj, and index blocks are padded to `block_size` so every block
//! of an aligned run starts on a block boundary; the padding of a flushed
//! block is written lazily, only once more bytes follow in the same
//! section.  The final block of each section therefore stays unpadded,
//! which keeps single-block tables small.  Log blocks are deflated and
//! never padded.
//!
//! # States
//!
//! `OPEN_REFS → OPEN_OBJ → OPEN_LOGS → CLOSED`, advanced by the first log
//! add or by close.  Backwards transitions are API errors.  A sink error
//! leaves the writer in a terminal failed state; close then reports the
//! failure without emitting a footer.

use std::collections::BTreeMap;
use std::io::Write;

use serde::Serialize;

use crate::block::BlockWriter;
use crate::coding::common_prefix_len;
use crate::error::{Error, Result};
use crate::layout::{Footer, Header, HEADER_SIZE, MAX_BLOCK_SIZE};
use crate::record::{BlockKind, IndexRecord, LogRecord, Record, RecordCtx, RefRecord};

pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
pub const DEFAULT_RESTART_INTERVAL: usize = 16;

// ── Options ──────────────────────────────────────────────────────────────────

/// Configuration for [`Writer::new`].
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Block ceiling in bytes.  Clamped to the u24 range.
    pub block_size: u32,
    /// Records between restart points.  Accepted range is 1..=64.
    pub restart_interval: usize,
    /// Object id width, 20 or 32.
    pub hash_size: usize,
    /// Suppress the object index section.
    pub skip_index_objects: bool,
    /// Preserve log message bytes verbatim instead of normalizing to a
    /// single trailing newline.
    pub exact_log_message: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            block_size: DEFAULT_BLOCK_SIZE,
            restart_interval: DEFAULT_RESTART_INTERVAL,
            hash_size: 20,
            skip_index_objects: false,
            exact_log_message: false,
        }
    }
}

// ── Stats ────────────────────────────────────────────────────────────────────

/// Per-section write statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SectionStats {
    /// Data blocks written.
    pub blocks: u64,
    /// Records written.
    pub entries: u64,
    /// Restart points emitted.
    pub restarts: u64,
    /// Meaningful bytes across data blocks (padding excluded).
    pub bytes: u64,
    /// Internal offset of the section's first block.
    pub offset: u64,
    /// Offset of the section index root block, 0 when no index was built.
    pub index_start: u64,
    /// Index blocks written for this section.
    pub index_blocks: u64,
    /// Largest single block observed, in bytes.
    pub max_block_size: u64,
}

/// Whole-file write statistics, reported by [`Writer::stats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    /// Total blocks of every type.
    pub blocks: u64,
    pub ref_stats: SectionStats,
    pub obj_stats: SectionStats,
    pub log_stats: SectionStats,
    /// Uniform shortened object-id key width of the obj section.
    pub object_id_len: usize,
}

// ── State machine ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    OpenRefs,
    OpenLogs,
    Closed,
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// Streams a single reftable into a byte sink.
pub struct Writer<W: Write> {
    out: W,
    opts: WriteOptions,
    min_update_index: u64,
    max_update_index: u64,

    /// Bytes actually written to the sink.
    written: u64,
    /// Padding owed for the previously flushed block; emitted lazily.
    pending_padding: usize,
    /// Offset where the next block will land (`written + pending_padding`).
    next: u64,
    /// Offset of the currently open block.
    cur_block_off: u64,

    last_key: Vec<u8>,
    block_writer: Option<BlockWriter>,
    /// Recycled block buffer; blocks reuse one allocation.
    spare_buf: Vec<u8>,
    /// Pending (last key, offset) entries for the current section's index.
    index: Vec<IndexRecord>,
    /// Object id → offsets of the ref blocks mentioning it.
    obj_index: BTreeMap<Vec<u8>, Vec<u64>>,
    /// Section charged for index blocks while an index is being dumped.
    cur_section: BlockKind,

    stats: Stats,
    state: State,
    records_added: bool,
    failed: Option<String>,
}

impl<W: Write> Writer<W> {
    pub fn new(out: W, mut opts: WriteOptions) -> Self {
        if opts.block_size == 0 {
            opts.block_size = DEFAULT_BLOCK_SIZE;
        }
        opts.block_size = opts.block_size.min(MAX_BLOCK_SIZE);
        if opts.restart_interval == 0 {
            opts.restart_interval = DEFAULT_RESTART_INTERVAL;
        }
        opts.restart_interval = opts.restart_interval.min(64);
        if opts.hash_size == 0 {
            opts.hash_size = 20;
        }
        Writer {
            out,
            opts,
            min_update_index: 0,
            max_update_index: 0,
            written: 0,
            pending_padding: 0,
            next: 0,
            cur_block_off: 0,
            last_key: Vec::new(),
            block_writer: None,
            spare_buf: Vec::new(),
            index: Vec::new(),
            obj_index: BTreeMap::new(),
            cur_section: BlockKind::Ref,
            stats: Stats::default(),
            state: State::OpenRefs,
            records_added: false,
            failed: None,
        }
    }

    /// Declare the update-index window of this table.  Must be called
    /// before the first record; the bounds are written into header and
    /// footer, and ref update indices are stored as deltas from `min`.
    pub fn set_limits(&mut self, min: u64, max: u64) -> Result<()> {
        if self.records_added {
            return Err(Error::api("set_limits after the first record"));
        }
        if min > max {
            return Err(Error::api("min_update_index exceeds max_update_index"));
        }
        self.min_update_index = min;
        self.max_update_index = max;
        Ok(())
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    fn ctx(&self) -> RecordCtx {
        RecordCtx {
            hash_size: self.opts.hash_size,
            min_update_index: self.min_update_index,
        }
    }

    fn check_usable(&self) -> Result<()> {
        if let Some(msg) = &self.failed {
            return Err(Error::Api(format!("writer is in a failed state: {msg}")));
        }
        if self.state == State::Closed {
            return Err(Error::api("writer is closed"));
        }
        Ok(())
    }

    /// Add one ref.  Refs must arrive in strictly ascending name order,
    /// before any log, with update indices inside the declared window.
    pub fn add_ref(&mut self, rec: &RefRecord) -> Result<()> {
        self.check_usable()?;
        if self.state != State::OpenRefs {
            return Err(Error::api("refs must be added before logs"));
        }
        if rec.ref_name.is_empty() {
            return Err(Error::api("empty ref name"));
        }
        if rec.update_index < self.min_update_index || rec.update_index > self.max_update_index {
            return Err(Error::api("ref update_index outside the declared window"));
        }
        self.add_record(Record::Ref(rec.clone()))?;
        if !self.opts.skip_index_objects {
            let block_off = self.cur_block_off;
            for id in [&rec.value, &rec.target_value].into_iter().flatten() {
                self.obj_index.entry(id.clone()).or_default().push(block_off);
            }
        }
        Ok(())
    }

    /// Add one log entry.  The first log closes the ref section (and
    /// writes the obj section); log keys must be strictly ascending.
    pub fn add_log(&mut self, rec: &LogRecord) -> Result<()> {
        self.check_usable()?;
        if self.state == State::OpenRefs {
            self.finish_refs_and_objs()?;
        }
        let mut rec = rec.clone();
        if !self.opts.exact_log_message && !rec.message.is_empty() {
            let trimmed = rec.message.trim_end_matches('\n');
            rec.message = format!("{trimmed}\n");
        }
        self.cur_section = BlockKind::Log;
        self.add_record(Record::Log(rec))
    }

    /// Finish all open sections, write the footer, and return the total
    /// byte count of the file.
    pub fn close(&mut self) -> Result<u64> {
        self.check_usable()?;
        if self.state == State::OpenRefs {
            self.finish_refs_and_objs()?;
        }
        self.cur_section = BlockKind::Log;
        self.finish_section(BlockKind::Log)?;

        // A table with no records still carries its header.
        if self.written == 0 {
            let header = self.header()?.encode();
            self.sink_write_vec(header.to_vec())?;
        }

        let footer = Footer {
            header: self.header()?,
            ref_start: section_marker(&self.stats.ref_stats),
            ref_index_root: self.stats.ref_stats.index_start,
            obj_start: section_marker(&self.stats.obj_stats),
            obj_index_root: self.stats.obj_stats.index_start,
            log_start: section_marker(&self.stats.log_stats),
            log_index_root: self.stats.log_stats.index_start,
        };
        self.sink_write_vec(footer.encode().to_vec())?;
        self.out.flush()?;
        self.state = State::Closed;
        Ok(self.written)
    }

    // ── Record path ─────────────────────────────────────────────────────────

    fn add_record(&mut self, rec: Record) -> Result<()> {
        let key = rec.key();
        if !self.last_key.is_empty() && key <= self.last_key {
            return Err(Error::api("record keys must be strictly ascending"));
        }
        let kind = rec.kind();
        let added = match self.block_writer.as_mut() {
            Some(bw) => bw.add(&rec),
            None => self.open_block(kind).add(&rec),
        };
        if !added {
            self.flush_block()?;
            if !self.open_block(kind).add(&rec) {
                if kind != BlockKind::Log {
                    return Err(Error::api("record larger than the block size"));
                }
                // A single log entry may exceed the nominal block size;
                // grow this block to hold exactly that record.
                let header_off = if self.next == 0 { HEADER_SIZE } else { 0 };
                let size = BlockWriter::size_for_single(&rec, header_off, self.ctx());
                let mut bw = BlockWriter::new(
                    kind,
                    size,
                    header_off,
                    self.opts.restart_interval,
                    self.ctx(),
                );
                let ok = bw.add(&rec);
                debug_assert!(ok, "sized-to-fit block rejected its record");
                self.block_writer = Some(bw);
            }
        }
        self.records_added = true;
        self.last_key = key;
        Ok(())
    }

    fn open_block(&mut self, kind: BlockKind) -> &mut BlockWriter {
        let header_off = if self.next == 0 { HEADER_SIZE } else { 0 };
        self.cur_block_off = self.next;
        let buf = std::mem::take(&mut self.spare_buf);
        self.block_writer.insert(BlockWriter::with_buf(
            buf,
            kind,
            self.opts.block_size as usize,
            header_off,
            self.opts.restart_interval,
            self.ctx(),
        ))
    }

    fn flush_block(&mut self) -> Result<()> {
        let Some(mut bw) = self.block_writer.take() else {
            return Ok(());
        };
        if bw.is_empty() {
            self.spare_buf = bw.into_buf();
            return Ok(());
        }
        if self.cur_block_off == 0 {
            let header = self.header()?.encode();
            bw.fill_header(&header);
        }
        let kind = bw.kind();
        let raw = bw.finish()?;
        let padding = if kind == BlockKind::Log {
            0
        } else {
            (self.opts.block_size as usize).saturating_sub(raw)
        };

        let section = match self.cur_section {
            BlockKind::Ref => &mut self.stats.ref_stats,
            BlockKind::Obj => &mut self.stats.obj_stats,
            _ => &mut self.stats.log_stats,
        };
        if kind == BlockKind::Index {
            section.index_blocks += 1;
        } else {
            if section.blocks == 0 {
                section.offset = self.cur_block_off;
            }
            section.blocks += 1;
            section.entries += bw.entries() as u64;
            section.restarts += bw.restart_count() as u64;
            section.bytes += raw as u64;
            section.max_block_size = section.max_block_size.max(raw as u64);
        }
        self.stats.blocks += 1;

        self.index.push(IndexRecord {
            last_key: bw.last_key().to_vec(),
            offset: self.cur_block_off,
        });
        let data = bw.data().to_vec();
        self.spare_buf = bw.into_buf();
        self.padded_write(&data, padding)
    }

    fn finish_section(&mut self, kind: BlockKind) -> Result<()> {
        self.flush_block()?;

        let mut index_start = 0u64;
        while self.index.len() > 1 {
            index_start = self.next;
            let entries = std::mem::take(&mut self.index);
            self.last_key.clear();
            for entry in entries {
                self.add_record(Record::Index(entry))?;
            }
            self.flush_block()?;
        }
        self.index.clear();
        self.last_key.clear();

        let section = match kind {
            BlockKind::Ref => &mut self.stats.ref_stats,
            BlockKind::Obj => &mut self.stats.obj_stats,
            _ => &mut self.stats.log_stats,
        };
        section.index_start = index_start;

        // The final block of a section is never padded.
        self.pending_padding = 0;
        self.next = self.written;
        Ok(())
    }

    fn finish_refs_and_objs(&mut self) -> Result<()> {
        self.cur_section = BlockKind::Ref;
        self.finish_section(BlockKind::Ref)?;

        if !self.obj_index.is_empty() {
            let ids: Vec<&Vec<u8>> = self.obj_index.keys().collect();
            let mut max_common = 0usize;
            for pair in ids.windows(2) {
                max_common = max_common.max(common_prefix_len(pair[0], pair[1]));
            }
            let id_len = (max_common + 1).clamp(2, self.opts.hash_size);
            self.stats.object_id_len = id_len;

            self.cur_section = BlockKind::Obj;
            let entries = std::mem::take(&mut self.obj_index);
            for (id, mut offsets) in entries {
                offsets.sort_unstable();
                offsets.dedup();
                self.add_record(Record::Obj(crate::record::ObjRecord {
                    id_prefix: id[..id_len].to_vec(),
                    offsets,
                }))?;
            }
            self.finish_section(BlockKind::Obj)?;
        }
        self.state = State::OpenLogs;
        Ok(())
    }

    // ── Sink path ───────────────────────────────────────────────────────────

    fn header(&self) -> Result<Header> {
        Header::new(
            self.opts.hash_size,
            self.opts.block_size,
            self.min_update_index,
            self.max_update_index,
        )
    }

    /// Emit any padding owed for the previous block, write `buf`, and
    /// remember this block's padding for the next write.
    fn padded_write(&mut self, buf: &[u8], padding: usize) -> Result<()> {
        if self.pending_padding > 0 {
            let zeros = vec![0u8; self.pending_padding];
            self.pending_padding = 0;
            self.sink_write_vec(zeros)?;
        }
        self.sink_write_vec(buf.to_vec())?;
        self.pending_padding = padding;
        self.next = self.written + padding as u64;
        Ok(())
    }

    fn sink_write_vec(&mut self, buf: Vec<u8>) -> Result<()> {
        match self.out.write_all(&buf) {
            Ok(()) => {
                self.written += buf.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.failed = Some(e.to_string());
                Err(Error::Io(e))
            }
        }
    }
}

/// Footer representation of a section start: 0 = absent, and the first
/// block of the file is marked with `HEADER_SIZE` since its buffer offset
/// is 0.
fn section_marker(stats: &SectionStats) -> u64 {
    if stats.blocks == 0 {
        0
    } else if stats.offset == 0 {
        HEADER_SIZE as u64
    } else {
        stats.offset
    }
}
