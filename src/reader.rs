//! Table reader — mounts an immutable reftable and serves sorted
//! iterators.
//!
//! [`Reader::new`] validates the header, then the footer (CRC32 first),
//! and keeps one descriptor per section.  Seeks go through the section
//! index when one was written and fall back to a linear block walk
//! otherwise; both paths position the iterator on the first record whose
//! key is `>= target`.
//!
//! Iterators return owned records: nothing handed out borrows iterator
//! internals, so records stay valid across subsequent `next_*` calls.

use crate::block::{BlockIter, BlockReader, BLOCK_PREFIX};
use crate::coding::get_u24;
use crate::error::{Error, Result};
use crate::layout::{Footer, Header, FOOTER_SIZE, HEADER_SIZE};
use crate::record::{log_key, BlockKind, Record, RecordCtx, RefRecord};
use crate::source::BlockSource;

// ── Section descriptors ──────────────────────────────────────────────────────

/// Location of one section, extracted from the footer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SectionOffsets {
    pub present: bool,
    /// Internal offset of the section's first block (0 = the block that
    /// shares the file header).
    pub offset: u64,
    /// Offset of the section index root block, 0 when absent.
    pub index_offset: u64,
}

fn section_from_marker(start: u64, index_root: u64) -> SectionOffsets {
    SectionOffsets {
        present: start != 0,
        offset: if start == HEADER_SIZE as u64 { 0 } else { start },
        index_offset: index_root,
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Read-only view of one reftable over a [`BlockSource`].
#[derive(Debug)]
pub struct Reader<S: BlockSource> {
    src: S,
    name: String,
    block_size: u32,
    hash_size: usize,
    min_update_index: u64,
    max_update_index: u64,
    /// First byte past the last block (the footer starts here).
    data_end: u64,
    pub ref_offsets: SectionOffsets,
    pub obj_offsets: SectionOffsets,
    pub log_offsets: SectionOffsets,
}

impl<S: BlockSource> Reader<S> {
    /// Mount a table.  `name` identifies the table in error messages.
    pub fn new(src: S, name: &str) -> Result<Self> {
        let size = src.size();
        if size < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(Error::Format(format!("{name}: file too small for a reftable")));
        }

        let head = src.read_block(0, HEADER_SIZE)?;
        let header = Header::decode(&head)?;

        let foot = src.read_block(size - FOOTER_SIZE as u64, FOOTER_SIZE)?;
        let footer = Footer::decode(&foot)?;
        if footer.header != header {
            return Err(Error::Format(format!(
                "{name}: footer header copy disagrees with the file header"
            )));
        }

        Ok(Reader {
            src,
            name: name.to_owned(),
            block_size: header.block_size,
            hash_size: header.hash_size(),
            min_update_index: header.min_update_index,
            max_update_index: header.max_update_index,
            data_end: size - FOOTER_SIZE as u64,
            ref_offsets: section_from_marker(footer.ref_start, footer.ref_index_root),
            obj_offsets: section_from_marker(footer.obj_start, footer.obj_index_root),
            log_offsets: section_from_marker(footer.log_start, footer.log_index_root),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn hash_size(&self) -> usize {
        self.hash_size
    }

    pub fn min_update_index(&self) -> u64 {
        self.min_update_index
    }

    pub fn max_update_index(&self) -> u64 {
        self.max_update_index
    }

    fn ctx(&self) -> RecordCtx {
        RecordCtx {
            hash_size: self.hash_size,
            min_update_index: self.min_update_index,
        }
    }

    fn offsets(&self, kind: BlockKind) -> &SectionOffsets {
        match kind {
            BlockKind::Ref => &self.ref_offsets,
            BlockKind::Obj => &self.obj_offsets,
            _ => &self.log_offsets,
        }
    }

    // ── Block fetch ─────────────────────────────────────────────────────────

    /// Read and decode the block at `off`.  Returns `Ok(None)` past the
    /// last block or when the block's type differs from `want` (the end of
    /// a same-typed run).
    fn block_at(&self, off: u64, want: Option<BlockKind>) -> Result<Option<BlockReader>> {
        if off >= self.data_end {
            return Ok(None);
        }
        let header_off = if off == 0 { HEADER_SIZE } else { 0 };
        let guess = (self.block_size as usize).max(header_off + BLOCK_PREFIX);
        let mut data = self.src.read_block(off, guess)?;
        if data.len() < header_off + BLOCK_PREFIX {
            return Err(Error::Format(format!(
                "{}: truncated block at offset {off}",
                self.name
            )));
        }
        if let Some(want) = want {
            match BlockKind::from_u8(data[header_off]) {
                Some(kind) if kind == want => {}
                // A valid block of another type ends the section's run.
                Some(_) => return Ok(None),
                None => {
                    return Err(Error::Format(format!(
                        "{}: unknown block type {:#x} at offset {off}",
                        self.name, data[header_off]
                    )))
                }
            }
        }

        // Log blocks can exceed the nominal block size; re-read with a
        // bound derived from the declared uncompressed length.
        let sz = get_u24(&data[header_off + 1..]) as usize;
        let needed = if data[header_off] == BlockKind::Log as u8 {
            header_off + BLOCK_PREFIX + sz + sz / 64 + 64
        } else {
            header_off + sz
        };
        if needed > data.len() && data.len() == guess {
            data = self.src.read_block(off, needed)?;
        }

        let br = BlockReader::new(&data, header_off, self.block_size as usize, self.ctx())?;
        Ok(Some(br))
    }

    // ── Seeks ───────────────────────────────────────────────────────────────

    /// Position an iterator on the first ref whose name is `>= name`.
    pub fn seek_ref(&self, name: &str) -> Result<TableIter<'_, S>> {
        self.seek(BlockKind::Ref, name.as_bytes())
    }

    /// Position an iterator on the newest log entry for `name` (entries
    /// iterate newest-first per ref).
    pub fn seek_log(&self, name: &str) -> Result<TableIter<'_, S>> {
        self.seek(BlockKind::Log, &log_key(name, u64::MAX))
    }

    /// Position an iterator on the log entry for `name` at
    /// `update_index`, or the nearest older one.
    pub fn seek_log_at(&self, name: &str, update_index: u64) -> Result<TableIter<'_, S>> {
        self.seek(BlockKind::Log, &log_key(name, update_index))
    }

    /// Position an iterator on the first obj record whose id prefix is
    /// `>= prefix`.
    pub fn seek_obj(&self, prefix: &[u8]) -> Result<TableIter<'_, S>> {
        self.seek(BlockKind::Obj, prefix)
    }

    fn seek(&self, kind: BlockKind, key: &[u8]) -> Result<TableIter<'_, S>> {
        let section = *self.offsets(kind);
        if !section.present {
            return Err(Error::NotExist);
        }
        if section.index_offset != 0 {
            self.seek_indexed(kind, &section, key)
        } else {
            self.seek_linear(kind, &section, key)
        }
    }

    /// Walk the section block by block while the next block's first key is
    /// still `<= key`, then seek inside the final candidate.
    fn seek_linear(&self, kind: BlockKind, section: &SectionOffsets, key: &[u8]) -> Result<TableIter<'_, S>> {
        let mut off = section.offset;
        let Some(mut br) = self.block_at(off, Some(kind))? else {
            return Ok(TableIter::exhausted(self, kind));
        };
        loop {
            let next_off = off + br.full_block_size() as u64;
            match self.block_at(next_off, Some(kind))? {
                Some(next) if next.first_key()?.as_slice() <= key => {
                    off = next_off;
                    br = next;
                }
                _ => break,
            }
        }
        let it = br.seek(key)?;
        Ok(TableIter {
            reader: self,
            kind,
            cur: Some(Cursor { off, br, it }),
        })
    }

    /// Descend the index tree from the recorded root to the leaf block
    /// that may contain `key`.
    fn seek_indexed(&self, kind: BlockKind, section: &SectionOffsets, key: &[u8]) -> Result<TableIter<'_, S>> {
        let mut off = section.index_offset;
        loop {
            let Some(br) = self.block_at(off, None)? else {
                return Ok(TableIter::exhausted(self, kind));
            };
            if br.kind() == kind {
                let it = br.seek(key)?;
                return Ok(TableIter {
                    reader: self,
                    kind,
                    cur: Some(Cursor { off, br, it }),
                });
            }
            if br.kind() != BlockKind::Index {
                return Err(Error::Format(format!(
                    "{}: index points at a {:?} block",
                    self.name,
                    br.kind()
                )));
            }
            let mut it = br.seek(key)?;
            match br.next_record(&mut it)? {
                Some(Record::Index(idx)) => off = idx.offset,
                Some(_) => {
                    return Err(Error::Format(format!(
                        "{}: non-index record in an index block",
                        self.name
                    )))
                }
                // Key is past the last indexed block.
                None => return Ok(TableIter::exhausted(self, kind)),
            }
        }
    }

    // ── refs_for ────────────────────────────────────────────────────────────

    /// Uniform shortened key width of the obj section, recovered from its
    /// first record.
    fn obj_id_len(&self) -> Result<usize> {
        let br = self
            .block_at(self.obj_offsets.offset, Some(BlockKind::Obj))?
            .ok_or_else(|| Error::format("obj section start is not an obj block"))?;
        Ok(br.first_key()?.len())
    }

    /// Iterate exactly the refs whose value or target value equals `oid`,
    /// in name order.  Uses the obj index when present, otherwise scans
    /// the whole ref section.
    pub fn refs_for(&self, oid: &[u8]) -> Result<RefsForIter<'_, S>> {
        if !self.obj_offsets.present {
            let iter = self.seek(BlockKind::Ref, b"")?;
            return Ok(RefsForIter {
                oid: oid.to_vec(),
                mode: RefsForMode::Scan(iter),
            });
        }

        let id_len = self.obj_id_len()?.min(oid.len());
        let want = &oid[..id_len];
        let mut it = self.seek(BlockKind::Obj, want)?;
        let offsets = match it.next_record()? {
            Some(Record::Obj(o)) if o.id_prefix == want => o.offsets,
            _ => Vec::new(),
        };
        Ok(RefsForIter {
            oid: oid.to_vec(),
            mode: RefsForMode::Indexed {
                reader: self,
                offsets,
                pos: 0,
                cur: None,
            },
        })
    }
}

// ── Table iterator ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct Cursor {
    off: u64,
    br: BlockReader,
    it: BlockIter,
}

/// Sorted iterator over one section.  Carries its kind; asking it for the
/// wrong record kind is an API error.
#[derive(Debug)]
pub struct TableIter<'r, S: BlockSource> {
    reader: &'r Reader<S>,
    kind: BlockKind,
    cur: Option<Cursor>,
}

impl<'r, S: BlockSource> TableIter<'r, S> {
    fn exhausted(reader: &'r Reader<S>, kind: BlockKind) -> Self {
        TableIter {
            reader,
            kind,
            cur: None,
        }
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        let reader = self.reader;
        loop {
            let Some(cursor) = &mut self.cur else {
                return Ok(None);
            };
            if let Some(rec) = cursor.br.next_record(&mut cursor.it)? {
                return Ok(Some(rec));
            }
            let next_off = cursor.off + cursor.br.full_block_size() as u64;
            self.cur = reader.block_at(next_off, Some(self.kind))?.map(|br| {
                let it = br.start();
                Cursor {
                    off: next_off,
                    br,
                    it,
                }
            });
        }
    }

    /// Next ref record, or `Ok(None)` at the end of the section.
    pub fn next_ref(&mut self) -> Result<Option<RefRecord>> {
        if self.kind != BlockKind::Ref {
            return Err(Error::api("not a ref iterator"));
        }
        match self.next_record()? {
            Some(Record::Ref(r)) => Ok(Some(r)),
            None => Ok(None),
            Some(_) => Err(Error::format("ref iterator decoded a foreign record")),
        }
    }

    /// Next log record, or `Ok(None)` at the end of the section.
    pub fn next_log(&mut self) -> Result<Option<crate::record::LogRecord>> {
        if self.kind != BlockKind::Log {
            return Err(Error::api("not a log iterator"));
        }
        match self.next_record()? {
            Some(Record::Log(l)) => Ok(Some(l)),
            None => Ok(None),
            Some(_) => Err(Error::format("log iterator decoded a foreign record")),
        }
    }

    /// Next obj record, or `Ok(None)` at the end of the section.
    pub fn next_obj(&mut self) -> Result<Option<crate::record::ObjRecord>> {
        if self.kind != BlockKind::Obj {
            return Err(Error::api("not an obj iterator"));
        }
        match self.next_record()? {
            Some(Record::Obj(o)) => Ok(Some(o)),
            None => Ok(None),
            Some(_) => Err(Error::format("obj iterator decoded a foreign record")),
        }
    }
}

// ── refs_for iterator ────────────────────────────────────────────────────────

enum RefsForMode<'r, S: BlockSource> {
    /// Visit exactly the blocks named by the obj record.
    Indexed {
        reader: &'r Reader<S>,
        offsets: Vec<u64>,
        pos: usize,
        cur: Option<(BlockReader, BlockIter)>,
    },
    /// No obj section: filter a full ref scan.
    Scan(TableIter<'r, S>),
}

/// Filtering iterator produced by [`Reader::refs_for`].
pub struct RefsForIter<'r, S: BlockSource> {
    oid: Vec<u8>,
    mode: RefsForMode<'r, S>,
}

impl<S: BlockSource> RefsForIter<'_, S> {
    fn matches(&self, rec: &RefRecord) -> bool {
        rec.value.as_deref() == Some(self.oid.as_slice())
            || rec.target_value.as_deref() == Some(self.oid.as_slice())
    }

    /// Next ref pointing at the requested object, in name order.
    pub fn next_ref(&mut self) -> Result<Option<RefRecord>> {
        loop {
            let rec = match &mut self.mode {
                RefsForMode::Scan(iter) => iter.next_ref()?,
                RefsForMode::Indexed {
                    reader,
                    offsets,
                    pos,
                    cur,
                } => loop {
                    if let Some((br, it)) = cur {
                        match br.next_record(it)? {
                            Some(Record::Ref(r)) => break Some(r),
                            Some(_) => {
                                return Err(Error::format(
                                    "obj index points at a non-ref block",
                                ))
                            }
                            None => *cur = None,
                        }
                    } else {
                        if *pos >= offsets.len() {
                            break None;
                        }
                        let off = offsets[*pos];
                        *pos += 1;
                        match reader.block_at(off, Some(BlockKind::Ref))? {
                            Some(br) => {
                                let it = br.start();
                                *cur = Some((br, it));
                            }
                            None => {
                                return Err(Error::format(
                                    "obj index names a missing ref block",
                                ))
                            }
                        }
                    }
                },
            };
            match rec {
                None => return Ok(None),
                Some(r) if self.matches(&r) => return Ok(Some(r)),
                Some(_) => {}
            }
        }
    }
}
