//! Record model — ref, log, obj, and index records.
//!
//! # On-disk envelope (prefix-compressed, shared by every kind)
//!
//! ```text
//! varint shared       bytes of key shared with the previous record
//! varint suffix_len   remaining key bytes
//! suffix              key[shared..]
//! varint extra        low 3 bits = value type, high bits reserved
//! value               kind- and value-type-specific payload
//! ```
//!
//! At a restart point `shared` is 0 and the full key is present.  Every
//! record's encoded length is computable without looking at the next
//! record.
//!
//! # Keys
//!
//! | kind  | key bytes                                  |
//! |-------|--------------------------------------------|
//! | ref   | ref name                                   |
//! | log   | ref name ‖ be64(!update_index)             |
//! | obj   | object id prefix (uniform shortened width) |
//! | index | last key of the pointed-at block           |
//!
//! Negating the update index in the log key makes later updates sort
//! earlier, so iteration visits log entries newest-first per ref.

use crate::coding::{
    common_prefix_len, get_bytes, get_u16, get_u64, get_varint, put_bytes, put_u16, put_u64,
    put_varint,
};
use crate::error::{Error, Result};

// ── Block / record kinds ─────────────────────────────────────────────────────

/// Block type tag.  The numeric value is the on-disk type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockKind {
    Ref = b'r',
    Log = b'l',
    Obj = b'o',
    Index = b'i',
}

impl BlockKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            b'r' => Some(BlockKind::Ref),
            b'l' => Some(BlockKind::Log),
            b'o' => Some(BlockKind::Obj),
            b'i' => Some(BlockKind::Index),
            _ => None,
        }
    }
}

// ── Ref value types ──────────────────────────────────────────────────────────

/// val_type 0: deletion, no payload.
pub const REF_VAL_NONE: u8 = 0;
/// val_type 1: one object id.
pub const REF_VAL_ID: u8 = 1;
/// val_type 2: object id plus peeled target id.
pub const REF_VAL_ID2: u8 = 2;
/// val_type 3: symbolic ref, varint-length-prefixed target name.
pub const REF_VAL_SYMREF: u8 = 3;

/// val_type 0: log deletion, no payload.
pub const LOG_VAL_NONE: u8 = 0;
/// val_type 1: full reflog entry.
pub const LOG_VAL_UPDATE: u8 = 1;

// ── Decode context ───────────────────────────────────────────────────────────

/// Per-table parameters needed to encode and decode records.
#[derive(Debug, Clone, Copy)]
pub struct RecordCtx {
    /// Object id width for this file (20 or 32).
    pub hash_size: usize,
    /// Ref update indices are stored as varint deltas from this bound.
    pub min_update_index: u64,
}

// ── Record types ─────────────────────────────────────────────────────────────

/// A single ref: name → object id binding.
///
/// The value shape mirrors the on-disk tagging: `value` alone is a direct
/// ref, `value` + `target_value` a peeled ref, `target` a symbolic ref,
/// and none of the three a deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefRecord {
    pub ref_name: String,
    pub update_index: u64,
    pub value: Option<Vec<u8>>,
    pub target_value: Option<Vec<u8>>,
    pub target: Option<String>,
}

impl RefRecord {
    pub fn val_type(&self) -> u8 {
        if self.target.is_some() {
            REF_VAL_SYMREF
        } else {
            match (&self.value, &self.target_value) {
                (Some(_), Some(_)) => REF_VAL_ID2,
                (Some(_), None) => REF_VAL_ID,
                _ => REF_VAL_NONE,
            }
        }
    }
}

/// One reflog entry.  Absent old/new ids are written as all-zero ids and
/// decode back as the zero id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogRecord {
    pub ref_name: String,
    pub update_index: u64,
    pub old_hash: Option<Vec<u8>>,
    pub new_hash: Option<Vec<u8>>,
    pub name: String,
    pub email: String,
    pub time: u64,
    pub tz_offset: i16,
    pub message: String,
}

impl LogRecord {
    pub fn is_deletion(&self) -> bool {
        self.old_hash.is_none()
            && self.new_hash.is_none()
            && self.name.is_empty()
            && self.email.is_empty()
            && self.message.is_empty()
            && self.time == 0
            && self.tz_offset == 0
    }
}

/// Object index entry: an object-id prefix and the ref-block offsets where
/// refs pointing at that object live.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjRecord {
    pub id_prefix: Vec<u8>,
    /// Ascending, deduplicated block offsets.
    pub offsets: Vec<u64>,
}

/// Section-index entry: last key of a block → that block's file offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexRecord {
    pub last_key: Vec<u8>,
    pub offset: u64,
}

/// Tagged union over the four record kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Ref(RefRecord),
    Log(LogRecord),
    Obj(ObjRecord),
    Index(IndexRecord),
}

/// Build the composite log key for a name and update index.
pub fn log_key(ref_name: &str, update_index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(ref_name.len() + 8);
    key.extend_from_slice(ref_name.as_bytes());
    let mut inv = [0u8; 8];
    put_u64(&mut inv, !update_index);
    key.extend_from_slice(&inv);
    key
}

impl Record {
    pub fn kind(&self) -> BlockKind {
        match self {
            Record::Ref(_) => BlockKind::Ref,
            Record::Log(_) => BlockKind::Log,
            Record::Obj(_) => BlockKind::Obj,
            Record::Index(_) => BlockKind::Index,
        }
    }

    pub fn key(&self) -> Vec<u8> {
        match self {
            Record::Ref(r) => r.ref_name.as_bytes().to_vec(),
            Record::Log(l) => log_key(&l.ref_name, l.update_index),
            Record::Obj(o) => o.id_prefix.clone(),
            Record::Index(i) => i.last_key.clone(),
        }
    }

    pub fn val_type(&self) -> u8 {
        match self {
            Record::Ref(r) => r.val_type(),
            Record::Log(l) => {
                if l.is_deletion() {
                    LOG_VAL_NONE
                } else {
                    LOG_VAL_UPDATE
                }
            }
            Record::Obj(_) | Record::Index(_) => 0,
        }
    }

    /// Append the prefix-compressed form to `out`.  `prev_key` is the full
    /// key of the preceding record, or empty at a restart point.
    pub fn encode(&self, out: &mut Vec<u8>, prev_key: &[u8], ctx: RecordCtx) {
        let key = self.key();
        let shared = common_prefix_len(prev_key, &key);
        put_varint(out, shared as u64);
        put_varint(out, (key.len() - shared) as u64);
        out.extend_from_slice(&key[shared..]);
        put_varint(out, u64::from(self.val_type()));
        self.encode_value(out, ctx);
    }

    fn encode_value(&self, out: &mut Vec<u8>, ctx: RecordCtx) {
        match self {
            Record::Ref(r) => {
                put_varint(out, r.update_index - ctx.min_update_index);
                match r.val_type() {
                    REF_VAL_ID => out.extend_from_slice(r.value.as_deref().unwrap()),
                    REF_VAL_ID2 => {
                        out.extend_from_slice(r.value.as_deref().unwrap());
                        out.extend_from_slice(r.target_value.as_deref().unwrap());
                    }
                    REF_VAL_SYMREF => {
                        put_bytes(out, r.target.as_deref().unwrap().as_bytes());
                    }
                    _ => {}
                }
            }
            Record::Log(l) => {
                if l.is_deletion() {
                    return;
                }
                put_id_or_zero(out, l.old_hash.as_deref(), ctx.hash_size);
                put_id_or_zero(out, l.new_hash.as_deref(), ctx.hash_size);
                put_bytes(out, l.name.as_bytes());
                put_bytes(out, l.email.as_bytes());
                put_varint(out, l.time);
                let mut tz = [0u8; 2];
                put_u16(&mut tz, l.tz_offset as u16);
                out.extend_from_slice(&tz);
                put_bytes(out, l.message.as_bytes());
            }
            Record::Obj(o) => {
                put_varint(out, o.offsets.len() as u64);
                let mut prev = 0u64;
                for (i, &off) in o.offsets.iter().enumerate() {
                    put_varint(out, if i == 0 { off } else { off - prev });
                    prev = off;
                }
            }
            Record::Index(i) => {
                put_varint(out, i.offset);
            }
        }
    }

    /// Decode one record of `kind` from the front of `inp`.  Returns the
    /// record, its full key, and the number of bytes consumed.
    pub fn decode(
        kind: BlockKind,
        inp: &[u8],
        prev_key: &[u8],
        ctx: RecordCtx,
    ) -> Result<(Record, Vec<u8>, usize)> {
        let mut pos = 0usize;
        let (shared, n) = get_varint(&inp[pos..])?;
        pos += n;
        let (suffix_len, n) = get_varint(&inp[pos..])?;
        pos += n;
        let shared = shared as usize;
        let suffix_len = suffix_len as usize;
        if shared > prev_key.len() {
            return Err(Error::format("shared prefix exceeds previous key"));
        }
        if inp.len() < pos + suffix_len {
            return Err(Error::format("key suffix overruns block"));
        }
        let mut key = Vec::with_capacity(shared + suffix_len);
        key.extend_from_slice(&prev_key[..shared]);
        key.extend_from_slice(&inp[pos..pos + suffix_len]);
        pos += suffix_len;
        let (extra, n) = get_varint(&inp[pos..])?;
        pos += n;
        let val_type = (extra & 0x7) as u8;

        let rec = match kind {
            BlockKind::Ref => {
                let (rec, n) = decode_ref_value(&key, val_type, &inp[pos..], ctx)?;
                pos += n;
                rec
            }
            BlockKind::Log => {
                let (rec, n) = decode_log_value(&key, val_type, &inp[pos..], ctx)?;
                pos += n;
                rec
            }
            BlockKind::Obj => {
                let (rec, n) = decode_obj_value(&key, &inp[pos..])?;
                pos += n;
                rec
            }
            BlockKind::Index => {
                let (offset, n) = get_varint(&inp[pos..])?;
                pos += n;
                Record::Index(IndexRecord {
                    last_key: key.clone(),
                    offset,
                })
            }
        };
        Ok((rec, key, pos))
    }
}

fn put_id_or_zero(out: &mut Vec<u8>, id: Option<&[u8]>, hash_size: usize) {
    match id {
        Some(b) => out.extend_from_slice(b),
        None => out.extend(std::iter::repeat(0u8).take(hash_size)),
    }
}

fn take_id(inp: &[u8], hash_size: usize) -> Result<&[u8]> {
    if inp.len() < hash_size {
        return Err(Error::format("object id overruns block"));
    }
    Ok(&inp[..hash_size])
}

fn decode_ref_value(
    key: &[u8],
    val_type: u8,
    inp: &[u8],
    ctx: RecordCtx,
) -> Result<(Record, usize)> {
    let ref_name = String::from_utf8(key.to_vec())
        .map_err(|_| Error::format("ref name is not valid UTF-8"))?;
    let mut pos = 0usize;
    let (delta, n) = get_varint(inp)?;
    pos += n;
    let mut rec = RefRecord {
        ref_name,
        update_index: ctx.min_update_index + delta,
        ..Default::default()
    };
    match val_type {
        REF_VAL_NONE => {}
        REF_VAL_ID => {
            rec.value = Some(take_id(&inp[pos..], ctx.hash_size)?.to_vec());
            pos += ctx.hash_size;
        }
        REF_VAL_ID2 => {
            rec.value = Some(take_id(&inp[pos..], ctx.hash_size)?.to_vec());
            pos += ctx.hash_size;
            rec.target_value = Some(take_id(&inp[pos..], ctx.hash_size)?.to_vec());
            pos += ctx.hash_size;
        }
        REF_VAL_SYMREF => {
            let (b, n) = get_bytes(&inp[pos..])?;
            rec.target = Some(
                String::from_utf8(b.to_vec())
                    .map_err(|_| Error::format("symref target is not valid UTF-8"))?,
            );
            pos += n;
        }
        t => return Err(Error::Format(format!("unknown ref value type {t}"))),
    }
    Ok((Record::Ref(rec), pos))
}

fn decode_log_value(
    key: &[u8],
    val_type: u8,
    inp: &[u8],
    ctx: RecordCtx,
) -> Result<(Record, usize)> {
    if key.len() < 8 {
        return Err(Error::format("log key shorter than its update index"));
    }
    let (name_bytes, inv) = key.split_at(key.len() - 8);
    let ref_name = String::from_utf8(name_bytes.to_vec())
        .map_err(|_| Error::format("ref name is not valid UTF-8"))?;
    let update_index = !get_u64(inv);
    let mut rec = LogRecord {
        ref_name,
        update_index,
        ..Default::default()
    };
    if val_type == LOG_VAL_NONE {
        return Ok((Record::Log(rec), 0));
    }
    if val_type != LOG_VAL_UPDATE {
        return Err(Error::Format(format!("unknown log value type {val_type}")));
    }
    let mut pos = 0usize;
    rec.old_hash = Some(take_id(&inp[pos..], ctx.hash_size)?.to_vec());
    pos += ctx.hash_size;
    rec.new_hash = Some(take_id(&inp[pos..], ctx.hash_size)?.to_vec());
    pos += ctx.hash_size;
    let (b, n) = get_bytes(&inp[pos..])?;
    rec.name =
        String::from_utf8(b.to_vec()).map_err(|_| Error::format("committer name not UTF-8"))?;
    pos += n;
    let (b, n) = get_bytes(&inp[pos..])?;
    rec.email =
        String::from_utf8(b.to_vec()).map_err(|_| Error::format("committer email not UTF-8"))?;
    pos += n;
    let (time, n) = get_varint(&inp[pos..])?;
    rec.time = time;
    pos += n;
    if inp.len() < pos + 2 {
        return Err(Error::format("log tz offset overruns block"));
    }
    rec.tz_offset = get_u16(&inp[pos..]) as i16;
    pos += 2;
    let (b, n) = get_bytes(&inp[pos..])?;
    rec.message =
        String::from_utf8(b.to_vec()).map_err(|_| Error::format("log message not UTF-8"))?;
    pos += n;
    Ok((Record::Log(rec), pos))
}

fn decode_obj_value(key: &[u8], inp: &[u8]) -> Result<(Record, usize)> {
    let mut pos = 0usize;
    let (count, n) = get_varint(inp)?;
    pos += n;
    let mut offsets = Vec::with_capacity(count as usize);
    let mut prev = 0u64;
    for i in 0..count {
        let (v, n) = get_varint(&inp[pos..])?;
        pos += n;
        let off = if i == 0 { v } else { prev + v };
        offsets.push(off);
        prev = off;
    }
    Ok((
        Record::Obj(ObjRecord {
            id_prefix: key.to_vec(),
            offsets,
        }),
        pos,
    ))
}
