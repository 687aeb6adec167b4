//! # reftable — reftable ref-storage format reference implementation
//!
//! Format guarantees (frozen in v1):
//! - All fixed-width integers are big-endian; varints are LEB128
//! - Every block is self-describing: a type byte plus a u24 length
//! - Records are prefix-compressed; every restart point stores a full key
//! - Within each section keys are strictly ascending, across blocks too
//! - Log blocks are zlib-deflated after the 4-byte block prefix and carry
//!   their *uncompressed* length; they are never padded
//! - Log keys embed the bitwise-negated update index, so per-ref history
//!   iterates newest-first
//! - The footer repeats the header, records six section offsets (0 means
//!   absent), and is CRC32-guarded; files are immutable once closed
//! - The object index maps ids, shortened to a uniform minimal unique
//!   prefix of at least 2 bytes, to the ref blocks that mention them

pub mod block;
pub mod coding;
pub mod error;
pub mod layout;
pub mod reader;
pub mod record;
pub mod source;
pub mod writer;

// Flat re-exports for the most common types.
pub use error::{Error, Result};
pub use layout::{Footer, Header, FOOTER_SIZE, HEADER_SIZE, MAGIC, MAX_BLOCK_SIZE};
pub use reader::{Reader, RefsForIter, SectionOffsets, TableIter};
pub use record::{BlockKind, LogRecord, ObjRecord, Record, RefRecord};
pub use source::{BlockSource, BufSource, FileSource};
pub use writer::{SectionStats, Stats, WriteOptions, Writer};
