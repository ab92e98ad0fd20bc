//! Compound File Binary (CFB / OLE2) containers in memory.
//!
//! This crate supports:
//! - Opening a container: header validation, MSAT/SAT/SSAT loading, directory indexing
//! - Reading streams from full sectors or the mini-stream
//! - Creating containers and writing streams and storages (append-only allocation)
//!
//! Chains are traversed with a step budget, so cyclic tables surface as errors.

mod directory;
mod document;
mod error;
mod header;
mod sector;
mod storage;

pub use directory::{
    compare_names, Directory, DirectoryEntry, EntryId, EntryType, NodeColor, ENTRY_SIZE,
    ROOT_ENTRY_NAME,
};
pub use document::{CompoundDocument, CreateOptions};
pub use error::{CfbError, Result};
pub use header::{Header, HEADER_SIZE, INLINE_MSAT_LEN, MINI_STREAM_CUTOFF, SIGNATURE};
pub use sector::SectorId;
pub use storage::{MiniStream, SectorStorage};

/// Returns `true` if `bytes` starts with the compound file signature.
pub fn is_compound_file(bytes: &[u8]) -> bool {
    bytes.starts_with(&SIGNATURE)
}
