use thiserror::Error;

/// Errors raised while reading or writing a compound file.
#[derive(Debug, Error)]
pub enum CfbError {
    /// The 512-byte header is malformed or violates a layout invariant.
    #[error("bad ole: {reason}")]
    InvalidHeader { reason: &'static str },
    /// A sector chain loops, or points outside its allocation table.
    #[error("corrupt chain in {table} starting at sector {start}")]
    CorruptChain { table: &'static str, start: i32 },
    #[error("sector {id} lies outside the container ({len} bytes)")]
    SectorOutOfBounds { id: u32, len: usize },
    #[error("chain starting at sector {start} holds {available} bytes but {needed} are required")]
    ChainTooShort {
        start: i32,
        needed: usize,
        available: usize,
    },
    #[error("invalid directory entry {id}: {reason}")]
    InvalidDirectoryEntry { id: u32, reason: &'static str },
    #[error("not found: {path}")]
    NotFound { path: String },
    #[error("entry `{path}` already exists")]
    AlreadyExists { path: String },
    #[error("`{path}` is not a stream")]
    NotAStream { path: String },
    #[error("`{path}` is not a storage")]
    NotAStorage { path: String },
    #[error("invalid entry name `{name}`: {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("stream `{path}` declares {expected} bytes but its chain holds {actual}")]
    StreamTruncated {
        path: String,
        expected: u64,
        actual: usize,
    },
    #[error("stream of {len} bytes exceeds the size limit of a version {major} container")]
    StreamTooLarge { len: usize, major: u16 },
    #[error("container exceeds the addressable sector range")]
    TooManySectors,
}

pub type Result<T, E = CfbError> = std::result::Result<T, E>;
