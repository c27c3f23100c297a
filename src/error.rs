//! Typed error kinds returned by the tree model, dump parser, and store populator.

use thiserror::Error;

/// Everything that can go wrong building or populating a composefs image,
/// short of the allocator giving up (which Rust handles by aborting, not
/// by returning a value here).
#[derive(Error, Debug)]
pub enum CfsError {
    #[error("malformed escape sequence")]
    MalformedEscape,

    #[error("invalid hex digest")]
    InvalidHexDigest,

    #[error("invalid integer field: {0:?}")]
    InvalidInteger(String),

    #[error("invalid mtime field: {0:?}")]
    InvalidMtime(String),

    #[error("content length {actual} doesn't match size {expected}")]
    ContentSizeMismatch { expected: u64, actual: u64 },

    #[error("directories can't be hardlinks")]
    HardlinkIsDir,

    #[error("no target at {0:?} for hardlink")]
    DanglingHardlink(String),

    #[error("can't have multiple roots")]
    MultipleRoots,

    #[error("root entry must be a directory")]
    RootNotDirectory,

    #[error("parent directory missing for {0:?}")]
    MissingParent(String),

    #[error("path {0:?} already exists")]
    AlreadyExists(String),

    #[error("duplicate xattr key")]
    DuplicateXattr,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CfsError>;

/// A parse failure, tagged with the 1-based ordinal of the record that
/// caused it so callers can point users at the offending line.
#[derive(Error, Debug)]
#[error("record {record}: {source}")]
pub struct ParseError {
    pub record: u64,
    #[source]
    pub source: CfsError,
}
