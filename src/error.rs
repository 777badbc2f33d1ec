//! Error types for trie and arena operations.

use std::fmt as StdFmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by [`Patricia`](crate::Patricia) and the arena.
///
/// Arena exhaustion during `insert` is deliberately *not* reported through
/// this enum: the insert returns `Ok(true)` with no value attached to the
/// writer token, mirroring the miss/OOM distinction of the wire-compatible
/// interface. See [`WriterToken::has_value`](crate::WriterToken::has_value).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An explicit allocation request could not be satisfied.
    OutOfMemory,

    /// Mutation attempted on a frozen trie. No state change occurred.
    Readonly,

    /// Caller-side misuse: oversized key, mismatched value size, or a token
    /// that belongs to a different trie.
    InvalidArgument(&'static str),

    /// A persisted image failed validation at open.
    Corruption(&'static str),
}

impl StdFmt::Display for Error {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "arena memory exhausted"),

            Self::Readonly => write!(f, "trie is readonly"),

            Self::InvalidArgument(what) => write!(f, "invalid argument: {what}"),

            Self::Corruption(what) => write!(f, "corrupt image: {what}"),
        }
    }
}

impl std::error::Error for Error {}
