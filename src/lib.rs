//! # patrie
//!
//! A concurrent in-memory Patricia trie with a thread-cached arena
//! allocator.
//!
//! Keys are byte strings, values are opaque fixed-size byte blocks declared
//! at construction. Everything lives in one offset-addressed arena, so the
//! whole structure can be dumped and reopened as a position-independent
//! image.
//!
//! ## Design
//!
//! - Node edits (`fork`, `split`, `mark_final`, `add_state_move`) build
//!   fully-initialised replacement nodes and publish them with a single CAS,
//!   so readers never lock.
//! - Allocation goes through per-thread caches (exact-size fastbins, a
//!   skiplist of huge free blocks, a private bump region) over one shared
//!   growable reservation.
//! - Reclamation is token-based: readers and writers hold tokens whose
//!   acquire-time verseq bounds what the retirement queue may recycle.
//!
//! ## Example
//!
//! ```rust
//! use patrie::{ConcurrentLevel, Patricia};
//!
//! let trie = Patricia::new(4, 1 << 20, ConcurrentLevel::OneWriteMultiRead).unwrap();
//! let mut writer = trie.writer_token();
//! writer.acquire();
//! assert!(writer.insert(b"hello", &7u32.to_le_bytes()).unwrap());
//! assert!(writer.lookup(b"hello"));
//! assert_eq!(writer.value().unwrap(), 7u32.to_le_bytes());
//! writer.release();
//! ```

/// Arena alignment: every allocation size and offset is a multiple of this,
/// and scaled 32-bit links address `4 GiB * ALIGN_SIZE` of arena.
pub const ALIGN_SIZE: usize = 4;

mod buffer;
pub mod config;
pub mod error;
mod iter;
mod node;
pub mod ordering;
mod persist;
mod pool;
mod thread_cache;
mod token;
pub(crate) mod tracing_helpers;
mod trie;

pub use config::{Config, HugePage};
pub use error::{Error, Result};
pub use iter::CursorToken;
pub use pool::TcArena;
pub use token::TokenState;
pub use trie::{ConcurrentLevel, MemStat, Patricia, ReaderToken, Stat, WriterToken};
