//! Arena construction options.
//!
//! [`Config`] is parsed from a `key=value` config string so callers can pass
//! tuning knobs through a single opaque parameter:
//!
//! ```text
//! "hugepage=transparent,chunk_size=4194304,vm_explicit_commit=1"
//! ```
//!
//! The `PATRIE_HUGEPAGE` environment variable, when set to a non-`0` value,
//! upgrades `hugepage=none` to the transparent strategy at load time.

use crate::error::{Error, Result};

/// Default growth chunk: 2 MiB, one transparent hugepage.
pub const DEFAULT_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Default fastbin ceiling in bytes. Blocks larger than this go to the
/// skiplist of huge free blocks.
pub const DEFAULT_FASTBIN_MAX: usize = 256;

/// OS hugepage strategy for the arena reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HugePage {
    /// Plain pages.
    #[default]
    None,

    /// Reserve with `MAP_HUGETLB`, falling back to plain pages when the
    /// system has no hugepage pool configured.
    Mmap,

    /// Plain reservation plus `madvise(MADV_HUGEPAGE)`.
    Transparent,
}

/// Tuning options for [`Patricia`](crate::Patricia) and its arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Hugepage strategy for the backing reservation.
    pub hugepage: HugePage,

    /// Growth chunk size. Must be a power of two and a multiple of 4 KiB.
    pub chunk_size: usize,

    /// Commit pages eagerly on chunk growth (`madvise(MADV_POPULATE_WRITE)`
    /// on Linux) instead of faulting them in lazily.
    pub vm_explicit_commit: bool,

    /// Fastbin ceiling in bytes. Must be a multiple of the arena alignment
    /// and at least large enough to hold a skiplist block header.
    pub fastbin_max: usize,
}

impl Default for Config {
    fn default() -> Self {
        let mut cfg = Self {
            hugepage: HugePage::None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            vm_explicit_commit: false,
            fastbin_max: DEFAULT_FASTBIN_MAX,
        };
        cfg.apply_env();
        cfg
    }
}

impl Config {
    /// Parse a `key=value,key=value` config string on top of the defaults.
    ///
    /// Recognised keys: `hugepage` (`none` | `mmap` | `transparent`),
    /// `chunk_size` (bytes, power of two), `vm_explicit_commit` (`0` | `1`),
    /// `fastbin_max` (bytes).
    pub fn parse(conf: &str) -> Result<Self> {
        let mut cfg = Self::default();
        for item in conf.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (key, value) = item
                .split_once('=')
                .ok_or(Error::InvalidArgument("config item is not key=value"))?;
            match (key.trim(), value.trim()) {
                ("hugepage", "none" | "kNone") => cfg.hugepage = HugePage::None,
                ("hugepage", "mmap" | "kMmap") => cfg.hugepage = HugePage::Mmap,
                ("hugepage", "transparent" | "kTransparent") => {
                    cfg.hugepage = HugePage::Transparent;
                }
                ("hugepage", _) => {
                    return Err(Error::InvalidArgument("unknown hugepage mode"));
                }
                ("chunk_size", v) => {
                    cfg.chunk_size = v
                        .parse()
                        .map_err(|_| Error::InvalidArgument("chunk_size is not a number"))?;
                }
                ("vm_explicit_commit", v) => cfg.vm_explicit_commit = v != "0",
                ("fastbin_max", v) => {
                    cfg.fastbin_max = v
                        .parse()
                        .map_err(|_| Error::InvalidArgument("fastbin_max is not a number"))?;
                }
                _ => return Err(Error::InvalidArgument("unknown config key")),
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check size constraints. Called by the arena constructor as well, so a
    /// hand-built `Config` goes through the same gate.
    pub(crate) fn validate(&self) -> Result<()> {
        if !self.chunk_size.is_power_of_two() || self.chunk_size < 4096 {
            return Err(Error::InvalidArgument(
                "chunk_size must be a power of two >= 4096",
            ));
        }
        // A freed huge block stores a skiplist header in place.
        if self.fastbin_max < 64 || self.fastbin_max % crate::ALIGN_SIZE != 0 {
            return Err(Error::InvalidArgument(
                "fastbin_max must be a multiple of the alignment, >= 64",
            ));
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if self.hugepage == HugePage::None {
            if let Ok(v) = std::env::var("PATRIE_HUGEPAGE") {
                if v != "0" && !v.is_empty() {
                    self.hugepage = HugePage::Transparent;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_is_default() {
        let cfg = Config::parse("").unwrap();
        assert_eq!(cfg.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(cfg.fastbin_max, DEFAULT_FASTBIN_MAX);
        assert!(!cfg.vm_explicit_commit);
    }

    #[test]
    fn parse_all_keys() {
        let cfg =
            Config::parse("hugepage=kMmap, chunk_size=4194304, vm_explicit_commit=1").unwrap();
        assert_eq!(cfg.hugepage, HugePage::Mmap);
        assert_eq!(cfg.chunk_size, 4 << 20);
        assert!(cfg.vm_explicit_commit);
    }

    #[test]
    fn parse_rejects_bad_chunk() {
        assert!(Config::parse("chunk_size=12345").is_err());
        assert!(Config::parse("chunk_size=1024").is_err());
    }

    #[test]
    fn parse_rejects_unknown_key() {
        assert!(Config::parse("wibble=1").is_err());
        assert!(Config::parse("hugepage=huge").is_err());
    }
}
