//! Arena image persistence.
//!
//! An image is a 128-byte header followed by the arena bytes `[0, used)`.
//! Every reference inside the arena is an offset, so the image is
//! position-independent: reopening maps (or copies) the bytes and reattaches
//! the root offset. A reopened trie is always `NoWriteReadOnly`.
//!
//! Header layout, little-endian:
//!
//! ```text
//! magic      8B  "PATRIE01"
//! align      4B
//! valsize    4B
//! level      1B + 7B pad
//! used       8B
//! verseq     8B
//! root       8B  (scaled offset; TAIL when empty)
//! n_words    8B
//! stat       4 x 8B
//! reserved   32B
//! checksum   8B  FNV-1a over the preceding 120 bytes
//! ```

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

#[cfg(unix)]
use crate::buffer::Buffer;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::node::scaled_to_pos;
use crate::pool::TcArena;
use crate::thread_cache::TAIL;
use crate::trie::{ConcurrentLevel, Patricia, Stat};
use crate::ALIGN_SIZE;

const MAGIC: [u8; 8] = *b"PATRIE01";
pub(crate) const HEADER_LEN: usize = 128;

struct ImageHeader {
    valsize: usize,
    level: ConcurrentLevel,
    used: usize,
    verseq: u64,
    root: u32,
    n_words: usize,
    stat: Stat,
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h = 0xcbf2_9ce4_8422_2325u64;
    for &b in bytes {
        h ^= u64::from(b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

impl ImageHeader {
    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..8].copy_from_slice(&MAGIC);
        out[8..12].copy_from_slice(&(ALIGN_SIZE as u32).to_le_bytes());
        out[12..16].copy_from_slice(&(self.valsize as u32).to_le_bytes());
        out[16] = self.level as u8;
        out[24..32].copy_from_slice(&(self.used as u64).to_le_bytes());
        out[32..40].copy_from_slice(&self.verseq.to_le_bytes());
        out[40..48].copy_from_slice(&u64::from(self.root).to_le_bytes());
        out[48..56].copy_from_slice(&(self.n_words as u64).to_le_bytes());
        out[56..64].copy_from_slice(&(self.stat.n_fork as u64).to_le_bytes());
        out[64..72].copy_from_slice(&(self.stat.n_split as u64).to_le_bytes());
        out[72..80].copy_from_slice(&(self.stat.n_mark_final as u64).to_le_bytes());
        out[80..88].copy_from_slice(&(self.stat.n_add_state_move as u64).to_le_bytes());
        let sum = fnv1a(&out[..HEADER_LEN - 8]);
        out[HEADER_LEN - 8..].copy_from_slice(&sum.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Corruption("image shorter than its header"));
        }
        if bytes[0..8] != MAGIC {
            return Err(Error::Corruption("bad magic"));
        }
        let sum = u64::from_le_bytes(bytes[HEADER_LEN - 8..HEADER_LEN].try_into().expect("8B"));
        if sum != fnv1a(&bytes[..HEADER_LEN - 8]) {
            return Err(Error::Corruption("header checksum mismatch"));
        }
        let align = u32::from_le_bytes(bytes[8..12].try_into().expect("4B")) as usize;
        if align != ALIGN_SIZE {
            return Err(Error::Corruption("alignment mismatch"));
        }
        let valsize = u32::from_le_bytes(bytes[12..16].try_into().expect("4B")) as usize;
        let level = match bytes[16] {
            0 => ConcurrentLevel::NoWriteReadOnly,
            1 => ConcurrentLevel::SingleThreadStrict,
            2 => ConcurrentLevel::SingleThreadShared,
            3 => ConcurrentLevel::OneWriteMultiRead,
            4 => ConcurrentLevel::MultiWriteMultiRead,
            _ => return Err(Error::Corruption("unknown concurrency level")),
        };
        let used = u64::from_le_bytes(bytes[24..32].try_into().expect("8B")) as usize;
        let verseq = u64::from_le_bytes(bytes[32..40].try_into().expect("8B"));
        let root64 = u64::from_le_bytes(bytes[40..48].try_into().expect("8B"));
        if root64 > u64::from(u32::MAX) {
            return Err(Error::Corruption("root offset out of range"));
        }
        let root = root64 as u32;
        if root != TAIL && scaled_to_pos(root) >= used {
            return Err(Error::Corruption("root offset escapes the arena"));
        }
        let n_words = u64::from_le_bytes(bytes[48..56].try_into().expect("8B")) as usize;
        let stat = Stat {
            n_fork: u64::from_le_bytes(bytes[56..64].try_into().expect("8B")) as usize,
            n_split: u64::from_le_bytes(bytes[64..72].try_into().expect("8B")) as usize,
            n_mark_final: u64::from_le_bytes(bytes[72..80].try_into().expect("8B")) as usize,
            n_add_state_move: u64::from_le_bytes(bytes[80..88].try_into().expect("8B")) as usize,
        };
        Ok(Self {
            valsize,
            level,
            used,
            verseq,
            root,
            n_words,
            stat,
        })
    }
}

impl Patricia {
    fn image_header(&self) -> ImageHeader {
        ImageHeader {
            valsize: self.get_valsize(),
            level: self.concurrent_level(),
            used: self.mem_size(),
            verseq: self.verseq_now(),
            root: self.root_scaled(),
            n_words: self.num_words(),
            stat: self.trie_stat(),
        }
    }

    /// Dump the trie image to a sink: header plus arena bytes.
    ///
    /// The trie must be quiescent; freeze it first when in doubt. The image
    /// of a frozen trie reopens to bit-identical behaviour.
    pub fn save_to_writer<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        let header = self.image_header().encode();
        out.write_all(&header)?;
        // SAFETY: quiescence is the documented caller contract.
        out.write_all(unsafe { self.pool().as_slice() })?;
        Ok(())
    }

    /// Dump the trie image to a file.
    pub fn save_mmap<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        self.save_to_writer(&mut file)?;
        file.flush()
    }

    /// Reopen a saved image for readonly use, copying the arena bytes into
    /// a fresh reservation.
    pub fn open_from_bytes(bytes: &[u8]) -> Result<Arc<Self>> {
        let header = ImageHeader::decode(bytes)?;
        if bytes.len() - HEADER_LEN < header.used {
            return Err(Error::Corruption("image truncated"));
        }
        let cfg = Config::default();
        let pool = TcArena::new(header.used.max(cfg.chunk_size), &cfg)?;
        let mut grown = 0usize;
        while grown < header.used {
            let Some((_, len)) = pool.chunk_grow_for_image(header.used - grown) else {
                return Err(Error::OutOfMemory);
            };
            grown += len;
        }
        // SAFETY: freshly reserved region, no other references yet.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes[HEADER_LEN..HEADER_LEN + header.used].as_ptr(),
                pool.base(),
                header.used,
            );
        }
        Ok(Arc::new(Self::assemble(
            pool,
            header.valsize,
            ConcurrentLevel::NoWriteReadOnly,
            header.root,
            header.verseq,
            header.n_words,
            header.stat,
        )))
    }

    /// Reopen a saved image by mapping the file readonly.
    #[cfg(unix)]
    pub fn open_mmap<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::File::open(path).map_err(|_| Error::Corruption("cannot open"))?;
        let file_len = file
            .metadata()
            .map_err(|_| Error::Corruption("cannot stat"))?
            .len() as usize;
        if file_len < HEADER_LEN {
            return Err(Error::Corruption("image shorter than its header"));
        }
        // SAFETY: fresh private readonly mapping of the whole file.
        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                file_len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(Error::Corruption("mmap failed"));
        }
        let map = map.cast::<u8>();
        // SAFETY: the mapping covers file_len bytes.
        let header_bytes = unsafe { std::slice::from_raw_parts(map, HEADER_LEN) };
        let header = match ImageHeader::decode(header_bytes) {
            Ok(h) => h,
            Err(e) => {
                // SAFETY: mapping created above.
                unsafe { libc::munmap(map.cast(), file_len) };
                return Err(e);
            }
        };
        if file_len - HEADER_LEN < header.used {
            // SAFETY: mapping created above.
            unsafe { libc::munmap(map.cast(), file_len) };
            return Err(Error::Corruption("image truncated"));
        }
        let buffer = Buffer::from_file_map(map, file_len, HEADER_LEN, header.used);
        let pool = TcArena::from_buffer(buffer, &Config::default());
        Ok(Arc::new(Self::assemble(
            pool,
            header.valsize,
            ConcurrentLevel::NoWriteReadOnly,
            header.root,
            header.verseq,
            header.n_words,
            header.stat,
        )))
    }

    /// Reopen a saved image; on platforms without `mmap` the file is read
    /// and copied.
    #[cfg(not(unix))]
    pub fn open_mmap<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let bytes = std::fs::read(path).map_err(|_| Error::Corruption("cannot read"))?;
        Self::open_from_bytes(&bytes)
    }
}
