//! Frozen per-module fragment caches. A cache file carries a magic +
//! version header, the identity of the module it was frozen from (path
//! plus an ELF-derived digest), a table of {application offset, cache
//! offset, size} entries, and the raw frozen bytes. Files are mapped (or
//! read) at load and their entries form a third lookup partition; the
//! engine validates frozen bytes against the live module before trusting
//! an entry.

use crate::app_pc::AppPc;
use crate::log::LogLevel::LogDebug;
use serde::Serialize;
use std::convert::TryInto;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

pub const PCACHE_MAGIC: [u8; 4] = *b"DRPC";
pub const PCACHE_VERSION: u32 = 1;

#[derive(Debug)]
pub enum PersistError {
    Io(io::Error),
    BadMagic,
    BadVersion(u32),
    Truncated,
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PersistError::Io(e) => write!(f, "{}", e),
            PersistError::BadMagic => write!(f, "not a frozen-cache file"),
            PersistError::BadVersion(v) => write!(f, "unsupported frozen-cache version {}", v),
            PersistError::Truncated => write!(f, "frozen-cache file truncated"),
        }
    }
}

impl From<io::Error> for PersistError {
    fn from(e: io::Error) -> PersistError {
        PersistError::Io(e)
    }
}

/// What makes a frozen cache bind only to the module it was made from.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModuleIdentity {
    pub path: String,
    pub digest: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct PersistEntry {
    pub app_offset: u64,
    pub cache_offset: u64,
    pub size: u64,
}

#[derive(Debug)]
pub struct PersistedModule {
    pub identity: ModuleIdentity,
    /// Sorted by application offset.
    pub entries: Vec<PersistEntry>,
    pub bytes: Vec<u8>,
    /// Load address of the module this run; null until bound.
    pub base: AppPc,
}

impl PersistedModule {
    pub fn with_base(mut self, base: AppPc) -> PersistedModule {
        self.base = base;
        self
    }

    /// Frozen bytes for the entry starting exactly at `tag`, as
    /// (offset-into-bytes, size).
    pub fn entry_covering(&self, tag: AppPc) -> Option<(usize, usize)> {
        if self.base.is_null() || tag < self.base {
            return None;
        }
        let off = tag.offset_from(self.base) as u64;
        self.entries
            .binary_search_by(|e| e.app_offset.cmp(&off))
            .ok()
            .map(|i| {
                let e = &self.entries[i];
                (e.cache_offset as usize, e.size as usize)
            })
    }
}

fn fnv1a(seed: u64, bytes: &[u8]) -> u64 {
    let mut hash = seed ^ 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Compute the identity of the module at `path`. ELF header fields pin
/// the identity to the build; non-ELF files fall back to a plain
/// content digest.
pub fn module_identity(path: &Path) -> Result<ModuleIdentity, PersistError> {
    let bytes = fs::read(path)?;
    let head = &bytes[..bytes.len().min(4096)];
    let digest = match goblin::elf::Elf::parse(&bytes) {
        Ok(elf) => {
            let mut seed = elf.header.e_entry;
            seed = seed
                .wrapping_mul(31)
                .wrapping_add(elf.header.e_machine as u64);
            seed = seed
                .wrapping_mul(31)
                .wrapping_add(elf.section_headers.len() as u64);
            fnv1a(seed, head)
        }
        Err(_) => fnv1a(0, head),
    };
    Ok(ModuleIdentity {
        path: path.to_string_lossy().into_owned(),
        digest,
    })
}

/// Serialize a frozen cache. Layout, little-endian throughout:
/// magic | version u32 | digest u64 | path_len u32 | path |
/// entry_count u32 | entries (3 x u64 each) | bytes_len u64 | bytes.
pub fn write_module_cache(
    out_path: &Path,
    identity: &ModuleIdentity,
    entries: &[PersistEntry],
    bytes: &[u8],
) -> io::Result<()> {
    let mut out = Vec::new();
    out.extend_from_slice(&PCACHE_MAGIC);
    out.extend_from_slice(&PCACHE_VERSION.to_le_bytes());
    out.extend_from_slice(&identity.digest.to_le_bytes());
    let path_bytes = identity.path.as_bytes();
    out.extend_from_slice(&(path_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(path_bytes);
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for e in entries {
        out.extend_from_slice(&e.app_offset.to_le_bytes());
        out.extend_from_slice(&e.cache_offset.to_le_bytes());
        out.extend_from_slice(&e.size.to_le_bytes());
    }
    out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(bytes);
    let mut file = fs::File::create(out_path)?;
    file.write_all(&out)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], PersistError> {
        if self.pos + n > self.data.len() {
            return Err(PersistError::Truncated);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, PersistError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, PersistError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

pub fn read_module_cache(path: &Path) -> Result<PersistedModule, PersistError> {
    let data = fs::read(path)?;
    let mut r = Reader {
        data: &data,
        pos: 0,
    };
    if r.take(4)? != PCACHE_MAGIC {
        return Err(PersistError::BadMagic);
    }
    let version = r.u32()?;
    if version != PCACHE_VERSION {
        return Err(PersistError::BadVersion(version));
    }
    let digest = r.u64()?;
    let path_len = r.u32()? as usize;
    let module_path = String::from_utf8_lossy(r.take(path_len)?).into_owned();
    let entry_count = r.u32()? as usize;
    let mut entries = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        entries.push(PersistEntry {
            app_offset: r.u64()?,
            cache_offset: r.u64()?,
            size: r.u64()?,
        });
    }
    entries.sort_by_key(|e| e.app_offset);
    let bytes_len = r.u64()? as usize;
    let bytes = r.take(bytes_len)?.to_vec();
    log!(
        LogDebug,
        "loaded frozen cache for {} ({} entries, {} bytes)",
        module_path,
        entries.len(),
        bytes.len()
    );
    Ok(PersistedModule {
        identity: ModuleIdentity {
            path: module_path,
            digest,
        },
        entries,
        bytes,
        base: AppPc::null(),
    })
}
