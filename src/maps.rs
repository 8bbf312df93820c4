//! Address-space map lookups backed by `/proc/<pid>/maps`.
//!
//! The map is read again on every query. Mappings change under us all the
//! time, so a result is only a snapshot of the moment it was taken.

use std::{
    ffi::OsStr,
    fs,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use atoi::FromRadix16;
use bstr::ByteSlice;

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub shared: bool,
}

impl Permissions {
    pub const RWX: Self = Self {
        read: true,
        write: true,
        exec: true,
        shared: false,
    };

    /// Parse the `rwxp` column.
    fn parse(field: &[u8]) -> Option<Self> {
        let [r, w, x, p] = field else {
            return None;
        };
        Some(Self {
            read: *r == b'r',
            write: *w == b'w',
            exec: *x == b'x',
            shared: *p == b's',
        })
    }

    /// Protection bits for `mprotect`/`mmap`.
    pub fn to_prot(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.read {
            prot |= libc::PROT_READ;
        }
        if self.write {
            prot |= libc::PROT_WRITE;
        }
        if self.exec {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// One line of a maps file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: usize,
    pub len: usize,
    pub perms: Permissions,
    /// Offset into the backing file.
    pub offset: u64,
    /// Backing file or pseudo name like `[heap]`.
    pub path: Option<PathBuf>,
}

impl MemoryRegion {
    pub const fn end(&self) -> usize {
        self.base + self.len
    }

    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Check that `[addr, addr + len)` lies entirely inside this region.
    pub fn contains_range(&self, addr: usize, len: usize) -> bool {
        match addr.checked_add(len) {
            Some(end) => self.contains(addr) && end <= self.end(),
            None => false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemoryMap {
    regions: Vec<MemoryRegion>,
}

impl MemoryMap {
    /// Snapshot of the calling process.
    pub fn current() -> Result<Self> {
        Self::read("/proc/self/maps")
    }

    pub fn of_pid(pid: i32) -> Result<Self> {
        Self::read(format!("/proc/{pid}/maps"))
    }

    fn read(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read(path.as_ref())?;
        Ok(Self::parse(&contents))
    }

    /// Parse maps text. Lines that don't look like a mapping are skipped.
    pub fn parse(contents: &[u8]) -> Self {
        let mut regions = Vec::new();
        for line in contents.lines() {
            if line.trim_ascii().is_empty() {
                continue;
            }
            match parse_line(line) {
                Some(region) => regions.push(region),
                None => log::debug!("skipping maps line: {}", line.as_bstr()),
            }
        }
        Self { regions }
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn find(&self, addr: usize) -> Option<&MemoryRegion> {
        self.regions.iter().find(|region| region.contains(addr))
    }

    /// Start of the mapping of `path` at file offset zero.
    pub fn load_base(&self, path: &Path) -> Option<usize> {
        self.regions
            .iter()
            .filter(|region| region.offset == 0 && region.path.as_deref() == Some(path))
            .map(|region| region.base)
            .min()
    }
}

/// Find the region of the calling process containing `addr`.
pub fn find_region(addr: usize) -> Result<MemoryRegion> {
    MemoryMap::current()?
        .find(addr)
        .cloned()
        .ok_or(Error::RegionNotFound(addr))
}

/// Separated into function due to option spam
fn parse_line(line: &[u8]) -> Option<MemoryRegion> {
    let (range, rest) = next_field(line)?;
    let (perms, rest) = next_field(rest)?;
    let (offset, rest) = next_field(rest)?;
    let (_dev, rest) = next_field(rest)?;
    let (_inode, rest) = next_field(rest)?;

    let (start, end) = range.split_once_str(b"-")?;
    let start = parse_hex::<usize>(start)?;
    let end = parse_hex::<usize>(end)?;
    if end <= start {
        return None;
    }
    let path = rest.trim_ascii();
    let path = (!path.is_empty()).then(|| PathBuf::from(OsStr::from_bytes(path)));

    Some(MemoryRegion {
        base: start,
        len: end - start,
        perms: Permissions::parse(perms)?,
        offset: parse_hex::<u64>(offset)?,
        path,
    })
}

fn next_field(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    let buf = buf.trim_start();
    if buf.is_empty() {
        return None;
    }
    match buf.find_byteset(b" \t") {
        Some(end) => Some((&buf[..end], &buf[end..])),
        None => Some((buf, &[])),
    }
}

fn parse_hex<T: FromRadix16>(digits: &[u8]) -> Option<T> {
    let (value, used) = T::from_radix_16(digits);
    (used == digits.len() && used > 0).then_some(value)
}
