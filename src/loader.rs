//! Replacement code loading.
//!
//! The object file is mapped as one flat, private, read-write-execute
//! buffer. No relocations are applied: whatever sits at the requested
//! offset is what runs.

use std::{
    fs::File,
    io,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    ptr,
};

use crate::error::{Error, Result};

pub struct MappedObject {
    path: PathBuf,
    ptr: *mut u8,
    len: usize,
    released: bool,
}

// The mapping is owned exclusively and only touched through &mut self.
unsafe impl Send for MappedObject {}

impl MappedObject {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let map_err = |source: io::Error| Error::MapFailed {
            path: path.clone(),
            source,
        };
        let file = File::open(&path).map_err(map_err)?;
        let len = file.metadata().map_err(map_err)?.len() as usize;
        if len == 0 {
            return Err(map_err(io::Error::new(
                io::ErrorKind::InvalidData,
                "object file is empty",
            )));
        }

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(map_err(io::Error::last_os_error()));
        }
        log::info!("Mapped {} at {:p} ({len} bytes)", path.display(), addr);
        // the mapping stays valid after the descriptor is closed
        Ok(Self {
            path,
            ptr: addr.cast(),
            len,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_closed(&self) -> bool {
        self.released
    }

    /// Address of `offset` inside the mapping.
    pub fn entry(&self, offset: usize) -> Result<usize> {
        if self.released {
            return Err(Error::Closed);
        }
        if offset >= self.len {
            return Err(Error::EntryOutOfBounds {
                offset,
                len: self.len,
            });
        }
        Ok(self.ptr as usize + offset)
    }

    /// Unmap the buffer. Later calls do nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if unsafe { libc::munmap(self.ptr.cast(), self.len) } != 0 {
            return Err(Error::MapFailed {
                path: self.path.clone(),
                source: io::Error::last_os_error(),
            });
        }
        log::info!("Unmapped {}", self.path.display());
        Ok(())
    }

    /// Give up the mapping without unmapping it, for code that may still be
    /// reachable.
    pub fn leak(&mut self) {
        if !self.released {
            log::warn!("Leaking {} at {:p}", self.path.display(), self.ptr);
            self.released = true;
        }
    }
}

impl Drop for MappedObject {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("{e}");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;

    pub(crate) fn object_file(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("hotswap-{}-{name}", std::process::id()));
        fs::write(&path, contents).unwrap();
        path
    }

    /// Open and unlink `path`. `None` when the temp dir refuses executable
    /// mappings.
    pub(crate) fn open_or_skip(path: &Path) -> Option<MappedObject> {
        let res = MappedObject::open(path);
        fs::remove_file(path).unwrap();
        match res {
            Ok(object) => Some(object),
            Err(Error::MapFailed { source, .. })
                if matches!(source.raw_os_error(), Some(libc::EPERM | libc::EACCES)) =>
            {
                eprintln!("temp dir is mounted noexec ({source}), skipping");
                None
            }
            Err(e) => panic!("{e}"),
        }
    }

    #[test]
    fn maps_whole_file() {
        let path = object_file("whole", &[0xc3; 100]);
        let Some(object) = open_or_skip(&path) else {
            return;
        };

        assert_eq!(object.len(), 100);
        let bytes = unsafe { std::slice::from_raw_parts(object.as_ptr(), object.len()) };
        assert!(bytes.iter().all(|b| *b == 0xc3));
        assert_eq!(object.entry(10).unwrap(), object.as_ptr() as usize + 10);
    }

    #[test]
    fn entry_must_be_inside() {
        let path = object_file("bounds", &[0x90; 16]);
        let Some(object) = open_or_skip(&path) else {
            return;
        };

        assert!(matches!(
            object.entry(16),
            Err(Error::EntryOutOfBounds { offset: 16, len: 16 })
        ));
    }

    #[test]
    fn close_twice() {
        let path = object_file("close", &[0x90; 16]);
        let Some(mut object) = open_or_skip(&path) else {
            return;
        };

        object.close().unwrap();
        object.close().unwrap();
        assert!(object.is_closed());
        assert!(matches!(object.entry(0), Err(Error::Closed)));
    }

    #[test]
    fn leak_keeps_mapping() {
        let path = object_file("leak", &[0xc3; 32]);
        let Some(mut object) = open_or_skip(&path) else {
            return;
        };
        let (ptr, len) = (object.as_ptr(), object.len());

        object.leak();
        assert!(object.is_closed());
        object.close().unwrap();
        drop(object);

        let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
        assert!(bytes.iter().all(|b| *b == 0xc3));
        unsafe { libc::munmap(ptr as *mut libc::c_void, len) };
    }

    #[test]
    fn missing_file() {
        let err = MappedObject::open("/nonexistent/hotswap.so").err().unwrap();
        assert!(matches!(err, Error::MapFailed { .. }));
    }

    #[test]
    fn empty_file() {
        let path = object_file("empty", b"");
        let err = MappedObject::open(&path).err().unwrap();
        fs::remove_file(&path).unwrap();
        assert!(matches!(err, Error::MapFailed { .. }));
    }
}
