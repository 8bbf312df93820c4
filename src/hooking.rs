//! Hot-patching functions of the calling process.
//!
//! Nothing stops another thread from running the target while its first
//! bytes are being swapped. Callers have to make sure no thread is inside
//! the first [`STUB_LEN`] bytes of the function at that moment.

use std::{io, path::Path, ptr, sync::Mutex};

use crate::{
    error::{Error, Result},
    function::FunctionAddress,
    loader::MappedObject,
    maps::{self, MemoryRegion, Permissions},
    stub::{Stub, STUB_LEN},
    LockResultExt,
};

// Serializes protect/write/restore so two patches sharing a page never
// restore each other's protection halfway through a write.
static SWAP_LOCK: Mutex<()> = Mutex::new(());

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchState {
    Ready,
    Patched,
    Unpatched,
    Closed,
}

/// A redirection of one function of this process into a mapped object.
pub struct Patch {
    addr: usize,
    region: MemoryRegion,
    stub: Stub,
    original: Option<[u8; STUB_LEN]>,
    object: MappedObject,
    state: PatchState,
}

impl Patch {
    /// Prepare a redirection of `target` into `object_path` at `offset`.
    ///
    /// Nothing is written until [`Patch::patch`] is called.
    pub fn new<F: FunctionAddress>(
        target: F,
        object_path: impl AsRef<Path>,
        offset: usize,
    ) -> Result<Self> {
        let addr = target.entry_address();
        if addr == 0 {
            return Err(Error::NotAFunction(addr));
        }
        let region = match maps::find_region(addr) {
            Ok(region) => region,
            Err(Error::RegionNotFound(_)) => return Err(Error::TargetNotMapped(addr)),
            Err(e) => return Err(e),
        };
        if !region.perms.exec {
            return Err(Error::NotAFunction(addr));
        }
        if !region.contains_range(addr, STUB_LEN) {
            return Err(Error::TargetNotMapped(addr));
        }

        let object = MappedObject::open(object_path)?;
        let replacement = object.entry(offset)?;
        log::info!(
            "Prepared patch 0x{addr:x} -> 0x{replacement:x} ({} + 0x{offset:x})",
            object.path().display()
        );
        Ok(Self {
            addr,
            region,
            stub: Stub::new(replacement as u64),
            original: None,
            object,
            state: PatchState::Ready,
        })
    }

    pub fn target_address(&self) -> usize {
        self.addr
    }

    pub fn replacement_address(&self) -> usize {
        self.stub.target() as usize
    }

    pub fn stub(&self) -> &Stub {
        &self.stub
    }

    /// Bytes that were at the target before the last `patch()`.
    pub fn original(&self) -> Option<&[u8; STUB_LEN]> {
        self.original.as_ref()
    }

    /// The region holding the target, as seen at construction.
    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    pub fn state(&self) -> PatchState {
        self.state
    }

    pub fn object(&self) -> &MappedObject {
        &self.object
    }

    pub fn patch(&mut self) -> Result<()> {
        match self.state {
            PatchState::Patched => return Err(Error::AlreadyPatched),
            PatchState::Closed => return Err(Error::Closed),
            PatchState::Ready | PatchState::Unpatched => {}
        }
        let stub = *self.stub.bytes();
        let original = self.swap(&stub)?;
        self.original = Some(original);
        self.state = PatchState::Patched;
        log::info!(
            "Patched 0x{:x} -> 0x{:x}",
            self.addr,
            self.replacement_address()
        );
        Ok(())
    }

    pub fn unpatch(&mut self) -> Result<()> {
        match self.state {
            PatchState::Patched => {}
            PatchState::Closed => return Err(Error::Closed),
            PatchState::Ready | PatchState::Unpatched => return Err(Error::NotPatched),
        }
        let original = self.original.ok_or(Error::NotPatched)?;
        self.swap(&original)?;
        self.state = PatchState::Unpatched;
        log::info!("Unpatched 0x{:x}", self.addr);
        Ok(())
    }

    /// Release the replacement code, undoing the patch first if it is still
    /// applied. Later calls do nothing.
    ///
    /// If the original bytes cannot be put back the replacement code is
    /// leaked instead of unmapped.
    pub fn close(&mut self) -> Result<()> {
        if self.state == PatchState::Closed {
            return Ok(());
        }
        if self.state == PatchState::Patched {
            log::warn!("Closing applied patch at 0x{:x}, restoring", self.addr);
            if let Err(e) = self.unpatch() {
                // the stub still jumps into the mapping
                self.object.leak();
                return Err(e);
            }
        }
        self.state = PatchState::Closed;
        self.object.close()
    }

    /// Write `code` over the target and hand back what was there.
    fn swap(&self, code: &[u8; STUB_LEN]) -> Result<[u8; STUB_LEN]> {
        let _guard = SWAP_LOCK.lock().ignore_poison();
        let span = WritableSpan::open(self.addr, STUB_LEN, self.region.perms)?;
        // SAFETY: the span covers the target bytes and is writable until restored
        let previous = unsafe { write_code(self.addr as *mut u8, code) };
        span.restore()?;
        Ok(previous)
    }
}

impl Drop for Patch {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Failed to release patch at 0x{:x}: {e}", self.addr);
        }
    }
}

/// Pages around a code range made read-write-execute for the duration of a
/// write. Dropping without [`WritableSpan::restore`] still puts the old
/// protection back, ignoring errors.
struct WritableSpan {
    start: usize,
    len: usize,
    restore_to: Permissions,
    restored: bool,
}

impl WritableSpan {
    fn open(addr: usize, len: usize, restore_to: Permissions) -> Result<Self> {
        let page = page_size::get();
        let start = page_align_addr(addr, page);
        let len = (addr + len).div_ceil(page) * page - start;
        protect(start, len, Permissions::RWX)?;
        Ok(Self {
            start,
            len,
            restore_to,
            restored: false,
        })
    }

    fn restore(mut self) -> Result<()> {
        self.restored = true;
        protect(self.start, self.len, self.restore_to)
    }
}

impl Drop for WritableSpan {
    fn drop(&mut self) {
        if !self.restored {
            let _ = protect(self.start, self.len, self.restore_to);
        }
    }
}

fn protect(start: usize, len: usize, perms: Permissions) -> Result<()> {
    let res = unsafe { libc::mprotect(start as *mut libc::c_void, len, perms.to_prot()) };
    if res != 0 {
        return Err(Error::ProtectFailed {
            addr: start,
            len,
            source: io::Error::last_os_error(),
        });
    }
    log::debug!("mprotect 0x{start:x} +{len} -> {perms:?}");
    Ok(())
}

/// Swap `code` in at `target`, returning the bytes it replaced.
///
/// # Safety
/// `target..target + STUB_LEN` must be mapped writable, and no thread may be
/// executing those bytes.
unsafe fn write_code(target: *mut u8, code: &[u8; STUB_LEN]) -> [u8; STUB_LEN] {
    let backup = ptr::read_unaligned(target as *const [u8; STUB_LEN]);
    ptr::write_unaligned(target as *mut [u8; STUB_LEN], *code);
    let origptr = target as *const libc::c_void;
    clear_cache::clear_cache(origptr, origptr.add(STUB_LEN));
    backup
}

fn page_align_addr(addr: usize, page: usize) -> usize {
    addr & !(page - 1)
}
