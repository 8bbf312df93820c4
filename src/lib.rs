//! Live function patching for Linux x86_64.
//!
//! A function's first bytes are overwritten with a `movabs rax; jmp rax`
//! stub that sends every later call into replacement code. Two ways in:
//!
//! - [`remote::RemotePatch`] rewrites another process through `ptrace`,
//!   with addresses found by [`symbols`] in that process' executable.
//! - [`hooking::Patch`] rewrites the calling process, jumping into an
//!   object file mapped by [`loader::MappedObject`].
pub mod error;
pub mod function;
pub mod hooking;
pub mod loader;
pub mod maps;
pub mod remote;
pub mod stub;
pub mod symbols;

use std::sync::{LockResult, PoisonError};

pub use error::{Error, Result};
pub use function::{FunctionAddress, RawFunction};
pub use hooking::{Patch, PatchState};
pub use maps::{find_region, MemoryMap, MemoryRegion, Permissions};
pub use remote::{RemotePatch, RemoteState};
pub use stub::{Stub, STUB_LEN};
pub use symbols::{resolve, resolve_file_offset, resolve_in, BinaryImage, SymbolTable};

/// A panic while holding one of our locks leaves no state half-written, so
/// the poison flag carries no information.
pub(crate) trait LockResultExt<T> {
    fn ignore_poison(self) -> T;
}

impl<T> LockResultExt<T> for LockResult<T> {
    fn ignore_poison(self) -> T {
        self.unwrap_or_else(PoisonError::into_inner)
    }
}
