use std::{io, path::PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed image: {0}")]
    MalformedImage(String),

    #[error("could not find symbol {0:?}")]
    SymbolNotFound(String),

    #[error("no mapped region contains 0x{0:x}")]
    RegionNotFound(usize),

    #[error("0x{0:x} is not the entry of a mapped function")]
    NotAFunction(usize),

    #[error("patch target 0x{0:x} is not mapped")]
    TargetNotMapped(usize),

    #[error("failed to map {}: {source}", .path.display())]
    MapFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("entry offset 0x{offset:x} is outside the {len} byte object")]
    EntryOutOfBounds { offset: usize, len: usize },

    #[error("{} is not mapped in the target process", .0.display())]
    ObjectNotLoaded(PathBuf),

    #[error("failed to attach to pid {pid}: {source}")]
    AttachFailed {
        pid: i32,
        #[source]
        source: io::Error,
    },

    #[error("failed to read pid {pid} memory at 0x{addr:x}: {source}")]
    PeekFailed {
        pid: i32,
        addr: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to write pid {pid} memory at 0x{addr:x}: {source}")]
    PokeFailed {
        pid: i32,
        addr: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to detach from pid {pid}: {source}")]
    DetachFailed {
        pid: i32,
        #[source]
        source: io::Error,
    },

    #[error("failed to change protection of 0x{addr:x} (+{len}): {source}")]
    ProtectFailed {
        addr: usize,
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("pid {0} is not attached")]
    NotAttached(i32),

    #[error("target is not patched")]
    NotPatched,

    #[error("target is already patched")]
    AlreadyPatched,

    #[error("patch has been closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
