//! Patching another process through `ptrace`.
//!
//! Only the thread whose id is given is stopped by `attach`. For a
//! multi-threaded target the other threads keep running while memory is
//! rewritten.

use std::{io, mem};

use libc::{c_long, c_void, pid_t};
use nix::{
    errno::Errno,
    sys::{
        ptrace,
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};

use crate::{
    error::{Error, Result},
    stub::{Stub, STUB_LEN},
};

const WORD: usize = mem::size_of::<c_long>();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteState {
    Detached,
    Attached,
    Patched,
}

/// A redirection of `addr` inside process `pid`.
#[derive(Debug)]
pub struct RemotePatch {
    pid: pid_t,
    addr: usize,
    stub: Stub,
    original: Option<[u8; STUB_LEN]>,
    state: RemoteState,
}

impl RemotePatch {
    /// `target` and `replacement` are addresses in the target process.
    pub fn new(pid: pid_t, target: u64, replacement: u64) -> Self {
        Self {
            pid,
            addr: target as usize,
            stub: Stub::new(replacement),
            original: None,
            state: RemoteState::Detached,
        }
    }

    /// Rebuild a patch from original bytes saved by an earlier run, so it can
    /// be [`restore`](Self::restore)d.
    pub fn with_original(pid: pid_t, target: u64, original: [u8; STUB_LEN]) -> Self {
        Self {
            pid,
            addr: target as usize,
            stub: Stub::new(0),
            original: Some(original),
            state: RemoteState::Detached,
        }
    }

    pub fn pid(&self) -> pid_t {
        self.pid
    }

    pub fn target_address(&self) -> usize {
        self.addr
    }

    pub fn stub(&self) -> &Stub {
        &self.stub
    }

    pub fn original(&self) -> Option<&[u8; STUB_LEN]> {
        self.original.as_ref()
    }

    pub fn state(&self) -> RemoteState {
        self.state
    }

    /// Attach and wait until the target reports a stop.
    ///
    /// There is no timeout: a target that never stops blocks forever.
    pub fn attach(&mut self) -> Result<()> {
        let attach_err = |source: io::Error| Error::AttachFailed {
            pid: self.pid,
            source,
        };
        let pid = Pid::from_raw(self.pid);
        ptrace::attach(pid).map_err(|e| attach_err(e.into()))?;
        match wait_for_stop(pid).map_err(|e| attach_err(e.into()))? {
            WaitStatus::Stopped(..) => {}
            status => {
                return Err(attach_err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("process did not stop ({status:?})"),
                )))
            }
        }
        log::info!("Attached to pid {}", self.pid);
        self.state = RemoteState::Attached;
        Ok(())
    }

    /// Save the original bytes, then write the stub over them.
    pub fn patch(&mut self) -> Result<()> {
        match self.state {
            RemoteState::Detached => return Err(Error::NotAttached(self.pid)),
            RemoteState::Patched => return Err(Error::AlreadyPatched),
            RemoteState::Attached => {}
        }
        let mut original = [0u8; STUB_LEN];
        self.read(self.addr, &mut original)?;
        self.original = Some(original);
        self.write(self.addr, self.stub.bytes())?;
        self.state = RemoteState::Patched;
        log::info!(
            "Patched pid {} 0x{:x} -> 0x{:x}",
            self.pid,
            self.addr,
            self.stub.target()
        );
        Ok(())
    }

    /// Write the saved original bytes back.
    pub fn restore(&mut self) -> Result<()> {
        if self.state == RemoteState::Detached {
            return Err(Error::NotAttached(self.pid));
        }
        let original = self.original.ok_or(Error::NotPatched)?;
        self.write(self.addr, &original)?;
        self.state = RemoteState::Attached;
        log::info!("Restored pid {} 0x{:x}", self.pid, self.addr);
        Ok(())
    }

    /// Let the target run again. The patch stays in place.
    pub fn detach(&mut self) -> Result<()> {
        ptrace::detach(Pid::from_raw(self.pid), None).map_err(|e| Error::DetachFailed {
            pid: self.pid,
            source: e.into(),
        })?;
        log::info!("Detached from pid {}", self.pid);
        self.state = RemoteState::Detached;
        Ok(())
    }

    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        for (i, chunk) in buf.chunks_mut(WORD).enumerate() {
            let at = addr + i * WORD;
            let word = self.peek(at)?.to_ne_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
        Ok(())
    }

    fn write(&self, addr: usize, bytes: &[u8]) -> Result<()> {
        for (i, chunk) in bytes.chunks(WORD).enumerate() {
            let at = addr + i * WORD;
            let mut word = [0u8; WORD];
            if chunk.len() < WORD {
                // keep whatever follows the last partial word
                word = self.peek(at)?.to_ne_bytes();
            }
            word[..chunk.len()].copy_from_slice(chunk);
            self.poke(at, c_long::from_ne_bytes(word))?;
        }
        Ok(())
    }

    fn peek(&self, addr: usize) -> Result<c_long> {
        ptrace::read(Pid::from_raw(self.pid), addr as *mut c_void).map_err(|e| {
            Error::PeekFailed {
                pid: self.pid,
                addr,
                source: e.into(),
            }
        })
    }

    fn poke(&self, addr: usize, word: c_long) -> Result<()> {
        ptrace::write(Pid::from_raw(self.pid), addr as *mut c_void, word).map_err(|e| {
            Error::PokeFailed {
                pid: self.pid,
                addr,
                source: e.into(),
            }
        })
    }
}

fn wait_for_stop(pid: Pid) -> nix::Result<WaitStatus> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Err(Errno::EINTR) => continue,
            res => return res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_requires_attach() {
        let mut patch = RemotePatch::new(1, 0x1000, 0x2000);
        assert!(matches!(patch.patch(), Err(Error::NotAttached(1))));
        assert_eq!(patch.state(), RemoteState::Detached);
        assert!(patch.original().is_none());
    }

    #[test]
    fn restore_requires_attach() {
        let mut patch = RemotePatch::with_original(1, 0x1000, [0x90; STUB_LEN]);
        assert!(matches!(patch.restore(), Err(Error::NotAttached(1))));
        assert_eq!(patch.original(), Some(&[0x90; STUB_LEN]));
    }

    #[test]
    fn stub_targets_replacement() {
        let patch = RemotePatch::new(1, 0x1000, 0x7f00_dead_beef);
        assert_eq!(patch.stub().target(), 0x7f00_dead_beef);
        assert_eq!(patch.target_address(), 0x1000);
    }

    #[test]
    fn attach_to_missing_process() {
        // pid_max is at most 2^22
        let mut patch = RemotePatch::new(i32::MAX, 0x1000, 0x2000);
        assert!(matches!(patch.attach(), Err(Error::AttachFailed { .. })));
    }

    #[test]
    fn detach_untraced_process() {
        let mut patch = RemotePatch::new(i32::MAX, 0x1000, 0x2000);
        let err = patch.detach().unwrap_err();
        assert!(matches!(
            err,
            Error::DetachFailed { pid: i32::MAX, ref source } if source.raw_os_error() == Some(libc::ESRCH)
        ));
        assert_eq!(patch.state(), RemoteState::Detached);
    }
}
