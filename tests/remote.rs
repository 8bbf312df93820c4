//! Patch and restore a child process through ptrace.
#![cfg(target_os = "linux")]

use std::{
    fs::File,
    os::unix::fs::FileExt,
    process::{Child, Command},
    thread,
    time::Duration,
};

use hotswap::{Error, MemoryMap, RemotePatch, RemoteState, STUB_LEN};

struct Sleeper(Child);

impl Drop for Sleeper {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn read_remote(pid: i32, addr: usize) -> [u8; STUB_LEN] {
    let mem = File::open(format!("/proc/{pid}/mem")).unwrap();
    let mut buf = [0u8; STUB_LEN];
    mem.read_exact_at(&mut buf, addr as u64).unwrap();
    buf
}

#[test]
fn patch_then_restore_child() {
    let Ok(child) = Command::new("sleep").arg("30").spawn() else {
        eprintln!("no sleep binary, skipping");
        return;
    };
    let child = Sleeper(child);
    let pid = child.0.id() as i32;
    // give exec a moment to replace the forked image
    thread::sleep(Duration::from_millis(200));

    let map = MemoryMap::of_pid(pid).unwrap();
    let code = map
        .regions()
        .iter()
        .find(|r| r.perms.exec && r.perms.read && r.len >= 0x1000)
        .expect("child has executable code");
    // odd address so the trailing partial word gets merged
    let addr = code.base + 0x103;

    let mut patch = RemotePatch::new(pid, addr as u64, 0xdead_beef_cafe);
    match patch.attach() {
        Ok(()) => {}
        Err(Error::AttachFailed { source, .. }) => {
            eprintln!("ptrace not permitted here ({source}), skipping");
            return;
        }
        Err(e) => panic!("{e}"),
    }
    assert_eq!(patch.state(), RemoteState::Attached);

    let before = read_remote(pid, addr);
    let after_stub = read_remote(pid, addr + STUB_LEN);

    patch.patch().unwrap();
    assert_eq!(patch.state(), RemoteState::Patched);
    assert_eq!(patch.original(), Some(&before));
    assert_eq!(&read_remote(pid, addr), patch.stub().bytes());
    assert_eq!(read_remote(pid, addr + STUB_LEN), after_stub);
    assert!(matches!(patch.patch(), Err(Error::AlreadyPatched)));

    patch.restore().unwrap();
    assert_eq!(read_remote(pid, addr), before);
    assert_eq!(patch.state(), RemoteState::Attached);

    patch.detach().unwrap();
    assert_eq!(patch.state(), RemoteState::Detached);
}
