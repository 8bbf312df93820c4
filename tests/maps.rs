#![cfg(target_os = "linux")]

use std::ptr;

use hotswap::{find_region, Error, MemoryMap};

#[test]
fn finds_constructed_mapping() {
    let page = page_size::get();
    // PROT_NONE pages on both sides keep the kernel from merging neighbours in
    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            6 * page,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(base, libc::MAP_FAILED);
    let inner = base as usize + page;
    let res = unsafe {
        libc::mprotect(
            inner as *mut libc::c_void,
            4 * page,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };
    assert_eq!(res, 0);

    for addr in [inner, inner + 100, inner + 4 * page - 1] {
        let region = find_region(addr).unwrap();
        assert_eq!(region.base, inner);
        assert_eq!(region.len, 4 * page);
        assert!(region.perms.read && region.perms.write && !region.perms.exec);
        assert!(region.path.is_none());
    }

    let guard = find_region(inner + 4 * page).unwrap();
    assert_eq!(guard.base, inner + 4 * page);
    assert!(!guard.perms.read);

    unsafe { libc::munmap(base, 6 * page) };
}

#[test]
fn unmapped_address() {
    assert!(matches!(find_region(8), Err(Error::RegionNotFound(8))));
}

#[test]
fn executable_is_mapped() {
    let exe = std::env::current_exe().unwrap();
    let map = MemoryMap::current().unwrap();
    assert!(map.load_base(&exe).is_some());
    let code = map.find(finds_constructed_mapping as fn() as usize).unwrap();
    assert!(code.perms.exec);
    assert_eq!(code.path.as_deref(), Some(exe.as_path()));
}

#[test]
fn other_process_map() {
    let map = MemoryMap::of_pid(std::process::id() as i32).unwrap();
    assert!(!map.regions().is_empty());
    assert!(MemoryMap::of_pid(i32::MAX).is_err());
}
