//! Symbol resolution against the running test binary.
#![cfg(target_os = "linux")]

use std::fs;

use hotswap::{resolve, resolve_file_offset, resolve_in, BinaryImage, Error, MemoryMap, STUB_LEN};

#[no_mangle]
#[inline(never)]
pub extern "C" fn hotswap_resolve_probe(x: u32) -> u32 {
    std::hint::black_box(x).wrapping_mul(31) ^ 0x5a5a
}

#[test]
fn runtime_address_matches_function_pointer() {
    let exe = std::env::current_exe().unwrap();
    let map = MemoryMap::current().unwrap();
    let addr = resolve_in(&map, &exe, "hotswap_resolve_probe").unwrap();
    assert_eq!(addr as usize, hotswap_resolve_probe as usize);
}

#[test]
fn file_offset_points_at_code() {
    let exe = std::env::current_exe().unwrap();
    let image = BinaryImage::open(&exe).unwrap();
    let offset = resolve_file_offset(&image, "hotswap_resolve_probe").unwrap() as usize;

    let file = fs::read(&exe).unwrap();
    let in_memory =
        unsafe { std::slice::from_raw_parts(hotswap_resolve_probe as usize as *const u8, STUB_LEN) };
    assert_eq!(&file[offset..offset + STUB_LEN], in_memory);
}

#[test]
fn unknown_name() {
    let image = BinaryImage::open(std::env::current_exe().unwrap()).unwrap();
    assert!(matches!(
        resolve(&image, "hotswap_no_such_function"),
        Err(Error::SymbolNotFound(_))
    ));
}
