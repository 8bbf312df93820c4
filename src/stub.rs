//! The redirection sequence written over a function entry.

use std::fmt;

/// Size in bytes of every stub.
pub const STUB_LEN: usize = 12;

// movabs rax, imm64
const MOVABS_RAX: [u8; 2] = [0x48, 0xb8];
// jmp rax
const JMP_RAX: [u8; 2] = [0xff, 0xe0];

/// `movabs rax, <target>; jmp rax`
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stub([u8; STUB_LEN]);

impl Stub {
    pub const fn new(target: u64) -> Self {
        let addr = target.to_ne_bytes();
        Self([
            MOVABS_RAX[0],
            MOVABS_RAX[1],
            addr[0],
            addr[1],
            addr[2],
            addr[3],
            addr[4],
            addr[5],
            addr[6],
            addr[7],
            JMP_RAX[0],
            JMP_RAX[1],
        ])
    }

    /// The address the stub jumps to.
    pub fn target(&self) -> u64 {
        let mut addr = [0u8; 8];
        addr.copy_from_slice(&self.0[2..10]);
        u64::from_ne_bytes(addr)
    }

    pub const fn bytes(&self) -> &[u8; STUB_LEN] {
        &self.0
    }
}

impl fmt::Debug for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stub(0x{:x})", self.target())
    }
}

impl AsRef<[u8]> for Stub {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_movabs_then_jmp() {
        let stub = Stub::new(0x1122_3344_5566_7788);
        let bytes = stub.bytes();
        assert_eq!(&bytes[..2], &[0x48, 0xb8]);
        assert_eq!(&bytes[10..], &[0xff, 0xe0]);
        assert_eq!(bytes.len(), STUB_LEN);
    }

    #[test]
    fn address_uses_host_byte_order() {
        for addr in [0u64, 1, 0x7fff_dead_beef, u64::MAX, 0x8000_0000_0000_0000] {
            let stub = Stub::new(addr);
            assert_eq!(stub, Stub::new(addr));
            assert_eq!(&stub.bytes()[2..10], &addr.to_ne_bytes());
            assert_eq!(stub.target(), addr);
        }
    }

    #[test]
    fn little_endian_layout() {
        if cfg!(target_endian = "little") {
            let stub = Stub::new(0x0000_7f12_3456_789a);
            assert_eq!(
                stub.bytes(),
                &[0x48, 0xb8, 0x9a, 0x78, 0x56, 0x34, 0x12, 0x7f, 0x00, 0x00, 0xff, 0xe0]
            );
        }
    }
}
