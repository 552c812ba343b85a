// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel message header and the fixed payloads the memory core emits.

use core::convert::TryInto;

/// Kernel notification; payload is the pending signal set.
pub const MSG_NOTIFY: u16 = 0x0001;
/// Page fault taken by a process; payload is [`PagefaultNotice`].
pub const MSG_VM_PAGEFAULT: u16 = 0x0C00;

/// Header of a kernel-originated message.
///
/// The header is exactly 16 bytes; endpoints travel as their raw bits.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub src: u32,
    pub dst: u32,
    pub ty: u16,
    pub flags: u16,
    pub len: u32,
}

static_assertions::assert_eq_size!(MessageHeader, [u8; 16]);

impl MessageHeader {
    /// Creates a new header with all fields initialised.
    pub const fn new(src: u32, dst: u32, ty: u16, flags: u16, len: u32) -> Self {
        Self { src, dst, ty, flags, len }
    }

    /// Serialises the header to a little-endian byte array.
    pub fn to_le_bytes(&self) -> [u8; core::mem::size_of::<Self>()] {
        let mut bytes = [0u8; core::mem::size_of::<Self>()];
        bytes[0..4].copy_from_slice(&self.src.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.dst.to_le_bytes());
        bytes[8..10].copy_from_slice(&self.ty.to_le_bytes());
        bytes[10..12].copy_from_slice(&self.flags.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.len.to_le_bytes());
        bytes
    }

    /// Deserialises a little-endian byte array into a [`MessageHeader`].
    pub fn from_le_bytes(bytes: [u8; core::mem::size_of::<Self>()]) -> Self {
        let word = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        let half = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        Self { src: word(0), dst: word(4), ty: half(8), flags: half(10), len: word(12) }
    }
}

/// Payload of `MSG_VM_PAGEFAULT`: faulting address and raw fault status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagefaultNotice {
    pub addr: u32,
    pub status: u32,
}

impl PagefaultNotice {
    pub const LEN: usize = 8;

    pub fn to_le_bytes(&self) -> [u8; Self::LEN] {
        let mut bytes = [0u8; Self::LEN];
        bytes[0..4].copy_from_slice(&self.addr.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.status.to_le_bytes());
        bytes
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        let addr = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?);
        let status = u32::from_le_bytes(bytes.get(4..8)?.try_into().ok()?);
        Some(Self { addr, status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::align_of;

    const VECTOR: [u8; 16] = [
        0xfe, 0xff, 0xff, 0xff, 0x08, 0x00, 0x00, 0x00, 0x00, 0x0c, 0x00, 0x00, 0x08, 0x00, 0x00,
        0x00,
    ];

    #[test]
    fn header_layout() {
        assert_eq!(align_of::<MessageHeader>(), 4);
    }

    #[test]
    fn pagefault_header_matches_golden_bytes() {
        let header = MessageHeader::new(
            crate::types::Endpoint::SYSTEM.as_raw() as u32,
            crate::types::Endpoint::VM.as_raw() as u32,
            MSG_VM_PAGEFAULT,
            0,
            PagefaultNotice::LEN as u32,
        );
        assert_eq!(header.to_le_bytes(), VECTOR);
        assert_eq!(MessageHeader::from_le_bytes(VECTOR), header);
    }

    #[test]
    fn short_notice_payload_is_rejected() {
        assert_eq!(PagefaultNotice::from_le_bytes(&[0; 7]), None);
        let n = PagefaultNotice { addr: 0x0040_1000, status: 0x807 };
        assert_eq!(PagefaultNotice::from_le_bytes(&n.to_le_bytes()), Some(n));
    }
}
