// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory grants: records a process keeps in its own memory to let another
//!          process read or write a bounded region, verified by the kernel on every use
//! OWNERS: @kernel-mm-team
//! PUBLIC API: GrantId, GrantFlags, Grant, GrantKind, GrantError, Verified,
//!             Kernel::{verify_grant, safecopy, vsafecopy, safememset, set_grant_table}
//! DEPENDS_ON: copy (data_copy, virtual_copy*), mm::scratch_*, proc::Privileges
//! INVARIANTS: The kernel only ever reads grant records; unused, invalid or stale-sequence
//!             records are indistinguishable from missing ones; indirection is bounded
//! ADR: docs/adr/0001-memory-ownership-core.md

mod safecopy;
mod verify;

#[cfg(test)]
mod tests_prop;

pub use safecopy::{VscpVec, VSCP_VEC_LEN};
pub use verify::Verified;

use core::fmt;

use bitflags::bitflags;

use crate::error::Errno;
use crate::types::{Endpoint, LinAddr};

/// Bits of a grant id holding the table index; the sequence number sits above.
pub const GRANT_SHIFT: u32 = 20;
const GRANT_INDEX_MASK: i32 = (1 << GRANT_SHIFT) - 1;
/// Size of one grant record in the granter's table.
pub const GRANT_RECORD_LEN: usize = 32;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct GrantFlags: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        /// Fail with EFAULT instead of paging in.
        const TRY = 0x10;
        const USED = 0x100;
        const DIRECT = 0x200;
        const INDIRECT = 0x400;
        const MAGIC = 0x800;
        const VALID = 0x1000;
    }
}

impl GrantFlags {
    pub const ACCESS: Self = Self::READ.union(Self::WRITE);
}

/// Grant identifier: table index in the low `GRANT_SHIFT` bits, sequence above.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct GrantId(i32);

impl GrantId {
    pub const INVALID: Self = Self(-1);

    pub const fn new(index: u32, seq: i32) -> Self {
        Self((seq << GRANT_SHIFT) | (index as i32 & GRANT_INDEX_MASK))
    }

    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> i32 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    pub const fn index(self) -> u32 {
        (self.0 & GRANT_INDEX_MASK) as u32
    }

    pub const fn seq(self) -> i32 {
        self.0 >> GRANT_SHIFT
    }
}

impl fmt::Display for GrantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "grant#{}.{}", self.index(), self.seq())
    }
}

/// Payload of a grant record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrantKind {
    /// `[start, start + len)` of the granter, usable by `who_to`.
    Direct { who_to: Endpoint, start: LinAddr, len: u32 },
    /// Lets `who_to` use `who_from`'s grant `grant` (which names the granter as grantee).
    Indirect { who_to: Endpoint, who_from: Endpoint, grant: GrantId },
    /// Like `Direct` but over `who_from`'s memory; only the trusted issuer may hold these.
    Magic { who_to: Endpoint, who_from: Endpoint, start: LinAddr, len: u32 },
}

/// A decoded, used and valid grant record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Grant {
    /// READ/WRITE (and TRY) bits granted.
    pub access: GrantFlags,
    pub seq: i32,
    pub kind: GrantKind,
}

/// Little-endian record layout as kept in the granter's memory.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct RawGrant {
    flags: u32,
    who_to: i32,
    who_from: i32,
    start: u32,
    len: u32,
    grant: i32,
    seq: i32,
    reserved: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<RawGrant>(), GRANT_RECORD_LEN);

impl RawGrant {
    fn to_le_bytes(self) -> [u8; GRANT_RECORD_LEN] {
        let words = [
            self.flags,
            self.who_to as u32,
            self.who_from as u32,
            self.start,
            self.len,
            self.grant as u32,
            self.seq as u32,
            self.reserved,
        ];
        let mut out = [0u8; GRANT_RECORD_LEN];
        for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    fn from_le_bytes(bytes: &[u8; GRANT_RECORD_LEN]) -> Self {
        let mut words = [0u32; 8];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self {
            flags: words[0],
            who_to: words[1] as i32,
            who_from: words[2] as i32,
            start: words[3],
            len: words[4],
            grant: words[5] as i32,
            seq: words[6] as i32,
            reserved: words[7],
        }
    }
}

impl Grant {
    pub const fn direct(who_to: Endpoint, start: LinAddr, len: u32, access: GrantFlags) -> Self {
        Self { access, seq: 0, kind: GrantKind::Direct { who_to, start, len } }
    }

    pub const fn indirect(who_to: Endpoint, who_from: Endpoint, grant: GrantId) -> Self {
        Self {
            access: GrantFlags::ACCESS,
            seq: 0,
            kind: GrantKind::Indirect { who_to, who_from, grant },
        }
    }

    pub const fn magic(
        who_to: Endpoint,
        who_from: Endpoint,
        start: LinAddr,
        len: u32,
        access: GrantFlags,
    ) -> Self {
        Self { access, seq: 0, kind: GrantKind::Magic { who_to, who_from, start, len } }
    }

    pub const fn with_seq(mut self, seq: i32) -> Self {
        self.seq = seq;
        self
    }

    /// Record bytes for the granter's table.
    pub fn encode(&self) -> [u8; GRANT_RECORD_LEN] {
        let mut raw = RawGrant {
            flags: (self.access & (GrantFlags::ACCESS | GrantFlags::TRY)).bits()
                | (GrantFlags::USED | GrantFlags::VALID).bits(),
            seq: self.seq,
            ..RawGrant::default()
        };
        match self.kind {
            GrantKind::Direct { who_to, start, len } => {
                raw.flags |= GrantFlags::DIRECT.bits();
                raw.who_to = who_to.as_raw();
                raw.start = start;
                raw.len = len;
            }
            GrantKind::Indirect { who_to, who_from, grant } => {
                raw.flags |= GrantFlags::INDIRECT.bits();
                raw.who_to = who_to.as_raw();
                raw.who_from = who_from.as_raw();
                raw.grant = grant.as_raw();
            }
            GrantKind::Magic { who_to, who_from, start, len } => {
                raw.flags |= GrantFlags::MAGIC.bits();
                raw.who_to = who_to.as_raw();
                raw.who_from = who_from.as_raw();
                raw.start = start;
                raw.len = len;
            }
        }
        raw.to_le_bytes()
    }

    /// Bytes of a revoked (unused) record.
    pub const fn revoked() -> [u8; GRANT_RECORD_LEN] {
        [0; GRANT_RECORD_LEN]
    }

    /// Decodes a record; unused or invalid records are refused.
    pub fn decode(bytes: &[u8; GRANT_RECORD_LEN]) -> Result<Self, GrantError> {
        let raw = RawGrant::from_le_bytes(bytes);
        let flags = GrantFlags::from_bits_retain(raw.flags);
        if !flags.contains(GrantFlags::USED | GrantFlags::VALID) {
            return Err(GrantError::NotValid { flags: raw.flags });
        }
        let access = flags & (GrantFlags::ACCESS | GrantFlags::TRY);
        let kind = if flags.contains(GrantFlags::INDIRECT) {
            GrantKind::Indirect {
                who_to: Endpoint::from_raw(raw.who_to),
                who_from: Endpoint::from_raw(raw.who_from),
                grant: GrantId::from_raw(raw.grant),
            }
        } else if flags.contains(GrantFlags::DIRECT) {
            GrantKind::Direct {
                who_to: Endpoint::from_raw(raw.who_to),
                start: raw.start,
                len: raw.len,
            }
        } else if flags.contains(GrantFlags::MAGIC) {
            GrantKind::Magic {
                who_to: Endpoint::from_raw(raw.who_to),
                who_from: Endpoint::from_raw(raw.who_from),
                start: raw.start,
                len: raw.len,
            }
        } else {
            return Err(GrantError::UnknownKind { flags: raw.flags });
        };
        Ok(Self { access, seq: raw.seq, kind })
    }
}

/// Why a grant was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrantError {
    /// Granter endpoint is not a live process.
    BadGranter(Endpoint),
    /// Negative grant id.
    BadGrantId(GrantId),
    NoGrantTable(Endpoint),
    OutOfRange { grant: GrantId, entries: u32 },
    /// The record could not be copied out of the granter.
    Unreadable(GrantId),
    NotValid { flags: u32 },
    SequenceMismatch { grant: GrantId, found: i32 },
    BadGrantee { wanted: Endpoint, found: Endpoint },
    TooDeep,
    Access { want: GrantFlags, have: GrantFlags },
    /// `start + len` wraps the address space.
    Wraps { start: LinAddr, len: u32 },
    Range { granted: u32, start: LinAddr, wanted: u32, offset: u32 },
    /// A magic grant held by someone other than the trusted issuer.
    UntrustedMagic(Endpoint),
    UnknownKind { flags: u32 },
}

impl From<GrantError> for Errno {
    fn from(value: GrantError) -> Self {
        match value {
            GrantError::BadGranter(_) | GrantError::BadGrantId(_) => Errno::Invalid,
            GrantError::TooDeep => Errno::TooManyLevels,
            _ => Errno::Permission,
        }
    }
}

impl fmt::Display for GrantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadGranter(ep) => write!(f, "invalid granter {}", ep),
            Self::BadGrantId(id) => write!(f, "invalid grant {}", id.as_raw()),
            Self::NoGrantTable(ep) => write!(f, "granter {} has no grant table", ep),
            Self::OutOfRange { grant, entries } => {
                write!(f, "{} out of range for table size {}", grant, entries)
            }
            Self::Unreadable(grant) => write!(f, "{} record unreadable", grant),
            Self::NotValid { flags } => write!(f, "invalid flags 0x{:x}", flags),
            Self::SequenceMismatch { grant, found } => {
                write!(f, "{} sequence mismatch (record has {})", grant, found)
            }
            Self::BadGrantee { wanted, found } => {
                write!(f, "bad grantee {} (grant is for {})", wanted, found)
            }
            Self::TooDeep => write!(f, "indirect chain too deep"),
            Self::Access { want, have } => {
                write!(f, "access invalid; want 0x{:x}, have 0x{:x}", want.bits(), have.bits())
            }
            Self::Wraps { start, len } => write!(f, "len {} at 0x{:x} wraps", len, start),
            Self::Range { granted, start, wanted, offset } => write!(
                f,
                "granted {} bytes @ 0x{:x}; wanted {} bytes @ 0x{:x}",
                granted, start, wanted, offset
            ),
            Self::UntrustedMagic(ep) => write!(f, "magic grant from untrusted {}", ep),
            Self::UnknownKind { flags } => write!(f, "unknown grant type 0x{:x}", flags),
        }
    }
}
