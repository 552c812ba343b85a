// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes shared by every subsystem (endpoints, slots, cpus, addresses)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Endpoint, ProcSlot, CpuId, PhysAddr, LinAddr, NR_TASKS, NR_PROCS
//! DEPENDS_ON: core::fmt
//! INVARIANTS: Endpoint = generation << 15 + process number; process numbers of kernel
//!             tasks are negative; a slot index is process number + NR_TASKS
//! ADR: docs/adr/0001-memory-ownership-core.md

use core::fmt;

/// Physical address (32-bit platform).
pub type PhysAddr = u32;
/// Linear (virtual) address as seen through the currently loaded table.
pub type LinAddr = u32;

/// Number of kernel task slots preceding user processes.
pub const NR_TASKS: usize = 2;
/// Number of user process slots.
pub const NR_PROCS: usize = 64;
/// Total slot count of the process table.
pub const NR_SLOTS: usize = NR_TASKS + NR_PROCS;

const GENERATION_SHIFT: i32 = 15;
const GENERATION_SIZE: i32 = 1 << GENERATION_SHIFT;
const MAX_NR_TASKS: i32 = 1023;
/// Generations wrap before the encoded endpoint would overflow `i32`.
pub const MAX_GENERATION: i32 = (i32::MAX - MAX_NR_TASKS) >> GENERATION_SHIFT;

/// Stable process identity: generation plus process number.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Endpoint(i32);

impl Endpoint {
    /// Wildcard used by indirect grants ("any grantee").
    pub const ANY: Self = Self(0x7ace);
    /// Denotes a physical address instead of a process.
    pub const NONE: Self = Self(0x6ace);
    /// Resolved to the caller at the kernel-call boundary.
    pub const SELF: Self = Self(0x8ace);

    pub const SYSTEM: Self = Self::from_parts(0, -2);
    pub const KERNEL: Self = Self::from_parts(0, -1);
    pub const PM: Self = Self::from_parts(0, 0);
    pub const VFS: Self = Self::from_parts(0, 1);
    pub const VM: Self = Self::from_parts(0, 8);

    #[inline]
    pub const fn from_parts(generation: i32, proc_nr: i32) -> Self {
        Self((generation << GENERATION_SHIFT) + proc_nr)
    }

    #[inline]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> i32 {
        self.0
    }

    #[inline]
    pub const fn generation(self) -> i32 {
        self.0.wrapping_add(MAX_NR_TASKS) >> GENERATION_SHIFT
    }

    #[inline]
    pub const fn proc_nr(self) -> i32 {
        (self.0.wrapping_add(MAX_NR_TASKS) & (GENERATION_SIZE - 1)) - MAX_NR_TASKS
    }

    /// Slot index for this endpoint if its process number is in table range.
    /// The generation is not checked here; see `ProcTable::lookup`.
    #[inline]
    pub fn slot(self) -> Option<ProcSlot> {
        let index = self.proc_nr() + NR_TASKS as i32;
        if index >= 0 && (index as usize) < NR_SLOTS {
            Some(ProcSlot(index as usize))
        } else {
            None
        }
    }

    /// Decodes a register value (sign-extended from 32 bits).
    #[inline]
    pub const fn decode(reg: usize) -> Self {
        Self(reg as u32 as i32)
    }

    #[inline]
    pub const fn encode(self) -> usize {
        self.0 as u32 as usize
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ANY => f.write_str("ANY"),
            Self::NONE => f.write_str("NONE"),
            Self::SELF => f.write_str("SELF"),
            ep => write!(f, "{}", ep.0),
        }
    }
}

/// Index into the process table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ProcSlot(usize);

impl ProcSlot {
    #[inline]
    pub const fn from_index(index: usize) -> Self {
        Self(index)
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0
    }

    /// Process number of the slot (negative for kernel tasks).
    #[inline]
    pub const fn proc_nr(self) -> i32 {
        self.0 as i32 - NR_TASKS as i32
    }

    /// True for slots reserved to kernel tasks.
    #[inline]
    pub const fn is_kernel_task(self) -> bool {
        self.0 < NR_TASKS
    }
}

impl fmt::Display for ProcSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.proc_nr())
    }
}

/// Logical CPU identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CpuId(u16);

impl CpuId {
    /// Boot CPU identifier.
    pub const BOOT: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}
