// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Translation tables, the software walker and mapping windows
//! OWNERS: @kernel-mm-team
//! PUBLIC API: page_table::{PageTable, FrameAllocator, PteFlags, PdeFlags}, walk::{lookup,
//!             lookup_range}, window::{WindowPool, create_pde}, kernel layout constants
//! DEPENDS_ON: arch::Memory
//! INVARIANTS: The kernel section is mapped supervisor-only at KERNEL_VIRT_BASE in every table
//! ADR: docs/adr/0001-memory-ownership-core.md

pub mod page_table;
pub mod walk;
pub mod window;


pub use page_table::{
    FrameAllocator, MapError, PageTable, PdeFlags, PteFlags, PAGE_SIZE, SECTION_SIZE,
};
pub use walk::{lookup, lookup_range, Translation, WalkError};
pub use window::{Window, WindowError, WindowPool, WindowSide, WindowTarget};

use crate::types::{CpuId, LinAddr, PhysAddr};

/// Physical base of the kernel image section.
pub const KERNEL_PHYS_BASE: PhysAddr = 0x0000_0000;
/// Linear base of the kernel image section in every table.
pub const KERNEL_VIRT_BASE: LinAddr = 0xF000_0000;
/// Bytes of kernel image mapped at `KERNEL_VIRT_BASE`.
pub const KERNEL_SPAN: u32 = SECTION_SIZE;
/// Offset of the per-core scratch area inside the kernel section.
const SCRATCH_OFFSET: u32 = 0x8_0000;
/// Bytes of scratch per core (grant records, copy vectors, staged messages).
pub const SCRATCH_BYTES: u32 = 0x1_0000;

/// Linear address of `cpu`'s kernel scratch buffer.
#[inline]
pub const fn scratch_lin(cpu: CpuId) -> LinAddr {
    KERNEL_VIRT_BASE + SCRATCH_OFFSET + cpu.as_raw() as u32 * SCRATCH_BYTES
}

/// Physical address behind `scratch_lin(cpu)`.
#[inline]
pub const fn scratch_phys(cpu: CpuId) -> PhysAddr {
    KERNEL_PHYS_BASE + SCRATCH_OFFSET + cpu.as_raw() as u32 * SCRATCH_BYTES
}

/// Maps the kernel section into `table` (supervisor read/write, no user access).
pub fn map_kernel_section<M: crate::arch::Memory + ?Sized>(
    mem: &mut M,
    table: &PageTable,
) -> Result<(), MapError> {
    table.map_section(
        mem,
        KERNEL_VIRT_BASE,
        KERNEL_PHYS_BASE,
        PdeFlags::SECTION_SUPER | PdeFlags::CACHEABLE | PdeFlags::BUFFERABLE,
    )
}
