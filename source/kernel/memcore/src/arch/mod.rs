// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hardware seams of the memory core (MMU registers, physical memory, copy routines)
//! OWNERS: @kernel-arch-team
//! PUBLIC API: Cpu, Memory, Hardware, Abort, Routine, KernelText, FaultKind, FSR_* codes
//! DEPENDS_ON: types
//! INVARIANTS: Copy routines report a raw abort; the kernel dispatches it through
//!             the exception front end before the copy engine looks at the outcome
//! ADR: docs/adr/0001-memory-ownership-core.md

pub mod sim;

#[cfg(target_arch = "arm")]
pub mod armv7;

use core::ops::Range;

use crate::trap::Vector;
use crate::types::{CpuId, LinAddr, PhysAddr};

/// Translation fault on a section (first-level) descriptor.
pub const FSR_TRANSLATION_SECTION: u32 = 0x5;
/// Translation fault on a page (second-level) descriptor.
pub const FSR_TRANSLATION_PAGE: u32 = 0x7;
/// Synchronous external abort (access beyond backed memory).
pub const FSR_EXTERNAL: u32 = 0x8;
/// Permission fault on a section.
pub const FSR_PERMISSION_SECTION: u32 = 0xD;
/// Permission fault on a page.
pub const FSR_PERMISSION_PAGE: u32 = 0xF;
/// Write-not-read bit of the data fault status register.
pub const FSR_WNR: u32 = 1 << 11;

/// Mask selecting the fault status code from a status register value.
#[inline]
pub const fn fsr_code(status: u32) -> u32 {
    (status & 0xF) | ((status >> 6) & 0x10)
}

/// Which abort registers to read.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// DFAR/DFSR.
    Data,
    /// IFAR/IFSR.
    Prefetch,
}

/// Addresses of the kernel's fault-aware routines and their landing stubs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelText {
    pub phys_copy: Range<usize>,
    /// Landing pad when the copy ran on behalf of a kernel process in its own context.
    pub phys_copy_fault: usize,
    /// Landing pad when the copy ran in kernel context; yields the fault address.
    pub phys_copy_fault_in_kernel: usize,
    pub phys_memset: Range<usize>,
    pub memset_fault: usize,
    pub memset_fault_in_kernel: usize,
    /// Copy of a message into a user buffer.
    pub copy_msg_to_user: Range<usize>,
    pub user_copy_msg_pointer_failure: usize,
}

/// Kernel routine that performs a linear copy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Routine {
    PhysCopy,
    CopyMsgToUser,
}

/// Raw abort raised while a routine touched memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Abort {
    pub vector: Vector,
    /// Program counter of the faulting instruction.
    pub pc: usize,
}

/// CPU-local MMU and fault registers.
pub trait Cpu {
    fn cpu_id(&self) -> CpuId;
    fn read_fault_address(&self, kind: FaultKind) -> LinAddr;
    fn read_fault_status(&self, kind: FaultKind) -> u32;
    /// Currently loaded translation table root.
    fn table_base(&self) -> PhysAddr;
    /// Writes the translation table base register. Does not flush the TLB.
    fn reload_table_base(&mut self, root: PhysAddr);
    fn flush_tlb(&mut self);
    fn barrier(&self);
    fn kernel_text(&self) -> &KernelText;
}

/// Physical memory plus the fault-aware linear copy routines.
pub trait Memory {
    fn phys_get32(&self, addr: PhysAddr) -> u32;
    fn phys_set32(&mut self, addr: PhysAddr, value: u32);
    fn phys_read(&self, addr: PhysAddr, buf: &mut [u8]);
    fn phys_write(&mut self, addr: PhysAddr, buf: &[u8]);
    /// Copies `bytes` between linear addresses of the loaded table.
    fn linear_copy(
        &mut self,
        routine: Routine,
        src: LinAddr,
        dst: LinAddr,
        bytes: u32,
    ) -> Result<(), Abort>;
    /// Fills `bytes` at a linear address with a replicated 32-bit pattern.
    fn linear_memset(&mut self, dst: LinAddr, pattern: u32, bytes: u32) -> Result<(), Abort>;
}

/// Everything the kernel needs from a machine.
pub trait Hardware: Cpu + Memory {}

impl<T: Cpu + Memory> Hardware for T {}
