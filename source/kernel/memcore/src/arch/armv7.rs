// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: ARMv7-A CP15 register access for the memory core
//! OWNERS: @kernel-arch-team
//! PUBLIC API: Armv7Cpu
//! DEPENDS_ON: arch::Cpu, routine bounds exported by the platform linker script
//! INVARIANTS: TTBR0 writes are followed by isb; TLB invalidation is followed by dsb + isb.
//!             Physical access and the copy routines live in platform assembly, which
//!             pairs this type with its own `Memory` implementation
//! ADR: docs/adr/0001-memory-ownership-core.md

use core::arch::asm;
use core::ptr::addr_of;

use super::{Cpu, FaultKind, KernelText};
use crate::types::{CpuId, LinAddr, PhysAddr};

/// TTBR0 bits below the directory base (walk attributes).
const TTBR_ATTR_MASK: u32 = 0x3FFF;

extern "C" {
    static __phys_copy_start: u8;
    static __phys_copy_end: u8;
    static __phys_copy_fault: u8;
    static __phys_copy_fault_in_kernel: u8;
    static __phys_memset_start: u8;
    static __phys_memset_end: u8;
    static __memset_fault: u8;
    static __memset_fault_in_kernel: u8;
    static __copy_msg_to_user_start: u8;
    static __copy_msg_to_user_end: u8;
    static __user_copy_msg_pointer_failure: u8;
}

/// Register view of the core executing the kernel.
pub struct Armv7Cpu {
    text: KernelText,
}

impl Armv7Cpu {
    /// Builds the view from the routine bounds the linker placed.
    pub fn new() -> Self {
        // SAFETY: only the addresses of linker symbols are taken; nothing is read.
        let text = unsafe {
            KernelText {
                phys_copy: addr_of!(__phys_copy_start) as usize
                    ..addr_of!(__phys_copy_end) as usize,
                phys_copy_fault: addr_of!(__phys_copy_fault) as usize,
                phys_copy_fault_in_kernel: addr_of!(__phys_copy_fault_in_kernel) as usize,
                phys_memset: addr_of!(__phys_memset_start) as usize
                    ..addr_of!(__phys_memset_end) as usize,
                memset_fault: addr_of!(__memset_fault) as usize,
                memset_fault_in_kernel: addr_of!(__memset_fault_in_kernel) as usize,
                copy_msg_to_user: addr_of!(__copy_msg_to_user_start) as usize
                    ..addr_of!(__copy_msg_to_user_end) as usize,
                user_copy_msg_pointer_failure: addr_of!(__user_copy_msg_pointer_failure)
                    as usize,
            }
        };
        Self { text }
    }
}

impl Default for Armv7Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu for Armv7Cpu {
    fn cpu_id(&self) -> CpuId {
        let mpidr: u32;
        // SAFETY: MPIDR is a read-only identification register.
        unsafe {
            asm!("mrc p15, 0, {0}, c0, c0, 5", out(reg) mpidr, options(nomem, nostack));
        }
        CpuId::from_raw((mpidr & 0xFF) as u16)
    }

    fn read_fault_address(&self, kind: FaultKind) -> LinAddr {
        let value: u32;
        // SAFETY: DFAR/IFAR reads have no side effects.
        unsafe {
            match kind {
                FaultKind::Data => {
                    asm!("mrc p15, 0, {0}, c6, c0, 0", out(reg) value, options(nomem, nostack))
                }
                FaultKind::Prefetch => {
                    asm!("mrc p15, 0, {0}, c6, c0, 2", out(reg) value, options(nomem, nostack))
                }
            }
        }
        value
    }

    fn read_fault_status(&self, kind: FaultKind) -> u32 {
        let value: u32;
        // SAFETY: DFSR/IFSR reads have no side effects.
        unsafe {
            match kind {
                FaultKind::Data => {
                    asm!("mrc p15, 0, {0}, c5, c0, 0", out(reg) value, options(nomem, nostack))
                }
                FaultKind::Prefetch => {
                    asm!("mrc p15, 0, {0}, c5, c0, 1", out(reg) value, options(nomem, nostack))
                }
            }
        }
        value
    }

    fn table_base(&self) -> PhysAddr {
        let ttbr: u32;
        // SAFETY: TTBR0 read.
        unsafe {
            asm!("mrc p15, 0, {0}, c2, c0, 0", out(reg) ttbr, options(nomem, nostack));
        }
        ttbr & !TTBR_ATTR_MASK
    }

    fn reload_table_base(&mut self, root: PhysAddr) {
        // SAFETY: callers hand in a directory that maps the kernel section, so the
        // instruction stream survives the switch.
        unsafe {
            asm!("mcr p15, 0, {0}, c2, c0, 0", "isb", in(reg) root, options(nostack));
        }
    }

    fn flush_tlb(&mut self) {
        // SAFETY: invalidating the unified TLB only drops cached translations.
        unsafe {
            #[cfg(feature = "smp")]
            asm!("dsb", "mcr p15, 0, {0}, c8, c3, 0", "dsb", "isb", in(reg) 0u32, options(nostack));
            #[cfg(not(feature = "smp"))]
            asm!("dsb", "mcr p15, 0, {0}, c8, c7, 0", "dsb", "isb", in(reg) 0u32, options(nostack));
        }
    }

    fn barrier(&self) {
        // SAFETY: barriers have no operands.
        unsafe {
            asm!("dsb", "isb", options(nostack, preserves_flags));
        }
    }

    fn kernel_text(&self) -> &KernelText {
        &self.text
    }
}
