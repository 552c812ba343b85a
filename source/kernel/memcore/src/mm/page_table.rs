// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! ARMv7 short-descriptor two-level translation tables.
//!
//! The kernel only reads these tables; construction belongs to the memory
//! manager and boot code, which use [`PageTable`] to populate them in physical
//! memory through the [`Memory`] seam.

use bitflags::bitflags;

use crate::arch::Memory;
use crate::types::{LinAddr, PhysAddr};

/// Size of a small page in bytes.
pub const PAGE_SIZE: u32 = 4096;
/// Size of a first-level section in bytes.
pub const SECTION_SIZE: u32 = 1 << 20;
/// Entries in the first-level directory.
pub const DIR_ENTRIES: usize = 4096;
/// Entries in a second-level table.
pub const PT_ENTRIES: usize = 256;
/// Bytes occupied by a first-level directory (also its required alignment).
pub const DIR_BYTES: u32 = (DIR_ENTRIES * 4) as u32;
/// Bytes occupied by a second-level table (also its required alignment).
pub const PT_BYTES: u32 = (PT_ENTRIES * 4) as u32;

/// Frame bits of a page-table pointer descriptor.
pub const PDE_MASK: u32 = 0xFFFF_FC00;
/// Frame bits of a section descriptor.
pub const SECTION_MASK: u32 = 0xFFF0_0000;
/// Frame bits of a small-page descriptor.
pub const PTE_MASK: u32 = 0xFFFF_F000;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// First-level descriptor bits.
    pub struct PdeFlags: u32 {
        /// Points to a second-level table.
        const PRESENT = 1 << 0;
        /// Terminal 1 MiB section.
        const SECTION = 1 << 1;
        const BUFFERABLE = 1 << 2;
        const CACHEABLE = 1 << 3;
        const SECTION_SUPER = 1 << 10;
        const SECTION_USER = 1 << 11;
        const SECTION_RO = 1 << 15;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Second-level small-page descriptor bits.
    pub struct PteFlags: u32 {
        const PRESENT = 1 << 1;
        const BUFFERABLE = 1 << 2;
        const CACHEABLE = 1 << 3;
        const SUPER = 1 << 4;
        const USER = 1 << 5;
        const RO = 1 << 9;
    }
}

/// Decoded first-level descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Descriptor {
    Fault,
    Table(PhysAddr),
    Section(PhysAddr),
}

impl Descriptor {
    /// Section bit wins over the table bit, as the hardware walk does.
    #[inline]
    pub const fn decode(raw: u32) -> Self {
        if raw & PdeFlags::SECTION.bits() != 0 {
            Self::Section(raw & SECTION_MASK)
        } else if raw & PdeFlags::PRESENT.bits() != 0 {
            Self::Table(raw & PDE_MASK)
        } else {
            Self::Fault
        }
    }
}

#[inline]
pub const fn pde_index(lin: LinAddr) -> usize {
    (lin >> 20) as usize
}

#[inline]
pub const fn pte_index(lin: LinAddr) -> usize {
    ((lin >> 12) & 0xFF) as usize
}

#[inline]
pub const fn section_offset(lin: LinAddr) -> u32 {
    lin & (SECTION_SIZE - 1)
}

#[inline]
pub const fn page_offset(lin: LinAddr) -> u32 {
    lin & (PAGE_SIZE - 1)
}

/// Builds a section descriptor for `phys` (rounded down to its section).
#[inline]
pub const fn section_entry(phys: PhysAddr, flags: PdeFlags) -> u32 {
    (phys & SECTION_MASK) | PdeFlags::SECTION.bits() | flags.bits()
}

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Virtual or physical address was not suitably aligned.
    Unaligned,
    /// Mapping collides with an existing entry.
    Overlap,
    /// Flags do not describe a valid descriptor.
    InvalidFlags,
    /// No mapping exists at the address.
    NotMapped,
    /// The frame allocator is exhausted.
    NoMemory,
}

/// Bump allocator handing out physical frames for tables and test pages.
#[derive(Clone, Debug)]
pub struct FrameAllocator {
    next: PhysAddr,
    end: PhysAddr,
}

impl FrameAllocator {
    pub const fn new(start: PhysAddr, end: PhysAddr) -> Self {
        Self { next: start, end }
    }

    /// Allocates `bytes` aligned to `align` (a power of two).
    pub fn alloc(&mut self, bytes: u32, align: u32) -> Result<PhysAddr, MapError> {
        let base = self.next.checked_add(align - 1).ok_or(MapError::NoMemory)? & !(align - 1);
        let end = base.checked_add(bytes).ok_or(MapError::NoMemory)?;
        if end > self.end {
            return Err(MapError::NoMemory);
        }
        self.next = end;
        Ok(base)
    }

    pub fn alloc_page(&mut self) -> Result<PhysAddr, MapError> {
        self.alloc(PAGE_SIZE, PAGE_SIZE)
    }
}

/// Handle on a first-level directory living in physical memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageTable {
    root: PhysAddr,
}

impl PageTable {
    /// Allocates and clears a fresh directory.
    pub fn create<M: Memory + ?Sized>(
        mem: &mut M,
        frames: &mut FrameAllocator,
    ) -> Result<Self, MapError> {
        let root = frames.alloc(DIR_BYTES, DIR_BYTES)?;
        zero(mem, root, DIR_BYTES);
        Ok(Self { root })
    }

    pub const fn from_root(root: PhysAddr) -> Self {
        Self { root }
    }

    pub const fn root(&self) -> PhysAddr {
        self.root
    }

    #[inline]
    pub fn pde<M: Memory + ?Sized>(&self, mem: &M, lin: LinAddr) -> u32 {
        mem.phys_get32(self.root + (pde_index(lin) as u32) * 4)
    }

    /// Installs a 4 KiB mapping, allocating the second-level table on demand.
    pub fn map_page<M: Memory + ?Sized>(
        &self,
        mem: &mut M,
        frames: &mut FrameAllocator,
        va: LinAddr,
        pa: PhysAddr,
        flags: PteFlags,
    ) -> Result<(), MapError> {
        if page_offset(va) != 0 || page_offset(pa) != 0 {
            return Err(MapError::Unaligned);
        }
        if !flags.contains(PteFlags::PRESENT) {
            return Err(MapError::InvalidFlags);
        }
        let pde_addr = self.root + (pde_index(va) as u32) * 4;
        let table = match Descriptor::decode(mem.phys_get32(pde_addr)) {
            Descriptor::Section(_) => return Err(MapError::Overlap),
            Descriptor::Table(table) => table,
            Descriptor::Fault => {
                let table = frames.alloc(PT_BYTES, PT_BYTES)?;
                zero(mem, table, PT_BYTES);
                mem.phys_set32(pde_addr, table | PdeFlags::PRESENT.bits());
                table
            }
        };
        let pte_addr = table + (pte_index(va) as u32) * 4;
        if mem.phys_get32(pte_addr) & PteFlags::PRESENT.bits() != 0 {
            return Err(MapError::Overlap);
        }
        mem.phys_set32(pte_addr, pa | flags.bits());
        Ok(())
    }

    /// Maps `len` bytes page by page starting at (`va`, `pa`).
    pub fn map_range<M: Memory + ?Sized>(
        &self,
        mem: &mut M,
        frames: &mut FrameAllocator,
        va: LinAddr,
        pa: PhysAddr,
        len: u32,
        flags: PteFlags,
    ) -> Result<(), MapError> {
        let mut off = 0;
        while off < len {
            self.map_page(mem, frames, va + off, pa + off, flags)?;
            off += PAGE_SIZE;
        }
        Ok(())
    }

    /// Installs a 1 MiB section descriptor.
    pub fn map_section<M: Memory + ?Sized>(
        &self,
        mem: &mut M,
        va: LinAddr,
        pa: PhysAddr,
        flags: PdeFlags,
    ) -> Result<(), MapError> {
        if section_offset(va) != 0 || section_offset(pa) != 0 {
            return Err(MapError::Unaligned);
        }
        if flags.contains(PdeFlags::PRESENT) {
            return Err(MapError::InvalidFlags);
        }
        let pde_addr = self.root + (pde_index(va) as u32) * 4;
        if Descriptor::decode(mem.phys_get32(pde_addr)) != Descriptor::Fault {
            return Err(MapError::Overlap);
        }
        mem.phys_set32(pde_addr, section_entry(pa, flags));
        Ok(())
    }

    /// Copies the first-level entries covering `[va, va + len)` from `other`.
    ///
    /// Used to share the kernel's sections with every process table.
    pub fn share_from<M: Memory + ?Sized>(
        &self,
        mem: &mut M,
        other: &PageTable,
        va: LinAddr,
        len: u32,
    ) {
        let first = pde_index(va);
        let count = len.div_ceil(SECTION_SIZE) as usize;
        for index in first..(first + count).min(DIR_ENTRIES) {
            let value = mem.phys_get32(other.root + index as u32 * 4);
            mem.phys_set32(self.root + index as u32 * 4, value);
        }
    }

    /// Clears the small-page mapping at `va` and returns the frame it held.
    pub fn unmap_page<M: Memory + ?Sized>(
        &self,
        mem: &mut M,
        va: LinAddr,
    ) -> Result<PhysAddr, MapError> {
        let pte_addr = self.pte_addr(mem, va)?;
        let old = mem.phys_get32(pte_addr);
        if old & PteFlags::PRESENT.bits() == 0 {
            return Err(MapError::NotMapped);
        }
        mem.phys_set32(pte_addr, 0);
        Ok(old & PTE_MASK)
    }

    /// Replaces the permission bits of an existing small-page mapping.
    pub fn protect_page<M: Memory + ?Sized>(
        &self,
        mem: &mut M,
        va: LinAddr,
        flags: PteFlags,
    ) -> Result<(), MapError> {
        if !flags.contains(PteFlags::PRESENT) {
            return Err(MapError::InvalidFlags);
        }
        let pte_addr = self.pte_addr(mem, va)?;
        let old = mem.phys_get32(pte_addr);
        if old & PteFlags::PRESENT.bits() == 0 {
            return Err(MapError::NotMapped);
        }
        mem.phys_set32(pte_addr, (old & PTE_MASK) | flags.bits());
        Ok(())
    }

    fn pte_addr<M: Memory + ?Sized>(&self, mem: &M, va: LinAddr) -> Result<PhysAddr, MapError> {
        match Descriptor::decode(self.pde(mem, va)) {
            Descriptor::Table(table) => Ok(table + (pte_index(va) as u32) * 4),
            Descriptor::Section(_) => Err(MapError::Overlap),
            Descriptor::Fault => Err(MapError::NotMapped),
        }
    }
}

fn zero<M: Memory + ?Sized>(mem: &mut M, base: PhysAddr, bytes: u32) {
    let mut off = 0;
    while off < bytes {
        mem.phys_set32(base + off, 0);
        off += 4;
    }
}
