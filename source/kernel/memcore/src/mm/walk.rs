// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Software walk of a process's two-level translation table
//! OWNERS: @kernel-mm-team
//! PUBLIC API: lookup(), lookup_range(), Translation, WalkError
//! DEPENDS_ON: arch::Memory, mm::page_table
//! INVARIANTS: Read-only; never allocates; a section answer carries the
//!             section-local offset, a page answer the page-local offset

use crate::arch::Memory;
use crate::error::Errno;
use crate::mm::page_table::{
    page_offset, pte_index, section_offset, Descriptor, PageTable, PdeFlags, PteFlags, PAGE_SIZE,
    PTE_MASK,
};
use crate::types::{LinAddr, PhysAddr};

/// Result of a successful walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Translation {
    pub phys: PhysAddr,
    /// Raw terminal descriptor (section or small page).
    pub entry: u32,
    pub section: bool,
}

impl Translation {
    pub const fn writable(&self) -> bool {
        if self.section {
            self.entry & PdeFlags::SECTION_RO.bits() == 0
        } else {
            self.entry & PteFlags::RO.bits() == 0
        }
    }
}

/// Why a walk stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkError {
    /// First-level entry neither a section nor a table pointer.
    DirectoryNotPresent,
    /// Second-level entry not present.
    PageNotPresent,
}

impl From<WalkError> for Errno {
    fn from(_: WalkError) -> Self {
        Errno::Fault
    }
}

/// Resolves `virt` in `table`.
pub fn lookup<M: Memory + ?Sized>(
    mem: &M,
    table: &PageTable,
    virt: LinAddr,
) -> Result<Translation, WalkError> {
    let pde = table.pde(mem, virt);
    match Descriptor::decode(pde) {
        Descriptor::Fault => Err(WalkError::DirectoryNotPresent),
        Descriptor::Section(base) => {
            Ok(Translation { phys: base + section_offset(virt), entry: pde, section: true })
        }
        Descriptor::Table(pt) => {
            let pte = mem.phys_get32(pt + (pte_index(virt) as u32) * 4);
            if pte & PteFlags::PRESENT.bits() == 0 {
                return Err(WalkError::PageNotPresent);
            }
            Ok(Translation {
                phys: (pte & PTE_MASK) + page_offset(virt),
                entry: pte,
                section: false,
            })
        }
    }
}

/// Length of the leading physically contiguous part of `[virt, virt + bytes)`.
///
/// Returns the start of that run with its length, or `None` when the first
/// page is not resident.
pub fn lookup_range<M: Memory + ?Sized>(
    mem: &M,
    table: &PageTable,
    virt: LinAddr,
    bytes: u32,
) -> Option<(PhysAddr, u32)> {
    if bytes == 0 {
        return None;
    }
    let first = lookup(mem, table, virt).ok()?;
    let mut len = (PAGE_SIZE - page_offset(virt)).min(bytes);
    let mut next_phys = first.phys + len;
    while len < bytes {
        let cursor = virt.wrapping_add(len);
        if cursor < virt {
            break;
        }
        match lookup(mem, table, cursor) {
            Ok(t) if t.phys == next_phys => {
                let chunk = PAGE_SIZE.min(bytes - len);
                len += chunk;
                next_phys += chunk;
            }
            _ => break,
        }
    }
    Some((first.phys, len))
}

/// True when every page of the range is resident (and writable if `write`).
pub fn range_resident<M: Memory + ?Sized>(
    mem: &M,
    table: &PageTable,
    virt: LinAddr,
    bytes: u32,
    write: bool,
) -> bool {
    let end = virt as u64 + bytes as u64;
    let mut cursor = virt as u64;
    while cursor < end {
        match lookup(mem, table, cursor as u32) {
            Ok(t) if !write || t.writable() => {}
            _ => return false,
        }
        cursor = (cursor & !(PAGE_SIZE as u64 - 1)) + PAGE_SIZE as u64;
    }
    true
}
