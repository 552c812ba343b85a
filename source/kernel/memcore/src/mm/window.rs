// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Mapping windows that borrow a 1 MiB view of foreign or physical memory
//! OWNERS: @kernel-mm-team
//! PUBLIC API: WindowPool, WindowSide, WindowTarget, Window, WindowError, create_pde()
//! DEPENDS_ON: arch::Memory, mm::page_table, kernel::CpuLocal
//! INVARIANTS: Each core owns the slot pair [2c, 2c+1]; slots are configured exactly once;
//!             a returned linear address is only valid until the same slot is reused;
//!             the caller reloads the table base when `Window::reload` is set
//! ADR: docs/adr/0001-memory-ownership-core.md

extern crate alloc;

use alloc::vec::Vec;

use crate::arch::Memory;
use crate::error::Errno;
use crate::kernel::CpuLocal;
use crate::mm::page_table::{
    pde_index, section_entry, section_offset, PageTable, PdeFlags, DIR_ENTRIES, SECTION_SIZE,
};
use crate::types::{CpuId, LinAddr, ProcSlot};

/// Slots consumed per core by one copy (source and destination).
pub const WINDOWS_PER_CPU: usize = 2;

/// Which side of a copy a window serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowSide {
    Source = 0,
    Destination = 1,
}

/// Boot-contract violations and lookups before configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowError {
    NotConfigured,
    AlreadyConfigured,
    Empty,
    /// Index beyond the first-level directory.
    OutOfRange(u32),
    Duplicate(u32),
    /// Fewer slots than `WINDOWS_PER_CPU * cores`.
    TooFew { needed: usize, got: usize },
}

impl From<WindowError> for Errno {
    fn from(_: WindowError) -> Self {
        Errno::Invalid
    }
}

/// Directory indices reserved by the memory manager for windows.
#[derive(Debug, Default)]
pub struct WindowPool {
    slots: Vec<usize>,
}

impl WindowPool {
    pub const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn is_configured(&self) -> bool {
        !self.slots.is_empty()
    }

    /// Accepts the memory manager's index set.
    pub fn configure(&mut self, indices: &[u32], cpus: usize) -> Result<(), WindowError> {
        if self.is_configured() {
            return Err(WindowError::AlreadyConfigured);
        }
        if indices.is_empty() {
            return Err(WindowError::Empty);
        }
        let needed = cpus * WINDOWS_PER_CPU;
        if indices.len() < needed {
            return Err(WindowError::TooFew { needed, got: indices.len() });
        }
        let mut slots = Vec::with_capacity(indices.len());
        for &index in indices {
            if index as usize >= DIR_ENTRIES {
                return Err(WindowError::OutOfRange(index));
            }
            if slots.contains(&(index as usize)) {
                return Err(WindowError::Duplicate(index));
            }
            slots.push(index as usize);
        }
        self.slots = slots;
        Ok(())
    }

    /// Directory index used by `cpu` for `side`.
    pub fn slot(&self, cpu: CpuId, side: WindowSide) -> Result<usize, WindowError> {
        if !self.is_configured() {
            return Err(WindowError::NotConfigured);
        }
        self.slots
            .get(cpu.as_index() * WINDOWS_PER_CPU + side as usize)
            .copied()
            .ok_or(WindowError::NotConfigured)
    }

    /// True if `lin` falls inside any reserved slot.
    pub fn covers(&self, lin: LinAddr) -> bool {
        self.slots.contains(&pde_index(lin))
    }
}

/// What a window should show.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowTarget {
    /// Raw physical memory; a section descriptor is synthesized.
    Physical,
    /// Kernel data, already visible in every table.
    Kernel,
    Process { slot: ProcSlot, table: PageTable },
}

/// A borrowed view, valid until the slot is reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub linear: LinAddr,
    /// Usable bytes: the request clamped to the end of the 1 MiB slice.
    pub bytes: u32,
    /// The table base must be reloaded before dereferencing `linear`.
    pub reload: bool,
}

/// Makes `addr` of `target` reachable from the currently loaded table on `cpu`.
#[allow(clippy::too_many_arguments)]
pub fn create_pde<M: Memory + ?Sized>(
    mem: &mut M,
    pool: &WindowPool,
    cpus: &mut [CpuLocal],
    cpu: CpuId,
    target: WindowTarget,
    addr: LinAddr,
    bytes: u32,
    side: WindowSide,
) -> Result<Window, WindowError> {
    let local = &cpus[cpu.as_index()];
    let pde_value = match target {
        WindowTarget::Kernel => return Ok(Window { linear: addr, bytes, reload: false }),
        WindowTarget::Process { slot, .. } if local.ptproc == Some(slot) => {
            return Ok(Window { linear: addr, bytes, reload: false });
        }
        WindowTarget::Process { table, .. } => table.pde(mem, addr),
        WindowTarget::Physical => section_entry(addr, PdeFlags::SECTION_SUPER),
    };

    let slot = pool.slot(cpu, side)?;
    let loaded = local.loaded;
    let slot_addr = loaded.root() + slot as u32 * 4;
    let mut reload = false;
    if mem.phys_get32(slot_addr) != pde_value {
        mem.phys_set32(slot_addr, pde_value);
        reload = true;
        for (index, other) in cpus.iter_mut().enumerate() {
            if index != cpu.as_index() && other.loaded == loaded {
                other.stale_tlb = true;
            }
        }
    }
    let local = &mut cpus[cpu.as_index()];
    if local.stale_tlb {
        local.stale_tlb = false;
        reload = true;
    }

    let offset = section_offset(addr);
    Ok(Window {
        linear: ((slot as u32) << 20) | offset,
        bytes: bytes.min(SECTION_SIZE - offset),
        reload,
    })
}
