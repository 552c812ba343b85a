// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Copies between (endpoint, address) pairs with optional VM-backed fault recovery
//! OWNERS: @kernel-mm-team
//! PUBLIC API: VirAddr, Kernel::{virtual_copy, virtual_copy_vmcheck, data_copy,
//!             data_copy_vmcheck, vm_memset}
//! DEPENDS_ON: copy::engine, vm (suspend/resume), proc::ProcTable
//! INVARIANTS: A zero-length copy is refused; physical faults are never handed to the VM;
//!             a vmcheck copy that faults on a process suspends its caller
//! ADR: docs/adr/0001-memory-ownership-core.md

mod engine;

use crate::arch::Hardware;
use crate::error::Errno;
use crate::kernel::Kernel;
use crate::mm::WindowTarget;
use crate::proc::{RequestKind, RtsFlags};
use crate::types::{Endpoint, LinAddr, ProcSlot};

/// An address in some endpoint's space; `Endpoint::NONE` means physical memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VirAddr {
    pub endpoint: Endpoint,
    pub offset: LinAddr,
}

impl VirAddr {
    pub const fn new(endpoint: Endpoint, offset: LinAddr) -> Self {
        Self { endpoint, offset }
    }

    pub const fn phys(addr: LinAddr) -> Self {
        Self { endpoint: Endpoint::NONE, offset: addr }
    }
}

/// One resolved side of a copy.
#[derive(Clone, Copy, Debug)]
struct Side {
    target: WindowTarget,
    /// Owning process, if any.
    slot: Option<ProcSlot>,
    /// Held back by the VM; treated as faulting.
    inhibited: bool,
}

impl<H: Hardware> Kernel<H> {
    fn copy_side(&self, ep: Endpoint) -> Result<Side, Errno> {
        if ep == Endpoint::NONE {
            return Ok(Side { target: WindowTarget::Physical, slot: None, inhibited: false });
        }
        if ep == Endpoint::KERNEL {
            return Ok(Side { target: WindowTarget::Kernel, slot: None, inhibited: false });
        }
        let slot = self.procs.isokendpt(ep).ok_or(Errno::NoSuchProcess)?;
        let proc = self.procs.get(slot);
        let table = proc.table.ok_or(Errno::Fault)?;
        Ok(Side {
            target: WindowTarget::Process { slot, table },
            slot: Some(slot),
            inhibited: proc.rts.contains(RtsFlags::VMINHIBIT),
        })
    }

    /// Copies without VM involvement; a fault on either side folds to `Fault`.
    pub fn virtual_copy(&mut self, src: VirAddr, dst: VirAddr, bytes: u32) -> Result<(), Errno> {
        self.virtual_copy_f(None, src, dst, bytes).map_err(Errno::fold_copy_fault)
    }

    /// Copies on behalf of `caller`; a fault on a process suspends the caller
    /// and yields `Suspend`.
    pub fn virtual_copy_vmcheck(
        &mut self,
        caller: ProcSlot,
        src: VirAddr,
        dst: VirAddr,
        bytes: u32,
    ) -> Result<(), Errno> {
        self.virtual_copy_f(Some(caller), src, dst, bytes)
    }

    fn virtual_copy_f(
        &mut self,
        caller: Option<ProcSlot>,
        src: VirAddr,
        dst: VirAddr,
        bytes: u32,
    ) -> Result<(), Errno> {
        if bytes == 0 {
            return Err(Errno::Domain);
        }
        let s = self.copy_side(src.endpoint)?;
        let d = self.copy_side(dst.endpoint)?;
        if let Some(caller) = caller {
            self.check_resumed_caller(caller)?;
        }

        let outcome = if s.inhibited {
            Err(Errno::FaultSrc)
        } else if d.inhibited {
            Err(Errno::FaultDst)
        } else {
            self.lin_lin_copy(s.target, src.offset, d.target, dst.offset, bytes)
        };

        let (side, addr, writeflag) = match outcome {
            Err(Errno::FaultSrc) => (s, src.offset, false),
            Err(Errno::FaultDst) => (d, dst.offset, true),
            other => return other,
        };
        match (caller, side.slot) {
            (Some(caller), Some(target)) => {
                self.vm_suspend(caller, target, addr, bytes, writeflag, RequestKind::KernelCall);
                Err(Errno::Suspend)
            }
            _ => outcome,
        }
    }

    /// Endpoint-flavoured `virtual_copy`.
    pub fn data_copy(
        &mut self,
        from: Endpoint,
        from_addr: LinAddr,
        to: Endpoint,
        to_addr: LinAddr,
        bytes: u32,
    ) -> Result<(), Errno> {
        self.virtual_copy(VirAddr::new(from, from_addr), VirAddr::new(to, to_addr), bytes)
    }

    pub fn data_copy_vmcheck(
        &mut self,
        caller: ProcSlot,
        from: Endpoint,
        from_addr: LinAddr,
        to: Endpoint,
        to_addr: LinAddr,
        bytes: u32,
    ) -> Result<(), Errno> {
        self.virtual_copy_vmcheck(
            caller,
            VirAddr::new(from, from_addr),
            VirAddr::new(to, to_addr),
            bytes,
        )
    }

    /// Fills `count` bytes at `addr` of `who` (`NONE` for physical) with `byte`.
    ///
    /// An empty range is `Domain`. A fault in a process suspends `caller` for
    /// the whole range; with no caller it is reported as `Fault`. Faulting on
    /// physical memory is fatal.
    pub fn vm_memset(
        &mut self,
        caller: Option<ProcSlot>,
        who: Endpoint,
        addr: LinAddr,
        byte: u8,
        count: u32,
    ) -> Result<(), Errno> {
        if count == 0 {
            return Err(Errno::Domain);
        }
        if let Some(caller) = caller {
            self.check_resumed_caller(caller)?;
        }
        let side = self.copy_side(who)?;
        let pattern = u32::from_ne_bytes([byte; 4]);
        let outcome = if side.inhibited {
            Err(addr)
        } else {
            self.lin_memset(side.target, addr, pattern, count)
        };
        let Err(fault) = outcome else {
            return Ok(());
        };
        match (side.slot, caller) {
            (Some(target), Some(caller)) => {
                self.vm_suspend(caller, target, addr, count, true, RequestKind::KernelCall);
                Err(Errno::Suspend)
            }
            (Some(_), None) => Err(Errno::Fault),
            (None, _) => kernel_panic!(
                target: "copy",
                "memset fault at 0x{:08x} on {:?} memory",
                fault,
                side.target
            ),
        }
    }
}
