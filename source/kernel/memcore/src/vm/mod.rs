// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Suspend/resume coordination between faulting kernel work and the VM server
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MemRequest, Kernel::{memreq_get, memreq_reply, check_range, restart_pending,
//!             clear_pagefault, set_addrspace, get_pdbr, vm_flush_tlb, set_vminhibit},
//!             RequestQueue
//! DEPENDS_ON: proc (flags, Resumption), vm::queue, syscall (replay)
//! INVARIANTS: A process has at most one outstanding request; the VM is signalled once per
//!             empty-to-non-empty transition; replies are replayed in FIFO order
//! ADR: docs/adr/0001-memory-ownership-core.md

pub mod queue;

pub use queue::{QueueError, RequestQueue};

use crate::arch::Hardware;
use crate::error::Errno;
use crate::kernel::Kernel;
use crate::mm::walk::range_resident;
use crate::mm::PageTable;
use crate::proc::{MiscFlags, RequestKind, Resumption, RtsFlags, Signal, VmRequest, VmState};
use crate::types::{Endpoint, LinAddr, PhysAddr, ProcSlot};

/// What `MEMREQ_GET` hands to the VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemRequest {
    pub requestor: Endpoint,
    pub target: Endpoint,
    pub start: LinAddr,
    pub length: u32,
    pub writeflag: bool,
}

impl<H: Hardware> Kernel<H> {
    /// Parks `caller` until the VM makes `[lin, lin + len)` of `target` accessible.
    pub(crate) fn vm_suspend(
        &mut self,
        caller: ProcSlot,
        target: ProcSlot,
        lin: LinAddr,
        len: u32,
        writeflag: bool,
        kind: RequestKind,
    ) {
        let target_ep = self.procs.endpoint_of(target);
        let proc = self.procs.get_mut(caller);
        if proc.rts.contains(RtsFlags::VMREQUEST) {
            kernel_panic!(target: "vm", "{} suspended twice", proc.endpoint());
        }
        proc.rts.insert(RtsFlags::VMREQUEST);
        proc.vm.request =
            Some(VmRequest { target: target_ep, start: lin, length: len, writeflag, kind });
        proc.vm.state = VmState::Queued;
        proc.vm.result = Err(Errno::Suspend);
        let caller_ep = proc.endpoint();
        self.procs.get_mut(target).rts.insert(RtsFlags::VMREQTARGET);

        match self.vm_requests.enqueue(caller) {
            Ok(true) => self.notify_vm(),
            Ok(false) => {}
            Err(err) => kernel_panic!(target: "vm", "request queue: {:?}", err),
        }
        log_debug!(
            target: "vm",
            "{} suspended: {:?} {}@0x{:08x}+{} write={}",
            caller_ep,
            kind,
            target_ep,
            lin,
            len,
            writeflag
        );
    }

    fn notify_vm(&mut self) {
        match self.procs.isokendpt(self.config.vm) {
            Some(vm) => self.send_sig(vm, Signal::SIGKMEM),
            None => log_warn!(target: "vm", "memory request queued with no VM running"),
        }
    }

    /// While `caller` is being replayed, the VM's answer decides the outcome.
    pub(crate) fn check_resumed_caller(&self, caller: ProcSlot) -> Result<(), Errno> {
        let vm = &self.procs.get(caller).vm;
        if vm.state == VmState::Resumed {
            return vm.result;
        }
        Ok(())
    }

    /// Hands the oldest queued request to the VM.
    pub fn memreq_get(&mut self) -> Result<MemRequest, Errno> {
        let slot = self.vm_requests.dequeue().ok_or(Errno::NoSuchProcess)?;
        let proc = self.procs.get_mut(slot);
        let Some(request) = proc.vm.request else {
            kernel_panic!(target: "vm", "{} queued without a request", proc.endpoint());
        };
        if proc.vm.state != VmState::Queued || !proc.rts.contains(RtsFlags::VMREQUEST) {
            kernel_panic!(target: "vm", "{} queued in state {:?}", proc.endpoint(), proc.vm.state);
        }
        proc.vm.state = VmState::AwaitingReply;
        Ok(MemRequest {
            requestor: proc.endpoint(),
            target: request.target,
            start: request.start,
            length: request.length,
            writeflag: request.writeflag,
        })
    }

    /// Records the VM's answer for `requestor`.
    ///
    /// Kernel calls move to the restart queue; message deliveries become
    /// runnable and retry on their own.
    pub fn memreq_reply(
        &mut self,
        requestor: Endpoint,
        result: Result<(), Errno>,
    ) -> Result<(), Errno> {
        let slot = self.procs.isokendpt(requestor).ok_or(Errno::Invalid)?;
        if result == Err(Errno::Suspend) {
            kernel_panic!(target: "vm", "VM answered {} with a suspend", requestor);
        }
        let proc = self.procs.get_mut(slot);
        let request = match proc.vm.request {
            Some(req) if proc.vm.state == VmState::AwaitingReply => req,
            _ => kernel_panic!(target: "vm", "reply for {} with nothing pending", requestor),
        };
        proc.vm.request = None;
        proc.rts.remove(RtsFlags::VMREQUEST);
        match request.kind {
            RequestKind::KernelCall => {
                proc.vm.state = VmState::Resumed;
                proc.vm.result = result;
                if let Err(err) = self.restarts.enqueue(slot) {
                    kernel_panic!(target: "vm", "restart queue: {:?}", err);
                }
            }
            RequestKind::DeliverMsg => {
                if !proc.misc.contains(MiscFlags::DELIVERMSG) {
                    kernel_panic!(target: "vm", "{} delivery reply without message", requestor);
                }
                proc.vm = Resumption::default();
            }
        }
        self.release_target(request.target);
        log_debug!(target: "vm", "reply for {}: {:?}", requestor, result);
        Ok(())
    }

    /// Drops VMREQTARGET from `target` once nobody waits on its memory.
    fn release_target(&mut self, target: Endpoint) {
        let Some(slot) = self.procs.isokendpt(target) else {
            return;
        };
        let still_wanted = (0..crate::types::NR_SLOTS).map(ProcSlot::from_index).any(|s| {
            let p = self.procs.get(s);
            !p.is_free() && p.vm.request.is_some_and(|r| r.target == target)
        });
        if !still_wanted {
            self.procs.get_mut(slot).rts.remove(RtsFlags::VMREQTARGET);
        }
    }

    /// Succeeds when `[addr, addr + len)` of `target` is resident (and writable
    /// if `write`); otherwise asks the VM and suspends `caller`.
    pub fn check_range(
        &mut self,
        caller: ProcSlot,
        target: Endpoint,
        addr: LinAddr,
        len: u32,
        write: bool,
    ) -> Result<(), Errno> {
        if self.procs.get(caller).vm.state == VmState::Resumed {
            return self.procs.get(caller).vm.result;
        }
        let slot = self.procs.isokendpt(target).ok_or(Errno::NoSuchProcess)?;
        let proc = self.procs.get(slot);
        let table = proc.table.ok_or(Errno::Fault)?;
        if !proc.rts.contains(RtsFlags::VMINHIBIT)
            && range_resident(&self.hw, &table, addr, len, write)
        {
            return Ok(());
        }
        self.vm_suspend(caller, slot, addr, len, write, RequestKind::KernelCall);
        Err(Errno::Suspend)
    }

    /// Forgets every VM interaction of `slot`.
    pub(crate) fn clear_memreq(&mut self, slot: ProcSlot) {
        self.vm_requests.remove(slot);
        self.restarts.remove(slot);
        let proc = self.procs.get_mut(slot);
        let pending = proc.vm.request.take();
        proc.vm = Resumption::default();
        proc.rts.remove(RtsFlags::VMREQUEST | RtsFlags::VMREQTARGET);
        if let Some(request) = pending {
            self.release_target(request.target);
        }
    }

    /// Replays every answered kernel call in reply order; returns how many ran.
    pub fn restart_pending(&mut self) -> usize {
        let mut replayed = 0;
        while let Some(slot) = self.restarts.dequeue() {
            self.kernel_call_resume(slot);
            replayed += 1;
        }
        replayed
    }

    /// Lets a process that faulted on its own run again.
    pub fn clear_pagefault(&mut self, ep: Endpoint) -> Result<(), Errno> {
        let slot = self.procs.isokendpt(ep).ok_or(Errno::Invalid)?;
        let proc = self.procs.get_mut(slot);
        if !proc.rts.contains(RtsFlags::PAGEFAULT) {
            return Err(Errno::Invalid);
        }
        proc.rts.remove(RtsFlags::PAGEFAULT);
        Ok(())
    }

    /// Installs a VM-built translation table for `ep`.
    pub fn set_addrspace(&mut self, ep: Endpoint, root: PhysAddr) -> Result<(), Errno> {
        let slot = self.procs.isokendpt(ep).ok_or(Errno::Invalid)?;
        if root & (crate::mm::page_table::DIR_BYTES - 1) != 0 {
            return Err(Errno::Invalid);
        }
        let table = PageTable::from_root(root);
        let proc = self.procs.get_mut(slot);
        proc.table = Some(table);
        proc.rts.remove(RtsFlags::VMINHIBIT);
        let here = self.cpu().as_index();
        for (index, local) in self.cpus.iter_mut().enumerate() {
            if local.ptproc == Some(slot) {
                local.loaded = table;
                if index != here {
                    local.stale_tlb = true;
                }
            }
        }
        if self.local().ptproc == Some(slot) {
            self.reload_loaded();
        }
        log_debug!(target: "vm", "{} table at 0x{:08x}", ep, root);
        Ok(())
    }

    pub fn get_pdbr(&self, ep: Endpoint) -> Result<PhysAddr, Errno> {
        let slot = self.procs.isokendpt(ep).ok_or(Errno::Invalid)?;
        self.procs.get(slot).table.map(|t| t.root()).ok_or(Errno::Fault)
    }

    /// Flushes this core's TLB and marks every other core stale.
    pub fn vm_flush_tlb(&mut self) {
        let here = self.cpu().as_index();
        for (index, local) in self.cpus.iter_mut().enumerate() {
            if index != here {
                local.stale_tlb = true;
            }
        }
        self.hw.flush_tlb();
    }

    /// Holds back (or releases) `ep` while the VM rebuilds its address space.
    pub fn set_vminhibit(&mut self, ep: Endpoint, inhibit: bool) -> Result<(), Errno> {
        let slot = self.procs.isokendpt(ep).ok_or(Errno::Invalid)?;
        let proc = self.procs.get_mut(slot);
        proc.rts.set(RtsFlags::VMINHIBIT, inhibit);
        if !inhibit {
            self.vm_flush_tlb();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
