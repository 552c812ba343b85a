// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel state owned by the memory core and its per-CPU view
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Kernel::{new, cpu_online, spawn, free_process, set_window_slots,
//!             switch_address_space, set_current, post_message}, CpuLocal
//! DEPENDS_ON: arch::Hardware, proc, mm, vm, ipc, syscall
//! INVARIANTS: All mutation happens on the calling core; Kernel is neither Send nor Sync;
//!             window slots are configured exactly once
//! ADR: docs/adr/0001-memory-ownership-core.md

extern crate alloc;

use alloc::vec::Vec;
use core::marker::PhantomData;

use crate::arch::Hardware;
use crate::config::{ConfigError, KernelConfig};
use crate::error::Errno;
use crate::ipc::Router;
use crate::mm::{PageTable, WindowPool, SCRATCH_BYTES};
use crate::proc::{MiscFlags, PendingMessage, Privileges, ProcTable, Signal};
use crate::syscall::SyscallTable;
use crate::types::{CpuId, Endpoint, LinAddr, ProcSlot};
use crate::vm::RequestQueue;

/// Per-core memory state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuLocal {
    /// Process whose table is loaded; `None` while the kernel table is loaded.
    pub ptproc: Option<ProcSlot>,
    /// Table currently in the base register.
    pub loaded: PageTable,
    /// Another core changed a window entry of `loaded`.
    pub stale_tlb: bool,
    /// Process interrupted by the current trap or kernel call.
    pub current: Option<ProcSlot>,
    /// Nesting depth of fault-catching routines running on this core.
    pub catch_pagefaults: u32,
}

impl CpuLocal {
    const fn boot(kernel_table: PageTable) -> Self {
        Self {
            ptproc: None,
            loaded: kernel_table,
            stale_tlb: false,
            current: None,
            catch_pagefaults: 0,
        }
    }
}

/// The memory core of one kernel instance.
pub struct Kernel<H: Hardware> {
    pub(crate) hw: H,
    pub(crate) config: KernelConfig,
    pub(crate) procs: ProcTable,
    pub(crate) cpus: Vec<CpuLocal>,
    pub(crate) windows: WindowPool,
    /// Requests waiting for the VM to pick them up.
    pub(crate) vm_requests: RequestQueue,
    /// Callers whose requests were answered and whose calls must be replayed.
    pub(crate) restarts: RequestQueue,
    pub(crate) router: Router,
    pub(crate) calls: SyscallTable<H>,
    #[cfg(feature = "failpoints")]
    pub(crate) failpoints: crate::failpoints::Failpoints,
    kernel_table: PageTable,
    _not_send: PhantomData<*mut ()>,
}

static_assertions::assert_not_impl_any!(Kernel<crate::arch::sim::SimMachine>: Send, Sync);

impl<H: Hardware> Kernel<H> {
    /// Takes over `hw` with `kernel_table` loaded on the calling core.
    pub fn new(hw: H, config: KernelConfig, kernel_table: PageTable) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut kernel = Self {
            hw,
            config,
            procs: ProcTable::new(),
            cpus: (0..config.cpus).map(|_| CpuLocal::boot(kernel_table)).collect(),
            windows: WindowPool::new(),
            vm_requests: RequestQueue::new(),
            restarts: RequestQueue::new(),
            router: Router::new(config.ipc_queue_depth),
            calls: SyscallTable::new(),
            #[cfg(feature = "failpoints")]
            failpoints: crate::failpoints::Failpoints::new(),
            kernel_table,
            _not_send: PhantomData,
        };
        crate::syscall::api::install_handlers(&mut kernel.calls);
        kernel.cpu_online();
        log_info!(target: "mm", "memcore up: {} cpu(s), vm={}", config.cpus, config.vm);
        Ok(kernel)
    }

    /// Loads the kernel table on the calling core.
    pub fn cpu_online(&mut self) {
        let cpu = self.cpu();
        self.cpus[cpu.as_index()] = CpuLocal::boot(self.kernel_table);
        self.hw.reload_table_base(self.kernel_table.root());
        self.hw.barrier();
        self.hw.flush_tlb();
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn hw(&self) -> &H {
        &self.hw
    }

    pub fn hw_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    pub fn procs(&self) -> &ProcTable {
        &self.procs
    }

    pub fn procs_mut(&mut self) -> &mut ProcTable {
        &mut self.procs
    }

    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    #[cfg(feature = "failpoints")]
    pub fn failpoints(&self) -> &crate::failpoints::Failpoints {
        &self.failpoints
    }

    pub fn kernel_table(&self) -> PageTable {
        self.kernel_table
    }

    #[inline]
    pub fn cpu(&self) -> CpuId {
        self.hw.cpu_id()
    }

    pub fn cpu_local(&self, cpu: CpuId) -> &CpuLocal {
        &self.cpus[cpu.as_index()]
    }

    #[inline]
    pub(crate) fn local(&self) -> &CpuLocal {
        &self.cpus[self.cpu().as_index()]
    }

    #[inline]
    pub(crate) fn local_mut(&mut self) -> &mut CpuLocal {
        let cpu = self.cpu();
        &mut self.cpus[cpu.as_index()]
    }

    /// Boot contract: the VM hands over its reserved directory indices once.
    pub fn set_window_slots(&mut self, indices: &[u32]) {
        if let Err(err) = self.windows.configure(indices, self.config.cpus) {
            kernel_panic!(target: "mm", "window slot set rejected: {:?}", err);
        }
        log_info!(target: "mm", "{} window slot(s) reserved", indices.len());
    }

    pub fn windows(&self) -> &WindowPool {
        &self.windows
    }

    pub fn spawn(&mut self, proc_nr: i32, privileges: Privileges) -> Result<Endpoint, Errno> {
        Ok(self.procs.spawn(proc_nr, privileges)?)
    }

    /// Releases a process: drops its VM requests, mailbox and table.
    pub fn free_process(&mut self, ep: Endpoint) -> Result<(), Errno> {
        let slot = self.procs.isokendpt(ep).ok_or(Errno::NoSuchProcess)?;
        self.clear_memreq(slot);
        self.router.clear(slot);
        let kernel_table = self.kernel_table;
        let here = self.cpu();
        for (index, local) in self.cpus.iter_mut().enumerate() {
            if local.current == Some(slot) {
                local.current = None;
            }
            if local.ptproc == Some(slot) {
                local.ptproc = None;
                local.loaded = kernel_table;
                if index == here.as_index() {
                    self.hw.reload_table_base(kernel_table.root());
                    self.hw.barrier();
                    self.hw.flush_tlb();
                } else {
                    local.stale_tlb = true;
                }
            }
        }
        self.procs.free(ep)?;
        log_debug!(target: "mm", "freed {}", ep);
        Ok(())
    }

    /// Loads `slot`'s table (or the kernel table) on the calling core.
    pub fn switch_address_space(&mut self, slot: Option<ProcSlot>) -> Result<(), Errno> {
        let table = match slot {
            Some(s) => self.procs.get(s).table.ok_or(Errno::Fault)?,
            None => self.kernel_table,
        };
        let local = self.local_mut();
        local.ptproc = slot;
        let changed = local.loaded != table;
        local.loaded = table;
        if changed || self.hw.table_base() != table.root() {
            self.hw.reload_table_base(table.root());
            self.hw.barrier();
            self.hw.flush_tlb();
        }
        Ok(())
    }

    /// Records which process the calling core is running.
    pub fn set_current(&mut self, slot: Option<ProcSlot>) {
        self.local_mut().current = slot;
    }

    /// Queues `bytes` for delivery into `ep`'s buffer at `buffer`.
    pub fn post_message(
        &mut self,
        ep: Endpoint,
        buffer: LinAddr,
        bytes: &[u8],
    ) -> Result<(), Errno> {
        let slot = self.procs.isokendpt(ep).ok_or(Errno::NoSuchProcess)?;
        let proc = self.procs.get_mut(slot);
        if proc.misc.contains(MiscFlags::DELIVERMSG) || bytes.len() > SCRATCH_BYTES as usize {
            return Err(Errno::Invalid);
        }
        proc.delivery = Some(PendingMessage { buffer, bytes: bytes.to_vec() });
        proc.misc.insert(MiscFlags::DELIVERMSG);
        Ok(())
    }

    /// Raises a kernel signal on `slot` and notifies it from SYSTEM.
    pub(crate) fn send_sig(&mut self, slot: ProcSlot, sig: Signal) {
        self.procs.get_mut(slot).signals.insert(sig);
        if let Err(err) = self.router.notify(slot, Endpoint::SYSTEM, sig.bits()) {
            kernel_panic!(target: "mm", "notify {} failed: {:?}", slot, err);
        }
    }

    /// Marks a signal pending for the signal manager to deliver.
    pub(crate) fn cause_sig(&mut self, slot: ProcSlot, sig: Signal) {
        let proc = self.procs.get_mut(slot);
        proc.signals.insert(sig);
        log_warn!(target: "mm", "signal {:?} raised on {}", sig, proc.endpoint());
    }

    /// Replaces `SELF` with the caller's endpoint.
    pub(crate) fn resolve_self(&self, caller: ProcSlot, ep: Endpoint) -> Endpoint {
        if ep == Endpoint::SELF {
            self.procs.endpoint_of(caller)
        } else {
            ep
        }
    }
}
