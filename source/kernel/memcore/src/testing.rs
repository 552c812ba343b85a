// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host test harness: a simulated machine with a booted kernel, process tables
//! built the way the memory manager builds them, a stub memory manager and a
//! capturing log sink.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use spin::Mutex;

use crate::arch::sim::SimMachine;
use crate::arch::Memory;
use crate::config::KernelConfig;
use crate::grant::{Grant, GrantId, GRANT_RECORD_LEN};
use crate::kernel::Kernel;
use crate::log::{self, Level, LineFormat, LogSink};
use crate::mm::page_table::page_offset;
use crate::mm::walk::lookup;
use crate::mm::window::WINDOWS_PER_CPU;
use crate::mm::{
    map_kernel_section, FrameAllocator, PageTable, PteFlags, KERNEL_PHYS_BASE, KERNEL_SPAN,
    PAGE_SIZE,
};
use crate::proc::Privileges;
use crate::syscall::{Args, Reply, SysResult, KCALL_VMCTL, VMCTL_MEMREQ_GET, VMCTL_MEMREQ_REPLY};
use crate::types::{CpuId, Endpoint, LinAddr, PhysAddr, ProcSlot};

pub(crate) const RAM_BYTES: u32 = 8 << 20;
/// Frames for tables and user pages start right after the kernel section.
const FRAMES_START: PhysAddr = KERNEL_PHYS_BASE + KERNEL_SPAN;
/// First directory index handed to the kernel for windows.
pub(crate) const WINDOW_BASE: u32 = 0xE00;
/// Where test processes keep their data.
pub(crate) const USER_BASE: LinAddr = 0x0040_0000;
/// Where test processes keep their grant table.
pub(crate) const GRANT_TABLE_VA: LinAddr = 0x0030_0000;

const USER_RW: PteFlags = PteFlags::PRESENT.union(PteFlags::USER);

/// Maps `len` bytes at `va` of `table` onto fresh, physically contiguous frames.
fn map_fresh(
    hw: &mut SimMachine,
    frames: &mut FrameAllocator,
    table: &PageTable,
    va: LinAddr,
    len: u32,
    flags: PteFlags,
) -> PhysAddr {
    let len = len.div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE;
    let phys = frames.alloc(len, PAGE_SIZE).expect("test RAM exhausted");
    let mut off = 0;
    while off < len {
        hw.phys_write(phys + off, &[0u8; PAGE_SIZE as usize]);
        off += PAGE_SIZE;
    }
    table.map_range(hw, frames, va, phys, len, flags).expect("map test pages");
    phys
}

/// Builds a process directory the way the memory manager does: kernel section
/// shared, user pages on demand.
pub(crate) struct PageTableBuilder<'a> {
    hw: &'a mut SimMachine,
    frames: &'a mut FrameAllocator,
    table: PageTable,
}

impl<'a> PageTableBuilder<'a> {
    pub(crate) fn new(hw: &'a mut SimMachine, frames: &'a mut FrameAllocator) -> Self {
        let table = PageTable::create(hw, frames).expect("directory");
        map_kernel_section(hw, &table).expect("kernel section");
        Self { hw, frames, table }
    }

    pub(crate) fn map(self, va: LinAddr, len: u32) -> Self {
        map_fresh(self.hw, self.frames, &self.table, va, len, USER_RW);
        self
    }

    pub(crate) fn build(self) -> PageTable {
        self.table
    }
}

/// A booted kernel on a simulated machine plus the VM process.
pub(crate) struct Harness {
    pub k: Kernel<SimMachine>,
    pub frames: FrameAllocator,
    pub vm: Endpoint,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_config(KernelConfig::default())
    }

    pub(crate) fn with_cpus(cpus: usize) -> Self {
        Self::with_config(KernelConfig::default().with_cpus(cpus))
    }

    pub(crate) fn with_config(config: KernelConfig) -> Self {
        let mut hw = SimMachine::new(config.cpus, RAM_BYTES);
        let mut frames = FrameAllocator::new(FRAMES_START, RAM_BYTES);
        let kernel_table = PageTable::create(&mut hw, &mut frames).expect("kernel directory");
        map_kernel_section(&mut hw, &kernel_table).expect("kernel section");
        let mut k = Kernel::new(hw, config, kernel_table).expect("valid config");
        for cpu in 1..config.cpus {
            k.hw_mut().select_cpu(CpuId::from_raw(cpu as u16));
            k.cpu_online();
        }
        k.hw_mut().select_cpu(CpuId::BOOT);
        let slots: Vec<u32> =
            (0..(config.cpus * WINDOWS_PER_CPU) as u32).map(|i| WINDOW_BASE + i).collect();
        k.set_window_slots(&slots);

        let mut harness = Self { k, frames, vm: config.vm };
        let vm = harness.spawn(config.vm.proc_nr(), Privileges::vm());
        assert_eq!(vm, config.vm);
        harness
    }

    /// Spawns a process with an empty user space.
    pub(crate) fn spawn(&mut self, proc_nr: i32, privileges: Privileges) -> Endpoint {
        let ep = self.k.spawn(proc_nr, privileges).expect("free slot");
        let table = PageTableBuilder::new(&mut self.k.hw, &mut self.frames).build();
        self.k.set_addrspace(ep, table.root()).expect("aligned root");
        ep
    }

    pub(crate) fn user(&mut self, proc_nr: i32) -> Endpoint {
        self.spawn(proc_nr, Privileges::user())
    }

    pub(crate) fn system(&mut self, proc_nr: i32) -> Endpoint {
        self.spawn(proc_nr, Privileges::system())
    }

    pub(crate) fn slot(&self, ep: Endpoint) -> ProcSlot {
        self.k.procs.isokendpt(ep).expect("live endpoint")
    }

    pub(crate) fn table(&self, ep: Endpoint) -> PageTable {
        self.k.procs.get(self.slot(ep)).table.expect("process table")
    }

    /// Maps fresh writable pages; returns the physical base.
    pub(crate) fn map(&mut self, ep: Endpoint, va: LinAddr, len: u32) -> PhysAddr {
        let table = self.table(ep);
        map_fresh(&mut self.k.hw, &mut self.frames, &table, va, len, USER_RW)
    }

    pub(crate) fn map_ro(&mut self, ep: Endpoint, va: LinAddr, len: u32) -> PhysAddr {
        let table = self.table(ep);
        map_fresh(&mut self.k.hw, &mut self.frames, &table, va, len, USER_RW | PteFlags::RO)
    }

    /// Writes into a process's memory behind the kernel's back.
    pub(crate) fn poke(&mut self, ep: Endpoint, va: LinAddr, bytes: &[u8]) {
        let table = self.table(ep);
        let mut done = 0usize;
        while done < bytes.len() {
            let at = va + done as u32;
            let n = ((PAGE_SIZE - page_offset(at)) as usize).min(bytes.len() - done);
            let phys = lookup(&self.k.hw, &table, at).expect("poke of unmapped page").phys;
            self.k.hw.phys_write(phys, &bytes[done..done + n]);
            done += n;
        }
    }

    pub(crate) fn peek(&self, ep: Endpoint, va: LinAddr, len: usize) -> Vec<u8> {
        let table = self.table(ep);
        let mut out = Vec::new();
        out.resize(len, 0u8);
        let mut done = 0usize;
        while done < len {
            let at = va + done as u32;
            let n = ((PAGE_SIZE - page_offset(at)) as usize).min(len - done);
            let phys = lookup(&self.k.hw, &table, at).expect("peek of unmapped page").phys;
            self.k.hw.phys_read(phys, &mut out[done..done + n]);
            done += n;
        }
        out
    }

    /// Maps and registers a grant table of `entries` records at `GRANT_TABLE_VA`.
    pub(crate) fn grant_table(&mut self, ep: Endpoint, entries: u32) {
        self.map(ep, GRANT_TABLE_VA, entries * GRANT_RECORD_LEN as u32);
        let slot = self.slot(ep);
        self.k.set_grant_table(slot, GRANT_TABLE_VA, entries).expect("grant table");
    }

    /// Stores `grant` at `index` of `ep`'s table and returns its id.
    pub(crate) fn put_grant(&mut self, ep: Endpoint, index: u32, grant: Grant) -> GrantId {
        let at = GRANT_TABLE_VA + index * GRANT_RECORD_LEN as u32;
        self.poke(ep, at, &grant.encode());
        GrantId::new(index, grant.seq)
    }

    pub(crate) fn revoke_grant(&mut self, ep: Endpoint, index: u32) {
        let at = GRANT_TABLE_VA + index * GRANT_RECORD_LEN as u32;
        self.poke(ep, at, &Grant::revoked());
    }

    pub(crate) fn call(
        &mut self,
        ep: Endpoint,
        number: usize,
        regs: [usize; 6],
    ) -> SysResult<Reply> {
        self.k.kernel_call(ep, number, Args::new(regs))
    }

    /// Plays the memory manager: maps whatever each request is missing, replies
    /// success and replays the answered calls. Returns how many were served.
    pub(crate) fn run_vm(&mut self) -> usize {
        self.answer_vm(true)
    }

    /// Like `run_vm`, but `map == false` replies without touching any table.
    pub(crate) fn answer_vm(&mut self, map: bool) -> usize {
        let mut served = 0;
        while let Ok(req) = self.call(self.vm, KCALL_VMCTL, [VMCTL_MEMREQ_GET, 0, 0, 0, 0, 0]) {
            let requestor = Endpoint::decode(req.get(0));
            if map {
                let target = Endpoint::decode(req.get(1));
                self.fault_in(target, req.get(2) as LinAddr, req.get(3) as u32, req.get(4) != 0);
            }
            let reply = [VMCTL_MEMREQ_REPLY, requestor.encode(), 0, 0, 0, 0];
            self.call(self.vm, KCALL_VMCTL, reply).expect("reply accepted");
            served += 1;
        }
        self.k.restart_pending();
        served
    }

    fn fault_in(&mut self, ep: Endpoint, start: LinAddr, len: u32, write: bool) {
        let table = self.table(ep);
        let end = start as u64 + len.max(1) as u64;
        let mut page = (start & !(PAGE_SIZE - 1)) as u64;
        while page < end {
            let va = page as LinAddr;
            match lookup(&self.k.hw, &table, va) {
                Ok(t) if write && !t.writable() => {
                    table.protect_page(&mut self.k.hw, va, USER_RW).expect("protect");
                }
                Ok(_) => {}
                Err(_) => {
                    map_fresh(&mut self.k.hw, &mut self.frames, &table, va, PAGE_SIZE, USER_RW);
                }
            }
            page += PAGE_SIZE as u64;
        }
        self.k.vm_flush_tlb();
    }
}

/// Log sink that keeps every line for later inspection.
pub(crate) struct CaptureSink {
    lines: Mutex<Vec<String>>,
}

impl LogSink for CaptureSink {
    fn write_line(&self, level: Level, target: &'static str, args: core::fmt::Arguments<'_>) {
        self.lines.lock().push(format!("{}", LineFormat { level, target, args }));
    }
}

impl CaptureSink {
    pub(crate) fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|line| line.contains(needle))
    }
}

static CAPTURE: CaptureSink = CaptureSink { lines: Mutex::new(Vec::new()) };

/// Installs the capturing sink. Lines from concurrently running tests share it,
/// so assertions should look for something unique to the test.
pub(crate) fn capture_logs() -> &'static CaptureSink {
    log::set_sink(&CAPTURE);
    &CAPTURE
}
