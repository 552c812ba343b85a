// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process table entries as seen by the memory core
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Process, ProcTable, RtsFlags, MiscFlags, Signal, Privileges, CallMask,
//!             VmState, VmRequest, RequestKind, Resumption, SavedCall, PendingMessage
//! DEPENDS_ON: types, mm::PageTable, syscall::{Args, Reply}
//! INVARIANTS: A live slot's endpoint generation matches the table; freed slots carry
//!             SLOT_FREE and no page table; at most one VM request per process
//! ADR: docs/adr/0001-memory-ownership-core.md

extern crate alloc;

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::error::Errno;
use crate::mm::PageTable;
use crate::syscall::{Args, Reply};
use crate::types::{Endpoint, LinAddr, ProcSlot, MAX_GENERATION, NR_SLOTS, NR_TASKS};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    /// Runtime flags; a process runs only when none are set.
    pub struct RtsFlags: u32 {
        const SLOT_FREE = 1 << 0;
        /// Waiting for the VM to resolve a page fault it took itself.
        const PAGEFAULT = 1 << 1;
        /// Has an outstanding request on the VM queue.
        const VMREQUEST = 1 << 2;
        /// Its memory is the subject of someone's outstanding request.
        const VMREQTARGET = 1 << 3;
        /// Held back by the VM while its address space is rebuilt.
        const VMINHIBIT = 1 << 4;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct MiscFlags: u32 {
        /// A message is waiting to be copied into the receive buffer.
        const DELIVERMSG = 1 << 0;
        /// The previous delivery attempt faulted once already.
        const MSG_FAILED = 1 << 1;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    /// Pending signal set, one bit per signal number.
    pub struct Signal: u32 {
        const SIGILL = 1 << 4;
        const SIGSEGV = 1 << 11;
        /// Kernel signal telling the VM that memory requests are queued.
        const SIGKMEM = 1 << 28;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    /// Kernel calls a process may issue, one bit per call number.
    pub struct CallMask: u64 {
        const VIRCOPY = 1 << crate::syscall::KCALL_VIRCOPY;
        const MEMSET = 1 << crate::syscall::KCALL_MEMSET;
        const UMAP = 1 << crate::syscall::KCALL_UMAP;
        const VMCTL = 1 << crate::syscall::KCALL_VMCTL;
        const SAFECOPYFROM = 1 << crate::syscall::KCALL_SAFECOPYFROM;
        const SAFECOPYTO = 1 << crate::syscall::KCALL_SAFECOPYTO;
        const VSAFECOPY = 1 << crate::syscall::KCALL_VSAFECOPY;
        const SAFEMEMSET = 1 << crate::syscall::KCALL_SAFEMEMSET;
        const SETGRANT = 1 << crate::syscall::KCALL_SETGRANT;
        const CHECKRANGE = 1 << crate::syscall::KCALL_CHECKRANGE;
    }
}

impl CallMask {
    pub fn permits(self, number: usize) -> bool {
        number < 64 && self.bits() & (1 << number) != 0
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct PrivFlags: u32 {
        /// System process (server or driver).
        const SYS_PROC = 1 << 0;
    }
}

/// Where a process keeps its grant table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GrantTable {
    pub addr: LinAddr,
    pub entries: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Privileges {
    pub calls: CallMask,
    pub flags: PrivFlags,
    pub grants: Option<GrantTable>,
}

impl Privileges {
    /// Ordinary user process: grant-based copies only.
    pub fn user() -> Self {
        Self {
            calls: CallMask::SAFECOPYFROM
                | CallMask::SAFECOPYTO
                | CallMask::VSAFECOPY
                | CallMask::SAFEMEMSET
                | CallMask::SETGRANT,
            flags: PrivFlags::empty(),
            grants: None,
        }
    }

    /// System process allowed every memory kernel call except VM control.
    pub fn system() -> Self {
        Self {
            calls: CallMask::all().difference(CallMask::VMCTL),
            flags: PrivFlags::SYS_PROC,
            grants: None,
        }
    }

    /// The memory manager.
    pub fn vm() -> Self {
        Self { calls: CallMask::all(), flags: PrivFlags::SYS_PROC, grants: None }
    }
}

/// What kind of operation a VM request belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    /// A kernel call that is replayed once the VM replies.
    KernelCall,
    /// Message delivery that completes in place.
    DeliverMsg,
}

/// Resumption state of the in-flight kernel call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum VmState {
    #[default]
    Idle,
    Queued,
    AwaitingReply,
    /// Re-entered after the VM replied; the stored result decides the outcome.
    Resumed,
}

/// Range the VM must make accessible.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmRequest {
    pub target: Endpoint,
    pub start: LinAddr,
    pub length: u32,
    pub writeflag: bool,
    pub kind: RequestKind,
}

/// Kernel call saved for replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SavedCall {
    pub number: usize,
    pub args: Args,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resumption {
    pub state: VmState,
    pub request: Option<VmRequest>,
    /// VM's answer, consulted while `state` is `Resumed`.
    pub result: Result<(), Errno>,
    pub saved: Option<SavedCall>,
}

impl Default for Resumption {
    fn default() -> Self {
        Self { state: VmState::Idle, request: None, result: Ok(()), saved: None }
    }
}

/// Message waiting to be copied into the receiver's buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingMessage {
    pub buffer: LinAddr,
    pub bytes: Vec<u8>,
}

/// User-visible registers the fault path may rewrite.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct UserRegs {
    pub pc: usize,
    pub retreg: usize,
}

#[derive(Clone, Debug)]
pub struct Process {
    endpoint: Endpoint,
    next_generation: i32,
    pub rts: RtsFlags,
    pub misc: MiscFlags,
    pub table: Option<PageTable>,
    pub privileges: Privileges,
    pub vm: Resumption,
    pub signals: Signal,
    pub delivery: Option<PendingMessage>,
    pub regs: UserRegs,
    /// Final reply of the last replayed kernel call.
    pub last_reply: Option<Result<Reply, Errno>>,
}

impl Process {
    fn vacant(slot: ProcSlot) -> Self {
        Self {
            endpoint: Endpoint::from_parts(0, slot.proc_nr()),
            next_generation: 0,
            rts: RtsFlags::SLOT_FREE,
            misc: MiscFlags::empty(),
            table: None,
            privileges: Privileges::default(),
            vm: Resumption::default(),
            signals: Signal::empty(),
            delivery: None,
            regs: UserRegs::default(),
            last_reply: None,
        }
    }

    fn reset(&mut self, endpoint: Endpoint, privileges: Privileges) {
        let next_generation = self.next_generation;
        *self = Self::vacant(ProcSlot::from_index(0));
        self.endpoint = endpoint;
        self.next_generation = next_generation;
        self.rts = RtsFlags::empty();
        self.privileges = privileges;
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn is_free(&self) -> bool {
        self.rts.contains(RtsFlags::SLOT_FREE)
    }

    pub fn is_runnable(&self) -> bool {
        self.rts.is_empty()
    }

    pub fn is_sys_proc(&self) -> bool {
        self.privileges.flags.contains(PrivFlags::SYS_PROC)
    }
}

/// Reasons a slot cannot be populated or released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcError {
    BadProcNr,
    SlotInUse,
    NotLive,
}

impl From<ProcError> for Errno {
    fn from(value: ProcError) -> Self {
        match value {
            ProcError::BadProcNr => Errno::Invalid,
            ProcError::SlotInUse => Errno::NoMemory,
            ProcError::NotLive => Errno::NoSuchProcess,
        }
    }
}

/// Fixed-size table of process slots; kernel tasks occupy the first `NR_TASKS`.
pub struct ProcTable {
    slots: Vec<Process>,
}

impl ProcTable {
    pub fn new() -> Self {
        let mut slots: Vec<Process> =
            (0..NR_SLOTS).map(|i| Process::vacant(ProcSlot::from_index(i))).collect();
        for (i, proc) in slots.iter_mut().enumerate().take(NR_TASKS) {
            let ep = Endpoint::from_parts(0, ProcSlot::from_index(i).proc_nr());
            proc.reset(ep, Privileges::system());
        }
        Self { slots }
    }

    /// Populates the slot of `proc_nr` with a fresh generation.
    pub fn spawn(&mut self, proc_nr: i32, privileges: Privileges) -> Result<Endpoint, ProcError> {
        let slot = Endpoint::from_parts(0, proc_nr)
            .slot()
            .filter(|s| !s.is_kernel_task())
            .ok_or(ProcError::BadProcNr)?;
        let proc = &mut self.slots[slot.as_index()];
        if !proc.is_free() {
            return Err(ProcError::SlotInUse);
        }
        let ep = Endpoint::from_parts(proc.next_generation, proc_nr);
        proc.reset(ep, privileges);
        Ok(ep)
    }

    /// Releases a live slot; the next spawn there gets a new generation.
    pub fn free(&mut self, ep: Endpoint) -> Result<ProcSlot, ProcError> {
        let slot = self.isokendpt(ep).ok_or(ProcError::NotLive)?;
        if slot.is_kernel_task() {
            return Err(ProcError::BadProcNr);
        }
        let proc = &mut self.slots[slot.as_index()];
        let next = if proc.endpoint.generation() >= MAX_GENERATION {
            0
        } else {
            proc.endpoint.generation() + 1
        };
        *proc = Process::vacant(slot);
        proc.next_generation = next;
        proc.endpoint = Endpoint::from_parts(next, slot.proc_nr());
        Ok(slot)
    }

    /// Slot of a live process whose generation matches `ep`.
    pub fn isokendpt(&self, ep: Endpoint) -> Option<ProcSlot> {
        let slot = ep.slot()?;
        let proc = &self.slots[slot.as_index()];
        (!proc.is_free() && proc.endpoint == ep).then_some(slot)
    }

    pub fn get(&self, slot: ProcSlot) -> &Process {
        &self.slots[slot.as_index()]
    }

    pub fn get_mut(&mut self, slot: ProcSlot) -> &mut Process {
        &mut self.slots[slot.as_index()]
    }

    pub fn endpoint_of(&self, slot: ProcSlot) -> Endpoint {
        self.slots[slot.as_index()].endpoint
    }
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new()
    }
}
