// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory kernel-call dispatcher with suspend/replay
//! OWNERS: @kernel-mm-team
//! PUBLIC API: SyscallTable, Args, Reply, Handler, SysResult, KCALL_* IDs, VMCTL_* sub-ops,
//!             Kernel::kernel_call()
//! DEPENDS_ON: proc (privileges, resumption), vm, syscall::api
//! INVARIANTS: Fixed MAX_KCALL window; stable IDs; decode/check/execute discipline; a call
//!             that suspends is saved verbatim and replayed once the VM answers
//! ADR: docs/adr/0001-memory-ownership-core.md

pub mod api;

pub use crate::error::encode_status;

use crate::arch::Hardware;
use crate::error::Errno;
use crate::kernel::Kernel;
use crate::proc::{Resumption, SavedCall, VmState};
use crate::types::{Endpoint, ProcSlot};

/// Maximum number of kernel calls supported by this table.
const MAX_KCALL: usize = 16;

/// Result type used by kernel-call handlers.
pub type SysResult<T> = Result<T, Errno>;

/// Kernel-call arguments passed in registers a0-a5.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Args {
    regs: [usize; 6],
}

impl Args {
    /// Creates a new argument pack from the provided registers.
    pub const fn new(regs: [usize; 6]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }
}

/// Registers written back to the caller on success.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reply {
    regs: [usize; 6],
}

impl Reply {
    pub const fn empty() -> Self {
        Self { regs: [0; 6] }
    }

    pub const fn value(value: usize) -> Self {
        Self { regs: [value, 0, 0, 0, 0, 0] }
    }

    pub const fn new(regs: [usize; 6]) -> Self {
        Self { regs }
    }

    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }
}

/// Copy between two endpoint address spaces (system processes only).
pub const KCALL_VIRCOPY: usize = 0;
/// Fill memory of an endpoint or physical memory with a byte.
pub const KCALL_MEMSET: usize = 1;
/// Translate a linear range to its physical start.
pub const KCALL_UMAP: usize = 2;
/// VM control; the sub-operation travels in a0.
pub const KCALL_VMCTL: usize = 3;
pub const KCALL_SAFECOPYFROM: usize = 4;
pub const KCALL_SAFECOPYTO: usize = 5;
/// Vector of grant copies read from the caller's memory.
pub const KCALL_VSAFECOPY: usize = 6;
pub const KCALL_SAFEMEMSET: usize = 7;
/// Register the caller's grant table.
pub const KCALL_SETGRANT: usize = 8;
/// Make sure a range of a process is resident before touching it.
pub const KCALL_CHECKRANGE: usize = 9;

pub const VMCTL_MEMREQ_GET: usize = 0;
pub const VMCTL_MEMREQ_REPLY: usize = 1;
pub const VMCTL_CLEAR_PAGEFAULT: usize = 2;
pub const VMCTL_GET_PDBR: usize = 3;
pub const VMCTL_SET_ADDRSPACE: usize = 4;
pub const VMCTL_FLUSHTLB: usize = 5;
pub const VMCTL_VMINHIBIT_SET: usize = 6;
pub const VMCTL_VMINHIBIT_CLEAR: usize = 7;
/// Hand the kernel the directory indices reserved for mapping windows.
pub const VMCTL_SET_WINDOWS: usize = 8;

/// Copy flag: fail with EFAULT instead of asking the VM.
pub const CP_FLAG_TRY: usize = 1 << 0;

/// Type alias for a kernel-call handler.
pub type Handler<H> = fn(&mut Kernel<H>, ProcSlot, &Args) -> SysResult<Reply>;

/// Dispatch table storing handlers by call number.
pub struct SyscallTable<H: Hardware> {
    handlers: [Option<Handler<H>>; MAX_KCALL],
}

impl<H: Hardware> SyscallTable<H> {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        Self { handlers: [None; MAX_KCALL] }
    }

    /// Registers a handler.
    pub fn register(&mut self, number: usize, handler: Handler<H>) {
        if number < MAX_KCALL {
            self.handlers[number] = Some(handler);
        }
    }

    /// Looks up the handler for `number`.
    pub fn handler(&self, number: usize) -> SysResult<Handler<H>> {
        self.handlers.get(number).and_then(|entry| *entry).ok_or(Errno::BadRequest)
    }
}

impl<H: Hardware> Default for SyscallTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Hardware> Kernel<H> {
    /// Runs kernel call `number` for `caller`.
    ///
    /// `Err(Suspend)` means no reply is due yet: the call is saved and
    /// replayed by `restart_pending` once the VM has answered.
    pub fn kernel_call(
        &mut self,
        caller: Endpoint,
        number: usize,
        args: Args,
    ) -> SysResult<Reply> {
        let slot = self.procs.isokendpt(caller).ok_or(Errno::NoSuchProcess)?;
        let proc = self.procs.get(slot);
        if !proc.privileges.calls.permits(number) {
            log_warn!(target: "syscall", "{} denied call {}", caller, number);
            return Err(Errno::CallDenied);
        }
        if !proc.is_runnable() || proc.vm.state != VmState::Idle {
            return Err(Errno::Invalid);
        }
        let result = self.dispatch(slot, number, &args);
        self.kernel_call_finish(slot, SavedCall { number, args }, result)
    }

    fn dispatch(&mut self, slot: ProcSlot, number: usize, args: &Args) -> SysResult<Reply> {
        let handler = self.calls.handler(number)?;
        handler(self, slot, args)
    }

    fn kernel_call_finish(
        &mut self,
        slot: ProcSlot,
        call: SavedCall,
        result: SysResult<Reply>,
    ) -> SysResult<Reply> {
        let proc = self.procs.get_mut(slot);
        if result == Err(Errno::Suspend) {
            if proc.vm.state != VmState::Queued {
                kernel_panic!(target: "syscall", "call {} suspended unqueued", call.number);
            }
            proc.vm.saved = Some(call);
            return result;
        }
        proc.vm = Resumption::default();
        result
    }

    /// Replays the saved call of a process the VM has answered.
    pub(crate) fn kernel_call_resume(&mut self, slot: ProcSlot) {
        let proc = self.procs.get_mut(slot);
        let Some(call) = proc.vm.saved.take() else {
            kernel_panic!(target: "syscall", "{} resumed without a saved call", proc.endpoint());
        };
        if proc.vm.state != VmState::Resumed {
            kernel_panic!(target: "syscall", "{} resumed in {:?}", proc.endpoint(), proc.vm.state);
        }
        let result = self.dispatch(slot, call.number, &call.args);
        let result = self.kernel_call_finish(slot, call, result);
        if result != Err(Errno::Suspend) {
            log_debug!(target: "syscall", "replayed {} for {}: {:?}", call.number, slot, result);
            self.procs.get_mut(slot).last_reply = Some(result);
        }
    }
}
