// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Exception front end: routes aborts to the fault-aware copy routines, the
//! VM pager, or a signal, and stops the kernel on anything else.

extern crate alloc;

use alloc::string::String;
use core::fmt::Write;

use super::{fmt_trap, record, TrapFrame, Vector};
use crate::arch::{FaultKind, Hardware};
use crate::error::Errno;
use crate::ipc::header::{MessageHeader, PagefaultNotice, MSG_VM_PAGEFAULT};
use crate::ipc::Message;
use crate::kernel::Kernel;
use crate::proc::RtsFlags;
use crate::types::{LinAddr, ProcSlot};

impl<H: Hardware> Kernel<H> {
    /// Handles one exception taken on the calling core.
    ///
    /// The frame may be rewritten: a caught fault in a copy routine resumes at
    /// that routine's landing pad.
    pub fn exception_handler(&mut self, frame: &mut TrapFrame) {
        record(frame);
        let text = self.hw.kernel_text();
        if frame.nested && text.copy_msg_to_user.contains(&frame.pc) {
            if frame.vector == Vector::DataAbort {
                frame.pc = text.user_copy_msg_pointer_failure;
                return;
            }
            self.disaster(frame, "non-data abort while copying a message");
        }

        match frame.vector {
            Vector::DataAbort => {
                let addr = self.hw.read_fault_address(FaultKind::Data);
                let status = self.hw.read_fault_status(FaultKind::Data);
                self.pagefault(frame, addr, status);
                return;
            }
            Vector::PrefetchAbort if !frame.nested => {
                let addr = self.hw.read_fault_address(FaultKind::Prefetch);
                let status = self.hw.read_fault_status(FaultKind::Prefetch);
                self.pagefault(frame, addr, status);
                return;
            }
            _ => {}
        }

        if !frame.nested {
            if let Some(slot) = self.local().current.filter(|s| !s.is_kernel_task()) {
                match frame.vector.signal() {
                    Some(sig) => {
                        self.cause_sig(slot, sig);
                        return;
                    }
                    None => self.disaster(frame, "exception without a signal"),
                }
            }
        }
        self.disaster(frame, "unexpected exception");
    }

    fn pagefault(&mut self, frame: &mut TrapFrame, addr: LinAddr, status: u32) {
        let current = self.local().current;
        let in_kernel_task = current.is_some_and(ProcSlot::is_kernel_task);
        if (frame.nested || in_kernel_task) && self.local().catch_pagefaults > 0 {
            let text = self.hw.kernel_text();
            let landing = if text.phys_copy.contains(&frame.pc) {
                Some((text.phys_copy_fault_in_kernel, text.phys_copy_fault))
            } else if text.phys_memset.contains(&frame.pc) {
                Some((text.memset_fault_in_kernel, text.memset_fault))
            } else {
                None
            };
            if let Some((in_kernel, in_task)) = landing {
                if frame.nested {
                    frame.pc = in_kernel;
                } else if let Some(slot) = current {
                    let regs = &mut self.procs.get_mut(slot).regs;
                    regs.pc = in_task;
                    regs.retreg = addr as usize;
                }
                return;
            }
        }

        if frame.nested {
            if self.windows.covers(addr) {
                self.disaster(frame, "page fault in kernel mapping window");
            }
            self.disaster(frame, "page fault in kernel");
        }
        let Some(slot) = current else {
            self.disaster(frame, "page fault with no current process");
        };
        if self.procs.endpoint_of(slot) == self.config.vm {
            self.disaster(frame, "page fault in the VM");
        }

        let proc = self.procs.get_mut(slot);
        proc.rts.insert(RtsFlags::PAGEFAULT);
        let ep = proc.endpoint();
        let notice = PagefaultNotice { addr, status };
        let header = MessageHeader::new(
            ep.as_raw() as u32,
            self.config.vm.as_raw() as u32,
            MSG_VM_PAGEFAULT,
            0,
            PagefaultNotice::LEN as u32,
        );
        let msg = Message::new(header, notice.to_le_bytes().to_vec());
        let sent = match self.procs.isokendpt(self.config.vm) {
            Some(vm) => self.router.send(vm, msg).map_err(Errno::from),
            None => Err(Errno::NoSuchProcess),
        };
        if let Err(err) = sent {
            kernel_panic!(target: "trap", "page fault notice for {} not sent: {}", ep, err);
        }
        log_debug!(target: "trap", "{} faulted at 0x{:08x} status 0x{:x}", ep, addr, status);
    }

    fn disaster(&self, frame: &TrapFrame, why: &str) -> ! {
        let mut dump = String::new();
        let _ = fmt_trap(frame, &mut dump);
        let _ = write!(dump, " cpu={}", self.cpu());
        kernel_panic!(target: "trap", "{}:\n{}", why, dump);
    }
}
