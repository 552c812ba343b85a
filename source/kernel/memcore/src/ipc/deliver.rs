// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-place delivery of a pending message into the receiver's buffer.

use crate::arch::{Hardware, Routine};
use crate::error::Errno;
use crate::kernel::Kernel;
use crate::mm::{scratch_lin, scratch_phys};
use crate::proc::{MiscFlags, RequestKind, RtsFlags, Signal};
use crate::trap::TrapFrame;
use crate::types::Endpoint;

impl<H: Hardware> Kernel<H> {
    /// Copies `ep`'s pending message into its receive buffer.
    ///
    /// The first faulting attempt asks the VM for the buffer and yields
    /// `Suspend`; a second one raises SIGSEGV and yields `Fault`.
    pub fn deliver_message(&mut self, ep: Endpoint) -> Result<(), Errno> {
        let slot = self.procs.isokendpt(ep).ok_or(Errno::NoSuchProcess)?;
        let proc = self.procs.get(slot);
        if !proc.misc.contains(MiscFlags::DELIVERMSG) {
            return Err(Errno::NoEntry);
        }
        if proc.rts.contains(RtsFlags::VMREQUEST) {
            kernel_panic!(target: "ipc", "delivery to {} while it waits on the VM", ep);
        }
        let Some(pending) = proc.delivery.clone() else {
            kernel_panic!(target: "ipc", "{} flagged for delivery without a message", ep);
        };
        let len = pending.bytes.len() as u32;

        self.switch_address_space(Some(slot))?;
        let cpu = self.cpu();
        self.hw.phys_write(scratch_phys(cpu), &pending.bytes);
        let outcome = if len == 0 {
            Ok(())
        } else {
            self.hw.linear_copy(Routine::CopyMsgToUser, scratch_lin(cpu), pending.buffer, len)
        };

        if let Err(abort) = outcome {
            let mut frame = TrapFrame::new(abort.vector, abort.pc, true);
            self.exception_handler(&mut frame);
            if frame.pc != self.hw.kernel_text().user_copy_msg_pointer_failure {
                kernel_panic!(target: "ipc", "message copy abort at 0x{:08x} escaped", abort.pc);
            }
            let proc = self.procs.get_mut(slot);
            if proc.misc.contains(MiscFlags::MSG_FAILED) {
                log_warn!(target: "ipc", "bad receive buffer 0x{:08x} from {}", pending.buffer, ep);
                proc.misc.remove(MiscFlags::DELIVERMSG | MiscFlags::MSG_FAILED);
                proc.delivery = None;
                self.cause_sig(slot, Signal::SIGSEGV);
                return Err(Errno::Fault);
            }
            proc.misc.insert(MiscFlags::MSG_FAILED);
            self.vm_suspend(slot, slot, pending.buffer, len, true, RequestKind::DeliverMsg);
            return Err(Errno::Suspend);
        }

        let proc = self.procs.get_mut(slot);
        proc.misc.remove(MiscFlags::DELIVERMSG | MiscFlags::MSG_FAILED);
        proc.delivery = None;
        proc.regs.retreg = 0;
        log_trace!(target: "ipc", "delivered {} byte(s) to {}", len, ep);
        Ok(())
    }
}
