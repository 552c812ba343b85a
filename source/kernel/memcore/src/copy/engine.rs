// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fault-catching linear copy and fill through per-core mapping windows.

use crate::arch::{Abort, FaultKind, Hardware, Routine};
use crate::error::Errno;
use crate::kernel::Kernel;
use crate::mm::window::create_pde;
use crate::mm::{Window, WindowSide, WindowTarget};
use crate::trap::TrapFrame;
use crate::types::LinAddr;

/// Landing pad a caught abort must reach.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Landing {
    Copy,
    Memset,
}

/// Half-open `[base, base + len)` membership without wrapping.
#[inline]
fn within(addr: LinAddr, base: LinAddr, len: u32) -> bool {
    let addr = addr as u64;
    addr >= base as u64 && addr < base as u64 + len as u64
}

impl<H: Hardware> Kernel<H> {
    /// Borrows a window for `target`; a pool the VM never configured is fatal.
    pub(crate) fn window(
        &mut self,
        target: WindowTarget,
        addr: LinAddr,
        bytes: u32,
        side: WindowSide,
    ) -> Window {
        let cpu = self.cpu();
        let window =
            create_pde(&mut self.hw, &self.windows, &mut self.cpus, cpu, target, addr, bytes, side);
        match window {
            Ok(window) => window,
            Err(err) => kernel_panic!(target: "copy", "no {:?} window on {}: {:?}", side, cpu, err),
        }
    }

    /// Re-installs the loaded table so freshly written window entries take effect.
    pub(crate) fn reload_loaded(&mut self) {
        let root = self.local().loaded.root();
        self.hw.reload_table_base(root);
        self.hw.barrier();
        self.hw.flush_tlb();
    }

    /// Dispatches an abort raised inside a fault-aware routine and returns the
    /// faulting linear address the landing pad reports.
    pub(crate) fn catch_abort(&mut self, abort: Abort, landing: Landing) -> LinAddr {
        let mut frame = TrapFrame::new(abort.vector, abort.pc, true);
        self.exception_handler(&mut frame);
        let text = self.hw.kernel_text();
        let expected = match landing {
            Landing::Copy => text.phys_copy_fault_in_kernel,
            Landing::Memset => text.memset_fault_in_kernel,
        };
        if frame.pc != expected {
            kernel_panic!(
                target: "copy",
                "abort at pc=0x{:08x} not redirected to {:?} landing pad",
                abort.pc,
                landing
            );
        }
        self.hw.read_fault_address(FaultKind::Data)
    }

    /// Copies `bytes` from `src_lin` in `src` to `dst_lin` in `dst`.
    ///
    /// Each round maps at most one megabyte per side. A fault inside the
    /// source window yields `FaultSrc`, inside the destination `FaultDst`;
    /// anything else is a kernel bug.
    pub(crate) fn lin_lin_copy(
        &mut self,
        src: WindowTarget,
        mut src_lin: LinAddr,
        dst: WindowTarget,
        mut dst_lin: LinAddr,
        mut bytes: u32,
    ) -> Result<(), Errno> {
        while bytes > 0 {
            let s = self.window(src, src_lin, bytes, WindowSide::Source);
            let d = self.window(dst, dst_lin, s.bytes, WindowSide::Destination);
            let chunk = d.bytes;
            if s.reload || d.reload {
                self.reload_loaded();
            }

            self.local_mut().catch_pagefaults += 1;
            let fault = if self.forced_copy_fault() {
                Some(d.linear)
            } else {
                match self.hw.linear_copy(Routine::PhysCopy, s.linear, d.linear, chunk) {
                    Ok(()) => None,
                    Err(abort) => Some(self.catch_abort(abort, Landing::Copy)),
                }
            };
            self.local_mut().catch_pagefaults -= 1;

            if let Some(addr) = fault {
                if within(addr, s.linear, chunk) {
                    log_debug!(target: "copy", "source fault at 0x{:08x}", addr);
                    return Err(Errno::FaultSrc);
                }
                if within(addr, d.linear, chunk) {
                    log_debug!(target: "copy", "destination fault at 0x{:08x}", addr);
                    return Err(Errno::FaultDst);
                }
                kernel_panic!(
                    target: "copy",
                    "fault at 0x{:08x} outside windows src=0x{:08x} dst=0x{:08x} len={}",
                    addr,
                    s.linear,
                    d.linear,
                    chunk
                );
            }

            #[cfg(feature = "debug_uart")]
            log_trace!(target: "copy", "0x{:08x} -> 0x{:08x} +{}", s.linear, d.linear, chunk);

            src_lin = src_lin.wrapping_add(chunk);
            dst_lin = dst_lin.wrapping_add(chunk);
            bytes -= chunk;
        }
        Ok(())
    }

    /// Consumes a pending forced copy fault.
    fn forced_copy_fault(&self) -> bool {
        #[cfg(feature = "failpoints")]
        {
            self.failpoints.take_copy_fault()
        }
        #[cfg(not(feature = "failpoints"))]
        {
            false
        }
    }

    /// Fills `bytes` of `target` at `lin` with `pattern`. A fault reports the
    /// faulting address in `Err`.
    pub(crate) fn lin_memset(
        &mut self,
        target: WindowTarget,
        mut lin: LinAddr,
        pattern: u32,
        mut bytes: u32,
    ) -> Result<(), LinAddr> {
        while bytes > 0 {
            let w = self.window(target, lin, bytes, WindowSide::Destination);
            if w.reload {
                self.reload_loaded();
            }
            self.local_mut().catch_pagefaults += 1;
            let outcome = self.hw.linear_memset(w.linear, pattern, w.bytes);
            let fault = match outcome {
                Ok(()) => None,
                Err(abort) => Some(self.catch_abort(abort, Landing::Memset)),
            };
            self.local_mut().catch_pagefaults -= 1;
            if let Some(addr) = fault {
                return Err(addr);
            }
            lin = lin.wrapping_add(w.bytes);
            bytes -= w.bytes;
        }
        Ok(())
    }
}
