// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Exception vectors, trap frames and trap diagnostics
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Vector, TrapFrame, record(), last_trap(), recent_traps(), fmt_trap()
//! DEPENDS_ON: spin::Mutex, proc::Signal
//! INVARIANTS: Ring keeps the last TRAP_RING_LEN frames; recording never allocates
//! ADR: docs/adr/0001-memory-ownership-core.md

mod exception;

#[cfg(test)]
extern crate alloc;

use core::fmt::{self, Write};
use spin::Mutex;

use crate::proc::Signal;

/// ARMv7 exception vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Vector {
    Reset = 0,
    UndefinedInstruction = 1,
    SupervisorCall = 2,
    PrefetchAbort = 3,
    DataAbort = 4,
    Hypervisor = 5,
    Irq = 6,
    Fiq = 7,
}

impl Vector {
    pub const fn from_index(index: u8) -> Option<Self> {
        Some(match index {
            0 => Self::Reset,
            1 => Self::UndefinedInstruction,
            2 => Self::SupervisorCall,
            3 => Self::PrefetchAbort,
            4 => Self::DataAbort,
            5 => Self::Hypervisor,
            6 => Self::Irq,
            7 => Self::Fiq,
            _ => return None,
        })
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Reset => "Reset",
            Self::UndefinedInstruction => "Undefined instruction",
            Self::SupervisorCall => "Supervisor call",
            Self::PrefetchAbort => "Prefetch Abort",
            Self::DataAbort => "Data Abort",
            Self::Hypervisor => "Hypervisor call",
            Self::Irq => "Interrupt",
            Self::Fiq => "Fast Interrupt",
        }
    }

    /// Signal raised against a user process that takes this exception.
    pub const fn signal(self) -> Option<Signal> {
        match self {
            Self::UndefinedInstruction | Self::PrefetchAbort => Some(Signal::SIGILL),
            Self::DataAbort => Some(Signal::SIGSEGV),
            _ => None,
        }
    }
}

/// State captured at exception entry that the handler may rewrite.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrapFrame {
    pub vector: Vector,
    /// Resume address (saved link register).
    pub pc: usize,
    /// Return-value register of the interrupted context.
    pub retreg: usize,
    /// Exception taken while already in kernel mode.
    pub nested: bool,
}

impl TrapFrame {
    pub const fn new(vector: Vector, pc: usize, nested: bool) -> Self {
        Self { vector, pc, retreg: 0, nested }
    }
}

// ——— diagnostics ———

const TRAP_RING_LEN: usize = 64;

struct TrapRing {
    frames: [Option<TrapFrame>; TRAP_RING_LEN],
    next: usize,
}

static TRAP_RING: Mutex<TrapRing> =
    Mutex::new(TrapRing { frames: [None; TRAP_RING_LEN], next: 0 });

pub fn record(frame: &TrapFrame) {
    let mut ring = TRAP_RING.lock();
    let idx = ring.next % TRAP_RING_LEN;
    ring.frames[idx] = Some(*frame);
    ring.next = ring.next.wrapping_add(1);
}

pub fn last_trap() -> Option<TrapFrame> {
    let ring = TRAP_RING.lock();
    ring.frames[ring.next.wrapping_sub(1) % TRAP_RING_LEN]
}

/// Visits recorded frames, oldest first.
pub fn recent_traps(mut visit: impl FnMut(&TrapFrame)) {
    let ring = TRAP_RING.lock();
    for i in 0..TRAP_RING_LEN {
        if let Some(frame) = &ring.frames[(ring.next + i) % TRAP_RING_LEN] {
            visit(frame);
        }
    }
}

pub fn fmt_trap<W: Write>(frame: &TrapFrame, f: &mut W) -> fmt::Result {
    writeln!(f, " vector={} ({})", frame.vector as u8, frame.vector.name())?;
    writeln!(f, " pc=0x{:08x}", frame.pc)?;
    writeln!(f, " retreg=0x{:08x}", frame.retreg)?;
    writeln!(f, " nested={}", frame.nested)
}

// ——— tests (host) ———
#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;

    #[test]
    fn recorded_frames_are_visible_in_ring() {
        let frame = TrapFrame::new(Vector::UndefinedInstruction, 0x5a5a_1000, false);
        record(&frame);
        let mut seen = false;
        recent_traps(|f| seen |= f.pc == 0x5a5a_1000);
        assert!(seen);
        assert!(last_trap().is_some());
    }

    #[test]
    fn fmt_includes_vector_name_and_pc() {
        let mut frame = TrapFrame::new(Vector::DataAbort, 0x2000, true);
        frame.retreg = 0x3000;
        let mut out = String::new();
        fmt_trap(&frame, &mut out).unwrap();
        assert!(out.contains("Data Abort"));
        assert!(out.contains("pc=0x00002000"));
        assert!(out.contains("nested=true"));
    }

    #[test]
    fn vectors_map_to_signals() {
        assert_eq!(Vector::UndefinedInstruction.signal(), Some(Signal::SIGILL));
        assert_eq!(Vector::PrefetchAbort.signal(), Some(Signal::SIGILL));
        assert_eq!(Vector::DataAbort.signal(), Some(Signal::SIGSEGV));
        assert_eq!(Vector::Irq.signal(), None);
        for index in 0..8 {
            assert_eq!(Vector::from_index(index).map(|v| v as u8), Some(index));
        }
        assert_eq!(Vector::from_index(8), None);
    }
}
