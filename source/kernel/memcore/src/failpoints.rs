// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Test hooks that force the next copy chunk to report a fault.

use core::sync::atomic::{AtomicBool, Ordering};

/// Per-kernel failpoints; each fires once.
#[derive(Debug, Default)]
pub struct Failpoints {
    fault_next_copy: AtomicBool,
}

impl Failpoints {
    pub const fn new() -> Self {
        Self { fault_next_copy: AtomicBool::new(false) }
    }

    /// The next copy chunk reports a destination fault at its first byte.
    pub fn fault_next_copy(&self) {
        self.fault_next_copy.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_copy_fault(&self) -> bool {
        self.fault_next_copy.swap(false, Ordering::SeqCst)
    }
}
