// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel memory-ownership core: page-table walks, mapping windows,
//!          fault-catching copies, VM suspend/resume, grants and the exception front end
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Kernel, KernelConfig, Errno, Endpoint, VirAddr and the per-module APIs
//! DEPENDS_ON: bitflags, spin, static_assertions, linked_list_allocator (bare metal)
//! INVARIANTS: no_std + alloc; host builds run against arch::sim
//! ADR: docs/adr/0001-memory-ownership-core.md

#![no_std]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;
#[cfg(test)]
extern crate std;

#[macro_use]
pub mod log;

pub mod arch;
pub mod config;
pub mod copy;
pub mod error;
#[cfg(feature = "failpoints")]
pub mod failpoints;
pub mod grant;
pub mod ipc;
pub mod kernel;
pub mod mm;
pub mod proc;
pub mod syscall;
pub mod trap;
pub mod types;
pub mod vm;

#[cfg(test)]
mod testing;

pub use config::KernelConfig;
pub use copy::VirAddr;
pub use error::Errno;
pub use kernel::Kernel;
pub use types::Endpoint;

#[cfg(all(target_os = "none", not(test)))]
#[global_allocator]
static HEAP: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

/// Hands the bare-metal heap its backing region. Call once before `Kernel::new`.
///
/// # Safety
/// `[start, start + size)` must be unused, writable memory that lives forever.
#[cfg(all(target_os = "none", not(test)))]
pub unsafe fn init_heap(start: *mut u8, size: usize) {
    // SAFETY: forwarded caller contract.
    unsafe { HEAP.lock().init(start, size) };
}
