// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot-time configuration of the memory core
//! OWNERS: @kernel-mm-team
//! PUBLIC API: KernelConfig, ConfigError
//! DEPENDS_ON: types::Endpoint
//! INVARIANTS: Validated once in Kernel::new; immutable afterwards

use crate::types::{Endpoint, NR_PROCS};

/// Default depth limit for indirect grant chains.
pub const MAX_INDIRECT_DEPTH: u32 = 5;
/// Default element limit of a vectored safecopy.
pub const SCPVEC_NR: usize = 64;
/// Default per-endpoint IPC queue depth.
pub const IPC_QUEUE_DEPTH: usize = 8;
/// Default upper bound on grant table entries a process may register.
pub const MAX_GRANT_ENTRIES: u32 = 4096;
/// Upper bound on cores the window pool and scratch layout support.
pub const MAX_CPUS: usize = if cfg!(feature = "smp") { 8 } else { 1 };

/// Configuration consumed by `Kernel::new`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of CPUs that run kernel code.
    pub cpus: usize,
    /// Endpoint of the memory manager.
    pub vm: Endpoint,
    /// The single identity trusted to issue magic grants.
    pub magic_granter: Endpoint,
    pub max_indirect_depth: u32,
    pub max_vsafecopy: usize,
    pub ipc_queue_depth: usize,
    pub max_grant_entries: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            cpus: 1,
            vm: Endpoint::VM,
            magic_granter: Endpoint::VFS,
            max_indirect_depth: MAX_INDIRECT_DEPTH,
            max_vsafecopy: SCPVEC_NR,
            ipc_queue_depth: IPC_QUEUE_DEPTH,
            max_grant_entries: MAX_GRANT_ENTRIES,
        }
    }
}

/// Reasons a configuration is refused at boot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    NoCpus,
    /// More cores than `MAX_CPUS`.
    TooManyCpus,
    /// The VM or magic-grant endpoint is not a user process.
    BadEndpoint,
    ZeroLimit,
}

impl KernelConfig {
    pub const fn with_cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpus == 0 {
            return Err(ConfigError::NoCpus);
        }
        if self.cpus > MAX_CPUS {
            return Err(ConfigError::TooManyCpus);
        }
        for ep in [self.vm, self.magic_granter] {
            let nr = ep.proc_nr();
            if nr < 0 || nr as usize >= NR_PROCS {
                return Err(ConfigError::BadEndpoint);
            }
        }
        if self.max_indirect_depth == 0
            || self.max_vsafecopy == 0
            || self.ipc_queue_depth == 0
            || self.max_grant_entries == 0
        {
            return Err(ConfigError::ZeroLimit);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.validate(), Ok(()));
        assert_eq!(cfg.max_indirect_depth, 5);
        assert_eq!(cfg.max_vsafecopy, 64);
    }

    #[test]
    fn rejects_kernel_task_as_vm() {
        let cfg = KernelConfig { vm: Endpoint::KERNEL, ..KernelConfig::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::BadEndpoint));
    }

    #[test]
    fn rejects_zero_cpus_and_limits() {
        assert_eq!(KernelConfig::default().with_cpus(0).validate(), Err(ConfigError::NoCpus));
        let too_many = KernelConfig::default().with_cpus(MAX_CPUS + 1);
        assert_eq!(too_many.validate(), Err(ConfigError::TooManyCpus));
        let cfg = KernelConfig { max_vsafecopy: 0, ..KernelConfig::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroLimit));
    }
}
