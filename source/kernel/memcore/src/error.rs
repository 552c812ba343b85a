// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel status codes returned to callers of kernel calls
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Errno, Errno::code(), Errno::from_code()
//! DEPENDS_ON: core::fmt
//! INVARIANTS: Codes are negative and stable; FaultSrc/FaultDst/Suspend never cross
//!             the kernel-call boundary except as documented
//! ADR: docs/adr/0001-memory-ownership-core.md

use core::fmt;

/// Status codes shared between the kernel and its system processes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Errno {
    /// Operation not permitted (grant rejections).
    Permission = -1,
    /// No such entry.
    NoEntry = -2,
    /// Endpoint does not name a live process.
    NoSuchProcess = -3,
    /// Out of memory.
    NoMemory = -12,
    /// Bad address; the generic copy failure.
    Fault = -14,
    /// Invalid argument.
    Invalid = -22,
    /// Zero-length request.
    Domain = -33,
    /// Indirect grant chain is too deep.
    TooManyLevels = -62,
    /// Bad request from a system process.
    BadRequest = -103,
    /// Copy failed while reading the source side.
    FaultSrc = -995,
    /// Copy failed while writing the destination side.
    FaultDst = -994,
    /// Caller was suspended pending a VM reply; the call will be restarted.
    Suspend = -996,
    /// Caller lacks the privilege for this kernel call.
    CallDenied = -999,
}

impl Errno {
    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }

    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -1 => Self::Permission,
            -2 => Self::NoEntry,
            -3 => Self::NoSuchProcess,
            -12 => Self::NoMemory,
            -14 => Self::Fault,
            -22 => Self::Invalid,
            -33 => Self::Domain,
            -62 => Self::TooManyLevels,
            -103 => Self::BadRequest,
            -995 => Self::FaultSrc,
            -994 => Self::FaultDst,
            -996 => Self::Suspend,
            -999 => Self::CallDenied,
            _ => return None,
        })
    }

    /// Decodes a status word (0 = success). Unknown codes fold to `Fault`.
    pub const fn status(code: i32) -> Result<(), Self> {
        if code == 0 {
            return Ok(());
        }
        match Self::from_code(code) {
            Some(err) => Err(err),
            None => Err(Self::Fault),
        }
    }

    /// Folds the side-specific copy faults into the generic `Fault`.
    #[inline]
    pub const fn fold_copy_fault(self) -> Self {
        match self {
            Self::FaultSrc | Self::FaultDst => Self::Fault,
            other => other,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Permission => "EPERM",
            Self::NoEntry => "ENOENT",
            Self::NoSuchProcess => "ESRCH",
            Self::NoMemory => "ENOMEM",
            Self::Fault => "EFAULT",
            Self::Invalid => "EINVAL",
            Self::Domain => "EDOM",
            Self::TooManyLevels => "ELOOP",
            Self::BadRequest => "EBADREQUEST",
            Self::FaultSrc => "EFAULT_SRC",
            Self::FaultDst => "EFAULT_DST",
            Self::Suspend => "VMSUSPEND",
            Self::CallDenied => "ECALLDENIED",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// Encodes a status for a return register: 0 on success, the negative code otherwise.
#[inline]
pub fn encode_status(status: Result<(), Errno>) -> usize {
    match status {
        Ok(()) => 0,
        Err(err) => err.code() as isize as usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_reversible() {
        for err in [
            Errno::Permission,
            Errno::NoEntry,
            Errno::NoSuchProcess,
            Errno::NoMemory,
            Errno::Fault,
            Errno::Invalid,
            Errno::Domain,
            Errno::TooManyLevels,
            Errno::BadRequest,
            Errno::FaultSrc,
            Errno::FaultDst,
            Errno::Suspend,
            Errno::CallDenied,
        ] {
            assert!(err.code() < 0);
            assert_eq!(Errno::from_code(err.code()), Some(err));
        }
        assert_eq!(Errno::from_code(7), None);
    }

    #[test]
    fn status_word_decoding() {
        assert_eq!(Errno::status(0), Ok(()));
        assert_eq!(Errno::status(-14), Err(Errno::Fault));
        assert_eq!(Errno::status(-4242), Err(Errno::Fault));
    }

    #[test]
    fn copy_faults_fold_to_fault() {
        assert_eq!(Errno::FaultSrc.fold_copy_fault(), Errno::Fault);
        assert_eq!(Errno::FaultDst.fold_copy_fault(), Errno::Fault);
        assert_eq!(Errno::Permission.fold_copy_fault(), Errno::Permission);
    }

    #[test]
    fn encode_status_sign_extends() {
        assert_eq!(encode_status(Ok(())), 0);
        assert_eq!(encode_status(Err(Errno::Fault)) as isize, -14);
    }
}
