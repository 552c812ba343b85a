// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Grant-checked copy, vectored copy and memset.

extern crate alloc;

use alloc::vec::Vec;

use super::{GrantFlags, GrantId};
use crate::arch::Hardware;
use crate::copy::VirAddr;
use crate::error::Errno;
use crate::kernel::Kernel;
use crate::mm::{scratch_lin, scratch_phys};
use crate::proc::GrantTable;
use crate::types::{Endpoint, LinAddr, ProcSlot};

/// Size of one vectored-copy element in the caller's memory.
pub const VSCP_VEC_LEN: usize = 24;

/// One element of a vectored safecopy; exactly one of `from`/`to` is `SELF`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VscpVec {
    pub from: Endpoint,
    pub to: Endpoint,
    pub grant: GrantId,
    pub offset: u32,
    pub addr: LinAddr,
    pub bytes: u32,
}

impl VscpVec {
    pub fn to_le_bytes(&self) -> [u8; VSCP_VEC_LEN] {
        let words = [
            self.from.as_raw() as u32,
            self.to.as_raw() as u32,
            self.grant.as_raw() as u32,
            self.offset,
            self.addr,
            self.bytes,
        ];
        let mut out = [0u8; VSCP_VEC_LEN];
        for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < VSCP_VEC_LEN {
            return None;
        }
        let word = |i: usize| {
            u32::from_le_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]])
        };
        Some(Self {
            from: Endpoint::from_raw(word(0) as i32),
            to: Endpoint::from_raw(word(1) as i32),
            grant: GrantId::from_raw(word(2) as i32),
            offset: word(3),
            addr: word(4),
            bytes: word(5),
        })
    }
}

impl<H: Hardware> Kernel<H> {
    /// Copies `bytes` between `grantee`'s `addr` and the memory `granter`
    /// granted under `grant`, starting `offset` bytes into the grant.
    ///
    /// READ in `access` copies from the granter, WRITE copies to it. With TRY
    /// in `access` or on the grant itself, a non-resident page fails with
    /// `Fault` instead of suspending `caller`.
    #[allow(clippy::too_many_arguments)]
    pub fn safecopy(
        &mut self,
        caller: ProcSlot,
        granter: Endpoint,
        grantee: Endpoint,
        grant: GrantId,
        bytes: u32,
        offset: u32,
        addr: LinAddr,
        access: GrantFlags,
    ) -> Result<(), Errno> {
        if granter == Endpoint::NONE || grantee == Endpoint::NONE {
            return Err(Errno::Fault);
        }
        let want = access & GrantFlags::ACCESS;
        let verified = self.verify_grant(granter, grantee, grant, bytes, want, offset)?;
        let remote = VirAddr::new(verified.granter, verified.offset);
        let local = VirAddr::new(grantee, addr);
        let (src, dst) = if want.contains(GrantFlags::READ) {
            (remote, local)
        } else {
            (local, remote)
        };
        if access.contains(GrantFlags::TRY) || verified.flags.contains(GrantFlags::TRY) {
            return self.virtual_copy(src, dst, bytes);
        }
        self.virtual_copy_vmcheck(caller, src, dst, bytes).map_err(Errno::fold_copy_fault)
    }

    /// SAFECOPYFROM: read from `granter`'s grant into the caller.
    pub fn safecopy_from(
        &mut self,
        caller: ProcSlot,
        granter: Endpoint,
        grant: GrantId,
        offset: u32,
        addr: LinAddr,
        bytes: u32,
        try_only: bool,
    ) -> Result<(), Errno> {
        let grantee = self.procs.endpoint_of(caller);
        let access = copy_access(GrantFlags::READ, try_only);
        self.safecopy(caller, granter, grantee, grant, bytes, offset, addr, access)
    }

    /// SAFECOPYTO: write the caller's bytes into `granter`'s grant.
    pub fn safecopy_to(
        &mut self,
        caller: ProcSlot,
        granter: Endpoint,
        grant: GrantId,
        offset: u32,
        addr: LinAddr,
        bytes: u32,
        try_only: bool,
    ) -> Result<(), Errno> {
        let grantee = self.procs.endpoint_of(caller);
        let access = copy_access(GrantFlags::WRITE, try_only);
        self.safecopy(caller, granter, grantee, grant, bytes, offset, addr, access)
    }

    /// Reads `count` elements at `vec_addr` of the caller and performs each
    /// safecopy in order, stopping at the first failure.
    pub fn vsafecopy(
        &mut self,
        caller: ProcSlot,
        vec_addr: LinAddr,
        count: usize,
    ) -> Result<(), Errno> {
        if count > self.config.max_vsafecopy {
            log_warn!(target: "grant", "vsafecopy of {} elements refused", count);
            return Err(Errno::Invalid);
        }
        let me = self.procs.endpoint_of(caller);
        let bytes = (count * VSCP_VEC_LEN) as u32;
        let cpu = self.cpu();
        self.virtual_copy_vmcheck(
            caller,
            VirAddr::new(me, vec_addr),
            VirAddr::new(Endpoint::KERNEL, scratch_lin(cpu)),
            bytes,
        )
        .map_err(Errno::fold_copy_fault)?;

        let mut raw = Vec::new();
        raw.resize(bytes as usize, 0u8);
        self.hw.phys_read(scratch_phys(cpu), &mut raw);
        let elements: Vec<VscpVec> =
            raw.chunks_exact(VSCP_VEC_LEN).filter_map(VscpVec::from_le_bytes).collect();

        for (i, element) in elements.iter().enumerate() {
            let (access, granter) = if element.from == Endpoint::SELF {
                (GrantFlags::WRITE, element.to)
            } else if element.to == Endpoint::SELF {
                (GrantFlags::READ, element.from)
            } else {
                log_warn!(target: "grant", "vsafecopy {}: element {}/{} has no SELF", me, i, count);
                return Err(Errno::Invalid);
            };
            self.safecopy(
                caller,
                granter,
                me,
                element.grant,
                element.bytes,
                element.offset,
                element.addr,
                access,
            )?;
        }
        Ok(())
    }

    /// Fills `bytes` of `granter`'s grant at `offset` with `byte`. System
    /// processes only.
    pub fn safememset(
        &mut self,
        caller: ProcSlot,
        granter: Endpoint,
        grant: GrantId,
        offset: u32,
        byte: u8,
        bytes: u32,
    ) -> Result<(), Errno> {
        let proc = self.procs.get(caller);
        if !proc.is_sys_proc() {
            log_warn!(target: "grant", "safememset by non-system {}", proc.endpoint());
            return Err(Errno::Permission);
        }
        if bytes == 0 {
            return Err(Errno::Domain);
        }
        let me = proc.endpoint();
        let verified = self.verify_grant(granter, me, grant, bytes, GrantFlags::WRITE, offset)?;
        self.vm_memset(Some(caller), verified.granter, verified.offset, byte, bytes)
    }

    /// Registers (or with zero `entries`, drops) the caller's grant table.
    pub fn set_grant_table(
        &mut self,
        caller: ProcSlot,
        addr: LinAddr,
        entries: u32,
    ) -> Result<(), Errno> {
        if entries > self.config.max_grant_entries {
            return Err(Errno::Invalid);
        }
        let table = (entries > 0).then_some(GrantTable { addr, entries });
        self.procs.get_mut(caller).privileges.grants = table;
        Ok(())
    }
}

fn copy_access(direction: GrantFlags, try_only: bool) -> GrantFlags {
    if try_only {
        direction | GrantFlags::TRY
    } else {
        direction
    }
}
