// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory kernel-call handlers exposed to the dispatcher
//! OWNERS: @kernel-mm-team
//! PUBLIC API: install_handlers(table)
//! DEPENDS_ON: copy, grant, vm, mm::walk
//! INVARIANTS: Stable call IDs; Decode→Check→Execute pattern; FaultSrc/FaultDst never
//!             leave a handler
//! ADR: docs/adr/0001-memory-ownership-core.md

extern crate alloc;

use alloc::vec::Vec;

use super::{
    Args, Reply, SyscallTable, SysResult, CP_FLAG_TRY, KCALL_CHECKRANGE, KCALL_MEMSET,
    KCALL_SAFECOPYFROM, KCALL_SAFECOPYTO, KCALL_SAFEMEMSET, KCALL_SETGRANT, KCALL_UMAP,
    KCALL_VIRCOPY, KCALL_VMCTL, KCALL_VSAFECOPY, VMCTL_CLEAR_PAGEFAULT, VMCTL_FLUSHTLB,
    VMCTL_GET_PDBR, VMCTL_MEMREQ_GET, VMCTL_MEMREQ_REPLY, VMCTL_SET_ADDRSPACE,
    VMCTL_SET_WINDOWS, VMCTL_VMINHIBIT_CLEAR, VMCTL_VMINHIBIT_SET,
};
use crate::arch::Hardware;
use crate::copy::VirAddr;
use crate::error::Errno;
use crate::grant::GrantId;
use crate::kernel::Kernel;
use crate::mm::walk::lookup_range;
use crate::mm::{scratch_lin, scratch_phys, SCRATCH_BYTES};
use crate::types::{Endpoint, LinAddr, PhysAddr, ProcSlot};

// Typed decoders for Decode→Check→Execute

#[derive(Copy, Clone)]
struct VircopyArgsTyped {
    src: VirAddr,
    dst: VirAddr,
    bytes: u32,
    try_only: bool,
}

impl VircopyArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Self {
        Self {
            src: VirAddr::new(Endpoint::decode(args.get(0)), args.get(1) as LinAddr),
            dst: VirAddr::new(Endpoint::decode(args.get(2)), args.get(3) as LinAddr),
            bytes: args.get(4) as u32,
            try_only: args.get(5) & CP_FLAG_TRY != 0,
        }
    }

    #[inline]
    fn check(&self) -> SysResult<()> {
        if self.bytes == 0 {
            return Err(Errno::Domain);
        }
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct MemsetArgsTyped {
    who: Endpoint,
    addr: LinAddr,
    byte: u8,
    count: u32,
}

impl MemsetArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Self {
        Self {
            who: Endpoint::decode(args.get(0)),
            addr: args.get(1) as LinAddr,
            byte: args.get(2) as u8,
            count: args.get(3) as u32,
        }
    }

    #[inline]
    fn check(&self) -> SysResult<()> {
        if self.who == Endpoint::ANY {
            return Err(Errno::Invalid);
        }
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct UmapArgsTyped {
    ep: Endpoint,
    addr: LinAddr,
    bytes: u32,
}

impl UmapArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Self {
        Self {
            ep: Endpoint::decode(args.get(0)),
            addr: args.get(1) as LinAddr,
            bytes: args.get(2) as u32,
        }
    }

    #[inline]
    fn check(&self) -> SysResult<()> {
        if self.bytes == 0 {
            return Err(Errno::Domain);
        }
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct SafecopyArgsTyped {
    granter: Endpoint,
    grant: GrantId,
    offset: u32,
    addr: LinAddr,
    bytes: u32,
    try_only: bool,
}

impl SafecopyArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Self {
        Self {
            granter: Endpoint::decode(args.get(0)),
            grant: GrantId::from_raw(args.get(1) as u32 as i32),
            offset: args.get(2) as u32,
            addr: args.get(3) as LinAddr,
            bytes: args.get(4) as u32,
            try_only: args.get(5) & CP_FLAG_TRY != 0,
        }
    }

    #[inline]
    fn check(&self) -> SysResult<()> {
        if self.granter == Endpoint::SELF {
            return Err(Errno::Invalid);
        }
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct SafememsetArgsTyped {
    granter: Endpoint,
    grant: GrantId,
    offset: u32,
    byte: u8,
    bytes: u32,
}

impl SafememsetArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Self {
        Self {
            granter: Endpoint::decode(args.get(0)),
            grant: GrantId::from_raw(args.get(1) as u32 as i32),
            offset: args.get(2) as u32,
            byte: args.get(3) as u8,
            bytes: args.get(4) as u32,
        }
    }
}

#[derive(Copy, Clone)]
struct CheckRangeArgsTyped {
    target: Endpoint,
    addr: LinAddr,
    len: u32,
    write: bool,
}

impl CheckRangeArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Self {
        Self {
            target: Endpoint::decode(args.get(0)),
            addr: args.get(1) as LinAddr,
            len: args.get(2) as u32,
            write: args.get(3) != 0,
        }
    }

    #[inline]
    fn check(&self) -> SysResult<()> {
        if self.len == 0 {
            return Err(Errno::Domain);
        }
        Ok(())
    }
}

/// Registers every memory kernel call.
pub fn install_handlers<H: Hardware>(table: &mut SyscallTable<H>) {
    table.register(KCALL_VIRCOPY, sys_vircopy::<H>);
    table.register(KCALL_MEMSET, sys_memset::<H>);
    table.register(KCALL_UMAP, sys_umap::<H>);
    table.register(KCALL_VMCTL, sys_vmctl::<H>);
    table.register(KCALL_SAFECOPYFROM, sys_safecopy_from::<H>);
    table.register(KCALL_SAFECOPYTO, sys_safecopy_to::<H>);
    table.register(KCALL_VSAFECOPY, sys_vsafecopy::<H>);
    table.register(KCALL_SAFEMEMSET, sys_safememset::<H>);
    table.register(KCALL_SETGRANT, sys_setgrant::<H>);
    table.register(KCALL_CHECKRANGE, sys_checkrange::<H>);
}

fn sys_vircopy<H: Hardware>(k: &mut Kernel<H>, caller: ProcSlot, args: &Args) -> SysResult<Reply> {
    let mut typed = VircopyArgsTyped::decode(args);
    typed.check()?;
    typed.src.endpoint = k.resolve_self(caller, typed.src.endpoint);
    typed.dst.endpoint = k.resolve_self(caller, typed.dst.endpoint);
    if typed.try_only {
        k.virtual_copy(typed.src, typed.dst, typed.bytes)?;
    } else {
        k.virtual_copy_vmcheck(caller, typed.src, typed.dst, typed.bytes)
            .map_err(Errno::fold_copy_fault)?;
    }
    Ok(Reply::empty())
}

fn sys_memset<H: Hardware>(k: &mut Kernel<H>, caller: ProcSlot, args: &Args) -> SysResult<Reply> {
    let typed = MemsetArgsTyped::decode(args);
    typed.check()?;
    let who = k.resolve_self(caller, typed.who);
    k.vm_memset(Some(caller), who, typed.addr, typed.byte, typed.count)?;
    Ok(Reply::empty())
}

fn sys_umap<H: Hardware>(k: &mut Kernel<H>, caller: ProcSlot, args: &Args) -> SysResult<Reply> {
    let typed = UmapArgsTyped::decode(args);
    typed.check()?;
    let ep = k.resolve_self(caller, typed.ep);
    let slot = k.procs.isokendpt(ep).ok_or(Errno::NoSuchProcess)?;
    let table = k.procs.get(slot).table.ok_or(Errno::Fault)?;
    let (phys, len) = lookup_range(&k.hw, &table, typed.addr, typed.bytes).ok_or(Errno::Fault)?;
    if len < typed.bytes {
        log_warn!(
            target: "syscall",
            "umap {}@0x{:08x}+{}: only {} contiguous",
            ep,
            typed.addr,
            typed.bytes,
            len
        );
        return Err(Errno::Fault);
    }
    Ok(Reply::value(phys as usize))
}

fn sys_vmctl<H: Hardware>(k: &mut Kernel<H>, caller: ProcSlot, args: &Args) -> SysResult<Reply> {
    let ep = || Endpoint::decode(args.get(1));
    match args.get(0) {
        VMCTL_MEMREQ_GET => {
            let req = k.memreq_get()?;
            Ok(Reply::new([
                req.requestor.encode(),
                req.target.encode(),
                req.start as usize,
                req.length as usize,
                req.writeflag as usize,
                0,
            ]))
        }
        VMCTL_MEMREQ_REPLY => {
            let status = Errno::status(args.get(2) as u32 as i32);
            k.memreq_reply(ep(), status)?;
            Ok(Reply::empty())
        }
        VMCTL_CLEAR_PAGEFAULT => k.clear_pagefault(ep()).map(|()| Reply::empty()),
        VMCTL_GET_PDBR => k.get_pdbr(ep()).map(|root| Reply::value(root as usize)),
        VMCTL_SET_ADDRSPACE => {
            k.set_addrspace(ep(), args.get(2) as PhysAddr)?;
            Ok(Reply::empty())
        }
        VMCTL_FLUSHTLB => {
            k.vm_flush_tlb();
            Ok(Reply::empty())
        }
        VMCTL_VMINHIBIT_SET => k.set_vminhibit(ep(), true).map(|()| Reply::empty()),
        VMCTL_VMINHIBIT_CLEAR => k.set_vminhibit(ep(), false).map(|()| Reply::empty()),
        VMCTL_SET_WINDOWS => {
            let indices = read_u32_vector(k, caller, args.get(1) as LinAddr, args.get(2))?;
            k.set_window_slots(&indices);
            Ok(Reply::empty())
        }
        other => {
            log_warn!(target: "syscall", "unknown vmctl {} from {}", other, caller);
            Err(Errno::Invalid)
        }
    }
}

/// Copies `count` words out of the caller through the kernel scratch area.
fn read_u32_vector<H: Hardware>(
    k: &mut Kernel<H>,
    caller: ProcSlot,
    addr: LinAddr,
    count: usize,
) -> SysResult<Vec<u32>> {
    let bytes = count.checked_mul(4).filter(|&b| b <= SCRATCH_BYTES as usize);
    let bytes = bytes.ok_or(Errno::Invalid)? as u32;
    let me = k.procs.endpoint_of(caller);
    let cpu = k.cpu();
    k.data_copy(me, addr, Endpoint::KERNEL, scratch_lin(cpu), bytes)?;
    let mut raw = Vec::new();
    raw.resize(bytes as usize, 0u8);
    k.hw.phys_read(scratch_phys(cpu), &mut raw);
    Ok(raw.chunks_exact(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect())
}

fn sys_safecopy_from<H: Hardware>(
    k: &mut Kernel<H>,
    caller: ProcSlot,
    args: &Args,
) -> SysResult<Reply> {
    let typed = SafecopyArgsTyped::decode(args);
    typed.check()?;
    k.safecopy_from(
        caller,
        typed.granter,
        typed.grant,
        typed.offset,
        typed.addr,
        typed.bytes,
        typed.try_only,
    )?;
    Ok(Reply::empty())
}

fn sys_safecopy_to<H: Hardware>(
    k: &mut Kernel<H>,
    caller: ProcSlot,
    args: &Args,
) -> SysResult<Reply> {
    let typed = SafecopyArgsTyped::decode(args);
    typed.check()?;
    k.safecopy_to(
        caller,
        typed.granter,
        typed.grant,
        typed.offset,
        typed.addr,
        typed.bytes,
        typed.try_only,
    )?;
    Ok(Reply::empty())
}

fn sys_vsafecopy<H: Hardware>(
    k: &mut Kernel<H>,
    caller: ProcSlot,
    args: &Args,
) -> SysResult<Reply> {
    k.vsafecopy(caller, args.get(0) as LinAddr, args.get(1))?;
    Ok(Reply::empty())
}

fn sys_safememset<H: Hardware>(
    k: &mut Kernel<H>,
    caller: ProcSlot,
    args: &Args,
) -> SysResult<Reply> {
    let typed = SafememsetArgsTyped::decode(args);
    k.safememset(caller, typed.granter, typed.grant, typed.offset, typed.byte, typed.bytes)?;
    Ok(Reply::empty())
}

fn sys_setgrant<H: Hardware>(k: &mut Kernel<H>, caller: ProcSlot, args: &Args) -> SysResult<Reply> {
    k.set_grant_table(caller, args.get(0) as LinAddr, args.get(1) as u32)?;
    Ok(Reply::empty())
}

fn sys_checkrange<H: Hardware>(
    k: &mut Kernel<H>,
    caller: ProcSlot,
    args: &Args,
) -> SysResult<Reply> {
    let typed = CheckRangeArgsTyped::decode(args);
    typed.check()?;
    let target = k.resolve_self(caller, typed.target);
    k.check_range(caller, target, typed.addr, typed.len, typed.write)?;
    Ok(Reply::empty())
}
