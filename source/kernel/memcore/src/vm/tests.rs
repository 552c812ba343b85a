// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::arch::Cpu;
use crate::error::encode_status;
use crate::ipc::notify_bits;
use crate::mm::PAGE_SIZE;
use crate::syscall::{
    Reply, SysResult, KCALL_CHECKRANGE, KCALL_VIRCOPY, KCALL_VMCTL, VMCTL_CLEAR_PAGEFAULT,
    VMCTL_GET_PDBR, VMCTL_MEMREQ_GET, VMCTL_MEMREQ_REPLY, VMCTL_SET_ADDRSPACE,
    VMCTL_SET_WINDOWS, VMCTL_VMINHIBIT_CLEAR, VMCTL_VMINHIBIT_SET,
};
use crate::testing::{Harness, PageTableBuilder, USER_BASE};

fn check(
    h: &mut Harness,
    caller: Endpoint,
    target: Endpoint,
    len: u32,
    write: bool,
) -> SysResult<Reply> {
    let regs = [target.encode(), USER_BASE as usize, len as usize, write as usize, 0, 0];
    h.call(caller, KCALL_CHECKRANGE, regs)
}

fn vmctl(h: &mut Harness, op: usize, a1: usize, a2: usize) -> SysResult<Reply> {
    let vm = h.vm;
    h.call(vm, KCALL_VMCTL, [op, a1, a2, 0, 0, 0])
}

fn reply(h: &mut Harness, requestor: Endpoint, status: Result<(), Errno>) -> SysResult<Reply> {
    vmctl(h, VMCTL_MEMREQ_REPLY, requestor.encode(), encode_status(status))
}

fn state(h: &Harness, ep: Endpoint) -> VmState {
    h.k.procs.get(h.slot(ep)).vm.state
}

fn rts(h: &Harness, ep: Endpoint) -> RtsFlags {
    h.k.procs.get(h.slot(ep)).rts
}

#[test]
fn request_reply_and_replay() {
    let mut h = Harness::new();
    let server = h.system(40);
    let a = h.user(20);

    assert_eq!(check(&mut h, server, a, 2 * PAGE_SIZE, true), Err(Errno::Suspend));
    assert_eq!(state(&h, server), VmState::Queued);
    assert!(rts(&h, server).contains(RtsFlags::VMREQUEST));
    assert!(rts(&h, a).contains(RtsFlags::VMREQTARGET));
    assert_eq!(check(&mut h, server, a, 4, false), Err(Errno::Invalid), "caller is parked");

    let req = vmctl(&mut h, VMCTL_MEMREQ_GET, 0, 0).unwrap();
    let expected = [server.encode(), a.encode(), USER_BASE as usize, 2 * PAGE_SIZE as usize, 1, 0];
    assert_eq!(req, Reply::new(expected));
    assert_eq!(state(&h, server), VmState::AwaitingReply);
    assert_eq!(vmctl(&mut h, VMCTL_MEMREQ_GET, 0, 0), Err(Errno::NoSuchProcess));

    reply(&mut h, server, Ok(())).unwrap();
    assert_eq!(state(&h, server), VmState::Resumed);
    assert!(!rts(&h, server).contains(RtsFlags::VMREQUEST));
    assert!(!rts(&h, a).contains(RtsFlags::VMREQTARGET));

    assert_eq!(h.k.restart_pending(), 1);
    let slot = h.slot(server);
    assert_eq!(h.k.procs.get(slot).last_reply, Some(Ok(Reply::empty())));
    assert_eq!(state(&h, server), VmState::Idle);
}

#[test]
fn vm_failure_becomes_the_call_result() {
    let mut h = Harness::new();
    let server = h.system(40);
    let a = h.user(20);
    check(&mut h, server, a, 16, false).unwrap_err();
    vmctl(&mut h, VMCTL_MEMREQ_GET, 0, 0).unwrap();
    reply(&mut h, server, Err(Errno::NoMemory)).unwrap();
    h.k.restart_pending();
    let slot = h.slot(server);
    assert_eq!(h.k.procs.get(slot).last_reply, Some(Err(Errno::NoMemory)));
}

#[test]
fn vm_is_signalled_once_per_empty_queue() {
    let mut h = Harness::new();
    let vm_slot = h.slot(h.vm);
    let a = h.user(20);
    let servers = [h.system(40), h.system(41), h.system(42)];

    check(&mut h, servers[0], a, 8, false).unwrap_err();
    assert_eq!(h.k.router_mut().pending(vm_slot), 1);
    let note = h.k.router_mut().recv(vm_slot).unwrap();
    assert_eq!(note.source(), Endpoint::SYSTEM);
    assert_ne!(notify_bits(&note) & Signal::SIGKMEM.bits(), 0);
    assert!(h.k.procs.get(vm_slot).signals.contains(Signal::SIGKMEM));

    check(&mut h, servers[1], a, 8, false).unwrap_err();
    assert_eq!(h.k.router_mut().pending(vm_slot), 0, "queue was not empty");

    vmctl(&mut h, VMCTL_MEMREQ_GET, 0, 0).unwrap();
    vmctl(&mut h, VMCTL_MEMREQ_GET, 0, 0).unwrap();
    check(&mut h, servers[2], a, 8, false).unwrap_err();
    assert_eq!(h.k.router_mut().pending(vm_slot), 1);
}

#[test]
fn answered_calls_replay_in_reply_order() {
    let mut h = Harness::new();
    let dest = h.user(20);
    let servers = [h.system(40), h.system(41), h.system(42)];
    for (server, word) in servers.iter().zip([b"one", b"two", b"six"]) {
        h.map(*server, USER_BASE, PAGE_SIZE);
        h.poke(*server, USER_BASE, word);
        let regs = [Endpoint::SELF.encode(), USER_BASE as usize, dest.encode(), 0x10, 3, 0];
        assert_eq!(h.call(*server, KCALL_VIRCOPY, regs), Err(Errno::Suspend));
    }

    for server in servers {
        let req = vmctl(&mut h, VMCTL_MEMREQ_GET, 0, 0).unwrap();
        assert_eq!(Endpoint::decode(req.get(0)), server);
        assert_eq!(Endpoint::decode(req.get(1)), dest);
        assert_eq!(req.get(4), 1, "destination faults ask for write access");
    }
    h.map(dest, 0, PAGE_SIZE);
    h.k.vm_flush_tlb();

    for i in [2, 0, 1] {
        reply(&mut h, servers[i], Ok(())).unwrap();
    }
    assert_eq!(h.k.restarts.peek(), Some(h.slot(servers[2])));
    assert_eq!(h.k.restart_pending(), 3);
    assert_eq!(h.peek(dest, 0x10, 3), b"two", "last reply replays last");
    for server in servers {
        let slot = h.slot(server);
        assert_eq!(h.k.procs.get(slot).last_reply, Some(Ok(Reply::empty())));
    }
}

#[test]
fn check_range_asks_only_for_what_is_missing() {
    let mut h = Harness::new();
    let server = h.system(40);
    let a = h.user(20);
    h.map(a, USER_BASE, PAGE_SIZE);
    h.map_ro(a, USER_BASE + PAGE_SIZE, PAGE_SIZE);

    assert_eq!(check(&mut h, server, a, PAGE_SIZE, true), Ok(Reply::empty()));
    assert_eq!(check(&mut h, server, a, 2 * PAGE_SIZE, false), Ok(Reply::empty()));
    assert_eq!(check(&mut h, server, a, 0, false), Err(Errno::Domain));
    assert_eq!(check(&mut h, server, a, 2 * PAGE_SIZE, true), Err(Errno::Suspend));
    assert_eq!(h.run_vm(), 1);
    assert_eq!(check(&mut h, server, a, 2 * PAGE_SIZE, true), Ok(Reply::empty()));

    let regs = [Endpoint::SELF.encode(), USER_BASE as usize, 8, 0, 0, 0];
    assert_eq!(h.call(server, KCALL_CHECKRANGE, regs), Err(Errno::Suspend));
}

#[test]
fn inhibited_target_is_never_resident() {
    let mut h = Harness::new();
    let server = h.system(40);
    let a = h.user(20);
    h.map(a, USER_BASE, PAGE_SIZE);

    vmctl(&mut h, VMCTL_VMINHIBIT_SET, a.encode(), 0).unwrap();
    assert!(rts(&h, a).contains(RtsFlags::VMINHIBIT));
    assert_eq!(check(&mut h, server, a, 8, false), Err(Errno::Suspend));
    vmctl(&mut h, VMCTL_MEMREQ_GET, 0, 0).unwrap();
    vmctl(&mut h, VMCTL_VMINHIBIT_CLEAR, a.encode(), 0).unwrap();
    assert!(!rts(&h, a).contains(RtsFlags::VMINHIBIT));
    reply(&mut h, server, Ok(())).unwrap();
    assert_eq!(h.k.restart_pending(), 1);
    assert_eq!(check(&mut h, server, a, 8, false), Ok(Reply::empty()));
}

#[test]
fn address_space_control() {
    let mut h = Harness::new();
    let a = h.user(20);
    let old = h.table(a);
    let pdbr = vmctl(&mut h, VMCTL_GET_PDBR, a.encode(), 0).unwrap();
    assert_eq!(pdbr.get(0), old.root() as usize);

    let slot = h.slot(a);
    h.k.switch_address_space(Some(slot)).unwrap();
    h.k.set_vminhibit(a, true).unwrap();
    let fresh = PageTableBuilder::new(&mut h.k.hw, &mut h.frames).build();
    let misaligned = fresh.root() as usize + 0x400;
    assert_eq!(vmctl(&mut h, VMCTL_SET_ADDRSPACE, a.encode(), misaligned), Err(Errno::Invalid));
    vmctl(&mut h, VMCTL_SET_ADDRSPACE, a.encode(), fresh.root() as usize).unwrap();

    assert_eq!(h.table(a), fresh);
    assert_eq!(h.k.hw().table_base(), fresh.root(), "loaded table is reinstalled");
    assert!(!rts(&h, a).contains(RtsFlags::VMINHIBIT));
    assert_eq!(vmctl(&mut h, VMCTL_GET_PDBR, a.encode(), 0).unwrap().get(0), fresh.root() as usize);

    let dead = Endpoint::from_parts(2, 20);
    assert_eq!(vmctl(&mut h, VMCTL_GET_PDBR, dead.encode(), 0), Err(Errno::Invalid));
    assert_eq!(vmctl(&mut h, 99, 0, 0), Err(Errno::Invalid));
}

#[test]
fn clear_pagefault_needs_a_pending_fault() {
    let mut h = Harness::new();
    let a = h.user(20);
    assert_eq!(vmctl(&mut h, VMCTL_CLEAR_PAGEFAULT, a.encode(), 0), Err(Errno::Invalid));
    let slot = h.slot(a);
    h.k.procs.get_mut(slot).rts.insert(RtsFlags::PAGEFAULT);
    vmctl(&mut h, VMCTL_CLEAR_PAGEFAULT, a.encode(), 0).unwrap();
    assert!(h.k.procs.get(slot).is_runnable());
}

#[test]
#[should_panic(expected = "window slot set rejected")]
fn window_slots_from_the_vm_are_set_once() {
    let mut h = Harness::new();
    let vm = h.vm;
    h.map(vm, USER_BASE, PAGE_SIZE);
    h.poke(vm, USER_BASE, &0xD00u32.to_le_bytes());
    h.poke(vm, USER_BASE + 4, &0xD01u32.to_le_bytes());
    let _ = vmctl(&mut h, VMCTL_SET_WINDOWS, USER_BASE as usize, 2);
}

#[test]
fn message_delivery_retries_once_then_signals() {
    let mut h = Harness::new();
    let a = h.user(20);
    h.k.post_message(a, USER_BASE, b"hello").unwrap();
    assert_eq!(h.k.post_message(a, USER_BASE, b"again"), Err(Errno::Invalid));

    assert_eq!(h.k.deliver_message(a), Err(Errno::Suspend));
    let slot = h.slot(a);
    let request = h.k.procs.get(slot).vm.request.unwrap();
    assert_eq!(request.kind, RequestKind::DeliverMsg);
    assert!(request.writeflag);
    assert_eq!(h.answer_vm(false), 1);
    assert!(h.k.restarts.is_empty(), "deliveries are not replayed");

    assert_eq!(h.k.deliver_message(a), Err(Errno::Fault));
    let proc = h.k.procs.get(slot);
    assert!(proc.signals.contains(Signal::SIGSEGV));
    assert!(!proc.misc.contains(MiscFlags::DELIVERMSG));
    assert_eq!(h.k.deliver_message(a), Err(Errno::NoEntry));
}

#[test]
fn message_delivery_completes_after_the_vm_maps_the_buffer() {
    let mut h = Harness::new();
    let a = h.user(20);
    h.k.post_message(a, USER_BASE + 0x30, b"hello").unwrap();
    assert_eq!(h.k.deliver_message(a), Err(Errno::Suspend));
    assert_eq!(h.run_vm(), 1);
    h.k.deliver_message(a).unwrap();
    assert_eq!(h.peek(a, USER_BASE + 0x30, 5), b"hello");
    let proc = h.k.procs.get(h.slot(a));
    assert!(!proc.misc.intersects(MiscFlags::DELIVERMSG | MiscFlags::MSG_FAILED));
    assert!(proc.signals.is_empty());
}

#[test]
fn freeing_a_process_forgets_its_requests() {
    let mut h = Harness::new();
    let a = h.user(20);
    let waiting = h.system(40);
    let answered = h.system(41);

    check(&mut h, answered, a, 8, false).unwrap_err();
    vmctl(&mut h, VMCTL_MEMREQ_GET, 0, 0).unwrap();
    reply(&mut h, answered, Ok(())).unwrap();
    check(&mut h, waiting, a, 8, false).unwrap_err();
    assert!(rts(&h, a).contains(RtsFlags::VMREQTARGET));

    h.k.free_process(waiting).unwrap();
    h.k.free_process(answered).unwrap();
    assert!(h.k.vm_requests.is_empty());
    assert!(!rts(&h, a).contains(RtsFlags::VMREQTARGET));
    assert_eq!(h.k.restart_pending(), 0);
    assert_eq!(vmctl(&mut h, VMCTL_MEMREQ_GET, 0, 0), Err(Errno::NoSuchProcess));
}

#[test]
fn calls_outside_the_privilege_mask_are_denied() {
    let mut h = Harness::new();
    let a = h.user(20);
    let regs = [a.encode(), 0, a.encode(), 0, 4, 0];
    assert_eq!(h.call(a, KCALL_VIRCOPY, regs), Err(Errno::CallDenied));
    assert_eq!(h.call(a, KCALL_VMCTL, [VMCTL_MEMREQ_GET, 0, 0, 0, 0, 0]), Err(Errno::CallDenied));
    let dead = Endpoint::from_parts(5, 30);
    assert_eq!(h.call(dead, KCALL_VIRCOPY, regs), Err(Errno::NoSuchProcess));
}

#[test]
#[should_panic(expected = "with nothing pending")]
fn reply_without_request_is_fatal() {
    let mut h = Harness::new();
    let a = h.user(20);
    let _ = reply(&mut h, a, Ok(()));
}

#[test]
#[should_panic(expected = "with a suspend")]
fn suspend_is_not_a_valid_answer() {
    let mut h = Harness::new();
    let server = h.system(40);
    let a = h.user(20);
    check(&mut h, server, a, 8, false).unwrap_err();
    vmctl(&mut h, VMCTL_MEMREQ_GET, 0, 0).unwrap();
    let _ = reply(&mut h, server, Err(Errno::Suspend));
}

#[test]
#[should_panic(expected = "suspended twice")]
fn one_request_per_process() {
    let mut h = Harness::new();
    let a = h.user(20);
    let b = h.user(21);
    let (sa, sb) = (h.slot(a), h.slot(b));
    h.k.vm_suspend(sa, sb, USER_BASE, 4, false, RequestKind::KernelCall);
    h.k.vm_suspend(sa, sb, USER_BASE, 4, false, RequestKind::KernelCall);
}
