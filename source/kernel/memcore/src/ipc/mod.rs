// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel-originated messages (VM page-fault notices, kernel notifications)
//!          and in-place delivery of pending messages into user buffers
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Router, Message, IpcError, header::*, Kernel::deliver_message()
//! DEPENDS_ON: types::ProcSlot, ipc::header
//! INVARIANTS: Bounded per-slot queues; notifications from one source coalesce into a
//!             single queued message
//! ADR: docs/adr/0001-memory-ownership-core.md

use alloc::collections::VecDeque;
use alloc::vec::Vec;

mod deliver;
pub mod header;

use header::{MessageHeader, MSG_NOTIFY};

use crate::error::Errno;
use crate::types::{Endpoint, ProcSlot, NR_SLOTS};

/// Error returned by router operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// Target slot does not exist.
    NoSuchEndpoint,
    /// Queue is full.
    QueueFull,
    /// Queue is empty.
    QueueEmpty,
}

impl From<IpcError> for Errno {
    fn from(value: IpcError) -> Self {
        match value {
            IpcError::NoSuchEndpoint => Errno::NoSuchProcess,
            IpcError::QueueFull => Errno::NoMemory,
            IpcError::QueueEmpty => Errno::NoEntry,
        }
    }
}

/// Message combining header and inline payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

impl Message {
    /// Creates a message and truncates the payload length to match `header.len`.
    pub fn new(header: MessageHeader, payload: Vec<u8>) -> Self {
        let mut payload = payload;
        payload.truncate(header.len as usize);
        Self { header, payload }
    }

    pub fn source(&self) -> Endpoint {
        Endpoint::from_raw(self.header.src as i32)
    }
}

struct Mailbox {
    queue: VecDeque<Message>,
    depth: usize,
}

impl Mailbox {
    fn with_depth(depth: usize) -> Self {
        Self { queue: VecDeque::new(), depth }
    }

    fn push(&mut self, msg: Message) -> Result<(), IpcError> {
        if self.queue.len() >= self.depth {
            return Err(IpcError::QueueFull);
        }
        self.queue.push_back(msg);
        Ok(())
    }

    fn pop(&mut self) -> Result<Message, IpcError> {
        self.queue.pop_front().ok_or(IpcError::QueueEmpty)
    }
}

/// Router holding one mailbox per process slot.
pub struct Router {
    mailboxes: Vec<Mailbox>,
}

impl Router {
    /// Creates a router with a mailbox of `depth` messages per slot.
    pub fn new(depth: usize) -> Self {
        let mut mailboxes = Vec::with_capacity(NR_SLOTS);
        for _ in 0..NR_SLOTS {
            mailboxes.push(Mailbox::with_depth(depth));
        }
        Self { mailboxes }
    }

    /// Sends `msg` to the mailbox of `slot`.
    pub fn send(&mut self, slot: ProcSlot, msg: Message) -> Result<(), IpcError> {
        self.mailbox(slot)?.push(msg)
    }

    /// Receives the next message queued for `slot`.
    pub fn recv(&mut self, slot: ProcSlot) -> Result<Message, IpcError> {
        self.mailbox(slot)?.pop()
    }

    /// Posts a notification, merging `bits` into one already queued from `src`.
    pub fn notify(&mut self, slot: ProcSlot, src: Endpoint, bits: u32) -> Result<(), IpcError> {
        let mailbox = self.mailbox(slot)?;
        let src_raw = src.as_raw() as u32;
        if let Some(pending) = mailbox
            .queue
            .iter_mut()
            .find(|m| m.header.ty == MSG_NOTIFY && m.header.src == src_raw)
        {
            let merged = notify_bits(pending) | bits;
            pending.payload.copy_from_slice(&merged.to_le_bytes());
            return Ok(());
        }
        let header = MessageHeader::new(src_raw, slot.proc_nr() as u32, MSG_NOTIFY, 0, 4);
        mailbox.push(Message::new(header, bits.to_le_bytes().to_vec()))
    }

    pub fn pending(&self, slot: ProcSlot) -> usize {
        self.mailboxes.get(slot.as_index()).map_or(0, |m| m.queue.len())
    }

    /// Drops everything queued for `slot`.
    pub fn clear(&mut self, slot: ProcSlot) {
        if let Some(mailbox) = self.mailboxes.get_mut(slot.as_index()) {
            mailbox.queue.clear();
        }
    }

    fn mailbox(&mut self, slot: ProcSlot) -> Result<&mut Mailbox, IpcError> {
        self.mailboxes.get_mut(slot.as_index()).ok_or(IpcError::NoSuchEndpoint)
    }
}

/// Signal bits carried by a notification.
pub fn notify_bits(msg: &Message) -> u32 {
    let mut word = [0u8; 4];
    let n = msg.payload.len().min(4);
    word[..n].copy_from_slice(&msg.payload[..n]);
    u32::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn loopback_roundtrip() {
        let mut router = Router::new(8);
        let slot = ProcSlot::from_index(3);
        let header = MessageHeader::new(1, 0, 42, 0, 4);
        let payload = vec![1, 2, 3, 4];
        router.send(slot, Message::new(header, payload.clone())).unwrap();
        let received = router.recv(slot).unwrap();
        assert_eq!(received.header.ty, 42);
        assert_eq!(received.payload, payload);
        assert_eq!(router.recv(slot), Err(IpcError::QueueEmpty));
    }

    #[test]
    fn depth_is_enforced() {
        let mut router = Router::new(1);
        let slot = ProcSlot::from_index(4);
        let msg = Message::new(MessageHeader::new(1, 0, 7, 0, 0), Vec::new());
        router.send(slot, msg.clone()).unwrap();
        assert_eq!(router.send(slot, msg), Err(IpcError::QueueFull));
        assert_eq!(router.send(ProcSlot::from_index(NR_SLOTS), Message::new(
            MessageHeader::new(1, 0, 7, 0, 0),
            Vec::new(),
        )), Err(IpcError::NoSuchEndpoint));
    }

    #[test]
    fn notifications_from_one_source_coalesce() {
        let mut router = Router::new(8);
        let vm = ProcSlot::from_index(10);
        router.notify(vm, Endpoint::SYSTEM, 0b01).unwrap();
        router.notify(vm, Endpoint::SYSTEM, 0b10).unwrap();
        assert_eq!(router.pending(vm), 1);
        let msg = router.recv(vm).unwrap();
        assert_eq!(msg.source(), Endpoint::SYSTEM);
        assert_eq!(notify_bits(&msg), 0b11);
    }
}
