// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! FIFO of process slots threaded through a slot-indexed `next` arena.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

use crate::types::{ProcSlot, NR_SLOTS};

/// Queue misuse detected at the boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueError {
    /// The slot is already linked; a process has at most one entry.
    AlreadyQueued(ProcSlot),
}

#[derive(Debug)]
pub struct RequestQueue {
    head: Option<ProcSlot>,
    tail: Option<ProcSlot>,
    next: Vec<Option<ProcSlot>>,
    linked: Vec<bool>,
    len: usize,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            head: None,
            tail: None,
            next: vec![None; NR_SLOTS],
            linked: vec![false; NR_SLOTS],
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn contains(&self, slot: ProcSlot) -> bool {
        self.linked[slot.as_index()]
    }

    pub fn peek(&self) -> Option<ProcSlot> {
        self.head
    }

    /// Appends `slot`; returns true if the queue was empty before.
    pub fn enqueue(&mut self, slot: ProcSlot) -> Result<bool, QueueError> {
        if self.contains(slot) {
            return Err(QueueError::AlreadyQueued(slot));
        }
        let was_empty = self.is_empty();
        self.linked[slot.as_index()] = true;
        self.next[slot.as_index()] = None;
        match self.tail {
            Some(tail) => self.next[tail.as_index()] = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.len += 1;
        Ok(was_empty)
    }

    pub fn dequeue(&mut self) -> Option<ProcSlot> {
        let head = self.head?;
        self.head = self.next[head.as_index()].take();
        if self.head.is_none() {
            self.tail = None;
        }
        self.linked[head.as_index()] = false;
        self.len -= 1;
        Some(head)
    }

    /// Unlinks `slot` wherever it is; returns false if it was not queued.
    pub fn remove(&mut self, slot: ProcSlot) -> bool {
        if !self.contains(slot) {
            return false;
        }
        let mut prev: Option<ProcSlot> = None;
        let mut cursor = self.head;
        while let Some(current) = cursor {
            if current == slot {
                let after = self.next[current.as_index()].take();
                match prev {
                    Some(p) => self.next[p.as_index()] = after,
                    None => self.head = after,
                }
                if self.tail == Some(current) {
                    self.tail = prev;
                }
                self.linked[current.as_index()] = false;
                self.len -= 1;
                return true;
            }
            prev = cursor;
            cursor = self.next[current.as_index()];
        }
        false
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    fn s(i: usize) -> ProcSlot {
        ProcSlot::from_index(i)
    }

    #[test]
    fn fifo_order_and_empty_edge() {
        let mut q = RequestQueue::new();
        assert_eq!(q.enqueue(s(5)), Ok(true));
        assert_eq!(q.enqueue(s(3)), Ok(false));
        assert_eq!(q.enqueue(s(9)), Ok(false));
        assert_eq!(q.peek(), Some(s(5)));
        assert_eq!(q.dequeue(), Some(s(5)));
        assert_eq!(q.dequeue(), Some(s(3)));
        assert_eq!(q.dequeue(), Some(s(9)));
        assert_eq!(q.dequeue(), None);
        assert_eq!(q.enqueue(s(3)), Ok(true));
    }

    #[test]
    fn double_enqueue_is_rejected() {
        let mut q = RequestQueue::new();
        q.enqueue(s(4)).unwrap();
        assert_eq!(q.enqueue(s(4)), Err(QueueError::AlreadyQueued(s(4))));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn remove_middle_and_tail_keeps_links() {
        let mut q = RequestQueue::new();
        for i in [2, 3, 4] {
            q.enqueue(s(i)).unwrap();
        }
        assert!(q.remove(s(3)));
        assert!(q.remove(s(4)));
        assert!(!q.remove(s(4)));
        q.enqueue(s(7)).unwrap();
        assert_eq!(q.dequeue(), Some(s(2)));
        assert_eq!(q.dequeue(), Some(s(7)));
        assert!(q.is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push(usize),
        Pop,
        Remove(usize),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..NR_SLOTS).prop_map(Op::Push),
            Just(Op::Pop),
            (0usize..NR_SLOTS).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn matches_a_deque_model(ops in proptest::collection::vec(arb_op(), 0..64)) {
            let mut q = RequestQueue::new();
            let mut model: VecDeque<usize> = VecDeque::new();
            for op in ops {
                match op {
                    Op::Push(i) => {
                        let res = q.enqueue(s(i));
                        if model.contains(&i) {
                            prop_assert!(res.is_err());
                        } else {
                            prop_assert_eq!(res, Ok(model.is_empty()));
                            model.push_back(i);
                        }
                    }
                    Op::Pop => prop_assert_eq!(q.dequeue(), model.pop_front().map(s)),
                    Op::Remove(i) => {
                        let present = model.iter().position(|&m| m == i);
                        if let Some(pos) = present {
                            model.remove(pos);
                        }
                        prop_assert_eq!(q.remove(s(i)), present.is_some());
                    }
                }
                prop_assert_eq!(q.len(), model.len());
                prop_assert_eq!(q.peek(), model.front().copied().map(s));
            }
        }
    }
}
