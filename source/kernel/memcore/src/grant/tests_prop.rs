// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use proptest::prelude::*;

use super::*;
use crate::mm::PAGE_SIZE;
use crate::testing::{Harness, USER_BASE};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn direct_grant_admits_exactly_its_range(
        len in 0u32..4096,
        offset in 0u32..5000,
        bytes in 0u32..5000,
    ) {
        let mut h = Harness::new();
        let a = h.user(20);
        let b = h.user(21);
        h.grant_table(a, 1);
        let id = h.put_grant(a, 0, Grant::direct(b, USER_BASE, len, GrantFlags::READ));

        let result = h.k.verify_grant(a, b, id, bytes, GrantFlags::READ, offset);
        if offset as u64 + bytes as u64 <= len as u64 {
            let flags = GrantFlags::READ;
            let verified = Verified { offset: USER_BASE + offset, granter: a, flags };
            prop_assert_eq!(result, Ok(verified));
        } else {
            let is_range = matches!(result, Err(GrantError::Range { .. }));
            prop_assert!(is_range);
        }
    }

    #[test]
    fn only_the_recorded_sequence_resolves(stored in 0i32..1000, asked in 0i32..1000) {
        let mut h = Harness::new();
        let a = h.user(20);
        let b = h.user(21);
        h.grant_table(a, 4);
        let grant = Grant::direct(b, USER_BASE, PAGE_SIZE, GrantFlags::READ).with_seq(stored);
        h.put_grant(a, 2, grant);

        let id = GrantId::new(2, asked);
        let result = h.k.verify_grant(a, b, id, 1, GrantFlags::READ, 0);
        prop_assert_eq!(result.is_ok(), stored == asked);
        if stored != asked {
            prop_assert_eq!(result, Err(GrantError::SequenceMismatch { grant: id, found: stored }));
        }
    }
}
