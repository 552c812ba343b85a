// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Grant resolution: follows indirect chains and checks access, grantee and range.

use super::{Grant, GrantError, GrantFlags, GrantId, GrantKind, GRANT_RECORD_LEN};
use crate::arch::Hardware;
use crate::kernel::Kernel;
use crate::mm::{scratch_lin, scratch_phys};
use crate::types::{Endpoint, LinAddr};

/// Outcome of a successful verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Verified {
    /// Address in `granter`'s space where the requested bytes start.
    pub offset: LinAddr,
    /// Owner of the memory; differs from the asked granter for magic grants.
    pub granter: Endpoint,
    /// Access and TRY bits of the record the chain ended at.
    pub flags: GrantFlags,
}

fn grantee_matches(who_to: Endpoint, grantee: Endpoint) -> bool {
    who_to == grantee || grantee == Endpoint::ANY || who_to == Endpoint::ANY
}

fn check_range(start: LinAddr, len: u32, offset: u32, bytes: u32) -> Result<LinAddr, GrantError> {
    let in_range = offset.checked_add(bytes).is_some_and(|end| end <= len);
    if !in_range {
        return Err(GrantError::Range { granted: len, start, wanted: bytes, offset });
    }
    Ok(start.wrapping_add(offset))
}

impl<H: Hardware> Kernel<H> {
    /// Checks that `grantee` may access `bytes` at `offset` of `granter`'s grant
    /// `grant` with `access`, and resolves the memory it names.
    pub fn verify_grant(
        &mut self,
        granter: Endpoint,
        grantee: Endpoint,
        grant: GrantId,
        bytes: u32,
        access: GrantFlags,
        offset: u32,
    ) -> Result<Verified, GrantError> {
        let result = self.resolve_grant(granter, grantee, grant, bytes, access, offset);
        if let Err(err) = result {
            log_warn!(
                target: "grant",
                "verify {} of {} for {} failed: {}",
                grant.as_raw(),
                granter,
                grantee,
                err
            );
        }
        result
    }

    fn resolve_grant(
        &mut self,
        mut granter: Endpoint,
        mut grantee: Endpoint,
        mut grant: GrantId,
        bytes: u32,
        access: GrantFlags,
        offset: u32,
    ) -> Result<Verified, GrantError> {
        let mut depth = 0;
        loop {
            let record = self.fetch_grant(granter, grant)?;
            if let GrantKind::Indirect { who_to, who_from, grant: next } = record.kind {
                if depth == self.config.max_indirect_depth {
                    return Err(GrantError::TooDeep);
                }
                depth += 1;
                if !grantee_matches(who_to, grantee) {
                    return Err(GrantError::BadGrantee { wanted: grantee, found: who_to });
                }
                grantee = granter;
                granter = who_from;
                grant = next;
                continue;
            }

            if !record.access.contains(access) {
                return Err(GrantError::Access { want: access, have: record.access });
            }
            return match record.kind {
                GrantKind::Direct { who_to, start, len } => {
                    if start as u64 + len as u64 > 1 << 32 {
                        return Err(GrantError::Wraps { start, len });
                    }
                    if !grantee_matches(who_to, grantee) {
                        return Err(GrantError::BadGrantee { wanted: grantee, found: who_to });
                    }
                    let offset = check_range(start, len, offset, bytes)?;
                    Ok(Verified { offset, granter, flags: record.access })
                }
                GrantKind::Magic { who_to, who_from, start, len } => {
                    if granter != self.config.magic_granter {
                        return Err(GrantError::UntrustedMagic(granter));
                    }
                    if !grantee_matches(who_to, grantee) {
                        return Err(GrantError::BadGrantee { wanted: grantee, found: who_to });
                    }
                    let offset = check_range(start, len, offset, bytes)?;
                    Ok(Verified { offset, granter: who_from, flags: record.access })
                }
                GrantKind::Indirect { .. } => continue,
            };
        }
    }

    /// Reads and validates one record out of `granter`'s table.
    fn fetch_grant(&mut self, granter: Endpoint, grant: GrantId) -> Result<Grant, GrantError> {
        let slot = self.procs.isokendpt(granter).ok_or(GrantError::BadGranter(granter))?;
        if !grant.is_valid() {
            return Err(GrantError::BadGrantId(grant));
        }
        let table =
            self.procs.get(slot).privileges.grants.ok_or(GrantError::NoGrantTable(granter))?;
        if grant.index() >= table.entries {
            return Err(GrantError::OutOfRange { grant, entries: table.entries });
        }

        let cpu = self.cpu();
        let record_addr = table.addr.wrapping_add(grant.index() * GRANT_RECORD_LEN as u32);
        let len = GRANT_RECORD_LEN as u32;
        self.data_copy(granter, record_addr, Endpoint::KERNEL, scratch_lin(cpu), len)
            .map_err(|_| GrantError::Unreadable(grant))?;
        let mut raw = [0u8; GRANT_RECORD_LEN];
        self.hw.phys_read(scratch_phys(cpu), &mut raw);

        let record = Grant::decode(&raw)?;
        if record.seq != grant.seq() {
            return Err(GrantError::SequenceMismatch { grant, found: record.seq });
        }
        Ok(record)
    }
}
