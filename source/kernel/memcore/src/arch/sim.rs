// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Deterministic software machine used by host builds and tests
//! OWNERS: @kernel-arch-team
//! PUBLIC API: SimMachine, SIM_TEXT_BASE
//! DEPENDS_ON: arch::{Cpu, Memory}, mm::page_table descriptor layout
//! INVARIANTS: Per-core table base and TLB; the TLB is never refilled behind the
//!             kernel's back and stays stale until flush_tlb; faults latch DFAR/DFSR
//!             and report the routine's pc like the hardware abort would
//! ADR: docs/adr/0001-memory-ownership-core.md

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};

use super::{
    Abort, Cpu, FaultKind, KernelText, Memory, Routine, FSR_EXTERNAL, FSR_PERMISSION_PAGE,
    FSR_PERMISSION_SECTION, FSR_TRANSLATION_PAGE, FSR_TRANSLATION_SECTION, FSR_WNR,
};
use crate::mm::page_table::{
    page_offset, pte_index, Descriptor, PdeFlags, PteFlags, PAGE_SIZE, PTE_MASK, SECTION_MASK,
};
use crate::trap::Vector;
use crate::types::{CpuId, LinAddr, PhysAddr};

/// Where the simulated kernel routines pretend to live.
pub const SIM_TEXT_BASE: usize = 0xF000_2000;

fn sim_text() -> KernelText {
    let base = SIM_TEXT_BASE;
    KernelText {
        phys_copy: base..base + 0x100,
        phys_copy_fault: base + 0x100,
        phys_copy_fault_in_kernel: base + 0x104,
        phys_memset: base + 0x200..base + 0x280,
        memset_fault: base + 0x280,
        memset_fault_in_kernel: base + 0x284,
        copy_msg_to_user: base + 0x300..base + 0x340,
        user_copy_msg_pointer_failure: base + 0x340,
    }
}

#[derive(Clone, Copy, Debug)]
struct TlbEntry {
    frame: PhysAddr,
    writable: bool,
}

#[derive(Debug, Default)]
struct SimCore {
    ttbr: PhysAddr,
    tlb: BTreeMap<u32, TlbEntry>,
    dfar: u32,
    dfsr: u32,
    ifar: u32,
    ifsr: u32,
}

/// Multi-core machine with byte-addressed RAM starting at physical 0.
pub struct SimMachine {
    ram: Vec<u8>,
    cores: Vec<SimCore>,
    current: usize,
    text: KernelText,
}

impl SimMachine {
    pub fn new(cores: usize, ram_bytes: u32) -> Self {
        let mut all = Vec::with_capacity(cores);
        all.resize_with(cores.max(1), SimCore::default);
        Self { ram: vec![0; ram_bytes as usize], cores: all, current: 0, text: sim_text() }
    }

    pub fn ram_size(&self) -> u32 {
        self.ram.len() as u32
    }

    /// Switches which core subsequent register accesses and copies run on.
    pub fn select_cpu(&mut self, cpu: CpuId) {
        assert!(cpu.as_index() < self.cores.len(), "no such core {cpu}");
        self.current = cpu.as_index();
    }

    /// Number of cached translations on `cpu`.
    pub fn tlb_entries(&self, cpu: CpuId) -> usize {
        self.cores[cpu.as_index()].tlb.len()
    }

    /// Latches abort registers as the hardware would on an exception entry.
    pub fn latch_fault(&mut self, kind: FaultKind, addr: LinAddr, status: u32) {
        let core = &mut self.cores[self.current];
        match kind {
            FaultKind::Data => {
                core.dfar = addr;
                core.dfsr = status;
            }
            FaultKind::Prefetch => {
                core.ifar = addr;
                core.ifsr = status;
            }
        }
    }

    fn walk(&self, lin: LinAddr, write: bool) -> Result<TlbEntry, u32> {
        let ttbr = self.cores[self.current].ttbr;
        let wnr = if write { FSR_WNR } else { 0 };
        let pde = self.phys_get32(ttbr + (lin >> 20) * 4);
        match Descriptor::decode(pde) {
            Descriptor::Fault => Err(FSR_TRANSLATION_SECTION | wnr),
            Descriptor::Section(base) => {
                let writable = pde & PdeFlags::SECTION_RO.bits() == 0;
                if write && !writable {
                    return Err(FSR_PERMISSION_SECTION | wnr);
                }
                let frame = (base & SECTION_MASK) | (lin & !SECTION_MASK & PTE_MASK);
                Ok(TlbEntry { frame, writable })
            }
            Descriptor::Table(pt) => {
                let pte = self.phys_get32(pt + (pte_index(lin) as u32) * 4);
                if pte & PteFlags::PRESENT.bits() == 0 {
                    return Err(FSR_TRANSLATION_PAGE | wnr);
                }
                let writable = pte & PteFlags::RO.bits() == 0;
                if write && !writable {
                    return Err(FSR_PERMISSION_PAGE | wnr);
                }
                Ok(TlbEntry { frame: pte & PTE_MASK, writable })
            }
        }
    }

    fn translate(&mut self, lin: LinAddr, write: bool) -> Result<PhysAddr, u32> {
        let vpn = lin >> 12;
        if let Some(entry) = self.cores[self.current].tlb.get(&vpn) {
            if write && !entry.writable {
                return Err(FSR_PERMISSION_PAGE | FSR_WNR);
            }
            return Ok(entry.frame | page_offset(lin));
        }
        let entry = self.walk(lin, write)?;
        self.cores[self.current].tlb.insert(vpn, entry);
        Ok(entry.frame | page_offset(lin))
    }

    fn abort(&mut self, routine_pc: usize, addr: LinAddr, status: u32) -> Abort {
        self.latch_fault(FaultKind::Data, addr, status);
        Abort { vector: Vector::DataAbort, pc: routine_pc }
    }

    fn in_ram(&self, phys: PhysAddr, len: u32) -> bool {
        (phys as u64 + len as u64) <= self.ram.len() as u64
    }

    fn routine_pc(&self, routine: Routine) -> usize {
        match routine {
            Routine::PhysCopy => self.text.phys_copy.start + 0x20,
            Routine::CopyMsgToUser => self.text.copy_msg_to_user.start + 0x10,
        }
    }
}

impl Cpu for SimMachine {
    fn cpu_id(&self) -> CpuId {
        CpuId::from_raw(self.current as u16)
    }

    fn read_fault_address(&self, kind: FaultKind) -> LinAddr {
        let core = &self.cores[self.current];
        match kind {
            FaultKind::Data => core.dfar,
            FaultKind::Prefetch => core.ifar,
        }
    }

    fn read_fault_status(&self, kind: FaultKind) -> u32 {
        let core = &self.cores[self.current];
        match kind {
            FaultKind::Data => core.dfsr,
            FaultKind::Prefetch => core.ifsr,
        }
    }

    fn table_base(&self) -> PhysAddr {
        self.cores[self.current].ttbr
    }

    fn reload_table_base(&mut self, root: PhysAddr) {
        self.cores[self.current].ttbr = root;
    }

    fn flush_tlb(&mut self) {
        self.cores[self.current].tlb.clear();
    }

    fn barrier(&self) {
        fence(Ordering::SeqCst);
    }

    fn kernel_text(&self) -> &KernelText {
        &self.text
    }
}

impl Memory for SimMachine {
    fn phys_get32(&self, addr: PhysAddr) -> u32 {
        let a = addr as usize;
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.ram[a..a + 4]);
        u32::from_le_bytes(word)
    }

    fn phys_set32(&mut self, addr: PhysAddr, value: u32) {
        let a = addr as usize;
        self.ram[a..a + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn phys_read(&self, addr: PhysAddr, buf: &mut [u8]) {
        let a = addr as usize;
        buf.copy_from_slice(&self.ram[a..a + buf.len()]);
    }

    fn phys_write(&mut self, addr: PhysAddr, buf: &[u8]) {
        let a = addr as usize;
        self.ram[a..a + buf.len()].copy_from_slice(buf);
    }

    fn linear_copy(
        &mut self,
        routine: Routine,
        src: LinAddr,
        dst: LinAddr,
        bytes: u32,
    ) -> Result<(), Abort> {
        let pc = self.routine_pc(routine);
        let mut done = 0u32;
        while done < bytes {
            let s = src.wrapping_add(done);
            let d = dst.wrapping_add(done);
            let n = (bytes - done)
                .min(PAGE_SIZE - page_offset(s))
                .min(PAGE_SIZE - page_offset(d));
            let sp = self.translate(s, false).map_err(|st| self.abort(pc, s, st))?;
            if !self.in_ram(sp, n) {
                return Err(self.abort(pc, s, FSR_EXTERNAL));
            }
            let dp = self.translate(d, true).map_err(|st| self.abort(pc, d, st))?;
            if !self.in_ram(dp, n) {
                return Err(self.abort(pc, d, FSR_EXTERNAL | FSR_WNR));
            }
            let (sp, dp, n) = (sp as usize, dp as usize, n as usize);
            self.ram.copy_within(sp..sp + n, dp);
            done += n as u32;
        }
        Ok(())
    }

    fn linear_memset(&mut self, dst: LinAddr, pattern: u32, bytes: u32) -> Result<(), Abort> {
        let pc = self.text.phys_memset.start + 0x20;
        let fill = pattern.to_le_bytes();
        let mut done = 0u32;
        while done < bytes {
            let d = dst.wrapping_add(done);
            let n = (bytes - done).min(PAGE_SIZE - page_offset(d));
            let dp = self.translate(d, true).map_err(|st| self.abort(pc, d, st))?;
            if !self.in_ram(dp, n) {
                return Err(self.abort(pc, d, FSR_EXTERNAL | FSR_WNR));
            }
            for i in 0..n {
                self.ram[(dp + i) as usize] = fill[((done + i) % 4) as usize];
            }
            done += n;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::fsr_code;
    use crate::mm::page_table::{FrameAllocator, PageTable};

    fn machine_with_table() -> (SimMachine, PageTable, FrameAllocator) {
        let mut m = SimMachine::new(1, 4 << 20);
        let mut frames = FrameAllocator::new(0x10_0000, 4 << 20);
        let table = PageTable::create(&mut m, &mut frames).unwrap();
        m.reload_table_base(table.root());
        (m, table, frames)
    }

    #[test]
    fn copy_through_mapped_pages() {
        let (mut m, table, mut frames) = machine_with_table();
        let a = frames.alloc_page().unwrap();
        let b = frames.alloc_page().unwrap();
        table.map_page(&mut m, &mut frames, 0x1000, a, PteFlags::PRESENT | PteFlags::USER).unwrap();
        table.map_page(&mut m, &mut frames, 0x8000, b, PteFlags::PRESENT | PteFlags::USER).unwrap();
        m.phys_write(a + 16, b"hello");
        m.linear_copy(Routine::PhysCopy, 0x1010, 0x8000, 5).unwrap();
        let mut out = [0u8; 5];
        m.phys_read(b, &mut out);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn unmapped_destination_latches_dfar_with_write_bit() {
        let (mut m, table, mut frames) = machine_with_table();
        let a = frames.alloc_page().unwrap();
        table.map_page(&mut m, &mut frames, 0x1000, a, PteFlags::PRESENT).unwrap();
        let abort = m.linear_copy(Routine::PhysCopy, 0x1000, 0x9000, 8).unwrap_err();
        assert_eq!(abort.vector, Vector::DataAbort);
        assert!(m.kernel_text().phys_copy.contains(&abort.pc));
        assert_eq!(m.read_fault_address(FaultKind::Data), 0x9000);
        let status = m.read_fault_status(FaultKind::Data);
        assert_eq!(fsr_code(status), FSR_TRANSLATION_PAGE);
        assert_ne!(status & FSR_WNR, 0);
    }

    #[test]
    fn tlb_stays_stale_until_flushed() {
        let (mut m, table, mut frames) = machine_with_table();
        let a = frames.alloc_page().unwrap();
        let b = frames.alloc_page().unwrap();
        table.map_page(&mut m, &mut frames, 0x1000, a, PteFlags::PRESENT).unwrap();
        m.phys_write(a, &[1]);
        m.phys_write(b, &[2]);
        m.linear_copy(Routine::PhysCopy, 0x1000, 0x1001, 1).unwrap();
        assert_eq!(m.tlb_entries(CpuId::BOOT), 1);

        table.unmap_page(&mut m, 0x1000).unwrap();
        table.map_page(&mut m, &mut frames, 0x1000, b, PteFlags::PRESENT).unwrap();
        let mut out = [0u8; 1];
        m.linear_copy(Routine::PhysCopy, 0x1000, 0x1002, 1).unwrap();
        m.phys_read(a + 2, &mut out);
        assert_eq!(out, [1], "stale translation still points at the old frame");

        m.flush_tlb();
        m.linear_copy(Routine::PhysCopy, 0x1000, 0x1002, 1).unwrap();
        m.phys_read(b + 2, &mut out);
        assert_eq!(out, [2]);
    }

    #[test]
    fn read_only_page_rejects_writes() {
        let (mut m, table, mut frames) = machine_with_table();
        let a = frames.alloc_page().unwrap();
        table.map_page(&mut m, &mut frames, 0x1000, a, PteFlags::PRESENT | PteFlags::RO).unwrap();
        m.linear_memset(0x1000, 0, 4).unwrap_err();
        assert_eq!(fsr_code(m.read_fault_status(FaultKind::Data)), FSR_PERMISSION_PAGE);
    }
}
