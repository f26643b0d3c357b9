//! Break-instruction table (spec §4.E): address-keyed set of planted
//! software breakpoints with reference counts.
//!
//! Grounded directly in `breakpoints.c`'s `BreakInstruction` list: that
//! code keeps one process-wide linked list of instructions and filters it
//! by `ctx->mem` everywhere it needs "the instructions for this address
//! space" (`find_instruction`, `check_breakpoints_on_memory_read/write`).
//! This table does the same with a single `HashMap<addr, BreakInstruction>`
//! plus an owner-equality filter, rather than one table per context.

use std::collections::HashMap;

use crate::arch::SupportedArch;
use crate::context::ContextStore;
use crate::error::AgentResult;
use crate::target_io;

pub struct BreakInstruction {
    pub mem_owner: String,
    pub addr: u64,
    pub arch: SupportedArch,
    pub ctx_cnt: u32,
    pub saved_code: Vec<u8>,
    pub planted: bool,
    pub skip: bool,
    pub error: Option<String>,
    pub refs: Vec<String>,
    /// Set for a one-shot software-single-step breakpoint planted by
    /// [`crate::step`] (spec §2 dataflow / §4.I): exempt from the
    /// replant engine's refless-entry reaping (§4.E `compact`) since it
    /// never carries a user-breakpoint ref.
    pub transient: bool,
}

impl BreakInstruction {
    fn new(mem_owner: String, addr: u64, arch: SupportedArch) -> BreakInstruction {
        BreakInstruction {
            mem_owner,
            addr,
            arch,
            ctx_cnt: 1,
            saved_code: Vec::new(),
            planted: false,
            skip: false,
            error: None,
            refs: Vec::new(),
            transient: false,
        }
    }
}

#[derive(Default)]
pub struct BreakInstructionTable {
    entries: HashMap<u64, BreakInstruction>,
}

impl BreakInstructionTable {
    pub fn new() -> BreakInstructionTable {
        BreakInstructionTable::default()
    }

    pub fn entries_for_owner(&self, mem_owner: &str) -> Vec<&BreakInstruction> {
        self.entries
            .values()
            .filter(|bi| bi.mem_owner == mem_owner)
            .collect()
    }

    pub fn is_breakpoint_address(&self, mem_owner: &str, addr: u64) -> bool {
        self.entries
            .get(&addr)
            .map(|bi| bi.mem_owner == mem_owner && bi.planted)
            .unwrap_or(false)
    }

    /// Re-homes a dead/running stored owner to a live, stopped sibling
    /// before returning, mirroring `find_instruction`'s comment that
    /// planting/unplanting requires a stopped memory owner.
    pub fn find_mut(
        &mut self,
        contexts: &ContextStore,
        mem_owner: &str,
        addr: u64,
    ) -> Option<&mut BreakInstruction> {
        if let Some(bi) = self.entries.get(&addr) {
            let owner_alive_and_stopped = contexts
                .get(&bi.mem_owner)
                .map(|c| {
                    let c = c.borrow();
                    c.stopped && !c.exited
                })
                .unwrap_or(false);
            if !owner_alive_and_stopped {
                if let Some(live) = contexts.live_stopped_siblings(mem_owner).into_iter().next() {
                    self.entries.get_mut(&addr).unwrap().mem_owner = live;
                }
            }
        }
        self.entries.get_mut(&addr)
    }

    /// Find-or-create entry and push `bp_id` into its ref list, bumping
    /// `ctx_cnt` if the referring context differs from the stored owner
    /// (spec §4.E `add_ref`).
    pub fn add_ref(
        &mut self,
        contexts: &ContextStore,
        bp_id: &str,
        mem_owner: &str,
        addr: u64,
        arch: SupportedArch,
    ) {
        let differing_owner = self
            .entries
            .get(&addr)
            .map(|bi| bi.mem_owner != mem_owner)
            .unwrap_or(false);
        let entry = self
            .entries
            .entry(addr)
            .or_insert_with(|| BreakInstruction::new(mem_owner.to_string(), addr, arch));
        if differing_owner {
            entry.ctx_cnt += 1;
        }
        if !entry.refs.iter().any(|r| r == bp_id) {
            entry.refs.push(bp_id.to_string());
        }
        let _ = contexts;
    }

    pub fn clear_refs(&mut self) {
        for bi in self.entries.values_mut() {
            bi.refs.clear();
        }
    }

    pub fn update_saved_code(
        &mut self,
        mem_owner: &str,
        bi_addr: u64,
        write_addr: u64,
        write_buf: &[u8],
    ) {
        if let Some(bi) = self.entries.get_mut(&bi_addr) {
            if bi.mem_owner != mem_owner {
                return;
            }
            for i in 0..bi.saved_code.len() as u64 {
                let abs = bi_addr + i;
                if abs >= write_addr && abs < write_addr + write_buf.len() as u64 {
                    bi.saved_code[i as usize] = write_buf[(abs - write_addr) as usize];
                }
            }
        }
    }

    /// Plant contract (spec §4.E): read `break_inst_size` original bytes,
    /// write the architecture's trap bytes, mark `planted`. Errors are
    /// captured on the entry, never propagated.
    pub fn plant(&mut self, pid: i32, addr: u64) {
        let (arch, already_planted) = match self.entries.get(&addr) {
            Some(bi) => (bi.arch, bi.planted),
            None => return,
        };
        if already_planted {
            return;
        }
        let size = arch.break_inst_size();
        match target_io::read_raw_mem(pid, addr, size) {
            Ok(saved) => match target_io::write_raw_mem(pid, addr, arch.break_inst()) {
                Ok(()) => {
                    let bi = self.entries.get_mut(&addr).unwrap();
                    bi.saved_code = saved;
                    bi.planted = true;
                    bi.error = None;
                }
                Err(e) => {
                    self.entries.get_mut(&addr).unwrap().error = Some(e.to_string());
                }
            },
            Err(e) => {
                self.entries.get_mut(&addr).unwrap().error = Some(e.to_string());
            }
        }
    }

    pub fn unplant(&mut self, pid: i32, addr: u64) -> AgentResult<()> {
        let saved = match self.entries.get(&addr) {
            Some(bi) if bi.planted => bi.saved_code.clone(),
            _ => return Ok(()),
        };
        target_io::write_raw_mem(pid, addr, &saved)?;
        self.entries.get_mut(&addr).unwrap().planted = false;
        Ok(())
    }

    /// Removes an entry with no remaining refs, unless it is `transient`
    /// (spec §4.E `compact`; transient one-shot step breakpoints are
    /// cleaned up explicitly via [`clear_transient`] instead).
    pub fn remove_if_refless(&mut self, pid: i32, addr: u64) {
        let refless = self
            .entries
            .get(&addr)
            .map(|bi| bi.refs.is_empty() && !bi.transient)
            .unwrap_or(false);
        if refless {
            let _ = self.unplant(pid, addr);
            self.entries.remove(&addr);
        }
    }

    /// Plants a one-shot step breakpoint at `addr` on `pid`'s address
    /// space, bypassing the user-breakpoint ref mechanism entirely (spec
    /// §2 dataflow: "H plants a one-shot via E").
    pub fn plant_transient(&mut self, pid: i32, mem_owner: &str, addr: u64, arch: SupportedArch) {
        self.entries
            .entry(addr)
            .or_insert_with(|| BreakInstruction::new(mem_owner.to_string(), addr, arch))
            .transient = true;
        self.plant(pid, addr);
    }

    /// Reaps the transient step breakpoint once the step completes,
    /// unless it is also referenced by a real user breakpoint (in which
    /// case it stays planted and simply loses its transient marker).
    pub fn clear_transient(&mut self, pid: i32, addr: u64) {
        let has_refs = match self.entries.get_mut(&addr) {
            Some(bi) => {
                bi.transient = false;
                !bi.refs.is_empty()
            }
            None => return,
        };
        if !has_refs {
            let _ = self.unplant(pid, addr);
            self.entries.remove(&addr);
        }
    }

    pub fn set_skip(&mut self, addr: u64, skip: bool) {
        if let Some(bi) = self.entries.get_mut(&addr) {
            bi.skip = skip;
        }
    }

    /// Spec §4.E `compact`: after refs have been cleared and rebuilt by
    /// the replant engine, remove entries that ended with zero refs
    /// (unplanting first), and (re)plant every remaining entry that isn't
    /// currently planted. Re-homing itself already happened as refs were
    /// re-registered, via [`find_mut`].
    pub fn compact(&mut self, contexts: &ContextStore) {
        let addrs: Vec<u64> = self.entries.keys().copied().collect();
        for addr in addrs {
            let (mem_owner, refless, transient, planted) = match self.entries.get(&addr) {
                Some(bi) => (bi.mem_owner.clone(), bi.refs.is_empty(), bi.transient, bi.planted),
                None => continue,
            };
            let pid = match contexts.get(&mem_owner) {
                Some(c) => c.borrow().pid,
                None => continue,
            };
            if refless && !transient {
                let _ = self.unplant(pid, addr);
                self.entries.remove(&addr);
                continue;
            }
            if !planted {
                self.plant(pid, addr);
            }
        }
    }

    pub fn get(&self, addr: u64) -> Option<&BreakInstruction> {
        self.entries.get(&addr)
    }

    pub fn all_addrs(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_ref_creates_entry_and_dedupes_refs() {
        let contexts = ContextStore::new();
        let mut table = BreakInstructionTable::new();
        table.add_ref(&contexts, "bp1", "P1", 0x1000, SupportedArch::X64);
        table.add_ref(&contexts, "bp1", "P1", 0x1000, SupportedArch::X64);
        let bi = table.get(0x1000).unwrap();
        assert_eq!(bi.refs.len(), 1);
    }

    #[test]
    fn two_refs_at_same_address_both_recorded() {
        let contexts = ContextStore::new();
        let mut table = BreakInstructionTable::new();
        table.add_ref(&contexts, "A.1", "P1", 0x2000, SupportedArch::Arm);
        table.add_ref(&contexts, "A.2", "P1", 0x2000, SupportedArch::Arm);
        let bi = table.get(0x2000).unwrap();
        assert_eq!(bi.refs.len(), 2);
    }

    #[test]
    fn clear_refs_empties_ref_lists_without_removing_entries() {
        let contexts = ContextStore::new();
        let mut table = BreakInstructionTable::new();
        table.add_ref(&contexts, "bp1", "P1", 0x1000, SupportedArch::X64);
        table.clear_refs();
        assert!(table.get(0x1000).unwrap().refs.is_empty());
    }
}
