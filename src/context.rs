//! Context store (spec §4.C): lifecycle and lookup of process/thread
//! records, arranged as an arena keyed by stable string ids rather than a
//! cyclic parent/child back-pointer graph. Design note: "replace raw
//! back-pointers with an arena keyed by stable ids; children hold indices,
//! not owning references." `Rc<RefCell<>>` is still used for the record
//! itself (shared, mutable, single-threaded).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::arch::arm::HwBpThreadState;
use crate::arch::SupportedArch;
use crate::log::LogLevel;
use crate::signal_set::SignalSet;
use crate::{error::AgentError, log};

pub type ContextId = String;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ContextGroup {
    Breakpoint,
    Process,
    Intercept,
    Cpu,
}

/// Per memory-owning context hardware-BP state (spec §3 "Hardware-BP slot
/// state", the per-context half).
#[derive(Clone, Debug, Default)]
pub struct HwBpGroupState {
    pub debug_arch: u32,
    pub wp_max_size: u32,
    pub bp_cnt: u32,
    pub wp_cnt: u32,
    /// One entry per slot, `bp_cnt` instruction slots followed by `wp_cnt`
    /// watchpoint slots; holds the owning user breakpoint id.
    pub slot_owner: Vec<Option<String>>,
    /// `(addr, ctrl)` register values for the same slot index as
    /// `slot_owner`, filled in at allocation time and copied into every
    /// thread's debug-register bank on the next resync.
    pub slot_value: Vec<Option<(u32, u32)>>,
    pub generation: u64,
}

impl HwBpGroupState {
    pub fn new(bp_cnt: u32, wp_cnt: u32, debug_arch: u32, wp_max_size: u32) -> HwBpGroupState {
        HwBpGroupState {
            debug_arch,
            wp_max_size,
            bp_cnt,
            wp_cnt,
            slot_owner: vec![None; (bp_cnt + wp_cnt) as usize],
            slot_value: vec![None; (bp_cnt + wp_cnt) as usize],
            generation: 0,
        }
    }

    pub fn total_slots(&self) -> u32 {
        self.bp_cnt + self.wp_cnt
    }

    pub fn bump_generation(&mut self) {
        self.generation += 1;
    }
}

pub struct Context {
    pub id: ContextId,
    pub parent: Option<ContextId>,
    /// `None` when this context is itself the memory owner (a process).
    pub mem: Option<ContextId>,
    pub children: Vec<ContextId>,
    pub pid: i32,
    pub is_process: bool,
    pub arch: SupportedArch,
    pub big_endian: bool,

    pub stopped: bool,
    pub exiting: bool,
    pub exited: bool,
    pub pending_intercept: bool,
    pub pending_step: bool,

    pub signal: i32,
    pub pending_signals: SignalSet,
    pub sig_dont_pass: SignalSet,
    pub sig_dont_stop: SignalSet,

    pub stopped_by_bp: bool,
    pub stopped_by_cb: Vec<String>,

    pub regs: Option<Vec<u8>>,
    pub regs_dirty: bool,
    pub regs_error: Option<String>,

    pub hw_group: Option<HwBpGroupState>,
    pub hw_thread: Option<HwBpThreadState>,
    /// Last `HwBpGroupState::generation` this thread's debug registers
    /// were written for (spec §3 "hw_bps_regs_generation").
    pub hw_bps_regs_generation: u64,

    /// Address of the transient one-shot breakpoint planted by
    /// [`crate::step`] to emulate single-step on architectures without a
    /// trustworthy OS single-step request (spec §2 dataflow, §4.I/§4.H).
    /// Cleared on the next stop regardless of whether the thread actually
    /// reached it.
    pub transient_step_addr: Option<u64>,

    /// Set while [`crate::hwbp::arm_step`]'s mismatch-mode slot 0 is armed
    /// for this thread (spec §4.J `hw_stepping` mode 1), used in Thumb
    /// state where the ARM-only software predictor can't decode the
    /// instruction stream. Cleared, and the slot disarmed, on the next
    /// stop.
    pub hw_step_active: bool,
}

impl Context {
    fn new(id: ContextId, pid: i32, is_process: bool, arch: SupportedArch) -> Context {
        Context {
            id,
            parent: None,
            mem: None,
            children: Vec::new(),
            pid,
            is_process,
            arch,
            big_endian: arch.register_file().is_big_endian(),
            stopped: false,
            exiting: false,
            exited: false,
            pending_intercept: false,
            pending_step: false,
            signal: 0,
            pending_signals: SignalSet::new(),
            sig_dont_pass: SignalSet::new(),
            sig_dont_stop: SignalSet::new(),
            stopped_by_bp: false,
            stopped_by_cb: Vec::new(),
            regs: None,
            regs_dirty: false,
            regs_error: None,
            hw_group: None,
            hw_thread: None,
            hw_bps_regs_generation: 0,
            transient_step_addr: None,
            hw_step_active: false,
        }
    }

    /// Own memory owner id: itself for a process context, `mem` for a
    /// thread context.
    pub fn mem_owner_id(&self) -> ContextId {
        self.mem.clone().unwrap_or_else(|| self.id.clone())
    }

    pub fn pc(&self) -> Result<u64, AgentError> {
        let blob = self
            .regs
            .as_ref()
            .ok_or_else(|| AgentError::InvalidContext(format!("{} has no register snapshot", self.id)))?;
        let def = self
            .arch
            .register_file()
            .by_role(crate::registers::RegisterRole::Pc)
            .ok_or_else(|| AgentError::Unsupported("no PC role registered".into()))?;
        crate::target_io::read_reg(blob, def)
    }

    pub fn set_pc(&mut self, value: u64) -> Result<(), AgentError> {
        let def = self
            .arch
            .register_file()
            .by_role(crate::registers::RegisterRole::Pc)
            .ok_or_else(|| AgentError::Unsupported("no PC role registered".into()))?
            .clone();
        let blob = self
            .regs
            .as_mut()
            .ok_or_else(|| AgentError::InvalidContext(format!("{} has no register snapshot", self.id)))?;
        crate::target_io::write_reg(blob, &def, value)?;
        self.regs_dirty = true;
        Ok(())
    }
}

/// Invoked on every context lifecycle transition (spec §4.C "event
/// sinks"). Out-of-scope wire broadcasting (§1) implements this; the
/// default used when no channel is attached just logs.
pub trait ContextEventSink {
    fn context_created(&mut self, id: &ContextId);
    fn context_changed(&mut self, id: &ContextId);
    fn context_stopped(&mut self, id: &ContextId);
    fn context_started(&mut self, id: &ContextId);
    fn context_exited(&mut self, id: &ContextId);
}

pub struct LoggingEventSink;

impl ContextEventSink for LoggingEventSink {
    fn context_created(&mut self, id: &ContextId) {
        log!(LogLevel::LogContext, "context created: {}", id);
    }
    fn context_changed(&mut self, id: &ContextId) {
        log!(LogLevel::LogContext, "context changed: {}", id);
    }
    fn context_stopped(&mut self, id: &ContextId) {
        log!(LogLevel::LogContext, "context stopped: {}", id);
    }
    fn context_started(&mut self, id: &ContextId) {
        log!(LogLevel::LogContext, "context started: {}", id);
    }
    fn context_exited(&mut self, id: &ContextId) {
        log!(LogLevel::LogContext, "context exited: {}", id);
    }
}

/// Arena owning every context by stable id, plus the per-pid lookup and
/// root list spec §4.C names.
#[derive(Default)]
pub struct ContextStore {
    roots: Vec<ContextId>,
    by_id: HashMap<ContextId, Rc<RefCell<Context>>>,
    by_pid: HashMap<i32, ContextId>,
}

impl ContextStore {
    pub fn new() -> ContextStore {
        ContextStore::default()
    }

    pub fn get(&self, id: &str) -> Option<Rc<RefCell<Context>>> {
        self.by_id.get(id).cloned()
    }

    pub fn require(&self, id: &str) -> Result<Rc<RefCell<Context>>, AgentError> {
        self.get(id)
            .ok_or_else(|| AgentError::InvalidContext(id.to_string()))
    }

    pub fn by_pid(&self, pid: i32) -> Option<Rc<RefCell<Context>>> {
        self.by_pid.get(&pid).and_then(|id| self.get(id))
    }

    pub fn roots(&self) -> &[ContextId] {
        &self.roots
    }

    pub fn create_process(&mut self, id: ContextId, pid: i32, arch: SupportedArch) -> ContextId {
        let ctx = Context::new(id.clone(), pid, true, arch);
        self.roots.push(id.clone());
        self.by_pid.insert(pid, id.clone());
        self.by_id.insert(id.clone(), Rc::new(RefCell::new(ctx)));
        id
    }

    pub fn create_thread(
        &mut self,
        id: ContextId,
        tid: i32,
        parent_process: &str,
    ) -> Result<ContextId, AgentError> {
        let parent_rc = self.require(parent_process)?;
        let arch = parent_rc.borrow().arch;
        let mut ctx = Context::new(id.clone(), tid, false, arch);
        ctx.parent = Some(parent_process.to_string());
        ctx.mem = Some(parent_process.to_string());
        parent_rc.borrow_mut().children.push(id.clone());
        self.by_id.insert(id.clone(), Rc::new(RefCell::new(ctx)));
        Ok(id)
    }

    /// Removes a context after its OS exit event has been fully processed
    /// (spec §3 "Lifecycles"). Unlinks it from its parent's child list.
    pub fn remove(&mut self, id: &str) {
        if let Some(ctx) = self.by_id.remove(id) {
            let ctx = ctx.borrow();
            if let Some(parent) = &ctx.parent {
                if let Some(p) = self.by_id.get(parent) {
                    p.borrow_mut().children.retain(|c| c != id);
                }
            }
            self.by_pid.remove(&ctx.pid);
        }
        self.roots.retain(|r| r != id);
    }

    pub fn children_of(&self, id: &str) -> Vec<ContextId> {
        self.get(id)
            .map(|c| c.borrow().children.clone())
            .unwrap_or_default()
    }

    /// Resolves the canonical context for a group query (spec §4.C). The
    /// spec leaves CPU-group resolution as a default ("by default the
    /// memory-owning context"); since stepping/register state is
    /// explicitly thread-local, this implementation resolves `Cpu` to the
    /// context itself rather than its memory owner (documented as an Open
    /// Question decision in DESIGN.md).
    pub fn group_context(&self, id: &str, group: ContextGroup) -> Option<ContextId> {
        let ctx = self.get(id)?;
        let ctx = ctx.borrow();
        match group {
            ContextGroup::Cpu => Some(id.to_string()),
            ContextGroup::Breakpoint | ContextGroup::Process | ContextGroup::Intercept => {
                Some(ctx.mem_owner_id())
            }
        }
    }

    /// All live, stopped thread contexts sharing the given memory owner,
    /// used by the replant engine (spec §4.G step 1) to register refs
    /// "for every live, stopped context" in a breakpoint group.
    pub fn live_stopped_siblings(&self, mem_owner: &str) -> Vec<ContextId> {
        let mut out = Vec::new();
        if let Some(owner) = self.get(mem_owner) {
            let owner_ref = owner.borrow();
            if owner_ref.stopped && !owner_ref.exited {
                out.push(mem_owner.to_string());
            }
            for child in &owner_ref.children {
                if let Some(c) = self.get(child) {
                    let c = c.borrow();
                    if c.stopped && !c.exited {
                        out.push(child.clone());
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_inherits_process_as_memory_owner() {
        let mut store = ContextStore::new();
        store.create_process("P1".into(), 100, SupportedArch::X64);
        store.create_thread("P1.T1".into(), 100, "P1").unwrap();
        let t = store.get("P1.T1").unwrap();
        assert_eq!(t.borrow().mem_owner_id(), "P1");
    }

    #[test]
    fn group_context_resolves_breakpoint_group_to_memory_owner() {
        let mut store = ContextStore::new();
        store.create_process("P1".into(), 100, SupportedArch::X64);
        store.create_thread("P1.T1".into(), 101, "P1").unwrap();
        assert_eq!(
            store.group_context("P1.T1", ContextGroup::Breakpoint),
            Some("P1".to_string())
        );
        assert_eq!(
            store.group_context("P1.T1", ContextGroup::Cpu),
            Some("P1.T1".to_string())
        );
    }

    #[test]
    fn remove_unlinks_from_parent_children() {
        let mut store = ContextStore::new();
        store.create_process("P1".into(), 100, SupportedArch::X64);
        store.create_thread("P1.T1".into(), 101, "P1").unwrap();
        store.remove("P1.T1");
        assert!(store.children_of("P1").is_empty());
        assert!(store.get("P1.T1").is_none());
    }
}
