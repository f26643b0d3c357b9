//! Wait-pid listener (spec §4.D): the single-threaded dispatcher that
//! translates `(pid, exited, exit_code, signal, event_code, is_syscall)`
//! OS notifications into context state changes and event-sink broadcasts.
//! The actual blocking `waitpid`/`PTRACE_EVENT_*` decode is a host-OS
//! portability shim (spec §1, out of scope); this module only consumes
//! the already-decoded tuple.

use std::collections::HashMap;

use crate::agent::Agent;
use crate::arch::SupportedArch;
use crate::context::ContextId;
use crate::error::{AgentError, AgentResult};
use crate::target_io;

/// One decoded OS debug-event notification.
#[derive(Clone, Debug)]
pub struct WaitPidEvent {
    pub pid: i32,
    pub exited: bool,
    pub exit_code: i32,
    pub signal: i32,
    /// Nonzero for `PTRACE_EVENT_*` notifications (clone/fork/exec/exit);
    /// spec §4.D's `stopped_by_bp` test requires this be zero.
    pub event_code: i32,
    pub is_syscall: bool,
}

/// Tracks pids the agent expects to see attach, and whether each is the
/// first thread of a brand-new process or an additional thread of an
/// already-known one (spec §4.D "Unknown pid, pending attach").
#[derive(Default)]
pub struct PendingAttach {
    expected: HashMap<i32, (Option<i32>, SupportedArch)>,
}

impl PendingAttach {
    pub fn new() -> PendingAttach {
        PendingAttach::default()
    }

    pub fn expect(&mut self, pid: i32, parent_tgid: Option<i32>, arch: SupportedArch) {
        self.expected.insert(pid, (parent_tgid, arch));
    }

    fn take(&mut self, pid: i32) -> Option<(Option<i32>, SupportedArch)> {
        self.expected.remove(&pid)
    }
}

/// Invoked exactly once, the moment a pending-attach pid is promoted to a
/// real context (spec §4.D).
pub trait AttachCallback {
    fn on_attached(&mut self, ctx_id: &str);
}

pub struct NoopAttachCallback;
impl AttachCallback for NoopAttachCallback {
    fn on_attached(&mut self, _ctx_id: &str) {}
}

/// Entry point: routes one notification to the unknown-pid, exit, or stop
/// transition (spec §4.D).
pub fn dispatch(
    agent: &mut Agent,
    pending: &mut PendingAttach,
    attach_cb: &mut dyn AttachCallback,
    ev: WaitPidEvent,
) -> AgentResult<()> {
    let known = agent.contexts.by_pid(ev.pid).is_some();
    let ctx_id = if known {
        agent.contexts.by_pid(ev.pid).unwrap().borrow().id.clone()
    } else {
        promote(agent, pending, attach_cb, ev.pid)?
    };

    if ev.exited {
        on_exit(agent, &ctx_id, ev.exit_code);
    } else {
        on_stop(agent, &ctx_id, &ev)?;
    }
    Ok(())
}

/// "Unknown pid, pending attach": promote to a real context, creating the
/// memory-owner if this is the first thread of a new process, and invoke
/// the attach callback exactly once.
fn promote(
    agent: &mut Agent,
    pending: &mut PendingAttach,
    attach_cb: &mut dyn AttachCallback,
    pid: i32,
) -> AgentResult<ContextId> {
    let (parent_tgid, arch) = pending
        .take(pid)
        .ok_or_else(|| AgentError::InvalidContext(format!("unexpected waitpid for unknown pid {}", pid)))?;

    let ctx_id = match parent_tgid {
        None => {
            let id = format!("P{}", pid);
            agent.contexts.create_process(id.clone(), pid, arch);
            agent.event_sink.context_created(&id);
            id
        }
        Some(tgid) => {
            let proc_id = format!("P{}", tgid);
            if agent.contexts.get(&proc_id).is_none() {
                agent.contexts.create_process(proc_id.clone(), tgid, arch);
                agent.event_sink.context_created(&proc_id);
            }
            let tid = format!("{}.T{}", proc_id, pid);
            agent.contexts.create_thread(tid.clone(), pid, &proc_id)?;
            agent.event_sink.context_created(&tid);
            tid
        }
    };
    attach_cb.on_attached(&ctx_id);
    Ok(ctx_id)
}

/// "Known pid, exit" (spec §4.D).
fn on_exit(agent: &mut Agent, ctx_id: &str, _exit_code: i32) {
    let ctx_rc = match agent.contexts.get(ctx_id) {
        Some(c) => c,
        None => return,
    };
    let was_stopped = ctx_rc.borrow().stopped;
    ctx_rc.borrow_mut().exiting = true;
    if was_stopped {
        agent.event_sink.context_started(ctx_id);
    }

    for child in agent.contexts.children_of(ctx_id) {
        if let Some(c) = agent.contexts.get(&child) {
            if !c.borrow().exited {
                agent.event_sink.context_started(&child);
                agent.event_sink.context_exited(&child);
            }
        }
    }

    {
        let mut ctx = ctx_rc.borrow_mut();
        ctx.regs = None;
        ctx.stopped = false;
        ctx.exited = true;
    }
    agent.event_sink.context_exited(ctx_id);
    agent.contexts.remove(ctx_id);
}

/// "Known pid, stop" (spec §4.D).
fn on_stop(agent: &mut Agent, ctx_id: &str, ev: &WaitPidEvent) -> AgentResult<()> {
    let ctx_rc = agent.contexts.require(ctx_id)?;
    let (pid, arch, mem_owner) = {
        let ctx = ctx_rc.borrow();
        (ctx.pid, ctx.arch, ctx.mem_owner_id())
    };

    // Snapshot the memory owner's hardware-breakpoint slot table before
    // taking any borrow on `ctx_rc` below; `mem_owner` can be `ctx_id`
    // itself for a process context, so this must not alias the later
    // mutable borrow of the same `RefCell`.
    let hw_instr_slots: Option<(u32, Vec<Option<String>>)> = if arch == SupportedArch::Arm {
        agent
            .contexts
            .get(&mem_owner)
            .and_then(|o| o.borrow().hw_group.as_ref().map(|g| (g.bp_cnt, g.slot_owner.clone())))
    } else {
        None
    };

    if ev.signal != 0 && ev.signal != libc::SIGSTOP && ev.signal != libc::SIGTRAP {
        ctx_rc.borrow_mut().pending_signals.set(ev.signal, true);
    }
    if ev.signal != 0 {
        let dont_stop = ctx_rc.borrow().sig_dont_stop.get(ev.signal);
        if !dont_stop {
            ctx_rc.borrow_mut().pending_intercept = true;
        }
    }
    ctx_rc.borrow_mut().signal = ev.signal;

    let regs = target_io::read_registers(pid, arch)?;
    let break_size = arch.break_inst_size() as u64;

    let mut ctx = ctx_rc.borrow_mut();
    ctx.regs = Some(regs);
    ctx.regs_dirty = false;
    ctx.regs_error = None;
    let pc = ctx.pc()?;

    let stopped_by_bp = ev.signal == libc::SIGTRAP
        && ev.event_code == 0
        && !ev.is_syscall
        && pc >= break_size
        && agent.break_table.is_breakpoint_address(&mem_owner, pc - break_size);

    ctx.stopped_by_bp = stopped_by_bp;
    if stopped_by_bp {
        ctx.set_pc(pc - break_size)?;
    }

    // Suspend-side hardware-breakpoint detection (spec §4.J): an armed
    // instruction slot whose address matches the raw stop PC. ARM traps
    // with PC already at the breakpoint address, unlike the x86 `int3`
    // adjustment above, so this uses `pc` directly. Watchpoint `si_addr`
    // matching is left out: no `PTRACE_GETSIGINFO` plumbing exists here to
    // supply it.
    ctx.stopped_by_cb.clear();
    if let Some((bp_cnt, slot_owner)) = &hw_instr_slots {
        let is_hw_candidate = ev.signal == libc::SIGTRAP && ev.event_code == 0 && !ev.is_syscall;
        if is_hw_candidate {
            if let Some(thread) = ctx.hw_thread.as_ref() {
                for (i, owner_id) in slot_owner.iter().enumerate() {
                    if i == 0 || i >= *bp_cnt as usize {
                        continue;
                    }
                    if let (Some(bp_id), Some(Some(slot))) = (owner_id, thread.slots.get(i)) {
                        if slot.addr == pc as u32 {
                            ctx.stopped_by_cb.push(bp_id.clone());
                        }
                    }
                }
            }
        }
    }

    let end_of_step = ctx.pending_step && !ctx.stopped_by_bp;
    if end_of_step {
        ctx.pending_intercept = true;
    }
    ctx.pending_step = false;
    ctx.stopped = true;
    let transient_addr = ctx.transient_step_addr.take();
    let was_hw_stepping = std::mem::take(&mut ctx.hw_step_active);
    drop(ctx);

    if let Some(addr) = transient_addr {
        agent.break_table.clear_transient(pid, addr);
    }
    if was_hw_stepping {
        let _ = crate::hwbp::disarm_step(agent, ctx_id);
    }

    agent.event_sink.context_stopped(ctx_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingCallback(Vec<String>);
    impl AttachCallback for RecordingCallback {
        fn on_attached(&mut self, ctx_id: &str) {
            self.0.push(ctx_id.to_string());
        }
    }

    #[test]
    fn unknown_unexpected_pid_is_invalid_context() {
        let mut agent = Agent::new();
        let mut pending = PendingAttach::new();
        let mut cb = NoopAttachCallback;
        let ev = WaitPidEvent {
            pid: 999,
            exited: false,
            exit_code: 0,
            signal: 0,
            event_code: 0,
            is_syscall: false,
        };
        assert!(dispatch(&mut agent, &mut pending, &mut cb, ev).is_err());
    }

    #[test]
    fn expected_new_process_promotes_and_invokes_callback_once() {
        let mut agent = Agent::new();
        let mut pending = PendingAttach::new();
        pending.expect(100, None, SupportedArch::X64);
        let mut cb = RecordingCallback(Vec::new());
        let ev = WaitPidEvent {
            pid: 100,
            exited: false,
            exit_code: 0,
            signal: libc::SIGTRAP,
            event_code: 0,
            is_syscall: false,
        };
        // read_registers will fail against a non-existent pid in this
        // unit-test environment; we only assert the context was created
        // and the callback ran exactly once before that OS call.
        let _ = dispatch(&mut agent, &mut pending, &mut cb, ev);
        assert_eq!(cb.0, vec!["P100".to_string()]);
        assert!(agent.contexts.get("P100").is_some());
    }

    #[test]
    fn exit_marks_exiting_and_removes_context() {
        let mut agent = Agent::new();
        agent.contexts.create_process("P1".into(), 1, SupportedArch::X64);
        on_exit(&mut agent, "P1", 0);
        assert!(agent.contexts.get("P1").is_none());
    }
}
