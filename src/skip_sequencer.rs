//! Skip-breakpoint sequencer (spec §4.H): called on every resume. If the
//! thread is stopped on its own planted breakpoint, temporarily unplants
//! it, single-steps, and replants before the caller's actual resume
//! proceeds. Grounded in `safe_restore_breakpoint`/`safe_skip_breakpoint`/
//! `skip_breakpoint` in the original breakpoint engine.

use crate::agent::Agent;
use crate::error::AgentResult;

/// Returns `true` if the sequencer took over the resume (the caller must
/// not also issue `continue`); `false` if there was nothing to skip and
/// the normal resume path should proceed.
pub fn maybe_skip(agent: &mut Agent, ctx_id: &str) -> AgentResult<bool> {
    let ctx_rc = agent.contexts.require(ctx_id)?;
    let (pid, mem_owner, pc) = {
        let ctx = ctx_rc.borrow();
        (ctx.pid, ctx.mem_owner_id(), ctx.pc()?)
    };

    if !agent.break_table.is_breakpoint_address(&mem_owner, pc) {
        return Ok(false);
    }
    let errored = agent
        .break_table
        .get(pc)
        .map(|bi| bi.error.is_some())
        .unwrap_or(true);
    if errored {
        return Ok(false);
    }

    agent.break_table.set_skip(pc, true);
    agent.break_table.unplant(pid, pc)?;
    ctx_rc.borrow_mut().pending_step = true;
    crate::target_io::single_step(pid)?;

    let ctx_id_owned = ctx_id.to_string();
    agent.safe_events.post(Box::new(move |agent: &mut Agent| {
        agent.break_table.set_skip(pc, false);
        agent.break_table.plant(pid, pc);
        let _ = agent.resume(&ctx_id_owned);
    }));

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::SupportedArch;

    #[test]
    fn no_breakpoint_at_pc_is_a_noop() {
        let mut agent = Agent::new();
        agent.contexts.create_process("P1".into(), 1, SupportedArch::X64);
        agent
            .contexts
            .get("P1")
            .unwrap()
            .borrow_mut()
            .regs = Some(vec![0u8; 216]);
        let took_over = maybe_skip(&mut agent, "P1").unwrap();
        assert!(!took_over);
    }
}
