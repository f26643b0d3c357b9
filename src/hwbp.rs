//! Hardware breakpoint multiplexer (spec §4.J): flushes a thread's debug
//! registers whenever the memory owner's `hw_bps_generation` has moved
//! past what the thread last wrote, grounded in `cpu_bp_on_resume` /
//! `cpu_bp_on_suspend` in the ARM machine-dependent layer. Only ARM
//! carries a real multiplexer (spec §4.J is ARM-specific in the original
//! agent); x86 contexts simply have no `hw_group`/`hw_thread` state and
//! this module is a no-op for them.

use crate::agent::Agent;
use crate::arch::arm::{self, HwBpThreadState};
use crate::arch::SupportedArch;
use crate::error::AgentResult;

/// Re-encodes and writes every slot if the thread's debug registers are
/// stale relative to the memory owner's generation counter (spec §4.J
/// "On every resume that finds hw_bps_generation ahead of the thread's
/// hw_bps_regs_generation, the multiplexer re-encodes all slots").
pub fn flush_if_stale(agent: &mut Agent, ctx_id: &str) -> AgentResult<()> {
    let ctx_rc = agent.contexts.require(ctx_id)?;
    let (arch, pid, mem_owner) = {
        let ctx = ctx_rc.borrow();
        (ctx.arch, ctx.pid, ctx.mem_owner_id())
    };
    if arch != SupportedArch::Arm {
        return Ok(());
    }
    let owner_rc = match agent.contexts.get(&mem_owner) {
        Some(o) => o,
        None => return Ok(()),
    };
    let group_generation = match &owner_rc.borrow().hw_group {
        Some(g) => g.generation,
        None => return Ok(()),
    };

    let mut ctx = ctx_rc.borrow_mut();
    if ctx.hw_bps_regs_generation >= group_generation {
        return Ok(());
    }
    let (num_slots, slot_value) = {
        let owner = owner_rc.borrow();
        let group = match owner.hw_group.as_ref() {
            Some(g) => g,
            None => return Ok(()),
        };
        (group.total_slots(), group.slot_value.clone())
    };
    if ctx.hw_thread.is_none() {
        ctx.hw_thread = Some(HwBpThreadState::new(num_slots));
    }
    if let Some(state) = &mut ctx.hw_thread {
        // Slot 0 stays reserved for this thread's own hw-stepping use and
        // is never overwritten from the group's planted-breakpoint table.
        // Written directly by index rather than through `allocate_slot`
        // (which would pick the lowest free slot instead of mirroring the
        // group's own slot assignment).
        for (i, value) in slot_value.iter().enumerate().skip(1) {
            if let Some(slot) = state.slots.get_mut(i) {
                *slot = value.map(|(addr, ctrl)| arm::HwBpSlot {
                    addr,
                    ctrl,
                    generation: group_generation,
                });
            }
        }
    }
    if let Some(state) = &ctx.hw_thread {
        arm::set_debug_regs(pid, state, num_slots)?;
    }
    ctx.hw_bps_regs_generation = group_generation;
    Ok(())
}

/// Allocates a debug-register slot for a newly planted hardware
/// breakpoint/watchpoint, first-free, and bumps the owner's generation so
/// every thread re-syncs on next resume (spec §4.J "allocated first-free
/// on plant"). `length`/`access` (0 for an instruction breakpoint,
/// [`arm::HWBP_ACCESS_LOAD`]/[`arm::HWBP_ACCESS_STORE`] for a watchpoint)
/// feed [`arm::build_control_register`] rather than taking a pre-built
/// control register from the caller.
pub fn allocate(
    agent: &mut Agent,
    mem_owner: &str,
    bp_id: &str,
    addr: u32,
    length: u32,
    access: u32,
) -> Option<usize> {
    let owner_rc = agent.contexts.get(mem_owner)?;
    let mut owner = owner_rc.borrow_mut();
    let group = owner.hw_group.as_mut()?;
    let slot = group
        .slot_owner
        .iter()
        .position(|s| s.is_none())
        .filter(|i| *i > 0)?;
    let ctrl = arm::build_control_register(addr, length, access);
    group.slot_owner[slot] = Some(bp_id.to_string());
    group.slot_value[slot] = Some((addr, ctrl));
    group.bump_generation();
    Some(slot)
}

/// Arms the hardware mismatch-mode single-step (spec §4.J `hw_stepping`
/// mode 1) for a thread whose current instruction stream the software
/// predictor can't decode (Thumb state), and writes the debug registers
/// immediately rather than waiting for the next stale-generation flush —
/// this only touches the thread's own reserved slot 0, not the group's
/// shared breakpoint slots.
pub fn arm_step(agent: &mut Agent, ctx_id: &str) -> AgentResult<()> {
    let ctx_rc = agent.contexts.require(ctx_id)?;
    let (pid, arch, num_slots, pc) = {
        let ctx = ctx_rc.borrow();
        let num_slots = ctx.hw_group.as_ref().map(|g| g.total_slots()).unwrap_or_else(|| {
            agent
                .contexts
                .get(&ctx.mem_owner_id())
                .and_then(|o| o.borrow().hw_group.as_ref().map(|g| g.total_slots()))
                .unwrap_or(1)
        });
        (ctx.pid, ctx.arch, num_slots, ctx.pc()? as u32)
    };
    let mut ctx = ctx_rc.borrow_mut();
    if ctx.hw_thread.is_none() {
        ctx.hw_thread = Some(HwBpThreadState::new(num_slots));
    }
    let generation = ctx.hw_bps_regs_generation;
    if let Some(state) = &mut ctx.hw_thread {
        state.arm_stepping_mismatch(pc, generation);
    }
    if let Some(state) = &ctx.hw_thread {
        arm::set_debug_regs(pid, state, num_slots)?;
    }
    let _ = arch;
    Ok(())
}

/// Disarms the hardware single-step slot after a stop, mirroring the
/// transient software-breakpoint cleanup in [`crate::step`].
pub fn disarm_step(agent: &mut Agent, ctx_id: &str) -> AgentResult<()> {
    let ctx_rc = agent.contexts.require(ctx_id)?;
    let (pid, num_slots) = {
        let ctx = ctx_rc.borrow();
        let num_slots = ctx
            .hw_thread
            .as_ref()
            .map(|t| t.slots.len() as u32)
            .unwrap_or(1);
        (ctx.pid, num_slots)
    };
    let mut ctx = ctx_rc.borrow_mut();
    if let Some(state) = &mut ctx.hw_thread {
        if state.hw_stepping != 0 {
            state.disarm_stepping();
            arm::set_debug_regs(pid, state, num_slots)?;
        }
    }
    Ok(())
}

pub fn release(agent: &mut Agent, mem_owner: &str, slot: usize) {
    if let Some(owner_rc) = agent.contexts.get(mem_owner) {
        let mut owner = owner_rc.borrow_mut();
        if let Some(group) = owner.hw_group.as_mut() {
            if let Some(s) = group.slot_owner.get_mut(slot) {
                *s = None;
            }
            if let Some(v) = group.slot_value.get_mut(slot) {
                *v = None;
            }
            group.bump_generation();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::HwBpGroupState;

    #[test]
    fn non_arm_contexts_skip_flush() {
        let mut agent = Agent::new();
        agent.contexts.create_process("P1".into(), 1, SupportedArch::X64);
        assert!(flush_if_stale(&mut agent, "P1").is_ok());
    }

    #[test]
    fn allocate_bumps_generation_and_skips_reserved_slot() {
        let mut agent = Agent::new();
        agent.contexts.create_process("P1".into(), 1, SupportedArch::Arm);
        agent
            .contexts
            .get("P1")
            .unwrap()
            .borrow_mut()
            .hw_group = Some(HwBpGroupState::new(4, 2, 1, 4));
        let slot = allocate(&mut agent, "P1", "A.1", 0x4000, 4, 0).unwrap();
        assert_ne!(slot, 0);
        assert_eq!(agent.contexts.get("P1").unwrap().borrow().hw_group.as_ref().unwrap().generation, 1);
    }

    #[test]
    fn arm_step_arms_slot_zero_then_disarm_clears_it() {
        let mut agent = Agent::new();
        agent.contexts.create_process("P1".into(), std::process::id() as i32, SupportedArch::Arm);
        {
            let ctx_rc = agent.contexts.get("P1").unwrap();
            let mut ctx = ctx_rc.borrow_mut();
            ctx.hw_group = Some(HwBpGroupState::new(4, 2, 1, 4));
            ctx.regs = Some(vec![0u8; 17 * 4]);
        }
        // set_debug_regs will fail against a fake pid outside a real
        // tracee; arming/disarming slot 0 locally is what's under test.
        let _ = arm_step(&mut agent, "P1");
        let hw_stepping = agent
            .contexts
            .get("P1")
            .unwrap()
            .borrow()
            .hw_thread
            .as_ref()
            .map(|t| t.hw_stepping);
        assert_eq!(hw_stepping, Some(1));
        let _ = disarm_step(&mut agent, "P1");
        let hw_stepping = agent
            .contexts
            .get("P1")
            .unwrap()
            .borrow()
            .hw_thread
            .as_ref()
            .map(|t| t.hw_stepping);
        assert_eq!(hw_stepping, Some(0));
    }
}
