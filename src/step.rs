//! Bridges the per-architecture stepping predictor (spec §4.I) into the
//! break-instruction table (§4.E) for the "resume with single-step"
//! dataflow spec §2 describes: "if stepping is needed and the OS offers no
//! single-step, [the predictor] computes a target address and [the
//! skip-sequencer] plants a one-shot via [the break-instruction table]."
//!
//! x86/x64 always have a trustworthy `PTRACE_SINGLESTEP`
//! ([`crate::arch::SupportedArch::supports_os_single_step`]) and take the
//! direct path; ARM never does, so every step here decodes the current
//! instruction and plants a transient breakpoint at the predicted
//! successor instead.

use crate::agent::Agent;
use crate::arch::arm::{self, PredictorContext};
use crate::error::{AgentError, AgentResult};
use crate::target_io;

/// Adapts a live thread's cached register blob and address space to the
/// [`PredictorContext`] the ARM decoder expects. General registers 0-14
/// read straight out of the snapshot; register 15 (PC, per the ARM
/// encoding the decoder uses for `Rn`/`Rd`/`Rm` fields) returns the
/// standard ARM "PC reads as current instruction + 8" prefetch value
/// rather than the architectural PC, and 16 is the decoder's internal
/// alias for CPSR.
struct LiveContext<'a> {
    blob: &'a [u8],
    pid: i32,
    pc: u32,
}

const ARM_GP_NAMES: [&str; 15] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "sp", "lr",
];

impl PredictorContext for LiveContext<'_> {
    fn reg(&self, n: u32) -> u32 {
        let name = match n {
            0..=14 => ARM_GP_NAMES[n as usize],
            15 => return self.pc.wrapping_add(8),
            _ => "cpsr",
        };
        arm::register_file()
            .by_name(name)
            .and_then(|def| target_io::read_reg(self.blob, def).ok())
            .unwrap_or(0) as u32
    }

    fn read_word(&self, addr: u32) -> u32 {
        target_io::read_raw_mem(self.pid, addr as u64, 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .unwrap_or(0)
    }
}

/// Single-steps a stopped thread (spec §4.H/§4.I integration point).
/// Callers go through this instead of [`target_io::single_step`] directly
/// whenever the architecture might lack OS single-step support.
pub fn step(agent: &mut Agent, ctx_id: &str) -> AgentResult<()> {
    agent.run_exclusive(|agent| step_inner(agent, ctx_id))
}

fn step_inner(agent: &mut Agent, ctx_id: &str) -> AgentResult<()> {
    crate::hwbp::flush_if_stale(agent, ctx_id)?;

    let ctx_rc = agent.contexts.require(ctx_id)?;
    let (pid, arch, mem_owner) = {
        let ctx = ctx_rc.borrow();
        (ctx.pid, ctx.arch, ctx.mem_owner_id())
    };

    if arch.supports_os_single_step() {
        ctx_rc.borrow_mut().pending_step = true;
        return target_io::single_step(pid);
    }

    let (blob, pc) = {
        let ctx = ctx_rc.borrow();
        let blob = ctx.regs.clone().ok_or_else(|| {
            AgentError::InvalidContext(format!("{} has no register snapshot", ctx_id))
        })?;
        (blob, ctx.pc()? as u32)
    };

    let cpsr = arm::register_file()
        .by_name("cpsr")
        .and_then(|def| target_io::read_reg(&blob, def).ok())
        .unwrap_or(0) as u32;
    if cpsr & arm::CPSR_T_BIT != 0 {
        // Thumb state: the ARM-only decoder below can't read this
        // instruction stream, so fall back to the hardware mismatch-mode
        // single-step instead of a software-predicted transient plant.
        ctx_rc.borrow_mut().hw_step_active = true;
        ctx_rc.borrow_mut().pending_step = true;
        crate::hwbp::arm_step(agent, ctx_id)?;
        return target_io::continue_with_signal(pid, 0);
    }

    let instr_bytes = target_io::read_mem(&agent.break_table, &mem_owner, pid, pc as u64, 4)?;
    let instr = u32::from_le_bytes([instr_bytes[0], instr_bytes[1], instr_bytes[2], instr_bytes[3]]);
    let live = LiveContext {
        blob: &blob,
        pid,
        pc,
    };
    let target = arm::predict_next_pc(&live, pc, instr) as u64;

    agent.break_table.plant_transient(pid, &mem_owner, target, arch);
    ctx_rc.borrow_mut().transient_step_addr = Some(target);
    ctx_rc.borrow_mut().pending_step = true;

    target_io::continue_with_signal(pid, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::SupportedArch;

    #[test]
    fn x64_thread_takes_os_single_step_path() {
        let mut agent = Agent::new();
        agent.contexts.create_process("P1".into(), 1, SupportedArch::X64);
        agent.contexts.get("P1").unwrap().borrow_mut().regs = Some(vec![0u8; 216]);
        agent.contexts.get("P1").unwrap().borrow_mut().stopped = true;
        // single_step() will fail against a fake pid outside a real tracee;
        // the point under test is that it's attempted rather than the
        // predictor path, which we can't observe directly without a live
        // process, so just assert the architecture gate.
        assert!(SupportedArch::X64.supports_os_single_step());
        let _ = step(&mut agent, "P1");
    }

    #[test]
    fn arm_thread_in_thumb_state_takes_hw_mismatch_step_path() {
        let mut agent = Agent::new();
        agent.contexts.create_process("P1".into(), std::process::id() as i32, SupportedArch::Arm);
        {
            let ctx_rc = agent.contexts.get("P1").unwrap();
            let mut ctx = ctx_rc.borrow_mut();
            let mut regs = vec![0u8; 17 * 4];
            let cpsr_def = arm::register_file().by_name("cpsr").unwrap().clone();
            target_io::write_reg(&mut regs, &cpsr_def, arm::CPSR_T_BIT as u64).unwrap();
            ctx.regs = Some(regs);
            ctx.stopped = true;
            ctx.hw_group = Some(crate::context::HwBpGroupState::new(4, 2, 1, 4));
        }
        // continue_with_signal/set_debug_regs will fail against a fake pid
        // outside a real tracee; what's under test is that Thumb state
        // routes through the hardware mismatch-mode path, not the ARM
        // software decoder.
        let _ = step(&mut agent, "P1");
        let hw_step_active = agent.contexts.get("P1").unwrap().borrow().hw_step_active;
        assert!(hw_step_active);
    }
}
