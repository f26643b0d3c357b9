//! Architecture dispatch (spec §4.A/§4.I/§4.J): ARM (the only architecture
//! with a hardware breakpoint multiplexer and a software next-PC
//! predictor, spec §4.I/§4.J) and x86/x86-64 (software breakpoints and OS
//! single-step only, no predictor needed since the OS single-step path is
//! always available there).

pub mod arm;
pub mod x86;

use crate::registers::RegisterFile;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SupportedArch {
    Arm,
    X86,
    X64,
}

impl SupportedArch {
    pub fn register_file(self) -> &'static RegisterFile {
        crate::registers::register_file_for(self)
    }

    /// Trap instruction bytes planted at a breakpoint address (spec §4.E).
    pub fn break_inst(self) -> &'static [u8] {
        match self {
            SupportedArch::Arm => &arm::BREAK_INST,
            SupportedArch::X86 | SupportedArch::X64 => &x86::BREAK_INST,
        }
    }

    pub fn break_inst_size(self) -> usize {
        self.break_inst().len()
    }

    /// Whether the OS single-step request (PTRACE_SINGLESTEP) is reliable
    /// on this architecture. ARM kernels historically lacked hardware
    /// single-step support for user tasks, which is why a software
    /// next-PC predictor (spec §4.I) steps in as a fallback; x86/x64
    /// always have it.
    pub fn supports_os_single_step(self) -> bool {
        match self {
            SupportedArch::Arm => false,
            SupportedArch::X86 | SupportedArch::X64 => true,
        }
    }

    pub fn word_size(self) -> usize {
        match self {
            SupportedArch::Arm | SupportedArch::X86 => 4,
            SupportedArch::X64 => 8,
        }
    }

    /// Clears any lingering single-step flag in a register snapshot before
    /// resume (spec §9 open question: generalized past the source's
    /// x86-only `eflags` trap-flag handling to "clear any lingering
    /// single-step flag on resume" for every architecture). ARM has no
    /// such flag in CPSR for user single-step emulation, so this is a
    /// no-op there; x86/x64 clear EFLAGS bit 8 (TF).
    pub fn clear_single_step_flag(self, regs_blob: &mut [u8]) {
        match self {
            SupportedArch::Arm => {}
            SupportedArch::X86 | SupportedArch::X64 => {
                if let Some(def) = self.register_file().by_role(crate::registers::RegisterRole::Status) {
                    if let Ok(mut val) = crate::target_io::read_reg(regs_blob, def) {
                        val &= !(1u64 << 8);
                        let _ = crate::target_io::write_reg(regs_blob, def, val);
                    }
                }
            }
        }
    }
}
