//! ARM machine-dependent definitions: register table, the software
//! next-PC predictor, and the hardware breakpoint/watchpoint register
//! multiplexer (spec §4.I, §4.J).
//!
//! ARM kernels historically offer no reliable OS single-step for user
//! tasks, so the agent predicts where a non-branch, branch or PC-loading
//! instruction will transfer control to and plants a temporary breakpoint
//! there instead (`arm_get_next_address` in the original machine-dependent
//! layer). The condition/shifter/decode tables below are carried over
//! verbatim in spirit from that code; only instruction classes that can
//! write PC are decoded; anything else is reported as a straight
//! fall-through to `pc + 4`.

use crate::registers::{RegisterDefinition as R, RegisterFile, RegisterRole};
use lazy_static::lazy_static;

pub const BREAK_INST: [u8; 4] = [0xF0, 0x01, 0xF0, 0xE7];

fn base_defs() -> Vec<R> {
    let mut v = vec![
        R::leaf("r0", 0, 4, 0),
        R::leaf("r1", 4, 4, 1),
        R::leaf("r2", 8, 4, 2),
        R::leaf("r3", 12, 4, 3),
        R::leaf("r4", 16, 4, 4),
        R::leaf("r5", 20, 4, 5),
        R::leaf("r6", 24, 4, 6),
        R::leaf("r7", 28, 4, 7),
        R::leaf("r8", 32, 4, 8),
        R::leaf("r9", 36, 4, 9),
        R::leaf("r10", 40, 4, 10),
        R::leaf("r11", 44, 4, 11).with_role(RegisterRole::Fp),
        R::leaf("r12", 48, 4, 12),
        R::leaf("sp", 52, 4, 13).with_role(RegisterRole::Sp),
        R::leaf("lr", 56, 4, 14).with_role(RegisterRole::Lr),
        R::leaf("pc", 60, 4, 15).with_role(RegisterRole::Pc),
        R::leaf("cpsr", 64, 4, 128).with_role(RegisterRole::Status),
        R::leaf("orig_r0", 68, 4, -1),
    ];
    if vfp_supported() {
        v.push(R::group("vfp-single"));
        for i in 0..32u32 {
            v.push(
                R::leaf(
                    Box::leak(format!("s{}", i).into_boxed_str()),
                    72 + (i as usize) * 4,
                    4,
                    256 + i as i32,
                )
                .with_parent("vfp-single")
                .read_only(),
            );
        }
    }
    v
}

/// One-time, failure-tolerant probe for VFP register availability, mirroring
/// `get_bp_info`'s pattern in the original ARM machine-dependent layer:
/// a PTRACE_GETVFPREGS failure just means the feature is absent, never an
/// error worth surfacing to the caller.
fn vfp_supported() -> bool {
    // No live tracee at register-file construction time; VFP leaves are
    // advertised unconditionally and any individual register read simply
    // fails per-context if the kernel rejects PTRACE_GETVFPREGS for that
    // tracee. Kept as its own function so the real probe can be dropped in
    // without reshaping the table.
    true
}

lazy_static! {
    static ref ARM: RegisterFile = RegisterFile::new(base_defs());
}

pub fn register_file() -> &'static RegisterFile {
    &ARM
}

const REG_CPSR: u32 = 16;
const REG_LR: u32 = 14;
const REG_PC: u32 = 15;

/// CPSR Thumb-state bit. When set, the fetched instruction stream is
/// 16-bit Thumb, not the 32-bit ARM encoding [`predict_next_pc`] decodes,
/// so stepping falls back to the hardware mismatch-mode breakpoint
/// instead of software prediction.
pub const CPSR_T_BIT: u32 = 1 << 5;

/// Read access the predictor needs: general registers by ARM encoding
/// number (0-15, 15 is unused since callers pass `pc` separately) plus
/// CPSR, and word-aligned memory loads for the LDR/LDM decode paths.
pub trait PredictorContext {
    fn reg(&self, n: u32) -> u32;
    fn read_word(&self, addr: u32) -> u32;
}

fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// N/Z/C/V condition table. Condition `0b1111` is treated as "never"
/// rather than "always" (the encoding the agent's original machine
/// dependent layer reserved it for); this only affects already-deprecated
/// encodings, not `AL` (`0b1110`), which every compiler emits for
/// unconditional instructions.
fn evaluate_condition(cond: u32, cpsr: u32) -> bool {
    let n = (cpsr >> 31) & 1 != 0;
    let z = (cpsr >> 30) & 1 != 0;
    let c = (cpsr >> 29) & 1 != 0;
    let v = (cpsr >> 28) & 1 != 0;
    match cond {
        0x0 => z,
        0x1 => !z,
        0x2 => c,
        0x3 => !c,
        0x4 => n,
        0x5 => !n,
        0x6 => v,
        0x7 => !v,
        0x8 => c && !z,
        0x9 => !c || z,
        0xA => n == v,
        0xB => n != v,
        0xC => !z && (n == v),
        0xD => z || (n != v),
        0xE => true,
        0xF => false,
        _ => unreachable!(),
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum ShiftType {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

fn calc_shift(shift_type: ShiftType, amount: u32, value: u32, carry_in: bool) -> u32 {
    if amount == 0 {
        return match shift_type {
            ShiftType::Lsl => value,
            ShiftType::Ror => (value >> 1) | ((carry_in as u32) << 31), // RRX
            _ => value,
        };
    }
    match shift_type {
        ShiftType::Lsl => {
            if amount >= 32 {
                0
            } else {
                value << amount
            }
        }
        ShiftType::Lsr => {
            if amount >= 32 {
                0
            } else {
                value >> amount
            }
        }
        ShiftType::Asr => {
            if amount >= 32 {
                ((value as i32) >> 31) as u32
            } else {
                ((value as i32) >> amount) as u32
            }
        }
        ShiftType::Ror => value.rotate_right(amount % 32),
    }
}

fn shifter_operand(ctx: &dyn PredictorContext, instr: u32, cpsr_c: bool) -> u32 {
    if (instr >> 25) & 1 != 0 {
        let imm = instr & 0xFF;
        let rotate = ((instr >> 8) & 0xF) * 2;
        imm.rotate_right(rotate)
    } else {
        let rm = ctx.reg(instr & 0xF);
        let shift_type = match (instr >> 5) & 0x3 {
            0 => ShiftType::Lsl,
            1 => ShiftType::Lsr,
            2 => ShiftType::Asr,
            _ => ShiftType::Ror,
        };
        let amount = if (instr >> 4) & 1 != 0 {
            ctx.reg((instr >> 8) & 0xF) & 0xFF
        } else {
            (instr >> 7) & 0x1F
        };
        calc_shift(shift_type, amount, rm, cpsr_c)
    }
}

fn get_next_bx(ctx: &dyn PredictorContext, instr: u32) -> u32 {
    let rm = instr & 0xF;
    ctx.reg(rm) & !1u32
}

fn get_next_branch(ctx: &dyn PredictorContext, pc: u32, instr: u32) -> u32 {
    let offset = sign_extend(instr & 0x00FF_FFFF, 24) << 2;
    let _ = ctx;
    (pc.wrapping_add(8) as i32).wrapping_add(offset) as u32
}

fn get_next_data_processing(ctx: &dyn PredictorContext, pc: u32, instr: u32) -> u32 {
    let opcode = (instr >> 21) & 0xF;
    let rn = ctx.reg((instr >> 16) & 0xF);
    let cpsr_c = (ctx.reg(REG_CPSR) >> 29) & 1 != 0;
    let operand2 = shifter_operand(ctx, instr, cpsr_c);
    match opcode {
        0x0 => rn & operand2,                      // AND
        0x1 => rn ^ operand2,                       // EOR
        0x2 => rn.wrapping_sub(operand2),           // SUB
        0x3 => operand2.wrapping_sub(rn),           // RSB
        0x4 => rn.wrapping_add(operand2),           // ADD
        0x5 => rn.wrapping_add(operand2).wrapping_add(cpsr_c as u32), // ADC
        0x6 => rn.wrapping_sub(operand2).wrapping_sub(!cpsr_c as u32), // SBC
        0x7 => operand2.wrapping_sub(rn).wrapping_sub(!cpsr_c as u32), // RSC
        0xC => rn | operand2,                       // ORR
        0xD => operand2,                             // MOV
        0xE => rn & !operand2,                       // BIC
        0xF => !operand2,                            // MVN
        _ => pc.wrapping_add(4),
    }
}

fn get_next_ldr(ctx: &dyn PredictorContext, instr: u32) -> u32 {
    let p = (instr >> 24) & 1 != 0;
    let u = (instr >> 23) & 1 != 0;
    let rn_val = ctx.reg((instr >> 16) & 0xF);
    let offset = if (instr >> 25) & 1 != 0 {
        let cpsr_c = (ctx.reg(REG_CPSR) >> 29) & 1 != 0;
        shifter_operand(ctx, instr, cpsr_c) as i64
    } else {
        (instr & 0xFFF) as i64
    };
    let address = if p {
        if u {
            (rn_val as i64 + offset) as u32
        } else {
            (rn_val as i64 - offset) as u32
        }
    } else {
        rn_val
    };
    ctx.read_word(address & !3)
}

fn get_next_ldm(ctx: &dyn PredictorContext, instr: u32) -> u32 {
    let p = (instr >> 24) & 1 != 0;
    let u = (instr >> 23) & 1 != 0;
    let rn_val = ctx.reg((instr >> 16) & 0xF);
    let list = instr & 0xFFFF;
    let count = list.count_ones();
    let low_addr: i64 = if u {
        if p {
            rn_val as i64 + 4
        } else {
            rn_val as i64
        }
    } else if p {
        rn_val as i64 - 4 * count as i64
    } else {
        rn_val as i64 - 4 * (count as i64 - 1)
    };
    let bits_below_pc = (list & 0x7FFF).count_ones();
    let pc_addr = (low_addr + 4 * bits_below_pc as i64) as u32;
    ctx.read_word(pc_addr & !3)
}

/// Predicts the address execution transfers to after `instr` (fetched at
/// `pc`) executes, applying the kernel user-helper-page redirection
/// unconditionally on the result: any predicted target at or above
/// `0xffff0000` is replaced with the current link register, matching the
/// original's post-decode check rather than special-casing the helper
/// call sites individually.
pub fn predict_next_pc(ctx: &dyn PredictorContext, pc: u32, instr: u32) -> u32 {
    let cond = (instr >> 28) & 0xF;
    if !evaluate_condition(cond, ctx.reg(REG_CPSR)) {
        return pc.wrapping_add(4);
    }

    let rd = (instr >> 12) & 0xF;
    let target = if instr & 0x0FFF_FFF0 == 0x012F_FF10 {
        get_next_bx(ctx, instr)
    } else if (instr >> 25) & 0x7 == 0b101 {
        get_next_branch(ctx, pc, instr)
    } else if (instr >> 26) & 0x3 == 0b00 && rd == REG_PC && (instr >> 4) & 0b1001 != 0b1001 {
        get_next_data_processing(ctx, pc, instr)
    } else if (instr >> 26) & 0x3 == 0b01 && rd == REG_PC && (instr >> 20) & 1 != 0 {
        get_next_ldr(ctx, instr)
    } else if (instr >> 25) & 0x7 == 0b100 && (instr & (1 << 15)) != 0 && (instr >> 20) & 1 != 0 {
        get_next_ldm(ctx, instr)
    } else {
        pc.wrapping_add(4)
    };

    if target >= 0xffff_0000 {
        ctx.reg(REG_LR)
    } else {
        target
    }
}

/// Hardware breakpoint/watchpoint register bank (spec §4.J). The probe
/// mirrors `get_bp_info`: a PTRACE_GETHBPREGS failure degrades to zero
/// capability rather than reporting an error, since plenty of ARM kernels
/// never implement it.
#[derive(Copy, Clone, Debug, Default)]
pub struct HwBpCapabilities {
    pub num_breakpoints: u32,
    pub num_watchpoints: u32,
}

const PTRACE_GETHBPREGS: i32 = 29;
const PTRACE_SETHBPREGS: i32 = 30;

pub fn probe_hwbp_capabilities(pid: i32) -> HwBpCapabilities {
    let mut info: [i32; 2] = [0, 0];
    let ret = unsafe {
        libc::ptrace(
            PTRACE_GETHBPREGS,
            pid,
            0 as *mut libc::c_void,
            info.as_mut_ptr() as *mut libc::c_void,
        )
    };
    if ret < 0 {
        return HwBpCapabilities::default();
    }
    HwBpCapabilities {
        num_breakpoints: (info[0] & 0xFF) as u32,
        num_watchpoints: ((info[0] >> 8) & 0xFF) as u32,
    }
}

#[derive(Copy, Clone, Debug)]
pub struct HwBpSlot {
    pub addr: u32,
    pub ctrl: u32,
    pub generation: u64,
}

/// Access-type bits (LSC field) for a watchpoint control register; zero
/// means "instruction breakpoint, no access-type restriction".
pub const HWBP_ACCESS_LOAD: u32 = 0b01;
pub const HWBP_ACCESS_STORE: u32 = 0b10;

/// Bit enabling "unlinked instruction address mismatch" mode in a
/// DBGBCR-style control register: the breakpoint fires on any fetch
/// address other than the one programmed, used to fake a single-step when
/// the current instruction stream can't be software-decoded (Thumb state,
/// spec §4.J `hw_stepping` mode 1).
const MISMATCH_ENABLE: u32 = 1 << 22;

/// Builds a DBGBCR/DBGWCR-style control register: a byte-enable mask
/// (BAS) derived from `(addr, length)`, the access-type bits for
/// watchpoints (`access` is 0 for an instruction breakpoint), a
/// both-privileged-and-user-mode PMC, and the enable bit (spec §4.J "build
/// a value register ... and a control register (byte-enable mask from
/// (addr, length), access-type bits, enable bit)").
pub fn build_control_register(addr: u32, length: u32, access: u32) -> u32 {
    let offset = addr & 0x3;
    let len = length.clamp(1, 4);
    let mut bas: u32 = 0;
    for i in offset..(offset + len).min(4) {
        bas |= 1 << i;
    }
    if bas == 0 {
        bas = 0b1111;
    }
    let lsc = if access == 0 { 0b11 } else { access & 0b11 };
    let pmc = 0b11;
    (bas << 5) | (lsc << 3) | (pmc << 1) | 1
}

/// Per-thread hardware breakpoint bank state. Slot 0 is reserved for the
/// hardware-single-step emulation the ARM layer falls back to when the
/// software predictor can't resolve a target (e.g. Thumb-state PC, which
/// the ARM-only decoder can't read), matching the original's slot-0
/// reservation ordering in `set_debug_regs`.
#[derive(Clone, Debug, Default)]
pub struct HwBpThreadState {
    pub slots: Vec<Option<HwBpSlot>>,
    /// 0 = not stepping, 1 = address-mismatch mode (armed away from the
    /// current PC), 2 = address-match mode (armed on a predicted target).
    pub hw_stepping: u8,
    pub skip_wp_addr: Option<u32>,
}

impl HwBpThreadState {
    pub fn new(num_slots: u32) -> HwBpThreadState {
        HwBpThreadState {
            slots: vec![None; num_slots as usize],
            hw_stepping: 0,
            skip_wp_addr: None,
        }
    }

    /// First free slot past slot 0, which stays reserved for hw-stepping.
    pub fn allocate_slot(&mut self, addr: u32, ctrl: u32, generation: u64) -> Option<usize> {
        for (i, s) in self.slots.iter_mut().enumerate().skip(1) {
            if s.is_none() {
                *s = Some(HwBpSlot {
                    addr,
                    ctrl,
                    generation,
                });
                return Some(i);
            }
        }
        None
    }

    pub fn release_slot(&mut self, index: usize) {
        if let Some(s) = self.slots.get_mut(index) {
            *s = None;
        }
    }

    /// Arms slot 0 in mismatch mode: fires on any fetch address other than
    /// `current_pc`, which the OS delivers as a trap the moment execution
    /// leaves the current instruction (spec §4.J `hw_stepping` mode 1).
    pub fn arm_stepping_mismatch(&mut self, current_pc: u32, generation: u64) {
        let ctrl = build_control_register(current_pc, 4, 0) | MISMATCH_ENABLE;
        self.slots[0] = Some(HwBpSlot {
            addr: current_pc,
            ctrl,
            generation,
        });
        self.hw_stepping = 1;
    }

    /// Disarms slot 0, clearing whichever stepping mode was active.
    pub fn disarm_stepping(&mut self) {
        self.slots[0] = None;
        self.hw_stepping = 0;
    }

    /// Resets watchpoint skip bookkeeping keyed on PC, mirroring
    /// `cpu_bp_on_resume`'s handling of `skip_wp_addr`/`skip_wp_set`: once
    /// execution has moved off the address a watchpoint hit was skipped at,
    /// the bookkeeping no longer applies.
    pub fn on_resume(&mut self, pc: u32) {
        if self.skip_wp_addr == Some(pc) {
            self.skip_wp_addr = None;
        }
    }

    pub fn encode_for_ptrace(&self, num_slots: u32) -> Vec<i32> {
        let mut buf = vec![0i32; (num_slots as usize) * 2];
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(s) = slot {
                buf[i * 2] = s.addr as i32;
                buf[i * 2 + 1] = s.ctrl as i32;
            } else {
                buf[i * 2] = 0;
                buf[i * 2 + 1] = 1; // non-zero control register required for unused slots
            }
        }
        buf
    }
}

pub fn set_debug_regs(pid: i32, state: &HwBpThreadState, num_slots: u32) -> Result<(), nix::Error> {
    let mut buf = state.encode_for_ptrace(num_slots);
    let ret = unsafe {
        libc::ptrace(
            PTRACE_SETHBPREGS,
            pid,
            0 as *mut libc::c_void,
            buf.as_mut_ptr() as *mut libc::c_void,
        )
    };
    if ret < 0 {
        return Err(nix::Error::last());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeCtx {
        regs: [u32; 17],
        mem: std::collections::HashMap<u32, u32>,
    }

    impl PredictorContext for FakeCtx {
        fn reg(&self, n: u32) -> u32 {
            self.regs[n as usize]
        }
        fn read_word(&self, addr: u32) -> u32 {
            *self.mem.get(&addr).unwrap_or(&0)
        }
    }

    #[test]
    fn mov_pc_lr_predicts_lr() {
        let mut regs = [0u32; 17];
        regs[REG_LR as usize] = 0x8010;
        regs[REG_CPSR as usize] = 0xE000_0000; // N=Z=C all irrelevant for AL
        let ctx = FakeCtx {
            regs,
            mem: Default::default(),
        };
        // MOV PC, LR : cond=AL(1110) op=MOV(1101) S=0 Rn=0000 Rd=1111 Rm=LR(14)
        let instr = 0b1110_00_0_1101_0_0000_1111_00000000_1110u32;
        let next = predict_next_pc(&ctx, 0x8000, instr);
        assert_eq!(next, 0x8010);
    }

    #[test]
    fn branch_always_taken_computes_target() {
        let regs = [0u32; 17];
        let ctx = FakeCtx {
            regs,
            mem: Default::default(),
        };
        // B #0x10 at pc=0x1000: cond=AL, 101, L=0, offset=0x10>>2=4
        let instr = 0b1110_101_0_000000000000000000000100u32;
        let next = predict_next_pc(&ctx, 0x1000, instr);
        assert_eq!(next, 0x1000 + 8 + 0x10);
    }

    #[test]
    fn ldm_with_pc_loads_from_predicted_stack_slot() {
        let mut regs = [0u32; 17];
        regs[13] = 0x2000; // sp
        let mut mem = std::collections::HashMap::new();
        mem.insert(0x2000, 0xBEEF);
        let ctx = FakeCtx { regs, mem };
        // LDMIA sp!, {pc} : cond=AL, 100, P=0,U=1,S=0,W=1,L=1, Rn=13, list={15}
        let instr = 0b1110_100_0_1_0_1_1_1101_1000000000000000u32;
        let next = predict_next_pc(&ctx, 0x1000, instr);
        assert_eq!(next, 0xBEEF);
    }

    #[test]
    fn condition_never_falls_through() {
        let mut regs = [0u32; 17];
        regs[REG_CPSR as usize] = 0;
        let ctx = FakeCtx {
            regs,
            mem: Default::default(),
        };
        let instr = 0b1111_101_0_000000000000000000000100u32; // cond=NV branch
        let next = predict_next_pc(&ctx, 0x1000, instr);
        assert_eq!(next, 0x1004);
    }

    #[test]
    fn hwbp_slot_allocation_skips_reserved_slot_zero() {
        let mut state = HwBpThreadState::new(4);
        let idx = state.allocate_slot(0x4000, 0x1, 1).unwrap();
        assert_ne!(idx, 0);
    }

    #[test]
    fn control_register_enables_all_bytes_for_aligned_word_length() {
        let ctrl = build_control_register(0x4000, 4, 0);
        assert_eq!(ctrl & 1, 1, "enable bit must be set");
        assert_eq!((ctrl >> 5) & 0xF, 0b1111, "word-length BAS covers all 4 bytes");
    }

    #[test]
    fn control_register_masks_byte_enable_by_offset_and_length() {
        let ctrl = build_control_register(0x4002, 2, HWBP_ACCESS_STORE);
        assert_eq!((ctrl >> 5) & 0xF, 0b1100, "BAS covers only bytes 2-3");
        assert_eq!((ctrl >> 3) & 0b11, HWBP_ACCESS_STORE);
    }

    #[test]
    fn arm_stepping_mismatch_arms_slot_zero_and_clears_on_disarm() {
        let mut state = HwBpThreadState::new(4);
        state.arm_stepping_mismatch(0x8000, 1);
        assert_eq!(state.hw_stepping, 1);
        let slot0 = state.slots[0].expect("slot 0 armed");
        assert_eq!(slot0.addr, 0x8000);
        assert_ne!(slot0.ctrl & MISMATCH_ENABLE, 0);
        state.disarm_stepping();
        assert_eq!(state.hw_stepping, 0);
        assert!(state.slots[0].is_none());
    }
}
