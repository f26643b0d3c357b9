//! x86 / x86-64 machine-dependent definitions. Software breakpoints only:
//! `int3` (0xCC), and the OS single-step request is always trustworthy here
//! (spec §4.I names ARM as the architecture that needs a software
//! predictor; x86 never does).
//!
//! Register offsets mirror the field order of the kernel's
//! `struct user_regs_struct` for each word size.

use crate::registers::{RegisterDefinition as R, RegisterFile, RegisterRole};
use lazy_static::lazy_static;

pub const BREAK_INST: [u8; 1] = [0xCC];

fn x86_32_defs() -> Vec<R> {
    vec![
        R::leaf("ebx", 0, 4, 3),
        R::leaf("ecx", 4, 4, 1),
        R::leaf("edx", 8, 4, 2),
        R::leaf("esi", 12, 4, 6),
        R::leaf("edi", 16, 4, 7),
        R::leaf("ebp", 20, 4, 5).with_role(RegisterRole::Fp),
        R::leaf("eax", 24, 4, 0),
        R::leaf("xds", 28, 4, 103),
        R::leaf("xes", 32, 4, 104),
        R::leaf("xfs", 36, 4, 105),
        R::leaf("xgs", 40, 4, 106),
        R::leaf("orig_eax", 44, 4, -1),
        R::leaf("eip", 48, 4, 8).with_role(RegisterRole::Pc),
        R::leaf("xcs", 52, 4, 101),
        R::leaf("eflags", 56, 4, 9).with_role(RegisterRole::Status),
        R::leaf("esp", 60, 4, 4).with_role(RegisterRole::Sp),
        R::leaf("xss", 64, 4, 102),
    ]
}

fn x86_64_defs() -> Vec<R> {
    vec![
        R::leaf("r15", 0, 8, 15),
        R::leaf("r14", 8, 8, 14),
        R::leaf("r13", 16, 8, 13),
        R::leaf("r12", 24, 8, 12),
        R::leaf("rbp", 32, 8, 6).with_role(RegisterRole::Fp),
        R::leaf("rbx", 40, 8, 3),
        R::leaf("r11", 48, 8, 11),
        R::leaf("r10", 56, 8, 10),
        R::leaf("r9", 64, 8, 9),
        R::leaf("r8", 72, 8, 8),
        R::leaf("rax", 80, 8, 0),
        R::leaf("rcx", 88, 8, 2),
        R::leaf("rdx", 96, 8, 1),
        R::leaf("rsi", 104, 8, 4),
        R::leaf("rdi", 112, 8, 5),
        R::leaf("orig_rax", 120, 8, -1),
        R::leaf("rip", 128, 8, 16).with_role(RegisterRole::Pc),
        R::leaf("cs", 136, 8, 51),
        R::leaf("eflags", 144, 8, 49).with_role(RegisterRole::Status),
        R::leaf("rsp", 152, 8, 7).with_role(RegisterRole::Sp),
        R::leaf("ss", 160, 8, 52),
        R::leaf("fs_base", 168, 8, 58),
        R::leaf("gs_base", 176, 8, 59),
        R::leaf("ds", 184, 8, 53),
        R::leaf("es", 192, 8, 50),
        R::leaf("fs", 200, 8, 54),
        R::leaf("gs", 208, 8, 55),
    ]
}

lazy_static! {
    static ref X86_32: RegisterFile = RegisterFile::new(x86_32_defs());
    static ref X86_64: RegisterFile = RegisterFile::new(x86_64_defs());
}

pub fn register_file(is_64: bool) -> &'static RegisterFile {
    if is_64 {
        &X86_64
    } else {
        &X86_32
    }
}
