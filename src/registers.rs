//! Register file descriptor (spec §4.A): an immutable, ordered vector of
//! per-architecture register definitions, built once at startup, with
//! helpers to resolve the four well-known roles ("PC", "SP", "FP", "LR")
//! plus an internal status-register role ("CPSR"/eflags).
//!
//! Rather than unioning x86/x64 ptrace structs by hand, the engine's
//! register model is a data table: each [`RegisterDefinition`] names a byte
//! range inside the raw OS register snapshot stored on
//! [`crate::context::Context`], so register-by-id read/write (the
//! `Registers` service, spec §6) and the memory/register I/O primitives in
//! [`crate::target_io`] share one representation instead of
//! architecture-specific accessor methods.

use crate::arch::SupportedArch;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RegisterRole {
    Pc,
    Sp,
    Fp,
    Lr,
    /// Status register: EFLAGS on x86, CPSR on ARM.
    Status,
}

/// A node in the register tree. Most registers are [`RegisterKind::Leaf`];
/// grouped views (e.g. the 32-bit/64-bit/128-bit VFP vector aliases on ARM)
/// are [`RegisterKind::Group`] and carry no storage of their own, only
/// children that point back at them via [`RegisterDefinition::parent`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RegisterKind {
    Leaf,
    Group,
}

#[derive(Clone, Debug)]
pub struct RegisterDefinition {
    pub name: &'static str,
    pub kind: RegisterKind,
    /// Byte offset into the raw register snapshot blob. Meaningless for
    /// `Group` nodes.
    pub offset: usize,
    pub size: usize,
    pub dwarf_id: i32,
    pub eh_frame_id: i32,
    pub big_endian: bool,
    pub role: Option<RegisterRole>,
    /// Name of the parent group node, if any (e.g. VFP leaves parented
    /// under a synthetic "s0-s31"/"d0-d15"/"q0-q15" group).
    pub parent: Option<&'static str>,
    pub readable: bool,
    pub writable: bool,
}

impl RegisterDefinition {
    pub const fn leaf(
        name: &'static str,
        offset: usize,
        size: usize,
        dwarf_id: i32,
    ) -> RegisterDefinition {
        RegisterDefinition {
            name,
            kind: RegisterKind::Leaf,
            offset,
            size,
            dwarf_id,
            eh_frame_id: dwarf_id,
            big_endian: false,
            role: None,
            parent: None,
            readable: true,
            writable: true,
        }
    }

    pub const fn group(name: &'static str) -> RegisterDefinition {
        RegisterDefinition {
            name,
            kind: RegisterKind::Group,
            offset: 0,
            size: 0,
            dwarf_id: -1,
            eh_frame_id: -1,
            big_endian: false,
            role: None,
            parent: None,
            readable: false,
            writable: false,
        }
    }

    pub const fn with_role(mut self, role: RegisterRole) -> RegisterDefinition {
        self.role = Some(role);
        self
    }

    pub const fn with_parent(mut self, parent: &'static str) -> RegisterDefinition {
        self.parent = Some(parent);
        self
    }

    pub const fn read_only(mut self) -> RegisterDefinition {
        self.writable = false;
        self
    }
}

/// The immutable, ordered register table for one architecture, plus any
/// CPU-feature-dependent extension registers (VFP) appended once at
/// startup based on a one-time probe (spec §4.A).
pub struct RegisterFile {
    defs: Vec<RegisterDefinition>,
    host_big_endian: bool,
}

impl RegisterFile {
    pub fn new(mut defs: Vec<RegisterDefinition>) -> RegisterFile {
        let host_big_endian = cfg!(target_endian = "big");
        for d in &mut defs {
            d.big_endian = host_big_endian;
        }
        RegisterFile {
            defs,
            host_big_endian,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisterDefinition> {
        self.defs.iter()
    }

    pub fn by_name(&self, name: &str) -> Option<&RegisterDefinition> {
        self.defs.iter().find(|d| d.name == name)
    }

    pub fn by_role(&self, role: RegisterRole) -> Option<&RegisterDefinition> {
        self.defs.iter().find(|d| d.role == Some(role))
    }

    pub fn is_big_endian(&self) -> bool {
        self.host_big_endian
    }

    /// Size in bytes of the raw OS register snapshot blob this table
    /// indexes into: the high-water mark of `offset + size` across every
    /// leaf definition. Used to size the buffer passed to
    /// `PTRACE_GETREGS`/`PTRACE_SETREGS` (spec §4.B).
    pub fn blob_size(&self) -> usize {
        self.defs
            .iter()
            .filter(|d| d.kind == RegisterKind::Leaf)
            .map(|d| d.offset + d.size)
            .max()
            .unwrap_or(0)
    }
}

pub fn register_file_for(arch: SupportedArch) -> &'static RegisterFile {
    match arch {
        SupportedArch::Arm => crate::arch::arm::register_file(),
        SupportedArch::X86 => crate::arch::x86::register_file(false),
        SupportedArch::X64 => crate::arch::x86::register_file(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arm_register_file_resolves_roles() {
        let rf = register_file_for(SupportedArch::Arm);
        assert!(rf.by_role(RegisterRole::Pc).is_some());
        assert!(rf.by_role(RegisterRole::Sp).is_some());
        assert!(rf.by_role(RegisterRole::Lr).is_some());
    }

    #[test]
    fn x64_register_file_resolves_roles() {
        let rf = register_file_for(SupportedArch::X64);
        assert!(rf.by_role(RegisterRole::Pc).is_some());
        assert!(rf.by_role(RegisterRole::Sp).is_some());
    }
}
