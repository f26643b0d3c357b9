//! Target I/O primitives (spec §4.B): raw OS-level memory/register access
//! plus the memory read/write transparency post/pre-processing that keeps
//! planted breakpoints invisible to clients.
//!
//! Raw memory access goes through `/proc/<pid>/mem` rather than
//! `PTRACE_PEEKDATA`/`POKEDATA` word-at-a-time transfers; register and
//! control operations go through raw `ptrace` requests.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::break_table::BreakInstructionTable;
use crate::error::{AgentError, AgentResult};
use crate::registers::RegisterDefinition;

fn mem_path(pid: i32) -> String {
    format!("/proc/{}/mem", pid)
}

pub fn read_raw_mem(pid: i32, addr: u64, len: usize) -> AgentResult<Vec<u8>> {
    let mut file = OpenOptions::new()
        .read(true)
        .open(mem_path(pid))
        .map_err(|_| AgentError::os_failure("open /proc/pid/mem", nix::Error::last()))?;
    let mut buf = vec![0u8; len];
    file.seek(SeekFrom::Start(addr))
        .map_err(|_| AgentError::MemoryFault {
            address: addr,
            reason: "seek failed".into(),
        })?;
    file.read_exact(&mut buf)
        .map_err(|_| AgentError::MemoryFault {
            address: addr,
            reason: "short read".into(),
        })?;
    Ok(buf)
}

pub fn write_raw_mem(pid: i32, addr: u64, buf: &[u8]) -> AgentResult<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(mem_path(pid))
        .map_err(|_| AgentError::os_failure("open /proc/pid/mem", nix::Error::last()))?;
    file.write_at(buf, addr).map_err(|_| AgentError::MemoryFault {
        address: addr,
        reason: "short write".into(),
    })?;
    Ok(())
}

/// Client-visible read: overlays saved original bytes over any planted
/// break instruction intersecting `[addr, addr+len)` (spec §4.B "memory
/// read transparency invariant").
pub fn read_mem(
    table: &BreakInstructionTable,
    mem_owner: &str,
    pid: i32,
    addr: u64,
    len: usize,
) -> AgentResult<Vec<u8>> {
    let mut buf = read_raw_mem(pid, addr, len)?;
    for bi in table.entries_for_owner(mem_owner) {
        if !bi.planted {
            continue;
        }
        overlay(&mut buf, addr, bi.addr, &bi.saved_code);
    }
    Ok(buf)
}

/// Client-visible write: any intersecting planted break instruction has
/// its `saved_code` updated with the incoming bytes, and the real
/// break-instruction bytes are spliced back into what's actually written
/// (spec §4.B, second half of the invariant).
pub fn write_mem(
    table: &mut BreakInstructionTable,
    mem_owner: &str,
    pid: i32,
    addr: u64,
    buf: &[u8],
) -> AgentResult<()> {
    let mut out = buf.to_vec();
    let intersecting: Vec<(u64, crate::arch::SupportedArch)> = table
        .entries_for_owner(mem_owner)
        .iter()
        .filter(|bi| bi.planted)
        .map(|bi| (bi.addr, bi.arch))
        .collect();
    for (bi_addr, arch) in intersecting {
        overlay_into_saved(table, mem_owner, bi_addr, addr, buf);
        splice(&mut out, addr, bi_addr, arch.break_inst());
    }
    write_raw_mem(pid, addr, &out)
}

fn overlay(buf: &mut [u8], buf_addr: u64, bi_addr: u64, saved: &[u8]) {
    let buf_len = buf.len() as u64;
    let bi_len = saved.len() as u64;
    if bi_addr + bi_len <= buf_addr || bi_addr >= buf_addr + buf_len {
        return;
    }
    for i in 0..saved.len() as u64 {
        let abs = bi_addr + i;
        if abs >= buf_addr && abs < buf_addr + buf_len {
            buf[(abs - buf_addr) as usize] = saved[i as usize];
        }
    }
}

fn splice(buf: &mut [u8], buf_addr: u64, bi_addr: u64, break_bytes: &[u8]) {
    overlay(buf, buf_addr, bi_addr, break_bytes);
}

fn overlay_into_saved(
    table: &mut BreakInstructionTable,
    mem_owner: &str,
    bi_addr: u64,
    write_addr: u64,
    write_buf: &[u8],
) {
    table.update_saved_code(mem_owner, bi_addr, write_addr, write_buf);
}

pub fn single_step(pid: i32) -> AgentResult<()> {
    ptrace::step(Pid::from_raw(pid), None)
        .map_err(|e| AgentError::os_failure("PTRACE_SINGLESTEP", e))
}

pub fn continue_with_signal(pid: i32, sig: i32) -> AgentResult<()> {
    let signal = if sig == 0 {
        None
    } else {
        Signal::from_c_int(sig).ok()
    };
    ptrace::cont(Pid::from_raw(pid), signal).map_err(|e| AgentError::os_failure("PTRACE_CONT", e))
}

pub fn stop(pid: i32) -> AgentResult<()> {
    match nix::sys::signal::kill(Pid::from_raw(pid), Signal::SIGSTOP) {
        Ok(()) => Ok(()),
        Err(e) if e == nix::Error::Sys(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(AgentError::os_failure("stop", e)),
    }
}

const PTRACE_GETREGS: i32 = 12;
const PTRACE_SETREGS: i32 = 13;

/// Fetches a fresh register snapshot for a stopped thread via
/// `PTRACE_GETREGS` (spec §4.B `read_reg`, the live-fetch half; cached
/// reads/writes against the resulting blob go through [`read_reg`] /
/// [`write_reg`] below).
pub fn read_registers(pid: i32, arch: crate::arch::SupportedArch) -> AgentResult<Vec<u8>> {
    let mut buf = vec![0u8; arch.register_file().blob_size()];
    let ret = unsafe {
        libc::ptrace(
            PTRACE_GETREGS,
            pid,
            0 as *mut libc::c_void,
            buf.as_mut_ptr() as *mut libc::c_void,
        )
    };
    if ret < 0 {
        return Err(AgentError::os_failure("PTRACE_GETREGS", nix::Error::last()));
    }
    Ok(buf)
}

/// Writes back a register snapshot previously mutated by [`write_reg`]
/// (spec §5 "Flush `regs_dirty` via `write_registers`", unconditionally
/// required immediately before any resume).
pub fn write_registers(pid: i32, blob: &[u8]) -> AgentResult<()> {
    let mut buf = blob.to_vec();
    let ret = unsafe {
        libc::ptrace(
            PTRACE_SETREGS,
            pid,
            0 as *mut libc::c_void,
            buf.as_mut_ptr() as *mut libc::c_void,
        )
    };
    if ret < 0 {
        return Err(AgentError::os_failure("PTRACE_SETREGS", nix::Error::last()));
    }
    Ok(())
}

pub fn read_reg(regs_blob: &[u8], def: &RegisterDefinition) -> AgentResult<u64> {
    if def.offset + def.size > regs_blob.len() {
        return Err(AgentError::InvalidContext(format!(
            "register {} out of range of snapshot",
            def.name
        )));
    }
    let bytes = &regs_blob[def.offset..def.offset + def.size];
    let mut val: u64 = 0;
    if def.big_endian {
        for b in bytes {
            val = (val << 8) | (*b as u64);
        }
    } else {
        for (i, b) in bytes.iter().enumerate() {
            val |= (*b as u64) << (8 * i);
        }
    }
    Ok(val)
}

pub fn write_reg(regs_blob: &mut [u8], def: &RegisterDefinition, value: u64) -> AgentResult<()> {
    if !def.writable {
        return Err(AgentError::Unsupported(format!(
            "register {} is not writable",
            def.name
        )));
    }
    if def.offset + def.size > regs_blob.len() {
        return Err(AgentError::InvalidContext(format!(
            "register {} out of range of snapshot",
            def.name
        )));
    }
    let bytes = &mut regs_blob[def.offset..def.offset + def.size];
    if def.big_endian {
        for (i, b) in bytes.iter_mut().rev().enumerate() {
            *b = (value >> (8 * i)) as u8;
        }
    } else {
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (value >> (8 * i)) as u8;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reg_roundtrip_little_endian() {
        let def = RegisterDefinition::leaf("rax", 0, 8, 0);
        let mut blob = vec![0u8; 8];
        write_reg(&mut blob, &def, 0x0102030405060708).unwrap();
        assert_eq!(read_reg(&blob, &def).unwrap(), 0x0102030405060708);
    }

    #[test]
    fn overlay_patches_only_intersecting_bytes() {
        let mut buf = vec![0xAAu8; 8];
        overlay(&mut buf, 100, 102, &[0x11, 0x22]);
        assert_eq!(buf, vec![0xAA, 0xAA, 0x11, 0x22, 0xAA, 0xAA, 0xAA, 0xAA]);
    }

    #[test]
    fn overlay_ignores_non_intersecting_instruction() {
        let mut buf = vec![0xAAu8; 4];
        overlay(&mut buf, 100, 200, &[0x11, 0x22]);
        assert_eq!(buf, vec![0xAA, 0xAA, 0xAA, 0xAA]);
    }
}
