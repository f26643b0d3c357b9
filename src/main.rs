//! `tcf-agentd`: drives the debug-execution engine's dispatch loop over
//! real OS debug events. Process launch/attach negotiation, RPC framing,
//! channel multiplexing, the JSON wire codec, and symbol/line-number
//! resolution are external collaborators (spec §1) this binary does not
//! implement; it owns only the single-threaded event loop described in
//! spec §5, translating `waitpid` results into [`wait_pid::dispatch`]
//! calls against one [`Agent`].

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use structopt::StructOpt;

use tcf_debug_core::agent::Agent;
use tcf_debug_core::config::{self, AgentConfig, AgentOptions};
use tcf_debug_core::log;
use tcf_debug_core::log::LogLevel;
use tcf_debug_core::wait_pid::{self, AttachCallback, NoopAttachCallback, PendingAttach, WaitPidEvent};

fn main() {
    let opts = AgentOptions::from_args();
    log::init(&opts.verbosity);
    config::init(AgentConfig::from_options(&opts));

    log!(
        LogLevel::LogInfo,
        "tcf-agentd starting: discovery={} channel={}",
        config::get().discovery_addr,
        config::get().channel_url
    );

    let mut agent = Agent::new();
    let mut pending = PendingAttach::new();
    let mut attach_cb = NoopAttachCallback;

    run_event_loop(&mut agent, &mut pending, &mut attach_cb);
}

/// Spec §5's single-threaded cooperative loop, restricted to the
/// OS-debug-event half: "one event to completion before the next". A
/// full agent also multiplexes client RPCs into the same loop via the
/// out-of-scope channel layer; that half is not reproduced here.
fn run_event_loop(agent: &mut Agent, pending: &mut PendingAttach, attach_cb: &mut dyn AttachCallback) {
    loop {
        let status = match waitpid(None, Some(WaitPidFlag::empty())) {
            Ok(s) => s,
            Err(nix::Error::Sys(nix::errno::Errno::ECHILD)) => {
                log!(LogLevel::LogInfo, "no more tracees, exiting");
                break;
            }
            Err(e) => {
                log!(LogLevel::LogError, "waitpid failed: {}", e);
                break;
            }
        };

        let ev = match status {
            WaitStatus::Exited(pid, code) => Some(WaitPidEvent {
                pid: pid.as_raw(),
                exited: true,
                exit_code: code,
                signal: 0,
                event_code: 0,
                is_syscall: false,
            }),
            WaitStatus::Signaled(pid, sig, _) => Some(WaitPidEvent {
                pid: pid.as_raw(),
                exited: true,
                exit_code: 0,
                signal: sig as i32,
                event_code: 0,
                is_syscall: false,
            }),
            WaitStatus::Stopped(pid, sig) => Some(WaitPidEvent {
                pid: pid.as_raw(),
                exited: false,
                exit_code: 0,
                signal: sig as i32,
                event_code: 0,
                is_syscall: false,
            }),
            WaitStatus::PtraceEvent(pid, sig, code) => Some(WaitPidEvent {
                pid: pid.as_raw(),
                exited: false,
                exit_code: 0,
                signal: sig as i32,
                event_code: code,
                is_syscall: false,
            }),
            WaitStatus::PtraceSyscall(pid) => Some(WaitPidEvent {
                pid: pid.as_raw(),
                exited: false,
                exit_code: 0,
                signal: libc::SIGTRAP,
                event_code: 0,
                is_syscall: true,
            }),
            WaitStatus::Continued(_) | WaitStatus::StillAlive => None,
        };

        let ev = match ev {
            Some(ev) => ev,
            None => continue,
        };
        let pid = ev.pid;
        if let Err(e) = wait_pid::dispatch(agent, pending, attach_cb, ev) {
            log!(LogLevel::LogWarn, "dispatch error for pid {}: {}", pid, e);
            continue;
        }

        // No client is attached to raise an intercept (the channel layer
        // is out of scope), so auto-resume any thread that stopped
        // without one pending.
        if let Some(ctx) = agent.contexts.by_pid(pid) {
            let (pending_intercept, ctx_id) = {
                let ctx = ctx.borrow();
                (ctx.pending_intercept, ctx.id.clone())
            };
            if !pending_intercept {
                if let Err(e) = agent.resume(&ctx_id) {
                    log!(LogLevel::LogWarn, "auto-resume failed for {}: {}", ctx_id, e);
                }
            }
        }
    }
}
