//! Top-level `Agent` value: every context, breakpoint, and
//! break-instruction table lives here instead of behind `lazy_static`
//! globals. The dispatch loop owns one `Agent` and passes `&mut Agent`
//! into every command handler and safe-event callback.

use crate::break_table::BreakInstructionTable;
use crate::breakpoint::{AlwaysTrueEvaluator, BreakpointRegistry, ConditionEvaluator};
use crate::context::{ContextEventSink, ContextStore, LoggingEventSink};
use crate::error::AgentResult;
use crate::log::LogLevel;
use crate::safe_event::SafeEventQueue;
use crate::signal_set::SignalSet;
use crate::{log, target_io};

/// Collaborator seam for resolving a breakpoint's location to concrete
/// addresses (spec §1 "out of scope: ... line-numbers ... services";
/// §4.G names this "the line-numbers collaborator").
pub trait AddressResolver {
    fn resolve(&self, ctx_id: &str, bp: &crate::breakpoint::Breakpoint) -> AgentResult<Vec<u64>>;
}

/// Resolver used when no line-number/symbol collaborator is wired in:
/// only plain address-expression locations (decimal or `0x`-prefixed
/// literals) resolve; anything else is `InvalidExpression`.
pub struct LiteralAddressResolver;

impl AddressResolver for LiteralAddressResolver {
    fn resolve(&self, _ctx_id: &str, bp: &crate::breakpoint::Breakpoint) -> AgentResult<Vec<u64>> {
        use crate::breakpoint::Location;
        match &bp.location {
            Some(Location::Address(expr)) => {
                let parsed = if let Some(hex) = expr.strip_prefix("0x") {
                    u64::from_str_radix(hex, 16)
                } else {
                    expr.parse::<u64>()
                };
                parsed.map(|a| vec![a]).map_err(|_| crate::error::AgentError::InvalidExpression {
                    expr: expr.clone(),
                    reason: "not an address literal".into(),
                })
            }
            Some(Location::FileLine { file, .. }) => Err(crate::error::AgentError::SymbolNotFound(file.clone())),
            None => Ok(Vec::new()),
        }
    }
}

pub struct Agent {
    pub contexts: ContextStore,
    pub breakpoints: BreakpointRegistry,
    pub break_table: BreakInstructionTable,
    pub safe_events: SafeEventQueue,
    pub resolver: Box<dyn AddressResolver>,
    pub evaluator: Box<dyn ConditionEvaluator>,
    pub event_sink: Box<dyn ContextEventSink>,
    mid_rpc: u32,
}

impl Default for Agent {
    fn default() -> Agent {
        Agent {
            contexts: ContextStore::new(),
            breakpoints: BreakpointRegistry::new(),
            break_table: BreakInstructionTable::new(),
            safe_events: SafeEventQueue::new(),
            resolver: Box::new(LiteralAddressResolver),
            evaluator: Box::new(AlwaysTrueEvaluator),
            event_sink: Box::new(LoggingEventSink),
            mid_rpc: 0,
        }
    }
}

impl Agent {
    pub fn new() -> Agent {
        Agent::default()
    }

    pub fn is_dispatch_thread(&self) -> bool {
        // Single-threaded cooperative event loop (spec §5): the whole
        // crate only ever runs on the thread that owns the `Agent`, so
        // this is a precondition assertion point rather than a real
        // cross-thread check.
        true
    }

    /// Runs `f` as one RPC-induced mutation, then drains safe events if
    /// this was the outermost call (spec §5 "suspension points" /
    /// §4.G/§4.H "quiescent point").
    pub fn run_exclusive<F, T>(&mut self, f: F) -> T
    where
        F: FnOnce(&mut Agent) -> T,
    {
        self.mid_rpc += 1;
        let result = f(self);
        self.mid_rpc -= 1;
        if self.mid_rpc == 0 {
            SafeEventQueue::run_all(self);
        }
        result
    }

    fn is_quiescent(&self) -> bool {
        self.mid_rpc == 0
    }

    /// Resume path (spec §5 "Shared resources", steps 1-4). `ctx_id` must
    /// be a stopped thread context.
    pub fn resume(&mut self, ctx_id: &str) -> AgentResult<()> {
        self.run_exclusive(|agent| agent.resume_inner(ctx_id))
    }

    fn resume_inner(&mut self, ctx_id: &str) -> AgentResult<()> {
        let ctx_rc = self.contexts.require(ctx_id)?;
        let pid = {
            let mut ctx = ctx_rc.borrow_mut();
            // Step 1: flush regs_dirty, clearing any lingering single-step
            // flag first (spec §9 open question / §5 step 1).
            if ctx.regs_dirty {
                let arch = ctx.arch;
                if let Some(blob) = ctx.regs.as_mut() {
                    arch.clear_single_step_flag(blob);
                }
                let pid = ctx.pid;
                let blob = ctx.regs.clone().unwrap_or_default();
                target_io::write_registers(pid, &blob)?;
                ctx.regs_dirty = false;
            }
            ctx.pid
        };

        // Step 2: flush pending hardware-BP register state.
        crate::hwbp::flush_if_stale(self, ctx_id)?;

        // Step 3: consult the skip-breakpoint sequencer.
        if crate::skip_sequencer::maybe_skip(self, ctx_id)? {
            // The sequencer took over: it owns issuing single_step and
            // will invoke resume again via its safe-event continuation.
            return Ok(());
        }

        // Step 4: issue continue with the chosen pass-through signal.
        let sig = {
            let mut ctx = ctx_rc.borrow_mut();
            let sig = ctx
                .pending_signals
                .first_not_in(&ctx.sig_dont_pass)
                .filter(|s| *s != libc::SIGSTOP && *s != libc::SIGTRAP);
            if let Some(s) = sig {
                ctx.pending_signals.clear(s);
            }
            ctx.stopped = false;
            sig.unwrap_or(0)
        };
        match target_io::continue_with_signal(pid, sig) {
            Ok(()) => Ok(()),
            Err(e) if e.is_no_such_process() => {
                ctx_rc.borrow_mut().exiting = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn request_replant(&mut self) {
        crate::replant::event_replant_breakpoints(self);
    }

    pub fn quiescent_for_test(&self) -> bool {
        self.is_quiescent()
    }
}

pub fn log_os_failure(op: &'static str, ctx_id: &str) {
    log!(LogLevel::LogWarn, "OS failure during {} on {}", op, ctx_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::SupportedArch;

    #[test]
    fn literal_resolver_parses_hex_and_decimal() {
        let resolver = LiteralAddressResolver;
        let mut bp = crate::breakpoint::Breakpoint::new("A.1");
        bp.location = Some(crate::breakpoint::Location::Address("0x1000".into()));
        assert_eq!(resolver.resolve("P1", &bp).unwrap(), vec![0x1000]);
        bp.location = Some(crate::breakpoint::Location::Address("4096".into()));
        assert_eq!(resolver.resolve("P1", &bp).unwrap(), vec![4096]);
    }

    #[test]
    fn run_exclusive_drains_safe_events_only_at_outermost_call() {
        let mut agent = Agent::new();
        assert!(agent.quiescent_for_test());
        let ran = std::rc::Rc::new(std::cell::RefCell::new(false));
        let ran2 = ran.clone();
        agent.run_exclusive(|a| {
            a.safe_events.post(Box::new(move |_| {
                *ran2.borrow_mut() = true;
            }));
            assert!(!a.quiescent_for_test());
        });
        assert!(*ran.borrow());
        assert!(agent.quiescent_for_test());
    }

    #[test]
    fn contexts_arch_default_smoke() {
        let agent = Agent::new();
        assert!(agent.contexts.roots().is_empty());
        let _ = SupportedArch::X64;
    }
}
