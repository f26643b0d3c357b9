//! Replant engine (spec §4.G): batched reconciliation of the
//! break-instruction table (§4.E) against the current breakpoint set
//! (§4.F), deferred to run at a quiescent point via the safe-event queue
//! (§4.G/§5) rather than synchronously inside a command handler.

use crate::agent::Agent;
use crate::error::AgentError;
use crate::log::LogLevel;
use crate::log;

/// Requests a replant pass. Coalesces with any already-pending request:
/// at most one replant safe event is ever in flight (spec §4.G "at most
/// one replant is outstanding").
pub fn event_replant_breakpoints(agent: &mut Agent) {
    if agent.safe_events.replant_in_flight() {
        return;
    }
    agent.safe_events.mark_replant_in_flight();
    agent.safe_events.post(Box::new(|agent: &mut Agent| {
        agent.safe_events.clear_replant_in_flight();
        run(agent);
    }));
}

fn run(agent: &mut Agent) {
    // Step 1: clear refs, then re-register them for every non-deleted,
    // enabled, supported breakpoint, per breakpoint-group context.
    agent.break_table.clear_refs();

    let ids = agent.breakpoints.all_ids();
    for id in ids {
        let (location, condition, enabled, supported, deleted) = {
            let bp = match agent.breakpoints.get(&id) {
                Some(b) => b,
                None => continue,
            };
            (
                bp.location.clone(),
                bp.condition.clone(),
                bp.enabled,
                bp.is_supported(),
                bp.deleted,
            )
        };
        if deleted || !enabled || !supported || location.is_none() {
            continue;
        }
        let _ = condition; // statically-false short-circuit is an evaluator concern, not modeled here

        register_refs_for_breakpoint(agent, &id);
    }

    // Step 2: delete flagged breakpoints, remove refless entries
    // (unplanting first), (re)plant everything else.
    agent.breakpoints.reap_deleted();
    agent.break_table.compact(&agent.contexts);

    // Step 3: emit a status event for every breakpoint whose status
    // tuple changed (spec §4.F "status" event, §4.G step 3).
    let ids = agent.breakpoints.all_ids();
    for id in ids {
        let total_planted: u32 = agent
            .break_table
            .all_addrs()
            .iter()
            .filter_map(|addr| agent.break_table.get(*addr))
            .filter(|bi| bi.refs.iter().any(|r| r == &id) && bi.planted)
            .count() as u32;
        let extra_error = breakpoint_error(agent, &id);

        let changed = {
            let bp = match agent.breakpoints.get_mut(&id) {
                Some(b) => b,
                None => continue,
            };
            bp.planted = total_planted;
            if bp.error.is_none() {
                bp.error = extra_error;
            }
            bp.refresh_status()
        };
        if changed {
            agent.event_sink.context_changed(&id);
            log!(LogLevel::LogEvents, "breakpoint {} status changed", id);
        }
    }
}

/// Resolves `bp`'s location in every live root (process) context and
/// registers a ref in the break-instruction table for every live, stopped
/// sibling of that process (spec §4.G step 1). An "invalid context" error
/// is retried per-context (it signals a context-sensitive expression);
/// any other expression error is surfaced as the breakpoint's `error`.
fn register_refs_for_breakpoint(agent: &mut Agent, bp_id: &str) {
    let roots: Vec<String> = agent.contexts.roots().to_vec();
    let mut last_error: Option<String> = None;
    let mut any_ok = false;

    for root in &roots {
        let bp_snapshot = match agent.breakpoints.get(bp_id) {
            Some(bp) => bp.clone_for_resolve(),
            None => return,
        };
        let addrs = match agent.resolver.resolve(root, &bp_snapshot) {
            Ok(addrs) => addrs,
            Err(AgentError::InvalidContext(_)) => continue,
            Err(e) => {
                last_error = Some(e.to_string());
                continue;
            }
        };
        if addrs.is_empty() {
            continue;
        }
        any_ok = true;
        let arch = match agent.contexts.get(root) {
            Some(c) => c.borrow().arch,
            None => continue,
        };
        for sibling in agent.contexts.live_stopped_siblings(root) {
            let mem_owner = agent
                .contexts
                .get(&sibling)
                .map(|c| c.borrow().mem_owner_id())
                .unwrap_or_else(|| sibling.clone());
            for addr in &addrs {
                agent
                    .break_table
                    .add_ref(&agent.contexts, bp_id, &mem_owner, *addr, arch);
            }
        }
    }

    if let Some(bp) = agent.breakpoints.get_mut(bp_id) {
        if !any_ok {
            bp.error = last_error;
        }
    }
}

fn breakpoint_error(agent: &Agent, bp_id: &str) -> Option<String> {
    agent
        .break_table
        .all_addrs()
        .into_iter()
        .filter_map(|addr| agent.break_table.get(addr))
        .find(|bi| bi.refs.iter().any(|r| r == bp_id) && bi.error.is_some())
        .and_then(|bi| bi.error.clone())
}

impl crate::breakpoint::Breakpoint {
    /// A read-only snapshot cheap enough to pass to the address resolver
    /// without holding the registry borrow across the resolve call.
    fn clone_for_resolve(&self) -> crate::breakpoint::Breakpoint {
        crate::breakpoint::Breakpoint {
            id: self.id.clone(),
            location: self.location.clone(),
            condition: self.condition.clone(),
            ignore_count: self.ignore_count,
            hit_count: self.hit_count,
            enabled: self.enabled,
            planted: self.planted,
            error: self.error.clone(),
            unsupported: self.unsupported.clone(),
            status: self.status.clone(),
            refs: self.refs.clone(),
            deleted: self.deleted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::SupportedArch;
    use crate::breakpoint::Property;

    #[test]
    fn replant_plants_a_literal_address_breakpoint_on_a_stopped_process() {
        let mut agent = Agent::new();
        agent.contexts.create_process("P1".into(), std::process::id() as i32, SupportedArch::X64);
        agent.contexts.get("P1").unwrap().borrow_mut().stopped = true;
        agent
            .breakpoints
            .add_or_change("c1", "A.1", vec![Property::Location("0x1000".into())]);

        event_replant_breakpoints(&mut agent);
        crate::safe_event::SafeEventQueue::run_all(&mut agent);

        let bi = agent.break_table.get(0x1000);
        assert!(bi.is_some());
        assert!(bi.unwrap().refs.contains(&"A.1".to_string()));
    }

    #[test]
    fn replant_requests_coalesce_into_one_in_flight_latch() {
        let mut agent = Agent::new();
        event_replant_breakpoints(&mut agent);
        assert!(agent.safe_events.replant_in_flight());
        event_replant_breakpoints(&mut agent);
        // still just one queued safe event worth of work; running it once
        // clears the latch.
        crate::safe_event::SafeEventQueue::run_all(&mut agent);
        assert!(!agent.safe_events.replant_in_flight());
    }

    #[test]
    fn deleted_breakpoint_is_reaped_after_replant() {
        let mut agent = Agent::new();
        agent.breakpoints.add_or_change("c1", "A.1", vec![]);
        agent.breakpoints.remove("c1", &["A.1".to_string()]);
        event_replant_breakpoints(&mut agent);
        crate::safe_event::SafeEventQueue::run_all(&mut agent);
        assert!(agent.breakpoints.get("A.1").is_none());
    }
}
