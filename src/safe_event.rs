//! Deferred-callback primitive (spec §4.G/§4.H, "safe event"): a callback
//! queued to run only once the dispatch loop reaches a point where no
//! context is mid-RPC. The "is anything mid-RPC" gate is modeled here as a
//! simple pending counter the dispatch loop increments/decrements around
//! each command handler (see [`crate::agent::Agent::run_exclusive`]).

use std::collections::VecDeque;

pub type SafeEventFn = Box<dyn FnOnce(&mut crate::agent::Agent)>;

#[derive(Default)]
pub struct SafeEventQueue {
    pending: VecDeque<SafeEventFn>,
    in_flight_replant: bool,
}

impl SafeEventQueue {
    pub fn new() -> SafeEventQueue {
        SafeEventQueue::default()
    }

    pub fn post(&mut self, f: SafeEventFn) {
        self.pending.push_back(f);
    }

    /// True if a replant safe event is already queued or running; callers
    /// use this to coalesce repeated replant requests into the single
    /// in-flight latch described in spec §4.G/§5.
    pub fn replant_in_flight(&self) -> bool {
        self.in_flight_replant
    }

    pub fn mark_replant_in_flight(&mut self) {
        self.in_flight_replant = true;
    }

    pub fn clear_replant_in_flight(&mut self) {
        self.in_flight_replant = false;
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drains and runs every queued callback. Must only be called at a
    /// dispatch-loop quiescent point (`is_dispatch_thread() && !mid_rpc`).
    pub fn run_all(agent: &mut crate::agent::Agent) {
        loop {
            let next = agent.safe_events.pending.pop_front();
            match next {
                Some(f) => f(agent),
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replant_latch_round_trips() {
        let mut q = SafeEventQueue::new();
        assert!(!q.replant_in_flight());
        q.mark_replant_in_flight();
        assert!(q.replant_in_flight());
        q.clear_replant_in_flight();
        assert!(!q.replant_in_flight());
    }

    #[test]
    fn queue_is_fifo() {
        let mut q = SafeEventQueue::new();
        assert!(q.is_empty());
        q.post(Box::new(|_| {}));
        assert!(!q.is_empty());
    }
}
