//! Breakpoint registry (spec §4.F): user-visible breakpoint objects,
//! indexed by id and by referring channel, plus the condition/ignore-count
//! evaluation run when a thread stops at a planted address.
//!
//! `evaluate_condition`/`is_breakpoint_address` are kept as two separate
//! steps here, following `breakpoints.c`'s split between
//! `is_breakpoint_address()` (a pure address membership test against the
//! break-instruction table) and `evaluate_breakpoint_condition()` (walks
//! the breakpoints referencing that address) rather than merging them into
//! one "should I stop" call — SPEC_FULL §3 carries this over since the
//! distilled spec doesn't call it out explicitly.

use std::collections::{HashMap, HashSet};

use crate::error::{AgentError, AgentResult};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Location {
    Address(String),
    FileLine {
        file: String,
        line: u32,
        column: Option<u32>,
    },
}

#[derive(Clone, Debug, Default)]
pub struct StatusTuple {
    pub unsupported: bool,
    pub error: Option<String>,
    pub planted: u32,
}

impl PartialEq for StatusTuple {
    fn eq(&self, other: &Self) -> bool {
        self.unsupported == other.unsupported && self.error == other.error && self.planted == other.planted
    }
}

pub struct Breakpoint {
    pub id: String,
    pub location: Option<Location>,
    pub condition: Option<String>,
    pub ignore_count: u64,
    pub hit_count: u64,
    pub enabled: bool,
    pub planted: u32,
    pub error: Option<String>,
    pub unsupported: Vec<String>,
    pub status: StatusTuple,
    pub refs: HashSet<String>,
    pub deleted: bool,
}

impl Breakpoint {
    pub fn new(id: impl Into<String>) -> Breakpoint {
        Breakpoint::new_inner(id.into())
    }

    fn new_inner(id: String) -> Breakpoint {
        Breakpoint {
            id,
            location: None,
            condition: None,
            ignore_count: 0,
            hit_count: 0,
            enabled: true,
            planted: 0,
            error: None,
            unsupported: Vec::new(),
            status: StatusTuple::default(),
            refs: HashSet::new(),
            deleted: false,
        }
    }

    pub fn is_supported(&self) -> bool {
        self.unsupported.is_empty()
    }

    /// Computes the current status tuple and reports whether it differs
    /// from the last-broadcast one (spec §4.F / §4.G step 3: "emit a
    /// status event for each breakpoint whose status tuple changed").
    pub fn refresh_status(&mut self) -> bool {
        let current = StatusTuple {
            unsupported: !self.is_supported(),
            error: self.error.clone(),
            planted: self.planted,
        };
        let changed = current != self.status;
        self.status = current;
        changed
    }
}

/// A single property from the closed set accepted via the wire protocol
/// (spec §4.F). Unknown keys are pushed onto `unsupported` by the caller
/// assembling this from JSON at the boundary (out of scope here).
pub enum Property {
    Location(String),
    File(String),
    Line(u32),
    Column(u32),
    Condition(String),
    IgnoreCount(u64),
    Enabled(bool),
    Unsupported(String),
}

#[derive(Default)]
pub struct BreakpointRegistry {
    by_id: HashMap<String, Breakpoint>,
    by_channel: HashMap<String, HashSet<String>>,
}

impl BreakpointRegistry {
    pub fn new() -> BreakpointRegistry {
        BreakpointRegistry::default()
    }

    pub fn get(&self, id: &str) -> Option<&Breakpoint> {
        self.by_id.get(id)
    }

    pub fn ids_for_channel(&self, channel: &str) -> Vec<String> {
        self.by_channel
            .get(channel)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn upsert(&mut self, channel: &str, id: &str, props: Vec<Property>) -> bool {
        let bp = self
            .by_id
            .entry(id.to_string())
            .or_insert_with(|| Breakpoint::new(id.to_string()));
        let mut changed = false;
        let mut file: Option<String> = None;
        let mut line: Option<u32> = None;
        let mut column: Option<u32> = None;
        for p in props {
            match p {
                Property::Location(expr) => {
                    let new = Some(Location::Address(expr));
                    if bp.location != new {
                        bp.location = new;
                        changed = true;
                    }
                }
                Property::File(f) => file = Some(f),
                Property::Line(l) => line = Some(l),
                Property::Column(c) => column = Some(c),
                Property::Condition(c) => {
                    if bp.condition.as_deref() != Some(c.as_str()) {
                        bp.condition = Some(c);
                        changed = true;
                    }
                }
                Property::IgnoreCount(n) => {
                    if bp.ignore_count != n {
                        bp.ignore_count = n;
                        changed = true;
                    }
                }
                Property::Enabled(e) => {
                    if bp.enabled != e {
                        bp.enabled = e;
                        changed = true;
                    }
                }
                Property::Unsupported(key) => {
                    if !bp.unsupported.contains(&key) {
                        bp.unsupported.push(key);
                        changed = true;
                    }
                }
            }
        }
        if let Some(file) = file {
            let new = Some(Location::FileLine {
                file,
                line: line.unwrap_or(0),
                column,
            });
            if bp.location != new {
                bp.location = new;
                changed = true;
            }
        }
        if !bp.unsupported.is_empty() {
            bp.error = Some(format!(
                "Unsupported breakpoint properties: {}",
                bp.unsupported.join(", ")
            ));
        }
        bp.refs.insert(channel.to_string());
        self.by_channel
            .entry(channel.to_string())
            .or_default()
            .insert(id.to_string());
        changed
    }

    /// `add`/`change`: upsert by id (spec §4.F).
    pub fn add_or_change(&mut self, channel: &str, id: &str, props: Vec<Property>) -> bool {
        self.upsert(channel, id, props)
    }

    /// `set`: replaces this channel's ref set wholesale. Ids no longer
    /// present lose this channel's ref; if that empties their ref set they
    /// are marked deleted for the replant engine to reap.
    pub fn set_all(&mut self, channel: &str, breakpoints: Vec<(String, Vec<Property>)>) {
        let new_ids: HashSet<String> = breakpoints.iter().map(|(id, _)| id.clone()).collect();
        let previous = self.by_channel.entry(channel.to_string()).or_default().clone();
        for old_id in previous.difference(&new_ids) {
            self.drop_channel_ref(channel, old_id);
        }
        for (id, props) in breakpoints {
            self.upsert(channel, &id, props);
        }
    }

    fn drop_channel_ref(&mut self, channel: &str, id: &str) {
        if let Some(bp) = self.by_id.get_mut(id) {
            bp.refs.remove(channel);
            if bp.refs.is_empty() {
                bp.deleted = true;
            }
        }
        if let Some(set) = self.by_channel.get_mut(channel) {
            set.remove(id);
        }
    }

    /// `remove`: drops this channel's ref for each listed id.
    pub fn remove(&mut self, channel: &str, ids: &[String]) {
        for id in ids {
            self.drop_channel_ref(channel, id);
        }
    }

    pub fn set_enabled(&mut self, ids: &[String], enabled: bool) {
        for id in ids {
            if let Some(bp) = self.by_id.get_mut(id) {
                bp.enabled = enabled;
            }
        }
    }

    /// Called by a channel-close handler (spec §5 "Cancellation"): cancels
    /// all of that channel's breakpoint refs.
    pub fn drop_channel(&mut self, channel: &str) {
        let ids = self.ids_for_channel(channel);
        self.remove(channel, &ids);
        self.by_channel.remove(channel);
    }

    /// Removes breakpoints marked `deleted` with no remaining refs. Called
    /// by the replant engine after re-registering refs (spec §4.G step 2).
    pub fn reap_deleted(&mut self) -> Vec<String> {
        let dead: Vec<String> = self
            .by_id
            .iter()
            .filter(|(_, bp)| bp.deleted && bp.refs.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &dead {
            self.by_id.remove(id);
        }
        dead
    }

    pub fn all_ids(&self) -> Vec<String> {
        self.by_id.keys().cloned().collect()
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Breakpoint> {
        self.by_id.get_mut(id)
    }
}

pub fn capabilities_reply() -> serde_json::Value {
    serde_json::json!({
        "ID": true,
        "Location": true,
        "File": true,
        "Line": true,
        "Column": true,
        "IgnoreCount": true,
        "Condition": true,
    })
}

/// Collaborator seam for evaluating a breakpoint condition in the stopped
/// thread's top frame (out of scope per spec §1; expression parsing and
/// frame resolution live elsewhere).
pub trait ConditionEvaluator {
    fn evaluate_bool(&self, ctx_id: &str, expr: &str) -> AgentResult<bool>;
}

/// Walks every user breakpoint referencing a planted address and decides
/// whether the stop should be escalated to an intercept (spec §4.F
/// "Condition & ignore-count").
pub fn should_intercept(
    registry: &mut BreakpointRegistry,
    refs: &[String],
    ctx_id: &str,
    evaluator: &dyn ConditionEvaluator,
) -> bool {
    let mut intercept = false;
    for id in refs {
        let bp = match registry.by_id.get_mut(id) {
            Some(b) => b,
            None => continue,
        };
        if bp.deleted || !bp.is_supported() || !bp.enabled {
            continue;
        }
        if let Some(cond) = bp.condition.clone() {
            match evaluator.evaluate_bool(ctx_id, &cond) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    crate::log!(
                        crate::log::LogLevel::LogWarn,
                        "breakpoint {} condition error: {}",
                        id,
                        e
                    );
                }
            }
        }
        if bp.ignore_count > 0 {
            bp.hit_count += 1;
            if bp.hit_count <= bp.ignore_count {
                continue;
            }
            bp.hit_count = 0;
        }
        intercept = true;
    }
    intercept
}

pub struct AlwaysTrueEvaluator;

impl ConditionEvaluator for AlwaysTrueEvaluator {
    fn evaluate_bool(&self, _ctx_id: &str, _expr: &str) -> AgentResult<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EqEvaluator(i64);
    impl ConditionEvaluator for EqEvaluator {
        fn evaluate_bool(&self, _ctx_id: &str, expr: &str) -> AgentResult<bool> {
            if let Some(rest) = expr.strip_prefix("r0 == ") {
                let want: i64 = rest.parse().map_err(|_| AgentError::InvalidExpression {
                    expr: expr.to_string(),
                    reason: "not a number".into(),
                })?;
                Ok(self.0 == want)
            } else {
                Err(AgentError::InvalidExpression {
                    expr: expr.to_string(),
                    reason: "unsupported".into(),
                })
            }
        }
    }

    #[test]
    fn condition_false_suppresses_intercept() {
        let mut reg = BreakpointRegistry::new();
        reg.add_or_change("c1", "A.1", vec![Property::Condition("r0 == 42".into())]);
        let eval = EqEvaluator(0);
        assert!(!should_intercept(&mut reg, &["A.1".to_string()], "T1", &eval));
    }

    #[test]
    fn condition_true_raises_intercept() {
        let mut reg = BreakpointRegistry::new();
        reg.add_or_change("c1", "A.1", vec![Property::Condition("r0 == 42".into())]);
        let eval = EqEvaluator(42);
        assert!(should_intercept(&mut reg, &["A.1".to_string()], "T1", &eval));
    }

    #[test]
    fn ignore_count_suppresses_first_three_hits() {
        let mut reg = BreakpointRegistry::new();
        reg.add_or_change("c1", "A.1", vec![Property::IgnoreCount(3)]);
        let eval = AlwaysTrueEvaluator;
        let mut hits = Vec::new();
        for _ in 0..4 {
            hits.push(should_intercept(&mut reg, &["A.1".to_string()], "T1", &eval));
        }
        assert_eq!(hits, vec![false, false, false, true]);
        assert_eq!(reg.get("A.1").unwrap().hit_count, 0);
    }

    #[test]
    fn two_channels_sharing_one_id_both_hold_refs() {
        let mut reg = BreakpointRegistry::new();
        reg.add_or_change("c1", "A.1", vec![]);
        reg.add_or_change("c2", "A.1", vec![]);
        reg.remove("c1", &["A.1".to_string()]);
        assert!(!reg.get("A.1").unwrap().deleted);
        reg.remove("c2", &["A.1".to_string()]);
        assert!(reg.get("A.1").unwrap().deleted);
    }

    #[test]
    fn unsupported_property_marks_error() {
        let mut reg = BreakpointRegistry::new();
        reg.add_or_change("c1", "A.1", vec![Property::Unsupported("Foo".into())]);
        assert!(reg.get("A.1").unwrap().error.is_some());
        assert!(!reg.get("A.1").unwrap().is_supported());
    }
}
