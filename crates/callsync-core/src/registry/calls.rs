//! Call registry
//!
//! Owns every live [`Call`] keyed by its identifier. Terminated calls are
//! removed from the live map but their id and final state are remembered in a
//! bounded tombstone list so late daemon events can be told apart from events
//! for ids that were never seen.

use std::collections::{HashMap, VecDeque};

use crate::call::{Call, CallId, CallState};
use crate::conference::Conference;

/// Registry of live calls
#[derive(Debug, Clone)]
pub struct CallRegistry {
    calls: HashMap<CallId, Call>,
    tombstones: HashMap<CallId, CallState>,
    tombstone_order: VecDeque<CallId>,
    memory: usize,
    stats: CallRegistryStats,
}

/// Counters kept by the call registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallRegistryStats {
    /// Calls ever inserted
    pub total_created: usize,
    /// Calls removed after reaching a terminal state
    pub total_terminated: usize,
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new(256)
    }
}

impl CallRegistry {
    /// Create a registry that remembers up to `memory` terminated call ids
    pub fn new(memory: usize) -> Self {
        Self {
            calls: HashMap::new(),
            tombstones: HashMap::new(),
            tombstone_order: VecDeque::new(),
            memory,
            stats: CallRegistryStats::default(),
        }
    }

    /// Insert or replace a call, returning the previous value
    pub fn upsert(&mut self, call: Call) -> Option<Call> {
        let id = call.id.clone();
        if self.tombstones.remove(&id).is_some() {
            self.tombstone_order.retain(|t| t != &id);
        }
        let previous = self.calls.insert(id, call);
        if previous.is_none() {
            self.stats.total_created += 1;
        }
        previous
    }

    /// Look up a live call
    pub fn get(&self, id: &CallId) -> Option<&Call> {
        self.calls.get(id)
    }

    /// Look up a live call for mutation
    pub fn get_mut(&mut self, id: &CallId) -> Option<&mut Call> {
        self.calls.get_mut(id)
    }

    /// Whether `id` is a live call
    pub fn contains(&self, id: &CallId) -> bool {
        self.calls.contains_key(id)
    }

    /// Remove a call; removing an absent id is a no-op
    pub fn remove(&mut self, id: &CallId) -> Option<Call> {
        let call = self.calls.remove(id)?;
        if call.is_terminal() {
            self.stats.total_terminated += 1;
            self.remember(call.id.clone(), call.state);
        }
        Some(call)
    }

    /// Final state of a recently terminated call
    pub fn terminal_state(&self, id: &CallId) -> Option<CallState> {
        self.tombstones.get(id).copied()
    }

    /// Whether `id` belongs to a recently terminated call
    pub fn is_terminated(&self, id: &CallId) -> bool {
        self.tombstones.contains_key(id)
    }

    /// Visit every live member of `conference` in display order
    pub fn for_each_in_conference<F>(&self, conference: &Conference, mut f: F)
    where
        F: FnMut(&Call),
    {
        for id in conference.members() {
            if let Some(call) = self.calls.get(id) {
                f(call);
            }
        }
    }

    /// Live member states of `conference`
    pub fn member_states(&self, conference: &Conference) -> Vec<CallState> {
        let mut states = Vec::with_capacity(conference.len());
        self.for_each_in_conference(conference, |call| states.push(call.state));
        states
    }

    /// Iterate over live calls in arbitrary order
    pub fn iter(&self) -> impl Iterator<Item = &Call> {
        self.calls.values()
    }

    /// Number of live calls
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether no call is live
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Registry counters
    pub fn stats(&self) -> CallRegistryStats {
        self.stats
    }

    fn remember(&mut self, id: CallId, state: CallState) {
        if self.memory == 0 {
            return;
        }
        if self.tombstones.insert(id.clone(), state).is_none() {
            self.tombstone_order.push_back(id);
        }
        while self.tombstone_order.len() > self.memory {
            if let Some(oldest) = self.tombstone_order.pop_front() {
                self.tombstones.remove(&oldest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn call(id: &str) -> Call {
        Call::incoming("acc", CallId::from(id), "sip:peer@example.com", Utc::now())
    }

    fn hung_up(id: &str) -> Call {
        let mut call = call(id);
        call.apply_state(CallState::HungUp, Utc::now()).unwrap();
        call
    }

    #[test]
    fn test_upsert_and_get() {
        let mut registry = CallRegistry::default();
        assert!(registry.upsert(call("c1")).is_none());
        assert!(registry.upsert(call("c1")).is_some());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.stats().total_created, 1);
        assert!(registry.get(&CallId::from("c1")).is_some());
        assert!(registry.get(&CallId::from("c2")).is_none());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut registry = CallRegistry::default();
        registry.upsert(call("c1"));
        assert!(registry.remove(&CallId::from("c1")).is_some());
        assert!(registry.remove(&CallId::from("c1")).is_none());
        assert!(registry.remove(&CallId::from("never")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_terminated_calls_leave_tombstones() {
        let mut registry = CallRegistry::new(2);
        for id in ["a", "b", "c"] {
            registry.upsert(hung_up(id));
            registry.remove(&CallId::from(id));
        }
        assert!(!registry.is_terminated(&CallId::from("a")));
        assert_eq!(registry.terminal_state(&CallId::from("c")), Some(CallState::HungUp));
        assert_eq!(registry.stats().total_terminated, 3);

        // Reusing an id revives it
        registry.upsert(call("c"));
        assert!(!registry.is_terminated(&CallId::from("c")));
    }

    #[test]
    fn test_for_each_in_conference() {
        let mut registry = CallRegistry::default();
        registry.upsert(call("c1"));
        registry.upsert(call("c2"));

        let mut conference = Conference::single(&CallId::from("c2"), Utc::now());
        conference.insert_member(CallId::from("c1"));
        conference.insert_member(CallId::from("gone"));

        let mut seen = Vec::new();
        registry.for_each_in_conference(&conference, |c| seen.push(c.id.clone()));
        assert_eq!(seen, vec![CallId::from("c2"), CallId::from("c1")]);
    }
}
