//! Per-policy fire times with at-most-one pass in flight per policy

use crate::models::PolicyId;
use std::collections::{HashMap, HashSet};
use tokio::time::Instant;

/// Pending `(policy, fire time)` pairs plus the set of policies being reconciled
///
/// A policy scheduled while its pass is running stays pending and becomes
/// due only after [`ScheduleQueue::complete`] is called for it.
#[derive(Debug, Default)]
pub struct ScheduleQueue {
    pending: HashMap<PolicyId, Instant>,
    in_flight: HashSet<PolicyId>,
}

impl ScheduleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire `id` at `at`, keeping the earlier time if one is already pending
    pub fn schedule(&mut self, id: PolicyId, at: Instant) {
        self.pending
            .entry(id)
            .and_modify(|current| {
                if at < *current {
                    *current = at;
                }
            })
            .or_insert(at);
    }

    /// Drop a pending fire time; returns whether one existed
    pub fn cancel(&mut self, id: &PolicyId) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Take up to `limit` due policies in fire-time order and mark them in flight
    pub fn pop_due(&mut self, now: Instant, limit: usize) -> Vec<PolicyId> {
        let mut due: Vec<(Instant, PolicyId)> = self
            .pending
            .iter()
            .filter(|(id, at)| **at <= now && !self.in_flight.contains(*id))
            .map(|(id, at)| (*at, id.clone()))
            .collect();
        due.sort();
        due.truncate(limit);

        due.into_iter()
            .map(|(_, id)| {
                self.pending.remove(&id);
                self.in_flight.insert(id.clone());
                id
            })
            .collect()
    }

    /// Mark the pass for `id` as finished
    pub fn complete(&mut self, id: &PolicyId) {
        self.in_flight.remove(id);
    }

    /// Earliest fire time among policies that are not in flight
    pub fn next_fire_time(&self) -> Option<Instant> {
        self.pending
            .iter()
            .filter(|(id, _)| !self.in_flight.contains(*id))
            .map(|(_, at)| *at)
            .min()
    }

    #[cfg(test)]
    fn is_in_flight(&self, id: &PolicyId) -> bool {
        self.in_flight.contains(id)
    }

    #[cfg(test)]
    fn fire_time(&self, id: &PolicyId) -> Option<Instant> {
        self.pending.get(id).copied()
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
