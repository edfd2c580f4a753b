//! Call and conference registries
//!
//! [`CallRegistry`] owns the calls, [`ConferenceRegistry`] owns membership.
//! [`Registry`] combines the two and is the only place membership changes:
//! every live call belongs to exactly one conference (a lone call lives in a
//! single-call shell whose id is its own), no conference is ever left empty,
//! and merge/split reconcile against the daemon's list by computing a
//! [`MembershipDiff`] first and applying it afterwards.
//!
//! A conference may carry the id of one of its calls (that call's shell grew
//! into a multi-party conference). While that call is live it stays in the
//! conference named after it; operations that would separate them are
//! rejected with [`SyncError::MembershipConflict`] before anything changes.

mod calls;
mod conferences;

pub use calls::{CallRegistry, CallRegistryStats};
pub use conferences::{ConferenceRegistry, MemberRemoval, MembershipDiff};

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::call::{Call, CallId};
use crate::conference::{AggregateState, Conference, ConferenceId};
use crate::error::{SyncError, SyncResult};

/// Where a call came from when it was moved between conferences
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Move {
    /// Call that moved
    pub call_id: CallId,
    /// Conference it left, if it changed conference
    pub from: Option<ConferenceId>,
    /// The source conference was deleted because it emptied
    pub source_deleted: bool,
}

impl Move {
    /// Whether the call actually changed conference
    pub fn moved(&self) -> bool {
        self.from.is_some()
    }
}

/// A call removed from the registry together with its membership
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedCall {
    /// The removed call
    pub call: Call,
    /// Conference it belonged to
    pub conference_id: Option<ConferenceId>,
    /// The conference was deleted because the call was its last member
    pub conference_deleted: bool,
}

/// Result of reconciling a conference against an authoritative member list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Conference that was reconciled
    pub conference_id: Option<ConferenceId>,
    /// The conference did not exist before
    pub created: bool,
    /// The conference no longer exists afterwards
    pub deleted: bool,
    /// The diff that was applied
    pub diff: MembershipDiff,
    /// Source conferences deleted because every member moved out
    pub dissolved: Vec<ConferenceId>,
    /// Listed ids with no live call behind them
    pub skipped_unknown: Vec<CallId>,
}

impl Reconciliation {
    /// Whether anything changed
    pub fn changed(&self) -> bool {
        self.created || self.deleted || !self.diff.is_empty()
    }
}

/// Calls and conferences kept consistent with each other
#[derive(Debug, Clone, Default)]
pub struct Registry {
    calls: CallRegistry,
    conferences: ConferenceRegistry,
}

impl Registry {
    /// Create an empty registry remembering `terminated_call_memory` ended calls
    pub fn new(terminated_call_memory: usize) -> Self {
        Self {
            calls: CallRegistry::new(terminated_call_memory),
            conferences: ConferenceRegistry::new(),
        }
    }

    /// Read access to the calls
    pub fn calls(&self) -> &CallRegistry {
        &self.calls
    }

    /// Read access to the conferences
    pub fn conferences(&self) -> &ConferenceRegistry {
        &self.conferences
    }

    /// Look up a live call
    pub fn call(&self, id: &CallId) -> Option<&Call> {
        self.calls.get(id)
    }

    /// Look up a conference
    pub fn conference(&self, id: &ConferenceId) -> Option<&Conference> {
        self.conferences.get(id)
    }

    /// The conference that owns a live call
    pub fn conference_of(&self, call_id: &CallId) -> Option<&Conference> {
        self.conferences.conference_of(call_id)
    }

    pub(crate) fn call_mut(&mut self, id: &CallId) -> Option<&mut Call> {
        self.calls.get_mut(id)
    }

    pub(crate) fn conference_mut(&mut self, id: &ConferenceId) -> Option<&mut Conference> {
        self.conferences.get_mut(id)
    }

    /// Register a new call in its own single-call conference
    pub fn insert_call(&mut self, call: Call, now: DateTime<Utc>) -> SyncResult<ConferenceId> {
        let call_id = call.id.clone();
        if call_id.is_empty() {
            return Err(SyncError::malformed("call id is empty"));
        }
        if self.calls.contains(&call_id) {
            return Err(SyncError::malformed(format!("call {} already exists", call_id)));
        }
        let shell = ConferenceId::from(&call_id);
        if self.conferences.contains(&shell) {
            return Err(SyncError::MembershipConflict {
                call_id,
                owner: shell,
            });
        }

        self.calls.upsert(call);
        self.conferences.create(shell.clone(), now);
        self.conferences.add_member(&shell, &call_id)?;
        self.recompute_aggregate(&shell);
        Ok(shell)
    }

    /// Move a live call into conference `target`, creating it if needed
    ///
    /// The source conference is deleted if the call was its last member,
    /// otherwise its aggregate state is recomputed.
    pub fn attach(
        &mut self,
        call_id: &CallId,
        target: &ConferenceId,
        now: DateTime<Utc>,
    ) -> SyncResult<Move> {
        if !self.calls.contains(call_id) {
            return Err(SyncError::unknown_call(call_id));
        }

        let source = self.conferences.owner_of(call_id).cloned();
        if source.as_ref() == Some(target) {
            return Ok(Move {
                call_id: call_id.clone(),
                from: None,
                source_deleted: false,
            });
        }

        if let Some(source) = &source {
            if source.is_call(call_id) && self.conferences.get(source).is_some_and(|c| c.len() > 1) {
                return Err(SyncError::MembershipConflict {
                    call_id: call_id.clone(),
                    owner: source.clone(),
                });
            }
        }

        let mut source_deleted = false;
        if let Some(source) = &source {
            match self.conferences.remove_member(source, call_id)? {
                MemberRemoval::ConferenceDeleted(_) => source_deleted = true,
                _ => {
                    self.recompute_aggregate(source);
                }
            }
        }

        self.conferences.create(target.clone(), now);
        self.conferences.add_member(target, call_id)?;
        self.recompute_aggregate(target);

        debug!(
            "Moved call {} from {:?} to {} (source deleted: {})",
            call_id, source, target, source_deleted
        );
        Ok(Move {
            call_id: call_id.clone(),
            from: source,
            source_deleted,
        })
    }

    /// Move a live call into its own single-call conference
    pub fn detach_to_single(&mut self, call_id: &CallId, now: DateTime<Utc>) -> SyncResult<Move> {
        self.attach(call_id, &ConferenceId::from(call_id), now)
    }

    /// Remove a call and its membership; absent ids are a no-op
    pub fn remove_call(&mut self, call_id: &CallId) -> Option<RemovedCall> {
        if !self.calls.contains(call_id) {
            return None;
        }

        let conference_id = self.conferences.owner_of(call_id).cloned();
        let mut conference_deleted = false;
        if let Some(id) = &conference_id {
            match self.conferences.remove_member(id, call_id) {
                Ok(MemberRemoval::ConferenceDeleted(_)) => conference_deleted = true,
                Ok(_) => {
                    self.recompute_aggregate(id);
                }
                Err(e) => debug!("Conference {} vanished before call {}: {}", id, call_id, e),
            }
        }

        let call = self.calls.remove(call_id)?;
        Some(RemovedCall {
            call,
            conference_id,
            conference_deleted,
        })
    }

    /// Make conference `id` hold exactly the live calls in `authoritative`
    ///
    /// Listed calls are pulled out of whatever conference holds them (source
    /// conferences left empty are deleted); members no longer listed are
    /// detached into their own single-call conference. Unknown ids are
    /// skipped. A conference that does not exist is only created when at
    /// least one listed call is live. Applying the same list twice is a no-op.
    ///
    /// Fails with [`SyncError::MembershipConflict`], leaving the registry
    /// untouched, when the list would separate a live call from the
    /// conference named after it.
    pub fn reconcile(
        &mut self,
        id: &ConferenceId,
        authoritative: &[CallId],
        now: DateTime<Utc>,
    ) -> SyncResult<Reconciliation> {
        let mut skipped_unknown = Vec::new();
        let live: Vec<CallId> = authoritative
            .iter()
            .filter(|call_id| {
                let known = self.calls.contains(call_id);
                if !known {
                    skipped_unknown.push((*call_id).clone());
                }
                known
            })
            .cloned()
            .collect();

        let existed = self.conferences.contains(id);
        let diff = self.conferences.diff(id, &live);
        self.check_namesakes(id, &live, &diff)?;
        if !existed && diff.to_add.is_empty() {
            return Ok(Reconciliation {
                conference_id: Some(id.clone()),
                skipped_unknown,
                ..Default::default()
            });
        }

        let mut dissolved = Vec::new();
        for call_id in &diff.to_add {
            let moved = self.attach(call_id, id, now)?;
            if moved.source_deleted {
                dissolved.extend(moved.from);
            }
        }
        for call_id in &diff.to_remove {
            self.detach_to_single(call_id, now)?;
        }

        let deleted = existed && !self.conferences.contains(id);
        Ok(Reconciliation {
            conference_id: Some(id.clone()),
            created: !existed,
            deleted,
            diff,
            dissolved,
            skipped_unknown,
        })
    }

    /// Break conference `id` up, every member becoming its own single-call conference
    ///
    /// Returns the released members. A single-call shell is left as is. When
    /// the conference carries the id of one of its members, that member stays
    /// behind and the conference becomes its shell.
    pub fn dissolve(&mut self, id: &ConferenceId, now: DateTime<Utc>) -> SyncResult<Vec<CallId>> {
        let conference = self
            .conferences
            .get(id)
            .ok_or_else(|| SyncError::unknown_conference(id))?;
        if conference.is_single_call() {
            return Ok(Vec::new());
        }

        let members = conference.member_ids();
        for call_id in members.iter().filter(|call_id| !id.is_call(call_id)) {
            self.detach_to_single(call_id, now)?;
        }

        let namesake_kept = self
            .conferences
            .get(id)
            .is_some_and(|conference| conference.is_single_call());
        if namesake_kept {
            if let Some(conference) = self.conferences.get_mut(id) {
                conference.state = None;
            }
            self.recompute_aggregate(id);
            debug!("Conference {} shrank back to the shell of its namesake call", id);
        } else if self.conferences.delete(id).is_some() {
            debug!("Deleted conference {} after releasing its members", id);
        }
        Ok(members)
    }

    /// Reject a reconciliation that would separate a live call from the
    /// conference named after it
    fn check_namesakes(
        &self,
        id: &ConferenceId,
        live: &[CallId],
        diff: &MembershipDiff,
    ) -> SyncResult<()> {
        let namesake = CallId::new(id.as_str());
        if self.calls.contains(&namesake) && !live.contains(&namesake) {
            return Err(SyncError::MembershipConflict {
                call_id: namesake,
                owner: id.clone(),
            });
        }

        for call_id in &diff.to_add {
            if let Some(owner) = self.conferences.conference_of(call_id) {
                if owner.id.is_call(call_id) && owner.len() > 1 {
                    return Err(SyncError::MembershipConflict {
                        call_id: call_id.clone(),
                        owner: owner.id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Recompute a conference's aggregate state from its members
    pub fn recompute_aggregate(&mut self, id: &ConferenceId) -> Option<AggregateState> {
        let states = self.calls.member_states(self.conferences.get(id)?);
        let aggregate = AggregateState::from_members(states);
        self.conferences.get_mut(id)?.aggregate = aggregate;
        Some(aggregate)
    }

    /// Verify the partition invariant between calls and conferences
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for conference in self.conferences.iter() {
            if conference.is_empty() {
                return Err(format!("conference {} has no members", conference.id));
            }
            let namesake = CallId::new(conference.id.as_str());
            if self.calls.contains(&namesake) && !conference.contains(&namesake) {
                return Err(format!(
                    "conference {} is named after call {} it does not hold",
                    conference.id, namesake
                ));
            }
            for member in conference.members() {
                if !self.calls.contains(member) {
                    return Err(format!("conference {} lists dead call {}", conference.id, member));
                }
                if !seen.insert(member.clone()) {
                    return Err(format!("call {} is in two conferences", member));
                }
                if self.conferences.owner_of(member) != Some(&conference.id) {
                    return Err(format!("owner index disagrees for call {}", member));
                }
            }
        }
        for call in self.calls.iter() {
            if !seen.contains(&call.id) {
                return Err(format!("call {} belongs to no conference", call.id));
            }
        }
        for (call_id, owner) in self.conferences.owners() {
            if !self.conferences.contains(owner) {
                return Err(format!("call {} references missing conference {}", call_id, owner));
            }
        }
        Ok(())
    }
}
