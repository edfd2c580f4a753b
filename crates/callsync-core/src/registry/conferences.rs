//! Conference registry
//!
//! Holds every conference (single-call shells included) and a reverse index
//! from call id to owning conference, which is what guarantees that a call is
//! a member of at most one conference at any instant.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use crate::call::CallId;
use crate::conference::{Conference, ConferenceId};
use crate::error::{SyncError, SyncResult};

/// Outcome of [`ConferenceRegistry::remove_member`]
#[derive(Debug, Clone, PartialEq)]
pub enum MemberRemoval {
    /// The call was not a member
    NotMember,
    /// The call left and other members remain
    Removed,
    /// The call was the last member; the conference was deleted
    ConferenceDeleted(Conference),
}

/// Changes needed to bring a conference in line with an authoritative member list
///
/// Computed by set difference before anything is mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDiff {
    /// Listed by the daemon but not yet members, in daemon order
    pub to_add: Vec<CallId>,
    /// Members the daemon no longer lists, in display order
    pub to_remove: Vec<CallId>,
}

impl MembershipDiff {
    /// Whether the conference already matches the list
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Registry of conferences with a call-to-conference index
#[derive(Debug, Clone, Default)]
pub struct ConferenceRegistry {
    conferences: IndexMap<ConferenceId, Conference>,
    owners: HashMap<CallId, ConferenceId>,
}

impl ConferenceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the conference `id`, creating it empty if it does not exist
    pub fn create(&mut self, id: ConferenceId, now: DateTime<Utc>) -> &mut Conference {
        self.conferences
            .entry(id.clone())
            .or_insert_with(|| Conference::new(id, now))
    }

    /// Add `call_id` to conference `id`
    ///
    /// Returns `Ok(false)` if it was already a member and
    /// [`SyncError::MembershipConflict`] if another conference owns it.
    pub fn add_member(&mut self, id: &ConferenceId, call_id: &CallId) -> SyncResult<bool> {
        if let Some(owner) = self.owners.get(call_id) {
            if owner != id {
                return Err(SyncError::MembershipConflict {
                    call_id: call_id.clone(),
                    owner: owner.clone(),
                });
            }
        }
        let conference = self
            .conferences
            .get_mut(id)
            .ok_or_else(|| SyncError::unknown_conference(id))?;
        let inserted = conference.insert_member(call_id.clone());
        self.owners.insert(call_id.clone(), id.clone());
        Ok(inserted)
    }

    /// Remove `call_id` from conference `id`, deleting the conference if it empties
    pub fn remove_member(
        &mut self,
        id: &ConferenceId,
        call_id: &CallId,
    ) -> SyncResult<MemberRemoval> {
        let conference = self
            .conferences
            .get_mut(id)
            .ok_or_else(|| SyncError::unknown_conference(id))?;
        if !conference.remove_member(call_id) {
            return Ok(MemberRemoval::NotMember);
        }
        self.owners.remove(call_id);

        if conference.is_empty() {
            let deleted = self.conferences.shift_remove(id);
            return Ok(deleted.map_or(MemberRemoval::Removed, MemberRemoval::ConferenceDeleted));
        }
        Ok(MemberRemoval::Removed)
    }

    /// Delete conference `id`, releasing its members
    ///
    /// Released calls belong to no conference afterwards; callers re-home them.
    pub fn delete(&mut self, id: &ConferenceId) -> Option<Conference> {
        let conference = self.conferences.shift_remove(id)?;
        for member in conference.members() {
            if self.owners.get(member) == Some(id) {
                self.owners.remove(member);
            }
        }
        Some(conference)
    }

    /// Compute the membership diff of conference `id` against `authoritative`
    ///
    /// A conference that does not exist has no members. Duplicates in the
    /// list are ignored.
    pub fn diff(&self, id: &ConferenceId, authoritative: &[CallId]) -> MembershipDiff {
        let wanted: HashSet<&CallId> = authoritative.iter().collect();
        let current = self.conferences.get(id);

        let mut seen = HashSet::new();
        let to_add = authoritative
            .iter()
            .filter(|call_id| seen.insert(*call_id))
            .filter(|call_id| !current.map(|c| c.contains(call_id)).unwrap_or(false))
            .cloned()
            .collect();
        let to_remove = current
            .map(|c| {
                c.members()
                    .filter(|call_id| !wanted.contains(call_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        MembershipDiff { to_add, to_remove }
    }

    /// Look up a conference
    pub fn get(&self, id: &ConferenceId) -> Option<&Conference> {
        self.conferences.get(id)
    }

    /// Look up a conference for mutation
    pub fn get_mut(&mut self, id: &ConferenceId) -> Option<&mut Conference> {
        self.conferences.get_mut(id)
    }

    /// Whether conference `id` exists
    pub fn contains(&self, id: &ConferenceId) -> bool {
        self.conferences.contains_key(id)
    }

    /// Id of the conference that owns `call_id`
    pub fn owner_of(&self, call_id: &CallId) -> Option<&ConferenceId> {
        self.owners.get(call_id)
    }

    /// The conference that owns `call_id`
    pub fn conference_of(&self, call_id: &CallId) -> Option<&Conference> {
        self.owners
            .get(call_id)
            .and_then(|id| self.conferences.get(id))
    }

    /// Iterate over conferences in creation order
    pub fn iter(&self) -> impl Iterator<Item = &Conference> {
        self.conferences.values()
    }

    /// Iterate over the call-to-conference index
    pub fn owners(&self) -> impl Iterator<Item = (&CallId, &ConferenceId)> {
        self.owners.iter()
    }

    /// Number of conferences
    pub fn len(&self) -> usize {
        self.conferences.len()
    }

    /// Whether there are no conferences
    pub fn is_empty(&self) -> bool {
        self.conferences.is_empty()
    }
}
