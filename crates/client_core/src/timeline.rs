//! Local view of one conversation: canonical messages plus optimistic sends that
//! are still waiting for the server.

use std::{fmt, time::Instant};

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, UserId},
    protocol::MessagePayload,
};

/// Client-generated identifier of a timeline entry. Never sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalId(pub u64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMessage {
    pub local_id: LocalId,
    pub message_id: Option<MessageId>,
    pub sender_id: Option<UserId>,
    pub body: String,
    /// Client clock while pending, server clock once confirmed.
    pub created_at: DateTime<Utc>,
    pub read: bool,
    pub state: DeliveryState,
    pub(crate) queued_at: Instant,
    /// Cleared while the entry waits for the next join.
    pub(crate) dispatched: bool,
    /// Handed to a connection at least once, so the server may hold a copy.
    pub(crate) ever_sent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted(LocalId),
    Reconciled(LocalId),
    Updated(LocalId),
    Unchanged,
}

impl ApplyOutcome {
    pub fn changed(self) -> bool {
        !matches!(self, ApplyOutcome::Unchanged)
    }
}

#[derive(Debug, Default, Clone)]
pub struct Timeline {
    entries: Vec<LocalMessage>,
    next_local_id: u64,
}

impl Timeline {
    pub fn entries(&self) -> &[LocalMessage] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, local_id: LocalId) -> Option<&LocalMessage> {
        self.entries.iter().find(|entry| entry.local_id == local_id)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn push_pending(
        &mut self,
        sender_id: UserId,
        body: &str,
        created_at: DateTime<Utc>,
        now: Instant,
    ) -> LocalId {
        let local_id = self.allocate();
        self.entries.push(LocalMessage {
            local_id,
            message_id: None,
            sender_id: Some(sender_id),
            body: body.to_string(),
            created_at,
            read: false,
            state: DeliveryState::Pending,
            queued_at: now,
            dispatched: false,
            ever_sent: false,
        });
        local_id
    }

    /// Folds a canonical record into the timeline.
    ///
    /// Known canonical ids are updated in place. Otherwise the oldest pending entry
    /// with the same sender and body is confirmed, then the oldest failed one, and
    /// only then is a new entry inserted. Entries never handed to a connection
    /// cannot be the origin of a canonical record and are never matched.
    pub fn apply_canonical(&mut self, message: &MessagePayload) -> ApplyOutcome {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.message_id == Some(message.message_id))
        {
            let read = entry.read || message.read;
            if read == entry.read {
                return ApplyOutcome::Unchanged;
            }
            entry.read = read;
            return ApplyOutcome::Updated(entry.local_id);
        }

        let candidate = self
            .oldest_match(message, DeliveryState::Pending)
            .or_else(|| self.oldest_match(message, DeliveryState::Failed));
        let outcome = match candidate {
            Some(index) => {
                let entry = &mut self.entries[index];
                entry.message_id = Some(message.message_id);
                entry.created_at = message.created_at;
                entry.read = message.read;
                entry.state = DeliveryState::Confirmed;
                ApplyOutcome::Reconciled(entry.local_id)
            }
            None => {
                let local_id = self.allocate();
                self.entries.push(LocalMessage {
                    local_id,
                    message_id: Some(message.message_id),
                    sender_id: message.sender_id,
                    body: message.body.clone(),
                    created_at: message.created_at,
                    read: message.read,
                    state: DeliveryState::Confirmed,
                    queued_at: Instant::now(),
                    dispatched: true,
                    ever_sent: true,
                });
                ApplyOutcome::Inserted(local_id)
            }
        };
        self.sort();
        outcome
    }

    pub fn merge_history(&mut self, messages: &[MessagePayload]) -> bool {
        let mut changed = false;
        for message in messages {
            changed |= self.apply_canonical(message).changed();
        }
        changed
    }

    /// Pending entries queued at or before `cutoff` become failed.
    pub fn expire_pending(&mut self, cutoff: Instant) -> Vec<LocalId> {
        self.entries
            .iter_mut()
            .filter(|entry| entry.state == DeliveryState::Pending && entry.queued_at <= cutoff)
            .map(|entry| {
                entry.state = DeliveryState::Failed;
                entry.local_id
            })
            .collect()
    }

    /// Pending entries that have not yet been handed to a live connection.
    pub(crate) fn take_undispatched(&mut self) -> Vec<(LocalId, String)> {
        self.entries
            .iter_mut()
            .filter(|entry| entry.state == DeliveryState::Pending && !entry.dispatched)
            .map(|entry| {
                entry.dispatched = true;
                entry.ever_sent = true;
                (entry.local_id, entry.body.clone())
            })
            .collect()
    }

    pub(crate) fn entry_mut(&mut self, local_id: LocalId) -> Option<&mut LocalMessage> {
        self.entries
            .iter_mut()
            .find(|entry| entry.local_id == local_id)
    }

    fn oldest_match(&self, message: &MessagePayload, state: DeliveryState) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                entry.state == state
                    && entry.ever_sent
                    && entry.message_id.is_none()
                    && entry.sender_id == message.sender_id
                    && entry.body == message.body
            })
            .min_by_key(|(_, entry)| entry.local_id)
            .map(|(index, _)| index)
    }

    fn allocate(&mut self) -> LocalId {
        self.next_local_id += 1;
        LocalId(self.next_local_id)
    }

    // Confirmed entries in persistence order, then unconfirmed ones in local order.
    fn sort(&mut self) {
        self.entries
            .sort_by_key(|entry| (entry.message_id.is_none(), entry.message_id, entry.local_id));
    }
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
