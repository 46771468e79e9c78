//! Connection and delivery state for one open conversation.
//!
//! `ConversationSession` performs no I/O. The driver in `controller` feeds it
//! transport outcomes and server events and forwards the requests it returns.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ThreadId, UserId},
    error::ApiError,
    protocol::{ClientRequest, MessageAck, MessagePayload, ServerEvent},
};
use tracing::{debug, info, warn};

use crate::{
    error::{ClientError, ClientResult},
    reconnect::ReconnectPolicy,
    timeline::{DeliveryState, LocalId, LocalMessage, Timeline},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Joined,
    Reconnecting,
    /// Retry budget exhausted. Only a manual retry leaves this state.
    Suspended,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    TimelineUpdated,
    SendFailed(LocalId),
    RetriesExhausted { attempts: u32 },
    ThreadDeleted(ThreadId),
    Error(ApiError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub attempts: u32,
    pub messages: Vec<LocalMessage>,
}

#[derive(Debug)]
pub struct ConversationSession {
    thread_id: ThreadId,
    user_id: UserId,
    policy: ReconnectPolicy,
    send_timeout: Duration,
    state: SessionState,
    attempts: u32,
    timeline: Timeline,
    events: Vec<SessionEvent>,
}

impl ConversationSession {
    pub fn new(
        thread_id: ThreadId,
        user_id: UserId,
        policy: ReconnectPolicy,
        send_timeout: Duration,
    ) -> Self {
        Self {
            thread_id,
            user_id,
            policy,
            send_timeout,
            state: SessionState::Idle,
            attempts: 0,
            timeline: Timeline::default(),
            events: Vec::new(),
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            attempts: self.attempts,
            messages: self.timeline.entries().to_vec(),
        }
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Returns true when the caller should open a new connection.
    pub fn begin_connect(&mut self) -> bool {
        match self.state {
            SessionState::Idle | SessionState::Reconnecting | SessionState::Suspended => {
                self.set_state(SessionState::Connecting);
                true
            }
            SessionState::Connecting | SessionState::Joined | SessionState::Closed => false,
        }
    }

    pub fn join_request(&self) -> ClientRequest {
        ClientRequest::Join {
            thread_id: self.thread_id.to_string(),
        }
    }

    /// A connect or join attempt failed before the thread was joined.
    pub fn on_connect_failed(&mut self) -> RetryDecision {
        if self.state != SessionState::Connecting {
            return RetryDecision::Stop;
        }
        self.attempts += 1;
        if self.policy.allows(self.attempts) {
            let delay = self.policy.delay_for(self.attempts);
            debug!(
                thread_id = %self.thread_id,
                attempt = self.attempts,
                delay_ms = delay.as_millis() as u64,
                "session: scheduling reconnect"
            );
            self.set_state(SessionState::Reconnecting);
            RetryDecision::RetryAfter(delay)
        } else {
            warn!(
                thread_id = %self.thread_id,
                attempts = self.attempts,
                "session: retry budget exhausted"
            );
            self.set_state(SessionState::Suspended);
            self.events.push(SessionEvent::RetriesExhausted {
                attempts: self.attempts,
            });
            RetryDecision::GiveUp
        }
    }

    /// The live connection dropped.
    pub fn on_transport_lost(&mut self) -> RetryDecision {
        match self.state {
            SessionState::Joined => {
                info!(thread_id = %self.thread_id, "session: transport lost, reconnecting");
                self.attempts = 0;
                self.set_state(SessionState::Reconnecting);
                RetryDecision::RetryAfter(Duration::ZERO)
            }
            SessionState::Connecting => self.on_connect_failed(),
            _ => RetryDecision::Stop,
        }
    }

    /// Applies one server event and returns the frames that should follow it.
    pub fn on_server_event(&mut self, event: ServerEvent) -> Vec<ClientRequest> {
        if self.state == SessionState::Closed {
            return Vec::new();
        }
        match event {
            ServerEvent::History {
                thread_id,
                messages,
            } => {
                if thread_id != self.thread_id {
                    return Vec::new();
                }
                if self.timeline.merge_history(&messages) {
                    self.events.push(SessionEvent::TimelineUpdated);
                }
                if self.state != SessionState::Connecting {
                    return Vec::new();
                }
                self.attempts = 0;
                self.set_state(SessionState::Joined);
                self.flush_queued()
            }
            ServerEvent::Message { message } => {
                if message.thread_id == self.thread_id {
                    self.apply(&message);
                }
                Vec::new()
            }
            ServerEvent::MessageAck(ack) => {
                if ack.thread_id == self.thread_id {
                    let payload = self.ack_payload(ack);
                    self.apply(&payload);
                }
                Vec::new()
            }
            ServerEvent::ThreadDeleted { thread_id } => {
                if thread_id == self.thread_id {
                    info!(thread_id = %thread_id, "session: thread deleted");
                    self.timeline.clear();
                    self.events.push(SessionEvent::ThreadDeleted(thread_id));
                    self.events.push(SessionEvent::TimelineUpdated);
                    self.set_state(SessionState::Closed);
                }
                Vec::new()
            }
            ServerEvent::Error(err) => {
                warn!(thread_id = %self.thread_id, code = ?err.code, "session: server error: {}", err.message);
                let fatal = self.state == SessionState::Connecting && err.is_permanent();
                self.events.push(SessionEvent::Error(err));
                if fatal {
                    self.set_state(SessionState::Closed);
                }
                Vec::new()
            }
        }
    }

    /// Appends an optimistic entry. The request is returned only while joined;
    /// otherwise the entry waits and is sent on the next successful join.
    pub fn send(
        &mut self,
        body: &str,
        client_time: DateTime<Utc>,
        now: Instant,
    ) -> ClientResult<(LocalId, Option<ClientRequest>)> {
        if self.state == SessionState::Closed {
            return Err(ClientError::SessionClosed);
        }
        if body.trim().is_empty() {
            return Err(ClientError::EmptyBody);
        }
        let local_id = self.timeline.push_pending(self.user_id, body, client_time, now);
        self.events.push(SessionEvent::TimelineUpdated);
        let request = self.dispatch(local_id);
        Ok((local_id, request))
    }

    pub fn resend(&mut self, local_id: LocalId, now: Instant) -> ClientResult<Option<ClientRequest>> {
        if self.state == SessionState::Closed {
            return Err(ClientError::SessionClosed);
        }
        let entry = self
            .timeline
            .entry_mut(local_id)
            .ok_or(ClientError::UnknownLocalMessage(local_id))?;
        if entry.state != DeliveryState::Failed {
            return Err(ClientError::NotFailed(local_id));
        }
        entry.state = DeliveryState::Pending;
        entry.queued_at = now;
        entry.dispatched = false;
        self.events.push(SessionEvent::TimelineUpdated);
        Ok(self.dispatch(local_id))
    }

    /// Fails every pending send older than the send timeout.
    pub fn expire_pending(&mut self, now: Instant) -> Vec<LocalId> {
        let Some(cutoff) = now.checked_sub(self.send_timeout) else {
            return Vec::new();
        };
        let expired = self.timeline.expire_pending(cutoff);
        if !expired.is_empty() {
            for local_id in &expired {
                self.events.push(SessionEvent::SendFailed(*local_id));
            }
            self.events.push(SessionEvent::TimelineUpdated);
        }
        expired
    }

    /// Manual retry: restores the full budget and asks for a new connection.
    pub fn retry_now(&mut self) -> bool {
        match self.state {
            SessionState::Suspended | SessionState::Reconnecting | SessionState::Idle => {
                self.attempts = 0;
                self.begin_connect()
            }
            _ => false,
        }
    }

    pub fn resync_request(&self) -> Option<ClientRequest> {
        (self.state == SessionState::Joined).then(|| self.join_request())
    }

    pub fn close(&mut self) {
        self.set_state(SessionState::Closed);
    }

    fn apply(&mut self, message: &MessagePayload) {
        if self.timeline.apply_canonical(message).changed() {
            self.events.push(SessionEvent::TimelineUpdated);
        }
    }

    fn ack_payload(&self, ack: MessageAck) -> MessagePayload {
        MessagePayload {
            message_id: ack.message_id,
            thread_id: ack.thread_id,
            sender_id: Some(self.user_id),
            body: ack.body,
            read: false,
            created_at: ack.created_at,
        }
    }

    fn flush_queued(&mut self) -> Vec<ClientRequest> {
        let queued = self.timeline.take_undispatched();
        if !queued.is_empty() {
            debug!(thread_id = %self.thread_id, count = queued.len(), "session: flushing queued sends");
        }
        queued
            .into_iter()
            .map(|(_, body)| self.send_request(body))
            .collect()
    }

    fn dispatch(&mut self, local_id: LocalId) -> Option<ClientRequest> {
        if self.state != SessionState::Joined {
            return None;
        }
        let entry = self.timeline.entry_mut(local_id)?;
        entry.dispatched = true;
        entry.ever_sent = true;
        let body = entry.body.clone();
        Some(self.send_request(body))
    }

    fn send_request(&self, body: String) -> ClientRequest {
        ClientRequest::Send {
            thread_id: self.thread_id.to_string(),
            sender_id: self.user_id,
            body,
            client_time: Some(Utc::now()),
        }
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            self.state = next;
            self.events.push(SessionEvent::StateChanged(next));
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
