//! Participant-facing thread operations: find-or-create, listings with unread
//! counters, mark-read, deletion and support intake. Every entry point takes the
//! caller's identity explicitly.

use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{ListingId, ParticipantRole, SupportContact, ThreadId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{MessagePayload, SupportReceipt, ThreadSummary, UnreadCounts},
};
use storage::{Storage, StoreError, StoredMessage, StoredThread, ThreadOverview};
use tracing::{error, info};

/// Shared by "no such thread" and "not a participant" so callers cannot probe
/// for thread existence.
pub const THREAD_NOT_FOUND: &str = "thread not found";

/// Receives thread lifecycle notifications that must reach live connections.
#[async_trait]
pub trait ThreadEventSink: Send + Sync {
    async fn thread_deleted(&self, thread_id: ThreadId);
}

pub struct NoopEventSink;

#[async_trait]
impl ThreadEventSink for NoopEventSink {
    async fn thread_deleted(&self, _thread_id: ThreadId) {}
}

#[derive(Clone)]
pub struct DirectoryContext {
    pub storage: Storage,
    pub events: Arc<dyn ThreadEventSink>,
}

impl DirectoryContext {
    pub fn new(storage: Storage, events: Arc<dyn ThreadEventSink>) -> Self {
        Self { storage, events }
    }

    pub fn without_events(storage: Storage) -> Self {
        Self::new(storage, Arc::new(NoopEventSink))
    }
}

pub async fn register_user(ctx: &DirectoryContext, display_name: &str) -> Result<UserId, ApiError> {
    ctx.storage
        .upsert_user(display_name)
        .await
        .map_err(store_error)
}

pub async fn find_or_create_thread(
    ctx: &DirectoryContext,
    listing_id: Option<ListingId>,
    renter_id: UserId,
    owner_id: UserId,
) -> Result<ThreadId, ApiError> {
    let (thread, created) = ctx
        .storage
        .find_or_create_direct_thread(listing_id, renter_id, owner_id)
        .await
        .map_err(store_error)?;
    if created {
        info!(
            thread_id = %thread.thread_id,
            listing_id = ?listing_id.map(|l| l.0),
            %renter_id,
            %owner_id,
            "opened new conversation"
        );
    }
    Ok(thread.thread_id)
}

pub async fn list_threads_for_user(
    ctx: &DirectoryContext,
    user_id: UserId,
    role: Option<ParticipantRole>,
) -> Result<Vec<ThreadSummary>, ApiError> {
    let overviews = ctx
        .storage
        .list_threads_for_user(user_id, role)
        .await
        .map_err(store_error)?;
    Ok(overviews.into_iter().map(thread_summary).collect())
}

pub async fn unread_counts(ctx: &DirectoryContext, user_id: UserId) -> Result<UnreadCounts, ApiError> {
    let counts = ctx
        .storage
        .unread_counts_for_user(user_id)
        .await
        .map_err(store_error)?;

    let mut unread = UnreadCounts::default();
    for (thread_id, count) in counts {
        unread.total += count;
        unread.threads.insert(thread_id, count);
    }
    Ok(unread)
}

pub async fn mark_thread_read(
    ctx: &DirectoryContext,
    thread_id: ThreadId,
    user_id: UserId,
) -> Result<u64, ApiError> {
    load_participant_thread(&ctx.storage, thread_id, user_id).await?;
    ctx.storage
        .mark_read(thread_id, user_id)
        .await
        .map_err(store_error)
}

/// Deletes the thread with its messages, then tells live connections about it.
pub async fn delete_thread(
    ctx: &DirectoryContext,
    thread_id: ThreadId,
    user_id: UserId,
) -> Result<(), ApiError> {
    load_participant_thread(&ctx.storage, thread_id, user_id).await?;
    ctx.storage
        .delete_thread(thread_id)
        .await
        .map_err(store_error)?;
    info!(%thread_id, %user_id, "thread deleted by participant");
    ctx.events.thread_deleted(thread_id).await;
    Ok(())
}

pub async fn thread_history(
    ctx: &DirectoryContext,
    thread_id: ThreadId,
    user_id: UserId,
) -> Result<Vec<MessagePayload>, ApiError> {
    load_participant_thread(&ctx.storage, thread_id, user_id).await?;
    let messages = ctx
        .storage
        .list_messages(thread_id)
        .await
        .map_err(store_error)?;
    Ok(messages.into_iter().map(message_payload).collect())
}

pub async fn submit_support_message(
    ctx: &DirectoryContext,
    contact: SupportContact,
    body: &str,
) -> Result<SupportReceipt, ApiError> {
    let email = contact.normalized_email();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::validation("a valid contact email is required"));
    }
    if body.trim().is_empty() {
        return Err(ApiError::validation("message body must not be empty"));
    }

    let (thread, created) = ctx
        .storage
        .find_or_create_support_thread(&contact)
        .await
        .map_err(store_error)?;
    let message = ctx
        .storage
        .append_message(thread.thread_id, None, body)
        .await
        .map_err(store_error)?;
    if created {
        info!(thread_id = %thread.thread_id, "support thread opened");
    }
    Ok(SupportReceipt {
        thread_id: thread.thread_id,
        message_id: message.message_id,
    })
}

/// Resolves a thread only for one of its participants.
pub async fn load_participant_thread(
    storage: &Storage,
    thread_id: ThreadId,
    user_id: UserId,
) -> Result<StoredThread, ApiError> {
    let thread = storage
        .load_thread(thread_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| ApiError::not_found(THREAD_NOT_FOUND))?;
    if !thread.is_participant(user_id) {
        return Err(ApiError::not_found(THREAD_NOT_FOUND));
    }
    Ok(thread)
}

pub fn message_payload(message: StoredMessage) -> MessagePayload {
    MessagePayload {
        message_id: message.message_id,
        thread_id: message.thread_id,
        sender_id: message.sender_id,
        body: message.body,
        read: message.read,
        created_at: message.created_at,
    }
}

pub fn store_error(err: StoreError) -> ApiError {
    match err {
        StoreError::Validation(message) => ApiError::validation(message),
        StoreError::NotFound(what) => ApiError::not_found(format!("{what} not found")),
        StoreError::Conflict(message) => ApiError::new(ErrorCode::Conflict, message),
        other => {
            error!(error = %other, "store failure");
            ApiError::internal(other.to_string())
        }
    }
}

fn thread_summary(overview: ThreadOverview) -> ThreadSummary {
    let ThreadOverview {
        thread,
        role,
        other_participant_name,
        unread_count,
    } = overview;
    ThreadSummary {
        thread_id: thread.thread_id,
        kind: thread.kind,
        listing_id: thread.listing_id,
        renter_id: thread.renter_id,
        owner_id: thread.owner_id,
        role,
        other_participant_name,
        last_message: thread.last_message,
        last_sender_id: thread.last_sender_id,
        last_activity_at: thread.last_activity_at,
        unread_count,
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
