use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ListingId, MessageId, ParticipantRole, SupportContact, ThreadId, ThreadKind, UserId},
    error::ApiError,
};

/// Client to server frames on the duplex channel.
///
/// Thread ids travel as raw strings so the gateway can reject malformed ids with an
/// `error` event instead of dropping the whole frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    Join {
        thread_id: String,
    },
    Send {
        thread_id: String,
        sender_id: UserId,
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_time: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub thread_id: ThreadId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    pub body: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// Private confirmation sent only to the connection that originated a send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAck {
    pub thread_id: ThreadId,
    pub message_id: MessageId,
    pub created_at: DateTime<Utc>,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    History {
        thread_id: ThreadId,
        messages: Vec<MessagePayload>,
    },
    Message {
        message: MessagePayload,
    },
    MessageAck(MessageAck),
    ThreadDeleted {
        thread_id: ThreadId,
    },
    Error(ApiError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub thread_id: ThreadId,
    pub kind: ThreadKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_id: Option<ListingId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renter_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<UserId>,
    /// Role the requesting user holds in this thread.
    pub role: ParticipantRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_participant_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sender_id: Option<UserId>,
    pub last_activity_at: DateTime<Utc>,
    pub unread_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCounts {
    pub total: u64,
    pub threads: BTreeMap<ThreadId, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterUserRequest {
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterUserResponse {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenThreadRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_id: Option<ListingId>,
    pub renter_id: UserId,
    pub owner_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenThreadResponse {
    pub thread_id: ThreadId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub updated: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportMessageRequest {
    #[serde(flatten)]
    pub contact: SupportContact,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportReceipt {
    pub thread_id: ThreadId,
    pub message_id: MessageId,
}
