//! Client side of the messaging core: a REST client for the thread directory and
//! the realtime conversation session controller.

use reqwest::{Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{ListingId, ParticipantRole, SupportContact, ThreadId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        MarkReadResponse, MessagePayload, OpenThreadRequest, OpenThreadResponse,
        RegisterUserRequest, RegisterUserResponse, SupportMessageRequest, SupportReceipt,
        ThreadSummary, UnreadCounts,
    },
};

pub mod controller;
pub mod error;
pub mod reconnect;
pub mod session;
pub mod timeline;

pub use controller::{websocket_url, SessionConfig, SessionHandle};
pub use error::{ClientError, ClientResult};
pub use reconnect::ReconnectPolicy;
pub use session::{ConversationSession, RetryDecision, SessionEvent, SessionSnapshot, SessionState};
pub use timeline::{DeliveryState, LocalId, LocalMessage, Timeline};

#[derive(Serialize)]
struct UserParams {
    user_id: i64,
}

#[derive(Serialize)]
struct ThreadListParams {
    user_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<ParticipantRole>,
}

/// Request/response access to the thread directory.
#[derive(Clone)]
pub struct DirectoryClient {
    http: reqwest::Client,
    base: String,
}

impl DirectoryClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_http(reqwest::Client::new(), server_url)
    }

    pub fn with_http(http: reqwest::Client, server_url: impl Into<String>) -> Self {
        let base = server_url.into().trim_end_matches('/').to_string();
        Self { http, base }
    }

    pub fn server_url(&self) -> &str {
        &self.base
    }

    pub async fn health(&self) -> ClientResult<()> {
        let response = self.http.get(self.url("/healthz")).send().await?;
        expect_success(response).await
    }

    pub async fn register_user(&self, display_name: &str) -> ClientResult<UserId> {
        let response = self
            .http
            .post(self.url("/users"))
            .json(&RegisterUserRequest {
                display_name: display_name.to_string(),
            })
            .send()
            .await?;
        let body: RegisterUserResponse = decode(response).await?;
        Ok(body.user_id)
    }

    pub async fn open_thread(
        &self,
        listing_id: Option<ListingId>,
        renter_id: UserId,
        owner_id: UserId,
    ) -> ClientResult<ThreadId> {
        let response = self
            .http
            .post(self.url("/threads"))
            .json(&OpenThreadRequest {
                listing_id,
                renter_id,
                owner_id,
            })
            .send()
            .await?;
        let body: OpenThreadResponse = decode(response).await?;
        Ok(body.thread_id)
    }

    pub async fn list_threads(
        &self,
        user_id: UserId,
        role: Option<ParticipantRole>,
    ) -> ClientResult<Vec<ThreadSummary>> {
        let response = self
            .http
            .get(self.url("/threads"))
            .query(&ThreadListParams {
                user_id: user_id.0,
                role,
            })
            .send()
            .await?;
        decode(response).await
    }

    pub async fn unread_counts(&self, user_id: UserId) -> ClientResult<UnreadCounts> {
        let response = self
            .http
            .get(self.url("/threads/unread"))
            .query(&UserParams { user_id: user_id.0 })
            .send()
            .await?;
        decode(response).await
    }

    pub async fn history(
        &self,
        thread_id: ThreadId,
        user_id: UserId,
    ) -> ClientResult<Vec<MessagePayload>> {
        let response = self
            .http
            .get(self.url(&format!("/threads/{thread_id}/messages")))
            .query(&UserParams { user_id: user_id.0 })
            .send()
            .await?;
        decode(response).await
    }

    pub async fn mark_read(&self, thread_id: ThreadId, user_id: UserId) -> ClientResult<u64> {
        let response = self
            .http
            .post(self.url(&format!("/threads/{thread_id}/read")))
            .query(&UserParams { user_id: user_id.0 })
            .send()
            .await?;
        let body: MarkReadResponse = decode(response).await?;
        Ok(body.updated)
    }

    pub async fn delete_thread(&self, thread_id: ThreadId, user_id: UserId) -> ClientResult<()> {
        let response = self
            .http
            .delete(self.url(&format!("/threads/{thread_id}")))
            .query(&UserParams { user_id: user_id.0 })
            .send()
            .await?;
        expect_success(response).await
    }

    pub async fn submit_support(
        &self,
        contact: SupportContact,
        body: &str,
    ) -> ClientResult<SupportReceipt> {
        let response = self
            .http
            .post(self.url("/support"))
            .json(&SupportMessageRequest {
                contact,
                body: body.to_string(),
            })
            .send()
            .await?;
        decode(response).await
    }

    /// Session settings for a conversation on this server.
    pub fn session_config(&self, thread_id: ThreadId, user_id: UserId) -> SessionConfig {
        SessionConfig::new(self.base.clone(), thread_id, user_id)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> ClientResult<T> {
    if response.status().is_success() {
        return Ok(response.json().await?);
    }
    Err(rejection(response).await)
}

async fn expect_success(response: Response) -> ClientResult<()> {
    if response.status().is_success() {
        return Ok(());
    }
    Err(rejection(response).await)
}

async fn rejection(response: Response) -> ClientError {
    let status = response.status();
    match response.json::<ApiError>().await {
        Ok(err) => ClientError::Api(err),
        Err(_) => ClientError::Api(ApiError::new(
            fallback_code(status),
            format!("unexpected status {status}"),
        )),
    }
}

// Bodies without an ApiError payload, such as the size limit rejection.
fn fallback_code(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE => ErrorCode::Validation,
        StatusCode::UNAUTHORIZED => ErrorCode::Unauthorized,
        StatusCode::NOT_FOUND => ErrorCode::NotFound,
        StatusCode::CONFLICT => ErrorCode::Conflict,
        _ => ErrorCode::Transport,
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
