//! Duplex channel server. Each thread id maps to an in-memory room used only for
//! live fan-out; all durable state stays in the store.
//!
//! Sends for one thread are serialized by the room's writer lock, which is held
//! across persist and broadcast, so every member observes persistence order.
//! Different rooms never share a lock.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use directory::{load_participant_thread, message_payload, store_error, ThreadEventSink};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use shared::{
    domain::{ThreadId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ClientRequest, MessageAck, ServerEvent},
};
use storage::Storage;
use tokio::{
    sync::{broadcast, mpsc, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};

use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewaySettings {
    pub room_capacity: usize,
    pub outbound_buffer: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            room_capacity: 256,
            outbound_buffer: 64,
        }
    }
}

pub struct Gateway {
    storage: Storage,
    settings: GatewaySettings,
    rooms: RwLock<HashMap<ThreadId, Arc<Room>>>,
}

struct Room {
    thread_id: ThreadId,
    events: broadcast::Sender<ServerEvent>,
    writer: Mutex<()>,
    members: AtomicUsize,
}

impl Room {
    fn new(thread_id: ThreadId, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            thread_id,
            events,
            writer: Mutex::new(()),
            members: AtomicUsize::new(0),
        }
    }
}

impl Gateway {
    pub fn new(storage: Storage, settings: GatewaySettings) -> Self {
        Self {
            storage,
            settings,
            rooms: RwLock::new(HashMap::new()),
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn member_count(&self, thread_id: ThreadId) -> usize {
        self.rooms
            .read()
            .await
            .get(&thread_id)
            .map(|room| room.members.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Runs one upgraded socket until either side goes away.
    pub async fn serve_connection(self: Arc<Self>, socket: WebSocket, user_id: UserId) {
        let (mut sink, mut stream) = socket.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<ServerEvent>(self.settings.outbound_buffer);

        let writer = tokio::spawn(async move {
            while let Some(event) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(error) => {
                        warn!(%error, "dropping unserializable server event");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        info!(%user_id, "realtime connection opened");
        let mut connection = Connection {
            gateway: self,
            user_id,
            outbound,
            joined: None,
        };

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => connection.handle_frame(&text).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(error) => {
                    debug!(%user_id, %error, "realtime transport error");
                    break;
                }
            }
            if connection.outbound.is_closed() {
                break;
            }
        }

        connection.leave().await;
        writer.abort();
        info!(%user_id, "realtime connection closed");
    }

    async fn enter_room(&self, thread_id: ThreadId) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&thread_id) {
                room.members.fetch_add(1, Ordering::AcqRel);
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(thread_id)
            .or_insert_with(|| {
                debug!(%thread_id, "room created");
                Arc::new(Room::new(thread_id, self.settings.room_capacity))
            })
            .clone();
        room.members.fetch_add(1, Ordering::AcqRel);
        room
    }

    async fn leave_room(&self, room: &Arc<Room>) {
        let mut rooms = self.rooms.write().await;
        let remaining = room.members.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        if remaining > 0 {
            return;
        }
        let is_current = rooms
            .get(&room.thread_id)
            .is_some_and(|current| Arc::ptr_eq(current, room));
        if is_current {
            rooms.remove(&room.thread_id);
            debug!(thread_id = %room.thread_id, "empty room pruned");
        }
    }

    async fn history(&self, thread_id: ThreadId) -> Result<ServerEvent, ApiError> {
        history_event(&self.storage, thread_id).await
    }
}

#[async_trait]
impl ThreadEventSink for Gateway {
    async fn thread_deleted(&self, thread_id: ThreadId) {
        let room = self.rooms.write().await.remove(&thread_id);
        let Some(room) = room else {
            debug!(%thread_id, "deleted thread had no live room");
            return;
        };
        let _writer = room.writer.lock().await;
        let receivers = room
            .events
            .send(ServerEvent::ThreadDeleted { thread_id })
            .unwrap_or(0);
        info!(%thread_id, receivers, "thread deletion pushed to room");
    }
}

struct Connection {
    gateway: Arc<Gateway>,
    user_id: UserId,
    outbound: mpsc::Sender<ServerEvent>,
    joined: Option<JoinedRoom>,
}

struct JoinedRoom {
    room: Arc<Room>,
    forwarder: JoinHandle<()>,
}

impl Connection {
    async fn handle_frame(&mut self, text: &str) {
        let request = match serde_json::from_str::<ClientRequest>(text) {
            Ok(request) => request,
            Err(error) => {
                self.reply_error(ApiError::validation(format!("malformed frame: {error}")))
                    .await;
                return;
            }
        };

        let result = match request {
            ClientRequest::Join { thread_id } => self.join(&thread_id).await,
            ClientRequest::Send {
                thread_id,
                sender_id,
                body,
                client_time,
            } => self.send(&thread_id, sender_id, &body, client_time).await,
        };
        if let Err(err) = result {
            debug!(user_id = %self.user_id, code = ?err.code, message = %err.message, "request rejected");
            self.reply_error(err).await;
        }
    }

    async fn join(&mut self, raw_thread_id: &str) -> Result<(), ApiError> {
        let thread_id = parse_thread_id(raw_thread_id)?;
        load_participant_thread(&self.gateway.storage, thread_id, self.user_id).await?;

        if let Some(joined) = &self.joined {
            if joined.room.thread_id == thread_id {
                let room = joined.room.clone();
                let history = {
                    let _writer = room.writer.lock().await;
                    self.gateway.history(thread_id).await?
                };
                self.reply(history).await;
                debug!(%thread_id, user_id = %self.user_id, "history re-sent");
                return Ok(());
            }
        }

        self.leave().await;
        let room = self.gateway.enter_room(thread_id).await;
        let subscribed = {
            let _writer = room.writer.lock().await;
            let receiver = room.events.subscribe();
            self.gateway
                .history(thread_id)
                .await
                .map(|history| (receiver, history))
        };
        let (receiver, history) = match subscribed {
            Ok(subscribed) => subscribed,
            Err(err) => {
                self.gateway.leave_room(&room).await;
                return Err(err);
            }
        };

        self.reply(history).await;
        let forwarder = spawn_forwarder(
            self.gateway.storage.clone(),
            thread_id,
            receiver,
            self.outbound.clone(),
        );
        self.joined = Some(JoinedRoom { room, forwarder });
        info!(%thread_id, user_id = %self.user_id, "joined room");
        Ok(())
    }

    async fn send(
        &mut self,
        raw_thread_id: &str,
        sender_id: UserId,
        body: &str,
        client_time: Option<DateTime<Utc>>,
    ) -> Result<(), ApiError> {
        let thread_id = parse_thread_id(raw_thread_id)?;
        let room = match &self.joined {
            Some(joined) if joined.room.thread_id == thread_id => joined.room.clone(),
            _ => return Err(ApiError::validation("join the thread before sending")),
        };
        if sender_id != self.user_id {
            return Err(ApiError::new(
                ErrorCode::Unauthorized,
                "sender does not match the connected user",
            ));
        }
        load_participant_thread(&self.gateway.storage, thread_id, sender_id).await?;

        let message = {
            let _writer = room.writer.lock().await;
            let stored = self
                .gateway
                .storage
                .append_message(thread_id, Some(sender_id), body)
                .await
                .map_err(store_error)?;
            let message = message_payload(stored);
            let _ = room.events.send(ServerEvent::Message {
                message: message.clone(),
            });
            message
        };

        info!(
            %thread_id,
            %sender_id,
            message_id = %message.message_id,
            client_time = ?client_time,
            "message persisted and broadcast"
        );
        self.reply(ServerEvent::MessageAck(MessageAck {
            thread_id,
            message_id: message.message_id,
            created_at: message.created_at,
            body: message.body,
        }))
        .await;
        Ok(())
    }

    async fn leave(&mut self) {
        if let Some(joined) = self.joined.take() {
            joined.forwarder.abort();
            self.gateway.leave_room(&joined.room).await;
            debug!(thread_id = %joined.room.thread_id, user_id = %self.user_id, "left room");
        }
    }

    async fn reply(&self, event: ServerEvent) {
        if self.outbound.send(event).await.is_err() {
            debug!(user_id = %self.user_id, "outbound queue closed");
        }
    }

    async fn reply_error(&self, err: ApiError) {
        self.reply(ServerEvent::Error(err)).await;
    }
}

/// Pumps room broadcasts into one connection's outbound queue. A lagging member
/// gets a fresh history snapshot instead of a silent gap.
fn spawn_forwarder(
    storage: Storage,
    thread_id: ThreadId,
    receiver: broadcast::Receiver<ServerEvent>,
    outbound: mpsc::Sender<ServerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = BroadcastStream::new(receiver);
        while let Some(item) = events.next().await {
            let event = match item {
                Ok(event) => event,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(%thread_id, skipped, "room member lagged, re-sending history");
                    match history_event(&storage, thread_id).await {
                        Ok(history) => history,
                        Err(err) => ServerEvent::Error(err),
                    }
                }
            };
            let deleted = matches!(event, ServerEvent::ThreadDeleted { .. });
            if outbound.send(event).await.is_err() || deleted {
                break;
            }
        }
    })
}

async fn history_event(storage: &Storage, thread_id: ThreadId) -> Result<ServerEvent, ApiError> {
    let messages = storage
        .list_messages(thread_id)
        .await
        .map_err(store_error)?;
    Ok(ServerEvent::History {
        thread_id,
        messages: messages.into_iter().map(message_payload).collect(),
    })
}

fn parse_thread_id(raw: &str) -> Result<ThreadId, ApiError> {
    raw.parse::<ThreadId>()
        .map_err(|err| ApiError::validation(err.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub user_id: i64,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    let gateway = state.gateway.clone();
    ws.on_upgrade(move |socket| gateway.serve_connection(socket, UserId(q.user_id)))
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
