use std::time::Duration;

use chrono::Utc;
use futures::{future::BoxFuture, FutureExt, SinkExt, StreamExt};
use shared::{
    domain::{ThreadId, UserId},
    protocol::{ClientRequest, ServerEvent},
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{ClientError, ClientResult},
    reconnect::ReconnectPolicy,
    session::{ConversationSession, RetryDecision, SessionEvent, SessionSnapshot, SessionState},
    timeline::LocalId,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EXPIRY_TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// HTTP base URL of the messaging server, e.g. `http://127.0.0.1:8443`.
    pub server_url: String,
    pub thread_id: ThreadId,
    pub user_id: UserId,
    pub reconnect: ReconnectPolicy,
    /// How long an optimistic send may stay pending before it is marked failed.
    pub send_timeout: Duration,
    /// Re-join period while joined. `None` disables periodic history refresh.
    pub resync_interval: Option<Duration>,
}

impl SessionConfig {
    pub fn new(server_url: impl Into<String>, thread_id: ThreadId, user_id: UserId) -> Self {
        Self {
            server_url: server_url.into(),
            thread_id,
            user_id,
            reconnect: ReconnectPolicy::default(),
            send_timeout: Duration::from_secs(10),
            resync_interval: None,
        }
    }
}

/// Builds the duplex channel URL for a server base URL.
pub fn websocket_url(server_url: &str, user_id: UserId) -> ClientResult<Url> {
    let invalid = || ClientError::InvalidUrl(server_url.to_string());
    let mut url = Url::parse(server_url).map_err(|_| invalid())?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(invalid()),
    };
    url.set_scheme(scheme).map_err(|_| invalid())?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_fragment(None);
    url.query_pairs_mut()
        .clear()
        .append_pair("user_id", &user_id.0.to_string());
    Ok(url)
}

enum Command {
    Send {
        body: String,
        reply: oneshot::Sender<ClientResult<LocalId>>,
    },
    Resend {
        local_id: LocalId,
        reply: oneshot::Sender<ClientResult<()>>,
    },
    RetryNow,
    Resync,
    Close,
}

/// Owner-side handle of a running conversation session.
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
    snapshot: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Starts connecting immediately. Must be called inside a tokio runtime.
    pub fn spawn(config: SessionConfig) -> ClientResult<Self> {
        let url = websocket_url(&config.server_url, config.user_id)?;
        let session = ConversationSession::new(
            config.thread_id,
            config.user_id,
            config.reconnect,
            config.send_timeout,
        );
        let (commands, command_rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(256);
        let (snapshot_tx, snapshot) = watch::channel(session.snapshot());

        let driver = Driver {
            session,
            url: url.to_string(),
            resync_interval: config.resync_interval,
            events: events.clone(),
            snapshot: snapshot_tx,
            socket: None,
            connecting: None,
            retry_at: None,
            join_deadline: None,
        };
        let task = tokio::spawn(driver.run(command_rx));

        Ok(Self {
            commands,
            events,
            snapshot,
            task,
        })
    }

    /// Queues an optimistic message and returns its local id at once.
    pub async fn send(&self, body: impl Into<String>) -> ClientResult<LocalId> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Send {
            body: body.into(),
            reply,
        })
        .await?;
        response.await.map_err(|_| ClientError::SessionClosed)?
    }

    pub async fn resend(&self, local_id: LocalId) -> ClientResult<()> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Resend { local_id, reply }).await?;
        response.await.map_err(|_| ClientError::SessionClosed)?
    }

    /// Manual reconnect. Restores the retry budget.
    pub async fn retry_now(&self) -> ClientResult<()> {
        self.command(Command::RetryNow).await
    }

    /// Re-requests history so server-side changes such as read marks show up.
    /// Ignored unless joined.
    pub async fn resync(&self) -> ClientResult<()> {
        self.command(Command::Resync).await
    }

    pub async fn close(self) {
        let _ = self.commands.send(Command::Close).await;
        let _ = self.task.await;
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Waits until the published snapshot satisfies `predicate`.
    pub async fn wait_until(
        &self,
        limit: Duration,
        mut predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> ClientResult<SessionSnapshot> {
        let mut receiver = self.snapshot.clone();
        let waited = tokio::time::timeout(limit, receiver.wait_for(|snapshot| predicate(snapshot)))
            .await
            .map_err(|_| ClientError::Timeout("session condition"))?;
        let snapshot = waited.map_err(|_| ClientError::SessionClosed)?;
        Ok(snapshot.clone())
    }

    async fn command(&self, command: Command) -> ClientResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::SessionClosed)
    }
}

struct Driver {
    session: ConversationSession,
    url: String,
    resync_interval: Option<Duration>,
    events: broadcast::Sender<SessionEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
    socket: Option<Socket>,
    connecting: Option<BoxFuture<'static, ClientResult<Socket>>>,
    retry_at: Option<Instant>,
    join_deadline: Option<Instant>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut expiry = tokio::time::interval(EXPIRY_TICK);
        expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut resync = self.resync_interval.map(|period| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        if self.session.begin_connect() {
            self.start_connect();
        }
        self.publish();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => self.session.close(),
                },
                frame = next_frame(&mut self.socket) => self.handle_frame(frame).await,
                result = finish_connect(&mut self.connecting) => {
                    self.connecting = None;
                    self.handle_connected(result).await;
                }
                _ = sleep_until_opt(self.retry_at) => {
                    self.retry_at = None;
                    if self.session.begin_connect() {
                        self.start_connect();
                    }
                }
                _ = sleep_until_opt(self.join_deadline) => {
                    self.join_deadline = None;
                    warn!(thread_id = %self.session.thread_id(), "session: join timed out");
                    self.drop_socket().await;
                    let decision = self.session.on_connect_failed();
                    self.schedule(decision);
                }
                _ = expiry.tick() => {
                    let expired = self.session.expire_pending(std::time::Instant::now());
                    for local_id in expired {
                        debug!(thread_id = %self.session.thread_id(), local_id = local_id.0, "session: send timed out");
                    }
                }
                _ = tick_opt(&mut resync) => {
                    if let Some(request) = self.session.resync_request() {
                        self.send_requests(vec![request]).await;
                    }
                }
            }

            self.publish();
            if self.session.state() == SessionState::Closed {
                break;
            }
        }

        self.drop_socket().await;
        self.connecting = None;
        info!(thread_id = %self.session.thread_id(), "session: closed");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send { body, reply } => {
                match self
                    .session
                    .send(&body, Utc::now(), std::time::Instant::now())
                {
                    Ok((local_id, request)) => {
                        let _ = reply.send(Ok(local_id));
                        self.send_requests(request.into_iter().collect()).await;
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }
            Command::Resend { local_id, reply } => {
                match self.session.resend(local_id, std::time::Instant::now()) {
                    Ok(request) => {
                        let _ = reply.send(Ok(()));
                        self.send_requests(request.into_iter().collect()).await;
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }
            Command::RetryNow => {
                if self.session.retry_now() {
                    info!(thread_id = %self.session.thread_id(), "session: manual retry");
                    self.retry_at = None;
                    self.start_connect();
                }
            }
            Command::Resync => {
                if let Some(request) = self.session.resync_request() {
                    self.send_requests(vec![request]).await;
                }
            }
            Command::Close => self.session.close(),
        }
    }

    async fn handle_frame(&mut self, frame: Option<Result<Message, tungstenite::Error>>) {
        match frame {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerEvent>(&text) {
                Ok(event) => {
                    let requests = self.session.on_server_event(event);
                    if self.session.state() == SessionState::Joined {
                        self.join_deadline = None;
                    }
                    self.send_requests(requests).await;
                }
                Err(err) => {
                    warn!(thread_id = %self.session.thread_id(), "session: ignoring malformed server frame: {err}");
                }
            },
            Some(Ok(Message::Close(_))) | None => self.transport_lost().await,
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                warn!(thread_id = %self.session.thread_id(), "session: websocket error: {err}");
                self.transport_lost().await;
            }
        }
    }

    async fn handle_connected(&mut self, result: ClientResult<Socket>) {
        match result {
            Ok(socket) => {
                debug!(thread_id = %self.session.thread_id(), "session: connected, joining");
                self.socket = Some(socket);
                let deadline = Instant::now() + self.session.policy().attempt_timeout;
                self.join_deadline = Some(deadline);
                let join = self.session.join_request();
                self.send_requests(vec![join]).await;
            }
            Err(err) => {
                warn!(thread_id = %self.session.thread_id(), "session: connect failed: {err}");
                let decision = self.session.on_connect_failed();
                self.schedule(decision);
            }
        }
    }

    async fn send_requests(&mut self, requests: Vec<ClientRequest>) {
        for request in requests {
            let Some(socket) = self.socket.as_mut() else {
                return;
            };
            let outcome = match serde_json::to_string(&request) {
                Ok(text) => socket.send(Message::Text(text)).await.map_err(ClientError::from),
                Err(err) => Err(ClientError::from(err)),
            };
            if let Err(err) = outcome {
                warn!(thread_id = %self.session.thread_id(), "session: failed to send frame: {err}");
                self.transport_lost().await;
                return;
            }
        }
    }

    async fn transport_lost(&mut self) {
        self.socket = None;
        self.join_deadline = None;
        let decision = self.session.on_transport_lost();
        self.schedule(decision);
    }

    fn start_connect(&mut self) {
        let url = self.url.clone();
        let limit = self.session.policy().attempt_timeout;
        self.connecting = Some(
            async move {
                let (socket, _) = tokio::time::timeout(limit, connect_async(url.as_str()))
                    .await
                    .map_err(|_| ClientError::Timeout("websocket connect"))??;
                Ok(socket)
            }
            .boxed(),
        );
    }

    fn schedule(&mut self, decision: RetryDecision) {
        self.retry_at = match decision {
            RetryDecision::RetryAfter(delay) => Some(Instant::now() + delay),
            RetryDecision::GiveUp | RetryDecision::Stop => None,
        };
    }

    async fn drop_socket(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
        }
    }

    fn publish(&mut self) {
        for event in self.session.drain_events() {
            let _ = self.events.send(event);
        }
        let next = self.session.snapshot();
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn next_frame(socket: &mut Option<Socket>) -> Option<Result<Message, tungstenite::Error>> {
    match socket {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}

async fn finish_connect(
    connecting: &mut Option<BoxFuture<'static, ClientResult<Socket>>>,
) -> ClientResult<Socket> {
    match connecting {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
