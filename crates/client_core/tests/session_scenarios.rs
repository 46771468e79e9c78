use std::{net::SocketAddr, sync::Arc, time::Duration};

use client_core::{
    DeliveryState, DirectoryClient, SessionConfig, SessionEvent, SessionHandle, SessionSnapshot,
    SessionState,
};
use server::{gateway::GatewaySettings, AppState};
use shared::domain::{ListingId, ThreadId, UserId};
use storage::Storage;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    addr: SocketAddr,
    renter: UserId,
    owner: UserId,
    thread_id: ThreadId,
}

impl Harness {
    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

async fn start() -> Harness {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let renter = storage.upsert_user("rita").await.expect("renter");
    let owner = storage.upsert_user("omar").await.expect("owner");
    let state = AppState::new(storage, GatewaySettings::default());
    let thread_id =
        directory::find_or_create_thread(&state.directory, Some(ListingId(42)), renter, owner)
            .await
            .expect("thread");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(server::serve(listener, state));

    Harness {
        addr,
        renter,
        owner,
        thread_id,
    }
}

/// TCP relay whose live links can be cut to simulate a dropped transport.
struct Relay {
    addr: SocketAddr,
    links: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Relay {
    async fn start(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
        let addr = listener.local_addr().expect("relay addr");
        let links = Arc::new(Mutex::new(Vec::new()));
        let tracked = links.clone();
        tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                let link = tokio::spawn(async move {
                    if let Ok(mut outbound) = TcpStream::connect(upstream).await {
                        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                    }
                });
                tracked.lock().await.push(link);
            }
        });
        Self { addr, links }
    }

    async fn sever(&self) {
        for link in self.links.lock().await.drain(..) {
            link.abort();
        }
    }
}

fn spawn_session(server_url: String, thread_id: ThreadId, user_id: UserId) -> SessionHandle {
    SessionHandle::spawn(SessionConfig::new(server_url, thread_id, user_id)).expect("spawn session")
}

async fn joined(handle: &SessionHandle) -> SessionSnapshot {
    handle
        .wait_until(WAIT, |snapshot| snapshot.state == SessionState::Joined)
        .await
        .expect("session joined")
}

async fn wait_for_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    wanted: impl Fn(&SessionEvent) -> bool,
) {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("session ended"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

#[tokio::test]
async fn bonjour_is_reconciled_for_sender_and_delivered_to_owner() {
    let h = start().await;
    let renter = spawn_session(h.url(), h.thread_id, h.renter);
    let owner = spawn_session(h.url(), h.thread_id, h.owner);
    assert!(joined(&renter).await.messages.is_empty());
    joined(&owner).await;

    let local_id = renter.send("Bonjour").await.expect("send");
    let snapshot = renter
        .wait_until(WAIT, |snapshot| {
            snapshot
                .messages
                .iter()
                .any(|m| m.local_id == local_id && m.state == DeliveryState::Confirmed)
        })
        .await
        .expect("confirmed");
    let confirmed_id = snapshot.messages[0].message_id.expect("canonical id");

    let seen = owner
        .wait_until(WAIT, |snapshot| {
            snapshot
                .messages
                .iter()
                .any(|m| m.message_id == Some(confirmed_id))
        })
        .await
        .expect("owner received");
    assert_eq!(seen.messages[0].body, "Bonjour");
    assert_eq!(seen.messages[0].sender_id, Some(h.renter));

    // A second round trip guarantees the broadcast copy of "Bonjour" has arrived too.
    let follow_up = renter.send("Ça va ?").await.expect("send");
    let snapshot = renter
        .wait_until(WAIT, |snapshot| {
            snapshot
                .messages
                .iter()
                .any(|m| m.local_id == follow_up && m.state == DeliveryState::Confirmed)
        })
        .await
        .expect("confirmed");
    assert_eq!(snapshot.messages.len(), 2);

    renter.close().await;
    owner.close().await;
}

#[tokio::test]
async fn read_marks_show_up_after_resync() {
    let h = start().await;
    let renter = spawn_session(h.url(), h.thread_id, h.renter);
    let owner = spawn_session(h.url(), h.thread_id, h.owner);
    joined(&renter).await;
    joined(&owner).await;

    owner.send("Is the flat still free?").await.expect("send");
    let snapshot = renter
        .wait_until(WAIT, |snapshot| {
            snapshot.messages.iter().any(|m| m.message_id.is_some())
        })
        .await
        .expect("renter received");
    assert!(!snapshot.messages[0].read);

    let directory = DirectoryClient::new(h.url());
    assert_eq!(
        directory
            .mark_read(h.thread_id, h.renter)
            .await
            .expect("mark read"),
        1
    );
    renter.resync().await.expect("resync");
    let snapshot = renter
        .wait_until(WAIT, |snapshot| snapshot.messages.iter().all(|m| m.read))
        .await
        .expect("read flag refreshed");
    assert_eq!(snapshot.messages.len(), 1);

    renter.close().await;
    owner.close().await;
}

#[tokio::test]
async fn session_rejoins_after_transport_loss_and_merges_history() {
    let h = start().await;
    let relay = Relay::start(h.addr).await;
    let renter = spawn_session(format!("http://{}", relay.addr), h.thread_id, h.renter);
    let owner = spawn_session(h.url(), h.thread_id, h.owner);
    joined(&renter).await;
    joined(&owner).await;

    owner.send("before").await.expect("send");
    renter
        .wait_until(WAIT, |snapshot| snapshot.messages.len() == 1)
        .await
        .expect("first message");

    let mut events = renter.subscribe();
    relay.sever().await;
    wait_for_event(&mut events, |event| {
        *event == SessionEvent::StateChanged(SessionState::Reconnecting)
    })
    .await;
    owner.send("while you were away").await.expect("send");

    let snapshot = renter
        .wait_until(WAIT, |snapshot| {
            snapshot.state == SessionState::Joined && snapshot.messages.len() == 2
        })
        .await
        .expect("rejoined");
    let bodies: Vec<_> = snapshot.messages.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, vec!["before", "while you were away"]);
    assert!(snapshot
        .messages
        .iter()
        .all(|m| m.state == DeliveryState::Confirmed));

    renter.close().await;
    owner.close().await;
}

#[tokio::test]
async fn deleting_the_thread_closes_open_sessions() {
    let h = start().await;
    let renter = spawn_session(h.url(), h.thread_id, h.renter);
    joined(&renter).await;
    renter.send("is the bike still free?").await.expect("send");
    renter
        .wait_until(WAIT, |snapshot| {
            snapshot
                .messages
                .iter()
                .all(|m| m.state == DeliveryState::Confirmed)
                && !snapshot.messages.is_empty()
        })
        .await
        .expect("confirmed");

    let mut events = renter.subscribe();
    DirectoryClient::new(h.url())
        .delete_thread(h.thread_id, h.owner)
        .await
        .expect("delete");

    wait_for_event(&mut events, |event| {
        *event == SessionEvent::ThreadDeleted(h.thread_id)
    })
    .await;
    let snapshot = renter
        .wait_until(WAIT, |snapshot| snapshot.state == SessionState::Closed)
        .await
        .expect("closed");
    assert!(snapshot.messages.is_empty());
    assert!(renter.send("anyone?").await.is_err());
}

#[tokio::test]
async fn joining_a_foreign_thread_closes_with_not_found() {
    let h = start().await;
    let client = DirectoryClient::new(h.url());
    let stranger = client.register_user("sam").await.expect("register");
    let session = spawn_session(h.url(), h.thread_id, stranger);
    let mut events = session.subscribe();

    let snapshot = session
        .wait_until(WAIT, |snapshot| snapshot.state == SessionState::Closed)
        .await
        .expect("closed");
    assert!(snapshot.messages.is_empty());
    // The error may have been published before the subscription, so only check when seen.
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Error(err) = event {
            assert_eq!(err.message, directory::THREAD_NOT_FOUND);
        }
    }
}
