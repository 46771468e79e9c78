use std::{collections::HashMap, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use client_core::{
    DeliveryState, DirectoryClient, LocalId, SessionEvent, SessionHandle, SessionSnapshot,
    SessionState,
};
use shared::domain::{ListingId, ThreadId, UserId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    /// Display name to sign in as.
    #[arg(long)]
    name: String,
    /// Join this thread directly instead of opening one with `--peer`.
    #[arg(long)]
    thread_id: Option<String>,
    /// Display name of the other participant.
    #[arg(long)]
    peer: Option<String>,
    #[arg(long, value_enum, default_value = "renter")]
    role: Role,
    #[arg(long)]
    listing_id: Option<i64>,
    /// Seconds between history refreshes while connected.
    #[arg(long)]
    resync_secs: Option<u64>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Role {
    Renter,
    Owner,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("warn"))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let directory = DirectoryClient::new(args.server_url.clone());
    let user_id = directory.register_user(&args.name).await?;
    let thread_id = resolve_thread(&directory, &args, user_id).await?;
    println!("signed in as {} (user_id={})", args.name, user_id.0);
    println!("thread {thread_id}  commands: /retry /resend <id> /read /quit");

    let mut config = directory.session_config(thread_id, user_id);
    config.resync_interval = args.resync_secs.map(Duration::from_secs);
    let session = SessionHandle::spawn(config)?;
    let printer = tokio::spawn(print_updates(session.subscribe(), session.watch()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let outcome = match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/retry", _) => session.retry_now().await,
            ("/read", _) => match directory.mark_read(thread_id, user_id).await {
                Ok(updated) => {
                    println!("* marked {updated} message(s) read");
                    session.resync().await
                }
                Err(err) => Err(err),
            },
            ("/resend", raw) => match raw.trim().parse::<u64>() {
                Ok(id) => session.resend(LocalId(id)).await,
                Err(_) => {
                    println!("! usage: /resend <id>");
                    Ok(())
                }
            },
            _ => session.send(line).await.map(|_| ()),
        };
        if let Err(err) = outcome {
            println!("! {err}");
        }
        if session.state() == SessionState::Closed {
            break;
        }
    }

    session.close().await;
    printer.abort();
    Ok(())
}

async fn resolve_thread(
    directory: &DirectoryClient,
    args: &Args,
    user_id: UserId,
) -> Result<ThreadId> {
    if let Some(raw) = &args.thread_id {
        return raw
            .parse()
            .with_context(|| format!("invalid thread id {raw:?}"));
    }
    let Some(peer) = &args.peer else {
        bail!("either --thread-id or --peer is required");
    };
    let peer_id = directory.register_user(peer).await?;
    let (renter_id, owner_id) = match args.role {
        Role::Renter => (user_id, peer_id),
        Role::Owner => (peer_id, user_id),
    };
    let thread_id = directory
        .open_thread(args.listing_id.map(ListingId), renter_id, owner_id)
        .await?;
    Ok(thread_id)
}

async fn print_updates(
    mut events: broadcast::Receiver<SessionEvent>,
    snapshots: tokio::sync::watch::Receiver<SessionSnapshot>,
) {
    let mut shown: HashMap<LocalId, (DeliveryState, bool)> = HashMap::new();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "chat: missed session events");
                SessionEvent::TimelineUpdated
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        match event {
            SessionEvent::StateChanged(state) => println!("* {}", describe(state)),
            SessionEvent::TimelineUpdated => {
                let snapshot = snapshots.borrow().clone();
                render_changes(&mut shown, &snapshot);
            }
            SessionEvent::SendFailed(local_id) => {
                println!("! message [{local_id}] was not delivered, /resend {local_id}")
            }
            SessionEvent::RetriesExhausted { attempts } => {
                println!("! gave up after {attempts} attempts, /retry to reconnect")
            }
            SessionEvent::ThreadDeleted(thread_id) => {
                println!("* thread {thread_id} was deleted")
            }
            SessionEvent::Error(err) => println!("! server: {}", err.message),
        }
    }
}

fn render_changes(shown: &mut HashMap<LocalId, (DeliveryState, bool)>, snapshot: &SessionSnapshot) {
    for message in &snapshot.messages {
        let seen = (message.state, message.read);
        if shown.get(&message.local_id) == Some(&seen) {
            continue;
        }
        let marker = match message.state {
            DeliveryState::Pending => "…",
            DeliveryState::Confirmed => "✓",
            DeliveryState::Failed => "✗",
        };
        let sender = message
            .sender_id
            .map(|id| id.0.to_string())
            .unwrap_or_else(|| "support".to_string());
        let read = if message.read { " (read)" } else { "" };
        println!(
            "[{}] {} {sender}: {} {marker}{read}",
            message.local_id,
            message.created_at.format("%H:%M:%S"),
            message.body
        );
        shown.insert(message.local_id, seen);
    }
}

fn describe(state: SessionState) -> &'static str {
    match state {
        SessionState::Idle => "idle",
        SessionState::Connecting => "connecting…",
        SessionState::Joined => "connected",
        SessionState::Reconnecting => "connection lost, retrying automatically",
        SessionState::Suspended => "offline",
        SessionState::Closed => "conversation closed",
    }
}
