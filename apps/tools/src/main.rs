use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use shared::domain::{ListingId, ParticipantRole, ThreadId, UserId};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/messaging.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    AddUser {
        display_name: String,
    },
    OpenThread {
        #[arg(long)]
        listing_id: Option<i64>,
        renter_id: i64,
        owner_id: i64,
    },
    Threads {
        user_id: i64,
        #[arg(long, value_enum)]
        role: Option<RoleArg>,
    },
    History {
        thread_id: String,
    },
    DeleteThread {
        thread_id: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RoleArg {
    Renter,
    Owner,
}

impl From<RoleArg> for ParticipantRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Renter => ParticipantRole::Renter,
            RoleArg::Owner => ParticipantRole::Owner,
        }
    }
}

fn parse_thread_id(raw: &str) -> Result<ThreadId> {
    raw.parse()
        .with_context(|| format!("invalid thread id {raw:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url)
        .await
        .with_context(|| format!("failed to open {}", cli.database_url))?;

    match cli.command {
        Command::AddUser { display_name } => {
            let user_id = storage.upsert_user(&display_name).await?;
            println!("user_id={}", user_id.0);
        }
        Command::OpenThread {
            listing_id,
            renter_id,
            owner_id,
        } => {
            let (thread, created) = storage
                .find_or_create_direct_thread(
                    listing_id.map(ListingId),
                    UserId(renter_id),
                    UserId(owner_id),
                )
                .await?;
            let verb = if created { "created" } else { "existing" };
            println!("{verb} thread_id={}", thread.thread_id);
        }
        Command::Threads { user_id, role } => {
            let threads = storage
                .list_threads_for_user(UserId(user_id), role.map(ParticipantRole::from))
                .await?;
            for overview in threads {
                println!(
                    "{} {:?} with={} unread={} last={:?}",
                    overview.thread.thread_id,
                    overview.role,
                    overview
                        .other_participant_name
                        .as_deref()
                        .unwrap_or("-"),
                    overview.unread_count,
                    overview.thread.last_message.as_deref().unwrap_or(""),
                );
            }
        }
        Command::History { thread_id } => {
            let thread_id = parse_thread_id(&thread_id)?;
            for message in storage.list_messages(thread_id).await? {
                let sender = message
                    .sender_id
                    .map(|id| id.0.to_string())
                    .unwrap_or_else(|| "anonymous".to_string());
                let read = if message.read { "read" } else { "unread" };
                println!(
                    "#{} {} {sender} ({read}): {}",
                    message.message_id.0,
                    message.created_at.to_rfc3339(),
                    message.body
                );
            }
        }
        Command::DeleteThread { thread_id } => {
            let thread_id = parse_thread_id(&thread_id)?;
            storage.delete_thread(thread_id).await?;
            println!("deleted thread_id={thread_id}");
        }
    }

    Ok(())
}
