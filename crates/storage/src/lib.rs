use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use tracing::debug;

use shared::domain::{
    ListingId, MessageId, ParticipantRole, SupportContact, ThreadId, ThreadKind, UserId,
};

/// Longest thread preview kept on the thread row, in characters.
pub const PREVIEW_MAX_CHARS: usize = 140;

const THREAD_COLUMNS: &str = "t.id, t.kind, t.listing_id, t.renter_id, t.owner_id, t.metadata, \
     t.last_message, t.last_sender_id, t.last_activity_at, t.created_at";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("conflicting record: {0}")]
    Conflict(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredThread {
    pub thread_id: ThreadId,
    pub kind: ThreadKind,
    pub listing_id: Option<ListingId>,
    pub renter_id: Option<UserId>,
    pub owner_id: Option<UserId>,
    pub metadata: Value,
    pub last_message: Option<String>,
    pub last_sender_id: Option<UserId>,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl StoredThread {
    pub fn role_of(&self, user_id: UserId) -> Option<ParticipantRole> {
        if self.renter_id == Some(user_id) {
            Some(ParticipantRole::Renter)
        } else if self.owner_id == Some(user_id) {
            Some(ParticipantRole::Owner)
        } else {
            None
        }
    }

    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.role_of(user_id).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub thread_id: ThreadId,
    pub sender_id: Option<UserId>,
    pub body: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewThread {
    pub kind: ThreadKind,
    pub listing_id: Option<ListingId>,
    pub renter_id: Option<UserId>,
    pub owner_id: Option<UserId>,
    pub metadata: Value,
}

impl NewThread {
    pub fn direct(listing_id: Option<ListingId>, renter_id: UserId, owner_id: UserId) -> Self {
        Self {
            kind: ThreadKind::Direct,
            listing_id,
            renter_id: Some(renter_id),
            owner_id: Some(owner_id),
            metadata: Value::Object(Default::default()),
        }
    }
}

/// A thread as seen by one participant, with the derived unread counter.
#[derive(Debug, Clone)]
pub struct ThreadOverview {
    pub thread: StoredThread,
    pub role: ParticipantRole,
    pub other_participant_name: Option<String>,
    pub unread_count: u64,
}

impl Storage {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid database url '{database_url}'"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        // Every in-memory connection would otherwise contend on one shared cache.
        let max_connections = if database_url.starts_with("sqlite::memory:") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open sqlite database '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run storage migrations")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> anyhow::Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn upsert_user(&self, display_name: &str) -> StoreResult<UserId> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(StoreError::Validation(
                "display name must not be empty".into(),
            ));
        }
        let rec = sqlx::query(
            "INSERT INTO users (display_name) VALUES (?)
             ON CONFLICT(display_name) DO UPDATE SET display_name=excluded.display_name
             RETURNING id",
        )
        .bind(display_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.try_get::<i64, _>(0)?))
    }

    pub async fn display_name(&self, user_id: UserId) -> StoreResult<Option<String>> {
        let row = sqlx::query("SELECT display_name FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    /// Inserts a new thread. Hitting a uniqueness key yields [`StoreError::Conflict`];
    /// callers that want idempotence use the `find_or_create_*` variants.
    pub async fn create_thread(&self, new: NewThread) -> StoreResult<StoredThread> {
        validate_new_thread(&new)?;
        let support_email = support_email_of(&new)?;
        let thread_id = ThreadId::random();
        let now = Utc::now();
        let metadata = serde_json::to_string(&new.metadata)
            .map_err(|e| StoreError::Validation(format!("metadata is not serializable: {e}")))?;

        let inserted = sqlx::query(
            "INSERT INTO threads (id, kind, listing_id, renter_id, owner_id, support_email, metadata, last_activity_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(thread_id.to_string())
        .bind(new.kind.as_str())
        .bind(new.listing_id.map(|l| l.0))
        .bind(new.renter_id.map(|u| u.0))
        .bind(new.owner_id.map(|u| u.0))
        .bind(support_email)
        .bind(metadata)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(StoreError::Conflict(format!(
                    "a {} thread with the same key already exists",
                    new.kind.as_str()
                )));
            }
            Err(err) => return Err(err.into()),
        }

        debug!(%thread_id, kind = new.kind.as_str(), "thread created");
        Ok(StoredThread {
            thread_id,
            kind: new.kind,
            listing_id: new.listing_id,
            renter_id: new.renter_id,
            owner_id: new.owner_id,
            metadata: new.metadata,
            last_message: None,
            last_sender_id: None,
            last_activity_at: now,
            created_at: now,
        })
    }

    /// Exact lookup on the direct-thread uniqueness key.
    pub async fn find_thread(
        &self,
        listing_id: Option<ListingId>,
        renter_id: UserId,
        owner_id: UserId,
    ) -> StoreResult<Option<StoredThread>> {
        let row = sqlx::query(&format!(
            "SELECT {THREAD_COLUMNS} FROM threads t
             WHERE t.kind = 'direct' AND IFNULL(t.listing_id, 0) = ? AND t.renter_id = ? AND t.owner_id = ?"
        ))
        .bind(listing_key(listing_id))
        .bind(renter_id.0)
        .bind(owner_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(thread_from_row).transpose()
    }

    /// Returns the direct thread for the key, creating it if absent. The boolean is
    /// true when this call inserted the row. Concurrent callers race on the unique
    /// index, so every caller resolves to the same thread.
    pub async fn find_or_create_direct_thread(
        &self,
        listing_id: Option<ListingId>,
        renter_id: UserId,
        owner_id: UserId,
    ) -> StoreResult<(StoredThread, bool)> {
        validate_new_thread(&NewThread::direct(listing_id, renter_id, owner_id))?;
        let candidate = ThreadId::random();
        let now = Utc::now();

        let inserted = sqlx::query(
            "INSERT INTO threads (id, kind, listing_id, renter_id, owner_id, metadata, last_activity_at, created_at)
             VALUES (?, 'direct', ?, ?, ?, '{}', ?, ?)
             ON CONFLICT DO NOTHING
             RETURNING id",
        )
        .bind(candidate.to_string())
        .bind(listing_id.map(|l| l.0))
        .bind(renter_id.0)
        .bind(owner_id.0)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let created = inserted.is_some();
        let thread = self
            .find_thread(listing_id, renter_id, owner_id)
            .await?
            .ok_or_else(|| {
                StoreError::Conflict("direct thread vanished during find-or-create".into())
            })?;
        if created {
            debug!(thread_id = %thread.thread_id, %renter_id, %owner_id, "direct thread created");
        }
        Ok((thread, created))
    }

    /// Support threads are keyed by the normalized contact email.
    pub async fn find_or_create_support_thread(
        &self,
        contact: &SupportContact,
    ) -> StoreResult<(StoredThread, bool)> {
        let email = contact.normalized_email();
        if email.is_empty() {
            return Err(StoreError::Validation("contact email is required".into()));
        }
        let metadata = serde_json::to_string(contact)
            .map_err(|e| StoreError::Validation(format!("contact is not serializable: {e}")))?;
        let now = Utc::now();

        let inserted = sqlx::query(
            "INSERT INTO threads (id, kind, support_email, metadata, last_activity_at, created_at)
             VALUES (?, 'support', ?, ?, ?, ?)
             ON CONFLICT DO NOTHING
             RETURNING id",
        )
        .bind(ThreadId::random().to_string())
        .bind(&email)
        .bind(metadata)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {THREAD_COLUMNS} FROM threads t WHERE t.kind = 'support' AND t.support_email = ?"
        ))
        .bind(&email)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::Conflict("support thread vanished during find-or-create".into()))?;
        Ok((thread_from_row(&row)?, inserted.is_some()))
    }

    pub async fn load_thread(&self, thread_id: ThreadId) -> StoreResult<Option<StoredThread>> {
        let row = sqlx::query(&format!("SELECT {THREAD_COLUMNS} FROM threads t WHERE t.id = ?"))
            .bind(thread_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(thread_from_row).transpose()
    }

    /// Persists a message and refreshes the thread preview in one transaction, so a
    /// reader never observes a preview older than the newest message.
    pub async fn append_message(
        &self,
        thread_id: ThreadId,
        sender_id: Option<UserId>,
        body: &str,
    ) -> StoreResult<StoredMessage> {
        if body.trim().is_empty() {
            return Err(StoreError::Validation(
                "message body must not be empty".into(),
            ));
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "INSERT INTO messages (thread_id, sender_id, body, is_read, created_at)
             SELECT ?1, ?2, ?3, 0, ?4
             WHERE EXISTS (SELECT 1 FROM threads WHERE id = ?1)
             RETURNING id",
        )
        .bind(thread_id.to_string())
        .bind(sender_id.map(|u| u.0))
        .bind(body)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Err(StoreError::NotFound("thread"));
        };
        let message_id = MessageId(row.try_get::<i64, _>(0)?);

        sqlx::query(
            "UPDATE threads SET last_message = ?, last_sender_id = ?, last_activity_at = ? WHERE id = ?",
        )
        .bind(preview_of(body))
        .bind(sender_id.map(|u| u.0))
        .bind(now)
        .bind(thread_id.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(StoredMessage {
            message_id,
            thread_id,
            sender_id,
            body: body.to_string(),
            read: false,
            created_at: now,
        })
    }

    /// Full history in persistence order.
    pub async fn list_messages(&self, thread_id: ThreadId) -> StoreResult<Vec<StoredMessage>> {
        let mut tx = self.pool.begin().await?;
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM threads WHERE id = ?")
            .bind(thread_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            tx.rollback().await?;
            return Err(StoreError::NotFound("thread"));
        }

        let rows = sqlx::query(
            "SELECT id, thread_id, sender_id, body, is_read, created_at
             FROM messages
             WHERE thread_id = ?
             ORDER BY id ASC",
        )
        .bind(thread_id.to_string())
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        rows.iter().map(message_from_row).collect()
    }

    /// Marks every unread message not authored by `reader_id` as read.
    pub async fn mark_read(&self, thread_id: ThreadId, reader_id: UserId) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE messages SET is_read = 1
             WHERE thread_id = ? AND is_read = 0 AND (sender_id IS NULL OR sender_id != ?)",
        )
        .bind(thread_id.to_string())
        .bind(reader_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_thread(&self, thread_id: ThreadId) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let messages = sqlx::query("DELETE FROM messages WHERE thread_id = ?")
            .bind(thread_id.to_string())
            .execute(&mut *tx)
            .await?;
        let threads = sqlx::query("DELETE FROM threads WHERE id = ?")
            .bind(thread_id.to_string())
            .execute(&mut *tx)
            .await?;
        if threads.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::NotFound("thread"));
        }
        tx.commit().await?;
        debug!(%thread_id, messages = messages.rows_affected(), "thread deleted");
        Ok(())
    }

    /// Threads the user takes part in, newest activity first, each annotated with its
    /// unread counter. One statement; counts are aggregated in SQL.
    pub async fn list_threads_for_user(
        &self,
        user_id: UserId,
        role: Option<ParticipantRole>,
    ) -> StoreResult<Vec<ThreadOverview>> {
        let role_filter = match role {
            None => "any",
            Some(ParticipantRole::Renter) => "renter",
            Some(ParticipantRole::Owner) => "owner",
        };
        let rows = sqlx::query(&format!(
            "SELECT {THREAD_COLUMNS},
                    other.display_name AS other_participant_name,
                    COALESCE(unread.unread_count, 0) AS unread_count
             FROM threads t
             LEFT JOIN (
                 SELECT m.thread_id, COUNT(*) AS unread_count
                 FROM messages m
                 INNER JOIN threads mt ON mt.id = m.thread_id
                 WHERE (mt.renter_id = ?1 OR mt.owner_id = ?1)
                   AND m.is_read = 0
                   AND (m.sender_id IS NULL OR m.sender_id != ?1)
                 GROUP BY m.thread_id
             ) unread ON unread.thread_id = t.id
             LEFT JOIN users other
                 ON other.id = CASE WHEN t.renter_id = ?1 THEN t.owner_id ELSE t.renter_id END
             WHERE (t.renter_id = ?1 AND ?2 IN ('any', 'renter'))
                OR (t.owner_id = ?1 AND ?2 IN ('any', 'owner'))
             ORDER BY t.last_activity_at DESC, t.created_at DESC"
        ))
        .bind(user_id.0)
        .bind(role_filter)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> StoreResult<ThreadOverview> {
                let thread = thread_from_row(row)?;
                let role = thread.role_of(user_id).ok_or_else(|| {
                    StoreError::Corrupt(format!(
                        "thread {} listed for non-participant",
                        thread.thread_id
                    ))
                })?;
                Ok(ThreadOverview {
                    role,
                    other_participant_name: row.try_get("other_participant_name")?,
                    unread_count: row.try_get::<i64, _>("unread_count")?.max(0) as u64,
                    thread,
                })
            })
            .collect()
    }

    /// Unread counter per thread for every thread the user participates in,
    /// including threads with nothing unread.
    pub async fn unread_counts_for_user(
        &self,
        user_id: UserId,
    ) -> StoreResult<Vec<(ThreadId, u64)>> {
        let rows = sqlx::query(
            "SELECT t.id, COUNT(m.id) AS unread_count
             FROM threads t
             LEFT JOIN messages m
                 ON m.thread_id = t.id
                AND m.is_read = 0
                AND (m.sender_id IS NULL OR m.sender_id != ?1)
             WHERE t.renter_id = ?1 OR t.owner_id = ?1
             GROUP BY t.id",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> StoreResult<(ThreadId, u64)> {
                let thread_id = parse_thread_id(&row.try_get::<String, _>(0)?)?;
                let count = row.try_get::<i64, _>(1)?.max(0) as u64;
                Ok((thread_id, count))
            })
            .collect()
    }
}

fn validate_new_thread(new: &NewThread) -> StoreResult<()> {
    if new.kind != ThreadKind::Direct {
        return Ok(());
    }
    match (new.renter_id, new.owner_id) {
        (Some(renter), Some(owner)) if renter == owner => Err(StoreError::Validation(
            "renter and owner must be different users".into(),
        )),
        (Some(_), Some(_)) => Ok(()),
        _ => Err(StoreError::Validation(
            "direct threads require both a renter and an owner".into(),
        )),
    }
}

fn support_email_of(new: &NewThread) -> StoreResult<Option<String>> {
    if new.kind != ThreadKind::Support {
        return Ok(None);
    }
    let email = new
        .metadata
        .get("email")
        .and_then(Value::as_str)
        .map(|e| e.trim().to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .ok_or_else(|| StoreError::Validation("support threads require a contact email".into()))?;
    Ok(Some(email))
}

fn listing_key(listing_id: Option<ListingId>) -> i64 {
    listing_id.map(|l| l.0).unwrap_or(0)
}

fn preview_of(body: &str) -> String {
    body.chars().take(PREVIEW_MAX_CHARS).collect()
}

fn parse_thread_id(raw: &str) -> StoreResult<ThreadId> {
    raw.parse::<ThreadId>()
        .map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn thread_from_row(row: &SqliteRow) -> StoreResult<StoredThread> {
    let thread_id = parse_thread_id(&row.try_get::<String, _>("id")?)?;
    let raw_kind: String = row.try_get("kind")?;
    let kind = ThreadKind::parse(&raw_kind)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown thread kind {raw_kind:?}")))?;
    let raw_metadata: String = row.try_get("metadata")?;
    let metadata = serde_json::from_str(&raw_metadata)
        .map_err(|e| StoreError::Corrupt(format!("thread {thread_id} metadata: {e}")))?;

    Ok(StoredThread {
        thread_id,
        kind,
        listing_id: row.try_get::<Option<i64>, _>("listing_id")?.map(ListingId),
        renter_id: row.try_get::<Option<i64>, _>("renter_id")?.map(UserId),
        owner_id: row.try_get::<Option<i64>, _>("owner_id")?.map(UserId),
        metadata,
        last_message: row.try_get("last_message")?,
        last_sender_id: row.try_get::<Option<i64>, _>("last_sender_id")?.map(UserId),
        last_activity_at: row.try_get("last_activity_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> StoreResult<StoredMessage> {
    Ok(StoredMessage {
        message_id: MessageId(row.try_get::<i64, _>("id")?),
        thread_id: parse_thread_id(&row.try_get::<String, _>("thread_id")?)?,
        sender_id: row.try_get::<Option<i64>, _>("sender_id")?.map(UserId),
        body: row.try_get("body")?,
        read: row.try_get("is_read")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Creates the parent directory of a file-backed SQLite URL. Memory and
/// non-sqlite URLs are left alone.
pub fn ensure_sqlite_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
