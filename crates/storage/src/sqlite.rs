use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use tracing::debug;

use shared::domain::{
    Channel, ChannelConfig, Cid, Member, Message, MessageId, Reaction, SyncStatus, User, UserId,
};
use shared::protocol::MessageBoundary;
use shared::query::{Filter, QuerySpec, Sort};

use crate::{page_sorted_messages, CacheStore, StoreError, StoreResult};

/// SQLite-backed cache store for sessions with offline persistence enabled.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn new(database_url: &str) -> StoreResult<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options =
            SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        debug!(database_url, "sqlite cache store opened");
        Ok(store)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id             TEXT PRIMARY KEY,
                name           TEXT NOT NULL,
                image          TEXT,
                online         INTEGER NOT NULL DEFAULT 0,
                last_active_ms INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS channels (
                cid                TEXT PRIMARY KEY,
                created_by         TEXT,
                created_at_ms      INTEGER NOT NULL,
                last_message_at_ms INTEGER,
                members            TEXT NOT NULL,
                reads              TEXT NOT NULL,
                hidden             INTEGER NOT NULL DEFAULT 0,
                deleted            INTEGER NOT NULL DEFAULT 0,
                sync_status        TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id              TEXT PRIMARY KEY,
                cid             TEXT NOT NULL,
                user_id         TEXT NOT NULL,
                body            TEXT NOT NULL,
                created_at_ms   INTEGER NOT NULL,
                deleted         INTEGER NOT NULL DEFAULT 0,
                reactions       TEXT NOT NULL,
                reaction_counts TEXT NOT NULL,
                sync_status     TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_window ON messages (cid, created_at_ms, id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reactions (
                message_id    TEXT NOT NULL,
                user_id       TEXT NOT NULL,
                kind          TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                deleted       INTEGER NOT NULL DEFAULT 0,
                sync_status   TEXT NOT NULL,
                PRIMARY KEY (message_id, user_id, kind)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS channel_configs (
                channel_type TEXT PRIMARY KEY,
                config       TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS query_specs (
                id     TEXT PRIMARY KEY,
                filter TEXT NOT NULL,
                sort   TEXT NOT NULL,
                cids   TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session (
                id      INTEGER PRIMARY KEY CHECK (id = 1),
                user_id TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn select_messages_rows(&self, cid: &Cid) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT id, cid, user_id, body, created_at_ms, deleted, reactions, reaction_counts, sync_status
             FROM messages
             WHERE cid = ?
             ORDER BY created_at_ms ASC, id ASC",
        )
        .bind(cid.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(message_from_row).collect()
    }
}

#[async_trait]
impl CacheStore for SqliteStore {
    async fn upsert_user(&self, user: User) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO users (id, name, image, online, last_active_ms)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                image = excluded.image,
                online = excluded.online,
                last_active_ms = excluded.last_active_ms",
        )
        .bind(user.id.as_str())
        .bind(&user.name)
        .bind(&user.image)
        .bind(user.online)
        .bind(user.last_active.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_users(&self, users: Vec<User>) -> StoreResult<()> {
        for user in users {
            self.upsert_user(user).await?;
        }
        Ok(())
    }

    async fn select_user(&self, id: &UserId) -> StoreResult<Option<User>> {
        let row = sqlx::query(
            "SELECT id, name, image, online, last_active_ms FROM users WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(user_from_row).transpose()
    }

    async fn select_users(&self, ids: &[UserId]) -> StoreResult<Vec<User>> {
        let mut users = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(user) = self.select_user(id).await? {
                users.push(user);
            }
        }
        Ok(users)
    }

    async fn upsert_channel(&self, channel: Channel) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO channels (cid, created_by, created_at_ms, last_message_at_ms, members, reads, hidden, deleted, sync_status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(cid) DO UPDATE SET
                created_by = excluded.created_by,
                created_at_ms = excluded.created_at_ms,
                last_message_at_ms = excluded.last_message_at_ms,
                members = excluded.members,
                reads = excluded.reads,
                hidden = excluded.hidden,
                deleted = excluded.deleted,
                sync_status = excluded.sync_status",
        )
        .bind(channel.cid.to_string())
        .bind(channel.created_by.as_ref().map(|u| u.as_str().to_string()))
        .bind(channel.created_at.timestamp_millis())
        .bind(channel.last_message_at.map(|t| t.timestamp_millis()))
        .bind(serde_json::to_string(&channel.members)?)
        .bind(serde_json::to_string(&channel.reads)?)
        .bind(channel.hidden)
        .bind(channel.deleted)
        .bind(status_to_str(channel.sync_status))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_channels(&self, channels: Vec<Channel>) -> StoreResult<()> {
        for channel in channels {
            self.upsert_channel(channel).await?;
        }
        Ok(())
    }

    async fn select_channel(&self, cid: &Cid) -> StoreResult<Option<Channel>> {
        let row = sqlx::query(
            "SELECT cid, created_by, created_at_ms, last_message_at_ms, members, reads, hidden, deleted, sync_status
             FROM channels WHERE cid = ?",
        )
        .bind(cid.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(channel_from_row).transpose()
    }

    async fn select_channels(&self, cids: &[Cid]) -> StoreResult<Vec<Channel>> {
        let mut channels = Vec::with_capacity(cids.len());
        for cid in cids {
            if let Some(channel) = self.select_channel(cid).await? {
                channels.push(channel);
            }
        }
        Ok(channels)
    }

    async fn select_pending_sync_channels(&self) -> StoreResult<Vec<Channel>> {
        let rows = sqlx::query(
            "SELECT cid, created_by, created_at_ms, last_message_at_ms, members, reads, hidden, deleted, sync_status
             FROM channels WHERE sync_status != 'synced' ORDER BY cid ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(channel_from_row).collect()
    }

    async fn upsert_message(&self, message: Message) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO messages (id, cid, user_id, body, created_at_ms, deleted, reactions, reaction_counts, sync_status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                cid = excluded.cid,
                user_id = excluded.user_id,
                body = excluded.body,
                created_at_ms = excluded.created_at_ms,
                deleted = excluded.deleted,
                reactions = excluded.reactions,
                reaction_counts = excluded.reaction_counts,
                sync_status = excluded.sync_status",
        )
        .bind(message.id.as_str())
        .bind(message.cid.to_string())
        .bind(message.user_id.as_str())
        .bind(&message.text)
        .bind(message.created_at.timestamp_millis())
        .bind(message.deleted)
        .bind(serde_json::to_string(&message.reactions)?)
        .bind(serde_json::to_string(&message.reaction_counts)?)
        .bind(status_to_str(message.sync_status))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_messages(&self, messages: Vec<Message>) -> StoreResult<()> {
        for message in messages {
            self.upsert_message(message).await?;
        }
        Ok(())
    }

    async fn select_message(&self, id: &MessageId) -> StoreResult<Option<Message>> {
        let row = sqlx::query(
            "SELECT id, cid, user_id, body, created_at_ms, deleted, reactions, reaction_counts, sync_status
             FROM messages WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(message_from_row).transpose()
    }

    async fn select_messages(&self, ids: &[MessageId]) -> StoreResult<Vec<Message>> {
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(message) = self.select_message(id).await? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    async fn select_messages_for_cid(
        &self,
        cid: &Cid,
        limit: u32,
        boundary: Option<&MessageBoundary>,
    ) -> StoreResult<Vec<Message>> {
        // The window per channel is small; fetch ordered and page in memory
        // so boundary semantics stay identical across store backends.
        let window = self.select_messages_rows(cid).await?;
        Ok(page_sorted_messages(window, limit, boundary))
    }

    async fn select_pending_sync_messages(&self) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT id, cid, user_id, body, created_at_ms, deleted, reactions, reaction_counts, sync_status
             FROM messages WHERE sync_status != 'synced' ORDER BY created_at_ms ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(message_from_row).collect()
    }

    async fn upsert_reaction(&self, reaction: Reaction) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO reactions (message_id, user_id, kind, created_at_ms, deleted, sync_status)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(message_id, user_id, kind) DO UPDATE SET
                created_at_ms = excluded.created_at_ms,
                deleted = excluded.deleted,
                sync_status = excluded.sync_status",
        )
        .bind(reaction.message_id.as_str())
        .bind(reaction.user_id.as_str())
        .bind(&reaction.kind)
        .bind(reaction.created_at.timestamp_millis())
        .bind(reaction.deleted)
        .bind(status_to_str(reaction.sync_status))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn select_reaction(
        &self,
        message_id: &MessageId,
        user_id: &UserId,
        kind: &str,
    ) -> StoreResult<Option<Reaction>> {
        let row = sqlx::query(
            "SELECT message_id, user_id, kind, created_at_ms, deleted, sync_status
             FROM reactions WHERE message_id = ? AND user_id = ? AND kind = ?",
        )
        .bind(message_id.as_str())
        .bind(user_id.as_str())
        .bind(kind)
        .fetch_optional(&self.pool)
        .await?;
        row.map(reaction_from_row).transpose()
    }

    async fn select_pending_sync_reactions(&self) -> StoreResult<Vec<Reaction>> {
        let rows = sqlx::query(
            "SELECT message_id, user_id, kind, created_at_ms, deleted, sync_status
             FROM reactions WHERE sync_status != 'synced'
             ORDER BY created_at_ms ASC, message_id ASC, user_id ASC, kind ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(reaction_from_row).collect()
    }

    async fn upsert_config(&self, config: ChannelConfig) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO channel_configs (channel_type, config) VALUES (?, ?)
             ON CONFLICT(channel_type) DO UPDATE SET config = excluded.config",
        )
        .bind(&config.channel_type)
        .bind(serde_json::to_string(&config)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_configs(&self, configs: Vec<ChannelConfig>) -> StoreResult<()> {
        for config in configs {
            self.upsert_config(config).await?;
        }
        Ok(())
    }

    async fn select_config(&self, channel_type: &str) -> StoreResult<Option<ChannelConfig>> {
        let row = sqlx::query("SELECT config FROM channel_configs WHERE channel_type = ?")
            .bind(channel_type)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Ok(serde_json::from_str(&r.get::<String, _>(0))?))
            .transpose()
    }

    async fn select_configs(&self) -> StoreResult<Vec<ChannelConfig>> {
        let rows =
            sqlx::query("SELECT config FROM channel_configs ORDER BY channel_type ASC")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|r| Ok(serde_json::from_str(&r.get::<String, _>(0))?))
            .collect()
    }

    async fn upsert_query(&self, spec: QuerySpec) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO query_specs (id, filter, sort, cids) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                filter = excluded.filter,
                sort = excluded.sort,
                cids = excluded.cids",
        )
        .bind(&spec.id)
        .bind(serde_json::to_string(&spec.filter)?)
        .bind(serde_json::to_string(&spec.sort)?)
        .bind(serde_json::to_string(&spec.cids)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn select_query(&self, id: &str) -> StoreResult<Option<QuerySpec>> {
        let row = sqlx::query("SELECT id, filter, sort, cids FROM query_specs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let filter: Filter = serde_json::from_str(&r.get::<String, _>(1))?;
            let sort: Sort = serde_json::from_str(&r.get::<String, _>(2))?;
            let cids: Vec<Cid> = serde_json::from_str(&r.get::<String, _>(3))?;
            Ok(QuerySpec {
                id: r.get::<String, _>(0),
                filter,
                sort,
                cids,
            })
        })
        .transpose()
    }

    async fn select_session_user(&self) -> StoreResult<Option<UserId>> {
        let row = sqlx::query("SELECT user_id FROM session WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| UserId::new(r.get::<String, _>(0))))
    }

    async fn upsert_session_user(&self, user_id: &UserId) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO session (id, user_id) VALUES (1, ?)
             ON CONFLICT(id) DO UPDATE SET user_id = excluded.user_id",
        )
        .bind(user_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn status_to_str(status: SyncStatus) -> &'static str {
    match status {
        SyncStatus::None => "none",
        SyncStatus::InProgress => "in_progress",
        SyncStatus::Synced => "synced",
        SyncStatus::Failed => "failed",
    }
}

fn status_from_str(value: &str) -> StoreResult<SyncStatus> {
    match value {
        "none" => Ok(SyncStatus::None),
        "in_progress" => Ok(SyncStatus::InProgress),
        "synced" => Ok(SyncStatus::Synced),
        "failed" => Ok(SyncStatus::Failed),
        other => Err(StoreError::Corrupt(format!(
            "unknown sync status '{other}'"
        ))),
    }
}

fn datetime_from_ms(ms: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn cid_from_str(value: &str) -> StoreResult<Cid> {
    value
        .parse()
        .map_err(|err: shared::domain::CidParseError| StoreError::Corrupt(err.to_string()))
}

fn user_from_row(row: sqlx::sqlite::SqliteRow) -> StoreResult<User> {
    Ok(User {
        id: UserId::new(row.get::<String, _>(0)),
        name: row.get::<String, _>(1),
        image: row.get::<Option<String>, _>(2),
        online: row.get::<bool, _>(3),
        last_active: row
            .get::<Option<i64>, _>(4)
            .map(datetime_from_ms)
            .transpose()?,
    })
}

fn channel_from_row(row: sqlx::sqlite::SqliteRow) -> StoreResult<Channel> {
    let members: HashMap<UserId, Member> = serde_json::from_str(&row.get::<String, _>(4))?;
    let reads: HashMap<UserId, DateTime<Utc>> = serde_json::from_str(&row.get::<String, _>(5))?;
    Ok(Channel {
        cid: cid_from_str(&row.get::<String, _>(0))?,
        created_by: row.get::<Option<String>, _>(1).map(UserId::new),
        created_at: datetime_from_ms(row.get::<i64, _>(2))?,
        last_message_at: row
            .get::<Option<i64>, _>(3)
            .map(datetime_from_ms)
            .transpose()?,
        members,
        reads,
        hidden: row.get::<bool, _>(6),
        deleted: row.get::<bool, _>(7),
        sync_status: status_from_str(&row.get::<String, _>(8))?,
    })
}

fn message_from_row(row: sqlx::sqlite::SqliteRow) -> StoreResult<Message> {
    let reactions: Vec<Reaction> = serde_json::from_str(&row.get::<String, _>(6))?;
    let reaction_counts: HashMap<String, u32> = serde_json::from_str(&row.get::<String, _>(7))?;
    Ok(Message {
        id: MessageId::new(row.get::<String, _>(0)),
        cid: cid_from_str(&row.get::<String, _>(1))?,
        user_id: UserId::new(row.get::<String, _>(2)),
        text: row.get::<String, _>(3),
        created_at: datetime_from_ms(row.get::<i64, _>(4))?,
        deleted: row.get::<bool, _>(5),
        reactions,
        reaction_counts,
        sync_status: status_from_str(&row.get::<String, _>(8))?,
    })
}

fn reaction_from_row(row: sqlx::sqlite::SqliteRow) -> StoreResult<Reaction> {
    Ok(Reaction {
        message_id: MessageId::new(row.get::<String, _>(0)),
        user_id: UserId::new(row.get::<String, _>(1)),
        kind: row.get::<String, _>(2),
        created_at: datetime_from_ms(row.get::<i64, _>(3))?,
        deleted: row.get::<bool, _>(4),
        sync_status: status_from_str(&row.get::<String, _>(5))?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> StoreResult<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).map_err(|err| {
        StoreError::Corrupt(format!(
            "failed to create parent directory '{}' for database url '{database_url}': {err}",
            parent.display()
        ))
    })
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
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
