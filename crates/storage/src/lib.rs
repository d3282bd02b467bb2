use async_trait::async_trait;
use thiserror::Error;

use shared::domain::{
    Channel, ChannelConfig, Cid, Message, MessageId, Reaction, User, UserId,
};
use shared::protocol::MessageBoundary;
use shared::query::QuerySpec;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database failure: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt cached row: {0}")]
    Corrupt(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable cache of chat entities.
///
/// Upserts are idempotent: writing the same id twice leaves the later value,
/// never a duplicate row. Nothing is physically deleted here; deletions
/// arrive as tombstone flags on the entity itself. Writes to a given id are
/// linearized by arrival order inside each implementation.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn upsert_user(&self, user: User) -> StoreResult<()>;
    async fn upsert_users(&self, users: Vec<User>) -> StoreResult<()>;
    async fn select_user(&self, id: &UserId) -> StoreResult<Option<User>>;
    /// Order-preserving per input; unknown ids are skipped.
    async fn select_users(&self, ids: &[UserId]) -> StoreResult<Vec<User>>;

    async fn upsert_channel(&self, channel: Channel) -> StoreResult<()>;
    async fn upsert_channels(&self, channels: Vec<Channel>) -> StoreResult<()>;
    async fn select_channel(&self, cid: &Cid) -> StoreResult<Option<Channel>>;
    async fn select_channels(&self, cids: &[Cid]) -> StoreResult<Vec<Channel>>;
    async fn select_pending_sync_channels(&self) -> StoreResult<Vec<Channel>>;

    async fn upsert_message(&self, message: Message) -> StoreResult<()>;
    async fn upsert_messages(&self, messages: Vec<Message>) -> StoreResult<()>;
    async fn select_message(&self, id: &MessageId) -> StoreResult<Option<Message>>;
    async fn select_messages(&self, ids: &[MessageId]) -> StoreResult<Vec<Message>>;
    /// Window slice for one channel, ascending by (created_at, id).
    ///
    /// No boundary returns the newest `limit` messages. A boundary pages
    /// strictly before or after the boundary message; an unknown boundary id
    /// yields an empty page.
    async fn select_messages_for_cid(
        &self,
        cid: &Cid,
        limit: u32,
        boundary: Option<&MessageBoundary>,
    ) -> StoreResult<Vec<Message>>;
    async fn select_pending_sync_messages(&self) -> StoreResult<Vec<Message>>;

    async fn upsert_reaction(&self, reaction: Reaction) -> StoreResult<()>;
    async fn select_reaction(
        &self,
        message_id: &MessageId,
        user_id: &UserId,
        kind: &str,
    ) -> StoreResult<Option<Reaction>>;
    async fn select_pending_sync_reactions(&self) -> StoreResult<Vec<Reaction>>;

    async fn upsert_config(&self, config: ChannelConfig) -> StoreResult<()>;
    async fn upsert_configs(&self, configs: Vec<ChannelConfig>) -> StoreResult<()>;
    async fn select_config(&self, channel_type: &str) -> StoreResult<Option<ChannelConfig>>;
    /// All known configs, for the startup load into the session cache.
    async fn select_configs(&self) -> StoreResult<Vec<ChannelConfig>>;

    async fn upsert_query(&self, spec: QuerySpec) -> StoreResult<()>;
    async fn select_query(&self, id: &str) -> StoreResult<Option<QuerySpec>>;

    /// Identity the cache was written under; a session opened for a
    /// different user against the same store is a construction-time error.
    async fn select_session_user(&self) -> StoreResult<Option<UserId>>;
    async fn upsert_session_user(&self, user_id: &UserId) -> StoreResult<()>;
}

/// Shared windowing logic: both stores page an ascending message sequence
/// the same way.
pub(crate) fn page_sorted_messages(
    mut messages: Vec<Message>,
    limit: u32,
    boundary: Option<&MessageBoundary>,
) -> Vec<Message> {
    messages.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    let limit = limit as usize;
    match boundary {
        None => {
            let skip = messages.len().saturating_sub(limit);
            messages.split_off(skip)
        }
        Some(MessageBoundary::IdLessThan(id)) => {
            let Some(pos) = messages.iter().position(|m| &m.id == id) else {
                return Vec::new();
            };
            let mut older = messages;
            older.truncate(pos);
            let skip = older.len().saturating_sub(limit);
            older.split_off(skip)
        }
        Some(MessageBoundary::IdGreaterThan(id)) => {
            let Some(pos) = messages.iter().position(|m| &m.id == id) else {
                return Vec::new();
            };
            messages.into_iter().skip(pos + 1).take(limit).collect()
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
