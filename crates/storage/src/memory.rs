use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use shared::domain::{
    Channel, ChannelConfig, Cid, Message, MessageId, Reaction, User, UserId,
};
use shared::protocol::MessageBoundary;
use shared::query::QuerySpec;

use crate::{page_sorted_messages, CacheStore, StoreResult};

/// Cache store for sessions with persistence disabled. Everything lives in
/// process memory behind one writer lock, which also gives per-id write
/// linearization by arrival order.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<UserId, User>,
    channels: HashMap<Cid, Channel>,
    messages: HashMap<MessageId, Message>,
    reactions: HashMap<(MessageId, UserId, String), Reaction>,
    configs: HashMap<String, ChannelConfig>,
    queries: HashMap<String, QuerySpec>,
    session_user: Option<UserId>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn upsert_user(&self, user: User) -> StoreResult<()> {
        self.inner.write().await.users.insert(user.id.clone(), user);
        Ok(())
    }

    async fn upsert_users(&self, users: Vec<User>) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        for user in users {
            inner.users.insert(user.id.clone(), user);
        }
        Ok(())
    }

    async fn select_user(&self, id: &UserId) -> StoreResult<Option<User>> {
        Ok(self.inner.read().await.users.get(id).cloned())
    }

    async fn select_users(&self, ids: &[UserId]) -> StoreResult<Vec<User>> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.users.get(id).cloned())
            .collect())
    }

    async fn upsert_channel(&self, channel: Channel) -> StoreResult<()> {
        self.inner
            .write()
            .await
            .channels
            .insert(channel.cid.clone(), channel);
        Ok(())
    }

    async fn upsert_channels(&self, channels: Vec<Channel>) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        for channel in channels {
            inner.channels.insert(channel.cid.clone(), channel);
        }
        Ok(())
    }

    async fn select_channel(&self, cid: &Cid) -> StoreResult<Option<Channel>> {
        Ok(self.inner.read().await.channels.get(cid).cloned())
    }

    async fn select_channels(&self, cids: &[Cid]) -> StoreResult<Vec<Channel>> {
        let inner = self.inner.read().await;
        Ok(cids
            .iter()
            .filter_map(|cid| inner.channels.get(cid).cloned())
            .collect())
    }

    async fn select_pending_sync_channels(&self) -> StoreResult<Vec<Channel>> {
        let inner = self.inner.read().await;
        let mut pending: Vec<Channel> = inner
            .channels
            .values()
            .filter(|c| c.sync_status.is_pending())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.cid.cmp(&b.cid));
        Ok(pending)
    }

    async fn upsert_message(&self, message: Message) -> StoreResult<()> {
        self.inner
            .write()
            .await
            .messages
            .insert(message.id.clone(), message);
        Ok(())
    }

    async fn upsert_messages(&self, messages: Vec<Message>) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        for message in messages {
            inner.messages.insert(message.id.clone(), message);
        }
        Ok(())
    }

    async fn select_message(&self, id: &MessageId) -> StoreResult<Option<Message>> {
        Ok(self.inner.read().await.messages.get(id).cloned())
    }

    async fn select_messages(&self, ids: &[MessageId]) -> StoreResult<Vec<Message>> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.messages.get(id).cloned())
            .collect())
    }

    async fn select_messages_for_cid(
        &self,
        cid: &Cid,
        limit: u32,
        boundary: Option<&MessageBoundary>,
    ) -> StoreResult<Vec<Message>> {
        let inner = self.inner.read().await;
        let window: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| &m.cid == cid)
            .cloned()
            .collect();
        Ok(page_sorted_messages(window, limit, boundary))
    }

    async fn select_pending_sync_messages(&self) -> StoreResult<Vec<Message>> {
        let inner = self.inner.read().await;
        let mut pending: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| m.sync_status.is_pending())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Ok(pending)
    }

    async fn upsert_reaction(&self, reaction: Reaction) -> StoreResult<()> {
        let key = (
            reaction.message_id.clone(),
            reaction.user_id.clone(),
            reaction.kind.clone(),
        );
        self.inner.write().await.reactions.insert(key, reaction);
        Ok(())
    }

    async fn select_reaction(
        &self,
        message_id: &MessageId,
        user_id: &UserId,
        kind: &str,
    ) -> StoreResult<Option<Reaction>> {
        let key = (message_id.clone(), user_id.clone(), kind.to_string());
        Ok(self.inner.read().await.reactions.get(&key).cloned())
    }

    async fn select_pending_sync_reactions(&self) -> StoreResult<Vec<Reaction>> {
        let inner = self.inner.read().await;
        let mut pending: Vec<Reaction> = inner
            .reactions
            .values()
            .filter(|r| r.sync_status.is_pending())
            .cloned()
            .collect();
        pending.sort_by(|a, b| (a.created_at, a.key()).cmp(&(b.created_at, b.key())));
        Ok(pending)
    }

    async fn upsert_config(&self, config: ChannelConfig) -> StoreResult<()> {
        self.inner
            .write()
            .await
            .configs
            .insert(config.channel_type.clone(), config);
        Ok(())
    }

    async fn upsert_configs(&self, configs: Vec<ChannelConfig>) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        for config in configs {
            inner.configs.insert(config.channel_type.clone(), config);
        }
        Ok(())
    }

    async fn select_config(&self, channel_type: &str) -> StoreResult<Option<ChannelConfig>> {
        Ok(self.inner.read().await.configs.get(channel_type).cloned())
    }

    async fn select_configs(&self) -> StoreResult<Vec<ChannelConfig>> {
        let inner = self.inner.read().await;
        let mut configs: Vec<ChannelConfig> = inner.configs.values().cloned().collect();
        configs.sort_by(|a, b| a.channel_type.cmp(&b.channel_type));
        Ok(configs)
    }

    async fn upsert_query(&self, spec: QuerySpec) -> StoreResult<()> {
        self.inner
            .write()
            .await
            .queries
            .insert(spec.id.clone(), spec);
        Ok(())
    }

    async fn select_query(&self, id: &str) -> StoreResult<Option<QuerySpec>> {
        Ok(self.inner.read().await.queries.get(id).cloned())
    }

    async fn select_session_user(&self) -> StoreResult<Option<UserId>> {
        Ok(self.inner.read().await.session_user.clone())
    }

    async fn upsert_session_user(&self, user_id: &UserId) -> StoreResult<()> {
        self.inner.write().await.session_user = Some(user_id.clone());
        Ok(())
    }
}
