use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::warn;

use shared::domain::{
    Channel, ChannelConfig, Cid, Member, Message, MessageId, Reaction, SyncStatus, UserId,
};
use shared::protocol::{ChannelSnapshot, Event, EventKind, MessageBoundary, MessagePage, PageDirection};
use storage::CacheStore;

use crate::reconcile;
use crate::remote::RemoteClient;
use crate::sync::{SyncHandle, SyncJob};
use crate::{ClientError, ErrorEvent, SessionState};

/// Live state of one watched channel.
///
/// All reads go through watch channels: a new subscriber immediately sees
/// the latest value and then every update. Mutations are optimistic; the
/// cache and the observable state change before the server is involved, and
/// the sync coordinator reports back by rewriting the entity's sync status.
pub struct ChannelController {
    cid: Cid,
    session: Arc<SessionState>,
    store: Arc<dyn CacheStore>,
    remote: Arc<dyn RemoteClient>,
    sync: SyncHandle,
    messages: watch::Sender<Vec<Message>>,
    channel: watch::Sender<Option<Channel>>,
    reads: watch::Sender<HashMap<UserId, DateTime<Utc>>>,
    unread: watch::Sender<u32>,
    loading: watch::Sender<bool>,
}

impl ChannelController {
    pub(crate) fn new(
        cid: Cid,
        session: Arc<SessionState>,
        store: Arc<dyn CacheStore>,
        remote: Arc<dyn RemoteClient>,
        sync: SyncHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            cid,
            session,
            store,
            remote,
            sync,
            messages: watch::channel(Vec::new()).0,
            channel: watch::channel(None).0,
            reads: watch::channel(HashMap::new()).0,
            unread: watch::channel(0).0,
            loading: watch::channel(false).0,
        })
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn messages(&self) -> watch::Receiver<Vec<Message>> {
        self.messages.subscribe()
    }

    pub fn channel(&self) -> watch::Receiver<Option<Channel>> {
        self.channel.subscribe()
    }

    pub fn reads(&self) -> watch::Receiver<HashMap<UserId, DateTime<Utc>>> {
        self.reads.subscribe()
    }

    /// Messages in the window from other users that the session user has not
    /// read yet, per their own read pointer.
    pub fn unread_count(&self) -> watch::Receiver<u32> {
        self.unread.subscribe()
    }

    pub fn loading(&self) -> watch::Receiver<bool> {
        self.loading.subscribe()
    }

    /// Capabilities for this channel's type, as last declared by the server.
    pub async fn config(&self) -> Option<ChannelConfig> {
        self.session.channel_config(&self.cid.channel_type).await
    }

    /// Recomputes the unread counter from the current window and the session
    /// user's read pointer. Own messages never count.
    fn refresh_unread(&self) {
        let me = &self.session.user.id;
        let read_until = self.reads.borrow().get(me).copied();
        let count = self
            .messages
            .borrow()
            .iter()
            .filter(|m| !m.deleted && m.user_id != *me)
            .filter(|m| read_until.map_or(true, |until| m.created_at > until))
            .count() as u32;
        self.unread.send_replace(count);
    }

    /// Starts (or refreshes) the watch on this channel.
    ///
    /// Online, the server snapshot is ingested and cached. Offline, or when
    /// the fetch fails, the cached state is served instead; a channel the
    /// cache has never seen is created locally and queued for replay, which
    /// is how channels are created while offline. Never fails on network
    /// trouble.
    pub async fn watch(&self, page: MessagePage) -> Result<(), ClientError> {
        self.loading.send_replace(true);
        let result = self.watch_inner(page).await;
        self.loading.send_replace(false);
        result
    }

    async fn watch_inner(&self, page: MessagePage) -> Result<(), ClientError> {
        if self.session.is_online() {
            match self.remote.watch_channel(&self.cid, page.clone()).await {
                Ok(snapshot) => return self.ingest_snapshot(snapshot).await,
                Err(error) => {
                    warn!(cid = %self.cid, %error, "watch failed, serving cached state");
                    if !error.is_transient() {
                        self.session.emit_error(ErrorEvent {
                            cid: Some(self.cid.clone()),
                            context: "watch_channel".into(),
                            error,
                        });
                    }
                }
            }
        }
        self.ensure_local_channel(Utc::now()).await?;
        self.hydrate_from_cache(page.limit).await
    }

    /// Folds a server snapshot into the cache and the observable state.
    pub(crate) async fn ingest_snapshot(&self, snapshot: ChannelSnapshot) -> Result<(), ClientError> {
        let ChannelSnapshot {
            mut channel,
            messages,
            users,
            config,
        } = snapshot;

        channel.sync_status = SyncStatus::Synced;
        let cached = self.store.select_channel(&self.cid).await?;
        let merged = reconcile::merge_channel(cached, channel);

        self.store.upsert_users(users).await?;
        if let Some(config) = config {
            self.session.cache_config(config.clone()).await;
            self.store.upsert_config(config).await?;
        }
        self.store.upsert_channel(merged.clone()).await?;

        let mut confirmed = Vec::with_capacity(messages.len());
        for mut message in messages {
            message.sync_status = SyncStatus::Synced;
            let cached = self.store.select_message(&message.id).await?;
            confirmed.push(reconcile::merge_message(cached, message));
        }
        self.store.upsert_messages(confirmed.clone()).await?;

        // Union with whatever is already on screen: local pending sends stay
        // visible next to the server page.
        self.messages.send_modify(|window| {
            for message in confirmed {
                reconcile::upsert_into_window(window, message);
            }
        });
        self.reads.send_replace(merged.reads.clone());
        self.channel.send_replace(Some(merged));
        self.refresh_unread();
        Ok(())
    }

    async fn hydrate_from_cache(&self, limit: u32) -> Result<(), ClientError> {
        let cached = self
            .store
            .select_messages_for_cid(&self.cid, limit, None)
            .await?;
        self.messages.send_modify(|window| {
            for message in cached {
                reconcile::upsert_into_window(window, message);
            }
        });
        if let Some(channel) = self.store.select_channel(&self.cid).await? {
            self.reads.send_replace(channel.reads.clone());
            self.channel.send_replace(Some(channel));
        }
        self.refresh_unread();
        Ok(())
    }

    /// Creates the local channel row when the cache has none, queued for
    /// replay so the server learns about it on the next opportunity.
    async fn ensure_local_channel(&self, at: DateTime<Utc>) -> Result<Channel, ClientError> {
        if let Some(existing) = self.store.select_channel(&self.cid).await? {
            return Ok(existing);
        }
        let me = &self.session.user;
        let mut channel = Channel::new(self.cid.clone(), at);
        channel.created_by = Some(me.id.clone());
        channel
            .members
            .insert(me.id.clone(), Member::new(me.id.clone(), at));
        channel.sync_status = SyncStatus::InProgress;
        self.store.upsert_channel(channel.clone()).await?;
        self.channel.send_replace(Some(channel.clone()));
        self.sync.submit(SyncJob::Channel(channel.clone()));
        Ok(channel)
    }

    /// Optimistic send. The message appears in the window and the cache as
    /// `InProgress` before any network traffic, and this call never fails on
    /// network trouble; delivery is the sync coordinator's job.
    pub async fn send_message(&self, mut message: Message) -> Result<Message, ClientError> {
        if message.id.is_empty() {
            message.id = MessageId::generate(&self.session.user.id);
            message.created_at = Utc::now();
        }
        if message.user_id.is_empty() {
            message.user_id = self.session.user.id.clone();
        }
        message.cid = self.cid.clone();
        message.sync_status = SyncStatus::InProgress;
        reconcile::recount_reactions(&mut message);

        let mut channel = self.ensure_local_channel(message.created_at).await?;
        if reconcile::bump_last_message_at(&mut channel, message.created_at) {
            self.store.upsert_channel(channel.clone()).await?;
            self.channel.send_replace(Some(channel));
        }

        self.store.upsert_message(message.clone()).await?;
        self.messages
            .send_modify(|window| reconcile::upsert_into_window(window, message.clone()));
        self.sync.submit(SyncJob::Message(message.clone()));
        Ok(message)
    }

    /// Optimistic reaction add: set and counts update together, locally and
    /// in the cache, then the reaction is queued for delivery.
    pub async fn send_reaction(
        &self,
        message_id: MessageId,
        kind: &str,
    ) -> Result<Reaction, ClientError> {
        let Some(mut message) = self.store.select_message(&message_id).await? else {
            return Err(ClientError::UnknownMessage(message_id));
        };
        let mut reaction = Reaction::new(message_id, self.session.user.id.clone(), kind);
        reaction.sync_status = SyncStatus::InProgress;

        reconcile::apply_reaction_added(&mut message, reaction.clone());
        self.store.upsert_message(message.clone()).await?;
        self.store.upsert_reaction(reaction.clone()).await?;
        self.messages
            .send_modify(|window| reconcile::upsert_into_window(window, message));
        self.sync.submit(SyncJob::Reaction(reaction.clone()));
        Ok(reaction)
    }

    /// Optimistic reaction removal. The reaction row stays in the cache as a
    /// tombstone until the server confirms the removal.
    pub async fn delete_reaction(&self, message_id: MessageId, kind: &str) -> Result<(), ClientError> {
        let Some(mut message) = self.store.select_message(&message_id).await? else {
            return Err(ClientError::UnknownMessage(message_id));
        };
        let me = self.session.user.id.clone();
        let mut reaction = match self.store.select_reaction(&message_id, &me, kind).await? {
            Some(existing) => existing,
            None => Reaction::new(message_id, me, kind),
        };
        reaction.deleted = true;
        reaction.sync_status = SyncStatus::InProgress;

        reconcile::apply_reaction_removed(&mut message, &reaction);
        self.store.upsert_message(message.clone()).await?;
        self.store.upsert_reaction(reaction.clone()).await?;
        self.messages
            .send_modify(|window| reconcile::upsert_into_window(window, message));
        self.sync.submit(SyncJob::Reaction(reaction));
        Ok(())
    }

    /// Extends the window by one page in the given direction. The boundary
    /// is the current window edge and is excluded from the result. Offline,
    /// the page comes from the cache.
    pub async fn load_more_messages(
        &self,
        limit: u32,
        direction: PageDirection,
    ) -> Result<(), ClientError> {
        let boundary = {
            let window = self.messages.borrow();
            match direction {
                PageDirection::Older => window.first().map(|m| MessageBoundary::IdLessThan(m.id.clone())),
                PageDirection::Newer => window.last().map(|m| MessageBoundary::IdGreaterThan(m.id.clone())),
            }
        };
        let Some(boundary) = boundary else {
            // Empty window: same as a fresh first page.
            return self.watch(MessagePage::first(limit)).await;
        };

        let page = MessagePage {
            limit,
            boundary: Some(boundary.clone()),
        };
        if self.session.is_online() {
            match self.remote.watch_channel(&self.cid, page).await {
                Ok(snapshot) => return self.ingest_snapshot(snapshot).await,
                Err(error) => {
                    warn!(cid = %self.cid, %error, "page fetch failed, serving cached page");
                }
            }
        }

        let cached = self
            .store
            .select_messages_for_cid(&self.cid, limit, Some(&boundary))
            .await?;
        self.messages.send_modify(|window| {
            for message in cached {
                reconcile::upsert_into_window(window, message);
            }
        });
        self.refresh_unread();
        Ok(())
    }

    /// Server-confirmed state pushed back by the sync coordinator.
    pub(crate) fn apply_message_update(&self, message: Message) {
        self.messages
            .send_modify(|window| reconcile::upsert_into_window(window, message));
        self.refresh_unread();
    }

    pub(crate) fn apply_channel_update(&self, channel: Channel) {
        self.reads.send_replace(channel.reads.clone());
        self.channel.send_replace(Some(channel));
        self.refresh_unread();
    }

    /// Applies one stream event to the live state. Events for other channels
    /// are ignored; persistence is the router's job, not ours.
    pub(crate) fn handle_event(&self, event: &Event) {
        if event.cid() != Some(&self.cid) {
            return;
        }
        match &event.kind {
            EventKind::MessageNew { message, .. } | EventKind::MessageUpdated { message, .. } => {
                let mut message = message.clone();
                message.sync_status = SyncStatus::Synced;
                reconcile::recount_reactions(&mut message);
                let created_at = message.created_at;
                self.messages
                    .send_modify(|window| reconcile::upsert_into_window(window, message));
                self.channel.send_modify(|channel| {
                    if let Some(channel) = channel {
                        reconcile::bump_last_message_at(channel, created_at);
                    }
                });
            }
            EventKind::MessageDeleted { message, .. } => {
                self.messages.send_modify(|window| {
                    if let Some(existing) = window.iter_mut().find(|m| m.id == message.id) {
                        existing.deleted = true;
                        existing.sync_status = SyncStatus::Synced;
                    }
                });
            }
            EventKind::ReactionNew { reaction, .. } => {
                self.messages.send_modify(|window| {
                    if let Some(message) =
                        window.iter_mut().find(|m| m.id == reaction.message_id)
                    {
                        let mut reaction = reaction.clone();
                        reaction.sync_status = SyncStatus::Synced;
                        reconcile::apply_reaction_added(message, reaction);
                    }
                });
            }
            EventKind::ReactionDeleted { reaction, .. } => {
                self.messages.send_modify(|window| {
                    if let Some(message) =
                        window.iter_mut().find(|m| m.id == reaction.message_id)
                    {
                        reconcile::apply_reaction_removed(message, reaction);
                    }
                });
            }
            EventKind::MemberAdded { member, .. } | EventKind::MemberUpdated { member, .. } => {
                self.channel.send_modify(|channel| {
                    if let Some(channel) = channel {
                        reconcile::apply_member_upserted(channel, member.clone());
                    }
                });
            }
            EventKind::MemberRemoved { user_id, .. } => {
                self.channel.send_modify(|channel| {
                    if let Some(channel) = channel {
                        reconcile::apply_member_removed(channel, user_id);
                    }
                });
            }
            EventKind::ChannelUpdated { channel, .. } => {
                let mut incoming = channel.clone();
                incoming.sync_status = SyncStatus::Synced;
                self.channel.send_modify(|current| {
                    let merged = reconcile::merge_channel(current.take(), incoming);
                    *current = Some(merged);
                });
                let reads = self
                    .channel
                    .borrow()
                    .as_ref()
                    .map(|c| c.reads.clone())
                    .unwrap_or_default();
                self.reads.send_replace(reads);
            }
            EventKind::ChannelHidden { .. } => {
                self.channel.send_modify(|channel| {
                    if let Some(channel) = channel {
                        channel.hidden = true;
                    }
                });
            }
            EventKind::ChannelDeleted { .. } => {
                self.channel.send_modify(|channel| {
                    if let Some(channel) = channel {
                        channel.deleted = true;
                    }
                });
            }
            EventKind::MessageRead {
                user_id,
                created_at,
                ..
            } => {
                // Published reads are derived from the channel;
                // `reconcile::apply_read` owns the monotonic rule.
                self.channel.send_modify(|channel| {
                    if let Some(channel) = channel {
                        reconcile::apply_read(channel, user_id, *created_at);
                    }
                });
                let reads = self.channel.borrow().as_ref().map(|c| c.reads.clone());
                if let Some(reads) = reads {
                    self.reads.send_replace(reads);
                }
            }
            EventKind::Connected { .. }
            | EventKind::Disconnected
            | EventKind::UserPresenceChanged { .. }
            | EventKind::UserUpdated { .. } => {}
        }
        self.refresh_unread();
    }
}
