use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info};

use shared::protocol::{Event, EventKind};
use storage::CacheStore;

use crate::reconcile;
use crate::sync::{SyncHandle, SyncJob};
use crate::{ClientError, Registry, SessionState};

/// Fans one stream event out in a fixed order: session counters first, then
/// the live channel controller, then every live query, then the cache. The
/// cache write comes last so controllers always observe the pre-event cached
/// state when they need it.
pub(crate) struct EventRouter {
    session: Arc<SessionState>,
    registry: Arc<Registry>,
    store: Arc<dyn CacheStore>,
    sync: SyncHandle,
}

impl EventRouter {
    pub(crate) fn new(
        session: Arc<SessionState>,
        registry: Arc<Registry>,
        store: Arc<dyn CacheStore>,
        sync: SyncHandle,
    ) -> Self {
        Self {
            session,
            registry,
            store,
            sync,
        }
    }

    pub(crate) async fn handle(&self, event: Event) -> Result<(), ClientError> {
        if let Some(total) = event.total_unread_count {
            self.session.total_unread.send_replace(total);
        }
        if let Some(channels) = event.unread_channels {
            self.session.unread_channels.send_replace(channels);
        }

        match &event.kind {
            EventKind::Connected { me } => {
                info!(user_id = %me.id, "connection established");
                self.session.online.send_replace(true);
                let first_connect = !self.session.initialized.swap(true, Ordering::SeqCst);
                if !first_connect {
                    // A reconnect of an already initialized session: the
                    // stream has a gap, run full recovery.
                    self.sync.submit(SyncJob::Recover);
                }
            }
            EventKind::Disconnected => {
                info!("connection lost");
                self.session.online.send_replace(false);
            }
            _ => {}
        }

        if let Some(cid) = event.cid() {
            if let Some(controller) = self.registry.channel_if_active(cid).await {
                controller.handle_event(&event);
            } else {
                debug!(%cid, "no live controller for event channel");
            }
        }

        for query in self.registry.queries().await {
            query.handle_event(&event).await?;
        }

        if self.session.config.persistence_enabled {
            self.persist(&event).await?;
        }
        Ok(())
    }

    /// Folds the event into the cache. Events touching entities the cache
    /// has never seen are dropped; the gap is local-only and recovery or the
    /// next fetch repairs it.
    async fn persist(&self, event: &Event) -> Result<(), ClientError> {
        match &event.kind {
            EventKind::Connected { me } => {
                self.store.upsert_user(me.clone()).await?;
            }
            EventKind::Disconnected => {}
            EventKind::MessageNew { cid, message } | EventKind::MessageUpdated { cid, message } => {
                let mut incoming = message.clone();
                incoming.sync_status = shared::domain::SyncStatus::Synced;
                let cached = self.store.select_message(&incoming.id).await?;
                let merged = reconcile::merge_message(cached, incoming);
                let created_at = merged.created_at;
                self.store.upsert_message(merged).await?;
                if let Some(mut channel) = self.store.select_channel(cid).await? {
                    if reconcile::bump_last_message_at(&mut channel, created_at) {
                        self.store.upsert_channel(channel).await?;
                    }
                }
            }
            EventKind::MessageDeleted { message, .. } => {
                if let Some(mut cached) = self.store.select_message(&message.id).await? {
                    cached.deleted = true;
                    cached.sync_status = shared::domain::SyncStatus::Synced;
                    self.store.upsert_message(cached).await?;
                }
            }
            EventKind::ReactionNew { reaction, .. } => {
                let mut confirmed = reaction.clone();
                confirmed.sync_status = shared::domain::SyncStatus::Synced;
                if let Some(mut message) = self.store.select_message(&reaction.message_id).await? {
                    reconcile::apply_reaction_added(&mut message, confirmed.clone());
                    self.store.upsert_message(message).await?;
                }
                self.store.upsert_reaction(confirmed).await?;
            }
            EventKind::ReactionDeleted { reaction, .. } => {
                let mut confirmed = reaction.clone();
                confirmed.deleted = true;
                confirmed.sync_status = shared::domain::SyncStatus::Synced;
                if let Some(mut message) = self.store.select_message(&reaction.message_id).await? {
                    reconcile::apply_reaction_removed(&mut message, &confirmed);
                    self.store.upsert_message(message).await?;
                }
                self.store.upsert_reaction(confirmed).await?;
            }
            EventKind::MemberAdded { cid, member } | EventKind::MemberUpdated { cid, member } => {
                if let Some(mut channel) = self.store.select_channel(cid).await? {
                    reconcile::apply_member_upserted(&mut channel, member.clone());
                    self.store.upsert_channel(channel).await?;
                } else {
                    debug!(%cid, "member event for unknown channel dropped");
                }
            }
            EventKind::MemberRemoved { cid, user_id } => {
                if let Some(mut channel) = self.store.select_channel(cid).await? {
                    reconcile::apply_member_removed(&mut channel, user_id);
                    self.store.upsert_channel(channel).await?;
                }
            }
            EventKind::ChannelUpdated { cid, channel } => {
                let mut incoming = channel.clone();
                incoming.sync_status = shared::domain::SyncStatus::Synced;
                let cached = self.store.select_channel(cid).await?;
                self.store
                    .upsert_channel(reconcile::merge_channel(cached, incoming))
                    .await?;
            }
            EventKind::ChannelHidden { cid } => {
                if let Some(mut channel) = self.store.select_channel(cid).await? {
                    channel.hidden = true;
                    self.store.upsert_channel(channel).await?;
                }
            }
            EventKind::ChannelDeleted { cid } => {
                if let Some(mut channel) = self.store.select_channel(cid).await? {
                    channel.deleted = true;
                    self.store.upsert_channel(channel).await?;
                }
            }
            EventKind::UserPresenceChanged { user } | EventKind::UserUpdated { user } => {
                self.store.upsert_user(user.clone()).await?;
            }
            EventKind::MessageRead {
                cid,
                user_id,
                created_at,
            } => {
                if let Some(mut channel) = self.store.select_channel(cid).await? {
                    if reconcile::apply_read(&mut channel, user_id, *created_at) {
                        self.store.upsert_channel(channel).await?;
                    }
                }
            }
        }
        Ok(())
    }
}
