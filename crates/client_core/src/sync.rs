use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use shared::domain::{Channel, Message, Reaction, SyncStatus};
use shared::protocol::{Event, EventKind, MessagePage, Pagination};
use shared::query::{Filter, Sort};
use storage::CacheStore;

use crate::reconcile;
use crate::remote::RemoteClient;
use crate::retry::RetryPolicy;
use crate::{ErrorEvent, Registry, SessionState};

/// One unit of outbound work. Everything that has to reach the server goes
/// through this queue, so teardown only has to stop one loop.
pub(crate) enum SyncJob {
    Channel(Channel),
    Message(Message),
    Reaction(Reaction),
    Recover,
}

/// Cloneable submission side of the sync queue.
#[derive(Clone)]
pub(crate) struct SyncHandle {
    tx: mpsc::UnboundedSender<SyncJob>,
}

impl SyncHandle {
    pub(crate) fn submit(&self, job: SyncJob) {
        if self.tx.send(job).is_err() {
            warn!("sync coordinator is gone, job dropped");
        }
    }
}

/// Drives pending local writes to the server and runs recovery.
///
/// Jobs run concurrently in a [`JoinSet`] owned by the queue loop, so
/// aborting the loop's task aborts every in-flight replay with it. Replays
/// retry per policy while online; while offline an attempt immediately
/// parks the entity as `Failed` and leaves it for recovery, which is what
/// suspends retries during an outage.
pub(crate) struct SyncCoordinator {
    session: Arc<SessionState>,
    registry: Arc<Registry>,
    store: Arc<dyn CacheStore>,
    remote: Arc<dyn RemoteClient>,
    retry: Arc<dyn RetryPolicy>,
}

impl SyncCoordinator {
    pub(crate) fn spawn(
        session: Arc<SessionState>,
        registry: Arc<Registry>,
        store: Arc<dyn CacheStore>,
        remote: Arc<dyn RemoteClient>,
        retry: Arc<dyn RetryPolicy>,
    ) -> (SyncHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(Self {
            session,
            registry,
            store,
            remote,
            retry,
        });

        let task = tokio::spawn(async move {
            let mut jobs = JoinSet::new();
            while let Some(job) = rx.recv().await {
                let coordinator = Arc::clone(&coordinator);
                jobs.spawn(async move {
                    match job {
                        SyncJob::Channel(channel) => coordinator.replay_channel(channel).await,
                        SyncJob::Message(message) => coordinator.replay_message(message).await,
                        SyncJob::Reaction(reaction) => coordinator.replay_reaction(reaction).await,
                        SyncJob::Recover => coordinator.recover().await,
                    }
                });
                // Reap whatever already finished; nothing here blocks.
                while jobs.try_join_next().is_some() {}
            }
        });

        (SyncHandle { tx }, task)
    }

    /// Recovery after reconnecting: re-run the first active queries, bulk
    /// re-fetch every watched channel, then replay pending entities in
    /// dependency order (channels before messages before reactions).
    pub(crate) async fn recover(&self) {
        info!("recovery started");

        let queries = self.registry.queries().await;
        for query in queries.iter().take(self.session.config.recover_query_limit) {
            if let Err(error) = query.run(Pagination::default()).await {
                warn!(spec = query.spec_id(), %error, "query refresh failed during recovery");
            }
        }

        let cids = self.registry.channel_cids().await;
        for batch in cids.chunks(self.session.config.recover_channel_batch) {
            let filter = Filter::CidIn(batch.to_vec());
            match self
                .remote
                .query_channels(&filter, &Sort::default(), Pagination::first(batch.len() as u32))
                .await
            {
                Ok(snapshots) => {
                    for snapshot in snapshots {
                        let cid = snapshot.channel.cid.clone();
                        let Some(controller) = self.registry.channel_if_active(&cid).await else {
                            continue;
                        };
                        if let Err(error) = controller.ingest_snapshot(snapshot).await {
                            warn!(%cid, %error, "channel refresh failed during recovery");
                        }
                    }
                }
                Err(error) => warn!(%error, "bulk channel re-fetch failed during recovery"),
            }
        }

        match self.store.select_pending_sync_channels().await {
            Ok(channels) => {
                for channel in channels {
                    self.replay_channel(channel).await;
                }
            }
            Err(error) => warn!(%error, "could not list pending channels"),
        }
        match self.store.select_pending_sync_messages().await {
            Ok(messages) => {
                for message in messages {
                    self.replay_message(message).await;
                }
            }
            Err(error) => warn!(%error, "could not list pending messages"),
        }
        match self.store.select_pending_sync_reactions().await {
            Ok(reactions) => {
                for reaction in reactions {
                    self.replay_reaction(reaction).await;
                }
            }
            Err(error) => warn!(%error, "could not list pending reactions"),
        }

        info!("recovery finished");
    }

    /// Replays a locally created channel by watching its cid, which creates
    /// it server-side when it does not exist yet.
    async fn replay_channel(&self, channel: Channel) {
        let mut attempt = 0u32;
        let mut local = channel;
        self.mark_channel(&mut local, SyncStatus::InProgress).await;
        loop {
            if !self.session.is_online() {
                debug!(cid = %local.cid, "offline, channel parked as failed until recovery");
                self.mark_channel(&mut local, SyncStatus::Failed).await;
                return;
            }
            match self.remote.watch_channel(&local.cid, MessagePage::first(1)).await {
                Ok(snapshot) => {
                    let mut confirmed = snapshot.channel;
                    confirmed.sync_status = SyncStatus::Synced;
                    let merged = reconcile::merge_channel(Some(local.clone()), confirmed);
                    if let Err(error) = self.store.upsert_channel(merged.clone()).await {
                        warn!(cid = %merged.cid, %error, "failed to persist synced channel");
                    }
                    if let Some(controller) = self.registry.channel_if_active(&merged.cid).await {
                        controller.apply_channel_update(merged.clone());
                    }
                    // Live queries learn about the confirmed channel the same
                    // way they would from a stream event, no re-query needed.
                    self.notify_queries(
                        EventKind::ChannelUpdated {
                            cid: merged.cid.clone(),
                            channel: merged.clone(),
                        }
                        .into(),
                    )
                    .await;
                    info!(cid = %merged.cid, attempt, "channel synced");
                    return;
                }
                Err(error) => {
                    attempt += 1;
                    let Some(delay) = self.retry_delay(attempt, &error) else {
                        error!(cid = %local.cid, %error, "channel sync failed permanently");
                        self.mark_channel(&mut local, SyncStatus::Failed).await;
                        self.session.emit_error(ErrorEvent {
                            cid: Some(local.cid.clone()),
                            context: "sync_channel".into(),
                            error,
                        });
                        return;
                    };
                    warn!(cid = %local.cid, attempt, %error, "channel sync failed, retrying");
                    sleep(delay).await;
                }
            }
        }
    }

    async fn replay_message(&self, message: Message) {
        let mut attempt = 0u32;
        let mut local = message;
        self.mark_message(&mut local, SyncStatus::InProgress).await;
        loop {
            if !self.session.is_online() {
                debug!(message_id = %local.id, "offline, message parked as failed until recovery");
                self.mark_message(&mut local, SyncStatus::Failed).await;
                return;
            }
            match self.remote.send_message(&local.cid, &local).await {
                Ok(mut confirmed) => {
                    confirmed.sync_status = SyncStatus::Synced;
                    reconcile::recount_reactions(&mut confirmed);
                    if let Err(error) = self.store.upsert_message(confirmed.clone()).await {
                        warn!(message_id = %confirmed.id, %error, "failed to persist synced message");
                    }
                    if let Some(controller) = self.registry.channel_if_active(&confirmed.cid).await
                    {
                        controller.apply_message_update(confirmed.clone());
                    }
                    self.notify_queries(
                        EventKind::MessageNew {
                            cid: confirmed.cid.clone(),
                            message: confirmed.clone(),
                        }
                        .into(),
                    )
                    .await;
                    info!(message_id = %confirmed.id, attempt, "message synced");
                    return;
                }
                Err(error) => {
                    attempt += 1;
                    let Some(delay) = self.retry_delay(attempt, &error) else {
                        error!(message_id = %local.id, %error, "message send failed permanently");
                        self.mark_message(&mut local, SyncStatus::Failed).await;
                        self.session.emit_error(ErrorEvent {
                            cid: Some(local.cid.clone()),
                            context: "send_message".into(),
                            error,
                        });
                        return;
                    };
                    warn!(message_id = %local.id, attempt, %error, "message send failed, retrying");
                    sleep(delay).await;
                }
            }
        }
    }

    /// Replays a reaction add or, when the reaction is tombstoned, its
    /// removal.
    async fn replay_reaction(&self, reaction: Reaction) {
        let mut attempt = 0u32;
        let mut local = reaction;
        self.mark_reaction(&mut local, SyncStatus::InProgress).await;
        loop {
            if !self.session.is_online() {
                debug!(message_id = %local.message_id, kind = %local.kind, "offline, reaction parked as failed until recovery");
                self.mark_reaction(&mut local, SyncStatus::Failed).await;
                return;
            }
            let outcome = if local.deleted {
                self.remote.delete_reaction(&local).await.map(|()| {
                    let mut confirmed = local.clone();
                    confirmed.sync_status = SyncStatus::Synced;
                    confirmed
                })
            } else {
                self.remote.send_reaction(&local).await.map(|mut confirmed| {
                    confirmed.sync_status = SyncStatus::Synced;
                    confirmed
                })
            };
            match outcome {
                Ok(confirmed) => {
                    if let Err(error) = self.store.upsert_reaction(confirmed.clone()).await {
                        warn!(message_id = %confirmed.message_id, %error, "failed to persist synced reaction");
                    }
                    info!(message_id = %confirmed.message_id, kind = %confirmed.kind, attempt, "reaction synced");
                    return;
                }
                Err(error) => {
                    attempt += 1;
                    let Some(delay) = self.retry_delay(attempt, &error) else {
                        error!(message_id = %local.message_id, %error, "reaction sync failed permanently");
                        self.mark_reaction(&mut local, SyncStatus::Failed).await;
                        self.session.emit_error(ErrorEvent {
                            cid: None,
                            context: "sync_reaction".into(),
                            error,
                        });
                        return;
                    };
                    warn!(message_id = %local.message_id, attempt, %error, "reaction sync failed, retrying");
                    sleep(delay).await;
                }
            }
        }
    }

    async fn notify_queries(&self, update: Event) {
        for query in self.registry.queries().await {
            if let Err(error) = query.handle_event(&update).await {
                warn!(%error, "query update after sync failed");
            }
        }
    }

    fn retry_delay(
        &self,
        attempt: u32,
        error: &shared::error::RemoteError,
    ) -> Option<std::time::Duration> {
        if !self.retry.should_retry(attempt, error) {
            return None;
        }
        self.retry.retry_timeout(attempt, error)
    }

    async fn mark_channel(&self, channel: &mut Channel, status: SyncStatus) {
        channel.sync_status = status;
        if let Err(error) = self.store.upsert_channel(channel.clone()).await {
            warn!(cid = %channel.cid, %error, "failed to persist channel sync status");
        }
        if let Some(controller) = self.registry.channel_if_active(&channel.cid).await {
            controller.apply_channel_update(channel.clone());
        }
    }

    async fn mark_message(&self, message: &mut Message, status: SyncStatus) {
        message.sync_status = status;
        if let Err(error) = self.store.upsert_message(message.clone()).await {
            warn!(message_id = %message.id, %error, "failed to persist message sync status");
        }
        if let Some(controller) = self.registry.channel_if_active(&message.cid).await {
            controller.apply_message_update(message.clone());
        }
    }

    async fn mark_reaction(&self, reaction: &mut Reaction, status: SyncStatus) {
        reaction.sync_status = status;
        if let Err(error) = self.store.upsert_reaction(reaction.clone()).await {
            warn!(message_id = %reaction.message_id, %error, "failed to persist reaction sync status");
        }
    }
}
