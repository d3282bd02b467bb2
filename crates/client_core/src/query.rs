use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::warn;

use shared::domain::{Channel, Cid, SyncStatus};
use shared::protocol::{ChannelSnapshot, Event, EventKind, Pagination};
use shared::query::{Filter, QuerySpec, Sort};
use storage::CacheStore;

use crate::reconcile;
use crate::remote::RemoteClient;
use crate::{ClientError, ErrorEvent, SessionState};

/// Live channel query: a filtered, sorted list of cids kept current against
/// the event stream without re-querying.
///
/// The controller keeps its own projection of the matched channels so event
/// handling is local. Every published result is also written back to the
/// query spec in the cache, which is what an offline run serves.
pub struct QueryController {
    spec_id: String,
    filter: Filter,
    sort: Sort,
    session: Arc<SessionState>,
    store: Arc<dyn CacheStore>,
    remote: Arc<dyn RemoteClient>,
    channels: Mutex<HashMap<Cid, Channel>>,
    cids: watch::Sender<Vec<Cid>>,
    loading: watch::Sender<bool>,
}

impl QueryController {
    pub(crate) fn new(
        filter: Filter,
        sort: Sort,
        session: Arc<SessionState>,
        store: Arc<dyn CacheStore>,
        remote: Arc<dyn RemoteClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            spec_id: QuerySpec::key(&filter, &sort),
            filter,
            sort,
            session,
            store,
            remote,
            channels: Mutex::new(HashMap::new()),
            cids: watch::channel(Vec::new()).0,
            loading: watch::channel(false).0,
        })
    }

    pub fn spec_id(&self) -> &str {
        &self.spec_id
    }

    pub fn cids(&self) -> watch::Receiver<Vec<Cid>> {
        self.cids.subscribe()
    }

    pub fn loading(&self) -> watch::Receiver<bool> {
        self.loading.subscribe()
    }

    /// Runs the query. Online results are cached; offline the last cached
    /// evaluation of the same (filter, sort) is served. Never fails on
    /// network trouble.
    pub async fn run(&self, pagination: Pagination) -> Result<(), ClientError> {
        self.loading.send_replace(true);
        let result = self.run_inner(pagination).await;
        self.loading.send_replace(false);
        result
    }

    async fn run_inner(&self, pagination: Pagination) -> Result<(), ClientError> {
        if self.session.is_online() {
            match self
                .remote
                .query_channels(&self.filter, &self.sort, pagination)
                .await
            {
                Ok(snapshots) => return self.ingest_results(snapshots).await,
                Err(error) => {
                    warn!(spec = %self.spec_id, %error, "query failed, serving cached result");
                    if !error.is_transient() {
                        self.session.emit_error(ErrorEvent {
                            cid: None,
                            context: "query_channels".into(),
                            error,
                        });
                    }
                }
            }
        }
        self.hydrate_from_cache().await
    }

    async fn ingest_results(&self, snapshots: Vec<ChannelSnapshot>) -> Result<(), ClientError> {
        let mut matched = HashMap::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let ChannelSnapshot {
                mut channel,
                messages,
                users,
                config,
            } = snapshot;

            channel.sync_status = SyncStatus::Synced;
            let cached = self.store.select_channel(&channel.cid).await?;
            let merged = reconcile::merge_channel(cached, channel);

            self.store.upsert_users(users).await?;
            if let Some(config) = config {
                self.session.cache_config(config.clone()).await;
                self.store.upsert_config(config).await?;
            }
            let mut confirmed = Vec::with_capacity(messages.len());
            for mut message in messages {
                message.sync_status = SyncStatus::Synced;
                let cached = self.store.select_message(&message.id).await?;
                confirmed.push(reconcile::merge_message(cached, message));
            }
            self.store.upsert_messages(confirmed).await?;
            self.store.upsert_channel(merged.clone()).await?;
            matched.insert(merged.cid.clone(), merged);
        }
        *self.channels.lock().await = matched;
        self.publish().await
    }

    async fn hydrate_from_cache(&self) -> Result<(), ClientError> {
        let Some(spec) = self.store.select_query(&self.spec_id).await? else {
            return Ok(());
        };
        let channels = self.store.select_channels(&spec.cids).await?;
        *self.channels.lock().await = channels
            .into_iter()
            .map(|channel| (channel.cid.clone(), channel))
            .collect();
        self.publish().await
    }

    /// Re-ranks the projection, persists it as the spec's last evaluation
    /// and publishes the ordered cid list.
    async fn publish(&self) -> Result<(), ClientError> {
        let ordered = {
            let guard = self.channels.lock().await;
            let mut live: Vec<&Channel> = guard
                .values()
                .filter(|c| !c.deleted && !c.hidden)
                .collect();
            live.sort_by(|a, b| self.sort.compare(a, b));
            live.iter().map(|c| c.cid.clone()).collect::<Vec<Cid>>()
        };

        let mut spec = QuerySpec::new(self.filter.clone(), self.sort);
        spec.cids = ordered.clone();
        self.store.upsert_query(spec).await?;
        self.cids.send_replace(ordered);
        Ok(())
    }

    fn admits(&self, channel: &Channel) -> bool {
        !channel.deleted && !channel.hidden && self.filter.matches(channel)
    }

    /// Keeps the result current against one stream event. A channel enters
    /// the result when an event makes it match, leaves when it stops
    /// matching, and the list re-sorts whenever the sort key moves.
    pub(crate) async fn handle_event(&self, event: &Event) -> Result<(), ClientError> {
        match &event.kind {
            EventKind::MessageNew { cid, message } => {
                let mut guard = self.channels.lock().await;
                if let Some(channel) = guard.get_mut(cid) {
                    reconcile::bump_last_message_at(channel, message.created_at);
                } else {
                    // A message can be the first signal that a cached
                    // channel now belongs in this result.
                    let Some(mut channel) = self.store.select_channel(cid).await? else {
                        return Ok(());
                    };
                    reconcile::bump_last_message_at(&mut channel, message.created_at);
                    if !self.admits(&channel) {
                        return Ok(());
                    }
                    guard.insert(cid.clone(), channel);
                }
                drop(guard);
                self.publish().await
            }
            EventKind::ChannelUpdated { cid, channel } => {
                let mut incoming = channel.clone();
                incoming.sync_status = SyncStatus::Synced;
                let mut guard = self.channels.lock().await;
                let merged = reconcile::merge_channel(guard.get(cid).cloned(), incoming);
                let changed = if self.admits(&merged) {
                    guard.insert(cid.clone(), merged);
                    true
                } else {
                    guard.remove(cid).is_some()
                };
                drop(guard);
                if changed {
                    self.publish().await?;
                }
                Ok(())
            }
            EventKind::ChannelHidden { cid } | EventKind::ChannelDeleted { cid } => {
                let removed = self.channels.lock().await.remove(cid).is_some();
                if removed {
                    self.publish().await?;
                }
                Ok(())
            }
            EventKind::MemberAdded { cid, member } | EventKind::MemberUpdated { cid, member } => {
                let mut guard = self.channels.lock().await;
                let mut channel = match guard.get(cid).cloned() {
                    Some(channel) => channel,
                    None => match self.store.select_channel(cid).await? {
                        Some(channel) => channel,
                        None => return Ok(()),
                    },
                };
                reconcile::apply_member_upserted(&mut channel, member.clone());
                let changed = if self.admits(&channel) {
                    guard.insert(cid.clone(), channel);
                    true
                } else {
                    guard.remove(cid).is_some()
                };
                drop(guard);
                if changed {
                    self.publish().await?;
                }
                Ok(())
            }
            EventKind::MemberRemoved { cid, user_id } => {
                let mut guard = self.channels.lock().await;
                let Some(mut channel) = guard.get(cid).cloned() else {
                    return Ok(());
                };
                reconcile::apply_member_removed(&mut channel, user_id);
                if self.admits(&channel) {
                    guard.insert(cid.clone(), channel);
                } else {
                    guard.remove(cid);
                }
                drop(guard);
                self.publish().await
            }
            _ => Ok(()),
        }
    }
}
