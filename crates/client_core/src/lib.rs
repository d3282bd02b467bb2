//! Offline-first client runtime: optimistic writes against a local cache,
//! observable state through watch channels, and a sync coordinator that
//! replays pending work when connectivity allows.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use shared::domain::{ChannelConfig, Cid, MessageId, User, UserId};
use shared::error::RemoteError;
use shared::protocol::Event;
use shared::query::{Filter, QuerySpec, Sort};
use storage::{CacheStore, StoreError};

mod channel;
mod query;
pub mod reconcile;
mod remote;
mod retry;
mod router;
mod sync;

pub use channel::ChannelController;
pub use query::QueryController;
pub use remote::{MissingRemoteClient, RemoteClient, RemoteResult};
pub use retry::{ExponentialBackoff, RetryPolicy};

use router::EventRouter;
use sync::{SyncCoordinator, SyncHandle, SyncJob};

/// Session-wide knobs. Defaults match server-side paging expectations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// When false, stream events are not folded into the cache; the session
    /// is effectively cache-only for its own writes.
    pub persistence_enabled: bool,
    /// How many active queries recovery re-runs after a reconnect.
    pub recover_query_limit: usize,
    /// Batch size for the bulk channel re-fetch during recovery.
    pub recover_channel_batch: usize,
    /// Default message window size.
    pub message_page_size: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            persistence_enabled: true,
            recover_query_limit: 3,
            recover_channel_batch: 30,
            message_page_size: 30,
        }
    }
}

/// A failure surfaced to the application after the sync machinery gave up
/// on it. Transient errors never show up here; only permanent ones do, once.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub cid: Option<Cid>,
    pub context: String,
    pub error: RemoteError,
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("cache belongs to user '{existing}', refusing to open a session for '{requested}'")]
    UserConflict { existing: UserId, requested: UserId },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("message '{0}' is not in the local cache")]
    UnknownMessage(MessageId),
}

/// Shared per-session state: who we are, connectivity, unread counters,
/// per-type channel configs and the error fan-out. One instance per
/// [`ChatClient`], never global.
pub(crate) struct SessionState {
    pub(crate) user: User,
    pub(crate) config: SyncConfig,
    pub(crate) online: watch::Sender<bool>,
    pub(crate) total_unread: watch::Sender<u32>,
    pub(crate) unread_channels: watch::Sender<u32>,
    pub(crate) initialized: AtomicBool,
    pub(crate) errors: broadcast::Sender<ErrorEvent>,
    configs: Mutex<HashMap<String, ChannelConfig>>,
}

impl SessionState {
    fn new(user: User, config: SyncConfig) -> Self {
        Self {
            user,
            config,
            online: watch::channel(false).0,
            total_unread: watch::channel(0).0,
            unread_channels: watch::channel(0).0,
            initialized: AtomicBool::new(false),
            errors: broadcast::channel(64).0,
            configs: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub(crate) fn emit_error(&self, event: ErrorEvent) {
        // No subscribers is fine; the entity already carries its status.
        let _ = self.errors.send(event);
    }

    pub(crate) async fn channel_config(&self, channel_type: &str) -> Option<ChannelConfig> {
        self.configs.lock().await.get(channel_type).cloned()
    }

    pub(crate) async fn cache_config(&self, config: ChannelConfig) {
        self.configs
            .lock()
            .await
            .insert(config.channel_type.clone(), config);
    }
}

/// Live controllers of this session. Channels are keyed by cid; queries keep
/// creation order, which is the order recovery re-runs them in.
pub(crate) struct Registry {
    channels: Mutex<HashMap<Cid, Arc<ChannelController>>>,
    queries: Mutex<Vec<(String, Arc<QueryController>)>>,
}

impl Registry {
    fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) async fn channel_if_active(&self, cid: &Cid) -> Option<Arc<ChannelController>> {
        self.channels.lock().await.get(cid).cloned()
    }

    pub(crate) async fn channel_cids(&self) -> Vec<Cid> {
        let mut cids: Vec<Cid> = self.channels.lock().await.keys().cloned().collect();
        cids.sort();
        cids
    }

    async fn channel_or_create(
        &self,
        cid: Cid,
        create: impl FnOnce() -> Arc<ChannelController>,
    ) -> Arc<ChannelController> {
        let mut guard = self.channels.lock().await;
        guard.entry(cid).or_insert_with(create).clone()
    }

    pub(crate) async fn queries(&self) -> Vec<Arc<QueryController>> {
        self.queries
            .lock()
            .await
            .iter()
            .map(|(_, controller)| controller.clone())
            .collect()
    }

    async fn query_or_create(
        &self,
        id: String,
        create: impl FnOnce() -> Arc<QueryController>,
    ) -> Arc<QueryController> {
        let mut guard = self.queries.lock().await;
        if let Some((_, existing)) = guard.iter().find(|(key, _)| *key == id) {
            return existing.clone();
        }
        let controller = create();
        guard.push((id, controller.clone()));
        controller
    }
}

/// Entry point of the client runtime. Owns the sync coordinator task and
/// hands out controllers; dropping the client aborts all background work.
pub struct ChatClient {
    session: Arc<SessionState>,
    store: Arc<dyn CacheStore>,
    remote: Arc<dyn RemoteClient>,
    registry: Arc<Registry>,
    router: EventRouter,
    sync: SyncHandle,
    sync_task: JoinHandle<()>,
}

impl ChatClient {
    pub async fn new(
        config: SyncConfig,
        user: User,
        remote: Arc<dyn RemoteClient>,
        store: Arc<dyn CacheStore>,
    ) -> Result<Self, InitError> {
        Self::with_retry_policy(
            config,
            user,
            remote,
            store,
            Arc::new(ExponentialBackoff::default()),
        )
        .await
    }

    /// Opens a session against the given cache. A cache written under a
    /// different user is refused outright; clearing it is the caller's call.
    pub async fn with_retry_policy(
        config: SyncConfig,
        user: User,
        remote: Arc<dyn RemoteClient>,
        store: Arc<dyn CacheStore>,
        retry: Arc<dyn RetryPolicy>,
    ) -> Result<Self, InitError> {
        if let Some(existing) = store.select_session_user().await? {
            if existing != user.id {
                return Err(InitError::UserConflict {
                    existing,
                    requested: user.id,
                });
            }
        }
        store.upsert_session_user(&user.id).await?;
        store.upsert_user(user.clone()).await?;

        let session = Arc::new(SessionState::new(user, config));
        // Configs live in memory for the session lifetime; snapshots carrying
        // a fresh copy refresh this cache through the controllers.
        for config in store.select_configs().await? {
            session.cache_config(config).await;
        }
        let registry = Arc::new(Registry::new());
        let (sync, sync_task) = SyncCoordinator::spawn(
            Arc::clone(&session),
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&remote),
            retry,
        );
        let router = EventRouter::new(
            Arc::clone(&session),
            Arc::clone(&registry),
            Arc::clone(&store),
            sync.clone(),
        );

        Ok(Self {
            session,
            store,
            remote,
            registry,
            router,
            sync,
            sync_task,
        })
    }

    /// Controller for one channel, created on first use and shared after.
    pub async fn channel(&self, channel_type: &str, channel_id: &str) -> Arc<ChannelController> {
        let cid = Cid::new(channel_type, channel_id);
        self.registry
            .channel_or_create(cid.clone(), || {
                ChannelController::new(
                    cid,
                    Arc::clone(&self.session),
                    Arc::clone(&self.store),
                    Arc::clone(&self.remote),
                    self.sync.clone(),
                )
            })
            .await
    }

    /// Controller for one live channel query. Identical (filter, sort)
    /// pairs resolve to the same controller.
    pub async fn query_channels(&self, filter: Filter, sort: Sort) -> Arc<QueryController> {
        let id = QuerySpec::key(&filter, &sort);
        self.registry
            .query_or_create(id, || {
                QueryController::new(
                    filter,
                    sort,
                    Arc::clone(&self.session),
                    Arc::clone(&self.store),
                    Arc::clone(&self.remote),
                )
            })
            .await
    }

    /// Feeds one stream event into the session. The transport integration
    /// calls this for everything it receives, in arrival order.
    pub async fn handle_event(&self, event: Event) -> Result<(), ClientError> {
        self.router.handle(event).await
    }

    /// Forces a full recovery pass, as if the session had just reconnected.
    pub fn trigger_recovery(&self) {
        self.sync.submit(SyncJob::Recover);
    }

    pub fn current_user(&self) -> &User {
        &self.session.user
    }

    pub fn online(&self) -> watch::Receiver<bool> {
        self.session.online.subscribe()
    }

    pub fn total_unread_count(&self) -> watch::Receiver<u32> {
        self.session.total_unread.subscribe()
    }

    pub fn unread_channels(&self) -> watch::Receiver<u32> {
        self.session.unread_channels.subscribe()
    }

    /// Capabilities for one channel type, as last declared by the server.
    /// Loaded from the cache at construction and refreshed whenever a watch
    /// or query snapshot carries a fresh copy.
    pub async fn channel_config(&self, channel_type: &str) -> Option<ChannelConfig> {
        self.session.channel_config(channel_type).await
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorEvent> {
        self.session.errors.subscribe()
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        // In-flight replays die with the queue loop; anything unfinished is
        // still pending in the cache and recovery picks it up next session.
        self.sync_task.abort();
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
