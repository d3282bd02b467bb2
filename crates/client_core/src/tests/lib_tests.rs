use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

use shared::domain::{
    Channel, ChannelConfig, Cid, Message, MessageId, Reaction, SyncStatus, User, UserId,
};
use shared::error::RemoteError;
use shared::protocol::{
    ChannelSnapshot, Event, EventKind, MessagePage, PageDirection, Pagination,
};
use shared::query::{Filter, Sort};
use storage::{CacheStore, MemoryStore};

use super::*;

/// Scriptable transport double. Channels watched into existence are
/// remembered, outbound calls are recorded in order, and failures can be
/// queued up per operation.
struct TestRemoteClient {
    channels: StdMutex<HashMap<Cid, Channel>>,
    config: StdMutex<Option<ChannelConfig>>,
    message_failures: StdMutex<VecDeque<RemoteError>>,
    reaction_failures: StdMutex<VecDeque<RemoteError>>,
    calls: StdMutex<Vec<String>>,
}

impl TestRemoteClient {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: StdMutex::new(HashMap::new()),
            config: StdMutex::new(None),
            message_failures: StdMutex::new(VecDeque::new()),
            reaction_failures: StdMutex::new(VecDeque::new()),
            calls: StdMutex::new(Vec::new()),
        })
    }

    fn insert_channel(&self, channel: Channel) {
        self.channels
            .lock()
            .unwrap()
            .insert(channel.cid.clone(), channel);
    }

    fn set_config(&self, config: ChannelConfig) {
        *self.config.lock().unwrap() = Some(config);
    }

    fn fail_message_sends(&self, errors: Vec<RemoteError>) {
        self.message_failures.lock().unwrap().extend(errors);
    }

    fn fail_reaction_sends(&self, errors: Vec<RemoteError>) {
        self.reaction_failures.lock().unwrap().extend(errors);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn snapshot(&self, channel: Channel) -> ChannelSnapshot {
        ChannelSnapshot {
            channel,
            messages: Vec::new(),
            users: Vec::new(),
            config: self.config.lock().unwrap().clone(),
        }
    }
}

#[async_trait]
impl RemoteClient for TestRemoteClient {
    async fn watch_channel(
        &self,
        cid: &Cid,
        _messages: MessagePage,
    ) -> RemoteResult<ChannelSnapshot> {
        self.record(format!("watch_channel {cid}"));
        let mut channels = self.channels.lock().unwrap();
        let channel = channels
            .entry(cid.clone())
            .or_insert_with(|| Channel::new(cid.clone(), Utc::now()))
            .clone();
        Ok(self.snapshot(channel))
    }

    async fn query_channels(
        &self,
        filter: &Filter,
        sort: &Sort,
        _pagination: Pagination,
    ) -> RemoteResult<Vec<ChannelSnapshot>> {
        self.record("query_channels".to_string());
        let channels = self.channels.lock().unwrap();
        let mut matched: Vec<Channel> = channels
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        matched.sort_by(|a, b| sort.compare(a, b));
        Ok(matched.into_iter().map(|c| self.snapshot(c)).collect())
    }

    async fn send_message(&self, _cid: &Cid, message: &Message) -> RemoteResult<Message> {
        self.record(format!("send_message {}", message.id));
        if let Some(error) = self.message_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(message.clone())
    }

    async fn send_reaction(&self, reaction: &Reaction) -> RemoteResult<Reaction> {
        self.record(format!("send_reaction {}", reaction.kind));
        if let Some(error) = self.reaction_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(reaction.clone())
    }

    async fn delete_reaction(&self, reaction: &Reaction) -> RemoteResult<()> {
        self.record(format!("delete_reaction {}", reaction.kind));
        Ok(())
    }
}

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
}

fn cid() -> Cid {
    Cid::new("messaging", "general")
}

fn me() -> User {
    User::new("alice", "Alice")
}

fn cached_message(id: &str, secs: i64) -> Message {
    let mut message = Message::new(
        MessageId::new(id),
        cid(),
        UserId::new("alice"),
        format!("body of {id}"),
    );
    message.created_at = ts(secs);
    message.sync_status = SyncStatus::Synced;
    message
}

fn draft(text: &str) -> Message {
    Message::new(MessageId::default(), cid(), UserId::default(), text)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn client_with(remote: Arc<TestRemoteClient>, store: Arc<dyn CacheStore>) -> ChatClient {
    init_tracing();
    let fast_retry = Arc::new(ExponentialBackoff {
        base: Duration::from_millis(1),
        cap: Duration::from_millis(1),
    });
    ChatClient::with_retry_policy(SyncConfig::default(), me(), remote, store, fast_retry)
        .await
        .expect("open session")
}

async fn connect(client: &ChatClient) {
    client
        .handle_event(EventKind::Connected { me: me() }.into())
        .await
        .expect("handle connected");
}

async fn disconnect(client: &ChatClient) {
    client
        .handle_event(EventKind::Disconnected.into())
        .await
        .expect("handle disconnected");
}

async fn wait_for<T: Clone>(
    rx: &mut watch::Receiver<T>,
    pred: impl FnMut(&T) -> bool,
) -> T {
    timeout(Duration::from_secs(2), rx.wait_for(pred))
        .await
        .expect("timed out waiting for state")
        .expect("state sender dropped")
        .clone()
}

async fn wait_until(mut pred: impl FnMut() -> bool) {
    for _ in 0..400 {
        if pred() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

fn window_status(window: &[Message], id: &MessageId) -> Option<SyncStatus> {
    window.iter().find(|m| &m.id == id).map(|m| m.sync_status)
}

#[tokio::test]
async fn offline_send_is_cached_and_parked_as_failed() {
    let remote = TestRemoteClient::new();
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let client = client_with(remote.clone(), store.clone()).await;

    let controller = client.channel("messaging", "general").await;
    controller.watch(MessagePage::default()).await.unwrap();

    let sent = controller.send_message(draft("hello")).await.unwrap();
    assert!(sent.id.as_str().starts_with("alice-"));

    let mut messages = controller.messages();
    let window = wait_for(&mut messages, |w| {
        window_status(w, &sent.id) == Some(SyncStatus::Failed)
    })
    .await;
    assert_eq!(window.len(), 1);

    // Durable, not just visible: the cache row carries the same status.
    let cached = store.select_message(&sent.id).await.unwrap().unwrap();
    assert_eq!(cached.sync_status, SyncStatus::Failed);
    assert!(remote.calls().iter().all(|c| !c.starts_with("send_message")));
}

#[tokio::test]
async fn offline_watch_serves_the_cached_window() {
    let remote = TestRemoteClient::new();
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let mut channel = Channel::new(cid(), ts(0));
    channel.sync_status = SyncStatus::Synced;
    store.upsert_channel(channel).await.unwrap();
    store
        .upsert_messages(vec![cached_message("a", 100), cached_message("b", 200)])
        .await
        .unwrap();

    let client = client_with(remote.clone(), store).await;
    let controller = client.channel("messaging", "general").await;
    controller.watch(MessagePage::default()).await.unwrap();

    let window = controller.messages().borrow().clone();
    let ids: Vec<&str> = window.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, ["a", "b"]);
    assert!(remote.calls().is_empty(), "offline reads never hit the wire");
}

#[tokio::test]
async fn online_send_confirms_to_synced() {
    let remote = TestRemoteClient::new();
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let client = client_with(remote.clone(), store).await;
    connect(&client).await;

    let controller = client.channel("messaging", "general").await;
    controller.watch(MessagePage::default()).await.unwrap();
    let sent = controller.send_message(draft("hello")).await.unwrap();

    let mut messages = controller.messages();
    wait_for(&mut messages, |w| {
        window_status(w, &sent.id) == Some(SyncStatus::Synced)
    })
    .await;
    assert_eq!(
        remote
            .calls()
            .iter()
            .filter(|c| c.starts_with("send_message"))
            .count(),
        1
    );
}

#[tokio::test]
async fn permanent_failure_parks_as_failed_and_surfaces_once() {
    let remote = TestRemoteClient::new();
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let client = client_with(remote.clone(), store).await;
    connect(&client).await;
    let mut errors = client.subscribe_errors();

    remote.fail_message_sends(vec![RemoteError::validation("message too long")]);

    let controller = client.channel("messaging", "general").await;
    controller.watch(MessagePage::default()).await.unwrap();
    let sent = controller.send_message(draft("hello")).await.unwrap();

    let mut messages = controller.messages();
    wait_for(&mut messages, |w| {
        window_status(w, &sent.id) == Some(SyncStatus::Failed)
    })
    .await;

    let surfaced = timeout(Duration::from_secs(2), errors.recv())
        .await
        .expect("timed out waiting for error event")
        .expect("error channel closed");
    assert_eq!(surfaced.cid, Some(cid()));
    assert!(!surfaced.error.is_transient());
    assert_eq!(
        remote
            .calls()
            .iter()
            .filter(|c| c.starts_with("send_message"))
            .count(),
        1,
        "permanent errors are not retried"
    );
}

#[tokio::test]
async fn transient_failures_retry_until_success() {
    let remote = TestRemoteClient::new();
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let client = client_with(remote.clone(), store).await;
    connect(&client).await;

    remote.fail_message_sends(vec![
        RemoteError::network("blip"),
        RemoteError::Timeout { millis: 10 },
    ]);

    let controller = client.channel("messaging", "general").await;
    controller.watch(MessagePage::default()).await.unwrap();
    let sent = controller.send_message(draft("hello")).await.unwrap();

    let mut messages = controller.messages();
    wait_for(&mut messages, |w| {
        window_status(w, &sent.id) == Some(SyncStatus::Synced)
    })
    .await;
    assert_eq!(
        remote
            .calls()
            .iter()
            .filter(|c| c.starts_with("send_message"))
            .count(),
        3
    );
}

#[tokio::test]
async fn pagination_extends_the_window_with_strict_boundaries() {
    let remote = TestRemoteClient::new();
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let mut channel = Channel::new(cid(), ts(0));
    channel.sync_status = SyncStatus::Synced;
    store.upsert_channel(channel).await.unwrap();
    store
        .upsert_messages(vec![
            cached_message("a", 100),
            cached_message("b", 200),
            cached_message("c", 300),
            cached_message("d", 400),
        ])
        .await
        .unwrap();

    let client = client_with(remote, store).await;
    let controller = client.channel("messaging", "general").await;
    controller.watch(MessagePage::first(2)).await.unwrap();

    let ids: Vec<String> = controller
        .messages()
        .borrow()
        .iter()
        .map(|m| m.id.to_string())
        .collect();
    assert_eq!(ids, ["c", "d"]);

    controller
        .load_more_messages(2, PageDirection::Older)
        .await
        .unwrap();
    let ids: Vec<String> = controller
        .messages()
        .borrow()
        .iter()
        .map(|m| m.id.to_string())
        .collect();
    assert_eq!(ids, ["a", "b", "c", "d"], "boundary message is not duplicated");
}

#[tokio::test]
async fn unread_counters_follow_whatever_event_carries_them() {
    let remote = TestRemoteClient::new();
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let client = client_with(remote, store).await;
    connect(&client).await;

    let mut event: Event = EventKind::MessageNew {
        cid: cid(),
        message: cached_message("m1", 100),
    }
    .into();
    event.total_unread_count = Some(7);
    event.unread_channels = Some(2);
    client.handle_event(event).await.unwrap();

    assert_eq!(*client.total_unread_count().borrow(), 7);
    assert_eq!(*client.unread_channels().borrow(), 2);
}

#[tokio::test]
async fn out_of_order_events_land_in_window_order() {
    let remote = TestRemoteClient::new();
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let client = client_with(remote, store).await;
    connect(&client).await;

    let controller = client.channel("messaging", "general").await;
    controller.watch(MessagePage::default()).await.unwrap();

    client
        .handle_event(
            EventKind::MessageNew {
                cid: cid(),
                message: cached_message("late", 300),
            }
            .into(),
        )
        .await
        .unwrap();
    client
        .handle_event(
            EventKind::MessageNew {
                cid: cid(),
                message: cached_message("early", 100),
            }
            .into(),
        )
        .await
        .unwrap();

    let ids: Vec<String> = controller
        .messages()
        .borrow()
        .iter()
        .map(|m| m.id.to_string())
        .collect();
    assert_eq!(ids, ["early", "late"]);
}

#[tokio::test]
async fn reaction_events_keep_set_and_counts_consistent() {
    let remote = TestRemoteClient::new();
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let client = client_with(remote, store.clone()).await;
    connect(&client).await;

    let controller = client.channel("messaging", "general").await;
    controller.watch(MessagePage::default()).await.unwrap();
    client
        .handle_event(
            EventKind::MessageNew {
                cid: cid(),
                message: cached_message("m1", 100),
            }
            .into(),
        )
        .await
        .unwrap();

    let bob_like = Reaction::new(MessageId::new("m1"), UserId::new("bob"), "like");
    client
        .handle_event(
            EventKind::ReactionNew {
                cid: cid(),
                reaction: bob_like.clone(),
            }
            .into(),
        )
        .await
        .unwrap();
    // Duplicate delivery of the same reaction must not inflate the count.
    client
        .handle_event(
            EventKind::ReactionNew {
                cid: cid(),
                reaction: bob_like.clone(),
            }
            .into(),
        )
        .await
        .unwrap();

    let window = controller.messages().borrow().clone();
    assert_eq!(window[0].reaction_counts.get("like"), Some(&1));

    client
        .handle_event(
            EventKind::ReactionDeleted {
                cid: cid(),
                reaction: bob_like,
            }
            .into(),
        )
        .await
        .unwrap();
    let window = controller.messages().borrow().clone();
    assert_eq!(window[0].reaction_counts.get("like"), None);
    assert!(window[0].reactions.is_empty());
}

#[tokio::test]
async fn query_results_rerank_on_message_events() {
    let remote = TestRemoteClient::new();
    let mut a = Channel::new(Cid::new("messaging", "a"), ts(0));
    a.last_message_at = Some(ts(100));
    let mut b = Channel::new(Cid::new("messaging", "b"), ts(0));
    b.last_message_at = Some(ts(200));
    remote.insert_channel(a);
    remote.insert_channel(b);

    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let client = client_with(remote, store).await;
    connect(&client).await;

    let query = client
        .query_channels(Filter::TypeIs("messaging".into()), Sort::default())
        .await;
    query.run(Pagination::default()).await.unwrap();

    let cids: Vec<String> = query.cids().borrow().iter().map(Cid::to_string).collect();
    assert_eq!(cids, ["messaging:b", "messaging:a"]);

    client
        .handle_event(
            EventKind::MessageNew {
                cid: Cid::new("messaging", "a"),
                message: {
                    let mut m = cached_message("m1", 300);
                    m.cid = Cid::new("messaging", "a");
                    m
                },
            }
            .into(),
        )
        .await
        .unwrap();

    let cids: Vec<String> = query.cids().borrow().iter().map(Cid::to_string).collect();
    assert_eq!(cids, ["messaging:a", "messaging:b"]);
}

#[tokio::test]
async fn membership_events_admit_and_evict_query_channels() {
    let remote = TestRemoteClient::new();
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let mut channel = Channel::new(cid(), ts(0));
    channel.sync_status = SyncStatus::Synced;
    store.upsert_channel(channel).await.unwrap();

    let client = client_with(remote, store).await;
    connect(&client).await;

    let query = client
        .query_channels(Filter::HasMember(UserId::new("alice")), Sort::default())
        .await;
    query.run(Pagination::default()).await.unwrap();
    assert!(query.cids().borrow().is_empty());

    client
        .handle_event(
            EventKind::MemberAdded {
                cid: cid(),
                member: shared::domain::Member::new(UserId::new("alice"), ts(10)),
            }
            .into(),
        )
        .await
        .unwrap();
    assert_eq!(query.cids().borrow().clone(), vec![cid()]);

    client
        .handle_event(
            EventKind::MemberRemoved {
                cid: cid(),
                user_id: UserId::new("alice"),
            }
            .into(),
        )
        .await
        .unwrap();
    assert!(query.cids().borrow().is_empty());
}

#[tokio::test]
async fn read_pointers_only_advance() {
    let remote = TestRemoteClient::new();
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let mut channel = Channel::new(cid(), ts(0));
    channel.sync_status = SyncStatus::Synced;
    store.upsert_channel(channel).await.unwrap();

    let client = client_with(remote, store).await;
    connect(&client).await;
    let controller = client.channel("messaging", "general").await;
    controller.watch(MessagePage::default()).await.unwrap();

    for secs in [200, 100] {
        client
            .handle_event(
                EventKind::MessageRead {
                    cid: cid(),
                    user_id: UserId::new("bob"),
                    created_at: ts(secs),
                }
                .into(),
            )
            .await
            .unwrap();
    }

    let reads = controller.reads().borrow().clone();
    assert_eq!(reads.get(&UserId::new("bob")), Some(&ts(200)));
}

#[tokio::test]
async fn per_channel_unread_follows_messages_and_the_read_pointer() {
    let remote = TestRemoteClient::new();
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let client = client_with(remote, store).await;
    connect(&client).await;

    let controller = client.channel("messaging", "general").await;
    controller.watch(MessagePage::default()).await.unwrap();
    assert_eq!(*controller.unread_count().borrow(), 0);

    for (id, secs) in [("b1", 100), ("b2", 200)] {
        let mut message = cached_message(id, secs);
        message.user_id = UserId::new("bob");
        client
            .handle_event(
                EventKind::MessageNew {
                    cid: cid(),
                    message,
                }
                .into(),
            )
            .await
            .unwrap();
    }
    assert_eq!(*controller.unread_count().borrow(), 2);

    // Own messages never count as unread.
    let sent = controller.send_message(draft("mine")).await.unwrap();
    let mut messages = controller.messages();
    wait_for(&mut messages, |w| {
        window_status(w, &sent.id) == Some(SyncStatus::Synced)
    })
    .await;
    assert_eq!(*controller.unread_count().borrow(), 2);

    // The session user's read pointer clears everything it covers.
    client
        .handle_event(
            EventKind::MessageRead {
                cid: cid(),
                user_id: UserId::new("alice"),
                created_at: ts(150),
            }
            .into(),
        )
        .await
        .unwrap();
    assert_eq!(*controller.unread_count().borrow(), 1);

    // Other users' pointers leave the counter alone.
    client
        .handle_event(
            EventKind::MessageRead {
                cid: cid(),
                user_id: UserId::new("bob"),
                created_at: ts(500),
            }
            .into(),
        )
        .await
        .unwrap();
    assert_eq!(*controller.unread_count().borrow(), 1);
}

#[tokio::test]
async fn channel_config_loads_at_startup_and_refreshes_from_snapshots() {
    let remote = TestRemoteClient::new();
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let mut persisted = ChannelConfig::new("messaging");
    persisted.max_message_length = 100;
    store.upsert_config(persisted).await.unwrap();

    let client = client_with(remote.clone(), store).await;
    let config = client
        .channel_config("messaging")
        .await
        .expect("persisted config is loaded at construction");
    assert_eq!(config.max_message_length, 100);
    assert_eq!(client.channel_config("livestream").await, None);

    // A snapshot carrying a fresh copy replaces the cached one.
    let mut fresh = ChannelConfig::new("messaging");
    fresh.max_message_length = 9000;
    remote.set_config(fresh);
    connect(&client).await;
    let controller = client.channel("messaging", "general").await;
    controller.watch(MessagePage::default()).await.unwrap();

    let config = controller.config().await.expect("refreshed config");
    assert_eq!(config.max_message_length, 9000);
}

#[tokio::test]
async fn reconnect_triggers_recovery_exactly_once() {
    let remote = TestRemoteClient::new();
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let client = client_with(remote.clone(), store).await;

    connect(&client).await;
    let controller = client.channel("messaging", "general").await;
    controller.watch(MessagePage::default()).await.unwrap();

    let query_calls = |remote: &TestRemoteClient| {
        remote
            .calls()
            .iter()
            .filter(|c| c.as_str() == "query_channels")
            .count()
    };
    sleep(Duration::from_millis(20)).await;
    assert_eq!(query_calls(&remote), 0, "first connect has no gap to recover");

    disconnect(&client).await;
    connect(&client).await;

    wait_until(|| query_calls(&remote) == 1).await;
    sleep(Duration::from_millis(20)).await;
    assert_eq!(query_calls(&remote), 1, "one bulk re-fetch per reconnect");
}

#[tokio::test]
async fn offline_work_recovers_in_dependency_order() {
    let remote = TestRemoteClient::new();
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let client = client_with(remote.clone(), store.clone()).await;

    connect(&client).await;
    disconnect(&client).await;

    let query = client
        .query_channels(Filter::TypeIs("messaging".into()), Sort::default())
        .await;
    query.run(Pagination::default()).await.unwrap();
    assert!(query.cids().borrow().is_empty());

    // Create a channel, a message and a reaction, all offline.
    let controller = client.channel("messaging", "general").await;
    controller.watch(MessagePage::default()).await.unwrap();
    let sent = controller.send_message(draft("written offline")).await.unwrap();
    let mut messages = controller.messages();
    wait_for(&mut messages, |w| {
        window_status(w, &sent.id) == Some(SyncStatus::Failed)
    })
    .await;
    controller
        .send_reaction(sent.id.clone(), "like")
        .await
        .unwrap();

    wait_until(|| {
        let channel = controller.channel().borrow().clone();
        channel.map(|c| c.sync_status) == Some(SyncStatus::Failed)
    })
    .await;
    assert!(remote.calls().is_empty(), "nothing reaches the wire offline");

    connect(&client).await;

    wait_for(&mut messages, |w| {
        window_status(w, &sent.id) == Some(SyncStatus::Synced)
    })
    .await;
    wait_until(|| {
        let channel = controller.channel().borrow().clone();
        channel.map(|c| c.sync_status) == Some(SyncStatus::Synced)
    })
    .await;
    wait_until(|| {
        remote
            .calls()
            .iter()
            .any(|c| c.starts_with("send_reaction"))
    })
    .await;

    // Channels replay before messages, messages before reactions.
    let calls = remote.calls();
    let watch_pos = calls
        .iter()
        .position(|c| c.starts_with("watch_channel"))
        .expect("channel replayed");
    let send_pos = calls
        .iter()
        .position(|c| c.starts_with("send_message"))
        .expect("message replayed");
    let reaction_pos = calls
        .iter()
        .position(|c| c.starts_with("send_reaction"))
        .expect("reaction replayed");
    assert!(watch_pos < send_pos);
    assert!(send_pos < reaction_pos);

    let cached = store.select_message(&sent.id).await.unwrap().unwrap();
    assert_eq!(cached.sync_status, SyncStatus::Synced);

    // The matching query picked the channel up without a manual re-run.
    wait_until(|| query.cids().borrow().contains(&cid())).await;
}

#[tokio::test]
async fn offline_query_serves_the_last_cached_evaluation() {
    let remote = TestRemoteClient::new();
    let mut channel = Channel::new(Cid::new("messaging", "a"), ts(0));
    channel.last_message_at = Some(ts(100));
    remote.insert_channel(channel);

    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let first = client_with(remote.clone(), store.clone()).await;
    connect(&first).await;
    let query = first
        .query_channels(Filter::TypeIs("messaging".into()), Sort::default())
        .await;
    query.run(Pagination::default()).await.unwrap();
    assert_eq!(query.cids().borrow().len(), 1);
    drop(query);
    drop(first);

    // A fresh offline session over the same cache resolves the identical
    // query from its persisted evaluation.
    let second = client_with(remote, store).await;
    let query = second
        .query_channels(Filter::TypeIs("messaging".into()), Sort::default())
        .await;
    query.run(Pagination::default()).await.unwrap();
    let cids: Vec<String> = query.cids().borrow().iter().map(Cid::to_string).collect();
    assert_eq!(cids, ["messaging:a"]);
}

#[tokio::test]
async fn session_refuses_a_cache_owned_by_another_user() {
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    store
        .upsert_session_user(&UserId::new("bob"))
        .await
        .unwrap();

    let result = ChatClient::new(
        SyncConfig::default(),
        me(),
        TestRemoteClient::new(),
        store,
    )
    .await;
    assert!(matches!(result, Err(InitError::UserConflict { .. })));
}

#[tokio::test]
async fn delete_reaction_replays_the_removal() {
    let remote = TestRemoteClient::new();
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
    let client = client_with(remote.clone(), store.clone()).await;
    connect(&client).await;

    let controller = client.channel("messaging", "general").await;
    controller.watch(MessagePage::default()).await.unwrap();
    store
        .upsert_message(cached_message("m1", 100))
        .await
        .unwrap();

    let reaction_state = |store: &Arc<dyn CacheStore>| {
        let store = Arc::clone(store);
        async move {
            store
                .select_reaction(&MessageId::new("m1"), &UserId::new("alice"), "like")
                .await
                .unwrap()
        }
    };

    controller
        .send_reaction(MessageId::new("m1"), "like")
        .await
        .unwrap();
    // The add must be fully confirmed before the removal starts, otherwise
    // the two replays could interleave.
    for _ in 0..400 {
        let state = reaction_state(&store).await;
        if state.map(|r| r.sync_status) == Some(SyncStatus::Synced) {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }

    controller
        .delete_reaction(MessageId::new("m1"), "like")
        .await
        .unwrap();
    let mut confirmed = None;
    for _ in 0..400 {
        let state = reaction_state(&store).await;
        if state.as_ref().map(|r| (r.deleted, r.sync_status)) == Some((true, SyncStatus::Synced)) {
            confirmed = state;
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert!(confirmed.is_some(), "removal never confirmed");
    assert!(remote.calls().iter().any(|c| c == "delete_reaction like"));

    let cached = store.select_message(&MessageId::new("m1")).await.unwrap().unwrap();
    assert_eq!(cached.reaction_counts.get("like"), None);
}
