use async_trait::async_trait;

use shared::domain::{Cid, Message, Reaction};
use shared::error::RemoteError;
use shared::protocol::{ChannelSnapshot, MessagePage, Pagination};
use shared::query::{Filter, Sort};

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Transport seam to the chat backend. Implementations own connection
/// handling; callers only see classified [`RemoteError`]s.
///
/// `watch_channel` doubles as channel creation: watching a cid the server
/// has never seen materializes the channel remotely, which is also how a
/// locally created channel is replayed after an offline period.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn watch_channel(
        &self,
        cid: &Cid,
        messages: MessagePage,
    ) -> RemoteResult<ChannelSnapshot>;

    async fn query_channels(
        &self,
        filter: &Filter,
        sort: &Sort,
        pagination: Pagination,
    ) -> RemoteResult<Vec<ChannelSnapshot>>;

    async fn send_message(&self, cid: &Cid, message: &Message) -> RemoteResult<Message>;

    async fn send_reaction(&self, reaction: &Reaction) -> RemoteResult<Reaction>;

    async fn delete_reaction(&self, reaction: &Reaction) -> RemoteResult<()>;
}

/// Null transport for cache-only sessions. Every call fails as a network
/// error, so outbound work parks as failed and reads serve the cache.
pub struct MissingRemoteClient;

#[async_trait]
impl RemoteClient for MissingRemoteClient {
    async fn watch_channel(
        &self,
        _cid: &Cid,
        _messages: MessagePage,
    ) -> RemoteResult<ChannelSnapshot> {
        Err(RemoteError::network("remote transport is not configured"))
    }

    async fn query_channels(
        &self,
        _filter: &Filter,
        _sort: &Sort,
        _pagination: Pagination,
    ) -> RemoteResult<Vec<ChannelSnapshot>> {
        Err(RemoteError::network("remote transport is not configured"))
    }

    async fn send_message(&self, _cid: &Cid, _message: &Message) -> RemoteResult<Message> {
        Err(RemoteError::network("remote transport is not configured"))
    }

    async fn send_reaction(&self, _reaction: &Reaction) -> RemoteResult<Reaction> {
        Err(RemoteError::network("remote transport is not configured"))
    }

    async fn delete_reaction(&self, _reaction: &Reaction) -> RemoteResult<()> {
        Err(RemoteError::network("remote transport is not configured"))
    }
}
