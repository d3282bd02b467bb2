use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    Channel, ChannelConfig, Cid, Member, Message, MessageId, Reaction, User, UserId,
};

/// Page request for a channel query: plain offset/limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Pagination {
    pub fn first(limit: u32) -> Self {
        Self { limit, offset: 0 }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::first(30)
    }
}

/// Page request for a message window. The boundary, when present, excludes
/// the boundary message itself: older pages filter strictly below it, newer
/// pages strictly above it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePage {
    pub limit: u32,
    pub boundary: Option<MessageBoundary>,
}

impl MessagePage {
    pub fn first(limit: u32) -> Self {
        Self {
            limit,
            boundary: None,
        }
    }
}

impl Default for MessagePage {
    fn default() -> Self {
        Self::first(30)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageBoundary {
    IdLessThan(MessageId),
    IdGreaterThan(MessageId),
}

/// Which side of the current window the next page extends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageDirection {
    Older,
    Newer,
}

/// Everything a watch or channel query returns for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub channel: Channel,
    pub messages: Vec<Message>,
    pub users: Vec<User>,
    pub config: Option<ChannelConfig>,
}

/// One event from the remote stream. Unread counters piggyback on whatever
/// event the server attached them to, independent of the event kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub total_unread_count: Option<u32>,
    pub unread_channels: Option<u32>,
}

impl Event {
    pub fn from_kind(kind: EventKind) -> Self {
        Self {
            kind,
            total_unread_count: None,
            unread_channels: None,
        }
    }

    pub fn cid(&self) -> Option<&Cid> {
        self.kind.cid()
    }
}

impl From<EventKind> for Event {
    fn from(kind: EventKind) -> Self {
        Self::from_kind(kind)
    }
}

/// Closed taxonomy of stream events; dispatch is exhaustiveness-checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Connected { me: User },
    Disconnected,
    MessageNew { cid: Cid, message: Message },
    MessageUpdated { cid: Cid, message: Message },
    MessageDeleted { cid: Cid, message: Message },
    ReactionNew { cid: Cid, reaction: Reaction },
    ReactionDeleted { cid: Cid, reaction: Reaction },
    MemberAdded { cid: Cid, member: Member },
    MemberUpdated { cid: Cid, member: Member },
    MemberRemoved { cid: Cid, user_id: UserId },
    ChannelUpdated { cid: Cid, channel: Channel },
    ChannelHidden { cid: Cid },
    ChannelDeleted { cid: Cid },
    UserPresenceChanged { user: User },
    UserUpdated { user: User },
    MessageRead { cid: Cid, user_id: UserId, created_at: DateTime<Utc> },
}

impl EventKind {
    pub fn cid(&self) -> Option<&Cid> {
        match self {
            Self::Connected { .. }
            | Self::Disconnected
            | Self::UserPresenceChanged { .. }
            | Self::UserUpdated { .. } => None,
            Self::MessageNew { cid, .. }
            | Self::MessageUpdated { cid, .. }
            | Self::MessageDeleted { cid, .. }
            | Self::ReactionNew { cid, .. }
            | Self::ReactionDeleted { cid, .. }
            | Self::MemberAdded { cid, .. }
            | Self::MemberUpdated { cid, .. }
            | Self::MemberRemoved { cid, .. }
            | Self::ChannelUpdated { cid, .. }
            | Self::ChannelHidden { cid }
            | Self::ChannelDeleted { cid }
            | Self::MessageRead { cid, .. } => Some(cid),
        }
    }
}
