use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);

impl MessageId {
    /// Client-generated id for a new outbound message: `<userId>-<uuid>`.
    pub fn generate(user_id: &UserId) -> Self {
        Self(format!("{}-{}", user_id.0, Uuid::new_v4()))
    }
}

/// Channel identifier: the (type, id) pair rendered as `type:id`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cid {
    pub channel_type: String,
    pub channel_id: String,
}

impl Cid {
    pub fn new(channel_type: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            channel_type: channel_type.into(),
            channel_id: channel_id.into(),
        }
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel_type, self.channel_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid cid '{input}': expected 'type:id'")]
pub struct CidParseError {
    pub input: String,
}

impl FromStr for Cid {
    type Err = CidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((channel_type, channel_id))
                if !channel_type.is_empty() && !channel_id.is_empty() =>
            {
                Ok(Self::new(channel_type, channel_id))
            }
            _ => Err(CidParseError {
                input: s.to_string(),
            }),
        }
    }
}

/// Local-vs-remote agreement marker for a mutable entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    None,
    InProgress,
    Synced,
    Failed,
}

impl SyncStatus {
    /// Anything not confirmed by the server still needs a replay.
    pub fn is_pending(self) -> bool {
        self != SyncStatus::Synced
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub image: Option<String>,
    pub online: bool,
    pub last_active: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            name: name.into(),
            image: None,
            online: false,
            last_active: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Moderator,
    Member,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: UserId,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

impl Member {
    pub fn new(user_id: UserId, created_at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            role: Role::Member,
            created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub cid: Cid,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub members: HashMap<UserId, Member>,
    pub reads: HashMap<UserId, DateTime<Utc>>,
    /// Tombstone flags: deletion is an attribute flip, never a row removal.
    pub hidden: bool,
    pub deleted: bool,
    pub sync_status: SyncStatus,
}

impl Channel {
    pub fn new(cid: Cid, created_at: DateTime<Utc>) -> Self {
        Self {
            cid,
            created_by: None,
            created_at,
            last_message_at: None,
            members: HashMap::new(),
            reads: HashMap::new(),
            hidden: false,
            deleted: false,
            sync_status: SyncStatus::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub cid: Cid,
    pub user_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
    /// Deduplicated by (message_id, user_id, kind).
    pub reactions: Vec<Reaction>,
    /// Must always equal the aggregate of `reactions` after any mutation.
    pub reaction_counts: HashMap<String, u32>,
    pub sync_status: SyncStatus,
}

impl Message {
    pub fn new(id: MessageId, cid: Cid, user_id: UserId, text: impl Into<String>) -> Self {
        Self {
            id,
            cid,
            user_id,
            text: text.into(),
            created_at: Utc::now(),
            deleted: false,
            reactions: Vec::new(),
            reaction_counts: HashMap::new(),
            sync_status: SyncStatus::None,
        }
    }

    /// Window ordering: ascending by creation time, ties broken by id.
    pub fn sort_key(&self) -> (DateTime<Utc>, &MessageId) {
        (self.created_at, &self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub kind: String,
    pub created_at: DateTime<Utc>,
    /// Set when the user removed the reaction locally and the removal still
    /// needs to reach the server.
    pub deleted: bool,
    pub sync_status: SyncStatus,
}

impl Reaction {
    pub fn new(message_id: MessageId, user_id: UserId, kind: impl Into<String>) -> Self {
        Self {
            message_id,
            user_id,
            kind: kind.into(),
            created_at: Utc::now(),
            deleted: false,
            sync_status: SyncStatus::None,
        }
    }

    /// Composite identity of a reaction.
    pub fn key(&self) -> (&MessageId, &UserId, &str) {
        (&self.message_id, &self.user_id, &self.kind)
    }
}

/// Server-declared capabilities per channel type. Loaded once per session and
/// refreshed opportunistically when channel queries return a fresh copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel_type: String,
    pub typing_events: bool,
    pub read_events: bool,
    pub reactions_enabled: bool,
    pub max_message_length: u32,
}

impl ChannelConfig {
    pub fn new(channel_type: impl Into<String>) -> Self {
        Self {
            channel_type: channel_type.into(),
            typing_events: true,
            read_events: true,
            reactions_enabled: true,
            max_message_length: 5000,
        }
    }
}
