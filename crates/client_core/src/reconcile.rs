//! Pure merge rules between cached, optimistic and server copies of an
//! entity. Everything here is synchronous and side-effect free so the
//! controllers and the sync coordinator share one set of semantics.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use shared::domain::{Channel, Member, Message, Reaction, UserId};

/// Ascending window order by (created_at, id).
pub fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

/// Inserts or replaces by id, then restores window order. Used for both
/// optimistic inserts and server confirmations, so out-of-order arrivals
/// always land in the right slot.
pub fn upsert_into_window(window: &mut Vec<Message>, message: Message) {
    if let Some(existing) = window.iter_mut().find(|m| m.id == message.id) {
        *existing = message;
    } else {
        window.push(message);
    }
    sort_messages(window);
}

/// Server copy wins field by field, except that a server copy arriving
/// without reactions keeps the locally known set instead of wiping it.
pub fn merge_message(cached: Option<Message>, mut incoming: Message) -> Message {
    if let Some(cached) = cached {
        if incoming.reactions.is_empty() && !cached.reactions.is_empty() {
            incoming.reactions = cached.reactions;
        }
    }
    recount_reactions(&mut incoming);
    incoming
}

/// Rebuilds `reaction_counts` from the reaction set after deduplicating it
/// by (message_id, user_id, kind), later entry wins.
pub fn recount_reactions(message: &mut Message) {
    let mut deduped: Vec<Reaction> = Vec::with_capacity(message.reactions.len());
    for reaction in message.reactions.drain(..) {
        if let Some(existing) = deduped.iter_mut().find(|r| r.key() == reaction.key()) {
            *existing = reaction;
        } else {
            deduped.push(reaction);
        }
    }
    let mut counts: HashMap<String, u32> = HashMap::new();
    for reaction in &deduped {
        *counts.entry(reaction.kind.clone()).or_insert(0) += 1;
    }
    message.reactions = deduped;
    message.reaction_counts = counts;
}

/// Adds a reaction to the message, keeping set and counts consistent.
/// A reaction already present by key is replaced without touching counts.
/// Returns whether the set grew.
pub fn apply_reaction_added(message: &mut Message, reaction: Reaction) -> bool {
    if reaction.message_id != message.id {
        return false;
    }
    if let Some(existing) = message
        .reactions
        .iter_mut()
        .find(|r| r.key() == reaction.key())
    {
        *existing = reaction;
        return false;
    }
    *message
        .reaction_counts
        .entry(reaction.kind.clone())
        .or_insert(0) += 1;
    message.reactions.push(reaction);
    true
}

/// Removes a reaction by key. Counts decrement exactly once per removal and
/// drop out of the map at zero. Removing an absent reaction is a no-op.
pub fn apply_reaction_removed(message: &mut Message, reaction: &Reaction) -> bool {
    let Some(pos) = message
        .reactions
        .iter()
        .position(|r| r.key() == reaction.key())
    else {
        return false;
    };
    let removed = message.reactions.remove(pos);
    if let Some(count) = message.reaction_counts.get_mut(&removed.kind) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            message.reaction_counts.remove(&removed.kind);
        }
    }
    true
}

/// Server copy wins, except read pointers, which only ever advance: a stale
/// server read state can never regress a pointer the client already moved.
pub fn merge_channel(cached: Option<Channel>, mut incoming: Channel) -> Channel {
    if let Some(cached) = cached {
        for (user_id, at) in cached.reads {
            apply_read(&mut incoming, &user_id, at);
        }
    }
    incoming
}

/// Advances one user's read pointer monotonically. Returns whether it moved.
pub fn apply_read(channel: &mut Channel, user_id: &UserId, at: DateTime<Utc>) -> bool {
    match channel.reads.get(user_id) {
        Some(existing) if *existing >= at => false,
        _ => {
            channel.reads.insert(user_id.clone(), at);
            true
        }
    }
}

pub fn apply_member_upserted(channel: &mut Channel, member: Member) {
    channel.members.insert(member.user_id.clone(), member);
}

pub fn apply_member_removed(channel: &mut Channel, user_id: &UserId) {
    channel.members.remove(user_id);
}

/// Moves `last_message_at` forward only. Returns whether it moved.
pub fn bump_last_message_at(channel: &mut Channel, at: DateTime<Utc>) -> bool {
    if channel.last_message_at.map_or(true, |current| current < at) {
        channel.last_message_at = Some(at);
        return true;
    }
    false
}
