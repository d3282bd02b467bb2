use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::domain::{Channel, Cid, UserId};

/// Closed filter expression over channel attributes. Evaluable locally so a
/// live query can admit or drop a channel on an event without a re-query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    /// Matches channels of the given type.
    TypeIs(String),
    /// Matches channels whose cid is in the given set.
    CidIn(Vec<Cid>),
    /// Matches channels the given user is a member of.
    HasMember(UserId),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn matches(&self, channel: &Channel) -> bool {
        match self {
            Self::TypeIs(channel_type) => channel.cid.channel_type == *channel_type,
            Self::CidIn(cids) => cids.contains(&channel.cid),
            Self::HasMember(user_id) => channel.members.contains_key(user_id),
            Self::And(filters) => filters.iter().all(|f| f.matches(channel)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(channel)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    LastMessageAt,
    CreatedAt,
    Cid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: SortField,
    pub direction: SortDirection,
}

impl Sort {
    pub fn new(field: SortField, direction: SortDirection) -> Self {
        Self { field, direction }
    }

    /// Total order over channels: the sort field first, cid as tie-break so
    /// the result is stable regardless of arrival order.
    pub fn compare(&self, a: &Channel, b: &Channel) -> Ordering {
        let primary = match self.field {
            SortField::LastMessageAt => a.last_message_at.cmp(&b.last_message_at),
            SortField::CreatedAt => a.created_at.cmp(&b.created_at),
            SortField::Cid => a.cid.cmp(&b.cid),
        };
        let primary = match self.direction {
            SortDirection::Asc => primary,
            SortDirection::Desc => primary.reverse(),
        };
        primary.then_with(|| a.cid.cmp(&b.cid))
    }
}

impl Default for Sort {
    fn default() -> Self {
        Self::new(SortField::LastMessageAt, SortDirection::Desc)
    }
}

/// Persisted identity and last evaluation of one live channel query.
/// Identity is the canonical rendering of (filter, sort), so re-running an
/// identical query resolves to the same spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub id: String,
    pub filter: Filter,
    pub sort: Sort,
    pub cids: Vec<Cid>,
}

impl QuerySpec {
    pub fn new(filter: Filter, sort: Sort) -> Self {
        let id = Self::key(&filter, &sort);
        Self {
            id,
            filter,
            sort,
            cids: Vec::new(),
        }
    }

    pub fn key(filter: &Filter, sort: &Sort) -> String {
        serde_json::json!({ "filter": filter, "sort": sort }).to_string()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::domain::{Channel, Member};

    fn channel(cid: &str, last_message_secs: Option<i64>) -> Channel {
        let mut channel = Channel::new(
            cid.parse().unwrap(),
            Utc.timestamp_opt(1_000, 0).single().unwrap(),
        );
        channel.last_message_at =
            last_message_secs.map(|s| Utc.timestamp_opt(s, 0).single().unwrap());
        channel
    }

    #[test]
    fn filter_matches_type_and_membership() {
        let mut ch = channel("messaging:general", None);
        ch.members.insert(
            UserId::new("alice"),
            Member::new(UserId::new("alice"), ch.created_at),
        );

        assert!(Filter::TypeIs("messaging".into()).matches(&ch));
        assert!(!Filter::TypeIs("livestream".into()).matches(&ch));
        assert!(Filter::HasMember(UserId::new("alice")).matches(&ch));
        assert!(!Filter::HasMember(UserId::new("bob")).matches(&ch));
        assert!(Filter::And(vec![
            Filter::TypeIs("messaging".into()),
            Filter::HasMember(UserId::new("alice")),
        ])
        .matches(&ch));
        assert!(Filter::Or(vec![
            Filter::TypeIs("livestream".into()),
            Filter::HasMember(UserId::new("alice")),
        ])
        .matches(&ch));
    }

    #[test]
    fn sort_orders_by_field_with_cid_tiebreak() {
        let a = channel("messaging:a", Some(100));
        let b = channel("messaging:b", Some(200));
        let c = channel("messaging:c", Some(200));

        let sort = Sort::default();
        assert_eq!(sort.compare(&b, &a), Ordering::Less);
        // Equal timestamps fall back to cid order.
        assert_eq!(sort.compare(&b, &c), Ordering::Less);
    }

    #[test]
    fn identical_queries_share_a_key() {
        let filter = Filter::TypeIs("messaging".into());
        let sort = Sort::default();
        assert_eq!(
            QuerySpec::key(&filter, &sort),
            QuerySpec::key(&filter.clone(), &sort)
        );
        assert_ne!(
            QuerySpec::key(&filter, &sort),
            QuerySpec::key(&Filter::TypeIs("team".into()), &sort)
        );
    }
}
