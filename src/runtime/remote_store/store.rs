use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Lobbies,
    LobbyMembers,
    Trips,
    ItineraryDays,
    ItineraryItems,
    TripBudgets,
    ChatMessages,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Lobbies => "lobbies",
            Table::LobbyMembers => "lobby_members",
            Table::Trips => "trips",
            Table::ItineraryDays => "itinerary_days",
            Table::ItineraryItems => "itinerary_items",
            Table::TripBudgets => "trip_budgets",
            Table::ChatMessages => "chat_messages",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("remote store unavailable: {0}")]
    Unavailable(String),
    #[error("table {0} is not provisioned")]
    NotProvisioned(Table),
    #[error("unique constraint violated on {table}.{column}")]
    Conflict { table: Table, column: String },
    #[error("remote store rejected request: {0}")]
    Rejected(String),
    #[error("malformed row: {0}")]
    Decode(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Equality filters, a single ordering column and an optional limit.
#[derive(Debug, Clone)]
pub struct Query {
    pub table: Table,
    pub filters: Vec<(String, Value)>,
    pub order: Option<(String, bool)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(table: Table) -> Self {
        Query {
            table,
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn eq(mut self, column: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.filters.push((column.to_string(), value));
        self
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.order = Some((column.to_string(), ascending));
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.filters
            .iter()
            .all(|(column, value)| row.get(column) == Some(value))
    }
}

// ---------------------------------------------------------------------------
// Change feed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row-level change. For deletes `record` holds the removed row.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: Table,
    pub record: Value,
}

#[derive(Debug, Clone)]
pub struct ChangeFilter {
    pub table: Table,
    /// `None` means every kind.
    pub kinds: Option<Vec<ChangeKind>>,
    pub eq: Option<(String, Value)>,
}

impl ChangeFilter {
    pub fn table(table: Table) -> Self {
        ChangeFilter {
            table,
            kinds: None,
            eq: None,
        }
    }

    pub fn only(mut self, kind: ChangeKind) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    pub fn eq(mut self, column: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.eq = Some((column.to_string(), value));
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table {
            return false;
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        match &self.eq {
            Some((column, value)) => event.record.get(column) == Some(value),
            None => true,
        }
    }
}

pub type ChangeSink = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// An open change-feed channel. Closing happens on drop; `close` makes it explicit.
pub struct Subscription {
    closer: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(closer: impl FnOnce() + Send + Sync + 'static) -> Self {
        Subscription {
            closer: Some(Box::new(closer)),
        }
    }

    pub fn close(mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("open", &self.closer.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// RemoteStore
// ---------------------------------------------------------------------------

/// The durable, last-write-wins store shared by every participant.
///
/// Rows are JSON objects. The store assigns `id` and `created_at` when the
/// caller leaves them out. Change events are delivered at least once and may
/// arrive before the writer's own call returns.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Insert a row and return it as stored.
    async fn insert(&self, table: Table, row: Value) -> Result<Value, RemoteError>;

    async fn select(&self, query: &Query) -> Result<Vec<Value>, RemoteError>;

    /// Merge `patch` into every matching row; returns the updated rows.
    async fn update(&self, query: &Query, patch: Value) -> Result<Vec<Value>, RemoteError>;

    /// Delete matching rows; returns the removed rows.
    async fn delete(&self, query: &Query) -> Result<Vec<Value>, RemoteError>;

    /// Open one channel covering all `filters`. Events go to `sink` until the
    /// returned subscription is closed or dropped.
    fn subscribe(
        &self,
        filters: Vec<ChangeFilter>,
        sink: ChangeSink,
    ) -> Result<Subscription, RemoteError>;
}

pub fn decode<T: DeserializeOwned>(row: Value) -> Result<T, RemoteError> {
    Ok(serde_json::from_value(row)?)
}

pub fn decode_all<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>, RemoteError> {
    rows.into_iter().map(decode).collect()
}

pub fn encode<T: Serialize>(value: &T) -> Result<Value, RemoteError> {
    Ok(serde_json::to_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn query_matches_all_equality_filters() {
        let q = Query::new(Table::Lobbies)
            .eq("invite_code", "ABCD1234")
            .eq("is_active", true);
        assert!(q.matches(&json!({"invite_code": "ABCD1234", "is_active": true})));
        assert!(!q.matches(&json!({"invite_code": "ABCD1234", "is_active": false})));
        assert!(!q.matches(&json!({"is_active": true})));
    }

    #[test]
    fn change_filter_checks_table_kind_and_column() {
        let filter = ChangeFilter::table(Table::ChatMessages)
            .only(ChangeKind::Insert)
            .eq("lobby_id", "L1");
        let event = |kind, lobby: &str| ChangeEvent {
            kind,
            table: Table::ChatMessages,
            record: json!({"lobby_id": lobby}),
        };
        assert!(filter.matches(&event(ChangeKind::Insert, "L1")));
        assert!(!filter.matches(&event(ChangeKind::Update, "L1")));
        assert!(!filter.matches(&event(ChangeKind::Insert, "L2")));
    }

    #[test]
    fn subscription_closes_exactly_once() {
        let closed = Arc::new(AtomicUsize::new(0));
        let c = closed.clone();
        let sub = Subscription::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        sub.close();
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        let c = closed.clone();
        drop(Subscription::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }
}
