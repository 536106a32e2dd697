use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::store::{
    ChangeEvent, ChangeFilter, ChangeKind, ChangeSink, Query, RemoteError, RemoteStore,
    Subscription, Table,
};

struct Subscriber {
    filters: Vec<ChangeFilter>,
    sink: ChangeSink,
}

#[derive(Default)]
struct Tables {
    rows: HashMap<Table, Vec<Value>>,
    last_created_at: Option<DateTime<Utc>>,
}

struct Inner {
    tables: Mutex<Tables>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_subscriber: AtomicU64,
    unprovisioned: Mutex<HashSet<Table>>,
    offline: AtomicBool,
    unique: Vec<(Table, &'static str)>,
}

/// Process-local remote store with a synchronous change feed.
///
/// Rows flagged `"is_active": false` do not hold unique keys. Fault
/// injection hooks (`unprovision`, `set_offline`, `emit`) exist for tests
/// and demos.
#[derive(Clone)]
pub struct InMemoryRemoteStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        InMemoryRemoteStore {
            inner: Arc::new(Inner {
                tables: Mutex::new(Tables::default()),
                subscribers: Mutex::new(HashMap::new()),
                next_subscriber: AtomicU64::new(1),
                unprovisioned: Mutex::new(HashSet::new()),
                offline: AtomicBool::new(false),
                unique: vec![(Table::Lobbies, "invite_code")],
            }),
        }
    }
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every request against `table` fail as not provisioned.
    pub fn unprovision(&self, table: Table) {
        self.inner
            .unprovisioned
            .lock()
            .expect("store lock poisoned")
            .insert(table);
    }

    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Deliver an event to matching subscribers without touching any rows.
    pub fn emit(&self, event: ChangeEvent) {
        self.inner.publish(vec![event]);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .expect("store lock poisoned")
            .len()
    }

    fn check(&self, table: Table) -> Result<(), RemoteError> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("offline".into()));
        }
        if self
            .inner
            .unprovisioned
            .lock()
            .expect("store lock poisoned")
            .contains(&table)
        {
            return Err(RemoteError::NotProvisioned(table));
        }
        Ok(())
    }
}

impl Inner {
    fn publish(&self, events: Vec<ChangeEvent>) {
        let deliveries: Vec<(ChangeSink, ChangeEvent)> = {
            let subscribers = self.subscribers.lock().expect("store lock poisoned");
            events
                .iter()
                .flat_map(|event| {
                    subscribers
                        .values()
                        .filter(|s| s.filters.iter().any(|f| f.matches(event)))
                        .map(|s| (s.sink.clone(), event.clone()))
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        for (sink, event) in deliveries {
            sink(event);
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("store lock poisoned")
            .remove(&id);
    }
}

fn is_active(row: &Value) -> bool {
    row.get("is_active") != Some(&Value::Bool(false))
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> CmpOrdering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(CmpOrdering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (None | Some(Value::Null), None | Some(Value::Null)) => CmpOrdering::Equal,
        (None | Some(Value::Null), _) => CmpOrdering::Less,
        (_, None | Some(Value::Null)) => CmpOrdering::Greater,
        _ => CmpOrdering::Equal,
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn insert(&self, table: Table, row: Value) -> Result<Value, RemoteError> {
        self.check(table)?;
        let Value::Object(mut row) = row else {
            return Err(RemoteError::Rejected(format!("{table}: row must be an object")));
        };

        let stored = {
            let mut tables = self.inner.tables.lock().expect("store lock poisoned");

            if row.get("id").is_none_or(Value::is_null) {
                row.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
            }
            if row.get("created_at").is_none_or(Value::is_null) {
                // Strictly increasing so created_at ordering is total.
                let mut now = Utc::now();
                if let Some(last) = tables.last_created_at {
                    if now <= last {
                        now = last + Duration::microseconds(1);
                    }
                }
                tables.last_created_at = Some(now);
                row.insert(
                    "created_at".into(),
                    Value::String(now.to_rfc3339_opts(SecondsFormat::Micros, true)),
                );
            }
            let row = Value::Object(row);

            let existing = tables.rows.entry(table).or_default();
            for (unique_table, column) in &self.inner.unique {
                if *unique_table != table || !is_active(&row) {
                    continue;
                }
                let Some(key) = row.get(*column) else {
                    continue;
                };
                if existing
                    .iter()
                    .any(|r| is_active(r) && r.get(*column) == Some(key))
                {
                    return Err(RemoteError::Conflict {
                        table,
                        column: column.to_string(),
                    });
                }
            }
            existing.push(row.clone());
            row
        };

        self.inner.publish(vec![ChangeEvent {
            kind: ChangeKind::Insert,
            table,
            record: stored.clone(),
        }]);
        Ok(stored)
    }

    async fn select(&self, query: &Query) -> Result<Vec<Value>, RemoteError> {
        self.check(query.table)?;
        let tables = self.inner.tables.lock().expect("store lock poisoned");
        let mut rows: Vec<Value> = tables
            .rows
            .get(&query.table)
            .map(|rows| rows.iter().filter(|r| query.matches(r)).cloned().collect())
            .unwrap_or_default();

        if let Some((column, ascending)) = &query.order {
            rows.sort_by(|a, b| {
                let ord = compare(a.get(column), b.get(column));
                if *ascending { ord } else { ord.reverse() }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn update(&self, query: &Query, patch: Value) -> Result<Vec<Value>, RemoteError> {
        self.check(query.table)?;
        let Value::Object(patch) = patch else {
            return Err(RemoteError::Rejected(format!(
                "{}: patch must be an object",
                query.table
            )));
        };

        let updated: Vec<Value> = {
            let mut tables = self.inner.tables.lock().expect("store lock poisoned");
            let rows = tables.rows.entry(query.table).or_default();
            let mut updated = Vec::new();
            for row in rows.iter_mut().filter(|r| query.matches(r)) {
                if let Value::Object(fields) = row {
                    for (k, v) in &patch {
                        fields.insert(k.clone(), v.clone());
                    }
                }
                updated.push(row.clone());
            }
            updated
        };

        self.inner.publish(
            updated
                .iter()
                .map(|record| ChangeEvent {
                    kind: ChangeKind::Update,
                    table: query.table,
                    record: record.clone(),
                })
                .collect(),
        );
        Ok(updated)
    }

    async fn delete(&self, query: &Query) -> Result<Vec<Value>, RemoteError> {
        self.check(query.table)?;
        let removed: Vec<Value> = {
            let mut tables = self.inner.tables.lock().expect("store lock poisoned");
            let rows = tables.rows.entry(query.table).or_default();
            let (removed, kept): (Vec<Value>, Vec<Value>) =
                rows.drain(..).partition(|r| query.matches(r));
            *rows = kept;
            removed
        };

        self.inner.publish(
            removed
                .iter()
                .map(|record| ChangeEvent {
                    kind: ChangeKind::Delete,
                    table: query.table,
                    record: record.clone(),
                })
                .collect(),
        );
        Ok(removed)
    }

    fn subscribe(
        &self,
        filters: Vec<ChangeFilter>,
        sink: ChangeSink,
    ) -> Result<Subscription, RemoteError> {
        for filter in &filters {
            self.check(filter.table)?;
        }

        let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.inner
            .subscribers
            .lock()
            .expect("store lock poisoned")
            .insert(id, Subscriber { filters, sink });

        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        Ok(Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.unsubscribe(id);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder() -> (ChangeSink, Arc<Mutex<Vec<ChangeEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let sink: ChangeSink = Arc::new(move |event| s.lock().unwrap().push(event));
        (sink, seen)
    }

    #[tokio::test]
    async fn insert_assigns_id_and_increasing_created_at() {
        let store = InMemoryRemoteStore::new();
        let a = store
            .insert(Table::ChatMessages, json!({"message": "a"}))
            .await
            .unwrap();
        let b = store
            .insert(Table::ChatMessages, json!({"message": "b"}))
            .await
            .unwrap();

        assert!(a["id"].as_str().unwrap().parse::<Uuid>().is_ok());
        assert!(a["created_at"].as_str().unwrap() < b["created_at"].as_str().unwrap());
    }

    #[tokio::test]
    async fn select_orders_and_limits() {
        let store = InMemoryRemoteStore::new();
        for n in [3, 1, 2] {
            store
                .insert(Table::ItineraryDays, json!({"trip_id": "t", "day_number": n}))
                .await
                .unwrap();
        }
        store
            .insert(Table::ItineraryDays, json!({"trip_id": "other", "day_number": 0}))
            .await
            .unwrap();

        let q = Query::new(Table::ItineraryDays)
            .eq("trip_id", "t")
            .order_by("day_number", true);
        let days: Vec<u64> = store
            .select(&q)
            .await
            .unwrap()
            .iter()
            .map(|r| r["day_number"].as_u64().unwrap())
            .collect();
        assert_eq!(days, vec![1, 2, 3]);

        let newest = store
            .select(&q.clone().order_by("day_number", false).limit(1))
            .await
            .unwrap();
        assert_eq!(newest[0]["day_number"], 3);
    }

    #[tokio::test]
    async fn active_invite_codes_are_unique() {
        let store = InMemoryRemoteStore::new();
        store
            .insert(Table::Lobbies, json!({"invite_code": "AAAA1111", "is_active": true}))
            .await
            .unwrap();
        let err = store
            .insert(Table::Lobbies, json!({"invite_code": "AAAA1111", "is_active": true}))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Conflict { table: Table::Lobbies, .. }));

        store
            .update(
                &Query::new(Table::Lobbies).eq("invite_code", "AAAA1111"),
                json!({"is_active": false}),
            )
            .await
            .unwrap();
        store
            .insert(Table::Lobbies, json!({"invite_code": "AAAA1111", "is_active": true}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn changes_reach_matching_subscribers_until_closed() {
        let store = InMemoryRemoteStore::new();
        let (sink, seen) = recorder();
        let sub = store
            .subscribe(
                vec![ChangeFilter::table(Table::ChatMessages).eq("lobby_id", "L1")],
                sink,
            )
            .unwrap();

        store
            .insert(Table::ChatMessages, json!({"lobby_id": "L1"}))
            .await
            .unwrap();
        store
            .insert(Table::ChatMessages, json!({"lobby_id": "L2"}))
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(store.subscriber_count(), 1);

        sub.close();
        assert_eq!(store.subscriber_count(), 0);
        store
            .insert(Table::ChatMessages, json!({"lobby_id": "L1"}))
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_and_delete_emit_row_events() {
        let store = InMemoryRemoteStore::new();
        let row = store
            .insert(Table::ItineraryItems, json!({"day_id": "d", "place_name": "A"}))
            .await
            .unwrap();
        let (sink, seen) = recorder();
        let _sub = store
            .subscribe(vec![ChangeFilter::table(Table::ItineraryItems)], sink)
            .unwrap();

        let by_id = Query::new(Table::ItineraryItems).eq("id", &row["id"]);
        let updated = store
            .update(&by_id, json!({"place_name": "B"}))
            .await
            .unwrap();
        assert_eq!(updated[0]["place_name"], "B");
        assert_eq!(store.delete(&by_id).await.unwrap().len(), 1);
        assert!(store.delete(&by_id).await.unwrap().is_empty());

        let kinds: Vec<ChangeKind> = seen.lock().unwrap().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Update, ChangeKind::Delete]);
    }

    #[tokio::test]
    async fn fault_injection() {
        let store = InMemoryRemoteStore::new();
        store.unprovision(Table::TripBudgets);
        let err = store
            .insert(Table::TripBudgets, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::NotProvisioned(Table::TripBudgets)));

        store.set_offline(true);
        let err = store
            .select(&Query::new(Table::Trips))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Unavailable(_)));
        store.set_offline(false);
        assert!(store.select(&Query::new(Table::Trips)).await.unwrap().is_empty());
    }
}
