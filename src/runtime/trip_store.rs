use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort, SpawnErr};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::identity::{IdentityError, IdentityProvider};
use super::lobby::{LobbyChanged, LobbyError, LobbyHandle};
use super::remote_store::{
    decode, decode_all, encode, ChangeEvent, ChangeFilter, ChangeSink, Query, RemoteError,
    RemoteStore, Subscription, Table,
};
use super::rpc;
use crate::domain::budget::{Budget, BudgetBreakdown, BudgetPatch};
use crate::domain::model::{
    ItemPatch, ItineraryDay, ItineraryItem, NewDay, NewItem, NewTrip, Trip, UNNAMED_PLACE,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TripError {
    #[error("not in a lobby; create or join one before planning a trip")]
    NoLobby,
    #[error("no active trip; create or load a trip first")]
    NoTrip,
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("load superseded by a newer request")]
    Superseded,
    #[error(transparent)]
    Lobby(#[from] LobbyError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("trip store call failed: {0}")]
    Actor(String),
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    #[default]
    Unloaded,
    Loading,
    Loaded,
}

/// One fully fetched trip graph. Replaced as a whole, never patched in place
/// by a reload.
#[derive(Debug, Clone)]
pub struct TripGraph {
    trip: Trip,
    days: Vec<ItineraryDay>,
    items: HashMap<Uuid, Vec<ItineraryItem>>,
    budget: Option<Budget>,
}

/// Read surface for presentation and export.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TripSnapshot {
    pub status: TripStatus,
    pub trip: Option<Trip>,
    /// Sorted by `day_number`.
    pub days: Vec<ItineraryDay>,
    /// Keyed by day id, each list sorted by `order_index`.
    pub items: HashMap<Uuid, Vec<ItineraryItem>>,
    pub budget: Option<Budget>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayWithItems {
    #[serde(flatten)]
    pub day: ItineraryDay,
    pub items: Vec<ItineraryItem>,
}

impl TripSnapshot {
    pub fn items_for(&self, day_id: Uuid) -> &[ItineraryItem] {
        self.items.get(&day_id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn days_with_items(&self) -> Vec<DayWithItems> {
        self.days
            .iter()
            .map(|day| DayWithItems {
                day: day.clone(),
                items: self.items_for(day.id).to_vec(),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

type Reply<T> = RpcReplyPort<Result<T, TripError>>;

pub enum TripMessage {
    Create {
        input: NewTrip,
        reply: Reply<Trip>,
    },
    Load {
        trip_id: Uuid,
        reply: Reply<()>,
    },
    AddDay {
        day: NewDay,
        reply: Reply<ItineraryDay>,
    },
    AddItem {
        day_id: Uuid,
        item: NewItem,
        reply: Reply<ItineraryItem>,
    },
    UpdateItem {
        item_id: Uuid,
        patch: ItemPatch,
        reply: Reply<()>,
    },
    DeleteItem {
        item_id: Uuid,
        day_id: Uuid,
        reply: Reply<()>,
    },
    UpdateBudget {
        patch: BudgetPatch,
        reply: Reply<Budget>,
    },
    Clear(RpcReplyPort<()>),
    Snapshot(RpcReplyPort<TripSnapshot>),
    LobbyChanged(Option<Uuid>),
    /// Change-feed delivery, tagged with the subscription it arrived on.
    RemoteChange {
        subscription: u64,
        event: ChangeEvent,
    },
    /// A spawned fetch finished. `reply` is set for caller-initiated loads.
    LoadFinished {
        generation: u64,
        trip_id: Uuid,
        result: Result<TripGraph, TripError>,
        reply: Option<Reply<()>>,
    },
}

// ---------------------------------------------------------------------------
// TripStoreActor
// ---------------------------------------------------------------------------

pub struct TripStoreActor;

pub struct TripStoreArgs {
    pub remote: Arc<dyn RemoteStore>,
    pub identity: Arc<IdentityProvider>,
    pub lobby: LobbyHandle,
    pub default_currency: String,
}

pub struct TripStoreState {
    remote: Arc<dyn RemoteStore>,
    identity: Arc<IdentityProvider>,
    lobby: LobbyHandle,
    default_currency: String,
    status: TripStatus,
    graph: Option<TripGraph>,
    /// Bumped by every load, reload and clear. Completions carrying an
    /// older value are discarded.
    generation: u64,
    in_flight: Option<Uuid>,
    /// A relevant change arrived while a fetch was in flight.
    dirty: bool,
    /// This store wrote locally while a fetch was in flight, so that fetch
    /// may predate the write.
    local_writes: bool,
    subscription: Option<Subscription>,
    subscription_generation: u64,
    subscribed_trip: Option<Uuid>,
}

impl Actor for TripStoreActor {
    type Msg = TripMessage;
    type State = TripStoreState;
    type Arguments = TripStoreArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(TripStoreState {
            remote: args.remote,
            identity: args.identity,
            lobby: args.lobby,
            default_currency: args.default_currency,
            status: TripStatus::Unloaded,
            graph: None,
            generation: 0,
            in_flight: None,
            dirty: false,
            local_writes: false,
            subscription: None,
            subscription_generation: 0,
            subscribed_trip: None,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            TripMessage::Create { input, reply } => {
                let _ = reply.send(create_trip(&myself, state, input).await);
            }
            TripMessage::Load { trip_id, reply } => {
                begin_load(&myself, state, trip_id, Some(reply));
            }
            TripMessage::AddDay { day, reply } => {
                let _ = reply.send(add_day(state, day).await);
            }
            TripMessage::AddItem {
                day_id,
                item,
                reply,
            } => {
                let _ = reply.send(add_item(state, day_id, item).await);
            }
            TripMessage::UpdateItem {
                item_id,
                patch,
                reply,
            } => {
                let _ = reply.send(update_item(state, item_id, patch).await);
            }
            TripMessage::DeleteItem {
                item_id,
                day_id,
                reply,
            } => {
                let _ = reply.send(delete_item(state, item_id, day_id).await);
            }
            TripMessage::UpdateBudget { patch, reply } => {
                let _ = reply.send(update_budget(state, patch).await);
            }
            TripMessage::Clear(reply) => {
                clear(state).await;
                let _ = reply.send(());
            }
            TripMessage::Snapshot(reply) => {
                let _ = reply.send(snapshot(state));
            }
            TripMessage::LobbyChanged(lobby_id) => {
                on_lobby_changed(state, lobby_id).await;
            }
            TripMessage::RemoteChange {
                subscription,
                event,
            } => {
                on_remote_change(&myself, state, subscription, event);
            }
            TripMessage::LoadFinished {
                generation,
                trip_id,
                result,
                reply,
            } => {
                if generation == state.generation && result.is_ok() && state.local_writes {
                    debug!(%trip_id, "local writes during fetch; fetching again");
                    begin_load(&myself, state, trip_id, reply);
                    return Ok(());
                }
                let explicit = reply.is_some();
                let outcome =
                    finish_load(&myself, state, generation, trip_id, result, explicit).await;
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        detach(state);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Subscription lifecycle
// ---------------------------------------------------------------------------

/// Close the current channel (if any) and open one for `trip_id`.
fn attach(
    myself: &ActorRef<TripMessage>,
    state: &mut TripStoreState,
    trip_id: Uuid,
) -> Result<(), RemoteError> {
    detach(state);

    let subscription = state.subscription_generation;
    let actor = myself.clone();
    let sink: ChangeSink = Arc::new(move |event| {
        let _ = actor.send_message(TripMessage::RemoteChange {
            subscription,
            event,
        });
    });
    // Items carry no trip id; they are scoped by day when the event arrives.
    let filters = vec![
        ChangeFilter::table(Table::ItineraryItems),
        ChangeFilter::table(Table::ItineraryDays).eq("trip_id", trip_id),
        ChangeFilter::table(Table::TripBudgets).eq("trip_id", trip_id),
    ];
    state.subscription = Some(state.remote.subscribe(filters, sink)?);
    state.subscribed_trip = Some(trip_id);
    debug!(%trip_id, subscription, "attached trip subscription");
    Ok(())
}

fn detach(state: &mut TripStoreState) {
    if let Some(subscription) = state.subscription.take() {
        subscription.close();
    }
    state.subscribed_trip = None;
    state.subscription_generation += 1;
}

fn ensure_attached(myself: &ActorRef<TripMessage>, state: &mut TripStoreState, trip_id: Uuid) {
    if state.subscribed_trip == Some(trip_id) && state.subscription.is_some() {
        return;
    }
    if let Err(error) = attach(myself, state, trip_id) {
        warn!(%trip_id, %error, "live updates unavailable for trip");
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Fetch trip, days and budget concurrently, then each day's items in turn.
async fn fetch_trip_graph(remote: &dyn RemoteStore, trip_id: Uuid) -> Result<TripGraph, TripError> {
    let trip_query = Query::new(Table::Trips).eq("id", trip_id).limit(1);
    let days_query = Query::new(Table::ItineraryDays)
        .eq("trip_id", trip_id)
        .order_by("day_number", true);
    let budget_query = Query::new(Table::TripBudgets).eq("trip_id", trip_id).limit(1);

    let (trip_rows, day_rows, budget_rows) = tokio::join!(
        remote.select(&trip_query),
        remote.select(&days_query),
        remote.select(&budget_query),
    );

    let trip: Trip = match trip_rows?.into_iter().next() {
        Some(row) => decode(row)?,
        None => return Err(TripError::NotFound(format!("trip {trip_id}"))),
    };
    let mut days: Vec<ItineraryDay> = decode_all(day_rows?)?;
    days.sort_by_key(|d| d.day_number);

    let budget = budget_rows.and_then(|rows| rows.into_iter().next().map(decode::<Budget>).transpose());
    let budget = match budget {
        Ok(budget) => budget,
        Err(error) => {
            warn!(%trip_id, %error, "budget unavailable; loading trip without it");
            None
        }
    };

    let mut items = HashMap::with_capacity(days.len());
    for day in &days {
        let rows = remote
            .select(
                &Query::new(Table::ItineraryItems)
                    .eq("day_id", day.id)
                    .order_by("order_index", true),
            )
            .await?;
        items.insert(day.id, decode_all(rows)?);
    }

    Ok(TripGraph {
        trip,
        days,
        items,
        budget,
    })
}

/// Start a fetch in the background; the outcome comes back as `LoadFinished`.
fn begin_load(
    myself: &ActorRef<TripMessage>,
    state: &mut TripStoreState,
    trip_id: Uuid,
    reply: Option<Reply<()>>,
) {
    state.generation += 1;
    let generation = state.generation;
    let switching = state.graph.as_ref().map(|g| g.trip.id) != Some(trip_id);

    ensure_attached(myself, state, trip_id);
    if switching {
        state.status = TripStatus::Loading;
    }
    state.in_flight = Some(trip_id);
    state.dirty = false;
    state.local_writes = false;
    debug!(%trip_id, generation, reload = reply.is_none(), "loading trip");

    let remote = state.remote.clone();
    let actor = myself.clone();
    tokio::spawn(async move {
        let result = fetch_trip_graph(remote.as_ref(), trip_id).await;
        let _ = actor.send_message(TripMessage::LoadFinished {
            generation,
            trip_id,
            result,
            reply,
        });
    });
}

/// Apply a finished fetch unless a newer load, reload or clear started since.
async fn finish_load(
    myself: &ActorRef<TripMessage>,
    state: &mut TripStoreState,
    generation: u64,
    trip_id: Uuid,
    result: Result<TripGraph, TripError>,
    explicit: bool,
) -> Result<(), TripError> {
    if generation != state.generation {
        debug!(%trip_id, generation, current = state.generation, "discarding superseded load");
        return Err(TripError::Superseded);
    }
    state.in_flight = None;

    let outcome = match result {
        Ok(graph) => {
            debug!(%trip_id, days = graph.days.len(), "trip loaded");
            state.graph = Some(graph);
            state.status = TripStatus::Loaded;
            if explicit {
                if let Err(error) = state.lobby.set_current_trip(Some(trip_id)).await {
                    warn!(%trip_id, %error, "could not remember current trip");
                }
            }
            Ok(())
        }
        Err(error) => {
            // Keep whatever was visible before and point the feed back at it.
            match state.graph.as_ref().map(|g| g.trip.id) {
                Some(previous) => {
                    state.status = TripStatus::Loaded;
                    ensure_attached(myself, state, previous);
                }
                None => {
                    state.status = TripStatus::Unloaded;
                    detach(state);
                }
            }
            if explicit {
                warn!(%trip_id, %error, "trip load failed");
            } else {
                warn!(%trip_id, %error, "background reload failed; keeping previous snapshot");
            }
            Err(error)
        }
    };

    if state.dirty && state.status == TripStatus::Loaded {
        if let Some(current) = state.graph.as_ref().map(|g| g.trip.id) {
            begin_load(myself, state, current, None);
        }
    }
    outcome
}

/// Any relevant change triggers one full reload; changes during a reload
/// coalesce into a single follow-up.
fn on_remote_change(
    myself: &ActorRef<TripMessage>,
    state: &mut TripStoreState,
    subscription: u64,
    event: ChangeEvent,
) {
    if subscription != state.subscription_generation || state.subscription.is_none() {
        return;
    }

    if event.table == Table::ItineraryItems && state.in_flight.is_none() {
        let day_id = event
            .record
            .get("day_id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<Uuid>().ok());
        let known = match (day_id, &state.graph) {
            (Some(day_id), Some(graph)) => graph.items.contains_key(&day_id),
            _ => false,
        };
        if !known {
            return;
        }
    }

    if state.in_flight.is_some() {
        state.dirty = true;
        return;
    }
    let Some(trip_id) = state.subscribed_trip else {
        return;
    };
    debug!(%trip_id, table = %event.table, kind = ?event.kind, "remote change; reloading");
    begin_load(myself, state, trip_id, None);
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

fn loaded(state: &TripStoreState) -> Result<&TripGraph, TripError> {
    match (&state.graph, state.status) {
        (Some(graph), TripStatus::Loaded) => Ok(graph),
        _ => Err(TripError::NoTrip),
    }
}

fn note_local_write(state: &mut TripStoreState) {
    if state.in_flight.is_some() {
        state.local_writes = true;
    }
}

fn with_field(row: Value, key: &str, value: Value) -> Value {
    match row {
        Value::Object(mut fields) => {
            fields.insert(key.to_string(), value);
            Value::Object(fields)
        }
        other => other,
    }
}

#[tracing::instrument(skip_all, fields(name = %input.name))]
async fn create_trip(
    myself: &ActorRef<TripMessage>,
    state: &mut TripStoreState,
    input: NewTrip,
) -> Result<Trip, TripError> {
    if input.name.trim().is_empty() || input.destination.trim().is_empty() {
        return Err(TripError::Validation(
            "trip name and destination are required".into(),
        ));
    }
    if input.end_date < input.start_date {
        return Err(TripError::Validation(
            "end date must not be before start date".into(),
        ));
    }
    let lobby = state
        .lobby
        .current_lobby()
        .await?
        .ok_or(TripError::NoLobby)?;
    let participant = state.identity.get_or_create()?;

    let row = json!({
        "lobby_id": lobby.id,
        "name": input.name.trim(),
        "destination": input.destination.trim(),
        "start_date": input.start_date,
        "end_date": input.end_date,
        "created_by": participant.id,
    });
    let trip: Trip = decode(state.remote.insert(Table::Trips, row).await?)?;
    info!(trip_id = %trip.id, lobby_id = %lobby.id, "created trip");

    if let Some(total) = input.budget.filter(|b| *b > 0.0) {
        let row = json!({
            "trip_id": trip.id,
            "total_budget": total,
            "currency": state.default_currency,
            "breakdown": BudgetBreakdown::default(),
            "actual_spent": 0.0,
        });
        if let Err(error) = state.remote.insert(Table::TripBudgets, row).await {
            warn!(trip_id = %trip.id, %error, "budget unavailable; trip created without one");
        }
    }

    // Load inline so the caller observes the new trip when this returns.
    state.generation += 1;
    let generation = state.generation;
    ensure_attached(myself, state, trip.id);
    state.status = TripStatus::Loading;
    state.in_flight = Some(trip.id);
    state.dirty = false;
    state.local_writes = false;
    let result = fetch_trip_graph(state.remote.as_ref(), trip.id).await;
    finish_load(myself, state, generation, trip.id, result, true).await?;
    Ok(trip)
}

async fn add_day(state: &mut TripStoreState, day: NewDay) -> Result<ItineraryDay, TripError> {
    let trip_id = loaded(state)?.trip.id;
    if day.day_number == 0 {
        return Err(TripError::Validation("day_number starts at 1".into()));
    }

    let row = with_field(encode(&day)?, "trip_id", json!(trip_id));
    let day: ItineraryDay = decode(state.remote.insert(Table::ItineraryDays, row).await?)?;

    if let Some(graph) = state.graph.as_mut().filter(|g| g.trip.id == trip_id) {
        graph.days.retain(|d| d.id != day.id);
        graph.days.push(day.clone());
        graph.days.sort_by_key(|d| d.day_number);
        graph.items.entry(day.id).or_default();
    }
    note_local_write(state);
    debug!(%trip_id, day_id = %day.id, day_number = day.day_number, "added day");
    Ok(day)
}

/// `order_index` is the day's current local length. Safe against this
/// client's own calls (the mailbox serializes them), not against a second
/// client inserting into the same day at the same moment.
async fn add_item(
    state: &mut TripStoreState,
    day_id: Uuid,
    item: NewItem,
) -> Result<ItineraryItem, TripError> {
    let graph = loaded(state)?;
    let Some(existing) = graph.items.get(&day_id) else {
        return Err(TripError::NotFound(format!("day {day_id}")));
    };
    let order_index = existing.len() as u32;

    let place_name = item
        .place_name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| UNNAMED_PLACE.to_string());
    let row = json!({
        "day_id": day_id,
        "place_name": place_name,
        "place_type": item.place_type,
        "place_id": item.place_id,
        "place_address": item.place_address,
        "lat": item.lat,
        "lng": item.lng,
        "start_time": item.start_time,
        "end_time": item.end_time,
        "order_index": order_index,
        "notes": item.notes,
        "grounding_data": item.grounding_data,
    });
    let item: ItineraryItem = decode(state.remote.insert(Table::ItineraryItems, row).await?)?;

    if let Some(list) = state.graph.as_mut().and_then(|g| g.items.get_mut(&day_id)) {
        if !list.iter().any(|i| i.id == item.id) {
            list.push(item.clone());
        }
    }
    note_local_write(state);
    debug!(%day_id, item_id = %item.id, order_index, "added item");
    Ok(item)
}

/// Persist only. The change shows up through the feed-driven reload.
async fn update_item(
    state: &mut TripStoreState,
    item_id: Uuid,
    patch: ItemPatch,
) -> Result<(), TripError> {
    if patch.is_empty() {
        return Err(TripError::Validation("item patch has no fields".into()));
    }
    let updated = state
        .remote
        .update(
            &Query::new(Table::ItineraryItems).eq("id", item_id),
            encode(&patch)?,
        )
        .await?;
    if updated.is_empty() {
        return Err(TripError::NotFound(format!("item {item_id}")));
    }
    Ok(())
}

/// Persist, then drop locally and close the gap so the day's indexes stay
/// `0..n`. Removing an absent id is a no-op.
async fn delete_item(
    state: &mut TripStoreState,
    item_id: Uuid,
    day_id: Uuid,
) -> Result<(), TripError> {
    state
        .remote
        .delete(&Query::new(Table::ItineraryItems).eq("id", item_id))
        .await?;
    if let Some(list) = state.graph.as_mut().and_then(|g| g.items.get_mut(&day_id)) {
        list.retain(|i| i.id != item_id);
    }
    compact_order(state, day_id).await;
    note_local_write(state);
    Ok(())
}

/// Renumber a day's items to their list position. A failed write stops the
/// pass; the next reload shows whatever the server holds.
async fn compact_order(state: &mut TripStoreState, day_id: Uuid) {
    let moves: Vec<(usize, Uuid)> = match state.graph.as_ref().and_then(|g| g.items.get(&day_id)) {
        Some(list) => list
            .iter()
            .enumerate()
            .filter(|(position, item)| item.order_index as usize != *position)
            .map(|(position, item)| (position, item.id))
            .collect(),
        None => return,
    };

    for (position, id) in moves {
        let order_index = position as u32;
        let result = state
            .remote
            .update(
                &Query::new(Table::ItineraryItems).eq("id", id),
                json!({ "order_index": order_index }),
            )
            .await;
        if let Err(error) = result {
            warn!(%day_id, item_id = %id, %error, "could not renumber item");
            return;
        }
        if let Some(item) = state
            .graph
            .as_mut()
            .and_then(|g| g.items.get_mut(&day_id))
            .and_then(|list| list.iter_mut().find(|i| i.id == id))
        {
            item.order_index = order_index;
        }
    }
}

/// The stored row returned by the server replaces the local budget.
async fn update_budget(state: &mut TripStoreState, patch: BudgetPatch) -> Result<Budget, TripError> {
    let trip_id = loaded(state)?.trip.id;
    patch
        .validate()
        .map_err(|e| TripError::Validation(e.to_string()))?;
    let body = encode(&patch)?;
    if body.as_object().is_none_or(|o| o.is_empty()) {
        return Err(TripError::Validation("budget patch has no fields".into()));
    }

    let rows = state
        .remote
        .update(&Query::new(Table::TripBudgets).eq("trip_id", trip_id), body)
        .await?;
    let budget: Budget = match rows.into_iter().next() {
        Some(row) => decode(row)?,
        None => return Err(TripError::NotFound(format!("budget for trip {trip_id}"))),
    };

    if let Some(graph) = state.graph.as_mut().filter(|g| g.trip.id == trip_id) {
        graph.budget = Some(budget.clone());
    }
    note_local_write(state);
    Ok(budget)
}

async fn clear(state: &mut TripStoreState) {
    state.generation += 1;
    detach(state);
    state.graph = None;
    state.status = TripStatus::Unloaded;
    state.in_flight = None;
    state.dirty = false;
    state.local_writes = false;
    if let Err(error) = state.lobby.set_current_trip(None).await {
        warn!(%error, "could not forget current trip");
    }
}

/// The payload is only a hint; the lobby actor is asked for the truth so
/// notifications that arrive late cannot clear a newer trip.
async fn on_lobby_changed(state: &mut TripStoreState, hint: Option<Uuid>) {
    let current = match state.lobby.current_lobby().await {
        Ok(lobby) => lobby.map(|l| l.id),
        Err(error) => {
            warn!(%error, "could not resolve current lobby");
            hint
        }
    };
    let Some(graph) = &state.graph else {
        if current.is_none() && state.in_flight.is_some() {
            clear(state).await;
        }
        return;
    };
    if current != Some(graph.trip.lobby_id) {
        info!(trip_id = %graph.trip.id, "lobby changed; clearing trip");
        clear(state).await;
    }
}

fn snapshot(state: &TripStoreState) -> TripSnapshot {
    match &state.graph {
        Some(graph) => TripSnapshot {
            status: state.status,
            trip: Some(graph.trip.clone()),
            days: graph.days.clone(),
            items: graph.items.clone(),
            budget: graph.budget.clone(),
        },
        None => TripSnapshot {
            status: state.status,
            ..Default::default()
        },
    }
}

// ---------------------------------------------------------------------------
// TripStoreHandle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct TripStoreHandle {
    actor: ActorRef<TripMessage>,
    timeout: Duration,
}

/// Spawn the store and register it for lobby changes.
pub async fn spawn_trip_store(
    args: TripStoreArgs,
    timeout: Duration,
) -> Result<(TripStoreHandle, JoinHandle<()>), SpawnErr> {
    let lobby = args.lobby.clone();
    let (actor, handle) = Actor::spawn(None, TripStoreActor, args).await?;
    lobby.on_change(actor.clone(), |LobbyChanged(lobby)| {
        Some(TripMessage::LobbyChanged(lobby.map(|l| l.id)))
    });
    Ok((TripStoreHandle { actor, timeout }, handle))
}

impl TripStoreHandle {
    pub async fn create_trip(&self, input: NewTrip) -> Result<Trip, TripError> {
        rpc(
            &self.actor,
            |reply| TripMessage::Create { input, reply },
            self.timeout,
        )
        .await
        .map_err(TripError::Actor)?
    }

    pub async fn load_trip(&self, trip_id: Uuid) -> Result<(), TripError> {
        rpc(
            &self.actor,
            |reply| TripMessage::Load { trip_id, reply },
            self.timeout,
        )
        .await
        .map_err(TripError::Actor)?
    }

    pub async fn add_day(&self, day: NewDay) -> Result<ItineraryDay, TripError> {
        rpc(
            &self.actor,
            |reply| TripMessage::AddDay { day, reply },
            self.timeout,
        )
        .await
        .map_err(TripError::Actor)?
    }

    pub async fn add_item(&self, day_id: Uuid, item: NewItem) -> Result<ItineraryItem, TripError> {
        rpc(
            &self.actor,
            |reply| TripMessage::AddItem {
                day_id,
                item,
                reply,
            },
            self.timeout,
        )
        .await
        .map_err(TripError::Actor)?
    }

    pub async fn update_item(&self, item_id: Uuid, patch: ItemPatch) -> Result<(), TripError> {
        rpc(
            &self.actor,
            |reply| TripMessage::UpdateItem {
                item_id,
                patch,
                reply,
            },
            self.timeout,
        )
        .await
        .map_err(TripError::Actor)?
    }

    pub async fn delete_item(&self, item_id: Uuid, day_id: Uuid) -> Result<(), TripError> {
        rpc(
            &self.actor,
            |reply| TripMessage::DeleteItem {
                item_id,
                day_id,
                reply,
            },
            self.timeout,
        )
        .await
        .map_err(TripError::Actor)?
    }

    pub async fn update_budget(&self, patch: BudgetPatch) -> Result<Budget, TripError> {
        rpc(
            &self.actor,
            |reply| TripMessage::UpdateBudget { patch, reply },
            self.timeout,
        )
        .await
        .map_err(TripError::Actor)?
    }

    pub async fn clear_trip(&self) -> Result<(), TripError> {
        rpc(&self.actor, TripMessage::Clear, self.timeout)
            .await
            .map_err(TripError::Actor)
    }

    pub async fn snapshot(&self) -> Result<TripSnapshot, TripError> {
        rpc(&self.actor, TripMessage::Snapshot, self.timeout)
            .await
            .map_err(TripError::Actor)
    }

    pub fn stop(&self) {
        self.actor.stop(None);
    }
}
