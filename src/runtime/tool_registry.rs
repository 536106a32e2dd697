use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::trip_store::{TripError, TripStoreHandle};
use crate::domain::budget::{BudgetBreakdown, BudgetPatch};
use crate::domain::model::ModalKind;
use crate::domain::tool::{Scheduling, ToolCall, ToolDefinition, ToolName, ToolParseError};

// ---------------------------------------------------------------------------
// Requests, responses, errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    /// Idempotency key for entity-creating tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub tool: String,
    /// `None` only for tool names outside the registry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduling: Option<Scheduling>,
    pub result: Value,
}

impl ToolResponse {
    pub fn succeeded(&self) -> bool {
        self.result.get("success").and_then(Value::as_bool) == Some(true)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("No active trip found. Please create a trip first using createTrip.")]
    NoTrip,
    #[error(transparent)]
    Trip(#[from] TripError),
    #[error("presenter failed: {0}")]
    Presenter(String),
    #[error("failed to encode tool result: {0}")]
    Encode(#[from] serde_json::Error),
}

/// UI effects requested by INTERRUPT tools.
pub trait Presenter: Send + Sync + 'static {
    fn open_modal(&self, kind: ModalKind, payload: Option<Value>) -> Result<(), String>;
}

/// Presenter for headless runs; effects are only logged.
pub struct NoopPresenter;

impl Presenter for NoopPresenter {
    fn open_modal(&self, kind: ModalKind, _payload: Option<Value>) -> Result<(), String> {
        debug!(?kind, "modal requested with no presenter attached");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Idempotency memory
// ---------------------------------------------------------------------------

type CallKey = (ToolName, String);

/// Successful responses for the most recent keyed calls, oldest evicted first.
struct RecentCalls {
    capacity: usize,
    order: VecDeque<CallKey>,
    responses: HashMap<CallKey, ToolResponse>,
}

impl RecentCalls {
    fn new(capacity: usize) -> Self {
        RecentCalls {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            responses: HashMap::new(),
        }
    }

    fn get(&self, key: &CallKey) -> Option<&ToolResponse> {
        self.responses.get(key)
    }

    fn remember(&mut self, key: CallKey, response: ToolResponse) {
        if self.responses.insert(key.clone(), response).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.responses.remove(&evicted);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ToolRegistry
// ---------------------------------------------------------------------------

pub struct ToolRegistry {
    trips: TripStoreHandle,
    presenter: Arc<dyn Presenter>,
    recent: Mutex<RecentCalls>,
}

impl ToolRegistry {
    pub fn new(
        trips: TripStoreHandle,
        presenter: Arc<dyn Presenter>,
        idempotency_window: usize,
    ) -> Self {
        ToolRegistry {
            trips,
            presenter,
            recent: Mutex::new(RecentCalls::new(idempotency_window)),
        }
    }

    pub fn definitions() -> Vec<ToolDefinition> {
        ToolName::ALL.iter().map(ToolName::definition).collect()
    }

    /// Validate, execute and render one tool call. Never fails: every
    /// outcome is a `{success, ...}` result for the agent.
    #[tracing::instrument(skip_all, fields(tool = %request.name, call_id = ?request.call_id))]
    pub async fn dispatch(&self, request: ToolRequest) -> ToolResponse {
        let call = match ToolCall::parse(&request.name, &request.arguments) {
            Ok(call) => call,
            Err(error) => {
                warn!(%error, "rejected tool call");
                return rejected(&request.name, error);
            }
        };
        let tool = call.name();

        let key = request
            .call_id
            .filter(|id| !id.trim().is_empty() && tool.creates_entity());
        let Some(call_id) = key else {
            return respond(tool, self.execute(call).await);
        };

        // Held across execution so a concurrent retry waits for the first outcome.
        let key = (tool, call_id);
        let mut recent = self.recent.lock().await;
        if let Some(previous) = recent.get(&key) {
            info!("repeated call id; returning earlier response");
            return previous.clone();
        }
        let response = respond(tool, self.execute(call).await);
        if response.succeeded() {
            recent.remember(key, response.clone());
        }
        response
    }

    async fn execute(&self, call: ToolCall) -> Result<Value, ToolError> {
        match call {
            ToolCall::CreateTrip(args) => {
                let trip = self.trips.create_trip(args.into()).await?;
                Ok(json!({
                    "success": true,
                    "trip_id": trip.id,
                    "message": format!(
                        "Created trip \"{}\" to {} from {} to {}",
                        trip.name, trip.destination, trip.start_date, trip.end_date
                    ),
                    "trip": trip,
                }))
            }
            ToolCall::AddItineraryDay(args) => {
                let day = self.trips.add_day(args.into()).await?;
                Ok(json!({
                    "success": true,
                    "day_id": day.id,
                    "message": format!("Added day {}: {}", day.day_number, day.date),
                    "day": day,
                }))
            }
            ToolCall::AddItineraryItem(args) => {
                let day_id = args.day_id;
                let item = self.trips.add_item(day_id, args.into()).await?;
                Ok(json!({
                    "success": true,
                    "item_id": item.id,
                    "message": format!("Added {}: {}", item.place_type.as_str(), item.place_name),
                    "item": item,
                }))
            }
            ToolCall::UpdateBudget(args) => {
                let breakdown = BudgetBreakdown::from(args);
                let budget = self
                    .trips
                    .update_budget(BudgetPatch {
                        breakdown: Some(breakdown),
                        ..Default::default()
                    })
                    .await?;
                Ok(json!({
                    "success": true,
                    "message": format!("Updated budget breakdown (Total: ${})", breakdown.total()),
                    "breakdown": breakdown,
                    "total_budget": budget.total_budget,
                    "currency": budget.currency,
                    "allocated": budget.allocated(),
                    "remaining": budget.remaining(),
                }))
            }
            ToolCall::GetCurrentTrip => {
                let snapshot = self.trips.snapshot().await?;
                let Some(trip) = &snapshot.trip else {
                    return Err(ToolError::NoTrip);
                };
                let mut trip = serde_json::to_value(trip)?;
                if let Value::Object(fields) = &mut trip {
                    fields.insert(
                        "days".into(),
                        serde_json::to_value(snapshot.days_with_items())?,
                    );
                }
                let budget = match &snapshot.budget {
                    Some(budget) => json!({
                        "total_budget": budget.total_budget,
                        "currency": budget.currency,
                        "breakdown": budget.breakdown,
                        "actual_spent": budget.actual_spent,
                        "allocated": budget.allocated(),
                        "remaining": budget.remaining(),
                    }),
                    None => Value::Null,
                };
                Ok(json!({"success": true, "trip": trip, "budget": budget}))
            }
            ToolCall::ShowTripModal => {
                self.presenter
                    .open_modal(ModalKind::TripOverview, None)
                    .map_err(ToolError::Presenter)?;
                Ok(json!({"success": true, "message": "Displaying trip overview modal"}))
            }
        }
    }
}

fn respond(tool: ToolName, outcome: Result<Value, ToolError>) -> ToolResponse {
    let result = match outcome {
        Ok(result) => result,
        Err(error) => {
            warn!(tool = tool.as_str(), %error, "tool call failed");
            json!({"success": false, "error": error.to_string()})
        }
    };
    ToolResponse {
        tool: tool.as_str().to_string(),
        scheduling: Some(tool.scheduling()),
        result,
    }
}

fn rejected(name: &str, error: ToolParseError) -> ToolResponse {
    let result = match &error {
        ToolParseError::UnknownTool(_) => json!({"success": false, "error": error.to_string()}),
        ToolParseError::Invalid { violations, .. } => json!({
            "success": false,
            "error": error.to_string(),
            "violations": violations,
        }),
    };
    ToolResponse {
        tool: name.to_string(),
        scheduling: ToolName::parse(name).map(|t| t.scheduling()),
        result,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;
    use crate::domain::config::LobbyConfig;
    use crate::runtime::identity::IdentityProvider;
    use crate::runtime::lobby::{spawn_lobby, LobbyArgs, LobbyHandle};
    use crate::runtime::remote_store::{InMemoryRemoteStore, Query, RemoteStore, Table};
    use crate::runtime::storage::{LocalStorage, MemoryStorage};
    use crate::runtime::trip_store::{spawn_trip_store, TripStoreArgs};

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct RecordingPresenter {
        opened: StdMutex<Vec<ModalKind>>,
    }

    impl Presenter for RecordingPresenter {
        fn open_modal(&self, kind: ModalKind, _payload: Option<Value>) -> Result<(), String> {
            self.opened.lock().unwrap().push(kind);
            Ok(())
        }
    }

    struct Fixture {
        remote: InMemoryRemoteStore,
        lobby: LobbyHandle,
        presenter: Arc<RecordingPresenter>,
        tools: ToolRegistry,
    }

    async fn fixture() -> Fixture {
        let remote = InMemoryRemoteStore::new();
        let store: Arc<dyn RemoteStore> = Arc::new(remote.clone());
        let storage: Arc<dyn LocalStorage> = Arc::new(MemoryStorage::default());
        let identity = Arc::new(IdentityProvider::new(storage.clone()));
        let (lobby, _) = spawn_lobby(
            LobbyArgs {
                remote: store.clone(),
                storage: storage.clone(),
                identity: identity.clone(),
                config: LobbyConfig::default(),
                invite_codes: None,
            },
            TIMEOUT,
        )
        .await
        .unwrap();
        let (trips, _) = spawn_trip_store(
            TripStoreArgs {
                remote: store,
                identity,
                lobby: lobby.clone(),
                default_currency: "USD".into(),
            },
            TIMEOUT,
        )
        .await
        .unwrap();
        let presenter = Arc::new(RecordingPresenter::default());
        let tools = ToolRegistry::new(trips, presenter.clone(), 8);
        Fixture {
            remote,
            lobby,
            presenter,
            tools,
        }
    }

    fn request(name: &str, arguments: Value) -> ToolRequest {
        ToolRequest {
            name: name.into(),
            arguments,
            call_id: None,
        }
    }

    fn keyed(name: &str, arguments: Value, call_id: &str) -> ToolRequest {
        ToolRequest {
            call_id: Some(call_id.into()),
            ..request(name, arguments)
        }
    }

    fn tokyo() -> Value {
        json!({
            "name": "Tokyo",
            "destination": "Tokyo, Japan",
            "start_date": "2025-06-01",
            "end_date": "2025-06-07",
            "budget": 2000
        })
    }

    async fn trip_count(remote: &InMemoryRemoteStore) -> usize {
        remote.select(&Query::new(Table::Trips)).await.unwrap().len()
    }

    #[test]
    fn definitions_cover_every_tool() {
        let defs = ToolRegistry::definitions();
        assert_eq!(defs.len(), 6);
        let interrupting: Vec<&str> = defs
            .iter()
            .filter(|d| d.scheduling == Scheduling::Interrupt)
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(interrupting, vec!["showTripModal"]);
        let wire = serde_json::to_value(&defs[0]).unwrap();
        assert!(wire.get("inputSchema").is_some());
        assert_eq!(wire["scheduling"], "ASYNC");
    }

    #[tokio::test]
    async fn unknown_tool_is_a_structured_error() {
        let f = fixture().await;
        let response = f.tools.dispatch(request("bookFlight", json!({}))).await;
        assert!(!response.succeeded());
        assert_eq!(response.scheduling, None);
        assert!(response.result["error"].as_str().unwrap().contains("bookFlight"));
    }

    #[tokio::test]
    async fn schema_violations_never_reach_the_store() {
        let f = fixture().await;
        f.lobby.create_lobby("Trip Test", None).await.unwrap();

        let response = f
            .tools
            .dispatch(request("createTrip", json!({"destination": "Tokyo"})))
            .await;
        assert!(!response.succeeded());
        assert_eq!(response.scheduling, Some(Scheduling::Async));
        let fields: Vec<&str> = response.result["violations"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["field"].as_str().unwrap())
            .collect();
        assert!(fields.contains(&"name"));
        assert!(fields.contains(&"start_date"));
        assert_eq!(trip_count(&f.remote).await, 0);
    }

    #[tokio::test]
    async fn planning_scenario_end_to_end() {
        let f = fixture().await;
        f.lobby.create_lobby("Trip Test", None).await.unwrap();

        let created = f.tools.dispatch(request("createTrip", tokyo())).await;
        assert!(created.succeeded(), "{:?}", created.result);
        assert!(created.result["trip_id"].is_string());

        let current = f.tools.dispatch(request("getCurrentTrip", Value::Null)).await;
        assert!(current.succeeded());
        assert_eq!(current.result["trip"]["days"], json!([]));
        assert_eq!(current.result["budget"]["total_budget"], 2000.0);
        assert_eq!(current.result["budget"]["allocated"], 0.0);

        let day = f
            .tools
            .dispatch(request(
                "addItineraryDay",
                json!({"day_number": 1, "date": "2025-06-01", "title": "Arrival"}),
            ))
            .await;
        assert!(day.succeeded());
        assert_eq!(day.result["message"], "Added day 1: 2025-06-01");
        let day_id = day.result["day_id"].as_str().unwrap().to_string();

        let item = f
            .tools
            .dispatch(request(
                "addItineraryItem",
                json!({
                    "day_id": day_id,
                    "place_name": "Sushi Dai",
                    "place_type": "restaurant",
                    "lat": 35.6655,
                    "lng": 139.7707
                }),
            ))
            .await;
        assert!(item.succeeded(), "{:?}", item.result);
        assert_eq!(item.result["message"], "Added restaurant: Sushi Dai");
        assert_eq!(item.result["item"]["order_index"], 0);

        let current = f.tools.dispatch(request("getCurrentTrip", json!({}))).await;
        let days = current.result["trip"]["days"].as_array().unwrap();
        assert_eq!(days.len(), 1);
        assert_eq!(days[0]["items"][0]["place_name"], "Sushi Dai");
    }

    #[tokio::test]
    async fn get_current_trip_without_trip() {
        let f = fixture().await;
        let response = f.tools.dispatch(request("getCurrentTrip", json!({}))).await;
        assert!(!response.succeeded());
        assert_eq!(
            response.result["error"],
            "No active trip found. Please create a trip first using createTrip."
        );
    }

    #[tokio::test]
    async fn update_budget_fills_missing_categories() {
        let f = fixture().await;
        f.lobby.create_lobby("Trip Test", None).await.unwrap();
        f.tools.dispatch(request("createTrip", tokyo())).await;

        let response = f
            .tools
            .dispatch(request(
                "updateBudget",
                json!({"accommodation": 1200, "food": 300}),
            ))
            .await;
        assert!(response.succeeded(), "{:?}", response.result);
        assert_eq!(response.result["message"], "Updated budget breakdown (Total: $1500)");
        assert_eq!(response.result["breakdown"]["transportation"], 0.0);
        assert_eq!(response.result["remaining"], 500.0);
    }

    #[tokio::test]
    async fn show_trip_modal_interrupts() {
        let f = fixture().await;
        let response = f.tools.dispatch(request("showTripModal", json!({}))).await;
        assert!(response.succeeded());
        assert_eq!(response.scheduling, Some(Scheduling::Interrupt));
        assert_eq!(*f.presenter.opened.lock().unwrap(), vec![ModalKind::TripOverview]);
    }

    #[tokio::test]
    async fn repeated_call_id_does_not_duplicate() {
        let f = fixture().await;
        f.lobby.create_lobby("Trip Test", None).await.unwrap();

        let first = f.tools.dispatch(keyed("createTrip", tokyo(), "call-1")).await;
        let again = f.tools.dispatch(keyed("createTrip", tokyo(), "call-1")).await;
        assert_eq!(first, again);
        assert_eq!(trip_count(&f.remote).await, 1);

        let other = f.tools.dispatch(keyed("createTrip", tokyo(), "call-2")).await;
        assert_ne!(other.result["trip_id"], first.result["trip_id"]);
        assert_eq!(trip_count(&f.remote).await, 2);

        // Unkeyed retries are not deduplicated.
        f.tools.dispatch(request("createTrip", tokyo())).await;
        assert_eq!(trip_count(&f.remote).await, 3);
    }

    #[tokio::test]
    async fn failed_keyed_call_can_be_retried() {
        let f = fixture().await;
        let failed = f.tools.dispatch(keyed("createTrip", tokyo(), "call-1")).await;
        assert!(!failed.succeeded());

        f.lobby.create_lobby("Trip Test", None).await.unwrap();
        let retried = f.tools.dispatch(keyed("createTrip", tokyo(), "call-1")).await;
        assert!(retried.succeeded());
    }

    #[test]
    fn recent_calls_evict_oldest() {
        let mut recent = RecentCalls::new(2);
        let response = |n: u32| ToolResponse {
            tool: "createTrip".into(),
            scheduling: Some(Scheduling::Async),
            result: json!({"success": true, "n": n}),
        };
        for n in 0..3 {
            recent.remember((ToolName::CreateTrip, n.to_string()), response(n));
        }
        assert!(recent.get(&(ToolName::CreateTrip, "0".into())).is_none());
        assert!(recent.get(&(ToolName::CreateTrip, "2".into())).is_some());
    }
}
