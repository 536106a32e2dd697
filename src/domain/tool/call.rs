use chrono::NaiveDate;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::schema::{validate, Violation, ARGUMENTS_FIELD};
use crate::domain::budget::BudgetBreakdown;
use crate::domain::model::{NewDay, NewItem, NewTrip, PlaceType};

// ---------------------------------------------------------------------------
// Scheduling class
// ---------------------------------------------------------------------------

/// How the agent runtime should treat a tool's response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scheduling {
    /// Response data feeds the agent's next utterance; the turn waits for it.
    Async,
    /// Produces an immediate user-visible effect; acknowledged without
    /// holding the agent's turn.
    Interrupt,
}

// ---------------------------------------------------------------------------
// Tool names and definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    CreateTrip,
    AddItineraryDay,
    AddItineraryItem,
    UpdateBudget,
    GetCurrentTrip,
    ShowTripModal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub scheduling: Scheduling,
}

impl ToolName {
    pub const ALL: [ToolName; 6] = [
        ToolName::CreateTrip,
        ToolName::AddItineraryDay,
        ToolName::AddItineraryItem,
        ToolName::UpdateBudget,
        ToolName::GetCurrentTrip,
        ToolName::ShowTripModal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::CreateTrip => "createTrip",
            ToolName::AddItineraryDay => "addItineraryDay",
            ToolName::AddItineraryItem => "addItineraryItem",
            ToolName::UpdateBudget => "updateBudget",
            ToolName::GetCurrentTrip => "getCurrentTrip",
            ToolName::ShowTripModal => "showTripModal",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    pub fn scheduling(&self) -> Scheduling {
        match self {
            ToolName::ShowTripModal => Scheduling::Interrupt,
            _ => Scheduling::Async,
        }
    }

    /// Tools whose retry would create a second entity.
    pub fn creates_entity(&self) -> bool {
        matches!(
            self,
            ToolName::CreateTrip | ToolName::AddItineraryDay | ToolName::AddItineraryItem
        )
    }

    pub fn description(&self) -> &'static str {
        match self {
            ToolName::CreateTrip => {
                "Creates a new multi-day trip in the current lobby and makes it the active trip. \
                 Returns the trip id."
            }
            ToolName::AddItineraryDay => {
                "Adds a day to the active trip's itinerary. Call once per day. Returns the day id \
                 needed by addItineraryItem."
            }
            ToolName::AddItineraryItem => {
                "Adds a restaurant, activity, accommodation or transport stop to a day of the \
                 active trip. Returns the item id."
            }
            ToolName::UpdateBudget => {
                "Replaces the active trip's budget breakdown. Omitted categories are set to 0."
            }
            ToolName::GetCurrentTrip => {
                "Returns the active trip with its days, items per day and budget."
            }
            ToolName::ShowTripModal => "Opens the trip overview for the user.",
        }
    }

    pub fn input_schema(&self) -> Value {
        match self {
            ToolName::CreateTrip => json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "The name of the trip"},
                    "destination": {"type": "string", "description": "The primary destination"},
                    "start_date": {"type": "string", "description": "Start date in YYYY-MM-DD format"},
                    "end_date": {"type": "string", "description": "End date in YYYY-MM-DD format"},
                    "budget": {"type": "number", "minimum": 0, "description": "Total budget (optional)"}
                },
                "required": ["name", "destination", "start_date", "end_date"]
            }),
            ToolName::AddItineraryDay => json!({
                "type": "object",
                "properties": {
                    "day_number": {"type": "integer", "minimum": 1, "description": "The day number (1-indexed)"},
                    "date": {"type": "string", "description": "Date in YYYY-MM-DD format"},
                    "title": {"type": "string", "description": "Title for the day (optional)"},
                    "notes": {"type": "string", "description": "Notes about the day (optional)"}
                },
                "required": ["day_number", "date"]
            }),
            ToolName::AddItineraryItem => {
                let place_types: Vec<&str> = PlaceType::ALL.iter().map(|p| p.as_str()).collect();
                json!({
                    "type": "object",
                    "properties": {
                        "day_id": {"type": "string", "description": "The ID of the day to add this item to"},
                        "place_name": {"type": "string", "description": "Name of the place"},
                        "place_type": {"type": "string", "enum": place_types, "description": "Type of place"},
                        "lat": {"type": "number", "description": "Latitude"},
                        "lng": {"type": "number", "description": "Longitude"},
                        "place_id": {"type": "string", "description": "Place ID (optional)"},
                        "place_address": {"type": "string", "description": "Address (optional)"},
                        "start_time": {"type": "string", "description": "Start time in HH:MM format (optional)"},
                        "end_time": {"type": "string", "description": "End time in HH:MM format (optional)"},
                        "notes": {"type": "string", "description": "Additional notes (optional)"},
                        "grounding_data": {"type": "object", "description": "Grounding metadata (optional)"}
                    },
                    "required": ["day_id", "place_name", "place_type", "lat", "lng"]
                })
            }
            ToolName::UpdateBudget => json!({
                "type": "object",
                "properties": {
                    "accommodation": {"type": "number", "minimum": 0},
                    "transportation": {"type": "number", "minimum": 0},
                    "food": {"type": "number", "minimum": 0},
                    "activities": {"type": "number", "minimum": 0},
                    "other": {"type": "number", "minimum": 0}
                }
            }),
            ToolName::GetCurrentTrip | ToolName::ShowTripModal => json!({
                "type": "object",
                "properties": {}
            }),
        }
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.as_str().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
            scheduling: self.scheduling(),
        }
    }
}

// ---------------------------------------------------------------------------
// Typed payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateTripArgs {
    pub name: String,
    pub destination: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub budget: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AddDayArgs {
    #[serde(deserialize_with = "whole_number")]
    pub day_number: u32,
    pub date: NaiveDate,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AddItemArgs {
    pub day_id: Uuid,
    pub place_name: String,
    pub place_type: PlaceType,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub place_id: Option<String>,
    #[serde(default)]
    pub place_address: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub grounding_data: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UpdateBudgetArgs {
    #[serde(default)]
    pub accommodation: Option<f64>,
    #[serde(default)]
    pub transportation: Option<f64>,
    #[serde(default)]
    pub food: Option<f64>,
    #[serde(default)]
    pub activities: Option<f64>,
    #[serde(default)]
    pub other: Option<f64>,
}

/// The closed set of operations an agent may invoke.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    CreateTrip(CreateTripArgs),
    AddItineraryDay(AddDayArgs),
    AddItineraryItem(AddItemArgs),
    UpdateBudget(UpdateBudgetArgs),
    GetCurrentTrip,
    ShowTripModal,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolParseError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments for {tool}")]
    Invalid {
        tool: &'static str,
        violations: Vec<Violation>,
    },
}

impl ToolCall {
    /// Validate `arguments` against the tool's schema, then decode the typed payload.
    pub fn parse(name: &str, arguments: &Value) -> Result<Self, ToolParseError> {
        let tool = ToolName::parse(name).ok_or_else(|| ToolParseError::UnknownTool(name.to_string()))?;

        let violations = validate(&tool.input_schema(), arguments);
        if !violations.is_empty() {
            return Err(ToolParseError::Invalid {
                tool: tool.as_str(),
                violations,
            });
        }

        let args = if arguments.is_null() {
            json!({})
        } else {
            arguments.clone()
        };
        let invalid = |e: serde_json::Error| ToolParseError::Invalid {
            tool: tool.as_str(),
            violations: vec![Violation::new(ARGUMENTS_FIELD, e.to_string())],
        };

        let call = match tool {
            ToolName::CreateTrip => {
                let args: CreateTripArgs = serde_json::from_value(args).map_err(invalid)?;
                if args.end_date < args.start_date {
                    return Err(ToolParseError::Invalid {
                        tool: tool.as_str(),
                        violations: vec![Violation::new("end_date", "must not be before start_date")],
                    });
                }
                ToolCall::CreateTrip(args)
            }
            ToolName::AddItineraryDay => {
                ToolCall::AddItineraryDay(serde_json::from_value(args).map_err(invalid)?)
            }
            ToolName::AddItineraryItem => {
                ToolCall::AddItineraryItem(serde_json::from_value(args).map_err(invalid)?)
            }
            ToolName::UpdateBudget => {
                ToolCall::UpdateBudget(serde_json::from_value(args).map_err(invalid)?)
            }
            ToolName::GetCurrentTrip => ToolCall::GetCurrentTrip,
            ToolName::ShowTripModal => ToolCall::ShowTripModal,
        };
        Ok(call)
    }

    pub fn name(&self) -> ToolName {
        match self {
            ToolCall::CreateTrip(_) => ToolName::CreateTrip,
            ToolCall::AddItineraryDay(_) => ToolName::AddItineraryDay,
            ToolCall::AddItineraryItem(_) => ToolName::AddItineraryItem,
            ToolCall::UpdateBudget(_) => ToolName::UpdateBudget,
            ToolCall::GetCurrentTrip => ToolName::GetCurrentTrip,
            ToolCall::ShowTripModal => ToolName::ShowTripModal,
        }
    }
}

// ---------------------------------------------------------------------------
// Conversions into store inputs
// ---------------------------------------------------------------------------

impl From<CreateTripArgs> for NewTrip {
    fn from(args: CreateTripArgs) -> Self {
        NewTrip {
            name: args.name,
            destination: args.destination,
            start_date: args.start_date,
            end_date: args.end_date,
            budget: args.budget,
        }
    }
}

impl From<AddDayArgs> for NewDay {
    fn from(args: AddDayArgs) -> Self {
        NewDay {
            day_number: args.day_number,
            date: args.date,
            title: non_blank(args.title),
            notes: non_blank(args.notes),
        }
    }
}

impl From<AddItemArgs> for NewItem {
    fn from(args: AddItemArgs) -> Self {
        NewItem {
            place_name: non_blank(Some(args.place_name)),
            place_type: args.place_type,
            place_id: non_blank(args.place_id),
            place_address: non_blank(args.place_address),
            lat: Some(args.lat),
            lng: Some(args.lng),
            start_time: non_blank(args.start_time),
            end_time: non_blank(args.end_time),
            notes: non_blank(args.notes),
            grounding_data: args.grounding_data.filter(|v| !v.is_null()),
        }
    }
}

impl From<UpdateBudgetArgs> for BudgetBreakdown {
    fn from(args: UpdateBudgetArgs) -> Self {
        BudgetBreakdown {
            accommodation: args.accommodation.unwrap_or(0.0),
            transportation: args.transportation.unwrap_or(0.0),
            food: args.food.unwrap_or(0.0),
            activities: args.activities.unwrap_or(0.0),
            other: args.other.unwrap_or(0.0),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn whole_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let n = f64::deserialize(deserializer)?;
    if n.fract() != 0.0 || n < 0.0 || n > f64::from(u32::MAX) {
        return Err(D::Error::custom(format!("expected a whole number, got {n}")));
    }
    Ok(n as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_tool_round_trips_through_its_name() {
        for tool in ToolName::ALL {
            assert_eq!(ToolName::parse(tool.as_str()), Some(tool));
        }
        assert_eq!(ToolName::parse("dropDatabase"), None);
    }

    #[test]
    fn only_show_trip_modal_interrupts() {
        let interrupting: Vec<_> = ToolName::ALL
            .into_iter()
            .filter(|t| t.scheduling() == Scheduling::Interrupt)
            .collect();
        assert_eq!(interrupting, vec![ToolName::ShowTripModal]);
    }

    #[test]
    fn parses_create_trip() {
        let call = ToolCall::parse(
            "createTrip",
            &json!({
                "name": "Tokyo",
                "destination": "Tokyo, Japan",
                "start_date": "2025-06-01",
                "end_date": "2025-06-07",
                "budget": 2000
            }),
        )
        .unwrap();
        let ToolCall::CreateTrip(args) = call else {
            panic!("expected CreateTrip");
        };
        assert_eq!(args.start_date, NaiveDate::from_ymd_opt(2025, 6, 1).unwrap());
        assert_eq!(args.budget, Some(2000.0));
    }

    #[test]
    fn create_trip_with_reversed_dates_is_invalid() {
        let err = ToolCall::parse(
            "createTrip",
            &json!({
                "name": "Back", "destination": "X",
                "start_date": "2025-06-07", "end_date": "2025-06-01"
            }),
        )
        .unwrap_err();
        assert!(matches!(err, ToolParseError::Invalid { ref violations, .. } if violations[0].field == "end_date"));
    }

    #[test]
    fn malformed_date_is_reported_as_violation() {
        let err = ToolCall::parse("addItineraryDay", &json!({"day_number": 1, "date": "June 1st"}))
            .unwrap_err();
        assert!(matches!(err, ToolParseError::Invalid { tool: "addItineraryDay", .. }));
    }

    #[test]
    fn day_number_accepts_float_encoded_integers() {
        let call = ToolCall::parse("addItineraryDay", &json!({"day_number": 2.0, "date": "2025-06-02"}))
            .unwrap();
        assert!(matches!(call, ToolCall::AddItineraryDay(AddDayArgs { day_number: 2, .. })));
    }

    #[test]
    fn item_place_type_enum_is_enforced() {
        let err = ToolCall::parse(
            "addItineraryItem",
            &json!({
                "day_id": Uuid::new_v4(), "place_name": "X", "place_type": "spaceport",
                "lat": 0.0, "lng": 0.0
            }),
        )
        .unwrap_err();
        let ToolParseError::Invalid { violations, .. } = err else {
            panic!("expected Invalid");
        };
        assert_eq!(violations[0].field, "place_type");
    }

    #[test]
    fn item_with_bad_day_id_is_invalid() {
        let err = ToolCall::parse(
            "addItineraryItem",
            &json!({
                "day_id": "not-a-uuid", "place_name": "X", "place_type": "other",
                "lat": 0.0, "lng": 0.0
            }),
        )
        .unwrap_err();
        assert!(matches!(err, ToolParseError::Invalid { .. }));
    }

    #[test]
    fn blank_optional_strings_become_none() {
        let args = AddDayArgs {
            day_number: 1,
            date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            title: Some("  ".into()),
            notes: Some("bring cash".into()),
        };
        let day: NewDay = args.into();
        assert_eq!(day.title, None);
        assert_eq!(day.notes.as_deref(), Some("bring cash"));
    }

    #[test]
    fn update_budget_fills_missing_categories_with_zero() {
        let call = ToolCall::parse("updateBudget", &json!({"food": 300, "other": 50})).unwrap();
        let ToolCall::UpdateBudget(args) = call else {
            panic!("expected UpdateBudget");
        };
        let breakdown: BudgetBreakdown = args.into();
        assert_eq!(breakdown.food, 300.0);
        assert_eq!(breakdown.accommodation, 0.0);
        assert_eq!(breakdown.total(), 350.0);
    }

    #[test]
    fn argumentless_tools_accept_null() {
        assert_eq!(ToolCall::parse("showTripModal", &Value::Null).unwrap(), ToolCall::ShowTripModal);
        assert_eq!(ToolCall::parse("getCurrentTrip", &json!({})).unwrap(), ToolCall::GetCurrentTrip);
    }

    #[test]
    fn unknown_tool_is_rejected() {
        assert_eq!(
            ToolCall::parse("bookFlight", &json!({})).unwrap_err(),
            ToolParseError::UnknownTool("bookFlight".into())
        );
    }
}
