mod call;
mod schema;

pub use call::{
    AddDayArgs, AddItemArgs, CreateTripArgs, Scheduling, ToolCall, ToolDefinition, ToolName,
    ToolParseError, UpdateBudgetArgs,
};
pub use schema::{validate, Violation, ARGUMENTS_FIELD};
