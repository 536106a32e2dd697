use std::sync::Arc;

use serde_json::json;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tripsync::domain::config::SystemConfig;
use tripsync::domain::model::MessageType;
use tripsync::http::start_server;
use tripsync::runtime::{Runtime, ToolRequest, ToolResponse};

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tripsync=info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn load_config() -> anyhow::Result<SystemConfig> {
    match std::env::var("TRIPSYNC_CONFIG") {
        Ok(path) => Ok(SystemConfig::from_file(path)?),
        Err(_) => Ok(SystemConfig::default()),
    }
}

async fn call(runtime: &Runtime, name: &str, arguments: serde_json::Value) -> ToolResponse {
    let response = runtime
        .tools()
        .dispatch(ToolRequest {
            name: name.into(),
            arguments,
            call_id: None,
        })
        .await;
    let summary = response
        .result
        .get("message")
        .or_else(|| response.result.get("error"))
        .and_then(|v| v.as_str())
        .unwrap_or("ok");
    println!("[{name}] {summary}");
    response
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let config = load_config()?;
    let http_addr = config.http_addr;

    // 1. Start the stores and resolve who/where we are
    let runtime = Runtime::start(config).await?;
    let session = runtime.initialize_session().await?;
    println!(
        "{} is in lobby \"{}\" (invite code {})",
        session.participant.display_name, session.lobby.name, session.lobby.invite_code
    );

    // 2. Plan a trip through the agent-facing tools unless one was resumed
    if session.trip.is_none() {
        call(
            &runtime,
            "createTrip",
            json!({
                "name": "Tokyo Adventure",
                "destination": "Tokyo, Japan",
                "start_date": "2025-06-01",
                "end_date": "2025-06-07",
                "budget": 2000
            }),
        )
        .await;
        let day = call(
            &runtime,
            "addItineraryDay",
            json!({"day_number": 1, "date": "2025-06-01", "title": "Arrival"}),
        )
        .await;
        if let Some(day_id) = day.result.get("day_id").cloned() {
            call(
                &runtime,
                "addItineraryItem",
                json!({
                    "day_id": day_id,
                    "place_name": "Sushi Dai",
                    "place_type": "restaurant",
                    "lat": 35.6655,
                    "lng": 139.7707
                }),
            )
            .await;
        }
        call(
            &runtime,
            "updateBudget",
            json!({"accommodation": 900, "food": 400, "activities": 300}),
        )
        .await;
    }

    // 3. Announce it in the lobby chat
    runtime
        .chat()
        .send_message("Itinerary drafted", MessageType::System, None)
        .await?;

    // 4. Show what a collaborator would see
    let snapshot = runtime.trips().snapshot().await?;
    if let Some(trip) = &snapshot.trip {
        println!("\n--- {} ({} to {}) ---", trip.name, trip.start_date, trip.end_date);
    }
    for day in snapshot.days_with_items() {
        println!("Day {} ({}): {} item(s)", day.day.day_number, day.day.date, day.items.len());
        for item in &day.items {
            println!("  {}. {} [{}]", item.order_index + 1, item.place_name, item.place_type.as_str());
        }
    }
    if let Some(budget) = &snapshot.budget {
        println!(
            "Budget: {} {} allocated of {}, {} remaining",
            budget.allocated(),
            budget.currency,
            budget.total_budget,
            budget.remaining()
        );
    }

    // 5. Serve the agent/presentation surface, or shut down
    match http_addr {
        Some(addr) => start_server(Arc::new(runtime), addr).await?,
        None => runtime.shutdown().await,
    }
    Ok(())
}
