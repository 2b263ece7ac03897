/// HTTP API for observing bot state
/// Provides REST endpoints for orders, task history and per-profile health
///
/// This module is optional - only starts if API_ENABLED=true in settings

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::persistence::{OrderRecord, OrderState, Store, TaskStats};

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8080,
        }
    }
}

/// Shared state for API handlers
#[derive(Clone)]
struct AppState {
    store: Arc<Store>,
    start_time: Instant,
}

/// Health check response
#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct HealthResponse {
    status: String,
    uptime_seconds: u64,
    profiles: Vec<ProfileHealth>,
}

/// Per-profile health derived from the task audit trail (last 24h)
#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct ProfileHealth {
    profile: String,
    healthy: bool,
    success_rate: f64,
    missed: i64,
    last_success_ms: Option<i64>,
}

/// Order response (flattened from OrderRecord)
#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct OrderResponse {
    id: i64,
    coin_address: String,
    coin_name: Option<String>,
    profile_name: String,
    slot: u8,
    entry_price: f64,
    take_profit: f64,
    stop_loss: f64,
    amount: Option<f64>,
    status: String,
    trigger_condition: Option<String>,
    created_at_ms: i64,
    completed_at_ms: Option<i64>,
}

/// Query parameters for /profiles/:name/tasks
#[derive(Debug, Deserialize)]
struct TasksQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

/// Query parameters for /orders
#[derive(Debug, Default, Deserialize)]
struct OrdersQuery {
    /// ACTIVE (default), COMPLETED, STOPPED, or "all"
    status: Option<String>,
}

/// Resolves the status query into a filter; `None` means no filtering
fn order_filter(query: &OrdersQuery) -> Result<Option<OrderState>, String> {
    match query.status.as_deref() {
        None => Ok(Some(OrderState::Active)),
        Some(s) if s.eq_ignore_ascii_case("all") => Ok(None),
        Some(s) => OrderState::parse(&s.to_uppercase())
            .map(Some)
            .ok_or_else(|| format!("Unknown status: {s}")),
    }
}

/// Health check endpoint
/// Returns bot status, uptime and per-profile cycle health
async fn health_handler(State(state): State<Arc<AppState>>) -> axum::response::Response {
    let uptime = state.start_time.elapsed().as_secs();
    let since_ms = chrono::Utc::now().timestamp_millis() - 24 * 3600 * 1000;

    let profiles = match state.store.task_profiles() {
        Ok(p) => p,
        Err(e) => return internal_error(format!("Failed to list profiles: {}", e)),
    };

    let mut health = Vec::new();
    for profile in profiles {
        match state.store.task_stats(&profile, since_ms) {
            Ok(stats) => health.push(ProfileHealth {
                healthy: stats.total == 0 || stats.success_rate >= 50.0,
                success_rate: stats.success_rate,
                missed: stats.missed,
                last_success_ms: stats.last_success_ms,
                profile,
            }),
            Err(e) => return internal_error(format!("Failed to get stats: {}", e)),
        }
    }

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: uptime,
        profiles: health,
    })
    .into_response()
}

/// Task history endpoint
/// Returns recent cycle audit rows for one profile, most recent first
async fn tasks_handler(
    State(state): State<Arc<AppState>>,
    Path(profile): Path<String>,
    Query(params): Query<TasksQuery>,
) -> axum::response::Response {
    match state.store.task_history(&profile, params.limit) {
        Ok(tasks) => {
            let response: Vec<serde_json::Value> = tasks
                .into_iter()
                .map(|t| {
                    serde_json::json!({
                        "scheduled_ms": t.scheduled_ms,
                        "start_ms": t.start_ms,
                        "completion_ms": t.completion_ms,
                        "success": t.success,
                        "missed": t.missed,
                        "timed_out": t.timed_out,
                        "error_message": t.error_message,
                        "rows_processed": t.rows_processed,
                        "duration_seconds": t.duration_seconds,
                    })
                })
                .collect();
            Json(response).into_response()
        }
        Err(e) => internal_error(format!("Failed to get task history: {}", e)),
    }
}

/// Stats endpoint
/// Returns aggregated task stats for one profile over the last 7 days
async fn stats_handler(
    State(state): State<Arc<AppState>>,
    Path(profile): Path<String>,
) -> axum::response::Response {
    let since_ms = chrono::Utc::now().timestamp_millis() - 7 * 24 * 3600 * 1000;
    match state.store.task_stats(&profile, since_ms) {
        Ok(stats) => Json::<TaskStats>(stats).into_response(),
        Err(e) => internal_error(format!("Failed to get stats: {}", e)),
    }
}

/// Orders endpoint
/// Returns active orders across all coins, joined with their coin; the
/// `status` query selects another state or `all` for the full history
async fn orders_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<OrdersQuery>,
) -> axum::response::Response {
    let filter = match order_filter(&params) {
        Ok(f) => f,
        Err(message) => return bad_request(message),
    };
    match collect_orders(&state.store, filter) {
        Ok(response) => Json(response).into_response(),
        Err(e) => internal_error(format!("Failed to get orders: {}", e)),
    }
}

fn collect_orders(
    store: &Store,
    filter: Option<OrderState>,
) -> anyhow::Result<Vec<OrderResponse>> {
    let mut response = Vec::new();
    for coin in store.all_coins()? {
        let orders = store.orders_by_coin(coin.id)?;
        response.extend(
            orders
                .into_iter()
                .filter(|o| filter.is_none_or(|wanted| o.status == wanted))
                .map(|o: OrderRecord| OrderResponse {
                    id: o.id,
                    coin_address: coin.address.clone(),
                    coin_name: coin.name.clone(),
                    profile_name: o.profile_name,
                    slot: o.bracket_id,
                    entry_price: o.entry_price,
                    take_profit: o.take_profit,
                    stop_loss: o.stop_loss,
                    amount: o.amount,
                    status: o.status.as_str().to_string(),
                    trigger_condition: o.trigger_condition,
                    created_at_ms: o.created_at_ms,
                    completed_at_ms: o.completed_at_ms,
                }),
        );
    }
    Ok(response)
}

fn internal_error(message: String) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": message})),
    )
        .into_response()
}

fn bad_request(message: String) -> axum::response::Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": message})),
    )
        .into_response()
}

/// Creates the API router with all endpoints
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/profiles/:name/tasks", get(tasks_handler))
        .route("/profiles/:name/stats", get(stats_handler))
        .route("/orders", get(orders_handler))
        .with_state(state)
}

/// Starts the HTTP API server
/// Returns a JoinHandle that can be awaited for graceful shutdown
pub async fn start_api_server(
    config: ApiConfig,
    store: Arc<Store>,
) -> Result<tokio::task::JoinHandle<()>, Box<dyn std::error::Error + Send + Sync>> {
    if !config.enabled {
        return Err("API is disabled".into());
    }

    let state = Arc::new(AppState {
        store,
        start_time: Instant::now(),
    });

    let app = create_router(state);
    let addr = format!("127.0.0.1:{}", config.port);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "HTTP API listening");

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "HTTP API server exited");
        }
    });

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{CoinUpdate, NewOrder};

    fn seeded_store() -> Arc<Store> {
        let store = Store::open_in_memory().unwrap();
        let coin = store
            .upsert_coin(
                "0xstimmy",
                &CoinUpdate {
                    name: Some("STIMMY".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        for slot in [1u8, 2] {
            store
                .insert_order(&NewOrder {
                    coin_id: coin.id,
                    profile_name: "Saruman".into(),
                    bracket_id: slot,
                    market_cap: 250_000.0,
                    entry_price: 131_000.0,
                    take_profit: 247_590.0,
                    stop_loss: 78_000.0,
                    amount: Some(2.0),
                    is_market_order: Some(false),
                })
                .unwrap();
        }
        let retired = store.active_order_for_slot(coin.id, "Saruman", 1).unwrap().unwrap();
        store
            .mark_order_terminal(retired.id, OrderState::Completed)
            .unwrap();
        Arc::new(store)
    }

    #[test]
    fn test_orders_default_to_active_only() {
        let store = seeded_store();
        let orders = collect_orders(&store, Some(OrderState::Active)).unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, "ACTIVE");
        assert_eq!(orders[0].slot, 2);
    }

    #[test]
    fn test_orders_status_query_selects_history() {
        let store = seeded_store();
        assert_eq!(collect_orders(&store, None).unwrap().len(), 2);
        let completed = collect_orders(&store, Some(OrderState::Completed)).unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].slot, 1);
    }

    #[test]
    fn test_order_filter_parsing() {
        let q = |s: Option<&str>| OrdersQuery {
            status: s.map(str::to_string),
        };
        assert_eq!(order_filter(&q(None)).unwrap(), Some(OrderState::Active));
        assert_eq!(order_filter(&q(Some("all"))).unwrap(), None);
        assert_eq!(
            order_filter(&q(Some("completed"))).unwrap(),
            Some(OrderState::Completed)
        );
        assert!(order_filter(&q(Some("bogus"))).is_err());
    }

    #[test]
    fn test_api_config_default() {
        let config = ApiConfig::default();
        assert!(!config.enabled, "API should be disabled by default");
        assert_eq!(config.port, 8080, "Default port should be 8080");
    }

    #[tokio::test]
    async fn test_disabled_api_refuses_to_start() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let result = start_api_server(ApiConfig::default(), store).await;
        assert!(result.is_err());
    }
}
