use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

mod broadcast;
mod character;
mod combat;
mod config;
mod db;
mod entity;
mod error;
mod lease;
mod protocol;
mod skills;

use broadcast::CombatChannels;
use combat::{
    CombatControl, CombatService, EncounterRefresher, MonsterRefreshSweep, SchedulerSettings,
    TickHandler, TickScheduler, TickSettings,
};
use config::ServerConfig;
use db::Database;
use entity::{MapRegistry, MonsterRegistry};
use error::CombatError;
use lease::{normalize_skill_ids, CombatLeaseStore, InMemoryLeaseStore};
use skills::SkillRegistry;

// ============================================================================
// App State
// ============================================================================

#[derive(Clone)]
struct AppState {
    control: Arc<CombatControl>,
    channels: Arc<CombatChannels>,
}

// ============================================================================
// HTTP Types
// ============================================================================

#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn ok<T: Serialize>(data: T) -> Response {
    (
        StatusCode::OK,
        Json(ApiResponse {
            success: true,
            data: Some(data),
            error: None,
        }),
    )
        .into_response()
}

fn fail(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(message),
        }),
    )
        .into_response()
}

fn combat_error(e: CombatError) -> Response {
    match e {
        CombatError::CharacterNotFound(_) => fail(StatusCode::NOT_FOUND, e.to_string()),
        CombatError::NoMap(_) | CombatError::UnknownMap(_) | CombatError::NotFighting(_) => {
            fail(StatusCode::CONFLICT, e.to_string())
        }
        other => {
            error!("Combat request failed: {}", other);
            fail(StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string())
        }
    }
}

/// Skill lists from clients are normalised like stored leases
#[derive(Deserialize)]
struct SkillsRequest {
    #[serde(default)]
    skill_ids: Value,
}

#[derive(Deserialize)]
struct CancelSkillRequest {
    skill_id: Value,
}

#[derive(Serialize)]
struct StopResponse {
    was_running: bool,
}

/// `?format=json` switches the event stream to JSON text frames
#[derive(Debug, Default, Deserialize)]
struct StreamParams {
    #[serde(default)]
    format: Option<String>,
}

impl StreamParams {
    fn wants_json(&self) -> bool {
        self.format.as_deref() == Some("json")
    }
}

// ============================================================================
// HTTP Handlers - Combat
// ============================================================================

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().timestamp_millis()
    }))
}

/// POST /api/characters/:id/combat/start
async fn start_combat(
    State(state): State<AppState>,
    Path(character_id): Path<i64>,
    Json(req): Json<SkillsRequest>,
) -> Response {
    let skill_ids = normalize_skill_ids(Some(&req.skill_ids));
    match state.control.start(character_id, skill_ids).await {
        Ok(outcome) => ok(outcome),
        Err(e) => combat_error(e),
    }
}

/// POST /api/characters/:id/combat/stop
async fn stop_combat(State(state): State<AppState>, Path(character_id): Path<i64>) -> Response {
    match state.control.stop(character_id).await {
        Ok(was_running) => ok(StopResponse { was_running }),
        Err(e) => combat_error(e),
    }
}

/// PUT /api/characters/:id/combat/skills
async fn update_skills(
    State(state): State<AppState>,
    Path(character_id): Path<i64>,
    Json(req): Json<SkillsRequest>,
) -> Response {
    let skill_ids = normalize_skill_ids(Some(&req.skill_ids));
    match state.control.update_skills(character_id, skill_ids).await {
        Ok(lease) => ok(lease),
        Err(e) => combat_error(e),
    }
}

/// POST /api/characters/:id/combat/skills/cancel
async fn cancel_skill(
    State(state): State<AppState>,
    Path(character_id): Path<i64>,
    Json(req): Json<CancelSkillRequest>,
) -> Response {
    let Some(&skill_id) = normalize_skill_ids(Some(&Value::Array(vec![req.skill_id]))).first() else {
        return fail(StatusCode::BAD_REQUEST, "Invalid skill id".to_string());
    };
    match state.control.cancel_skill(character_id, skill_id).await {
        Ok(lease) => ok(lease),
        Err(e) => combat_error(e),
    }
}

/// GET /api/characters/:id/combat
async fn combat_status(State(state): State<AppState>, Path(character_id): Path<i64>) -> Response {
    match state.control.status(character_id).await {
        Ok(status) => ok(status),
        Err(e) => combat_error(e),
    }
}

// ============================================================================
// WebSocket Handler
// ============================================================================

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(character_id): Path<i64>,
    Query(params): Query<StreamParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let json = params.wants_json();
    ws.on_upgrade(move |socket| handle_socket(socket, state, character_id, json))
}

fn event_frame(event: &protocol::CombatEvent, json: bool) -> Result<Message, String> {
    if json {
        protocol::encode_combat_event_json(event).map(Message::Text)
    } else {
        protocol::encode_combat_event(event).map(Message::Binary)
    }
}

/// Forward a character's combat events to one client until either side goes away
async fn handle_socket(socket: WebSocket, state: AppState, character_id: i64, json: bool) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.channels.subscribe(character_id);
    info!(
        "Client subscribed to combat events for character {} ({} watching)",
        character_id,
        state.channels.subscriber_count(character_id)
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => match event_frame(&event, json) {
                    Ok(frame) => {
                        if sender.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!("Failed to encode {}: {}", event.msg_type(), e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Client for character {} lagged; skipped {} event(s)", character_id, skipped);
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    info!("Client for character {} disconnected", character_id);
}

// ============================================================================
// Router
// ============================================================================

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/characters/:id/combat", get(combat_status))
        .route("/api/characters/:id/combat/start", post(start_combat))
        .route("/api/characters/:id/combat/stop", post(stop_combat))
        .route("/api/characters/:id/combat/skills", put(update_skills))
        .route("/api/characters/:id/combat/skills/cancel", post(cancel_skill))
        .route("/ws/characters/:id", get(ws_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::PUT,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers([axum::http::header::CONTENT_TYPE]),
        )
        .with_state(state)
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("autocombat_server=info".parse()?),
        )
        .init();

    let config = ServerConfig::load()?;

    let db = Arc::new(Database::new(&config.server.database_url).await?);

    // Load data registries from TOML files
    let data_dir = config.server.data_dir.as_path();
    let mut monsters = MonsterRegistry::new();
    monsters.load_from_directory(data_dir)?;
    let mut maps = MapRegistry::new();
    maps.load_from_directory(data_dir)?;
    let mut skills = SkillRegistry::new();
    skills.load_from_directory(data_dir)?;
    info!(
        "Loaded {} monster(s), {} map(s), {} skill(s)",
        monsters.len(),
        maps.len(),
        skills.len()
    );

    let store: Arc<dyn CombatLeaseStore> = Arc::new(InMemoryLeaseStore::new());
    let channels = Arc::new(CombatChannels::new());
    let refresher = Arc::new(EncounterRefresher::new(
        Arc::new(monsters),
        Arc::new(maps),
        config.refresh.encounter_ttl(),
    ));
    let rounds = Arc::new(CombatService::new(Arc::new(skills), &config.combat));

    let handler = Arc::new(TickHandler::new(
        db.clone(),
        store.clone(),
        channels.clone(),
        refresher.clone(),
        rounds,
        TickSettings::from(&config.combat),
    ));
    let scheduler = TickScheduler::start(handler, SchedulerSettings::from(&config.combat));

    let control = Arc::new(CombatControl::new(
        db.clone(),
        store.clone(),
        channels.clone(),
        refresher.clone(),
        Arc::new(scheduler.clone()),
        config.combat.lease_ttl(),
    ));
    control.resume_leased().await?;

    // Spawn monster refresh sweep
    let sweep = MonsterRefreshSweep::new(db, store, channels.clone(), refresher, config.combat.lock_ttl());
    let sweep_interval = config.refresh.sweep_interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            if let Err(e) = sweep.run_once().await {
                error!("Monster refresh sweep failed: {}", e);
            }
        }
    });

    let app = build_router(AppState { control, channels });

    let addr: SocketAddr = config.server.bind_addr.parse()?;
    info!("Auto-combat server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            scheduler.shutdown();
        })
        .await?;

    Ok(())
}
