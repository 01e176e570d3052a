//! HTTP surface: session bootstrap, ancillary endpoints and the ws upgrade

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderValue, Method};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::AppError;
use crate::fx;
use crate::hub::Hub;
use crate::model::{now_ms, Op, Participant, RoomDoc};
use crate::receipt::{self, ReceiptParseResult};
use crate::store::RoomStore;
use crate::token;

const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const ROOM_CODE_LENGTH: usize = 6;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn RoomStore>,
    pub hub: Arc<Hub>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn RoomStore>, hub: Arc<Hub>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            hub,
            http: reqwest::Client::new(),
        }
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);
    Router::new()
        .route("/api/health", get(health))
        .route("/api/create-room", post(create_room))
        .route("/api/join-room", post(join_room))
        .route("/api/receipt/parse", post(receipt_parse))
        .route("/api/fx", get(fx_rate))
        .route("/ws/:room_id", get(ws_upgrade))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true)
        .allow_origin(origins)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct CreateRoomRequest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    bill_name: String,
}

/// Response of both bootstrap endpoints
#[derive(Debug, Serialize, Deserialize)]
pub struct RoomCredentials {
    pub room_code: String,
    pub user_id: String,
    pub join_token: String,
}

async fn create_room(
    State(state): State<AppState>,
    Json(request): Json<CreateRoomRequest>,
) -> Result<Json<RoomCredentials>, AppError> {
    let room_code = random_room_code(ROOM_CODE_LENGTH);
    let user_id = Uuid::new_v4().to_string();
    let participant = build_participant(&room_code, &user_id, &request.name);

    let mut doc = RoomDoc::new(&room_code, &request.bill_name);
    doc.participants.insert(user_id.clone(), participant.clone());
    state.store.save_snapshot(&room_code, &doc, 0).await?;

    // the creator's membership also lives in the log, so replay from zero
    // converges on the same participant set
    let op = Op::set_participant(&user_id, &participant);
    if let Err(err) = state.hub.ingest_op(&room_code, op).await {
        warn!(room = %room_code, error = %err, "initial participant op dropped");
    }

    let join_token = token::sign(&state.config.join_token_key, &room_code, &user_id)?;
    info!(room = %room_code, "room created");
    Ok(Json(RoomCredentials {
        room_code,
        user_id,
        join_token,
    }))
}

#[derive(Debug, Deserialize)]
struct JoinRoomRequest {
    #[serde(default)]
    room_code: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    join_token: String,
}

async fn join_room(
    State(state): State<AppState>,
    Json(request): Json<JoinRoomRequest>,
) -> Result<Json<RoomCredentials>, AppError> {
    let Some((doc, _)) = state
        .store
        .load_snapshot(&request.room_code)
        .await
        .ok()
        .flatten()
    else {
        return Err(AppError::RoomNotFound);
    };

    let user_id = if !request.user_id.is_empty() {
        request.user_id.clone()
    } else {
        doc.participants
            .values()
            .find(|participant| participant.name == request.name)
            .map(|participant| participant.id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    };

    if !request.join_token.is_empty()
        && !token::verify(
            &state.config.join_token_key,
            &request.room_code,
            &user_id,
            &request.join_token,
        )
    {
        return Err(AppError::InvalidToken);
    }

    let participant = build_participant(&request.room_code, &user_id, &request.name);
    let op = Op::set_participant(&user_id, &participant);
    state.hub.ingest_op(&request.room_code, op).await?;

    let join_token = token::sign(&state.config.join_token_key, &request.room_code, &user_id)?;
    info!(room = %request.room_code, user = %user_id, "participant joined");
    Ok(Json(RoomCredentials {
        room_code: request.room_code,
        user_id,
        join_token,
    }))
}

async fn receipt_parse(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ReceiptParseResult>, AppError> {
    if state.config.openai_api_key.is_empty() {
        return Err(AppError::BadRequest(
            "OPENAI_API_KEY not configured".to_string(),
        ));
    }
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::BadRequest(err.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let content_type = field.content_type().unwrap_or_default().to_string();
        receipt::check_image_type(&content_type)?;
        let data = field
            .bytes()
            .await
            .map_err(|err| AppError::BadRequest(err.to_string()))?;
        let result = receipt::parse_receipt(&state.http, &state.config, &data).await?;
        return Ok(Json(result));
    }
    Err(AppError::BadRequest("file field required".to_string()))
}

#[derive(Debug, Deserialize)]
struct FxQuery {
    #[serde(default)]
    base: String,
    #[serde(default)]
    target: String,
}

#[derive(Debug, Serialize)]
struct FxResponse {
    base: String,
    target: String,
    rate: f64,
    as_of: chrono::DateTime<chrono::Utc>,
}

async fn fx_rate(
    State(state): State<AppState>,
    Query(query): Query<FxQuery>,
) -> Result<Json<FxResponse>, AppError> {
    let base = query.base.trim().to_uppercase();
    let target = query.target.trim().to_uppercase();
    if base.is_empty() || target.is_empty() {
        return Err(AppError::BadRequest("base and target required".to_string()));
    }
    let (rate, as_of) = fx::rate(
        &state.http,
        state.store.as_ref(),
        &state.config.ecb_rates_url,
        &base,
        &target,
    )
    .await?;
    Ok(Json(FxResponse {
        base,
        target,
        rate,
        as_of,
    }))
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| hub.handle_socket(socket, room_id))
}

fn build_participant(room_id: &str, user_id: &str, name: &str) -> Participant {
    Participant {
        id: user_id.to_string(),
        name: name.to_string(),
        initials: initials(name),
        color_seed: color_seed(room_id, user_id),
        present: true,
        updated_at: now_ms(),
    }
}

fn initials(name: &str) -> String {
    let mut words = name.split_whitespace();
    let Some(first) = words.next() else {
        return "?".to_string();
    };
    let mut out = String::new();
    if let Some(ch) = first.chars().next() {
        out.extend(ch.to_uppercase());
    }
    if let Some(last) = words.last() {
        if let Some(ch) = last.chars().next() {
            out.extend(ch.to_uppercase());
        }
    }
    if out.is_empty() {
        "?".to_string()
    } else {
        out
    }
}

fn color_seed(room_id: &str, user_id: &str) -> String {
    let digest = Sha256::digest(format!("{room_id}{user_id}").as_bytes());
    digest.iter().take(3).map(|byte| format!("{byte:02x}")).collect()
}

fn random_room_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| {
            let index = rng.gen_range(0..ROOM_CODE_ALPHABET.len());
            ROOM_CODE_ALPHABET[index] as char
        })
        .collect()
}
