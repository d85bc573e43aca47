//! HTTP and WebSocket surface of the Courier server.
//!
//! | Route                           | Auth     | Purpose                              |
//! |---------------------------------|----------|--------------------------------------|
//! | `POST /api/auth/login`          | none     | exchange credentials for a token     |
//! | `POST /api/account/2fa/enable`  | required | start second-factor enrollment       |
//! | `POST /api/account/2fa/confirm` | required | activate the second factor           |
//! | `POST /api/chat/process`        | required | submit an event and await its outcome |
//! | `POST /api/chat/send`           | required | submit an event, fire and forget     |
//! | `GET /api/messages`             | required | list persisted messages              |
//! | `POST /api/messages`            | required | store a message directly             |
//! | `GET /api/messages/{id}`        | required | read one persisted message           |
//! | `PUT /api/messages/{id}`        | required | edit one of the caller's messages    |
//! | `DELETE /api/messages/{id}`     | required | delete one of the caller's messages  |
//! | `GET /ws`                       | required | live event stream and chat ingress   |
//! | `GET /health`                   | none     | liveness and counters                |
//!
//! Every request passes through [`authenticate`] first; handlers that need
//! an identity take a [`CurrentUser`].

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::broadcast::{ChatBroadcaster, SubscriberFilter};
use crate::broker::Broker;
use crate::credentials::CredentialVerifier;
use crate::dispatch::ChatDispatcher;
use crate::error::{ErrorResponse, Result, ServerError};
use crate::login::{LoginService, TwoFactorEnrollment};
use crate::messages::MessageService;
use crate::middleware::{authenticate, CurrentUser};
use crate::pool::WorkerPool;
use crate::processor::MessageTypeProcessor;
use crate::store::{Stores, UserRepository};
use crate::throttle::AttemptThrottle;
use crate::token::TokenService;
use crate::totp::TotpService;
use crate::types::{
    ChatEvent, ChatEventKind, ConversationId, Message, MessageId, MessageUpdate, NewMessage, User, UserId,
};

// ============================================================================
// Constants
// ============================================================================

/// Maximum accepted request body (64 KiB).
const MAX_BODY_SIZE: usize = 64 * 1024;

/// Outbound frames buffered per WebSocket connection.
const WS_OUTBOUND_BUFFER: usize = 64;

// ============================================================================
// Application State
// ============================================================================

/// Shared state for all handlers. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub tokens: TokenService,
    pub login: LoginService,
    pub two_factor: TwoFactorEnrollment,
    pub dispatcher: ChatDispatcher,
    pub messages: MessageService,
    pub users: Arc<dyn UserRepository>,
    pub broadcaster: ChatBroadcaster,
    pub start_time: Instant,
}

impl AppState {
    /// Wires the login path and the ingress half of the chat pipeline.
    ///
    /// The egress consumer is started separately against the same broker,
    /// using [`AppState::messages`] and [`AppState::broadcaster`].
    #[must_use]
    pub fn new(
        stores: &Stores,
        tokens: TokenService,
        broker: Arc<dyn Broker>,
        pool: WorkerPool,
        totp: TotpService,
    ) -> Self {
        let messages = MessageService::new(
            stores.users.clone(),
            stores.conversations.clone(),
            stores.messages.clone(),
        );
        let processor = MessageTypeProcessor::new(
            messages.clone(),
            stores.users.clone(),
            stores.conversations.clone(),
        );
        let throttle = AttemptThrottle::default();
        let login = LoginService::new(
            throttle.clone(),
            CredentialVerifier::new(stores.users.clone()),
            totp.clone(),
            tokens.clone(),
        );

        Self {
            two_factor: TwoFactorEnrollment::new(stores.users.clone(), totp, throttle),
            dispatcher: ChatDispatcher::new(pool, processor, broker),
            users: stores.users.clone(),
            broadcaster: ChatBroadcaster::new(),
            start_time: Instant::now(),
            tokens,
            login,
            messages,
        }
    }

    /// Resolves the token subject to its stored identity.
    async fn caller(&self, current: &CurrentUser) -> Result<User> {
        self.users
            .find_by_username(&current.username)
            .await?
            .ok_or_else(|| ServerError::authentication("token subject no longer exists"))
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("tokens", &self.tokens)
            .field("dispatcher", &self.dispatcher)
            .field("broadcaster", &self.broadcaster)
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Builds the router with authentication and request tracing applied.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/auth/login", post(post_login))
        .route("/api/account/2fa/enable", post(post_two_factor_enable))
        .route("/api/account/2fa/confirm", post(post_two_factor_confirm))
        .route("/api/chat/process", post(post_chat_process))
        .route("/api/chat/send", post(post_chat_send))
        .route("/api/messages", get(get_messages).post(post_message))
        .route(
            "/api/messages/{id}",
            get(get_message).put(put_message).delete(delete_message),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .route("/ws", get(get_ws))
        .route("/health", get(get_health))
        .layer(middleware::from_fn_with_state(state.tokens.clone(), authenticate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| ServerError::validation(format!("invalid request body: {e}")))
}

fn not_author() -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(ErrorResponse::new("message belongs to another user").with_code("not_author")),
    )
        .into_response()
}

fn require_content(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(ServerError::validation("content must not be empty"));
    }
    Ok(())
}

fn actor_mismatch() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(
            ErrorResponse::new("event userId does not match the authenticated user")
                .with_code("actor_mismatch"),
        ),
    )
        .into_response()
}

// ============================================================================
// POST /api/auth/login
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub totp_code: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
}

/// `200` with a bearer token, `401` for any credential failure or lockout.
async fn post_login(State(state): State<AppState>, body: Bytes) -> Result<Json<LoginResponse>> {
    let request: LoginRequest = parse_json(&body)?;
    let issued = state
        .login
        .login(&request.username, &request.password, request.totp_code.as_deref())
        .await?;

    Ok(Json(LoginResponse {
        access_token: issued.access_token,
        token_type: "Bearer".to_string(),
        expires_in: issued.expires_in,
    }))
}

// ============================================================================
// POST /api/account/2fa/*
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentResponse {
    pub secret: String,
    pub provisioning_uri: String,
}

#[derive(Deserialize)]
pub struct ConfirmRequest {
    pub code: String,
}

/// Optional body of the enable call; `code` is required while a second
/// factor is already active.
#[derive(Default, Deserialize)]
pub struct EnableRequest {
    #[serde(default)]
    pub code: Option<String>,
}

async fn post_two_factor_enable(
    State(state): State<AppState>,
    current: CurrentUser,
    body: Bytes,
) -> Result<Json<EnrollmentResponse>> {
    let request: EnableRequest = if body.is_empty() {
        EnableRequest::default()
    } else {
        parse_json(&body)?
    };
    let enrollment = state
        .two_factor
        .enable(&current.username, request.code.as_deref())
        .await?;
    Ok(Json(EnrollmentResponse {
        secret: enrollment.secret,
        provisioning_uri: enrollment.provisioning_uri,
    }))
}

async fn post_two_factor_confirm(
    State(state): State<AppState>,
    current: CurrentUser,
    body: Bytes,
) -> Result<Response> {
    let request: ConfirmRequest = parse_json(&body)?;
    if state.two_factor.confirm(&current.username, &request.code).await? {
        Ok(Json(serde_json::json!({ "enabled": true })).into_response())
    } else {
        Ok((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("invalid code").with_code("invalid_code")),
        )
            .into_response())
    }
}

// ============================================================================
// POST /api/chat/*
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessResponse {
    pub outcome: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendResponse {
    pub id: Uuid,
}

/// Submits an event and waits for the processor's outcome.
///
/// `200` with the outcome text, `400` for a malformed event or another
/// user's `userId`, `404` for unknown users or conversations, `503` when the
/// worker pool is saturated.
async fn post_chat_process(
    State(state): State<AppState>,
    current: CurrentUser,
    body: Bytes,
) -> Result<Response> {
    let event: ChatEvent = parse_json(&body)?;
    let caller = state.caller(&current).await?;
    if event.actor_id != caller.id {
        warn!(user_id = caller.id, event_user_id = event.actor_id, "Chat event actor mismatch");
        return Ok(actor_mismatch());
    }

    let outcome = state.dispatcher.submit(event)?.outcome().await?;
    Ok(Json(ProcessResponse {
        outcome: outcome.to_string(),
    })
    .into_response())
}

/// Submits an event without waiting. `202` with the envelope id.
async fn post_chat_send(
    State(state): State<AppState>,
    current: CurrentUser,
    body: Bytes,
) -> Result<Response> {
    let event: ChatEvent = parse_json(&body)?;
    let caller = state.caller(&current).await?;
    if event.actor_id != caller.id {
        warn!(user_id = caller.id, event_user_id = event.actor_id, "Chat event actor mismatch");
        return Ok(actor_mismatch());
    }

    let submission = state.dispatcher.submit(event)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SendResponse {
            id: submission.envelope_id(),
        }),
    )
        .into_response())
}

// ============================================================================
// /api/messages
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageQuery {
    pub conversation_id: Option<ConversationId>,
}

async fn get_messages(
    State(state): State<AppState>,
    _current: CurrentUser,
    Query(query): Query<MessageQuery>,
) -> Result<Json<Vec<Message>>> {
    Ok(Json(state.messages.list_messages(query.conversation_id).await?))
}

async fn get_message(
    State(state): State<AppState>,
    _current: CurrentUser,
    Path(id): Path<MessageId>,
) -> Result<Json<Message>> {
    Ok(Json(state.messages.get_message(id).await?))
}

/// Body of `POST /api/messages`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequest {
    pub content: String,
    pub user_id: UserId,
    pub conversation_id: ConversationId,
}

/// Stores a message without going through the chat pipeline.
///
/// `201` with the stored message, `400` for another user's `userId`, `404`
/// for an unknown conversation. Nothing is broadcast.
async fn post_message(
    State(state): State<AppState>,
    current: CurrentUser,
    body: Bytes,
) -> Result<Response> {
    let request: MessageRequest = parse_json(&body)?;
    require_content(&request.content)?;
    let caller = state.caller(&current).await?;
    if request.user_id != caller.id {
        warn!(user_id = caller.id, request_user_id = request.user_id, "Message author mismatch");
        return Ok(actor_mismatch());
    }

    let message = state
        .messages
        .create_message(NewMessage {
            content: request.content,
            user_id: request.user_id,
            conversation_id: request.conversation_id,
            idempotency_key: None,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(message)).into_response())
}

/// Edits one of the caller's messages. `403` for someone else's message.
async fn put_message(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<MessageId>,
    body: Bytes,
) -> Result<Response> {
    let update: MessageUpdate = parse_json(&body)?;
    require_content(&update.content)?;
    let caller = state.caller(&current).await?;
    if matches!(update.user_id, Some(user_id) if user_id != caller.id) {
        return Ok(actor_mismatch());
    }
    if state.messages.get_message(id).await?.user_id != caller.id {
        warn!(user_id = caller.id, message_id = id, "Edit of another user's message refused");
        return Ok(not_author());
    }

    let message = state.messages.update_message(id, update).await?;
    Ok(Json(message).into_response())
}

/// Deletes one of the caller's messages. `204` on success.
async fn delete_message(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<MessageId>,
) -> Result<Response> {
    let caller = state.caller(&current).await?;
    if state.messages.get_message(id).await?.user_id != caller.id {
        warn!(user_id = caller.id, message_id = id, "Deletion of another user's message refused");
        return Ok(not_author());
    }

    state.messages.delete_message(id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ============================================================================
// GET /ws
// ============================================================================

/// Optional filters for the outbound event stream.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQueryParams {
    /// Consumed by the authentication filter.
    pub token: Option<String>,

    pub conversation_id: Option<ConversationId>,

    #[serde(rename = "type")]
    pub kind: Option<ChatEventKind>,
}

impl WsQueryParams {
    fn to_filter(&self) -> SubscriberFilter {
        let mut filter = SubscriberFilter::new();
        if let Some(conversation_id) = self.conversation_id {
            filter = filter.with_conversation(conversation_id);
        }
        if let Some(kind) = self.kind {
            filter = filter.with_kind(kind);
        }
        filter
    }
}

/// Upgrades to a WebSocket.
///
/// Outbound: every broadcast event passing the query filter, as JSON text.
/// Inbound: text frames holding a [`ChatEvent`] from the caller, submitted to
/// the ingress stage. Rejected frames are answered with an error frame.
async fn get_ws(
    State(state): State<AppState>,
    current: CurrentUser,
    Query(params): Query<WsQueryParams>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let caller = state.caller(&current).await?;
    let filter = params.to_filter();
    info!(user_id = caller.id, filter = ?filter, "WebSocket client connecting");

    Ok(ws.on_upgrade(move |socket| handle_websocket(socket, state, caller.id, filter)))
}

async fn handle_websocket(
    socket: axum::extract::ws::WebSocket,
    state: AppState,
    user_id: i64,
    filter: SubscriberFilter,
) {
    use axum::extract::ws::Message as Frame;
    use futures_util::{SinkExt, StreamExt};

    let (mut sink, mut stream) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::channel::<String>(WS_OUTBOUND_BUFFER);
    let mut event_rx = state.broadcaster.subscribe();

    let writer = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if let Err(err) = sink.send(Frame::Text(text.into())).await {
                debug!(error = %err, "Failed to write to WebSocket client");
                break;
            }
        }
    });

    let forward_tx = outbound.clone();
    let forwarder = tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => {
                    if !filter.matches(&event) {
                        continue;
                    }
                    match serde_json::to_string(&event) {
                        Ok(json) => {
                            if forward_tx.send(json).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => error!(error = %err, "Failed to serialize chat event"),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "WebSocket client lagged, skipped events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!(user_id, "WebSocket client connected");

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Frame::Text(text)) => {
                if let Some(reply) = submit_frame(&state, user_id, text.as_str()) {
                    if outbound.send(reply).await.is_err() {
                        break;
                    }
                }
            }
            Ok(Frame::Close(_)) => break,
            Ok(Frame::Ping(data)) => trace!(data_len = data.len(), "Received ping"),
            Ok(_) => {}
            Err(err) => {
                debug!(error = %err, "WebSocket error");
                break;
            }
        }
    }

    forwarder.abort();
    writer.abort();
    info!(user_id, "WebSocket client disconnected");
}

/// Submits one inbound frame. Returns an error frame to send back, if any.
fn submit_frame(state: &AppState, user_id: i64, text: &str) -> Option<String> {
    let rejection = |error: String, code: &str| {
        serde_json::to_string(&ErrorResponse::new(error).with_code(code)).ok()
    };

    let event: ChatEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => return rejection(format!("invalid chat event: {e}"), "invalid_request"),
    };
    if event.actor_id != user_id {
        return rejection(
            "event userId does not match the authenticated user".to_string(),
            "actor_mismatch",
        );
    }

    match state.dispatcher.submit(event) {
        Ok(submission) => {
            trace!(envelope_id = %submission.envelope_id(), "WebSocket chat event submitted");
            None
        }
        Err(ServerError::Validation(msg)) => rejection(msg, "invalid_request"),
        Err(e) => {
            warn!(user_id, error = %e, "WebSocket chat event not accepted");
            rejection("server busy, try again later".to_string(), "unavailable")
        }
    }
}

// ============================================================================
// GET /health
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub subscribers: usize,
    pub uptime_seconds: u64,
    pub active_workers: usize,
}

async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        subscribers: state.broadcaster.subscriber_count(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        active_workers: state.dispatcher.pool().active_workers(),
    })
}

// ============================================================================
// Tests
// ============================================================================
