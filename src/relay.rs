//! In-process long-polling chat relay.
//!
//! Clients exchange short text messages and presence updates over plain
//! request/response HTTP: a `GET` poll either answers immediately from the
//! message backlog or parks until a new message arrives or the deadline
//! elapses; `POST` commands (`join`, `message`, `leave`, `logout`) mutate
//! state and wake parked polls.
//!
//! All state lives in process memory behind a single mutex and resets empty
//! on restart.  Fan-out only reaches waiters parked on this instance, so the
//! relay must run as a single process; scaling out would need an external
//! shared bus.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::extract::{Query, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::time::sleep;
use tower_http::cors::{Any, CorsLayer};

use crate::message_log::{ChatMessage, MessageLog, SYSTEM_AUTHOR_ID};
use crate::presence::{PresenceRegistry, DEFAULT_NAME};
use crate::waiters::{WaiterQueue, WaiterToken};
use crate::{logging, tlog};

#[derive(Clone)]
pub struct RelayConfig {
    /// Retention bound for the message log.
    pub retain_messages: usize,
    /// How long a poll may stay parked before the empty heartbeat response.
    pub poll_deadline: Duration,
    /// Participants idle longer than this are evicted on the next poll.
    pub presence_window: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retain_messages: 100,
            poll_deadline: Duration::from_secs(25),
            presence_window: Duration::from_secs(120),
        }
    }
}

/// Shared relay state: one instance constructed at startup and injected into
/// every handler.  The mutex guards log, presence, and waiters jointly so
/// fan-out always observes a queue consistent with the append that triggered
/// it.  Critical sections never await.
#[derive(Clone)]
pub struct RelayState {
    config: RelayConfig,
    inner: Arc<Mutex<Inner>>,
    start_time: Instant,
}

struct Inner {
    log: MessageLog,
    presence: PresenceRegistry,
    waiters: WaiterQueue,
}

/// Why a command failed.  Validation errors reject the input before any
/// state mutation; internal errors mean the relay state is unusable.
#[derive(Debug, PartialEq, Eq)]
pub enum CommandError {
    Validation(&'static str),
    Internal,
}

/// Resolved long poll: messages (possibly empty on heartbeat), the current
/// connected-users view, and the server clock at response time.
pub struct PollReply {
    pub messages: Vec<ChatMessage>,
    pub connected_users: Vec<Value>,
    pub timestamp: u64,
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn generate_user_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

/// Removes a parked waiter when the poll future is dropped, whether by
/// deadline, fan-out (no-op, the token is already gone), or the transport
/// abandoning the request mid-await.  Without this, client churn would grow
/// the queue without bound.
struct ParkGuard<'a> {
    state: &'a RelayState,
    token: WaiterToken,
}

impl Drop for ParkGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.state.inner.lock() {
            inner.waiters.cancel(self.token);
        }
    }
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        let retain = config.retain_messages;
        Self {
            config,
            inner: Arc::new(Mutex::new(Inner {
                log: MessageLog::new(retain),
                presence: PresenceRegistry::new(),
                waiters: WaiterQueue::new(),
            })),
            start_time: Instant::now(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, CommandError> {
        self.inner.lock().map_err(|_| {
            tlog!("relay: state lock poisoned");
            CommandError::Internal
        })
    }

    /// Register (or refresh) a participant.  Generates an id when the caller
    /// did not supply one.  Appends nothing and wakes nobody.
    pub fn join(
        &self,
        user_id: Option<String>,
        name: Option<String>,
        profile: Map<String, Value>,
    ) -> Result<String, CommandError> {
        let id = user_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(generate_user_id);
        let now = epoch_ms();
        let mut inner = self.lock()?;
        let participant = inner.presence.upsert(&id, name.as_deref(), profile, now);
        tlog!(
            "join: {} ({})",
            participant.name,
            logging::user_id(&id)
        );
        Ok(id)
    }

    /// Append a chat message and fan it out to every waiter parked behind
    /// its id.  Does not touch presence: liveness comes from polling.
    pub fn post_message(
        &self,
        author_id: &str,
        author_name: Option<&str>,
        text: &str,
    ) -> Result<ChatMessage, CommandError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CommandError::Validation("El mensaje no puede estar vacío"));
        }

        let now = epoch_ms();
        let mut inner = self.lock()?;
        let name = author_name
            .map(str::to_string)
            .or_else(|| inner.presence.get(author_id).map(|p| p.name.clone()))
            .unwrap_or_else(|| DEFAULT_NAME.to_string());
        let msg = inner
            .log
            .append(now, text.to_string(), name, author_id.to_string());
        let woken = inner.waiters.complete_matching(&msg);
        tlog!(
            "message: {} by {} woke {} waiter(s)",
            logging::msg_id(msg.id),
            logging::user_id(author_id),
            woken
        );
        Ok(msg)
    }

    /// Soft, silent disconnect: refresh the last-seen timestamp so the
    /// participant survives a tab-switch, nothing else.
    pub fn leave(&self, user_id: &str) -> Result<(), CommandError> {
        let now = epoch_ms();
        let mut inner = self.lock()?;
        inner.presence.touch(user_id, now);
        Ok(())
    }

    /// Explicit, user-visible disconnect: drop the participant and announce
    /// it with a synthetic system message.  Unknown ids succeed silently so
    /// a retried logout stays idempotent.
    pub fn logout(&self, user_id: &str) -> Result<Option<ChatMessage>, CommandError> {
        let now = epoch_ms();
        let mut inner = self.lock()?;
        let Some(participant) = inner.presence.remove(user_id) else {
            return Ok(None);
        };
        let msg = inner.log.append(
            now,
            format!("{} salió del chat", participant.name),
            "Sistema".to_string(),
            SYSTEM_AUTHOR_ID.to_string(),
        );
        let woken = inner.waiters.complete_matching(&msg);
        tlog!(
            "logout: {} ({}) woke {} waiter(s)",
            participant.name,
            logging::user_id(user_id),
            woken
        );
        Ok(Some(msg))
    }

    /// Long poll: evict stale presence, refresh the caller, then either
    /// answer from the backlog or park until fan-out or the deadline.
    /// Resolves in exactly one of three ways — immediate backlog, fan-out
    /// delivery, or empty heartbeat — and a dropped future (client gone)
    /// unparks without responding.
    pub async fn poll(
        &self,
        cutoff: u64,
        user_id: Option<&str>,
    ) -> Result<PollReply, CommandError> {
        let window_ms = self.config.presence_window.as_millis() as u64;

        let (token, rx) = {
            let mut inner = self.lock()?;
            let now = epoch_ms();
            inner.presence.evict_stale(now, window_ms);
            if let Some(uid) = user_id {
                inner.presence.touch(uid, now);
            }

            let backlog = inner.log.since(cutoff);
            if !backlog.is_empty() {
                return Ok(Self::reply(&inner, backlog));
            }
            inner.waiters.park(cutoff)
        };

        let messages = {
            let _guard = ParkGuard { state: self, token };
            tokio::select! {
                delivered = rx => delivered.unwrap_or_default(),
                _ = sleep(self.config.poll_deadline) => Vec::new(),
            }
            // Guard drops here: removes the waiter on deadline or disconnect,
            // no-op after fan-out already consumed the token.
        };

        let inner = self.lock()?;
        Ok(Self::reply(&inner, messages))
    }

    fn reply(inner: &Inner, messages: Vec<ChatMessage>) -> PollReply {
        PollReply {
            messages,
            connected_users: inner.presence.snapshot(),
            timestamp: epoch_ms(),
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.waiters.len()).unwrap_or(0)
    }

    pub fn message_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.log.len()).unwrap_or(0)
    }

    pub fn participant_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.presence.len()).unwrap_or(0)
    }
}

pub fn app(state: RelayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route(
            "/chat",
            get(poll_chat)
                .post(dispatch_command)
                .options(preflight)
                .fallback(method_not_allowed),
        )
        .route("/health", get(healthcheck))
        .route("/debug/stats", get(debug_stats))
        .layer(cors)
        .with_state(state)
}

/// Build a standard JSON error response.
fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    let body = json!({ "error": message.into() });
    (status, Json(body)).into_response()
}

fn command_error_response(err: CommandError) -> Response {
    match err {
        CommandError::Validation(message) => api_error(StatusCode::BAD_REQUEST, message),
        CommandError::Internal => {
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Error interno del servidor")
        }
    }
}

async fn healthcheck() -> impl IntoResponse {
    StatusCode::OK
}

async fn preflight() -> impl IntoResponse {
    StatusCode::OK
}

async fn method_not_allowed() -> Response {
    api_error(StatusCode::METHOD_NOT_ALLOWED, "Método no permitido")
}

#[derive(Deserialize)]
struct PollQuery {
    #[serde(rename = "lastMessageId")]
    last_message_id: Option<String>,
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

async fn poll_chat(State(state): State<RelayState>, Query(query): Query<PollQuery>) -> Response {
    // Absent or non-numeric cutoff means "everything retained".
    let cutoff = query
        .last_message_id
        .as_deref()
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(0);

    match state.poll(cutoff, query.user_id.as_deref()).await {
        Ok(reply) => (
            StatusCode::OK,
            Json(json!({
                "messages": reply.messages,
                "connectedUsers": reply.connected_users,
                "timestamp": reply.timestamp,
            })),
        )
            .into_response(),
        Err(err) => command_error_response(err),
    }
}

async fn dispatch_command(State(state): State<RelayState>, Json(payload): Json<Value>) -> Response {
    let action = payload.get("action").and_then(Value::as_str);
    let data = payload
        .get("data")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    match action {
        Some("join") => join_command(&state, data),
        Some("message") => message_command(&state, &data),
        Some("leave") => leave_command(&state, &data),
        Some("logout") => logout_command(&state, &data),
        Some(_) | None => api_error(StatusCode::BAD_REQUEST, "Acción no válida"),
    }
}

fn take_string(data: &mut Map<String, Value>, key: &str) -> Option<String> {
    data.remove(key)
        .and_then(|v| v.as_str().map(str::to_string))
}

fn str_field<'a>(data: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

fn join_command(state: &RelayState, mut data: Map<String, Value>) -> Response {
    let user_id = take_string(&mut data, "userId");
    let name = take_string(&mut data, "user");
    // Whatever the caller sent beyond identity is kept as the profile.
    match state.join(user_id, name, data) {
        Ok(id) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "userId": id,
                "message": "Bienvenido al chat",
            })),
        )
            .into_response(),
        Err(err) => command_error_response(err),
    }
}

fn message_command(state: &RelayState, data: &Map<String, Value>) -> Response {
    let text = str_field(data, "text").unwrap_or_default();
    let author_id = str_field(data, "userId").unwrap_or("anon");
    let author_name = str_field(data, "user");

    match state.post_message(author_id, author_name, text) {
        Ok(msg) => (
            StatusCode::OK,
            Json(json!({ "success": true, "message": msg })),
        )
            .into_response(),
        Err(err) => command_error_response(err),
    }
}

fn leave_command(state: &RelayState, data: &Map<String, Value>) -> Response {
    let Some(user_id) = str_field(data, "userId") else {
        return api_error(StatusCode::BAD_REQUEST, "Falta el identificador de usuario");
    };
    match state.leave(user_id) {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true }))).into_response(),
        Err(err) => command_error_response(err),
    }
}

fn logout_command(state: &RelayState, data: &Map<String, Value>) -> Response {
    let Some(user_id) = str_field(data, "userId") else {
        return api_error(StatusCode::BAD_REQUEST, "Falta el identificador de usuario");
    };
    match state.logout(user_id) {
        Ok(_) => (StatusCode::OK, Json(json!({ "success": true }))).into_response(),
        Err(err) => command_error_response(err),
    }
}

async fn debug_stats(State(state): State<RelayState>) -> Response {
    let inner = match state.lock() {
        Ok(inner) => inner,
        Err(err) => return command_error_response(err),
    };
    let uptime_secs = state.start_time.elapsed().as_secs();

    Json(json!({
        "uptime_secs": uptime_secs,
        "messages": inner.log.len(),
        "last_message_id": inner.log.last_id(),
        "participants": inner.presence.len(),
        "waiters": inner.waiters.len(),
        "config": {
            "retain_messages": state.config.retain_messages,
            "poll_deadline_ms": state.config.poll_deadline.as_millis() as u64,
            "presence_window_ms": state.config.presence_window.as_millis() as u64,
        },
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state(poll_deadline: Duration) -> RelayState {
        RelayState::new(RelayConfig {
            retain_messages: 100,
            poll_deadline,
            presence_window: Duration::from_secs(120),
        })
    }

    #[tokio::test]
    async fn immediate_backlog_skips_parking() {
        let state = test_state(Duration::from_secs(10));
        state.post_message("b1", Some("Bob"), "uno").unwrap();
        state.post_message("b1", Some("Bob"), "dos").unwrap();

        let reply = state.poll(0, None).await.unwrap();
        assert_eq!(reply.messages.len(), 2);
        assert_eq!(state.waiter_count(), 0);

        // A cutoff at the first message only returns the second.
        let cutoff = reply.messages[0].id;
        let reply = state.poll(cutoff, None).await.unwrap();
        assert_eq!(reply.messages.len(), 1);
        assert_eq!(reply.messages[0].text, "dos");
    }

    #[tokio::test]
    async fn fanout_resolves_parked_poll() {
        let state = test_state(Duration::from_secs(10));
        let poller = tokio::spawn({
            let state = state.clone();
            async move { state.poll(0, Some("a1")).await }
        });
        // Let the poll park before posting.
        sleep(Duration::from_millis(50)).await;
        assert_eq!(state.waiter_count(), 1);

        state.post_message("b1", Some("Bob"), "hi").unwrap();

        let reply = poller.await.unwrap().unwrap();
        assert_eq!(reply.messages.len(), 1);
        assert_eq!(reply.messages[0].text, "hi");
        assert_eq!(reply.messages[0].author_id, "b1");
        assert_eq!(state.waiter_count(), 0);
    }

    #[tokio::test]
    async fn deadline_returns_empty_heartbeat() {
        let state = test_state(Duration::from_millis(100));
        let reply = state.poll(0, None).await.unwrap();
        assert!(reply.messages.is_empty());
        assert_eq!(state.waiter_count(), 0);
    }

    #[tokio::test]
    async fn fanout_wins_over_later_deadline() {
        let state = test_state(Duration::from_millis(150));
        let poller = tokio::spawn({
            let state = state.clone();
            async move { state.poll(0, None).await }
        });
        sleep(Duration::from_millis(30)).await;
        let posted = state.post_message("b1", Some("Bob"), "primero").unwrap();

        let reply = poller.await.unwrap().unwrap();
        assert_eq!(reply.messages.len(), 1);
        assert_eq!(reply.messages[0].id, posted.id);

        // Wait past the original deadline: nothing left to fire, no waiter
        // left to double-complete.
        sleep(Duration::from_millis(200)).await;
        assert_eq!(state.waiter_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_polls_leave_no_waiters() {
        let state = test_state(Duration::from_secs(30));
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..100 {
            let state = state.clone();
            tasks.spawn(async move {
                // The transport abandoning a request drops the poll future;
                // timeout() reproduces that drop.
                let _ = tokio::time::timeout(Duration::from_millis(50), state.poll(0, None)).await;
            });
        }
        while tasks.join_next().await.is_some() {}

        assert_eq!(state.waiter_count(), 0);
        assert_eq!(state.message_count(), 0);
    }

    #[tokio::test]
    async fn poll_evicts_stale_participants() {
        let state = RelayState::new(RelayConfig {
            retain_messages: 100,
            poll_deadline: Duration::from_millis(100),
            presence_window: Duration::from_millis(100),
        });
        state
            .join(Some("ghost".to_string()), Some("Gus".to_string()), Map::new())
            .unwrap();
        assert_eq!(state.participant_count(), 1);

        // Idle past the liveness window; the next poll sweeps the registry
        // on entry, so even its heartbeat reply no longer lists the idler.
        sleep(Duration::from_millis(150)).await;

        let reply = state.poll(0, None).await.unwrap();
        assert!(reply.messages.is_empty());
        assert!(reply.connected_users.iter().all(|u| u["id"] != json!("ghost")));
        assert_eq!(state.participant_count(), 0);
    }

    #[tokio::test]
    async fn blank_text_is_rejected_without_append() {
        let state = test_state(Duration::from_secs(10));
        let err = state.post_message("b1", Some("Bob"), "   ").unwrap_err();
        assert!(matches!(err, CommandError::Validation(_)));
        assert_eq!(state.message_count(), 0);
    }

    #[tokio::test]
    async fn logout_announces_departure_and_wakes_waiters() {
        let state = test_state(Duration::from_secs(10));
        state
            .join(Some("b1".to_string()), Some("Bob".to_string()), Map::new())
            .unwrap();

        let poller = tokio::spawn({
            let state = state.clone();
            async move { state.poll(0, None).await }
        });
        sleep(Duration::from_millis(50)).await;

        let msg = state.logout("b1").unwrap().expect("known participant");
        assert_eq!(msg.author_id, SYSTEM_AUTHOR_ID);
        assert_eq!(msg.text, "Bob salió del chat");

        let reply = poller.await.unwrap().unwrap();
        assert_eq!(reply.messages.len(), 1);
        assert_eq!(reply.messages[0].author_id, SYSTEM_AUTHOR_ID);
        assert_eq!(state.participant_count(), 0);

        // Logging out again is a silent no-op.
        assert!(state.logout("b1").unwrap().is_none());
        assert_eq!(state.message_count(), 1);
    }

    #[tokio::test]
    async fn leave_keeps_participant_without_announcement() {
        let state = test_state(Duration::from_secs(10));
        state
            .join(Some("b1".to_string()), Some("Bob".to_string()), Map::new())
            .unwrap();
        state.leave("b1").unwrap();
        assert_eq!(state.participant_count(), 1);
        assert_eq!(state.message_count(), 0);
    }

    #[tokio::test]
    async fn join_generates_id_when_absent() {
        let state = test_state(Duration::from_secs(10));
        let id = state.join(None, Some("Ana".to_string()), Map::new()).unwrap();
        assert!(!id.is_empty());
        assert_eq!(state.participant_count(), 1);
    }
}
