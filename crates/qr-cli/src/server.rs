//! HTTP surface over the research agent.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use qr_agent::{AgentError, AgentState, ResearchAgent, TurnOutcome};
use qr_core::{Error, Resource};

/// Conversation states keyed by session id. Each state has its own lock so
/// one session's turns run one at a time while sessions proceed in parallel.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<AgentState>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Mutex<AgentState>>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Fetch a session, creating it with `default_model` if it doesn't exist.
    pub async fn get_or_create(&self, id: &str, default_model: &str) -> Arc<Mutex<AgentState>> {
        if let Some(session) = self.get(id).await {
            return session;
        }
        let mut sessions = self.sessions.write().await;
        Arc::clone(sessions.entry(id.to_string()).or_insert_with(|| {
            info!(session = %id, "Creating session");
            Arc::new(Mutex::new(AgentState::new().with_model(default_model)))
        }))
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<ResearchAgent>,
    pub sessions: Arc<SessionStore>,
}

impl AppState {
    pub fn new(agent: Arc<ResearchAgent>) -> Self {
        Self {
            agent,
            sessions: Arc::new(SessionStore::new()),
        }
    }
}

/// Error body returned by every route.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        let status = match &err {
            AgentError::ModelInvocation(Error::ModelNotFound(_)) => StatusCode::BAD_REQUEST,
            AgentError::LoopLimitExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AgentError::ModelInvocation(_)
            | AgentError::Search(_)
            | AgentError::MalformedToolArguments { .. } => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, error = %self.message, "Request failed");
        }
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct TurnRequest {
    pub message: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TurnResponse {
    pub state: AgentState,
    pub outcome: TurnOutcome,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub query: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteParams {
    pub url: String,
}

pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/sessions/:id", get(get_session).put(put_session))
        .route("/sessions/:id/messages", post(post_message))
        .route("/sessions/:id/stream", post(stream_message))
        .route("/search", post(search_resources))
        .route("/analyze", post(analyze_resources))
        .route("/resources", axum::routing::delete(delete_resource))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind `addr` and serve the API until the process is stopped.
pub async fn serve(agent: Arc<ResearchAgent>, addr: &str, allowed_origins: &[String]) -> anyhow::Result<()> {
    let app = router(AppState::new(agent), allowed_origins);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!(addr = %listener.local_addr()?, "Research server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn get_session(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<AgentState> {
    let session = app
        .sessions
        .get(&id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Unknown session: {}", id)))?;
    let state = session.lock().await.clone();
    Ok(Json(state))
}

async fn put_session(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(mut incoming): Json<AgentState>,
) -> ApiResult<AgentState> {
    incoming.absorb_resource_content(app.agent.cache());
    let session = app
        .sessions
        .get_or_create(&id, app.agent.models().default_model())
        .await;
    let mut state = session.lock().await;
    *state = incoming;
    Ok(Json(state.clone()))
}

/// Resolve the session for a turn. A requested model is only validated here;
/// the turn itself applies it.
async fn session_for_turn(
    app: &AppState,
    id: &str,
    model: Option<&str>,
) -> Result<Arc<Mutex<AgentState>>, ApiError> {
    if let Some(model) = model {
        if !app.agent.models().contains(model) {
            return Err(ApiError::bad_request(format!("Unknown model: {}", model)));
        }
    }
    Ok(app
        .sessions
        .get_or_create(id, app.agent.models().default_model())
        .await)
}

async fn post_message(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<TurnRequest>,
) -> ApiResult<TurnResponse> {
    let session = session_for_turn(&app, &id, request.model.as_deref()).await?;
    let mut state = session.lock().await;
    let outcome = app
        .agent
        .run_turn_with_events(&mut state, &request.message, request.model.as_deref(), None)
        .await?;
    Ok(Json(TurnResponse {
        state: state.clone(),
        outcome,
    }))
}

async fn stream_message(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<TurnRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let session = session_for_turn(&app, &id, request.model.as_deref()).await?;

    let (tx, rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = oneshot::channel::<Event>();
    let agent = Arc::clone(&app.agent);

    tokio::spawn(async move {
        let mut state = session.lock().await;
        let result = agent
            .run_turn_with_events(&mut state, &request.message, request.model.as_deref(), Some(&tx))
            .await;
        drop(tx);

        let final_event = match result {
            Ok(outcome) => json_event(
                "state",
                &TurnResponse {
                    state: state.clone(),
                    outcome,
                },
            ),
            Err(e) => json_event("error", &ErrorBody { error: e.to_string() }),
        };
        let _ = done_tx.send(final_event);
    });

    let turn_events = UnboundedReceiverStream::new(rx).map(|event| Ok(json_event("turn", &event)));
    let finished = stream::once(async move {
        Ok(done_rx.await.unwrap_or_else(|_| {
            json_event(
                "error",
                &ErrorBody {
                    error: "turn aborted".to_string(),
                },
            )
        }))
    });

    Ok(Sse::new(turn_events.chain(finished)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

fn json_event<T: Serialize>(name: &str, payload: &T) -> Event {
    Event::default()
        .event(name)
        .data(serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string()))
}

async fn search_resources(
    State(app): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Vec<Resource>> {
    if params.query.trim().is_empty() {
        return Err(ApiError::bad_request("query must not be empty"));
    }
    let results = app
        .agent
        .search_provider()
        .search(&params.query)
        .await
        .map_err(AgentError::Search)?;
    Ok(Json(results))
}

async fn analyze_resources(
    State(app): State<AppState>,
    Json(mut state): Json<AgentState>,
) -> ApiResult<AgentState> {
    app.agent.analyze(&mut state).await?;
    Ok(Json(state))
}

async fn delete_resource(
    Query(params): Query<DeleteParams>,
    Json(mut state): Json<AgentState>,
) -> ApiResult<AgentState> {
    state.remove_resources(std::slice::from_ref(&params.url));
    Ok(Json(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use qr_agent::AgentConfig;
    use qr_core::testing::{MockProvider, MockSearch};
    use qr_core::ResourceCache;
    use qr_providers::ModelRegistry;
    use qr_tools::{FetchConfig, ResourceFetcher};
    use serde_json::json;
    use tower::ServiceExt;

    struct TestApp {
        provider: Arc<MockProvider>,
        alt_provider: Arc<MockProvider>,
        search: Arc<MockSearch>,
        state: AppState,
    }

    fn test_app() -> TestApp {
        let provider = Arc::new(MockProvider::new());
        let search = Arc::new(MockSearch::new());
        let fetcher = Arc::new(ResourceFetcher::new(
            Arc::new(ResourceCache::new()),
            FetchConfig::default(),
        ));
        let alt_provider = Arc::new(MockProvider::new());
        let models = ModelRegistry::new("openai")
            .with_model("openai", provider.clone(), None, None)
            .with_model("anthropic", alt_provider.clone(), None, None);
        let agent = ResearchAgent::new(
            Arc::new(models),
            search.clone(),
            fetcher,
            AgentConfig::default().with_max_reentries(1),
        );
        TestApp {
            provider,
            alt_provider,
            search,
            state: AppState::new(Arc::new(agent)),
        }
    }

    fn app_router(app: &TestApp) -> Router {
        router(app.state.clone(), &["http://localhost:3000".to_string()])
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_model_switch_rolls_back_with_failed_turn() {
        let app = test_app();
        app.alt_provider.queue_error(qr_core::Error::api(500, "overloaded"));

        let response = app_router(&app)
            .oneshot(json_request(
                "POST",
                "/sessions/s1/messages",
                json!({"message": "hi", "model": "anthropic"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(app.alt_provider.request_count(), 1);
        let stored = app.state.sessions.get("s1").await.unwrap();
        let stored = stored.lock().await;
        assert_eq!(stored.model, "openai");
        assert!(stored.messages.is_empty());
    }

    #[tokio::test]
    async fn test_model_switch_kept_after_successful_turn() {
        let app = test_app();
        app.alt_provider.queue_response("Hello from the other model.");

        let response = app_router(&app)
            .oneshot(json_request(
                "POST",
                "/sessions/s1/messages",
                json!({"message": "hi", "model": "anthropic"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["state"]["model"], "anthropic");
        assert_eq!(app.provider.request_count(), 0);
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app();
        let response = app_router(&app)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"status": "healthy"}));
    }

    #[tokio::test]
    async fn test_post_message_runs_turn() {
        let app = test_app();
        app.provider.queue_tool_call("WriteReport", json!({"report": "Draft"}));
        app.provider.queue_response("Saved your report.");

        let response = app_router(&app)
            .oneshot(json_request("POST", "/sessions/s1/messages", json!({"message": "write"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["state"]["report"], "Draft");
        assert_eq!(body["outcome"]["reply"], "Saved your report.");
        assert_eq!(body["state"]["messages"].as_array().unwrap().len(), 3);

        let stored = app.state.sessions.get("s1").await.unwrap();
        assert_eq!(stored.lock().await.report, "Draft");
    }

    #[tokio::test]
    async fn test_loop_limit_maps_to_422_and_keeps_state() {
        let app = test_app();
        for _ in 0..3 {
            app.provider.queue_tool_call("WriteReport", json!({"report": "again"}));
        }

        let response = app_router(&app)
            .oneshot(json_request("POST", "/sessions/s1/messages", json!({"message": "loop"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("Loop limit"));
        let stored = app.state.sessions.get("s1").await.unwrap();
        assert!(stored.lock().await.messages.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_model_rejected() {
        let app = test_app();
        let response = app_router(&app)
            .oneshot(json_request(
                "POST",
                "/sessions/s1/messages",
                json!({"message": "hi", "model": "mistral"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(app.provider.request_count(), 0);
    }

    #[tokio::test]
    async fn test_get_unknown_session_is_404() {
        let app = test_app();
        let response = app_router(&app)
            .oneshot(Request::builder().uri("/sessions/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_put_session_seeds_cache() {
        let app = test_app();
        let state = json!({
            "research_question": "q",
            "resources": [
                {"url": "http://x", "title": "X", "description": "", "content": "ERROR"},
                {"url": "http://y", "title": "Y", "description": "", "content": "article text"}
            ]
        });

        let response = app_router(&app)
            .oneshot(json_request("PUT", "/sessions/s2", state))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["resources"][0].get("content").is_none());

        let cache = app.state.agent.cache();
        assert!(cache.get("http://x").unwrap().is_failed());
        assert_eq!(cache.content("http://y").as_deref(), Some("article text"));
        assert_eq!(app.state.sessions.len().await, 1);
    }

    #[tokio::test]
    async fn test_search_route() {
        let app = test_app();
        app.search
            .add_results("solar", vec![Resource::new("http://a", "A", "about solar")]);

        let response = app_router(&app)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/search?query=solar")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body[0]["url"], "http://a");
        assert_eq!(body[0]["description"], "about solar");
    }

    #[tokio::test]
    async fn test_search_failure_is_502() {
        let app = test_app();
        app.search.fail_query("solar", Error::search("quota"));

        let response = app_router(&app)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/search?query=solar")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_delete_resource_route() {
        let app = test_app();
        let state = json!({
            "resources": [
                {"url": "http://a", "title": "A", "description": ""},
                {"url": "http://b", "title": "B", "description": ""}
            ]
        });

        let response = app_router(&app)
            .oneshot(json_request("DELETE", "/resources?url=http%3A%2F%2Fa", state))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let resources = body["resources"].as_array().unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0]["url"], "http://b");
    }

    #[tokio::test]
    async fn test_analyze_route() {
        let app = test_app();
        app.provider.queue_response("Better report.");

        let response = app_router(&app)
            .oneshot(json_request("POST", "/analyze", json!({"report": "Old."})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["report"], "Better report.");
    }

    #[tokio::test]
    async fn test_stream_emits_turn_events_then_state() {
        let app = test_app();
        app.provider.queue_response("Hello there.");

        let response = app_router(&app)
            .oneshot(json_request("POST", "/sessions/s3/stream", json!({"message": "hi"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();

        let turn_at = text.find("event: turn").unwrap();
        let state_at = text.find("event: state").unwrap();
        assert!(turn_at < state_at);
        assert!(text.contains(r#""type":"finished""#));
        assert!(text.contains("Hello there."));
    }
}
