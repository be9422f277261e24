use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use sandbox_relay_client::{
    InitProjectRequest, ProjectEndpoints, ProxyStatusResponse, ResumeProjectRequest,
};
use sandbox_relay_error::{ErrorType, ProblemDetails, RelayError};
use sandbox_relay_sandbox_provider::SandboxProvider;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{IntoParams, OpenApi};

use crate::projects::ProjectService;
use crate::proxy::AgentDispatcher;
use crate::proxy_status;

pub const DEFAULT_TEMPLATE: &str = "sandbox-relay-opencode";
pub const DEFAULT_AGENT_PORT: u16 = 4096;
pub const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;
const SANDBOX_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Template new sandboxes are created from.
    pub template: String,
    /// Port of the agent server inside each sandbox.
    pub agent_port: u16,
    /// How long a newly created sandbox stays alive.
    pub sandbox_timeout: Duration,
    /// Largest request body the agent proxy buffers.
    pub max_body_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
            agent_port: DEFAULT_AGENT_PORT,
            sandbox_timeout: SANDBOX_TIMEOUT,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl RelayConfig {
    /// Defaults, with the proxy body limit taken from
    /// `SANDBOX_RELAY_PROXY_MAX_BODY_BYTES` when it parses.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("SANDBOX_RELAY_PROXY_MAX_BODY_BYTES") {
            match value.trim().parse() {
                Ok(limit) => config.max_body_bytes = limit,
                Err(_) => tracing::warn!(value = %value, "ignoring invalid proxy body limit"),
            }
        }
        config
    }
}

#[derive(Debug)]
pub struct AppState {
    projects: ProjectService,
    dispatcher: AgentDispatcher,
    probe_client: reqwest::Client,
}

impl AppState {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        config: RelayConfig,
    ) -> Result<Self, reqwest::Error> {
        let dispatcher =
            AgentDispatcher::new(provider.clone(), config.agent_port, config.max_body_bytes)?;
        let probe_client = reqwest::Client::builder().build()?;
        Ok(Self {
            projects: ProjectService::new(provider, config),
            dispatcher,
            probe_client,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let mut router = Router::new()
        .route("/health", get(get_health))
        .route("/api/openapi.json", get(get_openapi))
        .route("/api/projects/:project_id/init", post(init_project))
        .route("/api/projects/:project_id/:sandbox_id", get(get_project))
        .route(
            "/api/projects/:project_id/:sandbox_id/resume",
            post(resume_project),
        )
        .route("/api/agent/:project_id/:sandbox_id", any(proxy_agent))
        .route("/api/agent/:project_id/:sandbox_id/", any(proxy_agent))
        .route("/api/agent/:project_id/:sandbox_id/*path", any(proxy_agent))
        .route("/api/proxy-status", get(get_proxy_status))
        .with_state(shared.clone());

    let http_logging = match std::env::var("SANDBOX_RELAY_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let include_headers = std::env::var("SANDBOX_RELAY_LOG_HTTP_HEADERS").is_ok();
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(move |req: &Request| {
                if include_headers {
                    let mut headers = Vec::new();
                    for (name, value) in req.headers().iter() {
                        let name_str = name.as_str();
                        let display_value = if name_str.eq_ignore_ascii_case("authorization") {
                            "<redacted>".to_string()
                        } else {
                            value.to_str().unwrap_or("<binary>").to_string()
                        };
                        headers.push((name_str.to_string(), display_value));
                    }
                    tracing::info_span!(
                        "http.request",
                        method = %req.method(),
                        uri = %req.uri(),
                        headers = ?headers
                    )
                } else {
                    tracing::info_span!(
                        "http.request",
                        method = %req.method(),
                        uri = %req.uri()
                    )
                }
            })
            .on_request(|_req: &Request, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        init_project,
        get_project,
        resume_project,
        get_proxy_status
    ),
    components(
        schemas(
            InitProjectRequest,
            ResumeProjectRequest,
            ProjectEndpoints,
            ProxyStatusResponse,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "projects", description = "Project sandboxes"),
        (name = "proxy", description = "Agent proxy helpers")
    )
)]
pub struct ApiDoc;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Relay(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct ProjectPath {
    project_id: String,
}

#[derive(Debug, Deserialize)]
struct SandboxPath {
    project_id: String,
    sandbox_id: String,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct ProxyStatusQuery {
    /// URL to probe.
    url: Option<String>,
}

/// Lenient JSON body: anything that doesn't parse is treated as `{}`.
fn lenient_json<T: DeserializeOwned + Default>(body: &Bytes) -> T {
    if body.iter().all(u8::is_ascii_whitespace) {
        return T::default();
    }
    serde_json::from_slice(body).unwrap_or_else(|err| {
        tracing::debug!(error = %err, "ignoring unparseable request body");
        T::default()
    })
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = String)),
    tag = "meta"
)]
async fn get_health() -> &'static str {
    "ok"
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    post,
    path = "/api/projects/{project_id}/init",
    params(("project_id" = String, Path, description = "Project id")),
    request_body = InitProjectRequest,
    responses(
        (status = 200, body = ProjectEndpoints),
        (status = 500, body = ProblemDetails)
    ),
    tag = "projects"
)]
async fn init_project(
    State(state): State<Arc<AppState>>,
    Path(ProjectPath { project_id }): Path<ProjectPath>,
    body: Bytes,
) -> Result<Json<ProjectEndpoints>, ApiError> {
    let request: InitProjectRequest = lenient_json(&body);
    let endpoints = state.projects.initialize(&project_id, request).await?;
    Ok(Json(endpoints))
}

#[utoipa::path(
    get,
    path = "/api/projects/{project_id}/{sandbox_id}",
    params(
        ("project_id" = String, Path, description = "Project id"),
        ("sandbox_id" = String, Path, description = "Sandbox id")
    ),
    responses(
        (status = 200, body = ProjectEndpoints),
        (status = 500, body = ProblemDetails)
    ),
    tag = "projects"
)]
async fn get_project(
    State(state): State<Arc<AppState>>,
    Path(SandboxPath {
        project_id,
        sandbox_id,
    }): Path<SandboxPath>,
) -> Result<Json<ProjectEndpoints>, ApiError> {
    let endpoints = state.projects.describe(&project_id, &sandbox_id).await?;
    Ok(Json(endpoints))
}

#[utoipa::path(
    post,
    path = "/api/projects/{project_id}/{sandbox_id}/resume",
    params(
        ("project_id" = String, Path, description = "Project id"),
        ("sandbox_id" = String, Path, description = "Sandbox id")
    ),
    request_body = ResumeProjectRequest,
    responses(
        (status = 200, body = ProjectEndpoints),
        (status = 500, body = ProblemDetails)
    ),
    tag = "projects"
)]
async fn resume_project(
    State(state): State<Arc<AppState>>,
    Path(SandboxPath {
        project_id,
        sandbox_id,
    }): Path<SandboxPath>,
    body: Bytes,
) -> Result<Json<ProjectEndpoints>, ApiError> {
    let request: ResumeProjectRequest = lenient_json(&body);
    let endpoints = state
        .projects
        .resume(&project_id, &sandbox_id, request)
        .await?;
    Ok(Json(endpoints))
}

async fn proxy_agent(
    State(state): State<Arc<AppState>>,
    Path(SandboxPath {
        project_id,
        sandbox_id,
    }): Path<SandboxPath>,
    request: Request,
) -> Response {
    state
        .dispatcher
        .dispatch(&project_id, &sandbox_id, request)
        .await
}

#[utoipa::path(
    get,
    path = "/api/proxy-status",
    params(ProxyStatusQuery),
    responses(
        (status = 200, body = ProxyStatusResponse),
        (status = 400, description = "Missing url")
    ),
    tag = "proxy"
)]
async fn get_proxy_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProxyStatusQuery>,
) -> Response {
    let Some(url) = query.url.filter(|url| !url.trim().is_empty()) else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "Missing url" }))).into_response();
    };
    let status = proxy_status::probe(&state.probe_client, &url).await;
    Json(ProxyStatusResponse { status }).into_response()
}
