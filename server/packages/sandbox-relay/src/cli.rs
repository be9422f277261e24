use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use axum::http::{header, HeaderName, HeaderValue, Method};
use clap::{Args, Parser, Subcommand};
use sandbox_relay_client::{
    new_project_id, now_millis, AgentMode, AgentStream, ClientError, InitProjectRequest,
    ProjectRecord, ProjectStore, Projection, RelayClient, ResumeProjectRequest, SendMessage,
    StoreError, StreamConfig,
};
use sandbox_relay_sandbox_provider::{HttpProviderConfig, HttpSandboxProvider, ProviderError};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::router::{
    build_router_with_state, AppState, RelayConfig, DEFAULT_AGENT_PORT, DEFAULT_TEMPLATE,
};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8787;

#[derive(Parser, Debug)]
#[command(name = "sandbox-relay", bin_name = "sandbox-relay")]
#[command(about = "Provision agent sandboxes and relay their sessions", version)]
#[command(arg_required_else_help = true)]
pub struct SandboxRelayCli {
    #[command(subcommand)]
    command: Command,

    /// Relay server the client commands talk to.
    #[arg(long, short = 'e', global = true)]
    endpoint: Option<String>,

    /// Project store file.
    #[arg(long, global = true)]
    store: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay HTTP server.
    Server(ServerArgs),
    /// Create and manage project sandboxes.
    Project(ProjectArgs),
    /// Follow and drive the agent session of a project.
    Session(SessionArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Sandbox template for new projects.
    #[arg(long, default_value = DEFAULT_TEMPLATE)]
    template: String,

    /// Port of the agent server inside the sandbox.
    #[arg(long, default_value_t = DEFAULT_AGENT_PORT)]
    agent_port: u16,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,
}

#[derive(Args, Debug)]
pub struct ProjectArgs {
    #[command(subcommand)]
    command: ProjectCommand,
}

#[derive(Subcommand, Debug)]
pub enum ProjectCommand {
    /// Create a sandbox for a repository and record it locally.
    Create(ProjectCreateArgs),
    /// List recorded projects, newest first.
    List,
    /// Show a recorded project and its current endpoints.
    Show(ProjectIdArgs),
    /// Resume the sandbox of a recorded project.
    Resume(ProjectResumeArgs),
}

#[derive(Args, Debug)]
pub struct ProjectCreateArgs {
    #[arg(long, short = 'g')]
    github_url: Option<String>,

    /// Reuse this sandbox when it is still reachable.
    #[arg(long)]
    sandbox_id: Option<String>,

    #[arg(long)]
    init_script: Option<String>,

    #[arg(long)]
    dev_script: Option<String>,

    #[arg(long)]
    process_name: Option<String>,

    #[arg(long)]
    work_dir: Option<String>,

    #[arg(long)]
    preview_port: Option<u16>,

    /// Environment for started processes, as KEY=VALUE.
    #[arg(long = "env", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,
}

#[derive(Args, Debug)]
pub struct ProjectIdArgs {
    project_id: String,
}

#[derive(Args, Debug)]
pub struct ProjectResumeArgs {
    project_id: String,

    /// Defaults to the dev script recorded at creation.
    #[arg(long)]
    dev_script: Option<String>,

    #[arg(long)]
    process_name: Option<String>,

    #[arg(long)]
    work_dir: Option<String>,

    #[arg(long)]
    preview_port: Option<u16>,

    #[arg(long = "env", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,
}

#[derive(Args, Debug)]
pub struct SessionArgs {
    #[command(subcommand)]
    command: SessionCommand,
}

#[derive(Subcommand, Debug)]
pub enum SessionCommand {
    /// Print session activity as it streams in.
    Watch(SessionTargetArgs),
    /// Send a prompt to the agent.
    Send(SessionSendArgs),
    /// Abort the running turn.
    Abort(SessionTargetArgs),
}

#[derive(Args, Debug)]
pub struct SessionTargetArgs {
    project_id: String,

    /// Sandbox to use instead of the recorded one.
    #[arg(long)]
    sandbox_id: Option<String>,

    /// Session to use instead of the first existing one.
    #[arg(long)]
    session_id: Option<String>,
}

#[derive(Args, Debug)]
pub struct SessionSendArgs {
    #[command(flatten)]
    target: SessionTargetArgs,

    text: String,

    /// Use the planning agent instead of the build agent.
    #[arg(long)]
    plan: bool,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    provider: Option<String>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("cors credentials require at least one --cors-allow-origin")]
    CorsCredentialsWithoutOrigin,
    #[error("unknown project: {0}")]
    UnknownProject(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("client error: {0}")]
    Client(#[from] ClientError),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("project store error: {0}")]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub struct CliConfig {
    pub endpoint: Option<String>,
    pub store: Option<PathBuf>,
}

pub fn run_sandbox_relay() -> Result<(), CliError> {
    let SandboxRelayCli {
        command,
        endpoint,
        store,
    } = SandboxRelayCli::parse();
    let config = CliConfig { endpoint, store };
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&command, &config)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| CliError::Server(err.to_string()))
}

pub fn run_command(command: &Command, cli: &CliConfig) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args),
        Command::Project(subcommand) => run_project(&subcommand.command, cli),
        Command::Session(subcommand) => run_session(&subcommand.command, cli),
    }
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    let provider = HttpSandboxProvider::new(HttpProviderConfig::from_env())?;
    let config = RelayConfig {
        template: server.template.clone(),
        agent_port: server.agent_port,
        ..RelayConfig::from_env()
    };
    let state = Arc::new(AppState::new(Arc::new(provider), config)?);
    let (mut router, _state) = build_router_with_state(state);

    let cors = build_cors_layer(server)?;
    router = router.layer(cors);

    let addr = format!("{}:{}", server.host, server.port);
    let runtime = build_runtime()?;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn run_project(command: &ProjectCommand, cli: &CliConfig) -> Result<(), CliError> {
    let store = open_store(cli)?;
    match command {
        ProjectCommand::Create(args) => {
            let relay = relay_client(cli)?;
            let project_id = new_project_id();
            let request = InitProjectRequest {
                sandbox_id: args.sandbox_id.clone(),
                github_url: args.github_url.clone(),
                init_script: args.init_script.clone(),
                dev_script: args.dev_script.clone(),
                process_name: args.process_name.clone(),
                work_dir: args.work_dir.clone(),
                preview_port: args.preview_port,
                env: env_map(&args.env),
            };
            let endpoints = build_runtime()?.block_on(relay.init_project(&project_id, &request))?;
            store.add(ProjectRecord {
                id: project_id,
                github_url: args.github_url.clone().unwrap_or_default(),
                sandbox_id: endpoints.sandbox_id.clone(),
                preview_url: endpoints.preview_url.clone(),
                agent_url: Some(endpoints.agent_url.clone()),
                init_script: args.init_script.clone(),
                dev_script: args.dev_script.clone(),
                created_at: now_millis(),
            })?;
            print_json(&endpoints)
        }
        ProjectCommand::List => print_json(&store.list()?),
        ProjectCommand::Show(args) => {
            let record = find_project(&store, &args.project_id)?;
            let relay = relay_client(cli)?;
            let endpoints = build_runtime()?
                .block_on(relay.get_project(&record.id, &record.sandbox_id))?;
            print_json(&json!({ "project": record, "endpoints": endpoints }))
        }
        ProjectCommand::Resume(args) => {
            let record = find_project(&store, &args.project_id)?;
            let relay = relay_client(cli)?;
            let request = ResumeProjectRequest {
                dev_script: args.dev_script.clone().or(record.dev_script),
                process_name: args.process_name.clone(),
                work_dir: args.work_dir.clone(),
                preview_port: args.preview_port,
                env: env_map(&args.env),
            };
            let endpoints = build_runtime()?.block_on(relay.resume_project(
                &record.id,
                &record.sandbox_id,
                &request,
            ))?;
            print_json(&endpoints)
        }
    }
}

fn run_session(command: &SessionCommand, cli: &CliConfig) -> Result<(), CliError> {
    let relay = relay_client(cli)?;
    let runtime = build_runtime()?;
    match command {
        SessionCommand::Watch(target) => {
            let agent = agent_client(&relay, cli, target)?;
            runtime.block_on(async move {
                let session_id = match target.session_id.clone() {
                    Some(session_id) => session_id,
                    None => agent.session().await?.id,
                };
                write_stderr_line(&format!("watching session {session_id}"))?;

                let stream =
                    AgentStream::spawn(Arc::new(agent), Some(session_id), StreamConfig::default());
                let mut updates = stream.watch();
                let mut printer = WatchPrinter::default();
                let shutdown = tokio::signal::ctrl_c();
                tokio::pin!(shutdown);
                loop {
                    tokio::select! {
                        _ = &mut shutdown => break,
                        changed = updates.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            let projection = updates.borrow_and_update().clone();
                            for line in printer.lines(&projection) {
                                write_stdout_line(&line)?;
                            }
                        }
                    }
                }
                stream.close().await;
                Ok::<(), CliError>(())
            })
        }
        SessionCommand::Send(args) => {
            let agent = agent_client(&relay, cli, &args.target)?;
            let message = SendMessage {
                text: args.text.clone(),
                agent: if args.plan {
                    AgentMode::Plan
                } else {
                    AgentMode::Build
                },
                files: Vec::new(),
                model: args.model.clone(),
                provider_id: args.provider.clone(),
            };
            let reply = runtime.block_on(async {
                let session_id = match args.target.session_id.clone() {
                    Some(session_id) => session_id,
                    None => agent.session().await?.id,
                };
                agent.send_message(&session_id, &message).await
            })?;
            print_json(&reply)
        }
        SessionCommand::Abort(target) => {
            let agent = agent_client(&relay, cli, target)?;
            let aborted = runtime.block_on(async {
                let session_id = match target.session_id.clone() {
                    Some(session_id) => session_id,
                    None => agent.session().await?.id,
                };
                agent.abort(&session_id).await
            })?;
            print_json(&json!({ "aborted": aborted }))
        }
    }
}

/// Renders connection changes and new or changed text parts.
#[derive(Debug, Default)]
struct WatchPrinter {
    connected: Option<bool>,
    printed: HashMap<String, String>,
}

impl WatchPrinter {
    fn lines(&mut self, projection: &Projection) -> Vec<String> {
        let mut lines = Vec::new();
        if self.connected != Some(projection.connected) {
            self.connected = Some(projection.connected);
            let state = if projection.connected {
                "connected"
            } else {
                "disconnected"
            };
            lines.push(format!("-- {state}"));
        }
        for message in &projection.messages {
            let role = message
                .fields
                .get("role")
                .and_then(Value::as_str)
                .unwrap_or("agent");
            for part in projection.parts_for(&message.id) {
                if part.kind() != Some("text") {
                    continue;
                }
                let Some(text) = part.text() else {
                    continue;
                };
                if self.printed.get(&part.id).map(String::as_str) == Some(text) {
                    continue;
                }
                self.printed.insert(part.id.clone(), text.to_string());
                lines.push(format!("[{role}] {text}"));
            }
        }
        lines
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime, CliError> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

fn relay_client(cli: &CliConfig) -> Result<RelayClient, CliError> {
    let endpoint = cli
        .endpoint
        .clone()
        .unwrap_or_else(|| format!("http://{}:{}", DEFAULT_HOST, DEFAULT_PORT));
    Ok(RelayClient::new(endpoint)?)
}

fn open_store(cli: &CliConfig) -> Result<ProjectStore, CliError> {
    let path = match cli.store.clone() {
        Some(path) => path,
        None => ProjectStore::default_path()?,
    };
    Ok(ProjectStore::new(path))
}

fn find_project(store: &ProjectStore, project_id: &str) -> Result<ProjectRecord, CliError> {
    store
        .get(project_id)?
        .ok_or_else(|| CliError::UnknownProject(project_id.to_string()))
}

fn agent_client(
    relay: &RelayClient,
    cli: &CliConfig,
    target: &SessionTargetArgs,
) -> Result<sandbox_relay_client::AgentClient, CliError> {
    let sandbox_id = match target.sandbox_id.clone() {
        Some(sandbox_id) => sandbox_id,
        None => find_project(&open_store(cli)?, &target.project_id)?.sandbox_id,
    };
    Ok(relay.agent(&target.project_id, &sandbox_id))
}

fn env_map(pairs: &[(String, String)]) -> Option<BTreeMap<String, String>> {
    if pairs.is_empty() {
        return None;
    }
    Some(pairs.iter().cloned().collect())
}

fn parse_env_pair(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, val)) if !key.is_empty() => Ok((key.to_string(), val.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{value}`")),
    }
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins: Vec<HeaderValue> = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        if server.cors_allow_credentials {
            return Err(CliError::CorsCredentialsWithoutOrigin);
        }
        cors = cors.allow_origin(Any);
    } else {
        cors = cors.allow_origin(origins);
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods([Method::GET, Method::POST, Method::OPTIONS]);
    } else {
        let mut methods: Vec<Method> = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    } else {
        let mut headers: Vec<HeaderName> = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if server.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    let pretty = serde_json::to_string_pretty(value)?;
    write_stdout_line(&pretty)
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn write_stderr_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stderr();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
