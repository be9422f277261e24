mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use sandbox_relay::projects::AGENT_PROCESS_NAME;
use sandbox_relay::router::{RelayConfig, DEFAULT_MAX_BODY_BYTES};
use sandbox_relay_sandbox_provider::CommandOutput;
use serde_json::{json, Value};
use serial_test::serial;

use common::{TestApp, TEMPLATE};

const AGENT_PORT: u16 = 4096;
const AGENT_START: &str = "pm2 start 'opencode serve --hostname 0.0.0.0 --port 4096' \
     --name 'agent-opencode-server' --update-env";

#[tokio::test]
async fn init_clones_installs_and_starts_processes() {
    let app = TestApp::new(AGENT_PORT);

    let (status, body) = app
        .json(
            Method::POST,
            "/api/projects/p1/init",
            Some(json!({
                "githubUrl": "https://github.com/acme/app.git",
                "initScript": "npm install",
                "devScript": "npm run dev",
                "processName": "web",
                "previewPort": 5173,
                "env": { "NODE_ENV": "development" }
            })),
        )
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(
        body,
        json!({
            "projectId": "p1",
            "sandboxId": "mock-sbx-1",
            "previewUrl": "https://127.0.0.1:5173",
            "agentUrl": "https://127.0.0.1:4096"
        })
    );

    let created = app.provider.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].1, TEMPLATE);
    assert_eq!(created[0].2, Duration::from_secs(60 * 60));

    assert_eq!(
        app.commands(),
        vec![
            "git clone 'https://github.com/acme/app.git' '/workspace'".to_string(),
            "npm install".to_string(),
            "pm2 jlist".to_string(),
            "pm2 start 'npm run dev' --name 'web' --update-env".to_string(),
            "pm2 jlist".to_string(),
            AGENT_START.to_string(),
        ]
    );

    let recorded = app.provider.commands();
    assert_eq!(recorded[1].cwd.as_deref(), Some("/workspace"));
    let dev = &recorded[3];
    assert_eq!(dev.cwd.as_deref(), Some("/workspace"));
    assert_eq!(dev.envs["PORT"], "5173");
    assert_eq!(dev.envs["NODE_ENV"], "development");
    assert_eq!(recorded[5].envs["PORT"], "5173");
}

#[tokio::test]
async fn init_without_repository_only_starts_agent() {
    let app = TestApp::new(AGENT_PORT);

    let (status, body) = app
        .json(Method::POST, "/api/projects/p1/init", Some(json!({})))
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["previewUrl"], "https://127.0.0.1:3000");
    assert_eq!(
        app.commands(),
        vec!["pm2 jlist".to_string(), AGENT_START.to_string()]
    );
}

#[tokio::test]
async fn init_reuses_existing_sandbox() {
    let app = TestApp::new(AGENT_PORT);
    app.provider.add_sandbox("sbx-7");

    let (status, body) = app
        .json(
            Method::POST,
            "/api/projects/p1/init",
            Some(json!({ "sandboxId": "sbx-7" })),
        )
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["sandboxId"], "sbx-7");
    assert!(app.provider.created().is_empty());
}

#[tokio::test]
async fn init_with_unknown_sandbox_creates_one() {
    let app = TestApp::new(AGENT_PORT);

    let (status, body) = app
        .json(
            Method::POST,
            "/api/projects/p1/init",
            Some(json!({ "sandboxId": "gone" })),
        )
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["sandboxId"], "mock-sbx-1");
    assert_eq!(app.provider.created().len(), 1);
}

#[tokio::test]
async fn unparseable_init_body_is_treated_as_empty() {
    let app = TestApp::new(AGENT_PORT);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/projects/p1/init")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .expect("request");
    let (status, _, _) = app.request(request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.provider.created().len(), 1);
}

#[tokio::test]
async fn failing_init_script_reports_initialize_failed() {
    let app = TestApp::new(AGENT_PORT);
    app.provider.script(
        "npm install",
        CommandOutput {
            stderr: "ERR!".to_string(),
            exit_code: 1,
            ..CommandOutput::default()
        },
    );

    let (status, body) = app
        .json(
            Method::POST,
            "/api/projects/p1/init",
            Some(json!({ "initScript": "npm install" })),
        )
        .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["detail"], "failed to initialize sandbox");
    assert_eq!(body["projectId"], "p1");
    assert!(!app
        .commands()
        .iter()
        .any(|command| command.starts_with("pm2 start")));
}

#[tokio::test]
async fn online_agent_is_not_restarted() {
    let app = TestApp::new(AGENT_PORT);
    app.pm2_online(AGENT_PROCESS_NAME);

    let (status, _) = app
        .json(Method::POST, "/api/projects/p1/init", Some(json!({})))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.commands(), vec!["pm2 jlist".to_string()]);
}

#[tokio::test]
async fn malformed_process_list_starts_agent() {
    let app = TestApp::new(AGENT_PORT);
    app.provider.script(
        "pm2 jlist",
        CommandOutput {
            stdout: "[PM2] Spawning daemon".to_string(),
            ..CommandOutput::default()
        },
    );

    let (status, _) = app
        .json(Method::POST, "/api/projects/p1/init", Some(json!({})))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert!(app.commands().contains(&AGENT_START.to_string()));
}

#[tokio::test]
async fn describe_reports_default_preview_port() {
    let app = TestApp::new(AGENT_PORT);
    app.provider.add_sandbox("sbx-1");

    let (status, body) = app.json(Method::GET, "/api/projects/p1/sbx-1", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["previewUrl"], "https://127.0.0.1:3000");
    assert_eq!(body["agentUrl"], "https://127.0.0.1:4096");
    assert!(app.commands().is_empty());
}

#[tokio::test]
async fn describe_unknown_sandbox_fails() {
    let app = TestApp::new(AGENT_PORT);

    let (status, body) = app.json(Method::GET, "/api/projects/p1/missing", None).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["detail"], "failed to connect to sandbox");
    assert_eq!(body["sandboxId"], "missing");
}

#[tokio::test]
async fn resume_restarts_dev_server_and_updates_agent() {
    let app = TestApp::new(AGENT_PORT);
    app.provider.add_sandbox("sbx-1");

    let (status, body) = app
        .json(
            Method::POST,
            "/api/projects/p1/sbx-1/resume",
            Some(json!({
                "devScript": "npm run dev",
                "processName": "web",
                "previewPort": 8080
            })),
        )
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["previewUrl"], "https://127.0.0.1:8080");
    assert_eq!(
        app.commands(),
        vec![
            "pm2 jlist".to_string(),
            "pm2 start 'npm run dev' --name 'web' --update-env".to_string(),
            "bun update -g opencode-ai@latest".to_string(),
            "pm2 jlist".to_string(),
            AGENT_START.to_string(),
        ]
    );
}

#[tokio::test]
async fn resume_unknown_sandbox_fails() {
    let app = TestApp::new(AGENT_PORT);

    let (status, body) = app
        .json(Method::POST, "/api/projects/p1/missing/resume", None)
        .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["detail"], "failed to resume sandbox");
    assert!(app.provider.created().is_empty());
}

#[tokio::test]
async fn proxy_status_requires_url() {
    let app = TestApp::new(AGENT_PORT);

    let (status, body) = app.json(Method::GET, "/api/proxy-status", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({ "error": "Missing url" }));

    let (status, _) = app.json(Method::GET, "/api/proxy-status?url=", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn proxy_status_reports_upstream_code() {
    let agent = common::spawn_agent().await;
    let app = TestApp::new(AGENT_PORT);

    let uri = format!("/api/proxy-status?url=http://{agent}/anything");
    let (status, body) = app.json(Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": 201 }));

    let closed = common::closed_port().await;
    let uri = format!("/api/proxy-status?url=http://127.0.0.1:{closed}/");
    let (_, body) = app.json(Method::GET, &uri, None).await;
    assert_eq!(body, json!({ "status": 503 }));
}

#[tokio::test]
async fn health_and_openapi() {
    let app = TestApp::new(AGENT_PORT);

    let (status, body) = app.json(Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("ok".to_string()));

    let (status, doc) = app.json(Method::GET, "/api/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(doc["paths"]["/api/projects/{project_id}/init"].is_object());
}

#[test]
#[serial]
fn body_limit_is_read_from_env() {
    std::env::set_var("SANDBOX_RELAY_PROXY_MAX_BODY_BYTES", "1024");
    assert_eq!(RelayConfig::from_env().max_body_bytes, 1024);

    std::env::set_var("SANDBOX_RELAY_PROXY_MAX_BODY_BYTES", "lots");
    assert_eq!(RelayConfig::from_env().max_body_bytes, DEFAULT_MAX_BODY_BYTES);

    std::env::remove_var("SANDBOX_RELAY_PROXY_MAX_BODY_BYTES");
    assert_eq!(RelayConfig::from_env().max_body_bytes, DEFAULT_MAX_BODY_BYTES);
}
