pub mod handlers;
pub mod models;
pub mod state;
pub mod trace;

pub use state::AppState;
pub use models::{
    ErrorResponse, LanguageInfo,
    error_response, error_bad_request, error_unavailable, error_internal, exec_error_response,
};

use crate::config::GlobalConfig;
use crate::exec::Executor;

use anyhow::Result;
use axum::{routing::get, routing::post, Router, middleware};
use clap::Args;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "coderun",
        version = env!("CARGO_PKG_VERSION"),
        description = "Runs untrusted source code in disposable sandboxes and reports \
                       stdout, stderr, exit status and resource usage.",
        license(
            name = "MIT OR Apache-2.0",
        ),
    ),
    paths(
        handlers::run::run_handler,
        handlers::health::health_handler,
        handlers::languages::list_languages_handler,
    ),
    components(
        schemas(
            // Request and result records
            crate::exec::SubmissionRequest,
            crate::exec::ExecutionResult,
            crate::exec::Stage,
            crate::os::Breach,
            models::ErrorResponse,
            // Registry listing
            models::LanguageInfo,
            crate::lang::Language,
            crate::lang::CommandTemplate,
            handlers::languages::ListLanguagesResponse,
            handlers::health::HealthResponse,
            handlers::health::SandboxStats,
        )
    ),
    tags(
        (name = "Health", description = "Service health and status endpoints"),
        (name = "Execution", description = "Run submissions and inspect toolchains"),
    )
)]
struct ApiDoc;

/// Routes over an already-built state
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(
            SwaggerUi::new("/swagger-ui")
                .url("/api-docs/openapi.json", ApiDoc::openapi())
        )
        .route("/health", get(handlers::health::health_handler))
        .route("/languages", get(handlers::languages::list_languages_handler))
        .route("/run", post(handlers::run::run_handler))
        // Route used by earlier clients
        .route("/api/run-sandbox", post(handlers::run::run_handler))
        .layer(middleware::from_fn(trace::trace_request))
        .with_state(state)
}

/// Creates an instance of the axum app with all routes and state configured
pub fn create_app(config: &GlobalConfig) -> Result<(Router, AppState)> {
    let executor = Executor::from_config(config)?;
    let state = AppState::new(executor, &config.search_path);

    for language in state.languages.iter().filter(|l| !l.available) {
        tracing::warn!(language = %language.id, runtime = %language.runtime, "toolchain not found on search path");
    }

    Ok((router(state.clone()), state))
}

#[derive(Args)]
pub struct ServeArgs {
    /// Write process ID to the specified file
    #[arg(long, value_name="./pid.file")]
    pub pid: Option<String>,

    /// Write readiness marker to the specified file once server is listening
    ///
    /// Useful for scripts that need to wait for the server to be fully started.
    #[arg(long)]
    pub ready_file: Option<String>,

    /// Address to bind (overrides config `host`)
    #[arg(long, env = "CODERUN_HOST")]
    pub host: Option<String>,

    /// Port to listen on (overrides config `port`)
    #[arg(long, short = 'p', env = "CODERUN_PORT")]
    pub port: Option<u16>,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested, draining in-flight submissions");
}

pub async fn run(args: ServeArgs, config: &GlobalConfig) -> Result<()> {
    let host = args.host.as_deref().unwrap_or(&config.host);
    let port = args.port.unwrap_or(config.port);

    // Write PID to file if requested
    if let Some(pid_file) = &args.pid {
        let pid = std::process::id();
        std::fs::write(pid_file, pid.to_string())?;
    }

    let (app, state) = create_app(config)?;

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(
        listen = %listener.local_addr()?,
        isolation = state.executor.isolation_mode(),
        capacity = state.executor.capacity(),
        swagger = format!("http://{}:{}/swagger-ui", host, port),
        "Server started"
    );

    // Write ready file if requested (server is now ready to accept connections)
    if let Some(ready_file) = &args.ready_file {
        let pid = std::process::id();
        std::fs::write(ready_file, format!("ready {}", pid))?;
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionLimits;
    use crate::exec::testing::{exited, CountingProvisioner, Script, ScriptedGovernor};
    use crate::exec::ExecutorSettings;
    use crate::lang::Registry;
    use crate::os::{HostProvisioner, ProcessGovernor};

    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    /// Python "runs" by printing its own source, so no interpreter is needed
    fn test_state(root: &std::path::Path) -> AppState {
        let config: GlobalConfig = serde_json::from_str(
            r#"{
                "max_concurrency": 2,
                "limits": {"max_source_bytes": 64},
                "toolchains": {
                    "python3": {"pipeline": {"kind": "interpreted", "run": {"program": "cat", "args": ["main.py"]}}}
                }
            }"#,
        )
        .unwrap();

        let registry = Registry::with_overrides(&config.toolchains).unwrap();
        let provisioner = HostProvisioner::new(root, config.max_concurrency, None).unwrap();
        let governor = ProcessGovernor::new(
            config.search_path.clone(),
            config.base_read_only_paths.clone(),
            false,
        );
        let executor = Executor::new(
            Arc::new(provisioner),
            Arc::new(governor),
            Arc::new(registry),
            ExecutorSettings::from(&config),
        );
        AppState::new(executor, &config.search_path)
    }

    /// State over scripted sandboxes, for failure paths a real host cannot force
    fn mock_state(provisioner: CountingProvisioner, script: Vec<Script>, capacity: usize) -> AppState {
        let settings = ExecutorSettings {
            limits: ExecutionLimits::default(),
            capacity,
            queue_timeout: Duration::from_millis(50),
            provision_attempts: 1,
        };
        let executor = Executor::new(
            Arc::new(provisioner),
            Arc::new(ScriptedGovernor::new(script)),
            Arc::new(Registry::builtin()),
            settings,
        );
        AppState::new(executor, &[])
    }

    async fn post_run(app: Router, path: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn get_json(app: Router, path: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder().uri(path).body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_run_returns_result_record() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_state(tmp.path()));

        let (status, json) = post_run(app, "/run", r#"{"language":"python","code":"print(42)\n"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["stdout"], "print(42)\n");
        assert_eq!(json["exitCode"], 0);
        assert_eq!(json["timedOut"], false);
        assert!(json.get("stage").is_none());
    }

    #[tokio::test]
    async fn test_legacy_route_is_an_alias() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_state(tmp.path()));

        let (status, json) = post_run(app, "/api/run-sandbox", r#"{"language":"py","sourceCode":"x"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["stdout"], "x");
    }

    #[tokio::test]
    async fn test_rejections_are_400() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path());

        let (status, json) = post_run(router(state.clone()), "/run", r#"{"language":"cobol","code":"x"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "unsupported language: cobol");

        let (status, _) = post_run(router(state.clone()), "/run", r#"{"language":"python3","code":"  "}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let big = format!(r#"{{"language":"python3","code":"{}"}}"#, "x".repeat(65));
        let (status, _) = post_run(router(state.clone()), "/run", &big).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, json) = post_run(router(state.clone()), "/run", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().starts_with("Invalid JSON"));

        // Nothing was provisioned for any of them
        assert_eq!(state.executor.active(), 0);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_health() {
        let tmp = tempfile::tempdir().unwrap();
        let (status, json) = get_json(router(test_state(tmp.path())), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["sandboxes"]["capacity"], 2);
        assert_eq!(json["sandboxes"]["active"], 0);
        assert_eq!(json["isolation"], "user-namespace");
    }

    #[tokio::test]
    async fn test_languages_listing() {
        let tmp = tempfile::tempdir().unwrap();
        let (status, json) = get_json(router(test_state(tmp.path())), "/languages").await;
        assert_eq!(status, StatusCode::OK);

        let languages = json["languages"].as_array().unwrap();
        let ids: Vec<&str> = languages.iter().map(|l| l["id"].as_str().unwrap()).collect();
        assert_eq!(ids, ["python3", "javascript", "typescript", "java", "cpp", "c"]);
        assert_eq!(languages[0]["run"]["program"], "cat");
        assert_eq!(languages[0]["available"], true);
    }

    #[tokio::test]
    async fn test_openapi_lists_run() {
        let tmp = tempfile::tempdir().unwrap();
        let (status, json) = get_json(router(test_state(tmp.path())), "/api-docs/openapi.json").await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["paths"]["/run"]["post"].is_object());
    }

    #[tokio::test]
    async fn test_full_capacity_is_503() {
        let script = vec![Script::Delay(Duration::from_millis(500), exited(b"slow\n", 0))];
        let state = mock_state(CountingProvisioner::default(), script, 1);

        let slow = tokio::spawn(post_run(router(state.clone()), "/run", r#"{"language":"python3","code":"slow()"}"#));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (status, json) = post_run(router(state.clone()), "/run", r#"{"language":"python3","code":"fast()"}"#).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"], "all sandboxes are busy, retry later");

        let (status, json) = slow.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["stdout"], "slow\n");
    }

    #[tokio::test]
    async fn test_provision_failure_is_503() {
        let provisioner = CountingProvisioner { fail_first: usize::MAX, ..Default::default() };
        let state = mock_state(provisioner, Vec::new(), 2);

        let (status, json) = post_run(router(state.clone()), "/run", r#"{"language":"c","code":"int main(){}"}"#).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"], "could not provision a sandbox, retry later");
        assert_eq!(state.executor.active(), 0);
    }

    #[tokio::test]
    async fn test_internal_fault_hides_details() {
        let state = mock_state(CountingProvisioner::default(), vec![Script::Fail], 2);

        let (status, json) = post_run(router(state.clone()), "/run", r#"{"language":"python3","code":"x"}"#).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json, serde_json::json!({"error": "internal error"}));
        assert_eq!(state.executor.active(), 0);
    }
}
