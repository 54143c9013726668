//! Enlist provisions accounts: it hashes credentials, enforces email
//! uniqueness and welcomes new users without slowing down the response.

#![forbid(unsafe_code)]
pub mod account;
pub mod config;
pub mod crypto;
pub mod error;
pub mod mail;
pub mod provision;
mod router;
pub mod runner;
pub mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{Method, StatusCode, header};
use axum::routing::{get, post};
use axum::{Router, middleware as AxumMiddleware};
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};

use crate::account::PgAccountRepository;
use crate::crypto::PasswordManager;
use crate::mail::{MailManager, Mailer};
use crate::provision::Provisioner;
use crate::runner::TaskRunner;

pub use error::ServerError;

const DEFAULT_CREDENTIALS: &str = "postgres";
const DEFAULT_DATABASE_NAME: &str = "enlist";
const DEFAULT_POOL_SIZE: u32 = 10;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    pub provisioner: Provisioner,
    pub runner: TaskRunner,
    pub metrics: Option<PrometheusHandle>,
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        // Must exceed the storage deadline so it can surface first.
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, REQUEST_TIMEOUT))
        // Remove senstive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION, header::COOKIE]))
        // Add CORS preflight support.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers(Any),
        );

    Router::new()
        // `GET /v1/healthcheck` goes to `status`.
        .route("/v1/healthcheck", get(router::status::handler))
        // `POST /v1/users` goes to `create`.
        .route("/v1/users", post(router::create::handler))
        .route("/metrics", get(router::status::metrics))
        .with_state(state)
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        .layer(middleware)
}

/// Initialize the application state.
pub async fn initialize_state(
    config: Arc<config::Configuration>,
    metrics: Option<PrometheusHandle>,
) -> Result<AppState, Box<dyn std::error::Error>> {
    let Some(postgres) = &config.postgres else {
        return Err("missing `postgres` entry on `config.yaml` file".into());
    };

    let addr = format!(
        "postgres://{}:{}@{}/{}",
        postgres.username.as_deref().unwrap_or(DEFAULT_CREDENTIALS),
        postgres.password.as_deref().unwrap_or(DEFAULT_CREDENTIALS),
        postgres.address,
        postgres.database.as_deref().unwrap_or(DEFAULT_DATABASE_NAME),
    );
    let pool = PgPoolOptions::new()
        .max_connections(postgres.pool_size.unwrap_or(DEFAULT_POOL_SIZE))
        .acquire_timeout(config.storage.timeout())
        .connect(&addr)
        .await?;

    tracing::info!(hostname = %postgres.address, "postgres connected");

    // execute migrations scripts on start.
    sqlx::migrate!().run(&pool).await?;

    let pwd = Arc::new(PasswordManager::new(config.argon2.clone())?);
    let repo = Arc::new(PgAccountRepository::new(pool, config.storage.timeout()));

    // handle mail sender.
    let mailer: Arc<dyn Mailer> = match &config.mail {
        Some(cfg) => Arc::new(MailManager::new(cfg).await?),
        None => {
            tracing::warn!("missing `mail` entry on `config.yaml` file, welcome mails disabled");
            Arc::new(MailManager::default())
        },
    };

    let runner = TaskRunner::new();
    let provisioner = Provisioner::new(repo, pwd, mailer, runner.clone());

    Ok(AppState {
        config,
        provisioner,
        runner,
        metrics,
    })
}

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    app: Router,
    method: Method,
    path: &str,
    body: String,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    app.oneshot(
        Request::builder()
            .method(method)
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(axum::body::Body::from(body))
            .unwrap(),
    )
    .await
    .unwrap()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::account::MemoryAccountRepository;
    use crate::mail::RecordingMailer;
    use http_body_util::BodyExt;

    /// State backed by in-memory doubles.
    pub fn state() -> AppState {
        let runner = TaskRunner::new();
        let provisioner = Provisioner::new(
            Arc::new(MemoryAccountRepository::default()),
            Arc::new(crypto::test_manager()),
            Arc::new(RecordingMailer::default()),
            runner.clone(),
        );

        AppState {
            config: Arc::new(config::Configuration::default()),
            provisioner,
            runner,
            metrics: None,
        }
    }

    #[tokio::test]
    async fn test_healthcheck() {
        let response = make_request(
            app(state()),
            Method::GET,
            "/v1/healthcheck",
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let status: router::status::Status = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(status.status, "available");
        assert_eq!(status.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(status.in_flight, 0);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let response =
            make_request(app(state()), Method::GET, "/v1/movies", String::default()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
