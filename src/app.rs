use crate::config::RelayConfig;
use crate::error::{AppError, AppResult};
use axum::Router;
use axum::extract::{DefaultBodyLimit, Request};
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
}

const PREFLIGHT_MAX_AGE: Duration = Duration::from_secs(86_400);

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

pub fn load_state() -> AppResult<AppState> {
    load_state_with_config(RelayConfig::from_env()?)
}

pub fn load_state_with_config(config: RelayConfig) -> AppResult<AppState> {
    // No client-wide timeout: the per-request deadline owns cancellation of streaming calls.
    let http = reqwest::Client::builder()
        .user_agent(concat!("chat-relay/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(AppError::internal)?;

    let metrics = init_metrics()?;

    tracing::info!(
        model = %config.upstream.model,
        base_url = %config.upstream.base_url,
        deadline_ms = config.deadline.as_millis() as u64,
        "relay configured"
    );

    Ok(AppState {
        config: Arc::new(config),
        http,
        metrics,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.config.metrics_path.clone();
    let chat_router = build_chat_router(&state.config);
    Router::<AppState>::new()
        .merge(chat_router)
        .route(&metrics_path, get(crate::handlers::metrics))
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(TraceLayer::new_for_http())
}

fn build_chat_router(config: &RelayConfig) -> Router<AppState> {
    Router::new()
        .route("/api/chat", post(crate::handlers::chat))
        .route("/v1/chat", post(crate::handlers::chat))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.body_limit_bytes))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        ))
        .layer(cors_layer(&config.allowed_origin))
        .layer(middleware::from_fn(preflight_no_content))
}

/// The CORS layer answers preflights with an empty 200; browsers expect 204.
async fn preflight_no_content(req: Request, next: Next) -> Response {
    let is_preflight = req.method() == Method::OPTIONS;
    let mut resp = next.run(req).await;
    if is_preflight && resp.status() == StatusCode::OK {
        *resp.status_mut() = StatusCode::NO_CONTENT;
    }
    resp
}

fn cors_layer(allowed_origin: &str) -> CorsLayer {
    let origin = if allowed_origin.trim() == "*" {
        AllowOrigin::any()
    } else {
        match HeaderValue::from_str(allowed_origin.trim()) {
            Ok(value) => AllowOrigin::exact(value),
            Err(err) => {
                tracing::warn!(origin = allowed_origin, "ignoring invalid allowed origin: {err}");
                AllowOrigin::list(Vec::<HeaderValue>::new())
            }
        }
    };
    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            HeaderName::from_static("x-requested-with"),
        ])
        .max_age(PREFLIGHT_MAX_AGE)
}
