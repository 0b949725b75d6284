//! Countersign Server
//!
//! HTTP front end for the authorization service:
//! - Opens requests and collects signatures
//! - Serves and verifies the audit chain
//! - Toggles emergency mode (admin token required)
//!
//! # Usage
//!
//! ```bash
//! COUNTERSIGN_ADMIN_TOKEN=$(openssl rand -hex 32) \
//!   countersign-server --config /etc/countersign/countersign.yaml
//! ```
//!
//! Overdue requests are expired and new audit entries verified on a fixed
//! interval (`settings.sweep_interval_secs`).

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use countersign::{
    audit::{AuditSink, JsonLinesSink, TracingSink},
    config::{CountersignConfig, LogFormat},
    lifecycle::NewRequest,
    AuditFilter, AuthorityId, AuthorizationService, CredentialProof, EmergencyLevel, Error,
    MemoryStore, RequestFilter, RequestId, SqliteStore, Store,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "countersign-server")]
#[command(about = "Countersign M-of-N authorization server", long_about = None)]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long, env = "COUNTERSIGN_CONFIG")]
    config: PathBuf,

    /// Override `settings.bind_addr`
    #[arg(long, env = "COUNTERSIGN_BIND_ADDR")]
    bind_addr: Option<String>,

    /// Token for emergency and acknowledgment endpoints; they are disabled when unset
    #[arg(long, env = "COUNTERSIGN_ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,

    /// Log filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Application state
struct AppState {
    service: AuthorizationService,
    admin_token: Option<String>,
}

// ============================================================================
// Errors
// ============================================================================

/// Error body: `{ "error": "<name>", "code": <u16>, "message": "..." }`.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    code: u16,
    message: String,
}

enum ApiError {
    Service(Error),
    Unauthorized,
    AdminDisabled,
    Internal(String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Service(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Service(e) => {
                let code = e.code();
                let status = StatusCode::from_u16(code.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if status.is_server_error() {
                    error!(error = %e, code = code.code(), "request failed");
                }
                (
                    status,
                    ErrorBody {
                        error: code.name(),
                        code: code.code(),
                        message: e.to_string(),
                    },
                )
            }
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    error: "unauthorized",
                    code: 401,
                    message: "invalid admin token".into(),
                },
            ),
            ApiError::AdminDisabled => (
                StatusCode::FORBIDDEN,
                ErrorBody {
                    error: "admin-disabled",
                    code: 403,
                    message: "COUNTERSIGN_ADMIN_TOKEN is not configured".into(),
                },
            ),
            ApiError::Internal(message) => {
                error!(error = %message, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        error: "internal-error",
                        code: 500,
                        message: "internal server error".into(),
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Run a service call off the async runtime; the service blocks on locks and SQLite.
async fn blocking<T, F>(state: &Arc<AppState>, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&AuthorizationService) -> countersign::Result<T> + Send + 'static,
{
    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || f(&state.service))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map(Json)
        .map_err(ApiError::from)
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(ApiError::AdminDisabled);
    };
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();
    let valid: bool = presented.as_bytes().ct_eq(expected.as_bytes()).into();
    if valid {
        Ok(())
    } else {
        warn!("admin request with invalid token");
        Err(ApiError::Unauthorized)
    }
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    halted: bool,
    last_sequence: u64,
}

#[derive(Debug, Deserialize)]
struct SignatureBody {
    authority_id: AuthorityId,
    proof: CredentialProof,
}

#[derive(Debug, Deserialize)]
struct RejectBody {
    authority_id: AuthorityId,
    reason: String,
    proof: CredentialProof,
}

#[derive(Debug, Default, Deserialize)]
struct VerifyBody {
    #[serde(default)]
    from: Option<u64>,
    #[serde(default)]
    to: Option<u64>,
    #[serde(default)]
    full: bool,
}

#[derive(Debug, Deserialize)]
struct AcknowledgeBody {
    operator: String,
    #[serde(default)]
    note: String,
}

#[derive(Debug, Serialize)]
struct AcknowledgeResponse {
    acknowledged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    entry: Option<countersign::AuditEntry>,
}

#[derive(Debug, Deserialize)]
struct ActivateBody {
    level: EmergencyLevel,
    actor: AuthorityId,
}

#[derive(Debug, Deserialize)]
struct DeactivateBody {
    actor: AuthorityId,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(state): State<Arc<AppState>>) -> ApiResult<HealthResponse> {
    blocking(&state, |service| {
        Ok(HealthResponse {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            halted: service.integrity()?.is_halted(),
            last_sequence: service.chain_head()?.last_sequence,
        })
    })
    .await
}

async fn create_request(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewRequest>,
) -> Result<(StatusCode, Json<countersign::AuthorizationRequest>), ApiError> {
    let created = blocking(&state, move |service| service.create_request(new)).await?;
    Ok((StatusCode::CREATED, created))
}

async fn list_requests(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<RequestFilter>,
) -> ApiResult<Vec<countersign::AuthorizationRequest>> {
    blocking(&state, move |service| service.list_requests(&filter)).await
}

async fn get_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<countersign::RequestView> {
    let id = RequestId::parse(id)?;
    blocking(&state, move |service| service.get_request_view(&id)).await
}

async fn submit_signature(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SignatureBody>,
) -> ApiResult<countersign::AuthorizationRequest> {
    let id = RequestId::parse(id)?;
    blocking(&state, move |service| {
        service.submit_signature(&id, &body.authority_id, &body.proof)
    })
    .await
}

async fn reject_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<RejectBody>,
) -> ApiResult<countersign::AuthorizationRequest> {
    let id = RequestId::parse(id)?;
    blocking(&state, move |service| {
        service.reject_request(&id, &body.authority_id, &body.reason, &body.proof)
    })
    .await
}

async fn audit_log(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<AuditFilter>,
) -> ApiResult<Vec<countersign::AuditEntry>> {
    blocking(&state, move |service| service.get_audit_log(&filter)).await
}

async fn verify_audit(
    State(state): State<Arc<AppState>>,
    body: Option<Json<VerifyBody>>,
) -> ApiResult<countersign::ChainVerification> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    blocking(&state, move |service| {
        if body.full {
            return service.verify_chain_full();
        }
        match (body.from, body.to) {
            (None, None) => service.verify_chain(None),
            (from, to) => {
                let to = match to {
                    Some(to) => to,
                    None => service.chain_head()?.last_sequence,
                };
                service.verify_chain(Some(from.unwrap_or(1)..=to))
            }
        }
    })
    .await
}

async fn acknowledge(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AcknowledgeBody>,
) -> ApiResult<AcknowledgeResponse> {
    require_admin(&state, &headers)?;
    blocking(&state, move |service| {
        let entry = service.acknowledge_corruption(&body.operator, &body.note)?;
        Ok(AcknowledgeResponse {
            acknowledged: entry.is_some(),
            entry,
        })
    })
    .await
}

async fn emergency_state(
    State(state): State<Arc<AppState>>,
) -> ApiResult<countersign::EmergencyState> {
    blocking(&state, |service| service.emergency_state()).await
}

async fn activate_emergency(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ActivateBody>,
) -> ApiResult<countersign::EmergencyState> {
    require_admin(&state, &headers)?;
    blocking(&state, move |service| {
        service.activate_emergency(body.level, &body.actor)
    })
    .await
}

async fn deactivate_emergency(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<DeactivateBody>,
) -> ApiResult<countersign::EmergencyState> {
    require_admin(&state, &headers)?;
    blocking(&state, move |service| service.deactivate_emergency(&body.actor)).await
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/requests", post(create_request).get(list_requests))
        .route("/v1/requests/:id", get(get_request))
        .route("/v1/requests/:id/signatures", post(submit_signature))
        .route("/v1/requests/:id/reject", post(reject_request))
        .route("/v1/audit", get(audit_log))
        .route("/v1/audit/verify", post(verify_audit))
        .route("/v1/audit/acknowledge", post(acknowledge))
        .route("/v1/emergency", get(emergency_state))
        .route("/v1/emergency/activate", post(activate_emergency))
        .route("/v1/emergency/deactivate", post(deactivate_emergency))
        .with_state(state)
}

// ============================================================================
// Startup
// ============================================================================

fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}

fn open_store(config: &CountersignConfig) -> countersign::Result<Arc<dyn Store>> {
    Ok(match &config.settings.database_path {
        Some(path) => Arc::new(SqliteStore::open(path)?),
        None => {
            warn!("no database_path configured; requests and audit entries are kept in memory");
            Arc::new(MemoryStore::new())
        }
    })
}

/// Expire overdue requests and verify new audit entries.
async fn maintenance(state: Arc<AppState>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let state = Arc::clone(&state);
        let outcome = tokio::task::spawn_blocking(move || {
            state.service.sweep_expired()?;
            state.service.verify_chain(None)
        })
        .await;
        match outcome {
            Ok(Ok(verification)) if !verification.valid => {
                // The service has latched the corruption and alerted its sink.
                error!(
                    first_invalid_sequence = ?verification.first_invalid_sequence,
                    "background verification found a broken audit chain"
                );
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(error = %e, "maintenance pass failed"),
            Err(e) => error!(error = %e, "maintenance task panicked"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutting down gracefully");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = CountersignConfig::from_file(&args.config)?;
    init_logging(&args.log_level, config.settings.log_format);
    let registry = config.registry()?;

    let store = open_store(&config)?;
    let sink: Arc<dyn AuditSink> = match &config.settings.audit_log_path {
        Some(path) => {
            let sink = JsonLinesSink::open(path)?;
            info!(path = %sink.path().display(), "exporting audit entries as JSON lines");
            Arc::new(sink)
        }
        None => Arc::new(TracingSink),
    };
    let service = AuthorizationService::builder(store)
        .registry(registry)
        .sink(sink)
        .request_ttl(config.request_ttl())
        .build()?;

    let integrity = service.integrity()?;
    if integrity.is_halted() {
        warn!(
            halted_at_sequence = ?integrity.halted_at_sequence,
            "audit chain corruption detected at startup; writes are halted until acknowledged"
        );
    }

    if args.admin_token.is_none() {
        warn!(
            "COUNTERSIGN_ADMIN_TOKEN not set; emergency and acknowledgment endpoints are disabled"
        );
    }

    let state = Arc::new(AppState {
        service,
        admin_token: args.admin_token,
    });

    let sweep_every = Duration::from_secs(config.settings.sweep_interval_secs.max(1));
    let maintenance_task = tokio::spawn(maintenance(Arc::clone(&state), sweep_every));

    let bind_addr = args.bind_addr.unwrap_or(config.settings.bind_addr);
    let addr: SocketAddr = bind_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "countersign server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    maintenance_task.abort();
    Ok(())
}
