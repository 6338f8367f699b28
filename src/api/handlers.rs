//! HTTP API handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, Path, Query, Request, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::EscrowError;
use crate::escrow::{AccountBalance, Redemption, SettlementEngine, UserPosition};
use crate::registry::{
    ActivityEntry, AssetId, EventFilter, EventRegistry, Identity, MarketEvent, NewEvent, Outcome,
};

/// Header carrying the caller's identity.
pub const IDENTITY_HEADER: &str = "x-identity";

/// Application state shared with handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Whether the service is accepting traffic.
    pub ready: Arc<AtomicBool>,
    /// Mint and redeem.
    pub engine: SettlementEngine,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Create new app state.
    pub fn new(engine: SettlementEngine) -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
            engine,
            metrics: None,
        }
    }

    /// Attach the Prometheus handle served on `/metrics`.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Set ready state.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Check if ready.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn registry(&self) -> &EventRegistry {
        self.engine.registry()
    }
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable kind.
    pub error: String,
    /// Human-readable message.
    pub message: String,
}

/// Handler error.
#[derive(Debug)]
pub enum ApiError {
    /// No identity header on an authenticated call.
    MissingIdentity,
    /// Body or query string did not parse.
    InvalidRequest(String),
    /// Registry or engine rejected the call.
    Escrow(EscrowError),
}

impl From<EscrowError> for ApiError {
    fn from(e: EscrowError) -> Self {
        ApiError::Escrow(e)
    }
}

fn status_for(e: &EscrowError) -> StatusCode {
    match e {
        EscrowError::NotFound { .. } => StatusCode::NOT_FOUND,
        EscrowError::Unauthorized { .. } => StatusCode::FORBIDDEN,
        EscrowError::AlreadyExists { .. }
        | EscrowError::AlreadyResolved { .. }
        | EscrowError::TooEarly { .. }
        | EscrowError::NotResolved { .. } => StatusCode::CONFLICT,
        EscrowError::InvalidAmount { .. } | EscrowError::InvalidInput { .. } => {
            StatusCode::BAD_REQUEST
        }
        EscrowError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
        EscrowError::Overflow => StatusCode::UNPROCESSABLE_ENTITY,
        EscrowError::InsufficientVaultBalance { .. } | EscrowError::ConservationViolated { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        EscrowError::Storage { .. } => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::MissingIdentity => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    error: "missing_identity".to_string(),
                    message: format!("{} header is required", IDENTITY_HEADER),
                },
            ),
            ApiError::InvalidRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: "invalid_input".to_string(),
                    message,
                },
            ),
            ApiError::Escrow(e) => (
                status_for(&e),
                ErrorBody {
                    error: e.kind().to_string(),
                    message: e.to_string(),
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}

/// Authenticated caller, from the identity header.
#[derive(Debug, Clone)]
pub struct Caller(pub Identity);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(IDENTITY_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::MissingIdentity)?;
        Ok(Caller(Identity::new(value)?))
    }
}

/// JSON body extractor that rejects with an [`ApiError`] body.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection: JsonRejection| ApiError::InvalidRequest(rejection.body_text()))?;
        Ok(ApiJson(value))
    }
}

/// Query string extractor that rejects with an [`ApiError`] body.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiQuery<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|rejection: QueryRejection| ApiError::InvalidRequest(rejection.body_text()))?;
        Ok(ApiQuery(value))
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Status: "ok".
    pub status: &'static str,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    /// Whether service is ready.
    pub ready: bool,
    /// Registered events.
    pub events: usize,
}

/// Body of a resolve call.
#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    /// True when the YES condition occurred.
    pub outcome: bool,
}

/// Body of a mint call.
#[derive(Debug, Deserialize)]
pub struct MintRequest {
    /// Collateral units to deposit.
    pub amount: i64,
}

/// Health check handler - always returns 200.
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

/// Readiness check handler - returns 200 if ready, 503 otherwise.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let is_ready = state.is_ready();
    let response = ReadyResponse {
        ready: is_ready,
        events: state.registry().len(),
    };

    if is_ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Prometheus exposition.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed".to_string()),
    }
}

/// List events, optionally filtered by reporter and resolution state.
pub async fn list_events(
    State(state): State<AppState>,
    ApiQuery(filter): ApiQuery<EventFilter>,
) -> Json<Vec<MarketEvent>> {
    Json(state.registry().list(&filter).await)
}

/// Register a new event, created by the caller.
pub async fn create_event(
    State(state): State<AppState>,
    Caller(caller): Caller,
    ApiJson(request): ApiJson<NewEvent>,
) -> Result<(StatusCode, Json<MarketEvent>), ApiError> {
    let event = state.registry().create_event(request, &caller)?;
    Ok((StatusCode::CREATED, Json(event)))
}

/// Fetch one event.
pub async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<MarketEvent>, ApiError> {
    Ok(Json(state.registry().get(&event_id).await?))
}

/// Audit trail of one event.
pub async fn get_activity(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<Vec<ActivityEntry>>, ApiError> {
    Ok(Json(state.registry().activity(&event_id).await?))
}

/// Record an event's outcome. Caller must be its reporter.
pub async fn resolve_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    Caller(caller): Caller,
    ApiJson(request): ApiJson<ResolveRequest>,
) -> Result<Json<MarketEvent>, ApiError> {
    let event = state
        .registry()
        .resolve(&event_id, Outcome::from(request.outcome), &caller)
        .await?;
    Ok(Json(event))
}

/// Deposit collateral for a YES/NO claim pair.
pub async fn mint(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    Caller(caller): Caller,
    ApiJson(request): ApiJson<MintRequest>,
) -> Result<Json<UserPosition>, ApiError> {
    let position = state.engine.mint(&event_id, request.amount, &caller).await?;
    Ok(Json(position))
}

/// Redeem the caller's winning claims.
pub async fn redeem(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    Caller(caller): Caller,
) -> Result<Json<Redemption>, ApiError> {
    Ok(Json(state.engine.redeem(&event_id, &caller).await?))
}

/// Fetch one holder's position.
pub async fn get_position(
    State(state): State<AppState>,
    Path((event_id, holder)): Path<(String, String)>,
) -> Result<Json<UserPosition>, ApiError> {
    let holder = Identity::new(holder)?;
    Ok(Json(state.registry().position(&event_id, &holder).await?))
}

/// Collateral balance outside the vaults.
pub async fn get_balance(
    State(state): State<AppState>,
    Path((holder, asset)): Path<(String, String)>,
) -> Result<Json<AccountBalance>, ApiError> {
    let holder = Identity::new(holder)?;
    let asset = AssetId::new(asset)?;
    let balance = state.engine.bank().balance(&holder, &asset);
    Ok(Json(AccountBalance {
        holder,
        asset,
        balance,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::escrow::{InMemoryBank, MintPolicy};
    use crate::registry::RegistryPolicy;

    fn state() -> AppState {
        let registry = Arc::new(EventRegistry::new(
            Arc::new(ManualClock::new(0)),
            RegistryPolicy::default(),
        ));
        let engine = SettlementEngine::new(registry, Arc::new(InMemoryBank::new()), MintPolicy::default());
        AppState::new(engine)
    }

    #[test]
    fn app_state_ready_toggle() {
        let state = state();
        assert!(!state.is_ready());

        state.set_ready(true);
        assert!(state.is_ready());

        state.set_ready(false);
        assert!(!state.is_ready());
    }

    #[test]
    fn error_statuses_follow_taxonomy() {
        let cases = [
            (EscrowError::NotFound { event_id: "E".into() }, StatusCode::NOT_FOUND),
            (
                EscrowError::Unauthorized { caller: "x".into(), event_id: "E".into() },
                StatusCode::FORBIDDEN,
            ),
            (EscrowError::AlreadyResolved { event_id: "E".into() }, StatusCode::CONFLICT),
            (EscrowError::InvalidAmount { amount: 0 }, StatusCode::BAD_REQUEST),
            (
                EscrowError::InsufficientFunds { required: 2, available: 1 },
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                EscrowError::ConservationViolated { event_id: "E".into(), detail: "x".into() },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (EscrowError::Storage { detail: "locked".into() }, StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (error, status) in cases {
            assert_eq!(status_for(&error), status, "{:?}", error);
        }
    }
}
