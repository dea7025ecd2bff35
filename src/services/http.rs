use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tower_http::trace::TraceLayer;

use super::{
    claims::ClaimRequest, enrollment::EnrollmentRequest, orders::OrderRequest,
    referrals::ReferralRequest, ServiceError,
};
use crate::errors::{EngineError, ErrorKind};
use crate::repositories::Store;

mod claims;
mod enrollment;
mod orders;
mod referrals;

pub const AUTHORITY_HEADER: &str = "x-data-authority";

#[derive(Clone)]
pub struct AppState {
    pub enrollment_channel: mpsc::Sender<EnrollmentRequest>,
    pub referral_channel: mpsc::Sender<ReferralRequest>,
    pub claim_channel: mpsc::Sender<ClaimRequest>,
    pub order_channel: mpsc::Sender<OrderRequest>,
    pub store: Arc<dyn Store>,
}

type ApiResponse = (StatusCode, Json<Value>);

/// Sends a request to a service and waits for its answer.
async fn dispatch<R, T>(
    channel: &mpsc::Sender<R>,
    build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> R,
) -> Result<T, ServiceError> {
    let (response_tx, response_rx) = oneshot::channel();

    channel
        .send(build(response_tx))
        .await
        .map_err(|e| ServiceError::Communication("send".to_string(), e.to_string()))?;

    let result = response_rx
        .await
        .map_err(|e| ServiceError::Communication("receive".to_string(), e.to_string()))?;

    Ok(result?)
}

pub fn error_status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::PreconditionFailed => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::Exhausted | ErrorKind::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: ServiceError) -> ApiResponse {
    match error {
        ServiceError::Engine(e) => {
            if !e.is_domain() {
                log::error!("Request failed: {}", e);
            }
            let kind = e.kind();
            (
                error_status(kind),
                Json(json!({
                    "error": kind.name(),
                    "details": e.to_string()
                })),
            )
        }
        ServiceError::Communication(stage, e) => {
            log::error!("Service channel failure ({}): {}", stage, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": ErrorKind::Internal.name(),
                    "details": format!("Failed to {} service request: {}", stage, e)
                })),
            )
        }
    }
}

fn respond<T: Serialize>(status: StatusCode, result: Result<T, ServiceError>) -> ApiResponse {
    match result {
        Ok(body) => (status, Json(json!(body))),
        Err(e) => error_response(e),
    }
}

/// Parses an optional `?status=` style filter, mapping bad values to `InvalidInput`.
fn parse_filter<T>(value: Option<String>) -> Result<Option<T>, ServiceError>
where
    T: std::str::FromStr<Err = EngineError>,
{
    value
        .filter(|v| !v.is_empty())
        .map(|v| v.parse::<T>())
        .transpose()
        .map_err(ServiceError::from)
}

/// Unwraps a JSON body, mapping malformed payloads to `InvalidInput`.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ServiceError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ServiceError::from(EngineError::invalid(rejection.body_text())))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "authority": state.store.authority()
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "degraded",
                "authority": state.store.authority(),
                "details": e.to_string()
            })),
        ),
    }
}

/// Tags every response with the store that served it.
async fn authority_header(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        HeaderName::from_static(AUTHORITY_HEADER),
        HeaderValue::from_static(state.store.authority().as_str()),
    );

    response
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/membership-requests",
            post(enrollment::submit_request).get(enrollment::list_requests),
        )
        .route("/membership-requests/{id}", get(enrollment::get_request))
        .route(
            "/membership-requests/{id}/approve",
            post(enrollment::approve_request),
        )
        .route(
            "/membership-requests/{id}/reject",
            post(enrollment::reject_request),
        )
        .route("/referrals", post(referrals::apply_referral))
        .route("/memberships", get(referrals::list_memberships))
        .route("/memberships/{code}", get(referrals::get_membership))
        .route("/memberships/{code}/progress", get(referrals::get_progress))
        .route("/users/{email}/membership", get(referrals::get_user_membership))
        .route(
            "/users/{email}/memberships",
            get(referrals::list_user_memberships),
        )
        .route("/claims", post(claims::submit_claim).get(claims::list_claims))
        .route("/claims/{id}", get(claims::get_claim))
        .route("/claims/{id}/status", put(claims::update_claim_status))
        .route("/orders", post(orders::create_order).get(orders::list_orders))
        .route("/orders/{id}", get(orders::get_order))
        .route("/orders/{id}/status", put(orders::update_order_status))
        .route(
            "/orders/{id}/payment-status",
            put(orders::update_payment_status),
        )
        .route("/health", get(health))
        .layer(middleware::from_fn_with_state(state.clone(), authority_header))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn start_http_server(state: AppState, listen: &str) -> Result<(), anyhow::Error> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(listen).await?;
    log::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
