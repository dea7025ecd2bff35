use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use super::{dispatch, json_body, parse_filter, respond, AppState};
use crate::models::requests::{NewMembershipRequest, RequestStatus};
use crate::services::enrollment::EnrollmentRequest;

#[derive(Deserialize)]
pub struct RequestFilter {
    status: Option<String>,
}

pub async fn submit_request(
    State(state): State<AppState>,
    payload: Result<Json<NewMembershipRequest>, JsonRejection>,
) -> impl IntoResponse {
    let request = match json_body(payload) {
        Ok(request) => request,
        Err(e) => return respond::<()>(StatusCode::CREATED, Err(e)),
    };
    let result = dispatch(&state.enrollment_channel, |response| {
        EnrollmentRequest::Submit { request, response }
    })
    .await;

    respond(StatusCode::CREATED, result)
}

pub async fn list_requests(
    State(state): State<AppState>,
    Query(filter): Query<RequestFilter>,
) -> impl IntoResponse {
    let status = match parse_filter::<RequestStatus>(filter.status) {
        Ok(status) => status,
        Err(e) => return respond::<()>(StatusCode::OK, Err(e)),
    };

    let result = dispatch(&state.enrollment_channel, |response| {
        EnrollmentRequest::List { status, response }
    })
    .await;

    respond(StatusCode::OK, result)
}

pub async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result = dispatch(&state.enrollment_channel, |response| {
        EnrollmentRequest::Get { id, response }
    })
    .await;

    respond(StatusCode::OK, result)
}

pub async fn approve_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result = dispatch(&state.enrollment_channel, |response| {
        EnrollmentRequest::Approve { id, response }
    })
    .await;

    respond(StatusCode::OK, result)
}

pub async fn reject_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result = dispatch(&state.enrollment_channel, |response| {
        EnrollmentRequest::Reject { id, response }
    })
    .await;

    respond(StatusCode::OK, result)
}
