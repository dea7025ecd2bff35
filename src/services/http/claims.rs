use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use super::{dispatch, json_body, parse_filter, respond, AppState};
use crate::models::{
    claims::{ClaimStatus, NewClaimDetails},
    memberships::RewardType,
};
use crate::services::claims::ClaimRequest;

#[derive(Deserialize)]
pub struct NewClaim {
    email: String,
    reward_type: RewardType,
    #[serde(flatten)]
    details: NewClaimDetails,
}

#[derive(Deserialize)]
pub struct ClaimStatusUpdate {
    status: ClaimStatus,
    #[serde(default)]
    note: Option<String>,
}

#[derive(Deserialize)]
pub struct ClaimFilter {
    status: Option<String>,
}

pub async fn submit_claim(
    State(state): State<AppState>,
    payload: Result<Json<NewClaim>, JsonRejection>,
) -> impl IntoResponse {
    let req = match json_body(payload) {
        Ok(req) => req,
        Err(e) => return respond::<()>(StatusCode::CREATED, Err(e)),
    };
    let result = dispatch(&state.claim_channel, |response| ClaimRequest::Submit {
        email: req.email,
        reward_type: req.reward_type,
        details: req.details,
        response,
    })
    .await;

    respond(StatusCode::CREATED, result)
}

pub async fn list_claims(
    State(state): State<AppState>,
    Query(filter): Query<ClaimFilter>,
) -> impl IntoResponse {
    let status = match parse_filter::<ClaimStatus>(filter.status) {
        Ok(status) => status,
        Err(e) => return respond::<()>(StatusCode::OK, Err(e)),
    };

    let result = dispatch(&state.claim_channel, |response| ClaimRequest::List {
        status,
        response,
    })
    .await;

    respond(StatusCode::OK, result)
}

pub async fn get_claim(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result = dispatch(&state.claim_channel, |response| ClaimRequest::Get {
        id,
        response,
    })
    .await;

    respond(StatusCode::OK, result)
}

pub async fn update_claim_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ClaimStatusUpdate>, JsonRejection>,
) -> impl IntoResponse {
    let update = match json_body(payload) {
        Ok(update) => update,
        Err(e) => return respond::<()>(StatusCode::OK, Err(e)),
    };
    let result = dispatch(&state.claim_channel, |response| ClaimRequest::UpdateStatus {
        id,
        status: update.status,
        note: update.note,
        response,
    })
    .await
    .map(|(claim, membership)| {
        json!({
            "claim": claim,
            "membership": membership
        })
    });

    respond(StatusCode::OK, result)
}
