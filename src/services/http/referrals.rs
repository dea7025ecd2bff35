use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use super::{dispatch, json_body, respond, AppState};
use crate::models::memberships::ReferredUser;
use crate::services::referrals::ReferralRequest;

#[derive(Deserialize)]
pub struct NewReferral {
    referral_code: String,
    #[serde(flatten)]
    referred: ReferredUser,
}

pub async fn apply_referral(
    State(state): State<AppState>,
    payload: Result<Json<NewReferral>, JsonRejection>,
) -> impl IntoResponse {
    let req = match json_body(payload) {
        Ok(req) => req,
        Err(e) => return respond::<()>(StatusCode::OK, Err(e)),
    };
    let result = dispatch(&state.referral_channel, |response| ReferralRequest::Apply {
        referral_code: req.referral_code,
        referred: req.referred,
        response,
    })
    .await;

    respond(StatusCode::OK, result)
}

pub async fn list_memberships(State(state): State<AppState>) -> impl IntoResponse {
    let result = dispatch(&state.referral_channel, |response| {
        ReferralRequest::ListMemberships { response }
    })
    .await;

    respond(StatusCode::OK, result)
}

pub async fn get_membership(
    State(state): State<AppState>,
    Path(referral_code): Path<String>,
) -> impl IntoResponse {
    let result = dispatch(&state.referral_channel, |response| {
        ReferralRequest::GetMembership {
            referral_code,
            response,
        }
    })
    .await;

    respond(StatusCode::OK, result)
}

pub async fn get_progress(
    State(state): State<AppState>,
    Path(referral_code): Path<String>,
) -> impl IntoResponse {
    let result = dispatch(&state.referral_channel, |response| ReferralRequest::Progress {
        referral_code,
        response,
    })
    .await;

    respond(StatusCode::OK, result)
}

pub async fn get_user_membership(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> impl IntoResponse {
    let result = dispatch(&state.referral_channel, |response| {
        ReferralRequest::GetMembershipByEmail { email, response }
    })
    .await;

    respond(StatusCode::OK, result)
}

pub async fn list_user_memberships(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> impl IntoResponse {
    let result = dispatch(&state.referral_channel, |response| {
        ReferralRequest::ListMembershipsForEmail { email, response }
    })
    .await;

    respond(StatusCode::OK, result)
}
