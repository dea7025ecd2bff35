use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use super::{dispatch, json_body, respond, AppState};
use crate::models::orders::{CartItem, CustomerSnapshot, OrderStatus, PaymentStatus};
use crate::services::orders::OrderRequest;

#[derive(Deserialize)]
pub struct NewOrder {
    items: Vec<CartItem>,
    customer: CustomerSnapshot,
}

#[derive(Deserialize)]
pub struct StatusUpdate<S> {
    status: S,
    #[serde(default)]
    note: Option<String>,
}

#[derive(Deserialize)]
pub struct OrderFilter {
    email: Option<String>,
}

pub async fn create_order(
    State(state): State<AppState>,
    payload: Result<Json<NewOrder>, JsonRejection>,
) -> impl IntoResponse {
    let req = match json_body(payload) {
        Ok(req) => req,
        Err(e) => return respond::<()>(StatusCode::CREATED, Err(e)),
    };
    let result = dispatch(&state.order_channel, |response| OrderRequest::Create {
        cart: req.items,
        customer: req.customer,
        response,
    })
    .await;

    respond(StatusCode::CREATED, result)
}

pub async fn list_orders(
    State(state): State<AppState>,
    Query(filter): Query<OrderFilter>,
) -> impl IntoResponse {
    let email = filter.email.filter(|email| !email.trim().is_empty());
    let result = dispatch(&state.order_channel, |response| OrderRequest::List {
        email,
        response,
    })
    .await;

    respond(StatusCode::OK, result)
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let result = dispatch(&state.order_channel, |response| OrderRequest::Get {
        id,
        response,
    })
    .await;

    respond(StatusCode::OK, result)
}

pub async fn update_order_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<StatusUpdate<OrderStatus>>, JsonRejection>,
) -> impl IntoResponse {
    let update = match json_body(payload) {
        Ok(update) => update,
        Err(e) => return respond::<()>(StatusCode::OK, Err(e)),
    };
    let result = dispatch(&state.order_channel, |response| OrderRequest::UpdateStatus {
        id,
        status: update.status,
        note: update.note,
        response,
    })
    .await;

    respond(StatusCode::OK, result)
}

pub async fn update_payment_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<StatusUpdate<PaymentStatus>>, JsonRejection>,
) -> impl IntoResponse {
    let update = match json_body(payload) {
        Ok(update) => update,
        Err(e) => return respond::<()>(StatusCode::OK, Err(e)),
    };
    let result = dispatch(&state.order_channel, |response| {
        OrderRequest::UpdatePaymentStatus {
            id,
            status: update.status,
            note: update.note,
            response,
        }
    })
    .await;

    respond(StatusCode::OK, result)
}
