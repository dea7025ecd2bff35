use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::oneshot;

use super::{RequestHandler, Service};
use crate::errors::{ConflictKind, EngineError, Entity};
use crate::models::{
    orders::{CartItem, CustomerSnapshot, Order, OrderStatus, PaymentStatus, ShippingPolicy},
    requests::normalize_email,
};
use crate::repositories::Store;
use crate::utils;

/// Bound on order id re-rolls after a storage-level collision.
const MAX_ORDER_ID_ATTEMPTS: u32 = 5;

pub enum OrderRequest {
    Create {
        cart: Vec<CartItem>,
        customer: CustomerSnapshot,
        response: oneshot::Sender<Result<Order, EngineError>>,
    },
    UpdateStatus {
        id: String,
        status: OrderStatus,
        note: Option<String>,
        response: oneshot::Sender<Result<Order, EngineError>>,
    },
    UpdatePaymentStatus {
        id: String,
        status: PaymentStatus,
        note: Option<String>,
        response: oneshot::Sender<Result<Order, EngineError>>,
    },
    Get {
        id: String,
        response: oneshot::Sender<Result<Order, EngineError>>,
    },
    List {
        email: Option<String>,
        response: oneshot::Sender<Result<Vec<Order>, EngineError>>,
    },
}

#[derive(Clone)]
pub struct OrderRequestHandler {
    store: Arc<dyn Store>,
    shipping: ShippingPolicy,
}

impl OrderRequestHandler {
    pub fn new(store: Arc<dyn Store>, shipping: ShippingPolicy) -> Self {
        OrderRequestHandler { store, shipping }
    }

    pub async fn create_order(
        &self,
        cart: Vec<CartItem>,
        mut customer: CustomerSnapshot,
    ) -> Result<Order, EngineError> {
        customer.email = normalize_email(&customer.email);
        if customer.name.trim().is_empty() || customer.email.is_empty() {
            return Err(EngineError::invalid("customer name and email are required"));
        }
        if customer.address.trim().is_empty() || customer.postal_code.trim().is_empty() {
            return Err(EngineError::invalid("shipping address and postal code are required"));
        }

        for attempt in 1..=MAX_ORDER_ID_ATTEMPTS {
            let now = Utc::now();
            let order_id = utils::order_id(now, &mut rand::thread_rng());
            let order = Order::place(order_id, &cart, customer.clone(), &self.shipping, now)?;

            match self.store.insert_order(order).await {
                Ok(order) => {
                    log::info!(
                        "Order {} placed by {} (total {} cents).",
                        order.order_id,
                        order.customer.email,
                        order.total_in_cents
                    );
                    return Ok(order);
                }
                Err(EngineError::Conflict(ConflictKind::DuplicateOrderId(id))) => {
                    log::debug!("Order id {} collided (attempt {}).", id, attempt);
                }
                Err(e) => return Err(e),
            }
        }

        Err(EngineError::Exhausted(MAX_ORDER_ID_ATTEMPTS))
    }

    pub async fn update_status(
        &self,
        id: &str,
        status: OrderStatus,
        note: Option<String>,
    ) -> Result<Order, EngineError> {
        let now = Utc::now();
        let order = self
            .store
            .update_order(
                id,
                Box::new(move |order: &mut Order| -> Result<(), EngineError> {
                    order.record_status(status, note, now);
                    Ok(())
                }),
            )
            .await?;
        log::info!("Order {} moved to {}.", order.order_id, order.status);

        Ok(order)
    }

    pub async fn update_payment_status(
        &self,
        id: &str,
        status: PaymentStatus,
        note: Option<String>,
    ) -> Result<Order, EngineError> {
        let now = Utc::now();
        let order = self
            .store
            .update_order(
                id,
                Box::new(move |order: &mut Order| -> Result<(), EngineError> {
                    order.record_payment_status(status, note, now);
                    Ok(())
                }),
            )
            .await?;
        log::info!("Order {} payment is {}.", order.order_id, order.payment_status);

        Ok(order)
    }

    pub async fn get(&self, id: &str) -> Result<Order, EngineError> {
        self.store
            .get_order(id)
            .await?
            .ok_or_else(|| EngineError::not_found(Entity::Order, id))
    }

    pub async fn list(&self, email: Option<&str>) -> Result<Vec<Order>, EngineError> {
        let email = email.map(normalize_email);
        self.store.list_orders(email.as_deref()).await
    }
}

#[async_trait]
impl RequestHandler<OrderRequest> for OrderRequestHandler {
    async fn handle_request(&self, request: OrderRequest) {
        match request {
            OrderRequest::Create {
                cart,
                customer,
                response,
            } => {
                let result = self.create_order(cart, customer).await;
                let _ = response.send(result);
            }
            OrderRequest::UpdateStatus {
                id,
                status,
                note,
                response,
            } => {
                let result = self.update_status(&id, status, note).await;
                let _ = response.send(result);
            }
            OrderRequest::UpdatePaymentStatus {
                id,
                status,
                note,
                response,
            } => {
                let result = self.update_payment_status(&id, status, note).await;
                let _ = response.send(result);
            }
            OrderRequest::Get { id, response } => {
                let result = self.get(&id).await;
                let _ = response.send(result);
            }
            OrderRequest::List { email, response } => {
                let result = self.list(email.as_deref()).await;
                let _ = response.send(result);
            }
        }
    }
}

pub struct OrderService;

impl OrderService {
    pub fn new() -> Self {
        OrderService {}
    }
}

#[async_trait]
impl Service<OrderRequest, OrderRequestHandler> for OrderService {}
