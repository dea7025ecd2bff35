use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::EngineError;
use crate::repositories::Store;
use crate::settings::Settings;

pub mod claims;
pub mod enrollment;
pub mod http;
pub mod orders;
pub mod referrals;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("Communication error: {0} - {1}")]
    Communication(String, String),
}

#[async_trait]
pub trait RequestHandler<T>: Send + Sync + 'static
where
    T: Send + 'static,
{
    async fn handle_request(&self, request: T);
}

#[async_trait]
pub trait Service<T, H>: Send + Sync + 'static
where
    T: Send + 'static,
    H: RequestHandler<T> + Clone + Send,
{
    async fn run(&mut self, handler: H, receiver: &mut mpsc::Receiver<T>) {
        while let Some(request) = receiver.recv().await {
            let handler = handler.clone();

            tokio::spawn(async move {
                handler.handle_request(request).await;
            });
        }
    }
}

/// Builds every handler from the settings snapshot and the shared store.
pub struct Handlers {
    pub enrollment: enrollment::EnrollmentRequestHandler,
    pub referrals: referrals::ReferralRequestHandler,
    pub claims: claims::ClaimRequestHandler,
    pub orders: orders::OrderRequestHandler,
}

impl Handlers {
    pub fn new(store: Arc<dyn Store>, settings: &Settings) -> Self {
        Handlers {
            enrollment: enrollment::EnrollmentRequestHandler::new(
                store.clone(),
                settings.catalog.clone(),
                settings.referral_codes.max_attempts,
            ),
            referrals: referrals::ReferralRequestHandler::new(store.clone()),
            claims: claims::ClaimRequestHandler::new(store.clone()),
            orders: orders::OrderRequestHandler::new(store, settings.shipping),
        }
    }
}

/// Spawns one service per domain and wires their channels into an `AppState`.
pub fn spawn_services(handlers: Handlers) -> http::AppState {
    let (enrollment_tx, mut enrollment_rx) = mpsc::channel(512);
    let (referral_tx, mut referral_rx) = mpsc::channel(512);
    let (claim_tx, mut claim_rx) = mpsc::channel(512);
    let (order_tx, mut order_rx) = mpsc::channel(512);

    let Handlers {
        enrollment,
        referrals,
        claims,
        orders,
    } = handlers;
    let authority_store = enrollment.store();

    log::info!("Starting enrollment service.");
    tokio::spawn(async move {
        let mut service = enrollment::EnrollmentService::new();
        service.run(enrollment, &mut enrollment_rx).await;
    });

    log::info!("Starting referral service.");
    tokio::spawn(async move {
        let mut service = referrals::ReferralService::new();
        service.run(referrals, &mut referral_rx).await;
    });

    log::info!("Starting claim service.");
    tokio::spawn(async move {
        let mut service = claims::ClaimService::new();
        service.run(claims, &mut claim_rx).await;
    });

    log::info!("Starting order service.");
    tokio::spawn(async move {
        let mut service = orders::OrderService::new();
        service.run(orders, &mut order_rx).await;
    });

    http::AppState {
        enrollment_channel: enrollment_tx,
        referral_channel: referral_tx,
        claim_channel: claim_tx,
        order_channel: order_tx,
        store: authority_store,
    }
}

pub async fn start_services(
    store: Arc<dyn Store>,
    settings: Settings,
    listen: &str,
) -> Result<(), anyhow::Error> {
    let state = spawn_services(Handlers::new(store, &settings));

    log::info!("Starting HTTP server.");
    http::start_http_server(state, listen).await
}
