use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::oneshot;

use super::{RequestHandler, Service};
use crate::errors::{EngineError, Entity, PreconditionKind};
use crate::models::{
    memberships::{Membership, MembershipProgress, ReferredUser},
    requests::normalize_email,
};
use crate::repositories::Store;

pub enum ReferralRequest {
    Apply {
        referral_code: String,
        referred: ReferredUser,
        response: oneshot::Sender<Result<Membership, EngineError>>,
    },
    GetMembership {
        referral_code: String,
        response: oneshot::Sender<Result<Membership, EngineError>>,
    },
    GetMembershipByEmail {
        email: String,
        response: oneshot::Sender<Result<Membership, EngineError>>,
    },
    ListMembershipsForEmail {
        email: String,
        response: oneshot::Sender<Result<Vec<Membership>, EngineError>>,
    },
    ListMemberships {
        response: oneshot::Sender<Result<Vec<Membership>, EngineError>>,
    },
    Progress {
        referral_code: String,
        response: oneshot::Sender<Result<MembershipProgress, EngineError>>,
    },
}

#[derive(Clone)]
pub struct ReferralRequestHandler {
    store: Arc<dyn Store>,
}

impl ReferralRequestHandler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        ReferralRequestHandler { store }
    }

    /// Counts one referral against the code's membership. Reaching a goal only
    /// unlocks claiming; no claim flag moves here.
    pub async fn apply_referral(
        &self,
        referral_code: &str,
        referred: ReferredUser,
    ) -> Result<Membership, EngineError> {
        let code = referral_code.trim().to_uppercase();
        if referred.name.trim().is_empty() {
            return Err(EngineError::invalid("referred user name is required"));
        }

        let now = Utc::now();
        let result = self
            .store
            .update_membership(
                &code,
                Box::new(move |membership: &mut Membership| {
                    membership.accrue_referral(&referred, now)
                }),
            )
            .await;

        match result {
            Ok(membership) => {
                log::info!(
                    "Referral counted for {} ({}/{} cashback, {}/{} gold).",
                    membership.referral_code,
                    membership.referral_count,
                    membership.cashback_goal,
                    membership.referral_count,
                    membership.gold_goal
                );
                Ok(membership)
            }
            Err(EngineError::NotFound { .. }) => {
                log::debug!("Referral for unknown code {} ignored.", code);
                Err(EngineError::PreconditionFailed(PreconditionKind::UnknownCode(code)))
            }
            Err(e) => {
                log::warn!("Referral for {} rejected: {}", code, e);
                Err(e)
            }
        }
    }

    pub async fn get_membership(&self, referral_code: &str) -> Result<Membership, EngineError> {
        let code = referral_code.trim().to_uppercase();
        self.store
            .get_membership(&code)
            .await?
            .ok_or_else(|| EngineError::not_found(Entity::Membership, code))
    }

    /// The active membership for the email, else the most recent one.
    pub async fn get_membership_by_email(&self, email: &str) -> Result<Membership, EngineError> {
        let email = normalize_email(email);
        if let Some(active) = self.store.find_active_membership(&email).await? {
            return Ok(active);
        }

        self.store
            .memberships_for_email(&email)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::not_found(Entity::Membership, email))
    }

    pub async fn list_memberships_for_email(
        &self,
        email: &str,
    ) -> Result<Vec<Membership>, EngineError> {
        self.store
            .memberships_for_email(&normalize_email(email))
            .await
    }

    pub async fn list_memberships(&self) -> Result<Vec<Membership>, EngineError> {
        self.store.list_memberships().await
    }

    pub async fn progress(&self, referral_code: &str) -> Result<MembershipProgress, EngineError> {
        Ok(self.get_membership(referral_code).await?.progress())
    }
}

#[async_trait]
impl RequestHandler<ReferralRequest> for ReferralRequestHandler {
    async fn handle_request(&self, request: ReferralRequest) {
        match request {
            ReferralRequest::Apply {
                referral_code,
                referred,
                response,
            } => {
                let result = self.apply_referral(&referral_code, referred).await;
                let _ = response.send(result);
            }
            ReferralRequest::GetMembership {
                referral_code,
                response,
            } => {
                let result = self.get_membership(&referral_code).await;
                let _ = response.send(result);
            }
            ReferralRequest::GetMembershipByEmail { email, response } => {
                let result = self.get_membership_by_email(&email).await;
                let _ = response.send(result);
            }
            ReferralRequest::ListMembershipsForEmail { email, response } => {
                let result = self.list_memberships_for_email(&email).await;
                let _ = response.send(result);
            }
            ReferralRequest::ListMemberships { response } => {
                let result = self.list_memberships().await;
                let _ = response.send(result);
            }
            ReferralRequest::Progress {
                referral_code,
                response,
            } => {
                let result = self.progress(&referral_code).await;
                let _ = response.send(result);
            }
        }
    }
}

pub struct ReferralService;

impl ReferralService {
    pub fn new() -> Self {
        ReferralService {}
    }
}

#[async_trait]
impl Service<ReferralRequest, ReferralRequestHandler> for ReferralService {}
