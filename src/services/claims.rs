use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::oneshot;

use super::{RequestHandler, Service};
use crate::errors::{EngineError, Entity, PreconditionKind};
use crate::models::{
    claims::{ClaimStatus, NewClaimDetails, RewardClaim},
    memberships::{Membership, MembershipStatus, RewardType},
    requests::normalize_email,
};
use crate::repositories::Store;

pub enum ClaimRequest {
    Submit {
        email: String,
        reward_type: RewardType,
        details: NewClaimDetails,
        response: oneshot::Sender<Result<RewardClaim, EngineError>>,
    },
    UpdateStatus {
        id: String,
        status: ClaimStatus,
        note: Option<String>,
        response: oneshot::Sender<Result<(RewardClaim, Membership), EngineError>>,
    },
    Get {
        id: String,
        response: oneshot::Sender<Result<RewardClaim, EngineError>>,
    },
    List {
        status: Option<ClaimStatus>,
        response: oneshot::Sender<Result<Vec<RewardClaim>, EngineError>>,
    },
}

#[derive(Clone)]
pub struct ClaimRequestHandler {
    store: Arc<dyn Store>,
}

impl ClaimRequestHandler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        ClaimRequestHandler { store }
    }

    /// Files a claim against the member's active membership. The claim is
    /// stored and the track flag moves to `PendingAdmin` in one step.
    pub async fn submit_claim(
        &self,
        email: &str,
        reward_type: RewardType,
        details: NewClaimDetails,
    ) -> Result<RewardClaim, EngineError> {
        let email = normalize_email(email);
        let membership = self
            .store
            .find_active_membership(&email)
            .await?
            .ok_or_else(|| EngineError::not_found(Entity::Membership, email.clone()))?;
        let details = details.validate(reward_type)?;

        let claim = RewardClaim::new(reward_type, &membership, details, Utc::now());
        let gate = Box::new(move |membership: &mut Membership| -> Result<(), EngineError> {
            if !membership.is_active() {
                return Err(EngineError::PreconditionFailed(PreconditionKind::InactiveCode(
                    membership.referral_code.clone(),
                )));
            }
            membership.begin_claim(reward_type)
        });

        match self.store.insert_claim(claim, gate).await {
            Ok((_, claim)) => {
                log::info!(
                    "{} claim {} submitted by {}.",
                    claim.reward_type,
                    claim.id,
                    claim.email
                );
                Ok(claim)
            }
            Err(e) => {
                log::warn!("{} claim by {} rejected: {}", reward_type, email, e);
                Err(e)
            }
        }
    }

    /// Admin decision on a claim. The track flag follows the claim status and
    /// the membership completes once every enabled reward is paid out.
    pub async fn update_claim_status(
        &self,
        id: &str,
        status: ClaimStatus,
        note: Option<String>,
    ) -> Result<(RewardClaim, Membership), EngineError> {
        let now = Utc::now();
        let transition = Box::new(
            move |claim: &mut RewardClaim, membership: &mut Membership| -> Result<(), EngineError> {
                claim.transition(status, note, now)?;
                membership.apply_claim_status(claim.reward_type, status, now);
                Ok(())
            },
        );

        let (membership, claim) = self.store.update_claim(id, transition).await?;
        log::info!("Claim {} moved to {}.", claim.id, claim.status);
        if status == ClaimStatus::Completed && membership.status == MembershipStatus::Completed {
            log::info!(
                "Membership {} completed with {} referrals.",
                membership.referral_code,
                membership.referral_count
            );
        }

        Ok((claim, membership))
    }

    pub async fn get(&self, id: &str) -> Result<RewardClaim, EngineError> {
        self.store
            .get_claim(id)
            .await?
            .ok_or_else(|| EngineError::not_found(Entity::RewardClaim, id))
    }

    pub async fn list(&self, status: Option<ClaimStatus>) -> Result<Vec<RewardClaim>, EngineError> {
        self.store.list_claims(status).await
    }
}

#[async_trait]
impl RequestHandler<ClaimRequest> for ClaimRequestHandler {
    async fn handle_request(&self, request: ClaimRequest) {
        match request {
            ClaimRequest::Submit {
                email,
                reward_type,
                details,
                response,
            } => {
                let result = self.submit_claim(&email, reward_type, details).await;
                let _ = response.send(result);
            }
            ClaimRequest::UpdateStatus {
                id,
                status,
                note,
                response,
            } => {
                let result = self.update_claim_status(&id, status, note).await;
                let _ = response.send(result);
            }
            ClaimRequest::Get { id, response } => {
                let result = self.get(&id).await;
                let _ = response.send(result);
            }
            ClaimRequest::List { status, response } => {
                let result = self.list(status).await;
                let _ = response.send(result);
            }
        }
    }
}

pub struct ClaimService;

impl ClaimService {
    pub fn new() -> Self {
        ClaimService {}
    }
}

#[async_trait]
impl Service<ClaimRequest, ClaimRequestHandler> for ClaimService {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ConflictKind;
    use crate::models::memberships::{tests::membership, ClaimFlag, ReferredUser};
    use crate::repositories::{LocalStore, Replica};

    async fn handler_with_referrals(referrals: u32) -> (ClaimRequestHandler, Arc<LocalStore>) {
        let store = Arc::new(LocalStore::in_memory());
        let mut m = membership(2, 3);
        for i in 0..referrals {
            m.accrue_referral(
                &ReferredUser {
                    name: format!("Friend {}", i),
                    email: None,
                    mobile: None,
                },
                Utc::now(),
            )
            .unwrap();
        }
        store.mirror_membership(&m).await.unwrap();

        (ClaimRequestHandler::new(store.clone()), store)
    }

    fn gold_details() -> NewClaimDetails {
        NewClaimDetails {
            address: "12 MG Road, Pune".to_string(),
            postal_code: "411001".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn claim_below_goal_is_refused_without_side_effects() {
        let (handler, store) = handler_with_referrals(2).await;

        let err = handler
            .submit_claim("ravi@example.com", RewardType::Gold, gold_details())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::PreconditionFailed(PreconditionKind::GoalNotMet { goal: 3, count: 2 })
        ));
        assert!(store.list_claims(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_claim_while_pending_is_a_conflict() {
        let (handler, _) = handler_with_referrals(3).await;
        handler
            .submit_claim("ravi@example.com", RewardType::Gold, gold_details())
            .await
            .unwrap();

        let err = handler
            .submit_claim("ravi@example.com", RewardType::Gold, gold_details())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::Conflict(ConflictKind::ClaimInFlight(RewardType::Gold))
        ));
    }

    #[tokio::test]
    async fn rejected_reward_can_be_claimed_again() {
        let (handler, _) = handler_with_referrals(3).await;
        let claim = handler
            .submit_claim("ravi@example.com", RewardType::Gold, gold_details())
            .await
            .unwrap();

        let (claim, membership) = handler
            .update_claim_status(&claim.id, ClaimStatus::Rejected, Some("blurry proof".to_string()))
            .await
            .unwrap();
        assert_eq!(membership.gold_coin_claimed, ClaimFlag::Rejected);
        assert_eq!(claim.admin_note.as_deref(), Some("blurry proof"));

        let err = handler
            .update_claim_status(&claim.id, ClaimStatus::Completed, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Conflict(ConflictKind::ClaimFinalized(_))
        ));

        let retry = handler
            .submit_claim("ravi@example.com", RewardType::Gold, gold_details())
            .await
            .unwrap();
        assert_eq!(retry.status, ClaimStatus::Pending);
    }

    #[tokio::test]
    async fn unknown_member_cannot_claim() {
        let (handler, _) = handler_with_referrals(3).await;

        let err = handler
            .submit_claim("nobody@example.com", RewardType::Gold, gold_details())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::NotFound { .. }));
    }
}
