use async_trait::async_trait;
use serde::Serialize;

use crate::errors::EngineError;
use crate::models::{
    claims::{ClaimStatus, RewardClaim},
    memberships::Membership,
    orders::Order,
    requests::{MembershipRequest, RequestStatus},
};

pub mod local;
pub mod mirrored;
pub mod postgres;

pub use local::LocalStore;
pub use mirrored::MirroredStore;
pub use postgres::PgStore;

/// Change applied to one membership while its record is locked.
pub type MembershipMutation = Box<dyn FnOnce(&mut Membership) -> Result<(), EngineError> + Send>;
/// Change applied to one order while its record is locked.
pub type OrderMutation = Box<dyn FnOnce(&mut Order) -> Result<(), EngineError> + Send>;
/// Change applied to a claim and the membership it was filed against, both locked.
pub type ClaimTransition =
    Box<dyn FnOnce(&mut RewardClaim, &mut Membership) -> Result<(), EngineError> + Send>;

/// Whether data returned by a store can be trusted for correctness-critical decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Authority {
    Primary,
    Fallback,
}

impl Authority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Authority::Primary => "primary",
            Authority::Fallback => "fallback",
        }
    }
}

/// Record store for every engine entity.
///
/// Every mutating method is atomic with respect to concurrent calls touching
/// the same record: mutations run against a locked copy and are only written
/// back when they return `Ok`. A failed mutation leaves the record untouched.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn ping(&self) -> Result<(), EngineError>;

    fn authority(&self) -> Authority;

    /// Inserts a pending request; `Conflict` if the email already has one pending.
    async fn insert_request(
        &self,
        request: MembershipRequest,
    ) -> Result<MembershipRequest, EngineError>;

    async fn get_request(&self, id: &str) -> Result<Option<MembershipRequest>, EngineError>;

    async fn list_requests(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<MembershipRequest>, EngineError>;

    /// Moves a pending request to `Rejected`.
    async fn reject_request(
        &self,
        id: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<MembershipRequest, EngineError>;

    /// Marks the request approved and inserts the membership in one step.
    /// Fails without side effects if the request is not pending, the email
    /// already owns an active membership, or the code is taken.
    async fn activate_membership(
        &self,
        request_id: &str,
        membership: Membership,
    ) -> Result<Membership, EngineError>;

    async fn referral_code_exists(&self, code: &str) -> Result<bool, EngineError>;

    async fn get_membership(&self, code: &str) -> Result<Option<Membership>, EngineError>;

    async fn find_active_membership(&self, email: &str)
        -> Result<Option<Membership>, EngineError>;

    /// Every membership ever owned by the email, newest first.
    async fn memberships_for_email(&self, email: &str) -> Result<Vec<Membership>, EngineError>;

    async fn list_memberships(&self) -> Result<Vec<Membership>, EngineError>;

    async fn update_membership(
        &self,
        code: &str,
        mutation: MembershipMutation,
    ) -> Result<Membership, EngineError>;

    /// Runs `gate` on the claimant's membership and stores the claim only if it passes.
    async fn insert_claim(
        &self,
        claim: RewardClaim,
        gate: MembershipMutation,
    ) -> Result<(Membership, RewardClaim), EngineError>;

    async fn get_claim(&self, id: &str) -> Result<Option<RewardClaim>, EngineError>;

    async fn list_claims(&self, status: Option<ClaimStatus>)
        -> Result<Vec<RewardClaim>, EngineError>;

    async fn update_claim(
        &self,
        id: &str,
        transition: ClaimTransition,
    ) -> Result<(Membership, RewardClaim), EngineError>;

    /// `Conflict` if the order id is already used.
    async fn insert_order(&self, order: Order) -> Result<Order, EngineError>;

    async fn get_order(&self, id: &str) -> Result<Option<Order>, EngineError>;

    async fn list_orders(&self, email: Option<&str>) -> Result<Vec<Order>, EngineError>;

    async fn update_order(&self, id: &str, mutation: OrderMutation) -> Result<Order, EngineError>;
}

/// A store that can accept verbatim copies of records written elsewhere.
#[async_trait]
pub trait Replica: Store {
    async fn mirror_request(&self, request: &MembershipRequest) -> Result<(), EngineError>;

    async fn mirror_membership(&self, membership: &Membership) -> Result<(), EngineError>;

    async fn mirror_claim(&self, claim: &RewardClaim) -> Result<(), EngineError>;

    async fn mirror_order(&self, order: &Order) -> Result<(), EngineError>;
}
