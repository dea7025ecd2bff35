use std::fmt;

use serde::Serialize;

use crate::models::memberships::RewardType;

/// Entities addressable by the engine, used to label `NotFound` errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Entity {
    Membership,
    MembershipRequest,
    RewardClaim,
    Order,
    Plan,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Entity::Membership => "Membership",
            Entity::MembershipRequest => "Membership request",
            Entity::RewardClaim => "Reward claim",
            Entity::Order => "Order",
            Entity::Plan => "Plan",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConflictKind {
    #[error("a pending membership request already exists for {0}")]
    DuplicatePendingRequest(String),
    #[error("membership request {0} was already decided")]
    AlreadyDecided(String),
    #[error("{0} reward was already claimed")]
    AlreadyClaimed(RewardType),
    #[error("a {0} claim is already awaiting review")]
    ClaimInFlight(RewardType),
    #[error("claim {0} is final and can no longer change")]
    ClaimFinalized(String),
    #[error("{0} already owns an active membership")]
    ActiveMembershipExists(String),
    #[error("referral for {0} was already counted")]
    DuplicateReferral(String),
    #[error("referral code {0} is taken")]
    CodeTaken(String),
    #[error("order id {0} is taken")]
    DuplicateOrderId(String),
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PreconditionKind {
    #[error("referral goal not met ({count}/{goal})")]
    GoalNotMet { goal: u32, count: u32 },
    #[error("{0} reward is disabled for this plan")]
    TrackDisabled(RewardType),
    #[error("unknown referral code {0}")]
    UnknownCode(String),
    #[error("referral code {0} is no longer active")]
    InactiveCode(String),
    #[error("unknown plan {0}")]
    UnknownPlan(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: Entity, id: String },
    #[error("Conflict: {0}")]
    Conflict(ConflictKind),
    #[error("Precondition failed: {0}")]
    PreconditionFailed(PreconditionKind),
    #[error("Identifier generation exhausted after {0} attempts")]
    Exhausted(u32),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Flat classification of [`EngineError`] for callers that only branch on the category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    PreconditionFailed,
    Exhausted,
    InvalidInput,
    StorageUnavailable,
    Internal,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::PreconditionFailed => "precondition_failed",
            ErrorKind::Exhausted => "exhausted",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::StorageUnavailable => "storage_unavailable",
            ErrorKind::Internal => "internal",
        }
    }
}

impl EngineError {
    pub fn not_found(entity: Entity, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        EngineError::InvalidInput(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            EngineError::Exhausted(_) => ErrorKind::Exhausted,
            EngineError::InvalidInput(_) => ErrorKind::InvalidInput,
            EngineError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Domain rejections are expected outcomes of a valid call; the rest are faults.
    pub fn is_domain(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NotFound
                | ErrorKind::Conflict
                | ErrorKind::PreconditionFailed
                | ErrorKind::InvalidInput
        )
    }

    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, EngineError::StorageUnavailable(_))
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => EngineError::StorageUnavailable(e.to_string()),
            other => EngineError::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Internal(format!("Serialization failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_domain_and_fault_errors() {
        let conflict = EngineError::Conflict(ConflictKind::AlreadyDecided("r1".to_string()));
        assert_eq!(conflict.kind(), ErrorKind::Conflict);
        assert!(conflict.is_domain());

        let down = EngineError::StorageUnavailable("connection refused".to_string());
        assert!(!down.is_domain());
        assert!(down.is_storage_unavailable());
        assert!(!EngineError::Exhausted(8).is_domain());
    }

    #[test]
    fn pool_timeouts_are_storage_unavailable() {
        let err: EngineError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_storage_unavailable());

        let err: EngineError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn renders_messages() {
        let err = EngineError::PreconditionFailed(PreconditionKind::GoalNotMet { goal: 5, count: 3 });
        assert_eq!(err.to_string(), "Precondition failed: referral goal not met (3/5)");

        let err = EngineError::not_found(Entity::Order, "ORD-1");
        assert_eq!(err.to_string(), "Order not found: ORD-1");
    }
}
