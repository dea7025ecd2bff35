use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{claims::ClaimStatus, plans::Plan, requests::MembershipRequest};
use crate::errors::{ConflictKind, EngineError, PreconditionKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardType {
    Cashback,
    Gold,
}

impl RewardType {
    pub const ALL: [RewardType; 2] = [RewardType::Cashback, RewardType::Gold];

    pub fn as_str(&self) -> &'static str {
        match self {
            RewardType::Cashback => "cashback",
            RewardType::Gold => "gold",
        }
    }
}

impl fmt::Display for RewardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RewardType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cashback" => Ok(RewardType::Cashback),
            "gold" => Ok(RewardType::Gold),
            other => Err(EngineError::invalid(format!("unknown reward type {}", other))),
        }
    }
}

/// Persisted claim progress of one reward track.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimFlag {
    #[default]
    NotClaimed,
    PendingAdmin,
    InProgress,
    Claimed,
    Rejected,
}

impl ClaimFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimFlag::NotClaimed => "not_claimed",
            ClaimFlag::PendingAdmin => "pending_admin",
            ClaimFlag::InProgress => "in_progress",
            ClaimFlag::Claimed => "claimed",
            ClaimFlag::Rejected => "rejected",
        }
    }
}

impl FromStr for ClaimFlag {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_claimed" => Ok(ClaimFlag::NotClaimed),
            "pending_admin" => Ok(ClaimFlag::PendingAdmin),
            "in_progress" => Ok(ClaimFlag::InProgress),
            "claimed" => Ok(ClaimFlag::Claimed),
            "rejected" => Ok(ClaimFlag::Rejected),
            other => Err(EngineError::Internal(format!("unknown claim flag {}", other))),
        }
    }
}

/// Claim state of a reward track as seen by the member, derived from the
/// persisted flag and the referral counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    Disabled,
    Locked,
    Unclaimed,
    Submitted,
    Processing,
    Completed,
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    Active,
    Completed,
}

impl MembershipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipStatus::Active => "active",
            MembershipStatus::Completed => "completed",
        }
    }
}

impl FromStr for MembershipStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(MembershipStatus::Active),
            "completed" => Ok(MembershipStatus::Completed),
            other => Err(EngineError::Internal(format!("unknown membership status {}", other))),
        }
    }
}

/// The user who registered with a referral code.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReferredUser {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub mobile: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Referral {
    pub name: String,
    pub email: Option<String>,
    pub mobile: Option<String>,
    pub date: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Membership {
    pub referral_code: String,
    pub request_id: String,
    pub email: String,
    pub name: String,
    pub mobile: Option<String>,
    pub plan_id: String,
    pub cashback_goal: u32,
    pub gold_goal: u32,
    pub cashback_enabled: bool,
    pub gold_enabled: bool,
    pub referral_count: u32,
    pub referrals: Vec<Referral>,
    pub money_back_claimed: ClaimFlag,
    pub gold_coin_claimed: ClaimFlag,
    pub status: MembershipStatus,
    pub activated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TrackProgress {
    pub reward_type: RewardType,
    pub goal: u32,
    pub referral_count: u32,
    pub remaining: u32,
    pub state: ClaimState,
}

#[derive(Clone, Debug, Serialize)]
pub struct MembershipProgress {
    pub referral_code: String,
    pub status: MembershipStatus,
    pub tracks: Vec<TrackProgress>,
}

impl Membership {
    pub fn activate(
        request: &MembershipRequest,
        plan: &Plan,
        referral_code: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            referral_code,
            request_id: request.id.clone(),
            email: request.email.clone(),
            name: request.name.clone(),
            mobile: request.mobile.clone(),
            plan_id: plan.id.clone(),
            cashback_goal: plan.cashback_goal,
            gold_goal: plan.gold_goal,
            cashback_enabled: plan.cashback_enabled,
            gold_enabled: plan.gold_enabled,
            referral_count: 0,
            referrals: Vec::new(),
            money_back_claimed: ClaimFlag::NotClaimed,
            gold_coin_claimed: ClaimFlag::NotClaimed,
            status: MembershipStatus::Active,
            activated_at: now,
            completed_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == MembershipStatus::Active
    }

    pub fn goal(&self, reward: RewardType) -> u32 {
        match reward {
            RewardType::Cashback => self.cashback_goal,
            RewardType::Gold => self.gold_goal,
        }
    }

    pub fn is_enabled(&self, reward: RewardType) -> bool {
        match reward {
            RewardType::Cashback => self.cashback_enabled,
            RewardType::Gold => self.gold_enabled,
        }
    }

    pub fn flag(&self, reward: RewardType) -> ClaimFlag {
        match reward {
            RewardType::Cashback => self.money_back_claimed,
            RewardType::Gold => self.gold_coin_claimed,
        }
    }

    fn flag_mut(&mut self, reward: RewardType) -> &mut ClaimFlag {
        match reward {
            RewardType::Cashback => &mut self.money_back_claimed,
            RewardType::Gold => &mut self.gold_coin_claimed,
        }
    }

    pub fn goal_met(&self, reward: RewardType) -> bool {
        self.referral_count >= self.goal(reward)
    }

    pub fn claim_state(&self, reward: RewardType) -> ClaimState {
        if !self.is_enabled(reward) {
            return ClaimState::Disabled;
        }

        match self.flag(reward) {
            ClaimFlag::NotClaimed if self.goal_met(reward) => ClaimState::Unclaimed,
            ClaimFlag::NotClaimed => ClaimState::Locked,
            ClaimFlag::PendingAdmin => ClaimState::Submitted,
            ClaimFlag::InProgress => ClaimState::Processing,
            ClaimFlag::Claimed => ClaimState::Completed,
            ClaimFlag::Rejected => ClaimState::Rejected,
        }
    }

    /// True when every enabled track has been paid out.
    pub fn rewards_settled(&self) -> bool {
        RewardType::ALL
            .iter()
            .filter(|reward| self.is_enabled(**reward))
            .all(|reward| self.flag(*reward) == ClaimFlag::Claimed)
    }

    /// Counts one referral event. Goals reached here only unlock claiming.
    pub fn accrue_referral(
        &mut self,
        referred: &ReferredUser,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if !self.is_active() {
            return Err(EngineError::PreconditionFailed(PreconditionKind::InactiveCode(
                self.referral_code.clone(),
            )));
        }

        let email = referred
            .email
            .as_deref()
            .map(super::requests::normalize_email)
            .filter(|email| !email.is_empty());

        if let Some(email) = &email {
            if self.referrals.iter().any(|r| r.email.as_ref() == Some(email)) {
                return Err(EngineError::Conflict(ConflictKind::DuplicateReferral(
                    email.clone(),
                )));
            }
        }

        self.referrals.push(Referral {
            name: referred.name.trim().to_string(),
            email,
            mobile: referred.mobile.clone(),
            date: now,
        });
        self.referral_count += 1;

        Ok(())
    }

    /// Gate for filing a claim; on success the track moves to `PendingAdmin`.
    pub fn begin_claim(&mut self, reward: RewardType) -> Result<(), EngineError> {
        if !self.is_enabled(reward) {
            return Err(EngineError::PreconditionFailed(PreconditionKind::TrackDisabled(reward)));
        }

        match self.flag(reward) {
            ClaimFlag::Claimed => {
                return Err(EngineError::Conflict(ConflictKind::AlreadyClaimed(reward)))
            }
            ClaimFlag::PendingAdmin | ClaimFlag::InProgress => {
                return Err(EngineError::Conflict(ConflictKind::ClaimInFlight(reward)))
            }
            ClaimFlag::NotClaimed | ClaimFlag::Rejected => {}
        }

        if !self.goal_met(reward) {
            return Err(EngineError::PreconditionFailed(PreconditionKind::GoalNotMet {
                goal: self.goal(reward),
                count: self.referral_count,
            }));
        }

        *self.flag_mut(reward) = ClaimFlag::PendingAdmin;
        Ok(())
    }

    /// Mirrors an admin claim decision onto the track flag and settles the
    /// membership once every enabled reward is paid out.
    pub fn apply_claim_status(&mut self, reward: RewardType, status: ClaimStatus, now: DateTime<Utc>) {
        *self.flag_mut(reward) = status.flag();

        if status == ClaimStatus::Completed {
            self.refresh_completion(now);
        }
    }

    /// Returns true if this call moved the membership to `Completed`.
    pub fn refresh_completion(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_active() && self.rewards_settled() {
            self.status = MembershipStatus::Completed;
            self.completed_at = Some(now);
            return true;
        }

        false
    }

    pub fn progress(&self) -> MembershipProgress {
        let tracks = RewardType::ALL
            .iter()
            .map(|reward| TrackProgress {
                reward_type: *reward,
                goal: self.goal(*reward),
                referral_count: self.referral_count,
                remaining: self.goal(*reward).saturating_sub(self.referral_count),
                state: self.claim_state(*reward),
            })
            .collect();

        MembershipProgress {
            referral_code: self.referral_code.clone(),
            status: self.status,
            tracks,
        }
    }
}
