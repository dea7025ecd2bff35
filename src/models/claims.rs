use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::memberships::{ClaimFlag, Membership, RewardType};
use crate::errors::{ConflictKind, EngineError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Pending,
    InProgress,
    Completed,
    Rejected,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::Pending => "pending",
            ClaimStatus::InProgress => "in_progress",
            ClaimStatus::Completed => "completed",
            ClaimStatus::Rejected => "rejected",
        }
    }

    /// Membership track flag that mirrors this claim status.
    pub fn flag(&self) -> ClaimFlag {
        match self {
            ClaimStatus::Pending => ClaimFlag::PendingAdmin,
            ClaimStatus::InProgress => ClaimFlag::InProgress,
            ClaimStatus::Completed => ClaimFlag::Claimed,
            ClaimStatus::Rejected => ClaimFlag::Rejected,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, ClaimStatus::Completed | ClaimStatus::Rejected)
    }
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClaimStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ClaimStatus::Pending),
            "in_progress" => Ok(ClaimStatus::InProgress),
            "completed" => Ok(ClaimStatus::Completed),
            "rejected" => Ok(ClaimStatus::Rejected),
            other => Err(EngineError::invalid(format!("unknown claim status {}", other))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum PayoutMethod {
    Upi {
        upi_id: String,
    },
    BankTransfer {
        account_holder: String,
        account_number: String,
        ifsc_code: String,
        bank_name: String,
    },
}

/// Validated claim details.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ClaimDetails {
    pub address: String,
    pub postal_code: String,
    pub payout: Option<PayoutMethod>,
}

/// Claim details as submitted by the member, before validation.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NewClaimDetails {
    pub address: String,
    pub postal_code: String,
    #[serde(default)]
    pub upi_id: Option<String>,
    #[serde(default)]
    pub account_holder: Option<String>,
    #[serde(default)]
    pub account_number: Option<String>,
    #[serde(default)]
    pub ifsc_code: Option<String>,
    #[serde(default)]
    pub bank_name: Option<String>,
}

fn filled(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl NewClaimDetails {
    pub fn validate(&self, reward: RewardType) -> Result<ClaimDetails, EngineError> {
        let address = self.address.trim().to_string();
        let postal_code = self.postal_code.trim().to_string();
        if address.is_empty() || postal_code.is_empty() {
            return Err(EngineError::invalid("address and postal code are required"));
        }

        let payout = match reward {
            RewardType::Gold => None,
            RewardType::Cashback => Some(self.payout_method()?),
        };

        Ok(ClaimDetails {
            address,
            postal_code,
            payout,
        })
    }

    /// Exactly one of a UPI id or a complete set of bank details.
    fn payout_method(&self) -> Result<PayoutMethod, EngineError> {
        let upi_id = filled(&self.upi_id);
        let bank = [
            filled(&self.account_holder),
            filled(&self.account_number),
            filled(&self.ifsc_code),
            filled(&self.bank_name),
        ];
        let bank_fields = bank.iter().filter(|field| field.is_some()).count();

        match (upi_id, bank_fields) {
            (Some(upi_id), 0) => Ok(PayoutMethod::Upi { upi_id }),
            (None, 4) => {
                let [holder, number, ifsc, bank_name] = bank;
                Ok(PayoutMethod::BankTransfer {
                    account_holder: holder.unwrap_or_default(),
                    account_number: number.unwrap_or_default(),
                    ifsc_code: ifsc.unwrap_or_default().to_uppercase(),
                    bank_name: bank_name.unwrap_or_default(),
                })
            }
            (Some(_), _) => Err(EngineError::invalid(
                "provide either a UPI id or bank details, not both",
            )),
            (None, 0) => Err(EngineError::invalid(
                "cashback claims need a UPI id or bank details",
            )),
            (None, _) => Err(EngineError::invalid("bank details are incomplete")),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RewardClaim {
    pub id: String,
    pub reward_type: RewardType,
    pub email: String,
    pub referral_code: String,
    pub details: ClaimDetails,
    pub status: ClaimStatus,
    pub admin_note: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RewardClaim {
    pub fn new(
        reward_type: RewardType,
        membership: &Membership,
        details: ClaimDetails,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().hyphenated().to_string(),
            reward_type,
            email: membership.email.clone(),
            referral_code: membership.referral_code.clone(),
            details,
            status: ClaimStatus::Pending,
            admin_note: None,
            submitted_at: now,
            updated_at: now,
        }
    }

    pub fn transition(
        &mut self,
        status: ClaimStatus,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if self.status.is_final() {
            return Err(EngineError::Conflict(ConflictKind::ClaimFinalized(self.id.clone())));
        }

        self.status = status;
        if note.is_some() {
            self.admin_note = note;
        }
        self.updated_at = crate::utils::advance(self.updated_at, now);

        Ok(())
    }
}
