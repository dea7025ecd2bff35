use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::EngineError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "approved" => Ok(RequestStatus::Approved),
            "rejected" => Ok(RequestStatus::Rejected),
            other => Err(EngineError::invalid(format!("unknown request status {}", other))),
        }
    }
}

/// Identity fields supplied by the identity provider; trusted as given.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Identity {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub mobile: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewMembershipRequest {
    #[serde(flatten)]
    pub identity: Identity,
    pub plan_id: String,
    pub screenshot_url: String,
    /// Code of the member who invited this requester.
    #[serde(default)]
    pub referral_code: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MembershipRequest {
    pub id: String,
    pub name: String,
    pub email: String,
    pub mobile: Option<String>,
    pub plan_id: String,
    pub referral_code: Option<String>,
    pub screenshot_url: String,
    pub status: RequestStatus,
    pub submitted_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// Canonical form used for every email comparison.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl MembershipRequest {
    pub fn submit(new: NewMembershipRequest, now: DateTime<Utc>) -> Result<Self, EngineError> {
        let name = new.identity.name.trim().to_string();
        let email = normalize_email(&new.identity.email);
        let screenshot_url = new.screenshot_url.trim().to_string();

        if name.is_empty() {
            return Err(EngineError::invalid("name is required"));
        }
        if email.is_empty() || !email.contains('@') {
            return Err(EngineError::invalid("a valid email is required"));
        }
        if screenshot_url.is_empty() {
            return Err(EngineError::invalid("payment screenshot is required"));
        }

        Ok(Self {
            id: Uuid::new_v4().hyphenated().to_string(),
            name,
            email,
            mobile: non_blank(new.identity.mobile),
            plan_id: new.plan_id.trim().to_string(),
            referral_code: non_blank(new.referral_code).map(|code| code.to_uppercase()),
            screenshot_url,
            status: RequestStatus::Pending,
            submitted_at: now,
            decided_at: None,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending
    }
}
