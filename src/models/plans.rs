use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, PreconditionKind};

/// A purchasable membership plan and the referral goals it unlocks rewards at.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub price_in_cents: i64,
    pub cashback_goal: u32,
    pub gold_goal: u32,
    #[serde(default = "enabled")]
    pub cashback_enabled: bool,
    #[serde(default = "enabled")]
    pub gold_enabled: bool,
    #[serde(default)]
    pub cashback_amount_in_cents: i64,
    #[serde(default)]
    pub gold_coin_grams: f64,
}

fn enabled() -> bool {
    true
}

/// Immutable snapshot of the plan definitions the engine was configured with.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PlanCatalog {
    plans: Vec<Plan>,
}

impl PlanCatalog {
    pub fn new(plans: Vec<Plan>) -> Result<Self, EngineError> {
        let mut seen = HashSet::new();
        for plan in &plans {
            if plan.id.trim().is_empty() {
                return Err(EngineError::invalid("plan id must not be blank"));
            }
            if !seen.insert(plan.id.as_str()) {
                return Err(EngineError::invalid(format!("duplicate plan id {}", plan.id)));
            }
            if plan.cashback_goal < 1 || plan.gold_goal < 1 {
                return Err(EngineError::invalid(format!(
                    "plan {} must have referral goals of at least 1",
                    plan.id
                )));
            }
            if !plan.cashback_enabled && !plan.gold_enabled {
                return Err(EngineError::invalid(format!(
                    "plan {} must enable at least one reward",
                    plan.id
                )));
            }
        }

        Ok(Self { plans })
    }

    pub fn get(&self, plan_id: &str) -> Result<&Plan, EngineError> {
        self.plans
            .iter()
            .find(|plan| plan.id == plan_id)
            .ok_or_else(|| {
                EngineError::PreconditionFailed(PreconditionKind::UnknownPlan(plan_id.to_string()))
            })
    }

    pub fn plans(&self) -> &[Plan] {
        &self.plans
    }
}
