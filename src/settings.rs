use std::{path::PathBuf, sync::Arc, time::Duration};

use config::{Config, ConfigError, Environment, File};
use directories::ProjectDirs;
use serde::Deserialize;

use crate::models::{
    orders::ShippingPolicy,
    plans::{Plan, PlanCatalog},
};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Invalid settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
pub struct Postgres {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Deserialize)]
pub struct Server {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for Server {
    fn default() -> Self {
        Server {
            listen: default_listen(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Fallback {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_recheck_seconds")]
    pub recheck_seconds: u64,
}

impl Default for Fallback {
    fn default() -> Self {
        Fallback {
            enabled: false,
            directory: None,
            recheck_seconds: default_recheck_seconds(),
        }
    }
}

impl Fallback {
    /// Snapshot file of the local cache; defaults to the platform data dir.
    pub fn snapshot_path(&self) -> Result<PathBuf, SettingsError> {
        let directory = match &self.directory {
            Some(directory) => directory.clone(),
            None => ProjectDirs::from("com", "storefront", "rewards")
                .map(|dirs| dirs.data_dir().to_path_buf())
                .ok_or_else(|| {
                    SettingsError::Invalid("no data directory for the local fallback".to_string())
                })?,
        };

        Ok(directory.join("snapshot.json"))
    }

    pub fn recheck_interval(&self) -> Duration {
        Duration::from_secs(self.recheck_seconds)
    }
}

#[derive(Debug, Deserialize)]
pub struct ReferralCodes {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReferralCodes {
    fn default() -> Self {
        ReferralCodes {
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_recheck_seconds() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    8
}

fn default_shipping() -> ShippingPolicy {
    ShippingPolicy {
        flat_charge_in_cents: 99_00,
        free_shipping_threshold_in_cents: 2000_00,
    }
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    postgres: Postgres,
    #[serde(default)]
    server: Server,
    #[serde(default)]
    fallback: Fallback,
    #[serde(default = "default_shipping")]
    shipping: ShippingPolicy,
    #[serde(default)]
    referral_codes: ReferralCodes,
    plans: Vec<Plan>,
}

#[derive(Debug)]
pub struct Settings {
    pub postgres: Postgres,
    pub server: Server,
    pub fallback: Fallback,
    pub shipping: ShippingPolicy,
    pub referral_codes: ReferralCodes,
    pub catalog: Arc<PlanCatalog>,
}

impl Settings {
    /// Loads `path`, then applies `STOREFRONT__SECTION__KEY` environment overrides.
    pub fn load(path: &str) -> Result<Self, SettingsError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("STOREFRONT").separator("__"))
            .build()?;

        Self::from_raw(config.try_deserialize()?)
    }

    fn from_raw(raw: RawSettings) -> Result<Self, SettingsError> {
        if raw.plans.is_empty() {
            return Err(SettingsError::Invalid("at least one plan is required".to_string()));
        }
        if raw.shipping.flat_charge_in_cents < 0 || raw.shipping.free_shipping_threshold_in_cents < 0 {
            return Err(SettingsError::Invalid("shipping amounts must not be negative".to_string()));
        }
        if raw.referral_codes.max_attempts == 0 {
            return Err(SettingsError::Invalid(
                "referral_codes.max_attempts must be at least 1".to_string(),
            ));
        }

        let catalog = PlanCatalog::new(raw.plans)
            .map_err(|e| SettingsError::Invalid(e.to_string()))?;

        Ok(Settings {
            postgres: raw.postgres,
            server: raw.server,
            fallback: raw.fallback,
            shipping: raw.shipping,
            referral_codes: raw.referral_codes,
            catalog: Arc::new(catalog),
        })
    }
}
