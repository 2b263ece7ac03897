/// Settings and configuration management
/// Handles environment variable loading and validation

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_DB_PATH: &str = "bullx_auto.db";
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_CYCLE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MISSED_GRACE_SECS: u64 = 120;
pub const DEFAULT_TASK_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_ORDER_AMOUNT: f64 = 1.0;

// ============================================================================
// Runtime Configuration (loaded from environment)
// ============================================================================

#[derive(Debug, Clone)]
pub struct Config {
    // Database persistence settings
    pub db_path: String,

    // Profiles to monitor, in declared order
    pub profiles: Vec<String>,

    /// Per-profile terminal API keys, from API_KEY_<NAME> env vars.
    /// Profiles without a key still run; they just never register a login.
    pub api_keys: HashMap<String, String>,

    /// Total investment per bracket deployment; also sizes replacement
    /// orders whose retired original carried no amount
    pub order_amount: f64,

    // Scheduling
    pub check_interval: Duration,
    pub cycle_timeout: Duration,
    pub missed_grace: Duration,
    pub task_retention_days: u32,

    // HTTP API settings
    pub api_enabled: bool,
    pub api_port: u16,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns errors with helpful messages if required configuration is
    /// missing or invalid.
    pub fn from_env() -> Result<Self> {
        // A missing .env is fine; plain environment variables also work
        let _ = dotenvy::dotenv();

        let db_path = env::var("DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());

        let profiles_raw = env::var("PROFILES").context(
            "PROFILES env var is required. Add it to your .env file.\n\
             Format: comma-separated profile names\n\
             Example: PROFILES=Saruman,Gandalf",
        )?;
        let profiles: Vec<String> = profiles_raw
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        if profiles.is_empty() {
            anyhow::bail!(
                "PROFILES is set but contains no profile names.\n\
                 Example: PROFILES=Saruman,Gandalf"
            );
        }

        let mut api_keys = HashMap::new();
        for profile in &profiles {
            let var = format!("API_KEY_{}", profile.to_uppercase());
            if let Ok(key) = env::var(&var) {
                let key = key.trim().to_string();
                if !key.is_empty() {
                    api_keys.insert(profile.clone(), key);
                }
            }
        }

        let order_amount = env_parse("ORDER_AMOUNT", DEFAULT_ORDER_AMOUNT)?;
        if order_amount <= 0.0 {
            anyhow::bail!("ORDER_AMOUNT must be positive, got {}", order_amount);
        }

        let check_interval =
            Duration::from_secs(env_parse("CHECK_INTERVAL_SECS", DEFAULT_CHECK_INTERVAL_SECS)?);
        let cycle_timeout =
            Duration::from_secs(env_parse("CYCLE_TIMEOUT_SECS", DEFAULT_CYCLE_TIMEOUT_SECS)?);
        let missed_grace =
            Duration::from_secs(env_parse("MISSED_GRACE_SECS", DEFAULT_MISSED_GRACE_SECS)?);
        if check_interval.is_zero() {
            anyhow::bail!("CHECK_INTERVAL_SECS must be at least 1");
        }

        let task_retention_days = env_parse("TASK_RETENTION_DAYS", DEFAULT_TASK_RETENTION_DAYS)?;

        let api_enabled = env_flag("API_ENABLED", false);
        let api_port = env_parse("API_PORT", 8080u16)?;

        Ok(Config {
            db_path,
            profiles,
            api_keys,
            order_amount,
            check_interval,
            cycle_timeout,
            missed_grace,
            task_retention_days,
            api_enabled,
            api_port,
        })
    }

    pub fn scheduler_config(&self) -> crate::scheduler::SchedulerConfig {
        crate::scheduler::SchedulerConfig {
            interval: self.check_interval,
            cycle_timeout: self.cycle_timeout,
            grace: self.missed_grace,
            retention_days: self.task_retention_days,
            fallback_amount: self.order_amount,
        }
    }

    pub fn api_config(&self) -> crate::api::ApiConfig {
        crate::api::ApiConfig {
            enabled: self.api_enabled,
            port: self.api_port,
        }
    }
}

/// Parse an optional env var, falling back to a default when unset.
fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} has an invalid value {:?}: {}", name, raw, e)),
        Err(_) => Ok(default),
    }
}

/// Boolean env flag: "true" or "1" (case-insensitive) means on.
fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: tests set process-wide env vars, so each uses distinct names via
    // the helpers rather than exercising from_env() end to end.

    #[test]
    fn env_parse_falls_back_to_default() {
        assert_eq!(
            env_parse("SETTINGS_TEST_UNSET_VAR", 42u64).unwrap(),
            42
        );
    }

    #[test]
    fn env_parse_rejects_garbage() {
        unsafe { env::set_var("SETTINGS_TEST_GARBAGE", "not-a-number") };
        assert!(env_parse::<u64>("SETTINGS_TEST_GARBAGE", 1).is_err());
        unsafe { env::remove_var("SETTINGS_TEST_GARBAGE") };
    }

    #[test]
    fn env_flag_accepts_true_and_one() {
        unsafe { env::set_var("SETTINGS_TEST_FLAG", "TRUE") };
        assert!(env_flag("SETTINGS_TEST_FLAG", false));
        unsafe { env::set_var("SETTINGS_TEST_FLAG", "1") };
        assert!(env_flag("SETTINGS_TEST_FLAG", false));
        unsafe { env::set_var("SETTINGS_TEST_FLAG", "no") };
        assert!(!env_flag("SETTINGS_TEST_FLAG", true));
        unsafe { env::remove_var("SETTINGS_TEST_FLAG") };
    }
}
