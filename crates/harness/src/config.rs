//! Harness configuration.
//!
//! Configuration is loaded from environment variables. The control-plane
//! token is redacted in Debug output.

use crate::pool::MAX_POOL_CAPACITY;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default name of the CLI under test, resolved via PATH.
pub const DEFAULT_CLI_BIN: &str = "strata";

/// Default control-plane endpoint for verification calls.
pub const DEFAULT_CONTROL_PLANE_URL: &str = "http://localhost:8443";

/// Default pool key (account/region slot set) contended by parallel runs.
pub const DEFAULT_POOL_KEY: &str = "default/us-east-1";

/// Default pool capacity. One slot fully serializes all parallel tests.
pub const DEFAULT_POOL_CAPACITY: usize = 1;

/// Default lock-acquisition wait budget in seconds.
pub const DEFAULT_LOCK_TIMEOUT_SECONDS: u64 = 1800;

/// Default lease lifetime in seconds before a crashed holder's slot becomes
/// reclaimable.
pub const DEFAULT_LEASE_SECONDS: u64 = 7200;

/// Default wall-clock limit for a single CLI invocation, in seconds.
pub const DEFAULT_CLI_TIMEOUT_SECONDS: u64 = 3600;

/// Default per-test ceiling in seconds. This is lock-wait time plus
/// worst-case single-threaded execution time, not the expected runtime: with
/// a capacity-1 pool every parallel test may have to wait out all the
/// others before it even starts.
pub const DEFAULT_TEST_TIMEOUT_SECONDS: u64 = 7200;

/// Harness configuration, shared by every fixture in a test process.
#[derive(Clone)]
pub struct HarnessConfig {
    /// The deployment CLI under test.
    pub cli_binary: PathBuf,

    /// Directory containing the deployable test app the CLI operates on.
    pub app_dir: PathBuf,

    /// Control-plane endpoint for backend verification.
    pub control_plane_url: String,

    /// Bearer token for the control plane, if it requires one.
    pub api_token: Option<String>,

    /// Root directory of the shared lock pools.
    pub pool_dir: PathBuf,

    /// Pool key naming the account/region slot set this run contends for.
    pub pool_key: String,

    /// Slot count of the pool.
    pub pool_capacity: usize,

    /// Lock-acquisition wait budget in seconds.
    pub lock_timeout_seconds: u64,

    /// Lease lifetime in seconds (stale-lock recovery horizon).
    pub lease_seconds: u64,

    /// Wall-clock limit for a single CLI invocation, in seconds.
    pub cli_timeout_seconds: u64,

    /// Whole-test ceiling in seconds (see [`DEFAULT_TEST_TIMEOUT_SECONDS`]).
    pub test_timeout_seconds: u64,
}

/// Custom Debug implementation that redacts the control-plane token.
impl fmt::Debug for HarnessConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarnessConfig")
            .field("cli_binary", &self.cli_binary)
            .field("app_dir", &self.app_dir)
            .field("control_plane_url", &self.control_plane_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field("pool_dir", &self.pool_dir)
            .field("pool_key", &self.pool_key)
            .field("pool_capacity", &self.pool_capacity)
            .field("lock_timeout_seconds", &self.lock_timeout_seconds)
            .field("lease_seconds", &self.lease_seconds)
            .field("cli_timeout_seconds", &self.cli_timeout_seconds)
            .field("test_timeout_seconds", &self.test_timeout_seconds)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid pool capacity configuration: {0}")]
    InvalidPoolCapacity(String),

    #[error("Invalid timeout configuration: {0}")]
    InvalidTimeout(String),
}

impl HarnessConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let cli_binary = vars
            .get("STRATA_CLI_BIN")
            .cloned()
            .unwrap_or_else(|| DEFAULT_CLI_BIN.to_string())
            .into();

        let app_dir: PathBuf = vars
            .get("INTEG_APP_DIR")
            .ok_or_else(|| ConfigError::MissingEnvVar("INTEG_APP_DIR".to_string()))?
            .clone()
            .into();

        let control_plane_url = vars
            .get("CONTROL_PLANE_URL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_CONTROL_PLANE_URL.to_string());

        let api_token = vars.get("CONTROL_PLANE_TOKEN").cloned();

        let pool_dir = vars
            .get("INTEG_POOL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| env::temp_dir().join("strata-integ-pool"));

        let pool_key = vars
            .get("INTEG_POOL_KEY")
            .cloned()
            .unwrap_or_else(|| DEFAULT_POOL_KEY.to_string());

        let pool_capacity = if let Some(value_str) = vars.get("INTEG_POOL_CAPACITY") {
            let value: usize = value_str.parse().map_err(|e| {
                ConfigError::InvalidPoolCapacity(format!(
                    "INTEG_POOL_CAPACITY must be a valid positive integer, got '{}': {}",
                    value_str, e
                ))
            })?;

            if value == 0 || value > MAX_POOL_CAPACITY {
                return Err(ConfigError::InvalidPoolCapacity(format!(
                    "INTEG_POOL_CAPACITY must be between 1 and {}, got {}",
                    MAX_POOL_CAPACITY, value
                )));
            }

            value
        } else {
            DEFAULT_POOL_CAPACITY
        };

        let lock_timeout_seconds = positive_seconds(
            vars,
            "INTEG_LOCK_TIMEOUT_SECONDS",
            DEFAULT_LOCK_TIMEOUT_SECONDS,
        )?;
        let lease_seconds = positive_seconds(vars, "INTEG_LEASE_SECONDS", DEFAULT_LEASE_SECONDS)?;
        let cli_timeout_seconds = positive_seconds(
            vars,
            "INTEG_CLI_TIMEOUT_SECONDS",
            DEFAULT_CLI_TIMEOUT_SECONDS,
        )?;
        let test_timeout_seconds = positive_seconds(
            vars,
            "INTEG_TEST_TIMEOUT_SECONDS",
            DEFAULT_TEST_TIMEOUT_SECONDS,
        )?;

        Ok(HarnessConfig {
            cli_binary,
            app_dir,
            control_plane_url,
            api_token,
            pool_dir,
            pool_key,
            pool_capacity,
            lock_timeout_seconds,
            lease_seconds,
            cli_timeout_seconds,
            test_timeout_seconds,
        })
    }

    /// Lock-acquisition wait budget.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_seconds)
    }

    /// Lease lifetime for pool slots.
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }

    /// Wall-clock limit for a single CLI invocation.
    pub fn cli_timeout(&self) -> Duration {
        Duration::from_secs(self.cli_timeout_seconds)
    }

    /// Whole-test ceiling.
    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_seconds)
    }
}

fn positive_seconds(
    vars: &HashMap<String, String>,
    key: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    let Some(value_str) = vars.get(key) else {
        return Ok(default);
    };

    let value: u64 = value_str.parse().map_err(|e| {
        ConfigError::InvalidTimeout(format!(
            "{} must be a valid positive integer, got '{}': {}",
            key, value_str, e
        ))
    })?;

    if value == 0 {
        return Err(ConfigError::InvalidTimeout(format!(
            "{} must be greater than 0",
            key
        )));
    }

    Ok(value)
}
