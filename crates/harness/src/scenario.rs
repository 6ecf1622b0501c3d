//! Scenario registration and execution.
//!
//! A [`Scenario`] binds a name and a per-test ceiling to a fixture-backed
//! test body. The ceiling defaults to the configured whole-test budget,
//! which accommodates the worst case of fully serialized lock acquisition
//! across all parallel tests sharing one pool — not just the expected
//! runtime of this scenario.

use crate::config::HarnessConfig;
use crate::fixture::{run_with_fixture, FixtureError, StackFixture};
use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;
use tracing::{info, warn};

static INIT_LOGGING: Once = Once::new();

/// Initialize tracing for test binaries. Idempotent; respects `RUST_LOG`.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A named test case with a per-test timeout, bound to a fixture at run
/// time.
#[derive(Debug)]
pub struct Scenario {
    name: String,
    timeout: Option<Duration>,
}

impl Scenario {
    /// Creates a new scenario.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: None,
        }
    }

    /// Overrides the whole-test ceiling for this scenario.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The scenario name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the scenario body against a fresh fixture.
    ///
    /// Setup, body, and teardown follow [`run_with_fixture`] semantics:
    /// teardown runs on every exit path, and a body panic re-raises only
    /// after teardown completes.
    pub async fn run<F, Fut, T>(self, config: HarnessConfig, body: F) -> Result<T, FixtureError>
    where
        F: FnOnce(Arc<StackFixture>) -> Fut,
        Fut: Future<Output = Result<T, FixtureError>> + Send + 'static,
        T: Send + 'static,
    {
        init_test_logging();

        let budget = self.timeout.unwrap_or_else(|| config.test_timeout());
        let base = identity_base(&self.name);
        info!(scenario = %self.name, ?budget, "starting scenario");

        let result = run_with_fixture(&base, config, Some(budget), body).await;

        match &result {
            Ok(_) => info!(scenario = %self.name, "scenario passed"),
            Err(err) => warn!(scenario = %self.name, error = %err, "scenario failed"),
        }

        result
    }
}

/// Scenario names are prose ("deploy all"); identity bases feed stack names,
/// so squash them to lowercase alphanumerics and dashes.
fn identity_base(name: &str) -> String {
    let squashed: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    squashed.trim_matches('-').to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_creation() {
        let scenario = Scenario::new("deploy all").with_timeout(Duration::from_secs(60));

        assert_eq!(scenario.name(), "deploy all");
        assert_eq!(scenario.timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_default_timeout_comes_from_config() {
        let scenario = Scenario::new("synth");
        assert!(scenario.timeout.is_none());
    }

    #[test]
    fn test_identity_base_squashes_prose_names() {
        assert_eq!(identity_base("deploy all"), "deploy-all");
        assert_eq!(identity_base("VPC Lookup!"), "vpc-lookup");
        assert_eq!(identity_base("--edge--"), "edge");
    }
}
