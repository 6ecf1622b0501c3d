//! Strata CLI Integration Test Suite
//!
//! This crate contains the end-to-end scenarios for the `strata` deployment
//! CLI. Each scenario is a thin script over the fixture API in
//! `integ-harness`: the harness allocates a collision-free stack-name
//! prefix, holds a cross-process pool slot, invokes the CLI, and tears
//! everything down when the body finishes, passes or fails.
//!
//! # Features
//!
//! - `smoke`: CLI-only scenarios (synth, ls, diff) — no control plane needed
//! - `deploy`: full deploy/verify/destroy scenarios against a live control plane
//! - `all`: enable all test categories
//!
//! # Prerequisites
//!
//! 1. The `strata` CLI on PATH (or `STRATA_CLI_BIN` pointing at it)
//! 2. `INTEG_APP_DIR` pointing at the deployable test app
//! 3. For `deploy`: a reachable control plane (`CONTROL_PLANE_URL`,
//!    optionally `CONTROL_PLANE_TOKEN`) and a shared pool directory
//!    (`INTEG_POOL_DIR`) visible to every concurrent test process
//!
//! The test app is expected to define these stacks (all named through
//! `STACK_NAME_PREFIX`):
//!
//! - `test-1`: one topic resource
//! - `test-2`: two topic resources
//! - `with-nested-stack-using-parameters`: nested stack, parameterized
//! - `approval-required`: contains security-sensitive changes that need
//!   interactive approval
//! - `define-network` / `import-network`: behavior toggled via
//!   `TEST_NETWORK_MODE` (`DEFINE` or `IMPORT`)
//!
//! # Usage
//!
//! ```bash
//! # From repo root - runs 0 scenarios (no default features)
//! cargo test
//!
//! # CLI-only smoke scenarios
//! cargo test -p integ-tests --features smoke
//!
//! # Full suite against a live control plane
//! cargo test -p integ-tests --features all
//! ```
//!
//! Scenario timeouts are ceilings, not estimates: with a capacity-1 pool a
//! scenario may wait out every other parallel test before it starts, so the
//! default budget is lock-wait time plus worst-case single-threaded runtime
//! (`INTEG_TEST_TIMEOUT_SECONDS`).

use integ_harness::config::HarnessConfig;

/// Load the harness configuration for a scenario, failing loudly with the
/// missing-variable name when the environment is incomplete.
pub fn harness_config() -> HarnessConfig {
    HarnessConfig::from_env()
        .expect("harness configuration incomplete - see the integ-tests crate docs for required env vars")
}
