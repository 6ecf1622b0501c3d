//! Integration-test harness for the `strata` deployment CLI.
//!
//! This crate is the execution core shared by every integration scenario:
//! it provisions disposable test stacks against a real control plane,
//! invokes the CLI under test as a supervised subprocess, and guarantees
//! cleanup no matter how the test body ends.
//!
//! # Components
//!
//! - [`identity`]: collision-free stack-name prefixes for parallel runs
//!   sharing one account/region.
//! - [`pool`]: cross-process resource locking over a shared lock directory,
//!   with lease expiry for crash recovery.
//! - [`process`]: supervised CLI invocation with captured output, additive
//!   environment overrides, and process-group timeouts.
//! - [`fixture`]: the per-test lifecycle — lock, identity, deploy/destroy/
//!   synth/diff/list verbs, and unconditional teardown.
//! - [`cloud`]: uncached control-plane queries for verifying actually
//!   provisioned state.
//! - [`scenario`]: named test cases with per-test ceilings.
//! - [`eventual`]: retry helpers for verification that lags a successful
//!   deploy.
//! - [`config`]: env-driven configuration shared by all of the above.
//!
//! # Usage
//!
//! ```rust,ignore
//! use integ_harness::config::HarnessConfig;
//! use integ_harness::scenario::Scenario;
//!
//! #[tokio::test]
//! async fn test_deploy() {
//!     let config = HarnessConfig::from_env().expect("harness env");
//!     Scenario::new("deploy")
//!         .run(config, |fixture| async move {
//!             let ids = fixture.deploy("test-2").await?;
//!             assert_eq!(ids.len(), 1);
//!             Ok(())
//!         })
//!         .await
//!         .expect("scenario should pass");
//! }
//! ```
//!
//! Scenarios run as independent OS processes, potentially many in parallel
//! against one backend account pool. The pool is the only cross-process
//! shared mutable state; everything else a fixture owns is exclusive to it.

pub mod cloud;
pub mod config;
pub mod eventual;
pub mod fixture;
pub mod identity;
pub mod pool;
pub mod process;
pub mod scenario;
