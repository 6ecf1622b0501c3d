//! Deploy Tests: Expected Failures
//!
//! Negative scenarios: the CLI is supposed to refuse, and the control plane
//! is supposed to show that nothing was created.

#![cfg(feature = "deploy")]

use integ_harness::cloud::CloudError;
use integ_harness::fixture::{CommandOptions, FixtureError};
use integ_harness::scenario::Scenario;
use integ_tests::harness_config;
use serial_test::serial;

#[tokio::test]
#[serial]
async fn test_security_changes_require_interactive_approval() {
    Scenario::new("approval required")
        .run(harness_config(), |fixture| async move {
            // Redirect /dev/null to stdin so there is no tty to confirm on.
            // This relies on fixture invocations running in shell mode.
            let opts = CommandOptions {
                options: vec!["<".to_string(), "/dev/null".to_string()],
                allow_approval_prompt: true,
                ..Default::default()
            };

            let result = fixture.deploy_with("approval-required", opts).await;
            match result {
                Err(FixtureError::Command { exit_code, .. }) => {
                    assert_ne!(exit_code, 0);
                }
                other => panic!(
                    "deploy needing approval should fail without a tty, got {:?}",
                    other.map(|ids| ids.len())
                ),
            }

            // The refused deploy must not have created the stack.
            let full = fixture.full_stack_name("approval-required");
            match fixture.cloud().describe_stack(&full).await {
                Err(CloudError::NotFound { .. }) => {}
                other => panic!(
                    "stack should never have been created, got {:?}",
                    other.map(|description| description.status)
                ),
            }

            Ok(())
        })
        .await
        .expect("scenario should pass");
}
