//! Smoke Tests: Diff
//!
//! Diff against a stack with a pending change (here: never deployed, so the
//! whole stack is pending creation). Plain `diff` reports the change and
//! exits zero; `diff --fail` exits non-zero on the same pending change.

#![cfg(feature = "smoke")]

use integ_harness::fixture::FixtureError;
use integ_harness::scenario::Scenario;
use integ_tests::harness_config;

#[tokio::test]
async fn test_diff_reports_pending_change_and_exits_zero() {
    Scenario::new("diff")
        .run(harness_config(), |fixture| async move {
            let diff1 = fixture.diff("test-1", false).await?;
            assert!(
                diff1.contains("Strata::Messaging::Topic"),
                "diff should mention the pending topic, got: {}",
                diff1
            );

            let diff2 = fixture.diff("test-2", false).await?;
            assert!(diff2.contains("Strata::Messaging::Topic"));

            Ok(())
        })
        .await
        .expect("scenario should pass");
}

#[tokio::test]
async fn test_diff_fail_exits_nonzero_on_pending_change() {
    Scenario::new("diff fail")
        .run(harness_config(), |fixture| async move {
            let result = fixture.diff("test-1", true).await;

            match result {
                Err(FixtureError::Command { exit_code, .. }) => {
                    assert_ne!(exit_code, 0);
                }
                other => panic!(
                    "diff --fail should exit non-zero on a pending change, got {:?}",
                    other.map(|_| ())
                ),
            }

            Ok(())
        })
        .await
        .expect("scenario should pass");
}
