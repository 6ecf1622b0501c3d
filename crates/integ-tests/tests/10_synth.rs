//! Smoke Tests: Synthesis and Listing
//!
//! CLI-only scenarios: synthesize stacks from the test app and assert on the
//! produced template, list the app's stacks. No control plane involved.

#![cfg(feature = "smoke")]

use integ_harness::scenario::Scenario;
use integ_tests::harness_config;
use serde_json::Value;

/// Find a resource in the template whose metadata path matches
/// `<full-stack-name>/<construct>/Resource`. Logical ids carry generated
/// hash suffixes, so scenarios match on the metadata path instead.
fn resource_with_path<'a>(template: &'a Value, full_name: &str, construct: &str) -> Option<&'a Value> {
    let wanted = format!("{}/{}/Resource", full_name, construct);
    template
        .get("Resources")?
        .as_object()?
        .values()
        .find(|resource| {
            resource
                .get("Metadata")
                .and_then(|metadata| metadata.get("strata:path"))
                .and_then(|path| path.as_str())
                == Some(wanted.as_str())
        })
}

#[tokio::test]
async fn test_synth_single_topic_stack() {
    Scenario::new("synth test-1")
        .run(harness_config(), |fixture| async move {
            let template = fixture.template("test-1").await?;
            let full = fixture.full_stack_name("test-1");

            let topic = resource_with_path(&template, &full, "topic")
                .expect("template should contain the topic resource");
            assert_eq!(
                topic.get("Type").and_then(Value::as_str),
                Some("Strata::Messaging::Topic")
            );

            Ok(())
        })
        .await
        .expect("scenario should pass");
}

#[tokio::test]
async fn test_synth_two_topic_stack() {
    Scenario::new("synth test-2")
        .run(harness_config(), |fixture| async move {
            let template = fixture.template("test-2").await?;
            let full = fixture.full_stack_name("test-2");

            for construct in ["topic1", "topic2"] {
                let topic = resource_with_path(&template, &full, construct)
                    .unwrap_or_else(|| panic!("template should contain `{}`", construct));
                assert_eq!(
                    topic.get("Type").and_then(Value::as_str),
                    Some("Strata::Messaging::Topic")
                );
            }

            Ok(())
        })
        .await
        .expect("scenario should pass");
}

#[tokio::test]
async fn test_list_shows_every_app_stack() {
    Scenario::new("ls")
        .run(harness_config(), |fixture| async move {
            let listing = fixture.list().await?;

            let expected_stacks = [
                "test-1",
                "test-2",
                "with-nested-stack-using-parameters",
                "approval-required",
            ];

            for stack in expected_stacks {
                let full = fixture.full_stack_name(stack);
                assert!(
                    listing.contains(&full),
                    "`ls` output should contain {}, got: {:?}",
                    full,
                    listing
                );
            }

            Ok(())
        })
        .await
        .expect("scenario should pass");
}
