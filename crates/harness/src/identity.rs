//! Unique test identities for parallel runs against a shared account.
//!
//! Every fixture gets a stack-name prefix that is globally unique across
//! concurrent test processes on one host and concurrent CI runs sharing the
//! same account/region. The prefix keeps the human-chosen base at the front
//! so leaked stacks can be traced back to the suite that created them.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::LazyLock;
use thiserror::Error;

/// Maximum stack name length accepted by the control plane.
pub const MAX_STACK_NAME_LEN: usize = 128;

/// Default budget for the allocated prefix. The remainder of
/// [`MAX_STACK_NAME_LEN`] is left for the logical stack name appended by the
/// fixture.
pub const DEFAULT_MAX_PREFIX_LEN: usize = 64;

/// Fallback random fragment, only reachable if uuid formatting ever changes.
const ZERO_FRAGMENT: &str = "000000";

/// Process-wide token included in every suffix. Two test processes on the
/// same host always differ here.
static PROCESS_TOKEN: LazyLock<String> = LazyLock::new(|| format!("{:x}", std::process::id()));

/// Per-process allocation sequence. Two fixtures inside one process always
/// differ here.
static SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Identity allocation errors.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error(
        "cannot fit a unique stack name prefix for base `{base}` into {budget} characters \
         (uniqueness suffix alone needs {suffix_len})"
    )]
    NameBudgetExceeded {
        base: String,
        budget: usize,
        suffix_len: usize,
    },
}

/// A collision-free identity for one fixture instance.
///
/// Owned by the fixture that allocated it; never shared across concurrently
/// running fixtures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestIdentity {
    /// The uniqueness suffix on its own (process token + sequence + random
    /// fragment). Useful for log correlation and lock holder ids.
    pub run_prefix: String,

    /// The full prefix applied to every stack name this fixture creates.
    pub stack_name_prefix: String,
}

impl TestIdentity {
    /// The full (prefixed) name for a logical stack name.
    pub fn full_stack_name(&self, logical: &str) -> String {
        format!("{}-{}", self.stack_name_prefix, logical)
    }
}

/// Allocates [`TestIdentity`] values within a configurable length budget.
#[derive(Debug, Clone)]
pub struct IdentityAllocator {
    max_prefix_len: usize,
}

impl Default for IdentityAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityAllocator {
    /// Allocator with the default prefix budget.
    pub fn new() -> Self {
        Self {
            max_prefix_len: DEFAULT_MAX_PREFIX_LEN,
        }
    }

    /// Allocator with a custom prefix budget (still capped by
    /// [`MAX_STACK_NAME_LEN`]).
    pub fn with_max_prefix_len(max_prefix_len: usize) -> Self {
        Self {
            max_prefix_len: max_prefix_len.min(MAX_STACK_NAME_LEN),
        }
    }

    /// The budget an allocated prefix will never exceed.
    pub fn max_prefix_len(&self) -> usize {
        self.max_prefix_len
    }

    /// Allocate a new identity for `base`.
    ///
    /// The base is truncated as far as needed to respect the budget; the
    /// uniqueness suffix never is. Fails only when even the bare suffix does
    /// not fit.
    pub fn allocate(&self, base: &str) -> Result<TestIdentity, AllocationError> {
        let suffix = next_suffix();

        if suffix.len() > self.max_prefix_len {
            return Err(AllocationError::NameBudgetExceeded {
                base: base.to_string(),
                budget: self.max_prefix_len,
                suffix_len: suffix.len(),
            });
        }

        // Room left for the base plus the separating dash.
        let room = self.max_prefix_len - suffix.len();
        let base_budget = room.saturating_sub(1);
        let truncated: String = base.chars().take(base_budget).collect();

        let stack_name_prefix = if truncated.is_empty() {
            suffix.clone()
        } else {
            format!("{}-{}", truncated, suffix)
        };

        Ok(TestIdentity {
            run_prefix: suffix,
            stack_name_prefix,
        })
    }
}

/// Next uniqueness suffix: process token, monotonic sequence, random
/// fragment. The sequence is fixed-width so every suffix allocated by one
/// process has the same length.
fn next_suffix() -> String {
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let entropy = uuid::Uuid::new_v4().simple().to_string();
    let fragment = entropy.get(..6).unwrap_or(ZERO_FRAGMENT);
    format!("{}x{:06x}{}", *PROCESS_TOKEN, seq, fragment)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_allocations_are_pairwise_distinct() {
        let allocator = IdentityAllocator::new();
        let mut seen = HashSet::new();

        for _ in 0..500 {
            let identity = allocator.allocate("integ").unwrap();
            assert!(
                seen.insert(identity.stack_name_prefix.clone()),
                "duplicate prefix allocated: {}",
                identity.stack_name_prefix
            );
        }
    }

    #[test]
    fn test_concurrent_allocations_are_distinct() {
        let allocator = IdentityAllocator::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| allocator.allocate("swarm").unwrap().stack_name_prefix)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for prefix in handle.join().unwrap() {
                assert!(seen.insert(prefix.clone()), "duplicate prefix: {}", prefix);
            }
        }
        assert_eq!(seen.len(), 800);
    }

    #[test]
    fn test_base_appears_in_prefix() {
        let identity = IdentityAllocator::new().allocate("cli-lib").unwrap();
        assert!(identity.stack_name_prefix.starts_with("cli-lib-"));
        assert!(identity.stack_name_prefix.ends_with(&identity.run_prefix));
    }

    #[test]
    fn test_long_base_is_truncated_suffix_is_not() {
        let long_base = "b".repeat(200);
        let allocator = IdentityAllocator::new();
        let identity = allocator.allocate(&long_base).unwrap();

        assert!(identity.stack_name_prefix.len() <= allocator.max_prefix_len());
        assert!(
            identity.stack_name_prefix.ends_with(&identity.run_prefix),
            "uniqueness suffix must survive truncation"
        );
    }

    #[test]
    fn test_tiny_budget_fails_allocation() {
        let allocator = IdentityAllocator::with_max_prefix_len(4);
        let result = allocator.allocate("x");
        assert!(matches!(
            result,
            Err(AllocationError::NameBudgetExceeded { budget: 4, .. })
        ));
    }

    #[test]
    fn test_budget_with_no_room_for_base_still_allocates() {
        // Enough for the suffix but nothing else: the base is dropped
        // entirely rather than failing.
        let probe = IdentityAllocator::new().allocate("p").unwrap();
        let suffix_len = probe.run_prefix.len();

        let allocator = IdentityAllocator::with_max_prefix_len(suffix_len);
        let identity = allocator.allocate("suite").unwrap();
        assert_eq!(identity.stack_name_prefix, identity.run_prefix);
    }

    #[test]
    fn test_full_stack_name_appends_logical_name() {
        let identity = IdentityAllocator::new().allocate("integ").unwrap();
        let full = identity.full_stack_name("test-1");
        assert_eq!(full, format!("{}-test-1", identity.stack_name_prefix));
    }
}
