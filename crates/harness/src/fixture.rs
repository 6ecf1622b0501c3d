//! Fixture lifecycle management.
//!
//! A [`StackFixture`] is the per-test object binding one isolated identity
//! and one held pool slot to the deploy/destroy/synth/diff/list verbs of the
//! CLI under test. Lifecycle per instance:
//!
//! ```text
//! Idle -> LockAcquired -> Ready -> (verbs)* -> TornDown
//! ```
//!
//! Teardown is strictly ordered after the test body's completion, success or
//! failure or panic, and runs exactly once. Teardown failures are logged and
//! pushed to a run-level ledger for triage, never rethrown over the body's
//! outcome: a cleanup flake must not mask the assertion that actually
//! failed.

use crate::cloud::ControlPlaneClient;
use crate::config::HarnessConfig;
use crate::identity::{AllocationError, IdentityAllocator, TestIdentity};
use crate::pool::{PoolLock, ResourcePool};
use crate::process::{self, ProcessError, ProcessResult, RunOptions};
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

/// Deployed stack identifiers printed by the CLI, one per line.
static STACK_ID_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^srn:\S+$").ok());

/// Run-level ledger of teardown failures, for post-run triage of leaked
/// stacks and slots.
static TEARDOWN_LEDGER: LazyLock<Mutex<Vec<TeardownFailure>>> =
    LazyLock::new(|| Mutex::new(Vec::new()));

/// Fixture errors.
#[derive(Debug, Error)]
pub enum FixtureError {
    /// Any failure before the test body starts running (lock, identity,
    /// pre-cleanup). The test never entered its body.
    #[error("fixture setup failed: {message}")]
    Setup { message: String },

    /// The CLI exited non-zero. Scenarios decide whether that is expected
    /// (negative tests) or fatal.
    #[error("`{verb}` for `{stack}` exited with code {exit_code}: {stderr}")]
    Command {
        verb: &'static str,
        stack: String,
        exit_code: i32,
        stderr: String,
    },

    /// Synthesized output was not a well-formed template.
    #[error("failed to parse synthesized template for `{stack}`: {source}")]
    Template {
        stack: String,
        #[source]
        source: serde_json::Error,
    },

    /// The whole-test ceiling fired. The ceiling covers lock-wait time plus
    /// worst-case single-threaded execution time.
    #[error("test exceeded its {budget:?} ceiling")]
    TestTimeout { budget: Duration },

    /// The spawned test body was cancelled without completing.
    #[error("test body did not complete: {0}")]
    BodyAborted(String),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

fn setup_error(message: impl Into<String>) -> FixtureError {
    FixtureError::Setup {
        message: message.into(),
    }
}

/// One recorded teardown failure.
#[derive(Debug, Clone)]
pub struct TeardownFailure {
    /// `run_prefix` of the fixture that failed to clean up.
    pub run_prefix: String,
    /// Logical stack name, when the failure was a stack destroy.
    pub stack: Option<String>,
    /// Human-readable failure description.
    pub message: String,
}

/// Snapshot of the run-level teardown ledger.
pub fn teardown_failures() -> Vec<TeardownFailure> {
    lock_unpoisoned(&TEARDOWN_LEDGER).clone()
}

/// Outcome of one fixture's teardown.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Failures encountered; empty on a clean teardown.
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    /// Whether teardown completed without failures.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Per-invocation options for fixture verbs.
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    /// Extra CLI arguments, appended after the verb's own. In shell mode
    /// these may include redirection operators.
    pub options: Vec<String>,

    /// Per-call environment overrides, merged over the fixture's base
    /// environment. Concurrent tests never observe each other's overrides.
    pub env: HashMap<String, String>,

    /// Override stderr capture; default captures.
    pub capture_stderr: Option<bool>,

    /// Override the CLI invocation timeout; default from config.
    pub timeout: Option<Duration>,

    /// Deploy only: leave interactive approval enabled instead of passing
    /// `--require-approval=never`. Used by negative scenarios.
    pub allow_approval_prompt: bool,
}

/// The per-test fixture: one identity, one held pool slot, verb access to
/// the CLI under test, and a verification client.
pub struct StackFixture {
    config: HarnessConfig,
    identity: TestIdentity,
    cloud: ControlPlaneClient,
    lock: Mutex<Option<PoolLock>>,
    deployed: Mutex<BTreeSet<String>>,
    disposed: AtomicBool,
}

impl StackFixture {
    /// Acquire a pool slot and allocate an identity.
    ///
    /// Lock acquisition happens first; a timeout there fails the test with
    /// [`FixtureError::Setup`] without retry, and the abandoning waiter
    /// holds nothing. Any later setup failure releases the slot on the way
    /// out.
    pub async fn acquire(base: &str, config: HarnessConfig) -> Result<Self, FixtureError> {
        let pool = ResourcePool::new(
            &config.pool_dir,
            &config.pool_key,
            config.pool_capacity,
            config.lease_duration(),
        )
        .map_err(|err| setup_error(format!("failed to open resource pool: {err}")))?;

        let holder_id = format!("{}@{}", base, std::process::id());
        let lock = pool
            .acquire(&holder_id, config.lock_timeout())
            .await
            .map_err(|err| setup_error(format!("resource lock not acquired: {err}")))?;

        // From here on, an early return drops `lock`, which releases the slot.
        let identity = IdentityAllocator::new().allocate(base)?;

        let cloud = ControlPlaneClient::new(config.control_plane_url.clone(), config.api_token.clone())
            .map_err(|err| setup_error(format!("failed to build control-plane client: {err}")))?;

        info!(
            run_prefix = %identity.run_prefix,
            pool_key = %config.pool_key,
            "fixture ready"
        );

        Ok(Self {
            config,
            identity,
            cloud,
            lock: Mutex::new(Some(lock)),
            deployed: Mutex::new(BTreeSet::new()),
            disposed: AtomicBool::new(false),
        })
    }

    /// [`StackFixture::acquire`], then destroy leftover stacks from a
    /// previous aborted run. A leftover that does not exist counts as
    /// success; any other cleanup failure tears the fixture down and fails
    /// setup.
    pub async fn acquire_with_preclean(
        base: &str,
        config: HarnessConfig,
        leftovers: &[&str],
    ) -> Result<Self, FixtureError> {
        let fixture = Self::acquire(base, config).await?;

        for name in leftovers {
            if let Err(err) = fixture
                .destroy_tolerating_missing(name, CommandOptions::default())
                .await
            {
                let _ = fixture.dispose().await;
                return Err(setup_error(format!(
                    "pre-test cleanup of `{name}` failed: {err}"
                )));
            }
        }

        Ok(fixture)
    }

    /// This fixture's identity.
    pub fn identity(&self) -> &TestIdentity {
        &self.identity
    }

    /// The prefix applied to every stack name this fixture creates.
    pub fn stack_name_prefix(&self) -> &str {
        &self.identity.stack_name_prefix
    }

    /// The full (prefixed) name for a logical stack name.
    pub fn full_stack_name(&self, logical: &str) -> String {
        self.identity.full_stack_name(logical)
    }

    /// Control-plane verification client.
    pub fn cloud(&self) -> &ControlPlaneClient {
        &self.cloud
    }

    /// Deploy `name` with default options.
    pub async fn deploy(&self, name: &str) -> Result<Vec<String>, FixtureError> {
        self.deploy_with(name, CommandOptions::default()).await
    }

    /// Deploy `name` (a logical stack name, possibly a glob) and return the
    /// deployed stack identifiers, one per matched stack.
    ///
    /// No ordering is guaranteed beyond "one identifier per matched stack":
    /// assert against count or set membership, never position.
    pub async fn deploy_with(
        &self,
        name: &str,
        opts: CommandOptions,
    ) -> Result<Vec<String>, FixtureError> {
        self.ensure_live()?;
        let full = self.full_stack_name(name);

        let mut args = vec!["deploy".to_string(), full.clone()];
        if !opts.allow_approval_prompt {
            args.push("--require-approval=never".to_string());
        }

        let result = self.exec("deploy", &full, args, &opts).await?;
        let ids = parse_stack_ids(&result.stdout);

        // Recorded by logical name so teardown destroys the same pattern
        // that was deployed, glob or not.
        self.lock_deployed().insert(name.to_string());

        Ok(ids)
    }

    /// Destroy `name` with default options.
    pub async fn destroy(&self, name: &str) -> Result<(), FixtureError> {
        self.ensure_live()?;
        self.destroy_inner(name, &CommandOptions::default(), false)
            .await
    }

    /// Destroy `name` with explicit options (e.g. env overrides the app
    /// needs to synthesize).
    pub async fn destroy_with(&self, name: &str, opts: CommandOptions) -> Result<(), FixtureError> {
        self.ensure_live()?;
        self.destroy_inner(name, &opts, false).await
    }

    /// Destroy `name`, treating "stack does not exist" as success. Safe to
    /// call unconditionally during cleanup.
    pub async fn destroy_tolerating_missing(
        &self,
        name: &str,
        opts: CommandOptions,
    ) -> Result<(), FixtureError> {
        self.ensure_live()?;
        self.destroy_inner(name, &opts, true).await
    }

    async fn destroy_inner(
        &self,
        name: &str,
        opts: &CommandOptions,
        tolerate_missing: bool,
    ) -> Result<(), FixtureError> {
        let full = self.full_stack_name(name);
        let args = vec!["destroy".to_string(), full.clone(), "--force".to_string()];

        let outcome = self.exec("destroy", &full, args, opts).await;
        match outcome {
            Ok(_) => {}
            Err(FixtureError::Command { ref stderr, .. })
                if tolerate_missing && is_missing_stack(stderr) =>
            {
                debug!(stack = %full, "destroy target did not exist, treating as success");
            }
            Err(err) => return Err(err),
        }

        // A destroyed stack's record is gone; it is never re-destroyed or
        // reused.
        self.lock_deployed().remove(name);
        Ok(())
    }

    /// Synthesize `name` and return the raw template text.
    pub async fn synth(&self, name: &str) -> Result<String, FixtureError> {
        self.synth_with(name, CommandOptions::default()).await
    }

    /// Synthesize `name` with explicit options.
    pub async fn synth_with(
        &self,
        name: &str,
        opts: CommandOptions,
    ) -> Result<String, FixtureError> {
        self.ensure_live()?;
        let full = self.full_stack_name(name);
        let args = vec!["synth".to_string(), full.clone()];
        let result = self.exec("synth", &full, args, &opts).await?;
        Ok(result.stdout)
    }

    /// Synthesize `name` and parse the template as JSON.
    pub async fn template(&self, name: &str) -> Result<serde_json::Value, FixtureError> {
        let full = self.full_stack_name(name);
        let text = self.synth(name).await?;
        serde_json::from_str(&text).map_err(|source| FixtureError::Template {
            stack: full,
            source,
        })
    }

    /// Diff `name` against its deployed state. With `fail_on_change`, a
    /// pending change makes the CLI exit non-zero, surfaced as
    /// [`FixtureError::Command`].
    pub async fn diff(&self, name: &str, fail_on_change: bool) -> Result<String, FixtureError> {
        self.ensure_live()?;
        let full = self.full_stack_name(name);

        let mut args = vec!["diff".to_string()];
        if fail_on_change {
            args.push("--fail".to_string());
        }
        args.push(full.clone());

        let result = self
            .exec("diff", &full, args, &CommandOptions::default())
            .await?;
        Ok(result.stdout)
    }

    /// List the app's stacks (full, prefixed names).
    pub async fn list(&self) -> Result<Vec<String>, FixtureError> {
        self.ensure_live()?;
        let result = self
            .exec("ls", "*", vec!["ls".to_string()], &CommandOptions::default())
            .await?;

        Ok(result
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    /// Run an arbitrary CLI invocation. Arguments are passed as given; stack
    /// names must already be prefixed via [`StackFixture::full_stack_name`].
    pub async fn cli(
        &self,
        args: &[&str],
        opts: CommandOptions,
    ) -> Result<ProcessResult, FixtureError> {
        self.ensure_live()?;
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.exec("cli", "*", args, &opts).await
    }

    /// Tear the fixture down: best-effort destroy of every recorded stack,
    /// then lock release. Runs exactly once; later calls are no-ops.
    pub async fn dispose(&self) -> TeardownReport {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return TeardownReport::default();
        }

        let names: Vec<String> = {
            let mut deployed = self.lock_deployed();
            let names = deployed.iter().cloned().collect();
            deployed.clear();
            names
        };

        let mut failures = Vec::new();
        for name in names {
            if let Err(err) = self.destroy_inner(&name, &CommandOptions::default(), true).await {
                warn!(stack = %name, error = %err, "teardown: failed to destroy stack");
                failures.push(TeardownFailure {
                    run_prefix: self.identity.run_prefix.clone(),
                    stack: Some(name),
                    message: err.to_string(),
                });
            }
        }

        if let Some(mut lock) = lock_unpoisoned(&self.lock).take() {
            lock.release();
        }

        if !failures.is_empty() {
            lock_unpoisoned(&TEARDOWN_LEDGER).extend(failures.iter().cloned());
        }

        debug!(run_prefix = %self.identity.run_prefix, "fixture torn down");
        TeardownReport { failures }
    }

    /// Compose the full argument vector and run it through the process
    /// invoker. Fixture invocations use shell mode so scenario-supplied
    /// redirection operators work.
    async fn exec(
        &self,
        verb: &'static str,
        stack: &str,
        mut args: Vec<String>,
        opts: &CommandOptions,
    ) -> Result<ProcessResult, FixtureError> {
        let mut argv = vec![self.config.cli_binary.to_string_lossy().into_owned()];
        argv.append(&mut args);
        argv.extend(opts.options.iter().cloned());

        let mut env = self.base_env();
        env.extend(opts.env.clone());

        let run_opts = RunOptions {
            timeout: Some(opts.timeout.unwrap_or_else(|| self.config.cli_timeout())),
            capture_stderr: opts.capture_stderr.unwrap_or(true),
            shell: true,
            env,
            cwd: Some(self.config.app_dir.clone()),
        };

        debug!(verb, stack, "invoking deployment CLI");
        let result = process::run(&argv, &run_opts).await?;

        if result.exit_code != 0 {
            return Err(FixtureError::Command {
                verb,
                stack: stack.to_string(),
                exit_code: result.exit_code,
                stderr: result.stderr,
            });
        }

        Ok(result)
    }

    /// Environment every invocation gets: the app reads the prefix to name
    /// its stacks, the CLI reads the endpoint and credentials.
    fn base_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::from([
            (
                "STACK_NAME_PREFIX".to_string(),
                self.identity.stack_name_prefix.clone(),
            ),
            (
                "STRATA_ENDPOINT".to_string(),
                self.config.control_plane_url.clone(),
            ),
        ]);
        if let Some(token) = &self.config.api_token {
            env.insert("STRATA_API_TOKEN".to_string(), token.clone());
        }
        env
    }

    fn ensure_live(&self) -> Result<(), FixtureError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(setup_error("fixture already torn down"));
        }
        Ok(())
    }

    fn lock_deployed(&self) -> MutexGuard<'_, BTreeSet<String>> {
        lock_unpoisoned(&self.deployed)
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Extract deployed stack identifiers from CLI stdout: one `srn:` line per
/// matched stack, interleaved with progress output.
fn parse_stack_ids(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| match STACK_ID_PATTERN.as_ref() {
            Some(pattern) => pattern.is_match(line),
            None => line.starts_with("srn:"),
        })
        .map(String::from)
        .collect()
}

fn is_missing_stack(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    lowered.contains("does not exist") || lowered.contains("no stacks match")
}

/// How the spawned body ended, when it did not produce a result.
enum BodyFailure {
    TimedOut(Duration),
    Panicked(Box<dyn std::any::Any + Send + 'static>),
    Cancelled(String),
}

fn categorize<T>(joined: Result<T, JoinError>) -> Result<T, BodyFailure> {
    match joined {
        Ok(value) => Ok(value),
        Err(err) => {
            if err.is_panic() {
                Err(BodyFailure::Panicked(err.into_panic()))
            } else {
                Err(BodyFailure::Cancelled(err.to_string()))
            }
        }
    }
}

/// Scoped acquisition: set the fixture up, run `body`, and tear down on
/// every exit path — normal return, error, panic, or budget expiry.
///
/// `budget` is the whole-test ceiling and covers fixture setup (including
/// lock wait) plus the body; teardown always runs to completion regardless.
/// A body panic is re-raised only after teardown finishes, so the original
/// assertion failure is what the test reports.
pub async fn run_with_fixture<F, Fut, T>(
    base: &str,
    config: HarnessConfig,
    budget: Option<Duration>,
    body: F,
) -> Result<T, FixtureError>
where
    F: FnOnce(Arc<StackFixture>) -> Fut,
    Fut: Future<Output = Result<T, FixtureError>> + Send + 'static,
    T: Send + 'static,
{
    let started = Instant::now();

    let fixture = match budget {
        Some(limit) => match tokio::time::timeout(limit, StackFixture::acquire(base, config)).await
        {
            Ok(acquired) => acquired?,
            Err(_) => return Err(FixtureError::TestTimeout { budget: limit }),
        },
        None => StackFixture::acquire(base, config).await?,
    };
    let fixture = Arc::new(fixture);

    let mut handle = tokio::spawn(body(fixture.clone()));
    let body_outcome = match budget {
        Some(limit) => {
            let remaining = limit.saturating_sub(started.elapsed());
            match tokio::time::timeout(remaining, &mut handle).await {
                Ok(joined) => categorize(joined),
                Err(_) => {
                    handle.abort();
                    // Wait the cancellation out so the body is fully stopped
                    // before teardown starts.
                    let _ = handle.await;
                    Err(BodyFailure::TimedOut(limit))
                }
            }
        }
        None => categorize(handle.await),
    };

    let report = fixture.dispose().await;
    if !report.is_clean() {
        warn!(
            failures = report.failures.len(),
            "teardown completed with failures"
        );
    }

    match body_outcome {
        Ok(result) => result,
        Err(BodyFailure::TimedOut(budget)) => Err(FixtureError::TestTimeout { budget }),
        Err(BodyFailure::Cancelled(message)) => Err(FixtureError::BodyAborted(message)),
        Err(BodyFailure::Panicked(payload)) => std::panic::resume_unwind(payload),
    }
}
