//! Cross-process resource pool locking.
//!
//! Parallel test processes share a finite set of external account/region
//! slots. A pool is a directory of JSON lease records, one file per slot,
//! visible to every process. Claiming a slot is an atomic create-if-absent
//! on the slot file; the loser of a create race re-polls. Leases carry an
//! expiry so a holder that crashes without releasing never exhausts the pool
//! permanently: any later waiter reclaims the slot once the lease is stale.
//!
//! Release is idempotent and also happens on drop, so teardown code can call
//! it unconditionally.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Maximum slots a single pool may be configured with.
pub const MAX_POOL_CAPACITY: usize = 64;

/// Upper bound on the jitter added to each poll sleep.
const MAX_POLL_JITTER_MS: u64 = 250;

/// Tuning knobs for the acquisition poll loop.
#[derive(Debug, Clone)]
pub struct PoolTuning {
    /// Initial sleep between claim rounds; doubles each round.
    pub poll_interval: Duration,
    /// Cap for the doubled poll interval.
    pub max_poll_interval: Duration,
    /// How old an unreadable lease file must be before it is treated as a
    /// torn write from a crashed holder and reclaimed. A freshly-created
    /// file may simply not have its content yet.
    pub corrupt_grace: Duration,
}

impl Default for PoolTuning {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            max_poll_interval: Duration::from_secs(4),
            corrupt_grace: Duration::from_secs(5),
        }
    }
}

/// Resource pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error(
        "timed out acquiring a slot in pool `{pool_key}` (capacity {capacity}) after {waited:?}"
    )]
    AcquisitionTimeout {
        pool_key: String,
        capacity: usize,
        waited: Duration,
    },

    #[error("pool capacity must be between 1 and {MAX_POOL_CAPACITY}, got {capacity}")]
    InvalidCapacity { capacity: usize },

    #[error("pool storage error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode lease record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Durable claim record for one pool slot.
///
/// Mutated only by the pool; other processes observe it read-only when
/// probing for free or stale slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// The pool this lease belongs to.
    pub pool_key: String,
    /// Slot index within the pool.
    pub slot: usize,
    /// Opaque identifier of the holder (suite name + process id).
    pub holder_id: String,
    /// Process id of the holder, for triage of leaked leases.
    pub pid: u32,
    /// When the slot was claimed.
    pub acquired_at: DateTime<Utc>,
    /// When the lease becomes reclaimable by other waiters. `None` means the
    /// lease never expires on its own.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Whether `record` is reclaimable at `now`.
pub fn is_stale(record: &LeaseRecord, now: DateTime<Utc>) -> bool {
    match record.expires_at {
        Some(expires_at) => expires_at <= now,
        None => false,
    }
}

/// A capacity-bounded set of externally shared slots, backed by a lock
/// directory visible to all test processes.
#[derive(Debug, Clone)]
pub struct ResourcePool {
    key: String,
    capacity: usize,
    dir: PathBuf,
    lease_duration: Duration,
    tuning: PoolTuning,
}

impl ResourcePool {
    /// Open (creating if needed) the pool `key` under `root`.
    pub fn new(
        root: &Path,
        key: &str,
        capacity: usize,
        lease_duration: Duration,
    ) -> Result<Self, PoolError> {
        Self::with_tuning(root, key, capacity, lease_duration, PoolTuning::default())
    }

    /// Open a pool with explicit poll tuning.
    pub fn with_tuning(
        root: &Path,
        key: &str,
        capacity: usize,
        lease_duration: Duration,
        tuning: PoolTuning,
    ) -> Result<Self, PoolError> {
        if capacity == 0 || capacity > MAX_POOL_CAPACITY {
            return Err(PoolError::InvalidCapacity { capacity });
        }

        let dir = root.join(dir_name(key));
        fs::create_dir_all(&dir).map_err(|source| PoolError::Io {
            path: dir.clone(),
            source,
        })?;

        Ok(Self {
            key: key.to_string(),
            capacity,
            dir,
            lease_duration,
            tuning,
        })
    }

    /// The pool key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Configured slot count.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Acquire a slot, waiting up to `timeout`.
    ///
    /// Polls with doubling backoff plus jitter rather than busy-spinning, so
    /// a swarm of test processes starting together does not hammer the
    /// shared storage. A waiter that times out holds nothing.
    pub async fn acquire(&self, holder_id: &str, timeout: Duration) -> Result<PoolLock, PoolError> {
        let start = Instant::now();
        let mut delay = self.tuning.poll_interval;

        loop {
            for slot in 0..self.capacity {
                if let Some(record) = self.try_claim_slot(slot, holder_id)? {
                    debug!(
                        pool_key = %self.key,
                        slot,
                        holder_id,
                        "acquired pool slot"
                    );
                    return Ok(PoolLock {
                        record,
                        path: self.slot_path(slot),
                        released: false,
                    });
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(PoolError::AcquisitionTimeout {
                    pool_key: self.key.clone(),
                    capacity: self.capacity,
                    waited: elapsed,
                });
            }

            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_POLL_JITTER_MS));
            let remaining = timeout - elapsed;
            tokio::time::sleep((delay + jitter).min(remaining)).await;
            delay = (delay * 2).min(self.tuning.max_poll_interval);
        }
    }

    /// Try to claim one slot. Returns `None` when the slot is validly held
    /// by someone else.
    fn try_claim_slot(
        &self,
        slot: usize,
        holder_id: &str,
    ) -> Result<Option<LeaseRecord>, PoolError> {
        let path = self.slot_path(slot);

        if let Some(record) = self.create_record(&path, slot, holder_id)? {
            return Ok(Some(record));
        }

        if !self.slot_is_reclaimable(&path)? {
            return Ok(None);
        }

        // Stale lease: remove it, then re-race the atomic create. Several
        // waiters may remove concurrently; only one create wins.
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(PoolError::Io { path, source }),
        }

        self.create_record(&path, slot, holder_id)
    }

    /// Atomic create-if-absent claim. `None` means another holder won.
    fn create_record(
        &self,
        path: &Path,
        slot: usize,
        holder_id: &str,
    ) -> Result<Option<LeaseRecord>, PoolError> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(source) => {
                return Err(PoolError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let acquired_at = Utc::now();
        let expires_at = chrono::Duration::from_std(self.lease_duration)
            .ok()
            .and_then(|lease| acquired_at.checked_add_signed(lease));

        let record = LeaseRecord {
            pool_key: self.key.clone(),
            slot,
            holder_id: holder_id.to_string(),
            pid: std::process::id(),
            acquired_at,
            expires_at,
        };

        let text = serde_json::to_string_pretty(&record)?;
        file.write_all(text.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|source| PoolError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Some(record))
    }

    /// Whether the lease file at `path` may be removed and re-claimed.
    fn slot_is_reclaimable(&self, path: &Path) -> Result<bool, PoolError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            // Released between our create attempt and this probe.
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(source) => {
                return Err(PoolError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        match serde_json::from_str::<LeaseRecord>(&text) {
            Ok(record) => Ok(is_stale(&record, Utc::now())),
            // Unparsable record: either a torn write from a crashed holder
            // (reclaim) or a claim whose content is still in flight (leave
            // alone until it outlives the grace window).
            Err(_) => Ok(self.file_older_than(path, self.tuning.corrupt_grace)),
        }
    }

    fn file_older_than(&self, path: &Path, age: Duration) -> bool {
        fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .map(|elapsed| elapsed >= age)
            .unwrap_or(false)
    }

    fn slot_path(&self, slot: usize) -> PathBuf {
        self.dir.join(format!("slot-{:02}.json", slot))
    }
}

/// Directory name for a pool key: sanitized for the filesystem, hash-suffixed
/// so distinct keys never share a directory.
fn dir_name(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    format!("{}-{:08x}", sanitized, hasher.finish() as u32)
}

/// An exclusively held pool slot.
///
/// Released explicitly via [`PoolLock::release`] (idempotent) or implicitly
/// on drop. If the process dies without either, the lease expiry makes the
/// slot reclaimable.
#[derive(Debug)]
pub struct PoolLock {
    record: LeaseRecord,
    path: PathBuf,
    released: bool,
}

impl PoolLock {
    /// The lease record this lock holds.
    pub fn record(&self) -> &LeaseRecord {
        &self.record
    }

    /// Release the slot. Safe to call any number of times; releasing a lock
    /// whose lease has already expired and been reclaimed is a no-op.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        // Only remove the record if it is still ours. An expired lease may
        // have been reclaimed by another process.
        let still_ours = fs::read_to_string(&self.path)
            .ok()
            .and_then(|text| serde_json::from_str::<LeaseRecord>(&text).ok())
            .map(|current| {
                current.holder_id == self.record.holder_id
                    && current.acquired_at == self.record.acquired_at
            })
            .unwrap_or(false);

        if !still_ours {
            return;
        }

        match fs::remove_file(&self.path) {
            Ok(()) => debug!(pool_key = %self.record.pool_key, slot = self.record.slot, "released pool slot"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "failed to remove pool slot record on release"
                );
            }
        }
    }
}

impl Drop for PoolLock {
    fn drop(&mut self) {
        self.release();
    }
}
