//! Durable single-writer/single-reader fixture handoff.
//!
//! Two independently scheduled roles coordinate through one JSON record on
//! local storage:
//! - presence of the record means "setup is ready"
//! - absence after readiness means "run is done"
//!
//! Publication is atomic (write to a sibling name, rename into place), so a
//! reader never observes a partially written record. All waits are bounded
//! polls with a hard ceiling and a cancellation token; nothing here blocks
//! indefinitely.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use snafu::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::handoff::error::CancelledSnafu;
use crate::handoff::error::HandoffError;
use crate::handoff::error::IoSnafu;
use crate::handoff::error::StoreTimeoutSnafu;
use crate::handoff::error::StoreWriteSnafu;
use crate::handoff::record::FixtureRecord;

/// Configuration for the fixture store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Sleep between existence polls in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500, // half a second between polls
        }
    }
}

/// Handle to one run's fixture store location.
///
/// The location is scoped by `run_id` so concurrent runs on the same host
/// never collide. Exactly one writer and one reader exist per location and
/// they never write simultaneously, so atomic create/rename/delete is all
/// the locking required.
#[derive(Debug, Clone)]
pub struct FixtureStore {
    path: PathBuf,
    run_id: String,
    poll_interval: Duration,
}

impl FixtureStore {
    /// Create a store handle rooted at `dir`.
    ///
    /// # Arguments
    /// * `dir` - Directory holding store files (typically the temp dir)
    /// * `prefix` - File name prefix shared by all runs of this suite
    /// * `run_id` - Identifier scoping this producer/consumer pairing
    /// * `config` - Polling configuration
    pub fn new(dir: impl AsRef<Path>, prefix: &str, run_id: impl Into<String>, config: StoreConfig) -> Self {
        let run_id = run_id.into();
        let path = dir.as_ref().join(format!("{prefix}-{run_id}.json"));
        Self {
            path,
            run_id,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    /// The on-disk location of this run's record.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The run identifier this store is scoped to.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Atomically publish `record` at the store location.
    ///
    /// Writes to a sibling name and renames into place, so a concurrent
    /// reader sees either nothing or the complete record. Fails with
    /// `StoreWrite` if a record is already present (double publish within
    /// a run, or a colliding run), if the record belongs to a different
    /// run than this store, or if the location is not writable.
    pub async fn publish(&self, record: &FixtureRecord) -> Result<(), HandoffError> {
        if record.run_id != self.run_id {
            return StoreWriteSnafu {
                path: self.path.display().to_string(),
                reason: format!("record belongs to run '{}', store is scoped to run '{}'", record.run_id, self.run_id),
            }
            .fail();
        }

        if let Some(existing) = self.read_record_if_present().await? {
            return StoreWriteSnafu {
                path: self.path.display().to_string(),
                reason: format!("already published by run '{}'", existing.run_id),
            }
            .fail();
        }

        let json = serde_json::to_vec_pretty(record)?;

        // One writer per run, so a fixed sibling name cannot collide.
        let partial = self.path.with_extension("json.partial");
        if let Err(e) = tokio::fs::write(&partial, &json).await {
            return StoreWriteSnafu {
                path: partial.display().to_string(),
                reason: format!("write failed: {e}"),
            }
            .fail();
        }
        if let Err(e) = tokio::fs::rename(&partial, &self.path).await {
            return StoreWriteSnafu {
                path: self.path.display().to_string(),
                reason: format!("rename into place failed: {e}"),
            }
            .fail();
        }

        info!(
            run_id = %self.run_id,
            path = %self.path.display(),
            bytes = json.len(),
            "fixture record published"
        );
        Ok(())
    }

    /// Wait for the record to appear, then read it.
    ///
    /// Polls with a sleep interval up to the `timeout` ceiling. Returns
    /// `StoreTimeout` on expiry and `Cancelled` if `cancel` fires first;
    /// the two are distinct so callers can tell "gave up" from "was told
    /// to stop".
    pub async fn await_and_read(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<FixtureRecord, HandoffError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(record) = self.read_record_if_present().await? {
                debug!(
                    run_id = %self.run_id,
                    path = %self.path.display(),
                    "fixture record read"
                );
                return Ok(record);
            }

            self.pause_or_bail(deadline, timeout, cancel, "fixture wait").await?;
        }
    }

    /// Delete the store location.
    ///
    /// Idempotent: releasing an absent store is not an error.
    pub async fn release(&self) -> Result<(), HandoffError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(
                    run_id = %self.run_id,
                    path = %self.path.display(),
                    "fixture record released"
                );
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(
                    run_id = %self.run_id,
                    path = %self.path.display(),
                    "release on absent store (already released)"
                );
                Ok(())
            }
            Err(e) => Err(e).context(IoSnafu {
                path: self.path.display().to_string(),
            }),
        }
    }

    /// Wait for the store location to disappear.
    ///
    /// Same bounds and error split as [`await_and_read`](Self::await_and_read).
    pub async fn await_release(&self, timeout: Duration, cancel: &CancellationToken) -> Result<(), HandoffError> {
        let deadline = Instant::now() + timeout;

        loop {
            let present = tokio::fs::try_exists(&self.path).await.context(IoSnafu {
                path: self.path.display().to_string(),
            })?;
            if !present {
                debug!(
                    run_id = %self.run_id,
                    path = %self.path.display(),
                    "store released by reader"
                );
                return Ok(());
            }

            self.pause_or_bail(deadline, timeout, cancel, "release wait").await?;
        }
    }

    /// Sleep one poll interval, bailing on deadline or cancellation.
    ///
    /// The sleep is capped at the remaining time so the wait never
    /// overshoots its ceiling by more than scheduler noise.
    async fn pause_or_bail(
        &self,
        deadline: Instant,
        timeout: Duration,
        cancel: &CancellationToken,
        operation: &str,
    ) -> Result<(), HandoffError> {
        let now = Instant::now();
        if now >= deadline {
            return StoreTimeoutSnafu {
                operation: format!("{operation} at '{}'", self.path.display()),
                timeout_ms: timeout.as_millis() as u64,
            }
            .fail();
        }

        let pause = self.poll_interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => CancelledSnafu {
                operation: format!("{operation} at '{}'", self.path.display()),
            }
            .fail(),
            _ = tokio::time::sleep(pause) => Ok(()),
        }
    }

    /// Read the record if the location exists.
    ///
    /// Absence is `None`. A present-but-unparseable record is `Corrupted`,
    /// not retried: publication is atomic, so garbage cannot be a torn
    /// write in progress.
    async fn read_record_if_present(&self) -> Result<Option<FixtureRecord>, HandoffError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice::<FixtureRecord>(&bytes) {
                Ok(record) => Ok(Some(record)),
                Err(e) => Err(HandoffError::Corrupted {
                    path: self.path.display().to_string(),
                    reason: e.to_string(),
                }),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context(IoSnafu {
                path: self.path.display().to_string(),
            }),
        }
    }
}

/// Remove store files under `dir` older than `max_age`.
///
/// Covers runs that crashed between publish and release and left an orphan
/// signal file behind. Best-effort: per-file failures are logged and the
/// sweep continues. Returns the number of files removed.
pub async fn scrub_stale(dir: impl AsRef<Path>, prefix: &str, max_age: Duration) -> Result<usize, HandoffError> {
    let dir = dir.as_ref();
    let mut entries = tokio::fs::read_dir(dir).await.context(IoSnafu {
        path: dir.display().to_string(),
    })?;

    let mut removed = 0usize;
    while let Some(entry) = entries.next_entry().await.context(IoSnafu {
        path: dir.display().to_string(),
    })? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(prefix) || !(name.ends_with(".json") || name.ends_with(".json.partial")) {
            continue;
        }

        let age = match entry.metadata().await.and_then(|m| m.modified()) {
            Ok(modified) => modified.elapsed().unwrap_or_default(),
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "scrub: cannot stat store file, skipping");
                continue;
            }
        };
        if age <= max_age {
            continue;
        }

        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => {
                info!(path = %entry.path().display(), age_ms = age.as_millis() as u64, "scrubbed stale store file");
                removed += 1;
            }
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "scrub: removal failed, skipping");
            }
        }
    }

    Ok(removed)
}

/// RAII guard that releases the store on drop.
///
/// The run role holds one of these from the moment it reads the record, so
/// the setup role is unblocked even when an assertion fails or the run
/// unwinds early.
pub struct ReleaseGuard {
    store: FixtureStore,
    released: bool,
}

impl ReleaseGuard {
    /// Guard the given store location.
    pub fn new(store: FixtureStore) -> Self {
        Self { store, released: false }
    }

    /// Explicitly release the store.
    ///
    /// This is called automatically on drop, but can be called explicitly
    /// if you need to handle release errors.
    pub async fn release(mut self) -> Result<(), HandoffError> {
        self.released = true;
        self.store.release().await
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        // Best-effort release so the writer is never left blocked.
        let path = self.store.path.clone();
        let run_id = self.store.run_id.clone();
        tokio::spawn(async move {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(run_id = %run_id, path = %path.display(), "store released on drop"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => debug!(run_id = %run_id, path = %path.display(), error = %e, "store release on drop failed"),
            }
        });
    }
}
