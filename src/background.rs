//! Cross-process consolidation coordination: a hashed, file-based
//! non-blocking exclusive lock per database path, and a detached worker
//! process that reacquires it and runs one consolidation pass.

use std::collections::hash_map::DefaultHasher;
use std::fs::{File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use fs2::FileExt;
use tracing::{info, warn};

use crate::error::{MemoryError, Result};

/// State directory holding lock files, overridable via
/// [`crate::config::MemoryConfig::lock_state_dir`].
fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".memtiers")
}

/// Deterministic lock file path for a given database path: a hash of the
/// canonicalized (or as-given, if canonicalization fails) path, so two
/// processes pointed at the same database always agree on the lock file
/// regardless of how the path was spelled.
#[must_use]
pub fn consolidation_lock_path(db_path: &Path, state_dir: Option<&Path>) -> PathBuf {
    let canonical = db_path.canonicalize().unwrap_or_else(|_| db_path.to_path_buf());
    let mut hasher = DefaultHasher::new();
    canonical.hash(&mut hasher);
    let hash = hasher.finish();
    let dir = state_dir.map_or_else(default_state_dir, Path::to_path_buf);
    dir.join(format!(".consolidate-{hash:016x}.lock"))
}

fn open_lock_file(lock_path: &Path) -> Result<File> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)
        .map_err(MemoryError::from)
}

/// Non-blocking check: `true` if another process currently holds the
/// consolidation lock for `db_path`. Acquires then immediately releases the
/// lock when it is free, so this never itself blocks a concurrent spawn.
pub fn is_consolidation_running(db_path: &Path, state_dir: Option<&Path>) -> Result<bool> {
    let lock_path = consolidation_lock_path(db_path, state_dir);
    let file = open_lock_file(&lock_path)?;
    match file.try_lock_exclusive() {
        Ok(()) => {
            FileExt::unlock(&file)?;
            Ok(false)
        }
        Err(_) => Ok(true),
    }
}

/// Spawn a detached background consolidation worker for `db_path`, running
/// `exe` with `worker_args` (expected to invoke this crate's worker
/// entrypoint). Returns `false` without spawning if consolidation is
/// already running for this database; `true` once the process has been
/// launched (not once it has finished).
pub fn spawn_background_consolidation(
    db_path: &Path,
    state_dir: Option<&Path>,
    exe: &Path,
    worker_args: &[String],
    log_path: &Path,
) -> Result<bool> {
    if is_consolidation_running(db_path, state_dir)? {
        info!(db = %db_path.display(), "consolidation already running, skipping spawn");
        return Ok(false);
    }

    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(MemoryError::from)?;
    let log_file_err = log_file.try_clone().map_err(MemoryError::from)?;

    let mut command = Command::new(exe);
    command
        .args(worker_args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_err));

    detach(&mut command);

    command.spawn().map_err(MemoryError::from)?;
    info!(db = %db_path.display(), "spawned background consolidation worker");
    Ok(true)
}

#[cfg(unix)]
fn detach(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    // SAFETY: setsid() is async-signal-safe and the only thing this hook
    // does; it detaches the child into its own session so it outlives the
    // spawning process's process group.
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn detach(_command: &mut Command) {}

/// Entry point run inside the detached worker process: install a JSON-lines
/// file subscriber (the one place in this crate that installs a global
/// `tracing` subscriber, since the worker has no caller to forward events
/// to), reacquire the lock, and run one `consolidate(force = false)` pass.
pub mod worker {
    use std::fs::OpenOptions;
    use std::path::Path;
    use std::sync::Arc;

    use fs2::FileExt;
    use tracing::{error, info};
    use tracing_subscriber::fmt::format::FmtSpan;

    use crate::consolidation::Consolidator;
    use crate::error::Result;

    use super::{consolidation_lock_path, open_lock_file};

    /// Install a JSON-lines subscriber writing to `log_path`, appending.
    pub fn install_worker_logging(log_path: &Path) -> Result<()> {
        let file = Arc::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .map_err(crate::error::MemoryError::from)?,
        );
        tracing_subscriber::fmt()
            .json()
            .with_writer(move || file.try_clone().expect("clone worker log file handle"))
            .with_span_events(FmtSpan::CLOSE)
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
        Ok(())
    }

    /// Reacquire the per-database lock (returning early, without error, if
    /// another process beat us to it) and run one consolidation pass.
    pub async fn run(
        db_path: &Path,
        state_dir: Option<&Path>,
        consolidator: &Consolidator,
    ) -> Result<()> {
        let lock_path = consolidation_lock_path(db_path, state_dir);
        let file = open_lock_file(&lock_path)?;
        if file.try_lock_exclusive().is_err() {
            info!("lock already held, exiting without consolidating");
            return Ok(());
        }

        let result = consolidator.consolidate(false).await;
        match &result {
            Ok(r) => info!(
                created = r.concepts_created,
                updated = r.concepts_updated,
                "background consolidation finished"
            ),
            Err(e) => error!("background consolidation failed: {e}"),
        }

        FileExt::unlock(&file)?;
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    fn lock_path_is_deterministic_for_same_db_path() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("mem.db");
        std::fs::write(&db, b"").unwrap();
        let a = consolidation_lock_path(&db, Some(dir.path()));
        let b = consolidation_lock_path(&db, Some(dir.path()));
        assert_eq!(a, b);
    }

    #[test]
    #[serial]
    fn is_consolidation_running_reflects_held_lock() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("mem.db");
        std::fs::write(&db, b"").unwrap();

        assert!(!is_consolidation_running(&db, Some(dir.path())).unwrap());

        let lock_path = consolidation_lock_path(&db, Some(dir.path()));
        let file = open_lock_file(&lock_path).unwrap();
        file.try_lock_exclusive().unwrap();

        assert!(is_consolidation_running(&db, Some(dir.path())).unwrap());

        fs2::FileExt::unlock(&file).unwrap();
        assert!(!is_consolidation_running(&db, Some(dir.path())).unwrap());
    }
}
