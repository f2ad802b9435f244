use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::now_rfc3339;
use crate::log_warn;

/// Identity stamped into the lock file by the holding scheduler, so a
/// contending process can say who is running and since when. Purely
/// diagnostic: mutual exclusion comes from the OS file lock, never
/// from this content.
#[derive(Serialize, Deserialize, Debug)]
struct HolderStamp {
    pid: u32,
    worker: String,
    started: String,
}

/// Exclusive scheduler lock for one project.
///
/// The orchestrator is single-host; one scheduler per project at a
/// time, and cross-host locking is out of scope. The OS releases the
/// flock when the fslock handle drops (including on crash), so there
/// is nothing to clean up besides the stale stamp, which the next
/// holder overwrites.
#[must_use = "the scheduler lock is released when SchedulerLock is dropped"]
pub struct SchedulerLock {
    _file: fslock::LockFile,
    path: PathBuf,
}

impl std::fmt::Debug for SchedulerLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerLock")
            .field("path", &self.path)
            .finish()
    }
}

/// Acquire the scheduler lock under the runtime dir, stamping this
/// process as the holder.
///
/// On contention the existing stamp is read back to produce an
/// actionable message naming the holding worker.
pub fn acquire(runtime_dir: &Path, worker: &str) -> Result<SchedulerLock, String> {
    fs::create_dir_all(runtime_dir)
        .map_err(|e| format!("Failed to create {}: {}", runtime_dir.display(), e))?;

    let path = runtime_dir.join("scheduler.lock");
    let mut file = fslock::LockFile::open(&path)
        .map_err(|e| format!("Failed to open lock file {}: {}", path.display(), e))?;

    let acquired = file
        .try_lock()
        .map_err(|e| format!("Failed to acquire scheduler lock: {}", e))?;
    if !acquired {
        return Err(describe_holder(&path));
    }

    // We hold the lock; stamp our identity over whatever a previous
    // holder left behind. Failure to stamp only degrades diagnostics.
    let stamp = HolderStamp {
        pid: std::process::id(),
        worker: worker.to_string(),
        started: now_rfc3339(),
    };
    match serde_json::to_string(&stamp) {
        Ok(json) => {
            if let Err(e) = fs::write(&path, json) {
                log_warn!("could not stamp scheduler lock: {}", e);
            }
        }
        Err(e) => log_warn!("could not serialize lock stamp: {}", e),
    }

    Ok(SchedulerLock { _file: file, path })
}

/// Build the contention error from the holder stamp, if readable.
fn describe_holder(path: &Path) -> String {
    let stamp = fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str::<HolderStamp>(&s).ok());

    match stamp {
        Some(stamp) if is_pid_alive(stamp.pid) => format!(
            "A scheduler is already running for this project: {} (PID {}, since {})",
            stamp.worker, stamp.pid, stamp.started
        ),
        Some(stamp) => format!(
            "Scheduler lock {} is held, but the recorded holder {} (PID {}) is not alive. \
             The OS drops the lock with its process, so another live process must hold it; \
             check for a scheduler started after {}",
            path.display(),
            stamp.worker,
            stamp.pid,
            stamp.started
        ),
        None => format!(
            "Another process holds the scheduler lock at {}",
            path.display()
        ),
    }
}

fn is_pid_alive(pid: u32) -> bool {
    // Signal 0 probes for existence without delivering anything.
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_stamps_the_holder() {
        let dir = tempfile::tempdir().unwrap();
        let lock = acquire(dir.path(), "maestro-test").expect("acquire");

        let stamp: HolderStamp =
            serde_json::from_str(&fs::read_to_string(dir.path().join("scheduler.lock")).unwrap())
                .expect("stamp is valid JSON");
        assert_eq!(stamp.pid, std::process::id());
        assert_eq!(stamp.worker, "maestro-test");
        drop(lock);
    }

    #[test]
    fn contention_names_the_running_worker() {
        let dir = tempfile::tempdir().unwrap();
        let _held = acquire(dir.path(), "maestro-first").expect("first acquire");

        let err = acquire(dir.path(), "maestro-second").unwrap_err();
        assert!(err.contains("maestro-first"), "error: {}", err);
        assert!(err.contains("already running"), "error: {}", err);
    }

    #[test]
    fn released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock = acquire(dir.path(), "maestro-a").expect("first acquire");
        drop(lock);
        // The flock went with the handle; a new holder gets in.
        let _lock = acquire(dir.path(), "maestro-b").expect("second acquire");
    }

    #[test]
    fn stale_stamp_under_a_live_lock_is_called_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.lock");

        // Hold the flock on one handle, then plant a stamp naming a
        // long-dead pid: the message must not claim the lock is free.
        let mut holder = fslock::LockFile::open(&path).unwrap();
        assert!(holder.try_lock().unwrap());
        let stale = HolderStamp {
            pid: 99_999_999,
            worker: "maestro-ghost".to_string(),
            started: now_rfc3339(),
        };
        fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        let err = acquire(dir.path(), "maestro-live").unwrap_err();
        assert!(err.contains("not alive"), "error: {}", err);
        assert!(err.contains("maestro-ghost"), "error: {}", err);
    }
}
