//! Pre-start cleanup of a server left behind by an ungraceful exit.
//!
//! A previous run that was never reaped (orchestrator crash, container restart) keeps
//! the world lock open and the new server refuses to start. Anything still holding the
//! lock is force-terminated and the lock file removed.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::error::SupervisorError;

const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pids (other than our own) with an open descriptor on `lock`.
#[cfg(target_os = "linux")]
pub fn find_lock_holders(lock: &Path) -> Vec<u32> {
    let Ok(target) = std::fs::canonicalize(lock) else {
        return Vec::new();
    };
    let me = std::process::id();
    let Ok(rd) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for e in rd.flatten() {
        let Some(pid) = e.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if pid == me {
            continue;
        }
        if holds(pid, &target) {
            out.push(pid);
        }
    }
    out.sort_unstable();
    out
}

#[cfg(not(target_os = "linux"))]
pub fn find_lock_holders(_lock: &Path) -> Vec<u32> {
    Vec::new()
}

#[cfg(target_os = "linux")]
fn holds(pid: u32, target: &Path) -> bool {
    // Permission errors (other users' processes) simply read as "not holding".
    let Ok(fds) = std::fs::read_dir(format!("/proc/{pid}/fd")) else {
        return false;
    };
    fds.flatten()
        .filter_map(|fd| std::fs::read_link(fd.path()).ok())
        .any(|p| p == target)
}

#[cfg(not(target_os = "linux"))]
fn holds(_pid: u32, _target: &Path) -> bool {
    false
}

fn force_kill(pid: u32) {
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// Kills every holder of `lock`, waits for the descriptors to close and deletes the
/// file. Returns the killed pids.
pub async fn clear_stale_lock(lock: &Path) -> Result<Vec<u32>, SupervisorError> {
    let path: PathBuf = lock.to_path_buf();
    let holders = {
        let path = path.clone();
        tokio::task::spawn_blocking(move || find_lock_holders(&path))
            .await
            .unwrap_or_default()
    };

    for pid in &holders {
        tracing::warn!(pid, lock = %path.display(), "killing stale lock holder");
        force_kill(*pid);
    }

    if !holders.is_empty() {
        let target = std::fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
        let deadline = tokio::time::Instant::now() + RELEASE_TIMEOUT;
        loop {
            let still: Vec<u32> = holders
                .iter()
                .copied()
                .filter(|pid| holds(*pid, &target))
                .collect();
            if still.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(pids = ?still, "stale lock holders did not release in time");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    match tokio::fs::remove_file(&path).await {
        Ok(()) => {
            tracing::info!(lock = %path.display(), "removed stale lock file");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => return Err(SupervisorError::LockCleanup { path, source }),
    }

    Ok(holders)
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::process::Command;

    fn spawn_lock_holder(lock: &Path) -> std::process::Child {
        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg("exec 3<\"$1\"; exec sleep 600")
            .arg("sh")
            .arg(lock)
            .spawn()
            .unwrap();
        for _ in 0..100 {
            if find_lock_holders(lock).contains(&child.id()) {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        child
    }

    #[tokio::test]
    async fn kills_holder_and_removes_lock() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("session.lock");
        std::fs::write(&lock, b"lock").unwrap();
        let mut holder = spawn_lock_holder(&lock);
        assert_eq!(find_lock_holders(&lock), vec![holder.id()]);

        let killed = clear_stale_lock(&lock).await.unwrap();
        assert_eq!(killed, vec![holder.id()]);
        assert!(!lock.exists());

        let status = holder.wait().unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn missing_lock_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let killed = clear_stale_lock(&dir.path().join("session.lock")).await.unwrap();
        assert!(killed.is_empty());
    }

    #[tokio::test]
    async fn unheld_lock_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("session.lock");
        std::fs::write(&lock, b"lock").unwrap();
        assert!(clear_stale_lock(&lock).await.unwrap().is_empty());
        assert!(!lock.exists());
    }
}
