//! Process-wide singleton lock. A second instance must refuse to start.

use crate::domain::errors::LockError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock file, writing this process's PID. An existing lock
    /// held by a live process refuses startup; a stale lock (dead PID or
    /// unreadable content) is reclaimed.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path: PathBuf = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            match fs::read_to_string(&path)
                .ok()
                .and_then(|raw| raw.trim().parse::<u32>().ok())
            {
                Some(pid) if pid != std::process::id() && process_alive(pid) => {
                    return Err(LockError::AlreadyRunning(pid));
                }
                Some(pid) => {
                    warn!("reclaiming stale lock file held by dead pid {pid}");
                }
                None => {
                    warn!("reclaiming unreadable lock file at {}", path.display());
                }
            }
        }

        fs::write(&path, std::process::id().to_string())?;
        info!("acquired instance lock at {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("failed to remove lock file {}: {e}", self.path.display());
        } else {
            info!("released instance lock");
        }
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // Without a liveness probe, treat any existing lock as live.
    true
}
