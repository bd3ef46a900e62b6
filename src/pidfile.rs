//! Minimal PID-file singleton guard: refuses to start a
//! second daemon instance against the same pidfile path, and removes
//! the file on clean shutdown.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("another instance is already running (pid {0})")]
    AlreadyRunning(u32),
    #[error("failed to access pidfile {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Creates the pidfile, failing if a live process already holds it.
    /// A pidfile naming a process that is no longer running is treated
    /// as stale and silently replaced.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, PidFileError> {
        let path = path.into();

        if let Ok(contents) = std::fs::read_to_string(&path) {
            if let Ok(pid) = contents.trim().parse::<u32>() {
                if process_is_alive(pid) {
                    return Err(PidFileError::AlreadyRunning(pid));
                }
            }
        }

        std::fs::write(&path, std::process::id().to_string())
            .map_err(|source| PidFileError::Io { path: path.clone(), source })?;

        Ok(PidFile { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(target_os = "linux")]
fn process_is_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_is_alive(_pid: u32) -> bool {
    // No portable liveness check off Linux; assume stale so a crashed
    // daemon's pidfile never wedges a restart.
    false
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn acquire_writes_current_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obsdaemon.pid");
        let guard = PidFile::acquire(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn acquire_replaces_stale_pidfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obsdaemon.pid");
        std::fs::write(&path, "999999999").unwrap();
        let guard = PidFile::acquire(&path);
        assert!(guard.is_ok());
    }
}
