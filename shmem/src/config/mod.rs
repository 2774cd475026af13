use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::errors::Result;

pub const DEFAULT_SHM_DIR: &str = "/dev/shm";
pub const DEFAULT_REPO_PATH: &str = "/etc/sysrepo";

/// Roots and timeouts shared by every component. Built once at startup and
/// handed around by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SrConfig {
    /// Directory holding the subscription segments.
    pub shm_dir: PathBuf,
    /// Directory holding the event pipes.
    pub repo_path: PathBuf,
    pub sub_event_loop_timeout_ms: u32,
    pub rwlock_read_timeout_ms: u32,
    pub shm_perm: u32,
}

impl Default for SrConfig {
    fn default() -> Self {
        SrConfig {
            shm_dir: PathBuf::from(DEFAULT_SHM_DIR),
            repo_path: PathBuf::from(DEFAULT_REPO_PATH),
            sub_event_loop_timeout_ms: 2000,
            rwlock_read_timeout_ms: 500,
            shm_perm: 0o600,
        }
    }
}

impl SrConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<SrConfig> {
        Ok(confy::load_path(path)?)
    }

    /// Rooted at a single directory, segments and pipes side by side.
    pub fn with_root<P: AsRef<Path>>(root: P) -> SrConfig {
        SrConfig {
            shm_dir: root.as_ref().to_path_buf(),
            repo_path: root.as_ref().to_path_buf(),
            ..SrConfig::default()
        }
    }

    #[inline]
    pub fn sub_event_loop_timeout(&self) -> Duration {
        Duration::from_millis(self.sub_event_loop_timeout_ms as u64)
    }

    #[inline]
    pub fn rwlock_read_timeout(&self) -> Duration {
        Duration::from_millis(self.rwlock_read_timeout_ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn load_partial_file_keeps_defaults() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("srshm.toml");
        fs::write(&path, "shm_dir = \"/tmp/sr\"\nrwlock_read_timeout_ms = 50\n").unwrap();

        let cfg = SrConfig::load(&path)?;
        assert_eq!(cfg.shm_dir, PathBuf::from("/tmp/sr"));
        assert_eq!(cfg.rwlock_read_timeout(), Duration::from_millis(50));
        assert_eq!(cfg.repo_path, PathBuf::from(DEFAULT_REPO_PATH));
        assert_eq!(cfg.sub_event_loop_timeout_ms, 2000);
        Ok(())
    }

    #[test]
    fn with_root_shares_directory() {
        let cfg = SrConfig::with_root("/run/sr");
        assert_eq!(cfg.shm_dir, cfg.repo_path);
        assert_eq!(cfg.shm_perm, 0o600);
    }
}
