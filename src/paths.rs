//! Per-user filesystem layout.
//!
//! Everything the CLI and daemon persist lives under `~/.hl/`. Paths are
//! derived once at startup and threaded through; the directory itself is
//! created lazily on first write.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const SOCKET_FILE: &str = "server.sock";
pub const PID_FILE: &str = "server.pid";
pub const LOG_FILE: &str = "server.log";
pub const SERVER_JSON_FILE: &str = "server.json";
pub const USER_CONFIG_FILE: &str = "user-config.json";

#[derive(Debug, Clone)]
pub struct HlPaths {
    pub dir: PathBuf,
    pub socket: PathBuf,
    pub pid: PathBuf,
    pub log: PathBuf,
    pub server_json: PathBuf,
    pub user_config: PathBuf,
}

impl HlPaths {
    /// Resolve the layout under `$HOME/.hl`.
    pub fn resolve() -> Result<Self> {
        let home = std::env::var("HOME")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .context("HOME is not set")?;
        Ok(Self::in_dir(Path::new(&home).join(".hl")))
    }

    /// Build the layout rooted at an explicit directory.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            socket: dir.join(SOCKET_FILE),
            pid: dir.join(PID_FILE),
            log: dir.join(LOG_FILE),
            server_json: dir.join(SERVER_JSON_FILE),
            user_config: dir.join(USER_CONFIG_FILE),
            dir,
        }
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create {}", self.dir.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted_in_dir() {
        let p = HlPaths::in_dir("/tmp/hl-test");
        assert_eq!(p.socket, PathBuf::from("/tmp/hl-test/server.sock"));
        assert_eq!(p.pid, PathBuf::from("/tmp/hl-test/server.pid"));
        assert_eq!(p.log, PathBuf::from("/tmp/hl-test/server.log"));
        assert_eq!(p.user_config, PathBuf::from("/tmp/hl-test/user-config.json"));
    }

    #[test]
    fn ensure_dir_creates_nested() {
        let tmp = tempfile::tempdir().unwrap();
        let p = HlPaths::in_dir(tmp.path().join("nested").join(".hl"));
        p.ensure_dir().unwrap();
        assert!(p.dir.is_dir());
    }
}
