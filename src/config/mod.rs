//! Application configuration and the config-file watcher.
//!
//! [`FrameConfig`] carries the runtime tunables with serde defaults so apps
//! can load it from any config source. [`ConfigWatcher`] polls one external
//! JSON file for write events; the dispatch loop interleaves the poll with
//! message dispatch so startup configuration and later changes share one
//! code path.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tracing::{debug, info};

/// Environment variable with the path to the watched configuration file.
/// Absence is not an error; the watcher is simply inert.
pub const CONFIG_FILE_ENV: &str = "CONFIG_FILE";

/// Errors from reading or parsing the watched configuration file.
///
/// These are reported to the config handler's caller and logged; they never
/// terminate the dispatch loop.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Runtime configuration for a message app.
///
/// The health window and retry bound are conventional defaults, not
/// invariants; tune them per deployment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Address the transport endpoint binds to.
    pub listen_addr: String,
    /// Block construction until the mesh routing table is installed. Set to
    /// false for receive-only apps.
    pub wait_for_ready: bool,
    /// Liveness window for the ingestion-loop healthcheck, in seconds.
    pub health_window_secs: u64,
    /// Default attempt bound for reliable send and return-to-sender.
    pub default_retries: u32,
    /// Bounded wait for one dispatch pop, in milliseconds. Also the
    /// cooperative-cancellation check interval of the dispatch loop.
    pub dispatch_timeout_ms: u64,
    /// Idle pause between drain passes of the ingestion loop, in milliseconds.
    pub drain_idle_ms: u64,
    /// Bounded wait for the ingestion task to exit during stop, in
    /// milliseconds.
    pub join_timeout_ms: u64,
    /// Watched configuration file; `None` leaves the watcher inert.
    pub config_file: Option<PathBuf>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:4562".to_string(),
            wait_for_ready: true,
            health_window_secs: 30,
            default_retries: 100,
            dispatch_timeout_ms: 1000,
            drain_idle_ms: 10,
            join_timeout_ms: 5000,
            config_file: None,
        }
    }
}

impl FrameConfig {
    /// Defaults plus the watched config file path from [`CONFIG_FILE_ENV`].
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            if !path.is_empty() {
                cfg.config_file = Some(PathBuf::from(path));
            }
        }
        cfg
    }

    pub fn health_window(&self) -> Duration {
        Duration::from_secs(self.health_window_secs)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn drain_idle(&self) -> Duration {
        Duration::from_millis(self.drain_idle_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// A pending change on the watched file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigEvent {
    Modified,
}

/// Poll-based watcher over one external configuration file.
///
/// Armed only when the path resolved to an existing file at construction;
/// otherwise every poll returns no events. Content is never cached: each
/// event causes a fresh read and parse via [`ConfigWatcher::read`].
#[derive(Debug)]
pub struct ConfigWatcher {
    path: Option<PathBuf>,
    last_modified: Option<SystemTime>,
}

impl ConfigWatcher {
    pub fn new(path: Option<&Path>) -> Self {
        let path = match path {
            Some(p) if p.is_file() => {
                info!(path = %p.display(), "config watcher armed");
                Some(p.to_path_buf())
            }
            Some(p) => {
                info!(path = %p.display(), "config file does not exist, watcher inert");
                None
            }
            None => {
                debug!("no config file given, watcher inert");
                None
            }
        };
        let last_modified = path
            .as_deref()
            .and_then(|p| std::fs::metadata(p).ok())
            .and_then(|m| m.modified().ok());
        Self {
            path,
            last_modified,
        }
    }

    pub fn armed(&self) -> bool {
        self.path.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Non-blocking poll for write events since the previous check.
    pub fn config_check(&mut self) -> Vec<ConfigEvent> {
        let Some(path) = self.path.as_deref() else {
            return Vec::new();
        };
        match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(mtime) if Some(mtime) != self.last_modified => {
                self.last_modified = Some(mtime);
                vec![ConfigEvent::Modified]
            }
            // unchanged, or the file vanished mid-flight
            _ => Vec::new(),
        }
    }

    /// Re-read and re-parse the watched file as JSON.
    pub fn read(&self) -> Result<serde_json::Value, ConfigError> {
        let Some(path) = self.path.as_deref() else {
            return Err(ConfigError::Io {
                path: PathBuf::new(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "watcher is inert"),
            });
        };
        let raw = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
