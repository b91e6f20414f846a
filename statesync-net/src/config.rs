use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{SyncError, SyncResult};

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

const FALLBACK_FLUSH_DELAY_MS: u64 = 0;
const FALLBACK_SNAPSHOT_TIMEOUT_MS: u64 = 2_000;
const FALLBACK_BIND_ADDR: &str = "127.0.0.1:7411";
const FALLBACK_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    sync: SyncSection,
    #[serde(default)]
    transport: TransportSection,
}

#[derive(Deserialize, Default)]
struct SyncSection {
    flush_delay_ms: Option<u64>,
    snapshot_timeout_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct TransportSection {
    bind_addr: Option<String>,
    max_frame_bytes: Option<usize>,
}

/// Runtime knobs for one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Delay between the first enqueue of a turn and the batch flush.
    pub flush_delay: Duration,
    /// How long a joining process waits for a snapshot before retrying.
    pub snapshot_timeout: Duration,
    /// Address the Worker's TCP hub listens on.
    pub bind_addr: String,
    /// Largest accepted TCP frame.
    pub max_frame_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let base: ConfigFile = toml::from_str(DEFAULT_CONFIG).unwrap_or_default();
        Self::resolve(base)
    }
}

impl SyncConfig {
    /// Built-in defaults overlaid with the user config, if there is one.
    pub fn load() -> Self {
        Self::load_with(user_config_path().as_deref())
    }

    /// Built-in defaults overlaid with `path`. A missing or malformed file
    /// is logged and ignored.
    pub fn load_with(path: Option<&Path>) -> Self {
        let mut base: ConfigFile = toml::from_str(DEFAULT_CONFIG).unwrap_or_default();

        if let Some(path) = path.filter(|p| p.exists()) {
            match std::fs::read_to_string(path) {
                Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
                    Ok(user) => merge(&mut base, user),
                    Err(e) => {
                        log::warn!(target: "config", "ignoring malformed config {}: {}", path.display(), e)
                    }
                },
                Err(e) => {
                    log::warn!(target: "config", "could not read config {}: {}", path.display(), e)
                }
            }
        }

        Self::resolve(base)
    }

    /// Parse a complete config document, failing on malformed input.
    pub fn from_toml_str(contents: &str) -> SyncResult<Self> {
        let mut base: ConfigFile = toml::from_str(DEFAULT_CONFIG).unwrap_or_default();
        let user: ConfigFile =
            toml::from_str(contents).map_err(|e| SyncError::Config(e.to_string()))?;
        merge(&mut base, user);
        Ok(Self::resolve(base))
    }

    fn resolve(file: ConfigFile) -> Self {
        Self {
            flush_delay: Duration::from_millis(
                file.sync
                    .flush_delay_ms
                    .unwrap_or(FALLBACK_FLUSH_DELAY_MS)
                    .min(1_000),
            ),
            snapshot_timeout: Duration::from_millis(
                file.sync
                    .snapshot_timeout_ms
                    .unwrap_or(FALLBACK_SNAPSHOT_TIMEOUT_MS)
                    .clamp(50, 60_000),
            ),
            bind_addr: file
                .transport
                .bind_addr
                .unwrap_or_else(|| FALLBACK_BIND_ADDR.to_string()),
            max_frame_bytes: file
                .transport
                .max_frame_bytes
                .unwrap_or(FALLBACK_MAX_FRAME_BYTES)
                .clamp(1024, 100_000_000),
        }
    }
}

pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("statesync").join("config.toml"))
}

fn merge(base: &mut ConfigFile, user: ConfigFile) {
    if user.sync.flush_delay_ms.is_some() {
        base.sync.flush_delay_ms = user.sync.flush_delay_ms;
    }
    if user.sync.snapshot_timeout_ms.is_some() {
        base.sync.snapshot_timeout_ms = user.sync.snapshot_timeout_ms;
    }
    if user.transport.bind_addr.is_some() {
        base.transport.bind_addr = user.transport.bind_addr;
    }
    if user.transport.max_frame_bytes.is_some() {
        base.transport.max_frame_bytes = user.transport.max_frame_bytes;
    }
}
