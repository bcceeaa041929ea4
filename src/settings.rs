use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::FlowError;
use crate::history::DEFAULT_MAX_HISTORY_ENTRIES;

const SETTINGS_VERSION: u32 = 1;
const SETTINGS_FILE: &str = "paramflow.json";

// ── Orchestrator settings ────────────────────────────────────────

/// Tunables of an [`Orchestrator`](crate::store::Orchestrator). Every field
/// has a default so older or partial files still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, JsonSchema)]
#[ts(export)]
pub struct OrchestratorSettings {
    #[serde(default = "settings_version")]
    pub version: u32,
    /// Oldest history entries are dropped beyond this.
    #[serde(default = "default_max_history_entries")]
    pub max_history_entries: usize,
    /// Delay between the first auto-mode edit of a batch and its accept.
    #[serde(default)]
    pub batch_window_ms: u64,
    /// Ask sessions for default exports in the same customize round-trip.
    #[serde(default)]
    pub request_default_exports: bool,
    /// Accept/reject mode for parameters registered without a selector.
    #[serde(default)]
    pub default_accept_reject_mode: bool,
}

fn settings_version() -> u32 {
    SETTINGS_VERSION
}

fn default_max_history_entries() -> usize {
    DEFAULT_MAX_HISTORY_ENTRIES
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            max_history_entries: DEFAULT_MAX_HISTORY_ENTRIES,
            batch_window_ms: 0,
            request_default_exports: false,
            default_accept_reject_mode: false,
        }
    }
}

impl OrchestratorSettings {
    pub fn batch_window(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.batch_window_ms)
    }
}

pub fn settings_path(config_dir: &Path) -> PathBuf {
    config_dir.join(SETTINGS_FILE)
}

/// Load settings from `config_dir`. Returns None if no settings file exists
/// or it cannot be parsed.
pub fn load_settings(config_dir: &Path) -> Option<OrchestratorSettings> {
    let path = settings_path(config_dir);
    if !path.exists() {
        return None;
    }
    match read_json::<OrchestratorSettings>(&path) {
        Ok(settings) => Some(settings),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable settings");
            None
        }
    }
}

pub fn save_settings(config_dir: &Path, settings: &OrchestratorSettings) -> Result<(), FlowError> {
    fs::create_dir_all(config_dir)?;
    write_json(&settings_path(config_dir), settings)
}

// ── File IO ──────────────────────────────────────────────────────

static FILE_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Write-to-temp-then-rename under a per-path lock. The previous file, if
/// any, is kept as a `.bak` sibling.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), FlowError> {
    let lock = Arc::clone(
        FILE_LOCKS
            .lock()
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(()))),
    );
    let _guard = lock.lock();

    let file_name = path.file_name().unwrap_or_default();
    let mut tmp_name = OsString::from(file_name);
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(&tmp_name);
    let mut bak_name = OsString::from(file_name);
    bak_name.push(".bak");
    let bak_path = path.with_file_name(&bak_name);

    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    if path.exists() {
        let _ = fs::rename(path, &bak_path);
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), FlowError> {
    let json = serde_json::to_string_pretty(value)?;
    atomic_write(path, json.as_bytes())
}

pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, FlowError> {
    let data = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_round_trip() {
        let dir = std::env::temp_dir().join("paramflow_test_settings");
        let _ = fs::remove_dir_all(&dir);

        let settings = OrchestratorSettings {
            max_history_entries: 10,
            batch_window_ms: 250,
            ..OrchestratorSettings::default()
        };
        save_settings(&dir, &settings).unwrap();
        assert_eq!(load_settings(&dir).expect("should load"), settings);

        // A second save keeps the first as a backup.
        save_settings(&dir, &OrchestratorSettings::default()).unwrap();
        assert!(dir.join("paramflow.json.bak").exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = std::env::temp_dir().join("paramflow_test_partial_settings");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        fs::write(settings_path(&dir), r#"{"batch_window_ms": 40}"#).unwrap();

        let loaded = load_settings(&dir).expect("should load");
        assert_eq!(loaded.batch_window_ms, 40);
        assert_eq!(loaded.max_history_entries, DEFAULT_MAX_HISTORY_ENTRIES);
        assert_eq!(loaded.version, SETTINGS_VERSION);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = std::env::temp_dir().join("paramflow_test_no_settings");
        let _ = fs::remove_dir_all(&dir);
        assert!(load_settings(&dir).is_none());
    }

    #[test]
    fn test_unparseable_file_returns_none() {
        let dir = std::env::temp_dir().join("paramflow_test_bad_settings");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        fs::write(settings_path(&dir), "{not json").unwrap();
        assert!(load_settings(&dir).is_none());
        let _ = fs::remove_dir_all(&dir);
    }
}
