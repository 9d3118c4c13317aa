//! Loading and atomic persistence of the daemon's JSON config file.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use kvmd_protocol::KvmConfig;

pub const DEFAULT_CONFIG_PATH: &str = "/userdata/kvm_config.json";

/// Load configuration from a JSON file at the given path.
/// If the file doesn't exist, returns default configuration — the daemon
/// persists it on first successful write rather than failing startup.
pub fn load_config(path: &Path) -> Result<KvmConfig> {
    if !path.exists() {
        tracing::warn!(
            path = %path.display(),
            "Config file not found, using defaults"
        );
        return Ok(KvmConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: KvmConfig =
        serde_json::from_str(&contents).with_context(|| "Failed to parse config JSON")?;

    tracing::info!(path = %path.display(), "Loaded config");
    Ok(config)
}

/// Serializes writes to the on-disk config file behind a mutex and performs
/// atomic write-to-temp + rename with 0600 permissions, per the ownership
/// rule that the config store exclusively owns the file.
pub struct ConfigStore {
    path: PathBuf,
    current: Mutex<KvmConfig>,
}

impl ConfigStore {
    pub fn new(path: PathBuf, initial: KvmConfig) -> Self {
        Self {
            path,
            current: Mutex::new(initial),
        }
    }

    pub fn snapshot(&self) -> KvmConfig {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Apply `mutate` to the in-memory config and persist the result.
    /// Writes to a `.tmp` sibling then renames, so a crash mid-write never
    /// leaves a truncated config on disk.
    pub fn update(&self, mutate: impl FnOnce(&mut KvmConfig)) -> Result<()> {
        let mut guard = self.current.lock().unwrap_or_else(|e| e.into_inner());
        mutate(&mut guard);
        persist(&self.path, &guard)?;
        Ok(())
    }
}

fn persist(path: &Path, config: &KvmConfig) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
    }

    let data = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
    let tmp_path = path.with_extension("json.tmp");

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&tmp_path)
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    file.write_all(data.as_bytes())?;
    file.sync_all().ok();
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to rename {} into place", path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_config(Path::new("/nonexistent/kvm_config.json")).unwrap();
        assert_eq!(config.server.http_port, 80);
    }

    #[test]
    fn store_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("kvmd-config-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("kvm_config.json");
        let store = ConfigStore::new(path.clone(), KvmConfig::default());
        store
            .update(|cfg| cfg.cloud.token = Some("tok".to_string()))
            .unwrap();

        let reloaded = load_config(&path).unwrap();
        assert_eq!(reloaded.cloud.token.as_deref(), Some("tok"));

        let perms = std::fs::metadata(&path).unwrap().permissions();
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(perms.mode() & 0o777, 0o600);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
