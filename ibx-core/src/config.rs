use crate::error::{IbxError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "IBX_";
/// Thirty days.
pub const MAX_SESSION_TTL_SECS: u64 = 30 * 24 * 3600;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Directory scanned for backup bundles.
    pub backup_root: PathBuf,
    /// Parent of the per-download sandboxes.
    pub sandbox_root: PathBuf,
    /// Where artifact databases are written by the decrypt step.
    pub decrypted_root: PathBuf,
    /// Persistent per-backup attachment cache.
    pub extraction_root: PathBuf,
    /// Registry state (backups.json).
    pub state_dir: PathBuf,
    pub session_ttl_secs: u64,
    pub index_batch_size: usize,
    /// SQLite file for normalized records; in-memory sink when unset.
    pub records_db: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backup_root: PathBuf::from("/data/ios_backups"),
            sandbox_root: PathBuf::from("/tmp/ibx"),
            decrypted_root: PathBuf::from("/data/decrypted_backups"),
            extraction_root: PathBuf::from("/data/extracted"),
            state_dir: PathBuf::from("/data/ibx"),
            session_ttl_secs: 3600,
            index_batch_size: 500,
            records_db: None,
        }
    }
}

impl Settings {
    /// Every working directory under `root`; backups are read from `root/backups`.
    pub fn rooted(root: &Path) -> Self {
        Self {
            backup_root: root.join("backups"),
            sandbox_root: root.join("sandbox"),
            decrypted_root: root.join("decrypted"),
            extraction_root: root.join("extracted"),
            state_dir: root.join("state"),
            ..Self::default()
        }
    }

    /// Defaults, then the optional JSON file, then `IBX_*` variables.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut settings = match file {
            Some(path) => {
                let json = std::fs::read_to_string(path)?;
                serde_json::from_str(&json)
                    .map_err(|e| IbxError::Config(format!("{}: {e}", path.display())))?
            }
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("BACKUP_ROOT") {
            self.backup_root = v.into();
        }
        if let Some(v) = var("SANDBOX_ROOT") {
            self.sandbox_root = v.into();
        }
        if let Some(v) = var("DECRYPTED_ROOT") {
            self.decrypted_root = v.into();
        }
        if let Some(v) = var("EXTRACTION_ROOT") {
            self.extraction_root = v.into();
        }
        if let Some(v) = var("STATE_DIR") {
            self.state_dir = v.into();
        }
        if let Some(v) = var("RECORDS_DB") {
            self.records_db = Some(v.into());
        }
        if let Some(v) = var("SESSION_TTL_SECS") {
            self.session_ttl_secs = parse_number("SESSION_TTL_SECS", &v)?;
        }
        if let Some(v) = var("INDEX_BATCH_SIZE") {
            self.index_batch_size = parse_number("INDEX_BATCH_SIZE", &v)?;
        }
        if self.session_ttl_secs == 0 || self.session_ttl_secs > MAX_SESSION_TTL_SECS {
            return Err(IbxError::Config(format!(
                "session_ttl_secs must be between 1 and {MAX_SESSION_TTL_SECS}, got {}",
                self.session_ttl_secs
            )));
        }
        if self.index_batch_size == 0 {
            return Err(IbxError::Config("index_batch_size must be positive".into()));
        }
        Ok(())
    }

    pub fn registry_path(&self) -> PathBuf {
        self.state_dir.join("backups.json")
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| IbxError::Config(format!("{ENV_PREFIX}{name}: not a number: {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("ibx.json");
        std::fs::write(&file, r#"{"backup_root":"/srv/backups","session_ttl_secs":60}"#).unwrap();

        let mut s: Settings =
            serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
        assert_eq!(s.backup_root, PathBuf::from("/srv/backups"));
        assert_eq!(s.session_ttl_secs, 60);
        assert_eq!(s.index_batch_size, 500);

        let env: HashMap<String, String> = [
            ("IBX_SESSION_TTL_SECS", "120"),
            ("IBX_RECORDS_DB", "/srv/records.db"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        s.apply_env(|k| env.get(k).cloned()).unwrap();
        assert_eq!(s.session_ttl_secs, 120);
        assert_eq!(s.records_db, Some(PathBuf::from("/srv/records.db")));
    }

    #[test]
    fn bad_numbers_are_rejected() {
        let mut s = Settings::default();
        let err = s
            .apply_env(|k| (k == "IBX_INDEX_BATCH_SIZE").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, IbxError::Config(_)));
    }

    #[test]
    fn session_ttl_is_bounded() {
        let mut s = Settings::default();
        let err = s
            .apply_env(|k| (k == "IBX_SESSION_TTL_SECS").then(|| u64::MAX.to_string()))
            .unwrap_err();
        assert!(matches!(err, IbxError::Config(_)));

        let mut s = Settings {
            session_ttl_secs: 0,
            ..Settings::default()
        };
        assert!(s.apply_env(|_| None).is_err());

        let mut s = Settings::default();
        s.apply_env(|k| (k == "IBX_SESSION_TTL_SECS").then(|| MAX_SESSION_TTL_SECS.to_string()))
            .unwrap();
        assert_eq!(s.session_ttl_secs, MAX_SESSION_TTL_SECS);
    }
}
