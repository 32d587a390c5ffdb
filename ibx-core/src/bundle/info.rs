use crate::error::{IbxError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Device metadata stored as `Info.json` at the bundle root.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BundleInfo {
    pub unique_device_id: Option<String>,
    pub display_name: Option<String>,
    pub device_name: Option<String>,
    pub product_version: Option<String>,
    pub is_encrypted: bool,
}

impl BundleInfo {
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| IbxError::format(format!("{}: {e}", path.display())))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        crate::util::fsx::write_json_atomic(path, self)
    }

    /// Falls back to the directory name when the device did not record a
    /// usable id. Ids double as directory names, so separators are refused.
    pub fn backup_id(&self, dir_name: &str) -> String {
        self.unique_device_id
            .as_deref()
            .map(str::trim)
            .filter(|s| is_path_component(s))
            .unwrap_or(dir_name)
            .to_string()
    }

    pub fn label(&self, dir_name: &str) -> String {
        self.display_name
            .as_deref()
            .or(self.device_name.as_deref())
            .unwrap_or(dir_name)
            .to_string()
    }
}

fn is_path_component(s: &str) -> bool {
    !s.is_empty() && s != "." && s != ".." && !s.contains(['/', '\\', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_falls_back_to_directory_name() {
        let info: BundleInfo = serde_json::from_str(r#"{"device_name":"Pixel's iPhone"}"#).unwrap();
        assert_eq!(info.backup_id("00008030-ABC"), "00008030-ABC");
        assert_eq!(info.label("00008030-ABC"), "Pixel's iPhone");
        assert!(!info.is_encrypted);

        let info = BundleInfo {
            unique_device_id: Some("udid-1".into()),
            display_name: Some("Work phone".into()),
            ..BundleInfo::default()
        };
        assert_eq!(info.backup_id("dir"), "udid-1");

        let hostile = BundleInfo {
            unique_device_id: Some("../../etc".into()),
            ..BundleInfo::default()
        };
        assert_eq!(hostile.backup_id("dir"), "dir");
        assert_eq!(info.label("dir"), "Work phone");
    }
}
