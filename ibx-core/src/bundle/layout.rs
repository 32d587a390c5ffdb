use crate::crypto::hex::is_file_id;
use crate::error::{IbxError, Result};
use std::path::{Path, PathBuf};

pub const INFO_FILE: &str = "Info.json";
pub const KEYBAG_FILE: &str = "Keybag.cbor";
pub const MANIFEST_DB: &str = "Manifest.db";

/// Paths inside one backup bundle directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BundleLayout {
    root: PathBuf,
}

impl BundleLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn info_path(&self) -> PathBuf {
        self.root.join(INFO_FILE)
    }

    pub fn keybag_path(&self) -> PathBuf {
        self.root.join(KEYBAG_FILE)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_DB)
    }

    /// Blobs are sharded by the first two hex digits of their id.
    pub fn blob_path(&self, file_id: &str) -> Result<PathBuf> {
        if !is_file_id(file_id) {
            return Err(IbxError::NotFound(format!("file {file_id}")));
        }
        Ok(self.root.join(&file_id[..2]).join(file_id))
    }

    pub fn is_bundle(dir: &Path) -> bool {
        dir.join(INFO_FILE).is_file() && dir.join(MANIFEST_DB).is_file()
    }

    /// `None` for bundles written without encryption.
    pub fn read_keybag(&self) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.keybag_path()) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_paths_are_sharded_and_validated() {
        let layout = BundleLayout::new("/backups/B1");
        assert_eq!(
            layout
                .blob_path("3d0d7e5fb2ce288813306e4d4636395e047a3d28")
                .unwrap(),
            PathBuf::from("/backups/B1/3d/3d0d7e5fb2ce288813306e4d4636395e047a3d28")
        );
        assert!(matches!(
            layout.blob_path("../Manifest.db"),
            Err(IbxError::NotFound(_))
        ));
    }
}
