use crate::bundle::info::BundleInfo;
use crate::bundle::layout::BundleLayout;
use crate::error::Result;
use crate::util::fsx::{modified_at, tree_size};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::warn;

/// A bundle directory found under the backup root.
#[derive(Clone, Debug)]
pub struct FoundBundle {
    pub id: String,
    pub dir_name: String,
    pub path: PathBuf,
    pub info: BundleInfo,
    pub size_bytes: u64,
    pub last_modified_at: Option<OffsetDateTime>,
}

/// Bundles directly below `root`, sorted by directory name. A missing root
/// yields nothing; unreadable `Info.json` files are skipped.
pub fn scan(root: &Path) -> Result<Vec<FoundBundle>> {
    let entries = match fs::read_dir(root) {
        Ok(it) => it,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .filter(|p| BundleLayout::is_bundle(p))
        .collect();
    dirs.sort();

    let found = dirs
        .par_iter() // sizes are computed per bundle in parallel
        .filter_map(|path| {
            let layout = BundleLayout::new(path);
            let dir_name = path.file_name()?.to_string_lossy().into_owned();
            let info = match BundleInfo::read(&layout.info_path()) {
                Ok(info) => info,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping bundle");
                    return None;
                }
            };
            Some(FoundBundle {
                id: info.backup_id(&dir_name),
                dir_name,
                path: path.clone(),
                size_bytes: tree_size(path),
                last_modified_at: modified_at(path),
                info,
            })
        })
        .collect();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_complete_bundles_are_found() {
        let root = tempfile::tempdir().unwrap();
        let a = root.path().join("b-dir");
        fs::create_dir_all(&a).unwrap();
        BundleInfo {
            unique_device_id: Some("UDID-B".into()),
            ..BundleInfo::default()
        }
        .write(&a.join("Info.json"))
        .unwrap();
        fs::write(a.join("Manifest.db"), b"").unwrap();

        let partial = root.path().join("a-partial");
        fs::create_dir_all(&partial).unwrap();
        fs::write(partial.join("Info.json"), b"{}").unwrap();

        fs::write(root.path().join("stray.txt"), b"x").unwrap();

        let found = scan(root.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "UDID-B");
        assert_eq!(found[0].dir_name, "b-dir");
        assert!(found[0].size_bytes > 0);

        assert!(scan(&root.path().join("missing")).unwrap().is_empty());
    }
}
