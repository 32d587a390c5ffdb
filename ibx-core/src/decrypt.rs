use crate::error::Result;
use crate::index::artifact::ArtifactKind;
use crate::resolver::ManifestResolver;
use crate::session::store::Unlocked;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Clone, Debug, Default, Serialize)]
pub struct DecryptSummary {
    pub output_dir: PathBuf,
    pub written: Vec<ArtifactKind>,
    /// Not present in this backup's manifest.
    pub missing: Vec<ArtifactKind>,
    pub failed: Vec<(ArtifactKind, String)>,
}

/// Writes every artifact source database of the backup into `out_dir` under
/// its decrypted name. Per-artifact failures are recorded and skipped; an
/// unreadable manifest fails the whole call.
pub fn decrypt_sources(resolver: &ManifestResolver, unlocked: &Unlocked, out_dir: &Path) -> Result<DecryptSummary> {
    std::fs::create_dir_all(out_dir)?;
    let mut summary = DecryptSummary {
        output_dir: out_dir.to_path_buf(),
        ..DecryptSummary::default()
    };
    for kind in ArtifactKind::ALL {
        let Some(entry) = resolver.find(unlocked, kind.source_domain(), kind.source_path())? else {
            debug!(artifact = %kind, "source not in manifest");
            summary.missing.push(kind);
            continue;
        };
        let target = out_dir.join(kind.decrypted_name());
        match resolver.extract_to_path(unlocked, &entry.file_id, &target) {
            Ok(bytes) => {
                debug!(artifact = %kind, bytes, "source decrypted");
                summary.written.push(kind);
            }
            Err(e) => {
                warn!(backup_id = unlocked.backup_id(), artifact = %kind, error = %e, "source not decrypted");
                summary.failed.push((kind, e.to_string()));
            }
        }
    }
    Ok(summary)
}
