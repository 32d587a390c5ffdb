// ibx-core/src/resolver/mod.rs
pub mod file_id;
pub mod sandbox;

use crate::bundle::manifest::{FileMeta, ManifestDb, ManifestRow, RowQuery};
use crate::codec::compressor;
use crate::crypto::aead::Region;
use crate::crypto::context::Decryptor;
use crate::domain::{FileFilter, FilePage, ManifestEntry};
use crate::error::{IbxError, Result};
use crate::session::store::Unlocked;
use crate::util::counting::CountingWriter;
use sandbox::{Download, SANDBOX_PREFIX, Sandbox};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub const MAX_PAGE: u32 = 1000;

/// Reads a backup's manifest and materializes its files on demand.
/// Every operation works on an [`Unlocked`] handle handed in by the caller.
pub struct ManifestResolver {
    sandbox_root: PathBuf,
    decryptor: Arc<dyn Decryptor>,
}

impl ManifestResolver {
    pub fn new(sandbox_root: impl Into<PathBuf>, decryptor: Arc<dyn Decryptor>) -> Self {
        Self {
            sandbox_root: sandbox_root.into(),
            decryptor,
        }
    }

    pub fn sandbox_root(&self) -> &Path {
        &self.sandbox_root
    }

    fn manifest(&self, unlocked: &Unlocked) -> Result<ManifestDb> {
        ManifestDb::open_read_only(&unlocked.layout().manifest_path())
    }

    fn meta(&self, unlocked: &Unlocked, row: &ManifestRow) -> Result<FileMeta> {
        let sealed = row
            .file
            .as_deref()
            .ok_or_else(|| IbxError::format(format!("file {} has no metadata", row.file_id)))?;
        let plain =
            self.decryptor
                .decrypt_blob(unlocked.context(), Region::Manifest, sealed, &row.file_id)?;
        FileMeta::from_cbor(&plain)
    }

    fn entry(&self, unlocked: &Unlocked, row: ManifestRow) -> ManifestEntry {
        let meta = match self.meta(unlocked, &row) {
            Ok(m) => Some(m),
            Err(e) => {
                debug!(file_id = %row.file_id, error = %e, "manifest metadata unreadable");
                None
            }
        };
        ManifestEntry {
            file_id: row.file_id,
            domain: row.domain,
            relative_path: row.relative_path,
            size: meta.as_ref().map(|m| m.size),
            mtime: meta.as_ref().map(|m| m.mtime),
        }
    }

    pub fn list_entries(&self, unlocked: &Unlocked, filter: &FileFilter) -> Result<FilePage> {
        let limit = filter.limit.clamp(1, MAX_PAGE);
        let db = self.manifest(unlocked)?;
        let rows = db.query(&RowQuery {
            domain: filter.domain.as_deref(),
            path_pattern: filter.path_pattern.as_deref().filter(|p| !p.is_empty()),
            limit,
            offset: filter.offset,
        })?;
        let items = rows.into_iter().map(|r| self.entry(unlocked, r)).collect();
        Ok(FilePage {
            items,
            limit,
            offset: filter.offset,
        })
    }

    pub fn list_domains(&self, unlocked: &Unlocked) -> Result<Vec<String>> {
        self.manifest(unlocked)?.domains()
    }

    pub fn lookup(&self, unlocked: &Unlocked, file_id: &str) -> Result<ManifestEntry> {
        let row = self
            .manifest(unlocked)?
            .lookup(file_id)?
            .ok_or_else(|| IbxError::NotFound(format!("file {file_id}")))?;
        Ok(self.entry(unlocked, row))
    }

    pub fn find(
        &self,
        unlocked: &Unlocked,
        domain: &str,
        relative_path: &str,
    ) -> Result<Option<ManifestEntry>> {
        let row = self.manifest(unlocked)?.find(domain, relative_path)?;
        Ok(row.map(|r| self.entry(unlocked, r)))
    }

    /// Decrypt and decompress one blob into `out`, checking size and digest.
    fn decode_into(&self, unlocked: &Unlocked, row: &ManifestRow, out: &mut dyn Write) -> Result<u64> {
        let meta = self.meta(unlocked, row)?;
        let blob_path = unlocked.layout().blob_path(&row.file_id)?;
        let sealed = match fs::read(&blob_path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(IbxError::NotFound(format!("blob for file {}", row.file_id)));
            }
            Err(e) => return Err(e.into()),
        };
        let payload =
            self.decryptor
                .decrypt_blob(unlocked.context(), Region::Blob, &sealed, &row.file_id)?;

        let mut cw = CountingWriter::new(out);
        compressor(meta.codec).decompress(&mut &payload[..], &mut cw)?;
        cw.flush()?;
        if cw.counted != meta.size {
            return Err(IbxError::DecryptionFailed(format!(
                "{}: size mismatch: expected {}, got {}",
                row.file_id, meta.size, cw.counted
            )));
        }
        if cw.digest().as_bytes() != &meta.blake3 {
            return Err(IbxError::DecryptionFailed(format!(
                "{}: content digest mismatch",
                row.file_id
            )));
        }
        Ok(cw.counted)
    }

    fn require_row(&self, unlocked: &Unlocked, file_id: &str) -> Result<ManifestRow> {
        self.manifest(unlocked)?
            .lookup(file_id)?
            .ok_or_else(|| IbxError::NotFound(format!("file {file_id}")))
    }

    /// Decrypts one file into a fresh sandbox directory. Unknown ids fail
    /// before any directory is created.
    pub fn extract_to_sandbox(&self, unlocked: &Unlocked, file_id: &str) -> Result<Sandbox> {
        let row = self.require_row(unlocked, file_id)?;

        fs::create_dir_all(&self.sandbox_root)?;
        let dir = tempfile::Builder::new()
            .prefix(SANDBOX_PREFIX)
            .tempdir_in(&self.sandbox_root)?;

        let name = Path::new(&row.relative_path)
            .file_name()
            .map(|n| n.to_owned())
            .unwrap_or_else(|| row.file_id.clone().into());
        let payload = dir.path().join(name);

        // `dir` is dropped (and removed) if anything below fails.
        let mut f = fs::File::create(&payload)?;
        let len = self.decode_into(unlocked, &row, &mut f)?;
        f.sync_all()?;
        drop(f);

        let entry = self.entry(unlocked, row);
        Ok(Sandbox::new(dir, payload, entry, len))
    }

    /// Structured acquire/use/release around a sandbox.
    pub fn with_sandbox<T>(
        &self,
        unlocked: &Unlocked,
        file_id: &str,
        f: impl FnOnce(&Sandbox) -> Result<T>,
    ) -> Result<T> {
        let sandbox = self.extract_to_sandbox(unlocked, file_id)?;
        let out = f(&sandbox);
        if let Err(e) = sandbox.close() {
            warn!(file_id, error = %e, "sandbox removal failed");
        }
        out
    }

    pub fn open_download(&self, unlocked: &Unlocked, file_id: &str) -> Result<Download> {
        self.extract_to_sandbox(unlocked, file_id)?.into_download()
    }

    /// Write-once extraction into a persistent directory: the file is named by
    /// its id and never overwritten. `None` when it was already there.
    pub fn extract_into(&self, unlocked: &Unlocked, file_id: &str, dest_dir: &Path) -> Result<Option<u64>> {
        let target = dest_dir.join(file_id);
        if target.exists() {
            return Ok(None);
        }
        let row = self.require_row(unlocked, file_id)?;
        fs::create_dir_all(dest_dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dest_dir)?;
        let len = self.decode_into(unlocked, &row, tmp.as_file_mut())?;
        match tmp.persist_noclobber(&target) {
            Ok(_) => Ok(Some(len)),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.error.into()),
        }
    }

    /// Decrypts one file to `target`, replacing whatever is there.
    pub fn extract_to_path(&self, unlocked: &Unlocked, file_id: &str, target: &Path) -> Result<u64> {
        let row = self.require_row(unlocked, file_id)?;
        let parent = target
            .parent()
            .ok_or_else(|| IbxError::format(format!("no parent for {}", target.display())))?;
        fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        let len = self.decode_into(unlocked, &row, tmp.as_file_mut())?;
        tmp.persist(target).map_err(|e| e.error)?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::writer::{BundleWriter, WriteOptions};
    use crate::crypto::context::SealedBundleCrypto;
    use crate::crypto::keybag::KdfParams;
    use std::io::Read;

    fn fixture(password: Option<&str>) -> (tempfile::TempDir, Arc<Unlocked>, String) {
        let tmp = tempfile::tempdir().unwrap();
        let opts = WriteOptions {
            password: password.map(str::to_string),
            kdf: KdfParams::fast(),
            ..WriteOptions::default()
        };
        let mut w = BundleWriter::create(&tmp.path().join("B1"), opts).unwrap();
        let id = w
            .add_file("HomeDomain", "Library/SMS/sms.db", &[9u8; 4096], 1_700_000_000)
            .unwrap();
        w.add_file("HomeDomain", "Library/Notes/notes.sqlite", b"notes", 0)
            .unwrap();
        let layout = w.finish().unwrap();
        let ctx = SealedBundleCrypto
            .derive_context(layout.read_keybag().unwrap().as_deref(), password.unwrap_or(""))
            .unwrap();
        let unlocked = Arc::new(Unlocked::new("B1".into(), layout, ctx));
        (tmp, unlocked, id)
    }

    fn resolver(tmp: &tempfile::TempDir) -> ManifestResolver {
        ManifestResolver::new(tmp.path().join("sandbox"), Arc::new(SealedBundleCrypto))
    }

    #[test]
    fn lists_with_sizes_from_sealed_metadata() {
        let (tmp, unlocked, id) = fixture(Some("pw"));
        let r = resolver(&tmp);
        let page = r
            .list_entries(&unlocked, &FileFilter::domain("HomeDomain"))
            .unwrap();
        assert_eq!(page.items.len(), 2);
        let sms = page.items.iter().find(|e| e.file_id == id).unwrap();
        assert_eq!(sms.size, Some(4096));
        assert_eq!(sms.mtime, Some(1_700_000_000));
        assert_eq!(r.list_domains(&unlocked).unwrap(), ["HomeDomain"]);
    }

    #[test]
    fn sandbox_is_removed_after_download_drops() {
        let (tmp, unlocked, id) = fixture(Some("pw"));
        let r = resolver(&tmp);
        let mut dl = r.open_download(&unlocked, &id).unwrap();
        let dir = dl.sandbox_dir().to_path_buf();
        assert!(dir.file_name().unwrap().to_string_lossy().starts_with(SANDBOX_PREFIX));
        let mut buf = Vec::new();
        dl.read_to_end(&mut buf).unwrap();
        assert_eq!(buf.len(), 4096);
        drop(dl);
        assert!(!dir.exists());
    }

    #[test]
    fn unknown_file_never_creates_a_sandbox() {
        let (tmp, unlocked, _) = fixture(None);
        let r = resolver(&tmp);
        let err = r
            .extract_to_sandbox(&unlocked, "0000000000000000000000000000000000000000")
            .unwrap_err();
        assert!(matches!(err, IbxError::NotFound(_)));
        assert!(!r.sandbox_root().exists());
    }

    #[test]
    fn corrupt_blob_fails_and_cleans_up() {
        let (tmp, unlocked, id) = fixture(Some("pw"));
        let blob = unlocked.layout().blob_path(&id).unwrap();
        let mut bytes = fs::read(&blob).unwrap();
        bytes[0] ^= 0xff;
        fs::write(&blob, bytes).unwrap();

        let r = resolver(&tmp);
        let err = r.with_sandbox(&unlocked, &id, |_| Ok(())).unwrap_err();
        assert!(matches!(err, IbxError::DecryptionFailed(_)));
        assert_eq!(fs::read_dir(r.sandbox_root()).unwrap().count(), 0);
    }

    #[test]
    fn extract_into_is_write_once() {
        let (tmp, unlocked, id) = fixture(None);
        let r = resolver(&tmp);
        let cache = tmp.path().join("cache");
        assert_eq!(r.extract_into(&unlocked, &id, &cache).unwrap(), Some(4096));
        assert_eq!(r.extract_into(&unlocked, &id, &cache).unwrap(), None);
        assert_eq!(fs::read(cache.join(&id)).unwrap(), vec![9u8; 4096]);
    }
}
