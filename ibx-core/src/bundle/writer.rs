use super::info::BundleInfo;
use super::layout::BundleLayout;
use super::manifest::{FLAG_DIRECTORY, FLAG_FILE, FileMeta, ManifestDb, ManifestRow};
use crate::codec::{CodecId, Compressor, compressor};
use crate::crypto::aead::Region;
use crate::crypto::context::{KeyContext, seal_with};
use crate::crypto::keybag::{KdfParams, Keybag};
use crate::error::{IbxError, Result};
use crate::resolver::file_id::resolve_file_id;
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Clone, Default)]
pub struct WriteOptions {
    pub info: BundleInfo,
    /// Seals manifest metadata and blobs when set.
    pub password: Option<String>,
    pub kdf: KdfParams,
    /// Only accept compression if it saves at least this fraction.
    pub min_gain: f32, // default 0.05 if left as 0.0
}

/// A file ready to be written: compressed, sealed, and described.
struct Prepared {
    row: ManifestRow,
    blob: Vec<u8>,
}

/// Builds a backup bundle directory file by file.
pub struct BundleWriter {
    layout: BundleLayout,
    ctx: KeyContext,
    db: ManifestDb,
    min_gain: f32,
}

fn effective_min_gain(min_gain: f32) -> f32 {
    if min_gain <= 0.0 { 0.05 } else { min_gain }
}

fn should_compress(u: usize, c: usize, min_gain: f32) -> bool {
    // true if (u - c) >= u * min_gain  ⇔  c <= u * (1 - min_gain)
    (u as f64 - c as f64) >= (u as f64 * min_gain as f64)
}

fn mode_from(_md: &fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        _md.permissions().mode()
    }
    #[cfg(not(unix))]
    {
        0o100644
    }
}

fn mtime_from(md: &fs::Metadata) -> i64 {
    md.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl BundleWriter {
    pub fn create(out: &Path, opts: WriteOptions) -> Result<Self> {
        let layout = BundleLayout::new(out);
        if layout.manifest_path().exists() {
            return Err(IbxError::format(format!(
                "bundle already exists: {}",
                out.display()
            )));
        }
        fs::create_dir_all(out)?;

        let mut info = opts.info;
        let ctx = match opts.password.as_deref() {
            Some(pw) => {
                let (bag, key) = Keybag::create(pw, opts.kdf)?;
                fs::write(layout.keybag_path(), bag.to_cbor()?)?;
                info.is_encrypted = true;
                KeyContext::sealed(key, bag.salt)
            }
            None => {
                info.is_encrypted = false;
                KeyContext::plain()
            }
        };
        info.write(&layout.info_path())?;
        let db = ManifestDb::create(&layout.manifest_path())?;

        Ok(Self {
            layout,
            ctx,
            db,
            min_gain: effective_min_gain(opts.min_gain),
        })
    }

    pub fn layout(&self) -> &BundleLayout {
        &self.layout
    }

    pub fn add_file(
        &mut self,
        domain: &str,
        relative_path: &str,
        data: &[u8],
        mtime: i64,
    ) -> Result<String> {
        let prepared = prepare(&self.ctx, self.min_gain, domain, relative_path, data, mtime, 0o100644)?;
        let id = prepared.row.file_id.clone();
        self.write_prepared(&[prepared])?;
        Ok(id)
    }

    pub fn add_directory(&mut self, domain: &str, relative_path: &str) -> Result<String> {
        let file_id = resolve_file_id(domain, relative_path);
        self.db.insert(&ManifestRow {
            file_id: file_id.clone(),
            domain: domain.to_string(),
            relative_path: relative_path.to_string(),
            flags: FLAG_DIRECTORY,
            file: None,
        })?;
        Ok(file_id)
    }

    /// Adds every file below `src`, read as `<src>/<domain>/<relative path>`.
    /// Returns the number of files written.
    pub fn add_tree(&mut self, src: &Path) -> Result<usize> {
        let mut files: Vec<(String, String, PathBuf)> = Vec::new();
        let mut dirs: Vec<(String, String)> = Vec::new();
        for e in WalkDir::new(src).min_depth(2).follow_links(false) {
            let e = e.map_err(std::io::Error::other)?;
            let rel = e.path().strip_prefix(src).map_err(std::io::Error::other)?;
            let mut parts = rel.iter().map(|c| c.to_string_lossy().into_owned());
            let Some(domain) = parts.next() else { continue };
            let relative_path = parts.collect::<Vec<_>>().join("/");
            if e.file_type().is_dir() {
                dirs.push((domain, relative_path));
            } else if e.file_type().is_file() {
                files.push((domain, relative_path, e.path().to_path_buf()));
            }
            // (symlinks are not part of a bundle)
        }
        dirs.sort();
        files.sort();

        for (domain, rel) in &dirs {
            self.add_directory(domain, rel)?;
        }

        let ctx = &self.ctx;
        let min_gain = self.min_gain;
        let prepared = files
            .par_iter() // In parallel, each file independent
            .map(|(domain, rel, path)| -> Result<Prepared> {
                let md = fs::metadata(path)?;
                let data = fs::read(path)?;
                prepare(ctx, min_gain, domain, rel, &data, mtime_from(&md), mode_from(&md))
            })
            .collect::<Result<Vec<_>>>()?;

        self.write_prepared(&prepared)?;
        Ok(prepared.len())
    }

    pub fn finish(self) -> Result<BundleLayout> {
        Ok(self.layout)
    }

    fn write_prepared(&mut self, batch: &[Prepared]) -> Result<()> {
        for p in batch {
            let path = self.layout.blob_path(&p.row.file_id)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, &p.blob)?;
        }
        let rows: Vec<ManifestRow> = batch.iter().map(|p| p.row.clone()).collect();
        self.db.insert_many(&rows)
    }
}

fn prepare(
    ctx: &KeyContext,
    min_gain: f32,
    domain: &str,
    relative_path: &str,
    data: &[u8],
    mtime: i64,
    mode: u32,
) -> Result<Prepared> {
    let file_id = resolve_file_id(domain, relative_path);

    // Trial compress; keep zstd only when it pays off.
    let mut packed = Vec::with_capacity(data.len());
    compressor(CodecId::Zstd).compress(&mut &data[..], &mut packed, 3)?;
    let (codec, payload) = if !data.is_empty() && should_compress(data.len(), packed.len(), min_gain)
    {
        (CodecId::Zstd, packed)
    } else {
        (CodecId::Store, data.to_vec())
    };

    let meta = FileMeta {
        size: data.len() as u64,
        mtime,
        mode,
        codec,
        blake3: *blake3::hash(data).as_bytes(),
    };
    let file = seal_with(ctx, Region::Manifest, &file_id, meta.to_cbor()?)?;
    let blob = seal_with(ctx, Region::Blob, &file_id, payload)?;

    Ok(Prepared {
        row: ManifestRow {
            file_id,
            domain: domain.to_string(),
            relative_path: relative_path.to_string(),
            flags: FLAG_FILE,
            file: Some(file),
        },
        blob,
    })
}
