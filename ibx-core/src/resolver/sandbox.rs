use crate::domain::ManifestEntry;
use crate::error::Result;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const SANDBOX_PREFIX: &str = "ibxfs_";

/// Decrypted copy of one file in its own temporary directory.
/// Dropping the sandbox deletes the directory, whatever the exit path.
#[derive(Debug)]
pub struct Sandbox {
    dir: TempDir,
    payload: PathBuf,
    entry: ManifestEntry,
    len: u64,
}

impl Sandbox {
    pub(crate) fn new(dir: TempDir, payload: PathBuf, entry: ManifestEntry, len: u64) -> Self {
        Self {
            dir,
            payload,
            entry,
            len,
        }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self) -> &Path {
        &self.payload
    }

    pub fn entry(&self) -> &ManifestEntry {
        &self.entry
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn into_download(self) -> Result<Download> {
        let file = File::open(&self.payload)?;
        Ok(Download {
            file,
            sandbox: self,
        })
    }

    /// Explicit release that reports removal errors instead of swallowing them.
    pub fn close(self) -> Result<()> {
        Ok(self.dir.close()?)
    }
}

/// Byte stream over a sandboxed file; the sandbox goes away with the stream.
#[derive(Debug)]
pub struct Download {
    // Field order matters: the handle closes before the directory is removed.
    file: File,
    sandbox: Sandbox,
}

impl Download {
    pub fn entry(&self) -> &ManifestEntry {
        self.sandbox.entry()
    }

    pub fn len(&self) -> u64 {
        self.sandbox.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sandbox.is_empty()
    }

    pub fn sandbox_dir(&self) -> &Path {
        self.sandbox.dir()
    }
}

impl Read for Download {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}
