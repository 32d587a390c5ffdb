#![forbid(unsafe_code)]

pub mod config;
pub mod domain;
pub mod engine;
pub mod error;

pub mod util {
    pub mod counting;
    pub mod fsx;
}

pub mod codec;

pub mod crypto {
    pub mod aead;
    pub mod context;
    pub mod hex;
    pub mod keybag;
}

pub mod bundle {
    pub mod info;
    pub mod layout;
    pub mod manifest;
    pub mod writer;
}

pub mod resolver;

pub mod session {
    pub mod clock;
    pub mod store;
}

pub mod registry {
    pub mod discovery;
    pub mod store;
}

pub mod index {
    pub mod artifact;
    pub mod board;
    pub mod coordinator;
    pub mod report;
}

pub mod parse;
pub mod sink;

pub mod extract {
    pub mod gate;
    pub mod markers;
}

pub mod decrypt;

// Re-exports: stable API surface
pub use bundle::writer::{BundleWriter, WriteOptions};
pub use config::Settings;
pub use domain::{BackupSnapshot, BackupStatus, DecryptionStatus, FileFilter, FilePage, ManifestEntry};
pub use engine::{Engine, UnlockGrant};
pub use error::{IbxError, Result};
pub use index::artifact::ArtifactKind;
pub use index::report::{ArtifactOutcome, ArtifactState, JobReport};
pub use resolver::file_id::resolve_file_id;
