use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "ibxdev: inspect and index device backups", long_about = None)]
pub struct Cli {
    /// JSON settings file; IBX_* variables override it
    #[arg(long, global = true, env = "IBX_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Clone)]
pub struct Unlock {
    pub backup: String,
    /// Backup password
    #[arg(long, env = "IBX_PASSWORD", hide_env_values = true, default_value = "")]
    pub password: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan the backup root and print every known backup
    Scan,

    /// Print one backup's status, or all of them
    Status { backup: Option<String> },

    /// List manifest files
    Ls {
        #[command(flatten)]
        unlock: Unlock,
        #[arg(long)]
        domain: Option<String>,
        /// Glob on the relative path (* and ?)
        #[arg(long)]
        pattern: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },

    /// List manifest domains
    Domains {
        #[command(flatten)]
        unlock: Unlock,
    },

    /// Download one file by its file id
    Get {
        #[command(flatten)]
        unlock: Unlock,
        file_id: String,
        out: PathBuf,
    },

    /// Write the artifact databases to the decrypted root
    Decrypt {
        #[command(flatten)]
        unlock: Unlock,
    },

    /// Remove decrypted data, cached attachments and records
    Purge { backup: String },

    /// Decrypt if needed, then index every artifact
    Index {
        #[command(flatten)]
        unlock: Unlock,
    },

    /// Extract every attachment of one conversation into the cache
    Extract {
        #[command(flatten)]
        unlock: Unlock,
        group: String,
    },

    /// Build a bundle from a `<domain>/<relative path>` tree
    Pack {
        src: PathBuf,
        out: PathBuf,
        #[arg(long = "device-id")]
        device_id: Option<String>,
        #[arg(long)]
        name: Option<String>,
        /// Seal the bundle with this password
        #[arg(long, env = "IBX_PACK_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        #[arg(long, default_value_t = 0.05)]
        min_gain: f32,
    },
}
