pub mod handlers;

use crate::presentation::cli::{Cli, Commands};
use ibx_core::{FileFilter, Result, Settings};
use clap::Parser;

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Scan => handlers::handle_scan(settings),
        Commands::Status { backup } => handlers::handle_status(settings, backup),
        Commands::Ls {
            unlock,
            domain,
            pattern,
            limit,
            offset,
        } => handlers::handle_ls(
            settings,
            unlock,
            FileFilter {
                domain,
                path_pattern: pattern,
                limit,
                offset,
            },
        ),
        Commands::Domains { unlock } => handlers::handle_domains(settings, unlock),
        Commands::Get {
            unlock,
            file_id,
            out,
        } => handlers::handle_get(settings, unlock, file_id, out),
        Commands::Decrypt { unlock } => handlers::handle_decrypt(settings, unlock),
        Commands::Purge { backup } => handlers::handle_purge(settings, backup),
        Commands::Index { unlock } => handlers::handle_index(settings, unlock),
        Commands::Extract { unlock, group } => handlers::handle_extract(settings, unlock, group),
        Commands::Pack {
            src,
            out,
            device_id,
            name,
            password,
            min_gain,
        } => handlers::handle_pack(src, out, device_id, name, password, min_gain),
    }
}
