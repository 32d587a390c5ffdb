mod application;
mod presentation;

use ibx_core::Result;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ibx_core=info,ibxdev=info")),
        )
        .with_writer(std::io::stderr)
        .init();
    application::run()
}
