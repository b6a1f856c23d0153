use std::env;

use tracehub_server::ServerBuilder;
use tracehub_server::config::loader::load_config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Optional .env for local development
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    tracehub_server::observability::init_tracing();

    let config_path = resolve_config_path();
    let cfg = match load_config(Some(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };
    tracing::info!(path = %config_path, "Configuration loaded");

    tracehub_server::observability::apply_logging_level(&cfg.logging.level);
    tracehub_server::metrics::init_metrics();

    let server = ServerBuilder::new().with_config(cfg).build().await?;
    server.run().await
}

/// `--config <path>`, then `TRACEHUB_CONFIG`, then `tracehub.toml`.
fn resolve_config_path() -> String {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return path;
            }
        }
    }

    match env::var("TRACEHUB_CONFIG") {
        Ok(path) if !path.is_empty() => path,
        _ => "tracehub.toml".to_string(),
    }
}
