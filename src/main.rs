// Runs one pipeline over a manifest of object keys.
//
//     visualdb <manifest> [config.toml]
//
// Objects are read from `store.root/store.bucket/<key>` on the local
// filesystem and reduced to pooled colour statistics. Set RUST_LOG to change
// the log level.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

use visualdb::collaborators::Collaborators;
use visualdb::collaborators::features::PooledStatsBackend;
use visualdb::collaborators::store::FsObjectStore;
use visualdb::{Driver, PipelineConfig};

/// Loads, filters and extracts feature vectors for every object in a manifest.
#[derive(Parser, Debug)]
#[command(name = "visualdb", version, about)]
struct Cli {
    /// Text file with one object key per line.
    manifest: PathBuf,

    /// TOML pipeline configuration. Defaults apply when omitted.
    config: Option<PathBuf>,
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    config.manifest_path = cli.manifest;

    let store = FsObjectStore::new(&config.store).context("failed to open the object store")?;
    let backend = PooledStatsBackend::new(config.frame_shape(), config.feature_grid);
    let collaborators = Collaborators::new(Arc::new(store), Arc::new(backend));

    let driver = Driver::new(config, collaborators)?;
    let report = driver.run().await?;
    info!(
        input_size = report.input_size,
        filtered_size = report.filtered_size,
        failed = report.failed.len(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "run complete"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_is_optional() {
        let cli = Cli::try_parse_from(["visualdb", "images.txt"]).unwrap();
        assert_eq!(cli.manifest, PathBuf::from("images.txt"));
        assert!(cli.config.is_none());

        let cli = Cli::try_parse_from(["visualdb", "images.txt", "run.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("run.toml")));
    }

    #[test]
    fn manifest_is_required() {
        assert!(Cli::try_parse_from(["visualdb"]).is_err());
        assert!(Cli::try_parse_from(["visualdb", "a", "b", "c"]).is_err());
    }
}
