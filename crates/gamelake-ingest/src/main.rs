//! Gamelake Ingest - IGDB to S3 ingestion tool

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gamelake_common::logging::{init_logging, LogConfig, LogLevel};
use gamelake_common::types::PartitionDate;
use gamelake_ingest::{
    auth::StaticAuthProvider,
    cache::{CloudFrontCache, EdgeCache, NoopEdgeCache},
    config::PipelineConfig,
    extract::Extractor,
    orchestrator::{Orchestrator, RunOptions},
    rate_limit::RateLimiter,
    state::StateStore,
    storage::{s3::load_sdk_config, S3BlobStore},
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "gamelake-ingest")]
#[command(author, version, about = "Incremental IGDB ingestion into the Gamelake S3 data lake")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline for every entity (or a subset)
    Run {
        /// Ignore checkpoints and replace every entity's data
        #[arg(long)]
        full_refresh: bool,

        /// Partition date (YYYY-MM-DD), defaults to today in UTC
        #[arg(long)]
        date: Option<PartitionDate>,

        /// Only run these entities
        #[arg(long, num_args = 1..)]
        only: Vec<String>,
    },

    /// Inspect or reset checkpoints
    State {
        #[command(subcommand)]
        action: StateAction,
    },
}

#[derive(Subcommand, Debug)]
enum StateAction {
    /// Show every entity's last run time
    List,

    /// Delete an entity's checkpoint so the next run is a full load
    Reset {
        entity: String,
    },
}

async fn run_pipeline(
    config: &PipelineConfig,
    full_refresh: bool,
    date: Option<PartitionDate>,
    only: Vec<String>,
) -> Result<bool> {
    let limiter = Arc::new(RateLimiter::new(config.upstream.rate_limit)?);
    let auth = Arc::new(StaticAuthProvider::new(config.upstream.static_token.clone()));
    let extractor = Arc::new(
        Extractor::new(&config.upstream, auth, limiter)?
            .with_channel_capacity(config.pipeline.channel_capacity),
    );

    let sdk_config = load_sdk_config(&config.storage).await;
    let store = Arc::new(S3BlobStore::from_sdk_config(&sdk_config, &config.storage));
    let cache: Arc<dyn EdgeCache> = match &config.cdn.distribution_id {
        Some(id) => Arc::new(CloudFrontCache::new(&sdk_config, id.clone())),
        None => Arc::new(NoopEdgeCache),
    };

    let orchestrator = Orchestrator::new(config, extractor, store, cache);
    let options = RunOptions::new(date.unwrap_or_else(PartitionDate::today))
        .full_refresh(full_refresh)
        .only(only);

    let report = orchestrator.run(&options).await?;
    report.log_summary();
    Ok(report.is_success())
}

async fn state_command(config: &PipelineConfig, action: StateAction) -> Result<()> {
    let store = Arc::new(S3BlobStore::new(&config.storage).await);
    let state = StateStore::new(store, config.pipeline.state_prefix.clone());

    match action {
        StateAction::List => {
            let entries = state.list().await.context("Failed to list checkpoints")?;
            if entries.is_empty() {
                info!("No checkpoints stored");
            }
            for (entity, last_run_time) in entries {
                match last_run_time {
                    Some(time) => {
                        info!(entity = %entity, last_run_time = %time.to_rfc3339(), "Checkpoint")
                    },
                    None => {
                        info!(entity = %entity, "Checkpoint unreadable, next run is a full load")
                    },
                }
            }
        },
        StateAction::Reset { entity } => {
            state
                .reset(&entity)
                .await
                .with_context(|| format!("Failed to reset checkpoint for '{entity}'"))?;
        },
    }
    Ok(())
}

async fn execute(cli: Cli) -> Result<bool> {
    let config = PipelineConfig::from_env().context("Invalid configuration")?;

    match cli.command {
        Command::Run {
            full_refresh,
            date,
            only,
        } => run_pipeline(&config, full_refresh, date, only).await,
        Command::State { action } => {
            state_command(&config, action).await?;
            Ok(true)
        },
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging based on verbose flag; environment variables take precedence
    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("gamelake-ingest")
        .build()
        .merge_env()?;
    let _guard = init_logging(&log_config)?;

    match execute(cli).await {
        Ok(true) => Ok(ExitCode::SUCCESS),
        Ok(false) => {
            error!("Pipeline finished with failed entities");
            Ok(ExitCode::FAILURE)
        },
        Err(e) => {
            error!("{e:#}");
            Ok(ExitCode::FAILURE)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "gamelake-ingest",
            "run",
            "--full-refresh",
            "--date",
            "2025-01-15",
            "--only",
            "games",
            "genres",
        ])
        .unwrap();

        match cli.command {
            Command::Run {
                full_refresh,
                date,
                only,
            } => {
                assert!(full_refresh);
                assert_eq!(date.map(|d| d.to_string()).as_deref(), Some("2025-01-15"));
                assert_eq!(only, vec!["games", "genres"]);
            },
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_rejects_bad_date() {
        assert!(Cli::try_parse_from(["gamelake-ingest", "run", "--date", "15/01/2025"]).is_err());
    }

    #[test]
    fn test_cli_state_reset() {
        let cli = Cli::try_parse_from(["gamelake-ingest", "-v", "state", "reset", "games"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Command::State {
                action: StateAction::Reset { ref entity }
            } if entity == "games"
        ));
    }
}
