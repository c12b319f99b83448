//! Ferry: incoming correspondence migration orchestrator
//!
//! Main binary with subcommands:
//! - `serve`: HTTP API for triggers, records and statistics; fails records a
//!   previous server left IN_PROGRESS
//!
//! One-shot commands may share the database with a running server.
//! - `import`: Load a legacy source bundle
//! - `run`, `run-specific`, `retry`: Drive phases from the command line
//! - `stats`, `records`: Inspect migration state

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::Result;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ferry_engine::{BatchResult, Override, StatisticsAggregator};
use ferry_store::{PageRequest, Phase, RecordQuery, RecordStatus, SourceBundle};

mod settings;

use settings::Settings;

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "Incoming correspondence migration orchestrator", long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// Address to bind
        #[arg(long, env = "FERRY_BIND", default_value = "0.0.0.0")]
        bind: String,

        /// HTTP server port
        #[arg(long, env = "FERRY_PORT", default_value = "8080")]
        port: u16,
    },

    /// Import a legacy source bundle (JSON)
    Import {
        #[arg(value_name = "BUNDLE")]
        path: PathBuf,
    },

    /// Run a phase over every eligible record
    Run {
        #[arg(value_name = "PHASE")]
        phase: Phase,
    },

    /// Run a phase over the named records only
    RunSpecific {
        #[arg(value_name = "PHASE")]
        phase: Phase,

        /// Source ids to process
        #[arg(value_name = "ID", required = true)]
        ids: Vec<String>,

        /// Re-process records that already succeeded, as this operator
        #[arg(long, requires = "reason")]
        operator: Option<String>,

        /// Why the override is needed
        #[arg(long, requires = "operator")]
        reason: Option<String>,
    },

    /// Retry failed records in one phase, or in every phase
    Retry {
        #[arg(value_name = "PHASE")]
        phase: Option<Phase>,
    },

    /// Print per-phase and overall statistics
    Stats,

    /// List records of a phase
    Records {
        #[arg(value_name = "PHASE")]
        phase: Phase,

        #[arg(long)]
        status: Option<RecordStatus>,

        /// Substring match on ids and last error
        #[arg(long)]
        search: Option<String>,

        #[arg(long, default_value = "0")]
        page: u32,

        #[arg(long, default_value = "20")]
        size: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| {
                "ferry=info,ferry_engine=info,ferry_store=info,ferry_destination=info,ferry_web=info,tower_http=info"
                    .to_string()
            }),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let settings = cli.settings;

    match cli.command {
        Commands::Serve { bind, port } => serve(&settings, &bind, port).await,

        Commands::Import { path } => {
            let text = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| miette::miette!("failed to read {}: {}", path.display(), e))?;
            let bundle: SourceBundle = serde_json::from_str(&text)
                .map_err(|e| miette::miette!("invalid bundle {}: {}", path.display(), e))?;
            let summary = settings
                .open_store()?
                .import_source(&bundle)
                .map_err(|e| miette::miette!("{}", e))?;
            print_json(&summary)
        }

        Commands::Run { phase } => {
            let engine = settings.build_engine()?;
            let result = engine.run_phase(phase).await;
            engine.shutdown().await;
            report(result)
        }

        Commands::RunSpecific {
            phase,
            ids,
            operator,
            reason,
        } => {
            let override_by = match (operator, reason) {
                (Some(operator), Some(reason)) => Some(Override { operator, reason }),
                _ => None,
            };
            let engine = settings.build_engine()?;
            let result = engine.run_selected(phase, &ids, override_by).await;
            engine.shutdown().await;
            report(result)
        }

        Commands::Retry { phase } => {
            let engine = settings.build_engine()?;
            let result = match phase {
                Some(phase) => engine.retry_phase(phase).await,
                None => engine.retry_all().await,
            };
            engine.shutdown().await;
            report(result)
        }

        Commands::Stats => {
            let stats = StatisticsAggregator::new(settings.open_store()?, settings.max_attempts);
            print_json(&stats.overall())
        }

        Commands::Records {
            phase,
            status,
            search,
            page,
            size,
        } => {
            let query = RecordQuery {
                status,
                search,
                page: PageRequest::new(page, size),
            };
            let records = settings
                .open_store()?
                .list_records(phase, &query)
                .map_err(|e| miette::miette!("{}", e))?;
            print_json(&records)
        }
    }
}

async fn serve(settings: &Settings, bind: &str, port: u16) -> Result<()> {
    let engine = Arc::new(settings.build_engine()?);
    engine
        .recover_interrupted()
        .map_err(|e| miette::miette!("failed to recover interrupted records: {}", e))?;
    let router = ferry_web::create_router(Arc::new(ferry_web::AppState::new(engine.clone())));

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", bind, port))
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    tracing::info!("migration API listening on http://{}:{}/api/migration", bind, port);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("received shutdown signal");
        })
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    engine.shutdown().await;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).map_err(|e| miette::miette!("{}", e))?;
    println!("{}", text);
    Ok(())
}

/// Print a batch result; a batch that could not start is an error exit.
fn report(result: BatchResult) -> Result<()> {
    print_json(&result)?;
    if result.is_error() {
        return Err(miette::miette!("{}", result.message));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_store::{ClaimGuard, NewRecord};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn test_run_specific_parses_override() {
        let cli = Cli::try_parse_from([
            "ferry",
            "run-specific",
            "creation",
            "A",
            "B",
            "--operator",
            "alice",
            "--reason",
            "re-upload",
        ])
        .unwrap();

        match cli.command {
            Commands::RunSpecific {
                phase,
                ids,
                operator,
                reason,
            } => {
                assert_eq!(phase, Phase::Create);
                assert_eq!(ids, vec!["A".to_string(), "B".to_string()]);
                assert_eq!(operator.as_deref(), Some("alice"));
                assert_eq!(reason.as_deref(), Some("re-upload"));
            }
            _ => panic!("expected run-specific"),
        }
    }

    #[test]
    fn test_operator_requires_reason() {
        let result = Cli::try_parse_from(["ferry", "run-specific", "close", "A", "--operator", "alice"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_phase_is_rejected() {
        assert!(Cli::try_parse_from(["ferry", "run", "teleport"]).is_err());
    }

    #[test]
    fn test_settings_map_to_configs() {
        let cli = Cli::try_parse_from([
            "ferry",
            "--max-attempts",
            "5",
            "--pool-core",
            "4",
            "--pool-max",
            "2",
            "--request-timeout",
            "7",
            "--token",
            "abc",
            "retry",
        ])
        .unwrap();
        let settings = cli.settings;

        assert_eq!(settings.engine_config().max_attempts, 5);
        let pool = settings.pool_config();
        assert_eq!(pool.core_size, 4);
        assert_eq!(pool.max_size, 4);
        assert_eq!(pool.name_prefix, "creation-worker-");
        assert_eq!(settings.destination_config().request_timeout, Duration::from_secs(7));

        let credentials = settings.credentials_config();
        assert_eq!(credentials.static_token.as_deref(), Some("abc"));
        assert!(credentials.keycloak.is_none());
        assert!(matches!(cli.command, Commands::Retry { phase: None }));
    }

    #[test]
    fn test_bool_env_values() {
        assert_eq!(settings::parse_bool_env("YES"), Ok(true));
        assert_eq!(settings::parse_bool_env(""), Ok(false));
        assert!(settings::parse_bool_env("maybe").is_err());
    }

    #[test]
    fn test_one_shot_engine_leaves_in_flight_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let cli = Cli::try_parse_from(["ferry", "--db-path", path.to_str().unwrap(), "--token", "abc", "run", "assignment"])
            .unwrap();

        let store = cli.settings.open_store().unwrap();
        store
            .seed(&[NewRecord::new(Phase::Assign, "t-1", "c-1", serde_json::json!({}))])
            .unwrap();
        assert!(store.claim(Phase::Assign, "t-1", ClaimGuard::runnable(3)).unwrap());

        let engine = cli.settings.build_engine().unwrap();
        let record = engine.get_record(Phase::Assign, "t-1").unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::InProgress);

        assert_eq!(engine.recover_interrupted().unwrap(), 1);
    }

    #[test]
    fn test_store_config_uses_db_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let cli = Cli::try_parse_from(["ferry", "--db-path", path.to_str().unwrap(), "stats"]).unwrap();

        assert_eq!(cli.settings.store_config().path, path);
        let store = cli.settings.open_store().unwrap();
        assert_eq!(store.path(), path.as_path());
    }
}
