//! levscan - leveraged-position opportunity analyzer.
//!
//! Subcommands:
//! - `serve`   - HTTP API (submit / progress / cancel)
//! - `analyze` - run one onboarding request from the CLI and wait for it
//! - `worker`  - internal: run one task; spawned by the worker pool
//! - `cancel`  - request cancellation of a running execution
//! - `status`  - print an execution's progress report
//!
//! Exit codes: 0 success, 1 validator fail, 2 cancelled, 3 internal error.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use levscan::application::orchestrator::{
    OnboardingRequest, OnboardingService, SubmitOutcome,
};
use levscan::application::planner::TaskPlanner;
use levscan::application::validation::EarlyFailValidator;
use levscan::application::worker::{TaskRunOutcome, WorkerEnv, run_task};
use levscan::application::worker_pool::{SubprocessLauncher, WorkerPool};
use levscan::config::{AnalysisMode, AppConfig, FilterParams};
use levscan::domain::execution::{ExecutionStatus, OnboardingMode};
use levscan::domain::task::TaskKey;
use levscan::domain::timeframe::Timeframe;
use levscan::infrastructure::persistence::{AnalysisRepository, LedgerRepository, open_pool};
use levscan::infrastructure::providers::{ProviderKind, create_provider};
use levscan::interfaces::api::{ApiState, router};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

const EXIT_OK: i32 = 0;
const EXIT_VALIDATION: i32 = 1;
const EXIT_CANCELLED: i32 = 2;
const EXIT_INTERNAL: i32 = 3;

#[derive(Parser)]
#[command(name = "levscan", version, about = "Leveraged-position opportunity analyzer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API server.
    Serve,
    /// Submit one onboarding request and wait for it to finish.
    Analyze {
        /// Ticker symbol, e.g. BTC.
        symbol: String,
        /// Strategy selection mode: default, selective, or custom.
        #[arg(long, default_value = "default")]
        mode: String,
        /// Strategy ids for selective mode, comma-separated.
        #[arg(long, value_delimiter = ',')]
        strategy_ids: Vec<i64>,
        /// Filter parameter overrides as JSON.
        #[arg(long)]
        filter_params: Option<String>,
    },
    /// Internal: run one task. Spawned by the worker pool.
    Worker {
        #[arg(long)]
        execution_id: String,
        #[arg(long)]
        strategy_id: i64,
        #[arg(long)]
        timeframe: String,
    },
    /// Request cancellation of an execution.
    Cancel { execution_id: String },
    /// Print an execution's progress report as JSON.
    Status { execution_id: String },
}

fn init_logging() {
    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            EXIT_INTERNAL
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let config = AppConfig::from_env()?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Analyze {
            symbol,
            mode,
            strategy_ids,
            filter_params,
        } => analyze(config, symbol, mode, strategy_ids, filter_params).await,
        Command::Worker {
            execution_id,
            strategy_id,
            timeframe,
        } => worker(config, execution_id, strategy_id, timeframe).await,
        Command::Cancel { execution_id } => cancel(config, execution_id).await,
        Command::Status { execution_id } => status(config, execution_id).await,
    }
}

/// Builds the repository pair, seeding schemas and the default strategy
/// catalog on first start.
async fn build_repos(config: &AppConfig) -> Result<(LedgerRepository, AnalysisRepository)> {
    let ledger = LedgerRepository::new(open_pool(&config.ledger_db_url).await?);
    ledger.init().await?;
    let analysis = AnalysisRepository::new(open_pool(&config.analysis_db_url).await?);
    analysis.init().await?;
    analysis.seed_default_catalog().await?;
    Ok((ledger, analysis))
}

fn build_service(
    config: &AppConfig,
    ledger: LedgerRepository,
    analysis: AnalysisRepository,
) -> Result<OnboardingService> {
    let defaults = config.load_defaults()?;
    let provider = create_provider(ProviderKind::from_str(&config.provider)?);

    let validator = EarlyFailValidator::new(
        provider,
        ledger.clone(),
        analysis.clone(),
        defaults.validator.clone(),
    );
    let planner = TaskPlanner::new(analysis.clone());
    let launcher = Arc::new(SubprocessLauncher::new(
        config.clone(),
        std::time::Duration::from_millis(defaults.cancellation.poll_interval_ms),
    ));
    let pool = Arc::new(WorkerPool::new(
        ledger.clone(),
        analysis.clone(),
        launcher,
        config.max_workers,
        std::time::Duration::from_secs(defaults.cancellation.grace_secs),
    ));

    Ok(OnboardingService::new(
        validator, planner, pool, ledger, analysis,
    ))
}

async fn serve(config: AppConfig) -> Result<i32> {
    let (ledger, analysis) = build_repos(&config).await?;
    let service = Arc::new(build_service(&config, ledger, analysis)?);
    let app = router(ApiState { service });

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;
    info!("levscan {} listening on {}", env!("CARGO_PKG_VERSION"), config.bind_address);
    axum::serve(listener, app).await?;
    Ok(EXIT_OK)
}

async fn analyze(
    config: AppConfig,
    symbol: String,
    mode: String,
    strategy_ids: Vec<i64>,
    filter_params: Option<String>,
) -> Result<i32> {
    let (ledger, analysis) = build_repos(&config).await?;
    let service = build_service(&config, ledger, analysis)?;

    let filter_params = match filter_params {
        Some(raw) => Some(FilterParams::from_json(&raw)?),
        None => None,
    };
    let request = OnboardingRequest {
        symbol,
        mode: OnboardingMode::from_str(&mode)?,
        selected_strategy_ids: strategy_ids,
        filter_params,
        custom_strategies: Vec::new(),
    };

    match service.submit(&request).await? {
        SubmitOutcome::Rejected {
            execution_id,
            failure,
        } => {
            eprintln!(
                "Validation failed ({}): {:?}\n  suggestion: {}\n  execution: {}",
                failure.step, failure.reason, failure.suggestion, execution_id
            );
            Ok(EXIT_VALIDATION)
        }
        SubmitOutcome::Accepted { execution, tasks } => {
            println!("Execution {} started with {} tasks", execution.execution_id, tasks.len());
            let status = service.run_to_completion(&execution, tasks).await?;
            println!("Execution {} finished: {}", execution.execution_id, status);
            Ok(match status {
                ExecutionStatus::Success => EXIT_OK,
                ExecutionStatus::Cancelled => EXIT_CANCELLED,
                _ => EXIT_INTERNAL,
            })
        }
    }
}

async fn worker(
    config: AppConfig,
    execution_id: String,
    strategy_id: i64,
    timeframe: String,
) -> Result<i32> {
    // Both env flags are mandatory here: the parent propagates them
    // explicitly and their absence is a programming error.
    let mode = AnalysisMode::from_env()?;
    let filter_params = FilterParams::from_env()?;

    let ledger = LedgerRepository::new(open_pool(&config.ledger_db_url).await?);
    let analysis = AnalysisRepository::new(open_pool(&config.analysis_db_url).await?);
    let defaults = config.load_defaults()?;
    let provider = create_provider(ProviderKind::from_str(&config.provider)?);

    let env = WorkerEnv {
        config,
        defaults,
        ledger,
        analysis,
        provider,
    };
    let key = TaskKey {
        execution_id,
        strategy_id,
        timeframe: Timeframe::from_str(&timeframe)?,
    };

    let outcome = run_task(&env, key, filter_params, mode).await?;
    if let TaskRunOutcome::Failed(message) = &outcome {
        tracing::error!("{}", message);
    }
    Ok(outcome.exit_code())
}

async fn cancel(config: AppConfig, execution_id: String) -> Result<i32> {
    let ledger = LedgerRepository::new(open_pool(&config.ledger_db_url).await?);
    let accepted = ledger.request_cancel(&execution_id).await?;
    println!("{}", serde_json::json!({ "accepted": accepted }));
    Ok(if accepted { EXIT_OK } else { EXIT_INTERNAL })
}

async fn status(config: AppConfig, execution_id: String) -> Result<i32> {
    let (ledger, analysis) = build_repos(&config).await?;
    let service = build_service(&config, ledger, analysis)?;
    match service.execution_report(&execution_id).await? {
        Some(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(EXIT_OK)
        }
        None => {
            eprintln!("Unknown execution: {}", execution_id);
            Ok(EXIT_INTERNAL)
        }
    }
}
