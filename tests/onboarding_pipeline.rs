//! End-to-end onboarding pipeline tests over the mock provider and temp
//! databases. Workers run in-process through the pool's launcher seam; the
//! flow is otherwise identical to production: validate, ledger, plan,
//! execute, record, finalize.

use levscan::application::orchestrator::{
    OnboardingRequest, OnboardingService, SubmitOutcome,
};
use levscan::application::planner::TaskPlanner;
use levscan::application::recorder::read_blob;
use levscan::application::validation::EarlyFailValidator;
use levscan::application::worker::WorkerEnv;
use levscan::application::worker_pool::{InProcessLauncher, WorkerPool};
use levscan::config::{AppConfig, CentralDefaults, FilterParams};
use levscan::domain::errors::FailReason;
use levscan::domain::execution::{ExecutionStatus, OnboardingMode};
use levscan::domain::strategy::BaseKind;
use levscan::domain::task::TaskStatus;
use levscan::domain::timeframe::Timeframe;
use levscan::infrastructure::persistence::database::open_pool;
use levscan::infrastructure::persistence::{AnalysisRepository, LedgerRepository};
use levscan::infrastructure::providers::MarketDataProvider;
use levscan::infrastructure::providers::mock::MockProvider;
use sqlx::Row;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    _dir: tempfile::TempDir,
    ledger: LedgerRepository,
    analysis: AnalysisRepository,
    service: OnboardingService,
}

async fn harness(provider: MockProvider) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let ledger = LedgerRepository::new(
        open_pool(&format!("sqlite://{}/ledger.db", dir.path().display()))
            .await
            .unwrap(),
    );
    ledger.init().await.unwrap();
    let analysis = AnalysisRepository::new(
        open_pool(&format!("sqlite://{}/analysis.db", dir.path().display()))
            .await
            .unwrap(),
    );
    analysis.init().await.unwrap();
    analysis.seed_default_catalog().await.unwrap();

    let mut defaults = CentralDefaults::embedded().unwrap();
    defaults.validator.allowed_exchanges.push("mock".to_string());

    let config = AppConfig {
        ledger_db_url: String::new(),
        analysis_db_url: String::new(),
        provider: "mock".to_string(),
        blob_dir: dir.path().join("blobs"),
        progress_dir: dir.path().join("progress"),
        max_workers: 2,
        bind_address: "127.0.0.1:0".to_string(),
        defaults_path: None,
    };

    let provider: Arc<dyn MarketDataProvider> = Arc::new(provider);
    let validator = EarlyFailValidator::new(
        provider.clone(),
        ledger.clone(),
        analysis.clone(),
        defaults.validator.clone(),
    );
    let planner = TaskPlanner::new(analysis.clone());
    let worker_env = Arc::new(WorkerEnv {
        config: config.clone(),
        defaults: defaults.clone(),
        ledger: ledger.clone(),
        analysis: analysis.clone(),
        provider,
    });
    let pool = Arc::new(WorkerPool::new(
        ledger.clone(),
        analysis.clone(),
        Arc::new(InProcessLauncher::new(worker_env)),
        config.max_workers,
        Duration::from_secs(30),
    ));
    let service = OnboardingService::new(
        validator,
        planner,
        pool,
        ledger.clone(),
        analysis.clone(),
    );

    Harness {
        _dir: dir,
        ledger,
        analysis,
        service,
    }
}

async fn balanced_one_hour_id(analysis: &AnalysisRepository) -> i64 {
    analysis
        .list_active_defaults()
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.base_kind == BaseKind::Balanced && s.timeframe == Timeframe::OneHour)
        .unwrap()
        .id
}

#[tokio::test(flavor = "multi_thread")]
async fn default_mode_plans_full_catalog_upfront() {
    let h = harness(MockProvider::default()).await;
    let request = OnboardingRequest {
        symbol: "BTC".to_string(),
        mode: OnboardingMode::Default,
        selected_strategy_ids: vec![],
        filter_params: None,
        custom_strategies: vec![],
    };

    let outcome = h.service.submit(&request).await.unwrap();
    let (execution, tasks) = match outcome {
        SubmitOutcome::Accepted { execution, tasks } => (execution, tasks),
        other => panic!("expected acceptance, got {:?}", other),
    };

    // One pending row per (strategy, timeframe), observable before any work.
    let expected = BaseKind::all().len() * Timeframe::defaults().len();
    assert_eq!(tasks.len(), expected);
    let rows = h
        .analysis
        .tasks_for_execution(&execution.execution_id)
        .await
        .unwrap();
    assert_eq!(rows.len(), expected);
    assert!(rows.iter().all(|t| t.status == TaskStatus::Pending));

    let ledger_row = h.ledger.get(&execution.execution_id).await.unwrap().unwrap();
    assert_eq!(ledger_row.status, ExecutionStatus::Running);
    assert!(ledger_row.execution_id.starts_with("symbol_addition_"));
}

#[tokio::test(flavor = "multi_thread")]
async fn short_history_symbol_rejected_without_tasks() {
    // ~30 days of history against the 90-day requirement.
    let h = harness(MockProvider::default().with_history_days(30)).await;
    let request = OnboardingRequest {
        symbol: "ZORA".to_string(),
        mode: OnboardingMode::Default,
        selected_strategy_ids: vec![],
        filter_params: None,
        custom_strategies: vec![],
    };

    let outcome = h.service.submit(&request).await.unwrap();
    let (execution_id, failure) = match outcome {
        SubmitOutcome::Rejected {
            execution_id,
            failure,
        } => (execution_id, failure),
        other => panic!("expected rejection, got {:?}", other),
    };
    assert_eq!(failure.reason, FailReason::InsufficientHistoricalData);
    assert!(failure.suggestion.contains("90 days"));

    // The rejection is on the audit trail, but nothing ever ran.
    let ledger_row = h.ledger.get(&execution_id).await.unwrap().unwrap();
    assert_eq!(ledger_row.status, ExecutionStatus::Failed);
    assert!(!ledger_row.errors.is_empty());
    assert!(
        h.analysis
            .tasks_for_execution(&execution_id)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn selective_run_completes_and_accounting_balances() {
    let h = harness(MockProvider::default()).await;
    let strategy_id = balanced_one_hour_id(&h.analysis).await;

    let filter_params: FilterParams = serde_json::from_str(
        r#"{ "entry_conditions": { "min_risk_reward": 2.0 } }"#,
    )
    .unwrap();
    let request = OnboardingRequest {
        symbol: "SOL".to_string(),
        mode: OnboardingMode::Selective,
        selected_strategy_ids: vec![strategy_id],
        filter_params: Some(filter_params),
        custom_strategies: vec![],
    };

    let (execution, tasks) = match h.service.submit(&request).await.unwrap() {
        SubmitOutcome::Accepted { execution, tasks } => (execution, tasks),
        other => panic!("expected acceptance, got {:?}", other),
    };
    assert_eq!(tasks.len(), 1);

    let status = h
        .service
        .run_to_completion(&execution, tasks)
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Success);

    let ledger_row = h.ledger.get(&execution.execution_id).await.unwrap().unwrap();
    assert_eq!(ledger_row.status, ExecutionStatus::Success);
    assert_eq!(ledger_row.progress_percent, 100.0);

    // A completed task with zero trades is success, not failure.
    let row = sqlx::query("SELECT * FROM analyses WHERE execution_id = ?")
        .bind(&execution.execution_id)
        .fetch_one(h.analysis.pool())
        .await
        .unwrap();
    let task_status: String = row.try_get("task_status").unwrap();
    assert_eq!(task_status, "completed");
    let total_trades: i64 = row.try_get("total_trades").unwrap();
    assert!(total_trades >= 0);

    // Invariant: gate rejections + trades + no-signals + early exits equal
    // the evaluations attempted (checked against the persisted blob).
    let compressed_path: Option<String> = row.try_get("compressed_path").unwrap();
    let blob = read_blob(Path::new(&compressed_path.expect("blob written"))).unwrap();
    assert!(blob.stats.is_balanced());
    assert!(blob.stats.evaluations_run > 0);
    assert_eq!(blob.trades.len() as u64, blob.stats.signals);

    // Every emitted signal honors the ordering and price-consistency rules.
    for trade in &blob.trades {
        let r = &trade.signal.recommendation;
        assert!(r.stop_loss < r.entry_price && r.entry_price < r.take_profit);
        assert!(r.leverage >= 2.0);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_skips_tasks_and_keeps_partial_results() {
    let h = harness(MockProvider::default()).await;
    let defaults = h.analysis.list_active_defaults().await.unwrap();
    let ids: Vec<i64> = defaults
        .iter()
        .filter(|s| s.timeframe == Timeframe::OneHour)
        .map(|s| s.id)
        .collect();
    assert!(ids.len() >= 3);

    let request = OnboardingRequest {
        symbol: "BTC".to_string(),
        mode: OnboardingMode::Selective,
        selected_strategy_ids: ids,
        filter_params: None,
        custom_strategies: vec![],
    };
    let (execution, tasks) = match h.service.submit(&request).await.unwrap() {
        SubmitOutcome::Accepted { execution, tasks } => (execution, tasks),
        other => panic!("expected acceptance, got {:?}", other),
    };

    // Cancel before the pool starts: every task observes the flag at its
    // first checkpoint and is skipped.
    assert!(h.service.cancel(&execution.execution_id).await.unwrap());
    let status = h
        .service
        .run_to_completion(&execution, tasks)
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Cancelled);

    let rows = h
        .analysis
        .tasks_for_execution(&execution.execution_id)
        .await
        .unwrap();
    assert!(rows.iter().all(|t| t.status.is_terminal()));
    assert!(rows.iter().all(|t| t.status != TaskStatus::Completed));
    assert!(rows.iter().any(|t| t.status == TaskStatus::Skipped));

    // Cancelling a terminal execution is not honored twice.
    assert!(!h.service.cancel(&execution.execution_id).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn resubmission_gets_fresh_rows_per_execution() {
    let h = harness(MockProvider::default()).await;
    let strategy_id = balanced_one_hour_id(&h.analysis).await;
    let request = OnboardingRequest {
        symbol: "ETH".to_string(),
        mode: OnboardingMode::Selective,
        selected_strategy_ids: vec![strategy_id],
        filter_params: None,
        custom_strategies: vec![],
    };

    let (first, first_tasks) = match h.service.submit(&request).await.unwrap() {
        SubmitOutcome::Accepted { execution, tasks } => (execution, tasks),
        other => panic!("expected acceptance, got {:?}", other),
    };
    let (second, second_tasks) = match h.service.submit(&request).await.unwrap() {
        SubmitOutcome::Accepted { execution, tasks } => (execution, tasks),
        other => panic!("expected acceptance, got {:?}", other),
    };
    assert_ne!(first.execution_id, second.execution_id);
    assert_eq!(first_tasks.len(), 1);
    assert_eq!(second_tasks.len(), 1);

    // Uniqueness is per execution; both rows remain queryable.
    assert_eq!(
        h.analysis
            .tasks_for_execution(&first.execution_id)
            .await
            .unwrap()
            .len(),
        1
    );
    assert_eq!(
        h.analysis
            .tasks_for_execution(&second.execution_id)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn progress_report_exposes_task_states() {
    let h = harness(MockProvider::default()).await;
    let strategy_id = balanced_one_hour_id(&h.analysis).await;
    let request = OnboardingRequest {
        symbol: "SOL".to_string(),
        mode: OnboardingMode::Selective,
        selected_strategy_ids: vec![strategy_id],
        filter_params: None,
        custom_strategies: vec![],
    };
    let (execution, tasks) = match h.service.submit(&request).await.unwrap() {
        SubmitOutcome::Accepted { execution, tasks } => (execution, tasks),
        other => panic!("expected acceptance, got {:?}", other),
    };

    let before = h
        .service
        .execution_report(&execution.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(before.tasks.len(), 1);
    assert_eq!(before.tasks[0].status, "pending");

    h.service
        .run_to_completion(&execution, tasks)
        .await
        .unwrap();

    let after = h
        .service
        .execution_report(&execution.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.status, ExecutionStatus::Success);
    assert_eq!(after.progress_percent, 100.0);
    assert_eq!(after.tasks[0].status, "completed");

    // Unknown executions are a clean None, not an error.
    assert!(
        h.service
            .execution_report("symbol_addition_00000000000000_deadbeef")
            .await
            .unwrap()
            .is_none()
    );
}
