//! End-to-end engine flows over the in-memory store and local backend.
//!
//! These tests drive full service lifecycles through the reconciliation
//! runner: grid exploration, sequential scans, duplicate detection, and
//! the failure paths.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use lattice_core::{RunnerConfig, ServiceStatus, TaskSpec};
use lattice_queue::{LocalAdapter, ProgramRegistry};
use lattice_services::{
    build_service, ConvergenceCriteria, GridServiceInput, ScanAxis, ScanServiceInput, Service,
    ServiceInput, ServiceRunner,
};
use lattice_storage::{MemoryStore, ServiceStore, TaskStore};

/// Deterministic mock backend: "optimize" reports the sum of scanned
/// parameters as its energy, "crash" always fails.
fn registry() -> Arc<ProgramRegistry> {
    let mut registry = ProgramRegistry::new();

    registry.register("optimize", |spec: &TaskSpec| {
        let params = spec
            .kwargs
            .get("parameters")
            .and_then(Value::as_object)
            .ok_or_else(|| "missing 'parameters' kwarg".to_string())?;
        let energy: f64 = params.values().filter_map(Value::as_f64).sum();
        Ok(json!({"final": {"energy": energy}, "energy": energy}))
    });

    registry.register("crash", |_spec: &TaskSpec| Err("engine exploded".to_string()));

    Arc::new(registry)
}

fn runner(store: Arc<MemoryStore>) -> ServiceRunner<MemoryStore> {
    let adapter = Box::new(LocalAdapter::new(registry()));
    ServiceRunner::new(store, adapter, RunnerConfig::default())
}

/// A 3x2 grid over two scanned parameters.
fn grid_input(function: &str) -> GridServiceInput {
    GridServiceInput {
        program: "mock".into(),
        function: function.into(),
        scans: vec![
            ScanAxis {
                parameter: "distance".into(),
                values: vec![1.0, 2.0, 3.0],
            },
            ScanAxis {
                parameter: "angle".into(),
                values: vec![10.0, 20.0],
            },
        ],
        starting_point: None,
        base: Map::new(),
        metadata: Map::new(),
    }
}

fn scan_input(values: Vec<f64>, convergence: Option<ConvergenceCriteria>) -> ScanServiceInput {
    ScanServiceInput {
        program: "mock".into(),
        function: "optimize".into(),
        parameter: "distance".into(),
        values,
        start_index: 0,
        base: Map::new(),
        convergence,
        metadata: Map::new(),
    }
}

#[tokio::test]
async fn grid_exploration_resolves_every_point() {
    let store = Arc::new(MemoryStore::new());
    let mut runner = runner(Arc::clone(&store));

    let id = runner
        .submit_service(ServiceInput::GridExploration(grid_input("optimize")))
        .await
        .unwrap();
    assert!(runner.await_services().await.unwrap());

    let record = store.get_service(&id).await.unwrap();
    assert_eq!(record.status, ServiceStatus::Complete);

    let points = record.output["points"].as_object().unwrap();
    assert_eq!(points.len(), 6, "every grid point should resolve");
    assert_eq!(record.output["num_points"], json!(6));

    // distance index 2 (3.0) + angle index 1 (20.0).
    assert_eq!(points["2,1"]["final"]["energy"], json!(23.0));
    // One task per grid point, no re-execution.
    assert_eq!(store.task_count(), 6);
}

#[tokio::test]
async fn duplicate_services_reuse_identical_tasks() {
    let store = Arc::new(MemoryStore::new());
    let mut runner = runner(Arc::clone(&store));

    let first = runner
        .submit_service(ServiceInput::GridExploration(grid_input("optimize")))
        .await
        .unwrap();
    assert!(runner.await_services().await.unwrap());
    let tasks_after_first = store.task_count();

    // Meaning-preserving metadata change: new service hash, same task specs.
    let mut augmented = grid_input("optimize");
    augmented
        .metadata
        .insert("comment".into(), json!("waffles"));
    let second = runner
        .submit_service(ServiceInput::GridExploration(augmented))
        .await
        .unwrap();
    assert_ne!(first, second);
    assert!(runner.await_services().await.unwrap());

    // Task-level dedup prevented any re-execution.
    assert_eq!(store.task_count(), tasks_after_first);

    let rec1 = store.get_service(&first).await.unwrap();
    let rec2 = store.get_service(&second).await.unwrap();
    assert_eq!(rec1.status, ServiceStatus::Complete);
    assert_eq!(rec2.status, ServiceStatus::Complete);
    assert_ne!(rec1.hash_index, rec2.hash_index);
    assert_eq!(rec1.output["points"], rec2.output["points"]);

    // Byte-identical input resolves to the existing service.
    let third = runner
        .submit_service(ServiceInput::GridExploration(grid_input("optimize")))
        .await
        .unwrap();
    assert_eq!(third, first);
}

#[tokio::test]
async fn failing_task_errors_the_service() {
    let store = Arc::new(MemoryStore::new());
    let mut runner = runner(Arc::clone(&store));

    let id = runner
        .submit_service(ServiceInput::GridExploration(grid_input("crash")))
        .await
        .unwrap();
    assert!(runner.await_services().await.unwrap());

    let record = store.get_service(&id).await.unwrap();
    assert_eq!(record.status, ServiceStatus::Error);
    let message = record.error_message.unwrap();
    assert!(message.contains("did not execute successfully"));
    assert!(message.contains("engine exploded"));
}

#[tokio::test]
async fn one_failing_service_does_not_stop_the_others() {
    let store = Arc::new(MemoryStore::new());
    let mut runner = runner(Arc::clone(&store));

    let bad = runner
        .submit_service(ServiceInput::GridExploration(grid_input("crash")))
        .await
        .unwrap();
    let good = runner
        .submit_service(ServiceInput::GridExploration(grid_input("optimize")))
        .await
        .unwrap();
    assert!(runner.await_services().await.unwrap());

    assert_eq!(
        store.get_service(&bad).await.unwrap().status,
        ServiceStatus::Error
    );
    assert_eq!(
        store.get_service(&good).await.unwrap().status,
        ServiceStatus::Complete
    );
}

#[tokio::test]
async fn iterate_is_idempotent_while_a_round_is_outstanding() {
    let store = Arc::new(MemoryStore::new());
    let task_store: Arc<dyn TaskStore> = Arc::clone(&store) as Arc<dyn TaskStore>;

    let mut service = build_service(
        task_store,
        ServiceInput::GridExploration(grid_input("optimize")),
    )
    .unwrap();
    assert_eq!(service.status(), ServiceStatus::Waiting);

    // First iterate submits the starting round.
    assert!(!service.iterate().await.unwrap());
    assert_eq!(service.status(), ServiceStatus::Running);
    let submitted = store.task_count();
    assert_eq!(submitted, 1);

    // The round never resolves (no backend): repeated polls are no-ops.
    for _ in 0..3 {
        assert!(!service.iterate().await.unwrap());
        assert_eq!(service.status(), ServiceStatus::Running);
    }
    assert_eq!(store.task_count(), submitted, "no second round submitted");
}

#[tokio::test]
async fn scan_converges_and_stops_early() {
    let store = Arc::new(MemoryStore::new());
    let mut runner = runner(Arc::clone(&store));

    let criteria = ConvergenceCriteria {
        metric: "energy".into(),
        tolerance: 0.05,
        max_rounds: 10,
    };
    let id = runner
        .submit_service(ServiceInput::SequentialScan(scan_input(
            vec![1.0, 0.5, 0.49, 0.0],
            Some(criteria),
        )))
        .await
        .unwrap();
    assert!(runner.await_services().await.unwrap());

    let record = store.get_service(&id).await.unwrap();
    assert_eq!(record.status, ServiceStatus::Complete);
    // |0.49 - 0.5| is within tolerance: the fourth value never runs.
    assert_eq!(record.output["num_steps"], json!(3));
    assert_eq!(record.output["final"]["energy"], json!(0.49));
    assert_eq!(store.task_count(), 3);
}

#[tokio::test]
async fn scan_without_criteria_walks_the_whole_path() {
    let store = Arc::new(MemoryStore::new());
    let mut runner = runner(Arc::clone(&store));

    let id = runner
        .submit_service(ServiceInput::SequentialScan(scan_input(
            vec![1.0, 2.0, 3.0],
            None,
        )))
        .await
        .unwrap();
    assert!(runner.await_services().await.unwrap());

    let record = store.get_service(&id).await.unwrap();
    assert_eq!(record.status, ServiceStatus::Complete);
    assert_eq!(record.output["num_steps"], json!(3));
    assert_eq!(record.output["final"]["energy"], json!(3.0));
}

#[tokio::test]
async fn non_converging_scan_fails_at_the_round_cap() {
    let store = Arc::new(MemoryStore::new());
    let mut runner = runner(Arc::clone(&store));

    let criteria = ConvergenceCriteria {
        metric: "energy".into(),
        tolerance: 1e-6,
        max_rounds: 2,
    };
    let id = runner
        .submit_service(ServiceInput::SequentialScan(scan_input(
            vec![1.0, 2.0, 3.0, 4.0],
            Some(criteria),
        )))
        .await
        .unwrap();
    assert!(runner.await_services().await.unwrap());

    let record = store.get_service(&id).await.unwrap();
    assert_eq!(record.status, ServiceStatus::Error);
    assert!(record.error_message.unwrap().contains("convergence failure"));
}

#[tokio::test]
async fn build_failure_records_an_error_service_without_running() {
    let store = Arc::new(MemoryStore::new());
    let mut runner = runner(Arc::clone(&store));

    let mut bad = scan_input(vec![1.0, 2.0], None);
    bad.start_index = 10;
    let id = runner
        .submit_service(ServiceInput::SequentialScan(bad))
        .await
        .unwrap();

    let record = store.get_service(&id).await.unwrap();
    assert_eq!(record.status, ServiceStatus::Error);
    assert!(record.error_message.unwrap().contains("service build"));
    assert_eq!(runner.active_services(), 0);
    assert_eq!(store.task_count(), 0, "an unbuildable service never submits work");
}

#[tokio::test]
async fn withdrawn_service_leaves_backend_jobs_to_drain() {
    let store = Arc::new(MemoryStore::new());
    let mut runner = runner(Arc::clone(&store));

    let id = runner
        .submit_service(ServiceInput::GridExploration(grid_input("optimize")))
        .await
        .unwrap();

    // One pass dispatches the starting round to the backend.
    runner.tick().await.unwrap();
    assert!(runner.withdraw_service(&id));
    assert_eq!(runner.active_services(), 0);

    // The outstanding job still drains; nothing hangs or errors.
    assert!(runner.await_services().await.unwrap());
    let record = store.get_service(&id).await.unwrap();
    assert_eq!(record.status, ServiceStatus::Running, "left where it was withdrawn");
}
