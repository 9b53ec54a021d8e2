// Full runs through `Environment` over an in-memory store and a fake
// process supervisor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use overrun::dag::{FingerprintInput, HealthCheck, TaskDefinition, TaskGraph};
use overrun::engine::{Environment, SkipReason, TaskFailure, TaskStatus};
use overrun::errors::OverrunError;
use overrun::exec::{HealthStatus, StopResult};
use overrun::fingerprint::Fingerprinter;
use overrun::state::{MemoryMemo, MemoryStateStore, PersistedRecord, RecordStatus, StateStore};
use overrun::types::RestartPolicy;
use overrun_test_utils::builders::{fast_options, persistent, transient};
use overrun_test_utils::fake_supervisor::FakeSupervisor;
use overrun_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Shared state that survives across "invocations".
struct Harness {
    store: Arc<MemoryStateStore>,
    memo: Arc<MemoryMemo>,
    sup: FakeSupervisor,
}

impl Harness {
    fn new(sup: FakeSupervisor) -> Self {
        init_tracing();
        Self {
            store: Arc::new(MemoryStateStore::new()),
            memo: Arc::new(MemoryMemo::new()),
            sup,
        }
    }

    fn env(&self, defs: Vec<TaskDefinition>) -> Environment {
        Environment::new(
            TaskGraph::build(defs).expect("valid graph"),
            self.store.clone(),
            Arc::new(self.sup.clone()),
        )
        .with_memo(self.memo.clone())
        .with_options(fast_options())
    }
}

fn db() -> TaskDefinition {
    let mut def = persistent("db", &[]);
    def.health_check = Some(HealthCheck::Command("pg_isready".to_string()));
    def
}

fn migrate(version: &str) -> TaskDefinition {
    let mut def = transient("migrate", &["db"]);
    def.fingerprint_inputs = vec![FingerprintInput::Value(version.to_string())];
    def
}

fn api() -> TaskDefinition {
    persistent("api", &["migrate"])
}

fn stack(version: &str) -> Vec<TaskDefinition> {
    vec![db(), migrate(version), api()]
}

fn satisfied() -> TaskStatus {
    TaskStatus::Skipped(SkipReason::AlreadySatisfied)
}

fn upstream(name: &str) -> TaskStatus {
    TaskStatus::Skipped(SkipReason::UpstreamFailed {
        upstream: name.to_string(),
    })
}

#[tokio::test]
async fn first_run_starts_everything_in_order() -> TestResult {
    let h = Harness::new(FakeSupervisor::new());
    let report = with_timeout(h.env(stack("v1")).run(&[])).await?;

    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(h.sup.starts(), vec!["db", "migrate", "api"]);
    for name in ["db", "migrate", "api"] {
        assert_eq!(report.status_of(name), Some(&TaskStatus::Succeeded));
    }
    assert_eq!(report.summary(), "3 tasks ok");

    let record = h.store.get("db")?.expect("db record");
    assert_eq!(record.last_known_status, RecordStatus::Running);
    assert_eq!(Some(&record.handle), report.get("db").and_then(|r| r.handle.as_ref()));
    assert!(h.store.get("migrate")?.is_none(), "transient tasks have no record");
    Ok(())
}

#[tokio::test]
async fn second_run_with_same_inputs_starts_nothing() -> TestResult {
    let h = Harness::new(FakeSupervisor::new());
    with_timeout(h.env(stack("v1")).run(&[])).await?;
    let before = h.store.load()?;

    let report = with_timeout(h.env(stack("v1")).run(&[])).await?;

    assert!(report.is_success());
    assert_eq!(h.sup.starts().len(), 3, "no new processes");
    for name in ["db", "migrate", "api"] {
        assert_eq!(report.status_of(name), Some(&satisfied()));
    }
    assert_eq!(h.store.load()?, before);
    Ok(())
}

#[tokio::test]
async fn changed_input_reruns_exactly_that_task() -> TestResult {
    let h = Harness::new(FakeSupervisor::new());
    with_timeout(h.env(stack("v1")).run(&[])).await?;

    let report = with_timeout(h.env(stack("v2")).run(&[])).await?;

    assert_eq!(report.status_of("migrate"), Some(&TaskStatus::Succeeded));
    assert_eq!(report.status_of("db"), Some(&satisfied()));
    assert_eq!(report.status_of("api"), Some(&satisfied()));
    assert_eq!(h.sup.start_count("migrate"), 2);
    assert_eq!(h.sup.start_count("api"), 1);
    Ok(())
}

#[tokio::test]
async fn changed_persistent_input_replaces_the_instance() -> TestResult {
    let h = Harness::new(FakeSupervisor::new());
    with_timeout(h.env(stack("v1")).run(&[])).await?;
    let old = h.store.get("db")?.expect("db record");

    let mut defs = stack("v1");
    defs[0].fingerprint_inputs = vec![FingerprintInput::Value("port=5433".to_string())];
    let report = with_timeout(h.env(defs).run(&[])).await?;

    assert_eq!(report.status_of("db"), Some(&TaskStatus::Succeeded));
    assert_eq!(h.sup.stops(), vec!["db"]);
    let new = h.store.get("db")?.expect("db record");
    assert_ne!(new.handle, old.handle);
    assert_ne!(new.fingerprint, old.fingerprint);
    Ok(())
}

#[tokio::test]
async fn failure_is_isolated_to_its_dependents() -> TestResult {
    let h = Harness::new(FakeSupervisor::new().exit_code("a", 1));
    let defs = vec![transient("a", &[]), transient("b", &["a"]), transient("c", &[])];

    let report = with_timeout(h.env(defs).run(&[])).await?;

    assert_eq!(
        report.status_of("a"),
        Some(&TaskStatus::Failed(TaskFailure::Exited(1)))
    );
    assert_eq!(report.status_of("b"), Some(&upstream("a")));
    assert_eq!(report.status_of("c"), Some(&TaskStatus::Succeeded));
    assert!(!report.is_success());
    assert_eq!(report.summary(), "1 task failed: a (exited with code 1)");
    assert!(!h.sup.starts().contains(&"b".to_string()));
    Ok(())
}

#[tokio::test]
async fn failed_migration_keeps_db_and_skips_api() -> TestResult {
    let h = Harness::new(FakeSupervisor::new().exit_code("migrate", 1));

    let report = with_timeout(h.env(stack("v1")).run(&[])).await?;

    assert_eq!(report.status_of("db"), Some(&TaskStatus::Succeeded));
    assert_eq!(
        report.status_of("migrate"),
        Some(&TaskStatus::Failed(TaskFailure::Exited(1)))
    );
    assert_eq!(report.status_of("api"), Some(&upstream("migrate")));
    assert!(h.sup.running().contains("db"));
    assert!(h.store.get("db")?.is_some());

    // Fix the migration; the next run retries it even though inputs are
    // unchanged, and leaves the running db alone.
    let _ = h.sup.clone().exit_code("migrate", 0);
    let report = with_timeout(h.env(stack("v1")).run(&[])).await?;
    assert_eq!(report.status_of("db"), Some(&satisfied()));
    assert_eq!(report.status_of("migrate"), Some(&TaskStatus::Succeeded));
    assert_eq!(report.status_of("api"), Some(&TaskStatus::Succeeded));
    Ok(())
}

#[tokio::test]
async fn spawn_failure_fails_the_task() -> TestResult {
    let h = Harness::new(FakeSupervisor::new().fail_spawn("migrate"));

    let report = with_timeout(h.env(stack("v1")).run(&[])).await?;

    assert!(matches!(
        report.status_of("migrate"),
        Some(TaskStatus::Failed(TaskFailure::Spawn(_)))
    ));
    assert_eq!(report.status_of("api"), Some(&upstream("migrate")));
    Ok(())
}

#[tokio::test]
async fn requested_subset_runs_its_closure_only() -> TestResult {
    let h = Harness::new(FakeSupervisor::new());

    let report = with_timeout(h.env(stack("v1")).run(&["migrate".to_string()])).await?;

    assert_eq!(h.sup.starts(), vec!["db", "migrate"]);
    assert!(report.get("api").is_none());
    Ok(())
}

#[tokio::test]
async fn unknown_task_is_rejected_before_anything_runs() {
    let h = Harness::new(FakeSupervisor::new());

    let err = h.env(stack("v1")).run(&["nope".to_string()]).await.unwrap_err();

    assert!(matches!(err, OverrunError::TaskNotFound(name) if name == "nope"));
    assert!(h.sup.starts().is_empty());
}

#[tokio::test]
async fn dead_instance_is_restarted_on_next_run() -> TestResult {
    let h = Harness::new(FakeSupervisor::new());
    with_timeout(h.env(stack("v1")).run(&[])).await?;

    h.sup.kill("db", 137);
    let env = h.env(stack("v1"));
    let status = env.status().await?;
    assert_eq!(status.get("db"), Some(&None), "dead db shows as not running");
    assert!(status.get("api").is_some_and(Option::is_some));

    let report = with_timeout(env.run(&[])).await?;
    assert_eq!(report.status_of("db"), Some(&TaskStatus::Succeeded));
    assert_eq!(report.status_of("migrate"), Some(&satisfied()));
    assert_eq!(report.status_of("api"), Some(&satisfied()));
    assert_eq!(h.sup.start_count("db"), 2);
    Ok(())
}

#[tokio::test]
async fn degraded_instance_is_left_alone_with_never_policy() -> TestResult {
    let h = Harness::new(FakeSupervisor::new());
    let handle = h.sup.adopt("db");
    let fingerprint = Fingerprinter::new(".").fingerprint(&db())?;
    h.store.put(
        "db",
        &PersistedRecord::new(fingerprint, handle.clone(), RecordStatus::Running),
    )?;
    h.sup.health("db", [HealthStatus::Unhealthy]);

    let report = with_timeout(h.env(stack("v1")).run(&[])).await?;

    assert_eq!(
        report.status_of("db"),
        Some(&TaskStatus::Skipped(SkipReason::LeftDegraded))
    );
    assert_eq!(report.status_of("migrate"), Some(&TaskStatus::Succeeded));
    assert!(report.is_success());
    assert!(h.sup.stops().is_empty());
    let record = h.store.get("db")?.expect("db record");
    assert_eq!(record.last_known_status, RecordStatus::Degraded);
    assert_eq!(record.handle, handle);
    Ok(())
}

#[tokio::test]
async fn degraded_instance_with_changed_inputs_is_replaced_despite_never_policy() -> TestResult {
    let h = Harness::new(FakeSupervisor::new());
    let mut old = db();
    old.fingerprint_inputs = vec![FingerprintInput::Value("v1".to_string())];
    let handle = h.sup.adopt("db");
    let fingerprint = Fingerprinter::new(".").fingerprint(&old)?;
    h.store.put(
        "db",
        &PersistedRecord::new(fingerprint.clone(), handle.clone(), RecordStatus::Running),
    )?;
    h.sup
        .health("db", [HealthStatus::Unhealthy, HealthStatus::Healthy]);

    let mut new = db();
    new.fingerprint_inputs = vec![FingerprintInput::Value("v2".to_string())];
    assert_eq!(new.restart_policy, RestartPolicy::Never);
    let report = with_timeout(h.env(vec![new]).run(&[])).await?;

    assert_eq!(report.status_of("db"), Some(&TaskStatus::Succeeded));
    assert_eq!(h.sup.stops(), vec!["db"]);
    assert_eq!(h.sup.start_count("db"), 1);
    let record = h.store.get("db")?.expect("db record");
    assert_ne!(record.handle, handle);
    assert_ne!(record.fingerprint, fingerprint);
    assert_eq!(record.last_known_status, RecordStatus::Running);
    Ok(())
}

#[tokio::test]
async fn degraded_instance_is_replaced_when_policy_allows() -> TestResult {
    let h = Harness::new(FakeSupervisor::new());
    let mut db = db();
    db.restart_policy = RestartPolicy::OnFailure;
    let handle = h.sup.adopt("db");
    let fingerprint = Fingerprinter::new(".").fingerprint(&db)?;
    h.store.put(
        "db",
        &PersistedRecord::new(fingerprint, handle.clone(), RecordStatus::Running),
    )?;
    h.sup
        .health("db", [HealthStatus::Unhealthy, HealthStatus::Healthy]);

    let report = with_timeout(h.env(vec![db]).run(&[])).await?;

    assert_eq!(report.status_of("db"), Some(&TaskStatus::Succeeded));
    assert_eq!(h.sup.stops(), vec!["db"]);
    let record = h.store.get("db")?.expect("db record");
    assert_ne!(record.handle, handle);
    assert_eq!(record.last_known_status, RecordStatus::Running);
    Ok(())
}

#[tokio::test]
async fn crashing_service_is_retried_until_attempts_run_out() -> TestResult {
    let h = Harness::new(FakeSupervisor::new().dies_after_start("api", 2));
    let mut api = persistent("api", &[]);
    api.restart_policy = RestartPolicy::OnFailure;

    let report = with_timeout(h.env(vec![api]).run(&[])).await?;

    assert_eq!(
        report.status_of("api"),
        Some(&TaskStatus::Failed(TaskFailure::Exited(2)))
    );
    assert_eq!(report.get("api").map(|r| r.attempts), Some(3));
    assert_eq!(h.sup.start_count("api"), 3);
    assert!(h.store.get("api")?.is_none());
    Ok(())
}

#[tokio::test]
async fn crashing_service_with_never_policy_gets_one_attempt() -> TestResult {
    let h = Harness::new(FakeSupervisor::new().dies_after_start("api", 2));

    let report = with_timeout(h.env(vec![persistent("api", &[])]).run(&[])).await?;

    assert_eq!(
        report.status_of("api"),
        Some(&TaskStatus::Failed(TaskFailure::Exited(2)))
    );
    assert_eq!(h.sup.start_count("api"), 1);
    Ok(())
}

#[tokio::test]
async fn never_healthy_service_is_stopped_and_failed() -> TestResult {
    let h = Harness::new(FakeSupervisor::new());
    h.sup.health("db", [HealthStatus::Unhealthy]);

    let report = with_timeout(h.env(stack("v1")).run(&[])).await?;

    assert_eq!(
        report.status_of("db"),
        Some(&TaskStatus::Failed(TaskFailure::Unhealthy { attempts: 1 }))
    );
    assert_eq!(h.sup.stops(), vec!["db"]);
    assert!(h.sup.running().is_empty());
    assert!(h.store.get("db")?.is_none());
    assert_eq!(report.status_of("migrate"), Some(&upstream("db")));
    assert_eq!(report.status_of("api"), Some(&upstream("db")));
    Ok(())
}

#[tokio::test]
async fn cancel_stops_transients_and_skips_pending() -> TestResult {
    let h = Harness::new(FakeSupervisor::new().runs_for("slow", Duration::from_secs(10)));
    let defs = vec![transient("slow", &[]), transient("after", &["slow"])];
    let env = h.env(defs);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _ = cancel_tx.send(true);
    });

    let report = with_timeout(env.run_with_cancel(&[], cancel_rx)).await?;

    let cancelled = TaskStatus::Skipped(SkipReason::Cancelled);
    assert_eq!(report.status_of("slow"), Some(&cancelled));
    assert_eq!(report.status_of("after"), Some(&cancelled));
    assert_eq!(h.sup.stops(), vec!["slow"]);
    assert!(report.is_success(), "cancellation is not a failure");
    Ok(())
}

#[tokio::test]
async fn cancel_leaves_persistent_tasks_running() -> TestResult {
    let h = Harness::new(FakeSupervisor::new().runs_for("slow", Duration::from_secs(10)));
    let mut web = persistent("web", &[]);
    web.health_check = Some(HealthCheck::Command("curl -f localhost".to_string()));
    h.sup.health("web", [HealthStatus::Unhealthy]);
    let defs = vec![persistent("svc", &[]), web, transient("slow", &[])];
    let mut options = fast_options();
    options.health_timeout = Duration::from_secs(10);
    let env = h.env(defs).with_options(options);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _ = cancel_tx.send(true);
    });

    let report = with_timeout(env.run_with_cancel(&[], cancel_rx)).await?;

    let cancelled = TaskStatus::Skipped(SkipReason::Cancelled);
    assert_eq!(report.status_of("svc"), Some(&TaskStatus::Succeeded));
    assert_eq!(report.status_of("web"), Some(&cancelled));
    assert_eq!(report.status_of("slow"), Some(&cancelled));

    // Only the transient task was stopped.
    assert_eq!(h.sup.stops(), vec!["slow"]);
    let running = h.sup.running();
    assert!(running.contains("svc"));
    assert!(running.contains("web"));

    let svc = h.store.get("svc")?.expect("svc record");
    assert_eq!(svc.last_known_status, RecordStatus::Running);
    // Cancelled during readiness: the next invocation reconciles it.
    let web = h.store.get("web")?.expect("web record");
    assert_eq!(web.last_known_status, RecordStatus::Starting);
    Ok(())
}

#[tokio::test]
async fn concurrency_limit_is_respected() -> TestResult {
    let mut sup = FakeSupervisor::new();
    let names = ["t1", "t2", "t3", "t4", "t5"];
    for name in names {
        sup = sup.runs_for(name, Duration::from_millis(20));
    }
    let h = Harness::new(sup);
    let defs = names.iter().map(|n| transient(n, &[])).collect();

    let mut options = fast_options();
    options.concurrency = 2;
    let report = with_timeout(h.env(defs).with_options(options).run(&[])).await?;

    assert!(report.is_success());
    assert_eq!(h.sup.starts().len(), names.len());
    assert!(h.sup.peak_concurrency() <= 2, "peak {}", h.sup.peak_concurrency());
    Ok(())
}

#[tokio::test]
async fn stop_semantics() -> TestResult {
    let h = Harness::new(FakeSupervisor::new());
    let env = h.env(stack("v1"));
    with_timeout(env.run(&[])).await?;

    assert!(matches!(
        env.stop("nope").await,
        Err(OverrunError::TaskNotFound(_))
    ));
    assert!(matches!(
        env.stop("migrate").await,
        Err(OverrunError::NotPersistent(_))
    ));

    assert_eq!(env.stop("api").await?, StopResult::Terminated);
    assert!(h.store.get("api")?.is_none());
    assert!(!h.sup.running().contains("api"));
    assert_eq!(env.stop("api").await?, StopResult::AlreadyExited);

    // db keeps running.
    assert!(h.sup.running().contains("db"));
    Ok(())
}
