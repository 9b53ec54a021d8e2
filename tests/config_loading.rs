use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;

use overrun::config::{
    find_project_root, load_and_validate, load_and_validate_layered, load_from_path,
    resolve_config_path_from,
};
use overrun::dag::{FingerprintInput, HealthCheck, TaskGraph};
use overrun::errors::{DefinitionError, OverrunError};
use overrun::types::{RestartPolicy, TaskKind, TransientMemoMode};
use overrun_test_utils::builders::{ConfigFileBuilder, TaskConfigBuilder};

const STACK: &str = r#"
[config]
concurrency = 2
grace_timeout = "2s"
health_timeout = "10s"
transient_memo = "memory"

[config.retry]
base = "250ms"
max_attempts = 3

[task.db]
kind = "persistent"
cmd = "postgres -D data"
restart = "on-failure"
health = { tcp = "127.0.0.1:5432" }

[task.migrate]
cmd = "./migrate.sh"
after = ["db"]
inputs = [{ glob = "migrations/*.sql" }, { env = "DATABASE_URL" }]

[task.api]
kind = "persistent"
cmd = "./api"
after = ["migrate"]
env = { PORT = "8080" }
health = { log = "listening on" }
"#;

fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
    let path = dir.path().join("Overrun.toml");
    fs::write(&path, contents).unwrap();
    path
}

fn config_error(contents: &str) -> String {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, contents);
    match load_and_validate(&path) {
        Err(OverrunError::ConfigError(msg)) => msg,
        other => panic!("expected a config error, got {other:?}"),
    }
}

#[test]
fn parses_full_config() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, STACK);

    let cfg = load_and_validate(&path).unwrap();
    let options = cfg.executor_options();
    assert_eq!(options.concurrency, 2);
    assert_eq!(options.grace_timeout, Duration::from_secs(2));
    assert_eq!(options.health_interval, Duration::from_millis(500));
    assert_eq!(options.health_timeout, Duration::from_secs(10));
    assert_eq!(options.retry.base, Duration::from_millis(250));
    assert_eq!(options.retry.cap, Duration::from_secs(30));
    assert_eq!(options.retry.max_attempts, 3);
    assert_eq!(cfg.config.transient_memo, TransientMemoMode::Memory);
    assert_eq!(
        cfg.state_dir(Path::new("/work")),
        PathBuf::from("/work/.overrun/state")
    );

    let graph = TaskGraph::build(cfg.definitions()).unwrap();
    let db = graph.get("db").unwrap();
    assert_eq!(db.kind, TaskKind::Persistent);
    assert_eq!(db.restart_policy, RestartPolicy::OnFailure);
    assert_eq!(
        db.health_check,
        Some(HealthCheck::Tcp("127.0.0.1:5432".to_string()))
    );

    let migrate = graph.get("migrate").unwrap();
    assert_eq!(migrate.kind, TaskKind::Transient);
    assert!(migrate.depends_on.contains("db"));
    assert_eq!(
        migrate.fingerprint_inputs,
        vec![
            FingerprintInput::Glob("migrations/*.sql".to_string()),
            FingerprintInput::Env("DATABASE_URL".to_string()),
        ]
    );

    let api = graph.get("api").unwrap();
    assert_eq!(api.command.env.get("PORT").map(String::as_str), Some("8080"));
    assert_eq!(
        api.health_check,
        Some(HealthCheck::LogPattern("listening on".to_string()))
    );
}

#[test]
fn minimal_task_gets_defaults() {
    let cfg = ConfigFileBuilder::new()
        .with_task("build", TaskConfigBuilder::new("make").build())
        .build();

    let def = &cfg.definitions()[0];
    assert_eq!(def.kind, TaskKind::Transient);
    assert_eq!(def.restart_policy, RestartPolicy::Never);
    assert_eq!(cfg.executor_options().concurrency, 4);
    assert_eq!(cfg.config.transient_memo, TransientMemoMode::File);
}

#[test]
fn rejects_bad_settings() {
    let msg = config_error("[config]\nconcurrency = 0\n[task.a]\ncmd = \"true\"\n");
    assert!(msg.contains("concurrency"), "{msg}");

    let msg = config_error("[config]\ngrace_timeout = \"5 parsecs\"\n[task.a]\ncmd = \"true\"\n");
    assert!(msg.contains("grace_timeout"), "{msg}");

    let msg = config_error("[config.retry]\nmax_attempts = 0\n[task.a]\ncmd = \"true\"\n");
    assert!(msg.contains("max_attempts"), "{msg}");

    let msg = config_error("[config]\nconcurrency = 1\n");
    assert!(msg.contains("at least one"), "{msg}");
}

#[test]
fn rejects_bad_tasks() {
    let msg = config_error("[task.a]\ncmd = \"   \"\n");
    assert!(msg.contains("empty `cmd`"), "{msg}");

    let msg = config_error("[task.a]\ncmd = \"true\"\ninputs = [{ glob = \"src/[\" }]\n");
    assert!(msg.contains("invalid glob"), "{msg}");

    let msg = config_error("[task.a]\ncmd = \"true\"\nhealth = { tcp = \"127.0.0.1:1\" }\n");
    assert!(msg.contains("not persistent"), "{msg}");

    let msg = config_error(
        "[task.a]\nkind = \"persistent\"\ncmd = \"true\"\nhealth = { log = \"(unclosed\" }\n",
    );
    assert!(msg.contains("invalid log health pattern"), "{msg}");
}

#[test]
fn unknown_kind_is_a_parse_error() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[task.a]\nkind = \"daemon\"\ncmd = \"true\"\n");
    assert!(matches!(
        load_from_path(&path),
        Err(OverrunError::TomlError(_))
    ));
}

#[test]
fn graph_errors_surface_after_loading() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "[task.a]\ncmd = \"true\"\nafter = [\"b\"]\n[task.b]\ncmd = \"true\"\nafter = [\"a\"]\n",
    );

    let cfg = load_and_validate(&path).unwrap();
    let err = TaskGraph::build(cfg.definitions()).unwrap_err();
    assert!(matches!(err, DefinitionError::Cycle { .. }));
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
        load_and_validate(dir.path().join("nope.toml")),
        Err(OverrunError::IoError(_))
    ));
}

#[test]
fn explicit_path_wins() {
    let explicit = Path::new("/somewhere/else.toml");
    let resolved = resolve_config_path_from(Some(explicit), Some("/env.toml"), Path::new("/"));
    assert_eq!(resolved.unwrap(), explicit.to_path_buf());
}

#[test]
fn env_var_must_name_an_existing_file() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, STACK);
    let env = path.to_string_lossy().to_string();

    let resolved = resolve_config_path_from(None, Some(env.as_str()), Path::new("/")).unwrap();
    assert_eq!(resolved, path);

    let missing = dir.path().join("gone.toml").to_string_lossy().to_string();
    match resolve_config_path_from(None, Some(missing.as_str()), dir.path()) {
        Err(OverrunError::ConfigError(msg)) => assert!(msg.contains("OVERRUN_CONFIG"), "{msg}"),
        other => panic!("expected a config error, got {other:?}"),
    }
}

#[test]
fn project_root_is_found_above_the_working_directory() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, STACK);
    let nested = dir.path().join("services/api/src");
    fs::create_dir_all(&nested).unwrap();

    assert_eq!(find_project_root(&nested), Some(dir.path().to_path_buf()));
    assert_eq!(resolve_config_path_from(None, None, &nested).unwrap(), path);
    // An empty variable counts as unset.
    assert_eq!(resolve_config_path_from(None, Some(" "), &nested).unwrap(), path);
}

#[test]
fn state_dir_marks_a_project_root() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join(".overrun/state")).unwrap();
    let nested = dir.path().join("web");
    fs::create_dir_all(&nested).unwrap();

    assert_eq!(
        resolve_config_path_from(None, None, &nested).unwrap(),
        dir.path().join("Overrun.toml")
    );
}

#[test]
fn user_config_fills_in_missing_settings() {
    let dir = TempDir::new().unwrap();
    let project = write_config(
        &dir,
        "[config]\nconcurrency = 2\n[config.retry]\nbase = \"250ms\"\n[task.a]\ncmd = \"true\"\n",
    );
    let user = dir.path().join("user.toml");
    fs::write(
        &user,
        "[config]\nconcurrency = 8\ngrace_timeout = \"9s\"\n[config.retry]\nbase = \"1s\"\ncap = \"7s\"\n",
    )
    .unwrap();

    let options = load_and_validate_layered(&project, Some(user.as_path()))
        .unwrap()
        .executor_options();
    assert_eq!(options.concurrency, 2);
    assert_eq!(options.grace_timeout, Duration::from_secs(9));
    assert_eq!(options.retry.base, Duration::from_millis(250));
    assert_eq!(options.retry.cap, Duration::from_secs(7));
}

#[test]
fn user_config_may_not_define_tasks() {
    let dir = TempDir::new().unwrap();
    let project = write_config(&dir, "[task.a]\ncmd = \"true\"\n");
    let user = dir.path().join("user.toml");
    fs::write(&user, "[task.b]\ncmd = \"true\"\n").unwrap();

    match load_and_validate_layered(&project, Some(user.as_path())) {
        Err(OverrunError::ConfigError(msg)) => assert!(msg.contains("[config]"), "{msg}"),
        other => panic!("expected a config error, got {other:?}"),
    }
}

#[test]
fn task_output_resolves_against_its_working_directory() {
    let cfg = ConfigFileBuilder::new()
        .with_task(
            "web",
            TaskConfigBuilder::new("./serve")
                .persistent()
                .output("logs/web.out")
                .build(),
        )
        .build();

    let mut def = cfg.definitions().remove(0);
    assert_eq!(
        def.command.output_path(Path::new("/work")),
        Some(PathBuf::from("/work/logs/web.out"))
    );
    def.command.cwd = Some("web".into());
    assert_eq!(
        def.command.output_path(Path::new("/work")),
        Some(PathBuf::from("/work/web/logs/web.out"))
    );
}
