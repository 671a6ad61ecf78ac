use forkline_core::{Database, MessageStatus, RunKind, RunStatus, ThreadStatus, ThreadStore};
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("forkline/forkline.db")
    }

    fn open_db(&self) -> Database {
        let db = Database::open(&self.db_path()).expect("failed to open db");
        db.migrate().expect("failed to migrate db");
        db
    }
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("forkline"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("failed to execute forkline: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "forkline {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

fn run_ok(env: &CliTestEnv, args: &[&str]) -> String {
    let output = run_bin(env, args);
    assert_success(args, &output);
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn demo_builds_branching_thread_in_xdg_database() {
    let env = CliTestEnv::new();

    let stdout = run_ok(&env, &["demo", "demo-thread"]);
    assert!(stdout.contains("regenerate run"), "got:\n{stdout}");
    let lines: Vec<_> = stdout.lines().collect();
    assert!(lines[3].starts_with("send_new run ") && lines[3].ends_with(": interrupted"), "got:\n{stdout}");
    assert!(lines[5].starts_with("resume run ") && lines[5].ends_with(": complete"), "got:\n{stdout}");

    let db_path = env.db_path();
    assert!(db_path.exists(), "database file should exist at {}", db_path.display());

    let db = env.open_db();
    let snapshot = db
        .load_thread("demo-thread")
        .expect("load failed")
        .expect("demo thread should be saved");
    // question, two replies, edited question and its reply, tool request,
    // the paused reply and the resumed reply
    assert_eq!(snapshot.messages.len(), 8);
    assert!(snapshot
        .messages
        .iter()
        .all(|entry| entry.message.status == MessageStatus::Complete));

    let runs = db.list_runs("demo-thread").expect("runs failed");
    let kinds: Vec<_> = runs.iter().map(|r| (r.kind, r.status)).collect();
    assert_eq!(
        kinds,
        vec![
            (RunKind::SendNew, RunStatus::Complete),
            (RunKind::Regenerate, RunStatus::Complete),
            (RunKind::Edit, RunStatus::Complete),
            (RunKind::SendNew, RunStatus::Interrupted),
            (RunKind::Resume, RunStatus::Complete),
        ]
    );

    let info = db
        .get_thread_info("demo-thread")
        .expect("info failed")
        .expect("catalog entry missing");
    assert_eq!(info.title.as_deref(), Some("Forkline demo"));
}

#[test]
fn show_prints_active_branch_with_sibling_positions() {
    let env = CliTestEnv::new();
    run_ok(&env, &["demo", "t1"]);

    let stdout = run_ok(&env, &["show", "t1"]);
    assert!(stdout.contains("Tell me a joke about Rust."), "got:\n{stdout}");
    assert!(stdout.contains("[  2/2] user"), "edited question is the second root:\n{stdout}");
    assert!(stdout.contains("tool delete_path"), "got:\n{stdout}");
    assert!(!stdout.contains("scarecrow"), "inactive branch leaked:\n{stdout}");
    assert!(!stdout.contains("Awaiting approval"), "got:\n{stdout}");

    // Switch back to the first reply of the original question.
    let db = env.open_db();
    let snapshot = db.load_thread("t1").expect("load failed").expect("missing");
    let original = snapshot
        .messages
        .iter()
        .find(|entry| entry.message.text().contains("scarecrow"))
        .map(|entry| entry.message.id.clone())
        .expect("first reply missing");
    drop(db);

    let siblings = run_ok(&env, &["siblings", "t1", &original]);
    assert!(siblings.contains("1/2"), "got:\n{siblings}");
    assert!(siblings.contains("2/2"), "got:\n{siblings}");

    let switched = run_ok(&env, &["switch", "t1", &original]);
    assert!(switched.contains(&original), "got:\n{switched}");

    let stdout = run_ok(&env, &["show", "t1"]);
    assert!(stdout.contains("scarecrow"), "got:\n{stdout}");
    assert!(!stdout.contains("borrow checker"), "got:\n{stdout}");
}

#[test]
fn threads_lists_and_catalog_commands_update_it() {
    let env = CliTestEnv::new();
    run_ok(&env, &["demo", "t1"]);

    let stdout = run_ok(&env, &["threads"]);
    assert!(stdout.contains("t1"), "got:\n{stdout}");
    assert!(stdout.contains("Forkline demo"), "got:\n{stdout}");

    run_ok(&env, &["rename", "t1", "Jokes"]);
    let stdout = run_ok(&env, &["threads"]);
    assert!(stdout.contains("Jokes"), "got:\n{stdout}");

    run_ok(&env, &["archive", "t1"]);
    let stdout = run_ok(&env, &["threads"]);
    assert!(stdout.contains("No threads."), "got:\n{stdout}");
    let stdout = run_ok(&env, &["threads", "--all"]);
    assert!(stdout.contains("archived"), "got:\n{stdout}");

    let db = env.open_db();
    let info = db.get_thread_info("t1").expect("info failed").expect("missing");
    assert_eq!(info.status, ThreadStatus::Archived);
    drop(db);

    run_ok(&env, &["delete", "t1"]);
    let db = env.open_db();
    assert!(db.get_thread_info("t1").expect("info failed").is_none());
    assert!(db.list_runs("t1").expect("runs failed").is_empty());
}

#[test]
fn runs_prints_audit_in_order() {
    let env = CliTestEnv::new();
    run_ok(&env, &["demo", "t1"]);

    let stdout = run_ok(&env, &["runs", "t1"]);
    let lines: Vec<_> = stdout.lines().collect();
    assert_eq!(lines.len(), 5, "got:\n{stdout}");
    assert!(lines[0].contains("send_new") && lines[0].contains("fresh"));
    assert!(lines[3].contains("interrupted"));
    assert!(lines[4].contains("resume"));
}

#[test]
fn export_then_import_reproduces_thread() {
    let env = CliTestEnv::new();
    run_ok(&env, &["demo", "source"]);

    let snapshot_path = env.home.join("source.json");
    let snapshot_arg = snapshot_path.to_string_lossy().into_owned();
    run_ok(&env, &["export", "source", "--output", &snapshot_arg]);
    assert!(snapshot_path.exists());

    let stdout = run_ok(&env, &["import", "copy", &snapshot_arg]);
    assert!(stdout.contains("Imported 8 message(s)"), "got:\n{stdout}");
    assert!(!stdout.contains("Orphaned"), "got:\n{stdout}");

    let original = run_ok(&env, &["show", "source"]);
    let copy = run_ok(&env, &["show", "copy"]);
    assert_eq!(original, copy);
}

#[test]
fn import_reports_orphans_and_recomputes_head() {
    let env = CliTestEnv::new();
    let snapshot = serde_json::json!({
        "head_id": "gone",
        "messages": [
            {
                "parent_id": null,
                "message": {
                    "id": "u1",
                    "role": "user",
                    "content": [{"type": "text", "text": "hello"}],
                    "parent_id": null,
                    "checkpoint_id": "cp-1",
                    "status": {"type": "complete"},
                    "created_at": "2026-01-01T00:00:00Z"
                }
            },
            {
                "parent_id": "missing",
                "message": {
                    "id": "stray",
                    "role": "assistant",
                    "content": [{"type": "text", "text": "lost"}],
                    "parent_id": "missing",
                    "checkpoint_id": null,
                    "status": {"type": "complete"},
                    "created_at": "2026-01-01T00:00:01Z"
                }
            }
        ]
    });
    let path = env.home.join("foreign.json");
    fs::write(&path, snapshot.to_string()).expect("failed to write snapshot");
    let path_arg = path.to_string_lossy().into_owned();

    let stdout = run_ok(&env, &["import", "foreign", &path_arg]);
    assert!(stdout.contains("Orphaned messages"), "got:\n{stdout}");
    assert!(stdout.contains("stray"), "got:\n{stdout}");
    assert!(stdout.contains("head is now u1"), "got:\n{stdout}");

    let shown = run_ok(&env, &["show", "foreign"]);
    assert!(shown.contains("hello"), "got:\n{shown}");
    assert!(!shown.contains("lost"), "got:\n{shown}");
}

#[test]
fn unknown_thread_fails_without_creating_it() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["show", "nope"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("thread not found: nope"), "got:\n{stderr}");

    let db = env.open_db();
    assert!(db.get_thread_info("nope").expect("info failed").is_none());
}

#[test]
fn db_flag_overrides_xdg_path() {
    let env = CliTestEnv::new();
    let custom = env.home.join("custom.db");
    let custom_arg = custom.to_string_lossy().into_owned();

    run_ok(&env, &["--db", &custom_arg, "demo", "t1"]);
    assert!(custom.exists());
    assert!(!env.db_path().exists());

    let stdout = run_ok(&env, &["threads", "--db", &custom_arg]);
    assert!(stdout.contains("t1"), "got:\n{stdout}");
}

#[test]
fn demo_streams_through_configured_engine_buffer() {
    let env = CliTestEnv::new();
    let config_dir = env.xdg_config.join("forkline");
    fs::create_dir_all(&config_dir).expect("failed to create config dir");
    fs::write(config_dir.join("config.toml"), "[engine]\nstream_buffer = 1\n")
        .expect("failed to write config");

    run_ok(&env, &["demo", "t1"]);

    let db = env.open_db();
    let snapshot = db.load_thread("t1").expect("load failed").expect("missing");
    assert_eq!(snapshot.messages.len(), 8);
    assert!(snapshot
        .messages
        .iter()
        .all(|entry| entry.message.status == MessageStatus::Complete));
}

#[test]
fn zero_stream_buffer_is_rejected() {
    let env = CliTestEnv::new();
    let config_dir = env.xdg_config.join("forkline");
    fs::create_dir_all(&config_dir).expect("failed to create config dir");
    fs::write(config_dir.join("config.toml"), "[engine]\nstream_buffer = 0\n")
        .expect("failed to write config");

    let output = run_bin(&env, &["demo", "t1"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("stream_buffer"), "got:\n{stderr}");
}
