use pulsekit_core::RequestStore;
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
    xdg_runtime: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");
        let xdg_runtime = base.join("xdg-runtime");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(xdg_config.join("pulsekit")).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");
        fs::create_dir_all(&xdg_runtime).expect("failed to create XDG_RUNTIME_DIR");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
            xdg_runtime,
        }
    }

    /// Config pointing at a port nothing listens on, halting on failure
    fn with_unreachable_server(self) -> Self {
        let config = r#"
[server]
url = "http://127.0.0.1:9"
app_key = "APPKEY"
device_id = "cli-device"
timeout_secs = 2

[queue]
max_retries = 1
retry_backoff_ms = 0
request_pacing_ms = 0
on_retry_exhausted = "halt"

[session]
automatic_tracking = false
"#;
        fs::write(self.xdg_config.join("pulsekit/config.toml"), config)
            .expect("failed to write config");
        self
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("pulsekit/queue.db")
    }
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("pulsekit"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env("XDG_RUNTIME_DIR", &env.xdg_runtime)
        .output()
        .unwrap_or_else(|e| panic!("failed to execute pulsekit: {e}"))
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
        "pulsekit {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn migrate_creates_store_at_current_version() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["migrate"]);
    assert_success(&["migrate"], &output);
    assert!(stdout(&output).contains("Schema version: 2"));
    assert!(env.db_path().exists());

    let status = run_bin(&env, &["status"]);
    assert_success(&["status"], &status);
    let status_stdout = stdout(&status);
    assert!(status_stdout.contains("Schema version:  2"));
    assert!(status_stdout.contains("Pending:         0"));
}

#[test]
fn event_is_queued_and_kept_when_delivery_fails() {
    let env = CliTestEnv::new().with_unreachable_server();

    let args = ["event", "purchase", "--segment", "plan=pro", "--sum", "9.5"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    assert!(stdout(&output).contains("Recorded event \"purchase\""));

    let queue = run_bin(&env, &["queue"]);
    assert_success(&["queue"], &queue);
    let queue_stdout = stdout(&queue);
    assert!(queue_stdout.contains("1 pending request(s)"));
    assert!(queue_stdout.contains("GET "));

    let store = RequestStore::open(&env.db_path(), 10).expect("failed to open store");
    let records = store.models().expect("failed to list requests");
    assert_eq!(records.len(), 1);
    let url = records[0].url.as_deref().expect("GET request without url");
    assert!(url.starts_with("http://127.0.0.1:9/i?app_key=APPKEY&device_id=cli-device"));
    assert!(url.contains("purchase"));
    drop(store);

    let drain = run_bin(&env, &["drain"]);
    assert!(!drain.status.success(), "drain should fail against an unreachable server");
    assert!(stdout(&drain).contains("Remaining: 1"));

    let clear = run_bin(&env, &["clear"]);
    assert_success(&["clear"], &clear);
    assert!(stdout(&clear).contains("Cleared 1 request(s)"));

    let queue = run_bin(&env, &["queue"]);
    assert_success(&["queue"], &queue);
    assert!(stdout(&queue).contains("0 pending request(s)"));
}

#[test]
fn drain_requires_server_config() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["drain"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("server configuration is incomplete"));
}
