use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn edue_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("edue");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    setup_with_limits(5, 30)
}

fn setup_with_limits(per_minute: u32, per_hour: u32) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let content = root.join("content");
    fs::create_dir_all(content.join("biology")).unwrap();
    fs::create_dir_all(content.join("physics")).unwrap();
    fs::write(
        content.join("biology/cells.md"),
        "# Cells\n\nMitochondria produce ATP for the cell.\n\nRibosomes build proteins.",
    )
    .unwrap();
    fs::write(
        content.join("physics/motion.txt"),
        "Newton's second law states that force equals mass times acceleration.",
    )
    .unwrap();
    fs::write(content.join("physics/diagram.png"), [0x89u8, 0x50, 0x4e, 0x47]).unwrap();

    fs::write(config_dir.join("blacklist.txt"), "frak\n").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/edue.sqlite"

[bot]
prefix = "!"
user_id = "999"
admins = ["instructor"]

[content]
root = "{root}/content"

[embedding]
provider = "hash"

[generation]
provider = "disabled"

[retrieval]
integrity_check = false

[rate_limit]
per_minute = {per_minute}
per_hour = {per_hour}

[moderation]
blacklist = "{root}/config/blacklist.txt"
"#,
        root = root.display(),
    );

    let config_path = config_dir.join("edue.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_edue(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = edue_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RATE_LIMIT_PER_MINUTE")
        .env_remove("RATE_LIMIT_PER_HOUR")
        .env_remove("COMMAND_PREFIX")
        .env_remove("BOT_USER_ID")
        .env_remove("OPENAI_API_KEY")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run edue binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_edue(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("Initialized database"));
    assert!(tmp.path().join("data/edue.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, first) = run_edue(&config_path, &["init"]);
    let (_, _, second) = run_edue(&config_path, &["init"]);
    assert!(first && second);
}

#[test]
fn test_ingest_reports_counts_and_skips() {
    let (_tmp, config_path) = setup_test_env();
    run_edue(&config_path, &["init"]);

    let (stdout, stderr, success) = run_edue(&config_path, &["ingest"]);
    assert!(success, "ingest failed: {}", stderr);
    assert!(stdout.contains("documents indexed: 2"), "{}", stdout);
    assert!(stdout.contains("errors: 1"), "{}", stdout);
    assert!(stdout.contains("physics/diagram.png"), "{}", stdout);
    assert!(stdout.contains("ok"));

    let (stdout, _, _) = run_edue(&config_path, &["ingest"]);
    assert!(stdout.contains("documents indexed: 0"), "{}", stdout);
    assert!(stdout.contains("unchanged: 2"), "{}", stdout);

    let (stdout, _, _) = run_edue(&config_path, &["ingest", "--full"]);
    assert!(stdout.contains("documents indexed: 2"), "{}", stdout);
}

#[test]
fn test_ingest_missing_directory_fails() {
    let (tmp, config_path) = setup_test_env();
    let missing = tmp.path().join("nowhere");

    let (_, stderr, success) = run_edue(
        &config_path,
        &["ingest", "--dir", missing.to_str().unwrap()],
    );
    assert!(!success);
    assert!(stderr.contains("Failed to ingest"), "{}", stderr);
}

#[test]
fn test_stats_after_ingest() {
    let (_tmp, config_path) = setup_test_env();
    run_edue(&config_path, &["ingest"]);

    let (stdout, stderr, success) = run_edue(&config_path, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["index"]["documents"], 2);
    assert_eq!(stats["index"]["categories"][0][0], "biology");
    assert_eq!(stats["index"]["categories"][1][0], "physics");
}

#[test]
fn test_limits_config() {
    let (_tmp, config_path) = setup_with_limits(3, 20);

    let (stdout, _, success) = run_edue(&config_path, &["limits", "config"]);
    assert!(success);
    assert!(stdout.contains("per_minute: 3"));
    assert!(stdout.contains("per_hour: 20"));
}

#[test]
fn test_rate_limit_survives_restart() {
    let (_tmp, config_path) = setup_with_limits(1, 10);

    // Admitted, then fails on the empty index.
    let (_, stderr, success) = run_edue(
        &config_path,
        &["message", "--user", "u1", "--channel", "c1", "!ask What is ATP?"],
    );
    assert!(!success);
    assert!(stderr.contains("[retrieval_error]"), "{}", stderr);

    // A new process sees the recorded request.
    let (stdout, stderr, success) = run_edue(
        &config_path,
        &["message", "--user", "u1", "--channel", "c1", "!ask What is ATP?"],
    );
    assert!(!success);
    assert!(stderr.contains("[rate_limited]"), "{}", stderr);
    assert!(stdout.contains("per minute"), "{}", stdout);

    let (stdout, _, _) = run_edue(&config_path, &["limits", "stats", "u1"]);
    let usage: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(usage["minute"]["used"], 1);
    assert_eq!(usage["minute"]["remaining"], 0);

    let (stdout, _, success) = run_edue(&config_path, &["limits", "reset", "u1"]);
    assert!(success);
    assert!(stdout.contains("1 recorded requests cleared"));

    let (_, stderr, _) = run_edue(
        &config_path,
        &["message", "--user", "u1", "--channel", "c1", "!ask What is ATP?"],
    );
    assert!(stderr.contains("[retrieval_error]"), "{}", stderr);
}

#[test]
fn test_profane_message_is_removed() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_edue(
        &config_path,
        &["message", "--user", "u1", "--channel", "c1", "what the FRAK is this"],
    );
    assert!(success, "{}", stderr);
    assert!(stdout.contains("(original message removed)"));
    assert!(stdout.contains("inappropriate language"));
}

#[test]
fn test_help_and_unknown_messages() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_edue(
        &config_path,
        &["message", "--user", "u1", "--channel", "c1", "!help"],
    );
    assert!(success);
    assert!(stdout.contains("`!ask`"));
    assert!(stdout.contains("`!rlstats`"));

    let (stdout, _, success) = run_edue(
        &config_path,
        &["message", "--user", "u1", "--channel", "c1", "just chatting with friends"],
    );
    assert!(success);
    assert!(stdout.contains("(no reply)"));
}

#[test]
fn test_admin_command_requires_admin() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, _) = run_edue(
        &config_path,
        &["message", "--user", "u1", "--channel", "c1", "!rlconfig"],
    );
    assert!(stdout.contains("only available to administrators"));

    let (stdout, _, success) = run_edue(
        &config_path,
        &["message", "--user", "instructor", "--channel", "c1", "!rlconfig"],
    );
    assert!(success);
    assert!(stdout.contains("Per minute: 5"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_edue(&tmp.path().join("absent.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
