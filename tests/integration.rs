use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn trx_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("trx");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let calls_dir = root.join("calls");
    fs::create_dir_all(&calls_dir).unwrap();
    fs::write(
        calls_dir.join("acme.txt"),
        "Rep: Thanks for joining today.\n\
         Buyer: Our main problem is the manual reporting every Friday.\n\
         Buyer: We are also evaluating Gong as an alternative.\n\
         Rep: Understood. Pricing is $40,000 per year for your team.\n\
         Buyer: Our CFO has to sign off on anything over budget.\n",
    )
    .unwrap();
    fs::write(
        calls_dir.join("globex.txt"),
        "Rep: How is the rollout going?\n\
         Buyer: Onboarding went well and training is done.\n\
         Buyer: Legal needs to review the MSA before renewal.\n",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/trx.sqlite"

[chunking]
unit = "sentences"
max_len = 2
overlap = 0

[indexing]
workers = 2
max_attempts = 2
backoff_base_ms = 1
backoff_max_ms = 2
poll_interval_ms = 10

[embedding]
provider = "hashing"
dims = 64

[extraction]
provider = "keyword"
competitors = ["Gong"]

[server]
bind = "127.0.0.1:7341"
"#,
        root.display()
    );

    let config_path = config_dir.join("trx.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_trx(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = trx_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run trx binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn call_path(config_path: &Path, name: &str) -> String {
    config_path
        .parent()
        .and_then(Path::parent)
        .unwrap()
        .join("calls")
        .join(name)
        .to_string_lossy()
        .to_string()
}

/// init, ingest both calls, and drain the indexer.
fn indexed_env() -> (TempDir, PathBuf) {
    let (tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_trx(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);

    for (id, file) in [("acme", "acme.txt"), ("globex", "globex.txt")] {
        let path = call_path(&config_path, file);
        let (stdout, stderr, success) = run_trx(&config_path, &["ingest", &path, "--id", id]);
        assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    }

    let (stdout, stderr, success) = run_trx(&config_path, &["index"]);
    assert!(success, "index failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("transcripts: 2"), "stdout={}", stdout);
    assert!(stdout.contains("chunks failed: 0"), "stdout={}", stdout);

    (tmp, config_path)
}

fn search_json(config_path: &Path, args: &[&str]) -> Vec<serde_json::Value> {
    let mut full = vec!["search"];
    full.extend_from_slice(args);
    let (stdout, stderr, success) = run_trx(config_path, &full);
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);
    serde_json::from_str::<Vec<serde_json::Value>>(&stdout)
        .unwrap_or_else(|e| panic!("search output is not JSON ({}): {}", e, stdout))
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_trx(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_trx(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_trx(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_reports_chunks_and_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();
    run_trx(&config_path, &["init"]);
    let path = call_path(&config_path, "acme.txt");

    let (stdout, stderr, success) = run_trx(&config_path, &["ingest", &path, "--id", "acme"]);
    assert!(success, "ingest failed: {}", stderr);
    assert!(stdout.contains("transcript: acme"));
    // Six sentences in windows of two.
    assert!(stdout.contains("chunks: 3"), "stdout={}", stdout);
    assert!(!stdout.contains("unchanged"));

    let (stdout, _, success) = run_trx(&config_path, &["ingest", &path, "--id", "acme"]);
    assert!(success);
    assert!(stdout.contains("unchanged"));
}

#[test]
fn test_search_returns_scoped_json() {
    let (_tmp, config_path) = indexed_env();

    let results = search_json(
        &config_path,
        &["pricing per year", "--transcript", "acme", "--limit", "2"],
    );
    assert!(!results.is_empty());
    assert!(results.len() <= 2);
    for r in &results {
        assert_eq!(r["chunk"]["transcript_id"], "acme");
        assert_eq!(r["chunk"]["extraction_status"], "completed");
    }
    let top = results[0]["relevance_score"].as_f64().unwrap();
    for r in &results[1..] {
        assert!(r["relevance_score"].as_f64().unwrap() <= top);
    }
}

#[test]
fn test_search_with_filters() {
    let (_tmp, config_path) = indexed_env();

    let results = search_json(
        &config_path,
        &[
            "vendor comparison",
            "--transcript",
            "acme",
            "--transcript",
            "globex",
            "--tag",
            "competition",
            "--entity",
            "competitor:gong",
        ],
    );
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["chunk"]["transcript_id"], "acme");
    assert!(results[0]["entity_score"].as_f64().unwrap() > 0.0);

    let results = search_json(
        &config_path,
        &["anything", "--transcript", "acme", "--topic", "onboarding"],
    );
    assert!(results.is_empty());
}

#[test]
fn test_search_rejects_unknown_topic() {
    let (_tmp, config_path) = indexed_env();

    let (_, stderr, success) = run_trx(
        &config_path,
        &["search", "x", "--transcript", "acme", "--topic", "weather"],
    );
    assert!(!success);
    assert!(stderr.contains("weather"), "stderr={}", stderr);
}

#[test]
fn test_status_and_requeue() {
    let (_tmp, config_path) = indexed_env();

    let (stdout, stderr, success) = run_trx(&config_path, &["status"]);
    assert!(success, "status failed: {}", stderr);
    assert!(stdout.contains("STATUS"));
    assert!(stdout.contains("completed"));
    assert!(stdout.contains("Retrievable: 5 / 5 (100%)"), "stdout={}", stdout);

    let (stdout, _, success) = run_trx(&config_path, &["requeue"]);
    assert!(success);
    assert!(stdout.contains("chunks: 0"));
}

#[test]
fn test_delete_hides_transcript() {
    let (_tmp, config_path) = indexed_env();

    let (stdout, stderr, success) = run_trx(&config_path, &["delete", "acme"]);
    assert!(success, "delete failed: {}", stderr);
    assert!(stdout.contains("deleted acme"));

    let results = search_json(&config_path, &["pricing", "--transcript", "acme"]);
    assert!(results.is_empty());

    let (_, _, success) = run_trx(&config_path, &["delete", "nope"]);
    assert!(!success);
}

#[test]
fn test_watchdog_once_on_healthy_queue() {
    let (_tmp, config_path) = indexed_env();

    let (stdout, stderr, success) = run_trx(&config_path, &["watchdog", "--once"]);
    assert!(success, "watchdog failed: {}", stderr);
    assert!(stdout.contains("reclaimed: 0"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_trx(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
