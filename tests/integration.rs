use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn harbor_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("harbor");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("policy.md"),
        format!("# Expense policy\n\n{}", "policy word detail ".repeat(70)),
    )
    .unwrap();
    fs::write(
        files_dir.join("notes.txt"),
        "Deployment notes.\n\nKubernetes and Docker are mentioned here.",
    )
    .unwrap();

    let config_content = format!(
        r#"[storage]
data_dir = "{}/data"

[chunking]
chunk_size = 700
chunk_overlap = 100

[embedding]
provider = "hash"
dims = 64
"#,
        root.display()
    );

    let config_path = config_dir.join("harbor.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_harbor(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = harbor_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run harbor binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_data_layout() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_harbor(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let data = tmp.path().join("data");
    assert!(data.join("raw").join("chat").is_dir());
    assert!(data.join("raw").join("wiki").is_dir());
    assert!(data.join("raw").join("upload").is_dir());
    assert!(data.join("ingestion_logs").is_dir());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_harbor(&config_path, &["init"]);
    assert!(success1, "First init failed");
    let (_, _, success2) = run_harbor(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_upload_ingestion_reports_counts() {
    let (tmp, config_path) = setup_test_env();
    let policy = tmp.path().join("files").join("policy.md");

    let (stdout, stderr, success) = run_harbor(
        &config_path,
        &[
            "ingest",
            "upload",
            policy.to_str().unwrap(),
            "--uploaded-by",
            "dana",
        ],
    );
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("status: completed"));
    assert!(stdout.contains("documents ingested: 1"));
    assert!(stdout.contains("documents failed: 0"));
}

#[test]
fn test_each_ingestion_run_creates_its_own_batch() {
    let (tmp, config_path) = setup_test_env();
    let policy = tmp.path().join("files").join("policy.md");

    // Re-ingesting the same file is two independent immutable batches.
    run_harbor(&config_path, &["ingest", "upload", policy.to_str().unwrap()]);
    run_harbor(&config_path, &["ingest", "upload", policy.to_str().unwrap()]);

    let (stdout, _, success) = run_harbor(&config_path, &["batches", "upload"]);
    assert!(success);
    assert_eq!(stdout.matches("documents=1").count(), 2, "got: {}", stdout);
}

#[test]
fn test_unsupported_upload_fails_with_audit_entry() {
    let (tmp, config_path) = setup_test_env();
    let exe = tmp.path().join("tool.exe");
    fs::write(&exe, b"MZ\x00").unwrap();

    let (stdout, _, success) = run_harbor(&config_path, &["ingest", "upload", exe.to_str().unwrap()]);
    assert!(success, "failed ingestion still reports its record");
    assert!(stdout.contains("status: failed"));
    assert!(stdout.contains("documents failed: 1"));
    assert!(stdout.contains("unsupported file extension"));

    let (history, _, _) = run_harbor(&config_path, &["history"]);
    assert!(history.contains("failed"), "got: {}", history);
}

#[test]
fn test_index_init_counts_chunks() {
    let (tmp, config_path) = setup_test_env();
    let files = tmp.path().join("files");

    run_harbor(
        &config_path,
        &[
            "ingest",
            "upload",
            files.join("policy.md").to_str().unwrap(),
            files.join("notes.txt").to_str().unwrap(),
        ],
    );

    let (stdout, stderr, success) = run_harbor(&config_path, &["index", "init"]);
    assert!(success, "index init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("embedding model: hash-sha256"));
    assert!(stdout.contains("operation: initialize"));
    // policy.md splits into multiple chunks, notes.txt into one.
    let count_line = stdout
        .lines()
        .find(|l| l.contains("document count:"))
        .unwrap();
    let count: u64 = count_line.split(':').nth(1).unwrap().trim().parse().unwrap();
    assert!(count >= 3, "expected at least 3 chunks, got {}", count);

    let (info, _, _) = run_harbor(&config_path, &["index", "info"]);
    assert!(info.contains(&format!("document count: {}", count)));
}

#[test]
fn test_index_init_refuses_to_clobber() {
    let (tmp, config_path) = setup_test_env();
    let notes = tmp.path().join("files").join("notes.txt");
    run_harbor(&config_path, &["ingest", "upload", notes.to_str().unwrap()]);

    let (_, _, first) = run_harbor(&config_path, &["index", "init"]);
    assert!(first);

    let (_, stderr, second) = run_harbor(&config_path, &["index", "init"]);
    assert!(!second, "second init without --force must fail");
    assert!(stderr.contains("already exists"), "got: {}", stderr);

    let (_, _, forced) = run_harbor(&config_path, &["index", "init", "--force"]);
    assert!(forced, "init --force should succeed");
}

#[test]
fn test_index_update_adds_new_batch() {
    let (tmp, config_path) = setup_test_env();
    let files = tmp.path().join("files");

    run_harbor(
        &config_path,
        &["ingest", "upload", files.join("notes.txt").to_str().unwrap()],
    );
    run_harbor(&config_path, &["index", "init"]);

    run_harbor(
        &config_path,
        &["ingest", "upload", files.join("policy.md").to_str().unwrap()],
    );
    let (batches_out, _, _) = run_harbor(&config_path, &["batches", "upload"]);
    // Newest batch is listed first; its id is the last token of the line.
    let newest = batches_out
        .lines()
        .next()
        .and_then(|l| l.split_whitespace().last())
        .unwrap()
        .to_string();

    let (stdout, stderr, success) = run_harbor(&config_path, &["index", "update", &newest]);
    assert!(success, "update failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("operation: update"));
}

#[test]
fn test_rebuild_creates_backup_and_preserves_counts() {
    let (tmp, config_path) = setup_test_env();
    let files = tmp.path().join("files");
    run_harbor(
        &config_path,
        &[
            "ingest",
            "upload",
            files.join("policy.md").to_str().unwrap(),
            files.join("notes.txt").to_str().unwrap(),
        ],
    );

    let (init_out, _, _) = run_harbor(&config_path, &["index", "init"]);
    let count_line = init_out
        .lines()
        .find(|l| l.contains("document count:"))
        .unwrap()
        .to_string();

    let (stdout, stderr, success) = run_harbor(&config_path, &["index", "rebuild"]);
    assert!(success, "rebuild failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("operation: rebuild"));
    assert!(stdout.contains(count_line.trim()), "got: {}", stdout);

    // A timestamped snapshot of the pre-rebuild index exists.
    let backup = fs::read_dir(tmp.path().join("data"))
        .unwrap()
        .filter_map(|e| e.ok())
        .find(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with("vectorstore_backup_")
        });
    assert!(backup.is_some(), "expected a vectorstore backup directory");
    assert!(backup.unwrap().path().join("records.jsonl").exists());
}

#[test]
fn test_rebuild_no_backup_skips_snapshot() {
    let (tmp, config_path) = setup_test_env();
    let notes = tmp.path().join("files").join("notes.txt");
    run_harbor(&config_path, &["ingest", "upload", notes.to_str().unwrap()]);
    run_harbor(&config_path, &["index", "init"]);

    let (_, _, success) = run_harbor(&config_path, &["index", "rebuild", "--no-backup"]);
    assert!(success);

    let backup = fs::read_dir(tmp.path().join("data"))
        .unwrap()
        .filter_map(|e| e.ok())
        .find(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with("vectorstore_backup_")
        });
    assert!(backup.is_none(), "no backup expected with --no-backup");
}

#[test]
fn test_search_attributes_results_to_their_source() {
    let (tmp, config_path) = setup_test_env();
    let notes = tmp.path().join("files").join("notes.txt");
    run_harbor(&config_path, &["ingest", "upload", notes.to_str().unwrap()]);
    run_harbor(&config_path, &["index", "init"]);

    let (stdout, stderr, success) = run_harbor(
        &config_path,
        &[
            "search",
            "Deployment notes.\n\nKubernetes and Docker are mentioned here.",
        ],
    );
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("notes.txt"), "got: {}", stdout);
}

#[test]
fn test_search_without_index_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_harbor(&config_path, &["search", "anything"]);
    assert!(!success, "search without an index must fail");
    assert!(stderr.contains("not initialized"), "got: {}", stderr);
}

#[test]
fn test_history_lists_runs_with_counts() {
    let (tmp, config_path) = setup_test_env();
    let files = tmp.path().join("files");
    run_harbor(
        &config_path,
        &["ingest", "upload", files.join("policy.md").to_str().unwrap()],
    );
    run_harbor(
        &config_path,
        &["ingest", "upload", files.join("notes.txt").to_str().unwrap()],
    );

    let (stdout, _, success) = run_harbor(&config_path, &["history"]);
    assert!(success);
    assert_eq!(stdout.matches("completed").count(), 2, "got: {}", stdout);
    assert!(stdout.contains("ingested=1 failed=0"));

    let (filtered, _, _) = run_harbor(&config_path, &["history", "--source", "chat"]);
    assert!(filtered.contains("No ingestion history."));
}

#[test]
fn test_unknown_source_type_errors() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_harbor(&config_path, &["batches", "jira"]);
    assert!(!success);
    assert!(stderr.contains("unknown source type"), "got: {}", stderr);
}

#[test]
fn test_index_init_errors_when_embedding_disabled() {
    let (tmp, config_path) = setup_test_env();
    // Rewrite the config with embeddings disabled.
    let config_content = format!(
        "[storage]\ndata_dir = \"{}/data\"\n",
        tmp.path().display()
    );
    fs::write(&config_path, config_content).unwrap();

    let notes = tmp.path().join("files").join("notes.txt");
    run_harbor(&config_path, &["ingest", "upload", notes.to_str().unwrap()]);

    let (_, stderr, success) = run_harbor(&config_path, &["index", "init"]);
    assert!(!success, "index init with disabled embeddings must fail");
    assert!(stderr.contains("disabled"), "got: {}", stderr);
}
