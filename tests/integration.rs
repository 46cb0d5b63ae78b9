use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn crmsync_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("crmsync");
    path
}

fn setup_test_env(crm_base: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/crm.sqlite"

[crm]
api_base = "{crm}/crm/v2"
token_url = "{crm}/oauth/v2/token"
per_page = 200
max_retries = 0

[documents]
download_dir = "{root}/data/downloads"

[logging]
level = "warn"
"#,
        root = root.display(),
        crm = crm_base,
    );

    let config_path = config_dir.join("crmsync.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_crmsync(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = crmsync_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("CRM_CLIENT_ID", "client")
        .env("CRM_CLIENT_SECRET", "secret")
        .env("CRM_REFRESH_TOKEN", "refresh")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run crmsync binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

async fn mock_crm() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/v2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "tok"})))
        .mount(&server)
        .await;
    server
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env("http://127.0.0.1:9");

    let (stdout, stderr, success) = run_crmsync(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/crm.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");

    let (_, _, success1) = run_crmsync(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_crmsync(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_status_before_first_sync() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");

    let (stdout, stderr, success) = run_crmsync(&config_path, &["status"]);
    assert!(success, "status failed: stdout={}, stderr={}", stdout, stderr);
    for entity in ["contacts", "accounts", "intern_roles"] {
        assert!(stdout.contains(entity), "missing {} in: {}", entity, stdout);
    }
    assert!(stdout.contains("never synced"));
}

#[test]
fn test_unknown_sync_target() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");

    let (_, stderr, success) = run_crmsync(&config_path, &["sync", "leads"]);
    assert!(!success);
    assert!(stderr.contains("Unknown sync target"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");
    let content = fs::read_to_string(&config_path).unwrap();
    fs::write(&config_path, content.replace("per_page = 200", "per_page = 500")).unwrap();

    let (_, stderr, success) = run_crmsync(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("per_page"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sync_contacts_then_incremental() {
    let server = mock_crm().await;
    let (_tmp, config_path) = setup_test_env(&server.uri());

    Mock::given(method("GET"))
        .and(path("/crm/v2/Contacts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"id": "1", "First_Name": "Ada", "Last_Name": "Lovelace",
                 "Modified_Time": "2024-05-01T09:00:00+00:00"},
                {"id": "2", "First_Name": "Alan", "Last_Name": "Turing",
                 "Modified_Time": "2024-05-02T10:30:00+00:00"}
            ],
            "info": {"more_records": false}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/crm/v2/Contacts/search"))
        .and(query_param(
            "criteria",
            "(Modified_Time:greater_than:2024-05-02T10:30:00+00:00)",
        ))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let (stdout, stderr, success) = run_crmsync(&config_path, &["sync", "contacts"]);
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("criteria: none (full fetch)"));
    assert!(stdout.contains("inserted: 2"));
    assert!(stdout.contains("watermark: 2024-05-02T10:30:00+00:00"));
    assert!(stdout.contains("ok"));

    let (stdout, stderr, success) = run_crmsync(&config_path, &["sync", "contacts"]);
    assert!(success, "second sync failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("fetched: 0 records"));
    assert!(stdout.contains("(unchanged)"));

    let (stdout, _, success) = run_crmsync(&config_path, &["status"]);
    assert!(success);
    let contacts_line = stdout
        .lines()
        .find(|l| l.starts_with("contacts"))
        .unwrap();
    assert!(contacts_line.contains("2024-05-02T10:30:00+00:00"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sync_failure_exits_nonzero() {
    let server = mock_crm().await;
    let (_tmp, config_path) = setup_test_env(&server.uri());

    Mock::given(method("GET"))
        .and(path("/crm/v2/Accounts"))
        .respond_with(ResponseTemplate::new(400).set_body_string("INVALID_QUERY"))
        .mount(&server)
        .await;

    let (_, stderr, success) = run_crmsync(&config_path, &["sync", "accounts"]);
    assert!(!success);
    assert!(stderr.contains("sync accounts failed"));
}

#[test]
fn test_sync_requires_credentials() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");

    let output = Command::new(crmsync_binary())
        .arg("--config")
        .arg(&config_path)
        .args(["sync", "contacts"])
        .env_remove("CRM_CLIENT_ID")
        .env_remove("CRM_CLIENT_SECRET")
        .env_remove("CRM_REFRESH_TOKEN")
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("CRM_CLIENT_ID"));
}

#[test]
fn test_skills_list_without_skills() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");

    let (stdout, stderr, success) = run_crmsync(&config_path, &["skills", "list", "42"]);
    assert!(success, "skills list failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("No skills found for contact 42"));
}
