#![deny(clippy::all, clippy::pedantic)]

use assert_cmd::Command;
use httpmock::MockServer;
use predicates::str::contains;

const COMPLETED: &str = r#"{"source_id":"1902.00123","checksum":"abc","output_format":"pdf","status":"completed","owner":"1234","reason":null,"description":null,"size_bytes":17,"task_id":"1902.00123/abc/pdf","attempt_count":1,"created_at":"2019-01-01T00:00:00Z","started_at":"2019-01-01T00:00:01Z","completed_at":"2019-01-01T00:00:09Z"}"#;
const QUEUED: &str = r#"{"source_id":"1902.00123","checksum":"abc","output_format":"pdf","status":"queued","owner":"1234","reason":null,"description":null,"size_bytes":null,"task_id":"1902.00123/abc/pdf","attempt_count":1,"created_at":"2019-01-01T00:00:00Z","started_at":null,"completed_at":null}"#;
const FAILED: &str = r#"{"source_id":"1902.00123","checksum":"abc","output_format":"pdf","status":"failed","owner":null,"reason":"compilation_errors","description":"converter exited with status 1","size_bytes":null,"task_id":"1902.00123/abc/pdf","attempt_count":1,"created_at":"2019-01-01T00:00:00Z","started_at":"2019-01-01T00:00:01Z","completed_at":"2019-01-01T00:00:09Z"}"#;

fn cli() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("texcompiler-cli"))
}

#[test]
fn submit_posts_request_and_prints_status() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method("POST")
            .path("/")
            .json_body_partial(r#"{"source_id":"1902.00123","checksum":"abc","output_format":"pdf","force":false,"owner":"1234"}"#);
        then.status(202)
            .header("content-type", "application/json")
            .header("location", "/1902.00123/abc/pdf")
            .body(QUEUED);
    });

    let assert = cli()
        .env("TEXCOMPILER_URL", server.base_url())
        .args(["submit", "1902.00123", "abc", "--owner", "1234"])
        .assert()
        .success();

    let output = String::from_utf8_lossy(&assert.get_output().stdout);
    assert!(output.contains("\"status\": \"queued\""));
    mock.assert();
}

#[test]
fn submit_conflict_reports_existing_task() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method("POST").path("/");
        then.status(409)
            .header("content-type", "application/json")
            .body(COMPLETED);
    });

    cli()
        .arg("--server")
        .arg(server.base_url())
        .args(["submit", "1902.00123", "abc"])
        .assert()
        .success()
        .stdout(contains("\"status\": \"completed\""))
        .stderr(contains("use --force"));
}

#[test]
fn wait_exits_non_zero_for_failed_tasks() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method("GET").path("/1902.00123/abc/pdf");
        then.status(200)
            .header("content-type", "application/json")
            .body(FAILED);
    });

    cli()
        .env("TEXCOMPILER_URL", server.base_url())
        .args(["wait", "1902.00123", "abc", "--interval", "10"])
        .assert()
        .failure()
        .stdout(contains("compilation_errors"))
        .stderr(contains("Unsuccessful"));
}

#[test]
fn content_writes_artifact_to_file() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method("GET").path("/1902.00123/abc/ps/content");
        then.status(200)
            .header("content-type", "application/postscript")
            .body("%!PS-Adobe-3.0");
    });
    let dir = tempfile::tempdir().expect("tempdir");
    let out = dir.path().join("paper.ps");

    cli()
        .env("TEXCOMPILER_URL", server.base_url())
        .args(["content", "1902.00123", "abc", "--format", "ps", "-o"])
        .arg(&out)
        .assert()
        .success();

    assert_eq!(std::fs::read(&out).expect("artifact written"), b"%!PS-Adobe-3.0");
    mock.assert();
}

#[test]
fn log_streams_to_stdout() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method("GET").path("/1902.00123/abc/pdf/log");
        then.status(200)
            .header("content-type", "text/plain; charset=utf-8")
            .body("This is pdfTeX\n");
    });

    cli()
        .env("TEXCOMPILER_URL", server.base_url())
        .args(["log", "1902.00123", "abc"])
        .assert()
        .success()
        .stdout("This is pdfTeX\n");
}

#[test]
fn missing_server_fails_fast() {
    cli()
        .args(["status", "1902.00123", "abc"])
        .env_remove("TEXCOMPILER_URL")
        .assert()
        .failure()
        .stderr(contains("MissingServer"));
}
