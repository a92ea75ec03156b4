#![deny(clippy::all, clippy::pedantic)]

use httpmock::MockServer;
use tempfile::tempdir;
use texcompiler_api_types::TaskStatus;

use crate::args::{Cli, Commands, ContentArgs, FormatArg, TaskArgs, WaitArgs};
use crate::client::{CliError, Ctx, build_ctx_from_cli};
use crate::handlers;

const PENDING: &str = r#"{"source_id":"1902.00123","checksum":"abc","output_format":"pdf","status":"in_progress","owner":null,"reason":null,"description":null,"size_bytes":null,"task_id":"1902.00123/abc/pdf","attempt_count":1,"created_at":"2019-01-01T00:00:00Z","started_at":"2019-01-01T00:00:01Z","completed_at":null}"#;

fn task(checksum: &str) -> TaskArgs {
    TaskArgs {
        source_id: "1902.00123".to_string(),
        checksum: checksum.to_string(),
        format: FormatArg::Pdf,
    }
}

#[test]
fn build_ctx_requires_server() {
    let cli = Cli {
        server: None,
        command: Commands::Status(task("abc")),
    };

    let err = build_ctx_from_cli(&cli).expect_err("missing server should fail");
    assert!(matches!(err, CliError::MissingServer));
}

#[test]
fn task_url_encodes_checksum_and_keeps_base_prefix() -> Result<(), CliError> {
    let ctx = Ctx::new("https://example.com/compiler")?;
    let url = ctx.task_url(&task("\"Mon, 01 Jan 2019 00:00:00 GMT\""), "/log")?;
    assert_eq!(
        url.as_str(),
        "https://example.com/compiler/1902.00123/%22Mon%2C%2001%20Jan%202019%2000%3A00%3A00%20GMT%22/pdf/log"
    );
    assert_eq!(ctx.url("/")?.as_str(), "https://example.com/compiler/");
    Ok(())
}

#[tokio::test]
async fn wait_gives_up_at_the_deadline() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method("GET").path("/1902.00123/abc/pdf");
            then.status(200)
                .header("content-type", "application/json")
                .body(PENDING);
        })
        .await;

    let ctx = Ctx::new(&server.base_url()).expect("ctx");
    let args = WaitArgs {
        task: task("abc"),
        timeout: 0,
        interval: 10,
    };
    let err = handlers::wait(&ctx, &args).await.expect_err("should time out");

    assert!(matches!(
        err,
        CliError::TimedOut {
            status: TaskStatus::InProgress,
            ..
        }
    ));
    mock.assert_async().await;
}

#[tokio::test]
async fn server_errors_surface_the_api_error_code() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/1902.00123/abc/pdf/content");
            then.status(409)
                .header("content-type", "application/json")
                .body(r#"{"error":{"code":"not_ready","message":"task has not completed","hint":null}}"#);
        })
        .await;

    let dir = tempdir().expect("tempdir");
    let ctx = Ctx::new(&server.base_url()).expect("ctx");
    let args = ContentArgs {
        task: task("abc"),
        output: dir.path().join("out.pdf"),
    };
    let err = handlers::content(&ctx, &args).await.expect_err("not ready");

    match err {
        CliError::Server { status, code, .. } => {
            assert_eq!(status.as_u16(), 409);
            assert_eq!(code, "not_ready");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!args.output.exists());
}
