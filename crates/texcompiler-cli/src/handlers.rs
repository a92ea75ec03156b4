#![deny(clippy::all, clippy::pedantic)]

use std::io::Write;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use texcompiler_api_types::{SubmitRequest, TaskStatus, TaskStatusResponse};
use tokio::time::Instant;

use crate::args::{ContentArgs, SubmitArgs, TaskArgs, WaitArgs};
use crate::client::{CliError, Ctx};
use crate::print::print_json;

pub async fn submit(ctx: &Ctx, args: SubmitArgs) -> Result<(), CliError> {
    let body = SubmitRequest {
        source_id: args.task.source_id.clone(),
        checksum: args.task.checksum.clone(),
        output_format: args.task.format.as_str().to_string(),
        force: args.force,
        owner: args.owner,
        stamp_label: args.stamp_label,
        stamp_link: args.stamp_link,
    };
    let (status, task): (_, TaskStatusResponse) = ctx
        .send_json(Method::POST, ctx.url("/")?, Some(&body), &[StatusCode::CONFLICT])
        .await?;
    if status == StatusCode::CONFLICT {
        eprintln!(
            "task {} is already {}; nothing was queued (use --force to recompile a finished task)",
            task.task_id, task.status
        );
    }
    print_json(&task)
}

pub async fn status(ctx: &Ctx, task: &TaskArgs) -> Result<(), CliError> {
    let res: TaskStatusResponse = ctx.get_json(ctx.task_url(task, "")?).await?;
    print_json(&res)
}

pub async fn wait(ctx: &Ctx, args: &WaitArgs) -> Result<(), CliError> {
    let url = ctx.task_url(&args.task, "")?;
    let deadline = Instant::now() + Duration::from_secs(args.timeout);
    let interval = Duration::from_millis(args.interval);

    loop {
        let res: TaskStatusResponse = ctx.get_json(url.clone()).await?;
        if res.status.is_terminal() {
            print_json(&res)?;
            return match res.status {
                TaskStatus::Completed => Ok(()),
                status => Err(CliError::Unsuccessful {
                    task_id: res.task_id,
                    status,
                }),
            };
        }
        if Instant::now() + interval > deadline {
            return Err(CliError::TimedOut {
                task_id: res.task_id,
                status: res.status,
                seconds: args.timeout,
            });
        }
        tokio::time::sleep(interval).await;
    }
}

pub async fn content(ctx: &Ctx, args: &ContentArgs) -> Result<(), CliError> {
    let bytes = ctx.get_bytes(ctx.task_url(&args.task, "/content")?).await?;
    tokio::fs::write(&args.output, &bytes)
        .await
        .map_err(|source| CliError::OutputFile {
            path: args.output.display().to_string(),
            source,
        })?;
    eprintln!("wrote {} bytes to {}", bytes.len(), args.output.display());
    Ok(())
}

pub async fn log(ctx: &Ctx, task: &TaskArgs) -> Result<(), CliError> {
    let bytes = ctx.get_bytes(ctx.task_url(task, "/log")?).await?;
    std::io::stdout()
        .write_all(&bytes)
        .map_err(|source| CliError::OutputFile {
            path: "<stdout>".to_string(),
            source,
        })
}
