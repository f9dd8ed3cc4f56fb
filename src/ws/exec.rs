use std::pin::Pin;
use std::sync::Arc;

use axum::extract::ws::Message;
use bollard::exec::{CreateExecOptions, StartExecResults};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::docker::{RuntimeError, RuntimeResult};
use crate::shared::models::AppState;

/// Wire framing for one console line sent to the panel.
pub fn style_line(line: &str) -> String {
    format!("\r\n\u{1b}[34m[docker] \u{1b}[0m{line}\r\n")
}

/// Console session for one container: replay buffered history, then follow
/// the live log stream, buffering every chunk and forwarding non-empty
/// lines. Forwarding backs off to buffer-only when the outbound queue is
/// congested; history is replayed with an awaited send.
pub async fn run_console(app: Arc<AppState>, container_id: String, out: mpsc::Sender<Message>) {
    for entry in app.log_buffers.snapshot(&container_id).await {
        for line in entry.content.lines().filter(|l| !l.is_empty()) {
            if out
                .send(Message::Text(style_line(line).into()))
                .await
                .is_err()
            {
                return;
            }
        }
    }

    let mut stream = app.docker.logs(&container_id, true, "100");
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => {
                let content = chunk.to_string();
                app.log_buffers.append(&container_id, content.clone()).await;
                for line in content.lines().filter(|l| !l.is_empty()) {
                    let _ = out.try_send(Message::Text(style_line(line).into()));
                }
            }
            Err(e) => {
                warn!("Log stream for {} ended: {}", container_id, e);
                break;
            }
        }
    }
    debug!("Console follow for {} finished", container_id);
}

/// Long-lived `/bin/sh` exec with a TTY; commands are injected by writing
/// lines into its stdin. Output joins the console with the same framing.
pub struct ShellExec {
    input: Pin<Box<dyn tokio::io::AsyncWrite + Send>>,
    output_task: JoinHandle<()>,
}

impl ShellExec {
    pub async fn write_command(&mut self, command: &str) -> std::io::Result<()> {
        self.input.write_all(format!("{command}\n").as_bytes()).await?;
        self.input.flush().await
    }

    pub fn cancel(self) {
        self.output_task.abort();
    }
}

pub async fn open_shell(
    app: Arc<AppState>,
    container_id: String,
    out: mpsc::Sender<Message>,
) -> RuntimeResult<ShellExec> {
    let exec = app
        .docker
        .exec_create(
            &container_id,
            CreateExecOptions {
                cmd: Some(vec!["/bin/sh".to_string()]),
                attach_stdin: Some(true),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                tty: Some(true),
                ..Default::default()
            },
        )
        .await?;

    match app.docker.exec_start(&exec).await? {
        StartExecResults::Attached { mut output, input } => {
            let buffers_app = app.clone();
            let exec_container = container_id.clone();
            let output_task = tokio::spawn(async move {
                while let Some(Ok(chunk)) = output.next().await {
                    let content = chunk.to_string();
                    buffers_app
                        .log_buffers
                        .append(&exec_container, content.clone())
                        .await;
                    for line in content.lines().filter(|l| !l.is_empty()) {
                        let _ = out.try_send(Message::Text(style_line(line).into()));
                    }
                }
            });
            Ok(ShellExec { input, output_task })
        }
        StartExecResults::Detached => Err(RuntimeError::Protocol(
            "exec unexpectedly started detached".to_string(),
        )),
    }
}
