mod exec;
mod stats;

use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::shared::models::AppState;
use exec::ShellExec;

/// Outbound frames queue ahead of the socket writer; log lines are dropped
/// (newest first) once the queue is full, everything else awaits a slot.
const OUTBOUND_QUEUE: usize = 256;

const BANNER: &str = "\u{1b}[32m[kswings] connected!\u{1b}[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Exec,
    Stats,
}

#[derive(Debug, Clone)]
pub struct SessionRoute {
    pub kind: SessionKind,
    pub container_id: String,
    pub volume_id: Option<String>,
}

/// Inbound channel frame. Anything that fails to parse as this shape is
/// answered with a plain `Invalid JSON` reply.
#[derive(Debug, Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    args: Vec<serde_json::Value>,
    #[serde(default)]
    command: Option<String>,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/exec", get(missing_container))
        .route("/exec/{container_id}", get(exec_session))
        .route("/exec/{container_id}/{volume_id}", get(exec_session_with_volume))
        .route("/stats/{container_id}", get(stats_session))
        .route("/stats/{container_id}/{volume_id}", get(stats_session_with_volume))
}

/// Fallback for upgrade requests whose path names no known session kind:
/// complete the upgrade, then close with a protocol-error code.
pub async fn unknown_kind_fallback(
    upgrade: Result<WebSocketUpgrade, axum::extract::ws::rejection::WebSocketUpgradeRejection>,
) -> Response {
    match upgrade {
        Ok(ws) => ws.on_upgrade(|socket| close_with(socket, close_code::PROTOCOL, "Unknown session type")),
        Err(_) => axum::http::StatusCode::NOT_FOUND.into_response(),
    }
}

async fn missing_container(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|socket| close_with(socket, close_code::POLICY, "Container ID not specified"))
}

async fn exec_session(
    State(app): State<Arc<AppState>>,
    Path(container_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let route = SessionRoute {
        kind: SessionKind::Exec,
        container_id,
        volume_id: None,
    };
    ws.on_upgrade(move |socket| handle_socket(app, socket, route))
}

async fn exec_session_with_volume(
    State(app): State<Arc<AppState>>,
    Path((container_id, volume_id)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    let route = SessionRoute {
        kind: SessionKind::Exec,
        container_id,
        volume_id: Some(volume_id),
    };
    ws.on_upgrade(move |socket| handle_socket(app, socket, route))
}

async fn stats_session(
    State(app): State<Arc<AppState>>,
    Path(container_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let route = SessionRoute {
        kind: SessionKind::Stats,
        container_id,
        volume_id: None,
    };
    ws.on_upgrade(move |socket| handle_socket(app, socket, route))
}

async fn stats_session_with_volume(
    State(app): State<Arc<AppState>>,
    Path((container_id, volume_id)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    let route = SessionRoute {
        kind: SessionKind::Stats,
        container_id,
        volume_id: Some(volume_id),
    };
    ws.on_upgrade(move |socket| handle_socket(app, socket, route))
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// Per-connection state released when the channel dies.
struct Session {
    route: SessionRoute,
    authenticated: bool,
    console_task: Option<JoinHandle<()>>,
    stats_task: Option<JoinHandle<()>>,
    shell: Option<ShellExec>,
}

impl Session {
    fn new(route: SessionRoute) -> Self {
        Self {
            route,
            authenticated: false,
            console_task: None,
            stats_task: None,
            shell: None,
        }
    }

    fn cancel(&mut self) {
        if let Some(task) = self.console_task.take() {
            task.abort();
        }
        if let Some(task) = self.stats_task.take() {
            task.abort();
        }
        if let Some(shell) = self.shell.take() {
            shell.cancel();
        }
    }
}

async fn handle_socket(app: Arc<AppState>, socket: WebSocket, route: SessionRoute) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let mut session = Session::new(route);

    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            // Pings are answered by the protocol layer
            _ => continue,
        };

        let frame: Frame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(_) => {
                let _ = tx.send(Message::Text("Invalid JSON".into())).await;
                continue;
            }
        };

        if !session.authenticated {
            if frame.event == "auth" && auth_matches(&frame, &app.config.key) {
                session.authenticated = true;
                let _ = tx.send(Message::Text(BANNER.into())).await;
                start_session(&app, &mut session, &tx).await;
                continue;
            }
            let _ = tx.send(Message::Text("Authentication failed".into())).await;
            let _ = tx
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: "Authentication failed".into(),
                })))
                .await;
            break;
        }

        dispatch_event(&app, &mut session, &tx, frame).await;
    }

    session.cancel();
    drop(tx);
    let _ = writer.await;
    debug!("Session for {} closed", session.route.container_id);
}

fn auth_matches(frame: &Frame, key: &str) -> bool {
    frame
        .args
        .first()
        .and_then(|v| v.as_str())
        .map(|secret| secret == key)
        .unwrap_or(false)
}

async fn start_session(app: &Arc<AppState>, session: &mut Session, tx: &mpsc::Sender<Message>) {
    let route = session.route.clone();
    info!(
        "Channel authenticated for container {} ({:?})",
        route.container_id, route.kind
    );

    match route.kind {
        SessionKind::Exec => {
            session.console_task = Some(tokio::spawn(exec::run_console(
                app.clone(),
                route.container_id,
                tx.clone(),
            )));
        }
        SessionKind::Stats => {
            session.stats_task = Some(tokio::spawn(stats::run_stats_loop(
                app.clone(),
                route.container_id,
                route.volume_id,
                tx.clone(),
            )));
        }
    }
}

async fn dispatch_event(
    app: &Arc<AppState>,
    session: &mut Session,
    tx: &mpsc::Sender<Message>,
    frame: Frame,
) {
    let container_id = session.route.container_id.clone();

    match frame.event.as_str() {
        "cmd" => {
            let Some(command) = frame.command else {
                let _ = tx.send(Message::Text("Invalid JSON".into())).await;
                return;
            };
            if session.shell.is_none() {
                match exec::open_shell(app.clone(), container_id.clone(), tx.clone()).await {
                    Ok(shell) => session.shell = Some(shell),
                    Err(e) => {
                        warn!("Failed to open shell in {}: {}", container_id, e);
                        let _ = tx
                            .send(Message::Text(format!("Failed to run command: {e}").into()))
                            .await;
                        return;
                    }
                }
            }
            if let Some(shell) = session.shell.as_mut() {
                if let Err(e) = shell.write_command(&command).await {
                    warn!("Command injection into {} failed: {}", container_id, e);
                    let _ = tx
                        .send(Message::Text(format!("Failed to run command: {e}").into()))
                        .await;
                    session.shell = None;
                }
            }
        }
        "power:start" => {
            if let Err(e) = app.docker.start(&container_id).await {
                let _ = tx
                    .send(Message::Text(format!("Failed to start container: {e}").into()))
                    .await;
            }
        }
        "power:stop" => {
            if let Err(e) = app.docker.stop(&container_id, None).await {
                let _ = tx
                    .send(Message::Text(format!("Failed to stop container: {e}").into()))
                    .await;
            }
        }
        "power:restart" => {
            if let Err(e) = app.docker.restart(&container_id).await {
                let _ = tx
                    .send(Message::Text(format!("Failed to restart container: {e}").into()))
                    .await;
            }
        }
        _ => {
            let _ = tx.send(Message::Text("Unsupported event".into())).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_parses_event_args_and_command() {
        let frame: Frame =
            serde_json::from_str(r#"{"event":"auth","args":["secret"]}"#).unwrap();
        assert_eq!(frame.event, "auth");
        assert!(auth_matches(&frame, "secret"));
        assert!(!auth_matches(&frame, "other"));

        let frame: Frame =
            serde_json::from_str(r#"{"event":"cmd","command":"say hello"}"#).unwrap();
        assert_eq!(frame.command.as_deref(), Some("say hello"));
    }

    #[test]
    fn frame_rejects_non_object_payloads() {
        assert!(serde_json::from_str::<Frame>("not json").is_err());
        assert!(serde_json::from_str::<Frame>(r#"["auth"]"#).is_err());
    }

    #[test]
    fn auth_requires_string_secret() {
        let frame: Frame = serde_json::from_str(r#"{"event":"auth","args":[42]}"#).unwrap();
        assert!(!auth_matches(&frame, "42"));
        let frame: Frame = serde_json::from_str(r#"{"event":"auth"}"#).unwrap();
        assert!(!auth_matches(&frame, "secret"));
    }
}
