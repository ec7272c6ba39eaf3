//! Typed management command surface.
//!
//! The HTTP plane proper is a collaborator, not part of the core: anything
//! that can produce a [`Command`] can drive the router. The binary ships a
//! minimal line-delimited JSON shim on a Unix socket — one request object
//! per line, one response object per line — which an HTTP front end can
//! forward to without touching router internals.

use crate::controller::{Controller, Operation, Target};
use crate::extensions::{ExtensionConfig, ExtensionManager};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// One management command, as deserialised from the wire.
///
/// Examples:
/// `{"op":"start","target":"mainloop"}`,
/// `{"op":"extension_create","config":{"name":"x","type":"udp",...}}`.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Start { target: Target },
    Stop { target: Target },
    Pause { target: Target },
    Resume { target: Target },
    Restart { target: Target },
    Status {
        #[serde(default)]
        target: Option<Target>,
    },
    ExtensionCreate { config: ExtensionConfig },
    ExtensionDelete { name: String },
    ExtensionStop { name: String },
    ExtensionStart { name: String },
    ExtensionStatus {
        #[serde(default)]
        name: Option<String>,
    },
}

/// Everything the command surface needs a handle on.
pub struct ManagementContext {
    /// Thread lifecycle commands go here.
    pub controller: Arc<Controller>,
    /// Extension commands go here.
    pub extensions: Arc<ExtensionManager>,
}

impl ManagementContext {
    /// Applies one command and returns its JSON-shaped reply.
    pub fn dispatch(&self, command: Command) -> Value {
        match command {
            Command::Start { target } => self.thread_op(Operation::Start, target),
            Command::Stop { target } => self.thread_op(Operation::Stop, target),
            Command::Pause { target } => self.thread_op(Operation::Pause, target),
            Command::Resume { target } => self.thread_op(Operation::Resume, target),
            Command::Restart { target } => self.thread_op(Operation::Restart, target),
            Command::Status { target } => match target {
                Some(target) => self.thread_op(Operation::Status, target),
                None => to_value(self.controller.status_all()),
            },
            Command::ExtensionCreate { config } => match self.extensions.create_extension(config) {
                Ok(status) => json!({ "result": "success", "extension": to_value(status) }),
                Err(e) => error_reply(e),
            },
            Command::ExtensionDelete { name } => match self.extensions.delete_extension(&name) {
                Ok(()) => json!({ "result": "success" }),
                Err(e) => error_reply(e),
            },
            Command::ExtensionStop { name } => match self.extensions.stop_extension(&name) {
                Ok(()) => json!({ "result": "success" }),
                Err(e) => error_reply(e),
            },
            Command::ExtensionStart { name } => match self.extensions.start_extension(&name) {
                Ok(status) => json!({ "result": "success", "extension": to_value(status) }),
                Err(e) => error_reply(e),
            },
            Command::ExtensionStatus { name } => match name {
                Some(name) => match self.extensions.status(&name) {
                    Ok(status) => json!({ "result": "success", "extension": to_value(status) }),
                    Err(e) => error_reply(e),
                },
                None => json!({
                    "result": "success",
                    "extensions": to_value(self.extensions.status_all()),
                }),
            },
        }
    }

    /// Parses one request line and dispatches it; malformed input yields
    /// an error object instead of dropping the connection.
    pub fn dispatch_line(&self, line: &str) -> Value {
        match serde_json::from_str::<Command>(line) {
            Ok(command) => {
                debug!(?command, "management command");
                self.dispatch(command)
            }
            Err(e) => json!({ "result": "error", "message": format!("invalid command: {e}") }),
        }
    }

    fn thread_op(&self, operation: Operation, target: Target) -> Value {
        to_value(self.controller.execute(operation, target))
    }
}

fn to_value(value: impl serde::Serialize) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        warn!("reply serialisation failed: {e}");
        json!({ "result": "error", "message": "serialisation failure" })
    })
}

fn error_reply(e: crate::error::RouterError) -> Value {
    json!({ "result": "error", "message": e.to_string() })
}

/// Serves the line-delimited JSON protocol on a Unix socket until
/// cancelled. The socket file is removed on shutdown.
#[cfg(unix)]
pub async fn serve_unix(
    context: Arc<ManagementContext>,
    socket_path: std::path::PathBuf,
    token: tokio_util::sync::CancellationToken,
) -> crate::error::Result<()> {
    use crate::error::RouterError;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;
    use tracing::{error, info};

    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }
    let listener = UnixListener::bind(&socket_path)
        .map_err(|e| RouterError::filesystem(socket_path.display().to_string(), e))?;
    info!("management socket listening on {}", socket_path.display());

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let context = context.clone();
                    let token = token.clone();
                    tokio::spawn(async move {
                        let (reader, mut writer) = stream.into_split();
                        let mut lines = BufReader::new(reader).lines();
                        loop {
                            tokio::select! {
                                _ = token.cancelled() => break,
                                line = lines.next_line() => match line {
                                    Ok(Some(line)) if !line.trim().is_empty() => {
                                        let reply = context.dispatch_line(line.trim());
                                        let mut payload = reply.to_string();
                                        payload.push('\n');
                                        if writer.write_all(payload.as_bytes()).await.is_err() {
                                            break;
                                        }
                                    }
                                    Ok(Some(_)) => {}
                                    _ => break,
                                },
                            }
                        }
                    });
                }
                Err(e) => error!("management accept error: {e}"),
            },
        }
    }

    let _ = std::fs::remove_file(&socket_path);
    info!("management socket closed");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::threads::ThreadManager;

    fn test_context() -> ManagementContext {
        let thread_manager = Arc::new(ThreadManager::new());
        ManagementContext {
            controller: Arc::new(Controller::new(thread_manager.clone())),
            extensions: Arc::new(ExtensionManager::new(thread_manager)),
        }
    }

    #[test]
    fn test_status_all_on_empty_registry() {
        let context = test_context();
        let reply = context.dispatch_line(r#"{"op":"status"}"#);
        assert_eq!(reply["status"], "success");
        assert!(reply["threads"].as_object().expect("threads map").is_empty());
    }

    #[test]
    fn test_stop_unknown_target_reports_not_found() {
        let context = test_context();
        let reply = context.dispatch_line(r#"{"op":"stop","target":"mainloop"}"#);
        assert_eq!(reply["status"], "thread_not_found");
    }

    #[test]
    fn test_malformed_line_is_an_error_object() {
        let context = test_context();
        let reply = context.dispatch_line("{ nope");
        assert_eq!(reply["result"], "error");

        let reply = context.dispatch_line(r#"{"op":"explode"}"#);
        assert_eq!(reply["result"], "error");
    }

    #[test]
    fn test_extension_create_without_global_config_fails() {
        let context = test_context();
        let reply = context.dispatch_line(
            r#"{"op":"extension_create","config":{"name":"x","type":"udp","address":"127.0.0.1","port":20000}}"#,
        );
        assert_eq!(reply["result"], "error");
        assert!(reply["message"]
            .as_str()
            .expect("message")
            .contains("global configuration"));
    }

    #[test]
    fn test_extension_status_all_empty() {
        let context = test_context();
        let reply = context.dispatch_line(r#"{"op":"extension_status"}"#);
        assert_eq!(reply["result"], "success");
        assert!(reply["extensions"].as_array().expect("array").is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_socket_roundtrip() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::UnixStream;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mgmt.sock");
        let token = tokio_util::sync::CancellationToken::new();
        let context = Arc::new(test_context());

        let server = tokio::spawn(serve_unix(context, path.clone(), token.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let stream = UnixStream::connect(&path).await.expect("connect");
        let (reader, mut writer) = stream.into_split();
        writer
            .write_all(b"{\"op\":\"status\"}\n")
            .await
            .expect("write");

        let mut lines = BufReader::new(reader).lines();
        let line = lines
            .next_line()
            .await
            .expect("read")
            .expect("one response line");
        let reply: Value = serde_json::from_str(&line).expect("valid json");
        assert_eq!(reply["status"], "success");

        token.cancel();
        server.await.expect("join").expect("serve result");
        assert!(!path.exists(), "socket file removed on shutdown");
    }
}
