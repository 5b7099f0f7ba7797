//! Server session — owns one lifetime of the spawned language server
//! process.
//!
//! A session spawns the executable, wires its stdio to the frame codec,
//! drives the initialize handshake, and reports everything the bridge needs
//! through a [`SessionEvent`] channel. Every session carries a generation
//! number stamped into its events so a late event from a discarded session
//! can never be confused with the current one.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use url::Url;

use crate::codec::{FrameReader, FrameWriter};
use crate::correlator::{Correlator, RequestHandle};
use crate::error::ClientError;
use crate::protocol::{
    self, LogMessageParams, Notification, PublishDiagnosticsParams,
};
use crate::types::{ClientConfig, Diagnostic, SessionState};

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Consecutive malformed frames tolerated before the stream is declared
/// corrupt and the session ends.
const CORRUPT_FRAME_TOLERANCE: u32 = 8;

pub(crate) enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

/// Why a session's read loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionExitReason {
    /// The server closed stdout (process exit).
    Exited,
    /// Stream failure or unrecoverable corruption.
    Failed(String),
}

/// Events emitted by session tasks, consumed by the bridge's poll loop.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// Initialize handshake completed; capabilities as reported.
    Initialized {
        generation: u64,
        capabilities: serde_json::Value,
    },
    /// Initialize failed (timeout, rejection, or early exit).
    InitFailed {
        generation: u64,
        error: ClientError,
    },
    /// The process stopped while the session was alive.
    Exited {
        generation: u64,
        reason: SessionExitReason,
    },
    /// Server pushed diagnostics for a document.
    Diagnostics {
        generation: u64,
        uri: Url,
        items: Vec<Diagnostic>,
    },
}

enum IncomingFrame {
    Response {
        id: u64,
        body: serde_json::Value,
    },
    ServerRequest {
        id: serde_json::Value,
        method: String,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

fn parse_incoming(frame: &serde_json::Value) -> Option<IncomingFrame> {
    let id = frame.get("id");
    let method = frame
        .get("method")
        .and_then(|m| m.as_str())
        .map(String::from);
    let has_result_or_error = frame.get("result").is_some() || frame.get("error").is_some();

    match (id, method, has_result_or_error) {
        (Some(id_val), None, true) => Some(IncomingFrame::Response {
            id: id_val.as_u64()?,
            body: frame.clone(),
        }),
        (Some(id_val), Some(method), _) => Some(IncomingFrame::ServerRequest {
            id: id_val.clone(),
            method,
        }),
        (None, Some(method), _) => Some(IncomingFrame::Notification {
            method,
            params: frame.get("params").cloned(),
        }),
        _ => None,
    }
}

/// One lifetime of the spawned server process.
///
/// Created fresh on every (re)start and fully discarded on crash or stop;
/// never reused. `kill_on_drop` guarantees the child does not outlive the
/// handle.
#[derive(Debug)]
pub(crate) struct ServerSession {
    generation: u64,
    state: SessionState,
    child: Child,
    writer_tx: mpsc::Sender<WriterCommand>,
    correlator: Arc<Correlator>,
    capabilities: Option<serde_json::Value>,
    #[allow(dead_code)]
    reader_handle: tokio::task::JoinHandle<()>,
    #[allow(dead_code)]
    writer_handle: tokio::task::JoinHandle<()>,
    #[allow(dead_code)]
    stderr_handle: tokio::task::JoinHandle<()>,
}

impl ServerSession {
    /// Spawn the server process, wire its stdio, and send the initialize
    /// request. The handshake result arrives as a [`SessionEvent`].
    pub async fn spawn(
        generation: u64,
        config: &ClientConfig,
        event_tx: mpsc::Sender<SessionEvent>,
    ) -> Result<Self, ClientError> {
        let resolved_cmd = which::which(&config.command).map_err(|e| ClientError::Spawn {
            command: config.command.clone(),
            reason: e.to_string(),
        })?;

        let mut cmd = Command::new(&resolved_cmd);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ClientError::Spawn {
            command: config.command.clone(),
            reason: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| ClientError::Spawn {
            command: config.command.clone(),
            reason: "no stdin handle from child".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ClientError::Spawn {
            command: config.command.clone(),
            reason: "no stdout handle from child".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| ClientError::Spawn {
            command: config.command.clone(),
            reason: "no stderr handle from child".to_string(),
        })?;

        let correlator = Correlator::new();

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let writer_handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(stdin);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!("LSP write error: {e}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => break,
                }
            }
        });

        // Stderr is unstructured log text, never protocol data.
        let stderr_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "sv_lsp_client::server_stderr", "{line}");
            }
        });

        let reader_handle = tokio::spawn(Self::read_loop(
            FrameReader::new(stdout),
            generation,
            Arc::clone(&correlator),
            event_tx.clone(),
            writer_tx.clone(),
        ));

        let session = Self {
            generation,
            state: SessionState::Starting,
            child,
            writer_tx,
            correlator,
            capabilities: None,
            reader_handle,
            writer_handle,
            stderr_handle,
        };

        session.spawn_init_driver(config, event_tx);

        Ok(session)
    }

    /// Drive the initialize handshake off-thread; the outcome is delivered
    /// as `Initialized` or `InitFailed`.
    fn spawn_init_driver(&self, config: &ClientConfig, event_tx: mpsc::Sender<SessionEvent>) {
        let generation = self.generation;
        let correlator = Arc::clone(&self.correlator);
        let writer_tx = self.writer_tx.clone();
        let root_uri = config.root_uri.clone();
        let init_timeout = Duration::from_secs(config.init_timeout_secs);

        tokio::spawn(async move {
            let params = protocol::initialize_params(root_uri.as_ref());
            let handle = match correlator
                .send(&writer_tx, "initialize", Some(params), init_timeout)
                .await
            {
                Ok(handle) => handle,
                Err(error) => {
                    let _ = event_tx
                        .send(SessionEvent::InitFailed { generation, error })
                        .await;
                    return;
                }
            };

            match handle.wait().await {
                Ok(body) => {
                    if let Some(error) = body.get("error") {
                        let message = error["message"]
                            .as_str()
                            .unwrap_or("unknown error")
                            .to_string();
                        let _ = event_tx
                            .send(SessionEvent::InitFailed {
                                generation,
                                error: ClientError::Rejected {
                                    method: "initialize",
                                    message,
                                },
                            })
                            .await;
                        return;
                    }

                    let capabilities = body["result"]["capabilities"].clone();

                    let notification =
                        Notification::new("initialized", Some(serde_json::json!({})));
                    if let Ok(frame) = serde_json::to_value(&notification) {
                        let _ = writer_tx.send(WriterCommand::Send(frame)).await;
                    }

                    let _ = event_tx
                        .send(SessionEvent::Initialized {
                            generation,
                            capabilities,
                        })
                        .await;
                }
                Err(error) => {
                    let _ = event_tx
                        .send(SessionEvent::InitFailed { generation, error })
                        .await;
                }
            }
        });
    }

    /// Decode loop over the server's stdout. A recoverable frame error is
    /// tolerated up to [`CORRUPT_FRAME_TOLERANCE`] times in a row; a valid
    /// frame resets the run. Past the tolerance, on stream failure, or on
    /// EOF, outstanding requests are failed before the `Exited` event goes
    /// out.
    async fn read_loop<R>(
        mut reader: FrameReader<R>,
        generation: u64,
        correlator: Arc<Correlator>,
        event_tx: mpsc::Sender<SessionEvent>,
        writer_tx: mpsc::Sender<WriterCommand>,
    ) where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut malformed_run: u32 = 0;
        loop {
            match reader.read_frame().await {
                Ok(Some(frame)) => {
                    malformed_run = 0;
                    Self::dispatch_frame(&frame, generation, &correlator, &event_tx, &writer_tx)
                        .await;
                }
                Ok(None) => {
                    tracing::info!(generation, "language server closed stdout");
                    correlator.fail_all("server process exited").await;
                    let _ = event_tx
                        .send(SessionEvent::Exited {
                            generation,
                            reason: SessionExitReason::Exited,
                        })
                        .await;
                    break;
                }
                Err(e) if e.is_recoverable() => {
                    malformed_run += 1;
                    tracing::warn!(
                        generation,
                        run = malformed_run,
                        "skipping malformed frame: {e}"
                    );
                    if malformed_run >= CORRUPT_FRAME_TOLERANCE {
                        let reason =
                            format!("stream corrupt: {malformed_run} consecutive malformed frames");
                        correlator.fail_all(&reason).await;
                        let _ = event_tx
                            .send(SessionEvent::Exited {
                                generation,
                                reason: SessionExitReason::Failed(reason),
                            })
                            .await;
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(generation, "LSP reader error: {e}");
                    correlator.fail_all(&e.to_string()).await;
                    let _ = event_tx
                        .send(SessionEvent::Exited {
                            generation,
                            reason: SessionExitReason::Failed(e.to_string()),
                        })
                        .await;
                    break;
                }
            }
        }
    }

    async fn dispatch_frame(
        frame: &serde_json::Value,
        generation: u64,
        correlator: &Correlator,
        event_tx: &mpsc::Sender<SessionEvent>,
        writer_tx: &mpsc::Sender<WriterCommand>,
    ) {
        let Some(incoming) = parse_incoming(frame) else {
            tracing::trace!(generation, "ignoring malformed JSON-RPC frame");
            return;
        };

        match incoming {
            IncomingFrame::Response { id, body } => {
                correlator.complete(id, body).await;
            }
            IncomingFrame::ServerRequest { id, method } => {
                // Many servers send client/registerCapability,
                // workspace/configuration, etc. We must respond or the
                // server may block.
                tracing::debug!(generation, method, "replying method-not-found to server request");
                let response = protocol::method_not_found_response(&id, &method);
                let _ = writer_tx.send(WriterCommand::Send(response)).await;
            }
            IncomingFrame::Notification { method, params } => {
                Self::handle_notification(generation, &method, params, event_tx).await;
            }
        }
    }

    async fn handle_notification(
        generation: u64,
        method: &str,
        params: Option<serde_json::Value>,
        event_tx: &mpsc::Sender<SessionEvent>,
    ) {
        match method {
            "textDocument/publishDiagnostics" => {
                let Some(params) = params else { return };
                match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                    Ok(diag_params) => {
                        let Ok(uri) = Url::parse(&diag_params.uri) else {
                            tracing::warn!(
                                generation,
                                uri = diag_params.uri,
                                "diagnostics for unparseable URI dropped"
                            );
                            return;
                        };
                        let items = diag_params
                            .diagnostics
                            .into_iter()
                            .map(protocol::WireDiagnostic::into_diagnostic)
                            .collect();
                        let _ = event_tx
                            .send(SessionEvent::Diagnostics {
                                generation,
                                uri,
                                items,
                            })
                            .await;
                    }
                    Err(e) => {
                        tracing::debug!(generation, "failed to parse publishDiagnostics: {e}");
                    }
                }
            }
            "window/logMessage" => {
                let Some(params) = params else { return };
                if let Ok(log) = serde_json::from_value::<LogMessageParams>(params) {
                    match log.level {
                        1 => tracing::warn!(target: "sv_lsp_client::server_log", "{}", log.message),
                        2 => tracing::info!(target: "sv_lsp_client::server_log", "{}", log.message),
                        _ => tracing::debug!(target: "sv_lsp_client::server_log", "{}", log.message),
                    }
                }
            }
            _ => {
                tracing::trace!(generation, method, "ignoring server notification");
            }
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        tracing::debug!(
            generation = self.generation,
            from = %self.state,
            to = %state,
            "session state transition"
        );
        self.state = state;
    }

    pub fn capabilities(&self) -> Option<&serde_json::Value> {
        self.capabilities.as_ref()
    }

    pub fn set_capabilities(&mut self, capabilities: serde_json::Value) {
        self.capabilities = Some(capabilities);
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Send a notification frame to the server.
    pub async fn notify(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
    ) -> Result<(), ClientError> {
        let notification = Notification::new(method, params);
        let frame = serde_json::to_value(&notification)
            .map_err(|e| ClientError::Protocol(format!("unserializable notification: {e}")))?;
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| ClientError::ChannelClosed)
    }

    /// Submit a request through the correlator.
    pub async fn request(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<RequestHandle, ClientError> {
        self.correlator
            .send(&self.writer_tx, method, params, timeout)
            .await
    }

    /// Forcibly terminate the process without the shutdown handshake.
    pub fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(generation = self.generation, "kill failed: {e}");
        }
    }

    /// Graceful shutdown: `shutdown` request (bounded by `request_timeout`),
    /// `exit` notification, then wait up to `grace` for the process to leave
    /// before killing it. Total wait is bounded by `request_timeout + grace`.
    /// Consumes the session.
    pub async fn shutdown(mut self, request_timeout: Duration, grace: Duration) {
        if let Ok(handle) = self.request("shutdown", None, request_timeout).await
            && let Ok(response) = handle.wait().await
            && response.get("error").is_none()
        {
            let _ = self.notify("exit", None).await;
        }

        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;

        let wait_result = tokio::time::timeout(grace, self.child.wait()).await;
        if wait_result.is_err() {
            tracing::debug!(
                generation = self.generation,
                "server did not exit within grace period, killing"
            );
            let _ = self.child.kill().await;
        }
    }

    /// Session wired to caller-held channels, for bridge tests that must
    /// observe outbound frames without a real server.
    #[cfg(test)]
    pub fn for_test(
        generation: u64,
        child: Child,
        writer_tx: mpsc::Sender<WriterCommand>,
        correlator: Arc<Correlator>,
    ) -> Self {
        Self {
            generation,
            state: SessionState::Starting,
            child,
            writer_tx,
            correlator,
            capabilities: None,
            reader_handle: tokio::spawn(async {}),
            writer_handle: tokio::spawn(async {}),
            stderr_handle: tokio::spawn(async {}),
        }
    }
}
