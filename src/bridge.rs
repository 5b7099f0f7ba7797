//! Client bridge facade — public API consumed by the editor integration.
//!
//! The editor interacts with the language server through this single type:
//! lifecycle (`start`/`stop`/`restart`), document events in, diagnostics out.
//! The bridge exclusively owns the current [`ServerSession`] and its pending
//! request table; the editor owns document state and feeds the bridge
//! events.
//!
//! Session tasks report through an event channel drained by
//! [`LanguageClient::poll_events`]; that single consumer is where all state
//! transitions happen, so there is no concurrent writer to bridge state.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tokio::sync::mpsc;
use url::Url;

use crate::diagnostics::DiagnosticsStore;
use crate::error::ClientError;
use crate::protocol;
use crate::session::{ServerSession, SessionEvent, SessionExitReason};
use crate::types::{ClientConfig, Diagnostic, DiagnosticsSnapshot, DocumentEvent, SessionState};

/// Channel capacity for the event channel between session tasks and the
/// bridge.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Editor-side language client for a Verilog/SystemVerilog server.
///
/// After a crash or an explicit `stop`, a subsequent `start` creates a fresh
/// session; the editor is expected to re-send `Opened` events for documents
/// it still has open.
pub struct LanguageClient {
    config: ClientConfig,
    session: Option<ServerSession>,
    next_generation: u64,
    /// Document events that arrived while the session was still `Starting`,
    /// flushed in arrival order once `Running`.
    queue: VecDeque<DocumentEvent>,
    /// Documents forwarded to the server (didOpen sent or queued). Changes
    /// and closes for anything else are ignored.
    tracked: HashSet<Url>,
    diagnostics: DiagnosticsStore,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: mpsc::Receiver<SessionEvent>,
    last_error: Option<ClientError>,
}

impl LanguageClient {
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            session: None,
            next_generation: 1,
            queue: VecDeque::new(),
            tracked: HashSet::new(),
            diagnostics: DiagnosticsStore::new(),
            event_tx,
            event_rx,
            last_error: None,
        }
    }

    /// Current lifecycle state. `Stopped` when no session exists.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map_or(SessionState::Stopped, ServerSession::state)
    }

    /// Capabilities reported by the server at initialization, once `Running`.
    #[must_use]
    pub fn capabilities(&self) -> Option<&serde_json::Value> {
        self.session.as_ref().and_then(ServerSession::capabilities)
    }

    /// The most recent session-level failure, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<&ClientError> {
        self.last_error.as_ref()
    }

    /// Start the language server.
    ///
    /// Idempotent: if a session is already `Starting` or `Running` this is a
    /// no-op. A `Crashed` session is discarded and replaced. The initialize
    /// handshake completes asynchronously; observe it via [`Self::poll_events`]
    /// and [`Self::state`].
    pub async fn start(&mut self) -> Result<(), ClientError> {
        match self.state() {
            SessionState::Starting | SessionState::Running => {
                tracing::debug!(state = %self.state(), "start ignored, session already active");
                return Ok(());
            }
            SessionState::Stopped | SessionState::Stopping | SessionState::Crashed => {}
        }

        if let Some(mut old) = self.session.take() {
            old.kill();
        }
        self.queue.clear();
        self.tracked.clear();
        self.diagnostics.clear();
        self.last_error = None;

        let generation = self.next_generation;
        self.next_generation += 1;

        tracing::info!(command = self.config.command, generation, "starting language server");
        let session = ServerSession::spawn(generation, &self.config, self.event_tx.clone()).await?;
        self.session = Some(session);
        Ok(())
    }

    /// Stop the language server gracefully.
    ///
    /// Idempotent: a no-op when no session exists. Outstanding requests are
    /// cancelled and the dead session's diagnostics are dropped; the process
    /// gets the shutdown handshake (bounded by the request timeout) and a
    /// bounded grace period before being killed.
    pub async fn stop(&mut self) {
        let Some(mut session) = self.session.take() else {
            tracing::debug!("stop ignored, no active session");
            return;
        };
        self.queue.clear();
        self.tracked.clear();
        self.diagnostics.clear();

        if session.state() == SessionState::Crashed {
            // Process is already gone; just make sure.
            session.kill();
            return;
        }

        session.set_state(SessionState::Stopping);

        let cancelled = session.correlator().cancel_all().await;
        for id in cancelled {
            let _ = session
                .notify("$/cancelRequest", Some(protocol::cancel_params(id)))
                .await;
        }

        session
            .shutdown(
                Duration::from_secs(self.config.request_timeout_secs),
                Duration::from_secs(self.config.shutdown_grace_secs),
            )
            .await;
        tracing::info!("language server stopped");
    }

    /// Stop the current session (if any) and start a fresh one.
    pub async fn restart(&mut self) -> Result<(), ClientError> {
        self.stop().await;
        self.start().await
    }

    /// Feed a document lifecycle event from the editor.
    ///
    /// Documents whose language id is outside the configured set are ignored
    /// entirely. While `Starting`, accepted events are queued and flushed in
    /// arrival order on reaching `Running`. Events against a `Stopped` or
    /// `Crashed` session are an error, not a silent drop.
    pub async fn document_event(&mut self, event: DocumentEvent) -> Result<(), ClientError> {
        match &event {
            DocumentEvent::Opened { language_id, .. } => {
                if !self.config.accepts_language(language_id) {
                    return Ok(());
                }
            }
            DocumentEvent::Changed { uri, .. } | DocumentEvent::Closed { uri } => {
                if !self.tracked.contains(uri) {
                    return Ok(());
                }
            }
        }

        match self.state() {
            SessionState::Running => {
                self.track(&event);
                self.send_document_event(&event).await
            }
            SessionState::Starting => {
                self.track(&event);
                self.queue.push_back(event);
                Ok(())
            }
            state @ (SessionState::Stopped | SessionState::Stopping | SessionState::Crashed) => {
                Err(ClientError::InvalidState { state })
            }
        }
    }

    fn track(&mut self, event: &DocumentEvent) {
        match event {
            DocumentEvent::Opened { uri, .. } => {
                self.tracked.insert(uri.clone());
            }
            DocumentEvent::Closed { uri } => {
                self.tracked.remove(uri);
            }
            DocumentEvent::Changed { .. } => {}
        }
    }

    async fn send_document_event(&self, event: &DocumentEvent) -> Result<(), ClientError> {
        let session = self.session.as_ref().ok_or(ClientError::InvalidState {
            state: SessionState::Stopped,
        })?;
        match event {
            DocumentEvent::Opened {
                uri,
                language_id,
                version,
                text,
            } => {
                session
                    .notify(
                        "textDocument/didOpen",
                        Some(protocol::did_open_params(uri, language_id, *version, text)),
                    )
                    .await
            }
            DocumentEvent::Changed { uri, version, text } => {
                session
                    .notify(
                        "textDocument/didChange",
                        Some(protocol::did_change_params(uri, *version, text)),
                    )
                    .await
            }
            DocumentEvent::Closed { uri } => {
                session
                    .notify(
                        "textDocument/didClose",
                        Some(protocol::did_close_params(uri)),
                    )
                    .await
            }
        }
    }

    /// Drain pending session events, up to `budget`. Returns the number
    /// handled; non-blocking when the channel is empty.
    pub async fn poll_events(&mut self, budget: usize) -> usize {
        let mut count = 0;
        while count < budget {
            match self.event_rx.try_recv() {
                Ok(event) => {
                    self.handle_session_event(event).await;
                    count += 1;
                }
                Err(mpsc::error::TryRecvError::Empty | mpsc::error::TryRecvError::Disconnected) => {
                    break;
                }
            }
        }
        count
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        let current_generation = self.session.as_ref().map(ServerSession::generation);
        let event_generation = match &event {
            SessionEvent::Initialized { generation, .. }
            | SessionEvent::InitFailed { generation, .. }
            | SessionEvent::Exited { generation, .. }
            | SessionEvent::Diagnostics { generation, .. } => *generation,
        };
        if current_generation != Some(event_generation) {
            tracing::trace!(
                event_generation,
                "dropping event from a discarded session"
            );
            return;
        }

        match event {
            SessionEvent::Initialized { capabilities, .. } => {
                self.on_initialized(capabilities).await;
            }
            SessionEvent::InitFailed { error, .. } => {
                tracing::warn!("language server initialization failed: {error}");
                self.mark_crashed("initialization failed").await;
                self.last_error = Some(error);
            }
            SessionEvent::Exited { reason, .. } => {
                let reason_text = match &reason {
                    SessionExitReason::Exited => "server process exited".to_string(),
                    SessionExitReason::Failed(msg) => msg.clone(),
                };
                tracing::warn!("language server stopped unexpectedly: {reason_text}");
                self.mark_crashed(&reason_text).await;
                self.last_error = Some(ClientError::crashed(reason_text));
            }
            SessionEvent::Diagnostics { uri, items, .. } => {
                tracing::debug!(uri = %uri, count = items.len(), "diagnostics updated");
                self.diagnostics.update(uri, items);
            }
        }
    }

    async fn on_initialized(&mut self, capabilities: serde_json::Value) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.state() != SessionState::Starting {
            tracing::debug!(state = %session.state(), "ignoring initialize completion");
            return;
        }
        session.set_capabilities(capabilities);
        session.set_state(SessionState::Running);
        tracing::info!(
            generation = session.generation(),
            queued = self.queue.len(),
            "language server running"
        );
        self.flush_queue().await;
    }

    /// Flush document events queued while `Starting`, in arrival order.
    async fn flush_queue(&mut self) {
        while let Some(event) = self.queue.pop_front() {
            if let Err(e) = self.send_document_event(&event).await {
                tracing::warn!(uri = %event.uri(), "failed to flush queued document event: {e}");
                break;
            }
        }
    }

    async fn mark_crashed(&mut self, reason: &str) {
        self.queue.clear();
        if let Some(session) = self.session.as_mut() {
            // The reader task already failed its own pending requests; this
            // covers requests submitted after the reader stopped.
            session.correlator().fail_all(reason).await;
            session.kill();
            session.set_state(SessionState::Crashed);
        }
    }

    /// Immutable snapshot of all diagnostics.
    #[must_use]
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Diagnostics currently published for one document.
    #[must_use]
    pub fn diagnostics_for(&self, uri: &Url) -> &[Diagnostic] {
        self.diagnostics.for_document(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::sync::Arc;

    use tokio::process::Command;

    use crate::correlator::Correlator;
    use crate::session::WriterCommand;
    use crate::types::DiagnosticSeverity;

    fn test_config() -> ClientConfig {
        let mut config = ClientConfig::new("cat");
        config.request_timeout_secs = 0;
        config.shutdown_grace_secs = 0;
        config
    }

    fn test_client() -> LanguageClient {
        LanguageClient::new(test_config())
    }

    fn uri(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn opened(u: &str, language_id: &str, version: i32) -> DocumentEvent {
        DocumentEvent::Opened {
            uri: uri(u),
            language_id: language_id.to_string(),
            version,
            text: "module m; endmodule".to_string(),
        }
    }

    fn changed(u: &str, version: i32, text: &str) -> DocumentEvent {
        DocumentEvent::Changed {
            uri: uri(u),
            version,
            text: text.to_string(),
        }
    }

    fn make_diag(msg: &str) -> Diagnostic {
        Diagnostic::new(
            DiagnosticSeverity::Error,
            msg.to_string(),
            0,
            0,
            None,
            "svls".to_string(),
        )
    }

    /// Install a session wired to channels the test holds, with a harmless
    /// child process standing in for the server.
    #[cfg(unix)]
    async fn install_session(
        client: &mut LanguageClient,
        state: SessionState,
    ) -> (mpsc::Receiver<WriterCommand>, Arc<Correlator>, u64) {
        let child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .expect("spawn cat");
        let (writer_tx, writer_rx) = mpsc::channel(32);
        let correlator = Correlator::new();
        let generation = client.next_generation;
        client.next_generation += 1;
        let mut session =
            ServerSession::for_test(generation, child, writer_tx, Arc::clone(&correlator));
        if state != SessionState::Starting {
            session.set_state(state);
        }
        client.session = Some(session);
        (writer_rx, correlator, generation)
    }

    fn sent_method(cmd: WriterCommand) -> String {
        match cmd {
            WriterCommand::Send(frame) => frame["method"].as_str().unwrap_or("").to_string(),
            WriterCommand::Shutdown => "<shutdown>".to_string(),
        }
    }

    #[tokio::test]
    async fn test_initial_state_is_stopped() {
        let client = test_client();
        assert_eq!(client.state(), SessionState::Stopped);
        assert!(client.snapshot().is_empty());
        assert!(client.capabilities().is_none());
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let mut client = test_client();
        client.stop().await;
        client.stop().await;
        assert_eq!(client.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_start_with_missing_binary_is_spawn_error() {
        let mut client =
            LanguageClient::new(ClientConfig::new("definitely-not-a-real-language-server"));
        let err = client.start().await.unwrap_err();
        assert!(matches!(err, ClientError::Spawn { .. }));
        assert_eq!(client.state(), SessionState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_is_idempotent() {
        let mut client = test_client();
        client.start().await.unwrap();
        assert_eq!(client.state(), SessionState::Starting);
        let generation = client.session.as_ref().unwrap().generation();

        // Second start must not spawn a second process.
        client.start().await.unwrap();
        assert_eq!(client.session.as_ref().unwrap().generation(), generation);
        assert_eq!(client.next_generation, generation + 1);

        client.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_document_events_queued_while_starting_flush_in_order() {
        let mut client = test_client();
        let (mut writer_rx, _correlator, generation) =
            install_session(&mut client, SessionState::Starting).await;

        client
            .document_event(opened("file:///rtl/a.sv", "systemverilog", 1))
            .await
            .unwrap();
        client
            .document_event(changed("file:///rtl/a.sv", 2, "module a; endmodule"))
            .await
            .unwrap();
        client
            .document_event(changed("file:///rtl/a.sv", 3, "module a(); endmodule"))
            .await
            .unwrap();
        client
            .document_event(changed("file:///rtl/a.sv", 4, "module a(input clk); endmodule"))
            .await
            .unwrap();

        // Nothing goes out while starting.
        assert!(writer_rx.try_recv().is_err());
        assert_eq!(client.queue.len(), 4);

        client
            .event_tx
            .send(SessionEvent::Initialized {
                generation,
                capabilities: serde_json::json!({"textDocumentSync": 1}),
            })
            .await
            .unwrap();
        assert_eq!(client.poll_events(10).await, 1);
        assert_eq!(client.state(), SessionState::Running);
        assert!(client.capabilities().is_some());

        // Flushed in arrival order, versions ascending.
        let first = match writer_rx.try_recv().unwrap() {
            WriterCommand::Send(frame) => frame,
            WriterCommand::Shutdown => panic!("unexpected shutdown"),
        };
        assert_eq!(first["method"], "textDocument/didOpen");
        assert_eq!(first["params"]["textDocument"]["version"], 1);
        for expected_version in 2..=4 {
            let frame = match writer_rx.try_recv().unwrap() {
                WriterCommand::Send(frame) => frame,
                WriterCommand::Shutdown => panic!("unexpected shutdown"),
            };
            assert_eq!(frame["method"], "textDocument/didChange");
            assert_eq!(
                frame["params"]["textDocument"]["version"],
                expected_version
            );
        }
        assert!(writer_rx.try_recv().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_document_events_sent_immediately_while_running() {
        let mut client = test_client();
        let (mut writer_rx, _correlator, _generation) =
            install_session(&mut client, SessionState::Running).await;

        client
            .document_event(opened("file:///rtl/b.sv", "verilog", 1))
            .await
            .unwrap();
        client
            .document_event(DocumentEvent::Closed {
                uri: uri("file:///rtl/b.sv"),
            })
            .await
            .unwrap();

        assert_eq!(sent_method(writer_rx.try_recv().unwrap()), "textDocument/didOpen");
        assert_eq!(sent_method(writer_rx.try_recv().unwrap()), "textDocument/didClose");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_matching_language_is_ignored_entirely() {
        let mut client = test_client();
        let (mut writer_rx, _correlator, _generation) =
            install_session(&mut client, SessionState::Running).await;

        client
            .document_event(opened("file:///fw/boot.c", "c", 1))
            .await
            .unwrap();
        // Changes to a document that was never forwarded are ignored too.
        client
            .document_event(changed("file:///fw/boot.c", 2, "int main() {}"))
            .await
            .unwrap();

        assert!(writer_rx.try_recv().is_err());
        assert!(client.queue.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_changes_after_close_are_ignored() {
        let mut client = test_client();
        let (mut writer_rx, _correlator, _generation) =
            install_session(&mut client, SessionState::Running).await;

        client
            .document_event(opened("file:///rtl/c.sv", "systemverilog", 1))
            .await
            .unwrap();
        client
            .document_event(DocumentEvent::Closed {
                uri: uri("file:///rtl/c.sv"),
            })
            .await
            .unwrap();
        client
            .document_event(changed("file:///rtl/c.sv", 2, "module c; endmodule"))
            .await
            .unwrap();

        assert_eq!(sent_method(writer_rx.try_recv().unwrap()), "textDocument/didOpen");
        assert_eq!(sent_method(writer_rx.try_recv().unwrap()), "textDocument/didClose");
        assert!(writer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_document_event_while_stopped_is_invalid_state() {
        let mut client = test_client();
        let err = client
            .document_event(opened("file:///rtl/a.sv", "verilog", 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::InvalidState {
                state: SessionState::Stopped
            }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crash_fails_inflight_requests_and_allows_restart() {
        let mut client = test_client();
        let (mut writer_rx, correlator, generation) =
            install_session(&mut client, SessionState::Running).await;

        // An in-flight request at crash time.
        let writer_tx = client.session.as_ref().unwrap();
        let handle = writer_tx
            .request("shutdown", None, Duration::from_secs(30))
            .await
            .unwrap();
        let _ = writer_rx.try_recv().unwrap();

        client
            .event_tx
            .send(SessionEvent::Exited {
                generation,
                reason: SessionExitReason::Exited,
            })
            .await
            .unwrap();
        client.poll_events(10).await;

        assert_eq!(client.state(), SessionState::Crashed);
        assert!(matches!(
            client.last_error(),
            Some(ClientError::ServerCrashed { .. })
        ));
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, ClientError::ServerCrashed { .. }));
        assert_eq!(correlator.pending_count().await, 0);

        // Explicit restart produces a fresh session.
        client.start().await.unwrap();
        assert_eq!(client.state(), SessionState::Starting);
        assert_eq!(client.session.as_ref().unwrap().generation(), generation + 1);

        client.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_events_from_discarded_session_are_dropped() {
        let mut client = test_client();
        let (_writer_rx, _correlator, generation) =
            install_session(&mut client, SessionState::Running).await;

        client
            .event_tx
            .send(SessionEvent::Exited {
                generation: generation + 17,
                reason: SessionExitReason::Exited,
            })
            .await
            .unwrap();
        client.poll_events(10).await;

        // A stale event must not crash the current session.
        assert_eq!(client.state(), SessionState::Running);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_init_failure_moves_session_to_crashed() {
        let mut client = test_client();
        let (_writer_rx, _correlator, generation) =
            install_session(&mut client, SessionState::Starting).await;

        client
            .event_tx
            .send(SessionEvent::InitFailed {
                generation,
                error: ClientError::Timeout {
                    method: "initialize",
                    timeout: Duration::from_secs(30),
                },
            })
            .await
            .unwrap();
        client.poll_events(10).await;

        assert_eq!(client.state(), SessionState::Crashed);
        assert!(matches!(
            client.last_error(),
            Some(ClientError::Timeout { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_diagnostics_replace_per_document() {
        let mut client = test_client();
        let (_writer_rx, _correlator, generation) =
            install_session(&mut client, SessionState::Running).await;

        client
            .event_tx
            .send(SessionEvent::Diagnostics {
                generation,
                uri: uri("file:///rtl/a.sv"),
                items: vec![make_diag("first"), make_diag("second")],
            })
            .await
            .unwrap();
        client
            .event_tx
            .send(SessionEvent::Diagnostics {
                generation,
                uri: uri("file:///rtl/a.sv"),
                items: vec![make_diag("latest only")],
            })
            .await
            .unwrap();

        assert_eq!(client.poll_events(10).await, 2);

        let diags = client.diagnostics_for(&uri("file:///rtl/a.sv"));
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].message(), "latest only");
        assert_eq!(client.snapshot().error_count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_poll_events_respects_budget() {
        let mut client = test_client();
        let (_writer_rx, _correlator, generation) =
            install_session(&mut client, SessionState::Running).await;

        for i in 0..5 {
            client
                .event_tx
                .send(SessionEvent::Diagnostics {
                    generation,
                    uri: uri(&format!("file:///rtl/f{i}.sv")),
                    items: vec![make_diag("err")],
                })
                .await
                .unwrap();
        }

        assert_eq!(client.poll_events(3).await, 3);
        assert_eq!(client.poll_events(10).await, 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_from_crashed_returns_to_stopped() {
        let mut client = test_client();
        let (_writer_rx, _correlator, _generation) =
            install_session(&mut client, SessionState::Crashed).await;

        client.stop().await;
        assert_eq!(client.state(), SessionState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_clears_diagnostics() {
        let mut client = test_client();
        let (_writer_rx, _correlator, generation) =
            install_session(&mut client, SessionState::Running).await;

        client
            .event_tx
            .send(SessionEvent::Diagnostics {
                generation,
                uri: uri("file:///rtl/a.sv"),
                items: vec![make_diag("stale after stop")],
            })
            .await
            .unwrap();
        client.poll_events(10).await;
        assert!(!client.snapshot().is_empty());

        client.stop().await;

        // A stopped bridge must not keep serving the dead session's
        // diagnostics.
        assert_eq!(client.state(), SessionState::Stopped);
        assert!(client.snapshot().is_empty());
        assert!(client.diagnostics_for(&uri("file:///rtl/a.sv")).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn test_stop_wait_bounded_by_request_timeout_plus_grace() {
        let mut config = ClientConfig::new("cat");
        config.request_timeout_secs = 1;
        config.shutdown_grace_secs = 0;
        let mut client = LanguageClient::new(config);
        let (_writer_rx, _correlator, _generation) =
            install_session(&mut client, SessionState::Running).await;

        let started = tokio::time::Instant::now();
        client.stop().await;
        let elapsed = started.elapsed();

        // The shutdown request waits its own timeout; the process wait uses
        // the grace period. Neither budget is spent twice.
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(client.state(), SessionState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_cancels_outstanding_requests() {
        let mut client = test_client();
        let (mut writer_rx, _correlator, _generation) =
            install_session(&mut client, SessionState::Running).await;

        let handle = client
            .session
            .as_ref()
            .unwrap()
            .request("shutdown", None, Duration::from_secs(30))
            .await
            .unwrap();
        let _ = writer_rx.try_recv().unwrap();

        client.stop().await;
        assert_eq!(client.state(), SessionState::Stopped);

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, ClientError::Cancelled { .. }));

        // The server was told about the cancellation before shutdown.
        let mut saw_cancel = false;
        while let Ok(cmd) = writer_rx.try_recv() {
            if sent_method(cmd) == "$/cancelRequest" {
                saw_cancel = true;
            }
        }
        assert!(saw_cancel);
    }
}
