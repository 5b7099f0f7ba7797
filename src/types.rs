//! Public types consumed by the editor integration layer.
//!
//! The editor constructs a [`ClientConfig`], feeds [`DocumentEvent`]s into the
//! bridge, and reads [`DiagnosticsSnapshot`]s for rendering. Document state
//! (text, version counters) stays owned by the editor; the bridge only reads
//! what the events carry.

use std::fmt;

use serde::Deserialize;
use url::Url;

fn default_language_ids() -> Vec<String> {
    vec!["verilog".to_string(), "systemverilog".to_string()]
}

fn default_request_timeout() -> u64 {
    15
}

fn default_init_timeout() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    2
}

/// Configuration for the language client.
///
/// Loading this from a file is the host's concern; this type is the validated
/// deserialization boundary.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Server executable (e.g. "svls"). Resolved via PATH at spawn time.
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Language identifiers forwarded to the server. Documents with any other
    /// language id are ignored entirely.
    #[serde(default = "default_language_ids")]
    pub language_ids: Vec<String>,
    /// Workspace root URI sent in the initialize request, if any.
    #[serde(default)]
    pub root_uri: Option<Url>,
    /// Per-request response timeout, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Timeout for the initialize handshake, in seconds.
    #[serde(default = "default_init_timeout")]
    pub init_timeout_secs: u64,
    /// Grace period for graceful shutdown before the process is killed,
    /// in seconds.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl ClientConfig {
    /// Minimal config for a server command with default timeouts and the
    /// Verilog/SystemVerilog language set.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            language_ids: default_language_ids(),
            root_uri: None,
            request_timeout_secs: default_request_timeout(),
            init_timeout_secs: default_init_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }

    pub(crate) fn accepts_language(&self, language_id: &str) -> bool {
        self.language_ids.iter().any(|l| l == language_id)
    }
}

/// Lifecycle state of the current server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session exists.
    Stopped,
    /// Process spawned, initialize handshake in flight.
    Starting,
    /// Initialize completed; document traffic flows.
    Running,
    /// Graceful shutdown in progress.
    Stopping,
    /// Process exited unexpectedly or initialization failed. Terminal for
    /// this session; a fresh `start()` creates a new one.
    Crashed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        };
        f.write_str(label)
    }
}

/// A document lifecycle event from the editor.
///
/// The editor owns document text and version counters; events carry
/// everything the bridge needs to build protocol messages.
#[derive(Debug, Clone)]
pub enum DocumentEvent {
    Opened {
        uri: Url,
        language_id: String,
        version: i32,
        text: String,
    },
    Changed {
        uri: Url,
        version: i32,
        text: String,
    },
    Closed {
        uri: Url,
    },
}

impl DocumentEvent {
    pub(crate) fn uri(&self) -> &Url {
        match self {
            Self::Opened { uri, .. } | Self::Changed { uri, .. } | Self::Closed { uri } => uri,
        }
    }
}

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Convert from LSP numeric severity (1=Error, 2=Warning, 3=Info, 4=Hint).
    ///
    /// Returns `None` for values outside the LSP-defined range; the boundary
    /// decides the fallback.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

/// A single diagnostic pushed by the language server.
///
/// Fields are private; construction is restricted to the protocol boundary
/// and tests. Consumers read via accessors.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    severity: DiagnosticSeverity,
    message: String,
    /// 0-indexed line number.
    line: u32,
    /// 0-indexed column.
    col: u32,
    /// Diagnostic code, when the server assigns one.
    code: Option<String>,
    /// Producer of the diagnostic (e.g. the linter name).
    source: String,
}

impl Diagnostic {
    #[must_use]
    pub fn new(
        severity: DiagnosticSeverity,
        message: String,
        line: u32,
        col: u32,
        code: Option<String>,
        source: String,
    ) -> Self {
        Self {
            severity,
            message,
            line,
            col,
            code,
            source,
        }
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 0-indexed line number.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    /// 0-indexed column.
    #[must_use]
    pub fn col(&self) -> u32 {
        self.col
    }

    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Format as `uri:line:col: severity: message` (1-indexed for display).
    #[must_use]
    pub fn display_with_uri(&self, uri: &Url) -> String {
        format!(
            "{}:{}:{}: {}: [{}] {}",
            uri,
            self.line + 1,
            self.col + 1,
            self.severity.label(),
            self.source,
            self.message,
        )
    }
}

/// Immutable snapshot of all diagnostics, keyed by document URI.
///
/// Counts are computed from the canonical per-document data rather than
/// cached alongside it.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsSnapshot {
    /// Per-document diagnostics, sorted with error-containing documents
    /// first.
    documents: Vec<(Url, Vec<Diagnostic>)>,
}

impl DiagnosticsSnapshot {
    pub(crate) fn new(documents: Vec<(Url, Vec<Diagnostic>)>) -> Self {
        Self { documents }
    }

    /// Per-document diagnostics, sorted with error-containing documents
    /// first.
    #[must_use]
    pub fn documents(&self) -> &[(Url, Vec<Diagnostic>)] {
        &self.documents
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn count_by_severity(&self, severity: DiagnosticSeverity) -> usize {
        self.documents
            .iter()
            .flat_map(|(_, items)| items)
            .filter(|d| d.severity() == severity)
            .count()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Error)
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Warning)
    }

    /// Total diagnostic count across all documents.
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.documents.iter().map(|(_, items)| items.len()).sum()
    }

    /// Compact status string like "E:3 W:5", empty when clean.
    #[must_use]
    pub fn status_string(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!("E:{} W:{}", self.error_count(), self.warning_count())
    }
}
