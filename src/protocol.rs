//! Internal LSP message serde types for JSON-RPC communication.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::types::{Diagnostic, DiagnosticSeverity};

pub(crate) const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error code for "method not found", returned to server-to-client
/// requests the bridge does not implement.
pub(crate) const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Serialize)]
pub(crate) struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Request {
    pub fn new(id: u64, method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Notification {
    pub fn new(method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

/// Reply to a server-to-client request the bridge does not handle. The
/// server may block waiting for an answer, so one must always be sent.
pub(crate) fn method_not_found_response(id: &serde_json::Value, method: &str) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": METHOD_NOT_FOUND,
            "message": format!("Method not found: {method}")
        }
    })
}

pub(crate) fn initialize_params(root_uri: Option<&Url>) -> serde_json::Value {
    serde_json::json!({
        "processId": std::process::id(),
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION")
        },
        "rootUri": root_uri.map(Url::as_str),
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": false
                },
                "publishDiagnostics": {
                    "relatedInformation": false
                }
            }
        }
    })
}

pub(crate) fn did_open_params(
    uri: &Url,
    language_id: &str,
    version: i32,
    text: &str,
) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri.as_str(),
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_change_params(uri: &Url, version: i32, text: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri.as_str(),
            "version": version
        },
        "contentChanges": [{
            "text": text
        }]
    })
}

pub(crate) fn did_close_params(uri: &Url) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri.as_str()
        }
    })
}

pub(crate) fn cancel_params(id: u64) -> serde_json::Value {
    serde_json::json!({ "id": id })
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    pub diagnostics: Vec<WireDiagnostic>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireDiagnostic {
    pub range: WireRange,
    pub severity: Option<u64>,
    /// LSP allows both string and numeric codes.
    pub code: Option<serde_json::Value>,
    pub source: Option<String>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireRange {
    pub start: WirePosition,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WirePosition {
    pub line: u32,
    pub character: u32,
}

impl WireDiagnostic {
    pub fn into_diagnostic(self) -> Diagnostic {
        let code = self.code.map(|c| match c {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });
        Diagnostic::new(
            self.severity
                .and_then(DiagnosticSeverity::from_lsp)
                .unwrap_or(DiagnosticSeverity::Warning),
            self.message,
            self.range.start.line,
            self.range.start.character,
            code,
            self.source.unwrap_or_else(|| String::from("unknown")),
        )
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct LogMessageParams {
    /// 1=Error, 2=Warning, 3=Info, 4=Log.
    #[serde(rename = "type")]
    pub level: u64,
    pub message: String,
}
