//! Editor-side LSP client bridge for Verilog/SystemVerilog language servers.
//!
//! [`LanguageClient`] supervises the server process, frames JSON-RPC over its
//! stdio, correlates requests with responses, forwards document lifecycle
//! events, and collects published diagnostics.

pub mod codec;
pub mod error;
pub mod types;

pub(crate) mod correlator;
pub(crate) mod diagnostics;
pub(crate) mod protocol;
pub(crate) mod session;

mod bridge;

pub use bridge::LanguageClient;
pub use error::ClientError;
pub use types::{
    ClientConfig, Diagnostic, DiagnosticSeverity, DiagnosticsSnapshot, DocumentEvent, SessionState,
};
