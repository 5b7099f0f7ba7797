//! Diagnostics store — per-document diagnostics pushed by the server.
//!
//! A publish for a URI fully replaces the previous set for that URI; an
//! empty publish clears it.

use std::collections::HashMap;

use url::Url;

use crate::types::{Diagnostic, DiagnosticsSnapshot};

pub(crate) struct DiagnosticsStore {
    data: HashMap<Url, Vec<Diagnostic>>,
}

impl DiagnosticsStore {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
        }
    }

    pub fn update(&mut self, uri: Url, items: Vec<Diagnostic>) {
        if items.is_empty() {
            self.data.remove(&uri);
        } else {
            self.data.insert(uri, items);
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn for_document(&self, uri: &Url) -> &[Diagnostic] {
        self.data.get(uri).map_or(&[], Vec::as_slice)
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let mut documents: Vec<(Url, Vec<Diagnostic>)> = self
            .data
            .iter()
            .map(|(uri, items)| (uri.clone(), items.clone()))
            .collect();

        // Sort: documents with errors first, then by URI
        documents.sort_by(|a, b| {
            let a_has_errors = a.1.iter().any(|d| d.severity().is_error());
            let b_has_errors = b.1.iter().any(|d| d.severity().is_error());
            b_has_errors
                .cmp(&a_has_errors)
                .then_with(|| a.0.cmp(&b.0))
        });

        DiagnosticsSnapshot::new(documents)
    }
}
