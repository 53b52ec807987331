//! `cargo --message-format=json` wire types.
//!
//! Mirrors the subset of rustc's diagnostic JSON the classifier actually
//! reads — message/code/level/spans/children/rendered — rather than the
//! full schema cargo emits.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorCode {
    pub code: String,
    #[serde(default)]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Span {
    pub file_name: String,
    pub line_start: usize,
    #[serde(default)]
    pub line_end: usize,
    pub column_start: usize,
    #[serde(default)]
    pub column_end: usize,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub suggested_replacement: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiagnosticMessage {
    pub message: String,
    #[serde(default)]
    pub code: Option<ErrorCode>,
    pub level: String,
    #[serde(default)]
    pub spans: Vec<Span>,
    #[serde(default)]
    pub children: Vec<DiagnosticMessage>,
    #[serde(default)]
    pub rendered: Option<String>,
}

impl DiagnosticMessage {
    pub fn error_code(&self) -> Option<&str> {
        self.code.as_ref().map(|c| c.code.as_str())
    }

    pub fn primary_span(&self) -> Option<&Span> {
        self.spans.iter().find(|s| s.is_primary).or_else(|| self.spans.first())
    }

    pub fn suggested_replacement(&self) -> Option<&str> {
        self.primary_span().and_then(|s| s.suggested_replacement.as_deref())
    }

    /// Rendered diagnostic text for LLM consumption, falling back to the
    /// bare message when cargo didn't emit a rendered block (e.g. `-q`).
    pub fn format(&self) -> String {
        self.rendered.clone().unwrap_or_else(|| self.message.clone())
    }
}

/// One line of `cargo --message-format=json` output. Only `reason:
/// "compiler-message"` lines carry a diagnostic; everything else
/// (`compiler-artifact`, `build-finished`, ...) is ignored by the parser.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CargoMessage {
    pub reason: String,
    #[serde(default)]
    pub message: Option<DiagnosticMessage>,
}

impl CargoMessage {
    pub fn as_diagnostic(&self) -> Option<&DiagnosticMessage> {
        if self.reason == "compiler-message" {
            self.message.as_ref()
        } else {
            None
        }
    }

    pub fn is_warning(&self) -> bool {
        self.as_diagnostic().map(|d| d.level == "warning").unwrap_or(false)
    }
}
