//! Compiler error classification.
//!
//! The verifier gate pipeline runs `cargo check`/`clippy` itself and hands
//! the raw output here to be classified by category (borrow checker,
//! lifetime, type mismatch, ...) so the Issue Advisor and friction detector
//! have something more structured than a wall of rustc text to reason about.

pub mod cargo_message;
pub mod error_parser;

pub use cargo_message::{CargoMessage, DiagnosticMessage, ErrorCode, Span};
pub use error_parser::{ErrorCategory, ParsedError, RustcErrorParser};
