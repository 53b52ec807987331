//! Self-describing response envelope parsing.
//!
//! Agents are prompted to emit a status discriminant plus a JSON payload;
//! this mirrors `contracts::extract_json_block` but targets the five
//! statuses the invocation layer contract requires (§4.1) rather than the
//! four-way `ObjectiveStatus` used by the legacy single-issue loop.

use super::types::{RawResponse, ResponseStatus};

/// Pull a JSON object out of free-form model text: prefer a fenced ```json
/// block, fall back to the first `{` .. last `}` span.
pub fn extract_json_block(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let json_start = start + 7;
        if let Some(end) = text[json_start..].find("```") {
            return Some(text[json_start..json_start + end].trim());
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

fn infer_status_from_text(text: &str) -> ResponseStatus {
    let upper = text.to_uppercase();
    if upper.contains("\"STATUS\": \"CANCELLED\"") || upper.contains("STATUS: CANCELLED") {
        ResponseStatus::Cancelled
    } else if upper.contains("\"STATUS\": \"TIMED_OUT\"") || upper.contains("STATUS: TIMED_OUT") {
        ResponseStatus::TimedOut
    } else if upper.contains("\"STATUS\": \"ERROR\"") || upper.contains("STATUS: ERROR") {
        ResponseStatus::Error
    } else if upper.contains("\"STATUS\": \"FAILED\"") || upper.contains("STATUS: FAILED") {
        ResponseStatus::Failed
    } else {
        // Default-open: a response with no explicit discriminant but with a
        // parseable JSON payload is treated as success. A response that is
        // neither parseable nor explicitly flagged is the ERROR case.
        if extract_json_block(text).is_some() {
            ResponseStatus::Success
        } else {
            ResponseStatus::Error
        }
    }
}

/// Parse raw agent text into a `RawResponse` envelope. Never fails: an
/// unparseable response becomes `ResponseStatus::Error` with the raw text
/// preserved as the message, so the caller always gets a `Result`.
pub fn parse_envelope(text: &str) -> RawResponse {
    let status = infer_status_from_text(text);
    let raw_payload = extract_json_block(text).unwrap_or(text).to_string();
    RawResponse {
        status,
        message: text.to_string(),
        raw_payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_json() {
        let text = "Here is my answer:\n```json\n{\"a\": 1}\n```\nThanks";
        assert_eq!(extract_json_block(text), Some("{\"a\": 1}"));
    }

    #[test]
    fn extracts_bare_braces() {
        let text = "prefix {\"a\": 1} suffix";
        assert_eq!(extract_json_block(text), Some("{\"a\": 1}"));
    }

    #[test]
    fn infers_success_when_json_present_without_discriminant() {
        let envelope = parse_envelope("{\"ok\": true}");
        assert_eq!(envelope.status, ResponseStatus::Success);
    }

    #[test]
    fn infers_explicit_failed_status() {
        let envelope = parse_envelope("{\"status\": \"FAILED\", \"reason\": \"blocked\"}");
        assert_eq!(envelope.status, ResponseStatus::Failed);
    }

    #[test]
    fn unparseable_text_is_error() {
        let envelope = parse_envelope("I could not complete this task.");
        assert_eq!(envelope.status, ResponseStatus::Error);
    }
}
