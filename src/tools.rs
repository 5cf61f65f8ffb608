//! Example tool handlers bundled with the gateway: a read-only stub
//! (calendar), a no-op echo, and the two tools the Policy Engine
//! special-cases (`github.pr.*`, `sonos.*`). These both exercise the
//! gateway end to end and back the boundary scenarios in the source spec's
//! testable-properties section.
//!
//! Real deployments register their own [`crate::registry::ToolHandler`]
//! implementations the same way — there is nothing privileged about these.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ToolError;
use crate::gateway::Context;
use crate::registry::ToolHandler;

/// `calendar.google.get_agenda` — read_only. Not wired to a real calendar
/// backend; returns an empty agenda with a warning, same as the original
/// stub it is grounded on.
pub struct CalendarGetAgenda;

#[async_trait]
impl ToolHandler for CalendarGetAgenda {
    async fn call(&self, _input: Value, _context: &Context) -> std::result::Result<Value, ToolError> {
        Ok(serde_json::json!({
            "events": [],
            "warnings": [
                { "type": "other", "message": "Stub: calendar tool not implemented yet", "event_ids": [] }
            ],
            "meta": { "source": "google_calendar", "fetched_at": "1970-01-01T00:00:00Z" }
        }))
    }
}

/// `noop.echo` — read_only. Returns its sanitized input wrapped under
/// `echo`. Useful as a fixture tool with no side effects.
pub struct NoopEcho;

#[async_trait]
impl ToolHandler for NoopEcho {
    async fn call(&self, input: Value, _context: &Context) -> std::result::Result<Value, ToolError> {
        Ok(serde_json::json!({ "echo": input }))
    }
}

/// `github.pr.create` — draft. Stub that fabricates a PR number; a real
/// implementation would call the GitHub REST/GraphQL API.
pub struct GithubPrCreate;

#[async_trait]
impl ToolHandler for GithubPrCreate {
    async fn call(&self, input: Value, _context: &Context) -> std::result::Result<Value, ToolError> {
        let repo = input
            .get("repo")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::new("INVALID_INPUT", "missing 'repo'"))?;
        let draft = input.get("draft").and_then(Value::as_bool).unwrap_or(true);
        Ok(serde_json::json!({
            "pr_number": 1,
            "url": format!("https://github.com/{repo}/pull/1"),
            "draft": draft,
        }))
    }
}

/// `sonos.play` — execute_gated. Stub that reports the room now "playing"
/// at the (already policy-sanitized) requested volume.
pub struct SonosPlay;

#[async_trait]
impl ToolHandler for SonosPlay {
    async fn call(&self, input: Value, _context: &Context) -> std::result::Result<Value, ToolError> {
        let room = input
            .get("room")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::new("INVALID_INPUT", "missing 'room'"))?;
        let mut out = serde_json::json!({ "room": room, "playing": true });
        if let Some(volume) = input.get("volume") {
            out["volume"] = volume.clone();
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn calendar_stub_returns_empty_agenda_with_warning() {
        let out = CalendarGetAgenda.call(Value::Null, &HashMap::new()).await.unwrap();
        assert_eq!(out["events"], serde_json::json!([]));
        assert_eq!(out["warnings"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sonos_play_echoes_room_and_volume() {
        let input = serde_json::json!({"room": "Kitchen", "volume": 40});
        let out = SonosPlay.call(input, &HashMap::new()).await.unwrap();
        assert_eq!(out["room"], "Kitchen");
        assert_eq!(out["volume"], 40);
        assert_eq!(out["playing"], true);
    }

    #[tokio::test]
    async fn github_pr_create_defaults_to_draft() {
        let input = serde_json::json!({"repo": "acme/widgets", "title": "Fix bug"});
        let out = GithubPrCreate.call(input, &HashMap::new()).await.unwrap();
        assert_eq!(out["draft"], true);
        assert!(out["url"].as_str().unwrap().contains("acme/widgets"));
    }
}
