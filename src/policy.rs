//! Policy Engine: a pure, total function from `(ToolSpec, input, context)` to
//! a [`PolicyDecision`], evaluated against a frozen [`PolicyConfig`].
//!
//! No I/O, no mutation of the caller's input — every decision returns a
//! sanitized copy. Branching is mode-first, then tool-specific by name
//! prefix, matching the decision procedure in the gateway's source spec.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::registry::ToolSpec;

/// The three-way verdict a policy evaluation can reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
    RequireApproval,
}

/// Result of evaluating policy against one `(spec, input, context)` triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub decision: Decision,
    pub sanitized_input: Value,
    pub reason: Option<String>,
    pub details: Value,
}

impl PolicyDecision {
    fn allow(input: Value) -> Self {
        Self {
            decision: Decision::Allow,
            sanitized_input: input,
            reason: None,
            details: Value::Null,
        }
    }

    fn allow_with_reason(input: Value, reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Allow,
            sanitized_input: input,
            reason: Some(reason.into()),
            details: Value::Null,
        }
    }

    fn deny(input: Value, reason: impl Into<String>, details: Value) -> Self {
        Self {
            decision: Decision::Deny,
            sanitized_input: input,
            reason: Some(reason.into()),
            details,
        }
    }

    fn require_approval(input: Value, reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::RequireApproval,
            sanitized_input: input,
            reason: Some(reason.into()),
            details: Value::Null,
        }
    }
}

/// GitHub pull-request policy, configured when `tools.github.pr` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubPolicy {
    #[serde(default)]
    pub allowed_repos: Vec<String>,
    #[serde(default)]
    pub draft_only: bool,
    #[serde(default)]
    pub allow_merge: bool,
    #[serde(default)]
    pub allow_push_to_main: bool,
}

/// Sonos policy, configured when `tools.sonos` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SonosPolicy {
    #[serde(default)]
    pub allowed_rooms: Vec<String>,
    pub max_volume: i64,
    #[serde(default)]
    pub quiet_hours_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    pub default_mode: String,
    #[serde(default)]
    pub approvals_required_for: Vec<String>,
}

/// Frozen configuration the Policy Engine evaluates against.
///
/// Constructed once at startup (typically from YAML via [`crate::config`])
/// and held behind a shared reference for the life of the Gateway;
/// hot-reload is out of scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub timezone: String,
    pub execution: ExecutionPolicy,
    pub github: Option<GithubPolicy>,
    pub sonos: Option<SonosPolicy>,
}

/// Evaluates `(spec, input, context)` against a [`PolicyConfig`].
///
/// Stateless by construction — holds nothing but serves as a namespace for
/// the decision procedure so call sites read `PolicyEngine::evaluate(...)`
/// the way they'd call any other gateway subsystem.
pub struct PolicyEngine;

impl PolicyEngine {
    /// Pure, total decision function. Equal inputs always yield equal
    /// decisions; `input` is never mutated, only copied into the result.
    pub fn evaluate(
        spec: &ToolSpec,
        input: &Value,
        context: &HashMap<String, Value>,
        config: &PolicyConfig,
    ) -> PolicyDecision {
        let _ = context; // no context-dependent branch in the baseline rule set
        let decision = match spec.mode.as_str() {
            "read_only" => PolicyDecision::allow(input.clone()),
            "draft" => {
                if spec.name.starts_with("github.pr.") {
                    Self::eval_github_pr(input, config)
                } else {
                    PolicyDecision::allow(input.clone())
                }
            }
            "execute_gated" => {
                if spec.name.starts_with("sonos.") {
                    Self::eval_sonos(input, config)
                } else {
                    PolicyDecision::require_approval(
                        input.clone(),
                        "execute_gated tool requires approval",
                    )
                }
            }
            other => PolicyDecision::deny(
                input.clone(),
                format!("Unknown tool mode '{other}'"),
                Value::Null,
            ),
        };

        debug!(
            tool = %spec.name,
            mode = %spec.mode,
            decision = ?decision.decision,
            "policy evaluated"
        );
        decision
    }

    fn eval_github_pr(input: &Value, config: &PolicyConfig) -> PolicyDecision {
        let Some(github) = &config.github else {
            return PolicyDecision::deny(input.clone(), "GitHub policy not configured", Value::Null);
        };

        let repo = input.get("repo").and_then(Value::as_str);
        match repo {
            Some(repo) if !github.allowed_repos.iter().any(|r| r == repo) => {
                return PolicyDecision::deny(
                    input.clone(),
                    "Repository is not in the allowlist",
                    serde_json::json!({ "repo": repo, "allowed_repos": github.allowed_repos }),
                );
            }
            _ => {}
        }

        if github.draft_only {
            let already_draft = input.get("draft").and_then(Value::as_bool).unwrap_or(false);
            if !already_draft {
                let mut sanitized = input.clone();
                if let Value::Object(map) = &mut sanitized {
                    map.insert("draft".to_string(), Value::Bool(true));
                }
                return PolicyDecision::allow_with_reason(sanitized, "Enforced draft-only PR creation");
            }
        }

        PolicyDecision::allow(input.clone())
    }

    fn eval_sonos(input: &Value, config: &PolicyConfig) -> PolicyDecision {
        let Some(sonos) = &config.sonos else {
            return PolicyDecision::deny(input.clone(), "Sonos policy not configured", Value::Null);
        };

        if let Some(room) = input.get("room").and_then(Value::as_str) {
            if !sonos.allowed_rooms.iter().any(|r| r == room) {
                return PolicyDecision::deny(
                    input.clone(),
                    "Room is not in the allowlist",
                    serde_json::json!({ "room": room, "allowed_rooms": sonos.allowed_rooms }),
                );
            }
        }

        if let Some(volume_field) = input.get("volume") {
            let volume = match coerce_to_i64(volume_field) {
                Some(v) => v,
                None => {
                    return PolicyDecision::deny(input.clone(), "Invalid volume type", Value::Null);
                }
            };

            if volume > sonos.max_volume {
                let mut sanitized = input.clone();
                if let Value::Object(map) = &mut sanitized {
                    map.insert(
                        "volume".to_string(),
                        Value::Number(sonos.max_volume.into()),
                    );
                }
                return PolicyDecision::require_approval(
                    sanitized,
                    "Requested volume exceeds cap; capped and requires approval",
                );
            }
        }

        PolicyDecision::require_approval(input.clone(), "Sonos actions require approval")
    }
}

fn coerce_to_i64(value: &Value) -> Option<i64> {
    match value {
        // int(sanitized["volume"]) in the original truncates a float
        // (30.7 -> 30) rather than rejecting it; as_f64() fallback matches.
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, mode: &str) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            mode: mode.to_string(),
            handler: "test:handler".to_string(),
            description: None,
            input_schema: serde_json::json!({"type": "object"}),
            output_schema: None,
        }
    }

    fn sonos_config() -> PolicyConfig {
        PolicyConfig {
            timezone: "America/Chicago".to_string(),
            execution: ExecutionPolicy {
                default_mode: "read_only".to_string(),
                approvals_required_for: vec!["execute_gated".to_string()],
            },
            github: None,
            sonos: Some(SonosPolicy {
                allowed_rooms: vec!["Kitchen".to_string()],
                max_volume: 40,
                quiet_hours_enabled: false,
            }),
        }
    }

    #[test]
    fn read_only_always_allows_unchanged_input() {
        let s = spec("calendar.google.get_agenda", "read_only");
        let input = serde_json::json!({"time_min": "x"});
        let decision = PolicyEngine::evaluate(&s, &input, &HashMap::new(), &sonos_config());
        assert_eq!(decision.decision, Decision::Allow);
        assert_eq!(decision.sanitized_input, input);
    }

    #[test]
    fn unknown_mode_denies() {
        let s = spec("some.tool", "bogus");
        let input = serde_json::json!({});
        let decision = PolicyEngine::evaluate(&s, &input, &HashMap::new(), &sonos_config());
        assert_eq!(decision.decision, Decision::Deny);
        assert_eq!(decision.reason.as_deref(), Some("Unknown tool mode 'bogus'"));
    }

    #[test]
    fn sonos_under_cap_requires_approval() {
        let s = spec("sonos.play", "execute_gated");
        let input = serde_json::json!({"room": "Kitchen", "volume": 30});
        let decision = PolicyEngine::evaluate(&s, &input, &HashMap::new(), &sonos_config());
        assert_eq!(decision.decision, Decision::RequireApproval);
        assert_eq!(decision.sanitized_input["volume"], 30);
    }

    #[test]
    fn sonos_over_cap_is_clamped_and_requires_approval() {
        let s = spec("sonos.play", "execute_gated");
        let input = serde_json::json!({"room": "Kitchen", "volume": 80});
        let decision = PolicyEngine::evaluate(&s, &input, &HashMap::new(), &sonos_config());
        assert_eq!(decision.decision, Decision::RequireApproval);
        assert_eq!(decision.sanitized_input["volume"], 40);
        assert!(decision.reason.unwrap().contains("capped"));
        // original input untouched
        assert_eq!(input["volume"], 80);
    }

    #[test]
    fn sonos_room_not_allowlisted_denies_with_details() {
        let s = spec("sonos.play", "execute_gated");
        let input = serde_json::json!({"room": "Garage", "volume": 20});
        let decision = PolicyEngine::evaluate(&s, &input, &HashMap::new(), &sonos_config());
        assert_eq!(decision.decision, Decision::Deny);
        assert_eq!(decision.details["allowed_rooms"], serde_json::json!(["Kitchen"]));
    }

    #[test]
    fn github_pr_enforces_draft_only() {
        let mut config = sonos_config();
        config.github = Some(GithubPolicy {
            allowed_repos: vec!["acme/widgets".to_string()],
            draft_only: true,
            allow_merge: false,
            allow_push_to_main: false,
        });
        let s = spec("github.pr.create", "draft");
        let input = serde_json::json!({"repo": "acme/widgets", "draft": false});
        let decision = PolicyEngine::evaluate(&s, &input, &HashMap::new(), &config);
        assert_eq!(decision.decision, Decision::Allow);
        assert_eq!(decision.sanitized_input["draft"], true);
    }

    #[test]
    fn policy_evaluation_is_pure_and_idempotent_on_sanitized_input() {
        let mut config = sonos_config();
        config.github = Some(GithubPolicy {
            allowed_repos: vec!["acme/widgets".to_string()],
            draft_only: true,
            allow_merge: false,
            allow_push_to_main: false,
        });
        let s = spec("github.pr.create", "draft");
        let input = serde_json::json!({"repo": "acme/widgets", "draft": false});
        let first = PolicyEngine::evaluate(&s, &input, &HashMap::new(), &config);
        let second = PolicyEngine::evaluate(&s, &first.sanitized_input, &HashMap::new(), &config);
        assert_eq!(first.sanitized_input, second.sanitized_input);
    }
}
