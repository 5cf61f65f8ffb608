//! Loads the on-disk YAML policy configuration into a frozen [`PolicyConfig`].
//!
//! The wire shape (`tools.github.pr`, `tools.sonos.quiet_hours.enabled`, ...)
//! is nested the way an operator would hand-author it; [`PolicyConfig`]
//! itself is flattened for the Policy Engine's convenience. This module is
//! the only place that knows about the nesting.

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::policy::{ExecutionPolicy, GithubPolicy, PolicyConfig, SonosPolicy};

#[derive(Debug, Deserialize)]
struct RawConfig {
    timezone: String,
    execution: ExecutionPolicy,
    #[serde(default)]
    tools: RawTools,
}

#[derive(Debug, Default, Deserialize)]
struct RawTools {
    #[serde(rename = "github.pr")]
    github_pr: Option<RawGithub>,
    sonos: Option<RawSonos>,
}

#[derive(Debug, Deserialize)]
struct RawGithub {
    #[serde(default)]
    allowed_repos: Vec<String>,
    #[serde(default)]
    pr_rules: RawPrRules,
}

#[derive(Debug, Default, Deserialize)]
struct RawPrRules {
    #[serde(default)]
    draft_only: bool,
    #[serde(default)]
    allow_merge: bool,
    #[serde(default)]
    allow_push_to_main: bool,
}

#[derive(Debug, Deserialize)]
struct RawSonos {
    #[serde(default)]
    allowed_rooms: Vec<String>,
    max_volume: i64,
    #[serde(default)]
    quiet_hours: RawQuietHours,
}

#[derive(Debug, Default, Deserialize)]
struct RawQuietHours {
    #[serde(default)]
    enabled: bool,
}

/// Read and parse a policy configuration YAML file.
///
/// Omitted `tools.github.pr` / `tools.sonos` sections yield `None` policy
/// objects, which the Policy Engine's deny branches handle explicitly.
pub fn load_policy_config(path: impl AsRef<std::path::Path>) -> Result<PolicyConfig> {
    let raw_text = std::fs::read_to_string(path.as_ref())
        .map_err(|e| Error::Config(format!("{}: {e}", path.as_ref().display())))?;
    parse_policy_config(&raw_text)
}

fn parse_policy_config(raw_text: &str) -> Result<PolicyConfig> {
    let raw: RawConfig =
        serde_yaml::from_str(raw_text).map_err(|e| Error::Config(format!("invalid policy config: {e}")))?;

    Ok(PolicyConfig {
        timezone: raw.timezone,
        execution: raw.execution,
        github: raw.tools.github_pr.map(|g| GithubPolicy {
            allowed_repos: g.allowed_repos,
            draft_only: g.pr_rules.draft_only,
            allow_merge: g.pr_rules.allow_merge,
            allow_push_to_main: g.pr_rules.allow_push_to_main,
        }),
        sonos: raw.tools.sonos.map(|s| SonosPolicy {
            allowed_rooms: s.allowed_rooms,
            max_volume: s.max_volume,
            quiet_hours_enabled: s.quiet_hours.enabled,
        }),
    })
}
