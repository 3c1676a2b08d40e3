// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use regex::Regex;

use maestro_config::ToolsConfig;
use maestro_model::User;

/// Outcome of an access check.  A denial never throws; it materializes as a
/// deny tool result so the loop continues with the remaining calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    Deny(String),
}

/// Policy engine mapping `(user, serverId, toolName)` to a decision.
/// Admins bypass every rule.
#[derive(Debug)]
pub struct ToolAccessPolicy {
    deny_patterns: Vec<Regex>,
    restricted: Vec<(Regex, Vec<String>)>,
}

impl ToolAccessPolicy {
    pub fn from_config(cfg: &ToolsConfig) -> Self {
        let compile = |patterns: &[String]| -> Vec<Regex> {
            patterns.iter().filter_map(|p| glob_to_regex(p)).collect()
        };
        Self {
            deny_patterns: compile(&cfg.deny_tools),
            restricted: cfg
                .restricted_tools
                .iter()
                .filter_map(|r| glob_to_regex(&r.pattern).map(|re| (re, r.groups.clone())))
                .collect(),
        }
    }

    /// Policy with no rules: everything is allowed.
    pub fn permissive() -> Self {
        Self {
            deny_patterns: Vec::new(),
            restricted: Vec::new(),
        }
    }

    pub fn check(&self, user: &User, server_id: &str, tool_name: &str) -> AccessDecision {
        if user.is_admin {
            return AccessDecision::Allow;
        }
        let subject = format!("{server_id}/{tool_name}");

        for re in &self.deny_patterns {
            if re.is_match(&subject) {
                return AccessDecision::Deny(format!("tool {subject} is disabled by policy"));
            }
        }
        for (re, groups) in &self.restricted {
            if re.is_match(&subject) && !groups.iter().any(|g| user.groups.contains(g)) {
                return AccessDecision::Deny(format!(
                    "tool {subject} requires membership in one of: {}",
                    groups.join(", ")
                ));
            }
        }
        AccessDecision::Allow
    }
}

/// Convert a simple shell glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => {
                for esc in regex::escape(&c.to_string()).chars() {
                    re.push(esc);
                }
            }
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
