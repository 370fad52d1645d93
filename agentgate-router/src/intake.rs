//! Request intake normalization.
//!
//! Transports see tool names in whatever shape the client SDK produced;
//! policies are keyed on the canonical lower-case dot-separated form.
//! Identity travels as request metadata and is copied field-wise into the
//! engine's [`AgentContext`]; the engine trusts the transport to have
//! authenticated the caller.

use agentgate_core::AgentContext;
use serde::{Deserialize, Serialize};

/// Identity and context fields carried on each request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Agent class (e.g. `coding-assistant`).
    pub agent_type: String,
    /// Sandbox the agent runs in.
    #[serde(default)]
    pub sandbox_id: String,
    /// Tenant / organization identifier.
    #[serde(default)]
    pub tenant_id: String,
    /// Session identifier.
    #[serde(default)]
    pub session_id: String,
    /// Multi-tenant sandboxing label.
    #[serde(default)]
    pub mts_label: String,
    /// Optional policy name override.
    #[serde(default)]
    pub policy_ref: String,
}

impl RequestMetadata {
    /// Build the engine-facing identity by field-wise copy.
    pub fn agent_context(&self) -> AgentContext {
        AgentContext {
            agent_type: self.agent_type.clone(),
            sandbox_id: self.sandbox_id.clone(),
            tenant_id: self.tenant_id.clone(),
            session_id: self.session_id.clone(),
            mts_label: self.mts_label.clone(),
            policy_ref: self.policy_ref.clone(),
        }
    }
}

/// Normalize a raw tool name to `category.action` form.
///
/// Exactly one rewrite applies, in order:
///
/// - Names already containing `.` are just lower-cased.
/// - Otherwise, camel-cased names are split on upper-case boundaries
///   (`FileRead` becomes `file.read`).
/// - Otherwise, `_` is replaced with `.` (`file_read` becomes
///   `file.read`).
///
/// An empty input stays empty; the caller treats that as an intake
/// error.
pub fn canonical_tool_name(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }

    if raw.contains('.') {
        return raw.to_lowercase();
    }

    if raw.chars().any(|c| c.is_ascii_uppercase()) {
        let mut split = String::with_capacity(raw.len() + 4);
        for (i, ch) in raw.chars().enumerate() {
            if i > 0 && ch.is_ascii_uppercase() {
                split.push('.');
            }
            split.push(ch);
        }
        return split.to_lowercase();
    }

    raw.replace('_', ".").to_lowercase()
}
