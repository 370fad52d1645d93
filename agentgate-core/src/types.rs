//! Shared policy model types.
//!
//! These are the wire-facing shapes exchanged between the compiler, the
//! decision engine, the audit pipeline and the router integration. A
//! [`CompiledPolicy`] is immutable once published; the engine shares it as
//! an `Arc` so that readers never observe a torn policy.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::code::CodeModule;
use crate::mts::MtsLabel;

// ─────────────────────────────────────────────────────────────────────────────
// Decision & Enforcement Mode
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// The tool call may proceed.
    Allow,
    /// The tool call must not proceed (in enforcing mode).
    Deny,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "ALLOW"),
            Self::Deny => write!(f, "DENY"),
        }
    }
}

/// How policy decisions are applied.
///
/// Permissive mode maps a `Deny` back to `Allow` on return so that new
/// policies can be rolled out observe-only; the underlying decision is
/// still cached and audited as `Deny`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    /// Log denials but return Allow (safe rollout default).
    #[default]
    Permissive,
    /// Return the computed decision verbatim.
    Enforcing,
}

impl fmt::Display for EnforcementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Permissive => write!(f, "permissive"),
            Self::Enforcing => write!(f, "enforcing"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Permissions
// ─────────────────────────────────────────────────────────────────────────────

/// Conditional access rules attached to an allow permission.
///
/// Every field is optional; a constraint whose request field is absent is
/// non-binding on the table path (the engine only checks what the caller
/// provided). All present constraints must hold together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolConstraints {
    /// Glob patterns for file operations. A pattern ending in `/**`
    /// matches the directory itself and anything under it; other patterns
    /// match by shell glob on the full path.
    pub path_patterns: Vec<String>,
    /// Domain match-list for network operations. `*.x.y` matches strict
    /// sub-domains of `x.y`, `*` matches everything, anything else is a
    /// literal.
    pub allowed_domains: Vec<String>,
    /// Domains that are always blocked. Checked after `allowed_domains`
    /// and wins when both match.
    pub denied_domains: Vec<String>,
    /// Permitted ports for network operations.
    pub allowed_ports: Vec<u16>,
    /// Upper bound on a `size` request parameter.
    pub max_size_bytes: Option<u64>,
    /// Advisory execution timeout. Recorded, not enforced by the engine.
    pub timeout: Option<Duration>,
}

impl ToolConstraints {
    /// True when at least one constraint is set.
    pub fn is_constraining(&self) -> bool {
        !self.path_patterns.is_empty()
            || !self.allowed_domains.is_empty()
            || !self.denied_domains.is_empty()
            || !self.allowed_ports.is_empty()
            || self.max_size_bytes.is_some()
    }
}

/// Access rule for a single tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPermission {
    /// Lower-case dot-separated tool name (e.g. `file.read`).
    pub tool: String,
    /// Allow or Deny for this tool.
    pub action: Decision,
    /// Optional conditions. Only meaningful when `action` is Allow.
    pub constraints: Option<ToolConstraints>,
}

impl ToolPermission {
    /// Unconditional permission for a tool.
    pub fn new(tool: impl Into<String>, action: Decision) -> Self {
        Self {
            tool: tool.into(),
            action,
            constraints: None,
        }
    }

    /// Allow permission with constraints.
    pub fn allow_with(tool: impl Into<String>, constraints: ToolConstraints) -> Self {
        Self {
            tool: tool.into(),
            action: Decision::Allow,
            constraints: Some(constraints),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Compiled Policy
// ─────────────────────────────────────────────────────────────────────────────

/// How the tenant-isolation label is enforced by the policy-as-code
/// backend. The table backend never checks labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MtsEnforce {
    /// Require an exact label match between agent and policy.
    #[default]
    Strict,
    /// Label mismatches pass (observe-only).
    Permissive,
    /// No label checking.
    Disabled,
}

/// A pre-processed policy, ready for evaluation.
///
/// Produced by the compiler, published atomically into the engine keyed by
/// each of its `agent_types`, replaced wholesale on updates.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    /// Stable policy identifier.
    pub name: String,
    /// Agent types this policy is responsible for. Never empty.
    pub agent_types: Vec<String>,
    /// Decision for tools not listed in `tool_table`.
    pub default_action: Decision,
    /// Tool name to permission, unique keys, O(1) lookup.
    pub tool_table: HashMap<String, ToolPermission>,
    /// Policy-level enforcement mode.
    pub mode: EnforcementMode,
    /// Tenant-isolation label, if the policy binds to one.
    pub mts_label: Option<MtsLabel>,
    /// How the label is enforced by the code backend.
    pub mts_enforce: MtsEnforce,
    /// When this policy was compiled.
    pub compiled_at: DateTime<Utc>,
    /// Prepared policy-as-code module, present only when code evaluation
    /// was requested for this policy.
    pub code_module: Option<CodeModule>,
}

impl CompiledPolicy {
    /// True when the engine may dispatch this policy to the code backend.
    pub fn has_code_module(&self) -> bool {
        self.code_module.is_some()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Agent Identity & Audit Events
// ─────────────────────────────────────────────────────────────────────────────

/// Identity of the agent making a request.
///
/// Asserted by the calling transport; the engine does not authenticate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    /// Agent class (e.g. `coding-assistant`). Policies key on this.
    pub agent_type: String,
    /// Sandbox the agent runs in.
    pub sandbox_id: String,
    /// Tenant / organization identifier.
    pub tenant_id: String,
    /// Session identifier.
    pub session_id: String,
    /// Multi-tenant sandboxing label, canonical string form.
    pub mts_label: String,
    /// Name of the policy being applied (optional override).
    pub policy_ref: String,
}

/// A single policy decision, recorded for compliance.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// When the decision was made.
    pub timestamp: DateTime<Utc>,
    /// Who asked.
    pub agent: AgentContext,
    /// Which tool was requested.
    pub tool: String,
    /// The underlying decision. In permissive mode this may differ from
    /// what the caller was told.
    pub decision: Decision,
    /// Short human-readable reason from the fixed taxonomy.
    pub reason: String,
    /// Correlation id for this request.
    pub request_id: String,
    /// Whether the decision was served from the cache.
    pub cached: bool,
}
