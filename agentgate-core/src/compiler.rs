//! Policy compilation.
//!
//! Turns a declarative policy spec into the immutable [`CompiledPolicy`]
//! the engine evaluates: enum strings are normalized, tool names are
//! validated, the tool table is built (later duplicates overwrite earlier
//! ones, matching schema-merge behaviour), the tenant label is parsed, and
//! optionally a policy-as-code module is generated and prepared.
//!
//! Compilation is the only place errors surface; once a policy compiles,
//! evaluation never fails, it only denies.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::code::{self, CodeModule};
use crate::error::CompileError;
use crate::mts::MtsLabel;
use crate::types::{
    CompiledPolicy, Decision, EnforcementMode, MtsEnforce, ToolConstraints, ToolPermission,
};

// ─────────────────────────────────────────────────────────────────────────────
// Declarative Spec
// ─────────────────────────────────────────────────────────────────────────────

/// The declarative policy shape handed over by the policy controller.
///
/// The controller watches declarative resources, converts them into this
/// spec, and calls [`compile_spec`] followed by `Engine::load_policy` for
/// every agent type; on deletion it calls `Engine::remove_policy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySpec {
    pub name: String,
    pub agent_types: Vec<String>,
    /// `"allow"` or `"deny"`.
    pub default_action: String,
    /// `"permissive"` or `"enforcing"`. Defaults to permissive.
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub tool_permissions: Vec<ToolPermissionSpec>,
    #[serde(default)]
    pub tenant_isolation: Option<TenantIsolationSpec>,
}

/// One tool rule in the declarative spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPermissionSpec {
    pub tool: String,
    /// `"allow"` or `"deny"`.
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<ConstraintSpec>,
}

/// Declarative constraint block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConstraintSpec {
    #[serde(default)]
    pub path_patterns: Vec<String>,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub denied_domains: Vec<String>,
    #[serde(default)]
    pub allowed_ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Declarative tenant-isolation block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantIsolationSpec {
    #[serde(default)]
    pub mts_label: String,
    /// `"strict"`, `"permissive"` or `"disabled"`. Defaults to strict.
    #[serde(default)]
    pub enforce_mode: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Compilation
// ─────────────────────────────────────────────────────────────────────────────

/// Compile a policy for table evaluation.
pub fn compile(
    name: &str,
    agent_types: Vec<String>,
    default_action: Decision,
    permissions: Vec<ToolPermission>,
    mode: EnforcementMode,
    mts_label: &str,
) -> Result<CompiledPolicy, CompileError> {
    if agent_types.is_empty() {
        return Err(CompileError::NoAgentTypes {
            policy: name.to_string(),
        });
    }

    let mut tool_table: HashMap<String, ToolPermission> =
        HashMap::with_capacity(permissions.len());
    for permission in permissions {
        if !is_valid_tool_name(&permission.tool) {
            return Err(CompileError::InvalidToolName {
                tool: permission.tool,
            });
        }
        // Later entries overwrite earlier ones.
        tool_table.insert(permission.tool.clone(), permission);
    }

    let mts_label = parse_label(mts_label)?;

    Ok(CompiledPolicy {
        name: name.to_string(),
        agent_types,
        default_action,
        tool_table,
        mode,
        mts_label,
        mts_enforce: MtsEnforce::default(),
        compiled_at: Utc::now(),
        code_module: None,
    })
}

/// Compile a policy and attach a generated, prepared policy-as-code
/// module.
///
/// Preparation is the expensive step and is paid here, once per policy
/// version, never on the request path.
pub fn compile_as_code(
    name: &str,
    agent_types: Vec<String>,
    default_action: Decision,
    permissions: Vec<ToolPermission>,
    mode: EnforcementMode,
    mts_label: &str,
) -> Result<CompiledPolicy, CompileError> {
    let mut policy = compile(name, agent_types, default_action, permissions, mode, mts_label)?;
    let source = code::generate_module(&policy)?;
    policy.code_module = Some(CodeModule::prepare(&source)?);
    debug!(policy = name, module_bytes = source.len(), "prepared policy module");
    Ok(policy)
}

/// Compile a policy with a caller-authored module text.
///
/// Fails when the policy-as-code backend rejects the text.
pub fn compile_with_code(
    name: &str,
    agent_types: Vec<String>,
    default_action: Decision,
    permissions: Vec<ToolPermission>,
    mode: EnforcementMode,
    mts_label: &str,
    module_text: &str,
) -> Result<CompiledPolicy, CompileError> {
    let mut policy = compile(name, agent_types, default_action, permissions, mode, mts_label)?;
    policy.code_module = Some(CodeModule::prepare(module_text)?);
    Ok(policy)
}

/// Compile a declarative [`PolicySpec`].
pub fn compile_spec(spec: &PolicySpec, policy_as_code: bool) -> Result<CompiledPolicy, CompileError> {
    let default_action = parse_action(&spec.default_action)?;
    let mode = match spec.mode.as_deref() {
        Some(mode) => parse_mode(mode)?,
        None => EnforcementMode::default(),
    };

    let permissions = spec
        .tool_permissions
        .iter()
        .map(|p| {
            Ok(ToolPermission {
                tool: p.tool.clone(),
                action: parse_action(&p.action)?,
                constraints: p.constraints.as_ref().map(constraints_from_spec),
            })
        })
        .collect::<Result<Vec<_>, CompileError>>()?;

    let (label, enforce) = match &spec.tenant_isolation {
        Some(isolation) => {
            let enforce = match isolation.enforce_mode.as_deref() {
                None | Some("strict") => MtsEnforce::Strict,
                Some("permissive") => MtsEnforce::Permissive,
                Some("disabled") => MtsEnforce::Disabled,
                Some(other) => {
                    return Err(CompileError::UnknownMtsEnforce {
                        value: other.to_string(),
                    });
                }
            };
            (isolation.mts_label.as_str(), enforce)
        }
        None => ("", MtsEnforce::Strict),
    };

    let mut policy = compile(
        &spec.name,
        spec.agent_types.clone(),
        default_action,
        permissions,
        mode,
        label,
    )?;
    // The enforce mode must be in place before generation; it decides
    // whether the module gets a tenant-isolation rule.
    policy.mts_enforce = enforce;
    if policy_as_code {
        let source = code::generate_module(&policy)?;
        policy.code_module = Some(CodeModule::prepare(&source)?);
    }
    Ok(policy)
}

/// Validate a tool name: lower-case dot-separated segments, each starting
/// with a letter (`category.action`, e.g. `file.read`).
pub fn is_valid_tool_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) if first.is_ascii_lowercase() => {
                    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
                }
                _ => false,
            }
        })
}

/// Normalize a declarative action string.
pub fn parse_action(value: &str) -> Result<Decision, CompileError> {
    match value {
        "allow" => Ok(Decision::Allow),
        "deny" => Ok(Decision::Deny),
        other => Err(CompileError::UnknownAction {
            value: other.to_string(),
        }),
    }
}

/// Normalize a declarative enforcement-mode string.
pub fn parse_mode(value: &str) -> Result<EnforcementMode, CompileError> {
    match value {
        "permissive" => Ok(EnforcementMode::Permissive),
        "enforcing" => Ok(EnforcementMode::Enforcing),
        other => Err(CompileError::UnknownMode {
            value: other.to_string(),
        }),
    }
}

fn parse_label(label: &str) -> Result<Option<MtsLabel>, CompileError> {
    if label.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(label.parse::<MtsLabel>()?))
}

fn constraints_from_spec(spec: &ConstraintSpec) -> ToolConstraints {
    ToolConstraints {
        path_patterns: spec.path_patterns.clone(),
        allowed_domains: spec.allowed_domains.clone(),
        denied_domains: spec.denied_domains.clone(),
        allowed_ports: spec.allowed_ports.clone(),
        max_size_bytes: spec.max_size_bytes,
        timeout: spec.timeout_secs.map(Duration::from_secs),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
