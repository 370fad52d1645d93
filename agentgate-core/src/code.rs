//! Policy-as-code backend.
//!
//! The table backend covers the declarative schema; this backend exists
//! for everything the table cannot express. Compiled policies are
//! translated into a Cedar module, parsed once per policy version (the
//! expensive step, paid at load time), and evaluated with a structured
//! request context on every cache miss.
//!
//! ```text
//! declarative spec ──► Cedar module ──► prepared PolicySet ──► evaluate
//!                      (generate)       (parse once)           (hot path)
//! ```
//!
//! ## Generated module shape
//!
//! - `default_action: allow` becomes an `@id("default-allow")` blanket
//!   permit; Cedar itself is deny-by-default, so default-deny needs no
//!   policy at all.
//! - Each allow permission becomes an `@id("allow:<tool>")` permit scoped
//!   to its tool, with every stated constraint conjoined in one `when`
//!   clause.
//! - Each deny permission becomes an `@id("deny:<tool>")` forbid. Forbid
//!   overrides permit, so the final decision is `allow AND NOT deny`.
//! - A policy bound to a tenant label under strict enforcement gains an
//!   `@id("mts")` forbid that fires on any label mismatch.
//!
//! A constraint reads its request field through a `has` guard, so a
//! request that omits a constrained field fails the permit. This is
//! stricter than the table backend, which treats an absent field as
//! non-binding.

use std::fmt;

use cedar_policy::{Authorizer, Context, Entities, EntityUid, PolicySet, Request};
use serde_json::{json, Map, Value};

use crate::error::CompileError;
use crate::types::{AgentContext, CompiledPolicy, Decision, MtsEnforce, ToolConstraints};

/// Policy id of the blanket default-allow permit.
const DEFAULT_ALLOW_ID: &str = "default-allow";

/// Policy id of the tenant-isolation forbid.
const MTS_POLICY_ID: &str = "mts";

// ─────────────────────────────────────────────────────────────────────────────
// Prepared Module
// ─────────────────────────────────────────────────────────────────────────────

/// A parsed, ready-to-evaluate policy module.
///
/// Preparation costs milliseconds and happens once per policy version;
/// evaluation is microseconds and happens on every cache miss.
#[derive(Clone)]
pub struct CodeModule {
    source: String,
    policies: PolicySet,
}

impl CodeModule {
    /// Parse module text. Fails when the backend rejects the text.
    pub fn prepare(source: &str) -> Result<Self, CompileError> {
        let policies = source
            .parse::<PolicySet>()
            .map_err(|e| CompileError::Module {
                reason: e.to_string(),
            })?;
        Ok(Self {
            source: source.to_string(),
            policies,
        })
    }

    /// The module text this module was prepared from (for inspection and
    /// audit).
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate a tool request against the module. Fail-closed: any
    /// failure to construct or run the query is a `Deny`.
    pub fn evaluate(
        &self,
        policy: &CompiledPolicy,
        agent: &AgentContext,
        tool: &str,
        request: &Map<String, Value>,
    ) -> (Decision, String) {
        let query = match build_query(policy, agent, tool, request) {
            Ok(query) => query,
            Err(err) => {
                return (Decision::Deny, format!("policy evaluation error: {err}"));
            }
        };

        let response = Authorizer::new().is_authorized(&query, &self.policies, &Entities::empty());
        let determining: Vec<String> = response
            .diagnostics()
            .reason()
            .map(ToString::to_string)
            .collect();

        match response.decision() {
            cedar_policy::Decision::Allow => {
                if determining.iter().any(|id| id != DEFAULT_ALLOW_ID) {
                    (Decision::Allow, "tool explicitly allowed by policy".to_string())
                } else {
                    (Decision::Allow, "allowed by default policy".to_string())
                }
            }
            cedar_policy::Decision::Deny => {
                if determining.iter().any(|id| id == MTS_POLICY_ID) {
                    (Decision::Deny, "MTS violation: tenant isolation".to_string())
                } else if !determining.is_empty() {
                    (Decision::Deny, "tool explicitly denied by policy".to_string())
                } else {
                    (Decision::Deny, "denied by default policy".to_string())
                }
            }
        }
    }
}

impl fmt::Debug for CodeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeModule")
            .field("source_len", &self.source.len())
            .field("policies", &self.policies.policies().count())
            .finish()
    }
}

/// Build the Cedar query for one evaluation.
///
/// Principal is the agent type, action is always `invoke`, resource is
/// the tool. The context mirrors the evaluation input contract:
/// `{ request: {...}, agent: {...}, policy: {...} }`.
fn build_query(
    policy: &CompiledPolicy,
    agent: &AgentContext,
    tool: &str,
    request: &Map<String, Value>,
) -> Result<Request, String> {
    let principal = parse_uid("Agent", &agent.agent_type)?;
    let action = parse_uid("Action", "invoke")?;
    let resource = parse_uid("Tool", tool)?;

    let context_json = json!({
        "request": Value::Object(request.clone()),
        "agent": {
            "type": agent.agent_type,
            "sandbox_id": agent.sandbox_id,
            "tenant_id": agent.tenant_id,
            "session_id": agent.session_id,
            "mts_label": agent.mts_label,
        },
        "policy": {
            "name": policy.name,
            "mts_label": policy
                .mts_label
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
        },
    });

    let context = Context::from_json_value(context_json, None).map_err(|e| e.to_string())?;
    Request::new(principal, action, resource, context, None).map_err(|e| e.to_string())
}

fn parse_uid(entity_type: &str, id: &str) -> Result<EntityUid, String> {
    format!("{entity_type}::\"{}\"", escape_string(id))
        .parse::<EntityUid>()
        .map_err(|e| e.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Module Generation
// ─────────────────────────────────────────────────────────────────────────────

/// Translate a compiled policy into Cedar module text.
///
/// Output is deterministic: permissions are emitted in tool-name order.
pub fn generate_module(policy: &CompiledPolicy) -> Result<String, CompileError> {
    let mut out = String::with_capacity(512);
    out.push_str(&format!(
        "// Generated from policy '{}'. Do not edit.\n",
        policy.name
    ));

    if policy.default_action == Decision::Allow {
        out.push_str(&format!(
            "\n@id(\"{DEFAULT_ALLOW_ID}\")\npermit(principal, action == Action::\"invoke\", resource);\n"
        ));
    }

    let mut tools: Vec<&String> = policy.tool_table.keys().collect();
    tools.sort();

    for tool in tools {
        let perm = &policy.tool_table[tool];
        match perm.action {
            Decision::Deny => {
                out.push_str(&format!(
                    "\n@id(\"deny:{tool}\")\nforbid(principal, action == Action::\"invoke\", resource == Tool::\"{}\");\n",
                    escape_string(tool)
                ));
            }
            Decision::Allow => {
                let conditions = match &perm.constraints {
                    Some(c) if c.is_constraining() => constraint_conditions(c)?,
                    _ => Vec::new(),
                };
                out.push_str(&format!(
                    "\n@id(\"allow:{tool}\")\npermit(principal, action == Action::\"invoke\", resource == Tool::\"{}\")",
                    escape_string(tool)
                ));
                if conditions.is_empty() {
                    out.push_str(";\n");
                } else {
                    out.push_str("\nwhen {\n    ");
                    out.push_str(&conditions.join(" &&\n    "));
                    out.push_str("\n};\n");
                }
            }
        }
    }

    if policy.mts_enforce == MtsEnforce::Strict {
        if let Some(label) = &policy.mts_label {
            out.push_str(&format!(
                "\n@id(\"{MTS_POLICY_ID}\")\nforbid(principal, action == Action::\"invoke\", resource)\nwhen {{ context.agent.mts_label != \"{}\" }};\n",
                escape_string(&label.to_string())
            ));
        }
    }

    Ok(out)
}

/// One conjunct per constraint group. All of them must hold for the
/// permit to fire.
fn constraint_conditions(c: &ToolConstraints) -> Result<Vec<String>, CompileError> {
    let mut conds = Vec::new();

    if !c.path_patterns.is_empty() {
        let alts = c
            .path_patterns
            .iter()
            .map(|p| path_condition(p))
            .collect::<Result<Vec<_>, _>>()?;
        conds.push(format!(
            "(context.request has path && ({}))",
            alts.join(" || ")
        ));
    }

    if !c.allowed_domains.is_empty() {
        let alts: Vec<String> = c.allowed_domains.iter().map(|d| domain_condition(d)).collect();
        conds.push(format!(
            "(context.request has domain && ({}))",
            alts.join(" || ")
        ));
    }

    if !c.denied_domains.is_empty() {
        let alts: Vec<String> = c.denied_domains.iter().map(|d| domain_condition(d)).collect();
        conds.push(format!(
            "!(context.request has domain && ({}))",
            alts.join(" || ")
        ));
    }

    if !c.allowed_ports.is_empty() {
        let ports: Vec<String> = c.allowed_ports.iter().map(u16::to_string).collect();
        conds.push(format!(
            "(context.request has port && [{}].contains(context.request.port))",
            ports.join(", ")
        ));
    }

    if let Some(max) = c.max_size_bytes {
        conds.push(format!(
            "(context.request has size && context.request.size <= {max})"
        ));
    }

    Ok(conds)
}

/// Translate one path glob into a Cedar condition on
/// `context.request.path`.
///
/// `dir/**` becomes a directory-prefix disjunction; a trailing `/*` gets
/// a no-deeper-segment guard because the Cedar wildcard would otherwise
/// cross `/`. Every other glob form (`?`, character classes, a `*`
/// anywhere but the trailing position) has no faithful translation: the
/// shell glob's `*` stops at `/`, the Cedar wildcard does not, and a
/// loose translation would admit paths the table backend refuses. Those
/// patterns are rejected so the two backends can never drift apart.
fn path_condition(pattern: &str) -> Result<String, CompileError> {
    if pattern.contains('?') || pattern.contains('[') {
        return Err(CompileError::UntranslatablePattern {
            pattern: pattern.to_string(),
        });
    }

    if let Some(prefix) = pattern.strip_suffix("/**") {
        if !prefix.contains('*') {
            return Ok(format!(
                "(context.request.path == \"{}\" || context.request.path like \"{}/*\")",
                escape_string(prefix),
                escape_like(prefix)
            ));
        }
    }

    if let Some(dir) = pattern.strip_suffix("/*") {
        if !dir.contains('*') {
            return Ok(format!(
                "(context.request.path like \"{0}/*\" && !(context.request.path like \"{0}/*/*\"))",
                escape_like(dir)
            ));
        }
    }

    if pattern.contains('*') {
        return Err(CompileError::UntranslatablePattern {
            pattern: pattern.to_string(),
        });
    }

    Ok(format!(
        "context.request.path == \"{}\"",
        escape_string(pattern)
    ))
}

/// Translate one domain pattern into a Cedar condition on
/// `context.request.domain`.
fn domain_condition(pattern: &str) -> String {
    if pattern == "*" {
        return "true".to_string();
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        if suffix.starts_with('.') {
            // The wildcard cannot match the bare apex: the pattern keeps
            // its leading dot, so only strict sub-domains match.
            return format!(
                "context.request.domain like \"*{}\"",
                escape_like(suffix)
            );
        }
    }
    format!("context.request.domain == \"{}\"", escape_string(pattern))
}

/// Escape for a Cedar string literal.
fn escape_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Escape literal text for embedding in a Cedar `like` pattern: string
/// escapes plus `\*` for a literal star.
fn escape_like(s: &str) -> String {
    escape_string(s).replace('*', "\\*")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler;
    use crate::types::{EnforcementMode, ToolPermission};

    fn agent(agent_type: &str) -> AgentContext {
        AgentContext {
            agent_type: agent_type.to_string(),
            sandbox_id: "sb-1".to_string(),
            tenant_id: "tenant-a".to_string(),
            session_id: "sess-1".to_string(),
            ..Default::default()
        }
    }

    fn request(fields: &[(&str, Value)]) -> Map<String, Value> {
        fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn compile_as_code(
        default_action: Decision,
        permissions: Vec<ToolPermission>,
        mts_label: &str,
    ) -> CompiledPolicy {
        compiler::compile_as_code(
            "test-policy",
            vec!["assistant".to_string()],
            default_action,
            permissions,
            EnforcementMode::Enforcing,
            mts_label,
        )
        .expect("policy should compile")
    }

    fn eval(policy: &CompiledPolicy, tool: &str, req: &Map<String, Value>) -> (Decision, String) {
        policy
            .code_module
            .as_ref()
            .expect("module should be prepared")
            .evaluate(policy, &agent("assistant"), tool, req)
    }

    // ── Preparation ─────────────────────────────────────────────────────

    #[test]
    fn prepare_rejects_garbage() {
        assert!(matches!(
            CodeModule::prepare("this is not cedar"),
            Err(CompileError::Module { .. })
        ));
    }

    #[test]
    fn prepare_accepts_hand_written_module() {
        let module = CodeModule::prepare(
            r#"permit(principal, action == Action::"invoke", resource == Tool::"file.read");"#,
        )
        .expect("module should parse");
        assert!(module.source().contains("file.read"));
    }

    #[test]
    fn generated_module_parses_and_names_rules() {
        let policy = compile_as_code(
            Decision::Deny,
            vec![
                ToolPermission::allow_with(
                    "file.read",
                    ToolConstraints {
                        path_patterns: vec!["/workspace/**".into()],
                        ..Default::default()
                    },
                ),
                ToolPermission::new("network.fetch", Decision::Deny),
            ],
            "",
        );
        let source = policy.code_module.as_ref().unwrap().source();
        assert!(source.contains("@id(\"allow:file.read\")"));
        assert!(source.contains("@id(\"deny:network.fetch\")"));
        assert!(!source.contains("default-allow"));
    }

    #[test]
    fn untranslatable_pattern_is_rejected() {
        let result = compiler::compile_as_code(
            "p",
            vec!["a".to_string()],
            Decision::Deny,
            vec![ToolPermission::allow_with(
                "file.read",
                ToolConstraints {
                    path_patterns: vec!["/tmp/file-?.txt".into()],
                    ..Default::default()
                },
            )],
            EnforcementMode::Enforcing,
            "",
        );
        assert!(matches!(
            result,
            Err(CompileError::UntranslatablePattern { .. })
        ));
    }

    #[test]
    fn non_trailing_star_is_rejected() {
        // The shell glob's `*` stops at `/`; the Cedar wildcard would
        // not. A loose translation would fail open, so these patterns
        // must not compile into a module.
        for pattern in ["/workspace/*.rs", "/a/*/b", "*/etc", "/a*/b/**"] {
            let result = compiler::compile_as_code(
                "p",
                vec!["a".to_string()],
                Decision::Deny,
                vec![ToolPermission::allow_with(
                    "file.read",
                    ToolConstraints {
                        path_patterns: vec![pattern.to_string()],
                        ..Default::default()
                    },
                )],
                EnforcementMode::Enforcing,
                "",
            );
            assert!(
                matches!(result, Err(CompileError::UntranslatablePattern { .. })),
                "pattern {pattern} should be rejected"
            );
        }
    }

    // ── Decisions ───────────────────────────────────────────────────────

    #[test]
    fn explicit_allow_without_constraints() {
        let policy = compile_as_code(
            Decision::Deny,
            vec![ToolPermission::new("file.read", Decision::Allow)],
            "",
        );
        let (decision, reason) = eval(&policy, "file.read", &request(&[]));
        assert_eq!(decision, Decision::Allow);
        assert_eq!(reason, "tool explicitly allowed by policy");
    }

    #[test]
    fn explicit_deny_wins_over_default_allow() {
        let policy = compile_as_code(
            Decision::Allow,
            vec![ToolPermission::new("code.exec", Decision::Deny)],
            "",
        );
        let (decision, reason) = eval(&policy, "code.exec", &request(&[]));
        assert_eq!(decision, Decision::Deny);
        assert_eq!(reason, "tool explicitly denied by policy");
    }

    #[test]
    fn default_actions_apply_to_unlisted_tools() {
        let allow_all = compile_as_code(Decision::Allow, vec![], "");
        let (decision, reason) = eval(&allow_all, "anything.goes", &request(&[]));
        assert_eq!(decision, Decision::Allow);
        assert_eq!(reason, "allowed by default policy");

        let deny_all = compile_as_code(Decision::Deny, vec![], "");
        let (decision, reason) = eval(&deny_all, "anything.goes", &request(&[]));
        assert_eq!(decision, Decision::Deny);
        assert_eq!(reason, "denied by default policy");
    }

    #[test]
    fn path_constraint_is_enforced() {
        let policy = compile_as_code(
            Decision::Deny,
            vec![ToolPermission::allow_with(
                "file.read",
                ToolConstraints {
                    path_patterns: vec!["/workspace/**".into()],
                    ..Default::default()
                },
            )],
            "",
        );

        let (decision, _) = eval(
            &policy,
            "file.read",
            &request(&[("path", "/workspace/src/main.x".into())]),
        );
        assert_eq!(decision, Decision::Allow);

        // Bare directory counts as inside the prefix.
        let (decision, _) = eval(&policy, "file.read", &request(&[("path", "/workspace".into())]));
        assert_eq!(decision, Decision::Allow);

        let (decision, reason) = eval(
            &policy,
            "file.read",
            &request(&[("path", "/etc/passwd".into())]),
        );
        assert_eq!(decision, Decision::Deny);
        assert_eq!(reason, "denied by default policy");
    }

    #[test]
    fn trailing_single_star_stays_in_directory() {
        let policy = compile_as_code(
            Decision::Deny,
            vec![ToolPermission::allow_with(
                "file.read",
                ToolConstraints {
                    path_patterns: vec!["/tmp/*".into()],
                    ..Default::default()
                },
            )],
            "",
        );

        let (decision, _) = eval(&policy, "file.read", &request(&[("path", "/tmp/foo".into())]));
        assert_eq!(decision, Decision::Allow);

        let (decision, _) = eval(&policy, "file.read", &request(&[("path", "/tmp/a/b".into())]));
        assert_eq!(decision, Decision::Deny);
    }

    #[test]
    fn missing_constrained_field_denies() {
        // The code backend is stricter than the table here: reading an
        // absent field fails the permit.
        let policy = compile_as_code(
            Decision::Deny,
            vec![ToolPermission::allow_with(
                "file.read",
                ToolConstraints {
                    path_patterns: vec!["/workspace/**".into()],
                    ..Default::default()
                },
            )],
            "",
        );
        let (decision, _) = eval(&policy, "file.read", &request(&[]));
        assert_eq!(decision, Decision::Deny);
    }

    #[test]
    fn domain_wildcard_requires_strict_subdomain() {
        let policy = compile_as_code(
            Decision::Deny,
            vec![ToolPermission::allow_with(
                "network.fetch",
                ToolConstraints {
                    allowed_domains: vec!["*.example.com".into(), "api.x.y".into()],
                    ..Default::default()
                },
            )],
            "",
        );

        for (domain, expected) in [
            ("api.example.com", Decision::Allow),
            ("api.x.y", Decision::Allow),
            ("example.com", Decision::Deny),
            ("evil.com", Decision::Deny),
        ] {
            let (decision, _) = eval(
                &policy,
                "network.fetch",
                &request(&[("domain", domain.into())]),
            );
            assert_eq!(decision, expected, "domain {domain}");
        }
    }

    #[test]
    fn denied_domain_overrides_allowed() {
        let policy = compile_as_code(
            Decision::Deny,
            vec![ToolPermission::allow_with(
                "network.fetch",
                ToolConstraints {
                    allowed_domains: vec!["*".into()],
                    denied_domains: vec!["evil.com".into()],
                    ..Default::default()
                },
            )],
            "",
        );

        let (decision, _) = eval(
            &policy,
            "network.fetch",
            &request(&[("domain", "good.com".into())]),
        );
        assert_eq!(decision, Decision::Allow);

        let (decision, _) = eval(
            &policy,
            "network.fetch",
            &request(&[("domain", "evil.com".into())]),
        );
        assert_eq!(decision, Decision::Deny);
    }

    #[test]
    fn port_and_size_constraints_are_conjoined() {
        let policy = compile_as_code(
            Decision::Deny,
            vec![ToolPermission::allow_with(
                "network.fetch",
                ToolConstraints {
                    allowed_ports: vec![443],
                    max_size_bytes: Some(1024),
                    ..Default::default()
                },
            )],
            "",
        );

        let (decision, _) = eval(
            &policy,
            "network.fetch",
            &request(&[("port", 443.into()), ("size", 512.into())]),
        );
        assert_eq!(decision, Decision::Allow);

        // One failing conjunct is enough to refuse.
        let (decision, _) = eval(
            &policy,
            "network.fetch",
            &request(&[("port", 443.into()), ("size", 4096.into())]),
        );
        assert_eq!(decision, Decision::Deny);

        let (decision, _) = eval(
            &policy,
            "network.fetch",
            &request(&[("port", 80.into()), ("size", 512.into())]),
        );
        assert_eq!(decision, Decision::Deny);
    }

    // ── MTS enforcement ─────────────────────────────────────────────────

    #[test]
    fn mts_label_mismatch_is_denied() {
        let policy = compile_as_code(
            Decision::Allow,
            vec![],
            "s0:c42,c108",
        );

        let mut subject = agent("assistant");
        subject.mts_label = "s0:c42,c108".to_string();
        let module = policy.code_module.as_ref().unwrap();
        let (decision, _) = module.evaluate(&policy, &subject, "file.read", &request(&[]));
        assert_eq!(decision, Decision::Allow);

        subject.mts_label = "s0:c1".to_string();
        let (decision, reason) = module.evaluate(&policy, &subject, "file.read", &request(&[]));
        assert_eq!(decision, Decision::Deny);
        assert_eq!(reason, "MTS violation: tenant isolation");
    }

    // ── Escaping ────────────────────────────────────────────────────────

    #[test]
    fn string_escaping() {
        assert_eq!(escape_string(r#"a"b\c"#), r#"a\"b\\c"#);
        assert_eq!(escape_like("a*b"), r"a\*b");
    }
}
