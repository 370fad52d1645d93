//! Decision engine.
//!
//! The engine is the single chokepoint for tool invocations: every
//! request passes through [`Engine::evaluate`], which answers Allow or
//! Deny from declarative policies keyed by agent type. It is designed to
//! be linked directly into the request router, so there is no hop to
//! bypass.
//!
//! ```text
//! evaluate(agent, tool, request)
//!     │
//!     ├── cache probe ──────────────► hit: audit(cached) + mode, done
//!     │
//!     ├── policy lookup ────────────► absent: Deny (fail closed)
//!     │
//!     ├── backend dispatch
//!     │     ├── code module (when enabled and prepared)
//!     │     └── tool table + constraints
//!     │
//!     ├── cache store
//!     ├── audit emit
//!     └── enforcement mode
//! ```
//!
//! The engine never spawns threads and performs no blocking I/O on this
//! path; `load_policy` may block briefly while a policy module is
//! prepared. Evaluation is safe from any number of threads: the policy
//! map is behind a read-biased lock whose readers only clone an `Arc`,
//! the cache is a concurrent map, and published policies are immutable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::cache::{cache_key, CacheStats, DecisionCache, DEFAULT_TTL};
use crate::constraints;
use crate::types::{AgentContext, AuditEvent, CompiledPolicy, Decision, EnforcementMode};

// ─────────────────────────────────────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────────────────────────────────────

/// Engine construction options.
pub struct EngineOptions {
    /// How decisions are applied. Permissive (the default) logs denials
    /// but returns Allow, for observe-only rollout.
    pub mode: EnforcementMode,
    /// Decision cache TTL.
    pub cache_ttl: Duration,
    /// Where audit events go. `None` drops them.
    pub audit: Option<Arc<dyn AuditSink>>,
    /// Dispatch to prepared policy modules when a policy carries one.
    pub policy_as_code: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            mode: EnforcementMode::Permissive,
            cache_ttl: DEFAULT_TTL,
            audit: None,
            policy_as_code: false,
        }
    }
}

impl EngineOptions {
    /// Read options from the environment, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `AGENTGATE_MODE`: `permissive` or `enforcing`
    /// - `AGENTGATE_CACHE_TTL_SECS`: integer seconds
    /// - `AGENTGATE_POLICY_AS_CODE`: `1`, `true` or `yes`
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Ok(mode) = std::env::var("AGENTGATE_MODE") {
            if mode.to_lowercase() == "enforcing" {
                options.mode = EnforcementMode::Enforcing;
            }
        }
        if let Some(secs) = std::env::var("AGENTGATE_CACHE_TTL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            options.cache_ttl = Duration::from_secs(secs);
        }
        if let Ok(flag) = std::env::var("AGENTGATE_POLICY_AS_CODE") {
            options.policy_as_code = matches!(flag.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        options
    }

    pub fn with_mode(mut self, mode: EnforcementMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn with_policy_as_code(mut self, enabled: bool) -> Self {
        self.policy_as_code = enabled;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// The MAC decision engine.
pub struct Engine {
    /// Agent type to active policy. At most one policy per agent type;
    /// publication is a single map-entry swap under the write lock.
    policies: RwLock<HashMap<String, Arc<CompiledPolicy>>>,
    cache: DecisionCache,
    audit: Option<Arc<dyn AuditSink>>,
    /// Runtime-switchable [`EnforcementMode`], encoded for atomic access.
    mode: AtomicU8,
    policy_as_code: bool,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
            cache: DecisionCache::new(options.cache_ttl),
            audit: options.audit,
            mode: AtomicU8::new(mode_to_u8(options.mode)),
            policy_as_code: options.policy_as_code,
        }
    }

    /// Engine with default options: permissive, 60 second cache TTL, no
    /// audit sink, table evaluation only.
    pub fn with_defaults() -> Self {
        Self::new(EngineOptions::default())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Evaluation
    // ─────────────────────────────────────────────────────────────────────

    /// Decide whether `agent` may invoke `tool`.
    ///
    /// This is the hot path. The request map is opaque; only fields named
    /// by the matched permission's constraints are consulted. Fail closed:
    /// an unknown agent type, a failing constraint, a backend failure or
    /// a cancellation all yield Deny.
    ///
    /// The returned decision has the enforcement mode applied; the audit
    /// event always carries the underlying decision.
    pub fn evaluate(
        &self,
        cancel: &CancellationToken,
        agent: &AgentContext,
        tool: &str,
        request: &Map<String, Value>,
    ) -> Decision {
        let request_id = new_request_id();
        let key = cache_key(&agent.agent_type, tool);

        if let Some((decision, reason)) = self.cache.get(&key) {
            self.emit_audit(agent, tool, decision, &reason, &request_id, true);
            return self.apply_mode(decision);
        }

        if cancel.is_cancelled() {
            self.emit_audit(agent, tool, Decision::Deny, "evaluation cancelled", &request_id, false);
            return self.apply_mode(Decision::Deny);
        }

        let policy = self.policy_for(&agent.agent_type);
        let (decision, reason) = match &policy {
            None => (
                Decision::Deny,
                "no policy defined for agent type".to_string(),
            ),
            Some(policy) => self.dispatch(policy, agent, tool, request),
        };

        // A cancellation that raced the backend discards the computed
        // decision; nothing is cached.
        if cancel.is_cancelled() {
            self.emit_audit(agent, tool, Decision::Deny, "evaluation cancelled", &request_id, false);
            return self.apply_mode(Decision::Deny);
        }

        self.cache.set(&key, decision, &reason);
        self.emit_audit(agent, tool, decision, &reason, &request_id, false);

        if decision == Decision::Deny {
            debug!(
                agent_type = %agent.agent_type,
                tool,
                reason = %reason,
                "tool call denied"
            );
        }

        self.apply_mode(decision)
    }

    /// Pick the backend for one evaluation.
    fn dispatch(
        &self,
        policy: &CompiledPolicy,
        agent: &AgentContext,
        tool: &str,
        request: &Map<String, Value>,
    ) -> (Decision, String) {
        if self.policy_as_code {
            if let Some(module) = &policy.code_module {
                return module.evaluate(policy, agent, tool, request);
            }
        }
        evaluate_table(policy, tool, request)
    }

    fn policy_for(&self, agent_type: &str) -> Option<Arc<CompiledPolicy>> {
        self.policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_type)
            .cloned()
    }

    fn apply_mode(&self, decision: Decision) -> Decision {
        if self.mode() == EnforcementMode::Permissive && decision == Decision::Deny {
            return Decision::Allow;
        }
        decision
    }

    fn emit_audit(
        &self,
        agent: &AgentContext,
        tool: &str,
        decision: Decision,
        reason: &str,
        request_id: &str,
        cached: bool,
    ) {
        let Some(audit) = &self.audit else {
            return;
        };
        audit.log(&AuditEvent {
            timestamp: Utc::now(),
            agent: agent.clone(),
            tool: tool.to_string(),
            decision,
            reason: reason.to_string(),
            request_id: request_id.to_string(),
            cached,
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Policy Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Publish a policy for an agent type, replacing any previous one.
    ///
    /// Cached decisions for the agent type are invalidated before this
    /// returns, so no later evaluation observes the old policy.
    pub fn load_policy(&self, agent_type: &str, policy: Arc<CompiledPolicy>) {
        let name = policy.name.clone();
        {
            let mut policies = self.policies.write().unwrap_or_else(PoisonError::into_inner);
            policies.insert(agent_type.to_string(), policy);
        }
        let invalidated = self.cache.invalidate_prefix(&format!("{agent_type}:"));
        info!(agent_type, policy = %name, invalidated, "policy loaded");
    }

    /// Drop the policy for an agent type. Later evaluations fail closed.
    pub fn remove_policy(&self, agent_type: &str) {
        let removed = {
            let mut policies = self.policies.write().unwrap_or_else(PoisonError::into_inner);
            policies.remove(agent_type).is_some()
        };
        let invalidated = self.cache.invalidate_prefix(&format!("{agent_type}:"));
        if removed {
            info!(agent_type, invalidated, "policy removed");
        }
    }

    /// The active policy for an agent type, for inspection.
    pub fn get_policy(&self, agent_type: &str) -> Option<Arc<CompiledPolicy>> {
        self.policy_for(agent_type)
    }

    /// All agent types with a loaded policy, sorted.
    pub fn list_policies(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    // ─────────────────────────────────────────────────────────────────────
    // Mode & Stats
    // ─────────────────────────────────────────────────────────────────────

    /// Current enforcement mode.
    pub fn mode(&self) -> EnforcementMode {
        u8_to_mode(self.mode.load(Ordering::Relaxed))
    }

    /// Switch enforcement mode at runtime.
    pub fn set_mode(&self, mode: EnforcementMode) {
        self.mode.store(mode_to_u8(mode), Ordering::Relaxed);
        info!(%mode, "enforcement mode changed");
    }

    /// Decision cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drop every cached decision. Returns the number of entries
    /// removed. Policy loads already invalidate per agent type; this is
    /// the global hammer for operator tooling.
    pub fn invalidate_cache(&self) -> usize {
        self.cache.invalidate_all()
    }

    /// Whether code-module dispatch is enabled.
    pub fn policy_as_code(&self) -> bool {
        self.policy_as_code
    }
}

/// Table backend: explicit permission, then constraints, then default.
fn evaluate_table(
    policy: &CompiledPolicy,
    tool: &str,
    request: &Map<String, Value>,
) -> (Decision, String) {
    if let Some(permission) = policy.tool_table.get(tool) {
        if permission.action == Decision::Deny {
            return (
                Decision::Deny,
                "tool explicitly denied by policy".to_string(),
            );
        }
        if let Some(c) = &permission.constraints {
            if !constraints::check(c, request) {
                return (Decision::Deny, "constraint violation".to_string());
            }
        }
        return (
            Decision::Allow,
            "tool explicitly allowed by policy".to_string(),
        );
    }

    if policy.default_action == Decision::Allow {
        (Decision::Allow, "allowed by default policy".to_string())
    } else {
        (Decision::Deny, "denied by default policy".to_string())
    }
}

fn new_request_id() -> String {
    format!("req_{}", Uuid::new_v4().simple())
}

const fn mode_to_u8(mode: EnforcementMode) -> u8 {
    match mode {
        EnforcementMode::Permissive => 0,
        EnforcementMode::Enforcing => 1,
    }
}

const fn u8_to_mode(value: u8) -> EnforcementMode {
    match value {
        0 => EnforcementMode::Permissive,
        _ => EnforcementMode::Enforcing,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
