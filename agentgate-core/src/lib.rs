//! AgentGate Core: mandatory access control for AI agent tool
//! invocations.
//!
//! Each time an agent attempts to invoke a named tool (`file.read`,
//! `network.fetch`, ...) the [`engine::Engine`] returns an Allow or Deny
//! decision derived from declarative policies keyed by agent type. The
//! library is meant to be linked directly into the request router so
//! enforcement cannot be bypassed; it executes no tools, opens no
//! sockets, authenticates nobody and persists nothing.
//!
//! The pieces, bottom up:
//!
//! - [`mts`]: tenant-isolation labels and the dominance check.
//! - [`cache`]: the per-`(agent_type, tool)` decision cache with TTL
//!   and prefix invalidation.
//! - [`types`] + [`compiler`]: the declarative policy model and its
//!   compilation into an immutable [`types::CompiledPolicy`].
//! - [`code`]: the policy-as-code backend with generated Cedar modules,
//!   prepared once per policy version.
//! - [`engine`]: the hot-path orchestrator.
//! - [`audit`]: decision fan-out to pluggable sinks.

pub mod audit;
pub mod cache;
pub mod code;
pub mod compiler;
pub mod constraints;
pub mod engine;
pub mod error;
pub mod mts;
pub mod types;

pub use audit::{AuditEmitter, AuditSink, AuditStats};
pub use cache::CacheStats;
pub use engine::{Engine, EngineOptions};
pub use error::CompileError;
pub use mts::{LabelError, MtsLabel};
pub use types::{
    AgentContext, AuditEvent, CompiledPolicy, Decision, EnforcementMode, MtsEnforce,
    ToolConstraints, ToolPermission,
};
