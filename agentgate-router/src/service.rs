//! Router-side policy enforcement.
//!
//! [`RouterService`] is the hook the transport calls before routing a
//! tool request to any sandbox. A Deny comes back as
//! [`RouterError::PermissionDenied`], which downstream transports map to
//! their permission-denied status code; the audit event has already been
//! emitted by the engine at that point.

use std::sync::Arc;

use agentgate_core::{Decision, Engine};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::intake::{canonical_tool_name, RequestMetadata};

/// Errors surfaced to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    /// Intake normalization produced an empty tool name.
    #[error("empty tool name")]
    EmptyToolName,

    /// Policy denied the request (enforcing mode).
    #[error("tool '{tool}' denied by policy for agent type '{agent_type}'")]
    PermissionDenied { tool: String, agent_type: String },
}

/// Thin enforcement wrapper around the shared engine.
pub struct RouterService {
    engine: Arc<Engine>,
}

impl RouterService {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// The wrapped engine, for policy lifecycle calls.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Evaluate a request and return the engine's decision.
    ///
    /// The tool name is canonicalized first; an empty result is an
    /// intake error and the request must not proceed.
    pub async fn evaluate(
        &self,
        cancel: &CancellationToken,
        metadata: &RequestMetadata,
        tool_name: &str,
        request: &Map<String, Value>,
    ) -> Result<Decision, RouterError> {
        let tool = canonical_tool_name(tool_name);
        if tool.is_empty() {
            debug!(agent_type = %metadata.agent_type, "rejecting request with empty tool name");
            return Err(RouterError::EmptyToolName);
        }

        let agent = metadata.agent_context();
        Ok(self.engine.evaluate(cancel, &agent, &tool, request))
    }

    /// Evaluate and refuse denied requests.
    ///
    /// This is the call sites' one-liner: `Ok(())` means route the
    /// request, `Err` means answer with a permission-denied status.
    pub async fn authorize(
        &self,
        cancel: &CancellationToken,
        metadata: &RequestMetadata,
        tool_name: &str,
        request: &Map<String, Value>,
    ) -> Result<(), RouterError> {
        match self.evaluate(cancel, metadata, tool_name, request).await? {
            Decision::Allow => Ok(()),
            Decision::Deny => Err(RouterError::PermissionDenied {
                tool: canonical_tool_name(tool_name),
                agent_type: metadata.agent_type.clone(),
            }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use agentgate_core::{compiler, EngineOptions, EnforcementMode, ToolPermission};

    fn service(mode: EnforcementMode) -> RouterService {
        let engine = Arc::new(Engine::new(EngineOptions::default().with_mode(mode)));
        let policy = compiler::compile(
            "coding",
            vec!["coding-assistant".to_string()],
            Decision::Deny,
            vec![ToolPermission::new("file.read", Decision::Allow)],
            EnforcementMode::Enforcing,
            "",
        )
        .unwrap();
        engine.load_policy("coding-assistant", Arc::new(policy));
        RouterService::new(engine)
    }

    fn metadata() -> RequestMetadata {
        RequestMetadata {
            agent_type: "coding-assistant".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn allowed_tool_authorizes() {
        let service = service(EnforcementMode::Enforcing);
        let cancel = CancellationToken::new();
        let result = service
            .authorize(&cancel, &metadata(), "file.read", &Map::new())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn denied_tool_maps_to_permission_denied() {
        let service = service(EnforcementMode::Enforcing);
        let cancel = CancellationToken::new();
        let result = service
            .authorize(&cancel, &metadata(), "network.fetch", &Map::new())
            .await;
        assert_eq!(
            result,
            Err(RouterError::PermissionDenied {
                tool: "network.fetch".to_string(),
                agent_type: "coding-assistant".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn raw_names_are_normalized_before_lookup() {
        let service = service(EnforcementMode::Enforcing);
        let cancel = CancellationToken::new();
        for raw in ["FileRead", "file_read", "File.Read"] {
            let decision = service
                .evaluate(&cancel, &metadata(), raw, &Map::new())
                .await
                .unwrap();
            assert_eq!(decision, Decision::Allow, "raw name {raw}");
        }
    }

    #[tokio::test]
    async fn empty_tool_name_is_an_intake_error() {
        let service = service(EnforcementMode::Enforcing);
        let cancel = CancellationToken::new();
        let result = service
            .evaluate(&cancel, &metadata(), "", &Map::new())
            .await;
        assert_eq!(result, Err(RouterError::EmptyToolName));
    }

    #[tokio::test]
    async fn permissive_mode_never_denies_the_caller() {
        let service = service(EnforcementMode::Permissive);
        let cancel = CancellationToken::new();
        let result = service
            .authorize(&cancel, &metadata(), "network.fetch", &Map::new())
            .await;
        assert!(result.is_ok());
    }
}
