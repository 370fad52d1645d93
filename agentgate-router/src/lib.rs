//! AgentGate Router: request intake for the decision engine.
//!
//! The transport layer (whatever speaks the wire protocol to agents)
//! hands each tool request to [`service::RouterService`] before routing
//! it anywhere. The service normalizes the tool name, builds the agent
//! identity from request metadata, asks the engine for a decision and
//! maps a Deny onto an error the transport can turn into a
//! permission-denied status. The ordering mirrors an LSM hook: the
//! policy check runs before any execution path is reached.

pub mod intake;
pub mod service;

pub use intake::{canonical_tool_name, RequestMetadata};
pub use service::{RouterError, RouterService};
