//! Compilation error types.
//!
//! Evaluation itself never errors: the engine is fail-closed and turns
//! every uncertainty into a `Deny` with a reason string. Errors exist only
//! at compile time, where they are reported to the compiler's caller; the
//! engine refuses nothing because it is only ever handed compiled
//! policies.

use thiserror::Error;

use crate::mts::LabelError;

/// Errors from compiling a declarative policy spec.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    /// A policy must name at least one agent type.
    #[error("policy '{policy}' declares no agent types")]
    NoAgentTypes { policy: String },

    /// Tool names are lower-case dot-separated identifiers.
    #[error("invalid tool name '{tool}': expected lower-case dot-separated segments")]
    InvalidToolName { tool: String },

    /// The tenant-isolation label did not parse.
    #[error("invalid MTS label: {0}")]
    Label(#[from] LabelError),

    /// A declarative action string was neither `allow` nor `deny`.
    #[error("unknown action '{value}': expected 'allow' or 'deny'")]
    UnknownAction { value: String },

    /// A declarative mode string was neither `permissive` nor `enforcing`.
    #[error("unknown enforcement mode '{value}': expected 'permissive' or 'enforcing'")]
    UnknownMode { value: String },

    /// A declarative MTS enforce string was not recognized.
    #[error("unknown MTS enforce mode '{value}': expected 'strict', 'permissive' or 'disabled'")]
    UnknownMtsEnforce { value: String },

    /// The policy-as-code backend rejected the module text.
    #[error("policy module rejected: {reason}")]
    Module { reason: String },

    /// A constraint pattern has no faithful translation into the
    /// policy-as-code module language.
    #[error("constraint pattern '{pattern}' is not expressible in a policy module")]
    UntranslatablePattern { pattern: String },
}
