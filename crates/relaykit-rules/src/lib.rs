//! Admission rules for northbound traffic
//!
//! Rules form an allow-list for the message types they recognise. A rule that
//! does not understand a message answers [`RuleResponse::Undefined`] and the
//! next rule is asked; traffic no rule understands passes unfiltered.

pub mod connect;
pub mod processor;

pub use connect::ConnectRules;
pub use processor::{Processor, RulesConfig};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome of evaluating a rule against a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleResponse {
    /// Forward the message
    #[serde(rename = "allow")]
    Allow,
    /// Reject with a failure response, then end the session
    #[serde(rename = "fail")]
    RespondFail,
    /// End the session without a response
    #[serde(rename = "drop")]
    DropFlat,
    /// The rule does not cover this message
    #[serde(rename = "undefined")]
    Undefined,
}

/// A single admission rule
pub trait Rule: Send + Sync + std::fmt::Debug {
    fn allow(&self, message: &[u8]) -> RuleResponse;
}

/// Rule construction errors
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Invalid rule pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex_lite::Error,
    },
}
