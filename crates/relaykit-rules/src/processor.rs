//! Ordered rule chain

use crate::{ConnectRules, Rule, RuleError, RuleResponse};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Rule configuration as read from the service config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default)]
    pub connect: ConnectConfig,
}

/// CONNECT allow-list configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    /// Regular expressions matched against the CONNECT target
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// Response when no pattern matches
    #[serde(default = "default_connect_response", rename = "default")]
    pub default_response: RuleResponse,
}

fn default_connect_response() -> RuleResponse {
    RuleResponse::DropFlat
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            whitelist: Vec::new(),
            default_response: default_connect_response(),
        }
    }
}

/// Evaluates rules in order; the first conclusive answer wins.
///
/// Shared read-only between sessions.
#[derive(Debug, Default)]
pub struct Processor {
    rules: Vec<Box<dyn Rule>>,
}

impl Processor {
    pub fn new(rules: Vec<Box<dyn Rule>>) -> Self {
        Self { rules }
    }

    /// Build the standard chain from configuration
    pub fn from_config(config: &RulesConfig) -> Result<Self, RuleError> {
        let connect = ConnectRules::new(config.connect.whitelist.as_slice())?
            .with_default(config.connect.default_response);
        debug!(
            "CONNECT rule added with patterns {:?}",
            connect.patterns().collect::<Vec<_>>()
        );
        Ok(Self::new(vec![Box::new(connect)]))
    }

    /// Append a rule to the end of the chain
    pub fn with_rule(mut self, rule: impl Rule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn allow(&self, message: &[u8]) -> RuleResponse {
        self.rules
            .iter()
            .map(|rule| rule.allow(message))
            .find(|resp| *resp != RuleResponse::Undefined)
            .unwrap_or(RuleResponse::Allow)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
