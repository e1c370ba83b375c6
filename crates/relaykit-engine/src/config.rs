use serde::{Deserialize, Serialize};

/// Per-session engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Initial capacity of the tunnel accumulation buffer
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Engine-level debug logging
    #[serde(default)]
    pub log_debug: bool,

    /// Debug logging on the north endpoint
    #[serde(default)]
    pub log_north: bool,

    /// Debug logging on the south endpoint
    #[serde(default)]
    pub log_south: bool,
}

fn default_buffer_size() -> usize {
    4096
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            log_debug: false,
            log_north: false,
            log_south: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config: EngineConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.buffer_size, 4096);
    }

    #[test]
    fn test_partial_yaml() {
        let config: EngineConfig =
            serde_yaml::from_str("buffer_size: 1500\nlog_north: true").unwrap();
        assert_eq!(config.buffer_size, 1500);
        assert!(config.log_north);
        assert!(!config.log_south);
        assert!(!config.log_debug);
    }
}
