//! Opt-in per-connection debug logging

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tracing::debug;

/// Payload bytes shown per logged message
const DATA_PREVIEW: usize = 256;

/// Debug logger that stays silent until enabled for one connection.
///
/// Output goes through `tracing` at debug level, prefixed with the
/// correlation id handed to [`DebugLog::enable`].
#[derive(Debug, Default)]
pub struct DebugLog {
    enabled: AtomicBool,
    connection_id: RwLock<String>,
}

impl DebugLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&self, enabled: bool, connection_id: &str) {
        let mut id = self
            .connection_id
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *id = connection_id.to_string();
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn connection_id(&self) -> String {
        self.connection_id
            .read()
            .map(|id| id.clone())
            .unwrap_or_default()
    }

    pub fn log_debug(&self, message: &str, prefix: &str) {
        if self.is_enabled() {
            debug!("[{}] {} > {}", self.connection_id(), prefix, message);
        }
    }

    /// Log a message payload, lossily decoded and truncated
    pub fn log_data(&self, data: &[u8], prefix: &str) {
        if self.is_enabled() {
            let shown = &data[..data.len().min(DATA_PREVIEW)];
            debug!(
                "[{}] {} > {} bytes: {}",
                self.connection_id(),
                prefix,
                data.len(),
                String::from_utf8_lossy(shown)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_by_default() {
        let log = DebugLog::new();
        assert!(!log.is_enabled());
        // Must not panic while disabled
        log.log_data(b"ignored", "recv");
    }

    #[test]
    fn test_enable_and_disable() {
        let log = DebugLog::new();
        log.enable(true, "e-1-n");
        assert!(log.is_enabled());
        assert_eq!(log.connection_id(), "e-1-n");

        log.enable(false, "e-1-n");
        assert!(!log.is_enabled());
    }

    #[test]
    fn test_log_data_truncates_long_payloads() {
        let log = DebugLog::new();
        log.enable(true, "t");
        log.log_data(&vec![b'a'; DATA_PREVIEW * 4], "send");
        log.log_data(&[0xff, 0xfe], "send");
    }
}
