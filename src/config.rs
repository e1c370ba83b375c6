//! Service configuration file

use anyhow::{bail, Context, Result};
use relaykit_engine::EngineConfig;
use relaykit_rules::RulesConfig;
use relaykit_transport::TlsClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub rules: RulesConfig,

    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

/// Settings shared by every listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Deadline for every endpoint read, write and dial
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Read size per message and tunnel codec capacity
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default)]
    pub debug_logs: bool,

    #[serde(default)]
    pub log_north: bool,

    #[serde(default)]
    pub log_south: bool,

    /// Extra PEM trust anchors for TLS and WSS north endpoints
    #[serde(default)]
    pub trusted_ca_certs: Vec<PathBuf>,

    /// Pause before a failed UDP tunnel is dialed again
    #[serde(default = "default_redial_delay_seconds")]
    pub redial_delay_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_buffer_size() -> usize {
    4096
}

fn default_redial_delay_seconds() -> u64 {
    5
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            buffer_size: default_buffer_size(),
            debug_logs: false,
            log_north: false,
            log_south: false,
            trusted_ca_certs: Vec::new(),
            redial_delay_seconds: default_redial_delay_seconds(),
        }
    }
}

impl GeneralConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn redial_delay(&self) -> Duration {
        Duration::from_secs(self.redial_delay_seconds)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            buffer_size: self.buffer_size,
            log_debug: self.debug_logs,
            log_north: self.log_north,
            log_south: self.log_south,
        }
    }

    pub fn tls_client(&self) -> TlsClientConfig {
        TlsClientConfig {
            trusted_ca_certs: self.trusted_ca_certs.clone(),
        }
    }
}

/// One listening socket and where its sessions go
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub name: String,

    /// Local address to listen on (`host:port`)
    pub bind: String,

    #[serde(flatten)]
    pub kind: ListenerKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ListenerKind {
    /// Accept clients and relay each one to its own north connection.
    /// Clients may arrive over TLS and may speak WebSocket.
    Tcp {
        north: NorthConfig,
        #[serde(default)]
        tls: Option<ServerTlsConfig>,
        #[serde(default)]
        websocket: bool,
    },

    /// Local end of a UDP tunnel: datagrams on `bind` travel through one
    /// north tunnel connection
    UdpLocal { north: NorthConfig },

    /// Remote end of a UDP tunnel: accept tunnel connections and deliver
    /// their datagrams to `target`
    UdpRemote {
        target: String,
        #[serde(default)]
        tls: Option<ServerTlsConfig>,
        /// Tunnel connections speak WebSocket
        #[serde(default)]
        websocket: bool,
    },
}

/// North endpoint a listener dials per session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NorthConfig {
    pub transport: NorthTransport,

    /// `host:port`, or a `ws://`/`wss://` URL for WebSocket
    pub endpoint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NorthTransport {
    Tcp,
    Tls,
    Ws,
}

/// Certificate for a TLS tunnel listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl ServiceConfig {
    /// Read, expand and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content)?;
        let raw: serde_yaml::Value =
            serde_yaml::from_str(&expanded).context("Failed to parse YAML config")?;
        check_listener_keys(&raw)?;
        let config: ServiceConfig =
            serde_yaml::from_value(raw).context("Failed to parse YAML config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.listeners.is_empty() {
            bail!("No listeners configured");
        }
        if self.general.timeout_seconds == 0 {
            bail!("general.timeout_seconds must be positive");
        }
        if self.general.buffer_size == 0 {
            bail!("general.buffer_size must be positive");
        }

        let mut names = HashSet::new();
        for listener in &self.listeners {
            if listener.name.is_empty() {
                bail!("Listener on {} has no name", listener.bind);
            }
            if !names.insert(listener.name.as_str()) {
                bail!("Duplicate listener name: {}", listener.name);
            }
            if let ListenerKind::Tcp { north, .. } | ListenerKind::UdpLocal { north } =
                &listener.kind
            {
                if north.endpoint.is_empty() {
                    bail!("Listener {} has an empty north endpoint", listener.name);
                }
            }
        }
        Ok(())
    }
}

/// Reject listener keys that the listener's kind does not use.
///
/// `kind` is a flattened internal tag, so serde cannot deny unknown fields
/// here and a misspelled or misplaced option would otherwise be dropped.
fn check_listener_keys(raw: &serde_yaml::Value) -> Result<()> {
    let Some(listeners) = raw.get("listeners").and_then(|l| l.as_sequence()) else {
        return Ok(());
    };

    for listener in listeners {
        let Some(map) = listener.as_mapping() else {
            continue;
        };
        let kind = listener.get("kind").and_then(|k| k.as_str()).unwrap_or("");
        let allowed: &[&str] = match kind {
            "tcp" => &["north", "tls", "websocket"],
            "udp-local" => &["north"],
            "udp-remote" => &["target", "tls", "websocket"],
            // Unknown kinds are reported by the deserializer
            _ => continue,
        };

        for key in map.keys() {
            let key = key.as_str().unwrap_or("");
            if !["name", "bind", "kind"].contains(&key) && !allowed.contains(&key) {
                let name = listener.get("name").and_then(|n| n.as_str()).unwrap_or("?");
                bail!("Listener {} ({}) has unsupported option: {}", name, kind, key);
            }
        }
    }
    Ok(())
}

/// Expand environment variables in a string
///
/// Supports `${VAR}` and `$VAR`. Unset variables expand to an empty string.
pub fn expand_env_vars(input: &str) -> Result<String> {
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .context("Invalid env var pattern")?;

    let expanded = re.replace_all(input, |caps: &regex_lite::Captures| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        std::env::var(name).unwrap_or_default()
    });
    Ok(expanded.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaykit_rules::RuleResponse;

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
general:
  timeout_seconds: 10
  buffer_size: 1500
  log_north: true
rules:
  connect:
    whitelist: ["^example\\.com:443$"]
    default: fail
listeners:
  - name: web
    kind: tcp
    bind: 0.0.0.0:8080
    north: { transport: tcp, endpoint: "10.0.0.2:3128" }
  - name: dns-local
    kind: udp-local
    bind: 127.0.0.1:5353
    north: { transport: ws, endpoint: "wss://tunnel.example.com/udp" }
  - name: dns-remote
    kind: udp-remote
    bind: 0.0.0.0:9443
    target: 1.1.1.1:53
    tls: { cert: /etc/relaykit/cert.pem, key: /etc/relaykit/key.pem }
"#;
        let config = ServiceConfig::parse(yaml).unwrap();

        assert_eq!(config.general.timeout(), Duration::from_secs(10));
        assert_eq!(config.general.engine_config().buffer_size, 1500);
        assert!(config.general.engine_config().log_north);
        assert_eq!(
            config.rules.connect.default_response,
            RuleResponse::RespondFail
        );
        assert_eq!(config.listeners.len(), 3);

        match &config.listeners[0].kind {
            ListenerKind::Tcp {
                north,
                tls,
                websocket,
            } => {
                assert_eq!(north.transport, NorthTransport::Tcp);
                assert_eq!(north.endpoint, "10.0.0.2:3128");
                assert!(tls.is_none());
                assert!(!websocket);
            }
            other => panic!("unexpected kind {:?}", other),
        }
        match &config.listeners[1].kind {
            ListenerKind::UdpLocal { north } => assert_eq!(north.transport, NorthTransport::Ws),
            other => panic!("unexpected kind {:?}", other),
        }
        match &config.listeners[2].kind {
            ListenerKind::UdpRemote {
                target,
                tls,
                websocket,
            } => {
                assert_eq!(target, "1.1.1.1:53");
                assert_eq!(
                    tls.as_ref().unwrap().cert,
                    PathBuf::from("/etc/relaykit/cert.pem")
                );
                assert!(!websocket);
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_general_defaults() {
        let yaml = r#"
listeners:
  - name: web
    kind: tcp
    bind: 127.0.0.1:8080
    north: { transport: tls, endpoint: "example.com:443" }
"#;
        let config = ServiceConfig::parse(yaml).unwrap();
        assert_eq!(config.general.timeout_seconds, 30);
        assert_eq!(config.general.buffer_size, 4096);
        assert_eq!(config.general.redial_delay(), Duration::from_secs(5));
        assert!(config.general.trusted_ca_certs.is_empty());
        assert_eq!(
            config.rules.connect.default_response,
            RuleResponse::DropFlat
        );
    }

    #[test]
    fn test_rejects_invalid_configs() {
        assert!(ServiceConfig::parse("listeners: []").is_err());

        let duplicate = r#"
listeners:
  - { name: a, kind: tcp, bind: "127.0.0.1:1", north: { transport: tcp, endpoint: "x:1" } }
  - { name: a, kind: tcp, bind: "127.0.0.1:2", north: { transport: tcp, endpoint: "x:2" } }
"#;
        assert!(ServiceConfig::parse(duplicate).is_err());

        let unknown_kind = r#"
listeners:
  - { name: a, kind: sctp, bind: "127.0.0.1:1" }
"#;
        assert!(ServiceConfig::parse(unknown_kind).is_err());

        let missing_target = r#"
listeners:
  - { name: a, kind: udp-remote, bind: "127.0.0.1:1" }
"#;
        assert!(ServiceConfig::parse(missing_target).is_err());

        let zero_timeout = r#"
general: { timeout_seconds: 0 }
listeners:
  - { name: a, kind: tcp, bind: "127.0.0.1:1", north: { transport: tcp, endpoint: "x:1" } }
"#;
        assert!(ServiceConfig::parse(zero_timeout).is_err());
    }

    #[test]
    fn test_tcp_listener_tls_and_websocket() {
        let yaml = r#"
listeners:
  - name: web-wss
    kind: tcp
    bind: 0.0.0.0:8443
    websocket: true
    tls: { cert: /etc/relaykit/cert.pem, key: /etc/relaykit/key.pem }
    north: { transport: tcp, endpoint: "10.0.0.2:3128" }
"#;
        let config = ServiceConfig::parse(yaml).unwrap();

        match &config.listeners[0].kind {
            ListenerKind::Tcp { tls, websocket, .. } => {
                let tls = tls.as_ref().unwrap();
                assert_eq!(tls.cert, PathBuf::from("/etc/relaykit/cert.pem"));
                assert_eq!(tls.key, PathBuf::from("/etc/relaykit/key.pem"));
                assert!(*websocket);
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_rejects_unsupported_listener_options() {
        let websocket_on_udp_local = r#"
listeners:
  - name: dns
    kind: udp-local
    bind: 127.0.0.1:5353
    websocket: true
    north: { transport: tcp, endpoint: "x:1" }
"#;
        let err = ServiceConfig::parse(websocket_on_udp_local).unwrap_err();
        assert!(err.to_string().contains("websocket"));

        let misspelled = r#"
listeners:
  - name: web
    kind: tcp
    bind: 127.0.0.1:8080
    tlss: { cert: a.pem, key: b.pem }
    north: { transport: tcp, endpoint: "x:1" }
"#;
        let err = ServiceConfig::parse(misspelled).unwrap_err();
        assert!(err.to_string().contains("tlss"));

        let target_on_tcp = r#"
listeners:
  - { name: a, kind: tcp, bind: "127.0.0.1:1", target: "x:2", north: { transport: tcp, endpoint: "x:1" } }
"#;
        assert!(ServiceConfig::parse(target_on_tcp).is_err());
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("RELAYKIT_TEST_HOST", "10.1.2.3");
        std::env::set_var("RELAYKIT_TEST_PORT", "3128");

        assert_eq!(
            expand_env_vars("${RELAYKIT_TEST_HOST}:$RELAYKIT_TEST_PORT").unwrap(),
            "10.1.2.3:3128"
        );
        assert_eq!(
            expand_env_vars("prefix_${RELAYKIT_TEST_HOST}_suffix").unwrap(),
            "prefix_10.1.2.3_suffix"
        );
        assert_eq!(expand_env_vars("no_vars").unwrap(), "no_vars");
        assert_eq!(expand_env_vars("${RELAYKIT_TEST_UNSET}").unwrap(), "");
        assert_eq!(expand_env_vars("cost: 5$").unwrap(), "cost: 5$");

        std::env::remove_var("RELAYKIT_TEST_HOST");
        std::env::remove_var("RELAYKIT_TEST_PORT");
    }

    #[test]
    fn test_env_expansion_in_config() {
        std::env::set_var("RELAYKIT_TEST_NORTH", "proxy.internal:3128");
        let yaml = r#"
listeners:
  - name: web
    kind: tcp
    bind: 127.0.0.1:8080
    north: { transport: tcp, endpoint: "${RELAYKIT_TEST_NORTH}" }
"#;
        let config = ServiceConfig::parse(yaml).unwrap();
        std::env::remove_var("RELAYKIT_TEST_NORTH");

        match &config.listeners[0].kind {
            ListenerKind::Tcp { north, .. } => assert_eq!(north.endpoint, "proxy.internal:3128"),
            other => panic!("unexpected kind {:?}", other),
        }
    }
}
