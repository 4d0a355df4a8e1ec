//! Server and call-policy configuration types.

use serde::Deserialize;

use crate::auth::DEFAULT_CALL_DEADLINE;

/// Whether clients may publish join/leave events through `SendEvent`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusEventPolicy {
    /// Join/leave are emitted by the relay only.
    #[default]
    Reject,
    /// Join/leave pass with the exclusivity check only.
    Allow,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port for the gRPC services.
    pub port: u16,
    /// Bound on unary calls, in milliseconds.
    pub call_deadline_ms: u64,
    pub status_events: StatusEventPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8888,
            call_deadline_ms: DEFAULT_CALL_DEADLINE.as_millis() as u64,
            status_events: StatusEventPolicy::Reject,
        }
    }
}

impl ServerConfig {
    pub fn call_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.call_deadline_ms)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let server = ServerConfig::default();
        assert_eq!(server.port, 8888);
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.call_deadline(), DEFAULT_CALL_DEADLINE);
        assert_eq!(server.status_events, StatusEventPolicy::Reject);
        assert_eq!(server.bind_address(), "0.0.0.0:8888");
    }

    #[test]
    fn test_status_event_policy_from_yaml() {
        let server: ServerConfig = serde_yaml::from_str("status_events: allow\nport: 9000").unwrap();
        assert_eq!(server.status_events, StatusEventPolicy::Allow);
        assert_eq!(server.port, 9000);
        assert_eq!(server.call_deadline_ms, 500);
    }
}
