//! Client configuration types.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use cora_core::constants::{DEFAULT_APPLICATION_NAME, RESTART_INTERVAL};

/// Credentials used to log on to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogonConfig {
    /// Account name. An empty name logs on anonymously.
    pub user_name: String,
    /// Account password.
    pub password: String,
    /// Application name reported to the server.
    pub application: String,
    /// Access token; preferred over the password when the server supports it.
    pub access_token: Option<String>,
    /// Refresh token paired with the access token.
    pub refresh_token: Option<String>,
}

impl Default for LogonConfig {
    fn default() -> Self {
        Self {
            user_name: String::new(),
            password: String::new(),
            application: DEFAULT_APPLICATION_NAME.to_string(),
            access_token: None,
            refresh_token: None,
        }
    }
}

impl LogonConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the account name and password.
    pub fn with_user(mut self, user_name: impl Into<String>, password: impl Into<String>) -> Self {
        self.user_name = user_name.into();
        self.password = password.into();
        self
    }

    /// Set the application name.
    pub fn with_application(mut self, application: impl Into<String>) -> Self {
        self.application = application.into();
        self
    }

    /// Set the access token.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Set the refresh token.
    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    /// True when both configs would authenticate as the same principal.
    pub fn same_credentials(&self, other: &LogonConfig) -> bool {
        self.user_name == other.user_name
            && self.password == other.password
            && self.access_token == other.access_token
    }

    /// Access token, treating an empty string as unset.
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref().filter(|t| !t.is_empty())
    }
}

/// Behaviour of the data subscription manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataManagerConfig {
    /// Re-issue failed sub-transactions after `restart_interval`.
    pub auto_restart: bool,
    /// Delay before a failed sub-transaction is re-issued.
    #[serde(with = "duration_secs")]
    pub restart_interval: Duration,
}

impl Default for DataManagerConfig {
    fn default() -> Self {
        Self {
            auto_restart: true,
            restart_interval: RESTART_INTERVAL,
        }
    }
}

impl DataManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable automatic restart.
    pub fn with_auto_restart(mut self, enabled: bool) -> Self {
        self.auto_restart = enabled;
        self
    }

    /// Set the restart delay.
    pub fn with_restart_interval(mut self, interval: Duration) -> Self {
        self.restart_interval = interval;
        self
    }
}

mod duration_secs {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logon_defaults() {
        let config = LogonConfig::default();
        assert_eq!(config.application, DEFAULT_APPLICATION_NAME);
        assert!(config.user_name.is_empty());
        assert!(config.access_token().is_none());
    }

    #[test]
    fn logon_builder() {
        let config = LogonConfig::new()
            .with_user("alice", "secret")
            .with_application("viewer")
            .with_access_token("tok")
            .with_refresh_token("ref");
        assert_eq!(config.user_name, "alice");
        assert_eq!(config.password, "secret");
        assert_eq!(config.application, "viewer");
        assert_eq!(config.access_token(), Some("tok"));
        assert_eq!(config.refresh_token.as_deref(), Some("ref"));
    }

    #[test]
    fn empty_access_token_is_unset() {
        let config = LogonConfig::new().with_access_token("");
        assert!(config.access_token().is_none());
    }

    #[test]
    fn same_credentials_ignores_application() {
        let a = LogonConfig::new().with_user("u", "p").with_application("one");
        let b = LogonConfig::new().with_user("u", "p").with_application("two");
        let c = LogonConfig::new().with_user("u", "other");
        assert!(a.same_credentials(&b));
        assert!(!a.same_credentials(&c));
    }

    #[test]
    fn data_manager_defaults_and_builder() {
        let config = DataManagerConfig::default();
        assert!(config.auto_restart);
        assert_eq!(config.restart_interval, RESTART_INTERVAL);

        let config = DataManagerConfig::new()
            .with_auto_restart(false)
            .with_restart_interval(Duration::from_secs(3));
        assert!(!config.auto_restart);
        assert_eq!(config.restart_interval, Duration::from_secs(3));
    }

    #[test]
    fn serde_roundtrip() {
        let config = DataManagerConfig::new().with_restart_interval(Duration::from_secs(30));
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"auto_restart":true,"restart_interval":30}"#);
        let parsed: DataManagerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);

        let parsed: DataManagerConfig = serde_json::from_str(r#"{"auto_restart":false}"#).unwrap();
        assert!(!parsed.auto_restart);
        assert_eq!(parsed.restart_interval, RESTART_INTERVAL);

        let logon: LogonConfig = serde_json::from_str(r#"{"user_name":"bob"}"#).unwrap();
        assert_eq!(logon.user_name, "bob");
        assert_eq!(logon.application, DEFAULT_APPLICATION_NAME);
    }
}
