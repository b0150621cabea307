//! Settings type definitions.
//!
//! Field names are camelCase in `settings.json`. Every section is
//! `#[serde(default)]`, so a partial file only overrides what it names.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};
use crate::loader::duet_home;

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DuetSettings {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub policy: PolicySettings,
    pub logging: LoggingSettings,
}

impl DuetSettings {
    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        let server = &self.server;
        if server.max_send_queue == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxSendQueue must be positive".into(),
            ));
        }
        if server.heartbeat_interval_secs == 0 || server.cleanup_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "server intervals must be positive".into(),
            ));
        }
        if server.client_timeout_secs <= server.heartbeat_interval_secs {
            return Err(SettingsError::InvalidValue(format!(
                "server.clientTimeoutSecs ({}) must exceed heartbeatIntervalSecs ({})",
                server.client_timeout_secs, server.heartbeat_interval_secs
            )));
        }
        if self.storage.db_path.as_os_str().is_empty() {
            return Err(SettingsError::InvalidValue("storage.dbPath is empty".into()));
        }
        Ok(())
    }
}

/// Network and connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// HTTP + WebSocket port. `0` picks a free port.
    pub port: u16,
    /// Outbound frames buffered per connection before new ones are dropped.
    pub max_send_queue: usize,
    pub heartbeat_interval_secs: u64,
    /// Connections silent for this long are swept.
    pub client_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 90,
            cleanup_interval_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Chat database file.
    pub db_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: duet_home().join("data").join("chat.db"),
        }
    }
}

/// How strictly the message router treats questionable client events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicySettings {
    /// Refuse `join-session` for ids the store has never seen.
    pub reject_unknown_sessions: bool,
    /// Refuse `send-message` once a session has ended.
    pub reject_ended_sends: bool,
    /// Require `choice_response.questionId` to name a multiple-choice message
    /// in the same session.
    pub verify_question_refs: bool,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            reject_unknown_sessions: true,
            reject_ended_sends: true,
            verify_question_refs: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level directive (`RUST_LOG` still wins).
    pub level: String,
    /// Per-target overrides, e.g. `{"duet_server": "debug"}`.
    pub modules: BTreeMap<String, String>,
    /// JSON lines instead of human-readable output.
    pub json: bool,
    /// Persist WARN and ERROR events to `logDbPath`.
    pub persist_warnings: bool,
    pub log_db_path: PathBuf,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            modules: BTreeMap::new(),
            json: false,
            persist_warnings: true,
            log_db_path: duet_home().join("data").join("logs.db"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = DuetSettings::default();
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 3000);
        assert_eq!(settings.server.max_send_queue, 256);
        assert_eq!(settings.server.heartbeat_interval_secs, 30);
        assert_eq!(settings.server.client_timeout_secs, 90);
        assert!(settings.storage.db_path.ends_with(".duet/data/chat.db"));
        assert_eq!(settings.policy, PolicySettings::default());
        assert!(settings.policy.reject_unknown_sessions);
        assert_eq!(settings.logging.level, "info");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn camel_case_wire_names() {
        let json = serde_json::to_value(DuetSettings::default()).unwrap();
        assert!(json["server"]["maxSendQueue"].is_number());
        assert!(json["policy"]["rejectEndedSends"].is_boolean());
        assert!(json["storage"]["dbPath"].is_string());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let settings: DuetSettings =
            serde_json::from_str(r#"{"policy": {"verifyQuestionRefs": false}}"#).unwrap();
        assert!(!settings.policy.verify_question_refs);
        assert!(settings.policy.reject_ended_sends);
        assert_eq!(settings.server.port, 3000);
    }

    #[test]
    fn logging_module_overrides() {
        let settings: DuetSettings = serde_json::from_str(
            r#"{"logging": {"modules": {"duet_server": "debug", "tower_http": "warn"}}}"#,
        )
        .unwrap();
        assert_eq!(settings.logging.modules.len(), 2);
        assert_eq!(settings.logging.modules["duet_server"], "debug");
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn validate_rejects_zero_queue() {
        let mut settings = DuetSettings::default();
        settings.server.max_send_queue = 0;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn validate_rejects_timeout_shorter_than_heartbeat() {
        let mut settings = DuetSettings::default();
        settings.server.client_timeout_secs = 10;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("clientTimeoutSecs"));
    }
}
