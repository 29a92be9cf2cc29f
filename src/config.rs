//! Sync tuning and terminal credentials.
//!
//! Tuning knobs live in `local_settings` under the `sync` category so support
//! staff can adjust them per terminal; `POS_SYNC_*` environment variables win
//! over stored values. Credentials come from the environment, either as
//! separate variables or as the onboarding connection string.

use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::db::DbState;
use crate::error::ConfigError;

const SETTINGS_CATEGORY: &str = "sync";

pub const DEFAULT_DRAIN_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_PROBE_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_SUBMIT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;
pub const MAX_RETRY_DELAY_MS: u64 = 300_000;
const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Safety-net tick: drain anything still pending while online.
    pub drain_interval_secs: u64,
    pub probe_interval_secs: u64,
    pub probe_enabled: bool,
    /// Upper bound on a single submission round-trip.
    pub submit_timeout_secs: u64,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Buffer of the UI event channel.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            drain_interval_secs: DEFAULT_DRAIN_INTERVAL_SECS,
            probe_interval_secs: DEFAULT_PROBE_INTERVAL_SECS,
            probe_enabled: true,
            submit_timeout_secs: DEFAULT_SUBMIT_TIMEOUT_SECS,
            base_backoff_ms: DEFAULT_RETRY_DELAY_MS,
            max_backoff_ms: MAX_RETRY_DELAY_MS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

fn parse_u64(key: &str, raw: &str) -> Option<u64> {
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = raw, "Ignoring malformed sync setting");
            None
        }
    }
}

fn parse_bool(key: &str, raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => {
            warn!(key, value = raw, "Ignoring malformed sync setting");
            None
        }
    }
}

impl SyncConfig {
    /// Defaults overlaid with the `sync` settings stored in the database.
    pub fn load(db: &DbState) -> Self {
        let mut config = Self::default();
        config.overlay(|key| db.setting(SETTINGS_CATEGORY, key));
        config
    }

    /// Overlay `POS_SYNC_<KEY>` environment variables.
    pub fn with_env_overrides(mut self) -> Self {
        self.overlay(|key| std::env::var(format!("POS_SYNC_{}", key.to_ascii_uppercase())).ok());
        self
    }

    fn overlay(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let u64_keys: [(&str, &mut u64); 5] = [
            ("drain_interval_secs", &mut self.drain_interval_secs),
            ("probe_interval_secs", &mut self.probe_interval_secs),
            ("submit_timeout_secs", &mut self.submit_timeout_secs),
            ("base_backoff_ms", &mut self.base_backoff_ms),
            ("max_backoff_ms", &mut self.max_backoff_ms),
        ];
        for (key, slot) in u64_keys {
            if let Some(v) = lookup(key).and_then(|raw| parse_u64(key, &raw)) {
                *slot = v;
            }
        }
        if let Some(v) = lookup("probe_enabled").and_then(|raw| parse_bool("probe_enabled", &raw)) {
            self.probe_enabled = v;
        }
        if let Some(v) = lookup("event_capacity").and_then(|raw| parse_u64("event_capacity", &raw)) {
            self.event_capacity = v as usize;
        }
        self.normalize();
    }

    /// Clamp values that would stall or spin the engine.
    fn normalize(&mut self) {
        self.drain_interval_secs = self.drain_interval_secs.max(1);
        self.probe_interval_secs = self.probe_interval_secs.max(1);
        self.submit_timeout_secs = self.submit_timeout_secs.max(1);
        self.base_backoff_ms = self.base_backoff_ms.max(1);
        self.max_backoff_ms = self.max_backoff_ms.max(self.base_backoff_ms);
        self.event_capacity = self.event_capacity.max(1);
    }

    /// Write this configuration to the `sync` settings category.
    pub fn save(&self, db: &DbState) -> Result<(), crate::error::StorageError> {
        let pairs = [
            ("drain_interval_secs", self.drain_interval_secs.to_string()),
            ("probe_interval_secs", self.probe_interval_secs.to_string()),
            ("probe_enabled", self.probe_enabled.to_string()),
            ("submit_timeout_secs", self.submit_timeout_secs.to_string()),
            ("base_backoff_ms", self.base_backoff_ms.to_string()),
            ("max_backoff_ms", self.max_backoff_ms.to_string()),
            ("event_capacity", self.event_capacity.to_string()),
        ];
        for (key, value) in pairs {
            db.set_setting(SETTINGS_CATEGORY, key, &value)?;
        }
        Ok(())
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Admin dashboard address and terminal credentials. Issued by the auth
/// collaborator; this crate only carries them.
#[derive(Clone, PartialEq, Eq)]
pub struct GatewayCredentials {
    pub admin_url: String,
    pub api_key: String,
    pub terminal_id: Option<String>,
}

impl fmt::Debug for GatewayCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayCredentials")
            .field("admin_url", &self.admin_url)
            .field("api_key", &"***")
            .field("terminal_id", &self.terminal_id.as_deref().map(mask_terminal_id))
            .finish()
    }
}

fn mask_terminal_id(id: &str) -> String {
    let visible: String = id.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    format!("***{visible}")
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl GatewayCredentials {
    pub fn new(admin_url: &str, api_key: &str, terminal_id: Option<&str>) -> Self {
        Self {
            admin_url: normalize_admin_url(admin_url),
            api_key: api_key.trim().to_string(),
            terminal_id: terminal_id
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
        }
    }

    /// Read `POS_CONNECTION_STRING`, falling back to `POS_ADMIN_URL`,
    /// `POS_API_KEY` and `POS_TERMINAL_ID`. Separate variables override the
    /// matching connection-string field.
    pub fn from_env() -> Result<Self, ConfigError> {
        let from_string = match non_empty_env("POS_CONNECTION_STRING") {
            Some(raw) => Some(Self::from_connection_string(&raw)?),
            None => None,
        };

        let admin_url = non_empty_env("POS_ADMIN_URL")
            .or_else(|| from_string.as_ref().map(|c| c.admin_url.clone()))
            .ok_or(ConfigError::MissingCredential("POS_ADMIN_URL"))?;
        let api_key = non_empty_env("POS_API_KEY")
            .or_else(|| from_string.as_ref().map(|c| c.api_key.clone()))
            .ok_or(ConfigError::MissingCredential("POS_API_KEY"))?;
        let terminal_id = non_empty_env("POS_TERMINAL_ID")
            .or_else(|| from_string.as_ref().and_then(|c| c.terminal_id.clone()));

        Ok(Self::new(&admin_url, &api_key, terminal_id.as_deref()))
    }

    /// Decode the onboarding connection string: JSON `{"url","key","tid"}`,
    /// either plain or URL-safe base64 encoded.
    pub fn from_connection_string(raw: &str) -> Result<Self, ConfigError> {
        let payload =
            decode_connection_string_payload(raw).ok_or(ConfigError::InvalidConnectionString)?;
        let field = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| payload.get(*k).and_then(Value::as_str))
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        let admin_url = field(&["url", "adminUrl"]).ok_or(ConfigError::MissingCredential("url"))?;
        let api_key = field(&["key", "apiKey"]).ok_or(ConfigError::MissingCredential("key"))?;
        let terminal_id = field(&["tid", "terminalId"]);
        Ok(Self::new(&admin_url, &api_key, terminal_id.as_deref()))
    }
}

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

/// Normalise the admin dashboard URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes and a trailing `/api` segment
pub fn normalize_admin_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    let trimmed = url.trim_end_matches('/');
    let trimmed = trimmed.strip_suffix("/api").unwrap_or(trimmed);
    trimmed.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serial_test::serial;

    const ENV_KEYS: &[&str] = &[
        "POS_CONNECTION_STRING",
        "POS_ADMIN_URL",
        "POS_API_KEY",
        "POS_TERMINAL_ID",
        "POS_SYNC_SUBMIT_TIMEOUT_SECS",
        "POS_SYNC_PROBE_ENABLED",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_load_uses_defaults_for_missing_and_malformed_keys() {
        let db = db::open_in_memory().unwrap();
        db.set_setting("sync", "submit_timeout_secs", "12").unwrap();
        db.set_setting("sync", "base_backoff_ms", "soon").unwrap();
        db.set_setting("sync", "probe_enabled", "off").unwrap();

        let config = SyncConfig::load(&db);
        assert_eq!(config.submit_timeout_secs, 12);
        assert_eq!(config.base_backoff_ms, DEFAULT_RETRY_DELAY_MS);
        assert!(!config.probe_enabled);
        assert_eq!(config.drain_interval_secs, DEFAULT_DRAIN_INTERVAL_SECS);
    }

    #[test]
    fn test_save_then_load_round_trips() {
        let db = db::open_in_memory().unwrap();
        let config = SyncConfig {
            drain_interval_secs: 3,
            max_backoff_ms: 60_000,
            ..SyncConfig::default()
        };
        config.save(&db).unwrap();
        assert_eq!(SyncConfig::load(&db), config);
    }

    #[test]
    fn test_normalize_keeps_backoff_window_sane() {
        let db = db::open_in_memory().unwrap();
        db.set_setting("sync", "base_backoff_ms", "10000").unwrap();
        db.set_setting("sync", "max_backoff_ms", "10").unwrap();
        db.set_setting("sync", "submit_timeout_secs", "0").unwrap();

        let config = SyncConfig::load(&db);
        assert_eq!(config.max_backoff_ms, 10_000);
        assert_eq!(config.submit_timeout_secs, 1);
    }

    #[test]
    #[serial]
    fn test_env_overrides_stored_settings() {
        clear_env();
        let db = db::open_in_memory().unwrap();
        db.set_setting("sync", "submit_timeout_secs", "12").unwrap();
        std::env::set_var("POS_SYNC_SUBMIT_TIMEOUT_SECS", "5");
        std::env::set_var("POS_SYNC_PROBE_ENABLED", "false");

        let config = SyncConfig::load(&db).with_env_overrides();
        assert_eq!(config.submit_timeout(), Duration::from_secs(5));
        assert!(!config.probe_enabled);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_credentials_from_separate_env_vars() {
        clear_env();
        std::env::set_var("POS_ADMIN_URL", "admin.thesmall.app/api/");
        std::env::set_var("POS_API_KEY", " key-123 ");
        std::env::set_var("POS_TERMINAL_ID", "term-0001");

        let creds = GatewayCredentials::from_env().unwrap();
        assert_eq!(creds.admin_url, "https://admin.thesmall.app");
        assert_eq!(creds.api_key, "key-123");
        assert_eq!(creds.terminal_id.as_deref(), Some("term-0001"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_credentials_missing_key_is_reported() {
        clear_env();
        std::env::set_var("POS_ADMIN_URL", "https://admin.thesmall.app");
        assert_eq!(
            GatewayCredentials::from_env(),
            Err(ConfigError::MissingCredential("POS_API_KEY"))
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn test_connection_string_env_with_override() {
        clear_env();
        let json = r#"{"url":"localhost:3001","key":"abc-secret","tid":"term-9"}"#;
        let encoded = BASE64_STANDARD.encode(json).replace('+', "-").replace('/', "_");
        std::env::set_var("POS_CONNECTION_STRING", encoded.trim_end_matches('='));
        std::env::set_var("POS_TERMINAL_ID", "term-override");

        let creds = GatewayCredentials::from_env().unwrap();
        assert_eq!(creds.admin_url, "http://localhost:3001");
        assert_eq!(creds.api_key, "abc-secret");
        assert_eq!(creds.terminal_id.as_deref(), Some("term-override"));
        clear_env();
    }

    #[test]
    fn test_plain_json_connection_string() {
        let creds = GatewayCredentials::from_connection_string(
            r#"{ "url": "https://admin.thesmall.app/", "key": "k" }"#,
        )
        .unwrap();
        assert_eq!(creds.admin_url, "https://admin.thesmall.app");
        assert_eq!(creds.terminal_id, None);
        assert_eq!(
            GatewayCredentials::from_connection_string("nope"),
            Err(ConfigError::InvalidConnectionString)
        );
    }

    #[test]
    fn test_debug_output_masks_secrets() {
        let creds = GatewayCredentials::new("https://a.example", "super-secret", Some("terminal-1234"));
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("***1234"));
    }

    #[test]
    fn test_normalize_admin_url() {
        assert_eq!(normalize_admin_url("admin.thesmall.app"), "https://admin.thesmall.app");
        assert_eq!(normalize_admin_url("127.0.0.1:3000/api"), "http://127.0.0.1:3000");
        assert_eq!(
            normalize_admin_url(" https://admin.thesmall.app/api/ "),
            "https://admin.thesmall.app"
        );
    }
}
