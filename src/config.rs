//! Client configuration (spec.md §6.3), replacing scattered hardcoded
//! constants (`DEFAULT_WS_URL`, keep-alive interval, etc.) with a single
//! `serde`-deserializable struct whose `Default` matches the documented
//! defaults.

use crate::types::ProtocolVersion;
use std::time::Duration;

/// `[platform, browser, version]` device props sent during pairing/login.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct BrowserInfo {
    pub platform: String,
    pub browser: String,
    pub version: String,
}

impl Default for BrowserInfo {
    fn default() -> Self {
        Self {
            platform: "Mac OS".into(),
            browser: "Chrome".into(),
            version: "121.0.0".into(),
        }
    }
}

/// Recognized options table from spec.md §6.3.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub version: ProtocolVersion,
    pub browser: BrowserInfo,
    /// If true, request QR pairing; else pairing-code mode.
    pub print_qr_in_terminal: bool,
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub keep_alive_interval: Duration,
    #[serde(with = "duration_millis")]
    pub default_query_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub retry_request_delay: Duration,
    pub max_msg_retry_count: u32,
    pub max_reconnect_attempts: u32,
    pub mark_online_on_connect: bool,
    pub sync_full_history: bool,
    pub flood_threshold: u32,
    #[serde(with = "duration_millis")]
    pub flood_window: Duration,
    pub clear_auth_on_error: bool,
    /// Below this many unused pre-keys server-side, upload a fresh batch
    /// (spec.md §4.E "pre-keys are uploaded lazily").
    pub pre_key_upload_threshold: u32,
    pub max_commit_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::default(),
            browser: BrowserInfo::default(),
            print_qr_in_terminal: true,
            connect_timeout: Duration::from_secs(20),
            keep_alive_interval: Duration::from_secs(25),
            default_query_timeout: Duration::from_secs(60),
            retry_request_delay: Duration::from_millis(250),
            max_msg_retry_count: 5,
            max_reconnect_attempts: 5,
            mark_online_on_connect: false,
            sync_full_history: false,
            flood_threshold: 50,
            flood_window: Duration::from_secs(10),
            clear_auth_on_error: true,
            pre_key_upload_threshold: 5,
            max_commit_retries: 5,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.keep_alive_interval, Duration::from_secs(25));
        assert_eq!(cfg.default_query_timeout, Duration::from_secs(60));
        assert_eq!(cfg.max_msg_retry_count, 5);
        assert_eq!(cfg.flood_threshold, 50);
        assert_eq!(cfg.flood_window, Duration::from_secs(10));
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = ClientConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ClientConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_reconnect_attempts, cfg.max_reconnect_attempts);
    }
}
