use std::{fs, time::Duration};

use anyhow::{bail, Context};
use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::{
    channel::{ChannelSettings, SEND_DESTINATION},
    reconnect::ReconnectSettings,
    transport::TransportSettings,
    unread::UnreadSettings,
};

pub const SETTINGS_FILE: &str = "client.toml";
const BROKER_PATH: &str = "/chat/websocket";

const DAY_SECS: u64 = 24 * 60 * 60;
/// Upper bound for the unread lookback and forward horizon.
const MAX_UNREAD_SPAN_SECS: u64 = 366 * DAY_SECS;
const MAX_INBOX_CAPACITY: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server_url: String,
    /// Derived from `server_url` when unset.
    pub broker_url: Option<String>,
    pub send_destination: String,
    pub connect_timeout_secs: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub max_reconnect_attempts: Option<u32>,
    pub inbox_capacity: usize,
    pub unread_poll_interval_secs: u64,
    pub unread_lookback_secs: u64,
    pub unread_forward_horizon_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            broker_url: None,
            send_destination: SEND_DESTINATION.into(),
            connect_timeout_secs: 10,
            reconnect_base_ms: 5_000,
            reconnect_max_ms: 60_000,
            max_reconnect_attempts: None,
            inbox_capacity: 256,
            unread_poll_interval_secs: 15,
            unread_lookback_secs: 36_000,
            unread_forward_horizon_secs: 3_600,
        }
    }
}

impl ClientSettings {
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let mut settings: Self = toml::from_str(raw).context("invalid client settings")?;
        settings.sanitize();
        Ok(settings)
    }

    /// Puts zero or out-of-range durations and capacities back to their
    /// defaults. Every value that reaches a timer or a channel is non-zero.
    fn sanitize(&mut self) {
        let defaults = Self::default();
        in_range(
            "connect_timeout_secs",
            &mut self.connect_timeout_secs,
            defaults.connect_timeout_secs,
            60 * 60,
        );
        in_range(
            "reconnect_base_ms",
            &mut self.reconnect_base_ms,
            defaults.reconnect_base_ms,
            DAY_SECS * 1_000,
        );
        in_range(
            "reconnect_max_ms",
            &mut self.reconnect_max_ms,
            defaults.reconnect_max_ms,
            DAY_SECS * 1_000,
        );
        if self.reconnect_max_ms < self.reconnect_base_ms {
            warn!(
                reconnect_base_ms = self.reconnect_base_ms,
                reconnect_max_ms = self.reconnect_max_ms,
                "config: reconnect cap below base delay, raising cap"
            );
            self.reconnect_max_ms = self.reconnect_base_ms;
        }
        if self.inbox_capacity == 0 || self.inbox_capacity > MAX_INBOX_CAPACITY {
            warn!(
                key = "inbox_capacity",
                value = self.inbox_capacity,
                default = defaults.inbox_capacity,
                "config: value out of range, using default"
            );
            self.inbox_capacity = defaults.inbox_capacity;
        }
        in_range(
            "unread_poll_interval_secs",
            &mut self.unread_poll_interval_secs,
            defaults.unread_poll_interval_secs,
            DAY_SECS,
        );
        in_range(
            "unread_lookback_secs",
            &mut self.unread_lookback_secs,
            defaults.unread_lookback_secs,
            MAX_UNREAD_SPAN_SECS,
        );
        in_range(
            "unread_forward_horizon_secs",
            &mut self.unread_forward_horizon_secs,
            defaults.unread_forward_horizon_secs,
            MAX_UNREAD_SPAN_SECS,
        );
    }

    /// Explicit `broker_url`, or `server_url` with its scheme swapped to
    /// `ws`/`wss` and the broker endpoint path.
    pub fn broker_url(&self) -> anyhow::Result<Url> {
        if let Some(raw) = &self.broker_url {
            return Url::parse(raw).with_context(|| format!("invalid broker url '{raw}'"));
        }

        let server = self.server_url.trim_end_matches('/');
        let ws = if let Some(rest) = server.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = server.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            bail!("server url '{server}' must use http or https");
        };
        Url::parse(&format!("{ws}{BROKER_PATH}"))
            .with_context(|| format!("invalid server url '{}'", self.server_url))
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }

    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            send_destination: self.send_destination.clone(),
            reconnect: ReconnectSettings {
                base_delay: Duration::from_millis(self.reconnect_base_ms),
                max_delay: Duration::from_millis(self.reconnect_max_ms),
                max_attempts: self.max_reconnect_attempts,
            },
        }
    }

    pub fn unread_settings(&self) -> UnreadSettings {
        UnreadSettings {
            poll_interval: Duration::from_secs(self.unread_poll_interval_secs),
            lookback: Duration::from_secs(self.unread_lookback_secs),
            forward_horizon: Duration::from_secs(self.unread_forward_horizon_secs),
        }
    }
}

/// Defaults, then `client.toml` in the working directory, then environment.
pub fn load_settings() -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(SETTINGS_FILE) {
        match ClientSettings::from_toml_str(&raw) {
            Ok(file_cfg) => settings = file_cfg,
            Err(err) => warn!(file = SETTINGS_FILE, error = %err, "config: ignoring settings file"),
        }
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

/// Plain names first, `APP__` names win.
pub fn apply_env(settings: &mut ClientSettings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = var("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(v) = var("CHAT_BROKER_URL") {
        settings.broker_url = Some(v);
    }
    if let Some(v) = var("APP__BROKER_URL") {
        settings.broker_url = Some(v);
    }

    if let Some(v) = parsed(&var, "APP__CONNECT_TIMEOUT_SECS") {
        settings.connect_timeout_secs = v;
    }
    if let Some(v) = parsed(&var, "APP__RECONNECT_BASE_MS") {
        settings.reconnect_base_ms = v;
    }
    if let Some(v) = parsed(&var, "APP__RECONNECT_MAX_MS") {
        settings.reconnect_max_ms = v;
    }
    if let Some(v) = parsed(&var, "APP__MAX_RECONNECT_ATTEMPTS") {
        settings.max_reconnect_attempts = Some(v);
    }
    if let Some(v) = parsed(&var, "APP__UNREAD_POLL_INTERVAL_SECS") {
        settings.unread_poll_interval_secs = v;
    }
    if let Some(v) = parsed(&var, "APP__UNREAD_LOOKBACK_SECS") {
        settings.unread_lookback_secs = v;
    }

    settings.sanitize();
}

fn in_range(key: &'static str, value: &mut u64, default: u64, max: u64) {
    if *value == 0 || *value > max {
        warn!(key, value = *value, default, "config: value out of range, using default");
        *value = default;
    }
}

fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "config: ignoring unparsable value");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
