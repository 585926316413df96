//! Lifecycle tuning and per-server configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ids::ServerId;

/// Settings key prefix for [`LifecycleConfig`] overrides stored by the app.
pub const SETTING_PREFIX: &str = "lifecycle.";

pub const DEFAULT_MAX_CONNECT_ATTEMPTS: u32 = 3;
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_STALE_MARGIN: Duration = Duration::from_secs(27);
pub const DEFAULT_VIEW_CACHE_CAPACITY: usize = 20;
pub const DEFAULT_PERSIST_DEBOUNCE: Duration = Duration::from_millis(300);
pub const DEFAULT_SESSION_PREFIX: &str = "vivy";

/// Whether terminals on the same server share one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPolicy {
    /// Every terminal owns its own connection handle.
    #[default]
    Dedicated,
    /// Terminals on one server reuse a live handle when one exists.
    PooledPerServer,
}

impl FromStr for ConnectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dedicated" => Ok(Self::Dedicated),
            "pooled" | "pooled_per_server" => Ok(Self::PooledPerServer),
            other => Err(format!("unknown connection policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub max_connect_attempts: u32,
    pub attempt_timeout: Duration,
    pub connect_backoff_base: Duration,
    /// Added on top of the worst-case connect duration when deciding that a
    /// pending start has been abandoned.
    pub stale_margin: Duration,
    pub view_cache_capacity: usize,
    pub persist_debounce: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub connection_policy: ConnectionPolicy,
    pub session_prefix: String,
    pub default_cols: u16,
    pub default_rows: u16,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_connect_attempts: DEFAULT_MAX_CONNECT_ATTEMPTS,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            connect_backoff_base: DEFAULT_BACKOFF_BASE,
            stale_margin: DEFAULT_STALE_MARGIN,
            view_cache_capacity: DEFAULT_VIEW_CACHE_CAPACITY,
            persist_debounce: DEFAULT_PERSIST_DEBOUNCE,
            reconnect_attempts: 3,
            reconnect_base_delay: DEFAULT_BACKOFF_BASE,
            connection_policy: ConnectionPolicy::Dedicated,
            session_prefix: DEFAULT_SESSION_PREFIX.to_string(),
            default_cols: 80,
            default_rows: 24,
        }
    }
}

impl LifecycleConfig {
    /// Sum of the delays slept between connect attempts of one connect call.
    pub fn total_connect_backoff(&self) -> Duration {
        (2..=self.max_connect_attempts)
            .map(|attempt| backoff_delay(self.connect_backoff_base, attempt))
            .sum()
    }

    /// Age after which a pending start is presumed abandoned.
    ///
    /// Derived from the connect budget so that a live attempt can never be
    /// mistaken for a stuck one: attempts x timeout + backoff + margin.
    pub fn stale_start_threshold(&self) -> Duration {
        self.attempt_timeout * self.max_connect_attempts
            + self.total_connect_backoff()
            + self.stale_margin
    }

    /// Apply one `lifecycle.*` setting. Returns false for unknown keys or
    /// unparseable values, leaving the config unchanged.
    pub fn apply_setting(&mut self, key: &str, value: &str) -> bool {
        let Some(name) = key.strip_prefix(SETTING_PREFIX) else {
            return false;
        };
        let value = value.trim();
        let millis = || value.parse::<u64>().ok().map(Duration::from_millis);

        match name {
            "max_connect_attempts" => set_parsed(&mut self.max_connect_attempts, value.parse().ok().filter(|n| *n > 0)),
            "attempt_timeout_ms" => set_parsed(&mut self.attempt_timeout, millis()),
            "connect_backoff_base_ms" => set_parsed(&mut self.connect_backoff_base, millis()),
            "stale_margin_ms" => set_parsed(&mut self.stale_margin, millis()),
            "view_cache_capacity" => set_parsed(&mut self.view_cache_capacity, value.parse().ok().filter(|n| *n > 0)),
            "persist_debounce_ms" => set_parsed(&mut self.persist_debounce, millis()),
            "reconnect_attempts" => set_parsed(&mut self.reconnect_attempts, value.parse().ok()),
            "reconnect_base_delay_ms" => set_parsed(&mut self.reconnect_base_delay, millis()),
            "connection_policy" => set_parsed(&mut self.connection_policy, value.parse().ok()),
            "session_prefix" if !value.is_empty() => {
                self.session_prefix = value.to_string();
                true
            }
            _ => false,
        }
    }
}

fn set_parsed<T>(slot: &mut T, value: Option<T>) -> bool {
    match value {
        Some(v) => {
            *slot = v;
            true
        }
        None => false,
    }
}

/// Delay slept before attempt `attempt` (1-based): none before the first,
/// then `base * 2^(attempt - 2)`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    if attempt < 2 {
        return Duration::ZERO;
    }
    let exponent = (attempt - 2).min(16);
    base.saturating_mul(1u32 << exponent)
}

/// How a server decides which remote multiplexer session a terminal attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachBehavior {
    #[default]
    AlwaysCreateManaged,
    AskEveryTime,
    Skip,
    UseRememberedName,
}

impl AttachBehavior {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlwaysCreateManaged => "always_create_managed",
            Self::AskEveryTime => "ask_every_time",
            Self::Skip => "skip",
            Self::UseRememberedName => "use_remembered_name",
        }
    }
}

impl FromStr for AttachBehavior {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always_create_managed" | "managed" => Ok(Self::AlwaysCreateManaged),
            "ask_every_time" | "ask" => Ok(Self::AskEveryTime),
            "skip" => Ok(Self::Skip),
            "use_remembered_name" | "remembered" => Ok(Self::UseRememberedName),
            other => Err(format!("unknown attach behavior '{other}'")),
        }
    }
}

/// A remote host the user can open terminals on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: ServerId,
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub tmux_enabled: bool,
    #[serde(default)]
    pub attach_behavior: AttachBehavior,
    #[serde(default)]
    pub remembered_session: Option<String>,
    #[serde(default)]
    pub startup_command: Option<String>,
    #[serde(default)]
    pub auto_install_tmux: bool,
}

fn default_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: ServerId::new(),
            name: name.into(),
            host: host.into(),
            port: default_port(),
            username: None,
            identity_file: None,
            tmux_enabled: true,
            attach_behavior: AttachBehavior::default(),
            remembered_session: None,
            startup_command: None,
            auto_install_tmux: false,
        }
    }

    /// `user@host` or bare `host`, as passed to ssh.
    pub fn destination(&self) -> String {
        match &self.username {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_stale_threshold_is_two_minutes() {
        let config = LifecycleConfig::default();
        assert_eq!(config.total_connect_backoff(), Duration::from_secs(3));
        assert_eq!(config.stale_start_threshold(), Duration::from_secs(120));
    }

    #[test]
    fn test_stale_threshold_tracks_attempt_budget() {
        let mut config = LifecycleConfig::default();
        config.max_connect_attempts = 5;
        config.attempt_timeout = Duration::from_secs(10);
        // 5 * 10 + (1 + 2 + 4 + 8) + 27
        assert_eq!(config.stale_start_threshold(), Duration::from_secs(92));
    }

    #[test]
    fn test_backoff_delay() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::ZERO);
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 4), Duration::from_secs(4));
    }

    #[test]
    fn test_apply_setting() {
        let mut config = LifecycleConfig::default();
        assert!(config.apply_setting("lifecycle.view_cache_capacity", "8"));
        assert!(config.apply_setting("lifecycle.attempt_timeout_ms", "5000"));
        assert!(config.apply_setting("lifecycle.connection_policy", "pooled"));
        assert_eq!(config.view_cache_capacity, 8);
        assert_eq!(config.attempt_timeout, Duration::from_secs(5));
        assert_eq!(config.connection_policy, ConnectionPolicy::PooledPerServer);

        assert!(!config.apply_setting("lifecycle.view_cache_capacity", "0"));
        assert!(!config.apply_setting("lifecycle.bogus", "1"));
        assert!(!config.apply_setting("analysis_max_concurrency", "2"));
        assert_eq!(config.view_cache_capacity, 8);
    }

    #[test]
    fn test_attach_behavior_round_trip_names() {
        for behavior in [
            AttachBehavior::AlwaysCreateManaged,
            AttachBehavior::AskEveryTime,
            AttachBehavior::Skip,
            AttachBehavior::UseRememberedName,
        ] {
            assert_eq!(behavior.as_str().parse::<AttachBehavior>(), Ok(behavior));
        }
        assert!("sometimes".parse::<AttachBehavior>().is_err());
    }

    #[test]
    fn test_server_destination() {
        let mut server = ServerConfig::new("prod", "example.com");
        assert_eq!(server.destination(), "example.com");
        server.username = Some("deploy".into());
        assert_eq!(server.destination(), "deploy@example.com");
    }

    #[test]
    fn test_server_config_tolerates_missing_fields() {
        let json = format!(
            r#"{{"id":"{}","name":"box","host":"10.0.0.2"}}"#,
            ServerId::new()
        );
        let server: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(server.port, 22);
        assert!(server.tmux_enabled);
        assert_eq!(server.attach_behavior, AttachBehavior::AlwaysCreateManaged);
    }
}
