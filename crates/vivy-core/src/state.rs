//! Per-terminal observable state.
//!
//! Only the lifecycle manager mutates these values. The UI layer receives
//! clones through [`crate::service::SessionEvent::StateChanged`].

use serde::{Deserialize, Serialize};

use crate::ids::{ServerId, TerminalId};

/// Connection lifecycle of one terminal.
///
/// ```text
/// Idle --connect--> Connecting --success--> Connected
/// Connecting --all attempts fail--> Failed
/// Connected --remote EOF/error--> Disconnected
/// Disconnected --retry--> Connecting
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    /// Attempts 2..N of a single connect call.
    Reconnecting { attempt: u32 },
    Disconnected,
    Failed { message: String },
}

impl ConnectionState {
    /// True while a connect call is running for this terminal.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting { .. })
    }

    /// True when the terminal holds, or is acquiring, a live remote shell.
    pub fn is_active(&self) -> bool {
        self.is_connecting() || matches!(self, Self::Connected)
    }

    /// States that render a retry affordance in the UI.
    pub fn can_retry(&self) -> bool {
        matches!(self, Self::Idle | Self::Disconnected | Self::Failed { .. })
    }
}

/// Status of the remote multiplexer session backing a terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiplexerStatus {
    #[default]
    Unknown,
    /// Multiplexing disabled for the server, or skipped for this terminal.
    Off,
    /// Enabled but not installed on the remote host.
    Missing,
    /// The install-and-attach script is running in the shell.
    Installing,
    /// Attached and in use by this terminal.
    Foreground,
    /// Detached but presumed alive on the remote host.
    Background,
}

impl MultiplexerStatus {
    /// True when a remote multiplexer session may exist for the terminal.
    pub fn has_remote_session(self) -> bool {
        matches!(self, Self::Foreground | Self::Background | Self::Installing)
    }
}

/// Which wire variant actually carries the terminal's shell.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveTransport {
    #[default]
    Primary,
    Fallback,
    FallbackReason(String),
}

impl ActiveTransport {
    /// Fold an optional fallback reason reported by the remote client into the
    /// transport value shown to the user.
    pub fn with_reason(self, reason: Option<String>) -> Self {
        match (self, reason) {
            (Self::Primary, _) => Self::Primary,
            (_, Some(reason)) => Self::FallbackReason(reason),
            (other, None) => other,
        }
    }

    pub fn is_fallback(&self) -> bool {
        !matches!(self, Self::Primary)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalState {
    pub connection: ConnectionState,
    pub multiplexer: MultiplexerStatus,
    pub transport: ActiveTransport,
    pub working_directory: Option<String>,
    /// Terminal this one was split or duplicated from. Non-owning.
    pub seed: Option<TerminalId>,
    pub server: ServerId,
}

impl TerminalState {
    pub fn new(server: ServerId, multiplexer_enabled: bool) -> Self {
        Self {
            connection: ConnectionState::Idle,
            multiplexer: if multiplexer_enabled {
                MultiplexerStatus::Unknown
            } else {
                MultiplexerStatus::Off
            },
            transport: ActiveTransport::Primary,
            working_directory: None,
            seed: None,
            server,
        }
    }
}
