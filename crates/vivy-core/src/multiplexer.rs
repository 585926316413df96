//! Contract with the remote multiplexer helper, plus managed session naming.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::ids::TerminalId;
use crate::remote::{ConnectionHandle, ShellId};

/// One session reported by the remote multiplexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSession {
    pub name: String,
    pub attached_clients: u32,
    pub windows: u32,
}

impl RemoteSession {
    pub fn is_attached(&self) -> bool {
        self.attached_clients > 0
    }
}

#[async_trait]
pub trait MultiplexerHelper: Send + Sync {
    async fn is_available(&self, handle: &ConnectionHandle) -> Result<bool, RemoteError>;

    async fn list_sessions(
        &self,
        handle: &ConnectionHandle,
    ) -> Result<Vec<RemoteSession>, RemoteError>;

    async fn current_path(
        &self,
        session: &str,
        handle: &ConnectionHandle,
    ) -> Result<Option<String>, RemoteError>;

    async fn prepare_config(&self, handle: &ConnectionHandle) -> Result<(), RemoteError>;

    /// Shell command that attaches to `name`, creating it if needed.
    fn attach_command(&self, name: &str, working_directory: Option<&str>) -> String;

    /// Shell command that attaches to a session the user already owns.
    fn attach_existing_command(&self, name: &str, working_directory: Option<&str>) -> String;

    /// Script typed into a plain shell to install the multiplexer and attach.
    fn install_and_attach_script(&self, name: &str, working_directory: Option<&str>) -> String;

    async fn send_script(
        &self,
        script: &str,
        handle: &ConnectionHandle,
        shell: ShellId,
    ) -> Result<(), RemoteError>;

    async fn kill_session(&self, name: &str, handle: &ConnectionHandle)
        -> Result<(), RemoteError>;

    /// Remove detached sessions created by this device that are not in `keep`.
    /// Returns how many were removed.
    async fn cleanup_detached_sessions(
        &self,
        device_id: &str,
        keep: &HashSet<String>,
        handle: &ConnectionHandle,
    ) -> Result<usize, RemoteError>;
}

/// Prefix shared by every managed session a device creates.
pub fn managed_prefix(prefix: &str, device_id: &str) -> String {
    format!("{prefix}_{}_", short_device(device_id))
}

fn short_device(device_id: &str) -> String {
    device_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Deterministic names for managed sessions.
///
/// A managed name depends only on the device and the terminal identity, so a
/// restarted client finds its sessions again without any stored state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionNaming {
    prefix: String,
    device_id: String,
}

impl SessionNaming {
    pub fn new(prefix: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            device_id: device_id.into(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn managed_name(&self, terminal: TerminalId) -> String {
        format!("{}{terminal}", managed_prefix(&self.prefix, &self.device_id))
    }

    /// Created by this tool on any device.
    pub fn is_managed(&self, name: &str) -> bool {
        name.starts_with(&format!("{}_", self.prefix))
    }

    /// Created by this tool on this device.
    pub fn is_own(&self, name: &str) -> bool {
        name.starts_with(&managed_prefix(&self.prefix, &self.device_id))
    }
}
