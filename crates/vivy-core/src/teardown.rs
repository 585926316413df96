//! Best-effort cleanup decided on the serialization domain and executed off it.

use std::sync::Arc;

use crate::multiplexer::MultiplexerHelper;
use crate::remote::{ConnectionHandle, Credentials, ShellId};

#[derive(Debug)]
pub struct KillSession {
    pub handle: ConnectionHandle,
    pub name: String,
    /// Set when `handle` is a fresh client: connect first, disconnect after.
    pub connect: Option<Credentials>,
}

impl KillSession {
    pub fn on(handle: ConnectionHandle, name: impl Into<String>) -> Self {
        Self {
            handle,
            name: name.into(),
            connect: None,
        }
    }

    async fn run(self, helper: &dyn MultiplexerHelper) {
        let client = self.handle.client();
        if let Some(credentials) = &self.connect {
            if let Err(e) = client.connect(credentials).await {
                log::warn!("cannot reach server to kill session {}: {e}", self.name);
                return;
            }
        }
        match helper.kill_session(&self.name, &self.handle).await {
            Ok(()) => log::info!("killed remote session {}", self.name),
            Err(e) => log::warn!("failed to kill remote session {}: {e}", self.name),
        }
        if self.connect.is_some() {
            client.disconnect().await;
        }
    }
}

/// Remote resources to release, in the order they are released.
#[derive(Debug, Default)]
pub struct Teardown {
    pub kill_sessions: Vec<KillSession>,
    pub close_shells: Vec<(ConnectionHandle, ShellId)>,
    pub disconnect: Vec<ConnectionHandle>,
}

impl Teardown {
    pub fn is_empty(&self) -> bool {
        self.kill_sessions.is_empty() && self.close_shells.is_empty() && self.disconnect.is_empty()
    }

    pub fn merge(&mut self, other: Teardown) {
        self.kill_sessions.extend(other.kill_sessions);
        self.close_shells.extend(other.close_shells);
        for handle in other.disconnect {
            self.disconnect_once(handle);
        }
    }

    pub fn kill(&mut self, kill: KillSession) {
        self.kill_sessions.push(kill);
    }

    pub fn close_shell(&mut self, handle: ConnectionHandle, shell: ShellId) {
        self.close_shells.push((handle, shell));
    }

    pub fn disconnect_once(&mut self, handle: ConnectionHandle) {
        if !self.disconnect.contains(&handle) {
            self.disconnect.push(handle);
        }
    }

    /// Kill, then close, then disconnect. Failures are logged and skipped.
    pub async fn run(self, helper: Arc<dyn MultiplexerHelper>) {
        for kill in self.kill_sessions {
            kill.run(helper.as_ref()).await;
        }
        for (handle, shell) in self.close_shells {
            if let Err(e) = handle.client().close_shell(shell).await {
                log::warn!("failed to close shell {shell} on connection {}: {e}", handle.id());
            }
        }
        for handle in self.disconnect {
            log::debug!("disconnecting connection {}", handle.id());
            handle.client().disconnect().await;
        }
    }

    /// Run on a background task unless there is nothing to do.
    pub fn spawn(self, helper: Arc<dyn MultiplexerHelper>) -> Option<tokio::task::JoinHandle<()>> {
        if self.is_empty() {
            return None;
        }
        Some(tokio::spawn(self.run(helper)))
    }
}
