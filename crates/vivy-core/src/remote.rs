//! Contract with the remote connection collaborator.
//!
//! The core never speaks a wire protocol itself. A [`RemoteClient`] owns one
//! connection to one host and can host any number of interactive shells on
//! it. [`ConnectionHandle`] wraps a client with an identity so the registry
//! can tell two attempts apart even when they target the same server.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::error::RemoteError;
use crate::ids::ServerId;
use crate::state::ActiveTransport;

/// Identifier of a shell hosted on a connection, unique per client.
pub type ShellId = u64;

/// Identity of a connection handle, unique per process.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Whatever the local agent or client configuration provides.
    Agent,
    IdentityFile(PathBuf),
}

impl Credentials {
    pub fn for_server(server: &ServerConfig) -> Self {
        match &server.identity_file {
            Some(path) => Self::IdentityFile(path.clone()),
            None => Self::Agent,
        }
    }
}

/// A freshly started remote shell.
pub struct ShellSession {
    pub shell_id: ShellId,
    /// Remote output, chunk by chunk. Closed on remote EOF.
    pub output: mpsc::Receiver<Vec<u8>>,
    pub transport: ActiveTransport,
    pub fallback_reason: Option<String>,
}

impl fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellSession")
            .field("shell_id", &self.shell_id)
            .field("transport", &self.transport)
            .field("fallback_reason", &self.fallback_reason)
            .finish()
    }
}

/// Result of a one-shot remote command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> Result<(), RemoteError>;

    fn is_connected(&self) -> bool;

    async fn start_shell(
        &self,
        cols: u16,
        rows: u16,
        startup_command: Option<&str>,
    ) -> Result<ShellSession, RemoteError>;

    async fn write(&self, shell: ShellId, data: &[u8]) -> Result<(), RemoteError>;

    async fn resize(&self, shell: ShellId, cols: u16, rows: u16) -> Result<(), RemoteError>;

    async fn close_shell(&self, shell: ShellId) -> Result<(), RemoteError>;

    /// Run a non-interactive command on the remote host.
    ///
    /// A non-zero exit status is reported in [`ExecOutput`], not as an error.
    async fn exec(&self, command: &str) -> Result<ExecOutput, RemoteError>;

    /// Tear down the connection and every shell on it. Best effort.
    async fn disconnect(&self);
}

/// Builds unconnected clients for a server.
pub trait RemoteClientFactory: Send + Sync {
    fn create(&self, server: &ServerConfig) -> Arc<dyn RemoteClient>;
}

/// A client plus the identity the registry compares by.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    server: ServerId,
    client: Arc<dyn RemoteClient>,
}

impl ConnectionHandle {
    pub fn new(server: ServerId, client: Arc<dyn RemoteClient>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            server,
            client,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn server(&self) -> ServerId {
        self.server
    }

    pub fn client(&self) -> &Arc<dyn RemoteClient> {
        &self.client
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("server", &self.server)
            .field("connected", &self.client.is_connected())
            .finish()
    }
}
