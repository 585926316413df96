//! In-memory collaborators for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::error::{RemoteError, ServiceError};
use crate::ids::ServerId;
use crate::multiplexer::{managed_prefix, MultiplexerHelper, RemoteSession};
use crate::remote::{
    ConnectionHandle, Credentials, ExecOutput, RemoteClient, RemoteClientFactory, ShellId,
    ShellSession,
};
use crate::snapshot::{ServerStore, Snapshot, SnapshotStore};
use crate::state::ActiveTransport;
use crate::view_cache::TerminalView;

#[derive(Default)]
pub struct FakeClient {
    connected: AtomicBool,
    hang_connect: AtomicBool,
    connect_script: Mutex<VecDeque<Result<(), RemoteError>>>,
    shell_script: Mutex<VecDeque<RemoteError>>,
    pub connect_calls: AtomicUsize,
    pub disconnects: AtomicUsize,
    next_shell: AtomicU64,
    shells: Mutex<HashMap<ShellId, mpsc::Sender<Vec<u8>>>>,
    pub closed_shells: Mutex<Vec<ShellId>>,
    pub writes: Mutex<Vec<(ShellId, Vec<u8>)>>,
    pub startup_commands: Mutex<Vec<Option<String>>>,
}

impl FakeClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connect results consumed in order; afterwards connects succeed.
    pub fn with_connect_results(results: Vec<Result<(), RemoteError>>) -> Arc<Self> {
        let client = Self::default();
        *client.connect_script.lock().unwrap() = results.into();
        Arc::new(client)
    }

    /// A client whose connect never completes.
    pub fn hanging() -> Arc<Self> {
        let client = Self::default();
        client.hang_connect.store(true, Ordering::SeqCst);
        Arc::new(client)
    }

    pub fn fail_next_shell(&self, error: RemoteError) {
        self.shell_script.lock().unwrap().push_back(error);
    }

    pub fn handle(self: &Arc<Self>, server: ServerId) -> ConnectionHandle {
        ConnectionHandle::new(server, self.clone())
    }

    pub fn open_shells(&self) -> Vec<ShellId> {
        let mut ids: Vec<ShellId> = self.shells.lock().unwrap().keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn emit(&self, shell: ShellId, data: &[u8]) {
        let tx = self.shells.lock().unwrap().get(&shell).cloned();
        if let Some(tx) = tx {
            let _ = tx.send(data.to_vec()).await;
        }
    }

    /// Simulate the remote end closing a shell.
    pub fn hang_up(&self, shell: ShellId) {
        self.shells.lock().unwrap().remove(&shell);
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteClient for FakeClient {
    async fn connect(&self, _credentials: &Credentials) -> Result<(), RemoteError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_connect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let next = self.connect_script.lock().unwrap().pop_front();
        let result = next.unwrap_or(Ok(()));
        if result.is_ok() {
            self.connected.store(true, Ordering::SeqCst);
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn start_shell(
        &self,
        _cols: u16,
        _rows: u16,
        startup_command: Option<&str>,
    ) -> Result<ShellSession, RemoteError> {
        if !self.is_connected() {
            return Err(RemoteError::NotConnected);
        }
        if let Some(error) = self.shell_script.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.startup_commands
            .lock()
            .unwrap()
            .push(startup_command.map(str::to_string));
        let shell_id = self.next_shell.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(16);
        self.shells.lock().unwrap().insert(shell_id, tx);
        Ok(ShellSession {
            shell_id,
            output: rx,
            transport: ActiveTransport::Primary,
            fallback_reason: None,
        })
    }

    async fn write(&self, shell: ShellId, data: &[u8]) -> Result<(), RemoteError> {
        self.writes.lock().unwrap().push((shell, data.to_vec()));
        Ok(())
    }

    async fn resize(&self, _shell: ShellId, _cols: u16, _rows: u16) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn close_shell(&self, shell: ShellId) -> Result<(), RemoteError> {
        self.shells.lock().unwrap().remove(&shell);
        self.closed_shells.lock().unwrap().push(shell);
        Ok(())
    }

    async fn exec(&self, _command: &str) -> Result<ExecOutput, RemoteError> {
        Ok(ExecOutput::default())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.shells.lock().unwrap().clear();
    }
}

/// Hands out queued clients first, then fresh default ones.
#[derive(Default)]
pub struct FakeFactory {
    queued: Mutex<VecDeque<Arc<FakeClient>>>,
    pub created: Mutex<Vec<Arc<FakeClient>>>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queue(&self, client: Arc<FakeClient>) {
        self.queued.lock().unwrap().push_back(client);
    }

    pub fn client(&self, index: usize) -> Arc<FakeClient> {
        self.created.lock().unwrap()[index].clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

impl RemoteClientFactory for FakeFactory {
    fn create(&self, _server: &ServerConfig) -> Arc<dyn RemoteClient> {
        let client = self
            .queued
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(FakeClient::new);
        self.created.lock().unwrap().push(client.clone());
        client
    }
}

pub struct FakeMultiplexer {
    pub available: AtomicBool,
    /// Remote queries never answer.
    pub hang_queries: AtomicBool,
    pub sessions: Mutex<Vec<RemoteSession>>,
    pub paths: Mutex<HashMap<String, String>>,
    pub killed: Mutex<Vec<String>>,
    pub scripts: Mutex<Vec<String>>,
    pub cleanups: Mutex<Vec<(String, HashSet<String>)>>,
    pub list_calls: AtomicUsize,
    prefix: String,
}

impl FakeMultiplexer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            available: AtomicBool::new(true),
            hang_queries: AtomicBool::new(false),
            sessions: Mutex::new(Vec::new()),
            paths: Mutex::new(HashMap::new()),
            killed: Mutex::new(Vec::new()),
            scripts: Mutex::new(Vec::new()),
            cleanups: Mutex::new(Vec::new()),
            list_calls: AtomicUsize::new(0),
            prefix: "vivy".to_string(),
        })
    }

    pub fn with_sessions(sessions: &[(&str, u32)]) -> Arc<Self> {
        let fake = Self::new();
        *fake.sessions.lock().unwrap() = sessions
            .iter()
            .map(|(name, attached)| RemoteSession {
                name: name.to_string(),
                attached_clients: *attached,
                windows: 1,
            })
            .collect();
        fake
    }

    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().unwrap().clone()
    }
}

#[async_trait]
impl MultiplexerHelper for FakeMultiplexer {
    async fn is_available(&self, _handle: &ConnectionHandle) -> Result<bool, RemoteError> {
        if self.hang_queries.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self.available.load(Ordering::SeqCst))
    }

    async fn list_sessions(
        &self,
        _handle: &ConnectionHandle,
    ) -> Result<Vec<RemoteSession>, RemoteError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_queries.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self.sessions.lock().unwrap().clone())
    }

    async fn current_path(
        &self,
        session: &str,
        _handle: &ConnectionHandle,
    ) -> Result<Option<String>, RemoteError> {
        Ok(self.paths.lock().unwrap().get(session).cloned())
    }

    async fn prepare_config(&self, _handle: &ConnectionHandle) -> Result<(), RemoteError> {
        Ok(())
    }

    fn attach_command(&self, name: &str, working_directory: Option<&str>) -> String {
        match working_directory {
            Some(dir) => format!("attach-or-create {name} in {dir}"),
            None => format!("attach-or-create {name}"),
        }
    }

    fn attach_existing_command(&self, name: &str, _working_directory: Option<&str>) -> String {
        format!("attach {name}")
    }

    fn install_and_attach_script(&self, name: &str, _working_directory: Option<&str>) -> String {
        format!("install then attach {name}")
    }

    async fn send_script(
        &self,
        script: &str,
        _handle: &ConnectionHandle,
        _shell: ShellId,
    ) -> Result<(), RemoteError> {
        self.scripts.lock().unwrap().push(script.to_string());
        Ok(())
    }

    async fn kill_session(
        &self,
        name: &str,
        _handle: &ConnectionHandle,
    ) -> Result<(), RemoteError> {
        self.killed.lock().unwrap().push(name.to_string());
        self.sessions.lock().unwrap().retain(|s| s.name != name);
        Ok(())
    }

    async fn cleanup_detached_sessions(
        &self,
        device_id: &str,
        keep: &HashSet<String>,
        _handle: &ConnectionHandle,
    ) -> Result<usize, RemoteError> {
        self.cleanups
            .lock()
            .unwrap()
            .push((device_id.to_string(), keep.clone()));
        let own = managed_prefix(&self.prefix, device_id);
        let mut sessions = self.sessions.lock().unwrap();
        let before = sessions.len();
        sessions.retain(|s| !s.name.starts_with(&own) || s.is_attached() || keep.contains(&s.name));
        Ok(before - sessions.len())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    pub snapshot: Mutex<Option<Snapshot>>,
    pub saves: AtomicUsize,
    pub remembered: Mutex<Vec<(ServerId, Option<String>)>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self) -> Result<Option<Snapshot>, ServiceError> {
        Ok(self.snapshot.lock().unwrap().clone())
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), ServiceError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        *self.snapshot.lock().unwrap() = Some(snapshot.clone());
        Ok(())
    }
}

impl ServerStore for MemoryStore {
    fn remember_session(&self, server: ServerId, name: Option<&str>) -> Result<(), ServiceError> {
        self.remembered
            .lock()
            .unwrap()
            .push((server, name.map(str::to_string)));
        Ok(())
    }
}

/// A view whose attachment and release can be observed from the test.
#[derive(Clone, Default)]
pub struct SpyView {
    pub attached: Arc<AtomicBool>,
    pub released: Arc<AtomicBool>,
}

impl SpyView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attached() -> Self {
        let view = Self::default();
        view.attached.store(true, Ordering::SeqCst);
        view
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl TerminalView for SpyView {
    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}
