//! Terminal collection and lifecycle decisions.
//!
//! [`SessionManager`] is plain synchronous state owned by the service actor.
//! It never awaits. Remote work it decides on comes out as a [`ConnectJob`]
//! to spawn or as a [`Teardown`] to run, and observable changes come out as
//! [`Notice`]s. Draining both after every step is the actor's job.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::{ConnectionPolicy, LifecycleConfig, ServerConfig};
use crate::connect::{ConnectJob, StartedShell};
use crate::error::{RemoteError, ServiceError};
use crate::ids::{ServerId, TerminalId};
use crate::layout::{LayoutNode, SplitDirection, TabLayout};
use crate::multiplexer::SessionNaming;
use crate::prompt::{AttachPrompt, AttachSelection};
use crate::registry::{RegisterOutcome, ShellRegistry, Unregistered};
use crate::remote::{ConnectionHandle, ConnectionId, Credentials, RemoteClientFactory, ShellId};
use crate::resolver::{AttachPlan, AttachResolver};
use crate::snapshot::{SelectedView, ServerSelectionSnapshot, Snapshot, TerminalSnapshot, SNAPSHOT_VERSION};
use crate::state::{ActiveTransport, ConnectionState, MultiplexerStatus, TerminalState};
use crate::teardown::{KillSession, Teardown};
use crate::view_cache::{TerminalView, ViewCache};

#[derive(Debug, Clone, Serialize)]
pub struct TerminalRecord {
    pub id: TerminalId,
    pub server: ServerId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub auto_reconnect: bool,
    pub state: TerminalState,
    /// Disconnected by a background transition rather than by the remote.
    pub suspended: bool,
}

impl TerminalRecord {
    fn new(id: TerminalId, server: &ServerConfig) -> Self {
        let now = Utc::now();
        Self {
            id,
            server: server.id,
            title: server.name.clone(),
            created_at: now,
            last_activity: now,
            auto_reconnect: true,
            state: TerminalState::new(server.id, server.tmux_enabled),
            suspended: false,
        }
    }

    fn to_snapshot(&self) -> TerminalSnapshot {
        TerminalSnapshot {
            id: self.id,
            server: self.server,
            title: self.title.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity,
            auto_reconnect: self.auto_reconnect,
            seed: self.state.seed,
            working_directory: self.state.working_directory.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ServerSelection {
    pub terminal: Option<TerminalId>,
    pub view: SelectedView,
}

/// Something observers should hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    StateChanged(TerminalId),
    Closed(TerminalId),
    Evicted(TerminalId),
    SelectionChanged(Option<TerminalId>),
}

/// How a failed connect call ends for its terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    /// The terminal is Failed; show the message in its output.
    Failed(String),
    /// One reconnect attempt failed. The terminal is back to Disconnected and
    /// the reconnection actor decides whether to try again.
    ReconnectAttempt,
}

/// A remembered session name to persist for a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RememberSession {
    pub server: ServerId,
    pub name: String,
}

pub struct SessionManager {
    config: LifecycleConfig,
    factory: Arc<dyn RemoteClientFactory>,
    servers: HashMap<ServerId, ServerConfig>,
    terminals: HashMap<TerminalId, TerminalRecord>,
    order: Vec<TerminalId>,
    tabs: Vec<TabLayout>,
    selections: HashMap<ServerId, ServerSelection>,
    active: Option<TerminalId>,
    registry: ShellRegistry,
    resolver: AttachResolver,
    views: ViewCache<Box<dyn TerminalView>>,
    /// In-flight connect work, one token per terminal.
    cancels: HashMap<TerminalId, CancellationToken>,
    reconnects: HashMap<TerminalId, CancellationToken>,
    /// Terminals whose in-flight start belongs to a reconnection actor.
    reconnect_starts: HashSet<TerminalId>,
    teardown: Teardown,
    notices: Vec<Notice>,
    dirty: bool,
}

impl SessionManager {
    pub fn new(
        config: LifecycleConfig,
        naming: SessionNaming,
        factory: Arc<dyn RemoteClientFactory>,
        servers: Vec<ServerConfig>,
    ) -> Self {
        Self {
            registry: ShellRegistry::new(config.stale_start_threshold()),
            views: ViewCache::new(config.view_cache_capacity),
            resolver: AttachResolver::new(naming),
            config,
            factory,
            servers: servers.into_iter().map(|s| (s.id, s)).collect(),
            terminals: HashMap::new(),
            order: Vec::new(),
            tabs: Vec::new(),
            selections: HashMap::new(),
            active: None,
            cancels: HashMap::new(),
            reconnects: HashMap::new(),
            reconnect_starts: HashSet::new(),
            teardown: Teardown::default(),
            notices: Vec::new(),
            dirty: false,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn server(&self, id: ServerId) -> Option<&ServerConfig> {
        self.servers.get(&id)
    }

    pub fn upsert_server(&mut self, server: ServerConfig) {
        self.servers.insert(server.id, server);
    }

    pub fn terminal(&self, id: TerminalId) -> Option<&TerminalRecord> {
        self.terminals.get(&id)
    }

    pub fn state(&self, id: TerminalId) -> Option<&TerminalState> {
        self.terminals.get(&id).map(|r| &r.state)
    }

    /// All terminals in display order.
    pub fn terminals(&self) -> Vec<&TerminalRecord> {
        self.order.iter().filter_map(|id| self.terminals.get(id)).collect()
    }

    /// Terminals on `server` in display order.
    pub fn server_terminals(&self, server: ServerId) -> Vec<TerminalId> {
        self.order
            .iter()
            .copied()
            .filter(|id| self.terminals.get(id).is_some_and(|r| r.server == server))
            .collect()
    }

    pub fn tabs(&self) -> &[TabLayout] {
        &self.tabs
    }

    pub fn active(&self) -> Option<TerminalId> {
        self.active
    }

    pub fn selection(&self, server: ServerId) -> Option<ServerSelection> {
        self.selections.get(&server).copied()
    }

    pub fn registry(&self) -> &ShellRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &AttachResolver {
        &self.resolver
    }

    pub fn views(&self) -> &ViewCache<Box<dyn TerminalView>> {
        &self.views
    }

    /// A connect worker, or the output pump it turns into, is running for `id`.
    pub fn has_worker(&self, id: TerminalId) -> bool {
        self.cancels.contains_key(&id)
    }

    /// Whether anything at all is still held for `id`.
    pub fn has_residual_state(&self, id: TerminalId) -> bool {
        self.terminals.contains_key(&id)
            || self.registry.registration(id).is_some()
            || self.registry.pending(id).is_some()
            || self.resolver.has_state(id)
            || self.views.contains(id)
            || self.cancels.contains_key(&id)
            || self.reconnects.contains_key(&id)
            || self.reconnect_starts.contains(&id)
    }

    pub fn take_teardown(&mut self) -> Teardown {
        for handle in self.registry.take_orphaned() {
            self.teardown.disconnect_once(handle);
        }
        std::mem::take(&mut self.teardown)
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// True once per batch of persisted-field changes.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    // ---- collection -------------------------------------------------------

    pub fn open_terminal(&mut self, server: ServerId) -> Result<TerminalId, ServiceError> {
        let config = self
            .servers
            .get(&server)
            .ok_or(ServiceError::UnknownServer(server))?;
        let record = TerminalRecord::new(TerminalId::new(), config);
        let id = record.id;
        log::info!("opened terminal {id} on {}", record.title);

        self.terminals.insert(id, record);
        self.order.push(id);
        self.tabs.push(TabLayout::new(server, id));
        self.notices.push(Notice::StateChanged(id));
        self.select(id);
        Ok(id)
    }

    pub fn split_terminal(
        &mut self,
        parent: TerminalId,
        direction: SplitDirection,
    ) -> Result<TerminalId, ServiceError> {
        let record = self.seeded_record(parent)?;
        let id = record.id;
        let tab = self
            .tabs
            .iter_mut()
            .find(|t| t.contains(parent))
            .ok_or(ServiceError::UnknownTerminal(parent))?;
        tab.split(parent, id, direction);

        self.insert_after(parent, record);
        self.select(id);
        Ok(id)
    }

    pub fn duplicate_terminal(&mut self, source: TerminalId) -> Result<TerminalId, ServiceError> {
        let record = self.seeded_record(source)?;
        let id = record.id;
        let tab = TabLayout::new(record.server, id);
        match self.tabs.iter().position(|t| t.contains(source)) {
            Some(index) => self.tabs.insert(index + 1, tab),
            None => self.tabs.push(tab),
        }

        self.insert_after(source, record);
        self.select(id);
        Ok(id)
    }

    fn seeded_record(&self, parent: TerminalId) -> Result<TerminalRecord, ServiceError> {
        let source = self
            .terminals
            .get(&parent)
            .ok_or(ServiceError::UnknownTerminal(parent))?;
        let server = self
            .servers
            .get(&source.server)
            .ok_or(ServiceError::UnknownServer(source.server))?;
        let mut record = TerminalRecord::new(TerminalId::new(), server);
        record.auto_reconnect = source.auto_reconnect;
        record.state.seed = Some(parent);
        record.state.working_directory = source.state.working_directory.clone();
        Ok(record)
    }

    fn insert_after(&mut self, anchor: TerminalId, record: TerminalRecord) {
        let id = record.id;
        let index = self
            .order
            .iter()
            .position(|t| *t == anchor)
            .map_or(self.order.len(), |i| i + 1);
        self.order.insert(index, id);
        self.terminals.insert(id, record);
        self.notices.push(Notice::StateChanged(id));
        self.dirty = true;
    }

    pub fn select_terminal(&mut self, id: TerminalId) -> Result<(), ServiceError> {
        if !self.terminals.contains_key(&id) {
            return Err(ServiceError::UnknownTerminal(id));
        }
        self.select(id);
        Ok(())
    }

    fn select(&mut self, id: TerminalId) {
        let Some(server) = self.terminals.get(&id).map(|r| r.server) else {
            return;
        };
        self.active = Some(id);
        self.selections.entry(server).or_default().terminal = Some(id);
        self.views.touch(id);
        if let Some(tab) = self.tabs.iter_mut().find(|t| t.contains(id)) {
            tab.focused = id;
        }
        self.notices.push(Notice::SelectionChanged(Some(id)));
        self.dirty = true;
    }

    pub fn set_selected_view(&mut self, server: ServerId, view: SelectedView) -> Result<(), ServiceError> {
        if !self.servers.contains_key(&server) {
            return Err(ServiceError::UnknownServer(server));
        }
        self.selections.entry(server).or_default().view = view;
        self.dirty = true;
        Ok(())
    }

    /// Move `id` to `new_index` within its server's list.
    pub fn reorder_terminal(&mut self, id: TerminalId, new_index: usize) -> Result<(), ServiceError> {
        let server = self
            .terminals
            .get(&id)
            .map(|r| r.server)
            .ok_or(ServiceError::UnknownTerminal(id))?;

        let mut siblings = self.server_terminals(server);
        siblings.retain(|t| *t != id);
        siblings.insert(new_index.min(siblings.len()), id);

        let mut reordered = siblings.into_iter();
        for slot in self.order.iter_mut() {
            if self.terminals.get(slot).is_some_and(|r| r.server == server) {
                if let Some(next) = reordered.next() {
                    *slot = next;
                }
            }
        }
        self.dirty = true;
        Ok(())
    }

    pub fn set_split_ratio(&mut self, pane: TerminalId, ratio: f32) -> Result<bool, ServiceError> {
        let tab = self
            .tabs
            .iter_mut()
            .find(|t| t.contains(pane))
            .ok_or(ServiceError::UnknownTerminal(pane))?;
        let changed = tab.root.set_ratio_for(pane, ratio);
        if changed {
            self.dirty = true;
        }
        Ok(changed)
    }

    pub fn update_working_directory(&mut self, id: TerminalId, path: String) -> Result<(), ServiceError> {
        let record = self
            .terminals
            .get_mut(&id)
            .ok_or(ServiceError::UnknownTerminal(id))?;
        if record.state.working_directory.as_deref() != Some(path.as_str()) {
            record.state.working_directory = Some(path);
            self.notices.push(Notice::StateChanged(id));
            self.dirty = true;
        }
        Ok(())
    }

    pub fn set_auto_reconnect(&mut self, id: TerminalId, enabled: bool) -> Result<(), ServiceError> {
        let record = self
            .terminals
            .get_mut(&id)
            .ok_or(ServiceError::UnknownTerminal(id))?;
        record.auto_reconnect = enabled;
        if !enabled {
            self.cancel_reconnect(id);
        }
        self.dirty = true;
        Ok(())
    }

    // ---- connect ----------------------------------------------------------

    /// Claim the start lock for `id` and describe the work to run.
    ///
    /// Returns `None` when the terminal is connected or a start is already in
    /// flight. A start older than the stale threshold is presumed dead: its
    /// worker is cancelled and a new one takes over.
    pub fn begin_connect(&mut self, id: TerminalId) -> Result<Option<ConnectJob>, ServiceError> {
        let attempts = self.config.max_connect_attempts;
        self.begin(id, attempts, ConnectionState::Connecting)
    }

    /// One attempt of the reconnection actor.
    pub fn begin_reconnect(
        &mut self,
        id: TerminalId,
        attempt: u32,
    ) -> Result<Option<ConnectJob>, ServiceError> {
        self.begin(id, 1, ConnectionState::Reconnecting { attempt })
    }

    fn begin(
        &mut self,
        id: TerminalId,
        max_attempts: u32,
        connecting: ConnectionState,
    ) -> Result<Option<ConnectJob>, ServiceError> {
        let connecting_now = self
            .terminals
            .get(&id)
            .ok_or(ServiceError::UnknownTerminal(id))?
            .state
            .connection
            .is_connecting();
        if self.registry.registration(id).is_some() {
            return Ok(None);
        }
        if connecting_now {
            if self.registry.is_start_in_flight(id) {
                return Ok(None);
            }
            self.recover_stuck_start(id);
        }

        let Some(record) = self.terminals.get(&id) else {
            return Err(ServiceError::UnknownTerminal(id));
        };
        let server = self
            .servers
            .get(&record.server)
            .cloned()
            .ok_or(ServiceError::UnknownServer(record.server))?;
        let seed = record.state.seed;
        let working_directory = record.state.working_directory.clone();

        let pooled = match self.config.connection_policy {
            ConnectionPolicy::PooledPerServer => self.registry.pooled_handle(server.id),
            ConnectionPolicy::Dedicated => None,
        };
        let handle =
            pooled.unwrap_or_else(|| ConnectionHandle::new(server.id, self.factory.create(&server)));
        if !self.registry.try_begin_start(id, &handle) {
            log::debug!("start for terminal {id} already in flight");
            return Ok(None);
        }

        let cancel = CancellationToken::new();
        if let Some(previous) = self.cancels.insert(id, cancel.clone()) {
            previous.cancel();
        }

        let resolve = if server.tmux_enabled {
            let naming = self.resolver.naming().clone();
            let known = &self.terminals;
            Some(self.resolver.context(id, &server, || {
                known.keys().map(|t| naming.managed_name(*t)).collect::<HashSet<_>>()
            }))
        } else {
            None
        };

        let seed_session = seed.and_then(|seed| {
            let live = self
                .terminals
                .get(&seed)
                .is_some_and(|r| r.state.multiplexer.has_remote_session());
            if !live {
                return None;
            }
            self.resolver.session_name(seed).map(str::to_string)
        });
        let handle_shared = self.registry.has_other_references(&handle, id);

        if matches!(connecting, ConnectionState::Reconnecting { .. }) {
            self.reconnect_starts.insert(id);
        } else {
            self.reconnect_starts.remove(&id);
        }
        if let Some(record) = self.terminals.get_mut(&id) {
            record.state.connection = connecting;
            record.state.transport = ActiveTransport::Primary;
            record.suspended = false;
        }
        self.notices.push(Notice::StateChanged(id));

        Ok(Some(ConnectJob {
            terminal: id,
            credentials: Credentials::for_server(&server),
            handle,
            resolve,
            working_directory,
            seed_session,
            cols: self.config.default_cols,
            rows: self.config.default_rows,
            max_attempts,
            attempt_timeout: self.config.attempt_timeout,
            backoff_base: self.config.connect_backoff_base,
            handle_shared,
            cancel,
            server,
        }))
    }

    /// Abandon a start the registry has given up on. The registry already
    /// dropped its lock and queued the handle for disconnect.
    fn recover_stuck_start(&mut self, id: TerminalId) {
        log::warn!("connect for terminal {id} is stuck; starting over");
        if let Some(token) = self.cancels.remove(&id) {
            token.cancel();
        }
        self.resolver.prompts_mut().cancel(id);
        self.resolver.settle_cleanup(id, false);
        self.reconnect_starts.remove(&id);
    }

    pub fn on_attempt(&mut self, id: TerminalId, connection: ConnectionId, attempt: u32) {
        if !self
            .registry
            .pending(id)
            .is_some_and(|p| p.handle.id() == connection)
        {
            return;
        }
        if let Some(record) = self.terminals.get_mut(&id) {
            record.state.connection = ConnectionState::Reconnecting { attempt };
            self.notices.push(Notice::StateChanged(id));
        }
    }

    /// A worker started a shell. Registers it, or schedules it for teardown
    /// if a newer attempt owns the terminal.
    pub fn on_shell_started(
        &mut self,
        id: TerminalId,
        handle: ConnectionHandle,
        shell: StartedShell,
    ) -> Option<RememberSession> {
        let outcome = self.registry.register(
            id,
            handle.clone(),
            shell.shell_id,
            shell.transport.clone(),
            shell.fallback_reason.clone(),
        );
        match outcome {
            RegisterOutcome::Stale => {
                log::info!(
                    "discarding shell {} for terminal {id}: superseded",
                    shell.shell_id
                );
                self.teardown.close_shell(handle.clone(), shell.shell_id);
                self.disconnect_if_unreferenced(handle);
                return None;
            }
            RegisterOutcome::Registered { replaced } => {
                if let Some(old) = replaced {
                    self.teardown.close_shell(old.handle.clone(), old.shell_id);
                    self.disconnect_if_unreferenced(old.handle);
                }
            }
        }

        let Some(record) = self.terminals.get_mut(&id) else {
            let gone = self.registry.unregister(id);
            self.release(gone);
            return None;
        };
        record.state.connection = ConnectionState::Connected;
        record.state.multiplexer = shell.multiplexer;
        record.state.transport = shell.transport.with_reason(shell.fallback_reason);
        if shell.working_directory.is_some() {
            record.state.working_directory = shell.working_directory;
        }
        record.last_activity = Utc::now();
        record.suspended = false;
        let server = record.server;
        log::info!("terminal {id} connected ({:?})", record.state.multiplexer);

        self.reconnect_starts.remove(&id);
        self.resolver.settle_cleanup(id, shell.cleaned);
        self.resolver.record(id, &shell.plan);
        self.notices.push(Notice::StateChanged(id));
        self.dirty = true;

        match shell.plan {
            AttachPlan::External {
                name,
                remember: true,
            } => {
                if let Some(config) = self.servers.get_mut(&server) {
                    config.remembered_session = Some(name.clone());
                }
                Some(RememberSession { server, name })
            }
            _ => None,
        }
    }

    /// A connect call gave up. `None` if the report came from a superseded
    /// attempt.
    ///
    /// A failed reconnect attempt leaves the terminal Disconnected unless the
    /// error is permanent, which stops the reconnection actor and fails the
    /// terminal like any other connect.
    pub fn on_connect_failed(
        &mut self,
        id: TerminalId,
        handle: ConnectionHandle,
        error: &RemoteError,
    ) -> Option<ConnectFailure> {
        let current = self
            .registry
            .pending(id)
            .is_some_and(|p| p.handle == handle);
        if !current {
            self.disconnect_if_unreferenced(handle);
            return None;
        }

        self.registry.finish_start(id, &handle);
        self.disconnect_if_unreferenced(handle);
        self.cancels.remove(&id);
        self.resolver.settle_cleanup(id, false);

        let reconnect = self.reconnect_starts.remove(&id);
        if reconnect && error.is_permanent() {
            log::info!("giving up reconnecting terminal {id}: {error}");
            self.cancel_reconnect(id);
        }

        let record = self.terminals.get_mut(&id)?;
        self.notices.push(Notice::StateChanged(id));
        if reconnect && !error.is_permanent() {
            record.state.connection = ConnectionState::Disconnected;
            return Some(ConnectFailure::ReconnectAttempt);
        }
        let message = error.to_string();
        record.state.connection = ConnectionState::Failed {
            message: message.clone(),
        };
        Some(ConnectFailure::Failed(message))
    }

    /// Output from a worker. False if it came from a shell no longer
    /// registered for `id`.
    pub fn on_output(&mut self, id: TerminalId, connection: ConnectionId, shell_id: ShellId) -> bool {
        let live = self
            .registry
            .registration(id)
            .is_some_and(|r| r.handle.id() == connection && r.shell_id == shell_id);
        if live {
            if let Some(record) = self.terminals.get_mut(&id) {
                record.last_activity = Utc::now();
            }
        }
        live
    }

    /// The remote end closed the shell. Returns whether the reconnection
    /// actor should run for `id`.
    pub fn on_shell_exited(&mut self, id: TerminalId, handle: ConnectionHandle, shell_id: ShellId) -> bool {
        let live = self
            .registry
            .registration(id)
            .is_some_and(|r| r.handle == handle && r.shell_id == shell_id);
        if !live {
            return false;
        }

        let gone = self.registry.unregister(id);
        if let Some(registration) = gone.registration {
            self.disconnect_if_unreferenced(registration.handle);
        }
        self.cancels.remove(&id);

        let Some(record) = self.terminals.get_mut(&id) else {
            return false;
        };
        record.state.connection = ConnectionState::Disconnected;
        record.state.multiplexer = detached(record.state.multiplexer);
        self.notices.push(Notice::StateChanged(id));
        record.auto_reconnect && !record.suspended
    }

    pub fn write_target(&self, id: TerminalId) -> Option<(ConnectionHandle, ShellId)> {
        self.registry
            .registration(id)
            .map(|r| (r.handle.clone(), r.shell_id))
    }

    // ---- prompts ----------------------------------------------------------

    /// Queue a worker's prompt. Answered with Skip right away if the terminal
    /// has no connect in flight any more.
    pub fn request_prompt(&mut self, prompt: AttachPrompt, reply: oneshot::Sender<AttachSelection>) {
        if !self.cancels.contains_key(&prompt.terminal) {
            let _ = reply.send(AttachSelection::Skip);
            return;
        }
        self.resolver.prompts_mut().request(prompt, reply);
    }

    pub fn resolve_prompt(&mut self, id: TerminalId, selection: AttachSelection) -> bool {
        self.resolver.prompts_mut().resolve(id, selection)
    }

    pub fn cancel_prompt(&mut self, id: TerminalId) -> bool {
        self.resolver.prompts_mut().cancel(id)
    }

    // ---- reconnection -----------------------------------------------------

    /// Start tracking a reconnection actor for `id`, cancelling any previous.
    pub fn track_reconnect(&mut self, id: TerminalId) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.reconnects.insert(id, token.clone()) {
            previous.cancel();
        }
        token
    }

    pub fn finish_reconnect(&mut self, id: TerminalId) {
        self.reconnects.remove(&id);
    }

    pub fn cancel_reconnect(&mut self, id: TerminalId) {
        if let Some(token) = self.reconnects.remove(&id) {
            token.cancel();
        }
    }

    /// Manual retry: abandon any reconnection actor and connect now.
    pub fn retry(&mut self, id: TerminalId) -> Result<Option<ConnectJob>, ServiceError> {
        self.cancel_reconnect(id);
        self.begin_connect(id)
    }

    // ---- teardown ---------------------------------------------------------

    /// Close `id`. Closing an unknown or already closed terminal is a no-op.
    pub fn close_terminal(&mut self, id: TerminalId) -> bool {
        let Some(record) = self.terminals.get(&id) else {
            return false;
        };
        let server = record.server;
        let multiplexer = record.state.multiplexer;

        if multiplexer.has_remote_session() {
            if let Some(name) = self.resolver.managed_session(id).map(str::to_string) {
                self.schedule_kill(id, server, name);
            }
        }

        if let Some(token) = self.cancels.remove(&id) {
            token.cancel();
        }
        self.cancel_reconnect(id);
        self.reconnect_starts.remove(&id);

        self.resolver.clear(id);

        let siblings = self.server_terminals(server);
        self.terminals.remove(&id);
        self.order.retain(|t| *t != id);
        if let Some(index) = self.tabs.iter().position(|t| t.contains(id)) {
            if !self.tabs[index].remove(id) {
                self.tabs.remove(index);
            }
        }
        self.replace_selection(id, server, &siblings);

        self.views.release(id);

        let gone = self.registry.unregister(id);
        self.release(gone);

        log::info!("closed terminal {id}");
        self.notices.push(Notice::Closed(id));
        self.dirty = true;
        true
    }

    fn schedule_kill(&mut self, id: TerminalId, server: ServerId, name: String) {
        let live = self
            .registry
            .registration(id)
            .map(|r| r.handle.clone())
            .or_else(|| self.registry.pending(id).map(|p| p.handle.clone()))
            .filter(|h| h.client().is_connected());
        let kill = match live {
            Some(handle) => KillSession::on(handle, name),
            None => {
                let Some(config) = self.servers.get(&server) else {
                    return;
                };
                KillSession {
                    handle: ConnectionHandle::new(server, self.factory.create(config)),
                    name,
                    connect: Some(Credentials::for_server(config)),
                }
            }
        };
        self.teardown.kill(kill);
    }

    /// Pick what to show after `closed` goes away: the next sibling on the
    /// same server, else the previous one, else any terminal, else nothing.
    fn replace_selection(&mut self, closed: TerminalId, server: ServerId, siblings: &[TerminalId]) {
        let sibling = siblings.iter().position(|t| *t == closed).and_then(|i| {
            siblings
                .get(i + 1)
                .or_else(|| i.checked_sub(1).and_then(|p| siblings.get(p)))
                .copied()
        });

        let server_selected = self
            .selections
            .get(&server)
            .is_some_and(|s| s.terminal == Some(closed));
        if server_selected {
            if let Some(selection) = self.selections.get_mut(&server) {
                selection.terminal = sibling;
            }
        }

        if self.active == Some(closed) {
            match sibling.or_else(|| self.order.first().copied()) {
                Some(next) => self.select(next),
                None => {
                    self.active = None;
                    self.notices.push(Notice::SelectionChanged(None));
                }
            }
        }
    }

    /// Attach a heavyweight view to `id`, evicting least recently used ones
    /// beyond capacity. Returns the evicted terminals.
    pub fn register_view(
        &mut self,
        id: TerminalId,
        mut view: Box<dyn TerminalView>,
    ) -> Result<Vec<TerminalId>, ServiceError> {
        if !self.terminals.contains_key(&id) {
            view.release();
            return Err(ServiceError::UnknownTerminal(id));
        }
        let evicted = self.views.register(id, view, self.active);
        for victim in &evicted {
            self.evict(*victim);
        }
        Ok(evicted)
    }

    pub fn view_detached(&mut self, id: TerminalId) -> bool {
        self.views.detached(id)
    }

    /// Drop the live side of an evicted terminal. The record stays listed and
    /// reconnects when revisited.
    ///
    /// Session ownership is kept: the terminal still exists, and its managed
    /// session must still be killed when it is finally closed.
    fn evict(&mut self, id: TerminalId) {
        log::info!("evicting terminal {id}");
        self.drop_live(id);
        self.notices.push(Notice::Evicted(id));
    }

    fn drop_live(&mut self, id: TerminalId) {
        if let Some(token) = self.cancels.remove(&id) {
            token.cancel();
        }
        self.cancel_reconnect(id);
        self.reconnect_starts.remove(&id);
        self.resolver.prompts_mut().cancel(id);
        self.resolver.settle_cleanup(id, false);

        let gone = self.registry.unregister(id);
        self.release(gone);

        if let Some(record) = self.terminals.get_mut(&id) {
            if record.state.connection.is_active() {
                record.state.connection = ConnectionState::Disconnected;
            }
            record.state.multiplexer = detached(record.state.multiplexer);
            self.notices.push(Notice::StateChanged(id));
        }
    }

    /// Background transition: drop every live connection without closing
    /// terminals or killing their remote sessions. Returns the suspended ids.
    pub fn suspend_for_background(&mut self) -> Vec<TerminalId> {
        let live: Vec<TerminalId> = self
            .order
            .iter()
            .copied()
            .filter(|id| {
                self.terminals
                    .get(id)
                    .is_some_and(|r| r.state.connection.is_active())
            })
            .collect();

        for id in self.reconnects.keys().copied().collect::<Vec<_>>() {
            self.cancel_reconnect(id);
        }
        for id in &live {
            self.drop_live(*id);
            if let Some(record) = self.terminals.get_mut(id) {
                record.suspended = true;
            }
        }
        log::info!("suspended {} terminals", live.len());
        live
    }

    /// Foreground transition: the suspended terminals to reconnect.
    pub fn resume_from_background(&mut self) -> Vec<TerminalId> {
        let mut resume = Vec::new();
        for id in &self.order {
            if let Some(record) = self.terminals.get_mut(id) {
                if record.suspended && record.auto_reconnect {
                    resume.push(*id);
                }
                record.suspended = false;
            }
        }
        resume
    }

    /// Release everything held for every terminal. Remote sessions survive.
    pub fn shutdown(&mut self) -> Teardown {
        for (_, token) in self.cancels.drain() {
            token.cancel();
        }
        for (_, token) in self.reconnects.drain() {
            token.cancel();
        }
        self.reconnect_starts.clear();
        self.resolver.prompts_mut().cancel_all();
        for id in self.order.clone() {
            let gone = self.registry.unregister(id);
            self.release(gone);
        }
        self.views.clear();
        self.take_teardown()
    }

    fn release(&mut self, gone: Unregistered) {
        if let Some(registration) = gone.registration {
            self.teardown
                .close_shell(registration.handle.clone(), registration.shell_id);
            self.disconnect_if_unreferenced(registration.handle);
        }
        if let Some(pending) = gone.pending {
            self.disconnect_if_unreferenced(pending.handle);
        }
    }

    fn disconnect_if_unreferenced(&mut self, handle: ConnectionHandle) {
        if !self.registry.has_client_references(&handle) {
            self.teardown.disconnect_once(handle);
        }
    }

    // ---- persistence ------------------------------------------------------

    pub fn snapshot(&self) -> Snapshot {
        let mut servers: Vec<ServerSelectionSnapshot> = self
            .selections
            .iter()
            .map(|(server, selection)| ServerSelectionSnapshot {
                server: *server,
                selected_terminal: selection.terminal,
                selected_view: selection.view,
            })
            .collect();
        servers.sort_by_key(|s| s.server);

        Snapshot {
            version: SNAPSHOT_VERSION,
            terminals: self.terminals().into_iter().map(TerminalRecord::to_snapshot).collect(),
            servers,
            tabs: self.tabs.clone(),
            active: self.active,
        }
    }

    /// Load a persisted collection. Every restored terminal starts
    /// Disconnected; terminals on unknown servers are dropped.
    pub fn restore(&mut self, snapshot: Snapshot) {
        for saved in snapshot.terminals {
            let Some(server) = self.servers.get(&saved.server) else {
                log::warn!("dropping terminal {} for unknown server {}", saved.id, saved.server);
                continue;
            };
            if self.terminals.contains_key(&saved.id) {
                continue;
            }
            let mut state = TerminalState::new(server.id, server.tmux_enabled);
            state.connection = ConnectionState::Disconnected;
            state.seed = saved.seed;
            state.working_directory = saved.working_directory;

            self.order.push(saved.id);
            self.terminals.insert(
                saved.id,
                TerminalRecord {
                    id: saved.id,
                    server: saved.server,
                    title: saved.title,
                    created_at: saved.created_at,
                    last_activity: saved.last_activity,
                    auto_reconnect: saved.auto_reconnect,
                    state,
                    suspended: false,
                },
            );
        }

        let mut placed = HashSet::new();
        for mut tab in snapshot.tabs {
            let Some(root) = prune(tab.root, &self.terminals, &mut placed) else {
                continue;
            };
            tab.root = root;
            if !tab.contains(tab.focused) {
                if let Some(first) = tab.panes().first() {
                    tab.focused = *first;
                }
            }
            self.tabs.push(tab);
        }
        for id in self.order.clone() {
            if !placed.contains(&id) {
                if let Some(record) = self.terminals.get(&id) {
                    self.tabs.push(TabLayout::new(record.server, id));
                }
            }
        }

        for saved in snapshot.servers {
            if !self.servers.contains_key(&saved.server) {
                continue;
            }
            let terminal = saved
                .selected_terminal
                .filter(|t| self.terminals.contains_key(t));
            self.selections.insert(
                saved.server,
                ServerSelection {
                    terminal,
                    view: saved.selected_view,
                },
            );
        }
        self.active = snapshot
            .active
            .filter(|t| self.terminals.contains_key(t))
            .or_else(|| self.order.first().copied());

        for id in &self.order {
            self.notices.push(Notice::StateChanged(*id));
        }
        log::info!("restored {} terminals", self.order.len());
    }
}

fn detached(status: MultiplexerStatus) -> MultiplexerStatus {
    match status {
        MultiplexerStatus::Foreground | MultiplexerStatus::Installing => MultiplexerStatus::Background,
        other => other,
    }
}

/// Drop panes that are unknown or already placed in another tab.
fn prune(
    node: LayoutNode,
    known: &HashMap<TerminalId, TerminalRecord>,
    placed: &mut HashSet<TerminalId>,
) -> Option<LayoutNode> {
    match node {
        LayoutNode::Leaf(id) => {
            (known.contains_key(&id) && placed.insert(id)).then_some(LayoutNode::Leaf(id))
        }
        LayoutNode::Split {
            direction,
            ratio,
            first,
            second,
        } => match (prune(*first, known, placed), prune(*second, known, placed)) {
            (Some(first), Some(second)) => Some(LayoutNode::Split {
                direction,
                ratio,
                first: Box::new(first),
                second: Box::new(second),
            }),
            (Some(only), None) | (None, Some(only)) => Some(only),
            (None, None) => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{RemoteClient, ShellSession};
    use crate::testing::{FakeFactory, SpyView};

    struct Fixture {
        manager: SessionManager,
        factory: Arc<FakeFactory>,
        server: ServerId,
    }

    fn fixture_with(config: LifecycleConfig) -> Fixture {
        let factory = FakeFactory::new();
        let server = ServerConfig::new("box", "10.0.0.2");
        let id = server.id;
        let manager = SessionManager::new(
            config,
            SessionNaming::new("vivy", "aaaabbbb"),
            factory.clone(),
            vec![server],
        );
        Fixture {
            manager,
            factory,
            server: id,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(LifecycleConfig::default())
    }

    async fn start_shell(job: &ConnectJob) -> ShellSession {
        let client = job.handle.client();
        client.connect(&job.credentials).await.unwrap();
        client.start_shell(80, 24, None).await.unwrap()
    }

    fn started(shell: &ShellSession, plan: AttachPlan, multiplexer: MultiplexerStatus) -> StartedShell {
        StartedShell {
            shell_id: shell.shell_id,
            transport: ActiveTransport::Primary,
            fallback_reason: None,
            plan,
            multiplexer,
            working_directory: None,
            cleaned: false,
        }
    }

    /// Open a terminal and drive it to Connected with a managed session.
    async fn connected(f: &mut Fixture) -> (TerminalId, ConnectJob) {
        let id = f.manager.open_terminal(f.server).unwrap();
        let job = f.manager.begin_connect(id).unwrap().unwrap();
        let shell = start_shell(&job).await;
        let name = f.manager.resolver().naming().managed_name(id);
        f.manager.on_shell_started(
            id,
            job.handle.clone(),
            started(&shell, AttachPlan::Managed { name }, MultiplexerStatus::Foreground),
        );
        (id, job)
    }

    #[tokio::test]
    async fn test_open_and_connect_lifecycle() {
        let mut f = fixture();
        let id = f.manager.open_terminal(f.server).unwrap();
        assert_eq!(f.manager.state(id).unwrap().connection, ConnectionState::Idle);
        assert_eq!(f.manager.state(id).unwrap().multiplexer, MultiplexerStatus::Unknown);
        assert_eq!(f.manager.active(), Some(id));

        let job = f.manager.begin_connect(id).unwrap().unwrap();
        assert_eq!(f.manager.state(id).unwrap().connection, ConnectionState::Connecting);
        assert!(f.manager.begin_connect(id).unwrap().is_none());

        let shell = start_shell(&job).await;
        let name = f.manager.resolver().naming().managed_name(id);
        f.manager.on_shell_started(
            id,
            job.handle.clone(),
            started(&shell, AttachPlan::Managed { name: name.clone() }, MultiplexerStatus::Foreground),
        );

        let state = f.manager.state(id).unwrap();
        assert_eq!(state.connection, ConnectionState::Connected);
        assert_eq!(state.multiplexer, MultiplexerStatus::Foreground);
        assert_eq!(f.manager.resolver().managed_session(id), Some(name.as_str()));
        assert!(f.manager.take_teardown().is_empty());
    }

    #[tokio::test]
    async fn test_close_kills_managed_session_and_clears_maps() {
        let mut f = fixture();
        let (id, job) = connected(&mut f).await;
        f.manager.take_teardown();

        assert!(f.manager.close_terminal(id));
        assert!(job.cancel.is_cancelled());
        assert!(!f.manager.has_residual_state(id));
        assert!(f.manager.registry().is_empty());

        let teardown = f.manager.take_teardown();
        assert_eq!(teardown.kill_sessions.len(), 1);
        assert_eq!(
            teardown.kill_sessions[0].name,
            f.manager.resolver().naming().managed_name(id)
        );
        assert!(teardown.kill_sessions[0].connect.is_none());
        assert_eq!(teardown.close_shells.len(), 1);
        assert_eq!(teardown.disconnect, vec![job.handle.clone()]);
        assert!(f.manager.take_notices().contains(&Notice::Closed(id)));

        // Idempotent.
        assert!(!f.manager.close_terminal(id));
        assert!(f.manager.take_teardown().is_empty());
    }

    #[tokio::test]
    async fn test_close_external_session_is_not_killed() {
        let mut f = fixture();
        let id = f.manager.open_terminal(f.server).unwrap();
        let job = f.manager.begin_connect(id).unwrap().unwrap();
        let shell = start_shell(&job).await;
        f.manager.on_shell_started(
            id,
            job.handle.clone(),
            started(
                &shell,
                AttachPlan::External {
                    name: "work".into(),
                    remember: false,
                },
                MultiplexerStatus::Foreground,
            ),
        );

        f.manager.close_terminal(id);
        let teardown = f.manager.take_teardown();
        assert!(teardown.kill_sessions.is_empty());
        assert_eq!(teardown.close_shells.len(), 1);
    }

    #[tokio::test]
    async fn test_close_background_session_uses_fresh_connection() {
        let mut f = fixture();
        let (id, job) = connected(&mut f).await;
        let shell_id = f.manager.write_target(id).unwrap().1;
        assert!(f.manager.on_shell_exited(id, job.handle.clone(), shell_id));
        assert_eq!(f.manager.state(id).unwrap().multiplexer, MultiplexerStatus::Background);
        f.manager.take_teardown();

        f.manager.close_terminal(id);
        let teardown = f.manager.take_teardown();
        assert_eq!(teardown.kill_sessions.len(), 1);
        assert!(teardown.kill_sessions[0].connect.is_some());
        assert_eq!(f.factory.created_count(), 2);
    }

    #[tokio::test]
    async fn test_close_in_flight_connect() {
        let mut f = fixture();
        let id = f.manager.open_terminal(f.server).unwrap();
        let job = f.manager.begin_connect(id).unwrap().unwrap();

        assert!(f.manager.close_terminal(id));
        assert!(job.cancel.is_cancelled());
        assert!(f.manager.registry().is_empty());
        assert_eq!(f.manager.take_teardown().disconnect, vec![job.handle.clone()]);

        // The worker's late report is rejected.
        let shell = start_shell(&job).await;
        f.manager.on_shell_started(
            id,
            job.handle.clone(),
            started(&shell, AttachPlan::None, MultiplexerStatus::Off),
        );
        assert!(f.manager.registry().is_empty());
        let teardown = f.manager.take_teardown();
        assert_eq!(teardown.close_shells.len(), 1);
        assert_eq!(teardown.disconnect.len(), 1);
    }

    #[tokio::test]
    async fn test_selection_replacement_prefers_next_sibling() {
        let mut f = fixture();
        let a = f.manager.open_terminal(f.server).unwrap();
        let b = f.manager.open_terminal(f.server).unwrap();
        let c = f.manager.open_terminal(f.server).unwrap();

        f.manager.select_terminal(b).unwrap();
        f.manager.close_terminal(b);
        assert_eq!(f.manager.active(), Some(c));

        f.manager.close_terminal(c);
        assert_eq!(f.manager.active(), Some(a));
        assert_eq!(f.manager.selection(f.server).unwrap().terminal, Some(a));

        f.manager.close_terminal(a);
        assert_eq!(f.manager.active(), None);
        assert!(f.manager.take_notices().contains(&Notice::SelectionChanged(None)));
    }

    #[tokio::test]
    async fn test_split_and_duplicate_are_seeded() {
        let mut f = fixture();
        let parent = f.manager.open_terminal(f.server).unwrap();
        f.manager
            .update_working_directory(parent, "/srv/app".into())
            .unwrap();

        let pane = f.manager.split_terminal(parent, SplitDirection::Vertical).unwrap();
        let state = f.manager.state(pane).unwrap();
        assert_eq!(state.seed, Some(parent));
        assert_eq!(state.working_directory.as_deref(), Some("/srv/app"));
        assert_eq!(f.manager.tabs().len(), 1);
        assert_eq!(f.manager.tabs()[0].panes(), vec![parent, pane]);

        let copy = f.manager.duplicate_terminal(parent).unwrap();
        assert_eq!(f.manager.tabs().len(), 2);
        assert_eq!(f.manager.server_terminals(f.server), vec![parent, copy, pane]);

        f.manager.close_terminal(pane);
        assert_eq!(f.manager.tabs()[0].root, LayoutNode::Leaf(parent));
        f.manager.close_terminal(copy);
        assert_eq!(f.manager.tabs().len(), 1);
    }

    #[tokio::test]
    async fn test_reorder_within_server() {
        let mut f = fixture();
        let other = ServerConfig::new("other", "10.0.0.3");
        let other_id = other.id;
        f.manager.upsert_server(other);

        let a = f.manager.open_terminal(f.server).unwrap();
        let x = f.manager.open_terminal(other_id).unwrap();
        let b = f.manager.open_terminal(f.server).unwrap();
        let c = f.manager.open_terminal(f.server).unwrap();

        f.manager.reorder_terminal(c, 0).unwrap();
        assert_eq!(f.manager.server_terminals(f.server), vec![c, a, b]);
        let all: Vec<TerminalId> = f.manager.terminals().iter().map(|r| r.id).collect();
        assert_eq!(all, vec![c, x, a, b]);

        f.manager.reorder_terminal(c, 99).unwrap();
        assert_eq!(f.manager.server_terminals(f.server), vec![a, b, c]);
    }

    #[tokio::test]
    async fn test_lru_eviction_spares_selected() {
        let mut f = fixture_with(LifecycleConfig {
            view_cache_capacity: 20,
            ..Default::default()
        });

        let mut ids = Vec::new();
        let mut jobs = Vec::new();
        for _ in 0..21 {
            let (id, job) = connected(&mut f).await;
            ids.push(id);
            jobs.push(job);
        }
        f.manager.take_teardown();
        f.manager.select_terminal(ids[2]).unwrap();
        for id in &ids[..20] {
            f.manager.register_view(*id, Box::new(SpyView::new())).unwrap();
        }
        f.manager.select_terminal(ids[2]).unwrap();

        let evicted = f
            .manager
            .register_view(ids[20], Box::new(SpyView::new()))
            .unwrap();
        assert_eq!(evicted, vec![ids[0]]);
        assert_ne!(evicted[0], ids[2]);
        assert_eq!(f.manager.views().len(), 20);

        let victim = evicted[0];
        assert!(f.manager.registry().registration(victim).is_none());
        assert!(jobs[0].cancel.is_cancelled());
        assert_eq!(
            f.manager.state(victim).unwrap().connection,
            ConnectionState::Disconnected
        );
        let teardown = f.manager.take_teardown();
        assert!(teardown.kill_sessions.is_empty());
        assert_eq!(teardown.close_shells.len(), 1);
        assert!(f.manager.take_notices().contains(&Notice::Evicted(victim)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_attempt_scenario() {
        let mut f = fixture();
        let id = f.manager.open_terminal(f.server).unwrap();
        let first = f.manager.begin_connect(id).unwrap().unwrap();

        let late = FakeFactory::new();
        let handle_b = ConnectionHandle::new(f.server, late.create(f.manager.server(f.server).unwrap()));
        assert!(!f.manager.registry.try_begin_start(id, &handle_b));

        let client = handle_b.client().clone();
        client.connect(&Credentials::Agent).await.unwrap();
        let shell = client.start_shell(80, 24, None).await.unwrap();
        f.manager.on_shell_started(
            id,
            handle_b.clone(),
            started(&shell, AttachPlan::None, MultiplexerStatus::Off),
        );

        let teardown = f.manager.take_teardown();
        assert_eq!(teardown.close_shells, vec![(handle_b.clone(), shell.shell_id)]);
        assert_eq!(teardown.disconnect, vec![handle_b]);
        assert_eq!(
            f.manager.registry().pending(id).map(|p| p.handle.clone()),
            Some(first.handle.clone())
        );
        assert_eq!(f.manager.state(id).unwrap().connection, ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_failed_connect_reports_message() {
        let mut f = fixture();
        let id = f.manager.open_terminal(f.server).unwrap();
        let job = f.manager.begin_connect(id).unwrap().unwrap();
        let error = RemoteError::AuthenticationFailed("denied".into());

        let failure = f.manager.on_connect_failed(id, job.handle.clone(), &error);
        assert_eq!(
            failure,
            Some(ConnectFailure::Failed("authentication failed: denied".into()))
        );
        assert!(matches!(
            f.manager.state(id).unwrap().connection,
            ConnectionState::Failed { .. }
        ));
        assert!(f.manager.registry().is_empty());
        assert!(!f.manager.has_worker(id));
        assert_eq!(f.manager.take_teardown().disconnect, vec![job.handle.clone()]);

        // Retry is allowed from Failed.
        assert!(f.manager.retry(id).unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_start_is_replaced_after_threshold() {
        let mut f = fixture();
        let id = f.manager.open_terminal(f.server).unwrap();
        let stuck = f.manager.begin_connect(id).unwrap().unwrap();

        tokio::time::advance(f.manager.registry().stale_after() / 2).await;
        assert!(f.manager.retry(id).unwrap().is_none());
        assert!(!stuck.cancel.is_cancelled());

        tokio::time::advance(f.manager.registry().stale_after()).await;
        let fresh = f.manager.retry(id).unwrap().unwrap();
        assert!(stuck.cancel.is_cancelled());
        assert!(!fresh.cancel.is_cancelled());
        assert_ne!(fresh.handle, stuck.handle);
        assert_eq!(f.manager.state(id).unwrap().connection, ConnectionState::Connecting);
        assert_eq!(f.manager.take_teardown().disconnect, vec![stuck.handle.clone()]);

        let shell = start_shell(&fresh).await;
        f.manager.on_shell_started(
            id,
            fresh.handle.clone(),
            started(&shell, AttachPlan::None, MultiplexerStatus::Off),
        );
        assert_eq!(f.manager.state(id).unwrap().connection, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_failed_reconnect_attempt_stays_disconnected() {
        let mut f = fixture();
        let (id, job) = connected(&mut f).await;
        let (_, shell) = f.manager.write_target(id).unwrap();
        assert!(f.manager.on_shell_exited(id, job.handle.clone(), shell));
        let reconnect = f.manager.track_reconnect(id);

        let attempt = f.manager.begin_reconnect(id, 1).unwrap().unwrap();
        assert_eq!(
            f.manager.state(id).unwrap().connection,
            ConnectionState::Reconnecting { attempt: 1 }
        );
        let failure = f.manager.on_connect_failed(
            id,
            attempt.handle.clone(),
            &RemoteError::Socket("refused".into()),
        );
        assert_eq!(failure, Some(ConnectFailure::ReconnectAttempt));
        assert_eq!(
            f.manager.state(id).unwrap().connection,
            ConnectionState::Disconnected
        );
        assert!(!reconnect.is_cancelled());
        assert!(f.manager.resolver().managed_session(id).is_some());

        // A manual connect afterwards fails loudly again.
        let manual = f.manager.begin_connect(id).unwrap().unwrap();
        let failure = f.manager.on_connect_failed(
            id,
            manual.handle.clone(),
            &RemoteError::Socket("refused".into()),
        );
        assert_eq!(
            failure,
            Some(ConnectFailure::Failed("socket error: refused".into()))
        );
    }

    #[tokio::test]
    async fn test_permanent_error_stops_reconnecting() {
        let mut f = fixture();
        let (id, job) = connected(&mut f).await;
        let (_, shell) = f.manager.write_target(id).unwrap();
        assert!(f.manager.on_shell_exited(id, job.handle.clone(), shell));
        let reconnect = f.manager.track_reconnect(id);

        let attempt = f.manager.begin_reconnect(id, 2).unwrap().unwrap();
        let failure = f.manager.on_connect_failed(
            id,
            attempt.handle.clone(),
            &RemoteError::AuthenticationFailed("denied".into()),
        );
        assert_eq!(
            failure,
            Some(ConnectFailure::Failed("authentication failed: denied".into()))
        );
        assert!(reconnect.is_cancelled());
        assert!(matches!(
            f.manager.state(id).unwrap().connection,
            ConnectionState::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_output_from_unregistered_shell_is_dropped() {
        let mut f = fixture();
        let (id, job) = connected(&mut f).await;
        let (_, shell) = f.manager.write_target(id).unwrap();
        assert!(f.manager.on_output(id, job.handle.id(), shell));
        assert!(!f.manager.on_output(id, job.handle.id(), shell + 1));
        assert!(!f.manager.on_output(TerminalId::new(), job.handle.id(), shell));
    }

    #[tokio::test]
    async fn test_exit_respects_auto_reconnect() {
        let mut f = fixture();
        let (id, job) = connected(&mut f).await;
        f.manager.set_auto_reconnect(id, false).unwrap();
        let (_, shell) = f.manager.write_target(id).unwrap();

        assert!(!f.manager.on_shell_exited(id, job.handle.clone(), shell));
        assert_eq!(
            f.manager.state(id).unwrap().connection,
            ConnectionState::Disconnected
        );
        // A second report for the same shell is ignored.
        assert!(!f.manager.on_shell_exited(id, job.handle.clone(), shell));
    }

    #[tokio::test]
    async fn test_suspend_and_resume() {
        let mut f = fixture();
        let (a, job_a) = connected(&mut f).await;
        let (b, _) = connected(&mut f).await;
        f.manager.set_auto_reconnect(b, false).unwrap();
        let idle = f.manager.open_terminal(f.server).unwrap();
        f.manager.take_teardown();

        let suspended = f.manager.suspend_for_background();
        assert_eq!(suspended, vec![a, b]);
        assert!(job_a.cancel.is_cancelled());
        assert!(f.manager.registry().is_empty());
        let state = f.manager.state(a).unwrap();
        assert_eq!(state.connection, ConnectionState::Disconnected);
        assert_eq!(state.multiplexer, MultiplexerStatus::Background);
        assert_eq!(f.manager.state(idle).unwrap().connection, ConnectionState::Idle);

        let teardown = f.manager.take_teardown();
        assert!(teardown.kill_sessions.is_empty());
        assert_eq!(teardown.close_shells.len(), 2);
        // Ownership survives so a later close still kills the session.
        assert!(f.manager.resolver().managed_session(a).is_some());

        assert_eq!(f.manager.resume_from_background(), vec![a]);
        assert!(f.manager.resume_from_background().is_empty());
    }

    #[tokio::test]
    async fn test_pooled_policy_shares_handle() {
        let mut f = fixture_with(LifecycleConfig {
            connection_policy: ConnectionPolicy::PooledPerServer,
            ..Default::default()
        });

        let (a, job_a) = connected(&mut f).await;
        let b = f.manager.open_terminal(f.server).unwrap();
        let job_b = f.manager.begin_connect(b).unwrap().unwrap();
        assert_eq!(job_b.handle, job_a.handle);
        assert!(job_b.handle_shared);
        assert_eq!(f.factory.created_count(), 1);

        // Closing one terminal keeps the shared connection up.
        f.manager.close_terminal(a);
        let teardown = f.manager.take_teardown();
        assert!(teardown.disconnect.is_empty());
        assert_eq!(teardown.close_shells.len(), 1);
    }

    #[tokio::test]
    async fn test_remembered_session_is_reported() {
        let mut f = fixture();
        let id = f.manager.open_terminal(f.server).unwrap();
        let job = f.manager.begin_connect(id).unwrap().unwrap();
        let shell = start_shell(&job).await;
        let remember = f.manager.on_shell_started(
            id,
            job.handle.clone(),
            started(
                &shell,
                AttachPlan::External {
                    name: "work".into(),
                    remember: true,
                },
                MultiplexerStatus::Foreground,
            ),
        );
        assert_eq!(
            remember,
            Some(RememberSession {
                server: f.server,
                name: "work".into()
            })
        );
        assert_eq!(
            f.manager.server(f.server).unwrap().remembered_session.as_deref(),
            Some("work")
        );
    }

    #[tokio::test]
    async fn test_prompt_for_closed_terminal_is_skipped() {
        let mut f = fixture();
        let id = f.manager.open_terminal(f.server).unwrap();
        let (tx, mut rx) = oneshot::channel();
        f.manager.request_prompt(
            AttachPrompt {
                terminal: id,
                server: f.server,
                server_name: "box".into(),
                candidates: Vec::new(),
            },
            tx,
        );
        assert_eq!(rx.try_recv().unwrap(), AttachSelection::Skip);
    }

    #[tokio::test]
    async fn test_snapshot_restore_resets_live_fields() {
        let mut f = fixture();
        let (a, _) = connected(&mut f).await;
        let b = f.manager.split_terminal(a, SplitDirection::Horizontal).unwrap();
        f.manager.update_working_directory(a, "/home/me".into()).unwrap();
        f.manager.select_terminal(a).unwrap();
        let snapshot = f.manager.snapshot();
        let json = snapshot.to_json().unwrap();

        let mut server = f.manager.server(f.server).unwrap().clone();
        server.tmux_enabled = false;
        let mut restored = SessionManager::new(
            LifecycleConfig::default(),
            SessionNaming::new("vivy", "aaaabbbb"),
            FakeFactory::new(),
            vec![server],
        );
        restored.restore(Snapshot::from_json(&json).unwrap().unwrap());

        let state = restored.state(a).unwrap();
        assert_eq!(state.connection, ConnectionState::Disconnected);
        assert_eq!(state.multiplexer, MultiplexerStatus::Off);
        assert_eq!(state.working_directory.as_deref(), Some("/home/me"));
        assert_eq!(restored.state(b).unwrap().seed, Some(a));
        assert_eq!(restored.tabs().len(), 1);
        assert_eq!(restored.tabs()[0].panes(), vec![a, b]);
        assert_eq!(restored.active(), Some(a));
        assert!(restored.registry().is_empty());
    }

    #[tokio::test]
    async fn test_restore_drops_unknown_servers() {
        let mut f = fixture();
        let a = f.manager.open_terminal(f.server).unwrap();
        let snapshot = f.manager.snapshot();

        let mut restored = SessionManager::new(
            LifecycleConfig::default(),
            SessionNaming::new("vivy", "aaaabbbb"),
            FakeFactory::new(),
            vec![ServerConfig::new("other", "10.9.9.9")],
        );
        restored.restore(snapshot);
        assert!(restored.terminal(a).is_none());
        assert!(restored.tabs().is_empty());
        assert_eq!(restored.active(), None);
    }

    #[tokio::test]
    async fn test_cleanup_context_keeps_known_sessions() {
        let mut f = fixture();
        let a = f.manager.open_terminal(f.server).unwrap();
        let b = f.manager.open_terminal(f.server).unwrap();

        let job = f.manager.begin_connect(a).unwrap().unwrap();
        let keep = job.resolve.unwrap().cleanup.unwrap();
        assert!(keep.contains(&f.manager.resolver().naming().managed_name(b)));

        let job = f.manager.begin_connect(b).unwrap().unwrap();
        assert!(job.resolve.unwrap().cleanup.is_none());
    }

    #[tokio::test]
    async fn test_failed_first_connect_rearms_cleanup() {
        let mut f = fixture();
        let id = f.manager.open_terminal(f.server).unwrap();
        let job = f.manager.begin_connect(id).unwrap().unwrap();
        assert!(job.resolve.as_ref().unwrap().cleanup.is_some());

        f.manager
            .on_connect_failed(id, job.handle.clone(), &RemoteError::Socket("refused".into()));
        let retry = f.manager.retry(id).unwrap().unwrap();
        assert!(retry.resolve.as_ref().unwrap().cleanup.is_some());
    }

    #[tokio::test]
    async fn test_cleanup_claim_settles_with_shell_start() {
        let mut f = fixture();
        let a = f.manager.open_terminal(f.server).unwrap();
        let b = f.manager.open_terminal(f.server).unwrap();
        let c = f.manager.open_terminal(f.server).unwrap();

        // tmux was missing, so the pass never ran.
        let job = f.manager.begin_connect(a).unwrap().unwrap();
        let shell = start_shell(&job).await;
        f.manager.on_shell_started(
            a,
            job.handle.clone(),
            started(&shell, AttachPlan::None, MultiplexerStatus::Missing),
        );

        let job = f.manager.begin_connect(b).unwrap().unwrap();
        assert!(job.resolve.as_ref().unwrap().cleanup.is_some());
        let shell = start_shell(&job).await;
        let mut shell = started(&shell, AttachPlan::None, MultiplexerStatus::Off);
        shell.cleaned = true;
        f.manager.on_shell_started(b, job.handle.clone(), shell);

        let job = f.manager.begin_connect(c).unwrap().unwrap();
        assert!(job.resolve.as_ref().unwrap().cleanup.is_none());
    }
}
