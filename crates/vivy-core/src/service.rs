//! The serialization domain.
//!
//! One tokio task owns the [`SessionManager`]. Callers talk to it through a
//! cloneable [`SessionHandle`]; connect workers and reconnection actors report
//! back over channels. Nothing outside the task touches the manager.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{LifecycleConfig, ServerConfig};
use crate::connect::{self, ConnectJob, WorkerEvent};
use crate::error::ServiceError;
use crate::ids::{ServerId, TerminalId};
use crate::layout::{SplitDirection, TabLayout};
use crate::manager::{ConnectFailure, Notice, RememberSession, SessionManager, TerminalRecord};
use crate::multiplexer::{MultiplexerHelper, SessionNaming};
use crate::prompt::{AttachPrompt, AttachSelection};
use crate::reconnect::{run_reconnect, ReconnectOutcome, ReconnectPolicy};
use crate::remote::{ConnectionHandle, RemoteClient, RemoteClientFactory, ShellId};
use crate::snapshot::{SelectedView, ServerStore, Snapshot, SnapshotStore};
use crate::state::{ConnectionState, TerminalState};
use crate::view_cache::TerminalView;

const WORKER_CHANNEL_SIZE: usize = 256;
const EVENT_CHANNEL_SIZE: usize = 1024;

/// Everything the service needs from the outside world.
pub struct Collaborators {
    pub factory: Arc<dyn RemoteClientFactory>,
    pub multiplexer: Arc<dyn MultiplexerHelper>,
    pub snapshot_store: Arc<dyn SnapshotStore>,
    pub server_store: Arc<dyn ServerStore>,
    pub device_id: String,
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        terminal: TerminalId,
        state: TerminalState,
    },
    Output {
        terminal: TerminalId,
        data: Vec<u8>,
    },
    Closed {
        terminal: TerminalId,
    },
    Evicted {
        terminal: TerminalId,
    },
    SelectionChanged {
        terminal: Option<TerminalId>,
    },
}

type Reply<T> = oneshot::Sender<T>;
type ShellTarget = Option<(ConnectionHandle, ShellId)>;

enum Command {
    OpenTerminal {
        server: ServerId,
        reply: Reply<Result<TerminalId, ServiceError>>,
    },
    SplitTerminal {
        parent: TerminalId,
        direction: SplitDirection,
        reply: Reply<Result<TerminalId, ServiceError>>,
    },
    DuplicateTerminal {
        source: TerminalId,
        reply: Reply<Result<TerminalId, ServiceError>>,
    },
    CloseTerminal {
        terminal: TerminalId,
        reply: Reply<bool>,
    },
    SelectTerminal {
        terminal: TerminalId,
        reply: Reply<Result<(), ServiceError>>,
    },
    SetSelectedView {
        server: ServerId,
        view: SelectedView,
        reply: Reply<Result<(), ServiceError>>,
    },
    ReorderTerminal {
        terminal: TerminalId,
        index: usize,
        reply: Reply<Result<(), ServiceError>>,
    },
    SetSplitRatio {
        pane: TerminalId,
        ratio: f32,
        reply: Reply<Result<bool, ServiceError>>,
    },
    Connect {
        terminal: TerminalId,
        retry: bool,
        reply: Reply<Result<oneshot::Receiver<bool>, ServiceError>>,
    },
    ShellTarget {
        terminal: TerminalId,
        reply: Reply<Result<ShellTarget, ServiceError>>,
    },
    RegisterView {
        terminal: TerminalId,
        view: Box<dyn TerminalView>,
        reply: Reply<Result<Vec<TerminalId>, ServiceError>>,
    },
    ViewDetached {
        terminal: TerminalId,
        reply: Reply<bool>,
    },
    UpdateWorkingDirectory {
        terminal: TerminalId,
        path: String,
        reply: Reply<Result<(), ServiceError>>,
    },
    SetAutoReconnect {
        terminal: TerminalId,
        enabled: bool,
        reply: Reply<Result<(), ServiceError>>,
    },
    SuspendForBackground {
        reply: Reply<Vec<TerminalId>>,
    },
    ResumeFromBackground {
        reply: Reply<Vec<TerminalId>>,
    },
    ResolvePrompt {
        terminal: TerminalId,
        selection: AttachSelection,
        reply: Reply<bool>,
    },
    CancelPrompt {
        terminal: TerminalId,
        reply: Reply<bool>,
    },
    TerminalState {
        terminal: TerminalId,
        reply: Reply<Option<TerminalState>>,
    },
    ListTerminals {
        reply: Reply<Vec<TerminalRecord>>,
    },
    Tabs {
        reply: Reply<Vec<TabLayout>>,
    },
    UpsertServer {
        server: ServerConfig,
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Messages from reconnection actors.
enum Internal {
    ReconnectAttempt {
        terminal: TerminalId,
        attempt: u32,
        reply: Reply<bool>,
    },
    ReconnectFinished {
        terminal: TerminalId,
        outcome: ReconnectOutcome,
    },
}

pub struct SessionService;

impl SessionService {
    /// Start the service task. `snapshot` is the persisted collection to
    /// restore, if any.
    pub fn spawn(
        collaborators: Collaborators,
        config: LifecycleConfig,
        snapshot: Option<Snapshot>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let naming = SessionNaming::new(config.session_prefix.clone(), collaborators.device_id);
        let mut manager = SessionManager::new(
            config,
            naming,
            collaborators.factory,
            collaborators.servers,
        );
        if let Some(snapshot) = snapshot {
            manager.restore(snapshot);
        }
        manager.take_notices();
        let prompts = manager.resolver().prompts().subscribe();

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::channel(WORKER_CHANNEL_SIZE);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let actor = Actor {
            manager,
            helper: collaborators.multiplexer,
            snapshot_store: collaborators.snapshot_store,
            server_store: collaborators.server_store,
            worker_tx,
            internal_tx,
            events: events.clone(),
            waiters: HashMap::new(),
            persist_at: None,
            teardowns: Vec::new(),
        };
        let task = tokio::spawn(actor.run(command_rx, worker_rx, internal_rx));

        let handle = SessionHandle {
            commands: command_tx,
            events,
            prompts,
        };
        (handle, task)
    }
}

/// Cloneable entry point to a running [`SessionService`].
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SessionEvent>,
    prompts: watch::Receiver<Option<AttachPrompt>>,
}

impl SessionHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, ServiceError> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| ServiceError::Stopped)?;
        answer.await.map_err(|_| ServiceError::Stopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// The attach prompt currently shown, if any.
    pub fn prompts(&self) -> watch::Receiver<Option<AttachPrompt>> {
        self.prompts.clone()
    }

    pub async fn open_terminal(&self, server: ServerId) -> Result<TerminalId, ServiceError> {
        self.request(|reply| Command::OpenTerminal { server, reply })
            .await?
    }

    pub async fn split_terminal(
        &self,
        parent: TerminalId,
        direction: SplitDirection,
    ) -> Result<TerminalId, ServiceError> {
        self.request(|reply| Command::SplitTerminal {
            parent,
            direction,
            reply,
        })
        .await?
    }

    pub async fn duplicate_terminal(&self, source: TerminalId) -> Result<TerminalId, ServiceError> {
        self.request(|reply| Command::DuplicateTerminal { source, reply })
            .await?
    }

    /// Returns false if the terminal was already gone.
    pub async fn close_terminal(&self, terminal: TerminalId) -> Result<bool, ServiceError> {
        self.request(|reply| Command::CloseTerminal { terminal, reply })
            .await
    }

    pub async fn select_terminal(&self, terminal: TerminalId) -> Result<(), ServiceError> {
        self.request(|reply| Command::SelectTerminal { terminal, reply })
            .await?
    }

    pub async fn set_selected_view(&self, server: ServerId, view: SelectedView) -> Result<(), ServiceError> {
        self.request(|reply| Command::SetSelectedView {
            server,
            view,
            reply,
        })
        .await?
    }

    pub async fn reorder_terminal(&self, terminal: TerminalId, index: usize) -> Result<(), ServiceError> {
        self.request(|reply| Command::ReorderTerminal {
            terminal,
            index,
            reply,
        })
        .await?
    }

    pub async fn set_split_ratio(&self, pane: TerminalId, ratio: f32) -> Result<bool, ServiceError> {
        self.request(|reply| Command::SetSplitRatio { pane, ratio, reply })
            .await?
    }

    /// Connect `terminal` and wait for the outcome. Joins a connect already in
    /// flight. Returns whether the terminal ended up connected.
    pub async fn connect(&self, terminal: TerminalId) -> Result<bool, ServiceError> {
        self.connect_with(terminal, false).await
    }

    /// Like [`connect`](Self::connect), abandoning any reconnection actor first.
    pub async fn retry(&self, terminal: TerminalId) -> Result<bool, ServiceError> {
        self.connect_with(terminal, true).await
    }

    async fn connect_with(&self, terminal: TerminalId, retry: bool) -> Result<bool, ServiceError> {
        let done = self
            .request(|reply| Command::Connect {
                terminal,
                retry,
                reply,
            })
            .await??;
        Ok(done.await.unwrap_or(false))
    }

    /// Send keystrokes to the terminal's shell. Dropped when no shell is
    /// registered; write failures are logged.
    pub async fn write_input(&self, terminal: TerminalId, data: &[u8]) -> Result<(), ServiceError> {
        let target = self
            .request(|reply| Command::ShellTarget { terminal, reply })
            .await??;
        match target {
            Some((handle, shell)) => {
                if let Err(e) = handle.client().write(shell, data).await {
                    log::warn!("write to terminal {terminal} failed: {e}");
                }
            }
            None => log::debug!("dropping input for terminal {terminal}: no shell"),
        }
        Ok(())
    }

    pub async fn resize(&self, terminal: TerminalId, cols: u16, rows: u16) -> Result<(), ServiceError> {
        let target = self
            .request(|reply| Command::ShellTarget { terminal, reply })
            .await??;
        if let Some((handle, shell)) = target {
            if let Err(e) = handle.client().resize(shell, cols, rows).await {
                log::warn!("resize of terminal {terminal} failed: {e}");
            }
        }
        Ok(())
    }

    /// Returns the terminals evicted to make room.
    pub async fn register_view(
        &self,
        terminal: TerminalId,
        view: Box<dyn TerminalView>,
    ) -> Result<Vec<TerminalId>, ServiceError> {
        self.request(|reply| Command::RegisterView {
            terminal,
            view,
            reply,
        })
        .await?
    }

    pub async fn view_detached(&self, terminal: TerminalId) -> Result<bool, ServiceError> {
        self.request(|reply| Command::ViewDetached { terminal, reply })
            .await
    }

    pub async fn update_working_directory(
        &self,
        terminal: TerminalId,
        path: impl Into<String>,
    ) -> Result<(), ServiceError> {
        let path = path.into();
        self.request(|reply| Command::UpdateWorkingDirectory {
            terminal,
            path,
            reply,
        })
        .await?
    }

    pub async fn set_auto_reconnect(&self, terminal: TerminalId, enabled: bool) -> Result<(), ServiceError> {
        self.request(|reply| Command::SetAutoReconnect {
            terminal,
            enabled,
            reply,
        })
        .await?
    }

    pub async fn suspend_for_background(&self) -> Result<Vec<TerminalId>, ServiceError> {
        self.request(|reply| Command::SuspendForBackground { reply })
            .await
    }

    /// Starts reconnecting every suspended terminal with auto-reconnect on.
    pub async fn resume_from_background(&self) -> Result<Vec<TerminalId>, ServiceError> {
        self.request(|reply| Command::ResumeFromBackground { reply })
            .await
    }

    pub async fn resolve_prompt(
        &self,
        terminal: TerminalId,
        selection: AttachSelection,
    ) -> Result<bool, ServiceError> {
        self.request(|reply| Command::ResolvePrompt {
            terminal,
            selection,
            reply,
        })
        .await
    }

    pub async fn cancel_prompt(&self, terminal: TerminalId) -> Result<bool, ServiceError> {
        self.request(|reply| Command::CancelPrompt { terminal, reply })
            .await
    }

    pub async fn terminal_state(&self, terminal: TerminalId) -> Result<Option<TerminalState>, ServiceError> {
        self.request(|reply| Command::TerminalState { terminal, reply })
            .await
    }

    pub async fn list_terminals(&self) -> Result<Vec<TerminalRecord>, ServiceError> {
        self.request(|reply| Command::ListTerminals { reply }).await
    }

    pub async fn tabs(&self) -> Result<Vec<TabLayout>, ServiceError> {
        self.request(|reply| Command::Tabs { reply }).await
    }

    pub async fn upsert_server(&self, server: ServerConfig) -> Result<(), ServiceError> {
        self.request(|reply| Command::UpsertServer { server, reply })
            .await
    }

    /// Release every connection, persist, and stop the service task.
    /// Remote multiplexer sessions are left running.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

struct Actor {
    manager: SessionManager,
    helper: Arc<dyn MultiplexerHelper>,
    snapshot_store: Arc<dyn SnapshotStore>,
    server_store: Arc<dyn ServerStore>,
    worker_tx: mpsc::Sender<WorkerEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    events: broadcast::Sender<SessionEvent>,
    /// Callers waiting on the outcome of a connect.
    waiters: HashMap<TerminalId, Vec<Reply<bool>>>,
    persist_at: Option<Instant>,
    /// Background cleanups still running; shutdown waits for them.
    teardowns: Vec<JoinHandle<()>>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut workers: mpsc::Receiver<WorkerEvent>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        log::info!("session service started");
        loop {
            let deadline = self.persist_at;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = workers.recv() => self.on_worker_event(event),
                Some(message) = internal.recv() => self.on_internal(message),
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.persist().await;
                }
            }
            self.flush();
        }
        log::info!("session service stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::OpenTerminal { server, reply } => {
                let _ = reply.send(self.manager.open_terminal(server));
            }
            Command::SplitTerminal {
                parent,
                direction,
                reply,
            } => {
                let _ = reply.send(self.manager.split_terminal(parent, direction));
            }
            Command::DuplicateTerminal { source, reply } => {
                let _ = reply.send(self.manager.duplicate_terminal(source));
            }
            Command::CloseTerminal { terminal, reply } => {
                let closed = self.manager.close_terminal(terminal);
                self.waiters.remove(&terminal);
                let _ = reply.send(closed);
            }
            Command::SelectTerminal { terminal, reply } => {
                let _ = reply.send(self.manager.select_terminal(terminal));
            }
            Command::SetSelectedView {
                server,
                view,
                reply,
            } => {
                let _ = reply.send(self.manager.set_selected_view(server, view));
            }
            Command::ReorderTerminal {
                terminal,
                index,
                reply,
            } => {
                let _ = reply.send(self.manager.reorder_terminal(terminal, index));
            }
            Command::SetSplitRatio { pane, ratio, reply } => {
                let _ = reply.send(self.manager.set_split_ratio(pane, ratio));
            }
            Command::Connect {
                terminal,
                retry,
                reply,
            } => {
                let _ = reply.send(self.connect(terminal, retry));
            }
            Command::ShellTarget { terminal, reply } => {
                let target = match self.manager.terminal(terminal) {
                    Some(_) => Ok(self.manager.write_target(terminal)),
                    None => Err(ServiceError::UnknownTerminal(terminal)),
                };
                let _ = reply.send(target);
            }
            Command::RegisterView {
                terminal,
                view,
                reply,
            } => {
                let _ = reply.send(self.manager.register_view(terminal, view));
            }
            Command::ViewDetached { terminal, reply } => {
                let _ = reply.send(self.manager.view_detached(terminal));
            }
            Command::UpdateWorkingDirectory {
                terminal,
                path,
                reply,
            } => {
                let _ = reply.send(self.manager.update_working_directory(terminal, path));
            }
            Command::SetAutoReconnect {
                terminal,
                enabled,
                reply,
            } => {
                let _ = reply.send(self.manager.set_auto_reconnect(terminal, enabled));
            }
            Command::SuspendForBackground { reply } => {
                let suspended = self.manager.suspend_for_background();
                for id in &suspended {
                    self.complete(*id, false);
                }
                let _ = reply.send(suspended);
            }
            Command::ResumeFromBackground { reply } => {
                let resumed = self.manager.resume_from_background();
                for id in &resumed {
                    self.start_reconnect(*id);
                }
                let _ = reply.send(resumed);
            }
            Command::ResolvePrompt {
                terminal,
                selection,
                reply,
            } => {
                let _ = reply.send(self.manager.resolve_prompt(terminal, selection));
            }
            Command::CancelPrompt { terminal, reply } => {
                let _ = reply.send(self.manager.cancel_prompt(terminal));
            }
            Command::TerminalState { terminal, reply } => {
                let _ = reply.send(self.manager.state(terminal).cloned());
            }
            Command::ListTerminals { reply } => {
                let records = self.manager.terminals().into_iter().cloned().collect();
                let _ = reply.send(records);
            }
            Command::Tabs { reply } => {
                let _ = reply.send(self.manager.tabs().to_vec());
            }
            Command::UpsertServer { server, reply } => {
                self.manager.upsert_server(server);
                let _ = reply.send(());
            }
            Command::Shutdown { .. } => {}
        }
    }

    fn connect(&mut self, terminal: TerminalId, retry: bool) -> Result<oneshot::Receiver<bool>, ServiceError> {
        let job = if retry {
            self.manager.retry(terminal)?
        } else {
            self.manager.begin_connect(terminal)?
        };
        let (reply, done) = oneshot::channel();
        match job {
            Some(job) => {
                self.waiters.entry(terminal).or_default().push(reply);
                self.spawn_job(job);
            }
            None if self.is_connected(terminal) => {
                let _ = reply.send(true);
            }
            None => self.waiters.entry(terminal).or_default().push(reply),
        }
        Ok(done)
    }

    fn spawn_job(&self, job: ConnectJob) {
        log::debug!(
            "spawning connect for terminal {} ({} attempts)",
            job.terminal,
            job.max_attempts
        );
        tokio::spawn(connect::run(job, self.helper.clone(), self.worker_tx.clone()));
    }

    fn is_connected(&self, terminal: TerminalId) -> bool {
        self.manager
            .state(terminal)
            .is_some_and(|s| s.connection == ConnectionState::Connected)
    }

    fn complete(&mut self, terminal: TerminalId, connected: bool) {
        for waiter in self.waiters.remove(&terminal).unwrap_or_default() {
            let _ = waiter.send(connected);
        }
    }

    fn on_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Attempt {
                terminal,
                connection,
                attempt,
            } => self.manager.on_attempt(terminal, connection, attempt),
            WorkerEvent::ShellStarted {
                terminal,
                handle,
                shell,
            } => {
                if let Some(remember) = self.manager.on_shell_started(terminal, handle, shell) {
                    self.remember(remember);
                }
                if self.is_connected(terminal) {
                    self.complete(terminal, true);
                }
            }
            WorkerEvent::Failed {
                terminal,
                handle,
                error,
            } => match self.manager.on_connect_failed(terminal, handle, &error) {
                Some(ConnectFailure::Failed(message)) => {
                    log::warn!("terminal {terminal} failed to connect: {message}");
                    self.emit(SessionEvent::Output {
                        terminal,
                        data: format!("\r\n{message}\r\n").into_bytes(),
                    });
                    self.complete(terminal, false);
                }
                Some(ConnectFailure::ReconnectAttempt) => {
                    log::debug!("reconnect attempt for terminal {terminal} failed: {error}");
                    self.complete(terminal, false);
                }
                None => {}
            },
            WorkerEvent::Output {
                terminal,
                connection,
                shell_id,
                data,
            } => {
                if self.manager.on_output(terminal, connection, shell_id) {
                    self.emit(SessionEvent::Output { terminal, data });
                }
            }
            WorkerEvent::Exited {
                terminal,
                handle,
                shell_id,
            } => {
                if self.manager.on_shell_exited(terminal, handle, shell_id) {
                    self.start_reconnect(terminal);
                }
            }
            WorkerEvent::PromptRequested { prompt, reply } => {
                self.manager.request_prompt(prompt, reply);
            }
        }
    }

    fn on_internal(&mut self, message: Internal) {
        match message {
            Internal::ReconnectAttempt {
                terminal,
                attempt,
                reply,
            } => match self.manager.begin_reconnect(terminal, attempt) {
                Ok(Some(job)) => {
                    self.waiters.entry(terminal).or_default().push(reply);
                    self.spawn_job(job);
                }
                Ok(None) => {
                    let _ = reply.send(self.is_connected(terminal));
                }
                Err(e) => {
                    log::debug!("reconnect attempt {attempt} for {terminal} skipped: {e}");
                    let _ = reply.send(false);
                }
            },
            Internal::ReconnectFinished { terminal, outcome } => {
                log::info!("reconnect for terminal {terminal} finished: {outcome:?}");
                if outcome != ReconnectOutcome::Cancelled {
                    self.manager.finish_reconnect(terminal);
                }
            }
        }
    }

    fn start_reconnect(&mut self, terminal: TerminalId) {
        let cancel = self.manager.track_reconnect(terminal);
        let policy = ReconnectPolicy::from_config(self.manager.config());
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let outcome = run_reconnect(policy, cancel, |attempt| {
                let internal = internal.clone();
                async move {
                    let (reply, done) = oneshot::channel();
                    let sent = internal.send(Internal::ReconnectAttempt {
                        terminal,
                        attempt,
                        reply,
                    });
                    sent.is_ok() && done.await.unwrap_or(false)
                }
            })
            .await;
            let _ = internal.send(Internal::ReconnectFinished { terminal, outcome });
        });
    }

    fn remember(&self, remember: RememberSession) {
        let store = self.server_store.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.remember_session(remember.server, Some(&remember.name)) {
                log::warn!("failed to store remembered session {}: {e}", remember.name);
            }
        });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Hand off teardown, publish notices, and schedule persistence.
    fn flush(&mut self) {
        self.teardowns.retain(|task| !task.is_finished());
        if let Some(task) = self.manager.take_teardown().spawn(self.helper.clone()) {
            self.teardowns.push(task);
        }

        for notice in self.manager.take_notices() {
            let event = match notice {
                Notice::StateChanged(terminal) => match self.manager.state(terminal) {
                    Some(state) => SessionEvent::StateChanged {
                        terminal,
                        state: state.clone(),
                    },
                    None => continue,
                },
                Notice::Closed(terminal) => SessionEvent::Closed { terminal },
                Notice::Evicted(terminal) => SessionEvent::Evicted { terminal },
                Notice::SelectionChanged(terminal) => SessionEvent::SelectionChanged { terminal },
            };
            self.emit(event);
        }

        if self.manager.take_dirty() {
            self.persist_at = Some(Instant::now() + self.manager.config().persist_debounce);
        }
    }

    async fn persist(&mut self) {
        self.persist_at = None;
        let snapshot = self.manager.snapshot();
        let store = self.snapshot_store.clone();
        let saved = tokio::task::spawn_blocking(move || store.save(&snapshot)).await;
        match saved {
            Ok(Ok(())) => log::debug!("persisted terminal snapshot"),
            Ok(Err(e)) => log::warn!("failed to persist terminal snapshot: {e}"),
            Err(e) => log::warn!("snapshot task failed: {e}"),
        }
    }

    async fn shutdown(&mut self) {
        let teardown = self.manager.shutdown();
        self.waiters.clear();
        self.manager.take_notices();
        self.persist().await;
        for task in self.teardowns.drain(..) {
            if let Err(e) = task.await {
                log::warn!("cleanup task failed: {e}");
            }
        }
        teardown.run(self.helper.clone()).await;
    }
}
