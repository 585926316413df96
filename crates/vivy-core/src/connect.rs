//! Connect worker: runs one connect call for one terminal off the
//! serialization domain and reports back over a channel.
//!
//! A worker owns nothing the manager can see. It connects (retrying with
//! backoff), resolves a multiplexer plan, starts the shell, then pumps output
//! until the remote end closes. Cancellation drops the worker wherever it is
//! suspended; the manager has already reclaimed the registry entries by then.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::{backoff_delay, ServerConfig};
use crate::error::{Recovery, RemoteError};
use crate::ids::TerminalId;
use crate::multiplexer::{MultiplexerHelper, RemoteSession};
use crate::prompt::{AttachPrompt, AttachSelection};
use crate::remote::{ConnectionHandle, ConnectionId, Credentials, ShellId, ShellSession};
use crate::resolver::{resolve_plan, AttachPlan, ResolveContext, SelectionPrompter};
use crate::state::{ActiveTransport, MultiplexerStatus};

#[derive(Debug)]
pub struct ConnectJob {
    pub terminal: TerminalId,
    pub server: ServerConfig,
    pub handle: ConnectionHandle,
    pub credentials: Credentials,
    /// `None` when multiplexing is disabled for the server.
    pub resolve: Option<ResolveContext>,
    pub working_directory: Option<String>,
    /// Live multiplexer session of the terminal this one was seeded from.
    pub seed_session: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub backoff_base: Duration,
    /// Other terminals use `handle`; channel errors must not reset it.
    pub handle_shared: bool,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct StartedShell {
    pub shell_id: ShellId,
    pub transport: ActiveTransport,
    pub fallback_reason: Option<String>,
    pub plan: AttachPlan,
    pub multiplexer: MultiplexerStatus,
    pub working_directory: Option<String>,
    /// The server's abandoned-session cleanup ran as part of this start.
    pub cleaned: bool,
}

#[derive(Debug)]
pub enum WorkerEvent {
    /// Attempt `attempt` (2..N) of a connect call is starting.
    Attempt {
        terminal: TerminalId,
        connection: ConnectionId,
        attempt: u32,
    },
    ShellStarted {
        terminal: TerminalId,
        handle: ConnectionHandle,
        shell: StartedShell,
    },
    Failed {
        terminal: TerminalId,
        handle: ConnectionHandle,
        error: RemoteError,
    },
    Output {
        terminal: TerminalId,
        connection: ConnectionId,
        shell_id: ShellId,
        data: Vec<u8>,
    },
    Exited {
        terminal: TerminalId,
        handle: ConnectionHandle,
        shell_id: ShellId,
    },
    PromptRequested {
        prompt: AttachPrompt,
        reply: oneshot::Sender<AttachSelection>,
    },
}

/// What to run in the new shell, decided before it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Planned {
    plan: AttachPlan,
    status: MultiplexerStatus,
    startup: Option<String>,
    install_script: Option<String>,
    working_directory: Option<String>,
    cleaned: bool,
}

impl Planned {
    fn plain(job: &ConnectJob, status: MultiplexerStatus) -> Self {
        Self {
            plan: AttachPlan::None,
            status,
            startup: job.server.startup_command.clone(),
            install_script: None,
            working_directory: job.working_directory.clone(),
            cleaned: false,
        }
    }
}

/// Bounds every remote query of the wrapped helper by `limit`, so a wedged
/// remote command fails the attempt instead of holding the start lock.
struct Bounded<'a> {
    inner: &'a dyn MultiplexerHelper,
    limit: Duration,
}

#[async_trait]
impl<'a> MultiplexerHelper for Bounded<'a> {
    async fn is_available(&self, handle: &ConnectionHandle) -> Result<bool, RemoteError> {
        with_timeout(self.limit, "tmux check", self.inner.is_available(handle)).await
    }

    async fn list_sessions(
        &self,
        handle: &ConnectionHandle,
    ) -> Result<Vec<RemoteSession>, RemoteError> {
        with_timeout(self.limit, "tmux list", self.inner.list_sessions(handle)).await
    }

    async fn current_path(
        &self,
        session: &str,
        handle: &ConnectionHandle,
    ) -> Result<Option<String>, RemoteError> {
        with_timeout(self.limit, "tmux path", self.inner.current_path(session, handle)).await
    }

    async fn prepare_config(&self, handle: &ConnectionHandle) -> Result<(), RemoteError> {
        with_timeout(self.limit, "tmux config", self.inner.prepare_config(handle)).await
    }

    fn attach_command(&self, name: &str, working_directory: Option<&str>) -> String {
        self.inner.attach_command(name, working_directory)
    }

    fn attach_existing_command(&self, name: &str, working_directory: Option<&str>) -> String {
        self.inner.attach_existing_command(name, working_directory)
    }

    fn install_and_attach_script(&self, name: &str, working_directory: Option<&str>) -> String {
        self.inner.install_and_attach_script(name, working_directory)
    }

    async fn send_script(
        &self,
        script: &str,
        handle: &ConnectionHandle,
        shell: ShellId,
    ) -> Result<(), RemoteError> {
        with_timeout(self.limit, "tmux install", self.inner.send_script(script, handle, shell)).await
    }

    async fn kill_session(&self, name: &str, handle: &ConnectionHandle) -> Result<(), RemoteError> {
        with_timeout(self.limit, "tmux kill", self.inner.kill_session(name, handle)).await
    }

    async fn cleanup_detached_sessions(
        &self,
        device_id: &str,
        keep: &HashSet<String>,
        handle: &ConnectionHandle,
    ) -> Result<usize, RemoteError> {
        with_timeout(
            self.limit,
            "tmux cleanup",
            self.inner.cleanup_detached_sessions(device_id, keep, handle),
        )
        .await
    }
}

/// Forwards attach prompts to the serialization domain and awaits the answer.
struct ChannelPrompter {
    events: mpsc::Sender<WorkerEvent>,
}

#[async_trait]
impl SelectionPrompter for ChannelPrompter {
    async fn ask(&self, prompt: AttachPrompt) -> AttachSelection {
        let (reply, answer) = oneshot::channel();
        if self
            .events
            .send(WorkerEvent::PromptRequested { prompt, reply })
            .await
            .is_err()
        {
            return AttachSelection::Skip;
        }
        answer.await.unwrap_or(AttachSelection::Skip)
    }
}

/// Run `job` to completion or cancellation.
pub async fn run(
    job: ConnectJob,
    helper: Arc<dyn MultiplexerHelper>,
    events: mpsc::Sender<WorkerEvent>,
) {
    let cancel = job.cancel.clone();
    let terminal = job.terminal;
    tokio::select! {
        _ = cancel.cancelled() => {
            log::debug!("connect worker for terminal {terminal} cancelled");
        }
        _ = drive(job, helper, events) => {}
    }
}

async fn drive(job: ConnectJob, helper: Arc<dyn MultiplexerHelper>, events: mpsc::Sender<WorkerEvent>) {
    let (mut session, planned) = match start(&job, helper.as_ref(), &events).await {
        Ok(started) => started,
        Err(error) => {
            log::warn!("connect for terminal {} failed: {error}", job.terminal);
            let _ = events
                .send(WorkerEvent::Failed {
                    terminal: job.terminal,
                    handle: job.handle.clone(),
                    error,
                })
                .await;
            return;
        }
    };
    let shell_id = session.shell_id;
    let bounded = Bounded {
        inner: helper.as_ref(),
        limit: job.attempt_timeout,
    };

    if let Some(script) = &planned.install_script {
        if let Err(e) = bounded.send_script(script, &job.handle, shell_id).await {
            log::warn!("sending install script to terminal {} failed: {e}", job.terminal);
        }
    }

    let started = StartedShell {
        shell_id,
        transport: session.transport.clone(),
        fallback_reason: session.fallback_reason.clone(),
        plan: planned.plan,
        multiplexer: planned.status,
        working_directory: planned.working_directory,
        cleaned: planned.cleaned,
    };
    if events
        .send(WorkerEvent::ShellStarted {
            terminal: job.terminal,
            handle: job.handle.clone(),
            shell: started,
        })
        .await
        .is_err()
    {
        return;
    }

    while let Some(data) = session.output.recv().await {
        let event = WorkerEvent::Output {
            terminal: job.terminal,
            connection: job.handle.id(),
            shell_id,
            data,
        };
        if events.send(event).await.is_err() {
            return;
        }
    }

    log::info!("shell {shell_id} for terminal {} closed by remote", job.terminal);
    let _ = events
        .send(WorkerEvent::Exited {
            terminal: job.terminal,
            handle: job.handle.clone(),
            shell_id,
        })
        .await;
}

/// The attempt loop: connect, plan once, start the shell.
async fn start(
    job: &ConnectJob,
    helper: &dyn MultiplexerHelper,
    events: &mpsc::Sender<WorkerEvent>,
) -> Result<(ShellSession, Planned), RemoteError> {
    let client = job.handle.client();
    let mut planned: Option<Planned> = None;
    let mut last_error = RemoteError::NotConnected;

    for attempt in 1..=job.max_attempts.max(1) {
        if attempt > 1 {
            let _ = events
                .send(WorkerEvent::Attempt {
                    terminal: job.terminal,
                    connection: job.handle.id(),
                    attempt,
                })
                .await;
            tokio::time::sleep(backoff_delay(job.backoff_base, attempt)).await;
        }

        let error = match attempt_once(job, helper, events, &mut planned).await {
            Ok(session) => match planned.take() {
                Some(planned) => return Ok((session, planned)),
                None => RemoteError::NotConnected,
            },
            Err(e) => e,
        };

        log::info!(
            "attempt {attempt}/{} for terminal {} failed: {error}",
            job.max_attempts,
            job.terminal
        );
        match error.recovery() {
            Recovery::Permanent => return Err(error),
            Recovery::Transient => client.disconnect().await,
            Recovery::Channel if !job.handle_shared => client.disconnect().await,
            Recovery::Channel => {}
        }
        last_error = error;
    }
    Err(last_error)
}

async fn attempt_once(
    job: &ConnectJob,
    helper: &dyn MultiplexerHelper,
    events: &mpsc::Sender<WorkerEvent>,
    planned: &mut Option<Planned>,
) -> Result<ShellSession, RemoteError> {
    let client = job.handle.client();
    if !client.is_connected() {
        with_timeout(job.attempt_timeout, "connect", client.connect(&job.credentials)).await?;
    }

    // Resolved once per connect call; the user is not asked again on retry.
    if planned.is_none() {
        *planned = Some(plan_multiplexer(job, helper, events).await);
    }
    let startup = planned.as_ref().and_then(|p| p.startup.clone());

    with_timeout(
        job.attempt_timeout,
        "shell start",
        client.start_shell(job.cols, job.rows, startup.as_deref()),
    )
    .await
}

async fn with_timeout<T>(
    limit: Duration,
    what: &str,
    fut: impl std::future::Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout(format!("{what} after {limit:?}"))),
    }
}

async fn plan_multiplexer(
    job: &ConnectJob,
    helper: &dyn MultiplexerHelper,
    events: &mpsc::Sender<WorkerEvent>,
) -> Planned {
    let Some(ctx) = &job.resolve else {
        return Planned::plain(job, MultiplexerStatus::Off);
    };
    let handle = &job.handle;
    let helper = &Bounded {
        inner: helper,
        limit: job.attempt_timeout,
    };

    match helper.is_available(handle).await {
        Ok(true) => {}
        Ok(false) if job.server.auto_install_tmux => {
            let name = ctx.naming.managed_name(job.terminal);
            let script =
                helper.install_and_attach_script(&name, job.working_directory.as_deref());
            return Planned {
                plan: AttachPlan::Managed { name },
                status: MultiplexerStatus::Installing,
                startup: None,
                install_script: Some(script),
                working_directory: job.working_directory.clone(),
                cleaned: false,
            };
        }
        Ok(false) => {
            log::info!("tmux is not installed on {}", job.server.name);
            return Planned::plain(job, MultiplexerStatus::Missing);
        }
        Err(e) => {
            log::warn!("tmux availability check on {} failed: {e}", job.server.name);
            return Planned::plain(job, MultiplexerStatus::Off);
        }
    }

    if let Err(e) = helper.prepare_config(handle).await {
        log::warn!("preparing tmux config on {} failed: {e}", job.server.name);
    }

    let mut working_directory = job.working_directory.clone();
    if let Some(seed) = &job.seed_session {
        match helper.current_path(seed, handle).await {
            Ok(Some(path)) => working_directory = Some(path),
            Ok(None) => {}
            Err(e) => log::debug!("reading cwd of {seed} failed: {e}"),
        }
    }

    let prompter = ChannelPrompter {
        events: events.clone(),
    };
    let plan = resolve_plan(ctx, helper, handle, &prompter).await;
    let cwd = working_directory.as_deref();
    let (startup, status) = match &plan {
        AttachPlan::Managed { name } => (
            Some(helper.attach_command(name, cwd)),
            MultiplexerStatus::Foreground,
        ),
        AttachPlan::External { name, .. } => (
            Some(helper.attach_existing_command(name, cwd)),
            MultiplexerStatus::Foreground,
        ),
        AttachPlan::None => (job.server.startup_command.clone(), MultiplexerStatus::Off),
    };

    Planned {
        plan,
        status,
        startup,
        install_script: None,
        working_directory,
        cleaned: ctx.cleanup.is_some(),
    }
}
