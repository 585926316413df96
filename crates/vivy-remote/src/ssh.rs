//! OpenSSH-backed [`RemoteClient`].
//!
//! `connect` starts a control master (`ssh -M -f -N`) whose socket every
//! later shell and command multiplexes over, so authentication happens once per
//! connection. Interactive shells are `ssh -tt` processes on local PTYs. When
//! the control socket path would exceed the platform limit the client falls
//! back to one direct ssh process per shell.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use vivy_core::{
    ActiveTransport, Credentials, ExecOutput, RemoteClient, RemoteClientFactory, RemoteError,
    ServerConfig, ShellId, ShellSession,
};

use crate::pty::{start_reader, PtyProcess};

/// `sun_path` is 104 bytes on macOS and 108 on Linux; stay under both.
pub const MAX_SOCKET_PATH: usize = 104;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

const OUTPUT_CHANNEL_SIZE: usize = 64;

static NEXT_CLIENT: AtomicU64 = AtomicU64::new(1);

/// Where and how to reach one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
}

impl SshTarget {
    pub fn from_server(server: &ServerConfig) -> Self {
        Self {
            host: server.host.clone(),
            port: server.port,
            username: server.username.clone(),
        }
    }

    pub fn destination(&self) -> String {
        match &self.username {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Master { socket: PathBuf },
    Direct { reason: String },
}

#[derive(Default)]
struct ClientState {
    mode: Option<Mode>,
    credentials: Option<Credentials>,
    shells: HashMap<ShellId, Arc<Mutex<PtyProcess>>>,
}

pub struct SshClient {
    target: SshTarget,
    program: String,
    control_dir: PathBuf,
    connect_timeout: Duration,
    client_id: u64,
    next_shell: AtomicU64,
    state: Mutex<ClientState>,
}

impl SshClient {
    pub fn new(target: SshTarget, program: impl Into<String>, control_dir: PathBuf) -> Self {
        Self {
            target,
            program: program.into(),
            control_dir,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            client_id: NEXT_CLIENT.fetch_add(1, Ordering::Relaxed),
            next_shell: AtomicU64::new(1),
            state: Mutex::new(ClientState::default()),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn socket_path(&self) -> PathBuf {
        self.control_dir
            .join(format!("{}-{}.sock", std::process::id(), self.client_id))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ClientState>, RemoteError> {
        self.state
            .lock()
            .map_err(|_| RemoteError::Io("ssh client state poisoned".into()))
    }

    fn mode(&self) -> Result<(Mode, Credentials), RemoteError> {
        let state = self.lock()?;
        match (&state.mode, &state.credentials) {
            (Some(mode), Some(credentials)) => Ok((mode.clone(), credentials.clone())),
            _ => Err(RemoteError::NotConnected),
        }
    }

    fn shell(&self, shell: ShellId) -> Result<Arc<Mutex<PtyProcess>>, RemoteError> {
        self.lock()?
            .shells
            .get(&shell)
            .cloned()
            .ok_or_else(|| RemoteError::ChannelOpenFailed(format!("no shell {shell}")))
    }

    /// Arguments shared by every invocation against this target.
    fn base_args(&self, mode: &Mode, credentials: &Credentials) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.target.port.to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
        ];
        if let Credentials::IdentityFile(path) = credentials {
            args.push("-i".to_string());
            args.push(path.display().to_string());
        }
        if let Mode::Master { socket } = mode {
            args.push("-S".to_string());
            args.push(socket.display().to_string());
            args.push("-o".to_string());
            args.push("ControlMaster=no".to_string());
        }
        args
    }

    async fn run(&self, args: &[String]) -> Result<ExecOutput, RemoteError> {
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RemoteError::PrerequisiteMissing(format!("failed to run {}: {e}", self.program)))?;
        Ok(ExecOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn start_master(&self, socket: &Path, credentials: &Credentials) -> Result<(), RemoteError> {
        if let Some(dir) = socket.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut args = self.base_args(&Mode::Direct { reason: String::new() }, credentials);
        args.extend([
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-M".to_string(),
            "-S".to_string(),
            socket.display().to_string(),
            "-f".to_string(),
            "-N".to_string(),
            self.target.destination(),
        ]);
        // The master forks into the background holding whatever pipes it was
        // given, so wait on the exit status instead of collecting output.
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RemoteError::PrerequisiteMissing(format!("failed to run {}: {e}", self.program)))?;
        let status = child.wait().await?;
        if status.success() {
            return Ok(());
        }
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr).await;
        }
        Err(classify_failure(status.code(), &stderr))
    }

    async fn probe_direct(&self, credentials: &Credentials) -> Result<(), RemoteError> {
        let mut args = self.base_args(&Mode::Direct { reason: String::new() }, credentials);
        args.extend([
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            self.target.destination(),
            "true".to_string(),
        ]);
        let output = self.run(&args).await?;
        if output.success() {
            Ok(())
        } else {
            Err(classify_failure(Some(output.status), &output.stderr))
        }
    }
}

#[async_trait]
impl RemoteClient for SshClient {
    async fn connect(&self, credentials: &Credentials) -> Result<(), RemoteError> {
        let socket = self.socket_path();
        let mode = if socket.as_os_str().len() > MAX_SOCKET_PATH {
            Mode::Direct {
                reason: format!(
                    "control socket path exceeds {MAX_SOCKET_PATH} bytes; using direct connections"
                ),
            }
        } else {
            Mode::Master { socket }
        };

        match &mode {
            Mode::Master { socket } => self.start_master(socket, credentials).await?,
            Mode::Direct { reason } => {
                log::info!("{}: {reason}", self.target.destination());
                self.probe_direct(credentials).await?;
            }
        }
        log::info!("connected to {}", self.target.destination());

        let mut state = self.lock()?;
        state.mode = Some(mode);
        state.credentials = Some(credentials.clone());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().map(|s| s.mode.is_some()).unwrap_or(false)
    }

    async fn start_shell(
        &self,
        cols: u16,
        rows: u16,
        startup_command: Option<&str>,
    ) -> Result<ShellSession, RemoteError> {
        let (mode, credentials) = self.mode()?;
        let mut args = self.base_args(&mode, &credentials);
        args.push("-tt".to_string());
        args.push(self.target.destination());
        if let Some(command) = startup_command {
            args.push(command.to_string());
        }

        let (process, reader) = PtyProcess::spawn(&self.program, &args, cols, rows)?;
        let shell_id = self.next_shell.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_SIZE);
        start_reader(format!("ssh-shell-{}-{shell_id}", self.client_id), reader, tx)?;
        self.lock()?
            .shells
            .insert(shell_id, Arc::new(Mutex::new(process)));

        let (transport, fallback_reason) = match mode {
            Mode::Master { .. } => (ActiveTransport::Primary, None),
            Mode::Direct { reason } => (ActiveTransport::Fallback, Some(reason)),
        };
        Ok(ShellSession {
            shell_id,
            output: rx,
            transport,
            fallback_reason,
        })
    }

    async fn write(&self, shell: ShellId, data: &[u8]) -> Result<(), RemoteError> {
        let process = self.shell(shell)?;
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || -> Result<(), RemoteError> {
            let mut process = process
                .lock()
                .map_err(|_| RemoteError::Io("shell poisoned".into()))?;
            process.write(&data)?;
            Ok(())
        })
        .await
        .map_err(|e| RemoteError::Io(e.to_string()))?
    }

    async fn resize(&self, shell: ShellId, cols: u16, rows: u16) -> Result<(), RemoteError> {
        let process = self.shell(shell)?;
        let process = process
            .lock()
            .map_err(|_| RemoteError::Io("shell poisoned".into()))?;
        process.resize(cols, rows)?;
        Ok(())
    }

    async fn close_shell(&self, shell: ShellId) -> Result<(), RemoteError> {
        let removed = self.lock()?.shells.remove(&shell);
        if let Some(process) = removed {
            if let Ok(mut process) = process.lock() {
                process.kill();
            }
        }
        Ok(())
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput, RemoteError> {
        let (mode, credentials) = self.mode()?;
        let mut args = self.base_args(&mode, &credentials);
        args.extend([
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-T".to_string(),
            self.target.destination(),
            command.to_string(),
        ]);
        let output = self.run(&args).await?;
        // 255 is ssh's own failure, anything else belongs to the command.
        if output.status == 255 {
            return Err(classify_failure(Some(255), &output.stderr));
        }
        Ok(output)
    }

    async fn disconnect(&self) {
        let (mode, shells) = match self.state.lock() {
            Ok(mut state) => {
                state.credentials = None;
                (state.mode.take(), std::mem::take(&mut state.shells))
            }
            Err(_) => return,
        };
        for (_, process) in shells {
            if let Ok(mut process) = process.lock() {
                process.kill();
            }
        }
        if let Some(Mode::Master { socket }) = mode {
            let args = vec![
                "-S".to_string(),
                socket.display().to_string(),
                "-O".to_string(),
                "exit".to_string(),
                self.target.destination(),
            ];
            match self.run(&args).await {
                Ok(output) if output.success() => {}
                Ok(output) => log::warn!(
                    "control master for {} did not exit cleanly: {}",
                    self.target.destination(),
                    first_line(&output.stderr)
                ),
                Err(e) => log::warn!("failed to stop control master: {e}"),
            }
        }
        log::info!("disconnected from {}", self.target.destination());
    }
}

/// Builds [`SshClient`]s that share one control-socket directory.
pub struct SshClientFactory {
    program: String,
    control_dir: PathBuf,
    connect_timeout: Duration,
}

impl SshClientFactory {
    pub fn new(control_dir: PathBuf) -> Self {
        Self {
            program: "ssh".to_string(),
            control_dir,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl RemoteClientFactory for SshClientFactory {
    fn create(&self, server: &ServerConfig) -> Arc<dyn RemoteClient> {
        Arc::new(
            SshClient::new(
                SshTarget::from_server(server),
                self.program.clone(),
                self.control_dir.clone(),
            )
            .with_connect_timeout(self.connect_timeout),
        )
    }
}

/// Map an ssh failure to an error kind from its exit code and stderr.
pub fn classify_failure(code: Option<i32>, stderr: &str) -> RemoteError {
    let message = first_line(stderr).to_string();
    let lower = stderr.to_ascii_lowercase();
    let has = |needle: &str| lower.contains(needle);

    if has("host key verification failed") || has("remote host identification has changed") {
        RemoteError::HostKeyVerificationFailed(message)
    } else if has("permission denied") || has("too many authentication failures") {
        RemoteError::AuthenticationFailed(message)
    } else if has("keyboard-interactive") || has("verification code") {
        RemoteError::AuthPortalNotAccepted(message)
    } else if has("proxycommand") || has("proxyjump") || has("bad configuration option") {
        RemoteError::TunnelConfiguration(message)
    } else if has("timed out") {
        RemoteError::Timeout(message)
    } else if has("channel") && has("open failed") {
        RemoteError::ChannelOpenFailed(message)
    } else if has("connection closed") || has("connection reset") || has("broken pipe") || has("control socket") {
        RemoteError::Socket(message)
    } else if message.is_empty() {
        RemoteError::ConnectionFailed(match code {
            Some(code) => format!("ssh exited with code {code}"),
            None => "ssh was killed by a signal".to_string(),
        })
    } else {
        RemoteError::ConnectionFailed(message)
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or(s).trim()
}
