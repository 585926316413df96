use std::collections::HashSet;

use async_trait::async_trait;
use vivy_core::multiplexer::managed_prefix;
use vivy_core::{ConnectionHandle, MultiplexerHelper, RemoteError, RemoteSession, ShellId};

/// Remote path of the tmux configuration written by [`TmuxHelper::prepare_config`].
pub const CONFIG_PATH: &str = "$HOME/.vivy/tmux.conf";

const CONFIG: &str = "\
set -g default-terminal \"xterm-256color\"
set -g history-limit 50000
set -g mouse on
set -g status off
set -g set-titles on
set -g set-titles-string \"#T\"
set -sg escape-time 0
";

const LIST_FORMAT: &str = "#{session_name}\t#{session_attached}\t#{session_windows}";

/// [`MultiplexerHelper`] for tmux, driven through one-shot remote commands.
pub struct TmuxHelper {
    prefix: String,
}

impl TmuxHelper {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn new_session_command(&self, name: &str, working_directory: Option<&str>) -> String {
        let mut command = format!(
            "tmux -f \"{CONFIG_PATH}\" new-session -A -s {}",
            shell_quote(name)
        );
        if let Some(dir) = working_directory {
            command.push_str(" -c ");
            command.push_str(&shell_quote(dir));
        }
        command
    }

    async fn run(
        &self,
        handle: &ConnectionHandle,
        command: &str,
    ) -> Result<vivy_core::ExecOutput, RemoteError> {
        log::debug!("tmux: {command}");
        handle.client().exec(command).await
    }
}

#[async_trait]
impl MultiplexerHelper for TmuxHelper {
    async fn is_available(&self, handle: &ConnectionHandle) -> Result<bool, RemoteError> {
        let output = self.run(handle, "command -v tmux").await?;
        Ok(output.success() && !output.stdout.trim().is_empty())
    }

    async fn list_sessions(
        &self,
        handle: &ConnectionHandle,
    ) -> Result<Vec<RemoteSession>, RemoteError> {
        let command = format!("tmux list-sessions -F {}", shell_quote(LIST_FORMAT));
        let output = self.run(handle, &command).await?;
        if !output.success() {
            if no_server(&output.stderr) {
                return Ok(Vec::new());
            }
            return Err(RemoteError::ShellRequestFailed(format!(
                "tmux list-sessions: {}",
                first_line(&output.stderr)
            )));
        }
        Ok(parse_sessions(&output.stdout))
    }

    async fn current_path(
        &self,
        session: &str,
        handle: &ConnectionHandle,
    ) -> Result<Option<String>, RemoteError> {
        let command = format!(
            "tmux display-message -p -t {} '#{{pane_current_path}}'",
            shell_quote(session)
        );
        let output = self.run(handle, &command).await?;
        if !output.success() {
            return Ok(None);
        }
        let path = output.stdout.trim();
        Ok((!path.is_empty()).then(|| path.to_string()))
    }

    async fn prepare_config(&self, handle: &ConnectionHandle) -> Result<(), RemoteError> {
        let command = format!(
            "mkdir -p \"$HOME/.vivy\" && cat > \"{CONFIG_PATH}\" <<'VIVY_EOF'\n{CONFIG}VIVY_EOF"
        );
        let output = self.run(handle, &command).await?;
        if output.success() {
            Ok(())
        } else {
            Err(RemoteError::ShellRequestFailed(format!(
                "writing tmux config: {}",
                first_line(&output.stderr)
            )))
        }
    }

    fn attach_command(&self, name: &str, working_directory: Option<&str>) -> String {
        self.new_session_command(name, working_directory)
    }

    fn attach_existing_command(&self, name: &str, _working_directory: Option<&str>) -> String {
        format!("tmux attach-session -t {}", shell_quote(name))
    }

    fn install_and_attach_script(&self, name: &str, working_directory: Option<&str>) -> String {
        let install = [
            "if command -v apt-get >/dev/null 2>&1; then sudo apt-get update && sudo apt-get install -y tmux",
            "elif command -v dnf >/dev/null 2>&1; then sudo dnf install -y tmux",
            "elif command -v yum >/dev/null 2>&1; then sudo yum install -y tmux",
            "elif command -v apk >/dev/null 2>&1; then sudo apk add tmux",
            "elif command -v pacman >/dev/null 2>&1; then sudo pacman -S --noconfirm tmux",
            "elif command -v brew >/dev/null 2>&1; then brew install tmux",
            "else echo 'vivy: no supported package manager found to install tmux'; fi",
        ]
        .join("; ");
        format!(
            "{install}; command -v tmux >/dev/null 2>&1 && exec {}",
            self.new_session_command(name, working_directory)
        )
    }

    async fn send_script(
        &self,
        script: &str,
        handle: &ConnectionHandle,
        shell: ShellId,
    ) -> Result<(), RemoteError> {
        let mut line = script.to_string();
        line.push('\n');
        handle.client().write(shell, line.as_bytes()).await
    }

    async fn kill_session(
        &self,
        name: &str,
        handle: &ConnectionHandle,
    ) -> Result<(), RemoteError> {
        let command = format!("tmux kill-session -t {}", shell_quote(name));
        let output = self.run(handle, &command).await?;
        if output.success() || missing_session(&output.stderr) || no_server(&output.stderr) {
            return Ok(());
        }
        Err(RemoteError::ShellRequestFailed(format!(
            "tmux kill-session {name}: {}",
            first_line(&output.stderr)
        )))
    }

    async fn cleanup_detached_sessions(
        &self,
        device_id: &str,
        keep: &HashSet<String>,
        handle: &ConnectionHandle,
    ) -> Result<usize, RemoteError> {
        let own = managed_prefix(&self.prefix, device_id);
        let stale: Vec<RemoteSession> = self
            .list_sessions(handle)
            .await?
            .into_iter()
            .filter(|s| s.name.starts_with(&own) && !s.is_attached() && !keep.contains(&s.name))
            .collect();

        let mut removed = 0;
        for session in stale {
            match self.kill_session(&session.name, handle).await {
                Ok(()) => removed += 1,
                Err(e) => log::warn!("failed to remove stale session {}: {e}", session.name),
            }
        }
        if removed > 0 {
            log::info!("removed {removed} detached tmux session(s)");
        }
        Ok(removed)
    }
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn parse_sessions(stdout: &str) -> Vec<RemoteSession> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let name = fields.next()?.trim();
            if name.is_empty() {
                return None;
            }
            let attached_clients = fields.next().and_then(|f| f.trim().parse().ok()).unwrap_or(0);
            let windows = fields.next().and_then(|f| f.trim().parse().ok()).unwrap_or(1);
            Some(RemoteSession {
                name: name.to_string(),
                attached_clients,
                windows,
            })
        })
        .collect()
}

fn no_server(stderr: &str) -> bool {
    stderr.contains("no server running") || stderr.contains("error connecting to")
}

fn missing_session(stderr: &str) -> bool {
    stderr.contains("can't find session") || stderr.contains("session not found")
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or(s).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use vivy_core::{Credentials, ExecOutput, RemoteClient, ServerId, ShellSession};

    /// Replays canned command results and records what was run.
    #[derive(Default)]
    struct ScriptedClient {
        replies: Mutex<VecDeque<ExecOutput>>,
        commands: Mutex<Vec<String>>,
        written: Mutex<Vec<(ShellId, Vec<u8>)>>,
    }

    impl ScriptedClient {
        fn reply(&self, status: i32, stdout: &str, stderr: &str) {
            self.replies.lock().unwrap().push_back(ExecOutput {
                status,
                stdout: stdout.into(),
                stderr: stderr.into(),
            });
        }
    }

    #[async_trait]
    impl RemoteClient for ScriptedClient {
        async fn connect(&self, _: &Credentials) -> Result<(), RemoteError> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn start_shell(
            &self,
            _: u16,
            _: u16,
            _: Option<&str>,
        ) -> Result<ShellSession, RemoteError> {
            Err(RemoteError::Unsupported("scripted".into()))
        }

        async fn write(&self, shell: ShellId, data: &[u8]) -> Result<(), RemoteError> {
            self.written.lock().unwrap().push((shell, data.to_vec()));
            Ok(())
        }

        async fn resize(&self, _: ShellId, _: u16, _: u16) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn close_shell(&self, _: ShellId) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn exec(&self, command: &str) -> Result<ExecOutput, RemoteError> {
            self.commands.lock().unwrap().push(command.to_string());
            Ok(self.replies.lock().unwrap().pop_front().unwrap_or_default())
        }

        async fn disconnect(&self) {}
    }

    fn setup() -> (Arc<ScriptedClient>, ConnectionHandle, TmuxHelper) {
        let client = Arc::new(ScriptedClient::default());
        let handle = ConnectionHandle::new(ServerId::new(), client.clone());
        (client, handle, TmuxHelper::new("vivy"))
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("work"), "'work'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_parse_sessions() {
        let sessions = parse_sessions("work\t1\t3\nvivy_abcd1234_x\t0\t1\n\n");
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].name, "work");
        assert!(sessions[0].is_attached());
        assert_eq!(sessions[0].windows, 3);
        assert!(!sessions[1].is_attached());
    }

    #[test]
    fn test_attach_commands() {
        let helper = TmuxHelper::new("vivy");
        assert_eq!(
            helper.attach_command("vivy_a_1", Some("/srv/my app")),
            "tmux -f \"$HOME/.vivy/tmux.conf\" new-session -A -s 'vivy_a_1' -c '/srv/my app'"
        );
        assert_eq!(
            helper.attach_existing_command("work", None),
            "tmux attach-session -t 'work'"
        );
        let script = helper.install_and_attach_script("vivy_a_1", None);
        assert!(script.contains("apt-get install -y tmux"));
        assert!(script.ends_with("exec tmux -f \"$HOME/.vivy/tmux.conf\" new-session -A -s 'vivy_a_1'"));
    }

    #[tokio::test]
    async fn test_list_sessions_without_server_is_empty() {
        let (client, handle, helper) = setup();
        client.reply(1, "", "no server running on /tmp/tmux-1000/default\n");
        assert!(helper.list_sessions(&handle).await.unwrap().is_empty());

        client.reply(1, "", "permission denied\n");
        assert!(matches!(
            helper.list_sessions(&handle).await,
            Err(RemoteError::ShellRequestFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_is_available() {
        let (client, handle, helper) = setup();
        client.reply(0, "/usr/bin/tmux\n", "");
        assert!(helper.is_available(&handle).await.unwrap());
        client.reply(1, "", "");
        assert!(!helper.is_available(&handle).await.unwrap());
        assert_eq!(client.commands.lock().unwrap()[0], "command -v tmux");
    }

    #[tokio::test]
    async fn test_current_path() {
        let (client, handle, helper) = setup();
        client.reply(0, "/home/me/src\n", "");
        assert_eq!(
            helper.current_path("work", &handle).await.unwrap().as_deref(),
            Some("/home/me/src")
        );
        assert!(client.commands.lock().unwrap()[0].contains("-t 'work' '#{pane_current_path}'"));

        client.reply(1, "", "can't find session: gone");
        assert_eq!(helper.current_path("gone", &handle).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_kill_missing_session_is_ok() {
        let (client, handle, helper) = setup();
        client.reply(1, "", "can't find session: vivy_a_1\n");
        assert!(helper.kill_session("vivy_a_1", &handle).await.is_ok());

        client.reply(1, "", "lost server\n");
        assert!(helper.kill_session("vivy_a_1", &handle).await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_only_removes_own_detached() {
        let (client, handle, helper) = setup();
        let own = managed_prefix("vivy", "abcd1234");
        let listing = format!(
            "{own}old\t0\t1\n{own}busy\t1\t1\n{own}kept\t0\t1\nvivy_ffff0000_x\t0\t1\nwork\t0\t2\n"
        );
        client.reply(0, &listing, "");
        client.reply(0, "", "");

        let keep = HashSet::from([format!("{own}kept")]);
        let removed = helper
            .cleanup_detached_sessions("abcd1234", &keep, &handle)
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let commands = client.commands.lock().unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1], format!("tmux kill-session -t '{own}old'"));
    }

    #[tokio::test]
    async fn test_send_script_appends_newline() {
        let (client, handle, helper) = setup();
        helper.send_script("echo hi", &handle, 7).await.unwrap();
        let written = client.written.lock().unwrap();
        assert_eq!(written[0], (7, b"echo hi\n".to_vec()));
    }
}
