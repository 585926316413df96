//! Console bridge: stdin to one remote terminal, its output to stdout.
//!
//! Attach prompts for the bridged terminal are answered on the same stdin:
//! while one is pending, the next input line is read as the answer instead of
//! being sent to the shell.

use std::io::{Read, Write};

use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use vivy_core::{
    ActiveTransport, AttachPrompt, AttachSelection, ConnectionState, SessionEvent, SessionHandle, TerminalId,
};

use crate::view::ConsoleView;

/// Why a bridge ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEnd {
    /// Stdin reached EOF (Ctrl-D).
    Detached,
    /// The remote shell exited. `resumable` is true when a tmux session
    /// outlives it.
    RemoteClosed { resumable: bool },
    Failed(String),
    /// The terminal was closed or evicted underneath the bridge.
    Closed,
    /// The service went away.
    Stopped,
}

const INPUT_CHANNEL_SIZE: usize = 64;

/// Bridge the console to `terminal` until it ends, connecting it first.
pub async fn run(handle: &SessionHandle, terminal: TerminalId, reconnect: bool) -> Result<BridgeEnd> {
    let view = ConsoleView::new();
    handle.register_view(terminal, Box::new(view.clone())).await?;
    handle.set_auto_reconnect(terminal, reconnect).await?;
    handle.select_terminal(terminal).await?;

    let mut events = handle.subscribe();
    let mut prompts = handle.prompts();
    let mut input = start_stdin_reader()?;

    let connector = handle.clone();
    tokio::spawn(async move {
        match connector.connect(terminal).await {
            Ok(true) => log::debug!("terminal {terminal} connected"),
            Ok(false) => log::debug!("terminal {terminal} did not connect"),
            Err(e) => log::debug!("connect request for {terminal} failed: {e}"),
        }
    });

    let mut stdout = tokio::io::stdout();
    let mut pending: Option<AttachPrompt> = None;
    let mut was_connected = false;

    let end = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::Output { terminal: t, data }) if t == terminal => {
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
                Ok(SessionEvent::StateChanged { terminal: t, state }) if t == terminal => {
                    match state.connection {
                        ConnectionState::Connected => {
                            match &state.transport {
                                ActiveTransport::FallbackReason(reason) => eprintln!("vivy: {reason}"),
                                ActiveTransport::Fallback => eprintln!("vivy: using a direct connection"),
                                ActiveTransport::Primary => {}
                            }
                            was_connected = true;
                        }
                        ConnectionState::Reconnecting { attempt } => {
                            eprintln!("vivy: reconnecting (attempt {attempt})");
                        }
                        ConnectionState::Disconnected if was_connected => {
                            break BridgeEnd::RemoteClosed {
                                resumable: state.multiplexer.has_remote_session(),
                            };
                        }
                        ConnectionState::Failed { message } => break BridgeEnd::Failed(message),
                        _ => {}
                    }
                }
                Ok(SessionEvent::Closed { terminal: t } | SessionEvent::Evicted { terminal: t })
                    if t == terminal =>
                {
                    break BridgeEnd::Closed;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("console fell behind, {n} events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break BridgeEnd::Stopped,
            },
            changed = prompts.changed() => {
                if changed.is_err() {
                    break BridgeEnd::Stopped;
                }
                let current = prompts.borrow_and_update().clone();
                pending = current.filter(|p| p.terminal == terminal);
                if let Some(prompt) = &pending {
                    print_prompt(prompt);
                }
            },
            chunk = input.recv() => match chunk {
                None => break BridgeEnd::Detached,
                Some(data) => match pending.take() {
                    Some(prompt) => match parse_answer(&String::from_utf8_lossy(&data), &prompt) {
                        Ok(selection) => {
                            handle.resolve_prompt(terminal, selection).await?;
                        }
                        Err(hint) => {
                            eprintln!("vivy: {hint}");
                            pending = Some(prompt);
                        }
                    },
                    None => handle.write_input(terminal, &data).await?,
                },
            },
        }
    };

    view.detach();
    handle.view_detached(terminal).await?;
    Ok(end)
}

/// Read stdin on a dedicated OS thread; the channel closes on EOF.
fn start_stdin_reader() -> std::io::Result<mpsc::Receiver<Vec<u8>>> {
    let (tx, rx) = mpsc::channel(INPUT_CHANNEL_SIZE);
    std::thread::Builder::new()
        .name("stdin-reader".into())
        .spawn(move || {
            let mut stdin = std::io::stdin().lock();
            let mut buf = [0u8; 4096];
            loop {
                let n = match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    return;
                }
            }
        })?;
    Ok(rx)
}

fn print_prompt(prompt: &AttachPrompt) {
    let mut err = std::io::stderr().lock();
    let _ = writeln!(err, "\r\nvivy: tmux sessions on {}:", prompt.server_name);
    for (i, session) in prompt.candidates.iter().enumerate() {
        let attached = if session.is_attached() { ", attached" } else { "" };
        let _ = writeln!(
            err,
            "  {}) {} ({} window{}{attached})",
            i + 1,
            session.name,
            session.windows,
            if session.windows == 1 { "" } else { "s" },
        );
    }
    let _ = writeln!(err, "  n) new session   s) plain shell   (append ! to remember, e.g. 1!)");
    let _ = write!(err, "> ");
    let _ = err.flush();
}

/// Turn one input line into a selection for `prompt`.
pub fn parse_answer(line: &str, prompt: &AttachPrompt) -> Result<AttachSelection, String> {
    let answer = line.trim();
    match answer {
        "" | "n" | "new" => return Ok(AttachSelection::CreateManaged),
        "s" | "skip" => return Ok(AttachSelection::Skip),
        _ => {}
    }

    let (choice, remember) = match answer.strip_suffix('!') {
        Some(rest) => (rest.trim(), true),
        None => (answer, false),
    };
    let name = match choice.parse::<usize>() {
        Ok(n) if (1..=prompt.candidates.len()).contains(&n) => Some(&prompt.candidates[n - 1].name),
        Ok(_) => None,
        Err(_) => prompt
            .candidates
            .iter()
            .map(|s| &s.name)
            .find(|name| name.as_str() == choice),
    };
    match name {
        Some(name) => Ok(AttachSelection::AttachExisting {
            name: name.clone(),
            remember,
        }),
        None => Err(format!(
            "answer 1-{}, a session name, 'n' for a new session or 's' to skip",
            prompt.candidates.len()
        )),
    }
}
