mod bridge;
mod cli;
mod state;
mod view;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use vivy_core::config::SETTING_PREFIX;
use vivy_core::{LifecycleConfig, ServerConfig, ServerId, SessionHandle, SnapshotStore, TerminalId};

use bridge::BridgeEnd;
use cli::{Cli, Commands, ConsoleArgs, ServerCommands};
use state::{display_path, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut state = AppState::open(cli.data_dir)?;

    match cli.command {
        Commands::Servers { command } => servers(&state, command),
        Commands::Terminals => terminals(&state),
        Commands::Open {
            server,
            tmux_behavior,
            console,
        } => {
            let mut server = state.find_server(&server)?;
            if let Some(behavior) = tmux_behavior {
                server.attach_behavior = behavior;
            }
            apply_console_size(&mut state.config, console);
            open(&state, server, console).await
        }
        Commands::Attach { terminal, console } => {
            apply_console_size(&mut state.config, console);
            attach(&state, parse_terminal(&terminal)?, console).await
        }
        Commands::Close { terminal } => close(&state, parse_terminal(&terminal)?).await,
        Commands::Config { key, value } => config(&state, key, value),
    }
}

fn parse_terminal(s: &str) -> Result<TerminalId> {
    s.parse()
        .map_err(|e| anyhow!("'{s}' is not a terminal id: {e}"))
}

fn apply_console_size(config: &mut LifecycleConfig, console: ConsoleArgs) {
    let (cols, rows) = console.size(config.default_cols, config.default_rows);
    config.default_cols = cols;
    config.default_rows = rows;
}

fn servers(state: &AppState, command: ServerCommands) -> Result<()> {
    match command {
        ServerCommands::List => {
            let servers = state.servers()?;
            if servers.is_empty() {
                println!("no servers; add one with `vivy servers add <name> <host>`");
            }
            for s in servers {
                println!(
                    "{:<16} {}:{}  tmux={} ({})",
                    s.name,
                    s.destination(),
                    s.port,
                    if s.tmux_enabled { "on" } else { "off" },
                    s.attach_behavior.as_str(),
                );
            }
        }
        ServerCommands::Add {
            name,
            host,
            port,
            user,
            identity,
            no_tmux,
            tmux_behavior,
            auto_install_tmux,
            startup_command,
        } => {
            let existing = state.find_server(&name).ok();
            let mut server = existing
                .clone()
                .unwrap_or_else(|| ServerConfig::new(name.clone(), host.clone()));
            server.host = host;
            server.port = port;
            server.username = user;
            server.identity_file = identity;
            server.tmux_enabled = !no_tmux;
            server.auto_install_tmux = auto_install_tmux;
            server.startup_command = startup_command;
            if let Some(behavior) = tmux_behavior {
                server.attach_behavior = behavior;
            }
            vivy_db::servers::upsert_server(&*state.store.lock()?, &server)?;
            let verb = if existing.is_some() { "updated" } else { "added" };
            println!("{verb} {} ({})", server.name, server.id);
        }
        ServerCommands::Remove { server } => {
            let server = state.find_server(&server)?;
            vivy_db::servers::delete_server(&*state.store.lock()?, server.id)?;
            println!("removed {}", server.name);
        }
    }
    Ok(())
}

fn terminals(state: &AppState) -> Result<()> {
    let Some(snapshot) = state.store.load()? else {
        println!("no terminals");
        return Ok(());
    };
    let servers = state.servers()?;
    let server_name = |id: ServerId| {
        servers
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.name.as_str())
            .unwrap_or("?")
    };
    for t in &snapshot.terminals {
        let active = if snapshot.active == Some(t.id) { "*" } else { " " };
        println!(
            "{active} {}  {:<12} {:<20} {}  {}",
            t.id,
            server_name(t.server),
            t.title,
            t.working_directory.as_deref().unwrap_or("-"),
            t.last_activity.format("%Y-%m-%d %H:%M"),
        );
    }
    Ok(())
}

async fn open(state: &AppState, server: ServerConfig, console: ConsoleArgs) -> Result<()> {
    let (handle, task) = state.spawn_service(vec![server.clone()])?;
    let terminal = handle.open_terminal(server.id).await?;
    eprintln!("vivy: terminal {terminal} on {}", server.name);

    let end = bridge::run(&handle, terminal, console.reconnect).await?;
    finish(&handle, terminal, end).await?;

    handle.shutdown().await?;
    task.await.context("session service panicked")?;
    Ok(())
}

async fn attach(state: &AppState, terminal: TerminalId, console: ConsoleArgs) -> Result<()> {
    let (handle, task) = state.spawn_service(Vec::new())?;
    if handle.terminal_state(terminal).await?.is_none() {
        handle.shutdown().await?;
        bail!("no kept terminal {terminal}; see `vivy terminals`");
    }

    let end = bridge::run(&handle, terminal, console.reconnect).await?;
    finish(&handle, terminal, end).await?;

    handle.shutdown().await?;
    task.await.context("session service panicked")?;
    Ok(())
}

/// Report how a bridge ended and drop terminals with nothing left to resume.
async fn finish(handle: &SessionHandle, terminal: TerminalId, end: BridgeEnd) -> Result<()> {
    match end {
        BridgeEnd::Detached => {
            eprintln!("\r\nvivy: detached; reattach with `vivy attach {terminal}`");
        }
        BridgeEnd::RemoteClosed { resumable: true } => {
            eprintln!("\r\nvivy: disconnected; reattach with `vivy attach {terminal}`");
        }
        BridgeEnd::RemoteClosed { resumable: false } => {
            eprintln!("\r\nvivy: remote shell exited");
            handle.close_terminal(terminal).await?;
        }
        BridgeEnd::Failed(message) => {
            eprintln!("vivy: connection failed: {message}");
        }
        BridgeEnd::Closed => eprintln!("vivy: terminal closed"),
        BridgeEnd::Stopped => bail!("session service stopped unexpectedly"),
    }
    Ok(())
}

async fn close(state: &AppState, terminal: TerminalId) -> Result<()> {
    let (handle, task) = state.spawn_service(Vec::new())?;
    let closed = handle.close_terminal(terminal).await?;
    handle.shutdown().await?;
    task.await.context("session service panicked")?;
    if !closed {
        bail!("no kept terminal {terminal}; see `vivy terminals`");
    }
    println!("closed {terminal}");
    Ok(())
}

fn config(state: &AppState, key: Option<String>, value: Option<String>) -> Result<()> {
    let conn = state.store.lock()?;
    match (key, value) {
        (None, _) => {
            println!("data directory: {}", display_path(&state.home));
            println!("device id: {}", state.device_id);
            for (key, value) in vivy_db::settings::list_prefixed(&conn, SETTING_PREFIX)? {
                println!("{key} = {value}");
            }
            println!("{:#?}", state.config);
        }
        (Some(key), None) => match vivy_db::settings::get(&conn, &key)? {
            Some(value) => println!("{value}"),
            None => println!("{key} is not set"),
        },
        (Some(key), Some(value)) => {
            let mut probe = state.config.clone();
            if !probe.apply_setting(&key, &value) {
                bail!("'{key}' is not a lifecycle setting or '{value}' is not a valid value for it");
            }
            vivy_db::settings::set(&conn, &key, &value)?;
            println!("{key} = {value}");
        }
    }
    Ok(())
}
