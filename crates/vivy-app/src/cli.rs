use std::path::PathBuf;

use clap::{Parser, Subcommand};
use vivy_core::AttachBehavior;

/// Persistent remote terminals over SSH, kept alive with tmux.
#[derive(Parser)]
#[command(name = "vivy")]
#[command(version)]
pub struct Cli {
    /// Data directory (default: ~/.vivy)
    #[arg(long, value_name = "DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage saved servers
    Servers {
        #[command(subcommand)]
        command: ServerCommands,
    },
    /// List the terminals kept from previous sessions
    Terminals,
    /// Open a new terminal on a server and attach this console to it
    Open {
        /// Server name or id
        server: String,

        /// Override how the tmux session is chosen for this terminal
        #[arg(long, value_name = "BEHAVIOR", value_parser = parse_behavior)]
        tmux_behavior: Option<AttachBehavior>,

        #[command(flatten)]
        console: ConsoleArgs,
    },
    /// Reattach this console to a kept terminal
    Attach {
        /// Terminal id, as shown by `vivy terminals`
        terminal: String,

        #[command(flatten)]
        console: ConsoleArgs,
    },
    /// Close a kept terminal and remove its tmux session
    Close {
        /// Terminal id, as shown by `vivy terminals`
        terminal: String,
    },
    /// Show or change lifecycle settings (`lifecycle.*` keys)
    Config {
        key: Option<String>,
        value: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum ServerCommands {
    /// List saved servers
    List,
    /// Add or update a server
    Add {
        name: String,
        host: String,

        #[arg(short, long, default_value_t = 22)]
        port: u16,

        #[arg(short, long)]
        user: Option<String>,

        /// Private key passed to ssh with -i
        #[arg(short, long, value_name = "PATH")]
        identity: Option<PathBuf>,

        /// Run plain shells, never tmux
        #[arg(long)]
        no_tmux: bool,

        #[arg(long, value_name = "BEHAVIOR", value_parser = parse_behavior)]
        tmux_behavior: Option<AttachBehavior>,

        /// Install tmux when it is missing on the server
        #[arg(long)]
        auto_install_tmux: bool,

        /// Command run instead of a login shell when tmux is off
        #[arg(long, value_name = "COMMAND")]
        startup_command: Option<String>,
    },
    /// Remove a saved server
    Remove {
        /// Server name or id
        server: String,
    },
}

#[derive(clap::Args, Clone, Copy)]
pub struct ConsoleArgs {
    /// Terminal width (default: $COLUMNS or 80)
    #[arg(long)]
    pub cols: Option<u16>,

    /// Terminal height (default: $LINES or 24)
    #[arg(long)]
    pub rows: Option<u16>,

    /// Reconnect when the remote shell exits
    #[arg(long)]
    pub reconnect: bool,
}

impl ConsoleArgs {
    pub fn size(&self, default_cols: u16, default_rows: u16) -> (u16, u16) {
        let env = |name: &str| std::env::var(name).ok().and_then(|v| v.parse().ok());
        (
            self.cols.or_else(|| env("COLUMNS")).unwrap_or(default_cols),
            self.rows.or_else(|| env("LINES")).unwrap_or(default_rows),
        )
    }
}

fn parse_behavior(s: &str) -> Result<AttachBehavior, String> {
    s.parse()
}
