//! vivy-remote: concrete collaborators for the lifecycle core.
//!
//! Nothing here speaks SSH or tmux on the wire. The local OpenSSH client and
//! the remote tmux binary are driven as processes.
//!
//! # Architecture
//!
//! - [`SshClient`] — One connection per server through an OpenSSH control
//!   master; interactive shells run as `ssh -tt` on local PTYs.
//! - [`PtyProcess`] — Low-level PTY process management (spawn, write, resize).
//! - [`TmuxHelper`] — The tmux side of session resolution, run as one-shot
//!   remote commands.

pub mod pty;
pub mod ssh;
pub mod tmux;

pub use pty::{PtyError, PtyProcess};
pub use ssh::{classify_failure, SshClient, SshClientFactory, SshTarget};
pub use tmux::{shell_quote, TmuxHelper};
