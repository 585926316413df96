//! vivy-core: remote terminal session lifecycle.
//!
//! Owns the collection of remote terminals and everything that decides when a
//! terminal connects, which remote multiplexer session it attaches to, and
//! what gets torn down when it goes away. Wire protocols live behind the
//! [`RemoteClient`] and [`MultiplexerHelper`] traits.
//!
//! # Architecture
//!
//! - [`SessionService`] — The actor task that owns all lifecycle state; driven
//!   through a cloneable [`SessionHandle`].
//! - [`SessionManager`] — Synchronous lifecycle decisions: terminals, tabs,
//!   selection, eviction, close and suspend.
//! - [`ShellRegistry`] — Live shells and single-flight start locks.
//! - [`AttachResolver`] — Picks the multiplexer session to attach to, asking
//!   the user through the [`PromptQueue`] when configured to.
//! - [`connect`] — Off-actor worker for one connect call.

pub mod config;
pub mod connect;
pub mod error;
pub mod ids;
pub mod layout;
pub mod manager;
pub mod multiplexer;
pub mod prompt;
pub mod reconnect;
pub mod registry;
pub mod remote;
pub mod resolver;
pub mod service;
pub mod snapshot;
pub mod state;
pub mod teardown;
pub mod view_cache;

#[cfg(test)]
mod testing;

pub use config::{AttachBehavior, ConnectionPolicy, LifecycleConfig, ServerConfig};
pub use error::{Recovery, RemoteError, ServiceError};
pub use ids::{ServerId, TabId, TerminalId};
pub use layout::{LayoutNode, SplitDirection, TabLayout};
pub use manager::{SessionManager, TerminalRecord};
pub use multiplexer::{MultiplexerHelper, RemoteSession, SessionNaming};
pub use prompt::{AttachPrompt, AttachSelection, PromptQueue};
pub use registry::ShellRegistry;
pub use remote::{
    ConnectionHandle, Credentials, ExecOutput, RemoteClient, RemoteClientFactory, ShellId,
    ShellSession,
};
pub use resolver::AttachResolver;
pub use service::{Collaborators, SessionEvent, SessionHandle, SessionService};
pub use snapshot::{SelectedView, ServerStore, Snapshot, SnapshotStore, SNAPSHOT_KEY};
pub use state::{ActiveTransport, ConnectionState, MultiplexerStatus, TerminalState};
pub use view_cache::TerminalView;
