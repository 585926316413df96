//! Decides which remote multiplexer session a terminal attaches to.
//!
//! Decision state (ownership, per-server cleanup, prompt queue) lives in
//! [`AttachResolver`] on the serialization domain. The remote queries the
//! decision needs run in [`resolve_plan`] on the connect worker, driven by a
//! [`ResolveContext`] snapshot.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::config::{AttachBehavior, ServerConfig};
use crate::ids::{ServerId, TerminalId};
use crate::multiplexer::{MultiplexerHelper, SessionNaming};
use crate::prompt::{AttachPrompt, AttachSelection, PromptQueue};
use crate::remote::ConnectionHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Created by this client. Killed when the terminal closes.
    Managed,
    /// Pre-existing. Never killed automatically.
    External,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedSession {
    pub name: String,
    pub ownership: Ownership,
}

/// Outcome of resolution for one connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachPlan {
    Managed { name: String },
    External { name: String, remember: bool },
    /// Run a plain shell.
    None,
}

impl AttachPlan {
    pub fn session_name(&self) -> Option<&str> {
        match self {
            Self::Managed { name } | Self::External { name, .. } => Some(name),
            Self::None => None,
        }
    }

    fn owned(&self) -> Option<OwnedSession> {
        match self {
            Self::Managed { name } => Some(OwnedSession {
                name: name.clone(),
                ownership: Ownership::Managed,
            }),
            Self::External { name, .. } => Some(OwnedSession {
                name: name.clone(),
                ownership: Ownership::External,
            }),
            Self::None => None,
        }
    }
}

/// Asks the user to pick a session. Implemented over the prompt queue.
#[async_trait]
pub trait SelectionPrompter: Send + Sync {
    async fn ask(&self, prompt: AttachPrompt) -> AttachSelection;
}

/// Everything a connect worker needs to resolve a plan off the serialization
/// domain.
#[derive(Debug, Clone)]
pub struct ResolveContext {
    pub terminal: TerminalId,
    pub server: ServerId,
    pub server_name: String,
    pub behavior: AttachBehavior,
    pub remembered: Option<String>,
    pub naming: SessionNaming,
    /// Set on the first attach to a server in this process: managed sessions
    /// to keep while cleaning up abandoned ones.
    pub cleanup: Option<HashSet<String>>,
}

pub struct AttachResolver {
    naming: SessionNaming,
    owned: HashMap<TerminalId, OwnedSession>,
    cleaned: HashSet<ServerId>,
    /// Cleanup passes handed to a connect that has not reported back.
    cleanup_claims: HashMap<TerminalId, ServerId>,
    prompts: PromptQueue,
}

impl AttachResolver {
    pub fn new(naming: SessionNaming) -> Self {
        Self {
            naming,
            owned: HashMap::new(),
            cleaned: HashSet::new(),
            cleanup_claims: HashMap::new(),
            prompts: PromptQueue::new(),
        }
    }

    pub fn naming(&self) -> &SessionNaming {
        &self.naming
    }

    pub fn prompts(&self) -> &PromptQueue {
        &self.prompts
    }

    pub fn prompts_mut(&mut self) -> &mut PromptQueue {
        &mut self.prompts
    }

    /// Build the context for one connect. The first call per server claims
    /// its cleanup pass and asks `keep` for the sessions to spare.
    pub fn context(
        &mut self,
        terminal: TerminalId,
        server: &ServerConfig,
        keep: impl FnOnce() -> HashSet<String>,
    ) -> ResolveContext {
        let cleanup = if self.cleaned.insert(server.id) {
            self.cleanup_claims.insert(terminal, server.id);
            Some(keep())
        } else {
            None
        };
        ResolveContext {
            terminal,
            server: server.id,
            server_name: server.name.clone(),
            behavior: server.attach_behavior,
            remembered: server.remembered_session.clone(),
            naming: self.naming.clone(),
            cleanup,
        }
    }

    /// The connect for `terminal` reported back. A cleanup pass it claimed
    /// but never ran goes back to the next connect to that server.
    pub fn settle_cleanup(&mut self, terminal: TerminalId, ran: bool) {
        if let Some(server) = self.cleanup_claims.remove(&terminal) {
            if !ran {
                log::debug!("cleanup for server {server} did not run; rearming");
                self.cleaned.remove(&server);
            }
        }
    }

    pub fn record(&mut self, terminal: TerminalId, plan: &AttachPlan) {
        match plan.owned() {
            Some(owned) => {
                self.owned.insert(terminal, owned);
            }
            None => {
                self.owned.remove(&terminal);
            }
        }
    }

    pub fn ownership(&self, terminal: TerminalId) -> Option<&OwnedSession> {
        self.owned.get(&terminal)
    }

    /// Name of the session this client created for `terminal`, if any.
    pub fn managed_session(&self, terminal: TerminalId) -> Option<&str> {
        self.owned
            .get(&terminal)
            .filter(|o| o.ownership == Ownership::Managed)
            .map(|o| o.name.as_str())
    }

    pub fn session_name(&self, terminal: TerminalId) -> Option<&str> {
        self.owned.get(&terminal).map(|o| o.name.as_str())
    }

    /// Forget `terminal`, answering any prompt it is waiting on with Skip.
    pub fn clear(&mut self, terminal: TerminalId) {
        self.prompts.cancel(terminal);
        self.owned.remove(&terminal);
        self.settle_cleanup(terminal, false);
    }

    pub fn has_state(&self, terminal: TerminalId) -> bool {
        self.owned.contains_key(&terminal)
            || self.prompts.is_pending(terminal)
            || self.cleanup_claims.contains_key(&terminal)
    }
}

/// Run the per-server cleanup if due, then resolve a plan for the terminal.
pub async fn resolve_plan(
    ctx: &ResolveContext,
    helper: &dyn MultiplexerHelper,
    handle: &ConnectionHandle,
    prompter: &dyn SelectionPrompter,
) -> AttachPlan {
    if let Some(keep) = &ctx.cleanup {
        match helper
            .cleanup_detached_sessions(ctx.naming.device_id(), keep, handle)
            .await
        {
            Ok(0) => {}
            Ok(n) => log::info!("removed {n} abandoned sessions on {}", ctx.server_name),
            Err(e) => log::warn!("session cleanup on {} failed: {e}", ctx.server_name),
        }
    }

    match resolve_selection(ctx, helper, handle, prompter).await {
        AttachSelection::CreateManaged => AttachPlan::Managed {
            name: ctx.naming.managed_name(ctx.terminal),
        },
        AttachSelection::AttachExisting { name, remember } => AttachPlan::External { name, remember },
        AttachSelection::Skip => AttachPlan::None,
    }
}

pub async fn resolve_selection(
    ctx: &ResolveContext,
    helper: &dyn MultiplexerHelper,
    handle: &ConnectionHandle,
    prompter: &dyn SelectionPrompter,
) -> AttachSelection {
    match ctx.behavior {
        AttachBehavior::AlwaysCreateManaged => AttachSelection::CreateManaged,
        AttachBehavior::Skip => AttachSelection::Skip,
        AttachBehavior::UseRememberedName => {
            let Some(remembered) = ctx.remembered.as_deref() else {
                return AttachSelection::CreateManaged;
            };
            match helper.list_sessions(handle).await {
                Ok(sessions) if sessions.iter().any(|s| s.name == remembered) => {
                    AttachSelection::AttachExisting {
                        name: remembered.to_string(),
                        remember: false,
                    }
                }
                Ok(_) => {
                    log::info!(
                        "remembered session {remembered} not found on {}",
                        ctx.server_name
                    );
                    AttachSelection::CreateManaged
                }
                Err(e) => {
                    log::warn!("listing sessions on {} failed: {e}", ctx.server_name);
                    AttachSelection::CreateManaged
                }
            }
        }
        AttachBehavior::AskEveryTime => {
            let sessions = match helper.list_sessions(handle).await {
                Ok(sessions) => sessions,
                Err(e) => {
                    log::warn!("listing sessions on {} failed: {e}", ctx.server_name);
                    return AttachSelection::CreateManaged;
                }
            };
            let candidates: Vec<_> = sessions
                .into_iter()
                .filter(|s| !ctx.naming.is_managed(&s.name) || s.is_attached())
                .collect();
            if candidates.is_empty() {
                return AttachSelection::CreateManaged;
            }
            prompter
                .ask(AttachPrompt {
                    terminal: ctx.terminal,
                    server: ctx.server,
                    server_name: ctx.server_name.clone(),
                    candidates,
                })
                .await
        }
    }
}
