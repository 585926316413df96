//! Live remote shells by terminal, plus the per-terminal start lock.
//!
//! The registry never performs I/O. Every operation that leaves a shell or
//! connection without an owner hands it back to the caller, which closes it
//! off the serialization domain.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::ids::{ServerId, TerminalId};
use crate::remote::{ConnectionHandle, ShellId};
use crate::state::ActiveTransport;

#[derive(Debug, Clone)]
pub struct ShellRegistration {
    pub server: ServerId,
    pub handle: ConnectionHandle,
    pub shell_id: ShellId,
    pub transport: ActiveTransport,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PendingStart {
    pub server: ServerId,
    pub handle: ConnectionHandle,
    pub started_at: Instant,
}

impl PendingStart {
    fn is_stale(&self, threshold: Duration) -> bool {
        self.started_at.elapsed() >= threshold
    }
}

#[derive(Debug)]
pub enum RegisterOutcome {
    /// The registration is live. A previous registration for the same
    /// terminal is returned so the caller can close its shell.
    Registered { replaced: Option<ShellRegistration> },
    /// A newer attempt owns the terminal. The caller must close the incoming
    /// shell and disconnect its handle.
    Stale,
}

#[derive(Debug, Default)]
pub struct Unregistered {
    pub registration: Option<ShellRegistration>,
    pub pending: Option<PendingStart>,
}

impl Unregistered {
    pub fn is_empty(&self) -> bool {
        self.registration.is_none() && self.pending.is_none()
    }
}

pub struct ShellRegistry {
    registrations: HashMap<TerminalId, ShellRegistration>,
    pending: HashMap<TerminalId, PendingStart>,
    stale_after: Duration,
    orphaned: Vec<ConnectionHandle>,
}

impl ShellRegistry {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            registrations: HashMap::new(),
            pending: HashMap::new(),
            stale_after,
            orphaned: Vec::new(),
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Reserve the start lock for `terminal`.
    ///
    /// Fails while a shell is registered or a fresh start is pending. A stale
    /// pending start is evicted first; its handle lands in
    /// [`take_orphaned`](Self::take_orphaned) if nothing else uses it.
    pub fn try_begin_start(&mut self, terminal: TerminalId, handle: &ConnectionHandle) -> bool {
        if self.registrations.contains_key(&terminal) {
            return false;
        }
        if self.is_start_in_flight(terminal) {
            return false;
        }
        self.pending.insert(
            terminal,
            PendingStart {
                server: handle.server(),
                handle: handle.clone(),
                started_at: Instant::now(),
            },
        );
        true
    }

    /// Release the start lock, but only if `handle` still holds it.
    pub fn finish_start(&mut self, terminal: TerminalId, handle: &ConnectionHandle) {
        if self
            .pending
            .get(&terminal)
            .is_some_and(|p| &p.handle == handle)
        {
            self.pending.remove(&terminal);
        }
    }

    pub fn is_start_in_flight(&mut self, terminal: TerminalId) -> bool {
        let Some(pending) = self.pending.get(&terminal) else {
            return false;
        };
        if !pending.is_stale(self.stale_after) {
            return true;
        }

        let Some(stale) = self.pending.remove(&terminal) else {
            return false;
        };
        log::warn!(
            "evicting stale start for terminal {terminal} (connection {}, age {:?})",
            stale.handle.id(),
            stale.started_at.elapsed()
        );
        if !self.has_client_references(&stale.handle) {
            self.orphaned.push(stale.handle);
        }
        false
    }

    /// Record a started shell.
    ///
    /// Accepted only from the attempt that currently holds the start lock; a
    /// registration with no matching pending start came from an attempt that
    /// was cancelled or superseded and is reported stale.
    pub fn register(
        &mut self,
        terminal: TerminalId,
        handle: ConnectionHandle,
        shell_id: ShellId,
        transport: ActiveTransport,
        fallback_reason: Option<String>,
    ) -> RegisterOutcome {
        match self.pending.get(&terminal) {
            Some(pending) if pending.handle == handle => {}
            _ => return RegisterOutcome::Stale,
        }
        self.pending.remove(&terminal);

        let registration = ShellRegistration {
            server: handle.server(),
            handle,
            shell_id,
            transport,
            fallback_reason,
        };
        let replaced = self.registrations.insert(terminal, registration);
        RegisterOutcome::Registered { replaced }
    }

    /// Drop everything held for `terminal`. The caller closes the returned
    /// shell and disconnects handles that [`has_client_references`] no longer
    /// reports.
    ///
    /// [`has_client_references`]: Self::has_client_references
    pub fn unregister(&mut self, terminal: TerminalId) -> Unregistered {
        Unregistered {
            registration: self.registrations.remove(&terminal),
            pending: self.pending.remove(&terminal),
        }
    }

    /// Whether any registration or pending start still uses `handle`.
    pub fn has_client_references(&self, handle: &ConnectionHandle) -> bool {
        self.registrations.values().any(|r| &r.handle == handle)
            || self.pending.values().any(|p| &p.handle == handle)
    }

    /// Like [`has_client_references`](Self::has_client_references), ignoring
    /// whatever `except` holds.
    pub fn has_other_references(&self, handle: &ConnectionHandle, except: TerminalId) -> bool {
        self.registrations
            .iter()
            .any(|(id, r)| *id != except && &r.handle == handle)
            || self
                .pending
                .iter()
                .any(|(id, p)| *id != except && &p.handle == handle)
    }

    /// A connected handle already serving `server`, for pooled connections.
    pub fn pooled_handle(&self, server: ServerId) -> Option<ConnectionHandle> {
        self.registrations
            .values()
            .find(|r| r.server == server && r.handle.client().is_connected())
            .map(|r| r.handle.clone())
    }

    pub fn registration(&self, terminal: TerminalId) -> Option<&ShellRegistration> {
        self.registrations.get(&terminal)
    }

    pub fn pending(&self, terminal: TerminalId) -> Option<&PendingStart> {
        self.pending.get(&terminal)
    }

    /// Handles evicted with stale starts that nothing references any more.
    pub fn take_orphaned(&mut self) -> Vec<ConnectionHandle> {
        std::mem::take(&mut self.orphaned)
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty() && self.pending.is_empty()
    }

    /// Every handle referenced by the registry, deduplicated.
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        let mut handles: Vec<ConnectionHandle> = Vec::new();
        let all = self
            .registrations
            .values()
            .map(|r| &r.handle)
            .chain(self.pending.values().map(|p| &p.handle));
        for handle in all {
            if !handles.contains(handle) {
                handles.push(handle.clone());
            }
        }
        handles
    }
}
