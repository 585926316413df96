//! Bounded LRU cache of heavyweight terminal views.

use std::collections::HashMap;

use lru::LruCache;

use crate::ids::TerminalId;

/// A rendering resource the UI layer attaches to a terminal.
pub trait TerminalView: Send {
    /// Still attached to a live window.
    fn is_attached(&self) -> bool;

    /// Free the resource. Called at most once.
    fn release(&mut self);
}

impl<T: TerminalView + ?Sized> TerminalView for Box<T> {
    fn is_attached(&self) -> bool {
        (**self).is_attached()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

pub struct ViewCache<V: TerminalView> {
    capacity: usize,
    entries: LruCache<TerminalId, V>,
    /// Removed while attached; released once the window lets go.
    deferred: HashMap<TerminalId, V>,
}

impl<V: TerminalView> ViewCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: LruCache::unbounded(),
            deferred: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, terminal: TerminalId) -> bool {
        self.entries.contains(&terminal)
    }

    pub fn is_deferred(&self, terminal: TerminalId) -> bool {
        self.deferred.contains_key(&terminal)
    }

    /// Insert `view` as most recently used and return the terminals evicted
    /// to make room. `selected` is never evicted.
    pub fn register(
        &mut self,
        terminal: TerminalId,
        view: V,
        selected: Option<TerminalId>,
    ) -> Vec<TerminalId> {
        if let Some(previous) = self.entries.pop(&terminal) {
            self.dispose(terminal, previous);
        }

        let mut evicted = Vec::new();
        let mut skipped = 0;
        while self.entries.len() >= self.capacity && skipped < self.entries.len() {
            let Some(oldest) = self.entries.peek_lru().map(|(id, _)| *id) else {
                break;
            };
            if Some(oldest) == selected {
                self.entries.promote(&oldest);
                skipped += 1;
                continue;
            }
            if let Some((id, view)) = self.entries.pop_lru() {
                log::debug!("evicting view for terminal {id}");
                self.dispose(id, view);
                evicted.push(id);
            }
        }

        self.entries.put(terminal, view);
        evicted
    }

    /// Mark `terminal` most recently used.
    pub fn touch(&mut self, terminal: TerminalId) -> bool {
        if self.entries.contains(&terminal) {
            self.entries.promote(&terminal);
            true
        } else {
            false
        }
    }

    /// Drop the view for `terminal`. Release is deferred while attached.
    pub fn release(&mut self, terminal: TerminalId) {
        if let Some(view) = self.entries.pop(&terminal) {
            self.dispose(terminal, view);
        }
    }

    /// The window showing `terminal` let go of its view.
    pub fn detached(&mut self, terminal: TerminalId) -> bool {
        match self.deferred.remove(&terminal) {
            Some(mut view) => {
                view.release();
                true
            }
            None => false,
        }
    }

    /// Cached terminals, least recently used first.
    pub fn lru_order(&self) -> Vec<TerminalId> {
        let mut order: Vec<TerminalId> = self.entries.iter().map(|(id, _)| *id).collect();
        order.reverse();
        order
    }

    /// Release everything, attached or not.
    pub fn clear(&mut self) {
        while let Some((_, mut view)) = self.entries.pop_lru() {
            view.release();
        }
        for (_, mut view) in self.deferred.drain() {
            view.release();
        }
    }

    fn dispose(&mut self, terminal: TerminalId, mut view: V) {
        if view.is_attached() {
            self.deferred.insert(terminal, view);
        } else {
            view.release();
        }
    }
}
