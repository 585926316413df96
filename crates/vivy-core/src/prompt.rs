//! One-at-a-time queue of "which remote session?" questions.
//!
//! A connect worker that needs the user's choice enqueues an [`AttachPrompt`]
//! with a oneshot reply and awaits it. At most one prompt is shown; the rest
//! wait in FIFO order. Cancelling a prompt answers it with
//! [`AttachSelection::Skip`], so no caller is ever left suspended.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};

use crate::ids::{ServerId, TerminalId};
use crate::multiplexer::RemoteSession;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachPrompt {
    pub terminal: TerminalId,
    pub server: ServerId,
    pub server_name: String,
    pub candidates: Vec<RemoteSession>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachSelection {
    CreateManaged,
    /// Attach to a session the user already owns. `remember` stores the name
    /// as the server's remembered session.
    AttachExisting { name: String, remember: bool },
    Skip,
}

struct Entry {
    prompt: AttachPrompt,
    reply: oneshot::Sender<AttachSelection>,
}

pub struct PromptQueue {
    current: Option<Entry>,
    queue: VecDeque<Entry>,
    published: watch::Sender<Option<AttachPrompt>>,
}

impl PromptQueue {
    pub fn new() -> Self {
        let (published, _) = watch::channel(None);
        Self {
            current: None,
            queue: VecDeque::new(),
            published,
        }
    }

    /// Observe the prompt currently shown.
    pub fn subscribe(&self) -> watch::Receiver<Option<AttachPrompt>> {
        self.published.subscribe()
    }

    pub fn current(&self) -> Option<&AttachPrompt> {
        self.current.as_ref().map(|e| &e.prompt)
    }

    /// Shown plus queued prompts.
    pub fn len(&self) -> usize {
        self.queue.len() + usize::from(self.current.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_pending(&self, terminal: TerminalId) -> bool {
        self.current().is_some_and(|p| p.terminal == terminal)
            || self.queue.iter().any(|e| e.prompt.terminal == terminal)
    }

    /// Enqueue `prompt` and return the receiver its answer arrives on.
    pub fn request_selection(&mut self, prompt: AttachPrompt) -> oneshot::Receiver<AttachSelection> {
        let (tx, rx) = oneshot::channel();
        self.request(prompt, tx);
        rx
    }

    /// Enqueue `prompt`, answering on `reply`. An older prompt for the same
    /// terminal is superseded and answered with Skip.
    pub fn request(&mut self, prompt: AttachPrompt, reply: oneshot::Sender<AttachSelection>) {
        self.resolve(prompt.terminal, AttachSelection::Skip);
        self.queue.push_back(Entry { prompt, reply });
        if self.current.is_none() {
            self.advance();
        }
    }

    /// Answer the prompt for `terminal`. Returns false if none was pending.
    pub fn resolve(&mut self, terminal: TerminalId, selection: AttachSelection) -> bool {
        if self
            .current
            .as_ref()
            .is_some_and(|e| e.prompt.terminal == terminal)
        {
            if let Some(entry) = self.current.take() {
                let _ = entry.reply.send(selection);
            }
            self.advance();
            return true;
        }

        match self.queue.iter().position(|e| e.prompt.terminal == terminal) {
            Some(index) => {
                if let Some(entry) = self.queue.remove(index) {
                    let _ = entry.reply.send(selection);
                }
                true
            }
            None => false,
        }
    }

    pub fn cancel(&mut self, terminal: TerminalId) -> bool {
        self.resolve(terminal, AttachSelection::Skip)
    }

    /// Answer every outstanding prompt with Skip.
    pub fn cancel_all(&mut self) {
        if let Some(entry) = self.current.take() {
            let _ = entry.reply.send(AttachSelection::Skip);
        }
        for entry in self.queue.drain(..) {
            let _ = entry.reply.send(AttachSelection::Skip);
        }
        self.publish();
    }

    fn advance(&mut self) {
        self.current = None;
        while let Some(entry) = self.queue.pop_front() {
            // The asking worker is gone; nobody would read the answer.
            if entry.reply.is_closed() {
                continue;
            }
            self.current = Some(entry);
            break;
        }
        self.publish();
    }

    fn publish(&self) {
        self.published.send_replace(self.current().cloned());
    }
}

impl Default for PromptQueue {
    fn default() -> Self {
        Self::new()
    }
}
