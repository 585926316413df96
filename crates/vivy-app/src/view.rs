use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use vivy_core::TerminalView;

/// The console standing in as a terminal's view while it is bridged.
///
/// Clones share state, so the bridge keeps one and hands the other to the
/// service.
#[derive(Clone, Default)]
pub struct ConsoleView {
    attached: Arc<AtomicBool>,
    released: Arc<AtomicBool>,
}

impl ConsoleView {
    pub fn new() -> Self {
        let view = Self::default();
        view.attached.store(true, Ordering::SeqCst);
        view
    }

    pub fn detach(&self) {
        self.attached.store(false, Ordering::SeqCst);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl TerminalView for ConsoleView {
    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    fn release(&mut self) {
        log::debug!("console view released");
        self.released.store(true, Ordering::SeqCst);
    }
}
