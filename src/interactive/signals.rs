//! Ctrl-C handling for chat sessions
//!
//! The first Ctrl-C aborts the running turn. A second one within two seconds
//! exits the process.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use crate::budget::{AbortCause, AbortScope};
use crate::{Error, Result};

/// Window in which a second Ctrl-C exits
const DOUBLE_PRESS_WINDOW: Duration = Duration::from_secs(2);

/// Exit status after a double Ctrl-C
const INTERRUPT_EXIT_CODE: i32 = 130;

/// Routes Ctrl-C to the active turn's abort scope
#[derive(Clone, Default)]
pub struct SignalHandler {
    active: Arc<Mutex<Option<AbortScope>>>,
    presses: Arc<AtomicUsize>,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the process-wide handler. Call once.
    pub fn install(&self) -> Result<()> {
        let handler = self.clone();
        ctrlc::set_handler(move || {
            if handler.interrupt() {
                info!("Second interrupt received, exiting");
                std::process::exit(INTERRUPT_EXIT_CODE);
            }
        })
        .map_err(|e| Error::Config(format!("Failed to set signal handler: {}", e)))
    }

    /// Handle one press. Returns true when it was the second press in the
    /// window.
    pub fn interrupt(&self) -> bool {
        let count = self.presses.fetch_add(1, Ordering::SeqCst);
        if count > 0 {
            return true;
        }

        if let Some(scope) = self.current() {
            debug!("Interrupting active turn");
            scope.abort(AbortCause::UserInterrupt);
        } else {
            eprintln!("\n\x1b[90m(press Ctrl-C again to exit)\x1b[0m");
        }

        let presses = self.presses.clone();
        std::thread::spawn(move || {
            std::thread::sleep(DOUBLE_PRESS_WINDOW);
            presses.store(0, Ordering::SeqCst);
        });
        false
    }

    /// Make `scope` the target of the next Ctrl-C
    pub fn arm(&self, scope: AbortScope) {
        if let Ok(mut active) = self.active.lock() {
            *active = Some(scope);
        }
    }

    /// Called when the turn ends
    pub fn disarm(&self) {
        if let Ok(mut active) = self.active.lock() {
            *active = None;
        }
    }

    fn current(&self) -> Option<AbortScope> {
        self.active.lock().ok().and_then(|active| active.clone())
    }
}

/// Replace the default panic output with a short report
pub fn install_panic_handler() {
    std::panic::set_hook(Box::new(|info| {
        let msg = if let Some(s) = info.payload().downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        let location = info
            .location()
            .map(|loc| format!(" at {}:{}", loc.file(), loc.line()))
            .unwrap_or_default();

        eprintln!("\n\x1b[31mpopper crashed unexpectedly\x1b[0m");
        eprintln!("\x1b[33mError:\x1b[0m {}{}\n", msg, location);
    }));
}
