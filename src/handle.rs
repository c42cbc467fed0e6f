//! Server Handle
//!
//! Everything an operator command may touch, bundled into the one value
//! the reactor owns.

use std::sync::Arc;

use crate::config::Settings;
use crate::log::Logger;
use crate::network::listener::Listener;

/// Context handed to console commands.
pub struct ServerHandle {
    /// Loaded settings.
    pub settings: Arc<Settings>,
    /// Producer handle for the process log.
    pub logger: Logger,
    /// Connection listener and rosters.
    pub listener: Listener,
    running: bool,
    help: Vec<String>,
}

impl ServerHandle {
    /// Bundle a listener with its settings and logger.
    pub fn new(settings: Arc<Settings>, logger: Logger, listener: Listener) -> Self {
        Self {
            settings,
            logger,
            listener,
            running: true,
            help: Vec::new(),
        }
    }

    /// Ask the reactor to stop after the current event.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Has `stop` not been called yet.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Lines printed by the `help` command.
    pub fn help(&self) -> &[String] {
        &self.help
    }

    pub(crate) fn set_help(&mut self, help: Vec<String>) {
        self.help = help;
    }
}
