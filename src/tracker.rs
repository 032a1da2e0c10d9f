//! Tracking worker and alert command sinks.

use std::cell::Cell;
use std::process::Command;
use std::rc::Rc;

use tracing::{error, warn};

use crate::coordinator::{AlertSink, TrackingSink};
use crate::reaper::{self, Reaper};

/// Tracking worker driven as a supervised subprocess.
pub struct ProcessTracker {
    child: Rc<Cell<Option<u32>>>,
    command: Vec<String>,
    reaper: Reaper,
}

impl ProcessTracker {
    pub fn new(reaper: Reaper, command: Vec<String>) -> Self {
        Self { child: Default::default(), command, reaper }
    }
}

impl TrackingSink for ProcessTracker {
    fn start(&mut self) {
        let (program, args) = match self.command.split_first() {
            Some(split) => split,
            None => {
                warn!("No tracking worker configured");
                return;
            },
        };

        let mut command = Command::new(program);
        command.args(args);

        let child = self.child.clone();
        let pid = self.reaper.watch(
            command,
            Box::new(move |output| {
                child.set(None);

                if !output.status.success() {
                    warn!("Tracking worker exited: {}", output.status);
                }
            }),
        );

        self.child.set(pid);
    }

    fn stop(&mut self) {
        if let Some(pid) = self.child.take() {
            unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        }
    }
}

/// Alert retraction through the configured notifier command.
pub struct CommandAlerts {
    command: Vec<String>,
}

impl CommandAlerts {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl AlertSink for CommandAlerts {
    fn cancel_alert(&mut self) {
        let (program, args) = match self.command.split_first() {
            Some(split) => split,
            None => return,
        };

        if let Err(err) = reaper::daemon(program, args) {
            error!("Alert retraction failed: {err}");
        }
    }
}
