//! Status rendering and prompt dialogs.

use std::cell::RefCell;
use std::collections::HashMap;
use std::process::Command;
use std::rc::Rc;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::coordinator::{Coordinator, Prompt, PromptSurface};
use crate::dbus::modem_manager;
use crate::reaper::{self, Reaper};
use crate::source::gps::Gps;
use crate::source::permission::Permission;
use crate::status::{GpsStatus, PermissionStatus, SubscriptionId};

/// Status display and dialog host.
pub struct Frontend {
    coordinator: RefCell<Option<Coordinator>>,
    dialogs: Rc<RefCell<HashMap<Prompt, u32>>>,
    commands: HelperCommands,
    reaper: Reaper,
}

/// Configured command lines for dialogs and settings navigation.
#[derive(Clone)]
struct HelperCommands {
    gps_dialog: Vec<String>,
    permission_dialog: Vec<String>,
    location_settings: Vec<String>,
    permission_settings: Vec<String>,
}

impl Frontend {
    pub fn new(config: &Config, reaper: Reaper) -> Rc<Self> {
        let commands = HelperCommands {
            gps_dialog: config.prompts.gps_command.clone(),
            permission_dialog: config.prompts.permission_command.clone(),
            location_settings: config.settings.location_command.clone(),
            permission_settings: config.settings.permission_command.clone(),
        };

        Rc::new(Self {
            coordinator: RefCell::new(None),
            dialogs: Default::default(),
            commands,
            reaper,
        })
    }

    /// Wire the coordinator after construction.
    pub fn attach(&self, coordinator: Coordinator) {
        *self.coordinator.borrow_mut() = Some(coordinator);
    }

    /// Subscribe the status displays.
    ///
    /// Returns the display subscriptions for teardown.
    pub fn subscribe(
        &self,
        gps: &Gps,
        permission: &Permission,
    ) -> (SubscriptionId, SubscriptionId) {
        let gps_id = gps.observe(|status| info!("{}", gps_message(status)));
        let permission_id =
            permission.observe(|status| info!("{}", permission_message(status)));

        (gps_id, permission_id)
    }
}

impl PromptSurface for Frontend {
    fn show(&self, prompt: Prompt) {
        let coordinator = match self.coordinator.borrow().clone() {
            Some(coordinator) => coordinator,
            None => return,
        };

        let command = match prompt {
            Prompt::Gps => &self.commands.gps_dialog,
            Prompt::Permission => &self.commands.permission_dialog,
        };
        let (program, args) = match command.split_first() {
            Some(split) => split,
            None => {
                warn!("No dialog command configured for {prompt:?}");
                coordinator.prompt_dismissed(prompt);
                return;
            },
        };

        let mut dialog = Command::new(program);
        dialog.args(args);

        // Route the dialog's answer once it gets reaped.
        let dialogs = self.dialogs.clone();
        let commands = self.commands.clone();
        let dialog_coordinator = coordinator.clone();
        let pid = self.reaper.watch(
            dialog,
            Box::new(move |output| {
                dialogs.borrow_mut().remove(&prompt);
                dialog_coordinator.prompt_dismissed(prompt);

                // An affirmative answer routes to the condition's remedy.
                if output.status.success() {
                    match prompt {
                        Prompt::Gps => open_location_settings(&commands),
                        Prompt::Permission => dialog_coordinator.retry_permission(),
                    }
                }
            }),
        );

        match pid {
            Some(pid) => {
                self.dialogs.borrow_mut().insert(prompt, pid);
            },
            // Failed dialogs must not leave the prompt marked visible.
            None => coordinator.prompt_dismissed(prompt),
        }
    }

    fn dismiss(&self, prompt: Prompt) {
        if let Some(pid) = self.dialogs.borrow_mut().remove(&prompt) {
            unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        }
    }

    fn open_settings(&self, prompt: Prompt) {
        match prompt {
            Prompt::Gps => open_location_settings(&self.commands),
            Prompt::Permission => {
                if !spawn_helper(&self.commands.permission_settings) {
                    warn!("No permission settings command configured");
                }
            },
        }
    }
}

/// Open the system surface for enabling the location sensor.
fn open_location_settings(commands: &HelperCommands) {
    // Without a settings command the sensor is enabled directly.
    if !spawn_helper(&commands.location_settings) {
        modem_manager::set_gps_enabled(true);
    }
}

/// Spawn a configured helper command, reporting whether one was configured.
fn spawn_helper(command: &[String]) -> bool {
    let (program, args) = match command.split_first() {
        Some(split) => split,
        None => return false,
    };

    if let Err(err) = reaper::daemon(program, args) {
        error!("Failed spawning {program:?}: {err}");
    }

    true
}

/// Human-readable GPS status line.
fn gps_message(status: GpsStatus) -> &'static str {
    match status {
        GpsStatus::Enabled => "Location sensor is enabled",
        GpsStatus::Disabled => "Location sensor is disabled, waiting for it to be turned on",
    }
}

/// Human-readable permission status line.
fn permission_message(status: PermissionStatus) -> &'static str {
    match status {
        PermissionStatus::Granted => "Location permission is granted",
        PermissionStatus::Denied => "Waiting for the location permission to be granted",
        PermissionStatus::Blocked => "Location permission is blocked, check the system settings",
    }
}
