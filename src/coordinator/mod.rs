//! Combined status gating and tracking commands.

use std::cell::RefCell;
use std::mem;
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, info};

use crate::source::gps::Gps;
use crate::source::permission::Permission;
use crate::status::{GpsStatus, PermissionStatus, SubscriptionId};


/// Tracking worker commands.
pub trait TrackingSink {
    fn start(&mut self);

    fn stop(&mut self);
}

/// Out-of-app alert commands.
pub trait AlertSink {
    /// Retract any active alert.
    fn cancel_alert(&mut self);
}

/// Modal prompt host.
///
/// Implementations own the dialog lifecycle and report closure back through
/// [`Coordinator::prompt_dismissed`]. The coordinator invokes these methods
/// without holding internal borrows, so calling back into it is safe.
pub trait PromptSurface {
    /// Show the prompt for a blocking condition.
    fn show(&self, prompt: Prompt);

    /// Retract a visible prompt.
    fn dismiss(&self, prompt: Prompt);

    /// Open the system-level settings remedying the condition.
    fn open_settings(&self, prompt: Prompt);
}

/// Modal prompt kinds.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Prompt {
    /// Ask the user to enable the location sensor.
    Gps,

    /// Ask the user to grant the location permission.
    Permission,
}

/// Condition blocking tracking startup.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Error)]
pub enum NotReadyReason {
    #[error("location sensor is disabled")]
    GpsDisabled,
    #[error("location permission is not granted")]
    PermissionDenied,
    #[error("location permission is blocked")]
    PermissionBlocked,
}

/// Failure starting the tracking session.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Error)]
pub enum StartError {
    #[error("not ready: {0}")]
    NotReady(NotReadyReason),
    #[error("tracking is already running")]
    AlreadyRunning,
}

/// Combined status orchestrator.
///
/// Subscribes to both status sources, gates the tracking commands on their
/// combination and decides which prompt may be visible.
#[derive(Clone)]
pub struct Coordinator {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    gps: Rc<Gps>,
    permission: Rc<Permission>,
    latest_gps: Option<GpsStatus>,
    latest_permission: Option<PermissionStatus>,
    tracking: bool,
    tracker: Box<dyn TrackingSink>,
    alerts: Box<dyn AlertSink>,
    prompts: Rc<dyn PromptSurface>,
    visible_prompt: Option<Prompt>,
    subscriptions: Option<(SubscriptionId, SubscriptionId)>,
}

impl Coordinator {
    /// Create the coordinator and subscribe it to both sources.
    pub fn new(
        gps: Rc<Gps>,
        permission: Rc<Permission>,
        tracker: Box<dyn TrackingSink>,
        alerts: Box<dyn AlertSink>,
        prompts: Rc<dyn PromptSurface>,
    ) -> Self {
        let inner = Inner {
            gps: gps.clone(),
            permission: permission.clone(),
            tracker,
            alerts,
            prompts,
            latest_gps: None,
            latest_permission: None,
            tracking: false,
            visible_prompt: None,
            subscriptions: None,
        };
        let coordinator = Self { inner: Rc::new(RefCell::new(inner)) };

        let handle = coordinator.clone();
        let gps_id = gps.observe(move |status| handle.on_gps(status));
        let handle = coordinator.clone();
        let permission_id = permission.observe(move |status| handle.on_permission(status));
        coordinator.inner.borrow_mut().subscriptions = Some((gps_id, permission_id));

        coordinator
    }

    /// Detach the coordinator's source subscriptions.
    pub fn shutdown(&self) {
        let (gps, permission, subscriptions) = {
            let mut inner = self.inner.borrow_mut();
            (inner.gps.clone(), inner.permission.clone(), inner.subscriptions.take())
        };

        if let Some((gps_id, permission_id)) = subscriptions {
            gps.unobserve(gps_id);
            permission.unobserve(permission_id);
        }
    }

    /// Check whether both conditions allow tracking.
    pub fn can_start_tracking(&self) -> bool {
        self.inner.borrow().not_ready_reason().is_none()
    }

    /// Whether a tracking session is running.
    pub fn is_tracking(&self) -> bool {
        self.inner.borrow().tracking
    }

    /// Start the tracking session.
    ///
    /// Refused without side effects unless both conditions are satisfied and
    /// no session is running.
    pub fn start_tracking(&self) -> Result<(), StartError> {
        let mut inner = self.inner.borrow_mut();

        if let Some(reason) = inner.not_ready_reason() {
            return Err(StartError::NotReady(reason));
        }
        if inner.tracking {
            return Err(StartError::AlreadyRunning);
        }

        inner.tracking = true;
        inner.tracker.start();
        info!("tracking session started");

        Ok(())
    }

    /// Stop the tracking session.
    ///
    /// Safe to call while stopped; the out-of-app alert is retracted either
    /// way.
    pub fn stop_tracking(&self) {
        let mut inner = self.inner.borrow_mut();

        if mem::take(&mut inner.tracking) {
            inner.tracker.stop();
            info!("tracking session stopped");
        }

        inner.alerts.cancel_alert();
    }

    /// Re-check the sensor after the user tapped the GPS status.
    ///
    /// Shows the GPS prompt unless one is already visible; a tap while the
    /// prompt is open re-checks without opening a second one.
    pub fn retry_gps(&self) {
        let (gps, prompts, show) = {
            let mut inner = self.inner.borrow_mut();
            let disabled = inner.latest_gps == Some(GpsStatus::Disabled);
            let show = disabled && inner.mark_prompt(Prompt::Gps);
            (inner.gps.clone(), inner.prompts.clone(), show)
        };

        gps.refresh();

        if show {
            prompts.show(Prompt::Gps);
        }
    }

    /// Re-run the permission check after the user tapped the permission
    /// status.
    ///
    /// A blocked permission can only be remedied through system settings, so
    /// it navigates there instead of prompting.
    pub fn retry_permission(&self) {
        let (permission, prompts, latest) = {
            let inner = self.inner.borrow();
            (inner.permission.clone(), inner.prompts.clone(), inner.latest_permission)
        };

        match latest {
            Some(PermissionStatus::Blocked) => prompts.open_settings(Prompt::Permission),
            Some(PermissionStatus::Granted) => (),
            Some(PermissionStatus::Denied) | None => permission.trigger_interactive_check(),
        }
    }

    /// Note a prompt's dialog as closed.
    pub fn prompt_dismissed(&self, prompt: Prompt) {
        self.inner.borrow_mut().clear_prompt(prompt);
    }

    fn on_gps(&self, status: GpsStatus) {
        let (prompts, dismiss) = {
            let mut inner = self.inner.borrow_mut();
            inner.latest_gps = Some(status);

            // An enabled sensor retracts its own prompt.
            let dismiss = status == GpsStatus::Enabled && inner.clear_prompt(Prompt::Gps);
            (inner.prompts.clone(), dismiss)
        };

        debug!("gps status changed: {status:?}");

        if dismiss {
            prompts.dismiss(Prompt::Gps);
        }
    }

    fn on_permission(&self, status: PermissionStatus) {
        let mut dismiss = None;
        let mut show = None;

        let prompts = {
            let mut inner = self.inner.borrow_mut();
            inner.latest_permission = Some(status);

            match status {
                PermissionStatus::Granted => {
                    if inner.clear_prompt(Prompt::Permission) {
                        dismiss = Some(Prompt::Permission);
                    }

                    // Permission satisfied; fall through to the GPS gate.
                    let gps_disabled = inner.latest_gps == Some(GpsStatus::Disabled);
                    if gps_disabled && inner.mark_prompt(Prompt::Gps) {
                        show = Some(Prompt::Gps);
                    }
                },
                PermissionStatus::Denied => {
                    // Permission outranks GPS in prompting priority.
                    if inner.clear_prompt(Prompt::Gps) {
                        dismiss = Some(Prompt::Gps);
                    }

                    if inner.mark_prompt(Prompt::Permission) {
                        show = Some(Prompt::Permission);
                    }
                },
                PermissionStatus::Blocked => {
                    // Only settings navigation can remedy a block.
                    if let Some(prompt) = inner.visible_prompt.take() {
                        dismiss = Some(prompt);
                    }
                },
            }

            inner.prompts.clone()
        };

        debug!("permission status changed: {status:?}");

        if let Some(prompt) = dismiss {
            prompts.dismiss(prompt);
        }
        if let Some(prompt) = show {
            prompts.show(prompt);
        }
    }
}

impl Inner {
    fn not_ready_reason(&self) -> Option<NotReadyReason> {
        match self.latest_permission {
            Some(PermissionStatus::Granted) => (),
            Some(PermissionStatus::Blocked) => return Some(NotReadyReason::PermissionBlocked),
            // Unknown gates like a denial; permission precedes GPS.
            Some(PermissionStatus::Denied) | None => return Some(NotReadyReason::PermissionDenied),
        }

        match self.latest_gps {
            Some(GpsStatus::Enabled) => None,
            Some(GpsStatus::Disabled) | None => Some(NotReadyReason::GpsDisabled),
        }
    }

    /// Mark a prompt visible, upholding the single-prompt invariant.
    ///
    /// Returns whether the prompt may be shown.
    fn mark_prompt(&mut self, prompt: Prompt) -> bool {
        if self.visible_prompt.is_some() {
            return false;
        }

        self.visible_prompt = Some(prompt);
        true
    }

    /// Clear a visible prompt, returning whether it was visible.
    fn clear_prompt(&mut self, prompt: Prompt) -> bool {
        if self.visible_prompt == Some(prompt) {
            self.visible_prompt = None;
            return true;
        }

        false
    }
}
