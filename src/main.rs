use std::error::Error;
use std::rc::Rc;
use std::result::Result as StdResult;

use calloop::signals::{Signal, Signals};
use calloop::{EventLoop, LoopHandle};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::dbus::modem_manager::ModemGps;
use crate::dbus::portal::PortalBroker;
use crate::frontend::Frontend;
use crate::reaper::Reaper;
use crate::source::gps::Gps;
use crate::source::permission::{Mode, Permission};
use crate::status::SubscriptionId;
use crate::tracker::{CommandAlerts, ProcessTracker};

mod config;
mod coordinator;
mod dbus;
mod frontend;
mod reaper;
mod source;
mod status;
mod tracker;

/// Convenience result wrapper.
pub type Result<T> = StdResult<T, Box<dyn Error>>;

fn main() {
    // Initialize logging.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = Config::load();

    // Initialize calloop event loop.
    let mut event_loop = EventLoop::try_new().expect("initialize event loop");

    // Setup shared state.
    let mut state = State::new(event_loop.handle(), config).expect("state setup");

    // Start event loop.
    while !state.terminated {
        event_loop.dispatch(None, &mut state).expect("event dispatch");
    }
}

/// Daemon state.
pub struct State {
    displays: (SubscriptionId, SubscriptionId),
    coordinator: Coordinator,
    permission: Rc<Permission>,
    gps: Rc<Gps>,
    terminated: bool,
}

impl State {
    fn new(event_loop: LoopHandle<'static, Self>, config: Config) -> Result<Self> {
        let reaper = Reaper::new(&event_loop)?;

        // Initialize the status sources.
        let gps = Gps::new(&event_loop, Rc::new(ModemGps))?;
        let broker = Rc::new(PortalBroker::new(config.permission.app_id.clone()));
        let mode = if config.permission.service { Mode::Service } else { Mode::Interactive };
        let permission = Permission::new(&event_loop, broker, mode)?;

        // Wire the presentation glue and the command sinks.
        let frontend = Frontend::new(&config, reaper.clone());
        let tracker = Box::new(ProcessTracker::new(reaper, config.tracking.command));
        let alerts = Box::new(CommandAlerts::new(config.alerts.cancel_command));
        let coordinator =
            Coordinator::new(gps.clone(), permission.clone(), tracker, alerts, frontend.clone());
        frontend.attach(coordinator.clone());
        let displays = frontend.subscribe(&gps, &permission);

        // Tracking control through UNIX signals.
        let signals = Signals::new(&[
            Signal::SIGUSR1,
            Signal::SIGUSR2,
            Signal::SIGHUP,
            Signal::SIGINT,
            Signal::SIGTERM,
        ])?;
        event_loop.insert_source(signals, |event, _, state| match event.signal() {
            // Tracking toggle, mirroring a panel button.
            Signal::SIGUSR1 => {
                if state.coordinator.is_tracking() {
                    state.coordinator.stop_tracking();
                } else if let Err(err) = state.coordinator.start_tracking() {
                    warn!(
                        "Tracking not started: {err} (gps: {:?}, permission: {:?})",
                        state.gps.status(),
                        state.permission.status(),
                    );
                }
            },
            Signal::SIGUSR2 => state.coordinator.stop_tracking(),
            // Re-run the checks for whichever condition blocks readiness.
            Signal::SIGHUP => {
                if !state.coordinator.can_start_tracking() {
                    state.coordinator.retry_permission();
                    state.coordinator.retry_gps();
                }
            },
            _ => {
                state.coordinator.stop_tracking();

                // Detach every observer so sensor monitoring stops before exit.
                let (gps_display, permission_display) = state.displays;
                state.gps.unobserve(gps_display);
                state.permission.unobserve(permission_display);
                state.coordinator.shutdown();

                state.terminated = true;
            },
        })?;

        Ok(Self { displays, coordinator, permission, gps, terminated: false })
    }
}
