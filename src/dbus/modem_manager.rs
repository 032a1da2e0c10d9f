//! ModemManager DBus interface.

use std::thread;

use calloop::channel::Sender;
use futures_lite::StreamExt;
use tokio::runtime::Builder;
use tokio::sync::oneshot;
use tracing::error;
use zbus::fdo::ObjectManagerProxy;
use zbus::{Connection, proxy};

use crate::Result;
use crate::source::gps::{GpsMonitor, WatchGuard};

/// Location sources counting as GPS.
///
/// `MM_MODEM_LOCATION_SOURCE_GPS_RAW | MM_MODEM_LOCATION_SOURCE_GPS_NMEA`.
const GPS_SOURCES: u32 = 0x2 | 0x4;

/// GPS monitoring backed by ModemManager.
pub struct ModemGps;

impl GpsMonitor for ModemGps {
    fn watch(&self, tx: Sender<bool>) -> WatchGuard {
        let (stop_tx, stop_rx) = oneshot::channel();

        // Spawn async executor for the DBus loop on a new thread.
        thread::spawn(move || {
            let mut builder = Builder::new_current_thread();
            let runtime = builder.enable_all().build().expect("create tokio runtime");
            if let Err(err) = runtime.block_on(run_dbus_loop(tx, stop_rx)) {
                error!("GPS monitoring failed: {err}");
            }
        });

        WatchGuard::new(stop_tx)
    }

    fn query(&self, tx: Sender<bool>) {
        thread::spawn(move || {
            let mut builder = Builder::new_current_thread();
            let runtime = builder.enable_all().build().expect("create tokio runtime");
            match runtime.block_on(gps_enabled()) {
                Ok(enabled) => {
                    let _ = tx.send(enabled);
                },
                Err(err) => error!("GPS status check failed: {err}"),
            }
        });
    }
}

/// Set the modem GPS state.
pub fn set_gps_enabled(enabled: bool) {
    // Async function for updating the location sources of the primary modem.
    let set_location_sources = move || async move {
        let connection = Connection::system().await?;
        let object_manager = object_manager(&connection).await?;

        let location = match primary_location(&connection, &object_manager).await {
            Some(location) => location,
            None => return Ok(()),
        };

        let sources = if enabled { GPS_SOURCES } else { 0 };
        if let Err(err) = location.setup(sources, false).await {
            error!("GPS state change failed: {err}");
        }

        Ok::<(), zbus::Error>(())
    };

    // Spawn async executor for the update on a new thread.
    thread::spawn(move || {
        let mut builder = Builder::new_current_thread();
        let runtime = builder.enable_all().build().expect("create tokio runtime");
        if let Err(err) = runtime.block_on(set_location_sources()) {
            error!("GPS state change failed: {err}");
        }
    });
}

/// Run the DBus GPS event loop.
async fn run_dbus_loop(tx: Sender<bool>, mut stop_rx: oneshot::Receiver<()>) -> Result<()> {
    let connection = Connection::system().await?;

    // Create object manager for modem changes.
    let object_manager = object_manager(&connection).await?;

    // Get streams for new/removed modems.
    let mut modem_added_stream = object_manager.receive_interfaces_added().await?;
    let mut modem_removed_stream = object_manager.receive_interfaces_removed().await?;

    // Resolve the primary modem's location interface.
    let mut location = primary_location(&connection, &object_manager).await;

    // Post the initial enabled flag.
    if tx.send(gps_sources_enabled(&location).await).is_err() {
        return Ok(());
    }

    let mut enabled_stream = match &location {
        Some(location) => Some(location.receive_enabled_changed().await),
        None => None,
    };

    loop {
        // Extract the optional stream, since async Rust sucks.
        let enabled_future = async {
            match &mut enabled_stream {
                Some(enabled_stream) => enabled_stream.next().await,
                None => None,
            }
        };

        let rebuild = tokio::select! {
            // Stop once the last observer detached.
            _ = &mut stop_rx => return Ok(()),

            // Wait for enabled location source changes.
            Some(change) = enabled_future => {
                let enabled =
                    change.get().await.is_ok_and(|sources| sources & GPS_SOURCES != 0);
                if tx.send(enabled).is_err() {
                    return Ok(());
                }
                false
            },

            // Wait for new/removed modems.
            Some(_) = modem_added_stream.next() => true,
            Some(_) = modem_removed_stream.next() => true,

            else => continue,
        };

        if rebuild {
            location = primary_location(&connection, &object_manager).await;
            enabled_stream = match &location {
                Some(location) => Some(location.receive_enabled_changed().await),
                None => None,
            };

            if tx.send(gps_sources_enabled(&location).await).is_err() {
                return Ok(());
            }
        }
    }
}

/// Get the current GPS enabled flag.
async fn gps_enabled() -> Result<bool> {
    let connection = Connection::system().await?;
    let object_manager = object_manager(&connection).await?;
    let location = primary_location(&connection, &object_manager).await;

    Ok(gps_sources_enabled(&location).await)
}

/// Check whether any GPS source is enabled on a location interface.
async fn gps_sources_enabled(location: &Option<LocationProxy<'_>>) -> bool {
    match location {
        Some(location) => {
            location.enabled().await.is_ok_and(|sources| sources & GPS_SOURCES != 0)
        },
        None => false,
    }
}

/// Create object manager for tracking DBus modem objects.
async fn object_manager(connection: &Connection) -> zbus::Result<ObjectManagerProxy<'_>> {
    ObjectManagerProxy::builder(connection)
        .destination("org.freedesktop.ModemManager1")?
        .path("/org/freedesktop/ModemManager1")?
        .build()
        .await
}

/// Get the location interface of the first available modem.
async fn primary_location<'a>(
    connection: &'a Connection,
    object_manager: &ObjectManagerProxy<'a>,
) -> Option<LocationProxy<'a>> {
    let managed_objects = object_manager.get_managed_objects().await;

    for (path, _) in managed_objects.into_iter().flatten() {
        if !path.starts_with("/org/freedesktop/ModemManager1/Modem/") {
            continue;
        }

        let builder = match LocationProxy::builder(connection).path(path) {
            Ok(builder) => builder,
            Err(_) => continue,
        };

        if let Ok(location) = builder.build().await {
            return Some(location);
        }
    }

    None
}

#[proxy(
    interface = "org.freedesktop.ModemManager1.Modem.Location",
    default_service = "org.freedesktop.ModemManager1",
    default_path = "/org/freedesktop/ModemManager1/Modem/0"
)]
trait Location {
    /// Setup method
    fn setup(&self, sources: u32, signal_location: bool) -> zbus::Result<()>;

    /// SetGpsRefreshRate method
    fn set_gps_refresh_rate(&self, rate: u32) -> zbus::Result<()>;

    /// Capabilities property
    #[zbus(property)]
    fn capabilities(&self) -> zbus::Result<u32>;

    /// Enabled property
    #[zbus(property)]
    fn enabled(&self) -> zbus::Result<u32>;

    /// GpsRefreshRate property
    #[zbus(property)]
    fn gps_refresh_rate(&self) -> zbus::Result<u32>;
}
