//! XDG desktop portal DBus interface.

use std::collections::HashMap;
use std::thread;

use calloop::channel::Sender;
use futures_lite::StreamExt;
use tokio::runtime::Builder;
use tracing::error;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};
use zbus::{Connection, proxy};

use crate::source::permission::PermissionBroker;
use crate::status::PermissionStatus;

/// Permission store table holding location grants.
const LOCATION_TABLE: &str = "location";

/// Handle token identifying this application's portal requests.
const HANDLE_TOKEN: &str = "lodestone";

/// Permission broker backed by the XDG desktop portal.
pub struct PortalBroker {
    app_id: String,
}

impl PortalBroker {
    pub fn new(app_id: String) -> Self {
        Self { app_id }
    }
}

impl PermissionBroker for PortalBroker {
    fn check(&self, reply: Sender<PermissionStatus>) {
        let app_id = self.app_id.clone();

        thread::spawn(move || {
            let mut builder = Builder::new_current_thread();
            let runtime = builder.enable_all().build().expect("create tokio runtime");

            let status = runtime.block_on(check_permission(&app_id)).unwrap_or_else(|err| {
                error!("Permission check failed: {err}");
                PermissionStatus::Denied
            });

            // Silent checks cannot prompt, so a sticky refusal stays a denial.
            let status = match status {
                PermissionStatus::Granted => PermissionStatus::Granted,
                PermissionStatus::Denied | PermissionStatus::Blocked => PermissionStatus::Denied,
            };

            let _ = reply.send(status);
        });
    }

    fn request(&self, reply: Sender<PermissionStatus>) {
        let app_id = self.app_id.clone();

        thread::spawn(move || {
            let mut builder = Builder::new_current_thread();
            let runtime = builder.enable_all().build().expect("create tokio runtime");

            let status = runtime.block_on(request_permission(&app_id)).unwrap_or_else(|err| {
                error!("Permission request failed: {err}");
                PermissionStatus::Denied
            });

            let _ = reply.send(status);
        });
    }
}

/// Look up the current grant in the portal permission store.
async fn check_permission(app_id: &str) -> zbus::Result<PermissionStatus> {
    let connection = Connection::session().await?;
    let store = PermissionStoreProxy::new(&connection).await?;

    Ok(lookup_grant(&store, app_id).await)
}

/// Run the portal's interactive location request flow.
async fn request_permission(app_id: &str) -> zbus::Result<PermissionStatus> {
    let connection = Connection::session().await?;
    let store = PermissionStoreProxy::new(&connection).await?;

    // Skip the dialog for an existing grant.
    if lookup_grant(&store, app_id).await == PermissionStatus::Granted {
        return Ok(PermissionStatus::Granted);
    }

    let portal = LocationPortalProxy::new(&connection).await?;

    // Create a location session for the prompt.
    let mut options = HashMap::new();
    options.insert("session_handle_token", Value::from(HANDLE_TOKEN));
    let session = portal.create_session(options).await?;

    // Start it; the portal shows the system prompt when required.
    let mut options = HashMap::new();
    options.insert("handle_token", Value::from(HANDLE_TOKEN));
    let request_path = portal.start(&ObjectPath::from(&session), "", options).await?;

    // Wait for the prompt's terminal response.
    let request = RequestProxy::builder(&connection).path(request_path)?.build().await?;
    let mut responses = request.receive_response().await?;
    let response = match responses.next().await {
        Some(signal) => signal.args()?.response,
        None => return Ok(PermissionStatus::Denied),
    };

    match response {
        0 => Ok(PermissionStatus::Granted),
        // The store tells a sticky refusal apart from a simple "no".
        _ => match lookup_grant(&store, app_id).await {
            PermissionStatus::Blocked => Ok(PermissionStatus::Blocked),
            _ => Ok(PermissionStatus::Denied),
        },
    }
}

/// Map the store entry for an application to a permission status.
async fn lookup_grant(store: &PermissionStoreProxy<'_>, app_id: &str) -> PermissionStatus {
    let (permissions, _) = match store.lookup(LOCATION_TABLE, LOCATION_TABLE).await {
        Ok(entry) => entry,
        // A missing table or entry means the user was never asked.
        Err(_) => return PermissionStatus::Denied,
    };

    match permissions.get(app_id).and_then(|values| values.first()) {
        // The store records the granted accuracy; `NONE` is a sticky refusal.
        Some(accuracy) if accuracy == "NONE" => PermissionStatus::Blocked,
        Some(_) => PermissionStatus::Granted,
        None => PermissionStatus::Denied,
    }
}

#[proxy(
    interface = "org.freedesktop.impl.portal.PermissionStore",
    default_service = "org.freedesktop.impl.portal.PermissionStore",
    default_path = "/org/freedesktop/impl/portal/PermissionStore"
)]
trait PermissionStore {
    /// Lookup method
    fn lookup(
        &self,
        table: &str,
        id: &str,
    ) -> zbus::Result<(HashMap<String, Vec<String>>, OwnedValue)>;

    /// SetPermission method
    fn set_permission(
        &self,
        table: &str,
        create: bool,
        id: &str,
        app: &str,
        permissions: &[&str],
    ) -> zbus::Result<()>;

    /// Changed signal
    #[zbus(signal)]
    fn changed(
        &self,
        table: &str,
        id: &str,
        deleted: bool,
        data: OwnedValue,
        permissions: HashMap<String, Vec<String>>,
    ) -> zbus::Result<()>;
}

#[proxy(
    interface = "org.freedesktop.portal.Location",
    default_service = "org.freedesktop.portal.Desktop",
    default_path = "/org/freedesktop/portal/desktop"
)]
trait LocationPortal {
    /// CreateSession method
    fn create_session(
        &self,
        options: HashMap<&str, Value<'_>>,
    ) -> zbus::Result<OwnedObjectPath>;

    /// Start method
    fn start(
        &self,
        session_handle: &ObjectPath<'_>,
        parent_window: &str,
        options: HashMap<&str, Value<'_>>,
    ) -> zbus::Result<OwnedObjectPath>;
}

#[proxy(
    interface = "org.freedesktop.portal.Request",
    default_service = "org.freedesktop.portal.Desktop",
    default_path = "/org/freedesktop/portal/desktop"
)]
trait Request {
    /// Close method
    fn close(&self) -> zbus::Result<()>;

    /// Response signal
    #[zbus(signal)]
    fn response(
        &self,
        response: u32,
        results: HashMap<String, OwnedValue>,
    ) -> zbus::Result<()>;
}
