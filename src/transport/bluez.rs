//! BlueZ profile registration over the system D-Bus
//!
//! The HID service record has to be in the local SDP database before a host
//! will pair. It goes in through `org.bluez.ProfileManager1.RegisterProfile`,
//! which needs a `org.bluez.Profile1` object served on our connection.

use futures_util::StreamExt;
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zbus::fdo::PropertiesProxy;
use zbus::zvariant::{ObjectPath, OwnedFd, OwnedObjectPath, OwnedValue, Value};
use zbus::{interface, proxy, Connection};

use super::l2cap::BdAddr;
use crate::config::BluetoothConfig;
use crate::session::{LifecycleEvent, LifecycleSender};

/// Human Interface Device service class
pub const HID_PROFILE_UUID: &str = "00001124-0000-1000-8000-00805f9b34fb";
pub const PROFILE_PATH: &str = "/org/bluez/hidbridge";

const BLUEZ_SERVICE: &str = "org.bluez";
const DEVICE_INTERFACE: &str = "org.bluez.Device1";

#[proxy(
    interface = "org.bluez.ProfileManager1",
    default_service = "org.bluez",
    default_path = "/org/bluez"
)]
trait ProfileManager1 {
    fn register_profile(
        &self,
        profile: &ObjectPath<'_>,
        uuid: &str,
        options: HashMap<&str, Value<'_>>,
    ) -> zbus::Result<()>;

    fn unregister_profile(&self, profile: &ObjectPath<'_>) -> zbus::Result<()>;
}

/// `org.bluez.Profile1` callbacks
///
/// The L2CAP channels are served by our own listeners, so connections
/// handed over here are only logged and dropped.
struct HidProfile;

#[interface(name = "org.bluez.Profile1")]
impl HidProfile {
    fn release(&self) {
        info!("BlueZ released the HID profile");
    }

    fn new_connection(
        &self,
        device: OwnedObjectPath,
        _fd: OwnedFd,
        _properties: HashMap<String, OwnedValue>,
    ) {
        debug!("BlueZ profile connection from {}", device.as_str());
    }

    fn request_disconnection(&self, device: OwnedObjectPath) {
        debug!("BlueZ requested disconnection of {}", device.as_str());
    }
}

/// Options dictionary for RegisterProfile
pub fn profile_options<'a>(record: &'a str, config: &BluetoothConfig) -> HashMap<&'static str, Value<'a>> {
    HashMap::from([
        ("ServiceRecord", Value::from(record)),
        ("Role", Value::from("server")),
        (
            "RequireAuthentication",
            Value::from(config.require_authentication),
        ),
        ("RequireAuthorization", Value::from(config.require_authorization)),
    ])
}

/// Object path BlueZ uses for a remote device
pub fn device_path(adapter: &str, peer: BdAddr) -> String {
    let address = peer.to_string().replace(':', "_");
    format!("/org/bluez/{}/dev_{}", adapter, address)
}

/// Whether a PropertiesChanged signal says the device dropped its link
pub fn link_dropped(interface: &str, changed: &HashMap<&str, Value<'_>>) -> bool {
    interface == DEVICE_INTERFACE && matches!(changed.get("Connected"), Some(Value::Bool(false)))
}

/// A registered HID profile; dropping it without `unregister` leaves the
/// record in place until the D-Bus connection closes
pub struct ProfileRegistration {
    connection: Connection,
}

impl ProfileRegistration {
    pub async fn register(record: &str, config: &BluetoothConfig) -> zbus::Result<Self> {
        let connection = Connection::system().await?;
        connection.object_server().at(PROFILE_PATH, HidProfile).await?;

        let manager = ProfileManager1Proxy::new(&connection).await?;
        manager
            .register_profile(
                &ObjectPath::from_static_str_unchecked(PROFILE_PATH),
                HID_PROFILE_UUID,
                profile_options(record, config),
            )
            .await?;

        info!("Registered HID service record with BlueZ at {}", PROFILE_PATH);
        Ok(Self { connection })
    }

    pub async fn unregister(self) -> zbus::Result<()> {
        let manager = ProfileManager1Proxy::new(&self.connection).await?;
        manager
            .unregister_profile(&ObjectPath::from_static_str_unchecked(PROFILE_PATH))
            .await?;
        self.connection
            .object_server()
            .remove::<HidProfile, _>(PROFILE_PATH)
            .await?;
        info!("Unregistered HID service record");
        Ok(())
    }

    /// Raise `PeerLost` once BlueZ reports the peer as disconnected
    pub fn watch_link(&self, adapter: &str, peer: BdAddr, events: LifecycleSender) -> JoinHandle<()> {
        let connection = self.connection.clone();
        let path = device_path(adapter, peer);
        tokio::spawn(async move {
            if let Err(e) = watch_device(&connection, &path, &events).await {
                warn!("Cannot watch {} for disconnects: {}", path, e);
            }
        })
    }
}

async fn watch_device(connection: &Connection, path: &str, events: &LifecycleSender) -> zbus::Result<()> {
    let properties = PropertiesProxy::builder(connection)
        .destination(BLUEZ_SERVICE)?
        .path(path)?
        .build()
        .await?;
    let mut changes = properties.receive_properties_changed().await?;

    while let Some(signal) = changes.next().await {
        let args = signal.args()?;
        if link_dropped(args.interface_name().as_str(), args.changed_properties()) {
            info!("BlueZ reports {} disconnected", path);
            events
                .send(LifecycleEvent::PeerLost {
                    reason: "device disconnected".into(),
                })
                .await;
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hid::descriptor;

    #[test]
    fn test_profile_options() {
        let record = descriptor::sdp_record("Pi5-Keyboard", descriptor::COMBO, descriptor::SUBCLASS_COMBO);
        let options = profile_options(&record, &BluetoothConfig::default());

        assert_eq!(options.len(), 4);
        assert_eq!(options["Role"], Value::from("server"));
        assert_eq!(options["RequireAuthentication"], Value::Bool(true));
        assert_eq!(options["RequireAuthorization"], Value::Bool(false));
        match &options["ServiceRecord"] {
            Value::Str(xml) => assert!(xml.as_str().contains("Pi5-Keyboard")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_device_path() {
        let peer = BdAddr([0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(device_path("hci0", peer), "/org/bluez/hci0/dev_11_22_33_44_55_66");
    }

    #[test]
    fn test_link_dropped() {
        let down = HashMap::from([("Connected", Value::Bool(false))]);
        let up = HashMap::from([("Connected", Value::Bool(true))]);
        let rssi = HashMap::from([("RSSI", Value::I16(-60))]);

        assert!(link_dropped("org.bluez.Device1", &down));
        assert!(!link_dropped("org.bluez.Device1", &up));
        assert!(!link_dropped("org.bluez.Device1", &rssi));
        assert!(!link_dropped("org.bluez.MediaControl1", &down));
    }
}
