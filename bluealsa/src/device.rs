//! A remote Bluetooth device and the transports currently open to it.

use dbus::{nonblock::Proxy, Path};
use std::{
    collections::HashMap,
    fmt::{Debug, Formatter},
    sync::Arc,
};
use tokio::sync::Mutex;

use crate::{
    adapter::PREFIX as ADAPTER_PREFIX, transport::Transport, transport::TransportKind, Address, Result,
    SessionInner, SERVICE_NAME, TIMEOUT,
};

pub(crate) const INTERFACE: &str = "org.bluez.Device1";

/// Apple vendor extension state negotiated over HFP (`AT+XAPL`/`+IPHONEACCEV`).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AppleExtension {
    /// Whether the peer announced support for the Apple extension during SLC setup.
    pub supported: bool,
    /// Most recently reported docked state.
    pub docked: bool,
    /// Most recently reported battery level, 0-9 (Apple's own 10-step scale), if known.
    pub battery_level: Option<u8>,
}

/// A remote Bluetooth device, tracked for as long as it has an active connection or transport.
#[derive(Clone)]
pub struct Device {
    inner: Arc<SessionInner>,
    adapter_name: Arc<String>,
    address: Address,
    state: Arc<Mutex<DeviceState>>,
    transports: Arc<Mutex<HashMap<TransportKind, Transport>>>,
}

#[derive(Default)]
struct DeviceState {
    name: Option<String>,
    alias: Option<String>,
    battery_percent: Option<u8>,
    apple_extension: AppleExtension,
}

impl Debug for Device {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Device {{ address: {} }}", self.address)
    }
}

impl Device {
    pub(crate) fn new(inner: Arc<SessionInner>, adapter_name: Arc<String>, address: Address) -> Self {
        Self {
            inner,
            adapter_name,
            address,
            state: Arc::new(Mutex::new(DeviceState::default())),
            transports: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The remote device's Bluetooth address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Splits a BlueZ device object path (`/org/bluez/hci0/dev_XX_XX_XX_XX_XX_XX`) into its
    /// adapter name and device address, as handed to us in `Profile1.NewConnection`'s device
    /// argument.
    pub(crate) fn parse_dbus_path<'a>(path: &'a Path<'_>) -> Option<(&'a str, Address)> {
        let (adapter_name, rest) = super::adapter::Adapter::parse_dbus_path_prefix(path)?;
        let addr = rest.strip_prefix("/dev_")?.replace('_', ":");
        Some((adapter_name, addr.parse().ok()?))
    }

    pub(crate) fn dbus_path(&self) -> Result<Path<'static>> {
        Ok(Path::new(format!(
            "{}{}/dev_{}",
            ADAPTER_PREFIX,
            self.adapter_name,
            self.address.to_string().replace(':', "_")
        ))
        .unwrap())
    }

    fn proxy(&self) -> Result<Proxy<'_, &dbus::nonblock::SyncConnection>> {
        Ok(Proxy::new(SERVICE_NAME, self.dbus_path()?, TIMEOUT, &*self.inner.connection))
    }

    /// Human-readable remote device name, as last reported by BlueZ's `Device1.Alias`.
    pub async fn name(&self) -> Option<String> {
        self.state.lock().await.alias.clone()
    }

    /// Caches the device name/alias as reported by a BlueZ `PropertiesChanged` signal.
    pub(crate) async fn set_name(&self, name: String) {
        self.state.lock().await.alias = Some(name);
    }

    /// Most recently reported battery level, 0-100, if the peer supports battery reporting.
    pub async fn battery_percent(&self) -> Option<u8> {
        self.state.lock().await.battery_percent
    }

    /// Records a battery level update, clamping to the valid 0-100 range.
    pub(crate) async fn set_battery_percent(&self, percent: u8) {
        self.state.lock().await.battery_percent = Some(percent.min(100));
    }

    /// Current Apple vendor extension state, if the peer negotiated it over HFP.
    pub async fn apple_extension(&self) -> AppleExtension {
        self.state.lock().await.apple_extension.clone()
    }

    pub(crate) async fn set_apple_extension(&self, ext: AppleExtension) {
        self.state.lock().await.apple_extension = ext;
    }

    /// Returns the open transport of the given kind, if any.
    pub async fn transport(&self, kind: TransportKind) -> Option<Transport> {
        self.transports.lock().await.get(&kind).cloned()
    }

    /// All transports currently open to this device.
    pub async fn transports(&self) -> Vec<Transport> {
        self.transports.lock().await.values().cloned().collect()
    }

    /// Registers a newly created transport, replacing any existing transport of the same kind.
    pub(crate) async fn insert_transport(&self, kind: TransportKind, transport: Transport) {
        self.transports.lock().await.insert(kind, transport);
    }

    /// Removes and returns a transport, e.g. once it has finished tearing down.
    pub(crate) async fn remove_transport(&self, kind: TransportKind) -> Option<Transport> {
        self.transports.lock().await.remove(&kind)
    }
}
