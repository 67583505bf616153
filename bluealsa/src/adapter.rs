//! A serviced Bluetooth adapter and the devices connected to it.

use dbus::Path;
use std::{
    collections::HashMap,
    fmt::{Debug, Formatter},
    sync::Arc,
};
use tokio::sync::Mutex;

use crate::{device::Device, Address, Error, ErrorKind, Result, SessionInner};

pub(crate) const INTERFACE: &str = "org.bluez.Adapter1";
pub(crate) const PATH: &str = "/org/bluez";
pub(crate) const PREFIX: &str = "/org/bluez/";

/// A Bluetooth adapter this daemon is servicing, and the devices currently connected to it.
#[derive(Clone)]
pub struct Adapter {
    pub(crate) inner: Arc<SessionInner>,
    dbus_path: Path<'static>,
    name: Arc<String>,
    devices: Arc<Mutex<HashMap<Address, Device>>>,
}

impl Debug for Adapter {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Adapter {{ name: {} }}", self.name())
    }
}

impl Adapter {
    pub(crate) fn new(inner: Arc<SessionInner>, name: &str) -> Result<Self> {
        Ok(Self {
            inner,
            dbus_path: Path::new(PREFIX.to_string() + name)
                .map_err(|_| Error::new(ErrorKind::InvalidName(name.to_string())))?,
            name: Arc::new(name.to_string()),
            devices: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub(crate) fn dbus_path(adapter_name: &str) -> Result<Path<'static>> {
        Path::new(format!("{PREFIX}{adapter_name}"))
            .map_err(|_| Error::new(ErrorKind::InvalidName(adapter_name.to_string())))
    }

    pub(crate) fn parse_dbus_path_prefix<'a>(path: &'a Path<'_>) -> Option<(&'a str, &'a str)> {
        path.strip_prefix(PREFIX).map(|p| {
            let sep = p.find('/').unwrap_or(p.len());
            (&p[0..sep], &p[sep..])
        })
    }

    pub(crate) fn parse_dbus_path<'a>(path: &'a Path) -> Option<&'a str> {
        match Self::parse_dbus_path_prefix(path) {
            Some((v, "")) => Some(v),
            _ => None,
        }
    }

    /// The BlueZ adapter name, e.g. `hci0`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The D-Bus object path of the underlying `org.bluez.Adapter1` object.
    pub fn dbus_object_path(&self) -> &Path<'static> {
        &self.dbus_path
    }

    /// Looks up (or creates and caches) a [Device] handle for the given address.
    pub async fn device(&self, address: Address) -> Device {
        let mut devices = self.devices.lock().await;
        devices
            .entry(address)
            .or_insert_with(|| Device::new(self.inner.clone(), self.name.clone(), address))
            .clone()
    }

    /// Looks up a device already known to this adapter, without creating one.
    pub async fn existing_device(&self, address: Address) -> Option<Device> {
        self.devices.lock().await.get(&address).cloned()
    }

    /// All devices this adapter currently tracks (connected or previously bonded).
    pub async fn devices(&self) -> Vec<Device> {
        self.devices.lock().await.values().cloned().collect()
    }

    /// Drops the cached handle for a device, e.g. after BlueZ reports it removed.
    pub async fn forget_device(&self, address: Address) {
        self.devices.lock().await.remove(&address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_adapter_path() {
        let path = Path::new("/org/bluez/hci0").unwrap();
        assert_eq!(Adapter::parse_dbus_path(&path), Some("hci0"));
    }

    #[test]
    fn rejects_device_path_as_adapter_path() {
        let path = Path::new("/org/bluez/hci0/dev_00_11_22_33_44_55").unwrap();
        assert_eq!(Adapter::parse_dbus_path(&path), None);
    }
}
