//! Local LE advertisement registration against BlueZ's `LEAdvertisingManager1`.
//!
//! Used only to make the BLE-MIDI GATT service discoverable; there is no advertisement for any
//! other profile this daemon services. Mirrors [crate::gatt::local::Application::register]'s
//! publish-then-spawn-unregister shape, trimmed to a single object with no properties beyond what
//! BLE-MIDI central scanners need to find the service.

use dbus::{arg::PropMap, nonblock::Proxy};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken};
use std::sync::Arc;
use uuid::Uuid;

use crate::{adapter::Adapter, cr_property, method_call, Result, SessionInner, SERVICE_NAME, TIMEOUT};

pub(crate) const MANAGER_INTERFACE: &str = "org.bluez.LEAdvertisingManager1";
pub(crate) const INTERFACE: &str = "org.bluez.LEAdvertisement1";
const PATH: &str = "/org/bluealsa/advertisement0";

/// A local LE advertisement. `service_uuids` are advertised in the 16/128-bit service UUID AD
/// structure; `local_name` is advertised as the complete local name if set.
#[derive(Clone, Debug, Default)]
pub struct Advertisement {
    pub service_uuids: Vec<Uuid>,
    pub local_name: Option<String>,
}

pub(crate) struct RegisteredAdvertisement {
    ad: Advertisement,
}

impl RegisteredAdvertisement {
    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            cr_property!(ib, "Type", _reg => { Some("peripheral".to_string()) });
            cr_property!(ib, "ServiceUUIDs", reg => {
                Some(reg.ad.service_uuids.iter().map(Uuid::to_string).collect::<Vec<_>>())
            });
            cr_property!(ib, "LocalName", reg => { reg.ad.local_name.clone() });

            ib.method_with_cr_async("Release", (), (), |ctx, cr, (): ()| {
                method_call(ctx, cr, |_reg: Arc<Self>| async move { Ok(()) })
            });
        })
    }
}

/// Handle to a registered advertisement. Drop to unregister it.
pub struct AdvertisementHandle {
    _drop_tx: tokio::sync::oneshot::Sender<()>,
}

impl Advertisement {
    /// Registers this advertisement with BlueZ's per-adapter `LEAdvertisingManager1`.
    pub(crate) async fn register(self, inner: Arc<SessionInner>, adapter_name: &str) -> Result<AdvertisementHandle> {
        let path = dbus::Path::new(PATH).unwrap();
        let registered = Arc::new(RegisteredAdvertisement { ad: self });

        {
            let mut cr = inner.crossroads.lock().await;
            cr.insert(path.clone(), &[inner.le_advertisement_token], registered);
        }

        let proxy = Proxy::new(SERVICE_NAME, Adapter::dbus_path(adapter_name)?, TIMEOUT, inner.connection.clone());
        proxy.method_call::<(), _, _, _>(MANAGER_INTERFACE, "RegisterAdvertisement", (path.clone(), PropMap::new())).await?;

        let (drop_tx, drop_rx) = tokio::sync::oneshot::channel();
        let unreg_path = path.clone();
        tokio::spawn(async move {
            let _ = drop_rx.await;
            let _: std::result::Result<(), dbus::Error> =
                proxy.method_call(MANAGER_INTERFACE, "UnregisterAdvertisement", (unreg_path,)).await;
            let mut cr = inner.crossroads.lock().await;
            let _: Option<Arc<RegisteredAdvertisement>> = cr.remove(&path);
        });

        Ok(AdvertisementHandle { _drop_tx: drop_tx })
    }
}
