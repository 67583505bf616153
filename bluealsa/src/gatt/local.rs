//! Local GATT service/characteristic registration against BlueZ's `GattManager1`.
//!
//! Trimmed to what BlueALSA actually needs: a fixed service containing a fixed characteristic
//! (read/write/write-without-response/notify), no descriptors, no raw-fd Acquire path, no GATT
//! client (Profile1) side. [Application::register] mirrors the same publish-then-spawn-unregister
//! shape as [crate::profile::media_endpoint::RegisteredMediaEndpoint::register].

use dbus::{
    arg::{PropMap, Variant},
    channel::Sender,
    message::SignalArgs,
    nonblock::{stdintf::org_freedesktop_dbus::PropertiesPropertiesChanged, Proxy, SyncConnection},
};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken};
use futures::Future;
use std::{
    pin::Pin,
    sync::{Arc, Weak},
};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::{
    adapter::Adapter, cr_property, method_call, parent_path, read_opt_prop, Error, ErrorKind, Result, SessionInner,
    SERVICE_NAME, TIMEOUT,
};

pub(crate) const MANAGER_INTERFACE: &str = "org.bluez.GattManager1";
pub(crate) const SERVICE_INTERFACE: &str = "org.bluez.GattService1";
pub(crate) const CHARACTERISTIC_INTERFACE: &str = "org.bluez.GattCharacteristic1";

/// Flags advertised on a [Characteristic]'s `Flags` property.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CharacteristicFlags {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

impl CharacteristicFlags {
    fn as_vec(self) -> Vec<String> {
        let mut flags = Vec::new();
        if self.read {
            flags.push("read".to_string());
        }
        if self.write {
            flags.push("write".to_string());
        }
        if self.write_without_response {
            flags.push("write-without-response".to_string());
        }
        if self.notify {
            flags.push("notify".to_string());
        }
        flags
    }
}

/// A request to read a characteristic's value.
#[derive(Clone, Copy, Debug, Default)]
pub struct CharacteristicReadRequest {
    /// Offset into the value, for long reads split across multiple requests.
    pub offset: u16,
}

impl CharacteristicReadRequest {
    fn from_dict(dict: &PropMap) -> Self {
        Self { offset: read_opt_prop!(dict, "offset", u16).unwrap_or_default() }
    }
}

/// A request to write a characteristic's value.
#[derive(Clone, Debug, Default)]
pub struct CharacteristicWriteRequest {
    /// Offset into the value, for long writes split across multiple requests.
    pub offset: u16,
}

impl CharacteristicWriteRequest {
    fn from_dict(dict: &PropMap) -> Self {
        Self { offset: read_opt_prop!(dict, "offset", u16).unwrap_or_default() }
    }
}

type ReadFun = Box<dyn Fn(CharacteristicReadRequest) -> Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send>> + Send + Sync>;
type WriteFun =
    Box<dyn Fn(Vec<u8>, CharacteristicWriteRequest) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;
type NotifyFun = Box<dyn Fn(CharacteristicNotifier) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// A handler for `ReadValue` calls against a characteristic.
pub struct CharacteristicRead {
    pub fun: ReadFun,
}

/// A handler for `WriteValue` calls against a characteristic.
pub struct CharacteristicWrite {
    pub write: bool,
    pub write_without_response: bool,
    pub fun: WriteFun,
}

/// A handler invoked once per `StartNotify` call, handed a [CharacteristicNotifier] to push
/// values through until the peer calls `StopNotify` or disconnects.
pub struct CharacteristicNotify {
    pub fun: NotifyFun,
}

/// Definition of a single GATT characteristic belonging to a [Service].
#[derive(Default)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub read: Option<CharacteristicRead>,
    pub write: Option<CharacteristicWrite>,
    pub notify: Option<CharacteristicNotify>,
}

impl Default for CharacteristicRead {
    fn default() -> Self {
        Self { fun: Box::new(|_| Box::pin(async { Ok(Vec::new()) })) }
    }
}

impl Default for CharacteristicWrite {
    fn default() -> Self {
        Self { write: false, write_without_response: false, fun: Box::new(|_, _| Box::pin(async { Ok(()) })) }
    }
}

impl Default for CharacteristicNotify {
    fn default() -> Self {
        Self { fun: Box::new(|_| Box::pin(async {})) }
    }
}

impl std::fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Characteristic").field("uuid", &self.uuid).finish_non_exhaustive()
    }
}

/// Definition of a local GATT service to publish over Bluetooth.
#[derive(Debug, Default)]
pub struct Service {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<Characteristic>,
}

/// Handed to the handler a central's `StartNotify` call runs, to push characteristic values and
/// to learn when the central stops listening.
pub struct CharacteristicNotifier {
    connection: Weak<SyncConnection>,
    path: dbus::Path<'static>,
    stop_notify_tx: mpsc::Sender<()>,
}

impl CharacteristicNotifier {
    /// True once the central has called `StopNotify` (or its subscription has otherwise ended).
    pub fn is_stopped(&self) -> bool {
        self.stop_notify_tx.is_closed()
    }

    /// Resolves once the central has called `StopNotify`.
    pub fn stopped(&self) -> impl Future<Output = ()> + '_ {
        let tx = self.stop_notify_tx.clone();
        async move {
            tx.closed().await;
        }
    }

    /// Pushes a new characteristic value to the central via a `PropertiesChanged` signal.
    pub async fn notify(&mut self, value: Vec<u8>) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::new(ErrorKind::NotFound));
        }
        let connection = self.connection.upgrade().ok_or_else(|| Error::new(ErrorKind::NotFound))?;
        let mut changed_properties = PropMap::new();
        changed_properties.insert("Value".to_string(), Variant(Box::new(value) as _));
        let ppc = PropertiesPropertiesChanged {
            interface_name: CHARACTERISTIC_INTERFACE.to_string(),
            changed_properties,
            invalidated_properties: Vec::new(),
        };
        connection.send(ppc.to_emit_message(&self.path)).map_err(|_| Error::new(ErrorKind::NotFound))?;
        Ok(())
    }
}

/// The registered `org.bluez.GattService1` object for one [Service].
pub(crate) struct RegisteredService {
    s: Service,
}

impl RegisteredService {
    fn new(s: Service) -> Self {
        Self { s }
    }

    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(SERVICE_INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            cr_property!(ib, "UUID", reg => { Some(reg.s.uuid.to_string()) });
            cr_property!(ib, "Primary", reg => { Some(reg.s.primary) });
        })
    }
}

/// The registered `org.bluez.GattCharacteristic1` object for one [Characteristic].
pub(crate) struct RegisteredCharacteristic {
    c: Characteristic,
    path: dbus::Path<'static>,
    connection: Weak<SyncConnection>,
    notify_stop: Mutex<Option<mpsc::Receiver<()>>>,
}

impl RegisteredCharacteristic {
    fn new(c: Characteristic, path: dbus::Path<'static>, connection: &Arc<SyncConnection>) -> Self {
        Self { c, path, connection: Arc::downgrade(connection), notify_stop: Mutex::new(None) }
    }

    fn flags(&self) -> CharacteristicFlags {
        CharacteristicFlags {
            read: self.c.read.is_some(),
            write: self.c.write.as_ref().is_some_and(|w| w.write),
            write_without_response: self.c.write.as_ref().is_some_and(|w| w.write_without_response),
            notify: self.c.notify.is_some(),
        }
    }

    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(CHARACTERISTIC_INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            cr_property!(ib, "UUID", reg => { Some(reg.c.uuid.to_string()) });
            cr_property!(ib, "Service", reg => { Some(parent_path(&reg.path)) });
            cr_property!(ib, "Flags", reg => { Some(reg.flags().as_vec()) });

            ib.method_with_cr_async("ReadValue", ("options",), ("value",), |ctx, cr, (options,): (PropMap,)| {
                method_call(ctx, cr, |reg: Arc<Self>| async move {
                    let request = CharacteristicReadRequest::from_dict(&options);
                    match &reg.c.read {
                        Some(read) => Ok(((read.fun)(request).await?,)),
                        None => Err(Error::new(ErrorKind::NotSupported).into()),
                    }
                })
            });

            ib.method_with_cr_async(
                "WriteValue",
                ("value", "options"),
                (),
                |ctx, cr, (value, options): (Vec<u8>, PropMap)| {
                    method_call(ctx, cr, |reg: Arc<Self>| async move {
                        let request = CharacteristicWriteRequest::from_dict(&options);
                        match &reg.c.write {
                            Some(write) => {
                                (write.fun)(value, request).await?;
                                Ok(())
                            }
                            None => Err(Error::new(ErrorKind::NotSupported).into()),
                        }
                    })
                },
            );

            ib.method_with_cr_async("StartNotify", (), (), |ctx, cr, (): ()| {
                let path = ctx.path().clone();
                method_call(ctx, cr, |reg: Arc<Self>| async move {
                    match &reg.c.notify {
                        Some(notify) => {
                            let (stop_notify_tx, stop_notify_rx) = mpsc::channel(1);
                            *reg.notify_stop.lock().await = Some(stop_notify_rx);
                            let notifier =
                                CharacteristicNotifier { connection: reg.connection.clone(), path, stop_notify_tx };
                            (notify.fun)(notifier).await;
                            Ok(())
                        }
                        None => Err(Error::new(ErrorKind::NotSupported).into()),
                    }
                })
            });

            ib.method_with_cr_async("StopNotify", (), (), |ctx, cr, (): ()| {
                method_call(ctx, cr, |reg: Arc<Self>| async move {
                    reg.notify_stop.lock().await.take();
                    Ok(())
                })
            });
        })
    }
}

/// Handle to a registered GATT application. Drop to unregister it.
pub struct ApplicationHandle {
    _drop_tx: tokio::sync::oneshot::Sender<()>,
}

/// A GATT application: one or more [Service]s published together under one object-manager root.
#[derive(Default)]
pub struct Application {
    pub services: Vec<Service>,
}

const APP_PATH: &str = "/org/bluealsa/gatt";

impl Application {
    /// Registers this application with BlueZ's per-adapter `GattManager1.RegisterApplication`.
    pub(crate) async fn register(self, inner: Arc<SessionInner>, adapter_name: &str) -> Result<ApplicationHandle> {
        let app_path = dbus::Path::new(APP_PATH).unwrap();
        let mut object_paths = vec![app_path.clone()];

        {
            let mut cr = inner.crossroads.lock().await;
            let om = cr.object_manager::<Application>();
            cr.insert(app_path.clone(), &[om], Application::default());

            for (service_idx, mut service) in self.services.into_iter().enumerate() {
                let characteristics = std::mem::take(&mut service.characteristics);
                let service_path = dbus::Path::new(format!("{app_path}/service{service_idx}")).unwrap();
                object_paths.push(service_path.clone());
                cr.insert(service_path.clone(), &[inner.gatt_service_token], Arc::new(RegisteredService::new(service)));

                for (char_idx, characteristic) in characteristics.into_iter().enumerate() {
                    let char_path = dbus::Path::new(format!("{service_path}/char{char_idx}")).unwrap();
                    object_paths.push(char_path.clone());
                    cr.insert(
                        char_path.clone(),
                        &[inner.gatt_characteristic_token],
                        Arc::new(RegisteredCharacteristic::new(characteristic, char_path, &inner.connection)),
                    );
                }
            }
        }

        let proxy = Proxy::new(SERVICE_NAME, Adapter::dbus_path(adapter_name)?, TIMEOUT, inner.connection.clone());
        proxy.method_call::<(), _, _, _>(MANAGER_INTERFACE, "RegisterApplication", (app_path.clone(), PropMap::new())).await?;

        let (drop_tx, drop_rx) = tokio::sync::oneshot::channel();
        let unreg_path = app_path.clone();
        tokio::spawn(async move {
            let _ = drop_rx.await;
            let _: std::result::Result<(), dbus::Error> =
                proxy.method_call(MANAGER_INTERFACE, "UnregisterApplication", (unreg_path,)).await;
            let mut cr = inner.crossroads.lock().await;
            for path in object_paths.into_iter().rev() {
                let _: Option<Application> = cr.remove(&path);
            }
        });

        Ok(ApplicationHandle { _drop_tx: drop_tx })
    }
}
