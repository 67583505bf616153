//! Bus connection, D-Bus object dispatch and the ObjectManager event feed used to track
//! adapters and devices appearing and disappearing under BlueZ.

use dbus::{
    arg::Variant,
    message::MatchRule,
    nonblock::{
        stdintf::org_freedesktop_dbus::{
            ObjectManagerInterfacesAdded, ObjectManagerInterfacesRemoved, PropertiesPropertiesChanged,
        },
        SyncConnection,
    },
    strings::BusName,
    Message,
};
use dbus_crossroads::{Crossroads, IfaceToken};
use dbus_tokio::connection;
use futures::{
    channel::{mpsc, oneshot},
    lock::Mutex,
    SinkExt, StreamExt,
};
use lazy_static::lazy_static;
use std::{
    collections::{HashMap, HashSet},
    fmt::{Debug, Formatter},
    sync::{Arc, Weak},
};
use tokio::{
    select,
    task::{spawn_blocking, JoinHandle},
};

use crate::{
    adapter,
    adv,
    controller::Controller,
    gatt,
    parent_path,
    profile::{hfp_profile::RegisteredHfpProfile, media_endpoint::RegisteredMediaEndpoint, ofono::RegisteredHfpAgent},
    Adapter, Error, ErrorKind, InternalErrorKind, Result, SERVICE_NAME,
};

/// Shared state of all D-Bus objects owned by this daemon.
pub(crate) struct SessionInner {
    pub connection: Arc<SyncConnection>,
    pub crossroads: Mutex<Crossroads>,
    pub media_endpoint_token: IfaceToken<Arc<RegisteredMediaEndpoint>>,
    pub hfp_profile_token: IfaceToken<Arc<RegisteredHfpProfile>>,
    pub hfp_agent_token: IfaceToken<Arc<RegisteredHfpAgent>>,
    pub gatt_service_token: IfaceToken<Arc<gatt::local::RegisteredService>>,
    pub gatt_characteristic_token: IfaceToken<Arc<gatt::local::RegisteredCharacteristic>>,
    pub le_advertisement_token: IfaceToken<Arc<adv::RegisteredAdvertisement>>,
    pub controller_token: IfaceToken<Arc<Controller>>,
    pub event_sub_tx: mpsc::Sender<SubscriptionReq>,
    dbus_task: JoinHandle<connection::IOResourceError>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.dbus_task.abort();
    }
}

/// Connection to the system bus plus the object registrations this daemon owns.
///
/// One [Session] is created at startup and shared by every [Adapter](crate::Adapter),
/// [Device](crate::Device) and [Transport](crate::transport::Transport) through an `Arc`.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Session {{ {} }}", self.inner.connection.unique_name())
    }
}

impl Session {
    /// Connects to the D-Bus system bus and registers the interface tokens this daemon needs.
    pub async fn new() -> Result<Self> {
        let (resource, connection) = spawn_blocking(connection::new_system_sync).await??;
        let dbus_task = tokio::spawn(resource);
        log::trace!("Connected to D-Bus with unique name {}", &connection.unique_name());

        let mut crossroads = Crossroads::new();
        crossroads.set_async_support(Some((
            connection.clone(),
            Box::new(|x| {
                tokio::spawn(x);
            }),
        )));
        crossroads.set_object_manager_support(Some(connection.clone()));

        let media_endpoint_token = RegisteredMediaEndpoint::register_interface(&mut crossroads);
        let hfp_profile_token = RegisteredHfpProfile::register_interface(&mut crossroads);
        let hfp_agent_token = RegisteredHfpAgent::register_interface(&mut crossroads);
        let gatt_service_token = gatt::local::RegisteredService::register_interface(&mut crossroads);
        let gatt_characteristic_token = gatt::local::RegisteredCharacteristic::register_interface(&mut crossroads);
        let le_advertisement_token = adv::RegisteredAdvertisement::register_interface(&mut crossroads);
        let controller_token = Controller::register_interface(&mut crossroads);

        let (event_sub_tx, event_sub_rx) = mpsc::channel(1);
        Event::handle_connection(connection.clone(), event_sub_rx).await?;

        let inner = Arc::new(SessionInner {
            connection: connection.clone(),
            crossroads: Mutex::new(crossroads),
            media_endpoint_token,
            hfp_profile_token,
            hfp_agent_token,
            gatt_service_token,
            gatt_characteristic_token,
            le_advertisement_token,
            controller_token,
            event_sub_tx,
            dbus_task,
        });

        let mc_callback = connection.add_match(MatchRule::new_method_call()).await?;
        let mc_inner = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let (_mc_callback, mut mc_stream) = mc_callback.msg_stream();
            while let Some(msg) = mc_stream.next().await {
                let mc_inner = match mc_inner.upgrade() {
                    Some(inner) => inner,
                    None => return,
                };
                let mut crossroads = mc_inner.crossroads.lock().await;
                let _ = crossroads.handle_message(msg, &*mc_inner.connection);
            }
        });

        Ok(Self { inner })
    }

    /// Enumerate BlueZ adapter names currently present (e.g. `hci0`).
    pub async fn adapter_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for (path, interfaces) in crate::all_dbus_objects(&self.inner.connection, SERVICE_NAME).await? {
            match Adapter::parse_dbus_path(&path) {
                Some(name) if interfaces.contains_key(adapter::INTERFACE) => names.push(name.to_string()),
                _ => (),
            }
        }
        Ok(names)
    }

    /// Creates a handle to the adapter with the given BlueZ name (e.g. `hci0`).
    pub fn adapter(&self, adapter_name: &str) -> Result<Adapter> {
        Adapter::new(self.inner.clone(), adapter_name)
    }

    /// Requests ownership of a well-known bus name, failing if another process already owns it.
    pub async fn request_name(&self, name: &str) -> Result<()> {
        use dbus::nonblock::stdintf::org_freedesktop_dbus::RequestNameReply;
        let reply = self.inner.connection.request_name(name, false, true, false).await?;
        if reply != RequestNameReply::PrimaryOwner {
            return Err(Error::new(ErrorKind::BusNameTaken));
        }
        Ok(())
    }

    /// Streams ObjectManager and PropertiesChanged events below the given D-Bus path.
    pub(crate) async fn events(
        &self, path: dbus::Path<'static>, child_objects: bool,
    ) -> Result<mpsc::UnboundedReceiver<Event>> {
        Event::subscribe(&mut self.inner.event_sub_tx.clone(), path, child_objects).await
    }
}

/// A D-Bus object or property event observed on the system bus.
#[derive(Debug)]
pub(crate) enum Event {
    ObjectAdded { object: dbus::Path<'static>, interfaces: HashSet<String> },
    ObjectRemoved { object: dbus::Path<'static>, interfaces: HashSet<String> },
    PropertiesChanged { object: dbus::Path<'static>, interface: String, changed: dbus::arg::PropMap },
}

impl Clone for Event {
    fn clone(&self) -> Self {
        match self {
            Self::ObjectAdded { object, interfaces } => {
                Self::ObjectAdded { object: object.clone(), interfaces: interfaces.clone() }
            }
            Self::ObjectRemoved { object, interfaces } => {
                Self::ObjectRemoved { object: object.clone(), interfaces: interfaces.clone() }
            }
            Self::PropertiesChanged { object, interface, changed } => Self::PropertiesChanged {
                object: object.clone(),
                interface: interface.clone(),
                changed: changed.iter().map(|(k, v)| (k.clone(), Variant(v.0.box_clone()))).collect(),
            },
        }
    }
}

pub(crate) struct SubscriptionReq {
    path: dbus::Path<'static>,
    child_objects: bool,
    tx: mpsc::UnboundedSender<Event>,
    ready_tx: oneshot::Sender<()>,
}

impl Event {
    pub(crate) async fn handle_connection(
        connection: Arc<SyncConnection>, mut sub_rx: mpsc::Receiver<SubscriptionReq>,
    ) -> Result<()> {
        use dbus::message::SignalArgs;
        lazy_static! {
            static ref SERVICE_NAME_BUS: BusName<'static> = BusName::new(SERVICE_NAME).unwrap();
            static ref SERVICE_NAME_REF: Option<&'static BusName<'static>> = Some(&SERVICE_NAME_BUS);
        }

        let (msg_tx, mut msg_rx) = mpsc::unbounded();
        let handle_msg = move |msg: Message| {
            let _ = msg_tx.unbounded_send(msg);
            true
        };

        let rule_add = ObjectManagerInterfacesAdded::match_rule(*SERVICE_NAME_REF, None);
        let msg_match_add = connection.add_match(rule_add).await?.msg_cb(handle_msg.clone());
        let rule_removed = ObjectManagerInterfacesRemoved::match_rule(*SERVICE_NAME_REF, None);
        let msg_match_removed = connection.add_match(rule_removed).await?.msg_cb(handle_msg.clone());
        let rule_prop = PropertiesPropertiesChanged::match_rule(*SERVICE_NAME_REF, None);
        let msg_match_prop = connection.add_match(rule_prop).await?.msg_cb(handle_msg.clone());

        tokio::spawn(async move {
            log::trace!("Starting event loop for {}", &connection.unique_name());

            struct Subscription {
                child_objects: bool,
                tx: mpsc::UnboundedSender<Event>,
            }
            let mut subs: HashMap<String, Vec<Subscription>> = HashMap::new();

            loop {
                select! {
                    msg_opt = msg_rx.next() => {
                        match msg_opt {
                            Some(msg) => {
                                if let (Some(object), Some(PropertiesPropertiesChanged { interface_name, changed_properties, .. })) =
                                    (msg.path(), PropertiesPropertiesChanged::from_message(&msg))
                                {
                                    if let Some(path_subs) = subs.get_mut(&*object) {
                                        let evt = Self::PropertiesChanged {
                                            object: object.clone().into_static(),
                                            interface: interface_name,
                                            changed: changed_properties,
                                        };
                                        path_subs.retain(|sub| sub.tx.unbounded_send(evt.clone()).is_ok());
                                        if path_subs.is_empty() {
                                            subs.remove(&*object);
                                        }
                                    }
                                }

                                if let Some(ObjectManagerInterfacesAdded { object, interfaces }) =
                                    ObjectManagerInterfacesAdded::from_message(&msg)
                                {
                                    let parent = parent_path(&object);
                                    if let Some(parent_subs) = subs.get_mut(&*parent) {
                                        let evt = Self::ObjectAdded { object, interfaces: interfaces.into_keys().collect() };
                                        parent_subs.retain(|sub| {
                                            if sub.child_objects { sub.tx.unbounded_send(evt.clone()).is_ok() } else { true }
                                        });
                                        if parent_subs.is_empty() {
                                            subs.remove(&*parent);
                                        }
                                    }
                                }

                                if let Some(ObjectManagerInterfacesRemoved { object, interfaces, .. }) =
                                    ObjectManagerInterfacesRemoved::from_message(&msg)
                                {
                                    subs.remove(&*object);
                                    let parent = parent_path(&object);
                                    if let Some(parent_subs) = subs.get_mut(&*parent) {
                                        let evt = Self::ObjectRemoved { object, interfaces: interfaces.into_iter().collect() };
                                        parent_subs.retain(|sub| {
                                            if sub.child_objects { sub.tx.unbounded_send(evt.clone()).is_ok() } else { true }
                                        });
                                        if parent_subs.is_empty() {
                                            subs.remove(&*parent);
                                        }
                                    }
                                }
                            },
                            None => break,
                        }
                    },
                    sub_opt = sub_rx.next() => {
                        match sub_opt {
                            Some(SubscriptionReq { path, child_objects, tx, ready_tx }) => {
                                let _ = ready_tx.send(());
                                subs.entry(path.to_string()).or_default().push(Subscription { child_objects, tx });
                            }
                            None => break,
                        }
                    }
                }
            }

            let _ = connection.remove_match(msg_match_add.token()).await;
            let _ = connection.remove_match(msg_match_removed.token()).await;
            let _ = connection.remove_match(msg_match_prop.token()).await;
            log::trace!("Terminated event loop for {}", &connection.unique_name());
        });

        Ok(())
    }

    pub(crate) async fn subscribe(
        sub_tx: &mut mpsc::Sender<SubscriptionReq>, path: dbus::Path<'static>, child_objects: bool,
    ) -> Result<mpsc::UnboundedReceiver<Event>> {
        let (tx, rx) = mpsc::unbounded();
        let (ready_tx, ready_rx) = oneshot::channel();
        sub_tx
            .send(SubscriptionReq { path, child_objects, tx, ready_tx })
            .await
            .map_err(|_| Error::new(ErrorKind::Internal(InternalErrorKind::DBusConnectionLost)))?;
        ready_rx.await.map_err(|_| Error::new(ErrorKind::Internal(InternalErrorKind::DBusConnectionLost)))?;
        Ok(rx)
    }
}
