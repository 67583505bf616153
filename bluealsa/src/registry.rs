//! Process-wide registry of serviced adapters, built at startup and kept in sync with BlueZ's
//! `InterfacesAdded`/`InterfacesRemoved` signals for hot-plugged controllers.

use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

use crate::{adapter, config::Config, device::Device, session::Event, Adapter, Address, Result, Session};

/// Holds every [Adapter] this daemon instance is currently servicing.
pub struct Registry {
    session: Session,
    config: Arc<Config>,
    adapters: Mutex<HashMap<String, Adapter>>,
}

impl Registry {
    /// Builds a registry bound to `session`, immediately adopting every adapter already present
    /// that matches `config`'s adapter filter.
    pub async fn new(session: Session, config: Arc<Config>) -> Result<Arc<Self>> {
        let registry = Arc::new(Self { session, config, adapters: Mutex::new(HashMap::new()) });
        for name in registry.session.adapter_names().await? {
            if registry.config.services_adapter(&name) {
                registry.adopt(&name).await?;
            }
        }
        Ok(registry)
    }

    async fn adopt(&self, name: &str) -> Result<()> {
        let adapter = self.session.adapter(name)?;
        log::info!("Servicing adapter {name}");
        self.adapters.lock().await.insert(name.to_string(), adapter);
        Ok(())
    }

    /// Returns a clone of the adapter with the given name, if it is currently serviced.
    pub async fn adapter(&self, name: &str) -> Option<Adapter> {
        self.adapters.lock().await.get(name).cloned()
    }

    /// The process-wide configuration this registry was built from.
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Returns every adapter currently serviced.
    pub async fn adapters(&self) -> Vec<Adapter> {
        self.adapters.lock().await.values().cloned().collect()
    }

    /// Resolves a BlueZ device object path to a [Device] handle, creating one if this is the
    /// first time the device is seen, as long as its adapter is serviced.
    pub async fn device(&self, path: &dbus::Path<'_>) -> Option<Device> {
        let (adapter_name, address) = Device::parse_dbus_path(path)?;
        let adapter = self.adapter(adapter_name).await?;
        Some(adapter.device(address).await)
    }

    /// Resolves a bare Bluetooth address to a [Device] handle, searching every serviced adapter
    /// for one that already knows it and falling back to adopting it onto the first serviced
    /// adapter. Used by the oFono agent, which hands back a remote address with no indication of
    /// which local adapter BlueZ paired it on.
    pub async fn device_by_address(&self, address: Address) -> Option<Device> {
        let adapters = self.adapters().await;
        for adapter in &adapters {
            if let Some(device) = adapter.existing_device(address).await {
                return Some(device);
            }
        }
        let adapter = adapters.into_iter().next()?;
        Some(adapter.device(address).await)
    }

    /// Registers an HSP/HFP RFCOMM profile with BlueZ, starting the SLC/SCO pipeline for every
    /// connection BlueZ subsequently hands to it.
    pub async fn enable_hfp_profile(self: &Arc<Self>, def: crate::profile::TelephonyProfileDef) -> Result<crate::profile::hfp_profile::ProfileHandle> {
        let profile = Arc::new(crate::profile::hfp_profile::RegisteredHfpProfile::new(self.clone(), def));
        profile.register(self.session.inner.clone()).await
    }

    /// Registers an A2DP media endpoint of the given kind on the given adapter with BlueZ.
    pub async fn enable_media_endpoint(
        self: &Arc<Self>, adapter_name: &str, kind: crate::transport::TransportKind,
    ) -> Result<crate::profile::media_endpoint::MediaEndpointHandle> {
        let endpoint = Arc::new(crate::profile::media_endpoint::RegisteredMediaEndpoint::new_sbc(
            self.clone(),
            self.session.inner.clone(),
            kind,
        ));
        endpoint.register(adapter_name).await
    }

    /// Registers this daemon as oFono's hands-free audio agent, taking over SCO acquisition for
    /// calls oFono's own modem stack drives the SLC for.
    pub async fn enable_hfp_agent(self: &Arc<Self>) -> Result<crate::profile::ofono::HfpAgentHandle> {
        let agent = Arc::new(crate::profile::ofono::RegisteredHfpAgent::new(self.clone(), self.session.inner.clone()));
        agent.register(self.session.inner.clone()).await
    }

    /// Registers the BLE-MIDI GATT application on the given adapter, binding its local write/notify
    /// sockets under the configured state directory.
    pub async fn enable_midi(self: &Arc<Self>, adapter_name: &str) -> Result<crate::gatt::MidiHandle> {
        crate::gatt::register(self.session.inner.clone(), self.config.clone(), adapter_name).await
    }

    /// Publishes `org.bluealsa.Manager1` at the well-known controller path, spanning every
    /// adapter this registry services. Called once at startup, after the bus name is acquired.
    pub async fn serve_manager(self: &Arc<Self>) -> Result<()> {
        let controller = Arc::new(crate::controller::Controller::new(self.clone(), self.config.clone()));
        let path = dbus::Path::new(crate::controller::MANAGER_PATH).unwrap();
        let mut cr = self.session.inner.crossroads.lock().await;
        cr.insert(path, &[self.session.inner.controller_token], controller);
        Ok(())
    }

    /// Drives adapter hot-plug: spawns a task that adds/removes adapters as BlueZ reports them.
    pub fn spawn_watch(self: &Arc<Self>) {
        let registry = self.clone();
        tokio::spawn(async move {
            let events = match registry.session.events(dbus::Path::new(adapter::PATH).unwrap(), true).await {
                Ok(events) => events,
                Err(err) => {
                    log::error!("Failed to subscribe to adapter events: {err}");
                    return;
                }
            };
            tokio::pin!(events);
            use tokio_stream::StreamExt;
            while let Some(event) = events.next().await {
                match event {
                    Event::ObjectAdded { object, interfaces } if interfaces.contains(adapter::INTERFACE) => {
                        if let Some(name) = Adapter::parse_dbus_path(&object) {
                            if registry.config.services_adapter(name) {
                                if let Err(err) = registry.adopt(name).await {
                                    log::error!("Failed to adopt adapter {name}: {err}");
                                }
                            }
                        }
                    }
                    Event::ObjectRemoved { object, interfaces } if interfaces.contains(adapter::INTERFACE) => {
                        if let Some(name) = Adapter::parse_dbus_path(&object) {
                            log::info!("Adapter {name} removed");
                            registry.adapters.lock().await.remove(name);
                        }
                    }
                    _ => (),
                }
            }
        });
    }
}
