//! Registration of this daemon as oFono's `HandsfreeAudioAgent1`, the alternative HFP audio
//! path used when a modem stack drives the SLC itself and only hands over the finished SCO
//! socket.

use dbus::{arg::OwnedFd as DbusOwnedFd, nonblock::Proxy};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken};
use std::{os::unix::io::IntoRawFd, sync::Arc};
use tokio::sync::{oneshot, Mutex};

use crate::{
    codec::CodecId,
    method_call,
    pcm::{Format, PcmEndpoint, PcmMode},
    profile::hfp_profile::start_pcm_workers,
    publish_path,
    read_dict,
    registry::Registry,
    sock::OwnedFd,
    transport::{A2dpState, AcquireRelease, PcmSet, ScoPcms, Transport, TransportKind},
    Address, Error, ErrorKind, Result, SessionInner, OFONO_SERVICE_NAME, TIMEOUT,
};

pub(crate) const AUDIO_MANAGER_INTERFACE: &str = "org.ofono.HandsfreeAudioManager";
pub(crate) const AUDIO_MANAGER_PATH: &str = "/";
pub(crate) const AUDIO_AGENT_INTERFACE: &str = "org.ofono.HandsfreeAudioAgent";
pub(crate) const AUDIO_CARD_INTERFACE: &str = "org.ofono.HandsfreeAudioCard";
const AGENT_PATH: &str = publish_path!("hfp_agent");

const OFONO_CODEC_CVSD: u8 = 0x01;
const OFONO_CODEC_MSBC: u8 = 0x02;

/// The registered `org.ofono.HandsfreeAudioAgent` object.
///
/// oFono owns the RFCOMM/SLC exchange for every card it manages; by the time it calls
/// `NewConnection` the SCO socket is already connected, so this path skips [crate::rfcomm::slc]
/// entirely and goes straight to [TransportKind::HfpAg] acquisition.
pub(crate) struct RegisteredHfpAgent {
    registry: Arc<Registry>,
    inner: Arc<SessionInner>,
}

impl RegisteredHfpAgent {
    pub(crate) fn new(registry: Arc<Registry>, inner: Arc<SessionInner>) -> Self {
        Self { registry, inner }
    }

    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(AUDIO_AGENT_INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            ib.method_with_cr_async(
                "NewConnection",
                ("card", "fd", "codec"),
                (),
                |ctx, cr, (card_path, fd, codec): (dbus::Path<'static>, DbusOwnedFd, u8)| {
                    method_call(ctx, cr, move |agent: Arc<Self>| async move {
                        let fd = unsafe { OwnedFd::new(fd.into_raw_fd()) };
                        tokio::spawn(agent.clone().drive(card_path, fd, codec));
                        Ok(())
                    })
                },
            );

            ib.method_with_cr_async("Release", (), (), |ctx, cr, (): ()| {
                method_call(ctx, cr, |_agent: Arc<Self>| async move { Ok(()) })
            });
        })
    }

    /// Registers this agent with oFono's `HandsfreeAudioManager`, publishing the `Agent1`
    /// object first so oFono can call back into it immediately.
    pub(crate) async fn register(self: Arc<Self>, inner: Arc<SessionInner>) -> Result<HfpAgentHandle> {
        let path = dbus::Path::new(AGENT_PATH).unwrap();
        {
            let mut cr = inner.crossroads.lock().await;
            cr.insert(path.clone(), &[inner.hfp_agent_token], self.clone());
        }

        let codecs: Vec<u8> = vec![OFONO_CODEC_CVSD, OFONO_CODEC_MSBC];
        let proxy = Proxy::new(OFONO_SERVICE_NAME, AUDIO_MANAGER_PATH, TIMEOUT, inner.connection.clone());
        let result: std::result::Result<(), dbus::Error> =
            proxy.method_call(AUDIO_MANAGER_INTERFACE, "Register", (path.clone(), codecs)).await;
        if let Err(err) = result {
            let mut cr = inner.crossroads.lock().await;
            let _: Option<Arc<RegisteredHfpAgent>> = cr.remove(&path);
            return Err(err.into());
        }

        let (drop_tx, drop_rx) = oneshot::channel();
        let unreg_path = path.clone();
        tokio::spawn(async move {
            let _ = drop_rx.await;
            let _: std::result::Result<(), dbus::Error> =
                proxy.method_call(AUDIO_MANAGER_INTERFACE, "Unregister", (unreg_path.clone(),)).await;
            let mut cr = inner.crossroads.lock().await;
            let _: Option<Arc<RegisteredHfpAgent>> = cr.remove(&unreg_path);
        });

        Ok(HfpAgentHandle { _drop_tx: drop_tx })
    }

    async fn drive(self: Arc<Self>, card_path: dbus::Path<'static>, fd: OwnedFd, codec: u8) {
        let address = match resolve_card_address(&self.inner.connection, &card_path).await {
            Ok(address) => address,
            Err(err) => {
                log::warn!("ofono: failed to resolve remote address of {card_path}: {err}");
                return;
            }
        };
        let device = match self.registry.device_by_address(address).await {
            Some(device) => device,
            None => {
                log::warn!("ofono: no serviced adapter to host device {address}");
                return;
            }
        };

        let codec_id = if codec == OFONO_CODEC_MSBC { CodecId::Msbc } else { CodecId::Cvsd };
        log::info!("{address}: oFono handed over SCO connection ({codec_id:?})");

        let kind = TransportKind::HfpAg;
        let transport = Transport::new(kind, address, Arc::new(ProvidedFdIo::new(fd)));
        let initial_volume = self.registry.config().initial_volume;
        let pcms = ScoPcms {
            speaker: Arc::new(PcmEndpoint::new(PcmMode::Sink, Format::S16LE, 1, 8_000, initial_volume)),
            microphone: Arc::new(PcmEndpoint::new(PcmMode::Source, Format::S16LE, 1, 8_000, initial_volume)),
        };
        transport.set_pcms(PcmSet::Sco(pcms.clone())).await;
        transport.set_codec(crate::codec::CodecConfiguration { codec: codec_id, blob: Vec::new() }).await;
        device.insert_transport(kind, transport.clone()).await;

        if let Err(err) = transport.acquire().await {
            log::warn!("{address}: failed to acquire oFono-provided SCO socket: {err}");
            transport.destroy().await;
            device.remove_transport(kind).await;
            return;
        }
        transport.set_state(A2dpState::Active).await;
        start_pcm_workers(&transport, &pcms, codec_id).await;

        wait_for_hangup(&transport).await;

        transport.destroy().await;
        device.remove_transport(kind).await;
        log::info!("{address}: oFono SCO connection ended");
    }
}

/// Blocks until the acquired socket reports a read-ready event with nothing to read, which is
/// how a peer-closed SCO socket surfaces; oFono gives no separate teardown signal per call.
async fn wait_for_hangup(transport: &Transport) {
    let Some(bt_fd) = transport.bt_fd().await else { return };
    loop {
        let mut guard = match bt_fd.readable().await {
            Ok(guard) => guard,
            Err(_) => return,
        };
        let mut buf = [0u8; 1];
        let result = guard.try_io(|inner| {
            use std::os::unix::io::AsRawFd;
            let raw_fd = inner.get_ref().as_raw_fd();
            match unsafe { libc::recv(raw_fd, buf.as_mut_ptr() as *mut _, buf.len(), libc::MSG_PEEK) } {
                -1 => Err(std::io::Error::last_os_error()),
                n => Ok(n as usize),
            }
        });
        match result {
            Ok(Ok(0)) => return,
            Ok(Ok(_)) => continue,
            Ok(Err(_)) => return,
            Err(_would_block) => continue,
        }
    }
}

async fn resolve_card_address(connection: &dbus::nonblock::SyncConnection, card_path: &dbus::Path<'static>) -> Result<Address> {
    let proxy = Proxy::new(OFONO_SERVICE_NAME, card_path.clone(), TIMEOUT, connection);
    let (props,): (dbus::arg::PropMap,) = proxy.method_call(AUDIO_CARD_INTERFACE, "GetProperties", ()).await?;
    let addr_str: &String = read_dict(&props, "RemoteAddress")?;
    addr_str.parse().map_err(Error::from)
}

/// Handle to the registered oFono hands-free audio agent. Drop to unregister it.
pub struct HfpAgentHandle {
    _drop_tx: oneshot::Sender<()>,
}

/// Wraps a SCO socket fd handed over by oFono's `NewConnection`, already connected, so acquiring
/// it is just taking ownership once.
struct ProvidedFdIo {
    fd: Mutex<Option<OwnedFd>>,
}

impl ProvidedFdIo {
    fn new(fd: OwnedFd) -> Self {
        Self { fd: Mutex::new(Some(fd)) }
    }
}

#[async_trait::async_trait]
impl AcquireRelease for ProvidedFdIo {
    async fn acquire(&self) -> Result<(OwnedFd, u16, u16)> {
        self.fd.lock().await.take().map(|fd| (fd, 48, 48)).ok_or_else(|| Error::new(ErrorKind::DeviceBusy))
    }

    async fn release(&self) {}
}
