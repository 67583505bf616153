//! Registration of HSP/HFP RFCOMM profiles with BlueZ's `ProfileManager1`, and the session that
//! each accepted connection drives: SLC handshake, SCO socket acquisition, PCM encode/decode.

use dbus::{
    arg::{OwnedFd as DbusOwnedFd, PropMap, Variant},
    nonblock::Proxy,
};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken};
use std::{os::unix::io::IntoRawFd, sync::Arc};
use tokio::sync::{mpsc, oneshot};

use crate::{
    codec::{cvsd::Cvsd, msbc::Msbc, Codec, CodecConfiguration, CodecId},
    method_call,
    pcm::{Format, PcmEndpoint, PcmMode},
    profile::TelephonyProfileDef,
    publish_path,
    registry::Registry,
    rfcomm::{slc, Stream},
    sock::{self, OwnedFd},
    sys::{self, sockaddr_sco},
    transport::{self, A2dpState, AcquireRelease, PcmSet, ScoPcms, Transport},
    Address, Device, Error, ErrorKind, Result, SessionInner, SERVICE_NAME, TIMEOUT,
};

pub(crate) const MANAGER_INTERFACE: &str = "org.bluez.ProfileManager1";
pub(crate) const MANAGER_PATH: &str = "/org/bluez";
pub(crate) const PROFILE_INTERFACE: &str = "org.bluez.Profile1";
const PROFILE_PREFIX: &str = publish_path!("hfp_profile/");

/// The registered `org.bluez.Profile1` object for one [TelephonyProfileDef].
///
/// Unlike a general-purpose RFCOMM profile library, this daemon has exactly one thing to do
/// with every accepted connection: drive it through [slc::run] and, once the SLC reaches
/// `Connected`, acquire the corresponding SCO socket and start PCM encode/decode. There is no
/// public connect-request API for a library consumer to accept or reject; `NewConnection`
/// dispatches straight into that pipeline.
pub(crate) struct RegisteredHfpProfile {
    registry: Arc<Registry>,
    def: TelephonyProfileDef,
}

impl RegisteredHfpProfile {
    pub(crate) fn new(registry: Arc<Registry>, def: TelephonyProfileDef) -> Self {
        Self { registry, def }
    }

    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(PROFILE_INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            ib.method_with_cr_async(
                "NewConnection",
                ("device", "fd", "fd_properties"),
                (),
                |ctx, cr, (device_path, fd, _props): (dbus::Path<'static>, DbusOwnedFd, PropMap)| {
                    method_call(ctx, cr, |reg: Arc<Self>| async move {
                        let device = match reg.registry.device(&device_path).await {
                            Some(device) => device,
                            None => {
                                log::warn!("hfp profile: connection from unserviced device {device_path}");
                                return Err(Error::new(ErrorKind::DeviceNotFound).into());
                            }
                        };
                        let stream = match unsafe { Stream::from_raw_fd(fd.into_raw_fd()) } {
                            Ok(stream) => stream,
                            Err(err) => return Err(Error::from(err).into()),
                        };
                        tokio::spawn(reg.clone().drive(device, stream));
                        Ok(())
                    })
                },
            );

            ib.method_with_cr_async(
                "RequestDisconnection",
                ("device",),
                (),
                |ctx, cr, (_device,): (dbus::Path<'static>,)| {
                    method_call(ctx, cr, |_reg: Arc<Self>| async move { Ok(()) })
                },
            );
        })
    }

    /// Registers this profile with BlueZ's `ProfileManager1`, publishing the `Profile1` object
    /// first so BlueZ can call back into it immediately.
    pub(crate) async fn register(self: Arc<Self>, inner: Arc<SessionInner>) -> Result<ProfileHandle> {
        let path = dbus::Path::new(format!("{}{:?}", PROFILE_PREFIX, self.def.kind)).unwrap();
        {
            let mut cr = inner.crossroads.lock().await;
            cr.insert(path.clone(), &[inner.hfp_profile_token], self.clone());
        }

        let mut opts = PropMap::new();
        opts.insert("Name".to_string(), Variant(Box::new(self.def.name.to_string()) as _));
        opts.insert("Channel".to_string(), Variant(Box::new(self.def.channel) as _));
        opts.insert("RequireAuthentication".to_string(), Variant(Box::new(true) as _));

        let proxy = Proxy::new(SERVICE_NAME, MANAGER_PATH, TIMEOUT, inner.connection.clone());
        proxy.method_call::<(), _, _, _>(MANAGER_INTERFACE, "RegisterProfile", (path.clone(), self.def.uuid.to_string(), opts)).await?;

        let (drop_tx, drop_rx) = oneshot::channel();
        let unreg_path = path.clone();
        tokio::spawn(async move {
            let _ = drop_rx.await;
            let _: std::result::Result<(), dbus::Error> =
                proxy.method_call(MANAGER_INTERFACE, "UnregisterProfile", (unreg_path.clone(),)).await;
            let mut cr = inner.crossroads.lock().await;
            let _: Option<Arc<RegisteredHfpProfile>> = cr.remove(&unreg_path);
        });

        Ok(ProfileHandle { _drop_tx: drop_tx })
    }

    async fn drive(self: Arc<Self>, device: Device, stream: Stream) {
        log::info!("{}: SLC session starting ({:?})", device.address(), self.def.kind);

        let transport = Transport::new(self.def.kind, device.address(), Arc::new(ScoSocketIo::new(device.address())));
        let initial_volume = self.registry.config().initial_volume;
        let pcms = ScoPcms {
            speaker: Arc::new(PcmEndpoint::new(PcmMode::Sink, Format::S16LE, 1, 8_000, initial_volume)),
            microphone: Arc::new(PcmEndpoint::new(PcmMode::Source, Format::S16LE, 1, 8_000, initial_volume)),
        };
        transport.set_pcms(PcmSet::Sco(pcms.clone())).await;
        device.insert_transport(self.def.kind, transport.clone()).await;

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let def = self.def;
        let slc_cancel = tokio::spawn(async move { slc::run(stream, def.role, def.profile, events_tx).await });

        while let Some(event) = events_rx.recv().await {
            match event {
                slc::SlcEvent::Connected => {
                    transport.set_state(A2dpState::Active).await;
                    if let Err(err) = transport.acquire().await {
                        log::warn!("{}: failed to acquire SCO socket: {err}", device.address());
                        break;
                    }
                    let codec = transport.codec().await.map(|c| c.codec).unwrap_or(CodecId::Cvsd);
                    start_pcm_workers(&transport, &pcms, codec).await;
                }
                slc::SlcEvent::CodecSelected(codec) => {
                    transport.set_codec(CodecConfiguration { codec, blob: Vec::new() }).await;
                }
                slc::SlcEvent::SpeakerVolume(_) | slc::SlcEvent::MicrophoneVolume(_) | slc::SlcEvent::Indicator { .. } => {}
                slc::SlcEvent::Disconnected => break,
            }
        }

        slc_cancel.abort();
        transport.destroy().await;
        device.remove_transport(self.def.kind).await;
        log::info!("{}: SLC session ended", device.address());
    }
}

pub(crate) async fn start_pcm_workers(transport: &Transport, pcms: &ScoPcms, codec: CodecId) {
    let manager = transport.thread_manager();
    let encode_codec: Box<dyn Codec> = match codec {
        CodecId::Msbc => match Msbc::new() {
            Ok(c) => Box::new(c),
            Err(err) => {
                log::warn!("sco: failed to initialize mSBC encoder: {err}");
                Box::new(Cvsd::new())
            }
        },
        _ => Box::new(Cvsd::new()),
    };
    let decode_codec: Box<dyn Codec> = match codec {
        CodecId::Msbc => match Msbc::new() {
            Ok(c) => Box::new(c),
            Err(_) => Box::new(Cvsd::new()),
        },
        _ => Box::new(Cvsd::new()),
    };

    let t = transport.clone();
    let mic = pcms.microphone.clone();
    manager.start_encoder(move |handle| transport::sco::run_encoder(t, mic, encode_codec, handle)).await;

    let t = transport.clone();
    let speaker = pcms.speaker.clone();
    manager.start_decoder(move |handle| transport::sco::run_decoder(t, speaker, decode_codec, handle)).await;
}

/// Handle to a registered HFP/HSP profile. Drop to unregister it.
pub struct ProfileHandle {
    _drop_tx: oneshot::Sender<()>,
}

/// Connects a raw (e)SCO socket to a device once its SLC reaches `Connected`.
struct ScoSocketIo {
    address: Address,
}

impl ScoSocketIo {
    fn new(address: Address) -> Self {
        Self { address }
    }
}

#[async_trait::async_trait]
impl AcquireRelease for ScoSocketIo {
    async fn acquire(&self) -> Result<(OwnedFd, u16, u16)> {
        let fd = sock::socket(libc::AF_BLUETOOTH, libc::SOCK_SEQPACKET, sys::BTPROTO_SCO)?;
        sock::connect(&fd, sockaddr_sco { sco_family: libc::AF_BLUETOOTH as _, sco_bdaddr: self.address.into() })?;
        // SCO carries fixed-size frames; 48 bytes covers both narrowband CVSD and the common
        // 48-byte eSCO air-frame payload used for mSBC.
        Ok((fd, 48, 48))
    }

    async fn release(&self) {}
}
