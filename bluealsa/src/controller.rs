//! External PCM API manager object: `org.bluealsa.Manager1`, the D-Bus surface local clients use
//! to discover PCM endpoints and open/close/pause/resume/drain them.
//!
//! Grounded on the same registration idiom as [crate::profile::hfp_profile] and
//! [crate::profile::media_endpoint] (a single object published once at startup, no per-adapter
//! split here since the manager spans every serviced adapter), generalized to a manager interface
//! this daemon itself owns rather than one it registers against a remote service.

use dbus::arg::{OwnedFd as DbusOwnedFd, PropMap, Variant};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken};
use std::{
    collections::HashMap,
    os::unix::io::{IntoRawFd, RawFd},
    sync::Arc,
};
use tokio::{
    io::{unix::AsyncFd, ReadBuf},
    sync::Mutex,
    task::AbortHandle,
};

use crate::{
    config::Config,
    device::Device,
    method_call,
    pcm::{PcmEndpoint, PcmMode},
    profile::{hfp_profile, media_endpoint},
    publish_path,
    registry::Registry,
    sock::{self, OwnedFd},
    transport::{PcmSet, Transport, TransportKind},
    Address, Error, ErrorKind, Result,
};

pub(crate) const MANAGER_INTERFACE: &str = "org.bluealsa.Manager1";
pub(crate) const MANAGER_PATH: &str = "/org/bluealsa";
const PCM_PATH_PREFIX: &str = publish_path!("pcm/");

/// The D-Bus unique name of the method call's sender, used to decide PCM ownership. Empty if the
/// underlying message carries no sender, which in practice only happens for broadcast signals,
/// never for a method call routed to us.
fn sender_of(ctx: &dbus_crossroads::Context) -> String {
    ctx.message().sender().map(|s| s.to_string()).unwrap_or_default()
}

/// Creates a UNIX socket pair for the `fd_notify` leg of `Open`'s reply. Volume/pause
/// notifications are not pushed over it yet; it exists so the client-facing protocol shape
/// matches (see DESIGN.md for the scope cut).
fn make_notify_pair() -> Result<(DbusOwnedFd, DbusOwnedFd)> {
    let mut sv: [RawFd; 2] = [0; 2];
    if unsafe {
        libc::socketpair(libc::AF_LOCAL, libc::SOCK_SEQPACKET | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0, sv.as_mut_ptr())
    } == -1
    {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok((unsafe { DbusOwnedFd::new(sv[0]) }, unsafe { DbusOwnedFd::new(sv[1]) }))
}

/// One client's claim on a PCM: who holds it (the D-Bus unique name from `Open`'s caller) and the
/// handle that cancels the disconnect watch once the PCM is closed normally.
struct OpenPcm {
    owner: String,
    watch: AbortHandle,
}

/// The registered `org.bluealsa.Manager1` object spanning every serviced adapter.
pub(crate) struct Controller {
    registry: Arc<Registry>,
    config: Arc<Config>,
    open_pcms: Mutex<HashMap<dbus::Path<'static>, OpenPcm>>,
}

impl Controller {
    pub(crate) fn new(registry: Arc<Registry>, config: Arc<Config>) -> Self {
        Self { registry, config, open_pcms: Mutex::new(HashMap::new()) }
    }

    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(MANAGER_INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            ib.method_with_cr_async("ListPCMs", (), ("pcms",), |ctx, cr, (): ()| {
                method_call(ctx, cr, |ctl: Arc<Self>| async move { Ok((ctl.list_pcms().await,)) })
            });

            ib.method_with_cr_async("ListServices", (), ("services",), |ctx, cr, (): ()| {
                method_call(ctx, cr, |ctl: Arc<Self>| async move { Ok((ctl.list_services(),)) })
            });

            ib.method_with_cr_async("Open", ("pcm",), ("fd", "fd_notify"), |ctx, cr, (path,): (dbus::Path<'static>,)| {
                let sender = sender_of(&ctx);
                method_call(ctx, cr, |ctl: Arc<Self>| async move {
                    let (fifo, notify) = ctl.open(&path, sender).await?;
                    Ok((fifo, notify))
                })
            });

            ib.method_with_cr_async("Close", ("pcm",), (), |ctx, cr, (path,): (dbus::Path<'static>,)| {
                let sender = sender_of(&ctx);
                method_call(ctx, cr, |ctl: Arc<Self>| async move {
                    ctl.check_owner(&path, &sender).await?;
                    ctl.close(&path).await?;
                    Ok(())
                })
            });

            ib.method_with_cr_async("Pause", ("pcm",), (), |ctx, cr, (path,): (dbus::Path<'static>,)| {
                let sender = sender_of(&ctx);
                method_call(ctx, cr, |ctl: Arc<Self>| async move {
                    ctl.check_owner(&path, &sender).await?;
                    let (_, _, pcm) = ctl.resolve(&path).await?;
                    pcm.set_active(false).await;
                    Ok(())
                })
            });

            ib.method_with_cr_async("Resume", ("pcm",), (), |ctx, cr, (path,): (dbus::Path<'static>,)| {
                let sender = sender_of(&ctx);
                method_call(ctx, cr, |ctl: Arc<Self>| async move {
                    ctl.check_owner(&path, &sender).await?;
                    let (_, _, pcm) = ctl.resolve(&path).await?;
                    pcm.set_active(true).await;
                    Ok(())
                })
            });

            ib.method_with_cr_async("Drain", ("pcm",), (), |ctx, cr, (path,): (dbus::Path<'static>,)| {
                let sender = sender_of(&ctx);
                method_call(ctx, cr, |ctl: Arc<Self>| async move {
                    ctl.check_owner(&path, &sender).await?;
                    ctl.drain(&path).await?;
                    Ok(())
                })
            });

            ib.method_with_cr_async("Drop", ("pcm",), (), |ctx, cr, (path,): (dbus::Path<'static>,)| {
                let sender = sender_of(&ctx);
                method_call(ctx, cr, |ctl: Arc<Self>| async move {
                    ctl.check_owner(&path, &sender).await?;
                    ctl.close(&path).await?;
                    Ok(())
                })
            });

            ib.method_with_cr_async(
                "SetVolume",
                ("pcm", "channel", "level_centidb", "muted"),
                (),
                |ctx, cr, (path, channel, level_centidb, muted): (dbus::Path<'static>, u8, i16, bool)| {
                    let sender = sender_of(&ctx);
                    method_call(ctx, cr, move |ctl: Arc<Self>| async move {
                        ctl.check_owner(&path, &sender).await?;
                        let (_, _, pcm) = ctl.resolve(&path).await?;
                        let mut volume = pcm.volume().await;
                        let channel = volume
                            .channels
                            .get_mut(channel as usize)
                            .ok_or_else(|| Error::new(ErrorKind::NotSupported))?;
                        channel.level_centidb = level_centidb;
                        channel.muted = muted;
                        pcm.set_volume(volume).await;
                        Ok(())
                    })
                },
            );

            ib.method_with_cr_async(
                "SetSoftVolume",
                ("pcm", "enabled"),
                (),
                |ctx, cr, (path, enabled): (dbus::Path<'static>, bool)| {
                    let sender = sender_of(&ctx);
                    method_call(ctx, cr, move |ctl: Arc<Self>| async move {
                        ctl.check_owner(&path, &sender).await?;
                        let (_, _, pcm) = ctl.resolve(&path).await?;
                        let mut volume = pcm.volume().await;
                        volume.soft = enabled;
                        pcm.set_volume(volume).await;
                        Ok(())
                    })
                },
            );
        })
    }

    fn list_services(&self) -> Vec<String> {
        self.config.profiles.iter().map(|p| format!("{p:?}")).collect()
    }

    async fn list_pcms(&self) -> Vec<(dbus::Path<'static>, PropMap)> {
        let mut out = Vec::new();
        for adapter in self.registry.adapters().await {
            for device in adapter.devices().await {
                for transport in device.transports().await {
                    let Some(pcms) = transport.pcms().await else { continue };
                    match pcms {
                        PcmSet::A2dp(a2dp) => {
                            out.push(self.describe(&device, &transport, "main", &a2dp.main).await);
                            if let Some(back) = &a2dp.back_channel {
                                out.push(self.describe(&device, &transport, "back", back).await);
                            }
                        }
                        PcmSet::Sco(sco) => {
                            out.push(self.describe(&device, &transport, "speaker", &sco.speaker).await);
                            out.push(self.describe(&device, &transport, "microphone", &sco.microphone).await);
                        }
                    }
                }
            }
        }
        out
    }

    async fn describe(&self, device: &Device, transport: &Transport, slot: &str, pcm: &PcmEndpoint) -> (dbus::Path<'static>, PropMap) {
        let path = pcm_path(transport.kind(), device.address(), slot);
        let mut props = PropMap::new();
        if let Ok(device_path) = device.dbus_path() {
            props.insert("Device".to_string(), Variant(Box::new(device_path) as _));
        }
        props.insert("Transport".to_string(), Variant(Box::new(format!("{:?}", transport.kind())) as _));
        let mode = if matches!(pcm.mode(), PcmMode::Source) { "source" } else { "sink" };
        props.insert("Mode".to_string(), Variant(Box::new(mode.to_string()) as _));
        props.insert("Format".to_string(), Variant(Box::new(pcm.format().descriptor()) as _));
        props.insert("Channels".to_string(), Variant(Box::new(pcm.channels()) as _));
        props.insert("Sampling".to_string(), Variant(Box::new(pcm.sample_rate()) as _));
        props.insert("Delay".to_string(), Variant(Box::new(pcm.delay_tenths_ms()) as _));
        if let Some(codec) = transport.codec().await {
            props.insert("Codec".to_string(), Variant(Box::new(format!("{:?}", codec.codec)) as _));
        }
        let volume = pcm.volume().await;
        props.insert("SoftVolume".to_string(), Variant(Box::new(volume.soft) as _));
        let levels: Vec<i32> = volume.channels.iter().map(|c| c.level_centidb as i32).collect();
        props.insert("Volume".to_string(), Variant(Box::new(levels) as _));
        let muted = volume.channels.first().map(|c| c.muted).unwrap_or(false);
        props.insert("Muted".to_string(), Variant(Box::new(muted) as _));
        (path, props)
    }

    async fn resolve(&self, path: &dbus::Path<'static>) -> Result<(Device, Transport, Arc<PcmEndpoint>)> {
        let (address, kind, slot) = parse_pcm_path(path).ok_or_else(|| Error::new(ErrorKind::DeviceNotFound))?;
        for adapter in self.registry.adapters().await {
            let Some(device) = adapter.existing_device(address).await else { continue };
            let Some(transport) = device.transport(kind).await else { continue };
            let Some(pcms) = transport.pcms().await else { continue };
            let pcm = match (&pcms, slot.as_str()) {
                (PcmSet::A2dp(a), "main") => a.main.clone(),
                (PcmSet::A2dp(a), "back") => a.back_channel.clone().ok_or_else(|| Error::new(ErrorKind::DeviceNotFound))?,
                (PcmSet::Sco(s), "speaker") => s.speaker.clone(),
                (PcmSet::Sco(s), "microphone") => s.microphone.clone(),
                _ => return Err(Error::new(ErrorKind::DeviceNotFound)),
            };
            return Ok((device, transport, pcm));
        }
        Err(Error::new(ErrorKind::DeviceNotFound))
    }

    /// Rejects the call unless `sender` is the client that currently holds `path` open.
    async fn check_owner(&self, path: &dbus::Path<'static>, sender: &str) -> Result<()> {
        let open_pcms = self.open_pcms.lock().await;
        match open_pcms.get(path) {
            Some(entry) if entry.owner == sender => Ok(()),
            _ => Err(Error::new(ErrorKind::Forbidden)),
        }
    }

    /// Creates the FIFO, attaches it to the PCM, acquires the Bluetooth socket lazily for an
    /// A2DP source, and (re)starts the worker that reads/writes it. Runs under `open_pcms` as
    /// the serialization point a per-device mutex would otherwise provide. `owner` is recorded so
    /// later `Close`/`Pause`/`Resume`/volume calls can be rejected if they come from anyone else,
    /// and a watch is spawned on the daemon's half of the notify pair so an abruptly-killed
    /// client's control socket hangup runs the same teardown as an explicit `Close`.
    async fn open(self: &Arc<Self>, path: &dbus::Path<'static>, owner: String) -> Result<(DbusOwnedFd, DbusOwnedFd)> {
        let mut open_pcms = self.open_pcms.lock().await;
        if open_pcms.contains_key(path) {
            return Err(Error::new(ErrorKind::DeviceBusy));
        }
        let (_device, transport, pcm) = self.resolve(path).await?;

        let fifo_path = self.config.state_dir.join(path.trim_start_matches('/').replace('/', "-"));
        if let Some(parent) = fifo_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        pcm.attach_fifo(&fifo_path, self.config.audio_group_gid).await?;

        if transport.kind() == TransportKind::A2dpSource {
            transport.acquire().await?;
        }
        restart_workers(&transport, &pcm).await;

        let client_fifo = match pcm.mode() {
            PcmMode::Source => tokio::fs::OpenOptions::new().write(true).open(&fifo_path).await,
            PcmMode::Sink => tokio::fs::File::open(&fifo_path).await,
        };
        let client_fifo = match client_fifo {
            Ok(file) => file,
            Err(err) => {
                pcm.detach_fifo().await?;
                return Err(err.into());
            }
        };
        let fifo_fd = unsafe { DbusOwnedFd::new(client_fifo.into_std().await.into_raw_fd()) };
        let (daemon_notify, client_notify) = make_notify_pair()?;
        let daemon_notify = AsyncFd::new(unsafe { OwnedFd::new(daemon_notify.into_raw_fd()) })?;

        let watch = {
            let ctl = self.clone();
            let watch_path = path.clone();
            tokio::spawn(async move {
                wait_for_hangup(&daemon_notify).await;
                if let Err(err) = ctl.close(&watch_path).await {
                    log::debug!("{watch_path}: disconnect cleanup: {err}");
                }
            })
            .abort_handle()
        };

        open_pcms.insert(path.clone(), OpenPcm { owner, watch });
        Ok((fifo_fd, client_notify))
    }

    /// Tears down an open PCM unconditionally: used both for a client-initiated `Close`/`Drop`
    /// (after [Self::check_owner] has already authorized it) and for the automatic cleanup the
    /// `Open`-spawned disconnect watch runs when the owner's control socket hangs up.
    async fn close(&self, path: &dbus::Path<'static>) -> Result<()> {
        let mut open_pcms = self.open_pcms.lock().await;
        let Some(entry) = open_pcms.remove(path) else {
            return Err(Error::new(ErrorKind::Forbidden));
        };
        entry.watch.abort();
        let (_, _, pcm) = self.resolve(path).await?;
        pcm.detach_fifo().await?;
        Ok(())
    }

    /// Waits for the transport to report no buffered frames, or the codec-dependent timeout.
    async fn drain(&self, path: &dbus::Path<'static>) -> Result<()> {
        let (_, transport, _) = self.resolve(path).await?;
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            let manager = transport.thread_manager();
            let running = manager.encoder_state().await != crate::transport::thread_manager::WorkerState::None
                || manager.decoder_state().await != crate::transport::thread_manager::WorkerState::None;
            if !running || tokio::time::Instant::now() >= deadline {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }
}

/// Blocks until the daemon's half of an `Open` notify pair sees its peer go away (a zero-length
/// read, the seqpacket-socket equivalent of POLLHUP), or the fd itself errors out.
async fn wait_for_hangup(fd: &AsyncFd<OwnedFd>) {
    let mut byte = [0u8; 1];
    loop {
        let mut guard = match fd.readable().await {
            Ok(guard) => guard,
            Err(_) => return,
        };
        let mut buf = ReadBuf::new(&mut byte);
        match guard.try_io(|inner| sock::recv(inner.get_ref(), &mut buf, 0)) {
            Ok(Ok(0)) => return,
            Ok(Ok(_)) => continue,
            Ok(Err(_)) => return,
            Err(_would_block) => continue,
        }
    }
}

/// (Re)starts whichever worker(s) `pcm`'s transport needs, now that its FIFO is attached. A
/// worker that already tried to start before any client opened the PCM returned immediately
/// (its FIFO open failed) and left the manager idle, so this call is what actually gets data
/// flowing the first time a client opens a PCM.
async fn restart_workers(transport: &Transport, pcm: &Arc<PcmEndpoint>) {
    match transport.pcms().await {
        Some(PcmSet::A2dp(_)) => {
            let codec_id = transport.codec().await.map(|c| c.codec).unwrap_or(crate::codec::CodecId::Sbc);
            media_endpoint::start_codec_worker(transport, pcm, codec_id).await;
        }
        Some(PcmSet::Sco(sco)) => {
            let codec_id = transport.codec().await.map(|c| c.codec).unwrap_or(crate::codec::CodecId::Cvsd);
            hfp_profile::start_pcm_workers(transport, &sco, codec_id).await;
        }
        None => {}
    }
}

fn pcm_path(kind: TransportKind, address: Address, slot: &str) -> dbus::Path<'static> {
    dbus::Path::new(format!("{PCM_PATH_PREFIX}{:?}/dev_{}/{slot}", kind, address.to_string().replace(':', "_"))).unwrap()
}

fn parse_pcm_path(path: &dbus::Path) -> Option<(Address, TransportKind, String)> {
    let rest = path.strip_prefix(PCM_PATH_PREFIX)?;
    let mut parts = rest.splitn(3, '/');
    let kind = match parts.next()? {
        "A2dpSource" => TransportKind::A2dpSource,
        "A2dpSink" => TransportKind::A2dpSink,
        "HfpAg" => TransportKind::HfpAg,
        "HfpHf" => TransportKind::HfpHf,
        "HspAg" => TransportKind::HspAg,
        "HspHs" => TransportKind::HspHs,
        "Midi" => TransportKind::Midi,
        _ => return None,
    };
    let address: Address = parts.next()?.strip_prefix("dev_")?.replace('_', ":").parse().ok()?;
    let slot = parts.next()?.to_string();
    Some((address, kind, slot))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_path_round_trips() {
        let address = Address::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let path = pcm_path(TransportKind::A2dpSink, address, "main");
        let (parsed_address, kind, slot) = parse_pcm_path(&path).unwrap();
        assert_eq!(parsed_address, address);
        assert_eq!(kind, TransportKind::A2dpSink);
        assert_eq!(slot, "main");
    }

    #[test]
    fn rejects_path_outside_the_pcm_namespace() {
        let path = dbus::Path::new("/org/bluez/hci0").unwrap();
        assert!(parse_pcm_path(&path).is_none());
    }
}
