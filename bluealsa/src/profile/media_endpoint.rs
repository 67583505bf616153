//! Registration of A2DP media endpoints with BlueZ's `Media1` interface, one per adapter per
//! codec/direction, and the transport lifecycle that follows once BlueZ selects a peer
//! configuration and later drives the transport through pending/active/idle.

use dbus::{
    arg::{PropMap, Variant},
    nonblock::Proxy,
};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken};
use std::{collections::HashMap, os::unix::io::IntoRawFd, sync::Arc};
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::{
    adapter::Adapter,
    codec::{
        sbc::{self, SbcParams},
        Codec, CodecConfiguration, CodecId,
    },
    method_call,
    pcm::{Format, PcmEndpoint, PcmMode},
    publish_path, read_dict,
    registry::Registry,
    session::Event,
    sock::OwnedFd,
    transport::{self, A2dpPcms, A2dpState, AcquireRelease, PcmSet, Transport, TransportKind},
    Device, Error, ErrorKind, Result, SessionInner, SERVICE_NAME, TIMEOUT,
};

pub(crate) const MEDIA_INTERFACE: &str = "org.bluez.Media1";
pub(crate) const MEDIA_ENDPOINT_INTERFACE: &str = "org.bluez.MediaEndpoint1";
pub(crate) const MEDIA_TRANSPORT_INTERFACE: &str = "org.bluez.MediaTransport1";
const ENDPOINT_PREFIX: &str = publish_path!("media_endpoint/");

/// Local ceiling on the SBC bitpool, matching the common A2DP sink default for 44.1/48kHz
/// joint-stereo streams.
const LOCAL_SBC_BITPOOL_MAX: u8 = 53;

const MEDIA_CODEC_SBC: u8 = 0x00;

/// A2DP Source: we send media to the peer. UUID `0000110a-0000-1000-8000-00805f9b34fb`.
pub const A2DP_SOURCE_UUID: Uuid = Uuid::from_bytes([
    0x00, 0x00, 0x11, 0x0a, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34, 0xfb,
]);

/// A2DP Sink: we receive media from the peer. UUID `0000110b-0000-1000-8000-00805f9b34fb`.
pub const A2DP_SINK_UUID: Uuid = Uuid::from_bytes([
    0x00, 0x00, 0x11, 0x0b, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34, 0xfb,
]);

/// Bit flags used inside the 4-byte SBC `Capabilities`/`Configuration` blob: a capabilities
/// blob ORs together every option an endpoint supports, a configuration blob sets exactly one
/// bit per field.
mod bits {
    pub const FREQ_48000: u8 = 0x01;
    pub const FREQ_44100: u8 = 0x02;
    pub const FREQ_32000: u8 = 0x04;
    pub const FREQ_16000: u8 = 0x08;

    pub const MODE_JOINT: u8 = 0x01;
    pub const MODE_STEREO: u8 = 0x02;
    pub const MODE_DUAL: u8 = 0x04;
    pub const MODE_MONO: u8 = 0x08;

    pub const BLOCK_16: u8 = 0x01;
    pub const BLOCK_12: u8 = 0x02;
    pub const BLOCK_8: u8 = 0x04;
    pub const BLOCK_4: u8 = 0x08;

    pub const SUBBANDS_8: u8 = 0x01;
    pub const SUBBANDS_4: u8 = 0x02;

    pub const ALLOC_LOUDNESS: u8 = 0x01;
    pub const ALLOC_SNR: u8 = 0x02;
}

/// Every bit set in both nibbles: the capabilities blob this daemon advertises, supporting the
/// full SBC option space with a conservative bitpool ceiling.
fn local_sbc_capabilities() -> Vec<u8> {
    vec![0xff, 0xff, 2, LOCAL_SBC_BITPOOL_MAX]
}

struct PeerSbcCaps {
    frequencies: Vec<u8>,
    modes: Vec<u8>,
    blocks: Vec<u8>,
    subbands: Vec<u8>,
    allocations: Vec<u8>,
    bitpool: (u8, u8),
}

fn parse_sbc_caps(caps: &[u8]) -> Result<PeerSbcCaps> {
    if caps.len() < 4 {
        return Err(Error::with_message(ErrorKind::Protocol("truncated SBC capabilities".into()), ""));
    }
    let mode_mask = caps[0] & 0x0f;
    let freq_mask = (caps[0] >> 4) & 0x0f;
    let alloc_mask = caps[1] & 0x03;
    let subbands_mask = (caps[1] >> 2) & 0x03;
    let block_mask = (caps[1] >> 4) & 0x0f;

    let mut frequencies = Vec::new();
    if freq_mask & bits::FREQ_48000 != 0 {
        frequencies.push(sbc::SBC_FREQ_48000);
    }
    if freq_mask & bits::FREQ_44100 != 0 {
        frequencies.push(sbc::SBC_FREQ_44100);
    }
    if freq_mask & bits::FREQ_32000 != 0 {
        frequencies.push(sbc::SBC_FREQ_32000);
    }
    if freq_mask & bits::FREQ_16000 != 0 {
        frequencies.push(sbc::SBC_FREQ_16000);
    }

    let mut modes = Vec::new();
    if mode_mask & bits::MODE_JOINT != 0 {
        modes.push(sbc::SBC_MODE_JOINT_STEREO);
    }
    if mode_mask & bits::MODE_STEREO != 0 {
        modes.push(sbc::SBC_MODE_STEREO);
    }
    if mode_mask & bits::MODE_DUAL != 0 {
        modes.push(sbc::SBC_MODE_DUAL_CHANNEL);
    }
    if mode_mask & bits::MODE_MONO != 0 {
        modes.push(sbc::SBC_MODE_MONO);
    }

    let mut blocks = Vec::new();
    if block_mask & bits::BLOCK_16 != 0 {
        blocks.push(16);
    }
    if block_mask & bits::BLOCK_12 != 0 {
        blocks.push(12);
    }
    if block_mask & bits::BLOCK_8 != 0 {
        blocks.push(8);
    }
    if block_mask & bits::BLOCK_4 != 0 {
        blocks.push(4);
    }

    let mut subbands = Vec::new();
    if subbands_mask & bits::SUBBANDS_8 != 0 {
        subbands.push(8);
    }
    if subbands_mask & bits::SUBBANDS_4 != 0 {
        subbands.push(4);
    }

    let mut allocations = Vec::new();
    if alloc_mask & bits::ALLOC_SNR != 0 {
        allocations.push(sbc::SBC_AM_SNR);
    }
    if alloc_mask & bits::ALLOC_LOUDNESS != 0 {
        allocations.push(sbc::SBC_AM_LOUDNESS);
    }

    Ok(PeerSbcCaps { frequencies, modes, blocks, subbands, allocations, bitpool: (caps[2], caps[3]) })
}

fn freq_bit(freq: u8) -> u8 {
    match freq {
        sbc::SBC_FREQ_48000 => bits::FREQ_48000,
        sbc::SBC_FREQ_44100 => bits::FREQ_44100,
        sbc::SBC_FREQ_32000 => bits::FREQ_32000,
        _ => bits::FREQ_16000,
    }
}

fn mode_bit(mode: u8) -> u8 {
    match mode {
        sbc::SBC_MODE_JOINT_STEREO => bits::MODE_JOINT,
        sbc::SBC_MODE_STEREO => bits::MODE_STEREO,
        sbc::SBC_MODE_DUAL_CHANNEL => bits::MODE_DUAL,
        _ => bits::MODE_MONO,
    }
}

fn block_bit(blocks: u8) -> u8 {
    match blocks {
        16 => bits::BLOCK_16,
        12 => bits::BLOCK_12,
        8 => bits::BLOCK_8,
        _ => bits::BLOCK_4,
    }
}

fn subbands_bit(subbands: u8) -> u8 {
    if subbands >= 8 {
        bits::SUBBANDS_8
    } else {
        bits::SUBBANDS_4
    }
}

fn alloc_bit(allocation: u8) -> u8 {
    if allocation == sbc::SBC_AM_SNR {
        bits::ALLOC_SNR
    } else {
        bits::ALLOC_LOUDNESS
    }
}

/// Packs a single resolved [SbcParams] into the 4-byte wire form BlueZ expects back from
/// `SelectConfiguration`, and which it later hands unchanged to `SetConfiguration`.
fn pack_sbc_configuration(params: &SbcParams) -> Vec<u8> {
    let byte0 = (freq_bit(params.frequency) << 4) | mode_bit(params.mode);
    let byte1 = (block_bit(params.blocks) << 4) | (subbands_bit(params.subbands) << 2) | alloc_bit(params.allocation);
    vec![byte0, byte1, params.bitpool, params.bitpool]
}

fn sbc_freq_hz(freq: u8) -> u32 {
    match freq {
        sbc::SBC_FREQ_48000 => 48_000,
        sbc::SBC_FREQ_44100 => 44_100,
        sbc::SBC_FREQ_32000 => 32_000,
        _ => 16_000,
    }
}

fn parse_transport_state(value: &str) -> Option<A2dpState> {
    match value {
        "idle" => Some(A2dpState::Idle),
        "pending" => Some(A2dpState::Pending),
        "active" => Some(A2dpState::Active),
        "broadcasting" => Some(A2dpState::Broadcasting),
        _ => None,
    }
}

/// The registered `org.bluez.MediaEndpoint1` object for one codec/direction pair on one
/// adapter.
pub(crate) struct RegisteredMediaEndpoint {
    registry: Arc<Registry>,
    inner: Arc<SessionInner>,
    kind: TransportKind,
    uuid: Uuid,
    codec_id: u8,
    capabilities: Vec<u8>,
    active: Mutex<HashMap<dbus::Path<'static>, Device>>,
}

impl RegisteredMediaEndpoint {
    /// Builds the SBC media endpoint for `kind` (`A2dpSource` or `A2dpSink`).
    pub(crate) fn new_sbc(registry: Arc<Registry>, inner: Arc<SessionInner>, kind: TransportKind) -> Self {
        let uuid = match kind {
            TransportKind::A2dpSource => A2DP_SOURCE_UUID,
            _ => A2DP_SINK_UUID,
        };
        Self {
            registry,
            inner,
            kind,
            uuid,
            codec_id: MEDIA_CODEC_SBC,
            capabilities: local_sbc_capabilities(),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(MEDIA_ENDPOINT_INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            ib.method_with_cr_async("SelectConfiguration", ("capabilities",), ("configuration",), {
                |ctx, cr, (caps,): (Vec<u8>,)| {
                    method_call(ctx, cr, |reg: Arc<Self>| async move {
                        let peer = parse_sbc_caps(&caps)?;
                        let params = sbc::negotiate(
                            &peer.frequencies, &peer.modes, &peer.blocks, &peer.subbands, &peer.allocations,
                            peer.bitpool, LOCAL_SBC_BITPOOL_MAX,
                        )
                        .ok_or_else(|| Error::new(ErrorKind::NotSupported))?;
                        Ok((pack_sbc_configuration(&params),))
                    })
                }
            });

            ib.method_with_cr_async(
                "SetConfiguration",
                ("transport", "properties"),
                (),
                |ctx, cr, (transport_path, properties): (dbus::Path<'static>, PropMap)| {
                    method_call(ctx, cr, |reg: Arc<Self>| async move {
                        reg.set_configuration(transport_path, properties).await?;
                        Ok(())
                    })
                },
            );

            ib.method_with_cr_async(
                "ClearConfiguration",
                ("transport",),
                (),
                |ctx, cr, (transport_path,): (dbus::Path<'static>,)| {
                    method_call(ctx, cr, |reg: Arc<Self>| async move {
                        reg.clear_configuration(&transport_path).await;
                        Ok(())
                    })
                },
            );

            ib.method_with_cr_async("Release", (), (), |ctx, cr, ()| {
                method_call(ctx, cr, |reg: Arc<Self>| async move {
                    let paths: Vec<_> = reg.active.lock().await.keys().cloned().collect();
                    for path in paths {
                        reg.clear_configuration(&path).await;
                    }
                    Ok(())
                })
            });
        })
    }

    async fn set_configuration(self: &Arc<Self>, transport_path: dbus::Path<'static>, properties: PropMap) -> Result<()> {
        let device_path: dbus::Path<'static> = read_dict::<dbus::Path<'static>>(&properties, "Device")?.clone();
        let device = self.registry.device(&device_path).await.ok_or_else(|| Error::new(ErrorKind::DeviceNotFound))?;
        let config: Vec<u8> = read_dict::<Vec<u8>>(&properties, "Configuration")?.clone();
        let peer = parse_sbc_caps(&config)?;
        let frequency = *peer.frequencies.first().ok_or_else(|| Error::new(ErrorKind::NotSupported))?;
        let mode = *peer.modes.first().ok_or_else(|| Error::new(ErrorKind::NotSupported))?;
        let channels = if mode == sbc::SBC_MODE_MONO { 1 } else { 2 };
        let sample_rate = sbc_freq_hz(frequency);

        let io = Arc::new(A2dpTransportIo::new(self.inner.connection.clone(), transport_path.clone()));
        let transport = Transport::new(self.kind, device.address(), io);
        transport.set_codec(CodecConfiguration { codec: CodecId::Sbc, blob: config }).await;
        transport.set_state(A2dpState::Pending).await;

        let mode = if self.kind == TransportKind::A2dpSource { PcmMode::Source } else { PcmMode::Sink };
        let initial_volume = self.registry.config().initial_volume;
        let main = Arc::new(PcmEndpoint::new(mode, Format::S16LE, channels, sample_rate, initial_volume));
        transport.set_pcms(PcmSet::A2dp(A2dpPcms { main: main.clone(), back_channel: None })).await;

        device.insert_transport(self.kind, transport.clone()).await;
        self.active.lock().await.insert(transport_path.clone(), device.clone());

        tokio::spawn(self.clone().watch_transport(transport_path, device, transport, main));
        Ok(())
    }

    async fn clear_configuration(&self, transport_path: &dbus::Path<'static>) {
        if let Some(device) = self.active.lock().await.remove(transport_path) {
            if let Some(transport) = device.remove_transport(self.kind).await {
                transport.destroy().await;
            }
        }
    }

    /// Follows `MediaTransport1.State` property changes, acquiring the Bluetooth socket and
    /// starting the codec worker once BlueZ drives the transport to `active`, per §4.3's rule
    /// that state transitions only ever come from bus events, never an internally invented one.
    async fn watch_transport(
        self: Arc<Self>, transport_path: dbus::Path<'static>, device: Device, transport: Transport,
        pcm: Arc<PcmEndpoint>,
    ) {
        let mut events = match Event::subscribe(&mut self.inner.event_sub_tx.clone(), transport_path.clone(), false).await {
            Ok(events) => events,
            Err(err) => {
                log::warn!("media endpoint: failed to subscribe to {transport_path}: {err}");
                return;
            }
        };

        use tokio_stream::StreamExt;
        while let Some(event) = events.next().await {
            let Event::PropertiesChanged { interface, changed, .. } = event else { continue };
            if interface != MEDIA_TRANSPORT_INTERFACE {
                continue;
            }
            let Some(state_value) = crate::read_opt_prop!(&changed, "State", String) else { continue };
            let Some(state) = parse_transport_state(&state_value) else { continue };
            transport.set_state(state).await;

            if state == A2dpState::Active && transport.bt_fd().await.is_none() {
                if let Err(err) = transport.acquire().await {
                    log::warn!("{}: failed to acquire A2DP transport: {err}", device.address());
                    continue;
                }
                let codec_id = transport.codec().await.map(|c| c.codec).unwrap_or(CodecId::Sbc);
                start_codec_worker(&transport, &pcm, codec_id).await;
            }
        }

        self.clear_configuration(&transport_path).await;
    }
}

pub(crate) async fn start_codec_worker(transport: &Transport, pcm: &Arc<PcmEndpoint>, codec_id: CodecId) {
    let sbc_params = match transport.codec().await {
        Some(cfg) if cfg.blob.len() >= 4 => parse_sbc_caps(&cfg.blob).ok().and_then(|peer| {
            Some(SbcParams {
                frequency: *peer.frequencies.first()?,
                mode: *peer.modes.first()?,
                allocation: sbc::SBC_AM_LOUDNESS,
                blocks: *peer.blocks.first()?,
                subbands: *peer.subbands.first()?,
                bitpool: peer.bitpool.0,
            })
        }),
        _ => None,
    };
    let codec: Box<dyn Codec> = match (codec_id, sbc_params) {
        (CodecId::Sbc, Some(params)) => match crate::codec::sbc::Sbc::new(params) {
            Ok(c) => Box::new(c),
            Err(err) => {
                log::warn!("a2dp: failed to initialize SBC codec: {err}");
                return;
            }
        },
        _ => {
            log::warn!("a2dp: unsupported codec {codec_id:?}");
            return;
        }
    };

    let manager = transport.thread_manager();
    let t = transport.clone();
    let p = pcm.clone();
    match t.kind() {
        TransportKind::A2dpSource => {
            manager.start_encoder(move |handle| transport::a2dp::run_encoder(t, p, codec_id, codec, handle)).await;
        }
        _ => {
            manager
                .start_decoder(move |handle| transport::a2dp::run_decoder(t, p, codec_id.rtp_payload_type(), codec, handle))
                .await;
        }
    }
}

/// Handle to a registered media endpoint. Drop to unregister it.
pub struct MediaEndpointHandle {
    _drop_tx: oneshot::Sender<()>,
}

impl RegisteredMediaEndpoint {
    /// Registers this endpoint with BlueZ's per-adapter `Media1.RegisterEndpoint`.
    pub(crate) async fn register(self: Arc<Self>, adapter_name: &str) -> Result<MediaEndpointHandle> {
        let path = dbus::Path::new(format!("{ENDPOINT_PREFIX}{adapter_name}/{:?}", self.kind)).unwrap();
        {
            let mut cr = self.inner.crossroads.lock().await;
            cr.insert(path.clone(), &[self.inner.media_endpoint_token], self.clone());
        }

        let mut opts = PropMap::new();
        opts.insert("UUID".to_string(), Variant(Box::new(self.uuid.to_string()) as _));
        opts.insert("Codec".to_string(), Variant(Box::new(self.codec_id) as _));
        opts.insert("Capabilities".to_string(), Variant(Box::new(self.capabilities.clone()) as _));

        let proxy = Proxy::new(SERVICE_NAME, Adapter::dbus_path(adapter_name)?, TIMEOUT, self.inner.connection.clone());
        proxy.method_call::<(), _, _, _>(MEDIA_INTERFACE, "RegisterEndpoint", (path.clone(), opts)).await?;

        let (drop_tx, drop_rx) = oneshot::channel();
        let inner = self.inner.clone();
        let unreg_path = path.clone();
        tokio::spawn(async move {
            let _ = drop_rx.await;
            let _: std::result::Result<(), dbus::Error> =
                proxy.method_call(MEDIA_INTERFACE, "UnregisterEndpoint", (unreg_path.clone(),)).await;
            let mut cr = inner.crossroads.lock().await;
            let _: Option<Arc<RegisteredMediaEndpoint>> = cr.remove(&unreg_path);
        });

        Ok(MediaEndpointHandle { _drop_tx: drop_tx })
    }
}

/// Acquires/releases an A2DP transport's Bluetooth socket through BlueZ's
/// `MediaTransport1.Acquire`/`Release`, rather than a raw socket this daemon owns outright.
struct A2dpTransportIo {
    connection: Arc<dbus::nonblock::SyncConnection>,
    path: dbus::Path<'static>,
}

impl A2dpTransportIo {
    fn new(connection: Arc<dbus::nonblock::SyncConnection>, path: dbus::Path<'static>) -> Self {
        Self { connection, path }
    }
}

#[async_trait::async_trait]
impl AcquireRelease for A2dpTransportIo {
    async fn acquire(&self) -> Result<(OwnedFd, u16, u16)> {
        let proxy = Proxy::new(SERVICE_NAME, self.path.clone(), TIMEOUT, &*self.connection);
        let (fd, mtu_read, mtu_write): (dbus::arg::OwnedFd, u16, u16) =
            proxy.method_call(MEDIA_TRANSPORT_INTERFACE, "Acquire", ()).await?;
        Ok((unsafe { OwnedFd::new(fd.into_raw_fd()) }, mtu_read, mtu_write))
    }

    async fn release(&self) {
        let proxy = Proxy::new(SERVICE_NAME, self.path.clone(), TIMEOUT, &*self.connection);
        let _: std::result::Result<(), dbus::Error> = proxy.method_call(MEDIA_TRANSPORT_INTERFACE, "Release", ()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_round_trips_through_negotiation() {
        let caps = local_sbc_capabilities();
        let peer = parse_sbc_caps(&caps).unwrap();
        let params = sbc::negotiate(
            &peer.frequencies, &peer.modes, &peer.blocks, &peer.subbands, &peer.allocations, peer.bitpool,
            LOCAL_SBC_BITPOOL_MAX,
        )
        .unwrap();
        assert_eq!(params.frequency, sbc::SBC_FREQ_48000);
        assert_eq!(params.mode, sbc::SBC_MODE_JOINT_STEREO);
        assert_eq!(params.blocks, 16);
        assert_eq!(params.subbands, 8);
        assert_eq!(params.bitpool, LOCAL_SBC_BITPOOL_MAX);
    }

    #[test]
    fn packed_configuration_parses_back_to_a_single_choice_each() {
        let params = SbcParams {
            frequency: sbc::SBC_FREQ_44100,
            mode: sbc::SBC_MODE_STEREO,
            allocation: sbc::SBC_AM_LOUDNESS,
            blocks: 12,
            subbands: 4,
            bitpool: 35,
        };
        let blob = pack_sbc_configuration(&params);
        let parsed = parse_sbc_caps(&blob).unwrap();
        assert_eq!(parsed.frequencies, vec![sbc::SBC_FREQ_44100]);
        assert_eq!(parsed.modes, vec![sbc::SBC_MODE_STEREO]);
        assert_eq!(parsed.blocks, vec![12]);
        assert_eq!(parsed.subbands, vec![4]);
        assert_eq!(parsed.bitpool, (35, 35));
    }

    #[test]
    fn rejects_a_truncated_capabilities_blob() {
        assert!(parse_sbc_caps(&[0xff]).is_err());
    }
}
