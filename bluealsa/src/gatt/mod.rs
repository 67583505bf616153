//! BLE-MIDI: one GATT service with one bidirectional characteristic, registered against
//! BlueZ's `GattManager1` and bridged to a pair of well-known local unix-domain sockets (write,
//! notify) through [crate::transport::midi].

pub mod local;

use std::{os::unix::fs::PermissionsExt, sync::Arc};
use tokio::{net::UnixListener, sync::Mutex};
use uuid::Uuid;

use crate::{
    adv::Advertisement,
    config::Config,
    transport::midi::{self, MidiMessage, MidiSockets, MidiTransport},
    Address, Result, SessionInner,
};
use local::{
    Application, Characteristic, CharacteristicNotify, CharacteristicRead, CharacteristicReadRequest,
    CharacteristicWrite, CharacteristicWriteRequest, Service,
};

/// BLE-MIDI service UUID (`03B80E5A-EDE8-4B33-A751-6CE34EC4C700`).
pub const MIDI_SERVICE_UUID: Uuid =
    Uuid::from_bytes([0x03, 0xb8, 0x0e, 0x5a, 0xed, 0xe8, 0x4b, 0x33, 0xa7, 0x51, 0x6c, 0xe3, 0x4e, 0xc4, 0xc7, 0x00]);

/// BLE-MIDI characteristic UUID (`7772E5DB-3868-4112-A1A9-F2669D106BF3`).
pub const MIDI_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_bytes([0x77, 0x72, 0xe5, 0xdb, 0x38, 0x68, 0x41, 0x12, 0xa1, 0xa9, 0xf2, 0x66, 0x9d, 0x10, 0x6b, 0xf3]);

/// Handle to the registered BLE-MIDI application and its local sockets. Drop to unregister.
pub struct MidiHandle {
    _application: local::ApplicationHandle,
    _advertisement: crate::adv::AdvertisementHandle,
    _midi_transport: Arc<MidiTransport>,
}

/// Binds a listening unix-domain socket at `path`, group-writable if `group_gid` is given, and
/// accepts exactly one connection from it, per the single-BLE-central assumption this daemon
/// makes for MIDI (mirrors [crate::pcm::PcmEndpoint::attach_fifo]'s permission handling).
async fn accept_one(path: &std::path::Path, group_gid: Option<u32>) -> Result<tokio::net::UnixStream> {
    let _ = tokio::fs::remove_file(path).await;
    let listener = UnixListener::bind(path)?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660)).await?;
    if let Some(gid) = group_gid {
        if let Ok(cpath) = std::ffi::CString::new(path.as_os_str().to_string_lossy().as_bytes()) {
            unsafe { libc::chown(cpath.as_ptr(), u32::MAX, gid) };
        }
    }
    let (stream, _) = listener.accept().await?;
    Ok(stream)
}

/// Registers the BLE-MIDI GATT application on `adapter_name` and binds its local sockets under
/// `config.state_dir`. Runs the ALSA sequencer port this daemon's C ancestor also exposed is out
/// of scope here: no `alsa`/`alsa-sys` dependency exists anywhere in this crate's stack, so BLE-MIDI
/// is reachable only through the two local sockets below, not through a kernel sequencer client.
pub async fn register(inner: Arc<SessionInner>, config: Arc<Config>, adapter_name: &str) -> Result<MidiHandle> {
    let write_path = config.state_dir.join("midi-write.sock");
    let notify_path = config.state_dir.join("midi-notify.sock");
    tokio::fs::create_dir_all(&config.state_dir).await?;

    let (write_stream, notify_stream) =
        tokio::try_join!(accept_one(&write_path, config.audio_group_gid), accept_one(&notify_path, config.audio_group_gid))?;

    let sockets =
        Arc::new(MidiSockets { write: Arc::new(Mutex::new(write_stream)), notify: Arc::new(Mutex::new(notify_stream)) });
    let midi_transport = Arc::new(MidiTransport::new(Address::any(), sockets));

    // Central -> WriteValue -> this channel -> the notify socket.
    let (to_notify_socket_tx, to_notify_socket_rx) = tokio::sync::mpsc::channel::<MidiMessage>(32);
    // Write socket -> this channel -> the characteristic's Notify push to the central.
    let (from_write_socket_tx, from_write_socket_rx) = tokio::sync::mpsc::channel::<MidiMessage>(32);
    let from_write_socket_rx = Arc::new(Mutex::new(from_write_socket_rx));

    midi_transport.start_notify(to_notify_socket_rx).await;
    midi_transport.start_write(from_write_socket_tx).await;

    let characteristic = Characteristic {
        uuid: MIDI_CHARACTERISTIC_UUID,
        read: Some(CharacteristicRead {
            fun: Box::new(|_req: CharacteristicReadRequest| Box::pin(async { Ok(Vec::new()) })),
        }),
        write: Some(CharacteristicWrite {
            write: true,
            write_without_response: true,
            fun: Box::new(move |value: Vec<u8>, _req: CharacteristicWriteRequest| {
                let to_notify_socket_tx = to_notify_socket_tx.clone();
                Box::pin(async move {
                    for message in midi::parse_payload(&value) {
                        let _ = to_notify_socket_tx.send(message).await;
                    }
                    Ok(())
                })
            }),
        }),
        notify: Some(CharacteristicNotify {
            fun: Box::new(move |mut notifier: local::CharacteristicNotifier| {
                let from_write_socket_rx = from_write_socket_rx.clone();
                Box::pin(async move {
                    tokio::spawn(async move {
                        let mut rx = from_write_socket_rx.lock().await;
                        loop {
                            tokio::select! {
                                _ = notifier.stopped() => break,
                                message = rx.recv() => match message {
                                    Some(message) => {
                                        if notifier.notify(midi::encode_payload(&message)).await.is_err() {
                                            break;
                                        }
                                    }
                                    None => break,
                                },
                            }
                        }
                    });
                })
            }),
        }),
    };

    let service = Service { uuid: MIDI_SERVICE_UUID, primary: true, characteristics: vec![characteristic] };
    let application = Application { services: vec![service] }.register(inner.clone(), adapter_name).await?;

    let advertisement = Advertisement { service_uuids: vec![MIDI_SERVICE_UUID], local_name: None }
        .register(inner, adapter_name)
        .await?;

    Ok(MidiHandle { _application: application, _advertisement: advertisement, _midi_transport: midi_transport })
}
