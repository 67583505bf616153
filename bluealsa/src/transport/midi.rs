//! BLE-MIDI transport: a streaming parser/encoder pair shuttling MIDI messages between a GATT
//! characteristic and a pair of local unix-domain sockets (write, notify).
//!
//! This is the one transport kind that never touches a raw Bluetooth socket directly — the
//! underlying link is the already-connected GATT characteristic exposed by [crate::gatt::local];
//! `acquire`/`release` here bind and unbind the local sockets instead of an `AsyncFd`.

use std::sync::Arc;
use tokio::{
    net::UnixStream,
    sync::{mpsc, Mutex},
};

use crate::{
    transport::{thread_manager::WorkerHandle, AcquireRelease, Transport, TransportKind},
    Address, Error, ErrorKind, Result,
};

/// One decoded BLE-MIDI message: a running-status MIDI command plus its data bytes, tagged with
/// the BLE-MIDI timestamp it arrived with.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MidiMessage {
    pub timestamp: u16,
    pub bytes: Vec<u8>,
}

/// Parses a BLE-MIDI characteristic payload (header byte, then one or more timestamped MIDI
/// events) into individual messages. Running status (omitted status byte, reusing the previous
/// command) is expanded so callers never see a partial message.
pub fn parse_payload(payload: &[u8]) -> Vec<MidiMessage> {
    let mut messages = Vec::new();
    if payload.is_empty() {
        return messages;
    }
    let mut i = 1; // skip the header byte (top bit set, low 6 bits = timestamp high)
    let mut running_status = 0u8;
    while i < payload.len() {
        if payload[i] & 0x80 == 0 {
            break; // malformed: expected a timestamp byte
        }
        let timestamp = payload[i] as u16;
        i += 1;
        if i >= payload.len() {
            break;
        }
        let status = if payload[i] & 0x80 != 0 {
            running_status = payload[i];
            i += 1;
            payload[i - 1]
        } else {
            running_status
        };
        let data_len = midi_data_len(status);
        if i + data_len > payload.len() {
            break;
        }
        let mut bytes = vec![status];
        bytes.extend_from_slice(&payload[i..i + data_len]);
        i += data_len;
        messages.push(MidiMessage { timestamp, bytes });
    }
    messages
}

/// Encodes one MIDI message into a BLE-MIDI characteristic payload with a fresh header byte.
pub fn encode_payload(message: &MidiMessage) -> Vec<u8> {
    let mut out = vec![0x80 | ((message.timestamp >> 7) as u8 & 0x3f)];
    out.push(0x80 | (message.timestamp as u8 & 0x7f));
    out.extend_from_slice(&message.bytes);
    out
}

fn midi_data_len(status: u8) -> usize {
    match status & 0xf0 {
        0x80 | 0x90 | 0xa0 | 0xb0 | 0xe0 => 2,
        0xc0 | 0xd0 => 1,
        _ => match status {
            0xf1 | 0xf3 => 1,
            0xf2 => 2,
            _ => 0,
        },
    }
}

/// A BLE-MIDI transport's local-facing sockets: one the client writes MIDI into, one the daemon
/// uses to notify the client of incoming messages.
pub struct MidiSockets {
    pub write: Arc<Mutex<UnixStream>>,
    pub notify: Arc<Mutex<UnixStream>>,
}

/// [AcquireRelease] for a MIDI transport: the underlying link is the already-connected GATT
/// characteristic, not a raw Bluetooth socket, so there is nothing to acquire. `Transport::bt_fd`
/// is simply never populated for a MIDI transport; its workers talk to [MidiSockets] directly.
struct MidiIo;

#[async_trait::async_trait]
impl AcquireRelease for MidiIo {
    async fn acquire(&self) -> Result<(crate::sock::OwnedFd, u16, u16)> {
        Err(Error::new(ErrorKind::NotSupported))
    }

    async fn release(&self) {}
}

/// A BLE-MIDI transport: the generic [Transport]/[crate::transport::thread_manager::ThreadManager]
/// machinery, carrying the write and notify workers instead of an A2DP/SCO codec pair.
pub struct MidiTransport {
    pub transport: Transport,
    sockets: Arc<MidiSockets>,
}

impl MidiTransport {
    pub fn new(device_address: Address, sockets: Arc<MidiSockets>) -> Self {
        let transport = Transport::new(TransportKind::Midi, device_address, Arc::new(MidiIo));
        Self { transport, sockets }
    }

    /// Starts the worker draining the write socket into `tx`, one MIDI message at a time, for
    /// the GATT characteristic's write handler to forward onward.
    pub async fn start_write(&self, tx: mpsc::Sender<MidiMessage>) {
        let sockets = self.sockets.clone();
        self.transport.thread_manager().start_encoder(move |handle| run_write(sockets, tx, handle)).await;
    }

    /// Starts the worker draining `rx` onto the notify socket, one MIDI message at a time, fed
    /// by the GATT characteristic's own outgoing message channel.
    pub async fn start_notify(&self, rx: mpsc::Receiver<MidiMessage>) {
        let sockets = self.sockets.clone();
        self.transport.thread_manager().start_decoder(move |handle| run_notify(sockets, rx, handle)).await;
    }

    pub async fn destroy(&self) {
        self.transport.destroy().await;
    }
}

/// Drains MIDI messages written by the GATT peer onto the notify socket, until cancelled.
pub async fn run_notify(sockets: Arc<MidiSockets>, mut rx: mpsc::Receiver<MidiMessage>, mut handle: WorkerHandle) {
    use tokio::io::AsyncWriteExt;
    handle.mark_running().await;
    loop {
        let message = tokio::select! {
            biased;
            _ = handle.cancelled() => break,
            message = rx.recv() => match message {
                Some(m) => m,
                None => break,
            },
        };
        let payload = encode_payload(&message);
        let mut notify = sockets.notify.lock().await;
        if notify.write_all(&payload).await.is_err() {
            break;
        }
    }
}

/// Reads client-written MIDI bytes off the write socket, parses them and forwards them to the
/// GATT characteristic write path via `tx`, until cancelled.
pub async fn run_write(sockets: Arc<MidiSockets>, tx: mpsc::Sender<MidiMessage>, mut handle: WorkerHandle) {
    use tokio::io::AsyncReadExt;
    handle.mark_running().await;
    let mut buf = [0u8; 256];
    loop {
        let n = {
            let mut write = sockets.write.lock().await;
            tokio::select! {
                biased;
                _ = handle.cancelled() => break,
                result = write.read(&mut buf) => match result {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                },
            }
        };
        for message in parse_payload(&buf[..n]) {
            if tx.send(message).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_single_note_on_message() {
        let payload = [0x80, 0x80 | 0x05, 0x90, 0x40, 0x7f];
        let messages = parse_payload(&payload);
        assert_eq!(messages, vec![MidiMessage { timestamp: 5, bytes: vec![0x90, 0x40, 0x7f] }]);
    }

    #[test]
    fn running_status_reuses_previous_command() {
        let payload = [0x80, 0x80, 0x90, 0x40, 0x7f, 0x80, 0x41, 0x7f];
        let messages = parse_payload(&payload);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].bytes, vec![0x90, 0x41, 0x7f]);
    }

    #[test]
    fn encode_then_parse_round_trips() {
        let message = MidiMessage { timestamp: 42, bytes: vec![0x80, 0x3c, 0x00] };
        let payload = encode_payload(&message);
        let parsed = parse_payload(&payload);
        assert_eq!(parsed, vec![message]);
    }

    #[test]
    fn truncated_payload_parses_as_empty() {
        assert_eq!(parse_payload(&[0x80]), vec![]);
        assert_eq!(parse_payload(&[]), vec![]);
    }
}
