//! The HFP/HSP service level connection (SLC) state machine.
//!
//! Every state transition mirrors the peer's role: an HF-side session drives the handshake by
//! sending each `AT+...` command and waiting for `OK`/`ERROR`; an AG-side session waits for the
//! HF's command and replies. HSP has no handshake at all — the moment the RFCOMM socket is
//! connected the session is already [SlcState::Connected]. The state ordering itself —
//! `Disconnected -> BrsfSet -> BrsfSetOk -> BacSetOk -> CindTest -> CindTestOk -> CindGet ->
//! CindGetOk -> CmerSetOk -> Connected` — is linear in both directions; only who sends and who
//! waits differs.

use std::time::Duration;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::mpsc,
};

use crate::{
    codec::CodecId,
    rfcomm::{at::{self, AtMessage, AtType}, is_peer_disconnect, Stream},
};

/// HFP feature bit (`AT+BRSF`), the subset BlueALSA negotiates. Values match the Bluetooth HFP
/// specification's `Bitmap of AG/HF Supported Features`.
pub mod features {
    pub const HF_ECNR: u32 = 1 << 0;
    pub const HF_CALL_WAITING: u32 = 1 << 1;
    pub const HF_CLI: u32 = 1 << 2;
    pub const HF_VOICE_RECOGNITION: u32 = 1 << 3;
    pub const HF_REMOTE_VOLUME_CONTROL: u32 = 1 << 4;
    pub const HF_CODEC_NEGOTIATION: u32 = 1 << 7;

    pub const AG_CODEC_NEGOTIATION: u32 = 1 << 9;
}

/// Role a session plays in the handshake: the hands-free unit drives the handshake, the audio
/// gateway waits for and answers each command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    HandsFree,
    AudioGateway,
}

/// Which telephony profile this session is running: HFP has the full SLC handshake and codec
/// negotiation, HSP has neither.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Profile {
    Hfp,
    Hsp,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlcState {
    Disconnected,
    BrsfSet,
    BrsfSetOk,
    BacSetOk,
    CindTest,
    CindTestOk,
    CindGet,
    CindGetOk,
    CmerSetOk,
    Connected,
}

/// An event raised by a running session, forwarded to whoever owns the transport so it can
/// react (e.g. create the SCO transport once a codec is picked, or forward a volume change to
/// the mixer).
#[derive(Clone, Debug)]
pub enum SlcEvent {
    Connected,
    CodecSelected(CodecId),
    SpeakerVolume(u8),
    MicrophoneVolume(u8),
    Indicator { index: u8, value: i32 },
    Disconnected,
}

/// Local indicator state as reported via `AT+CIND`/`+CIEV`, ordered per the indicator index
/// table negotiated during `AT+CIND=?`.
const INDICATORS: &[(&str, i32, i32)] =
    &[("service", 0, 1), ("call", 0, 1), ("callsetup", 0, 3), ("callheld", 0, 2), ("signal", 0, 5), ("roam", 0, 1), ("battchg", 0, 5)];

/// Runs one SLC session to completion (until the peer disconnects), emitting [SlcEvent]s on
/// `events` as the handshake and subsequent indicator/volume traffic progress. The caller owns
/// cancellation by aborting the task this runs in; there is no internal cancellation signal.
pub async fn run(mut stream: Stream, role: Role, profile: Profile, events: mpsc::Sender<SlcEvent>) {
    if profile == Profile::Hsp {
        let _ = events.send(SlcEvent::Connected).await;
    }

    let mut state = if profile == Profile::Hsp { SlcState::Connected } else { SlcState::Disconnected };
    let mut buf = vec![0u8; 512];
    let mut pending = Vec::new();
    let handshake_deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;

    loop {
        if role == Role::HandsFree && profile == Profile::Hfp && state != SlcState::Connected {
            if let Some(line) = next_hf_command(state) {
                if stream.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        }

        let read = stream.read(&mut buf);
        let n = if profile == Profile::Hfp && state != SlcState::Connected {
            match tokio::time::timeout_at(handshake_deadline, read).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(err)) if is_peer_disconnect(&err) => break,
                Ok(Err(_)) => break,
                Err(_elapsed) => {
                    log::warn!("rfcomm: AT+BRSF handshake timed out, dropping session");
                    break;
                }
            }
        } else {
            match read.await {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if is_peer_disconnect(&err) => break,
                Err(_) => break,
            }
        };
        pending.extend_from_slice(&buf[..n]);

        loop {
            let (messages, consumed) = match at::parse(&pending) {
                Ok(result) => result,
                Err(_) => {
                    log::warn!("rfcomm: malformed AT message, dropping buffered input");
                    pending.clear();
                    break;
                }
            };
            if consumed == 0 {
                break;
            }
            pending.drain(..consumed);
            for message in messages {
                if let Some(reply) = handle_message(&message, role, &mut state, &events).await {
                    if stream.write_all(reply.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
            if pending.is_empty() {
                break;
            }
        }
    }

    let _ = events.send(SlcEvent::Disconnected).await;
}

fn next_hf_command(state: SlcState) -> Option<String> {
    Some(at::format_line(&match state {
        SlcState::Disconnected => format!("AT+BRSF={}", features::HF_CODEC_NEGOTIATION | features::HF_REMOTE_VOLUME_CONTROL),
        SlcState::BrsfSetOk => "AT+BAC=1,2".to_string(),
        SlcState::BacSetOk => "AT+CIND=?".to_string(),
        SlcState::CindTestOk => "AT+CIND?".to_string(),
        SlcState::CindGetOk => "AT+CMER=3,0,0,1".to_string(),
        _ => return None,
    }))
}

async fn handle_message(message: &AtMessage, role: Role, state: &mut SlcState, events: &mpsc::Sender<SlcEvent>) -> Option<String> {
    match role {
        Role::HandsFree => handle_hf_response(message, state, events).await,
        Role::AudioGateway => handle_ag_command(message, state, events).await,
    }
}

async fn handle_hf_response(message: &AtMessage, state: &mut SlcState, events: &mpsc::Sender<SlcEvent>) -> Option<String> {
    if message.kind == AtType::Resp && message.command == "BCS" {
        if let Ok(id) = message.value.trim().parse::<u8>() {
            let codec = if id == 2 { CodecId::Msbc } else { CodecId::Cvsd };
            let _ = events.send(SlcEvent::CodecSelected(codec)).await;
        }
        return Some(at::format_line(&format!("AT+BCS={}", message.value.trim())));
    }
    if message.kind == AtType::Resp && message.command == "CIEV" {
        if let Some((idx, value)) = message.value.split_once(',') {
            if let (Ok(idx), Ok(value)) = (idx.trim().parse(), value.trim().parse()) {
                let _ = events.send(SlcEvent::Indicator { index: idx, value }).await;
            }
        }
        return None;
    }
    if message.kind == AtType::Resp && (message.command == "VGS" || message.command == "VGM") {
        if let Ok(level) = message.value.trim().parse::<u8>() {
            let event = if message.command == "VGS" { SlcEvent::SpeakerVolume(level) } else { SlcEvent::MicrophoneVolume(level) };
            let _ = events.send(event).await;
        }
        return None;
    }
    if message.value == "OK" || message.command.is_empty() {
        *state = match *state {
            SlcState::Disconnected => SlcState::BrsfSetOk,
            SlcState::BrsfSetOk => SlcState::BacSetOk,
            SlcState::BacSetOk => SlcState::CindTestOk,
            SlcState::CindTestOk => SlcState::CindGetOk,
            SlcState::CindGetOk => SlcState::CmerSetOk,
            SlcState::CmerSetOk => {
                let _ = events.send(SlcEvent::Connected).await;
                SlcState::Connected
            }
            other => other,
        };
    }
    None
}

async fn handle_ag_command(message: &AtMessage, state: &mut SlcState, events: &mpsc::Sender<SlcEvent>) -> Option<String> {
    match (message.kind, message.command.as_str()) {
        (AtType::Set, "BRSF") => {
            *state = SlcState::BrsfSetOk;
            Some(format!("{}{}", at::format_line(&format!("+BRSF: {}", features::AG_CODEC_NEGOTIATION)), at::ok_response()))
        }
        (AtType::Set, "BAC") => {
            *state = SlcState::BacSetOk;
            Some(at::ok_response())
        }
        (AtType::Test, "CIND") => {
            *state = SlcState::CindTestOk;
            let fields: Vec<String> = INDICATORS.iter().map(|(name, lo, hi)| format!("(\"{name}\",({lo}-{hi}))")).collect();
            Some(format!("{}{}", at::format_line(&format!("+CIND: {}", fields.join(","))), at::ok_response()))
        }
        (AtType::Get, "CIND") => {
            *state = SlcState::CindGetOk;
            Some(format!("{}{}", at::format_line("+CIND: 1,0,0,0,5,0,5"), at::ok_response()))
        }
        (AtType::Set, "CMER") => {
            *state = SlcState::CmerSetOk;
            let reply = at::ok_response();
            let _ = events.send(SlcEvent::Connected).await;
            *state = SlcState::Connected;
            Some(reply)
        }
        (AtType::Set, "BCS") => {
            if let Ok(id) = message.value.trim().parse::<u8>() {
                let codec = if id == 2 { CodecId::Msbc } else { CodecId::Cvsd };
                let _ = events.send(SlcEvent::CodecSelected(codec)).await;
            }
            Some(at::ok_response())
        }
        (AtType::Set, "VGS") | (AtType::Set, "VGM") => {
            if let Ok(level) = message.value.trim().parse::<u8>() {
                let event = if message.command == "VGS" { SlcEvent::SpeakerVolume(level) } else { SlcEvent::MicrophoneVolume(level) };
                let _ = events.send(event).await;
            }
            Some(at::ok_response())
        }
        (AtType::Test, "XAPL") | (AtType::Set, "XAPL") => Some(format!("{}{}", at::format_line("+XAPL: bluealsa-rs,1"), at::ok_response())),
        (AtType::Set, "IPHONEACCEV") => Some(at::ok_response()),
        _ => Some(at::error_response()),
    }
}

/// Bounded retry window for the initial `AT+BRSF` exchange, per the link-loss quirk: an AG that
/// never answers within this window is treated as gone rather than retried indefinitely.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ag_drives_state_through_full_handshake() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut state = SlcState::Disconnected;

        let brsf = at::parse(b"AT+BRSF=191\r\n").unwrap().0.remove(0);
        assert!(handle_ag_command(&brsf, &mut state, &tx).await.is_some());
        assert_eq!(state, SlcState::BrsfSetOk);

        let bac = at::parse(b"AT+BAC=1,2\r\n").unwrap().0.remove(0);
        handle_ag_command(&bac, &mut state, &tx).await;
        assert_eq!(state, SlcState::BacSetOk);

        let cind_test = at::parse(b"AT+CIND=?\r\n").unwrap().0.remove(0);
        handle_ag_command(&cind_test, &mut state, &tx).await;
        assert_eq!(state, SlcState::CindTestOk);

        let cind_get = at::parse(b"AT+CIND?\r\n").unwrap().0.remove(0);
        handle_ag_command(&cind_get, &mut state, &tx).await;
        assert_eq!(state, SlcState::CindGetOk);

        let cmer = at::parse(b"AT+CMER=3,0,0,1\r\n").unwrap().0.remove(0);
        handle_ag_command(&cmer, &mut state, &tx).await;
        assert_eq!(state, SlcState::Connected);

        assert!(matches!(rx.recv().await, Some(SlcEvent::Connected)));
    }

    #[tokio::test]
    async fn ag_selects_msbc_on_bcs_two() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut state = SlcState::Connected;
        let bcs = at::parse(b"AT+BCS=2\r\n").unwrap().0.remove(0);
        handle_ag_command(&bcs, &mut state, &tx).await;
        assert!(matches!(rx.recv().await, Some(SlcEvent::CodecSelected(CodecId::Msbc))));
    }

    #[tokio::test]
    async fn unknown_command_gets_error_response() {
        let (tx, _rx) = mpsc::channel(16);
        let mut state = SlcState::Connected;
        let msg = at::parse(b"AT+FOOBAR=1\r\n").unwrap().0.remove(0);
        let reply = handle_ag_command(&msg, &mut state, &tx).await;
        assert_eq!(reply, Some(at::error_response()));
    }
}
