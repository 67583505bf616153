//! RTP header framing and the per-direction synchronization state built on top of it.
//!
//! Multi-byte fields are big-endian on the wire, matching RFC 3550. BlueALSA only ever carries
//! one SSRC and zero CSRCs per transport, so the fixed header is always exactly 12 bytes; the
//! per-codec sub-header (one extra byte for generic "fragmented/first/last/frame-count" media,
//! different shapes for MPEG audio and LHDC) is appended by the caller past [HEADER_LEN].

use rand::random;

/// Length, in bytes, of the fixed RTP header (no CSRCs).
pub const HEADER_LEN: usize = 12;

const VERSION: u8 = 2;

/// A parsed (or about-to-be-serialized) RTP fixed header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RtpHeader {
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Writes this header into the first [HEADER_LEN] bytes of `buf`.
    ///
    /// `buf` must be at least [HEADER_LEN] bytes; panics otherwise, matching the framer's
    /// contract that the caller sizes the frame before calling `init`/`write`.
    pub fn write(&self, buf: &mut [u8]) {
        assert!(buf.len() >= HEADER_LEN);
        buf[0] = (VERSION << 6) | ((self.padding as u8) << 5) | ((self.extension as u8) << 4);
        buf[1] = ((self.marker as u8) << 7) | (self.payload_type & 0x7f);
        buf[2..4].copy_from_slice(&self.sequence_number.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
    }

    /// Parses a fixed header from the front of `buf`. Returns `None` if too short or the
    /// version field isn't 2, or if CSRCs are present (never emitted by a Bluetooth peer).
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let version = buf[0] >> 6;
        let csrc_count = buf[0] & 0x0f;
        if version != VERSION || csrc_count != 0 {
            return None;
        }
        Some(Self {
            padding: buf[0] & 0x20 != 0,
            extension: buf[0] & 0x10 != 0,
            marker: buf[1] & 0x80 != 0,
            payload_type: buf[1] & 0x7f,
            sequence_number: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }
}

/// Rounds `a * b / c` up to the nearest integer, for positive integer ratios. Used to convert
/// a PCM frame count into an RTP clock-rate timestamp delta without losing fractional frames.
fn round_up_div(a: u64, b: u64, c: u64) -> u64 {
    (a * b + c - 1) / c
}

/// Outcome of feeding a freshly received RTP packet to a receiving [RtpState].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RtpGap {
    /// RTP packets that appear to be missing relative to the last packet seen.
    pub missing_rtp_frames: u32,
    /// PCM frames implied missing by the timestamp gap, at the state's sample rate.
    pub missing_pcm_frames: u32,
}

/// Per-direction RTP sequencing and timestamp state for one transport.
///
/// One side encodes (`next_header`) and the other decodes (`receive`); a transport never does
/// both on the same [RtpState] since A2DP media is unidirectional per codec instance.
#[derive(Clone, Debug)]
pub struct RtpState {
    synced: bool,
    sequence_number: u16,
    pcm_frames: u64,
    sample_rate: u32,
    clock_rate: u32,
    timestamp_offset: u32,
    ssrc: u32,
    payload_type: u8,
}

impl RtpState {
    /// Creates a new state with a randomized initial sequence number and timestamp offset, as
    /// required by RFC 3550 to make stream restarts unambiguous to the peer.
    pub fn new(sample_rate: u32, clock_rate: u32, payload_type: u8) -> Self {
        Self {
            synced: false,
            sequence_number: random(),
            pcm_frames: 0,
            sample_rate,
            clock_rate,
            timestamp_offset: random(),
            ssrc: random(),
            payload_type,
        }
    }

    /// Builds the header for the next outgoing frame carrying `pcm_frames` PCM frames, advancing
    /// the sequence number and recomputing the timestamp from the cumulative frame count.
    pub fn next_header(&mut self, pcm_frames: u32, marker: bool) -> RtpHeader {
        let header = RtpHeader {
            padding: false,
            extension: false,
            marker,
            payload_type: self.payload_type,
            sequence_number: self.sequence_number,
            timestamp: self
                .timestamp_offset
                .wrapping_add(round_up_div(self.pcm_frames, self.clock_rate as u64, self.sample_rate as u64) as u32),
            ssrc: self.ssrc,
        };
        self.sequence_number = self.sequence_number.wrapping_add(1);
        self.pcm_frames += pcm_frames as u64;
        header
    }

    /// Feeds a received header into the state. The first call only establishes the
    /// synchronization anchor and reports no gap; subsequent calls report the sequence and
    /// PCM-frame gaps relative to the previous packet.
    pub fn receive(&mut self, header: &RtpHeader) -> RtpGap {
        if !self.synced {
            self.synced = true;
            self.sequence_number = header.sequence_number;
            self.timestamp_offset = header.timestamp;
            self.pcm_frames = 0;
            return RtpGap::default();
        }

        let expected_seq = self.sequence_number.wrapping_add(1);
        let missing_rtp_frames = header.sequence_number.wrapping_sub(expected_seq) as u32;

        let expected_ts = self
            .timestamp_offset
            .wrapping_add(round_up_div(self.pcm_frames, self.clock_rate as u64, self.sample_rate as u64) as u32);
        let ts_gap = header.timestamp.wrapping_sub(expected_ts);
        let missing_pcm_frames =
            round_up_div(ts_gap as u64, self.sample_rate as u64, self.clock_rate as u64) as u32;

        self.sequence_number = header.sequence_number;
        self.pcm_frames += missing_pcm_frames as u64;

        RtpGap { missing_rtp_frames, missing_pcm_frames }
    }

    /// Whether a receiving state has observed its first packet yet.
    pub fn is_synced(&self) -> bool {
        self.synced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_wire_bytes() {
        let header = RtpHeader {
            padding: false,
            extension: false,
            marker: true,
            payload_type: 96,
            sequence_number: 0x1234,
            timestamp: 0xdead_beef,
            ssrc: 0x1357_9bdf,
        };
        let mut buf = [0u8; HEADER_LEN];
        header.write(&mut buf);
        assert_eq!(RtpHeader::parse(&buf), Some(header));
    }

    #[test]
    fn rejects_short_or_wrong_version_buffers() {
        assert_eq!(RtpHeader::parse(&[0u8; 4]), None);
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = 0b0100_0000;
        assert_eq!(RtpHeader::parse(&buf), None);
    }

    #[test]
    fn sending_state_increments_sequence_each_frame() {
        let mut state = RtpState::new(48000, 48000, 96);
        let first = state.next_header(128, false);
        let second = state.next_header(128, false);
        assert_eq!(second.sequence_number, first.sequence_number.wrapping_add(1));
        assert_eq!(second.timestamp, first.timestamp + 128);
    }

    #[test]
    fn receiving_state_reports_no_gap_on_first_packet() {
        let mut sender = RtpState::new(48000, 48000, 96);
        let mut receiver = RtpState::new(48000, 48000, 96);
        let header = sender.next_header(128, false);
        let gap = receiver.receive(&header);
        assert_eq!(gap, RtpGap::default());
    }

    #[test]
    fn receiving_state_reports_dropped_packet_gap() {
        let mut sender = RtpState::new(48000, 48000, 96);
        let mut receiver = RtpState::new(48000, 48000, 96);
        let first = sender.next_header(128, false);
        receiver.receive(&first);
        let _dropped = sender.next_header(128, false);
        let third = sender.next_header(128, false);
        let gap = receiver.receive(&third);
        assert_eq!(gap.missing_rtp_frames, 1);
        assert_eq!(gap.missing_pcm_frames, 128);
    }

    #[test]
    fn clock_rate_conversion_rounds_up() {
        // 16kHz sample rate over a 48kHz-clocked codec (SBC-like clockrate independence).
        let mut state = RtpState::new(16000, 48000, 96);
        let offset = state.timestamp_offset;
        let first = state.next_header(1, false);
        assert_eq!(first.timestamp, offset);
        let second = state.next_header(1, false);
        // 1 pcm frame * 48000 / 16000 == 3, already exact.
        assert_eq!(second.timestamp, offset + 3);
    }
}
