//! Codec identifiers, negotiation preference tables and the [Codec] encode/decode boundary.
//!
//! Each concrete codec (SBC, mSBC, CVSD, AAC, aptX, LDAC, LC3plus) is a thin safe wrapper
//! around an external native library, following the FFI-boundary idiom the teacher uses for
//! its own native structs in `sys.rs`: `#[repr(C)]` parameter structs and `extern "C"`
//! declarations, with ownership and error translation handled on the Rust side.

pub mod aac;
pub mod aptx;
pub mod cvsd;
pub mod lc3plus;
pub mod ldac;
pub mod msbc;
pub mod sbc;

use num_derive::FromPrimitive;
use strum::Display;

use crate::{Error, ErrorKind, Result};

/// A2DP/HFP codec identifier.
#[derive(Clone, Copy, Debug, Display, Eq, FromPrimitive, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u16)]
pub enum CodecId {
    /// CVSD, the mandatory HSP/HFP codec, 8kHz narrowband.
    Cvsd,
    /// mSBC, the wideband HFP codec negotiated over eSCO.
    Msbc,
    /// SBC, the mandatory A2DP codec.
    Sbc,
    /// MPEG-2/4 AAC.
    Aac,
    /// Qualcomm aptX.
    Aptx,
    /// Qualcomm aptX HD.
    AptxHd,
    /// Sony LDAC.
    Ldac,
    /// LC3plus.
    Lc3plus,
}

impl CodecId {
    /// RTP clock rate in Hz used by the RTP framer for this codec, independent of the PCM
    /// sample rate actually negotiated (SBC/AAC/aptX/LDAC/LC3plus all clock at 90kHz per
    /// RFC, while the narrowband telephony codecs use the PCM rate directly).
    pub fn rtp_clock_rate(&self, pcm_sample_rate: u32) -> u32 {
        match self {
            CodecId::Cvsd | CodecId::Msbc => pcm_sample_rate,
            _ => 90_000,
        }
    }

    /// Dynamic RTP payload type this codec is carried under (always 96 for BlueALSA; SCO
    /// transports do not use RTP framing at all and never call this).
    pub fn rtp_payload_type(&self) -> u8 {
        96
    }
}

/// Result of a completed (non-pending) codec negotiation: the chosen codec and its
/// vendor-specific configuration blob, ready to hand to BlueZ's `SetConfiguration`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CodecConfiguration {
    pub codec: CodecId,
    pub blob: Vec<u8>,
}

/// A channel mode candidate considered during A2DP negotiation preference resolution.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum ChannelModePreference {
    Mono,
    DualChannel,
    Stereo,
    JointStereo,
}

/// Picks the best entry from `available` according to a caller-supplied preference order,
/// where "best" is the entry with the highest [Ord] rank among those also present in `mask`.
///
/// This is the shared shape behind every per-codec negotiation table in §4.3: intersect the
/// peer's bitmask with the local capability mask, then pick by a fixed preference order.
pub fn pick_best<T: Ord + Copy>(available: &[T], mask: &[T]) -> Option<T> {
    available.iter().copied().filter(|v| mask.contains(v)).max()
}

/// Picks the highest sample rate present in both `peer` and `local`, preferring, in order,
/// 48000 > 44100 > 32000 > 16000 Hz (the order A2DP negotiation and §4.3 both specify).
pub fn pick_best_sample_rate(peer: &[u32], local: &[u32]) -> Option<u32> {
    const PREFERENCE: [u32; 4] = [48_000, 44_100, 32_000, 16_000];
    PREFERENCE.into_iter().find(|rate| peer.contains(rate) && local.contains(rate))
}

/// Clamps a bitpool request to the intersection of the peer's advertised range and a local
/// default ceiling, per §4.3 ("bitpool is clamped to the intersection with a local default
/// function").
pub fn clamp_bitpool(requested: u8, peer_min: u8, peer_max: u8, local_default_max: u8) -> u8 {
    requested.clamp(peer_min, peer_max.min(local_default_max))
}

/// Encodes one block of PCM samples into one or more codec frames, or decodes a received
/// codec frame into PCM samples.
///
/// Implementations wrap an external native codec library; `encode`/`decode` are the only
/// points where that library's buffers are touched, so everything above this trait works in
/// terms of plain `&[i16]` PCM.
pub trait Codec: Send {
    /// Number of PCM frames (per channel) consumed by one call to [Codec::encode].
    fn block_frames(&self) -> usize;

    /// Encodes exactly [Codec::block_frames] PCM frames (`pcm.len() == block_frames() *
    /// channels`) into `out`, returning the number of bytes written.
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize>;

    /// Decodes one received codec frame into `pcm`, returning the number of PCM frames (per
    /// channel) written.
    fn decode(&mut self, frame: &[u8], pcm: &mut [i16]) -> Result<usize>;
}

pub(crate) fn codec_error(message: impl Into<String>) -> Error {
    Error::with_message(ErrorKind::NotSupported, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_joint_stereo_over_other_modes() {
        use ChannelModePreference::*;
        let peer_mask = [Mono, Stereo, JointStereo];
        let local_mask = [Mono, DualChannel, Stereo, JointStereo];
        assert_eq!(pick_best(&peer_mask, &local_mask), Some(JointStereo));
    }

    #[test]
    fn falls_back_when_preferred_mode_unavailable() {
        use ChannelModePreference::*;
        let peer_mask = [Mono, DualChannel];
        let local_mask = [Mono, DualChannel, Stereo, JointStereo];
        assert_eq!(pick_best(&peer_mask, &local_mask), Some(DualChannel));
    }

    #[test]
    fn sample_rate_prefers_48khz() {
        assert_eq!(pick_best_sample_rate(&[44_100, 48_000], &[16_000, 44_100, 48_000]), Some(48_000));
    }

    #[test]
    fn sample_rate_falls_back_to_highest_common() {
        assert_eq!(pick_best_sample_rate(&[16_000, 32_000], &[32_000, 44_100, 48_000]), Some(32_000));
    }

    #[test]
    fn bitpool_clamped_to_intersection() {
        assert_eq!(clamp_bitpool(70, 2, 53, 35), 35);
        assert_eq!(clamp_bitpool(10, 2, 53, 35), 10);
        assert_eq!(clamp_bitpool(1, 2, 53, 35), 2);
    }
}
