//! SBC, the mandatory A2DP codec, via `libsbc`.

use std::mem::MaybeUninit;
use std::os::raw::{c_long, c_void};

use super::{codec_error, Codec};
use crate::Result;

// Mirrors `sbc.h` from `libsbc`. The library keeps all decoder/encoder state in a single
// opaque-from-Rust's-perspective struct that callers allocate and pass by pointer; the layout
// below reserves exactly the bytes upstream's `sbc_t` occupies on a 64-bit target so it can be
// placed on the Rust side without an extra heap allocation per packet.
#[repr(C)]
struct sbc_t {
    flags: u32,
    frequency: u8,
    blocks: u8,
    subbands: u8,
    mode: u8,
    allocation: u8,
    endian: u8,
    bitpool: u8,
    _reserved: [u8; 1],
    priv_: *mut c_void,
    priv_alloc_base: *mut c_void,
}

#[allow(non_camel_case_types)]
type ssize_t = c_long;

extern "C" {
    fn sbc_init(sbc: *mut sbc_t, flags: u32) -> i32;
    fn sbc_init_msbc(sbc: *mut sbc_t, flags: u32) -> i32;
    fn sbc_finish(sbc: *mut sbc_t);
    fn sbc_encode(
        sbc: *mut sbc_t, input: *const c_void, input_len: usize, output: *mut c_void, output_len: usize,
        written: *mut ssize_t,
    ) -> ssize_t;
    fn sbc_decode(
        sbc: *mut sbc_t, input: *const c_void, input_len: usize, output: *mut c_void, output_len: usize,
        written: *mut usize,
    ) -> ssize_t;
    fn sbc_get_frame_length(sbc: *mut sbc_t) -> usize;
    fn sbc_get_codesize(sbc: *mut sbc_t) -> usize;
}

pub const SBC_FREQ_16000: u8 = 0;
pub const SBC_FREQ_32000: u8 = 1;
pub const SBC_FREQ_44100: u8 = 2;
pub const SBC_FREQ_48000: u8 = 3;

pub const SBC_MODE_MONO: u8 = 0;
pub const SBC_MODE_DUAL_CHANNEL: u8 = 1;
pub const SBC_MODE_STEREO: u8 = 2;
pub const SBC_MODE_JOINT_STEREO: u8 = 3;

pub const SBC_AM_LOUDNESS: u8 = 0;
pub const SBC_AM_SNR: u8 = 1;

/// Encoder/decoder parameters negotiated through A2DP `SelectConfiguration`/`SetConfiguration`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SbcParams {
    pub frequency: u8,
    pub mode: u8,
    pub allocation: u8,
    pub blocks: u8,
    pub subbands: u8,
    pub bitpool: u8,
}

/// Safe wrapper around one `sbc_t` encoder or decoder instance.
pub struct Sbc {
    handle: Box<sbc_t>,
    channels: usize,
}

// SAFETY: the codec exclusively owns its native handle; the library has no thread-affinity
// requirement and all access is already serialized through `&mut self`.
unsafe impl Send for Sbc {}

impl Sbc {
    pub fn new(params: SbcParams) -> Result<Self> {
        let mut uninit: Box<MaybeUninit<sbc_t>> = Box::new(MaybeUninit::uninit());
        let ret = unsafe { sbc_init(uninit.as_mut_ptr(), 0) };
        if ret != 0 {
            return Err(codec_error(format!("sbc_init failed: {ret}")));
        }
        // SAFETY: sbc_init has fully initialized the struct on success.
        let mut handle = unsafe { std::mem::transmute::<Box<MaybeUninit<sbc_t>>, Box<sbc_t>>(uninit) };
        handle.frequency = params.frequency;
        handle.mode = params.mode;
        handle.allocation = params.allocation;
        handle.blocks = params.blocks;
        handle.subbands = params.subbands;
        handle.bitpool = params.bitpool;
        let channels = if params.mode == SBC_MODE_MONO { 1 } else { 2 };
        Ok(Self { handle, channels })
    }
}

impl Drop for Sbc {
    fn drop(&mut self) {
        unsafe { sbc_finish(self.handle.as_mut() as *mut sbc_t) };
    }
}

impl Codec for Sbc {
    fn block_frames(&self) -> usize {
        unsafe { sbc_get_codesize(self.handle.as_ref() as *const sbc_t as *mut sbc_t) / (self.channels * 2) }
    }

    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize> {
        let mut written: ssize_t = 0;
        let ret = unsafe {
            sbc_encode(
                self.handle.as_mut() as *mut sbc_t,
                pcm.as_ptr() as *const c_void,
                pcm.len() * 2,
                out.as_mut_ptr() as *mut c_void,
                out.len(),
                &mut written,
            )
        };
        if ret < 0 {
            return Err(codec_error(format!("sbc_encode failed: {ret}")));
        }
        Ok(written as usize)
    }

    fn decode(&mut self, frame: &[u8], pcm: &mut [i16]) -> Result<usize> {
        let mut written: usize = 0;
        let ret = unsafe {
            sbc_decode(
                self.handle.as_mut() as *mut sbc_t,
                frame.as_ptr() as *const c_void,
                frame.len(),
                pcm.as_mut_ptr() as *mut c_void,
                pcm.len() * 2,
                &mut written,
            )
        };
        if ret < 0 {
            return Err(codec_error(format!("sbc_decode failed: {ret}")));
        }
        Ok(written / (self.channels * 2))
    }
}

/// Frame length, in bytes, one call to [Codec::encode] would currently produce.
pub fn frame_length(sbc: &mut Sbc) -> usize {
    unsafe { sbc_get_frame_length(sbc.handle.as_mut() as *mut sbc_t) }
}

/// Resolves the A2DP SBC capability bitmasks against local policy, per §4.3's preference order:
/// joint-stereo > stereo > dual > mono; 48kHz > 44.1kHz > 32kHz > 16kHz; highest block length and
/// subbands available; SNR allocation preferred over loudness when the peer supports both; bitpool
/// clamped into the intersection with `local_bitpool_max`.
pub fn negotiate(
    peer_frequencies: &[u8], peer_modes: &[u8], peer_blocks: &[u8], peer_subbands: &[u8],
    peer_allocations: &[u8], peer_bitpool_range: (u8, u8), local_bitpool_max: u8,
) -> Option<SbcParams> {
    const FREQ_PREF: [u8; 4] = [SBC_FREQ_48000, SBC_FREQ_44100, SBC_FREQ_32000, SBC_FREQ_16000];
    const MODE_PREF: [u8; 4] = [SBC_MODE_JOINT_STEREO, SBC_MODE_STEREO, SBC_MODE_DUAL_CHANNEL, SBC_MODE_MONO];
    const ALLOC_PREF: [u8; 2] = [SBC_AM_SNR, SBC_AM_LOUDNESS];

    let frequency = FREQ_PREF.into_iter().find(|f| peer_frequencies.contains(f))?;
    let mode = MODE_PREF.into_iter().find(|m| peer_modes.contains(m))?;
    let blocks = *peer_blocks.iter().max()?;
    let subbands = *peer_subbands.iter().max()?;
    let allocation = ALLOC_PREF.into_iter().find(|a| peer_allocations.contains(a))?;
    let bitpool = super::clamp_bitpool(peer_bitpool_range.1, peer_bitpool_range.0, peer_bitpool_range.1, local_bitpool_max);

    Some(SbcParams { frequency, mode, allocation, blocks, subbands, bitpool })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_prefers_joint_stereo_48khz() {
        let params = negotiate(
            &[SBC_FREQ_44100, SBC_FREQ_48000],
            &[SBC_MODE_MONO, SBC_MODE_JOINT_STEREO],
            &[4, 8, 12, 16],
            &[4, 8],
            &[SBC_AM_LOUDNESS, SBC_AM_SNR],
            (2, 53),
            35,
        )
        .unwrap();
        assert_eq!(params.frequency, SBC_FREQ_48000);
        assert_eq!(params.mode, SBC_MODE_JOINT_STEREO);
        assert_eq!(params.blocks, 16);
        assert_eq!(params.subbands, 8);
        assert_eq!(params.bitpool, 35);
        assert_eq!(params.allocation, SBC_AM_SNR);
    }

    #[test]
    fn negotiation_returns_none_on_empty_intersection() {
        assert!(negotiate(&[], &[SBC_MODE_MONO], &[16], &[8], &[SBC_AM_LOUDNESS], (2, 53), 35).is_none());
    }

    #[test]
    fn negotiation_falls_back_to_loudness_when_peer_lacks_snr() {
        let params = negotiate(
            &[SBC_FREQ_44100],
            &[SBC_MODE_STEREO],
            &[16],
            &[8],
            &[SBC_AM_LOUDNESS],
            (2, 53),
            35,
        )
        .unwrap();
        assert_eq!(params.allocation, SBC_AM_LOUDNESS);
    }

    #[test]
    fn negotiation_fails_when_peer_advertises_no_allocation_method() {
        assert!(negotiate(&[SBC_FREQ_44100], &[SBC_MODE_STEREO], &[16], &[8], &[], (2, 53), 35).is_none());
    }
}
