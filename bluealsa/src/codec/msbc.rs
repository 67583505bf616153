//! mSBC, the wideband HFP codec negotiated over eSCO, via `libsbc`'s fixed mSBC mode.
//!
//! mSBC has no negotiable parameters: mono, 16kHz, 15 blocks, 8 subbands, bitpool 26, Loudness
//! allocation. `libsbc` exposes this as `sbc_init_msbc`, which this module wraps with the same
//! [Codec] boundary as plain SBC.

use std::mem::MaybeUninit;
use std::os::raw::c_void;

use super::{codec_error, sbc::SbcParams, Codec};
use crate::Result;

// Re-declared rather than made `pub(super)` in `sbc.rs`: mSBC deliberately never touches SBC's
// parameter struct, only its raw `sbc_t` handle and the three FFI entry points it needs.
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

extern "C" {
    fn sbc_init_msbc(sbc: *mut sbc_t, flags: u32) -> i32;
    fn sbc_finish(sbc: *mut sbc_t);
    fn sbc_encode(
        sbc: *mut sbc_t, input: *const c_void, input_len: usize, output: *mut c_void, output_len: usize,
        written: *mut isize,
    ) -> isize;
    fn sbc_decode(
        sbc: *mut sbc_t, input: *const c_void, input_len: usize, output: *mut c_void, output_len: usize,
        written: *mut usize,
    ) -> isize;
}

/// mSBC's fixed PCM block size: 120 frames per channel (mono).
pub const BLOCK_FRAMES: usize = 120;
/// mSBC's fixed encoded frame size in bytes (excluding the H2 sync header the transport prepends).
pub const FRAME_LEN: usize = 57;

/// Parameters fixed by the mSBC specification, exposed for documentation/assertions only;
/// [Msbc::new] never takes a [SbcParams] because nothing about it is negotiable.
pub const PARAMS: SbcParams =
    SbcParams { frequency: 0, mode: 0, allocation: 0, blocks: 15, subbands: 8, bitpool: 26 };

pub struct Msbc {
    handle: Box<sbc_t>,
}

// SAFETY: the codec exclusively owns its native handle; the library has no thread-affinity
// requirement and all access is already serialized through `&mut self`.
unsafe impl Send for Msbc {}

impl Msbc {
    pub fn new() -> Result<Self> {
        let mut uninit: Box<MaybeUninit<sbc_t>> = Box::new(MaybeUninit::uninit());
        let ret = unsafe { sbc_init_msbc(uninit.as_mut_ptr(), 0) };
        if ret != 0 {
            return Err(codec_error(format!("sbc_init_msbc failed: {ret}")));
        }
        let handle = unsafe { std::mem::transmute::<Box<MaybeUninit<sbc_t>>, Box<sbc_t>>(uninit) };
        Ok(Self { handle })
    }
}

impl Drop for Msbc {
    fn drop(&mut self) {
        unsafe { sbc_finish(self.handle.as_mut() as *mut sbc_t) };
    }
}

impl Codec for Msbc {
    fn block_frames(&self) -> usize {
        BLOCK_FRAMES
    }

    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize> {
        let mut written: isize = 0;
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
            return Err(codec_error(format!("mSBC encode failed: {ret}")));
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
            return Err(codec_error(format!("mSBC decode failed: {ret}")));
        }
        Ok(written / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_parameters_match_the_specification() {
        assert_eq!(PARAMS.blocks, 15);
        assert_eq!(PARAMS.subbands, 8);
        assert_eq!(PARAMS.bitpool, 26);
    }
}
