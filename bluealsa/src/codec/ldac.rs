//! Sony LDAC, via Sony's reference `libldac` ABC/ABR encoder.

use std::os::raw::{c_int, c_void};

use super::{codec_error, Codec};
use crate::Result;

extern "C" {
    fn ldacBT_get_handle() -> *mut c_void;
    fn ldacBT_free_handle(handle: *mut c_void);
    fn ldacBT_init_handle_encode(
        handle: *mut c_void, mtu: c_int, eqmid: c_int, channel_config: c_int, format: c_int, sample_rate: c_int,
    ) -> c_int;
    fn ldacBT_encode(
        handle: *mut c_void, pcm: *const c_void, pcm_used: *mut c_int, frame: *mut u8, frame_used: *mut c_int,
        written_bytes: *mut i32,
    ) -> c_int;
}

/// LDAC's three quality modes, selected by MTU-sized encode quanta.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Quality {
    High,
    Mid,
    Low,
    /// Adaptive Bit-Rate: the encoder itself downgrades quality under link congestion.
    Abr,
}

impl Quality {
    fn eqmid(self) -> c_int {
        match self {
            Quality::High => 0,
            Quality::Mid => 1,
            Quality::Low => 2,
            Quality::Abr => 3,
        }
    }
}

pub const BLOCK_FRAMES: usize = 128;

pub struct Ldac {
    handle: *mut c_void,
}

unsafe impl Send for Ldac {}

impl Ldac {
    pub fn new(mtu: i32, quality: Quality, channels: u32, sample_rate: u32) -> Result<Self> {
        let handle = unsafe { ldacBT_get_handle() };
        if handle.is_null() {
            return Err(codec_error("ldacBT_get_handle failed"));
        }
        let channel_config = if channels == 1 { 2 } else { 0 }; // MONO=2, STEREO=0 per libldac ABI
        let ret = unsafe {
            ldacBT_init_handle_encode(handle, mtu, quality.eqmid(), channel_config, 0, sample_rate as c_int)
        };
        if ret != 0 {
            unsafe { ldacBT_free_handle(handle) };
            return Err(codec_error(format!("ldacBT_init_handle_encode failed: {ret}")));
        }
        Ok(Self { handle })
    }
}

impl Drop for Ldac {
    fn drop(&mut self) {
        unsafe { ldacBT_free_handle(self.handle) };
    }
}

impl Codec for Ldac {
    fn block_frames(&self) -> usize {
        BLOCK_FRAMES
    }

    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize> {
        let mut pcm_used: c_int = (pcm.len() * 2) as c_int;
        let mut frame_used: c_int = 0;
        let mut written: i32 = 0;
        let ret = unsafe {
            ldacBT_encode(
                self.handle,
                pcm.as_ptr() as *const c_void,
                &mut pcm_used,
                out.as_mut_ptr(),
                &mut frame_used,
                &mut written,
            )
        };
        if ret != 0 {
            return Err(codec_error(format!("ldacBT_encode failed: {ret}")));
        }
        Ok(frame_used as usize)
    }

    fn decode(&mut self, _frame: &[u8], _pcm: &mut [i16]) -> Result<usize> {
        // LDAC is a Source-only (encode) codec for BlueALSA's Sink role: no decoder is shipped
        // upstream, matching Sony's reference implementation which is encode-only.
        Err(codec_error("LDAC decode is not supported"))
    }
}
