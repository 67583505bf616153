//! Qualcomm aptX and aptX HD, via `libopenaptx`.

use std::os::raw::{c_int, c_void};

use super::{codec_error, Codec};
use crate::Result;

extern "C" {
    fn aptx_init(hd: c_int) -> *mut c_void;
    fn aptx_finish(ctx: *mut c_void);
    fn aptx_encode(ctx: *mut c_void, pcm_l: *const i32, pcm_r: *const i32, buffer: *mut u8, written: *mut usize) -> usize;
    fn aptx_decode(ctx: *mut c_void, input: *const u8, pcm_l: *mut i32, pcm_r: *mut i32) -> usize;
}

/// aptX processes 4 stereo PCM frames per encoded quantum.
pub const BLOCK_FRAMES: usize = 4;

pub struct Aptx {
    ctx: *mut c_void,
    hd: bool,
}

unsafe impl Send for Aptx {}

impl Aptx {
    pub fn new(hd: bool) -> Result<Self> {
        let ctx = unsafe { aptx_init(hd as c_int) };
        if ctx.is_null() {
            return Err(codec_error("aptx_init failed"));
        }
        Ok(Self { ctx, hd })
    }
}

impl Drop for Aptx {
    fn drop(&mut self) {
        unsafe { aptx_finish(self.ctx) };
    }
}

impl Codec for Aptx {
    fn block_frames(&self) -> usize {
        BLOCK_FRAMES
    }

    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize> {
        let left: Vec<i32> = pcm.iter().step_by(2).map(|&s| s as i32).collect();
        let right: Vec<i32> = pcm.iter().skip(1).step_by(2).map(|&s| s as i32).collect();
        let mut written = 0usize;
        let consumed = unsafe { aptx_encode(self.ctx, left.as_ptr(), right.as_ptr(), out.as_mut_ptr(), &mut written) };
        if consumed != left.len() {
            return Err(codec_error("aptx_encode consumed fewer samples than given"));
        }
        Ok(written)
    }

    fn decode(&mut self, frame: &[u8], pcm: &mut [i16]) -> Result<usize> {
        let frame_bytes = if self.hd { 6 } else { 4 };
        let mut n = 0;
        for chunk in frame.chunks(frame_bytes) {
            if chunk.len() < frame_bytes {
                break;
            }
            let mut l = 0i32;
            let mut r = 0i32;
            let consumed = unsafe { aptx_decode(self.ctx, chunk.as_ptr(), &mut l, &mut r) };
            if consumed == 0 {
                return Err(codec_error("aptx_decode failed to consume frame"));
            }
            if n + 2 > pcm.len() {
                break;
            }
            pcm[n] = l as i16;
            pcm[n + 1] = r as i16;
            n += 2;
        }
        Ok(n / 2)
    }
}
