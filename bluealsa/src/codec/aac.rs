//! MPEG-2/4 AAC, via the Fraunhofer FDK AAC library.

use std::os::raw::{c_int, c_void};

use super::{codec_error, Codec};
use crate::Result;

#[allow(non_camel_case_types)]
type HANDLE_AACENCODER = *mut c_void;
#[allow(non_camel_case_types)]
type HANDLE_AACDECODER = *mut c_void;

extern "C" {
    fn aacEncOpen(handle: *mut HANDLE_AACENCODER, encModules: u32, maxChannels: u32) -> c_int;
    fn aacEncClose(handle: *mut HANDLE_AACENCODER) -> c_int;
    fn aacEncEncode(
        handle: HANDLE_AACENCODER, in_buf: *const c_void, in_len: c_int, out_buf: *mut c_void, out_len: c_int,
        out_written: *mut c_int,
    ) -> c_int;

    fn aacDecoder_Open(transport_fmt: c_int, num_layers: u32) -> HANDLE_AACDECODER;
    fn aacDecoder_Close(handle: HANDLE_AACDECODER);
    fn aacDecoder_DecodeFrame(
        handle: HANDLE_AACDECODER, pcm: *mut i16, pcm_size: c_int, flags: u32, in_buf: *const u8, in_len: c_int,
    ) -> c_int;
}

const TT_MP4_LATM_MCP1: c_int = 6;

/// Block size AAC operates on at the negotiated transform length (1024 samples/channel, the
/// only transform size A2DP's MPEG-4 AAC object type negotiates).
pub const BLOCK_FRAMES: usize = 1024;

pub struct AacEncoder {
    handle: HANDLE_AACENCODER,
}

// SAFETY: the encoder exclusively owns its native handle; the library has no thread-affinity
// requirement and all access is already serialized through `&mut self`.
unsafe impl Send for AacEncoder {}

impl AacEncoder {
    pub fn new(channels: u32) -> Result<Self> {
        let mut handle: HANDLE_AACENCODER = std::ptr::null_mut();
        let ret = unsafe { aacEncOpen(&mut handle, 0, channels) };
        if ret != 0 {
            return Err(codec_error(format!("aacEncOpen failed: {ret}")));
        }
        Ok(Self { handle })
    }
}

impl Drop for AacEncoder {
    fn drop(&mut self) {
        unsafe { aacEncClose(&mut self.handle) };
    }
}

impl Codec for AacEncoder {
    fn block_frames(&self) -> usize {
        BLOCK_FRAMES
    }

    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize> {
        let mut written: c_int = 0;
        let ret = unsafe {
            aacEncEncode(
                self.handle,
                pcm.as_ptr() as *const c_void,
                (pcm.len() * 2) as c_int,
                out.as_mut_ptr() as *mut c_void,
                out.len() as c_int,
                &mut written,
            )
        };
        if ret != 0 {
            return Err(codec_error(format!("aacEncEncode failed: {ret}")));
        }
        Ok(written as usize)
    }

    fn decode(&mut self, _frame: &[u8], _pcm: &mut [i16]) -> Result<usize> {
        Err(codec_error("AacEncoder does not decode; use AacDecoder"))
    }
}

pub struct AacDecoder {
    handle: HANDLE_AACDECODER,
}

// SAFETY: the decoder exclusively owns its native handle; the library has no thread-affinity
// requirement and all access is already serialized through `&mut self`.
unsafe impl Send for AacDecoder {}

impl AacDecoder {
    pub fn new() -> Result<Self> {
        let handle = unsafe { aacDecoder_Open(TT_MP4_LATM_MCP1, 1) };
        if handle.is_null() {
            return Err(codec_error("aacDecoder_Open failed"));
        }
        Ok(Self { handle })
    }
}

impl Drop for AacDecoder {
    fn drop(&mut self) {
        unsafe { aacDecoder_Close(self.handle) };
    }
}

impl Codec for AacDecoder {
    fn block_frames(&self) -> usize {
        BLOCK_FRAMES
    }

    fn encode(&mut self, _pcm: &[i16], _out: &mut [u8]) -> Result<usize> {
        Err(codec_error("AacDecoder does not encode; use AacEncoder"))
    }

    fn decode(&mut self, frame: &[u8], pcm: &mut [i16]) -> Result<usize> {
        let ret = unsafe {
            aacDecoder_DecodeFrame(self.handle, pcm.as_mut_ptr(), pcm.len() as c_int, 0, frame.as_ptr(), frame.len() as c_int)
        };
        if ret != 0 {
            return Err(codec_error(format!("aacDecoder_DecodeFrame failed: {ret}")));
        }
        Ok(BLOCK_FRAMES)
    }
}
