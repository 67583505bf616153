//! LC3plus, via the Fraunhofer reference encoder/decoder library.

use std::os::raw::{c_int, c_void};

use super::{codec_error, Codec};
use crate::Result;

extern "C" {
    fn lc3plus_enc_get_size(sample_rate: i32, channels: i32) -> c_int;
    fn lc3plus_enc_init(enc: *mut c_void, sample_rate: i32, channels: i32) -> c_int;
    fn lc3plus_enc24(
        enc: *mut c_void, input: *const *const c_void, output: *mut u8, num_bytes: *mut i32,
        scratch: *mut c_void,
    ) -> c_int;

    fn lc3plus_dec_get_size(sample_rate: i32, channels: i32) -> c_int;
    fn lc3plus_dec_init(dec: *mut c_void, sample_rate: i32, channels: i32, plc_mode: c_int) -> c_int;
    fn lc3plus_dec24(
        dec: *mut c_void, input: *const u8, num_bytes: i32, output: *mut *mut c_void, scratch: *mut c_void,
        bfi_ext: c_int,
    ) -> c_int;
}

/// LC3plus frame duration in PCM frames at its three negotiable frame durations are all
/// expressed relative to sample rate; BlueALSA only offers the 10ms frame duration.
pub fn block_frames(sample_rate: u32) -> usize {
    (sample_rate / 100) as usize
}

pub struct Lc3PlusEncoder {
    state: Vec<u8>,
    channels: i32,
    sample_rate: i32,
}

impl Lc3PlusEncoder {
    pub fn new(sample_rate: u32, channels: u32) -> Result<Self> {
        let size = unsafe { lc3plus_enc_get_size(sample_rate as c_int, channels as c_int) };
        if size <= 0 {
            return Err(codec_error("lc3plus_enc_get_size returned an invalid size"));
        }
        let mut state = vec![0u8; size as usize];
        let ret = unsafe { lc3plus_enc_init(state.as_mut_ptr() as *mut c_void, sample_rate as c_int, channels as c_int) };
        if ret != 0 {
            return Err(codec_error(format!("lc3plus_enc_init failed: {ret}")));
        }
        Ok(Self { state, channels: channels as c_int, sample_rate: sample_rate as c_int })
    }
}

impl Codec for Lc3PlusEncoder {
    fn block_frames(&self) -> usize {
        block_frames(self.sample_rate as u32)
    }

    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize> {
        let input_ptr = pcm.as_ptr() as *const c_void;
        let inputs = [input_ptr];
        let mut num_bytes: i32 = 0;
        let ret = unsafe {
            lc3plus_enc24(
                self.state.as_mut_ptr() as *mut c_void,
                inputs.as_ptr(),
                out.as_mut_ptr(),
                &mut num_bytes,
                std::ptr::null_mut(),
            )
        };
        let _ = self.channels;
        if ret != 0 {
            return Err(codec_error(format!("lc3plus_enc24 failed: {ret}")));
        }
        Ok(num_bytes as usize)
    }

    fn decode(&mut self, _frame: &[u8], _pcm: &mut [i16]) -> Result<usize> {
        Err(codec_error("Lc3PlusEncoder does not decode; use Lc3PlusDecoder"))
    }
}

pub struct Lc3PlusDecoder {
    state: Vec<u8>,
    sample_rate: i32,
}

impl Lc3PlusDecoder {
    pub fn new(sample_rate: u32, channels: u32) -> Result<Self> {
        let size = unsafe { lc3plus_dec_get_size(sample_rate as c_int, channels as c_int) };
        if size <= 0 {
            return Err(codec_error("lc3plus_dec_get_size returned an invalid size"));
        }
        let mut state = vec![0u8; size as usize];
        let ret =
            unsafe { lc3plus_dec_init(state.as_mut_ptr() as *mut c_void, sample_rate as c_int, channels as c_int, 0) };
        if ret != 0 {
            return Err(codec_error(format!("lc3plus_dec_init failed: {ret}")));
        }
        Ok(Self { state, sample_rate: sample_rate as c_int })
    }
}

impl Codec for Lc3PlusDecoder {
    fn block_frames(&self) -> usize {
        block_frames(self.sample_rate as u32)
    }

    fn encode(&mut self, _pcm: &[i16], _out: &mut [u8]) -> Result<usize> {
        Err(codec_error("Lc3PlusDecoder does not encode; use Lc3PlusEncoder"))
    }

    fn decode(&mut self, frame: &[u8], pcm: &mut [i16]) -> Result<usize> {
        let mut output_ptr = pcm.as_mut_ptr() as *mut c_void;
        let ret = unsafe {
            lc3plus_dec24(
                self.state.as_mut_ptr() as *mut c_void,
                frame.as_ptr(),
                frame.len() as i32,
                &mut output_ptr,
                std::ptr::null_mut(),
                0,
            )
        };
        if ret != 0 {
            return Err(codec_error(format!("lc3plus_dec24 failed: {ret}")));
        }
        Ok(self.block_frames())
    }
}
