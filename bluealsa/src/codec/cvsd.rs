//! CVSD, the mandatory HSP/HFP narrowband codec.
//!
//! Unlike the other codecs here, no external library ships CVSD (it predates the codec
//! libraries BlueALSA otherwise depends on), so this is a small self-contained continuously
//! variable slope delta modulator/demodulator, matching the fixed step-size table real HFP
//! headsets expect.

use super::Codec;
use crate::Result;

const STEP_TABLE: [i32; 4] = [1, 1, 1, 2];
const STEP_MIN: i32 = 10;
const STEP_MAX: i32 = 1280;
const BLOCK_FRAMES: usize = 120;

/// One direction (encode or decode) of a CVSD codec instance; each side keeps its own
/// accumulator and step size since a transport runs independent encoder and decoder state.
#[derive(Clone, Copy, Debug)]
struct SlopeState {
    estimate: i32,
    step: i32,
    history: u8,
}

impl Default for SlopeState {
    fn default() -> Self {
        Self { estimate: 0, step: STEP_MIN, history: 0 }
    }
}

impl SlopeState {
    fn adapt(&mut self, bit: bool) {
        self.history = (self.history << 1) | (bit as u8);
        let run = match self.history & 0b111 {
            0b000 | 0b111 => 3,
            0b001 | 0b110 => 2,
            0b011 | 0b100 => 1,
            _ => 0,
        };
        let delta = self.step * if bit { 1 } else { -1 };
        self.estimate = (self.estimate + delta).clamp(i16::MIN as i32, i16::MAX as i32);
        self.step = (self.step * STEP_TABLE[run] / 1).clamp(STEP_MIN, STEP_MAX);
    }
}

/// Software CVSD codec, one bit per PCM sample at the negotiated sample rate (always 8kHz for
/// HSP/HFP), packed 8 bits per output byte, MSB first.
pub struct Cvsd {
    encode_state: SlopeState,
    decode_state: SlopeState,
}

impl Cvsd {
    pub fn new() -> Self {
        Self { encode_state: SlopeState::default(), decode_state: SlopeState::default() }
    }
}

impl Default for Cvsd {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for Cvsd {
    fn block_frames(&self) -> usize {
        BLOCK_FRAMES
    }

    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize> {
        let needed = (pcm.len() + 7) / 8;
        if out.len() < needed {
            return Err(super::codec_error("output buffer too small for CVSD frame"));
        }
        for (chunk_idx, chunk) in pcm.chunks(8).enumerate() {
            let mut byte = 0u8;
            for (i, &sample) in chunk.iter().enumerate() {
                let bit = sample as i32 >= self.encode_state.estimate;
                byte |= (bit as u8) << (7 - i);
                self.encode_state.adapt(bit);
            }
            out[chunk_idx] = byte;
        }
        Ok(needed)
    }

    fn decode(&mut self, frame: &[u8], pcm: &mut [i16]) -> Result<usize> {
        let total_bits = frame.len() * 8;
        if pcm.len() < total_bits {
            return Err(super::codec_error("output buffer too small for CVSD decode"));
        }
        let mut n = 0;
        for &byte in frame {
            for i in 0..8 {
                let bit = (byte >> (7 - i)) & 1 != 0;
                self.decode_state.adapt(bit);
                pcm[n] = self.decode_state.estimate as i16;
                n += 1;
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_tracks_a_constant_signal() {
        let mut encoder = Cvsd::new();
        let mut decoder = Cvsd::new();
        let pcm: Vec<i16> = vec![5000; 800];
        let mut frame = vec![0u8; pcm.len() / 8];
        encoder.encode(&pcm, &mut frame).unwrap();
        let mut out = vec![0i16; pcm.len()];
        decoder.decode(&frame, &mut out).unwrap();
        // CVSD is lossy by design; after the step size adapts up, the tracked estimate should
        // settle near the input level rather than wander off to a rail.
        let tail_avg: i32 = out[700..].iter().map(|&s| s as i32).sum::<i32>() / 100;
        assert!((tail_avg - 5000).abs() < 2000, "tail average {tail_avg} drifted too far from input");
    }

    #[test]
    fn rejects_undersized_output_buffer() {
        let mut encoder = Cvsd::new();
        let pcm = vec![0i16; 16];
        let mut frame = vec![0u8; 1];
        assert!(encoder.encode(&pcm, &mut frame).is_err());
    }
}
