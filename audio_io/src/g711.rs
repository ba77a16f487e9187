//! G.711 µ-law codec.
//!
//! The mesh carries narrowband PCMU so capture and playback only need a
//! per-sample companding step, no frame codec.

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

/// µ-law byte for digital silence
pub const SILENCE: u8 = 0xFF;

/// Compress one 16-bit linear sample
pub fn encode_sample(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    if pcm > CLIP {
        pcm = CLIP;
    }
    pcm += BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while pcm & mask == 0 && exponent > 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;

    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Expand one µ-law byte to a 16-bit linear sample
pub fn decode_sample(byte: u8) -> i16 {
    let b = !byte;
    let sign = b & 0x80;
    let exponent = ((b >> 4) & 0x07) as i32;
    let mantissa = (b & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Encode normalized f32 samples
pub fn encode_frame(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .map(|s| encode_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
        .collect()
}

/// Decode into normalized f32 samples
pub fn decode_frame(payload: &[u8]) -> Vec<f32> {
    payload
        .iter()
        .map(|&b| decode_sample(b) as f32 / 32768.0)
        .collect()
}
