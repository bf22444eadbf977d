// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Sample unpacking.
//!
//! Recorded payloads are 1- or 2-bit quantised, least-significant sample
//! first within each byte. 2-bit codes are offset binary over the optimal
//! four-level quantiser (±1, ±3.3359); 1-bit is sign only. The unpackers
//! also histogram the level codes, feeding the sampler statistics that end
//! up in the output records.

use lazy_static::lazy_static;

/// Reconstruction levels of the 4-level quantiser.
const LEVELS_2BIT: [f32; 4] = [-3.3359, -1.0, 1.0, 3.3359];
const LEVELS_1BIT: [f32; 2] = [-1.0, 1.0];

lazy_static! {
    /// Byte → four decoded 2-bit samples, LSB first.
    static ref BYTE_2BIT: Vec<[f32; 4]> = (0..256u16)
        .map(|byte| {
            let mut quad = [0.0; 4];
            for (s, out) in quad.iter_mut().enumerate() {
                *out = LEVELS_2BIT[((byte >> (2 * s)) & 3) as usize];
            }
            quad
        })
        .collect();
}

/// Decode a payload holding one channel's samples back to back.
pub(crate) fn unpack_consecutive(
    payload: &[u8],
    bits_per_sample: u8,
    out: &mut Vec<f32>,
    counts: &mut [u64; 4],
) {
    match bits_per_sample {
        1 => {
            for &byte in payload {
                for s in 0..8 {
                    let code = ((byte >> s) & 1) as usize;
                    counts[code] += 1;
                    out.push(LEVELS_1BIT[code]);
                }
            }
        }
        2 => {
            for &byte in payload {
                for s in 0..4 {
                    counts[((byte >> (2 * s)) & 3) as usize] += 1;
                }
                out.extend_from_slice(&BYTE_2BIT[byte as usize]);
            }
        }
        bits => unreachable!("bits_per_sample {bits} rejected at validation"),
    }
}

/// Decode one channel out of a payload where samples interleave across
/// `n_channels` channels (sample-major, channel-minor).
pub(crate) fn unpack_interleaved(
    payload: &[u8],
    bits_per_sample: u8,
    n_channels: usize,
    channel: usize,
    out: &mut Vec<f32>,
    counts: &mut [u64; 4],
) {
    debug_assert!(channel < n_channels);
    let bits = bits_per_sample as usize;
    let total_samples = payload.len() * 8 / (bits * n_channels);
    for s in 0..total_samples {
        let bit = (s * n_channels + channel) * bits;
        let byte = payload[bit / 8];
        let code = ((byte >> (bit % 8)) & ((1 << bits) - 1)) as usize;
        counts[code] += 1;
        out.push(match bits_per_sample {
            1 => LEVELS_1BIT[code],
            _ => LEVELS_2BIT[code],
        });
    }
}

/// Samples held by `payload_len` bytes of one channel.
pub(crate) fn samples_per_payload(
    payload_len: usize,
    bits_per_sample: u8,
    n_channels: usize,
) -> usize {
    payload_len * 8 / (bits_per_sample as usize * n_channels)
}
