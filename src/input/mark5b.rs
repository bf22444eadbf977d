// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Mark5B frame decoding.
//!
//! Fixed 10016-byte frames: a 16-byte header (sync word, frame number
//! within the second, VLBA BCD time code) followed by 10000 bytes of
//! payload with every recorded channel bit-interleaved sample by sample.
//! The BCD day field only carries MJD modulo 1000, so the reader anchors it
//! to the job's start time. On a missing sync word the reader scans byte by
//! byte, bounded by the same slot budget as the VDIF flavour.

use byteorder::{LittleEndian, ReadBytesExt};

use crate::input::unpack::{samples_per_payload, unpack_interleaved};
use crate::input::vdif::MAX_RESYNC_SLOTS;
use crate::input::{ChannelSamples, DecodedFrame, InputError, SourceChain};
use crate::time::{Time, USEC_PER_SEC};

pub(crate) const SYNC_WORD: u32 = 0xABAD_DEED;
pub(crate) const PAYLOAD_LEN: usize = 10_000;
pub(crate) const FRAME_LEN: usize = PAYLOAD_LEN + 16;

/// Pack a value as big-endian binary-coded decimal digits.
pub(crate) fn to_bcd(value: u32, digits: u32) -> u32 {
    let mut out = 0u32;
    let mut value = value;
    for d in 0..digits {
        out |= (value % 10) << (4 * d);
        value /= 10;
    }
    out
}

pub(crate) fn from_bcd(mut bcd: u32, digits: u32) -> u32 {
    let mut out = 0;
    let mut scale = 1;
    for _ in 0..digits {
        out += (bcd & 0xf) * scale;
        bcd >>= 4;
        scale *= 10;
    }
    out
}

pub(crate) struct Mark5bReader {
    source: SourceChain,
    sample_rate: u64,
    bits_per_sample: u8,
    n_channels: usize,
    /// Channels of the observation this station records, in payload order.
    channels: Vec<usize>,
    /// Anchor for the 3-digit BCD day field.
    ref_mjd: i64,
}

impl Mark5bReader {
    pub(crate) fn open(
        source: SourceChain,
        sample_rate: u64,
        bits_per_sample: u8,
        channels: Vec<usize>,
        ref_time: Time,
    ) -> Mark5bReader {
        Mark5bReader {
            source,
            sample_rate,
            bits_per_sample,
            n_channels: channels.len(),
            channels,
            ref_mjd: ref_time.mjd_day(),
        }
    }

    /// The MJD closest to the anchor whose last three digits are `jjj`.
    fn resolve_mjd(&self, jjj: i64) -> i64 {
        let ahead = (jjj - self.ref_mjd).rem_euclid(1000);
        if ahead <= 500 {
            self.ref_mjd + ahead
        } else {
            self.ref_mjd + ahead - 1000
        }
    }

    /// Find the next sync word. Returns false on end of data.
    fn sync(&mut self) -> Result<bool, InputError> {
        let mut window = [0u8; 4];
        if !self.source.read_exact_or_eof(&mut window)? {
            return Ok(false);
        }
        let mut scanned = 0usize;
        while u32::from_le_bytes(window) != SYNC_WORD {
            let mut next = [0u8; 1];
            if !self.source.read_exact_or_eof(&mut next)? {
                return Ok(false);
            }
            window = [window[1], window[2], window[3], next[0]];
            scanned += 1;
            if scanned > MAX_RESYNC_SLOTS * FRAME_LEN {
                return Err(InputError::Desynchronised {
                    attempts: MAX_RESYNC_SLOTS,
                });
            }
        }
        Ok(true)
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<DecodedFrame>, InputError> {
        if !self.sync()? {
            return Ok(None);
        }
        let word1 = match self.source.read_u32::<LittleEndian>() {
            Ok(w) => w,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(InputError::Io(e)),
        };
        let word2 = match self.source.read_u32::<LittleEndian>() {
            Ok(w) => w,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(InputError::Io(e)),
        };
        // Sub-second BCD and CRC; the frame number is authoritative.
        if !self.source.skip(4)? {
            return Ok(None);
        }

        let frame_nr = (word1 & 0x7fff) as i64;
        let jjj = from_bcd(word2 >> 20, 3) as i64;
        let sec_of_day = from_bcd(word2 & 0xf_ffff, 5) as i64;

        let mut payload = vec![0u8; PAYLOAD_LEN];
        if !self.source.read_exact_or_eof(&mut payload)? {
            return Ok(None);
        }

        let samples_per_frame =
            samples_per_payload(PAYLOAD_LEN, self.bits_per_sample, self.n_channels);
        let start = Time::from_mjd_days(self.resolve_mjd(jjj))
            + Time::from_usec(sec_of_day * USEC_PER_SEC)
            + Time::of_samples(frame_nr * samples_per_frame as i64, self.sample_rate);

        let channels = self
            .channels
            .iter()
            .enumerate()
            .map(|(slot, &channel)| {
                let mut out = ChannelSamples {
                    channel,
                    samples: Vec::with_capacity(samples_per_frame),
                    counts: [0; 4],
                };
                unpack_interleaved(
                    &payload,
                    self.bits_per_sample,
                    self.n_channels,
                    slot,
                    &mut out.samples,
                    &mut out.counts,
                );
                out
            })
            .collect();

        Ok(Some(DecodedFrame {
            start,
            invalid: false,
            channels,
        }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn bcd_round_trip() {
        assert_eq!(to_bcd(123, 3), 0x123);
        assert_eq!(to_bcd(86399, 5), 0x86399);
        assert_eq!(from_bcd(0x123, 3), 123);
        assert_eq!(from_bcd(0x86399, 5), 86399);
        for v in [0u32, 7, 59, 999] {
            assert_eq!(from_bcd(to_bcd(v, 3), 3), v);
        }
    }

    pub(crate) fn encode_frame(mjd: i64, sec_of_day: u32, frame_nr: u32, payload: &[u8]) -> Vec<u8> {
        assert_eq!(payload.len(), PAYLOAD_LEN);
        let mut bytes = Vec::with_capacity(FRAME_LEN);
        bytes.extend(SYNC_WORD.to_le_bytes());
        bytes.extend(frame_nr.to_le_bytes());
        let word2 = (to_bcd((mjd % 1000) as u32, 3) << 20) | to_bcd(sec_of_day, 5);
        bytes.extend(word2.to_le_bytes());
        bytes.extend(0u32.to_le_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn frames_decode_with_resolved_mjd() {
        let ref_time = Time::from_date(2006, 123, 0, 0, 0); // MJD 53858
        let mjd = ref_time.mjd_day();
        // Two channels, 2-bit: code pattern giving channel 0 all zeros codes.
        let payload = vec![0b10_00_10_00u8; PAYLOAD_LEN];
        let mut bytes = encode_frame(mjd, 3600, 0, &payload);
        bytes.extend(encode_frame(mjd, 3600, 1, &payload));

        let mut reader = Mark5bReader::open(
            SourceChain::from_bytes(bytes),
            1_000_000,
            2,
            vec![0, 1],
            ref_time,
        );
        let samples_per_frame = PAYLOAD_LEN * 8 / (2 * 2);
        let first = reader.next_frame().unwrap().unwrap();
        assert_eq!(first.start, ref_time + Time::from_seconds(3600.0));
        assert_eq!(first.channels.len(), 2);
        assert_eq!(first.channels[0].samples.len(), samples_per_frame);
        assert!(first.channels[0].samples.iter().all(|&s| s == -3.3359));
        assert!(first.channels[1].samples.iter().all(|&s| s == 1.0));

        let second = reader.next_frame().unwrap().unwrap();
        assert_eq!(
            second.start - first.start,
            Time::of_samples(samples_per_frame as i64, 1_000_000)
        );
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn sync_scan_skips_leading_garbage() {
        let ref_time = Time::from_date(2006, 123, 0, 0, 0);
        let payload = vec![0u8; PAYLOAD_LEN];
        let mut bytes = vec![0x5au8; 37];
        bytes.extend(encode_frame(ref_time.mjd_day(), 10, 0, &payload));
        let mut reader = Mark5bReader::open(
            SourceChain::from_bytes(bytes),
            1_000_000,
            2,
            vec![0],
            ref_time,
        );
        let frame = reader.next_frame().unwrap().unwrap();
        assert_eq!(frame.start, ref_time + Time::from_seconds(10.0));
    }

    #[test]
    fn day_field_resolves_across_the_millennium_wrap() {
        let ref_time = Time::from_mjd_days(53_999);
        let reader = Mark5bReader::open(
            SourceChain::from_bytes(Vec::new()),
            1_000_000,
            2,
            vec![0],
            ref_time,
        );
        assert_eq!(reader.resolve_mjd(999), 53_999);
        assert_eq!(reader.resolve_mjd(1), 54_001);
        assert_eq!(reader.resolve_mjd(998), 53_998);
    }
}
