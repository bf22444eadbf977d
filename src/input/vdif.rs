// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! VDIF frame decoding.
//!
//! Multi-thread VDIF with one channel per thread: each frame carries a
//! 32-byte header (16 in legacy mode) and one channel's bit-packed payload.
//! Thread n maps to observation channel n. Header corruption triggers a
//! bounded resync scan: skip one frame-slot at a time, up to 256 slots,
//! before the stream is declared failed.

use byteorder::{LittleEndian, ReadBytesExt};

use crate::input::unpack::{samples_per_payload, unpack_consecutive};
use crate::input::{ChannelSamples, DecodedFrame, InputError, SourceChain};
use crate::time::Time;

/// Resync gives up after this many candidate header slots.
pub(crate) const MAX_RESYNC_SLOTS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VdifHeader {
    pub sec_from_epoch: u32,
    pub legacy: bool,
    pub invalid: bool,
    pub frame_in_second: u32,
    pub ref_epoch: u8,
    /// Whole frame length (header + payload) in units of 8 bytes.
    pub frame_length_8b: u32,
    pub log2_nchan: u8,
    pub version: u8,
    pub thread_id: u16,
    pub bits_per_sample: u8,
    pub complex: bool,
}

impl VdifHeader {
    pub(crate) fn parse(words: [u32; 4]) -> VdifHeader {
        VdifHeader {
            sec_from_epoch: words[0] & 0x3fff_ffff,
            legacy: (words[0] >> 30) & 1 == 1,
            invalid: (words[0] >> 31) & 1 == 1,
            frame_in_second: words[1] & 0x00ff_ffff,
            ref_epoch: ((words[1] >> 24) & 0x3f) as u8,
            frame_length_8b: words[2] & 0x00ff_ffff,
            log2_nchan: ((words[2] >> 24) & 0x1f) as u8,
            version: ((words[2] >> 29) & 0x7) as u8,
            thread_id: ((words[3] >> 16) & 0x3ff) as u16,
            bits_per_sample: (((words[3] >> 26) & 0x1f) + 1) as u8,
            complex: (words[3] >> 31) & 1 == 1,
        }
    }

    pub(crate) fn header_len(&self) -> usize {
        if self.legacy {
            16
        } else {
            32
        }
    }

    pub(crate) fn payload_len(&self) -> usize {
        (self.frame_length_8b as usize) * 8 - self.header_len()
    }

    /// MJD of the start of this header's half-year reference epoch.
    pub(crate) fn epoch_mjd(&self) -> i64 {
        let year = 2000 + (self.ref_epoch / 2) as i32;
        let leap = (year % 4 == 0 && year % 100 != 0) || year % 400 == 0;
        let doy = if self.ref_epoch % 2 == 0 {
            1
        } else if leap {
            183
        } else {
            182
        };
        Time::from_date(year, doy, 0, 0, 0).mjd_day()
    }
}

pub(crate) struct VdifReader {
    source: SourceChain,
    sample_rate: u64,
    bits_per_sample: u8,
    n_channels: usize,
    first_header: Option<VdifHeader>,
}

impl VdifReader {
    pub(crate) fn open(
        source: SourceChain,
        sample_rate: u64,
        bits_per_sample: u8,
        n_channels: usize,
    ) -> VdifReader {
        VdifReader {
            source,
            sample_rate,
            bits_per_sample,
            n_channels,
            first_header: None,
        }
    }

    /// A header is trusted when its fixed fields agree with the first one
    /// seen and its time words are representable.
    fn check(&self, header: &VdifHeader) -> bool {
        if header.complex || header.log2_nchan != 0 {
            return false;
        }
        if header.frame_length_8b as usize * 8 <= header.header_len() {
            return false;
        }
        match &self.first_header {
            Some(first) => {
                header.frame_length_8b == first.frame_length_8b
                    && header.legacy == first.legacy
                    && header.ref_epoch == first.ref_epoch
                    && header.bits_per_sample == first.bits_per_sample
                    && (header.thread_id as usize) < self.n_channels
            }
            None => {
                header.version <= 1
                    && header.bits_per_sample == self.bits_per_sample
                    && (header.thread_id as usize) < self.n_channels
            }
        }
    }

    fn read_header(&mut self) -> Result<Option<VdifHeader>, InputError> {
        let legacy = self.first_header.map(|h| h.legacy);
        let mut words = [0u32; 4];
        for w in words.iter_mut().take(4) {
            match self.source.read_u32::<LittleEndian>() {
                Ok(v) => *w = v,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(InputError::Io(e)),
            }
        }
        let header = VdifHeader::parse(words);
        // The extended words carry nothing the correlator needs.
        let skip = match legacy {
            Some(true) => 0,
            Some(false) => 16,
            None if header.legacy => 0,
            None => 16,
        };
        if skip > 0 && !self.source.skip(skip)? {
            return Ok(None);
        }
        Ok(Some(header))
    }

    fn frame_time(&self, header: &VdifHeader) -> Time {
        let samples_per_frame =
            samples_per_payload(header.payload_len(), header.bits_per_sample, 1);
        Time::from_mjd_days(header.epoch_mjd())
            + Time::from_usec(header.sec_from_epoch as i64 * crate::time::USEC_PER_SEC)
            + Time::of_samples(
                header.frame_in_second as i64 * samples_per_frame as i64,
                self.sample_rate,
            )
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<DecodedFrame>, InputError> {
        let mut restarts = 0usize;
        loop {
            let header = match self.read_header()? {
                Some(h) => h,
                None => return Ok(None),
            };

            if !self.check(&header) {
                // Lost the frame boundary: scan slot by slot.
                restarts += 1;
                if restarts > MAX_RESYNC_SLOTS {
                    return Err(InputError::Desynchronised {
                        attempts: restarts - 1,
                    });
                }
                let slot = match &self.first_header {
                    Some(first) => first.payload_len(),
                    None => header.payload_len().max(8),
                };
                if !self.source.skip(slot)? {
                    return Ok(None);
                }
                continue;
            }

            if self.first_header.is_none() {
                self.first_header = Some(header);
            }

            let mut payload = vec![0u8; header.payload_len()];
            if !self.source.read_exact_or_eof(&mut payload)? {
                return Ok(None);
            }

            let time = self.frame_time(&header);
            let n_samples =
                samples_per_payload(header.payload_len(), header.bits_per_sample, 1);
            let mut channel = ChannelSamples {
                channel: header.thread_id as usize,
                samples: Vec::with_capacity(n_samples),
                counts: [0; 4],
            };
            if header.invalid {
                channel.samples.resize(n_samples, 0.0);
            } else {
                unpack_consecutive(
                    &payload,
                    header.bits_per_sample,
                    &mut channel.samples,
                    &mut channel.counts,
                );
            }

            return Ok(Some(DecodedFrame {
                start: time,
                invalid: header.invalid,
                channels: vec![channel],
            }));
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn encode_header(h: &VdifHeader) -> Vec<u8> {
        let mut words = [0u32; 4];
        words[0] = (h.sec_from_epoch & 0x3fff_ffff)
            | ((h.legacy as u32) << 30)
            | ((h.invalid as u32) << 31);
        words[1] = (h.frame_in_second & 0x00ff_ffff) | ((h.ref_epoch as u32) << 24);
        words[2] = (h.frame_length_8b & 0x00ff_ffff)
            | ((h.log2_nchan as u32) << 24)
            | ((h.version as u32) << 29);
        words[3] = ((h.thread_id as u32) << 16)
            | (((h.bits_per_sample - 1) as u32) << 26)
            | ((h.complex as u32) << 31);
        let mut bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        if !h.legacy {
            bytes.extend_from_slice(&[0u8; 16]);
        }
        bytes
    }

    fn test_header(frame_in_second: u32) -> VdifHeader {
        VdifHeader {
            sec_from_epoch: 10,
            legacy: false,
            invalid: false,
            frame_in_second,
            ref_epoch: 12, // 2006, first half
            frame_length_8b: (32 + 64) / 8,
            log2_nchan: 0,
            version: 0,
            thread_id: 0,
            bits_per_sample: 2,
            complex: false,
        }
    }

    #[test]
    fn header_round_trip() {
        let h = test_header(77);
        let bytes = encode_header(&h);
        let words = [
            u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
        ];
        assert_eq!(VdifHeader::parse(words), h);
    }

    #[test]
    fn epoch_zero_is_y2000() {
        let mut h = test_header(0);
        h.ref_epoch = 0;
        assert_eq!(h.epoch_mjd(), Time::from_date(2000, 1, 0, 0, 0).mjd_day());
        // Epoch 13 is July 2006.
        h.ref_epoch = 13;
        assert_eq!(
            h.epoch_mjd(),
            Time::from_date(2006, 182, 0, 0, 0).mjd_day()
        );
    }

    #[test]
    fn frames_decode_in_order() {
        let mut bytes = Vec::new();
        for i in 0..3 {
            bytes.extend(encode_header(&test_header(i)));
            bytes.extend(std::iter::repeat(0b1110_0100u8).take(64));
        }
        let mut reader = VdifReader::open(SourceChain::from_bytes(bytes), 1_000_000, 2, 1);

        let samples_per_frame = 64 * 4;
        let epoch = Time::from_mjd_days(test_header(0).epoch_mjd());
        for i in 0..3 {
            let frame = reader.next_frame().unwrap().expect("frame present");
            assert_eq!(frame.channels.len(), 1);
            assert_eq!(frame.channels[0].channel, 0);
            assert_eq!(frame.channels[0].samples.len(), samples_per_frame);
            assert_eq!(
                frame.start,
                epoch
                    + Time::from_seconds(10.0)
                    + Time::of_samples(i * samples_per_frame as i64, 1_000_000)
            );
        }
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn resync_recovers_after_garbage() {
        let mut bytes = Vec::new();
        bytes.extend(encode_header(&test_header(0)));
        bytes.extend(std::iter::repeat(0u8).take(64));
        // A torn frame: garbage where a header should be, one slot long.
        bytes.extend(std::iter::repeat(0xffu8).take(32 + 64));
        bytes.extend(encode_header(&test_header(2)));
        bytes.extend(std::iter::repeat(0u8).take(64));

        let mut reader = VdifReader::open(SourceChain::from_bytes(bytes), 1_000_000, 2, 1);
        let first = reader.next_frame().unwrap().unwrap();
        let second = reader.next_frame().unwrap().unwrap();
        let frame_dur = Time::of_samples(256, 1_000_000);
        assert_eq!(second.start - first.start, frame_dur * 2);
    }

    #[test]
    fn invalid_frames_are_zeroed() {
        let mut h = test_header(0);
        h.invalid = true;
        let mut bytes = encode_header(&h);
        bytes.extend(std::iter::repeat(0b1110_0100u8).take(64));
        let mut reader = VdifReader::open(SourceChain::from_bytes(bytes), 1_000_000, 2, 1);
        let frame = reader.next_frame().unwrap().unwrap();
        assert!(frame.invalid);
        assert!(frame.channels[0].samples.iter().all(|&s| s == 0.0));
        assert_eq!(frame.channels[0].counts, [0; 4]);
    }
}
