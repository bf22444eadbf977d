// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The input station node.
//!
//! One node per station: it opens the station's recordings back to back,
//! walks the frame stream once, and assembles wall-clock-aligned sample
//! slices for every (stream, integration) it has been assigned, pushing
//! each finished slice to its correlator worker over a bounded channel.
//! Gaps between frames are zero-filled and counted invalid; an early end of
//! the recordings truncates `valid_samples` so downstream weights drop.
//!
//! Recorder formats come in two flavours behind the [`FrameReader`] enum;
//! the node only ever consumes the common "decoded floats per channel"
//! shape.

pub(crate) mod mark5b;
pub(crate) mod unpack;
pub(crate) mod vdif;

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;

use crossbeam_channel::Sender;
use log::{debug, info, warn};
use thiserror::Error;

use crate::context::{DataFormat, Station};
use crate::corr::stats::BitStatistics;
use crate::corr::SliceData;
use crate::time::Time;

/// One channel's decoded samples from one frame.
#[derive(Debug)]
pub(crate) struct ChannelSamples {
    pub channel: usize,
    pub samples: Vec<f32>,
    pub counts: [u64; 4],
}

/// A decoded recorder frame: a timestamp plus per-channel floats.
#[derive(Debug)]
pub(crate) struct DecodedFrame {
    pub start: Time,
    pub invalid: bool,
    pub channels: Vec<ChannelSamples>,
}

/// The recorder-format flavours, as a tagged variant over the shared
/// capability set: open, next_frame, resync (internal to both), close.
pub(crate) enum FrameReader {
    Vdif(vdif::VdifReader),
    Mark5b(mark5b::Mark5bReader),
}

impl FrameReader {
    pub(crate) fn open(
        station: &Station,
        sample_rate: u64,
        bits_per_sample: u8,
        channels: Vec<usize>,
        ref_time: Time,
    ) -> Result<FrameReader, InputError> {
        let source = SourceChain::open(station.sources.clone())?;
        Ok(match station.format {
            DataFormat::Vdif => FrameReader::Vdif(vdif::VdifReader::open(
                source,
                sample_rate,
                bits_per_sample,
                channels.len(),
            )),
            DataFormat::Mark5b => FrameReader::Mark5b(mark5b::Mark5bReader::open(
                source,
                sample_rate,
                bits_per_sample,
                channels,
                ref_time,
            )),
        })
    }

    fn next_frame(&mut self) -> Result<Option<DecodedFrame>, InputError> {
        match self {
            FrameReader::Vdif(r) => r.next_frame(),
            FrameReader::Mark5b(r) => r.next_frame(),
        }
    }
}

/// One slice the node must deliver: which window, which stream, where to.
pub(crate) struct SliceAssignment {
    pub task: usize,
    pub start: Time,
    pub stream: usize,
    pub channel: usize,
    pub tx: Sender<SliceData>,
}

pub(crate) struct InputNode {
    station_name: String,
    reader: FrameReader,
    /// Sorted by task index; the controller enumerates tasks in time order.
    assignments: Vec<SliceAssignment>,
    slice_samples: usize,
    sample_rate: u64,
    bits_per_sample: u8,
    exit_on_empty: bool,

    pending: Option<DecodedFrame>,
    eof: bool,
}

/// Assembly state of one channel within one window.
struct WindowChannel {
    samples: Vec<f32>,
    /// High-water mark of written samples.
    cursor: usize,
    counts: [u64; 4],
    n_invalid: u64,
}

impl InputNode {
    pub(crate) fn new(
        station_name: String,
        reader: FrameReader,
        assignments: Vec<SliceAssignment>,
        slice_samples: usize,
        sample_rate: u64,
        bits_per_sample: u8,
        exit_on_empty: bool,
    ) -> InputNode {
        InputNode {
            station_name,
            reader,
            assignments,
            slice_samples,
            sample_rate,
            bits_per_sample,
            exit_on_empty,
            pending: None,
            eof: false,
        }
    }

    /// Decode and deliver every assigned slice, in task order.
    pub(crate) fn run(mut self) -> Result<(), InputError> {
        let mut assignments = std::mem::take(&mut self.assignments);
        assignments.sort_by_key(|a| a.task);
        let mut queue: VecDeque<SliceAssignment> = assignments.into();
        info!(
            "station {}: {} slices to deliver",
            self.station_name,
            queue.len()
        );

        while let Some(first) = queue.pop_front() {
            // Everything sharing this window fills from one decode pass.
            let start = first.start;
            let mut batch = vec![first];
            while queue.front().map(|a| a.start == start).unwrap_or(false) {
                batch.push(queue.pop_front().unwrap());
            }

            let channels: Vec<usize> = batch.iter().map(|a| a.channel).collect();
            let mut window = self.fill_window(start, &channels)?;

            for assignment in batch {
                let state = window
                    .remove(&assignment.channel)
                    .expect("window covers every requested channel");
                let mut stats = BitStatistics::new(self.bits_per_sample);
                stats.add_counts(state.counts);
                stats.add_invalid(state.n_invalid);
                let slice = SliceData {
                    stream: assignment.stream,
                    task: assignment.task,
                    start,
                    samples: state.samples,
                    valid_samples: state.cursor,
                    stats,
                };
                if assignment.tx.send(slice).is_err() {
                    // The worker hung up; some other thread is tearing the
                    // job down.
                    debug!("station {}: worker gone, stopping", self.station_name);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Assemble one window `[start, start + slice)` for the given channels.
    fn fill_window(
        &mut self,
        start: Time,
        channels: &[usize],
    ) -> Result<HashMap<usize, WindowChannel>, InputError> {
        let n = self.slice_samples;
        let rate = self.sample_rate;
        let end = start + Time::of_samples(n as i64, rate);

        let mut window: HashMap<usize, WindowChannel> = channels
            .iter()
            .map(|&c| {
                (
                    c,
                    WindowChannel {
                        samples: vec![0.0; n],
                        cursor: 0,
                        counts: [0; 4],
                        n_invalid: 0,
                    },
                )
            })
            .collect();

        loop {
            let frame = match self.pending.take() {
                Some(frame) => frame,
                None => {
                    if self.eof {
                        break;
                    }
                    match self.reader.next_frame()? {
                        Some(frame) => frame,
                        None => {
                            self.eof = true;
                            break;
                        }
                    }
                }
            };

            if frame.start >= end {
                self.pending = Some(frame);
                break;
            }
            let frame_samples = frame
                .channels
                .first()
                .map(|c| c.samples.len())
                .unwrap_or(0);
            let frame_end = frame.start + Time::of_samples(frame_samples as i64, rate);
            if frame_end <= start {
                continue;
            }

            // Sample offset of the frame within the window; negative when
            // the frame started before it.
            let offset = (frame.start - start).samples(rate);
            for ch in &frame.channels {
                let state = match window.get_mut(&ch.channel) {
                    Some(state) => state,
                    None => continue,
                };
                let src_from = (-offset).max(0) as usize;
                let dst_from = offset.max(0) as usize;
                let len = (ch.samples.len() - src_from).min(n - dst_from);
                if len == 0 {
                    continue;
                }
                if dst_from > state.cursor {
                    // A gap between frames: stays zero, counts invalid.
                    state.n_invalid += (dst_from - state.cursor) as u64;
                }
                if frame.invalid {
                    state.n_invalid += len as u64;
                } else {
                    state.samples[dst_from..dst_from + len]
                        .copy_from_slice(&ch.samples[src_from..src_from + len]);
                    state.counts[0] += ch.counts[0];
                    state.counts[1] += ch.counts[1];
                    state.counts[2] += ch.counts[2];
                    state.counts[3] += ch.counts[3];
                }
                state.cursor = state.cursor.max(dst_from + len);
            }

            if frame_end > end {
                self.pending = Some(frame);
                break;
            }
        }

        // A pending frame past the window end means the recording continues:
        // anything unwritten is a gap, not an end of stream.
        let stream_continues = self.pending.is_some();
        let mut any_data = false;
        for state in window.values_mut() {
            if stream_continues && state.cursor < n {
                state.n_invalid += (n - state.cursor) as u64;
                state.cursor = n;
            }
            any_data |= state.cursor > 0;
        }

        if !any_data && self.eof {
            if self.exit_on_empty {
                return Err(InputError::EmptyStream {
                    station: self.station_name.clone(),
                });
            }
            warn!(
                "station {}: no data for slice at {start}, writing zero weight",
                self.station_name
            );
        }
        Ok(window)
    }
}

/// The station's recordings, read back to back as one byte stream.
pub(crate) struct SourceChain {
    pending: VecDeque<PathBuf>,
    current: Option<Box<dyn Read + Send>>,
}

impl SourceChain {
    pub(crate) fn open(paths: Vec<PathBuf>) -> Result<SourceChain, InputError> {
        // Fail on unreadable recordings up front, not mid-job.
        for path in &paths {
            if !path.is_file() {
                return Err(InputError::Unavailable { path: path.clone() });
            }
        }
        Ok(SourceChain {
            pending: paths.into(),
            current: None,
        })
    }

    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: Vec<u8>) -> SourceChain {
        SourceChain {
            pending: VecDeque::new(),
            current: Some(Box::new(std::io::Cursor::new(bytes))),
        }
    }

    /// `read_exact`, but a clean end of all sources yields `Ok(false)`.
    pub(crate) fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<bool, InputError> {
        match self.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(InputError::Io(e)),
        }
    }

    /// Discard `n` bytes; `Ok(false)` when the sources end first.
    pub(crate) fn skip(&mut self, n: usize) -> Result<bool, InputError> {
        let mut taken = std::io::Read::take(&mut *self, n as u64);
        let copied =
            std::io::copy(&mut taken, &mut std::io::sink()).map_err(InputError::Io)?;
        Ok(copied == n as u64)
    }
}

impl Read for SourceChain {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.current.is_none() {
                match self.pending.pop_front() {
                    Some(path) => {
                        self.current = Some(Box::new(BufReader::new(File::open(path)?)));
                    }
                    None => return Ok(0),
                }
            }
            let n = self.current.as_mut().unwrap().read(buf)?;
            if n > 0 || buf.is_empty() {
                return Ok(n);
            }
            self.current = None;
        }
    }
}

#[derive(Error, Debug)]
pub enum InputError {
    #[error("Input recording {path} does not exist or is not readable")]
    Unavailable { path: PathBuf },

    #[error(transparent)]
    Io(std::io::Error),

    #[error("Frame synchronisation lost and not recovered within {attempts} header slots")]
    Desynchronised { attempts: usize },

    #[error("Station {station}: data stream is empty")]
    EmptyStream { station: String },
}

#[cfg(test)]
mod tests {
    use super::vdif::tests::encode_header;
    use super::vdif::VdifHeader;
    use super::*;
    use crossbeam_channel::bounded;

    const RATE: u64 = 1_000_000;

    fn frame_bytes(sec: u32, frame_in_second: u32, fill: u8) -> Vec<u8> {
        let header = VdifHeader {
            sec_from_epoch: sec,
            legacy: false,
            invalid: false,
            frame_in_second,
            ref_epoch: 0,
            frame_length_8b: (32 + 64) / 8,
            log2_nchan: 0,
            version: 0,
            thread_id: 0,
            bits_per_sample: 2,
            complex: false,
        };
        let mut bytes = encode_header(&header);
        bytes.extend(std::iter::repeat(fill).take(64));
        bytes
    }

    fn node_with_bytes(
        bytes: Vec<u8>,
        assignments: Vec<SliceAssignment>,
        slice_samples: usize,
        exit_on_empty: bool,
    ) -> InputNode {
        let reader = FrameReader::Vdif(vdif::VdifReader::open(
            SourceChain::from_bytes(bytes),
            RATE,
            2,
            1,
        ));
        InputNode::new(
            "Ef".to_string(),
            reader,
            assignments,
            slice_samples,
            RATE,
            2,
            exit_on_empty,
        )
    }

    #[test]
    fn chained_sources_read_continuously() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.raw");
        let b = dir.path().join("b.raw");
        std::fs::write(&a, [1u8, 2, 3]).unwrap();
        std::fs::write(&b, [4u8, 5]).unwrap();
        let mut chain = SourceChain::open(vec![a, b]).unwrap();
        let mut all = Vec::new();
        chain.read_to_end(&mut all).unwrap();
        assert_eq!(all, vec![1, 2, 3, 4, 5]);

        let missing = dir.path().join("missing.raw");
        assert!(matches!(
            SourceChain::open(vec![missing]),
            Err(InputError::Unavailable { .. })
        ));
    }

    #[test]
    fn aligned_frames_fill_a_slice_exactly() {
        // VDIF epoch 0 starts at 2000-01-01; window starts 10 s in.
        let t0 = Time::from_date(2000, 1, 0, 0, 10);
        // 256 samples per frame, slice of 512 -> two frames.
        let mut bytes = frame_bytes(10, 0, 0b1110_0100);
        bytes.extend(frame_bytes(10, 1, 0b1110_0100));

        let (tx, rx) = bounded(4);
        let node = node_with_bytes(
            bytes,
            vec![SliceAssignment {
                task: 0,
                start: t0,
                stream: 0,
                channel: 0,
                tx,
            }],
            512,
            true,
        );
        node.run().unwrap();

        let slice = rx.recv().unwrap();
        assert_eq!(slice.samples.len(), 512);
        assert_eq!(slice.valid_samples, 512);
        assert_eq!(slice.stats.n_invalid(), 0);
        assert_eq!(slice.stats.levels(), [128, 128, 128, 128]);
        assert_eq!(slice.samples[0], -3.3359);
    }

    #[test]
    fn missing_frame_becomes_an_invalid_gap() {
        let t0 = Time::from_date(2000, 1, 0, 0, 10);
        // Frames 0 and 2 of the second; frame 1 lost.
        let mut bytes = frame_bytes(10, 0, 0);
        bytes.extend(frame_bytes(10, 2, 0));
        // A later frame so the stream does not look ended.
        bytes.extend(frame_bytes(11, 0, 0));

        let (tx, rx) = bounded(4);
        let node = node_with_bytes(
            bytes,
            vec![SliceAssignment {
                task: 0,
                start: t0,
                stream: 0,
                channel: 0,
                tx,
            }],
            768,
            true,
        );
        node.run().unwrap();

        let slice = rx.recv().unwrap();
        assert_eq!(slice.valid_samples, 768);
        assert_eq!(slice.stats.n_invalid(), 256);
    }

    #[test]
    fn early_eof_truncates_valid_samples() {
        let t0 = Time::from_date(2000, 1, 0, 0, 10);
        let bytes = frame_bytes(10, 0, 0);

        let (tx, rx) = bounded(4);
        let node = node_with_bytes(
            bytes,
            vec![SliceAssignment {
                task: 0,
                start: t0,
                stream: 0,
                channel: 0,
                tx,
            }],
            512,
            true,
        );
        node.run().unwrap();

        let slice = rx.recv().unwrap();
        assert_eq!(slice.valid_samples, 256);
    }

    #[test]
    fn empty_stream_is_fatal_when_configured() {
        let t0 = Time::from_date(2000, 1, 0, 1, 0); // far past the data
        let bytes = frame_bytes(10, 0, 0);
        let (tx, rx) = bounded(4);
        let node = node_with_bytes(
            bytes,
            vec![SliceAssignment {
                task: 0,
                start: t0,
                stream: 0,
                channel: 0,
                tx,
            }],
            512,
            true,
        );
        let result = node.run();
        assert!(matches!(result, Err(InputError::EmptyStream { .. })));
        drop(rx);
    }

    #[test]
    fn empty_stream_zero_weight_otherwise() {
        let t0 = Time::from_date(2000, 1, 0, 1, 0);
        let bytes = frame_bytes(10, 0, 0);
        let (tx, rx) = bounded(4);
        let node = node_with_bytes(
            bytes,
            vec![SliceAssignment {
                task: 0,
                start: t0,
                stream: 0,
                channel: 0,
                tx,
            }],
            512,
            false,
        );
        node.run().unwrap();
        let slice = rx.recv().unwrap();
        assert_eq!(slice.valid_samples, 0);
        assert!(slice.samples.iter().all(|&s| s == 0.0));
    }
}
