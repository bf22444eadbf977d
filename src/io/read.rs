// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Reading the visibility file back, for `inspect` and for tests.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use byteorder::{NativeEndian, ReadBytesExt};
use num_complex::Complex32;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct FileGlobalHeader {
    pub experiment: String,
    pub start_year: i16,
    pub start_day: i16,
    pub start_sec_of_day: i32,
    pub number_channels: usize,
    pub integration_time_usec: i32,
    pub n_stations: i32,
    pub software_tag: String,
}

#[derive(Debug, Clone)]
pub struct FileUvw {
    pub station: i32,
    pub u: f64,
    pub v: f64,
    pub w: f64,
}

#[derive(Debug, Clone)]
pub struct FileStats {
    pub station: u8,
    pub channel_index: u8,
    pub sideband: u8,
    pub polarisation: u8,
    pub levels: [i32; 4],
    pub n_invalid: i32,
}

#[derive(Debug, Clone)]
pub struct FileBaseline {
    pub weight: f32,
    pub station1: u8,
    pub station2: u8,
    pub polarisation1: u8,
    pub polarisation2: u8,
    pub sideband: u8,
    pub channel_index: u8,
    pub vis: Vec<Complex32>,
}

#[derive(Debug, Clone)]
pub struct FileTimeslice {
    pub integration: i32,
    pub uvw: Vec<FileUvw>,
    pub stats: Vec<FileStats>,
    pub baselines: Vec<FileBaseline>,
}

pub struct VisReader {
    path: PathBuf,
    input: BufReader<File>,
    number_channels: usize,
}

impl VisReader {
    /// Open the file and read its global header.
    pub fn open(path: &Path) -> Result<(VisReader, FileGlobalHeader), VisReadError> {
        let file = File::open(path).map_err(|e| VisReadError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut reader = VisReader {
            path: path.to_path_buf(),
            input: BufReader::new(file),
            number_channels: 0,
        };
        let header = reader.read_global_header()?;
        reader.number_channels = header.number_channels;
        Ok((reader, header))
    }

    fn io_err(&self, e: std::io::Error) -> VisReadError {
        VisReadError::Io {
            path: self.path.clone(),
            source: e,
        }
    }

    fn read_global_header(&mut self) -> Result<FileGlobalHeader, VisReadError> {
        let input = &mut self.input;
        let header_size = input
            .read_i32::<NativeEndian>()
            .map_err(|e| VisReadError::Io {
                path: self.path.clone(),
                source: e,
            })?;
        if header_size != super::GLOBAL_HEADER_SIZE {
            return Err(VisReadError::NotAVisFile {
                path: self.path.clone(),
            });
        }
        let result = (|input: &mut BufReader<File>| -> std::io::Result<FileGlobalHeader> {
            let mut experiment = [0u8; 32];
            input.read_exact(&mut experiment)?;
            let start_year = input.read_i16::<NativeEndian>()?;
            let start_day = input.read_i16::<NativeEndian>()?;
            let start_sec_of_day = input.read_i32::<NativeEndian>()?;
            let number_channels = input.read_i32::<NativeEndian>()? as usize;
            let integration_time_usec = input.read_i32::<NativeEndian>()?;
            let n_stations = input.read_i32::<NativeEndian>()?;
            let mut tag = [0u8; 8];
            input.read_exact(&mut tag)?;
            Ok(FileGlobalHeader {
                experiment: zero_terminated(&experiment),
                start_year,
                start_day,
                start_sec_of_day,
                number_channels,
                integration_time_usec,
                n_stations,
                software_tag: zero_terminated(&tag),
            })
        })(input)
        .map_err(|e| self.io_err(e))?;
        Ok(result)
    }

    /// The next timeslice, or `None` at a clean end of file.
    pub fn next_timeslice(&mut self) -> Result<Option<FileTimeslice>, VisReadError> {
        let integration = match self.input.read_i32::<NativeEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(self.io_err(e)),
        };
        let nc = self.number_channels;
        let input = &mut self.input;
        let result = (|input: &mut BufReader<File>| -> std::io::Result<FileTimeslice> {
            let n_baselines = input.read_i32::<NativeEndian>()?;
            let n_uvw = input.read_i32::<NativeEndian>()?;
            let n_stats = input.read_i32::<NativeEndian>()?;

            let mut uvw = Vec::with_capacity(n_uvw as usize);
            for _ in 0..n_uvw {
                let station = input.read_i32::<NativeEndian>()?;
                let _pad = input.read_i32::<NativeEndian>()?;
                uvw.push(FileUvw {
                    station,
                    u: input.read_f64::<NativeEndian>()?,
                    v: input.read_f64::<NativeEndian>()?,
                    w: input.read_f64::<NativeEndian>()?,
                });
            }

            let mut stats = Vec::with_capacity(n_stats as usize);
            for _ in 0..n_stats {
                let mut ids = [0u8; 4];
                input.read_exact(&mut ids)?;
                let mut levels = [0i32; 4];
                for level in &mut levels {
                    *level = input.read_i32::<NativeEndian>()?;
                }
                stats.push(FileStats {
                    station: ids[0],
                    channel_index: ids[1],
                    sideband: ids[2],
                    polarisation: ids[3],
                    levels,
                    n_invalid: input.read_i32::<NativeEndian>()?,
                });
            }

            let mut baselines = Vec::with_capacity(n_baselines as usize);
            for _ in 0..n_baselines {
                let weight = input.read_f32::<NativeEndian>()?;
                let mut ids = [0u8; 6];
                input.read_exact(&mut ids)?;
                let mut vis = Vec::with_capacity(nc + 1);
                for _ in 0..nc + 1 {
                    let re = input.read_f32::<NativeEndian>()?;
                    let im = input.read_f32::<NativeEndian>()?;
                    vis.push(Complex32::new(re, im));
                }
                baselines.push(FileBaseline {
                    weight,
                    station1: ids[0],
                    station2: ids[1],
                    polarisation1: ids[2],
                    polarisation2: ids[3],
                    sideband: ids[4],
                    channel_index: ids[5],
                    vis,
                });
            }

            Ok(FileTimeslice {
                integration,
                uvw,
                stats,
                baselines,
            })
        })(input)
        .map_err(|e| self.io_err(e))?;
        Ok(Some(result))
    }
}

fn zero_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[derive(Error, Debug)]
pub enum VisReadError {
    #[error("Error reading visibility file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path} is not a correlator output file")]
    NotAVisFile { path: PathBuf },
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use crossbeam_channel::bounded;
    use crossbeam_utils::atomic::AtomicCell;

    use super::*;
    use crate::corr::correlation::{BaselineVis, StatsEntry, TimesliceRecord, UvwEntry};
    use crate::io::write::{write_vis, GlobalHeader};
    use crate::time::Time;

    fn test_record(task: usize, nc: usize) -> TimesliceRecord {
        TimesliceRecord {
            task,
            integration: task,
            start: Time::from_date(2006, 123, 6, 30, 0),
            uvw: vec![UvwEntry {
                station: 0,
                u: 1.0,
                v: -2.0,
                w: 3.0 + task as f64,
            }],
            stats: vec![StatsEntry {
                station: 0,
                channel_index: 1,
                sideband: 1,
                polarisation: 0,
                levels: [10, 20, 21, 11],
                n_invalid: 5,
            }],
            baselines: vec![BaselineVis {
                station1: 0,
                station2: 1,
                polarisation1: 0,
                polarisation2: 0,
                sideband: 1,
                channel_index: 1,
                weight: 0.75,
                vis: (0..=nc)
                    .map(|k| Complex32::new(k as f32, task as f32))
                    .collect(),
            }],
        }
    }

    #[test]
    fn round_trip_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.cor");
        let header = GlobalHeader {
            experiment: "N06C2".to_string(),
            start: Time::from_date(2006, 123, 6, 30, 0),
            number_channels: 4,
            integration_time: Time::from_seconds(1.0),
            n_stations: 2,
        };

        let (tx, rx) = bounded(4);
        // Records arrive out of order; the writer restores task order.
        tx.send(test_record(1, 4)).unwrap();
        tx.send(test_record(0, 4)).unwrap();
        drop(tx);
        let error = AtomicCell::new(false);
        let message = write_vis(&path, &header, 2, rx, &error, None).unwrap();
        assert!(message.contains("2 of 2"));

        let (mut reader, global) = VisReader::open(&path).unwrap();
        assert_eq!(global.experiment, "N06C2");
        assert_eq!(global.start_year, 2006);
        assert_eq!(global.start_day, 123);
        assert_eq!(global.start_sec_of_day, 6 * 3600 + 30 * 60);
        assert_eq!(global.number_channels, 4);
        assert_eq!(global.integration_time_usec, 1_000_000);
        assert_eq!(global.n_stations, 2);

        for expected_task in 0..2 {
            let slice = reader.next_timeslice().unwrap().unwrap();
            assert_eq!(slice.integration, expected_task);
            assert_eq!(slice.uvw.len(), 1);
            assert_abs_diff_eq!(slice.uvw[0].w, 3.0 + expected_task as f64);
            assert_eq!(slice.stats[0].levels, [10, 20, 21, 11]);
            assert_eq!(slice.stats[0].n_invalid, 5);
            let bl = &slice.baselines[0];
            assert_abs_diff_eq!(bl.weight, 0.75);
            assert_eq!((bl.station1, bl.station2), (0, 1));
            assert_eq!(bl.vis.len(), 5);
            assert_abs_diff_eq!(bl.vis[3].re, 3.0);
            assert_abs_diff_eq!(bl.vis[3].im, expected_task as f32);
        }
        assert!(reader.next_timeslice().unwrap().is_none());
    }

    #[test]
    fn record_sizes_match_the_format_constants() {
        use crate::io::{
            BASELINE_HEADER_SIZE, STATS_RECORD_SIZE, TIMESLICE_HEADER_SIZE, UVW_RECORD_SIZE,
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sized.cor");
        let nc = 4;
        let header = GlobalHeader {
            experiment: "X".to_string(),
            start: Time::from_date(2006, 1, 0, 0, 0),
            number_channels: nc,
            integration_time: Time::from_seconds(1.0),
            n_stations: 1,
        };
        let (tx, rx) = bounded(1);
        tx.send(test_record(0, nc)).unwrap();
        drop(tx);
        let error = AtomicCell::new(false);
        write_vis(&path, &header, 1, rx, &error, None).unwrap();

        let expected = crate::io::GLOBAL_HEADER_SIZE as usize
            + TIMESLICE_HEADER_SIZE
            + UVW_RECORD_SIZE
            + STATS_RECORD_SIZE
            + BASELINE_HEADER_SIZE
            + (nc + 1) * 8;
        assert_eq!(std::fs::metadata(&path).unwrap().len() as usize, expected);
    }
}
