// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Writing the visibility file.
//!
//! The output node owns the file handle exclusively. Workers finish slices
//! in whatever order their loads allow; the node buffers out-of-order
//! records and restores canonical (integration, channel) order before
//! anything touches the disk.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{NativeEndian, WriteBytesExt};
use crossbeam_channel::Receiver;
use crossbeam_utils::atomic::AtomicCell;
use indicatif::ProgressBar;
use log::{debug, trace};
use thiserror::Error;

use crate::corr::correlation::TimesliceRecord;
use crate::time::Time;

/// Job-level metadata written once at the start of the file.
#[derive(Debug, Clone)]
pub(crate) struct GlobalHeader {
    pub experiment: String,
    pub start: Time,
    pub number_channels: usize,
    pub integration_time: Time,
    pub n_stations: usize,
}

pub(crate) struct VisWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl VisWriter {
    pub(crate) fn create(path: &Path) -> Result<VisWriter, VisWriteError> {
        let file = File::create(path).map_err(|e| VisWriteError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(VisWriter {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
        })
    }

    fn io_err(&self, e: std::io::Error) -> VisWriteError {
        VisWriteError::Io {
            path: self.path.clone(),
            source: e,
        }
    }

    pub(crate) fn write_global_header(
        &mut self,
        header: &GlobalHeader,
    ) -> Result<(), VisWriteError> {
        let (year, day) = header.start.year_day();
        let sec_of_day = (header.start.usec_of_day() / crate::time::USEC_PER_SEC) as i32;

        let mut experiment = [0u8; 32];
        let name = header.experiment.as_bytes();
        let n = name.len().min(31);
        experiment[..n].copy_from_slice(&name[..n]);

        let mut tag = [0u8; 8];
        let version = env!("CARGO_PKG_VERSION").as_bytes();
        tag[..version.len().min(8)].copy_from_slice(&version[..version.len().min(8)]);

        let out = &mut self.out;
        (|| -> std::io::Result<()> {
            out.write_i32::<NativeEndian>(super::GLOBAL_HEADER_SIZE)?;
            out.write_all(&experiment)?;
            out.write_i16::<NativeEndian>(year as i16)?;
            out.write_i16::<NativeEndian>(day as i16)?;
            out.write_i32::<NativeEndian>(sec_of_day)?;
            out.write_i32::<NativeEndian>(header.number_channels as i32)?;
            out.write_i32::<NativeEndian>(header.integration_time.usec() as i32)?;
            out.write_i32::<NativeEndian>(header.n_stations as i32)?;
            out.write_all(&tag)
        })()
        .map_err(|e| self.io_err(e))
    }

    pub(crate) fn write_timeslice(
        &mut self,
        record: &TimesliceRecord,
    ) -> Result<(), VisWriteError> {
        let out = &mut self.out;
        (|| -> std::io::Result<()> {
            out.write_i32::<NativeEndian>(record.integration as i32)?;
            out.write_i32::<NativeEndian>(record.baselines.len() as i32)?;
            out.write_i32::<NativeEndian>(record.uvw.len() as i32)?;
            out.write_i32::<NativeEndian>(record.stats.len() as i32)?;

            for uvw in &record.uvw {
                out.write_i32::<NativeEndian>(uvw.station)?;
                out.write_i32::<NativeEndian>(0)?;
                out.write_f64::<NativeEndian>(uvw.u)?;
                out.write_f64::<NativeEndian>(uvw.v)?;
                out.write_f64::<NativeEndian>(uvw.w)?;
            }

            for stats in &record.stats {
                out.write_all(&[
                    stats.station,
                    stats.channel_index,
                    stats.sideband,
                    stats.polarisation,
                ])?;
                for level in stats.levels {
                    out.write_i32::<NativeEndian>(level)?;
                }
                out.write_i32::<NativeEndian>(stats.n_invalid)?;
            }

            for baseline in &record.baselines {
                out.write_f32::<NativeEndian>(baseline.weight)?;
                out.write_all(&[
                    baseline.station1,
                    baseline.station2,
                    baseline.polarisation1,
                    baseline.polarisation2,
                    baseline.sideband,
                    baseline.channel_index,
                ])?;
                for v in &baseline.vis {
                    out.write_f32::<NativeEndian>(v.re)?;
                    out.write_f32::<NativeEndian>(v.im)?;
                }
            }
            Ok(())
        })()
        .map_err(|e| self.io_err(e))
    }

    pub(crate) fn finish(mut self) -> Result<(), VisWriteError> {
        self.out.flush().map_err(|e| VisWriteError::Io {
            path: self.path.clone(),
            source: e,
        })
    }
}

/// The output-node loop: receive finished timeslices from every worker,
/// restore task order, write. Returns a short completion message for the
/// log. Intended to run on its own thread beside the workers.
pub(crate) fn write_vis(
    path: &Path,
    header: &GlobalHeader,
    n_tasks: usize,
    rx: Receiver<TimesliceRecord>,
    error: &AtomicCell<bool>,
    progress: Option<ProgressBar>,
) -> Result<String, VisWriteError> {
    let mut writer = VisWriter::create(path)?;
    writer.write_global_header(header)?;

    let mut reorder: BTreeMap<usize, TimesliceRecord> = BTreeMap::new();
    let mut next_task = 0usize;
    let mut written = 0usize;

    for record in rx {
        if error.load() {
            debug!("output node stopping early");
            break;
        }
        trace!("received timeslice for task {}", record.task);
        reorder.insert(record.task, record);
        while let Some(record) = reorder.remove(&next_task) {
            writer.write_timeslice(&record)?;
            next_task += 1;
            written += 1;
            if let Some(bar) = &progress {
                bar.inc(1);
            }
        }
    }

    // Workers have hung up. Anything still buffered lost its predecessors;
    // keep the file ordered and write what arrived.
    for (_, record) in std::mem::take(&mut reorder) {
        writer.write_timeslice(&record)?;
        written += 1;
        if let Some(bar) = &progress {
            bar.inc(1);
        }
    }
    writer.finish()?;

    if let Some(bar) = &progress {
        bar.abandon_with_message("Visibilities written");
    }
    Ok(format!(
        "Wrote {written} of {n_tasks} timeslices to {}",
        path.display()
    ))
}

#[derive(Error, Debug)]
pub enum VisWriteError {
    #[error("Error writing visibility file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}
