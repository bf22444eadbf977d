// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Validated job parameters.
//!
//! A [`ControlFile`] is just what the user wrote; [`CorrelateParams`] is the
//! job the correlator will actually run. `from_control` applies the
//! defaulting rules, resolves dates and station names, loads the delay
//! tables and rejects every inconsistent combination before a single thread
//! is spawned. Everything downstream takes these parameters by reference
//! and never consults global state.

use std::path::PathBuf;
use std::sync::Arc;

use itertools::Itertools;
use log::{debug, info};
use vec1::Vec1;

use crate::config::{parse_file_uri, ConfigError, ControlFile};
use crate::context::{ChannelDef, DataFormat, Scan, Station};
use crate::corr::parameters::{ffts_per_integration, CorrelationParameters, StreamDef};
use crate::corr::window::WindowFunction;
use crate::delay::DelayTable;
use crate::time::{parse_date, Time};

/// The channels correlated together in one task: a single channel, or an
/// opposite-polarisation pair when cross-polarising.
#[derive(Debug, Clone)]
pub struct ChannelSet {
    /// Observation channel indices; `[main]` or `[main, partner]`.
    pub channels: Vec<usize>,
}

/// One unit of work: one integration of one channel set.
#[derive(Debug, Clone, Copy)]
pub struct SliceTask {
    /// Global index; fixes output order and worker assignment.
    pub task: usize,
    pub scan: usize,
    /// Global integration number, shared by every channel set of the same
    /// interval.
    pub integration: usize,
    pub channel_set: usize,
    pub start: Time,
}

#[derive(Debug)]
pub struct CorrelateParams {
    pub experiment: String,
    pub stations: Vec1<Station>,
    pub scans: Vec1<Scan>,
    /// The full observation channel list.
    pub channels: Vec<ChannelDef>,
    pub channel_sets: Vec<ChannelSet>,

    pub start: Time,
    pub stop: Time,
    pub integr_time: Time,
    pub sub_integr_time: Time,

    pub number_channels: usize,
    pub fft_size_delaycor: usize,
    pub fft_size_correlation: usize,
    pub window: WindowFunction,

    pub cross_polarize: bool,
    pub reference_station: Option<usize>,
    pub exit_on_empty: bool,
    pub n_workers: usize,

    pub output_file: PathBuf,
    /// One per station, in station order.
    pub delay_tables: Vec<Arc<DelayTable>>,
}

impl CorrelateParams {
    pub fn from_control(ctrl: ControlFile) -> Result<CorrelateParams, ConfigError> {
        let obs = &ctrl.observation;

        // Channel invariants first; everything else depends on them.
        for chan in &obs.channels {
            if chan.sample_rate == 0 || chan.sample_rate % 1_000_000 != 0 {
                return Err(ConfigError::BadSampleRate {
                    name: chan.name.clone(),
                    rate: chan.sample_rate,
                });
            }
            if !(1..=2).contains(&chan.bits_per_sample) {
                return Err(ConfigError::BadBitsPerSample {
                    name: chan.name.clone(),
                });
            }
            if 2.0 * chan.bandwidth > chan.sample_rate as f64 {
                return Err(ConfigError::BadBandwidth {
                    name: chan.name.clone(),
                });
            }
        }

        let scans = resolve_scans(&ctrl)?;
        let first_scan_start = scans.first().start;
        let last_scan_stop = scans.last().stop;

        let start = match ctrl.start.as_deref() {
            None => first_scan_start,
            Some("now") => Time::now(),
            Some(date) => parse_date(date)?,
        };
        let stop = match ctrl.stop.as_deref() {
            None | Some("end") => last_scan_stop,
            Some(date) => parse_date(date)?,
        };
        if stop <= start {
            return Err(ConfigError::StopBeforeStart);
        }

        let integr_time = Time::from_seconds(
            ctrl.integr_time
                .ok_or(ConfigError::Missing("integr_time"))?,
        );
        if integr_time <= Time::ZERO {
            return Err(ConfigError::BadIntegrationTime);
        }
        let sub_integr_time = match ctrl.sub_integr_time {
            Some(sub) => {
                let sub = Time::from_seconds(sub);
                if sub <= Time::ZERO || !integr_time.is_multiple_of(sub) {
                    return Err(ConfigError::BadSubIntegration);
                }
                sub
            }
            None => integr_time,
        };

        // FFT sizes and spectral resolution, with the historical defaulting
        // order: number_channels, then the correlation size, then the
        // delay-correction size.
        let number_channels = ctrl.number_channels.unwrap_or(256);
        let fft_size_correlation = ctrl
            .fft_size_correlation
            .unwrap_or_else(|| number_channels.max(256));
        let fft_size_delaycor = ctrl
            .fft_size_delaycor
            .unwrap_or_else(|| fft_size_correlation.min(256));
        for (name, size) in [
            ("fft_size_delaycor", fft_size_delaycor),
            ("fft_size_correlation", fft_size_correlation),
            ("number_channels", number_channels),
        ] {
            if !size.is_power_of_two() {
                return Err(ConfigError::NotPowerOfTwo { name });
            }
        }
        if fft_size_correlation < fft_size_delaycor {
            return Err(ConfigError::FftSizesInverted);
        }
        if fft_size_correlation < number_channels {
            return Err(ConfigError::FftSmallerThanChannels);
        }
        if fft_size_correlation % number_channels != 0 {
            return Err(ConfigError::ChannelsDoNotDivide);
        }

        let stations = resolve_stations(&ctrl)?;
        let reference_station = match ctrl.reference_station.as_deref() {
            None | Some("") => None,
            Some(name) => Some(
                stations
                    .iter()
                    .position(|s| s.name == name)
                    .ok_or_else(|| ConfigError::UnknownStation(name.to_string()))?,
            ),
        };

        let channel_sets = resolve_channel_sets(&ctrl)?;

        // Every stream of a correlation must agree on the signal geometry.
        let selected: Vec<&ChannelDef> = channel_sets
            .iter()
            .flat_map(|set| set.channels.iter().map(|&c| &obs.channels[c]))
            .collect();
        let head = selected.first().expect("at least one channel set");
        if selected.iter().any(|c| {
            c.sample_rate != head.sample_rate
                || c.bandwidth != head.bandwidth
                || c.bits_per_sample != head.bits_per_sample
        }) {
            return Err(ConfigError::MixedBandwidth);
        }
        let sample_rate = head.sample_rate;

        let slice_samples = integr_time.samples(sample_rate);
        if slice_samples < fft_size_correlation as i64 {
            return Err(ConfigError::IntegrationTooShort);
        }
        if slice_samples % (2 * fft_size_correlation as i64) != 0 {
            return Err(ConfigError::SliceNotAligned);
        }

        let output_file =
            parse_file_uri(ctrl.output_file.as_deref().ok_or(ConfigError::Missing("output_file"))?)?;

        // Delay tables are loaded up front; a missing model is fatal before
        // any worker starts.
        let mut delay_tables = Vec::with_capacity(stations.len());
        for station in &stations {
            let table = Arc::new(DelayTable::from_path(&station.delay_file)?);
            for t in [start.max(first_scan_start), stop.min(last_scan_stop)] {
                if !table.covers(t) {
                    return Err(ConfigError::DelaySpan {
                        station: station.name.clone(),
                        time: t.to_string(),
                    });
                }
            }
            delay_tables.push(table);
        }

        let n_workers = ctrl.n_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });

        let params = CorrelateParams {
            experiment: obs.experiment.clone(),
            stations,
            scans,
            channels: obs.channels.clone(),
            channel_sets,
            start,
            stop,
            integr_time,
            sub_integr_time,
            number_channels,
            fft_size_delaycor,
            fft_size_correlation,
            window: ctrl.window_function.unwrap_or_default(),
            cross_polarize: ctrl.cross_polarize,
            reference_station,
            exit_on_empty: ctrl.exit_on_empty_datastream.unwrap_or(true),
            n_workers: n_workers.max(1),
            output_file,
            delay_tables,
        };
        debug!(
            "validated job: {} stations, {} channel sets, {} tasks",
            params.stations.len(),
            params.channel_sets.len(),
            params.work_plan().len()
        );
        Ok(params)
    }

    pub fn sample_rate(&self) -> u64 {
        self.channels[self.channel_sets[0].channels[0]].sample_rate
    }

    pub fn slice_samples(&self) -> usize {
        self.integr_time.samples(self.sample_rate()) as usize
    }

    /// Every slice task of the job, in canonical (scan, integration,
    /// channel set) order.
    pub fn work_plan(&self) -> Vec<SliceTask> {
        let mut tasks = Vec::new();
        let mut integration = 0usize;
        for (scan_idx, scan) in self.scans.iter().enumerate() {
            let begin = scan.start.max(self.start);
            let end = scan.stop.min(self.stop);
            if end <= begin {
                continue;
            }
            let n_int = (end - begin).div_floor(self.integr_time);
            for i in 0..n_int {
                let start = begin + self.integr_time * i;
                for set in 0..self.channel_sets.len() {
                    tasks.push(SliceTask {
                        task: tasks.len(),
                        scan: scan_idx,
                        integration,
                        channel_set: set,
                        start,
                    });
                }
                integration += 1;
            }
        }
        tasks
    }

    /// The fixed parameters of one channel set's correlations.
    pub fn correlation_parameters(&self, set_idx: usize) -> Arc<CorrelationParameters> {
        let set = &self.channel_sets[set_idx];
        let main = &self.channels[set.channels[0]];

        let mut streams = Vec::new();
        for &channel in &set.channels {
            let def = &self.channels[channel];
            for (station, st) in self.stations.iter().enumerate() {
                streams.push(StreamDef {
                    station,
                    channel,
                    polarisation: def.polarisation,
                    lo_offset: st.lo_offset,
                });
            }
        }

        Arc::new(CorrelationParameters {
            fft_size_delaycor: self.fft_size_delaycor,
            fft_size_correlation: self.fft_size_correlation,
            number_channels: self.number_channels,
            window: self.window,
            sample_rate: main.sample_rate,
            bandwidth: main.bandwidth,
            sideband: main.sideband,
            channel_freq: main.sky_freq,
            channel_index: set.channels[0] as u8,
            bits_per_sample: main.bits_per_sample,
            integration_time: self.integr_time,
            sub_integration_time: self.sub_integr_time,
            streams,
            cross_polarize: self.cross_polarize,
            reference_station: self.reference_station,
        })
    }

    pub fn ffts_per_integration(&self) -> usize {
        ffts_per_integration(
            self.integr_time,
            self.sample_rate(),
            self.fft_size_correlation,
        )
    }

    /// Log a short job summary: print what was understood before doing
    /// anything irreversible.
    pub fn log_summary(&self) {
        info!("experiment {}", self.experiment);
        info!(
            "correlating {} to {} in {} s integrations",
            self.start,
            self.stop,
            self.integr_time.seconds()
        );
        info!(
            "stations: {}",
            self.stations.iter().map(|s| s.name.as_str()).join(", ")
        );
        info!(
            "{} channel sets, {} spectral points, window {}",
            self.channel_sets.len(),
            self.number_channels,
            self.window
        );
        if let Some(r) = self.reference_station {
            info!("reference station {}", self.stations[r].name);
        }
        info!(
            "FFT sizes: delay correction {}, correlation {}",
            self.fft_size_delaycor, self.fft_size_correlation
        );
        info!("output file {}", self.output_file.display());
    }
}

fn resolve_scans(ctrl: &ControlFile) -> Result<Vec1<Scan>, ConfigError> {
    let mut scans = Vec::with_capacity(ctrl.observation.scans.len());
    for entry in &ctrl.observation.scans {
        let start = parse_date(&entry.start)?;
        let stop = parse_date(&entry.stop)?;
        if stop <= start {
            return Err(ConfigError::StopBeforeStart);
        }
        scans.push(Scan {
            name: entry.name.clone(),
            start,
            stop,
        });
    }
    scans.sort_by_key(|s| s.start);
    Vec1::try_from_vec(scans).map_err(|_| ConfigError::NoScans)
}

fn resolve_stations(ctrl: &ControlFile) -> Result<Vec1<Station>, ConfigError> {
    if ctrl.stations.is_empty() {
        return Err(ConfigError::Missing("stations"));
    }
    let mut stations = Vec::with_capacity(ctrl.stations.len());
    for name in &ctrl.stations {
        let uris = ctrl
            .data_sources
            .get(name)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::NoDataSources(name.clone()))?;
        let sources = uris
            .iter()
            .map(|uri| parse_file_uri(uri))
            .collect::<Result<Vec<PathBuf>, _>>()?;
        let delay_file = ctrl
            .delay_files
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::NoDelayFile(name.clone()))?;
        stations.push(Station {
            name: name.clone(),
            sources,
            delay_file,
            format: ctrl
                .observation
                .formats
                .get(name)
                .copied()
                .unwrap_or(DataFormat::Vdif),
            lo_offset: ctrl.lo_offset.get(name).copied().unwrap_or(0.0),
        });
    }
    // Keys that name no known station are silent typos; refuse them.
    for key in ctrl.data_sources.keys().chain(ctrl.lo_offset.keys()) {
        if !ctrl.stations.contains(key) {
            return Err(ConfigError::UnknownStation(key.clone()));
        }
    }
    Ok(Vec1::try_from_vec(stations).expect("checked non-empty"))
}

fn resolve_channel_sets(ctrl: &ControlFile) -> Result<Vec<ChannelSet>, ConfigError> {
    let channels = &ctrl.observation.channels;
    let selected: Vec<usize> = match &ctrl.channels {
        Some(names) => {
            let mut indices = Vec::with_capacity(names.len());
            for name in names {
                indices.push(
                    channels
                        .iter()
                        .position(|c| &c.name == name)
                        .ok_or_else(|| ConfigError::UnknownChannel(name.clone()))?,
                );
            }
            indices
        }
        None => (0..channels.len()).collect(),
    };
    if selected.is_empty() {
        return Err(ConfigError::Missing("channels"));
    }

    if !ctrl.cross_polarize {
        return Ok(selected
            .into_iter()
            .map(|c| ChannelSet { channels: vec![c] })
            .collect());
    }

    // Pair every selected channel with its opposite-polarisation twin; each
    // pair becomes one set, listed once.
    let mut sets = Vec::new();
    for &c in &selected {
        let def = &channels[c];
        let partner = channels
            .iter()
            .position(|p| {
                p.polarisation == def.polarisation.opposite()
                    && p.sky_freq == def.sky_freq
                    && p.bandwidth == def.bandwidth
                    && p.sideband == def.sideband
            })
            .ok_or_else(|| ConfigError::NoPolarisationPartner(def.name.clone()))?;
        if partner > c || !selected.contains(&partner) {
            sets.push(ChannelSet {
                channels: vec![c, partner],
            });
        }
    }
    Ok(sets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Polarisation, Sideband};
    use crate::delay::DelayEntry;

    fn write_delay_file(dir: &std::path::Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let t0 = Time::from_date(2006, 123, 6, 29, 0);
        let entries: Vec<DelayEntry> = (0..8)
            .map(|i| DelayEntry {
                time: t0 + Time::from_seconds(i as f64 * 60.0),
                u: 0.0,
                v: 0.0,
                w: 0.0,
                delay: 1e-6 * i as f64,
                phase: 0.0,
                amplitude: 1.0,
            })
            .collect();
        DelayTable::write_entries(&path, &entries).unwrap();
        path
    }

    fn base_control(dir: &std::path::Path) -> ControlFile {
        let ef_del = write_delay_file(dir, "ef.del");
        let wb_del = write_delay_file(dir, "wb.del");
        let text = format!(
            r#"{{
            "stations": ["Ef", "Wb"],
            "data_sources": {{ "Ef": ["file:///data/ef.vdif"],
                               "Wb": ["file:///data/wb.vdif"] }},
            "delay_files": {{ "Ef": "{}", "Wb": "{}" }},
            "output_file": "file:///tmp/out.cor",
            "integr_time": 1.0,
            "number_channels": 32,
            "fft_size_correlation": 32,
            "fft_size_delaycor": 32,
            "observation": {{
                "experiment": "N06C2",
                "scans": [ {{ "name": "No0001",
                             "start": "2006y123d06h30m00s",
                             "stop": "2006y123d06h32m00s" }} ],
                "channels": [
                    {{ "name": "CH01", "sky_freq": 4.974e9, "bandwidth": 1000000.0,
                       "sideband": "upper", "polarisation": "R",
                       "sample_rate": 2000000, "bits_per_sample": 2 }},
                    {{ "name": "CH02", "sky_freq": 4.974e9, "bandwidth": 1000000.0,
                       "sideband": "upper", "polarisation": "L",
                       "sample_rate": 2000000, "bits_per_sample": 2 }}
                ]
            }}
        }}"#,
            ef_del.display(),
            wb_del.display()
        );
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn defaults_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = base_control(dir.path());
        ctrl.number_channels = Some(64);
        ctrl.fft_size_correlation = None;
        ctrl.fft_size_delaycor = None;
        // 1.024 s keeps the slice a whole number of 512-sample blocks.
        ctrl.integr_time = Some(1.024);
        let params = CorrelateParams::from_control(ctrl).unwrap();
        assert_eq!(params.number_channels, 64);
        assert_eq!(params.fft_size_correlation, 256);
        assert_eq!(params.fft_size_delaycor, 256);
        assert_eq!(params.window, WindowFunction::None);
        assert!(params.exit_on_empty);
        assert_eq!(params.sub_integr_time, params.integr_time);
        assert_eq!(params.start, Time::from_date(2006, 123, 6, 30, 0));
        assert_eq!(params.stop, Time::from_date(2006, 123, 6, 32, 0));
    }

    #[test]
    fn work_plan_enumerates_integrations_and_sets() {
        let dir = tempfile::tempdir().unwrap();
        let params = CorrelateParams::from_control(base_control(dir.path())).unwrap();
        let plan = params.work_plan();
        // 120 s scan, 1 s integrations, 2 single-channel sets.
        assert_eq!(plan.len(), 240);
        assert_eq!(plan[0].channel_set, 0);
        assert_eq!(plan[1].channel_set, 1);
        assert_eq!(plan[0].integration, 0);
        assert_eq!(plan[1].integration, 0);
        assert_eq!(plan[2].integration, 1);
        assert_eq!(plan[3].start, params.start + params.integr_time);
        assert!(plan.iter().enumerate().all(|(i, t)| t.task == i));
    }

    #[test]
    fn cross_polarise_pairs_channels() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = base_control(dir.path());
        ctrl.cross_polarize = true;
        let params = CorrelateParams::from_control(ctrl).unwrap();
        assert_eq!(params.channel_sets.len(), 1);
        assert_eq!(params.channel_sets[0].channels, vec![0, 1]);

        // Streams: both stations in hand A, then both in hand B.
        let cp = params.correlation_parameters(0);
        assert_eq!(cp.n_streams(), 4);
        assert_eq!(cp.streams[0].polarisation, Polarisation::R);
        assert_eq!(cp.streams[1].polarisation, Polarisation::R);
        assert_eq!(cp.streams[2].polarisation, Polarisation::L);
        assert_eq!(cp.streams[3].polarisation, Polarisation::L);
        assert_eq!(cp.streams[0].station, 0);
        assert_eq!(cp.streams[2].station, 0);
    }

    #[test]
    fn cross_polarise_needs_a_partner() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = base_control(dir.path());
        ctrl.cross_polarize = true;
        ctrl.observation.channels[1].polarisation = Polarisation::R;
        assert!(matches!(
            CorrelateParams::from_control(ctrl),
            Err(ConfigError::NoPolarisationPartner(_))
        ));
    }

    #[test]
    fn validation_rejects_bad_combinations() {
        let dir = tempfile::tempdir().unwrap();

        let mut ctrl = base_control(dir.path());
        ctrl.fft_size_correlation = Some(300);
        assert!(matches!(
            CorrelateParams::from_control(ctrl),
            Err(ConfigError::NotPowerOfTwo { .. })
        ));

        let mut ctrl = base_control(dir.path());
        ctrl.sub_integr_time = Some(0.3);
        assert!(matches!(
            CorrelateParams::from_control(ctrl),
            Err(ConfigError::BadSubIntegration)
        ));

        let mut ctrl = base_control(dir.path());
        ctrl.fft_size_correlation = Some(128);
        ctrl.fft_size_delaycor = Some(256);
        assert!(matches!(
            CorrelateParams::from_control(ctrl),
            Err(ConfigError::FftSizesInverted)
        ));

        let mut ctrl = base_control(dir.path());
        ctrl.reference_station = Some("Xx".to_string());
        assert!(matches!(
            CorrelateParams::from_control(ctrl),
            Err(ConfigError::UnknownStation(_))
        ));

        let mut ctrl = base_control(dir.path());
        ctrl.channels = Some(vec!["CH99".to_string()]);
        assert!(matches!(
            CorrelateParams::from_control(ctrl),
            Err(ConfigError::UnknownChannel(_))
        ));

        let mut ctrl = base_control(dir.path());
        ctrl.observation.channels[0].bits_per_sample = 4;
        assert!(matches!(
            CorrelateParams::from_control(ctrl),
            Err(ConfigError::BadBitsPerSample { .. })
        ));

        let mut ctrl = base_control(dir.path());
        ctrl.observation.channels[0].bandwidth = 1_000_001.0;
        assert!(matches!(
            CorrelateParams::from_control(ctrl),
            Err(ConfigError::BadBandwidth { .. })
        ));

        let mut ctrl = base_control(dir.path());
        ctrl.integr_time = Some(0.7e-3);
        assert!(matches!(
            CorrelateParams::from_control(ctrl),
            Err(ConfigError::SliceNotAligned)
        ));
    }

    #[test]
    fn delay_span_must_cover_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = base_control(dir.path());
        // The scan runs past the eight delay-table minutes.
        ctrl.observation.scans[0].stop = "2006y123d07h30m00s".to_string();
        assert!(matches!(
            CorrelateParams::from_control(ctrl),
            Err(ConfigError::DelaySpan { .. })
        ));
    }

    #[test]
    fn reference_station_resolves_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = base_control(dir.path());
        ctrl.reference_station = Some("Wb".to_string());
        let params = CorrelateParams::from_control(ctrl).unwrap();
        assert_eq!(params.reference_station, Some(1));
        assert_eq!(params.stations[0].name, "Ef");
    }

    #[test]
    fn sideband_and_channel_index_reach_the_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = base_control(dir.path());
        ctrl.observation.channels[1].sideband = Sideband::Lower;
        ctrl.channels = Some(vec!["CH02".to_string()]);
        let params = CorrelateParams::from_control(ctrl).unwrap();
        let cp = params.correlation_parameters(0);
        assert_eq!(cp.sideband, Sideband::Lower);
        assert_eq!(cp.channel_index, 1);
        assert_eq!(cp.ffts_per_integration(), 2_000_000 / 32);
    }
}
