// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Driving a correlation job.
//!
//! The controller turns validated parameters into a running pipeline: one
//! input thread per station, `n_workers` correlator threads, one output
//! thread, all scoped, all talking over bounded channels. Slice tasks are
//! dealt round-robin to the workers; per (sender, receiver) pair the
//! channels are FIFO, which gives every stream its in-order delivery. A
//! shared abort flag plus channel hang-ups tear the pipeline down on the
//! first error; the thread that failed reports it through its join handle.

use std::thread::{self, ScopedJoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use crossbeam_utils::atomic::AtomicCell;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info};
use scopeguard::defer_on_unwind;
use thiserror::Error;

use crate::corr::correlation::{TimesliceRecord, UvwEntry};
use crate::corr::{run_slice, CoreError, CorrelationCore, DelayCorrection, SliceData};
use crate::delay::DelayError;
use crate::fft::FftPlans;
use crate::input::{FrameReader, InputError, InputNode, SliceAssignment};
use crate::io::write::{write_vis, GlobalHeader, VisWriteError};
use crate::params::{CorrelateParams, SliceTask};
use crate::pool::Pool;

/// Pipelining slack per (worker, stream) queue: one slice in work plus two
/// in flight.
const SLICE_QUEUE_DEPTH: usize = 3;

pub fn correlate(params: &CorrelateParams) -> Result<(), CorrelateError> {
    let plan = params.work_plan();
    if plan.is_empty() {
        return Err(CorrelateError::EmptyPlan);
    }
    let n_workers = params.n_workers.min(plan.len());
    let set_params: Vec<_> = (0..params.channel_sets.len())
        .map(|set| params.correlation_parameters(set))
        .collect();
    let n_streams = set_params[0].n_streams();
    info!(
        "{} slice tasks over {} workers, {} streams each",
        plan.len(),
        n_workers,
        n_streams
    );

    // One bounded queue per (worker, stream), one shared output queue.
    let mut slice_txs: Vec<Vec<Sender<SliceData>>> = Vec::with_capacity(n_workers);
    let mut slice_rxs: Vec<Vec<Receiver<SliceData>>> = Vec::with_capacity(n_workers);
    for _ in 0..n_workers {
        let (txs, rxs): (Vec<_>, Vec<_>) =
            (0..n_streams).map(|_| bounded(SLICE_QUEUE_DEPTH)).unzip();
        slice_txs.push(txs);
        slice_rxs.push(rxs);
    }
    let (record_tx, record_rx) = bounded::<TimesliceRecord>(2 * n_workers);

    // Per-station slice assignments, and the frame readers. Opening the
    // recordings here keeps unreadable-input failures ahead of any thread.
    let mut nodes = Vec::new();
    for (station_idx, station) in params.stations.iter().enumerate() {
        let mut assignments = Vec::new();
        for task in &plan {
            let cp = &set_params[task.channel_set];
            let worker = task.task % n_workers;
            for (stream_idx, stream) in cp.streams.iter().enumerate() {
                if stream.station == station_idx {
                    assignments.push(SliceAssignment {
                        task: task.task,
                        start: task.start,
                        stream: stream_idx,
                        channel: stream.channel,
                        tx: slice_txs[worker][stream_idx].clone(),
                    });
                }
            }
        }
        let reader = FrameReader::open(
            station,
            params.sample_rate(),
            params.channels[params.channel_sets[0].channels[0]].bits_per_sample,
            (0..params.channels.len()).collect(),
            params.start,
        )?;
        nodes.push(InputNode::new(
            station.name.clone(),
            reader,
            assignments,
            params.slice_samples(),
            params.sample_rate(),
            params.channels[params.channel_sets[0].channels[0]].bits_per_sample,
            params.exit_on_empty,
        ));
    }
    // The input nodes now hold the only senders; a finished node hangs up
    // its workers' queues.
    drop(slice_txs);

    let mut worker_tasks: Vec<Vec<SliceTask>> = vec![Vec::new(); n_workers];
    for task in &plan {
        worker_tasks[task.task % n_workers].push(*task);
    }

    let progress = ProgressBar::with_draw_target(
        Some(plan.len() as u64),
        if crate::PROGRESS_BARS.load() {
            ProgressDrawTarget::stdout()
        } else {
            ProgressDrawTarget::hidden()
        },
    )
    .with_style(
        ProgressStyle::default_bar()
            .template("{msg:13}: [{wide_bar:.blue}] {pos}/{len} timeslices ({elapsed_precise}<{eta_precise})")
            .unwrap()
            .progress_chars("=> "),
    )
    .with_message("Correlating");

    let header = GlobalHeader {
        experiment: params.experiment.clone(),
        start: params.start,
        number_channels: params.number_channels,
        integration_time: params.integr_time,
        n_stations: params.stations.len(),
    };

    let error = AtomicCell::new(false);
    let message = thread::scope(|scope| -> Result<String, CorrelateError> {
        let mut input_handles: Vec<ScopedJoinHandle<Result<(), InputError>>> = Vec::new();
        for node in nodes {
            let error = &error;
            let name = format!("input-{}", input_handles.len());
            let handle = thread::Builder::new()
                .name(name)
                .spawn_scoped(scope, move || {
                    defer_on_unwind! { error.store(true); }
                    let result = node.run();
                    if result.is_err() {
                        error.store(true);
                    }
                    result
                })
                .expect("OS can create threads");
            input_handles.push(handle);
        }

        let mut worker_handles: Vec<ScopedJoinHandle<Result<(), CorrelateError>>> = Vec::new();
        for (worker, (tasks, rxs)) in worker_tasks
            .into_iter()
            .zip(slice_rxs.into_iter())
            .enumerate()
        {
            let error = &error;
            let set_params = set_params.clone();
            let record_tx = record_tx.clone();
            let params_ref = params;
            let handle = thread::Builder::new()
                .name(format!("corr-{worker}"))
                .spawn_scoped(scope, move || {
                    defer_on_unwind! { error.store(true); }
                    let result =
                        worker_loop(params_ref, &set_params, tasks, rxs, record_tx, error);
                    if result.is_err() {
                        error.store(true);
                    }
                    result
                })
                .expect("OS can create threads");
            worker_handles.push(handle);
        }
        drop(record_tx);

        let writer_handle: ScopedJoinHandle<Result<String, VisWriteError>> = {
            let error = &error;
            let header = &header;
            let n_tasks = plan.len();
            let progress = progress.clone();
            thread::Builder::new()
                .name("output".to_string())
                .spawn_scoped(scope, move || {
                    defer_on_unwind! { error.store(true); }
                    let result = write_vis(
                        &params.output_file,
                        header,
                        n_tasks,
                        record_rx,
                        error,
                        Some(progress),
                    );
                    if result.is_err() {
                        error.store(true);
                    }
                    result
                })
                .expect("OS can create threads")
        };

        for handle in input_handles {
            handle.join().expect("input thread did not panic")?;
        }
        for handle in worker_handles {
            handle.join().expect("worker thread did not panic")?;
        }
        let message = writer_handle.join().expect("output thread did not panic")?;
        Ok(message)
    })?;

    info!("{message}");
    Ok(())
}

/// One correlator worker: for each assigned task, receive a slice per
/// stream, then drive the delay and correlation tasklets cooperatively
/// until the integration's record is out the door.
fn worker_loop(
    params: &CorrelateParams,
    set_params: &[std::sync::Arc<crate::corr::parameters::CorrelationParameters>],
    tasks: Vec<SliceTask>,
    rxs: Vec<Receiver<SliceData>>,
    record_tx: Sender<TimesliceRecord>,
    error: &AtomicCell<bool>,
) -> Result<(), CorrelateError> {
    let m = params.fft_size_correlation;
    let n_streams = set_params[0].n_streams();
    // Plans and the spectrum pool live for the whole worker; tasklets are
    // rebuilt per slice around them.
    let fft = FftPlans::new(params.fft_size_delaycor, m);
    let pool: Pool<num_complex::Complex32> = Pool::new(m + 1, n_streams * 16);

    for task in tasks {
        if error.load() {
            return Ok(());
        }

        let mut slices = Vec::with_capacity(n_streams);
        for rx in &rxs {
            match rx.recv() {
                Ok(slice) => slices.push(slice),
                // Input node gone: the job is being torn down elsewhere.
                Err(_) => return Ok(()),
            }
        }
        debug_assert!(slices.iter().all(|s| s.task == task.task));
        debug!(
            "worker {:?}: task {} (integration {}, set {})",
            thread::current().name(),
            task.task,
            task.integration,
            task.channel_set
        );

        let cp = set_params[task.channel_set].clone();
        let mid = task.start + params.integr_time / 2;
        let uvw = params
            .stations
            .iter()
            .enumerate()
            .map(|(station, _)| {
                let [u, v, w] = params.delay_tables[station].uvw(mid)?;
                Ok(UvwEntry {
                    station: station as i32,
                    u,
                    v,
                    w,
                })
            })
            .collect::<Result<Vec<_>, DelayError>>()
            .map_err(CoreError::from)?;
        let stats = slices.iter().map(|s| s.stats).collect();

        let mut delay_cores: Vec<DelayCorrection> = cp
            .streams
            .iter()
            .enumerate()
            .map(|(stream_idx, stream)| {
                DelayCorrection::new(
                    stream_idx,
                    cp.clone(),
                    params.delay_tables[stream.station].clone(),
                    fft.clone(),
                    pool.clone(),
                )
            })
            .collect();
        for (core, slice) in delay_cores.iter_mut().zip(slices) {
            core.feed(slice);
        }

        let mut correlation = CorrelationCore::new(cp);
        correlation.begin_integration(task.task, task.integration, task.start, stats, uvw);

        let record = run_slice(&mut delay_cores, &mut correlation)?;
        if record_tx.send(record).is_err() {
            return Ok(());
        }
    }
    Ok(())
}

#[derive(Error, Debug)]
pub enum CorrelateError {
    #[error("No integrations fall within the configured interval")]
    EmptyPlan,

    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    VisWrite(#[from] VisWriteError),
}
