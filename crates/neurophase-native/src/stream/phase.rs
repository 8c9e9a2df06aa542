//! Instantaneous phase/magnitude pipeline
//!
//! The host's real-time callback pushes filtered samples into per-channel
//! history buffers and, once the background thread has fitted an AR model,
//! writes causal phase/magnitude estimates into the output block. History
//! snapshots travel to the background thread and coefficient snapshots
//! travel back exclusively through the triple-buffer primitive; the
//! callback never blocks and never allocates.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use neurophase_core::error::{ConfigError, ConfigResult};
use neurophase_core::sync::{AtomicallyShared, Reader, Writer};
use neurophase_core::types::{ChannelState, OutputMode, StreamParameter};

use super::events::{EventQueues, PhaseEvent};
use super::host::HostInterface;
use super::worker::ComputeWorker;
use super::{StreamError, StreamResult};
use crate::processing::ar::ArModeler;
use crate::processing::filters::BandpassFilter;
use crate::processing::hilbert::{
    circular_lerp_deg, smooth_buffer, unwrap_buffer, HilbertPhaseEngine, HilbertState, HT_FS,
};

/// Smallest allowed gap between the low and high cutoffs, in Hz.
const PASSBAND_EPS: f64 = 0.01;

/// Oldest event timestamp still worth a phase computation, in seconds
/// behind the stream head.
const VIS_MAX_DELAY_S: f64 = 0.5;

/// Youngest computable event timestamp, in seconds behind the stream head;
/// the analytic estimate needs signal on both sides of the instant.
const VIS_MIN_DELAY_S: f64 = 0.05;

/// Configuration of the phase pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Background recalculation interval, in milliseconds
    pub recalc_interval_ms: u32,
    /// AR model order
    pub ar_order: usize,
    /// Bandpass low cutoff, in Hz
    pub low_cut_hz: f64,
    /// Bandpass high cutoff, in Hz
    pub high_cut_hz: f64,
    /// Output buffer contents
    pub output: OutputMode,
    /// Channel monitored for TTL phase events, if any
    pub vis_channel: Option<usize>,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            recalc_interval_ms: 50,
            ar_order: 20,
            low_cut_hz: 4.0,
            high_cut_hz: 8.0,
            output: OutputMode::Phase,
            vis_channel: None,
        }
    }
}

/// One channel's slice of a host callback.
pub struct ChannelBlock<'a> {
    /// In/out samples: raw input on entry, the selected output on exit
    pub samples: &'a mut [f32],
    /// Output for the magnitude stream in
    /// [`OutputMode::PhaseAndMagnitude`], ignored otherwise
    pub magnitude: Option<&'a mut [f32]>,
}

/// Interpolation endpoints for one computed analytic sample.
#[derive(Clone, Copy, Debug)]
struct AnalyticPoint {
    phase_deg: f32,
    magnitude: f32,
    imaginary: f32,
}

/// Producer-side state for one active channel.
struct ChannelArena {
    host_channel: usize,
    sample_rate_hz: f64,
    /// Decimation factor between the channel rate and the transformer rate
    ds_factor: usize,
    filter: BandpassFilter,
    /// Authoritative history of the most recent samples, promoted to f64
    history: Vec<f64>,
    free_space: usize,
    state: Arc<AtomicU8>,
    history_writer: Writer<Vec<f64>>,
    params_reader: Reader<Vec<f64>>,
    /// Local copy of the AR snapshot used within one callback
    params_local: Vec<f64>,
    hilbert_state: HilbertState,
    /// Decimated history tail handed to the predictor
    dec_scratch: Vec<f64>,
    /// Samples since the last analytic point, cycling through `ds_factor`
    ds_offset: usize,
    prev_point: Option<AnalyticPoint>,
    prev_prev_point: Option<AnalyticPoint>,
    /// Final output value of the previous block, for unwrap/smooth
    last_phase: f32,
    /// Stream position one past the last processed sample
    sample_count: u64,
    overflow_warned: bool,
}

/// Background-side state for one active channel.
struct WorkerChannel {
    history_reader: Reader<Vec<f64>>,
    params_writer: Writer<Vec<f64>>,
    state: Arc<AtomicU8>,
    modeler: ArModeler,
    coef: Vec<f64>,
}

const STATE_NOT_FULL: u8 = 0;
const STATE_FULL_NO_AR: u8 = 1;
const STATE_FULL_AR: u8 = 2;

fn decode_state(raw: u8) -> ChannelState {
    match raw {
        STATE_FULL_NO_AR => ChannelState::FullNoAr,
        STATE_FULL_AR => ChannelState::FullAr,
        _ => ChannelState::NotFull,
    }
}

/// The phase pipeline orchestrator.
pub struct PhaseStream {
    cfg: PhaseConfig,
    host: Arc<dyn HostInterface>,
    engine: HilbertPhaseEngine,
    history_len: usize,
    channels: Vec<ChannelArena>,
    worker: Option<ComputeWorker>,
    events: Arc<EventQueues>,
    vis_fft: Option<(Arc<dyn Fft<f64>>, Arc<dyn Fft<f64>>)>,
    vis_buf: Vec<Complex<f64>>,
    vis_scratch: Vec<Complex<f64>>,
}

impl PhaseStream {
    /// Create a stopped pipeline.
    ///
    /// # Errors
    ///
    /// Fails if the passband is not covered by any transformer band or the
    /// AR order is zero.
    pub fn new(cfg: PhaseConfig, host: Arc<dyn HostInterface>) -> ConfigResult<Self> {
        if cfg.ar_order == 0 {
            return Err(ConfigError::InvalidArOrder {
                order: 0,
                required: 1,
                available: 0,
            });
        }
        let engine = HilbertPhaseEngine::new(cfg.low_cut_hz, cfg.high_cut_hz)?;
        Ok(Self {
            cfg,
            host,
            engine,
            history_len: 0,
            channels: Vec::new(),
            worker: None,
            events: Arc::new(EventQueues::default()),
            vis_fft: None,
            vis_buf: Vec::new(),
            vis_scratch: Vec::new(),
        })
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &PhaseConfig {
        &self.cfg
    }

    /// Whether the pipeline is currently streaming.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Event plumbing shared with the host.
    #[must_use]
    pub fn events(&self) -> Arc<EventQueues> {
        Arc::clone(&self.events)
    }

    /// Readiness of each active channel, in processing order.
    #[must_use]
    pub fn channel_states(&self) -> Vec<ChannelState> {
        self.channels
            .iter()
            .map(|arena| decode_state(arena.state.load(Ordering::Acquire)))
            .collect()
    }

    /// Apply a parameter change pushed from the host.
    ///
    /// The recalculation interval applies live; structural parameters
    /// require a stopped stream. Parameters that belong to the coherence
    /// pipeline are ignored.
    ///
    /// # Errors
    ///
    /// [`StreamError::Running`] for a structural change while streaming, or
    /// a [`ConfigError`] if the new value is rejected.
    pub fn set_parameter(&mut self, parameter: StreamParameter) -> StreamResult<()> {
        match parameter {
            StreamParameter::RecalcIntervalMs(ms) => {
                self.cfg.recalc_interval_ms = ms;
                if let Some(worker) = &self.worker {
                    worker.set_interval_ms(ms);
                }
            }
            StreamParameter::ArOrder(order) => {
                self.require_stopped()?;
                if order == 0 {
                    return Err(ConfigError::InvalidArOrder {
                        order,
                        required: 1,
                        available: 0,
                    }
                    .into());
                }
                self.cfg.ar_order = order;
            }
            StreamParameter::LowCut(low) => {
                self.require_stopped()?;
                self.cfg.low_cut_hz = low;
                if low >= self.cfg.high_cut_hz {
                    self.cfg.high_cut_hz = low + PASSBAND_EPS;
                }
                self.engine =
                    HilbertPhaseEngine::new(self.cfg.low_cut_hz, self.cfg.high_cut_hz)?;
            }
            StreamParameter::HighCut(high) => {
                self.require_stopped()?;
                self.cfg.high_cut_hz = high;
                if high <= self.cfg.low_cut_hz {
                    self.cfg.low_cut_hz = high - PASSBAND_EPS;
                }
                self.engine =
                    HilbertPhaseEngine::new(self.cfg.low_cut_hz, self.cfg.high_cut_hz)?;
            }
            StreamParameter::Output(mode) => {
                self.require_stopped()?;
                self.cfg.output = mode;
            }
            other => {
                debug!(target: "neurophase::phase", ?other, "ignoring parameter");
            }
        }
        Ok(())
    }

    fn require_stopped(&self) -> StreamResult<()> {
        if self.is_running() {
            Err(StreamError::Running)
        } else {
            Ok(())
        }
    }

    /// Begin streaming: build per-channel state from the host's active
    /// channel list and spawn the background model-fitting thread.
    ///
    /// Channels whose sample rate is not an integer multiple of the
    /// transformer rate are skipped with a status warning.
    ///
    /// # Errors
    ///
    /// [`StreamError::Running`] if already started,
    /// [`StreamError::NoUsableChannels`] if every channel was rejected.
    pub fn start(&mut self) -> StreamResult<()> {
        if self.is_running() {
            return Err(StreamError::Running);
        }

        let mut validated = Vec::new();
        for channel in self.host.active_channels() {
            let rate = self.host.sample_rate(channel);
            let multiple = rate / HT_FS;
            if (multiple - multiple.round()).abs() > f64::EPSILON * 8.0 || multiple < 1.0 {
                self.host.send_status(&format!(
                    "channel {channel} deselected: sample rate {rate} Hz is not a multiple of {HT_FS} Hz"
                ));
                continue;
            }
            validated.push((channel, rate, multiple.round() as usize));
        }
        if validated.is_empty() {
            return Err(StreamError::NoUsableChannels);
        }

        // One history length serves all channels: enough decimated samples
        // to train the model and at least one second of signal.
        let order = self.cfg.ar_order;
        self.history_len = validated
            .iter()
            .map(|&(_, rate, ds)| (order * ds + 1).max(rate as usize))
            .max()
            .unwrap_or(0);

        let history_len = self.history_len;
        let mut workers = Vec::with_capacity(validated.len());
        self.channels.clear();
        for &(channel, rate, ds) in &validated {
            let history_shared = AtomicallyShared::new(|| vec![0.0f64; history_len]);
            let params_shared = AtomicallyShared::new(|| vec![0.0f64; order]);
            let state = Arc::new(AtomicU8::new(STATE_NOT_FULL));

            let modeler = ArModeler::new(order, history_len, ds)?;

            workers.push(WorkerChannel {
                history_reader: history_shared.reader()?,
                params_writer: params_shared.writer()?,
                state: Arc::clone(&state),
                modeler,
                coef: vec![0.0; order],
            });

            self.channels.push(ChannelArena {
                host_channel: channel,
                sample_rate_hz: rate,
                ds_factor: ds,
                filter: BandpassFilter::new(rate, self.cfg.low_cut_hz, self.cfg.high_cut_hz),
                history: vec![0.0; self.history_len],
                free_space: self.history_len,
                state,
                history_writer: history_shared.writer()?,
                params_reader: params_shared.reader()?,
                params_local: vec![0.0; order],
                hilbert_state: self.engine.make_state(),
                dec_scratch: vec![0.0; order],
                ds_offset: ds - 1,
                prev_point: None,
                prev_prev_point: None,
                last_phase: 0.0,
                sample_count: 0,
                overflow_warned: false,
            });
        }

        // Plans for the event-phase analytic transform over a full history
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(self.history_len);
        let inverse = planner.plan_fft_inverse(self.history_len);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());
        self.vis_buf = vec![Complex::new(0.0, 0.0); self.history_len];
        self.vis_scratch = vec![Complex::new(0.0, 0.0); scratch_len];
        self.vis_fft = Some((forward, inverse));

        self.worker = Some(ComputeWorker::spawn(
            "neurophase-ar",
            self.cfg.recalc_interval_ms,
            move || {
                for ch in &mut workers {
                    if ch.state.load(Ordering::Acquire) == STATE_NOT_FULL {
                        continue;
                    }
                    if !ch.history_reader.pull_update() {
                        continue;
                    }
                    let Some(history) = ch.history_reader.get() else {
                        continue;
                    };
                    ch.modeler.fit(history, &mut ch.coef);
                    ch.params_writer.copy_from_slice(&ch.coef);
                    ch.params_writer.publish();
                    ch.state.store(STATE_FULL_AR, Ordering::Release);
                }
            },
        ));

        info!(
            target: "neurophase::phase",
            channels = self.channels.len(),
            history_len = self.history_len,
            "phase stream started"
        );
        Ok(())
    }

    /// Stop streaming: join the background thread and discard all derived
    /// per-channel state and queued events.
    pub fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        self.channels.clear();
        self.vis_fft = None;
        self.events.clear();
        info!(target: "neurophase::phase", "phase stream stopped");
    }

    /// Request an immediate background recalculation.
    pub fn recalc_now(&self) {
        if let Some(worker) = &self.worker {
            worker.recalc_now();
        }
    }

    /// Process one host callback.
    ///
    /// `blocks` must hold one entry per validated channel, in
    /// [`channel_states`](PhaseStream::channel_states) order. Channels
    /// without a model snapshot yet have their output zeroed.
    pub fn process_block(&mut self, blocks: &mut [ChannelBlock<'_>]) {
        assert_eq!(
            blocks.len(),
            self.channels.len(),
            "one block per active channel"
        );

        let output = self.cfg.output;
        let order = self.cfg.ar_order;

        for (arena, block) in self.channels.iter_mut().zip(blocks.iter_mut()) {
            let n = block.samples.len();
            if n == 0 {
                continue;
            }

            let hist_len = arena.history.len();
            if n > hist_len && !arena.overflow_warned {
                self.host.send_status(&format!(
                    "channel {}: callback of {n} samples overflows {hist_len}-sample history",
                    arena.host_channel
                ));
                arena.overflow_warned = true;
            }

            // Bandpass in place, then shift the history left and append the
            // filtered samples, promoted to f64.
            for sample in block.samples.iter_mut() {
                *sample = arena.filter.filter(f64::from(*sample)) as f32;
            }
            let keep = n.min(hist_len);
            arena.history.copy_within(keep.., 0);
            for (dst, &src) in arena.history[hist_len - keep..]
                .iter_mut()
                .zip(block.samples[n - keep..].iter())
            {
                *dst = f64::from(src);
            }

            if arena.state.load(Ordering::Acquire) == STATE_NOT_FULL {
                arena.free_space = arena.free_space.saturating_sub(keep);
                if arena.free_space == 0 {
                    arena.state.store(STATE_FULL_NO_AR, Ordering::Release);
                }
            }

            // Snapshot the history for the background thread.
            arena.history_writer.copy_from_slice(&arena.history);
            arena.history_writer.publish();

            let state = arena.state.load(Ordering::Acquire);
            let mut have_params = false;
            if state == STATE_FULL_AR {
                arena.params_reader.pull_update();
                if let Some(params) = arena.params_reader.get() {
                    arena.params_local.copy_from_slice(params);
                    have_params = true;
                }
            }

            if have_params {
                for i in 0..n {
                    arena.ds_offset += 1;
                    if arena.ds_offset >= arena.ds_factor {
                        arena.ds_offset = 0;

                        // This sample is on the transformer grid: advance
                        // the streaming FIR and compute a fresh analytic
                        // point from AR-predicted future samples. Samples
                        // that already fell off the history (oversized
                        // callback) are skipped.
                        let end = hist_len.saturating_sub(n - 1 - i);
                        if end > (order - 1) * arena.ds_factor && end >= 1 {
                            self.engine.filter_sample(
                                &mut arena.hilbert_state,
                                arena.history[end - 1],
                            );
                            for (j, dst) in arena.dec_scratch.iter_mut().enumerate() {
                                *dst = arena.history
                                    [end - 1 - (order - 1 - j) * arena.ds_factor];
                            }
                            let analytic = self.engine.analytic_point(
                                &arena.hilbert_state,
                                &arena.dec_scratch,
                                &arena.params_local,
                            );
                            arena.prev_prev_point = arena.prev_point;
                            arena.prev_point = Some(AnalyticPoint {
                                phase_deg: analytic.arg().to_degrees() as f32,
                                magnitude: analytic.norm() as f32,
                                imaginary: analytic.im as f32,
                            });
                        }
                    }

                    let point = match (arena.prev_prev_point, arena.prev_point) {
                        (Some(a), Some(b)) => {
                            // Linear continuation through the last two
                            // analytic points; lands exactly on `b` at the
                            // sample it was computed for.
                            let frac = 1.0 + arena.ds_offset as f32 / arena.ds_factor as f32;
                            AnalyticPoint {
                                phase_deg: circular_lerp_deg(a.phase_deg, b.phase_deg, frac),
                                magnitude: a.magnitude + frac * (b.magnitude - a.magnitude),
                                imaginary: a.imaginary + frac * (b.imaginary - a.imaginary),
                            }
                        }
                        (None, Some(b)) => b,
                        _ => AnalyticPoint {
                            phase_deg: 0.0,
                            magnitude: 0.0,
                            imaginary: 0.0,
                        },
                    };

                    match output {
                        OutputMode::Phase => block.samples[i] = point.phase_deg,
                        OutputMode::Magnitude => block.samples[i] = point.magnitude,
                        OutputMode::PhaseAndMagnitude => {
                            block.samples[i] = point.phase_deg;
                            if let Some(mag) = block.magnitude.as_deref_mut() {
                                mag[i] = point.magnitude;
                            }
                        }
                        OutputMode::Imaginary => block.samples[i] = point.imaginary,
                    }
                }

                if output.outputs_phase() {
                    unwrap_buffer(block.samples, arena.last_phase);
                    smooth_buffer(block.samples, arena.last_phase);
                }
                arena.last_phase = block.samples[n - 1];
            } else {
                // Not full, or no model snapshot yet: explicit zeros, never
                // stale data.
                block.samples.fill(0.0);
                if let Some(mag) = block.magnitude.as_deref_mut() {
                    mag.fill(0.0);
                }
                arena.last_phase = 0.0;
            }

            arena.sample_count += n as u64;

            if self.cfg.vis_channel == Some(arena.host_channel)
                && arena.state.load(Ordering::Acquire) != STATE_NOT_FULL
            {
                if let Some((forward, inverse)) = &self.vis_fft {
                    compute_event_phases(
                        arena,
                        &self.events,
                        forward.as_ref(),
                        inverse.as_ref(),
                        &mut self.vis_buf,
                        &mut self.vis_scratch,
                    );
                }
            }
        }
    }
}

impl Drop for PhaseStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Answer queued TTL timestamps with precise phases computed from the
/// history buffer via an FFT analytic transform.
fn compute_event_phases(
    arena: &ChannelArena,
    events: &EventQueues,
    forward: &dyn Fft<f64>,
    inverse: &dyn Fft<f64>,
    buf: &mut [Complex<f64>],
    scratch: &mut [Complex<f64>],
) {
    let end_ts = arena.sample_count;
    let min_ts = end_ts.saturating_sub((VIS_MAX_DELAY_S * arena.sample_rate_hz) as u64);
    let max_ts = end_ts.saturating_sub((VIS_MIN_DELAY_S * arena.sample_rate_hz) as u64);

    let mut transformed = false;
    while let Some(ts) = events.pop_computable(min_ts, max_ts) {
        if !transformed {
            for (dst, &src) in buf.iter_mut().zip(arena.history.iter()) {
                *dst = Complex::new(src, 0.0);
            }
            forward.process_with_scratch(buf, scratch);
            analytic_manip(buf);
            inverse.process_with_scratch(buf, scratch);
            transformed = true;
        }

        // History's final sample carries timestamp end_ts - 1.
        let delay = (end_ts - 1).saturating_sub(ts) as usize;
        if delay >= buf.len() {
            continue;
        }
        let idx = buf.len() - 1 - delay;
        events.push_event(PhaseEvent {
            channel: arena.host_channel,
            timestamp: ts,
            phase_deg: buf[idx].arg().to_degrees(),
        });
    }
}

/// Convert an in-place FFT into the spectrum of the analytic signal:
/// normalize DC and Nyquist, normalize and double positive frequencies,
/// zero negative frequencies.
fn analytic_manip(buf: &mut [Complex<f64>]) {
    let n = buf.len();
    let scale = 1.0 / n as f64;
    let last_pos = (n + 1) / 2 - 1;
    let first_neg = n / 2 + 1;

    buf[0] *= scale;
    for value in &mut buf[1..=last_pos] {
        *value *= 2.0 * scale;
    }
    if n % 2 == 0 {
        buf[last_pos + 1] *= scale;
    }
    for value in &mut buf[first_neg..] {
        *value = Complex::new(0.0, 0.0);
    }
}
