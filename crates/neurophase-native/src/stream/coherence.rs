//! Cross-spectral coherence pipeline
//!
//! The real-time callback assembles per-channel segments directly into the
//! triple-buffered exchange slot and publishes when a segment fills. The
//! background thread pulls finalized segments, feeds them through the
//! [`SpectralEngine`], and publishes the updated mean-coherence matrix back
//! for the host to read at its leisure.

use std::sync::Arc;

use tracing::{debug, info};

use neurophase_core::error::ConfigResult;
use neurophase_core::sync::{AtomicallyShared, Reader, Writer};
use neurophase_core::types::StreamParameter;

use super::host::HostInterface;
use super::worker::ComputeWorker;
use super::{StreamError, StreamResult};
use crate::processing::spectral::{CoherenceConfig, SpectralEngine};

/// The coherence pipeline orchestrator.
///
/// Group 1 channels are the first `n_group1` entries of the host's active
/// channel list, group 2 the following `n_group2`.
pub struct CoherenceStream {
    cfg: CoherenceConfig,
    host: Arc<dyn HostInterface>,
    recalc_interval_ms: u32,
    seg_samples: usize,
    samples_added: usize,
    data: Option<AtomicallyShared<Vec<Vec<f64>>>>,
    data_writer: Option<Writer<Vec<Vec<f64>>>>,
    coherence_reader: Option<Reader<Vec<Vec<f64>>>>,
    worker: Option<ComputeWorker>,
}

impl CoherenceStream {
    /// Create a stopped pipeline.
    ///
    /// # Errors
    ///
    /// Fails if the configuration does not validate.
    pub fn new(cfg: CoherenceConfig, host: Arc<dyn HostInterface>) -> ConfigResult<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            host,
            recalc_interval_ms: 50,
            seg_samples: 0,
            samples_added: 0,
            data: None,
            data_writer: None,
            coherence_reader: None,
            worker: None,
        })
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &CoherenceConfig {
        &self.cfg
    }

    /// Whether the pipeline is currently streaming.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Apply a parameter change pushed from the host.
    ///
    /// Everything except the recalculation interval is structural and
    /// requires a stopped stream; parameters belonging to the phase
    /// pipeline are ignored.
    ///
    /// # Errors
    ///
    /// [`StreamError::Running`] for a structural change while streaming.
    pub fn set_parameter(&mut self, parameter: StreamParameter) -> StreamResult<()> {
        match parameter {
            StreamParameter::RecalcIntervalMs(ms) => {
                self.recalc_interval_ms = ms;
                if let Some(worker) = &self.worker {
                    worker.set_interval_ms(ms);
                }
            }
            StreamParameter::SegmentLength(s) => {
                self.require_stopped()?;
                self.cfg.segment_len_s = s;
            }
            StreamParameter::WindowLength(s) => {
                self.require_stopped()?;
                self.cfg.window_len_s = s;
            }
            StreamParameter::StepLength(s) => {
                self.require_stopped()?;
                self.cfg.step_len_s = s;
            }
            StreamParameter::FreqStart(hz) => {
                self.require_stopped()?;
                self.cfg.freq_start_hz = hz;
            }
            StreamParameter::FreqEnd(hz) => {
                self.require_stopped()?;
                self.cfg.freq_end_hz = hz;
            }
            StreamParameter::TrialWeighting(weighting) => {
                self.require_stopped()?;
                self.cfg.weighting = weighting;
            }
            other => {
                debug!(target: "neurophase::coherence", ?other, "ignoring parameter");
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

    /// Begin streaming: size the exchange buffers, check the host's channel
    /// list against the configured groups, and spawn the accumulation
    /// thread.
    ///
    /// # Errors
    ///
    /// [`StreamError::Running`] if already started, a [`ConfigError`] if
    /// the configuration is invalid, [`StreamError::NoUsableChannels`] if
    /// the host exposes fewer active channels than the groups need.
    pub fn start(&mut self) -> StreamResult<()> {
        if self.is_running() {
            return Err(StreamError::Running);
        }
        self.cfg.validate()?;

        let n_channels = self.cfg.n_channels();
        let active = self.host.active_channels();
        if active.len() < n_channels {
            self.host.send_status(&format!(
                "coherence needs {n_channels} active channels, host has {}",
                active.len()
            ));
            return Err(StreamError::NoUsableChannels);
        }

        let seg_samples = self.cfg.segment_samples();
        let n_freqs = self.cfg.n_freqs();
        let n_combs = self.cfg.n_combinations();

        let data =
            AtomicallyShared::new(|| vec![vec![0.0f64; seg_samples]; n_channels]);
        let coherence =
            AtomicallyShared::new(|| vec![vec![0.0f64; n_freqs]; n_combs]);

        let mut data_reader = data.reader()?;
        let mut coherence_writer = coherence.writer()?;
        self.data_writer = Some(data.writer()?);
        self.coherence_reader = Some(coherence.reader()?);
        self.data = Some(data);
        self.seg_samples = seg_samples;
        self.samples_added = 0;

        let mut engine = SpectralEngine::new(self.cfg.clone())?;
        self.worker = Some(ComputeWorker::spawn(
            "neurophase-coherence",
            self.recalc_interval_ms,
            move || {
                if !data_reader.has_update() {
                    return;
                }
                data_reader.pull_update();
                let Some(segments) = data_reader.get() else {
                    return;
                };
                for (chan, segment) in segments.iter().enumerate() {
                    engine.add_trial(chan, segment);
                }
                let coherence = engine.all_mean_coherence();
                for (dst, src) in coherence_writer.iter_mut().zip(coherence) {
                    dst.copy_from_slice(&src);
                }
                coherence_writer.publish();
            },
        ));

        info!(
            target: "neurophase::coherence",
            channels = n_channels,
            segment_samples = seg_samples,
            "coherence stream started"
        );
        Ok(())
    }

    /// Stop streaming: join the background thread and drop the partial
    /// segment.
    pub fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        self.data_writer = None;
        self.coherence_reader = None;
        self.data = None;
        self.samples_added = 0;
        info!(target: "neurophase::coherence", "coherence stream stopped");
    }

    /// Append one callback's worth of samples for every grouped channel.
    ///
    /// `blocks` must hold one slice per grouped channel, all the same
    /// length. Samples past the segment boundary within one callback are
    /// dropped; the segment publishes as soon as it fills.
    pub fn process_block(&mut self, blocks: &[&[f32]]) {
        let Some(writer) = self.data_writer.as_mut() else {
            return;
        };
        assert_eq!(
            blocks.len(),
            self.cfg.n_channels(),
            "one block per grouped channel"
        );

        let n = blocks[0].len();
        if n == 0 {
            return;
        }
        let take = n.min(self.seg_samples - self.samples_added);

        for (segment, block) in writer.iter_mut().zip(blocks.iter()) {
            for (dst, &src) in segment[self.samples_added..self.samples_added + take]
                .iter_mut()
                .zip(block[..take].iter())
            {
                *dst = f64::from(src);
            }
        }
        if take < n {
            debug!(
                target: "neurophase::coherence",
                dropped = n - take,
                "segment boundary inside callback"
            );
        }

        self.samples_added += take;
        if self.samples_added >= self.seg_samples {
            writer.publish();
            self.samples_added = 0;
        }
    }

    /// True if a finalized segment is still waiting for the background
    /// thread.
    #[must_use]
    pub fn has_pending_segment(&self) -> bool {
        self.data.as_ref().is_some_and(AtomicallyShared::has_update)
    }

    /// The most recently published mean-coherence matrix
    /// (`n_combinations x n_freqs`), if any segment has completed.
    pub fn latest_coherence(&mut self) -> Option<&[Vec<f64>]> {
        let reader = self.coherence_reader.as_mut()?;
        reader.pull_update();
        reader.get().map(Vec::as_slice)
    }

    /// Request an immediate background recalculation.
    pub fn recalc_now(&self) {
        if let Some(worker) = &self.worker {
            worker.recalc_now();
        }
    }
}

impl Drop for CoherenceStream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neurophase_core::types::Weighting;
    use std::time::{Duration, Instant};

    use crate::stream::host::StaticHost;

    fn test_config() -> CoherenceConfig {
        CoherenceConfig {
            n_group1: 2,
            n_group2: 2,
            sample_rate_hz: 200.0,
            segment_len_s: 2.0,
            window_len_s: 1.0,
            step_len_s: 0.25,
            freq_start_hz: 5.0,
            freq_end_hz: 15.0,
            freq_step_hz: 1.0,
            interp_ratio: 1,
            weighting: Weighting::Linear,
        }
    }

    fn sine(freq: f64, fs: f64, start: usize, n: usize) -> Vec<f32> {
        (start..start + n)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / fs).sin() as f32)
            .collect()
    }

    fn noise(seed: &mut u64, n: usize) -> Vec<f32> {
        (0..n)
            .map(|_| {
                *seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                (((*seed >> 33) as f64 / f64::from(1u32 << 31)) - 0.5) as f32
            })
            .collect()
    }

    #[test]
    fn test_start_requires_enough_channels() {
        let host = Arc::new(StaticHost::new(2, 200.0));
        let mut stream = CoherenceStream::new(test_config(), host).unwrap();
        assert!(matches!(
            stream.start(),
            Err(StreamError::NoUsableChannels)
        ));
    }

    #[test]
    fn test_structural_parameter_requires_stop() {
        let host = Arc::new(StaticHost::new(4, 200.0));
        let mut stream = CoherenceStream::new(test_config(), host).unwrap();
        stream.start().unwrap();
        assert!(matches!(
            stream.set_parameter(StreamParameter::SegmentLength(8.0)),
            Err(StreamError::Running)
        ));
        stream.stop();
        stream
            .set_parameter(StreamParameter::SegmentLength(8.0))
            .unwrap();
        assert_eq!(stream.config().segment_len_s, 8.0);
    }

    /// Threaded end-to-end run: one correlated pair across the groups, the
    /// rest independent noise. The correlated combination dominates, the
    /// others stay low.
    #[test]
    fn test_correlated_pair_dominates_coherence() {
        let cfg = test_config();
        let fs = cfg.sample_rate_hz;
        let seg = cfg.segment_samples();
        let host = Arc::new(StaticHost::new(4, fs));
        let mut stream = CoherenceStream::new(cfg, host).unwrap();
        stream.set_parameter(StreamParameter::RecalcIntervalMs(5)).unwrap();
        stream.start().unwrap();

        let injected_hz = 10.0;
        let mut seed = 77u64;
        let block_len = 80;

        // Five segments; channel 0 (group 1) and channel 2 (group 2) share
        // the tone, channels 1 and 3 are independent noise. Each segment is
        // left to the background thread before the next one starts, so
        // every trial is accumulated.
        for segment in 0..5 {
            let mut fed = 0;
            while fed < seg {
                let n = block_len.min(seg - fed);
                let tone = sine(injected_hz, fs, segment * seg + fed, n);
                let noisy: Vec<Vec<f32>> =
                    (0..2).map(|_| noise(&mut seed, n)).collect();
                let blocks: Vec<&[f32]> =
                    vec![&tone, &noisy[0], &tone, &noisy[1]];
                stream.process_block(&blocks);
                fed += n;
            }
            let deadline = Instant::now() + Duration::from_secs(10);
            while stream.has_pending_segment() {
                assert!(Instant::now() < deadline, "segment never consumed");
                std::thread::sleep(Duration::from_millis(5));
            }
        }

        // Wait for the background thread to process the final segment.
        let freq_bin = (injected_hz - 5.0) as usize;
        let deadline = Instant::now() + Duration::from_secs(10);
        let correlated_comb = 0; // g1 = 0, g2 = 0 -> channel 0 x channel 2
        loop {
            if let Some(coherence) = stream.latest_coherence() {
                let correlated = coherence[correlated_comb][freq_bin];
                if correlated > 0.8 {
                    for comb in 1..coherence.len() {
                        assert!(
                            coherence[comb][freq_bin] < 0.3,
                            "combination {comb} too coherent: {}",
                            coherence[comb][freq_bin]
                        );
                    }
                    break;
                }
            }
            assert!(
                Instant::now() < deadline,
                "coherence never converged on the correlated pair"
            );
            std::thread::sleep(Duration::from_millis(10));
        }
        stream.stop();
    }

    #[test]
    fn test_no_coherence_before_first_segment() {
        let host = Arc::new(StaticHost::new(4, 200.0));
        let mut stream = CoherenceStream::new(test_config(), host).unwrap();
        stream.start().unwrap();

        // A partial segment must not publish anything.
        let tone = sine(10.0, 200.0, 0, 50);
        let blocks: Vec<&[f32]> = vec![&tone, &tone, &tone, &tone];
        stream.process_block(&blocks);
        assert!(stream.latest_coherence().is_none());
        stream.stop();
    }
}
