//! Time-frequency decomposition and running coherence accumulation
//!
//! Each finalized segment of multi-channel data is convolved with a bank of
//! Hann-windowed complex wavelets (one per frequency of interest) via
//! FFT-based convolution, producing a time-frequency spectrum per channel.
//! Per-channel power and per-combination complex cross-spectra accumulate
//! across segments under either a plain running mean or an exponentially
//! weighted one, from which magnitude-squared coherence is read out per
//! frequency.

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};

use neurophase_core::error::{ConfigError, ConfigResult};
use neurophase_core::types::Weighting;

/// Configuration for the coherence accumulator.
///
/// Group 1 channels occupy indices `0..n_group1` of each segment batch and
/// group 2 channels the following `n_group2` indices. Combination indices
/// are ordered `comb = g1 * n_group2 + g2` with `g1` outer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoherenceConfig {
    /// Number of channels in group 1
    pub n_group1: usize,
    /// Number of channels in group 2
    pub n_group2: usize,
    /// Sample rate of all grouped channels, in Hz
    pub sample_rate_hz: f64,
    /// Full buffered duration analyzed at once, in seconds
    pub segment_len_s: f64,
    /// Sliding analysis window length, in seconds
    pub window_len_s: f64,
    /// Stride between analysis windows, in seconds
    pub step_len_s: f64,
    /// Start of the frequency range of interest, in Hz
    pub freq_start_hz: f64,
    /// End of the frequency range of interest, in Hz
    pub freq_end_hz: f64,
    /// Step between frequencies of interest, in Hz
    pub freq_step_hz: f64,
    /// Zero-padding multiplier for FFT resolution
    pub interp_ratio: usize,
    /// Trial averaging scheme
    pub weighting: Weighting,
}

impl Default for CoherenceConfig {
    fn default() -> Self {
        Self {
            n_group1: 8,
            n_group2: 8,
            sample_rate_hz: 1000.0,
            segment_len_s: 4.0,
            window_len_s: 2.0,
            step_len_s: 0.1,
            freq_start_hz: 1.0,
            freq_end_hz: 40.0,
            freq_step_hz: 0.25,
            interp_ratio: 2,
            weighting: Weighting::Linear,
        }
    }
}

impl CoherenceConfig {
    /// Check the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint. Misconfiguration is always
    /// caught here, never at trial time.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.n_group1 == 0 {
            return Err(ConfigError::EmptyChannelGroup { group: 1 });
        }
        if self.n_group2 == 0 {
            return Err(ConfigError::EmptyChannelGroup { group: 2 });
        }
        if self.window_len_s <= 0.0 || self.window_len_s > self.segment_len_s {
            return Err(ConfigError::WindowExceedsSegment {
                window_s: self.window_len_s,
                segment_s: self.segment_len_s,
            });
        }
        if self.step_len_s <= 0.0 {
            return Err(ConfigError::InvalidStepLength {
                step_s: self.step_len_s,
            });
        }
        if self.freq_step_hz <= 0.0 || self.freq_end_hz < self.freq_start_hz {
            return Err(ConfigError::EmptyFrequencyRange {
                start_hz: self.freq_start_hz,
                end_hz: self.freq_end_hz,
                step_hz: self.freq_step_hz,
            });
        }
        if self.interp_ratio == 0 {
            return Err(ConfigError::InvalidInterpRatio {
                ratio: self.interp_ratio,
            });
        }
        let alpha = self.weighting.alpha();
        if alpha < 0.0 {
            return Err(ConfigError::InvalidAlpha { alpha });
        }
        Ok(())
    }

    /// Total channels across both groups.
    #[must_use]
    pub fn n_channels(&self) -> usize {
        self.n_group1 + self.n_group2
    }

    /// Number of (group1, group2) combinations.
    #[must_use]
    pub fn n_combinations(&self) -> usize {
        self.n_group1 * self.n_group2
    }

    /// Number of frequencies of interest.
    #[must_use]
    pub fn n_freqs(&self) -> usize {
        ((self.freq_end_hz - self.freq_start_hz) / self.freq_step_hz).floor() as usize + 1
    }

    /// Number of analysis-window positions inside the trimmed region.
    ///
    /// Half a window is excluded at each segment edge, so the first window
    /// is centered `window_len / 2` into the segment.
    #[must_use]
    pub fn n_times(&self) -> usize {
        ((self.segment_len_s - self.window_len_s) / self.step_len_s + 1e-9).floor() as usize + 1
    }

    /// Samples per segment.
    #[must_use]
    pub fn segment_samples(&self) -> usize {
        (self.segment_len_s * self.sample_rate_hz).round() as usize
    }

    /// Samples per analysis window.
    #[must_use]
    pub fn window_samples(&self) -> usize {
        (self.window_len_s * self.sample_rate_hz).round() as usize
    }
}

/// Running weighted average of a real value.
#[derive(Clone, Copy, Debug, Default)]
struct RealAccum {
    sum: f64,
    count: f64,
}

impl RealAccum {
    #[inline]
    fn add(&mut self, x: f64, alpha: f64) {
        self.sum = x + (1.0 - alpha) * self.sum;
        self.count = 1.0 + (1.0 - alpha) * self.count;
    }

    #[inline]
    fn average(&self) -> f64 {
        if self.count > 0.0 {
            self.sum / self.count
        } else {
            0.0
        }
    }
}

/// Running weighted average of a complex value.
#[derive(Clone, Copy, Debug, Default)]
struct ComplexAccum {
    sum: Complex<f64>,
    count: f64,
}

impl ComplexAccum {
    #[inline]
    fn add(&mut self, x: Complex<f64>, alpha: f64) {
        self.sum = x + self.sum * (1.0 - alpha);
        self.count = 1.0 + (1.0 - alpha) * self.count;
    }

    #[inline]
    fn average(&self) -> Complex<f64> {
        if self.count > 0.0 {
            self.sum / self.count
        } else {
            Complex::new(0.0, 0.0)
        }
    }
}

/// Segmented time-frequency decomposition with cumulative coherence.
pub struct SpectralEngine {
    cfg: CoherenceConfig,
    n_freqs: usize,
    n_times: usize,
    seg_samples: usize,
    nfft: usize,

    freqs: Vec<f64>,
    /// Convolution output index of each analysis-window position
    time_indices: Vec<usize>,
    /// Frequency-domain wavelets, one per frequency of interest
    wavelet_fft: Vec<Vec<Complex<f64>>>,

    fft: Arc<dyn Fft<f64>>,
    ifft: Arc<dyn Fft<f64>>,
    scratch: Vec<Complex<f64>>,
    segment_fft: Vec<Complex<f64>>,
    conv: Vec<Complex<f64>>,

    /// Current-segment spectrum per channel, `n_freqs * n_times` flattened
    spectra: Vec<Vec<Complex<f64>>>,
    /// Which channels have contributed to the current segment
    seen: Vec<bool>,

    /// Per channel x frequency x time power accumulators
    power: Vec<RealAccum>,
    /// Per combination x frequency x time cross-spectrum accumulators
    cross: Vec<ComplexAccum>,
}

impl SpectralEngine {
    /// Build an engine for the given configuration.
    ///
    /// Wavelets and FFT plans are generated here, once per configuration.
    ///
    /// # Errors
    ///
    /// Fails if the configuration does not validate.
    pub fn new(cfg: CoherenceConfig) -> ConfigResult<Self> {
        cfg.validate()?;

        let n_freqs = cfg.n_freqs();
        let n_times = cfg.n_times();
        let n_channels = cfg.n_channels();
        let seg_samples = cfg.segment_samples();
        let win_samples = cfg.window_samples();
        let fs = cfg.sample_rate_hz;

        let nfft = ((seg_samples + win_samples) * cfg.interp_ratio).next_power_of_two();

        let freqs: Vec<f64> = (0..n_freqs)
            .map(|k| cfg.freq_start_hz + k as f64 * cfg.freq_step_hz)
            .collect();

        // The convolution output at index m covers input samples
        // [m - win + 1, m], so a window centered at c lands at m = c + win/2.
        let step_samples = cfg.step_len_s * fs;
        let time_indices: Vec<usize> = (0..n_times)
            .map(|i| win_samples + (i as f64 * step_samples).round() as usize)
            .collect();

        let window = hann_window(win_samples);
        let window_sum: f64 = window.iter().sum();

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(nfft);
        let ifft = planner.plan_fft_inverse(nfft);
        let scratch_len = fft
            .get_inplace_scratch_len()
            .max(ifft.get_inplace_scratch_len());

        let mut wavelet_fft = Vec::with_capacity(n_freqs);
        let mut buf = vec![Complex::new(0.0, 0.0); nfft];
        for &freq in &freqs {
            buf.iter_mut().for_each(|v| *v = Complex::new(0.0, 0.0));
            let omega = 2.0 * std::f64::consts::PI * freq / fs;
            for (k, &w) in window.iter().enumerate() {
                buf[k] = Complex::from_polar(w / window_sum, -omega * k as f64);
            }
            let mut scratch = vec![Complex::new(0.0, 0.0); scratch_len];
            fft.process_with_scratch(&mut buf, &mut scratch);
            wavelet_fft.push(buf.clone());
        }

        let n_combinations = cfg.n_combinations();
        Ok(Self {
            cfg,
            n_freqs,
            n_times,
            seg_samples,
            nfft,
            freqs,
            time_indices,
            wavelet_fft,
            fft,
            ifft,
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            segment_fft: vec![Complex::new(0.0, 0.0); nfft],
            conv: vec![Complex::new(0.0, 0.0); nfft],
            spectra: vec![vec![Complex::new(0.0, 0.0); n_freqs * n_times]; n_channels],
            seen: vec![false; n_channels],
            power: vec![RealAccum::default(); n_channels * n_freqs * n_times],
            cross: vec![ComplexAccum::default(); n_combinations * n_freqs * n_times],
        })
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &CoherenceConfig {
        &self.cfg
    }

    /// The frequencies of interest, in Hz.
    #[must_use]
    pub fn frequencies(&self) -> &[f64] {
        &self.freqs
    }

    /// Add one channel's segment to the current trial.
    ///
    /// `chan` indexes the grouped channel batch: `0..n_group1` are group 1,
    /// the rest group 2. Must be called exactly once per channel per
    /// segment; statistics for a combination update as soon as both of its
    /// channels have arrived, and readers must not consume the accumulator
    /// until the whole segment has been processed.
    pub fn add_trial(&mut self, chan: usize, segment: &[f64]) {
        assert!(chan < self.cfg.n_channels(), "channel index out of range");
        assert_eq!(segment.len(), self.seg_samples, "segment length mismatch");

        let alpha = self.cfg.weighting.alpha();

        // Forward transform of the zero-padded segment, reused across all
        // frequencies of interest.
        self.segment_fft
            .iter_mut()
            .for_each(|v| *v = Complex::new(0.0, 0.0));
        for (dst, &s) in self.segment_fft.iter_mut().zip(segment.iter()) {
            *dst = Complex::new(s, 0.0);
        }
        self.fft
            .process_with_scratch(&mut self.segment_fft, &mut self.scratch);

        let inv_n = 1.0 / self.nfft as f64;
        for f in 0..self.n_freqs {
            for (dst, (&a, &b)) in self
                .conv
                .iter_mut()
                .zip(self.segment_fft.iter().zip(self.wavelet_fft[f].iter()))
            {
                *dst = a * b;
            }
            self.ifft
                .process_with_scratch(&mut self.conv, &mut self.scratch);

            for (t, &m) in self.time_indices.iter().enumerate() {
                let value = self.conv[m] * inv_n;
                self.spectra[chan][f * self.n_times + t] = value;
                self.power[(chan * self.n_freqs + f) * self.n_times + t]
                    .add(value.norm_sqr(), alpha);
            }
        }

        self.seen[chan] = true;
        self.accumulate_cross_for(chan, alpha);

        if self.seen.iter().all(|&s| s) {
            self.seen.iter_mut().for_each(|s| *s = false);
        }
    }

    /// Accumulate cross-spectra for every combination that `chan` just
    /// completed (the partner has already contributed this segment).
    fn accumulate_cross_for(&mut self, chan: usize, alpha: f64) {
        let n_group1 = self.cfg.n_group1;
        let n_group2 = self.cfg.n_group2;
        let bins = self.n_freqs * self.n_times;

        let pairs: Vec<(usize, usize, usize)> = if chan < n_group1 {
            (0..n_group2)
                .filter(|&g2| self.seen[n_group1 + g2])
                .map(|g2| (chan, n_group1 + g2, chan * n_group2 + g2))
                .collect()
        } else {
            let g2 = chan - n_group1;
            (0..n_group1)
                .filter(|&g1| self.seen[g1])
                .map(|g1| (g1, chan, g1 * n_group2 + g2))
                .collect()
        };

        for (x, y, comb) in pairs {
            for bin in 0..bins {
                let value = self.spectra[x][bin] * self.spectra[y][bin].conj();
                self.cross[comb * bins + bin].add(value, alpha);
            }
        }
    }

    /// Magnitude-squared coherence for one channel pair, one value per
    /// frequency.
    ///
    /// The accumulated cross and auto spectra are averaged over the trimmed
    /// analysis-window times before forming `|Pxy|^2 / (Pxx * Pyy)`, so
    /// every window position contributes an observation and the estimate
    /// sharpens as trials accumulate. `g1` and `g2` are indices within
    /// their groups. Zero total power in the denominator yields a coherence
    /// of 0, never NaN.
    pub fn mean_coherence_into(&self, g1: usize, g2: usize, out: &mut [f64]) {
        assert!(g1 < self.cfg.n_group1 && g2 < self.cfg.n_group2);
        assert_eq!(out.len(), self.n_freqs);

        let comb = g1 * self.cfg.n_group2 + g2;
        let x = g1;
        let y = self.cfg.n_group1 + g2;
        let bins = self.n_freqs * self.n_times;

        for (f, dst) in out.iter_mut().enumerate() {
            let mut pxy = Complex::new(0.0, 0.0);
            let mut pxx = 0.0;
            let mut pyy = 0.0;
            for t in 0..self.n_times {
                let bin = f * self.n_times + t;
                pxy += self.cross[comb * bins + bin].average();
                pxx += self.power[(x * self.n_freqs + f) * self.n_times + t].average();
                pyy += self.power[(y * self.n_freqs + f) * self.n_times + t].average();
            }
            let scale = 1.0 / self.n_times as f64;
            *dst = single_coherence(pxx * scale, pyy * scale, pxy * scale);
        }
    }

    /// Mean coherence for all combinations, `n_combinations x n_freqs`,
    /// ordered `comb = g1 * n_group2 + g2`.
    #[must_use]
    pub fn all_mean_coherence(&self) -> Vec<Vec<f64>> {
        let mut result =
            vec![vec![0.0; self.n_freqs]; self.cfg.n_combinations()];
        for g1 in 0..self.cfg.n_group1 {
            for g2 in 0..self.cfg.n_group2 {
                let comb = g1 * self.cfg.n_group2 + g2;
                let row = &mut result[comb];
                self.mean_coherence_into(g1, g2, row);
            }
        }
        result
    }

    /// Switch the averaging scheme. Changing scheme discards all
    /// accumulated statistics.
    pub fn set_weighting(&mut self, weighting: Weighting) {
        if self.cfg.weighting != weighting {
            self.cfg.weighting = weighting;
            self.reset();
        }
    }

    /// Discard all accumulated statistics and partial-segment state.
    pub fn reset(&mut self) {
        self.power.iter_mut().for_each(|a| *a = RealAccum::default());
        self.cross
            .iter_mut()
            .for_each(|a| *a = ComplexAccum::default());
        self.seen.iter_mut().for_each(|s| *s = false);
        for spectrum in &mut self.spectra {
            spectrum.iter_mut().for_each(|v| *v = Complex::new(0.0, 0.0));
        }
    }
}

/// Magnitude-squared coherence from auto- and cross-power values.
fn single_coherence(pxx: f64, pyy: f64, pxy: Complex<f64>) -> f64 {
    let denom = pxx * pyy;
    if denom == 0.0 {
        return 0.0;
    }
    pxy.norm_sqr() / denom
}

/// Generate Hann window coefficients
fn hann_window(size: usize) -> Vec<f64> {
    (0..size)
        .map(|i| {
            0.5 * (1.0 - (2.0 * std::f64::consts::PI * i as f64 / (size - 1) as f64).cos())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, fs: f64, n: usize, phase: f64) -> Vec<f64> {
        (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / fs + phase).sin())
            .collect()
    }

    fn noise(seed: &mut u64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|_| {
                *seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                ((*seed >> 33) as f64 / f64::from(1u32 << 31)) - 0.5
            })
            .collect()
    }

    fn small_config() -> CoherenceConfig {
        CoherenceConfig {
            n_group1: 1,
            n_group2: 1,
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

    #[test]
    fn test_config_validation() {
        let mut cfg = small_config();
        cfg.window_len_s = 3.0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::WindowExceedsSegment { .. })
        ));

        let mut cfg = small_config();
        cfg.freq_step_hz = 0.0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::EmptyFrequencyRange { .. })
        ));

        let mut cfg = small_config();
        cfg.n_group2 = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::EmptyChannelGroup { group: 2 })
        ));

        let mut cfg = small_config();
        cfg.step_len_s = -0.1;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidStepLength { .. })
        ));
    }

    #[test]
    fn test_derived_sizes() {
        let cfg = CoherenceConfig::default();
        assert_eq!(cfg.n_freqs(), 157);
        assert_eq!(cfg.n_times(), 21);
        assert_eq!(cfg.n_combinations(), 64);
        assert_eq!(cfg.segment_samples(), 4000);
    }

    #[test]
    fn test_identical_signals_cohere_fully() {
        let cfg = small_config();
        let fs = cfg.sample_rate_hz;
        let n = cfg.segment_samples();
        let mut engine = SpectralEngine::new(cfg).unwrap();

        let segment = sine(10.0, fs, n, 0.3);
        engine.add_trial(0, &segment);
        engine.add_trial(1, &segment);

        let mut coherence = vec![0.0; engine.frequencies().len()];
        engine.mean_coherence_into(0, 0, &mut coherence);

        for (f, &c) in engine.frequencies().iter().zip(&coherence) {
            assert!(c >= 0.0 && c <= 1.0 + 1e-9, "{f} Hz out of bounds: {c}");
        }
        let at_10 = coherence[5];
        assert!((at_10 - 1.0).abs() < 1e-3, "coherence at 10 Hz: {at_10}");
    }

    #[test]
    fn test_independent_noise_decoheres() {
        let cfg = small_config();
        let n = cfg.segment_samples();
        let mut engine = SpectralEngine::new(cfg).unwrap();

        let mut seed_a = 11u64;
        let mut seed_b = 977u64;
        for _ in 0..8 {
            engine.add_trial(0, &noise(&mut seed_a, n));
            engine.add_trial(1, &noise(&mut seed_b, n));
        }

        let mut coherence = vec![0.0; engine.frequencies().len()];
        engine.mean_coherence_into(0, 0, &mut coherence);

        let mean = coherence.iter().sum::<f64>() / coherence.len() as f64;
        assert!(mean < 0.3, "independent channels should decohere: {mean}");
        for &c in &coherence {
            assert!((0.0..=1.0 + 1e-9).contains(&c));
        }
    }

    #[test]
    fn test_exponential_alpha_zero_matches_linear() {
        let cfg = small_config();
        let fs = cfg.sample_rate_hz;
        let n = cfg.segment_samples();

        let mut linear = SpectralEngine::new(cfg.clone()).unwrap();
        let mut exponential = SpectralEngine::new(CoherenceConfig {
            weighting: Weighting::Exponential { alpha: 0.0 },
            ..cfg
        })
        .unwrap();

        let mut seed = 5u64;
        for k in 0..3 {
            let a = sine(10.0, fs, n, 0.1 * f64::from(k));
            let b = noise(&mut seed, n);
            linear.add_trial(0, &a);
            linear.add_trial(1, &b);
            exponential.add_trial(0, &a);
            exponential.add_trial(1, &b);
        }

        let mut lin = vec![0.0; linear.frequencies().len()];
        let mut exp = vec![0.0; lin.len()];
        linear.mean_coherence_into(0, 0, &mut lin);
        exponential.mean_coherence_into(0, 0, &mut exp);

        for (a, b) in lin.iter().zip(&exp) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_weighting_switch_resets_accumulators() {
        let cfg = small_config();
        let fs = cfg.sample_rate_hz;
        let n = cfg.segment_samples();
        let mut engine = SpectralEngine::new(cfg).unwrap();

        let segment = sine(10.0, fs, n, 0.0);
        engine.add_trial(0, &segment);
        engine.add_trial(1, &segment);

        engine.set_weighting(Weighting::Exponential { alpha: 0.5 });

        let mut coherence = vec![0.0; engine.frequencies().len()];
        engine.mean_coherence_into(0, 0, &mut coherence);
        assert!(coherence.iter().all(|&c| c == 0.0));
    }

    /// End-to-end scenario: 4x4 channel groups, one correlated pair at a
    /// known frequency, everything else independent noise.
    #[test]
    fn test_grouped_scenario_isolates_correlated_pair() {
        let cfg = CoherenceConfig {
            n_group1: 4,
            n_group2: 4,
            sample_rate_hz: 1000.0,
            segment_len_s: 4.0,
            window_len_s: 2.0,
            step_len_s: 0.1,
            freq_start_hz: 1.0,
            freq_end_hz: 40.0,
            freq_step_hz: 1.0,
            interp_ratio: 1,
            weighting: Weighting::Linear,
        };
        let fs = cfg.sample_rate_hz;
        let n = cfg.segment_samples();
        let n_channels = cfg.n_channels();
        let injected_hz = 12.0;

        let mut engine = SpectralEngine::new(cfg).unwrap();
        let mut seed = 31u64;

        for trial in 0..3 {
            let tone = sine(injected_hz, fs, n, 0.2 * f64::from(trial));
            for chan in 0..n_channels {
                // Channel 0 (group 1) and channel 4 (group 2) share the tone
                // with small independent noise; the rest are pure noise.
                let segment: Vec<f64> = if chan == 0 || chan == 4 {
                    tone.iter()
                        .zip(noise(&mut seed, n))
                        .map(|(&t, e)| t + 0.05 * e)
                        .collect()
                } else {
                    noise(&mut seed, n)
                };
                engine.add_trial(chan, &segment);
            }
        }

        let coherence = engine.all_mean_coherence();
        let freq_bin = (injected_hz - 1.0) as usize;

        // comb = g1 * n_group2 + g2; the correlated pair is (0, 0)
        let correlated = coherence[0][freq_bin];
        assert!(
            correlated > 0.8,
            "correlated pair coherence at {injected_hz} Hz: {correlated}"
        );

        for comb in 1..coherence.len() {
            let c = coherence[comb][freq_bin];
            assert!(
                c < 0.3,
                "uncorrelated combination {comb} too coherent: {c}"
            );
        }
    }
}
