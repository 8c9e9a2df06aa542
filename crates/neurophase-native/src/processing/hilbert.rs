//! FIR Hilbert transformation for causal instantaneous phase estimation
//!
//! A short odd-symmetric FIR Hilbert transformer produces the quadrature
//! component of a band-limited signal one sample at a time. Its group delay
//! is compensated by extrapolating the signal forward with the current AR
//! model and running the predicted samples through a copy of the filter
//! state, yielding an analytic point for "now" with no added output latency.
//!
//! Transformers are precomputed for five physiological bands at a fixed
//! processing rate of [`HT_FS`] Hz; channels sampled faster must be an
//! integer multiple of that rate and are processed on the decimated grid.

use rustfft::num_complex::Complex;

use neurophase_core::error::{ConfigError, ConfigResult};

use super::ar::ar_predict;

/// Processing rate the transformer coefficients are designed for, in Hz.
pub const HT_FS: f64 = 500.0;

/// Maximum span, in samples, of a phase glitch that unwrap/smooth will fix.
pub const GLITCH_LIMIT: usize = 200;

/// Number of passband frequencies sampled when computing the response
/// normalization factor.
const SCALE_QUERY_FREQS: usize = 10;

// Transformer half-kernels. Each filter has 2*delay+1 taps with odd
// symmetry: h[delay] = 0 and h[delay+1+i] = -h[delay-1-i], so only the
// first `delay` taps are tabulated.

// firls(6, [60 200]/250, [1 1], 'hilbert')
const HIGH_GAMMA_HALF: [f64; 3] = [
    -0.103_834_105_065_732_87,
    0.004_055_393_569_110_230_3,
    -0.592_584_846_036_595_45,
];

// firls(4, [35 90]/250, [1 1], 'hilbert')
const MID_GAMMA_HALF: [f64; 2] = [-0.487_176_162_115_735, -0.069_437_334_858_668_653];

// firls(4, [30 55]/250, [1 1], 'hilbert')
const LOW_GAMMA_HALF: [f64; 2] = [-1.593_378_844_635_191_5, 1.724_133_907_539_168_2];

// firpm(18, [12 30 40 240]/250, [1 1 0.7 0.7], 'hilbert')
const BETA_HALF: [f64; 9] = [
    -0.099_949_575_596_234_311,
    -0.020_761_484_963_254_036,
    -0.080_803_573_080_958_854,
    -0.027_365_064_225_587_619,
    -0.111_144_774_439_753_29,
    -0.025_834_076_852_645_271,
    -0.166_641_160_449_893_24,
    -0.015_661_948_619_847_599,
    -0.452_685_242_641_137_19,
];

// firpm(18, [4 246]/250, [1 1], 'hilbert')
const ALPHA_THETA_HALF: [f64; 9] = [
    -0.287_572_507_836_144_13,
    0.000_027_647_225_074_994_485,
    -0.094_611_325_643_268_351,
    -0.000_258_874_394_997_638_31,
    -0.129_436_276_914_844,
    -0.000_160_842_742_642_405_3,
    -0.213_150_968_600_552_27,
    -0.000_553_221_973_997_979_61,
    -0.636_856_982_103_511_49,
];

/// Frequency bands with precomputed Hilbert transformers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Band {
    /// 60-200 Hz
    HighGamma,
    /// 40-90 Hz
    MidGamma,
    /// 30-55 Hz
    LowGamma,
    /// 10-40 Hz
    Beta,
    /// 4-18 Hz
    AlphaTheta,
}

impl Band {
    /// All bands, narrowest valid range first, so passband lookup prefers
    /// the most specific transformer.
    pub const ALL: [Band; 5] = [
        Band::AlphaTheta,
        Band::LowGamma,
        Band::Beta,
        Band::MidGamma,
        Band::HighGamma,
    ];

    /// Range of passbands this transformer remains accurate over, in Hz.
    #[must_use]
    pub fn valid_range(&self) -> (f64, f64) {
        match self {
            Self::HighGamma => (60.0, 200.0),
            Self::MidGamma => (40.0, 90.0),
            Self::LowGamma => (30.0, 55.0),
            Self::Beta => (10.0, 40.0),
            Self::AlphaTheta => (4.0, 18.0),
        }
    }

    /// Default passband for this band, in Hz.
    #[must_use]
    pub fn default_range(&self) -> (f64, f64) {
        match self {
            Self::HighGamma => (70.0, 150.0),
            Self::MidGamma => (40.0, 90.0),
            Self::LowGamma => (30.0, 55.0),
            Self::Beta => (12.0, 30.0),
            Self::AlphaTheta => (4.0, 8.0),
        }
    }

    /// Frequencies of local magnitude-response extrema, in Hz.
    ///
    /// Included among the query points when normalizing the response over a
    /// passband.
    #[must_use]
    pub fn extrema(&self) -> &'static [f64] {
        match self {
            Self::HighGamma => &[81.6443, 123.1104, 169.3574],
            Self::MidGamma => &[64.4559],
            Self::LowGamma => &[43.3609],
            Self::Beta => &[21.5848],
            Self::AlphaTheta => &[],
        }
    }

    /// Group delay of the transformer, in samples at [`HT_FS`].
    #[must_use]
    pub fn delay(&self) -> usize {
        self.half_kernel().len()
    }

    fn half_kernel(&self) -> &'static [f64] {
        match self {
            Self::HighGamma => &HIGH_GAMMA_HALF,
            Self::MidGamma => &MID_GAMMA_HALF,
            Self::LowGamma => &LOW_GAMMA_HALF,
            Self::Beta => &BETA_HALF,
            Self::AlphaTheta => &ALPHA_THETA_HALF,
        }
    }

    /// Full `2*delay+1`-tap kernel, reconstructed by odd symmetry.
    #[must_use]
    pub fn kernel(&self) -> Vec<f64> {
        let half = self.half_kernel();
        let delay = half.len();
        let mut kernel = vec![0.0; 2 * delay + 1];
        kernel[..delay].copy_from_slice(half);
        for i in 0..delay {
            kernel[delay + 1 + i] = -half[delay - 1 - i];
        }
        kernel
    }

    /// The first band (in [`Band::ALL`] order) whose valid range contains
    /// the requested passband.
    #[must_use]
    pub fn containing(low_hz: f64, high_hz: f64) -> Option<Band> {
        Band::ALL.into_iter().find(|band| {
            let (lo, hi) = band.valid_range();
            low_hz >= lo && high_hz <= hi
        })
    }
}

/// FIR delay line for one channel's streaming Hilbert state.
///
/// Persists across callbacks while streaming; cleared on stream stop.
#[derive(Clone, Debug)]
pub struct HilbertState {
    line: Vec<f64>,
    head: usize,
}

impl HilbertState {
    fn new(taps: usize) -> Self {
        Self {
            line: vec![0.0; taps],
            head: 0,
        }
    }

    /// Zero the delay line.
    pub fn reset(&mut self) {
        self.line.iter_mut().for_each(|v| *v = 0.0);
        self.head = 0;
    }

    /// Reuse this state's allocation to copy another state's contents.
    fn copy_from(&mut self, other: &HilbertState) {
        self.line.copy_from_slice(&other.line);
        self.head = other.head;
    }
}

/// A band's transformer plus the response normalization for the configured
/// passband.
#[derive(Clone, Debug)]
pub struct HilbertPhaseEngine {
    band: Band,
    kernel: Vec<f64>,
    scale: f64,
    scratch_state: HilbertState,
    prediction: Vec<f64>,
}

impl HilbertPhaseEngine {
    /// Select the transformer for a passband and precompute its
    /// normalization.
    ///
    /// # Errors
    ///
    /// Fails with [`ConfigError::PassbandOutOfRange`] if no band's valid
    /// range covers `[low_hz, high_hz]`.
    pub fn new(low_hz: f64, high_hz: f64) -> ConfigResult<Self> {
        let band = Band::containing(low_hz, high_hz).ok_or(ConfigError::PassbandOutOfRange {
            low_hz,
            high_hz,
        })?;
        let kernel = band.kernel();
        let scale = response_scale_factor(band, low_hz, high_hz);
        let taps = kernel.len();
        Ok(Self {
            band,
            kernel,
            scale,
            scratch_state: HilbertState::new(taps),
            prediction: vec![0.0; band.delay() + 1],
        })
    }

    /// The selected band.
    #[must_use]
    pub fn band(&self) -> Band {
        self.band
    }

    /// Group delay of the selected transformer in samples.
    #[must_use]
    pub fn delay(&self) -> usize {
        self.band.delay()
    }

    /// Allocate a fresh streaming state for one channel.
    #[must_use]
    pub fn make_state(&self) -> HilbertState {
        HilbertState::new(self.kernel.len())
    }

    /// Push one sample through a streaming state, returning the (delayed)
    /// quadrature output.
    #[inline]
    pub fn filter_sample(&self, state: &mut HilbertState, input: f64) -> f64 {
        let taps = self.kernel.len();
        state.head = (state.head + taps - 1) % taps;
        state.line[state.head] = input;

        let mut acc = 0.0;
        let mut idx = state.head;
        for &h in &self.kernel {
            acc += h * state.line[idx];
            idx += 1;
            if idx == taps {
                idx = 0;
            }
        }
        acc
    }

    /// Compute the analytic point one sample past the end of history.
    ///
    /// `decimated_history` is the tail of the channel's history at the
    /// transformer rate (most recent sample last, at least `order` samples);
    /// `params` is the current AR snapshot. The engine predicts `delay + 1`
    /// samples forward, runs them through a copy of `state` (leaving the
    /// real streaming state untouched), and pairs the resulting quadrature
    /// output with the first predicted sample.
    pub fn analytic_point(
        &mut self,
        state: &HilbertState,
        decimated_history: &[f64],
        params: &[f64],
    ) -> Complex<f64> {
        ar_predict(decimated_history, params, &mut self.prediction);

        self.scratch_state.copy_from(state);
        let mut quadrature = 0.0;
        // Borrow the scratch state around the engine to satisfy the borrow
        // checker without cloning the kernel.
        let mut scratch = std::mem::replace(&mut self.scratch_state, HilbertState::new(0));
        for &p in &self.prediction {
            quadrature = self.filter_sample(&mut scratch, p);
        }
        self.scratch_state = scratch;

        Complex::new(self.prediction[0], self.scale * quadrature)
    }
}

/// Reciprocal of the transformer's mean magnitude response over the
/// passband, evaluated at evenly spaced query frequencies plus any response
/// extrema inside the band.
fn response_scale_factor(band: Band, low_hz: f64, high_hz: f64) -> f64 {
    let kernel = band.kernel();
    let mut query = Vec::with_capacity(SCALE_QUERY_FREQS + band.extrema().len());
    for k in 0..SCALE_QUERY_FREQS {
        query.push(low_hz + k as f64 * (high_hz - low_hz) / (SCALE_QUERY_FREQS - 1) as f64);
    }
    query.extend(
        band.extrema()
            .iter()
            .copied()
            .filter(|f| (low_hz..=high_hz).contains(f)),
    );

    let mut mean_abs = 0.0;
    for &freq in &query {
        let norm_freq = freq / (HT_FS / 2.0);
        let mut response = Complex::new(0.0, 0.0);
        for (k, &h) in kernel.iter().enumerate() {
            response += Complex::from_polar(h, -(k as f64) * norm_freq * std::f64::consts::PI);
        }
        mean_abs += response.norm() / query.len() as f64;
    }

    1.0 / mean_abs
}

/// Remove artificial >180 degree jumps from a phase buffer in place.
///
/// A jump is unwrapped by shifting the run up to the compensating opposite
/// jump (searched up to [`GLITCH_LIMIT`] samples ahead for downward jumps,
/// to the buffer end for upward ones) by a full turn. `last_sample` is the
/// final phase value of the previous buffer.
pub fn unwrap_buffer(wp: &mut [f32], last_sample: f32) {
    let n = wp.len();
    if n < 2 {
        return;
    }

    let mut start = 0usize;
    while start < n - 1 {
        let prev = if start == 0 { last_sample } else { wp[start - 1] };
        let diff = wp[start] - prev;
        if diff.abs() > 180.0 {
            // Downward jumps only unwrap if a jump back up occurs within the
            // glitch limit; upward jumps unwrap to the end of the buffer
            // unless a jump back down occurs sooner.
            let (mut end, max) = if diff < 0.0 {
                (None, (start + GLITCH_LIMIT).min(n - 1))
            } else {
                (Some(n), n - 1)
            };
            for cur in (start + 1)..=max {
                let diff2 = wp[cur] - wp[cur - 1];
                if diff2.abs() > 180.0 && ((diff > 0.0) != (diff2 > 0.0)) {
                    end = Some(cur);
                    break;
                }
            }

            if let Some(end) = end {
                for value in &mut wp[start..end] {
                    *value -= 360.0 * diff.signum();
                }
                start = end;
            }
        }
        start += 1;
    }
}

/// Correct a single-sample dip below the previous buffer's final phase at a
/// buffer boundary by linear interpolation, in place.
pub fn smooth_buffer(wp: &mut [f32], last_sample: f32) {
    if wp.is_empty() {
        return;
    }
    let glitch_limit = GLITCH_LIMIT.min(wp.len() - 1);
    let diff = wp[0] - last_sample;
    if diff >= 0.0 || diff <= -180.0 {
        return;
    }

    let mut end_index = None;
    for i in 1..=glitch_limit {
        if wp[i] > last_sample {
            end_index = Some(i);
            break;
        }
        // corner case where the signal wraps before it exceeds last_sample
        if wp[i] - wp[i - 1] < -180.0 && (wp[i] + 360.0) > last_sample {
            wp[i] += 360.0;
            end_index = Some(i);
            break;
        }
    }

    if let Some(end) = end_index {
        let slope = (wp[end] - last_sample) / (end + 1) as f32;
        for (i, value) in wp[..end].iter_mut().enumerate() {
            *value = last_sample + (i + 1) as f32 * slope;
        }
    }
}

/// Interpolate between two phases in degrees along the shortest arc.
#[must_use]
pub fn circular_lerp_deg(from: f32, to: f32, frac: f32) -> f32 {
    let mut delta = (to - from) % 360.0;
    if delta > 180.0 {
        delta -= 360.0;
    } else if delta < -180.0 {
        delta += 360.0;
    }
    let mut result = from + frac * delta;
    if result > 180.0 {
        result -= 360.0;
    } else if result < -180.0 {
        result += 360.0;
    }
    result
}
