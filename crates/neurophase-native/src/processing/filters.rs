//! Digital filters for channel pre-conditioning
//!
//! Provides floating-point Butterworth biquads and the bandpass cascade
//! applied to every channel before phase estimation.

/// Butterworth IIR filter coefficients (second-order section)
#[derive(Clone, Debug)]
pub struct BiquadCoeffs {
    /// Numerator coefficients [b0, b1, b2]
    pub b: [f64; 3],
    /// Denominator coefficients [a0=1, a1, a2]
    pub a: [f64; 3],
}

/// Second-order biquad filter section
#[derive(Clone, Debug)]
pub struct Biquad {
    coeffs: BiquadCoeffs,
    /// State: [z1, z2]
    state: [f64; 2],
}

impl Biquad {
    /// Create a new biquad section with given coefficients
    #[must_use]
    pub fn new(coeffs: BiquadCoeffs) -> Self {
        Self { coeffs, state: [0.0, 0.0] }
    }

    /// Create a second-order Butterworth lowpass filter
    #[must_use]
    pub fn lowpass(sample_rate: f64, cutoff: f64) -> Self {
        let omega = std::f64::consts::PI * cutoff / sample_rate;
        let k = omega.tan();
        let k2 = k * k;
        let sqrt2 = std::f64::consts::SQRT_2;

        let norm = 1.0 / (1.0 + sqrt2 * k + k2);

        let coeffs = BiquadCoeffs {
            b: [k2 * norm, 2.0 * k2 * norm, k2 * norm],
            a: [1.0, 2.0 * (k2 - 1.0) * norm, (1.0 - sqrt2 * k + k2) * norm],
        };

        Self::new(coeffs)
    }

    /// Create a second-order Butterworth highpass filter
    #[must_use]
    pub fn highpass(sample_rate: f64, cutoff: f64) -> Self {
        let omega = std::f64::consts::PI * cutoff / sample_rate;
        let k = omega.tan();
        let k2 = k * k;
        let sqrt2 = std::f64::consts::SQRT_2;

        let norm = 1.0 / (1.0 + sqrt2 * k + k2);

        let coeffs = BiquadCoeffs {
            b: [norm, -2.0 * norm, norm],
            a: [1.0, 2.0 * (k2 - 1.0) * norm, (1.0 - sqrt2 * k + k2) * norm],
        };

        Self::new(coeffs)
    }

    /// Process a single sample
    #[inline]
    pub fn filter(&mut self, input: f64) -> f64 {
        let output = self.coeffs.b[0] * input
            + self.coeffs.b[1] * self.state[0]
            + self.coeffs.b[2] * self.state[1]
            - self.coeffs.a[1] * self.state[0]
            - self.coeffs.a[2] * self.state[1];

        self.state[1] = self.state[0];
        self.state[0] = output;

        output
    }

    /// Reset filter state
    pub fn reset(&mut self) {
        self.state = [0.0, 0.0];
    }
}

/// Bandpass filter for the configured passband
#[derive(Clone, Debug)]
pub struct BandpassFilter {
    lowpass: Biquad,
    highpass: Biquad,
}

impl BandpassFilter {
    /// Create a bandpass filter for a frequency range
    #[must_use]
    pub fn new(sample_rate: f64, low_cutoff: f64, high_cutoff: f64) -> Self {
        Self {
            lowpass: Biquad::lowpass(sample_rate, high_cutoff),
            highpass: Biquad::highpass(sample_rate, low_cutoff),
        }
    }

    /// Process a single sample
    #[inline]
    pub fn filter(&mut self, input: f64) -> f64 {
        let hp_out = self.highpass.filter(input);
        self.lowpass.filter(hp_out)
    }

    /// Reset filter state
    pub fn reset(&mut self) {
        self.lowpass.reset();
        self.highpass.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rms(samples: &[f64]) -> f64 {
        (samples.iter().map(|s| s * s).sum::<f64>() / samples.len() as f64).sqrt()
    }

    fn sine(freq: f64, fs: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / fs).sin())
            .collect()
    }

    #[test]
    fn test_bandpass_passes_in_band() {
        let mut filter = BandpassFilter::new(500.0, 4.0, 8.0);
        let input = sine(6.0, 500.0, 2000);
        let output: Vec<f64> = input.iter().map(|&s| filter.filter(s)).collect();

        // After settling, an in-band tone keeps most of its energy
        let ratio = rms(&output[1000..]) / rms(&input[1000..]);
        assert!(ratio > 0.7, "in-band attenuation too strong: {ratio}");
    }

    #[test]
    fn test_bandpass_rejects_out_of_band() {
        let mut filter = BandpassFilter::new(500.0, 4.0, 8.0);
        let input = sine(60.0, 500.0, 2000);
        let output: Vec<f64> = input.iter().map(|&s| filter.filter(s)).collect();

        let ratio = rms(&output[1000..]) / rms(&input[1000..]);
        assert!(ratio < 0.3, "out-of-band rejection too weak: {ratio}");
    }

    #[test]
    fn test_reset_clears_state() {
        let mut filter = BandpassFilter::new(500.0, 4.0, 8.0);
        for i in 0..100 {
            filter.filter(f64::from(i));
        }
        filter.reset();

        let mut fresh = BandpassFilter::new(500.0, 4.0, 8.0);
        assert_eq!(filter.filter(1.0), fresh.filter(1.0));
    }
}
