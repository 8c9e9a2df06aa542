//! Core data types shared by the streaming and analysis tiers.

use serde::{Deserialize, Serialize};

/// Per-channel readiness of the phase pipeline.
///
/// A channel starts at [`NotFull`](ChannelState::NotFull) while its history
/// buffer accumulates, advances to [`FullNoAr`](ChannelState::FullNoAr) once
/// the buffer holds a complete window, and to [`FullAr`](ChannelState::FullAr)
/// once the background thread has produced the first model snapshot. Output
/// is emitted only in the final state; otherwise the output region is zeroed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    /// History buffer still filling
    #[default]
    NotFull,
    /// History full, no model snapshot available yet
    FullNoAr,
    /// History full and a model snapshot has been published
    FullAr,
}

/// What the phase pipeline writes into the output buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputMode {
    /// Instantaneous phase in degrees
    #[default]
    Phase,
    /// Instantaneous magnitude of the analytic signal
    Magnitude,
    /// Phase on the primary channel, magnitude on a paired extra channel
    PhaseAndMagnitude,
    /// Imaginary (quadrature) component of the analytic signal
    Imaginary,
}

impl OutputMode {
    /// Whether this mode produces a phase stream that needs unwrap/smooth
    /// post-processing.
    #[must_use]
    pub fn outputs_phase(&self) -> bool {
        matches!(self, Self::Phase | Self::PhaseAndMagnitude)
    }
}

/// Averaging scheme for the coherence accumulator.
///
/// The two schemes are mutually exclusive; changing the scheme resets all
/// accumulated statistics. `Exponential { alpha: 0.0 }` behaves identically
/// to `Linear`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Weighting {
    /// Plain running mean over all trials
    Linear,
    /// Exponential moving average with decay `alpha`
    Exponential {
        /// Decay constant, `alpha >= 0`
        alpha: f64,
    },
}

impl Default for Weighting {
    fn default() -> Self {
        Self::Linear
    }
}

impl Weighting {
    /// The effective decay constant (0 for linear weighting).
    #[must_use]
    pub fn alpha(&self) -> f64 {
        match self {
            Self::Linear => 0.0,
            Self::Exponential { alpha } => *alpha,
        }
    }
}

/// Parameter changes pushed from the host/editor side.
///
/// Carried as an enum + value pair so the host can forward its generic
/// "set parameter" calls without knowing pipeline internals.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum StreamParameter {
    /// Background recalculation interval in milliseconds
    RecalcIntervalMs(u32),
    /// AR model order
    ArOrder(usize),
    /// Bandpass low cutoff in Hz
    LowCut(f64),
    /// Bandpass high cutoff in Hz
    HighCut(f64),
    /// Output buffer content selection
    Output(OutputMode),
    /// Coherence segment length in seconds
    SegmentLength(f64),
    /// Analysis window length in seconds
    WindowLength(f64),
    /// Stride between analysis windows in seconds
    StepLength(f64),
    /// Start of the frequency range of interest in Hz
    FreqStart(f64),
    /// End of the frequency range of interest in Hz
    FreqEnd(f64),
    /// Trial weighting scheme
    TrialWeighting(Weighting),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_state_default() {
        assert_eq!(ChannelState::default(), ChannelState::NotFull);
    }

    #[test]
    fn test_output_mode_phase_flag() {
        assert!(OutputMode::Phase.outputs_phase());
        assert!(OutputMode::PhaseAndMagnitude.outputs_phase());
        assert!(!OutputMode::Magnitude.outputs_phase());
        assert!(!OutputMode::Imaginary.outputs_phase());
    }

    #[test]
    fn test_weighting_alpha() {
        assert_eq!(Weighting::Linear.alpha(), 0.0);
        assert_eq!(Weighting::Exponential { alpha: 0.125 }.alpha(), 0.125);
    }
}
