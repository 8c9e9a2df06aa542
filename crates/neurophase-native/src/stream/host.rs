//! Capability interface to the surrounding acquisition host
//!
//! The orchestrators never see the host's editor or processor types; they
//! hold a trait object exposing exactly what the pipeline needs.

/// What the pipeline may ask of its host.
pub trait HostInterface: Send + Sync {
    /// Indices of the channels currently selected for processing.
    fn active_channels(&self) -> Vec<usize>;

    /// Sample rate of one channel, in Hz. Fixed for the duration of a
    /// streaming session.
    fn sample_rate(&self, channel: usize) -> f64;

    /// Deliver a status or warning message to the host UI/log.
    fn send_status(&self, message: &str);
}

/// Fixed-configuration host, sufficient for tests and the simulator.
#[derive(Clone, Debug)]
pub struct StaticHost {
    channels: Vec<usize>,
    sample_rate_hz: f64,
}

impl StaticHost {
    /// A host with `n` active channels, all at `sample_rate_hz`.
    #[must_use]
    pub fn new(n: usize, sample_rate_hz: f64) -> Self {
        Self {
            channels: (0..n).collect(),
            sample_rate_hz,
        }
    }
}

impl HostInterface for StaticHost {
    fn active_channels(&self) -> Vec<usize> {
        self.channels.clone()
    }

    fn sample_rate(&self, _channel: usize) -> f64 {
        self.sample_rate_hz
    }

    fn send_status(&self, message: &str) {
        tracing::warn!(target: "neurophase", "{message}");
    }
}
