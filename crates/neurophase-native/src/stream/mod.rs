//! Real-time stream orchestration
//!
//! Wires the numerical building blocks into the two-thread pipeline: the
//! host's audio-style callback drives [`phase::PhaseStream`] and
//! [`coherence::CoherenceStream`], while a [`worker::ComputeWorker`] runs
//! the heavy fits on its own schedule. All hot-path data crosses threads
//! through `neurophase_core::sync`; only the event queues take a lock.
//!
//! - [`host`]: Narrow capability interface to the surrounding host
//! - [`worker`]: Background compute thread lifecycle
//! - [`events`]: Phase visualization events and their queue
//! - [`phase`]: Instantaneous phase/magnitude pipeline
//! - [`coherence`]: Cross-spectral coherence pipeline

pub mod coherence;
pub mod events;
pub mod host;
pub mod phase;
pub mod worker;

use neurophase_core::error::ConfigError;
use neurophase_core::SyncError;
use thiserror::Error;

/// Errors from stream lifecycle operations.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Configuration rejected
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Synchronization contract violated
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Operation requires a stopped stream
    #[error("stream is running; stop it before reconfiguring")]
    Running,

    /// No host channel passed sample-rate validation
    #[error("no usable channels are active")]
    NoUsableChannels,
}

/// Result alias for stream operations.
pub type StreamResult<T> = Result<T, StreamError>;
