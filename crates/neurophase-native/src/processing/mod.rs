//! Numerical building blocks for the streaming pipeline
//!
//! - [`filters`]: Butterworth biquads and the bandpass cascade
//! - [`ar`]: Burg autoregressive modeling and forward prediction
//! - [`hilbert`]: FIR Hilbert transformation and phase post-processing
//! - [`spectral`]: Time-frequency decomposition and coherence accumulation

pub mod ar;
pub mod filters;
pub mod hilbert;
pub mod spectral;
