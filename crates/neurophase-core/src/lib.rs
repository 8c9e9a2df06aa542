//! Neurophase Core - foundational types and the lock-free exchange primitive
//!
//! This crate provides the pieces shared between the real-time acquisition
//! path and the background analysis path of the neurophase pipeline:
//!
//! - [`sync`]: Triple-buffered single-writer/single-reader exchange
//! - [`types`]: Channel state, output modes, and stream parameters
//! - [`error`]: Error types for synchronization and configuration
//!
//! # Example
//!
//! ```rust
//! use neurophase_core::sync::AtomicallyShared;
//!
//! let shared = AtomicallyShared::new(|| vec![0.0f64; 8]);
//! let mut writer = shared.writer().unwrap();
//! let mut reader = shared.reader().unwrap();
//!
//! writer[0] = 42.0;
//! writer.publish();
//!
//! assert!(reader.pull_update());
//! assert_eq!(reader.get().unwrap()[0], 42.0);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod error;
pub mod sync;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{ConfigError, SyncError};
pub use sync::{AtomicallyShared, Reader, Writer};
pub use types::{ChannelState, OutputMode, StreamParameter, Weighting};
