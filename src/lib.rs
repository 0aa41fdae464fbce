//! Multi-monitor desktop screen recorder: DXGI Desktop Duplication capture,
//! a delta-replay compositor onto a shared virtual-desktop surface, hardware
//! cursor composition, and a Media Foundation sink writer producing MP4
//! (H.264 + AAC).
//!
//! [`recorder::RecorderThread`] is the entry point every other module serves:
//! it owns the per-recording lifecycle described in its own docs, built from
//! a [`config::Configuration`] the shell (see `main.rs`) assembles from CLI
//! flags or a JSON blob.

pub mod audio;
pub mod config;
pub mod cursor;
pub mod duplication;
pub mod error;
pub mod geometry;
pub mod gpu;
pub mod keyed_mutex;
pub mod media_sample;
pub mod pipeline;
pub mod recorder;
pub mod shader;
pub mod sink;
pub mod texture_pool;
pub mod virtual_desktop;

pub use config::Configuration;
pub use error::{RecorderError, Result};
pub use recorder::{RecorderHandle, RecorderThread, RecordingOutcome};
