//! Profiling session coordination for live processes.
//!
//! This crate provides the in-process half of Periscope: a single-flight
//! guard around a pluggable sampling engine, a facade for starting and
//! stopping profiling sessions, and a bounded queue that uploads finished
//! profiles in the background so slow storage never blocks the profiled
//! process.

pub mod backend;
pub mod engine;
pub mod error;
pub mod lock;
pub mod params;
pub mod profile;
pub mod profiler;
pub mod storage;
pub mod time;
pub mod upload_queue;

pub use backend::Backend;
pub use engine::SamplingEngine;
pub use error::Error;
pub use lock::SessionLock;
pub use params::{ProfileMode, SessionParams};
pub use profile::{Profile, ProfileId};
pub use profiler::{Profiler, RunOutcome};
pub use storage::{FileStorage, Storage, UploadLocation};
pub use upload_queue::{QueueConfig, UploadQueue};
