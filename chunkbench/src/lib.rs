//! Cache-cold read benchmarks for chunked N-dimensional array stores.
//!
//! The crate compares read implementations on two numbers per run: wall-clock time and
//! peak resident memory. Each (dataset, concurrency level, implementation) combination is
//! measured several times back to back with the OS page cache dropped before every trial,
//! and the best value per metric is kept.
//!
//! # Usage
//!
//! 1. Describe the benchmark in a [`config::BenchmarkConfig`].
//! 2. Detect the host with [`platform::HostPlatform::detect`] and apply any overrides.
//! 3. Build a [`trial::TrialRunner`] from the platform and the configured implementations.
//! 4. Call [`matrix::build`] to measure every combination into a [`matrix::ResultMatrix`].
//!
//! Implementations either run in this process, reading a [`store::FilesystemStore`]
//! through one of the [`engines`], or are external programs launched under the
//! platform's resource-reporting timer, whose report [`diagnostics`] parses.
//!
//! In-process reads split the array into the chunks of its [`grid::ChunkGrid`] and
//! keep at most N of them in flight at once, see [`scheduler::run_bounded`].
//!
//! ## Failure model
//!
//! A [`grid::ShapeError`] is a configuration error and stops the whole run. Anything
//! else that goes wrong during a trial (a crash, a missing report line, an unreadable
//! chunk) is logged and the trial is recorded as unmeasured. A cell whose trials were all
//! unmeasured is reported as `N/A`.

pub mod aggregate;
pub mod config;
pub mod diagnostics;
pub mod engines;
pub mod grid;
pub mod matrix;
pub mod platform;
pub mod scheduler;
pub mod store;
pub mod trial;

pub use config::BenchmarkConfig;
pub use engines::{Engine, EngineKind, ReadMode, ReadReport};
pub use grid::{ChunkGrid, ShapeError};
pub use matrix::{BenchmarkRun, ResultMatrix};
pub use platform::{HostPlatform, Platform};
pub use store::{FilesystemStore, ReadError, ReadPath};
pub use trial::{Measure, Measurement, Trial, TrialRunner};
