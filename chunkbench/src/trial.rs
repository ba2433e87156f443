//! One measurement attempt: clear the page cache, run one implementation's read path
//! against one dataset, and record wall time and peak memory.
//!
//! Only shape errors escape a trial. Every other failure is logged and the trial is
//! recorded as unmeasured, so one misbehaving implementation cannot stop the others.

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    path::Path,
    process::Stdio,
    sync::Arc,
};

use serde_with::{serde_as, DisplayFromStr};
use tracing::{debug, info, warn};

use crate::{
    config::{ExternalCommand, ImplementationConfig, ImplementationKind},
    diagnostics::{self, ParseError, KILOBYTES_PER_GIGABYTE},
    engines::{setup_engine, Engine, EngineKind, ReadMode},
    grid::ShapeError,
    platform::Platform,
    store::{FilesystemStore, OpenError, ReadError},
};

/// Wall time and peak memory of a trial, always recorded together.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize)]
pub struct Measurement {
    pub wall_time_secs: f64,
    pub peak_memory_gb: f64,
}

/// What a trial measures.
#[derive(Clone, Copy, Debug)]
pub struct TrialTarget<'a> {
    pub implementation: &'a str,
    pub dataset: &'a Path,
    pub mode: ReadMode,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct Trial {
    pub implementation: String,
    pub dataset: String,
    #[serde_as(as = "DisplayFromStr")]
    pub mode: ReadMode,
    /// `None` if the trial failed or its output could not be parsed.
    pub measurement: Option<Measurement>,
}

impl Trial {
    pub fn new(target: &TrialTarget<'_>, measurement: Option<Measurement>) -> Self {
        Trial {
            implementation: target.implementation.to_owned(),
            dataset: target.dataset.display().to_string(),
            mode: target.mode,
            measurement,
        }
    }

    pub fn concurrency(&self) -> Option<NonZeroUsize> {
        self.mode.concurrency()
    }

    pub fn wall_time_secs(&self) -> Option<f64> {
        self.measurement.map(|m| m.wall_time_secs)
    }

    pub fn peak_memory_gb(&self) -> Option<f64> {
        self.measurement.map(|m| m.peak_memory_gb)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TrialError {
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("unknown implementation {0:?}")]
    UnknownImplementation(String),
    #[error("starting engine {engine}: {source}")]
    Engine {
        engine: EngineKind,
        #[source]
        source: std::io::Error,
    },
    #[error("launching {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program:?} exited with {status}: {stderr_tail}")]
    ExitStatus {
        program: String,
        status: std::process::ExitStatus,
        stderr_tail: String,
    },
    #[error("peak memory of this process is unavailable")]
    PeakMemoryUnavailable,
}

impl From<OpenError> for TrialError {
    fn from(e: OpenError) -> Self {
        match e {
            OpenError::Shape(e) => TrialError::Shape(e),
            OpenError::Read(e) => TrialError::Read(e),
        }
    }
}

/// Produces one [`Trial`] per call.
pub trait Measure {
    fn measure(&mut self, target: &TrialTarget<'_>) -> Result<Trial, ShapeError>;
}

pub struct TrialRunner<P> {
    platform: P,
    implementations: HashMap<String, ImplementationKind>,
    engines: HashMap<EngineKind, Box<dyn Engine>>,
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    lines[lines.len().saturating_sub(5)..].join(" | ")
}

impl<P: Platform> TrialRunner<P> {
    pub fn new(platform: P, implementations: &[ImplementationConfig]) -> Self {
        Self {
            platform,
            implementations: implementations
                .iter()
                .map(|i| (i.name.clone(), i.kind.clone()))
                .collect(),
            engines: HashMap::new(),
        }
    }

    #[tracing::instrument(skip_all, fields(implementation = %target.implementation, dataset = %target.dataset.display(), mode = %target.mode))]
    pub fn run_trial(&mut self, target: &TrialTarget<'_>) -> Result<Trial, ShapeError> {
        if let Err(e) = self.platform.clear_cache() {
            warn!(error = %e, "could not clear the page cache, measuring warm");
        }
        let measurement = match self.invoke(target) {
            Ok(measurement) => Some(measurement),
            Err(TrialError::Shape(e)) => return Err(e),
            Err(e) => {
                warn!(error = %e, "trial failed, recording it as unmeasured");
                None
            }
        };
        match &measurement {
            Some(m) => info!(
                wall_time_secs = m.wall_time_secs,
                peak_memory_gb = m.peak_memory_gb,
                "trial finished"
            ),
            None => info!("trial unmeasured"),
        }
        Ok(Trial::new(target, measurement))
    }

    fn invoke(&mut self, target: &TrialTarget<'_>) -> Result<Measurement, TrialError> {
        let kind = self
            .implementations
            .get(target.implementation)
            .cloned()
            .ok_or_else(|| TrialError::UnknownImplementation(target.implementation.to_owned()))?;
        match kind {
            ImplementationKind::InProcess { engine } => self.invoke_in_process(engine, target),
            ImplementationKind::External(command) => self.invoke_external(&command, target),
        }
    }

    fn invoke_in_process(
        &mut self,
        kind: EngineKind,
        target: &TrialTarget<'_>,
    ) -> Result<Measurement, TrialError> {
        let store = FilesystemStore::open(target.dataset)?;
        let engine = match self.engines.entry(kind) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => e.insert(
                setup_engine(kind).map_err(|source| TrialError::Engine { engine: kind, source })?,
            ),
        };
        self.platform.reset_peak_memory();
        let report = engine.read(Arc::new(store), target.mode)?;
        debug!(%report, "in-process read finished");
        let kilobytes = self
            .platform
            .peak_memory_kilobytes()
            .ok_or(TrialError::PeakMemoryUnavailable)?;
        Ok(Measurement {
            wall_time_secs: report.elapsed.as_secs_f64(),
            peak_memory_gb: kilobytes as f64 / KILOBYTES_PER_GIGABYTE,
        })
    }

    fn invoke_external(
        &self,
        external: &ExternalCommand,
        target: &TrialTarget<'_>,
    ) -> Result<Measurement, TrialError> {
        let program = external.program.display().to_string();
        let mut command = self.platform.timed_command(external.program.as_os_str());
        command.args(&external.args);
        match target.mode {
            ReadMode::All => {
                if let Some(flag) = &external.read_all_flag {
                    command.arg(flag);
                }
            }
            ReadMode::Chunks(Some(limit)) => {
                if let Some(flag) = &external.concurrency_flag {
                    command.arg(flag).arg(limit.to_string());
                }
            }
            ReadMode::Chunks(None) => {}
        }
        command.arg(target.dataset);
        debug!(?command, "launching");
        let output = command
            .stdin(Stdio::null())
            .output()
            .map_err(|source| TrialError::Spawn {
                program: program.clone(),
                source,
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(%stdout, %stderr, "captured output");
        if !output.status.success() {
            return Err(TrialError::ExitStatus {
                program,
                status: output.status,
                stderr_tail: stderr_tail(&stderr),
            });
        }
        Ok(diagnostics::parse_time_report(&stderr)?)
    }
}

impl<P: Platform> Measure for TrialRunner<P> {
    fn measure(&mut self, target: &TrialTarget<'_>) -> Result<Trial, ShapeError> {
        self.run_trial(target)
    }
}
