//! Best-of-N reduction of repeated trials.
//!
//! Time and memory are reduced as independent series: the reported best time and best
//! memory may come from different trials.

use std::num::NonZeroUsize;

use tracing::debug;

use crate::{
    grid::ShapeError,
    trial::{Measure, Trial, TrialTarget},
};

/// The trials of one (implementation, dataset, concurrency) combination, in run order.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct TrialGroup {
    pub trials: Vec<Trial>,
}

impl TrialGroup {
    pub fn best(&self) -> ResultCell {
        ResultCell::from_trials(&self.trials)
    }

    pub fn num_measured(&self) -> usize {
        self.trials
            .iter()
            .filter(|trial| trial.measurement.is_some())
            .count()
    }
}

/// Minimum wall time and minimum peak memory over the measured trials of a group.
/// `None` when no trial was measured.
#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize)]
pub struct ResultCell {
    pub best_time_secs: Option<f64>,
    pub best_memory_gb: Option<f64>,
}

/// Minimum of the values that are not NaN.
fn nan_min(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    values
        .into_iter()
        .filter(|v| !v.is_nan())
        .fold(None, |best, v| Some(best.map_or(v, |b: f64| b.min(v))))
}

impl ResultCell {
    pub fn from_trials<'a>(trials: impl IntoIterator<Item = &'a Trial> + Clone) -> Self {
        ResultCell {
            best_time_secs: nan_min(trials.clone().into_iter().filter_map(Trial::wall_time_secs)),
            best_memory_gb: nan_min(trials.into_iter().filter_map(Trial::peak_memory_gb)),
        }
    }
}

/// Run `trial_count` trials of `target` back to back.
///
/// A shape error in any trial aborts the group.
pub fn run_group<M: Measure + ?Sized>(
    measure: &mut M,
    target: &TrialTarget<'_>,
    trial_count: NonZeroUsize,
) -> Result<TrialGroup, ShapeError> {
    let mut trials = Vec::with_capacity(trial_count.get());
    for i in 0..trial_count.get() {
        debug!(trial = i, of = trial_count.get(), "starting trial");
        trials.push(measure.measure(target)?);
    }
    Ok(TrialGroup { trials })
}

/// Best-of-`trial_count` result for `target`.
pub fn aggregate<M: Measure + ?Sized>(
    measure: &mut M,
    target: &TrialTarget<'_>,
    trial_count: NonZeroUsize,
) -> Result<ResultCell, ShapeError> {
    Ok(run_group(measure, target, trial_count)?.best())
}
