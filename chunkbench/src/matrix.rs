//! Assembles best-of-N results for every (dataset, read mode, implementation) into one
//! table with (dataset, read mode) rows and (metric, implementation) columns.
//!
//! Cells are measured strictly one after another: datasets outermost, then read modes,
//! then implementations. The layout depends only on the configured order, so identical
//! inputs always produce the identical table.

use std::{fmt::Display, num::NonZeroUsize, path::PathBuf};

use itertools::Itertools;
use serde::ser::Serialize;
use tracing::info;

use crate::{
    aggregate::{run_group, ResultCell, TrialGroup},
    engines::ReadMode,
    grid::ShapeError,
    trial::{Measure, TrialTarget},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Metric {
    WallTime,
    PeakMemory,
}

pub const METRICS: [Metric; 2] = [Metric::WallTime, Metric::PeakMemory];

impl Metric {
    pub fn of(&self, cell: &ResultCell) -> Option<f64> {
        match self {
            Metric::WallTime => cell.best_time_secs,
            Metric::PeakMemory => cell.best_memory_gb,
        }
    }
}

impl Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Metric::WallTime => "Time (s)",
            Metric::PeakMemory => "Memory (GB)",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RowKey {
    pub dataset: String,
    pub mode: ReadMode,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ColumnKey {
    pub metric: Metric,
    pub implementation: String,
}

/// Two decimals, or `N/A` for a value no trial could measure.
pub fn format_value(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.2}"),
        None => "N/A".to_owned(),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResultMatrix {
    rows: Vec<RowKey>,
    columns: Vec<ColumnKey>,
    data: Vec<Vec<Option<f64>>>,
}

impl ResultMatrix {
    pub fn rows(&self) -> &[RowKey] {
        &self.rows
    }

    pub fn columns(&self) -> &[ColumnKey] {
        &self.columns
    }

    pub fn get(&self, row: &RowKey, column: &ColumnKey) -> Option<Option<f64>> {
        let r = self.rows.iter().position(|k| k == row)?;
        let c = self.columns.iter().position(|k| k == column)?;
        Some(self.data[r][c])
    }

    /// The matrix as nested (row, [(column, value)]) pairs, in layout order.
    pub fn to_nested(&self) -> Vec<(&RowKey, Vec<(&ColumnKey, Option<f64>)>)> {
        self.rows
            .iter()
            .zip(&self.data)
            .map(|(row, values)| (row, self.columns.iter().zip(values.iter().copied()).collect()))
            .collect()
    }

    /// Display labels for the columns: the metric on the first column of its group only,
    /// then the implementation with `_` turned into line breaks.
    pub fn column_labels(&self) -> Vec<String> {
        self.columns
            .iter()
            .group_by(|column| column.metric)
            .into_iter()
            .flat_map(|(metric, columns)| {
                columns.enumerate().map(move |(i, column)| {
                    format!(
                        "{}<br>{}",
                        if i == 0 { metric.to_string() } else { String::new() },
                        column.implementation.replace('_', "<br>"),
                    )
                })
            })
            .collect()
    }
}

/// Serialises in the "tight" tabular layout: `index`, `columns`, `data`,
/// `index_names`, `column_names`. Unmeasured values are `null`.
impl Serialize for ResultMatrix {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[derive(serde::Serialize)]
        struct Tight<'a> {
            index: Vec<(&'a str, String)>,
            columns: Vec<(String, &'a str)>,
            data: &'a [Vec<Option<f64>>],
            index_names: [&'static str; 2],
            column_names: [&'static str; 2],
        }
        Tight {
            index: self
                .rows
                .iter()
                .map(|row| (row.dataset.as_str(), row.mode.to_string()))
                .collect(),
            columns: self
                .columns
                .iter()
                .map(|column| (column.metric.to_string(), column.implementation.as_str()))
                .collect(),
            data: &self.data,
            index_names: ["Dataset", "Concurrency"],
            column_names: ["Metric", "Implementation"],
        }
        .serialize(serializer)
    }
}

/// Everything a benchmark run produced.
#[derive(Clone, Debug, serde::Serialize)]
pub struct BenchmarkRun {
    pub matrix: ResultMatrix,
    pub groups: Vec<TrialGroup>,
}

/// Measure every combination and lay the results out as a [`ResultMatrix`].
///
/// Stops at the first shape error.
pub fn build<M: Measure + ?Sized>(
    measure: &mut M,
    implementations: &[String],
    datasets: &[PathBuf],
    modes: &[ReadMode],
    best_of: NonZeroUsize,
) -> Result<BenchmarkRun, ShapeError> {
    let columns: Vec<ColumnKey> = METRICS
        .iter()
        .cartesian_product(implementations)
        .map(|(metric, implementation)| ColumnKey {
            metric: *metric,
            implementation: implementation.clone(),
        })
        .collect();

    let mut rows = Vec::with_capacity(datasets.len() * modes.len());
    let mut data = Vec::with_capacity(datasets.len() * modes.len());
    let mut groups = Vec::new();
    for (dataset, mode) in datasets.iter().cartesian_product(modes) {
        let mut cells = Vec::with_capacity(implementations.len());
        for implementation in implementations {
            let target = TrialTarget {
                implementation,
                dataset,
                mode: *mode,
            };
            let group = run_group(measure, &target, best_of)?;
            cells.push(group.best());
            groups.push(group);
        }
        let row: Vec<Option<f64>> = METRICS
            .iter()
            .flat_map(|metric| cells.iter().map(|cell| metric.of(cell)))
            .collect();
        info!(
            dataset = %dataset.display(),
            %mode,
            values = %row.iter().map(|v| format_value(*v)).join(" "),
            "row complete"
        );
        rows.push(RowKey {
            dataset: dataset.display().to_string(),
            mode: *mode,
        });
        data.push(row);
    }

    Ok(BenchmarkRun {
        matrix: ResultMatrix {
            rows,
            columns,
            data,
        },
        groups,
    })
}
