use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use chunkbench::{
    config::BenchmarkConfig,
    engines::{setup_engine, EngineKind, ReadMode},
    matrix::{self, format_value, ResultMatrix},
    platform::HostPlatform,
    store::FilesystemStore,
    trial::{Trial, TrialRunner},
};
use clap::Parser;
use itertools::Itertools;
use tracing::info;

mod generate;

#[derive(clap::Parser)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Read one array in this process and print a throughput summary.
    Read {
        path: PathBuf,
        /// Maximum number of chunks in flight. Unbounded if omitted.
        #[clap(long)]
        concurrent_chunks: Option<NonZeroUsize>,
        /// Read the whole array in one operation.
        #[clap(long, conflicts_with = "concurrent_chunks")]
        read_all: bool,
        #[clap(long, default_value = "tokio-spawn-blocking")]
        engine: EngineKind,
    },
    /// Measure every configured implementation, dataset and concurrency level.
    Run {
        config: PathBuf,
        #[clap(long, default_value = "benchmark.output.json")]
        output: PathBuf,
    },
    /// Write an uncompressed array of pseudo-random data.
    Generate(generate::GenerateArgs),
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Args::parse().command {
        Command::Read {
            path,
            concurrent_chunks,
            read_all,
            engine,
        } => {
            let mode = if read_all {
                ReadMode::All
            } else {
                ReadMode::Chunks(concurrent_chunks)
            };
            read(&path, mode, engine)
        }
        Command::Run { config, output } => run(&config, &output),
        Command::Generate(args) => generate::generate(&args),
    }
}

fn read(path: &Path, mode: ReadMode, engine: EngineKind) -> anyhow::Result<()> {
    let store = FilesystemStore::open(path).with_context(|| format!("opening {path:?}"))?;
    let stored = store.size()?;
    let engine = setup_engine(engine).with_context(|| format!("starting engine {engine}"))?;
    let report = engine.read(Arc::new(store), mode)?;
    info!("{report}");
    println!("{}", report.summary_line(path, stored));
    Ok(())
}

#[derive(serde::Serialize)]
struct BenchmarkOutput<'a> {
    config: &'a BenchmarkConfig,
    trials: Vec<&'a Trial>,
    matrix: &'a ResultMatrix,
    column_labels: Vec<String>,
}

fn run(config_path: &Path, output: &Path) -> anyhow::Result<()> {
    let config = BenchmarkConfig::load(config_path)
        .with_context(|| format!("loading benchmark config {config_path:?}"))?;
    let platform = config.platform.apply(HostPlatform::detect()?);
    info!(
        host = ?platform.kind(),
        datasets = config.datasets.len(),
        implementations = config.implementations.len(),
        best_of = config.best_of.get(),
        "starting benchmark"
    );

    let start = Instant::now();
    let mut runner = TrialRunner::new(platform, &config.implementations);
    let run = matrix::build(
        &mut runner,
        &config.implementation_names(),
        &config.datasets,
        &config.read_modes(),
        config.best_of,
    )?;

    println!("{}", markdown_table(&run.matrix));

    let out = BenchmarkOutput {
        config: &config,
        trials: run.groups.iter().flat_map(|group| &group.trials).collect(),
        matrix: &run.matrix,
        column_labels: run.matrix.column_labels(),
    };
    info!("writing results to {:?}", output);
    std::fs::write(output, serde_json::to_string_pretty(&out)?)
        .with_context(|| format!("writing results to {output:?}"))?;

    let elapsed = Duration::from_millis(start.elapsed().as_millis() as u64);
    info!(elapsed = %humantime::format_duration(elapsed), "benchmark finished");
    Ok(())
}

fn markdown_table(matrix: &ResultMatrix) -> String {
    let header = ["Dataset".to_owned(), "Concurrency".to_owned()]
        .into_iter()
        .chain(matrix.column_labels())
        .collect_vec();
    let mut lines = vec![
        format!("| {} |", header.iter().join(" | ")),
        format!("|{}", header.iter().map(|_| "---|").join("")),
    ];
    for (row, values) in matrix.to_nested() {
        lines.push(format!(
            "| {} | {} | {} |",
            row.dataset,
            row.mode,
            values.iter().map(|(_, value)| format_value(*value)).join(" | ")
        ));
    }
    lines.join("\n")
}
