//! In-process engines: how admitted chunk reads execute on tokio.
//!
//! Every engine owns its runtime and blocks the calling thread until the read finishes.

use std::{fmt::Display, num::NonZeroUsize, path::Path, str::FromStr, sync::Arc, time::Duration};

use itertools::Itertools;

use crate::store::{ReadError, ReadPath};

pub mod tokio_on_executor_thread;
pub mod tokio_spawn_blocking;

pub use tokio_on_executor_thread::EngineTokioOnExecutorThread;
pub use tokio_spawn_blocking::EngineTokioSpawnBlocking;

/// How much of the array a read covers and how it is split into tasks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReadMode {
    /// One task reads the whole array.
    All,
    /// One task per chunk, at most this many in flight (`None` is unbounded).
    Chunks(Option<NonZeroUsize>),
}

impl ReadMode {
    /// The concurrency level, if any. Whole-array reads have none.
    pub fn concurrency(&self) -> Option<NonZeroUsize> {
        match self {
            ReadMode::All => None,
            ReadMode::Chunks(limit) => *limit,
        }
    }
}

impl Display for ReadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadMode::All => write!(f, "all"),
            ReadMode::Chunks(None) => write!(f, "unbounded"),
            ReadMode::Chunks(Some(limit)) => write!(f, "{limit}"),
        }
    }
}

impl FromStr for ReadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(ReadMode::All),
            "unbounded" => Ok(ReadMode::Chunks(None)),
            x => match x.parse::<NonZeroUsize>() {
                Ok(n) => Ok(ReadMode::Chunks(Some(n))),
                Err(e) => Err(format!("invalid read mode: {e}: {s:?}")),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    TokioSpawnBlocking,
    TokioOnExecutorThread,
}

impl Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EngineKind::TokioSpawnBlocking => "tokio-spawn-blocking",
            EngineKind::TokioOnExecutorThread => "tokio-on-executor-thread",
        })
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tokio-spawn-blocking" => Ok(EngineKind::TokioSpawnBlocking),
            "tokio-on-executor-thread" => Ok(EngineKind::TokioOnExecutorThread),
            x => Err(format!(
                "unknown engine {x:?}, expected tokio-spawn-blocking or tokio-on-executor-thread"
            )),
        }
    }
}

pub trait Engine: Send + Sync {
    fn read(&self, store: Arc<dyn ReadPath>, mode: ReadMode) -> Result<ReadReport, ReadError>;
}

pub fn setup_engine(kind: EngineKind) -> std::io::Result<Box<dyn Engine>> {
    Ok(match kind {
        EngineKind::TokioSpawnBlocking => Box::new(EngineTokioSpawnBlocking::new()?),
        EngineKind::TokioOnExecutorThread => Box::new(EngineTokioOnExecutorThread::new()?),
    })
}

/// What a single chunk task hands back to the engine.
pub(crate) struct ChunkRead {
    pub(crate) bytes: u64,
    pub(crate) elements: u64,
    pub(crate) latency: Duration,
}

pub(crate) fn make_latency_histogram() -> hdrhistogram::Histogram<u64> {
    // microseconds, up to an hour
    hdrhistogram::Histogram::new_with_bounds(1, 3_600_000_000, 3)
        .expect("static histogram bounds are valid")
}

const LATENCY_PERCENTILES: [f64; 5] = [50.0, 90.0, 99.0, 99.9, 99.99];

#[derive(Debug, Clone)]
pub struct ReadReport {
    pub elapsed: Duration,
    pub chunks: u64,
    pub bytes: u64,
    pub elements: u64,
    /// Per-chunk read latency in microseconds; absent for whole-array reads.
    pub latencies: Option<hdrhistogram::Histogram<u64>>,
}

impl ReadReport {
    pub(crate) fn from_chunks(elapsed: Duration, reads: Vec<ChunkRead>) -> Self {
        let mut latencies = make_latency_histogram();
        let mut bytes = 0;
        let mut elements = 0;
        for read in &reads {
            bytes += read.bytes;
            elements += read.elements;
            latencies.saturating_record(u64::try_from(read.latency.as_micros()).unwrap_or(u64::MAX));
        }
        ReadReport {
            elapsed,
            chunks: reads.len() as u64,
            bytes,
            elements,
            latencies: Some(latencies),
        }
    }

    pub(crate) fn from_whole(elapsed: Duration, bytes: u64, elements: u64) -> Self {
        ReadReport {
            elapsed,
            chunks: 0,
            bytes,
            elements,
            latencies: None,
        }
    }

    /// Stored bytes read per second, in GB/s. Zero when nothing was timed.
    pub fn throughput_gbps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes as f64 * 1e-9 / secs
    }

    /// One-line result of reading the array at `path`, whose files take `stored_bytes` on disk.
    ///
    /// Chunks are read as stored, so the byte count is what was read, not a decoded size.
    pub fn summary_line(&self, path: &Path, stored_bytes: u64) -> String {
        format!(
            "Read {} ({:.2}MB stored) in {:.2}ms ({:.2}MB read @ {:.2}GB/s)",
            path.display(),
            stored_bytes as f64 / 1e6,
            self.elapsed.as_secs_f64() * 1e3,
            self.bytes as f64 / 1e6,
            self.throughput_gbps(),
        )
    }
}

impl Display for ReadReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "t{:.3} chunks={} bytes={} elements={} TP: bw={:.2}GB/s",
            self.elapsed.as_secs_f64(),
            self.chunks,
            self.bytes,
            self.elements,
            self.throughput_gbps(),
        )?;
        if let Some(histo) = self.latencies.as_ref().filter(|h| !h.is_empty()) {
            write!(
                f,
                " LAT(us): min={} mean={:.0} max={} {}",
                histo.min(),
                histo.mean(),
                histo.max(),
                LATENCY_PERCENTILES
                    .iter()
                    .map(|p| format!("p{p}={}", histo.value_at_percentile(*p)))
                    .join(" "),
            )?;
        }
        Ok(())
    }
}
