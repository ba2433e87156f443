//! The benchmark description: which implementations to compare, on which datasets,
//! at which concurrency levels, and how many trials per combination.
//!
//! ```json
//! {
//!   "best_of": 3,
//!   "datasets": ["data/benchmark.zarr", "data/benchmark_compress_shard.zarr"],
//!   "concurrency": [1, 4, 16, null],
//!   "implementations": [
//!     { "name": "chunkbench_blocking", "kind": "in_process", "engine": "tokio-spawn-blocking" },
//!     {
//!       "name": "tensorstore",
//!       "kind": "external",
//!       "program": "./scripts/tensorstore_benchmark_read_async.py",
//!       "concurrency_flag": "--concurrent_chunks",
//!       "read_all_flag": "--read_all"
//!     }
//!   ]
//! }
//! ```

use std::{
    collections::HashSet,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use crate::{
    engines::{EngineKind, ReadMode},
    platform::HostPlatform,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no datasets configured")]
    NoDatasets,
    #[error("no implementations configured")]
    NoImplementations,
    #[error("no concurrency levels configured and read_all is not set")]
    NoConcurrencyLevels,
    #[error("implementation name must not be empty")]
    EmptyImplementationName,
    #[error("implementation {0:?} is configured more than once")]
    DuplicateImplementation(String),
    #[error("dataset {0:?} is configured more than once")]
    DuplicateDataset(PathBuf),
    #[error("concurrency level {0} is configured more than once")]
    DuplicateConcurrency(ReadMode),
    #[error("external implementation {name:?} needs {flag} for the configured read modes")]
    MissingFlag { name: String, flag: &'static str },
    #[error("platform override {0} must not be empty")]
    EmptyOverride(&'static str),
}

fn default_best_of() -> NonZeroUsize {
    NonZeroUsize::new(3).expect("3 is non-zero")
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BenchmarkConfig {
    /// Trials per (implementation, dataset, concurrency) combination.
    #[serde(default = "default_best_of")]
    pub best_of: NonZeroUsize,
    pub datasets: Vec<PathBuf>,
    /// Read each array in one operation; `concurrency` is ignored.
    #[serde(default)]
    pub read_all: bool,
    /// Chunk concurrency levels; `null` is unbounded.
    #[serde(default)]
    pub concurrency: Vec<Option<NonZeroUsize>>,
    pub implementations: Vec<ImplementationConfig>,
    #[serde(default)]
    pub platform: PlatformOverrides,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ImplementationConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: ImplementationKind,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImplementationKind {
    /// Read through [`crate::store::FilesystemStore`] inside this process.
    InProcess { engine: EngineKind },
    /// Launch a program under the platform timer and parse its resource report.
    External(ExternalCommand),
}

/// An external read benchmark, invoked as
/// `<timer> <program> <args..> [<concurrency_flag> N | <read_all_flag>] <dataset>`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExternalCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub concurrency_flag: Option<String>,
    #[serde(default)]
    pub read_all_flag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformOverrides {
    #[serde(default)]
    pub clear_cache_command: Option<Vec<String>>,
    #[serde(default)]
    pub timer_command: Option<Vec<String>>,
}

impl PlatformOverrides {
    pub fn apply(&self, mut platform: HostPlatform) -> HostPlatform {
        if let Some(command) = &self.clear_cache_command {
            platform = platform.with_clear_cache_command(command.clone());
        }
        if let Some(command) = &self.timer_command {
            platform = platform.with_timer_command(command.clone());
        }
        platform
    }
}

impl BenchmarkConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let config: BenchmarkConfig =
            serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
                path: path.to_owned(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.datasets.is_empty() {
            return Err(ConfigError::NoDatasets);
        }
        if self.implementations.is_empty() {
            return Err(ConfigError::NoImplementations);
        }
        if !self.read_all && self.concurrency.is_empty() {
            return Err(ConfigError::NoConcurrencyLevels);
        }
        let mut datasets = HashSet::new();
        if let Some(dataset) = self.datasets.iter().find(|d| !datasets.insert(*d)) {
            return Err(ConfigError::DuplicateDataset(dataset.clone()));
        }
        if !self.read_all {
            let mut levels = HashSet::new();
            if let Some(level) = self.concurrency.iter().find(|l| !levels.insert(*l)) {
                return Err(ConfigError::DuplicateConcurrency(ReadMode::Chunks(*level)));
            }
        }
        let mut names = HashSet::new();
        for implementation in &self.implementations {
            if implementation.name.is_empty() {
                return Err(ConfigError::EmptyImplementationName);
            }
            if !names.insert(implementation.name.as_str()) {
                return Err(ConfigError::DuplicateImplementation(
                    implementation.name.clone(),
                ));
            }
            if let ImplementationKind::External(command) = &implementation.kind {
                let missing = |flag| ConfigError::MissingFlag {
                    name: implementation.name.clone(),
                    flag,
                };
                if self.read_all && command.read_all_flag.is_none() {
                    return Err(missing("read_all_flag"));
                }
                if !self.read_all
                    && self.concurrency.iter().any(Option::is_some)
                    && command.concurrency_flag.is_none()
                {
                    return Err(missing("concurrency_flag"));
                }
            }
        }
        if matches!(&self.platform.clear_cache_command, Some(c) if c.is_empty()) {
            return Err(ConfigError::EmptyOverride("clear_cache_command"));
        }
        if matches!(&self.platform.timer_command, Some(c) if c.is_empty()) {
            return Err(ConfigError::EmptyOverride("timer_command"));
        }
        Ok(())
    }

    /// The read modes that make up the rows of each dataset, in configured order.
    pub fn read_modes(&self) -> Vec<ReadMode> {
        if self.read_all {
            vec![ReadMode::All]
        } else {
            self.concurrency
                .iter()
                .map(|limit| ReadMode::Chunks(*limit))
                .collect()
        }
    }

    pub fn implementation_names(&self) -> Vec<String> {
        self.implementations
            .iter()
            .map(|implementation| implementation.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"{
        "best_of": 2,
        "datasets": ["data/benchmark.zarr", "data/benchmark_compress.zarr"],
        "concurrency": [1, 8, null],
        "implementations": [
            { "name": "chunkbench_blocking", "kind": "in_process", "engine": "tokio-spawn-blocking" },
            {
                "name": "tensorstore",
                "kind": "external",
                "program": "./scripts/tensorstore_benchmark_read_async.py",
                "concurrency_flag": "--concurrent_chunks",
                "read_all_flag": "--read_all"
            }
        ],
        "platform": { "clear_cache_command": ["true"] }
    }"#;

    fn example() -> BenchmarkConfig {
        serde_json::from_str(EXAMPLE).unwrap()
    }

    #[test]
    fn parse_example() {
        let config = example();
        config.validate().unwrap();
        assert_eq!(config.best_of.get(), 2);
        assert_eq!(
            config.read_modes(),
            vec![
                ReadMode::Chunks(NonZeroUsize::new(1)),
                ReadMode::Chunks(NonZeroUsize::new(8)),
                ReadMode::Chunks(None),
            ]
        );
        assert_eq!(
            config.implementation_names(),
            vec!["chunkbench_blocking", "tensorstore"]
        );
        assert_eq!(
            config.implementations[0].kind,
            ImplementationKind::InProcess {
                engine: EngineKind::TokioSpawnBlocking
            }
        );
        let ImplementationKind::External(command) = &config.implementations[1].kind else {
            panic!("expected an external implementation");
        };
        assert!(command.args.is_empty());
        assert_eq!(command.read_all_flag.as_deref(), Some("--read_all"));
    }

    #[test]
    fn defaults() {
        let config: BenchmarkConfig = serde_json::from_str(
            r#"{ "datasets": ["a.zarr"], "read_all": true,
                 "implementations": [{ "name": "x", "kind": "in_process", "engine": "tokio-on-executor-thread" }] }"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.best_of.get(), 3);
        assert_eq!(config.read_modes(), vec![ReadMode::All]);
        assert_eq!(config.platform, PlatformOverrides::default());
    }

    #[test]
    fn rejects_zero_best_of_and_unknown_fields() {
        let zero = EXAMPLE.replace("\"best_of\": 2", "\"best_of\": 0");
        assert!(serde_json::from_str::<BenchmarkConfig>(&zero).is_err());
        let unknown = EXAMPLE.replace("\"best_of\": 2", "\"best_off\": 2");
        assert!(serde_json::from_str::<BenchmarkConfig>(&unknown).is_err());
    }

    #[test]
    fn validation() {
        let mut config = example();
        config.implementations[1].name = "chunkbench_blocking".to_owned();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateImplementation(_))
        ));

        let mut config = example();
        config.datasets.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoDatasets)));

        let mut config = example();
        config.concurrency.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NoConcurrencyLevels)
        ));
        config.read_all = true;
        config.validate().unwrap();

        let mut config = example();
        if let ImplementationKind::External(command) = &mut config.implementations[1].kind {
            command.concurrency_flag = None;
        }
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingFlag {
                flag: "concurrency_flag",
                ..
            })
        ));
        // unbounded only: no flag needed
        config.concurrency = vec![None];
        config.validate().unwrap();

        let mut config = example();
        config.datasets.push(PathBuf::from("data/benchmark.zarr"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateDataset(d)) if d == Path::new("data/benchmark.zarr")
        ));

        let mut config = example();
        config.concurrency.push(None);
        let err = config.validate().unwrap_err();
        assert!(
            matches!(err, ConfigError::DuplicateConcurrency(ReadMode::Chunks(None))),
            "{err}"
        );
        assert_eq!(err.to_string(), "concurrency level unbounded is configured more than once");
        // ignored when every row reads the whole array
        config.read_all = true;
        config.validate().unwrap();

        let mut config = example();
        config.platform.clear_cache_command = Some(vec![]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyOverride(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.json");
        std::fs::write(&path, EXAMPLE).unwrap();
        assert_eq!(BenchmarkConfig::load(&path).unwrap(), example());
        assert!(matches!(
            BenchmarkConfig::load(&dir.path().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));
        std::fs::write(&path, "[]").unwrap();
        assert!(matches!(
            BenchmarkConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
