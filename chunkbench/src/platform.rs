//! Host-specific capabilities used by the trial runner: dropping the OS page cache,
//! wrapping a program in a resource-reporting timer, and reading the peak memory of the
//! current process.
//!
//! The runner receives a [`Platform`] value instead of branching on the host itself,
//! so tests can supply a fake.

use std::{
    ffi::OsStr,
    process::{Command, Stdio},
};

use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum CacheClearError {
    #[error("clear cache command is empty")]
    EmptyCommand,
    #[error("running {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command:?} exited with {status}")]
    ExitStatus {
        command: String,
        status: std::process::ExitStatus,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported platform {0:?}: only linux and macos are supported")]
pub struct UnsupportedPlatform(pub String);

pub trait Platform: Send + Sync {
    /// Drop the OS page cache. Best effort: callers log failures and carry on.
    fn clear_cache(&self) -> Result<(), CacheClearError>;

    /// A command that runs `program` under a timer which reports wall time and peak
    /// resident memory on stderr.
    fn timed_command(&self, program: &OsStr) -> Command;

    /// Reset the peak memory watermark of this process, where the OS allows it.
    fn reset_peak_memory(&self) {}

    /// Peak resident memory of this process in kilobytes.
    fn peak_memory_kilobytes(&self) -> Option<u64>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostKind {
    Linux,
    MacOs,
}

#[derive(Clone, Debug)]
pub struct HostPlatform {
    kind: HostKind,
    clear_cache_command: Vec<String>,
    timer_command: Vec<String>,
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| (*s).to_owned()).collect()
}

impl HostPlatform {
    pub fn new(kind: HostKind) -> Self {
        let (clear_cache_command, timer_command) = match kind {
            HostKind::Linux => (
                strings(&["sudo", "sh", "-c", "sync; echo 3 > /proc/sys/vm/drop_caches"]),
                strings(&["/usr/bin/time", "-v"]),
            ),
            HostKind::MacOs => (
                strings(&["sh", "-c", "sync && sudo purge"]),
                strings(&["gtime", "-v"]),
            ),
        };
        Self {
            kind,
            clear_cache_command,
            timer_command,
        }
    }

    pub fn detect() -> Result<Self, UnsupportedPlatform> {
        match std::env::consts::OS {
            "linux" => Ok(Self::new(HostKind::Linux)),
            "macos" => Ok(Self::new(HostKind::MacOs)),
            x => Err(UnsupportedPlatform(x.to_owned())),
        }
    }

    pub fn kind(&self) -> HostKind {
        self.kind
    }

    pub fn with_clear_cache_command(mut self, command: Vec<String>) -> Self {
        self.clear_cache_command = command;
        self
    }

    pub fn with_timer_command(mut self, command: Vec<String>) -> Self {
        self.timer_command = command;
        self
    }
}

/// Parse the `VmHWM` line of `/proc/<pid>/status`.
fn parse_vm_hwm_kilobytes(status: &str) -> Option<u64> {
    status.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key != "VmHWM" {
            return None;
        }
        let (num, unit) = value.trim().split_once(char::is_whitespace)?;
        if unit.trim() != "kB" {
            return None;
        }
        num.parse().ok()
    })
}

fn max_rss_from_getrusage() -> Option<i64> {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: getrusage only writes into the struct we pass.
    let ret = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if ret != 0 {
        return None;
    }
    // SAFETY: initialised by the successful call above.
    Some(unsafe { usage.assume_init() }.ru_maxrss as i64)
}

impl Platform for HostPlatform {
    fn clear_cache(&self) -> Result<(), CacheClearError> {
        let Some((program, args)) = self.clear_cache_command.split_first() else {
            return Err(CacheClearError::EmptyCommand);
        };
        let command = self.clear_cache_command.join(" ");
        debug!(%command, "clearing page cache");
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .map_err(|source| CacheClearError::Spawn {
                command: command.clone(),
                source,
            })?;
        if !status.success() {
            return Err(CacheClearError::ExitStatus { command, status });
        }
        Ok(())
    }

    fn timed_command(&self, program: &OsStr) -> Command {
        match self.timer_command.split_first() {
            Some((timer, timer_args)) => {
                let mut command = Command::new(timer);
                command.args(timer_args).arg(program);
                command
            }
            None => Command::new(program),
        }
    }

    fn reset_peak_memory(&self) {
        if self.kind == HostKind::Linux {
            if let Err(e) = std::fs::write("/proc/self/clear_refs", "5") {
                debug!(error = %e, "could not reset peak resident set size");
            }
        }
    }

    fn peak_memory_kilobytes(&self) -> Option<u64> {
        match self.kind {
            HostKind::Linux => std::fs::read_to_string("/proc/self/status")
                .ok()
                .and_then(|status| parse_vm_hwm_kilobytes(&status))
                .or_else(|| max_rss_from_getrusage().and_then(|kb| u64::try_from(kb).ok())),
            // ru_maxrss is in bytes on macOS
            HostKind::MacOs => max_rss_from_getrusage()
                .and_then(|bytes| u64::try_from(bytes).ok())
                .map(|bytes| bytes / 1000),
        }
    }
}
