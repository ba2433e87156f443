//! Parsing of the resource report printed by `time -v` (GNU time) after a child exits.
//!
//! Only two lines matter:
//!
//! ```text
//!     Elapsed (wall clock) time (h:mm:ss or m:ss): 1:23.45
//!     Maximum resident set size (kbytes): 2500000
//! ```
//!
//! The elapsed time must be in `m:ss` form. Both lines must be present and well formed;
//! anything else is a [`ParseError`] and leaves the trial without a measurement.

use crate::trial::Measurement;

pub const WALL_CLOCK_PREFIX: &str = "Elapsed (wall clock) time (h:mm:ss or m:ss): ";
pub const MAX_RSS_PREFIX: &str = "Maximum resident set size (kbytes): ";

/// Kilobytes per (decimal) gigabyte.
pub const KILOBYTES_PER_GIGABYTE: f64 = 1.0e6;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("no wall clock time line in output")]
    MissingWallClock,
    #[error("no maximum resident set size line in output")]
    MissingMaxRss,
    #[error("malformed wall clock time {0:?}, expected m:ss")]
    MalformedWallClock(String),
    #[error("malformed maximum resident set size {0:?}, expected kilobytes")]
    MalformedMaxRss(String),
}

fn find_value<'a>(output: &'a str, prefix: &str) -> Option<&'a str> {
    output.lines().find_map(|line| {
        let at = line.find(prefix)?;
        Some(line[at + prefix.len()..].trim_end())
    })
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Parse `m:ss[.ff]` into seconds.
pub fn parse_wall_clock(value: &str) -> Result<f64, ParseError> {
    let malformed = || ParseError::MalformedWallClock(value.to_owned());
    let (minutes, seconds) = value.split_once(':').ok_or_else(malformed)?;
    if !all_digits(minutes)
        || seconds.is_empty()
        || !seconds.bytes().all(|b| b.is_ascii_digit() || b == b'.')
    {
        return Err(malformed());
    }
    let minutes: u64 = minutes.parse().map_err(|_| malformed())?;
    let seconds: f64 = seconds.parse().map_err(|_| malformed())?;
    Ok(minutes as f64 * 60.0 + seconds)
}

/// Parse a kilobyte count into decimal gigabytes.
pub fn parse_max_rss(value: &str) -> Result<f64, ParseError> {
    let malformed = || ParseError::MalformedMaxRss(value.to_owned());
    if !all_digits(value) {
        return Err(malformed());
    }
    let kilobytes: u64 = value.parse().map_err(|_| malformed())?;
    Ok(kilobytes as f64 / KILOBYTES_PER_GIGABYTE)
}

/// Extract a full [`Measurement`] from the diagnostic output of a timed child process.
pub fn parse_time_report(output: &str) -> Result<Measurement, ParseError> {
    let wall_clock = find_value(output, WALL_CLOCK_PREFIX).ok_or(ParseError::MissingWallClock)?;
    let max_rss = find_value(output, MAX_RSS_PREFIX).ok_or(ParseError::MissingMaxRss)?;
    Ok(Measurement {
        wall_time_secs: parse_wall_clock(wall_clock)?,
        peak_memory_gb: parse_max_rss(max_rss)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "\tCommand being timed: \"benchmark read data/benchmark.zarr\"
\tUser time (seconds): 3.10
\tSystem time (seconds): 1.52
\tPercent of CPU this job got: 372%
\tElapsed (wall clock) time (h:mm:ss or m:ss): 1:23.45
\tAverage shared text size (kbytes): 0
\tMaximum resident set size (kbytes): 2500000
\tExit status: 0
";

    #[test]
    fn wall_clock_line() {
        let seconds = parse_wall_clock("1:23.45").unwrap();
        assert!((seconds - 83.45).abs() < 1e-9, "{seconds}");
        assert_eq!(parse_wall_clock("0:00.52").unwrap(), 0.52);
        assert_eq!(parse_wall_clock("12:00").unwrap(), 720.0);
    }

    #[test]
    fn max_rss_line() {
        assert_eq!(parse_max_rss("2500000").unwrap(), 2.5);
        assert_eq!(parse_max_rss("1000").unwrap(), 0.001);
    }

    #[test]
    fn full_report() {
        let m = parse_time_report(REPORT).unwrap();
        assert!((m.wall_time_secs - 83.45).abs() < 1e-9);
        assert_eq!(m.peak_memory_gb, 2.5);
    }

    #[test]
    fn literal_lines() {
        let output = "Elapsed (wall clock) time (h:mm:ss or m:ss): 1:23.45\nMaximum resident set size (kbytes): 2500000\n";
        let m = parse_time_report(output).unwrap();
        assert!((m.wall_time_secs - 83.45).abs() < 1e-9);
        assert_eq!(m.peak_memory_gb, 2.5);
    }

    #[test]
    fn missing_lines() {
        assert_eq!(
            parse_time_report("Maximum resident set size (kbytes): 10\n"),
            Err(ParseError::MissingWallClock)
        );
        assert_eq!(
            parse_time_report("Elapsed (wall clock) time (h:mm:ss or m:ss): 0:01.00\n"),
            Err(ParseError::MissingMaxRss)
        );
        assert_eq!(parse_time_report(""), Err(ParseError::MissingWallClock));
    }

    #[test]
    fn malformed_values() {
        for bad in ["1:02:03", "1.5", ":12.0", "1:", "a:12", "1:1e3", "-1:00"] {
            assert!(
                matches!(parse_wall_clock(bad), Err(ParseError::MalformedWallClock(_))),
                "{bad}"
            );
        }
        for bad in ["", "12kb", "-5", "1.5"] {
            assert!(
                matches!(parse_max_rss(bad), Err(ParseError::MalformedMaxRss(_))),
                "{bad}"
            );
        }
        let report = REPORT.replace("2500000", "lots");
        assert_eq!(
            parse_time_report(&report),
            Err(ParseError::MalformedMaxRss("lots".to_owned()))
        );
    }
}
