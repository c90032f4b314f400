//! Parsing of GNU `time -v` reports.

use crate::error::{CollectError, Result};
use crate::process::CommandSpec;

pub const WALL_TIME_FIELD_NAME: &str = "wall-time-seconds";

const TIME_BINARY: &str = "/usr/bin/time";
const ELAPSED_PREFIX: &str = "Elapsed (wall clock) time";
const MAX_RSS_PREFIX: &str = "Maximum resident set size (kbytes)";

/// `/usr/bin/time -v <cmd>`
pub fn timed_command(cmd: &CommandSpec) -> CommandSpec {
    cmd.prefixed(&[TIME_BINARY.to_string(), "-v".to_string()])
}

/// The fields of a `time -v` report this tool records.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeReport {
    pub wall_seconds: f64,
    pub max_rss_bytes: u64,
}

/// Finds both fields anywhere in `stderr`. The workload's own stderr may
/// precede the report.
pub fn parse_time_report(stderr: &str) -> Result<TimeReport> {
    let mut wall = None;
    let mut rss = None;
    for line in stderr.lines() {
        let line = line.trim();
        if line.starts_with(ELAPSED_PREFIX) {
            wall = Some(parse_elapsed(value_after_colon(line, ELAPSED_PREFIX)?)?);
        } else if line.starts_with(MAX_RSS_PREFIX) {
            let raw = value_after_colon(line, MAX_RSS_PREFIX)?;
            let kb: u64 = raw
                .parse()
                .map_err(|_| CollectError::parse("time -v", format!("max rss '{}'", raw)))?;
            rss = Some(kb * 1024);
        }
    }
    match (wall, rss) {
        (Some(wall_seconds), Some(max_rss_bytes)) => Ok(TimeReport {
            wall_seconds,
            max_rss_bytes,
        }),
        (None, _) => Err(CollectError::parse("time -v", "no elapsed wall clock time line")),
        (_, None) => Err(CollectError::parse("time -v", "no maximum resident set size line")),
    }
}

// The label itself contains "h:mm:ss or m:ss", so split on the last ": ".
fn value_after_colon<'a>(line: &'a str, field: &str) -> Result<&'a str> {
    line.rsplit_once(": ")
        .map(|(_, v)| v.trim())
        .ok_or_else(|| CollectError::parse("time -v", format!("malformed {} line", field)))
}

/// `m:ss.ff` or `h:mm:ss[.ff]` into seconds.
pub fn parse_elapsed(raw: &str) -> Result<f64> {
    let bad = || CollectError::parse("time -v", format!("elapsed time '{}'", raw));
    let parts: Vec<&str> = raw.split(':').collect();
    let numbers = parts
        .iter()
        .map(|p| p.parse::<f64>().map_err(|_| bad()))
        .collect::<Result<Vec<f64>>>()?;
    match numbers.as_slice() {
        [minutes, seconds] => Ok(minutes * 60.0 + seconds),
        [hours, minutes, seconds] => Ok(hours * 3600.0 + minutes * 60.0 + seconds),
        _ => Err(bad()),
    }
}
