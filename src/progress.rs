//! Archive search progress reporting.
//!
//! Reports observable progress while date chunks are being searched so users
//! see how many periods are done and how many tiles were found so far.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for an archive search.
#[derive(Clone, Debug)]
pub enum SearchProgressEvent {
    /// The window was split into `chunks` periods and searching began.
    Started { chunks: u64 },
    /// One period finished: n of total chunks done, `items` found in it.
    ChunkDone {
        period: String,
        n: u64,
        total: u64,
        items: u64,
        failed: bool,
    },
}

/// Reports search progress. Implementations write to stderr (human or JSON).
pub trait SearchProgressReporter: Send + Sync {
    fn report(&self, event: SearchProgressEvent);
}

/// Human-friendly progress on stderr: "search  12 / 40 periods  1,234 tiles".
pub struct StderrProgress;

impl SearchProgressReporter for StderrProgress {
    fn report(&self, event: SearchProgressEvent) {
        let line = match &event {
            SearchProgressEvent::Started { chunks } => {
                format!("search  {} periods queued\n", format_number(*chunks))
            }
            SearchProgressEvent::ChunkDone {
                period,
                n,
                total,
                items,
                failed,
            } => {
                let status = if *failed {
                    "failed".to_string()
                } else {
                    format!("{} tiles", format_number(*items))
                };
                format!(
                    "search  {} / {} periods  {}  {}\n",
                    format_number(*n),
                    format_number(*total),
                    period,
                    status
                )
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SearchProgressReporter for JsonProgress {
    fn report(&self, event: SearchProgressEvent) {
        let obj = match &event {
            SearchProgressEvent::Started { chunks } => serde_json::json!({
                "event": "progress",
                "phase": "started",
                "total": chunks
            }),
            SearchProgressEvent::ChunkDone {
                period,
                n,
                total,
                items,
                failed,
            } => serde_json::json!({
                "event": "progress",
                "phase": "chunk",
                "period": period,
                "n": n,
                "total": total,
                "items": items,
                "failed": failed
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SearchProgressReporter for NoProgress {
    fn report(&self, _event: SearchProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn SearchProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
