//! Run progress reporting.
//!
//! Reports observable progress while a skillset runs so users see how many
//! documents were processed, skipped, or failed. Progress is emitted on
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for a skillset run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunProgressEvent {
    /// Pipeline assembled; the source is starting.
    Discovering { skillset: String, stages: usize },
    /// Running totals, emitted as documents settle.
    Processing {
        skillset: String,
        processed: u64,
        skipped: u64,
        failed: u64,
    },
    /// The run ended.
    Finished {
        skillset: String,
        processed: u64,
        skipped: u64,
        failed: u64,
        cancelled: bool,
    },
}

/// Reports run progress. Implementations write to stderr (human or JSON).
pub trait RunProgressReporter: Send + Sync {
    fn report(&self, event: RunProgressEvent);
}

/// Human-friendly progress on stderr: "run docs  1,234 processed  12 skipped  0 failed".
pub struct StderrProgress;

impl RunProgressReporter for StderrProgress {
    fn report(&self, event: RunProgressEvent) {
        let line = match &event {
            RunProgressEvent::Discovering { skillset, stages } => {
                format!("run {}  starting ({} stages)\n", skillset, stages)
            }
            RunProgressEvent::Processing {
                skillset,
                processed,
                skipped,
                failed,
            } => format!(
                "run {}  {} processed  {} skipped  {} failed\n",
                skillset,
                format_number(*processed),
                format_number(*skipped),
                format_number(*failed)
            ),
            RunProgressEvent::Finished {
                skillset,
                processed,
                skipped,
                failed,
                cancelled,
            } => format!(
                "run {}  {}  {} processed  {} skipped  {} failed\n",
                skillset,
                if *cancelled { "cancelled" } else { "done" },
                format_number(*processed),
                format_number(*skipped),
                format_number(*failed)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl JsonProgress {
    fn to_json(event: &RunProgressEvent) -> serde_json::Value {
        match event {
            RunProgressEvent::Discovering { skillset, stages } => serde_json::json!({
                "event": "progress",
                "skillset": skillset,
                "phase": "discovering",
                "stages": stages
            }),
            RunProgressEvent::Processing {
                skillset,
                processed,
                skipped,
                failed,
            } => serde_json::json!({
                "event": "progress",
                "skillset": skillset,
                "phase": "running",
                "processed": processed,
                "skipped": skipped,
                "failed": failed
            }),
            RunProgressEvent::Finished {
                skillset,
                processed,
                skipped,
                failed,
                cancelled,
            } => serde_json::json!({
                "event": "progress",
                "skillset": skillset,
                "phase": if *cancelled { "cancelled" } else { "finished" },
                "processed": processed,
                "skipped": skipped,
                "failed": failed
            }),
        }
    }
}

impl RunProgressReporter for JsonProgress {
    fn report(&self, event: RunProgressEvent) {
        if let Ok(line) = serde_json::to_string(&Self::to_json(&event)) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl RunProgressReporter for NoProgress {
    fn report(&self, _event: RunProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
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

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" | "none" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn reporter(&self) -> std::sync::Arc<dyn RunProgressReporter> {
        match self {
            ProgressMode::Off => std::sync::Arc::new(NoProgress),
            ProgressMode::Human => std::sync::Arc::new(StderrProgress),
            ProgressMode::Json => std::sync::Arc::new(JsonProgress),
        }
    }
}
