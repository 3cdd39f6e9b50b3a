//! Data model shared by every stage of the pipeline: current frames produced
//! by the box side and log events produced by the phone side.

use std::sync::Arc;

/// Classification of a parsed log line.
///
/// Everything that carries a `[volta]` envelope maps to one of the first four
/// kinds; lines without an envelope (and envelopes with an unrecognised kind
/// field) are `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Event,
    Sync,
    Metric,
    Fragment,
    Unknown,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Event,
        EventKind::Sync,
        EventKind::Metric,
        EventKind::Fragment,
        EventKind::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Event => "event",
            EventKind::Sync => "sync",
            EventKind::Metric => "metric",
            EventKind::Fragment => "fragment",
            EventKind::Unknown => "unknown",
        }
    }

    /// Maps an envelope kind field to a variant. Unrecognised kinds are
    /// `Unknown` rather than an error: the line still flows to the unknown
    /// sink instead of being dropped silently.
    pub fn from_envelope(s: &str) -> EventKind {
        match s {
            "event" => EventKind::Event,
            "sync" => EventKind::Sync,
            "metric" => EventKind::Metric,
            "fragment" => EventKind::Fragment,
            _ => EventKind::Unknown,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One fixed-duration slice of the current trace.
///
/// `ts` holds the frequency-derived microsecond timestamp of each sample
/// (run-relative, starting at 0); `values` holds amperes after the affine
/// calibration. Both columns always have the same length.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentsFrame {
    pub ts: Vec<i64>,
    pub values: Vec<f64>,
}

impl CurrentsFrame {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A parsed log event.
///
/// The parser emits raw clock values (`sys_uts` as epoch microseconds,
/// `log_uts` as device monotonic microseconds); the router rewrites both
/// relative to the first observation before any sink sees the event.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub sys_uts: i64,
    pub log_uts: Option<i64>,
    pub kind: EventKind,
    pub app: Option<String>,
    pub tag: Option<String>,
    pub message: String,
    pub value: Option<f64>,
}

/// One item on a sink queue. Cheap to clone: the payload is shared.
#[derive(Debug, Clone)]
pub enum Record {
    Currents(Arc<CurrentsFrame>),
    Events(EventKind, Arc<Vec<LogEvent>>),
}

/// Replaces separator characters in a log message with printable sentinels
/// so the message survives the tab-separated outputs intact.
pub fn sanitize_message(message: &str) -> String {
    message
        .replace('\t', "__tab__")
        .replace('\n', "__nl__")
        .replace(['\r', '\x0c', '\x0b'], "")
}
