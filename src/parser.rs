//! Log line parser: applies the platform line regex, aggregates multi-line
//! entries, extracts the `[volta]` envelope and produces raw `LogEvent`s
//! (clock normalisation happens later, in the router).

use std::sync::OnceLock;
use std::time::Duration;

use chrono::{Datelike, Days, NaiveDateTime};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use regex::Regex;
use tracing::{debug, warn};

use crate::event::{sanitize_message, EventKind, LogEvent};

/// Which timestamp layout the platform log uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Android logcat: `01-02 03:04:05.006`, no year.
    Android,
    /// iOS syslog: `Aug 25 18:48:14`, no year.
    Ios,
}

/// Default line format for `adb logcat` threadtime output:
/// `date time pid tid priority tag: message`.
pub const ANDROID_THREADTIME_RE: &str =
    r"(?i)^(?P<date>\S+)\s+(?P<time>\S+)\s+\S+\s+\S+\s+\S+\s+\S+\s+(?P<message>.*)$";

/// Classic `adb logcat -v time` output: `date time priority/tag(pid): message`.
/// No pid/tid columns; this pattern is never shared with the threadtime one.
pub const ANDROID_TIME_RE: &str =
    r"(?i)^(?P<date>\S+)\s+(?P<time>\S+)\s+\S+\s+\S+\s+\S+\s+(?P<message>.*)$";

/// Nexus4 logcat variant with one column fewer.
pub const NEXUS4_RE: &str =
    r"(?i)^(?P<date>\S+)\s+(?P<time>\S+)\s+\S+\s+\S+\s+(?P<message>.*)$";

/// iOS syslog via cfgutil: `month date time host process: message`.
pub const IOS_SYSLOG_RE: &str =
    r"(?i)^(?P<month>\S+)\s+(?P<date>\S+)\s+(?P<time>\S+)\s+\S+\s+\S+\s+(?P<message>.*)$";

// data sample: [volta] 12345678 fragment TagFragment start
fn envelope_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\[volta\]\s+(?P<nanotime>\S+)\s+(?P<kind>\S+)\s+(?P<tag>\S+)\s+(?P<message>.*)$",
        )
        .expect("envelope regex is valid")
    })
}

/// One physical log entry being accumulated: the header's timestamp fields
/// plus the message, which grows while continuation lines arrive.
struct PendingEntry {
    month: Option<String>,
    date: Option<String>,
    time: Option<String>,
    message: String,
}

/// Parses a platform timestamp into epoch microseconds.
///
/// Neither platform logs the year, so the current year is imputed; if that
/// puts the timestamp in the future beyond a one-day tolerance (a run
/// crossing new year), the year is decremented.
pub fn parse_platform_timestamp(
    platform: Platform,
    entry_month: Option<&str>,
    entry_date: Option<&str>,
    entry_time: Option<&str>,
    now: NaiveDateTime,
) -> Option<i64> {
    let with_year = |year: i32| -> Option<NaiveDateTime> {
        match platform {
            Platform::Android => NaiveDateTime::parse_from_str(
                &format!("{year}-{} {}", entry_date?, entry_time?),
                "%Y-%m-%d %H:%M:%S%.f",
            )
            .ok(),
            Platform::Ios => NaiveDateTime::parse_from_str(
                &format!("{year} {} {} {}", entry_month?, entry_date?, entry_time?),
                "%Y %b %d %H:%M:%S",
            )
            .ok(),
        }
    };
    let mut ts = with_year(now.year())?;
    if ts > now.checked_add_days(Days::new(1))? {
        ts = with_year(now.year() - 1)?;
    }
    Some(ts.and_utc().timestamp_micros())
}

/// Iterator over parsed log events, pulling raw lines from the subprocess
/// channel. Ends when the channel disconnects (child exited and its pipes
/// were flushed), emitting the pending entry first.
pub struct LogParser {
    source: Receiver<String>,
    line_re: Regex,
    platform: Platform,
    pending: Option<PendingEntry>,
}

impl LogParser {
    pub fn new(source: Receiver<String>, line_re: Regex, platform: Platform) -> Self {
        LogParser {
            source,
            line_re,
            platform,
            pending: None,
        }
    }

    /// Consumes one physical line; returns the previous logical entry when
    /// this line starts a new one.
    fn feed(&mut self, line: &str) -> Option<LogEvent> {
        if let Some(caps) = self.line_re.captures(line) {
            let entry = PendingEntry {
                month: caps.name("month").map(|m| m.as_str().to_string()),
                date: caps.name("date").map(|m| m.as_str().to_string()),
                time: caps.name("time").map(|m| m.as_str().to_string()),
                message: caps
                    .name("message")
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default(),
            };
            let previous = self.pending.replace(entry);
            previous.and_then(|p| self.finalize(p))
        } else if let Some(pending) = self.pending.as_mut() {
            // multi-line log entry: append to the message in progress
            pending.message.push('\n');
            pending.message.push_str(line);
            None
        } else {
            debug!(line, "trash data in logs, dropped");
            None
        }
    }

    fn finalize(&self, entry: PendingEntry) -> Option<LogEvent> {
        let now = chrono::Local::now().naive_local();
        let sys_uts = match parse_platform_timestamp(
            self.platform,
            entry.month.as_deref(),
            entry.date.as_deref(),
            entry.time.as_deref(),
            now,
        ) {
            Some(ts) => ts,
            None => {
                debug!(message = %entry.message, "malformed log timestamp, dropped");
                return None;
            }
        };

        if let Some(env) = envelope_re().captures(&entry.message) {
            match env["nanotime"].parse::<i64>() {
                Ok(nanotime) => {
                    return Some(LogEvent {
                        sys_uts,
                        log_uts: Some(nanotime / 1000),
                        kind: EventKind::from_envelope(&env["kind"]),
                        app: Some("testapp".to_string()),
                        tag: Some(env["tag"].to_string()),
                        message: sanitize_message(&env["message"]),
                        value: None,
                    });
                }
                Err(_) => {
                    warn!(message = %entry.message, "trash log timestamp in envelope");
                }
            }
        }
        Some(LogEvent {
            sys_uts,
            log_uts: None,
            kind: EventKind::Unknown,
            app: None,
            tag: None,
            message: sanitize_message(&entry.message),
            value: None,
        })
    }
}

impl Iterator for LogParser {
    type Item = LogEvent;

    fn next(&mut self) -> Option<LogEvent> {
        loop {
            match self.source.recv_timeout(Duration::from_millis(500)) {
                Ok(line) => {
                    if let Some(event) = self.feed(&line) {
                        return Some(event);
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    // flush the trailing entry
                    return self.pending.take().and_then(|p| self.finalize(p));
                }
            }
        }
    }
}
