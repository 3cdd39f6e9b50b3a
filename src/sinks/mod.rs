//! Data sinks: every consumer of the fan-out (files, uploader, console)
//! lives here. The column projections are shared between the file sink and
//! the uploader so both emit the same row shape.

pub mod console;
pub mod file;
pub mod uploader;

pub use console::ConsoleSink;
pub use file::FileSink;
pub use uploader::{DataUploader, UploadWorker, UploaderConfig};

use crate::event::{EventKind, LogEvent};

/// Columns persisted for the currents stream.
pub const CURRENTS_COLUMNS: &[&str] = &["ts", "value"];

/// Columns persisted per event kind.
pub fn event_columns(kind: EventKind) -> &'static [&'static str] {
    match kind {
        EventKind::Sync | EventKind::Event | EventKind::Fragment => {
            &["sys_uts", "log_uts", "app", "tag", "message"]
        }
        EventKind::Metric => &["sys_uts", "log_uts", "app", "tag", "value"],
        EventKind::Unknown => &["sys_uts", "message"],
    }
}

/// Storage dtype of a column, pandas-style names.
pub fn column_dtype(column: &str) -> &'static str {
    match column {
        "ts" | "sys_uts" | "log_uts" => "int64",
        "value" => "float64",
        _ => "object",
    }
}

/// One field of an event row; `None` encodes as the empty string.
pub fn event_field(event: &LogEvent, column: &str) -> String {
    match column {
        "sys_uts" => event.sys_uts.to_string(),
        "log_uts" => event.log_uts.map(|v| v.to_string()).unwrap_or_default(),
        "app" => event.app.clone().unwrap_or_default(),
        "tag" => event.tag.clone().unwrap_or_default(),
        "message" => event.message.clone(),
        "value" => event.value.map(|v| v.to_string()).unwrap_or_default(),
        _ => String::new(),
    }
}

/// Tab-joined row for an event, per its kind's projection.
pub fn event_row(kind: EventKind, event: &LogEvent) -> String {
    event_columns(kind)
        .iter()
        .map(|col| event_field(event, col))
        .collect::<Vec<_>>()
        .join("\t")
}
