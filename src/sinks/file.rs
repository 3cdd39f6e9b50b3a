//! File sink: one tab-separated `.data` file per stream with a single-line
//! JSON header describing the columns and their dtypes.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::event::Record;
use crate::sinks::{column_dtype, event_columns, event_row, CURRENTS_COLUMNS};

/// Header line written before the first row of each file.
#[derive(Debug, Deserialize, PartialEq)]
pub struct FileHeader {
    #[serde(rename = "type")]
    pub stream: String,
    pub names: Vec<String>,
    pub dtypes: HashMap<String, String>,
}

struct StreamFile {
    file: File,
    header_written: bool,
}

struct Writer {
    dir: PathBuf,
    files: HashMap<&'static str, StreamFile>,
}

impl Writer {
    fn stream_file(&mut self, name: &'static str) -> std::io::Result<&mut StreamFile> {
        if !self.files.contains_key(name) {
            let path = self.dir.join(format!("{name}.data"));
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(0o644)
                .open(&path)?;
            self.files.insert(name, StreamFile { file, header_written: false });
        }
        Ok(self.files.get_mut(name).expect("just inserted"))
    }

    fn write_record(&mut self, record: &Record) -> std::io::Result<()> {
        match record {
            Record::Currents(frame) => {
                let stream = self.stream_file("currents")?;
                write_header(stream, "currents", CURRENTS_COLUMNS)?;
                let mut body = String::new();
                for (ts, value) in frame.ts.iter().zip(&frame.values) {
                    body.push_str(&format!("{ts}\t{value}\n"));
                }
                stream.file.write_all(body.as_bytes())?;
                stream.file.flush()
            }
            Record::Events(kind, batch) => {
                let stream = self.stream_file(kind.as_str())?;
                write_header(stream, kind.as_str(), event_columns(*kind))?;
                let mut body = String::new();
                for event in batch.iter() {
                    body.push_str(&event_row(*kind, event));
                    body.push('\n');
                }
                stream.file.write_all(body.as_bytes())?;
                stream.file.flush()
            }
        }
    }
}

fn write_header(stream: &mut StreamFile, name: &str, columns: &[&str]) -> std::io::Result<()> {
    if stream.header_written {
        return Ok(());
    }
    let dtypes: HashMap<&str, &str> = columns.iter().map(|&c| (c, column_dtype(c))).collect();
    let header = serde_json::json!({
        "type": name,
        "names": columns,
        "dtypes": dtypes,
    });
    stream.file.write_all(header.to_string().as_bytes())?;
    stream.file.write_all(b"\n")?;
    stream.header_written = true;
    Ok(())
}

/// Sink thread writing every record it receives to the per-stream files.
pub struct FileSink {
    interrupt: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FileSink {
    pub fn spawn(source: Receiver<Record>, dir: PathBuf) -> FileSink {
        let interrupt = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&interrupt);
        let handle = thread::Builder::new()
            .name("file-sink".into())
            .spawn(move || {
                let mut writer = Writer { dir, files: HashMap::new() };
                loop {
                    if flag.load(Ordering::SeqCst) {
                        for record in source.try_iter() {
                            if let Err(e) = writer.write_record(&record) {
                                warn!(error = %e, "file sink write failed");
                            }
                        }
                        break;
                    }
                    match source.recv_timeout(Duration::from_millis(500)) {
                        Ok(record) => {
                            if let Err(e) = writer.write_record(&record) {
                                warn!(error = %e, "file sink write failed");
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("file sink finished");
            })
            .expect("failed to spawn file sink thread");
        FileSink {
            interrupt,
            handle: Some(handle),
        }
    }

    /// Drains the queue and stops. Safe to call more than once.
    pub fn close(&mut self) {
        self.interrupt.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Reads a `.data` file back: the JSON header plus the raw rows, split on
/// tabs. Counterpart of the sink's format, used for verification and replay.
pub fn read_data_file(path: &Path) -> std::io::Result<(FileHeader, Vec<Vec<String>>)> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = reader.lines();
    let header_line = lines
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "empty data file"))??;
    let header: FileHeader = serde_json::from_str(&header_line)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut rows = Vec::new();
    for line in lines {
        let line = line?;
        rows.push(line.split('\t').map(str::to_string).collect());
    }
    Ok((header, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CurrentsFrame, EventKind, LogEvent};
    use crossbeam_channel::unbounded;
    use std::sync::Arc;

    #[test]
    fn currents_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = unbounded();
        let mut sink = FileSink::spawn(rx, dir.path().to_path_buf());

        let frame = CurrentsFrame {
            ts: vec![0, 2000, 4000],
            values: vec![1.5, 2.0, 2.5],
        };
        tx.send(Record::Currents(Arc::new(frame.clone()))).unwrap();
        drop(tx);
        sink.close();

        let (header, rows) = read_data_file(&dir.path().join("currents.data")).unwrap();
        assert_eq!(header.stream, "currents");
        assert_eq!(header.names, vec!["ts", "value"]);
        assert_eq!(header.dtypes["ts"], "int64");
        assert_eq!(header.dtypes["value"], "float64");

        // reconstruct the frame through the header's names and dtypes
        let ts_idx = header.names.iter().position(|n| n == "ts").unwrap();
        let val_idx = header.names.iter().position(|n| n == "value").unwrap();
        let rebuilt = CurrentsFrame {
            ts: rows.iter().map(|r| r[ts_idx].parse().unwrap()).collect(),
            values: rows.iter().map(|r| r[val_idx].parse().unwrap()).collect(),
        };
        assert_eq!(rebuilt, frame);
    }

    #[test]
    fn event_files_are_split_per_kind() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = unbounded();
        let mut sink = FileSink::spawn(rx, dir.path().to_path_buf());

        let sync = LogEvent {
            sys_uts: 0,
            log_uts: Some(0),
            kind: EventKind::Sync,
            app: Some("testapp".into()),
            tag: Some("syncA".into()),
            message: "rise".into(),
            value: None,
        };
        let unknown = LogEvent {
            sys_uts: 10,
            log_uts: None,
            kind: EventKind::Unknown,
            app: None,
            tag: None,
            message: "noise".into(),
            value: None,
        };
        tx.send(Record::Events(EventKind::Sync, Arc::new(vec![sync]))).unwrap();
        tx.send(Record::Events(EventKind::Unknown, Arc::new(vec![unknown])))
            .unwrap();
        drop(tx);
        sink.close();

        let (sync_header, sync_rows) = read_data_file(&dir.path().join("sync.data")).unwrap();
        assert_eq!(sync_header.stream, "sync");
        assert_eq!(sync_rows, vec![vec!["0", "0", "testapp", "syncA", "rise"]]);

        let (unk_header, unk_rows) = read_data_file(&dir.path().join("unknown.data")).unwrap();
        assert_eq!(unk_header.names, vec!["sys_uts", "message"]);
        assert_eq!(unk_rows, vec![vec!["10", "noise"]]);
    }

    #[test]
    fn files_end_with_a_newline() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = unbounded();
        let mut sink = FileSink::spawn(rx, dir.path().to_path_buf());
        tx.send(Record::Currents(Arc::new(CurrentsFrame {
            ts: vec![0],
            values: vec![1.0],
        })))
        .unwrap();
        drop(tx);
        sink.close();
        let bytes = std::fs::read(dir.path().join("currents.data")).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = unbounded::<Record>();
        let mut sink = FileSink::spawn(rx, dir.path().to_path_buf());
        drop(tx);
        sink.close();
        sink.close();
    }
}
