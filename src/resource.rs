//! Resource opener: turns a locator string into a byte stream.
//!
//! Three schemes are recognised: HTTP(S) URLs (downloaded once into a cache
//! file, then read from disk), TTY device paths (opened at the configured
//! baud rate with a read timeout), and plain filesystem paths. All variants
//! surface a read timeout as a zero-length read so the box readers can poll
//! their close flag instead of blocking forever.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, VoltaError};

/// How long a zero-length read sleeps before the caller is expected to retry.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

impl Default for SourceOptions {
    fn default() -> Self {
        SourceOptions {
            baud_rate: 115_200,
            read_timeout: Duration::from_secs(1),
        }
    }
}

/// Maps `TimedOut` from the serial driver to `Ok(0)`. The read loop treats a
/// zero-length read as "nothing arrived yet", which is exactly what a serial
/// timeout means.
struct TimeoutAsEmpty<T>(T);

impl<T: Read> Read for TimeoutAsEmpty<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            other => other,
        }
    }
}

/// An opened data source with a small lookahead buffer so line-oriented
/// phases (handshake, plaintext startup flush) and block reads can share one
/// stream without losing bytes at the boundary.
pub struct DataSource {
    inner: Box<dyn Read + Send>,
    lookahead: Vec<u8>,
    local_path: Option<PathBuf>,
    zero_is_timeout: bool,
}

impl DataSource {
    pub fn from_reader(inner: Box<dyn Read + Send>, zero_is_timeout: bool) -> Self {
        DataSource {
            inner,
            lookahead: Vec::new(),
            local_path: None,
            zero_is_timeout,
        }
    }

    fn from_file(file: File, path: PathBuf) -> Self {
        DataSource {
            inner: Box::new(file),
            lookahead: Vec::new(),
            local_path: Some(path),
            zero_is_timeout: false,
        }
    }

    /// Filesystem path backing this source, when there is one. Used by the
    /// installers to hand cached files to external tools.
    pub fn local_path(&self) -> Option<&Path> {
        self.local_path.as_deref()
    }

    /// Reads one line, stripped of the trailing newline.
    ///
    /// Returns `Ok(None)` at end of input. A read timeout returns whatever
    /// accumulated so far (possibly an empty string), mirroring what a serial
    /// `readline` with a timeout does.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut acc: Vec<u8> = Vec::new();
        loop {
            if let Some(pos) = self.lookahead.iter().position(|&b| b == b'\n') {
                acc.extend(self.lookahead.drain(..=pos));
                break;
            }
            acc.append(&mut self.lookahead);

            let mut scratch = [0u8; 4096];
            let n = self.inner.read(&mut scratch)?;
            if n == 0 {
                if self.zero_is_timeout {
                    // Timeout: hand back the partial line.
                    break;
                }
                if acc.is_empty() {
                    return Ok(None);
                }
                break;
            }
            self.lookahead.extend_from_slice(&scratch[..n]);
        }
        while acc.last() == Some(&b'\n') || acc.last() == Some(&b'\r') {
            acc.pop();
        }
        Ok(Some(String::from_utf8_lossy(&acc).into_owned()))
    }

    /// Reads up to `max` bytes with a single read call. An empty vec means a
    /// timeout (serial) or end of input (file); callers sleep and retry.
    pub fn read_chunk(&mut self, max: usize) -> io::Result<Vec<u8>> {
        if !self.lookahead.is_empty() {
            let take = max.min(self.lookahead.len());
            return Ok(self.lookahead.drain(..take).collect());
        }
        let mut buf = vec![0u8; max];
        let n = self.inner.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Convenience for the retry loops: sleep one poll interval.
    pub fn backoff() {
        thread::sleep(POLL_INTERVAL);
    }
}

/// Opens a locator as a byte stream.
pub fn open_source(locator: &str, opts: &SourceOptions) -> Result<DataSource> {
    if locator.starts_with("http://") || locator.starts_with("https://") {
        let path = fetch_cached(locator)?;
        let file = File::open(&path)?;
        Ok(DataSource::from_file(file, path))
    } else if locator.starts_with("/dev/") || locator.starts_with("serial://") {
        let path = locator.strip_prefix("serial://").unwrap_or(locator);
        info!(port = path, baud = opts.baud_rate, "opening serial port");
        let port = serialport::new(path, opts.baud_rate)
            .timeout(opts.read_timeout)
            .open()?;
        Ok(DataSource {
            inner: Box::new(TimeoutAsEmpty(port)),
            lookahead: Vec::new(),
            local_path: None,
            zero_is_timeout: true,
        })
    } else {
        let file = File::open(locator)
            .map_err(|e| VoltaError::Resource(format!("cannot open {locator}: {e}")))?;
        Ok(DataSource::from_file(file, PathBuf::from(locator)))
    }
}

/// Resolves a locator to a local filesystem path, downloading URLs into the
/// cache on first use. Installers use this to feed files to external tools.
pub fn local_copy(locator: &str) -> Result<PathBuf> {
    if locator.starts_with("http://") || locator.starts_with("https://") {
        fetch_cached(locator)
    } else if locator.starts_with("/dev/") || locator.starts_with("serial://") {
        Err(VoltaError::Resource(format!(
            "{locator} is a device, not a file"
        )))
    } else {
        Ok(PathBuf::from(locator))
    }
}

fn cache_path_for(url: &str) -> PathBuf {
    let name: String = url
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    std::env::temp_dir().join("volta_cache").join(name)
}

fn fetch_cached(url: &str) -> Result<PathBuf> {
    let path = cache_path_for(url);
    if path.exists() {
        debug!(url, path = %path.display(), "resource already cached");
        return Ok(path);
    }
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    info!(url, "downloading resource");
    let resp = ureq::get(url)
        .call()
        .map_err(|e| VoltaError::Resource(format!("failed to fetch {url}: {e}")))?;
    let mut reader = resp.into_reader();
    let mut file = File::create(&path)?;
    io::copy(&mut reader, &mut file)?;
    file.flush()?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn source_from(bytes: &[u8]) -> DataSource {
        DataSource::from_reader(Box::new(Cursor::new(bytes.to_vec())), false)
    }

    #[test]
    fn read_line_splits_on_newline() {
        let mut src = source_from(b"first\nsecond\r\nthird");
        assert_eq!(src.read_line().unwrap().as_deref(), Some("first"));
        assert_eq!(src.read_line().unwrap().as_deref(), Some("second"));
        assert_eq!(src.read_line().unwrap().as_deref(), Some("third"));
        assert_eq!(src.read_line().unwrap(), None);
    }

    #[test]
    fn read_chunk_serves_lookahead_first() {
        let mut src = source_from(b"head\ntail-bytes");
        assert_eq!(src.read_line().unwrap().as_deref(), Some("head"));
        // the lookahead may hold part of the stream; nothing gets lost
        let mut rest = Vec::new();
        loop {
            let chunk = src.read_chunk(4).unwrap();
            if chunk.is_empty() {
                break;
            }
            rest.extend(chunk);
        }
        assert_eq!(rest, b"tail-bytes");
    }

    #[test]
    fn local_copy_rejects_devices() {
        assert!(local_copy("/dev/ttyUSB0").is_err());
        assert_eq!(
            local_copy("/tmp/somefile.apk").unwrap(),
            PathBuf::from("/tmp/somefile.apk")
        );
    }
}
