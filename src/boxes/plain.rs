//! Plaintext box framing: one decimal sample per line, split at the last
//! newline of each read so partial lines carry over to the next block.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::resource::DataSource;

const CACHE_SIZE: usize = 10 * 1024 * 1024;

pub struct PlainTextReader {
    source: DataSource,
    closed: Arc<AtomicBool>,
    cache_size: usize,
    tail: String,
    drained: bool,
}

impl PlainTextReader {
    pub fn new(source: DataSource, closed: Arc<AtomicBool>) -> Self {
        PlainTextReader {
            source,
            closed,
            cache_size: CACHE_SIZE,
            tail: String::new(),
            drained: false,
        }
    }

    fn parse_lines(text: &str) -> Vec<f64> {
        text.split('\n')
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| match line.parse::<f64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    debug!(line, "dropping unparseable sample line");
                    None
                }
            })
            .collect()
    }

    /// Splits the tail at its last newline and parses the complete part.
    fn take_complete_lines(&mut self) -> Vec<f64> {
        match self.tail.rfind('\n') {
            Some(pos) => {
                let rest = self.tail.split_off(pos + 1);
                let complete = std::mem::replace(&mut self.tail, rest);
                Self::parse_lines(&complete)
            }
            None => Vec::new(),
        }
    }
}

impl Iterator for PlainTextReader {
    type Item = Vec<f64>;

    fn next(&mut self) -> Option<Vec<f64>> {
        loop {
            let closing = self.closed.load(Ordering::SeqCst);
            if closing && self.drained {
                return None;
            }
            let chunk = match self.source.read_chunk(self.cache_size) {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!(error = %e, "plaintext box read failed, stopping grabber");
                    return None;
                }
            };
            if closing {
                // one final read after close, then stop
                self.drained = true;
            }
            if chunk.is_empty() {
                if closing {
                    return None;
                }
                DataSource::backoff();
                continue;
            }
            debug!(bytes = chunk.len(), "grabber got data");
            self.tail.push_str(&String::from_utf8_lossy(&chunk));
            let samples = self.take_complete_lines();
            if samples.is_empty() && !closing {
                continue;
            }
            return Some(samples);
        }
    }
}
