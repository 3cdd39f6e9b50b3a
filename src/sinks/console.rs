//! Console sink: descriptive statistics of each incoming currents frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info};

use crate::event::Record;

/// Prints a `describe()`-style summary for every currents frame it
/// receives; events are ignored.
pub struct ConsoleSink {
    interrupt: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ConsoleSink {
    pub fn spawn(source: Receiver<Record>) -> ConsoleSink {
        let interrupt = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&interrupt);
        let handle = thread::Builder::new()
            .name("console-sink".into())
            .spawn(move || {
                loop {
                    if flag.load(Ordering::SeqCst) {
                        break;
                    }
                    match source.recv_timeout(Duration::from_millis(500)) {
                        Ok(Record::Currents(frame)) => {
                            info!("\n{}\n", describe(&frame.values));
                        }
                        Ok(Record::Events(..)) => {}
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("console sink finished");
            })
            .expect("failed to spawn console sink thread");
        ConsoleSink {
            interrupt,
            handle: Some(handle),
        }
    }

    pub fn close(&mut self) {
        self.interrupt.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// count / mean / std / min / quartiles / max of a sample array.
pub fn describe(values: &[f64]) -> String {
    if values.is_empty() {
        return "count           0".to_string();
    }
    let count = values.len();
    let mean = values.iter().sum::<f64>() / count as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
        / (count.max(2) - 1) as f64;
    let std = var.sqrt();
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("no NaN samples"));
    let q = |p: f64| -> f64 {
        // linear interpolation between closest ranks
        let rank = p * (count - 1) as f64;
        let lo = rank.floor() as usize;
        let hi = rank.ceil() as usize;
        sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
    };
    format!(
        "count  {count:>12}\n\
         mean   {mean:>12.6}\n\
         std    {std:>12.6}\n\
         min    {:>12.6}\n\
         25%    {:>12.6}\n\
         50%    {:>12.6}\n\
         75%    {:>12.6}\n\
         max    {:>12.6}",
        sorted[0],
        q(0.25),
        q(0.5),
        q(0.75),
        sorted[count - 1],
    )
}
