//! Groups variable-length sample arrays into fixed-size frames and stamps
//! each sample with a frequency-derived microsecond timestamp.

use tracing::debug;

use crate::event::CurrentsFrame;

/// Stateful slicer over a stream of sample arrays.
///
/// Timestamps are derived from the running sample count and the configured
/// rate, not from the wall clock: sample `n` is stamped
/// `⌊n · 10^6 / sample_rate⌋` µs, so a run always starts at `ts = 0` and
/// adjacent frames are contiguous. Whatever is left in the buffer when the
/// source ends (less than one slice) is discarded.
pub struct TimeChopper<I> {
    source: I,
    sample_rate: u32,
    slice_size: usize,
    buffer: Vec<f64>,
    sample_num: u64,
}

impl<I> TimeChopper<I> {
    pub fn new(source: I, sample_rate: u32, chop_ratio: f64) -> Self {
        let slice_size = (f64::from(sample_rate) * chop_ratio).ceil() as usize;
        debug!(chop_ratio, slice_size, "chopper slicing data");
        TimeChopper {
            source,
            sample_rate,
            slice_size: slice_size.max(1),
            buffer: Vec::new(),
            sample_num: 0,
        }
    }

    fn emit(&mut self) -> CurrentsFrame {
        let values: Vec<f64> = self.buffer.drain(..self.slice_size).collect();
        let step = 1_000_000 / i64::from(self.sample_rate);
        let start = (self.sample_num as i64) * 1_000_000 / i64::from(self.sample_rate);
        let ts = (0..values.len() as i64).map(|i| start + i * step).collect();
        self.sample_num += values.len() as u64;
        CurrentsFrame { ts, values }
    }
}

impl<I> Iterator for TimeChopper<I>
where
    I: Iterator<Item = Vec<f64>>,
{
    type Item = CurrentsFrame;

    fn next(&mut self) -> Option<CurrentsFrame> {
        loop {
            if self.buffer.len() >= self.slice_size {
                return Some(self.emit());
            }
            match self.source.next() {
                Some(chunk) => self.buffer.extend(chunk),
                None => return None,
            }
        }
    }
}
