//! Binary box framing: little-endian u16 samples in fixed-size blocks, with
//! an optional byte-swap heuristic for boxes that interleave the two halves
//! of a word.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::resource::DataSource;

/// Affine calibration from raw ADC counts to amperes:
/// `amperes = raw · (power_voltage / 2^precision) · slope + offset`.
#[derive(Debug, Clone, Copy)]
pub struct Calibration {
    pub slope: f64,
    pub offset: f64,
    pub power_voltage: f64,
    pub precision: u32,
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration {
            slope: 1.0,
            offset: 0.0,
            power_voltage: 4700.0,
            precision: 10,
        }
    }
}

impl Calibration {
    #[inline]
    pub fn amperes(&self, raw: u16) -> f64 {
        f64::from(raw) * (self.power_voltage / f64::from(1u32 << self.precision)) * self.slope
            + self.offset
    }
}

/// Reads blocks from the source and converts them to calibrated sample
/// arrays. A one-byte orphan is carried between blocks so every converted
/// block is an even byte count.
pub struct BinaryReader {
    source: DataSource,
    closed: Arc<AtomicBool>,
    block_size: usize,
    calib: Calibration,
    sample_swap: bool,
    swap: bool,
    orphan: Option<u8>,
    drained: bool,
}

impl BinaryReader {
    pub fn new(
        source: DataSource,
        sample_rate: u32,
        calib: Calibration,
        sample_swap: bool,
        closed: Arc<AtomicBool>,
    ) -> Self {
        BinaryReader {
            source,
            closed,
            block_size: sample_rate as usize * 2 * 10,
            calib,
            sample_swap,
            swap: false,
            orphan: None,
            drained: false,
        }
    }

    /// Detects interleaved low/high bytes. A word whose high nibble exceeds
    /// the ADC range cannot be well-formed; the swap state is re-evaluated on
    /// every word so a single glitch does not latch the swap on forever.
    fn swap_samples(&mut self, data: &mut [u8]) {
        for pair in data.chunks_exact_mut(2) {
            let word = u16::from_le_bytes([pair[0], pair[1]]);
            if word > 0x0FFF || (self.swap && word & 0x00F0 == 0) {
                pair.swap(0, 1);
                self.swap = true;
            } else {
                self.swap = false;
            }
        }
    }

    fn convert(&mut self, mut data: Vec<u8>) -> Vec<f64> {
        if let Some(byte) = self.orphan.take() {
            data.insert(0, byte);
        }
        if data.len() % 2 != 0 {
            self.orphan = data.pop();
        }
        if self.sample_swap {
            self.swap_samples(&mut data);
        }
        data.chunks_exact(2)
            .map(|pair| self.calib.amperes(u16::from_le_bytes([pair[0], pair[1]])))
            .collect()
    }
}

impl Iterator for BinaryReader {
    type Item = Vec<f64>;

    fn next(&mut self) -> Option<Vec<f64>> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                // one final read so bytes that already arrived are not lost
                if self.drained {
                    return None;
                }
                self.drained = true;
                return match self.source.read_chunk(self.block_size) {
                    Ok(data) if data.is_empty() => None,
                    Ok(data) => Some(self.convert(data)),
                    Err(_) => None,
                };
            }
            match self.source.read_chunk(self.block_size) {
                Ok(data) if data.is_empty() => DataSource::backoff(),
                Ok(data) => {
                    debug!(bytes = data.len(), "grabber got data");
                    return Some(self.convert(data));
                }
                Err(e) => {
                    warn!(error = %e, "box read failed, stopping grabber");
                    return None;
                }
            }
        }
    }
}
