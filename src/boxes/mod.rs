//! Volta box providers: read raw bytes from the measurement box and turn
//! them into calibrated sample arrays, then pump chopped frames to the
//! subscribed sinks.

pub mod binary;
pub mod plain;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, info};

use crate::chopper::TimeChopper;
use crate::config::VoltaSection;
use crate::error::{Result, VoltaError};
use crate::event::Record;
use crate::pump::Drain;
use crate::resource::{self, DataSource, SourceOptions};

pub use binary::{BinaryReader, Calibration};
pub use plain::PlainTextReader;

/// Which framing the box speaks. Selected by `volta.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxKind {
    /// Plaintext box, one decimal sample per line at 500 Hz.
    Plain500,
    /// Binary box with the VOLTAHELLO handshake, typically 10 kHz.
    Binary,
    /// Binary framing without a handshake; data starts immediately.
    Stm32,
}

impl BoxKind {
    pub fn from_config(s: &str) -> Result<BoxKind> {
        match s.to_ascii_lowercase().as_str() {
            "500hz" => Ok(BoxKind::Plain500),
            "binary" => Ok(BoxKind::Binary),
            "stm32" => Ok(BoxKind::Stm32),
            other => Err(VoltaError::Config(format!("unknown volta box type: {other}"))),
        }
    }

    fn default_sample_rate(self) -> u32 {
        match self {
            BoxKind::Plain500 => 500,
            BoxKind::Binary | BoxKind::Stm32 => 10_000,
        }
    }

    fn default_baud_rate(self) -> u32 {
        match self {
            BoxKind::Plain500 => 115_200,
            BoxKind::Binary | BoxKind::Stm32 => 230_400,
        }
    }
}

/// Scans for the binary box handshake and returns the authoritative sample
/// rate from the JSON spec line.
///
/// Arbitrary garbage before `VOLTAHELLO` is discarded; a malformed spec line
/// is fatal.
pub fn handshake(source: &mut DataSource) -> Result<u32> {
    info!("awaiting handshake");
    loop {
        match source.read_line()? {
            Some(line) if line == "VOLTAHELLO" => break,
            Some(_) => continue,
            None => {
                return Err(VoltaError::Resource(
                    "data source ended before VOLTAHELLO".into(),
                ))
            }
        }
    }
    let spec_line = source
        .read_line()?
        .ok_or_else(|| VoltaError::Resource("data source ended before handshake spec".into()))?;
    let spec: serde_json::Value = serde_json::from_str(&spec_line)
        .map_err(|e| VoltaError::Resource(format!("malformed handshake spec: {e}")))?;
    let sps = spec
        .get("sps")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| VoltaError::Resource("handshake spec is missing sps".into()))?;
    info!(sps, "sample rate handshake success");
    loop {
        match source.read_line()? {
            Some(line) if line == "DATASTART" => break,
            Some(_) => continue,
            None => {
                return Err(VoltaError::Resource(
                    "data source ended before DATASTART".into(),
                ))
            }
        }
    }
    Ok(sps as u32)
}

/// One measurement box: owns the data source, the reader's close flag and the
/// frame pump. Lifecycle: `new` opens the source, `prepare` consumes the
/// handshake (or startup transient), `start_test` spawns the pipeline,
/// `end_test` shuts it down.
pub struct VoltaBox {
    kind: BoxKind,
    pub sample_rate: u32,
    chop_ratio: f64,
    calib: Calibration,
    sample_swap: bool,
    source: Option<DataSource>,
    closed: Arc<AtomicBool>,
    pump: Option<Drain>,
}

impl VoltaBox {
    pub fn new(cfg: &VoltaSection) -> Result<Self> {
        let kind = BoxKind::from_config(&cfg.r#type)?;
        let opts = SourceOptions {
            baud_rate: cfg.baud_rate.unwrap_or_else(|| kind.default_baud_rate()),
            read_timeout: Duration::from_secs(cfg.grab_timeout),
        };
        let source = resource::open_source(&cfg.source, &opts).map_err(|e| {
            VoltaError::Resource(format!(
                "device {} not found, check the box USB connection: {e}",
                cfg.source
            ))
        })?;
        debug!(source = %cfg.source, ?kind, "data source initialized");
        Ok(VoltaBox {
            kind,
            sample_rate: cfg.sample_rate.unwrap_or_else(|| kind.default_sample_rate()),
            chop_ratio: cfg.chop_ratio,
            calib: Calibration {
                slope: cfg.slope,
                offset: cfg.offset,
                power_voltage: cfg.power_voltage,
                precision: cfg.precision,
            },
            sample_swap: cfg.sample_swap,
            source: Some(source),
            closed: Arc::new(AtomicBool::new(false)),
            pump: None,
        })
    }

    /// Consumes whatever the box emits before real data: the handshake for
    /// the binary box, the startup transient for the plaintext box. After
    /// this returns, `sample_rate` is authoritative.
    pub fn prepare(&mut self) -> Result<()> {
        let source = self
            .source
            .as_mut()
            .ok_or_else(|| VoltaError::Resource("box already started".into()))?;
        match self.kind {
            BoxKind::Binary => {
                self.sample_rate = handshake(source)?;
            }
            BoxKind::Plain500 => {
                // flush the device's dirty startup buffer
                for _ in 0..self.sample_rate {
                    if source.read_line()?.is_none() {
                        break;
                    }
                }
            }
            BoxKind::Stm32 => {}
        }
        Ok(())
    }

    /// Starts the grab pipeline: reader → chopper → fan-out to `listeners`.
    pub fn start_test(&mut self, listeners: Vec<Sender<Record>>) -> Result<()> {
        let source = self
            .source
            .take()
            .ok_or_else(|| VoltaError::Resource("box already started".into()))?;
        let closed = Arc::clone(&self.closed);
        let frames: Box<dyn Iterator<Item = Vec<f64>> + Send> = match self.kind {
            BoxKind::Binary | BoxKind::Stm32 => Box::new(BinaryReader::new(
                source,
                self.sample_rate,
                self.calib,
                self.sample_swap,
                closed,
            )),
            BoxKind::Plain500 => Box::new(PlainTextReader::new(source, closed)),
        };
        let chopper = TimeChopper::new(frames, self.sample_rate, self.chop_ratio);
        let records = chopper.map(|frame| Record::Currents(Arc::new(frame)));
        info!("starting grab thread");
        self.pump = Some(Drain::spawn("box-grabber", records, listeners));
        Ok(())
    }

    /// Signals the reader to stop and waits for the pump to drain.
    pub fn end_test(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(pump) = self.pump.as_mut() {
            pump.close();
            pump.wait(Duration::from_secs(10));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn source(bytes: Vec<u8>) -> DataSource {
        DataSource::from_reader(Box::new(Cursor::new(bytes)), false)
    }

    #[test]
    fn handshake_discards_garbage() {
        let mut src = source(b"garbage\nnoise\nVOLTAHELLO\n{\"sps\":1000}\nDATASTART\n".to_vec());
        assert_eq!(handshake(&mut src).unwrap(), 1000);
    }

    #[test]
    fn handshake_rejects_malformed_spec() {
        let mut src = source(b"VOLTAHELLO\nnot json\nDATASTART\n".to_vec());
        assert!(matches!(
            handshake(&mut src),
            Err(VoltaError::Resource(_))
        ));
    }

    #[test]
    fn handshake_requires_sps() {
        let mut src = source(b"VOLTAHELLO\n{\"version\":4}\nDATASTART\n".to_vec());
        assert!(handshake(&mut src).is_err());
    }

    #[test]
    fn box_kind_from_config() {
        assert_eq!(BoxKind::from_config("500hz").unwrap(), BoxKind::Plain500);
        assert_eq!(BoxKind::from_config("Binary").unwrap(), BoxKind::Binary);
        assert!(BoxKind::from_config("fancy").is_err());
    }
}
