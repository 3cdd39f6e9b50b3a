//! Synchronization between the box clock and the phone clocks.
//!
//! A collector thread buffers sync events and the first seconds of the
//! current trace while the test runs; after the test the buffers are
//! cross-correlated against a reference square wave reconstructed from the
//! rise/fall events, yielding the sample index aligned to the first rise
//! and the two clock offsets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use tracing::{debug, info, warn};

use crate::error::{Result, VoltaError};
use crate::event::{EventKind, LogEvent, Record};

/// Buffers accumulated during the run, handed back when the collector joins.
#[derive(Debug, Default)]
pub struct SyncBuffers {
    pub currents: Vec<f64>,
    pub ts: Vec<i64>,
    pub syncs: Vec<LogEvent>,
}

/// Result of a successful sync search.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPoints {
    /// box `ts` minus phone system clock at the first rise, µs
    pub sys_uts_offset: i64,
    /// box `ts` minus phone monotonic clock at the first rise, µs;
    /// absent when the first rise carried no envelope timestamp
    pub log_uts_offset: Option<i64>,
    /// index of the current sample aligned to the first rise
    pub sync_sample: usize,
}

/// Collector thread: appends sync events unconditionally, appends current
/// frames only while the buffer holds fewer than `capacity` samples.
pub struct SyncCollector {
    interrupt: Arc<AtomicBool>,
    handle: JoinHandle<SyncBuffers>,
}

impl SyncCollector {
    pub fn spawn(source: Receiver<Record>, capacity: usize) -> SyncCollector {
        let interrupt = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&interrupt);
        let handle = thread::Builder::new()
            .name("sync-collector".into())
            .spawn(move || {
                let mut buffers = SyncBuffers::default();
                let absorb = |record: Record, buffers: &mut SyncBuffers| match record {
                    Record::Currents(frame) => {
                        if buffers.currents.len() < capacity {
                            buffers.currents.extend_from_slice(&frame.values);
                            buffers.ts.extend_from_slice(&frame.ts);
                        }
                    }
                    Record::Events(EventKind::Sync, batch) => {
                        buffers.syncs.extend(batch.iter().cloned());
                    }
                    Record::Events(..) => {}
                };
                loop {
                    if flag.load(Ordering::SeqCst) {
                        for record in source.try_iter() {
                            absorb(record, &mut buffers);
                        }
                        break;
                    }
                    match source.recv_timeout(Duration::from_millis(500)) {
                        Ok(record) => absorb(record, &mut buffers),
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!(
                    currents = buffers.currents.len(),
                    syncs = buffers.syncs.len(),
                    "sync collector finished"
                );
                buffers
            })
            .expect("failed to spawn sync collector thread");
        SyncCollector { interrupt, handle }
    }

    pub fn close(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    pub fn join(self) -> SyncBuffers {
        self.handle.join().unwrap_or_else(|_| {
            warn!("sync collector panicked, sync will be skipped");
            SyncBuffers::default()
        })
    }
}

/// Cross-correlates the current trace against the reference signal and
/// derives the clock offsets.
pub fn find_sync_points(
    buffers: &SyncBuffers,
    sample_rate: u32,
    search_interval: u32,
) -> Result<SyncPoints> {
    info!("starting sync");
    if buffers.syncs.is_empty() {
        return Err(VoltaError::SyncInfeasible("no sync events found"));
    }
    let needed = search_interval as usize * sample_rate as usize;
    if buffers.currents.len() < needed {
        return Err(VoltaError::SyncInfeasible(
            "not enough electrical currents for sync",
        ));
    }

    // rise → 1, fall → 0; drop events past the search interval
    let first_sys = buffers.syncs[0].sys_uts;
    let horizon = first_sys + i64::from(search_interval) * 1_000_000;
    let mut edges: Vec<(i64, f64)> = Vec::new();
    for event in &buffers.syncs {
        if event.sys_uts >= horizon {
            continue;
        }
        let level = match event.message.as_str() {
            "rise" => 1.0,
            "fall" => 0.0,
            other => {
                debug!(message = other, "unrecognised sync message, skipped");
                continue;
            }
        };
        let sample_offset = (event.sys_uts - first_sys) * i64::from(sample_rate) / 1_000_000;
        edges.push((sample_offset, level));
    }

    let reference = reference_signal(&edges)?;
    debug!(len = reference.len(), "reference signal generated");

    let correlation = cross_correlate(&buffers.currents[..needed], &reference);
    let sync_sample = argmax(&correlation)
        .ok_or(VoltaError::SyncInfeasible("empty cross-correlation"))?;
    let sync_ts = buffers.ts[sync_sample];
    debug!(sync_sample, sync_ts, "cross-correlation peak");

    let first_rise = buffers
        .syncs
        .iter()
        .find(|e| e.message == "rise")
        .ok_or(VoltaError::SyncInfeasible("no rise events found"))?;
    Ok(SyncPoints {
        sys_uts_offset: sync_ts - first_rise.sys_uts,
        log_uts_offset: first_rise.log_uts.map(|log| sync_ts - log),
        sync_sample,
    })
}

/// Builds the zero-order-hold square wave over the edge list and removes its
/// mean so the correlation is unbiased by the DC level.
fn reference_signal(edges: &[(i64, f64)]) -> Result<Vec<f64>> {
    let last = edges.last().map(|&(off, _)| off).unwrap_or(0);
    if edges.len() < 2 || last < 2 {
        return Err(VoltaError::SyncInfeasible("not enough sync edges"));
    }
    let mut signal = Vec::with_capacity(last as usize);
    let mut edge_idx = 0usize;
    for x in 0..last {
        while edge_idx + 1 < edges.len() && edges[edge_idx + 1].0 <= x {
            edge_idx += 1;
        }
        signal.push(edges[edge_idx].1);
    }
    let mean = signal.iter().sum::<f64>() / signal.len() as f64;
    for v in &mut signal {
        *v -= mean;
    }
    Ok(signal)
}

/// Valid-mode cross-correlation via FFT convolution:
/// `out[k] = Σ_j sig[k + j] · reference[j]`, `k ∈ [0, sig.len() − m]`.
///
/// The FFT path is required for performance: tens of seconds at 10 kHz
/// against thousands of reference samples is far too slow done directly.
fn cross_correlate(sig: &[f64], reference: &[f64]) -> Vec<f64> {
    let n = sig.len();
    let m = reference.len();
    if m == 0 || n < m {
        return Vec::new();
    }
    let size = (n + m - 1).next_power_of_two();
    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(size);
    let ifft = planner.plan_fft_inverse(size);

    let mut a: Vec<Complex<f64>> = sig
        .iter()
        .map(|&v| Complex::new(v, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(size)
        .collect();
    // convolution with the reversed reference is correlation
    let mut b: Vec<Complex<f64>> = reference
        .iter()
        .rev()
        .map(|&v| Complex::new(v, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(size)
        .collect();
    fft.process(&mut a);
    fft.process(&mut b);
    for (x, y) in a.iter_mut().zip(&b) {
        *x *= y;
    }
    ifft.process(&mut a);

    let scale = 1.0 / size as f64;
    // the valid region of the full convolution is lags m-1 ..= n-1
    a[m - 1..n].iter().map(|c| c.re * scale).collect()
}

fn argmax(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in values.iter().enumerate() {
        if best.map_or(true, |(_, b)| v > b) {
            best = Some((i, v));
        }
    }
    best.map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_event(sys_uts: i64, log_uts: Option<i64>, message: &str) -> LogEvent {
        LogEvent {
            sys_uts,
            log_uts,
            kind: EventKind::Sync,
            app: Some("testapp".into()),
            tag: Some("syncA".into()),
            message: message.into(),
            value: None,
        }
    }

    /// Square-wave current trace: `cycles` periods starting at `start_s`,
    /// flat zero elsewhere (the flashlight pattern is finite).
    fn square_trace(
        rate: u32,
        seconds: u32,
        start_s: f64,
        period_s: f64,
        cycles: u32,
    ) -> SyncBuffers {
        let total = (rate * seconds) as usize;
        let step = 1_000_000 / i64::from(rate);
        let end_s = start_s + period_s * f64::from(cycles);
        let mut buffers = SyncBuffers::default();
        for i in 0..total {
            let t = i as f64 / f64::from(rate);
            let value = if t >= start_s && t < end_s && ((t - start_s) / period_s).fract() < 0.5 {
                1.0
            } else {
                0.0
            };
            buffers.currents.push(value);
            buffers.ts.push(i as i64 * step);
        }
        buffers
    }

    #[test]
    fn empty_sync_buffer_fails() {
        let buffers = SyncBuffers {
            currents: vec![0.0; 100],
            ts: (0..100).collect(),
            syncs: Vec::new(),
        };
        assert!(matches!(
            find_sync_points(&buffers, 10, 10),
            Err(VoltaError::SyncInfeasible("no sync events found"))
        ));
    }

    #[test]
    fn short_current_buffer_fails() {
        let mut buffers = SyncBuffers::default();
        buffers.syncs.push(sync_event(0, Some(0), "rise"));
        buffers.currents = vec![0.0; 99];
        buffers.ts = (0..99).collect();
        assert!(matches!(
            find_sync_points(&buffers, 10, 10),
            Err(VoltaError::SyncInfeasible(_))
        ));
    }

    #[test]
    fn finds_known_offset() {
        // 1 Hz square wave starting at t = 2.0 s in a 10 s, 1 kHz trace;
        // rise/fall events at run-relative 2.0 s + k·0.5 s
        let rate = 1000u32;
        let mut buffers = square_trace(rate, 10, 2.0, 1.0, 3);
        let mut t = 2_000_000i64;
        for k in 0..6 {
            let message = if k % 2 == 0 { "rise" } else { "fall" };
            buffers
                .syncs
                .push(sync_event(t, Some(t - 2_000_000), message));
            t += 500_000;
        }
        let points = find_sync_points(&buffers, rate, 10).unwrap();
        let expected_sample = 2_000;
        assert!(
            (points.sync_sample as i64 - expected_sample).abs() <= 2,
            "sync_sample = {}",
            points.sync_sample
        );
        // box ts of the peak ≈ 2.0 s; first rise sys_uts = 2.0 s → offset ≈ 0
        assert!(points.sys_uts_offset.abs() <= 2_000, "{points:?}");
        // first rise log_uts = 0 → log offset ≈ 2.0 s
        let log_offset = points.log_uts_offset.unwrap();
        assert!((log_offset - 2_000_000).abs() <= 2_000, "{log_offset}");
    }

    #[test]
    fn exact_length_current_buffer_is_accepted() {
        let rate = 100u32;
        let mut buffers = square_trace(rate, 5, 1.0, 1.0, 3);
        assert_eq!(buffers.currents.len(), 500);
        for (k, t) in (1_000_000i64..4_000_000).step_by(500_000).enumerate() {
            let message = if k % 2 == 0 { "rise" } else { "fall" };
            buffers.syncs.push(sync_event(t, Some(t), message));
        }
        // buffer is exactly search_interval · sample_rate long: proceeds
        let points = find_sync_points(&buffers, rate, 5).unwrap();
        assert!((points.sync_sample as i64 - 100).abs() <= 2);
    }

    #[test]
    fn collector_caps_current_buffer() {
        use crossbeam_channel::unbounded;
        use std::sync::Arc;

        let (tx, rx) = unbounded();
        let collector = SyncCollector::spawn(rx, 10);
        for i in 0..5 {
            let frame = crate::event::CurrentsFrame {
                ts: (i * 8..(i + 1) * 8).collect(),
                values: vec![1.0; 8],
            };
            tx.send(Record::Currents(Arc::new(frame))).unwrap();
        }
        drop(tx);
        let buffers = collector.join();
        // frames append only while below capacity, so at most one frame
        // overshoots
        assert_eq!(buffers.currents.len(), 16);
    }

    #[test]
    fn collector_keeps_all_sync_events() {
        use crossbeam_channel::unbounded;

        let (tx, rx) = unbounded();
        let collector = SyncCollector::spawn(rx, 0);
        let batch = Arc::new(vec![
            sync_event(0, Some(0), "rise"),
            sync_event(500_000, Some(500_000), "fall"),
        ]);
        tx.send(Record::Events(EventKind::Sync, batch)).unwrap();
        tx.send(Record::Events(
            EventKind::Event,
            Arc::new(vec![sync_event(1, None, "ignored")]),
        ))
        .unwrap();
        collector.close();
        drop(tx);
        let buffers = collector.join();
        assert_eq!(buffers.syncs.len(), 2);
    }
}
