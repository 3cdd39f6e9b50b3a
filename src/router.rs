//! Event router: batches parsed events by kind, normalises their clocks to
//! run-relative offsets and dispatches each batch to the listeners
//! registered for that kind.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::event::{EventKind, LogEvent, Record};

/// Clock anchors and the subscription table. Lives entirely inside the
/// router thread.
struct RouterState {
    sys_uts_start: Option<i64>,
    log_uts_start: Option<i64>,
    destinations: HashMap<EventKind, Vec<Sender<Record>>>,
}

impl RouterState {
    /// Normalises and dispatches one batch of events (arrival order).
    fn route(&mut self, batch: Vec<LogEvent>) {
        let mut grouped: HashMap<EventKind, Vec<LogEvent>> = HashMap::new();
        for mut event in batch {
            // the first event anywhere anchors the system clock; the first
            // envelope anchors the device monotonic clock
            let sys_start = *self.sys_uts_start.get_or_insert_with(|| {
                debug!(sys_uts = event.sys_uts, "sys uts start detected");
                event.sys_uts
            });
            event.sys_uts -= sys_start;
            if let Some(raw) = event.log_uts {
                let log_start = *self.log_uts_start.get_or_insert_with(|| {
                    debug!(log_uts = raw, "log uts start detected");
                    raw
                });
                event.log_uts = Some(raw - log_start);
            }
            if event.kind == EventKind::Metric {
                match event.message.parse::<f64>() {
                    Ok(v) => event.value = Some(v),
                    Err(_) => {
                        // a metric whose payload is not a number is demoted
                        // to a plain event instead of poisoning the stream
                        debug!(message = %event.message, "metric with non-numeric payload");
                        event.kind = EventKind::Event;
                    }
                }
            }
            grouped.entry(event.kind).or_default().push(event);
        }
        for (kind, events) in grouped {
            let Some(listeners) = self.destinations.get(&kind) else {
                debug!(%kind, count = events.len(), "no listeners for event kind");
                continue;
            };
            let batch = Arc::new(events);
            for listener in listeners {
                if listener
                    .send(Record::Events(kind, Arc::clone(&batch)))
                    .is_err()
                {
                    warn!(%kind, "listener queue disconnected, skipped");
                }
            }
        }
    }
}

/// Handle to the router thread.
pub struct EventsRouter {
    interrupt: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EventsRouter {
    pub fn spawn(
        source: Receiver<LogEvent>,
        destinations: HashMap<EventKind, Vec<Sender<Record>>>,
    ) -> EventsRouter {
        let interrupt = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&interrupt);
        let done = Arc::clone(&finished);
        let handle = thread::Builder::new()
            .name("events-router".into())
            .spawn(move || {
                let mut state = RouterState {
                    sys_uts_start: None,
                    log_uts_start: None,
                    destinations,
                };
                loop {
                    if flag.load(Ordering::SeqCst) {
                        // post-route whatever is still queued, then stop
                        let pending: Vec<LogEvent> = source.try_iter().collect();
                        info!(pending = pending.len(), "router got interrupt signal");
                        if !pending.is_empty() {
                            state.route(pending);
                        }
                        break;
                    }
                    match source.recv_timeout(Duration::from_millis(500)) {
                        Ok(event) => {
                            let mut batch = vec![event];
                            batch.extend(source.try_iter());
                            state.route(batch);
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("finished routing events");
                done.store(true, Ordering::SeqCst);
            })
            .expect("failed to spawn router thread");
        EventsRouter {
            interrupt,
            finished,
            handle: Some(handle),
        }
    }

    pub fn close(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    /// Blocks until the router has drained and exited, or the timeout hits.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.finished.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                warn!("router did not finish within {timeout:?}");
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn event(kind: EventKind, sys_uts: i64, log_uts: Option<i64>, message: &str) -> LogEvent {
        LogEvent {
            sys_uts,
            log_uts,
            kind,
            app: Some("testapp".into()),
            tag: Some("tag".into()),
            message: message.into(),
            value: None,
        }
    }

    fn run_router(events: Vec<LogEvent>) -> HashMap<EventKind, Vec<LogEvent>> {
        let (in_tx, in_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        let destinations: HashMap<_, _> = EventKind::ALL
            .iter()
            .map(|&k| (k, vec![out_tx.clone()]))
            .collect();
        drop(out_tx);
        let mut router = EventsRouter::spawn(in_rx, destinations);
        for ev in events {
            in_tx.send(ev).unwrap();
        }
        drop(in_tx);
        assert!(router.wait(Duration::from_secs(5)));
        let mut result: HashMap<EventKind, Vec<LogEvent>> = HashMap::new();
        for record in out_rx.try_iter() {
            if let Record::Events(kind, batch) = record {
                result.entry(kind).or_default().extend(batch.iter().cloned());
            }
        }
        result
    }

    #[test]
    fn normalises_sys_uts_to_first_event() {
        let routed = run_router(vec![
            event(EventKind::Event, 10_000_000, Some(500), "a"),
            event(EventKind::Event, 10_000_700, Some(900), "b"),
        ]);
        let events = &routed[&EventKind::Event];
        assert_eq!(events[0].sys_uts, 0);
        assert_eq!(events[1].sys_uts, 700);
        assert_eq!(events[0].log_uts, Some(0));
        assert_eq!(events[1].log_uts, Some(400));
    }

    #[test]
    fn sys_uts_is_non_decreasing_per_kind() {
        let routed = run_router(vec![
            event(EventKind::Sync, 5_000_000, Some(0), "rise"),
            event(EventKind::Event, 5_000_100, Some(10), "x"),
            event(EventKind::Sync, 5_500_000, Some(500_010), "fall"),
        ]);
        for events in routed.values() {
            let mut prev = i64::MIN;
            for ev in events {
                assert!(ev.sys_uts >= prev);
                prev = ev.sys_uts;
            }
        }
    }

    #[test]
    fn metric_value_is_parsed() {
        let routed = run_router(vec![
            event(EventKind::Metric, 0, Some(0), "3.25"),
            event(EventKind::Metric, 100, Some(10), "-17"),
        ]);
        let metrics = &routed[&EventKind::Metric];
        assert_eq!(metrics[0].value, Some(3.25));
        assert_eq!(metrics[1].value, Some(-17.0));
    }

    #[test]
    fn non_numeric_metric_is_demoted_to_event() {
        let routed = run_router(vec![
            event(EventKind::Metric, 0, Some(0), "not-a-number"),
        ]);
        assert!(!routed.contains_key(&EventKind::Metric));
        let demoted = &routed[&EventKind::Event];
        assert_eq!(demoted[0].kind, EventKind::Event);
        assert_eq!(demoted[0].value, None);
    }

    #[test]
    fn unknown_events_reach_the_unknown_stream() {
        let routed = run_router(vec![LogEvent {
            sys_uts: 42,
            log_uts: None,
            kind: EventKind::Unknown,
            app: None,
            tag: None,
            message: "free-form".into(),
            value: None,
        }]);
        assert_eq!(routed[&EventKind::Unknown].len(), 1);
    }
}
