//! Generator-to-sink pump with cooperative shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use tracing::{debug, warn};

/// Moves items from an iterator to a list of channel senders until the
/// source is exhausted or the interrupt flag is set. The flag is checked
/// between items, so shutdown latency is bounded by one source read.
pub struct Drain {
    interrupt: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drain {
    pub fn spawn<T, I>(name: &str, source: I, listeners: Vec<Sender<T>>) -> Drain
    where
        T: Clone + Send + 'static,
        I: Iterator<Item = T> + Send + 'static,
    {
        let interrupt = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&interrupt);
        let done = Arc::clone(&finished);
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                for item in source {
                    if flag.load(Ordering::SeqCst) {
                        break;
                    }
                    for listener in &listeners {
                        if listener.send(item.clone()).is_err() {
                            debug!(pump = %thread_name, "listener queue disconnected");
                        }
                    }
                }
                debug!(pump = %thread_name, "pump finished");
                done.store(true, Ordering::SeqCst);
            })
            .expect("failed to spawn pump thread");
        Drain {
            interrupt,
            finished,
            handle: Some(handle),
        }
    }

    /// Requests the pump to stop after the current item.
    pub fn close(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    /// Blocks until the pump loop has exited or the timeout elapses.
    /// Returns whether the pump finished in time.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.finished.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                warn!("pump did not finish within {timeout:?}");
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        true
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn pumps_everything_to_every_listener() {
        let (tx1, rx1) = unbounded();
        let (tx2, rx2) = unbounded();
        let mut pump = Drain::spawn("test", 0..5, vec![tx1, tx2]);
        assert!(pump.wait(Duration::from_secs(2)));
        assert_eq!(rx1.iter().take(5).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert_eq!(rx2.iter().take(5).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn close_interrupts_an_endless_source() {
        let (tx, rx) = unbounded();
        let mut pump = Drain::spawn("endless", std::iter::repeat(1u8), vec![tx]);
        // let it move a few items first
        let _ = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        pump.close();
        assert!(pump.wait(Duration::from_secs(2)));
    }

    #[test]
    fn survives_disconnected_listener() {
        let (tx, rx) = unbounded::<i32>();
        drop(rx);
        let mut pump = Drain::spawn("orphan", 0..100, vec![tx]);
        assert!(pump.wait(Duration::from_secs(2)));
    }
}
