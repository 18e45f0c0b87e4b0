//! Count/time debounce trigger.
//!
//! Invokes one callback when either the pending count reaches `max_count` or
//! `max_wait` has passed since the last fire (and the count is non-zero).
//! The callback runs on the scheduling loop itself, so it is never invoked
//! concurrently with itself. Producers only ever `try_send` a wake-up into a
//! small queue; when the queue is full the wake-up is dropped, since the loop
//! only needs a reason to re-check, not every reason.

use crate::shutdown::Shutdown;
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Depth of the wake-up queue.
pub const SIGNAL_QUEUE_DEPTH: usize = 10;

/// Single-flight debounce scheduler.
pub struct Trigger {
    max_count: u64,
    max_wait: Duration,
    current_count: AtomicU64,
    fires: AtomicU64,
    signal_tx: Sender<()>,
    signal_rx: Receiver<()>,
}

impl Trigger {
    pub fn new(max_count: u64, max_wait: Duration) -> Self {
        let (signal_tx, signal_rx) = bounded(SIGNAL_QUEUE_DEPTH);
        Self {
            max_count: max_count.max(1),
            max_wait: max_wait.max(Duration::from_millis(1)),
            current_count: AtomicU64::new(0),
            fires: AtomicU64::new(0),
            signal_tx,
            signal_rx,
        }
    }

    /// Report the latest pending count. Never blocks.
    ///
    /// Wakes the loop only when the count changed and reached `max_count`;
    /// smaller counts are picked up by the periodic tick.
    pub fn on_count_changed(&self, count: u64) {
        let old = self.current_count.swap(count, Ordering::AcqRel);
        if count != old && count >= self.max_count {
            self.signal();
        }
    }

    /// Post a wake-up, dropping it if the queue is saturated.
    pub fn signal(&self) {
        let _ = self.signal_tx.try_send(());
    }

    pub fn current_count(&self) -> u64 {
        self.current_count.load(Ordering::Acquire)
    }

    /// Number of times the callback has been invoked.
    pub fn fire_count(&self) -> u64 {
        self.fires.load(Ordering::Acquire)
    }

    /// Wake-ups currently queued.
    pub fn pending_signals(&self) -> usize {
        self.signal_rx.len()
    }

    /// Run the ticker and the scheduling loop until `shutdown` is cancelled.
    ///
    /// `callback` receives a monotonically increasing fire id. A wake-up
    /// still queued at shutdown is abandoned.
    pub fn run<F>(&self, shutdown: &Shutdown, mut callback: F)
    where
        F: FnMut(u64, &Shutdown),
    {
        thread::scope(|scope| {
            // Separate from the loop below so a long callback does not skew ticks.
            scope.spawn(|| {
                let ticker = tick(self.max_wait);
                loop {
                    select! {
                        recv(ticker) -> _ => self.signal(),
                        recv(shutdown.receiver()) -> _ => break,
                    }
                }
            });

            let mut last_fire: Option<Instant> = None;
            loop {
                select! {
                    recv(shutdown.receiver()) -> _ => break,
                    recv(self.signal_rx) -> signal => {
                        if signal.is_err() || shutdown.is_cancelled() {
                            break;
                        }

                        let count = self.current_count();
                        let waited = last_fire.map_or(true, |at| at.elapsed() >= self.max_wait);
                        if count > 0 && (count >= self.max_count || waited) {
                            last_fire = Some(Instant::now());
                            let fire = self.fires.fetch_add(1, Ordering::AcqRel) + 1;
                            debug!(fire, count, by_count = count >= self.max_count, "trigger fired");
                            callback(fire, shutdown);
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_signal_queue_never_blocks() {
        let trigger = Trigger::new(1, Duration::from_secs(60));
        for count in 1..=1000 {
            trigger.on_count_changed(count);
        }
        assert_eq!(trigger.pending_signals(), SIGNAL_QUEUE_DEPTH);
        assert_eq!(trigger.current_count(), 1000);
    }

    #[test]
    fn test_same_count_does_not_signal() {
        let trigger = Trigger::new(5, Duration::from_secs(60));
        trigger.on_count_changed(7);
        trigger.on_count_changed(7);
        trigger.on_count_changed(3);
        assert_eq!(trigger.pending_signals(), 1);
    }

    #[test]
    fn test_fires_on_count_without_waiting() {
        let trigger = Arc::new(Trigger::new(5, Duration::from_secs(2)));
        let shutdown = Shutdown::new();
        let fired_at = Arc::new(parking_lot::Mutex::new(None));

        let runner = {
            let trigger = Arc::clone(&trigger);
            let shutdown = shutdown.clone();
            let fired_at = Arc::clone(&fired_at);
            thread::spawn(move || {
                trigger.run(&shutdown, |_, _| {
                    fired_at.lock().get_or_insert_with(Instant::now);
                    trigger.on_count_changed(0);
                });
            })
        };

        let start = Instant::now();
        for count in 1..=5 {
            trigger.on_count_changed(count);
        }

        let deadline = Instant::now() + Duration::from_secs(1);
        while fired_at.lock().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        shutdown.cancel();
        runner.join().unwrap();

        let fired = (*fired_at.lock()).expect("trigger did not fire on count");
        assert!(fired.duration_since(start) < Duration::from_secs(1));
    }

    #[test]
    fn test_fires_once_after_wait() {
        let trigger = Arc::new(Trigger::new(100, Duration::from_millis(150)));
        let shutdown = Shutdown::new();
        let fires = Arc::new(AtomicUsize::new(0));

        trigger.on_count_changed(1);

        let runner = {
            let trigger = Arc::clone(&trigger);
            let shutdown = shutdown.clone();
            let fires = Arc::clone(&fires);
            thread::spawn(move || {
                trigger.run(&shutdown, |_, _| {
                    fires.fetch_add(1, Ordering::SeqCst);
                    trigger.on_count_changed(0);
                });
            })
        };

        thread::sleep(Duration::from_millis(60));
        assert_eq!(fires.load(Ordering::SeqCst), 0, "fired before max_wait");

        thread::sleep(Duration::from_millis(600));
        shutdown.cancel();
        runner.join().unwrap();

        assert_eq!(fires.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_count_never_fires() {
        let trigger = Arc::new(Trigger::new(1, Duration::from_millis(10)));
        let shutdown = Shutdown::new();
        let fires = Arc::new(AtomicUsize::new(0));

        let runner = {
            let trigger = Arc::clone(&trigger);
            let shutdown = shutdown.clone();
            let fires = Arc::clone(&fires);
            thread::spawn(move || {
                trigger.run(&shutdown, |_, _| {
                    fires.fetch_add(1, Ordering::SeqCst);
                });
            })
        };

        thread::sleep(Duration::from_millis(100));
        shutdown.cancel();
        runner.join().unwrap();
        assert_eq!(fires.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_single_flight_under_burst() {
        let trigger = Arc::new(Trigger::new(10, Duration::from_millis(5)));
        let shutdown = Shutdown::new();
        let active = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));

        let runner = {
            let trigger = Arc::clone(&trigger);
            let shutdown = shutdown.clone();
            let active = Arc::clone(&active);
            let overlap = Arc::clone(&overlap);
            thread::spawn(move || {
                trigger.run(&shutdown, |_, _| {
                    if active.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlap.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_millis(2));
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            })
        };

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let trigger = Arc::clone(&trigger);
                thread::spawn(move || {
                    for i in 0..1000u64 {
                        trigger.on_count_changed(p * 1000 + i + 1);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        thread::sleep(Duration::from_millis(100));
        shutdown.cancel();
        runner.join().unwrap();

        assert!(trigger.fire_count() > 0);
        assert_eq!(overlap.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_run_returns_promptly_on_cancel() {
        let trigger = Trigger::new(10, Duration::from_secs(30));
        let shutdown = Shutdown::new();
        let remote = shutdown.clone();

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });

        let start = Instant::now();
        trigger.run(&shutdown, |_, _| {});
        assert!(start.elapsed() < Duration::from_secs(5));
        canceller.join().unwrap();
    }
}
