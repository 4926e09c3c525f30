//! Background maintenance scheduling.
//!
//! Four periodic passes run on independent fixed-interval timers: cache
//! optimization, memory health, metrics collection, and the
//! defragmentation check. Each pass is guarded by a compare-and-swap
//! single-flight flag, so a slow pass is skipped by its successor rather
//! than queued behind it. A shared shutdown flag stops every loop at its
//! next tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Non-blocking single-flight guard.
///
/// `try_begin` wins at most once until the matching `end`; losers skip
/// the pass entirely instead of waiting.
#[derive(Debug, Default)]
pub struct SingleFlight {
    busy: AtomicBool,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_begin(&self) -> bool {
        self.busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    pub fn end(&self) {
        self.busy.store(false, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Process-wide shutdown signal shared by request paths and background
/// loops. Long operations poll it between discrete steps.
#[derive(Debug, Default)]
pub struct ShutdownFlag {
    flag: AtomicBool,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        info!("shutdown flag set, new sessions will be rejected");
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Handles for the spawned maintenance loops.
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Abort every loop. Loops also exit on their own at the first tick
    /// after the shutdown flag is set; aborting just avoids waiting for
    /// long intervals.
    pub fn abort_all(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

/// Spawn one guarded interval loop.
///
/// Every tick checks the shutdown flag, then attempts the single-flight
/// guard; a busy pass is skipped with a debug log, not queued.
pub fn spawn_guarded_loop<F, Fut>(
    name: &'static str,
    interval: std::time::Duration,
    shutdown: Arc<ShutdownFlag>,
    guard: Arc<SingleFlight>,
    pass: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if shutdown.is_triggered() {
                debug!(pass = name, "background loop exiting on shutdown");
                break;
            }
            if !guard.try_begin() {
                debug!(pass = name, "previous pass still running, skipping");
                continue;
            }
            pass().await;
            guard.end();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    #[test]
    fn single_flight_admits_exactly_one() {
        let guard = SingleFlight::new();
        assert!(guard.try_begin());
        assert!(!guard.try_begin());
        guard.end();
        assert!(guard.try_begin());
    }

    #[tokio::test]
    async fn busy_pass_is_skipped_not_queued() {
        let guard = Arc::new(SingleFlight::new());
        let shutdown = Arc::new(ShutdownFlag::new());
        let runs = Arc::new(AtomicU64::new(0));

        // Hold the guard so every tick loses the race.
        assert!(guard.try_begin());

        let handle = spawn_guarded_loop("test", Duration::from_millis(5), shutdown.clone(), guard.clone(), {
            let runs = runs.clone();
            move || {
                let runs = runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(runs.load(Ordering::Relaxed), 0, "pass ran while guard was held");

        guard.end();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(runs.load(Ordering::Relaxed) > 0);

        shutdown.trigger();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.abort();
    }

    #[tokio::test]
    async fn loop_exits_on_shutdown() {
        let guard = Arc::new(SingleFlight::new());
        let shutdown = Arc::new(ShutdownFlag::new());
        let handle = spawn_guarded_loop(
            "test",
            Duration::from_millis(5),
            shutdown.clone(),
            guard,
            || async {},
        );

        shutdown.trigger();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(handle.is_finished());
    }
}
