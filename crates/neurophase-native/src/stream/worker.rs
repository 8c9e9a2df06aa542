//! Background compute thread lifecycle
//!
//! One non-real-time thread runs the expensive fits on a timer. It is the
//! only thread in the pipeline allowed to sleep; the producer side never
//! blocks on it. The thread wakes when its interval elapses, when a recalc
//! is requested explicitly, or when it is told to exit.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::debug;

struct WorkerControl {
    exit: AtomicBool,
    interval_ms: AtomicU32,
    wake: Mutex<bool>,
    condvar: Condvar,
}

impl WorkerControl {
    fn notify(&self) {
        let mut woken = self.wake.lock().expect("worker lock poisoned");
        *woken = true;
        drop(woken);
        self.condvar.notify_one();
    }
}

/// Handle to a running compute thread.
///
/// The job closure runs once per wake. Dropping the handle signals the
/// thread and joins it.
pub struct ComputeWorker {
    control: Arc<WorkerControl>,
    handle: Option<JoinHandle<()>>,
}

impl ComputeWorker {
    /// Spawn a named worker running `job` every `interval_ms` milliseconds.
    pub fn spawn(
        name: &str,
        interval_ms: u32,
        mut job: impl FnMut() + Send + 'static,
    ) -> Self {
        let control = Arc::new(WorkerControl {
            exit: AtomicBool::new(false),
            interval_ms: AtomicU32::new(interval_ms),
            wake: Mutex::new(false),
            condvar: Condvar::new(),
        });

        let thread_control = Arc::clone(&control);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!(target: "neurophase::worker", "compute thread started");
                while !thread_control.exit.load(Ordering::Acquire) {
                    let started = Instant::now();
                    job();

                    let interval = Duration::from_millis(u64::from(
                        thread_control.interval_ms.load(Ordering::Relaxed),
                    ));
                    // Sleep for the interval minus compute time, never a
                    // negative duration.
                    let remaining = interval.saturating_sub(started.elapsed());

                    let mut woken =
                        thread_control.wake.lock().expect("worker lock poisoned");
                    if !*woken && !remaining.is_zero() {
                        let (guard, _timeout) = thread_control
                            .condvar
                            .wait_timeout(woken, remaining)
                            .expect("worker lock poisoned");
                        woken = guard;
                    }
                    *woken = false;
                }
                debug!(target: "neurophase::worker", "compute thread exiting");
            })
            .expect("failed to spawn compute thread");

        Self {
            control,
            handle: Some(handle),
        }
    }

    /// Change the recalculation interval; takes effect at the next wake.
    pub fn set_interval_ms(&self, interval_ms: u32) {
        self.control.interval_ms.store(interval_ms, Ordering::Relaxed);
        self.control.notify();
    }

    /// Wake the thread for an immediate recalculation.
    pub fn recalc_now(&self) {
        self.control.notify();
    }

    /// Signal the thread to exit and join it.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.control.exit.store(true, Ordering::Release);
            self.control.notify();
            let _ = handle.join();
        }
    }
}

impl Drop for ComputeWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_worker_runs_job_repeatedly() {
        let count = Arc::new(AtomicUsize::new(0));
        let job_count = Arc::clone(&count);
        let mut worker = ComputeWorker::spawn("test-worker", 5, move || {
            job_count.fetch_add(1, Ordering::Relaxed);
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::Relaxed) < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        worker.stop();
        assert!(count.load(Ordering::Relaxed) >= 3);
    }

    #[test]
    fn test_recalc_now_wakes_immediately() {
        let count = Arc::new(AtomicUsize::new(0));
        let job_count = Arc::clone(&count);
        // Long interval so only explicit wakes advance the counter quickly
        let mut worker = ComputeWorker::spawn("test-worker-wake", 60_000, move || {
            job_count.fetch_add(1, Ordering::Relaxed);
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::Relaxed) < 1 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        let before = count.load(Ordering::Relaxed);
        worker.recalc_now();

        let deadline = Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::Relaxed) <= before && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(count.load(Ordering::Relaxed) > before);
        worker.stop();
    }

    #[test]
    fn test_stop_joins_thread() {
        let mut worker = ComputeWorker::spawn("test-worker-stop", 10, || {});
        worker.stop();
        // Second stop is a no-op
        worker.stop();
    }
}
