//! Software high-resolution timer.
//!
//! When the platform clock is too coarse, a dedicated worker thread
//! increments a shared counter in a tight loop and the measurement thread
//! samples it. The two threads deliberately share the counter without
//! synchronization beyond atomicity: the scheduling noise between them is
//! part of the harvested jitter. Relaxed atomics are the closest safe
//! equivalent of the traditional volatile-u64 race — writes become visible
//! eventually, and that is the entire contract.

use std::io;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Fields shared between the measurement loop and the counter worker.
pub(crate) struct CounterArea {
    /// Free-running counter standing in for a high-resolution clock.
    timer: AtomicU64,
    /// Set to 1 to ask the worker to exit.
    interrupt: AtomicU8,
}

/// Worker body: increment until interrupted. The loop must not yield, sleep,
/// or touch anything beyond the two shared fields.
fn counter_loop(area: Arc<CounterArea>) {
    while area.interrupt.load(Ordering::Relaxed) == 0 {
        area.timer.fetch_add(1, Ordering::Relaxed);
    }
}

/// Thread backend driving the counter worker.
///
/// The four operations mirror a classic init/fini/start/stop function table
/// so embedders can substitute their own threading runtime via
/// [`switch_timer_thread_impl`](crate::switch_timer_thread_impl), which must
/// happen before [`init`](crate::init).
pub trait TimerThread: Send + Sync {
    /// Prepare backend state.
    fn init(&self) -> io::Result<()> {
        Ok(())
    }

    /// Tear down backend state.
    fn fini(&self) {}

    /// Run `routine` on a dedicated thread until it returns. The worker is
    /// started and stopped around every read burst, so this is a hot path
    /// relative to typical thread-pool assumptions.
    fn start(&self, routine: Box<dyn FnOnce() + Send>) -> io::Result<()>;

    /// Wait for the thread started by the last `start` to exit.
    fn stop(&self);
}

/// Default backend on top of `std::thread`.
pub struct BuiltinTimerThread {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BuiltinTimerThread {
    pub fn new() -> Self {
        Self {
            handle: Mutex::new(None),
        }
    }
}

impl Default for BuiltinTimerThread {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerThread for BuiltinTimerThread {
    fn start(&self, routine: Box<dyn FnOnce() + Send>) -> io::Result<()> {
        let handle = std::thread::Builder::new()
            .name("cpujitter-timer".into())
            .spawn(routine)?;
        *self.handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Collector-side handle of the software timer.
///
/// Owns the worker lifecycle: the collector starts the worker before each
/// read burst and stops it afterwards. The worker only ever sees the shared
/// [`CounterArea`], never the collector.
pub struct NotimeTimer {
    area: Arc<CounterArea>,
    backend: Arc<dyn TimerThread>,
    /// Previous counter reading, to force one tick between samples.
    prev: u64,
    running: bool,
}

impl NotimeTimer {
    pub(crate) fn new(backend: Arc<dyn TimerThread>) -> io::Result<Self> {
        backend.init()?;
        Ok(Self {
            area: Arc::new(CounterArea {
                timer: AtomicU64::new(0),
                interrupt: AtomicU8::new(0),
            }),
            backend,
            prev: 0,
            running: false,
        })
    }

    /// Start the counter worker.
    pub(crate) fn settick(&mut self) -> io::Result<()> {
        if self.running {
            return Ok(());
        }
        self.area.interrupt.store(0, Ordering::Relaxed);
        self.area.timer.store(0, Ordering::Relaxed);
        self.prev = 0;
        let area = Arc::clone(&self.area);
        self.backend.start(Box::new(move || counter_loop(area)))?;
        self.running = true;
        Ok(())
    }

    /// Ask the worker to exit and join it. Best-effort by design.
    pub(crate) fn unsettick(&mut self) {
        if !self.running {
            return;
        }
        self.area.interrupt.store(1, Ordering::Relaxed);
        self.backend.stop();
        self.running = false;
    }

    /// Sample the counter, spinning until it moved past the last reading so
    /// two back-to-back samples never collide.
    pub(crate) fn now(&mut self) -> u64 {
        debug_assert!(self.running, "software timer sampled while stopped");
        loop {
            let t = self.area.timer.load(Ordering::Relaxed);
            if t != self.prev {
                self.prev = t;
                return t;
            }
            std::hint::spin_loop();
        }
    }
}

impl Drop for NotimeTimer {
    fn drop(&mut self) {
        self.unsettick();
        self.backend.fini();
    }
}
