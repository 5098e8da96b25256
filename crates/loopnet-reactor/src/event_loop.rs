//! `EventLoop` and `LoopHandle`.
//!
//! The loop owns its driver for the duration of `run()` and publishes it
//! to loop-thread callers through a thread-local context. `LoopHandle` is
//! the cross-thread face: cheap to clone, usable from any thread to test
//! loop identity, marshal tasks, or stop the loop.
//!
//! ```text
//!  FOREIGN THREAD                  LOOP THREAD
//!  ──────────────                  ───────────
//!  handle.spawn(task) ──queue──▶  task()            (next turn)
//!          └─eventfd─▶            poll() wakes
//!                                  driver.poll() ──▶ dispatch completions
//! ```

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::SegQueue;

use loopnet_core::{Completion, LoopError, Result, StreamDriver, Task, WriteInfo};

use crate::waker::EventFdWaker;

/// How long one driver poll may sleep when nothing is pending. Wakeups
/// cut this short; it only bounds stop-flag latency.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

/// State shared between the loop thread and foreign threads.
struct LoopShared {
    id: u64,
    tasks: SegQueue<Task>,
    waker: EventFdWaker,
    stop: AtomicBool,
}

/// Cross-thread handle to a loop. Clone freely; all clones address the
/// same loop.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

struct LoopCtx {
    id: u64,
    driver: Rc<RefCell<Box<dyn StreamDriver>>>,
}

thread_local! {
    static CURRENT: RefCell<Option<LoopCtx>> = const { RefCell::new(None) };
}

impl LoopHandle {
    /// True iff the calling thread is the one running this loop.
    pub fn is_loop_thread(&self) -> bool {
        let id = self.shared.id;
        CURRENT.with(|c| c.borrow().as_ref().is_some_and(|ctx| ctx.id == id))
    }

    /// Marshal a task onto the loop thread. Never blocks; returns once
    /// the task is queued, not once it executes. Tasks run in FIFO order
    /// relative to other tasks from the same submitter.
    pub fn spawn(&self, task: Task) {
        self.shared.tasks.push(task);
        if let Err(e) = self.shared.waker.notify() {
            log::warn!("loop {}: wake failed: {}", self.shared.id, e);
        }
    }

    /// Ask the loop to exit after its current turn.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        let _ = self.shared.waker.notify();
    }

    /// Run `f` against the loop's driver. Fails with `NotOnLoop` unless
    /// called on this loop's thread while it is running.
    ///
    /// Do not nest: `f` must not call `with_driver` again, and must not
    /// invoke user callbacks that might.
    pub fn with_driver<R>(&self, f: impl FnOnce(&mut dyn StreamDriver) -> R) -> Result<R> {
        let id = self.shared.id;
        let driver = CURRENT.with(|c| match c.borrow().as_ref() {
            Some(ctx) if ctx.id == id => Ok(ctx.driver.clone()),
            _ => Err(LoopError::NotOnLoop),
        })?;
        let mut driver = driver.borrow_mut();
        Ok(f(&mut **driver))
    }
}

/// A single-threaded reactor loop.
pub struct EventLoop {
    driver: Option<Box<dyn StreamDriver>>,
    shared: Arc<LoopShared>,
}

impl EventLoop {
    pub fn new(driver: Box<dyn StreamDriver>) -> Result<Self> {
        let shared = Arc::new(LoopShared {
            id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
            tasks: SegQueue::new(),
            waker: EventFdWaker::create()?,
            stop: AtomicBool::new(false),
        });
        Ok(Self {
            driver: Some(driver),
            shared,
        })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run until `LoopHandle::stop` is called. Consumes the driver; a
    /// loop runs once.
    pub fn run(&mut self) -> Result<()> {
        let mut driver = self.driver.take().ok_or(LoopError::NotRunning)?;
        driver.watch_wake(self.shared.waker.fd())?;

        let driver = Rc::new(RefCell::new(driver));
        let _ctx = CtxGuard::install(self.shared.id, driver.clone());

        log::debug!("loop {}: running", self.shared.id);

        let mut completions: Vec<Completion> = Vec::with_capacity(64);
        while !self.shared.stop.load(Ordering::Acquire) {
            while let Some(task) = self.shared.tasks.pop() {
                task();
            }
            if self.shared.stop.load(Ordering::Acquire) {
                break;
            }

            completions.clear();
            driver.borrow_mut().poll(&mut completions, Some(POLL_INTERVAL))?;

            // Callbacks run with the driver borrow released, so they may
            // submit follow-up writes, shutdowns, or closes.
            for completion in completions.drain(..) {
                dispatch(completion);
            }
        }

        log::debug!("loop {}: stopped", self.shared.id);
        Ok(())
    }
}

fn dispatch(completion: Completion) {
    match completion {
        Completion::Read { sink, buf, outcome } => sink.deliver(buf, outcome),
        Completion::WriteDone { buf, cb, status } => {
            if let Some(cb) = cb {
                cb(WriteInfo { buf, status });
            }
        }
        Completion::ShutdownDone { cb, status } => cb(status),
        Completion::CloseDone { cb } => cb(),
        Completion::Incoming { sink } => sink.incoming(),
    }
}

/// Installs the thread-local loop context and removes it on drop, so a
/// panicking loop does not leave a stale context behind.
struct CtxGuard;

impl CtxGuard {
    fn install(id: u64, driver: Rc<RefCell<Box<dyn StreamDriver>>>) -> Self {
        CURRENT.with(|c| {
            *c.borrow_mut() = Some(LoopCtx { id, driver });
        });
        Self
    }
}

impl Drop for CtxGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| {
            *c.borrow_mut() = None;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll_driver::PollDriver;
    use std::sync::mpsc;
    use std::thread;

    fn start_loop() -> (LoopHandle, thread::JoinHandle<()>) {
        let mut el = EventLoop::new(Box::new(PollDriver::new())).unwrap();
        let handle = el.handle();
        let join = thread::spawn(move || el.run().unwrap());
        (handle, join)
    }

    #[test]
    fn test_spawn_runs_on_loop_thread() {
        let (handle, join) = start_loop();
        let (tx, rx) = mpsc::channel();

        let probe = handle.clone();
        handle.spawn(Box::new(move || {
            tx.send((thread::current().id(), probe.is_loop_thread()))
                .unwrap();
        }));

        let (loop_tid, on_loop) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_ne!(loop_tid, thread::current().id());
        assert!(on_loop);
        assert!(!handle.is_loop_thread());

        handle.stop();
        join.join().unwrap();
    }

    #[test]
    fn test_spawn_order_is_fifo() {
        let (handle, join) = start_loop();
        let (tx, rx) = mpsc::channel();

        for i in 0..10 {
            let tx = tx.clone();
            handle.spawn(Box::new(move || {
                tx.send(i).unwrap();
            }));
        }
        for i in 0..10 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), i);
        }

        handle.stop();
        join.join().unwrap();
    }

    #[test]
    fn test_with_driver_off_loop_fails() {
        let (handle, join) = start_loop();
        let res = handle.with_driver(|_| ());
        assert_eq!(res.unwrap_err(), LoopError::NotOnLoop);
        handle.stop();
        join.join().unwrap();
    }

    #[test]
    fn test_with_driver_on_loop_succeeds() {
        let (handle, join) = start_loop();
        let (tx, rx) = mpsc::channel();

        let probe = handle.clone();
        handle.spawn(Box::new(move || {
            tx.send(probe.with_driver(|_| 7).unwrap()).unwrap();
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 7);

        handle.stop();
        join.join().unwrap();
    }

    #[test]
    fn test_stop_terminates_promptly() {
        let (handle, join) = start_loop();
        handle.stop();
        join.join().unwrap();
    }
}
