//! Blocking-work offload for hola.
//!
//! Resource drivers spend most of their time in syscalls, subprocesses,
//! and network I/O. This crate runs exactly one such blocking closure on
//! a worker thread while the calling thread stays free to tick a spinner
//! or flush logs. The caller owns the result; dropping the handle lets
//! the worker run to completion with its result discarded.
//!
//! # Example
//!
//! ```
//! use hola_task::Task;
//!
//! let task = Task::spawn(21, |n| n * 2);
//! let value = task.wait().expect("worker finished");
//! assert_eq!(value, 42);
//! ```

use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::Duration;

use thiserror::Error;

/// How often `wait_with` wakes up to run the caller's tick closure.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Worker-side failure surfaced to the caller.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The worker thread panicked before producing a value.
    #[error("worker thread panicked: {0}")]
    Panicked(String),
}

/// Result of a non-blocking completion check.
#[derive(Debug)]
pub enum TaskPoll<R> {
    /// Worker still running.
    Pending,
    /// Worker finished and delivered its value.
    Ready(R),
    /// Worker died without delivering (panic).
    Failed(TaskError),
}

/// Handle to a single offloaded closure.
///
/// The value produced by the closure lives in the channel until the
/// caller collects it, so it always outlives the worker thread.
#[derive(Debug)]
pub struct Task<R> {
    rx: mpsc::Receiver<R>,
    worker: Option<thread::JoinHandle<()>>,
}

impl<R: Send + 'static> Task<R> {
    /// Run `f(ctx)` on a new worker thread.
    ///
    /// The context is moved into the worker; the closure's return value
    /// is handed back through `poll`, `wait`, or `wait_with`.
    pub fn spawn<C, F>(ctx: C, f: F) -> Self
    where
        C: Send + 'static,
        F: FnOnce(C) -> R + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let worker = thread::Builder::new()
            .name("hola-task".to_string())
            .spawn(move || {
                let value = f(ctx);
                // A failed send means the caller dropped the handle;
                // cancellation is cooperative, so just discard.
                let _ = tx.send(value);
            })
            .expect("failed to spawn worker thread");

        Self {
            rx,
            worker: Some(worker),
        }
    }

    /// Non-blocking completion check.
    pub fn poll(&mut self) -> TaskPoll<R> {
        match self.rx.try_recv() {
            Ok(value) => TaskPoll::Ready(value),
            Err(TryRecvError::Empty) => TaskPoll::Pending,
            Err(TryRecvError::Disconnected) => TaskPoll::Failed(self.collect_panic()),
        }
    }

    /// Block until the worker finishes and return its value.
    pub fn wait(self) -> Result<R, TaskError> {
        self.wait_with(|| {}, DEFAULT_TICK_INTERVAL)
    }

    /// Block until the worker finishes, invoking `tick` roughly every
    /// `interval` so the caller can drive a progress indicator.
    pub fn wait_with<T>(mut self, mut tick: T, interval: Duration) -> Result<R, TaskError>
    where
        T: FnMut(),
    {
        loop {
            match self.rx.recv_timeout(interval) {
                Ok(value) => {
                    if let Some(worker) = self.worker.take() {
                        let _ = worker.join();
                    }
                    return Ok(value);
                }
                Err(RecvTimeoutError::Timeout) => tick(),
                Err(RecvTimeoutError::Disconnected) => return Err(self.collect_panic()),
            }
        }
    }

    fn collect_panic(&mut self) -> TaskError {
        let message = match self.worker.take().map(|w| w.join()) {
            Some(Err(payload)) => {
                if let Some(s) = payload.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic payload".to_string()
                }
            }
            _ => "worker exited without a value".to_string(),
        };
        TaskError::Panicked(message)
    }
}

// Dropping the handle detaches the worker: it runs to completion and
// its result is discarded when the channel closes.
impl<R> Drop for Task<R> {
    fn drop(&mut self) {
        drop(self.worker.take());
    }
}

/// Run `f(ctx)` on a worker thread and block for the result.
///
/// Shorthand for `Task::spawn(ctx, f).wait()` for callers without a
/// progress indicator to drive.
pub fn execute_with_context<C, R, F>(ctx: C, f: F) -> Result<R, TaskError>
where
    C: Send + 'static,
    R: Send + 'static,
    F: FnOnce(C) -> R + Send + 'static,
{
    Task::spawn(ctx, f).wait()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn delivers_closure_result() {
        let task = Task::spawn("ctx".to_string(), |s| format!("{s}!"));
        assert_eq!(task.wait().expect("wait"), "ctx!");
    }

    #[test]
    fn execute_with_context_roundtrip() {
        let value = execute_with_context(40, |n| n + 2).expect("execute");
        assert_eq!(value, 42);
    }

    #[test]
    fn poll_transitions_to_ready() {
        let mut task = Task::spawn((), |()| {
            thread::sleep(Duration::from_millis(50));
            7
        });

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            match task.poll() {
                TaskPoll::Ready(v) => {
                    assert_eq!(v, 7);
                    break;
                }
                TaskPoll::Pending => {
                    assert!(std::time::Instant::now() < deadline, "worker never finished");
                    thread::sleep(Duration::from_millis(5));
                }
                TaskPoll::Failed(err) => panic!("unexpected failure: {err}"),
            }
        }
    }

    #[test]
    fn tick_runs_while_worker_blocks() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let seen = ticks.clone();

        let task = Task::spawn((), |()| {
            thread::sleep(Duration::from_millis(120));
        });
        task.wait_with(|| {
            seen.fetch_add(1, Ordering::SeqCst);
        }, Duration::from_millis(10))
            .expect("wait");

        assert!(ticks.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn panic_surfaces_as_error() {
        let task: Task<()> = Task::spawn((), |()| panic!("driver exploded"));
        match task.wait() {
            Err(TaskError::Panicked(msg)) => assert!(msg.contains("driver exploded")),
            other => panic!("expected panic error, got {other:?}"),
        }
    }

    #[test]
    fn dropped_handle_lets_worker_finish() {
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();

        let task = Task::spawn((), move |()| {
            thread::sleep(Duration::from_millis(30));
            flag.fetch_add(1, Ordering::SeqCst);
        });
        drop(task);

        thread::sleep(Duration::from_millis(200));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
