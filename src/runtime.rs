#![forbid(unsafe_code)]

// Background I/O loop and the sync/async bridge. One cooperative
// current-thread event loop per process, hosted on a dedicated thread;
// synchronously scheduled callers hand work to it through `submit` and
// block for a bounded time on the result.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The unit of work did not complete within the bounded wait.
    #[error("unit of work did not complete within the bounded wait")]
    Timeout,
    /// The loop thread is gone; nothing will ever resolve the hand-off.
    #[error("event loop is not running")]
    RuntimeUnavailable,
}

/// The process-wide I/O loop.
///
/// Built once at startup and passed to every component that needs it; shut
/// down explicitly at process exit. All network I/O for bridged sessions
/// runs as tasks on this loop, so no two completion callbacks ever execute
/// concurrently even though submission comes from many threads.
pub struct IoRuntime {
    handle: Handle,
    alive: AtomicBool,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl IoRuntime {
    /// Start the loop on a dedicated background thread.
    pub fn start() -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name("mqtt-swarm-io".to_string())
            .spawn(move || {
                // Spawned connection tasks run on this thread while the
                // loop waits for the shutdown signal.
                let _ = runtime.block_on(shutdown_rx);
                debug!("io loop stopping");
            })?;

        Ok(Self {
            handle,
            alive: AtomicBool::new(true),
            shutdown: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Handle for spawning follow-up work from tasks already on the loop.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Schedule a unit of work onto the loop and block until it completes
    /// or `wait` elapses.
    ///
    /// Many callers may submit concurrently; the loop interleaves their
    /// work cooperatively. If the loop thread has died, the task (and with
    /// it the sender) is dropped and the caller gets `RuntimeUnavailable`
    /// instead of blocking forever.
    pub fn submit<T, F>(&self, work: F, wait: Duration) -> Result<T, BridgeError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if !self.alive.load(Ordering::Acquire) {
            return Err(BridgeError::RuntimeUnavailable);
        }

        let (tx, rx) = mpsc::sync_channel(1);
        self.handle.spawn(async move {
            let _ = tx.send(work.await);
        });

        match rx.recv_timeout(wait) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => Err(BridgeError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(BridgeError::RuntimeUnavailable),
        }
    }

    /// Stop the loop and join its thread. Idempotent.
    pub fn shutdown(&self) {
        self.alive.store(false, Ordering::Release);

        let sender = self.shutdown.lock().expect("shutdown sender poisoned").take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }

        let thread = self.thread.lock().expect("loop thread handle poisoned").take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                warn!("io loop thread panicked during shutdown");
            }
        }
    }
}

impl Drop for IoRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn submit_returns_the_work_result() {
        let rt = IoRuntime::start().unwrap();
        let value = rt
            .submit(async { 6 * 7 }, Duration::from_secs(1))
            .unwrap();
        assert_eq!(value, 42);
        rt.shutdown();
    }

    #[test]
    fn submit_times_out_within_the_bounded_wait() {
        let rt = IoRuntime::start().unwrap();
        let started = Instant::now();
        let result: Result<(), _> =
            rt.submit(std::future::pending(), Duration::from_millis(100));
        assert_eq!(result.unwrap_err(), BridgeError::Timeout);
        assert!(started.elapsed() < Duration::from_secs(2));
        rt.shutdown();
    }

    #[test]
    fn submit_after_shutdown_reports_runtime_unavailable() {
        let rt = IoRuntime::start().unwrap();
        rt.shutdown();
        let result = rt.submit(async { 1 }, Duration::from_secs(1));
        assert_eq!(result.unwrap_err(), BridgeError::RuntimeUnavailable);
    }

    #[test]
    fn concurrent_submissions_interleave_on_one_loop() {
        let rt = std::sync::Arc::new(IoRuntime::start().unwrap());
        let mut handles = Vec::new();
        for i in 0..16u64 {
            let rt = rt.clone();
            handles.push(thread::spawn(move || {
                rt.submit(
                    async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        i * 2
                    },
                    Duration::from_secs(5),
                )
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().unwrap().unwrap(), i as u64 * 2);
        }
        rt.shutdown();
    }
}
