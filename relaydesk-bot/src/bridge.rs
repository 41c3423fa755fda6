//! Event-loop bridge.
//!
//! The bot owns one dedicated thread running a single-threaded tokio runtime
//! ([`EventLoop`]). Every platform operation runs there. Web handlers are
//! synchronous from the bridge's point of view: they hand a future to the
//! loop with [`run_on_loop`] and block on a channel until the result arrives
//! or the timeout elapses.
//!
//! A timed-out operation is NOT cancelled. It keeps running on the loop and
//! its result is dropped with the channel.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::LoginError;

/// Cloneable reference to a running [`EventLoop`].
#[derive(Clone, Debug)]
pub struct LoopHandle {
    rt: Handle,
    thread: ThreadId,
    alive: Arc<AtomicBool>,
    name: Arc<str>,
}

impl LoopHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// False once the loop thread has stopped driving tasks.
    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Whether the caller is the loop thread itself.
    pub fn is_current_thread(&self) -> bool {
        std::thread::current().id() == self.thread
    }

    /// Spawn a long-lived task on the loop. Returns `None` if it has stopped.
    pub fn spawn<F>(&self, fut: F) -> Option<AbortHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.is_running() {
            return None;
        }
        Some(self.rt.spawn(fut).abort_handle())
    }
}

/// The bot's background thread and its runtime.
pub struct EventLoop {
    handle: LoopHandle,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoop {
    /// Start the loop thread. The runtime is built before the thread starts so
    /// a failure surfaces here instead of inside the thread.
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = rt.handle().clone();
        let alive = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let thread_alive = Arc::clone(&alive);
        let thread_name = name.to_string();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                tracing::info!(event_loop = %thread_name, "bot event loop started");
                rt.block_on(async {
                    let _ = stop_rx.await;
                });
                thread_alive.store(false, Ordering::Release);
                // Dropping the runtime cancels whatever is still scheduled.
                drop(rt);
                tracing::info!(event_loop = %thread_name, "bot event loop stopped");
            })?;

        let handle = LoopHandle {
            rt: handle,
            thread: thread.thread().id(),
            alive,
            name: Arc::from(name),
        };
        Ok(Self {
            handle,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Stop the loop and join its thread. Blocks; call from a plain thread
    /// (or `spawn_blocking`), never from an async task.
    pub fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if self.handle.is_current_thread() {
                // Joining ourselves would deadlock; the stop signal is enough.
                return;
            }
            if thread.join().is_err() {
                tracing::error!(event_loop = %self.handle.name, "bot event loop thread panicked");
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run `op` on `target` and wait for its result for at most `timeout`.
///
/// - Running loop, other thread: scheduled on the loop; the caller blocks.
///   On timeout returns [`LoginError::Timeout`] and the operation continues
///   on the loop with its result discarded.
/// - Called from the loop thread: [`LoginError::Bridge`] (waiting would
///   deadlock the loop).
/// - No loop, or the loop has stopped: `op` runs to completion on a private
///   current-thread runtime on the calling thread, without a timeout.
///
/// Must not be called from inside an async task; web handlers go through
/// `spawn_blocking`.
pub fn run_on_loop<F, T>(
    target: Option<&LoopHandle>,
    op: F,
    timeout: Duration,
) -> Result<T, LoginError>
where
    F: Future<Output = Result<T, LoginError>> + Send + 'static,
    T: Send + 'static,
{
    let Some(lp) = target.filter(|lp| lp.is_running()) else {
        return run_detached(op);
    };
    if lp.is_current_thread() {
        return Err(LoginError::Bridge(format!(
            "blocking call issued from the '{}' loop thread",
            lp.name
        )));
    }

    // Use spawn + channel to avoid block_on from a foreign thread
    let (tx, rx) = std::sync::mpsc::sync_channel(1);
    lp.rt.spawn(async move {
        let _ = tx.send(op.await);
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            tracing::warn!(
                event_loop = %lp.name,
                timeout_secs = timeout.as_secs_f64(),
                "bridged operation timed out; it keeps running on the loop"
            );
            Err(LoginError::Timeout(timeout))
        }
        Err(RecvTimeoutError::Disconnected) => Err(LoginError::Bridge(format!(
            "'{}' loop stopped before the operation completed",
            lp.name
        ))),
    }
}

fn run_detached<F, T>(op: F) -> Result<T, LoginError>
where
    F: Future<Output = Result<T, LoginError>>,
{
    tracing::debug!("no bot event loop running; using a temporary runtime");
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| LoginError::Bridge(format!("could not start a temporary runtime: {e}")))?;
    rt.block_on(op)
}

/// Fire-and-forget variant of [`run_on_loop`], for best-effort teardown.
///
/// Without a running loop the operation goes to the ambient runtime if there
/// is one, otherwise it runs to completion on the calling thread.
pub fn dispatch<F>(target: Option<&LoopHandle>, op: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Some(lp) = target.filter(|lp| lp.is_running()) {
        lp.rt.spawn(op);
        return;
    }
    if let Ok(rt) = Handle::try_current() {
        rt.spawn(op);
        return;
    }
    match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt.block_on(op),
        Err(e) => tracing::warn!(error = %e, "dropping dispatched operation: no runtime"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn runs_on_the_loop_thread() {
        let lp = EventLoop::spawn("bridge-test").unwrap();
        let name = run_on_loop(
            Some(&lp.handle()),
            async { Ok(std::thread::current().name().map(str::to_string)) },
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(name.as_deref(), Some("bridge-test"));
    }

    #[test]
    fn errors_propagate() {
        let lp = EventLoop::spawn("bridge-err").unwrap();
        let r: Result<(), _> = run_on_loop(
            Some(&lp.handle()),
            async { Err(LoginError::InvalidCode) },
            Duration::from_secs(5),
        );
        assert_eq!(r, Err(LoginError::InvalidCode));
    }

    #[test]
    fn timeout_is_bounded_and_not_cancelling() {
        let lp = EventLoop::spawn("bridge-timeout").unwrap();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);

        let started = Instant::now();
        let r: Result<(), _> = run_on_loop(
            Some(&lp.handle()),
            async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            },
            Duration::from_millis(50),
        );
        assert_eq!(r, Err(LoginError::Timeout(Duration::from_millis(50))));
        assert!(started.elapsed() < Duration::from_millis(250));

        // The abandoned operation still runs to completion.
        std::thread::sleep(Duration::from_millis(600));
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn falls_back_without_a_loop() {
        let v = run_on_loop(None, async { Ok(42) }, Duration::from_millis(1)).unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn stopped_loop_falls_back() {
        let mut lp = EventLoop::spawn("bridge-stopped").unwrap();
        let handle = lp.handle();
        lp.shutdown();
        assert!(!handle.is_running());
        assert!(handle.spawn(async {}).is_none());
        // Sleeps longer than the timeout: the fallback path has none.
        let v = run_on_loop(
            Some(&handle),
            async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok("done")
            },
            Duration::from_millis(1),
        )
        .unwrap();
        assert_eq!(v, "done");
    }

    #[test]
    fn rejects_calls_from_the_loop_thread() {
        let lp = EventLoop::spawn("bridge-reentrant").unwrap();
        let inner = lp.handle();
        let nested = run_on_loop(
            Some(&lp.handle()),
            async move {
                Ok(run_on_loop(
                    Some(&inner),
                    async { Ok::<_, LoginError>(1) },
                    Duration::from_secs(1),
                ))
            },
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(matches!(nested, Err(LoginError::Bridge(_))));
    }

    #[test]
    fn dispatch_runs_on_the_loop() {
        let lp = EventLoop::spawn("bridge-dispatch").unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        dispatch(Some(&lp.handle()), async move {
            let _ = tx.send(std::thread::current().name().map(str::to_string));
        });
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("bridge-dispatch"));
    }

    #[test]
    fn dispatch_without_loop_completes_inline() {
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        dispatch(None, async move {
            flag.store(true, Ordering::SeqCst);
        });
        assert!(done.load(Ordering::SeqCst));
    }
}
