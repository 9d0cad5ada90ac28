use crate::{ResultSender, ShutdownPolicy};
use anyhow::Context;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// FunctionRunner owns the channel to a worker which evaluates the function.
///
/// Submission is asynchronous: `submit` hands a call to the runner and
/// returns without waiting for its evaluation. Results are pushed to the
/// ResultSender given to `open`, from whatever thread or task the runner
/// chooses, and always in the order their calls were submitted. A runner
/// whose transport may reorder results must resequence them before pushing.
pub trait FunctionRunner {
    /// Start the runner, which will deliver results to `results`.
    fn open(&mut self, results: ResultSender) -> anyhow::Result<()>;
    /// Submit an encoded call.
    fn submit(&mut self, call: Bytes) -> anyhow::Result<()>;
    /// Send any buffered calls to the worker, without awaiting their results.
    fn flush(&mut self) -> anyhow::Result<()>;
    /// Stop the runner. Under `Drain` the results of all submitted calls are
    /// pushed before `close` returns. Under `Abandon` they may never be.
    fn close(&mut self, policy: ShutdownPolicy) -> anyhow::Result<()>;
}

/// ThreadRunner evaluates a function over encoded calls on a dedicated thread.
/// It's useful for embedding native functions, and for tests.
pub struct ThreadRunner<F> {
    func: Option<F>,
    calls: Option<mpsc::UnboundedSender<Bytes>>,
    cancelled: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl<F> ThreadRunner<F>
where
    F: FnMut(&[u8]) -> anyhow::Result<Bytes> + Send + 'static,
{
    pub fn new(func: F) -> Self {
        Self {
            func: Some(func),
            calls: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    fn join(&mut self) -> anyhow::Result<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| anyhow::anyhow!("function thread panicked")),
            None => Ok(()),
        }
    }
}

impl<F> FunctionRunner for ThreadRunner<F>
where
    F: FnMut(&[u8]) -> anyhow::Result<Bytes> + Send + 'static,
{
    fn open(&mut self, results: ResultSender) -> anyhow::Result<()> {
        let mut func = self.func.take().context("ThreadRunner was already opened")?;
        let (calls_tx, mut calls_rx) = mpsc::unbounded_channel::<Bytes>();
        let cancelled = self.cancelled.clone();

        let thread = std::thread::Builder::new()
            .name("udf-thread-runner".to_string())
            .spawn(move || {
                while let Some(call) = calls_rx.blocking_recv() {
                    if cancelled.load(Ordering::Relaxed) {
                        break;
                    }
                    match func(&call) {
                        Ok(result) => {
                            if !results.push(result) {
                                break; // Receiver is gone.
                            }
                        }
                        Err(error) => {
                            results.fail(error.context("evaluating function"));
                            break;
                        }
                    }
                }
                tracing::debug!("function thread exiting");
            })
            .context("spawning function thread")?;

        self.calls = Some(calls_tx);
        self.thread = Some(thread);
        Ok(())
    }

    fn submit(&mut self, call: Bytes) -> anyhow::Result<()> {
        let calls = self.calls.as_ref().context("ThreadRunner is not open")?;

        calls
            .send(call)
            .map_err(|_| anyhow::anyhow!("function thread has exited"))
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        Ok(()) // Calls are never buffered.
    }

    fn close(&mut self, policy: ShutdownPolicy) -> anyhow::Result<()> {
        if policy == ShutdownPolicy::Abandon {
            self.cancelled.store(true, Ordering::Relaxed);
        }
        // Dropping the sender lets the thread exit once it has consumed every call.
        self.calls.take();
        self.join()
    }
}

impl<F> Drop for ThreadRunner<F> {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.calls.take();
    }
}
