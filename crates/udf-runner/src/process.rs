use shared_child::SharedChild;
use std::os::fd::OwnedFd;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

/// Time allowed for a dropped worker to exit after SIGTERM.
const REAP_TIMEOUT: Duration = Duration::from_secs(15);

pub type WorkerStdio = tokio::fs::File;

/// WorkerProcess is a running function worker with piped stdio.
///
/// Dropping a WorkerProcess which hasn't exited sends it SIGTERM,
/// and it's reaped in the background.
pub struct WorkerProcess {
    inner: Arc<SharedChild>,

    pub stdin: Option<WorkerStdio>,
    pub stdout: Option<WorkerStdio>,
    pub stderr: Option<WorkerStdio>,
}

impl WorkerProcess {
    pub fn spawn(cmd: &mut Command) -> std::io::Result<Self> {
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = map_stdio(child.stdin.take());
        let stdout = map_stdio(child.stdout.take());
        let stderr = map_stdio(child.stderr.take());

        Ok(Self {
            inner: Arc::new(SharedChild::new(child)?),
            stdin,
            stdout,
            stderr,
        })
    }

    pub fn id(&self) -> u32 {
        self.inner.id()
    }

    /// Wait for the worker to exit. Must be called within a tokio runtime.
    pub fn wait(&self) -> impl std::future::Future<Output = std::io::Result<ExitStatus>> {
        let inner = self.inner.clone();
        let handle = tokio::task::spawn_blocking(move || inner.wait());

        async move {
            match handle.await {
                Ok(status) => status,
                Err(err) => Err(std::io::Error::new(std::io::ErrorKind::Other, err)),
            }
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if let Ok(Some(_status)) = self.inner.try_wait() {
            return; // Already exited.
        }
        let pid = self.id();

        {
            use shared_child::unix::SharedChildExt;

            // send_signal() returns Ok() if the worker has already been waited on.
            if let Err(error) = self.inner.send_signal(libc::SIGTERM) {
                tracing::error!(pid, ?error, "failed to deliver SIGTERM to function worker");
            }
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // Outside of a runtime, reap from a plain thread.
            let inner = self.inner.clone();
            std::thread::spawn(move || log_reaped(pid, inner.wait()));
            return;
        };
        let _guard = handle.enter();
        let wait = self.wait();

        handle.spawn(async move {
            tokio::select! {
                status = wait => log_reaped(pid, status),
                _ = tokio::time::sleep(REAP_TIMEOUT) => {
                    tracing::error!(pid, "dropped function worker is not exiting");
                }
            }
        });
    }
}

fn log_reaped(pid: u32, status: std::io::Result<ExitStatus>) {
    match status {
        Err(error) => {
            tracing::error!(pid, ?error, "failed to wait for dropped function worker");
        }
        Ok(status) if !status.success() => {
            tracing::debug!(pid, %status, "dropped function worker exited with an error");
        }
        Ok(_) => {
            tracing::debug!(pid, "dropped function worker exited cleanly");
        }
    }
}

fn map_stdio<F: Into<OwnedFd>>(f: Option<F>) -> Option<WorkerStdio> {
    f.map(|f| std::fs::File::from(f.into()).into())
}
