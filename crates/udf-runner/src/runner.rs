use crate::frame::{encode_frame, FrameDecoder};
use crate::{Resequencer, WorkerConfig, WorkerProcess};
use anyhow::Context;
use bytes::{Bytes, BytesMut};
use scalar_udf::{FunctionRunner, ResultSender, ShutdownPolicy};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

// Initial capacity of the bundle buffer.
const BUFFER_RESERVE: usize = 16 * 1024;

#[derive(Debug)]
enum Command {
    Call(Bytes),
    Flush,
}

/// ProcessRunner evaluates calls in a worker subprocess, exchanging
/// length-prefixed frames over the worker's stdin and stdout.
///
/// Calls are written in bundles: a bundle is written once `max_bundle_size`
/// calls accumulate, once its oldest call has waited `max_bundle_time`,
/// or upon `flush`. Worker stderr is logged.
///
/// The worker is serviced by a dedicated tokio runtime, so that a host
/// thread may block on results without starving it.
pub struct ProcessRunner {
    config: WorkerConfig,
    runtime: Option<tokio::runtime::Runtime>,
    commands: Option<mpsc::UnboundedSender<Command>>,
    service: Option<tokio::task::JoinHandle<anyhow::Result<()>>>,
}

impl ProcessRunner {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            runtime: None,
            commands: None,
            service: None,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    fn send(&self, command: Command) -> anyhow::Result<()> {
        let commands = self
            .commands
            .as_ref()
            .context("ProcessRunner is not open")?;

        commands
            .send(command)
            .map_err(|_| anyhow::anyhow!("function worker has exited"))
    }

    // Stop servicing the worker and tear down the runtime.
    fn shutdown(&mut self) {
        self.commands = None;
        if let Some(service) = self.service.take() {
            service.abort();
        }
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        let timeout = self.config.close_timeout;

        // Blocking tasks (including the reaping of a dropped worker) are given
        // `timeout` to complete. If we're within another runtime we must not
        // block its thread.
        if let Ok(parent) = tokio::runtime::Handle::try_current() {
            parent.spawn_blocking(move || runtime.shutdown_timeout(timeout));
        } else {
            runtime.shutdown_timeout(timeout)
        }
    }
}

impl FunctionRunner for ProcessRunner {
    fn open(&mut self, results: ResultSender) -> anyhow::Result<()> {
        anyhow::ensure!(self.runtime.is_none(), "ProcessRunner was already opened");
        self.config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .thread_name("udf-runner")
            .build()
            .context("building function runner runtime")?;

        let (program, args) = self
            .config
            .command
            .split_first()
            .context("worker command is empty")?;

        let mut cmd = std::process::Command::new(program);
        cmd.args(args).envs(&self.config.env);

        let worker = {
            let _guard = runtime.enter();
            WorkerProcess::spawn(&mut cmd)
                .with_context(|| format!("starting function worker {:?}", self.config.command))?
        };
        tracing::debug!(
            pid = worker.id(),
            command = ?self.config.command,
            framing = ?self.config.framing,
            "started function worker"
        );

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let service = runtime.spawn(serve(worker, self.config.clone(), commands_rx, results));

        self.runtime = Some(runtime);
        self.commands = Some(commands_tx);
        self.service = Some(service);

        Ok(())
    }

    fn submit(&mut self, call: Bytes) -> anyhow::Result<()> {
        self.send(Command::Call(call))
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.send(Command::Flush)
    }

    fn close(&mut self, policy: ShutdownPolicy) -> anyhow::Result<()> {
        let Some(service) = self.service.take() else {
            self.shutdown();
            return Ok(());
        };
        let runtime = self
            .runtime
            .as_ref()
            .expect("runtime is running while the worker is serviced");

        let result = match policy {
            ShutdownPolicy::Drain => {
                // Dropping our sender writes the final bundle and closes worker stdin.
                self.commands = None;
                let timeout = self.config.close_timeout;

                // The timer must be created within the runtime.
                let finished =
                    runtime.block_on(async { tokio::time::timeout(timeout, service).await });

                match finished {
                    Ok(Ok(result)) => result,
                    Ok(Err(err)) => {
                        Err(anyhow::Error::new(err).context("function worker service failed"))
                    }
                    Err(_) => Err(anyhow::anyhow!(
                        "function worker did not finish within {timeout:?}"
                    )),
                }
            }
            ShutdownPolicy::Abandon => {
                service.abort();
                // Await the abort, so that the worker is signaled before the runtime stops.
                _ = runtime.block_on(service);
                Ok(())
            }
        };

        self.shutdown();
        result
    }
}

impl Drop for ProcessRunner {
    fn drop(&mut self) {
        self.shutdown()
    }
}

/// Service the worker by writing calls to its stdin, reading results from
/// its stdout, logging its stderr, and awaiting its exit.
/// Its first error is reported through `results` and also returned.
async fn serve(
    mut worker: WorkerProcess,
    config: WorkerConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    results: ResultSender,
) -> anyhow::Result<()> {
    let pid = worker.id();
    let stdin = worker.stdin.take().expect("worker stdin is a pipe");
    let stdout = worker.stdout.take().expect("worker stdout is a pipe");
    let stderr = worker.stderr.take().expect("worker stderr is a pipe");

    // Submission times of calls, in submission order.
    let (submitted_tx, submitted_rx) = mpsc::unbounded_channel();

    let write = write_calls(stdin, &config, commands, submitted_tx);
    let read = read_results(stdout, &config, submitted_rx, &results);

    let exit = async {
        let (status, ()) = tokio::join!(worker.wait(), forward_stderr(stderr, pid));
        let status = status.context("failed to wait for function worker")?;

        if !status.success() {
            anyhow::bail!("function worker exited with {status}");
        }
        tracing::debug!(pid, %status, "function worker exited");
        Ok::<(), anyhow::Error>(())
    };
    let work = async { tokio::try_join!(read, exit).map(|((), ())| ()) };

    tokio::pin!(write, work);

    // The worker is done once its output is read and it has exited,
    // even if we have more calls to write.
    let outcome = tokio::select! {
        outcome = &mut work => outcome,
        written = &mut write => match written {
            Ok(()) => work.await,
            Err(err) => Err(err),
        },
    };

    if let Err(err) = &outcome {
        tracing::error!(pid, error = ?err, "function worker failed");
        results.fail(anyhow::anyhow!("{err:#}"));
    }
    outcome
}

/// Write calls to the worker in bundles.
///
/// The worker _should_ but is not obligated to consume its input,
/// so an I/O error is logged but is not considered an error.
/// A worker which stops reading will fail to return results.
async fn write_calls<W>(
    mut stdin: W,
    config: &WorkerConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    submitted: mpsc::UnboundedSender<Instant>,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(BUFFER_RESERVE);
    let mut bundled = 0;
    let mut seq = 0u64;
    let mut bundle_deadline: Option<Instant> = None;

    loop {
        let command = tokio::select! {
            command = commands.recv() => command,
            () = deadline_elapsed(bundle_deadline) => Some(Command::Flush),
        };

        match command {
            Some(Command::Call(call)) => {
                encode_frame(config.framing, seq, &call, &mut buf)?;
                seq += 1;
                bundled += 1;

                // The reader must learn of this call before its result can arrive.
                _ = submitted.send(Instant::now());
                bundle_deadline.get_or_insert_with(|| Instant::now() + config.max_bundle_time);

                if bundled < config.max_bundle_size {
                    continue;
                }
            }
            Some(Command::Flush) => (),
            None => {
                write_bundle(&mut stdin, &mut buf, bundled).await;
                tracing::debug!(calls = seq, "finished writing calls to function worker");
                return Ok(()); // Dropping `stdin` forwards EOF to the worker.
            }
        }

        write_bundle(&mut stdin, &mut buf, bundled).await;
        bundled = 0;
        bundle_deadline = None;
    }
}

async fn write_bundle<W>(stdin: &mut W, buf: &mut BytesMut, calls: usize)
where
    W: AsyncWrite + Unpin,
{
    if buf.is_empty() {
        return;
    }
    tracing::trace!(calls, bytes = buf.len(), "writing bundle to function worker");

    let written = async {
        stdin.write_all(buf).await?;
        stdin.flush().await
    };
    if let Err(error) = written.await {
        tracing::warn!(%error, "i/o error writing to function worker stdin");
    }
    buf.clear();
}

// Calls whose results are awaited, tracked by their submission time.
struct Outstanding {
    submitted: mpsc::UnboundedReceiver<Instant>,
    calls: VecDeque<Instant>,
    delivered: u64,
}

impl Outstanding {
    fn sync(&mut self) {
        while let Ok(at) = self.submitted.try_recv() {
            self.calls.push_back(at);
        }
    }

    fn deadline(&self, timeout: Option<Duration>) -> Option<Instant> {
        Some(*self.calls.front()? + timeout?)
    }

    fn deliver(&mut self, body: Bytes, results: &ResultSender) -> anyhow::Result<()> {
        self.sync();

        if self.calls.pop_front().is_none() {
            anyhow::bail!(
                "function worker returned result #{} with no call outstanding",
                self.delivered
            );
        }
        self.delivered += 1;

        // The operator may have closed its receiver while abandoning.
        _ = results.push(body);
        Ok(())
    }
}

/// Read result frames from the worker, and push them in submission order.
async fn read_results<R>(
    mut stdout: R,
    config: &WorkerConfig,
    submitted: mpsc::UnboundedReceiver<Instant>,
    results: &ResultSender,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new(config.framing);
    let mut resequencer = Resequencer::default();
    let mut outstanding = Outstanding {
        submitted,
        calls: VecDeque::new(),
        delivered: 0,
    };

    loop {
        while let Some(frame) = decoder.next_frame()? {
            match frame.seq {
                None => outstanding.deliver(frame.body, results)?,
                Some(seq) => {
                    resequencer.insert(seq, frame.body)?;

                    while let Some(body) = resequencer.pop() {
                        outstanding.deliver(body, results)?;
                    }
                }
            }
        }

        outstanding.sync();
        let deadline = outstanding.deadline(config.call_timeout);

        tokio::select! {
            read = stdout.read_buf(decoder.buffer_mut()) => {
                if read.context("failed to read function worker output")? == 0 {
                    break; // EOF.
                }
            }
            Some(at) = outstanding.submitted.recv() => outstanding.calls.push_back(at),
            () = deadline_elapsed(deadline) => {
                anyhow::bail!(
                    "no result for call #{} within {:?}",
                    outstanding.delivered,
                    config.call_timeout.unwrap_or_default(),
                );
            }
        }
    }

    decoder.finish()?;
    outstanding.sync();

    anyhow::ensure!(
        resequencer.parked() == 0,
        "function worker closed its output with {} results out of sequence",
        resequencer.parked(),
    );
    anyhow::ensure!(
        outstanding.calls.is_empty(),
        "function worker closed its output with {} calls awaiting results",
        outstanding.calls.len(),
    );
    tracing::debug!(
        results = outstanding.delivered,
        "finished reading function worker output"
    );

    Ok(())
}

/// Log each line of worker stderr.
async fn forward_stderr<R>(stderr: R, pid: u32)
where
    R: AsyncRead + Unpin,
{
    let mut lines = tokio::io::BufReader::new(stderr).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::warn!(pid, "function worker: {line}"),
            Ok(None) => break, // Clean EOF.
            Err(error) => {
                tracing::error!(pid, %error, "failed to read function worker stderr");
                break;
            }
        }
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Framing;
    use pretty_assertions::assert_eq;
    use scalar_udf::{
        result_channel, Field, LogicalType, Operator, OperatorConfig, Row, RowKind, Schema, Value,
    };

    fn sh(script: &str) -> WorkerConfig {
        WorkerConfig::new(["sh", "-c", script])
    }

    // `cat` echoes each call back as its result, so the function is the
    // identity over its single string argument.
    fn echo_config(max_in_flight: usize) -> OperatorConfig {
        OperatorConfig {
            max_in_flight,
            input_field_offsets: vec![1],
            forwarded_field_offsets: vec![0],
            input_schema: Schema::new(vec![
                Field::new("id", LogicalType::BigInt).not_null(),
                Field::new("name", LogicalType::String),
            ]),
            output_schema: Schema::new(vec![Field::new("echo", LogicalType::String)]),
            on_shutdown: ShutdownPolicy::Drain,
        }
    }

    #[test]
    fn test_cat_worker_through_operator() {
        for framing in [Framing::Ordered, Framing::Sequenced] {
            let mut worker = WorkerConfig::new(["cat"]);
            worker.framing = framing;
            worker.max_bundle_size = 7;

            let mut op = Operator::new(echo_config(16), ProcessRunner::new(worker)).unwrap();
            let mut out = Vec::new();
            let mut expect = Vec::new();

            for id in 0..200i64 {
                let name = if id % 5 == 0 {
                    Value::Null
                } else {
                    Value::String(format!("record-{id}"))
                };
                op.on_record(
                    Row::new(RowKind::UpdateAfter, vec![Value::BigInt(id), name.clone()]),
                    &mut out,
                )
                .unwrap();
                expect.push(Row::new(RowKind::UpdateAfter, vec![Value::BigInt(id), name]));
            }
            let stats = op.close(&mut out).unwrap();

            assert_eq!(out, expect);
            assert_eq!(stats.records_out, 200);
            assert_eq!(stats.call_bytes, stats.result_bytes);
        }
    }

    #[test]
    fn test_bundle_timer_writes_partial_bundles() {
        let mut worker = WorkerConfig::new(["cat"]);
        worker.max_bundle_time = Duration::from_millis(20);

        let mut runner = ProcessRunner::new(worker);
        let (tx, mut rx) = result_channel();
        runner.open(tx).unwrap();

        // No flush: the bundle is written once its timer elapses.
        runner.submit(Bytes::from_static(b"one")).unwrap();
        runner.submit(Bytes::from_static(b"two")).unwrap();

        assert_eq!(rx.wait().unwrap().unwrap(), "one");
        assert_eq!(rx.wait().unwrap().unwrap(), "two");

        runner.close(ShutdownPolicy::Drain).unwrap();
        assert!(rx.wait().unwrap().is_none());
    }

    #[test]
    fn test_drain_close_writes_final_bundle_and_delivers_all_results() {
        let mut runner = ProcessRunner::new(WorkerConfig::new(["cat"]));
        let (tx, mut rx) = result_channel();
        runner.open(tx).unwrap();

        // Calls remain in a partial bundle until close.
        for call in ["one", "two", "three"] {
            runner.submit(Bytes::from_static(call.as_bytes())).unwrap();
        }
        runner.close(ShutdownPolicy::Drain).unwrap();

        let mut results = Vec::new();
        while let Some(result) = rx.wait().unwrap() {
            results.push(result);
        }
        assert_eq!(results, vec!["one", "two", "three"]);

        // Closing again is a no-op.
        runner.close(ShutdownPolicy::Drain).unwrap();
    }

    #[test]
    fn test_drain_close_timeout() {
        let mut worker = sh("cat >/dev/null; exec sleep 21600");
        worker.close_timeout = Duration::from_millis(200);

        let mut runner = ProcessRunner::new(worker);
        let (tx, _rx) = result_channel();
        runner.open(tx).unwrap();

        let started = std::time::Instant::now();
        insta::assert_snapshot!(
            runner.close(ShutdownPolicy::Drain).unwrap_err(),
            @"function worker did not finish within 200ms"
        );
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_call_timeout() {
        let mut worker = sh("cat >/dev/null");
        worker.call_timeout = Some(Duration::from_millis(100));

        let mut runner = ProcessRunner::new(worker);
        let (tx, mut rx) = result_channel();
        runner.open(tx).unwrap();

        runner.submit(Bytes::from_static(b"call")).unwrap();
        runner.flush().unwrap();

        insta::assert_snapshot!(
            rx.wait().unwrap_err(),
            @"function runner failed: no result for call #0 within 100ms"
        );
        runner.close(ShutdownPolicy::Abandon).unwrap();
    }

    #[test]
    fn test_worker_failures() {
        let cases = [
            sh("exit 3"),
            sh("printf abc"),
            sh(r"printf '\001\000\000\000x'"),
            sh("echo 'something went wrong' >&2; exit 1"),
        ];
        let mut errors = Vec::new();

        for worker in cases {
            let mut runner = ProcessRunner::new(worker);
            let (tx, mut rx) = result_channel();
            runner.open(tx).unwrap();

            errors.push(rx.wait().unwrap_err().to_string());
            runner.close(ShutdownPolicy::Abandon).unwrap();
        }

        insta::assert_debug_snapshot!(errors, @r###"
        [
            "function runner failed: function worker exited with exit status: 3",
            "function runner failed: function worker wrote a partial frame of 3 bytes and then closed its output",
            "function runner failed: function worker returned result #0 with no call outstanding",
            "function runner failed: function worker exited with exit status: 1",
        ]
        "###);
    }

    #[test]
    fn test_worker_exits_with_calls_outstanding() {
        // Reads one frame header and exits cleanly without answering.
        let mut runner = ProcessRunner::new(sh("head -c 4 >/dev/null"));
        let (tx, mut rx) = result_channel();
        runner.open(tx).unwrap();

        runner.submit(Bytes::from_static(b"call")).unwrap();
        runner.flush().unwrap();

        insta::assert_snapshot!(
            rx.wait().unwrap_err(),
            @"function runner failed: function worker closed its output with 1 calls awaiting results"
        );
        runner.close(ShutdownPolicy::Abandon).unwrap();
    }

    #[test]
    fn test_abandon_terminates_worker() {
        let mut runner = ProcessRunner::new(WorkerConfig::new(["sleep", "21600"]));
        let (tx, _rx) = result_channel();
        runner.open(tx).unwrap();

        runner.submit(Bytes::from_static(b"call")).unwrap();

        let started = std::time::Instant::now();
        runner.close(ShutdownPolicy::Abandon).unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));

        // Closing again is a no-op.
        runner.close(ShutdownPolicy::Drain).unwrap();
    }

    #[test]
    fn test_misuse() {
        let mut runner = ProcessRunner::new(WorkerConfig::new(["cat"]));
        insta::assert_snapshot!(
            runner.submit(Bytes::new()).unwrap_err(),
            @"ProcessRunner is not open"
        );

        let (tx, _rx) = result_channel();
        runner.open(tx).unwrap();
        let (tx, _rx) = result_channel();
        insta::assert_snapshot!(runner.open(tx).unwrap_err(), @"ProcessRunner was already opened");
        runner.close(ShutdownPolicy::Drain).unwrap();

        let mut runner = ProcessRunner::new(WorkerConfig::new(["/this/path/does/not/exist"]));
        let (tx, _rx) = result_channel();
        let err = runner.open(tx).unwrap_err();
        insta::assert_snapshot!(
            format!("{err:#}"),
            @r###"starting function worker ["/this/path/does/not/exist"]: No such file or directory (os error 2)"###
        );
    }
}
