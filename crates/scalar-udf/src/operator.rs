use crate::{
    result_channel, CallEncoder, Correlator, Error, FunctionRunner, OperatorConfig, Output,
    PendingEntry, Result, Row, ShutdownPolicy, Stats,
};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    // A fatal error was returned. Only `close` is permitted.
    Failed,
    Closed,
}

/// Operator evaluates a scalar function over a stream of records, using a
/// FunctionRunner, and emits each record's forwarded fields joined with its
/// function result.
///
/// It's driven by its host from a single thread:
/// * `on_record` for each input record,
/// * `emit` or `flush` frequently, to emit joined rows as results arrive,
/// * `close` once, at shutdown.
///
/// Every error is fatal. After an error only `close` may be called,
/// which abandons any calls still in flight.
pub struct Operator<R> {
    config: OperatorConfig,
    encoder: CallEncoder,
    correlator: Correlator,
    runner: R,
    state: State,
    stats: Stats,
}

impl<R: FunctionRunner> Operator<R> {
    /// Build an Operator from `config`, and open its `runner`.
    pub fn new(config: OperatorConfig, mut runner: R) -> Result<Self> {
        config.validate()?;
        let encoder = CallEncoder::new(&config.input_schema, &config.input_field_offsets)?;

        let (results_tx, results_rx) = result_channel();
        runner.open(results_tx).map_err(Error::Runner)?;

        let correlator = Correlator::new(
            config.max_in_flight,
            results_rx,
            config.output_schema.clone(),
        );

        tracing::debug!(
            max_in_flight = config.max_in_flight,
            input_field_offsets = ?config.input_field_offsets,
            forwarded_field_offsets = ?config.forwarded_field_offsets,
            output_width = config.output_schema.width(),
            on_shutdown = ?config.on_shutdown,
            "opened scalar function operator"
        );

        Ok(Self {
            config,
            encoder,
            correlator,
            runner,
            state: State::Open,
            stats: Stats::default(),
        })
    }

    /// Submit `row` for evaluation, blocking if too many calls are in flight.
    /// Joined rows which are ready are emitted to `out`.
    pub fn on_record<O: Output>(&mut self, row: Row, out: &mut O) -> Result<()> {
        self.check_open()?;
        let result = self.submit(row, out);
        self.guard(result)
    }

    /// Emit every joined row which is ready, without blocking.
    pub fn emit<O: Output>(&mut self, out: &mut O) -> Result<usize> {
        self.check_open()?;
        let result = self.correlator.drain(out);
        self.guard(result)
    }

    /// Ask the runner to send its buffered calls to the worker,
    /// and emit every joined row which is ready, without blocking.
    pub fn flush<O: Output>(&mut self, out: &mut O) -> Result<usize> {
        self.check_open()?;
        let result = match self.runner.flush() {
            Ok(()) => self.correlator.drain(out),
            Err(err) => Err(Error::Runner(err)),
        };
        self.guard(result)
    }

    /// Stop accepting records and shut down under the configured ShutdownPolicy.
    /// Returns final Stats.
    pub fn close<O: Output>(&mut self, out: &mut O) -> Result<Stats> {
        let policy = match self.state {
            State::Closed => return Err(Error::Closed),
            State::Failed => ShutdownPolicy::Abandon,
            State::Open => self.config.on_shutdown,
        };

        let mut result = match policy {
            ShutdownPolicy::Drain => self.close_draining(out),
            ShutdownPolicy::Abandon => Ok(()),
        };
        if policy == ShutdownPolicy::Abandon || result.is_err() {
            let abandoned = self.abandon();
            result = result.and(abandoned);
        }
        self.state = State::Closed;
        result?;

        let stats = self.stats();
        tracing::debug!(?policy, ?stats, "closed scalar function operator");
        Ok(stats)
    }

    /// Number of records whose result is awaited.
    pub fn in_flight(&self) -> usize {
        self.correlator.pending()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            records_out: self.correlator.joined(),
            result_bytes: self.correlator.result_bytes(),
            ..self.stats.clone()
        }
    }

    fn submit<O: Output>(&mut self, row: Row, out: &mut O) -> Result<()> {
        // Encode first: a record which can't be encoded is never submitted or parked.
        let call = self.encoder.encode(&row)?;
        self.make_room(out)?;

        let entry = PendingEntry {
            kind: row.kind,
            forwarded: row.project(&self.config.forwarded_field_offsets).fields,
        };
        let call_len = call.len() as u64;

        // Submission and parking happen together, with no intervening
        // emission, so that results and parked records stay in lockstep.
        self.runner.submit(call).map_err(Error::Runner)?;
        if self.correlator.park(entry).is_err() {
            unreachable!("forwarding queue has room after make_room");
        }

        self.stats.records_in += 1;
        self.stats.call_bytes += call_len;
        tracing::trace!(in_flight = self.correlator.pending(), call_len, "submitted call");

        self.correlator.drain(out)?;
        Ok(())
    }

    // Block until the forwarding queue has room for another record.
    fn make_room<O: Output>(&mut self, out: &mut O) -> Result<()> {
        if !self.correlator.is_full() {
            return Ok(());
        }
        self.correlator.drain(out)?;

        if !self.correlator.is_full() {
            return Ok(());
        }
        let started = Instant::now();
        self.stats.backpressure_waits += 1;

        tracing::trace!(
            in_flight = self.correlator.pending(),
            "forwarding queue is full; waiting for a result"
        );
        // The runner may be holding a partial bundle which includes
        // calls we're about to wait on.
        self.runner.flush().map_err(Error::Runner)?;

        while self.correlator.is_full() {
            self.correlator.wait_and_drain(out)?;
        }
        self.stats.backpressure_duration += started.elapsed();

        Ok(())
    }

    fn close_draining<O: Output>(&mut self, out: &mut O) -> Result<()> {
        self.runner.flush().map_err(Error::Runner)?;

        while self.correlator.pending() != 0 {
            self.correlator.wait_and_drain(out)?;
        }
        self.runner
            .close(ShutdownPolicy::Drain)
            .map_err(Error::Runner)?;

        self.correlator.finish()
    }

    fn abandon(&mut self) -> Result<()> {
        let closed = self.runner.close(ShutdownPolicy::Abandon);
        let (records, results) = self.correlator.abandon();
        self.stats.abandoned += records as u64;

        if records != 0 || results != 0 {
            tracing::warn!(records, results, "abandoned in-flight function calls");
        }
        closed.map_err(Error::Runner)
    }

    fn check_open(&self) -> Result<()> {
        match self.state {
            State::Open => Ok(()),
            State::Failed | State::Closed => Err(Error::Closed),
        }
    }

    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            tracing::error!(
                error = ?err,
                in_flight = self.correlator.pending(),
                "scalar function operator failed"
            );
            self.state = State::Failed;
        }
        result
    }
}
