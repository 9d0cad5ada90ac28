use crate::{
    Error, ForwardingQueue, Output, PendingEntry, Result, ResultReceiver, Row, RowCodec, Schema,
};
use bytes::Bytes;

/// Correlator pairs each result of the function runner with the record it
/// was computed from, and emits their joined row.
///
/// Records are parked in a bounded forwarding queue as their calls are
/// submitted. Results are polled from the result channel. The two are
/// consumed in lockstep by a single thread: the n'th result belongs to the
/// n'th parked record.
pub struct Correlator {
    pending: ForwardingQueue<PendingEntry>,
    results: ResultReceiver,
    output: RowCodec,
    joined: u64,
    result_bytes: u64,
}

impl Correlator {
    pub fn new(max_in_flight: usize, results: ResultReceiver, output_schema: Schema) -> Self {
        Self {
            pending: ForwardingQueue::new(max_in_flight),
            results,
            output: RowCodec::new(output_schema),
            joined: 0,
            result_bytes: 0,
        }
    }

    /// Number of parked records awaiting their result.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_full(&self) -> bool {
        self.pending.is_full()
    }

    /// Number of results which have been joined and emitted.
    pub fn joined(&self) -> u64 {
        self.joined
    }

    /// Total bytes of joined results.
    pub fn result_bytes(&self) -> u64 {
        self.result_bytes
    }

    /// Park `entry` as the most-recently submitted call.
    /// The caller must have made room: a full queue hands `entry` back.
    pub fn park(&mut self, entry: PendingEntry) -> std::result::Result<(), PendingEntry> {
        self.pending.push(entry)
    }

    /// Join and emit every result which is ready, without blocking.
    /// Returns the number of rows emitted.
    pub fn drain<O: Output>(&mut self, out: &mut O) -> Result<usize> {
        let mut emitted = 0;

        // Results may arrive in batches, so keep going until the channel is empty.
        while let Some(raw) = self.results.poll()? {
            self.join(raw, out)?;
            emitted += 1;
        }
        Ok(emitted)
    }

    /// Block until at least one result is ready, then join and emit it
    /// along with any others which are also ready.
    pub fn wait_and_drain<O: Output>(&mut self, out: &mut O) -> Result<usize> {
        match self.results.wait()? {
            Some(raw) => {
                self.join(raw, out)?;
                Ok(1 + self.drain(out)?)
            }
            None => Err(Error::RunnerClosed {
                pending: self.pending.len(),
            }),
        }
    }

    /// Check that no result remains once the runner has closed.
    pub fn finish(&mut self) -> Result<()> {
        match self.results.poll()? {
            Some(_) => Err(Error::QueueConsistencyViolation { seq: self.joined }),
            None => Ok(()),
        }
    }

    /// Discard every parked record and unread result without emitting anything.
    /// Returns the numbers of records and results which were discarded.
    pub fn abandon(&mut self) -> (usize, usize) {
        let records = self.pending.drain().count();
        let results = self.results.close();
        (records, results)
    }

    fn join<O: Output>(&mut self, raw: Bytes, out: &mut O) -> Result<()> {
        let seq = self.joined;

        let Some(PendingEntry {
            kind,
            forwarded: mut fields,
        }) = self.pending.pop_front()
        else {
            return Err(Error::QueueConsistencyViolation { seq });
        };

        let outputs = self
            .output
            .decode(&raw)
            .map_err(|source| Error::MalformedResult { seq, source })?;

        fields.extend(outputs);
        tracing::trace!(seq, ?kind, result_len = raw.len(), "joined function result");

        self.joined += 1;
        self.result_bytes += raw.len() as u64;
        out.collect(Row { kind, fields });

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{result_channel, Field, LogicalType, RowKind, Value};
    use pretty_assertions::assert_eq;

    fn output_schema() -> Schema {
        Schema::new(vec![Field::new("out", LogicalType::Int)])
    }

    fn entry(kind: RowKind, id: i64) -> PendingEntry {
        PendingEntry {
            kind,
            forwarded: vec![Value::BigInt(id)],
        }
    }

    fn result(v: i32) -> Bytes {
        RowCodec::new(output_schema())
            .encode(&[Value::Int(v)])
            .unwrap()
    }

    #[test]
    fn test_drains_eagerly_in_order() {
        let (tx, rx) = result_channel();
        let mut correlator = Correlator::new(3, rx, output_schema());
        let mut out = Vec::new();

        correlator.park(entry(RowKind::Insert, 1)).unwrap();
        correlator.park(entry(RowKind::UpdateBefore, 2)).unwrap();
        correlator.park(entry(RowKind::Delete, 3)).unwrap();
        assert!(correlator.is_full());
        assert!(correlator.park(entry(RowKind::Insert, 4)).is_err());

        // Nothing is ready.
        assert_eq!(correlator.drain(&mut out).unwrap(), 0);

        tx.push(result(10));
        tx.push(result(20));
        assert_eq!(correlator.drain(&mut out).unwrap(), 2);
        assert_eq!(correlator.pending(), 1);

        tx.push(result(30));
        assert_eq!(correlator.wait_and_drain(&mut out).unwrap(), 1);

        assert_eq!(
            out,
            vec![
                Row::new(RowKind::Insert, vec![Value::BigInt(1), Value::Int(10)]),
                Row::new(RowKind::UpdateBefore, vec![Value::BigInt(2), Value::Int(20)]),
                Row::new(RowKind::Delete, vec![Value::BigInt(3), Value::Int(30)]),
            ]
        );
        assert_eq!(correlator.joined(), 3);
        assert_eq!(correlator.result_bytes(), 15);
        correlator.finish().unwrap();
    }

    #[test]
    fn test_result_without_pending_record() {
        let (tx, rx) = result_channel();
        let mut correlator = Correlator::new(2, rx, output_schema());
        let mut out = Vec::new();

        correlator.park(entry(RowKind::Insert, 1)).unwrap();
        tx.push(result(1));
        tx.push(result(2));

        let err = correlator.drain(&mut out).unwrap_err();
        assert!(matches!(err, Error::QueueConsistencyViolation { seq: 1 }));
        insta::assert_snapshot!(err, @"received result #1 but no input record is pending");

        // The first, valid pair was emitted before the violation was found.
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_stray_result_after_close() {
        let (tx, rx) = result_channel();
        let mut correlator = Correlator::new(2, rx, output_schema());

        tx.push(result(1));
        assert!(matches!(
            correlator.finish(),
            Err(Error::QueueConsistencyViolation { seq: 0 })
        ));
    }

    #[test]
    fn test_malformed_result_emits_nothing() {
        let (tx, rx) = result_channel();
        let mut correlator = Correlator::new(2, rx, output_schema());
        let mut out = Vec::new();

        correlator.park(entry(RowKind::Insert, 1)).unwrap();
        tx.push(Bytes::new());

        let err = correlator.drain(&mut out).unwrap_err();
        insta::assert_snapshot!(
            format!("{:#}", anyhow::Error::from(err)),
            @"result #0 from the function runner is malformed: truncated input at byte 0: needed 1 bytes but only 0 remain"
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_runner_closed_while_waiting() {
        let (tx, rx) = result_channel();
        let mut correlator = Correlator::new(2, rx, output_schema());
        let mut out = Vec::new();

        correlator.park(entry(RowKind::Insert, 1)).unwrap();
        std::mem::drop(tx);

        assert!(matches!(
            correlator.wait_and_drain(&mut out),
            Err(Error::RunnerClosed { pending: 1 })
        ));
    }

    #[test]
    fn test_abandon() {
        let (tx, rx) = result_channel();
        let mut correlator = Correlator::new(4, rx, output_schema());

        for id in 0..3 {
            correlator.park(entry(RowKind::Insert, id)).unwrap();
        }
        tx.push(result(1));

        assert_eq!(correlator.abandon(), (3, 1));
        assert_eq!(correlator.pending(), 0);
        assert!(!tx.push(result(2)));
    }
}
