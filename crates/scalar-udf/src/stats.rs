use std::time::Duration;

/// Stats are cumulative counters of an Operator.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Stats {
    /// Records submitted to the function runner.
    pub records_in: u64,
    /// Joined rows emitted downstream.
    pub records_out: u64,
    /// Records discarded without emission by an abandoning shutdown.
    pub abandoned: u64,
    /// Total bytes of encoded calls.
    pub call_bytes: u64,
    /// Total bytes of joined results.
    pub result_bytes: u64,
    /// Number of times a record had to wait for room in the forwarding queue.
    pub backpressure_waits: u64,
    /// Total time spent waiting for room in the forwarding queue.
    pub backpressure_duration: Duration,
}

impl Stats {
    /// Records which were submitted but are neither emitted nor abandoned.
    pub fn in_flight(&self) -> u64 {
        self.records_in - self.records_out - self.abandoned
    }
}
