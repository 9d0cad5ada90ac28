//! Evaluation of scalar functions by an out-of-process worker.
//!
//! An [`Operator`] receives records from its host, encodes the arguments
//! of each into a call which is submitted to a [`FunctionRunner`], and parks
//! the record in a bounded forwarding queue. Runners deliver encoded results
//! asynchronously, in submission order, over a result channel. The operator
//! joins each result with the oldest parked record and emits the joined row.
//!
//! Correctness rests on the forwarding queue and the result channel being
//! filled in lockstep: the n'th result belongs to the n'th parked record.

mod channel;
mod config;
mod correlator;
mod encoder;
mod operator;
mod queue;
mod runner;
mod stats;

pub use channel::{result_channel, ResultReceiver, ResultSender};
pub use config::{OperatorConfig, ShutdownPolicy};
pub use correlator::Correlator;
pub use encoder::CallEncoder;
pub use operator::Operator;
pub use queue::{ForwardingQueue, PendingEntry};
pub use runner::{FunctionRunner, ThreadRunner};
pub use stats::Stats;

pub use row_codec::{Field, LogicalType, Row, RowCodec, RowKind, Schema, Value};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid operator configuration: {0}")]
    Config(String),
    #[error("input record does not match the input schema")]
    Codec(#[from] row_codec::Error),
    #[error("result #{seq} from the function runner is malformed")]
    MalformedResult {
        seq: u64,
        #[source]
        source: row_codec::Error,
    },
    #[error("received result #{seq} but no input record is pending")]
    QueueConsistencyViolation { seq: u64 },
    #[error("function runner failed: {0:#}")]
    Runner(anyhow::Error),
    #[error("function runner closed with {pending} calls in flight")]
    RunnerClosed { pending: usize },
    #[error("operator is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Output receives joined rows for downstream emission.
pub trait Output {
    fn collect(&mut self, row: Row);
}

impl Output for Vec<Row> {
    fn collect(&mut self, row: Row) {
        self.push(row)
    }
}
