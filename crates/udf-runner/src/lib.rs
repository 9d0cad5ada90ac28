//! Out-of-process function runners for scalar function operators.
//!
//! [`ProcessRunner`] evaluates calls in a worker subprocess, which reads
//! length-prefixed call frames from its stdin and writes result frames
//! to its stdout.

mod config;
mod frame;
pub mod json;
mod process;
mod resequence;
mod runner;

pub use config::{Framing, PipeConfig, WorkerConfig};
pub use frame::{encode_frame, Frame, FrameDecoder, MAX_FRAME_BYTES};
pub use process::WorkerProcess;
pub use resequence::Resequencer;
pub use runner::ProcessRunner;
