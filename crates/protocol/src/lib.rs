//! Host/worker wire protocol for smart-cluster worker processes.

pub mod codec;
pub mod error;
pub mod message;
pub mod worker;

pub use codec::{encode_frame, read_frame, write_frame, MAX_FRAME_LEN};
pub use error::ProtocolError;
pub use message::{
    HostMessage, TaskOutcome, TaskReply, TaskRequest, WorkerMessage, PROTOCOL_VERSION,
};
pub use worker::{TaskFuture, TaskHandler, WorkerBuilder, WorkerRunner, WorkerRunnerConfig};
