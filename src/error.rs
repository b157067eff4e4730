//! This module defines error types that are used in this crate.

use crate::message::Message;

use crossbeam::channel;
use thiserror::Error;

#[cfg(test)]
pub(crate) const TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Programmer errors inside a running process. All of these are fatal: the
/// process is dropped and an `Error` message is emitted at the VM boundary.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("memory access out of range at slot {0}")]
    OutOfRange(usize),
    #[error("read from empty memory slot {0}")]
    EmptySlot(usize),
    #[error("share index mismatch: {0} != {1}")]
    ShareIndexMismatch(u64, u64),
    #[error("unexpected value variant in {0}")]
    UnexpectedValue(&'static str),
    #[error("macro instruction reached the interpreter")]
    UnexpandedMacro,
    #[error("program counter {0} ran past the end of the program")]
    PcOutOfRange(u64),
    #[error("stored state does not match the instruction")]
    StateMismatch,
    #[error("multiplicative inverse of zero")]
    ZeroInverse,
    #[error("reduction by zero divisor")]
    ZeroDivisor,
}

/// Failures of threshold reconstruction. `Inconsistent` marks a protocol
/// violation by a peer, the rest are plain arity problems.
#[derive(Error, Debug, PartialEq)]
pub enum ShareError {
    #[error("expected at least {needed} distinct shares, got {got}")]
    BelowThreshold { needed: usize, got: usize },
    #[error("shares do not lie on a single polynomial")]
    Inconsistent,
}

/// `TaskError` wraps the channel errors a task loop can run into, so the
/// runtime and the test harness do not need a generic parameter.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Recv(#[from] channel::RecvError),
    #[error(transparent)]
    RecvTimeout(#[from] channel::RecvTimeoutError),
    #[error(transparent)]
    Send(#[from] channel::SendError<Message>),
    #[error(transparent)]
    SendShutdown(#[from] channel::SendError<()>),
}
