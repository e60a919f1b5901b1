//! Guest-visible error reporting.
//!
//! Two kinds of trouble can happen while an instruction runs, and neither
//! stops the machine:
//! - arithmetic errors (division by zero in signed/float division) go to an
//!   [`ErrorReporter`] and the rest of the instruction is skipped;
//! - stack faults go through the trap protocol in the executor, using the
//!   ids below.

use thiserror::Error;

/// Codes written to HMEM's error-id slot.
pub mod error_id {
    pub const NONE: u8 = 0;
    pub const STACK_OVERFLOW: u8 = 1;
    pub const STACK_UNDERFLOW: u8 = 2;
}

/// A non-fatal runtime error raised by guest code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// `address` is where the faulting instruction starts.
    #[error("division by zero at {address:#08X}")]
    DivisionByZero { address: u32 },
}

/// Receives runtime errors. Fire and forget: the core never looks at what
/// the reporter does with them.
pub trait ErrorReporter {
    fn report(&mut self, error: &RuntimeError);
}

/// Default reporter: logs each error and counts them.
#[derive(Debug, Default)]
pub struct LogReporter {
    reported: u64,
}

impl LogReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reported(&self) -> u64 {
        self.reported
    }
}

impl ErrorReporter for LogReporter {
    fn report(&mut self, error: &RuntimeError) {
        self.reported += 1;
        tracing::warn!(count = self.reported, "runtime error: {error}");
    }
}
