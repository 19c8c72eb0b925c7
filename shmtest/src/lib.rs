#![warn(clippy::pedantic)]

//! Probes how large a System V shared memory segment this system will allocate.
//!
//! A [`Session`] reads a size, allocates and attaches a private segment of that size, waits for
//! the operator, then detaches and destroys it.

/// Reading sizes from the operator.
pub mod input;
/// Releasing the current segment on `ctrl-c`.
pub mod interrupt;
mod session;

pub use input::{parse_size, InputError, ParseSizeError, Tokens};
pub use session::{
    Allocated, Facility, Mapped, Prompts, Report, Session, SessionError, SystemV,
    CONTINUE_PROMPT, SIZE_PROMPT,
};
