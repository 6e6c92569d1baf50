//! Domain layer types and invariants.

pub mod error;
pub mod names;

pub use error::{ApplyError, ErrorKind, ErrorReason, SubsocketError};
