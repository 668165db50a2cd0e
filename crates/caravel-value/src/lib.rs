//! Caravel Value
//!
//! Leaf primitives shared by every other caravel crate: plain and
//! secret-tagged output values, and the single-assignment [`ValueCell`] that
//! propagates resolved outputs between resources.
//!
//! Nothing here blocks: waiting on an unresolved cell is expressed as
//! callback registration, so the same cells work under thread-parallel and
//! single-threaded cooperative execution.

mod cell;
mod error;
mod value;

pub use cell::ValueCell;
pub use error::ResolutionConflict;
pub use value::{REDACTED_KEY, REDACTION_MARKER, Value, content_digest};
