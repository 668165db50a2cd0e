//! Value cell errors.

use thiserror::Error;

/// A value cell was resolved a second time.
///
/// Double resolution is a programming error in the engine, not a recoverable
/// runtime condition; callers are expected to abort the run.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("value cell already resolved")]
pub struct ResolutionConflict;
