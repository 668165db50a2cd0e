//! Single-assignment value cell with callback subscription.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use crate::error::ResolutionConflict;
use crate::value::Value;

type Subscriber = Box<dyn FnOnce(&Value) + Send>;

enum CellState {
  Pending(Vec<Subscriber>),
  Resolved(Value),
}

/// A single-assignment container for one resource output.
///
/// Dependents register callbacks instead of blocking; once resolved the cell
/// never changes again.
pub struct ValueCell {
  state: Mutex<CellState>,
}

impl ValueCell {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(CellState::Pending(Vec::new())),
    }
  }

  pub fn is_resolved(&self) -> bool {
    matches!(*self.lock(), CellState::Resolved(_))
  }

  /// The resolved value, if any.
  pub fn get(&self) -> Option<Value> {
    match &*self.lock() {
      CellState::Resolved(value) => Some(value.clone()),
      CellState::Pending(_) => None,
    }
  }

  /// Register interest in the resolved value.
  ///
  /// Runs the callback immediately if the cell is already resolved,
  /// otherwise queues it; [`ValueCell::resolve`] drains the queue in
  /// registration order.
  pub fn subscribe(&self, callback: impl FnOnce(&Value) + Send + 'static) {
    let resolved = {
      let mut state = self.lock();
      match &mut *state {
        CellState::Pending(subscribers) => {
          subscribers.push(Box::new(callback));
          return;
        }
        CellState::Resolved(value) => value.clone(),
      }
    };
    callback(&resolved);
  }

  /// Resolve the cell, failing if it was already resolved.
  ///
  /// Subscribers run outside the lock, so a callback may freely read the
  /// cell it subscribed to.
  pub fn resolve(&self, value: Value) -> Result<(), ResolutionConflict> {
    let subscribers = {
      let mut state = self.lock();
      match &mut *state {
        CellState::Resolved(_) => return Err(ResolutionConflict),
        CellState::Pending(subscribers) => {
          let drained = std::mem::take(subscribers);
          *state = CellState::Resolved(value.clone());
          drained
        }
      }
    };
    for subscriber in subscribers {
      subscriber(&value);
    }
    Ok(())
  }

  fn lock(&self) -> MutexGuard<'_, CellState> {
    match self.state.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }
}

impl Default for ValueCell {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for ValueCell {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ValueCell")
      .field("resolved", &self.is_resolved())
      .finish()
  }
}
