//! Per-node reconciliation: desired spec vs recorded state.
//!
//! The reconciler never inspects cross-node relationships; ordering a
//! replacement relative to dependents is the scheduler's job.

use std::collections::BTreeSet;
use std::fmt;

use caravel_graph::ResolvedSpec;
use caravel_provider::{DiffPolicy, Replacement};
use caravel_state::ResourceRecord;
use serde_json::Value as Json;
use thiserror::Error;

/// The operation the scheduler will run for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
  Create,
  /// In-place update of the named fields.
  Update { fields: BTreeSet<String> },
  /// Create/delete pair in the given order.
  Replace { order: Replacement },
  /// Spec unchanged; outputs come from recorded state without a provider
  /// call.
  NoOp,
  Delete,
}

impl fmt::Display for Action {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Create => f.write_str("create"),
      Self::Update { fields } => {
        let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
        write!(f, "update ({})", fields.join(", "))
      }
      Self::Replace {
        order: Replacement::DeleteBeforeCreate,
      } => f.write_str("replace (delete before create)"),
      Self::Replace { .. } => f.write_str("replace (create before delete)"),
      Self::NoOp => f.write_str("no-op"),
      Self::Delete => f.write_str("delete"),
    }
  }
}

#[derive(Debug, Error)]
pub enum PlanError {
  /// Changed fields require replacement but the kind forbids it.
  #[error("fields {fields:?} changed but the kind allows neither update nor replacement")]
  ReplacementForbidden { fields: Vec<String> },
}

/// Decide the action for one node.
///
/// `desired` is absent on a destroy run. Field-level changes compare
/// redacted documents, so secret fields diff by digest without exposing
/// payloads.
pub fn plan(
  desired: Option<&ResolvedSpec>,
  recorded: Option<&ResourceRecord>,
  policy: &DiffPolicy,
) -> Result<Action, PlanError> {
  let (desired, recorded) = match (desired, recorded) {
    (None, _) => return Ok(Action::Delete),
    (Some(_), None) => return Ok(Action::Create),
    (Some(desired), Some(recorded)) => (desired, recorded),
  };

  if desired.hash() == recorded.spec_hash {
    return Ok(Action::NoOp);
  }

  let changed = changed_fields(&desired.redacted(), &recorded.spec);
  if changed
    .iter()
    .all(|field| policy.updatable_fields.iter().any(|f| f == field))
  {
    return Ok(Action::Update { fields: changed });
  }

  match policy.replacement {
    Replacement::Forbidden => Err(PlanError::ReplacementForbidden {
      fields: changed.into_iter().collect(),
    }),
    order => Ok(Action::Replace { order }),
  }
}

/// Top-level fields whose values differ between two spec documents.
///
/// Non-object specs diff as a single whole-document field.
pub fn changed_fields(desired: &Json, recorded: &Json) -> BTreeSet<String> {
  match (desired.as_object(), recorded.as_object()) {
    (Some(new), Some(old)) => {
      let mut changed = BTreeSet::new();
      for (key, value) in new {
        if old.get(key) != Some(value) {
          changed.insert(key.clone());
        }
      }
      for key in old.keys() {
        if !new.contains_key(key) {
          changed.insert(key.clone());
        }
      }
      changed
    }
    _ if desired == recorded => BTreeSet::new(),
    _ => BTreeSet::from(["<document>".to_string()]),
  }
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use caravel_graph::{ResolveMode, SpecValue};
  use caravel_state::RecordStatus;
  use chrono::Utc;
  use serde_json::json;

  use super::*;

  fn resolved(spec: Json) -> ResolvedSpec {
    SpecValue::from(spec)
      .resolve(ResolveMode::Apply)
      .expect("resolve")
  }

  fn recorded_from(spec: &ResolvedSpec) -> ResourceRecord {
    ResourceRecord {
      kind: "test".to_string(),
      spec: spec.redacted(),
      spec_hash: spec.hash(),
      outputs: BTreeMap::new(),
      dependencies: Vec::new(),
      status: RecordStatus::Applied,
      updated_at: Utc::now(),
    }
  }

  #[test]
  fn absent_record_means_create() {
    let desired = resolved(json!({ "a": 1 }));
    let action = plan(Some(&desired), None, &DiffPolicy::default()).expect("plan");
    assert_eq!(action, Action::Create);
  }

  #[test]
  fn equal_hash_means_noop() {
    let desired = resolved(json!({ "a": 1 }));
    let record = recorded_from(&desired);
    let action = plan(Some(&desired), Some(&record), &DiffPolicy::default()).expect("plan");
    assert_eq!(action, Action::NoOp);
  }

  #[test]
  fn updatable_change_means_update() {
    let old = resolved(json!({ "image": "v1", "replicas": 3 }));
    let record = recorded_from(&old);
    let new = resolved(json!({ "image": "v2", "replicas": 3 }));

    let action = plan(
      Some(&new),
      Some(&record),
      &DiffPolicy::updatable(["image"]),
    )
    .expect("plan");
    assert_eq!(
      action,
      Action::Update {
        fields: BTreeSet::from(["image".to_string()])
      }
    );
  }

  #[test]
  fn non_updatable_change_means_replace() {
    let old = resolved(json!({ "image": "v1", "name": "a" }));
    let record = recorded_from(&old);
    let new = resolved(json!({ "image": "v1", "name": "b" }));

    let action = plan(
      Some(&new),
      Some(&record),
      &DiffPolicy::updatable(["image"]),
    )
    .expect("plan");
    assert_eq!(
      action,
      Action::Replace {
        order: Replacement::CreateBeforeDelete
      }
    );
  }

  #[test]
  fn forbidden_replacement_is_an_error() {
    let old = resolved(json!({ "name": "a" }));
    let record = recorded_from(&old);
    let new = resolved(json!({ "name": "b" }));

    let err = plan(
      Some(&new),
      Some(&record),
      &DiffPolicy::replace_only(Replacement::Forbidden),
    )
    .expect_err("must fail");
    assert!(matches!(err, PlanError::ReplacementForbidden { fields } if fields == ["name"]));
  }

  #[test]
  fn absent_desired_means_delete() {
    let old = resolved(json!({ "a": 1 }));
    let record = recorded_from(&old);
    let action = plan(None, Some(&record), &DiffPolicy::default()).expect("plan");
    assert_eq!(action, Action::Delete);
  }

  #[test]
  fn removed_field_counts_as_changed() {
    let changed = changed_fields(&json!({ "a": 1 }), &json!({ "a": 1, "b": 2 }));
    assert_eq!(changed, BTreeSet::from(["b".to_string()]));
  }
}
