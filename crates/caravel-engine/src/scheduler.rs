//! Dependency-ordered execution of apply, destroy and preview runs.
//!
//! The apply loop is event-driven: zero-indegree nodes are dispatched onto
//! tokio tasks bounded by a semaphore, completions come back over an mpsc
//! channel, and each completion resolves the node's output cells, records
//! its state and releases newly-ready dependents. The node status table is
//! mutated only by this loop - workers communicate results, they never
//! touch shared state.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};

use caravel_graph::{
  NodeId, NodeStatus, ResolveMode, ResolvedSpec, ResourceGraph, ResourceNode, SpecError,
};
use caravel_provider::{Outputs, Provider, ProviderError, ProviderRegistry, Replacement};
use caravel_state::{RecordStatus, ResourceRecord, StateSnapshot, Store, StoredValue};
use chrono::Utc;
use serde_json::Value as Json;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::reconcile::{Action, plan};
use crate::report::{NodeFailure, PlannedAction, PreviewReport, RunReport};

/// Options for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
  /// Maximum provider calls in flight at once.
  pub parallelism: usize,
  /// Route no-op nodes through the provider's `read` to refresh outputs
  /// instead of serving them from recorded state.
  pub refresh: bool,
  /// Run-level cancellation. Stops dispatch of new nodes; in-flight calls
  /// receive a child token as a best-effort signal but are awaited to
  /// completion, and their results still update recorded state.
  pub cancel: CancellationToken,
}

impl Default for RunOptions {
  fn default() -> Self {
    Self {
      parallelism: 4,
      refresh: false,
      cancel: CancellationToken::new(),
    }
  }
}

/// Drives a graph through one bounded run. There is no watch loop: a
/// scheduler consumes a freshly built graph exactly once per run.
pub struct Scheduler<S: Store> {
  providers: ProviderRegistry,
  store: S,
  options: RunOptions,
}

struct CompletedWork {
  outputs: Outputs,
  record: Option<ResourceRecord>,
}

struct Completion {
  id: NodeId,
  action: Action,
  outcome: Result<CompletedWork, ProviderError>,
  /// Replacement cleanup failure: the new resource exists and its outputs
  /// are valid, but the node still reports failed.
  cleanup_error: Option<ProviderError>,
}

enum DispatchOutcome {
  Spawned,
  PlanFailed(String),
}

struct DestroyCompletion {
  urn: String,
  result: Result<(), ProviderError>,
}

impl<S: Store> Scheduler<S> {
  pub fn new(providers: ProviderRegistry, store: S, options: RunOptions) -> Self {
    Self {
      providers,
      store,
      options,
    }
  }

  pub fn store(&self) -> &S {
    &self.store
  }

  /// Apply the graph: reconcile every node against recorded state and run
  /// the chosen operations in dependency order.
  pub async fn apply(&self, graph: &ResourceGraph) -> Result<RunReport, EngineError> {
    let execution_id = Uuid::new_v4().to_string();

    graph.verify_acyclic()?;
    self.check_kinds(graph.nodes().map(|node| node.id().kind.as_str()))?;

    let snapshot = self.store.load().await.map_err(EngineError::store)?;

    info!(
      execution_id = %execution_id,
      nodes = graph.len(),
      "apply_started"
    );

    let exports = subscribe_exports(graph);

    let mut report = RunReport {
      execution_id: execution_id.clone(),
      ..Default::default()
    };
    let mut statuses: HashMap<NodeId, NodeStatus> = graph
      .ids()
      .iter()
      .map(|id| (id.clone(), NodeStatus::Pending))
      .collect();
    let mut indegree = graph.indegrees();
    let mut ready: VecDeque<Arc<ResourceNode>> = graph
      .nodes()
      .filter(|node| indegree.get(node.id()).copied() == Some(0))
      .cloned()
      .collect();
    for node in &ready {
      statuses.insert(node.id().clone(), NodeStatus::Runnable);
    }

    let semaphore = Arc::new(Semaphore::new(self.options.parallelism.max(1)));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut in_flight = 0usize;
    let mut fatal: Option<EngineError> = None;

    loop {
      // Dispatch everything runnable, unless the run is winding down.
      while fatal.is_none() && !self.options.cancel.is_cancelled() {
        let Some(node) = ready.pop_front() else { break };
        if !matches!(statuses.get(node.id()), Some(NodeStatus::Runnable)) {
          continue;
        }
        match self.dispatch_apply(&node, &snapshot, &execution_id, &semaphore, &tx) {
          Ok(DispatchOutcome::Spawned) => {
            statuses.insert(node.id().clone(), NodeStatus::Applying);
            in_flight += 1;
          }
          Ok(DispatchOutcome::PlanFailed(message)) => {
            fail_node(graph, node.id(), &message, &mut statuses, &mut report, &execution_id);
          }
          Err(err) => {
            fatal = Some(err);
          }
        }
      }

      if in_flight == 0 {
        break;
      }

      let Some(completion) = rx.recv().await else { break };
      in_flight -= 1;

      let urn = completion.id.urn();
      match completion.outcome {
        Ok(work) => {
          // Resolve the node's output cells, waking subscriber callbacks
          // and unblocking dependent specs.
          let mut conflicted = false;
          if let Some(node) = graph.node(&completion.id) {
            for (key, value) in &work.outputs {
              if node.output_cell(key).resolve(value.clone()).is_err() {
                conflicted = true;
                if fatal.is_none() {
                  fatal = Some(EngineError::ResolutionConflict {
                    urn: urn.clone(),
                    key: key.clone(),
                  });
                }
              }
            }
          }
          if conflicted {
            continue;
          }

          if let Some(record) = work.record {
            if let Err(err) = self.store.put(&urn, record).await {
              if fatal.is_none() {
                fatal = Some(EngineError::store(err));
              }
              continue;
            }
          }

          match &completion.cleanup_error {
            Some(err) => {
              warn!(
                execution_id = %execution_id,
                urn = %urn,
                error = %err,
                "replacement_cleanup_failed"
              );
              statuses.insert(completion.id.clone(), NodeStatus::Failed);
              report.failed.push(NodeFailure {
                urn: urn.clone(),
                error: format!("replacement cleanup failed: {err}"),
              });
            }
            None => {
              info!(
                execution_id = %execution_id,
                urn = %urn,
                action = %completion.action,
                "node_applied"
              );
              statuses.insert(completion.id.clone(), NodeStatus::Applied);
              if matches!(completion.action, Action::NoOp) {
                report.unchanged.push(urn.clone());
              } else {
                report.applied.push(urn.clone());
              }
            }
          }

          // Release dependents whose last dependency this was.
          for dependent in graph.downstream(&completion.id) {
            if let Some(count) = indegree.get_mut(dependent) {
              *count -= 1;
              if *count == 0
                && matches!(statuses.get(dependent), Some(NodeStatus::Pending))
              {
                if let Some(node) = graph.node(dependent) {
                  statuses.insert(dependent.clone(), NodeStatus::Runnable);
                  ready.push_back(node.clone());
                }
              }
            }
          }
        }
        Err(err) => {
          fail_node(
            graph,
            &completion.id,
            &err.to_string(),
            &mut statuses,
            &mut report,
            &execution_id,
          );
        }
      }
    }

    for id in graph.ids() {
      if matches!(
        statuses.get(id),
        Some(NodeStatus::Pending | NodeStatus::Runnable)
      ) {
        report.skipped.push(id.urn());
      }
    }
    report.cancelled = self.options.cancel.is_cancelled();

    if let Some(err) = fatal {
      error!(execution_id = %execution_id, error = %err, "apply_failed");
      return Err(err);
    }

    report.exports = {
      let exports = match exports.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
      };
      exports.clone()
    };

    info!(
      execution_id = %execution_id,
      applied = report.applied.len(),
      unchanged = report.unchanged.len(),
      failed = report.failed.len(),
      blocked = report.blocked.len(),
      "apply_completed"
    );

    Ok(report)
  }

  fn dispatch_apply(
    &self,
    node: &Arc<ResourceNode>,
    snapshot: &StateSnapshot,
    execution_id: &str,
    semaphore: &Arc<Semaphore>,
    tx: &mpsc::UnboundedSender<Completion>,
  ) -> Result<DispatchOutcome, EngineError> {
    let id = node.id().clone();
    let urn = id.urn();
    let provider = self
      .providers
      .get(&id.kind)
      .ok_or_else(|| EngineError::UnknownKind {
        kind: id.kind.clone(),
      })?;

    // Every dependency has applied by now, so all referenced cells must be
    // resolved; anything else aborts the run.
    let resolved = node
      .spec()
      .resolve(ResolveMode::Apply)
      .map_err(|SpecError::UnresolvedRef { reference }| EngineError::DependencyUnresolved {
        urn: urn.clone(),
        reference,
      })?;

    let record = snapshot.get(&urn).cloned();
    let action = match plan(Some(&resolved), record.as_ref(), &provider.diff_policy()) {
      Ok(action) => action,
      Err(err) => return Ok(DispatchOutcome::PlanFailed(err.to_string())),
    };

    info!(
      execution_id = %execution_id,
      urn = %urn,
      action = %action,
      "node_started"
    );

    let dependencies: Vec<String> = node.depends_on().iter().map(NodeId::urn).collect();
    let secure = self.store.secure();
    let refresh = self.options.refresh;
    let cancel = self.options.cancel.child_token();
    let semaphore = semaphore.clone();
    let tx = tx.clone();

    tokio::spawn(async move {
      let Ok(_permit) = semaphore.acquire_owned().await else {
        return;
      };
      let completion = run_action(
        provider,
        id,
        action,
        resolved,
        record,
        dependencies,
        secure,
        refresh,
        cancel,
      )
      .await;
      let _ = tx.send(completion);
    });

    Ok(DispatchOutcome::Spawned)
  }

  /// Destroy every recorded resource, dependents strictly before their
  /// dependencies. The graph comes from recorded state alone, so destroy
  /// keeps working after the program text changed.
  pub async fn destroy(&self) -> Result<RunReport, EngineError> {
    let execution_id = Uuid::new_v4().to_string();
    let snapshot = self.store.load().await.map_err(EngineError::store)?;
    self.check_kinds(snapshot.resources.values().map(|record| record.kind.as_str()))?;

    // Edges restricted to urns still recorded; a dependency already gone
    // simply no longer orders anything.
    let mut dependents: HashMap<String, Vec<String>> = snapshot
      .resources
      .keys()
      .map(|urn| (urn.clone(), Vec::new()))
      .collect();
    let mut dependencies: HashMap<String, Vec<String>> = dependents.clone();
    for (urn, record) in &snapshot.resources {
      for dep in &record.dependencies {
        if snapshot.resources.contains_key(dep) {
          if let Some(entry) = dependents.get_mut(dep) {
            entry.push(urn.clone());
          }
          if let Some(entry) = dependencies.get_mut(urn) {
            entry.push(dep.clone());
          }
        }
      }
    }

    verify_recorded_acyclic(&dependents, &dependencies)?;

    info!(
      execution_id = %execution_id,
      nodes = snapshot.resources.len(),
      "destroy_started"
    );

    let mut report = RunReport {
      execution_id: execution_id.clone(),
      ..Default::default()
    };
    let mut statuses: HashMap<String, NodeStatus> = snapshot
      .resources
      .keys()
      .map(|urn| (urn.clone(), NodeStatus::Pending))
      .collect();
    // A delete becomes runnable only once every recorded dependent has
    // completed its own delete.
    let mut waiting: HashMap<String, usize> = dependents
      .iter()
      .map(|(urn, entries)| (urn.clone(), entries.len()))
      .collect();
    let mut ready: VecDeque<String> = snapshot
      .resources
      .keys()
      .filter(|urn| waiting.get(*urn).copied() == Some(0))
      .cloned()
      .collect();
    for urn in &ready {
      statuses.insert(urn.clone(), NodeStatus::Runnable);
    }

    let semaphore = Arc::new(Semaphore::new(self.options.parallelism.max(1)));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut in_flight = 0usize;
    let mut fatal: Option<EngineError> = None;

    loop {
      while fatal.is_none() && !self.options.cancel.is_cancelled() {
        let Some(urn) = ready.pop_front() else { break };
        if !matches!(statuses.get(&urn), Some(NodeStatus::Runnable)) {
          continue;
        }
        let Some(record) = snapshot.get(&urn) else { continue };
        match self.dispatch_destroy(&urn, record, &execution_id, &semaphore, &tx) {
          Ok(()) => {
            statuses.insert(urn, NodeStatus::Applying);
            in_flight += 1;
          }
          Err(err) => {
            fatal = Some(err);
          }
        }
      }

      if in_flight == 0 {
        break;
      }

      let Some(completion) = rx.recv().await else { break };
      in_flight -= 1;

      let DestroyCompletion { urn, result } = completion;
      match result {
        Ok(()) => {
          if let Err(err) = self.store.remove(&urn).await {
            if fatal.is_none() {
              fatal = Some(EngineError::store(err));
            }
            continue;
          }
          info!(execution_id = %execution_id, urn = %urn, "node_deleted");
          statuses.insert(urn.clone(), NodeStatus::Deleted);
          report.deleted.push(urn.clone());

          for dep in dependencies.get(&urn).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(count) = waiting.get_mut(dep) {
              *count -= 1;
              if *count == 0 && matches!(statuses.get(dep), Some(NodeStatus::Pending)) {
                statuses.insert(dep.clone(), NodeStatus::Runnable);
                ready.push_back(dep.clone());
              }
            }
          }
        }
        Err(err) => {
          error!(execution_id = %execution_id, urn = %urn, error = %err, "node_failed");
          statuses.insert(urn.clone(), NodeStatus::Failed);
          report.failed.push(NodeFailure {
            urn: urn.clone(),
            error: err.to_string(),
          });

          // The resource still exists; record that explicitly.
          if let Some(record) = snapshot.get(&urn) {
            let mut record = record.clone();
            record.status = RecordStatus::Failed;
            record.updated_at = Utc::now();
            if let Err(err) = self.store.put(&urn, record).await {
              if fatal.is_none() {
                fatal = Some(EngineError::store(err));
              }
              continue;
            }
          }

          // Halt deletion of everything this resource still references,
          // or those would be orphaned while referenced.
          let mut queue: VecDeque<String> = dependencies
            .get(&urn)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default();
          while let Some(ancestor) = queue.pop_front() {
            if matches!(statuses.get(&ancestor), Some(NodeStatus::Pending)) {
              warn!(
                execution_id = %execution_id,
                urn = %ancestor,
                blocked_by = %urn,
                "node_blocked"
              );
              statuses.insert(ancestor.clone(), NodeStatus::Blocked);
              report.blocked.push(ancestor.clone());
              if let Some(deps) = dependencies.get(&ancestor) {
                queue.extend(deps.iter().cloned());
              }
            }
          }
        }
      }
    }

    for (urn, status) in &statuses {
      if matches!(status, NodeStatus::Pending | NodeStatus::Runnable) {
        report.skipped.push(urn.clone());
      }
    }
    report.skipped.sort();
    report.cancelled = self.options.cancel.is_cancelled();

    if let Some(err) = fatal {
      error!(execution_id = %execution_id, error = %err, "destroy_failed");
      return Err(err);
    }

    info!(
      execution_id = %execution_id,
      deleted = report.deleted.len(),
      failed = report.failed.len(),
      blocked = report.blocked.len(),
      "destroy_completed"
    );

    Ok(report)
  }

  fn dispatch_destroy(
    &self,
    urn: &str,
    record: &ResourceRecord,
    execution_id: &str,
    semaphore: &Arc<Semaphore>,
    tx: &mpsc::UnboundedSender<DestroyCompletion>,
  ) -> Result<(), EngineError> {
    let provider = self
      .providers
      .get(&record.kind)
      .ok_or_else(|| EngineError::UnknownKind {
        kind: record.kind.clone(),
      })?;

    info!(execution_id = %execution_id, urn = %urn, action = "delete", "node_started");

    let urn = urn.to_string();
    let spec = record.spec.clone();
    let outputs: Outputs = record.decoded_outputs().into_iter().collect();
    let cancel = self.options.cancel.child_token();
    let semaphore = semaphore.clone();
    let tx = tx.clone();

    tokio::spawn(async move {
      let Ok(_permit) = semaphore.acquire_owned().await else {
        return;
      };
      let result = provider.delete(&spec, &outputs, cancel).await;
      let _ = tx.send(DestroyCompletion { urn, result });
    });

    Ok(())
  }

  /// Emit the planned action for every node without any provider call.
  pub async fn preview(&self, graph: &ResourceGraph) -> Result<PreviewReport, EngineError> {
    let execution_id = Uuid::new_v4().to_string();
    let order = graph.topo_order()?;
    self.check_kinds(graph.nodes().map(|node| node.id().kind.as_str()))?;

    let snapshot = self.store.load().await.map_err(EngineError::store)?;

    info!(execution_id = %execution_id, nodes = graph.len(), "preview_started");

    let mut report = PreviewReport {
      execution_id,
      ..Default::default()
    };

    for id in order {
      let Some(node) = graph.node(&id) else { continue };
      let Some(provider) = self.providers.get(&id.kind) else {
        continue;
      };
      let urn = id.urn();

      let resolved = match node.spec().resolve(ResolveMode::Preview) {
        Ok(resolved) => resolved,
        Err(err) => {
          report.errors.push(NodeFailure {
            urn,
            error: err.to_string(),
          });
          continue;
        }
      };

      let record = snapshot.get(&urn);
      match plan(Some(&resolved), record, &provider.diff_policy()) {
        Ok(action) => {
          // Serve recorded outputs for unchanged nodes so dependents
          // preview against known values instead of unknown markers.
          if action == Action::NoOp {
            if let Some(record) = record {
              for (key, value) in record.decoded_outputs() {
                let _ = node.output_cell(&key).resolve(value);
              }
            }
          }
          debug!(urn = %urn, action = %action, "node_planned");
          report.actions.push(PlannedAction { urn, action });
        }
        Err(err) => {
          report.errors.push(NodeFailure {
            urn,
            error: err.to_string(),
          });
        }
      }
    }

    Ok(report)
  }

  fn check_kinds<'a>(&self, kinds: impl Iterator<Item = &'a str>) -> Result<(), EngineError> {
    for kind in kinds {
      if !self.providers.contains(kind) {
        return Err(EngineError::UnknownKind {
          kind: kind.to_string(),
        });
      }
    }
    Ok(())
  }
}

/// Mark a node failed and every transitive dependent blocked, without
/// invoking their providers.
fn fail_node(
  graph: &ResourceGraph,
  id: &NodeId,
  message: &str,
  statuses: &mut HashMap<NodeId, NodeStatus>,
  report: &mut RunReport,
  execution_id: &str,
) {
  let urn = id.urn();
  error!(execution_id = %execution_id, urn = %urn, error = %message, "node_failed");
  statuses.insert(id.clone(), NodeStatus::Failed);
  report.failed.push(NodeFailure {
    urn: urn.clone(),
    error: message.to_string(),
  });

  for descendant in graph.descendants(id) {
    if matches!(statuses.get(&descendant), Some(NodeStatus::Pending)) {
      warn!(
        execution_id = %execution_id,
        urn = %descendant.urn(),
        blocked_by = %urn,
        "node_blocked"
      );
      statuses.insert(descendant.clone(), NodeStatus::Blocked);
      report.blocked.push(descendant.urn());
    }
  }
}

/// Execute one node's chosen action inside a worker task.
#[allow(clippy::too_many_arguments)]
async fn run_action(
  provider: Arc<dyn Provider>,
  id: NodeId,
  action: Action,
  resolved: ResolvedSpec,
  record: Option<ResourceRecord>,
  dependencies: Vec<String>,
  secure: bool,
  refresh: bool,
  cancel: CancellationToken,
) -> Completion {
  let recorded_outputs: Outputs = record
    .as_ref()
    .map(|record| record.decoded_outputs().into_iter().collect())
    .unwrap_or_default();
  let old_spec = record
    .as_ref()
    .map(|record| record.spec.clone())
    .unwrap_or(Json::Null);

  let mut cleanup_error = None;
  let mut write_record = true;

  let result = match &action {
    Action::Create => provider.create(&resolved, cancel).await,
    Action::NoOp => {
      if refresh {
        provider.read(&recorded_outputs, cancel).await
      } else {
        write_record = false;
        Ok(recorded_outputs.clone())
      }
    }
    Action::Update { .. } => {
      provider
        .update(&old_spec, &resolved, &recorded_outputs, cancel)
        .await
    }
    Action::Replace {
      order: Replacement::DeleteBeforeCreate,
    } => match provider.delete(&old_spec, &recorded_outputs, cancel.clone()).await {
      Ok(()) => provider.create(&resolved, cancel).await,
      Err(err) => Err(err),
    },
    Action::Replace { .. } => match provider.create(&resolved, cancel.clone()).await {
      Ok(outputs) => {
        // The old resource is deleted only after its replacement exists.
        if let Err(err) = provider.delete(&old_spec, &recorded_outputs, cancel).await {
          cleanup_error = Some(err);
        }
        Ok(outputs)
      }
      Err(err) => Err(err),
    },
    Action::Delete => provider
      .delete(&old_spec, &recorded_outputs, cancel)
      .await
      .map(|()| Outputs::new()),
  };

  let outcome = result.map(|outputs| {
    let record = write_record.then(|| ResourceRecord {
      kind: id.kind.clone(),
      spec: resolved.redacted(),
      spec_hash: resolved.hash(),
      outputs: outputs
        .iter()
        .map(|(key, value)| (key.clone(), StoredValue::encode(value, secure)))
        .collect(),
      dependencies,
      status: RecordStatus::Applied,
      updated_at: Utc::now(),
    });
    CompletedWork { outputs, record }
  });

  Completion {
    id,
    action,
    outcome,
    cleanup_error,
  }
}

/// Register subscribers that collect stack exports as cells resolve.
fn subscribe_exports(graph: &ResourceGraph) -> Arc<StdMutex<BTreeMap<String, String>>> {
  let exports = Arc::new(StdMutex::new(BTreeMap::new()));
  for (name, reference) in graph.exports() {
    let sink = exports.clone();
    let name = name.clone();
    reference.cell().subscribe(move |value| {
      let mut sink = match sink.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
      };
      // Display is redaction-aware, so secret exports surface as markers.
      sink.insert(name, value.to_string());
    });
  }
  exports
}

/// Kahn's check over the recorded graph; defends against a corrupt or
/// hand-edited state file before any delete is issued.
fn verify_recorded_acyclic(
  dependents: &HashMap<String, Vec<String>>,
  dependencies: &HashMap<String, Vec<String>>,
) -> Result<(), EngineError> {
  let mut waiting: HashMap<&str, usize> = dependents
    .iter()
    .map(|(urn, entries)| (urn.as_str(), entries.len()))
    .collect();
  let mut queue: VecDeque<&str> = waiting
    .iter()
    .filter(|(_, count)| **count == 0)
    .map(|(urn, _)| *urn)
    .collect();

  let mut visited = 0usize;
  while let Some(urn) = queue.pop_front() {
    visited += 1;
    for dep in dependencies.get(urn).map(Vec::as_slice).unwrap_or(&[]) {
      if let Some(count) = waiting.get_mut(dep.as_str()) {
        *count -= 1;
        if *count == 0 {
          queue.push_back(dep.as_str());
        }
      }
    }
  }

  if visited == dependents.len() {
    Ok(())
  } else {
    let mut stuck: Vec<String> = waiting
      .into_iter()
      .filter(|(_, count)| *count > 0)
      .map(|(urn, _)| urn.to_string())
      .collect();
    stuck.sort();
    Err(EngineError::Graph(caravel_graph::GraphError::CycleDetected {
      nodes: stuck,
    }))
  }
}
