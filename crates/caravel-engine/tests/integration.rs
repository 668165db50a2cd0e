//! Integration tests for caravel-engine using a scripted in-memory adapter.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use caravel_engine::{Action, EngineError, RunOptions, Scheduler};
use caravel_graph::{Builder, ResolvedSpec, ResourceGraph, ResourceHandle, SpecValue};
use caravel_provider::{DiffPolicy, Outputs, Provider, ProviderError, ProviderRegistry, Replacement};
use caravel_state::{MemoryStore, RecordStatus, ResourceRecord, StateSnapshot, Store};
use caravel_value::{REDACTION_MARKER, Value};
use serde_json::{Value as Json, json};
use tokio_util::sync::CancellationToken;

/// Scripted adapter: records every call with its revealed inputs, fails on
/// demand, and emits one unique `generated` output per create.
#[derive(Default)]
struct TestProvider {
  policy: DiffPolicy,
  fail_create: HashSet<String>,
  fail_delete: HashSet<String>,
  serial: AtomicUsize,
  /// Operation log, entries like `create:a` in call order.
  log: Mutex<Vec<String>>,
  /// Revealed spec document per node name, as the adapter saw it.
  seen: Mutex<HashMap<String, Json>>,
  /// The `generated` output emitted per node name.
  produced: Mutex<HashMap<String, Json>>,
}

impl TestProvider {
  fn with_policy(policy: DiffPolicy) -> Self {
    Self {
      policy,
      ..Default::default()
    }
  }

  fn failing_create(names: &[&str]) -> Self {
    Self {
      fail_create: names.iter().map(ToString::to_string).collect(),
      ..Default::default()
    }
  }

  fn failing_delete(names: &[&str]) -> Self {
    Self {
      fail_delete: names.iter().map(ToString::to_string).collect(),
      ..Default::default()
    }
  }

  fn log(&self) -> Vec<String> {
    self.log.lock().unwrap().clone()
  }

  fn seen(&self, name: &str) -> Json {
    self.seen.lock().unwrap().get(name).cloned().unwrap_or(Json::Null)
  }

  fn produced(&self, name: &str) -> Json {
    self
      .produced
      .lock()
      .unwrap()
      .get(name)
      .cloned()
      .unwrap_or(Json::Null)
  }

  fn name_of(doc: &Json) -> String {
    doc["name"].as_str().unwrap_or("?").to_string()
  }

  fn record(&self, operation: &str, name: &str, doc: &Json) {
    self.log.lock().unwrap().push(format!("{operation}:{name}"));
    self
      .seen
      .lock()
      .unwrap()
      .insert(name.to_string(), doc.clone());
  }

  fn outputs_for(&self, name: &str, doc: &Json) -> Outputs {
    let serial = self.serial.fetch_add(1, Ordering::SeqCst);
    let generated = json!(format!("gen-{name}-{serial}"));
    self
      .produced
      .lock()
      .unwrap()
      .insert(name.to_string(), generated.clone());

    let mut outputs = Outputs::from([("generated".to_string(), Value::plain(generated))]);
    if doc["secret"] == json!(true) {
      outputs.insert(
        "result".to_string(),
        Value::secret(format!("s3cret-{name}-{serial}")),
      );
    }
    outputs
  }
}

#[async_trait]
impl Provider for TestProvider {
  async fn create(
    &self,
    spec: &ResolvedSpec,
    _cancel: CancellationToken,
  ) -> Result<Outputs, ProviderError> {
    let name = Self::name_of(spec.doc());
    self.record("create", &name, spec.doc());
    if self.fail_create.contains(&name) {
      return Err(ProviderError::failed(format!("create of {name} refused")));
    }
    Ok(self.outputs_for(&name, spec.doc()))
  }

  async fn update(
    &self,
    _old_spec: &Json,
    new_spec: &ResolvedSpec,
    _old_outputs: &Outputs,
    _cancel: CancellationToken,
  ) -> Result<Outputs, ProviderError> {
    let name = Self::name_of(new_spec.doc());
    self.record("update", &name, new_spec.doc());
    Ok(self.outputs_for(&name, new_spec.doc()))
  }

  async fn delete(
    &self,
    spec: &Json,
    _outputs: &Outputs,
    _cancel: CancellationToken,
  ) -> Result<(), ProviderError> {
    let name = Self::name_of(spec);
    self.record("delete", &name, spec);
    if self.fail_delete.contains(&name) {
      return Err(ProviderError::failed(format!("delete of {name} refused")));
    }
    Ok(())
  }

  fn diff_policy(&self) -> DiffPolicy {
    self.policy.clone()
  }
}

fn registry_with(provider: &Arc<TestProvider>) -> ProviderRegistry {
  let mut registry = ProviderRegistry::new();
  registry.register("test", provider.clone());
  registry
}

fn scheduler(provider: &Arc<TestProvider>) -> Scheduler<MemoryStore> {
  Scheduler::new(
    registry_with(provider),
    MemoryStore::new(),
    RunOptions::default(),
  )
}

/// Declare a node whose spec is just its own name.
fn declare(builder: &mut Builder, name: &str, deps: &[&ResourceHandle]) -> ResourceHandle {
  builder
    .declare(
      "test",
      name,
      |_| SpecValue::from_iter([("name", SpecValue::from(name))]),
      deps,
    )
    .expect("declare")
}

/// a → b → c plus an unrelated sibling d.
fn chain_with_sibling() -> ResourceGraph {
  let mut builder = Builder::new();
  let a = declare(&mut builder, "a", &[]);
  let b = declare(&mut builder, "b", &[&a]);
  let _c = declare(&mut builder, "c", &[&b]);
  let _d = declare(&mut builder, "d", &[]);
  builder.finish().expect("finish")
}

fn position(log: &[String], entry: &str) -> usize {
  log
    .iter()
    .position(|line| line == entry)
    .unwrap_or_else(|| panic!("'{entry}' not found in {log:?}"))
}

#[tokio::test]
async fn dispatch_order_respects_every_edge() {
  let provider = Arc::new(TestProvider::default());
  let engine = scheduler(&provider);

  let report = engine.apply(&chain_with_sibling()).await.expect("apply");
  assert!(report.success());
  assert_eq!(report.applied.len(), 4);

  let log = provider.log();
  assert!(position(&log, "create:a") < position(&log, "create:b"));
  assert!(position(&log, "create:b") < position(&log, "create:c"));
}

#[tokio::test]
async fn failure_isolates_to_its_branch() {
  let provider = Arc::new(TestProvider::failing_create(&["b"]));
  let engine = scheduler(&provider);

  let report = engine.apply(&chain_with_sibling()).await.expect("apply");

  assert!(!report.success());
  assert!(report.applied.contains(&"test::a".to_string()));
  assert!(report.applied.contains(&"test::d".to_string()));
  assert_eq!(report.failed.len(), 1);
  assert_eq!(report.failed[0].urn, "test::b");
  assert_eq!(report.blocked, vec!["test::c".to_string()]);

  // c's provider was never invoked.
  assert!(!provider.log().contains(&"create:c".to_string()));
}

#[tokio::test]
async fn second_apply_is_all_noop_with_identical_outputs() {
  let provider = Arc::new(TestProvider::default());
  let engine = scheduler(&provider);

  let build = || {
    let mut builder = Builder::new();
    let a = declare(&mut builder, "a", &[]);
    let generated = a.output("generated");
    builder
      .declare(
        "test",
        "b",
        |ctx| {
          SpecValue::from_iter([
            ("name", SpecValue::from("b")),
            ("input", ctx.read(&generated)),
          ])
        },
        &[],
      )
      .expect("declare b");
    builder.export("handle", a.output("generated"));
    builder.finish().expect("finish")
  };

  let first = engine.apply(&build()).await.expect("first apply");
  assert_eq!(first.applied.len(), 2);
  let creates_after_first = provider.log().len();

  let second = engine.apply(&build()).await.expect("second apply");
  assert!(second.applied.is_empty());
  assert_eq!(second.unchanged.len(), 2);

  // No further provider calls, and the exported output is byte-identical.
  assert_eq!(provider.log().len(), creates_after_first);
  assert_eq!(first.exports, second.exports);
}

#[tokio::test]
async fn resolved_output_is_substituted_into_dependent_spec() {
  // Namespace → {CRD install, Controller} → CustomResource, with the
  // custom resource's spec carrying the controller's generated output.
  let provider = Arc::new(TestProvider::default());
  let engine = scheduler(&provider);

  let mut builder = Builder::new();
  let namespace = declare(&mut builder, "namespace", &[]);
  let crds = declare(&mut builder, "crds", &[]);
  let controller = declare(&mut builder, "controller", &[&namespace, &crds]);
  let controller_name = controller.output("generated");
  builder
    .declare(
      "test",
      "custom-resource",
      |ctx| {
        SpecValue::from_iter([
          ("name", SpecValue::from("custom-resource")),
          ("controller", ctx.read(&controller_name)),
        ])
      },
      &[],
    )
    .expect("declare custom resource");
  let graph = builder.finish().expect("finish");

  let report = engine.apply(&graph).await.expect("apply");
  assert!(report.success());
  assert_eq!(report.applied.len(), 4);

  // The custom resource's provider call saw the controller's actual output.
  let seen = provider.seen("custom-resource");
  assert_eq!(seen["controller"], provider.produced("controller"));
}

#[tokio::test]
async fn secret_flows_raw_to_dependents_but_redacts_everywhere_else() {
  let provider = Arc::new(TestProvider::default());
  let engine = scheduler(&provider);

  let mut builder = Builder::new();
  let generator = builder
    .declare(
      "test",
      "generator",
      |_| {
        SpecValue::from_iter([
          ("name", SpecValue::from("generator")),
          ("secret", SpecValue::from(true)),
        ])
      },
      &[],
    )
    .expect("declare generator");
  let secret = generator.output("result");
  let secret_again = generator.output("result");

  // Two independent dependents consume the same secret concurrently.
  builder
    .declare(
      "test",
      "credential",
      |ctx| {
        SpecValue::from_iter([
          ("name", SpecValue::from("credential")),
          ("password", ctx.read(&secret)),
        ])
      },
      &[],
    )
    .expect("declare credential");
  builder
    .declare(
      "test",
      "workload",
      |ctx| {
        SpecValue::from_iter([
          ("name", SpecValue::from("workload")),
          ("password", ctx.read(&secret_again)),
        ])
      },
      &[],
    )
    .expect("declare workload");
  builder.export("admin-password", generator.output("result"));
  let graph = builder.finish().expect("finish");

  let report = engine.apply(&graph).await.expect("apply");
  assert!(report.success());

  // Both consumers received the identical raw payload.
  let credential_pw = provider.seen("credential")["password"].clone();
  let workload_pw = provider.seen("workload")["password"].clone();
  assert_eq!(credential_pw, workload_pw);
  let payload = credential_pw.as_str().expect("string payload");
  assert!(payload.starts_with("s3cret-generator"));

  // The exported form is redacted.
  assert_eq!(report.exports["admin-password"], REDACTION_MARKER);

  // Recorded state holds the raw payload only because the store is secure.
  let snapshot = engine.store().load().await.expect("load");
  let record = snapshot.get("test::generator").expect("record");
  let stored = serde_json::to_string(&record.outputs).expect("serialize");
  assert!(stored.contains(payload));
}

#[tokio::test]
async fn insecure_store_keeps_only_a_digest_of_secrets() {
  let provider = Arc::new(TestProvider::default());
  let engine = Scheduler::new(
    registry_with(&provider),
    MemoryStore::insecure(),
    RunOptions::default(),
  );

  let mut builder = Builder::new();
  builder
    .declare(
      "test",
      "generator",
      |_| {
        SpecValue::from_iter([
          ("name", SpecValue::from("generator")),
          ("secret", SpecValue::from(true)),
        ])
      },
      &[],
    )
    .expect("declare");
  let graph = builder.finish().expect("finish");

  engine.apply(&graph).await.expect("apply");

  let snapshot = engine.store().load().await.expect("load");
  let record = snapshot.get("test::generator").expect("record");
  let stored = serde_json::to_string(&record.outputs).expect("serialize");
  assert!(!stored.contains("s3cret-generator"));
}

#[tokio::test]
async fn destroy_deletes_dependents_first() {
  let provider = Arc::new(TestProvider::default());
  let engine = scheduler(&provider);

  let mut builder = Builder::new();
  let a = declare(&mut builder, "a", &[]);
  let b = declare(&mut builder, "b", &[&a]);
  let _c = declare(&mut builder, "c", &[&b]);
  let graph = builder.finish().expect("finish");

  engine.apply(&graph).await.expect("apply");
  let report = engine.destroy().await.expect("destroy");

  assert!(report.success());
  assert_eq!(report.deleted.len(), 3);
  assert!(engine.store().load().await.expect("load").is_empty());

  let log = provider.log();
  assert!(position(&log, "delete:c") < position(&log, "delete:b"));
  assert!(position(&log, "delete:b") < position(&log, "delete:a"));
}

#[tokio::test]
async fn failed_delete_blocks_its_dependencies() {
  let provider = Arc::new(TestProvider::failing_delete(&["b"]));
  let engine = scheduler(&provider);

  let mut builder = Builder::new();
  let a = declare(&mut builder, "a", &[]);
  let b = declare(&mut builder, "b", &[&a]);
  let _c = declare(&mut builder, "c", &[&b]);
  let graph = builder.finish().expect("finish");

  engine.apply(&graph).await.expect("apply");
  let report = engine.destroy().await.expect("destroy");

  assert!(!report.success());
  assert_eq!(report.deleted, vec!["test::c".to_string()]);
  assert_eq!(report.failed[0].urn, "test::b");
  assert_eq!(report.blocked, vec!["test::a".to_string()]);

  // a was never deleted and the failed node is explicitly recorded.
  let log = provider.log();
  assert!(!log.contains(&"delete:a".to_string()));
  let snapshot = engine.store().load().await.expect("load");
  assert!(snapshot.get("test::a").is_some());
  assert_eq!(
    snapshot.get("test::b").expect("record").status,
    RecordStatus::Failed
  );
}

#[tokio::test]
async fn recorded_cycle_aborts_destroy_before_any_delete() {
  let provider = Arc::new(TestProvider::default());

  let record = |deps: &[&str]| ResourceRecord {
    kind: "test".to_string(),
    spec: json!({ "name": "x" }),
    spec_hash: "h".to_string(),
    outputs: BTreeMap::new(),
    dependencies: deps.iter().map(ToString::to_string).collect(),
    status: RecordStatus::Applied,
    updated_at: chrono::Utc::now(),
  };
  let mut snapshot = StateSnapshot::default();
  snapshot
    .resources
    .insert("test::a".to_string(), record(&["test::b"]));
  snapshot
    .resources
    .insert("test::b".to_string(), record(&["test::a"]));

  let engine = Scheduler::new(
    registry_with(&provider),
    MemoryStore::with_snapshot(snapshot),
    RunOptions::default(),
  );

  let err = engine.destroy().await.expect_err("cycle expected");
  assert!(err.is_static());
  assert!(provider.log().is_empty());
}

#[tokio::test]
async fn preview_reports_actions_without_provider_calls() {
  let provider = Arc::new(TestProvider::default());
  let engine = scheduler(&provider);

  let mut builder = Builder::new();
  declare(&mut builder, "a", &[]);
  let graph = builder.finish().expect("finish");
  engine.apply(&graph).await.expect("apply");
  let calls_after_apply = provider.log().len();

  // Same a, plus a new b depending on it.
  let mut builder = Builder::new();
  let a = declare(&mut builder, "a", &[]);
  declare(&mut builder, "b", &[&a]);
  let graph = builder.finish().expect("finish");

  let preview = engine.preview(&graph).await.expect("preview");
  assert!(preview.errors.is_empty());
  assert_eq!(preview.action_for("test::a"), Some(&Action::NoOp));
  assert_eq!(preview.action_for("test::b"), Some(&Action::Create));
  assert_eq!(provider.log().len(), calls_after_apply);
}

#[tokio::test]
async fn changed_spec_replaces_create_before_delete_by_default() {
  let provider = Arc::new(TestProvider::default());
  let engine = scheduler(&provider);

  let build = |version: i64| {
    let mut builder = Builder::new();
    builder
      .declare(
        "test",
        "r",
        |_| {
          SpecValue::from_iter([
            ("name", SpecValue::from("r")),
            ("version", SpecValue::from(version)),
          ])
        },
        &[],
      )
      .expect("declare");
    builder.finish().expect("finish")
  };

  engine.apply(&build(1)).await.expect("first apply");
  let report = engine.apply(&build(2)).await.expect("second apply");
  assert!(report.success());

  let log = provider.log();
  assert_eq!(log, vec!["create:r", "create:r", "delete:r"]);
}

#[tokio::test]
async fn delete_before_create_replacement_order_is_honored() {
  let provider = Arc::new(TestProvider::with_policy(DiffPolicy::replace_only(
    Replacement::DeleteBeforeCreate,
  )));
  let engine = scheduler(&provider);

  let build = |version: i64| {
    let mut builder = Builder::new();
    builder
      .declare(
        "test",
        "singleton",
        |_| {
          SpecValue::from_iter([
            ("name", SpecValue::from("singleton")),
            ("version", SpecValue::from(version)),
          ])
        },
        &[],
      )
      .expect("declare");
    builder.finish().expect("finish")
  };

  engine.apply(&build(1)).await.expect("first apply");
  engine.apply(&build(2)).await.expect("second apply");

  let log = provider.log();
  assert_eq!(log, vec!["create:singleton", "delete:singleton", "create:singleton"]);
}

#[tokio::test]
async fn updatable_fields_update_in_place() {
  let provider = Arc::new(TestProvider::with_policy(DiffPolicy::updatable(["version"])));
  let engine = scheduler(&provider);

  let build = |version: i64| {
    let mut builder = Builder::new();
    builder
      .declare(
        "test",
        "svc",
        |_| {
          SpecValue::from_iter([
            ("name", SpecValue::from("svc")),
            ("version", SpecValue::from(version)),
          ])
        },
        &[],
      )
      .expect("declare");
    builder.finish().expect("finish")
  };

  engine.apply(&build(1)).await.expect("first apply");
  let report = engine.apply(&build(2)).await.expect("second apply");

  assert!(report.success());
  assert_eq!(provider.log(), vec!["create:svc", "update:svc"]);
}

#[tokio::test]
async fn forbidden_replacement_fails_the_node() {
  let provider = Arc::new(TestProvider::with_policy(DiffPolicy::replace_only(
    Replacement::Forbidden,
  )));
  let engine = scheduler(&provider);

  let build = |version: i64| {
    let mut builder = Builder::new();
    builder
      .declare(
        "test",
        "pinned",
        |_| {
          SpecValue::from_iter([
            ("name", SpecValue::from("pinned")),
            ("version", SpecValue::from(version)),
          ])
        },
        &[],
      )
      .expect("declare");
    builder.finish().expect("finish")
  };

  engine.apply(&build(1)).await.expect("first apply");
  let report = engine.apply(&build(2)).await.expect("second apply");

  assert!(!report.success());
  assert_eq!(report.failed[0].urn, "test::pinned");
  assert!(report.failed[0].error.contains("replacement"));
  // Only the original create ever reached the provider.
  assert_eq!(provider.log(), vec!["create:pinned"]);
}

#[tokio::test]
async fn cancelled_run_dispatches_nothing() {
  let provider = Arc::new(TestProvider::default());
  let cancel = CancellationToken::new();
  cancel.cancel();

  let engine = Scheduler::new(
    registry_with(&provider),
    MemoryStore::new(),
    RunOptions {
      cancel,
      ..Default::default()
    },
  );

  let report = engine.apply(&chain_with_sibling()).await.expect("apply");
  assert!(report.cancelled);
  assert_eq!(report.skipped.len(), 4);
  assert!(provider.log().is_empty());
}

#[tokio::test]
async fn state_file_is_parseable_after_a_failed_run() {
  use caravel_state::JsonFileStore;

  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("state.json");
  let store = JsonFileStore::open(&path, true).await.expect("open");

  let provider = Arc::new(TestProvider::failing_create(&["b"]));
  let engine = Scheduler::new(registry_with(&provider), store, RunOptions::default());

  let report = engine.apply(&chain_with_sibling()).await.expect("apply");
  assert!(!report.success());

  // Every node that did complete was recorded atomically before the run
  // ended; the file on disk parses as-is.
  let reopened = JsonFileStore::open(&path, true).await.expect("reopen");
  let snapshot = reopened.load().await.expect("load");
  assert!(snapshot.get("test::a").is_some());
  assert!(snapshot.get("test::d").is_some());
  assert!(snapshot.get("test::b").is_none());
  assert!(snapshot.get("test::c").is_none());
}

#[tokio::test]
async fn unknown_kind_is_a_static_error() {
  let provider = Arc::new(TestProvider::default());
  let engine = scheduler(&provider);

  let mut builder = Builder::new();
  builder
    .declare(
      "kubernetes",
      "cluster",
      |_| SpecValue::from_iter([("name", SpecValue::from("cluster"))]),
      &[],
    )
    .expect("declare");
  let graph = builder.finish().expect("finish");

  let err = engine.apply(&graph).await.expect_err("must fail");
  assert!(err.is_static());
  assert!(matches!(err, EngineError::UnknownKind { kind } if kind == "kubernetes"));
  assert!(provider.log().is_empty());
}
