//! The deployment program executed by `caravel up`: a local k3d cluster
//! with the kube-prometheus stack, cert-manager, the Redpanda operator, a
//! Redpanda cluster, and a Redpanda Connect producer wired to a generated
//! admin password.
//!
//! Everything below is plain declaration: reading another resource's output
//! (the kubeconfig, the epoch, the password) registers the dependency that
//! orders the run.

use std::collections::BTreeMap;

use caravel_graph::{Builder, GraphError, OutputRef, ResourceGraph, ResourceHandle, SpecValue};
use serde_json::json;

const CLUSTER_NAME: &str = "tco-benchmark-cluster";

const REDPANDA_CLUSTER_MANIFEST: &str = r#"apiVersion: cluster.redpanda.com/v1alpha2
kind: Redpanda
metadata:
  name: redpanda
  namespace: redpanda
spec:
  clusterSpec:
    image:
      repository: redpandadata/redpanda-nightly
      tag: v0.0.0-20250818gitd20fd33
    config:
      cluster:
        development_enable_cloud_topics: true
        enable_developmental_unrecoverable_data_corrupting_features: "${CLUSTER_EPOCH}"
    statefulset:
      replicas: 3
"#;

const ADMIN_USER_MANIFEST: &str = r#"apiVersion: cluster.redpanda.com/v1alpha2
kind: User
metadata:
  name: admin
  namespace: redpanda
spec:
  cluster:
    clusterRef:
      name: redpanda
  authentication:
    type: scram-sha-256
    password:
      valueFrom:
        secretKeyRef:
          name: redpanda-admin-user-password
          key: password
  authorization:
    acls:
      - type: allow
        resource:
          type: topic
          name: "*"
          patternType: prefixed
        operations: [Read, Write, Create, Delete, Alter, Describe, DescribeConfigs]
      - type: allow
        resource:
          type: group
          name: "*"
          patternType: prefixed
        operations: [Read, Delete, Describe]
"#;

const PRODUCER_DEPLOYMENT_MANIFEST: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: rpcn-producer
  namespace: redpanda
spec:
  replicas: 1
  selector:
    matchLabels:
      app: rpcn-producer
  template:
    metadata:
      labels:
        app: rpcn-producer
    spec:
      containers:
        - name: rpcn
          image: redpandadata/connect:4
          args: [run, /etc/redpanda-connect/config.yaml]
          volumeMounts:
            - name: config-volume
              mountPath: /etc/redpanda-connect/
              readOnly: true
          env:
            - name: REDPANDA_BROKERS
              value: redpanda-0.redpanda.redpanda.svc.cluster.local.:9093
            - name: REDPANDA_CA
              valueFrom:
                secretKeyRef:
                  name: redpanda-default-root-certificate
                  key: ca.crt
            - name: REDPANDA_USER
              value: admin
            - name: REDPANDA_PASS
              valueFrom:
                secretKeyRef:
                  name: redpanda-admin-user-password
                  key: password
      volumes:
        - name: config-volume
          configMap:
            name: rpcn-producer-config
            items:
              - key: config.yaml
                path: config.yaml
"#;

/// Build the full deployment graph.
pub fn deployment() -> Result<ResourceGraph, GraphError> {
  let mut builder = Builder::new();

  let cluster = builder.declare(
    "command",
    "create-k3d-cluster",
    |_| {
      SpecValue::from_iter([
        (
          "create",
          SpecValue::from(format!(
            "k3d cluster create {CLUSTER_NAME} --agents=5 --wait --timeout=3m \
             --kubeconfig-update-default=false --kubeconfig-switch-context=false"
          )),
        ),
        (
          "delete",
          SpecValue::from(format!("k3d cluster delete {CLUSTER_NAME}")),
        ),
        ("interpreter", bash_interpreter()),
      ])
    },
    &[],
  )?;

  let kubeconfig_cmd = builder.declare(
    "command",
    "get-k3d-kubeconfig",
    |_| {
      SpecValue::from_iter([
        (
          "create",
          SpecValue::from(format!("k3d kubeconfig get {CLUSTER_NAME}")),
        ),
        ("interpreter", bash_interpreter()),
      ])
    },
    &[&cluster],
  )?;
  let kubeconfig = kubeconfig_cmd.output("stdout");

  let prometheus_ns = kube_command(
    &mut builder,
    "prometheus-namespace",
    "kubectl create namespace prometheus",
    Some("kubectl delete namespace prometheus --ignore-not-found"),
    &kubeconfig,
    &[],
    &[],
  )?;

  let prometheus = kube_command(
    &mut builder,
    "prometheus",
    "kubectl apply -k ./assets/prometheus/",
    Some("kubectl delete -k ./assets/prometheus/ --ignore-not-found"),
    &kubeconfig,
    &[],
    &[&prometheus_ns],
  )?;

  let cert_manager_ns = kube_command(
    &mut builder,
    "cert-manager-namespace",
    "kubectl create namespace cert-manager",
    Some("kubectl delete namespace cert-manager --ignore-not-found"),
    &kubeconfig,
    &[],
    &[],
  )?;

  let cert_manager = kube_command(
    &mut builder,
    "cert-manager-chart",
    "helm upgrade --install cert-manager cert-manager \
     --repo https://charts.jetstack.io --namespace cert-manager \
     --version v1.16.1 --set crds.enabled=true --wait",
    Some("helm uninstall cert-manager --namespace cert-manager"),
    &kubeconfig,
    &[],
    &[&cert_manager_ns, &prometheus],
  )?;

  let redpanda_ns = kube_command(
    &mut builder,
    "redpanda-namespace",
    "kubectl create namespace redpanda",
    Some("kubectl delete namespace redpanda --ignore-not-found"),
    &kubeconfig,
    &[],
    &[],
  )?;

  let redpanda_controller = kube_command(
    &mut builder,
    "redpanda-controller",
    "helm upgrade --install redpanda-controller operator \
     --repo https://charts.redpanda.com --namespace redpanda \
     --version 25.1.3 --set crds.enabled=true --wait",
    Some("helm uninstall redpanda-controller --namespace redpanda"),
    &kubeconfig,
    &[],
    &[&cert_manager, &prometheus, &redpanda_ns],
  )?;

  let epoch = builder.declare(
    "command",
    "unix-timestamp",
    |_| SpecValue::from_iter([("create", SpecValue::from("date +%s"))]),
    &[],
  )?;
  let epoch_out = epoch.output("stdout");

  let redpanda_cluster = kube_command(
    &mut builder,
    "redpanda-cluster",
    &format!("kubectl apply -f - <<EOF\n{REDPANDA_CLUSTER_MANIFEST}EOF"),
    Some("kubectl delete redpandas.cluster.redpanda.com redpanda --namespace redpanda --ignore-not-found"),
    &kubeconfig,
    &[("CLUSTER_EPOCH", &epoch_out)],
    &[&redpanda_controller],
  )?;

  let password = builder.declare(
    "random",
    "admin-password",
    |_| {
      SpecValue::from_iter([
        ("length", SpecValue::from(16_i64)),
        ("special", SpecValue::from(true)),
      ])
    },
    &[],
  )?;
  let password_out = password.output("result");

  let password_secret = kube_command(
    &mut builder,
    "redpanda-admin-user-password",
    "kubectl create secret generic redpanda-admin-user-password \
     --namespace redpanda --from-literal=password=\"$ADMIN_PASSWORD\"",
    Some("kubectl delete secret redpanda-admin-user-password --namespace redpanda --ignore-not-found"),
    &kubeconfig,
    &[("ADMIN_PASSWORD", &password_out)],
    &[&redpanda_ns],
  )?;

  let admin_user = kube_command(
    &mut builder,
    "redpanda-admin-user",
    &format!("kubectl apply -f - <<EOF\n{ADMIN_USER_MANIFEST}EOF"),
    Some("kubectl delete users.cluster.redpanda.com admin --namespace redpanda --ignore-not-found"),
    &kubeconfig,
    &[],
    &[&redpanda_cluster, &password_secret],
  )?;

  let producer_config = kube_command(
    &mut builder,
    "rpcn-producer-config",
    "kubectl create configmap rpcn-producer-config --namespace redpanda \
     --from-file=config.yaml=./assets/rpcn/simple-producer.yaml",
    Some("kubectl delete configmap rpcn-producer-config --namespace redpanda --ignore-not-found"),
    &kubeconfig,
    &[],
    &[&redpanda_ns],
  )?;

  kube_command(
    &mut builder,
    "rpcn-producer",
    &format!("kubectl apply -f - <<EOF\n{PRODUCER_DEPLOYMENT_MANIFEST}EOF"),
    Some("kubectl delete deployment rpcn-producer --namespace redpanda --ignore-not-found"),
    &kubeconfig,
    &[],
    &[&admin_user, &producer_config],
  )?;

  builder.export("kubeconfig", kubeconfig.clone());
  builder.export("admin-password", password.output("result"));

  builder.finish()
}

/// Declare a command node that runs against the cluster: the kubeconfig is
/// materialized to a temp file for the duration of the command.
fn kube_command(
  builder: &mut Builder,
  name: &str,
  create: &str,
  delete: Option<&str>,
  kubeconfig: &OutputRef,
  extra_env: &[(&str, &OutputRef)],
  depends_on: &[&ResourceHandle],
) -> Result<ResourceHandle, GraphError> {
  builder.declare(
    "command",
    name,
    |ctx| {
      let mut env = BTreeMap::from([("KUBECONFIG_DATA".to_string(), ctx.read(kubeconfig))]);
      for (key, reference) in extra_env {
        env.insert((*key).to_string(), ctx.read(reference));
      }

      let mut fields = BTreeMap::from([
        ("create".to_string(), SpecValue::from(with_kubeconfig(create))),
        ("interpreter".to_string(), bash_interpreter()),
        ("env".to_string(), SpecValue::Map(env)),
      ]);
      if let Some(delete) = delete {
        fields.insert("delete".to_string(), SpecValue::from(with_kubeconfig(delete)));
      }
      SpecValue::Map(fields)
    },
    depends_on,
  )
}

fn with_kubeconfig(command: &str) -> String {
  format!(
    "KUBECONFIG=\"$(mktemp)\"; trap 'rm -f \"$KUBECONFIG\"' EXIT; \
     printf '%s' \"$KUBECONFIG_DATA\" > \"$KUBECONFIG\"; export KUBECONFIG; {command}"
  )
}

fn bash_interpreter() -> SpecValue {
  SpecValue::from(json!(["/bin/bash", "-c"]))
}
