//! Sykli CI pipeline for kanari
//!
//! Run locally: sykli run
//! Or: cargo run --bin sykli --features sykli -- --emit | sykli run -

use sykli::{Condition, Pipeline, Template};

fn main() {
    let mut p = Pipeline::new();

    let src = p.dir(".");
    let cargo_registry = p.cache("cargo-registry");
    let cargo_git = p.cache("cargo-git");
    let target_cache = p.cache("target");

    let rust = Template::new()
        .container("rust:1.85")
        .mount_dir(&src, "/src")
        .mount_cache(&cargo_registry, "/usr/local/cargo/registry")
        .mount_cache(&cargo_git, "/usr/local/cargo/git")
        .mount_cache(&target_cache, "/src/target")
        .workdir("/src");

    let _ = p
        .task("test")
        .from(&rust)
        .run("cargo test --all-features")
        .inputs(&["**/*.rs", "Cargo.toml", "Cargo.lock"]);

    let _ = p
        .task("lint")
        .from(&rust)
        .run("cargo clippy --all-targets --all-features -- -D warnings")
        .inputs(&["**/*.rs", "Cargo.toml", "Cargo.lock"]);

    let _ = p
        .task("fmt")
        .from(&rust)
        .run("cargo fmt -- --check")
        .inputs(&["**/*.rs"]);

    // Plan schema for editor validation of plan files
    let _ = p
        .task("plan-schema")
        .from(&rust)
        .run("cargo run --bin gen-plan-schema > target/rollout-plan.schema.json")
        .inputs(&["src/model/*.rs", "src/bin/gen-plan-schema.rs", "Cargo.toml"])
        .output("schema", "target/rollout-plan.schema.json");

    let _ = p
        .task("build")
        .from(&rust)
        .run("cargo build --release --bin kanari")
        .inputs(&["**/*.rs", "Cargo.toml", "Cargo.lock"])
        .output("binary", "target/release/kanari")
        .after(&["test", "lint", "fmt"]);

    // Smoke test against ingress-nginx in kind
    let _ = p
        .task("integration-test")
        .container("ghcr.io/sykli/kind-runner:latest")
        .mount(&src, "/src")
        .workdir("/src")
        .run(
            r#"#!/bin/bash
set -e

kind create cluster --name kanari-ci
kubectl apply -f https://raw.githubusercontent.com/kubernetes/ingress-nginx/main/deploy/static/provider/kind/deploy.yaml
kubectl create namespace demo || true

printf '%s\n' \
  'service: demo' \
  'namespace: demo' \
  'stableRevision: demo-v1' \
  'canaryRevision: demo-v2' \
  'initialWeight: 10' \
  'stepSize: 30' \
  'stepInterval: 10s' \
  'successThreshold: 0.95' > /tmp/plan.yaml

./target/release/kanari render -f /tmp/plan.yaml | kubectl apply -f -

WEIGHT=$(kubectl get ingress -n demo demo-canary -o jsonpath='{.metadata.annotations.nginx\.ingress\.kubernetes\.io/canary-weight}')
if [ "$WEIGHT" != "10" ]; then
  echo "ERROR: rendered canary weight should be 10, got $WEIGHT"
  exit 1
fi

KANARI_PROMETHEUS_ADDRESS=http://127.0.0.1:9 RUST_LOG=info ./target/release/kanari serve 2>/tmp/kanari-log.txt &
KANARI_PID=$!
sleep 5

# Without Prometheus the stable preflight fails, so start is refused
set +e
./target/release/kanari start -f /tmp/plan.yaml
CODE=$?
set -e
if [ "$CODE" != "7" ]; then
  echo "ERROR: expected exit code 7 without Prometheus, got $CODE"
  cat /tmp/kanari-log.txt
  exit 1
fi

echo "Integration tests passed"

kill $KANARI_PID || true
kind delete cluster --name kanari-ci || true
"#,
        )
        .input_from("build", "binary", "/src/target/release/kanari")
        .when_cond(Condition::event("push").or(Condition::negate(Condition::branch("*"))))
        .timeout(600);

    p.emit();
}
