//! # Reconciler Tests
//!
//! Reconcile Kustomizations against an in-memory store, a fixed source
//! resolver and a fake sync pipeline, then check the persisted `Ready`
//! condition and the requeue decision taken by the error policy.

mod common;

use common::{
    artifact, basic_spec, kustomization, leftover_entries, pipeline, FakeExecutor, FakeFetcher,
    InMemoryStore, Reply, SourceAnswer, Stage, StaticResolver, NAME, NAMESPACE,
};
use kube_runtime::controller::Action;
use kustomize_controller::constants::SYNC_AT_ANNOTATION;
use kustomize_controller::controller::reconciler::{ReconcileError, Reconciler, SourceError};
use kustomize_controller::crd::Kustomization;
use kustomize_controller::runtime::error_policy::{handle_reconciliation_error, resource_key};
use kustomize_controller::runtime::watch_loop::reconcile_kustomization;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const RECONCILE_TIMEOUT: Duration = Duration::from_secs(15);

struct Harness {
    reconciler: Arc<Reconciler>,
    store: Arc<InMemoryStore>,
    resolver: Arc<StaticResolver>,
    fetcher: Arc<FakeFetcher>,
    executor: Arc<FakeExecutor>,
    workspaces: tempfile::TempDir,
}

impl Harness {
    fn new(obj: Kustomization, answer: SourceAnswer) -> Self {
        let workspaces = tempfile::tempdir().expect("workspace root");
        let store = Arc::new(InMemoryStore::with(obj));
        let resolver = Arc::new(StaticResolver::new(answer));
        let fetcher = Arc::new(FakeFetcher::new());
        let executor = Arc::new(FakeExecutor::new());
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store) as _,
            Arc::clone(&resolver) as _,
            pipeline(workspaces.path(), Arc::clone(&fetcher), Arc::clone(&executor)),
            RECONCILE_TIMEOUT,
        ));
        Self {
            reconciler,
            store,
            resolver,
            fetcher,
            executor,
            workspaces,
        }
    }

    fn ready(obj: Kustomization) -> Self {
        Self::new(obj, SourceAnswer::Ready(artifact()))
    }

    async fn reconcile(&self) -> Result<Option<Duration>, ReconcileError> {
        self.reconciler.reconcile(NAMESPACE, NAME).await
    }

    fn error_action(&self, error: &ReconcileError) -> Action {
        let obj = self.current();
        handle_reconciliation_error(Arc::new(obj), error, Arc::clone(&self.reconciler))
    }

    fn current(&self) -> Kustomization {
        let mut obj = kustomization(basic_spec());
        obj.status = self.store.status_writes().last().cloned();
        obj
    }

    fn workspace_root(&self) -> &Path {
        self.workspaces.path()
    }
}

fn ready_condition(status: &kustomize_controller::crd::KustomizationStatus) -> (String, String, String) {
    let condition = status.ready_condition().expect("Ready condition");
    (
        condition.status.clone(),
        condition.reason.clone().unwrap_or_default(),
        condition.message.clone().unwrap_or_default(),
    )
}

#[tokio::test]
async fn test_successful_reconcile_requeues_at_interval() {
    let harness = Harness::ready(kustomization(basic_spec()));

    let next = harness.reconcile().await.expect("reconcile should succeed");

    assert_eq!(next, Some(Duration::from_secs(300)));
    let status = harness.store.last_status();
    assert_eq!(
        ready_condition(&status),
        (
            "True".to_string(),
            "ApplySucceed".to_string(),
            "kustomization was successfully applied".to_string()
        )
    );
    assert_eq!(status.conditions.len(), 1);
    assert_eq!(status.observed_generation, Some(1));
    assert_eq!(status.last_applied_revision.as_deref(), Some("main/6f0a2b1"));
    assert!(leftover_entries(harness.workspace_root()).is_empty());
}

#[tokio::test]
async fn test_missing_resource_needs_no_work() {
    let harness = Harness::ready(kustomization(basic_spec()));

    let next = harness
        .reconciler
        .reconcile(NAMESPACE, "deleted")
        .await
        .expect("missing resource is not an error");

    assert_eq!(next, None);
    assert!(harness.store.status_writes().is_empty());
    assert_eq!(harness.resolver.calls(), 0);
}

#[tokio::test]
async fn test_suspended_resource_is_never_synced() {
    let mut spec = basic_spec();
    spec["suspend"] = serde_json::json!(true);
    let harness = Harness::ready(kustomization(spec));

    let next = harness.reconcile().await.expect("suspend is not an error");

    assert_eq!(next, None);
    let (status, reason, _) = ready_condition(&harness.store.last_status());
    assert_eq!(status, "False");
    assert_eq!(reason, "Suspended");
    assert_eq!(harness.resolver.calls(), 0);
    assert!(harness.fetcher.destinations().is_empty());
    assert!(harness.executor.invocations().is_empty());
}

#[tokio::test]
async fn test_source_without_artifact_waits_for_source() {
    let harness = Harness::new(kustomization(basic_spec()), SourceAnswer::NotReady);

    let next = harness.reconcile().await.expect("not-ready source is not an error");

    assert_eq!(next, None);
    assert_eq!(
        ready_condition(&harness.store.last_status()),
        (
            "False".to_string(),
            "ArtifactFailed".to_string(),
            "Source is not ready".to_string()
        )
    );
    assert!(harness.fetcher.destinations().is_empty());
    assert!(harness.executor.invocations().is_empty());
    assert!(leftover_entries(harness.workspace_root()).is_empty());
}

#[tokio::test]
async fn test_unsupported_source_kind_is_not_persisted() {
    let mut spec = basic_spec();
    spec["sourceRef"]["kind"] = serde_json::json!("HelmRepository");
    let harness = Harness::ready(kustomization(spec));

    let error = harness
        .reconcile()
        .await
        .expect_err("unsupported kind should fail");

    assert!(matches!(
        error,
        ReconcileError::Source(SourceError::UnsupportedKind { .. })
    ));
    assert_eq!(
        error.to_string(),
        "source `podinfo` kind 'HelmRepository' not supported"
    );
    assert!(harness.store.status_writes().is_empty());
    assert!(harness.executor.invocations().is_empty());
}

#[tokio::test]
async fn test_source_lookup_failure_backs_off() {
    let harness = Harness::new(
        kustomization(basic_spec()),
        SourceAnswer::LookupFailure("gitrepositories.source.toolkit.fluxcd.io \"podinfo\" not found".to_string()),
    );

    let error = harness.reconcile().await.expect_err("lookup should fail");

    assert!(matches!(error, ReconcileError::Source(_)));
    assert!(harness.store.status_writes().is_empty());
    assert_eq!(harness.error_action(&error), Action::requeue(Duration::from_secs(60)));
    assert_eq!(harness.error_action(&error), Action::requeue(Duration::from_secs(60)));
    assert_eq!(harness.error_action(&error), Action::requeue(Duration::from_secs(120)));
}

#[tokio::test]
async fn test_invalid_interval_waits_for_spec_change() {
    let mut spec = basic_spec();
    spec["interval"] = serde_json::json!("every five minutes");
    let harness = Harness::ready(kustomization(spec));

    let error = harness.reconcile().await.expect_err("invalid interval should fail");

    assert!(matches!(error, ReconcileError::InvalidInterval(_)));
    let (status, reason, _) = ready_condition(&harness.store.last_status());
    assert_eq!(status, "False");
    assert_eq!(reason, "ValidationFailed");
    assert!(harness.executor.invocations().is_empty());
    assert_eq!(harness.error_action(&error), Action::await_change());
}

#[tokio::test]
async fn test_status_write_failure_requeues_immediately() {
    let harness = Harness::ready(kustomization(basic_spec()));
    harness.store.fail_updates(true);

    let error = harness.reconcile().await.expect_err("status write should fail");

    assert!(matches!(error, ReconcileError::PersistStatus(_)));
    assert!(error.requeue_immediately());
    assert_eq!(harness.error_action(&error), Action::requeue(Duration::ZERO));
}

#[tokio::test]
async fn test_sync_failure_keeps_last_applied_revision() {
    let harness = Harness::ready(kustomization(basic_spec()));
    harness.reconcile().await.expect("first reconcile should succeed");

    harness
        .executor
        .reply(Stage::Build, Reply::fail(1, "Error: no matches for Id Deployment"));
    let error = harness.reconcile().await.expect_err("build should fail");

    assert!(matches!(error, ReconcileError::Sync { .. }));
    let status = harness.store.last_status();
    let (ready, reason, message) = ready_condition(&status);
    assert_eq!(ready, "False");
    assert_eq!(reason, "BuildFailed");
    assert!(message.contains("no matches for Id Deployment"));
    assert_eq!(status.last_applied_revision.as_deref(), Some("main/6f0a2b1"));
    assert!(leftover_entries(harness.workspace_root()).is_empty());
}

#[tokio::test]
async fn test_sync_failure_retry_is_capped_by_interval() {
    let mut spec = basic_spec();
    spec["interval"] = serde_json::json!("30s");
    let harness = Harness::ready(kustomization(spec));
    harness.executor.reply(Stage::Apply, Reply::fail(1, "error: connection refused"));

    let error = harness.reconcile().await.expect_err("apply should fail");

    assert_eq!(error.retry_cap(), Some(Duration::from_secs(30)));
    assert_eq!(harness.error_action(&error), Action::requeue(Duration::from_secs(30)));
}

#[tokio::test]
async fn test_status_only_event_is_deferred_until_due() {
    let harness = Harness::ready(kustomization(basic_spec()));
    let obj = Arc::new(harness.current());

    let action = reconcile_kustomization(Arc::clone(&obj), Arc::clone(&harness.reconciler))
        .await
        .expect("first reconcile should succeed");
    assert_eq!(action, Action::requeue(Duration::from_secs(300)));
    assert_eq!(harness.executor.requests_for(Stage::Apply).len(), 1);

    // The status write comes back as an event with an unchanged generation
    let echoed = Arc::new(harness.current());
    assert_eq!(
        echoed.status.as_ref().and_then(|s| s.observed_generation),
        Some(1)
    );
    let action = reconcile_kustomization(Arc::clone(&echoed), Arc::clone(&harness.reconciler))
        .await
        .expect("deferred event is not an error");
    assert_ne!(action, Action::await_change());
    assert_eq!(harness.executor.requests_for(Stage::Apply).len(), 1);

    // A source change is not deferred
    harness
        .reconciler
        .schedule
        .mark_source_trigger(&resource_key(NAMESPACE, NAME));
    reconcile_kustomization(echoed, Arc::clone(&harness.reconciler))
        .await
        .expect("source-triggered reconcile should succeed");
    assert_eq!(harness.executor.requests_for(Stage::Apply).len(), 2);
}

#[tokio::test]
async fn test_sync_at_annotation_bypasses_deferral_once() {
    let harness = Harness::ready(kustomization(basic_spec()));
    reconcile_kustomization(Arc::new(harness.current()), Arc::clone(&harness.reconciler))
        .await
        .expect("first reconcile should succeed");
    assert_eq!(harness.executor.requests_for(Stage::Apply).len(), 1);

    let with_sync_at = |value: &str| {
        let mut obj = harness.current();
        obj.metadata.annotations = Some(
            [(SYNC_AT_ANNOTATION.to_string(), value.to_string())]
                .into_iter()
                .collect(),
        );
        Arc::new(obj)
    };

    // Annotation edits keep the generation, so this looks like a status-only event
    let requested = with_sync_at("2020-05-01T10:00:00Z");
    assert_eq!(requested.metadata.generation, Some(1));
    reconcile_kustomization(Arc::clone(&requested), Arc::clone(&harness.reconciler))
        .await
        .expect("requested sync should succeed");
    assert_eq!(harness.executor.requests_for(Stage::Apply).len(), 2);

    // The status write echoes the same annotation value back
    let echoed = with_sync_at("2020-05-01T10:00:00Z");
    let action = reconcile_kustomization(echoed, Arc::clone(&harness.reconciler))
        .await
        .expect("deferred event is not an error");
    assert_ne!(action, Action::await_change());
    assert_eq!(harness.executor.requests_for(Stage::Apply).len(), 2);

    reconcile_kustomization(with_sync_at("2020-05-01T11:00:00Z"), Arc::clone(&harness.reconciler))
        .await
        .expect("second requested sync should succeed");
    assert_eq!(harness.executor.requests_for(Stage::Apply).len(), 3);
}

#[tokio::test]
async fn test_success_resets_backoff() {
    let harness = Harness::ready(kustomization(basic_spec()));
    harness.executor.reply(Stage::Apply, Reply::fail(1, "error: connection refused"));

    let error = harness.reconcile().await.expect_err("apply should fail");
    harness.error_action(&error);
    harness.error_action(&error);
    harness.error_action(&error);

    harness.executor.reply(Stage::Apply, Reply::ok("namespace/dev unchanged\n"));
    let mut obj = harness.current();
    obj.metadata.generation = Some(2);
    reconcile_kustomization(Arc::new(obj), Arc::clone(&harness.reconciler))
        .await
        .expect("reconcile should succeed");

    let states = harness
        .reconciler
        .backoff_states
        .lock()
        .expect("backoff states lock");
    let state = states
        .get(&resource_key(NAMESPACE, NAME))
        .expect("backoff state recorded");
    assert_eq!(state.error_count, 0);
    assert_eq!(state.backoff.attempts(), 0);
}
