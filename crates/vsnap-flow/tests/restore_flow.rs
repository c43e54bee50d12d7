//! End-to-end restore tests against the in-memory control plane.

#![allow(clippy::expect_used)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use vsnap_flow::clone::{CloneOrchestrator, build_clone_request};
use vsnap_flow::config::ObservationConfig;
use vsnap_flow::error::Error;
use vsnap_flow::phase::RequestKind;
use vsnap_flow::remap::NamespaceMapping;
use vsnap_flow::restore_action::{
    PVC_RESOURCE, PvcRestoreAction, RESTORED_HANDLE_ANNOTATION, RestoreItemInput,
};
use vsnap_flow::snapshot::{
    ResourceHandle, SNAPSHOT_ANNOTATION, SnapshotDescriptor, SnapshotMeta, SnapshotSpec,
    SnapshotStatus,
};
use vsnap_flow::store::RequestStore;
use vsnap_flow::store::memory::{ControlPlaneScript, FaultConfig, InMemoryRequestStore};
use vsnap_flow::waiter::TerminalWaiter;

const CLONE_DEADLINE: Duration = Duration::from_secs(600);

fn snapshot(claim: &str, snapshot_id: &str) -> SnapshotDescriptor {
    SnapshotDescriptor {
        metadata: SnapshotMeta {
            name: format!("snap-{claim}"),
            namespace: "demo-app".into(),
            labels: BTreeMap::new(),
        },
        spec: SnapshotSpec {
            resource_handle: ResourceHandle {
                api_group: None,
                kind: "PersistentVolumeClaim".into(),
                name: claim.into(),
                namespace: Some("demo-app".into()),
            },
            backup_repository: "br-default".into(),
        },
        status: SnapshotStatus {
            phase: "Uploaded".into(),
            snapshot_id: snapshot_id.into(),
            metadata: format!(r#"{{"metadata":{{"name":"{claim}","namespace":"demo-app"}}}}"#)
                .into_bytes(),
        },
    }
}

fn orchestrator(store: &InMemoryRequestStore) -> CloneOrchestrator {
    let waiter = TerminalWaiter::new(
        Arc::new(store.clone()),
        ObservationConfig {
            poll_interval: Duration::from_secs(1),
            poll_retry_budget: 3,
        },
    );
    CloneOrchestrator::new(waiter, CLONE_DEADLINE)
}

fn claim_item(claim: &str, annotation: Option<String>) -> serde_json::Value {
    let mut annotations = serde_json::Map::new();
    if let Some(text) = annotation {
        annotations.insert(SNAPSHOT_ANNOTATION.into(), text.into());
    }
    json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "name": claim,
            "namespace": "demo-app",
            "annotations": annotations,
        },
        "spec": {"accessModes": ["ReadWriteOnce"]},
    })
}

fn mapping(from: &str, to: &str) -> NamespaceMapping {
    let mut mapping = NamespaceMapping::new();
    mapping.insert(from.into(), to.into());
    mapping
}

#[tokio::test(start_paused = true)]
async fn clone_from_snapshot_returns_restored_handle() {
    let store = InMemoryRequestStore::new();
    store
        .script(
            RequestKind::Clone,
            ControlPlaneScript::new()
                .then_phase(Duration::from_secs(2), "InProgress")
                .then_complete(Duration::from_secs(30), "pvc-restored-1"),
        )
        .expect("script");

    let handle = orchestrator(&store)
        .restore_from_snapshot(&snapshot("data-0", "snap-123"), "demo-app", &NamespaceMapping::new())
        .await
        .expect("restore");
    assert_eq!(handle, "pvc-restored-1");

    let clones = store.objects(RequestKind::Clone).expect("objects");
    assert_eq!(clones.len(), 1);
    assert_eq!(clones[0].descriptor.source().snapshot_id, "snap-123");
    assert_eq!(clones[0].key().namespace(), "demo-app");
}

#[tokio::test(start_paused = true)]
async fn clone_failure_message_is_verbatim() {
    let store = InMemoryRequestStore::new();
    store
        .script(
            RequestKind::Clone,
            ControlPlaneScript::new()
                .then_phase(Duration::from_secs(1), "InProgress")
                .then_fail(Duration::from_secs(5), "Failed to create volume: quota exceeded"),
        )
        .expect("script");

    let err = orchestrator(&store)
        .restore_from_snapshot(&snapshot("data-0", "snap-123"), "demo-app", &NamespaceMapping::new())
        .await
        .expect_err("clone should fail");
    assert!(err.is_terminal_failure());
    match err {
        Error::TerminalFailure { message, .. } => {
            assert_eq!(message, "Failed to create volume: quota exceeded");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn stuck_clone_times_out() {
    let store = InMemoryRequestStore::new();
    store
        .script(
            RequestKind::Clone,
            ControlPlaneScript::new().then_phase(Duration::from_secs(1), "InProgress"),
        )
        .expect("script");

    let started = tokio::time::Instant::now();
    let err = orchestrator(&store)
        .restore_from_snapshot(&snapshot("data-0", "snap-123"), "demo-app", &NamespaceMapping::new())
        .await
        .expect_err("clone should time out");
    assert!(err.is_timeout());
    assert!(!err.is_terminal_failure());
    assert!(err.to_string().contains("InProgress"));
    assert!(started.elapsed() >= CLONE_DEADLINE);
}

#[tokio::test(start_paused = true)]
async fn restarted_restore_reuses_the_clone_request() {
    let store = InMemoryRequestStore::new();
    let snapshot = snapshot("data-0", "snap-123");
    let request = build_clone_request(&snapshot, "demo-app", &NamespaceMapping::new())
        .expect("request");

    // A previous attempt created the request and the process restarted.
    store.create(&request).await.expect("create");
    store
        .set_phase(RequestKind::Clone, request.key(), "InProgress")
        .expect("phase");

    let orchestrator = orchestrator(&store);
    let task = tokio::spawn(async move {
        orchestrator
            .restore_from_snapshot(&snapshot, "demo-app", &NamespaceMapping::new())
            .await
    });
    tokio::time::sleep(Duration::from_secs(5)).await;
    store
        .complete(RequestKind::Clone, request.key(), Some("pvc-restored-1"))
        .expect("complete");

    let handle = task.await.expect("join").expect("restore");
    assert_eq!(handle, "pvc-restored-1");
    assert_eq!(store.object_count().expect("count"), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_restores_are_independent() {
    let store = InMemoryRequestStore::new();
    let orchestrator = orchestrator(&store);

    let ok = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .restore_from_snapshot(&snapshot("data-0", "snap-1"), "demo-app", &NamespaceMapping::new())
                .await
        })
    };
    let failing = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .restore_from_snapshot(&snapshot("data-1", "snap-2"), "demo-app", &NamespaceMapping::new())
                .await
        })
    };

    let ok_request = build_clone_request(&snapshot("data-0", "snap-1"), "demo-app", &NamespaceMapping::new())
        .expect("request");
    let failing_request =
        build_clone_request(&snapshot("data-1", "snap-2"), "demo-app", &NamespaceMapping::new())
            .expect("request");
    store
        .wait_for(RequestKind::Clone, ok_request.key())
        .await
        .expect("created");
    store
        .wait_for(RequestKind::Clone, failing_request.key())
        .await
        .expect("created");

    store
        .fail(RequestKind::Clone, failing_request.key(), "snapshot data corrupt")
        .expect("fail");
    store
        .complete(RequestKind::Clone, ok_request.key(), Some("pvc-a"))
        .expect("complete");

    assert_eq!(ok.await.expect("join").expect("restore"), "pvc-a");
    let err = failing.await.expect("join").expect_err("should fail");
    assert!(err.to_string().contains("snapshot data corrupt"));
}

#[tokio::test(start_paused = true)]
async fn restore_completes_without_notifications() {
    let store = InMemoryRequestStore::new();
    store
        .configure_faults(FaultConfig {
            fail_watch: true,
            ..FaultConfig::default()
        })
        .expect("faults");
    store
        .script(
            RequestKind::Clone,
            ControlPlaneScript::new().then_complete(Duration::from_secs(10), "pvc-polled"),
        )
        .expect("script");

    let handle = orchestrator(&store)
        .restore_from_snapshot(&snapshot("data-0", "snap-123"), "demo-app", &NamespaceMapping::new())
        .await
        .expect("restore");
    assert_eq!(handle, "pvc-polled");
    assert!(store.poll_calls() >= 10);
}

#[tokio::test(start_paused = true)]
async fn restore_action_clones_annotated_claim_into_mapped_namespace() {
    let store = InMemoryRequestStore::new();
    store
        .script(
            RequestKind::Clone,
            ControlPlaneScript::new().then_complete(Duration::from_secs(3), "pvc-restored-1"),
        )
        .expect("script");
    let action = PvcRestoreAction::new(orchestrator(&store));
    assert_eq!(action.applies_to().included_resources, vec![PVC_RESOURCE]);

    let annotation = snapshot("data-0", "snap-123")
        .to_annotation()
        .expect("annotation");
    let output = action
        .execute(RestoreItemInput {
            item: claim_item("data-0", Some(annotation)),
            namespace_mapping: mapping("demo-app", "demo-restore"),
        })
        .await
        .expect("execute");

    assert!(output.skip_restore);
    assert_eq!(output.resource_handle.as_deref(), Some("pvc-restored-1"));
    assert_eq!(
        output.updated_item["metadata"]["annotations"][RESTORED_HANDLE_ANNOTATION],
        "pvc-restored-1"
    );

    let clones = store.objects(RequestKind::Clone).expect("objects");
    assert_eq!(clones.len(), 1);
    assert_eq!(clones[0].key().namespace(), "demo-restore");
    let manifest: serde_json::Value =
        serde_json::from_slice(&clones[0].descriptor.source().metadata).expect("manifest");
    assert_eq!(manifest["metadata"]["namespace"], "demo-restore");
}

#[tokio::test(start_paused = true)]
async fn restore_action_passes_plain_claims_through() {
    let store = InMemoryRequestStore::new();
    let action = PvcRestoreAction::new(orchestrator(&store));
    let item = claim_item("data-0", None);

    let output = action
        .execute(RestoreItemInput {
            item: item.clone(),
            namespace_mapping: NamespaceMapping::new(),
        })
        .await
        .expect("execute");

    assert!(!output.skip_restore);
    assert_eq!(output.updated_item, item);
    assert!(output.resource_handle.is_none());
    assert_eq!(store.create_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn restore_action_rejects_malformed_annotation() {
    let store = InMemoryRequestStore::new();
    let action = PvcRestoreAction::new(orchestrator(&store));

    let err = action
        .execute(RestoreItemInput {
            item: claim_item("data-0", Some("{\"metadata\":".into())),
            namespace_mapping: NamespaceMapping::new(),
        })
        .await
        .expect_err("malformed annotation");
    assert!(matches!(err, Error::RemapFailure { .. }));
    assert_eq!(store.create_calls(), 0);
}
