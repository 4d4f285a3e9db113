//! Mode transition and snapshot scenarios over the full core context.

mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use flowslide_core::clock::now_millis;
use flowslide_core::context::CoreContext;
use flowslide_core::errors::CoreError;
use flowslide_core::mode::DeploymentMode;
use flowslide_core::settings::RuntimeConfig;
use flowslide_core::transition::TransitionLog;
use flowslide_core::store::{
    new_write_barrier, DataType, MemoryStore, ObjectStore, Record, StoreAdapter, StoreKind,
};
use flowslide_core::transition::TransitionStatus;

use common::{full_config, MemoryTransitionLog, TestFactory};

struct ContextFixture {
    core: Arc<CoreContext>,
    local: Arc<MemoryStore>,
    factory: Arc<TestFactory>,
    log: Arc<MemoryTransitionLog>,
    _dir: tempfile::TempDir,
}

async fn local_only_context() -> ContextFixture {
    let dir = tempfile::TempDir::new().unwrap();
    let db_path = dir.path().join("flowslide.db");
    std::fs::write(&db_path, b"local-store-contents-v1").unwrap();

    let config = RuntimeConfig {
        local_db_path: db_path,
        ..RuntimeConfig::default()
    };
    let local = Arc::new(MemoryStore::new(StoreKind::Local));
    let factory = TestFactory::new();
    let log = MemoryTransitionLog::new();

    let core = CoreContext::initialize(
        config,
        local.clone(),
        new_write_barrier(),
        factory.clone(),
        log.clone(),
        HashMap::new(),
    )
    .await
    .unwrap();
    core.start().await;

    ContextFixture {
        core,
        local,
        factory,
        log,
        _dir: dir,
    }
}

#[tokio::test]
async fn promote_local_only_to_full_stack() {
    let fx = local_only_context().await;
    assert_eq!(fx.core.deployment.get_mode().current, DeploymentMode::LocalOnly);

    let base = now_millis();
    for i in 0..100 {
        fx.local
            .put(&Record::new(
                DataType::Projects,
                format!("p{i}"),
                "{}",
                base + i,
                StoreKind::Local,
            ))
            .await
            .unwrap();
    }
    fx.local
        .put(&Record::new(DataType::Users, "admin", "{}", base, StoreKind::Local))
        .await
        .unwrap();

    let target_config = full_config(&fx.core.deployment.current_config().local_db_path);
    let record = fx
        .core
        .deployment
        .switch_mode(DeploymentMode::LocalExternalR2, target_config, "promote", "ops")
        .await
        .unwrap();

    assert_eq!(record.status, TransitionStatus::Succeeded);
    assert_eq!(record.from_mode, DeploymentMode::LocalOnly);
    assert_eq!(record.to_mode, DeploymentMode::LocalExternalR2);
    assert!(record.snapshot_id.is_some());

    // Mode is published and the engine reconfigured.
    assert_eq!(
        fx.core.deployment.get_mode().current,
        DeploymentMode::LocalExternalR2
    );

    // Critical types report healthy inside the verification window.
    for data_type in [
        DataType::Users,
        DataType::SystemConfigs,
        DataType::AiProviderConfigs,
    ] {
        let status = fx
            .core
            .deployment
            .get_status()
            .into_iter()
            .find(|s| s.data_type == data_type)
            .unwrap();
        assert!(status.healthy, "{data_type} not healthy");
    }

    // The critical reseed pushed local users to the fresh peer.
    assert!(fx
        .factory
        .external
        .get(DataType::Users, "admin")
        .await
        .unwrap()
        .is_some());

    // A pre-transition snapshot landed in the object store.
    let backups = fx.factory.objects.list_objects("backups/").await.unwrap();
    assert!(backups.iter().any(|k| k.ends_with("archive.tar.gz")));
    assert!(backups.iter().any(|k| k.ends_with("manifest.json")));

    // Exactly one history record.
    let history = fx.core.deployment.get_history(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, TransitionStatus::Succeeded);

    fx.core.shutdown().await;
}

#[tokio::test]
async fn unreachable_peer_fails_validation_before_any_side_effect() {
    let fx = local_only_context().await;
    fx.factory.fail_external_connect.store(true, Ordering::SeqCst);

    let target_config = full_config(&fx.core.deployment.current_config().local_db_path);
    let err = fx
        .core
        .deployment
        .switch_mode(
            DeploymentMode::LocalExternal,
            target_config.clone(),
            "promote",
            "ops",
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::PeerUnreachable(_)));
    assert_eq!(fx.core.deployment.get_mode().current, DeploymentMode::LocalOnly);
    // Probe failed before the snapshot step: no archive, no history entry.
    assert!(fx.factory.objects.is_empty());
    assert!(fx.log.list(10).await.unwrap().is_empty());

    // The same request validates cleanly once the peer answers again.
    fx.factory.fail_external_connect.store(false, Ordering::SeqCst);
    let report = fx
        .core
        .deployment
        .validate(DeploymentMode::LocalExternal, &target_config)
        .await;
    assert!(report.ok);

    fx.core.shutdown().await;
}

#[tokio::test]
async fn missing_config_fields_are_rejected_verbatim() {
    let fx = local_only_context().await;

    let incomplete = fx.core.deployment.current_config();
    let err = fx
        .core
        .deployment
        .switch_mode(DeploymentMode::LocalExternalR2, incomplete.clone(), "promote", "ops")
        .await
        .unwrap_err();
    match err {
        CoreError::InvalidConfig { missing } => {
            assert!(missing.contains(&"database_url".to_string()));
        }
        other => panic!("unexpected error: {other}"),
    }

    let report = fx
        .core
        .deployment
        .validate(DeploymentMode::LocalExternalR2, &incomplete)
        .await;
    assert!(!report.ok);
    assert_eq!(report.missing_fields.len(), 5);

    fx.core.shutdown().await;
}

#[tokio::test]
async fn snapshot_restore_round_trip() {
    let fx = local_only_context().await;
    let db_path = fx.core.deployment.current_config().local_db_path.clone();

    // Promote to a mode with an object store first.
    let target_config = full_config(&db_path);
    fx.core
        .deployment
        .switch_mode(DeploymentMode::LocalExternalR2, target_config, "promote", "ops")
        .await
        .unwrap();

    let manifest = fx.core.deployment.create_backup().await.unwrap();
    assert_eq!(manifest.mode, DeploymentMode::LocalExternalR2);
    assert_eq!(manifest.bucket, "flowslide-backups");

    let listed = fx.core.deployment.list_backups().await.unwrap();
    assert!(listed.iter().any(|m| m.backup_id() == manifest.backup_id()));

    // The store file drifts after the snapshot.
    std::fs::write(&db_path, b"local-store-contents-v2-dirty").unwrap();

    let mut restart = fx.core.restart_requested();
    fx.core
        .deployment
        .restore(manifest.backup_id())
        .await
        .unwrap();

    assert_eq!(
        std::fs::read(&db_path).unwrap(),
        b"local-store-contents-v1"
    );
    assert!(*restart.borrow_and_update());

    fx.core.shutdown().await;
}

#[tokio::test]
async fn corrupt_snapshot_aborts_restore_and_leaves_the_store_alone() {
    let fx = local_only_context().await;
    let db_path = fx.core.deployment.current_config().local_db_path.clone();

    let target_config = full_config(&db_path);
    fx.core
        .deployment
        .switch_mode(DeploymentMode::LocalR2, target_config, "enable backups", "ops")
        .await
        .unwrap();

    let manifest = fx.core.deployment.create_backup().await.unwrap();

    // Tamper with the stored archive.
    let archive_key = format!("{}archive.tar.gz", manifest.prefix);
    fx.factory
        .objects
        .put_object(&archive_key, b"garbage".to_vec())
        .await
        .unwrap();

    let before = std::fs::read(&db_path).unwrap();
    let err = fx
        .core
        .deployment
        .restore(manifest.backup_id())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::CorruptSnapshot(_)));
    assert_eq!(std::fs::read(&db_path).unwrap(), before);
    assert!(!*fx.core.restart_requested().borrow());

    fx.core.shutdown().await;
}

#[tokio::test]
async fn transition_to_the_same_mode_is_a_noop() {
    let fx = local_only_context().await;
    let config = fx.core.deployment.current_config();
    let record = fx
        .core
        .deployment
        .switch_mode(DeploymentMode::LocalOnly, config, "noop", "ops")
        .await
        .unwrap();
    assert_eq!(record.status, TransitionStatus::Succeeded);
    assert!(fx.log.list(10).await.unwrap().is_empty());
    fx.core.shutdown().await;
}
