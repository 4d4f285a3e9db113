//! End-to-end sync engine scenarios over in-memory stores.

mod common;

use std::collections::HashSet;

use flowslide_core::clock::now_millis;
use flowslide_core::errors::CoreError;
use flowslide_core::mode::DeploymentMode;
use flowslide_core::settings::RuntimeConfig;
use flowslide_core::store::{CursorStore, DataType, Record, StoreAdapter, StoreKind};

use common::engine_fixture;

fn user(id: &str, at: i64) -> Record {
    Record::new(
        DataType::Users,
        id,
        format!("{{\"email\":\"{id}@example.com\"}}"),
        at,
        StoreKind::Local,
    )
}

#[tokio::test]
async fn local_only_mode_runs_no_workers() {
    let fx = engine_fixture(&RuntimeConfig::default(), false);
    fx.engine.reconfigure(DeploymentMode::LocalOnly).await;

    let statuses = fx.engine.statuses();
    let users_row = statuses
        .iter()
        .find(|s| s.data_type == DataType::Users)
        .unwrap();
    assert!(!users_row.enabled);

    // A user can still be created locally; no uniqueness peer exists.
    let record = fx
        .engine
        .create_user("alice", "{\"email\":\"alice@example.com\"}".to_string())
        .await
        .unwrap();
    assert_eq!(record.id, "alice");
    assert!(fx.engine.trigger(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn users_replicate_to_an_empty_external_store() {
    let fx = engine_fixture(&RuntimeConfig::default(), true);
    fx.engine.reconfigure(DeploymentMode::LocalExternal).await;

    let base = now_millis();
    for i in 1..=50 {
        fx.local.put(&user(&format!("u{i}"), base + i)).await.unwrap();
    }

    fx.engine.trigger(Some(DataType::Users)).await.unwrap();

    assert_eq!(fx.external.count_live(DataType::Users).await.unwrap(), 50);
    let u7 = fx.external.get(DataType::Users, "u7").await.unwrap().unwrap();
    assert_eq!(u7.payload, "{\"email\":\"u7@example.com\"}");
    // Applied replicas keep the source timestamp (no write amplification).
    assert_eq!(u7.updated_at, base + 7);

    // Deletion propagates as a tombstone on the next cycle.
    fx.local
        .delete(DataType::Users, "u25", base + 1000)
        .await
        .unwrap();
    fx.engine.trigger(Some(DataType::Users)).await.unwrap();

    let u25 = fx.external.get(DataType::Users, "u25").await.unwrap().unwrap();
    assert!(u25.deleted);
    assert_eq!(fx.external.count_live(DataType::Users).await.unwrap(), 49);
}

#[tokio::test]
async fn simultaneous_updates_converge_to_the_external_value() {
    let fx = engine_fixture(&RuntimeConfig::default(), true);
    fx.engine.reconfigure(DeploymentMode::LocalExternal).await;

    let at = now_millis();
    fx.local
        .put(&Record::new(
            DataType::Projects,
            "p1",
            "{\"title\":\"A\"}",
            at,
            StoreKind::Local,
        ))
        .await
        .unwrap();
    fx.external
        .put(&Record::new(
            DataType::Projects,
            "p1",
            "{\"title\":\"B\"}",
            at,
            StoreKind::External,
        ))
        .await
        .unwrap();

    fx.engine.trigger(Some(DataType::Projects)).await.unwrap();

    let local_copy = fx.local.get(DataType::Projects, "p1").await.unwrap().unwrap();
    let external_copy = fx.external.get(DataType::Projects, "p1").await.unwrap().unwrap();
    assert_eq!(local_copy.payload, "{\"title\":\"B\"}");
    assert_eq!(external_copy.payload, "{\"title\":\"B\"}");
}

#[tokio::test]
async fn reapplying_the_same_batch_is_idempotent() {
    let fx = engine_fixture(&RuntimeConfig::default(), true);
    fx.engine.reconfigure(DeploymentMode::LocalExternal).await;

    let base = now_millis();
    for i in 0..10 {
        fx.local.put(&user(&format!("u{i}"), base + i)).await.unwrap();
    }

    fx.engine.trigger(Some(DataType::Users)).await.unwrap();
    let first = fx.external.dump();

    // Reset the cursor so the same records are listed again.
    fx.local
        .reset_cursors_for(DataType::Users)
        .await
        .unwrap();
    fx.engine.trigger(Some(DataType::Users)).await.unwrap();
    let second = fx.external.dump();

    assert_eq!(first, second);
}

#[tokio::test]
async fn username_uniqueness_is_enforced_against_the_external_store() {
    let fx = engine_fixture(&RuntimeConfig::default(), true);
    fx.engine.reconfigure(DeploymentMode::LocalExternal).await;

    fx.external
        .put(&Record::new(
            DataType::Users,
            "alice",
            "{}",
            now_millis(),
            StoreKind::External,
        ))
        .await
        .unwrap();

    // Case-insensitive: "Alice" collides with "alice".
    let err = fx
        .engine
        .create_user("Alice", "{}".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::UsernameConflict(id) if id == "alice"));

    // A tombstoned name can be reused.
    fx.external
        .delete(DataType::Users, "bob", now_millis())
        .await
        .unwrap();
    assert!(fx.engine.create_user("bob", "{}".to_string()).await.is_ok());

    // Unreachable peer: refuse rather than risk a conflict.
    fx.external.set_failing(true);
    let err = fx
        .engine
        .create_user("carol", "{}".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::UniquenessUnverifiable(_)));
}

#[tokio::test]
async fn on_demand_sync_is_scoped_by_the_hot_set() {
    let fx = engine_fixture(&RuntimeConfig::default(), true);
    fx.engine.reconfigure(DeploymentMode::LocalExternal).await;

    let base = now_millis();
    for id in ["deck-hot", "deck-cold"] {
        fx.local
            .put(&Record::new(DataType::SlideData, id, "{}", base, StoreKind::Local))
            .await
            .unwrap();
    }

    // Empty hot set: the worker skips the pass entirely.
    fx.engine.trigger(Some(DataType::SlideData)).await.unwrap();
    assert_eq!(fx.external.count_live(DataType::SlideData).await.unwrap(), 0);

    fx.engine
        .set_hot_projects(HashSet::from(["deck-hot".to_string()]));
    fx.engine.trigger(Some(DataType::SlideData)).await.unwrap();
    assert!(fx
        .external
        .get(DataType::SlideData, "deck-hot")
        .await
        .unwrap()
        .is_some());
    assert!(fx
        .external
        .get(DataType::SlideData, "deck-cold")
        .await
        .unwrap()
        .is_none());

    // The cold deck syncs once it is touched and becomes hot.
    fx.local
        .put(&Record::new(
            DataType::SlideData,
            "deck-cold",
            "{}",
            base + 10,
            StoreKind::Local,
        ))
        .await
        .unwrap();
    fx.engine
        .set_hot_projects(HashSet::from(["deck-cold".to_string()]));
    fx.engine.trigger(Some(DataType::SlideData)).await.unwrap();
    assert!(fx
        .external
        .get(DataType::SlideData, "deck-cold")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn repeated_failures_mark_the_worker_degraded() {
    let fx = engine_fixture(&RuntimeConfig::default(), true);
    fx.engine.reconfigure(DeploymentMode::LocalExternal).await;

    fx.local.put(&user("u1", now_millis())).await.unwrap();
    fx.external.set_failing(true);

    for _ in 0..3 {
        fx.engine.trigger(Some(DataType::Users)).await.unwrap();
    }
    let degraded = fx
        .engine
        .statuses()
        .iter()
        .any(|s| s.data_type == DataType::Users && s.degraded);
    assert!(degraded);

    // Recovery clears the flag on the next clean cycle.
    fx.external.set_failing(false);
    fx.engine.trigger(Some(DataType::Users)).await.unwrap();
    let still_degraded = fx
        .engine
        .statuses()
        .iter()
        .any(|s| s.data_type == DataType::Users && s.degraded);
    assert!(!still_degraded);
}

#[tokio::test]
async fn cursor_never_advances_past_a_failed_record() {
    let fx = engine_fixture(&RuntimeConfig::default(), true);
    fx.engine.reconfigure(DeploymentMode::LocalExternal).await;

    let base = now_millis();
    fx.local.put(&user("u1", base)).await.unwrap();
    fx.engine.trigger(Some(DataType::Users)).await.unwrap();
    assert_eq!(fx.external.count_live(DataType::Users).await.unwrap(), 1);

    // New record arrives while the peer is down; the cycle fails and the
    // record is retried after recovery. Nothing is silently dropped.
    fx.local.put(&user("u2", base + 10)).await.unwrap();
    fx.external.set_failing(true);
    fx.engine.trigger(Some(DataType::Users)).await.unwrap();

    fx.external.set_failing(false);
    fx.engine.trigger(Some(DataType::Users)).await.unwrap();
    assert_eq!(fx.external.count_live(DataType::Users).await.unwrap(), 2);
}

#[tokio::test]
async fn master_slave_templates_overwrite_the_destination() {
    let fx = engine_fixture(&RuntimeConfig::default(), true);
    fx.engine.reconfigure(DeploymentMode::LocalExternal).await;

    let at = now_millis();
    // Destination holds a copy with the same timestamp but different
    // content; master/slave distribution does not consult it.
    fx.external
        .put(&Record::new(
            DataType::PptTemplates,
            "t1",
            "{\"body\":\"stale\"}",
            at,
            StoreKind::External,
        ))
        .await
        .unwrap();
    fx.local
        .put(&Record::new(
            DataType::PptTemplates,
            "t1",
            "{\"body\":\"fresh\"}",
            at,
            StoreKind::Local,
        ))
        .await
        .unwrap();

    fx.engine.trigger(Some(DataType::PptTemplates)).await.unwrap();
    let external_copy = fx
        .external
        .get(DataType::PptTemplates, "t1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(external_copy.payload, "{\"body\":\"fresh\"}");
}
