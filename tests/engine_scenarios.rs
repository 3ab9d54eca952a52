//! End-to-end engine scenarios over the in-memory store

use std::sync::Arc;

use acs::persistence::{MemoryStore, RelationalStore, StoreError};
use acs::{
    AccessCondition, AccessOutcome, AcsConfig, AcsEngine, AcsError, ConditionContext,
    GrantOptions, PageRequest, PrincipalRef, Verb,
};
use chrono::TimeZone;

fn test_config() -> AcsConfig {
    let mut config = AcsConfig::for_tenant(format!("test-{}", uuid::Uuid::new_v4()));
    config.data_dir = std::env::temp_dir().join("acs-tests");
    config.retry_base_backoff_secs = 0; // keep retry loops fast under test
    config.drain_deadline_secs = 2;
    config
}

async fn engine_over(store: Arc<MemoryStore>) -> AcsEngine {
    AcsEngine::start(test_config(), store as Arc<dyn RelationalStore>)
        .await
        .expect("engine boots")
}

#[tokio::test]
async fn grant_through_group() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store).await;
    let service = engine.service();

    let g1 = service.create_group("ops", "g1", None).await.unwrap();
    let u1 = service.create_user("ops", "u1", None).await.unwrap();
    service.add_user_to_group("ops", u1.id, g1.id).await.unwrap();
    service
        .grant_permission("ops", g1.as_ref(), "/orders/*", Verb::Get, GrantOptions::default())
        .await
        .unwrap();

    let decision = service
        .check_access(u1.as_ref(), "/orders/123", Verb::Get)
        .unwrap();
    assert_eq!(decision.outcome, AccessOutcome::Granted);
    assert_eq!(decision.inheritance_chain, vec![u1.as_ref(), g1.as_ref()]);

    let decision = service
        .check_access(u1.as_ref(), "/orders/123", Verb::Post)
        .unwrap();
    assert_eq!(decision.outcome, AccessOutcome::NotGranted);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn deny_dominates_direct_grant() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store).await;
    let service = engine.service();

    let g1 = service.create_group("ops", "g1", None).await.unwrap();
    let g2 = service.create_group("ops", "g2", None).await.unwrap();
    let u1 = service.create_user("ops", "u1", None).await.unwrap();
    service.add_user_to_group("ops", u1.id, g1.id).await.unwrap();
    service
        .add_group_to_group("ops", g2.id, g1.id)
        .await
        .unwrap();
    service
        .grant_permission("ops", u1.as_ref(), "/orders/*", Verb::Get, GrantOptions::default())
        .await
        .unwrap();
    service
        .grant_permission(
            "ops",
            g2.as_ref(),
            "/orders/*",
            Verb::Get,
            GrantOptions {
                deny: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let decision = service
        .check_access(u1.as_ref(), "/orders/1", Verb::Get)
        .unwrap();
    assert_eq!(decision.outcome, AccessOutcome::Denied);
    assert!(decision.reason.contains("g2"), "reason: {}", decision.reason);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn cycle_rejected_graph_unchanged_audit_recorded() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store.clone()).await;
    let service = engine.service();

    let a = service.create_group("ops", "a", None).await.unwrap();
    let b = service.create_group("ops", "b", None).await.unwrap();
    let c = service.create_group("ops", "c", None).await.unwrap();
    service.add_group_to_group("ops", a.id, b.id).await.unwrap();
    service.add_group_to_group("ops", b.id, c.id).await.unwrap();

    let err = service
        .add_group_to_group("ops", c.id, a.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AcsError::Conflict { .. }));

    // Graph unchanged on both sides of the rejected edge.
    let c_after = engine.graph().get_group(c.id).unwrap();
    assert!(!c_after.children.contains(&a.as_ref()));
    let a_after = engine.graph().get_group(a.id).unwrap();
    assert!(!a_after.parents.contains(&c.as_ref()));

    // The failure left an audit record.
    let rows = store.audit_rows();
    assert!(rows.iter().any(|r| r.change_type == "error"));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn retry_exhaustion_routes_to_dlq_and_redrive_reconciles() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store.clone()).await;
    let service = engine.service();

    // Three consecutive transient failures exhaust the default retry budget.
    store.fail_next(StoreError::Timeout("injected".into()), 3);
    let err = service.create_user("ops", "u1", None).await.unwrap_err();
    assert!(matches!(err, AcsError::Terminal { attempts: 3, .. }));

    // The graph is authoritative: the user exists in memory...
    let u1 = engine.graph().get_user(1).unwrap();
    assert_eq!(u1.name, "u1");
    assert!(service.get_user(1).await.is_ok());
    // ...but not yet in the store.
    assert!(!store.contains_user(1));

    // The command sits in the DLQ with the attempt count.
    let entries = engine.dlq().entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].attempts, 3);
    assert_eq!(entries[0].command_kind, "create_user");

    // Re-driving reconciles the store.
    let outcome = engine.drain_dlq().await;
    assert_eq!(outcome.redriven, 1);
    assert!(store.contains_user(1));
    assert_eq!(engine.dlq().pending_count(), 0);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn resource_pattern_specificity() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store).await;
    let service = engine.service();

    let wide = service
        .register_resource("ops", "/a/*", "wide", "endpoint")
        .await
        .unwrap();
    let narrow = service
        .register_resource("ops", "/a/b/{x}", "narrow", "endpoint")
        .await
        .unwrap();

    assert_eq!(service.resolve_resource("/a/b/42").unwrap().id, narrow.id);
    assert_eq!(service.resolve_resource("/a/c").unwrap().id, wide.id);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn conditional_grant_demotes_outside_window() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store).await;
    let service = engine.service();

    let u1 = service.create_user("ops", "u1", None).await.unwrap();
    service
        .grant_permission(
            "ops",
            u1.as_ref(),
            "/reports",
            Verb::Get,
            GrantOptions {
                conditions: vec![AccessCondition::TimeOfDay {
                    start_hour: 8,
                    end_hour: 18,
                }],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let three_am =
        ConditionContext::at(chrono::Utc.with_ymd_and_hms(2026, 3, 2, 3, 0, 0).unwrap());
    let decision = service
        .evaluate("ops", u1.as_ref(), "/reports", Verb::Get, &three_am)
        .await
        .unwrap();
    assert!(decision.has_permission);
    assert!(!decision.has_access);
    assert!(decision.reason.contains("hour"), "reason: {}", decision.reason);

    let noon = ConditionContext::at(chrono::Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap());
    let decision = service
        .evaluate("ops", u1.as_ref(), "/reports", Verb::Get, &noon)
        .await
        .unwrap();
    assert!(decision.has_access);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn missing_parent_group_allocates_no_id() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store.clone()).await;
    let service = engine.service();

    let err = service
        .create_user("ops", "orphan", Some(99))
        .await
        .unwrap_err();
    assert!(matches!(err, AcsError::NotFound(_)));
    assert_eq!(store.user_count(), 0);

    // The failed create consumed no id: the next user still gets id 1.
    let u1 = service.create_user("ops", "u1", None).await.unwrap();
    assert_eq!(u1.id, 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn membership_and_grant_idempotence() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store.clone()).await;
    let service = engine.service();

    let g1 = service.create_group("ops", "g1", None).await.unwrap();
    let u1 = service.create_user("ops", "u1", None).await.unwrap();

    let first = service.add_user_to_group("ops", u1.id, g1.id).await.unwrap();
    let second = service.add_user_to_group("ops", u1.id, g1.id).await.unwrap();
    match (first, second) {
        (
            acs::CommandOutput::Membership { changed: c1, .. },
            acs::CommandOutput::Membership { changed: c2, .. },
        ) => {
            assert!(c1);
            assert!(!c2); // second call is a no-op
        }
        other => panic!("unexpected outputs: {other:?}"),
    }

    // Grant applied twice leaves a single row, flags updated in place.
    service
        .grant_permission("ops", g1.as_ref(), "/a/*", Verb::Get, GrantOptions::default())
        .await
        .unwrap();
    service
        .grant_permission("ops", g1.as_ref(), "/a/*", Verb::Get, GrantOptions::default())
        .await
        .unwrap();
    let page = service
        .list_entity_permissions(g1.as_ref(), PageRequest::default())
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(store.permissions_for(g1.as_ref()).len(), 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn audit_has_one_success_record_per_command_in_order() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store.clone()).await;
    let service = engine.service();

    let g1 = service.create_group("ops", "g1", None).await.unwrap();
    let u1 = service.create_user("ops", "u1", None).await.unwrap();
    service.add_user_to_group("ops", u1.id, g1.id).await.unwrap();
    service
        .grant_permission("ops", g1.as_ref(), "/orders/*", Verb::Get, GrantOptions::default())
        .await
        .unwrap();

    let changes: Vec<String> = store
        .audit_rows()
        .iter()
        .map(|r| r.change_type.clone())
        .collect();
    assert_eq!(changes, vec!["create", "create", "add", "grant"]);

    // The chain verifies clean.
    let report = engine.verify_audit().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.records_checked, 4);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn submit_after_shutdown_is_cancelled() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store).await;
    let service = engine.service();

    service.create_user("ops", "u1", None).await.unwrap();
    engine.shutdown().await.unwrap();

    let err = service.create_user("ops", "u2", None).await.unwrap_err();
    assert!(matches!(err, AcsError::Cancelled(_)));
}

#[tokio::test]
async fn commands_queued_before_shutdown_still_complete() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store.clone()).await;
    let service = engine.service();

    // Queue a burst, then shut down immediately; accepted commands drain.
    let mut futures = Vec::new();
    for i in 0..20 {
        let service = service.clone();
        futures.push(tokio::spawn(async move {
            service.create_user("ops", &format!("user-{i}"), None).await
        }));
    }
    for handle in futures {
        // Each submission either completed or was refused at the closed
        // channel; none may hang.
        let _ = handle.await.unwrap();
    }
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn dashboard_health_counters_track_commands() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_over(store).await;
    let service = engine.service();

    service.create_user("ops", "u1", None).await.unwrap();
    let _ = service.check_access(PrincipalRef::user(1), "/x", Verb::Get);

    let stats = engine.health().operation_stats("domain_command");
    assert_eq!(stats.success, 1);
    let snapshot = engine.health().snapshot();
    assert!(snapshot.operations.contains_key("database"));

    engine.shutdown().await.unwrap();
}
