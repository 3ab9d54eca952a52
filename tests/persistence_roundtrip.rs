//! Save graph, restart the engine, load, and compare observable behavior

use std::sync::Arc;

use acs::persistence::{MemoryStore, RelationalStore, SqliteStore};
use acs::{
    AccessCondition, AccessOutcome, AcsConfig, AcsEngine, GrantOptions, PageRequest, Verb,
};

fn test_config() -> AcsConfig {
    let mut config = AcsConfig::for_tenant(format!("test-{}", uuid::Uuid::new_v4()));
    config.data_dir = std::env::temp_dir().join("acs-tests");
    config.retry_base_backoff_secs = 0;
    config.drain_deadline_secs = 2;
    config
}

/// Build the reference graph: two groups (one nested), a user, a role, a
/// mix of grants including a deny and a conditional grant
async fn populate(service: &acs::AcsService) {
    let parent = service.create_group("seed", "parent", None).await.unwrap();
    let child = service
        .create_group("seed", "child", Some(parent.id))
        .await
        .unwrap();
    let user = service
        .create_user("seed", "alice", Some(child.id))
        .await
        .unwrap();
    let role = service.create_role("seed", "auditor").await.unwrap();
    service
        .attach_role_to_group("seed", child.id, role.id)
        .await
        .unwrap();

    service
        .grant_permission("seed", child.as_ref(), "/orders/*", Verb::Get, GrantOptions::default())
        .await
        .unwrap();
    service
        .grant_permission(
            "seed",
            parent.as_ref(),
            "/admin/*",
            Verb::All,
            GrantOptions {
                deny: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    service
        .grant_permission(
            "seed",
            role.as_ref(),
            "/reports/{id}",
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
    let _ = user;
}

/// The observable facts the round trip must preserve
fn observe(service: &acs::AcsService) -> Vec<(String, AccessOutcome)> {
    let user = acs::PrincipalRef::user(1);
    [
        ("/orders/42", Verb::Get),
        ("/orders/42", Verb::Post),
        ("/admin/settings", Verb::Delete),
        ("/elsewhere", Verb::Get),
    ]
    .into_iter()
    .map(|(uri, verb)| {
        let decision = service.check_access(user, uri, verb).unwrap();
        (format!("{verb} {uri}"), decision.outcome)
    })
    .collect()
}

#[tokio::test]
async fn memory_store_roundtrip_preserves_decisions() {
    let store = Arc::new(MemoryStore::new());

    let engine = AcsEngine::start(test_config(), store.clone() as Arc<dyn RelationalStore>)
        .await
        .unwrap();
    let service = engine.service();
    populate(&service).await;
    let before = observe(&service);
    assert_eq!(before[0].1, AccessOutcome::Granted);
    assert_eq!(before[1].1, AccessOutcome::NotGranted);
    assert_eq!(before[2].1, AccessOutcome::Denied);
    assert_eq!(before[3].1, AccessOutcome::NotGranted);
    let users_before = service.list_users(PageRequest::default());
    engine.shutdown().await.unwrap();

    // Restart over the same store.
    let engine = AcsEngine::start(test_config(), store as Arc<dyn RelationalStore>)
        .await
        .unwrap();
    let service = engine.service();
    let after = observe(&service);
    assert_eq!(before, after);

    let users_after = service.list_users(PageRequest::default());
    assert_eq!(users_before.total, users_after.total);
    assert_eq!(
        users_before.items.iter().map(|u| u.name.clone()).collect::<Vec<_>>(),
        users_after.items.iter().map(|u| u.name.clone()).collect::<Vec<_>>()
    );

    // The conditional grant survived with its conditions.
    let role_permissions = service
        .list_entity_permissions(acs::PrincipalRef::role(1), PageRequest::default())
        .unwrap();
    assert_eq!(role_permissions.total, 1);
    assert_eq!(role_permissions.items[0].conditions.len(), 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn sqlite_store_roundtrip_preserves_decisions() {
    let db_path = std::env::temp_dir().join(format!("acs-rt-{}.db", uuid::Uuid::new_v4()));
    let url = format!("sqlite://{}", db_path.display());

    let store: Arc<dyn RelationalStore> = Arc::new(SqliteStore::connect(&url).await.unwrap());
    let engine = AcsEngine::start(test_config(), store).await.unwrap();
    let service = engine.service();
    populate(&service).await;
    let before = observe(&service);
    engine.shutdown().await.unwrap();

    // A second engine over a fresh connection to the same file.
    let store: Arc<dyn RelationalStore> = Arc::new(SqliteStore::connect(&url).await.unwrap());
    let engine = AcsEngine::start(test_config(), store).await.unwrap();
    let service = engine.service();
    assert_eq!(before, observe(&service));

    // Membership edges came back: alice inherits through child and parent.
    let alice = service.get_user(1).await.unwrap();
    assert!(alice.parents.contains(&acs::PrincipalRef::group(2)));

    // Conditional grant survived the relational encoding.
    let role_permissions = service
        .list_entity_permissions(acs::PrincipalRef::role(1), PageRequest::default())
        .unwrap();
    assert_eq!(role_permissions.total, 1);
    assert!(matches!(
        role_permissions.items[0].conditions[0],
        AccessCondition::TimeOfDay { start_hour: 8, end_hour: 18 }
    ));

    engine.shutdown().await.unwrap();
    std::fs::remove_file(&db_path).ok();
}
