use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use ruleplane_common::{
    Error, FilterAction, Firewall, FirewallPolicy, NetworkRuleCollection, PolicyFilterRuleCollection,
    PolicyRuleCollection, RuleCollectionGroup,
};
use ruleplane_provider::config::Timeouts;
use ruleplane_provider::identity::{ChildId, RULE_COLLECTION_GROUPS};
use ruleplane_provider::resources::firewall::{firewall_lock, FirewallKind, NetworkRuleCollectionKind};
use ruleplane_provider::resources::policy::{PolicyRuleCollectionKind, RuleCollectionGroupKind};
use ruleplane_provider::resources::{Backend, CollectionResource, ParentResource};
use ruleplane_provider::{LocalControlPlane, NamedLocks, ResourceId};

type Network = CollectionResource<NetworkRuleCollectionKind>;

fn setup() -> (Arc<LocalControlPlane>, Backend) {
    let plane = Arc::new(LocalControlPlane::in_memory().unwrap());
    let backend = Backend {
        client: plane.clone(),
        locks: Arc::new(NamedLocks::new()),
        poll_interval: Duration::from_millis(1),
        subscription_id: "sub".to_string(),
    };
    (plane, backend)
}

fn fw_id(name: &str) -> ResourceId {
    ResourceId::firewall("sub", "rg", name).unwrap()
}

fn seed_firewall(plane: &LocalControlPlane, name: &str, collections: &[NetworkRuleCollection]) -> ResourceId {
    let mut fw: Firewall = serde_json::from_value(serde_json::json!({"name": name, "location": "westeurope"})).unwrap();
    fw.network_rule_collections = collections.to_vec();
    let id = fw_id(name);
    plane.seed(&id, &fw).unwrap();
    id
}

fn coll(name: &str, priority: i64) -> NetworkRuleCollection {
    NetworkRuleCollection {
        name: name.to_string(),
        priority,
        action: FilterAction::Allow,
        rules: vec![],
    }
}

fn remote(plane: &LocalControlPlane, id: &ResourceId) -> Vec<(String, i64)> {
    plane
        .document::<Firewall>(id)
        .unwrap()
        .unwrap()
        .network_rule_collections
        .into_iter()
        .map(|c| (c.name, c.priority))
        .collect()
}

fn pairs(expected: &[(&str, i64)]) -> Vec<(String, i64)> {
    expected.iter().map(|(n, p)| (n.to_string(), *p)).collect()
}

/// fw1 holds r1; creating r2 keeps r1 while other firewalls are being written
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn create_appends_next_to_existing() {
    let (plane, backend) = setup();
    plane.set_settle_polls(3);
    let fw1 = seed_firewall(&plane, "fw1", &[coll("r1", 100)]);
    let others: Vec<ResourceId> = (2..8).map(|i| seed_firewall(&plane, &format!("fw{}", i), &[])).collect();

    let handler = Arc::new(Network::new(backend, Timeouts::default()));

    let mut tasks = Vec::new();
    {
        let handler = handler.clone();
        let fw1 = fw1.clone();
        tasks.push(tokio::spawn(async move { handler.create_child(&fw1, coll("r2", 200)).await }));
    }
    for id in &others {
        let handler = handler.clone();
        let id = id.clone();
        tasks.push(tokio::spawn(async move { handler.create_child(&id, coll("other", 300)).await }));
    }

    for result in join_all(tasks).await {
        result.unwrap().unwrap();
    }

    assert_eq!(remote(&plane, &fw1), pairs(&[("r1", 100), ("r2", 200)]));
    for id in &others {
        assert_eq!(remote(&plane, id), pairs(&[("other", 300)]));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_creates_on_one_parent_all_survive() {
    let (plane, backend) = setup();
    plane.set_settle_polls(2);
    let fw1 = seed_firewall(&plane, "fw1", &[coll("r1", 100)]);
    let handler = Arc::new(Network::new(backend, Timeouts::default()));

    let tasks = (0..16).map(|i| {
        let handler = handler.clone();
        let fw1 = fw1.clone();
        tokio::spawn(async move { handler.create_child(&fw1, coll(&format!("c{}", i), 1000 + i)).await })
    });
    for result in join_all(tasks).await {
        result.unwrap().unwrap();
    }

    let mut names: Vec<String> = remote(&plane, &fw1).into_iter().map(|(n, _)| n).collect();
    assert_eq!(names.len(), 17);
    assert_eq!(names[0], "r1");
    names.sort();
    names.dedup();
    assert_eq!(names.len(), 17);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_mixed_operations_keep_union() {
    let (plane, backend) = setup();
    plane.set_settle_polls(2);
    let fw1 = seed_firewall(&plane, "fw1", &[coll("a", 100), coll("b", 200), coll("c", 300)]);
    let handler = Arc::new(Network::new(backend, Timeouts::default()));

    let a = ChildId::new(fw1.clone(), "networkRuleCollections", "a").unwrap();
    let b = ChildId::new(fw1.clone(), "networkRuleCollections", "b").unwrap();

    let (updated, deleted, created) = tokio::join!(
        handler.update_child(&a, coll("a", 150)),
        handler.delete_child(&b),
        handler.create_child(&fw1, coll("d", 400)),
    );
    updated.unwrap();
    deleted.unwrap();
    created.unwrap();

    let mut got = remote(&plane, &fw1);
    got.sort();
    assert_eq!(got, pairs(&[("a", 150), ("c", 300), ("d", 400)]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn firewall_updates_keep_concurrent_children() {
    let (plane, backend) = setup();
    plane.set_settle_polls(2);
    let fw1 = seed_firewall(&plane, "fw1", &[]);
    let firewalls = Arc::new(ParentResource::<FirewallKind>::new(
        backend.clone(),
        Timeouts::default_for("ruleplane_firewall"),
    ));
    let children = Arc::new(Network::new(backend, Timeouts::default()));

    let mut tasks = Vec::new();
    for i in 0..10 {
        let firewalls = firewalls.clone();
        let parent_id = fw1.clone();
        tasks.push(tokio::spawn(async move {
            let location = if i % 2 == 0 { "westeurope" } else { "northeurope" };
            let desired: Firewall =
                serde_json::from_value(serde_json::json!({"name": "fw1", "location": location})).unwrap();
            firewalls.update_parent(&parent_id, desired).await.map(|_| ())
        }));

        let children = children.clone();
        let fw1 = fw1.clone();
        tasks.push(tokio::spawn(async move {
            children.create_child(&fw1, coll(&format!("c{}", i), 1000 + i)).await.map(|_| ())
        }));
    }
    for result in join_all(tasks).await {
        result.unwrap().unwrap();
    }

    let mut names: Vec<String> = remote(&plane, &fw1).into_iter().map(|(n, _)| n).collect();
    names.sort();
    let mut expected: Vec<String> = (0..10).map(|i| format!("c{}", i)).collect();
    expected.sort();
    assert_eq!(names, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn group_updates_keep_concurrent_policy_collections() {
    let (plane, backend) = setup();
    plane.set_settle_polls(2);

    let policy = ResourceId::firewall_policy("sub", "rg", "p1").unwrap();
    let policy_doc: FirewallPolicy =
        serde_json::from_value(serde_json::json!({"name": "p1", "location": "westeurope"})).unwrap();
    plane.seed(&policy, &policy_doc).unwrap();

    let group = policy.nested(RULE_COLLECTION_GROUPS, "default").unwrap();
    let seeded = RuleCollectionGroup {
        name: "default".to_string(),
        priority: 500,
        rule_collections: vec![],
    };
    plane.seed(&group, &seeded).unwrap();

    let groups = Arc::new(ParentResource::<RuleCollectionGroupKind>::new(backend.clone(), Timeouts::default()));
    let collections = Arc::new(CollectionResource::<PolicyRuleCollectionKind>::new(backend, Timeouts::default()));

    let mut tasks = Vec::new();
    for i in 0..10 {
        let groups = groups.clone();
        let group_id = group.clone();
        tasks.push(tokio::spawn(async move {
            let desired = RuleCollectionGroup {
                name: "default".to_string(),
                priority: 500 + i,
                rule_collections: vec![],
            };
            groups.update_parent(&group_id, desired).await.map(|_| ())
        }));

        let collections = collections.clone();
        let group = group.clone();
        tasks.push(tokio::spawn(async move {
            let desired = PolicyRuleCollection::Filter(PolicyFilterRuleCollection {
                name: format!("f{}", i),
                priority: 1000 + i,
                action: FilterAction::Allow,
                rules: vec![],
            });
            collections.create_child(&group, desired).await.map(|_| ())
        }));
    }
    for result in join_all(tasks).await {
        result.unwrap().unwrap();
    }

    let stored: RuleCollectionGroup = plane.document(&group).unwrap().unwrap();
    assert_eq!(stored.rule_collections.len(), 10);
    assert!((500..510).contains(&stored.priority));
}

#[tokio::test]
async fn parent_delete_after_out_of_band_removal() {
    let (plane, backend) = setup();
    let fw1 = seed_firewall(&plane, "fw1", &[coll("r1", 100)]);
    let locks = backend.locks.clone();
    let firewalls = Arc::new(ParentResource::<FirewallKind>::new(
        backend,
        Timeouts::default_for("ruleplane_firewall"),
    ));

    let held = locks
        .acquire(&firewall_lock(&fw1), tokio::time::Instant::now() + Duration::from_secs(30))
        .await
        .unwrap();
    let task = {
        let firewalls = firewalls.clone();
        let fw1 = fw1.clone();
        tokio::spawn(async move { firewalls.delete_parent(&fw1).await })
    };

    // the delete is parked on the lock while the firewall goes away
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(plane.remove(&fw1).unwrap());
    drop(held);

    task.await.unwrap().unwrap();
    assert!(plane.document::<Firewall>(&fw1).unwrap().is_none());
}

#[tokio::test]
async fn update_replaces_in_place() {
    let (plane, backend) = setup();
    let fw1 = seed_firewall(&plane, "fw1", &[coll("A", 100), coll("B", 200), coll("C", 300)]);
    let handler = Network::new(backend, Timeouts::default());

    let b = ChildId::new(fw1.clone(), "networkRuleCollections", "B").unwrap();
    handler.update_child(&b, coll("B", 250)).await.unwrap();

    assert_eq!(remote(&plane, &fw1), pairs(&[("A", 100), ("B", 250), ("C", 300)]));
    assert_eq!(handler.read_child(&b).await.unwrap().unwrap().priority, 250);
}

#[tokio::test]
async fn create_collision_leaves_remote_unchanged() {
    let (plane, backend) = setup();
    let fw1 = seed_firewall(&plane, "fw1", &[coll("A", 100)]);
    let handler = Network::new(backend, Timeouts::default());

    let err = handler.create_child(&fw1, coll("A", 500)).await.unwrap_err();
    assert!(err.is_already_exists(), "got {err}");
    assert!(err.to_string().contains("/azureFirewalls/fw1/networkRuleCollections/A"));

    assert_eq!(remote(&plane, &fw1), pairs(&[("A", 100)]));
}

#[tokio::test]
async fn update_of_vanished_child_is_fatal() {
    let (plane, backend) = setup();
    let fw1 = seed_firewall(&plane, "fw1", &[coll("A", 100)]);
    let handler = Network::new(backend, Timeouts::default());

    let gone = ChildId::new(fw1.clone(), "networkRuleCollections", "B").unwrap();
    let err = handler.update_child(&gone, coll("B", 200)).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(remote(&plane, &fw1), pairs(&[("A", 100)]));

    let name_change = ChildId::new(fw1.clone(), "networkRuleCollections", "A").unwrap();
    let err = handler.update_child(&name_change, coll("Z", 100)).await.unwrap_err();
    assert!(matches!(err.root(), Error::InvalidConfig(_)));
}

#[tokio::test]
async fn delete_is_idempotent() {
    let (plane, backend) = setup();
    let fw1 = seed_firewall(&plane, "fw1", &[coll("r1", 100), coll("r2", 200)]);
    let handler = Network::new(backend, Timeouts::default());
    let r1 = ChildId::new(fw1.clone(), "networkRuleCollections", "r1").unwrap();

    handler.delete_child(&r1).await.unwrap();
    assert_eq!(remote(&plane, &fw1), pairs(&[("r2", 200)]));
    assert!(!handler.child_exists(&r1).await.unwrap());

    // already gone
    handler.delete_child(&r1).await.unwrap();

    // parent removed out of band
    plane.remove(&fw1).unwrap();
    let r2 = ChildId::new(fw1.clone(), "networkRuleCollections", "r2").unwrap();
    handler.delete_child(&r2).await.unwrap();
    assert!(handler.read_child(&r2).await.unwrap().is_none());
}

#[tokio::test]
async fn create_on_missing_parent_fails() {
    let (plane, backend) = setup();
    let handler = Network::new(backend, Timeouts::default());

    let err = handler.create_child(&fw_id("nope"), coll("r1", 100)).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(plane.document::<Firewall>(&fw_id("nope")).unwrap().is_none());
}

#[tokio::test]
async fn convergence_timeout_releases_lock() {
    let (plane, backend) = setup();
    let fw1 = seed_firewall(&plane, "fw1", &[]);
    let handler = Network::new(backend, Timeouts { create: 1, read: 1, update: 1, delete: 1 });

    plane.set_settle_polls(u32::MAX);
    let err = handler.create_child(&fw1, coll("slow", 100)).await.unwrap_err();
    assert!(matches!(err.root(), Error::ConvergenceTimeout { .. }), "got {err}");
    assert!(err.is_transient());

    plane.set_settle_polls(1);
    handler.create_child(&fw1, coll("fast", 200)).await.unwrap();
    assert_eq!(remote(&plane, &fw1), pairs(&[("fast", 200)]));
}

#[tokio::test]
async fn lock_wait_respects_deadline() {
    let (plane, backend) = setup();
    let fw1 = seed_firewall(&plane, "fw1", &[]);
    let locks = backend.locks.clone();
    let handler = Network::new(backend, Timeouts { create: 1, read: 1, update: 1, delete: 1 });

    let held = locks
        .acquire(&firewall_lock(&fw1), tokio::time::Instant::now() + Duration::from_secs(30))
        .await
        .unwrap();
    let err = handler.create_child(&fw1, coll("r1", 100)).await.unwrap_err();
    assert!(matches!(err.root(), Error::Timeout { .. }), "got {err}");
    assert!(remote(&plane, &fw1).is_empty());

    drop(held);
    handler.create_child(&fw1, coll("r1", 100)).await.unwrap();
}

#[tokio::test]
async fn transient_errors_propagate_with_identity() {
    let (plane, backend) = setup();
    let fw1 = seed_firewall(&plane, "fw1", &[coll("r1", 100)]);
    let handler = Network::new(backend, Timeouts::default());

    plane.fail_next_read("connection reset by peer");
    let err = handler.create_child(&fw1, coll("r2", 200)).await.unwrap_err();
    assert!(err.is_transient());
    assert!(err.to_string().contains("networkRuleCollections/r2"), "got {err}");

    plane.fail_next_write("priority 200 is already used");
    let err = handler.create_child(&fw1, coll("r2", 200)).await.unwrap_err();
    assert!(matches!(err.root(), Error::OperationFailed { .. }));
    assert_eq!(remote(&plane, &fw1), pairs(&[("r1", 100)]));

    handler.create_child(&fw1, coll("r2", 200)).await.unwrap();
    assert_eq!(remote(&plane, &fw1), pairs(&[("r1", 100), ("r2", 200)]));
}

#[tokio::test]
async fn on_disk_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("control-plane.db");

    {
        let plane = Arc::new(LocalControlPlane::open(&path, 1).unwrap());
        let fw1 = seed_firewall(&plane, "fw1", &[]);
        let backend = Backend {
            client: plane.clone(),
            locks: Arc::new(NamedLocks::new()),
            poll_interval: Duration::from_millis(1),
            subscription_id: "sub".to_string(),
        };
        Network::new(backend, Timeouts::default())
            .create_child(&fw1, coll("r1", 100))
            .await
            .unwrap();
    }

    let plane = LocalControlPlane::open(&path, 1).unwrap();
    assert_eq!(remote(&plane, &fw_id("fw1")), pairs(&[("r1", 100)]));
}
