mod common;

use std::sync::Arc;

use common::{RecordingSink, ScriptedApi, monitor};
use streamwatch::monitor::{CycleStatus, LiveState};
use streamwatch::registry::{
    CommunityId, DestinationSink, EntityId, InMemoryWatchRegistry, WatchStore,
};

async fn watch(registry: &InMemoryWatchRegistry, community: u64, entity: &str) {
    registry
        .set_destination(
            CommunityId(community),
            DestinationSink::new(format!("https://hooks.example/{}", community)),
        )
        .await
        .unwrap();
    registry
        .add_entity(CommunityId(community), &EntityId::new(entity))
        .await
        .unwrap();
}

fn pairs(list: &[(u64, &str)]) -> Vec<(u64, String)> {
    list.iter().map(|(c, e)| (*c, e.to_string())).collect()
}

#[tokio::test]
async fn two_communities_one_session_each() {
    let registry = Arc::new(InMemoryWatchRegistry::new());
    watch(&registry, 1, "alpha").await;
    watch(&registry, 2, "alpha").await;

    let api = Arc::new(ScriptedApi::default());
    let sink = Arc::new(RecordingSink::default());
    let mut monitor = monitor(registry, api.clone(), sink.clone());
    let alpha = EntityId::new("alpha");

    // Cycle 1: live with S1.
    api.set_live("alpha", "S1");
    let outcome = monitor.run_cycle().await;
    assert_eq!(outcome.status, CycleStatus::Completed);
    assert_eq!(sink.take_pairs(), pairs(&[(1, "alpha"), (2, "alpha")]));

    // Cycle 2: same snapshot.
    monitor.run_cycle().await;
    assert!(sink.take_pairs().is_empty());

    // Cycle 3: offline.
    api.set_offline("alpha");
    monitor.run_cycle().await;
    assert!(sink.take_pairs().is_empty());
    assert_eq!(monitor.tracker().live_state(&alpha), LiveState::Offline);
    assert!(!monitor.tracker().is_notified(CommunityId(1), &alpha));
    assert!(!monitor.tracker().is_notified(CommunityId(2), &alpha));

    // Cycle 4: live with S2.
    api.set_live("alpha", "S2");
    monitor.run_cycle().await;
    assert_eq!(sink.take_pairs(), pairs(&[(1, "alpha"), (2, "alpha")]));
}

#[tokio::test]
async fn failed_batch_is_not_an_offline_transition() {
    let registry = Arc::new(InMemoryWatchRegistry::new());
    // Batch size is 2: {alpha, beta} and {gamma}.
    for entity in ["alpha", "beta", "gamma"] {
        watch(&registry, 1, entity).await;
    }

    let api = Arc::new(ScriptedApi::default());
    let sink = Arc::new(RecordingSink::default());
    let mut monitor = monitor(registry, api.clone(), sink.clone());

    api.set_live("alpha", "a1");
    api.set_live("gamma", "g1");
    monitor.run_cycle().await;
    assert_eq!(sink.take_pairs(), pairs(&[(1, "alpha"), (1, "gamma")]));

    // The batch holding alpha fails for a cycle; gamma's batch still succeeds.
    api.fail_batches_with("alpha");
    let outcome = monitor.run_cycle().await;
    assert_eq!(outcome.status, CycleStatus::Partial);
    assert_eq!(outcome.failed_batches, 1);
    assert_eq!(
        monitor.tracker().live_state(&EntityId::new("alpha")),
        LiveState::Live
    );

    // Back to normal with the same session: nothing is re-sent.
    api.recover();
    let outcome = monitor.run_cycle().await;
    assert_eq!(outcome.status, CycleStatus::Completed);
    assert!(sink.take_pairs().is_empty());
}

#[tokio::test]
async fn registry_changes_between_cycles() {
    let registry = Arc::new(InMemoryWatchRegistry::new());
    watch(&registry, 1, "alpha").await;

    let api = Arc::new(ScriptedApi::default());
    let sink = Arc::new(RecordingSink::default());
    let mut monitor = monitor(registry.clone(), api.clone(), sink.clone());

    api.set_live("alpha", "s1");
    monitor.run_cycle().await;
    assert_eq!(sink.take_pairs(), pairs(&[(1, "alpha")]));

    // A second community starts watching mid-session.
    watch(&registry, 2, "Alpha").await;
    monitor.run_cycle().await;
    assert_eq!(sink.take_pairs(), pairs(&[(2, "alpha")]));

    // Everyone stops watching: state is dropped and nothing is polled.
    registry
        .remove_entity(CommunityId(1), &EntityId::new("alpha"))
        .await
        .unwrap();
    registry.delete_community(CommunityId(2)).await.unwrap();
    let calls = api.calls();
    let outcome = monitor.run_cycle().await;
    assert_eq!(outcome.status, CycleStatus::Idle);
    assert_eq!(api.calls(), calls);
}
