mod common;

use std::sync::Arc;

use common::{RecordingSink, ScriptedApi, monitor};
use streamwatch::config::StorageConfig;
use streamwatch::registry::{
    CommunityId, DestinationSink, EntityId, RegistryLimits, WatchRegistry, WatchStore,
    open_registry,
};

#[tokio::test]
async fn monitor_reads_persisted_watches() {
    let dir = tempfile::tempdir().unwrap();
    let storage = StorageConfig {
        database_url: Some(format!(
            "sqlite://{}",
            dir.path().join("streamwatch.db").display()
        )),
        ..Default::default()
    };

    let registry = Arc::new(open_registry(&storage, RegistryLimits::default()).await);
    assert_eq!(registry.kind(), "sqlite");

    registry
        .set_destination(CommunityId(10), DestinationSink::new("https://hooks.example/10"))
        .await
        .unwrap();
    registry
        .add_entity(CommunityId(10), &EntityId::new("alpha"))
        .await
        .unwrap();
    registry
        .set_message_template(
            CommunityId(10),
            &EntityId::new("alpha"),
            Some("{streamer} went live".into()),
        )
        .await
        .unwrap();

    let snapshot = registry.snapshot().await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(
        snapshot[0].message_template.as_deref(),
        Some("{streamer} went live")
    );

    let api = Arc::new(ScriptedApi::default());
    let sink = Arc::new(RecordingSink::default());
    let mut monitor = monitor(registry, api.clone(), sink.clone());

    api.set_live("alpha", "s1");
    let outcome = monitor.run_cycle().await;

    assert_eq!(outcome.notified, 1);
    assert_eq!(sink.take_pairs(), vec![(10, "alpha".to_string())]);
}
