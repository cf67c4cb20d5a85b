use super::*;
use crate::events::neb;
use crate::multiplexing::{Engine, EngineConfig};
use crate::test_utils::{host_status, test_catalogue};

fn mapping(catalogue: &Catalogue, metric_id: u32, index_id: u64, name: &str) -> Arc<Event> {
    let event = catalogue
        .create(storage::METRIC_MAPPING)
        .unwrap()
        .with("metric_id", metric_id)
        .unwrap()
        .with("index_id", index_id)
        .unwrap()
        .with("name", name)
        .unwrap();
    Arc::new(event)
}

#[test]
fn test_mirror_keeps_latest_per_key() {
    let catalogue = test_catalogue();
    let mirror = DimensionMirror::new("hosts", vec![neb::HOST_STATUS]);

    assert!(mirror.apply(&host_status(&catalogue, 1, 0, "UP")));
    assert!(mirror.apply(&host_status(&catalogue, 2, 0, "UP")));
    assert!(mirror.apply(&host_status(&catalogue, 1, 2, "DOWN")));
    assert!(!mirror.apply(&mapping(&catalogue, 1, 1, "cpu")));

    assert_eq!(mirror.len(), 2);
    let latest = mirror.lookup(neb::HOST_STATUS, &[Value::Int(1)]).unwrap();
    assert_eq!(latest.get("output").unwrap().as_str(), Some("DOWN"));
    assert!(mirror.lookup(neb::HOST_STATUS, &[Value::Int(3)]).is_none());
}

#[test]
fn test_mirror_ignores_opaque_events() {
    let mirror = DimensionMirror::new("hosts", vec![neb::HOST_STATUS]);
    let opaque = Arc::new(Event::opaque(neb::HOST_STATUS, bytes::Bytes::from_static(b"?")));
    assert!(!mirror.apply(&opaque));
    assert!(mirror.is_empty());
}

#[test]
fn test_metric_index_lookups() {
    let catalogue = test_catalogue();
    let mirror = Arc::new(DimensionMirror::new("metrics", MetricIndex::required_ids()));
    mirror.apply(&mapping(&catalogue, 7, 70, "cpu.load"));
    mirror.apply(&mapping(&catalogue, 8, 80, "mem.used"));

    let index = MetricIndex::new(mirror);
    assert_eq!(index.name_of(7).as_deref(), Some("cpu.load"));
    assert_eq!(index.get(&8).as_deref(), Some("mem.used"));
    assert_eq!(index.index_of(8), Some(80));
    assert_eq!(index.id_of("cpu.load"), Some(7));
    assert!(index.name_of(9).is_none());
    assert!(index.id_of("disk").is_none());
}

#[tokio::test]
async fn test_event_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let catalogue = test_catalogue();
    let file = EventFile::new(dir.path().join("events"), catalogue.clone());

    assert!(file.load().await.unwrap().is_empty());

    let events = vec![
        host_status(&catalogue, 1, 0, "UP"),
        mapping(&catalogue, 3, 30, "rta"),
    ];
    file.replace(&events).await.unwrap();
    assert_eq!(file.load().await.unwrap(), events);

    file.replace(&events[..1]).await.unwrap();
    assert_eq!(file.load().await.unwrap().len(), 1);

    file.clear().await.unwrap();
    assert!(file.load().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_mirror_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let catalogue = test_catalogue();
    let snapshot = EventFile::new(dir.path().join("mirror.snapshot"), catalogue.clone());

    // First run: learn mappings from live traffic.
    {
        let mirror = Arc::new(
            DimensionMirror::new("metrics", MetricIndex::required_ids())
                .with_snapshot(snapshot.clone()),
        );
        let engine = Engine::new(EngineConfig::default());
        engine.hook(mirror.clone());
        engine.start().await.unwrap();
        engine.publish(mapping(&catalogue, 1, 10, "pl")).unwrap();
        engine.publish(host_status(&catalogue, 1, 0, "UP")).unwrap();
        engine.stop().await;
        assert_eq!(mirror.len(), 1);
    }

    // Second run: lookups answer before any event is published.
    let mirror = Arc::new(
        DimensionMirror::new("metrics", MetricIndex::required_ids()).with_snapshot(snapshot),
    );
    let engine = Engine::new(EngineConfig::default());
    engine.hook(mirror.clone());
    engine.start().await.unwrap();

    assert_eq!(MetricIndex::new(mirror).name_of(1).as_deref(), Some("pl"));
    // Loaded state is not republished by default
    assert_eq!(engine.statistics().last_sequence, 0);
}

#[tokio::test]
async fn test_mirror_republishes_snapshot_when_asked() {
    let dir = tempfile::tempdir().unwrap();
    let catalogue = test_catalogue();
    let snapshot = EventFile::new(dir.path().join("hosts"), catalogue.clone());
    snapshot
        .replace(&[host_status(&catalogue, 4, 1, "WARN")])
        .await
        .unwrap();

    let mirror = Arc::new(
        DimensionMirror::new("hosts", vec![neb::HOST_STATUS])
            .with_snapshot(snapshot)
            .with_republish(true),
    );
    let engine = Engine::new(EngineConfig::default());
    engine.hook(mirror);
    engine.start().await.unwrap();
    assert_eq!(engine.statistics().last_sequence, 1);
}
