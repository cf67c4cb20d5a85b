use super::*;
use crate::bbdo::{BbdoStream, Role};
use crate::catalogue::Event;
use crate::config::{RetryConfig, TransportMode};
use crate::stream::memory::MemoryListener;
use crate::stream::{Received, Stream};
use crate::test_utils::{host_status, test_catalogue};

fn memory(channel: &str) -> TransportConfig {
    TransportConfig {
        transport_type: TransportType::Memory,
        channel: channel.to_string(),
        ..Default::default()
    }
}

fn memory_listen(channel: &str) -> TransportConfig {
    TransportConfig {
        mode: TransportMode::Listen,
        ..memory(channel)
    }
}

fn config_in(dir: &Path, endpoints: Vec<EndpointConfig>) -> Config {
    Config {
        cache_dir: dir.to_path_buf(),
        shutdown_timeout_ms: 2_000,
        endpoints,
        ..Default::default()
    }
}

async fn accept_peer(listener: &mut MemoryListener, catalogue: &Arc<Catalogue>) -> BbdoStream {
    let bytes = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("no connection")
        .unwrap()
        .unwrap();
    BbdoStream::open(bytes, catalogue.clone(), BbdoOptions::default(), Role::Second)
        .await
        .unwrap()
}

async fn next_event(stream: &mut BbdoStream) -> Arc<Event> {
    for _ in 0..100 {
        match stream.read(Duration::from_millis(50)).await.unwrap() {
            Received::Item(event) => return event,
            Received::WouldBlock => continue,
            Received::EndOfStream => panic!("stream ended"),
        }
    }
    panic!("no event received")
}

async fn read_to_end(mut stream: BbdoStream) -> Vec<Arc<Event>> {
    let mut events = Vec::new();
    for _ in 0..200 {
        match stream.read(Duration::from_millis(50)).await {
            Ok(Received::Item(event)) => events.push(event),
            Ok(Received::WouldBlock) => continue,
            Ok(Received::EndOfStream) | Err(_) => break,
        }
    }
    events
}

#[tokio::test]
async fn test_output_endpoint_delivers_published_events() {
    let dir = tempfile::tempdir().unwrap();
    let catalogue = test_catalogue();
    let hub = MemoryHub::new();
    let mut listener = hub.listen("central");
    let config = config_in(
        dir.path(),
        vec![EndpointConfig::new("central", Direction::Output, memory("central"))],
    );

    let broker = Broker::start_with_hub(config, catalogue.clone(), hub)
        .await
        .unwrap();
    let mut peer = accept_peer(&mut listener, &catalogue).await;

    let sent = host_status(&catalogue, 1, 0, "UP");
    broker.engine().publish(sent.clone()).unwrap();
    assert_eq!(next_event(&mut peer).await, sent);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_input_listener_feeds_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let catalogue = test_catalogue();
    let hub = MemoryHub::new();
    let mut central = hub.listen("central");
    let config = config_in(
        dir.path(),
        vec![
            EndpointConfig::new("pollers", Direction::Input, memory_listen("pollers")),
            EndpointConfig::new("central", Direction::Output, memory("central")),
        ],
    );
    let broker = Broker::start_with_hub(config, catalogue.clone(), hub.clone())
        .await
        .unwrap();
    let mut output_peer = accept_peer(&mut central, &catalogue).await;

    let bytes = hub.connect("pollers").unwrap();
    let mut poller = BbdoStream::open(
        Box::new(bytes),
        catalogue.clone(),
        BbdoOptions::default(),
        Role::First,
    )
    .await
    .unwrap();
    let sent = host_status(&catalogue, 7, 1, "WARN");
    poller.write(sent.clone()).await.unwrap();
    poller.flush().await.unwrap();

    assert_eq!(next_event(&mut output_peer).await, sent);
    broker.shutdown().await;
}

#[tokio::test]
async fn test_status_lists_endpoints_by_name() {
    let dir = tempfile::tempdir().unwrap();
    let hub = MemoryHub::new();
    let _listener = hub.listen("out");
    let config = config_in(
        dir.path(),
        vec![
            EndpointConfig::new("zeta", Direction::Output, memory("out")),
            EndpointConfig::new("alpha", Direction::Input, memory_listen("in")),
        ],
    );
    let broker = Broker::start_with_hub(config, test_catalogue(), hub)
        .await
        .unwrap();

    let status = broker.status();
    let names: Vec<&str> = status.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "zeta"]);
    assert!(status[0].listening);
    assert_eq!(status[0].direction, Direction::Input);
    assert!(!status[1].listening);
    assert!(status.iter().all(|s| s.running));

    broker.shutdown().await;
}

#[tokio::test]
async fn test_apply_keeps_unchanged_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let catalogue = test_catalogue();
    let hub = MemoryHub::new();
    let mut keep_listener = hub.listen("keep");
    let keep = EndpointConfig::new("keep", Direction::Output, memory("keep"));
    let dropped = EndpointConfig::new("drop", Direction::Input, memory_listen("drop"));
    let config = config_in(dir.path(), vec![keep.clone(), dropped]);

    let mut broker = Broker::start_with_hub(config, catalogue.clone(), hub)
        .await
        .unwrap();
    let mut peer = accept_peer(&mut keep_listener, &catalogue).await;
    broker
        .engine()
        .publish(host_status(&catalogue, 1, 0, "UP"))
        .unwrap();
    next_event(&mut peer).await;

    let added = EndpointConfig::new("added", Direction::Input, memory_listen("added"));
    broker.apply(vec![keep, added]).await.unwrap();

    let names: Vec<String> = broker.status().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["added".to_string(), "keep".to_string()]);
    assert_eq!(broker.engine().statistics().last_sequence, 1);
    // Unchanged output kept its connection
    let reconnect = tokio::time::timeout(Duration::from_millis(200), keep_listener.accept()).await;
    assert!(reconnect.is_err());

    let sent = host_status(&catalogue, 2, 0, "UP");
    broker.engine().publish(sent.clone()).unwrap();
    assert_eq!(next_event(&mut peer).await, sent);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_apply_restarts_changed_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let catalogue = test_catalogue();
    let hub = MemoryHub::new();
    let mut first = hub.listen("first");
    let mut second = hub.listen("second");
    let config = config_in(
        dir.path(),
        vec![EndpointConfig::new("central", Direction::Output, memory("first"))],
    );
    let mut broker = Broker::start_with_hub(config, catalogue.clone(), hub)
        .await
        .unwrap();
    let _old = accept_peer(&mut first, &catalogue).await;

    broker
        .apply(vec![EndpointConfig::new(
            "central",
            Direction::Output,
            memory("second"),
        )])
        .await
        .unwrap();
    let mut peer = accept_peer(&mut second, &catalogue).await;

    let sent = host_status(&catalogue, 3, 0, "UP");
    broker.engine().publish(sent.clone()).unwrap();
    assert_eq!(next_event(&mut peer).await, sent);
    assert_eq!(broker.config().endpoints[0].transport.channel, "second");

    broker.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_drains_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let catalogue = test_catalogue();
    let hub = MemoryHub::new();
    let mut listener = hub.listen("central");
    let config = config_in(
        dir.path(),
        vec![EndpointConfig::new("central", Direction::Output, memory("central"))],
    );
    let broker = Broker::start_with_hub(config, catalogue.clone(), hub)
        .await
        .unwrap();
    let peer = accept_peer(&mut listener, &catalogue).await;
    let reader = tokio::spawn(read_to_end(peer));

    for host in 1..=3 {
        broker
            .engine()
            .publish(host_status(&catalogue, host, 0, "UP"))
            .unwrap();
    }
    let reports = broker.shutdown().await;

    assert_eq!(reports.len(), 1);
    assert!(!reports[0].is_failure());
    assert_eq!(reader.await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_persistent_queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let catalogue = test_catalogue();
    let mut endpoint = EndpointConfig::new("central", Direction::Output, memory("central"));
    endpoint.persistent_queue = true;
    let mut config = config_in(dir.path(), vec![endpoint]);
    config.shutdown_timeout_ms = 100;

    // Nobody listens: events pile up and are queued on shutdown.
    let broker = Broker::start_with_hub(config.clone(), catalogue.clone(), MemoryHub::new())
        .await
        .unwrap();
    let sent = vec![
        host_status(&catalogue, 1, 0, "UP"),
        host_status(&catalogue, 2, 1, "DOWN"),
    ];
    for event in &sent {
        broker.engine().publish(event.clone()).unwrap();
    }
    broker.shutdown().await;

    let queue = PersistentQueue::new(dir.path(), "central", catalogue.clone());
    assert_eq!(queue.load().await.unwrap(), sent);

    // Second run: the queue is sent before anything else.
    let hub = MemoryHub::new();
    let mut listener = hub.listen("central");
    let broker = Broker::start_with_hub(config, catalogue.clone(), hub)
        .await
        .unwrap();
    let mut peer = accept_peer(&mut listener, &catalogue).await;
    assert_eq!(next_event(&mut peer).await, sent[0]);
    assert_eq!(next_event(&mut peer).await, sent[1]);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_failed_endpoint_is_reaped() {
    let dir = tempfile::tempdir().unwrap();
    let mut endpoint = EndpointConfig::new("lost", Direction::Output, memory("nowhere"));
    endpoint.retry = RetryConfig {
        max_delay_ms: 1,
        max_attempts: 1,
        ..Default::default()
    };
    let mut broker = Broker::start(config_in(dir.path(), vec![endpoint]), test_catalogue())
        .await
        .unwrap();

    let mut reports = Vec::new();
    for _ in 0..100 {
        reports = broker.reap().await;
        if !reports.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(reports.len(), 1);
    assert!(reports[0].is_failure());
    assert_eq!(reports[0].endpoint(), "lost");
    assert!(broker.status().is_empty());
    broker.shutdown().await;
}

#[tokio::test]
async fn test_restarted_output_resumes_uncommitted_events() {
    let dir = tempfile::tempdir().unwrap();
    let catalogue = test_catalogue();
    let hub = MemoryHub::new();
    let mut endpoint = EndpointConfig::new("central", Direction::Output, memory("central"));
    endpoint.retry = RetryConfig {
        max_delay_ms: 1,
        max_attempts: 1,
        ..Default::default()
    };
    let mut broker = Broker::start_with_hub(
        config_in(dir.path(), vec![endpoint.clone()]),
        catalogue.clone(),
        hub.clone(),
    )
    .await
    .unwrap();

    let sent: Vec<_> = (1..=3)
        .map(|host| host_status(&catalogue, host, 0, "UP"))
        .collect();
    for event in &sent {
        broker.engine().publish(event.clone()).unwrap();
    }
    let mut reports = Vec::new();
    for _ in 0..100 {
        reports = broker.reap().await;
        if !reports.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(reports[0].is_failure());

    let mut listener = hub.listen("central");
    broker.apply(vec![endpoint]).await.unwrap();
    let mut peer = accept_peer(&mut listener, &catalogue).await;
    for event in &sent {
        assert_eq!(&next_event(&mut peer).await, event);
    }

    broker.shutdown().await;
}

#[tokio::test]
async fn test_restart_with_replay_skips_delivered_events() {
    let dir = tempfile::tempdir().unwrap();
    let catalogue = test_catalogue();
    let hub = MemoryHub::new();
    let mut first = hub.listen("first");
    let mut second = hub.listen("second");
    let mut endpoint = EndpointConfig::new("central", Direction::Output, memory("first"));
    endpoint.replay = true;
    let mut broker = Broker::start_with_hub(
        config_in(dir.path(), vec![endpoint.clone()]),
        catalogue.clone(),
        hub,
    )
    .await
    .unwrap();
    let mut old = accept_peer(&mut first, &catalogue).await;
    let delivered = host_status(&catalogue, 1, 0, "UP");
    broker.engine().publish(delivered.clone()).unwrap();
    assert_eq!(next_event(&mut old).await, delivered);

    endpoint.transport = memory("second");
    broker.apply(vec![endpoint]).await.unwrap();
    let mut peer = accept_peer(&mut second, &catalogue).await;
    let fresh = host_status(&catalogue, 2, 1, "DOWN");
    broker.engine().publish(fresh.clone()).unwrap();

    assert_eq!(next_event(&mut peer).await, fresh);
    broker.shutdown().await;
}

#[tokio::test]
async fn test_start_rejects_duplicate_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = EndpointConfig::new("twice", Direction::Input, memory_listen("x"));
    let config = config_in(dir.path(), vec![endpoint.clone(), endpoint]);

    let result = Broker::start(config, test_catalogue()).await;
    assert!(matches!(
        result,
        Err(BrokerError::Config(ConfigError::DuplicateEndpoint(_)))
    ));
}

#[tokio::test]
async fn test_mirror_exposes_metric_index() {
    let dir = tempfile::tempdir().unwrap();
    let catalogue = test_catalogue();
    let broker = Broker::start(config_in(dir.path(), Vec::new()), catalogue.clone())
        .await
        .unwrap();

    let mapping = catalogue
        .create(crate::events::storage::METRIC_MAPPING)
        .unwrap()
        .with("metric_id", 5u32)
        .unwrap()
        .with("index_id", 50u64)
        .unwrap()
        .with("name", "rta")
        .unwrap();
    broker.engine().publish(Arc::new(mapping)).unwrap();

    let index = broker.metric_index().unwrap();
    assert_eq!(index.name_of(5).as_deref(), Some("rta"));
    broker.shutdown().await;
    let snapshot = dir.path().join("mirror.snapshot");
    assert!(!crate::stream::file::existing_splits(&snapshot).await.is_empty());
}
