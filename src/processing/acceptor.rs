use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{
    BidirectionalFeeder, Direction, FeederContext, FeederPhase, FeederReport, InputFeeder, Link,
    OutputFeeder, SharedStatus, DEFAULT_POLL_INTERVAL,
};
use crate::bbdo::{BbdoOptions, BbdoStream, Role};
use crate::catalogue::Catalogue;
use crate::multiplexing::{Engine, EngineState, EventFilter, SubscribeOptions};
use crate::stream::{ByteListener, ByteStream};

const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(500);

/// Listens for peers and runs one feeder per accepted connection.
///
/// Each peer negotiates BBDO as the answering side, then gets its own
/// subscription (output), publish path (input) or both.
pub struct Acceptor {
    endpoint: String,
    listener: Box<dyn ByteListener>,
    catalogue: Arc<Catalogue>,
    options: BbdoOptions,
    direction: Direction,
    engine: Arc<Engine>,
    subscribe: SubscribeOptions,
    filter: EventFilter,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
    status: SharedStatus,
}

impl Acceptor {
    pub fn new(
        endpoint: impl Into<String>,
        listener: Box<dyn ByteListener>,
        catalogue: Arc<Catalogue>,
        options: BbdoOptions,
        direction: Direction,
        engine: Arc<Engine>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let endpoint = endpoint.into();
        Self {
            subscribe: SubscribeOptions::new(endpoint.clone()),
            endpoint,
            listener,
            catalogue,
            options,
            direction,
            engine,
            filter: EventFilter::all(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown,
            status: SharedStatus::default(),
        }
    }

    /// Template for the subscriptions of output peers.
    pub fn with_subscription(mut self, options: SubscribeOptions) -> Self {
        self.subscribe = options;
        self
    }

    /// Filter for events published by input peers.
    pub fn with_filter(mut self, filter: EventFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    pub async fn run(mut self) -> FeederReport {
        info!(
            endpoint = %self.endpoint,
            listener = %self.listener.name(),
            direction = ?self.direction,
            "Acceptor started"
        );
        self.status.lock().phase = FeederPhase::Running;
        let mut peers = JoinSet::new();
        let mut accepted = 0u64;

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let next = tokio::select! {
                next = self.listener.accept() => next,
                _ = self.shutdown.wait_for(|stop| *stop) => break,
                _ = tokio::time::sleep(self.poll_interval) => {
                    // Peers drain to end of stream on their own.
                    if self.engine.state() == EngineState::Stopped {
                        info!(endpoint = %self.endpoint, "Engine stopped, no longer accepting");
                        break;
                    }
                    continue;
                }
            };
            match next {
                Ok(Some(bytes)) => {
                    accepted += 1;
                    {
                        let mut status = self.status.lock();
                        status.events = accepted;
                        status.last_activity = Some(chrono::Utc::now());
                    }
                    let peer = format!("{}#{accepted}", self.endpoint);
                    debug!(endpoint = %self.endpoint, peer = %peer, "Peer accepted");
                    peers.spawn(self.serve(peer, bytes));
                }
                Ok(None) => {
                    info!(endpoint = %self.endpoint, "Listener closed");
                    break;
                }
                Err(e) => {
                    warn!(endpoint = %self.endpoint, kind = e.kind(), error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                }
            }
            while let Some(done) = peers.try_join_next() {
                log_peer(&self.endpoint, done);
            }
        }

        while let Some(done) = peers.join_next().await {
            log_peer(&self.endpoint, done);
        }
        self.status.lock().phase = FeederPhase::Stopped;
        info!(endpoint = %self.endpoint, peers = accepted, "Acceptor stopped");
        FeederReport::Finished {
            endpoint: self.endpoint.clone(),
            events: accepted,
        }
    }

    /// Future serving one accepted connection.
    fn serve(
        &self,
        peer: String,
        bytes: ByteStream,
    ) -> impl std::future::Future<Output = FeederReport> + Send + 'static {
        let catalogue = self.catalogue.clone();
        let options = self.options.clone();
        let direction = self.direction;
        let engine = self.engine.clone();
        let subscribe = SubscribeOptions {
            name: peer.clone(),
            ..self.subscribe.clone()
        };
        let filter = self.filter.clone();
        let poll_interval = self.poll_interval;
        let shutdown = self.shutdown.clone();

        async move {
            let stream = match BbdoStream::open(bytes, catalogue, options, Role::Second).await {
                Ok(stream) => stream,
                Err(e) => {
                    return FeederReport::Failed {
                        endpoint: peer,
                        kind: e.kind(),
                        error: e.to_string(),
                    }
                }
            };
            let ctx = FeederContext::new(
                peer.clone(),
                engine.clone(),
                Link::Accepted(Some(Box::new(stream))),
                shutdown,
            )
            .with_poll_interval(poll_interval);

            let subscription = match direction {
                Direction::Input => None,
                Direction::Output | Direction::Bidirectional => match engine.subscribe(subscribe) {
                    Ok(subscription) => Some(subscription),
                    Err(e) => {
                        return FeederReport::Failed {
                            endpoint: peer,
                            kind: "engine",
                            error: e.to_string(),
                        }
                    }
                },
            };
            match (direction, subscription) {
                (Direction::Output, Some(subscription)) => {
                    OutputFeeder::new(ctx, subscription).run().await
                }
                (Direction::Bidirectional, Some(subscription)) => {
                    BidirectionalFeeder::new(ctx, subscription)
                        .with_filter(filter)
                        .run()
                        .await
                }
                _ => InputFeeder::new(ctx).with_filter(filter).run().await,
            }
        }
    }
}

fn log_peer(endpoint: &str, done: Result<FeederReport, tokio::task::JoinError>) {
    match done {
        Ok(FeederReport::Finished { endpoint: peer, events }) => {
            debug!(endpoint, peer = %peer, events, "Peer finished");
        }
        Ok(FeederReport::Failed {
            endpoint: peer,
            kind,
            error,
        }) => {
            warn!(endpoint, peer = %peer, kind, error = %error, "Peer failed");
        }
        Err(e) => warn!(endpoint, error = %e, "Peer task aborted"),
    }
}
