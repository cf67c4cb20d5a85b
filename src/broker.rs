//! Broker supervisor.
//!
//! Owns the engine, the dimension mirror and one feeder task per
//! configured endpoint. Endpoint failures are isolated: a failed feeder is
//! reported through [`Broker::reap`] and the rest of the broker keeps
//! running.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::bbdo::{BbdoConnector, BbdoOptions, CompressionExtension, ExtensionRegistry, TlsExtension};
use crate::cache::{DimensionMirror, EventFile, MetricIndex};
use crate::catalogue::Catalogue;
use crate::config::{
    validate_endpoints, Config, ConfigError, EndpointConfig, TransportConfig, TransportType,
};
use crate::multiplexing::{Engine, EngineError, SubscribeOptions};
use crate::processing::{
    Acceptor, BidirectionalFeeder, Direction, FeederContext, FeederHandle, FeederReport,
    FeederStatus, InputFeeder, Link, OutputFeeder, PersistentQueue,
};
use crate::stream::failover::{FailoverConnector, FailoverOptions};
use crate::stream::file::FileConnector;
use crate::stream::memory::{MemoryConnector, MemoryHub};
use crate::stream::tcp::{TcpAcceptor, TcpConnector};
use crate::stream::{tls, ByteConnector, ByteListener, Connector, StreamError};
use crate::utils::retry::{connection_backoff, feeder_backoff_with};

const DRAIN_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, BrokerError>;

type FeederFuture = Pin<Box<dyn Future<Output = FeederReport> + Send>>;

/// Point-in-time view of one endpoint.
#[derive(Debug, Clone)]
pub struct EndpointStatus {
    pub name: String,
    pub direction: Direction,
    pub transport: TransportType,
    pub listening: bool,
    /// False once the feeder task has ended.
    pub running: bool,
    pub feeder: FeederStatus,
}

struct RunningEndpoint {
    config: EndpointConfig,
    handle: FeederHandle,
}

pub struct Broker {
    config: Config,
    catalogue: Arc<Catalogue>,
    engine: Arc<Engine>,
    hub: MemoryHub,
    mirror: Option<Arc<DimensionMirror>>,
    endpoints: BTreeMap<String, RunningEndpoint>,
    /// Last committed sequence of outputs that ended, by endpoint name.
    resume: BTreeMap<String, u64>,
}

impl Broker {
    /// Start the engine and every configured endpoint.
    pub async fn start(config: Config, catalogue: Arc<Catalogue>) -> Result<Self> {
        Self::start_with_hub(config, catalogue, MemoryHub::new()).await
    }

    /// Like [`Broker::start`], sharing `hub` for memory transports.
    pub async fn start_with_hub(
        config: Config,
        catalogue: Arc<Catalogue>,
        hub: MemoryHub,
    ) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.cache_dir)
            .await
            .map_err(|source| BrokerError::Io {
                path: config.cache_dir.clone(),
                source,
            })?;

        let engine = Engine::new(config.engine.clone());
        let mirror = if config.mirror.enabled {
            let snapshot = EventFile::new(
                config.cache_dir.join(&config.mirror.snapshot),
                catalogue.clone(),
            );
            let mirror = Arc::new(
                DimensionMirror::new("mirror", config.mirror.event_ids())
                    .with_snapshot(snapshot)
                    .with_republish(config.mirror.republish),
            );
            engine.hook(mirror.clone());
            Some(mirror)
        } else {
            None
        };
        engine.start().await?;

        let endpoints = config.endpoints.clone();
        let mut broker = Self {
            config,
            catalogue,
            engine,
            hub,
            mirror,
            endpoints: BTreeMap::new(),
            resume: BTreeMap::new(),
        };
        for endpoint in &endpoints {
            if let Err(e) = broker.start_endpoint(endpoint).await {
                error!(endpoint = %endpoint.name, error = %e, "Endpoint failed to start");
                broker.shutdown().await;
                return Err(e);
            }
        }
        info!(
            endpoints = broker.endpoints.len(),
            cache_dir = %broker.config.cache_dir.display(),
            "Broker started"
        );
        Ok(broker)
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn memory_hub(&self) -> MemoryHub {
        self.hub.clone()
    }

    pub fn mirror(&self) -> Option<Arc<DimensionMirror>> {
        self.mirror.clone()
    }

    pub fn metric_index(&self) -> Option<MetricIndex> {
        self.mirror.clone().map(MetricIndex::new)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Status of every endpoint, ordered by name.
    pub fn status(&self) -> Vec<EndpointStatus> {
        self.endpoints
            .values()
            .map(|running| EndpointStatus {
                name: running.config.name.clone(),
                direction: running.config.direction,
                transport: running.config.transport.transport_type,
                listening: running.config.transport.is_listener(),
                running: !running.handle.is_finished(),
                feeder: running.handle.status(),
            })
            .collect()
    }

    /// Replace the endpoint set. Unchanged endpoints keep running; the
    /// engine and its retained events are untouched.
    ///
    /// Every endpoint is attempted; the first start error is returned.
    pub async fn apply(&mut self, endpoints: Vec<EndpointConfig>) -> Result<()> {
        validate_endpoints(&endpoints)?;

        let stale: Vec<String> = self
            .endpoints
            .iter()
            .filter(|(name, running)| {
                endpoints
                    .iter()
                    .find(|endpoint| &endpoint.name == *name)
                    .map_or(true, |endpoint| *endpoint != running.config)
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in &stale {
            if let Some(running) = self.endpoints.remove(name) {
                running.handle.stop();
                let report = self.retire(running).await;
                info!(endpoint = %name, report = ?report, "Endpoint stopped for reload");
            }
        }
        self.resume
            .retain(|name, _| endpoints.iter().any(|endpoint| &endpoint.name == name));

        let mut first_error = None;
        let mut started = 0usize;
        for endpoint in &endpoints {
            if self.endpoints.contains_key(&endpoint.name) {
                continue;
            }
            match self.start_endpoint(endpoint).await {
                Ok(()) => started += 1,
                Err(e) => {
                    error!(endpoint = %endpoint.name, error = %e, "Endpoint failed to start");
                    first_error.get_or_insert(e);
                }
            }
        }
        info!(
            stopped = stale.len(),
            started,
            unchanged = endpoints.len().saturating_sub(started),
            "Endpoints reloaded"
        );
        self.config.endpoints = endpoints;
        first_error.map_or(Ok(()), Err)
    }

    /// Collect the reports of feeders that have ended on their own.
    pub async fn reap(&mut self) -> Vec<FeederReport> {
        let finished: Vec<String> = self
            .endpoints
            .iter()
            .filter(|(_, running)| running.handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();
        let mut reports = Vec::with_capacity(finished.len());
        for name in finished {
            if let Some(running) = self.endpoints.remove(&name) {
                let report = self.retire(running).await;
                match &report {
                    FeederReport::Failed { kind, error, .. } => {
                        warn!(endpoint = %name, kind, error = %error, "Endpoint failed")
                    }
                    FeederReport::Finished { events, .. } => {
                        info!(endpoint = %name, events, "Endpoint finished")
                    }
                }
                reports.push(report);
            }
        }
        reports
    }

    /// Stop inputs, stop the engine, let outputs drain for up to
    /// `shutdown_timeout`, then cut off whatever is left. Output queues
    /// are persisted by the feeders themselves.
    pub async fn shutdown(mut self) -> Vec<FeederReport> {
        info!("Broker shutting down");
        let mut reports = Vec::new();

        let inputs: Vec<String> = self
            .endpoints
            .iter()
            .filter(|(_, running)| running.config.direction == Direction::Input)
            .map(|(name, _)| name.clone())
            .collect();
        for name in inputs {
            if let Some(running) = self.endpoints.remove(&name) {
                running.handle.stop();
                reports.push(running.handle.join().await);
            }
        }

        self.engine.stop().await;

        let deadline = Instant::now() + self.config.shutdown_timeout();
        for (name, running) in std::mem::take(&mut self.endpoints) {
            let handle = running.handle;
            let drained = tokio::time::timeout_at(deadline, async {
                while !handle.is_finished() {
                    tokio::time::sleep(DRAIN_POLL).await;
                }
            })
            .await
            .is_ok();
            if !drained {
                warn!(endpoint = %name, "Output did not drain in time, stopping");
                handle.stop();
            }
            reports.push(handle.join().await);
        }

        let failed = reports.iter().filter(|r| r.is_failure()).count();
        info!(endpoints = reports.len(), failed, "Broker stopped");
        reports
    }

    /// Join a feeder and remember where its subscription stood, so a
    /// restart of the same endpoint picks up the uncommitted events.
    async fn retire(&mut self, running: RunningEndpoint) -> FeederReport {
        let RunningEndpoint { config, handle } = running;
        let status = handle.shared_status();
        let report = handle.join().await;
        let committed = status.lock().committed;
        if let Some(sequence) = committed {
            self.resume.insert(config.name, sequence);
        }
        report
    }

    // ========================================================================
    // Endpoint construction
    // ========================================================================

    async fn start_endpoint(&mut self, endpoint: &EndpointConfig) -> Result<()> {
        let handle = self.launch(endpoint).await?;
        info!(
            endpoint = %endpoint.name,
            direction = ?endpoint.direction,
            transport = ?endpoint.transport.transport_type,
            listening = endpoint.transport.is_listener(),
            "Endpoint started"
        );
        self.endpoints.insert(
            endpoint.name.clone(),
            RunningEndpoint {
                config: endpoint.clone(),
                handle,
            },
        );
        Ok(())
    }

    async fn launch(&self, endpoint: &EndpointConfig) -> Result<FeederHandle> {
        let options = bbdo_options(endpoint).await?;
        let (cancel, shutdown) = watch::channel(false);
        let name = endpoint.name.clone();

        if endpoint.transport.is_listener() {
            let listener = self.listener(&endpoint.transport).await?;
            let acceptor = Acceptor::new(
                name.clone(),
                listener,
                self.catalogue.clone(),
                options,
                endpoint.direction,
                self.engine.clone(),
                shutdown,
            )
            .with_subscription(self.subscribe_options(endpoint))
            .with_filter(endpoint.filter.clone());
            let status = acceptor.status();
            return Ok(FeederHandle::spawn(name, cancel, status, acceptor.run()));
        }

        let ctx = FeederContext::new(
            name.clone(),
            self.engine.clone(),
            Link::Connector(self.connector(endpoint, options)),
            shutdown,
        )
        .with_backoff(feeder_backoff_with(
            endpoint.retry.max_delay(),
            endpoint.retry.max_attempts,
        ));
        let status = ctx.status();

        let feeder: FeederFuture = match endpoint.direction {
            Direction::Output => {
                let subscription = self.engine.subscribe(self.subscribe_options(endpoint))?;
                let mut feeder = OutputFeeder::new(ctx, subscription);
                if endpoint.persistent_queue {
                    feeder = feeder.with_queue(PersistentQueue::new(
                        &self.config.cache_dir,
                        &name,
                        self.catalogue.clone(),
                    ));
                }
                Box::pin(feeder.run())
            }
            Direction::Input => Box::pin(
                InputFeeder::new(ctx)
                    .with_filter(endpoint.filter.clone())
                    .reconnect_on_end(endpoint.transport.transport_type != TransportType::File)
                    .run(),
            ),
            Direction::Bidirectional => {
                let subscription = self.engine.subscribe(self.subscribe_options(endpoint))?;
                Box::pin(
                    BidirectionalFeeder::new(ctx, subscription)
                        .with_filter(endpoint.filter.clone())
                        .run(),
                )
            }
        };
        Ok(FeederHandle::spawn(name, cancel, status, feeder))
    }

    /// A restarted connecting endpoint resumes after its last committed
    /// sequence; otherwise `replay` starts at the oldest retained event.
    fn subscribe_options(&self, endpoint: &EndpointConfig) -> SubscribeOptions {
        let options = SubscribeOptions::new(endpoint.name.clone()).filter(endpoint.filter.clone());
        if !endpoint.transport.is_listener() {
            if let Some(committed) = self.resume.get(&endpoint.name) {
                info!(endpoint = %endpoint.name, committed, "Resuming after last committed event");
                return options.replay_from(*committed);
            }
        }
        match self.engine.statistics().oldest_retained {
            Some(oldest) if endpoint.replay => options.replay_from(oldest.saturating_sub(1)),
            _ => options,
        }
    }

    async fn listener(&self, transport: &TransportConfig) -> Result<Box<dyn ByteListener>> {
        match transport.transport_type {
            TransportType::Tcp => Ok(Box::new(TcpAcceptor::bind(&transport.addr()).await?)),
            TransportType::Memory => Ok(Box::new(self.hub.listen(&transport.channel))),
            TransportType::File => Err(StreamError::Config("file transports cannot listen".into()).into()),
        }
    }

    fn byte_connector(&self, transport: &TransportConfig) -> Arc<dyn ByteConnector> {
        match transport.transport_type {
            TransportType::Tcp => Arc::new(TcpConnector::new(
                transport.host.clone(),
                transport.port,
                transport.connect_timeout(),
            )),
            TransportType::File => Arc::new(FileConnector::new(
                transport.path.clone().unwrap_or_default(),
                transport.max_file_size,
            )),
            TransportType::Memory => {
                Arc::new(MemoryConnector::new(self.hub.clone(), transport.channel.clone()))
            }
        }
    }

    fn bbdo_connector(&self, transport: &TransportConfig, options: &BbdoOptions) -> Arc<dyn Connector> {
        let mut options = options.clone();
        // Files have nobody to negotiate with.
        options.coarse |= transport.transport_type == TransportType::File;
        Arc::new(BbdoConnector::new(
            self.byte_connector(transport),
            self.catalogue.clone(),
            options,
        ))
    }

    fn connector(&self, endpoint: &EndpointConfig, options: BbdoOptions) -> Arc<dyn Connector> {
        let primary = self.bbdo_connector(&endpoint.transport, &options);
        if endpoint.failover.is_empty() {
            return primary;
        }
        let secondaries = endpoint
            .failover
            .iter()
            .map(|transport| self.bbdo_connector(transport, &options))
            .collect();
        Arc::new(FailoverConnector::new(
            primary,
            secondaries,
            FailoverOptions {
                backoff: connection_backoff(),
                primary_retry_interval: endpoint.retry.primary_retry_interval(),
            },
        ))
    }
}

async fn read_pem(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|source| BrokerError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Session options with TLS and compression registered in that order.
async fn bbdo_options(endpoint: &EndpointConfig) -> Result<BbdoOptions> {
    let mut extensions = ExtensionRegistry::new();
    if let Some(settings) = &endpoint.tls {
        let mut extension = TlsExtension::new(settings.handshake_timeout());
        if endpoint.transport.is_listener() {
            if let (Some(cert), Some(key)) = (&settings.cert_file, &settings.key_file) {
                let config = tls::server_config(&read_pem(cert).await?, &read_pem(key).await?)?;
                extension = extension.with_server(config);
            }
        } else if let Some(ca) = &settings.ca_file {
            let config = tls::client_config(&read_pem(ca).await?)?;
            extension = extension.with_client(config, settings.server_name.clone());
        }
        extensions.register(Arc::new(extension));
    }
    if endpoint.bbdo.compression {
        extensions.register(Arc::new(CompressionExtension::new(
            endpoint.bbdo.compression_buffer,
        )));
    }
    Ok(BbdoOptions {
        coarse: endpoint.bbdo.coarse,
        ack_limit: endpoint.bbdo.ack_limit,
        relay_unknown: endpoint.bbdo.relay_unknown,
        max_payload: endpoint.bbdo.max_payload,
        negotiation_timeout: Duration::from_millis(endpoint.bbdo.negotiation_timeout_ms),
        extensions,
    })
}

#[cfg(test)]
mod tests;
