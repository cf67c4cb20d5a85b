//! Primary/secondary failover.
//!
//! The primary connector is retried with exponential backoff; when that
//! fails the secondaries are tried once each, in order. While a secondary
//! is active the primary is re-attempted every `primary_retry_interval`
//! and traffic moves back as soon as it answers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Connector, Disposition, EventStream, Received, Result, Stream, StreamError, StreamStats};
use crate::catalogue::Event;

#[derive(Debug, Clone, Copy)]
pub struct FailoverOptions {
    /// Retry policy for the primary before falling back.
    pub backoff: ExponentialBuilder,
    pub primary_retry_interval: Duration,
}

impl Default for FailoverOptions {
    fn default() -> Self {
        Self {
            backoff: crate::utils::retry::connection_backoff(),
            primary_retry_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Active {
    Primary,
    Secondary(usize),
}

pub struct FailoverStream {
    name: String,
    primary: Arc<dyn Connector>,
    secondaries: Vec<Arc<dyn Connector>>,
    options: FailoverOptions,
    current: Option<(EventStream, Active)>,
    last_primary_attempt: Instant,
    stats: StreamStats,
}

impl FailoverStream {
    /// Connect to the primary or, failing that, the first working secondary.
    pub async fn open(
        primary: Arc<dyn Connector>,
        secondaries: Vec<Arc<dyn Connector>>,
        options: FailoverOptions,
    ) -> Result<Self> {
        let name = format!("failover({})", primary.name());
        let mut stream = Self {
            stats: StreamStats::new(name.clone()),
            name,
            primary,
            secondaries,
            options,
            current: None,
            last_primary_attempt: Instant::now(),
        };
        stream.connect().await?;
        Ok(stream)
    }

    /// Which connector currently carries traffic.
    pub fn active(&self) -> Option<Active> {
        self.current.as_ref().map(|(_, active)| *active)
    }

    async fn connect(&mut self) -> Result<()> {
        self.last_primary_attempt = Instant::now();
        let primary = self.primary.clone();
        let name = self.name.clone();
        let attempt = (|| {
            let primary = primary.clone();
            async move { primary.open().await }
        })
        .retry(self.options.backoff)
        .when(|e: &StreamError| e.disposition() == Disposition::Retry)
        .notify(|err: &StreamError, dur: Duration| {
            warn!(stream = %name, error = %err, delay = ?dur, "Primary unavailable, retrying");
        })
        .await;

        let primary_err = match attempt {
            Ok(stream) => {
                info!(stream = %self.name, "Connected to primary");
                self.current = Some((stream, Active::Primary));
                return Ok(());
            }
            Err(e) => e,
        };

        for (index, secondary) in self.secondaries.iter().enumerate() {
            match secondary.open().await {
                Ok(stream) => {
                    warn!(
                        stream = %self.name,
                        secondary = secondary.name(),
                        error = %primary_err,
                        "Primary failed, switched to secondary"
                    );
                    self.current = Some((stream, Active::Secondary(index)));
                    return Ok(());
                }
                Err(e) => {
                    warn!(stream = %self.name, secondary = secondary.name(), error = %e, "Secondary failed");
                }
            }
        }
        Err(primary_err)
    }

    /// While on a secondary, give the primary one chance per interval.
    async fn maybe_restore_primary(&mut self) {
        let on_secondary = matches!(self.current, Some((_, Active::Secondary(_))));
        if !on_secondary || self.last_primary_attempt.elapsed() < self.options.primary_retry_interval {
            return;
        }
        self.last_primary_attempt = Instant::now();
        match self.primary.open().await {
            Ok(stream) => {
                if let Some((mut old, _)) = self.current.replace((stream, Active::Primary)) {
                    if let Err(e) = old.close().await {
                        debug!(stream = %self.name, error = %e, "Closing secondary failed");
                    }
                }
                info!(stream = %self.name, "Primary is back, switched from secondary");
            }
            Err(e) => {
                warn!(stream = %self.name, error = %e, "Primary still unavailable");
            }
        }
    }

    async fn current(&mut self) -> Result<&mut EventStream> {
        self.maybe_restore_primary().await;
        if self.current.is_none() {
            self.connect().await?;
        }
        match self.current.as_mut() {
            Some((stream, _)) => Ok(stream),
            None => Err(StreamError::Closed(self.name.clone())),
        }
    }

    /// Drop a stream that failed so the next call reconnects.
    fn on_error(&mut self, err: &StreamError) {
        if err.disposition() == Disposition::Retry {
            self.current = None;
        }
    }
}

#[async_trait]
impl Stream for FailoverStream {
    type Item = Arc<Event>;

    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&mut self, timeout: Duration) -> Result<Received<Arc<Event>>> {
        let result = self.current().await?.read(timeout).await;
        match result {
            Ok(Received::Item(event)) => {
                self.stats.record_in(0, 1);
                Ok(Received::Item(event))
            }
            Ok(other) => Ok(other),
            Err(e) => {
                self.on_error(&e);
                Err(e)
            }
        }
    }

    async fn write(&mut self, event: Arc<Event>) -> Result<()> {
        let result = self.current().await?.write(event).await;
        match result {
            Ok(()) => {
                self.stats.record_out(0, 1);
                Ok(())
            }
            Err(e) => {
                self.on_error(&e);
                Err(e)
            }
        }
    }

    async fn flush(&mut self) -> Result<()> {
        match self.current.as_mut() {
            Some((stream, _)) => stream.flush().await,
            None => Ok(()),
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.current.take() {
            Some((mut stream, _)) => stream.close().await,
            None => Ok(()),
        }
    }

    fn statistics(&self) -> StreamStats {
        let stats = self.stats.clone();
        match &self.current {
            Some((stream, _)) => stats.with_inner(stream.statistics()),
            None => stats,
        }
    }
}

/// Builds a [`FailoverStream`] on every `open`.
pub struct FailoverConnector {
    name: String,
    primary: Arc<dyn Connector>,
    secondaries: Vec<Arc<dyn Connector>>,
    options: FailoverOptions,
}

impl FailoverConnector {
    pub fn new(
        primary: Arc<dyn Connector>,
        secondaries: Vec<Arc<dyn Connector>>,
        options: FailoverOptions,
    ) -> Self {
        Self {
            name: format!("failover:{}", primary.name()),
            primary,
            secondaries,
            options,
        }
    }
}

#[async_trait]
impl Connector for FailoverConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<EventStream> {
        let stream = FailoverStream::open(
            self.primary.clone(),
            self.secondaries.clone(),
            self.options,
        )
        .await?;
        Ok(Box::new(stream))
    }
}
