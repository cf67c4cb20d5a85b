//! Feeders: the worker loops bridging one endpoint and the engine.
//!
//! An output feeder drains a subscription into a stream, an input feeder
//! publishes what a stream yields, a bidirectional feeder does both on one
//! stream. Every loop checks its shutdown flag at each iteration and ends
//! with a [`FeederReport`]; nothing unwinds.
//!
//! Stream errors are classified through [`Disposition`]:
//!
//! - `Retry`: close the stream, wait the next backoff delay, reopen and
//!   retry the same event. Exhausting the delays fails the feeder.
//! - `Skip`: log and drop the event, then carry on.
//! - `Fatal`: fail the feeder.
//! - `Shutdown`: stop quietly.

mod acceptor;
mod queue;

pub use acceptor::Acceptor;
pub use queue::PersistentQueue;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::catalogue::Event;
use crate::multiplexing::{Delivery, Engine, EngineError, EventFilter, Subscription};
use crate::stream::{Connector, Disposition, EventStream, Received, StreamError, StreamStats};
use crate::utils::retry::feeder_backoff;

/// Default wait on a subscription or stream before re-checking shutdown.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Which way events flow through an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Engine to endpoint.
    Output,
    /// Endpoint to engine.
    Input,
    Bidirectional,
}

// ============================================================================
// Reports and status
// ============================================================================

/// How a feeder ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeederReport {
    /// Shutdown was requested or the stream reached its end.
    Finished { endpoint: String, events: u64 },
    /// The feeder gave up; the rest of the broker keeps running.
    Failed {
        endpoint: String,
        kind: &'static str,
        error: String,
    },
}

impl FeederReport {
    pub fn endpoint(&self) -> &str {
        match self {
            Self::Finished { endpoint, .. } | Self::Failed { endpoint, .. } => endpoint,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeederPhase {
    Connecting,
    Running,
    Retrying,
    Stopped,
    Failed,
}

#[derive(Debug, Clone)]
pub struct FeederStatus {
    pub phase: FeederPhase,
    /// Events written (output) or published (input), or peers accepted.
    pub events: u64,
    pub last_sequence: Option<u64>,
    /// Engine sequence this endpoint is done with, written or queued. A
    /// restarted output resumes right after it.
    pub committed: Option<u64>,
    pub retries: u64,
    pub last_error: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
    pub stream: Option<StreamStats>,
}

impl Default for FeederStatus {
    fn default() -> Self {
        Self {
            phase: FeederPhase::Connecting,
            events: 0,
            last_sequence: None,
            committed: None,
            retries: 0,
            last_error: None,
            last_activity: None,
            stream: None,
        }
    }
}

pub type SharedStatus = Arc<Mutex<FeederStatus>>;

/// A spawned feeder task.
pub struct FeederHandle {
    endpoint: String,
    cancel: watch::Sender<bool>,
    status: SharedStatus,
    join: JoinHandle<FeederReport>,
}

impl FeederHandle {
    pub fn spawn(
        endpoint: impl Into<String>,
        cancel: watch::Sender<bool>,
        status: SharedStatus,
        feeder: impl Future<Output = FeederReport> + Send + 'static,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            cancel,
            status,
            join: tokio::spawn(feeder),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Ask the feeder to stop at its next loop boundary.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn status(&self) -> FeederStatus {
        self.status.lock().clone()
    }

    /// The live status cell; it keeps the final values after the task ends.
    pub fn shared_status(&self) -> SharedStatus {
        self.status.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn join(self) -> FeederReport {
        match self.join.await {
            Ok(report) => report,
            Err(e) => {
                error!(endpoint = %self.endpoint, error = %e, "Feeder task aborted");
                FeederReport::Failed {
                    endpoint: self.endpoint,
                    kind: "aborted",
                    error: e.to_string(),
                }
            }
        }
    }
}

// ============================================================================
// Shared feeder plumbing
// ============================================================================

/// Where a feeder gets its stream from.
pub enum Link {
    /// Reopened through the connector after every failure.
    Connector(Arc<dyn Connector>),
    /// A stream accepted from a peer; once it breaks the feeder ends.
    Accepted(Option<EventStream>),
}

/// Why a feeder loop stopped.
enum Halt {
    Shutdown,
    /// End of stream, engine stopped, or an accepted peer went away.
    Closed,
    Failed(StreamError),
}

impl From<StreamError> for Halt {
    fn from(err: StreamError) -> Self {
        match err.disposition() {
            Disposition::Shutdown => Halt::Shutdown,
            _ => Halt::Failed(err),
        }
    }
}

impl From<EngineError> for Halt {
    fn from(err: EngineError) -> Self {
        StreamError::from(err).into()
    }
}

pub struct FeederContext {
    endpoint: String,
    engine: Arc<Engine>,
    link: Link,
    backoff: ExponentialBuilder,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
    status: SharedStatus,
}

impl FeederContext {
    pub fn new(
        endpoint: impl Into<String>,
        engine: Arc<Engine>,
        link: Link,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            engine,
            link,
            backoff: feeder_backoff(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown,
            status: SharedStatus::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: ExponentialBuilder) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    fn delays(&self) -> ExponentialBackoff {
        self.backoff.build()
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep for `delay` unless shutdown comes first. Returns whether the
    /// full delay elapsed.
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.shutdown.wait_for(|stop| *stop) => false,
        }
    }

    fn set_phase(&self, phase: FeederPhase) {
        self.status.lock().phase = phase;
    }

    fn record(&self, sequence: Option<u64>) {
        let mut status = self.status.lock();
        status.phase = FeederPhase::Running;
        status.events += 1;
        if sequence.is_some() {
            status.last_sequence = sequence;
        }
        status.last_activity = Some(Utc::now());
    }

    fn record_committed(&self, subscription: &Subscription) {
        self.status.lock().committed = Some(subscription.committed());
    }

    fn snapshot(&self, stream: &Option<EventStream>) {
        if let Some(stream) = stream {
            self.status.lock().stream = Some(stream.statistics());
        }
    }

    /// Open the stream, retrying with backoff.
    async fn connect(&mut self, delays: &mut ExponentialBackoff) -> Result<EventStream, Halt> {
        loop {
            if self.stopping() {
                return Err(Halt::Shutdown);
            }
            let connector = match &mut self.link {
                Link::Accepted(stream) => return stream.take().ok_or(Halt::Closed),
                Link::Connector(connector) => connector.clone(),
            };
            self.set_phase(FeederPhase::Connecting);
            match connector.open().await {
                Ok(stream) => {
                    info!(endpoint = %self.endpoint, stream = stream.name(), "Endpoint connected");
                    self.set_phase(FeederPhase::Running);
                    return Ok(stream);
                }
                Err(e) => self.recover(e, delays).await?,
            }
        }
    }

    /// Decide whether the loop may try again after `err`. Waits the next
    /// backoff delay when it may.
    async fn recover(
        &mut self,
        err: StreamError,
        delays: &mut ExponentialBackoff,
    ) -> Result<(), Halt> {
        match err.disposition() {
            Disposition::Shutdown => return Err(Halt::Shutdown),
            Disposition::Fatal => return Err(Halt::Failed(err)),
            Disposition::Retry | Disposition::Skip => {}
        }
        if matches!(self.link, Link::Accepted(_)) {
            info!(endpoint = %self.endpoint, error = %err, "Peer connection ended");
            return Err(Halt::Closed);
        }
        let Some(delay) = delays.next() else {
            error!(
                endpoint = %self.endpoint,
                kind = err.kind(),
                error = %err,
                "Endpoint retries exhausted"
            );
            return Err(Halt::Failed(err));
        };
        warn!(
            endpoint = %self.endpoint,
            kind = err.kind(),
            error = %err,
            delay = ?delay,
            "Endpoint failed, retrying"
        );
        {
            let mut status = self.status.lock();
            status.phase = FeederPhase::Retrying;
            status.retries += 1;
            status.last_error = Some(err.to_string());
        }
        if self.pause(delay).await {
            Ok(())
        } else {
            Err(Halt::Shutdown)
        }
    }

    /// Write one event, reconnecting as needed. Returns `false` when the
    /// event was dropped as unencodable.
    async fn deliver(
        &mut self,
        stream: &mut Option<EventStream>,
        delays: &mut ExponentialBackoff,
        sequence: u64,
        event: &Arc<Event>,
    ) -> Result<bool, Halt> {
        loop {
            if stream.is_none() {
                *stream = Some(self.connect(delays).await?);
            }
            let Some(current) = stream.as_mut() else {
                continue;
            };
            match current.write(event.clone()).await {
                Ok(()) => {
                    *delays = self.delays();
                    return Ok(true);
                }
                Err(e) if e.disposition() == Disposition::Skip => {
                    warn!(
                        endpoint = %self.endpoint,
                        sequence,
                        event = %event.id,
                        kind = e.kind(),
                        error = %e,
                        "Dropping event"
                    );
                    return Ok(false);
                }
                Err(e) => {
                    warn!(
                        endpoint = %self.endpoint,
                        sequence,
                        kind = e.kind(),
                        error = %e,
                        "Write failed"
                    );
                    close_quietly(stream).await;
                    self.recover(e, delays).await?;
                }
            }
        }
    }

    /// Flush buffered output while idle.
    async fn flush(
        &mut self,
        stream: &mut Option<EventStream>,
        delays: &mut ExponentialBackoff,
    ) -> Result<(), Halt> {
        let Some(current) = stream.as_mut() else {
            return Ok(());
        };
        if let Err(e) = current.flush().await {
            close_quietly(stream).await;
            self.recover(e, delays).await?;
        }
        self.snapshot(stream);
        Ok(())
    }

    fn finish(&self, halt: Halt, events: u64) -> FeederReport {
        match halt {
            Halt::Shutdown | Halt::Closed => {
                self.set_phase(FeederPhase::Stopped);
                info!(endpoint = %self.endpoint, events, "Feeder stopped");
                FeederReport::Finished {
                    endpoint: self.endpoint.clone(),
                    events,
                }
            }
            Halt::Failed(err) => {
                {
                    let mut status = self.status.lock();
                    status.phase = FeederPhase::Failed;
                    status.last_error = Some(err.to_string());
                }
                error!(endpoint = %self.endpoint, kind = err.kind(), error = %err, "Feeder failed");
                FeederReport::Failed {
                    endpoint: self.endpoint.clone(),
                    kind: err.kind(),
                    error: err.to_string(),
                }
            }
        }
    }
}

async fn close_quietly(stream: &mut Option<EventStream>) {
    if let Some(mut current) = stream.take() {
        if let Err(e) = current.flush().await {
            debug!(stream = current.name(), error = %e, "Flush on close failed");
        }
        if let Err(e) = current.close().await {
            debug!(stream = current.name(), error = %e, "Close failed");
        }
    }
}

// ============================================================================
// Output
// ============================================================================

/// Subscription to stream.
///
/// A sequence is committed only after its write succeeded, so an event in
/// flight when the feeder dies is still uncommitted.
pub struct OutputFeeder {
    ctx: FeederContext,
    subscription: Subscription,
    queue: Option<PersistentQueue>,
    in_flight: Option<(u64, Arc<Event>)>,
    replay_left: Vec<Arc<Event>>,
    delivered: u64,
}

impl OutputFeeder {
    pub fn new(ctx: FeederContext, subscription: Subscription) -> Self {
        Self {
            ctx,
            subscription,
            queue: None,
            in_flight: None,
            replay_left: Vec::new(),
            delivered: 0,
        }
    }

    /// Replay the queue file on start and store the unsent backlog in it
    /// on stop.
    pub fn with_queue(mut self, queue: PersistentQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub async fn run(mut self) -> FeederReport {
        info!(
            endpoint = %self.ctx.endpoint,
            subscriber = self.subscription.name(),
            "Output feeder started"
        );
        let mut delays = self.ctx.delays();
        let mut stream = None;

        let halt = match self.open(&mut stream, &mut delays).await {
            Ok(()) => loop {
                if let Err(halt) = self.step(&mut stream, &mut delays).await {
                    break halt;
                }
            },
            Err(halt) => halt,
        };

        self.ctx.snapshot(&stream);
        close_quietly(&mut stream).await;
        self.persist_backlog().await;
        self.ctx.record_committed(&self.subscription);
        self.ctx.finish(halt, self.delivered)
    }

    async fn step(
        &mut self,
        stream: &mut Option<EventStream>,
        delays: &mut ExponentialBackoff,
    ) -> Result<(), Halt> {
        if self.ctx.stopping() {
            return Err(Halt::Shutdown);
        }
        match self.subscription.next(self.ctx.poll_interval).await? {
            Delivery::Event { sequence, event } => {
                self.in_flight = Some((sequence, event.clone()));
                if self.ctx.deliver(stream, delays, sequence, &event).await? {
                    self.delivered += 1;
                    self.ctx.record(Some(sequence));
                }
                self.in_flight = None;
                self.subscription.commit(sequence);
                self.ctx.record_committed(&self.subscription);
            }
            Delivery::Timeout => self.ctx.flush(stream, delays).await?,
            Delivery::EndOfStream => {
                debug!(endpoint = %self.ctx.endpoint, "Engine stopped, output drained");
                return Err(Halt::Closed);
            }
        }
        Ok(())
    }

    /// Connect eagerly, then send whatever a previous run left queued.
    async fn open(
        &mut self,
        stream: &mut Option<EventStream>,
        delays: &mut ExponentialBackoff,
    ) -> Result<(), Halt> {
        *stream = Some(self.ctx.connect(delays).await?);
        self.replay_queue(stream, delays).await
    }

    async fn replay_queue(
        &mut self,
        stream: &mut Option<EventStream>,
        delays: &mut ExponentialBackoff,
    ) -> Result<(), Halt> {
        let Some(queue) = self.queue.clone() else {
            return Ok(());
        };
        let events = match queue.load().await {
            Ok(events) => events,
            Err(e) => {
                warn!(
                    endpoint = %self.ctx.endpoint,
                    path = %queue.path().display(),
                    error = %e,
                    "Could not read persisted queue"
                );
                return Ok(());
            }
        };
        if events.is_empty() {
            return Ok(());
        }
        info!(
            endpoint = %self.ctx.endpoint,
            events = events.len(),
            path = %queue.path().display(),
            "Replaying persisted queue"
        );
        for (index, event) in events.iter().enumerate() {
            match self.ctx.deliver(stream, delays, 0, event).await {
                Ok(written) => {
                    if written {
                        self.delivered += 1;
                        self.ctx.record(None);
                    }
                }
                Err(halt) => {
                    self.replay_left = events[index..].to_vec();
                    return Err(halt);
                }
            }
        }
        if let Err(e) = queue.clear().await {
            warn!(endpoint = %self.ctx.endpoint, error = %e, "Could not clear persisted queue");
        }
        Ok(())
    }

    /// Move everything not yet written into the queue file.
    async fn persist_backlog(&mut self) {
        let Some(queue) = self.queue.clone() else {
            return;
        };
        let mut pending = std::mem::take(&mut self.replay_left);
        let mut last = None;
        if let Some((sequence, event)) = self.in_flight.take() {
            pending.push(event);
            last = Some(sequence);
        }
        match self.subscription.drain() {
            Ok(drained) => {
                for (sequence, event) in drained {
                    pending.push(event);
                    last = Some(sequence);
                }
            }
            Err(e) => {
                warn!(endpoint = %self.ctx.endpoint, error = %e, "Could not drain subscription");
            }
        }
        if pending.is_empty() {
            return;
        }
        match queue.replace(&pending).await {
            Ok(()) => {
                if let Some(sequence) = last {
                    self.subscription.commit(sequence);
                }
                info!(
                    endpoint = %self.ctx.endpoint,
                    events = pending.len(),
                    path = %queue.path().display(),
                    "Persisted unsent events"
                );
            }
            Err(e) => {
                error!(
                    endpoint = %self.ctx.endpoint,
                    events = pending.len(),
                    error = %e,
                    "Could not persist unsent events"
                );
            }
        }
    }
}

// ============================================================================
// Input
// ============================================================================

/// Stream to engine.
pub struct InputFeeder {
    ctx: FeederContext,
    filter: EventFilter,
    reconnect_on_end: bool,
    published: u64,
}

impl InputFeeder {
    pub fn new(ctx: FeederContext) -> Self {
        Self {
            ctx,
            filter: EventFilter::all(),
            reconnect_on_end: false,
            published: 0,
        }
    }

    /// Only publish events accepted by `filter`.
    pub fn with_filter(mut self, filter: EventFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Treat end of stream as a dropped connection rather than completion.
    pub fn reconnect_on_end(mut self, reconnect: bool) -> Self {
        self.reconnect_on_end = reconnect;
        self
    }

    pub async fn run(mut self) -> FeederReport {
        info!(endpoint = %self.ctx.endpoint, "Input feeder started");
        let mut delays = self.ctx.delays();
        let mut stream = None;
        let halt = loop {
            if let Err(halt) = self.step(&mut stream, &mut delays).await {
                break halt;
            }
        };
        self.ctx.snapshot(&stream);
        close_quietly(&mut stream).await;
        self.ctx.finish(halt, self.published)
    }

    async fn step(
        &mut self,
        stream: &mut Option<EventStream>,
        delays: &mut ExponentialBackoff,
    ) -> Result<(), Halt> {
        if self.ctx.stopping() {
            return Err(Halt::Shutdown);
        }
        if stream.is_none() {
            *stream = Some(self.ctx.connect(delays).await?);
        }
        let Some(current) = stream.as_mut() else {
            return Ok(());
        };
        match current.read(self.ctx.poll_interval).await {
            Ok(Received::Item(event)) => {
                *delays = self.ctx.delays();
                publish_filtered(&self.ctx, &self.filter, event, &mut self.published)?;
            }
            Ok(Received::WouldBlock) => self.ctx.snapshot(stream),
            Ok(Received::EndOfStream) => {
                let name = current.name().to_string();
                self.ctx.snapshot(stream);
                close_quietly(stream).await;
                if !self.reconnect_on_end {
                    info!(endpoint = %self.ctx.endpoint, stream = %name, "Input reached end of stream");
                    return Err(Halt::Closed);
                }
                self.ctx
                    .recover(StreamError::Closed(name), delays)
                    .await?;
            }
            Err(e) if e.disposition() == Disposition::Skip => {
                warn!(
                    endpoint = %self.ctx.endpoint,
                    kind = e.kind(),
                    error = %e,
                    "Dropping undecodable event"
                );
            }
            Err(e) => {
                warn!(endpoint = %self.ctx.endpoint, kind = e.kind(), error = %e, "Read failed");
                close_quietly(stream).await;
                self.ctx.recover(e, delays).await?;
            }
        }
        Ok(())
    }
}

fn publish_filtered(
    ctx: &FeederContext,
    filter: &EventFilter,
    event: Arc<Event>,
    published: &mut u64,
) -> Result<Option<u64>, Halt> {
    if !filter.matches(&event) {
        return Ok(None);
    }
    let sequence = ctx.engine.publish(event)?;
    *published += 1;
    ctx.record(Some(sequence));
    Ok(Some(sequence))
}

// ============================================================================
// Bidirectional
// ============================================================================

/// Both directions over one exclusively owned stream.
///
/// Events this feeder published are not echoed back to the same peer.
pub struct BidirectionalFeeder {
    ctx: FeederContext,
    subscription: Subscription,
    filter: EventFilter,
    own: VecDeque<u64>,
    events: u64,
}

impl BidirectionalFeeder {
    pub fn new(ctx: FeederContext, subscription: Subscription) -> Self {
        Self {
            ctx,
            subscription,
            filter: EventFilter::all(),
            own: VecDeque::new(),
            events: 0,
        }
    }

    /// Only publish inbound events accepted by `filter`.
    pub fn with_filter(mut self, filter: EventFilter) -> Self {
        self.filter = filter;
        self
    }

    pub async fn run(mut self) -> FeederReport {
        info!(
            endpoint = %self.ctx.endpoint,
            subscriber = self.subscription.name(),
            "Bidirectional feeder started"
        );
        let mut delays = self.ctx.delays();
        let mut stream = None;
        let halt = loop {
            if let Err(halt) = self.step(&mut stream, &mut delays).await {
                break halt;
            }
        };
        self.ctx.snapshot(&stream);
        close_quietly(&mut stream).await;
        self.ctx.record_committed(&self.subscription);
        self.ctx.finish(halt, self.events)
    }

    async fn step(
        &mut self,
        stream: &mut Option<EventStream>,
        delays: &mut ExponentialBackoff,
    ) -> Result<(), Halt> {
        if self.ctx.stopping() {
            return Err(Halt::Shutdown);
        }
        if stream.is_none() {
            *stream = Some(self.ctx.connect(delays).await?);
        }

        // Outbound: whatever is ready, without waiting.
        let mut wrote = false;
        loop {
            match self.subscription.next(Duration::ZERO).await? {
                Delivery::Event { sequence, event } => {
                    if !self.is_own(sequence)
                        && self.ctx.deliver(stream, delays, sequence, &event).await?
                    {
                        self.events += 1;
                        self.ctx.record(Some(sequence));
                        wrote = true;
                    }
                    self.subscription.commit(sequence);
                    self.ctx.record_committed(&self.subscription);
                }
                Delivery::Timeout => break,
                Delivery::EndOfStream => return Err(Halt::Closed),
            }
        }
        if wrote {
            self.ctx.flush(stream, delays).await?;
        }

        // Inbound.
        let Some(current) = stream.as_mut() else {
            return Ok(());
        };
        match current.read(self.ctx.poll_interval).await {
            Ok(Received::Item(event)) => {
                if let Some(sequence) =
                    publish_filtered(&self.ctx, &self.filter, event, &mut self.events)?
                {
                    self.own.push_back(sequence);
                }
            }
            Ok(Received::WouldBlock) => {}
            Ok(Received::EndOfStream) => {
                let name = current.name().to_string();
                close_quietly(stream).await;
                self.ctx.recover(StreamError::Closed(name), delays).await?;
            }
            Err(e) if e.disposition() == Disposition::Skip => {
                warn!(endpoint = %self.ctx.endpoint, error = %e, "Dropping undecodable event");
            }
            Err(e) => {
                warn!(endpoint = %self.ctx.endpoint, kind = e.kind(), error = %e, "Read failed");
                close_quietly(stream).await;
                self.ctx.recover(e, delays).await?;
            }
        }
        Ok(())
    }

    /// Whether `sequence` was published by this feeder. Sequences arrive in
    /// increasing order, so older entries can be dropped.
    fn is_own(&mut self, sequence: u64) -> bool {
        while self.own.front().is_some_and(|own| *own < sequence) {
            self.own.pop_front();
        }
        if self.own.front() == Some(&sequence) {
            self.own.pop_front();
            return true;
        }
        false
    }
}
