//! Test utilities and mock implementations.
//!
//! Mocks for the stream and hook seams so feeders and the engine can be
//! exercised without sockets.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::ExponentialBuilder;
use parking_lot::Mutex;

use crate::catalogue::{Catalogue, Event};
use crate::events::{self, neb};
use crate::multiplexing::Hooker;
use crate::stream::{Connector, EventStream, Received, Result, Stream, StreamError, StreamStats};

/// The built-in catalogue, shared.
pub fn test_catalogue() -> Arc<Catalogue> {
    Arc::new(events::builtin_catalogue().expect("built-in catalogue registers"))
}

/// A `host_status` event with the given fields.
pub fn host_status(catalogue: &Catalogue, host_id: i32, state: i32, output: &str) -> Arc<Event> {
    let mut event = catalogue
        .create(neb::HOST_STATUS)
        .expect("host_status is registered");
    event.set("host_id", host_id).expect("host_id");
    event.set("state", state).expect("state");
    event.set("output", output).expect("output");
    Arc::new(event)
}

/// Backoff with millisecond delays for tests.
pub fn fast_backoff(max_times: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(5))
        .with_max_times(max_times)
}

// ============================================================================
// Mock connector
// ============================================================================

#[derive(Default)]
struct MockShared {
    written: Mutex<Vec<Arc<Event>>>,
    input: Mutex<VecDeque<Arc<Event>>>,
    fail_writes: AtomicBool,
    fail_close: AtomicBool,
    closed: AtomicUsize,
}

/// Connector whose streams record writes and replay queued input.
#[derive(Default)]
pub struct MockConnector {
    name: String,
    failing: AtomicBool,
    shared: Arc<MockShared>,
    /// Every call to `open`, failed or not.
    pub attempts: AtomicUsize,
    /// Successful opens only.
    pub opened: AtomicUsize,
}

impl MockConnector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Make `open` fail with a refused connection.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make writes on open streams fail with a reset connection.
    pub fn set_fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make `close` on open streams return an error.
    pub fn set_fail_close(&self, fail: bool) {
        self.shared.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Streams closed so far, whether or not the close succeeded.
    pub fn closed(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Queue an event for streams to return from `read`.
    pub fn push_input(&self, event: Arc<Event>) {
        self.shared.input.lock().push_back(event);
    }

    /// Everything written so far, emptying the log.
    pub fn take_written(&self) -> Vec<Arc<Event>> {
        std::mem::take(&mut *self.shared.written.lock())
    }

    pub fn written_len(&self) -> usize {
        self.shared.written.lock().len()
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<EventStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StreamError::Transport(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("{} refused", self.name),
            )));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockStream {
            stats: StreamStats::new(self.name.clone()),
            name: self.name.clone(),
            shared: self.shared.clone(),
        }))
    }
}

struct MockStream {
    name: String,
    shared: Arc<MockShared>,
    stats: StreamStats,
}

#[async_trait]
impl Stream for MockStream {
    type Item = Arc<Event>;

    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&mut self, timeout: Duration) -> Result<Received<Arc<Event>>> {
        let next = self.shared.input.lock().pop_front();
        match next {
            Some(event) => {
                self.stats.record_in(0, 1);
                Ok(Received::Item(event))
            }
            None => {
                tokio::time::sleep(timeout.min(Duration::from_millis(5))).await;
                Ok(Received::WouldBlock)
            }
        }
    }

    async fn write(&mut self, event: Arc<Event>) -> Result<()> {
        if self.shared.fail_writes.load(Ordering::SeqCst) {
            return Err(StreamError::Transport(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                format!("{} reset", self.name),
            )));
        }
        self.shared.written.lock().push(event);
        self.stats.record_out(0, 1);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
        if self.shared.fail_close.load(Ordering::SeqCst) {
            return Err(StreamError::Transport(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("{} already gone", self.name),
            )));
        }
        Ok(())
    }

    fn statistics(&self) -> StreamStats {
        self.stats.clone()
    }
}

// ============================================================================
// Recording hooker
// ============================================================================

/// Hooker that counts callbacks and hands back preset events.
#[derive(Default)]
pub struct RecordingHooker {
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
    pub observed: AtomicUsize,
    on_start: Mutex<Vec<Arc<Event>>>,
    on_stop: Mutex<Vec<Arc<Event>>>,
}

impl RecordingHooker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit_on_start(&self, event: Arc<Event>) {
        self.on_start.lock().push(event);
    }

    pub fn emit_on_stop(&self, event: Arc<Event>) {
        self.on_stop.lock().push(event);
    }
}

#[async_trait]
impl Hooker for RecordingHooker {
    fn name(&self) -> &str {
        "recording"
    }

    async fn starting(&self) -> Vec<Arc<Event>> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.on_start.lock().clone()
    }

    async fn stopping(&self) -> Vec<Arc<Event>> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        self.on_stop.lock().clone()
    }

    fn observe(&self, _event: &Arc<Event>) {
        self.observed.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// PKI
// ============================================================================

#[cfg(test)]
pub struct TestPki {
    pub ca_pem: String,
    pub cert_pem: String,
    pub key_pem: String,
}

/// Throwaway CA plus a leaf certificate for `localhost`.
#[cfg(test)]
pub fn test_pki() -> TestPki {
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};

    let ca_key = KeyPair::generate().expect("ca key");
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).expect("ca params");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).expect("ca cert");

    let leaf_key = KeyPair::generate().expect("leaf key");
    let leaf_params = CertificateParams::new(vec!["localhost".to_string()]).expect("leaf params");
    let leaf_cert = leaf_params
        .signed_by(&leaf_key, &ca_cert, &ca_key)
        .expect("leaf cert");

    TestPki {
        ca_pem: ca_cert.pem(),
        cert_pem: leaf_cert.pem(),
        key_pem: leaf_key.serialize_pem(),
    }
}
