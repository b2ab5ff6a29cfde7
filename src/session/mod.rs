#![forbid(unsafe_code)]

// Per-client connection session: a small state machine wrapping one
// protocol connection from CONNECT through subscription and message
// receipt. Every meaningful transition is reported as an outcome event;
// protocol failures never escape past this boundary.

mod outcome;

pub use outcome::{DenyReason, ErrorClass, Outcome, OutcomeKind};

use crate::config::{Config, ProtocolStack};
use crate::mqtt::{async_client, blocking, ConnectArgs};
use crate::runtime::{BridgeError, IoRuntime};
use crate::stats::StatsRecorder;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Extra wait granted to the bridge beyond the connect timeout, so the
/// loop's own timeout fires first and the bridge only catches a dead loop.
const BRIDGE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Failed,
    Disconnected,
}

/// State a session shares with its receive loop across the thread
/// boundary.
pub(crate) struct SessionShared {
    connected: AtomicBool,
    messages_received: AtomicU64,
    last_message: Mutex<Option<Instant>>,
}

/// Inbound-event handling shared by both protocol stacks: payload
/// validation, counters, and the connected flag. The receive loops invoke
/// it directly as packets arrive; nothing is polled.
pub struct Inbox {
    client_id: String,
    expected: Vec<u8>,
    shared: Arc<SessionShared>,
    recorder: Arc<StatsRecorder>,
}

impl Inbox {
    pub(crate) fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The broker accepted the connection. Emits the successful connect
    /// outcome from the protocol-ack path, before the subscription goes
    /// out, so a session's outcomes always arrive in transition order.
    pub(crate) fn on_connected(&self, latency: Duration) {
        self.shared.connected.store(true, Ordering::Release);
        self.recorder.record(&Outcome::success(
            OutcomeKind::Connect,
            &self.client_id,
            latency,
        ));
    }

    pub(crate) fn on_subscribed(&self, latency: Duration, granted: bool) {
        let outcome = if granted {
            debug!(client_id = %self.client_id, "subscribed");
            Outcome::success(OutcomeKind::Subscribe, &self.client_id, latency)
        } else {
            warn!(client_id = %self.client_id, "subscription refused");
            Outcome::failure(
                OutcomeKind::Subscribe,
                &self.client_id,
                latency,
                ErrorClass::ProtocolDenied(DenyReason::NotAuthorized),
            )
        };
        self.recorder.record(&outcome);
    }

    pub(crate) fn on_message(&self, payload: &[u8]) {
        self.shared.messages_received.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.shared.last_message.lock() {
            *last = Some(Instant::now());
        }

        if payload == self.expected.as_slice() {
            self.recorder.record(&Outcome::success(
                OutcomeKind::Message,
                &self.client_id,
                Duration::ZERO,
            ));
        } else {
            let shown = String::from_utf8_lossy(&payload[..payload.len().min(50)]);
            warn!(client_id = %self.client_id, payload = %shown, "unexpected payload");
            self.recorder.record(&Outcome::failure(
                OutcomeKind::Message,
                &self.client_id,
                Duration::ZERO,
                ErrorClass::PayloadMismatch,
            ));
        }
    }

    /// The receive loop is going away. `reason` is None for a deliberate
    /// teardown, Some for anything unexpected.
    pub(crate) fn on_disconnected(&self, reason: Option<&str>) {
        self.shared.connected.store(false, Ordering::Release);
        if let Some(reason) = reason {
            warn!(client_id = %self.client_id, reason, "unexpected disconnect");
        }
    }
}

enum Link {
    Bridged(async_client::AsyncLink),
    Blocking(blocking::BlockingLink),
}

impl Link {
    fn close(&self) {
        match self {
            Link::Bridged(link) => link.close(),
            Link::Blocking(link) => link.close(),
        }
    }
}

/// One simulated client's relationship to the target system.
///
/// Owned exclusively by its virtual user; a fresh session is built for
/// every reconnect attempt, reusing the same identity.
pub struct ConnectionSession {
    identity: u64,
    client_id: String,
    stack: ProtocolStack,
    args: ConnectArgs,
    state: SessionState,
    connect_started: Option<Instant>,
    last_error: Option<ErrorClass>,
    shared: Arc<SessionShared>,
    inbox: Arc<Inbox>,
    link: Option<Link>,
    recorder: Arc<StatsRecorder>,
}

impl ConnectionSession {
    pub fn new(
        cfg: &Config,
        tls: Option<Arc<rustls::ClientConfig>>,
        identity: u64,
        recorder: Arc<StatsRecorder>,
    ) -> Self {
        let client_id = cfg.client_id(identity);
        let topic = cfg.topic_for(&client_id);
        let shared = Arc::new(SessionShared {
            connected: AtomicBool::new(false),
            messages_received: AtomicU64::new(0),
            last_message: Mutex::new(None),
        });
        let inbox = Arc::new(Inbox {
            client_id: client_id.clone(),
            expected: cfg.expected_payload.clone().into_bytes(),
            shared: shared.clone(),
            recorder: recorder.clone(),
        });
        let args = ConnectArgs {
            host: cfg.broker.clone(),
            port: cfg.port,
            tls,
            client_id: client_id.clone(),
            topic,
            keepalive: cfg.keepalive,
            connect_timeout: cfg.connect_timeout,
        };

        Self {
            identity,
            client_id,
            stack: cfg.stack,
            args,
            state: SessionState::Idle,
            connect_started: None,
            last_error: None,
            shared,
            inbox,
            link: None,
            recorder,
        }
    }

    /// Initiate the session: connect, authenticate, subscribe. Returns
    /// whether the broker accepted the connection. Failures are reported
    /// as outcome events and through the return value, never panics.
    pub fn connect(&mut self, rt: &IoRuntime) -> bool {
        if self.is_connected() {
            return true;
        }

        self.state = SessionState::Connecting;
        let started = Instant::now();
        self.connect_started = Some(started);

        let result = match self.stack {
            ProtocolStack::Bridged => {
                let wait = self.args.connect_timeout + BRIDGE_GRACE;
                let work = async_client::establish(self.args.clone(), self.inbox.clone());
                match rt.submit(work, wait) {
                    Ok(Ok(link)) => Ok(Link::Bridged(link)),
                    Ok(Err(class)) => Err(class),
                    Err(BridgeError::Timeout) => Err(ErrorClass::Timeout),
                    Err(BridgeError::RuntimeUnavailable) => Err(ErrorClass::RuntimeUnavailable),
                }
            }
            ProtocolStack::Blocking => {
                blocking::establish(self.args.clone(), self.inbox.clone()).map(Link::Blocking)
            }
        };

        let latency = started.elapsed();
        match result {
            Ok(link) => {
                // The success outcome was already emitted by the stack's
                // acknowledgment path (Inbox::on_connected).
                self.link = Some(link);
                self.state = SessionState::Connected;
                debug!(
                    client_id = %self.client_id,
                    latency_ms = latency.as_millis() as u64,
                    "connected"
                );
                true
            }
            Err(class) => {
                self.state = SessionState::Failed;
                self.shared.connected.store(false, Ordering::Release);
                debug!(client_id = %self.client_id, error = %class, "connection failed");
                self.recorder.record(&Outcome::failure(
                    OutcomeKind::Connect,
                    &self.client_id,
                    latency,
                    class.clone(),
                ));
                self.last_error = Some(class);
                false
            }
        }
    }

    /// Idempotent teardown; safe in any state, including a session that
    /// never reached Connected.
    pub fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.shared.connected.store(false, Ordering::Release);
        self.state = SessionState::Disconnected;
    }

    /// Non-blocking state query, maintained by the receive loop.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn identity(&self) -> u64 {
        self.identity
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn messages_received(&self) -> u64 {
        self.shared.messages_received.load(Ordering::Relaxed)
    }

    /// When the most recent connect attempt began.
    pub fn connect_started(&self) -> Option<Instant> {
        self.connect_started
    }

    /// When the most recent message arrived on this session's topic.
    pub fn last_message(&self) -> Option<Instant> {
        self.shared.last_message.lock().ok().and_then(|last| *last)
    }

    pub fn last_error(&self) -> Option<&ErrorClass> {
        self.last_error.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn test_inbox(&self) -> Arc<Inbox> {
        self.inbox.clone()
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::testutil::{Behavior, FakeBroker};
    use crate::stats::StatsRecorder;
    use std::time::Duration;

    fn test_config(broker: &FakeBroker, stack: ProtocolStack) -> Config {
        Config {
            broker: "127.0.0.1".to_string(),
            port: broker.port(),
            connect_timeout: Duration::from_millis(800),
            keepalive: Duration::from_secs(60),
            stack,
            ..Config::default()
        }
    }

    fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        false
    }

    #[test]
    fn connects_and_counts_pushed_messages() {
        let broker = FakeBroker::spawn(Behavior::Serve {
            connack_code: 0,
            publishes: vec![b"ALERT".to_vec(), b"ALERT-tampered".to_vec()],
        });
        let rt = IoRuntime::start().unwrap();
        let recorder = Arc::new(StatsRecorder::new());
        let cfg = test_config(&broker, ProtocolStack::Bridged);

        let mut session = ConnectionSession::new(&cfg, None, 7, recorder.clone());
        assert!(session.connect(&rt));
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.client_id(), "user7");

        assert!(wait_until(|| session.messages_received() == 2));
        assert!(session.last_message().is_some());
        let stats = recorder.snapshot();
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.messages_valid, 1);
        assert_eq!(stats.messages_invalid, 1);

        session.disconnect();
        assert!(!session.is_connected());
        rt.shutdown();
    }

    #[test]
    fn blocking_stack_connects_and_receives() {
        let broker = FakeBroker::spawn(Behavior::Serve {
            connack_code: 0,
            publishes: vec![b"ALERT".to_vec()],
        });
        let rt = IoRuntime::start().unwrap();
        let recorder = Arc::new(StatsRecorder::new());
        let cfg = test_config(&broker, ProtocolStack::Blocking);

        let mut session = ConnectionSession::new(&cfg, None, 9, recorder.clone());
        assert!(session.connect(&rt));
        assert!(wait_until(|| session.messages_received() == 1));
        assert_eq!(recorder.snapshot().messages_valid, 1);

        session.disconnect();
        rt.shutdown();
    }

    #[test]
    fn denial_is_classified_and_counted_once() {
        for stack in [ProtocolStack::Bridged, ProtocolStack::Blocking] {
            let broker = FakeBroker::spawn(Behavior::Serve {
                connack_code: 5,
                publishes: Vec::new(),
            });
            let rt = IoRuntime::start().unwrap();
            let recorder = Arc::new(StatsRecorder::new());
            let cfg = test_config(&broker, stack);

            let mut session = ConnectionSession::new(&cfg, None, 3, recorder.clone());
            assert!(!session.connect(&rt));
            assert_eq!(session.state(), SessionState::Failed);
            assert_eq!(
                session.last_error(),
                Some(&ErrorClass::ProtocolDenied(DenyReason::NotAuthorized))
            );

            let stats = recorder.snapshot();
            assert_eq!(stats.attempts, 1);
            assert_eq!(stats.failures, 1);
            assert_eq!(stats.auth_failures, 1);
            rt.shutdown();
        }
    }

    #[test]
    fn silent_broker_times_out_within_the_bound() {
        for stack in [ProtocolStack::Bridged, ProtocolStack::Blocking] {
            let broker = FakeBroker::spawn(Behavior::Silent);
            let rt = IoRuntime::start().unwrap();
            let recorder = Arc::new(StatsRecorder::new());
            let cfg = test_config(&broker, stack);

            let mut session = ConnectionSession::new(&cfg, None, 4, recorder.clone());
            let started = Instant::now();
            assert!(!session.connect(&rt));
            // Bounded by connect timeout plus grace, with headroom for CI.
            assert!(started.elapsed() < Duration::from_secs(4));
            assert_eq!(session.last_error(), Some(&ErrorClass::Timeout));
            assert_eq!(recorder.snapshot().failures, 1);
            rt.shutdown();
        }
    }

    #[test]
    fn disconnect_is_idempotent_in_any_state() {
        let rt = IoRuntime::start().unwrap();
        let recorder = Arc::new(StatsRecorder::new());
        let cfg = Config {
            broker: "127.0.0.1".to_string(),
            port: 1,
            ..Config::default()
        };

        // Never connected.
        let mut session = ConnectionSession::new(&cfg, None, 1, recorder.clone());
        session.disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);
        session.disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.is_connected());
        assert_eq!(recorder.snapshot(), Default::default());
        rt.shutdown();
    }

    #[test]
    fn dead_runtime_surfaces_runtime_unavailable() {
        let broker = FakeBroker::spawn(Behavior::Serve {
            connack_code: 0,
            publishes: Vec::new(),
        });
        let rt = IoRuntime::start().unwrap();
        rt.shutdown();

        let recorder = Arc::new(StatsRecorder::new());
        let cfg = test_config(&broker, ProtocolStack::Bridged);
        let mut session = ConnectionSession::new(&cfg, None, 2, recorder.clone());
        assert!(!session.connect(&rt));
        assert_eq!(session.last_error(), Some(&ErrorClass::RuntimeUnavailable));
    }

    #[test]
    fn payload_validation_is_exact() {
        let rt = IoRuntime::start().unwrap();
        let recorder = Arc::new(StatsRecorder::new());
        let cfg = Config {
            broker: "127.0.0.1".to_string(),
            port: 1,
            ..Config::default()
        };
        let session = ConnectionSession::new(&cfg, None, 5, recorder.clone());
        let inbox = session.test_inbox();

        inbox.on_message(b"ALERT");
        inbox.on_message(b"");
        inbox.on_message(b"ALER");
        inbox.on_message(b"ALERT!");

        assert_eq!(session.messages_received(), 4);
        let stats = recorder.snapshot();
        assert_eq!(stats.messages_valid, 1);
        assert_eq!(stats.messages_invalid, 3);
        rt.shutdown();
    }
}
