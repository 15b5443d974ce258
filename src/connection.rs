//! Ownership of the single relay connection.
//!
//! The manager is the only holder of the transport. Everything else talks to
//! the relay through the typed inbound stream returned by
//! [`ConnectionManager::new`] and the [`EventSink`] send primitive.

use crate::config::ReconnectPolicy;
use crate::error::ClientError;
use crate::transport::{Transport, TransportEvent, TransportFactory};
use async_trait::async_trait;
use duocore::auth::{AuthError, CredentialProvider};
use duocore::net::{DeliveryError, EventSink};
use duocore::protocol::{InboundEvent, OutboundEvent, decode_inbound, encode_outbound};
use duocore::{CoreEventBus, ErrorNotice, Event};
use log::{debug, error, info, warn};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct Session {
    pub state: ConnectionState,
    pub last_error: Option<ErrorNotice>,
}

/// Why a single connection attempt did not produce a transport.
enum AttemptError {
    Auth(AuthError),
    Transport(anyhow::Error),
    Superseded,
}

pub struct ConnectionManager {
    transport_factory: Arc<dyn TransportFactory>,
    credentials: Arc<dyn CredentialProvider>,
    policy: ReconnectPolicy,
    event_bus: CoreEventBus,
    session: watch::Sender<Session>,
    inbound: mpsc::Sender<InboundEvent>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    expected_disconnect: AtomicBool,
    /// Bumped on every disconnect, expected or not. Read pumps and connection
    /// attempts started under an older generation become no-ops.
    connection_generation: AtomicU64,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        transport_factory: Arc<dyn TransportFactory>,
        credentials: Arc<dyn CredentialProvider>,
        policy: ReconnectPolicy,
        event_bus: CoreEventBus,
        inbound_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<InboundEvent>) {
        let (inbound, inbound_rx) = mpsc::channel(inbound_capacity.max(1));
        let (session, _) = watch::channel(Session::default());
        let manager = Arc::new(Self {
            transport_factory,
            credentials,
            policy,
            event_bus,
            session,
            inbound,
            transport: Mutex::new(None),
            expected_disconnect: AtomicBool::new(false),
            connection_generation: AtomicU64::new(0),
            tasks: StdMutex::new(Vec::new()),
        });
        (manager, inbound_rx)
    }

    pub fn session(&self) -> Session {
        self.session.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.session.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watches session changes.
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.session.subscribe()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.connection_generation.load(Ordering::SeqCst) == generation
    }

    /// Hands a lifecycle event to the consumer, waiting for room in the
    /// stream like the read pump does.
    async fn raise(&self, event: InboundEvent) {
        if self.inbound.send(event).await.is_err() {
            debug!(target: "Connection", "Inbound stream closed; lifecycle event not delivered");
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().expect("task list lock should not be poisoned");
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Connects to the relay. A no-op while already connecting or connected.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        let started = self.session.send_if_modified(|s| match s.state {
            ConnectionState::Connecting | ConnectionState::Connected => false,
            _ => {
                s.state = ConnectionState::Connecting;
                true
            }
        });
        if !started {
            debug!(target: "Connection", "connect() ignored: already {:?}", self.state());
            return Ok(());
        }

        self.expected_disconnect.store(false, Ordering::Relaxed);
        let generation = self.connection_generation.load(Ordering::SeqCst);
        info!(target: "Connection", "Connecting to relay...");
        self.connect_with_retry(generation).await
    }

    async fn connect_with_retry(self: &Arc<Self>, generation: u64) -> Result<(), ClientError> {
        let mut retries = 0u32;
        loop {
            match self.establish(generation).await {
                Ok(()) => return Ok(()),
                Err(AttemptError::Superseded) => return Err(ClientError::Superseded),
                Err(AttemptError::Auth(e)) => {
                    error!(target: "Connection", "Credential rejected: {e}");
                    self.raise(InboundEvent::ConnectError {
                        reason: e.to_string(),
                    })
                    .await;
                    let err = ClientError::Auth(e);
                    self.fail(generation, &err);
                    return Err(err);
                }
                Err(AttemptError::Transport(e)) => {
                    if !self.is_current(generation) {
                        return Err(ClientError::Superseded);
                    }
                    warn!(target: "Connection", "Connection attempt failed: {e}");
                    self.raise(InboundEvent::ConnectError {
                        reason: e.to_string(),
                    })
                    .await;

                    retries += 1;
                    if retries > self.policy.max_attempts {
                        let err = ClientError::ReconnectExhausted {
                            attempts: retries,
                            last_error: e.to_string(),
                        };
                        error!(target: "Connection", "{err}");
                        self.fail(generation, &err);
                        return Err(err);
                    }

                    let delay = self.policy.delay_for(retries);
                    info!(
                        target: "Connection",
                        "Will attempt to reconnect in {:?} (attempt {})",
                        delay,
                        retries
                    );
                    sleep(delay).await;
                    if !self.is_current(generation) {
                        return Err(ClientError::Superseded);
                    }
                }
            }
        }
    }

    /// One attempt: fresh credential, new transport, read pump.
    async fn establish(self: &Arc<Self>, generation: u64) -> Result<(), AttemptError> {
        let credential = self
            .credentials
            .fetch_credential()
            .await
            .map_err(AttemptError::Auth)?;
        credential.validate().map_err(AttemptError::Auth)?;
        if !self.is_current(generation) {
            return Err(AttemptError::Superseded);
        }

        let (transport, events) = self
            .transport_factory
            .create_transport(&credential)
            .await
            .map_err(AttemptError::Transport)?;

        {
            let mut slot = self.transport.lock().await;
            if !self.is_current(generation) {
                drop(slot);
                transport.disconnect().await;
                return Err(AttemptError::Superseded);
            }
            *slot = Some(transport);
        }

        let manager = self.clone();
        self.track(tokio::spawn(async move {
            manager.read_pump(events, generation).await;
        }));

        self.session.send_modify(|s| {
            s.state = ConnectionState::Connected;
            s.last_error = None;
        });
        info!(target: "Connection", "Connected to relay (gen={generation})");
        self.event_bus.dispatch(&Event::Connected);
        self.raise(InboundEvent::Connected).await;
        Ok(())
    }

    fn fail(&self, generation: u64, err: &ClientError) {
        if !self.is_current(generation) {
            return;
        }
        let Some(notice) = err.notice() else {
            return;
        };
        self.session.send_modify(|s| {
            s.state = ConnectionState::Error;
            s.last_error = Some(notice.clone());
        });
        self.event_bus.notify_error(notice);
    }

    async fn read_pump(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>, generation: u64) {
        debug!(target: "Connection", "Starting read pump (gen={generation})");
        while let Some(event) = events.recv().await {
            if !self.is_current(generation) {
                return;
            }
            match event {
                TransportEvent::DataReceived(data) => match decode_inbound(&data) {
                    Ok(event) if event.is_lifecycle() => {
                        warn!(target: "Connection", "Ignoring '{}' sent by the relay", event.name());
                    }
                    Ok(event) => {
                        if self.inbound.send(event).await.is_err() {
                            debug!(target: "Connection", "Inbound stream closed, stopping read pump");
                            return;
                        }
                    }
                    Err(e) => warn!(target: "Connection", "Dropping malformed frame: {e}"),
                },
                TransportEvent::Connected => debug!(target: "Connection", "Transport connected event received"),
                TransportEvent::Disconnected => break,
            }
        }
        self.on_transport_lost(generation).await;
    }

    async fn on_transport_lost(self: &Arc<Self>, generation: u64) {
        {
            let mut slot = self.transport.lock().await;
            if self
                .connection_generation
                .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            slot.take();
        }
        if self.expected_disconnect.load(Ordering::Relaxed) {
            info!(target: "Connection", "Transport disconnected as expected.");
            return;
        }

        warn!(target: "Connection", "Transport disconnected unexpectedly.");
        self.session.send_modify(|s| s.state = ConnectionState::Connecting);
        self.event_bus.dispatch(&Event::Disconnected);
        self.raise(InboundEvent::Disconnected).await;
        self.spawn_reconnect(generation + 1);
    }

    fn spawn_reconnect(self: &Arc<Self>, generation: u64) {
        let manager = self.clone();
        let task: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(async move {
            if let Err(e) = manager.connect_with_retry(generation).await {
                warn!(target: "Connection", "Reconnection stopped: {e}");
            }
        });
        self.track(tokio::spawn(task));
    }

    /// Releases the transport. Idempotent.
    pub async fn disconnect(&self) {
        self.expected_disconnect.store(true, Ordering::Relaxed);
        let transport = {
            let mut slot = self.transport.lock().await;
            self.connection_generation.fetch_add(1, Ordering::SeqCst);
            slot.take()
        };
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .expect("task list lock should not be poisoned")
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        if let Some(transport) = transport {
            transport.disconnect().await;
        }

        let changed = self.session.send_if_modified(|s| {
            if s.state == ConnectionState::Disconnected {
                return false;
            }
            s.state = ConnectionState::Disconnected;
            true
        });
        if changed {
            info!(target: "Connection", "Disconnected from relay.");
            self.event_bus.dispatch(&Event::Disconnected);
            self.raise(InboundEvent::Disconnected).await;
        }
    }
}

#[async_trait]
impl EventSink for ConnectionManager {
    async fn send_event(&self, event: OutboundEvent) -> Result<(), DeliveryError> {
        let frame = encode_outbound(&event)?;
        let transport = self
            .transport
            .lock()
            .await
            .clone()
            .ok_or(DeliveryError::NotConnected)?;
        transport
            .send(frame.as_bytes())
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingHandler;
    use crate::transport::mock::MockTransportFactory;
    use chrono::Utc;
    use duocore::auth::Credential;
    use duocore::{ErrorKind, RoomId, UserId};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Issues `token-1`, `token-2`, ... or expired credentials.
    #[derive(Default)]
    struct CountingCredentials {
        issued: AtomicUsize,
        expired: bool,
    }

    #[async_trait]
    impl CredentialProvider for CountingCredentials {
        async fn fetch_credential(&self) -> Result<Credential, AuthError> {
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            let credential = Credential::new(format!("token-{n}"));
            if self.expired {
                return Ok(credential.expiring_at(Utc::now() - chrono::Duration::seconds(1)));
            }
            Ok(credential)
        }
    }

    struct Harness {
        manager: Arc<ConnectionManager>,
        inbound: mpsc::Receiver<InboundEvent>,
        factory: Arc<MockTransportFactory>,
        events: Arc<RecordingHandler>,
    }

    fn harness_with(credentials: CountingCredentials, max_attempts: u32) -> Harness {
        harness_with_capacity(credentials, max_attempts, 16)
    }

    fn harness_with_capacity(
        credentials: CountingCredentials,
        max_attempts: u32,
        capacity: usize,
    ) -> Harness {
        let factory = Arc::new(MockTransportFactory::new());
        let events = Arc::new(RecordingHandler::default());
        let bus = CoreEventBus::new();
        bus.add_handler(events.clone());
        let policy = ReconnectPolicy {
            max_attempts,
            randomization_factor: 0.0,
            ..ReconnectPolicy::default()
        };
        let (manager, inbound) =
            ConnectionManager::new(factory.clone(), Arc::new(credentials), policy, bus, capacity);
        Harness {
            manager,
            inbound,
            factory,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(CountingCredentials::default(), 5)
    }

    #[tokio::test(start_paused = true)]
    async fn connect_reaches_connected_and_raises_event() {
        let mut h = harness();
        h.manager.connect().await.unwrap();

        assert_eq!(h.manager.state(), ConnectionState::Connected);
        assert_eq!(h.inbound.recv().await, Some(InboundEvent::Connected));
        assert!(h.events.events().iter().any(|e| matches!(e, Event::Connected)));
        assert_eq!(h.factory.tokens(), vec!["token-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_twice_is_a_noop() {
        let h = harness();
        h.manager.connect().await.unwrap();
        h.manager.connect().await.unwrap();
        assert_eq!(h.factory.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn frames_are_decoded_and_junk_is_dropped() {
        let mut h = harness();
        h.manager.connect().await.unwrap();
        assert_eq!(h.inbound.recv().await, Some(InboundEvent::Connected));

        let conn = h.factory.last();
        conn.deliver("not json").await;
        conn.deliver(r#"{"event":"connected"}"#).await;
        conn.deliver(r#"{"event":"onlineUsers","data":["a@x.com"]}"#).await;

        assert_eq!(
            h.inbound.recv().await,
            Some(InboundEvent::OnlineUsers(vec![UserId::from("a@x.com")]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn send_requires_a_transport() {
        let h = harness();
        let event = OutboundEvent::CallEnded {
            room_id: RoomId::from("r1"),
        };
        assert!(matches!(
            h.manager.send_event(event.clone()).await,
            Err(DeliveryError::NotConnected)
        ));

        h.manager.connect().await.unwrap();
        h.manager.send_event(event).await.unwrap();
        assert_eq!(
            h.factory.last().transport.sent(),
            vec![r#"{"event":"callEnded","data":{"roomId":"r1"}}"#.to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_credential_is_fatal() {
        let mut h = harness_with(
            CountingCredentials {
                expired: true,
                ..Default::default()
            },
            5,
        );

        let err = h.manager.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::Auth(AuthError::Expired)));
        assert_eq!(h.factory.attempts(), 0);

        let session = h.manager.session();
        assert_eq!(session.state, ConnectionState::Error);
        assert_eq!(session.last_error.unwrap().kind, ErrorKind::Auth);
        assert_eq!(h.events.errors()[0].kind, ErrorKind::Auth);
        assert!(matches!(
            h.inbound.recv().await,
            Some(InboundEvent::ConnectError { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_retries_with_a_fresh_credential() {
        let h = harness();
        h.factory.fail_next(1, "connection refused");

        h.manager.connect().await.unwrap();

        assert_eq!(h.factory.tokens(), vec!["token-1", "token-2"]);
        assert!(h.manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_are_reported() {
        let mut h = harness_with(CountingCredentials::default(), 2);
        h.factory.fail_next(10, "connection refused");

        let started = tokio::time::Instant::now();
        let err = h.manager.connect().await.unwrap_err();

        assert!(matches!(err, ClientError::ReconnectExhausted { attempts: 3, .. }));
        assert_eq!(h.factory.attempts(), 3);
        // 1 s then 2 s of backoff between the three attempts.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(3) && waited < Duration::from_secs(4));
        assert_eq!(h.manager.state(), ConnectionState::Error);
        assert_eq!(h.events.errors()[0].kind, ErrorKind::Transport);

        let mut connect_errors = 0;
        while let Ok(event) = h.inbound.try_recv() {
            if matches!(event, InboundEvent::ConnectError { .. }) {
                connect_errors += 1;
            }
        }
        assert_eq!(connect_errors, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_loss_reconnects() {
        let mut h = harness();
        h.manager.connect().await.unwrap();
        assert_eq!(h.inbound.recv().await, Some(InboundEvent::Connected));

        h.factory.last().drop_connection().await;

        assert_eq!(h.inbound.recv().await, Some(InboundEvent::Disconnected));
        assert_eq!(h.inbound.recv().await, Some(InboundEvent::Connected));
        assert_eq!(h.factory.attempts(), 2);
        assert!(h.manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_events_wait_for_room_in_a_full_stream() {
        let mut h = harness_with_capacity(CountingCredentials::default(), 5, 1);
        h.manager.connect().await.unwrap();

        // `Connected` fills the only slot, so the loss has to wait for the consumer.
        h.factory.last().drop_connection().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.inbound.recv().await, Some(InboundEvent::Connected));
        assert_eq!(h.inbound.recv().await, Some(InboundEvent::Disconnected));
        assert_eq!(h.inbound.recv().await, Some(InboundEvent::Connected));
        assert_eq!(h.factory.attempts(), 2);
        assert!(h.manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent_and_stops_reconnection() {
        let mut h = harness();
        h.manager.connect().await.unwrap();
        assert_eq!(h.inbound.recv().await, Some(InboundEvent::Connected));
        let conn = h.factory.last();

        h.manager.disconnect().await;
        h.manager.disconnect().await;

        assert!(conn.transport.is_disconnected());
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert_eq!(h.inbound.recv().await, Some(InboundEvent::Disconnected));
        assert!(h.inbound.try_recv().is_err());

        // The old pump was aborted, so a late close changes nothing.
        let _ = conn.events.send(TransportEvent::Disconnected).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.factory.attempts(), 1);
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_backoff_cancels_the_attempt() {
        let h = harness();
        h.factory.fail_next(10, "connection refused");

        let manager = h.manager.clone();
        let pending = tokio::spawn(async move { manager.connect().await });
        tokio::time::sleep(Duration::from_millis(500)).await;
        h.manager.disconnect().await;

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(ClientError::Superseded)));
        assert_eq!(h.factory.attempts(), 1);
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    }
}
