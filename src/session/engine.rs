//! Session core
//!
//! A [`Session`] composes the state machine, router and delivery tracker
//! around one [`Transport`]. Caller-facing operations only lock short-lived
//! state and post commands; a single supervisor task owns the
//! transport, drives (re)connection, sends, retries and inbound dispatch.
//!
//! Lock order, where more than one is held: runtime, machine, tracker.
//! The router is only ever held alone or before runtime.

use crate::config::SessionConfig;
use crate::error::{ConnectError, InvalidTopicFilter, PublishError};
use crate::observability::{MetricsSnapshot, SessionMetrics};
use crate::protocol::codec;
use crate::protocol::topics::{validate_device_id, validate_publish_topic};
use crate::protocol::{DevicePayload, Message, QoS, TopicBuilder};
use crate::session::events::{EventStream, InboundEvent, InboundMessage};
use crate::session::router::{Handler, SubscriptionHandle, TopicRouter};
use crate::session::state::{
    ConnectionEvent, ConnectionState, ConnectionStateMachine, InvalidTransition, ReconnectConfig,
    ReconnectionDecision, Transition,
};
use crate::session::tracker::{
    DeliveryCompleter, DeliveryHandle, DeliveryTracker, RetryPolicy, TickOutcome,
};
use crate::transport::{OutboundPublish, Transport, TransportError, TransportEvent};
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

/// Events buffered per `events()` consumer before the slowest one lags
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Work posted from caller-facing operations to the supervisor
#[derive(Debug)]
enum SessionCommand {
    /// A tracked delivery is ready to go on the wire
    Publish { packet_id: u16 },
    PublishUntracked {
        message: Message,
        completer: DeliveryCompleter,
    },
    Subscribe { filter: String, qos: QoS },
    Unsubscribe { filter: String },
}

/// Tracker timestamps follow tokio's clock
fn now() -> std::time::Instant {
    time::Instant::now().into_std()
}

/// Forwards routed events onto the session's broadcast channel
struct EventForwarder {
    events_tx: broadcast::Sender<InboundEvent>,
}

impl Handler for EventForwarder {
    fn handle(&self, event: &InboundEvent) {
        let _ = self.events_tx.send(event.clone());
    }
}

struct Runtime {
    commands: mpsc::UnboundedSender<SessionCommand>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

struct SessionInner {
    machine: Mutex<ConnectionStateMachine>,
    state_rx: watch::Receiver<ConnectionState>,
    router: Mutex<TopicRouter>,
    tracker: Mutex<DeliveryTracker>,
    events_tx: broadcast::Sender<InboundEvent>,
    forwarder: Arc<dyn Handler>,
    metrics: SessionMetrics,
    /// Parked here whenever no supervisor owns it
    transport: Mutex<Option<Box<dyn Transport>>>,
    runtime: Mutex<Option<Runtime>>,
    closed: AtomicBool,
    close_done: Mutex<bool>,
}

impl SessionInner {
    fn emit(&self, event: InboundEvent) {
        // No receivers is fine
        let _ = self.events_tx.send(event);
    }

    fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    fn apply_locked(
        &self,
        machine: &mut ConnectionStateMachine,
        event: ConnectionEvent,
    ) -> Result<Transition, InvalidTransition> {
        let transition = machine.apply(event)?;
        if transition.changed() {
            self.metrics.state_transition();
            self.emit(InboundEvent::StateChanged {
                from: transition.from,
                to: transition.to,
            });
        }
        Ok(transition)
    }

    async fn apply(&self, event: ConnectionEvent) -> Result<Transition, InvalidTransition> {
        let mut machine = self.machine.lock().await;
        self.apply_locked(&mut machine, event)
    }

    async fn post(&self, command: SessionCommand) {
        if let Some(runtime) = self.runtime.lock().await.as_ref() {
            // A stopped supervisor resubscribes from the router next time
            let _ = runtime.commands.send(command);
        }
    }

    /// Decode and route one inbound publish
    async fn dispatch_inbound(&self, topic: String, payload: Bytes, qos: QoS, retain: bool) {
        self.metrics.message_received();

        let handlers = self.router.lock().await.matching_handlers(&topic);
        if handlers.is_empty() {
            self.metrics.message_unhandled();
            warn!(%topic, "Message on a topic with no subscription");
            self.emit(InboundEvent::Unhandled { topic });
            return;
        }

        let event = match codec::decode(&payload) {
            Ok(payload) => {
                debug!(%topic, kind = payload.kind_name(), "Message received");
                InboundEvent::Message(InboundMessage {
                    topic,
                    qos,
                    retain,
                    payload,
                })
            }
            Err(error) => {
                self.metrics.message_malformed();
                warn!(%topic, %error, "Malformed message");
                InboundEvent::Malformed { topic, error }
            }
        };

        for handler in &handlers {
            handler.handle(&event);
        }
    }
}

/// Aborts a still-running supervisor once the last `Session` handle is gone
struct RuntimeGuard {
    inner: Arc<SessionInner>,
}

impl Drop for RuntimeGuard {
    fn drop(&mut self) {
        if let Ok(mut runtime) = self.inner.runtime.try_lock() {
            if let Some(runtime) = runtime.take() {
                runtime.join.abort();
            }
        }
    }
}

/// Handle to one messaging session; clones share it
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
    _guard: Arc<RuntimeGuard>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new<T: Transport>(transport: T) -> Self {
        Self::with_event_capacity(transport, DEFAULT_EVENT_CAPACITY)
    }

    /// Session whose event consumers may fall `capacity` events behind
    pub fn with_event_capacity<T: Transport>(transport: T, capacity: usize) -> Self {
        let (events_tx, _) = broadcast::channel(capacity.max(1));
        let forwarder: Arc<dyn Handler> = Arc::new(EventForwarder {
            events_tx: events_tx.clone(),
        });
        let machine = ConnectionStateMachine::new(ReconnectConfig::default());
        let state_rx = machine.watch();
        let transport: Box<dyn Transport> = Box::new(transport);

        let inner = Arc::new(SessionInner {
            machine: Mutex::new(machine),
            state_rx,
            router: Mutex::new(TopicRouter::new()),
            tracker: Mutex::new(DeliveryTracker::default()),
            events_tx,
            forwarder,
            metrics: SessionMetrics::new(),
            transport: Mutex::new(Some(transport)),
            runtime: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_done: Mutex::new(false),
        });

        Self {
            _guard: Arc::new(RuntimeGuard {
                inner: Arc::clone(&inner),
            }),
            inner,
        }
    }

    /// Start the session against `config`
    ///
    /// Returns once the broker has acknowledged the connection and the
    /// session's subscriptions are restored, or once a transient failure hands
    /// over to automatic reconnection. Fails with the classified error when
    /// the attempt fails for good.
    pub async fn connect(&self, config: SessionConfig) -> Result<(), ConnectError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ConnectError::SessionClosed);
        }
        config.validate()?;

        let ready_rx = {
            let mut runtime = self.inner.runtime.lock().await;

            let state = self.inner.state();
            if state != ConnectionState::Disconnected {
                return Err(ConnectError::AlreadyConnected { state });
            }
            // A supervisor that gave up has already parked the transport
            if let Some(previous) = runtime.take() {
                let _ = previous.join.await;
            }

            let mut machine = self.inner.machine.lock().await;
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(ConnectError::SessionClosed);
            }
            let state = machine.state();
            if state != ConnectionState::Disconnected {
                return Err(ConnectError::AlreadyConnected { state });
            }
            let transport = self
                .inner
                .transport
                .lock()
                .await
                .take()
                .ok_or(ConnectError::SessionClosed)?;

            machine.reconfigure(ReconnectConfig::from_session(&config));
            self.inner
                .tracker
                .lock()
                .await
                .set_policy(RetryPolicy::from(&config.delivery));
            self.inner
                .apply_locked(&mut machine, ConnectionEvent::ConnectRequested)
                .map_err(|_| ConnectError::AlreadyConnected { state })?;

            let (commands_tx, commands_rx) = mpsc::unbounded_channel();
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let (ready_tx, ready_rx) = oneshot::channel();

            let span = crate::session_span!(client_id = %config.client_id);
            let supervisor = Supervisor::new(
                Arc::clone(&self.inner),
                transport,
                config,
                commands_rx,
                shutdown_rx,
                ready_tx,
            );
            let join = tokio::spawn(supervisor.run().instrument(span));

            *runtime = Some(Runtime {
                commands: commands_tx,
                shutdown: shutdown_tx,
                join,
            });
            ready_rx
        };

        ready_rx.await.unwrap_or(Err(ConnectError::SessionClosed))
    }

    /// Subscribe with the session's event forwarder; matches show up on [`Session::events`]
    pub async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
    ) -> Result<SubscriptionHandle, InvalidTopicFilter> {
        let forwarder = Arc::clone(&self.inner.forwarder);
        self.subscribe_with(filter, qos, forwarder).await
    }

    pub async fn subscribe_with(
        &self,
        filter: &str,
        qos: QoS,
        handler: Arc<dyn Handler>,
    ) -> Result<SubscriptionHandle, InvalidTopicFilter> {
        let mut router = self.inner.router.lock().await;
        let before = router.broker_qos(filter);
        let handle = router.register(filter, qos, handler)?;
        let after = router.broker_qos(filter);

        if let Some(qos) = after.filter(|qos| Some(*qos) != before) {
            self.inner
                .post(SessionCommand::Subscribe {
                    filter: filter.to_string(),
                    qos,
                })
                .await;
        }
        Ok(handle)
    }

    /// Drop one registration; the broker filter goes once nothing uses it
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut router = self.inner.router.lock().await;
        if !router.unregister(handle) {
            return false;
        }
        if !router.has_filter(handle.filter()) {
            self.inner
                .post(SessionCommand::Unsubscribe {
                    filter: handle.filter().to_string(),
                })
                .await;
        }
        true
    }

    /// Publish a raw payload
    ///
    /// Returns `NotConnected` whenever the session is `Disconnected`, even
    /// with `auto_reconnect` set: before `connect`, after `close`, and after
    /// the supervisor has given up reconnecting. While `Connecting` or
    /// `Reconnecting`, QoS 1/2 publishes are held for the next connection
    /// and QoS 0 ones go to the offline queue.
    pub async fn publish<T, P>(
        &self,
        topic: T,
        payload: P,
        qos: QoS,
        retain: bool,
    ) -> Result<DeliveryHandle, PublishError>
    where
        T: Into<String>,
        P: Into<Bytes>,
    {
        self.publish_message(Message::new(topic, payload, qos, retain))
            .await
    }

    pub async fn publish_message(&self, message: Message) -> Result<DeliveryHandle, PublishError> {
        let result = self.submit(message).await;
        if let Err(error) = &result {
            self.inner.metrics.publish_failed();
            debug!(%error, "Publish rejected");
        }
        result
    }

    async fn submit(&self, message: Message) -> Result<DeliveryHandle, PublishError> {
        validate_publish_topic(&message.topic)?;
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(PublishError::NotConnected);
        }

        let runtime = self.inner.runtime.lock().await;
        // Held until the command is queued so the supervisor can't give up in between
        let machine = self.inner.machine.lock().await;
        if !machine.state().is_active() {
            return Err(PublishError::NotConnected);
        }
        let runtime = runtime.as_ref().ok_or(PublishError::NotConnected)?;

        if message.qos.is_tracked() {
            let mut tracker = self.inner.tracker.lock().await;
            let (packet_id, handle) = tracker.track(message, now())?;
            if runtime
                .commands
                .send(SessionCommand::Publish { packet_id })
                .is_err()
            {
                tracker.fail(packet_id, PublishError::NotConnected);
                return Err(PublishError::NotConnected);
            }
            Ok(handle)
        } else {
            let (completer, handle) = DeliveryHandle::channel(None);
            runtime
                .commands
                .send(SessionCommand::PublishUntracked { message, completer })
                .map_err(|_| PublishError::NotConnected)?;
            Ok(handle)
        }
    }

    /// Encode `payload` and publish it to the device's command topic
    pub async fn send_command(
        &self,
        device_id: &str,
        payload: &DevicePayload,
        qos: QoS,
    ) -> Result<DeliveryHandle, PublishError> {
        self.send_to_device(TopicBuilder::command_topic(device_id), device_id, payload, qos)
            .await
    }

    /// Encode `payload` and publish it to the device's content topic
    ///
    /// The device answers with a `ContentResponse` on
    /// [`TopicBuilder::content_response_topic`].
    pub async fn send_content(
        &self,
        device_id: &str,
        payload: &DevicePayload,
        qos: QoS,
    ) -> Result<DeliveryHandle, PublishError> {
        self.send_to_device(TopicBuilder::content_topic(device_id), device_id, payload, qos)
            .await
    }

    async fn send_to_device(
        &self,
        topic: String,
        device_id: &str,
        payload: &DevicePayload,
        qos: QoS,
    ) -> Result<DeliveryHandle, PublishError> {
        if validate_device_id(device_id).is_err() {
            return Err(PublishError::InvalidTopic {
                topic,
                reason: "device id must be a single non-empty topic level",
            });
        }

        let mut message = Message::new(topic, codec::encode(payload), qos, false);
        message.correlation_id = payload.correlation_id();
        self.publish_message(message).await
    }

    /// Events from now on
    pub fn events(&self) -> EventStream {
        EventStream::new(self.inner.events_tx.subscribe())
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        let pending = self.pending_deliveries().await;
        self.inner.metrics.snapshot(pending)
    }

    pub async fn pending_deliveries(&self) -> usize {
        self.inner.tracker.lock().await.len()
    }

    /// Graceful teardown; later calls return immediately
    ///
    /// Every delivery still pending when this returns has been resolved with
    /// `NotConnected`, and the transport has been released.
    pub async fn close(&self) {
        let mut done = self.inner.close_done.lock().await;
        if *done {
            return;
        }
        self.inner.closed.store(true, Ordering::SeqCst);
        info!(state = %self.state(), "Closing session");

        if let Err(e) = self.inner.apply(ConnectionEvent::CloseRequested).await {
            warn!(error = %e, "Close request rejected by state machine");
        }

        let runtime = self.inner.runtime.lock().await.take();
        if let Some(runtime) = runtime {
            let _ = runtime.shutdown.send(true);
            if let Err(e) = runtime.join.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Session supervisor panicked");
                }
            }
        }

        // Covers a supervisor that had already given up, or never ran
        let failed = self
            .inner
            .tracker
            .lock()
            .await
            .fail_all(PublishError::NotConnected);
        if failed > 0 {
            warn!(failed, "Deliveries abandoned at close");
        }
        self.inner.router.lock().await.clear();
        self.inner.transport.lock().await.take();
        {
            let mut machine = self.inner.machine.lock().await;
            if machine.state() == ConnectionState::Closing {
                let _ = self.inner.apply_locked(&mut machine, ConnectionEvent::Closed);
            }
        }

        *done = true;
        info!("Session closed");
    }
}

/// QoS 0 publishes and unsubscribes held while the connection is down
struct OfflineBuffer {
    limit: usize,
    messages: VecDeque<(Message, DeliveryCompleter)>,
    unsubscribes: Vec<String>,
}

impl OfflineBuffer {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            messages: VecDeque::new(),
            unsubscribes: Vec::new(),
        }
    }

    fn absorb(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::PublishUntracked { message, completer } => {
                if self.messages.len() >= self.limit {
                    warn!(topic = %message.topic, limit = self.limit, "Offline queue full");
                    completer.complete(Err(PublishError::QueueFull { limit: self.limit }));
                } else {
                    self.messages.push_back((message, completer));
                }
            }
            SessionCommand::Publish { packet_id } => {
                debug!(packet_id, "Tracked publish waits for the connection");
            }
            SessionCommand::Subscribe { filter, .. } => {
                debug!(%filter, "Subscription applies on connect");
            }
            SessionCommand::Unsubscribe { filter } => {
                if !self.unsubscribes.contains(&filter) {
                    self.unsubscribes.push(filter);
                }
            }
        }
    }

    fn fail_all(&mut self) {
        for (_, completer) in self.messages.drain(..) {
            completer.complete(Err(PublishError::NotConnected));
        }
        self.unsubscribes.clear();
    }
}

enum Established {
    Connected,
    Shutdown,
    GaveUp(TransportError),
}

enum Served {
    Shutdown,
    Lost(String),
}

/// Resolves once shutdown is signalled (or its sender is gone)
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stop = *shutdown.borrow_and_update();
        if stop {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn periodic(period: Duration) -> Interval {
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Owns the transport for one `connect` .. give-up/close lifetime
struct Supervisor {
    inner: Arc<SessionInner>,
    transport: Box<dyn Transport>,
    config: SessionConfig,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    shutdown: watch::Receiver<bool>,
    offline: OfflineBuffer,
    ready: Option<oneshot::Sender<Result<(), ConnectError>>>,
    online: bool,
    connected_once: bool,
    started: std::time::Instant,
}

impl Supervisor {
    fn new(
        inner: Arc<SessionInner>,
        transport: Box<dyn Transport>,
        config: SessionConfig,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        shutdown: watch::Receiver<bool>,
        ready: oneshot::Sender<Result<(), ConnectError>>,
    ) -> Self {
        let offline = OfflineBuffer::new(config.offline_queue_limit);
        Self {
            inner,
            transport,
            config,
            commands,
            shutdown,
            offline,
            ready: Some(ready),
            online: false,
            connected_once: false,
            started: now(),
        }
    }

    async fn run(mut self) {
        info!(broker = %self.config.broker_url, "Session supervisor started");

        loop {
            match self.establish().await {
                Established::Connected => {}
                Established::Shutdown => break,
                Established::GaveUp(error) => return self.give_up(error).await,
            }

            match self.serve().await {
                Served::Shutdown => break,
                Served::Lost(reason) => {
                    self.online = false;
                    self.inner.metrics.connection_lost();
                    self.inner.tracker.lock().await.mark_unsent_all();

                    match self
                        .inner
                        .apply(ConnectionEvent::TransportLost(reason.clone()))
                        .await
                    {
                        Ok(transition) if transition.to == ConnectionState::Disconnected => {
                            return self
                                .give_up(TransportError::ConnectionLost(reason))
                                .await;
                        }
                        Ok(_) => {}
                        // Close won the race
                        Err(_) => break,
                    }
                }
            }
        }

        self.shutdown().await;
    }

    fn notify_ready(&mut self, result: Result<(), ConnectError>) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(result);
        }
    }

    fn shutdown_requested(&self) -> bool {
        let stop = *self.shutdown.borrow();
        stop
    }

    /// Connect, backing off between attempts while the machine says Reconnecting
    async fn establish(&mut self) -> Established {
        loop {
            match self.inner.state() {
                ConnectionState::Connecting => {}
                ConnectionState::Reconnecting(_) => {
                    let stop = self.shutdown_requested();
                    let decision = self
                        .inner
                        .machine
                        .lock()
                        .await
                        .should_attempt_reconnection(stop);
                    match decision {
                        ReconnectionDecision::Proceed { attempt, delay } => {
                            info!(
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                "Reconnecting after backoff"
                            );
                            if !self.backoff(delay).await {
                                return Established::Shutdown;
                            }
                        }
                        ReconnectionDecision::AbortShutdownRequested
                        | ReconnectionDecision::AbortNotReconnecting => {
                            return Established::Shutdown;
                        }
                    }
                }
                _ => return Established::Shutdown,
            }

            self.inner.metrics.connection_attempt();
            let result = self.attempt().await;
            let Some(result) = result else {
                return Established::Shutdown;
            };

            match result {
                Ok(()) => {
                    self.online = true;
                    if self
                        .inner
                        .apply(ConnectionEvent::ConnAckReceived)
                        .await
                        .is_err()
                    {
                        return Established::Shutdown;
                    }
                    self.inner
                        .metrics
                        .connection_established(self.connected_once);
                    self.connected_once = true;
                    return Established::Connected;
                }
                Err(error) => {
                    self.inner.metrics.connection_failed();
                    let event = ConnectionEvent::ConnectFailed {
                        reason: error.to_string(),
                        fatal: error.is_fatal(),
                    };
                    match self.inner.apply(event).await {
                        Ok(transition) => match transition.to {
                            ConnectionState::Reconnecting(_) => self.notify_ready(Ok(())),
                            _ => return Established::GaveUp(error),
                        },
                        Err(_) => return Established::Shutdown,
                    }
                }
            }
        }
    }

    /// One connect attempt; None when shutdown interrupted it
    async fn attempt(&mut self) -> Option<Result<(), TransportError>> {
        let timeout = self.config.connect_timeout();
        let Supervisor {
            transport,
            config,
            commands,
            shutdown,
            offline,
            ..
        } = &mut *self;

        let attempt = time::timeout(timeout, transport.connect(config));
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => {
                    return Some(result.unwrap_or(Err(TransportError::Timeout(timeout))));
                }
                _ = shutdown_signalled(shutdown) => return None,
                Some(command) = commands.recv() => offline.absorb(command),
            }
        }
    }

    /// Sleep for `delay` unless shutdown comes first
    async fn backoff(&mut self, delay: Duration) -> bool {
        let sleep = time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = shutdown_signalled(&mut self.shutdown) => return false,
                Some(command) = self.commands.recv() => self.offline.absorb(command),
            }
        }
    }

    /// The connected phase: commands, inbound events, retries and heartbeats
    async fn serve(&mut self) -> Served {
        if let Err(e) = self.on_connected().await {
            return Served::Lost(e.to_string());
        }
        self.notify_ready(Ok(()));

        let mut retry = periodic(self.config.tick_interval());
        let mut heartbeat = self
            .config
            .presence
            .as_ref()
            .map(|presence| periodic(presence.heartbeat_interval()));

        loop {
            let step = tokio::select! {
                _ = shutdown_signalled(&mut self.shutdown) => return Served::Shutdown,
                Some(command) = self.commands.recv() => self.handle_command(command).await,
                event = self.transport.next_event() => self.handle_event(event).await,
                _ = retry.tick() => self.retry_expired().await,
                _ = next_tick(&mut heartbeat) => self.send_heartbeat().await,
            };

            if let Err(e) = step {
                return Served::Lost(e.to_string());
            }
        }
    }

    /// Restore broker state after every entry to Connected
    async fn on_connected(&mut self) -> Result<(), TransportError> {
        for filter in std::mem::take(&mut self.offline.unsubscribes) {
            let still_used = self.inner.router.lock().await.has_filter(&filter);
            if !still_used {
                self.transport.unsubscribe(&filter).await?;
            }
        }

        let filters = self.inner.router.lock().await.broker_filters();
        for (filter, qos) in &filters {
            self.transport.subscribe(filter, *qos).await?;
        }

        let resend = self.inner.tracker.lock().await.take_for_resend(now());
        if !resend.is_empty() {
            info!(count = resend.len(), "Sending outstanding deliveries");
        }
        for publish in resend {
            self.send_tracked(publish).await?;
        }

        while let Some((message, completer)) = self.offline.messages.pop_front() {
            self.send_untracked(message, completer).await?;
        }

        self.announce_presence().await
    }

    async fn handle_command(&mut self, command: SessionCommand) -> Result<(), TransportError> {
        match command {
            SessionCommand::Publish { packet_id } => {
                let claimed = self
                    .inner
                    .tracker
                    .lock()
                    .await
                    .claim_for_send(packet_id, now());
                if let Some(publish) = claimed {
                    self.send_tracked(publish).await?;
                }
            }
            SessionCommand::PublishUntracked { message, completer } => {
                self.send_untracked(message, completer).await?;
            }
            SessionCommand::Subscribe { filter, qos } => {
                debug!(%filter, ?qos, "Subscribing");
                self.transport.subscribe(&filter, qos).await?;
            }
            SessionCommand::Unsubscribe { filter } => {
                let still_used = self.inner.router.lock().await.has_filter(&filter);
                if !still_used {
                    debug!(%filter, "Unsubscribing");
                    self.transport.unsubscribe(&filter).await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: TransportEvent) -> Result<(), TransportError> {
        match event {
            TransportEvent::Message {
                topic,
                payload,
                qos,
                retain,
            } => {
                self.inner
                    .dispatch_inbound(topic, payload, qos, retain)
                    .await;
            }
            TransportEvent::Acknowledged { packet_id } => {
                if self.inner.tracker.lock().await.acknowledge(packet_id) {
                    self.inner.metrics.delivery_acknowledged();
                }
            }
            TransportEvent::SubscribeRejected { reason } => {
                warn!(%reason, "Broker rejected subscription");
            }
            TransportEvent::ConnectionLost(reason) => {
                return Err(TransportError::ConnectionLost(reason));
            }
        }
        Ok(())
    }

    async fn retry_expired(&mut self) -> Result<(), TransportError> {
        let TickOutcome { resend, failed } = self.inner.tracker.lock().await.on_tick(now());
        for _ in &failed {
            self.inner.metrics.delivery_failed();
        }
        for publish in resend {
            self.send_tracked(publish).await?;
        }
        Ok(())
    }

    async fn send_tracked(&mut self, publish: OutboundPublish) -> Result<(), TransportError> {
        if publish.dup {
            self.inner.metrics.delivery_retried();
        } else {
            self.inner.metrics.message_published();
        }
        self.transport.publish(publish).await
    }

    /// Failed sends go back to the front of the offline queue
    async fn send_untracked(
        &mut self,
        message: Message,
        completer: DeliveryCompleter,
    ) -> Result<(), TransportError> {
        let publish = OutboundPublish {
            packet_id: None,
            message: message.clone(),
            dup: false,
        };
        match self.transport.publish(publish).await {
            Ok(()) => {
                self.inner.metrics.message_published();
                completer.complete(Ok(()));
                Ok(())
            }
            Err(e) => {
                self.offline.messages.push_front((message, completer));
                Err(e)
            }
        }
    }

    /// Track and send an internally generated QoS >= 1 message
    async fn send_internal(&mut self, message: Message) -> Result<(), TransportError> {
        let claimed = {
            let mut tracker = self.inner.tracker.lock().await;
            match tracker.track(message, now()) {
                Ok((packet_id, _handle)) => tracker.claim_for_send(packet_id, now()),
                Err(e) => {
                    warn!(error = %e, "Internal message not sent");
                    None
                }
            }
        };
        match claimed {
            Some(publish) => self.send_tracked(publish).await,
            None => Ok(()),
        }
    }

    async fn announce_presence(&mut self) -> Result<(), TransportError> {
        let Some(presence) = self.config.presence.clone() else {
            return Ok(());
        };

        let register = DevicePayload::Register {
            device_id: presence.device_id.clone(),
            name: presence.name().to_string(),
            capabilities: presence.capabilities.clone(),
        };
        self.send_internal(Message::new(
            TopicBuilder::register_topic(),
            codec::encode(&register),
            QoS::AtLeastOnce,
            false,
        ))
        .await?;

        let online = DevicePayload::Status {
            online: true,
            detail: None,
        };
        self.send_internal(Message::new(
            TopicBuilder::status_topic(&presence.device_id),
            codec::encode(&online),
            QoS::AtLeastOnce,
            true,
        ))
        .await?;

        info!(device_id = %presence.device_id, "Presence announced");
        Ok(())
    }

    async fn send_heartbeat(&mut self) -> Result<(), TransportError> {
        if self.config.presence.is_none() {
            return Ok(());
        }

        let heartbeat = DevicePayload::Heartbeat {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            uptime_secs: now().saturating_duration_since(self.started).as_secs(),
        };
        let publish = OutboundPublish {
            packet_id: None,
            message: Message::new(
                TopicBuilder::heartbeat_topic(),
                codec::encode(&heartbeat),
                QoS::AtMostOnce,
                false,
            ),
            dup: false,
        };
        self.transport.publish(publish).await?;
        debug!("Heartbeat sent");
        Ok(())
    }

    /// Wait for acknowledgments until the tracker drains or the close timeout passes
    async fn flush(&mut self) {
        let deadline = time::Instant::now() + self.config.close_timeout();

        let unsent: Vec<OutboundPublish> = {
            let mut tracker = self.inner.tracker.lock().await;
            let now = now();
            tracker
                .packet_ids()
                .into_iter()
                .filter_map(|packet_id| tracker.claim_for_send(packet_id, now))
                .collect()
        };
        for publish in unsent {
            if let Err(e) = self.send_tracked(publish).await {
                warn!(error = %e, "Connection lost while flushing");
                self.online = false;
                return;
            }
        }

        let mut retry = periodic(self.config.tick_interval());
        loop {
            let pending = self.inner.tracker.lock().await.len();
            if pending == 0 {
                debug!("All deliveries acknowledged");
                return;
            }

            let step = tokio::select! {
                _ = time::sleep_until(deadline) => {
                    warn!(pending, "Close timeout reached with deliveries outstanding");
                    return;
                }
                event = self.transport.next_event() => self.handle_event(event).await,
                _ = retry.tick() => self.retry_expired().await,
            };

            if let Err(e) = step {
                warn!(error = %e, "Connection lost while flushing");
                self.online = false;
                return;
            }
        }
    }

    /// Best-effort offline status before disconnecting
    async fn announce_offline(&mut self) {
        let Some(presence) = &self.config.presence else {
            return;
        };

        let status = DevicePayload::Status {
            online: false,
            detail: Some("closed".to_string()),
        };
        let publish = OutboundPublish {
            packet_id: None,
            message: Message::new(
                TopicBuilder::status_topic(&presence.device_id),
                codec::encode(&status),
                QoS::AtMostOnce,
                true,
            ),
            dup: false,
        };
        if let Err(e) = self.transport.publish(publish).await {
            debug!(error = %e, "Offline status not sent");
        }
    }

    /// Graceful close: flush, say goodbye, release everything
    async fn shutdown(mut self) {
        info!(online = self.online, "Session supervisor shutting down");
        self.notify_ready(Err(ConnectError::SessionClosed));

        while let Ok(command) = self.commands.try_recv() {
            if !self.online {
                self.offline.absorb(command);
            } else if let Err(e) = self.handle_command(command).await {
                warn!(error = %e, "Connection lost while draining commands");
                self.online = false;
            }
        }

        if self.online && self.config.flush_on_close {
            self.flush().await;
        }
        if self.online {
            self.announce_offline().await;
        }
        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %e, "Transport disconnect failed");
        }
        self.inner.metrics.connection_lost();

        let failed = self
            .inner
            .tracker
            .lock()
            .await
            .fail_all(PublishError::NotConnected);
        if failed > 0 {
            warn!(failed, "Unacknowledged deliveries failed at close");
        }
        self.offline.fail_all();
        self.inner.router.lock().await.clear();

        if let Err(e) = self.inner.apply(ConnectionEvent::Closed).await {
            warn!(error = %e, "Close transition rejected");
        }
        info!("Session supervisor stopped");
    }

    /// Connection failed for good: report, resolve everything, park the transport
    async fn give_up(mut self, error: TransportError) {
        error!(%error, "Giving up on broker connection");

        self.inner.emit(InboundEvent::ConnectionFailed {
            reason: error.to_string(),
        });
        self.notify_ready(Err(ConnectError::from(error)));

        let failed = self
            .inner
            .tracker
            .lock()
            .await
            .fail_all(PublishError::NotConnected);
        if failed > 0 {
            warn!(failed, "Pending deliveries failed");
        }
        while let Ok(command) = self.commands.try_recv() {
            self.offline.absorb(command);
        }
        self.offline.fail_all();

        if let Err(e) = self.transport.disconnect().await {
            debug!(error = %e, "Transport disconnect failed");
        }
        *self.inner.transport.lock().await = Some(self.transport);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBroker, MockTransport};

    fn config() -> SessionConfig {
        let mut config = SessionConfig::new("mqtt://localhost:1883", "core-test");
        config.initial_reconnect_backoff_ms = 10;
        config.max_reconnect_backoff_ms = 40;
        config.close_timeout_ms = 200;
        config.delivery.tick_interval_ms = 10;
        config
    }

    fn session() -> (Session, MockBroker) {
        let (transport, broker) = MockTransport::new();
        (Session::new(transport), broker)
    }

    #[tokio::test]
    async fn test_publish_before_connect_is_not_connected() {
        let (session, _broker) = session();
        for qos in [QoS::AtMostOnce, QoS::AtLeastOnce] {
            let err = session
                .publish("device/a/cmd", "x", qos, false)
                .await
                .unwrap_err();
            assert_eq!(err, PublishError::NotConnected);
        }
        assert_eq!(session.metrics().await.publish_failures, 2);
    }

    #[tokio::test]
    async fn test_publish_rejects_wildcard_topic() {
        let (session, _broker) = session();
        session.connect(config()).await.unwrap();
        let err = session
            .publish("device/+/cmd", "x", QoS::AtLeastOnce, false)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::InvalidTopic { .. }));
        session.close().await;
    }

    #[tokio::test]
    async fn test_connect_validates_config() {
        let (session, broker) = session();
        let err = session
            .connect(SessionConfig::new("", "core-test"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::InvalidConfig(_)));
        assert_eq!(broker.connect_attempts().await, 0);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_second_connect_is_rejected() {
        let (session, _broker) = session();
        session.connect(config()).await.unwrap();
        assert_eq!(session.state(), ConnectionState::Connected);

        let err = session.connect(config()).await.unwrap_err();
        assert_eq!(
            err,
            ConnectError::AlreadyConnected {
                state: ConnectionState::Connected
            }
        );
        session.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let (session, broker) = session();
        session.connect(config()).await.unwrap();

        session.close().await;
        session.close().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(broker.disconnects().await, 1);

        assert_eq!(
            session.connect(config()).await.unwrap_err(),
            ConnectError::SessionClosed
        );
        assert_eq!(
            session
                .publish("device/a/cmd", "x", QoS::AtMostOnce, false)
                .await
                .unwrap_err(),
            PublishError::NotConnected
        );
    }

    #[tokio::test]
    async fn test_close_without_connect() {
        let (session, _broker) = session();
        let mut events = session.events();
        session.close().await;

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(
            events.try_next(),
            Some(InboundEvent::StateChanged {
                from: ConnectionState::Disconnected,
                to: ConnectionState::Closing,
            })
        );
        assert_eq!(
            events.try_next(),
            Some(InboundEvent::StateChanged {
                from: ConnectionState::Closing,
                to: ConnectionState::Disconnected,
            })
        );
    }

    #[tokio::test]
    async fn test_send_command_targets_device_topic() {
        let (session, broker) = session();
        session.connect(config()).await.unwrap();

        let command = DevicePayload::invoke("reboot", Bytes::new());
        let correlation_id = command.correlation_id();
        let handle = session
            .send_command("frame-01", &command, QoS::AtLeastOnce)
            .await
            .unwrap();
        assert_eq!(handle.outcome().await, Ok(()));

        let sent = broker.published_to("device/frame-01/cmd").await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message.correlation_id, correlation_id);
        assert_eq!(codec::decode(&sent[0].message.payload).unwrap(), command);

        let err = session
            .send_command("a/b", &command, QoS::AtLeastOnce)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::InvalidTopic { .. }));
        session.close().await;
    }

    #[tokio::test]
    async fn test_presence_announced_on_connect() {
        let (session, broker) = session();
        let mut config = config();
        config.presence = Some(crate::config::PresenceSection::new("frame-01"));
        session.connect(config).await.unwrap();

        assert!(
            broker
                .wait_for(Duration::from_secs(1), |b| async move {
                    b.published_to("device/frame-01/status").await.len() == 1
                })
                .await
        );
        let register = broker.published_to("device/register").await;
        assert_eq!(register.len(), 1);
        assert!(matches!(
            codec::decode(&register[0].message.payload).unwrap(),
            DevicePayload::Register { .. }
        ));

        session.close().await;
        let status = broker.published_to("device/frame-01/status").await;
        assert_eq!(status.len(), 2, "online then offline");
        assert_eq!(
            codec::decode(&status[1].message.payload).unwrap(),
            DevicePayload::Status {
                online: false,
                detail: Some("closed".to_string()),
            }
        );
    }
}
