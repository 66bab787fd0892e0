//! The subscription connection engine: registry, connect/retry lifecycle,
//! message pump, and reset/close orchestration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::{
    MessageKind, ProtocolMessage, Variables, build_init_msg, build_start_msg, build_stop_msg,
    build_terminate_msg,
};
use crate::transport::{
    BoxTransport, TransportConfig, TransportError, TransportFactory, default_transport_factory,
};
use crate::types::{
    BoxError, ConnectedCallback, DisconnectedCallback, Error, ErrorPolicy, HandlerFuture,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_RETRY_BUDGET: Duration = Duration::from_secs(60);
const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Registry entries
// ---------------------------------------------------------------------------

struct SubscriptionEntry {
    query: String,
    variables: Variables,
    /// Feeds the subscription's handler worker. Sends never block; events
    /// for one id are handled in arrival order.
    events: mpsc::UnboundedSender<ProtocolMessage>,
    /// A start frame has been sent on the current connection epoch.
    started: bool,
    /// Flagged for replay after a reset.
    restarting: bool,
}

// ---------------------------------------------------------------------------
// Loop outcomes
// ---------------------------------------------------------------------------

enum ConnectExit {
    Connected,
    /// The lifecycle context was cancelled while waiting to retry.
    Cancelled,
}

enum LoopExit {
    /// The run loop ended cleanly: cancellation, graceful closure, or close().
    Closed,
    /// The connection dropped; tear down and reconnect.
    Reconnect,
    /// The error policy returned a terminal outcome.
    Fatal(Error),
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Multiplexed subscription client over one persistent connection.
///
/// Register any number of long-lived operations with [`subscribe`], then
/// drive the engine with [`run`] — inline or as a spawned task. The engine
/// demultiplexes inbound frames to the registered handlers and transparently
/// replays every live subscription after a dropped connection.
///
/// Registration, cancellation, and [`close`] may be called concurrently with
/// a running loop from other tasks.
///
/// [`subscribe`]: SubscriptionClient::subscribe
/// [`run`]: SubscriptionClient::run
/// [`close`]: SubscriptionClient::close
pub struct SubscriptionClient {
    url: String,
    connection_params: Option<HashMap<String, serde_json::Value>>,
    read_timeout: Duration,
    write_timeout: Duration,
    retry_budget: Duration,
    max_message_size: usize,
    muted_log_kinds: Vec<MessageKind>,
    create_transport: TransportFactory,
    on_connected: Option<ConnectedCallback>,
    on_disconnected: Option<DisconnectedCallback>,
    on_error: Option<ErrorPolicy>,

    conn: Mutex<Option<BoxTransport>>,
    registry: Mutex<HashMap<String, SubscriptionEntry>>,
    running: AtomicBool,
    lifecycle: Mutex<CancellationToken>,
    error_tx: mpsc::UnboundedSender<BoxError>,
    error_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<BoxError>>,
}

impl SubscriptionClient {
    pub fn new(url: impl Into<String>) -> Self {
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        Self {
            url: url.into(),
            connection_params: None,
            read_timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
            retry_budget: DEFAULT_RETRY_BUDGET,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            muted_log_kinds: Vec::new(),
            create_transport: default_transport_factory(),
            on_connected: None,
            on_disconnected: None,
            on_error: None,
            conn: Mutex::new(None),
            registry: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            lifecycle: Mutex::new(CancellationToken::new()),
            error_tx,
            error_rx: tokio::sync::Mutex::new(error_rx),
        }
    }

    // -- configuration --

    /// Params sent with the `connection_init` frame, typically an auth
    /// handshake.
    pub fn with_connection_params(mut self, params: HashMap<String, serde_json::Value>) -> Self {
        self.connection_params = Some(params);
        self
    }

    /// Set both the read and write timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self.write_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// How long the lifecycle manager keeps retrying a failed connect, at
    /// one attempt per second, before giving up.
    pub fn with_retry_budget(mut self, budget: Duration) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Cap the size of inbound messages.
    pub fn with_max_message_size(mut self, limit: usize) -> Self {
        self.max_message_size = limit;
        self
    }

    /// Replace the connection factory. The default dials the endpoint with
    /// tokio-tungstenite; tests substitute in-memory fakes.
    pub fn with_transport(mut self, factory: TransportFactory) -> Self {
        self.create_transport = factory;
        self
    }

    /// Suppress frame logging for the given message kinds.
    pub fn without_log_kinds(mut self, kinds: impl IntoIterator<Item = MessageKind>) -> Self {
        self.muted_log_kinds.extend(kinds);
        self
    }

    /// Callback fired each time the server acknowledges the connection,
    /// including after a reconnect.
    pub fn on_connected(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Box::new(callback));
        self
    }

    /// Callback fired when the connect retry budget is exhausted.
    pub fn on_disconnected(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnected = Some(Box::new(callback));
        self
    }

    /// Install the bottom-level error policy. It receives handler-reported
    /// errors and unclassified read errors; returning `Some(error)`
    /// terminates [`run`](SubscriptionClient::run) with that error, `None`
    /// resumes the loop. Without a policy such errors are ignored.
    pub fn on_error(
        mut self,
        policy: impl Fn(Error) -> Option<Error> + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Box::new(policy));
        self
    }

    // -- accessors --

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Number of currently registered subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.registry.lock().len()
    }

    // -- registration --

    /// Register a streaming operation and return its id.
    ///
    /// `query` is the finalized operation text. The handler runs on its own
    /// task so a slow handler never stalls frame delivery; invocations for
    /// one id are serialized in arrival order, while handlers of distinct
    /// ids run concurrently.
    ///
    /// If the engine is connected and running, the start frame is sent
    /// immediately and a send failure is returned without registering
    /// anything. Otherwise the start frame is deferred until the run loop
    /// begins.
    pub async fn subscribe<F>(
        &self,
        query: impl Into<String>,
        variables: Variables,
        handler: F,
    ) -> Result<String, Error>
    where
        F: Fn(ProtocolMessage) -> HandlerFuture + Send + Sync + 'static,
    {
        let id = Uuid::new_v4().to_string();
        let events = self.spawn_handler_worker(handler);
        let mut entry = SubscriptionEntry {
            query: query.into(),
            variables,
            events,
            started: false,
            restarting: false,
        };

        if self.is_running()
            && let Some(conn) = self.current_conn()
        {
            let msg = build_start_msg(&id, &entry.query, &entry.variables)?;
            self.log_frame("send", &msg);
            conn.send(&msg).await?;
            entry.started = true;
        }

        self.registry.lock().insert(id.clone(), entry);
        Ok(id)
    }

    /// Cancel a subscription by the id returned from
    /// [`subscribe`](SubscriptionClient::subscribe).
    ///
    /// The stop frame is best-effort: the entry is removed even when the
    /// send fails, and the send error is still returned.
    pub async fn unsubscribe(&self, id: &str) -> Result<(), Error> {
        if !self.registry.lock().contains_key(id) {
            return Err(Error::SubscriptionNotFound(id.to_string()));
        }
        let sent = self.send_stop(id).await;
        self.registry.lock().remove(id);
        sent
    }

    fn spawn_handler_worker<F>(&self, handler: F) -> mpsc::UnboundedSender<ProtocolMessage>
    where
        F: Fn(ProtocolMessage) -> HandlerFuture + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<ProtocolMessage>();
        let error_tx = self.error_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(err) = handler(msg).await {
                    let _ = error_tx.send(err);
                }
            }
        });
        tx
    }

    // -- lifecycle --

    /// Drive the engine: connect (with bounded retry), send start frames for
    /// every registered subscription, then pump inbound frames until the
    /// connection ends.
    ///
    /// Dropped connections are recovered internally: live subscriptions are
    /// flagged for replay and the connect cycle re-enters. Only two paths
    /// return an error — the retry budget running out, and the error policy
    /// returning a terminal outcome. Run inline or spawn it; it returns
    /// `Ok(())` after [`close`](SubscriptionClient::close), on graceful
    /// closure, and on cancellation.
    pub async fn run(&self) -> Result<(), Error> {
        loop {
            match self.connect().await? {
                ConnectExit::Cancelled => return Ok(()),
                ConnectExit::Connected => {}
            }
            let Some(conn) = self.current_conn() else {
                // A concurrent close() already took the transport back out.
                return Ok(());
            };
            self.start_all(&conn).await?;
            self.running.store(true, Ordering::SeqCst);

            match self.pump(&conn).await {
                LoopExit::Closed => return Ok(()),
                LoopExit::Fatal(err) => return Err(err),
                LoopExit::Reconnect => {
                    if !self.is_running() {
                        return Ok(());
                    }
                    self.suspend().await;
                }
            }
        }
    }

    /// Tear the connection down, flag every subscription for replay, and
    /// re-enter the connect/run cycle.
    pub async fn reset(&self) -> Result<(), Error> {
        if !self.is_running() {
            return Ok(());
        }
        self.suspend().await;
        self.run().await
    }

    /// Stop the engine: cancel every subscription, terminate and close the
    /// connection, and cancel the lifecycle context. Unlike
    /// [`reset`](SubscriptionClient::reset), this never reconnects.
    pub async fn close(&self) -> Result<(), Error> {
        self.running.store(false, Ordering::SeqCst);

        let ids: Vec<String> = self.registry.lock().keys().cloned().collect();
        let mut result = Ok(());
        for id in ids {
            if let Err(err) = self.unsubscribe(&id).await {
                result = Err(err);
                break;
            }
        }

        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            let terminate = build_terminate_msg();
            self.log_frame("send", &terminate);
            let _ = conn.send(&terminate).await;
            let closed = conn.close().await;
            if result.is_ok() {
                result = closed.map_err(Error::from);
            }
        }

        self.lifecycle.lock().cancel();
        result
    }

    /// Acquire a transport and perform the handshake, retrying once per
    /// second until the retry budget runs out.
    async fn connect(&self) -> Result<ConnectExit, Error> {
        let started = Instant::now();
        let token = CancellationToken::new();
        *self.lifecycle.lock() = token.clone();

        loop {
            match self.try_connect().await {
                Ok(()) => return Ok(ConnectExit::Connected),
                Err(err) => {
                    if started.elapsed() >= self.retry_budget {
                        tracing::error!(error = %err, "connect retry budget exhausted");
                        if let Some(callback) = &self.on_disconnected {
                            callback();
                        }
                        return Err(Error::RetryExhausted(Box::new(err)));
                    }
                    tracing::warn!(error = %err, "connect failed, retrying in 1s");
                    tokio::select! {
                        _ = tokio::time::sleep(CONNECT_RETRY_INTERVAL) => {}
                        _ = token.cancelled() => return Ok(ConnectExit::Cancelled),
                    }
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<(), Error> {
        let config = TransportConfig {
            url: self.url.clone(),
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            max_message_size: self.max_message_size,
        };
        let conn = (self.create_transport)(config).await?;
        conn.set_read_limit(self.max_message_size);

        let init = build_init_msg(self.connection_params.as_ref())?;
        self.log_frame("send", &init);
        conn.send(&init).await?;

        *self.conn.lock() = Some(conn);
        Ok(())
    }

    /// Send start frames for every registry entry not yet started on this
    /// connection epoch: freshly registered entries and post-reset replays.
    async fn start_all(&self, conn: &BoxTransport) -> Result<(), Error> {
        let pending: Vec<(String, String, Variables, bool)> = {
            let registry = self.registry.lock();
            registry
                .iter()
                .filter(|(_, entry)| !entry.started)
                .map(|(id, entry)| {
                    (
                        id.clone(),
                        entry.query.clone(),
                        entry.variables.clone(),
                        entry.restarting,
                    )
                })
                .collect()
        };

        for (id, query, variables, restarting) in pending {
            if restarting {
                tracing::info!(%id, "replaying subscription");
            }
            let msg = build_start_msg(&id, &query, &variables)?;
            self.log_frame("send", &msg);
            if let Err(err) = conn.send(&msg).await {
                let _ = self.unsubscribe(&id).await;
                return Err(err.into());
            }
            let mut registry = self.registry.lock();
            if let Some(entry) = registry.get_mut(&id) {
                entry.restarting = false;
                entry.started = true;
            }
        }
        Ok(())
    }

    /// Stop every subscription on the wire (best effort), flag it for
    /// replay, then terminate and drop the transport and cancel the epoch.
    async fn suspend(&self) {
        let ids: Vec<String> = self.registry.lock().keys().cloned().collect();
        for id in ids {
            let _ = self.send_stop(&id).await;
            let mut registry = self.registry.lock();
            if let Some(entry) = registry.get_mut(&id) {
                entry.started = false;
                entry.restarting = true;
            }
        }

        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            let terminate = build_terminate_msg();
            self.log_frame("send", &terminate);
            let _ = conn.send(&terminate).await;
            let _ = conn.close().await;
        }

        self.lifecycle.lock().cancel();
    }

    // -- pump --

    /// One iteration: cancellation first, then one queued handler error,
    /// then block on the next inbound frame.
    async fn pump(&self, conn: &BoxTransport) -> LoopExit {
        let token = self.lifecycle.lock().clone();
        let mut error_rx = self.error_rx.lock().await;

        while self.is_running() {
            if token.is_cancelled() {
                return LoopExit::Closed;
            }

            if let Ok(err) = error_rx.try_recv() {
                if let Some(fatal) = self.apply_error_policy(Error::Handler(err)) {
                    return LoopExit::Fatal(fatal);
                }
                continue;
            }

            let received = tokio::select! {
                biased;
                _ = token.cancelled() => return LoopExit::Closed,
                received = conn.receive() => received,
            };

            match received {
                Ok(msg) => self.dispatch(msg).await,
                Err(TransportError::StreamEnd) => return LoopExit::Reconnect,
                Err(TransportError::NormalClosure) => return LoopExit::Closed,
                Err(TransportError::AbnormalClosure(reason)) => {
                    tracing::warn!(%reason, "connection closed abnormally, reconnecting");
                    return LoopExit::Reconnect;
                }
                Err(err) => {
                    if let Some(fatal) = self.apply_error_policy(err.into()) {
                        return LoopExit::Fatal(fatal);
                    }
                }
            }
        }
        LoopExit::Closed
    }

    async fn dispatch(&self, msg: ProtocolMessage) {
        self.log_frame("recv", &msg);
        match msg.kind {
            MessageKind::Data | MessageKind::Error => self.route_to_handler(msg),
            MessageKind::Complete => {
                if let Some(id) = msg.id.as_deref() {
                    // Implicit cancellation; a repeated complete for the
                    // same id is a no-op rather than an error.
                    let _ = self.unsubscribe(id).await;
                }
            }
            MessageKind::ConnectionAck => {
                if let Some(callback) = &self.on_connected {
                    callback();
                }
            }
            MessageKind::ConnectionError => {
                tracing::warn!(frame = %msg, "server rejected the connection");
            }
            MessageKind::KeepAlive => {}
            other => {
                tracing::debug!(kind = ?other, "ignoring inbound frame");
            }
        }
    }

    fn route_to_handler(&self, msg: ProtocolMessage) {
        let Some(id) = msg.id.clone() else {
            tracing::debug!("dropping result frame without an operation id");
            return;
        };
        let registry = self.registry.lock();
        match registry.get(&id) {
            Some(entry) => {
                let _ = entry.events.send(msg);
            }
            // Expected after a cancellation race or across a reset epoch.
            None => tracing::trace!(%id, "dropping frame for unknown subscription"),
        }
    }

    // -- helpers --

    async fn send_stop(&self, id: &str) -> Result<(), Error> {
        let Some(conn) = self.current_conn() else {
            return Ok(());
        };
        let msg = build_stop_msg(id);
        self.log_frame("send", &msg);
        conn.send(&msg).await.map_err(Error::from)
    }

    fn apply_error_policy(&self, err: Error) -> Option<Error> {
        match &self.on_error {
            Some(policy) => policy(err),
            None => {
                tracing::debug!(error = %err, "no error policy installed, continuing");
                None
            }
        }
    }

    fn current_conn(&self) -> Option<BoxTransport> {
        self.conn.lock().clone()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn log_frame(&self, direction: &'static str, msg: &ProtocolMessage) {
        if self.muted_log_kinds.contains(&msg.kind) {
            return;
        }
        tracing::debug!(direction, frame = %msg, "frame");
    }
}
