#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use backoff::backoff::Backoff as _;
use chrono::{DateTime, Utc};
use futures::{SinkExt as _, StreamExt as _};
use secrecy::{ExposeSecret as _, SecretString};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{
    ACCEPT_LANGUAGE, AUTHORIZATION, HeaderName, HeaderValue, USER_AGENT,
};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use super::backoff::ReconnectPolicy;
use super::config::Config;
use super::error::WsError;
use super::traits::{DiscardTelemetry, FrameCodec, TelemetrySink};
use super::watchdog::Watchdog;
use crate::auth::TokenProvider;
use crate::command::{CommandError, CommandTracker};
use crate::dispatch::Dispatcher;
use crate::proto::ProtoCodec;
use crate::{Result, error::Error};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SESSION_ID_HEADER: &str = "x-sessionid";
const TRACKING_ID_HEADER: &str = "x-trackingid";
const LOCALE_HEADER: &str = "x-locale";
const APPLICATION_NAME_HEADER: &str = "x-applicationname";
const APPLICATION_VERSION_HEADER: &str = "ris-application-version";
const OS_NAME_HEADER: &str = "ris-os-name";
const OS_VERSION_HEADER: &str = "ris-os-version";
const SDK_VERSION_HEADER: &str = "ris-sdk-version";
const OUTPUT_FORMAT_HEADER: &str = "output-format";
const SUBSCRIPTION_KEY_HEADER: &str = "ocp-apim-subscription-key";

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Successfully connected
    Connected {
        /// When the connection was established
        since: Instant,
    },
    /// Waiting to reconnect after failure
    Reconnecting {
        /// Consecutive failed or lost connections so far
        attempt: u32,
    },
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// How a single socket session ended.
enum SessionEnd {
    /// [`ConnectionManager::disconnect`] was called
    Shutdown,
    /// The connection failed or went silent and should be re-established
    Lost(Error),
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the push channel for one vehicle account.
///
/// The connection manager handles all socket concerns:
/// - Opening the socket with fresh credentials and a stable session identifier
/// - Automatic reconnection with quadratic backoff and a rate-limit floor
/// - Liveness watchdogs and keepalive pings
/// - Dispatching push frames and sending the acknowledgments the service expects
/// - Correlating submitted commands with their status updates
///
/// All socket I/O happens on a single background task started by [`ConnectionManager::connect`].
/// Cloning the manager yields another handle to the same connection.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use tokio::sync::mpsc;
/// use vehicle_cloud_link::auth::StaticToken;
/// use vehicle_cloud_link::frame::TelemetryUpdate;
/// use vehicle_cloud_link::proto::ProtoCodec;
/// use vehicle_cloud_link::ws::ConnectionManager;
/// use vehicle_cloud_link::ws::config::Config;
///
/// # async fn example() -> vehicle_cloud_link::Result<()> {
/// let manager = ConnectionManager::new(
///     "wss://websocket.example.com/ws",
///     Config::default(),
///     Arc::new(StaticToken::new("token")),
///     ProtoCodec::default(),
/// )?;
///
/// let (telemetry_tx, mut telemetry_rx) = mpsc::unbounded_channel::<TelemetryUpdate>();
/// manager.connect(Arc::new(telemetry_tx));
///
/// let frame = ProtoCodec::default().encode_command("WDD0001", "req-1", 1, Vec::new());
/// manager
///     .send_command(frame, "req-1", Duration::from_secs(60))
///     .await?;
///
/// while let Some(update) = telemetry_rx.recv().await {
///     println!("{}: {} attributes", update.vin, update.attributes.len());
/// }
/// # Ok(())
/// # }
/// ```
pub struct ConnectionManager<C: FrameCodec = ProtoCodec> {
    inner: Arc<Inner<C>>,
}

impl<C: FrameCodec> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: FrameCodec> fmt::Debug for ConnectionManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.inner.endpoint)
            .field("session_id", &self.inner.session_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct Inner<C> {
    endpoint: String,
    config: Config,
    codec: C,
    tokens: Arc<dyn TokenProvider>,
    /// Generated once, sent on every handshake
    session_id: Uuid,
    tracker: CommandTracker,
    state_tx: watch::Sender<ConnectionState>,
    /// Sender channel for outgoing command frames
    outbound_tx: mpsc::UnboundedSender<Message>,
    /// Held by the running worker for its whole lifetime
    outbound_rx: AsyncMutex<mpsc::UnboundedReceiver<Message>>,
    sink: RwLock<Arc<dyn TelemetrySink>>,
    worker: Mutex<Option<Worker>>,
    /// Set while [`ConnectionManager::disconnect`] is tearing the worker down
    stopping: AtomicBool,
    /// Serializes teardowns so concurrent disconnects all wait for the first one
    teardown: AsyncMutex<()>,
    rate_limited_since: Mutex<Option<DateTime<Utc>>>,
}

impl<C: FrameCodec> ConnectionManager<C> {
    /// Create a connection manager for `endpoint`. No I/O happens until
    /// [`ConnectionManager::connect`] or [`ConnectionManager::send_command`] is called.
    pub fn new(
        endpoint: &str,
        config: Config,
        tokens: Arc<dyn TokenProvider>,
        codec: C,
    ) -> Result<Self> {
        let url = Url::parse(endpoint)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "endpoint {endpoint} must use the ws or wss scheme"
            )));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            inner: Arc::new(Inner {
                endpoint: endpoint.to_owned(),
                config,
                codec,
                tokens,
                session_id: Uuid::new_v4(),
                tracker: CommandTracker::new(),
                state_tx,
                outbound_tx,
                outbound_rx: AsyncMutex::new(outbound_rx),
                sink: RwLock::new(Arc::new(DiscardTelemetry)),
                worker: Mutex::new(None),
                stopping: AtomicBool::new(false),
                teardown: AsyncMutex::new(()),
                rate_limited_since: Mutex::new(None),
            }),
        })
    }

    /// Start the connection loop, delivering telemetry to `sink`.
    ///
    /// Does nothing while a connection loop is already running or a
    /// [`ConnectionManager::disconnect`] is in progress; `sink` is then dropped and the running
    /// loop keeps its current sink. Must be called from within a tokio runtime.
    pub fn connect(&self, sink: Arc<dyn TelemetrySink>) {
        self.start(Some(sink));
    }

    /// Spawn the worker unless one is running. `sink` replaces the stored sink only when a
    /// worker is actually spawned; `None` reuses the last one.
    fn start(&self, sink: Option<Arc<dyn TelemetrySink>>) {
        if self.inner.stopping.load(Ordering::Acquire) {
            #[cfg(feature = "tracing")]
            tracing::debug!("Shutdown in progress, not connecting");
            return;
        }

        let mut worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if self.inner.stopping.load(Ordering::Acquire)
            || worker.as_ref().is_some_and(|w| !w.handle.is_finished())
        {
            #[cfg(feature = "tracing")]
            if sink.is_some() {
                tracing::debug!("Connection loop already running, keeping its telemetry sink");
            }
            return;
        }

        let mut stored = self
            .inner
            .sink
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(sink) = sink {
            *stored = sink;
        }
        let sink = Arc::clone(&*stored);
        drop(stored);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&self.inner).run(sink, cancel.clone()));

        *worker = Some(Worker { cancel, handle });
    }

    /// Send an already serialized command frame and wait for its outcome.
    ///
    /// When no connection is open, one is started and awaited for up to
    /// [`Config::connect_wait`]. The command then resolves when the service reports it
    /// finished, fails when the service reports it failed, and fails with
    /// [`CommandError::TimedOut`] if neither happens within `timeout_after`.
    pub async fn send_command(
        &self,
        payload: Vec<u8>,
        request_id: &str,
        timeout_after: Duration,
    ) -> Result<()> {
        if !self.state().is_connected() {
            self.start(None);

            let mut state_rx = self.inner.state_tx.subscribe();
            let ready = {
                let waited = timeout(
                    self.inner.config.connect_wait,
                    state_rx.wait_for(|state| state.is_connected()),
                )
                .await;
                matches!(waited, Ok(Ok(_)))
            };

            if !ready {
                #[cfg(feature = "tracing")]
                tracing::warn!(request_id, "No connection available for command");
                return Err(CommandError::NotConnected.into());
            }
        }

        let completion = self.inner.tracker.register(request_id, timeout_after)?;

        if self
            .inner
            .outbound_tx
            .send(Message::Binary(payload.into()))
            .is_err()
        {
            self.inner.tracker.cancel(request_id);
            return Err(CommandError::NotConnected.into());
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(request_id, "Command queued");

        match completion.await {
            Ok(outcome) => outcome.map_err(Error::from),
            Err(_) => Err(CommandError::Disconnected {
                request_id: request_id.to_owned(),
            }
            .into()),
        }
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Cancels any scheduled reconnect and both watchdogs, sends a normal close frame when
    /// connected, and fails commands that are still in flight. Idempotent; concurrent calls
    /// all return once the teardown has finished.
    pub async fn disconnect(&self) {
        let _teardown = self.inner.teardown.lock().await;
        self.inner.stopping.store(true, Ordering::Release);

        let worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(worker) = worker {
            worker.cancel.cancel();
            if let Err(e) = worker.handle.await {
                #[cfg(feature = "tracing")]
                tracing::error!("Connection task ended abnormally: {e:?}");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }

        let failed = self
            .inner
            .tracker
            .fail_all(|request_id| CommandError::Disconnected {
                request_id: request_id.to_owned(),
            });

        #[cfg(feature = "tracing")]
        tracing::debug!(failed_commands = failed, "Disconnected");
        #[cfg(not(feature = "tracing"))]
        let _ = failed;

        self.inner.set_state(ConnectionState::Disconnected);
        self.inner.stopping.store(false, Ordering::Release);
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Session identifier sent on every handshake, stable across reconnects.
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    /// When the service last rejected a handshake as rate limited, cleared on the next
    /// successful connection.
    #[must_use]
    pub fn rate_limited_since(&self) -> Option<DateTime<Utc>> {
        *self
            .inner
            .rate_limited_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of commands waiting for a terminal status.
    #[must_use]
    pub fn pending_commands(&self) -> usize {
        self.inner.tracker.len()
    }
}

impl<C: FrameCodec> Inner<C> {
    fn set_state(&self, state: ConnectionState) {
        _ = self.state_tx.send_replace(state);
    }

    fn set_rate_limited(&self, since: Option<DateTime<Utc>>) {
        *self
            .rate_limited_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = since;
    }

    /// Main connection loop with automatic reconnection.
    async fn run(self: Arc<Self>, sink: Arc<dyn TelemetrySink>, cancel: CancellationToken) {
        let mut outbound = self.outbound_rx.lock().await;
        // Anything still queued belongs to a connection that no longer exists.
        while outbound.try_recv().is_ok() {}

        let dispatcher = Dispatcher::new(self.tracker.clone(), sink);
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            self.set_state(ConnectionState::Connecting);

            let opened = tokio::select! {
                () = cancel.cancelled() => break,
                opened = self.open() => opened,
            };

            match opened {
                Ok(stream) => {
                    policy.reset();
                    self.set_rate_limited(None);
                    self.set_state(ConnectionState::Connected {
                        since: Instant::now(),
                    });

                    #[cfg(feature = "tracing")]
                    tracing::debug!(session_id = %self.session_id, "Connected to push channel");

                    match self
                        .handle_connection(stream, &mut outbound, &dispatcher, &cancel)
                        .await
                    {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(error) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!("Connection lost: {error}");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &error;
                        }
                    }
                }
                Err(error) => {
                    if self.is_rate_limit(&error) {
                        policy.set_rate_limited();
                        self.set_rate_limited(Some(Utc::now()));

                        #[cfg(feature = "tracing")]
                        tracing::warn!("Push channel is rate limiting this account: {error}");
                    } else {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("Unable to connect: {error:?}");
                    }
                    #[cfg(not(feature = "tracing"))]
                    let _ = &error;
                }
            }

            let delay = policy
                .next_backoff()
                .unwrap_or(self.config.reconnect.max_delay);

            // Check if we should stop reconnecting
            if policy.exhausted() {
                #[cfg(feature = "tracing")]
                tracing::warn!(attempts = policy.attempt(), "Giving up reconnecting");
                break;
            }

            self.set_state(ConnectionState::Reconnecting {
                attempt: policy.attempt(),
            });

            #[cfg(feature = "tracing")]
            tracing::debug!(attempt = policy.attempt(), ?delay, "Scheduling reconnect");

            tokio::select! {
                () = cancel.cancelled() => break,
                () = sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Disconnected);
    }

    fn is_rate_limit(&self, error: &Error) -> bool {
        error
            .downcast_ref::<WsError>()
            .and_then(WsError::http_status)
            .is_some_and(|status| self.config.reconnect.is_rate_limit_status(status))
    }

    async fn open(&self) -> Result<WsStream> {
        let token = self.tokens.access_token().await?;
        let request = self.handshake_request(&token)?;
        let (stream, _) = connect_async(request).await?;
        Ok(stream)
    }

    fn handshake_request(&self, token: &SecretString) -> Result<Request> {
        let headers = &self.config.headers;
        let mut request = self.endpoint.as_str().into_client_request()?;
        let map = request.headers_mut();

        let mut authorization = HeaderValue::from_str(token.expose_secret())?;
        authorization.set_sensitive(true);
        map.insert(AUTHORIZATION, authorization);

        let mut insert = |name: &'static str, value: &str| -> Result<()> {
            map.insert(HeaderName::from_static(name), HeaderValue::from_str(value)?);
            Ok(())
        };
        insert(SESSION_ID_HEADER, &self.session_id.to_string())?;
        insert(TRACKING_ID_HEADER, &Uuid::new_v4().to_string())?;
        insert(LOCALE_HEADER, &headers.locale)?;
        insert(APPLICATION_NAME_HEADER, &headers.application_name)?;
        insert(APPLICATION_VERSION_HEADER, &headers.application_version)?;
        insert(OS_NAME_HEADER, &headers.os_name)?;
        insert(OS_VERSION_HEADER, &headers.os_version)?;
        insert(SDK_VERSION_HEADER, &headers.sdk_version)?;
        insert(OUTPUT_FORMAT_HEADER, "PROTO")?;

        map.insert(ACCEPT_LANGUAGE, HeaderValue::from_str(&headers.locale)?);
        map.insert(USER_AGENT, HeaderValue::from_str(&headers.user_agent)?);

        if let Some(key) = &headers.subscription_key {
            let mut value = HeaderValue::from_str(key.expose_secret())?;
            value.set_sensitive(true);
            map.insert(HeaderName::from_static(SUBSCRIPTION_KEY_HEADER), value);
        }

        for (name, value) in &headers.extra {
            map.append(
                HeaderName::from_bytes(name.as_bytes())?,
                HeaderValue::from_str(value)?,
            );
        }

        Ok(request)
    }

    /// Handle an active WebSocket connection until it ends.
    async fn handle_connection(
        &self,
        stream: WsStream,
        outbound: &mut mpsc::UnboundedReceiver<Message>,
        dispatcher: &Dispatcher,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let (mut write, mut read) = stream.split();

        let mut connection_watchdog = Watchdog::new(self.config.connection_watchdog);
        let mut ping_watchdog = Watchdog::new(self.config.ping_watchdog);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client disconnect".into(),
                    };
                    if let Err(e) = write.send(Message::Close(Some(frame))).await {
                        #[cfg(feature = "tracing")]
                        tracing::debug!("Unable to send close frame: {e}");
                        #[cfg(not(feature = "tracing"))]
                        let _ = &e;
                    }
                    return SessionEnd::Shutdown;
                }

                // Handle incoming frames
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Binary(bytes))) => {
                            connection_watchdog.reset();
                            ping_watchdog.reset();

                            if let Some(ack) = self.process(&bytes, dispatcher)
                                && let Err(e) = write.send(Message::Binary(ack.into())).await
                            {
                                return SessionEnd::Lost(e.into());
                            }
                        }
                        Some(Ok(Message::Pong(_))) => ping_watchdog.reset(),
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame.map_or((None, String::new()), |frame| {
                                (Some(u16::from(frame.code)), frame.reason.to_string())
                            });
                            return SessionEnd::Lost(WsError::ConnectionClosed { code, reason }.into());
                        }
                        Some(Ok(Message::Text(text))) => {
                            #[cfg(feature = "tracing")]
                            tracing::debug!(%text, "Ignoring unexpected text frame");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &text;
                        }
                        Some(Ok(_)) => {
                            // Server PINGs are answered by tungstenite itself.
                        }
                        Some(Err(e)) => return SessionEnd::Lost(e.into()),
                        None => {
                            return SessionEnd::Lost(
                                WsError::ConnectionClosed { code: None, reason: String::new() }.into(),
                            );
                        }
                    }
                }

                // Handle outgoing command frames
                Some(message) = outbound.recv() => {
                    if let Err(e) = write.send(message).await {
                        #[cfg(feature = "tracing")]
                        tracing::error!("Unable to send command frame: {e}");
                        return SessionEnd::Lost(e.into());
                    }
                }

                () = connection_watchdog.expired() => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        window = ?connection_watchdog.period(),
                        "No frames received, forcing reconnect"
                    );
                    _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Lost(
                        WsError::WatchdogExpired(connection_watchdog.period()).into(),
                    );
                }

                () = ping_watchdog.expired() => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!("Sending keepalive PING");
                    if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                        return SessionEnd::Lost(e.into());
                    }
                    ping_watchdog.reset();
                }
            }
        }
    }

    /// Decode and dispatch one binary frame, returning the encoded acknowledgment if any.
    fn process(&self, bytes: &[u8], dispatcher: &Dispatcher) -> Option<Vec<u8>> {
        let frame = match self.codec.decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(len = bytes.len(), error = %e, "Failed to decode push frame");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return None;
            }
        };

        let ack = dispatcher.dispatch(frame)?;

        match self.codec.encode_ack(&ack) {
            Ok(encoded) => Some(encoded),
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(?ack, error = %e, "Failed to encode acknowledgment");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                None
            }
        }
    }
}
