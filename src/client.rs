//! Connection lifecycle: login, keepalive, and reconnection

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::{
    action::{Action, AmiResponse, EventList},
    config::ConnectOptions,
    error::{AmiError, AmiResult},
    event::{AmiEventStream, EventDispatcher, EventPattern, SubscriptionId},
    frame::Frame,
    headers::Header,
    transport::{DisconnectReason, Transport, TransportStatus},
};

/// Session state.
///
/// `Disconnected -> Connecting -> Authenticating -> Ready`, then back to
/// `Disconnected` (closed, login rejected, retries exhausted) or through
/// `Reconnecting` after a drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    /// Waiting before reconnect attempt `attempt` (1-based).
    Reconnecting { attempt: u32 },
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Authenticating => write!(f, "authenticating"),
            ConnectionState::Ready => write!(f, "ready"),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {})", attempt),
        }
    }
}

struct ClientInner {
    options: ConnectOptions,
    dispatcher: Arc<EventDispatcher>,
    transport: parking_lot::RwLock<Option<Transport>>,
    state_tx: watch::Sender<ConnectionState>,
    last_reason: parking_lot::Mutex<Option<DisconnectReason>>,
    generation: AtomicU64,
    /// Stop signal of the current session; `start` installs a fresh one.
    shutdown_tx: parking_lot::Mutex<watch::Sender<bool>>,
}

impl ClientInner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self
            .state_tx
            .send_replace(state);
        if previous != state {
            debug!("[STATE] {} -> {}", previous, state);
        }
    }

    fn record_disconnect(&self, reason: DisconnectReason) {
        *self
            .last_reason
            .lock() = Some(reason);
        self.transport
            .write()
            .take();
    }

    /// Run `f` only while `session` is the live, unstopped session.
    ///
    /// Holds the stop-signal lock, so `close()` cannot interleave.
    fn with_session<R>(
        &self,
        session: &watch::Receiver<bool>,
        f: impl FnOnce() -> R,
    ) -> Option<R> {
        let _live = self
            .shutdown_tx
            .lock();
        if shutdown_requested(session) {
            return None;
        }
        Some(f())
    }

    /// Open a transport and log in. On success the transport is installed
    /// and the state is `Ready`, unless `session` was stopped meanwhile.
    async fn establish(&self, session: &watch::Receiver<bool>) -> AmiResult<Transport> {
        self.with_session(session, || self.set_state(ConnectionState::Connecting))
            .ok_or(AmiError::NotConnected)?;
        let generation = self
            .generation
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        let transport = Transport::open(
            &self.options.host,
            self.options.port,
            self.options.connect_timeout(),
            self.dispatcher.clone(),
            format!("{}-", generation),
        )
        .await?;

        if self
            .with_session(session, || self.set_state(ConnectionState::Authenticating))
            .is_none()
        {
            transport
                .close(DisconnectReason::ClientRequested)
                .await;
            return Err(AmiError::NotConnected);
        }
        debug!("[LOGIN] Logging in as {}", self.options.username);
        let login = Action::login(
            &self.options.username,
            &self.options.secret,
            self.options.events,
        );
        let rejection = match transport
            .send(&login, self.options.action_timeout())
            .await
        {
            Ok(response) if response.is_success() => None,
            Ok(response) => Some(
                response
                    .message()
                    .unwrap_or("login rejected")
                    .to_string(),
            ),
            Err(AmiError::Timeout { timeout_ms }) => {
                Some(format!("no login response within {}ms", timeout_ms))
            }
            Err(e) => {
                transport
                    .close(DisconnectReason::IoError(e.to_string()))
                    .await;
                return Err(e);
            }
        };

        if let Some(message) = rejection {
            warn!("[LOGIN] Authentication failed: {}", message);
            transport
                .close(DisconnectReason::AuthenticationFailed)
                .await;
            return Err(AmiError::auth_failed(message));
        }

        info!("[LOGIN] Authenticated as {}", self.options.username);
        let installed = self.with_session(session, || {
            *self
                .transport
                .write() = Some(transport.clone());
            self.set_state(ConnectionState::Ready);
        });
        if installed.is_none() {
            debug!("[LOGIN] Session stopped during login, discarding connection");
            transport
                .close(DisconnectReason::ClientRequested)
                .await;
            return Err(AmiError::NotConnected);
        }
        Ok(transport)
    }
}

/// Whether this session's stop signal fired or its sender was replaced.
fn shutdown_requested(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow() || rx.has_changed().is_err()
}

/// Resolve once `close()` has been requested, or the session was superseded.
async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    let _ = rx
        .wait_for(|stop| *stop)
        .await;
}

/// Watch one ready transport until it closes, pinging when idle.
async fn monitor(inner: &ClientInner, transport: &Transport) -> DisconnectReason {
    let mut status = transport.status_watch();
    let keepalive = inner
        .options
        .keepalive_interval();
    loop {
        if let TransportStatus::Closed(reason) = transport.status() {
            return reason;
        }
        let wait = keepalive
            .map(|interval| interval.saturating_sub(transport.idle_for()))
            .unwrap_or_default();

        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    return DisconnectReason::ConnectionClosed;
                }
            }
            _ = tokio::time::sleep(wait), if keepalive.is_some() => {
                let Some(interval) = keepalive else { continue };
                if transport.idle_for() < interval {
                    continue;
                }
                trace!("[KEEPALIVE] Idle for {:?}, sending Ping", transport.idle_for());
                match transport
                    .send(&Action::ping(), inner.options.keepalive_timeout())
                    .await
                {
                    Ok(_) => {}
                    Err(AmiError::Timeout { timeout_ms }) => {
                        warn!("[KEEPALIVE] No Ping response within {}ms", timeout_ms);
                        transport
                            .close(DisconnectReason::LivenessExpired)
                            .await;
                    }
                    Err(e) => debug!("[KEEPALIVE] Ping failed: {}", e),
                }
            }
        }
    }
}

/// Supervise the session: monitor, then reconnect with backoff after drops.
async fn supervise(
    inner: Arc<ClientInner>,
    mut transport: Transport,
    mut shutdown: watch::Receiver<bool>,
) {
    let policy = inner
        .options
        .reconnect
        .clone();

    loop {
        let reason = tokio::select! {
            reason = monitor(&inner, &transport) => reason,
            _ = shutdown_signal(&mut shutdown) => return,
        };
        if shutdown_requested(&shutdown) {
            return;
        }
        warn!("[RECONNECT] Session lost: {}", reason);
        let recorded = inner.with_session(&shutdown, || {
            inner.record_disconnect(reason);
            if !inner
                .options
                .auto_reconnect
            {
                inner.set_state(ConnectionState::Disconnected);
            }
        });
        if recorded.is_none()
            || !inner
                .options
                .auto_reconnect
        {
            return;
        }

        let mut attempt = 0u32;
        transport = loop {
            attempt += 1;
            if !policy.allows(attempt) {
                warn!("[RECONNECT] Giving up after {} attempt(s)", attempt - 1);
                inner.with_session(&shutdown, || inner.set_state(ConnectionState::Disconnected));
                return;
            }
            if inner
                .with_session(&shutdown, || {
                    inner.set_state(ConnectionState::Reconnecting { attempt })
                })
                .is_none()
            {
                return;
            }
            let delay = policy.delay_for_attempt(attempt);
            debug!("[RECONNECT] Attempt {} in {:?}", attempt, delay);

            let session = shutdown.clone();
            let outcome = tokio::select! {
                outcome = async {
                    tokio::time::sleep(delay).await;
                    inner.establish(&session).await
                } => outcome,
                _ = shutdown_signal(&mut shutdown) => return,
            };
            match outcome {
                Ok(transport) => {
                    info!("[RECONNECT] Session restored after {} attempt(s)", attempt);
                    break transport;
                }
                Err(AmiError::AuthenticationFailed { message }) => {
                    warn!("[RECONNECT] Login rejected, not retrying: {}", message);
                    inner.with_session(&shutdown, || {
                        inner.record_disconnect(DisconnectReason::AuthenticationFailed);
                        inner.set_state(ConnectionState::Disconnected);
                    });
                    return;
                }
                Err(_) if shutdown_requested(&shutdown) => return,
                Err(e) => warn!("[RECONNECT] Attempt {} failed: {}", attempt, e),
            }
        };
    }
}

/// Manager-protocol client handle (Clone + Send).
///
/// Owns one logical session to the exchange. The session is re-established
/// automatically after a drop; requests in flight at the moment of the drop
/// fail with [`AmiError::ConnectionLost`] rather than being replayed.
///
/// ```no_run
/// use asterisk_ami_tokio::{Action, AmiClient, ConnectOptions};
///
/// # async fn example() -> Result<(), asterisk_ami_tokio::AmiError> {
/// let client = AmiClient::connect(ConnectOptions::new("127.0.0.1", "admin", "secret")).await?;
/// let rtt = client.ping().await?;
/// println!("ping {:?}", rtt);
///
/// let reply = client
///     .send_action(Action::new("CoreSettings"))
///     .await?;
/// println!("version {:?}", reply.get("AsteriskVersion"));
/// client.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct AmiClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for AmiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmiClient")
            .field("host", &self.inner.options.host)
            .field("port", &self.inner.options.port)
            .field("state", &self.state())
            .finish()
    }
}

impl AmiClient {
    /// Create a client in the `Disconnected` state.
    ///
    /// Subscriptions made before [`start`](Self::start) see every event from
    /// the first session on.
    pub fn new(options: ConnectOptions) -> AmiResult<Self> {
        options.validate()?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(true);
        Ok(Self {
            inner: Arc::new(ClientInner {
                options,
                dispatcher: Arc::new(EventDispatcher::new()),
                transport: parking_lot::RwLock::new(None),
                state_tx,
                last_reason: parking_lot::Mutex::new(None),
                generation: AtomicU64::new(0),
                shutdown_tx: parking_lot::Mutex::new(shutdown_tx),
            }),
        })
    }

    /// Create a client and log in.
    pub async fn connect(options: ConnectOptions) -> AmiResult<Self> {
        let client = Self::new(options)?;
        client
            .start()
            .await?;
        Ok(client)
    }

    /// Log in and start supervising the session.
    ///
    /// A rejected login returns [`AmiError::AuthenticationFailed`] and is not
    /// retried. Any other failure of this first attempt is returned too;
    /// automatic reconnection only covers sessions that were once `Ready`.
    pub async fn start(&self) -> AmiResult<()> {
        let state = self.state();
        if state != ConnectionState::Disconnected {
            return Err(AmiError::InvalidConfig(format!(
                "client already started ({})",
                state
            )));
        }
        // A fresh signal per session; replacing the sender also stops any
        // supervisor left over from the previous one.
        let (shutdown_tx, session) = watch::channel(false);
        *self
            .inner
            .shutdown_tx
            .lock() = shutdown_tx;

        match self
            .inner
            .establish(&session)
            .await
        {
            Ok(transport) => {
                tokio::spawn(supervise(self.inner.clone(), transport, session));
                Ok(())
            }
            Err(e) => {
                let reason = match &e {
                    AmiError::AuthenticationFailed { .. } => DisconnectReason::AuthenticationFailed,
                    other => DisconnectReason::IoError(other.to_string()),
                };
                self.inner
                    .record_disconnect(reason);
                self.inner
                    .set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    fn transport(&self) -> AmiResult<Transport> {
        self.inner
            .transport
            .read()
            .clone()
            .filter(Transport::is_open)
            .ok_or(AmiError::NotConnected)
    }

    /// Send an action with the default timeout and return the raw response.
    ///
    /// `Response: Error` is returned as a response, not an error; use
    /// [`send_action_ok`](Self::send_action_ok) to reject it.
    pub async fn send_action(&self, action: Action) -> AmiResult<AmiResponse> {
        self.send_action_with_timeout(action, self.default_timeout())
            .await
    }

    pub async fn send_action_with_timeout(
        &self,
        action: Action,
        timeout: Duration,
    ) -> AmiResult<AmiResponse> {
        self.transport()?
            .send(&action, timeout)
            .await
    }

    /// Send an action and require `Response: Success`.
    pub async fn send_action_ok(&self, action: Action) -> AmiResult<AmiResponse> {
        self.send_action(action)
            .await?
            .into_result()
    }

    /// Send a list action completing with `<Action>Complete`.
    pub async fn send_list_action(&self, action: Action) -> AmiResult<EventList> {
        self.transport()?
            .send_list(&action, self.default_timeout())
            .await
    }

    /// Send a list action whose completion event does not follow the
    /// `<Action>Complete` convention.
    pub async fn send_list_action_until(
        &self,
        action: Action,
        complete_event: &str,
    ) -> AmiResult<EventList> {
        self.transport()?
            .send_list_until_event(&action, complete_event, self.default_timeout())
            .await
    }

    /// Round-trip a `Ping`.
    pub async fn ping(&self) -> AmiResult<Duration> {
        let started = Instant::now();
        self.send_action_ok(Action::ping())
            .await?;
        Ok(started.elapsed())
    }

    /// Run a CLI command and return its `Output` lines in order.
    pub async fn command(&self, cli: &str) -> AmiResult<Vec<String>> {
        let response = self
            .send_action_ok(Action::command(cli))
            .await?;
        Ok(response
            .frame()
            .get_all(Header::Output.as_str())
            .map(str::to_string)
            .collect())
    }

    /// Register an event handler. It runs on the read task and must not block.
    pub fn subscribe<F>(&self, pattern: impl Into<EventPattern>, handler: F) -> SubscriptionId
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        self.inner
            .dispatcher
            .subscribe(pattern, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner
            .dispatcher
            .unsubscribe(id)
    }

    /// Bounded event stream sized by `ConnectOptions::event_queue_size`.
    /// Subscriptions survive reconnects.
    pub fn events(&self, pattern: impl Into<EventPattern>) -> AmiEventStream {
        self.inner
            .dispatcher
            .stream(pattern, self.inner.options.event_queue_size)
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.inner.dispatcher
    }

    pub fn state(&self) -> ConnectionState {
        *self
            .inner
            .state_tx
            .borrow()
    }

    /// Watch state transitions.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner
            .state_tx
            .subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Why the most recent session ended, if one has.
    pub fn last_disconnect_reason(&self) -> Option<DisconnectReason> {
        self.inner
            .last_reason
            .lock()
            .clone()
    }

    /// Requests awaiting resolution on the current session.
    pub fn pending_requests(&self) -> usize {
        self.inner
            .transport
            .read()
            .as_ref()
            .map_or(0, Transport::pending_count)
    }

    /// Banner of the current session.
    pub fn server_banner(&self) -> Option<String> {
        self.inner
            .transport
            .read()
            .as_ref()
            .map(|t| t.banner().to_string())
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.inner.options
    }

    fn default_timeout(&self) -> Duration {
        self.inner
            .options
            .action_timeout()
    }

    /// Log off and stop. Pending requests fail with `ConnectionLost`; the
    /// client can be started again afterwards.
    pub async fn close(&self) {
        info!("[CLOSE] Client requested disconnect");
        self.inner
            .shutdown_tx
            .lock()
            .send_replace(true);

        let transport = self
            .inner
            .transport
            .read()
            .clone();
        if let Some(transport) = transport {
            if transport.is_open() {
                let logoff = transport
                    .send(&Action::logoff(), self.inner.options.keepalive_timeout())
                    .await;
                if let Err(e) = logoff {
                    debug!("[CLOSE] Logoff not acknowledged: {}", e);
                }
            }
            transport
                .close(DisconnectReason::ClientRequested)
                .await;
        }
        self.inner
            .record_disconnect(DisconnectReason::ClientRequested);
        self.inner
            .set_state(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_validates_options() {
        assert!(matches!(
            AmiClient::new(ConnectOptions::new("", "admin", "x")),
            Err(AmiError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_not_connected_before_start() {
        let client = AmiClient::new(ConnectOptions::new("127.0.0.1", "admin", "x")).unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_ready());
        assert!(client
            .last_disconnect_reason()
            .is_none());
        assert!(matches!(
            client
                .send_action(Action::ping())
                .await,
            Err(AmiError::NotConnected)
        ));
        assert_eq!(client.pending_requests(), 0);
        assert!(client
            .server_banner()
            .is_none());
    }

    #[tokio::test]
    async fn test_subscriptions_outlive_sessions() {
        let client = AmiClient::new(ConnectOptions::new("127.0.0.1", "admin", "x")).unwrap();
        let id = client.subscribe("FullyBooted", |_| {});
        let _stream = client.events("Confbridge*");
        assert_eq!(client.dispatcher().len(), 2);
        assert!(client.unsubscribe(id));
    }

    #[tokio::test]
    async fn test_connect_refused_leaves_disconnected() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener
            .local_addr()
            .unwrap()
            .port();
        drop(listener);

        let options = ConnectOptions::new("127.0.0.1", "admin", "x").with_port(port);
        let client = AmiClient::new(options).unwrap();
        assert!(client
            .start()
            .await
            .is_err());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(matches!(
            client.last_disconnect_reason(),
            Some(DisconnectReason::IoError(_))
        ));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Ready.to_string(), "ready");
        assert_eq!(
            ConnectionState::Reconnecting { attempt: 3 }.to_string(),
            "reconnecting (attempt 3)"
        );
    }
}
