//! Socket ownership: the read loop, the serialized write path, and the
//! correlator they share

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::{timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::{
    action::{Action, AmiResponse, EventList},
    constants::{SOCKET_BUF_SIZE, SWEEP_INTERVAL_MS, WRITER_RELEASE_TIMEOUT_MS},
    correlator::{deadline_after, Completion, Correlator, Resolution},
    error::{AmiError, AmiResult},
    event::EventDispatcher,
    frame::{Frame, FrameKind},
    protocol::{encode, FrameParser},
};

/// Why a transport stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Peer closed the socket (EOF).
    ConnectionClosed,
    /// Socket read or write failed.
    IoError(String),
    /// Keepalive `Ping` went unanswered.
    LivenessExpired,
    /// Login was rejected; the session is not retried.
    AuthenticationFailed,
    /// `close()` was called.
    ClientRequested,
    /// The inbound stream could not be framed any more.
    ProtocolDesync(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::IoError(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::LivenessExpired => write!(f, "liveness timeout expired"),
            DisconnectReason::AuthenticationFailed => write!(f, "authentication failed"),
            DisconnectReason::ClientRequested => write!(f, "client requested disconnect"),
            DisconnectReason::ProtocolDesync(msg) => write!(f, "protocol desync: {}", msg),
        }
    }
}

/// Transport status as seen through [`Transport::status_watch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    Open,
    Closed(DisconnectReason),
}

/// Establish a TCP connection with a timeout.
async fn tcp_connect_with_timeout(host: &str, port: u16, limit: Duration) -> AmiResult<TcpStream> {
    match timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            debug!("[CONNECT] TCP connection established to {}:{}", host, port);
            Ok(stream)
        }
        Ok(Err(e)) => {
            warn!("[CONNECT] TCP connect to {}:{} failed: {}", host, port, e);
            Err(AmiError::Io(e))
        }
        Err(_) => {
            let timeout_ms = limit.as_millis() as u64;
            warn!("[CONNECT] TCP connect timed out after {}ms", timeout_ms);
            Err(AmiError::Timeout { timeout_ms })
        }
    }
}

/// Read until the one-line banner is available.
async fn read_greeting(
    stream: &mut TcpStream,
    parser: &mut FrameParser,
    limit: Duration,
) -> AmiResult<String> {
    let mut read_buffer = [0u8; SOCKET_BUF_SIZE];
    let deadline = deadline_after(Instant::now(), limit);
    loop {
        if let Some(banner) = parser.take_greeting() {
            return Ok(banner);
        }
        let n = match timeout_at(deadline, stream.read(&mut read_buffer)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(AmiError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                })
            }
        };
        if n == 0 {
            return Err(AmiError::ConnectionLost);
        }
        parser.add_data(&read_buffer[..n])?;
    }
}

/// State shared between [`Transport`] handles and the read task.
struct TransportShared {
    correlator: parking_lot::Mutex<Correlator>,
    last_rx: parking_lot::Mutex<Instant>,
    status_tx: watch::Sender<TransportStatus>,
}

impl TransportShared {
    /// Mark closed and fail every pending request. Only the first reason is
    /// recorded; returns whether this call did the closing.
    fn close(&self, reason: DisconnectReason) -> bool {
        let mut recorded = None;
        let changed = self
            .status_tx
            .send_if_modified(|status| {
                if *status != TransportStatus::Open {
                    return false;
                }
                recorded = Some(reason.clone());
                *status = TransportStatus::Closed(reason.clone());
                true
            });
        if changed {
            let failed = self
                .correlator
                .lock()
                .close();
            info!(
                "[CLOSE] Transport closed ({}), {} pending request(s) failed",
                recorded
                    .map(|r| r.to_string())
                    .unwrap_or_default(),
                failed
            );
        }
        changed
    }

    /// Hand one decoded frame to the correlator, then to the dispatcher.
    ///
    /// Events go to the dispatcher even when the correlator consumed them, so
    /// observers can watch list progress.
    fn route(&self, dispatcher: &EventDispatcher, frame: Frame) {
        let consumed = self
            .correlator
            .lock()
            .feed(&frame);
        match frame.kind() {
            FrameKind::Event => {
                dispatcher.dispatch(&frame);
            }
            kind if !consumed => {
                debug!(
                    "[RECV] Discarding unmatched {:?} frame (ActionID {:?})",
                    kind,
                    frame.action_id()
                );
            }
            _ => {}
        }
    }
}

/// One authenticated-or-not socket to the exchange (Clone + Send).
///
/// Writes are serialized through the writer mutex; the spawned read task
/// decodes frames and routes them. A transport never reconnects itself: once
/// closed it stays closed and every pending request has been failed.
#[derive(Clone)]
pub struct Transport {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    shared: Arc<TransportShared>,
    status_rx: watch::Receiver<TransportStatus>,
    banner: Arc<str>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("banner", &self.banner)
            .field("open", &self.is_open())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Transport {
    /// Connect, consume the banner, and start the read task.
    ///
    /// `id_prefix` is prepended to every generated `ActionID`.
    pub async fn open(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        dispatcher: Arc<EventDispatcher>,
        id_prefix: impl Into<String>,
    ) -> AmiResult<Self> {
        let mut stream = tcp_connect_with_timeout(host, port, connect_timeout).await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("[CONNECT] Could not set TCP_NODELAY: {}", e);
        }

        let mut parser = FrameParser::new();
        let banner = read_greeting(&mut stream, &mut parser, connect_timeout).await?;
        if !banner.starts_with("Asterisk Call Manager") {
            warn!("[CONNECT] Unexpected banner: {:?}", banner);
        }
        info!("[CONNECT] Connected to {}:{} ({})", host, port, banner);

        let (read_half, write_half) = stream.into_split();
        let (status_tx, status_rx) = watch::channel(TransportStatus::Open);
        let shared = Arc::new(TransportShared {
            correlator: parking_lot::Mutex::new(Correlator::new(id_prefix)),
            last_rx: parking_lot::Mutex::new(Instant::now()),
            status_tx,
        });

        tokio::spawn(read_loop(
            read_half,
            parser,
            shared.clone(),
            dispatcher,
            status_rx.clone(),
        ));

        Ok(Transport {
            writer: Arc::new(Mutex::new(write_half)),
            shared,
            status_rx,
            banner: banner.into(),
        })
    }

    /// Send an action and wait for its single `Response`.
    ///
    /// The reply is returned as-is; call
    /// [`AmiResponse::into_result`] to turn `Response: Error` into an error.
    pub async fn send(&self, action: &Action, limit: Duration) -> AmiResult<AmiResponse> {
        match self
            .submit(action, limit, Completion::Response)
            .await?
        {
            Resolution::Response(response) => Ok(response),
            Resolution::List(_) => Err(AmiError::protocol_error(
                "list payload for a single-response action",
            )),
        }
    }

    /// Send a list action completing with `<Action>Complete`.
    pub async fn send_list(&self, action: &Action, limit: Duration) -> AmiResult<EventList> {
        self.send_list_until(action, Completion::list_for(action.name()), limit)
            .await
    }

    /// Send a list action with an explicit completion event name.
    pub async fn send_list_until_event(
        &self,
        action: &Action,
        complete_event: &str,
        limit: Duration,
    ) -> AmiResult<EventList> {
        let completion = Completion::List {
            complete_event: complete_event.to_string(),
        };
        self.send_list_until(action, completion, limit)
            .await
    }

    async fn send_list_until(
        &self,
        action: &Action,
        completion: Completion,
        limit: Duration,
    ) -> AmiResult<EventList> {
        match self
            .submit(action, limit, completion)
            .await?
        {
            Resolution::List(list) => Ok(list),
            Resolution::Response(_) => Err(AmiError::protocol_error(
                "single response for a list action",
            )),
        }
    }

    async fn submit(
        &self,
        action: &Action,
        limit: Duration,
        completion: Completion,
    ) -> AmiResult<Resolution> {
        if !self.is_open() {
            return Err(AmiError::NotConnected);
        }

        let (action_id, frame, mut rx) = {
            let mut correlator = self
                .shared
                .correlator
                .lock();
            let action_id = correlator.next_action_id();
            let frame = action.to_frame(&action_id)?;
            let rx = correlator.register(&action_id, limit, completion)?;
            (action_id, frame, rx)
        };
        let deadline = deadline_after(Instant::now(), limit);
        debug!("[SEND] {} (ActionID {})", action.name(), action_id);

        // The write runs detached so a caller dropping this future mid-write
        // cannot leave a torn frame on the wire. It is abandoned once the
        // transport closes, so a peer that stopped reading cannot pin the
        // writer lock.
        let wire = encode(&frame);
        let writer = self
            .writer
            .clone();
        let shared = self
            .shared
            .clone();
        let mut status = self
            .status_rx
            .clone();
        tokio::spawn(async move {
            let mut writer = tokio::select! {
                guard = writer.lock() => guard,
                _ = closed(&mut status) => return,
            };
            tokio::select! {
                written = writer.write_all(wire.as_bytes()) => {
                    if let Err(e) = written {
                        warn!("[SEND] Write failed: {}", e);
                        shared.close(DisconnectReason::IoError(e.to_string()));
                    }
                }
                _ = closed(&mut status) => {
                    trace!("[SEND] Write abandoned, transport closed");
                }
            }
        });

        let timeout_ms = limit.as_millis() as u64;
        match timeout_at(deadline, &mut rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(AmiError::ConnectionLost),
            Err(_) => {
                let cancelled = self
                    .shared
                    .correlator
                    .lock()
                    .cancel(&action_id);
                if cancelled {
                    debug!("[SEND] ActionID {} timed out after {}ms", action_id, timeout_ms);
                    Err(AmiError::Timeout { timeout_ms })
                } else {
                    // Resolved or expired concurrently; take whichever won.
                    rx.try_recv()
                        .unwrap_or(Err(AmiError::Timeout { timeout_ms }))
                }
            }
        }
    }

    /// Close the socket and fail every pending request.
    ///
    /// In-flight writes are abandoned; the write half is shut down once it is
    /// free, giving up after a bounded wait.
    pub async fn close(&self, reason: DisconnectReason) {
        self.shared
            .close(reason);
        let release = Duration::from_millis(WRITER_RELEASE_TIMEOUT_MS);
        let Ok(mut writer) = timeout(release, self.writer.lock()).await else {
            warn!("[CLOSE] Write half still busy after {:?}, not shutting it down", release);
            return;
        };
        if let Err(e) = timeout(release, writer.shutdown())
            .await
            .unwrap_or_else(|_| Err(std::io::ErrorKind::TimedOut.into()))
        {
            trace!("[CLOSE] Shutdown of write half failed: {}", e);
        }
    }

    /// Whether the transport is still open.
    pub fn is_open(&self) -> bool {
        matches!(
            *self
                .status_rx
                .borrow(),
            TransportStatus::Open
        )
    }

    pub fn status(&self) -> TransportStatus {
        self.status_rx
            .borrow()
            .clone()
    }

    /// Watch channel that flips to `Closed` exactly once.
    pub fn status_watch(&self) -> watch::Receiver<TransportStatus> {
        self.status_rx
            .clone()
    }

    /// Time since the last inbound bytes.
    pub fn idle_for(&self) -> Duration {
        self.shared
            .last_rx
            .lock()
            .elapsed()
    }

    /// Requests registered but not yet resolved.
    pub fn pending_count(&self) -> usize {
        self.shared
            .correlator
            .lock()
            .len()
    }

    /// Banner line the exchange sent on connect.
    pub fn banner(&self) -> &str {
        &self.banner
    }
}

/// Resolve once the transport is no longer open.
async fn closed(status: &mut watch::Receiver<TransportStatus>) {
    let _ = status
        .wait_for(|s| *s != TransportStatus::Open)
        .await;
}

/// Background read task
async fn read_loop(
    reader: OwnedReadHalf,
    parser: FrameParser,
    shared: Arc<TransportShared>,
    dispatcher: Arc<EventDispatcher>,
    status_rx: watch::Receiver<TransportStatus>,
) {
    let result = std::panic::AssertUnwindSafe(read_loop_inner(
        reader,
        parser,
        shared.clone(),
        dispatcher,
        status_rx,
    ));
    let reason = match futures_util::FutureExt::catch_unwind(result).await {
        Ok(reason) => reason,
        Err(_) => {
            tracing::error!("read task panicked");
            DisconnectReason::IoError("read task panicked".to_string())
        }
    };
    shared.close(reason);
}

async fn read_loop_inner(
    mut reader: OwnedReadHalf,
    mut parser: FrameParser,
    shared: Arc<TransportShared>,
    dispatcher: Arc<EventDispatcher>,
    mut status_rx: watch::Receiver<TransportStatus>,
) -> DisconnectReason {
    let mut read_buffer = [0u8; SOCKET_BUF_SIZE];
    let mut sweep = tokio::time::interval(Duration::from_millis(SWEEP_INTERVAL_MS));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // Drain buffered frames first
        while let Some(frame) = parser.next_frame() {
            trace!("[RECV] {:?} frame", frame.kind());
            shared.route(&dispatcher, frame);
        }

        tokio::select! {
            read = reader.read(&mut read_buffer) => match read {
                Ok(0) => {
                    info!("[RECV] Connection closed (EOF)");
                    return DisconnectReason::ConnectionClosed;
                }
                Ok(n) => {
                    *shared.last_rx.lock() = Instant::now();
                    if let Err(e) = parser.add_data(&read_buffer[..n]) {
                        warn!("[RECV] Buffer error: {}", e);
                        return DisconnectReason::ProtocolDesync(e.to_string());
                    }
                }
                Err(e) => {
                    warn!("[RECV] Read error: {}", e);
                    return DisconnectReason::IoError(e.to_string());
                }
            },
            _ = sweep.tick() => {
                let expired = shared
                    .correlator
                    .lock()
                    .expire(Instant::now());
                if expired > 0 {
                    debug!("[SWEEP] Expired {} abandoned request(s)", expired);
                }
            }
            changed = status_rx.changed() => {
                let closed = changed.is_err()
                    || !matches!(*status_rx.borrow(), TransportStatus::Open);
                if closed {
                    debug!("[RECV] Transport closed, read task exiting");
                    return DisconnectReason::ClientRequested;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const LIMIT: Duration = Duration::from_secs(2);

    /// Accept one client, send the banner, and hand back the server socket.
    async fn pair() -> (Transport, TcpStream, Arc<EventDispatcher>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap();
        let port = listener
            .local_addr()
            .unwrap()
            .port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener
                .accept()
                .await
                .unwrap();
            socket
                .write_all(b"Asterisk Call Manager/9.0.0\r\n")
                .await
                .unwrap();
            socket
        });
        let dispatcher = Arc::new(EventDispatcher::new());
        let transport = Transport::open("127.0.0.1", port, LIMIT, dispatcher.clone(), "t-")
            .await
            .unwrap();
        (transport, server.await.unwrap(), dispatcher)
    }

    /// Read one frame from the server side.
    async fn read_frame(socket: &mut TcpStream, parser: &mut FrameParser) -> Frame {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(frame) = parser.next_frame() {
                return frame;
            }
            let n = socket
                .read(&mut buf)
                .await
                .unwrap();
            assert!(n > 0, "client closed early");
            parser
                .add_data(&buf[..n])
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_banner_and_open() {
        let (transport, _server, _) = pair().await;
        assert_eq!(transport.banner(), "Asterisk Call Manager/9.0.0");
        assert!(transport.is_open());
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_resolves_by_action_id() {
        let (transport, mut server, _) = pair().await;
        let client = transport.clone();
        let call = tokio::spawn(async move {
            client
                .send(&Action::ping(), LIMIT)
                .await
        });

        let mut parser = FrameParser::new();
        let request = read_frame(&mut server, &mut parser).await;
        assert_eq!(request.get("Action"), Some("Ping"));
        let id = request
            .action_id()
            .unwrap()
            .to_string();
        assert!(id.starts_with("t-"));

        let reply = format!(
            "Response: Success\r\nActionID: stale\r\n\r\nResponse: Success\r\nActionID: {}\r\nPing: Pong\r\n\r\n",
            id
        );
        server
            .write_all(reply.as_bytes())
            .await
            .unwrap();

        let response = call
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.get("Ping"), Some("Pong"));
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_events_reach_dispatcher() {
        let (_transport, mut server, dispatcher) = pair().await;
        let mut events = dispatcher.stream("FullyBooted", 4);
        server
            .write_all(b"Event: FullyBooted\r\nStatus: Fully Booted\r\n\r\n")
            .await
            .unwrap();
        let frame = events
            .recv()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.get("Status"), Some("Fully Booted"));
    }

    #[tokio::test]
    async fn test_socket_drop_fails_pending() {
        let (transport, mut server, _) = pair().await;
        let mut calls = Vec::new();
        for _ in 0..3 {
            let client = transport.clone();
            calls.push(tokio::spawn(async move {
                client
                    .send(&Action::new("Hold"), LIMIT)
                    .await
            }));
        }

        let mut parser = FrameParser::new();
        for _ in 0..3 {
            read_frame(&mut server, &mut parser).await;
        }
        drop(server);

        for call in calls {
            assert!(matches!(
                call.await
                    .unwrap(),
                Err(AmiError::ConnectionLost)
            ));
        }
        let mut status = transport.status_watch();
        status
            .wait_for(|s| *s != TransportStatus::Open)
            .await
            .unwrap();
        assert_eq!(
            transport.status(),
            TransportStatus::Closed(DisconnectReason::ConnectionClosed)
        );
        assert!(matches!(
            transport
                .send(&Action::ping(), LIMIT)
                .await,
            Err(AmiError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_unanswered_action_times_out() {
        let (transport, _server, _) = pair().await;
        let result = transport
            .send(&Action::ping(), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(AmiError::Timeout { timeout_ms: 50 })));
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_with_stalled_peer_returns() {
        let (transport, _server, _) = pair().await;
        let payload = "x".repeat(256 * 1024);
        let mut calls = Vec::new();
        for _ in 0..64 {
            let client = transport.clone();
            let action = Action::new("UserEvent")
                .field("UserEvent", "Bulk")
                .field("Payload", payload.as_str());
            calls.push(tokio::spawn(async move {
                client
                    .send(&action, LIMIT)
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        timeout(
            Duration::from_secs(3),
            transport.close(DisconnectReason::LivenessExpired),
        )
        .await
        .expect("close blocked on the writer");
        for call in calls {
            assert!(matches!(
                call.await
                    .unwrap(),
                Err(AmiError::ConnectionLost) | Err(AmiError::NotConnected)
            ));
        }
        assert_eq!(
            transport.status(),
            TransportStatus::Closed(DisconnectReason::LivenessExpired)
        );
    }

    #[tokio::test]
    async fn test_unbounded_timeout_is_accepted() {
        let (transport, mut server, _) = pair().await;
        let client = transport.clone();
        let call = tokio::spawn(async move {
            client
                .send(&Action::ping(), Duration::MAX)
                .await
        });

        let mut parser = FrameParser::new();
        let request = read_frame(&mut server, &mut parser).await;
        let reply = format!(
            "Response: Success\r\nActionID: {}\r\n\r\n",
            request
                .action_id()
                .unwrap()
        );
        server
            .write_all(reply.as_bytes())
            .await
            .unwrap();
        assert!(call
            .await
            .unwrap()
            .is_ok());
    }

    #[tokio::test]
    async fn test_close_is_first_reason_wins() {
        let (transport, _server, _) = pair().await;
        transport
            .close(DisconnectReason::LivenessExpired)
            .await;
        transport
            .close(DisconnectReason::ClientRequested)
            .await;
        assert_eq!(
            transport.status(),
            TransportStatus::Closed(DisconnectReason::LivenessExpired)
        );
    }
}
