//! TCP gateway for the collaboration protocol.
//!
//! One thread accepts connections; each connection gets its own thread that
//! alternates between draining the session's event queue to the socket and
//! reading the next JSONL line (with a short read timeout so events are not
//! held back by an idle client).

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cosheet_config::ServerSettings;
use cosheet_engine::{Coord, Extent};
use cosheet_protocol::{
    codes, ClientMessage, PongMessage, ServerMessage, WelcomeMessage, MAX_MESSAGE_SIZE,
    PROTOCOL_VERSION,
};

use super::auth::Authenticator;
use super::events::{EventRegistry, SessionEvents};
use super::hub::SessionHub;
use super::wire;

/// Read timeout per poll; bounds event latency on an idle connection.
const READ_POLL: Duration = Duration::from_millis(100);

/// Longest raw line buffered: a full message plus its CRLF terminator.
const MAX_LINE_BYTES: usize = MAX_MESSAGE_SIZE + 2;

/// Configuration for the gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: String,
    pub max_connections: usize,
    /// Consecutive malformed lines tolerated before disconnecting.
    pub max_parse_failures: u32,
}

impl GatewayConfig {
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            bind: settings.bind.clone(),
            max_connections: settings.max_connections,
            max_parse_failures: settings.max_parse_failures,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from_settings(&ServerSettings::default())
    }
}

/// Operational metrics for the gateway.
#[derive(Clone, Default)]
pub struct ServerMetrics {
    /// Connections closed due to parse failure limit.
    pub connections_closed_parse_failures: Arc<AtomicU64>,
    /// Connections closed due to oversized message.
    pub connections_closed_oversize: Arc<AtomicU64>,
    /// Connections refused due to connection limit.
    pub connections_refused_limit: Arc<AtomicU64>,
    /// Hello messages with a bad token.
    pub auth_failures: Arc<AtomicU64>,
}

/// Shared state handed to every connection thread.
#[derive(Clone)]
struct ConnectionContext {
    hub: Arc<SessionHub>,
    events: EventRegistry,
    auth: Arc<dyn Authenticator>,
    metrics: ServerMetrics,
    shutdown: Arc<AtomicBool>,
    max_parse_failures: u32,
}

pub struct CollabServer {
    hub: Arc<SessionHub>,
    events: EventRegistry,
    auth: Arc<dyn Authenticator>,
    listener_handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    bound_addr: Option<SocketAddr>,
    active_connections: Arc<AtomicUsize>,
    metrics: ServerMetrics,
}

impl CollabServer {
    /// `events` must be the sink the hub's document registry delivers to.
    pub fn new(hub: Arc<SessionHub>, events: EventRegistry, auth: Arc<dyn Authenticator>) -> Self {
        Self {
            hub,
            events,
            auth,
            listener_handle: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            bound_addr: None,
            active_connections: Arc::new(AtomicUsize::new(0)),
            metrics: ServerMetrics::default(),
        }
    }

    /// Bind and start accepting connections. Returns the bound address.
    pub fn start(&mut self, config: GatewayConfig) -> std::io::Result<SocketAddr> {
        if let (true, Some(addr)) = (self.is_running(), self.bound_addr) {
            return Ok(addr);
        }
        self.shutdown.store(false, Ordering::SeqCst);

        let listener = TcpListener::bind(&config.bind)?;
        let addr = listener.local_addr()?;
        // Non-blocking so the accept loop can check the shutdown flag
        listener.set_nonblocking(true)?;
        self.bound_addr = Some(addr);

        let ctx = ConnectionContext {
            hub: Arc::clone(&self.hub),
            events: self.events.clone(),
            auth: Arc::clone(&self.auth),
            metrics: self.metrics.clone(),
            shutdown: Arc::clone(&self.shutdown),
            max_parse_failures: config.max_parse_failures,
        };
        let active = Arc::clone(&self.active_connections);
        let max_connections = config.max_connections;

        self.listener_handle = Some(
            thread::Builder::new()
                .name("gateway-accept".into())
                .spawn(move || run_listener(listener, ctx, active, max_connections))?,
        );

        log::info!("Collaboration server listening on {}", addr);
        Ok(addr)
    }

    /// Stop accepting, and wait briefly for connection threads to close
    /// their sessions.
    pub fn stop(&mut self) {
        if self.listener_handle.is_none() {
            return;
        }
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.listener_handle.take() {
            let _ = handle.join();
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while self.active_connections.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        self.bound_addr = None;
        log::info!("Collaboration server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.listener_handle.is_some() && !self.shutdown.load(Ordering::SeqCst)
    }

    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }

    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    pub fn dropped_events_count(&self) -> u64 {
        self.events.dropped_events_count()
    }
}

impl Drop for CollabServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_listener(
    listener: TcpListener,
    ctx: ConnectionContext,
    active: Arc<AtomicUsize>,
    max_connections: usize,
) {
    while !ctx.shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((mut stream, addr)) => {
                if active.load(Ordering::SeqCst) >= max_connections {
                    log::warn!(
                        "Connection refused from {}: limit of {} reached",
                        addr,
                        max_connections
                    );
                    ctx.metrics.connections_refused_limit.fetch_add(1, Ordering::Relaxed);
                    let _ = stream.set_nonblocking(false);
                    let _ = send_message(
                        &mut stream,
                        &ServerMessage::error(None, codes::TOO_MANY_CONNECTIONS, "connection limit reached"),
                    );
                    continue;
                }

                log::debug!("Accepted connection from {}", addr);
                active.fetch_add(1, Ordering::SeqCst);
                let conn_ctx = ctx.clone();
                let conn_active = Arc::clone(&active);
                let spawned = thread::Builder::new()
                    .name(format!("conn-{}", addr))
                    .spawn(move || {
                        if let Err(e) = handle_connection(stream, &conn_ctx) {
                            log::warn!("Connection error from {}: {}", addr, e);
                        }
                        log::debug!("Connection from {} closed", addr);
                        conn_active.fetch_sub(1, Ordering::SeqCst);
                    });
                if let Err(e) = spawned {
                    log::error!("Cannot spawn connection thread: {}", e);
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(20));
            }
            Err(e) => {
                log::error!("Accept error: {}", e);
                break;
            }
        }
    }
}

/// An authenticated connection.
struct Session {
    id: String,
    events: SessionEvents,
}

fn handle_connection(stream: TcpStream, ctx: &ConnectionContext) -> std::io::Result<()> {
    let mut session = None;
    let result = serve_connection(stream, ctx, &mut session);
    // A dropped connection leaves its document.
    if let Some(session) = session {
        ctx.hub.close_session(&session.id);
        ctx.events.unregister(&session.id);
    }
    result
}

fn serve_connection(
    mut stream: TcpStream,
    ctx: &ConnectionContext,
    session: &mut Option<Session>,
) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_POLL))?;
    stream.set_write_timeout(Some(Duration::from_secs(10)))?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut buf: Vec<u8> = Vec::new();
    let mut parse_failures: u32 = 0;

    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            let _ = send_message(
                &mut stream,
                &ServerMessage::error(None, codes::SHUTTING_DOWN, "server is shutting down"),
            );
            return Ok(());
        }

        if let Some(session) = session.as_ref() {
            flush_events(&mut stream, session)?;
        }

        // Partial lines stay in `buf` across read timeouts. The read never
        // takes more than one byte past the line limit.
        let room = (MAX_LINE_BYTES + 1).saturating_sub(buf.len()) as u64;
        match reader.by_ref().take(room).read_until(b'\n', &mut buf) {
            Ok(0) => return Ok(()), // Connection closed
            Ok(_) => {}
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => return Err(e),
        }
        if buf.last() != Some(&b'\n') {
            if buf.len() > MAX_LINE_BYTES {
                return close_oversized(&mut stream, ctx, buf.len());
            }
            // Timed out or EOF mid-line; the next read continues or reports the close
            continue;
        }

        let line = std::mem::take(&mut buf);
        let line = String::from_utf8_lossy(&line);
        let line = line.trim_end_matches(['\r', '\n']);
        if line.len() > MAX_MESSAGE_SIZE {
            return close_oversized(&mut stream, ctx, line.len());
        }
        if line.trim().is_empty() {
            continue;
        }

        let msg: ClientMessage = match serde_json::from_str(line) {
            Ok(m) => {
                parse_failures = 0;
                m
            }
            Err(e) => {
                parse_failures += 1;
                log::debug!("Malformed message ({}/{}): {}", parse_failures, ctx.max_parse_failures, e);
                send_message(
                    &mut stream,
                    &ServerMessage::error(None, codes::PARSE_ERROR, format!("malformed message: {}", e)),
                )?;
                if parse_failures >= ctx.max_parse_failures {
                    log::warn!("Connection exceeded parse failure limit, disconnecting");
                    ctx.metrics
                        .connections_closed_parse_failures
                        .fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                continue;
            }
        };

        // First message must be Hello
        let Some(active) = session.as_ref() else {
            match authenticate(&mut stream, ctx, msg)? {
                Some(new_session) => *session = Some(new_session),
                None => return Ok(()),
            }
            continue;
        };

        if let Some(response) = handle_message(msg, &active.id, ctx) {
            send_message(&mut stream, &response)?;
        }
    }
}

/// Handle the first message. Returns None if the connection must close.
fn authenticate(
    stream: &mut TcpStream,
    ctx: &ConnectionContext,
    msg: ClientMessage,
) -> std::io::Result<Option<Session>> {
    let hello = match msg {
        ClientMessage::Hello(hello) => hello,
        _ => {
            send_message(
                stream,
                &ServerMessage::error(None, codes::NOT_AUTHENTICATED, "first message must be hello"),
            )?;
            return Ok(None);
        }
    };

    if hello.protocol_version > PROTOCOL_VERSION {
        send_message(
            stream,
            &ServerMessage::error(
                Some(hello.id),
                codes::PROTOCOL_MISMATCH,
                format!("server speaks protocol {}", PROTOCOL_VERSION),
            ),
        )?;
        return Ok(None);
    }

    let Some(identity) = ctx.auth.authenticate(&hello.token) else {
        ctx.metrics.auth_failures.fetch_add(1, Ordering::Relaxed);
        log::warn!("Authentication failed");
        send_message(
            stream,
            &ServerMessage::error(Some(hello.id), codes::AUTH_FAILED, "unknown token"),
        )?;
        return Ok(None);
    };

    let session_id = ctx.hub.open_session(&identity);
    let events = ctx.events.register(&session_id);
    send_message(
        stream,
        &ServerMessage::Welcome(WelcomeMessage {
            id: hello.id,
            session_id: session_id.clone(),
            user_id: identity.user_id,
            role: wire::role(identity.role),
            protocol_version: hello.protocol_version.min(PROTOCOL_VERSION),
        }),
    )?;
    Ok(Some(Session {
        id: session_id,
        events,
    }))
}

/// Handle an authenticated message. Edits, resizes and leaves only answer
/// on failure; their effects arrive as events.
fn handle_message(msg: ClientMessage, session_id: &str, ctx: &ConnectionContext) -> Option<ServerMessage> {
    let hub = &ctx.hub;
    match msg {
        ClientMessage::Hello(hello) => Some(ServerMessage::error(
            Some(hello.id),
            codes::AUTH_FAILED,
            "session already authenticated",
        )),
        ClientMessage::Join(join) => Some(match hub.join(session_id, &join.document_id) {
            Ok(outcome) => ServerMessage::Joined(wire::document_state(join.id, &outcome)),
            Err(e) => wire::error(Some(join.id), Some(&join.document_id), &e),
        }),
        ClientMessage::Edit(edit) => hub
            .edit(session_id, &edit.document_id, Coord::new(edit.row, edit.col), &edit.raw_input)
            .err()
            .map(|e| wire::error(None, Some(&edit.document_id), &e)),
        ClientMessage::Resize(resize) => hub
            .resize(session_id, &resize.document_id, Extent::new(resize.rows, resize.cols))
            .err()
            .map(|e| wire::error(None, Some(&resize.document_id), &e)),
        ClientMessage::Leave(leave) => hub
            .leave(session_id, &leave.document_id)
            .err()
            .map(|e| wire::error(None, Some(&leave.document_id), &e)),
        ClientMessage::Snapshot(req) => Some(match hub.snapshot(session_id, &req.document_id) {
            Ok(outcome) => ServerMessage::Snapshot(wire::document_state(req.id, &outcome)),
            Err(e) => wire::error(Some(req.id), Some(&req.document_id), &e),
        }),
        ClientMessage::Ping(ping) => {
            hub.sessions().touch(session_id);
            Some(ServerMessage::Pong(PongMessage { id: ping.id }))
        }
    }
}

fn flush_events(stream: &mut TcpStream, session: &Session) -> std::io::Result<()> {
    for event in session.events.poll() {
        send_message(stream, &wire::outbound(&event))?;
    }
    let dropped = session.events.take_dropped();
    if dropped > 0 {
        send_message(stream, &wire::events_dropped(dropped))?;
    }
    Ok(())
}

fn close_oversized(stream: &mut TcpStream, ctx: &ConnectionContext, len: usize) -> std::io::Result<()> {
    log::warn!("Oversized message ({} bytes), disconnecting", len);
    ctx.metrics.connections_closed_oversize.fetch_add(1, Ordering::Relaxed);
    send_message(
        stream,
        &ServerMessage::error(
            None,
            codes::MESSAGE_TOO_LARGE,
            format!("messages are limited to {} bytes", MAX_MESSAGE_SIZE),
        ),
    )
}

fn send_message(stream: &mut TcpStream, msg: &ServerMessage) -> std::io::Result<()> {
    let mut json = serde_json::to_string(msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    json.push('\n');
    stream.write_all(json.as_bytes())?;
    stream.flush()
}
