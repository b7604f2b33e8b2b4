//! # Connection
//!
//! Purpose: Own one physical byte stream and run strictly ordered
//! request/reply exchanges on it, in blocking or async style.
//!
//! ## Design Principles
//! 1. **Single Flight**: `&mut self` on every exchange means one outstanding
//!    call per connection; concurrency comes from pooling more connections.
//! 2. **Strict FIFO**: replies are matched to requests in write order; pushes
//!    are routed to the push handler and never returned as a call result.
//! 3. **Poisoned On Doubt**: a transport error, malformed bytes, a missed
//!    deadline, a cancellation, or an abandoned call marks the connection
//!    broken so a late reply can never be read by the next caller.
//! 4. **Shared Identity**: the id, role, and tracking slot live behind a
//!    cloneable [`ConnectionHandle`] that the pool and the tracking
//!    coordinator can inspect without owning the stream.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rkv_common::{
    encode_command, Command, Frame, ProtocolVersion, Reply, ReplyDecoder, RkvError, RkvResult,
};

use crate::tracking::{disable_command, RedirectTarget, TrackingMode, TrackingRequest};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const READ_CHUNK: usize = 8 * 1024;

/// Process-unique connection identity, assigned at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Server role a connection talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Master,
    Replica,
}

/// Callback receiving unsolicited pushes, tagged with the receiving connection.
pub type PushHandler = Arc<dyn Fn(ConnectionId, &[Reply]) + Send + Sync>;

/// Per-connection tracking flags, written only by the tracking coordinator
/// while it holds the connection checked out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackingSlot {
    pub enabled: bool,
    pub mode: Option<TrackingMode>,
    pub redirect: Option<RedirectTarget>,
}

#[derive(Debug)]
struct HandleState {
    protocol: ProtocolVersion,
    client_id: Option<i64>,
    tracking: TrackingSlot,
}

#[derive(Debug)]
struct HandleInner {
    id: ConnectionId,
    role: Role,
    endpoint: String,
    broken: AtomicBool,
    state: Mutex<HandleState>,
}

/// Cloneable view of a connection's identity and shared flags.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    fn new(role: Role, endpoint: String) -> Self {
        ConnectionHandle {
            inner: Arc::new(HandleInner {
                id: ConnectionId::next(),
                role,
                endpoint,
                broken: AtomicBool::new(false),
                state: Mutex::new(HandleState {
                    protocol: ProtocolVersion::Resp2,
                    client_id: None,
                    tracking: TrackingSlot::default(),
                }),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Protocol negotiated at handshake.
    pub fn protocol(&self) -> ProtocolVersion {
        self.inner.state.lock().protocol
    }

    /// Server-assigned client id, known after a RESP3 handshake.
    pub fn client_id(&self) -> Option<i64> {
        self.inner.state.lock().client_id
    }

    pub fn is_broken(&self) -> bool {
        self.inner.broken.load(Ordering::Acquire)
    }

    pub fn tracking(&self) -> TrackingSlot {
        self.inner.state.lock().tracking
    }

    pub fn is_tracking(&self) -> bool {
        self.inner.state.lock().tracking.enabled
    }

    pub fn redirect_target(&self) -> Option<RedirectTarget> {
        self.inner.state.lock().tracking.redirect
    }

    pub(crate) fn set_tracking(&self, request: &TrackingRequest) {
        self.inner.state.lock().tracking = TrackingSlot {
            enabled: true,
            mode: Some(request.mode),
            redirect: request.redirect,
        };
    }

    pub(crate) fn clear_tracking(&self) {
        self.inner.state.lock().tracking = TrackingSlot::default();
    }

    /// Marks the connection unusable; the pool drops it at the next checkin
    /// or checkout. Returns false when it was already broken.
    pub(crate) fn mark_broken(&self) -> bool {
        !self.inner.broken.swap(true, Ordering::AcqRel)
    }

    fn set_negotiated(&self, protocol: ProtocolVersion, client_id: Option<i64>) {
        let mut state = self.inner.state.lock();
        state.protocol = protocol;
        state.client_id = client_id;
    }
}

/// Blocking stream with an adjustable read deadline.
pub trait BlockingStream: Read + Write + Send + 'static {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Switches reads between waiting and returning `WouldBlock` at once.
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;
}

impl BlockingStream for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }
}

/// Steps run on a fresh connection before it is handed out.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub protocol: ProtocolVersion,
    pub client_name: Option<String>,
    /// Tracking request of an already-enabled group (masters only).
    pub tracking: Option<TrackingRequest>,
}

/// One physical connection.
pub struct Connection<S> {
    stream: S,
    handle: ConnectionHandle,
    decoder: ReplyDecoder,
    read_buf: BytesMut,
    write_buf: Vec<u8>,
    in_flight: bool,
    push_handler: Option<PushHandler>,
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.handle.id())
            .field("role", &self.handle.role())
            .field("endpoint", &self.handle.endpoint())
            .field("protocol", &self.decoder.version())
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

impl<S> Connection<S> {
    /// Wraps a freshly connected stream. The connection speaks RESP2 until a
    /// handshake negotiates otherwise.
    pub fn new(stream: S, role: Role, endpoint: impl Into<String>) -> Self {
        let handle = ConnectionHandle::new(role, endpoint.into());
        debug!(id = %handle.id(), role = ?role, endpoint = handle.endpoint(), "connection established");
        Connection {
            stream,
            handle,
            decoder: ReplyDecoder::new(ProtocolVersion::Resp2),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: Vec::with_capacity(256),
            in_flight: false,
            push_handler: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.decoder.version()
    }

    pub fn is_broken(&self) -> bool {
        self.handle.is_broken()
    }

    pub fn set_push_handler(&mut self, handler: Option<PushHandler>) {
        self.push_handler = handler;
    }

    /// Claims the connection for one exchange.
    ///
    /// A flag still set from an earlier call means that call's future was
    /// dropped mid-exchange; its reply may still be on the wire.
    fn begin(&mut self) -> RkvResult<()> {
        if self.in_flight {
            self.in_flight = false;
            self.poison("previous call abandoned mid-exchange");
            return Err(RkvError::Broken);
        }
        if self.handle.is_broken() {
            return Err(RkvError::Broken);
        }
        self.in_flight = true;
        Ok(())
    }

    fn settle<T>(&mut self, result: RkvResult<T>) -> RkvResult<T> {
        self.in_flight = false;
        if let Err(err) = &result {
            if err.is_connection_fatal() {
                self.poison(&err.to_string());
            }
        }
        result
    }

    fn poison(&self, reason: &str) {
        if self.handle.mark_broken() {
            warn!(id = %self.handle.id(), role = ?self.handle.role(), reason, "connection marked broken");
        }
    }

    fn encode(&mut self, commands: &[Command]) {
        self.write_buf.clear();
        for command in commands {
            encode_command(command, &mut self.write_buf);
        }
    }

    /// Decodes buffered frames into `replies`, routing pushes.
    ///
    /// Returns true once `expected` replies have been collected.
    fn drain_frames(&mut self, replies: &mut Vec<Reply>, expected: usize) -> RkvResult<bool> {
        while replies.len() < expected {
            match self.decoder.decode(&mut self.read_buf)? {
                Some(Frame::Reply(reply)) => replies.push(reply),
                Some(Frame::Push(items)) => self.route_push(&items),
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Routes buffered pushes on a connection with nothing in flight.
    ///
    /// Any other frame is a reply nobody asked for; the stream is out of sync.
    fn route_unsolicited(&mut self) -> RkvResult<()> {
        while let Some(frame) = self.decoder.decode(&mut self.read_buf)? {
            match frame {
                Frame::Push(items) => self.route_push(&items),
                Frame::Reply(reply) => {
                    return Err(RkvError::Protocol(format!(
                        "unsolicited {} reply",
                        reply.kind_name()
                    )))
                }
            }
        }
        Ok(())
    }

    fn route_push(&self, items: &[Reply]) {
        match &self.push_handler {
            Some(handler) => handler(self.handle.id(), items),
            None => debug!(id = %self.handle.id(), "push dropped without handler"),
        }
    }

    /// Applies the reply to `HELLO 3`.
    fn apply_hello(&mut self, reply: Reply) -> RkvResult<()> {
        match reply {
            Reply::Map(pairs) => {
                let client_id = pairs.iter().find_map(|(key, value)| match (key.as_bytes(), value) {
                    (Some(b"id"), Reply::Integer(id)) => Some(*id),
                    _ => None,
                });
                self.decoder.set_version(ProtocolVersion::Resp3);
                self.handle.set_negotiated(ProtocolVersion::Resp3, client_id);
                debug!(id = %self.handle.id(), client_id = ?client_id, "negotiated RESP3");
                Ok(())
            }
            Reply::Error(message) if is_hello_unsupported(&message) => {
                self.decoder.set_version(ProtocolVersion::Resp2);
                debug!(id = %self.handle.id(), reason = %message, "server refused RESP3, staying on RESP2");
                Ok(())
            }
            Reply::Error(message) => {
                self.decoder.set_version(ProtocolVersion::Resp2);
                Err(RkvError::Server(message))
            }
            other => Err(RkvError::Protocol(format!(
                "unexpected HELLO reply: {}",
                other.kind_name()
            ))),
        }
    }
}

fn is_hello_unsupported(message: &str) -> bool {
    message.starts_with("NOPROTO") || message.to_ascii_lowercase().contains("unknown command")
}

fn expect_ok(step: &str, reply: Reply) -> RkvResult<()> {
    match reply {
        Reply::SimpleString(text) if text.eq_ignore_ascii_case("OK") => Ok(()),
        Reply::Error(message) => Err(RkvError::Server(message)),
        other => Err(RkvError::Protocol(format!(
            "{} expected OK, got {}",
            step,
            other.kind_name()
        ))),
    }
}

fn single(mut replies: Vec<Reply>) -> RkvResult<Reply> {
    match (replies.pop(), replies.is_empty()) {
        (Some(reply), true) => Ok(reply),
        _ => Err(RkvError::Protocol("expected exactly one reply".into())),
    }
}

fn hello_command() -> Command {
    Command::new("HELLO").arg("3")
}

fn setname_command(name: &str) -> Command {
    Command::new("CLIENT SETNAME").arg(name)
}

/// Waker for a single readiness check; nobody waits on the result.
struct NoopWake;

impl Wake for NoopWake {
    fn wake(self: Arc<Self>) {}
}

fn closed_by_peer() -> RkvError {
    RkvError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "connection closed by peer",
    ))
}

// =============================================================================
// Blocking
// =============================================================================

impl<S: BlockingStream> Connection<S> {
    /// Sends one command and waits up to `timeout` for its reply.
    ///
    /// A server error reply is returned as `Reply::Error`; the connection
    /// stays usable.
    pub fn execute(&mut self, command: &Command, timeout: Duration) -> RkvResult<Reply> {
        self.begin()?;
        let result = self.exchange(std::slice::from_ref(command), timeout);
        self.settle(result).and_then(single)
    }

    /// Writes every command, then reads exactly as many replies in order.
    pub fn pipeline(&mut self, commands: &[Command], timeout: Duration) -> RkvResult<Vec<Reply>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        self.begin()?;
        let result = self.exchange(commands, timeout);
        self.settle(result)
    }

    /// Negotiates the protocol, names the connection, and joins an active
    /// tracking group.
    pub fn handshake(&mut self, handshake: &Handshake, timeout: Duration) -> RkvResult<()> {
        if handshake.protocol == ProtocolVersion::Resp3 {
            // The HELLO reply is already written in RESP3.
            self.decoder.set_version(ProtocolVersion::Resp3);
            let reply = self.execute(&hello_command(), timeout)?;
            self.apply_hello(reply)?;
        }
        if let Some(name) = &handshake.client_name {
            let reply = self.execute(&setname_command(name), timeout)?;
            expect_ok("CLIENT SETNAME", reply)?;
        }
        if let Some(request) = &handshake.tracking {
            self.enable_tracking(request, timeout)?;
        }
        Ok(())
    }

    /// Brings this connection's tracking in line with the group request,
    /// turning it off first when it tracks under an older request.
    pub(crate) fn sync_tracking(
        &mut self,
        request: Option<&TrackingRequest>,
        timeout: Duration,
    ) -> RkvResult<()> {
        if self.handle.is_tracking() {
            let reply = self.execute(&disable_command(), timeout)?;
            expect_ok("CLIENT TRACKING", reply)?;
            self.handle.clear_tracking();
        }
        match request {
            Some(request) => self.enable_tracking(request, timeout),
            None => Ok(()),
        }
    }

    fn enable_tracking(&mut self, request: &TrackingRequest, timeout: Duration) -> RkvResult<()> {
        let reply = self.execute(&request.enable_command(), timeout)?;
        expect_ok("CLIENT TRACKING", reply)?;
        self.handle.set_tracking(request);
        Ok(())
    }

    /// Routes pushes that already arrived on an idle connection without
    /// waiting for more bytes.
    pub fn poll_pushes(&mut self) -> RkvResult<()> {
        self.begin()?;
        let result = self.read_ready().and_then(|()| self.route_unsolicited());
        self.settle(result)
    }

    fn read_ready(&mut self) -> RkvResult<()> {
        self.stream.set_nonblocking(true)?;
        let mut chunk = [0u8; READ_CHUNK];
        let outcome = loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => break Err(closed_by_peer()),
                Ok(read) => self.read_buf.extend_from_slice(&chunk[..read]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => break Err(err.into()),
            }
        };
        self.stream.set_nonblocking(false)?;
        outcome
    }

    fn exchange(&mut self, commands: &[Command], timeout: Duration) -> RkvResult<Vec<Reply>> {
        let deadline = Instant::now() + timeout;
        self.encode(commands);
        self.stream.write_all(&self.write_buf)?;
        self.stream.flush()?;

        let mut replies = Vec::with_capacity(commands.len());
        while !self.drain_frames(&mut replies, commands.len())? {
            self.fill(deadline)?;
        }
        Ok(replies)
    }

    fn fill(&mut self, deadline: Instant) -> RkvResult<()> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(RkvError::Timeout);
        }
        self.stream.set_read_timeout(Some(remaining))?;

        let mut chunk = [0u8; READ_CHUNK];
        match self.stream.read(&mut chunk) {
            Ok(0) => Err(closed_by_peer()),
            Ok(read) => {
                self.read_buf.extend_from_slice(&chunk[..read]);
                Ok(())
            }
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Err(RkvError::Timeout)
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

// =============================================================================
// Async
// =============================================================================

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Connection<S> {
    /// Async mirror of [`Connection::execute`].
    ///
    /// Cancellation aborts the wait, not a write already sent; either way the
    /// connection is marked broken.
    pub async fn execute_async(
        &mut self,
        command: &Command,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> RkvResult<Reply> {
        self.begin()?;
        let result = self
            .exchange_async(std::slice::from_ref(command), timeout, cancel)
            .await;
        self.settle(result).and_then(single)
    }

    pub async fn pipeline_async(
        &mut self,
        commands: &[Command],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> RkvResult<Vec<Reply>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        self.begin()?;
        let result = self.exchange_async(commands, timeout, cancel).await;
        self.settle(result)
    }

    pub async fn handshake_async(
        &mut self,
        handshake: &Handshake,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> RkvResult<()> {
        if handshake.protocol == ProtocolVersion::Resp3 {
            self.decoder.set_version(ProtocolVersion::Resp3);
            let reply = self.execute_async(&hello_command(), timeout, cancel).await?;
            self.apply_hello(reply)?;
        }
        if let Some(name) = &handshake.client_name {
            let reply = self
                .execute_async(&setname_command(name), timeout, cancel)
                .await?;
            expect_ok("CLIENT SETNAME", reply)?;
        }
        if let Some(request) = &handshake.tracking {
            self.enable_tracking_async(request, timeout, cancel).await?;
        }
        Ok(())
    }

    /// Async mirror of [`Connection::sync_tracking`].
    pub(crate) async fn sync_tracking_async(
        &mut self,
        request: Option<&TrackingRequest>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> RkvResult<()> {
        if self.handle.is_tracking() {
            let reply = self
                .execute_async(&disable_command(), timeout, cancel)
                .await?;
            expect_ok("CLIENT TRACKING", reply)?;
            self.handle.clear_tracking();
        }
        match request {
            Some(request) => self.enable_tracking_async(request, timeout, cancel).await,
            None => Ok(()),
        }
    }

    async fn enable_tracking_async(
        &mut self,
        request: &TrackingRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> RkvResult<()> {
        let reply = self
            .execute_async(&request.enable_command(), timeout, cancel)
            .await?;
        expect_ok("CLIENT TRACKING", reply)?;
        self.handle.set_tracking(request);
        Ok(())
    }

    /// Routes pushes that already arrived on an idle connection.
    ///
    /// Polls the stream once per chunk and never suspends, so it can run
    /// while the pool lock is held.
    pub fn poll_pushes_now(&mut self) -> RkvResult<()> {
        self.begin()?;
        let result = self.read_ready_now().and_then(|()| self.route_unsolicited());
        self.settle(result)
    }

    fn read_ready_now(&mut self) -> RkvResult<()> {
        let waker = Waker::from(Arc::new(NoopWake));
        let mut cx = Context::from_waker(&waker);
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let mut buf = ReadBuf::new(&mut chunk);
            match Pin::new(&mut self.stream).poll_read(&mut cx, &mut buf) {
                Poll::Pending => return Ok(()),
                Poll::Ready(Err(err)) => return Err(err.into()),
                Poll::Ready(Ok(())) if buf.filled().is_empty() => return Err(closed_by_peer()),
                Poll::Ready(Ok(())) => self.read_buf.extend_from_slice(buf.filled()),
            }
        }
    }

    async fn exchange_async(
        &mut self,
        commands: &[Command],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> RkvResult<Vec<Reply>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RkvError::Cancelled),
            outcome = tokio::time::timeout(timeout, self.round_trip_async(commands)) => {
                outcome.unwrap_or(Err(RkvError::Timeout))
            }
        }
    }

    async fn round_trip_async(&mut self, commands: &[Command]) -> RkvResult<Vec<Reply>> {
        self.encode(commands);
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        let mut replies = Vec::with_capacity(commands.len());
        while !self.drain_frames(&mut replies, commands.len())? {
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(closed_by_peer());
            }
        }
        Ok(replies)
    }
}
