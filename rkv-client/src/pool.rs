//! # Connection Pool
//!
//! Purpose: Hand out exclusive, reusable connections per server role, creating
//! them lazily (with handshake) and bounding how many exist.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections per
//!    role; `max_total` caps idle plus checked-out connections.
//! 2. **Minimal Locking**: Hold the mutex only while moving idle connections;
//!    connects and handshakes run outside it on a reserved slot.
//! 3. **RAII Checkin**: dropping a [`PooledConnection`] returns it, or
//!    discards it when it is broken.
//! 4. **Deterministic Policy**: idle connections are reused FIFO (oldest idle
//!    first) and new connections rotate round-robin over the role's endpoints.
//! 5. **No Missed Group Changes**: a new master registers only if the group
//!    tracking request is still the one its handshake applied; otherwise it
//!    re-syncs first. Lock order is tracking, then state.
//!
//! ## Structure Overview
//!
//! ```text
//! ConnectionPool<C: Connector>        AsyncConnectionPool<C: AsyncConnector>
//!        └──────────── Arc<PoolCore<Stream>> ────────────┘
//!                        ├── state: Mutex<PoolState>
//!                        │     ├── masters / replicas: RoleState { idle, total, cursor }
//!                        │     └── registry: id -> ConnectionHandle
//!                        ├── available: Condvar   (blocking waiters)
//!                        ├── notify: Notify       (async waiters)
//!                        ├── tracking: active group request + generation
//!                        └── push_handler
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rkv_common::{ProtocolVersion, RkvError, RkvResult};

use crate::config::ClientConfig;
use crate::connection::{
    BlockingStream, Connection, ConnectionHandle, ConnectionId, Handshake, PushHandler, Role,
};
use crate::tracking::TrackingRequest;

/// Opens blocking streams to an endpoint.
pub trait Connector: Send + Sync + 'static {
    type Stream: BlockingStream;

    fn connect(&self, endpoint: &str, timeout: Duration) -> RkvResult<Self::Stream>;
}

/// Opens async streams to an endpoint.
#[async_trait]
pub trait AsyncConnector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self, endpoint: &str, timeout: Duration) -> RkvResult<Self::Stream>;
}

/// Plain TCP with `TCP_NODELAY`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

fn resolve(endpoint: &str) -> RkvResult<SocketAddr> {
    endpoint
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| RkvError::Config(format!("address '{}' did not resolve", endpoint)))
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self, endpoint: &str, timeout: Duration) -> RkvResult<TcpStream> {
        let addr = resolve(endpoint)?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_write_timeout(Some(timeout))?;
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl AsyncConnector for TcpConnector {
    type Stream = tokio::net::TcpStream;

    async fn connect(&self, endpoint: &str, timeout: Duration) -> RkvResult<Self::Stream> {
        let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(endpoint))
            .await
            .map_err(|_| RkvError::Timeout)??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

struct RoleState<S> {
    endpoints: Vec<String>,
    idle: VecDeque<Connection<S>>,
    total: usize,
    cursor: usize,
}

impl<S> RoleState<S> {
    fn new(endpoints: Vec<String>) -> Self {
        RoleState {
            endpoints,
            idle: VecDeque::new(),
            total: 0,
            cursor: 0,
        }
    }

    fn next_endpoint(&mut self) -> Option<String> {
        if self.endpoints.is_empty() {
            return None;
        }
        let endpoint = self.endpoints[self.cursor % self.endpoints.len()].clone();
        self.cursor = self.cursor.wrapping_add(1);
        Some(endpoint)
    }
}

struct PoolState<S> {
    masters: RoleState<S>,
    replicas: RoleState<S>,
    registry: HashMap<ConnectionId, ConnectionHandle>,
}

impl<S> PoolState<S> {
    fn role_mut(&mut self, role: Role) -> &mut RoleState<S> {
        match role {
            Role::Master => &mut self.masters,
            Role::Replica => &mut self.replicas,
        }
    }
}

enum Take<S> {
    Idle(Connection<S>),
    /// A slot was reserved; the caller must connect to this endpoint.
    Reserved(String),
    Full,
}

/// Pool statistics for one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoleStats {
    pub idle: usize,
    pub total: usize,
}

#[derive(Debug, Clone)]
struct PoolSettings {
    max_idle: usize,
    max_total: usize,
    connect_timeout: Duration,
    command_timeout: Duration,
    checkout_timeout: Duration,
    protocol: ProtocolVersion,
    client_name: Option<String>,
}

/// Group tracking request; the generation moves on every change.
#[derive(Debug, Default)]
struct TrackingGroup {
    request: Option<TrackingRequest>,
    generation: u64,
}

pub(crate) struct PoolCore<S> {
    settings: PoolSettings,
    state: Mutex<PoolState<S>>,
    available: Condvar,
    notify: Notify,
    tracking: Mutex<TrackingGroup>,
    push_handler: RwLock<Option<PushHandler>>,
}

impl<S> PoolCore<S> {
    fn new(config: &ClientConfig) -> Self {
        PoolCore {
            settings: PoolSettings {
                max_idle: config.max_idle,
                max_total: config.max_total,
                connect_timeout: config.connect_timeout,
                command_timeout: config.command_timeout,
                checkout_timeout: config.checkout_timeout,
                protocol: config.protocol,
                client_name: config.client_name.clone(),
            },
            state: Mutex::new(PoolState {
                masters: RoleState::new(config.masters.clone()),
                replicas: RoleState::new(config.replicas.clone()),
                registry: HashMap::new(),
            }),
            available: Condvar::new(),
            notify: Notify::new(),
            tracking: Mutex::new(TrackingGroup::default()),
            push_handler: RwLock::new(None),
        }
    }

    /// Pops an idle connection or reserves a slot for a new one.
    fn try_take(&self, state: &mut PoolState<S>, role: Role) -> RkvResult<Take<S>> {
        let max_total = self.settings.max_total;
        let PoolState {
            masters,
            replicas,
            registry,
        } = state;
        let role_state = match role {
            Role::Master => masters,
            Role::Replica => replicas,
        };

        while let Some(conn) = role_state.idle.pop_front() {
            if conn.is_broken() {
                role_state.total = role_state.total.saturating_sub(1);
                registry.remove(&conn.id());
                continue;
            }
            return Ok(Take::Idle(conn));
        }

        if role_state.total >= max_total {
            return Ok(Take::Full);
        }
        let endpoint = role_state.next_endpoint().ok_or_else(|| {
            RkvError::PoolExhausted(format!("no {:?} endpoints configured", role))
        })?;
        role_state.total += 1;
        Ok(Take::Reserved(endpoint))
    }

    /// Takes the named connection out of the idle set if it is there.
    fn try_take_by_id(&self, state: &mut PoolState<S>, id: ConnectionId) -> Option<Connection<S>> {
        for role in [Role::Master, Role::Replica] {
            let idle = &mut state.role_mut(role).idle;
            if let Some(pos) = idle.iter().position(|conn| conn.id() == id) {
                return idle.remove(pos);
            }
        }
        None
    }

    fn release_slot(&self, role: Role) {
        {
            let mut state = self.state.lock();
            let role_state = state.role_mut(role);
            role_state.total = role_state.total.saturating_sub(1);
        }
        self.wake();
    }

    fn register(&self, conn: &Connection<S>) {
        self.state
            .lock()
            .registry
            .insert(conn.id(), conn.handle().clone());
    }

    fn checkin(&self, conn: Connection<S>) {
        let role = conn.handle().role();
        let id = conn.id();
        {
            let mut state = self.state.lock();
            let max_idle = self.settings.max_idle;
            let role_state = state.role_mut(role);
            let keep = !conn.is_broken() && role_state.idle.len() < max_idle;
            if keep {
                role_state.idle.push_back(conn);
            } else {
                role_state.total = role_state.total.saturating_sub(1);
                state.registry.remove(&id);
                if conn.is_broken() {
                    warn!(id = %id, role = ?role, "discarding broken connection");
                } else {
                    debug!(id = %id, role = ?role, "closing surplus idle connection");
                }
                drop(conn);
            }
        }
        self.wake();
    }

    fn wake(&self) {
        self.available.notify_all();
        self.notify.notify_waiters();
    }

    /// Handshake for a new connection, with the tracking generation it saw.
    fn handshake_for(&self, role: Role) -> (Handshake, u64) {
        let group = self.tracking.lock();
        let handshake = Handshake {
            protocol: self.settings.protocol,
            client_name: self.settings.client_name.clone(),
            tracking: match role {
                Role::Master => group.request.clone(),
                Role::Replica => None,
            },
        };
        (handshake, group.generation)
    }

    fn active_tracking(&self) -> Option<TrackingRequest> {
        self.tracking.lock().request.clone()
    }

    fn set_active_tracking(&self, request: Option<TrackingRequest>) {
        let mut group = self.tracking.lock();
        if group.request != request {
            group.request = request;
            group.generation += 1;
        }
    }

    /// Runs `poll` on every idle tracking master; connections it breaks are
    /// discarded.
    fn poll_idle_masters(&self, mut poll: impl FnMut(&mut Connection<S>) -> RkvResult<()>) {
        let discarded = {
            let mut state = self.state.lock();
            let PoolState {
                masters, registry, ..
            } = &mut *state;
            let before = masters.idle.len();
            masters.idle.retain_mut(|conn| {
                if !conn.handle().is_tracking() {
                    return true;
                }
                match poll(conn) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(id = %conn.id(), error = %err, "discarding idle connection");
                        registry.remove(&conn.id());
                        false
                    }
                }
            });
            let discarded = before - masters.idle.len();
            masters.total = masters.total.saturating_sub(discarded);
            discarded
        };
        if discarded > 0 {
            self.wake();
        }
    }

    fn push_handler(&self) -> Option<PushHandler> {
        self.push_handler.read().clone()
    }

    fn connection_handles(&self, role: Role) -> Vec<ConnectionHandle> {
        let state = self.state.lock();
        let mut handles: Vec<ConnectionHandle> = state
            .registry
            .values()
            .filter(|handle| handle.role() == role && !handle.is_broken())
            .cloned()
            .collect();
        handles.sort_by_key(|handle| handle.id());
        handles
    }

    fn stats(&self, role: Role) -> RoleStats {
        let mut state = self.state.lock();
        let role_state = state.role_mut(role);
        RoleStats {
            idle: role_state.idle.len(),
            total: role_state.total,
        }
    }

    fn contains(&self, state: &PoolState<S>, id: ConnectionId) -> bool {
        state.registry.contains_key(&id)
    }
}

/// A reserved `total` slot; released on drop unless the new connection was
/// registered.
struct Reservation<'a, S> {
    core: &'a PoolCore<S>,
    role: Role,
    armed: bool,
}

impl<'a, S> Reservation<'a, S> {
    fn new(core: &'a PoolCore<S>, role: Role) -> Self {
        Reservation {
            core,
            role,
            armed: true,
        }
    }

    /// Registers the connection if the group tracking request is still the
    /// one its handshake saw. Otherwise returns the current request and
    /// generation so the caller can re-sync and try again.
    fn try_commit(
        &mut self,
        conn: &Connection<S>,
        generation: u64,
    ) -> Result<(), (Option<TrackingRequest>, u64)> {
        let group = self.core.tracking.lock();
        if self.role == Role::Master && group.generation != generation {
            return Err((group.request.clone(), group.generation));
        }
        self.core.register(conn);
        self.armed = false;
        Ok(())
    }
}

impl<S> Drop for Reservation<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            self.core.release_slot(self.role);
        }
    }
}

/// Exclusive lease on a pooled connection; checks it back in on drop.
pub struct PooledConnection<S> {
    core: Arc<PoolCore<S>>,
    conn: Option<Connection<S>>,
}

impl<S> PooledConnection<S> {
    fn new(core: Arc<PoolCore<S>>, conn: Connection<S>) -> Self {
        PooledConnection {
            core,
            conn: Some(conn),
        }
    }
}

impl<S> Deref for PooledConnection<S> {
    type Target = Connection<S>;

    fn deref(&self) -> &Connection<S> {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<S> DerefMut for PooledConnection<S> {
    fn deref_mut(&mut self) -> &mut Connection<S> {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<S> fmt::Debug for PooledConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}

impl<S> Drop for PooledConnection<S> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.core.checkin(conn);
        }
    }
}

fn exhausted(role: Role, waited: Duration) -> RkvError {
    warn!(role = ?role, waited_ms = waited.as_millis() as u64, "connection pool exhausted");
    RkvError::PoolExhausted(format!(
        "no {:?} connection became available within {:?}",
        role, waited
    ))
}

fn connect_failed(role: Role, endpoint: &str, err: RkvError) -> RkvError {
    warn!(role = ?role, endpoint, error = %err, "connect failed");
    RkvError::PoolExhausted(format!("connect to {} failed: {}", endpoint, err))
}

/// A fresh connection that cannot finish its setup counts as a failed
/// connect. Cancellation keeps its own kind.
fn handshake_failed(id: ConnectionId, role: Role, endpoint: &str, err: RkvError) -> RkvError {
    warn!(id = %id, role = ?role, endpoint, error = %err, "handshake failed");
    match err {
        RkvError::Cancelled => err,
        err => RkvError::PoolExhausted(format!("handshake with {} failed: {}", endpoint, err)),
    }
}

fn checkout_timed_out(id: ConnectionId, waited: Duration) -> RkvError {
    warn!(id = %id, waited_ms = waited.as_millis() as u64, "connection stayed leased");
    RkvError::PoolExhausted(format!("{} was not checked in within {:?}", id, waited))
}

// =============================================================================
// Blocking pool
// =============================================================================

/// Blocking connection pool.
pub struct ConnectionPool<C: Connector = TcpConnector> {
    core: Arc<PoolCore<C::Stream>>,
    connector: Arc<C>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        ConnectionPool {
            core: Arc::clone(&self.core),
            connector: Arc::clone(&self.connector),
        }
    }
}

impl ConnectionPool<TcpConnector> {
    pub fn new(config: &ClientConfig) -> RkvResult<Self> {
        Self::with_connector(config, TcpConnector)
    }
}

impl<C: Connector> ConnectionPool<C> {
    pub fn with_connector(config: &ClientConfig, connector: C) -> RkvResult<Self> {
        config.validate()?;
        Ok(ConnectionPool {
            core: Arc::new(PoolCore::new(config)),
            connector: Arc::new(connector),
        })
    }

    /// Returns an exclusive connection for `role`, creating one when none is
    /// idle and waiting up to the checkout timeout when the role is full.
    pub fn checkout(&self, role: Role) -> RkvResult<PooledConnection<C::Stream>> {
        let waited = self.core.settings.checkout_timeout;
        let deadline = Instant::now() + waited;
        let mut state = self.core.state.lock();
        loop {
            match self.core.try_take(&mut state, role)? {
                Take::Idle(conn) => return Ok(PooledConnection::new(Arc::clone(&self.core), conn)),
                Take::Reserved(endpoint) => {
                    drop(state);
                    return self.open(role, &endpoint);
                }
                Take::Full => {
                    if self.core.available.wait_until(&mut state, deadline).timed_out() {
                        return match self.core.try_take(&mut state, role)? {
                            Take::Idle(conn) => {
                                Ok(PooledConnection::new(Arc::clone(&self.core), conn))
                            }
                            Take::Reserved(endpoint) => {
                                drop(state);
                                self.open(role, &endpoint)
                            }
                            Take::Full => Err(exhausted(role, waited)),
                        };
                    }
                }
            }
        }
    }

    /// Waits up to the checkout timeout for the named connection to be idle
    /// and leases it.
    ///
    /// Returns `Ok(None)` once the connection has been discarded and
    /// `PoolExhausted` when it stays leased past the timeout.
    pub fn checkout_connection(&self, id: ConnectionId) -> RkvResult<Option<PooledConnection<C::Stream>>> {
        let waited = self.core.settings.checkout_timeout;
        let deadline = Instant::now() + waited;
        let mut state = self.core.state.lock();
        loop {
            if !self.core.contains(&state, id) {
                return Ok(None);
            }
            if let Some(conn) = self.core.try_take_by_id(&mut state, id) {
                return Ok(Some(PooledConnection::new(Arc::clone(&self.core), conn)));
            }
            if self.core.available.wait_until(&mut state, deadline).timed_out() {
                if let Some(conn) = self.core.try_take_by_id(&mut state, id) {
                    return Ok(Some(PooledConnection::new(Arc::clone(&self.core), conn)));
                }
                return Err(checkout_timed_out(id, waited));
            }
        }
    }

    /// Snapshot of live master connections, ordered by id.
    pub fn all_master_connections(&self) -> Vec<ConnectionHandle> {
        self.core.connection_handles(Role::Master)
    }

    pub fn stats(&self, role: Role) -> RoleStats {
        self.core.stats(role)
    }

    /// Routes invalidation pushes already waiting on idle tracking masters,
    /// without blocking.
    pub fn poll_idle_pushes(&self) {
        self.core.poll_idle_masters(|conn| conn.poll_pushes());
    }

    /// Installs the handler that receives pushes from every connection,
    /// including ones already idle.
    pub fn set_push_handler(&self, handler: Option<PushHandler>) {
        *self.core.push_handler.write() = handler.clone();
        let mut state = self.core.state.lock();
        for role in [Role::Master, Role::Replica] {
            for conn in state.role_mut(role).idle.iter_mut() {
                conn.set_push_handler(handler.clone());
            }
        }
    }

    pub(crate) fn command_timeout(&self) -> Duration {
        self.core.settings.command_timeout
    }

    pub(crate) fn active_tracking(&self) -> Option<TrackingRequest> {
        self.core.active_tracking()
    }

    pub(crate) fn set_active_tracking(&self, request: Option<TrackingRequest>) {
        self.core.set_active_tracking(request);
    }

    fn open(&self, role: Role, endpoint: &str) -> RkvResult<PooledConnection<C::Stream>> {
        let mut reservation = Reservation::new(&self.core, role);
        let settings = &self.core.settings;
        let stream = self
            .connector
            .connect(endpoint, settings.connect_timeout)
            .map_err(|err| connect_failed(role, endpoint, err))?;

        let mut conn = Connection::new(stream, role, endpoint);
        conn.set_push_handler(self.core.push_handler());
        let (handshake, mut generation) = self.core.handshake_for(role);
        conn.handshake(&handshake, settings.command_timeout)
            .map_err(|err| handshake_failed(conn.id(), role, endpoint, err))?;
        while let Err((request, current)) = reservation.try_commit(&conn, generation) {
            debug!(id = %conn.id(), "tracking changed during handshake, re-syncing");
            conn.sync_tracking(request.as_ref(), settings.command_timeout)
                .map_err(|err| handshake_failed(conn.id(), role, endpoint, err))?;
            generation = current;
        }
        Ok(PooledConnection::new(Arc::clone(&self.core), conn))
    }
}

// =============================================================================
// Async pool
// =============================================================================

/// Async connection pool with the same policy as [`ConnectionPool`].
pub struct AsyncConnectionPool<C: AsyncConnector = TcpConnector> {
    core: Arc<PoolCore<C::Stream>>,
    connector: Arc<C>,
}

impl<C: AsyncConnector> Clone for AsyncConnectionPool<C> {
    fn clone(&self) -> Self {
        AsyncConnectionPool {
            core: Arc::clone(&self.core),
            connector: Arc::clone(&self.connector),
        }
    }
}

impl AsyncConnectionPool<TcpConnector> {
    pub fn new(config: &ClientConfig) -> RkvResult<Self> {
        Self::with_connector(config, TcpConnector)
    }
}

impl<C: AsyncConnector> AsyncConnectionPool<C> {
    pub fn with_connector(config: &ClientConfig, connector: C) -> RkvResult<Self> {
        config.validate()?;
        Ok(AsyncConnectionPool {
            core: Arc::new(PoolCore::new(config)),
            connector: Arc::new(connector),
        })
    }

    /// Async mirror of [`ConnectionPool::checkout`]; waiting never blocks a
    /// runtime thread and stops when `cancel` fires.
    pub async fn checkout(
        &self,
        role: Role,
        cancel: &CancellationToken,
    ) -> RkvResult<PooledConnection<C::Stream>> {
        let waited = self.core.settings.checkout_timeout;
        let deadline = tokio::time::Instant::now() + waited;
        loop {
            let notified = self.core.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let take = {
                let mut state = self.core.state.lock();
                self.core.try_take(&mut state, role)?
            };
            match take {
                Take::Idle(conn) => return Ok(PooledConnection::new(Arc::clone(&self.core), conn)),
                Take::Reserved(endpoint) => return self.open(role, &endpoint, cancel).await,
                Take::Full => {}
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RkvError::Cancelled),
                woke = tokio::time::timeout_at(deadline, notified) => {
                    if woke.is_err() {
                        return Err(exhausted(role, waited));
                    }
                }
            }
        }
    }

    /// Async mirror of [`ConnectionPool::checkout_connection`]; also stops
    /// when `cancel` fires.
    pub async fn checkout_connection(
        &self,
        id: ConnectionId,
        cancel: &CancellationToken,
    ) -> RkvResult<Option<PooledConnection<C::Stream>>> {
        let waited = self.core.settings.checkout_timeout;
        let deadline = tokio::time::Instant::now() + waited;
        loop {
            let notified = self.core.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.core.state.lock();
                if !self.core.contains(&state, id) {
                    return Ok(None);
                }
                if let Some(conn) = self.core.try_take_by_id(&mut state, id) {
                    return Ok(Some(PooledConnection::new(Arc::clone(&self.core), conn)));
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RkvError::Cancelled),
                woke = tokio::time::timeout_at(deadline, notified) => {
                    if woke.is_err() {
                        return Err(checkout_timed_out(id, waited));
                    }
                }
            }
        }
    }

    pub fn all_master_connections(&self) -> Vec<ConnectionHandle> {
        self.core.connection_handles(Role::Master)
    }

    pub fn stats(&self, role: Role) -> RoleStats {
        self.core.stats(role)
    }

    pub fn set_push_handler(&self, handler: Option<PushHandler>) {
        *self.core.push_handler.write() = handler.clone();
        let mut state = self.core.state.lock();
        for role in [Role::Master, Role::Replica] {
            for conn in state.role_mut(role).idle.iter_mut() {
                conn.set_push_handler(handler.clone());
            }
        }
    }

    /// Async-pool mirror of [`ConnectionPool::poll_idle_pushes`]; it never
    /// suspends.
    pub fn poll_idle_pushes(&self) {
        self.core.poll_idle_masters(|conn| conn.poll_pushes_now());
    }

    pub(crate) fn command_timeout(&self) -> Duration {
        self.core.settings.command_timeout
    }

    pub(crate) fn active_tracking(&self) -> Option<TrackingRequest> {
        self.core.active_tracking()
    }

    pub(crate) fn set_active_tracking(&self, request: Option<TrackingRequest>) {
        self.core.set_active_tracking(request);
    }

    async fn open(
        &self,
        role: Role,
        endpoint: &str,
        cancel: &CancellationToken,
    ) -> RkvResult<PooledConnection<C::Stream>> {
        // Dropping this future mid-connect releases the slot too.
        let mut reservation = Reservation::new(&self.core, role);
        let settings = &self.core.settings;
        let stream = self
            .connector
            .connect(endpoint, settings.connect_timeout)
            .await
            .map_err(|err| connect_failed(role, endpoint, err))?;

        let mut conn = Connection::new(stream, role, endpoint);
        conn.set_push_handler(self.core.push_handler());
        let (handshake, mut generation) = self.core.handshake_for(role);
        conn.handshake_async(&handshake, settings.command_timeout, cancel)
            .await
            .map_err(|err| handshake_failed(conn.id(), role, endpoint, err))?;
        while let Err((request, current)) = reservation.try_commit(&conn, generation) {
            debug!(id = %conn.id(), "tracking changed during handshake, re-syncing");
            conn.sync_tracking_async(request.as_ref(), settings.command_timeout, cancel)
                .await
                .map_err(|err| handshake_failed(conn.id(), role, endpoint, err))?;
            generation = current;
        }
        Ok(PooledConnection::new(Arc::clone(&self.core), conn))
    }
}
