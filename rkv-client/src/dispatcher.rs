//! # Dispatcher
//!
//! Purpose: The call surface used by command wrappers. One call checks out a
//! connection, runs the command, converts the reply, and checks the
//! connection back in.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: wrappers see commands and typed values, never
//!    connections or frames.
//! 2. **No Hidden Retries**: every failure is returned to the caller with its
//!    kind intact; retry policy lives above this layer.
//! 3. **Guards Do Cleanup**: the pooled connection guard decides between
//!    idle set and discard on drop, so early returns cannot leak.
//! 4. **Two Call Styles**: [`Dispatcher`] blocks the calling thread;
//!    [`AsyncDispatcher`] only suspends the task and honours cancellation.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use rkv_common::{convert, Command, FromValue, Reply, ResultType, RkvError, RkvResult, Route, Value};

use crate::cache::LocalCache;
use crate::config::ClientConfig;
use crate::connection::{ConnectionHandle, Role};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::pool::{AsyncConnectionPool, AsyncConnector, ConnectionPool, Connector, TcpConnector};
use crate::tracking::{AsyncTrackingCoordinator, TrackingCoordinator, TrackingState};

fn server_error(reply: Reply) -> RkvResult<Reply> {
    match reply {
        Reply::Error(message) => Err(RkvError::Server(message)),
        reply => Ok(reply),
    }
}

fn pipeline_role(commands: &[Command], replica_reads: bool) -> Role {
    let all_replica = commands.iter().all(|cmd| cmd.route() == Route::Replica);
    if replica_reads && all_replica {
        Role::Replica
    } else {
        Role::Master
    }
}

fn route_role(command: &Command, replica_reads: bool) -> Role {
    pipeline_role(std::slice::from_ref(command), replica_reads)
}

fn start(metrics: &Metrics) -> Instant {
    metrics.record_request_start();
    Instant::now()
}

fn finish<T>(metrics: &Metrics, started: Instant, command: &str, result: RkvResult<T>) -> RkvResult<T> {
    metrics.record_request_end(started.elapsed());
    if let Err(err) = &result {
        metrics.record_error(err.kind());
        debug!(command, error = %err, "call failed");
    }
    result
}

/// Counts a discard when the exchange left the connection broken; the
/// guard drops it at checkin.
fn note_discard(metrics: &Metrics, handle: &ConnectionHandle) {
    if handle.is_broken() {
        metrics.record_discard();
    }
}

fn string_result(value: Value) -> RkvResult<Option<String>> {
    Option::<String>::from_value(value)
}

fn bytes_result(value: Value) -> RkvResult<Option<Bytes>> {
    Option::<Bytes>::from_value(value)
}

// =============================================================================
// Blocking dispatcher
// =============================================================================

/// Blocking dispatcher over a [`ConnectionPool`].
pub struct Dispatcher<C: Connector = TcpConnector> {
    pool: ConnectionPool<C>,
    tracking: Arc<TrackingCoordinator<C>>,
    metrics: Arc<Metrics>,
    cache: Option<Arc<LocalCache>>,
    replica_reads: bool,
}

impl<C: Connector> Clone for Dispatcher<C> {
    fn clone(&self) -> Self {
        Dispatcher {
            pool: self.pool.clone(),
            tracking: Arc::clone(&self.tracking),
            metrics: Arc::clone(&self.metrics),
            cache: self.cache.clone(),
            replica_reads: self.replica_reads,
        }
    }
}

impl Dispatcher<TcpConnector> {
    /// Creates a dispatcher over TCP. Connections open lazily on first use.
    pub fn connect(config: &ClientConfig) -> RkvResult<Self> {
        Self::with_connector(config, TcpConnector)
    }
}

impl<C: Connector> Dispatcher<C> {
    pub fn with_connector(config: &ClientConfig, connector: C) -> RkvResult<Self> {
        let pool = ConnectionPool::with_connector(config, connector)?;
        Ok(Dispatcher {
            tracking: Arc::new(TrackingCoordinator::new(pool.clone())),
            pool,
            metrics: Arc::new(Metrics::new()),
            cache: None,
            replica_reads: config.read_from_replicas && !config.replicas.is_empty(),
        })
    }

    /// Attaches a local cache and routes invalidation pushes from every
    /// pooled connection into it.
    pub fn with_cache(mut self, cache: Arc<LocalCache>) -> Self {
        self.pool.set_push_handler(Some(cache.push_handler()));
        self.cache = Some(cache);
        self
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    pub fn tracking(&self) -> &TrackingCoordinator<C> {
        &self.tracking
    }

    pub fn cache(&self) -> Option<&Arc<LocalCache>> {
        self.cache.as_ref()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Runs a command and returns the decoded reply. Error replies become
    /// [`RkvError::Server`] and leave the connection in the pool.
    pub fn call_reply(&self, command: &Command) -> RkvResult<Reply> {
        let started = start(&self.metrics);
        let result = self.round_trip(command).and_then(server_error);
        finish(&self.metrics, started, command.verb(), result)
    }

    /// Runs a command and converts the reply with the result type declared
    /// through [`Command::returns`]. An undeclared type fails before anything
    /// is sent.
    pub fn call(&self, command: &Command) -> RkvResult<Value> {
        command.result_type().shape()?;
        self.call_raw(command, command.result_type())
    }

    /// Runs a command and converts the reply with `result_type`.
    pub fn call_raw(&self, command: &Command, result_type: ResultType) -> RkvResult<Value> {
        let started = start(&self.metrics);
        let result = self
            .round_trip(command)
            .and_then(|reply| convert(reply, result_type));
        finish(&self.metrics, started, command.verb(), result)
    }

    pub fn call_string(&self, command: &Command) -> RkvResult<Option<String>> {
        self.call_raw(command, ResultType::STRING).and_then(string_result)
    }

    pub fn call_bytes(&self, command: &Command) -> RkvResult<Option<Bytes>> {
        self.call_raw(command, ResultType::BYTES).and_then(bytes_result)
    }

    /// Converts with `result_type`, then into `T`; use `Option<T>` when the
    /// server may answer nil.
    pub fn call_number<T: FromValue>(&self, command: &Command, result_type: ResultType) -> RkvResult<T> {
        self.call_raw(command, result_type).and_then(T::from_value)
    }

    /// Sends every command on one connection, then reads the replies in
    /// order. Error replies stay in place as [`Reply::Error`].
    pub fn call_pipeline(&self, commands: &[Command]) -> RkvResult<Vec<Reply>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let started = start(&self.metrics);
        let result = self
            .pool
            .checkout(pipeline_role(commands, self.replica_reads))
            .and_then(|mut conn| {
                let replies = conn.pipeline(commands, self.pool.command_timeout());
                note_discard(&self.metrics, conn.handle());
                replies
            });
        finish(&self.metrics, started, commands[0].verb(), result)
    }

    /// Reads `key` through the local cache while tracking is on; otherwise
    /// behaves like [`Dispatcher::call_bytes`].
    ///
    /// Invalidations already waiting on idle masters are applied before a
    /// hit is served.
    pub fn call_bytes_cached(&self, command: &Command, key: impl AsRef<[u8]>) -> RkvResult<Option<Bytes>> {
        let key = key.as_ref();
        let cache = match &self.cache {
            Some(cache) if self.tracking.state() != TrackingState::Off => cache,
            _ => return self.call_bytes(command),
        };
        self.pool.poll_idle_pushes();
        if let Some(value) = cache.get(key) {
            return Ok(Some(value));
        }
        let value = self.call_bytes(command)?;
        if let Some(value) = &value {
            cache.insert(Bytes::copy_from_slice(key), value.clone());
        }
        Ok(value)
    }

    fn round_trip(&self, command: &Command) -> RkvResult<Reply> {
        let mut conn = self.pool.checkout(route_role(command, self.replica_reads))?;
        let reply = conn.execute(command, self.pool.command_timeout());
        note_discard(&self.metrics, conn.handle());
        reply
    }
}

// =============================================================================
// Async dispatcher
// =============================================================================

/// Async dispatcher over an [`AsyncConnectionPool`].
pub struct AsyncDispatcher<C: AsyncConnector = TcpConnector> {
    pool: AsyncConnectionPool<C>,
    tracking: Arc<AsyncTrackingCoordinator<C>>,
    metrics: Arc<Metrics>,
    cache: Option<Arc<LocalCache>>,
    replica_reads: bool,
}

impl<C: AsyncConnector> Clone for AsyncDispatcher<C> {
    fn clone(&self) -> Self {
        AsyncDispatcher {
            pool: self.pool.clone(),
            tracking: Arc::clone(&self.tracking),
            metrics: Arc::clone(&self.metrics),
            cache: self.cache.clone(),
            replica_reads: self.replica_reads,
        }
    }
}

impl AsyncDispatcher<TcpConnector> {
    pub fn connect(config: &ClientConfig) -> RkvResult<Self> {
        Self::with_connector(config, TcpConnector)
    }
}

impl<C: AsyncConnector> AsyncDispatcher<C> {
    pub fn with_connector(config: &ClientConfig, connector: C) -> RkvResult<Self> {
        let pool = AsyncConnectionPool::with_connector(config, connector)?;
        Ok(AsyncDispatcher {
            tracking: Arc::new(AsyncTrackingCoordinator::new(pool.clone())),
            pool,
            metrics: Arc::new(Metrics::new()),
            cache: None,
            replica_reads: config.read_from_replicas && !config.replicas.is_empty(),
        })
    }

    pub fn with_cache(mut self, cache: Arc<LocalCache>) -> Self {
        self.pool.set_push_handler(Some(cache.push_handler()));
        self.cache = Some(cache);
        self
    }

    pub fn pool(&self) -> &AsyncConnectionPool<C> {
        &self.pool
    }

    pub fn tracking(&self) -> &AsyncTrackingCoordinator<C> {
        &self.tracking
    }

    pub fn cache(&self) -> Option<&Arc<LocalCache>> {
        self.cache.as_ref()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn call_reply_async(&self, command: &Command, cancel: &CancellationToken) -> RkvResult<Reply> {
        let started = start(&self.metrics);
        let result = self.round_trip(command, cancel).await.and_then(server_error);
        finish(&self.metrics, started, command.verb(), result)
    }

    /// Async mirror of [`Dispatcher::call`].
    pub async fn call_async(&self, command: &Command, cancel: &CancellationToken) -> RkvResult<Value> {
        command.result_type().shape()?;
        self.call_raw_async(command, command.result_type(), cancel).await
    }

    pub async fn call_raw_async(
        &self,
        command: &Command,
        result_type: ResultType,
        cancel: &CancellationToken,
    ) -> RkvResult<Value> {
        let started = start(&self.metrics);
        let result = self
            .round_trip(command, cancel)
            .await
            .and_then(|reply| convert(reply, result_type));
        finish(&self.metrics, started, command.verb(), result)
    }

    pub async fn call_string_async(
        &self,
        command: &Command,
        cancel: &CancellationToken,
    ) -> RkvResult<Option<String>> {
        self.call_raw_async(command, ResultType::STRING, cancel)
            .await
            .and_then(string_result)
    }

    pub async fn call_bytes_async(
        &self,
        command: &Command,
        cancel: &CancellationToken,
    ) -> RkvResult<Option<Bytes>> {
        self.call_raw_async(command, ResultType::BYTES, cancel)
            .await
            .and_then(bytes_result)
    }

    pub async fn call_number_async<T: FromValue>(
        &self,
        command: &Command,
        result_type: ResultType,
        cancel: &CancellationToken,
    ) -> RkvResult<T> {
        self.call_raw_async(command, result_type, cancel)
            .await
            .and_then(T::from_value)
    }

    pub async fn call_pipeline_async(
        &self,
        commands: &[Command],
        cancel: &CancellationToken,
    ) -> RkvResult<Vec<Reply>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let started = start(&self.metrics);
        let result = async {
            let mut conn = self
                .pool
                .checkout(pipeline_role(commands, self.replica_reads), cancel)
                .await?;
            let replies = conn
                .pipeline_async(commands, self.pool.command_timeout(), cancel)
                .await;
            note_discard(&self.metrics, conn.handle());
            replies
        }
        .await;
        finish(&self.metrics, started, commands[0].verb(), result)
    }

    pub async fn call_bytes_cached_async(
        &self,
        command: &Command,
        key: impl AsRef<[u8]>,
        cancel: &CancellationToken,
    ) -> RkvResult<Option<Bytes>> {
        let key = key.as_ref();
        let cache = match &self.cache {
            Some(cache) if self.tracking.state() != TrackingState::Off => Arc::clone(cache),
            _ => return self.call_bytes_async(command, cancel).await,
        };
        self.pool.poll_idle_pushes();
        if let Some(value) = cache.get(key) {
            return Ok(Some(value));
        }
        let value = self.call_bytes_async(command, cancel).await?;
        if let Some(value) = &value {
            cache.insert(Bytes::copy_from_slice(key), value.clone());
        }
        Ok(value)
    }

    async fn round_trip(&self, command: &Command, cancel: &CancellationToken) -> RkvResult<Reply> {
        let mut conn = self
            .pool
            .checkout(route_role(command, self.replica_reads), cancel)
            .await?;
        let reply = conn
            .execute_async(command, self.pool.command_timeout(), cancel)
            .await;
        note_discard(&self.metrics, conn.handle());
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replica_routing_needs_opt_in() {
        let read = Command::new("GET").arg("k").on_replica();
        let write = Command::new("SET").arg("k").arg("v");

        assert_eq!(route_role(&read, true), Role::Replica);
        assert_eq!(route_role(&read, false), Role::Master);
        assert_eq!(route_role(&write, true), Role::Master);
        assert_eq!(pipeline_role(&[read.clone(), write], true), Role::Master);
        assert_eq!(pipeline_role(&[read.clone(), read], true), Role::Replica);
    }

    #[test]
    fn error_replies_become_server_errors() {
        let err = server_error(Reply::error("WRONGTYPE bad")).unwrap_err();
        assert!(matches!(err, RkvError::Server(ref message) if message.starts_with("WRONGTYPE")));
        assert_eq!(server_error(Reply::Integer(1)).unwrap(), Reply::Integer(1));
    }

    #[test]
    fn failed_calls_are_counted() {
        let metrics = Metrics::new();
        let started = start(&metrics);
        let result: RkvResult<()> = finish(&metrics, started, "GET", Err(RkvError::Timeout));
        assert!(result.is_err());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_total, 1);
        assert_eq!(snapshot.errors_total, 1);
        assert_eq!(snapshot.timeouts_total, 1);
        assert_eq!(snapshot.inflight, 0);
        // No connection was involved, so nothing was discarded.
        assert_eq!(snapshot.discarded_total, 0);
    }
}
