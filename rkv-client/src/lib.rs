//! # rkv-client
//!
//! Purpose: Execute RESP2/RESP3 commands against a master/replica group over
//! pooled connections, in blocking or async style, and keep server-assisted
//! client-side caching consistent across every master connection.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse connections; one command in flight per
//!    connection, concurrency comes from more connections.
//! 2. **Facade Pattern**: [`Dispatcher`] and [`AsyncDispatcher`] hide pooling
//!    and framing from command wrappers.
//! 3. **Fail Loudly, Never Retry**: failures keep their kind; a broken
//!    connection is discarded instead of reused.
//! 4. **Protocol Clarity**: framing and conversion live in `rkv-common`.

pub mod cache;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod metrics;
pub mod pool;
pub mod tracking;

pub use cache::{CacheStats, Invalidation, LocalCache};
pub use config::{ClientConfig, ClientConfigBuilder};
pub use connection::{
    BlockingStream, Connection, ConnectionHandle, ConnectionId, Handshake, PushHandler, Role,
    TrackingSlot,
};
pub use dispatcher::{AsyncDispatcher, Dispatcher};
pub use metrics::{LatencySnapshot, Metrics, MetricsSnapshot};
pub use pool::{
    AsyncConnectionPool, AsyncConnector, ConnectionPool, Connector, PooledConnection, RoleStats,
    TcpConnector,
};
pub use tracking::{
    AsyncTrackingCoordinator, RedirectTarget, TrackingCoordinator, TrackingMode, TrackingOptions,
    TrackingRequest, TrackingState,
};

pub use rkv_common::{Command, ErrorKind, Number, ProtocolVersion, Reply, ResultType, RkvError, RkvResult, Value};
