//! # Tracking Coordinator
//!
//! Purpose: Turn server-assisted client-side caching on or off for every
//! master connection as one group.
//!
//! ## Design Principles
//! 1. **Group Invariant**: after a call returns, either every live master
//!    tracks or none does. A failed enable turns every tracking master off
//!    again; one that cannot be reached is discarded.
//! 2. **Sequential Steps**: masters are visited one at a time in id order;
//!    waiting for a leased master is bounded by the checkout timeout.
//! 3. **Exclusive Writes**: each connection's tracking flags change only while
//!    the coordinator holds it checked out.
//! 4. **Broadcast Is Idempotent**: enabling broadcast when any master already
//!    tracks succeeds without sending anything. A normal-mode request that
//!    differs from the running one is refused.
//!
//! ## State Machine
//!
//! ```text
//!            enable ok                      disable
//!   Off ─────────────────▶ On(mode, redirect) ─────▶ Off
//!    ▲  enable failed + rollback                      │
//!    └────────────────────────────────────────────────┘ (partial failures reported)
//! ```
//!
//! `Enabling` and `Disabling` exist only inside a call and are never returned.

use std::fmt;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rkv_common::{Command, Reply, RkvError, RkvResult};

use crate::connection::{ConnectionHandle, Role, TrackingSlot};
use crate::pool::{AsyncConnectionPool, AsyncConnector, ConnectionPool, Connector};

/// How the server decides which keys to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackingMode {
    /// Keys read by this connection.
    Normal,
    /// Every key matching the registered prefixes.
    Broadcast,
}

/// Server-side client id that should receive invalidation messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RedirectTarget(pub i64);

impl fmt::Display for RedirectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Extra `CLIENT TRACKING` switches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackingOptions {
    /// Broadcast prefixes; an empty list means every key.
    pub prefixes: Vec<String>,
    pub opt_in: bool,
    pub opt_out: bool,
    /// Skip invalidations caused by this client's own writes.
    pub no_loop: bool,
}

/// A complete enable request, remembered by the pool while the group is on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingRequest {
    pub mode: TrackingMode,
    pub redirect: Option<RedirectTarget>,
    pub options: TrackingOptions,
}

impl TrackingRequest {
    pub fn new(mode: TrackingMode, redirect: Option<RedirectTarget>, options: TrackingOptions) -> Self {
        TrackingRequest {
            mode,
            redirect,
            options,
        }
    }

    /// `CLIENT TRACKING ON [REDIRECT id] [BCAST] [PREFIX p]... [OPTIN] [OPTOUT] [NOLOOP]`
    pub fn enable_command(&self) -> Command {
        let mut cmd = Command::new("CLIENT TRACKING").arg("ON");
        if let Some(target) = self.redirect {
            cmd = cmd.arg("REDIRECT").arg(target.0);
        }
        if self.mode == TrackingMode::Broadcast {
            cmd = cmd.arg("BCAST");
            for prefix in &self.options.prefixes {
                cmd = cmd.arg("PREFIX").arg(prefix);
            }
        }
        if self.options.opt_in {
            cmd = cmd.arg("OPTIN");
        }
        if self.options.opt_out {
            cmd = cmd.arg("OPTOUT");
        }
        if self.options.no_loop {
            cmd = cmd.arg("NOLOOP");
        }
        cmd
    }

    fn validate(&self) -> RkvResult<()> {
        if self.options.opt_in && self.options.opt_out {
            return Err(RkvError::Config("OPTIN and OPTOUT are mutually exclusive".into()));
        }
        if self.mode == TrackingMode::Broadcast && (self.options.opt_in || self.options.opt_out) {
            return Err(RkvError::Config("OPTIN/OPTOUT are not allowed with BCAST".into()));
        }
        if self.mode == TrackingMode::Normal && !self.options.prefixes.is_empty() {
            return Err(RkvError::Config("PREFIX requires broadcast mode".into()));
        }
        Ok(())
    }
}

pub fn disable_command() -> Command {
    Command::new("CLIENT TRACKING").arg("OFF")
}

/// Group tracking state as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingState {
    Off,
    On {
        mode: TrackingMode,
        redirect: Option<RedirectTarget>,
    },
}

/// Derives the group state from live master handles.
pub fn derive_state(masters: &[ConnectionHandle]) -> TrackingState {
    masters
        .iter()
        .map(ConnectionHandle::tracking)
        .find(|slot| slot.enabled)
        .map(|slot| TrackingState::On {
            mode: slot.mode.unwrap_or(TrackingMode::Normal),
            redirect: slot.redirect,
        })
        .unwrap_or(TrackingState::Off)
}

enum Plan {
    /// Broadcast group already on; nothing to send.
    AlreadyOn,
    /// Install the request and enable every master that does not track yet.
    Enable,
}

/// Decides what an enable call does, given the live masters and the request
/// the group is already running with.
///
/// A normal-mode request that differs from the running one is refused: the
/// group would otherwise end up with two redirect targets.
fn plan_enable(
    masters: &[ConnectionHandle],
    active: Option<&TrackingRequest>,
    request: &TrackingRequest,
) -> RkvResult<Plan> {
    let tracking: Vec<TrackingSlot> = masters
        .iter()
        .map(ConnectionHandle::tracking)
        .filter(|slot| slot.enabled)
        .collect();
    if tracking.is_empty() {
        return Ok(Plan::Enable);
    }
    if request.mode == TrackingMode::Broadcast {
        return Ok(Plan::AlreadyOn);
    }
    let conflicting = active.is_some_and(|active| active != request)
        || tracking
            .iter()
            .any(|slot| slot.mode != Some(request.mode) || slot.redirect != request.redirect);
    if conflicting {
        return Err(RkvError::Config(
            "tracking is already on with a different request; disable it first".into(),
        ));
    }
    Ok(Plan::Enable)
}

fn check_ok(reply: Reply) -> RkvResult<()> {
    match reply {
        Reply::SimpleString(text) if text.eq_ignore_ascii_case("OK") => Ok(()),
        Reply::Error(message) => Err(RkvError::Server(message)),
        other => Err(RkvError::Protocol(format!(
            "CLIENT TRACKING expected OK, got {}",
            other.kind_name()
        ))),
    }
}

/// Logs the outcome of turning one master off during rollback. A master that
/// could not be reached or refused is discarded, so it leaves the group.
fn settle_rollback(handle: &ConnectionHandle, outcome: RkvResult<()>) {
    match outcome {
        Ok(()) => handle.clear_tracking(),
        Err(err) => {
            warn!(id = %handle.id(), error = %err, "tracking rollback failed, discarding connection");
            handle.mark_broken();
            handle.clear_tracking();
        }
    }
}

// =============================================================================
// Blocking coordinator
// =============================================================================

/// Blocking tracking coordinator over a [`ConnectionPool`].
pub struct TrackingCoordinator<C: Connector> {
    pool: ConnectionPool<C>,
    // Serializes enable/disable so transient states never overlap.
    gate: Mutex<()>,
}

impl<C: Connector> TrackingCoordinator<C> {
    pub fn new(pool: ConnectionPool<C>) -> Self {
        TrackingCoordinator {
            pool,
            gate: Mutex::new(()),
        }
    }

    pub fn state(&self) -> TrackingState {
        derive_state(&self.pool.all_master_connections())
    }

    /// Enables tracking on every master, or on none.
    ///
    /// The request is installed in the pool before the first step, so a
    /// master created while the call runs joins during its handshake. A
    /// failed step clears it again and turns off every master that tracks.
    pub fn enable(
        &self,
        redirect: Option<RedirectTarget>,
        mode: TrackingMode,
        options: TrackingOptions,
    ) -> RkvResult<TrackingState> {
        let request = TrackingRequest::new(mode, redirect, options);
        request.validate()?;
        let _gate = self.gate.lock();

        if self.pool.all_master_connections().is_empty() {
            // Make sure there is at least one master to enable.
            drop(self.pool.checkout(Role::Master)?);
        }

        let active = self.pool.active_tracking();
        match plan_enable(&self.pool.all_master_connections(), active.as_ref(), &request)? {
            Plan::AlreadyOn => return Ok(self.state()),
            Plan::Enable => {}
        }
        self.pool.set_active_tracking(Some(request.clone()));

        let command = request.enable_command();
        let mut enabled = 0usize;
        for handle in self.pool.all_master_connections() {
            if handle.is_tracking() {
                continue;
            }
            match self.enable_one(&handle, &request, &command) {
                Ok(()) => enabled += 1,
                Err(err) => {
                    warn!(id = %handle.id(), error = %err, rollback = enabled, "tracking enable failed");
                    self.rollback();
                    return Err(err);
                }
            }
        }
        Ok(self.state())
    }

    fn enable_one(&self, handle: &ConnectionHandle, request: &TrackingRequest, command: &Command) -> RkvResult<()> {
        let mut conn = match self.pool.checkout_connection(handle.id())? {
            Some(conn) => conn,
            None => return Ok(()),
        };
        conn.execute(command, self.pool.command_timeout())
            .and_then(check_ok)?;
        handle.set_tracking(request);
        info!(id = %handle.id(), mode = ?request.mode, "tracking enabled");
        Ok(())
    }

    /// Disables tracking on every master that has it on.
    ///
    /// Keeps going past failures and returns the first one.
    pub fn disable(&self) -> RkvResult<TrackingState> {
        let _gate = self.gate.lock();
        self.pool.set_active_tracking(None);

        let timeout = self.pool.command_timeout();
        let mut first_error = None;
        for handle in self.pool.all_master_connections() {
            if !handle.is_tracking() {
                continue;
            }
            let outcome = match self.pool.checkout_connection(handle.id()) {
                Ok(Some(mut conn)) => conn.execute(&disable_command(), timeout).and_then(check_ok),
                Ok(None) => continue,
                Err(err) => Err(err),
            };
            match outcome {
                Ok(()) => {
                    handle.clear_tracking();
                    info!(id = %handle.id(), "tracking disabled");
                }
                Err(err) => {
                    warn!(id = %handle.id(), error = %err, "tracking disable failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(self.state()),
        }
    }

    /// Clears the group request, then turns off every master that tracks,
    /// including ones that joined during their handshake.
    fn rollback(&self) {
        self.pool.set_active_tracking(None);
        let timeout = self.pool.command_timeout();
        for handle in self.pool.all_master_connections() {
            if !handle.is_tracking() {
                continue;
            }
            let outcome = match self.pool.checkout_connection(handle.id()) {
                Ok(Some(mut conn)) => conn.execute(&disable_command(), timeout).and_then(check_ok),
                Ok(None) => continue,
                Err(err) => Err(err),
            };
            settle_rollback(&handle, outcome);
        }
    }
}

// =============================================================================
// Async coordinator
// =============================================================================

/// Async tracking coordinator over an [`AsyncConnectionPool`].
pub struct AsyncTrackingCoordinator<C: AsyncConnector> {
    pool: AsyncConnectionPool<C>,
    gate: tokio::sync::Mutex<()>,
}

impl<C: AsyncConnector> AsyncTrackingCoordinator<C> {
    pub fn new(pool: AsyncConnectionPool<C>) -> Self {
        AsyncTrackingCoordinator {
            pool,
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> TrackingState {
        derive_state(&self.pool.all_master_connections())
    }

    /// Async mirror of [`TrackingCoordinator::enable`].
    ///
    /// Cancellation during the loop is treated as a failed step and rolled
    /// back; the rollback itself is not cancellable.
    pub async fn enable(
        &self,
        redirect: Option<RedirectTarget>,
        mode: TrackingMode,
        options: TrackingOptions,
        cancel: &CancellationToken,
    ) -> RkvResult<TrackingState> {
        let request = TrackingRequest::new(mode, redirect, options);
        request.validate()?;
        let _gate = self.gate.lock().await;

        if self.pool.all_master_connections().is_empty() {
            drop(self.pool.checkout(Role::Master, cancel).await?);
        }

        let active = self.pool.active_tracking();
        match plan_enable(&self.pool.all_master_connections(), active.as_ref(), &request)? {
            Plan::AlreadyOn => return Ok(self.state()),
            Plan::Enable => {}
        }
        self.pool.set_active_tracking(Some(request.clone()));

        let command = request.enable_command();
        let mut enabled = 0usize;
        for handle in self.pool.all_master_connections() {
            if handle.is_tracking() {
                continue;
            }
            match self.enable_one(&handle, &request, &command, cancel).await {
                Ok(()) => enabled += 1,
                Err(err) => {
                    warn!(id = %handle.id(), error = %err, rollback = enabled, "tracking enable failed");
                    self.rollback().await;
                    return Err(err);
                }
            }
        }
        Ok(self.state())
    }

    async fn enable_one(
        &self,
        handle: &ConnectionHandle,
        request: &TrackingRequest,
        command: &Command,
        cancel: &CancellationToken,
    ) -> RkvResult<()> {
        let mut conn = match self.pool.checkout_connection(handle.id(), cancel).await? {
            Some(conn) => conn,
            None => return Ok(()),
        };
        conn.execute_async(command, self.pool.command_timeout(), cancel)
            .await
            .and_then(check_ok)?;
        handle.set_tracking(request);
        info!(id = %handle.id(), mode = ?request.mode, "tracking enabled");
        Ok(())
    }

    pub async fn disable(&self, cancel: &CancellationToken) -> RkvResult<TrackingState> {
        let _gate = self.gate.lock().await;
        self.pool.set_active_tracking(None);

        let timeout = self.pool.command_timeout();
        let mut first_error = None;
        for handle in self.pool.all_master_connections() {
            if !handle.is_tracking() {
                continue;
            }
            let outcome = match self.pool.checkout_connection(handle.id(), cancel).await {
                Ok(Some(mut conn)) => conn
                    .execute_async(&disable_command(), timeout, cancel)
                    .await
                    .and_then(check_ok),
                Ok(None) => continue,
                Err(err) => Err(err),
            };
            match outcome {
                Ok(()) => {
                    handle.clear_tracking();
                    info!(id = %handle.id(), "tracking disabled");
                }
                Err(err) => {
                    warn!(id = %handle.id(), error = %err, "tracking disable failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(self.state()),
        }
    }

    async fn rollback(&self) {
        self.pool.set_active_tracking(None);
        let timeout = self.pool.command_timeout();
        let never = CancellationToken::new();
        for handle in self.pool.all_master_connections() {
            if !handle.is_tracking() {
                continue;
            }
            let outcome = match self.pool.checkout_connection(handle.id(), &never).await {
                Ok(Some(mut conn)) => conn
                    .execute_async(&disable_command(), timeout, &never)
                    .await
                    .and_then(check_ok),
                Ok(None) => continue,
                Err(err) => Err(err),
            };
            settle_rollback(&handle, outcome);
        }
    }
}
