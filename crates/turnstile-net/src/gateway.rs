//! The authentication gateway: registry, dispatch, and validation handling.
//!
//! A [`Gateway`] is shared between two contexts. The poll loop calls
//! [`Gateway::poll`] to drain the transport's receive queue. The callback
//! context calls [`Gateway::run_callbacks`] (or pumps the collaborators
//! directly with the gateway as [`EventSink`]). Both serialize on one
//! registry lock, and every transport or validator call happens after that
//! lock is released.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use turnstile_config::OwnerMismatchPolicy;

use crate::auth::{Action, Admission, AuthState, on_established};
use crate::events::{CallbackSource, EventSink, run_callbacks};
use crate::identity::{ConnectionHandle, Identity};
use crate::registry::ConnectionRegistry;
use crate::transport::{StatusChange, Transport, TransportError, TransportState};
use crate::validation::{TicketValidator, ValidationResult};

/// Close reason used when the gateway is at capacity.
pub const REASON_SERVER_FULL: &str = "Server full";
/// Close reason used when the transport refuses an accept.
pub const REASON_ACCEPT_FAILED: &str = "Accept failed";
/// Close reason used on shutdown.
pub const REASON_SHUTDOWN: &str = "Server shutting down";

/// Runtime settings for a [`Gateway`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Maximum concurrent connections, counting those still being accepted.
    pub max_connections: usize,
    /// Messages drained from the transport per poll.
    pub max_messages_per_poll: usize,
    /// How long a connection may stay unauthenticated.
    pub handshake_timeout: Duration,
    /// What to do when a ticket's owner differs from its identity.
    pub owner_mismatch: OwnerMismatchPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_messages_per_poll: 32,
            handshake_timeout: Duration::from_secs(30),
            owner_mismatch: OwnerMismatchPolicy::AcceptFlagged,
        }
    }
}

impl From<&turnstile_config::ServerConfig> for GatewayConfig {
    fn from(config: &turnstile_config::ServerConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            max_messages_per_poll: config.max_messages_per_poll.max(1),
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
            owner_mismatch: config.owner_mismatch,
        }
    }
}

#[derive(Debug, Default)]
struct GatewayState {
    registry: ConnectionRegistry,
    /// Handles accepted at the transport but not yet established.
    accepting: HashSet<ConnectionHandle>,
    shut_down: bool,
}

/// Connection gateway that admits, authenticates, and serves clients.
pub struct Gateway<T, V> {
    config: GatewayConfig,
    transport: Arc<T>,
    validator: Arc<V>,
    state: Mutex<GatewayState>,
}

impl<T, V> Gateway<T, V>
where
    T: Transport,
    V: TicketValidator,
{
    /// Create a gateway over the given collaborators.
    pub fn new(config: GatewayConfig, transport: Arc<T>, validator: Arc<V>) -> Self {
        Self {
            config,
            transport,
            validator,
            state: Mutex::new(GatewayState::default()),
        }
    }

    /// Active settings.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// The transport collaborator.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// The validation collaborator.
    pub fn validator(&self) -> &Arc<V> {
        &self.validator
    }

    fn state(&self) -> MutexGuard<'_, GatewayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.state().registry.len()
    }

    /// Authentication state of a connection, if registered.
    pub fn auth_state(&self, handle: ConnectionHandle) -> Option<AuthState> {
        self.state().registry.get(handle).map(|record| record.state())
    }

    /// Handles of every connection in `state`.
    pub fn handles_in(&self, state: AuthState) -> Vec<ConnectionHandle> {
        self.state()
            .registry
            .handles_where(|record| record.state() == state)
    }

    /// One poll cycle: drain a batch of messages, then sweep stale handshakes.
    ///
    /// Returns the number of messages processed. A receive error is returned
    /// to the caller after sweeping; it never tears the gateway down.
    pub fn poll(&self) -> Result<usize, TransportError> {
        let received = self
            .transport
            .receive_batch(self.config.max_messages_per_poll);

        let processed = match &received {
            Ok(messages) => {
                for message in messages {
                    self.dispatch(message.handle, &message.payload);
                }
                messages.len()
            }
            Err(_) => 0,
        };

        self.sweep_timeouts(Instant::now());
        received.map(|_| processed)
    }

    fn dispatch(&self, handle: ConnectionHandle, payload: &[u8]) {
        let actions = {
            let mut state = self.state();
            match state.registry.get_mut(handle) {
                Some(record) => record.on_message(payload, Instant::now()),
                None => {
                    tracing::warn!(
                        "Message of {} bytes from unknown connection {}, discarding",
                        payload.len(),
                        handle
                    );
                    return;
                }
            }
        };
        self.execute(actions);
    }

    /// Close every connection stuck unauthenticated past the handshake timeout.
    pub fn sweep_timeouts(&self, now: Instant) -> usize {
        let timeout = self.config.handshake_timeout;
        let actions: Vec<Action> = {
            let state = self.state();
            let mut actions = Vec::new();
            state.registry.for_each(|record| {
                if let Some(elapsed) = record.handshake_overdue(now, timeout) {
                    actions.extend(record.on_handshake_timeout(elapsed));
                }
            });
            actions
        };

        let swept = actions.len();
        self.execute(actions);
        swept
    }

    /// Send `text` to every validated connection. Returns how many were sent.
    pub fn broadcast(&self, text: &str) -> usize {
        let targets = self.handles_in(AuthState::Validated);
        targets
            .into_iter()
            .filter(|&handle| match self.transport.send(handle, text.as_bytes()) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!("Broadcast to connection {} failed: {}", handle, err);
                    false
                }
            })
            .count()
    }

    /// Pump every collaborator event source with this gateway as the sink.
    pub fn run_callbacks(&self, sources: &[&dyn CallbackSource]) -> usize {
        run_callbacks(sources, self)
    }

    /// Close every connection and release the transport.
    ///
    /// Validated identities have their validation sessions ended first.
    /// Idempotent.
    pub fn shutdown(&self) {
        let (records, accepting) = {
            let mut state = self.state();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            let accepting: Vec<_> = state.accepting.drain().collect();
            (state.registry.drain(), accepting)
        };

        tracing::info!(
            "Shutting down gateway: {} connections, {} being accepted",
            records.len(),
            accepting.len()
        );

        for record in &records {
            if record.state() == AuthState::Validated {
                self.validator.end_validate_session(record.identity());
            }
        }
        for record in &records {
            self.transport.close(record.handle(), REASON_SHUTDOWN);
        }
        for handle in accepting {
            self.transport.close(handle, REASON_SHUTDOWN);
        }

        self.transport.shutdown();
    }

    fn execute(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send { handle, payload } => {
                    if let Err(err) = self.transport.send(handle, &payload) {
                        tracing::warn!("Send to connection {} failed: {}", handle, err);
                    }
                }
                Action::Close { handle, reason } => self.close_connection(handle, &reason),
                Action::BeginValidate {
                    handle,
                    identity,
                    ticket,
                } => self.begin_validate(handle, identity, ticket),
                Action::EndValidateSession { identity } => {
                    self.validator.end_validate_session(identity);
                }
            }
        }
    }

    /// Start validation, then make sure the connection is still waiting.
    ///
    /// The record can be closed between the state change and this call. Its
    /// close path ended the session before the request existed, so the
    /// session is ended again here.
    fn begin_validate(&self, handle: ConnectionHandle, identity: Identity, ticket: Vec<u8>) {
        self.validator.begin_validate(identity, ticket);

        let waiting = self.state().registry.get(handle).is_some_and(|record| {
            record.state() == AuthState::TicketReceived && record.identity() == identity
        });
        if !waiting {
            tracing::info!(
                "Connection {} ({}) closed before validation began, ending session",
                handle,
                identity
            );
            self.validator.end_validate_session(identity);
        }
    }

    /// Remove a connection's record, settle its validation session, and close it.
    pub fn close_connection(&self, handle: ConnectionHandle, reason: &str) {
        let removed = {
            let mut state = self.state();
            state.accepting.remove(&handle);
            state.registry.remove(handle)
        };

        if let Some(record) = removed {
            tracing::info!(
                "Closing connection {} ({}) in {:?}: {}",
                handle,
                record.identity(),
                record.state(),
                reason
            );
            self.execute(record.on_closed());
        }
        self.transport.close(handle, reason);
    }

    fn on_connecting(&self, handle: ConnectionHandle) {
        let admitted = {
            let mut state = self.state();
            let in_use = state.registry.len() + state.accepting.len();
            if state.shut_down || in_use >= self.config.max_connections {
                tracing::warn!(
                    "Rejecting connection {}: {} of {} slots in use",
                    handle,
                    in_use,
                    self.config.max_connections
                );
                false
            } else {
                state.accepting.insert(handle)
            }
        };

        if !admitted {
            self.transport.close(handle, REASON_SERVER_FULL);
            return;
        }

        if let Err(err) = self.transport.accept(handle) {
            tracing::warn!("Accept of connection {} failed: {}", handle, err);
            self.state().accepting.remove(&handle);
            self.transport.close(handle, REASON_ACCEPT_FAILED);
        }
    }

    fn on_connected(&self, handle: ConnectionHandle, remote: Option<Identity>) {
        let actions = {
            let mut state = self.state();
            let was_accepting = state.accepting.remove(&handle);
            if state.shut_down {
                tracing::info!("Connection {} established during shutdown", handle);
                vec![Action::close(handle, REASON_SHUTDOWN)]
            } else if !was_accepting && state.registry.len() >= self.config.max_connections {
                tracing::warn!("Connection {} established over capacity", handle);
                vec![Action::close(handle, REASON_SERVER_FULL)]
            } else {
                match on_established(handle, remote) {
                    Admission::Admit { identity, actions } => {
                        match state.registry.create(handle, identity, Instant::now()) {
                            Ok(_) => {
                                tracing::info!(
                                    "Connection {} established for {}, awaiting ticket",
                                    handle,
                                    identity
                                );
                                actions
                            }
                            Err(err) => {
                                tracing::error!("{}", err);
                                Vec::new()
                            }
                        }
                    }
                    Admission::Refuse { actions } => {
                        tracing::warn!(
                            "Connection {} established without a valid identity ({:?})",
                            handle,
                            remote
                        );
                        actions
                    }
                }
            }
        };
        self.execute(actions);
    }

    fn on_closed(&self, change: &StatusChange) {
        let reason = change.end_reason.as_deref().unwrap_or("closed");
        tracing::info!(
            "Connection {} {:?} -> {:?}: {}",
            change.handle,
            change.old_state,
            change.new_state,
            reason
        );
        self.close_connection(change.handle, reason);
    }
}

impl<T, V> EventSink for Gateway<T, V>
where
    T: Transport,
    V: TicketValidator,
{
    fn on_status_changed(&self, change: StatusChange) {
        match change.new_state {
            TransportState::Connecting => self.on_connecting(change.handle),
            TransportState::Connected => self.on_connected(change.handle, change.remote_identity),
            TransportState::ClosedByPeer | TransportState::ProblemDetectedLocally => {
                self.on_closed(&change)
            }
            TransportState::None => {
                tracing::debug!("Connection {} reported no state", change.handle);
            }
        }
    }

    fn on_validation_result(&self, result: ValidationResult) {
        let actions = {
            let mut state = self.state();
            let found = state
                .registry
                .find_by_identity(result.identity, AuthState::TicketReceived);
            found.and_then(|handle| state.registry.get_mut(handle)).map(|record| {
                record.on_validation_result(&result, self.config.owner_mismatch, Instant::now())
            })
        };

        match actions {
            Some(actions) => self.execute(actions),
            None if result.outcome.is_ok() => tracing::info!(
                "Validation succeeded for {} but no connection is waiting for it",
                result.identity
            ),
            None => {
                tracing::warn!(
                    "Validation failed for {} ({:?}) with no connection waiting, ending session",
                    result.identity,
                    result.outcome
                );
                self.validator.end_validate_session(result.identity);
            }
        }
    }
}
