//! Per-connection authentication state machine.
//!
//! # Architecture: Action-Based State Machine
//!
//! Every method takes the current time as a parameter and returns the side
//! effects it wants as a list of [`Action`]s. Nothing here touches a socket
//! or a lock; the [`Gateway`](crate::gateway::Gateway) executes the actions
//! after releasing the registry lock.
//!
//! # States
//!
//! ```text
//! ┌─────────┐  ticket frame  ┌────────────────┐  result ok   ┌───────────┐
//! │ Pending │───────────────>│ TicketReceived │─────────────>│ Validated │
//! └─────────┘                └────────────────┘              └───────────┘
//!                                    │ result failed
//!                                    ↓
//!                               ┌────────┐
//!                               │ Failed │
//!                               └────────┘
//! ```
//!
//! `Validated` and `Failed` are terminal. Removal on disconnect is a registry
//! event, not a state.

use std::time::{Duration, Instant};

use turnstile_config::OwnerMismatchPolicy;

use crate::identity::{ConnectionHandle, Identity};
use crate::protocol::{
    AUTH_FAILED_VALIDATION, AUTH_SUCCESSFUL_WELCOME_PLAYER, HELLO_SERVER, OWNER_MISMATCH_CAVEAT,
    PING, SERVER_SAYS_HI_CLIENT, WELCOME_SEND_AUTH_TICKET, decode_ticket_message,
};
use crate::validation::ValidationResult;

/// Authentication progress of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthState {
    /// Welcome sent, waiting for the ticket frame.
    Pending,
    /// Ticket captured, external validation in flight.
    TicketReceived,
    /// Ticket accepted; application messages flow.
    Validated,
    /// Ticket rejected; the connection is being closed.
    Failed,
}

impl AuthState {
    /// Whether no further authentication transition can happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Validated | Self::Failed)
    }

    /// Whether `next` is a legal forward step from `self`.
    pub fn can_advance_to(self, next: AuthState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::TicketReceived)
                | (Self::TicketReceived, Self::Validated)
                | (Self::TicketReceived, Self::Failed)
        )
    }
}

/// Side effect requested by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send this message to the connection.
    Send {
        /// Target connection.
        handle: ConnectionHandle,
        /// Message bytes.
        payload: Vec<u8>,
    },
    /// Close the connection and drop its record.
    Close {
        /// Target connection.
        handle: ConnectionHandle,
        /// Reason passed to the transport.
        reason: String,
    },
    /// Ask the ticket subsystem to validate a ticket.
    BeginValidate {
        /// Connection that presented the ticket.
        handle: ConnectionHandle,
        /// Identity the ticket claims.
        identity: Identity,
        /// Raw ticket blob.
        ticket: Vec<u8>,
    },
    /// Terminate the external validation session of an identity.
    EndValidateSession {
        /// Identity whose session ends.
        identity: Identity,
    },
}

impl Action {
    /// Shorthand for sending a text token.
    pub fn send_text(handle: ConnectionHandle, text: &str) -> Self {
        Self::Send {
            handle,
            payload: text.as_bytes().to_vec(),
        }
    }

    /// Shorthand for closing with a reason.
    pub fn close(handle: ConnectionHandle, reason: &str) -> Self {
        Self::Close {
            handle,
            reason: reason.to_string(),
        }
    }
}

/// Decision taken when the transport reports a connection as established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Create a `Pending` record for this identity and run the actions.
    Admit {
        /// Identity the record is keyed to.
        identity: Identity,
        /// Handshake cue.
        actions: Vec<Action>,
    },
    /// Do not create a record; run the actions (a close).
    Refuse {
        /// Close request.
        actions: Vec<Action>,
    },
}

/// Decide what to do with a freshly established connection.
pub fn on_established(handle: ConnectionHandle, remote: Option<Identity>) -> Admission {
    match remote.and_then(Identity::valid) {
        Some(identity) => Admission::Admit {
            identity,
            actions: vec![Action::send_text(handle, WELCOME_SEND_AUTH_TICKET)],
        },
        None => Admission::Refuse {
            actions: vec![Action::close(handle, "Invalid identity")],
        },
    }
}

/// State kept for one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    handle: ConnectionHandle,
    identity: Identity,
    state: AuthState,
    /// Ticket retained until its validation resolves.
    pending_ticket: Option<Vec<u8>>,
    established_at: Instant,
    state_since: Instant,
    last_activity: Instant,
}

impl ConnectionRecord {
    /// Create a record in [`AuthState::Pending`].
    pub fn new(handle: ConnectionHandle, identity: Identity, now: Instant) -> Self {
        Self {
            handle,
            identity,
            state: AuthState::Pending,
            pending_ticket: None,
            established_at: now,
            state_since: now,
            last_activity: now,
        }
    }

    /// Transport handle of this connection.
    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    /// Identity asserted by the transport.
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Current authentication state.
    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Ticket awaiting validation, if any.
    pub fn pending_ticket(&self) -> Option<&[u8]> {
        self.pending_ticket.as_deref()
    }

    /// When the current state was entered.
    pub fn state_since(&self) -> Instant {
        self.state_since
    }

    /// When the last message from this connection arrived.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    fn enter(&mut self, next: AuthState, now: Instant) -> bool {
        if !self.state.can_advance_to(next) {
            tracing::error!(
                "Refusing auth transition {:?} -> {:?} for connection {}",
                self.state,
                next,
                self.handle
            );
            return false;
        }
        self.state = next;
        self.state_since = now;
        true
    }

    /// Handle one message received from this connection.
    pub fn on_message(&mut self, payload: &[u8], now: Instant) -> Vec<Action> {
        self.last_activity = now;

        match self.state {
            AuthState::Pending => match decode_ticket_message(payload) {
                Ok(ticket) => {
                    let ticket = ticket.to_vec();
                    if !self.enter(AuthState::TicketReceived, now) {
                        return Vec::new();
                    }
                    tracing::info!(
                        "Connection {} ({}) sent a {}-byte auth ticket, validating",
                        self.handle,
                        self.identity,
                        ticket.len()
                    );
                    self.pending_ticket = Some(ticket.clone());
                    vec![Action::BeginValidate {
                        handle: self.handle,
                        identity: self.identity,
                        ticket,
                    }]
                }
                Err(err) => {
                    self.discard_unauthenticated(payload, &err.to_string());
                    Vec::new()
                }
            },
            AuthState::TicketReceived => {
                match decode_ticket_message(payload) {
                    Ok(_) => tracing::warn!(
                        "Connection {} sent another ticket while validation is in flight, ignoring",
                        self.handle
                    ),
                    Err(err) => self.discard_unauthenticated(payload, &err.to_string()),
                }
                Vec::new()
            }
            AuthState::Validated => self.on_application_message(payload),
            AuthState::Failed => {
                tracing::warn!(
                    "Message from connection {} whose auth failed, ignoring",
                    self.handle
                );
                Vec::new()
            }
        }
    }

    fn discard_unauthenticated(&self, payload: &[u8], reason: &str) {
        match std::str::from_utf8(payload) {
            Ok(text) if text == HELLO_SERVER || text == PING => tracing::info!(
                "Connection {} ({}) sent '{}' before authentication ({:?}), discarding",
                self.handle,
                self.identity,
                text,
                self.state
            ),
            _ => tracing::warn!(
                "Malformed auth ticket message from connection {}: {}",
                self.handle,
                reason
            ),
        }
    }

    fn on_application_message(&self, payload: &[u8]) -> Vec<Action> {
        let Ok(text) = std::str::from_utf8(payload) else {
            tracing::warn!(
                "Non-UTF-8 message of {} bytes from connection {}, discarding",
                payload.len(),
                self.handle
            );
            return Vec::new();
        };

        tracing::info!(
            "Received from connection {} ({}): '{}'",
            self.handle,
            self.identity,
            text
        );

        match text {
            HELLO_SERVER => vec![Action::send_text(self.handle, SERVER_SAYS_HI_CLIENT)],
            PING => Vec::new(),
            _ => {
                tracing::debug!("Unrecognized message from connection {}", self.handle);
                Vec::new()
            }
        }
    }

    /// Apply an asynchronous validation verdict.
    ///
    /// Results for a record that is not in [`AuthState::TicketReceived`], or
    /// for another identity, are stale and change nothing.
    pub fn on_validation_result(
        &mut self,
        result: &ValidationResult,
        policy: OwnerMismatchPolicy,
        now: Instant,
    ) -> Vec<Action> {
        if self.state != AuthState::TicketReceived || result.identity != self.identity {
            tracing::debug!(
                "Stale validation result for {} on connection {} in {:?}",
                result.identity,
                self.handle,
                self.state
            );
            return Vec::new();
        }

        self.pending_ticket = None;

        if !result.outcome.is_ok() {
            self.enter(AuthState::Failed, now);
            tracing::error!(
                "Auth failed for {} (connection {}): {:?}. Disconnecting.",
                self.identity,
                self.handle,
                result.outcome
            );
            return vec![
                Action::send_text(self.handle, AUTH_FAILED_VALIDATION),
                Action::close(self.handle, "Auth validation failed"),
            ];
        }

        if !result.owner_mismatch() {
            self.enter(AuthState::Validated, now);
            tracing::info!(
                "Auth validated for {} (connection {}), owner matches",
                self.identity,
                self.handle
            );
            return vec![Action::send_text(self.handle, AUTH_SUCCESSFUL_WELCOME_PLAYER)];
        }

        match policy {
            OwnerMismatchPolicy::AcceptFlagged => {
                self.enter(AuthState::Validated, now);
                tracing::warn!(
                    "Auth validated for {} but owner is {} (connection {}), accepting with caveat",
                    self.identity,
                    result.owner,
                    self.handle
                );
                let notice = format!("{AUTH_SUCCESSFUL_WELCOME_PLAYER}{OWNER_MISMATCH_CAVEAT}");
                vec![Action::send_text(self.handle, &notice)]
            }
            OwnerMismatchPolicy::Reject => {
                self.enter(AuthState::Failed, now);
                tracing::warn!(
                    "Auth validated for {} but owner is {} (connection {}), rejecting",
                    self.identity,
                    result.owner,
                    self.handle
                );
                vec![
                    Action::send_text(self.handle, AUTH_FAILED_VALIDATION),
                    Action::EndValidateSession {
                        identity: self.identity,
                    },
                    Action::close(self.handle, "Ticket owner mismatch"),
                ]
            }
        }
    }

    /// Cleanup owed to the ticket subsystem once this record is removed.
    ///
    /// A validated identity holds a session; a ticket still under validation
    /// is cancelled so the session cannot outlive the connection.
    pub fn on_closed(&self) -> Vec<Action> {
        match self.state {
            AuthState::Validated | AuthState::TicketReceived => vec![Action::EndValidateSession {
                identity: self.identity,
            }],
            AuthState::Pending | AuthState::Failed => Vec::new(),
        }
    }

    /// Time spent unauthenticated beyond `timeout`, if any.
    pub fn handshake_overdue(&self, now: Instant, timeout: Duration) -> Option<Duration> {
        if self.state.is_terminal() {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.established_at);
        (elapsed > timeout).then_some(elapsed)
    }

    /// Close a connection that never finished authenticating.
    pub fn on_handshake_timeout(&self, elapsed: Duration) -> Vec<Action> {
        tracing::warn!(
            "Connection {} ({}) still {:?} after {:?}, closing",
            self.handle,
            self.identity,
            self.state,
            elapsed
        );
        vec![Action::close(self.handle, "Authentication timed out")]
    }
}
