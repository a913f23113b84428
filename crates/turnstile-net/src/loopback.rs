//! In-process collaborators with scripted peers.
//!
//! [`LoopbackTransport`] stands in for a network transport and
//! [`ScriptedValidator`] for a ticket service. Both record every call made
//! on them and queue their events until pumped, exactly like the real
//! collaborators, so gateway behaviour can be driven step by step.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::events::{CallbackSource, EventSink};
use crate::identity::{ConnectionHandle, HandleGenerator, Identity};
use crate::transport::{IncomingMessage, StatusChange, Transport, TransportError, TransportState};
use crate::validation::{TicketValidator, ValidationOutcome, ValidationResult};

#[derive(Debug, Clone, Copy)]
struct Peer {
    state: TransportState,
    remote: Option<Identity>,
}

#[derive(Debug, Default)]
struct LoopbackState {
    peers: HashMap<ConnectionHandle, Peer>,
    inbox: VecDeque<IncomingMessage>,
    statuses: VecDeque<StatusChange>,
    sent: Vec<(ConnectionHandle, Vec<u8>)>,
    closes: Vec<(ConnectionHandle, String)>,
    accepted: Vec<ConnectionHandle>,
    refuse_accepts: bool,
    fail_next_receive: bool,
    shut_down: bool,
}

/// Scripted in-memory [`Transport`].
///
/// Accepting a peer establishes it right away, queueing `Connected` with the
/// identity given to [`connect_peer`](Self::connect_peer).
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    handles: HandleGenerator,
    state: Mutex<LoopbackState>,
}

impl LoopbackTransport {
    /// Create a transport with no peers.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A peer knocks. Queues `None -> Connecting`.
    pub fn connect_peer(&self, remote: Option<Identity>) -> ConnectionHandle {
        let handle = self.handles.next_handle();
        let mut state = self.state();
        state.peers.insert(
            handle,
            Peer {
                state: TransportState::Connecting,
                remote,
            },
        );
        state.statuses.push_back(StatusChange {
            handle,
            old_state: TransportState::None,
            new_state: TransportState::Connecting,
            remote_identity: None,
            end_reason: None,
        });
        handle
    }

    /// The peer sends a message. Unknown handles are delivered as-is.
    pub fn deliver(&self, handle: ConnectionHandle, payload: &[u8]) {
        self.state().inbox.push_back(IncomingMessage {
            handle,
            payload: payload.to_vec(),
        });
    }

    /// The peer hangs up. Queues `ClosedByPeer`.
    pub fn disconnect_peer(&self, handle: ConnectionHandle) {
        self.end_peer(handle, TransportState::ClosedByPeer, "Closed by peer");
    }

    /// The link fails. Queues `ProblemDetectedLocally`.
    pub fn fail_peer(&self, handle: ConnectionHandle, reason: &str) {
        self.end_peer(handle, TransportState::ProblemDetectedLocally, reason);
    }

    fn end_peer(&self, handle: ConnectionHandle, new_state: TransportState, reason: &str) {
        let mut state = self.state();
        if let Some(peer) = state.peers.remove(&handle) {
            state.statuses.push_back(StatusChange {
                handle,
                old_state: peer.state,
                new_state,
                remote_identity: peer.remote,
                end_reason: Some(reason.to_string()),
            });
        }
    }

    /// Make every later `accept` fail.
    pub fn refuse_accepts(&self, refuse: bool) {
        self.state().refuse_accepts = refuse;
    }

    /// Make the next `receive_batch` fail.
    pub fn fail_next_receive(&self) {
        self.state().fail_next_receive = true;
    }

    /// Messages sent to `handle`, in order.
    pub fn sent_to(&self, handle: ConnectionHandle) -> Vec<Vec<u8>> {
        self.state()
            .sent
            .iter()
            .filter(|(to, _)| *to == handle)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Messages sent to `handle`, decoded as text.
    pub fn sent_text_to(&self, handle: ConnectionHandle) -> Vec<String> {
        self.sent_to(handle)
            .iter()
            .map(|payload| String::from_utf8_lossy(payload).into_owned())
            .collect()
    }

    /// Reason passed to the first `close` of `handle`.
    pub fn close_reason(&self, handle: ConnectionHandle) -> Option<String> {
        self.state()
            .closes
            .iter()
            .find(|(closed, _)| *closed == handle)
            .map(|(_, reason)| reason.clone())
    }

    /// Whether `accept` succeeded for `handle`.
    pub fn was_accepted(&self, handle: ConnectionHandle) -> bool {
        self.state().accepted.contains(&handle)
    }

    /// Current state of a live peer.
    pub fn peer_state(&self, handle: ConnectionHandle) -> Option<TransportState> {
        self.state().peers.get(&handle).map(|peer| peer.state)
    }

    /// Number of live peers.
    pub fn peer_count(&self) -> usize {
        self.state().peers.len()
    }

    /// Whether `shutdown` ran.
    pub fn is_shut_down(&self) -> bool {
        self.state().shut_down
    }
}

impl Transport for LoopbackTransport {
    fn accept(&self, handle: ConnectionHandle) -> Result<(), TransportError> {
        let mut state = self.state();
        let refuse = state.refuse_accepts;
        let peer = state
            .peers
            .get_mut(&handle)
            .ok_or(TransportError::UnknownHandle(handle))?;
        if peer.state != TransportState::Connecting {
            return Err(TransportError::InvalidState {
                handle,
                state: peer.state,
            });
        }
        if refuse {
            return Err(TransportError::Closed(handle));
        }

        peer.state = TransportState::Connected;
        let remote = peer.remote;
        state.accepted.push(handle);
        state.statuses.push_back(StatusChange {
            handle,
            old_state: TransportState::Connecting,
            new_state: TransportState::Connected,
            remote_identity: remote,
            end_reason: None,
        });
        Ok(())
    }

    fn close(&self, handle: ConnectionHandle, reason: &str) {
        let mut state = self.state();
        state.peers.remove(&handle);
        state.closes.push((handle, reason.to_string()));
    }

    fn send(&self, handle: ConnectionHandle, payload: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state();
        let peer = state
            .peers
            .get(&handle)
            .ok_or(TransportError::UnknownHandle(handle))?;
        if peer.state != TransportState::Connected {
            return Err(TransportError::InvalidState {
                handle,
                state: peer.state,
            });
        }
        state.sent.push((handle, payload.to_vec()));
        Ok(())
    }

    fn receive_batch(&self, max: usize) -> Result<Vec<IncomingMessage>, TransportError> {
        let mut state = self.state();
        if std::mem::take(&mut state.fail_next_receive) {
            return Err(TransportError::QueueClosed);
        }
        let take = max.min(state.inbox.len());
        Ok(state.inbox.drain(..take).collect())
    }

    fn shutdown(&self) {
        let mut state = self.state();
        state.peers.clear();
        state.shut_down = true;
    }
}

impl CallbackSource for LoopbackTransport {
    fn pump(&self, sink: &dyn EventSink) -> usize {
        let changes: Vec<_> = self.state().statuses.drain(..).collect();
        let delivered = changes.len();
        for change in changes {
            sink.on_status_changed(change);
        }
        delivered
    }
}

#[derive(Debug, Default)]
struct ScriptedState {
    begun: Vec<(Identity, Vec<u8>)>,
    ended: Vec<Identity>,
    ready: VecDeque<ValidationResult>,
}

/// Ticket validator whose verdicts are supplied by the caller.
#[derive(Debug, Default)]
pub struct ScriptedValidator {
    state: Mutex<ScriptedState>,
}

impl ScriptedValidator {
    /// Create a validator with no history.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ScriptedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a verdict for the next pump.
    pub fn complete(&self, identity: Identity, owner: Identity, outcome: ValidationOutcome) {
        self.state().ready.push_back(ValidationResult {
            identity,
            owner,
            outcome,
        });
    }

    /// Every `begin_validate` call, in order.
    pub fn begun(&self) -> Vec<(Identity, Vec<u8>)> {
        self.state().begun.clone()
    }

    /// How many times the session of `identity` was ended.
    pub fn end_count(&self, identity: Identity) -> usize {
        self.state()
            .ended
            .iter()
            .filter(|ended| **ended == identity)
            .count()
    }
}

impl TicketValidator for ScriptedValidator {
    fn begin_validate(&self, identity: Identity, ticket: Vec<u8>) {
        self.state().begun.push((identity, ticket));
    }

    fn end_validate_session(&self, identity: Identity) {
        self.state().ended.push(identity);
    }
}

impl CallbackSource for ScriptedValidator {
    fn pump(&self, sink: &dyn EventSink) -> usize {
        let results: Vec<_> = self.state().ready.drain(..).collect();
        let delivered = results.len();
        for result in results {
            sink.on_validation_result(result);
        }
        delivered
    }
}
