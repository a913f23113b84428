//! Gateway behaviour driven through the loopback collaborators.

use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::{Duration, Instant, SystemTime};

use proptest::prelude::*;
use turnstile_config::OwnerMismatchPolicy;
use turnstile_net::protocol::{
    AUTH_FAILED_VALIDATION, AUTH_SUCCESSFUL_WELCOME_PLAYER, HELLO_SERVER, PING,
    SERVER_SAYS_HI_CLIENT, WELCOME_SEND_AUTH_TICKET,
};
use turnstile_net::{
    AuthState, AuthorityValidator, CallbackSource, ConnectionHandle, EventSink, Gateway,
    GatewayConfig, Identity, LoopbackTransport, ScriptedValidator, TicketAuthority,
    TicketValidator, TransportError, ValidationOutcome, encode_ticket_message,
};

const PLAYER: u64 = 76_561_198_000_000_001;

struct Harness {
    transport: Arc<LoopbackTransport>,
    validator: Arc<ScriptedValidator>,
    gateway: Gateway<LoopbackTransport, ScriptedValidator>,
}

fn harness_with(config: GatewayConfig) -> Harness {
    let transport = Arc::new(LoopbackTransport::new());
    let validator = Arc::new(ScriptedValidator::new());
    let gateway = Gateway::new(config, Arc::clone(&transport), Arc::clone(&validator));
    Harness {
        transport,
        validator,
        gateway,
    }
}

fn harness() -> Harness {
    harness_with(GatewayConfig::default())
}

impl Harness {
    /// Pump both collaborators until nothing is left to deliver.
    fn settle(&self) {
        while self
            .gateway
            .run_callbacks(&[&*self.transport, &*self.validator])
            > 0
        {}
    }

    fn connect(&self, identity: u64) -> ConnectionHandle {
        let handle = self.transport.connect_peer(Some(Identity(identity)));
        self.settle();
        handle
    }

    fn send_ticket(&self, handle: ConnectionHandle, ticket: &[u8]) {
        self.transport
            .deliver(handle, &encode_ticket_message(ticket).unwrap());
        self.gateway.poll().unwrap();
    }

    fn validate(&self, identity: u64, owner: u64, outcome: ValidationOutcome) {
        self.validator
            .complete(Identity(identity), Identity(owner), outcome);
        self.settle();
    }

    fn authenticated(&self, identity: u64) -> ConnectionHandle {
        let handle = self.connect(identity);
        self.send_ticket(handle, b"ticket");
        self.validate(identity, identity, ValidationOutcome::Ok);
        assert_eq!(self.gateway.auth_state(handle), Some(AuthState::Validated));
        handle
    }
}

#[test]
fn test_successful_handshake() {
    let h = harness();
    let handle = h.connect(PLAYER);

    assert!(h.transport.was_accepted(handle));
    assert_eq!(h.gateway.auth_state(handle), Some(AuthState::Pending));
    assert_eq!(h.transport.sent_text_to(handle), vec![WELCOME_SEND_AUTH_TICKET]);

    h.transport
        .deliver(handle, &[0x00, 0x00, 0x00, 0x03, b'a', b'b', b'c']);
    assert_eq!(h.gateway.poll().unwrap(), 1);
    assert_eq!(h.gateway.auth_state(handle), Some(AuthState::TicketReceived));
    assert_eq!(h.validator.begun(), vec![(Identity(PLAYER), b"abc".to_vec())]);

    h.validate(PLAYER, PLAYER, ValidationOutcome::Ok);

    assert_eq!(h.gateway.auth_state(handle), Some(AuthState::Validated));
    assert_eq!(
        h.transport.sent_text_to(handle),
        vec![WELCOME_SEND_AUTH_TICKET, AUTH_SUCCESSFUL_WELCOME_PLAYER]
    );
}

#[test]
fn test_failed_validation_closes_and_forgets() {
    let h = harness();
    let handle = h.connect(PLAYER);
    h.send_ticket(handle, b"abc");

    h.validate(PLAYER, PLAYER, ValidationOutcome::InvalidTicket);

    assert_eq!(
        h.transport.sent_text_to(handle).last().map(String::as_str),
        Some(AUTH_FAILED_VALIDATION)
    );
    assert_eq!(
        h.transport.close_reason(handle).as_deref(),
        Some("Auth validation failed")
    );
    assert_eq!(h.gateway.auth_state(handle), None);
    assert_eq!(h.gateway.connection_count(), 0);
}

#[test]
fn test_hello_before_ticket_is_ignored() {
    let h = harness();
    let handle = h.connect(PLAYER);

    h.transport.deliver(handle, HELLO_SERVER.as_bytes());
    h.gateway.poll().unwrap();

    assert_eq!(h.transport.sent_text_to(handle), vec![WELCOME_SEND_AUTH_TICKET]);
    assert_eq!(h.gateway.auth_state(handle), Some(AuthState::Pending));
}

#[test]
fn test_validated_client_gets_replies() {
    let h = harness();
    let handle = h.authenticated(PLAYER);

    h.transport.deliver(handle, HELLO_SERVER.as_bytes());
    h.transport.deliver(handle, PING.as_bytes());
    assert_eq!(h.gateway.poll().unwrap(), 2);

    assert_eq!(
        h.transport.sent_text_to(handle).last().map(String::as_str),
        Some(SERVER_SAYS_HI_CLIENT)
    );
    assert_eq!(h.transport.sent_to(handle).len(), 3);
}

#[test]
fn test_connection_over_capacity_is_rejected() {
    let h = harness();
    let live: Vec<_> = (1..=100).map(|id| h.connect(id)).collect();
    h.send_ticket(live[0], b"t");
    h.validate(1, 1, ValidationOutcome::Ok);

    let extra = h.connect(101);

    assert!(!h.transport.was_accepted(extra));
    assert_eq!(h.transport.close_reason(extra).as_deref(), Some("Server full"));
    assert_eq!(h.gateway.auth_state(extra), None);
    assert_eq!(h.gateway.connection_count(), 100);
}

#[test]
fn test_capacity_counts_connections_still_being_accepted() {
    let h = harness_with(GatewayConfig {
        max_connections: 1,
        ..GatewayConfig::default()
    });

    // Both knock before either is established.
    let first = h.transport.connect_peer(Some(Identity(1)));
    let second = h.transport.connect_peer(Some(Identity(2)));
    h.settle();

    assert!(h.transport.was_accepted(first));
    assert!(!h.transport.was_accepted(second));
    assert_eq!(h.gateway.connection_count(), 1);
}

#[test]
fn test_disconnect_of_validated_ends_session_once() {
    let h = harness();
    let handle = h.authenticated(PLAYER);

    h.transport.disconnect_peer(handle);
    h.settle();

    assert_eq!(h.gateway.auth_state(handle), None);
    assert_eq!(h.validator.end_count(Identity(PLAYER)), 1);

    h.gateway.close_connection(handle, "late close");
    h.gateway.shutdown();
    assert_eq!(h.validator.end_count(Identity(PLAYER)), 1);
}

#[test]
fn test_disconnect_while_pending_ends_nothing() {
    let h = harness();
    let handle = h.connect(PLAYER);

    h.transport.fail_peer(handle, "connection reset");
    h.settle();

    assert_eq!(h.gateway.connection_count(), 0);
    assert_eq!(h.validator.end_count(Identity(PLAYER)), 0);
}

#[test]
fn test_missing_identity_is_closed() {
    let h = harness();
    let handle = h.transport.connect_peer(None);
    h.settle();

    assert_eq!(
        h.transport.close_reason(handle).as_deref(),
        Some("Invalid identity")
    );
    assert_eq!(h.gateway.connection_count(), 0);

    let zero = h.transport.connect_peer(Some(Identity::INVALID));
    h.settle();
    assert_eq!(h.transport.close_reason(zero).as_deref(), Some("Invalid identity"));
}

#[test]
fn test_unmatched_results_leave_registry_alone() {
    let h = harness();
    let handle = h.connect(PLAYER);

    h.validate(999, 999, ValidationOutcome::Expired);
    h.validate(998, 998, ValidationOutcome::Ok);
    // Pending, not TicketReceived: the result is not for this record.
    h.validate(PLAYER, PLAYER, ValidationOutcome::Ok);

    assert_eq!(h.validator.end_count(Identity(999)), 1);
    assert_eq!(h.validator.end_count(Identity(998)), 0);
    assert_eq!(h.gateway.auth_state(handle), Some(AuthState::Pending));
    assert_eq!(h.gateway.connection_count(), 1);
}

#[test]
fn test_owner_mismatch_accepted_with_caveat_by_default() {
    let h = harness();
    let handle = h.connect(PLAYER);
    h.send_ticket(handle, b"t");

    h.validate(PLAYER, 7, ValidationOutcome::Ok);

    assert_eq!(h.gateway.auth_state(handle), Some(AuthState::Validated));
    assert_eq!(
        h.transport.sent_text_to(handle).last().map(String::as_str),
        Some("AUTH_SUCCESSFUL_WELCOME_PLAYER (owner mismatch noted)")
    );
}

#[test]
fn test_owner_mismatch_rejected_when_configured() {
    let h = harness_with(GatewayConfig {
        owner_mismatch: OwnerMismatchPolicy::Reject,
        ..GatewayConfig::default()
    });
    let handle = h.connect(PLAYER);
    h.send_ticket(handle, b"t");

    h.validate(PLAYER, 7, ValidationOutcome::Ok);

    assert_eq!(h.gateway.auth_state(handle), None);
    assert_eq!(
        h.transport.sent_text_to(handle).last().map(String::as_str),
        Some(AUTH_FAILED_VALIDATION)
    );
    assert_eq!(h.validator.end_count(Identity(PLAYER)), 1);
}

#[test]
fn test_second_ticket_starts_no_second_validation() {
    let h = harness();
    let handle = h.connect(PLAYER);
    h.send_ticket(handle, b"first");
    h.send_ticket(handle, b"second");

    assert_eq!(h.validator.begun().len(), 1);
    assert_eq!(h.gateway.auth_state(handle), Some(AuthState::TicketReceived));
}

#[test]
fn test_stale_handshakes_are_swept() {
    let h = harness();
    let pending = h.connect(1);
    let waiting = h.connect(2);
    h.send_ticket(waiting, b"t");
    let done = h.authenticated(3);

    let later = Instant::now() + Duration::from_secs(31);
    assert_eq!(h.gateway.sweep_timeouts(later), 2);

    for handle in [pending, waiting] {
        assert_eq!(
            h.transport.close_reason(handle).as_deref(),
            Some("Authentication timed out")
        );
        assert_eq!(h.gateway.auth_state(handle), None);
    }
    assert_eq!(h.validator.end_count(Identity(1)), 0);
    assert_eq!(h.validator.end_count(Identity(2)), 1);
    assert_eq!(h.gateway.auth_state(done), Some(AuthState::Validated));
}

#[test]
fn test_broadcast_reaches_validated_only() {
    let h = harness();
    let validated = h.authenticated(1);
    let pending = h.connect(2);

    assert_eq!(h.gateway.broadcast("MAINTENANCE"), 1);

    assert_eq!(
        h.transport.sent_text_to(validated).last().map(String::as_str),
        Some("MAINTENANCE")
    );
    assert_eq!(h.transport.sent_text_to(pending), vec![WELCOME_SEND_AUTH_TICKET]);
}

#[test]
fn test_unknown_handle_messages_are_dropped() {
    let h = harness();
    h.transport.deliver(ConnectionHandle(77), HELLO_SERVER.as_bytes());

    assert_eq!(h.gateway.poll().unwrap(), 1);
    assert!(h.transport.sent_to(ConnectionHandle(77)).is_empty());
}

#[test]
fn test_poll_is_bounded_per_cycle() {
    let h = harness();
    let handle = h.authenticated(PLAYER);
    for _ in 0..40 {
        h.transport.deliver(handle, PING.as_bytes());
    }

    assert_eq!(h.gateway.poll().unwrap(), 32);
    assert_eq!(h.gateway.poll().unwrap(), 8);
}

#[test]
fn test_receive_failure_is_not_fatal() {
    let h = harness();
    let handle = h.authenticated(PLAYER);

    h.transport.fail_next_receive();
    assert_eq!(h.gateway.poll(), Err(TransportError::QueueClosed));

    h.transport.deliver(handle, HELLO_SERVER.as_bytes());
    assert_eq!(h.gateway.poll().unwrap(), 1);
    assert_eq!(
        h.transport.sent_text_to(handle).last().map(String::as_str),
        Some(SERVER_SAYS_HI_CLIENT)
    );
}

#[test]
fn test_accept_failure_closes_and_frees_slot() {
    let h = harness_with(GatewayConfig {
        max_connections: 1,
        ..GatewayConfig::default()
    });
    h.transport.refuse_accepts(true);
    let refused = h.connect(1);
    assert_eq!(h.transport.close_reason(refused).as_deref(), Some("Accept failed"));

    h.transport.refuse_accepts(false);
    let admitted = h.connect(2);
    assert_eq!(h.gateway.auth_state(admitted), Some(AuthState::Pending));
}

#[test]
fn test_shutdown_ends_validated_sessions_and_closes_all() {
    let h = harness();
    let validated = h.authenticated(1);
    let pending = h.connect(2);

    h.gateway.shutdown();

    assert_eq!(h.validator.end_count(Identity(1)), 1);
    assert_eq!(h.validator.end_count(Identity(2)), 0);
    for handle in [validated, pending] {
        assert_eq!(
            h.transport.close_reason(handle).as_deref(),
            Some("Server shutting down")
        );
    }
    assert!(h.transport.is_shut_down());
    assert_eq!(h.gateway.connection_count(), 0);

    h.gateway.shutdown();
    assert_eq!(h.validator.end_count(Identity(1)), 1);

    // Nothing is admitted after shutdown.
    let late = h.transport.connect_peer(Some(Identity(3)));
    h.settle();
    assert!(!h.transport.was_accepted(late));
}

#[test]
fn test_connection_established_during_shutdown_is_closed() {
    let h = harness();
    let handle = h.transport.connect_peer(Some(Identity(PLAYER)));
    // Deliver only `Connecting`; the `Connected` it triggers stays queued.
    h.gateway.run_callbacks(&[&*h.transport]);
    assert!(h.transport.was_accepted(handle));

    h.gateway.shutdown();
    h.settle();

    assert_eq!(h.gateway.connection_count(), 0);
    assert_eq!(h.gateway.auth_state(handle), None);
    assert!(h.transport.sent_text_to(handle).is_empty());
}

type RacingGateway = Gateway<LoopbackTransport, DisconnectBeforeValidate>;

/// Real ticket validator whose connection drops just before validation starts.
struct DisconnectBeforeValidate {
    inner: AuthorityValidator,
    transport: Arc<LoopbackTransport>,
    gateway: OnceLock<Weak<RacingGateway>>,
    drop_next: Mutex<Option<ConnectionHandle>>,
}

impl TicketValidator for DisconnectBeforeValidate {
    fn begin_validate(&self, identity: Identity, ticket: Vec<u8>) {
        let dropping = self
            .drop_next
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = dropping
            && let Some(gateway) = self.gateway.get().and_then(Weak::upgrade)
        {
            self.transport.disconnect_peer(handle);
            gateway.run_callbacks(&[&*self.transport]);
        }
        self.inner.begin_validate(identity, ticket);
    }

    fn end_validate_session(&self, identity: Identity) {
        self.inner.end_validate_session(identity);
    }
}

impl CallbackSource for DisconnectBeforeValidate {
    fn pump(&self, sink: &dyn EventSink) -> usize {
        self.inner.pump(sink)
    }
}

#[test]
fn test_disconnect_before_validation_starts_leaves_no_session() {
    let authority = TicketAuthority::new("shared-key", Duration::from_secs(300)).unwrap();
    let player = Identity(PLAYER);
    let transport = Arc::new(LoopbackTransport::new());
    let validator = Arc::new(DisconnectBeforeValidate {
        inner: AuthorityValidator::new(authority.clone()),
        transport: Arc::clone(&transport),
        gateway: OnceLock::new(),
        drop_next: Mutex::new(None),
    });
    let gateway = Arc::new(Gateway::new(
        GatewayConfig::default(),
        Arc::clone(&transport),
        Arc::clone(&validator),
    ));
    validator.gateway.set(Arc::downgrade(&gateway)).unwrap();
    let settle = || {
        while gateway.run_callbacks(&[&*transport, &*validator]) > 0 {}
    };

    let first = transport.connect_peer(Some(player));
    settle();
    *validator.drop_next.lock().unwrap() = Some(first);
    let ticket = authority.issue(player, player, SystemTime::now()).unwrap();
    transport.deliver(first, &encode_ticket_message(&ticket).unwrap());
    gateway.poll().unwrap();
    settle();

    assert_eq!(gateway.connection_count(), 0);
    assert!(!validator.inner.has_session(player));
    assert_eq!(validator.inner.queued(), 0);

    // The same player can still sign in afterwards.
    let second = transport.connect_peer(Some(player));
    settle();
    let ticket = authority.issue(player, player, SystemTime::now()).unwrap();
    transport.deliver(second, &encode_ticket_message(&ticket).unwrap());
    gateway.poll().unwrap();
    settle();

    assert_eq!(gateway.auth_state(second), Some(AuthState::Validated));
    assert_eq!(
        transport.sent_text_to(second),
        vec![WELCOME_SEND_AUTH_TICKET, AUTH_SUCCESSFUL_WELCOME_PLAYER]
    );
    assert!(validator.inner.has_session(player));
}

#[derive(Debug, Clone)]
enum Op {
    Connect(u64),
    Disconnect(usize),
    Ticket(usize),
    Verdict(usize, bool),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u64..6).prop_map(Op::Connect),
        any::<usize>().prop_map(Op::Disconnect),
        any::<usize>().prop_map(Op::Ticket),
        (any::<usize>(), any::<bool>()).prop_map(|(i, ok)| Op::Verdict(i, ok)),
    ]
}

proptest! {
    #[test]
    fn prop_registry_tracks_live_connections(ops in proptest::collection::vec(op(), 1..60)) {
        let h = harness_with(GatewayConfig {
            max_connections: 4,
            ..GatewayConfig::default()
        });
        let mut handles = Vec::new();

        for op in ops {
            match op {
                Op::Connect(id) => handles.push((h.connect(id), id)),
                Op::Disconnect(i) if !handles.is_empty() => {
                    let (handle, _) = handles.remove(i % handles.len());
                    h.transport.disconnect_peer(handle);
                    h.settle();
                }
                Op::Ticket(i) if !handles.is_empty() => {
                    let (handle, _) = handles[i % handles.len()];
                    h.send_ticket(handle, b"t");
                }
                Op::Verdict(i, ok) if !handles.is_empty() => {
                    let (_, id) = handles[i % handles.len()];
                    let outcome = if ok { ValidationOutcome::Ok } else { ValidationOutcome::Expired };
                    h.validate(id, id, outcome);
                }
                _ => {}
            }

            prop_assert_eq!(h.gateway.connection_count(), h.transport.peer_count());
            prop_assert!(h.gateway.connection_count() <= 4);
        }
    }
}
