//! Signed auth tickets and the validator that checks them.
//!
//! A ticket is a fixed 64-byte blob signed with a key shared between the
//! issuing client and the validating server:
//!
//! ```text
//! +----------+----------+-----------+---------+------------------+
//! | identity | owner    | issued_at | nonce   | HMAC-SHA256      |
//! | u64 BE   | u64 BE   | u64 BE    | 8 bytes | over bytes 0..32 |
//! +----------+----------+-----------+---------+------------------+
//! ```

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

use crate::events::{CallbackSource, EventSink};
use crate::identity::Identity;
use crate::validation::{TicketValidator, ValidationOutcome, ValidationResult};

type HmacSha256 = Hmac<Sha256>;

/// Total ticket length in bytes.
pub const TICKET_LEN: usize = 64;
const SIGNED_LEN: usize = 32;

/// Errors raised while issuing tickets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TicketError {
    /// The shared key is empty or unusable.
    #[error("ticket issuer key is empty or invalid")]
    InvalidKey,
    /// The system clock reads before the Unix epoch.
    #[error("system clock is before the Unix epoch")]
    Clock,
}

/// Issues and verifies tickets with a shared key.
#[derive(Clone)]
pub struct TicketAuthority {
    key: Vec<u8>,
    lifetime: Duration,
}

impl fmt::Debug for TicketAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketAuthority")
            .field("key", &"<redacted>")
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

impl TicketAuthority {
    /// Create an authority. The key must not be empty.
    pub fn new(key: impl AsRef<[u8]>, lifetime: Duration) -> Result<Self, TicketError> {
        let key = key.as_ref().to_vec();
        if key.is_empty() {
            return Err(TicketError::InvalidKey);
        }
        Ok(Self { key, lifetime })
    }

    /// Create an authority from the `ticket` config section.
    pub fn from_config(config: &turnstile_config::TicketConfig) -> Result<Self, TicketError> {
        Self::new(
            config.issuer_key.as_bytes(),
            Duration::from_secs(config.lifetime_secs),
        )
    }

    /// How long an issued ticket stays valid.
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    fn mac(&self) -> Result<HmacSha256, TicketError> {
        HmacSha256::new_from_slice(&self.key).map_err(|_| TicketError::InvalidKey)
    }

    /// Issue a ticket for `identity`, licensed to `owner`.
    pub fn issue(
        &self,
        identity: Identity,
        owner: Identity,
        issued_at: SystemTime,
    ) -> Result<Vec<u8>, TicketError> {
        let issued_secs = issued_at
            .duration_since(UNIX_EPOCH)
            .map_err(|_| TicketError::Clock)?
            .as_secs();

        let mut nonce = [0u8; 8];
        rand::rng().fill(&mut nonce);

        let mut ticket = Vec::with_capacity(TICKET_LEN);
        ticket.extend_from_slice(&identity.0.to_be_bytes());
        ticket.extend_from_slice(&owner.0.to_be_bytes());
        ticket.extend_from_slice(&issued_secs.to_be_bytes());
        ticket.extend_from_slice(&nonce);

        let mut mac = self.mac()?;
        mac.update(&ticket);
        ticket.extend_from_slice(&mac.finalize().into_bytes());
        Ok(ticket)
    }

    /// Check a ticket presented by `claimed`. Returns the ticket's owner.
    pub fn verify(
        &self,
        claimed: Identity,
        ticket: &[u8],
        now: SystemTime,
    ) -> Result<Identity, ValidationOutcome> {
        if ticket.len() != TICKET_LEN {
            return Err(ValidationOutcome::InvalidTicket);
        }

        let (signed, signature) = ticket.split_at(SIGNED_LEN);
        let mut mac = self.mac().map_err(|_| ValidationOutcome::InvalidTicket)?;
        mac.update(signed);
        mac.verify_slice(signature)
            .map_err(|_| ValidationOutcome::InvalidTicket)?;

        let field = |offset: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&signed[offset..offset + 8]);
            u64::from_be_bytes(bytes)
        };
        let identity = Identity(field(0));
        let owner = Identity(field(8));
        let issued_at = UNIX_EPOCH + Duration::from_secs(field(16));

        if identity != claimed {
            return Err(ValidationOutcome::IdentityMismatch);
        }

        let age = now.duration_since(issued_at).unwrap_or(Duration::ZERO);
        if age > self.lifetime {
            return Err(ValidationOutcome::Expired);
        }

        Ok(owner)
    }
}

/// Client-side holder of the ticket for one identity.
#[derive(Debug)]
pub struct TicketIssuer {
    authority: TicketAuthority,
    identity: Identity,
    owner: Identity,
    active: Option<Vec<u8>>,
}

impl TicketIssuer {
    /// Create an issuer for `identity`, licensed to `owner`.
    pub fn new(authority: TicketAuthority, identity: Identity, owner: Identity) -> Self {
        Self {
            authority,
            identity,
            owner,
            active: None,
        }
    }

    /// Identity the tickets are issued for.
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Issue a fresh ticket, replacing any previous one.
    pub fn issue(&mut self) -> Result<Vec<u8>, TicketError> {
        let ticket = self
            .authority
            .issue(self.identity, self.owner, SystemTime::now())?;
        tracing::info!(
            "Issued {}-byte auth ticket for {}",
            ticket.len(),
            self.identity
        );
        self.active = Some(ticket.clone());
        Ok(ticket)
    }

    /// Whether a ticket is outstanding.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Drop the outstanding ticket. Returns whether one was active.
    pub fn cancel(&mut self) -> bool {
        let cancelled = self.active.take().is_some();
        if cancelled {
            tracing::info!("Cancelled auth ticket for {}", self.identity);
        }
        cancelled
    }
}

#[derive(Debug, Default)]
struct ValidatorState {
    queued: VecDeque<(Identity, Vec<u8>)>,
    active: HashSet<Identity>,
}

/// Server-side validator backed by a [`TicketAuthority`].
///
/// Requests are queued by [`TicketValidator::begin_validate`] and evaluated
/// when the validator is pumped, so results always arrive through the
/// callback context.
#[derive(Debug)]
pub struct AuthorityValidator {
    authority: TicketAuthority,
    state: Mutex<ValidatorState>,
}

impl AuthorityValidator {
    /// Create a validator with no sessions.
    pub fn new(authority: TicketAuthority) -> Self {
        Self {
            authority,
            state: Mutex::new(ValidatorState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ValidatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of identities with an active session.
    pub fn active_sessions(&self) -> usize {
        self.state().active.len()
    }

    /// Whether `identity` holds an active session.
    pub fn has_session(&self, identity: Identity) -> bool {
        self.state().active.contains(&identity)
    }

    /// Number of requests waiting for the next pump.
    pub fn queued(&self) -> usize {
        self.state().queued.len()
    }

    /// Evaluate queued requests as of `now` and deliver the results.
    pub fn pump_at(&self, sink: &dyn EventSink, now: SystemTime) -> usize {
        let results: Vec<ValidationResult> = {
            let mut state = self.state();
            let queued: Vec<_> = state.queued.drain(..).collect();
            queued
                .into_iter()
                .map(|(identity, ticket)| {
                    let verdict = self.authority.verify(identity, &ticket, now);
                    let (owner, outcome) = match verdict {
                        Ok(_) if state.active.contains(&identity) => {
                            (identity, ValidationOutcome::DuplicateSession)
                        }
                        Ok(owner) => {
                            state.active.insert(identity);
                            (owner, ValidationOutcome::Ok)
                        }
                        Err(outcome) => (identity, outcome),
                    };
                    tracing::debug!("Validated ticket for {}: {:?}", identity, outcome);
                    ValidationResult {
                        identity,
                        owner,
                        outcome,
                    }
                })
                .collect()
        };

        let delivered = results.len();
        for result in results {
            sink.on_validation_result(result);
        }
        delivered
    }
}

impl TicketValidator for AuthorityValidator {
    fn begin_validate(&self, identity: Identity, ticket: Vec<u8>) {
        tracing::debug!("Queued {}-byte ticket for {}", ticket.len(), identity);
        self.state().queued.push_back((identity, ticket));
    }

    fn end_validate_session(&self, identity: Identity) {
        let mut state = self.state();
        state.queued.retain(|(queued, _)| *queued != identity);
        if state.active.remove(&identity) {
            tracing::info!("Ended validation session for {}", identity);
        }
    }
}

impl CallbackSource for AuthorityValidator {
    fn pump(&self, sink: &dyn EventSink) -> usize {
        self.pump_at(sink, SystemTime::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use crate::transport::StatusChange;

    const PLAYER: Identity = Identity(76_561_198_000_000_001);
    const FRIEND: Identity = Identity(76_561_198_000_000_002);

    fn authority() -> TicketAuthority {
        TicketAuthority::new("test-key", Duration::from_secs(300)).unwrap()
    }

    #[derive(Default)]
    struct Results(RefCell<Vec<ValidationResult>>);

    impl EventSink for Results {
        fn on_status_changed(&self, _change: StatusChange) {}

        fn on_validation_result(&self, result: ValidationResult) {
            self.0.borrow_mut().push(result);
        }
    }

    #[test]
    fn test_empty_key_rejected() {
        assert_eq!(
            TicketAuthority::new("", Duration::from_secs(1)).unwrap_err(),
            TicketError::InvalidKey
        );
    }

    #[test]
    fn test_issued_ticket_verifies() {
        let authority = authority();
        let now = SystemTime::now();
        let ticket = authority.issue(PLAYER, PLAYER, now).unwrap();

        assert_eq!(ticket.len(), TICKET_LEN);
        assert_eq!(&ticket[..8], &PLAYER.0.to_be_bytes());
        assert_eq!(authority.verify(PLAYER, &ticket, now), Ok(PLAYER));
    }

    #[test]
    fn test_tickets_are_unique() {
        let authority = authority();
        let now = SystemTime::now();
        let a = authority.issue(PLAYER, PLAYER, now).unwrap();
        let b = authority.issue(PLAYER, PLAYER, now).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_owner_is_reported() {
        let authority = authority();
        let now = SystemTime::now();
        let ticket = authority.issue(PLAYER, FRIEND, now).unwrap();
        assert_eq!(authority.verify(PLAYER, &ticket, now), Ok(FRIEND));
    }

    #[test]
    fn test_tampered_ticket_rejected() {
        let authority = authority();
        let now = SystemTime::now();
        let mut ticket = authority.issue(PLAYER, PLAYER, now).unwrap();
        ticket[9] ^= 0x01;
        assert_eq!(
            authority.verify(PLAYER, &ticket, now),
            Err(ValidationOutcome::InvalidTicket)
        );
        assert_eq!(
            authority.verify(PLAYER, b"abc", now),
            Err(ValidationOutcome::InvalidTicket)
        );
    }

    #[test]
    fn test_foreign_key_rejected() {
        let now = SystemTime::now();
        let ticket = authority().issue(PLAYER, PLAYER, now).unwrap();
        let other = TicketAuthority::new("other-key", Duration::from_secs(300)).unwrap();
        assert_eq!(
            other.verify(PLAYER, &ticket, now),
            Err(ValidationOutcome::InvalidTicket)
        );
    }

    #[test]
    fn test_identity_mismatch() {
        let authority = authority();
        let now = SystemTime::now();
        let ticket = authority.issue(PLAYER, PLAYER, now).unwrap();
        assert_eq!(
            authority.verify(FRIEND, &ticket, now),
            Err(ValidationOutcome::IdentityMismatch)
        );
    }

    #[test]
    fn test_expired_ticket() {
        let authority = authority();
        let issued = SystemTime::now();
        let ticket = authority.issue(PLAYER, PLAYER, issued).unwrap();

        let within = issued + Duration::from_secs(299);
        let after = issued + Duration::from_secs(301);
        assert!(authority.verify(PLAYER, &ticket, within).is_ok());
        assert_eq!(
            authority.verify(PLAYER, &ticket, after),
            Err(ValidationOutcome::Expired)
        );
    }

    #[test]
    fn test_issuer_cancel() {
        let mut issuer = TicketIssuer::new(authority(), PLAYER, PLAYER);
        assert!(!issuer.cancel());
        issuer.issue().unwrap();
        assert!(issuer.is_active());
        assert!(issuer.cancel());
        assert!(!issuer.is_active());
    }

    #[test]
    fn test_validator_delivers_on_pump_only() {
        let validator = AuthorityValidator::new(authority());
        let ticket = authority().issue(PLAYER, PLAYER, SystemTime::now()).unwrap();
        let sink = Results::default();

        validator.begin_validate(PLAYER, ticket);
        assert!(sink.0.borrow().is_empty());
        assert_eq!(validator.queued(), 1);

        assert_eq!(validator.pump(&sink), 1);
        assert_eq!(
            sink.0.borrow()[0],
            ValidationResult {
                identity: PLAYER,
                owner: PLAYER,
                outcome: ValidationOutcome::Ok,
            }
        );
        assert!(validator.has_session(PLAYER));
        assert_eq!(validator.pump(&sink), 0);
    }

    #[test]
    fn test_validator_refuses_duplicate_session() {
        let validator = AuthorityValidator::new(authority());
        let sink = Results::default();

        for _ in 0..2 {
            let ticket = authority().issue(PLAYER, PLAYER, SystemTime::now()).unwrap();
            validator.begin_validate(PLAYER, ticket);
        }
        validator.pump(&sink);

        let outcomes: Vec<_> = sink.0.borrow().iter().map(|r| r.outcome).collect();
        assert_eq!(
            outcomes,
            vec![ValidationOutcome::Ok, ValidationOutcome::DuplicateSession]
        );
        assert_eq!(validator.active_sessions(), 1);

        validator.end_validate_session(PLAYER);
        validator.end_validate_session(PLAYER);
        assert_eq!(validator.active_sessions(), 0);
    }

    #[test]
    fn test_end_session_drops_queued_request() {
        let validator = AuthorityValidator::new(authority());
        let ticket = authority().issue(PLAYER, PLAYER, SystemTime::now()).unwrap();
        let sink = Results::default();

        validator.begin_validate(PLAYER, ticket);
        validator.end_validate_session(PLAYER);

        assert_eq!(validator.pump(&sink), 0);
        assert!(!validator.has_session(PLAYER));
    }

    #[test]
    fn test_validator_reports_failures() {
        let validator = AuthorityValidator::new(authority());
        let sink = Results::default();

        validator.begin_validate(PLAYER, b"abc".to_vec());
        validator.pump(&sink);

        assert_eq!(sink.0.borrow()[0].outcome, ValidationOutcome::InvalidTicket);
        assert_eq!(validator.active_sessions(), 0);
    }
}
