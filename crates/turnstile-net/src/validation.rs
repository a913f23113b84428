//! Server-side ticket validation collaborator interface.
//!
//! Validation is fire-and-forget: [`TicketValidator::begin_validate`] returns
//! immediately and the [`ValidationResult`] arrives later through the
//! callback pump (see [`crate::events`]). The result carries identities only,
//! never a connection handle.

use crate::identity::Identity;

/// Outcome reported by the ticket subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// The ticket is genuine and was issued to the claimed identity.
    Ok,
    /// Bad length or signature.
    InvalidTicket,
    /// The ticket was issued to a different identity.
    IdentityMismatch,
    /// The ticket outlived its lifetime.
    Expired,
    /// A session is already active for this identity.
    DuplicateSession,
}

impl ValidationOutcome {
    /// Whether the ticket was accepted.
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

/// Asynchronous validation result: `(identity, owner, outcome)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationResult {
    /// Identity the ticket was validated against.
    pub identity: Identity,
    /// Identity that owns the license the ticket grants.
    pub owner: Identity,
    /// Verdict.
    pub outcome: ValidationOutcome,
}

impl ValidationResult {
    /// Whether the owner differs from the presenting identity.
    pub fn owner_mismatch(&self) -> bool {
        self.identity != self.owner
    }
}

/// External ticket-validation service as seen by the gateway.
pub trait TicketValidator: Send + Sync {
    /// Start validating `ticket` for `identity`. The verdict is delivered later.
    fn begin_validate(&self, identity: Identity, ticket: Vec<u8>);

    /// Terminate the validation session for `identity`. Idempotent.
    fn end_validate_session(&self, identity: Identity);
}
