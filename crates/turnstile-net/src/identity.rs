//! Connection handles and account identities.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque per-connection identifier issued by a transport.
///
/// Unique while the connection is open and never reused for another logical
/// connection within one transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Atomic generator for monotonically increasing [`ConnectionHandle`]s.
#[derive(Debug)]
pub struct HandleGenerator {
    next: AtomicU64,
}

impl HandleGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`ConnectionHandle`].
    pub fn next_handle(&self) -> ConnectionHandle {
        ConnectionHandle(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for HandleGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Account identity asserted by a transport or carried inside a ticket.
///
/// Zero is reserved as the invalid identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(pub u64);

impl Identity {
    /// The reserved invalid identity.
    pub const INVALID: Identity = Identity(0);

    /// Whether this identity can be authenticated at all.
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// Return `Some(self)` for valid identities.
    pub fn valid(self) -> Option<Self> {
        self.is_valid().then_some(self)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_uniqueness() {
        let handles = HandleGenerator::new();
        let h1 = handles.next_handle();
        let h2 = handles.next_handle();
        let h3 = handles.next_handle();
        assert_ne!(h1, h2);
        assert_eq!(h1.0 + 1, h2.0);
        assert_eq!(h2.0 + 1, h3.0);
    }

    #[test]
    fn test_zero_identity_is_invalid() {
        assert!(!Identity::INVALID.is_valid());
        assert_eq!(Identity(0).valid(), None);
        assert_eq!(Identity(42).valid(), Some(Identity(42)));
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectionHandle(7).to_string(), "#7");
        assert_eq!(Identity(99).to_string(), "99");
    }
}
