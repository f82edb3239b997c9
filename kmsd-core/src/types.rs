//! Identifiers shared between the server and the protocol engine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-connection correlation id handed to the protocol engine.
///
/// The server seeds it from a random value and advances it by one for
/// every accepted connection. It wraps silently at `u32::MAX`, so a value
/// may repeat after 2^32 connections but never for two live connections.
///
/// # Examples
///
/// ```
/// use kmsd_core::AssociationGroupId;
///
/// let id = AssociationGroupId::new(u32::MAX);
/// assert_eq!(id.next().get(), 0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssociationGroupId(u32);

impl AssociationGroupId {
    /// Wrap a raw value.
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Raw value.
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The id following this one, wrapping at the 32-bit boundary.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Step to the next id in place and return it.
    pub fn advance(&mut self) -> Self {
        *self = self.next();
        *self
    }
}

impl From<u32> for AssociationGroupId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for AssociationGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
