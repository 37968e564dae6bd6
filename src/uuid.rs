//! UUID wrapper with fast random generation.
//!
//! Thin wrapper around `uuid::Uuid` that generates v4 values from `fastrand`
//! instead of a cryptographically secure generator. Used for device ids and
//! the demo provider's correlation tokens; not suitable where UUID
//! predictability must be prevented.

use std::{fmt, ops::Deref, str::FromStr};

/// A wrapper around `uuid::Uuid`; derefs to the underlying type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uuid(pub uuid::Uuid);

impl Deref for Uuid {
    type Target = uuid::Uuid;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Uuid {
    /// Generates a new random UUID v4 using a fast random number generator.
    #[must_use]
    pub fn fast_v4() -> Self {
        let random_bytes = fastrand::u128(..).to_ne_bytes();
        let uuid = uuid::Builder::from_random_bytes(random_bytes).into_uuid();
        Self(uuid)
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Uuid {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::from_str(s).map(Self)
    }
}

impl From<Uuid> for uuid::Uuid {
    fn from(value: Uuid) -> Self {
        *value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_string() {
        let uuid = Uuid::fast_v4();
        let parsed = Uuid::from_str(&uuid.to_string()).unwrap();
        assert_eq!(uuid, parsed);
    }
}
