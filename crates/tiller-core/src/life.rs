//! The entity lifecycle enum.
//!
//! Every managed entity (machine, unit, application, relation) carries a
//! `Life` value that only ever advances: Alive → Dying → Dead. The
//! ordering derived here is the monotonicity predicate; a transaction
//! asserting `life < target` can never move an entity backwards.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether an entity is Alive, Dying or Dead.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Life {
    /// The entity is in normal operation.
    #[default]
    Alive = 0,
    /// The entity has been asked to shut down and is winding up its
    /// responsibilities.
    Dying = 1,
    /// The entity is finished; dependent state may be cleaned up and the
    /// document removed.
    Dead = 2,
}

impl Life {
    /// Convert the value to its numeric representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Try to convert a numeric value to a `Life`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Alive),
            1 => Some(Self::Dying),
            2 => Some(Self::Dead),
            _ => None,
        }
    }

    /// Returns true if the entity is still alive.
    #[must_use]
    pub const fn is_alive(self) -> bool {
        matches!(self, Self::Alive)
    }

    /// Returns true if the entity has reached its terminal state.
    #[must_use]
    pub const fn is_dead(self) -> bool {
        matches!(self, Self::Dead)
    }

    /// Returns true if a transition from this value to `target` moves the
    /// lifecycle strictly forward.
    #[must_use]
    pub const fn can_advance_to(self, target: Self) -> bool {
        (self as u8) < (target as u8)
    }
}

impl fmt::Display for Life {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Alive => "alive",
            Self::Dying => "dying",
            Self::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_monotonic() {
        assert!(Life::Alive < Life::Dying);
        assert!(Life::Dying < Life::Dead);
        assert!(Life::Alive.can_advance_to(Life::Dying));
        assert!(Life::Alive.can_advance_to(Life::Dead));
        assert!(Life::Dying.can_advance_to(Life::Dead));
    }

    #[test]
    fn never_regresses() {
        assert!(!Life::Dead.can_advance_to(Life::Dying));
        assert!(!Life::Dead.can_advance_to(Life::Alive));
        assert!(!Life::Dying.can_advance_to(Life::Alive));
        assert!(!Life::Alive.can_advance_to(Life::Alive));
    }

    #[test]
    fn numeric_roundtrip() {
        for life in [Life::Alive, Life::Dying, Life::Dead] {
            assert_eq!(Life::from_u8(life.as_u8()), Some(life));
        }
        assert_eq!(Life::from_u8(3), None);
    }

    #[test]
    fn serde_snake_case() {
        let json = serde_json::to_string(&Life::Dying).unwrap();
        assert_eq!(json, "\"dying\"");
        let parsed: Life = serde_json::from_str("\"dead\"").unwrap();
        assert_eq!(parsed, Life::Dead);
    }
}
