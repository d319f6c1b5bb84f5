//! Local pending-sync marker.

use serde::{Deserialize, Serialize};

/// Tri-state marker recording whether a shadow record still has to be pushed.
///
/// The marker only exists on the local side; remote records carry no such field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChangeType {
    /// Local state matches the last synced remote state.
    #[default]
    NoChange,
    /// Created or modified locally since the last successful push.
    Updated,
    /// Deleted locally; the tombstone is kept until the remote delete succeeds.
    Deleted,
}

impl ChangeType {
    /// Converts to the numeric code stored in the `change_type` column.
    pub fn to_code(&self) -> i16 {
        match self {
            ChangeType::NoChange => 0,
            ChangeType::Updated => 1,
            ChangeType::Deleted => 2,
        }
    }

    /// Converts from the numeric column code.
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(ChangeType::NoChange),
            1 => Some(ChangeType::Updated),
            2 => Some(ChangeType::Deleted),
            _ => None,
        }
    }

    /// Returns true if the record still has to be pushed.
    pub fn is_pending(&self) -> bool {
        !matches!(self, ChangeType::NoChange)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_type_codes() {
        assert_eq!(ChangeType::NoChange.to_code(), 0);
        assert_eq!(ChangeType::Updated.to_code(), 1);
        assert_eq!(ChangeType::Deleted.to_code(), 2);

        assert_eq!(ChangeType::from_code(1), Some(ChangeType::Updated));
        assert_eq!(ChangeType::from_code(2), Some(ChangeType::Deleted));
        assert_eq!(ChangeType::from_code(3), None);
    }

    #[test]
    fn pending() {
        assert!(!ChangeType::NoChange.is_pending());
        assert!(ChangeType::Updated.is_pending());
        assert!(ChangeType::Deleted.is_pending());
        assert_eq!(ChangeType::default(), ChangeType::NoChange);
    }
}
