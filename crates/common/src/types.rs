use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque reference to the game object that owns a piece of spatial data.
///
/// The spatial system never dereferences it; it only hands it back to the
/// caller in query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build an id from a raw 128-bit value (deterministic ids for tests and tools).
    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// Short hex prefix used in log and inspector output.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_owned()
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_uniqueness() {
        let a = EntityId::new();
        let b = EntityId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn entity_id_from_raw_is_stable() {
        assert_eq!(EntityId::from_u128(7), EntityId::from_u128(7));
        assert_ne!(EntityId::from_u128(7), EntityId::from_u128(8));
    }

    #[test]
    fn short_form_has_eight_chars() {
        let id = EntityId::from_u128(0xdead_beef_0000_0000_0000_0000_0000_0000);
        assert_eq!(id.short(), "deadbeef");
        assert_eq!(format!("{id}"), "deadbeef");
    }
}
