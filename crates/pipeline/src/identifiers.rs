//! Newtype domain identifiers.
//!
//! Every domain concept that has an identity is represented as a distinct newtype
//! wrapping a primitive. This prevents accidentally interchanging a [`GroupKey`]
//! with a [`WorkflowName`] even though both are `String` under the hood.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identifiers, UUID-backed (internally generated)
// ---------------------------------------------------------------------------

/// Identifies a single run created by the controller for one trigger event.
///
/// Generated fresh for every accepted trigger, so two identical events still
/// produce two distinct runs. Propagated through spans and decisions so all
/// activity from a single run can be correlated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    /// Generates a new random run identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Identifiers, String-backed (configuration / derived keys)
// ---------------------------------------------------------------------------

string_id! {
    /// Name of the workflow whose runs the controller manages (e.g. `"ci"`).
    ///
    /// Forms the prefix of every concurrency group key.
    WorkflowName
}

string_id! {
    /// Correlation key grouping related runs so only the latest stays active.
    ///
    /// Derived as `<workflow>-<pull request head ref or run identifier>`; see
    /// [`crate::TriggerEvent::concurrency_group`].
    GroupKey
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_ids_reject_empty_values() {
        assert!(GroupKey::new("").is_none());
        assert!(WorkflowName::new(String::new()).is_none());
        assert_eq!(GroupKey::new("ci-topic").map(|g| g.to_string()), Some("ci-topic".to_string()));
    }

    #[test]
    fn random_run_ids_are_distinct() {
        let a = RunId::new_random();
        let b = RunId::new_random();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 36);
    }
}
