use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uid_type {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Returns the underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

uid_type!(
    /// Correlates exactly one outstanding call with exactly one reply.
    ///
    /// Identifiers are random 128-bit values, which makes them unique across all threads of a
    /// process and not just among the tasks outstanding on a single thread.
    TaskUid
);

uid_type!(
    /// Identifies the controller-side handle of a single worker.
    ThreadUid
);

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_task_uids_are_unique() {
        let uids: HashSet<_> = (0..1000).map(|_| TaskUid::new()).collect();
        assert_eq!(uids.len(), 1000);
    }

    #[test]
    fn test_uid_display_matches_uuid() {
        let uuid = Uuid::new_v4();
        assert_eq!(TaskUid::from(uuid).to_string(), uuid.to_string());
    }
}
