//! Common data types for Relay components.
//!
//! Identifiers handed out to signaling peers are UUIDs and serialize as
//! plain strings, so they round-trip through JSON payloads unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random identifier
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a connected signaling peer
    PeerId
);

uuid_id!(
    /// Unique identifier for a transport allocated by the media engine
    TransportId
);

uuid_id!(
    /// Unique identifier for a published media stream (engine producer)
    ProducerId
);

uuid_id!(
    /// Unique identifier for a per-viewer read handle (engine consumer)
    ConsumerId
);
