use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable local handle for a remote peer.
///
/// Allocated only by the recipient store and never reused. Other stores use it
/// as their foreign key; when a recipient is absorbed by a merge the old id keeps
/// resolving to the surviving one through the store's redirect table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipientId(u64);

impl RecipientId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecipientId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|_| crate::Error::InvalidIdentifier(format!("recipient id {:?}", s)))
    }
}
