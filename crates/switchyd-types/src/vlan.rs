//! IEEE 802.1Q VLAN identifier.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A validated VLAN id in the range 1..=4094.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct VlanId(u16);

impl VlanId {
    pub fn new(id: u16) -> Result<Self, ParseError> {
        if id == 0 || id > 4094 {
            return Err(ParseError::InvalidVlanId(id));
        }
        Ok(VlanId(id))
    }

    pub const fn get(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for VlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
