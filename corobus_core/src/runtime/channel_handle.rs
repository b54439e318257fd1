use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Small integer naming a channel slot on a [`Bus`](crate::Bus).
///
/// A handle says nothing about which channel currently sits in the slot;
/// slots are reused after a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelHandle {
    pub id: usize,
}

impl ChannelHandle {
    pub fn new(id: usize) -> Self {
        Self { id }
    }
}

impl Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.id)
    }
}
