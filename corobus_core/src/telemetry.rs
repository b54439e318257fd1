use serde::{Deserialize, Serialize};

use crate::error::BusError;

/// Running counters for one bus.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    pub channels_opened: u64,
    pub channels_closed: u64,
    pub values_sent: u64,
    pub values_received: u64,
    pub suspensions: u64,
    pub wakeups: u64,
    pub would_block: u64,
    pub no_channel: u64,
    pub not_implemented: u64,
}

impl BusStats {
    pub(crate) fn record_error(&mut self, err: BusError) {
        match err {
            BusError::NoChannel => self.no_channel += 1,
            BusError::WouldBlock => self.would_block += 1,
            BusError::NotImplemented => self.not_implemented += 1,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
