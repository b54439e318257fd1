use serde::{Deserialize, Serialize};

/// Bus settings. Every field has a default, so a partial JSON document is
/// enough to override one of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Registry slots reserved when the bus is created.
    pub initial_slots: usize,
    /// Enables `send_v`/`recv_v` and their non-blocking forms.
    pub batch: bool,
    /// Enables `broadcast`/`try_broadcast`.
    pub broadcast: bool,
    /// Keeps the [`BusStats`](crate::BusStats) counters up to date.
    pub telemetry: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            initial_slots: 0,
            batch: true,
            broadcast: true,
            telemetry: true,
        }
    }
}

impl BusConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_initial_slots(mut self, slots: usize) -> Self {
        self.initial_slots = slots;
        self
    }

    pub fn with_batch(mut self, enabled: bool) -> Self {
        self.batch = enabled;
        self
    }

    pub fn with_broadcast(mut self, enabled: bool) -> Self {
        self.broadcast = enabled;
        self
    }

    pub fn with_telemetry(mut self, enabled: bool) -> Self {
        self.telemetry = enabled;
        self
    }
}
