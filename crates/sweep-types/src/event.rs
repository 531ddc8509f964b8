use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RUN_STARTED: &str = "run_started";
pub const RUN_FINISHED: &str = "run_finished";
pub const RUN_FAILED: &str = "run_failed";
pub const DECRYPT_ERROR: &str = "decrypt_error";
pub const SELECTION_CHANGED: &str = "selection_changed";
pub const SERVER_CONNECTED: &str = "server_connected";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub properties: Value,
}

impl StatusEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
        }
    }

    pub fn is(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }
}
