//! Wire types published by the Event Broker to websocket subscribers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Topics the broker multiplexes to websocket clients.
///
/// Like [`crate::ServiceClass`], this is intentionally a closed enum: unlike
/// backend kinds, the set of UI-facing topics is part of the broker's public
/// contract and is not meant to be extended by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Progress,
    Users,
    Gpu,
    Download,
    Message,
    Service,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Progress => "progress",
            Topic::Users => "users",
            Topic::Gpu => "gpu",
            Topic::Download => "download",
            Topic::Message => "message",
            Topic::Service => "service",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A broker payload: a topic, an ephemerality flag, and opaque JSON data.
///
/// Non-ephemeral packets overwrite the broker's per-topic last-value cache;
/// ephemeral packets (e.g. one-off `message` toasts) are broadcast without
/// being cached, so a `reqInit` replay never resurrects them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub topic: Topic,
    #[serde(default)]
    pub ephemeral: bool,
    pub data: serde_json::Value,
}

impl Packet {
    pub fn new(topic: Topic, data: serde_json::Value) -> Self {
        Self { topic, ephemeral: false, data }
    }

    pub fn ephemeral(topic: Topic, data: serde_json::Value) -> Self {
        Self { topic, ephemeral: true, data }
    }
}

/// Emitted by the Service Queue whenever its observable state changes.
///
/// `service_type` is `ServiceClass::Ignore` for depth-only updates produced
/// by the debounce logic (see [`crate::ServiceClass::Ignore`]); in every
/// other case it is the queue's new `current` value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueUpdate {
    pub service_type: crate::ServiceClass,
    pub wait_type: crate::ServiceClass,
    pub queue_depth: usize,
}

impl QueueUpdate {
    pub fn new(service_type: crate::ServiceClass, wait_type: crate::ServiceClass, queue_depth: usize) -> Self {
        Self { service_type, wait_type, queue_depth }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Topic::Progress).unwrap(), "\"progress\"");
    }

    #[test]
    fn ephemeral_packet_round_trips() {
        let p = Packet::ephemeral(Topic::Message, serde_json::json!({"text": "hi"}));
        let s = serde_json::to_string(&p).unwrap();
        let back: Packet = serde_json::from_str(&s).unwrap();
        assert!(back.ephemeral);
        assert_eq!(back.topic, Topic::Message);
    }
}
