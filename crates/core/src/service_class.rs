//! The identity of whatever currently owns the GPU slot.
//!
//! `ServiceClass` is deliberately open-ended: new backend kinds are added by
//! constructing a new [`ServiceClass::Backend`] value, never by touching this
//! enum. The three sentinels (`None`, `Wait`, `Ignore`) are first-class
//! variants rather than magic constants layered on top of the backend set —
//! see the Open Questions in the design notes for why.

use crate::error::CoreError;
use smol_str::SmolStr;
use std::fmt;

/// Names a configured backend can't take: they collide with a sentinel's
/// [`ServiceClass::label`] or a reserved routing segment (`/q/ws`,
/// `/internal/free_complete`), either of which would make the `service`
/// websocket topic or the route table ambiguous.
const RESERVED_BACKEND_NAMES: [&str; 6] = ["none", "wait", "ignore", "q", "internal", "metrics"];

/// A service class: either a sentinel or an opaque, named backend kind.
///
/// Backend variants compare equal only by their name; the core never
/// interprets the name beyond that. `Ignore` never becomes the queue's
/// `current` state — it is only ever observed in a [`crate::QueueUpdate`] as
/// a marker meaning "depth changed, identity did not."
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", content = "name")]
pub enum ServiceClass {
    /// The GPU slot is idle; nobody owns it.
    None,
    /// Grace period after a body close, before the slot reverts to `None`.
    ///
    /// A `Wait` always remembers which concrete class it continues (see
    /// [`crate::QueueUpdate::wait_type`] and the `waited` field of the
    /// arbiter's internal state) so a same-user follow-up can cut in.
    Wait,
    /// Internal marker used only in [`crate::QueueUpdate`] notifications;
    /// never a valid value for `current`.
    Ignore,
    /// A concrete, named backend (e.g. "sd", "llm", "tts", "video").
    Backend(SmolStr),
}

impl ServiceClass {
    /// Construct a concrete backend class from its name.
    pub fn backend(name: impl Into<SmolStr>) -> Self {
        ServiceClass::Backend(name.into())
    }

    /// Validate a configured backend name, rejecting the empty string and
    /// anything that collides with a sentinel label or reserved routing
    /// segment (see [`RESERVED_BACKEND_NAMES`]).
    pub fn parse_backend_name(name: &str) -> Result<Self, CoreError> {
        if name.is_empty() || RESERVED_BACKEND_NAMES.contains(&name) {
            return Err(CoreError::InvalidServiceClass(name.to_string()));
        }
        Ok(ServiceClass::backend(name))
    }

    /// True for `None`.
    pub fn is_none(&self) -> bool {
        matches!(self, ServiceClass::None)
    }

    /// True for `Wait`.
    pub fn is_wait(&self) -> bool {
        matches!(self, ServiceClass::Wait)
    }

    /// True for a concrete backend (not a sentinel).
    pub fn is_backend(&self) -> bool {
        matches!(self, ServiceClass::Backend(_))
    }

    /// The backend name, if this is a concrete backend class.
    pub fn name(&self) -> Option<&str> {
        match self {
            ServiceClass::Backend(name) => Some(name.as_str()),
            _ => None,
        }
    }

    /// Human-readable label, used in logs and in the `service` websocket
    /// topic's description text.
    pub fn label(&self) -> &str {
        match self {
            ServiceClass::None => "none",
            ServiceClass::Wait => "wait",
            ServiceClass::Ignore => "ignore",
            ServiceClass::Backend(name) => name.as_str(),
        }
    }
}

impl fmt::Display for ServiceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl From<&str> for ServiceClass {
    fn from(s: &str) -> Self {
        ServiceClass::backend(s)
    }
}

impl From<String> for ServiceClass {
    fn from(s: String) -> Self {
        ServiceClass::backend(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_equality_is_by_name() {
        assert_eq!(ServiceClass::backend("llm"), ServiceClass::backend("llm"));
        assert_ne!(ServiceClass::backend("llm"), ServiceClass::backend("sd"));
    }

    #[test]
    fn sentinels_are_distinct_from_backends() {
        assert_ne!(ServiceClass::None, ServiceClass::backend("none"));
        assert_ne!(ServiceClass::Wait, ServiceClass::Ignore);
    }

    #[test]
    fn label_and_display_agree() {
        let c = ServiceClass::backend("llm");
        assert_eq!(c.label(), c.to_string());
    }

    #[test]
    fn parse_backend_name_rejects_reserved_and_empty_names() {
        assert!(ServiceClass::parse_backend_name("llm").is_ok());
        assert!(ServiceClass::parse_backend_name("").is_err());
        assert!(ServiceClass::parse_backend_name("none").is_err());
        assert!(ServiceClass::parse_backend_name("internal").is_err());
        assert!(ServiceClass::parse_backend_name("metrics").is_err());
    }

    #[cfg(feature = "test-support")]
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn any_backend_name_round_trips_through_json(name in "[a-z][a-z0-9_]{0,15}") {
                let class = ServiceClass::backend(name.clone());
                let json = serde_json::to_string(&class).unwrap_or_default();
                let back: ServiceClass = serde_json::from_str(&json).unwrap_or(ServiceClass::None);
                prop_assert_eq!(back, ServiceClass::backend(name));
            }
        }
    }
}
