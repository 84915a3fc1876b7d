use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::fmt;
use uuid::Uuid;

/// Errors raised when parsing or constructing identifiers.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum IdError {
    #[snafu(display("namespace must not be empty"))]
    EmptyNamespace,

    #[snafu(display("entity id must not be empty"))]
    EmptyId,

    #[snafu(display("'{}' is not allowed inside an id component: {:?}", forbidden, component))]
    ForbiddenCharacter { forbidden: char, component: String },

    #[snafu(display("expected canonical '<ns>/<id>' form, got {:?}", input))]
    NotCanonical { input: String },

    #[snafu(display("expected event-target '<ns>:<id>' form, got {:?}", input))]
    NotEventTarget { input: String },
}

fn check_component(component: &str) -> Result<(), IdError> {
    for forbidden in ['/', ':'] {
        if component.contains(forbidden) {
            return Err(IdError::ForbiddenCharacter {
                forbidden,
                component: component.to_string(),
            });
        }
    }
    Ok(())
}

/// The stable identity of an entity: `(namespace, local id)`.
///
/// Two serialized forms exist and are never mixed:
///
/// * canonical `"ns/id"`: entity ids everywhere in storage and in APIs
/// * event-target `"ns:id"`: the `target` field of recorded events
///
/// Parsing is strict per form; a canonical string never parses as an event
/// target and vice versa.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId {
    ns: String,
    id: String,
}

impl EntityId {
    /// Construct from namespace and local id.
    pub fn new(ns: impl Into<String>, id: impl Into<String>) -> Result<Self, IdError> {
        let ns = ns.into();
        let id = id.into();
        if ns.is_empty() {
            return Err(IdError::EmptyNamespace);
        }
        if id.is_empty() {
            return Err(IdError::EmptyId);
        }
        check_component(&ns)?;
        check_component(&id)?;
        Ok(Self { ns, id })
    }

    /// Generate a fresh id in `ns` with a random local part.
    pub fn generate(ns: impl Into<String>) -> Result<Self, IdError> {
        Self::new(ns, Uuid::new_v4().simple().to_string())
    }

    /// The namespace component.
    pub fn namespace(&self) -> &str {
        &self.ns
    }

    /// The local id component.
    pub fn local_id(&self) -> &str {
        &self.id
    }

    /// Canonical `"ns/id"` form.
    pub fn canonical(&self) -> String {
        format!("{}/{}", self.ns, self.id)
    }

    /// Event-target `"ns:id"` form.
    pub fn event_target(&self) -> String {
        format!("{}:{}", self.ns, self.id)
    }

    /// Parse the canonical `"ns/id"` form. The `"ns:id"` form is rejected.
    pub fn parse_canonical(input: &str) -> Result<Self, IdError> {
        match input.split_once('/') {
            Some((ns, id)) if !ns.contains(':') && !id.contains('/') => Self::new(ns, id)
                .map_err(|_| IdError::NotCanonical {
                    input: input.to_string(),
                }),
            _ => Err(IdError::NotCanonical {
                input: input.to_string(),
            }),
        }
    }

    /// Parse the event-target `"ns:id"` form. The `"ns/id"` form is rejected.
    pub fn parse_event_target(input: &str) -> Result<Self, IdError> {
        match input.split_once(':') {
            Some((ns, id)) if !ns.contains('/') && !id.contains(':') => Self::new(ns, id)
                .map_err(|_| IdError::NotEventTarget {
                    input: input.to_string(),
                }),
            _ => Err(IdError::NotEventTarget {
                input: input.to_string(),
            }),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ns, self.id)
    }
}

/// A lexicographically sortable event identifier.
///
/// The id embeds the millisecond timestamp as a fixed-width hex prefix
/// followed by a random suffix, so sorting ids as strings sorts events by
/// `(ts, random)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Generate a fresh id for an event recorded at `ts` (ms since epoch).
    pub fn generate(ts: i64) -> Self {
        // 13 hex digits hold millisecond timestamps far beyond year 10000.
        Self(format!(
            "{:013x}-{}",
            ts.max(0),
            Uuid::new_v4().simple()
        ))
    }

    /// Wrap an existing identifier, e.g. read back from storage.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The raw string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
