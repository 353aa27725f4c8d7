//! Typed references (DXNs) and their encoded JSON form.
//!
//! String forms:
//!
//! - `dxn:type:<typename>[:<version>]`
//! - `dxn:echo:<space-id or @>:<object-id>` (`@` means the local space)
//! - `dxn:queue:<subspace>:<space-id>:<queue-id>[:<object-id>]`
//!
//! Inside documents a reference is stored as `{"/": "<dxn>"}`.
//!
//! Components are non-empty and never contain `:`. An echo reference to the
//! local space uses `space: None`; `@` is not a valid space id. Values built
//! through the `try_*` constructors (or parsed) always round-trip through
//! their string form. The enum fields are public, so hand-built values are
//! checked by [`Dxn::validate`] whenever they are serialized.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{EchoError, Result};
use crate::keys::ObjectId;

/// Key of the single field in an encoded reference.
pub const REFERENCE_KEY: &str = "/";

const PREFIX: &str = "dxn";
const LOCAL_SPACE: &str = "@";

/// A typed reference to a schema, an object or a queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dxn {
    /// A schema type, optionally pinned to a version.
    Type {
        typename: String,
        version: Option<String>,
    },
    /// An object, in the local space when `space` is `None`.
    Echo {
        space: Option<String>,
        object: ObjectId,
    },
    /// A queue, or one object inside it.
    Queue {
        subspace: String,
        space: String,
        queue: String,
        object: Option<ObjectId>,
    },
}

impl Dxn {
    /// Schema reference without validation. Prefer [`Dxn::try_type`] for
    /// typenames that are not literals.
    pub fn type_ref(typename: impl Into<String>) -> Self {
        Dxn::Type {
            typename: typename.into(),
            version: None,
        }
    }

    /// Reference to an object in the local space.
    pub fn local_object(object: ObjectId) -> Self {
        Dxn::Echo {
            space: None,
            object,
        }
    }

    pub fn try_type(typename: impl Into<String>, version: Option<String>) -> Result<Self> {
        let dxn = Dxn::Type {
            typename: typename.into(),
            version,
        };
        dxn.validate()?;
        Ok(dxn)
    }

    /// Object reference; `None` is the local space.
    pub fn try_echo(space: Option<String>, object: ObjectId) -> Result<Self> {
        let dxn = Dxn::Echo { space, object };
        dxn.validate()?;
        Ok(dxn)
    }

    pub fn try_queue(
        subspace: impl Into<String>,
        space: impl Into<String>,
        queue: impl Into<String>,
        object: Option<ObjectId>,
    ) -> Result<Self> {
        let dxn = Dxn::Queue {
            subspace: subspace.into(),
            space: space.into(),
            queue: queue.into(),
            object,
        };
        dxn.validate()?;
        Ok(dxn)
    }

    /// Check that the string form parses back to `self`.
    pub fn validate(&self) -> Result<()> {
        match self {
            Dxn::Type { typename, version } => {
                check_component("typename", typename)?;
                if let Some(version) = version {
                    check_component("version", version)?;
                }
            }
            Dxn::Echo { space, object } => {
                if let Some(space) = space {
                    if space == LOCAL_SPACE {
                        return Err(EchoError::InvalidReference(format!(
                            "'{}' is reserved for the local space; use no space id",
                            LOCAL_SPACE
                        )));
                    }
                    check_component("space", space)?;
                }
                check_component("object", object.as_str())?;
            }
            Dxn::Queue {
                subspace,
                space,
                queue,
                object,
            } => {
                check_component("subspace", subspace)?;
                check_component("space", space)?;
                check_component("queue", queue)?;
                if let Some(object) = object {
                    check_component("object", object.as_str())?;
                }
            }
        }
        Ok(())
    }

    /// The referenced object id, for echo and queue-object references.
    pub fn object_id(&self) -> Option<&ObjectId> {
        match self {
            Dxn::Echo { object, .. } => Some(object),
            Dxn::Queue { object, .. } => object.as_ref(),
            Dxn::Type { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Dxn::Type { .. } => "type",
            Dxn::Echo { .. } => "echo",
            Dxn::Queue { .. } => "queue",
        }
    }

    /// Encode as `{"/": "<dxn>"}`.
    pub fn to_encoded(&self) -> Result<Value> {
        self.validate()?;
        let mut map = Map::new();
        map.insert(REFERENCE_KEY.to_string(), Value::String(self.to_string()));
        Ok(Value::Object(map))
    }

    /// Decode an encoded reference.
    pub fn from_encoded(value: &Value) -> Result<Self> {
        let Some(map) = value.as_object() else {
            return Err(EchoError::InvalidReference(format!(
                "expected an object, got {}",
                value
            )));
        };
        if map.len() != 1 {
            return Err(EchoError::InvalidReference(format!(
                "encoded reference must have exactly one field, got {}",
                map.len()
            )));
        }
        match map.get(REFERENCE_KEY) {
            Some(Value::String(dxn)) => dxn.parse(),
            _ => Err(EchoError::InvalidReference(format!(
                "missing string field '{}'",
                REFERENCE_KEY
            ))),
        }
    }
}

fn check_component(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.contains(':') {
        return Err(EchoError::InvalidReference(format!(
            "DXN {} '{}' must be non-empty and must not contain ':'",
            what, value
        )));
    }
    Ok(())
}

/// Whether `value` has the shape of an encoded reference.
pub fn is_encoded_reference(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|map| map.len() == 1 && map.get(REFERENCE_KEY).is_some_and(Value::is_string))
}

impl fmt::Display for Dxn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dxn::Type { typename, version } => {
                write!(f, "{PREFIX}:type:{typename}")?;
                if let Some(version) = version {
                    write!(f, ":{version}")?;
                }
                Ok(())
            }
            Dxn::Echo { space, object } => {
                let space = space.as_deref().unwrap_or(LOCAL_SPACE);
                write!(f, "{PREFIX}:echo:{space}:{object}")
            }
            Dxn::Queue {
                subspace,
                space,
                queue,
                object,
            } => {
                write!(f, "{PREFIX}:queue:{subspace}:{space}:{queue}")?;
                if let Some(object) = object {
                    write!(f, ":{object}")?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for Dxn {
    type Err = EchoError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || EchoError::InvalidReference(format!("malformed DXN '{}'", s));
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 3 || parts[0] != PREFIX || parts.iter().any(|part| part.is_empty()) {
            return Err(invalid());
        }

        match (parts[1], &parts[2..]) {
            ("type", [typename]) => Ok(Dxn::Type {
                typename: typename.to_string(),
                version: None,
            }),
            ("type", [typename, version]) => Ok(Dxn::Type {
                typename: typename.to_string(),
                version: Some(version.to_string()),
            }),
            ("echo", [space, object]) => Ok(Dxn::Echo {
                space: (*space != LOCAL_SPACE).then(|| space.to_string()),
                object: ObjectId::from(*object),
            }),
            ("queue", [subspace, space, queue]) => Ok(Dxn::Queue {
                subspace: subspace.to_string(),
                space: space.to_string(),
                queue: queue.to_string(),
                object: None,
            }),
            ("queue", [subspace, space, queue, object]) => Ok(Dxn::Queue {
                subspace: subspace.to_string(),
                space: space.to_string(),
                queue: queue.to_string(),
                object: Some(ObjectId::from(*object)),
            }),
            _ => Err(invalid()),
        }
    }
}

impl Serialize for Dxn {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.validate().map_err(serde::ser::Error::custom)?;
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Dxn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
