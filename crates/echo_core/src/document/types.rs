//! The stored shape of an object inside a space document.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dxn::Dxn;
use crate::error::{EchoError, Result};

/// Whether an object is a plain object or a relation between two objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    #[default]
    Object,
    Relation,
}

/// System fields, owned by the database rather than the schema.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObjectSystem {
    #[serde(default)]
    pub kind: ObjectKind,
    /// Schema of the object's data.
    #[serde(rename = "type", default, with = "encoded_ref", skip_serializing_if = "Option::is_none")]
    pub type_ref: Option<Dxn>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, with = "encoded_ref", skip_serializing_if = "Option::is_none")]
    pub source: Option<Dxn>,
    #[serde(default, with = "encoded_ref", skip_serializing_if = "Option::is_none")]
    pub target: Option<Dxn>,
}

/// An identifier of the object in an external system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub source: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    #[serde(default)]
    pub keys: Vec<ForeignKey>,
}

/// An object as stored in a document: `{system, meta, data}`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObjectStructure {
    #[serde(default)]
    pub system: ObjectSystem,
    #[serde(default)]
    pub meta: ObjectMeta,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl ObjectStructure {
    /// A plain object of type `type_ref`.
    pub fn object(type_ref: Option<Dxn>, data: Map<String, Value>) -> Self {
        Self {
            system: ObjectSystem {
                type_ref,
                ..ObjectSystem::default()
            },
            meta: ObjectMeta::default(),
            data,
        }
    }

    /// A relation from `source` to `target`.
    pub fn relation(type_ref: Option<Dxn>, source: Dxn, target: Dxn, data: Map<String, Value>) -> Self {
        Self {
            system: ObjectSystem {
                kind: ObjectKind::Relation,
                type_ref,
                deleted: false,
                source: Some(source),
                target: Some(target),
            },
            meta: ObjectMeta::default(),
            data,
        }
    }

    pub fn is_relation(&self) -> bool {
        self.system.kind == ObjectKind::Relation
    }

    pub fn is_deleted(&self) -> bool {
        self.system.deleted
    }

    /// Encode for storage. References that would not survive their string
    /// form are rejected as [`EchoError::InvalidReference`].
    pub fn to_json(&self) -> Result<Value> {
        let system = &self.system;
        for dxn in [&system.type_ref, &system.source, &system.target]
            .into_iter()
            .flatten()
        {
            dxn.validate()?;
        }
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let structure: Self = serde_json::from_value(value.clone())?;
        if structure.is_relation()
            && (structure.system.source.is_none() || structure.system.target.is_none())
        {
            return Err(EchoError::InvalidReference(
                "relation is missing its source or target".to_string(),
            ));
        }
        Ok(structure)
    }
}

/// Serde adapter storing an optional [`Dxn`] as `{"/": "<dxn>"}`.
mod encoded_ref {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    use crate::dxn::Dxn;

    pub fn serialize<S: Serializer>(dxn: &Option<Dxn>, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = dxn
            .as_ref()
            .map(Dxn::to_encoded)
            .transpose()
            .map_err(serde::ser::Error::custom)?;
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Dxn>, D::Error> {
        let value = Option::<Value>::deserialize(deserializer)?;
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Dxn::from_encoded(&value)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}
