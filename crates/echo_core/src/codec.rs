//! Opaque encode/decode service keyed by type name.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;

/// Encodes and decodes values of one message type.
pub trait Codec<T>: Send + Sync {
    /// Fully-qualified name of the encoded type, e.g. `echo.pipeline.EchoEnvelope`.
    fn type_name(&self) -> &str;

    fn encode(&self, value: &T) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON codec backed by `serde_json`.
pub struct JsonCodec<T> {
    type_name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub const fn new(type_name: &'static str) -> Self {
        Self {
            type_name,
            _marker: PhantomData,
        }
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn type_name(&self) -> &str {
        self.type_name
    }

    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl<T> std::fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonCodec")
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Serde helper storing `Vec<u8>` as standard base64 inside JSON.
pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// [`base64_bytes`] for optional fields.
pub(crate) mod base64_bytes_opt {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| {
                STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Blob {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    }

    #[test]
    fn test_json_codec() {
        let codec: JsonCodec<Blob> = JsonCodec::new("test.Blob");
        let blob = Blob {
            data: vec![0, 1, 255],
        };
        let bytes = codec.encode(&blob).unwrap();
        assert_eq!(std::str::from_utf8(&bytes).unwrap(), r#"{"data":"AAH/"}"#);
        assert_eq!(codec.decode(&bytes).unwrap(), blob);
        assert_eq!(codec.type_name(), "test.Blob");
    }

    #[test]
    fn test_decode_garbage_fails() {
        let codec: JsonCodec<Blob> = JsonCodec::new("test.Blob");
        assert!(codec.decode(b"not json").is_err());
    }
}
