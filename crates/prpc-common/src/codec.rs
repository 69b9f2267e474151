use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{PrpcError, Result};

/// Payload serialization advertised by a server in its registry record.
///
/// The numeric values are part of the registry record format and must not
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SerializeType {
    None = 0,
    #[default]
    MsgPack = 1,
    Json = 2,
}

impl From<SerializeType> for u8 {
    fn from(styp: SerializeType) -> Self {
        styp as u8
    }
}

impl TryFrom<u8> for SerializeType {
    type Error = PrpcError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SerializeType::None),
            1 => Ok(SerializeType::MsgPack),
            2 => Ok(SerializeType::Json),
            other => Err(PrpcError::UnsupportedSerializer(other)),
        }
    }
}

/// Codec for encoding/decoding RPC payloads.
///
/// The caller picks the codec per connection from the server's advertised
/// [`SerializeType`]. MsgPack encodes structs as maps so field names survive,
/// which keeps both codecs interchangeable for the same Rust types.
///
/// # Example
///
/// ```
/// use prpc_common::codec::Codec;
///
/// let codec = Codec::MsgPack;
/// let encoded = codec.encode(&(2, 3)).unwrap();
/// let decoded: (i32, i32) = codec.decode(&encoded).unwrap();
/// assert_eq!(decoded, (2, 3));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    MsgPack,
    Json,
}

impl Codec {
    /// Resolves the codec for a serialize type.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedSerializer` for [`SerializeType::None`].
    pub fn for_type(styp: SerializeType) -> Result<Self> {
        match styp {
            SerializeType::MsgPack => Ok(Codec::MsgPack),
            SerializeType::Json => Ok(Codec::Json),
            SerializeType::None => Err(PrpcError::UnsupportedSerializer(styp.into())),
        }
    }

    pub fn serialize_type(&self) -> SerializeType {
        match self {
            Codec::MsgPack => SerializeType::MsgPack,
            Codec::Json => SerializeType::Json,
        }
    }

    /// Encode a value to bytes
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Codec::MsgPack => Ok(rmp_serde::to_vec_named(value)?),
            Codec::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    /// Decode a value from bytes
    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self {
            Codec::MsgPack => Ok(rmp_serde::from_slice(data)?),
            Codec::Json => Ok(serde_json::from_slice(data)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Args {
        a: i64,
        b: i64,
    }

    #[test]
    fn test_msgpack_round_trip() {
        let codec = Codec::MsgPack;
        let encoded = codec.encode(&Args { a: 2, b: 3 }).unwrap();
        let decoded: Args = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, Args { a: 2, b: 3 });
    }

    #[test]
    fn test_json_round_trip() {
        let codec = Codec::Json;
        let encoded = codec.encode(&Args { a: -1, b: 7 }).unwrap();
        assert_eq!(encoded, br#"{"a":-1,"b":7}"#);
        let decoded: Args = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, Args { a: -1, b: 7 });
    }

    #[test]
    fn test_msgpack_keeps_field_names() {
        // A map-encoded struct decodes into a struct with fields in another order.
        #[derive(Debug, Deserialize, PartialEq)]
        struct Reordered {
            b: i64,
            a: i64,
        }

        let encoded = Codec::MsgPack.encode(&Args { a: 1, b: 2 }).unwrap();
        let decoded: Reordered = Codec::MsgPack.decode(&encoded).unwrap();
        assert_eq!(decoded, Reordered { b: 2, a: 1 });
    }

    #[test]
    fn test_invalid_data_returns_error() {
        let result: Result<Args> = Codec::Json.decode(&[0xFF, 0x00]);
        assert!(result.is_err());
        let result: Result<Args> = Codec::MsgPack.decode(&[0xC1]);
        assert!(result.is_err());
    }

    #[test]
    fn test_serialize_type_mapping() {
        assert_eq!(Codec::for_type(SerializeType::Json).unwrap(), Codec::Json);
        assert_eq!(Codec::for_type(SerializeType::MsgPack).unwrap(), Codec::MsgPack);
        assert!(matches!(
            Codec::for_type(SerializeType::None),
            Err(PrpcError::UnsupportedSerializer(0))
        ));
        assert_eq!(SerializeType::try_from(2u8).unwrap(), SerializeType::Json);
        assert!(SerializeType::try_from(9u8).is_err());
    }

    #[test]
    fn test_defaults_agree() {
        assert_eq!(Codec::default(), Codec::MsgPack);
        assert_eq!(Codec::for_type(SerializeType::default()).unwrap(), Codec::default());
        assert_eq!(Codec::default().serialize_type(), SerializeType::default());
    }

    #[test]
    fn test_serialize_type_is_numeric_in_json() {
        let json = serde_json::to_string(&SerializeType::Json).unwrap();
        assert_eq!(json, "2");
        let parsed: SerializeType = serde_json::from_str("1").unwrap();
        assert_eq!(parsed, SerializeType::MsgPack);
    }
}
