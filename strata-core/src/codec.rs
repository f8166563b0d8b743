//! Serialization seam between typed events/state and stored bytes.

use serde::{Serialize, de::DeserializeOwned};

/// Turns typed values into bytes for the event log and snapshot store.
pub trait Codec: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// # Errors
    ///
    /// Returns a codec error if the value cannot be encoded.
    fn serialize<T>(&self, value: &T) -> Result<Vec<u8>, Self::Error>
    where
        T: Serialize;

    /// # Errors
    ///
    /// Returns a codec error if the bytes do not decode into `T`.
    fn deserialize<T>(&self, data: &[u8]) -> Result<T, Self::Error>
    where
        T: DeserializeOwned;
}

/// JSON codec backed by `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    type Error = serde_json::Error;

    fn serialize<T>(&self, value: &T) -> Result<Vec<u8>, Self::Error>
    where
        T: Serialize,
    {
        serde_json::to_vec(value)
    }

    fn deserialize<T>(&self, data: &[u8]) -> Result<T, Self::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_codec_rejects_wrong_shape() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct Deposited {
            amount: i64,
        }

        let result: Result<Deposited, _> = JsonCodec.deserialize(br#"{"wrong_field":123}"#);
        assert!(result.is_err());
    }

    #[test]
    fn json_codec_rejects_invalid_json() {
        let result: Result<u64, _> = JsonCodec.deserialize(b"not valid json");
        assert!(result.is_err());
    }
}
