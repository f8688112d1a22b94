use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::borrow::Cow;
use std::fmt::Display;

/// Contains bytes of base64 encoded some other bytes.
///
/// Used for the `X-PAYMENT` header, which carries a base64-encoded JSON
/// payment proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Base64Bytes<'a>(pub Cow<'a, [u8]>);

/// Errors arising while decoding a base64 JSON payload.
#[derive(Debug, thiserror::Error)]
pub enum Base64JsonError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Base64Bytes<'_> {
    /// Decode base64 string bytes to raw binary payload.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        b64.decode(&self.0)
    }

    /// Encode raw binary input into base64 string bytes.
    pub fn encode<T: AsRef<[u8]>>(input: T) -> Base64Bytes<'static> {
        let encoded = b64.encode(input.as_ref());
        Base64Bytes(Cow::Owned(encoded.into_bytes()))
    }

    /// Decode the base64 payload and deserialize the inner JSON document.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, Base64JsonError> {
        let raw = self.decode()?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Serialize a value to JSON and base64-encode the result.
    pub fn encode_json<T: Serialize>(value: &T) -> Result<Base64Bytes<'static>, Base64JsonError> {
        let raw = serde_json::to_vec(value)?;
        Ok(Self::encode(raw))
    }
}

impl AsRef<[u8]> for Base64Bytes<'_> {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl<'a> From<&'a [u8]> for Base64Bytes<'a> {
    fn from(slice: &'a [u8]) -> Self {
        Base64Bytes(Cow::Borrowed(slice))
    }
}

impl<'a> From<&'a str> for Base64Bytes<'a> {
    fn from(s: &'a str) -> Self {
        Base64Bytes(Cow::Borrowed(s.as_bytes()))
    }
}

impl Display for Base64Bytes<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.0.as_ref()))
    }
}
