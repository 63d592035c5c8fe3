//! The `[function, job_id, data]` message body.

use serde_json::Value;

use crate::codec::ProtocolError;

/// Body of every protocol message.
///
/// Serialized as a three-element JSON array, UTF-8 encoded. Workers only
/// accept the array form.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Remote function name, or one of the reserved names.
    pub function: String,
    /// Caller-supplied job identity echoed back by the worker.
    pub job_id: String,
    /// Function arguments (requests) or return values (responses).
    pub data: Value,
}

impl Envelope {
    #[must_use]
    pub fn new(function: impl Into<String>, job_id: impl Into<String>, data: Value) -> Self {
        Self {
            function: function.into(),
            job_id: job_id.into(),
            data,
        }
    }

    /// Serializes the envelope to its UTF-8 JSON payload.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Encode` if `data` cannot be serialized (only
    /// possible for maps with non-string keys, which `Value` cannot hold, so
    /// in practice this never fails).
    pub fn to_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(&(&self.function, &self.job_id, &self.data))
            .map_err(ProtocolError::Encode)
    }

    /// Parses a payload produced by [`Envelope::to_payload`] or by a worker.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidUtf8` if the bytes are not UTF-8 and
    /// `ProtocolError::Malformed` if they are not a `[string, string, any]`
    /// JSON array.
    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(payload).map_err(|_| ProtocolError::InvalidUtf8)?;
        let (function, job_id, data): (String, String, Value) =
            serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
        Ok(Self {
            function,
            job_id,
            data,
        })
    }
}
