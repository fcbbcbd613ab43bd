//! Raw samples as handed over by the transport.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ArchiverError, ArchiverResult};

/// Size of the big-endian length header used by [`FrameFormat::LengthPrefixed`].
pub const LENGTH_HEADER_BYTES: usize = 4;

/// An opaque, time-stamped chunk of bytes received from the source.
///
/// Cloning is cheap: the payload is reference counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSample {
    payload: Bytes,
    arrived_at: DateTime<Utc>,
}

impl RawSample {
    /// Create a sample from its payload and arrival time.
    pub fn new(payload: impl Into<Bytes>, arrived_at: DateTime<Utc>) -> Self {
        Self {
            payload: payload.into(),
            arrived_at,
        }
    }

    /// Create a sample stamped with the current time.
    pub fn now(payload: impl Into<Bytes>) -> Self {
        Self::new(payload, Utc::now())
    }

    /// Raw bytes as received.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// When the transport handed the chunk over.
    pub fn arrived_at(&self) -> DateTime<Utc> {
        self.arrived_at
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Structural check applied to every chunk before it is buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameFormat {
    /// Any non-empty chunk is accepted.
    #[default]
    Opaque,
    /// Chunk must start with a 4-byte big-endian length equal to the remaining bytes.
    LengthPrefixed,
}

impl FrameFormat {
    /// Validate `sample` against this format.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiverError::TransportData`] describing the first structural problem.
    pub fn validate(&self, sample: &RawSample) -> ArchiverResult<()> {
        if sample.is_empty() {
            return Err(ArchiverError::TransportData("empty chunk".to_string()));
        }

        match self {
            FrameFormat::Opaque => Ok(()),
            FrameFormat::LengthPrefixed => {
                let payload = sample.payload();
                let Some(header) = payload.get(..LENGTH_HEADER_BYTES) else {
                    return Err(ArchiverError::TransportData(format!(
                        "chunk of {} bytes is shorter than the {LENGTH_HEADER_BYTES}-byte header",
                        payload.len()
                    )));
                };
                let mut raw = [0u8; LENGTH_HEADER_BYTES];
                raw.copy_from_slice(header);
                let declared = u32::from_be_bytes(raw) as usize;
                let actual = payload.len() - LENGTH_HEADER_BYTES;
                if declared != actual {
                    return Err(ArchiverError::TransportData(format!(
                        "header declares {declared} payload bytes, chunk carries {actual}"
                    )));
                }
                Ok(())
            }
        }
    }
}

/// What to do with a chunk that fails [`FrameFormat::validate`].
///
/// Chosen once at construction; the state machine never decides per sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedDataPolicy {
    /// Log and discard the chunk, stay in the current state.
    #[default]
    DropAndLog,
    /// Escalate to the `ConfigError` state.
    Halt,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(body: &[u8]) -> RawSample {
        let mut buf = (body.len() as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(body);
        RawSample::now(buf)
    }

    #[test]
    fn opaque_accepts_any_non_empty_chunk() {
        assert!(FrameFormat::Opaque.validate(&RawSample::now(&b"x"[..])).is_ok());
        assert!(FrameFormat::Opaque
            .validate(&RawSample::now(Bytes::new()))
            .is_err());
    }

    #[test]
    fn length_prefixed_checks_header() {
        let format = FrameFormat::LengthPrefixed;
        assert!(format.validate(&framed(b"hello")).is_ok());

        let mut truncated = framed(b"hello").payload().to_vec();
        truncated.pop();
        let err = format.validate(&RawSample::now(truncated)).unwrap_err();
        assert!(err.to_string().contains("declares 5"));

        assert!(format.validate(&RawSample::now(&b"\x00\x01"[..])).is_err());
    }

    #[test]
    fn policies_deserialize_from_snake_case() {
        let policy: MalformedDataPolicy = serde_json::from_str("\"halt\"").unwrap();
        assert_eq!(policy, MalformedDataPolicy::Halt);
        let format: FrameFormat = serde_json::from_str("\"length_prefixed\"").unwrap();
        assert_eq!(format, FrameFormat::LengthPrefixed);
    }
}
