//! Dispatch/result protocol shared by the submission path, the job tracker
//! and the worker loop.
//!
//! Queue bodies are JSON. A dispatch message never carries an authoritative
//! attempt token: the canonical token is minted by the job tracker when a
//! worker claims the job. `attempt_token` on a dispatch message only records
//! which attempt a redispatch replaces.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ArtifactRef, AttemptToken, JobId, Operation};

/// Body of a message on the job queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchMessage {
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_token: Option<AttemptToken>,
    pub operation: Operation,
    pub input_ref: ArtifactRef,
}

impl DispatchMessage {
    /// First dispatch of a freshly submitted job.
    pub fn new(job_id: JobId, operation: Operation, input_ref: ArtifactRef) -> Self {
        Self {
            job_id,
            attempt_token: None,
            operation,
            input_ref,
        }
    }

    /// Mark this message as replacing the given attempt.
    pub fn replacing(mut self, previous: Option<AttemptToken>) -> Self {
        self.attempt_token = previous;
        self
    }
}

/// Completion notice published to the results queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultNotice {
    pub job_id: JobId,
    pub attempt_token: AttemptToken,
    pub output_ref: ArtifactRef,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("malformed message: {0}")]
    Decode(String),
}

pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(msg).map_err(|e| ProtocolError::Encode(e.to_string()))
}

pub fn decode_message<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(body).map_err(|e| ProtocolError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::content_digest;

    fn input_ref() -> ArtifactRef {
        ArtifactRef {
            key: "inputs/cat.png".to_string(),
            sha256: content_digest(b"cat"),
        }
    }

    #[test]
    fn first_dispatch_omits_token_on_the_wire() {
        let msg = DispatchMessage::new(
            JobId::new("job-1"),
            Operation::new(serde_json::json!({"resize": [512, 512]})),
            input_ref(),
        );
        let body = encode_message(&msg).unwrap();
        let text = String::from_utf8(body.clone()).unwrap();
        assert!(!text.contains("attempt_token"));

        let decoded: DispatchMessage = decode_message(&body).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn redispatch_records_replaced_attempt() {
        let msg = DispatchMessage::new(JobId::new("job-1"), Operation::default(), input_ref())
            .replacing(Some(AttemptToken::new("tok-1")));
        let decoded: DispatchMessage = decode_message(&encode_message(&msg).unwrap()).unwrap();
        assert_eq!(decoded.attempt_token, Some(AttemptToken::new("tok-1")));
    }

    #[test]
    fn garbage_body_is_a_decode_error() {
        let err = decode_message::<DispatchMessage>(b"not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[test]
    fn missing_fields_are_rejected() {
        let err = decode_message::<DispatchMessage>(br#"{"job_id":"x"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }
}
