//! Versioned codec for jobs held in the session store
//!
//! Buffered jobs are written as `{"v":1,"job":{...}}`. Decoding refuses any
//! other version so that a rolling upgrade never silently misreads an entry
//! written by a newer schema.

use serde::{Deserialize, Serialize};

use crate::{Error, Job, Result};

/// Current schema version for stored jobs
pub const JOB_SCHEMA_VERSION: u32 = 1;

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    v: u32,
    job: &'a Job,
}

#[derive(Deserialize)]
struct Envelope {
    v: u32,
    job: serde_json::Value,
}

/// Encode a job for storage
pub fn encode_job(job: &Job) -> Result<String> {
    serde_json::to_string(&EnvelopeRef {
        v: JOB_SCHEMA_VERSION,
        job,
    })
    .map_err(|e| Error::Codec(format!("Failed to encode job: {}", e)))
}

/// Decode a stored job, rejecting unknown schema versions
pub fn decode_job(raw: &str) -> Result<Job> {
    let envelope: Envelope = serde_json::from_str(raw)
        .map_err(|e| Error::Codec(format!("Failed to decode job envelope: {}", e)))?;

    if envelope.v != JOB_SCHEMA_VERSION {
        return Err(Error::Codec(format!(
            "Unsupported job schema version {} (expected {})",
            envelope.v, JOB_SCHEMA_VERSION
        )));
    }

    serde_json::from_value(envelope.job)
        .map_err(|e| Error::Codec(format!("Failed to decode job: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encoded_form_carries_version() {
        let job = Job::new("pres-1", 3, false, json!({"transcript": "hello"}));
        let raw = encode_job(&job).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["v"], 1);
        assert_eq!(value["job"]["sequence_number"], 3);
    }

    #[test]
    fn test_nested_payload_survives() {
        let job = Job::new(
            "pres-1",
            7,
            true,
            json!({"emotions": {"calm": 0.25, "joy": 0.5}, "tags": [1, 2, 3], "note": null}),
        );
        assert_eq!(decode_job(&encode_job(&job).unwrap()).unwrap(), job);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let raw = r#"{"v":2,"job":{"session_id":"s","sequence_number":0,"terminal":false}}"#;
        let err = decode_job(raw).unwrap_err();
        assert!(matches!(err, Error::Codec(msg) if msg.contains("version 2")));
    }

    #[test]
    fn test_missing_envelope_rejected() {
        let raw = r#"{"session_id":"s","sequence_number":0,"terminal":false}"#;
        assert!(decode_job(raw).is_err());
    }

    #[test]
    fn test_missing_payload_defaults_to_null() {
        let raw = r#"{"v":1,"job":{"session_id":"s","sequence_number":4,"terminal":false}}"#;
        let job = decode_job(raw).unwrap();
        assert_eq!(job.sequence_number, 4);
        assert!(job.payload.is_null());
    }
}
