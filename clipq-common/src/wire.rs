//! Job wire schema
//!
//! Queue messages carry a flat JSON object:
//!
//! ```json
//! {"session_id": "pres-42", "sequence_number": "3", "terminal": "false",
//!  "transcript": "...", "slide_url": "..."}
//! ```
//!
//! `sequence_number` travels as decimal text and `terminal` as `"true"` /
//! `"false"` text. A JSON integer and a JSON boolean are accepted as well;
//! a missing `terminal` means `false`. Every other field is payload.
//!
//! A malformed message can never become valid, so callers acknowledge and log
//! it instead of retrying.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::MAX_SEQUENCE_NUMBER;
use crate::{Job, SequenceNumber};

pub const FIELD_SESSION_ID: &str = "session_id";
pub const FIELD_SEQUENCE_NUMBER: &str = "sequence_number";
pub const FIELD_TERMINAL: &str = "terminal";

/// Reason a queue message could not be turned into a [`Job`]
#[derive(Debug, Error, PartialEq)]
pub enum MalformedJob {
    #[error("message is not valid JSON: {0}")]
    NotJson(String),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("missing or empty session_id")]
    MissingSessionId,

    #[error("missing sequence_number")]
    MissingSequenceNumber,

    #[error("invalid sequence_number '{0}'")]
    InvalidSequenceNumber(String),

    #[error("invalid terminal flag '{0}'")]
    InvalidTerminal(String),
}

/// Parse a queue message body into a job
pub fn parse_wire_job(body: &str) -> Result<Job, MalformedJob> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| MalformedJob::NotJson(e.to_string()))?;

    let Value::Object(mut fields) = value else {
        return Err(MalformedJob::NotAnObject);
    };

    let session_id = match fields.remove(FIELD_SESSION_ID) {
        Some(Value::String(s)) if !s.trim().is_empty() => s,
        _ => return Err(MalformedJob::MissingSessionId),
    };

    let sequence_number = parse_sequence_number(
        fields
            .remove(FIELD_SEQUENCE_NUMBER)
            .ok_or(MalformedJob::MissingSequenceNumber)?,
    )?;

    let terminal = match fields.remove(FIELD_TERMINAL) {
        None | Some(Value::Null) => false,
        Some(value) => parse_terminal(value)?,
    };

    Ok(Job {
        session_id,
        sequence_number,
        terminal,
        payload: Value::Object(fields),
    })
}

fn parse_sequence_number(value: Value) -> Result<SequenceNumber, MalformedJob> {
    let (parsed, text) = match value {
        Value::String(text) => {
            if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
                return Err(MalformedJob::InvalidSequenceNumber(text));
            }
            (text.parse::<SequenceNumber>().ok(), text)
        }
        Value::Number(n) => (n.as_u64(), n.to_string()),
        other => return Err(MalformedJob::InvalidSequenceNumber(other.to_string())),
    };

    match parsed {
        Some(n) if n <= MAX_SEQUENCE_NUMBER => Ok(n),
        _ => Err(MalformedJob::InvalidSequenceNumber(text)),
    }
}

fn parse_terminal(value: Value) -> Result<bool, MalformedJob> {
    match value {
        Value::Bool(flag) => Ok(flag),
        Value::String(text) => {
            if text.eq_ignore_ascii_case("true") {
                Ok(true)
            } else if text.eq_ignore_ascii_case("false") {
                Ok(false)
            } else {
                Err(MalformedJob::InvalidTerminal(text))
            }
        }
        other => Err(MalformedJob::InvalidTerminal(other.to_string())),
    }
}

/// Render a job in the wire schema
///
/// Object payloads are flattened next to the reserved fields (reserved keys
/// inside the payload are dropped). Any other non-null payload is nested under
/// a `payload` key.
pub fn render_wire_job(job: &Job) -> String {
    let mut fields = Map::new();
    fields.insert(FIELD_SESSION_ID.into(), Value::String(job.session_id.clone()));
    fields.insert(
        FIELD_SEQUENCE_NUMBER.into(),
        Value::String(job.sequence_number.to_string()),
    );
    fields.insert(
        FIELD_TERMINAL.into(),
        Value::String(if job.terminal { "true" } else { "false" }.into()),
    );

    match &job.payload {
        Value::Object(payload) => {
            for (key, value) in payload {
                if !fields.contains_key(key) {
                    fields.insert(key.clone(), value.clone());
                }
            }
        }
        Value::Null => {}
        other => {
            fields.insert("payload".into(), other.clone());
        }
    }

    Value::Object(fields).to_string()
}
