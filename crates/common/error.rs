//! The error taxonomy and the marshaled error encoding that crosses the
//! wire. Kernel-intrinsic conditions carry a stable code; user errors carry
//! a message only.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capdata::CapData;

/// Stable identifiers for kernel-intrinsic error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "VAT_NOT_FOUND")]
    VatNotFound,
    #[serde(rename = "VAT_ALREADY_EXISTS")]
    VatAlreadyExists,
    #[serde(rename = "VAT_DELETED")]
    VatDeleted,
    #[serde(rename = "STREAM_READ_ERROR")]
    StreamReadError,
    #[serde(rename = "SUPERVISOR_READ_ERROR")]
    SupervisorReadError,
    #[serde(rename = "CAPTP_CONNECTION_EXISTS")]
    CaptpConnectionExists,
    #[serde(rename = "CAPTP_CONNECTION_NOT_FOUND")]
    CaptpConnectionNotFound,
    #[serde(rename = "INVALID_REFERENCE")]
    InvalidReference,
    #[serde(rename = "REVOKED")]
    Revoked,
    #[serde(rename = "DELIVERY_FAILED")]
    DeliveryFailed,
    #[serde(rename = "BAD_SYSCALL")]
    BadSyscall,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::VatNotFound => "VAT_NOT_FOUND",
            ErrorCode::VatAlreadyExists => "VAT_ALREADY_EXISTS",
            ErrorCode::VatDeleted => "VAT_DELETED",
            ErrorCode::StreamReadError => "STREAM_READ_ERROR",
            ErrorCode::SupervisorReadError => "SUPERVISOR_READ_ERROR",
            ErrorCode::CaptpConnectionExists => "CAPTP_CONNECTION_EXISTS",
            ErrorCode::CaptpConnectionNotFound => "CAPTP_CONNECTION_NOT_FOUND",
            ErrorCode::InvalidReference => "INVALID_REFERENCE",
            ErrorCode::Revoked => "REVOKED",
            ErrorCode::DeliveryFailed => "DELIVERY_FAILED",
            ErrorCode::BadSyscall => "BAD_SYSCALL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The cause chain of a marshaled error: either another encoded error or a
/// plain string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorCause {
    Error(Box<MarshaledError>),
    Text(String),
}

fn sentinel_true() -> bool {
    true
}

/// An error encoded for the wire:
/// `{sentinel: true, message, code?, data?, stack?, cause?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarshaledError {
    #[serde(default = "sentinel_true")]
    pub sentinel: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<ErrorCause>,
}

impl MarshaledError {
    pub fn new(message: impl Into<String>) -> Self {
        MarshaledError {
            sentinel: true,
            message: message.into(),
            code: None,
            data: None,
            stack: None,
            cause: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: ErrorCode) -> Self {
        MarshaledError {
            code: Some(code),
            ..MarshaledError::new(message)
        }
    }

    pub fn with_cause(mut self, cause: ErrorCause) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn vat_deleted(vat: impl std::fmt::Display) -> Self {
        MarshaledError::with_code(format!("vat {vat} was deleted"), ErrorCode::VatDeleted)
    }

    pub fn revoked(target: impl std::fmt::Display) -> Self {
        MarshaledError::with_code(format!("{target} was revoked"), ErrorCode::Revoked)
    }

    /// Encodes the error as a slotless capdata value, for use as a promise
    /// rejection.
    pub fn to_capdata(&self) -> CapData {
        // An encoded error carries no capability slots, so body-only
        // construction cannot fail validation.
        CapData {
            body: serde_json::to_string(self)
                .unwrap_or_else(|_| r#"{"sentinel":true,"message":"unencodable error"}"#.into()),
            slots: Vec::new(),
        }
    }

    pub fn from_capdata(capdata: &CapData) -> Option<MarshaledError> {
        let err: MarshaledError = serde_json::from_str(&capdata.body).ok()?;
        err.sentinel.then_some(err)
    }
}

impl std::fmt::Display for MarshaledError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{}: {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_strings() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::VatDeleted).expect("json"),
            "\"VAT_DELETED\""
        );
        let code: ErrorCode = serde_json::from_str("\"BAD_SYSCALL\"").expect("json");
        assert_eq!(code, ErrorCode::BadSyscall);
    }

    #[test]
    fn marshaled_error_round_trips_with_cause_chain() {
        let inner = MarshaledError::new("disk full");
        let outer = MarshaledError::with_code("cannot checkpoint", ErrorCode::DeliveryFailed)
            .with_cause(ErrorCause::Error(Box::new(inner.clone())));
        let encoded = serde_json::to_string(&outer).expect("encode");
        let decoded: MarshaledError = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, outer);
        match decoded.cause {
            Some(ErrorCause::Error(cause)) => assert_eq!(*cause, inner),
            other => panic!("unexpected cause: {other:?}"),
        }
    }

    #[test]
    fn string_cause_round_trips() {
        let err =
            MarshaledError::new("user failure").with_cause(ErrorCause::Text("oops".to_string()));
        let encoded = serde_json::to_string(&err).expect("encode");
        let decoded: MarshaledError = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded.cause, Some(ErrorCause::Text("oops".to_string())));
    }

    #[test]
    fn capdata_encoding_is_recognizable() {
        let err = MarshaledError::vat_deleted("v3");
        let capdata = err.to_capdata();
        assert!(capdata.slots.is_empty());
        let back = MarshaledError::from_capdata(&capdata).expect("decode");
        assert_eq!(back.code, Some(ErrorCode::VatDeleted));

        let not_an_error = CapData::new("42", vec![]).expect("valid");
        assert!(MarshaledError::from_capdata(&not_an_error).is_none());
    }
}
