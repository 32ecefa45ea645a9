// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! User-facing error handling for the HTTP API.
//!
//! Responses never carry stack traces, file paths, tokens or storage
//! details. Every error gets a reference code that is logged together with
//! the sanitized internal cause, so support can match a user report to
//! the log line.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use crate::download::JobError;

// =============================================================================
// ERROR REFERENCE CODE GENERATION
// =============================================================================

/// Generate a unique error reference code.
/// Format: ERR-YYYYMMDD-XXXXXX (e.g., ERR-20240115-A3F8K2)
pub fn generate_reference_code() -> String {
    let date = Utc::now().format("%Y%m%d");
    let mut rng = rand::thread_rng();
    let chars: Vec<char> = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789".chars().collect();
    let random: String = (0..6)
        .map(|_| chars[rng.gen_range(0..chars.len())])
        .collect();
    format!("ERR-{}-{}", date, random)
}

// =============================================================================
// USER-FACING ERROR TYPES
// =============================================================================

/// Errors returned to API clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum UserError {
    /// Service temporarily unavailable (503)
    ServiceUnavailable {
        message: String,
        reference: String,
        retry_after_secs: Option<u64>,
    },

    /// Invalid request from client (400)
    InvalidRequest {
        message: String,
        reference: String,
        field: Option<String>,
    },

    /// Missing or unknown credential (401)
    AuthenticationRequired {
        message: String,
        reference: String,
    },

    /// Internal server error (500) - never exposes internal details
    InternalError {
        message: String,
        reference: String,
    },

    /// Resource not found (404)
    NotFound {
        message: String,
        reference: String,
    },

    /// Request entity too large (413)
    PayloadTooLarge {
        message: String,
        reference: String,
        max_size: Option<u64>,
    },
}

impl UserError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            UserError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            UserError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            UserError::AuthenticationRequired { .. } => StatusCode::UNAUTHORIZED,
            UserError::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            UserError::NotFound { .. } => StatusCode::NOT_FOUND,
            UserError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Get the reference code for this error.
    pub fn reference(&self) -> &str {
        match self {
            UserError::ServiceUnavailable { reference, .. }
            | UserError::InvalidRequest { reference, .. }
            | UserError::AuthenticationRequired { reference, .. }
            | UserError::InternalError { reference, .. }
            | UserError::NotFound { reference, .. }
            | UserError::PayloadTooLarge { reference, .. } => reference,
        }
    }

    /// Get the user-facing message.
    pub fn message(&self) -> &str {
        match self {
            UserError::ServiceUnavailable { message, .. }
            | UserError::InvalidRequest { message, .. }
            | UserError::AuthenticationRequired { message, .. }
            | UserError::InternalError { message, .. }
            | UserError::NotFound { message, .. }
            | UserError::PayloadTooLarge { message, .. } => message,
        }
    }
}

/// User-facing error response structure (JSON format).
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: UserError,
    pub status: u16,
}

impl IntoResponse for UserError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let response = ErrorResponse {
            status: status.as_u16(),
            error: self,
        };

        let body = serde_json::to_string(&response).unwrap_or_else(|_| {
            r#"{"error":{"error_type":"internal_error","message":"An unexpected error occurred","reference":"ERR-FALLBACK"},"status":500}"#.to_string()
        });

        (status, [("content-type", "application/json")], body).into_response()
    }
}

// =============================================================================
// ERROR CONSTRUCTORS (WITH LOGGING)
// =============================================================================

impl UserError {
    /// Create a ServiceUnavailable error, logging full details internally.
    pub fn service_unavailable(internal_error: &str) -> Self {
        let reference = generate_reference_code();
        let sanitized = sanitize_error_details(internal_error);

        tracing::error!(
            reference = %reference,
            internal_error = %sanitized,
            "Service unavailable"
        );

        Self::ServiceUnavailable {
            message: "Download service is at capacity. Please try again later.".to_string(),
            reference,
            retry_after_secs: Some(30),
        }
    }

    /// Create an InvalidRequest error.
    pub fn invalid_request(user_message: &str, field: Option<&str>, internal_details: Option<&str>) -> Self {
        let reference = generate_reference_code();

        if let Some(details) = internal_details {
            let sanitized = sanitize_error_details(details);
            tracing::warn!(
                reference = %reference,
                internal_details = %sanitized,
                field = ?field,
                "Invalid request"
            );
        }

        Self::InvalidRequest {
            message: user_message.to_string(),
            reference,
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create an AuthenticationRequired error.
    pub fn authentication_required(internal_reason: Option<&str>) -> Self {
        let reference = generate_reference_code();

        if let Some(reason) = internal_reason {
            let sanitized = sanitize_error_details(reason);
            tracing::warn!(
                reference = %reference,
                internal_reason = %sanitized,
                "Authentication required"
            );
        }

        Self::AuthenticationRequired {
            message: "Authentication required. Please provide valid credentials.".to_string(),
            reference,
        }
    }

    /// Create an InternalError, logging full details internally.
    pub fn internal_error(internal_error: &str) -> Self {
        let reference = generate_reference_code();
        let sanitized = sanitize_error_details(internal_error);

        tracing::error!(
            reference = %reference,
            internal_error = %sanitized,
            "Internal server error"
        );

        Self::InternalError {
            message: format!("An internal error occurred. Reference: {}", reference),
            reference,
        }
    }

    /// Create a NotFound error.
    pub fn not_found(resource: &str) -> Self {
        let reference = generate_reference_code();

        tracing::info!(
            reference = %reference,
            resource = %resource,
            "Resource not found"
        );

        Self::NotFound {
            message: format!("The requested {} was not found.", resource),
            reference,
        }
    }

    /// Create a PayloadTooLarge error.
    pub fn payload_too_large(max_size: u64) -> Self {
        let reference = generate_reference_code();

        tracing::warn!(
            reference = %reference,
            max_size = %max_size,
            "Payload too large"
        );

        Self::PayloadTooLarge {
            message: format!("Request body too large. Maximum size is {} bytes.", max_size),
            reference,
            max_size: Some(max_size),
        }
    }
}

// =============================================================================
// ERROR SANITIZATION
// =============================================================================

/// Patterns for sanitizing sensitive information from error messages.
/// These patterns are compiled once at startup.
static SANITIZE_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        // File paths (Windows and Unix)
        (Regex::new(r"[A-Za-z]:\\[^\s]+").expect("Windows path regex"), "[PATH_REDACTED]"),
        (Regex::new(r"/(?:home|usr|var|etc|opt|tmp|root)/[^\s]+").expect("Unix path regex"), "[PATH_REDACTED]"),

        // IPv4 addresses
        (Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").expect("IPv4 regex"), "[IP_REDACTED]"),

        // Credentials
        (Regex::new(r"Bearer [a-zA-Z0-9-._~+/]+=*").expect("Bearer token regex"), "Bearer [TOKEN_REDACTED]"),
        (Regex::new(r"(?i)(?:token|password)=[^\s;&]+").expect("Credential param regex"), "[CREDENTIAL_REDACTED]"),

        // Stack traces
        (Regex::new(r"at [^\s]+\.rs:\d+:\d+").expect("Rust location regex"), "[LOCATION_REDACTED]"),
        (Regex::new(r"thread '[^']+' panicked at").expect("Panic regex"), "[PANIC_REDACTED]"),
        (Regex::new(r"stack backtrace:[\s\S]*").expect("Stack trace regex"), "[STACK_TRACE_REDACTED]"),

        // Generic long alphanumeric strings (potential secrets)
        (Regex::new(r"\b[A-Za-z0-9]{40,}\b").expect("Long secret regex"), "[SECRET_REDACTED]"),
    ]
});

/// Sanitize error details before they are logged.
pub fn sanitize_error_details(error: &str) -> String {
    let mut result = error.to_string();

    for (pattern, replacement) in SANITIZE_PATTERNS.iter() {
        result = pattern.replace_all(&result, *replacement).to_string();
    }

    result
}

// =============================================================================
// ERROR MAPPING FROM DOMAIN ERRORS
// =============================================================================

/// Map a job error to the response a client sees.
pub fn map_job_error(error: &JobError) -> UserError {
    match error {
        JobError::Unauthorized => UserError::authentication_required(None),
        JobError::InvalidId(raw) => UserError::invalid_request(
            "Download id must be a positive whole number.",
            Some("id"),
            Some(&format!("unparseable id {:?}", raw)),
        ),
        JobError::InvalidMediaRef(reason) => UserError::invalid_request(
            &format!("Invalid media reference: {}.", reason),
            Some("media_ref"),
            None,
        ),
        JobError::NotFound => UserError::not_found("download"),
        JobError::StoreExhausted(details) => UserError::service_unavailable(details),
        JobError::InvalidTransition { .. } | JobError::InvariantViolation(_) | JobError::Storage(_) => {
            UserError::internal_error(&error.to_string())
        }
    }
}

impl From<JobError> for UserError {
    fn from(error: JobError) -> Self {
        map_job_error(&error)
    }
}

// =============================================================================
// RESULT TYPE ALIAS
// =============================================================================

/// Result type that uses UserError for the error variant.
pub type ApiResult<T> = Result<T, UserError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::JobStatus;

    #[test]
    fn test_generate_reference_code() {
        let code = generate_reference_code();
        assert!(code.starts_with("ERR-"));
        assert_eq!(code.len(), 19); // ERR-YYYYMMDD-XXXXXX = 4+8+1+6

        let code2 = generate_reference_code();
        assert_ne!(code, code2);
    }

    #[test]
    fn test_job_error_status_codes() {
        let cases = [
            (JobError::Unauthorized, StatusCode::UNAUTHORIZED),
            (JobError::InvalidId("abc".into()), StatusCode::BAD_REQUEST),
            (JobError::InvalidMediaRef("must not be empty"), StatusCode::BAD_REQUEST),
            (JobError::NotFound, StatusCode::NOT_FOUND),
            (JobError::StoreExhausted("limit".into()), StatusCode::SERVICE_UNAVAILABLE),
            (JobError::Storage("disk full".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (JobError::InvariantViolation("progress".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (
                JobError::InvalidTransition { from: JobStatus::Completed, event: "progress" },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(UserError::from(err.clone()).status_code(), status, "{err}");
        }
    }

    #[test]
    fn test_storage_error_is_not_exposed() {
        let err = UserError::from(JobError::Storage("rename /var/lib/tapedeck/jobs.tmp failed".into()));
        assert!(!err.message().contains("/var/lib"));
        assert!(!err.message().contains("rename"));
        assert!(err.message().contains(err.reference()));
    }

    #[test]
    fn test_invalid_id_names_field() {
        let err = map_job_error(&JobError::InvalidId("12x".into()));
        match err {
            UserError::InvalidRequest { field, .. } => assert_eq!(field.as_deref(), Some("id")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_sanitize_removes_secrets_and_paths() {
        let sanitized = sanitize_error_details(
            "write /home/alice/.tapedeck/jobs.json failed for Bearer abc.def from 10.0.0.7",
        );
        assert!(!sanitized.contains("alice"));
        assert!(!sanitized.contains("abc.def"));
        assert!(!sanitized.contains("10.0.0.7"));
        assert!(sanitized.contains("[PATH_REDACTED]"));
        assert!(sanitized.contains("[TOKEN_REDACTED]"));
    }

    #[test]
    fn test_user_error_serialization() {
        let error = UserError::not_found("download");
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["error_type"], "not_found");
        assert_eq!(json["message"], "The requested download was not found.");
        assert!(json["reference"].as_str().unwrap().starts_with("ERR-"));
    }
}
