//! B2 native API errors
//!
//! Failed calls return a JSON body `{"status", "code", "message"}`. The code
//! decides between refreshing the token, backing off, or giving up.

use serde::Deserialize;

use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum B2Error {
    #[error("authorization token expired or rejected")]
    AuthExpired,

    #[error("rate limited by B2")]
    RateLimited,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Account storage, transaction or bandwidth cap reached
    #[error("account cap exceeded: {0}")]
    CapExceeded(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("server error ({0}): {1}")]
    Server(u16, String),

    #[error("request timed out")]
    Timeout,

    #[error("bad request: {0}")]
    Request(String),

    #[error("client not authorized, call authorize first")]
    Unauthorized,
}

/// Error document returned by every B2 API call
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl B2Error {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            B2Error::RateLimited
                | B2Error::Timeout
                | B2Error::Network(_)
                | B2Error::Server(_, _)
                | B2Error::AuthExpired
        )
    }

    /// Classify a failed response from its status and body
    ///
    /// Bodies that are not B2 error documents are kept verbatim.
    pub fn from_status(status: u16, body: &str) -> Self {
        let (code, detail) = match serde_json::from_str::<ErrorBody>(body) {
            Ok(parsed) if !parsed.code.is_empty() => {
                let detail = format!("{}: {}", parsed.code, parsed.message);
                (parsed.code, detail)
            }
            _ => (String::new(), body.to_string()),
        };

        match (status, code.as_str()) {
            (401, _) => B2Error::AuthExpired,
            (403, c) if c.ends_with("cap_exceeded") => B2Error::CapExceeded(detail),
            (403, _) => B2Error::Forbidden(detail),
            (404, _) | (400, "file_not_present") => B2Error::NotFound(detail),
            (408, _) => B2Error::Timeout,
            (429, _) => B2Error::RateLimited,
            (500..=599, _) => B2Error::Server(status, detail),
            _ => B2Error::Request(format!("HTTP {}: {}", status, detail)),
        }
    }
}

impl From<reqwest::Error> for B2Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            B2Error::Timeout
        } else if e.is_decode() {
            B2Error::Request(format!("invalid response body: {}", e))
        } else {
            B2Error::Network(e.to_string())
        }
    }
}

impl From<B2Error> for StorageError {
    fn from(e: B2Error) -> Self {
        match e {
            B2Error::NotFound(what) => StorageError::NotFound(what),
            other => StorageError::B2(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_reads_error_document() {
        let body = r#"{"status":403,"code":"storage_cap_exceeded","message":"Cannot upload files, storage cap exceeded."}"#;
        assert!(matches!(
            B2Error::from_status(403, body),
            B2Error::CapExceeded(d) if d.starts_with("storage_cap_exceeded")
        ));

        let body = r#"{"status":400,"code":"file_not_present","message":"File not present: 4_z"}"#;
        assert!(matches!(B2Error::from_status(400, body), B2Error::NotFound(_)));

        let body = r#"{"status":401,"code":"expired_auth_token","message":"Authorization token has expired"}"#;
        assert!(matches!(B2Error::from_status(401, body), B2Error::AuthExpired));
    }

    #[test]
    fn test_from_status_plain_body() {
        assert!(matches!(B2Error::from_status(404, "gone"), B2Error::NotFound(b) if b == "gone"));
        assert!(matches!(B2Error::from_status(503, ""), B2Error::Server(503, _)));
        assert!(matches!(B2Error::from_status(400, "bad"), B2Error::Request(_)));
        assert!(matches!(B2Error::from_status(403, "nope"), B2Error::Forbidden(_)));
    }

    #[test]
    fn test_retryable() {
        assert!(B2Error::RateLimited.is_retryable());
        assert!(B2Error::AuthExpired.is_retryable());
        assert!(B2Error::Server(500, String::new()).is_retryable());
        assert!(!B2Error::CapExceeded(String::new()).is_retryable());
        assert!(!B2Error::Unauthorized.is_retryable());
    }

    #[test]
    fn test_not_found_maps_to_storage_not_found() {
        let err: StorageError = B2Error::NotFound("4_z".to_string()).into();
        assert!(matches!(err, StorageError::NotFound(id) if id == "4_z"));
    }
}
