//! RFC 7807 problem documents
//!
//! Every management-side error reply is a problem document with `status`,
//! `title` and `detail` fields, serialized as a single JSON line. The same
//! shape is written in plaintext when an authentication handshake fails,
//! before the AEAD layer exists.

use serde::{Deserialize, Serialize};

/// An RFC 7807 problem document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    /// HTTP-ish status code
    pub status: u16,
    /// Short, human-readable summary of the problem type
    pub title: String,
    /// Human-readable explanation specific to this occurrence
    pub detail: String,
}

impl Problem {
    pub fn new(status: u16, title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            status,
            title: title.into(),
            detail: detail.into(),
        }
    }

    /// 400: malformed path or payload
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(400, "bad-request", detail)
    }

    /// 401: failed or missing authentication handshake
    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(401, "unauthorized", detail)
    }

    /// 404: unknown bus, device or path
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(404, "not-found", detail)
    }

    /// 409: state conflict (id collision, bound stream, non-empty bus)
    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new(409, "conflict", detail)
    }

    /// 408: request exceeded its deadline
    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(408, "timeout", detail)
    }

    /// 500: handler failure that is not the client's fault
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(500, "internal-error", detail)
    }
}

impl std::fmt::Display for Problem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.status, self.title, self.detail)
    }
}

impl std::error::Error for Problem {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_problem_json_shape() {
        let problem = Problem::conflict("device 80000-1 already has a stream session");
        let json = serde_json::to_string(&problem).unwrap();
        assert_eq!(
            json,
            "{\"status\":409,\"title\":\"conflict\",\"detail\":\"device 80000-1 already has a stream session\"}"
        );
    }

    #[test]
    fn test_problem_roundtrip() {
        let problem = Problem::not_found("no such bus: 7");
        let json = serde_json::to_string(&problem).unwrap();
        let decoded: Problem = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, problem);
        assert_eq!(decoded.status, 404);
    }
}
