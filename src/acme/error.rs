use crate::acme::http::HttpClient;
use crate::acme::object::Identifier;
use crate::crypto::SignatureError;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::SystemTime;

pub type ProtocolResult<T> = Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Http(reqwest::Error),
    AcmeProblem(Problem),
    ProtocolViolation(&'static str),
    IoError(std::io::Error),
    CryptoFailure(SignatureError),
    DeserializationFailed(serde::de::value::Error),
    RateLimited(RateLimitError),
    TimedOut(&'static str),
}

impl Error {
    pub async fn get_error_from_http(err_response: reqwest::Response) -> Error {
        let retry_after = HttpClient::extract_backoff(&err_response);
        let status = err_response.status();
        if let Ok(mut problem) = err_response.json::<Problem>().await {
            problem.status.get_or_insert(status.as_u16());
            if problem.is_rate_limit() {
                RateLimitError { problem, retry_after }.into()
            } else {
                Error::AcmeProblem(problem)
            }
        } else {
            Error::AcmeProblem(Problem {
                typ: "unknown".to_string(),
                detail: Some(format!("HTTP error: {status}")),
                status: Some(status.as_u16()),
                subproblems: vec![],
            })
        }
    }

    /// The server refused the request because it conflicts with the resource state,
    /// for example revoking a certificate that is already revoked.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::AcmeProblem(problem) => problem.is_conflict(),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Error {
        Error::Http(err)
    }
}

impl From<Problem> for Error {
    fn from(err: Problem) -> Error {
        Error::AcmeProblem(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::IoError(err)
    }
}

impl From<serde::de::value::Error> for Error {
    fn from(err: serde::de::value::Error) -> Error {
        Error::DeserializationFailed(err)
    }
}

impl From<SignatureError> for Error {
    fn from(err: SignatureError) -> Error {
        Error::CryptoFailure(err)
    }
}

impl From<RateLimitError> for Error {
    fn from(err: RateLimitError) -> Error {
        Error::RateLimited(err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self {
            Error::Http(e) => write!(f, "HTTP error: {e}"),
            Error::AcmeProblem(e) => write!(f, "The CA reported a problem: {e}"),
            Error::ProtocolViolation(e) => write!(f, "ACME protocol violated: {e}"),
            Error::IoError(io) => write!(f, "I/O error: {io}"),
            Error::CryptoFailure(msg) => write!(f, "error during cryptographic operation: {msg}"),
            Error::DeserializationFailed(serde) => write!(f, "parsing server response failed: {serde}"),
            Error::RateLimited(rate_limit) => write!(f, "{rate_limit}"),
            Error::TimedOut(msg) => write!(f, "timeout: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        // Display already prints the wrapped error, so skip one level of the chain
        match &self {
            Error::Http(e) => e.source(),
            Error::IoError(io) => io.source(),
            Error::DeserializationFailed(serde) => serde.source(),
            Error::CryptoFailure(crypto) => crypto.source(),
            Error::RateLimited(rate_limit) => rate_limit.source(),
            Error::AcmeProblem(_) | Error::ProtocolViolation(_) | Error::TimedOut(_) => None,
        }
    }
}

pub const ACME_BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";
pub const ACME_RATE_LIMITED: &str = "urn:ietf:params:acme:error:rateLimited";
pub const ACME_ALREADY_REVOKED: &str = "urn:ietf:params:acme:error:alreadyRevoked";

/// RFC 7807 problem document as returned by ACME servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subproblems: Vec<Subproblem>,
}

impl Problem {
    pub fn is_bad_nonce(&self) -> bool {
        self.typ == ACME_BAD_NONCE || self.subproblems.iter().any(|sub| sub.typ == ACME_BAD_NONCE)
    }

    pub fn is_rate_limit(&self) -> bool {
        self.typ == ACME_RATE_LIMITED || self.subproblems.iter().any(|sub| sub.typ == ACME_RATE_LIMITED)
    }

    pub fn is_already_revoked(&self) -> bool {
        self.typ == ACME_ALREADY_REVOKED
    }

    pub fn is_conflict(&self) -> bool {
        self.status == Some(StatusCode::CONFLICT.as_u16()) || self.is_already_revoked()
    }
}

impl Display for Problem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{detail}")?,
            None => write!(f, "{}", self.typ)?,
        }
        for subproblem in &self.subproblems {
            write!(f, "\nadditionally, the server reported:\n{subproblem}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subproblem {
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<Identifier>,
}

impl Display for Subproblem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{detail}")?,
            None => write!(f, "{}", self.typ)?,
        }
        if let Some(identifier) = &self.identifier {
            write!(f, " (for identifier: {identifier})")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct RateLimitError {
    pub problem: Problem,
    pub retry_after: Option<SystemTime>,
}

impl std::error::Error for RateLimitError {}

impl Display for RateLimitError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let problem = &self.problem;
        write!(f, "The CA enforced a rate limit: {problem}")?;
        if let Some(retry_after) = self.retry_after {
            let retry_after = time::OffsetDateTime::from(retry_after);
            write!(f, ", retry after {retry_after}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::already_revoked(
        r#"{
    "type": "urn:ietf:params:acme:error:alreadyRevoked",
    "detail": "Certificate already revoked",
    "status": 400
}"#,
        Problem {
            typ: ACME_ALREADY_REVOKED.to_string(),
            detail: Some("Certificate already revoked".to_string()),
            status: Some(400),
            subproblems: vec![],
        }
    )]
    #[case::subproblem(
        r#"{
    "type": "urn:ietf:params:acme:error:malformed",
    "detail": "Some of the identifiers requested were rejected",
    "subproblems": [
        {
            "type": "urn:ietf:params:acme:error:rejectedIdentifier",
            "detail": "This CA will not issue for \"example.net\"",
            "identifier": {
                "type": "dns",
                "value": "example.net"
            }
        }
    ]
}"#,
        Problem {
            typ: "urn:ietf:params:acme:error:malformed".to_string(),
            detail: Some("Some of the identifiers requested were rejected".to_string()),
            status: None,
            subproblems: vec![Subproblem {
                typ: "urn:ietf:params:acme:error:rejectedIdentifier".to_string(),
                detail: Some(r#"This CA will not issue for "example.net""#.to_string()),
                identifier: Some(Identifier::Dns { value: "example.net".to_string() }),
            }],
        }
    )]
    fn test_deserialize_problem(#[case] json: &str, #[case] expected: Problem) {
        let actual: Problem = serde_json::from_str(json).expect("Deserialization must not fail");
        assert_eq!(expected, actual);
    }

    #[rstest]
    #[case::conflict_status("urn:ietf:params:acme:error:malformed", Some(409), true)]
    #[case::already_revoked(ACME_ALREADY_REVOKED, Some(400), true)]
    #[case::already_revoked_without_status(ACME_ALREADY_REVOKED, None, true)]
    #[case::unauthorized("urn:ietf:params:acme:error:unauthorized", Some(403), false)]
    fn test_is_conflict(#[case] typ: &str, #[case] status: Option<u16>, #[case] expected: bool) {
        let problem = Problem {
            typ: typ.to_string(),
            detail: None,
            status,
            subproblems: vec![],
        };
        assert_eq!(problem.is_conflict(), expected);
        assert_eq!(Error::from(problem).is_conflict(), expected);
    }

    #[test]
    fn test_transport_error_is_not_conflict() {
        let err = Error::TimedOut("Timed out waiting for order finalization");
        assert!(!err.is_conflict());
    }

    #[test]
    fn test_display_problem_with_subproblem() {
        let problem = Problem {
            typ: "urn:ietf:params:acme:error:malformed".to_string(),
            detail: None,
            status: None,
            subproblems: vec![Subproblem {
                typ: "urn:ietf:params:acme:error:caa".to_string(),
                detail: None,
                identifier: Some(Identifier::Dns { value: "example.org".to_string() }),
            }],
        };
        assert_eq!(
            problem.to_string(),
            "urn:ietf:params:acme:error:malformed\nadditionally, the server reported:\nurn:ietf:params:acme:error:caa (for identifier: example.org)"
        );
    }
}
