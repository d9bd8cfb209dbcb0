//! Status-code classification and human-readable descriptions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity bucket of an HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCategory {
    Informational,
    Success,
    Redirection,
    ClientError,
    ServerError,
    Unknown,
}

impl StatusCategory {
    pub fn from_code(code: u16) -> Self {
        match code {
            100..=199 => StatusCategory::Informational,
            200..=299 => StatusCategory::Success,
            300..=399 => StatusCategory::Redirection,
            400..=499 => StatusCategory::ClientError,
            500..=599 => StatusCategory::ServerError,
            _ => StatusCategory::Unknown,
        }
    }

    /// Whether a response in this category completes a request successfully.
    ///
    /// Redirects count as success: following them is the transport's job.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            StatusCategory::Informational | StatusCategory::Success | StatusCategory::Redirection
        )
    }
}

impl fmt::Display for StatusCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCategory::Informational => "informational",
            StatusCategory::Success => "success",
            StatusCategory::Redirection => "redirection",
            StatusCategory::ClientError => "client error",
            StatusCategory::ServerError => "server error",
            StatusCategory::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Reason phrase for `code`, falling back to a generic text per category.
pub fn description(code: u16) -> &'static str {
    let specific = match StatusCategory::from_code(code) {
        StatusCategory::Informational => informational(code),
        StatusCategory::Success => success(code),
        StatusCategory::Redirection => redirection(code),
        StatusCategory::ClientError => client_error(code),
        StatusCategory::ServerError => server_error(code),
        StatusCategory::Unknown => None,
    };
    specific.unwrap_or(match StatusCategory::from_code(code) {
        StatusCategory::Informational => "Informational",
        StatusCategory::Success => "Success",
        StatusCategory::Redirection => "Redirection",
        StatusCategory::ClientError => "Client Error",
        StatusCategory::ServerError => "Server Error",
        StatusCategory::Unknown => "Unknown Status",
    })
}

fn informational(code: u16) -> Option<&'static str> {
    Some(match code {
        100 => "Continue",
        101 => "Switching Protocols",
        102 => "Processing",
        103 => "Early Hints",
        _ => return None,
    })
}

fn success(code: u16) -> Option<&'static str> {
    Some(match code {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        207 => "Multi-Status",
        208 => "Already Reported",
        226 => "IM Used",
        _ => return None,
    })
}

fn redirection(code: u16) -> Option<&'static str> {
    Some(match code {
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        _ => return None,
    })
}

fn client_error(code: u16) -> Option<&'static str> {
    Some(match code {
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        418 => "I'm a teapot",
        421 => "Misdirected Request",
        422 => "Unprocessable Entity",
        423 => "Locked",
        424 => "Failed Dependency",
        425 => "Too Early",
        426 => "Upgrade Required",
        428 => "Precondition Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        451 => "Unavailable For Legal Reasons",
        _ => return None,
    })
}

fn server_error(code: u16) -> Option<&'static str> {
    Some(match code {
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        506 => "Variant Also Negotiates",
        507 => "Insufficient Storage",
        508 => "Loop Detected",
        510 => "Not Extended",
        511 => "Network Authentication Required",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_range_boundaries() {
        for code in 100..=599u16 {
            let expected = match code {
                100..=199 => StatusCategory::Informational,
                200..=299 => StatusCategory::Success,
                300..=399 => StatusCategory::Redirection,
                400..=499 => StatusCategory::ClientError,
                _ => StatusCategory::ServerError,
            };
            assert_eq!(StatusCategory::from_code(code), expected, "code {code}");
        }
    }

    #[test]
    fn codes_outside_range_are_unknown() {
        for code in [0u16, 1, 99, 600, 999, u16::MAX] {
            assert_eq!(StatusCategory::from_code(code), StatusCategory::Unknown);
        }
    }

    #[test]
    fn success_policy() {
        assert!(StatusCategory::from_code(101).is_success());
        assert!(StatusCategory::from_code(204).is_success());
        assert!(StatusCategory::from_code(302).is_success());
        assert!(!StatusCategory::from_code(404).is_success());
        assert!(!StatusCategory::from_code(503).is_success());
        assert!(!StatusCategory::from_code(42).is_success());
    }

    #[test]
    fn descriptions() {
        assert_eq!(description(200), "OK");
        assert_eq!(description(418), "I'm a teapot");
        assert_eq!(description(511), "Network Authentication Required");
        assert_eq!(description(299), "Success");
        assert_eq!(description(700), "Unknown Status");
    }
}
