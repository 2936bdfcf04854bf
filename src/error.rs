//! Error handling and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Body type shared by every request and response the gateway handles
pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorCode {
    /// No Authorization header on a protected route
    MissingCredentials,
    /// Authorization header present but not `Bearer <token>`
    MalformedCredentials,
    /// Token failed validation (signature, algorithm, expiry, structure)
    InvalidToken,
    /// Request body is not the expected JSON
    InvalidJson,
    /// Token duration could not be parsed
    InvalidDuration,
    /// Request body exceeded the accepted size
    PayloadTooLarge,
    /// Signing a token failed
    TokenIssueFailed,
    /// The backend could not be reached or did not answer in time
    UpstreamUnavailable,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::MissingCredentials => StatusCode::UNAUTHORIZED,
            GatewayErrorCode::MalformedCredentials => StatusCode::UNAUTHORIZED,
            GatewayErrorCode::InvalidToken => StatusCode::UNAUTHORIZED,
            GatewayErrorCode::InvalidJson => StatusCode::BAD_REQUEST,
            GatewayErrorCode::InvalidDuration => StatusCode::BAD_REQUEST,
            GatewayErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayErrorCode::TokenIssueFailed => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::MissingCredentials => "MISSING_CREDENTIALS",
            GatewayErrorCode::MalformedCredentials => "MALFORMED_CREDENTIALS",
            GatewayErrorCode::InvalidToken => "INVALID_TOKEN",
            GatewayErrorCode::InvalidJson => "INVALID_JSON",
            GatewayErrorCode::InvalidDuration => "INVALID_DURATION",
            GatewayErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            GatewayErrorCode::TokenIssueFailed => "TOKEN_ISSUE_FAILED",
            GatewayErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}"}}"#,
                self.error.replace('\\', "\\\\").replace('\"', "\\\"")
            )
        })
    }
}

/// Wrap bytes in the gateway body type
pub fn full_body(bytes: impl Into<Bytes>) -> GatewayBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<GatewayBody> {
    let body = ErrorResponse::new(message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// Create a JSON response from any serializable value
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<GatewayBody> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(full_body(body))
            .expect("valid response with StatusCode enum and static header"),
        Err(_) => json_error_response(
            GatewayErrorCode::InternalError,
            "response serialization failed",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            GatewayErrorCode::MissingCredentials.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayErrorCode::InvalidDuration.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayErrorCode::TokenIssueFailed.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayErrorCode::UpstreamUnavailable.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_error_response_json() {
        let json = ErrorResponse::new("upstream unavailable").to_json();
        assert_eq!(json, r#"{"error":"upstream unavailable"}"#);
    }

    #[test]
    fn test_error_response_escapes_quotes() {
        let json = ErrorResponse::new(r#"bad duration: "x""#).to_json();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["error"], r#"bad duration: "x""#);
    }

    #[tokio::test]
    async fn test_json_error_response() {
        let response = json_error_response(GatewayErrorCode::InvalidToken, "invalid or expired token");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Gateway-Error").unwrap(),
            "INVALID_TOKEN"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], br#"{"error":"invalid or expired token"}"#);
    }

    #[test]
    fn test_error_code_header_values() {
        assert_eq!(
            GatewayErrorCode::MalformedCredentials.as_header_value(),
            "MALFORMED_CREDENTIALS"
        );
        assert_eq!(
            GatewayErrorCode::UpstreamUnavailable.as_header_value(),
            "UPSTREAM_UNAVAILABLE"
        );
    }
}
