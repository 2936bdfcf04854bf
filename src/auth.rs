//! Bearer token issuance and validation
//!
//! Tokens are HS256-signed JWTs carrying `sub`, `iss`, `iat` and `exp`.
//! Nothing is persisted: a token is valid exactly as long as its signature
//! verifies and the current time falls inside `[iat, exp]`.

use crate::duration::{format_duration, parse_duration};
use crate::error::{json_error_response, json_response, GatewayBody, GatewayErrorCode};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{TimeDelta, Utc};
use http_body_util::{BodyExt, Limited};
use hyper::header::AUTHORIZATION;
use hyper::{Request, Response, StatusCode};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Span};

/// Value of the `iss` claim on every token this gateway signs
pub const ISSUER: &str = "mandelbrot-auth-proxy";

/// Lifetime in hours used when the issuance request names none
pub const DEFAULT_TOKEN_TTL_HOURS: i64 = 24;

/// Longest lifetime in hours the issuance endpoint will grant
pub const MAX_TOKEN_TTL_HOURS: i64 = 72;

/// Subject used when the issuance request names none
pub const ANONYMOUS_SUBJECT: &str = "anonymous";

/// Largest issuance request body accepted
const MAX_ISSUE_BODY_BYTES: usize = 64 * 1024;

const SIGNING_ALGORITHM: Algorithm = Algorithm::HS256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

/// Why a token was rejected.
///
/// Callers collapse every variant into one 401; the variants exist so the
/// log line says which check failed.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("unexpected signing algorithm {0:?}")]
    UnexpectedAlgorithm(String),
    #[error("signature does not verify")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token issued in the future")]
    NotYetValid,
    #[error("token signing failed: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::InvalidSignature => AuthError::BadSignature,
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::ImmatureSignature => AuthError::NotYetValid,
            ErrorKind::InvalidAlgorithm => {
                AuthError::UnexpectedAlgorithm("algorithm mismatch".to_string())
            }
            ErrorKind::InvalidAlgorithmName => {
                AuthError::UnexpectedAlgorithm("unknown algorithm".to_string())
            }
            _ => AuthError::Malformed(err.to_string()),
        }
    }
}

/// Body of `POST /token`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueRequest {
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
}

/// Successful `POST /token` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueResponse {
    pub token: String,
    pub expires_in: String,
    pub subject: String,
}

/// Issues and validates bearer tokens under one shared secret
#[derive(Clone)]
pub struct TokenAuthority {
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
    validation: Arc<Validation>,
    span: Span,
}

impl TokenAuthority {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(SIGNING_ALGORITHM);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            encoding_key: Arc::new(EncodingKey::from_secret(secret.as_bytes())),
            decoding_key: Arc::new(DecodingKey::from_secret(secret.as_bytes())),
            validation: Arc::new(validation),
            span: tracing::info_span!("auth"),
        }
    }

    /// Attach log output to the given span instead of the default `auth` span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Sign a token for `subject` valid from now until `now + ttl`.
    ///
    /// `ttl` is not bounded here; the issuance endpoint clamps it.
    pub fn issue_token(&self, subject: &str, ttl: TimeDelta) -> Result<String, AuthError> {
        let now = Utc::now();
        let exp = now
            .checked_add_signed(ttl)
            .ok_or_else(|| AuthError::Malformed("token lifetime out of range".to_string()))?;

        let claims = Claims {
            sub: subject.to_string(),
            iss: ISSUER.to_string(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
        };

        encode(&Header::new(SIGNING_ALGORITHM), &claims, &self.encoding_key)
            .map_err(AuthError::Signing)
    }

    /// Verify a raw token and return its claims
    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        if token.split('.').count() != 3 {
            return Err(AuthError::Malformed(
                "expected three dot-separated segments".to_string(),
            ));
        }

        check_header_algorithm(token)?;

        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;

        if data.claims.iat > Utc::now().timestamp() {
            return Err(AuthError::NotYetValid);
        }

        Ok(data.claims)
    }

    /// Gate a request on its `Authorization: Bearer <token>` header.
    ///
    /// On success the validated claims are returned and the request should be
    /// forwarded unchanged. On failure the returned response is the 401 to
    /// send back.
    pub fn authorize<B>(
        &self,
        req: &Request<B>,
        client_addr: SocketAddr,
    ) -> Result<Claims, Response<GatewayBody>> {
        let _enter = self.span.enter();
        let path = req.uri().path();

        let header = match req.headers().get(AUTHORIZATION) {
            Some(value) => value,
            None => {
                return Err(json_error_response(
                    GatewayErrorCode::MissingCredentials,
                    "missing Authorization header",
                ))
            }
        };

        let token = match header.to_str().ok().and_then(bearer_token) {
            Some(token) => token,
            None => {
                return Err(json_error_response(
                    GatewayErrorCode::MalformedCredentials,
                    "expected: Bearer <token>",
                ))
            }
        };

        match self.validate(token) {
            Ok(claims) => {
                debug!(sub = %claims.sub, path, "Request authenticated");
                Ok(claims)
            }
            Err(e) => {
                warn!(error = %e, addr = %client_addr, path, "Rejected bearer token");
                Err(json_error_response(
                    GatewayErrorCode::InvalidToken,
                    "invalid or expired token",
                ))
            }
        }
    }

    /// Handle `POST /token`
    pub async fn handle_issue(&self, req: Request<GatewayBody>) -> Response<GatewayBody> {
        let body = match Limited::new(req.into_body(), MAX_ISSUE_BODY_BYTES)
            .collect()
            .await
        {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<http_body_util::LengthLimitError>() => {
                return json_error_response(
                    GatewayErrorCode::PayloadTooLarge,
                    "request body too large",
                )
            }
            Err(e) => {
                let _enter = self.span.enter();
                debug!(error = %e, "Failed to read issuance request body");
                return json_error_response(GatewayErrorCode::InvalidJson, "invalid JSON");
            }
        };

        let _enter = self.span.enter();

        let request: IssueRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "Rejected issuance request body");
                return json_error_response(GatewayErrorCode::InvalidJson, "invalid JSON");
            }
        };

        let subject = request
            .subject
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| ANONYMOUS_SUBJECT.to_string());

        let ttl = match request.duration.as_deref().filter(|d| !d.is_empty()) {
            None => TimeDelta::hours(DEFAULT_TOKEN_TTL_HOURS),
            Some(raw) => match parse_duration(raw) {
                Ok(ttl) => ttl.min(TimeDelta::hours(MAX_TOKEN_TTL_HOURS)),
                Err(e) => {
                    debug!(error = %e, "Rejected issuance duration");
                    return json_error_response(
                        GatewayErrorCode::InvalidDuration,
                        format!("bad duration: {}", raw),
                    );
                }
            },
        };

        let token = match self.issue_token(&subject, ttl) {
            Ok(token) => token,
            Err(e) => {
                error!(error = %e, "Failed to issue token");
                return json_error_response(
                    GatewayErrorCode::TokenIssueFailed,
                    "token generation failed",
                );
            }
        };

        let expires_in = format_duration(ttl);
        info!(sub = %subject, ttl = %expires_in, "Issued token");

        json_response(
            StatusCode::OK,
            &IssueResponse {
                token,
                expires_in,
                subject,
            },
        )
    }
}

/// Extract `<token>` from `Bearer <token>`; the scheme is case-insensitive and
/// exactly one space separates it from the token
fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("Bearer")
        || token.is_empty()
        || token.starts_with(char::is_whitespace)
    {
        return None;
    }
    Some(token)
}

#[derive(Deserialize)]
struct RawHeader {
    alg: Option<String>,
}

/// Reject anything but the issuing algorithm before touching the signature,
/// so a token declaring `none` or an asymmetric scheme is reported as such
fn check_header_algorithm(token: &str) -> Result<(), AuthError> {
    let encoded = token.split('.').next().unwrap_or_default();
    let decoded = URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|e| AuthError::Malformed(format!("header encoding: {}", e)))?;
    let header: RawHeader = serde_json::from_slice(&decoded)
        .map_err(|e| AuthError::Malformed(format!("header json: {}", e)))?;

    match header.alg {
        Some(alg) if alg == "HS256" => Ok(()),
        Some(alg) => Err(AuthError::UnexpectedAlgorithm(alg)),
        None => Err(AuthError::Malformed("header has no alg".to_string())),
    }
}
