pub mod basic;
pub mod jwt;

use std::collections::BTreeMap;

use axum::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::config::{AuthConf, Conf};

const UNAUTHORISED_BODY: &str = "Unauthorised\n";
const BASIC_REALM: &str = "Prometheus multi-tenant proxy";

/// What an authenticated principal is permitted to observe: a set of
/// namespaces and additional label constraints. Lives for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tenancy {
    pub namespaces: Vec<String>,
    pub labels: BTreeMap<String, Vec<String>>,
}

impl Tenancy {
    pub fn new(namespaces: Vec<String>, labels: BTreeMap<String, Vec<String>>) -> Self {
        let labels = labels.into_iter().filter(|(_, values)| !values.is_empty()).collect();

        Self { namespaces, labels }
    }

    /// An empty tenancy grants access to nothing and must be denied.
    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty() && self.labels.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no usable credentials in request")]
    MissingCredentials,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("token verification failed: {0}")]
    InvalidToken(#[source] jsonwebtoken::errors::Error),
    #[error("token claims are malformed: {0}")]
    MalformedClaims(#[source] jsonwebtoken::errors::Error),
    #[error("token header does not carry a `kid`")]
    MissingKeyId,
    #[error("token signed with unknown key {0:?}")]
    UnknownKeyId(String),
    #[error("token signed with key {kid:?}, which was excluded from the JWKS: {reason}")]
    ExcludedKey { kid: String, reason: String },
}

/// The authentication capability. Exactly two concrete forms exist; both
/// expose the same three operations (`authorize`, `deny`, `reload`).
pub enum Authenticator {
    Basic(basic::BasicAuth),
    Jwt(jwt::JwtAuth),
}

impl Authenticator {
    /// Performs the initial credential load. A failure here is fatal: the
    /// process has no useful state to serve from.
    pub async fn open(conf: &Conf, client: reqwest::Client) -> anyhow::Result<Self> {
        match &conf.auth {
            AuthConf::Basic { users_file } => basic::BasicAuth::open(users_file.clone()).await.map(Self::Basic),
            AuthConf::Jwt { source } => jwt::JwtAuth::open(source.clone(), client).await.map(Self::Jwt),
        }
    }

    /// Inspects the request headers and yields the tenancy of the
    /// authenticated principal. No side effects.
    pub fn authorize(&self, headers: &HeaderMap) -> Result<Tenancy, AuthError> {
        match self {
            Self::Basic(auth) => auth.authorize(headers),
            Self::Jwt(auth) => auth.authorize(headers),
        }
    }

    /// Builds the failure response written when authentication is refused.
    pub fn deny(&self) -> Response {
        match self {
            Self::Basic(_) => (
                StatusCode::UNAUTHORIZED,
                [(WWW_AUTHENTICATE, format!(r#"Basic realm="{BASIC_REALM}""#))],
                UNAUTHORISED_BODY,
            )
                .into_response(),
            Self::Jwt(_) => (StatusCode::UNAUTHORIZED, UNAUTHORISED_BODY).into_response(),
        }
    }

    /// Refreshes the underlying credential store. Returns false when the
    /// source could not be read or parsed; the previous state is retained.
    pub async fn reload(&self) -> bool {
        match self {
            Self::Basic(auth) => auth.reload().await,
            Self::Jwt(auth) => auth.reload().await,
        }
    }
}

/// Pulls a bearer token out of `Authorization: Bearer <token>`, falling back
/// to the bare `Token` header. Authorization wins when both are present and
/// well-formed.
pub(crate) fn extract_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(token) = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
    {
        return Some(token);
    }

    headers.get("token").and_then(|value| value.to_str().ok())
}
