use std::collections::{BTreeMap, HashMap};
use std::str::FromStr as _;
use std::sync::Arc;

use anyhow::Context as _;
use axum::http::HeaderMap;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use camino::Utf8PathBuf;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use url::Url;

use crate::auth::{AuthError, Tenancy, extract_token};

/// Where the JWKS comes from: a local file, or an HTTP(S) endpoint.
#[derive(Debug, Clone)]
pub enum JwksSource {
    File(Utf8PathBuf),
    Url(Url),
}

impl JwksSource {
    pub fn parse(location: &str) -> anyhow::Result<Self> {
        if location.starts_with("http://") || location.starts_with("https://") {
            Ok(Self::Url(Url::parse(location)?))
        } else {
            Ok(Self::File(Utf8PathBuf::from(location)))
        }
    }
}

impl core::fmt::Display for JwksSource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::File(path) => write!(f, "{path}"),
            Self::Url(url) => write!(f, "{url}"),
        }
    }
}

/// Expected custom claims of the token payload. Missing claims default to
/// empty; wrong types fail verification.
#[derive(Debug, Deserialize)]
struct NamespaceClaims {
    #[serde(default)]
    namespaces: Vec<String>,
    #[serde(default)]
    labels: BTreeMap<String, Vec<String>>,
}

struct VerificationKey {
    decoding: DecodingKey,
    validation: Validation,
}

struct JwksState {
    keys: HashMap<String, VerificationKey>,
    /// Keys that were present in the document but couldn't be used, by `kid`.
    /// A token signed with one of these fails with the exclusion reason
    /// instead of looking like an unknown key.
    excluded: HashMap<String, String>,
    /// Base64 of the raw JWKS bytes; reloads with an unchanged fingerprint
    /// skip rebuilding the key set.
    fingerprint: String,
}

/// JWKS-backed key store with the same snapshot/swap discipline as the user
/// table: I/O and parsing happen outside the lock, the exclusive section is
/// only the pointer swap.
pub struct JwksStore {
    source: JwksSource,
    client: reqwest::Client,
    state: parking_lot::RwLock<Arc<JwksState>>,
}

impl JwksStore {
    pub async fn open(source: JwksSource, client: reqwest::Client) -> anyhow::Result<Self> {
        let raw = fetch_raw(&source, &client).await?;
        let state = build_state(&raw).with_context(|| format!("invalid JWKS from {source}"))?;

        Ok(Self {
            source,
            client,
            state: parking_lot::RwLock::new(Arc::new(state)),
        })
    }

    fn snapshot(&self) -> Arc<JwksState> {
        Arc::clone(&self.state.read())
    }

    pub async fn reload(&self) -> bool {
        let raw = match fetch_raw(&self.source, &self.client).await {
            Ok(raw) => raw,
            Err(error) => {
                warn!(source = %self.source, error = format!("{error:#}"), "JWKS reload failed; keeping previous keys");
                return false;
            }
        };

        if STANDARD.encode(&raw) == self.snapshot().fingerprint {
            debug!(source = %self.source, "JWKS content unchanged");
            return true;
        }

        match build_state(&raw) {
            Ok(state) => {
                let (usable, excluded) = (state.keys.len(), state.excluded.len());
                *self.state.write() = Arc::new(state);
                info!(source = %self.source, usable, excluded, "reloaded JWKS");
                true
            }
            Err(error) => {
                warn!(source = %self.source, error = format!("{error:#}"), "JWKS reload failed; keeping previous keys");
                false
            }
        }
    }
}

async fn fetch_raw(source: &JwksSource, client: &reqwest::Client) -> anyhow::Result<Vec<u8>> {
    match source {
        JwksSource::File(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("couldn't read JWKS file at {path}")),
        JwksSource::Url(url) => {
            let response = client
                .get(url.clone())
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .with_context(|| format!("couldn't fetch JWKS from {url}"))?;

            let body = response.bytes().await.context("couldn't read JWKS response body")?;

            Ok(body.to_vec())
        }
    }
}

fn build_state(raw: &[u8]) -> anyhow::Result<JwksState> {
    let jwks: JwkSet = serde_json::from_slice(raw).context("unparseable JWKS document")?;

    let mut keys = HashMap::new();
    let mut excluded = HashMap::new();

    for jwk in &jwks.keys {
        let Some(kid) = jwk.common.key_id.clone() else {
            warn!("ignoring JWKS key without a `kid`");
            continue;
        };

        let Some(algorithm) = jwk
            .common
            .key_algorithm
            .and_then(|alg| Algorithm::from_str(&alg.to_string()).ok())
        else {
            warn!(%kid, "excluding JWKS key with a missing or unsupported `alg`");
            excluded.insert(kid, "missing or unsupported `alg`".to_owned());
            continue;
        };

        let decoding = match DecodingKey::from_jwk(jwk) {
            Ok(decoding) => decoding,
            Err(error) => {
                warn!(%kid, %error, "excluding JWKS key that doesn't yield a decoding key");
                excluded.insert(kid, error.to_string());
                continue;
            }
        };

        // Registered claims are validated when present, but not required: the
        // issuer decides whether tokens expire.
        let mut validation = Validation::new(algorithm);
        validation.required_spec_claims = Default::default();
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.validate_aud = false;

        keys.insert(kid, VerificationKey { decoding, validation });
    }

    Ok(JwksState {
        keys,
        excluded,
        fingerprint: STANDARD.encode(raw),
    })
}

/// Bearer-token authenticator verifying signatures against the JWKS.
pub struct JwtAuth {
    store: JwksStore,
}

impl JwtAuth {
    pub async fn open(source: JwksSource, client: reqwest::Client) -> anyhow::Result<Self> {
        let store = JwksStore::open(source, client).await?;
        Ok(Self { store })
    }

    /// Builds an authenticator directly from raw JWKS bytes; `reload` has no
    /// meaningful source to read from.
    #[doc(hidden)]
    pub fn mock(raw: &[u8]) -> anyhow::Result<Self> {
        let state = build_state(raw)?;

        Ok(Self {
            store: JwksStore {
                source: JwksSource::File(Utf8PathBuf::from("<mock>")),
                client: reqwest::Client::new(),
                state: parking_lot::RwLock::new(Arc::new(state)),
            },
        })
    }

    pub fn authorize(&self, headers: &HeaderMap) -> Result<Tenancy, AuthError> {
        let token = extract_token(headers).ok_or(AuthError::MissingCredentials)?;

        let header = decode_header(token).map_err(AuthError::InvalidToken)?;
        let kid = header.kid.ok_or(AuthError::MissingKeyId)?;

        let state = self.store.snapshot();

        let Some(key) = state.keys.get(&kid) else {
            return Err(match state.excluded.get(&kid) {
                Some(reason) => AuthError::ExcludedKey {
                    kid,
                    reason: reason.clone(),
                },
                None => AuthError::UnknownKeyId(kid),
            });
        };

        let data = decode::<NamespaceClaims>(token, &key.decoding, &key.validation).map_err(|error| {
            match error.kind() {
                jsonwebtoken::errors::ErrorKind::Json(_) => AuthError::MalformedClaims(error),
                _ => AuthError::InvalidToken(error),
            }
        })?;

        Ok(Tenancy::new(data.claims.namespaces, data.claims.labels))
    }

    pub async fn reload(&self) -> bool {
        self.store.reload().await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use axum::http::HeaderValue;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    use super::*;

    const HMAC_JWKS: &str = r#"{
        "keys": [
            {
                "kty": "oct",
                "kid": "hmac-key",
                "alg": "HS256",
                "k": "bGFsYQ"
            }
        ]
    }"#;

    fn sign_hs256(kid: &str, secret: &[u8], claims: &serde_json::Value) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(kid.to_owned());
        encode(&header, claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    fn bearer_headers(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    fn now_secs() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    #[test]
    fn namespaces_claim_is_honoured() {
        let auth = JwtAuth::mock(HMAC_JWKS.as_bytes()).unwrap();
        let token = sign_hs256("hmac-key", b"lala", &json!({ "namespaces": ["prometheus", "app-1"] }));

        let tenancy = auth.authorize(&bearer_headers(&token)).unwrap();

        assert_eq!(tenancy.namespaces, vec!["prometheus", "app-1"]);
        assert!(tenancy.labels.is_empty());
    }

    #[test]
    fn labels_claim_is_honoured() {
        let auth = JwtAuth::mock(HMAC_JWKS.as_bytes()).unwrap();
        let token = sign_hs256(
            "hmac-key",
            b"lala",
            &json!({ "labels": { "app": ["ecom"], "team": ["europe"] } }),
        );

        let tenancy = auth.authorize(&bearer_headers(&token)).unwrap();

        assert!(tenancy.namespaces.is_empty());
        assert_eq!(tenancy.labels["app"], vec!["ecom"]);
        assert_eq!(tenancy.labels["team"], vec!["europe"]);
    }

    #[test]
    fn missing_claims_default_to_empty() {
        let auth = JwtAuth::mock(HMAC_JWKS.as_bytes()).unwrap();
        let token = sign_hs256("hmac-key", b"lala", &json!({}));

        let tenancy = auth.authorize(&bearer_headers(&token)).unwrap();

        assert!(tenancy.is_empty());
    }

    #[test]
    fn wrong_claim_types_fail_authorization() {
        let auth = JwtAuth::mock(HMAC_JWKS.as_bytes()).unwrap();
        let token = sign_hs256("hmac-key", b"lala", &json!({ "namespaces": "not-a-list" }));

        let result = auth.authorize(&bearer_headers(&token));

        assert!(matches!(result, Err(AuthError::MalformedClaims(_))));
    }

    #[test]
    fn bad_signature_is_rejected() {
        let auth = JwtAuth::mock(HMAC_JWKS.as_bytes()).unwrap();
        let token = sign_hs256("hmac-key", b"wrong-secret", &json!({ "namespaces": ["prometheus"] }));

        let result = auth.authorize(&bearer_headers(&token));

        assert!(matches!(result, Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn unknown_kid_is_rejected() {
        let auth = JwtAuth::mock(HMAC_JWKS.as_bytes()).unwrap();
        let token = sign_hs256("other-key", b"lala", &json!({ "namespaces": ["prometheus"] }));

        let result = auth.authorize(&bearer_headers(&token));

        assert!(matches!(result, Err(AuthError::UnknownKeyId(_))));
    }

    #[test]
    fn key_excluded_for_a_missing_alg_is_reported_as_such() {
        // Same key material as HMAC_JWKS, but without the `alg` the store
        // needs to pin a verification algorithm.
        let jwks = r#"{ "keys": [ { "kty": "oct", "kid": "hmac-key", "k": "bGFsYQ" } ] }"#;
        let auth = JwtAuth::mock(jwks.as_bytes()).unwrap();
        let token = sign_hs256("hmac-key", b"lala", &json!({ "namespaces": ["prometheus"] }));

        let result = auth.authorize(&bearer_headers(&token));

        assert!(matches!(result, Err(AuthError::ExcludedKey { kid, .. }) if kid == "hmac-key"));
    }

    #[test]
    fn missing_kid_is_rejected() {
        let auth = JwtAuth::mock(HMAC_JWKS.as_bytes()).unwrap();
        let token = encode(
            &Header::new(Algorithm::HS256),
            &json!({ "namespaces": ["prometheus"] }),
            &EncodingKey::from_secret(b"lala"),
        )
        .unwrap();

        let result = auth.authorize(&bearer_headers(&token));

        assert!(matches!(result, Err(AuthError::MissingKeyId)));
    }

    #[test]
    fn expired_token_is_rejected() {
        let auth = JwtAuth::mock(HMAC_JWKS.as_bytes()).unwrap();
        let token = sign_hs256(
            "hmac-key",
            b"lala",
            &json!({ "namespaces": ["prometheus"], "exp": now_secs() - 3600 }),
        );

        let result = auth.authorize(&bearer_headers(&token));

        assert!(matches!(result, Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn token_without_expiry_is_accepted() {
        let auth = JwtAuth::mock(HMAC_JWKS.as_bytes()).unwrap();
        let token = sign_hs256("hmac-key", b"lala", &json!({ "namespaces": ["prometheus"] }));

        assert!(auth.authorize(&bearer_headers(&token)).is_ok());
    }

    #[test]
    fn token_header_is_accepted_without_bearer_prefix() {
        let auth = JwtAuth::mock(HMAC_JWKS.as_bytes()).unwrap();
        let token = sign_hs256("hmac-key", b"lala", &json!({ "namespaces": ["prometheus"] }));

        let mut headers = HeaderMap::new();
        headers.insert("token", HeaderValue::from_str(&token).unwrap());

        assert!(auth.authorize(&headers).is_ok());
    }

    #[tokio::test]
    async fn reload_with_identical_bytes_is_a_no_op() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), HMAC_JWKS).unwrap();
        let path = Utf8PathBuf::from_path_buf(file.path().to_path_buf()).unwrap();

        let store = JwksStore::open(JwksSource::File(path), reqwest::Client::new())
            .await
            .unwrap();
        let before = store.snapshot();

        assert!(store.reload().await);

        // Identical fingerprint: the active state is the very same allocation.
        assert!(Arc::ptr_eq(&before, &store.snapshot()));
    }

    #[tokio::test]
    async fn reload_with_new_keys_swaps_the_state() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), HMAC_JWKS).unwrap();
        let path = Utf8PathBuf::from_path_buf(file.path().to_path_buf()).unwrap();

        let store = JwksStore::open(JwksSource::File(path), reqwest::Client::new())
            .await
            .unwrap();
        let before = store.snapshot();

        std::fs::write(
            file.path(),
            r#"{ "keys": [ { "kty": "oct", "kid": "next-key", "alg": "HS256", "k": "bmV4dA" } ] }"#,
        )
        .unwrap();

        assert!(store.reload().await);

        let after = store.snapshot();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(after.keys.contains_key("next-key"));
        assert!(!after.keys.contains_key("hmac-key"));
    }

    #[tokio::test]
    async fn reload_with_garbage_keeps_previous_state() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), HMAC_JWKS).unwrap();
        let path = Utf8PathBuf::from_path_buf(file.path().to_path_buf()).unwrap();

        let store = JwksStore::open(JwksSource::File(path), reqwest::Client::new())
            .await
            .unwrap();

        std::fs::write(file.path(), "not json").unwrap();

        assert!(!store.reload().await);
        assert!(store.snapshot().keys.contains_key("hmac-key"));
    }
}
