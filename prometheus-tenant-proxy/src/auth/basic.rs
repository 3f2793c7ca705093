use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context as _;
use axum::http::HeaderMap;
use axum_extra::headers::authorization::Basic;
use axum_extra::headers::{Authorization, HeaderMapExt as _};
use camino::Utf8PathBuf;
use serde::Deserialize;
use subtle::ConstantTimeEq as _;

use crate::auth::{AuthError, Tenancy};

/// One entry of the `users:` table in the AuthN YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub username: String,
    pub password: String,
    /// Primary namespace; merged in front of `namespaces` when non-empty.
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, Vec<String>>,
}

impl User {
    fn tenancy(&self) -> Tenancy {
        let mut namespaces = Vec::with_capacity(self.namespaces.len() + 1);

        if !self.namespace.is_empty() {
            namespaces.push(self.namespace.clone());
        }

        namespaces.extend(self.namespaces.iter().cloned());

        Tenancy::new(namespaces, self.labels.clone())
    }
}

#[derive(Debug, Deserialize)]
struct AuthnFile {
    #[serde(default)]
    users: Vec<User>,
}

/// File-backed user table. Readers take a cheap snapshot; the reloader swaps
/// the whole table at once so no request ever observes a half-loaded state.
pub struct UserStore {
    path: Utf8PathBuf,
    users: parking_lot::RwLock<Arc<Vec<User>>>,
}

impl UserStore {
    pub async fn open(path: Utf8PathBuf) -> anyhow::Result<Self> {
        let users = Self::load(&path).await?;

        Ok(Self {
            path,
            users: parking_lot::RwLock::new(Arc::new(users)),
        })
    }

    async fn load(path: &Utf8PathBuf) -> anyhow::Result<Vec<User>> {
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("couldn't read AuthN file at {path}"))?;

        let parsed: AuthnFile =
            serde_yaml::from_slice(&raw).with_context(|| format!("invalid AuthN file at {path}"))?;

        Ok(parsed.users)
    }

    /// Returns the currently active table; never blocks other readers.
    pub fn snapshot(&self) -> Arc<Vec<User>> {
        Arc::clone(&self.users.read())
    }

    /// Re-reads the source file. On failure the previous table stays live.
    pub async fn reload(&self) -> bool {
        match Self::load(&self.path).await {
            Ok(users) => {
                *self.users.write() = Arc::new(users);
                info!(path = %self.path, "reloaded AuthN configuration");
                true
            }
            Err(error) => {
                warn!(path = %self.path, error = format!("{error:#}"), "AuthN reload failed; keeping previous users");
                false
            }
        }
    }
}

/// HTTP Basic authenticator over the file-backed user table.
pub struct BasicAuth {
    store: UserStore,
}

impl BasicAuth {
    pub async fn open(users_file: Utf8PathBuf) -> anyhow::Result<Self> {
        let store = UserStore::open(users_file).await?;
        Ok(Self { store })
    }

    pub fn authorize(&self, headers: &HeaderMap) -> Result<Tenancy, AuthError> {
        let credentials = headers
            .typed_get::<Authorization<Basic>>()
            .ok_or(AuthError::MissingCredentials)?;

        let users = self.store.snapshot();

        for user in users.iter() {
            // Timing-safe comparison over the raw bytes; string equality would
            // leak how many leading bytes match.
            let username_matches = user.username.as_bytes().ct_eq(credentials.username().as_bytes());
            let password_matches = user.password.as_bytes().ct_eq(credentials.password().as_bytes());

            if bool::from(username_matches & password_matches) {
                return Ok(user.tenancy());
            }
        }

        Err(AuthError::InvalidCredentials)
    }

    pub async fn reload(&self) -> bool {
        self.store.reload().await
    }
}
