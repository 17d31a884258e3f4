//! Credential storage and bearer-token issuance.
//!
//! A single user account lives in the config file: the password as a bcrypt
//! hash, the currently valid refresh token as a SHA-256 digest (rotated on
//! every issue, so a stolen old refresh token is useless). The token
//! endpoint implements the OAuth2 password and refresh-token grants; every
//! other endpoint carries a Bearer access token.

use std::sync::Arc;

use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::{component, ConfigRepo};
use crate::error::{Error, Result};

const ACCESS_TOKEN_HOURS: i64 = 24;
const REFRESH_TOKEN_DAYS: i64 = 30;

const DEFAULT_USERNAME: &str = "admin";
const DEFAULT_PASSWORD: &str = "adminadmin";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub username: String,
    /// bcrypt hash of the account password.
    #[serde(default)]
    pub password_hash: String,
    /// SHA-256 digest of the refresh token issued last; empty means no
    /// refresh token is currently valid.
    #[serde(default)]
    pub refresh_token_hash: String,
    #[serde(default)]
    pub jwt_secret: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    typ: String,
}

pub struct AuthService {
    repo: Arc<ConfigRepo>,
    state: RwLock<AuthConfig>,
}

/// Refresh tokens are stored hashed, never verbatim.
fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn hash_password(password: &str) -> Result<String> {
    hash(password, DEFAULT_COST)
        .map_err(|e| Error::Internal(anyhow::anyhow!("hash password: {e}")))
}

fn verify_password(password: &str, password_hash: &str) -> bool {
    verify(password, password_hash).unwrap_or(false)
}

impl AuthService {
    /// Loads credentials from the config file, seeding the default account
    /// and a fresh token secret on first boot.
    pub fn new(repo: Arc<ConfigRepo>) -> Result<Arc<Self>> {
        let mut config: AuthConfig = repo
            .component_config(component::AUTH)
            .map_err(Error::Internal)?;
        if config.username.is_empty() || config.jwt_secret.is_empty() {
            config = AuthConfig {
                username: DEFAULT_USERNAME.to_string(),
                password_hash: hash_password(DEFAULT_PASSWORD)?,
                refresh_token_hash: String::new(),
                jwt_secret: format!("{}{}", Uuid::new_v4(), Uuid::new_v4()),
            };
            repo.set_component_config(component::AUTH, &config)
                .map_err(Error::Internal)?;
        }
        Ok(Arc::new(Self {
            repo,
            state: RwLock::new(config),
        }))
    }

    pub fn authorize(&self, username: &str, password: &str) -> Result<Credentials> {
        if username.is_empty() || password.is_empty() {
            return Err(Error::bad_request("username and password are required"));
        }
        let config = self.state.read().clone();
        if username != config.username || !verify_password(password, &config.password_hash) {
            return Err(Error::unauthenticated("invalid username or password"));
        }
        self.issue(config)
    }

    pub fn refresh_credentials(&self, refresh_token: &str) -> Result<Credentials> {
        if refresh_token.is_empty() {
            return Err(Error::bad_request("refresh token is required"));
        }
        let config = self.state.read().clone();
        let claims = decode_claims(refresh_token, &config)?;
        if claims.typ != "refresh" {
            return Err(Error::unauthenticated("not a refresh token"));
        }
        // Rotation check: only the most recently issued refresh token is
        // stored (hashed); anything older was superseded.
        if config.refresh_token_hash.is_empty()
            || hash_token(refresh_token) != config.refresh_token_hash
        {
            return Err(Error::unauthenticated("refresh token has been superseded"));
        }
        self.issue(config)
    }

    pub fn check_access_token(&self, token: &str) -> Result<()> {
        if token.is_empty() {
            return Err(Error::unauthenticated("missing bearer token"));
        }
        let config = self.state.read().clone();
        let claims = decode_claims(token, &config)?;
        if claims.typ != "access" {
            return Err(Error::unauthenticated("not an access token"));
        }
        Ok(())
    }

    pub fn update_user(&self, username: &str, password: &str) -> Result<()> {
        if username.is_empty() || password.is_empty() {
            return Err(Error::bad_request("username and password are required"));
        }
        let config = AuthConfig {
            username: username.to_string(),
            password_hash: hash_password(password)?,
            // Changing credentials invalidates any outstanding refresh token.
            refresh_token_hash: String::new(),
            jwt_secret: self.state.read().jwt_secret.clone(),
        };
        self.persist(config)
    }

    /// Signs a new token pair and records the refresh token's hash.
    fn issue(&self, mut config: AuthConfig) -> Result<Credentials> {
        let key = EncodingKey::from_secret(config.jwt_secret.as_bytes());
        let access = Claims {
            sub: config.username.clone(),
            exp: (Utc::now() + Duration::hours(ACCESS_TOKEN_HOURS)).timestamp(),
            typ: "access".to_string(),
        };
        let refresh = Claims {
            sub: config.username.clone(),
            exp: (Utc::now() + Duration::days(REFRESH_TOKEN_DAYS)).timestamp(),
            typ: "refresh".to_string(),
        };
        let credentials = Credentials {
            access_token: encode(&Header::default(), &access, &key)
                .map_err(|e| Error::Internal(anyhow::anyhow!("sign token: {e}")))?,
            refresh_token: encode(&Header::default(), &refresh, &key)
                .map_err(|e| Error::Internal(anyhow::anyhow!("sign token: {e}")))?,
        };

        config.refresh_token_hash = hash_token(&credentials.refresh_token);
        self.persist(config)?;
        Ok(credentials)
    }

    fn persist(&self, config: AuthConfig) -> Result<()> {
        self.repo
            .set_component_config(component::AUTH, &config)
            .map_err(Error::Internal)?;
        *self.state.write() = config;
        Ok(())
    }
}

fn decode_claims(token: &str, config: &AuthConfig) -> Result<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| Error::unauthenticated("invalid or expired token"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> Arc<AuthService> {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(ConfigRepo::open(dir.path().join("config.yaml")).unwrap());
        // Leak the tempdir so the config file outlives the test body.
        std::mem::forget(dir);
        AuthService::new(repo).unwrap()
    }

    #[test]
    fn password_grant_and_token_check() {
        let auth = service();
        let credentials = auth.authorize("admin", "adminadmin").unwrap();
        auth.check_access_token(&credentials.access_token).unwrap();

        // Refresh tokens are not valid as access tokens.
        assert!(matches!(
            auth.check_access_token(&credentials.refresh_token),
            Err(Error::Unauthenticated(_))
        ));
    }

    #[test]
    fn wrong_password_is_unauthenticated() {
        let auth = service();
        assert!(matches!(
            auth.authorize("admin", "nope"),
            Err(Error::Unauthenticated(_))
        ));
        assert!(matches!(
            auth.authorize("", ""),
            Err(Error::BadRequest(_))
        ));
    }

    #[test]
    fn refresh_grant_rotates_the_token() {
        let auth = service();
        let first = auth.authorize("admin", "adminadmin").unwrap();
        let second = auth.refresh_credentials(&first.refresh_token).unwrap();
        auth.check_access_token(&second.access_token).unwrap();

        // The superseded refresh token no longer works.
        assert!(matches!(
            auth.refresh_credentials(&first.refresh_token),
            Err(Error::Unauthenticated(_))
        ));
        // Neither does an access token in the refresh slot.
        assert!(matches!(
            auth.refresh_credentials(&second.access_token),
            Err(Error::Unauthenticated(_))
        ));
    }

    #[test]
    fn updated_credentials_replace_old_ones() {
        let auth = service();
        let old = auth.authorize("admin", "adminadmin").unwrap();
        auth.update_user("me", "secret-enough").unwrap();

        assert!(auth.authorize("admin", "adminadmin").is_err());
        auth.authorize("me", "secret-enough").unwrap();
        // Outstanding refresh tokens die with the credential change.
        assert!(matches!(
            auth.refresh_credentials(&old.refresh_token),
            Err(Error::Unauthenticated(_))
        ));
    }
}
