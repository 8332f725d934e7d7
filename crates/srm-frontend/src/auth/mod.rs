//! Token service of the REST API.
//!
//! - [`x509`]: certificate challenge-response
//! - [`jwt`]: RS256 access tokens, JWKS and OpenID metadata
//!
//! [`AuthService`] ties both to the store, which keeps the users that logged
//! in and the hashed refresh tokens.

pub mod error;
pub mod jwt;
pub mod x509;

use std::sync::Arc;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use srm_common::config::AuthConfig;
use srm_store::{RefreshTokenRecord, Store, UserRecord};
use tracing::{info, instrument, warn};

pub use error::{AuthError, AuthResult};
pub use jwt::{Claims, SigningKey, TokenIssuer, PERM_ADMIN, PERM_READ, PERM_WRITE};
pub use x509::{ChallengeAuthenticator, IssuedChallenge};

/// Tokens handed to a client after login or refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub session_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

/// SHA-256 hex of a refresh token; only the hash is stored.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn new_refresh_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct AuthService {
    issuer: TokenIssuer,
    challenges: ChallengeAuthenticator,
    store: Arc<dyn Store>,
    refresh_lifetime: i64,
}

impl AuthService {
    pub fn new(
        issuer: TokenIssuer,
        challenges: ChallengeAuthenticator,
        store: Arc<dyn Store>,
        refresh_lifetime: u64,
    ) -> Self {
        Self {
            issuer,
            challenges,
            store,
            refresh_lifetime: refresh_lifetime as i64,
        }
    }

    pub fn from_config(config: &AuthConfig, store: Arc<dyn Store>) -> AuthResult<Self> {
        Ok(Self::new(
            TokenIssuer::from_config(config)?,
            ChallengeAuthenticator::from_config(config)?,
            store,
            config.refresh_lifetime,
        ))
    }

    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    pub fn verify(&self, token: &str) -> AuthResult<Claims> {
        self.issuer.verify(token)
    }

    pub fn issue_challenge(&self, certificate_pem: &str) -> AuthResult<IssuedChallenge> {
        self.challenges.issue(certificate_pem)
    }

    async fn issue_pair(
        &self,
        subject: &str,
        session_id: &str,
        permissions: &[String],
        now: i64,
    ) -> AuthResult<TokenPair> {
        let access_token = self.issuer.issue(subject, session_id, permissions, now)?;
        let refresh_token = new_refresh_token();
        self.store
            .insert_refresh_token(&RefreshTokenRecord {
                token_hash: hash_token(&refresh_token),
                session_id: session_id.to_string(),
                subject: subject.to_string(),
                permissions: permissions.to_vec(),
                expires_at: now + self.refresh_lifetime,
                revoked: false,
                insertdate: now,
            })
            .await?;
        Ok(TokenPair {
            session_id: session_id.to_string(),
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.issuer.access_lifetime(),
        })
    }

    /// Answers a challenge and logs the certificate holder in.
    #[instrument(skip(self, signature))]
    pub async fn login(&self, challenge_id: &str, signature: &str, now: i64) -> AuthResult<TokenPair> {
        let identity = self.challenges.answer(challenge_id, signature, now)?;
        let existing = self.store.get_user(&identity.subject).await?;
        if existing.as_ref().is_some_and(|u| u.disabled) {
            warn!(subject = %identity.subject, "Login of a disabled user");
            return Err(AuthError::NotAllowed(identity.subject));
        }
        self.store
            .upsert_user(&UserRecord {
                username: identity.subject.clone(),
                permissions: identity.permissions.clone(),
                disabled: false,
                insertdate: existing.map_or(now, |u| u.insertdate),
            })
            .await?;
        info!(subject = %identity.subject, "Certificate login");
        self.issue_pair(&identity.subject, &identity.session_id, &identity.permissions, now)
            .await
    }

    /// Exchanges a refresh token for a new pair. The presented token is
    /// revoked, so each refresh token works once.
    #[instrument(skip(self, refresh_token))]
    pub async fn refresh(&self, session_id: &str, refresh_token: &str, now: i64) -> AuthResult<TokenPair> {
        let hash = hash_token(refresh_token);
        let record = self
            .store
            .get_refresh_token(&hash)
            .await?
            .filter(|r| r.session_id == session_id && r.is_usable(now))
            .ok_or(AuthError::InvalidRefresh)?;
        if !self.store.revoke_refresh_token(&hash).await? {
            return Err(AuthError::InvalidRefresh);
        }
        if self
            .store
            .get_user(&record.subject)
            .await?
            .is_some_and(|u| u.disabled)
        {
            return Err(AuthError::NotAllowed(record.subject));
        }
        self.store.delete_expired_refresh_tokens(now).await?;
        self.issue_pair(&record.subject, session_id, &record.permissions, now)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::x509::tests::{authenticator, sign, test_pki};
    use super::*;
    use pretty_assertions::assert_eq;
    use srm_store::MemoryStore;

    fn service(pki: &x509::tests::TestPki, store: Arc<MemoryStore>) -> AuthService {
        let config = AuthConfig {
            allowed_dns: vec!["/CN=dtn01.example.org".to_string()],
            ..Default::default()
        };
        AuthService::new(
            jwt::tests::issuer(),
            authenticator(pki, &config),
            store,
            config.refresh_lifetime,
        )
    }

    async fn login(auth: &AuthService, pki: &x509::tests::TestPki, now: i64) -> AuthResult<TokenPair> {
        let issued = auth.issue_challenge(&pki.leaf_pem)?;
        let signature = sign(&pki.leaf_key, &issued.challenge);
        auth.login(&issued.challenge_id, &signature, now).await
    }

    #[tokio::test]
    async fn test_login_then_refresh_rotates() {
        let pki = test_pki("dtn01.example.org");
        let store = Arc::new(MemoryStore::new());
        let auth = service(&pki, store.clone());
        let now = srm_common::now_epoch();

        let pair = login(&auth, &pki, now).await.unwrap();
        let claims = auth.verify(&pair.access_token).unwrap();
        assert_eq!(claims.sub, "/CN=dtn01.example.org");
        assert_eq!(claims.session_id, pair.session_id);
        assert_eq!(pair.refresh_token.len(), 64);
        assert!(store.get_user("/CN=dtn01.example.org").await.unwrap().is_some());

        let next = auth
            .refresh(&pair.session_id, &pair.refresh_token, now + 10)
            .await
            .unwrap();
        assert_eq!(next.session_id, pair.session_id);
        assert_ne!(next.refresh_token, pair.refresh_token);

        // The rotated token no longer works.
        let err = auth
            .refresh(&pair.session_id, &pair.refresh_token, now + 20)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidRefresh));
    }

    #[tokio::test]
    async fn test_refresh_checks_session_and_expiry() {
        let pki = test_pki("dtn01.example.org");
        let auth = service(&pki, Arc::new(MemoryStore::new()));
        let now = srm_common::now_epoch();
        let pair = login(&auth, &pki, now).await.unwrap();

        assert!(auth.refresh("other-session", &pair.refresh_token, now).await.is_err());
        let lifetime = AuthConfig::default().refresh_lifetime as i64;
        assert!(auth
            .refresh(&pair.session_id, &pair.refresh_token, now + lifetime)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_disabled_user_cannot_login() {
        let pki = test_pki("dtn01.example.org");
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_user(&UserRecord {
                username: "/CN=dtn01.example.org".to_string(),
                permissions: Vec::new(),
                disabled: true,
                insertdate: 0,
            })
            .await
            .unwrap();
        let auth = service(&pki, store);
        let err = login(&auth, &pki, srm_common::now_epoch()).await.unwrap_err();
        assert!(matches!(err, AuthError::NotAllowed(_)));
    }

    #[test]
    fn test_hash_token_is_hex_sha256() {
        assert_eq!(hash_token("abc").len(), 64);
        assert_ne!(hash_token("abc"), hash_token("abd"));
    }
}
