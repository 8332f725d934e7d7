//! RS256 access tokens and the key set that verifies them.

use std::fs;
use std::path::Path;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use srm_common::config::AuthConfig;
use tracing::debug;

use super::error::{AuthError, AuthResult};

pub const PERM_READ: &str = "read";
pub const PERM_WRITE: &str = "write";
pub const PERM_ADMIN: &str = "admin";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub session_id: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl Claims {
    /// `admin` grants every permission.
    pub fn has(&self, permission: &str) -> bool {
        self.permissions
            .iter()
            .any(|p| p == permission || p == PERM_ADMIN)
    }

    pub fn require(&self, permission: &str) -> AuthResult<()> {
        if self.has(permission) {
            Ok(())
        } else {
            Err(AuthError::Forbidden(permission.to_string()))
        }
    }
}

/// One RSA signing key with its public half.
pub struct SigningKey {
    kid: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
    n: String,
    e: String,
}

impl SigningKey {
    /// Loads a PKCS#8 PEM private key. The key id is the first 16 hex
    /// characters of the SHA-256 of the DER public key info.
    pub fn from_pem(pem: &str, origin: &str) -> AuthResult<Self> {
        let key_error = |message: String| AuthError::Key {
            path: origin.to_string(),
            message,
        };
        let private = RsaPrivateKey::from_pkcs8_pem(pem).map_err(|e| key_error(e.to_string()))?;
        let public = RsaPublicKey::from(&private);
        let spki = public
            .to_public_key_der()
            .map_err(|e| key_error(e.to_string()))?;
        let kid = hex::encode(Sha256::digest(spki.as_bytes()))[..16].to_string();
        let n = URL_SAFE_NO_PAD.encode(public.n().to_bytes_be());
        let e = URL_SAFE_NO_PAD.encode(public.e().to_bytes_be());
        let encoding =
            EncodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| key_error(e.to_string()))?;
        let decoding = DecodingKey::from_rsa_components(&n, &e).map_err(|e| key_error(e.to_string()))?;
        Ok(Self {
            kid,
            encoding,
            decoding,
            n,
            e,
        })
    }

    pub fn from_file(path: &Path) -> AuthResult<Self> {
        let pem = fs::read_to_string(path).map_err(|e| AuthError::Key {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_pem(&pem, &path.display().to_string())
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    fn jwk(&self) -> Value {
        json!({
            "kty": "RSA",
            "use": "sig",
            "alg": "RS256",
            "kid": self.kid,
            "n": self.n,
            "e": self.e,
        })
    }
}

/// Signs with the current key, verifies with current and previous.
pub struct TokenIssuer {
    current: SigningKey,
    previous: Option<SigningKey>,
    issuer: String,
    audience: String,
    access_lifetime: i64,
}

impl TokenIssuer {
    pub fn new(current: SigningKey, previous: Option<SigningKey>, config: &AuthConfig) -> Self {
        Self {
            current,
            previous,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            access_lifetime: config.access_lifetime as i64,
        }
    }

    pub fn from_config(config: &AuthConfig) -> AuthResult<Self> {
        let current = SigningKey::from_file(&config.private_key)?;
        let previous = config
            .previous_private_key
            .as_deref()
            .map(SigningKey::from_file)
            .transpose()?;
        Ok(Self::new(current, previous, config))
    }

    pub fn access_lifetime(&self) -> i64 {
        self.access_lifetime
    }

    pub fn issue(
        &self,
        subject: &str,
        session_id: &str,
        permissions: &[String],
        now: i64,
    ) -> AuthResult<String> {
        let claims = Claims {
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            sub: subject.to_string(),
            iat: now,
            exp: now + self.access_lifetime,
            session_id: session_id.to_string(),
            permissions: permissions.to_vec(),
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.current.kid.clone());
        let token = encode(&header, &claims, &self.current.encoding)?;
        debug!(subject, kid = %self.current.kid, exp = claims.exp, "Issued access token");
        Ok(token)
    }

    fn key(&self, kid: Option<&str>) -> AuthResult<&SigningKey> {
        let Some(kid) = kid else {
            return Ok(&self.current);
        };
        std::iter::once(&self.current)
            .chain(self.previous.as_ref())
            .find(|k| k.kid == kid)
            .ok_or_else(|| AuthError::InvalidToken(format!("unknown key id {}", kid)))
    }

    /// Checks signature, expiry, issuer and audience.
    pub fn verify(&self, token: &str) -> AuthResult<Claims> {
        let header = decode_header(token)?;
        let key = self.key(header.kid.as_deref())?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        Ok(decode::<Claims>(token, &key.decoding, &validation)?.claims)
    }

    pub fn jwks(&self) -> Value {
        let keys: Vec<Value> = std::iter::once(&self.current)
            .chain(self.previous.as_ref())
            .map(SigningKey::jwk)
            .collect();
        json!({ "keys": keys })
    }

    pub fn openid_configuration(&self, webdomain: &str) -> Value {
        let base = webdomain.trim_end_matches('/');
        json!({
            "issuer": self.issuer,
            "jwks_uri": format!("{}/.well-known/jwks.json", base),
            "token_endpoint": format!("{}/m2m/token", base),
            "id_token_signing_alg_values_supported": ["RS256"],
            "response_types_supported": ["token"],
            "subject_types_supported": ["public"],
            "grant_types_supported": ["refresh_token", "urn:ietf:params:oauth:grant-type:jwt-bearer"],
        })
    }
}
