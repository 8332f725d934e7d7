//! Certificate challenge-response.
//!
//! A client posts its certificate and receives 32 random bytes. It signs
//! them with the certificate key and posts the signature back. Challenges
//! are single use and expire after a configured TTL.

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dashmap::DashMap;
use rand::RngCore;
use regex::Regex;
use srm_common::config::AuthConfig;
use tracing::{debug, warn};
use x509_parser::certificate::X509Certificate;
use x509_parser::objects::{oid2abbrev, oid_registry};
use x509_parser::oid_registry::{OID_KEY_TYPE_EC_PUBLIC_KEY, OID_PKCS1_RSAENCRYPTION};
use x509_parser::pem::Pem;
use x509_parser::prelude::{ASN1Time, FromDer};
use x509_parser::x509::X509Name;

use super::error::{AuthError, AuthResult};
use super::jwt::{PERM_ADMIN, PERM_READ, PERM_WRITE};

pub const CHALLENGE_BYTES: usize = 32;

/// A challenge handed out and not answered yet.
#[derive(Debug, Clone)]
struct Pending {
    challenge: Vec<u8>,
    certificate: Vec<u8>,
    expires: Instant,
}

/// What the client receives after posting its certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedChallenge {
    pub challenge_id: String,
    /// Base64 of the random bytes to sign.
    pub challenge: String,
    pub ttl: u64,
}

/// The DN as `/K=V/K=V`.
pub fn subject_dn(name: &X509Name<'_>) -> String {
    let mut out = String::new();
    for rdn in name.iter() {
        for attr in rdn.iter() {
            let key = oid2abbrev(attr.attr_type(), oid_registry())
                .map(str::to_string)
                .unwrap_or_else(|_| attr.attr_type().to_id_string());
            let value = attr.as_str().unwrap_or_default();
            out.push('/');
            out.push_str(&key);
            out.push('=');
            out.push_str(value);
        }
    }
    out
}

/// Decodes a PEM certificate into DER.
pub fn certificate_der(pem: &str) -> AuthResult<Vec<u8>> {
    let pem = Pem::iter_from_buffer(pem.as_bytes())
        .next()
        .ok_or_else(|| AuthError::Certificate("no PEM block".to_string()))?
        .map_err(|e| AuthError::Certificate(e.to_string()))?;
    X509Certificate::from_der(&pem.contents).map_err(|e| AuthError::Certificate(e.to_string()))?;
    Ok(pem.contents)
}

fn parse(der: &[u8]) -> AuthResult<X509Certificate<'_>> {
    X509Certificate::from_der(der)
        .map(|(_, cert)| cert)
        .map_err(|e| AuthError::Certificate(e.to_string()))
}

/// Verifies `signature` over `message` with the certificate's key:
/// ECDSA P-256 with SHA-256 (DER or fixed-size) or RSA-PSS with SHA-256.
pub fn verify_signature(cert: &X509Certificate<'_>, message: &[u8], signature: &[u8]) -> AuthResult<()> {
    let spki = cert.public_key();
    let key_bytes = spki.subject_public_key.data.as_ref();
    let bad = |e: String| AuthError::BadSignature(e);
    if spki.algorithm.algorithm == OID_KEY_TYPE_EC_PUBLIC_KEY {
        use p256::ecdsa::signature::Verifier;
        use p256::ecdsa::{Signature, VerifyingKey};
        let key = VerifyingKey::from_sec1_bytes(key_bytes).map_err(|e| bad(e.to_string()))?;
        let sig = Signature::from_der(signature)
            .or_else(|_| Signature::from_slice(signature))
            .map_err(|e| bad(e.to_string()))?;
        key.verify(message, &sig).map_err(|e| bad(e.to_string()))
    } else if spki.algorithm.algorithm == OID_PKCS1_RSAENCRYPTION {
        use rsa::pkcs1::DecodeRsaPublicKey;
        use rsa::signature::Verifier;
        let key = rsa::RsaPublicKey::from_pkcs1_der(key_bytes).map_err(|e| bad(e.to_string()))?;
        let verifier = rsa::pss::VerifyingKey::<sha2::Sha256>::new(key);
        let sig = rsa::pss::Signature::try_from(signature).map_err(|e| bad(e.to_string()))?;
        verifier.verify(message, &sig).map_err(|e| bad(e.to_string()))
    } else {
        Err(bad(format!(
            "unsupported key algorithm {}",
            spki.algorithm.algorithm.to_id_string()
        )))
    }
}

/// Trusted CA certificates, kept as DER.
#[derive(Debug, Default, Clone)]
pub struct CaStore {
    certificates: Vec<Vec<u8>>,
}

impl CaStore {
    /// Loads every PEM certificate of `dir`. Unreadable files are skipped.
    pub fn load_dir(dir: &Path) -> Self {
        let mut store = Self::default();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "CA directory unreadable");
                return store;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(text) = fs::read_to_string(&path) else {
                continue;
            };
            for pem in Pem::iter_from_buffer(text.as_bytes()).flatten() {
                if pem.label == "CERTIFICATE" {
                    store.certificates.push(pem.contents);
                }
            }
        }
        debug!(dir = %dir.display(), count = store.certificates.len(), "Loaded CA certificates");
        store
    }

    pub fn add_pem(&mut self, pem: &str) -> AuthResult<()> {
        self.certificates.push(certificate_der(pem)?);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    /// True when a CA with the certificate's issuer name signed it.
    pub fn verify_issuer(&self, cert: &X509Certificate<'_>) -> bool {
        self.certificates.iter().any(|der| {
            parse(der).is_ok_and(|ca| {
                ca.subject() == cert.issuer()
                    && cert.verify_signature(Some(ca.public_key())).is_ok()
            })
        })
    }
}

/// Exact and regex subject allowlist with its admin subset.
#[derive(Debug, Clone, Default)]
pub struct DnPolicy {
    exact: Vec<String>,
    patterns: Vec<Regex>,
    admins: Vec<String>,
}

impl DnPolicy {
    pub fn from_config(config: &AuthConfig) -> AuthResult<Self> {
        let patterns = config
            .allowed_dn_regex
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| AuthError::Key {
                    path: "allowed_dn_regex".to_string(),
                    message: format!("{}: {}", p, e),
                })
            })
            .collect::<AuthResult<Vec<_>>>()?;
        Ok(Self {
            exact: config.allowed_dns.clone(),
            patterns,
            admins: config.admin_dns.clone(),
        })
    }

    /// Permissions of an allowed DN, `None` when the DN is not allowed.
    pub fn permissions(&self, dn: &str) -> Option<Vec<String>> {
        let is_admin = self.admins.iter().any(|a| a == dn);
        let allowed = is_admin
            || self.exact.iter().any(|a| a == dn)
            || self.patterns.iter().any(|r| r.is_match(dn));
        if !allowed {
            return None;
        }
        let mut permissions = vec![PERM_READ.to_string(), PERM_WRITE.to_string()];
        if is_admin {
            permissions.push(PERM_ADMIN.to_string());
        }
        Some(permissions)
    }
}

/// An authenticated certificate holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub permissions: Vec<String>,
    /// Id of the answered challenge, reused as the session id.
    pub session_id: String,
}

/// Pending challenges plus the checks applied when one is answered.
pub struct ChallengeAuthenticator {
    pending: DashMap<String, Pending>,
    ttl: Duration,
    cas: CaStore,
    dns: DnPolicy,
}

impl ChallengeAuthenticator {
    pub fn new(cas: CaStore, dns: DnPolicy, ttl: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            ttl,
            cas,
            dns,
        }
    }

    pub fn from_config(config: &AuthConfig) -> AuthResult<Self> {
        Ok(Self::new(
            CaStore::load_dir(&config.ca_dir),
            DnPolicy::from_config(config)?,
            Duration::from_secs(config.challenge_ttl),
        ))
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        self.pending.retain(|_, p| p.expires > now);
    }

    /// Stores a fresh challenge for the certificate.
    pub fn issue(&self, certificate_pem: &str) -> AuthResult<IssuedChallenge> {
        self.purge_expired();
        let certificate = certificate_der(certificate_pem)?;
        let mut challenge = vec![0u8; CHALLENGE_BYTES];
        rand::thread_rng().fill_bytes(&mut challenge);
        let challenge_id = uuid::Uuid::new_v4().simple().to_string();
        let encoded = STANDARD.encode(&challenge);
        self.pending.insert(
            challenge_id.clone(),
            Pending {
                challenge,
                certificate,
                expires: Instant::now() + self.ttl,
            },
        );
        Ok(IssuedChallenge {
            challenge_id,
            challenge: encoded,
            ttl: self.ttl.as_secs(),
        })
    }

    /// Consumes the challenge and runs every certificate check. `now` is the
    /// epoch the validity window is checked against.
    pub fn answer(&self, challenge_id: &str, signature_b64: &str, now: i64) -> AuthResult<Identity> {
        let (_, pending) = self
            .pending
            .remove(challenge_id)
            .ok_or_else(|| AuthError::UnknownChallenge(challenge_id.to_string()))?;
        if pending.expires <= Instant::now() {
            return Err(AuthError::UnknownChallenge(challenge_id.to_string()));
        }
        let signature = STANDARD
            .decode(signature_b64.trim())
            .map_err(|e| AuthError::BadSignature(e.to_string()))?;
        let cert = parse(&pending.certificate)?;
        verify_signature(&cert, &pending.challenge, &signature)?;

        let at = ASN1Time::from_timestamp(now).map_err(|e| AuthError::Certificate(e.to_string()))?;
        if !cert.validity().is_valid_at(at) {
            return Err(AuthError::Certificate("outside its validity window".to_string()));
        }
        if !self.cas.verify_issuer(&cert) {
            return Err(AuthError::Certificate(format!(
                "issuer {} is not trusted",
                subject_dn(cert.issuer())
            )));
        }
        let subject = subject_dn(cert.subject());
        let permissions = self
            .dns
            .permissions(&subject)
            .ok_or_else(|| AuthError::NotAllowed(subject.clone()))?;
        Ok(Identity {
            subject,
            permissions,
            session_id: challenge_id.to_string(),
        })
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
