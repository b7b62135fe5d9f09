//! External collaborator seams: identity lookup and directory lookup.
//!
//! The messaging core never manages accounts or business profiles. It
//! consumes them through two read-only contracts: a [`TokenVerifier`] that
//! resolves a bearer credential to an authenticated participant, and a
//! [`Directory`] that resolves participant ids to display metadata.

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use dashmap::DashMap;

type HmacSha256 = Hmac<Sha256>;

/// Which side of a conversation a participant sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Business,
}

/// An authenticated participant, as resolved from a credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub role: Role,
    pub name: String,
}

/// Display metadata for a directory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub role: Role,
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

/// Resolves participant ids to display metadata. Never mutated by the core.
pub trait Directory: Send + Sync {
    fn lookup(&self, id: &str) -> Option<Profile>;
}

/// Resolves a bearer credential to an authenticated participant.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<Participant>;
}

// ---------------------------------------------------------------------------
// HMAC-signed bearer tokens
// ---------------------------------------------------------------------------

/// Token format: `b64url(claims_json) "." b64url(hmac_sha256(secret, claims_b64))`.
pub struct HmacTokenVerifier {
    secret: Vec<u8>,
}

impl HmacTokenVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Issue a token for a participant. The account service is the real
    /// issuer in production; this exists for tooling and tests.
    pub fn issue(&self, participant: &Participant) -> String {
        let claims = serde_json::to_vec(participant).expect("participant serializes");
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&claims);
        let sig = hmac_sha256(&self.secret, payload.as_bytes());
        let sig_b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(sig);
        format!("{payload}.{sig_b64}")
    }
}

impl TokenVerifier for HmacTokenVerifier {
    fn verify(&self, token: &str) -> Option<Participant> {
        let (payload, sig_b64) = token.split_once('.')?;
        let presented = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(sig_b64)
            .ok()?;
        let expected = hmac_sha256(&self.secret, payload.as_bytes());
        if !secure_compare(&presented, &expected) {
            return None;
        }
        let claims = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(payload)
            .ok()?;
        serde_json::from_slice(&claims).ok()
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC: any key size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time comparison of two byte strings (timing-attack safe).
fn secure_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

// ---------------------------------------------------------------------------
// In-memory directory
// ---------------------------------------------------------------------------

/// Directory backed by a process-local map. The deployed directory proxies
/// the platform's account and business-profile services; this stands in for
/// them in tests and single-box setups.
#[derive(Default)]
pub struct InMemoryDirectory {
    profiles: DashMap<String, Profile>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: Profile) {
        self.profiles.insert(profile.id.clone(), profile);
    }
}

impl Directory for InMemoryDirectory {
    fn lookup(&self, id: &str) -> Option<Profile> {
        self.profiles.get(id).map(|p| p.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant() -> Participant {
        Participant {
            id: "cust-1".into(),
            role: Role::Customer,
            name: "Alice".into(),
        }
    }

    #[test]
    fn token_roundtrip() {
        let verifier = HmacTokenVerifier::new("test-secret");
        let token = verifier.issue(&participant());
        let resolved = verifier.verify(&token).expect("token verifies");
        assert_eq!(resolved.id, "cust-1");
        assert_eq!(resolved.role, Role::Customer);
    }

    #[test]
    fn tampered_token_is_rejected() {
        let verifier = HmacTokenVerifier::new("test-secret");
        let token = verifier.issue(&participant());
        let mut forged = token.clone();
        forged.replace_range(0..1, "x");
        assert!(verifier.verify(&forged).is_none());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let issuer = HmacTokenVerifier::new("secret-a");
        let verifier = HmacTokenVerifier::new("secret-b");
        let token = issuer.issue(&participant());
        assert!(verifier.verify(&token).is_none());
    }
}
