//! Bearer credentials for inter-agent messages.
//!
//! Every envelope carries a bearer token proving sender identity. Receivers
//! verify the token before processing. Tokens are never written to the audit
//! trail; the communication log stores a digest fingerprint instead.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A shared-secret bearer token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Constant-time-ish comparison via digest equality, so a mismatched
    /// token does not leak prefix length through timing.
    pub fn verify(&self, presented: &BearerToken) -> bool {
        Sha256::digest(self.0.as_bytes()) == Sha256::digest(presented.0.as_bytes())
    }

    /// Short hex digest safe to record in the communication log.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        let mut hex = String::with_capacity(16);
        for byte in digest.iter().take(8) {
            hex.push_str(&format!("{:02x}", byte));
        }
        hex
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// The secret must not leak through Debug output or logs.
impl std::fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BearerToken({})", self.fingerprint())
    }
}
