//! Digest Authentication
//!
//! Single responsibility: turn a device challenge into the credential echoed
//! back in the `auth` field of every request.
//!
//! # Authentication Flow
//!
//! 1. A request without credentials is answered with error code 401. The
//!    error message is itself a JSON challenge:
//!    `{"auth_type":"digest","nonce":1700000000,"nc":1,"realm":"<device id>","algorithm":"SHA-256"}`
//! 2. The client computes
//!    - `ha1 = sha256("<user>:<realm>:<password>")`
//!    - `ha2 = sha256("dummy_method:dummy_uri")`
//!    - `response = sha256("<ha1>:<nonce>:<nc>:<cnonce>:auth:<ha2>")`
//! 3. The resulting [`AuthCredential`] is cached on the client and attached
//!    to every later request on the connection.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Result, RpcError};

/// Hex SHA-256 of `dummy_method:dummy_uri`; the device hashes the same fixed string.
pub const DUMMY_HA2: &str = "6370ec69915103833b5222b368555393393f098bfbfbb59f47e0590af135f062";

const DIGEST_AUTH_TYPE: &str = "digest";
const SHA256_ALGORITHM: &str = "SHA-256";

fn default_nc() -> u32 {
    1
}

/// Challenge parsed from the message of a 401 error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthChallenge {
    pub auth_type: String,
    pub nonce: u64,
    #[serde(default = "default_nc")]
    pub nc: u32,
    pub realm: String,
    pub algorithm: String,
}

impl AuthChallenge {
    /// Parse and validate the challenge embedded in an error message.
    pub fn parse(message: &str) -> Result<Self> {
        let challenge: Self =
            serde_json::from_str(message).map_err(|e| RpcError::Challenge(e.to_string()))?;

        if challenge.auth_type != DIGEST_AUTH_TYPE {
            return Err(RpcError::Challenge(format!(
                "unsupported auth_type '{}'",
                challenge.auth_type
            )));
        }
        if challenge.algorithm != SHA256_ALGORITHM {
            return Err(RpcError::Challenge(format!(
                "unsupported algorithm '{}'",
                challenge.algorithm
            )));
        }
        if challenge.realm.is_empty() {
            return Err(RpcError::Challenge("realm is empty".into()));
        }

        Ok(challenge)
    }
}

/// Credential attached as the `auth` field of requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCredential {
    pub realm: String,
    pub username: String,
    pub nonce: u64,
    pub cnonce: u64,
    pub response: String,
    pub algorithm: String,
}

impl AuthCredential {
    /// Answer a challenge with a fresh random client nonce.
    pub fn compute(challenge: &AuthChallenge, username: &str, password: &str) -> Self {
        let cnonce = u64::from(rand::random::<u32>());
        Self::compute_with_cnonce(challenge, username, password, cnonce)
    }

    /// Answer a challenge with a caller-chosen client nonce.
    ///
    /// The device side of the exchange uses this to check a received credential.
    pub fn compute_with_cnonce(
        challenge: &AuthChallenge,
        username: &str,
        password: &str,
        cnonce: u64,
    ) -> Self {
        let ha1 = ha1(username, &challenge.realm, password);
        let response = sha256_hex(&format!(
            "{}:{}:{}:{}:auth:{}",
            ha1, challenge.nonce, challenge.nc, cnonce, DUMMY_HA2
        ));

        debug!(realm = %challenge.realm, username = %username, "Computed digest credential");

        Self {
            realm: challenge.realm.clone(),
            username: username.to_string(),
            nonce: challenge.nonce,
            cnonce,
            response,
            algorithm: SHA256_ALGORITHM.to_string(),
        }
    }
}

/// `sha256("<user>:<realm>:<password>")`, also what `Shelly.SetAuth` expects as `ha1`.
pub fn ha1(username: &str, realm: &str, password: &str) -> String {
    sha256_hex(&format!("{}:{}:{}", username, realm, password))
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const REALM: &str = "shellyplus1-a8032ab12345";

    fn challenge() -> AuthChallenge {
        AuthChallenge::parse(&format!(
            r#"{{"auth_type":"digest","nonce":1700000000,"nc":1,"realm":"{}","algorithm":"SHA-256"}}"#,
            REALM
        ))
        .unwrap()
    }

    #[test]
    fn test_dummy_ha2_matches_fixed_string() {
        assert_eq!(sha256_hex("dummy_method:dummy_uri"), DUMMY_HA2);
    }

    #[test]
    fn test_known_credential() {
        let credential = AuthCredential::compute_with_cnonce(&challenge(), "admin", "secret", 42);

        assert_eq!(
            ha1("admin", REALM, "secret"),
            "e7321a38e256c665fb8fe807d3fb54d8db23a8e90186a71b382949a84e3816c4"
        );
        assert_eq!(
            credential.response,
            "ee052c9c2b60340a5308e91a329806056b0c8117844214ad78f52536c8522ee0"
        );
        assert_eq!(credential.realm, REALM);
        assert_eq!(credential.nonce, 1700000000);
        assert_eq!(credential.cnonce, 42);
        assert_eq!(credential.algorithm, "SHA-256");
    }

    #[test]
    fn test_random_cnonce_still_verifies() {
        let challenge = challenge();
        let credential = AuthCredential::compute(&challenge, "admin", "secret");
        let expected =
            AuthCredential::compute_with_cnonce(&challenge, "admin", "secret", credential.cnonce);
        assert_eq!(credential, expected);
    }

    #[test]
    fn test_nc_defaults_to_one() {
        let parsed = AuthChallenge::parse(
            r#"{"auth_type":"digest","nonce":5,"realm":"dev","algorithm":"SHA-256"}"#,
        )
        .unwrap();
        assert_eq!(parsed.nc, 1);
    }

    #[test]
    fn test_malformed_challenge() {
        assert!(matches!(
            AuthChallenge::parse("not json"),
            Err(RpcError::Challenge(_))
        ));
        assert!(matches!(
            AuthChallenge::parse(r#"{"auth_type":"digest","realm":"dev"}"#),
            Err(RpcError::Challenge(_))
        ));
    }

    #[test]
    fn test_unsupported_challenge() {
        let basic = AuthChallenge::parse(
            r#"{"auth_type":"basic","nonce":5,"realm":"dev","algorithm":"SHA-256"}"#,
        );
        assert!(basic.unwrap_err().to_string().contains("auth_type"));

        let md5 = AuthChallenge::parse(
            r#"{"auth_type":"digest","nonce":5,"realm":"dev","algorithm":"MD5"}"#,
        );
        assert!(md5.unwrap_err().to_string().contains("algorithm"));
    }
}
