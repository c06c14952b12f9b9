//! Stateless bearer-token issuance and verification.
//!
//! Tokens are composed of:
//! - 8 bytes: issuance time (Unix millis, big-endian)
//! - 8 bytes: expiry time (Unix millis, big-endian)
//! - 32 bytes: HMAC-SHA256 signature over the two timestamps
//!
//! Total: 48 bytes, hex-encoded for transport. Nothing is persisted
//! server-side; a token is valid until its embedded expiry, and rotating
//! the signing secret invalidates every outstanding token.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};

type HmacSha256 = Hmac<Sha256>;

/// Lifetime of an issued token.
pub const TOKEN_TTL: Duration = Duration::hours(24);

const TIMESTAMP_LEN: usize = 8;
const SIGNED_PREFIX_LEN: usize = 2 * TIMESTAMP_LEN;
const SIGNATURE_LEN: usize = 32;
const TOKEN_RAW_LEN: usize = SIGNED_PREFIX_LEN + SIGNATURE_LEN;
const SECRET_LEN: usize = 32;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AuthError {
    #[error("token is malformed")]
    Malformed,
    #[error("token has expired")]
    Expired,
    #[error("token signature does not validate")]
    BadSignature,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("token secret cannot seed the MAC")]
pub struct InvalidSecret;

/// Decoded claims of a verified token.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Claims {
    pub issued_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

/// Issues and verifies signed, time-limited bearer tokens.
///
/// The service holds only the process-wide signing secret; it keeps no
/// per-token state, so issuance and verification are pure CPU work.
#[derive(Clone)]
pub struct TokenService {
    key: HmacSha256,
}

impl TokenService {
    /// Builds a token service from an externally supplied secret.
    ///
    /// # Errors
    /// Returns [`InvalidSecret`] when the secret cannot seed HMAC-SHA256.
    pub fn new(secret: &[u8]) -> Result<Self, InvalidSecret> {
        let key = HmacSha256::new_from_slice(secret).map_err(|_| InvalidSecret)?;
        Ok(Self { key })
    }

    /// Builds a token service with a freshly generated random secret.
    ///
    /// Tokens signed by a previous process cannot be verified afterwards.
    #[must_use]
    pub fn generate() -> Self {
        let mut secret = [0_u8; SECRET_LEN];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        match Self::new(&secret) {
            Ok(service) => service,
            Err(InvalidSecret) => unreachable!("HMAC-SHA256 accepts a 32-byte key"),
        }
    }

    /// Issues a token expiring [`TOKEN_TTL`] from now.
    #[must_use]
    pub fn issue(&self) -> String {
        self.issue_from(OffsetDateTime::now_utc())
    }

    fn issue_from(&self, issued_at: OffsetDateTime) -> String {
        let expires_at = issued_at + TOKEN_TTL;

        let mut raw = Vec::with_capacity(TOKEN_RAW_LEN);
        raw.extend_from_slice(&unix_millis(issued_at).to_be_bytes());
        raw.extend_from_slice(&unix_millis(expires_at).to_be_bytes());

        let mut mac = self.key.clone();
        mac.update(&raw);
        raw.extend_from_slice(&mac.finalize().into_bytes());

        hex::encode(raw)
    }

    /// Verifies a transport-encoded token and decodes its claims.
    ///
    /// The signature is checked before the expiry so that a tampered token
    /// is never reported as merely expired.
    ///
    /// # Errors
    /// Returns [`AuthError::Malformed`] when the token cannot be decoded,
    /// [`AuthError::BadSignature`] when the MAC does not validate, and
    /// [`AuthError::Expired`] when the current time exceeds the embedded
    /// expiry.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let raw = hex::decode(token).map_err(|_| AuthError::Malformed)?;
        if raw.len() != TOKEN_RAW_LEN {
            return Err(AuthError::Malformed);
        }

        let mut mac = self.key.clone();
        mac.update(&raw[..SIGNED_PREFIX_LEN]);
        mac.verify_slice(&raw[SIGNED_PREFIX_LEN..]).map_err(|_| AuthError::BadSignature)?;

        let issued_at = timestamp_from_millis(&raw[..TIMESTAMP_LEN])?;
        let expires_at = timestamp_from_millis(&raw[TIMESTAMP_LEN..SIGNED_PREFIX_LEN])?;

        if OffsetDateTime::now_utc() > expires_at {
            return Err(AuthError::Expired);
        }

        Ok(Claims { issued_at, expires_at })
    }
}

/// Constant-time comparison of a submitted password against the configured
/// credential. Both sides are digested first so the comparison length never
/// depends on the secret.
#[must_use]
pub fn password_matches(submitted: &str, configured: &str) -> bool {
    let submitted = Sha256::digest(submitted.as_bytes());
    let configured = Sha256::digest(configured.as_bytes());

    let mut diff = 0_u8;
    for (lhs, rhs) in submitted.iter().zip(configured.iter()) {
        diff |= lhs ^ rhs;
    }
    diff == 0
}

fn unix_millis(value: OffsetDateTime) -> u64 {
    (value.unix_timestamp_nanos() / 1_000_000) as u64
}

fn timestamp_from_millis(raw: &[u8]) -> Result<OffsetDateTime, AuthError> {
    let millis: [u8; TIMESTAMP_LEN] = raw.try_into().map_err(|_| AuthError::Malformed)?;
    let nanos = i128::from(u64::from_be_bytes(millis)) * 1_000_000;
    OffsetDateTime::from_unix_timestamp_nanos(nanos).map_err(|_| AuthError::Malformed)
}
