//! HMAC-signed, time-bound file capability tokens.
//!
//! A token binds file, bucket, operation, expiry, and (optionally) a user
//! into one base64url string authenticated by HMAC-SHA256 over the tuple.
//! Tokens are stateless: there is no revocation list, and rotating the
//! secret invalidates everything outstanding.

use crate::error::{Error, Result};
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use std::time::Duration;
use subtle::ConstantTimeEq;

/// Default token lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

/// Ceiling on requested lifetimes; there are no indefinite tokens.
const MAX_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// What a signed URL authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Download,
    View,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Download => "download",
            Operation::View => "view",
        }
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "download" => Ok(Operation::Download),
            "view" => Ok(Operation::View),
            other => Err(format!("unknown operation: {}", other)),
        }
    }
}

/// Fields recovered from a valid token.
#[derive(Debug, Clone, PartialEq)]
pub struct Claims {
    pub file_id: String,
    pub bucket: String,
    pub operation: Operation,
    pub expires_at: DateTime<Utc>,
    pub user_id: Option<String>,
}

pub struct SignedUrlService {
    secret: String,
}

impl SignedUrlService {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Mint a token for `(file_id, bucket, operation)` lasting `ttl`
    /// (clamped; `None` means the 15-minute default).
    pub fn generate(
        &self,
        file_id: &str,
        bucket: &str,
        operation: Operation,
        ttl: Option<Duration>,
        user_id: Option<&str>,
    ) -> (String, DateTime<Utc>) {
        let ttl = ttl.unwrap_or(DEFAULT_TTL).min(MAX_TTL);
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).expect("ttl is bounded");
        let expires = expires_at.to_rfc3339_opts(SecondsFormat::Secs, true);
        let user = user_id.unwrap_or("");

        let signed_part = format!(
            "{}|{}|{}|{}|{}",
            file_id,
            bucket,
            operation.as_str(),
            expires,
            user
        );
        let mac = self.mac(&signed_part);
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(format!("{}|{}", signed_part, mac));
        (token, expires_at)
    }

    /// Validate a token against the file and bucket it is being used on.
    pub fn validate(&self, token: &str, file_id: &str, bucket: &str) -> Result<Claims> {
        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| Error::InvalidSignature("malformed token".to_string()))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| Error::InvalidSignature("malformed token".to_string()))?;

        let parts: Vec<&str> = decoded.split('|').collect();
        let [token_file, token_bucket, operation, expires, user, provided_mac] = parts[..] else {
            return Err(Error::InvalidSignature("malformed token".to_string()));
        };

        // Authenticate before trusting any field
        let signed_part = format!(
            "{}|{}|{}|{}|{}",
            token_file, token_bucket, operation, expires, user
        );
        let expected_mac = self.mac(&signed_part);
        let provided_hash = Sha256::digest(provided_mac.as_bytes());
        let expected_hash = Sha256::digest(expected_mac.as_bytes());
        if !bool::from(provided_hash.ct_eq(&expected_hash)) {
            return Err(Error::InvalidSignature("signature mismatch".to_string()));
        }

        let expires_at = DateTime::parse_from_rfc3339(expires)
            .map_err(|_| Error::InvalidSignature("malformed expiry".to_string()))?
            .with_timezone(&Utc);
        if Utc::now() >= expires_at {
            return Err(Error::ExpiredToken);
        }

        if token_file != file_id || token_bucket != bucket {
            return Err(Error::AccessDenied(
                "token does not cover this file".to_string(),
            ));
        }

        let operation = operation
            .parse::<Operation>()
            .map_err(Error::InvalidSignature)?;

        Ok(Claims {
            file_id: token_file.to_string(),
            bucket: token_bucket.to_string(),
            operation,
            expires_at,
            user_id: (!user.is_empty()).then(|| user.to_string()),
        })
    }

    fn mac(&self, signed_part: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(signed_part.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}
