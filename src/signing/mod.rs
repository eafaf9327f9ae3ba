//! Request signing for the exchange's authenticated methods.
//!
//! - Ed25519 over the canonical parameter encoding for the WS API session
//! - HMAC-SHA256 over the query string for REST fallback calls

mod ed25519_signer;
mod rest_hmac;

pub use self::ed25519_signer::RequestSigner;
pub use self::rest_hmac::hmac_sha256_hex;

use thiserror::Error;

/// Name of the parameter carrying the signature.
pub const SIGNATURE_KEY: &str = "signature";

/// Errors from key handling and signing. Always fatal to the account's session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SigningError {
    #[error("signing key is empty")]
    Empty,

    #[error("unsupported PEM key: {0}")]
    UnsupportedPem(String),

    #[error("signing key is neither hex nor base64")]
    BadEncoding,

    #[error("signing key has {0} bytes, expected 32 or 64")]
    BadLength(usize),

    #[error("signer rejected key: {0}")]
    Rejected(String),

    #[error("HMAC secret rejected")]
    BadSecret,
}

/// Canonical encoding of a parameter set: sorted by key, `key=value`
/// joined with `&`, signature excluded.
pub fn canonical_payload<K, V>(params: &[(K, V)]) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut pairs: Vec<(&str, &str)> = params
        .iter()
        .map(|(k, v)| (k.as_ref(), v.as_ref()))
        .filter(|(k, _)| *k != SIGNATURE_KEY)
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}
