//! Signed access-URL queries.
//!
//! Both provider variants authorize buffer access with the same canonical
//! query string: subject id, action bits, resource type, not-before,
//! not-after, and key generation, signed with HMAC-SHA256. The cloud variant
//! signs against an account's current delegation key; the local variant
//! signs with the control plane's private key, and the data plane verifies
//! against both the primary and the secondary key so keys can rotate without
//! breaking in-flight URLs.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Which kind of resource a signature grants access to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Container,
    Blob,
}

impl ResourceType {
    fn code(&self) -> &'static str {
        match self {
            ResourceType::Container => "c",
            ResourceType::Blob => "b",
        }
    }

    fn parse(code: &str) -> Option<Self> {
        match code {
            "c" => Some(ResourceType::Container),
            "b" => Some(ResourceType::Blob),
            _ => None,
        }
    }
}

/// Key generation a signature was produced with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyGeneration {
    Primary,
    Secondary,
}

impl KeyGeneration {
    fn code(&self) -> &'static str {
        match self {
            KeyGeneration::Primary => "1",
            KeyGeneration::Secondary => "2",
        }
    }
}

/// The claims carried by a signed query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessClaims {
    /// Subject id: the buffer (container) the grant is scoped to.
    pub subject: String,
    /// Whether the grant includes create/write.
    pub writeable: bool,
    pub resource: ResourceType,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub generation: KeyGeneration,
}

impl AccessClaims {
    fn action_bits(&self) -> &'static str {
        if self.writeable { "rw" } else { "r" }
    }

    /// The canonicalized string the signature covers.
    fn canonical(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            self.subject,
            self.action_bits(),
            self.resource.code(),
            self.not_before.timestamp(),
            self.not_after.timestamp(),
            self.generation.code(),
        )
    }
}

fn mac(key: &[u8], canonical: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(canonical.as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

/// Produce the signed query string for a set of claims.
pub fn sign_query(claims: &AccessClaims, key: &[u8]) -> String {
    let signature = mac(key, &claims.canonical());
    format!(
        "sub={}&act={}&res={}&nbf={}&exp={}&kg={}&sig={}",
        claims.subject,
        claims.action_bits(),
        claims.resource.code(),
        claims.not_before.timestamp(),
        claims.not_after.timestamp(),
        claims.generation.code(),
        signature,
    )
}

/// Verify a signed query string against the primary key and, if present,
/// the secondary key. Returns the claims on success.
pub fn verify_query(
    query: &str,
    primary: &[u8],
    secondary: Option<&[u8]>,
    now: DateTime<Utc>,
) -> Result<AccessClaims> {
    let mut fields: std::collections::BTreeMap<&str, &str> = std::collections::BTreeMap::new();
    for pair in query.trim_start_matches('?').split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            fields.insert(k, v);
        }
    }

    let invalid = || Error::validation("malformed access signature");
    let subject = fields.get("sub").ok_or_else(invalid)?.to_string();
    let writeable = match *fields.get("act").ok_or_else(invalid)? {
        "r" => false,
        "rw" => true,
        _ => return Err(invalid()),
    };
    let resource = ResourceType::parse(fields.get("res").ok_or_else(invalid)?).ok_or_else(invalid)?;
    let not_before = parse_timestamp(fields.get("nbf").ok_or_else(invalid)?)?;
    let not_after = parse_timestamp(fields.get("exp").ok_or_else(invalid)?)?;
    let generation = match *fields.get("kg").ok_or_else(invalid)? {
        "1" => KeyGeneration::Primary,
        "2" => KeyGeneration::Secondary,
        _ => return Err(invalid()),
    };
    let signature = *fields.get("sig").ok_or_else(invalid)?;

    let claims = AccessClaims {
        subject,
        writeable,
        resource,
        not_before,
        not_after,
        generation,
    };

    let canonical = claims.canonical();
    let primary_matches = constant_time_eq(&mac(primary, &canonical), signature);
    let secondary_matches = secondary
        .map(|key| constant_time_eq(&mac(key, &canonical), signature))
        .unwrap_or(false);
    if !primary_matches && !secondary_matches {
        return Err(Error::validation("access signature mismatch"));
    }

    if now < claims.not_before {
        return Err(Error::validation("access signature is not yet valid"));
    }
    if now > claims.not_after {
        return Err(Error::validation("access signature has expired"));
    }

    Ok(claims)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let secs: i64 = raw
        .parse()
        .map_err(|_| Error::validation("malformed access signature"))?;
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| Error::validation("malformed access signature"))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
