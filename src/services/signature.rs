use sha2::{Digest, Sha256};

/// Fields covered by the integrity signature of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignaturePayload<'a> {
    pub reference: &'a str,
    pub amount_in_cents: i64,
    pub currency: &'a str,
    /// ISO-8601 expiration, only for payment links that expire
    pub expiration: Option<&'a str>,
}

impl<'a> SignaturePayload<'a> {
    pub fn new(reference: &'a str, amount_in_cents: i64, currency: &'a str) -> Self {
        Self {
            reference,
            amount_in_cents,
            currency,
            expiration: None,
        }
    }
}

fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Lowercase hex SHA-256 of `reference + amount + currency [+ expiration] + secret`.
pub fn integrity_signature(payload: &SignaturePayload<'_>, secret: &str) -> String {
    let amount = payload.amount_in_cents.to_string();
    match payload.expiration {
        Some(expiration) => sha256_hex(&[
            payload.reference,
            amount.as_str(),
            payload.currency,
            expiration,
            secret,
        ]),
        None => sha256_hex(&[payload.reference, amount.as_str(), payload.currency, secret]),
    }
}

pub fn verify_integrity_signature(
    candidate: &str,
    payload: &SignaturePayload<'_>,
    secret: &str,
) -> bool {
    constant_time_eq(&integrity_signature(payload, secret), candidate)
}

/// Checksum of a gateway event: SHA-256 over the listed property values in
/// order, then the event timestamp, then the events secret.
pub fn event_checksum(values: &[String], timestamp: i64, secret: &str) -> String {
    let timestamp = timestamp.to_string();
    let mut parts: Vec<&str> = values.iter().map(String::as_str).collect();
    parts.push(timestamp.as_str());
    parts.push(secret);
    sha256_hex(&parts)
}

/// Gateways are inconsistent about checksum case, so comparison ignores it.
pub fn verify_event_checksum(
    candidate: &str,
    values: &[String],
    timestamp: i64,
    secret: &str,
) -> bool {
    constant_time_eq(
        &event_checksum(values, timestamp, secret),
        &candidate.to_ascii_lowercase(),
    )
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}
