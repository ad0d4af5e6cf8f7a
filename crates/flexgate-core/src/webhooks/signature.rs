//! HMAC-SHA256 payload signing and verification.
//!
//! Signatures have the form `sha256=<hex>`. The signed bytes are the
//! serialized envelope *without* its `signature` field; the transmitted body
//! carries the same bytes with `,"signature":"..."` spliced in before the
//! closing brace, so a receiver can recover them with [`split_signed_body`].

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Prefix of every signature value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

const SIGNATURE_FIELD: &[u8] = b",\"signature\":\"";

/// Length of a hex-encoded SHA-256 digest.
const DIGEST_HEX_LEN: usize = 64;

fn mac_for(secret: &str) -> HmacSha256 {
    <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length")
}

/// Sign payload bytes with HMAC-SHA256.
pub fn sign(payload: &[u8], secret: &str) -> String {
    let mut mac = mac_for(secret);
    mac.update(payload);
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes()))
}

/// Verify a `sha256=<hex>` signature over payload bytes.
///
/// Malformed signatures (missing prefix, wrong length, non-hex) are rejected,
/// never reported as errors.
pub fn verify(payload: &[u8], signature: &str, secret: &str) -> bool {
    let Some(hex_part) = signature.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    if hex_part.len() != DIGEST_HEX_LEN {
        return false;
    }
    let Ok(provided) = hex::decode(hex_part) else {
        return false;
    };

    let mut mac = mac_for(secret);
    mac.update(payload);
    let expected = mac.finalize().into_bytes();

    // Constant-time comparison to prevent timing attacks
    expected.as_slice().ct_eq(provided.as_slice()).into()
}

/// Splice a signature into serialized envelope bytes.
///
/// `unsigned` must be a serialized JSON object with at least one field.
pub(crate) fn attach_signature(unsigned: &[u8], signature: &str) -> Vec<u8> {
    let body = unsigned.strip_suffix(b"}").unwrap_or(unsigned);
    let mut out = Vec::with_capacity(unsigned.len() + SIGNATURE_FIELD.len() + signature.len() + 2);
    out.extend_from_slice(body);
    out.extend_from_slice(SIGNATURE_FIELD);
    out.extend_from_slice(signature.as_bytes());
    out.extend_from_slice(b"\"}");
    out
}

/// Split a received envelope body into the signed bytes and the signature.
///
/// Returns `None` if the body does not end with a spliced signature field.
pub fn split_signed_body(body: &[u8]) -> Option<(Vec<u8>, String)> {
    let trimmed = body.strip_suffix(b"\"}")?;
    let start = trimmed
        .windows(SIGNATURE_FIELD.len())
        .rposition(|w| w == SIGNATURE_FIELD)?;
    let signature = std::str::from_utf8(&trimmed[start + SIGNATURE_FIELD.len()..]).ok()?;

    let mut signed = trimmed[..start].to_vec();
    signed.push(b'}');
    Some((signed, signature.to_string()))
}

/// Verify a full envelope body as received by a webhook endpoint.
pub fn verify_envelope(body: &[u8], secret: &str) -> bool {
    match split_signed_body(body) {
        Some((signed, signature)) => verify(&signed, &signature, secret),
        None => false,
    }
}
