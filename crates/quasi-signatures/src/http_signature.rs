//! Wire-level pieces of the signature scheme: body digest, HTTP date,
//! the `Signature` header grammar, and signing-string construction.
//!
//! The signing string is the newline-joined covered headers in declared
//! order, with `(request-target)` expanded to the lowercased method and
//! path. Both sides must build it byte-identically.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::{Result, SignatureError};

/// Covered header set required of every signature this server emits or
/// accepts.
pub const COVERED_HEADERS: [&str; 4] = ["(request-target)", "host", "date", "digest"];

/// `Digest` header value for a request body: `SHA-256=<base64>`.
pub fn body_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("SHA-256={}", BASE64.encode(hasher.finalize()))
}

/// RFC 1123 date, always GMT, as HTTP wants it.
pub fn http_date(t: DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn parse_http_date(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SignatureError::MalformedSignature(format!("date header: {}", e)))
}

/// Parsed parameters of a `Signature` header.
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureParams {
    pub key_id: String,
    pub algorithm: String,
    pub headers: Vec<String>,
    pub signature_b64: String,
}

impl SignatureParams {
    /// Parse `keyId="…",algorithm="…",headers="…",signature="…"`.
    pub fn parse(header: &str) -> Result<Self> {
        let mut key_id = None;
        let mut algorithm = None;
        let mut headers = None;
        let mut signature = None;

        for part in split_params(header) {
            let Some((name, value)) = part.split_once('=') else {
                return Err(SignatureError::MalformedSignature(part.to_string()));
            };
            let value = value.trim().trim_matches('"').to_string();
            match name.trim() {
                "keyId" => key_id = Some(value),
                "algorithm" => algorithm = Some(value),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|h| h.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value),
                _ => {}
            }
        }

        Ok(Self {
            key_id: key_id
                .ok_or_else(|| SignatureError::MalformedSignature("keyId missing".into()))?,
            algorithm: algorithm.unwrap_or_else(|| "rsa-sha256".to_string()),
            headers: headers
                .ok_or_else(|| SignatureError::MalformedSignature("headers missing".into()))?,
            signature_b64: signature
                .ok_or_else(|| SignatureError::MalformedSignature("signature missing".into()))?,
        })
    }

    pub fn to_header(&self) -> String {
        format!(
            "keyId=\"{}\",algorithm=\"{}\",headers=\"{}\",signature=\"{}\"",
            self.key_id,
            self.algorithm,
            self.headers.join(" "),
            self.signature_b64
        )
    }

    pub fn decode_signature(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.signature_b64)
            .map_err(|e| SignatureError::MalformedSignature(format!("signature base64: {}", e)))
    }
}

/// Split on commas outside quoted values. Base64 never contains commas,
/// but keyId URLs may contain `=`, so `split(',')` alone is not enough
/// once a value is quoted.
fn split_params(header: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in header.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(header[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < header.len() {
        parts.push(header[start..].trim());
    }
    parts
}

/// Construct the signing string for `covered` headers in declared order.
/// `header_value` resolves a lowercase header name to its received value.
pub fn signing_string<F>(
    method: &str,
    path: &str,
    covered: &[String],
    header_value: F,
) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut lines = Vec::with_capacity(covered.len());
    for name in covered {
        if name == "(request-target)" {
            lines.push(format!(
                "(request-target): {} {}",
                method.to_ascii_lowercase(),
                path
            ));
        } else {
            let value = header_value(name)
                .ok_or_else(|| SignatureError::MissingCoveredHeader(name.clone()))?;
            lines.push(format!("{}: {}", name, value));
        }
    }
    Ok(lines.join("\n"))
}
