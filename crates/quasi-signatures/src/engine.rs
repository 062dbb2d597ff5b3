use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::RsaPrivateKey;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::http_signature::{
    body_digest, http_date, parse_http_date, signing_string, SignatureParams, COVERED_HEADERS,
};
use crate::key_cache::KeyCache;
use crate::keys::public_key_from_pem;
use crate::{Result, SignatureError};

const MAX_DATE_SKEW_SECS: i64 = 5 * 60;

/// Raw sign/verify capability. Selected at construction; the stub variant
/// exists for hosts without usable key material and never verifies
/// anything.
pub trait SignatureBackend: Send + Sync {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;
    fn verify(&self, public_key_pem: &str, message: &[u8], signature: &[u8]) -> Result<()>;
    fn is_stub(&self) -> bool {
        false
    }
}

/// RSA-SHA-256 with PKCS#1 v1.5 padding.
pub struct RsaBackend {
    signing_key: SigningKey<Sha256>,
}

impl RsaBackend {
    pub fn new(private_key: RsaPrivateKey) -> Self {
        Self {
            signing_key: SigningKey::new(private_key),
        }
    }
}

impl SignatureBackend for RsaBackend {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        self.signing_key
            .try_sign(message)
            .map(|sig| sig.to_vec())
            .map_err(|e| SignatureError::Signing(e.to_string()))
    }

    fn verify(&self, public_key_pem: &str, message: &[u8], signature: &[u8]) -> Result<()> {
        let public_key = public_key_from_pem(public_key_pem)?;
        let verifying_key = VerifyingKey::<Sha256>::new(public_key);
        let signature =
            Signature::try_from(signature).map_err(|_| SignatureError::InvalidSignature)?;
        verifying_key
            .verify(message, &signature)
            .map_err(|_| SignatureError::InvalidSignature)
    }
}

/// Placeholder backend: emits a fixed, syntactically valid signature and
/// refuses every verification. Nothing signed by it is ever accepted.
pub struct StubBackend;

impl SignatureBackend for StubBackend {
    fn sign(&self, _message: &[u8]) -> Result<Vec<u8>> {
        Ok(b"stub-signature-crypto-unavailable".to_vec())
    }

    fn verify(&self, _pem: &str, _message: &[u8], _signature: &[u8]) -> Result<()> {
        Err(SignatureError::StubRefused)
    }

    fn is_stub(&self) -> bool {
        true
    }
}

/// Headers to attach to an outbound signed request.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub date: String,
    pub digest: String,
    pub signature: String,
}

/// Sign and verify whole requests over the fixed covered header set.
pub struct SignatureEngine {
    backend: Arc<dyn SignatureBackend>,
    key_cache: KeyCache,
    key_id: String,
}

impl SignatureEngine {
    pub fn new(backend: Arc<dyn SignatureBackend>, key_cache: KeyCache, key_id: String) -> Self {
        Self {
            backend,
            key_cache,
            key_id,
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn is_stub(&self) -> bool {
        self.backend.is_stub()
    }

    pub fn key_cache(&self) -> &KeyCache {
        &self.key_cache
    }

    /// Produce `Date`, `Digest` and `Signature` headers for an outbound
    /// request.
    pub fn sign_request(
        &self,
        method: &str,
        path: &str,
        host: &str,
        body: &[u8],
    ) -> Result<SignedHeaders> {
        let date = http_date(Utc::now());
        let digest = body_digest(body);

        let covered: Vec<String> = COVERED_HEADERS.iter().map(|s| s.to_string()).collect();
        let to_sign = signing_string(method, path, &covered, |name| match name {
            "host" => Some(host.to_string()),
            "date" => Some(date.clone()),
            "digest" => Some(digest.clone()),
            _ => None,
        })?;

        let raw = self.backend.sign(to_sign.as_bytes())?;
        let params = SignatureParams {
            key_id: self.key_id.clone(),
            algorithm: "rsa-sha256".to_string(),
            headers: covered,
            signature_b64: base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                raw,
            ),
        };

        Ok(SignedHeaders {
            date,
            digest,
            signature: params.to_header(),
        })
    }

    /// Verify an inbound request. `headers` maps lowercase header names to
    /// values. Returns the signer's `keyId` on success. On a failed key
    /// verification the cached key is evicted and no retry happens within
    /// this request.
    pub async fn verify_request(
        &self,
        method: &str,
        path: &str,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<String> {
        let header = headers
            .get("signature")
            .ok_or(SignatureError::MissingSignature)?;
        let params = SignatureParams::parse(header)?;

        for required in COVERED_HEADERS {
            if !params.headers.iter().any(|h| h == required) {
                return Err(SignatureError::MissingCoveredHeader(required.to_string()));
            }
        }

        let date_value = headers
            .get("date")
            .ok_or_else(|| SignatureError::MissingCoveredHeader("date".to_string()))?;
        let date = parse_http_date(date_value)?;
        let skew = (Utc::now() - date).num_seconds().abs();
        if skew > MAX_DATE_SKEW_SECS {
            warn!(skew_secs = skew, "Rejecting request with stale Date header");
            return Err(SignatureError::DateSkew);
        }

        let digest_value = headers
            .get("digest")
            .ok_or_else(|| SignatureError::MissingCoveredHeader("digest".to_string()))?;
        if digest_value != &body_digest(body) {
            return Err(SignatureError::DigestMismatch);
        }

        let to_verify = signing_string(method, path, &params.headers, |name| {
            headers.get(name).cloned()
        })?;

        let pem = self.key_cache.fetch(&params.key_id).await?;
        let signature = params.decode_signature()?;

        match self
            .backend
            .verify(&pem, to_verify.as_bytes(), &signature)
        {
            Ok(()) => {
                debug!(key_id = %params.key_id, "Inbound signature verified");
                Ok(params.key_id)
            }
            Err(e) => {
                // The key may have rotated; drop it so the next request
                // re-fetches. Never retried within this request.
                self.key_cache.evict(&params.key_id).await;
                Err(e)
            }
        }
    }

}
