//! HTTP Message Signatures for federated delivery.
//!
//! Covers both directions of RFC 9421-style signing over the covered set
//! `(request-target) host date digest`: outbound requests are signed with
//! the actor's RSA key, inbound requests are verified against the sender's
//! published key, fetched through a TTL cache.

pub mod engine;
pub mod http_signature;
pub mod key_cache;
pub mod keys;

pub use engine::{RsaBackend, SignatureBackend, SignatureEngine, SignedHeaders, StubBackend};
pub use http_signature::{body_digest, http_date, parse_http_date, SignatureParams};
pub use key_cache::{KeyCache, RemoteActor};
pub use keys::ActorKeys;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("Signature header missing")]
    MissingSignature,

    #[error("Malformed signature header: {0}")]
    MalformedSignature(String),

    #[error("Required covered header missing: {0}")]
    MissingCoveredHeader(String),

    #[error("Date header outside allowed skew")]
    DateSkew,

    #[error("Digest does not match request body")]
    DigestMismatch,

    #[error("Key fetch failed: {0}")]
    KeyFetch(String),

    #[error("Signature verification failed")]
    InvalidSignature,

    #[error("Stub backend refuses all signatures")]
    StubRefused,

    #[error("Key error: {0}")]
    Key(String),

    #[error("Signing failed: {0}")]
    Signing(String),
}

pub type Result<T> = std::result::Result<T, SignatureError>;
