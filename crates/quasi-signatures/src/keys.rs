use std::path::Path;

use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tracing::info;

use crate::{Result, SignatureError};

const PRIVATE_KEY_FILE: &str = "private_key.pem";
const PUBLIC_KEY_FILE: &str = "public_key.pem";
const KEY_BITS: usize = 2048;

/// The actor's RSA keypair, persisted as PEM in the data directory.
/// Regenerated only by operator action (deleting the files).
pub struct ActorKeys {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    public_pem: String,
}

impl ActorKeys {
    /// Load the keypair from `data_dir`, generating a fresh RSA-2048 pair
    /// on first run.
    pub fn load_or_generate(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| SignatureError::Key(format!("create {}: {}", data_dir.display(), e)))?;

        let private_path = data_dir.join(PRIVATE_KEY_FILE);
        let public_path = data_dir.join(PUBLIC_KEY_FILE);

        if private_path.exists() {
            let pem = std::fs::read_to_string(&private_path)
                .map_err(|e| SignatureError::Key(format!("read private key: {}", e)))?;
            let private_key = RsaPrivateKey::from_pkcs8_pem(&pem)
                .map_err(|e| SignatureError::Key(format!("parse private key: {}", e)))?;
            let public_key = RsaPublicKey::from(&private_key);
            let public_pem = public_key
                .to_public_key_pem(LineEnding::LF)
                .map_err(|e| SignatureError::Key(e.to_string()))?;
            return Ok(Self {
                private_key,
                public_key,
                public_pem,
            });
        }

        info!(path = %private_path.display(), "Generating actor RSA-{} keypair", KEY_BITS);
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|e| SignatureError::Key(format!("keygen: {}", e)))?;
        let public_key = RsaPublicKey::from(&private_key);

        let private_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| SignatureError::Key(e.to_string()))?;
        let public_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| SignatureError::Key(e.to_string()))?;

        std::fs::write(&private_path, private_pem.as_bytes())
            .map_err(|e| SignatureError::Key(format!("write private key: {}", e)))?;
        std::fs::write(&public_path, public_pem.as_bytes())
            .map_err(|e| SignatureError::Key(format!("write public key: {}", e)))?;

        Ok(Self {
            private_key,
            public_key,
            public_pem,
        })
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// SPKI PEM, the form published in the actor document.
    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }
}

/// Parse a published public key. Accepts SPKI (`BEGIN PUBLIC KEY`) and
/// the older PKCS#1 form (`BEGIN RSA PUBLIC KEY`) some instances emit.
pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| {
            use rsa::pkcs1::DecodeRsaPublicKey;
            RsaPublicKey::from_pkcs1_pem(pem)
        })
        .map_err(|e| SignatureError::Key(format!("parse public key: {}", e)))
}
