//! # Decorator Pipeline
//!
//! Symmetric transform applied to payload bytes on their way into and out of
//! every blob store: optional zstd compression followed by optional
//! AES-256-GCM encryption. `undecorate(decorate(x)) == x` for all byte
//! strings.
//!
//! Object identity is computed over the *decorated* bytes, so changing the
//! pipeline configuration changes every object's identity — a re-decorated
//! corpus is a new repository. Empty payloads bypass the pipeline entirely,
//! which keeps the empty-object id independent of the configuration.
//!
//! ## Encrypted wire format
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────┐
//! │  Nonce (12B)  │  Ciphertext + Auth Tag (16B suffix)  │
//! └──────────────┴──────────────────────────────────────┘
//! ```

use crate::error::{DecoratorError, Result};
use crate::hasher::ObjectId;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use std::path::Path;

/// Fixed nonce length for AES-256-GCM (96 bits).
const NONCE_LEN: usize = 12;

/// Derives a 256-bit encryption key from a password using BLAKE3 keyed
/// hashing. The context string gives domain separation — the same password
/// produces different keys in different applications.
fn derive_key(password: &str) -> [u8; 32] {
    blake3::derive_key("cumulus v1 object key", password.as_bytes())
}

/// A configured decorate/undecorate chain shared by all stores of a
/// repository.
#[derive(Clone, Debug)]
pub struct Decorator {
    compress: bool,
    zstd_level: i32,
    key: Option<[u8; 32]>,
}

impl Decorator {
    pub fn new(compress: bool, zstd_level: i32, password: Option<&str>) -> Self {
        Decorator {
            compress,
            zstd_level,
            key: password.map(derive_key),
        }
    }

    /// An identity pipeline: no compression, no encryption.
    #[allow(dead_code)]
    pub fn plain() -> Self {
        Decorator::new(false, 0, None)
    }

    /// Transforms payload bytes for storage: compress, then seal under a
    /// fresh random nonce, emitted as nonce ‖ ciphertext ‖ tag.
    pub fn decorate(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let mut payload = if self.compress {
            zstd::encode_all(data, self.zstd_level).map_err(DecoratorError::Compress)?
        } else {
            data.to_vec()
        };
        if let Some(key) = &self.key {
            let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| DecoratorError::MissingKey)?;
            let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
            let sealed = cipher
                .encrypt(&nonce, payload.as_slice())
                .map_err(|_| DecoratorError::Decrypt)?;
            payload = nonce.into_iter().chain(sealed).collect();
        }
        Ok(payload)
    }

    /// Inverts [`Decorator::decorate`]: peel off the nonce prefix, open and
    /// authenticate the remainder, then decompress.
    pub fn undecorate(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let mut payload = match &self.key {
            Some(key) => {
                if data.len() < NONCE_LEN {
                    return Err(DecoratorError::Decrypt.into());
                }
                let cipher =
                    Aes256Gcm::new_from_slice(key).map_err(|_| DecoratorError::MissingKey)?;
                cipher
                    .decrypt(Nonce::from_slice(&data[..NONCE_LEN]), &data[NONCE_LEN..])
                    .map_err(|_| DecoratorError::Decrypt)?
            }
            None => data.to_vec(),
        };
        if self.compress {
            payload = zstd::decode_all(payload.as_slice()).map_err(|_| DecoratorError::Decompress)?;
        }
        Ok(payload)
    }

    /// Decorates a payload and computes its content id in one step.
    ///
    /// Returns `(id, decorated_bytes)`. The id is the truncated digest of the
    /// decorated bytes; for the empty payload this is [`ObjectId::empty`]
    /// regardless of configuration.
    pub fn object_id(&self, data: &[u8]) -> Result<(ObjectId, Vec<u8>)> {
        let decorated = self.decorate(data)?;
        Ok((ObjectId::of(&decorated), decorated))
    }

    /// Reads a file, decorates its contents, and writes the result to `dst`.
    /// Returns the id of the decorated bytes.
    pub fn decorate_file(&self, src: &Path, dst: &Path) -> Result<ObjectId> {
        let data = std::fs::read(src)?;
        let (id, decorated) = self.object_id(&data)?;
        std::fs::write(dst, decorated)?;
        Ok(id)
    }

    /// Reads a decorated file and writes the restored payload to `dst`.
    pub fn undecorate_file(&self, src: &Path, dst: &Path) -> Result<()> {
        let data = std::fs::read(src)?;
        let payload = self.undecorate(&data)?;
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dst, payload)?;
        Ok(())
    }
}
