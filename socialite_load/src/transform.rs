//! Content transforms applied before publication.
//!
//! When enabled, every content item passes through a [`Transform`] after it is
//! synthesized and before it is published. The default is [`Identity`]. The
//! [`LocalKey`] transform encrypts the body and selected fields under a local
//! master key, reproducing the payload growth and per-item CPU cost of
//! client-side field encryption. It is not a vetted cipher and must not be
//! used to protect real data.

use std::fmt;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use socialite_payload::{Content, Fields, Value};

/// Length of the local master key in bytes
pub const KEY_LEN: usize = 96;
const NONCE_LEN: usize = 16;
const BLOCK_LEN: usize = 32;
const TAG_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Master key used when none is configured. Shared between runs so that data
/// loaded by one run can be read back by another.
const DEFAULT_KEY: [u8; KEY_LEN] = [
    0x77, 0x1f, 0x2d, 0x7d, 0x76, 0x74, 0x39, 0x08, 0x50, 0x0b, 0x61, 0x14, 0x3a, 0x07, 0x24, 0x7c,
    0x37, 0x7b, 0x60, 0x0f, 0x09, 0x11, 0x23, 0x65, 0x35, 0x01, 0x3a, 0x76, 0x5f, 0x3e, 0x4b, 0x6a,
    0x65, 0x77, 0x21, 0x6d, 0x34, 0x13, 0x24, 0x1b, 0x47, 0x73, 0x21, 0x5d, 0x56, 0x6a, 0x38, 0x30,
    0x6d, 0x5e, 0x79, 0x1b, 0x25, 0x4d, 0x2a, 0x00, 0x7c, 0x0b, 0x65, 0x1d, 0x70, 0x22, 0x22, 0x61,
    0x2e, 0x6a, 0x52, 0x46, 0x6a, 0x43, 0x43, 0x23, 0x58, 0x21, 0x78, 0x59, 0x64, 0x35, 0x5c, 0x23,
    0x00, 0x27, 0x43, 0x7d, 0x50, 0x13, 0x65, 0x3c, 0x54, 0x1e, 0x74, 0x3c, 0x3b, 0x57, 0x21, 0x1a,
];

/// Errors produced by transforms
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configured key is not valid base64.
    #[error("Transform key is not valid base64: {0}")]
    KeyEncoding(#[from] base64::DecodeError),
    /// The configured key has the wrong length.
    #[error("Transform key must be {KEY_LEN} bytes, got {0}")]
    KeyLength(usize),
    /// A value was already encrypted.
    #[error("Value {field} is already encrypted")]
    AlreadyEncrypted {
        /// Name of the offending value
        field: String,
    },
}

/// Configuration for [`LocalKey`]
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Default)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Base64 encoded master key of [`KEY_LEN`] bytes. A built-in key is used
    /// when absent.
    #[serde(default)]
    pub key: Option<String>,
    /// Names of the structured fields to encrypt. Empty encrypts every field.
    #[serde(default)]
    pub encrypt_fields: Vec<String>,
}

/// A rewrite of content applied before publication.
#[async_trait]
pub trait Transform: Send + Sync + fmt::Debug {
    /// Transform `content`, failing the enclosing work item on error.
    async fn transform(&self, content: Content) -> Result<Content, Error>;
}

/// Passes content through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Identity;

#[async_trait]
impl Transform for Identity {
    async fn transform(&self, content: Content) -> Result<Content, Error> {
        Ok(content)
    }
}

/// Encrypts content under a local master key.
///
/// Sealed values are laid out as `nonce || ciphertext || tag`. The keystream is
/// `SHA-256(key || nonce || counter)` over 32 byte blocks and the tag is
/// `HMAC-SHA-256(key, nonce || ciphertext)`.
#[derive(Clone)]
pub struct LocalKey {
    key: [u8; KEY_LEN],
    mac: HmacSha256,
    fields: Vec<String>,
}

impl fmt::Debug for LocalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKey")
            .field("key", &"<redacted>")
            .field("fields", &self.fields)
            .finish()
    }
}

impl LocalKey {
    /// Create a new [`LocalKey`] transform
    ///
    /// # Errors
    ///
    /// Function will error if a configured key is not base64 or is not
    /// [`KEY_LEN`] bytes long.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let key = match &config.key {
            None => DEFAULT_KEY,
            Some(encoded) => {
                let decoded = STANDARD.decode(encoded.trim())?;
                <[u8; KEY_LEN]>::try_from(decoded.as_slice())
                    .map_err(|_| Error::KeyLength(decoded.len()))?
            }
        };
        let mac = HmacSha256::new_from_slice(&key).map_err(|_| Error::KeyLength(key.len()))?;
        Ok(Self {
            key,
            mac,
            fields: config.encrypt_fields.clone(),
        })
    }

    fn selected(&self, name: &str) -> bool {
        self.fields.is_empty() || self.fields.iter().any(|field| field == name)
    }

    fn seal(&self, plaintext: &[u8]) -> Bytes {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce);

        let mut sealed = BytesMut::with_capacity(NONCE_LEN + plaintext.len() + TAG_LEN);
        sealed.put_slice(&nonce);
        for (counter, chunk) in (0u64..).zip(plaintext.chunks(BLOCK_LEN)) {
            let block = Sha256::new()
                .chain_update(self.key)
                .chain_update(nonce)
                .chain_update(counter.to_be_bytes())
                .finalize();
            sealed.extend(chunk.iter().zip(block.iter()).map(|(p, k)| p ^ k));
        }
        let mut mac = self.mac.clone();
        mac.update(&sealed);
        sealed.put_slice(&mac.finalize().into_bytes());
        sealed.freeze()
    }

    fn encrypt(&self, name: &str, value: Value) -> Result<Value, Error> {
        match value {
            Value::Text(text) => Ok(Value::Encrypted(self.seal(text.as_bytes()))),
            Value::Encrypted(_) => Err(Error::AlreadyEncrypted {
                field: name.to_string(),
            }),
        }
    }
}

#[async_trait]
impl Transform for LocalKey {
    async fn transform(&self, content: Content) -> Result<Content, Error> {
        let (author, body, fields) = content.into_parts();
        let body = self.encrypt("body", body)?;
        let fields = fields
            .map(|fields| {
                fields
                    .into_iter()
                    .map(|(name, value)| {
                        let value = if self.selected(&name) {
                            self.encrypt(&name, value)?
                        } else {
                            value
                        };
                        Ok((name, value))
                    })
                    .collect::<Result<Fields, Error>>()
            })
            .transpose()?;
        Ok(Content::new(author, body, fields))
    }
}
